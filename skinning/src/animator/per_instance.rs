//! Upload strategies for the per-instance buffer.

use std::ops::Range;
use std::sync::Arc;

use avatar_graphics::{Buffer, GraphicsDevice};

use crate::config::PerInstanceUpdates;
use crate::error::SkinningError;

/// Upload counters of one [`PerInstanceBufferUpdater`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PerInstanceUploadStats {
    pub uploads: u64,
    pub bytes: u64,
}

/// Keeps a per-instance GPU buffer in sync with its CPU copy.
///
/// With [`PerInstanceUpdates::ShadowBuffer`] writes only touch the CPU copy
/// and [`flush`](Self::flush) uploads the touched span in one call. With
/// [`PerInstanceUpdates::PartialWrites`] every write goes straight to the GPU
/// and `flush` has nothing to do.
pub struct PerInstanceBufferUpdater {
    device: Arc<GraphicsDevice>,
    buffer: Arc<Buffer>,
    strategy: PerInstanceUpdates,
    shadow: Vec<u8>,
    dirty: Option<Range<usize>>,
    stats: PerInstanceUploadStats,
}

impl PerInstanceBufferUpdater {
    /// `initial` is uploaded immediately and becomes the CPU copy. `Auto` is
    /// resolved against the device backend.
    pub fn new(
        device: Arc<GraphicsDevice>,
        buffer: Arc<Buffer>,
        strategy: PerInstanceUpdates,
        initial: Vec<u8>,
    ) -> Result<Self, SkinningError> {
        if initial.len() as u64 != buffer.size() {
            return Err(SkinningError::InvalidParameter(format!(
                "per-instance data of {} bytes for a buffer of {}",
                initial.len(),
                buffer.size()
            )));
        }
        let strategy = strategy.resolve(device.backend_type());
        device.write_buffer(&buffer, 0, &initial)?;
        Ok(Self {
            stats: PerInstanceUploadStats {
                uploads: 1,
                bytes: initial.len() as u64,
            },
            device,
            buffer,
            strategy,
            shadow: initial,
            dirty: None,
        })
    }

    pub fn strategy(&self) -> PerInstanceUpdates {
        self.strategy
    }

    pub fn buffer(&self) -> &Arc<Buffer> {
        &self.buffer
    }

    /// The CPU copy, including writes not yet flushed.
    pub fn shadow(&self) -> &[u8] {
        &self.shadow
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.is_some()
    }

    pub fn stats(&self) -> PerInstanceUploadStats {
        self.stats
    }

    pub fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), SkinningError> {
        let start = offset as usize;
        let end = start + data.len();
        if end > self.shadow.len() {
            return Err(SkinningError::InvalidParameter(format!(
                "per-instance write {start}..{end} past the end of {} bytes",
                self.shadow.len()
            )));
        }
        if data.is_empty() {
            return Ok(());
        }
        self.shadow[start..end].copy_from_slice(data);

        match self.strategy {
            PerInstanceUpdates::PartialWrites => {
                self.device.write_buffer(&self.buffer, offset as u64, data)?;
                self.stats.uploads += 1;
                self.stats.bytes += data.len() as u64;
            }
            _ => {
                self.dirty = Some(match self.dirty.take() {
                    Some(range) => range.start.min(start)..range.end.max(end),
                    None => start..end,
                });
            }
        }
        Ok(())
    }

    /// Uploads the span covering every pending shadow write. Returns whether
    /// anything was uploaded.
    pub fn flush(&mut self) -> Result<bool, SkinningError> {
        let Some(dirty) = self.dirty.take() else {
            return Ok(false);
        };
        // Copies must start and end on 4-byte boundaries.
        let range = dirty.start & !3..dirty.end.next_multiple_of(4).min(self.shadow.len());
        self.device
            .write_buffer(&self.buffer, range.start as u64, &self.shadow[range.clone()])?;
        self.stats.uploads += 1;
        self.stats.bytes += range.len() as u64;
        Ok(true)
    }
}

impl std::fmt::Debug for PerInstanceBufferUpdater {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerInstanceBufferUpdater")
            .field("strategy", &self.strategy)
            .field("size", &self.shadow.len())
            .field("dirty", &self.dirty)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use avatar_graphics::BufferDescriptor;
    use rstest::rstest;

    fn updater(strategy: PerInstanceUpdates) -> PerInstanceBufferUpdater {
        let device = GraphicsDevice::dummy();
        let buffer = device.create_buffer(&BufferDescriptor::storage(16)).unwrap();
        PerInstanceBufferUpdater::new(device, buffer, strategy, vec![0; 16]).unwrap()
    }

    fn gpu_contents(updater: &PerInstanceBufferUpdater) -> Vec<u8> {
        updater
            .device
            .read_buffer(&updater.buffer, 0, updater.buffer.size())
            .unwrap()
    }

    #[test]
    fn shadow_buffer_uploads_once_per_flush() {
        let mut updater = updater(PerInstanceUpdates::ShadowBuffer);
        updater.write(0, &1u32.to_le_bytes()).unwrap();
        updater.write(8, &2u32.to_le_bytes()).unwrap();
        assert_eq!(gpu_contents(&updater), vec![0; 16]);
        assert!(updater.is_dirty());

        assert!(updater.flush().unwrap());
        assert!(!updater.flush().unwrap());
        assert_eq!(gpu_contents(&updater), updater.shadow());
        assert_eq!(updater.stats().uploads, 2);
    }

    #[test]
    fn flush_uploads_only_the_dirty_span() {
        let mut updater = updater(PerInstanceUpdates::ShadowBuffer);
        updater.write(4, &1u32.to_le_bytes()).unwrap();
        updater.write(8, &2u32.to_le_bytes()).unwrap();
        // The flush must not overwrite bytes outside 4..12.
        updater.device.write_buffer(&updater.buffer, 0, &[9; 4]).unwrap();
        updater.device.write_buffer(&updater.buffer, 12, &[9; 4]).unwrap();

        assert!(updater.flush().unwrap());
        assert_eq!(updater.stats().bytes, 16 + 8);
        let gpu = gpu_contents(&updater);
        assert_eq!(gpu[0..4], [9; 4]);
        assert_eq!(gpu[4..8], 1u32.to_le_bytes());
        assert_eq!(gpu[8..12], 2u32.to_le_bytes());
        assert_eq!(gpu[12..16], [9; 4]);
    }

    #[test]
    fn dirty_span_is_widened_to_whole_words() {
        let mut updater = updater(PerInstanceUpdates::ShadowBuffer);
        updater.write(5, &[1, 2]).unwrap();
        assert!(updater.flush().unwrap());
        assert_eq!(updater.stats().bytes, 16 + 4);
        assert_eq!(gpu_contents(&updater)[4..8], [0, 1, 2, 0]);
    }

    #[test]
    fn partial_writes_go_straight_through() {
        let mut updater = updater(PerInstanceUpdates::PartialWrites);
        updater.write(4, &7u32.to_le_bytes()).unwrap();
        assert!(!updater.is_dirty());
        assert_eq!(gpu_contents(&updater)[4..8], 7u32.to_le_bytes());
        assert!(!updater.flush().unwrap());
        assert_eq!(updater.stats().uploads, 2);
    }

    #[rstest]
    #[case(PerInstanceUpdates::ShadowBuffer)]
    #[case(PerInstanceUpdates::PartialWrites)]
    fn rejects_out_of_range_writes(#[case] strategy: PerInstanceUpdates) {
        let mut updater = updater(strategy);
        assert!(matches!(
            updater.write(12, &[0; 8]),
            Err(SkinningError::InvalidParameter(_))
        ));
    }

    #[test]
    fn auto_resolves_for_the_backend() {
        assert_eq!(
            updater(PerInstanceUpdates::Auto).strategy(),
            PerInstanceUpdates::PartialWrites
        );
    }
}
