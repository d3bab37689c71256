//! Per-mesh façade over a shared vertex buffer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::SkinningError;
use crate::format::IndexFormat;
use crate::pool::{PendingLoad, RetainedVertexBuffer, SkinningResourcePool};
use crate::source::CompactSkinningDataId;
use crate::vertex_buffer::SharedVertexBuffer;

/// Where one mesh vertex is read from and written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexIndices {
    pub compact_skinning_index: u32,
    pub output_buffer_index: u32,
}

/// Pairs every mesh vertex with its compact index, ordered by compact index.
///
/// `compact_indices[i]` is the compact index of mesh vertex `i`, which also
/// becomes its output index. Counting sort over `[min, max]`, so the result
/// is stable and the cost is O(n + range).
pub fn bucket_sort_vertex_indices(compact_indices: &[u32]) -> Vec<VertexIndices> {
    let (Some(&min), Some(&max)) = (compact_indices.iter().min(), compact_indices.iter().max())
    else {
        return Vec::new();
    };

    let mut starts = vec![0usize; (max - min) as usize + 2];
    for &c in compact_indices {
        starts[(c - min) as usize + 1] += 1;
    }
    for i in 1..starts.len() {
        starts[i] += starts[i - 1];
    }

    let mut sorted = vec![
        VertexIndices {
            compact_skinning_index: 0,
            output_buffer_index: 0,
        };
        compact_indices.len()
    ];
    for (output, &c) in compact_indices.iter().enumerate() {
        let slot = &mut starts[(c - min) as usize];
        sorted[*slot] = VertexIndices {
            compact_skinning_index: c,
            output_buffer_index: output as u32,
        };
        *slot += 1;
    }
    sorted
}

/// Load state of a [`ComputeSkinnedPrimitive`].
#[derive(Debug, Clone, PartialEq)]
pub enum PrimitiveState {
    Loading,
    Ready,
    Failed(SkinningError),
}

/// Converts the raw inverse reorder table to compact indices.
pub type IndexRemap = dyn Fn(&[u8], IndexFormat, u32) -> Vec<u32> + Send + Sync;

enum Slot {
    Loading,
    Ready {
        buffer: RetainedVertexBuffer,
        indices: Arc<[VertexIndices]>,
    },
    Failed(SkinningError),
}

struct PrimitiveInner {
    id: CompactSkinningDataId,
    remap: Box<IndexRemap>,
    slot: Mutex<Slot>,
    source_data_loaded: AtomicBool,
}

impl PrimitiveInner {
    fn build_indices(&self, buffer: &SharedVertexBuffer) -> Result<Vec<VertexIndices>, SkinningError> {
        let table = buffer.inverse_reorder();
        let compact = (self.remap)(&table.bytes, table.format, table.count);
        if compact.len() != table.count as usize {
            return Err(SkinningError::BuildFailure(format!(
                "index remap produced {} entries for {} mesh vertices",
                compact.len(),
                table.count
            )));
        }
        if let Some(bad) = compact.iter().find(|&&c| c >= buffer.num_verts()) {
            return Err(SkinningError::BuildFailure(format!(
                "reorder entry {bad} out of range for {} compact vertices",
                buffer.num_verts()
            )));
        }
        Ok(bucket_sort_vertex_indices(&compact))
    }
}

impl PendingLoad for PrimitiveInner {
    fn compact_skinning_data_loaded(&self, _id: CompactSkinningDataId) {
        self.source_data_loaded.store(true, Ordering::Release);
    }

    fn finish(&self, buffer: RetainedVertexBuffer) {
        let next = match self.build_indices(&buffer) {
            Ok(indices) => {
                log::trace!("Primitive {} ready with {} vertices", self.id, indices.len());
                Slot::Ready {
                    buffer,
                    indices: indices.into(),
                }
            }
            Err(error) => {
                log::warn!("Primitive {}: {error}", self.id);
                Slot::Failed(error)
            }
        };
        *self.slot.lock() = next;
    }

    fn fail(&self, error: &SkinningError) {
        log::debug!("Primitive {} has no compute skinning: {error}", self.id);
        *self.slot.lock() = Slot::Failed(error.clone());
    }
}

/// A mesh asset's view of its shared vertex buffer.
///
/// Construction either picks up an existing buffer or queues on the pool's
/// builder. Dropping the primitive releases its retain, or withdraws its
/// pending load.
pub struct ComputeSkinnedPrimitive {
    inner: Arc<PrimitiveInner>,
    pool: Weak<SkinningResourcePool>,
}

impl ComputeSkinnedPrimitive {
    /// Requests the buffer for `id`.
    ///
    /// `remap` turns the inverse reorder table into one compact index per
    /// mesh vertex; [`decode_index_table`](crate::format::decode_index_table)
    /// is the identity conversion.
    pub fn new(
        pool: &Arc<SkinningResourcePool>,
        id: CompactSkinningDataId,
        remap: impl Fn(&[u8], IndexFormat, u32) -> Vec<u32> + Send + Sync + 'static,
    ) -> Self {
        let inner = Arc::new(PrimitiveInner {
            id,
            remap: Box::new(remap),
            slot: Mutex::new(Slot::Loading),
            source_data_loaded: AtomicBool::new(false),
        });

        if let Some(buffer) = pool.retain_buffer(id) {
            inner.compact_skinning_data_loaded(id);
            inner.finish(buffer);
        } else {
            let waiter: Arc<dyn PendingLoad> = inner.clone();
            pool.create_builder_if_needed_and_add_pending_load(id, Arc::downgrade(&waiter));
        }

        Self {
            inner,
            pool: Arc::downgrade(pool),
        }
    }

    pub fn id(&self) -> CompactSkinningDataId {
        self.inner.id
    }

    pub fn state(&self) -> PrimitiveState {
        match &*self.inner.slot.lock() {
            Slot::Loading => PrimitiveState::Loading,
            Slot::Ready { .. } => PrimitiveState::Ready,
            Slot::Failed(error) => PrimitiveState::Failed(error.clone()),
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(*self.inner.slot.lock(), Slot::Ready { .. })
    }

    pub fn is_loading(&self) -> bool {
        matches!(*self.inner.slot.lock(), Slot::Loading)
    }

    pub fn error(&self) -> Option<SkinningError> {
        match &*self.inner.slot.lock() {
            Slot::Failed(error) => Some(error.clone()),
            _ => None,
        }
    }

    /// Whether the source reported its CPU data as uploaded.
    pub fn source_data_loaded(&self) -> bool {
        self.inner.source_data_loaded.load(Ordering::Acquire)
    }

    pub fn vertex_buffer(&self) -> Option<Arc<SharedVertexBuffer>> {
        match &*self.inner.slot.lock() {
            Slot::Ready { buffer, .. } => Some(buffer.buffer().clone()),
            _ => None,
        }
    }

    /// An additional retain on the shared buffer, for objects that must keep
    /// it alive on their own.
    pub fn retain_vertex_buffer(&self) -> Result<RetainedVertexBuffer, SkinningError> {
        match &*self.inner.slot.lock() {
            Slot::Ready { buffer, .. } => Ok(buffer.clone()),
            Slot::Loading => Err(SkinningError::NotReady),
            Slot::Failed(error) => Err(error.clone()),
        }
    }

    /// One entry per mesh vertex, sorted by compact index.
    pub fn mesh_and_compact_skinning_indices(&self) -> Option<Arc<[VertexIndices]>> {
        match &*self.inner.slot.lock() {
            Slot::Ready { indices, .. } => Some(indices.clone()),
            _ => None,
        }
    }

    pub fn num_mesh_vertices(&self) -> Option<u32> {
        match &*self.inner.slot.lock() {
            Slot::Ready { indices, .. } => Some(indices.len() as u32),
            _ => None,
        }
    }
}

impl Drop for ComputeSkinnedPrimitive {
    fn drop(&mut self) {
        let loading = matches!(*self.inner.slot.lock(), Slot::Loading);
        if loading && let Some(pool) = self.pool.upgrade() {
            pool.remove_pending_load(self.inner.id, Arc::as_ptr(&self.inner) as *const ());
        }
    }
}

impl std::fmt::Debug for ComputeSkinnedPrimitive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputeSkinnedPrimitive")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}

static_assertions::assert_impl_all!(ComputeSkinnedPrimitive: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;

    fn compact(sorted: &[VertexIndices]) -> Vec<u32> {
        sorted.iter().map(|v| v.compact_skinning_index).collect()
    }

    #[test]
    fn sorts_stably_by_compact_index() {
        let sorted = bucket_sort_vertex_indices(&[5, 3, 5, 4, 3, 9]);
        assert_eq!(compact(&sorted), vec![3, 3, 4, 5, 5, 9]);
        let outputs: Vec<u32> = sorted.iter().map(|v| v.output_buffer_index).collect();
        assert_eq!(outputs, vec![1, 4, 3, 0, 2, 5]);
    }

    #[test]
    fn matches_a_stable_sort() {
        let input: Vec<u32> = (0..500u32).map(|i| 1000 + (i * 7919) % 97).collect();
        let sorted = bucket_sort_vertex_indices(&input);
        assert_eq!(sorted.len(), input.len());

        let mut expected: Vec<(u32, u32)> =
            input.iter().enumerate().map(|(i, &c)| (c, i as u32)).collect();
        expected.sort_by_key(|&(c, _)| c);
        let actual: Vec<(u32, u32)> = sorted
            .iter()
            .map(|v| (v.compact_skinning_index, v.output_buffer_index))
            .collect();
        assert_eq!(actual, expected);
    }

    #[test]
    fn empty_input() {
        assert!(bucket_sort_vertex_indices(&[]).is_empty());
        assert_eq!(compact(&bucket_sort_vertex_indices(&[u32::MAX])), vec![u32::MAX]);
    }
}
