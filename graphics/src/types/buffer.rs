//! Buffer types and descriptors.

use bitflags::bitflags;

bitflags! {
    /// Usage flags for buffers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        /// Buffer can be bound as a uniform block.
        const UNIFORM = 1 << 0;
        /// Buffer can be bound as a storage block.
        const STORAGE = 1 << 1;
        /// Buffer can be copied from (required for readback).
        const COPY_SRC = 1 << 2;
        /// Buffer can be copied to (required for host uploads).
        const COPY_DST = 1 << 3;
        /// Buffer is mappable for CPU reads.
        const MAP_READ = 1 << 4;
    }
}

impl Default for BufferUsage {
    fn default() -> Self {
        Self::empty()
    }
}

/// Descriptor for creating a buffer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct BufferDescriptor {
    /// Debug label for the buffer.
    pub label: Option<String>,
    /// Size in bytes.
    pub size: u64,
    /// Usage flags.
    pub usage: BufferUsage,
}

impl BufferDescriptor {
    /// Create a new buffer descriptor.
    pub fn new(size: u64, usage: BufferUsage) -> Self {
        Self {
            label: None,
            size,
            usage,
        }
    }

    /// Storage buffer that the host uploads into and reads back from.
    pub fn storage(size: u64) -> Self {
        Self::new(
            size,
            BufferUsage::STORAGE | BufferUsage::COPY_DST | BufferUsage::COPY_SRC,
        )
    }

    /// Uniform buffer updated from the host.
    pub fn uniform(size: u64) -> Self {
        Self::new(size, BufferUsage::UNIFORM | BufferUsage::COPY_DST)
    }

    /// Set the debug label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_descriptor_supports_upload_and_readback() {
        let desc = BufferDescriptor::storage(256).with_label("positions");
        assert!(desc.usage.contains(BufferUsage::STORAGE));
        assert!(desc.usage.contains(BufferUsage::COPY_DST | BufferUsage::COPY_SRC));
        assert_eq!(desc.label.as_deref(), Some("positions"));
    }

    #[test]
    fn uniform_descriptor() {
        let desc = BufferDescriptor::uniform(176);
        assert_eq!(desc.size, 176);
        assert!(desc.usage.contains(BufferUsage::UNIFORM));
        assert!(!desc.usage.contains(BufferUsage::STORAGE));
    }
}
