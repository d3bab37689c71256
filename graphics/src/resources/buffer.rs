//! GPU buffer resource.

use std::sync::{Arc, Weak};

use crate::backend::GpuBuffer;
use crate::device::{DeviceCounters, GraphicsDevice};
use crate::types::BufferDescriptor;

/// A GPU buffer resource.
///
/// Buffers are created by [`GraphicsDevice::create_buffer`] and are reference-counted.
/// The backend allocation is released when the last `Arc<Buffer>` drops.
///
/// # Example
///
/// ```ignore
/// let buffer = device.create_buffer(&BufferDescriptor::storage(1024))?;
/// device.write_buffer(&buffer, 0, &bytes)?;
/// ```
pub struct Buffer {
    device: Weak<GraphicsDevice>,
    descriptor: BufferDescriptor,
    gpu: GpuBuffer,
    counters: Arc<DeviceCounters>,
}

impl Buffer {
    /// Create a new buffer (called by GraphicsDevice).
    pub(crate) fn new(
        device: Weak<GraphicsDevice>,
        descriptor: BufferDescriptor,
        gpu: GpuBuffer,
        counters: Arc<DeviceCounters>,
    ) -> Self {
        counters.buffer_created(descriptor.size);
        Self {
            device,
            descriptor,
            gpu,
            counters,
        }
    }

    /// Get the parent device, if it still exists.
    pub fn device(&self) -> Option<Arc<GraphicsDevice>> {
        self.device.upgrade()
    }

    /// Get the buffer descriptor.
    pub fn descriptor(&self) -> &BufferDescriptor {
        &self.descriptor
    }

    /// Get the buffer size in bytes.
    pub fn size(&self) -> u64 {
        self.descriptor.size
    }

    /// Get the buffer label, if set.
    pub fn label(&self) -> Option<&str> {
        self.descriptor.label.as_deref()
    }

    /// Backend handle.
    pub fn gpu_buffer(&self) -> &GpuBuffer {
        &self.gpu
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.counters.buffer_destroyed(self.descriptor.size);
        log::trace!(
            "Buffer: destroyed {:?}, size={}",
            self.descriptor.label,
            self.descriptor.size
        );
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("size", &self.descriptor.size)
            .field("usage", &self.descriptor.usage)
            .field("label", &self.descriptor.label)
            .finish()
    }
}

// Ensure Buffer is Send + Sync
static_assertions::assert_impl_all!(Buffer: Send, Sync);
