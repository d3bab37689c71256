//! GPU backend abstraction layer.
//!
//! # Available Backends
//!
//! - `dummy` (always available): buffers live in host memory and compute
//!   dispatches run the shader's [`HostKernel`](crate::compute::HostKernel)
//! - `wgpu-backend`: cross-platform backend using wgpu

#[cfg(feature = "wgpu-backend")]
pub mod wgpu_backend;

pub mod dummy;

use std::sync::Arc;

use parking_lot::RwLock;

use crate::compute::{ComputeDispatch, ComputeShader, HostKernel};
use crate::error::GraphicsError;
use crate::shader::ShaderDefines;
use crate::types::BufferDescriptor;

pub use dummy::DummyBackend;

/// Host memory backing a dummy buffer.
pub type HostMemory = Arc<RwLock<Vec<u8>>>;

/// Which backend a device should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BackendType {
    /// Host-memory backend with host-executed compute.
    #[default]
    Dummy,
    /// wgpu (requires the `wgpu-backend` feature).
    Wgpu,
    /// wgpu when compiled in and an adapter is available, otherwise dummy.
    Auto,
}

/// Handle to a GPU buffer resource.
pub enum GpuBuffer {
    /// Dummy backend buffer (host memory)
    Dummy(HostMemory),
    /// wgpu backend buffer
    #[cfg(feature = "wgpu-backend")]
    Wgpu(Arc<wgpu::Buffer>),
}

impl GpuBuffer {
    pub(crate) fn host_memory(&self) -> Result<&HostMemory, GraphicsError> {
        match self {
            Self::Dummy(memory) => Ok(memory),
            #[cfg(feature = "wgpu-backend")]
            Self::Wgpu(_) => Err(GraphicsError::Internal(
                "expected a dummy buffer, got a wgpu buffer".to_string(),
            )),
        }
    }
}

impl std::fmt::Debug for GpuBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dummy(memory) => f
                .debug_struct("GpuBuffer::Dummy")
                .field("size", &memory.read().len())
                .finish(),
            #[cfg(feature = "wgpu-backend")]
            Self::Wgpu(buffer) => f.debug_tuple("GpuBuffer::Wgpu").field(buffer).finish(),
        }
    }
}

impl Clone for GpuBuffer {
    fn clone(&self) -> Self {
        match self {
            Self::Dummy(memory) => Self::Dummy(memory.clone()),
            #[cfg(feature = "wgpu-backend")]
            Self::Wgpu(buffer) => Self::Wgpu(buffer.clone()),
        }
    }
}

/// Handle to a backend compute pipeline.
pub enum GpuComputePipeline {
    /// Dummy backend: the shader's host kernel, if it has one.
    Dummy {
        kernel: Option<Arc<dyn HostKernel>>,
    },
    /// wgpu backend pipeline and its bind group layout.
    #[cfg(feature = "wgpu-backend")]
    Wgpu {
        pipeline: wgpu::ComputePipeline,
        bind_group_layout: wgpu::BindGroupLayout,
    },
}

impl std::fmt::Debug for GpuComputePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dummy { kernel } => f
                .debug_struct("GpuComputePipeline::Dummy")
                .field("host_kernel", &kernel.is_some())
                .finish(),
            #[cfg(feature = "wgpu-backend")]
            Self::Wgpu { pipeline, .. } => f
                .debug_struct("GpuComputePipeline::Wgpu")
                .field("pipeline", pipeline)
                .finish_non_exhaustive(),
        }
    }
}

/// GPU backend trait for abstracting different GPU APIs.
pub trait GpuBackend: Send + Sync + 'static {
    /// Get the backend name.
    fn name(&self) -> &'static str;

    /// The concrete backend kind (never [`BackendType::Auto`]).
    fn backend_type(&self) -> BackendType;

    /// Create a buffer resource. Contents start zeroed.
    fn create_buffer(&self, descriptor: &BufferDescriptor) -> Result<GpuBuffer, GraphicsError>;

    /// Write data to a buffer.
    fn write_buffer(&self, buffer: &GpuBuffer, offset: u64, data: &[u8])
    -> Result<(), GraphicsError>;

    /// Read data from a buffer.
    ///
    /// This is a blocking operation that waits for the GPU to finish.
    fn read_buffer(&self, buffer: &GpuBuffer, offset: u64, size: u64)
    -> Result<Vec<u8>, GraphicsError>;

    /// Build a compute pipeline for one keyword permutation.
    fn create_compute_pipeline(
        &self,
        shader: &ComputeShader,
        defines: &ShaderDefines,
    ) -> Result<GpuComputePipeline, GraphicsError>;

    /// Record and submit a compute dispatch.
    fn dispatch(&self, dispatch: &ComputeDispatch<'_>) -> Result<(), GraphicsError>;
}

/// Creates the backend requested by `backend_type`.
pub fn create_backend(backend_type: BackendType) -> Result<Arc<dyn GpuBackend>, GraphicsError> {
    match backend_type {
        BackendType::Dummy => {
            log::info!("Using dummy backend");
            Ok(Arc::new(DummyBackend::new()))
        }
        BackendType::Wgpu => create_wgpu_backend(),
        BackendType::Auto => match create_wgpu_backend() {
            Ok(backend) => Ok(backend),
            Err(e) => {
                log::warn!("wgpu backend unavailable ({e}), falling back to dummy backend");
                Ok(Arc::new(DummyBackend::new()))
            }
        },
    }
}

#[cfg(feature = "wgpu-backend")]
fn create_wgpu_backend() -> Result<Arc<dyn GpuBackend>, GraphicsError> {
    let backend = wgpu_backend::WgpuBackend::new()?;
    log::info!("Using wgpu backend");
    Ok(Arc::new(backend))
}

#[cfg(not(feature = "wgpu-backend"))]
fn create_wgpu_backend() -> Result<Arc<dyn GpuBackend>, GraphicsError> {
    Err(GraphicsError::FeatureNotSupported(
        "wgpu backend not compiled in (enable the `wgpu-backend` feature)".to_string(),
    ))
}

/// Checks that `offset..offset + len` lies inside a buffer of `size` bytes.
pub(crate) fn check_range(size: u64, offset: u64, len: u64) -> Result<(), GraphicsError> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(GraphicsError::InvalidParameter(format!(
            "range {offset}..{} out of bounds for buffer of {size} bytes",
            offset.saturating_add(len)
        ))),
    }
}
