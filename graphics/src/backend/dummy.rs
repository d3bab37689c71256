//! Host-memory backend.
//!
//! Buffers are plain byte vectors and compute dispatches run the shader's
//! [`HostKernel`](crate::compute::HostKernel). Used by tests and headless
//! tools.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::compute::{ComputeDispatch, ComputeShader, HostDispatch};
use crate::error::GraphicsError;
use crate::shader::ShaderDefines;
use crate::types::BufferDescriptor;

use super::{BackendType, GpuBackend, GpuBuffer, GpuComputePipeline, check_range};

/// Host-memory backend implementation.
#[derive(Debug, Default)]
pub struct DummyBackend;

impl DummyBackend {
    /// Create a new dummy backend.
    pub fn new() -> Self {
        Self
    }
}

impl GpuBackend for DummyBackend {
    fn name(&self) -> &'static str {
        "Dummy"
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Dummy
    }

    fn create_buffer(&self, descriptor: &BufferDescriptor) -> Result<GpuBuffer, GraphicsError> {
        let size = usize::try_from(descriptor.size).map_err(|_| GraphicsError::OutOfMemory)?;
        log::trace!("DummyBackend: create_buffer {:?} ({size} bytes)", descriptor.label);
        Ok(GpuBuffer::Dummy(Arc::new(RwLock::new(vec![0; size]))))
    }

    fn write_buffer(
        &self,
        buffer: &GpuBuffer,
        offset: u64,
        data: &[u8],
    ) -> Result<(), GraphicsError> {
        let memory = buffer.host_memory()?;
        let mut bytes = memory.write();
        check_range(bytes.len() as u64, offset, data.len() as u64)?;
        let start = offset as usize;
        bytes[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(
        &self,
        buffer: &GpuBuffer,
        offset: u64,
        size: u64,
    ) -> Result<Vec<u8>, GraphicsError> {
        let memory = buffer.host_memory()?;
        let bytes = memory.read();
        check_range(bytes.len() as u64, offset, size)?;
        let start = offset as usize;
        Ok(bytes[start..start + size as usize].to_vec())
    }

    fn create_compute_pipeline(
        &self,
        shader: &ComputeShader,
        defines: &ShaderDefines,
    ) -> Result<GpuComputePipeline, GraphicsError> {
        log::trace!(
            "DummyBackend: create_compute_pipeline {} [{}]",
            shader.label(),
            defines
        );
        Ok(GpuComputePipeline::Dummy {
            kernel: shader.host_kernel().cloned(),
        })
    }

    fn dispatch(&self, dispatch: &ComputeDispatch<'_>) -> Result<(), GraphicsError> {
        let GpuComputePipeline::Dummy { kernel } = dispatch.pipeline.gpu() else {
            return Err(GraphicsError::Internal(
                "dispatch called with non-dummy pipeline".to_string(),
            ));
        };
        let shader = dispatch.pipeline.shader();
        let kernel = kernel.as_ref().ok_or_else(|| {
            GraphicsError::FeatureNotSupported(format!(
                "{} has no host kernel for the dummy backend",
                shader.label()
            ))
        })?;

        // Bindings were validated as distinct buffers, so locking each once
        // cannot self-deadlock.
        let mut read_guards = Vec::new();
        let mut write_guards = Vec::new();
        for binding in dispatch.bindings {
            let memory = binding.buffer.gpu_buffer().host_memory()?;
            let writable = shader
                .binding(binding.binding)
                .map(|slot| slot.kind.is_writable())
                .unwrap_or(false);
            if writable {
                write_guards.push((binding.binding, memory.write()));
            } else {
                read_guards.push((binding.binding, memory.read()));
            }
        }

        let reads = read_guards
            .iter()
            .map(|(binding, guard)| (*binding, guard.as_slice()))
            .collect();
        let writes = write_guards
            .iter_mut()
            .map(|(binding, guard)| (*binding, guard.as_mut_slice()))
            .collect();

        log::trace!(
            "DummyBackend: dispatch {} [{}] {:?}",
            shader.label(),
            dispatch.pipeline.defines(),
            dispatch.workgroups
        );

        let mut host = HostDispatch::new(
            dispatch.pipeline.defines(),
            dispatch.workgroups,
            shader.workgroup_size(),
            reads,
            writes,
        );
        kernel.execute(&mut host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BufferUsage;

    #[test]
    fn test_dummy_backend_name() {
        let backend = DummyBackend::new();
        assert_eq!(backend.name(), "Dummy");
        assert_eq!(backend.backend_type(), BackendType::Dummy);
    }

    #[test]
    fn test_write_then_read() {
        let backend = DummyBackend::new();
        let buffer = backend
            .create_buffer(&BufferDescriptor::new(8, BufferUsage::STORAGE))
            .unwrap();
        backend.write_buffer(&buffer, 2, &[1, 2, 3]).unwrap();
        assert_eq!(
            backend.read_buffer(&buffer, 0, 8).unwrap(),
            vec![0, 0, 1, 2, 3, 0, 0, 0]
        );
    }

    #[test]
    fn test_out_of_bounds_access() {
        let backend = DummyBackend::new();
        let buffer = backend
            .create_buffer(&BufferDescriptor::new(4, BufferUsage::STORAGE))
            .unwrap();
        assert!(backend.write_buffer(&buffer, 2, &[1, 2, 3]).is_err());
        assert!(backend.read_buffer(&buffer, 4, 1).is_err());
    }
}
