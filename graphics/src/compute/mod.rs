//! Compute shaders, pipelines and dispatches.
//!
//! A [`ComputeShader`] bundles GLSL source, its includes, the declared buffer
//! bindings and an optional [`HostKernel`]. The wgpu backend composes the GLSL
//! to WGSL; the dummy backend runs the host kernel against host memory so the
//! same dispatch can be verified without a GPU.

mod host;

pub use host::{HostDispatch, HostKernel};

use std::sync::Arc;

use crate::backend::GpuComputePipeline;
use crate::error::GraphicsError;
use crate::resources::Buffer;
use crate::shader::{ShaderComposer, ShaderDefines};

/// How a binding is accessed by the shader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingKind {
    /// `readonly buffer` block.
    StorageRead,
    /// Writable `buffer` block.
    StorageReadWrite,
    /// `uniform` block.
    Uniform,
}

impl BindingKind {
    pub fn is_writable(self) -> bool {
        matches!(self, BindingKind::StorageReadWrite)
    }
}

/// A buffer binding declared by a compute shader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindingSlot {
    /// Name of the block instance in the shader source.
    pub name: &'static str,
    pub binding: u32,
    pub kind: BindingKind,
}

impl BindingSlot {
    pub const fn new(name: &'static str, binding: u32, kind: BindingKind) -> Self {
        Self {
            name,
            binding,
            kind,
        }
    }
}

/// GLSL compute shader plus everything a backend needs to build a pipeline.
pub struct ComputeShader {
    label: String,
    source: String,
    includes: Vec<(String, String)>,
    entry_point: String,
    workgroup_size: [u32; 3],
    bindings: Vec<BindingSlot>,
    host_kernel: Option<Arc<dyn HostKernel>>,
}

impl ComputeShader {
    pub fn new(label: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            source: source.into(),
            includes: Vec::new(),
            entry_point: "main".to_string(),
            workgroup_size: [64, 1, 1],
            bindings: Vec::new(),
            host_kernel: None,
        }
    }

    pub fn with_include(mut self, path: impl Into<String>, source: impl Into<String>) -> Self {
        self.includes.push((path.into(), source.into()));
        self
    }

    /// Must match the `local_size` declared in the source.
    pub fn with_workgroup_size(mut self, size: [u32; 3]) -> Self {
        self.workgroup_size = size;
        self
    }

    pub fn with_binding(mut self, slot: BindingSlot) -> Self {
        self.bindings.push(slot);
        self
    }

    pub fn with_host_kernel(mut self, kernel: Arc<dyn HostKernel>) -> Self {
        self.host_kernel = Some(kernel);
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    pub fn workgroup_size(&self) -> [u32; 3] {
        self.workgroup_size
    }

    pub fn bindings(&self) -> &[BindingSlot] {
        &self.bindings
    }

    pub fn binding(&self, binding: u32) -> Option<&BindingSlot> {
        self.bindings.iter().find(|slot| slot.binding == binding)
    }

    pub fn host_kernel(&self) -> Option<&Arc<dyn HostKernel>> {
        self.host_kernel.as_ref()
    }

    /// A composer with this shader's includes registered.
    pub fn composer(&self) -> ShaderComposer {
        let mut composer = ShaderComposer::new();
        for (path, source) in &self.includes {
            composer.register_include(path, source);
        }
        composer
    }

    /// Composes the shader for one keyword permutation and returns WGSL.
    pub fn compose_wgsl(&self, defines: &ShaderDefines) -> Result<String, GraphicsError> {
        self.composer().compose(&self.source, defines).map_err(|e| match e {
            GraphicsError::ShaderCompilationFailed(msg) => GraphicsError::ShaderCompilationFailed(
                format!("{} [{}]: {msg}", self.label, defines),
            ),
            other => other,
        })
    }
}

impl std::fmt::Debug for ComputeShader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputeShader")
            .field("label", &self.label)
            .field("workgroup_size", &self.workgroup_size)
            .field("bindings", &self.bindings)
            .field("host_kernel", &self.host_kernel.is_some())
            .finish_non_exhaustive()
    }
}

/// A compute pipeline for one keyword permutation of a [`ComputeShader`].
///
/// Created and cached by
/// [`GraphicsDevice::create_compute_pipeline`](crate::GraphicsDevice::create_compute_pipeline).
pub struct ComputePipeline {
    shader: Arc<ComputeShader>,
    defines: ShaderDefines,
    gpu: GpuComputePipeline,
}

impl ComputePipeline {
    pub(crate) fn new(shader: Arc<ComputeShader>, defines: ShaderDefines, gpu: GpuComputePipeline) -> Self {
        Self {
            shader,
            defines,
            gpu,
        }
    }

    pub fn shader(&self) -> &Arc<ComputeShader> {
        &self.shader
    }

    pub fn defines(&self) -> &ShaderDefines {
        &self.defines
    }

    pub(crate) fn gpu(&self) -> &GpuComputePipeline {
        &self.gpu
    }
}

impl std::fmt::Debug for ComputePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputePipeline")
            .field("shader", &self.shader.label())
            .field("defines", &self.defines.to_string())
            .finish()
    }
}

/// A buffer bound to a shader binding for one dispatch.
#[derive(Debug, Clone, Copy)]
pub struct BufferBinding<'a> {
    pub binding: u32,
    pub buffer: &'a Buffer,
}

impl<'a> BufferBinding<'a> {
    pub fn new(binding: u32, buffer: &'a Buffer) -> Self {
        Self { binding, buffer }
    }
}

/// A single compute dispatch.
#[derive(Debug)]
pub struct ComputeDispatch<'a> {
    pub pipeline: &'a ComputePipeline,
    pub bindings: &'a [BufferBinding<'a>],
    pub workgroups: [u32; 3],
}

impl ComputeDispatch<'_> {
    /// Checks bindings against the shader's declared slots.
    pub(crate) fn validate(&self) -> Result<(), GraphicsError> {
        let shader = self.pipeline.shader();
        for (i, binding) in self.bindings.iter().enumerate() {
            if shader.binding(binding.binding).is_none() {
                return Err(GraphicsError::InvalidParameter(format!(
                    "{} declares no binding {}",
                    shader.label(),
                    binding.binding
                )));
            }
            for other in &self.bindings[..i] {
                if other.binding == binding.binding {
                    return Err(GraphicsError::InvalidParameter(format!(
                        "binding {} bound twice",
                        binding.binding
                    )));
                }
                if std::ptr::eq(other.buffer, binding.buffer) {
                    return Err(GraphicsError::InvalidParameter(format!(
                        "buffer {:?} bound to both {} and {}",
                        binding.buffer.label(),
                        other.binding,
                        binding.binding
                    )));
                }
            }
        }
        for slot in shader.bindings() {
            if !self.bindings.iter().any(|b| b.binding == slot.binding) {
                return Err(GraphicsError::InvalidParameter(format!(
                    "{} binding {} ({}) is not bound",
                    shader.label(),
                    slot.binding,
                    slot.name
                )));
            }
        }
        Ok(())
    }
}

/// Number of workgroups needed to cover `invocations` threads.
pub fn workgroup_count(invocations: u32, workgroup_size: u32) -> u32 {
    invocations.div_ceil(workgroup_size.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workgroup_count_rounds_up() {
        assert_eq!(workgroup_count(0, 64), 0);
        assert_eq!(workgroup_count(1, 64), 1);
        assert_eq!(workgroup_count(64, 64), 1);
        assert_eq!(workgroup_count(65, 64), 2);
        assert_eq!(workgroup_count(100, 64), 2);
    }

    #[test]
    fn shader_builder_collects_bindings() {
        let shader = ComputeShader::new("test", "#version 450\nvoid main() {}")
            .with_binding(BindingSlot::new("input", 0, BindingKind::StorageRead))
            .with_binding(BindingSlot::new("output", 1, BindingKind::StorageReadWrite))
            .with_workgroup_size([32, 1, 1]);

        assert_eq!(shader.bindings().len(), 2);
        assert_eq!(shader.binding(1).map(|s| s.name), Some("output"));
        assert!(shader.binding(2).is_none());
        assert_eq!(shader.workgroup_size(), [32, 1, 1]);
        assert!(shader.host_kernel().is_none());
    }
}
