//! Graphics device.
//!
//! The [`GraphicsDevice`] is the main interface for creating GPU resources,
//! uploading and reading back buffer contents, and dispatching compute work.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::backend::{BackendType, GpuBackend, create_backend};
use crate::compute::{ComputeDispatch, ComputePipeline, ComputeShader};
use crate::error::GraphicsError;
use crate::resources::Buffer;
use crate::shader::ShaderDefines;
use crate::types::BufferDescriptor;

/// Capabilities of a graphics device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceCapabilities {
    /// Maximum buffer size.
    pub max_buffer_size: u64,
    /// Whether compute shaders are supported.
    pub compute_shaders: bool,
}

impl Default for DeviceCapabilities {
    fn default() -> Self {
        Self {
            max_buffer_size: 1 << 30, // 1 GB
            compute_shaders: true,
        }
    }
}

/// Parameters for [`GraphicsDevice::new`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceParameters {
    pub label: String,
    pub backend: BackendType,
    pub capabilities: DeviceCapabilities,
}

impl Default for DeviceParameters {
    fn default() -> Self {
        Self {
            label: "Avatar Device".to_string(),
            backend: BackendType::Dummy,
            capabilities: DeviceCapabilities::default(),
        }
    }
}

impl DeviceParameters {
    pub fn with_backend(mut self, backend: BackendType) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_max_buffer_size(mut self, size: u64) -> Self {
        self.capabilities.max_buffer_size = size;
        self
    }
}

/// Live counters shared between a device and the buffers it created.
#[derive(Debug, Default)]
pub struct DeviceCounters {
    buffers_created: AtomicU64,
    buffers_destroyed: AtomicU64,
    live_bytes: AtomicU64,
    bytes_uploaded: AtomicU64,
    dispatches: AtomicU64,
}

impl DeviceCounters {
    pub(crate) fn buffer_created(&self, size: u64) {
        self.buffers_created.fetch_add(1, Ordering::Relaxed);
        self.live_bytes.fetch_add(size, Ordering::Relaxed);
    }

    pub(crate) fn buffer_destroyed(&self, size: u64) {
        self.buffers_destroyed.fetch_add(1, Ordering::Relaxed);
        self.live_bytes.fetch_sub(size, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DeviceStats {
        DeviceStats {
            buffers_created: self.buffers_created.load(Ordering::Relaxed),
            buffers_destroyed: self.buffers_destroyed.load(Ordering::Relaxed),
            live_bytes: self.live_bytes.load(Ordering::Relaxed),
            bytes_uploaded: self.bytes_uploaded.load(Ordering::Relaxed),
            dispatches: self.dispatches.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of device resource statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceStats {
    pub buffers_created: u64,
    pub buffers_destroyed: u64,
    pub live_bytes: u64,
    pub bytes_uploaded: u64,
    pub dispatches: u64,
}

impl DeviceStats {
    pub fn live_buffers(&self) -> u64 {
        self.buffers_created - self.buffers_destroyed
    }
}

/// A graphics device for creating GPU resources.
///
/// # Thread Safety
///
/// `GraphicsDevice` is `Send + Sync` and can be safely shared across threads.
///
/// # Example
///
/// ```ignore
/// let device = GraphicsDevice::new(DeviceParameters::default())?;
/// let buffer = device.create_buffer(&BufferDescriptor::storage(1024))?;
/// device.write_buffer(&buffer, 0, &[0u8; 16])?;
/// ```
pub struct GraphicsDevice {
    name: String,
    backend: Arc<dyn GpuBackend>,
    capabilities: DeviceCapabilities,
    counters: Arc<DeviceCounters>,
    pipelines: Mutex<HashMap<PipelineKey, Arc<ComputePipeline>>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PipelineKey {
    shader: String,
    defines: ShaderDefines,
}

impl GraphicsDevice {
    /// Creates a device on the requested backend.
    pub fn new(params: DeviceParameters) -> Result<Arc<Self>, GraphicsError> {
        let backend = create_backend(params.backend)?;
        Ok(Self::with_backend(params, backend))
    }

    /// Creates a device on an already constructed backend.
    pub fn with_backend(params: DeviceParameters, backend: Arc<dyn GpuBackend>) -> Arc<Self> {
        log::info!(
            "GraphicsDevice '{}' created on {} backend",
            params.label,
            backend.name()
        );
        Arc::new(Self {
            name: params.label,
            backend,
            capabilities: params.capabilities,
            counters: Arc::new(DeviceCounters::default()),
            pipelines: Mutex::new(HashMap::new()),
        })
    }

    /// Shorthand for a device on the dummy backend.
    pub fn dummy() -> Arc<Self> {
        Self::with_backend(
            DeviceParameters::default(),
            Arc::new(crate::backend::DummyBackend::new()),
        )
    }

    /// Get the device name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the device capabilities.
    pub fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    /// The backend kind this device runs on.
    pub fn backend_type(&self) -> BackendType {
        self.backend.backend_type()
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Resource statistics.
    pub fn stats(&self) -> DeviceStats {
        self.counters.snapshot()
    }

    /// Create a GPU buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer size exceeds device limits or allocation fails.
    pub fn create_buffer(
        self: &Arc<Self>,
        descriptor: &BufferDescriptor,
    ) -> Result<Arc<Buffer>, GraphicsError> {
        if descriptor.size > self.capabilities.max_buffer_size {
            return Err(GraphicsError::InvalidParameter(format!(
                "buffer size {} exceeds maximum {}",
                descriptor.size, self.capabilities.max_buffer_size
            )));
        }

        if descriptor.size == 0 {
            return Err(GraphicsError::InvalidParameter(
                "buffer size cannot be zero".to_string(),
            ));
        }

        let gpu = self.backend.create_buffer(descriptor)?;
        let buffer = Arc::new(Buffer::new(
            Arc::downgrade(self),
            descriptor.clone(),
            gpu,
            self.counters.clone(),
        ));

        log::trace!(
            "GraphicsDevice: created buffer {:?}, size={}",
            descriptor.label,
            descriptor.size
        );

        Ok(buffer)
    }

    /// Upload `data` into `buffer` at `offset`.
    pub fn write_buffer(
        &self,
        buffer: &Buffer,
        offset: u64,
        data: &[u8],
    ) -> Result<(), GraphicsError> {
        crate::backend::check_range(buffer.size(), offset, data.len() as u64)?;
        self.backend.write_buffer(buffer.gpu_buffer(), offset, data)?;
        self.counters
            .bytes_uploaded
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Blocking readback of `size` bytes at `offset`.
    pub fn read_buffer(
        &self,
        buffer: &Buffer,
        offset: u64,
        size: u64,
    ) -> Result<Vec<u8>, GraphicsError> {
        crate::backend::check_range(buffer.size(), offset, size)?;
        self.backend.read_buffer(buffer.gpu_buffer(), offset, size)
    }

    /// Returns the pipeline for `shader` with `defines`, building it on first use.
    ///
    /// Pipelines are cached per shader label and keyword set for the life of
    /// the device.
    pub fn create_compute_pipeline(
        &self,
        shader: &Arc<ComputeShader>,
        defines: &ShaderDefines,
    ) -> Result<Arc<ComputePipeline>, GraphicsError> {
        if !self.capabilities.compute_shaders {
            return Err(GraphicsError::FeatureNotSupported(
                "compute shaders".to_string(),
            ));
        }

        let key = PipelineKey {
            shader: shader.label().to_string(),
            defines: defines.clone(),
        };
        let mut pipelines = self.pipelines.lock();
        if let Some(pipeline) = pipelines.get(&key) {
            return Ok(pipeline.clone());
        }

        let gpu = self.backend.create_compute_pipeline(shader, defines)?;
        let pipeline = Arc::new(ComputePipeline::new(shader.clone(), defines.clone(), gpu));
        log::debug!(
            "GraphicsDevice: built compute pipeline {} [{}]",
            shader.label(),
            defines
        );
        pipelines.insert(key, pipeline.clone());
        Ok(pipeline)
    }

    /// Number of cached compute pipelines.
    pub fn pipeline_count(&self) -> usize {
        self.pipelines.lock().len()
    }

    /// Validate and submit a compute dispatch.
    pub fn dispatch(&self, dispatch: &ComputeDispatch<'_>) -> Result<(), GraphicsError> {
        dispatch.validate()?;
        if dispatch.workgroups.contains(&0) {
            return Ok(());
        }
        self.backend.dispatch(dispatch)?;
        self.counters.dispatches.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl std::fmt::Debug for GraphicsDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphicsDevice")
            .field("name", &self.name)
            .field("backend", &self.backend.name())
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

static_assertions::assert_impl_all!(GraphicsDevice: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::{BindingKind, BindingSlot, BufferBinding, HostDispatch, HostKernel};

    struct DoubleKernel;

    impl HostKernel for DoubleKernel {
        fn execute(&self, dispatch: &mut HostDispatch<'_>) -> Result<(), GraphicsError> {
            let input = dispatch.read(0)?;
            let output = dispatch.take_write(1)?;
            for (o, i) in output.iter_mut().zip(input) {
                *o = i * 2;
            }
            Ok(())
        }
    }

    fn double_shader() -> Arc<ComputeShader> {
        Arc::new(
            ComputeShader::new("double", "#version 450\nvoid main() {}")
                .with_binding(BindingSlot::new("input", 0, BindingKind::StorageRead))
                .with_binding(BindingSlot::new("output", 1, BindingKind::StorageReadWrite))
                .with_host_kernel(Arc::new(DoubleKernel)),
        )
    }

    #[test]
    fn test_create_buffer_validation() {
        let device = GraphicsDevice::with_backend(
            DeviceParameters::default().with_max_buffer_size(128),
            Arc::new(crate::backend::DummyBackend::new()),
        );
        assert!(device.create_buffer(&BufferDescriptor::storage(0)).is_err());
        assert!(device.create_buffer(&BufferDescriptor::storage(129)).is_err());
        assert!(device.create_buffer(&BufferDescriptor::storage(128)).is_ok());
    }

    #[test]
    fn test_stats_track_buffer_lifetime() {
        let device = GraphicsDevice::dummy();
        let a = device.create_buffer(&BufferDescriptor::storage(16)).unwrap();
        let b = device.create_buffer(&BufferDescriptor::storage(32)).unwrap();
        assert_eq!(device.stats().live_buffers(), 2);
        assert_eq!(device.stats().live_bytes, 48);

        device.write_buffer(&a, 0, &[1; 16]).unwrap();
        assert_eq!(device.stats().bytes_uploaded, 16);

        drop(a);
        drop(b);
        let stats = device.stats();
        assert_eq!(stats.buffers_created, 2);
        assert_eq!(stats.buffers_destroyed, 2);
    }

    #[test]
    fn test_pipeline_cache() {
        let device = GraphicsDevice::dummy();
        let shader = double_shader();
        let mut defines = ShaderDefines::new();
        let a = device.create_compute_pipeline(&shader, &defines).unwrap();
        let b = device.create_compute_pipeline(&shader, &defines).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        defines.enable("VARIANT");
        let c = device.create_compute_pipeline(&shader, &defines).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(device.pipeline_count(), 2);
    }

    #[test]
    fn test_host_dispatch() {
        let device = GraphicsDevice::dummy();
        let pipeline = device
            .create_compute_pipeline(&double_shader(), &ShaderDefines::new())
            .unwrap();
        let input = device.create_buffer(&BufferDescriptor::storage(4)).unwrap();
        let output = device.create_buffer(&BufferDescriptor::storage(4)).unwrap();
        device.write_buffer(&input, 0, &[1, 2, 3, 4]).unwrap();

        let bindings = [BufferBinding::new(0, &input), BufferBinding::new(1, &output)];
        device
            .dispatch(&ComputeDispatch {
                pipeline: &pipeline,
                bindings: &bindings,
                workgroups: [1, 1, 1],
            })
            .unwrap();

        assert_eq!(device.read_buffer(&output, 0, 4).unwrap(), vec![2, 4, 6, 8]);
        assert_eq!(device.stats().dispatches, 1);
    }

    #[test]
    fn test_dispatch_rejects_aliased_and_missing_bindings() {
        let device = GraphicsDevice::dummy();
        let pipeline = device
            .create_compute_pipeline(&double_shader(), &ShaderDefines::new())
            .unwrap();
        let buffer = device.create_buffer(&BufferDescriptor::storage(4)).unwrap();

        let aliased = [BufferBinding::new(0, &buffer), BufferBinding::new(1, &buffer)];
        let result = device.dispatch(&ComputeDispatch {
            pipeline: &pipeline,
            bindings: &aliased,
            workgroups: [1, 1, 1],
        });
        assert!(matches!(result, Err(GraphicsError::InvalidParameter(_))));

        let missing = [BufferBinding::new(0, &buffer)];
        let result = device.dispatch(&ComputeDispatch {
            pipeline: &pipeline,
            bindings: &missing,
            workgroups: [1, 1, 1],
        });
        assert!(matches!(result, Err(GraphicsError::InvalidParameter(_))));
    }
}
