//! Common utilities for GPU integration tests.

use std::sync::Arc;

use avatar_graphics::{BackendType, DeviceParameters, GraphicsDevice};

/// Available GPU backends for testing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    /// Host-memory backend with host-executed kernels.
    Dummy,
    /// WebGPU backend (via wgpu).
    WebGpu,
}

impl Backend {
    /// Check if this backend is compiled in.
    pub fn is_available(&self) -> bool {
        match self {
            Backend::Dummy => true,
            #[cfg(feature = "wgpu-backend")]
            Backend::WebGpu => true,
            #[cfg(not(feature = "wgpu-backend"))]
            Backend::WebGpu => false,
        }
    }

    fn backend_type(self) -> BackendType {
        match self {
            Backend::Dummy => BackendType::Dummy,
            Backend::WebGpu => BackendType::Wgpu,
        }
    }
}

/// Test context holding a device for one backend.
pub struct TestContext {
    pub device: Arc<GraphicsDevice>,
}

impl TestContext {
    /// Returns `None` when the backend is not compiled in or no adapter exists.
    pub fn new(backend: Backend) -> Option<Self> {
        let _ = env_logger::builder().is_test(true).try_init();

        if !backend.is_available() {
            return None;
        }
        match GraphicsDevice::new(DeviceParameters::default().with_backend(backend.backend_type())) {
            Ok(device) => Some(Self { device }),
            Err(e) => {
                eprintln!("Failed to create {backend:?} device: {e}");
                None
            }
        }
    }
}
