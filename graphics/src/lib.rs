//! # Avatar Graphics
//!
//! Thin GPU layer used by the avatar skinning runtime.
//!
//! ## Overview
//!
//! This crate provides:
//! - [`GraphicsDevice`] - buffer creation, uploads, readback and compute dispatch
//! - [`ComputeShader`] / [`ComputePipeline`] - GLSL compute shaders with keyword
//!   permutations, cached per device
//! - [`shader::ShaderComposer`] - `#include` resolution and GLSL to WGSL through naga
//! - Backends: Dummy (host memory, host-executed kernels) and wgpu
//!   (`wgpu-backend` feature)
//!
//! ## Example
//!
//! ```ignore
//! use avatar_graphics::{BufferDescriptor, DeviceParameters, GraphicsDevice};
//!
//! let device = GraphicsDevice::new(DeviceParameters::default())?;
//! let buffer = device.create_buffer(&BufferDescriptor::storage(1024))?;
//! ```

pub mod backend;
pub mod compute;
pub mod device;
pub mod error;
pub mod resources;
pub mod shader;
pub mod types;

pub use backend::{BackendType, GpuBackend};
pub use compute::{
    BindingKind, BindingSlot, BufferBinding, ComputeDispatch, ComputePipeline, ComputeShader,
    HostDispatch, HostKernel, workgroup_count,
};
pub use device::{DeviceCapabilities, DeviceParameters, DeviceStats, GraphicsDevice};
pub use error::GraphicsError;
pub use resources::Buffer;
pub use shader::{ShaderComposer, ShaderDef, ShaderDefines};
pub use types::{BufferDescriptor, BufferUsage};

/// Graphics library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
