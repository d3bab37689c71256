//! # Avatar Skinning
//!
//! GPU compute skinning for VR avatars.
//!
//! ## Overview
//!
//! - [`SkinningResourcePool`] - one [`SharedVertexBuffer`] per compact skinning
//!   data id, built over several frames and shared by every mesh using it
//! - [`ComputeSkinnedPrimitive`] - a mesh's handle on its shared buffer plus the
//!   mesh-to-compact vertex mapping
//! - [`MeshAnimator`] - per-instance joint and morph state, output slices and
//!   dispatch through [`MeshAnimatorShader`]
//! - [`SkinningController`] - runs the frame's registered work in order
//! - [`SkinningRenderable`] - picks write and read slices for the renderer
//! - [`SkinningRuntime`] - owns all of the above for one device
//!
//! ## Example
//!
//! ```ignore
//! use avatar_skinning::{SkinningConfig, SkinningRuntime};
//!
//! let mut runtime = SkinningRuntime::new(device, source, SkinningConfig::default())?;
//! let primitive = runtime.request_primitive(id);
//! while primitive.is_loading() {
//!     runtime.frame();
//! }
//! let mut renderable = runtime.create_renderable(&primitive, morphs, joints)?;
//! renderable.update_joint_matrices(&pose)?;
//! renderable.begin_skinning_update(runtime.controller())?;
//! runtime.frame();
//! ```

pub mod animator;
pub mod builder;
pub mod config;
pub mod controller;
pub mod error;
pub mod format;
pub mod kernel;
pub mod layout;
pub mod packed;
pub mod pool;
pub mod primitive;
pub mod renderable;
pub mod runtime;
pub mod shader;
pub mod source;
pub mod vertex_buffer;

pub use animator::{
    MAX_OUTPUT_SLICES, MeshAnimator, MeshAnimatorDescriptor, PerInstanceBufferUpdater,
    PerInstanceUploadStats,
};
pub use builder::VertexBufferBuilder;
pub use config::{
    PerInstanceUpdates, PositionOutputConfig, RenderableConfig, SkinningConfig, TimeSliceConfig,
};
pub use controller::{
    ControllerStats, MorphTargetCombiner, SkinningController, SkinningDispatcher, TextureSkinner,
};
pub use error::{SkinningError, SourceError};
pub use format::{DataFormat, IndexFormat, PositionOutputFormat};
pub use kernel::HostSkinningKernel;
pub use pool::{PendingLoad, PoolStats, RetainedVertexBuffer, SkinningResourcePool, VertexBufferInfo};
pub use primitive::{ComputeSkinnedPrimitive, PrimitiveState, VertexIndices, bucket_sort_vertex_indices};
pub use renderable::{RenderBinding, RenderableKind, SkinningRenderable};
pub use runtime::{FrameReport, SkinningRuntime};
pub use shader::{MeshAnimatorShader, ShaderPermutation};
pub use source::{
    AttributeInfo, CompactSkinningDataId, InMemorySkinningSource, MeshSkinningData, MorphTarget,
    NormalizationParams, SkinningAttribute, SkinningDataSource,
};
pub use vertex_buffer::SharedVertexBuffer;

/// Skinning library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
