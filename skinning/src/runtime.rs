//! Per-frame entry point tying the pool, the controller and the config
//! together.

use std::sync::Arc;

use avatar_core::compute::{IoRuntime, TickReport};
use avatar_graphics::GraphicsDevice;

use crate::animator::MeshAnimatorDescriptor;
use crate::config::SkinningConfig;
use crate::controller::{ControllerStats, SkinningController};
use crate::error::SkinningError;
use crate::format::decode_index_table;
use crate::pool::SkinningResourcePool;
use crate::primitive::ComputeSkinnedPrimitive;
use crate::renderable::{RenderableKind, SkinningRenderable};
use crate::source::{CompactSkinningDataId, SkinningDataSource};

/// What one [`SkinningRuntime::frame`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FrameReport {
    pub frame: u64,
    pub builders: TickReport,
    pub controller: ControllerStats,
}

/// Owns the skinning state of one device.
///
/// Call [`frame`](Self::frame) once per frame after renderables have called
/// [`SkinningRenderable::begin_skinning_update`].
pub struct SkinningRuntime {
    config: SkinningConfig,
    device: Arc<GraphicsDevice>,
    pool: Arc<SkinningResourcePool>,
    controller: SkinningController,
    frame: u64,
}

impl SkinningRuntime {
    pub fn new(
        device: Arc<GraphicsDevice>,
        source: Arc<dyn SkinningDataSource>,
        config: SkinningConfig,
    ) -> Result<Self, SkinningError> {
        config.validate()?;
        let pool = Arc::new(SkinningResourcePool::new(
            device.clone(),
            source,
            IoRuntime::new(),
            config.time_slice.budget(),
        ));
        log::info!(
            "SkinningRuntime ready: {:?} positions, {} joints per vertex, {:?} updates",
            config.position_output.format,
            config.max_joints_per_vertex,
            config.per_instance_updates.resolve(device.backend_type())
        );
        Ok(Self {
            config,
            device,
            pool,
            controller: SkinningController::new(),
            frame: 0,
        })
    }

    pub fn config(&self) -> &SkinningConfig {
        &self.config
    }

    pub fn device(&self) -> &Arc<GraphicsDevice> {
        &self.device
    }

    pub fn pool(&self) -> &Arc<SkinningResourcePool> {
        &self.pool
    }

    pub fn controller(&mut self) -> &mut SkinningController {
        &mut self.controller
    }

    pub fn frame_count(&self) -> u64 {
        self.frame
    }

    /// Requests the shared buffer for `id`, keeping the reorder table as is.
    pub fn request_primitive(&self, id: CompactSkinningDataId) -> ComputeSkinnedPrimitive {
        ComputeSkinnedPrimitive::new(&self.pool, id, decode_index_table)
    }

    /// Animator settings from the config for a mesh with these counts.
    pub fn animator_descriptor(
        &self,
        num_morph_targets: u32,
        num_joints: u32,
    ) -> MeshAnimatorDescriptor {
        MeshAnimatorDescriptor::from_config(&self.config, num_morph_targets, num_joints)
    }

    /// A renderable of the kind the config asks for, with its animator
    /// already created for `primitive`.
    pub fn create_renderable(
        &self,
        primitive: &ComputeSkinnedPrimitive,
        num_morph_targets: u32,
        num_joints: u32,
    ) -> Result<SkinningRenderable, SkinningError> {
        let mut renderable = SkinningRenderable::new(RenderableKind::select(&self.config.renderable));
        renderable.apply_mesh_primitive(
            &self.device,
            primitive,
            self.animator_descriptor(num_morph_targets, num_joints),
        )?;
        Ok(renderable)
    }

    /// Advances builders, then runs the controller.
    pub fn frame(&mut self) -> FrameReport {
        avatar_core::profile_function!();

        let builders = self.pool.update();
        let controller = self.controller.update();
        self.frame += 1;

        avatar_core::profile_plot!("skinning_live_buffers", self.pool.stats().live_buffers);
        avatar_core::frame_mark!();

        if controller.failures > 0 {
            log::warn!(
                "Frame {}: {} skinning updates failed",
                self.frame,
                controller.failures
            );
        }
        FrameReport {
            frame: self.frame,
            builders,
            controller,
        }
    }
}

impl std::fmt::Debug for SkinningRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SkinningRuntime")
            .field("backend", &self.device.backend_name())
            .field("frame", &self.frame)
            .field("pool", &self.pool.stats())
            .finish()
    }
}
