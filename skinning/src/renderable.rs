//! Renderer-facing wrappers around a [`MeshAnimator`].
//!
//! A renderable owns the animator of one mesh instance and decides which
//! output slice each frame writes and which slices the renderer reads.

use std::collections::VecDeque;
use std::sync::Arc;

use avatar_graphics::{Buffer, GraphicsDevice};
use glam::{Mat4, Vec3};
use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};

use crate::animator::{MeshAnimator, MeshAnimatorDescriptor};
use crate::config::RenderableConfig;
use crate::controller::{SharedDispatcher, SkinningController};
use crate::error::SkinningError;
use crate::format::PositionOutputFormat;
use crate::primitive::ComputeSkinnedPrimitive;

/// How many frames of skinned output a renderable keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RenderableKind {
    /// One slice, overwritten every frame.
    Normal,
    /// Current and previous frame, for motion vectors.
    MotionVector,
    /// Three slices: the frame being skinned plus the two latest completed
    /// frames the renderer interpolates between.
    Interpolated,
}

impl RenderableKind {
    pub fn output_slices(self) -> u32 {
        match self {
            Self::Normal => 1,
            Self::MotionVector => 2,
            Self::Interpolated => 3,
        }
    }

    /// Motion smoothing wins over motion vectors.
    pub fn select(config: &RenderableConfig) -> Self {
        if config.motion_smoothing {
            Self::Interpolated
        } else if config.motion_vectors {
            Self::MotionVector
        } else {
            Self::Normal
        }
    }
}

/// Everything a draw needs to consume skinned output.
#[derive(Debug, Clone)]
pub struct RenderBinding {
    pub position_buffer: Arc<Buffer>,
    pub frenet_buffer: Arc<Buffer>,
    pub position_format: PositionOutputFormat,
    pub position_bias: Vec3,
    pub position_scale: Vec3,
    pub num_vertices: u32,
    pub current_slice: u32,
    pub previous_slice: u32,
    /// Blend factor from `previous_slice` to `current_slice`.
    pub interpolation: f32,
}

pub struct SkinningRenderable {
    kind: RenderableKind,
    animator: Option<Arc<Mutex<MeshAnimator>>>,
    in_flight: Option<u32>,
    /// Animator dispatch count when `in_flight` was handed out. The slice is
    /// written once the count moves past it.
    in_flight_dispatches: u64,
    completed: VecDeque<u32>,
    interpolation: f32,
}

impl SkinningRenderable {
    pub fn new(kind: RenderableKind) -> Self {
        Self {
            kind,
            animator: None,
            in_flight: None,
            in_flight_dispatches: 0,
            completed: VecDeque::with_capacity(2),
            interpolation: 1.0,
        }
    }

    pub fn kind(&self) -> RenderableKind {
        self.kind
    }

    pub fn animator(&self) -> Option<&Arc<Mutex<MeshAnimator>>> {
        self.animator.as_ref()
    }

    pub fn is_ready(&self) -> bool {
        self.animator.is_some()
    }

    /// Creates the animator for `primitive`. The slice count always comes
    /// from the renderable kind.
    pub fn apply_mesh_primitive(
        &mut self,
        device: &Arc<GraphicsDevice>,
        primitive: &ComputeSkinnedPrimitive,
        descriptor: MeshAnimatorDescriptor,
    ) -> Result<(), SkinningError> {
        let descriptor = descriptor.with_output_slices(self.kind.output_slices());
        let animator = MeshAnimator::new(device, primitive, descriptor)?;
        self.animator = Some(Arc::new(Mutex::new(animator)));
        self.in_flight = None;
        self.in_flight_dispatches = 0;
        self.completed.clear();
        Ok(())
    }

    fn animator_or_not_ready(&self) -> Result<&Arc<Mutex<MeshAnimator>>, SkinningError> {
        self.animator.as_ref().ok_or(SkinningError::NotReady)
    }

    pub fn update_joint_matrices(&self, matrices: &[Mat4]) -> Result<(), SkinningError> {
        self.animator_or_not_ready()?.lock().set_joint_matrices(matrices)
    }

    /// Locks the animator and exposes its morph weights. Call
    /// [`morph_target_buffer_updated`](Self::morph_target_buffer_updated)
    /// after the guard is dropped.
    pub fn checkout_morph_target_buffer(
        &self,
    ) -> Result<MappedMutexGuard<'_, [f32]>, SkinningError> {
        let animator = self.animator_or_not_ready()?;
        Ok(MutexGuard::map(animator.lock(), |a| {
            a.checkout_morph_target_buffer()
        }))
    }

    pub fn morph_target_buffer_updated(&self) -> Result<(), SkinningError> {
        self.animator_or_not_ready()?.lock().morph_target_buffer_updated()
    }

    /// The slice the next skinning update writes.
    pub fn next_write_slice(&self) -> u32 {
        let slices = self.kind.output_slices();
        match self.in_flight.or_else(|| self.completed.back().copied()) {
            Some(last) => (last + 1) % slices,
            None => 0,
        }
    }

    /// Retires last frame's slice if it was written, points the animator at
    /// the next one and registers it with `controller`.
    pub fn begin_skinning_update(
        &mut self,
        controller: &mut SkinningController,
    ) -> Result<u32, SkinningError> {
        let animator = self.animator_or_not_ready()?.clone();
        let slot = self.next_write_slice();
        let dispatches = {
            let mut animator = animator.lock();
            animator.set_write_destination(slot)?;
            animator.dispatch_count()
        };

        // A slot whose update never ran holds stale data; it is dropped
        // instead of retired.
        if let Some(done) = self
            .in_flight
            .take()
            .filter(|_| dispatches > self.in_flight_dispatches)
        {
            if self.completed.len() == 2 {
                self.completed.pop_front();
            }
            self.completed.push_back(done);
        }
        self.in_flight = Some(slot);
        self.in_flight_dispatches = dispatches;

        let dispatcher: SharedDispatcher = animator;
        controller.add_active_animator(dispatcher);
        Ok(slot)
    }

    /// Blend factor for interpolated rendering, clamped to `[0, 1]`.
    pub fn set_interpolation_value(&mut self, value: f32) {
        self.interpolation = if value.is_nan() { 1.0 } else { value.clamp(0.0, 1.0) };
    }

    pub fn in_flight_slice(&self) -> Option<u32> {
        self.in_flight
    }

    /// Oldest first.
    pub fn completed_slices(&self) -> impl Iterator<Item = u32> + '_ {
        self.completed.iter().copied()
    }

    /// The slices to draw from, or `None` while nothing readable exists.
    ///
    /// Only slices the animator has dispatched are returned. Interpolated
    /// renderables additionally never read the slice of the current frame.
    pub fn render_binding(&self) -> Option<RenderBinding> {
        let animator = self.animator.as_ref()?.lock();
        let written = self
            .in_flight
            .filter(|_| animator.dispatch_count() > self.in_flight_dispatches);
        let (current, previous, interpolation) = match self.kind {
            RenderableKind::Normal => {
                written.or_else(|| self.completed.back().copied())?;
                (0, 0, 1.0)
            }
            RenderableKind::MotionVector => {
                let current = written.or_else(|| self.completed.back().copied())?;
                let previous = self
                    .completed
                    .iter()
                    .rev()
                    .copied()
                    .find(|&s| s != current)
                    .unwrap_or(current);
                (current, previous, 1.0)
            }
            RenderableKind::Interpolated => {
                let current = *self.completed.back()?;
                let previous = if self.completed.len() > 1 {
                    self.completed[0]
                } else {
                    current
                };
                (current, previous, self.interpolation)
            }
        };

        let output = &animator.descriptor().position_output;
        Some(RenderBinding {
            position_buffer: animator.position_buffer().clone(),
            frenet_buffer: animator.frenet_buffer().clone(),
            position_format: output.format,
            position_bias: output.bias(),
            position_scale: output.scale(),
            num_vertices: animator.num_vertices(),
            current_slice: current,
            previous_slice: previous,
            interpolation,
        })
    }
}

impl std::fmt::Debug for SkinningRenderable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SkinningRenderable")
            .field("kind", &self.kind)
            .field("ready", &self.is_ready())
            .field("in_flight", &self.in_flight)
            .field("in_flight_dispatches", &self.in_flight_dispatches)
            .field("completed", &self.completed)
            .finish()
    }
}
