//! Per-instance skinning: joint and morph state, output slices and dispatch.

mod per_instance;

pub use per_instance::{PerInstanceBufferUpdater, PerInstanceUploadStats};

use std::sync::Arc;

use avatar_graphics::{Buffer, BufferDescriptor, GraphicsDevice};
use glam::{Mat4, Vec3};

use crate::config::{PerInstanceUpdates, PositionOutputConfig, SkinningConfig};
use crate::error::SkinningError;
use crate::format::{FRENET_STRIDE, PositionOutputFormat};
use crate::layout::{MeshInstanceMetaData, PerInstanceLayout, VertexInfo};
use crate::packed::PackedBufferWriter;
use crate::pool::RetainedVertexBuffer;
use crate::primitive::ComputeSkinnedPrimitive;
use crate::shader::{MeshAnimatorShader, SkinningBindings};

/// Most output slices an animator can cycle through.
pub const MAX_OUTPUT_SLICES: u32 = 3;

/// Static description of a [`MeshAnimator`].
#[derive(Debug, Clone, PartialEq)]
pub struct MeshAnimatorDescriptor {
    pub num_morph_targets: u32,
    pub num_joints: u32,
    /// 1, 2 or 3.
    pub output_slices: u32,
    pub position_output: PositionOutputConfig,
    pub max_joints_per_vertex: u32,
    pub client_space_transform: Mat4,
    pub per_instance_updates: PerInstanceUpdates,
}

impl Default for MeshAnimatorDescriptor {
    fn default() -> Self {
        Self {
            num_morph_targets: 0,
            num_joints: 0,
            output_slices: 1,
            position_output: PositionOutputConfig::default(),
            max_joints_per_vertex: 4,
            client_space_transform: Mat4::IDENTITY,
            per_instance_updates: PerInstanceUpdates::Auto,
        }
    }
}

impl MeshAnimatorDescriptor {
    pub fn new(num_morph_targets: u32, num_joints: u32) -> Self {
        Self {
            num_morph_targets,
            num_joints,
            ..Self::default()
        }
    }

    /// Output format, joint quality and upload strategy from `config`.
    pub fn from_config(config: &SkinningConfig, num_morph_targets: u32, num_joints: u32) -> Self {
        Self {
            position_output: config.position_output,
            max_joints_per_vertex: config.max_joints_per_vertex,
            per_instance_updates: config.per_instance_updates,
            ..Self::new(num_morph_targets, num_joints)
        }
    }

    pub fn with_output_slices(mut self, output_slices: u32) -> Self {
        self.output_slices = output_slices;
        self
    }

    pub fn with_position_output(mut self, position_output: PositionOutputConfig) -> Self {
        self.position_output = position_output;
        self
    }

    pub fn with_max_joints_per_vertex(mut self, max_joints: u32) -> Self {
        self.max_joints_per_vertex = max_joints;
        self
    }

    pub fn with_client_space_transform(mut self, transform: Mat4) -> Self {
        self.client_space_transform = transform;
        self
    }

    pub fn with_per_instance_updates(mut self, strategy: PerInstanceUpdates) -> Self {
        self.per_instance_updates = strategy;
        self
    }

    fn validate(&self) -> Result<(), SkinningError> {
        if !(1..=MAX_OUTPUT_SLICES).contains(&self.output_slices) {
            return Err(SkinningError::InvalidParameter(format!(
                "output slices must be 1, 2 or 3, got {}",
                self.output_slices
            )));
        }
        self.position_output
            .validate()
            .map_err(SkinningError::InvalidParameter)
    }
}

/// Skins one instance of a mesh.
///
/// Owns the per-instance buffer and both output buffers. Each output buffer
/// holds `output_slices` consecutive copies of the mesh; the write
/// destination picks the one the next dispatch fills.
pub struct MeshAnimator {
    device: Arc<GraphicsDevice>,
    vertex_buffer: RetainedVertexBuffer,
    descriptor: MeshAnimatorDescriptor,
    layout: PerInstanceLayout,
    num_vertices: u32,
    updater: PerInstanceBufferUpdater,
    position_buffer: Arc<Buffer>,
    frenet_buffer: Arc<Buffer>,
    shader: MeshAnimatorShader,
    morph_weights: Vec<f32>,
    write_destination: u32,
    dispatches: u64,
}

impl MeshAnimator {
    pub fn new(
        device: &Arc<GraphicsDevice>,
        primitive: &ComputeSkinnedPrimitive,
        descriptor: MeshAnimatorDescriptor,
    ) -> Result<Self, SkinningError> {
        avatar_core::profile_function!();

        descriptor.validate()?;
        let vertex_buffer = primitive.retain_vertex_buffer()?;
        let indices = primitive
            .mesh_and_compact_skinning_indices()
            .ok_or(SkinningError::NotReady)?;
        let num_vertices = indices.len() as u32;
        let layout =
            PerInstanceLayout::new(num_vertices, descriptor.num_joints, descriptor.num_morph_targets);

        let position = &descriptor.position_output;
        let mut writer = PackedBufferWriter::with_capacity(layout.size as usize);
        writer.push_pod(&MeshInstanceMetaData {
            vertex_buffer_meta_offset: 0,
            morph_weights_offset: layout.morph_weights_offset,
            joint_matrices_offset: layout.joint_matrices_offset,
            write_destination_offset: layout.write_destination_offset,
            num_morph_targets: descriptor.num_morph_targets,
            num_joints: descriptor.num_joints,
            num_output_vertices: num_vertices,
            _pad: 0,
            output_position_bias: position.bias().extend(0.0).to_array(),
            output_position_scale: position.scale().extend(1.0).to_array(),
        });
        let infos: Vec<VertexInfo> = indices
            .iter()
            .map(|v| VertexInfo {
                instance_meta_offset: 0,
                compact_index: v.compact_skinning_index,
                output_index: v.output_buffer_index,
            })
            .collect();
        writer.push_slice(&infos);
        writer.align_to(crate::layout::JOINT_MATRIX_ALIGNMENT);
        writer.push_slice(&vec![Mat4::IDENTITY; descriptor.num_joints as usize]);
        writer.push_slice(&vec![0.0f32; descriptor.num_morph_targets as usize]);
        writer.push_pod(&0u32);
        let initial = writer.finish();
        debug_assert_eq!(initial.len(), layout.size as usize);

        let id = vertex_buffer.id();
        let per_instance = device.create_buffer(
            &BufferDescriptor::storage(layout.size as u64)
                .with_label(format!("skinning per-instance {id}")),
        )?;
        let updater = PerInstanceBufferUpdater::new(
            device.clone(),
            per_instance,
            descriptor.per_instance_updates,
            initial,
        )?;

        let slice_vertices = num_vertices as u64 * descriptor.output_slices as u64;
        let position_buffer = device.create_buffer(
            &BufferDescriptor::storage(slice_vertices * position.format.stride() as u64)
                .with_label(format!("skinned positions {id}")),
        )?;
        let frenet_buffer = device.create_buffer(
            &BufferDescriptor::storage(slice_vertices * FRENET_STRIDE as u64)
                .with_label(format!("skinned frenet {id}")),
        )?;

        let mut shader = MeshAnimatorShader::new(
            device,
            &vertex_buffer,
            descriptor.output_slices,
            position,
            descriptor.max_joints_per_vertex,
        )?;
        shader.set_client_space_transform(descriptor.client_space_transform);

        log::debug!(
            "MeshAnimator for {id}: {num_vertices} vertices, {} joints, {} morphs, {} slices, {:?}",
            descriptor.num_joints,
            descriptor.num_morph_targets,
            descriptor.output_slices,
            updater.strategy()
        );

        Ok(Self {
            device: device.clone(),
            vertex_buffer,
            morph_weights: vec![0.0; descriptor.num_morph_targets as usize],
            descriptor,
            layout,
            num_vertices,
            updater,
            position_buffer,
            frenet_buffer,
            shader,
            write_destination: 0,
            dispatches: 0,
        })
    }

    pub fn descriptor(&self) -> &MeshAnimatorDescriptor {
        &self.descriptor
    }

    pub fn vertex_buffer(&self) -> &RetainedVertexBuffer {
        &self.vertex_buffer
    }

    pub fn num_vertices(&self) -> u32 {
        self.num_vertices
    }

    pub fn output_slices(&self) -> u32 {
        self.descriptor.output_slices
    }

    pub fn position_format(&self) -> PositionOutputFormat {
        self.descriptor.position_output.format
    }

    pub fn position_buffer(&self) -> &Arc<Buffer> {
        &self.position_buffer
    }

    pub fn frenet_buffer(&self) -> &Arc<Buffer> {
        &self.frenet_buffer
    }

    pub fn per_instance_buffer(&self) -> &Arc<Buffer> {
        self.updater.buffer()
    }

    pub fn per_instance_updates(&self) -> PerInstanceUpdates {
        self.updater.strategy()
    }

    pub fn upload_stats(&self) -> PerInstanceUploadStats {
        self.updater.stats()
    }

    pub fn shader(&self) -> &MeshAnimatorShader {
        &self.shader
    }

    pub fn write_destination(&self) -> u32 {
        self.write_destination
    }

    pub fn dispatch_count(&self) -> u64 {
        self.dispatches
    }

    /// Copies one column-major matrix per joint.
    pub fn set_joint_matrices(&mut self, matrices: &[Mat4]) -> Result<(), SkinningError> {
        if matrices.len() != self.descriptor.num_joints as usize {
            return Err(SkinningError::InvalidParameter(format!(
                "{} joint matrices for {} joints",
                matrices.len(),
                self.descriptor.num_joints
            )));
        }
        self.updater
            .write(self.layout.joint_matrices_offset, bytemuck::cast_slice(matrices))
    }

    pub fn set_morph_target_weights(&mut self, weights: &[f32]) -> Result<(), SkinningError> {
        if weights.len() != self.morph_weights.len() {
            return Err(SkinningError::InvalidParameter(format!(
                "{} morph weights for {} morph targets",
                weights.len(),
                self.morph_weights.len()
            )));
        }
        self.morph_weights.copy_from_slice(weights);
        self.morph_target_buffer_updated()
    }

    /// CPU-side morph weights for in-place editing. Call
    /// [`morph_target_buffer_updated`](Self::morph_target_buffer_updated)
    /// when done.
    pub fn checkout_morph_target_buffer(&mut self) -> &mut [f32] {
        &mut self.morph_weights
    }

    pub fn morph_target_buffer_updated(&mut self) -> Result<(), SkinningError> {
        self.updater.write(
            self.layout.morph_weights_offset,
            bytemuck::cast_slice(&self.morph_weights),
        )
    }

    /// Selects the output slice the next dispatch writes.
    pub fn set_write_destination(&mut self, slice: u32) -> Result<(), SkinningError> {
        if slice >= self.descriptor.output_slices {
            return Err(SkinningError::InvalidParameter(format!(
                "write destination {slice} out of range for {} slices",
                self.descriptor.output_slices
            )));
        }
        self.write_destination = slice;
        self.updater
            .write(self.layout.write_destination_offset, &slice.to_le_bytes())
    }

    pub fn set_client_space_transform(&mut self, transform: Mat4) {
        self.descriptor.client_space_transform = transform;
        self.shader.set_client_space_transform(transform);
    }

    /// Uploads pending per-instance state, then skins every vertex into the
    /// current write destination.
    pub fn update_outputs(&mut self) -> Result<(), SkinningError> {
        avatar_core::profile_function!();

        self.updater.flush()?;
        self.shader.dispatch(
            SkinningBindings {
                vertex_buffer: self.vertex_buffer.buffer().buffer(),
                per_instance: self.updater.buffer(),
                positions: &self.position_buffer,
                frenet: &self.frenet_buffer,
            },
            self.layout.vertex_infos_offset,
            0,
            self.num_vertices,
        )?;
        self.dispatches += 1;
        Ok(())
    }

    fn check_slice(&self, slice: u32) -> Result<(), SkinningError> {
        if slice >= self.descriptor.output_slices {
            return Err(SkinningError::InvalidParameter(format!(
                "slice {slice} out of range for {} slices",
                self.descriptor.output_slices
            )));
        }
        Ok(())
    }

    /// Reads back and decodes one slice of skinned positions, in output
    /// order.
    pub fn read_positions(&self, slice: u32) -> Result<Vec<Vec3>, SkinningError> {
        self.check_slice(slice)?;
        let output = &self.descriptor.position_output;
        let stride = output.format.stride() as u64;
        let size = self.num_vertices as u64 * stride;
        let bytes = self
            .device
            .read_buffer(&self.position_buffer, slice as u64 * size, size)?;
        bytes
            .chunks_exact(stride as usize)
            .map(|chunk| {
                output
                    .format
                    .decode(chunk, output.bias(), output.scale())
                    .ok_or_else(|| {
                        SkinningError::InvalidParameter("truncated position output".to_string())
                    })
            })
            .collect()
    }

    /// Reads back one slice of packed normal/tangent words, in output order.
    pub fn read_frenet(&self, slice: u32) -> Result<Vec<[u32; 2]>, SkinningError> {
        self.check_slice(slice)?;
        let size = self.num_vertices as u64 * FRENET_STRIDE as u64;
        let bytes = self
            .device
            .read_buffer(&self.frenet_buffer, slice as u64 * size, size)?;
        Ok(bytemuck::pod_collect_to_vec::<u8, [u32; 2]>(&bytes))
    }
}

impl std::fmt::Debug for MeshAnimator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshAnimator")
            .field("id", &self.vertex_buffer.id())
            .field("num_vertices", &self.num_vertices)
            .field("output_slices", &self.descriptor.output_slices)
            .field("write_destination", &self.write_destination)
            .finish()
    }
}

static_assertions::assert_impl_all!(MeshAnimator: Send);
