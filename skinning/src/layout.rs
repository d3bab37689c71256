//! Memory layouts shared between the CPU and the skinning compute shader.
//!
//! These structs are copied byte for byte into GPU buffers; field order and
//! sizes must match `shaders/skinning.comp`.

use bytemuck::{Pod, Zeroable};
use glam::Mat4;
use static_assertions::const_assert_eq;

use crate::format::PositionOutputFormat;

pub const VERTEX_BUFFER_BINDING: u32 = 0;
pub const PER_INSTANCE_BUFFER_BINDING: u32 = 1;
pub const POSITION_OUTPUT_BINDING: u32 = 2;
pub const FRENET_OUTPUT_BINDING: u32 = 3;
pub const UNIFORMS_BINDING: u32 = 4;

/// Threads per workgroup of the skinning shader.
pub const WORKGROUP_SIZE: u32 = 64;

/// Offset alignment of the joint matrix block in the per-instance buffer.
pub const JOINT_MATRIX_ALIGNMENT: usize = 16;

/// Header of the shared vertex buffer.
///
/// Offsets are in bytes from the start of the buffer. Zero marks an absent
/// sub-array since the header itself occupies offset zero.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct VertexBufferMetaData {
    pub positions_offset: u32,
    pub normals_offset: u32,
    pub tangents_offset: u32,
    pub joint_weights_offset: u32,
    pub joint_indices_offset: u32,
    pub morph_position_deltas_offset: u32,
    pub morph_normal_deltas_offset: u32,
    pub morph_tangent_deltas_offset: u32,
    pub morph_indices_offset: u32,
    pub morph_next_entries_offset: u32,
    pub vertex_morph_counts_offset: u32,
    pub num_verts: u32,
    pub num_morph_entries: u32,
    /// 4 with joint data, 0 without.
    pub num_joints_per_vertex: u32,
    pub _pad: [u32; 2],
    pub input_position_bias: [f32; 4],
    pub input_position_scale: [f32; 4],
}

const_assert_eq!(std::mem::size_of::<VertexBufferMetaData>(), 96);

impl VertexBufferMetaData {
    pub fn has_morphs(&self) -> bool {
        self.morph_position_deltas_offset != 0 && self.num_morph_entries > 0
    }

    pub fn has_joints(&self) -> bool {
        self.num_joints_per_vertex > 0
    }
}

/// Header of a per-instance buffer. Offsets are in bytes from the start of
/// the per-instance buffer, except `vertex_buffer_meta_offset` which points
/// into the shared vertex buffer.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct MeshInstanceMetaData {
    pub vertex_buffer_meta_offset: u32,
    pub morph_weights_offset: u32,
    pub joint_matrices_offset: u32,
    pub write_destination_offset: u32,
    pub num_morph_targets: u32,
    pub num_joints: u32,
    pub num_output_vertices: u32,
    pub _pad: u32,
    pub output_position_bias: [f32; 4],
    pub output_position_scale: [f32; 4],
}

const_assert_eq!(std::mem::size_of::<MeshInstanceMetaData>(), 64);

/// One entry per skinned vertex, sorted by compact index.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct VertexInfo {
    /// Offset of the owning [`MeshInstanceMetaData`].
    pub instance_meta_offset: u32,
    pub compact_index: u32,
    pub output_index: u32,
}

const_assert_eq!(std::mem::size_of::<VertexInfo>(), 12);

/// Byte offsets of every section of a per-instance buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PerInstanceLayout {
    pub vertex_infos_offset: u32,
    pub joint_matrices_offset: u32,
    pub morph_weights_offset: u32,
    pub write_destination_offset: u32,
    pub size: u32,
}

impl PerInstanceLayout {
    pub fn new(num_verts: u32, num_joints: u32, num_morph_targets: u32) -> Self {
        let meta = std::mem::size_of::<MeshInstanceMetaData>();
        let vertex_infos = meta;
        let joints = crate::packed::align_up(
            vertex_infos + num_verts as usize * std::mem::size_of::<VertexInfo>(),
            JOINT_MATRIX_ALIGNMENT,
        );
        let weights = joints + num_joints as usize * std::mem::size_of::<Mat4>();
        let write_destination = weights + num_morph_targets as usize * 4;
        Self {
            vertex_infos_offset: vertex_infos as u32,
            joint_matrices_offset: joints as u32,
            morph_weights_offset: weights as u32,
            write_destination_offset: write_destination as u32,
            size: (write_destination + 4) as u32,
        }
    }
}

/// Uniform block of the skinning shader (std140).
///
/// Each `[u32; 4]` row carries two (format, stride) pairs.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct SkinningUniforms {
    pub client_space_transform: [[f32; 4]; 4],
    /// Position format, position stride, normal format, normal stride.
    pub positions_normals: [u32; 4],
    /// Tangent format and stride, joint weight format and stride.
    pub tangents_joint_weights: [u32; 4],
    /// Joint index format and stride, morph position delta format and stride.
    pub joint_indices_morph_positions: [u32; 4],
    /// Morph normal delta format and stride, morph tangent delta format and stride.
    pub morph_normals_tangents: [u32; 4],
    /// Output format, output stride, max joints per vertex, unused.
    pub position_output: [u32; 4],
    /// First vertex, end vertex, vertex info offset, unused.
    pub vertex_range: [u32; 4],
    /// `x` is the bitangent sign flip.
    pub bitangent_flip: [f32; 4],
}

const_assert_eq!(std::mem::size_of::<SkinningUniforms>(), 176);

impl SkinningUniforms {
    pub fn client_space_transform(&self) -> Mat4 {
        Mat4::from_cols_array_2d(&self.client_space_transform)
    }

    pub fn output_format(&self) -> Option<PositionOutputFormat> {
        Some(match self.position_output[0] {
            0 => PositionOutputFormat::Float,
            1 => PositionOutputFormat::Half,
            2 => PositionOutputFormat::Unorm16,
            3 => PositionOutputFormat::Unorm8,
            _ => return None,
        })
    }

    pub fn output_stride(&self) -> u32 {
        self.position_output[1]
    }

    pub fn max_joints(&self) -> u32 {
        self.position_output[2]
    }

    pub fn start_vertex(&self) -> u32 {
        self.vertex_range[0]
    }

    pub fn end_vertex(&self) -> u32 {
        self.vertex_range[1]
    }

    pub fn vertex_info_offset(&self) -> u32 {
        self.vertex_range[2]
    }

    pub fn bitangent_flip(&self) -> f32 {
        self.bitangent_flip[0]
    }
}
