//! The skinning compute shader and its per-animator dispatch state.

use std::sync::{Arc, OnceLock};

use avatar_graphics::{
    BindingKind, BindingSlot, Buffer, BufferBinding, BufferDescriptor, ComputeDispatch,
    ComputePipeline, ComputeShader, GraphicsDevice, ShaderDefines, workgroup_count,
};
use glam::Mat4;

use crate::config::PositionOutputConfig;
use crate::error::SkinningError;
use crate::format::IndexFormat;
use crate::kernel::HostSkinningKernel;
use crate::layout::{
    FRENET_OUTPUT_BINDING, PER_INSTANCE_BUFFER_BINDING, POSITION_OUTPUT_BINDING, SkinningUniforms,
    UNIFORMS_BINDING, VERTEX_BUFFER_BINDING, WORKGROUP_SIZE,
};
use crate::vertex_buffer::{AttributeLayout, SharedVertexBuffer};

/// Keywords understood by `skinning.comp`.
pub mod keywords {
    pub const DOUBLE_BUFFER_OUTPUT: &str = "OVR_DOUBLE_BUFFER_OUTPUT";
    pub const TRIPLE_BUFFER_OUTPUT: &str = "OVR_TRIPLE_BUFFER_OUTPUT";
    pub const HAS_TANGENTS: &str = "OVR_HAS_TANGENTS";
    pub const MORPH_INDEX_FORMAT_UINT16: &str = "OVR_MORPH_INDEX_FORMAT_UINT16";
    pub const NEXT_ENTRY_FORMAT_UINT16: &str = "OVR_NEXT_ENTRY_FORMAT_UINT16";
    pub const NEXT_ENTRY_FORMAT_UINT32: &str = "OVR_NEXT_ENTRY_FORMAT_UINT32";
}

pub const SHADER_LABEL: &str = "ovr_skinning";

const SKINNING_SOURCE: &str = include_str!("shaders/skinning.comp");
const PACKING_INCLUDE_PATH: &str = "ovr/skinning_packing.glsl";
const PACKING_SOURCE: &str = include_str!("shaders/ovr/skinning_packing.glsl");

/// The skinning compute shader, built once per process.
pub fn skinning_shader() -> Arc<ComputeShader> {
    static SHADER: OnceLock<Arc<ComputeShader>> = OnceLock::new();
    SHADER
        .get_or_init(|| {
            Arc::new(
                ComputeShader::new(SHADER_LABEL, SKINNING_SOURCE)
                    .with_include(PACKING_INCLUDE_PATH, PACKING_SOURCE)
                    .with_workgroup_size([WORKGROUP_SIZE, 1, 1])
                    .with_binding(BindingSlot::new(
                        "_VertexBuffer",
                        VERTEX_BUFFER_BINDING,
                        BindingKind::StorageRead,
                    ))
                    .with_binding(BindingSlot::new(
                        "_PerInstanceBuffer",
                        PER_INSTANCE_BUFFER_BINDING,
                        BindingKind::StorageRead,
                    ))
                    .with_binding(BindingSlot::new(
                        "_PositionOutputBuffer",
                        POSITION_OUTPUT_BINDING,
                        BindingKind::StorageReadWrite,
                    ))
                    .with_binding(BindingSlot::new(
                        "_FrenetOutputBuffer",
                        FRENET_OUTPUT_BINDING,
                        BindingKind::StorageReadWrite,
                    ))
                    .with_binding(BindingSlot::new(
                        "_Uniforms",
                        UNIFORMS_BINDING,
                        BindingKind::Uniform,
                    ))
                    .with_host_kernel(Arc::new(HostSkinningKernel)),
            )
        })
        .clone()
}

/// Sign applied to the reconstructed bitangent.
///
/// Approximates the handedness of `transform` from its diagonal only, which
/// is exact for the axis flips client spaces actually use.
pub fn bitangent_sign_flip(transform: Mat4) -> f32 {
    if transform.x_axis.x * transform.y_axis.y * transform.z_axis.z < 0.0 {
        -1.0
    } else {
        1.0
    }
}

/// Keyword set selected for one animator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShaderPermutation {
    pub output_slices: u32,
    pub has_tangents: bool,
    pub morph_index_format: IndexFormat,
    pub next_entry_format: IndexFormat,
}

impl ShaderPermutation {
    pub fn new(vertex_buffer: &SharedVertexBuffer, output_slices: u32) -> Self {
        Self {
            output_slices,
            has_tangents: vertex_buffer.has_tangents(),
            morph_index_format: vertex_buffer.morph_index_format().unwrap_or(IndexFormat::U8),
            next_entry_format: vertex_buffer.next_entry_format().unwrap_or(IndexFormat::U8),
        }
    }

    pub fn defines(&self) -> ShaderDefines {
        let mut defines = ShaderDefines::new();
        match self.output_slices {
            2 => {
                defines.enable(keywords::DOUBLE_BUFFER_OUTPUT);
            }
            3 => {
                defines.enable(keywords::TRIPLE_BUFFER_OUTPUT);
            }
            _ => {}
        }
        if self.has_tangents {
            defines.enable(keywords::HAS_TANGENTS);
        }
        if self.morph_index_format == IndexFormat::U16 {
            defines.enable(keywords::MORPH_INDEX_FORMAT_UINT16);
        }
        match self.next_entry_format {
            IndexFormat::U8 => {}
            IndexFormat::U16 => {
                defines.enable(keywords::NEXT_ENTRY_FORMAT_UINT16);
            }
            IndexFormat::U32 => {
                defines.enable(keywords::NEXT_ENTRY_FORMAT_UINT32);
            }
        }
        defines
    }

    /// Every keyword combination the shader supports.
    pub fn all() -> impl Iterator<Item = Self> {
        (1..=3).flat_map(|output_slices| {
            [false, true].into_iter().flat_map(move |has_tangents| {
                [IndexFormat::U8, IndexFormat::U16]
                    .into_iter()
                    .flat_map(move |morph_index_format| {
                        [IndexFormat::U8, IndexFormat::U16, IndexFormat::U32]
                            .into_iter()
                            .map(move |next_entry_format| Self {
                                output_slices,
                                has_tangents,
                                morph_index_format,
                                next_entry_format,
                            })
                    })
            })
        })
    }
}

/// Buffers bound for one dispatch.
#[derive(Debug, Clone, Copy)]
pub struct SkinningBindings<'a> {
    pub vertex_buffer: &'a Buffer,
    pub per_instance: &'a Buffer,
    pub positions: &'a Buffer,
    pub frenet: &'a Buffer,
}

/// Wraps the skinning shader for one animator.
///
/// Keywords are fixed at construction. Every dispatch rewrites the uniform
/// block and covers `[start_vertex, end_vertex)`.
pub struct MeshAnimatorShader {
    device: Arc<GraphicsDevice>,
    pipeline: Arc<ComputePipeline>,
    permutation: ShaderPermutation,
    uniform_buffer: Arc<Buffer>,
    uniforms: SkinningUniforms,
}

impl MeshAnimatorShader {
    pub fn new(
        device: &Arc<GraphicsDevice>,
        vertex_buffer: &SharedVertexBuffer,
        output_slices: u32,
        output: &PositionOutputConfig,
        max_joints_per_vertex: u32,
    ) -> Result<Self, SkinningError> {
        if !(1..=3).contains(&output_slices) {
            return Err(SkinningError::InvalidParameter(format!(
                "output slices must be 1, 2 or 3, got {output_slices}"
            )));
        }
        crate::config::validate_max_joints(max_joints_per_vertex)
            .map_err(SkinningError::InvalidParameter)?;

        let permutation = ShaderPermutation::new(vertex_buffer, output_slices);
        let pipeline = device.create_compute_pipeline(&skinning_shader(), &permutation.defines())?;
        let uniform_buffer = device.create_buffer(
            &BufferDescriptor::uniform(std::mem::size_of::<SkinningUniforms>() as u64)
                .with_label(format!("skinning uniforms {}", vertex_buffer.id())),
        )?;

        let formats = vertex_buffer.formats();
        let [pos_format, pos_stride] = AttributeLayout::uniform_pair(formats.positions);
        let [normal_format, normal_stride] = AttributeLayout::uniform_pair(formats.normals);
        let [tangent_format, tangent_stride] = AttributeLayout::uniform_pair(formats.tangents);
        let [weight_format, weight_stride] = AttributeLayout::uniform_pair(formats.joint_weights);
        let [index_format, index_stride] = AttributeLayout::uniform_pair(formats.joint_indices);
        let [morph_pos_format, morph_pos_stride] =
            AttributeLayout::uniform_pair(formats.morph_position_deltas);
        let [morph_normal_format, morph_normal_stride] =
            AttributeLayout::uniform_pair(formats.morph_normal_deltas);
        let [morph_tangent_format, morph_tangent_stride] =
            AttributeLayout::uniform_pair(formats.morph_tangent_deltas);

        let uniforms = SkinningUniforms {
            client_space_transform: Mat4::IDENTITY.to_cols_array_2d(),
            positions_normals: [pos_format, pos_stride, normal_format, normal_stride],
            tangents_joint_weights: [tangent_format, tangent_stride, weight_format, weight_stride],
            joint_indices_morph_positions: [
                index_format,
                index_stride,
                morph_pos_format,
                morph_pos_stride,
            ],
            morph_normals_tangents: [
                morph_normal_format,
                morph_normal_stride,
                morph_tangent_format,
                morph_tangent_stride,
            ],
            position_output: [
                output.format as u32,
                output.format.stride(),
                max_joints_per_vertex,
                0,
            ],
            vertex_range: [0; 4],
            bitangent_flip: [1.0, 0.0, 0.0, 0.0],
        };

        log::debug!(
            "MeshAnimatorShader for {}: [{}]",
            vertex_buffer.id(),
            pipeline.defines()
        );

        Ok(Self {
            device: device.clone(),
            pipeline,
            permutation,
            uniform_buffer,
            uniforms,
        })
    }

    pub fn permutation(&self) -> ShaderPermutation {
        self.permutation
    }

    pub fn uniforms(&self) -> &SkinningUniforms {
        &self.uniforms
    }

    pub fn uniform_buffer(&self) -> &Arc<Buffer> {
        &self.uniform_buffer
    }

    /// Sets the transform applied before skinning, and the bitangent flip
    /// derived from it.
    pub fn set_client_space_transform(&mut self, transform: Mat4) {
        self.uniforms.client_space_transform = transform.to_cols_array_2d();
        self.uniforms.bitangent_flip[0] = bitangent_sign_flip(transform);
    }

    pub fn set_max_joints_per_vertex(&mut self, max_joints: u32) -> Result<(), SkinningError> {
        crate::config::validate_max_joints(max_joints).map_err(SkinningError::InvalidParameter)?;
        self.uniforms.position_output[2] = max_joints;
        Ok(())
    }

    /// Uploads the uniforms and dispatches one thread per vertex in
    /// `[start_vertex, end_vertex)`.
    pub fn dispatch(
        &mut self,
        bindings: SkinningBindings<'_>,
        vertex_info_offset: u32,
        start_vertex: u32,
        end_vertex: u32,
    ) -> Result<(), SkinningError> {
        avatar_core::profile_function!();

        if end_vertex < start_vertex {
            return Err(SkinningError::InvalidParameter(format!(
                "vertex range {start_vertex}..{end_vertex} is reversed"
            )));
        }
        self.uniforms.vertex_range = [start_vertex, end_vertex, vertex_info_offset, 0];
        self.device
            .write_buffer(&self.uniform_buffer, 0, bytemuck::bytes_of(&self.uniforms))?;

        let buffers = [
            BufferBinding::new(VERTEX_BUFFER_BINDING, bindings.vertex_buffer),
            BufferBinding::new(PER_INSTANCE_BUFFER_BINDING, bindings.per_instance),
            BufferBinding::new(POSITION_OUTPUT_BINDING, bindings.positions),
            BufferBinding::new(FRENET_OUTPUT_BINDING, bindings.frenet),
            BufferBinding::new(UNIFORMS_BINDING, &self.uniform_buffer),
        ];
        self.device.dispatch(&ComputeDispatch {
            pipeline: &self.pipeline,
            bindings: &buffers,
            workgroups: [workgroup_count(end_vertex - start_vertex, WORKGROUP_SIZE), 1, 1],
        })?;
        Ok(())
    }
}

impl std::fmt::Debug for MeshAnimatorShader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshAnimatorShader")
            .field("permutation", &self.permutation)
            .field("bitangent_flip", &self.uniforms.bitangent_flip[0])
            .finish()
    }
}
