//! CPU execution of `skinning.comp` for the host backend.
//!
//! Reads go through 32-bit words exactly like the shader's `uint data[]`
//! views, so layout mistakes show up here the same way they would on a GPU.
//! Out-of-bounds accesses are reported as errors instead of reading zero.

use avatar_graphics::{GraphicsError, HostDispatch, HostKernel};
use glam::{Mat3, Mat4, Vec3, Vec4};
use half::f16;

use crate::format::{DataFormat, FRENET_STRIDE, PositionOutputFormat, pack_frenet, pack_normal};
use crate::layout::{
    FRENET_OUTPUT_BINDING, MeshInstanceMetaData, PER_INSTANCE_BUFFER_BINDING,
    POSITION_OUTPUT_BINDING, SkinningUniforms, UNIFORMS_BINDING, VERTEX_BUFFER_BINDING,
    VertexBufferMetaData, VertexInfo,
};
use crate::packed::PackedBufferReader;
use crate::shader::keywords;

/// Host mirror of the skinning compute shader.
#[derive(Debug, Default)]
pub struct HostSkinningKernel;

fn out_of_bounds(buffer: &str, addr: u64) -> GraphicsError {
    GraphicsError::InvalidParameter(format!("{buffer}: access at byte {addr} is out of bounds"))
}

/// A storage buffer addressed the way the shader addresses it.
#[derive(Clone, Copy)]
struct WordView<'a> {
    reader: PackedBufferReader<'a>,
    name: &'static str,
}

impl<'a> WordView<'a> {
    fn new(bytes: &'a [u8], name: &'static str) -> Self {
        Self {
            reader: PackedBufferReader::new(bytes),
            name,
        }
    }

    fn word(&self, byte_addr: u32) -> Result<u32, GraphicsError> {
        let aligned = (byte_addr & !3) as usize;
        self.reader
            .read_u32(aligned)
            .ok_or_else(|| out_of_bounds(self.name, aligned as u64))
    }

    fn float(&self, byte_addr: u32) -> Result<f32, GraphicsError> {
        self.word(byte_addr).map(f32::from_bits)
    }

    fn vec4(&self, byte_addr: u32) -> Result<Vec4, GraphicsError> {
        Ok(Vec4::new(
            self.float(byte_addr)?,
            self.float(byte_addr + 4)?,
            self.float(byte_addr + 8)?,
            self.float(byte_addr + 12)?,
        ))
    }

    fn mat4(&self, byte_addr: u32) -> Result<Mat4, GraphicsError> {
        Ok(Mat4::from_cols(
            self.vec4(byte_addr)?,
            self.vec4(byte_addr + 16)?,
            self.vec4(byte_addr + 32)?,
            self.vec4(byte_addr + 48)?,
        ))
    }

    fn real(&self, byte_addr: u32, format: u32) -> Result<f32, GraphicsError> {
        Ok(decode_real(self.word(byte_addr)?, byte_addr, format))
    }

    fn index(&self, byte_addr: u32, format: u32) -> Result<u32, GraphicsError> {
        Ok(decode_index(self.word(byte_addr)?, byte_addr, format))
    }

    fn vec3(&self, byte_addr: u32, format: u32) -> Result<Vec3, GraphicsError> {
        let size = component_size(format);
        Ok(Vec3::new(
            self.real(byte_addr, format)?,
            self.real(byte_addr + size, format)?,
            self.real(byte_addr + 2 * size, format)?,
        ))
    }

    fn read<T: bytemuck::Pod>(&self, byte_addr: u32) -> Result<T, GraphicsError> {
        self.reader
            .read(byte_addr as usize)
            .ok_or_else(|| out_of_bounds(self.name, byte_addr as u64))
    }
}

fn component_size(format: u32) -> u32 {
    DataFormat::from_raw(format).map_or(2, DataFormat::component_size)
}

fn extract_u8(word: u32, byte_addr: u32) -> u32 {
    (word >> ((byte_addr & 3) * 8)) & 0xFF
}

fn extract_u16(word: u32, byte_addr: u32) -> u32 {
    (word >> ((byte_addr & 2) * 8)) & 0xFFFF
}

fn decode_real(word: u32, byte_addr: u32, format: u32) -> f32 {
    match DataFormat::from_raw(format) {
        Some(DataFormat::F32) => f32::from_bits(word),
        Some(DataFormat::F16) => f16::from_bits(extract_u16(word, byte_addr) as u16).to_f32(),
        Some(DataFormat::Unorm16) => extract_u16(word, byte_addr) as f32 / 65535.0,
        Some(DataFormat::Unorm8) => extract_u8(word, byte_addr) as f32 / 255.0,
        Some(DataFormat::Snorm16) => {
            (extract_u16(word, byte_addr) as u16 as i16 as f32 / 32767.0).max(-1.0)
        }
        Some(DataFormat::Snorm8) => (extract_u8(word, byte_addr) as u8 as i8 as f32 / 127.0).max(-1.0),
        _ => 0.0,
    }
}

fn decode_index(word: u32, byte_addr: u32, format: u32) -> u32 {
    match DataFormat::from_raw(format) {
        Some(DataFormat::U8) => extract_u8(word, byte_addr),
        Some(DataFormat::U16) => extract_u16(word, byte_addr),
        _ => word,
    }
}

/// Keyword-selected variant of the shader.
#[derive(Debug, Clone, Copy)]
struct Permutation {
    slices: u32,
    has_tangents: bool,
    morph_index_format: DataFormat,
    next_entry_format: DataFormat,
}

impl Permutation {
    fn from_dispatch(dispatch: &HostDispatch<'_>) -> Self {
        let slices = if dispatch.is_defined(keywords::TRIPLE_BUFFER_OUTPUT) {
            3
        } else if dispatch.is_defined(keywords::DOUBLE_BUFFER_OUTPUT) {
            2
        } else {
            1
        };
        let morph_index_format = if dispatch.is_defined(keywords::MORPH_INDEX_FORMAT_UINT16) {
            DataFormat::U16
        } else {
            DataFormat::U8
        };
        let next_entry_format = if dispatch.is_defined(keywords::NEXT_ENTRY_FORMAT_UINT32) {
            DataFormat::U32
        } else if dispatch.is_defined(keywords::NEXT_ENTRY_FORMAT_UINT16) {
            DataFormat::U16
        } else {
            DataFormat::U8
        };
        Self {
            slices,
            has_tangents: dispatch.is_defined(keywords::HAS_TANGENTS),
            morph_index_format,
            next_entry_format,
        }
    }
}

struct Invocation<'a> {
    permutation: Permutation,
    uniforms: &'a SkinningUniforms,
    vertex_buffer: WordView<'a>,
    per_instance: WordView<'a>,
}

/// Skinned attributes of one vertex and where they go.
struct SkinnedVertex {
    element: u32,
    position: Vec3,
    output_bias: Vec3,
    output_scale: Vec3,
    frenet: [u32; 2],
}

impl Invocation<'_> {
    fn skin(&self, vertex: u32) -> Result<Option<SkinnedVertex>, GraphicsError> {
        let u = self.uniforms;
        let vb = &self.vertex_buffer;
        let pi = &self.per_instance;

        let info: VertexInfo = pi.read(u.vertex_info_offset() + vertex * 12)?;
        let instance: MeshInstanceMetaData = pi.read(info.instance_meta_offset)?;
        let meta: VertexBufferMetaData = vb.read(instance.vertex_buffer_meta_offset)?;
        let c = info.compact_index;
        if c >= meta.num_verts || info.output_index >= instance.num_output_vertices {
            return Ok(None);
        }

        let [pos_format, pos_stride, normal_format, normal_stride] = u.positions_normals;
        let input_scale = Vec4::from_array(meta.input_position_scale).truncate();
        let input_bias = Vec4::from_array(meta.input_position_bias).truncate();
        let mut position =
            vb.vec3(meta.positions_offset + c * pos_stride, pos_format)? * input_scale + input_bias;
        let mut normal = vb.vec3(meta.normals_offset + c * normal_stride, normal_format)?;
        let mut tangent = Vec4::ZERO;
        if self.permutation.has_tangents {
            let [tangent_format, tangent_stride, _, _] = u.tangents_joint_weights;
            let addr = meta.tangents_offset + c * tangent_stride;
            tangent = vb.vec3(addr, tangent_format)?.extend(
                vb.real(addr + 3 * component_size(tangent_format), tangent_format)?,
            );
        }

        if meta.morph_position_deltas_offset != 0 {
            let count = vb.word(meta.vertex_morph_counts_offset + c * 4)?;
            let [_, _, morph_pos_format, morph_pos_stride] = u.joint_indices_morph_positions;
            let [morph_normal_format, morph_normal_stride, morph_tangent_format, morph_tangent_stride] =
                u.morph_normals_tangents;
            let morph_index_size = self.permutation.morph_index_format.component_size();
            let next_size = self.permutation.next_entry_format.component_size();
            let mut entry = c;
            for _ in 0..count {
                if entry >= meta.num_morph_entries {
                    break;
                }
                let morph = vb.index(
                    meta.morph_indices_offset + entry * morph_index_size,
                    self.permutation.morph_index_format as u32,
                )?;
                if morph < instance.num_morph_targets {
                    let weight = pi.float(instance.morph_weights_offset + morph * 4)?;
                    if weight != 0.0 {
                        position += weight
                            * vb.vec3(
                                meta.morph_position_deltas_offset + entry * morph_pos_stride,
                                morph_pos_format,
                            )?;
                        if meta.morph_normal_deltas_offset != 0 {
                            normal += weight
                                * vb.vec3(
                                    meta.morph_normal_deltas_offset + entry * morph_normal_stride,
                                    morph_normal_format,
                                )?;
                        }
                        if self.permutation.has_tangents && meta.morph_tangent_deltas_offset != 0 {
                            let delta = vb.vec3(
                                meta.morph_tangent_deltas_offset + entry * morph_tangent_stride,
                                morph_tangent_format,
                            )?;
                            tangent += (weight * delta).extend(0.0);
                        }
                    }
                }
                entry = vb.index(
                    meta.morph_next_entries_offset + entry * next_size,
                    self.permutation.next_entry_format as u32,
                )?;
            }
        }

        let client = u.client_space_transform();
        let client_linear = Mat3::from_mat4(client);
        position = (client * position.extend(1.0)).truncate();
        normal = client_linear * normal;
        tangent = (client_linear * tangent.truncate()).extend(tangent.w);

        let joints_per_vertex = meta.num_joints_per_vertex.min(u.max_joints());
        if joints_per_vertex > 0 && instance.num_joints > 0 {
            let [_, _, weight_format, weight_stride] = u.tangents_joint_weights;
            let [index_format, index_stride, _, _] = u.joint_indices_morph_positions;
            let weight_addr = meta.joint_weights_offset + c * weight_stride;
            let index_addr = meta.joint_indices_offset + c * index_stride;
            let mut columns = [Vec4::ZERO; 4];
            let mut total = 0.0;
            for j in 0..joints_per_vertex {
                let weight = vb.real(weight_addr + j * component_size(weight_format), weight_format)?;
                if weight > 0.0 {
                    let joint = vb
                        .index(index_addr + j * component_size(index_format), index_format)?
                        .min(instance.num_joints - 1);
                    let matrix = pi.mat4(instance.joint_matrices_offset + joint * 64)?;
                    for (column, k) in columns.iter_mut().zip(0..4) {
                        *column += weight * matrix.col(k);
                    }
                    total += weight;
                }
            }
            if total > 0.0 {
                let inv = 1.0 / total;
                let skin = Mat4::from_cols(
                    columns[0] * inv,
                    columns[1] * inv,
                    columns[2] * inv,
                    columns[3] * inv,
                );
                let skin_linear = Mat3::from_mat4(skin);
                position = (skin * position.extend(1.0)).truncate();
                normal = skin_linear * normal;
                tangent = (skin_linear * tangent.truncate()).extend(tangent.w);
            }
        }

        if normal.length_squared() > 0.0 {
            normal = normal.normalize();
        }

        let write_destination = pi.word(instance.write_destination_offset)?;
        let slice = write_destination.min(self.permutation.slices - 1);
        let element = slice * instance.num_output_vertices + info.output_index;

        let frenet = if self.permutation.has_tangents {
            let mut direction = tangent.truncate();
            if direction.length_squared() > 0.0 {
                direction = direction.normalize();
            }
            pack_frenet(normal, direction.extend(tangent.w * u.bitangent_flip()))
        } else {
            [pack_normal(normal), 0]
        };

        Ok(Some(SkinnedVertex {
            element,
            position,
            output_bias: Vec4::from_array(instance.output_position_bias).truncate(),
            output_scale: Vec4::from_array(instance.output_position_scale).truncate(),
            frenet,
        }))
    }
}

impl HostKernel for HostSkinningKernel {
    fn execute(&self, dispatch: &mut HostDispatch<'_>) -> Result<(), GraphicsError> {
        let permutation = Permutation::from_dispatch(dispatch);
        let uniforms: SkinningUniforms = PackedBufferReader::new(dispatch.read(UNIFORMS_BINDING)?)
            .read(0)
            .ok_or_else(|| out_of_bounds("uniforms", 0))?;
        let output_format = uniforms.output_format().ok_or_else(|| {
            GraphicsError::InvalidParameter(format!(
                "unknown position output format {}",
                uniforms.position_output[0]
            ))
        })?;
        let stride = uniforms.output_stride();
        if stride != output_format.stride() {
            return Err(GraphicsError::InvalidParameter(format!(
                "output stride {stride} does not match {output_format:?}"
            )));
        }

        let invocation = Invocation {
            permutation,
            uniforms: &uniforms,
            vertex_buffer: WordView::new(dispatch.read(VERTEX_BUFFER_BINDING)?, "vertex buffer"),
            per_instance: WordView::new(
                dispatch.read(PER_INSTANCE_BUFFER_BINDING)?,
                "per-instance buffer",
            ),
        };
        let positions = dispatch.take_write(POSITION_OUTPUT_BINDING)?;
        let frenets = dispatch.take_write(FRENET_OUTPUT_BINDING)?;

        for id in 0..dispatch.invocations_x() {
            let vertex = id + uniforms.start_vertex();
            if vertex >= uniforms.end_vertex() {
                continue;
            }
            let Some(skinned) = invocation.skin(vertex)? else {
                continue;
            };
            write_position(positions, output_format, &skinned)?;
            write_frenet(frenets, &skinned)?;
        }
        Ok(())
    }
}

fn write_position(
    out: &mut [u8],
    format: PositionOutputFormat,
    skinned: &SkinnedVertex,
) -> Result<(), GraphicsError> {
    let stride = format.stride() as usize;
    let start = skinned.element as usize * stride;
    let slot = out
        .get_mut(start..start + stride)
        .ok_or_else(|| out_of_bounds("position output", start as u64))?;
    format.encode(skinned.position, skinned.output_bias, skinned.output_scale, slot);
    Ok(())
}

fn write_frenet(out: &mut [u8], skinned: &SkinnedVertex) -> Result<(), GraphicsError> {
    let start = (skinned.element * FRENET_STRIDE) as usize;
    let slot = out
        .get_mut(start..start + FRENET_STRIDE as usize)
        .ok_or_else(|| out_of_bounds("frenet output", start as u64))?;
    slot[..4].copy_from_slice(&skinned.frenet[0].to_le_bytes());
    slot[4..].copy_from_slice(&skinned.frenet[1].to_le_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_reads_mirror_shader_extraction() {
        let bytes = [0x11, 0x22, 0x33, 0x44, 0xFF, 0x7F, 0x00, 0x80];
        let view = WordView::new(&bytes, "test");
        assert_eq!(view.index(1, DataFormat::U8 as u32).unwrap(), 0x22);
        assert_eq!(view.index(2, DataFormat::U16 as u32).unwrap(), 0x4433);
        assert_eq!(view.index(0, DataFormat::U32 as u32).unwrap(), 0x4433_2211);
        assert_eq!(view.real(4, DataFormat::Snorm16 as u32).unwrap(), 1.0);
        assert_eq!(view.real(6, DataFormat::Snorm16 as u32).unwrap(), -1.0);
        assert!(view.word(8).is_err());
    }

    #[test]
    fn half_decoding() {
        let word = f16::from_f32(0.5).to_bits() as u32 | ((f16::from_f32(-2.0).to_bits() as u32) << 16);
        assert_eq!(decode_real(word, 0, DataFormat::F16 as u32), 0.5);
        assert_eq!(decode_real(word, 2, DataFormat::F16 as u32), -2.0);
    }
}
