//! The shared, immutable vertex buffer built once per mesh.

use std::collections::HashMap;
use std::sync::Arc;

use avatar_graphics::{Buffer, BufferDescriptor, GraphicsDevice};
use glam::Vec3;

use crate::error::SkinningError;
use crate::format::{DataFormat, IndexFormat, decode_index_table};
use crate::layout::VertexBufferMetaData;
use crate::packed::{AlignedBytes, PackedBufferWriter};
use crate::source::{AttributeInfo, CompactSkinningDataId, NormalizationParams, SkinningAttribute};

/// Raw attribute bytes as copied from the source.
#[derive(Debug, Clone)]
pub struct FetchedAttribute {
    pub attribute: SkinningAttribute,
    pub info: AttributeInfo,
    pub bytes: AlignedBytes,
    pub normalization: Option<NormalizationParams>,
}

/// Format and stride of one sub-array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributeLayout {
    pub format: DataFormat,
    pub stride: u32,
}

impl AttributeLayout {
    /// `(format, stride)` as written into the shader uniforms. Absent
    /// attributes report zeros.
    pub fn uniform_pair(layout: Option<Self>) -> [u32; 2] {
        layout.map_or([0, 0], |l| [l.format as u32, l.stride])
    }
}

impl From<AttributeInfo> for AttributeLayout {
    fn from(info: AttributeInfo) -> Self {
        Self {
            format: info.format,
            stride: info.stride,
        }
    }
}

/// Per-sub-array layouts of a [`SharedVertexBuffer`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VertexBufferFormats {
    pub positions: Option<AttributeLayout>,
    pub normals: Option<AttributeLayout>,
    pub tangents: Option<AttributeLayout>,
    pub joint_weights: Option<AttributeLayout>,
    pub joint_indices: Option<AttributeLayout>,
    pub morph_position_deltas: Option<AttributeLayout>,
    pub morph_normal_deltas: Option<AttributeLayout>,
    pub morph_tangent_deltas: Option<AttributeLayout>,
}

/// Mesh vertex to compact vertex table, kept on the CPU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InverseReorderTable {
    pub format: IndexFormat,
    pub count: u32,
    pub bytes: Vec<u8>,
}

impl InverseReorderTable {
    pub fn decode(&self) -> Vec<u32> {
        decode_index_table(&self.bytes, self.format, self.count)
    }
}

/// A packed vertex buffer ready for upload.
#[derive(Debug, Clone)]
pub struct PackedVertexBuffer {
    pub meta: VertexBufferMetaData,
    pub formats: VertexBufferFormats,
    pub morph_index_format: Option<IndexFormat>,
    pub next_entry_format: Option<IndexFormat>,
    pub input_normalization: NormalizationParams,
    pub inverse_reorder: InverseReorderTable,
    pub bytes: Vec<u8>,
}

fn take_required(
    attributes: &mut HashMap<SkinningAttribute, FetchedAttribute>,
    attribute: SkinningAttribute,
) -> Result<FetchedAttribute, SkinningError> {
    attributes
        .remove(&attribute)
        .ok_or(SkinningError::DataNotAvailable(attribute))
}

fn expect_real(fetched: &FetchedAttribute) -> Result<(), SkinningError> {
    if fetched.info.format.is_real() {
        Ok(())
    } else {
        Err(SkinningError::BuildFailure(format!(
            "{} stored as {:?}, expected a real format",
            fetched.attribute, fetched.info.format
        )))
    }
}

fn index_format_of(fetched: &FetchedAttribute) -> Result<IndexFormat, String> {
    fetched.info.format.index_format().ok_or_else(|| {
        format!(
            "{} stored as {:?}, expected an integer format",
            fetched.attribute, fetched.info.format
        )
    })
}

/// Drops `attribute` unless it has `count` elements of a real format.
fn take_optional_real(
    attributes: &mut HashMap<SkinningAttribute, FetchedAttribute>,
    attribute: SkinningAttribute,
    count: u32,
) -> Option<FetchedAttribute> {
    let fetched = attributes.remove(&attribute)?;
    if fetched.info.count != count {
        log::warn!(
            "Ignoring {attribute}: {} elements, expected {count}",
            fetched.info.count
        );
        return None;
    }
    if !fetched.info.format.is_real() {
        log::warn!("Ignoring {attribute}: unsupported format {:?}", fetched.info.format);
        return None;
    }
    Some(fetched)
}

struct JointData {
    weights: FetchedAttribute,
    indices: FetchedAttribute,
}

fn resolve_joints(
    attributes: &mut HashMap<SkinningAttribute, FetchedAttribute>,
    num_verts: u32,
) -> Option<JointData> {
    let weights = take_optional_real(attributes, SkinningAttribute::JointWeights, num_verts);
    let indices = attributes.remove(&SkinningAttribute::JointIndices);
    match (weights, indices) {
        (None, None) => None,
        (Some(weights), Some(indices)) => {
            if indices.info.count != num_verts {
                log::warn!(
                    "Skinning disabled: {} joint indices for {num_verts} vertices",
                    indices.info.count
                );
                return None;
            }
            if let Err(msg) = index_format_of(&indices) {
                log::warn!("Skinning disabled: {msg}");
                return None;
            }
            Some(JointData { weights, indices })
        }
        (Some(_), None) => {
            log::warn!("Skinning disabled: joint weights without joint indices");
            None
        }
        (None, Some(_)) => {
            log::warn!("Skinning disabled: joint indices without usable joint weights");
            None
        }
    }
}

struct MorphData {
    position_deltas: FetchedAttribute,
    normal_deltas: Option<FetchedAttribute>,
    tangent_deltas: Option<FetchedAttribute>,
    indices: FetchedAttribute,
    index_format: IndexFormat,
    next_entries: FetchedAttribute,
    next_format: IndexFormat,
    counts: Vec<u32>,
}

fn resolve_morphs(
    attributes: &mut HashMap<SkinningAttribute, FetchedAttribute>,
    num_verts: u32,
) -> Option<MorphData> {
    let position_deltas = attributes.remove(&SkinningAttribute::MorphPositionDeltas);
    let indices = attributes.remove(&SkinningAttribute::MorphIndices);
    let next_entries = attributes.remove(&SkinningAttribute::MorphNextEntries);
    let counts = attributes.remove(&SkinningAttribute::VertexMorphCounts);

    let (position_deltas, indices, next_entries, counts) =
        match (position_deltas, indices, next_entries, counts) {
            (Some(p), Some(i), Some(n), Some(c)) => (p, i, n, c),
            (None, None, None, None) => return None,
            _ => {
                log::warn!("Morph targets disabled: incomplete morph data");
                return None;
            }
        };

    let entries = position_deltas.info.count;
    let problem = if !position_deltas.info.format.is_real() {
        Some(format!(
            "unsupported delta format {:?}",
            position_deltas.info.format
        ))
    } else if indices.info.count != entries || next_entries.info.count != entries {
        Some(format!(
            "{entries} deltas but {} indices and {} next entries",
            indices.info.count, next_entries.info.count
        ))
    } else if entries < num_verts {
        Some(format!("{entries} entries cannot head {num_verts} vertex lists"))
    } else if counts.info.count != num_verts {
        Some(format!(
            "{} morph counts for {num_verts} vertices",
            counts.info.count
        ))
    } else {
        None
    };
    if let Some(problem) = problem {
        log::warn!("Morph targets disabled: {problem}");
        return None;
    }

    let formats = (
        index_format_of(&indices),
        index_format_of(&next_entries),
        index_format_of(&counts),
    );
    let (index_format, next_format, count_format) = match formats {
        (Ok(IndexFormat::U32), _, _) => {
            log::warn!("Morph targets disabled: 32-bit morph indices are not supported");
            return None;
        }
        (Ok(i), Ok(n), Ok(c)) => (i, n, c),
        (Err(msg), _, _) | (_, Err(msg), _) | (_, _, Err(msg)) => {
            log::warn!("Morph targets disabled: {msg}");
            return None;
        }
    };

    // The shader walks both tables with keyword-selected, tightly packed widths.
    if indices.info.stride != index_format.size()
        || next_entries.info.stride != next_format.size()
        || counts.info.stride != count_format.size()
    {
        log::warn!("Morph targets disabled: morph index tables must be tightly packed");
        return None;
    }

    let counts = decode_index_table(counts.bytes.as_bytes(), count_format, num_verts);
    Some(MorphData {
        normal_deltas: take_optional_real(attributes, SkinningAttribute::MorphNormalDeltas, entries),
        tangent_deltas: take_optional_real(attributes, SkinningAttribute::MorphTangentDeltas, entries),
        position_deltas,
        indices,
        index_format,
        next_entries,
        next_format,
        counts,
    })
}

fn push_attribute(writer: &mut PackedBufferWriter, fetched: &FetchedAttribute) -> u32 {
    let len = fetched.info.byte_size().min(fetched.bytes.len());
    writer.push_bytes(&fetched.bytes.as_bytes()[..len], 4)
}

/// Validates fetched attributes and lays them out behind a
/// [`VertexBufferMetaData`] header.
///
/// Missing required attributes are errors. Optional groups that are
/// incomplete or inconsistent are dropped with a warning.
pub fn pack_vertex_buffer(
    mut attributes: HashMap<SkinningAttribute, FetchedAttribute>,
) -> Result<PackedVertexBuffer, SkinningError> {
    let positions = take_required(&mut attributes, SkinningAttribute::Positions)?;
    let normals = take_required(&mut attributes, SkinningAttribute::Normals)?;
    let reorder = take_required(&mut attributes, SkinningAttribute::InverseReorder)?;

    expect_real(&positions)?;
    expect_real(&normals)?;
    let num_verts = positions.info.count;
    if num_verts == 0 {
        return Err(SkinningError::BuildFailure("mesh has no vertices".to_string()));
    }
    if normals.info.count != num_verts {
        return Err(SkinningError::BuildFailure(format!(
            "{} normals for {num_verts} positions",
            normals.info.count
        )));
    }
    let reorder_format = index_format_of(&reorder).map_err(SkinningError::BuildFailure)?;
    for fetched in [&positions, &normals, &reorder] {
        if fetched.bytes.len() < fetched.info.byte_size() {
            return Err(SkinningError::BuildFailure(format!(
                "{} holds {} bytes, expected {}",
                fetched.attribute,
                fetched.bytes.len(),
                fetched.info.byte_size()
            )));
        }
    }

    let tangents = take_optional_real(&mut attributes, SkinningAttribute::Tangents, num_verts);
    let joints = resolve_joints(&mut attributes, num_verts);
    let morphs = resolve_morphs(&mut attributes, num_verts);

    let mut formats = VertexBufferFormats {
        positions: Some(positions.info.into()),
        normals: Some(normals.info.into()),
        ..Default::default()
    };
    let normalization = positions.normalization.unwrap_or_default();
    let mut meta = VertexBufferMetaData {
        num_verts,
        input_position_bias: normalization.bias.extend(0.0).to_array(),
        input_position_scale: normalization.scale.extend(1.0).to_array(),
        ..Default::default()
    };

    let mut writer = PackedBufferWriter::new();
    let header = writer.reserve::<VertexBufferMetaData>();
    meta.positions_offset = push_attribute(&mut writer, &positions);
    meta.normals_offset = push_attribute(&mut writer, &normals);
    if let Some(tangents) = &tangents {
        meta.tangents_offset = push_attribute(&mut writer, tangents);
        formats.tangents = Some(tangents.info.into());
    }
    if let Some(joints) = &joints {
        meta.joint_weights_offset = push_attribute(&mut writer, &joints.weights);
        meta.joint_indices_offset = push_attribute(&mut writer, &joints.indices);
        meta.num_joints_per_vertex = 4;
        formats.joint_weights = Some(joints.weights.info.into());
        formats.joint_indices = Some(joints.indices.info.into());
    }
    let (mut morph_index_format, mut next_entry_format) = (None, None);
    if let Some(morphs) = &morphs {
        meta.morph_position_deltas_offset = push_attribute(&mut writer, &morphs.position_deltas);
        formats.morph_position_deltas = Some(morphs.position_deltas.info.into());
        if let Some(normals) = &morphs.normal_deltas {
            meta.morph_normal_deltas_offset = push_attribute(&mut writer, normals);
            formats.morph_normal_deltas = Some(normals.info.into());
        }
        if let Some(tangents) = &morphs.tangent_deltas {
            meta.morph_tangent_deltas_offset = push_attribute(&mut writer, tangents);
            formats.morph_tangent_deltas = Some(tangents.info.into());
        }
        meta.morph_indices_offset = push_attribute(&mut writer, &morphs.indices);
        meta.morph_next_entries_offset = push_attribute(&mut writer, &morphs.next_entries);
        meta.vertex_morph_counts_offset = writer.push_slice(&morphs.counts);
        meta.num_morph_entries = morphs.position_deltas.info.count;
        morph_index_format = Some(morphs.index_format);
        next_entry_format = Some(morphs.next_format);
    }
    writer.write_pod_at(header, &meta);

    for leftover in attributes.keys() {
        log::debug!("Ignoring unused {leftover}");
    }

    Ok(PackedVertexBuffer {
        meta,
        formats,
        morph_index_format,
        next_entry_format,
        input_normalization: normalization,
        inverse_reorder: InverseReorderTable {
            format: reorder_format,
            count: reorder.info.count,
            bytes: reorder.bytes.as_bytes()[..reorder.info.byte_size()].to_vec(),
        },
        bytes: writer.finish(),
    })
}

/// GPU-resident skinning source data for one mesh.
///
/// Immutable after upload and shared by every animator of the mesh.
pub struct SharedVertexBuffer {
    id: CompactSkinningDataId,
    buffer: Arc<Buffer>,
    meta: VertexBufferMetaData,
    formats: VertexBufferFormats,
    morph_index_format: Option<IndexFormat>,
    next_entry_format: Option<IndexFormat>,
    input_normalization: NormalizationParams,
    inverse_reorder: InverseReorderTable,
}

impl SharedVertexBuffer {
    /// Creates the GPU buffer and uploads `packed` in a single write.
    pub fn upload(
        device: &Arc<GraphicsDevice>,
        id: CompactSkinningDataId,
        packed: PackedVertexBuffer,
    ) -> Result<Self, SkinningError> {
        let descriptor = BufferDescriptor::storage(packed.bytes.len() as u64)
            .with_label(format!("skinning vertex buffer {id}"));
        let buffer = device.create_buffer(&descriptor)?;
        device.write_buffer(&buffer, 0, &packed.bytes)?;
        log::debug!(
            "Uploaded vertex buffer {id}: {} verts, {} morph entries, {} bytes",
            packed.meta.num_verts,
            packed.meta.num_morph_entries,
            packed.bytes.len()
        );
        Ok(Self {
            id,
            buffer,
            meta: packed.meta,
            formats: packed.formats,
            morph_index_format: packed.morph_index_format,
            next_entry_format: packed.next_entry_format,
            input_normalization: packed.input_normalization,
            inverse_reorder: packed.inverse_reorder,
        })
    }

    pub fn id(&self) -> CompactSkinningDataId {
        self.id
    }

    pub fn buffer(&self) -> &Arc<Buffer> {
        &self.buffer
    }

    pub fn meta(&self) -> &VertexBufferMetaData {
        &self.meta
    }

    pub fn formats(&self) -> &VertexBufferFormats {
        &self.formats
    }

    pub fn num_verts(&self) -> u32 {
        self.meta.num_verts
    }

    pub fn has_tangents(&self) -> bool {
        self.formats.tangents.is_some()
    }

    pub fn has_joints(&self) -> bool {
        self.meta.has_joints()
    }

    pub fn has_morphs(&self) -> bool {
        self.meta.has_morphs()
    }

    pub fn morph_index_format(&self) -> Option<IndexFormat> {
        self.morph_index_format
    }

    pub fn next_entry_format(&self) -> Option<IndexFormat> {
        self.next_entry_format
    }

    pub fn input_normalization(&self) -> NormalizationParams {
        self.input_normalization
    }

    pub fn input_position_bias(&self) -> Vec3 {
        self.input_normalization.bias
    }

    pub fn inverse_reorder(&self) -> &InverseReorderTable {
        &self.inverse_reorder
    }
}

impl Drop for SharedVertexBuffer {
    fn drop(&mut self) {
        log::trace!("Freeing shared vertex buffer {}", self.id);
    }
}

impl std::fmt::Debug for SharedVertexBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedVertexBuffer")
            .field("id", &self.id)
            .field("num_verts", &self.meta.num_verts)
            .field("num_morph_entries", &self.meta.num_morph_entries)
            .field("has_tangents", &self.has_tangents())
            .field("size", &self.buffer.size())
            .finish()
    }
}

static_assertions::assert_impl_all!(SharedVertexBuffer: Send, Sync);
