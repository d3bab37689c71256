//! Skinning data sources.
//!
//! A [`SkinningDataSource`] is the boundary to the asset pipeline: it reports
//! the layout of each attribute and copies its raw bytes on request.
//! [`InMemorySkinningSource`] is a complete implementation backed by
//! [`MeshSkinningData`], used by tools and tests.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use glam::{Vec3, Vec4};
use parking_lot::{Mutex, RwLock};

use crate::error::SourceError;
use crate::format::{DataFormat, IndexFormat};

/// Identifies one mesh's skinning source data. Shared by every instance of the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CompactSkinningDataId(pub u64);

impl fmt::Display for CompactSkinningDataId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Logical sub-arrays of the shared vertex buffer, in fetch order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SkinningAttribute {
    Positions,
    Normals,
    Tangents,
    JointWeights,
    JointIndices,
    MorphPositionDeltas,
    MorphNormalDeltas,
    MorphTangentDeltas,
    MorphIndices,
    MorphNextEntries,
    VertexMorphCounts,
    InverseReorder,
}

impl SkinningAttribute {
    pub const ALL: [SkinningAttribute; 12] = [
        Self::Positions,
        Self::Normals,
        Self::Tangents,
        Self::JointWeights,
        Self::JointIndices,
        Self::MorphPositionDeltas,
        Self::MorphNormalDeltas,
        Self::MorphTangentDeltas,
        Self::MorphIndices,
        Self::MorphNextEntries,
        Self::VertexMorphCounts,
        Self::InverseReorder,
    ];

    /// A build fails without this attribute.
    pub fn is_required(self) -> bool {
        matches!(self, Self::Positions | Self::Normals | Self::InverseReorder)
    }

    /// Whether the attribute holds integer indices rather than real values.
    pub fn is_index(self) -> bool {
        matches!(
            self,
            Self::JointIndices
                | Self::MorphIndices
                | Self::MorphNextEntries
                | Self::VertexMorphCounts
                | Self::InverseReorder
        )
    }

    /// Components per element.
    pub fn components(self) -> u32 {
        match self {
            Self::Positions
            | Self::Normals
            | Self::MorphPositionDeltas
            | Self::MorphNormalDeltas
            | Self::MorphTangentDeltas => 3,
            Self::Tangents | Self::JointWeights | Self::JointIndices => 4,
            Self::MorphIndices
            | Self::MorphNextEntries
            | Self::VertexMorphCounts
            | Self::InverseReorder => 1,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Positions => "positions",
            Self::Normals => "normals",
            Self::Tangents => "tangents",
            Self::JointWeights => "joint weights",
            Self::JointIndices => "joint indices",
            Self::MorphPositionDeltas => "morph position deltas",
            Self::MorphNormalDeltas => "morph normal deltas",
            Self::MorphTangentDeltas => "morph tangent deltas",
            Self::MorphIndices => "morph indices",
            Self::MorphNextEntries => "morph next entries",
            Self::VertexMorphCounts => "vertex morph counts",
            Self::InverseReorder => "inverse reorder",
        }
    }
}

impl fmt::Display for SkinningAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Layout of one attribute as stored by the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributeInfo {
    /// Number of elements.
    pub count: u32,
    pub format: DataFormat,
    /// Bytes between consecutive elements.
    pub stride: u32,
}

impl AttributeInfo {
    pub fn new(count: u32, format: DataFormat, stride: u32) -> Self {
        Self {
            count,
            format,
            stride,
        }
    }

    /// Tightly packed layout for `attribute`.
    pub fn packed(attribute: SkinningAttribute, count: u32, format: DataFormat) -> Self {
        Self::new(count, format, attribute.components() * format.component_size())
    }

    pub fn byte_size(&self) -> usize {
        self.count as usize * self.stride as usize
    }
}

/// Remapping applied to normalized positions: `p = n * scale + bias`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormalizationParams {
    pub bias: Vec3,
    pub scale: Vec3,
}

impl NormalizationParams {
    pub const IDENTITY: Self = Self {
        bias: Vec3::ZERO,
        scale: Vec3::ONE,
    };

    pub fn new(bias: Vec3, scale: Vec3) -> Self {
        Self { bias, scale }
    }
}

impl Default for NormalizationParams {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Provider of raw skinning attributes.
///
/// Called from worker threads, so implementations must be thread safe.
pub trait SkinningDataSource: Send + Sync {
    /// Reports the layout of `attribute`, or `DataNotAvailable` when the asset
    /// has none.
    fn attribute_info(
        &self,
        id: CompactSkinningDataId,
        attribute: SkinningAttribute,
    ) -> Result<AttributeInfo, SourceError>;

    /// Copies `attribute` into `dest` with elements `stride` bytes apart.
    ///
    /// Returns normalization parameters for attributes stored normalized.
    fn copy_attribute(
        &self,
        id: CompactSkinningDataId,
        attribute: SkinningAttribute,
        dest: &mut [u8],
        stride: u32,
    ) -> Result<Option<NormalizationParams>, SourceError>;

    /// The GPU buffer for `id` is uploaded; CPU-side copies may be released.
    fn compact_skinning_data_loaded(&self, _id: CompactSkinningDataId) {}
}

/// One morph target's per-vertex deltas.
#[derive(Debug, Clone, Default)]
pub struct MorphTarget {
    pub position_deltas: Vec<Vec3>,
    pub normal_deltas: Option<Vec<Vec3>>,
    pub tangent_deltas: Option<Vec<Vec3>>,
}

impl MorphTarget {
    pub fn new(position_deltas: Vec<Vec3>) -> Self {
        Self {
            position_deltas,
            normal_deltas: None,
            tangent_deltas: None,
        }
    }

    pub fn with_normal_deltas(mut self, deltas: Vec<Vec3>) -> Self {
        self.normal_deltas = Some(deltas);
        self
    }

    pub fn with_tangent_deltas(mut self, deltas: Vec<Vec3>) -> Self {
        self.tangent_deltas = Some(deltas);
        self
    }
}

/// Decoded mesh skinning data, encoded on demand into source attributes.
#[derive(Debug, Clone)]
pub struct MeshSkinningData {
    pub positions: Vec<Vec3>,
    pub normals: Vec<Vec3>,
    pub tangents: Option<Vec<Vec4>>,
    pub joint_indices: Option<Vec<[u16; 4]>>,
    pub joint_weights: Option<Vec<[f32; 4]>>,
    pub morph_targets: Vec<MorphTarget>,
    /// Mesh vertex to compact vertex. Identity when `None`.
    pub inverse_reorder: Option<Vec<u32>>,
    pub position_format: DataFormat,
    pub normal_format: DataFormat,
    pub tangent_format: DataFormat,
    pub joint_weight_format: DataFormat,
    pub morph_delta_format: DataFormat,
}

impl MeshSkinningData {
    pub fn new(positions: Vec<Vec3>, normals: Vec<Vec3>) -> Self {
        Self {
            positions,
            normals,
            tangents: None,
            joint_indices: None,
            joint_weights: None,
            morph_targets: Vec::new(),
            inverse_reorder: None,
            position_format: DataFormat::F32,
            normal_format: DataFormat::F32,
            tangent_format: DataFormat::F32,
            joint_weight_format: DataFormat::F32,
            morph_delta_format: DataFormat::F32,
        }
    }

    pub fn with_tangents(mut self, tangents: Vec<Vec4>) -> Self {
        self.tangents = Some(tangents);
        self
    }

    pub fn with_joints(mut self, indices: Vec<[u16; 4]>, weights: Vec<[f32; 4]>) -> Self {
        self.joint_indices = Some(indices);
        self.joint_weights = Some(weights);
        self
    }

    pub fn with_morph_target(mut self, target: MorphTarget) -> Self {
        self.morph_targets.push(target);
        self
    }

    pub fn with_inverse_reorder(mut self, table: Vec<u32>) -> Self {
        self.inverse_reorder = Some(table);
        self
    }

    /// Stores positions in `format`. Normalized formats get a bias/scale
    /// window fitted to the bounds of the mesh.
    pub fn with_position_format(mut self, format: DataFormat) -> Self {
        self.position_format = format;
        self
    }

    pub fn with_normal_format(mut self, format: DataFormat) -> Self {
        self.normal_format = format;
        self
    }

    pub fn with_joint_weight_format(mut self, format: DataFormat) -> Self {
        self.joint_weight_format = format;
        self
    }

    pub fn with_morph_delta_format(mut self, format: DataFormat) -> Self {
        self.morph_delta_format = format;
        self
    }

    pub fn num_verts(&self) -> u32 {
        self.positions.len() as u32
    }

    /// Number of mesh vertices described by the inverse reorder table.
    pub fn num_mesh_vertices(&self) -> u32 {
        self.inverse_reorder
            .as_ref()
            .map_or(self.num_verts(), |table| table.len() as u32)
    }

    /// Encodes every available attribute.
    pub fn encode(&self) -> EncodedMesh {
        let mut attributes = HashMap::new();
        let n = self.num_verts();

        let normalization = position_normalization(&self.positions, self.position_format);
        let window = normalization.unwrap_or_default();
        let positions = self
            .positions
            .iter()
            .map(|p| (*p - window.bias) / window.scale);
        attributes.insert(
            SkinningAttribute::Positions,
            encode_reals(
                SkinningAttribute::Positions,
                self.position_format,
                positions.flat_map(|p| p.to_array()),
            ),
        );
        attributes.insert(
            SkinningAttribute::Normals,
            encode_reals(
                SkinningAttribute::Normals,
                self.normal_format,
                self.normals.iter().flat_map(|v| v.to_array()),
            ),
        );
        if let Some(tangents) = &self.tangents {
            attributes.insert(
                SkinningAttribute::Tangents,
                encode_reals(
                    SkinningAttribute::Tangents,
                    self.tangent_format,
                    tangents.iter().flat_map(|v| v.to_array()),
                ),
            );
        }
        if let Some(weights) = &self.joint_weights {
            attributes.insert(
                SkinningAttribute::JointWeights,
                encode_reals(
                    SkinningAttribute::JointWeights,
                    self.joint_weight_format,
                    weights.iter().flatten().copied(),
                ),
            );
        }
        if let Some(indices) = &self.joint_indices {
            let max = indices.iter().flatten().copied().max().unwrap_or(0) as u32;
            attributes.insert(
                SkinningAttribute::JointIndices,
                encode_indices(
                    SkinningAttribute::JointIndices,
                    IndexFormat::smallest_for(max),
                    indices.iter().flatten().map(|&i| i as u32),
                ),
            );
        }

        if !self.morph_targets.is_empty() {
            self.encode_morphs(&mut attributes);
        }

        let reorder: Vec<u32> = match &self.inverse_reorder {
            Some(table) => table.clone(),
            None => (0..n).collect(),
        };
        let max = reorder.iter().copied().max().unwrap_or(0);
        attributes.insert(
            SkinningAttribute::InverseReorder,
            encode_indices(
                SkinningAttribute::InverseReorder,
                IndexFormat::smallest_for(max),
                reorder.iter().copied(),
            ),
        );

        EncodedMesh {
            attributes,
            position_normalization: normalization,
        }
    }

    /// Builds the sparse per-vertex morph lists. Entry `c` heads the list of
    /// compact vertex `c`; extra entries are appended after the heads.
    fn encode_morphs(&self, attributes: &mut HashMap<SkinningAttribute, EncodedAttribute>) {
        let n = self.num_verts() as usize;
        let has_normals = self.morph_targets.iter().any(|m| m.normal_deltas.is_some());
        let has_tangents = self.morph_targets.iter().any(|m| m.tangent_deltas.is_some());

        let delta = |deltas: &Option<Vec<Vec3>>, v: usize| {
            deltas
                .as_ref()
                .and_then(|d| d.get(v).copied())
                .unwrap_or(Vec3::ZERO)
        };

        let mut entries: Vec<MorphEntry> = vec![MorphEntry::default(); n];
        let mut counts = vec![0u32; n];
        for (v, count) in counts.iter_mut().enumerate() {
            let mut previous: Option<usize> = None;
            for (m, target) in self.morph_targets.iter().enumerate() {
                let entry = MorphEntry {
                    morph: m as u32,
                    position: target.position_deltas.get(v).copied().unwrap_or(Vec3::ZERO),
                    normal: delta(&target.normal_deltas, v),
                    tangent: delta(&target.tangent_deltas, v),
                    next: 0,
                };
                if entry.is_zero() {
                    continue;
                }
                let index = match previous {
                    None => {
                        entries[v] = entry;
                        v
                    }
                    Some(prev) => {
                        entries.push(entry);
                        let index = entries.len() - 1;
                        entries[prev].next = index as u32;
                        index
                    }
                };
                previous = Some(index);
                *count += 1;
            }
        }

        let num_entries = entries.len() as u32;
        let format = self.morph_delta_format;
        attributes.insert(
            SkinningAttribute::MorphPositionDeltas,
            encode_reals(
                SkinningAttribute::MorphPositionDeltas,
                format,
                entries.iter().flat_map(|e| e.position.to_array()),
            ),
        );
        if has_normals {
            attributes.insert(
                SkinningAttribute::MorphNormalDeltas,
                encode_reals(
                    SkinningAttribute::MorphNormalDeltas,
                    format,
                    entries.iter().flat_map(|e| e.normal.to_array()),
                ),
            );
        }
        if has_tangents {
            attributes.insert(
                SkinningAttribute::MorphTangentDeltas,
                encode_reals(
                    SkinningAttribute::MorphTangentDeltas,
                    format,
                    entries.iter().flat_map(|e| e.tangent.to_array()),
                ),
            );
        }

        let num_morphs = self.morph_targets.len() as u32;
        attributes.insert(
            SkinningAttribute::MorphIndices,
            encode_indices(
                SkinningAttribute::MorphIndices,
                IndexFormat::smallest_for(num_morphs.saturating_sub(1)),
                entries.iter().map(|e| e.morph),
            ),
        );
        attributes.insert(
            SkinningAttribute::MorphNextEntries,
            encode_indices(
                SkinningAttribute::MorphNextEntries,
                IndexFormat::smallest_for(num_entries.saturating_sub(1)),
                entries.iter().map(|e| e.next),
            ),
        );
        let max_count = counts.iter().copied().max().unwrap_or(0);
        attributes.insert(
            SkinningAttribute::VertexMorphCounts,
            encode_indices(
                SkinningAttribute::VertexMorphCounts,
                IndexFormat::smallest_for(max_count),
                counts.iter().copied(),
            ),
        );
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct MorphEntry {
    morph: u32,
    position: Vec3,
    normal: Vec3,
    tangent: Vec3,
    next: u32,
}

impl MorphEntry {
    fn is_zero(&self) -> bool {
        self.position == Vec3::ZERO && self.normal == Vec3::ZERO && self.tangent == Vec3::ZERO
    }
}

fn position_normalization(positions: &[Vec3], format: DataFormat) -> Option<NormalizationParams> {
    let signed = match format {
        DataFormat::Unorm16 | DataFormat::Unorm8 => false,
        DataFormat::Snorm16 | DataFormat::Snorm8 => true,
        _ => return None,
    };
    let min = positions.iter().copied().reduce(Vec3::min).unwrap_or(Vec3::ZERO);
    let max = positions.iter().copied().reduce(Vec3::max).unwrap_or(Vec3::ZERO);
    let extent = max - min;
    let extent = Vec3::select(extent.cmpgt(Vec3::ZERO), extent, Vec3::ONE);
    Some(if signed {
        NormalizationParams::new((min + max) * 0.5, extent * 0.5)
    } else {
        NormalizationParams::new(min, extent)
    })
}

// Element counts come from the data itself, so ragged inputs surface as
// count mismatches during the build.
fn encode_reals(
    attribute: SkinningAttribute,
    format: DataFormat,
    values: impl Iterator<Item = f32>,
) -> EncodedAttribute {
    let mut bytes = Vec::new();
    for value in values {
        format.write_real(value, &mut bytes);
    }
    let stride = attribute.components() * format.component_size();
    let info = AttributeInfo::new(bytes.len() as u32 / stride, format, stride);
    bytes.truncate(info.byte_size());
    EncodedAttribute { info, bytes }
}

fn encode_indices(
    attribute: SkinningAttribute,
    format: IndexFormat,
    values: impl Iterator<Item = u32>,
) -> EncodedAttribute {
    let mut bytes = Vec::new();
    for value in values {
        format.write(value, &mut bytes);
    }
    let stride = attribute.components() * format.size();
    let info = AttributeInfo::new(bytes.len() as u32 / stride, format.data_format(), stride);
    bytes.truncate(info.byte_size());
    EncodedAttribute { info, bytes }
}

/// One attribute in source layout.
#[derive(Debug, Clone)]
pub struct EncodedAttribute {
    pub info: AttributeInfo,
    pub bytes: Vec<u8>,
}

/// Every attribute of one mesh, ready to be served by a source.
#[derive(Debug, Clone)]
pub struct EncodedMesh {
    pub attributes: HashMap<SkinningAttribute, EncodedAttribute>,
    pub position_normalization: Option<NormalizationParams>,
}

impl EncodedMesh {
    pub fn attribute(&self, attribute: SkinningAttribute) -> Option<&EncodedAttribute> {
        self.attributes.get(&attribute)
    }
}

/// Thread-safe in-memory [`SkinningDataSource`].
///
/// Meshes are encoded when inserted. Failures can be injected per attribute.
#[derive(Default)]
pub struct InMemorySkinningSource {
    meshes: RwLock<HashMap<CompactSkinningDataId, Arc<EncodedMesh>>>,
    failures: Mutex<HashMap<(CompactSkinningDataId, SkinningAttribute), String>>,
    loaded: Mutex<HashMap<CompactSkinningDataId, u32>>,
    release_on_load: bool,
}

impl InMemorySkinningSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops a mesh's encoded data once its GPU buffer is uploaded.
    pub fn releasing_on_load() -> Self {
        Self {
            release_on_load: true,
            ..Self::default()
        }
    }

    pub fn insert(&self, id: CompactSkinningDataId, mesh: &MeshSkinningData) {
        self.meshes.write().insert(id, Arc::new(mesh.encode()));
    }

    pub fn remove(&self, id: CompactSkinningDataId) -> bool {
        self.meshes.write().remove(&id).is_some()
    }

    pub fn contains(&self, id: CompactSkinningDataId) -> bool {
        self.meshes.read().contains_key(&id)
    }

    /// Makes every copy of `attribute` for `id` fail with `message`.
    pub fn fail_attribute(
        &self,
        id: CompactSkinningDataId,
        attribute: SkinningAttribute,
        message: impl Into<String>,
    ) {
        self.failures.lock().insert((id, attribute), message.into());
    }

    /// How often [`compact_skinning_data_loaded`](SkinningDataSource::compact_skinning_data_loaded)
    /// fired for `id`.
    pub fn loaded_count(&self, id: CompactSkinningDataId) -> u32 {
        self.loaded.lock().get(&id).copied().unwrap_or(0)
    }

    fn mesh(
        &self,
        id: CompactSkinningDataId,
        attribute: SkinningAttribute,
    ) -> Result<Arc<EncodedMesh>, SourceError> {
        self.meshes
            .read()
            .get(&id)
            .cloned()
            .ok_or(SourceError::Failed {
                attribute,
                message: format!("unknown mesh {id}"),
            })
    }
}

impl SkinningDataSource for InMemorySkinningSource {
    fn attribute_info(
        &self,
        id: CompactSkinningDataId,
        attribute: SkinningAttribute,
    ) -> Result<AttributeInfo, SourceError> {
        let mesh = self.mesh(id, attribute)?;
        mesh.attribute(attribute)
            .map(|encoded| encoded.info)
            .ok_or(SourceError::DataNotAvailable(attribute))
    }

    fn copy_attribute(
        &self,
        id: CompactSkinningDataId,
        attribute: SkinningAttribute,
        dest: &mut [u8],
        stride: u32,
    ) -> Result<Option<NormalizationParams>, SourceError> {
        if let Some(message) = self.failures.lock().get(&(id, attribute)) {
            return Err(SourceError::Failed {
                attribute,
                message: message.clone(),
            });
        }
        let mesh = self.mesh(id, attribute)?;
        let encoded = mesh
            .attribute(attribute)
            .ok_or(SourceError::DataNotAvailable(attribute))?;
        let info = encoded.info;
        let stride = stride as usize;
        if stride < info.stride as usize || dest.len() < info.count as usize * stride {
            return Err(SourceError::Failed {
                attribute,
                message: format!(
                    "destination of {} bytes with stride {stride} cannot hold {} elements of {} bytes",
                    dest.len(),
                    info.count,
                    info.stride
                ),
            });
        }

        let element = info.stride as usize;
        for (i, chunk) in encoded.bytes.chunks_exact(element).enumerate() {
            dest[i * stride..i * stride + element].copy_from_slice(chunk);
        }

        Ok(match attribute {
            SkinningAttribute::Positions => mesh.position_normalization,
            _ => None,
        })
    }

    fn compact_skinning_data_loaded(&self, id: CompactSkinningDataId) {
        *self.loaded.lock().entry(id).or_default() += 1;
        if self.release_on_load {
            log::debug!("Releasing CPU skinning data for {id}");
            self.meshes.write().remove(&id);
        }
    }
}

impl fmt::Debug for InMemorySkinningSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemorySkinningSource")
            .field("meshes", &self.meshes.read().len())
            .field("release_on_load", &self.release_on_load)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::decode_index_table;

    fn triangle() -> MeshSkinningData {
        MeshSkinningData::new(
            vec![Vec3::ZERO, Vec3::X, Vec3::Y],
            vec![Vec3::Z; 3],
        )
    }

    fn read_indices(mesh: &EncodedMesh, attribute: SkinningAttribute) -> Vec<u32> {
        let encoded = mesh.attribute(attribute).unwrap();
        let format = encoded.info.format.index_format().unwrap();
        decode_index_table(&encoded.bytes, format, encoded.info.count)
    }

    #[test]
    fn required_attributes() {
        let required: Vec<_> = SkinningAttribute::ALL
            .into_iter()
            .filter(|a| a.is_required())
            .collect();
        assert_eq!(
            required,
            vec![
                SkinningAttribute::Positions,
                SkinningAttribute::Normals,
                SkinningAttribute::InverseReorder
            ]
        );
    }

    #[test]
    fn minimal_mesh_has_identity_reorder() {
        let mesh = triangle().encode();
        assert_eq!(read_indices(&mesh, SkinningAttribute::InverseReorder), vec![0, 1, 2]);
        assert!(mesh.attribute(SkinningAttribute::Tangents).is_none());
        assert!(mesh.attribute(SkinningAttribute::MorphPositionDeltas).is_none());
        assert_eq!(mesh.position_normalization, None);
        let positions = mesh.attribute(SkinningAttribute::Positions).unwrap();
        assert_eq!(positions.info, AttributeInfo::new(3, DataFormat::F32, 12));
    }

    #[test]
    fn sparse_morph_lists() {
        // Vertex 0 is moved by both targets, vertex 1 by none, vertex 2 by the second.
        let mesh = triangle()
            .with_morph_target(MorphTarget::new(vec![Vec3::X, Vec3::ZERO, Vec3::ZERO]))
            .with_morph_target(MorphTarget::new(vec![Vec3::Y, Vec3::ZERO, Vec3::Z]))
            .encode();

        assert_eq!(read_indices(&mesh, SkinningAttribute::VertexMorphCounts), vec![2, 0, 1]);
        // Heads 0..3, then vertex 0's second entry at 3.
        assert_eq!(read_indices(&mesh, SkinningAttribute::MorphIndices), vec![0, 0, 1, 1]);
        assert_eq!(read_indices(&mesh, SkinningAttribute::MorphNextEntries), vec![3, 0, 0, 0]);
        let next = mesh.attribute(SkinningAttribute::MorphNextEntries).unwrap();
        assert_eq!(next.info.format, DataFormat::U8);
        assert!(mesh.attribute(SkinningAttribute::MorphNormalDeltas).is_none());
    }

    #[test]
    fn morph_index_width_follows_target_count() {
        let mut data = triangle();
        for _ in 0..257 {
            data = data.with_morph_target(MorphTarget::new(vec![Vec3::X; 3]));
        }
        let mesh = data.encode();
        let indices = mesh.attribute(SkinningAttribute::MorphIndices).unwrap();
        assert_eq!(indices.info.format, DataFormat::U16);
        let next = mesh.attribute(SkinningAttribute::MorphNextEntries).unwrap();
        assert_eq!(next.info.format, DataFormat::U16);
    }

    #[test]
    fn quantized_positions_report_normalization() {
        let source = InMemorySkinningSource::new();
        let id = CompactSkinningDataId(7);
        source.insert(
            id,
            &MeshSkinningData::new(
                vec![Vec3::new(-1.0, 0.0, 2.0), Vec3::new(3.0, 1.0, 2.0)],
                vec![Vec3::Z; 2],
            )
            .with_position_format(DataFormat::Unorm16),
        );
        let info = source.attribute_info(id, SkinningAttribute::Positions).unwrap();
        assert_eq!(info.stride, 6);
        let mut dest = vec![0u8; info.byte_size()];
        let params = source
            .copy_attribute(id, SkinningAttribute::Positions, &mut dest, info.stride)
            .unwrap()
            .unwrap();
        assert_eq!(params.bias, Vec3::new(-1.0, 0.0, 2.0));
        // Flat axis keeps a unit window.
        assert_eq!(params.scale, Vec3::new(4.0, 1.0, 1.0));
        assert_eq!(DataFormat::Unorm16.read_real(&dest, 6), Some(1.0));
    }

    #[test]
    fn copy_honours_destination_stride() {
        let source = InMemorySkinningSource::new();
        let id = CompactSkinningDataId(1);
        source.insert(id, &triangle());
        let mut dest = vec![0u8; 3 * 16];
        source
            .copy_attribute(id, SkinningAttribute::Normals, &mut dest, 16)
            .unwrap();
        assert_eq!(DataFormat::F32.read_real(&dest, 16 + 8), Some(1.0));
        assert!(matches!(
            source.copy_attribute(id, SkinningAttribute::Normals, &mut dest[..8], 12),
            Err(SourceError::Failed { .. })
        ));
    }

    #[test]
    fn missing_and_failing_attributes() {
        let source = InMemorySkinningSource::new();
        let id = CompactSkinningDataId(2);
        source.insert(id, &triangle());
        assert_eq!(
            source.attribute_info(id, SkinningAttribute::Tangents),
            Err(SourceError::DataNotAvailable(SkinningAttribute::Tangents))
        );
        source.fail_attribute(id, SkinningAttribute::Normals, "corrupt");
        let mut dest = vec![0u8; 36];
        assert!(matches!(
            source.copy_attribute(id, SkinningAttribute::Normals, &mut dest, 12),
            Err(SourceError::Failed { .. })
        ));
    }

    #[test]
    fn release_on_load() {
        let source = InMemorySkinningSource::releasing_on_load();
        let id = CompactSkinningDataId(3);
        source.insert(id, &triangle());
        source.compact_skinning_data_loaded(id);
        assert_eq!(source.loaded_count(id), 1);
        assert!(!source.contains(id));
    }
}
