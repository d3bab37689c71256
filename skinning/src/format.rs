//! Data formats shared by the vertex buffer, the compute shader and readback.
//!
//! Discriminants are part of the GPU contract: they are written into the
//! skinning uniforms and compared against constants in the shader.

use glam::{Vec3, Vec4};
use half::f16;
use serde::Deserialize;

/// Component format of a source attribute.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataFormat {
    F32 = 0,
    F16 = 1,
    Unorm16 = 2,
    Unorm8 = 3,
    Snorm16 = 4,
    Snorm8 = 5,
    U8 = 6,
    U16 = 7,
    U32 = 8,
}

impl DataFormat {
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => Self::F32,
            1 => Self::F16,
            2 => Self::Unorm16,
            3 => Self::Unorm8,
            4 => Self::Snorm16,
            5 => Self::Snorm8,
            6 => Self::U8,
            7 => Self::U16,
            8 => Self::U32,
            _ => return None,
        })
    }

    /// Size of one component in bytes.
    pub fn component_size(self) -> u32 {
        match self {
            Self::F32 | Self::U32 => 4,
            Self::F16 | Self::Unorm16 | Self::Snorm16 | Self::U16 => 2,
            Self::Unorm8 | Self::Snorm8 | Self::U8 => 1,
        }
    }

    /// Float, half or normalized integer.
    pub fn is_real(self) -> bool {
        !self.is_integer()
    }

    pub fn is_integer(self) -> bool {
        matches!(self, Self::U8 | Self::U16 | Self::U32)
    }

    pub fn index_format(self) -> Option<IndexFormat> {
        match self {
            Self::U8 => Some(IndexFormat::U8),
            Self::U16 => Some(IndexFormat::U16),
            Self::U32 => Some(IndexFormat::U32),
            _ => None,
        }
    }

    /// Decodes one real-valued component. Returns `None` when out of bounds
    /// or when called on an integer format.
    pub fn read_real(self, bytes: &[u8], offset: usize) -> Option<f32> {
        let size = self.component_size() as usize;
        let raw = bytes.get(offset..offset + size)?;
        Some(match self {
            Self::F32 => f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
            Self::F16 => f16::from_le_bytes([raw[0], raw[1]]).to_f32(),
            Self::Unorm16 => u16::from_le_bytes([raw[0], raw[1]]) as f32 / 65535.0,
            Self::Snorm16 => (i16::from_le_bytes([raw[0], raw[1]]) as f32 / 32767.0).max(-1.0),
            Self::Unorm8 => raw[0] as f32 / 255.0,
            Self::Snorm8 => (raw[0] as i8 as f32 / 127.0).max(-1.0),
            Self::U8 | Self::U16 | Self::U32 => return None,
        })
    }

    /// Encodes one real-valued component and appends it to `out`.
    pub fn write_real(self, value: f32, out: &mut Vec<u8>) {
        match self {
            Self::F32 => out.extend_from_slice(&value.to_le_bytes()),
            Self::F16 => out.extend_from_slice(&f16::from_f32(value).to_le_bytes()),
            Self::Unorm16 => out.extend_from_slice(&quantize_unorm(value, 65535.0).to_le_bytes()[..2]),
            Self::Snorm16 => out.extend_from_slice(&(quantize_snorm(value, 32767.0) as i16).to_le_bytes()),
            Self::Unorm8 => out.push(quantize_unorm(value, 255.0) as u8),
            Self::Snorm8 => out.push(quantize_snorm(value, 127.0) as i8 as u8),
            Self::U8 => out.push(value as u8),
            Self::U16 => out.extend_from_slice(&(value as u16).to_le_bytes()),
            Self::U32 => out.extend_from_slice(&(value as u32).to_le_bytes()),
        }
    }

    /// Decodes one integer component.
    pub fn read_index(self, bytes: &[u8], offset: usize) -> Option<u32> {
        self.index_format()?.read(bytes, offset)
    }
}

fn quantize_unorm(value: f32, max: f32) -> u32 {
    (value.clamp(0.0, 1.0) * max).round() as u32
}

fn quantize_snorm(value: f32, max: f32) -> i32 {
    (value.clamp(-1.0, 1.0) * max).round() as i32
}

/// Width of an integer index stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexFormat {
    U8,
    U16,
    U32,
}

impl IndexFormat {
    pub fn size(self) -> u32 {
        match self {
            Self::U8 => 1,
            Self::U16 => 2,
            Self::U32 => 4,
        }
    }

    /// Smallest width able to hold every value in `0..=max_value`.
    pub fn smallest_for(max_value: u32) -> Self {
        if max_value <= u8::MAX as u32 {
            Self::U8
        } else if max_value <= u16::MAX as u32 {
            Self::U16
        } else {
            Self::U32
        }
    }

    pub fn data_format(self) -> DataFormat {
        match self {
            Self::U8 => DataFormat::U8,
            Self::U16 => DataFormat::U16,
            Self::U32 => DataFormat::U32,
        }
    }

    pub fn read(self, bytes: &[u8], offset: usize) -> Option<u32> {
        let raw = bytes.get(offset..offset + self.size() as usize)?;
        Some(match self {
            Self::U8 => raw[0] as u32,
            Self::U16 => u16::from_le_bytes([raw[0], raw[1]]) as u32,
            Self::U32 => u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
        })
    }

    pub fn write(self, value: u32, out: &mut Vec<u8>) {
        match self {
            Self::U8 => out.push(value as u8),
            Self::U16 => out.extend_from_slice(&(value as u16).to_le_bytes()),
            Self::U32 => out.extend_from_slice(&value.to_le_bytes()),
        }
    }
}

/// Decodes a tightly packed index table. Entries past the end of `bytes`
/// are dropped.
pub fn decode_index_table(bytes: &[u8], format: IndexFormat, count: u32) -> Vec<u32> {
    let size = format.size() as usize;
    (0..count as usize)
        .map_while(|i| format.read(bytes, i * size))
        .collect()
}

/// Encoding of skinned positions in the output buffer.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionOutputFormat {
    #[default]
    Float = 0,
    Half = 1,
    Unorm16 = 2,
    Unorm8 = 3,
}

impl PositionOutputFormat {
    /// Bytes per output vertex.
    pub fn stride(self) -> u32 {
        match self {
            Self::Float => 12,
            Self::Half | Self::Unorm16 => 8,
            Self::Unorm8 => 4,
        }
    }

    /// Whether positions are remapped through bias and scale.
    pub fn is_normalized(self) -> bool {
        matches!(self, Self::Unorm16 | Self::Unorm8)
    }

    /// Encodes one position the way the compute shader does.
    pub fn encode(self, position: Vec3, bias: Vec3, scale: Vec3, out: &mut [u8]) {
        match self {
            Self::Float => {
                for (i, c) in position.to_array().into_iter().enumerate() {
                    out[i * 4..i * 4 + 4].copy_from_slice(&c.to_le_bytes());
                }
            }
            Self::Half => {
                let h = |v: f32| f16::from_f32(v).to_bits() as u32;
                let word0 = h(position.x) | (h(position.y) << 16);
                let word1 = h(position.z);
                out[0..4].copy_from_slice(&word0.to_le_bytes());
                out[4..8].copy_from_slice(&word1.to_le_bytes());
            }
            Self::Unorm16 => {
                let n = normalize_position(position, bias, scale);
                let q = |v: f32| quantize_unorm(v, 65535.0);
                let word0 = q(n.x) | (q(n.y) << 16);
                let word1 = q(n.z);
                out[0..4].copy_from_slice(&word0.to_le_bytes());
                out[4..8].copy_from_slice(&word1.to_le_bytes());
            }
            Self::Unorm8 => {
                let n = normalize_position(position, bias, scale);
                let q = |v: f32| quantize_unorm(v, 255.0);
                let word = q(n.x) | (q(n.y) << 8) | (q(n.z) << 16);
                out[0..4].copy_from_slice(&word.to_le_bytes());
            }
        }
    }

    /// Decodes one position. `bytes` must hold at least [`stride`](Self::stride) bytes.
    pub fn decode(self, bytes: &[u8], bias: Vec3, scale: Vec3) -> Option<Vec3> {
        let word = |i: usize| -> Option<u32> {
            let raw = bytes.get(i * 4..i * 4 + 4)?;
            Some(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
        };
        Some(match self {
            Self::Float => Vec3::new(
                f32::from_bits(word(0)?),
                f32::from_bits(word(1)?),
                f32::from_bits(word(2)?),
            ),
            Self::Half => {
                let (w0, w1) = (word(0)?, word(1)?);
                let h = |bits: u32| f16::from_bits(bits as u16).to_f32();
                Vec3::new(h(w0 & 0xFFFF), h(w0 >> 16), h(w1 & 0xFFFF))
            }
            Self::Unorm16 => {
                let (w0, w1) = (word(0)?, word(1)?);
                let n = Vec3::new(
                    (w0 & 0xFFFF) as f32,
                    (w0 >> 16) as f32,
                    (w1 & 0xFFFF) as f32,
                ) / 65535.0;
                n * scale + bias
            }
            Self::Unorm8 => {
                let w = word(0)?;
                let n = Vec3::new(
                    (w & 0xFF) as f32,
                    ((w >> 8) & 0xFF) as f32,
                    ((w >> 16) & 0xFF) as f32,
                ) / 255.0;
                n * scale + bias
            }
        })
    }
}

fn normalize_position(position: Vec3, bias: Vec3, scale: Vec3) -> Vec3 {
    (position - bias) / scale
}

/// Bytes per vertex in the frenet output buffer.
pub const FRENET_STRIDE: u32 = 8;

fn pack_snorm10(v: f32) -> u32 {
    (quantize_snorm(v, 511.0) as u32) & 0x3FF
}

fn unpack_snorm10(bits: u32) -> f32 {
    let signed = ((bits << 22) as i32) >> 22;
    (signed as f32 / 511.0).max(-1.0)
}

fn pack_snorm10x3(v: Vec3) -> u32 {
    pack_snorm10(v.x) | (pack_snorm10(v.y) << 10) | (pack_snorm10(v.z) << 20)
}

/// Packs a normal into one signed 10:10:10 word. The top two bits are zero.
pub fn pack_normal(normal: Vec3) -> u32 {
    pack_snorm10x3(normal)
}

/// Packs a normal and tangent into two 10:10:10:2 words.
///
/// The tangent `w` (bitangent sign) is stored in the top two bits as a
/// two's complement value: `01` for +1 and `11` for -1.
pub fn pack_frenet(normal: Vec3, tangent: Vec4) -> [u32; 2] {
    let sign: u32 = if tangent.w < 0.0 { 3 } else { 1 };
    [
        pack_snorm10x3(normal),
        pack_snorm10x3(tangent.truncate()) | (sign << 30),
    ]
}

/// Inverse of [`pack_frenet`]. A zero tangent word decodes to a zero tangent.
pub fn unpack_frenet(words: [u32; 2]) -> (Vec3, Vec4) {
    let unpack = |w: u32| {
        Vec3::new(
            unpack_snorm10(w & 0x3FF),
            unpack_snorm10((w >> 10) & 0x3FF),
            unpack_snorm10((w >> 20) & 0x3FF),
        )
    };
    let w = ((words[1] >> 30) << 30) as i32 >> 30;
    (unpack(words[0]), unpack(words[1]).extend(w as f32))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(DataFormat::F32, 0.123_456_7, 0.0)]
    #[case(DataFormat::F16, 0.5, 0.0)]
    #[case(DataFormat::Unorm16, 0.25, 1.0 / 65535.0)]
    #[case(DataFormat::Unorm8, 0.25, 1.0 / 255.0)]
    #[case(DataFormat::Snorm16, -0.75, 1.0 / 32767.0)]
    #[case(DataFormat::Snorm8, -0.75, 1.0 / 127.0)]
    fn real_component_encoding(#[case] format: DataFormat, #[case] value: f32, #[case] tolerance: f32) {
        let mut bytes = Vec::new();
        format.write_real(value, &mut bytes);
        assert_eq!(bytes.len() as u32, format.component_size());
        let decoded = format.read_real(&bytes, 0).unwrap();
        assert!((decoded - value).abs() <= tolerance, "{format:?}: {decoded} vs {value}");
    }

    #[test]
    fn snorm_minimum_clamps_to_minus_one() {
        assert_eq!(DataFormat::Snorm8.read_real(&[0x80], 0), Some(-1.0));
        assert_eq!(DataFormat::Snorm16.read_real(&0x8000u16.to_le_bytes(), 0), Some(-1.0));
    }

    #[test]
    fn integer_formats_do_not_decode_as_real() {
        assert_eq!(DataFormat::U16.read_real(&[1, 0], 0), None);
        assert_eq!(DataFormat::U16.read_index(&[1, 2], 0), Some(0x0201));
        assert_eq!(DataFormat::F32.read_index(&[0; 4], 0), None);
    }

    #[test]
    fn smallest_index_format() {
        assert_eq!(IndexFormat::smallest_for(0), IndexFormat::U8);
        assert_eq!(IndexFormat::smallest_for(255), IndexFormat::U8);
        assert_eq!(IndexFormat::smallest_for(256), IndexFormat::U16);
        assert_eq!(IndexFormat::smallest_for(65535), IndexFormat::U16);
        assert_eq!(IndexFormat::smallest_for(65536), IndexFormat::U32);
    }

    #[test]
    fn index_table_decoding() {
        let mut bytes = Vec::new();
        for v in [3u32, 0, 700, 2] {
            IndexFormat::U16.write(v, &mut bytes);
        }
        assert_eq!(decode_index_table(&bytes, IndexFormat::U16, 4), vec![3, 0, 700, 2]);
        assert_eq!(decode_index_table(&bytes, IndexFormat::U16, 9).len(), 4);
    }

    #[test]
    fn data_format_raw_values_are_stable() {
        for raw in 0..9 {
            assert_eq!(DataFormat::from_raw(raw).map(|f| f as u32), Some(raw));
        }
        assert_eq!(DataFormat::from_raw(9), None);
    }

    #[rstest]
    #[case::float(PositionOutputFormat::Float, 0.0)]
    #[case::half(PositionOutputFormat::Half, 2.0 / 1024.0)]
    #[case::unorm16(PositionOutputFormat::Unorm16, 4.0 / 65535.0)]
    #[case::unorm8(PositionOutputFormat::Unorm8, 4.0 / 255.0)]
    fn position_output_error_bound(#[case] format: PositionOutputFormat, #[case] bound: f32) {
        // Range of 4 units on every axis.
        let bias = Vec3::splat(-2.0);
        let scale = Vec3::splat(4.0);
        let mut bytes = vec![0u8; format.stride() as usize];
        for p in [
            Vec3::new(-2.0, 0.0, 2.0),
            Vec3::new(0.3, -1.7, 1.234),
            Vec3::new(1.999, 0.001, -0.5),
        ] {
            format.encode(p, bias, scale, &mut bytes);
            let decoded = format.decode(&bytes, bias, scale).unwrap();
            let error = (decoded - p).abs().max_element();
            let allowed = if format == PositionOutputFormat::Half {
                bound * p.abs().max_element().max(1.0)
            } else {
                bound
            };
            assert!(error <= allowed, "{format:?}: {p} decoded as {decoded}");
        }
    }

    #[test]
    fn position_output_strides() {
        assert_eq!(PositionOutputFormat::Float.stride(), 12);
        assert_eq!(PositionOutputFormat::Half.stride(), 8);
        assert_eq!(PositionOutputFormat::Unorm16.stride(), 8);
        assert_eq!(PositionOutputFormat::Unorm8.stride(), 4);
    }

    #[test]
    fn frenet_packing_keeps_sign_and_direction() {
        let normal = Vec3::new(0.0, 0.6, -0.8);
        for w in [1.0, -1.0] {
            let tangent = Vec4::new(1.0, 0.0, 0.0, w);
            let words = pack_frenet(normal, tangent);
            let (n, t) = unpack_frenet(words);
            assert!((n - normal).abs().max_element() < 2.0 / 511.0);
            assert!((t.truncate() - tangent.truncate()).abs().max_element() < 2.0 / 511.0);
            assert_eq!(t.w, w);
        }
        assert_eq!(pack_frenet(normal, Vec4::new(0.0, 0.0, 1.0, -1.0))[1] >> 30, 0b11);
        assert_eq!(pack_frenet(normal, Vec4::new(0.0, 0.0, 1.0, 1.0))[1] >> 30, 0b01);
    }
}
