//! Typed access to packed byte buffers shared with the compute shader.
//!
//! The shader addresses every buffer as `uint data[]`, so all offsets handed
//! to it are byte offsets that must stay 4-byte aligned.

use bytemuck::Pod;

/// Zero-initialised byte storage aligned to 4 bytes.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct AlignedBytes {
    words: Vec<u32>,
    len: usize,
}

impl AlignedBytes {
    pub fn zeroed(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(4)],
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &bytemuck::cast_slice(&self.words)[..self.len]
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut(&mut self.words)[..self.len]
    }

    /// The storage including trailing padding up to the next word.
    pub fn as_padded_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.words)
    }
}

impl std::fmt::Debug for AlignedBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedBytes").field("len", &self.len).finish()
    }
}

/// Rounds `offset` up to a multiple of `alignment`.
pub fn align_up(offset: usize, alignment: usize) -> usize {
    offset.next_multiple_of(alignment.max(1))
}

/// Appends sections to a byte buffer and hands back their offsets.
#[derive(Debug, Default)]
pub struct PackedBufferWriter {
    bytes: Vec<u8>,
}

impl PackedBufferWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Pads with zeros up to `alignment`.
    pub fn align_to(&mut self, alignment: usize) {
        let aligned = align_up(self.bytes.len(), alignment);
        self.bytes.resize(aligned, 0);
    }

    /// Reserves a zeroed `T` to be filled in later with [`write_pod_at`](Self::write_pod_at).
    pub fn reserve<T: Pod>(&mut self) -> u32 {
        self.reserve_bytes(std::mem::size_of::<T>(), 4)
    }

    /// Reserves `len` zeroed bytes at `alignment`.
    pub fn reserve_bytes(&mut self, len: usize, alignment: usize) -> u32 {
        self.align_to(alignment);
        let offset = self.bytes.len();
        self.bytes.resize(offset + len, 0);
        offset as u32
    }

    pub fn push_pod<T: Pod>(&mut self, value: &T) -> u32 {
        self.push_bytes(bytemuck::bytes_of(value), 4)
    }

    pub fn push_slice<T: Pod>(&mut self, values: &[T]) -> u32 {
        self.push_bytes(bytemuck::cast_slice(values), 4)
    }

    /// Appends `data` at `alignment` and returns its offset.
    pub fn push_bytes(&mut self, data: &[u8], alignment: usize) -> u32 {
        self.align_to(alignment);
        let offset = self.bytes.len();
        self.bytes.extend_from_slice(data);
        offset as u32
    }

    /// Overwrites a previously reserved region.
    pub fn write_pod_at<T: Pod>(&mut self, offset: u32, value: &T) {
        let start = offset as usize;
        let data = bytemuck::bytes_of(value);
        debug_assert!(
            start + data.len() <= self.bytes.len(),
            "write of {} bytes at {start} past end {}",
            data.len(),
            self.bytes.len()
        );
        self.bytes[start..start + data.len()].copy_from_slice(data);
    }

    /// Finishes the buffer, padded to a whole number of words.
    pub fn finish(mut self) -> Vec<u8> {
        self.align_to(4);
        self.bytes
    }
}

/// Bounds-checked reads from a packed buffer. Offsets need not be aligned.
#[derive(Debug, Clone, Copy)]
pub struct PackedBufferReader<'a> {
    bytes: &'a [u8],
}

impl<'a> PackedBufferReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn read<T: Pod>(&self, offset: usize) -> Option<T> {
        let end = offset.checked_add(std::mem::size_of::<T>())?;
        self.bytes
            .get(offset..end)
            .map(bytemuck::pod_read_unaligned)
    }

    pub fn read_u32(&self, offset: usize) -> Option<u32> {
        self.read(offset)
    }

    pub fn read_f32(&self, offset: usize) -> Option<f32> {
        self.read(offset)
    }

    /// Reads `count` consecutive values.
    pub fn read_slice<T: Pod>(&self, offset: usize, count: usize) -> Option<Vec<T>> {
        let size = std::mem::size_of::<T>();
        let end = offset.checked_add(count.checked_mul(size)?)?;
        self.bytes
            .get(offset..end)
            .map(bytemuck::pod_collect_to_vec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligned_bytes_round_up_storage() {
        let mut bytes = AlignedBytes::zeroed(6);
        assert_eq!(bytes.len(), 6);
        assert_eq!(bytes.as_padded_bytes().len(), 8);
        bytes.as_bytes_mut()[5] = 9;
        assert_eq!(bytes.as_bytes(), &[0, 0, 0, 0, 0, 9]);
        assert_eq!(bytes.as_bytes().as_ptr() as usize % 4, 0);
    }

    #[test]
    fn writer_aligns_sections() {
        let mut writer = PackedBufferWriter::new();
        let header = writer.reserve::<[u32; 2]>();
        let a = writer.push_bytes(&[1, 2, 3], 4);
        let b = writer.push_bytes(&[4], 4);
        let c = writer.push_slice(&[7u32]);
        writer.write_pod_at(header, &[a, b]);
        assert_eq!((header, a, b, c), (0, 8, 12, 16));

        let bytes = writer.finish();
        assert_eq!(bytes.len(), 20);
        let reader = PackedBufferReader::new(&bytes);
        assert_eq!(reader.read::<[u32; 2]>(0), Some([8, 12]));
        assert_eq!(reader.read_u32(16), Some(7));
        assert_eq!(&bytes[8..12], &[1, 2, 3, 0]);
    }

    #[test]
    fn reader_is_bounds_checked() {
        let bytes = [0u8; 10];
        let reader = PackedBufferReader::new(&bytes);
        assert!(reader.read_u32(6).is_some());
        assert!(reader.read_u32(7).is_none());
        assert!(reader.read_u32(usize::MAX).is_none());
        assert_eq!(reader.read_slice::<u16>(2, 4).map(|v| v.len()), Some(4));
        assert!(reader.read_slice::<u32>(0, 3).is_none());
    }

    #[test]
    fn unaligned_reads() {
        let mut bytes = vec![0u8; 9];
        bytes[1..5].copy_from_slice(&1.5f32.to_le_bytes());
        assert_eq!(PackedBufferReader::new(&bytes).read_f32(1), Some(1.5));
    }
}
