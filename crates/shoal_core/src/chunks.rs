/// The fixed transfer block size. Every chunk of a shared file is exactly
/// this many bytes, except the final one which may be shorter.
pub const CHUNK_SIZE: u32 = 1024 * 1024;

/// Chunk arithmetic for a file of a given size.
///
/// The chunk index space is `0..chunk_count()`; all chunks have
/// `default_chunk_size()` bytes except the last.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLayout {
    total_size: u64,
    chunk_size: u32,
}

const fn last_element_size(total: u64, factor: u64) -> u64 {
    let rem = total % factor;
    if rem == 0 {
        return factor;
    }
    rem
}

impl ChunkLayout {
    pub fn new(total_size: u64) -> anyhow::Result<Self> {
        Self::with_chunk_size(total_size, CHUNK_SIZE)
    }

    pub fn with_chunk_size(total_size: u64, chunk_size: u32) -> anyhow::Result<Self> {
        if total_size == 0 {
            anyhow::bail!("a zero length file can't be shared")
        }
        if chunk_size == 0 {
            anyhow::bail!("chunk size must be non-zero")
        }
        Ok(Self {
            total_size,
            chunk_size,
        })
    }

    pub const fn total_size(&self) -> u64 {
        self.total_size
    }

    pub const fn default_chunk_size(&self) -> u32 {
        self.chunk_size
    }

    pub const fn chunk_count(&self) -> u32 {
        self.total_size.div_ceil(self.chunk_size as u64) as u32
    }

    pub const fn last_chunk_index(&self) -> u32 {
        self.chunk_count() - 1
    }

    /// Byte length of the given chunk, None if the index is out of range.
    pub const fn chunk_size(&self, index: u32) -> Option<u32> {
        if index > self.last_chunk_index() {
            return None;
        }
        if index == self.last_chunk_index() {
            return Some(last_element_size(self.total_size, self.chunk_size as u64) as u32);
        }
        Some(self.chunk_size)
    }

    /// Absolute byte offset of the given chunk within the file.
    pub const fn chunk_offset(&self, index: u32) -> Option<u64> {
        if index > self.last_chunk_index() {
            return None;
        }
        Some(index as u64 * self.chunk_size as u64)
    }

    pub fn iter_chunk_sizes(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        (0..self.chunk_count()).map(move |idx| (idx, self.chunk_size(idx).unwrap()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_divisible() {
        let l = ChunkLayout::new(2 * CHUNK_SIZE as u64).unwrap();
        assert_eq!(l.chunk_count(), 2);
        assert_eq!(l.chunk_size(0), Some(CHUNK_SIZE));
        assert_eq!(l.chunk_size(1), Some(CHUNK_SIZE));
        assert_eq!(l.chunk_size(2), None);
    }

    #[test]
    fn test_truncated_last_chunk() {
        // 2 MiB + 1 byte: three chunks, the last a single byte.
        let l = ChunkLayout::new(2 * CHUNK_SIZE as u64 + 1).unwrap();
        assert_eq!(l.chunk_count(), 3);
        assert_eq!(l.chunk_size(0), Some(CHUNK_SIZE));
        assert_eq!(l.chunk_size(1), Some(CHUNK_SIZE));
        assert_eq!(l.chunk_size(2), Some(1));
        assert_eq!(l.chunk_offset(2), Some(2 * CHUNK_SIZE as u64));
        assert_eq!(l.chunk_offset(3), None);
    }

    #[test]
    fn test_smaller_than_one_chunk() {
        let l = ChunkLayout::new(10).unwrap();
        assert_eq!(l.chunk_count(), 1);
        assert_eq!(l.chunk_size(0), Some(10));
        assert_eq!(l.chunk_offset(0), Some(0));
    }

    #[test]
    fn test_zero_length_rejected() {
        assert!(ChunkLayout::new(0).is_err());
    }

    #[test]
    fn test_iter_chunk_sizes_sums_to_total() {
        for total in [1u64, 999, CHUNK_SIZE as u64, 5 * CHUNK_SIZE as u64 + 12345] {
            let l = ChunkLayout::new(total).unwrap();
            let sum: u64 = l.iter_chunk_sizes().map(|(_, s)| s as u64).sum();
            assert_eq!(sum, total);
        }
    }
}
