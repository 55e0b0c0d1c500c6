use std::ops::Range;

/// Byte ranges of one transport invocation. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    total_length: u64,
    chunk_size: u64,
}

impl ChunkPlan {
    pub fn for_length(total_length: u64, chunk_size: u64) -> Self {
        Self {
            total_length,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// `ceil(total / chunk_size)`; an exact multiple gets no trailing empty chunk.
    pub fn chunk_count(&self) -> u64 {
        self.total_length.div_ceil(self.chunk_size)
    }

    pub fn offset(&self, index: u64) -> u64 {
        index * self.chunk_size
    }

    pub fn range(&self, index: u64) -> Range<u64> {
        let start = self.offset(index).min(self.total_length);
        let end = (start + self.chunk_size).min(self.total_length);
        start..end
    }

    pub fn is_last(&self, index: u64) -> bool {
        index + 1 == self.chunk_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const C: u64 = 10 * 1024 * 1024;

    #[test]
    fn chunk_count_is_ceiling() {
        assert_eq!(ChunkPlan::for_length(0, C).chunk_count(), 0);
        assert_eq!(ChunkPlan::for_length(1, C).chunk_count(), 1);
        assert_eq!(ChunkPlan::for_length(C, C).chunk_count(), 1);
        assert_eq!(ChunkPlan::for_length(C + 1, C).chunk_count(), 2);
        assert_eq!(ChunkPlan::for_length(3 * C - 1, C).chunk_count(), 3);
    }

    #[test]
    fn exact_multiple_has_no_empty_trailing_chunk() {
        let plan = ChunkPlan::for_length(2 * C, C);
        assert_eq!(plan.chunk_count(), 2);
        assert_eq!(plan.range(0), 0..C);
        assert_eq!(plan.range(1), C..2 * C);
        assert!(plan.is_last(1));
        assert!(!plan.is_last(0));
    }

    #[test]
    fn last_range_is_short() {
        let plan = ChunkPlan::for_length(10, 4);
        assert_eq!(plan.range(0), 0..4);
        assert_eq!(plan.range(1), 4..8);
        assert_eq!(plan.range(2), 8..10);
        assert_eq!(plan.offset(2), 8);
        assert!(plan.is_last(2));
    }

    #[test]
    fn zero_chunk_size_is_clamped() {
        let plan = ChunkPlan::for_length(3, 0);
        assert_eq!(plan.chunk_size(), 1);
        assert_eq!(plan.chunk_count(), 3);
    }
}
