/// One contiguous slice of a file, `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub index: u64,
    pub start: u64,
    pub end: u64,
    /// The chunk that closes the upload session.
    pub is_last: bool,
}

impl Chunk {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// How a file of `size` bytes is split into session calls.
///
/// Files smaller than the chunk size go up in a single start call that
/// also closes the session. Larger files start with the first chunk and
/// append the rest, each chunk `chunk_size` bytes except the last. Whichever
/// call carries the last chunk closes the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    size: u64,
    chunk_size: u64,
}

impl ChunkPlan {
    pub fn new(size: u64, chunk_size: u64) -> Self {
        Self {
            size,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_single_shot(&self) -> bool {
        self.size < self.chunk_size
    }

    pub fn chunk_count(&self) -> u64 {
        if self.is_single_shot() {
            1
        } else {
            self.size.div_ceil(self.chunk_size)
        }
    }

    /// Append calls after the opening start call.
    pub fn append_count(&self) -> u64 {
        self.chunk_count() - 1
    }

    pub fn chunks(&self) -> impl Iterator<Item = Chunk> + '_ {
        let count = self.chunk_count();
        (0..count).map(move |index| {
            let start = index * self.chunk_size;
            let end = if index + 1 == count {
                self.size
            } else {
                start + self.chunk_size
            };
            Chunk {
                index,
                start,
                end,
                is_last: index + 1 == count,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: u64 = 1024 * 1024;

    fn assert_partitions(plan: ChunkPlan) {
        let chunks: Vec<_> = plan.chunks().collect();
        assert_eq!(chunks.len() as u64, plan.chunk_count());
        let mut expected_start = 0;
        for chunk in &chunks {
            assert_eq!(chunk.start, expected_start);
            assert!(chunk.end > chunk.start || plan.size() == 0);
            expected_start = chunk.end;
        }
        assert_eq!(expected_start, plan.size());
        assert!(chunks.last().unwrap().is_last);
        assert_eq!(chunks.iter().filter(|c| c.is_last).count(), 1);
    }

    #[test]
    fn small_and_empty_files_are_single_shot() {
        for size in [0, 1, 1024, 24 * MB - 1] {
            let plan = ChunkPlan::new(size, 24 * MB);
            assert!(plan.is_single_shot(), "size {size}");
            assert_eq!(plan.append_count(), 0);
            assert_partitions(plan);
        }
    }

    #[test]
    fn thirty_megabytes_is_start_plus_one_append() {
        let plan = ChunkPlan::new(30 * MB, 24 * MB);
        let chunks: Vec<_> = plan.chunks().collect();
        assert_eq!(plan.append_count(), 1);
        assert_eq!(chunks[0].len(), 24 * MB);
        assert_eq!(chunks[1].len(), 6 * MB);
        assert!(chunks[1].is_last);
    }

    #[test]
    fn exact_multiples_have_no_empty_tail() {
        let plan = ChunkPlan::new(48 * MB, 24 * MB);
        assert_eq!(plan.chunk_count(), 2);
        assert!(plan.chunks().all(|c| c.len() == 24 * MB));

        // one full chunk: the start call is also the closing call
        let plan = ChunkPlan::new(24 * MB, 24 * MB);
        assert!(!plan.is_single_shot());
        assert_eq!(plan.append_count(), 0);
        let only = plan.chunks().next().unwrap();
        assert!(only.is_last);
        assert_eq!(only.len(), 24 * MB);
    }

    #[test]
    fn partitions_hold_for_awkward_sizes() {
        for (size, chunk) in [(1000, 7), (1001, 1000), (4096, 4096), (9_999, 10), (5, 1)] {
            assert_partitions(ChunkPlan::new(size, chunk));
        }
    }
}
