use std::fmt;

/// A byte range `[offset, offset + size)` of alternate memory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Chunk {
    pub offset: u64,
    pub size: u64,
}

impl Chunk {
    pub fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    pub fn end(&self) -> u64 {
        self.offset + self.size
    }

    pub fn overlaps(&self, other: &Chunk) -> bool {
        self.size != 0 && other.size != 0 && self.offset < other.end() && other.offset < self.end()
    }
}

impl fmt::Display for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.offset, self.end())
    }
}

/// Part of a chunk request: `size` bytes at `base + offset`, reserved over
/// the inclusive time range `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPiece {
    pub start: i64,
    pub end: i64,
    pub offset: u64,
    pub size: u64,
}

impl ChunkPiece {
    pub fn whole(start: i64, end: i64, size: u64) -> Self {
        Self {
            start,
            end,
            offset: 0,
            size,
        }
    }
}

/// First-fit search over the offsets of alternate memory.
#[derive(Debug, Clone, Copy)]
pub struct ChunkFinder {
    pub max_size: u64,
    pub alignment: u64,
}

impl ChunkFinder {
    fn align(&self, offset: u64) -> u64 {
        offset.div_ceil(self.alignment) * self.alignment
    }

    /// Smallest aligned base offset at which every piece avoids the
    /// `occupied` chunks it overlaps in time. With a preferred offset only
    /// that offset is tried. Pieces of one request sit next to each other,
    /// so a sliced request ends up in one contiguous range.
    pub fn find(
        &self,
        occupied: &[(i64, i64, Chunk)],
        pieces: &[ChunkPiece],
        preferred_offset: Option<u64>,
    ) -> Option<u64> {
        let total = pieces.iter().map(|p| p.offset + p.size).max().unwrap_or(0);
        let fits = |base: u64| base.checked_add(total).is_some_and(|end| end <= self.max_size);

        if let Some(base) = preferred_offset {
            return (fits(base) && self.conflict_end(occupied, pieces, base).is_none())
                .then_some(base);
        }

        let mut base = 0;
        while fits(base) {
            match self.conflict_end(occupied, pieces, base) {
                None => return Some(base),
                Some(next) => base = self.align(next.max(base + 1)),
            }
        }
        None
    }

    /// The lowest base past every chunk conflicting with a piece placed at
    /// `base`, or `None` without conflicts.
    fn conflict_end(&self, occupied: &[(i64, i64, Chunk)], pieces: &[ChunkPiece], base: u64) -> Option<u64> {
        let mut next: Option<u64> = None;
        for piece in pieces {
            let wanted = Chunk::new(base + piece.offset, piece.size);
            for (start, end, chunk) in occupied {
                if *start <= piece.end && piece.start <= *end && chunk.overlaps(&wanted) {
                    let past = chunk.end().saturating_sub(piece.offset);
                    next = Some(next.map_or(past, |n| n.max(past)));
                }
            }
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finder(max_size: u64) -> ChunkFinder {
        ChunkFinder {
            max_size,
            alignment: 1,
        }
    }

    #[test]
    fn first_fit_skips_time_overlapping_chunks() {
        let occupied = [(0, 3, Chunk::new(0, 64)), (10, 12, Chunk::new(64, 64))];
        let f = finder(128);
        assert_eq!(f.find(&occupied, &[ChunkPiece::whole(2, 5, 64)], None), Some(64));
        assert_eq!(f.find(&occupied, &[ChunkPiece::whole(4, 9, 128)], None), Some(0));
        assert_eq!(f.find(&occupied, &[ChunkPiece::whole(2, 11, 64)], None), None);
        assert_eq!(finder(64).find(&occupied, &[ChunkPiece::whole(2, 5, 64)], None), None);
    }

    #[test]
    fn preferred_offset_is_the_only_candidate() {
        let occupied = [(0, 3, Chunk::new(0, 64))];
        let f = finder(256);
        assert_eq!(f.find(&occupied, &[ChunkPiece::whole(0, 1, 32)], Some(32)), None);
        assert_eq!(f.find(&occupied, &[ChunkPiece::whole(0, 1, 32)], Some(64)), Some(64));
        assert_eq!(f.find(&occupied, &[ChunkPiece::whole(0, 1, 32)], Some(240)), None);
    }

    #[test]
    fn aligned_and_contiguous_slices() {
        let occupied = [(0, 2, Chunk::new(0, 10)), (6, 8, Chunk::new(40, 8))];
        let f = ChunkFinder {
            max_size: 256,
            alignment: 16,
        };
        let pieces = [
            ChunkPiece {
                start: 1,
                end: 9,
                offset: 0,
                size: 16,
            },
            ChunkPiece {
                start: 5,
                end: 9,
                offset: 16,
                size: 16,
            },
        ];
        // 16 clashes with the second piece at [32, 48) during 6..=8.
        assert_eq!(f.find(&occupied, &pieces, None), Some(48));
    }
}
