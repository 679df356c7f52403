//! Reassignment of alternate-memory offsets to undo fragmentation.
//!
//! The allocator exports every committed chunk as a [`RepackBlock`]. A
//! [`Repacker`] may move blocks to new offsets; blocks of one colocation
//! group move together and fixed blocks stay where they are. An accepted
//! result is applied to the allocations and the interval tree is rebuilt.
use cranelift_entity::EntityRef;
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::{
    algorithm::{MsaAlgorithm, Occupant},
    allocation::AllocationKind,
    chunk::{Chunk, ChunkFinder, ChunkPiece},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepackSlice {
    /// First time the slice is reserved.
    pub start: i64,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepackBlock {
    pub id: usize,
    pub start: i64,
    pub end: i64,
    pub size: u64,
    pub offset: u64,
    /// Blocks sharing a group must keep sharing an offset.
    pub colocation: usize,
    pub slices: Vec<RepackSlice>,
    /// Fixed blocks must keep their offset.
    pub fixed: bool,
}

impl RepackBlock {
    fn overlaps(&self, other: &Self) -> bool {
        self.start <= other.end
            && other.start <= self.end
            && Chunk::new(self.offset, self.size).overlaps(&Chunk::new(other.offset, other.size))
    }
}

pub trait Repacker {
    /// Assigns new offsets to `blocks`. Returns `false` if no packing within
    /// `max_size` bytes was found, in which case offsets are ignored.
    fn repack(&self, blocks: &mut [RepackBlock], max_size: u64) -> bool;
}

/// Places colocation groups largest first at the lowest offset that fits.
#[derive(Debug, Clone, Copy)]
pub struct BestFitRepacker {
    pub alignment: u64,
}

impl BestFitRepacker {
    pub fn new(alignment: u64) -> Self {
        Self {
            alignment: alignment.max(1),
        }
    }
}

impl Repacker for BestFitRepacker {
    fn repack(&self, blocks: &mut [RepackBlock], max_size: u64) -> bool {
        let mut groups: FxHashMap<usize, Vec<usize>> = FxHashMap::default();
        for (i, block) in blocks.iter().enumerate() {
            groups.entry(block.colocation).or_default().push(i);
        }
        let mut order: Vec<Vec<usize>> = groups.into_values().collect();
        let key = |group: &Vec<usize>| {
            let fixed = group.iter().any(|&i| blocks[i].fixed);
            let size = group.iter().map(|&i| blocks[i].size).max().unwrap_or(0);
            let start = group.iter().map(|&i| blocks[i].start).min().unwrap_or(0);
            (!fixed, std::cmp::Reverse(size), start, group[0])
        };
        order.sort_by_key(key);

        let finder = ChunkFinder {
            max_size,
            alignment: self.alignment,
        };
        let mut placed: Vec<(i64, i64, Chunk)> = Vec::new();
        for group in order {
            let fixed = group.iter().find(|&&i| blocks[i].fixed).map(|&i| blocks[i].offset);
            let pieces: Vec<ChunkPiece> = group
                .iter()
                .map(|&i| ChunkPiece::whole(blocks[i].start, blocks[i].end, blocks[i].size))
                .collect();
            let Some(offset) = finder.find(&placed, &pieces, fixed) else {
                return false;
            };
            for &i in &group {
                blocks[i].offset = offset;
                placed.push((blocks[i].start, blocks[i].end, Chunk::new(offset, blocks[i].size)));
            }
        }
        true
    }
}

/// Returns `true` if `after` is a legal repacking of `before`.
fn is_valid_packing(before: &[RepackBlock], after: &[RepackBlock], max_size: u64, alignment: u64) -> bool {
    if before.len() != after.len() {
        return false;
    }
    let mut group_offset: FxHashMap<usize, u64> = FxHashMap::default();
    for (old, new) in before.iter().zip(after) {
        let fits = new.offset.checked_add(new.size).is_some_and(|end| end <= max_size);
        if !fits || new.offset % alignment != 0 || (old.fixed && old.offset != new.offset) {
            return false;
        }
        if *group_offset.entry(new.colocation).or_insert(new.offset) != new.offset {
            return false;
        }
    }
    after.iter().enumerate().all(|(i, a)| {
        after[i + 1..]
            .iter()
            .all(|b| a.colocation == b.colocation || !a.overlaps(b))
    })
}

impl MsaAlgorithm<'_> {
    /// Offers the committed allocations to the configured repacker.
    pub(crate) fn repack(&mut self) {
        let options = self.options;
        let Some(repacker) = options.repacker.as_deref() else {
            return;
        };
        self.stats.repacks_attempted += 1;

        let mut blocks = Vec::new();
        let mut owners = Vec::new();
        for id in self.allocations.ids_from(0).take(self.committed) {
            let a = &self.allocations[id];
            let Some(chunk) = a.chunk else {
                continue;
            };
            let slices = match &a.kind {
                AllocationKind::SlicedCopy { slices, .. } => slices
                    .iter()
                    .map(|s| RepackSlice {
                        start: s.start_after + 1,
                        size: s.chunk.size,
                    })
                    .collect(),
                _ => Vec::new(),
            };
            blocks.push(RepackBlock {
                id: blocks.len(),
                start: a.occupied_start(),
                end: a.end,
                size: chunk.size,
                offset: chunk.offset,
                colocation: self.aliased.find(id).index(),
                slices,
                fixed: false,
            });
            owners.push(Some(id));
        }
        let first_scoped_group = self.allocations.len();
        for (n, &(inst, chunk)) in self.scoped.iter().enumerate() {
            let time = self.cx.live.time(inst);
            blocks.push(RepackBlock {
                id: blocks.len(),
                start: time,
                end: time,
                size: chunk.size,
                offset: chunk.offset,
                colocation: first_scoped_group + n,
                slices: Vec::new(),
                fixed: true,
            });
            owners.push(None);
        }

        let before = blocks.clone();
        if !repacker.repack(&mut blocks, options.max_size_bytes)
            || !is_valid_packing(&before, &blocks, options.max_size_bytes, options.alignment_bytes)
        {
            warn!(blocks = blocks.len(), "repack rejected");
            return;
        }

        for (block, owner) in blocks.iter().zip(owners) {
            let Some(id) = owner else {
                continue;
            };
            let allocation = &mut self.allocations[id];
            let Some(chunk) = allocation.chunk.as_mut() else {
                continue;
            };
            let old = chunk.offset;
            chunk.offset = block.offset;
            if let AllocationKind::SlicedCopy { slices, .. } = &mut allocation.kind {
                for slice in slices {
                    slice.chunk.offset = block.offset + (slice.chunk.offset - old);
                }
            }
        }

        self.tree.clear();
        for &(inst, chunk) in &self.scoped {
            let time = self.cx.live.time(inst);
            self.tree.insert(time, time, chunk, Occupant::Scoped(inst));
        }
        for id in self.allocations.ids_from(0).take(self.committed) {
            for (start, end, chunk) in self.allocations[id].occupied() {
                self.tree.insert(start, end, chunk, Occupant::Allocation(id));
            }
        }
        self.stats.repacks_accepted += 1;
        debug!(blocks = blocks.len(), "repacked alternate memory");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(id: usize, start: i64, end: i64, size: u64, offset: u64) -> RepackBlock {
        RepackBlock {
            id,
            start,
            end,
            size,
            offset,
            colocation: id,
            slices: Vec::new(),
            fixed: false,
        }
    }

    #[test]
    fn best_fit_compacts_blocks() {
        let mut blocks = vec![
            block(0, 0, 4, 32, 32),
            block(1, 5, 9, 32, 64),
            block(2, 0, 9, 16, 96),
        ];
        let before = blocks.clone();
        assert!(BestFitRepacker::new(16).repack(&mut blocks, 128));
        assert!(is_valid_packing(&before, &blocks, 128, 16));
        assert_eq!(blocks[0].offset, 0);
        assert_eq!(blocks[1].offset, 0);
        assert_eq!(blocks[2].offset, 32);
    }

    #[test]
    fn fixed_blocks_and_groups_hold() {
        let mut blocks = vec![block(0, 0, 0, 16, 48), block(1, 0, 3, 32, 64), block(2, 4, 8, 32, 0)];
        blocks[0].fixed = true;
        blocks[2].colocation = 1;
        let before = blocks.clone();
        assert!(BestFitRepacker::new(1).repack(&mut blocks, 128));
        assert!(is_valid_packing(&before, &blocks, 128, 1));
        assert_eq!(blocks[0].offset, 48);
        assert_eq!(blocks[1].offset, 0);
        assert_eq!(blocks[2].offset, 0);

        assert!(!BestFitRepacker::new(1).repack(&mut blocks, 40));
    }
}
