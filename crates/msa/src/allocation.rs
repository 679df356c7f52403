//! Allocation records produced by the allocator.
//!
//! Every value ends up with one or more allocations, each of which places the
//! value in one memory space over an inclusive time range. Allocations refer
//! to each other by [`AllocationId`] only, so loop carries and copies never
//! form ownership cycles.
use std::{fmt, ops};

use cranelift_entity::{entity_impl, EntityRef};
use ir::{BufferId, CompId, Position, Use, ValueId};
use smallvec::SmallVec;

use crate::{chunk::Chunk, slicing::SliceProposal};

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AllocationId(u32);
entity_impl!(AllocationId, "alloc");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemorySpace {
    Default,
    Alternate,
}

impl fmt::Display for MemorySpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => f.write_str("default"),
            Self::Alternate => f.write_str("alternate"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CopyKind {
    Prefetch,
    Eviction,
}

/// One slice of a sliced prefetch.
#[derive(Debug, Clone, PartialEq)]
pub struct SliceDetail {
    pub start_after: i64,
    pub done_before: i64,
    pub chunk: Chunk,
    pub proposal: SliceProposal,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AllocationKind {
    /// The value sits in one place for the whole range.
    Pinned,
    /// Asynchronous copy from `prev` into this allocation.
    Copy {
        prev: AllocationId,
        start_after: i64,
        done_before: i64,
        /// Set for copies that overlap the previous run of the program.
        cross_program: bool,
    },
    /// Prefetch split into slices joined by a concatenation.
    SlicedCopy {
        prev: AllocationId,
        slices: Vec<SliceDetail>,
    },
    /// Default-memory allocation of an ancestor computation made visible in a
    /// nested computation.
    Mirrored { original: AllocationId },
    /// An allocation made inside a loop body, exposed after the loop through
    /// an extra loop result.
    Parent { original: AllocationId },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Allocation {
    pub value: ValueId,
    pub buffer: BufferId,
    /// Where the allocation becomes visible.
    pub position: Position,
    /// Computation whose instructions, and the computations they call, can
    /// read the allocation.
    pub home: CompId,
    pub space: MemorySpace,
    pub chunk: Option<Chunk>,
    pub start: i64,
    pub end: i64,
    pub uses: Vec<Use>,
    pub kind: AllocationKind,
}

impl Allocation {
    pub fn pinned(
        value: ValueId,
        buffer: BufferId,
        position: Position,
        home: CompId,
        space: MemorySpace,
        chunk: Option<Chunk>,
        start: i64,
    ) -> Self {
        Self {
            value,
            buffer,
            position,
            home,
            space,
            chunk,
            start,
            end: start,
            uses: Vec::new(),
            kind: AllocationKind::Pinned,
        }
    }

    pub fn is_alternate(&self) -> bool {
        self.space == MemorySpace::Alternate
    }

    pub fn is_default(&self) -> bool {
        self.space == MemorySpace::Default
    }

    pub fn is_copy(&self) -> bool {
        matches!(
            self.kind,
            AllocationKind::Copy { .. } | AllocationKind::SlicedCopy { .. }
        )
    }

    pub fn copy_kind(&self) -> Option<CopyKind> {
        self.is_copy().then_some(match self.space {
            MemorySpace::Alternate => CopyKind::Prefetch,
            MemorySpace::Default => CopyKind::Eviction,
        })
    }

    /// The allocation this one copies from.
    pub fn prev(&self) -> Option<AllocationId> {
        match self.kind {
            AllocationKind::Copy { prev, .. } | AllocationKind::SlicedCopy { prev, .. } => {
                Some(prev)
            }
            _ => None,
        }
    }

    /// `(start_after, done_before)` of a copy. For sliced copies the
    /// earliest slice start and the latest slice end.
    pub fn copy_window(&self) -> Option<(i64, i64)> {
        match &self.kind {
            AllocationKind::Copy {
                start_after,
                done_before,
                ..
            } => Some((*start_after, *done_before)),
            AllocationKind::SlicedCopy { slices, .. } => {
                let start = slices.iter().map(|s| s.start_after).min()?;
                let done = slices.iter().map(|s| s.done_before).max()?;
                Some((start, done))
            }
            _ => None,
        }
    }

    /// Copy windows, one per slice.
    pub fn copy_windows(&self) -> SmallVec<[(i64, i64); 1]> {
        match &self.kind {
            AllocationKind::SlicedCopy { slices, .. } => slices
                .iter()
                .map(|s| (s.start_after, s.done_before))
                .collect(),
            _ => self.copy_window().into_iter().collect(),
        }
    }

    /// Chunks reserved by the allocation with the inclusive time ranges they
    /// are reserved for. A copy destination is reserved from the step after
    /// its copy starts.
    pub fn occupied(&self) -> SmallVec<[(i64, i64, Chunk); 1]> {
        let Some(chunk) = self.chunk else {
            return SmallVec::new();
        };
        match &self.kind {
            AllocationKind::Copy { start_after, .. } => {
                smallvec::smallvec![(start_after + 1, self.end, chunk)]
            }
            AllocationKind::SlicedCopy { slices, .. } => slices
                .iter()
                .map(|s| (s.start_after + 1, self.end, s.chunk))
                .collect(),
            _ => smallvec::smallvec![(self.start, self.end, chunk)],
        }
    }

    /// First time the chunk is reserved.
    pub fn occupied_start(&self) -> i64 {
        self.occupied()
            .iter()
            .map(|(s, _, _)| *s)
            .min()
            .unwrap_or(self.start)
    }

    pub fn is_cross_program_prefetch(&self) -> bool {
        matches!(
            self.kind,
            AllocationKind::Copy {
                cross_program: true,
                ..
            }
        )
    }
}

impl fmt::Display for Allocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.kind {
            AllocationKind::Pinned => "pinned".to_string(),
            AllocationKind::Copy {
                prev,
                start_after,
                done_before,
                ..
            } => format!("copy from {prev} ({start_after}, {done_before})"),
            AllocationKind::SlicedCopy { prev, slices } => {
                format!("sliced copy from {prev} in {} slices", slices.len())
            }
            AllocationKind::Mirrored { original } => format!("mirror of {original}"),
            AllocationKind::Parent { original } => format!("parent of {original}"),
        };
        write!(
            f,
            "{} {} [{}, {}] {kind}",
            self.value, self.space, self.start, self.end
        )?;
        if let Some(chunk) = self.chunk {
            write!(f, " at {chunk}")?;
        }
        Ok(())
    }
}

/// All allocations in creation order.
#[derive(Debug, Clone, Default)]
pub struct AllocationSequence {
    allocations: Vec<Allocation>,
}

impl AllocationSequence {
    pub fn push(&mut self, allocation: Allocation) -> AllocationId {
        self.allocations.push(allocation);
        AllocationId::new(self.allocations.len() - 1)
    }

    pub fn len(&self) -> usize {
        self.allocations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty()
    }

    pub fn truncate(&mut self, len: usize) {
        self.allocations.truncate(len);
    }

    pub fn iter(&self) -> impl Iterator<Item = (AllocationId, &Allocation)> {
        self.allocations
            .iter()
            .enumerate()
            .map(|(i, a)| (AllocationId::new(i), a))
    }

    pub fn ids_from(&self, start: usize) -> impl Iterator<Item = AllocationId> {
        (start..self.allocations.len()).map(AllocationId::new)
    }

    pub fn of_value(&self, value: ValueId) -> impl Iterator<Item = (AllocationId, &Allocation)> {
        self.iter().filter(move |(_, a)| a.value == value)
    }
}

impl ops::Index<AllocationId> for AllocationSequence {
    type Output = Allocation;

    fn index(&self, id: AllocationId) -> &Allocation {
        &self.allocations[id.index()]
    }
}

impl ops::IndexMut<AllocationId> for AllocationSequence {
    fn index_mut(&mut self, id: AllocationId) -> &mut Allocation {
        &mut self.allocations[id.index()]
    }
}

/// Union-find over allocations that must share an offset. Unions are logged
/// so a failed attempt can be undone.
#[derive(Debug, Clone, Default)]
pub struct AliasedOffsets {
    parent: Vec<AllocationId>,
    log: Vec<(AllocationId, AllocationId)>,
}

impl AliasedOffsets {
    /// Registers allocations up to and including `id`.
    pub fn grow(&mut self, id: AllocationId) {
        while self.parent.len() <= id.index() {
            self.parent.push(AllocationId::new(self.parent.len()));
        }
    }

    pub fn find(&self, mut id: AllocationId) -> AllocationId {
        while let Some(&p) = self.parent.get(id.index()) {
            if p == id {
                break;
            }
            id = p;
        }
        id
    }

    pub fn union(&mut self, a: AllocationId, b: AllocationId) {
        self.grow(a.max(b));
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        let (lo, hi) = if ra < rb { (ra, rb) } else { (rb, ra) };
        self.log.push((hi, self.parent[hi.index()]));
        self.parent[hi.index()] = lo;
    }

    pub fn same(&self, a: AllocationId, b: AllocationId) -> bool {
        self.find(a) == self.find(b)
    }

    /// Every allocation in the set of `id`, `id` included.
    pub fn members(&self, id: AllocationId) -> Vec<AllocationId> {
        let root = self.find(id);
        let mut members: Vec<_> = (0..self.parent.len())
            .map(AllocationId::new)
            .filter(|&a| self.find(a) == root)
            .collect();
        if members.is_empty() {
            members.push(id);
        }
        members
    }

    /// Sets with more than one member.
    pub fn groups(&self) -> Vec<Vec<AllocationId>> {
        let mut groups: Vec<Vec<AllocationId>> = Vec::new();
        let mut index_of_root = vec![usize::MAX; self.parent.len()];
        for i in 0..self.parent.len() {
            let root = self.find(AllocationId::new(i)).index();
            if index_of_root[root] == usize::MAX {
                index_of_root[root] = groups.len();
                groups.push(Vec::new());
            }
            groups[index_of_root[root]].push(AllocationId::new(i));
        }
        groups.retain(|g| g.len() > 1);
        groups
    }

    pub fn checkpoint(&self) -> usize {
        self.log.len()
    }

    /// Undoes unions made after `checkpoint` and forgets allocations from
    /// `allocations` on.
    pub fn rollback(&mut self, checkpoint: usize, allocations: usize) {
        while self.log.len() > checkpoint {
            if let Some((id, old)) = self.log.pop() {
                self.parent[id.index()] = old;
            }
        }
        self.parent.truncate(allocations);
    }
}

#[cfg(test)]
mod tests {
    use ir::{InstId, ShapeIndex};

    use super::*;

    fn pinned(start: i64, end: i64, chunk: Option<Chunk>) -> Allocation {
        let mut a = Allocation::pinned(
            ValueId::new(0),
            BufferId::new(0),
            Position::new(InstId::new(0), ShapeIndex::empty()),
            CompId::new(0),
            if chunk.is_some() {
                MemorySpace::Alternate
            } else {
                MemorySpace::Default
            },
            chunk,
            start,
        );
        a.end = end;
        a
    }

    #[test]
    fn copies_reserve_from_after_their_start() {
        let mut seq = AllocationSequence::default();
        let src = seq.push(pinned(0, 3, None));
        let mut dst = pinned(5, 8, Some(Chunk::new(0, 64)));
        dst.kind = AllocationKind::Copy {
            prev: src,
            start_after: 1,
            done_before: 5,
            cross_program: false,
        };
        let dst = seq.push(dst);

        assert_eq!(seq[dst].occupied().as_slice(), &[(2, 8, Chunk::new(0, 64))]);
        assert_eq!(seq[dst].copy_kind(), Some(CopyKind::Prefetch));
        assert_eq!(seq[dst].prev(), Some(src));
        assert!(seq[src].occupied().is_empty());
        assert_eq!(
            seq[dst].to_string(),
            "v0 alternate [5, 8] copy from alloc0 (1, 5) at [0, 64)"
        );
    }

    #[test]
    fn aliased_offsets_roll_back() {
        let mut aliased = AliasedOffsets::default();
        let ids: Vec<_> = (0..4).map(AllocationId::new).collect();
        aliased.grow(ids[3]);
        aliased.union(ids[0], ids[1]);
        let cp = aliased.checkpoint();
        aliased.union(ids[1], ids[3]);
        assert!(aliased.same(ids[0], ids[3]));
        assert_eq!(aliased.members(ids[3]), vec![ids[0], ids[1], ids[3]]);

        aliased.rollback(cp, 4);
        assert!(!aliased.same(ids[0], ids[3]));
        assert!(aliased.same(ids[0], ids[1]));
        assert_eq!(aliased.groups(), vec![vec![ids[0], ids[1]]]);
    }
}
