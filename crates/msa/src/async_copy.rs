/// Copies in flight on one copy engine.
///
/// A copy with `start_after = s` and `done_before = d` is outstanding at
/// every time `t` with `s < t < d`.
#[derive(Debug, Clone)]
pub struct AsyncCopyTracker {
    /// `-1` disables the bound.
    limit: i64,
    copies: Vec<(i64, i64)>,
}

impl AsyncCopyTracker {
    pub fn new(limit: i64) -> Self {
        Self {
            limit,
            copies: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.copies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.copies.is_empty()
    }

    pub fn copies(&self) -> &[(i64, i64)] {
        &self.copies
    }

    fn outstanding_at(copies: &[(i64, i64)], t: i64) -> i64 {
        copies.iter().filter(|(s, d)| *s < t && t < *d).count() as i64
    }

    /// Maximum number of outstanding copies over `start_after..done_before`.
    pub fn max_outstanding_in(&self, start_after: i64, done_before: i64) -> i64 {
        (start_after + 1..done_before)
            .map(|t| Self::outstanding_at(&self.copies, t))
            .max()
            .unwrap_or(0)
    }

    /// Maximum number of outstanding copies at any time.
    pub fn max_outstanding(&self) -> i64 {
        self.copies
            .iter()
            .map(|&(s, _)| Self::outstanding_at(&self.copies, s + 1))
            .max()
            .unwrap_or(0)
    }

    /// Returns `true` if adding copies over the given windows would exceed
    /// the engine depth at some time.
    pub fn would_exceed(&self, windows: &[(i64, i64)]) -> bool {
        if self.limit < 0 {
            return false;
        }
        let mut all = self.copies.clone();
        all.extend_from_slice(windows);
        windows.iter().any(|&(s, d)| {
            (s + 1..d).any(|t| Self::outstanding_at(&all, t) > self.limit)
        })
    }

    /// Returns `true` if a copy over `start_after..done_before` would finish
    /// out of start order with a tracked copy.
    pub fn violates_fifo(&self, start_after: i64, done_before: i64) -> bool {
        self.copies.iter().any(|&(s, d)| {
            (s < start_after && d > done_before) || (start_after < s && done_before > d)
        })
    }

    pub fn add(&mut self, start_after: i64, done_before: i64) {
        self.copies.push((start_after, done_before));
    }

    /// Drops every copy added after the tracker had `len` copies.
    pub fn truncate(&mut self, len: usize) {
        self.copies.truncate(len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounds_outstanding_copies() {
        let mut tracker = AsyncCopyTracker::new(1);
        tracker.add(0, 4);
        assert!(tracker.would_exceed(&[(2, 6)]));
        // Touching windows do not overlap.
        assert!(!tracker.would_exceed(&[(3, 6)]));
        assert_eq!(tracker.max_outstanding_in(0, 4), 1);

        let unbounded = AsyncCopyTracker::new(-1);
        assert!(!unbounded.would_exceed(&[(0, 10), (0, 10)]));
    }

    #[test]
    fn detects_fifo_inversions() {
        let mut tracker = AsyncCopyTracker::new(-1);
        tracker.add(2, 8);
        assert!(tracker.violates_fifo(3, 7));
        assert!(tracker.violates_fifo(1, 9));
        assert!(!tracker.violates_fifo(3, 9));
        assert!(!tracker.violates_fifo(2, 5));

        tracker.add(3, 9);
        assert_eq!(tracker.max_outstanding(), 2);
        tracker.truncate(1);
        assert_eq!(tracker.len(), 1);
    }
}
