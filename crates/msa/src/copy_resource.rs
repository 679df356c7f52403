//! Per-time copy bandwidth ledger.
//!
//! Every logical time offers an amount of copy resource equal to the elapsed
//! time of its instruction. Copies consume resource greedily from the step
//! after their start, in order of start time, so a copy that cannot finish in
//! its own steps delays every copy that starts after it.
use std::collections::BTreeMap;

use cranelift_entity::entity_impl;
use rustc_hash::FxHashMap;

const EPSILON: f64 = 1e-9;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CopyKey(u32);
entity_impl!(CopyKey, "copy");

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CopySpec {
    pub start_after: i64,
    pub done_before: i64,
    pub amount: f64,
}

#[derive(Debug, Clone, Copy)]
struct CopyRecord {
    key: CopyKey,
    spec: CopySpec,
}

#[derive(Debug, Clone)]
pub struct CopyResource {
    initial: Vec<f64>,
    delay: Vec<f64>,
    copies: BTreeMap<i64, Vec<CopyRecord>>,
    next_key: u32,
}

impl CopyResource {
    pub fn new(initial: Vec<f64>) -> Self {
        let delay = vec![0.0; initial.len()];
        Self {
            initial,
            delay,
            copies: BTreeMap::new(),
            next_key: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.initial.len()
    }

    pub fn is_empty(&self) -> bool {
        self.initial.is_empty()
    }

    /// Resource already claimed at `time`.
    pub fn delay(&self, time: i64) -> f64 {
        self.delay.get(time as usize).copied().unwrap_or(0.0)
    }

    pub fn free(&self, time: i64) -> f64 {
        let t = time as usize;
        match self.initial.get(t) {
            Some(initial) => initial - self.delay[t],
            None => 0.0,
        }
    }

    /// Committed copies in processing order.
    fn ordered(&self) -> impl Iterator<Item = CopySpec> + '_ {
        self.copies.values().flatten().map(|r| r.spec)
    }

    /// Replays `copies`, which must be sorted by start time. Returns the
    /// resulting claims and whether every copy finished before its deadline.
    fn simulate(&self, copies: impl Iterator<Item = CopySpec>) -> (Vec<f64>, bool) {
        let mut claimed = vec![0.0; self.initial.len()];
        let mut ok = true;
        for copy in copies {
            let mut remaining = copy.amount;
            let mut t = (copy.start_after + 1).max(0);
            let end = copy.done_before.min(self.initial.len() as i64);
            while remaining > EPSILON && t < end {
                let i = t as usize;
                let take = (self.initial[i] - claimed[i]).max(0.0).min(remaining);
                claimed[i] += take;
                remaining -= take;
                t += 1;
            }
            if remaining > EPSILON {
                ok = false;
            }
        }
        (claimed, ok)
    }

    /// Existing copies merged with `extra`; extra copies come after existing
    /// ones with the same start time.
    fn merged(&self, extra: &[CopySpec]) -> Vec<CopySpec> {
        let mut extra: Vec<CopySpec> = extra.to_vec();
        extra.sort_by_key(|c| c.start_after);
        let mut out = Vec::with_capacity(extra.len());
        let mut extra = extra.into_iter().peekable();
        for copy in self.ordered() {
            while let Some(e) = extra.next_if(|e| e.start_after < copy.start_after) {
                out.push(e);
            }
            out.push(copy);
        }
        out.extend(extra);
        out
    }

    pub fn has_enough(&self, start_after: i64, done_before: i64, amount: f64) -> bool {
        self.has_enough_multi(&[CopySpec {
            start_after,
            done_before,
            amount,
        }])
    }

    /// Checks that every copy in `specs` fits together with the committed
    /// copies, without modifying the ledger.
    pub fn has_enough_multi(&self, specs: &[CopySpec]) -> bool {
        self.simulate(self.merged(specs).into_iter()).1
    }

    /// Claims resource for a copy. Previous claims of the touched times are
    /// recorded in `changes` so the claim can be undone with [`Self::undo`].
    /// A successful claim must be followed by [`Self::add`].
    pub fn try_consume(
        &mut self,
        start_after: i64,
        done_before: i64,
        amount: f64,
        changes: &mut FxHashMap<i64, f64>,
    ) -> bool {
        let spec = CopySpec {
            start_after,
            done_before,
            amount,
        };
        let (claimed, ok) = self.simulate(self.merged(&[spec]).into_iter());
        if !ok {
            return false;
        }
        for (t, new) in claimed.into_iter().enumerate() {
            if (new - self.delay[t]).abs() > EPSILON {
                changes.entry(t as i64).or_insert(self.delay[t]);
                self.delay[t] = new;
            }
        }
        true
    }

    pub fn undo(&mut self, changes: &FxHashMap<i64, f64>) {
        for (&t, &old) in changes {
            if let Some(d) = self.delay.get_mut(t as usize) {
                *d = old;
            }
        }
    }

    /// Records a copy so later copies account for it.
    pub fn add(&mut self, start_after: i64, done_before: i64, amount: f64) -> CopyKey {
        let key = CopyKey(self.next_key);
        self.next_key += 1;
        self.copies.entry(start_after).or_default().push(CopyRecord {
            key,
            spec: CopySpec {
                start_after,
                done_before,
                amount,
            },
        });
        self.refresh();
        key
    }

    /// Removes a copy. Copies added later with the same start time are
    /// popped and pushed back so their relative order is kept.
    pub fn remove(&mut self, key: CopyKey) {
        let Some(start) = self
            .copies
            .iter()
            .find_map(|(start, list)| list.iter().any(|r| r.key == key).then_some(*start))
        else {
            return;
        };
        if let Some(list) = self.copies.get_mut(&start) {
            let mut popped = Vec::new();
            while let Some(record) = list.pop() {
                if record.key == key {
                    break;
                }
                popped.push(record);
            }
            while let Some(record) = popped.pop() {
                list.push(record);
            }
            if list.is_empty() {
                self.copies.remove(&start);
            }
        }
        self.refresh();
    }

    pub fn copy_count(&self) -> usize {
        self.copies.values().map(Vec::len).sum()
    }

    fn refresh(&mut self) {
        self.delay = self.simulate(self.ordered()).0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn late_copy_pushes_back_next_copy() {
        let mut ledger = CopyResource::new(vec![1.0; 4]);
        let mut changes = FxHashMap::default();
        assert!(ledger.try_consume(-1, 2, 1.5, &mut changes));
        ledger.add(-1, 2, 1.5);
        assert_eq!(ledger.free(0), 0.0);
        assert_eq!(ledger.free(1), 0.5);

        // Only half a unit is left at time 1, the rest spills into time 2.
        assert!(ledger.has_enough(0, 3, 1.0));
        let b = ledger.add(0, 3, 1.0);
        assert_eq!(ledger.free(2), 0.5);

        assert!(!ledger.has_enough(0, 3, 1.0));
        let mut changes = FxHashMap::default();
        assert!(!ledger.try_consume(0, 3, 1.0, &mut changes));
        assert!(changes.is_empty());

        ledger.remove(b);
        assert_eq!(ledger.free(2), 1.0);
        assert!(ledger.has_enough(0, 3, 1.0));
    }

    #[test]
    fn earlier_copy_can_starve_committed_copy() {
        let mut ledger = CopyResource::new(vec![1.0; 4]);
        ledger.add(1, 3, 1.0);
        // A copy starting at -1 needing three units would leave nothing for
        // the committed copy at time 2.
        assert!(!ledger.has_enough(-1, 4, 3.0));
        assert!(ledger.has_enough(-1, 4, 2.0));
    }

    #[test]
    fn undo_restores_claims() {
        let mut ledger = CopyResource::new(vec![2.0; 3]);
        let mut changes = FxHashMap::default();
        assert!(ledger.try_consume(0, 3, 3.0, &mut changes));
        assert_eq!(ledger.delay(1), 2.0);
        assert_eq!(ledger.delay(2), 1.0);
        ledger.undo(&changes);
        assert_eq!(ledger.delay(1), 0.0);
        assert_eq!(ledger.delay(2), 0.0);
    }

    #[test]
    fn removing_older_copy_keeps_order_of_later_ones() {
        let mut ledger = CopyResource::new(vec![1.0; 6]);
        let a = ledger.add(0, 6, 1.0);
        ledger.add(0, 6, 1.0);
        ledger.add(0, 6, 1.0);
        assert_eq!(ledger.copy_count(), 3);
        ledger.remove(a);
        assert_eq!(ledger.copy_count(), 2);
        assert_eq!(ledger.free(1), 0.0);
        assert_eq!(ledger.free(2), 0.0);
        assert_eq!(ledger.free(3), 1.0);
    }

    #[test]
    fn slices_are_checked_together() {
        let ledger = CopyResource::new(vec![1.0; 5]);
        let slices = [
            CopySpec {
                start_after: 0,
                done_before: 3,
                amount: 1.0,
            },
            CopySpec {
                start_after: 1,
                done_before: 3,
                amount: 1.0,
            },
        ];
        assert!(ledger.has_enough_multi(&slices));
        let too_much = [
            slices[0],
            CopySpec {
                start_after: 1,
                done_before: 3,
                amount: 1.5,
            },
        ];
        assert!(!ledger.has_enough_multi(&too_much));
    }
}
