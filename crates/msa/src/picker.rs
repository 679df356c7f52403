//! Choice of prefetch start times.
use ir::{CallGraph, Module};

use crate::{cost::CostModel, live_range::LiveRanges, options::Options};

/// A prefetch that must be done before `end` and may start after any time in
/// `start..end`.
#[derive(Debug, Clone, PartialEq)]
pub struct PrefetchWindow {
    pub size: u64,
    pub start: i64,
    pub end: i64,
    pub preferred: Option<i64>,
    /// Elapsed time saved at the use by reading from alternate memory.
    pub use_savings: f64,
}

pub trait PrefetchIntervalPicker {
    /// Returns `false` if `[start, end]` is too long to keep a value of `size`
    /// bytes in alternate memory without copies.
    fn can_allocate_in_alternate_memory_no_copy(&self, size: u64, start: i64, end: i64) -> bool;

    /// Preferred `done_before` of an eviction starting after `start`.
    fn preferred_eviction_end_time(&self, size: u64, start: i64, latest_end: i64) -> i64;

    fn latest_prefetch_start_time(&self, size: u64, start: i64, end: i64, use_savings: f64) -> i64;

    fn preferred_prefetch_start_time(&self, size: u64, earliest: i64, latest: i64, end: i64) -> i64;

    /// Time at which a prefetch starting after `start` is expected to be done.
    fn estimated_prefetch_end_time(&self, size: u64, start: i64, end: i64) -> i64;

    /// Starts enumerating start times for `window`.
    fn begin(&mut self, window: &PrefetchWindow);

    fn next(&mut self) -> i64;

    fn done(&self) -> bool;

    /// Latest start time of the current window.
    fn latest_time(&self) -> i64;

    /// Loosens the picker on retries.
    fn set_retry_number(&mut self, retry: u32);
}

/// Outward enumeration from a preferred time: the preferred time, then one
/// step earlier, one step later and so on. Once earlier times run out the
/// later ones are thinned to `samples` candidates.
#[derive(Debug, Clone, Default)]
struct Candidates {
    earliest: i64,
    latest: i64,
    later: i64,
    earlier: i64,
    later_turn: bool,
    stride: Option<i64>,
}

impl Candidates {
    fn new(earliest: i64, latest: i64, preferred: i64) -> Self {
        let preferred = preferred.clamp(earliest, latest.max(earliest));
        Self {
            earliest,
            latest,
            later: preferred,
            earlier: preferred - 1,
            later_turn: true,
            stride: None,
        }
    }

    fn later_done(&self) -> bool {
        self.later > self.latest
    }

    fn earlier_done(&self) -> bool {
        self.earlier < self.earliest
    }

    fn done(&self) -> bool {
        self.later_done() && self.earlier_done()
    }

    fn settle(&mut self, skip: &impl Fn(i64) -> bool) {
        while !self.later_done() && skip(self.later) {
            self.later += 1;
        }
        while !self.earlier_done() && skip(self.earlier) {
            self.earlier -= 1;
        }
    }

    fn next(&mut self, samples: usize, skip: &impl Fn(i64) -> bool) -> i64 {
        let t = if !self.later_done() && (self.later_turn || self.earlier_done()) {
            let t = self.later;
            let stride = if self.earlier_done() {
                let samples = i64::try_from(samples.max(1)).unwrap_or(i64::MAX);
                *self
                    .stride
                    .get_or_insert_with(|| ((self.latest - t) / samples).max(1))
            } else {
                1
            };
            self.later += stride;
            t
        } else {
            let t = self.earlier;
            self.earlier -= 1;
            t
        };
        self.later_turn = !self.later_turn;
        self.settle(skip);
        t
    }
}

/// Treats every instruction as one unit of time.
#[derive(Debug, Clone)]
pub struct InstructionCountPicker {
    min_overlap: i64,
    max_overlap: i64,
    preferred_overlap: i64,
    candidates: Candidates,
}

impl InstructionCountPicker {
    pub fn new(min_overlap: i64, max_overlap: i64, preferred_overlap: i64) -> Self {
        Self {
            min_overlap,
            max_overlap,
            preferred_overlap,
            candidates: Candidates::default(),
        }
    }

    pub fn from_options(options: &Options) -> Self {
        Self::new(
            options.min_overlap_count,
            options.max_overlap_count,
            options.preferred_overlap_count(),
        )
    }
}

fn never(_: i64) -> bool {
    false
}

impl PrefetchIntervalPicker for InstructionCountPicker {
    fn can_allocate_in_alternate_memory_no_copy(&self, _: u64, start: i64, end: i64) -> bool {
        end - start <= self.max_overlap
    }

    fn preferred_eviction_end_time(&self, _: u64, start: i64, latest_end: i64) -> i64 {
        (start + self.min_overlap + 1).min(latest_end)
    }

    fn latest_prefetch_start_time(&self, _: u64, _: i64, end: i64, _: f64) -> i64 {
        end - self.min_overlap - 1
    }

    fn preferred_prefetch_start_time(&self, _: u64, earliest: i64, latest: i64, end: i64) -> i64 {
        (end - self.preferred_overlap).clamp(earliest, latest.max(earliest))
    }

    fn estimated_prefetch_end_time(&self, _: u64, _: i64, end: i64) -> i64 {
        end
    }

    fn begin(&mut self, window: &PrefetchWindow) {
        let earliest = window.start.max(window.end - self.max_overlap);
        let latest = self.latest_prefetch_start_time(window.size, window.start, window.end, 0.0);
        let preferred = window.preferred.unwrap_or_else(|| {
            self.preferred_prefetch_start_time(window.size, earliest, latest, window.end)
        });
        self.candidates = Candidates::new(earliest, latest, preferred);
    }

    fn next(&mut self) -> i64 {
        self.candidates.next(usize::MAX, &never)
    }

    fn done(&self) -> bool {
        self.candidates.done()
    }

    fn latest_time(&self) -> i64 {
        self.candidates.latest
    }

    fn set_retry_number(&mut self, _: u32) {}
}

/// Measures windows with the cost model. Elapsed times inside loops are
/// weighted by the loop-nest multiplier.
#[derive(Debug, Clone)]
pub struct CostAnalysisPicker {
    /// `cumulative[i]` is the elapsed time of the instructions before `i`.
    cumulative: Vec<f64>,
    nest_level: Vec<u32>,
    copy_seconds_per_byte: f64,
    min_ratio: f64,
    preferred_ratio: f64,
    max_ratio: f64,
    samples: usize,
    retry: u32,
    end: i64,
    candidates: Candidates,
}

impl CostAnalysisPicker {
    pub fn new(
        module: &Module,
        cost: &CostModel<'_>,
        live: &LiveRanges,
        call_graph: &CallGraph,
        options: &Options,
    ) -> Self {
        let (elapsed, nest_level) = live
            .flattened()
            .iter()
            .map(|&inst| {
                (
                    cost.elapsed_default(inst) * cost.nest_multiplier(inst, true),
                    call_graph.nest_level(module.comp_of(inst)),
                )
            })
            .unzip();
        Self::from_elapsed(elapsed, nest_level, cost.async_copy_elapsed(1), options)
    }

    pub fn from_elapsed(
        elapsed: Vec<f64>,
        nest_level: Vec<u32>,
        copy_seconds_per_byte: f64,
        options: &Options,
    ) -> Self {
        let mut cumulative = Vec::with_capacity(elapsed.len() + 1);
        cumulative.push(0.0);
        let mut sum = 0.0;
        for e in elapsed {
            sum += e;
            cumulative.push(sum);
        }
        Self {
            cumulative,
            nest_level,
            copy_seconds_per_byte,
            min_ratio: options.min_overlap_to_async_ratio,
            preferred_ratio: options.preferred_overlap_to_async_ratio,
            max_ratio: options.max_overlap_to_mem_size_ratio,
            samples: options.max_decreasing_samples,
            retry: 0,
            end: 0,
            candidates: Candidates::default(),
        }
    }

    fn copy_elapsed(&self, size: u64) -> f64 {
        size as f64 * self.copy_seconds_per_byte
    }

    /// Elapsed time strictly between `start` and `end`.
    fn interval_elapsed(&self, start: i64, end: i64) -> f64 {
        let n = self.cumulative.len() as i64 - 1;
        let lo = (start + 1).clamp(0, n);
        let hi = end.clamp(0, n);
        if hi <= lo {
            0.0
        } else {
            self.cumulative[hi as usize] - self.cumulative[lo as usize]
        }
    }

    fn min_ratio(&self) -> f64 {
        self.min_ratio * 0.5f64.powi(self.retry as i32)
    }

    fn level(&self, t: i64) -> Option<u32> {
        self.nest_level.get(usize::try_from(t).ok()?).copied()
    }

    fn other_level(&self, t: i64, end: i64) -> bool {
        match (self.level(t), self.level(end)) {
            (Some(a), Some(b)) => a != b,
            _ => false,
        }
    }
}

impl PrefetchIntervalPicker for CostAnalysisPicker {
    fn can_allocate_in_alternate_memory_no_copy(&self, size: u64, start: i64, end: i64) -> bool {
        self.interval_elapsed(start, end) <= self.max_ratio * self.copy_elapsed(size)
    }

    fn preferred_eviction_end_time(&self, size: u64, start: i64, latest_end: i64) -> i64 {
        let wanted = self.min_ratio() * self.copy_elapsed(size);
        let mut end = start + 1;
        while end < latest_end && self.interval_elapsed(start, end) < wanted {
            end += 1;
        }
        end
    }

    fn latest_prefetch_start_time(&self, size: u64, start: i64, end: i64, use_savings: f64) -> i64 {
        let wanted = self.min_ratio() * self.copy_elapsed(size);
        let mut t = end - 1;
        while t > start
            && (self.interval_elapsed(t, end) + use_savings < wanted || self.other_level(t, end))
        {
            t -= 1;
        }
        t
    }

    fn preferred_prefetch_start_time(&self, size: u64, earliest: i64, latest: i64, end: i64) -> i64 {
        let wanted = self.preferred_ratio * self.copy_elapsed(size);
        let mut t = latest;
        while t > earliest && (self.interval_elapsed(t, end) < wanted || self.other_level(t, end)) {
            t -= 1;
        }
        t
    }

    fn estimated_prefetch_end_time(&self, size: u64, start: i64, end: i64) -> i64 {
        let copy = self.copy_elapsed(size);
        let mut t = start + 1;
        while t < end && self.interval_elapsed(start, t) < copy {
            t += 1;
        }
        t
    }

    fn begin(&mut self, window: &PrefetchWindow) {
        self.end = window.end;
        let latest =
            self.latest_prefetch_start_time(window.size, window.start, window.end, window.use_savings);
        let longest = self.max_ratio * self.copy_elapsed(window.size);
        let mut earliest = window.start;
        while earliest < latest && self.interval_elapsed(earliest, window.end) > longest {
            earliest += 1;
        }
        let preferred = window.preferred.unwrap_or_else(|| {
            self.preferred_prefetch_start_time(window.size, earliest, latest, window.end)
        });
        self.candidates = Candidates::new(earliest, latest, preferred);
        let end = self.end;
        let mut candidates = std::mem::take(&mut self.candidates);
        let skip = |t: i64| self.other_level(t, end);
        candidates.settle(&skip);
        self.candidates = candidates;
    }

    fn next(&mut self) -> i64 {
        let mut candidates = std::mem::take(&mut self.candidates);
        let end = self.end;
        let t = candidates.next(self.samples, &|t| self.other_level(t, end));
        self.candidates = candidates;
        t
    }

    fn done(&self) -> bool {
        self.candidates.done()
    }

    fn latest_time(&self) -> i64 {
        self.candidates.latest
    }

    fn set_retry_number(&mut self, retry: u32) {
        self.retry = retry;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(picker: &mut dyn PrefetchIntervalPicker) -> Vec<i64> {
        let mut out = Vec::new();
        while !picker.done() {
            out.push(picker.next());
        }
        out
    }

    fn window(start: i64, end: i64, preferred: Option<i64>) -> PrefetchWindow {
        PrefetchWindow {
            size: 2,
            start,
            end,
            preferred,
            use_savings: 0.0,
        }
    }

    #[test]
    fn instruction_count_enumeration() {
        let mut picker = InstructionCountPicker::new(1, 10, 10);
        picker.begin(&window(0, 5, None));
        assert_eq!(drain(&mut picker), vec![0, 1, 2, 3]);

        picker.begin(&window(0, 5, Some(2)));
        assert_eq!(drain(&mut picker), vec![2, 1, 3, 0]);
        assert_eq!(picker.latest_time(), 3);

        assert!(picker.can_allocate_in_alternate_memory_no_copy(0, 0, 10));
        assert!(!picker.can_allocate_in_alternate_memory_no_copy(0, 0, 11));
        assert_eq!(picker.preferred_eviction_end_time(0, 4, 10), 6);
        assert_eq!(picker.preferred_prefetch_start_time(0, 101, 198, 200), 190);
    }

    #[test]
    fn cost_analysis_enumeration() {
        let options = Options {
            max_decreasing_samples: 4,
            ..Default::default()
        };
        let mut picker = CostAnalysisPicker::from_elapsed(vec![1.0; 10], vec![0; 10], 1.0, &options);
        picker.begin(&window(0, 8, None));
        assert_eq!(picker.latest_time(), 5);
        assert_eq!(drain(&mut picker), vec![4, 3, 5, 2, 1, 0]);

        assert_eq!(picker.estimated_prefetch_end_time(2, 3, 8), 6);
        assert_eq!(picker.preferred_eviction_end_time(2, 3, 8), 6);

        let long = CostAnalysisPicker::from_elapsed(vec![1.0; 30], vec![0; 30], 1.0, &options);
        assert!(long.can_allocate_in_alternate_memory_no_copy(2, 0, 21));
        assert!(!long.can_allocate_in_alternate_memory_no_copy(2, 0, 22));
    }

    #[test]
    fn cost_analysis_thins_later_candidates() {
        let options = Options {
            max_decreasing_samples: 4,
            ..Default::default()
        };
        let mut picker = CostAnalysisPicker::from_elapsed(vec![1.0; 25], vec![0; 25], 1.0, &options);
        picker.begin(&window(3, 20, Some(3)));
        assert_eq!(picker.latest_time(), 17);
        assert_eq!(drain(&mut picker), vec![3, 6, 9, 12, 15]);
    }

    #[test]
    fn cost_analysis_skips_other_nest_levels() {
        let options = Options::default();
        let mut nest = vec![0; 10];
        nest[3] = 1;
        nest[4] = 1;
        let mut picker = CostAnalysisPicker::from_elapsed(vec![1.0; 10], nest, 1.0, &options);
        picker.begin(&window(0, 8, Some(4)));
        let times = drain(&mut picker);
        assert!(!times.contains(&3) && !times.contains(&4));
        assert_eq!(times.first(), Some(&5));
    }

    #[test]
    fn retries_loosen_the_minimum_overlap() {
        let options = Options::default();
        let mut picker = CostAnalysisPicker::from_elapsed(vec![1.0; 10], vec![0; 10], 1.0, &options);
        assert_eq!(picker.latest_prefetch_start_time(4, 0, 8, 0.0), 3);
        picker.set_retry_number(1);
        assert_eq!(picker.latest_prefetch_start_time(4, 0, 8, 0.0), 5);
    }
}
