//! Steady-state placement for unrolled loop bodies.
//!
//! The entry schedule is searched for a run of instructions that repeats
//! with a fixed period. Inside the repeating window every value is
//! classified by where it is defined and used relative to the iterations,
//! a self-contained greedy placement is made, and the prefetch start times
//! it chose are handed to the global allocator as preferred starts.
use std::fmt;

use ir::{InstId, Opcode, ShapeIndex, Use, ValueId};
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::{algorithm::Analyses, cost::FastAccess, options::Options};

/// Number of iterations the bandwidth model simulates.
const SIMULATED_ITERATIONS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueClass {
    /// Defined and consumed within one iteration.
    Temporary,
    /// Defined in one iteration and consumed by the next.
    LoopCarried,
    /// Defined before the loop and read by several iterations.
    Pinned,
    /// Defined before the loop and read by a single iteration.
    Prefetch,
    Unsupported,
}

impl fmt::Display for ValueClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Temporary => "temporary",
            Self::LoopCarried => "loop-carried",
            Self::Pinned => "pinned",
            Self::Prefetch => "prefetch",
            Self::Unsupported => "unsupported",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct LoopValue {
    pub value: ValueId,
    pub class: ValueClass,
    pub size: u64,
    pub savings: f64,
    /// Whether the value got a place in the steady-state layout.
    pub allocated: bool,
    /// Time after which the prefetch of a `Prefetch` value starts.
    pub start_after: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct LoopReport {
    /// Index of the first loop instruction in the entry schedule.
    pub loop_start: usize,
    /// Instructions per iteration.
    pub loop_size: usize,
    pub iterations: usize,
    pub values: Vec<LoopValue>,
    /// Average elapsed time of one iteration with the chosen placement.
    pub steady_state_elapsed: f64,
    /// Average elapsed time of one iteration with everything in default memory.
    pub default_elapsed: f64,
    pub preferred: FxHashMap<Use, i64>,
}

impl LoopReport {
    pub fn class_of(&self, value: ValueId) -> Option<ValueClass> {
        self.values.iter().find(|v| v.value == value).map(|v| v.class)
    }
}

/// How an operand refers to its producer, relative to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OperandRef {
    /// Produced before the loop.
    Outer,
    /// Produced this many instructions earlier.
    Distance(usize),
}

struct Body<'a> {
    cx: Analyses<'a>,
    options: &'a Options,
    sequence: &'a [InstId],
    index: FxHashMap<InstId, usize>,
}

impl<'a> Body<'a> {
    fn new(cx: Analyses<'a>, options: &'a Options) -> Option<Self> {
        let entry = cx.module.entry()?;
        let sequence = cx.module.comps[entry].sequence();
        let index = sequence.iter().enumerate().map(|(i, &inst)| (inst, i)).collect();
        Some(Self {
            cx,
            options,
            sequence,
            index,
        })
    }

    fn operand_ref(&self, user: usize, operand: InstId, start: usize) -> Option<OperandRef> {
        let producer = *self.index.get(&operand)?;
        if producer < start {
            Some(OperandRef::Outer)
        } else {
            Some(OperandRef::Distance(user - producer))
        }
    }

    /// `a` in iteration `k` and `b = a + period` in iteration `k + 1` do the
    /// same work.
    fn matches(&self, a: usize, b: usize, start: usize, period: usize) -> bool {
        let module = self.cx.module;
        let (x, y) = (module.inst(self.sequence[a]), module.inst(self.sequence[b]));
        let repeatable = !matches!(x.opcode, Opcode::Parameter | Opcode::Constant)
            && !x.opcode.calls_computations()
            && !x.opcode.is_async_start()
            && !x.opcode.is_async_done();
        if !repeatable
            || x.opcode != y.opcode
            || x.shape != y.shape
            || x.attrs != y.attrs
            || x.operands.len() != y.operands.len()
        {
            return false;
        }

        let b_iteration_start = b - (b - start) % period;
        x.operands.iter().zip(&y.operands).all(|(&p, &q)| {
            if module.shape(p) != module.shape(q) {
                return false;
            }
            match (self.operand_ref(a, p, start), self.operand_ref(b, q, start)) {
                (Some(l), Some(r)) if l == r => true,
                // Carried into the next iteration from the previous one.
                (Some(OperandRef::Outer), Some(OperandRef::Distance(d))) => b - d < b_iteration_start,
                _ => false,
            }
        })
    }

    fn repeats(&self, start: usize, period: usize, iterations: usize) -> bool {
        let end = start + (iterations - 1) * period;
        (start..end).all(|i| self.matches(i, i + period, start, period))
    }

    /// Smallest period first, then earliest start.
    fn detect(&self, min_iterations: usize) -> Option<(usize, usize, usize)> {
        let n = self.sequence.len();
        let min_iterations = min_iterations.max(2);
        for period in 2..=n / min_iterations {
            for start in 0..=n - min_iterations * period {
                if !self.repeats(start, period, min_iterations) {
                    continue;
                }
                let mut iterations = min_iterations;
                while start + (iterations + 1) * period <= n
                    && (0..period).all(|i| {
                        let a = start + (iterations - 1) * period + i;
                        self.matches(a, a + period, start, period)
                    })
                {
                    iterations += 1;
                }
                return Some((start, period, iterations));
            }
        }
        None
    }
}

struct Window {
    start: usize,
    period: usize,
    iterations: usize,
}

impl Window {
    fn end(&self) -> usize {
        self.start + self.period * self.iterations
    }

    fn contains(&self, i: usize) -> bool {
        (self.start..self.end()).contains(&i)
    }

    fn iteration(&self, i: usize) -> Option<usize> {
        self.contains(i).then(|| (i - self.start) / self.period)
    }
}

struct Candidate {
    value: ValueId,
    class: ValueClass,
    size: u64,
    savings: f64,
    def: usize,
    /// Use indices in the entry schedule, ascending.
    uses: Vec<(usize, Use)>,
    /// First index of the copy window for prefetches.
    first_covered: Option<usize>,
}

impl Candidate {
    /// Schedule indices during which the value holds alternate memory.
    fn interval(&self, window: &Window) -> (usize, usize) {
        let last = self.uses.last().map_or(self.def, |(i, _)| *i);
        let first = match self.class {
            ValueClass::Pinned => window.start,
            ValueClass::Prefetch => self.first_covered.unwrap_or(self.def),
            _ => self.def,
        };
        (first, last)
    }
}

/// Looks for a repeating loop body in the entry computation and plans its
/// steady state. Returns `None` if no body repeats often enough.
pub fn optimize<'a>(cx: Analyses<'a>, options: &'a Options) -> Option<LoopReport> {
    let body = Body::new(cx, options)?;
    let (start, period, iterations) = body.detect(options.loop_optimizer.min_iterations)?;
    let window = Window {
        start,
        period,
        iterations,
    };
    debug!(start, period, iterations, "found repeating loop body");

    let mut candidates = classify(&body, &window);
    schedule_prefetches(&body, &mut candidates);
    let allocated = fit(&body, &window, &candidates);
    let (steady_state_elapsed, default_elapsed) = simulate(&body, &window, &candidates, &allocated);

    let mut preferred = FxHashMap::default();
    let mut values = Vec::with_capacity(candidates.len());
    for (c, &allocated) in candidates.iter().zip(&allocated) {
        let start_after = c.first_covered.map(|first| start_after_time(&body, first));
        if allocated && c.class == ValueClass::Prefetch {
            if let Some(t) = start_after {
                for (_, u) in &c.uses {
                    preferred.insert(u.clone(), t);
                }
            }
        }
        values.push(LoopValue {
            value: c.value,
            class: c.class,
            size: c.size,
            savings: c.savings,
            allocated,
            start_after,
        });
    }
    debug!(
        steady_state_elapsed,
        default_elapsed,
        prefetches = preferred.len(),
        "loop steady state"
    );

    Some(LoopReport {
        loop_start: start,
        loop_size: period,
        iterations,
        values,
        steady_state_elapsed,
        default_elapsed,
        preferred,
    })
}

fn classify(body: &Body<'_>, window: &Window) -> Vec<Candidate> {
    let cx = body.cx;
    let mut candidates = Vec::new();
    for (value, data) in cx.dataflow.values() {
        let Some(&def) = body.index.get(&data.defining.inst) else {
            continue;
        };
        if data.uses.is_empty() {
            continue;
        }
        let mut uses: Vec<(usize, Use)> = Vec::with_capacity(data.uses.len());
        let mut all_inside = true;
        for u in &data.uses {
            match body.index.get(&u.inst) {
                Some(&i) if window.contains(i) => uses.push((i, u.clone())),
                _ => all_inside = false,
            }
        }
        uses.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        if uses.is_empty() {
            continue;
        }

        let size = body.options.size_of(data);
        let eligible = all_inside
            && size > 0
            && size <= body.options.max_size_bytes
            && data.positions.len() == 1
            && data.shape.memory_space != body.options.alternate_memory_space
            && body.options.value_allowed(cx.module, data)
            && uses.iter().all(|(_, u)| body.options.use_allowed(cx.module, u));

        let use_iterations: Vec<usize> = uses.iter().filter_map(|(i, _)| window.iteration(*i)).collect();
        let first = use_iterations.iter().copied().min().unwrap_or(0);
        let last = use_iterations.iter().copied().max().unwrap_or(0);
        let class = if !eligible {
            ValueClass::Unsupported
        } else if let Some(k) = window.iteration(def) {
            if last == k {
                ValueClass::Temporary
            } else if last == k + 1 {
                ValueClass::LoopCarried
            } else {
                ValueClass::Unsupported
            }
        } else if def < window.start {
            if first == last {
                ValueClass::Prefetch
            } else {
                ValueClass::Pinned
            }
        } else {
            ValueClass::Unsupported
        };

        let savings = uses
            .iter()
            .map(|(_, u)| cx.cost.use_savings(u.inst, u.operand, &u.index))
            .sum();
        candidates.push(Candidate {
            value,
            class,
            size,
            savings,
            def,
            uses,
            first_covered: None,
        });
    }
    candidates
}

/// One copy engine working backwards from the latest use: each prefetch
/// must be done before the next one starts, which keeps their starts in
/// use order.
fn schedule_prefetches(body: &Body<'_>, candidates: &mut [Candidate]) {
    let cx = body.cx;
    let ratio = body.options.loop_optimizer.desired_copy_ratio.unwrap_or(1.0);
    let mut order: Vec<usize> = candidates
        .iter()
        .enumerate()
        .filter(|(_, c)| c.class == ValueClass::Prefetch)
        .map(|(i, _)| i)
        .collect();
    order.sort_by_key(|&i| std::cmp::Reverse(candidates[i].uses[0].0));

    let mut engine_free_until = usize::MAX;
    for i in order {
        let c = &mut candidates[i];
        let needed = cx.cost.async_copy_elapsed(c.size) * ratio;
        let limit = c.uses[0].0.min(engine_free_until);
        let mut first = limit;
        let mut overlapped = 0.0;
        while first > c.def + 1 && overlapped < needed {
            first -= 1;
            overlapped += cx.cost.elapsed_default(body.sequence[first]);
        }
        c.first_covered = Some(first);
        engine_free_until = first;
        debug!(value = %c.value, first, overlapped, needed, "loop prefetch");
    }
}

/// Greedy by savings per byte; the bytes in use at any schedule index
/// never exceed the alternate memory.
fn fit(body: &Body<'_>, window: &Window, candidates: &[Candidate]) -> Vec<bool> {
    let capacity = body.options.max_size_bytes;
    let mut usage = vec![0u64; body.sequence.len()];
    let mut allocated = vec![false; candidates.len()];

    let mut order: Vec<usize> = (0..candidates.len())
        .filter(|&i| candidates[i].class != ValueClass::Unsupported && candidates[i].savings > 0.0)
        .collect();
    order.sort_by(|&a, &b| {
        let density = |i: usize| candidates[i].savings / candidates[i].size as f64;
        density(b)
            .total_cmp(&density(a))
            .then_with(|| candidates[a].value.cmp(&candidates[b].value))
    });

    for i in order {
        let c = &candidates[i];
        let (first, last) = c.interval(window);
        if usage[first..=last].iter().all(|&u| u + c.size <= capacity) {
            for u in &mut usage[first..=last] {
                *u += c.size;
            }
            allocated[i] = true;
        }
    }
    allocated
}

/// Average per-iteration elapsed time over the first iterations, with and
/// without the placement. A prefetch whose copy is not hidden by the
/// instructions it overlaps stalls its use.
fn simulate(body: &Body<'_>, window: &Window, candidates: &[Candidate], allocated: &[bool]) -> (f64, f64) {
    let cx = body.cx;
    let ratio = body.options.loop_optimizer.desired_copy_ratio.unwrap_or(1.0);

    let mut fast_operands: FxHashMap<InstId, Vec<(u32, ShapeIndex)>> = FxHashMap::default();
    let mut fast_outputs: FxHashMap<InstId, Vec<ShapeIndex>> = FxHashMap::default();
    let mut stalls: FxHashMap<usize, f64> = FxHashMap::default();
    for (c, _) in candidates.iter().zip(allocated).filter(|(_, a)| **a) {
        for (_, u) in &c.uses {
            fast_operands
                .entry(u.inst)
                .or_default()
                .push((u.operand, u.index.clone()));
        }
        let data = cx.dataflow.value(c.value);
        if c.class == ValueClass::Prefetch {
            if let Some(first) = c.first_covered {
                let needed = cx.cost.async_copy_elapsed(c.size) * ratio;
                let use_index = c.uses[0].0;
                let overlapped: f64 = body.sequence[first..use_index]
                    .iter()
                    .map(|&inst| cx.cost.elapsed_default(inst))
                    .sum();
                *stalls.entry(use_index).or_default() += (needed - overlapped).max(0.0);
            }
        } else {
            fast_outputs
                .entry(data.defining.inst)
                .or_default()
                .push(data.defining.index.clone());
        }
    }

    let simulated = window.iterations.min(SIMULATED_ITERATIONS);
    let (mut placed, mut baseline) = (0.0, 0.0);
    for i in window.start..window.start + simulated * window.period {
        let inst = body.sequence[i];
        let fast = FastAccess {
            operands: fast_operands.get(&inst).map_or(&[], |v| v.as_slice()),
            outputs: fast_outputs.get(&inst).map_or(&[], |v| v.as_slice()),
        };
        placed += cx.cost.elapsed(inst, &fast) + stalls.get(&i).copied().unwrap_or(0.0);
        baseline += cx.cost.elapsed_default(inst);
    }
    let n = simulated as f64;
    (placed / n, baseline / n)
}

/// The copy whose window begins at schedule index `first` starts after the
/// instruction before it.
fn start_after_time(body: &Body<'_>, first: usize) -> i64 {
    match first.checked_sub(1) {
        Some(prev) => body.cx.live.time(body.sequence[prev]),
        None => -1,
    }
}

#[cfg(test)]
mod tests {
    use ir::{AliasAnalysis, CallGraph, Dataflow, Module, ModuleBuilder, PrimitiveType, Shape};

    use super::*;
    use crate::{
        cost::{BenefitScaling, CostAnalysis, CostModel},
        live_range::LiveRanges,
    };

    /// Default memory moves one 256-byte value per second, alternate memory
    /// ten, and a copy of such a value takes two seconds.
    struct Bandwidth;

    impl CostAnalysis for Bandwidth {
        fn compute_elapsed(&self, _: &Module, _: InstId) -> f64 {
            0.5
        }

        fn default_mem_bandwidth(&self) -> f64 {
            256.0
        }

        fn alternate_mem_bandwidth(&self) -> f64 {
            2560.0
        }

        fn async_copy_bandwidth(&self) -> f64 {
            128.0
        }
    }

    struct Fixture {
        module: Module,
        x: [InstId; 2],
        p: [InstId; 2],
        y0: InstId,
        w: InstId,
    }

    /// Two iterations of `load X; compute; store`, each reading its own
    /// parameter and a shared weight.
    fn two_iterations() -> Fixture {
        let f = Shape::array(PrimitiveType::F32, &[64]);
        let mut mb = ModuleBuilder::new("m");
        let mut b = mb.computation("main");
        let p0 = b.param("p0", 0, f.clone());
        let p1 = b.param("p1", 1, f.clone());
        let w = b.param("w", 2, f);
        let x0 = b.unary("x0", Opcode::Negate, p0);
        let y0 = b.unary("y0", Opcode::Exp, x0);
        let z0 = b.binary("z0", Opcode::Add, y0, w);
        let x1 = b.unary("x1", Opcode::Negate, p1);
        let y1 = b.unary("y1", Opcode::Exp, x1);
        let z1 = b.binary("z1", Opcode::Add, y1, w);
        let t = b.tuple("t", &[z0, z1]);
        let main = b.finish(t);
        mb.set_entry(main);
        Fixture {
            module: mb.build(),
            x: [x0, x1],
            p: [p0, p1],
            y0,
            w,
        }
    }

    fn run(fixture: &Fixture, options: &Options) -> Option<LoopReport> {
        let module = &fixture.module;
        let df = Dataflow::analyze(module);
        let alias = AliasAnalysis::analyze(module, &df);
        let cg = CallGraph::new(module);
        let live = LiveRanges::new(module, &df, &cg).unwrap();
        let cost = CostModel::new(&Bandwidth, module, &df, &cg, BenefitScaling::NoScale);
        let cx = Analyses {
            module,
            dataflow: &df,
            alias: &alias,
            call_graph: &cg,
            live: &live,
            cost: &cost,
        };
        optimize(cx, options)
    }

    fn value_of(fixture: &Fixture, inst: InstId) -> ValueId {
        let df = Dataflow::analyze(&fixture.module);
        df.value_at(inst, &ShapeIndex::empty()).unwrap()
    }

    fn options(min_iterations: usize) -> Options {
        let mut options = Options::default();
        options.loop_optimizer.enabled = true;
        options.loop_optimizer.min_iterations = min_iterations;
        options
    }

    #[test]
    fn classifies_and_schedules_across_iterations() {
        let fixture = two_iterations();
        let report = run(&fixture, &options(2)).unwrap();
        assert_eq!((report.loop_start, report.loop_size, report.iterations), (3, 3, 2));

        assert_eq!(report.class_of(value_of(&fixture, fixture.p[0])), Some(ValueClass::Prefetch));
        assert_eq!(report.class_of(value_of(&fixture, fixture.p[1])), Some(ValueClass::Prefetch));
        assert_eq!(report.class_of(value_of(&fixture, fixture.w)), Some(ValueClass::Pinned));
        assert_eq!(report.class_of(value_of(&fixture, fixture.y0)), Some(ValueClass::Temporary));

        // The second load's copy overlaps the last instruction of the first
        // iteration.
        let second = Use {
            inst: fixture.x[1],
            operand: 0,
            index: ShapeIndex::empty(),
        };
        assert_eq!(report.preferred.get(&second), Some(&4));
        // The first copy finishes before the second starts.
        let first = Use {
            inst: fixture.x[0],
            operand: 0,
            index: ShapeIndex::empty(),
        };
        assert_eq!(report.preferred.get(&first), Some(&0));
        assert!(report.steady_state_elapsed < report.default_elapsed);
    }

    #[test]
    fn too_few_iterations_is_not_a_loop() {
        let fixture = two_iterations();
        assert!(run(&fixture, &options(3)).is_none());
    }

    #[test]
    fn no_room_means_no_preferred_starts() {
        let fixture = two_iterations();
        let mut options = options(2);
        options.max_size_bytes = 128;
        let report = run(&fixture, &options).unwrap();
        assert!(report.preferred.is_empty());
        assert!(report.values.iter().all(|v| !v.allocated));
    }
}
