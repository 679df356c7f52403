//! Elapsed-time model used to rank values and to size copy windows.
use std::cell::RefCell;

use ir::{CallGraph, Dataflow, InstId, Module, Opcode, ShapeIndex, ValueId};
use rustc_hash::FxHashMap;

/// Target description supplied by the embedder.
pub trait CostAnalysis {
    /// Pure compute time of `inst`, independent of where its operands live.
    fn compute_elapsed(&self, module: &Module, inst: InstId) -> f64;

    /// Bytes per second.
    fn default_mem_bandwidth(&self) -> f64;
    fn alternate_mem_bandwidth(&self) -> f64;
    fn async_copy_bandwidth(&self) -> f64;

    /// Assumed trip count of every while loop.
    fn loop_execution_count(&self) -> f64 {
        5.0
    }

    /// Bytes of default memory traffic that overlap with compute for free.
    fn pipeline_window_bytes(&self) -> u64 {
        0
    }

    fn async_copy_scaling(&self) -> f64 {
        1.0
    }
}

/// Estimates compute from shapes: one flop per element for elementwise
/// operations, `2mnk` for dot products.
#[derive(Debug, Clone)]
pub struct ShapeCostAnalysis {
    pub flops_per_second: f64,
    pub default_mem_bandwidth: f64,
    pub alternate_mem_bandwidth: f64,
    pub async_copy_bandwidth: f64,
    pub loop_execution_count: f64,
}

impl Default for ShapeCostAnalysis {
    fn default() -> Self {
        Self {
            flops_per_second: 1e12,
            default_mem_bandwidth: 1e11,
            alternate_mem_bandwidth: 1e12,
            async_copy_bandwidth: 1e11,
            loop_execution_count: 5.0,
        }
    }
}

impl ShapeCostAnalysis {
    fn flops(module: &Module, inst: InstId) -> f64 {
        let data = module.inst(inst);
        let out_elems = data.shape.as_array().map_or(0, |a| a.element_count()) as f64;
        let operand_elems = |i: usize| {
            data.operands
                .get(i)
                .and_then(|&op| module.shape(op).as_array())
                .map_or(0, |a| a.element_count()) as f64
        };

        match data.opcode {
            op if op.is_elementwise_unary() || op.is_elementwise_binary() => out_elems,
            Opcode::Compare | Opcode::Broadcast | Opcode::Concatenate => out_elems,
            Opcode::DynamicUpdateSlice => operand_elems(1),
            Opcode::Reduce => operand_elems(0),
            Opcode::Dot => {
                let k = data
                    .operands
                    .first()
                    .and_then(|&op| module.shape(op).as_array())
                    .and_then(|a| a.dims.last().copied())
                    .unwrap_or(1) as f64;
                2.0 * out_elems * k
            }
            _ => 0.0,
        }
    }
}

impl CostAnalysis for ShapeCostAnalysis {
    fn compute_elapsed(&self, module: &Module, inst: InstId) -> f64 {
        Self::flops(module, inst) / self.flops_per_second
    }

    fn default_mem_bandwidth(&self) -> f64 {
        self.default_mem_bandwidth
    }

    fn alternate_mem_bandwidth(&self) -> f64 {
        self.alternate_mem_bandwidth
    }

    fn async_copy_bandwidth(&self) -> f64 {
        self.async_copy_bandwidth
    }

    fn loop_execution_count(&self) -> f64 {
        self.loop_execution_count
    }
}

/// How the benefit of a value is normalised by its size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BenefitScaling {
    /// Divide by the square root of the size so many small values win over a
    /// single large one.
    Sqrt,
    NoScale,
}

/// Which operand and output leaves of an instruction are in alternate memory.
#[derive(Debug, Clone, Default)]
pub struct FastAccess<'a> {
    pub operands: &'a [(u32, ShapeIndex)],
    pub outputs: &'a [ShapeIndex],
}

/// Combines a [`CostAnalysis`] with the module to answer elapsed-time
/// queries. Value benefits are memoised.
pub struct CostModel<'a> {
    analysis: &'a dyn CostAnalysis,
    module: &'a Module,
    dataflow: &'a Dataflow,
    call_graph: &'a CallGraph,
    scaling: BenefitScaling,
    benefit_cache: RefCell<FxHashMap<ValueId, f64>>,
}

impl<'a> CostModel<'a> {
    pub fn new(
        analysis: &'a dyn CostAnalysis,
        module: &'a Module,
        dataflow: &'a Dataflow,
        call_graph: &'a CallGraph,
        scaling: BenefitScaling,
    ) -> Self {
        Self {
            analysis,
            module,
            dataflow,
            call_graph,
            scaling,
            benefit_cache: RefCell::default(),
        }
    }

    pub fn compute_cost(&self, inst: InstId) -> f64 {
        match self.module.opcode(inst) {
            op if op.calls_computations() => 0.0,
            _ => self.analysis.compute_elapsed(self.module, inst),
        }
    }

    /// `(default bytes, alternate bytes)` touched by `inst`.
    fn bytes_accessed(&self, inst: InstId, fast: &FastAccess<'_>) -> (f64, f64) {
        let data = self.module.inst(inst);
        if data.opcode.is_trivial()
            || data.opcode.calls_computations()
            || data.opcode == Opcode::Parameter
        {
            return (0.0, 0.0);
        }

        let (mut default, mut alternate) = (0.0, 0.0);
        for (i, &op) in data.operands.iter().enumerate() {
            for (idx, leaf) in self.module.shape(op).leaves() {
                let bytes = leaf.byte_size() as f64;
                if fast
                    .operands
                    .iter()
                    .any(|(n, fidx)| *n == i as u32 && *fidx == idx)
                {
                    alternate += bytes;
                } else {
                    default += bytes;
                }
            }
        }
        if !data.opcode.is_async_start() && !data.opcode.is_async_done() {
            for (idx, leaf) in data.shape.leaves() {
                let bytes = leaf.byte_size() as f64;
                if fast.outputs.contains(&idx) {
                    alternate += bytes;
                } else {
                    default += bytes;
                }
            }
        }
        (default, alternate)
    }

    pub fn memory_cost(&self, inst: InstId, fast: &FastAccess<'_>) -> f64 {
        let (default, alternate) = self.bytes_accessed(inst, fast);
        default / self.analysis.default_mem_bandwidth()
            + alternate / self.analysis.alternate_mem_bandwidth()
    }

    pub fn elapsed(&self, inst: InstId, fast: &FastAccess<'_>) -> f64 {
        let compute = self.compute_cost(inst);
        let memory = self.memory_cost(inst, fast);
        let (default, alternate) = self.bytes_accessed(inst, fast);
        let total = default + alternate;
        let overhead = if total > 0.0 {
            let window = self.analysis.pipeline_window_bytes() as f64;
            window.min(default) / total * compute
        } else {
            0.0
        };
        compute.max(memory + overhead)
    }

    /// Elapsed time of `inst` with everything in default memory.
    pub fn elapsed_default(&self, inst: InstId) -> f64 {
        self.elapsed(inst, &FastAccess::default())
    }

    pub fn async_copy_elapsed(&self, bytes: u64) -> f64 {
        bytes as f64 / self.analysis.async_copy_bandwidth() * self.analysis.async_copy_scaling()
    }

    /// `loop_execution_count ^ nest_level` of the computation holding `inst`.
    /// Conditional branches count as loops unless `only_loops` is set.
    pub fn nest_multiplier(&self, inst: InstId, only_loops: bool) -> f64 {
        let mut level = 0;
        let mut comp = self.module.comp_of(inst);
        while let Some(site) = self.call_graph.call_site(comp) {
            if site.kind.is_loop() || !only_loops {
                level += 1;
            }
            comp = site.caller;
        }
        self.analysis.loop_execution_count().powi(level)
    }

    /// Time saved at `inst` when operand leaf `(operand, index)` is read from
    /// alternate memory.
    pub fn use_savings(&self, inst: InstId, operand: u32, index: &ShapeIndex) -> f64 {
        let fast = [(operand, index.clone())];
        let with_fast = self.elapsed(
            inst,
            &FastAccess {
                operands: &fast,
                outputs: &[],
            },
        );
        (self.elapsed_default(inst) - with_fast).max(0.0)
    }

    /// Loop-weighted time saved by keeping `value` in alternate memory at its
    /// definition and every use, normalised by size.
    pub fn benefit(&self, value: ValueId) -> f64 {
        if let Some(b) = self.benefit_cache.borrow().get(&value) {
            return *b;
        }

        let data = self.dataflow.value(value);
        let def = &data.defining;
        let mut saved = 0.0;
        if !self.module.opcode(def.inst).is_trivial() {
            let outputs = [def.index.clone()];
            let with_fast = self.elapsed(
                def.inst,
                &FastAccess {
                    operands: &[],
                    outputs: &outputs,
                },
            );
            saved += (self.elapsed_default(def.inst) - with_fast).max(0.0)
                * self.nest_multiplier(def.inst, true);
        }
        for u in &data.uses {
            saved += self.use_savings(u.inst, u.operand, &u.index)
                * self.nest_multiplier(u.inst, true);
        }

        let benefit = match self.scaling {
            BenefitScaling::Sqrt => saved / (data.size().max(1) as f64).sqrt(),
            BenefitScaling::NoScale => saved,
        };
        self.benefit_cache.borrow_mut().insert(value, benefit);
        benefit
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use ir::{ModuleBuilder, PrimitiveType, Shape};

    use super::*;

    /// Every instruction takes one second of compute; memory is effectively
    /// free and copies move `copy_bandwidth` bytes per second.
    pub(crate) struct UnitCost {
        pub copy_bandwidth: f64,
    }

    impl CostAnalysis for UnitCost {
        fn compute_elapsed(&self, _: &Module, _: InstId) -> f64 {
            1.0
        }

        fn default_mem_bandwidth(&self) -> f64 {
            1e12
        }

        fn alternate_mem_bandwidth(&self) -> f64 {
            1e12
        }

        fn async_copy_bandwidth(&self) -> f64 {
            self.copy_bandwidth
        }
    }

    /// Memory bound: compute is free and default memory is ten times slower
    /// than alternate memory.
    struct MemoryBound;

    impl CostAnalysis for MemoryBound {
        fn compute_elapsed(&self, _: &Module, _: InstId) -> f64 {
            0.0
        }

        fn default_mem_bandwidth(&self) -> f64 {
            10.0
        }

        fn alternate_mem_bandwidth(&self) -> f64 {
            100.0
        }

        fn async_copy_bandwidth(&self) -> f64 {
            10.0
        }
    }

    #[test]
    fn memory_bound_elapsed_and_benefit() {
        let f = Shape::array(PrimitiveType::F32, &[25]);
        let mut mb = ModuleBuilder::new("m");
        let mut b = mb.computation("main");
        let a = b.param("a", 0, f);
        let n = b.unary("n", Opcode::Negate, a);
        let main = b.finish(n);
        mb.set_entry(main);
        let module = mb.build();
        let df = Dataflow::analyze(&module);
        let cg = CallGraph::new(&module);

        let cost = CostModel::new(&MemoryBound, &module, &df, &cg, BenefitScaling::NoScale);
        // 100 bytes in and 100 bytes out at 10 B/s.
        assert_eq!(cost.elapsed_default(n), 20.0);
        let saved = cost.use_savings(n, 0, &ShapeIndex::empty());
        assert!((saved - 9.0).abs() < 1e-9);

        let va = df.value_at(a, &ShapeIndex::empty()).unwrap();
        assert!((cost.benefit(va) - 9.0).abs() < 1e-9);
        assert_eq!(cost.async_copy_elapsed(100), 10.0);

        let scaled = CostModel::new(&MemoryBound, &module, &df, &cg, BenefitScaling::Sqrt);
        assert!((scaled.benefit(va) - 0.9).abs() < 1e-9);
    }

    #[test]
    fn shape_costs_count_flops() {
        let mut mb = ModuleBuilder::new("m");
        let mut b = mb.computation("main");
        let a = b.param("a", 0, Shape::array(PrimitiveType::F32, &[8, 4]));
        let w = b.param("w", 1, Shape::array(PrimitiveType::F32, &[4, 2]));
        let d = b.dot("d", a, w);
        let e = b.unary("e", Opcode::Exp, d);
        let main = b.finish(e);
        mb.set_entry(main);
        let module = mb.build();

        let analysis = ShapeCostAnalysis {
            flops_per_second: 1.0,
            ..Default::default()
        };
        assert_eq!(analysis.compute_elapsed(&module, d), 2.0 * 16.0 * 4.0);
        assert_eq!(analysis.compute_elapsed(&module, e), 16.0);
        assert_eq!(analysis.compute_elapsed(&module, a), 0.0);
    }
}
