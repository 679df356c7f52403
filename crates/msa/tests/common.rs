#![allow(dead_code)]

use ir::{CompId, Dataflow, InstId, Module, ShapeIndex, ValueId};
use memspace_msa::{
    allocation::{Allocation, AllocationKind},
    options::ValuePredicate,
    CostAnalysis, MsaOutput,
};

/// Every instruction takes one second of compute; memory traffic is free
/// next to that. Copies move `copy_bandwidth` bytes per second.
pub struct ComputeBound {
    pub copy_bandwidth: f64,
}

impl CostAnalysis for ComputeBound {
    fn compute_elapsed(&self, _: &Module, _: InstId) -> f64 {
        1.0
    }

    fn default_mem_bandwidth(&self) -> f64 {
        1e12
    }

    fn alternate_mem_bandwidth(&self) -> f64 {
        1e13
    }

    fn async_copy_bandwidth(&self) -> f64 {
        self.copy_bandwidth
    }
}

pub fn value_of(module: &Module, inst: InstId) -> ValueId {
    Dataflow::analyze(module)
        .value_at(inst, &ShapeIndex::empty())
        .unwrap()
}

/// Lets only values defined by the named instructions into alternate memory.
pub fn only_named(names: &'static [&'static str]) -> ValuePredicate {
    Box::new(move |module: &Module, value: &ir::ValueData| {
        names.contains(&module.inst(value.defining.inst).name.as_str())
    })
}

pub fn names(module: &Module, comp: CompId) -> Vec<String> {
    module.comps[comp]
        .sequence()
        .iter()
        .map(|&i| module.inst(i).name.to_string())
        .collect()
}

pub fn allocations_of(output: &MsaOutput, value: ValueId) -> Vec<Allocation> {
    output
        .outcome
        .allocations
        .of_value(value)
        .map(|(_, a)| a.clone())
        .collect()
}

/// `(start_after, done_before, cross_program)` of every whole copy.
pub fn copies(allocations: &[Allocation]) -> Vec<(i64, i64, bool)> {
    allocations
        .iter()
        .filter_map(|a| match a.kind {
            AllocationKind::Copy {
                start_after,
                done_before,
                cross_program,
                ..
            } => Some((start_after, done_before, cross_program)),
            _ => None,
        })
        .collect()
}

pub fn parse(source: &str) -> Module {
    match parser::parse_module(source) {
        Ok(module) => module,
        Err(errs) => {
            let rendered: Vec<String> = errs
                .iter()
                .map(|e| e.print_to_string("<test>", source, false))
                .collect();
            panic!("{}", rendered.join("\n"));
        }
    }
}
