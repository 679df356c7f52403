mod common;

use common::{allocations_of, copies, names, only_named, value_of, ComputeBound};
use ir::{CompId, InstId, Module, ModuleBuilder, Opcode, PrimitiveType, Shape, ShapeIndex, Use};
use memspace_msa::{
    allocation::AllocationKind, chunk::Chunk, cost::BenefitScaling, loop_opt::ValueClass, run,
    Options,
};

fn f32s(dims: &[u64]) -> Shape {
    Shape::array(PrimitiveType::F32, dims)
}

fn operand_use(inst: InstId, operand: u32) -> Use {
    Use {
        inst,
        operand,
        index: ShapeIndex::empty(),
    }
}

struct Prefetched {
    module: Module,
    main: CompId,
    p: InstId,
    r: InstId,
}

/// `p` is defined at time 0 and read twice by `r` at time 5.
fn read_late() -> Prefetched {
    let mut mb = ModuleBuilder::new("s1");
    let mut b = mb.computation("main");
    let p = b.param("p", 0, f32s(&[16]));
    let q = b.param("q", 1, f32s(&[1]));
    let a = b.unary("a", Opcode::Negate, q);
    let bb = b.unary("b", Opcode::Exp, a);
    let c = b.unary("c", Opcode::Tanh, bb);
    let r = b.binary("r", Opcode::Add, p, p);
    let t = b.tuple("t", &[r, c]);
    let main = b.finish(t);
    mb.set_entry(main);
    Prefetched {
        module: mb.build(),
        main,
        p,
        r,
    }
}

#[test]
fn simple_prefetch() {
    let Prefetched {
        mut module,
        main,
        p,
        r,
    } = read_late();
    let pv = value_of(&module, p);
    let mut options = Options {
        max_size_bytes: 128,
        max_overlap_count: 4,
        enable_cross_program_prefetch: false,
        ..Options::default()
    };
    options.is_allowed_in_alternate_mem = Some(only_named(&["p"]));

    let output = run(&mut module, &ComputeBound { copy_bandwidth: 64.0 }, &options).unwrap();
    let allocations = allocations_of(&output, pv);
    assert_eq!(copies(&allocations), vec![(1, 5, false)]);
    let copy = allocations.iter().find(|a| a.is_copy()).unwrap();
    assert_eq!(copy.chunk, Some(Chunk::new(0, 64)));
    assert_eq!(copy.uses, vec![operand_use(r, 0), operand_use(r, 1)]);
    assert_eq!(output.trace.peak(), 64);
    assert_eq!(output.stats.prefetches, 1);

    assert_eq!(
        names(&module, main),
        ["p", "q", "p.copy_start", "a", "b", "c", "p.copy_done", "r", "t"]
    );
    let done = module.comps[main].inst_by_name("p.copy_done").unwrap();
    assert_eq!(module.inst(r).operands.as_slice(), &[done, done]);
    assert_eq!(module.shape(done).as_array().unwrap().memory_space, 1);
    assert_eq!(module.shape(p).as_array().unwrap().memory_space, 0);
}

#[test]
fn simple_prefetch_with_default_window() {
    let Prefetched {
        mut module,
        main,
        p,
        r,
    } = read_late();
    let pv = value_of(&module, p);
    let mut options = Options {
        max_size_bytes: 128,
        enable_cross_program_prefetch: false,
        ..Options::default()
    };
    options.is_allowed_in_alternate_mem = Some(only_named(&["p"]));

    let output = run(&mut module, &ComputeBound { copy_bandwidth: 64.0 }, &options).unwrap();
    let allocations = allocations_of(&output, pv);
    assert_eq!(copies(&allocations), vec![(0, 5, false)]);
    let copy = allocations.iter().find(|a| a.is_copy()).unwrap();
    assert_eq!(copy.uses, vec![operand_use(r, 0), operand_use(r, 1)]);
    assert_eq!(output.stats.prefetches, 1);

    let done = module.comps[main].inst_by_name("p.copy_done").unwrap();
    assert_eq!(module.inst(r).operands.as_slice(), &[done, done]);
}

/// `a` lives over [2, 4] and `b` over [3, 6].
fn overlapping_pair() -> (Module, InstId, InstId) {
    let mut mb = ModuleBuilder::new("s2");
    let mut b = mb.computation("main");
    let x = b.param("x", 0, f32s(&[16]));
    let s = b.param("s", 1, f32s(&[16]));
    let a = b.unary("a", Opcode::Negate, x);
    let bv = b.unary("b", Opcode::Negate, s);
    let c = b.binary("c", Opcode::Add, a, s);
    let d = b.unary("d", Opcode::Exp, c);
    let e = b.binary("e", Opcode::Add, bv, d);
    let main = b.finish(e);
    mb.set_entry(main);
    (mb.build(), a, bv)
}

fn pair_options(capacity: u64) -> Options {
    let mut options = Options {
        max_size_bytes: capacity,
        min_overlap_count: 2,
        enable_cross_program_prefetch: false,
        ..Options::default()
    };
    options.is_allowed_in_alternate_mem = Some(only_named(&["a", "b"]));
    options
}

#[test]
fn overlapping_values_share_the_memory() {
    let (mut module, a, b) = overlapping_pair();
    let (av, bv) = (value_of(&module, a), value_of(&module, b));
    let output = run(&mut module, &ComputeBound { copy_bandwidth: 64.0 }, &pair_options(128)).unwrap();

    let a_allocs = allocations_of(&output, av);
    let b_allocs = allocations_of(&output, bv);
    assert_eq!(a_allocs.len(), 1);
    assert_eq!(b_allocs.len(), 1);
    assert_eq!((a_allocs[0].start, a_allocs[0].end), (2, 4));
    assert_eq!((b_allocs[0].start, b_allocs[0].end), (3, 6));
    assert_eq!(a_allocs[0].chunk, Some(Chunk::new(0, 64)));
    assert_eq!(b_allocs[0].chunk, Some(Chunk::new(64, 64)));
    assert_eq!(output.trace.peak(), 128);
}

#[test]
fn no_room_leaves_the_later_value_in_default_memory() {
    let (mut module, a, b) = overlapping_pair();
    let (av, bv) = (value_of(&module, a), value_of(&module, b));
    let output = run(&mut module, &ComputeBound { copy_bandwidth: 64.0 }, &pair_options(64)).unwrap();

    let a_allocs = allocations_of(&output, av);
    assert_eq!(a_allocs[0].chunk, Some(Chunk::new(0, 64)));
    let b_allocs = allocations_of(&output, bv);
    assert!(b_allocs.iter().all(|a| a.is_default() && !a.is_copy()));
    assert_eq!(output.stats.prefetches, 0);
    assert!(module
        .insts
        .values()
        .all(|data| !data.opcode.is_async_start()));
}

#[test]
fn eviction_before_a_default_only_use() {
    let mut mb = ModuleBuilder::new("s3");
    let mut b = mb.computation("main");
    let s = b.param("s", 0, f32s(&[16]));
    let k = b.param("k", 1, f32s(&[]));
    let v = b.unary("v", Opcode::Negate, s);
    let mut chain = b.unary("k3", Opcode::Negate, k);
    let w = b.unary("w", Opcode::Exp, v);
    for t in 5..10 {
        chain = b.unary(&format!("k{t}"), Opcode::Negate, chain);
    }
    let sink = b.binary("sink", Opcode::Add, v, w);
    let root = b.tuple("out", &[sink, chain]);
    let main = b.finish(root);
    mb.set_entry(main);
    let mut module = mb.build();
    let vv = value_of(&module, v);

    let mut options = Options {
        enable_cross_program_prefetch: false,
        ..Options::default()
    };
    options.is_allowed_in_alternate_mem = Some(only_named(&["v"]));
    options.is_use_allowed_in_alternate_mem =
        Some(Box::new(|module: &Module, u: &Use| module.inst(u.inst).name != "sink"));

    let output = run(&mut module, &ComputeBound { copy_bandwidth: 64.0 }, &options).unwrap();
    let allocations = allocations_of(&output, vv);
    assert!(allocations[0].is_alternate());
    assert_eq!((allocations[0].start, allocations[0].end), (2, 6));
    assert_eq!(copies(&allocations), vec![(4, 6, false)]);
    let evicted = allocations.iter().find(|a| a.is_copy()).unwrap();
    assert!(evicted.is_default());
    assert_eq!(evicted.uses, vec![operand_use(sink, 0)]);
    assert_eq!(output.stats.evictions, 1);

    // `v` is written to alternate memory and read back from the copy.
    assert_eq!(module.shape(v).as_array().unwrap().memory_space, 1);
    let done = module.comps[main].inst_by_name("v.copy_done").unwrap();
    assert_eq!(module.inst(sink).operands[0], done);
    assert_eq!(module.inst(sink).operands[1], w);
    assert_eq!(module.shape(done).as_array().unwrap().memory_space, 0);
}

#[test]
fn sliced_prefetch() {
    let mut mb = ModuleBuilder::new("s4");
    let mut b = mb.computation("main");
    let p = b.param("p", 0, f32s(&[4, 262_144]));
    let q = b.param("q", 1, f32s(&[]));
    let mut chain = q;
    for t in 2..10 {
        chain = b.unary(&format!("c{t}"), Opcode::Negate, chain);
    }
    let r = b.reduce("r", p, 1);
    let root = b.tuple("out", &[r, chain]);
    let main = b.finish(root);
    mb.set_entry(main);
    let mut module = mb.build();
    let pv = value_of(&module, p);

    let mut options = Options {
        max_size_bytes: 8 << 20,
        max_overlap_count: 8,
        enable_cross_program_prefetch: false,
        ..Options::default()
    };
    options.sliced_prefetch.max_slices = 4;
    options.is_allowed_in_alternate_mem = Some(only_named(&["p"]));

    let analysis = ComputeBound {
        copy_bandwidth: (1 << 20) as f64,
    };
    let output = run(&mut module, &analysis, &options).unwrap();
    let allocations = allocations_of(&output, pv);
    let sliced = allocations
        .iter()
        .find_map(|a| match &a.kind {
            AllocationKind::SlicedCopy { prev, slices } => Some((*prev, a.chunk, slices.clone())),
            _ => None,
        })
        .unwrap();
    let (prev, chunk, slices) = sliced;
    // The default copy is still live when the last slice starts.
    let source = &output.outcome.allocations[prev];
    assert!(source.is_default());
    assert!(slices.iter().all(|s| source.end >= s.start_after));
    assert_eq!(chunk, Some(Chunk::new(0, 4 << 20)));
    assert_eq!(slices.len(), 4);
    assert!(slices.windows(2).all(|w| w[0].start_after < w[1].start_after));
    assert!(slices.iter().all(|s| s.done_before == 10));
    for (i, s) in slices.iter().enumerate() {
        assert_eq!(s.chunk, Chunk::new(i as u64 * (1 << 20), 1 << 20));
    }
    assert_eq!(output.stats.sliced_prefetches, 1);
    assert_eq!(output.stats.slices, 4);

    let sequence = module.comps[main].sequence().to_vec();
    let count = |op: Opcode| sequence.iter().filter(|&&i| module.opcode(i) == op).count();
    assert_eq!(count(Opcode::SliceStart), 4);
    assert_eq!(count(Opcode::SliceDone), 4);
    assert_eq!(count(Opcode::SliceConcat), 1);
    let at = sequence.iter().position(|&i| i == r).unwrap();
    let concat = sequence[at - 1];
    assert_eq!(module.opcode(concat), Opcode::SliceConcat);
    assert_eq!(module.inst(r).operands[0], concat);
    assert_eq!(module.shape(concat).as_array().unwrap().memory_space, 1);
}

#[test]
fn loop_steady_state_sets_prefetch_starts() {
    let mut mb = ModuleBuilder::new("s5");
    let mut b = mb.computation("main");
    let f = f32s(&[64]);
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
    let mut module = mb.build();
    let (p0v, p1v, y0v) = (value_of(&module, p0), value_of(&module, p1), value_of(&module, y0));

    let mut options = Options {
        max_overlap_count: 4,
        enable_cross_program_prefetch: false,
        benefit_scaling: BenefitScaling::NoScale,
        ..Options::default()
    };
    options.loop_optimizer.enabled = true;
    options.loop_optimizer.min_iterations = 2;

    let output = run(&mut module, &LoadStore, &options).unwrap();
    let report = output.loop_report.as_ref().unwrap();
    assert_eq!((report.loop_start, report.loop_size, report.iterations), (3, 3, 2));
    assert_eq!(report.class_of(p0v), Some(ValueClass::Prefetch));
    assert_eq!(report.class_of(p1v), Some(ValueClass::Prefetch));
    assert_eq!(report.class_of(y0v), Some(ValueClass::Temporary));

    let preferred = report.preferred[&operand_use(x1, 0)];
    assert_eq!(preferred, 4);
    let allocations = allocations_of(&output, p1v);
    assert_eq!(copies(&allocations), vec![(preferred, 6, false)]);
}

/// Default memory moves one 256-byte value per second, alternate memory
/// ten, and a copy of such a value takes two seconds.
struct LoadStore;

impl memspace_msa::CostAnalysis for LoadStore {
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

#[test]
fn cross_program_prefetch_frees_the_tail() {
    let mut mb = ModuleBuilder::new("s6");
    let mut b = mb.computation("main");
    let p = b.param("p", 0, f32s(&[524_288]));
    let q = b.param("q", 1, f32s(&[]));
    let mut chain = q;
    for t in 2..100 {
        chain = b.unary(&format!("c{t}"), Opcode::Negate, chain);
    }
    let r = b.reduce("r", p, 0);
    chain = b.binary("c101", Opcode::Add, chain, r);
    for t in 102..200 {
        chain = b.unary(&format!("c{t}"), Opcode::Negate, chain);
    }
    let main = b.finish(chain);
    mb.set_entry(main);
    let mut module = mb.build();
    let pv = value_of(&module, p);

    let options = Options {
        preferred_overlap_count: Some(50),
        ..Options::default()
    };
    let analysis = ComputeBound {
        copy_bandwidth: (2 << 20) as f64 / 10.0,
    };
    let output = run(&mut module, &analysis, &options).unwrap();
    let allocations = allocations_of(&output, pv);
    assert_eq!(copies(&allocations), vec![(-1, 100, true), (150, 200, true)]);
    assert_eq!(output.stats.cross_program_prefetches, 2);

    let sequence = names(&module, main);
    assert_eq!(&sequence[..3], ["p", "p.copy_start", "q"]);
    let start = module.comps[main].inst_by_name("p.copy_start").unwrap();
    assert_eq!(module.inst(start).attrs.cross_program_prefetch, Some(0));
    let done = module.comps[main].inst_by_name("p.copy_done").unwrap();
    assert_eq!(module.inst(r).operands[0], done);
    let refill = sequence.iter().position(|n| n == "p.copy_start.1").unwrap();
    assert_eq!(sequence[refill - 1], "c150");
}
