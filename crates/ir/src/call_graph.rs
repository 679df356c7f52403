use cranelift_entity::SecondaryMap;

use crate::{
    inst::{InstId, Opcode},
    module::{CompId, Module},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    WhileCondition,
    WhileBody,
    Branch(u32),
}

impl CallKind {
    pub fn is_loop(self) -> bool {
        matches!(self, Self::WhileCondition | Self::WhileBody)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallSite {
    pub inst: InstId,
    pub caller: CompId,
    pub kind: CallKind,
}

/// Caller relation between computations.
#[derive(Debug, Default)]
pub struct CallGraph {
    call_site: SecondaryMap<CompId, Option<CallSite>>,
    call_count: SecondaryMap<CompId, u32>,
    nest_level: SecondaryMap<CompId, u32>,
}

impl CallGraph {
    pub fn new(module: &Module) -> Self {
        let mut graph = Self::default();
        for (inst, data) in module.insts.iter() {
            for (i, &callee) in data.called.iter().enumerate() {
                let kind = match (data.opcode, i) {
                    (Opcode::While, 0) => CallKind::WhileCondition,
                    (Opcode::While, _) => CallKind::WhileBody,
                    _ => CallKind::Branch(i as u32),
                };
                graph.call_count[callee] += 1;
                graph.call_site[callee] = Some(CallSite {
                    inst,
                    caller: data.comp(),
                    kind,
                });
            }
        }

        // Callers are visited before callees so levels propagate downwards.
        let mut order = module.post_order();
        order.reverse();
        for comp in order {
            if let Some(site) = graph.call_site[comp] {
                let outer = graph.nest_level[site.caller];
                graph.nest_level[comp] = outer + u32::from(site.kind.is_loop());
            }
        }
        graph
    }

    pub fn call_site(&self, comp: CompId) -> Option<CallSite> {
        self.call_site[comp]
    }

    pub fn call_count(&self, comp: CompId) -> u32 {
        self.call_count[comp]
    }

    pub fn caller(&self, comp: CompId) -> Option<CompId> {
        self.call_site[comp].map(|s| s.caller)
    }

    /// Number of enclosing while loops.
    pub fn nest_level(&self, comp: CompId) -> u32 {
        self.nest_level[comp]
    }

    /// Returns `true` if `outer` is `inner` or transitively calls it.
    pub fn is_ancestor(&self, outer: CompId, inner: CompId) -> bool {
        let mut cur = Some(inner);
        while let Some(c) = cur {
            if c == outer {
                return true;
            }
            cur = self.caller(c);
        }
        false
    }

    /// The computation directly called from `outer` on the way to `inner`.
    pub fn child_towards(&self, outer: CompId, inner: CompId) -> Option<CompId> {
        let mut cur = inner;
        loop {
            let caller = self.caller(cur)?;
            if caller == outer {
                return Some(cur);
            }
            cur = caller;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        builder::ModuleBuilder,
        types::{PrimitiveType, Shape},
    };

    #[test]
    fn nest_levels_follow_loops() {
        let f = Shape::array(PrimitiveType::F32, &[8]);
        let pred = Shape::scalar(PrimitiveType::Pred);
        let mut mb = ModuleBuilder::new("m");

        let mut b = mb.computation("then");
        let p = b.param("p", 0, f.clone());
        let then = b.finish(p);

        let mut b = mb.computation("cond");
        b.param("p", 0, f.clone());
        let c = b.constant("c", pred.clone());
        let cond = b.finish(c);

        let mut b = mb.computation("body");
        let p = b.param("p", 0, f.clone());
        let k = b.constant("k", pred);
        let r = b.conditional("r", &[k, p], &[then], f.clone());
        let body = b.finish(r);

        let mut b = mb.computation("main");
        let a = b.param("a", 0, f);
        let w = b.while_loop("w", a, cond, body);
        let main = b.finish(w);
        mb.set_entry(main);
        let module = mb.build();

        let cg = CallGraph::new(&module);
        assert_eq!(cg.nest_level(main), 0);
        assert_eq!(cg.nest_level(body), 1);
        assert_eq!(cg.nest_level(cond), 1);
        assert_eq!(cg.nest_level(then), 1);
        assert!(cg.is_ancestor(main, then));
        assert!(!cg.is_ancestor(then, main));
        assert_eq!(cg.child_towards(main, then), Some(body));
        assert_eq!(cg.call_site(body).map(|s| s.kind), Some(CallKind::WhileBody));
        assert_eq!(cg.call_count(then), 1);
    }
}
