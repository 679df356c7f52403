use cranelift_entity::{entity_impl, PrimaryMap};
use rustc_hash::{FxHashMap, FxHashSet};
use smol_str::SmolStr;

use crate::{
    inst::{InstData, InstId, Opcode},
    types::Shape,
};

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CompId(u32);
entity_impl!(CompId, "comp");

/// A computation owns an ordered instruction sequence. The order is the
/// schedule produced upstream and is respected by every analysis.
#[derive(Debug, Clone, Default)]
pub struct Computation {
    pub name: SmolStr,
    pub(crate) sequence: Vec<InstId>,
    pub(crate) params: Vec<InstId>,
    pub(crate) root: Option<InstId>,
    names: FxHashMap<SmolStr, InstId>,
}

impl Computation {
    pub fn new(name: impl Into<SmolStr>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Scheduled instructions in order.
    pub fn sequence(&self) -> &[InstId] {
        &self.sequence
    }

    /// Parameters sorted by parameter number.
    pub fn params(&self) -> &[InstId] {
        &self.params
    }

    pub fn root(&self) -> Option<InstId> {
        self.root
    }

    pub fn inst_by_name(&self, name: &str) -> Option<InstId> {
        self.names.get(name).copied()
    }

    pub fn position_of(&self, inst: InstId) -> Option<usize> {
        self.sequence.iter().position(|&i| i == inst)
    }

    /// Returns a name not yet used in this computation, derived from `base`.
    pub fn fresh_name(&self, base: &str) -> SmolStr {
        if !self.names.contains_key(base) {
            return base.into();
        }
        let mut n = 1u32;
        loop {
            let candidate = SmolStr::from(format!("{base}.{n}"));
            if !self.names.contains_key(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Module {
    pub name: SmolStr,
    pub comps: PrimaryMap<CompId, Computation>,
    pub insts: PrimaryMap<InstId, InstData>,
    entry: Option<CompId>,
}

impl Module {
    pub fn new(name: impl Into<SmolStr>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn entry(&self) -> Option<CompId> {
        self.entry
    }

    pub fn set_entry(&mut self, comp: CompId) {
        self.entry = Some(comp);
    }

    pub fn add_computation(&mut self, name: impl Into<SmolStr>) -> CompId {
        self.comps.push(Computation::new(name))
    }

    pub fn inst(&self, inst: InstId) -> &InstData {
        &self.insts[inst]
    }

    pub fn inst_mut(&mut self, inst: InstId) -> &mut InstData {
        &mut self.insts[inst]
    }

    pub fn shape(&self, inst: InstId) -> &Shape {
        &self.insts[inst].shape
    }

    pub fn opcode(&self, inst: InstId) -> Opcode {
        self.insts[inst].opcode
    }

    pub fn comp_of(&self, inst: InstId) -> CompId {
        self.insts[inst].comp
    }

    /// Appends `data` to the end of `comp`'s schedule.
    pub fn append_inst(&mut self, comp: CompId, data: InstData) -> InstId {
        let at = self.comps[comp].sequence.len();
        self.insert_inst(comp, at, data)
    }

    /// Inserts `data` into `comp`'s schedule at sequence index `at`.
    ///
    /// # Panics
    /// Panics if the instruction name is already used in `comp`.
    pub fn insert_inst(&mut self, comp: CompId, at: usize, mut data: InstData) -> InstId {
        data.comp = comp;
        let is_param = data.opcode == Opcode::Parameter;
        let number = data.attrs.number.unwrap_or(0);
        let name = data.name.clone();
        let inst = self.insts.push(data);

        let c = &mut self.comps[comp];
        let prev = c.names.insert(name.clone(), inst);
        assert!(prev.is_none(), "duplicated instruction name `{name}`");
        c.sequence.insert(at, inst);
        if is_param {
            let pos = c
                .params
                .iter()
                .position(|&p| self.insts[p].attrs.number.unwrap_or(0) > number)
                .unwrap_or(c.params.len());
            c.params.insert(pos, inst);
        }
        inst
    }

    pub fn set_root(&mut self, comp: CompId, root: InstId) {
        self.comps[comp].root = Some(root);
    }

    /// Rewires operand number `operand` of `user` to `to`.
    pub fn replace_operand(&mut self, user: InstId, operand: usize, to: InstId) {
        self.insts[user].operands[operand] = to;
    }

    /// Computations calling `comp`, as `(caller instruction, position in called list)`.
    pub fn callers(&self, comp: CompId) -> Vec<(InstId, usize)> {
        let mut callers = Vec::new();
        for (inst, data) in self.insts.iter() {
            for (i, &callee) in data.called.iter().enumerate() {
                if callee == comp {
                    callers.push((inst, i));
                }
            }
        }
        callers
    }

    /// Computations reachable from the entry in post order: callees before
    /// callers.
    pub fn post_order(&self) -> Vec<CompId> {
        let mut order = Vec::new();
        let mut visited = FxHashSet::default();
        if let Some(entry) = self.entry {
            self.post_order_rec(entry, &mut visited, &mut order);
        }
        order
    }

    /// Every computation, callees before callers.
    pub fn comps_callees_first(&self) -> Vec<CompId> {
        let mut order = Vec::new();
        let mut visited = FxHashSet::default();
        for comp in self.comps.keys() {
            self.post_order_rec(comp, &mut visited, &mut order);
        }
        order
    }

    fn post_order_rec(
        &self,
        comp: CompId,
        visited: &mut FxHashSet<CompId>,
        order: &mut Vec<CompId>,
    ) {
        if !visited.insert(comp) {
            return;
        }
        for &inst in &self.comps[comp].sequence {
            for &callee in &self.insts[inst].called {
                self.post_order_rec(callee, visited, order);
            }
        }
        order.push(comp);
    }
}
