use ast::{Attr, Stmt};
use ir::{Attrs, CompId, InstData, InstId, Module, Opcode};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use smol_str::SmolStr;

pub mod ast;
mod error;
pub mod syntax;
pub use error::{Error, UndefinedKind};
pub use syntax::Span;

/// Parses the text form of a module and builds it.
///
/// Computations must be defined before the instructions that call them, and
/// values before the instructions that use them.
pub fn parse_module(input: &str) -> Result<Module, Vec<Error>> {
    let ast = ast::parse(input)?;

    let mut ctx = BuildCtx {
        module: Module::new(ast.name.inner.clone()),
        ..Default::default()
    };

    let mut entry: Option<SmolStr> = None;
    for comp in &ast.comps {
        let Some(id) = ctx.build_comp(comp) else {
            continue;
        };
        if comp.is_entry {
            match &entry {
                Some(_) => ctx.errors.push(Error::MultipleEntries(
                    comp.name.inner.0.clone(),
                    comp.name.span,
                )),
                None => {
                    entry = Some(comp.name.inner.0.clone());
                    ctx.module.set_entry(id);
                }
            }
        }
    }
    if entry.is_none() && ctx.errors.is_empty() {
        ctx.errors.push(Error::MissingEntry(ast.name.span));
    }

    if ctx.errors.is_empty() {
        Ok(ctx.module)
    } else {
        Err(ctx.errors)
    }
}

#[derive(Default)]
struct BuildCtx {
    module: Module,
    comps: FxHashMap<SmolStr, CompId>,
    errors: Vec<Error>,
}

impl BuildCtx {
    fn build_comp(&mut self, comp: &ast::Computation) -> Option<CompId> {
        let name = &comp.name.inner.0;
        if self.comps.contains_key(name) {
            self.errors
                .push(Error::DuplicateComputation(name.clone(), comp.name.span));
            return None;
        }
        let id = self.module.add_computation(name.clone());
        self.comps.insert(name.clone(), id);

        for stmt in &comp.stmts {
            if let Some(data) = self.inst_data(id, stmt) {
                self.module.append_inst(id, data);
            }
        }

        match self.module.comps[id].inst_by_name(&comp.root.inner) {
            Some(root) => self.module.set_root(id, root),
            None => self.errors.push(Error::Undefined(
                UndefinedKind::Value(comp.root.inner.clone()),
                comp.root.span,
            )),
        }
        Some(id)
    }

    fn inst_data(&mut self, comp: CompId, stmt: &Stmt) -> Option<InstData> {
        let err_count = self.errors.len();

        if self.module.comps[comp]
            .inst_by_name(&stmt.name.inner)
            .is_some()
        {
            self.errors.push(Error::DuplicateValueName(
                stmt.name.inner.clone(),
                stmt.name.span,
            ));
        }

        let opcode = Opcode::parse(&stmt.opcode.inner);
        if opcode.is_none() {
            self.errors.push(Error::Undefined(
                UndefinedKind::Opcode(stmt.opcode.inner.clone()),
                stmt.opcode.span,
            ));
        }

        let operands: SmallVec<[InstId; 2]> = stmt
            .operands
            .iter()
            .filter_map(|op| self.value(comp, op))
            .collect();

        let mut attrs = Attrs::default();
        let mut called: SmallVec<[CompId; 2]> = SmallVec::new();
        let mut condition = None;
        let mut body = None;
        for attr in &stmt.attrs {
            match &attr.inner {
                Attr::Number(n) => attrs.number = Some(*n),
                Attr::Index(n) => attrs.index = Some(*n),
                Attr::Dim(n) => attrs.dim = Some(*n),
                Attr::CrossProgramPrefetch(n) => attrs.cross_program_prefetch = Some(*n),
                Attr::Slice(ranges) => attrs.slice = Some(ranges.clone()),
                Attr::Condition(c) => condition = self.comp_ref(c),
                Attr::Body(b) => body = self.comp_ref(b),
                Attr::Branches(bs) => {
                    called = bs.iter().filter_map(|b| self.comp_ref(b)).collect();
                }
            }
        }
        if let (Some(c), Some(b)) = (condition, body) {
            called = [c, b].into_iter().collect();
        }

        let opcode = opcode?;
        let missing = |attr: &'static str| Error::MissingAttribute {
            opcode,
            attr,
            span: stmt.span,
        };
        match opcode {
            Opcode::Parameter if attrs.number.is_none() => self.errors.push(missing("number")),
            Opcode::GetTupleElement if attrs.index.is_none() => self.errors.push(missing("index")),
            Opcode::Reduce | Opcode::Concatenate | Opcode::SliceConcat if attrs.dim.is_none() => {
                self.errors.push(missing("dim"))
            }
            Opcode::SliceStart if attrs.slice.is_none() => self.errors.push(missing("slice")),
            Opcode::While if condition.is_none() => self.errors.push(missing("condition")),
            Opcode::While if body.is_none() => self.errors.push(missing("body")),
            Opcode::Conditional if called.is_empty() => self.errors.push(missing("branches")),
            _ => {}
        }

        if let Some(expected) = expected_operands(opcode, called.len()) {
            if expected != stmt.operands.len() {
                self.errors.push(Error::OperandCountMismatch {
                    opcode,
                    expected,
                    actual: stmt.operands.len(),
                    span: stmt.span,
                });
            }
        }

        if self.errors.len() != err_count {
            return None;
        }

        let mut data = InstData::new(stmt.name.inner.clone(), opcode, stmt.shape.clone())
            .with_attrs(attrs)
            .with_called(&called);
        data.operands = operands;
        Some(data)
    }

    fn value(&mut self, comp: CompId, name: &syntax::Spanned<SmolStr>) -> Option<InstId> {
        let inst = self.module.comps[comp].inst_by_name(&name.inner);
        if inst.is_none() {
            self.errors.push(Error::Undefined(
                UndefinedKind::Value(name.inner.clone()),
                name.span,
            ));
        }
        inst
    }

    fn comp_ref(&mut self, r: &syntax::Spanned<ast::CompRef>) -> Option<CompId> {
        let comp = self.comps.get(&r.inner.0).copied();
        if comp.is_none() {
            self.errors.push(Error::Undefined(
                UndefinedKind::Computation(r.inner.0.clone()),
                r.span,
            ));
        }
        comp
    }
}

/// Fixed operand count of `opcode`, `None` for variadic instructions.
fn expected_operands(opcode: Opcode, branches: usize) -> Option<usize> {
    let n = match opcode {
        Opcode::Parameter | Opcode::Constant => 0,
        Opcode::Compare | Opcode::Dot => 2,
        Opcode::DynamicUpdateSlice => 3,
        Opcode::Conditional => branches + 1,
        Opcode::Tuple | Opcode::Concatenate | Opcode::SliceConcat => return None,
        op if op.is_elementwise_binary() => 2,
        _ => 1,
    };
    Some(n)
}
