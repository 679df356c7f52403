use std::{fmt, io};

use crate::{
    inst::{InstData, InstId},
    module::{CompId, Computation, Module},
};

pub struct ModuleWriter<'a> {
    module: &'a Module,
}

impl<'a> ModuleWriter<'a> {
    pub fn new(module: &'a Module) -> Self {
        Self { module }
    }

    pub fn write(&mut self, mut w: impl io::Write) -> io::Result<()> {
        writeln!(w, "module @{};", self.module.name)?;

        for comp in self.module.comps_callees_first() {
            writeln!(w)?;
            CompWriter::new(self.module, comp).write(&mut w)?;
        }

        Ok(())
    }

    pub fn dump_string(&mut self) -> io::Result<String> {
        let mut s = Vec::new();
        self.write(&mut s)?;
        String::from_utf8(s).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

pub struct CompWriter<'a> {
    module: &'a Module,
    comp: CompId,
    level: u8,
}

impl<'a> CompWriter<'a> {
    pub fn new(module: &'a Module, comp: CompId) -> Self {
        Self {
            module,
            comp,
            level: 0,
        }
    }

    fn data(&self) -> &'a Computation {
        &self.module.comps[self.comp]
    }

    pub fn write(&mut self, mut w: impl io::Write) -> io::Result<()> {
        let comp = self.data();
        if self.module.entry() == Some(self.comp) {
            write!(w, "entry ")?;
        }
        writeln!(w, "comp %{} {{", comp.name)?;
        self.level += 1;

        for &inst in comp.sequence() {
            self.indent(&mut w)?;
            self.write_inst(inst, &mut w)?;
            self.newline(&mut w)?;
        }

        if let Some(root) = comp.root() {
            self.indent(&mut w)?;
            write!(w, "root {};", self.module.inst(root).name)?;
            self.newline(&mut w)?;
        }

        self.level -= 1;
        writeln!(w, "}}")
    }

    pub fn write_inst(&self, inst: InstId, mut w: impl io::Write) -> io::Result<()> {
        write!(w, "{}", DisplayInst::new(self.module, inst))
    }

    pub fn dump_string(&mut self) -> io::Result<String> {
        let mut s = Vec::new();
        self.write(&mut s)?;
        String::from_utf8(s).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    fn indent(&self, mut w: impl io::Write) -> io::Result<()> {
        w.write_all(" ".repeat(self.level as usize * 4).as_bytes())
    }

    fn newline(&self, mut w: impl io::Write) -> io::Result<()> {
        w.write_all(b"\n")
    }
}

/// Displays one instruction in the text format, without indentation.
pub struct DisplayInst<'a> {
    module: &'a Module,
    inst: InstId,
}

impl<'a> DisplayInst<'a> {
    pub fn new(module: &'a Module, inst: InstId) -> Self {
        Self { module, inst }
    }

    fn data(&self) -> &'a InstData {
        self.module.inst(self.inst)
    }
}

impl fmt::Display for DisplayInst<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.data();
        write!(f, "{}: {} = {}(", data.name, data.shape, data.opcode)?;
        write_iter_with_delim(
            f,
            data.operands.iter().map(|&op| &self.module.inst(op).name),
            ", ",
        )?;
        f.write_str(")")?;

        let attrs = &data.attrs;
        if let Some(number) = attrs.number {
            write!(f, ", number={number}")?;
        }
        if let Some(index) = attrs.index {
            write!(f, ", index={index}")?;
        }
        if let Some(dim) = attrs.dim {
            write!(f, ", dim={dim}")?;
        }
        if let (Some(cond), Some(body)) = (data.while_condition(), data.while_body()) {
            write!(
                f,
                ", condition=%{}, body=%{}",
                self.module.comps[cond].name, self.module.comps[body].name
            )?;
        } else if !data.called.is_empty() {
            f.write_str(", branches={")?;
            write_iter_with_delim(
                f,
                data.called
                    .iter()
                    .map(|&c| format!("%{}", self.module.comps[c].name)),
                ", ",
            )?;
            f.write_str("}")?;
        }
        if let Some(slice) = &attrs.slice {
            f.write_str(", slice={")?;
            write_iter_with_delim(f, slice.iter(), ", ")?;
            f.write_str("}")?;
        }
        if let Some(n) = attrs.cross_program_prefetch {
            write!(f, ", cross_program_prefetch={n}")?;
        }
        f.write_str(";")
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = ModuleWriter::new(self).dump_string().map_err(|_| fmt::Error)?;
        f.write_str(&s)
    }
}

pub fn write_iter_with_delim<T>(
    f: &mut fmt::Formatter,
    iter: impl Iterator<Item = T>,
    delim: &str,
) -> fmt::Result
where
    T: fmt::Display,
{
    let mut iter = iter.peekable();
    while let Some(item) = iter.next() {
        write!(f, "{item}")?;
        if iter.peek().is_some() {
            f.write_str(delim)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        builder::ModuleBuilder,
        inst::Opcode,
        types::{PrimitiveType, Shape},
    };

    #[test]
    fn writes_nested_computations_first() {
        let elem = Shape::array(PrimitiveType::F32, &[16]);
        let state = Shape::tuple(vec![elem.clone(), Shape::scalar(PrimitiveType::S32)]);

        let mut mb = ModuleBuilder::new("loop");
        let mut b = mb.computation("cond");
        let p = b.param("p", 0, state.clone());
        let i = b.get_tuple_element("i", p, 1);
        let n = b.constant("n", Shape::scalar(PrimitiveType::S32));
        let lt = b.compare("lt", i, n);
        let cond = b.finish(lt);

        let mut b = mb.computation("body");
        let p = b.param("p", 0, state.clone());
        let x = b.get_tuple_element("x", p, 0);
        let i = b.get_tuple_element("i", p, 1);
        let y = b.unary("y", Opcode::Negate, x);
        let t = b.tuple("t", &[y, i]);
        let body = b.finish(t);

        let mut b = mb.computation("main");
        let a = b.param("a", 0, elem);
        let z = b.constant("z", Shape::scalar(PrimitiveType::S32));
        let init = b.tuple("init", &[a, z]);
        let w = b.while_loop("w", init, cond, body);
        let main = b.finish(w);
        mb.set_entry(main);
        let module = mb.build();

        insta::assert_snapshot!(module.to_string(), @r"
        module @loop;

        comp %cond {
            p: (f32[16], s32[]) = parameter(), number=0;
            i: s32[] = get_tuple_element(p), index=1;
            n: s32[] = constant();
            lt: pred[] = compare(i, n);
            root lt;
        }

        comp %body {
            p: (f32[16], s32[]) = parameter(), number=0;
            x: f32[16] = get_tuple_element(p), index=0;
            i: s32[] = get_tuple_element(p), index=1;
            y: f32[16] = negate(x);
            t: (f32[16], s32[]) = tuple(y, i);
            root t;
        }

        entry comp %main {
            a: f32[16] = parameter(), number=0;
            z: s32[] = constant();
            init: (f32[16], s32[]) = tuple(a, z);
            w: (f32[16], s32[]) = while(init), condition=%cond, body=%body;
            root w;
        }
        ");
    }
}
