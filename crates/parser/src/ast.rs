use ir::{ArrayShape, PrimitiveType, Shape, SliceRange};
use pest::Parser as _;
use smol_str::SmolStr;

use super::{syntax::Node, Error};
use crate::syntax::{FromSyntax, Parser, Rule, Spanned};

pub fn parse(input: &str) -> Result<Module, Vec<Error>> {
    match Parser::parse(Rule::module, input) {
        Err(err) => Err(vec![Error::SyntaxError(err)]),
        Ok(mut pairs) => {
            let Some(pair) = pairs.next() else {
                return Ok(Module::default());
            };
            debug_assert_eq!(pair.as_rule(), Rule::module);
            let mut node = Node::new(pair);

            let module = Module::from_syntax(&mut node);

            if node.errors.is_empty() {
                Ok(module)
            } else {
                Err(node.errors)
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct Module {
    pub name: Spanned<SmolStr>,
    pub comps: Vec<Computation>,
}

impl FromSyntax<Error> for Module {
    fn from_syntax(node: &mut Node<Error>) -> Self {
        let name = node
            .descend_into_opt(Rule::module_header, |n| n.single(Rule::module_name))
            .unwrap_or_default();
        Module {
            name,
            comps: node.multi(Rule::computation),
        }
    }
}

impl FromSyntax<Error> for SmolStr {
    fn from_syntax(node: &mut Node<Error>) -> Self {
        node.txt.into()
    }
}

#[derive(Debug)]
pub struct Computation {
    pub name: Spanned<CompRef>,
    pub is_entry: bool,
    pub stmts: Vec<Stmt>,
    pub root: Spanned<SmolStr>,
}

impl FromSyntax<Error> for Computation {
    fn from_syntax(node: &mut Node<Error>) -> Self {
        Computation {
            is_entry: node.get_opt(Rule::entry_marker).is_some(),
            name: node.single(Rule::comp_ref),
            stmts: node.multi(Rule::stmt),
            root: node
                .descend_into_opt(Rule::root_stmt, |n| n.single(Rule::value_ref))
                .unwrap_or_default(),
        }
    }
}

/// `%name`; the span covers the sigil.
#[derive(Debug, Clone)]
pub struct CompRef(pub SmolStr);

impl FromSyntax<Error> for CompRef {
    fn from_syntax(node: &mut Node<Error>) -> Self {
        Self(node.single(Rule::comp_name))
    }
}

#[derive(Debug)]
pub struct Stmt {
    pub name: Spanned<SmolStr>,
    pub shape: Shape,
    pub opcode: Spanned<SmolStr>,
    pub operands: Vec<Spanned<SmolStr>>,
    pub attrs: Vec<Spanned<Attr>>,
    pub span: crate::Span,
}

impl FromSyntax<Error> for Stmt {
    fn from_syntax(node: &mut Node<Error>) -> Self {
        Stmt {
            name: node.single(Rule::value_name),
            shape: node.single(Rule::shape),
            opcode: node.single(Rule::opcode),
            operands: node
                .descend_into_opt(Rule::operand_list, |n| n.multi(Rule::value_ref))
                .unwrap_or_default(),
            attrs: node.multi(Rule::attr),
            span: node.span,
        }
    }
}

impl FromSyntax<Error> for Shape {
    fn from_syntax(node: &mut Node<Error>) -> Self {
        node.descend();
        match node.rule {
            Rule::tuple_shape => Shape::Tuple(node.multi(Rule::shape)),
            _ => Shape::Array(ArrayShape::from_syntax(node)),
        }
    }
}

impl FromSyntax<Error> for ArrayShape {
    fn from_syntax(node: &mut Node<Error>) -> Self {
        let elem = node
            .get_opt(Rule::primitive_type)
            .map(|p| {
                let txt = p.as_str();
                PrimitiveType::parse(txt).unwrap_or_else(|| {
                    let span = p.as_span();
                    node.error(Error::UnknownType(
                        txt.into(),
                        crate::Span::from_range(span.start()..span.end()),
                    ));
                    PrimitiveType::F32
                })
            })
            .unwrap_or(PrimitiveType::F32);
        let dims: Vec<u64> = node
            .descend_into_opt(Rule::dims, |n| n.multi::<Number<u64>>(Rule::number))
            .unwrap_or_default()
            .into_iter()
            .map(|n| n.0)
            .collect();
        let memory_space = node
            .descend_into_opt(Rule::memory_space, |n| n.single::<Number<u32>>(Rule::number))
            .map_or(ir::DEFAULT_MEMORY_SPACE, |n| i64::from(n.0));
        ArrayShape::new(elem, &dims).with_memory_space(memory_space)
    }
}

/// A decimal literal that must fit in `T`.
#[derive(Debug, Clone, Copy)]
pub struct Number<T>(pub T);

impl<T> FromSyntax<Error> for Number<T>
where
    T: std::str::FromStr + Default,
{
    fn from_syntax(node: &mut Node<Error>) -> Self {
        match node.txt.parse() {
            Ok(n) => Number(n),
            Err(_) => {
                node.error(Error::NumberOutOfBounds(node.span));
                Number(T::default())
            }
        }
    }
}

#[derive(Debug, Clone)]
pub enum Attr {
    Number(u32),
    Index(u32),
    Dim(u32),
    Condition(Spanned<CompRef>),
    Body(Spanned<CompRef>),
    Branches(Vec<Spanned<CompRef>>),
    Slice(Vec<SliceRange>),
    CrossProgramPrefetch(u32),
}

impl FromSyntax<Error> for Attr {
    fn from_syntax(node: &mut Node<Error>) -> Self {
        fn number(node: &mut Node<Error>) -> u32 {
            node.single::<Number<u32>>(Rule::number).0
        }

        node.descend();
        match node.rule {
            Rule::number_attr => Attr::Number(number(node)),
            Rule::index_attr => Attr::Index(number(node)),
            Rule::dim_attr => Attr::Dim(number(node)),
            Rule::cross_program_prefetch_attr => Attr::CrossProgramPrefetch(number(node)),
            Rule::condition_attr => Attr::Condition(node.single(Rule::comp_ref)),
            Rule::body_attr => Attr::Body(node.single(Rule::comp_ref)),
            Rule::branches_attr => Attr::Branches(node.multi(Rule::comp_ref)),
            Rule::slice_attr => Attr::Slice(node.multi(Rule::slice_range)),
            _ => unreachable!("unexpected attribute rule {:?}", node.rule),
        }
    }
}

impl FromSyntax<Error> for SliceRange {
    fn from_syntax(node: &mut Node<Error>) -> Self {
        let bounds = node.multi::<Number<u64>>(Rule::number);
        match bounds.as_slice() {
            [start, limit] => SliceRange::new(start.0, limit.0),
            _ => SliceRange::new(0, 0),
        }
    }
}
