use std::ops::Range;

use pest::iterators::Pair;

#[derive(pest_derive::Parser)]
#[grammar = "memspace.pest"]
pub struct Parser;

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct Span(pub u32, pub u32);

impl Span {
    pub fn from_range(r: Range<usize>) -> Self {
        Self(r.start as u32, r.end as u32)
    }

    pub fn as_range(&self) -> Range<usize> {
        self.0 as usize..self.1 as usize
    }
}

#[derive(Debug, Clone, Default)]
pub struct Spanned<T> {
    pub span: Span,
    pub inner: T,
}

impl<T> AsRef<T> for Spanned<T> {
    fn as_ref(&self) -> &T {
        &self.inner
    }
}

impl<T, E> FromSyntax<E> for Spanned<T>
where
    T: FromSyntax<E>,
{
    fn from_syntax(node: &mut Node<E>) -> Self {
        let inner = T::from_syntax(node);
        Self {
            span: node.span,
            inner,
        }
    }
}

pub trait FromSyntax<E> {
    fn from_syntax(node: &mut Node<E>) -> Self;
}

/// A cursor over the children of one grammar pair. Children are consumed
/// by rule as the AST is built; errors found on the way are collected and
/// bubble up to the parent node.
pub struct Node<'i, E> {
    pub rule: Rule,
    pub txt: &'i str,
    pub span: Span,
    pairs: Vec<Pair<'i, Rule>>,
    pub errors: Vec<E>,
}

impl<'i, E> Node<'i, E> {
    pub fn new(pair: Pair<'i, Rule>) -> Self {
        let s = pair.as_span();
        Self {
            rule: pair.as_rule(),
            txt: pair.as_str(),
            span: Span::from_range(s.start()..s.end()),
            pairs: pair.into_inner().collect(),
            errors: Vec::new(),
        }
    }

    pub fn error(&mut self, err: E) {
        self.errors.push(err);
    }

    /// Runs `f` on a child node built from `pair`, keeping its errors.
    fn with_child<F, T>(&mut self, pair: Pair<'i, Rule>, f: F) -> T
    where
        F: FnOnce(&mut Self) -> T,
    {
        let mut child = Node::new(pair);
        let r = f(&mut child);
        self.errors.append(&mut child.errors);
        r
    }

    /// Replaces this node by its only remaining child.
    pub fn descend(&mut self) {
        debug_assert_eq!(self.pairs.len(), 1);
        if let Some(p) = self.pairs.pop() {
            let errors = std::mem::take(&mut self.errors);
            *self = Node::new(p);
            self.errors = errors;
        }
    }

    pub fn descend_into_opt<F, T>(&mut self, rule: Rule, f: F) -> Option<T>
    where
        F: FnOnce(&mut Self) -> T,
    {
        let p = self.get_opt(rule)?;
        Some(self.with_child(p, f))
    }

    /// Converts the first child matching `rule`.
    ///
    /// # Panics
    /// Panics if no such child exists, which means the grammar and the AST
    /// disagree.
    pub fn single<T: FromSyntax<E>>(&mut self, rule: Rule) -> T {
        match self.single_opt(rule) {
            Some(t) => t,
            None => panic!("missing {rule:?} inside {:?}", self.rule),
        }
    }

    pub fn single_opt<T: FromSyntax<E>>(&mut self, rule: Rule) -> Option<T> {
        let p = self.get_opt(rule)?;
        Some(self.with_child(p, T::from_syntax))
    }

    /// Converts every child matching `rule`, in order.
    pub fn multi<T: FromSyntax<E>>(&mut self, rule: Rule) -> Vec<T> {
        let (taken, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pairs)
            .into_iter()
            .partition(|p| p.as_rule() == rule);
        self.pairs = rest;
        taken
            .into_iter()
            .map(|p| self.with_child(p, T::from_syntax))
            .collect()
    }

    pub fn get_opt(&mut self, rule: Rule) -> Option<Pair<'i, Rule>> {
        let pos = self.pairs.iter().position(|p| p.as_rule() == rule)?;
        Some(self.pairs.remove(pos))
    }

    pub fn has(&self, rule: Rule) -> bool {
        self.pairs.iter().any(|p| p.as_rule() == rule)
    }
}
