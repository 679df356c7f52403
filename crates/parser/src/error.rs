use std::io;

use annotate_snippets::{Level, Renderer, Snippet};
use smol_str::SmolStr;

use crate::{syntax::Rule, Span};

#[derive(Debug)]
#[allow(clippy::large_enum_variant)]
pub enum Error {
    NumberOutOfBounds(Span),
    SyntaxError(pest::error::Error<Rule>),
    Undefined(UndefinedKind, Span),
    DuplicateValueName(SmolStr, Span),
    DuplicateComputation(SmolStr, Span),
    UnknownType(SmolStr, Span),

    MissingAttribute {
        opcode: ir::Opcode,
        attr: &'static str,
        span: Span,
    },

    OperandCountMismatch {
        opcode: ir::Opcode,
        expected: usize,
        actual: usize,
        span: Span,
    },

    MissingEntry(Span),
    MultipleEntries(SmolStr, Span),
}

#[derive(Debug)]
pub enum UndefinedKind {
    Value(SmolStr),
    Computation(SmolStr),
    Opcode(SmolStr),
}

impl Error {
    pub fn span(&self) -> Span {
        match self {
            Error::NumberOutOfBounds(span) => *span,
            Error::Undefined(_, span) => *span,
            Error::DuplicateValueName(_, span) => *span,
            Error::DuplicateComputation(_, span) => *span,
            Error::UnknownType(_, span) => *span,
            Error::MissingAttribute { span, .. } => *span,
            Error::OperandCountMismatch { span, .. } => *span,
            Error::MissingEntry(span) => *span,
            Error::MultipleEntries(_, span) => *span,

            Error::SyntaxError(err) => match err.location {
                pest::error::InputLocation::Pos(p) => Span(p as u32, p as u32),
                pest::error::InputLocation::Span((s, e)) => Span(s as u32, e as u32),
            },
        }
    }

    pub fn message(&self) -> String {
        match self {
            Error::NumberOutOfBounds(_) => "number out of bounds".into(),

            Error::SyntaxError(err) => err.variant.message().into_owned(),

            Error::Undefined(kind, _) => match kind {
                UndefinedKind::Value(name) => format!("undefined value: `{name}`"),
                UndefinedKind::Computation(name) => format!("undefined computation: `%{name}`"),
                UndefinedKind::Opcode(name) => format!("unknown opcode: `{name}`"),
            },

            Error::DuplicateValueName(name, _) => {
                format!("value name `{name}` is already defined")
            }
            Error::DuplicateComputation(name, _) => {
                format!("computation `%{name}` is already defined")
            }
            Error::UnknownType(name, _) => format!("unknown element type: `{name}`"),

            Error::MissingAttribute { opcode, attr, .. } => {
                format!("`{opcode}` requires the `{attr}` attribute")
            }

            Error::OperandCountMismatch {
                opcode,
                expected,
                actual,
                ..
            } => format!("`{opcode}` expects {expected} operand(s), but {actual} given"),

            Error::MissingEntry(_) => "module has no entry computation".into(),
            Error::MultipleEntries(name, _) => {
                format!("`%{name}` is a second entry computation")
            }
        }
    }

    pub fn print(
        &self,
        mut w: impl io::Write,
        path: &str,
        content: &str,
        colors: bool,
    ) -> io::Result<()> {
        let label = self.message();
        let message = Level::Error.title("parse error").snippet(
            Snippet::source(content)
                .line_start(1)
                .origin(path)
                .fold(true)
                .annotation(Level::Error.span(self.span().as_range()).label(&label)),
        );
        let renderer = if colors {
            Renderer::styled()
        } else {
            Renderer::plain()
        };
        let res = writeln!(w, "{}", renderer.render(message));
        res
    }

    pub fn print_to_string(&self, path: &str, content: &str, colors: bool) -> String {
        let mut v = vec![];
        match self.print(&mut v, path, content, colors) {
            Ok(()) => String::from_utf8_lossy(&v).into_owned(),
            Err(_) => self.message(),
        }
    }
}
