//! Structured diagnostics for the lexer, parser, and sema.
//!
//! Each diagnostic renders on one line as `<path>:<line>:<col>: <kind>: <message>`.
//! The phases collect diagnostics and keep going; the set is surfaced to the
//! caller once a phase finishes.

use std::fmt;

use strum::{Display, IntoStaticStr};

use crate::token::Span;

/// Diagnostic kinds, matching the language's user-facing error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr, serde::Serialize, serde::Deserialize)]
pub enum DiagKind {
    NameError,
    TypeError,
    AttributeError,
    ImportError,
    ModuleNotFoundError,
    SyntaxError,
    IndentationError,
    RuntimeError,
    AssertionError,
    UnsupportedOperand,
    RecursionError,
}

/// One reported problem with its source position.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Diagnostic {
    pub kind: DiagKind,
    pub message: String,
    pub span: Span,
}

impl Diagnostic {
    pub fn new(kind: DiagKind, message: impl Into<String>, span: Span) -> Self {
        Self {
            kind,
            message: message.into(),
            span,
        }
    }

    pub fn syntax(message: impl Into<String>, span: Span) -> Self {
        Self::new(DiagKind::SyntaxError, message, span)
    }

    pub fn name_error(message: impl Into<String>, span: Span) -> Self {
        Self::new(DiagKind::NameError, message, span)
    }

    pub fn type_error(message: impl Into<String>, span: Span) -> Self {
        Self::new(DiagKind::TypeError, message, span)
    }

    pub fn attribute_error(message: impl Into<String>, span: Span) -> Self {
        Self::new(DiagKind::AttributeError, message, span)
    }

    /// Renders as `<path>:<line>:<col>: <kind>: <message>`.
    pub fn rendered(&self, path: &str) -> String {
        format!("{path}:{}:{}: {}: {}", self.span.line, self.span.col, self.kind, self.message)
    }
}

/// The diagnostics of one phase, tagged with the file they came from.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Diagnostics {
    pub path: String,
    pub items: Vec<Diagnostic>,
}

impl std::error::Error for Diagnostics {}

/// Single-error wrapper for embedders that thread diagnostics through
/// `anyhow`-style error chains.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct DiagnosticError(pub Diagnostics);

impl Diagnostics {
    pub fn new(path: impl Into<String>, items: Vec<Diagnostic>) -> Self {
        Self {
            path: path.into(),
            items,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True when any diagnostic carries the given kind.
    pub fn has_kind(&self, kind: DiagKind) -> bool {
        self.items.iter().any(|d| d.kind == kind)
    }
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, item) in self.items.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", item.rendered(&self.path))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_one_line_per_diagnostic() {
        let diags = Diagnostics::new(
            "demo.py",
            vec![
                Diagnostic::name_error("x is not defined", Span::new(2, 9)),
                Diagnostic::type_error("expected i32, found str", Span::new(4, 0)),
            ],
        );
        let text = diags.to_string();
        assert_eq!(
            text,
            "demo.py:2:9: NameError: x is not defined\ndemo.py:4:0: TypeError: expected i32, found str"
        );
    }
}
