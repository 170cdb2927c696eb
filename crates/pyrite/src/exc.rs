//! Runtime exceptions and the error type evaluation threads through.

use strum::{Display, EnumString, IntoStaticStr, VariantArray};

use crate::ast::ClassId;
use crate::diag::DiagKind;
use crate::token::Span;

/// Result alias for operations that can raise a language-level exception.
pub type RunResult<T> = Result<T, RunError>;

/// Builtin exception types.
///
/// The string form matches the variant name exactly (`ValueError` renders
/// as "ValueError"), which also lets sema resolve exception names with
/// `FromStr`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr, VariantArray, serde::Serialize, serde::Deserialize,
)]
pub enum ExcKind {
    BaseException,
    Exception,

    // --- ArithmeticError hierarchy ---
    ArithmeticError,
    ZeroDivisionError,
    OverflowError,

    // --- LookupError hierarchy ---
    LookupError,
    IndexError,
    KeyError,

    // --- RuntimeError hierarchy ---
    RuntimeError,
    NotImplementedError,
    RecursionError,

    // --- NameError hierarchy ---
    NameError,
    UnboundLocalError,

    // --- ImportError hierarchy ---
    ImportError,
    ModuleNotFoundError,

    // --- Standalone types ---
    AttributeError,
    AssertionError,
    GeneratorExit,
    StopIteration,
    SyntaxError,
    TypeError,
    ValueError,
}

impl ExcKind {
    /// Whether `except handler_type:` catches this exception.
    ///
    /// Matching is by the subclass relation, not structural equality on the
    /// type expression.
    #[must_use]
    pub fn is_subclass_of(self, handler_type: Self) -> bool {
        if self == handler_type {
            return true;
        }
        match handler_type {
            Self::BaseException => true,
            Self::Exception => !matches!(self, Self::BaseException | Self::GeneratorExit),
            Self::ArithmeticError => matches!(self, Self::ZeroDivisionError | Self::OverflowError),
            Self::LookupError => matches!(self, Self::IndexError | Self::KeyError),
            Self::RuntimeError => matches!(self, Self::NotImplementedError | Self::RecursionError),
            Self::NameError => matches!(self, Self::UnboundLocalError),
            Self::ImportError => matches!(self, Self::ModuleNotFoundError),
            _ => false,
        }
    }

    /// The diagnostic kind an unhandled exception of this type surfaces as.
    pub fn diag_kind(self) -> DiagKind {
        match self {
            Self::NameError | Self::UnboundLocalError => DiagKind::NameError,
            Self::TypeError => DiagKind::TypeError,
            Self::AttributeError => DiagKind::AttributeError,
            Self::ImportError => DiagKind::ImportError,
            Self::ModuleNotFoundError => DiagKind::ModuleNotFoundError,
            Self::SyntaxError => DiagKind::SyntaxError,
            Self::AssertionError => DiagKind::AssertionError,
            Self::RecursionError => DiagKind::RecursionError,
            _ => DiagKind::RuntimeError,
        }
    }
}

/// A raised exception value: builtin kind, optional user class, message.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ExcValue {
    pub kind: ExcKind,
    /// Set when the raised value is an instance of a user-defined class
    /// deriving from an exception type.
    pub class: Option<ClassId>,
    pub message: Option<String>,
}

impl ExcValue {
    pub fn new(kind: ExcKind, message: Option<String>) -> Self {
        Self {
            kind,
            class: None,
            message,
        }
    }

    pub fn with_class(kind: ExcKind, class: ClassId, message: Option<String>) -> Self {
        Self {
            kind,
            class: Some(class),
            message,
        }
    }
}

/// An in-flight raise: the exception, where it was raised, and its cause.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ExcRaise {
    pub exc: ExcValue,
    pub span: Span,
    pub cause: Option<ExcValue>,
}

/// Error type threaded through native operations and the evaluator.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum RunError {
    /// A language-level exception, handled by `try`/`except`.
    Exc(Box<ExcRaise>),
    /// An internal invariant violation; aborts evaluation with a trace.
    Fatal(String),
}

impl RunError {
    pub fn raise(kind: ExcKind, message: impl Into<String>, span: Span) -> Self {
        Self::Exc(Box::new(ExcRaise {
            exc: ExcValue::new(kind, Some(message.into())),
            span,
            cause: None,
        }))
    }

    pub fn type_error(message: impl Into<String>, span: Span) -> Self {
        Self::raise(ExcKind::TypeError, message, span)
    }

    pub fn value_error(message: impl Into<String>, span: Span) -> Self {
        Self::raise(ExcKind::ValueError, message, span)
    }

    pub fn name_error(message: impl Into<String>, span: Span) -> Self {
        Self::raise(ExcKind::NameError, message, span)
    }

    pub fn attribute_error(message: impl Into<String>, span: Span) -> Self {
        Self::raise(ExcKind::AttributeError, message, span)
    }

    pub fn index_error(message: impl Into<String>, span: Span) -> Self {
        Self::raise(ExcKind::IndexError, message, span)
    }

    pub fn key_error(message: impl Into<String>, span: Span) -> Self {
        Self::raise(ExcKind::KeyError, message, span)
    }

    pub fn zero_division(span: Span) -> Self {
        Self::raise(ExcKind::ZeroDivisionError, "division by zero", span)
    }

    pub fn stop_iteration(span: Span) -> Self {
        Self::Exc(Box::new(ExcRaise {
            exc: ExcValue::new(ExcKind::StopIteration, None),
            span,
            cause: None,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subclass_matching_follows_the_hierarchy() {
        assert!(ExcKind::ZeroDivisionError.is_subclass_of(ExcKind::ArithmeticError));
        assert!(ExcKind::ZeroDivisionError.is_subclass_of(ExcKind::Exception));
        assert!(ExcKind::KeyError.is_subclass_of(ExcKind::LookupError));
        assert!(!ExcKind::KeyError.is_subclass_of(ExcKind::ArithmeticError));
        assert!(ExcKind::GeneratorExit.is_subclass_of(ExcKind::BaseException));
        assert!(!ExcKind::GeneratorExit.is_subclass_of(ExcKind::Exception));
    }

    #[test]
    fn names_parse_back() {
        assert_eq!("ValueError".parse::<ExcKind>().unwrap(), ExcKind::ValueError);
        assert!("NoSuchError".parse::<ExcKind>().is_err());
    }
}
