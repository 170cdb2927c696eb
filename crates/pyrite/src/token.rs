//! Token types produced by the lexer.

use std::fmt;

use strum::IntoStaticStr;

use crate::intern::{Interner, StringId};

/// A source position: 1-based line, 0-based column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct Span {
    pub line: u32,
    pub col: u32,
}

impl Span {
    pub fn new(line: u32, col: u32) -> Self {
        Self { line, col }
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.col)
    }
}

/// The kind of a lexical token.
///
/// Operators that are punctuation the parser dispatches on (brackets, comma,
/// colon, `=`, `->`, `:=`) get their own kinds; every remaining operator is
/// [`TokenKind::Operator`] with its spelling as payload, looked up in the
/// precedence table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr, serde::Serialize, serde::Deserialize)]
pub enum TokenKind {
    // -- Structural --
    Newline,
    Indent,
    Dedent,
    Eof,
    /// An unrecognized character; the parser is responsible for recovery.
    Incorrect,

    // -- Literals and names --
    Int,
    Float,
    Str,
    /// Triple-quoted string. The parser decides whether it is a docstring
    /// (first statement of a body) or an ordinary constant.
    Docstring,
    /// Start of an f-string; literal chunks follow as `FStrMiddle` and the
    /// holes as ordinary tokens, terminated by `FStrEnd`.
    FStrStart,
    FStrMiddle,
    FStrEnd,
    Identifier,

    /// Any operator from the precedence table without a dedicated kind.
    Operator,

    // -- Punctuation --
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Semicolon,
    Dot,
    Arrow,
    Assign,
    Walrus,

    // -- Keywords --
    Def,
    Class,
    Return,
    If,
    Elif,
    Else,
    While,
    For,
    In,
    Import,
    From,
    As,
    With,
    Try,
    Except,
    Finally,
    Raise,
    Match,
    Case,
    Lambda,
    Yield,
    Await,
    Async,
    Global,
    Nonlocal,
    Pass,
    Break,
    Continue,
    Del,
    Assert,
    True,
    False,
    NoneKw,
    And,
    Or,
    Not,
    Is,
}

impl TokenKind {
    /// Keywords that participate in expression parsing as operators.
    ///
    /// Their spelling feeds the same precedence table as symbolic operators.
    pub fn word_operator(self) -> Option<&'static str> {
        match self {
            Self::And => Some("and"),
            Self::Or => Some("or"),
            Self::Not => Some("not"),
            Self::Is => Some("is"),
            Self::In => Some("in"),
            _ => None,
        }
    }
}

/// Literal or identifier payload carried by a token.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
enum Payload {
    Empty,
    Int(i64),
    Float(f64),
    /// Identifier, string contents, or operator spelling.
    Text(StringId),
}

/// A single token: kind, position, and optional payload.
///
/// Tokens are `Copy`; string payloads are interned ids.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
    payload: Payload,
}

impl Token {
    pub fn new(kind: TokenKind, span: Span) -> Self {
        Self {
            kind,
            span,
            payload: Payload::Empty,
        }
    }

    pub fn with_int(kind: TokenKind, span: Span, value: i64) -> Self {
        Self {
            kind,
            span,
            payload: Payload::Int(value),
        }
    }

    pub fn with_float(kind: TokenKind, span: Span, value: f64) -> Self {
        Self {
            kind,
            span,
            payload: Payload::Float(value),
        }
    }

    pub fn with_text(kind: TokenKind, span: Span, text: StringId) -> Self {
        Self {
            kind,
            span,
            payload: Payload::Text(text),
        }
    }

    /// Integer payload; zero for other payloads (callers check `kind` first).
    pub fn as_int(&self) -> i64 {
        match self.payload {
            Payload::Int(v) => v,
            _ => 0,
        }
    }

    pub fn as_float(&self) -> f64 {
        match self.payload {
            Payload::Float(v) => v,
            _ => 0.0,
        }
    }

    /// Interned text payload, if any.
    pub fn text(&self) -> Option<StringId> {
        match self.payload {
            Payload::Text(id) => Some(id),
            _ => None,
        }
    }

    /// The operator spelling this token contributes to expression parsing.
    ///
    /// Symbolic operators carry their spelling as payload; word operators
    /// (`and`, `or`, `not`, `is`, `in`) map through their kind.
    pub fn op_spelling<'a>(&self, interner: &'a Interner) -> Option<&'a str> {
        if self.kind == TokenKind::Operator {
            return self.text().map(|id| interner.get(id));
        }
        self.kind.word_operator()
    }

    /// Renders the token for `--dump-tokens`: `Kind(line:col)` with the
    /// payload appended when present.
    pub fn render(&self, interner: &Interner) -> String {
        let kind: &'static str = self.kind.into();
        match self.payload {
            Payload::Empty => format!("{kind}({})", self.span),
            Payload::Int(v) => format!("{kind}({}, {v})", self.span),
            Payload::Float(v) => format!("{kind}({}, {v})", self.span),
            Payload::Text(id) => format!("{kind}({}, {:?})", self.span, interner.get(id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_payload() {
        let mut interner = Interner::new();
        let id = interner.intern("count");
        let tok = Token::with_text(TokenKind::Identifier, Span::new(3, 4), id);
        assert_eq!(tok.render(&interner), "Identifier(3:4, \"count\")");
        let tok = Token::with_int(TokenKind::Int, Span::new(1, 0), 42);
        assert_eq!(tok.render(&interner), "Int(1:0, 42)");
    }

    #[test]
    fn word_operators_expose_spelling() {
        let interner = Interner::new();
        let tok = Token::new(TokenKind::And, Span::new(1, 0));
        assert_eq!(tok.op_spelling(&interner), Some("and"));
        let tok = Token::new(TokenKind::If, Span::new(1, 0));
        assert_eq!(tok.op_spelling(&interner), None);
    }
}
