//! Hand-written lexer: characters in, indentation-aware token stream out.
//!
//! The lexer exposes a single-token lookahead stream (`peek_token` is
//! idempotent until the next `next_token`). Structural tokens are
//! synthesized at line boundaries:
//!
//! * `Newline` at end of line, collapsed across blank lines;
//! * `Indent` when the indentation level strictly increases, one or more
//!   `Dedent` when it decreases — suppressed inside `(`/`[`/`{` groups;
//! * dedents back to level zero, then `Eof`, at end of input.
//!
//! Operators are matched greedily against the trie built from the
//! precedence table. An unrecognized character becomes an `Incorrect`
//! token and scanning continues with the next character; recovery is the
//! parser's job.

use std::collections::VecDeque;
use std::sync::LazyLock;

use ahash::AHashMap;
use smallvec::{smallvec, SmallVec};

use crate::diag::{Diagnostic, Diagnostics};
use crate::intern::Interner;
use crate::ops::{op_trie, punctuation_kind};
use crate::token::{Span, Token, TokenKind};

/// Keyword table consulted after scanning a maximal identifier run.
static KEYWORDS: LazyLock<AHashMap<&'static str, TokenKind>> = LazyLock::new(|| {
    use TokenKind::*;
    let mut t = AHashMap::new();
    for (text, kind) in [
        ("def", Def),
        ("class", Class),
        ("return", Return),
        ("if", If),
        ("elif", Elif),
        ("else", Else),
        ("while", While),
        ("for", For),
        ("in", In),
        ("import", Import),
        ("from", From),
        ("as", As),
        ("with", With),
        ("try", Try),
        ("except", Except),
        ("finally", Finally),
        ("raise", Raise),
        ("match", Match),
        ("case", Case),
        ("lambda", Lambda),
        ("yield", Yield),
        ("await", Await),
        ("async", Async),
        ("global", Global),
        ("nonlocal", Nonlocal),
        ("pass", Pass),
        ("break", Break),
        ("continue", Continue),
        ("del", Del),
        ("assert", Assert),
        ("True", True),
        ("False", False),
        ("None", NoneKw),
        ("and", And),
        ("or", Or),
        ("not", Not),
        ("is", Is),
    ] {
        t.insert(text, kind);
    }
    t
});

/// A stream of tokens with one-token lookahead.
pub trait TokenStream {
    /// Consumes and returns the next token. Past the end, keeps returning `Eof`.
    fn next_token(&mut self) -> Token;

    /// Returns the upcoming token without consuming it.
    fn peek_token(&mut self) -> Token;

    /// The token most recently returned by `next_token`.
    fn token(&self) -> Token;
}

/// State for an in-flight f-string.
#[derive(Debug, Clone, Copy)]
struct FStrState {
    quote: u8,
    /// Inside a `{...}` interpolation hole.
    in_hole: bool,
    /// Bracket nesting within the current hole.
    hole_depth: usize,
}

/// The lexer proper.
pub struct Lexer<'src, 'i> {
    source: &'src [u8],
    pos: usize,
    line: u32,
    col: u32,
    interner: &'i mut Interner,
    pending: VecDeque<Token>,
    indent_stack: SmallVec<[u32; 8]>,
    bracket_depth: usize,
    fstrings: Vec<FStrState>,
    at_line_start: bool,
    emitted_any: bool,
    last_was_newline: bool,
    current: Token,
    done: bool,
    pub diagnostics: Vec<Diagnostic>,
}

impl<'src, 'i> Lexer<'src, 'i> {
    pub fn new(source: &'src str, interner: &'i mut Interner) -> Self {
        Self {
            source: source.as_bytes(),
            pos: 0,
            line: 1,
            col: 0,
            interner,
            pending: VecDeque::new(),
            indent_stack: smallvec![0],
            bracket_depth: 0,
            fstrings: Vec::new(),
            at_line_start: true,
            emitted_any: false,
            last_was_newline: true,
            current: Token::new(TokenKind::Eof, Span::new(1, 0)),
            done: false,
            diagnostics: Vec::new(),
        }
    }

    /// Drains the whole stream into a vector ending with `Eof`.
    pub fn extract_tokens(mut self) -> (Vec<Token>, Vec<Diagnostic>) {
        let mut tokens = Vec::new();
        loop {
            let tok = self.next_token();
            let is_eof = tok.kind == TokenKind::Eof;
            tokens.push(tok);
            if is_eof {
                break;
            }
        }
        (tokens, self.diagnostics)
    }

    fn span(&self) -> Span {
        Span::new(self.line, self.col)
    }

    fn peek_byte(&self) -> Option<u8> {
        self.source.get(self.pos).copied()
    }

    fn peek_byte_at(&self, offset: usize) -> Option<u8> {
        self.source.get(self.pos + offset).copied()
    }

    fn advance(&mut self) -> u8 {
        let b = self.source[self.pos];
        self.pos += 1;
        self.col += 1;
        b
    }

    fn emit(&mut self, token: Token) {
        self.emitted_any = true;
        self.last_was_newline = token.kind == TokenKind::Newline;
        self.pending.push_back(token);
    }

    fn error(&mut self, message: impl Into<String>, span: Span) {
        self.diagnostics.push(Diagnostic::syntax(message, span));
    }

    /// Produces zero or more tokens into the pending queue; sets `done` once
    /// the terminal `Eof` has been queued.
    fn pump(&mut self) {
        if self.done {
            return;
        }

        if self.at_line_start && self.bracket_depth == 0 && self.fstrings.is_empty() {
            if self.handle_line_start() {
                return;
            }
        }

        if let Some(state) = self.fstrings.last().copied() {
            if !state.in_hole {
                self.scan_fstring_chunk(state.quote);
                return;
            }
        }

        self.skip_inline_space();

        let Some(b) = self.peek_byte() else {
            self.finish();
            return;
        };

        match b {
            b'\n' | b'\r' => self.scan_newline(),
            b'#' => {
                while let Some(c) = self.peek_byte() {
                    if c == b'\n' {
                        break;
                    }
                    self.advance();
                }
            }
            b'"' | b'\'' => self.scan_string(),
            b'f' | b'F' if matches!(self.peek_byte_at(1), Some(b'"') | Some(b'\'')) => self.scan_fstring_start(),
            _ if b.is_ascii_digit() => self.scan_number(),
            _ if b.is_ascii_alphabetic() || b == b'_' => self.scan_identifier(),
            b':' if self.in_hole_at_depth_zero() && self.peek_byte_at(1) != Some(b'=') => self.scan_format_spec(),
            _ if op_trie().starts(b) => self.scan_operator(),
            _ => {
                let span = self.span();
                let glyph = self.advance();
                let text = self.interner.intern(&(glyph as char).to_string());
                self.error(format!("unrecognized character {:?}", glyph as char), span);
                self.emit(Token::with_text(TokenKind::Incorrect, span, text));
            }
        }
    }

    fn in_hole_at_depth_zero(&self) -> bool {
        matches!(self.fstrings.last(), Some(s) if s.in_hole && s.hole_depth == 0)
    }

    /// Measures indentation, skips blank lines, and queues indent/dedent
    /// tokens. Returns true when it consumed a blank line (caller re-pumps).
    fn handle_line_start(&mut self) -> bool {
        let line_span = self.span();
        let mut spaces = 0u32;
        let mut tabs = 0u32;
        let mut chars = 0u32;
        while let Some(b) = self.peek_byte() {
            match b {
                b' ' => spaces += 1,
                b'\t' => tabs += 1,
                _ => break,
            }
            chars += 1;
            self.advance();
        }

        match self.peek_byte() {
            // Blank line or comment-only line: no structural tokens.
            None => {
                self.at_line_start = false;
                return false;
            }
            Some(b'\n') | Some(b'\r') => {
                self.consume_line_break();
                return true;
            }
            Some(b'#') => {
                while let Some(c) = self.peek_byte() {
                    if c == b'\n' {
                        break;
                    }
                    self.advance();
                }
                if self.peek_byte().is_some() {
                    self.consume_line_break();
                }
                return true;
            }
            _ => {}
        }

        if spaces > 0 && tabs > 0 {
            self.error("inconsistent use of tabs and spaces in indentation", line_span);
        }

        self.at_line_start = false;
        let indent = chars;
        let current = *self.indent_stack.last().expect("indent stack is never empty");
        if indent > current {
            self.indent_stack.push(indent);
            self.emit(Token::new(TokenKind::Indent, self.span()));
        } else if indent < current {
            while indent < *self.indent_stack.last().expect("indent stack is never empty") {
                self.indent_stack.pop();
                self.emit(Token::new(TokenKind::Dedent, self.span()));
            }
            if indent != *self.indent_stack.last().expect("indent stack is never empty") {
                self.error("unindent does not match any outer indentation level", line_span);
            }
        }
        !self.pending.is_empty()
    }

    fn consume_line_break(&mut self) {
        if self.peek_byte() == Some(b'\r') {
            self.advance();
        }
        if self.peek_byte() == Some(b'\n') {
            self.advance();
        }
        self.line += 1;
        self.col = 0;
        self.at_line_start = true;
    }

    fn skip_inline_space(&mut self) {
        while let Some(b) = self.peek_byte() {
            if b == b' ' || b == b'\t' {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn scan_newline(&mut self) {
        let span = self.span();
        self.consume_line_break();
        if self.bracket_depth == 0 && self.fstrings.is_empty() {
            if !self.last_was_newline && self.emitted_any {
                self.emit(Token::new(TokenKind::Newline, span));
            }
        } else {
            // Continuation line inside a bracketed group: no structure.
            self.at_line_start = false;
        }
    }

    fn finish(&mut self) {
        if !self.last_was_newline && self.emitted_any {
            self.emit(Token::new(TokenKind::Newline, self.span()));
        }
        while self.indent_stack.len() > 1 {
            self.indent_stack.pop();
            self.emit(Token::new(TokenKind::Dedent, self.span()));
        }
        self.emit(Token::new(TokenKind::Eof, self.span()));
        self.done = true;
    }

    fn scan_identifier(&mut self) {
        let span = self.span();
        let start = self.pos;
        while let Some(b) = self.peek_byte() {
            // `!` joins only when not starting `!=`, so `a!=b` stays a comparison.
            let is_ident = b.is_ascii_alphanumeric()
                || b == b'_'
                || b == b'?'
                || (b == b'!' && self.peek_byte_at(1) != Some(b'='));
            // `-` joins an identifier only when another identifier character
            // follows, so `a-b` is one name but `a - b` and `a-=1` are not.
            let is_joining_dash = b == b'-'
                && matches!(self.peek_byte_at(1), Some(n) if n.is_ascii_alphanumeric() || n == b'_');
            if is_ident || is_joining_dash {
                self.advance();
            } else {
                break;
            }
        }
        let text = std::str::from_utf8(&self.source[start..self.pos]).expect("identifier bytes are ASCII");
        if let Some(&kind) = KEYWORDS.get(text) {
            self.emit(Token::new(kind, span));
        } else {
            let id = self.interner.intern(text);
            self.emit(Token::with_text(TokenKind::Identifier, span, id));
        }
    }

    fn scan_number(&mut self) {
        let span = self.span();
        let start = self.pos;
        let mut is_float = false;
        while matches!(self.peek_byte(), Some(b) if b.is_ascii_digit() || b == b'_') {
            self.advance();
        }
        if self.peek_byte() == Some(b'.') && matches!(self.peek_byte_at(1), Some(b) if b.is_ascii_digit()) {
            is_float = true;
            self.advance();
            while matches!(self.peek_byte(), Some(b) if b.is_ascii_digit() || b == b'_') {
                self.advance();
            }
        }
        if matches!(self.peek_byte(), Some(b'e') | Some(b'E')) {
            let mut offset = 1;
            if matches!(self.peek_byte_at(1), Some(b'+') | Some(b'-')) {
                offset = 2;
            }
            if matches!(self.peek_byte_at(offset), Some(b) if b.is_ascii_digit()) {
                is_float = true;
                for _ in 0..offset {
                    self.advance();
                }
                while matches!(self.peek_byte(), Some(b) if b.is_ascii_digit()) {
                    self.advance();
                }
            }
        }

        let text: String = std::str::from_utf8(&self.source[start..self.pos])
            .expect("number bytes are ASCII")
            .chars()
            .filter(|&c| c != '_')
            .collect();
        if is_float {
            match text.parse::<f64>() {
                Ok(v) => self.emit(Token::with_float(TokenKind::Float, span, v)),
                Err(_) => {
                    self.error(format!("invalid float literal '{text}'"), span);
                    self.emit(Token::with_float(TokenKind::Float, span, 0.0));
                }
            }
        } else {
            match text.parse::<i64>() {
                Ok(v) => self.emit(Token::with_int(TokenKind::Int, span, v)),
                Err(_) => {
                    self.error(format!("integer literal '{text}' out of range"), span);
                    self.emit(Token::with_int(TokenKind::Int, span, 0));
                }
            }
        }
    }

    fn scan_string(&mut self) {
        let span = self.span();
        let quote = self.advance();
        if self.peek_byte() == Some(quote) && self.peek_byte_at(1) == Some(quote) {
            self.advance();
            self.advance();
            self.scan_triple_string(quote, span);
            return;
        }

        let mut contents = String::new();
        loop {
            match self.peek_byte() {
                None | Some(b'\n') => {
                    self.error("unterminated string literal", span);
                    break;
                }
                Some(b) if b == quote => {
                    self.advance();
                    break;
                }
                Some(b'\\') => {
                    self.advance();
                    self.scan_escape(&mut contents, span);
                }
                Some(b) => {
                    self.advance();
                    contents.push(b as char);
                }
            }
        }
        let id = self.interner.intern(&contents);
        self.emit(Token::with_text(TokenKind::Str, span, id));
    }

    /// Triple-quoted strings lex as `Docstring`; the parser demotes the ones
    /// that are not the first statement of a body.
    fn scan_triple_string(&mut self, quote: u8, span: Span) {
        let mut contents = String::new();
        loop {
            match self.peek_byte() {
                None => {
                    self.error("unterminated triple-quoted string", span);
                    break;
                }
                Some(b) if b == quote
                    && self.peek_byte_at(1) == Some(quote)
                    && self.peek_byte_at(2) == Some(quote) =>
                {
                    self.advance();
                    self.advance();
                    self.advance();
                    break;
                }
                Some(b'\n') => {
                    self.advance();
                    self.line += 1;
                    self.col = 0;
                    contents.push('\n');
                }
                Some(b'\\') => {
                    self.advance();
                    self.scan_escape(&mut contents, span);
                }
                Some(b) => {
                    self.advance();
                    contents.push(b as char);
                }
            }
        }
        let id = self.interner.intern(&contents);
        self.emit(Token::with_text(TokenKind::Docstring, span, id));
    }

    fn scan_escape(&mut self, contents: &mut String, span: Span) {
        match self.peek_byte() {
            Some(b'n') => {
                self.advance();
                contents.push('\n');
            }
            Some(b't') => {
                self.advance();
                contents.push('\t');
            }
            Some(b'r') => {
                self.advance();
                contents.push('\r');
            }
            Some(b'0') => {
                self.advance();
                contents.push('\0');
            }
            Some(b'\\') => {
                self.advance();
                contents.push('\\');
            }
            Some(b'\'') => {
                self.advance();
                contents.push('\'');
            }
            Some(b'"') => {
                self.advance();
                contents.push('"');
            }
            Some(other) => {
                self.advance();
                self.error(format!("unknown escape sequence '\\{}'", other as char), span);
                contents.push(other as char);
            }
            None => {}
        }
    }

    fn scan_fstring_start(&mut self) {
        let span = self.span();
        self.advance(); // f
        let quote = self.advance();
        self.fstrings.push(FStrState {
            quote,
            in_hole: false,
            hole_depth: 0,
        });
        self.emit(Token::new(TokenKind::FStrStart, span));
    }

    /// Scans a literal chunk of an f-string up to the next hole or the
    /// closing quote.
    fn scan_fstring_chunk(&mut self, quote: u8) {
        let span = self.span();
        let mut contents = String::new();
        loop {
            match self.peek_byte() {
                None | Some(b'\n') => {
                    self.error("unterminated f-string", span);
                    self.fstrings.pop();
                    break;
                }
                Some(b) if b == quote => {
                    self.advance();
                    if !contents.is_empty() {
                        let id = self.interner.intern(&contents);
                        self.emit(Token::with_text(TokenKind::FStrMiddle, span, id));
                    }
                    self.emit(Token::new(TokenKind::FStrEnd, self.span()));
                    self.fstrings.pop();
                    return;
                }
                Some(b'{') if self.peek_byte_at(1) == Some(b'{') => {
                    self.advance();
                    self.advance();
                    contents.push('{');
                }
                Some(b'}') if self.peek_byte_at(1) == Some(b'}') => {
                    self.advance();
                    self.advance();
                    contents.push('}');
                }
                Some(b'{') => {
                    let brace_span = self.span();
                    self.advance();
                    if !contents.is_empty() {
                        let id = self.interner.intern(&contents);
                        self.emit(Token::with_text(TokenKind::FStrMiddle, span, id));
                    }
                    if let Some(state) = self.fstrings.last_mut() {
                        state.in_hole = true;
                        state.hole_depth = 0;
                    }
                    self.emit(Token::new(TokenKind::LBrace, brace_span));
                    return;
                }
                Some(b'\\') => {
                    self.advance();
                    self.scan_escape(&mut contents, span);
                }
                Some(b) => {
                    self.advance();
                    contents.push(b as char);
                }
            }
        }
        if !contents.is_empty() {
            let id = self.interner.intern(&contents);
            self.emit(Token::with_text(TokenKind::FStrMiddle, span, id));
        }
    }

    /// Scans `:spec` inside an interpolation hole as literal text.
    fn scan_format_spec(&mut self) {
        self.advance(); // :
        let span = self.span();
        let start = self.pos;
        while let Some(b) = self.peek_byte() {
            if b == b'}' || b == b'\n' {
                break;
            }
            self.advance();
        }
        let text = std::str::from_utf8(&self.source[start..self.pos])
            .expect("format spec bytes are ASCII")
            .to_owned();
        let id = self.interner.intern(&text);
        self.emit(Token::with_text(TokenKind::Str, span, id));
    }

    fn scan_operator(&mut self) {
        let span = self.span();
        let Some(len) = op_trie().longest_match(&self.source[self.pos..]) else {
            let glyph = self.advance();
            let text = self.interner.intern(&(glyph as char).to_string());
            self.error(format!("unrecognized character {:?}", glyph as char), span);
            self.emit(Token::with_text(TokenKind::Incorrect, span, text));
            return;
        };
        let start = self.pos;
        for _ in 0..len {
            self.advance();
        }
        let spelling = std::str::from_utf8(&self.source[start..self.pos]).expect("operator bytes are ASCII");

        // An interpolation hole closes on `}` at bracket depth zero.
        if spelling == "}" {
            if let Some(state) = self.fstrings.last_mut() {
                if state.in_hole {
                    if state.hole_depth == 0 {
                        state.in_hole = false;
                        self.emit(Token::new(TokenKind::RBrace, span));
                        return;
                    }
                    state.hole_depth -= 1;
                }
            }
        }

        match spelling {
            "(" | "[" | "{" => {
                self.bracket_depth += 1;
                if let Some(state) = self.fstrings.last_mut() {
                    if state.in_hole {
                        state.hole_depth += 1;
                    }
                }
            }
            ")" | "]" | "}" => {
                self.bracket_depth = self.bracket_depth.saturating_sub(1);
                if let Some(state) = self.fstrings.last_mut() {
                    if state.in_hole && spelling != "}" {
                        state.hole_depth = state.hole_depth.saturating_sub(1);
                    }
                }
            }
            _ => {}
        }

        match punctuation_kind(spelling) {
            Some(kind) => self.emit(Token::new(kind, span)),
            None => {
                let id = self.interner.intern(spelling);
                self.emit(Token::with_text(TokenKind::Operator, span, id));
            }
        }
    }
}

impl TokenStream for Lexer<'_, '_> {
    fn next_token(&mut self) -> Token {
        while self.pending.is_empty() && !self.done {
            self.pump();
        }
        let tok = self
            .pending
            .pop_front()
            .unwrap_or_else(|| Token::new(TokenKind::Eof, self.span()));
        self.current = tok;
        tok
    }

    fn peek_token(&mut self) -> Token {
        while self.pending.is_empty() && !self.done {
            self.pump();
        }
        self.pending
            .front()
            .copied()
            .unwrap_or_else(|| Token::new(TokenKind::Eof, self.span()))
    }

    fn token(&self) -> Token {
        self.current
    }
}

/// A lexer over a buffered token vector, for re-parsing a captured stream.
pub struct ReplayLexer {
    tokens: Vec<Token>,
    pos: usize,
    current: Token,
}

impl ReplayLexer {
    /// The vector must end with an `Eof` token, as produced by
    /// [`Lexer::extract_tokens`].
    pub fn new(tokens: Vec<Token>) -> Self {
        assert!(
            matches!(tokens.last(), Some(t) if t.kind == TokenKind::Eof),
            "replay buffer must end with Eof"
        );
        let current = Token::new(TokenKind::Eof, Span::new(1, 0));
        Self {
            tokens,
            pos: 0,
            current,
        }
    }
}

impl TokenStream for ReplayLexer {
    fn next_token(&mut self) -> Token {
        let tok = self.tokens[self.pos];
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        self.current = tok;
        tok
    }

    fn peek_token(&mut self) -> Token {
        self.tokens[self.pos]
    }

    fn token(&self) -> Token {
        self.current
    }
}

/// Lexes a whole source string, returning the token vector and diagnostics.
pub fn tokenize(source: &str, interner: &mut Interner) -> (Vec<Token>, Vec<Diagnostic>) {
    Lexer::new(source, interner).extract_tokens()
}

/// Lexes and renders one token per line, for `--dump-tokens`.
pub fn dump_tokens(source: &str, path: &str) -> Result<String, Diagnostics> {
    let mut interner = Interner::new();
    let (tokens, diagnostics) = tokenize(source, &mut interner);
    if !diagnostics.is_empty() {
        return Err(Diagnostics::new(path, diagnostics));
    }
    let mut out = String::new();
    for tok in tokens {
        out.push_str(&tok.render(&interner));
        out.push('\n');
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        let mut interner = Interner::new();
        let (tokens, diagnostics) = tokenize(source, &mut interner);
        assert!(diagnostics.is_empty(), "unexpected diagnostics: {diagnostics:?}");
        tokens.into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn indent_dedent_synthesis() {
        use TokenKind::*;
        let got = kinds("def f():\n    pass\nx = 1\n");
        assert_eq!(
            got,
            vec![
                Def, Identifier, LParen, RParen, Colon, Newline, Indent, Pass, Newline, Dedent, Identifier, Assign,
                Int, Newline, Eof
            ]
        );
    }

    #[test]
    fn blank_lines_collapse() {
        use TokenKind::*;
        let got = kinds("a = 1\n\n\n\nb = 2\n");
        assert_eq!(got, vec![Identifier, Assign, Int, Newline, Identifier, Assign, Int, Newline, Eof]);
    }

    #[test]
    fn brackets_suppress_structure() {
        use TokenKind::*;
        let got = kinds("x = (1 +\n     2)\n");
        assert_eq!(
            got,
            vec![Identifier, Assign, LParen, Int, Operator, Int, RParen, Newline, Eof]
        );
    }

    #[test]
    fn multiple_dedents_at_one_boundary() {
        use TokenKind::*;
        let got = kinds("if a:\n    if b:\n        pass\nc = 1\n");
        let dedents = got.iter().filter(|k| **k == Dedent).count();
        assert_eq!(dedents, 2);
    }

    #[test]
    fn operators_match_greedily() {
        let mut interner = Interner::new();
        let (tokens, _) = tokenize("a **= 2 ** 3\n", &mut interner);
        let spellings: Vec<_> = tokens
            .iter()
            .filter(|t| t.kind == TokenKind::Operator)
            .map(|t| interner.get(t.text().unwrap()).to_owned())
            .collect();
        assert_eq!(spellings, vec!["**=", "**"]);
    }

    #[test]
    fn identifiers_allow_interior_punctuation() {
        let mut interner = Interner::new();
        let (tokens, _) = tokenize("valid? dash-name shout!\n", &mut interner);
        let names: Vec<_> = tokens
            .iter()
            .filter(|t| t.kind == TokenKind::Identifier)
            .map(|t| interner.get(t.text().unwrap()).to_owned())
            .collect();
        assert_eq!(names, vec!["valid?", "dash-name", "shout!"]);
    }

    #[test]
    fn triple_quoted_string_lexes_as_docstring() {
        let mut interner = Interner::new();
        let (tokens, _) = tokenize("\"\"\"adds things\"\"\"\n", &mut interner);
        assert_eq!(tokens[0].kind, TokenKind::Docstring);
        assert_eq!(interner.get(tokens[0].text().unwrap()), "adds things");
    }

    #[test]
    fn incorrect_character_does_not_stop_the_stream() {
        let mut interner = Interner::new();
        let (tokens, diagnostics) = tokenize("a $ b\n", &mut interner);
        assert_eq!(diagnostics.len(), 1);
        let kinds: Vec<_> = tokens.iter().map(|t| t.kind).collect();
        use TokenKind::*;
        assert_eq!(kinds, vec![Identifier, Incorrect, Identifier, Newline, Eof]);
    }

    #[test]
    fn fstring_tokens() {
        use TokenKind::*;
        let got = kinds("f\"x={x} end\"\n");
        assert_eq!(
            got,
            vec![FStrStart, FStrMiddle, LBrace, Identifier, RBrace, FStrMiddle, FStrEnd, Newline, Eof]
        );
    }

    #[test]
    fn mixed_indentation_reports_syntax_error() {
        let mut interner = Interner::new();
        let (_, diagnostics) = tokenize("if a:\n \tpass\n", &mut interner);
        assert!(diagnostics.iter().any(|d| d.message.contains("tabs")));
    }

    #[test]
    fn replay_lexer_round_trips_the_stream() {
        let mut interner = Interner::new();
        let (tokens, _) = tokenize("a = 1\n", &mut interner);
        let expected = tokens.clone();
        let mut replay = ReplayLexer::new(tokens);
        let mut got = Vec::new();
        loop {
            let tok = replay.next_token();
            got.push(tok);
            if tok.kind == TokenKind::Eof {
                break;
            }
        }
        assert_eq!(got, expected);
    }

    #[test]
    fn peek_is_idempotent() {
        let mut interner = Interner::new();
        let mut lexer = Lexer::new("a b\n", &mut interner);
        let p1 = lexer.peek_token();
        let p2 = lexer.peek_token();
        assert_eq!(p1, p2);
        let n = lexer.next_token();
        assert_eq!(n, p1);
    }
}
