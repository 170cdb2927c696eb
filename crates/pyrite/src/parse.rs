//! Recursive-descent parser with precedence climbing for expressions.
//!
//! The parser consumes a [`TokenStream`] and produces a [`Module`]. It never
//! aborts on the first problem: a failing statement reports a structured
//! syntax diagnostic and resynchronizes at the next newline at the current
//! indentation level, then parsing continues.

use crate::ast::{
    Arguments, CallKeyword, ClassAttr, ClassDef, ClassId, Comprehension, ConstValue, ExceptHandler, Expr, ExprLoc,
    FuncId, FunctionDef, ImportAlias, MatchCase, Module, NameRef, OpImpl, Param, Pattern, PatternLoc, Stmt, StmtLoc,
    WithItem,
};
use crate::diag::{Diagnostic, Diagnostics};
use crate::intern::{Interner, StaticStr, StringId};
use crate::lex::{tokenize, ReplayLexer, TokenStream};
use crate::ops::{precedence_table, OpConfig, UNARY_PRECEDENCE};
use crate::token::{Span, Token, TokenKind};

/// Maximum nesting depth for recursive structures, preventing stack
/// overflow on pathological inputs like `((((x))))`.
pub const MAX_NESTING_DEPTH: u16 = 200;

/// Statement-level abort; the catcher resynchronizes and keeps parsing.
struct ParseAbort;

type PResult<T> = Result<T, ParseAbort>;

/// Parses a full translation unit.
///
/// Lexes into a buffered [`ReplayLexer`] first, then parses; lexer and
/// parser diagnostics are collected together.
pub fn parse_module(source: &str, interner: &mut Interner) -> (Module, Vec<Diagnostic>) {
    let (tokens, mut diagnostics) = tokenize(source, interner);
    let mut parser = Parser::new(ReplayLexer::new(tokens), interner);
    let module = parser.parse();
    diagnostics.extend(parser.diagnostics);
    (module, diagnostics)
}

/// Convenience wrapper that fails when any diagnostic was produced.
pub fn parse_module_strict(source: &str, path: &str, interner: &mut Interner) -> Result<Module, Diagnostics> {
    let (module, diagnostics) = parse_module(source, interner);
    if diagnostics.is_empty() {
        Ok(module)
    } else {
        Err(Diagnostics::new(path, diagnostics))
    }
}

pub struct Parser<'i, L: TokenStream> {
    lex: L,
    interner: &'i Interner,
    tok: Token,
    module: Module,
    depth_remaining: u16,
    pub diagnostics: Vec<Diagnostic>,
}

impl<'i, L: TokenStream> Parser<'i, L> {
    pub fn new(mut lex: L, interner: &'i Interner) -> Self {
        let tok = lex.next_token();
        Self {
            lex,
            interner,
            tok,
            module: Module::default(),
            depth_remaining: MAX_NESTING_DEPTH,
            diagnostics: Vec::new(),
        }
    }

    // -- Cursor helpers --

    fn advance(&mut self) -> Token {
        let tok = self.tok;
        self.tok = self.lex.next_token();
        tok
    }

    fn at(&self, kind: TokenKind) -> bool {
        self.tok.kind == kind
    }

    fn eat(&mut self, kind: TokenKind) -> bool {
        if self.at(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn peek(&mut self) -> Token {
        self.lex.peek_token()
    }

    /// Current token's operator spelling, when it has one.
    fn op_spelling(&self) -> Option<&'i str> {
        if self.tok.kind == TokenKind::Operator {
            return self.tok.text().map(|id| self.interner.get(id));
        }
        self.tok.kind.word_operator()
    }

    fn is_op(&self, spelling: &str) -> bool {
        self.op_spelling() == Some(spelling)
    }

    fn error(&mut self, message: impl Into<String>, span: Span) {
        self.diagnostics.push(Diagnostic::syntax(message, span));
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> PResult<Token> {
        if self.at(kind) {
            Ok(self.advance())
        } else {
            let found: &'static str = self.tok.kind.into();
            self.error(format!("expected {what}, found {found}"), self.tok.span);
            Err(ParseAbort)
        }
    }

    fn enter(&mut self, span: Span) -> PResult<()> {
        if self.depth_remaining == 0 {
            self.error("too many nested expressions", span);
            return Err(ParseAbort);
        }
        self.depth_remaining -= 1;
        Ok(())
    }

    fn leave(&mut self) {
        self.depth_remaining += 1;
    }

    /// Skips to the next statement boundary at the current indentation
    /// level: a newline at bracket-balance zero, or a dedent.
    fn recover(&mut self) {
        let mut depth = 0usize;
        loop {
            match self.tok.kind {
                TokenKind::Newline if depth == 0 => {
                    self.advance();
                    break;
                }
                TokenKind::Indent => {
                    depth += 1;
                    self.advance();
                }
                TokenKind::Dedent => {
                    if depth == 0 {
                        break;
                    }
                    depth -= 1;
                    self.advance();
                }
                TokenKind::Eof => break,
                _ => {
                    self.advance();
                }
            }
        }
    }

    // -- Top level --

    pub fn parse(&mut self) -> Module {
        while self.eat(TokenKind::Newline) {}
        if self.at(TokenKind::Docstring) && self.peek().kind == TokenKind::Newline {
            self.module.docstring = self.tok.text();
            self.advance();
            self.advance();
        }

        let mut body = Vec::new();
        loop {
            while self.eat(TokenKind::Newline) {}
            if self.at(TokenKind::Eof) {
                break;
            }
            if self.at(TokenKind::Dedent) {
                // Stray dedent at top level; indentation already reported.
                self.advance();
                continue;
            }
            match self.parse_statement() {
                Ok(stmt) => body.push(stmt),
                Err(ParseAbort) => self.recover(),
            }
        }
        let mut module = std::mem::take(&mut self.module);
        module.body = body;
        module
    }

    // -- Statements --

    fn parse_statement(&mut self) -> PResult<StmtLoc> {
        let span = self.tok.span;
        match self.tok.kind {
            TokenKind::Def => {
                let func = self.parse_function_def(false, Vec::new())?;
                Ok(StmtLoc::new(span, Stmt::FunctionDef(func)))
            }
            TokenKind::Async => {
                self.advance();
                if !self.at(TokenKind::Def) {
                    self.error("expected 'def' after 'async'", self.tok.span);
                    return Err(ParseAbort);
                }
                let func = self.parse_function_def(true, Vec::new())?;
                Ok(StmtLoc::new(span, Stmt::FunctionDef(func)))
            }
            TokenKind::Class => {
                let class = self.parse_class_def(Vec::new())?;
                Ok(StmtLoc::new(span, Stmt::ClassDef(class)))
            }
            TokenKind::Operator if self.is_op("@") => self.parse_decorated(span),
            TokenKind::If => self.parse_if(span),
            TokenKind::While => self.parse_while(span),
            TokenKind::For => self.parse_for(span),
            TokenKind::Try => self.parse_try(span),
            TokenKind::With => self.parse_with(span),
            TokenKind::Match => self.parse_match(span),
            _ => self.parse_simple_statement_line(span),
        }
    }

    /// One or more simple statements on a line, separated by `;`.
    fn parse_simple_statement_line(&mut self, span: Span) -> PResult<StmtLoc> {
        let first = self.parse_simple_statement(span)?;
        if !self.at(TokenKind::Semicolon) {
            self.end_of_statement()?;
            return Ok(first);
        }
        let mut body = vec![first];
        while self.eat(TokenKind::Semicolon) {
            if self.at(TokenKind::Newline) || self.at(TokenKind::Eof) {
                break;
            }
            let span = self.tok.span;
            body.push(self.parse_simple_statement(span)?);
        }
        self.end_of_statement()?;
        Ok(StmtLoc::new(span, Stmt::Inline(body)))
    }

    fn end_of_statement(&mut self) -> PResult<()> {
        if self.eat(TokenKind::Newline) || self.at(TokenKind::Eof) || self.at(TokenKind::Dedent) {
            Ok(())
        } else {
            let found: &'static str = self.tok.kind.into();
            self.error(format!("expected end of statement, found {found}"), self.tok.span);
            Err(ParseAbort)
        }
    }

    fn parse_simple_statement(&mut self, span: Span) -> PResult<StmtLoc> {
        match self.tok.kind {
            TokenKind::Return => {
                self.advance();
                let value = if self.statement_ends_here() {
                    None
                } else {
                    Some(self.parse_testlist()?)
                };
                Ok(StmtLoc::new(span, Stmt::Return(value)))
            }
            TokenKind::Raise => {
                self.advance();
                let (exc, cause) = if self.statement_ends_here() {
                    (None, None)
                } else {
                    let exc = self.parse_expression()?;
                    let cause = if self.eat(TokenKind::From) {
                        Some(self.parse_expression()?)
                    } else {
                        None
                    };
                    (Some(exc), cause)
                };
                Ok(StmtLoc::new(span, Stmt::Raise { exc, cause }))
            }
            TokenKind::Assert => {
                self.advance();
                let test = self.parse_expression()?;
                let msg = if self.eat(TokenKind::Comma) {
                    Some(self.parse_expression()?)
                } else {
                    None
                };
                Ok(StmtLoc::new(span, Stmt::Assert { test, msg }))
            }
            TokenKind::Pass => {
                self.advance();
                Ok(StmtLoc::new(span, Stmt::Pass))
            }
            TokenKind::Break => {
                self.advance();
                Ok(StmtLoc::new(span, Stmt::Break))
            }
            TokenKind::Continue => {
                self.advance();
                Ok(StmtLoc::new(span, Stmt::Continue))
            }
            TokenKind::Global => {
                self.advance();
                let names = self.parse_name_list()?;
                Ok(StmtLoc::new(span, Stmt::Global(names)))
            }
            TokenKind::Nonlocal => {
                self.advance();
                let names = self.parse_name_list()?;
                Ok(StmtLoc::new(span, Stmt::Nonlocal(names)))
            }
            TokenKind::Del => {
                self.advance();
                let mut targets = vec![self.parse_expression()?];
                while self.eat(TokenKind::Comma) {
                    targets.push(self.parse_expression()?);
                }
                Ok(StmtLoc::new(span, Stmt::Delete(targets)))
            }
            TokenKind::Import => self.parse_import(span),
            TokenKind::From => self.parse_import_from(span),
            _ => self.parse_expr_statement(span),
        }
    }

    fn statement_ends_here(&self) -> bool {
        matches!(
            self.tok.kind,
            TokenKind::Newline | TokenKind::Semicolon | TokenKind::Eof | TokenKind::Dedent
        )
    }

    fn parse_name_list(&mut self) -> PResult<Vec<StringId>> {
        let mut names = Vec::new();
        loop {
            let tok = self.expect(TokenKind::Identifier, "a name")?;
            names.push(tok.text().expect("identifier token carries its text"));
            if !self.eat(TokenKind::Comma) {
                break;
            }
        }
        Ok(names)
    }

    fn parse_dotted_path(&mut self) -> PResult<Vec<StringId>> {
        let mut path = Vec::new();
        loop {
            let tok = self.expect(TokenKind::Identifier, "a module name")?;
            path.push(tok.text().expect("identifier token carries its text"));
            if !self.eat(TokenKind::Dot) {
                break;
            }
        }
        Ok(path)
    }

    fn parse_import(&mut self, span: Span) -> PResult<StmtLoc> {
        self.advance();
        let mut names = Vec::new();
        loop {
            let path = self.parse_dotted_path()?;
            let asname = if self.eat(TokenKind::As) {
                Some(self.expect(TokenKind::Identifier, "an alias")?.text().expect("identifier"))
            } else {
                None
            };
            // `import a.b` binds `a`; `import a.b as c` binds `c`.
            let binding = NameRef::new(asname.unwrap_or(path[0]));
            names.push(ImportAlias { path, asname, binding });
            if !self.eat(TokenKind::Comma) {
                break;
            }
        }
        Ok(StmtLoc::new(span, Stmt::Import { names }))
    }

    fn parse_import_from(&mut self, span: Span) -> PResult<StmtLoc> {
        self.advance();
        let module = self.parse_dotted_path()?;
        self.expect(TokenKind::Import, "'import'")?;
        if self.is_op("*") {
            self.error("wildcard imports are not supported", self.tok.span);
            return Err(ParseAbort);
        }
        let parenthesized = self.eat(TokenKind::LParen);
        let mut names = Vec::new();
        loop {
            let name = self.expect(TokenKind::Identifier, "an imported name")?.text().expect("identifier");
            let asname = if self.eat(TokenKind::As) {
                Some(self.expect(TokenKind::Identifier, "an alias")?.text().expect("identifier"))
            } else {
                None
            };
            let binding = NameRef::new(asname.unwrap_or(name));
            names.push(ImportAlias {
                path: vec![name],
                asname,
                binding,
            });
            if !self.eat(TokenKind::Comma) {
                break;
            }
        }
        if parenthesized {
            self.expect(TokenKind::RParen, "')'")?;
        }
        Ok(StmtLoc::new(span, Stmt::ImportFrom { module, names }))
    }

    /// Expression statement, possibly a target of `=`, `op=`, or `:` annotation.
    fn parse_expr_statement(&mut self, span: Span) -> PResult<StmtLoc> {
        let first = self.parse_testlist()?;

        if self.at(TokenKind::Colon) {
            self.advance();
            self.check_assign_target(&first)?;
            let annotation = self.parse_expression()?;
            let value = if self.eat(TokenKind::Assign) {
                Some(Box::new(self.parse_testlist()?))
            } else {
                None
            };
            return Ok(StmtLoc::new(
                span,
                Stmt::AnnAssign {
                    target: Box::new(first),
                    annotation: Box::new(annotation),
                    value,
                },
            ));
        }

        if self.at(TokenKind::Assign) {
            let mut targets = vec![first];
            let mut value = None;
            while self.eat(TokenKind::Assign) {
                let next = self.parse_testlist()?;
                if let Some(prev) = value.replace(next) {
                    targets.push(prev);
                }
            }
            let value = value.expect("chained assignment always parses a value");
            for target in &targets {
                self.check_assign_target(target)?;
            }
            return Ok(StmtLoc::new(span, Stmt::Assign { targets, value }));
        }

        if let Some(spelling) = self.op_spelling() {
            if let Some(op) = precedence_table().get(spelling).and_then(|cfg| cfg.aug) {
                self.advance();
                self.check_assign_target(&first)?;
                let value = self.parse_testlist()?;
                return Ok(StmtLoc::new(
                    span,
                    Stmt::AugAssign {
                        target: Box::new(first),
                        op,
                        value: Box::new(value),
                        resolved: OpImpl::Unresolved,
                    },
                ));
            }
        }

        Ok(StmtLoc::new(span, Stmt::Expr(first)))
    }

    fn check_assign_target(&mut self, target: &ExprLoc) -> PResult<()> {
        let ok = match &target.expr {
            Expr::Name(_) | Expr::Attribute { .. } | Expr::Subscript { .. } | Expr::Starred(_) => true,
            Expr::TupleExpr(items) | Expr::ListExpr(items) => {
                for item in items {
                    self.check_assign_target(item)?;
                }
                true
            }
            _ => false,
        };
        if ok {
            Ok(())
        } else {
            self.error("invalid assignment target", target.span);
            Err(ParseAbort)
        }
    }

    // -- Definitions --

    fn parse_decorated(&mut self, span: Span) -> PResult<StmtLoc> {
        let mut decorators = Vec::new();
        while self.is_op("@") {
            self.advance();
            decorators.push(self.parse_expression()?);
            self.expect(TokenKind::Newline, "a newline after the decorator")?;
            while self.eat(TokenKind::Newline) {}
        }
        match self.tok.kind {
            TokenKind::Def => {
                let func = self.parse_function_def(false, decorators)?;
                Ok(StmtLoc::new(span, Stmt::FunctionDef(func)))
            }
            TokenKind::Async => {
                self.advance();
                if !self.at(TokenKind::Def) {
                    self.error("expected 'def' after 'async'", self.tok.span);
                    return Err(ParseAbort);
                }
                let func = self.parse_function_def(true, decorators)?;
                Ok(StmtLoc::new(span, Stmt::FunctionDef(func)))
            }
            TokenKind::Class => {
                let class = self.parse_class_def(decorators)?;
                Ok(StmtLoc::new(span, Stmt::ClassDef(class)))
            }
            _ => {
                self.error("decorators must be followed by a function or class", self.tok.span);
                Err(ParseAbort)
            }
        }
    }

    fn parse_function_def(&mut self, is_async: bool, decorators: Vec<ExprLoc>) -> PResult<FuncId> {
        let span = self.tok.span;
        self.advance(); // def
        let name = self.expect(TokenKind::Identifier, "a function name")?.text().expect("identifier");
        self.expect(TokenKind::LParen, "'('")?;
        let args = self.parse_parameter_list()?;
        self.expect(TokenKind::RParen, "')'")?;
        let returns = if self.eat(TokenKind::Arrow) {
            Some(self.parse_expression()?)
        } else {
            None
        };
        let (docstring, body) = self.parse_block_with_doc()?;
        let def = FunctionDef {
            name,
            span,
            args,
            body,
            returns,
            docstring,
            decorators,
            is_async,
            ..FunctionDef::default()
        };
        Ok(self.module.add_function(def))
    }

    /// Parameter list: positional, `/`, then keyword-only after `*`.
    fn parse_parameter_list(&mut self) -> PResult<Arguments> {
        let mut arguments = Arguments::default();
        let mut seen_star = false;
        loop {
            if self.at(TokenKind::RParen) {
                break;
            }
            if self.is_op("/") {
                self.advance();
                arguments.posonly_count = arguments.args.len();
            } else if self.is_op("**") {
                self.advance();
                arguments.kwarg = Some(self.parse_param()?);
            } else if self.is_op("*") {
                self.advance();
                seen_star = true;
                if self.at(TokenKind::Identifier) {
                    arguments.vararg = Some(self.parse_param()?);
                }
            } else {
                let param = self.parse_param()?;
                if seen_star {
                    arguments.kwonly_args.push(param);
                } else {
                    arguments.args.push(param);
                }
            }
            if !self.eat(TokenKind::Comma) {
                break;
            }
        }
        Ok(arguments)
    }

    fn parse_param(&mut self) -> PResult<Param> {
        let tok = self.expect(TokenKind::Identifier, "a parameter name")?;
        let mut param = Param {
            name: tok.text().expect("identifier token carries its text"),
            span: tok.span,
            annotation: None,
            default: None,
        };
        if self.eat(TokenKind::Colon) {
            param.annotation = Some(self.parse_expression()?);
        }
        if self.eat(TokenKind::Assign) {
            param.default = Some(self.parse_expression()?);
        }
        Ok(param)
    }

    fn parse_class_def(&mut self, decorators: Vec<ExprLoc>) -> PResult<ClassId> {
        let span = self.tok.span;
        self.advance(); // class
        let name = self.expect(TokenKind::Identifier, "a class name")?.text().expect("identifier");
        let mut bases = Vec::new();
        if self.eat(TokenKind::LParen) {
            while !self.at(TokenKind::RParen) {
                bases.push(self.parse_expression()?);
                if !self.eat(TokenKind::Comma) {
                    break;
                }
            }
            self.expect(TokenKind::RParen, "')'")?;
        }
        let (docstring, body) = self.parse_block_with_doc()?;

        let mut def = ClassDef {
            name,
            span,
            bases,
            docstring,
            decorators,
            ..ClassDef::default()
        };
        for stmt in body {
            self.classify_class_member(&mut def, stmt);
        }
        Ok(self.module.add_class(def))
    }

    /// Sorts a class-body statement into the attribute map, the method map,
    /// or the nested-class map.
    fn classify_class_member(&mut self, def: &mut ClassDef, stmt: StmtLoc) {
        let span = stmt.span;
        match stmt.stmt {
            Stmt::AnnAssign {
                target,
                annotation,
                value,
            } => {
                if let Expr::Name(name) = &target.expr {
                    def.attrs.insert(
                        name.name,
                        ClassAttr {
                            span,
                            annotation: Some(*annotation),
                            default: value.map(|v| *v),
                            ty: crate::types::Ty::Unknown,
                        },
                    );
                } else {
                    self.error("class attributes must be simple names", span);
                }
            }
            Stmt::Assign { targets, value } => {
                if let [target] = targets.as_slice() {
                    if let Expr::Name(name) = &target.expr {
                        def.attrs.insert(
                            name.name,
                            ClassAttr {
                                span,
                                annotation: None,
                                default: Some(value),
                                ty: crate::types::Ty::Unknown,
                            },
                        );
                        return;
                    }
                }
                self.error("class attributes must be simple names", span);
            }
            Stmt::FunctionDef(func) => {
                let name = self.module.func(func).name;
                def.methods.insert(name, func);
            }
            Stmt::ClassDef(class) => {
                let name = self.module.class(class).name;
                def.nested.insert(name, class);
            }
            Stmt::Pass => {}
            Stmt::Expr(ExprLoc {
                expr: Expr::Constant(ConstValue::Str(_)),
                ..
            }) => {}
            _ => {
                self.error("unsupported statement in class body", span);
            }
        }
    }

    // -- Compound statements --

    /// `: NEWLINE INDENT stmt+ DEDENT`, or a same-line suite.
    fn parse_block(&mut self) -> PResult<Vec<StmtLoc>> {
        let (_, body) = self.parse_block_inner(false)?;
        Ok(body)
    }

    fn parse_block_with_doc(&mut self) -> PResult<(Option<StringId>, Vec<StmtLoc>)> {
        self.parse_block_inner(true)
    }

    fn parse_block_inner(&mut self, allow_doc: bool) -> PResult<(Option<StringId>, Vec<StmtLoc>)> {
        self.expect(TokenKind::Colon, "':'")?;

        // Same-line suite: `if x: pass`.
        if !self.at(TokenKind::Newline) {
            let span = self.tok.span;
            let stmt = self.parse_simple_statement_line(span)?;
            return Ok((None, vec![stmt]));
        }

        self.advance();
        while self.eat(TokenKind::Newline) {}
        self.expect(TokenKind::Indent, "an indented block")?;

        let mut docstring = None;
        if allow_doc && self.at(TokenKind::Docstring) && self.peek().kind == TokenKind::Newline {
            docstring = self.tok.text();
            self.advance();
            self.advance();
        }

        let mut body = Vec::new();
        loop {
            while self.eat(TokenKind::Newline) {}
            if self.at(TokenKind::Dedent) || self.at(TokenKind::Eof) {
                break;
            }
            match self.parse_statement() {
                Ok(stmt) => body.push(stmt),
                Err(ParseAbort) => self.recover(),
            }
        }
        self.eat(TokenKind::Dedent);
        if body.is_empty() && docstring.is_none() {
            self.error("expected a non-empty block", self.tok.span);
            return Err(ParseAbort);
        }
        Ok((docstring, body))
    }

    fn parse_if(&mut self, span: Span) -> PResult<StmtLoc> {
        self.advance(); // if
        let mut tests = vec![self.parse_testlist()?];
        let mut bodies = vec![self.parse_block()?];
        let mut orelse = Vec::new();
        loop {
            while self.at(TokenKind::Newline) && matches!(self.peek().kind, TokenKind::Elif | TokenKind::Else) {
                self.advance();
            }
            if self.eat(TokenKind::Elif) {
                tests.push(self.parse_testlist()?);
                bodies.push(self.parse_block()?);
            } else if self.eat(TokenKind::Else) {
                orelse = self.parse_block()?;
                break;
            } else {
                break;
            }
        }
        Ok(StmtLoc::new(span, Stmt::If { tests, bodies, orelse }))
    }

    fn parse_while(&mut self, span: Span) -> PResult<StmtLoc> {
        self.advance();
        let test = self.parse_testlist()?;
        let body = self.parse_block()?;
        let orelse = if self.eat(TokenKind::Else) {
            self.parse_block()?
        } else {
            Vec::new()
        };
        Ok(StmtLoc::new(span, Stmt::While { test, body, orelse }))
    }

    fn parse_for(&mut self, span: Span) -> PResult<StmtLoc> {
        self.advance();
        // Targets are names/attributes/subscripts, never operators, so `in`
        // stays the loop keyword instead of a comparison.
        let target = self.parse_comp_target()?;
        self.expect(TokenKind::In, "'in'")?;
        let iter = self.parse_testlist()?;
        let body = self.parse_block()?;
        let orelse = if self.eat(TokenKind::Else) {
            self.parse_block()?
        } else {
            Vec::new()
        };
        Ok(StmtLoc::new(
            span,
            Stmt::For {
                target,
                iter,
                body,
                orelse,
            },
        ))
    }

    fn parse_try(&mut self, span: Span) -> PResult<StmtLoc> {
        self.advance();
        let body = self.parse_block()?;
        let mut handlers = Vec::new();
        while self.at(TokenKind::Except) {
            let handler_span = self.tok.span;
            self.advance();
            let exc_type = if self.at(TokenKind::Colon) {
                None
            } else {
                Some(self.parse_expression()?)
            };
            let name = if self.eat(TokenKind::As) {
                let tok = self.expect(TokenKind::Identifier, "a name")?;
                Some(NameRef::new(tok.text().expect("identifier")))
            } else {
                None
            };
            let handler_body = self.parse_block()?;
            handlers.push(ExceptHandler {
                span: handler_span,
                exc_type,
                name,
                body: handler_body,
            });
        }
        let orelse = if self.eat(TokenKind::Else) {
            self.parse_block()?
        } else {
            Vec::new()
        };
        let finalbody = if self.eat(TokenKind::Finally) {
            self.parse_block()?
        } else {
            Vec::new()
        };
        if handlers.is_empty() && finalbody.is_empty() {
            self.error("a try statement needs an except or finally clause", span);
            return Err(ParseAbort);
        }
        Ok(StmtLoc::new(
            span,
            Stmt::Try {
                body,
                handlers,
                orelse,
                finalbody,
            },
        ))
    }

    fn parse_with(&mut self, span: Span) -> PResult<StmtLoc> {
        self.advance();
        let mut items = Vec::new();
        loop {
            let context_expr = self.parse_expression()?;
            let optional_vars = if self.eat(TokenKind::As) {
                let tok = self.expect(TokenKind::Identifier, "a name")?;
                Some(NameRef::new(tok.text().expect("identifier")))
            } else {
                None
            };
            items.push(WithItem {
                context_expr,
                optional_vars,
            });
            if !self.eat(TokenKind::Comma) {
                break;
            }
        }
        let body = self.parse_block()?;
        Ok(StmtLoc::new(span, Stmt::With { items, body }))
    }

    fn parse_match(&mut self, span: Span) -> PResult<StmtLoc> {
        self.advance();
        let subject = self.parse_testlist()?;
        self.expect(TokenKind::Colon, "':'")?;
        self.expect(TokenKind::Newline, "a newline")?;
        while self.eat(TokenKind::Newline) {}
        self.expect(TokenKind::Indent, "an indented block")?;
        let mut cases = Vec::new();
        loop {
            while self.eat(TokenKind::Newline) {}
            if self.at(TokenKind::Dedent) || self.at(TokenKind::Eof) {
                break;
            }
            self.expect(TokenKind::Case, "'case'")?;
            let pattern = self.parse_pattern()?;
            let guard = if self.eat(TokenKind::If) {
                Some(self.parse_expression()?)
            } else {
                None
            };
            let body = self.parse_block()?;
            cases.push(MatchCase { pattern, guard, body });
        }
        self.eat(TokenKind::Dedent);
        if cases.is_empty() {
            self.error("a match statement needs at least one case", span);
            return Err(ParseAbort);
        }
        Ok(StmtLoc::new(span, Stmt::Match { subject, cases }))
    }

    // -- Patterns --

    fn parse_pattern(&mut self) -> PResult<PatternLoc> {
        let span = self.tok.span;
        self.enter(span)?;
        let result = self.parse_pattern_inner(span);
        self.leave();
        result
    }

    fn parse_pattern_inner(&mut self, span: Span) -> PResult<PatternLoc> {
        let first = self.parse_as_pattern()?;
        if !self.is_op("|") {
            return Ok(first);
        }
        let mut alternatives = vec![first];
        while self.is_op("|") {
            self.advance();
            alternatives.push(self.parse_as_pattern()?);
        }
        Ok(PatternLoc {
            span,
            pattern: Pattern::MatchOr(alternatives),
        })
    }

    fn parse_as_pattern(&mut self) -> PResult<PatternLoc> {
        let span = self.tok.span;
        let pattern = self.parse_closed_pattern()?;
        if self.eat(TokenKind::As) {
            let tok = self.expect(TokenKind::Identifier, "a capture name")?;
            return Ok(PatternLoc {
                span,
                pattern: Pattern::MatchAs {
                    pattern: Some(Box::new(pattern)),
                    name: Some(NameRef::new(tok.text().expect("identifier"))),
                },
            });
        }
        Ok(pattern)
    }

    fn parse_closed_pattern(&mut self) -> PResult<PatternLoc> {
        let span = self.tok.span;
        match self.tok.kind {
            TokenKind::NoneKw => {
                self.advance();
                Ok(PatternLoc {
                    span,
                    pattern: Pattern::MatchSingleton(ConstValue::None),
                })
            }
            TokenKind::True => {
                self.advance();
                Ok(PatternLoc {
                    span,
                    pattern: Pattern::MatchSingleton(ConstValue::Bool(true)),
                })
            }
            TokenKind::False => {
                self.advance();
                Ok(PatternLoc {
                    span,
                    pattern: Pattern::MatchSingleton(ConstValue::Bool(false)),
                })
            }
            TokenKind::Int | TokenKind::Float | TokenKind::Str => {
                let value = self.parse_literal()?;
                Ok(PatternLoc {
                    span,
                    pattern: Pattern::MatchValue(value),
                })
            }
            TokenKind::Operator if self.is_op("-") => {
                let value = self.parse_expr_prec(UNARY_PRECEDENCE)?;
                Ok(PatternLoc {
                    span,
                    pattern: Pattern::MatchValue(value),
                })
            }
            TokenKind::Operator if self.is_op("*") => {
                self.advance();
                let tok = self.expect(TokenKind::Identifier, "a name after '*'")?;
                let name = tok.text().expect("identifier");
                let name = if self.interner.get(name) == "_" {
                    None
                } else {
                    Some(NameRef::new(name))
                };
                Ok(PatternLoc {
                    span,
                    pattern: Pattern::MatchStar(name),
                })
            }
            TokenKind::Identifier => {
                let name = self.tok.text().expect("identifier");
                if self.interner.get(name) == "_" {
                    self.advance();
                    return Ok(PatternLoc {
                        span,
                        pattern: Pattern::MatchAs {
                            pattern: None,
                            name: None,
                        },
                    });
                }
                let next = self.peek().kind;
                if next == TokenKind::Dot {
                    // Dotted value pattern: compares by equality.
                    let value = self.parse_dotted_value(span)?;
                    return Ok(PatternLoc {
                        span,
                        pattern: Pattern::MatchValue(value),
                    });
                }
                if next == TokenKind::LParen {
                    return self.parse_class_pattern(span);
                }
                self.advance();
                Ok(PatternLoc {
                    span,
                    pattern: Pattern::MatchAs {
                        pattern: None,
                        name: Some(NameRef::new(name)),
                    },
                })
            }
            TokenKind::LParen | TokenKind::LBracket => {
                let close = if self.tok.kind == TokenKind::LParen {
                    TokenKind::RParen
                } else {
                    TokenKind::RBracket
                };
                self.advance();
                let mut patterns = Vec::new();
                while !self.at(close) {
                    patterns.push(self.parse_pattern()?);
                    if !self.eat(TokenKind::Comma) {
                        break;
                    }
                }
                self.expect(close, "a closing bracket")?;
                Ok(PatternLoc {
                    span,
                    pattern: Pattern::MatchSequence(patterns),
                })
            }
            TokenKind::LBrace => {
                self.advance();
                let mut keys = Vec::new();
                let mut patterns = Vec::new();
                let mut rest = None;
                while !self.at(TokenKind::RBrace) {
                    if self.is_op("**") {
                        self.advance();
                        let tok = self.expect(TokenKind::Identifier, "a name after '**'")?;
                        rest = Some(NameRef::new(tok.text().expect("identifier")));
                    } else {
                        keys.push(self.parse_literal()?);
                        self.expect(TokenKind::Colon, "':'")?;
                        patterns.push(self.parse_pattern()?);
                    }
                    if !self.eat(TokenKind::Comma) {
                        break;
                    }
                }
                self.expect(TokenKind::RBrace, "'}'")?;
                Ok(PatternLoc {
                    span,
                    pattern: Pattern::MatchMapping { keys, patterns, rest },
                })
            }
            _ => {
                let found: &'static str = self.tok.kind.into();
                self.error(format!("expected a pattern, found {found}"), span);
                Err(ParseAbort)
            }
        }
    }

    fn parse_literal(&mut self) -> PResult<ExprLoc> {
        let span = self.tok.span;
        let value = match self.tok.kind {
            TokenKind::Int => ConstValue::Int(self.tok.as_int()),
            TokenKind::Float => ConstValue::Float(self.tok.as_float()),
            TokenKind::Str => ConstValue::Str(self.tok.text().expect("string token carries its text")),
            _ => {
                self.error("expected a literal", span);
                return Err(ParseAbort);
            }
        };
        self.advance();
        Ok(ExprLoc::constant(span, value))
    }

    fn parse_dotted_value(&mut self, span: Span) -> PResult<ExprLoc> {
        let name = self.advance().text().expect("identifier");
        let mut value = ExprLoc::new(span, Expr::Name(NameRef::new(name)));
        while self.eat(TokenKind::Dot) {
            let attr = self.expect(TokenKind::Identifier, "an attribute name")?.text().expect("identifier");
            value = ExprLoc::new(
                span,
                Expr::Attribute {
                    value: Box::new(value),
                    attr,
                },
            );
        }
        Ok(value)
    }

    fn parse_class_pattern(&mut self, span: Span) -> PResult<PatternLoc> {
        let cls = self.parse_dotted_value(span)?;
        self.expect(TokenKind::LParen, "'('")?;
        let mut patterns = Vec::new();
        let mut kwd_attrs = Vec::new();
        let mut kwd_patterns = Vec::new();
        while !self.at(TokenKind::RParen) {
            if self.at(TokenKind::Identifier) && self.peek().kind == TokenKind::Assign {
                let attr = self.advance().text().expect("identifier");
                self.advance(); // =
                kwd_attrs.push(attr);
                kwd_patterns.push(self.parse_pattern()?);
            } else {
                patterns.push(self.parse_pattern()?);
            }
            if !self.eat(TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RParen, "')'")?;
        Ok(PatternLoc {
            span,
            pattern: Pattern::MatchClass {
                cls: Box::new(cls),
                patterns,
                kwd_attrs,
                kwd_patterns,
            },
        })
    }

    // -- Expressions --

    /// Expression list: `a, b, c` folds into a tuple.
    fn parse_testlist(&mut self) -> PResult<ExprLoc> {
        let span = self.tok.span;
        let first = self.parse_expression()?;
        if !self.at(TokenKind::Comma) {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat(TokenKind::Comma) {
            if self.expression_cannot_start() {
                break;
            }
            items.push(self.parse_expression()?);
        }
        Ok(ExprLoc::new(span, Expr::TupleExpr(items)))
    }

    fn expression_cannot_start(&self) -> bool {
        matches!(
            self.tok.kind,
            TokenKind::Newline
                | TokenKind::Eof
                | TokenKind::Dedent
                | TokenKind::Assign
                | TokenKind::Colon
                | TokenKind::RParen
                | TokenKind::RBracket
                | TokenKind::RBrace
                | TokenKind::Semicolon
                | TokenKind::In
        )
    }

    fn parse_expression(&mut self) -> PResult<ExprLoc> {
        self.parse_expr_prec(0)
    }

    /// Precedence climbing: parse a primary, then fold in operators whose
    /// precedence is at least `min_prec`.
    fn parse_expr_prec(&mut self, min_prec: i8) -> PResult<ExprLoc> {
        let span = self.tok.span;
        self.enter(span)?;
        let result = self.parse_expr_prec_inner(min_prec, span);
        self.leave();
        result
    }

    fn parse_expr_prec_inner(&mut self, min_prec: i8, span: Span) -> PResult<ExprLoc> {
        if self.at(TokenKind::Lambda) {
            return self.parse_lambda(span);
        }
        if self.at(TokenKind::Yield) {
            return self.parse_yield(span);
        }

        let mut lhs = self.parse_unary(min_prec)?;

        loop {
            let Some((spelling, cfg, extra_token)) = self.infix_operator() else {
                break;
            };
            if cfg.precedence < min_prec {
                break;
            }
            if cfg.cmp.is_some() {
                lhs = self.parse_comparison_chain(lhs, span)?;
                continue;
            }
            if let Some(bool_op) = cfg.boolean {
                self.advance();
                let rhs = self.parse_expr_prec(cfg.precedence + 1)?;
                lhs = match lhs.expr {
                    Expr::BoolOp { op, mut values, resolved } if op == bool_op => {
                        values.push(rhs);
                        ExprLoc::new(span, Expr::BoolOp { op, values, resolved })
                    }
                    _ => ExprLoc::new(
                        span,
                        Expr::BoolOp {
                            op: bool_op,
                            values: vec![lhs, rhs],
                            resolved: OpImpl::Unresolved,
                        },
                    ),
                };
                continue;
            }
            if let Some(bin_op) = cfg.binary {
                debug_assert!(extra_token == 0, "binary operators are single tokens: {spelling}");
                self.advance();
                let next_min = if cfg.left_associative {
                    cfg.precedence + 1
                } else {
                    cfg.precedence
                };
                let rhs = self.parse_expr_prec(next_min)?;
                lhs = ExprLoc::new(
                    span,
                    Expr::BinOp {
                        left: Box::new(lhs),
                        op: bin_op,
                        right: Box::new(rhs),
                        resolved: OpImpl::Unresolved,
                    },
                );
                continue;
            }
            break;
        }

        // Walrus and ternary sit below every operator; only at top level.
        if min_prec == 0 {
            if self.at(TokenKind::Walrus) {
                if let Expr::Name(target) = &lhs.expr {
                    let target = *target;
                    self.advance();
                    let value = self.parse_expression()?;
                    return Ok(ExprLoc::new(
                        span,
                        Expr::NamedExpr {
                            target,
                            value: Box::new(value),
                        },
                    ));
                }
                self.error("walrus target must be a name", lhs.span);
                return Err(ParseAbort);
            }
            if self.at(TokenKind::If) {
                self.advance();
                let test = self.parse_expr_prec(1)?;
                self.expect(TokenKind::Else, "'else'")?;
                let orelse = self.parse_expression()?;
                return Ok(ExprLoc::new(
                    span,
                    Expr::IfExp {
                        test: Box::new(test),
                        body: Box::new(lhs),
                        orelse: Box::new(orelse),
                    },
                ));
            }
        }

        Ok(lhs)
    }

    /// Resolves the current token (plus one of lookahead for `is not` /
    /// `not in`) to an operator-table row. The third field is the number of
    /// extra tokens the spelling consumed.
    fn infix_operator(&mut self) -> Option<(&'static str, OpConfig, u8)> {
        let spelling = self.op_spelling()?;
        let table = precedence_table();
        match spelling {
            "is" if self.peek().kind == TokenKind::Not => Some(("is not", table["is not"], 1)),
            "not" => {
                if self.peek().kind == TokenKind::In {
                    Some(("not in", table["not in"], 1))
                } else {
                    // Prefix-only in infix position.
                    None
                }
            }
            _ => table
                .get_key_value(spelling)
                .map(|(k, cfg)| (*k, *cfg))
                .filter(|(_, cfg)| cfg.binary.is_some() || cfg.boolean.is_some() || cfg.cmp.is_some())
                .map(|(k, cfg)| (k, cfg, 0)),
        }
    }

    /// Collects `a < b <= c` into one Compare node with parallel vectors.
    fn parse_comparison_chain(&mut self, left: ExprLoc, span: Span) -> PResult<ExprLoc> {
        let mut ops = Vec::new();
        let mut comparators = Vec::new();
        loop {
            let Some((_, cfg, extra)) = self.infix_operator() else {
                break;
            };
            let Some(cmp) = cfg.cmp else { break };
            self.advance();
            for _ in 0..extra {
                self.advance();
            }
            ops.push(cmp);
            comparators.push(self.parse_expr_prec(cfg.precedence + 1)?);
        }
        let resolved = vec![OpImpl::Unresolved; ops.len()];
        Ok(ExprLoc::new(
            span,
            Expr::Compare {
                left: Box::new(left),
                ops,
                comparators,
                resolved,
            },
        ))
    }

    /// Prefix operators bind at unary precedence; the operand includes any
    /// tighter-binding operators (`-a ** b` is `-(a ** b)`).
    fn parse_unary(&mut self, min_prec: i8) -> PResult<ExprLoc> {
        let span = self.tok.span;
        if self.at(TokenKind::Await) {
            self.advance();
            let operand = self.parse_expr_prec(UNARY_PRECEDENCE)?;
            return Ok(ExprLoc::new(span, Expr::Await(Box::new(operand))));
        }
        if let Some(spelling) = self.op_spelling() {
            if let Some(cfg) = precedence_table().get(spelling) {
                if let Some(op) = cfg.unary {
                    // `*expr` is unpacking, not an operator.
                    if spelling != "*" {
                        let unary_prec = if op == crate::ops::UnaryOpKind::Not {
                            cfg.precedence
                        } else {
                            UNARY_PRECEDENCE
                        };
                        self.advance();
                        let operand = self.parse_expr_prec(unary_prec)?;
                        return Ok(ExprLoc::new(
                            span,
                            Expr::UnaryOp {
                                op,
                                operand: Box::new(operand),
                                resolved: OpImpl::Unresolved,
                            },
                        ));
                    }
                }
            }
        }
        self.parse_postfix()
    }

    /// Postfix chain: calls, subscripts, attribute access.
    fn parse_postfix(&mut self) -> PResult<ExprLoc> {
        let mut value = self.parse_primary()?;
        loop {
            let span = self.tok.span;
            match self.tok.kind {
                TokenKind::LParen => {
                    self.advance();
                    let (args, keywords) = self.parse_call_args()?;
                    value = ExprLoc::new(
                        value.span,
                        Expr::Call {
                            func: Box::new(value),
                            args,
                            keywords,
                        },
                    );
                }
                TokenKind::LBracket => {
                    self.advance();
                    let index = self.parse_subscript_index()?;
                    self.expect(TokenKind::RBracket, "']'")?;
                    value = ExprLoc::new(
                        value.span,
                        Expr::Subscript {
                            value: Box::new(value),
                            index: Box::new(index),
                        },
                    );
                }
                TokenKind::Dot => {
                    self.advance();
                    let attr = self.expect(TokenKind::Identifier, "an attribute name")?;
                    value = ExprLoc::new(
                        span,
                        Expr::Attribute {
                            value: Box::new(value),
                            attr: attr.text().expect("identifier token carries its text"),
                        },
                    );
                }
                _ => break,
            }
        }
        Ok(value)
    }

    fn parse_call_args(&mut self) -> PResult<(Vec<ExprLoc>, Vec<CallKeyword>)> {
        let mut args = Vec::new();
        let mut keywords = Vec::new();
        while !self.at(TokenKind::RParen) {
            if self.at(TokenKind::Identifier) && self.peek().kind == TokenKind::Assign {
                let name = self.advance().text().expect("identifier");
                self.advance(); // =
                let value = self.parse_expression()?;
                keywords.push(CallKeyword { name, value });
            } else if self.is_op("*") {
                let span = self.tok.span;
                self.advance();
                let value = self.parse_expression()?;
                args.push(ExprLoc::new(span, Expr::Starred(Box::new(value))));
            } else if self.is_op("**") {
                self.error("'**' unpacking in calls is not supported", self.tok.span);
                return Err(ParseAbort);
            } else {
                if !keywords.is_empty() {
                    self.error("positional argument after keyword argument", self.tok.span);
                }
                args.push(self.parse_expression()?);
            }
            if !self.eat(TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RParen, "')'")?;
        Ok((args, keywords))
    }

    fn parse_subscript_index(&mut self) -> PResult<ExprLoc> {
        let span = self.tok.span;
        let lower = if self.at(TokenKind::Colon) {
            None
        } else {
            Some(Box::new(self.parse_expression()?))
        };
        if !self.at(TokenKind::Colon) {
            return Ok(*lower.expect("non-slice subscript has an index expression"));
        }
        self.advance();
        let upper = if self.at(TokenKind::Colon) || self.at(TokenKind::RBracket) {
            None
        } else {
            Some(Box::new(self.parse_expression()?))
        };
        let step = if self.eat(TokenKind::Colon) {
            if self.at(TokenKind::RBracket) {
                None
            } else {
                Some(Box::new(self.parse_expression()?))
            }
        } else {
            None
        };
        Ok(ExprLoc::new(span, Expr::Slice { lower, upper, step }))
    }

    fn parse_lambda(&mut self, span: Span) -> PResult<ExprLoc> {
        self.advance(); // lambda
        let mut args = Arguments::default();
        while self.at(TokenKind::Identifier) {
            args.args.push(self.parse_param()?);
            if !self.eat(TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::Colon, "':'")?;
        let body = self.parse_expression()?;
        let body_span = body.span;
        let def = FunctionDef {
            name: StaticStr::Lambda.id(),
            span,
            args,
            body: vec![StmtLoc::new(body_span, Stmt::Return(Some(body)))],
            ..FunctionDef::default()
        };
        let func = self.module.add_function(def);
        Ok(ExprLoc::new(span, Expr::Lambda(func)))
    }

    fn parse_yield(&mut self, span: Span) -> PResult<ExprLoc> {
        self.advance(); // yield
        if self.eat(TokenKind::From) {
            let value = self.parse_expression()?;
            return Ok(ExprLoc::new(span, Expr::YieldFrom(Box::new(value))));
        }
        if self.statement_ends_here() || self.at(TokenKind::RParen) {
            return Ok(ExprLoc::new(span, Expr::Yield(None)));
        }
        let value = self.parse_testlist()?;
        Ok(ExprLoc::new(span, Expr::Yield(Some(Box::new(value)))))
    }

    fn parse_primary(&mut self) -> PResult<ExprLoc> {
        let span = self.tok.span;
        match self.tok.kind {
            TokenKind::Int => {
                let v = self.advance().as_int();
                Ok(ExprLoc::constant(span, ConstValue::Int(v)))
            }
            TokenKind::Float => {
                let v = self.advance().as_float();
                Ok(ExprLoc::constant(span, ConstValue::Float(v)))
            }
            TokenKind::Str | TokenKind::Docstring => {
                let id = self.advance().text().expect("string token carries its text");
                Ok(ExprLoc::constant(span, ConstValue::Str(id)))
            }
            TokenKind::FStrStart => self.parse_fstring(span),
            TokenKind::True => {
                self.advance();
                Ok(ExprLoc::constant(span, ConstValue::Bool(true)))
            }
            TokenKind::False => {
                self.advance();
                Ok(ExprLoc::constant(span, ConstValue::Bool(false)))
            }
            TokenKind::NoneKw => {
                self.advance();
                Ok(ExprLoc::constant(span, ConstValue::None))
            }
            TokenKind::Identifier => {
                let name = self.advance().text().expect("identifier token carries its text");
                Ok(ExprLoc::new(span, Expr::Name(NameRef::new(name))))
            }
            TokenKind::LParen => self.parse_paren(span),
            TokenKind::LBracket => self.parse_list(span),
            TokenKind::LBrace => self.parse_braced(span),
            TokenKind::Operator if self.is_op("*") => {
                self.advance();
                let value = self.parse_expr_prec(UNARY_PRECEDENCE)?;
                Ok(ExprLoc::new(span, Expr::Starred(Box::new(value))))
            }
            TokenKind::Incorrect => {
                self.advance();
                Err(ParseAbort)
            }
            _ => {
                let found: &'static str = self.tok.kind.into();
                self.error(format!("expected an expression, found {found}"), span);
                Err(ParseAbort)
            }
        }
    }

    fn parse_fstring(&mut self, span: Span) -> PResult<ExprLoc> {
        self.advance(); // FStrStart
        let mut parts = Vec::new();
        loop {
            match self.tok.kind {
                TokenKind::FStrMiddle => {
                    let id = self.advance().text().expect("f-string chunk carries its text");
                    parts.push(ExprLoc::constant(span, ConstValue::Str(id)));
                }
                TokenKind::LBrace => {
                    self.advance();
                    let value = self.parse_testlist()?;
                    let format_spec = if self.at(TokenKind::Str) {
                        self.advance().text()
                    } else {
                        None
                    };
                    self.expect(TokenKind::RBrace, "'}'")?;
                    parts.push(ExprLoc::new(
                        span,
                        Expr::FormattedValue {
                            value: Box::new(value),
                            format_spec,
                        },
                    ));
                }
                TokenKind::FStrEnd => {
                    self.advance();
                    break;
                }
                _ => {
                    self.error("unterminated f-string", span);
                    return Err(ParseAbort);
                }
            }
        }
        Ok(ExprLoc::new(span, Expr::JoinedStr(parts)))
    }

    fn parse_paren(&mut self, span: Span) -> PResult<ExprLoc> {
        self.advance(); // (
        if self.eat(TokenKind::RParen) {
            return Ok(ExprLoc::new(span, Expr::TupleExpr(Vec::new())));
        }
        let first = self.parse_expression()?;
        if self.at(TokenKind::For) {
            let generators = self.parse_comp_generators()?;
            self.expect(TokenKind::RParen, "')'")?;
            return Ok(ExprLoc::new(
                span,
                Expr::GeneratorExp {
                    elt: Box::new(first),
                    generators,
                },
            ));
        }
        if self.at(TokenKind::Comma) {
            let mut items = vec![first];
            while self.eat(TokenKind::Comma) {
                if self.at(TokenKind::RParen) {
                    break;
                }
                items.push(self.parse_expression()?);
            }
            self.expect(TokenKind::RParen, "')'")?;
            if self.at(TokenKind::Arrow) {
                return self.parse_arrow_tail(span, items);
            }
            return Ok(ExprLoc::new(span, Expr::TupleExpr(items)));
        }
        self.expect(TokenKind::RParen, "')'")?;
        // Arrow type: `(i32) -> i32`, used in annotations.
        if self.at(TokenKind::Arrow) {
            return self.parse_arrow_tail(span, vec![first]);
        }
        Ok(first)
    }

    fn parse_arrow_tail(&mut self, span: Span, params: Vec<ExprLoc>) -> PResult<ExprLoc> {
        self.advance(); // ->
        let ret = self.parse_expression()?;
        Ok(ExprLoc::new(
            span,
            Expr::Arrow {
                params,
                ret: Box::new(ret),
            },
        ))
    }

    fn parse_list(&mut self, span: Span) -> PResult<ExprLoc> {
        self.advance(); // [
        if self.eat(TokenKind::RBracket) {
            return Ok(ExprLoc::new(span, Expr::ListExpr(Vec::new())));
        }
        let first = self.parse_expression()?;
        if self.at(TokenKind::For) {
            let generators = self.parse_comp_generators()?;
            self.expect(TokenKind::RBracket, "']'")?;
            return Ok(ExprLoc::new(
                span,
                Expr::ListComp {
                    elt: Box::new(first),
                    generators,
                },
            ));
        }
        let mut items = vec![first];
        while self.eat(TokenKind::Comma) {
            if self.at(TokenKind::RBracket) {
                break;
            }
            items.push(self.parse_expression()?);
        }
        self.expect(TokenKind::RBracket, "']'")?;
        Ok(ExprLoc::new(span, Expr::ListExpr(items)))
    }

    fn parse_braced(&mut self, span: Span) -> PResult<ExprLoc> {
        self.advance(); // {
        if self.eat(TokenKind::RBrace) {
            return Ok(ExprLoc::new(
                span,
                Expr::DictExpr {
                    keys: Vec::new(),
                    values: Vec::new(),
                },
            ));
        }
        let first = self.parse_expression()?;
        if self.eat(TokenKind::Colon) {
            let first_value = self.parse_expression()?;
            if self.at(TokenKind::For) {
                let generators = self.parse_comp_generators()?;
                self.expect(TokenKind::RBrace, "'}'")?;
                return Ok(ExprLoc::new(
                    span,
                    Expr::DictComp {
                        key: Box::new(first),
                        value: Box::new(first_value),
                        generators,
                    },
                ));
            }
            let mut keys = vec![first];
            let mut values = vec![first_value];
            while self.eat(TokenKind::Comma) {
                if self.at(TokenKind::RBrace) {
                    break;
                }
                keys.push(self.parse_expression()?);
                self.expect(TokenKind::Colon, "':'")?;
                values.push(self.parse_expression()?);
            }
            self.expect(TokenKind::RBrace, "'}'")?;
            return Ok(ExprLoc::new(span, Expr::DictExpr { keys, values }));
        }
        if self.at(TokenKind::For) {
            let generators = self.parse_comp_generators()?;
            self.expect(TokenKind::RBrace, "'}'")?;
            return Ok(ExprLoc::new(
                span,
                Expr::SetComp {
                    elt: Box::new(first),
                    generators,
                },
            ));
        }
        let mut items = vec![first];
        while self.eat(TokenKind::Comma) {
            if self.at(TokenKind::RBrace) {
                break;
            }
            items.push(self.parse_expression()?);
        }
        self.expect(TokenKind::RBrace, "'}'")?;
        Ok(ExprLoc::new(span, Expr::SetExpr(items)))
    }

    fn parse_comp_generators(&mut self) -> PResult<Vec<Comprehension>> {
        let mut generators = Vec::new();
        while self.at(TokenKind::For) {
            self.advance();
            let target = self.parse_comp_target()?;
            self.expect(TokenKind::In, "'in'")?;
            // The iterable stops before `if`/`for`; precedence 1 disables
            // the ternary.
            let iter = self.parse_expr_prec(1)?;
            let mut ifs = Vec::new();
            while self.at(TokenKind::If) {
                self.advance();
                ifs.push(self.parse_expr_prec(1)?);
            }
            generators.push(Comprehension { target, iter, ifs });
        }
        Ok(generators)
    }

    fn parse_comp_target(&mut self) -> PResult<ExprLoc> {
        let span = self.tok.span;
        let first = self.parse_postfix()?;
        self.check_assign_target(&first)?;
        if !self.at(TokenKind::Comma) {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat(TokenKind::Comma) {
            if self.at(TokenKind::In) {
                break;
            }
            let item = self.parse_postfix()?;
            self.check_assign_target(&item)?;
            items.push(item);
        }
        Ok(ExprLoc::new(span, Expr::TupleExpr(items)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(source: &str) -> Module {
        let mut interner = Interner::new();
        let (module, diagnostics) = parse_module(source, &mut interner);
        assert!(diagnostics.is_empty(), "unexpected diagnostics: {diagnostics:?}");
        module
    }

    fn parse_errors(source: &str) -> Vec<Diagnostic> {
        let mut interner = Interner::new();
        let (_, diagnostics) = parse_module(source, &mut interner);
        diagnostics
    }

    #[test]
    fn precedence_groups_multiplication_tighter() {
        let module = parse_ok("a = 3 + 2 * 4\n");
        let Stmt::Assign { value, .. } = &module.body[0].stmt else {
            panic!("expected assignment");
        };
        let Expr::BinOp { op, right, .. } = &value.expr else {
            panic!("expected binop");
        };
        assert_eq!(*op, crate::ops::BinOpKind::Add);
        assert!(matches!(
            right.expr,
            Expr::BinOp {
                op: crate::ops::BinOpKind::Mult,
                ..
            }
        ));
    }

    #[test]
    fn power_is_right_associative() {
        let module = parse_ok("a = 2 ** 3 ** 2\n");
        let Stmt::Assign { value, .. } = &module.body[0].stmt else {
            panic!("expected assignment");
        };
        let Expr::BinOp { left, right, .. } = &value.expr else {
            panic!("expected binop");
        };
        assert!(left.is_constant());
        assert!(matches!(
            right.expr,
            Expr::BinOp {
                op: crate::ops::BinOpKind::Pow,
                ..
            }
        ));
    }

    #[test]
    fn chained_comparison_collapses_into_one_node() {
        let module = parse_ok("x = a < b < c\n");
        let Stmt::Assign { value, .. } = &module.body[0].stmt else {
            panic!("expected assignment");
        };
        let Expr::Compare { ops, comparators, .. } = &value.expr else {
            panic!("expected comparison, got {value:?}");
        };
        assert_eq!(ops.len(), 2);
        assert_eq!(comparators.len(), 2);
    }

    #[test]
    fn elif_chain_is_canonicalized() {
        let module = parse_ok("if a:\n    x = 1\nelif b:\n    x = 2\nelif c:\n    x = 3\nelse:\n    x = 4\n");
        let Stmt::If { tests, bodies, orelse } = &module.body[0].stmt else {
            panic!("expected if");
        };
        assert_eq!(tests.len(), 3);
        assert_eq!(bodies.len(), 3);
        assert_eq!(orelse.len(), 1);
    }

    #[test]
    fn function_docstring_is_absorbed() {
        let module = parse_ok("def f():\n    \"\"\"adds\"\"\"\n    return 1\n");
        let func = module.func(FuncId(0));
        assert!(func.docstring.is_some());
        assert_eq!(func.body.len(), 1);
    }

    #[test]
    fn parameters_support_defaults_and_kinds() {
        let module = parse_ok("def f(a, b: i64 = 2, *rest, c: i64 = 3):\n    pass\n");
        let func = module.func(FuncId(0));
        assert_eq!(func.args.args.len(), 2);
        assert!(func.args.vararg.is_some());
        assert_eq!(func.args.kwonly_args.len(), 1);
        assert!(func.args.args[1].default.is_some());
    }

    #[test]
    fn class_attrs_keep_declaration_order() {
        let mut interner = Interner::new();
        let (module, diagnostics) =
            parse_module("class P:\n    x: i64\n    y: i64\n    def area(self):\n        return 0\n", &mut interner);
        assert!(diagnostics.is_empty());
        let class = module.class(ClassId(0));
        let names: Vec<_> = class.attrs.keys().map(|id| interner.get(*id).to_owned()).collect();
        assert_eq!(names, vec!["x", "y"]);
        assert_eq!(class.methods.len(), 1);
    }

    #[test]
    fn errors_are_collected_without_stopping() {
        let diagnostics = parse_errors("x = = 1\ny = 2 +\nz = 3\n");
        assert!(diagnostics.len() >= 2);
    }

    #[test]
    fn match_with_guard_and_or_pattern() {
        let module = parse_ok("match x:\n    case 1 | 2:\n        pass\n    case n if n > 3:\n        pass\n");
        let Stmt::Match { cases, .. } = &module.body[0].stmt else {
            panic!("expected match");
        };
        assert_eq!(cases.len(), 2);
        assert!(matches!(cases[0].pattern.pattern, Pattern::MatchOr(_)));
        assert!(cases[1].guard.is_some());
    }

    #[test]
    fn ternary_and_walrus_parse() {
        parse_ok("y = (x := 3)\nz = 1 if y else 2\n");
    }

    #[test]
    fn comprehension_with_condition() {
        let module = parse_ok("xs = [x * x for x in items if x > 0]\n");
        let Stmt::Assign { value, .. } = &module.body[0].stmt else {
            panic!("expected assignment");
        };
        let Expr::ListComp { generators, .. } = &value.expr else {
            panic!("expected list comp");
        };
        assert_eq!(generators.len(), 1);
        assert_eq!(generators[0].ifs.len(), 1);
    }
}
