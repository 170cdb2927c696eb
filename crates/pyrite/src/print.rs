//! Deterministic pretty-printer.
//!
//! Reproduces source-equivalent text from the AST: four-space indentation,
//! one space around binary operators, and parentheses exactly where
//! precedence demands them — a child operand is parenthesized iff its
//! precedence is strictly below its parent's context.

use std::fmt::Write as _;

use crate::ast::{
    CallKeyword, ClassId, Comprehension, ConstValue, ExceptHandler, Expr, ExprLoc, FuncId, ImportAlias, MatchCase,
    Module, NameRef, OpImpl, Param, Pattern, PatternLoc, StmtLoc, WithItem,
};
use crate::intern::{Interner, StringId};
use crate::ops::{precedence_table, BinOpKind, BoolOpKind, CmpOpKind, UnaryOpKind, UNARY_PRECEDENCE};
use crate::token::Span;
use crate::value::format_float;
use crate::visit::TreeVisitor;

/// Lowest context: never parenthesizes.
const PREC_NONE: i8 = 0;
/// Precedence of atoms: never parenthesized.
const PREC_ATOM: i8 = 99;

/// Renders a whole module.
pub fn print_module(module: &Module, interner: &Interner) -> String {
    let mut printer = Printer::new(module, interner);
    if let Some(doc) = module.docstring {
        printer.out.push_str("\"\"\"");
        printer.out.push_str(interner.get(doc));
        printer.out.push_str("\"\"\"\n");
    }
    printer.body_flat(&module.body);
    printer.out
}

/// Renders a single expression.
pub fn print_expr(module: &Module, interner: &Interner, expr: &ExprLoc) -> String {
    let mut printer = Printer::new(module, interner);
    printer.exec_expr(expr, 0);
    printer.out
}

struct Printer<'a> {
    module: &'a Module,
    interner: &'a Interner,
    out: String,
    indent: usize,
}

impl<'a> Printer<'a> {
    fn new(module: &'a Module, interner: &'a Interner) -> Self {
        Self {
            module,
            interner,
            out: String::new(),
            indent: 0,
        }
    }

    fn text(&self, id: StringId) -> &'a str {
        self.interner.get(id)
    }

    fn line_start(&mut self) {
        for _ in 0..self.indent {
            self.out.push_str("    ");
        }
    }

    /// Prints a child operand under the given context precedence.
    fn operand(&mut self, expr: &ExprLoc, prec: i8) {
        let child = expr_precedence(&expr.expr);
        if child < prec {
            self.out.push('(');
            self.exec_expr(expr, 0);
            self.out.push(')');
        } else {
            self.exec_expr(expr, 0);
        }
    }

    /// Prints an expression in a neutral context (argument, subscript...).
    fn atom(&mut self, expr: &ExprLoc) {
        self.operand(expr, PREC_NONE);
    }

    fn comma_list(&mut self, items: &[ExprLoc]) {
        for (i, item) in items.iter().enumerate() {
            if i > 0 {
                self.out.push_str(", ");
            }
            self.atom(item);
        }
    }

    fn body_flat(&mut self, body: &[StmtLoc]) {
        for stmt in body {
            self.exec_stmt(stmt, 0);
        }
    }

    fn block(&mut self, body: &[StmtLoc]) {
        self.out.push_str(":\n");
        self.indent += 1;
        if body.is_empty() {
            self.line_start();
            self.out.push_str("pass\n");
        } else {
            self.body_flat(body);
        }
        self.indent -= 1;
    }

    fn params(&mut self, args: &crate::ast::Arguments) {
        let mut first = true;
        let mut sep = |out: &mut String| {
            if first {
                first = false;
            } else {
                out.push_str(", ");
            }
        };
        for (i, param) in args.args.iter().enumerate() {
            sep(&mut self.out);
            self.param(param);
            if i + 1 == args.posonly_count {
                self.out.push_str(", /");
            }
        }
        if let Some(vararg) = &args.vararg {
            sep(&mut self.out);
            self.out.push('*');
            self.param(vararg);
        } else if !args.kwonly_args.is_empty() {
            sep(&mut self.out);
            self.out.push('*');
        }
        for param in &args.kwonly_args {
            sep(&mut self.out);
            self.param(param);
        }
        if let Some(kwarg) = &args.kwarg {
            sep(&mut self.out);
            self.out.push_str("**");
            self.param(kwarg);
        }
    }

    fn param(&mut self, param: &Param) {
        let name = self.text(param.name);
        self.out.push_str(name);
        if let Some(annotation) = &param.annotation {
            self.out.push_str(": ");
            self.atom(annotation);
        }
        if let Some(default) = &param.default {
            if param.annotation.is_some() {
                self.out.push_str(" = ");
            } else {
                self.out.push('=');
            }
            self.atom(default);
        }
    }

    fn docstring_line(&mut self, doc: Option<StringId>) {
        if let Some(doc) = doc {
            self.line_start();
            self.out.push_str("\"\"\"");
            self.out.push_str(self.text(doc));
            self.out.push_str("\"\"\"\n");
        }
    }

    fn function(&mut self, fid: FuncId) {
        let module = self.module;
        let func = module.func(fid);
        for dec in &func.decorators {
            self.line_start();
            self.out.push('@');
            self.atom(dec);
            self.out.push('\n');
        }
        self.line_start();
        if func.is_async {
            self.out.push_str("async ");
        }
        let _ = write!(self.out, "def {}(", self.text(func.name));
        self.params(&func.args);
        self.out.push(')');
        if let Some(returns) = &func.returns {
            self.out.push_str(" -> ");
            self.atom(returns);
        }
        self.out.push_str(":\n");
        self.indent += 1;
        self.docstring_line(func.docstring);
        if func.body.is_empty() && func.docstring.is_none() {
            self.line_start();
            self.out.push_str("pass\n");
        } else {
            self.body_flat(&func.body);
        }
        self.indent -= 1;
    }

    fn class(&mut self, cid: ClassId) {
        let module = self.module;
        let class = module.class(cid);
        for dec in &class.decorators {
            self.line_start();
            self.out.push('@');
            self.atom(dec);
            self.out.push('\n');
        }
        self.line_start();
        let _ = write!(self.out, "class {}", self.text(class.name));
        if !class.bases.is_empty() {
            self.out.push('(');
            self.comma_list(&class.bases);
            self.out.push(')');
        }
        self.out.push_str(":\n");
        self.indent += 1;
        self.docstring_line(class.docstring);
        let mut empty = class.docstring.is_none();
        for (name, attr) in &class.attrs {
            // Attributes introduced by `self.x = ...` in method bodies have
            // no annotation and no default; they are not source text.
            if attr.annotation.is_none() && attr.default.is_none() {
                continue;
            }
            empty = false;
            self.line_start();
            self.out.push_str(self.text(*name));
            if let Some(annotation) = &attr.annotation {
                self.out.push_str(": ");
                self.atom(annotation);
            }
            if let Some(default) = &attr.default {
                self.out.push_str(" = ");
                self.atom(default);
            }
            self.out.push('\n');
        }
        for fid in class.methods.values() {
            empty = false;
            self.function(*fid);
        }
        for nested in class.nested.values() {
            empty = false;
            self.class(*nested);
        }
        if empty {
            self.line_start();
            self.out.push_str("pass\n");
        }
        self.indent -= 1;
    }

    fn import_alias(&mut self, alias: &ImportAlias) {
        let path: Vec<&str> = alias.path.iter().map(|id| self.interner.get(*id)).collect();
        self.out.push_str(&path.join("."));
        if let Some(asname) = alias.asname {
            let _ = write!(self.out, " as {}", self.text(asname));
        }
    }

    fn comprehension_clauses(&mut self, generators: &[Comprehension]) {
        for generator in generators {
            self.out.push_str(" for ");
            self.print_target(&generator.target);
            self.out.push_str(" in ");
            self.operand(&generator.iter, 1);
            for cond in &generator.ifs {
                self.out.push_str(" if ");
                self.operand(cond, 1);
            }
        }
    }

    fn string_literal(&mut self, id: StringId) {
        let escaped = self
            .text(id)
            .replace('\\', "\\\\")
            .replace('"', "\\\"")
            .replace('\n', "\\n")
            .replace('\t', "\\t");
        let _ = write!(self.out, "\"{escaped}\"");
    }
}

fn expr_precedence(expr: &Expr) -> i8 {
    let table = precedence_table();
    match expr {
        Expr::BinOp { op, .. } => table[op.symbol()].precedence,
        Expr::BoolOp { op, .. } => table[op.symbol()].precedence,
        Expr::Compare { .. } => 6,
        Expr::UnaryOp { op, .. } => match op {
            UnaryOpKind::Not => 5,
            _ => UNARY_PRECEDENCE,
        },
        Expr::IfExp { .. } | Expr::NamedExpr { .. } | Expr::Lambda(_) => 1,
        _ => PREC_ATOM,
    }
}

impl TreeVisitor for Printer<'_> {
    type ExprRet = ();
    type StmtRet = ();
    type PatRet = ();

    const MAX_DEPTH: usize = 4096;

    fn depth_exceeded_expr(&mut self, _span: Span) {}
    fn depth_exceeded_stmt(&mut self, _span: Span) {}
    fn depth_exceeded_pat(&mut self, _span: Span) {}

    // -- Expressions --

    fn constant(&mut self, _node: &ExprLoc, _span: Span, value: &ConstValue, _depth: usize) {
        match value {
            ConstValue::None => self.out.push_str("None"),
            ConstValue::Bool(true) => self.out.push_str("True"),
            ConstValue::Bool(false) => self.out.push_str("False"),
            ConstValue::Int(v) => {
                let _ = write!(self.out, "{v}");
            }
            ConstValue::Float(v) => self.out.push_str(&format_float(*v)),
            ConstValue::Str(id) => self.string_literal(*id),
        }
    }

    fn name(&mut self, _node: &ExprLoc, _span: Span, name: &NameRef, _depth: usize) {
        let text = self.text(name.name);
        self.out.push_str(text);
    }

    fn builtintype(&mut self, _node: &ExprLoc, _span: Span, builtin: crate::types::Builtin, _depth: usize) {
        self.out.push_str(builtin.name());
    }

    fn binop(
        &mut self,
        _node: &ExprLoc,
        _span: Span,
        left: &ExprLoc,
        op: BinOpKind,
        right: &ExprLoc,
        _resolved: &OpImpl,
        _depth: usize,
    ) {
        let cfg = precedence_table()[op.symbol()];
        let (lp, rp) = if cfg.left_associative {
            (cfg.precedence, cfg.precedence + 1)
        } else {
            (cfg.precedence + 1, cfg.precedence)
        };
        self.operand(left, lp);
        let _ = write!(self.out, " {} ", op.symbol());
        self.operand(right, rp);
    }

    fn boolop(
        &mut self,
        _node: &ExprLoc,
        _span: Span,
        op: BoolOpKind,
        values: &[ExprLoc],
        _resolved: &OpImpl,
        _depth: usize,
    ) {
        let prec = precedence_table()[op.symbol()].precedence;
        for (i, value) in values.iter().enumerate() {
            if i > 0 {
                let _ = write!(self.out, " {} ", op.symbol());
            }
            self.operand(value, prec + 1);
        }
    }

    fn unaryop(
        &mut self,
        _node: &ExprLoc,
        _span: Span,
        op: UnaryOpKind,
        operand: &ExprLoc,
        _resolved: &OpImpl,
        _depth: usize,
    ) {
        self.out.push_str(op.symbol());
        let prec = match op {
            UnaryOpKind::Not => 5,
            _ => UNARY_PRECEDENCE,
        };
        self.operand(operand, prec);
    }

    fn compare(
        &mut self,
        _node: &ExprLoc,
        _span: Span,
        left: &ExprLoc,
        ops: &[CmpOpKind],
        comparators: &[ExprLoc],
        _resolved: &[OpImpl],
        _depth: usize,
    ) {
        self.operand(left, 6);
        for (op, comparator) in ops.iter().zip(comparators) {
            let _ = write!(self.out, " {} ", op.symbol());
            self.operand(comparator, 7);
        }
    }

    fn call(
        &mut self,
        _node: &ExprLoc,
        _span: Span,
        func: &ExprLoc,
        args: &[ExprLoc],
        keywords: &[CallKeyword],
        _depth: usize,
    ) {
        self.operand(func, PREC_ATOM);
        self.out.push('(');
        let mut first = true;
        for arg in args {
            if !first {
                self.out.push_str(", ");
            }
            first = false;
            self.atom(arg);
        }
        for kw in keywords {
            if !first {
                self.out.push_str(", ");
            }
            first = false;
            let name = self.text(kw.name);
            self.out.push_str(name);
            self.out.push('=');
            self.atom(&kw.value);
        }
        self.out.push(')');
    }

    fn attribute(&mut self, _node: &ExprLoc, _span: Span, value: &ExprLoc, attr: StringId, _depth: usize) {
        self.operand(value, PREC_ATOM);
        self.out.push('.');
        let attr = self.text(attr);
        self.out.push_str(attr);
    }

    fn subscript(&mut self, _node: &ExprLoc, _span: Span, value: &ExprLoc, index: &ExprLoc, _depth: usize) {
        self.operand(value, PREC_ATOM);
        self.out.push('[');
        self.atom(index);
        self.out.push(']');
    }

    fn slice(
        &mut self,
        _node: &ExprLoc,
        _span: Span,
        lower: Option<&ExprLoc>,
        upper: Option<&ExprLoc>,
        step: Option<&ExprLoc>,
        _depth: usize,
    ) {
        if let Some(lower) = lower {
            self.atom(lower);
        }
        self.out.push(':');
        if let Some(upper) = upper {
            self.atom(upper);
        }
        if let Some(step) = step {
            self.out.push(':');
            self.atom(step);
        }
    }

    fn lambda(&mut self, _node: &ExprLoc, _span: Span, func: FuncId, _depth: usize) {
        let module = self.module;
        let def = module.func(func);
        self.out.push_str("lambda");
        if def.args.param_count() > 0 {
            self.out.push(' ');
            self.params(&def.args);
        }
        self.out.push_str(": ");
        // The body is the single return statement's expression.
        if let Some(StmtLoc {
            stmt: crate::ast::Stmt::Return(Some(body)),
            ..
        }) = def.body.first()
        {
            self.atom(body);
        }
    }

    fn ifexp(&mut self, _node: &ExprLoc, _span: Span, test: &ExprLoc, body: &ExprLoc, orelse: &ExprLoc, _depth: usize) {
        self.operand(body, 2);
        self.out.push_str(" if ");
        self.operand(test, 2);
        self.out.push_str(" else ");
        self.operand(orelse, 1);
    }

    fn listexpr(&mut self, _node: &ExprLoc, _span: Span, items: &[ExprLoc], _depth: usize) {
        self.out.push('[');
        self.comma_list(items);
        self.out.push(']');
    }

    fn tupleexpr(&mut self, _node: &ExprLoc, _span: Span, items: &[ExprLoc], _depth: usize) {
        self.out.push('(');
        self.comma_list(items);
        if items.len() == 1 {
            self.out.push(',');
        }
        self.out.push(')');
    }

    fn setexpr(&mut self, _node: &ExprLoc, _span: Span, items: &[ExprLoc], _depth: usize) {
        self.out.push('{');
        self.comma_list(items);
        self.out.push('}');
    }

    fn dictexpr(&mut self, _node: &ExprLoc, _span: Span, keys: &[ExprLoc], values: &[ExprLoc], _depth: usize) {
        self.out.push('{');
        for (i, (key, value)) in keys.iter().zip(values).enumerate() {
            if i > 0 {
                self.out.push_str(", ");
            }
            self.atom(key);
            self.out.push_str(": ");
            self.atom(value);
        }
        self.out.push('}');
    }

    fn listcomp(&mut self, _node: &ExprLoc, _span: Span, elt: &ExprLoc, generators: &[Comprehension], _depth: usize) {
        self.out.push('[');
        self.atom(elt);
        self.comprehension_clauses(generators);
        self.out.push(']');
    }

    fn setcomp(&mut self, _node: &ExprLoc, _span: Span, elt: &ExprLoc, generators: &[Comprehension], _depth: usize) {
        self.out.push('{');
        self.atom(elt);
        self.comprehension_clauses(generators);
        self.out.push('}');
    }

    fn dictcomp(
        &mut self,
        _node: &ExprLoc,
        _span: Span,
        key: &ExprLoc,
        value: &ExprLoc,
        generators: &[Comprehension],
        _depth: usize,
    ) {
        self.out.push('{');
        self.atom(key);
        self.out.push_str(": ");
        self.atom(value);
        self.comprehension_clauses(generators);
        self.out.push('}');
    }

    fn generateexpr(
        &mut self,
        _node: &ExprLoc,
        _span: Span,
        elt: &ExprLoc,
        generators: &[Comprehension],
        _depth: usize,
    ) {
        self.out.push('(');
        self.atom(elt);
        self.comprehension_clauses(generators);
        self.out.push(')');
    }

    fn namedexpr(&mut self, _node: &ExprLoc, _span: Span, target: &NameRef, value: &ExprLoc, _depth: usize) {
        self.out.push('(');
        let name = self.text(target.name);
        self.out.push_str(name);
        self.out.push_str(" := ");
        self.atom(value);
        self.out.push(')');
    }

    fn starred(&mut self, _node: &ExprLoc, _span: Span, value: &ExprLoc, _depth: usize) {
        self.out.push('*');
        self.operand(value, PREC_ATOM);
    }

    fn await_expr(&mut self, _node: &ExprLoc, _span: Span, value: &ExprLoc, _depth: usize) {
        self.out.push_str("await ");
        self.operand(value, UNARY_PRECEDENCE);
    }

    fn yield_expr(&mut self, _node: &ExprLoc, _span: Span, value: Option<&ExprLoc>, _depth: usize) {
        self.out.push_str("yield");
        if let Some(value) = value {
            self.out.push(' ');
            self.atom(value);
        }
    }

    fn yieldfrom(&mut self, _node: &ExprLoc, _span: Span, value: &ExprLoc, _depth: usize) {
        self.out.push_str("yield from ");
        self.atom(value);
    }

    fn joinedstr(&mut self, _node: &ExprLoc, _span: Span, parts: &[ExprLoc], _depth: usize) {
        self.out.push_str("f\"");
        for part in parts {
            match &part.expr {
                Expr::Constant(ConstValue::Str(id)) => {
                    let text = self.text(*id).replace('{', "{{").replace('}', "}}");
                    self.out.push_str(&text);
                }
                _ => self.exec_expr(part, 0),
            }
        }
        self.out.push('"');
    }

    fn formattedvalue(
        &mut self,
        _node: &ExprLoc,
        _span: Span,
        value: &ExprLoc,
        format_spec: Option<StringId>,
        _depth: usize,
    ) {
        self.out.push('{');
        self.atom(value);
        if let Some(spec) = format_spec {
            self.out.push(':');
            let spec = self.text(spec);
            self.out.push_str(spec);
        }
        self.out.push('}');
    }

    fn arrow(&mut self, _node: &ExprLoc, _span: Span, params: &[ExprLoc], ret: &ExprLoc, _depth: usize) {
        self.out.push('(');
        self.comma_list(params);
        self.out.push_str(") -> ");
        self.atom(ret);
    }

    fn arraytype(&mut self, _node: &ExprLoc, _span: Span, item: &ExprLoc, _depth: usize) {
        self.out.push_str("list[");
        self.atom(item);
        self.out.push(']');
    }

    fn settype(&mut self, _node: &ExprLoc, _span: Span, item: &ExprLoc, _depth: usize) {
        self.out.push_str("set[");
        self.atom(item);
        self.out.push(']');
    }

    fn tupletype(&mut self, _node: &ExprLoc, _span: Span, items: &[ExprLoc], _depth: usize) {
        self.out.push_str("tuple[");
        self.comma_list(items);
        self.out.push(']');
    }

    fn dicttype(&mut self, _node: &ExprLoc, _span: Span, key: &ExprLoc, value: &ExprLoc, _depth: usize) {
        self.out.push_str("dict[");
        self.atom(key);
        self.out.push_str(", ");
        self.atom(value);
        self.out.push(']');
    }

    fn classtype(&mut self, _node: &ExprLoc, _span: Span, class: ClassId, _depth: usize) {
        let name = self.text(self.module.class(class).name);
        self.out.push_str(name);
    }

    // -- Statements --

    fn exprstmt(&mut self, _node: &StmtLoc, _span: Span, value: &ExprLoc, _depth: usize) {
        self.line_start();
        self.atom(value);
        self.out.push('\n');
    }

    fn assign(&mut self, _node: &StmtLoc, _span: Span, targets: &[ExprLoc], value: &ExprLoc, _depth: usize) {
        self.line_start();
        for target in targets {
            self.print_target(target);
            self.out.push_str(" = ");
        }
        self.atom(value);
        self.out.push('\n');
    }

    fn augassign(
        &mut self,
        _node: &StmtLoc,
        _span: Span,
        target: &ExprLoc,
        op: BinOpKind,
        value: &ExprLoc,
        _resolved: &OpImpl,
        _depth: usize,
    ) {
        self.line_start();
        self.print_target(target);
        let _ = write!(self.out, " {}= ", op.symbol());
        self.atom(value);
        self.out.push('\n');
    }

    fn annassign(
        &mut self,
        _node: &StmtLoc,
        _span: Span,
        target: &ExprLoc,
        annotation: &ExprLoc,
        value: Option<&ExprLoc>,
        _depth: usize,
    ) {
        self.line_start();
        self.print_target(target);
        self.out.push_str(": ");
        self.atom(annotation);
        if let Some(value) = value {
            self.out.push_str(" = ");
            self.atom(value);
        }
        self.out.push('\n');
    }

    fn returnstmt(&mut self, _node: &StmtLoc, _span: Span, value: Option<&ExprLoc>, _depth: usize) {
        self.line_start();
        self.out.push_str("return");
        if let Some(value) = value {
            self.out.push(' ');
            self.print_bare(value);
        }
        self.out.push('\n');
    }

    fn deletestmt(&mut self, _node: &StmtLoc, _span: Span, targets: &[ExprLoc], _depth: usize) {
        self.line_start();
        self.out.push_str("del ");
        self.comma_list(targets);
        self.out.push('\n');
    }

    fn pass(&mut self, _node: &StmtLoc, _span: Span, _depth: usize) {
        self.line_start();
        self.out.push_str("pass\n");
    }

    fn breakstmt(&mut self, _node: &StmtLoc, _span: Span, _depth: usize) {
        self.line_start();
        self.out.push_str("break\n");
    }

    fn continuestmt(&mut self, _node: &StmtLoc, _span: Span, _depth: usize) {
        self.line_start();
        self.out.push_str("continue\n");
    }

    fn functiondef(&mut self, _node: &StmtLoc, _span: Span, func: FuncId, _depth: usize) {
        self.function(func);
    }

    fn classdef(&mut self, _node: &StmtLoc, _span: Span, class: ClassId, _depth: usize) {
        self.class(class);
    }

    fn ifstmt(
        &mut self,
        _node: &StmtLoc,
        _span: Span,
        tests: &[ExprLoc],
        bodies: &[Vec<StmtLoc>],
        orelse: &[StmtLoc],
        _depth: usize,
    ) {
        for (i, (test, body)) in tests.iter().zip(bodies).enumerate() {
            self.line_start();
            self.out.push_str(if i == 0 { "if " } else { "elif " });
            self.print_bare(test);
            self.block(body);
        }
        if !orelse.is_empty() {
            self.line_start();
            self.out.push_str("else");
            self.block(orelse);
        }
    }

    fn whilestmt(
        &mut self,
        _node: &StmtLoc,
        _span: Span,
        test: &ExprLoc,
        body: &[StmtLoc],
        orelse: &[StmtLoc],
        _depth: usize,
    ) {
        self.line_start();
        self.out.push_str("while ");
        self.print_bare(test);
        self.block(body);
        if !orelse.is_empty() {
            self.line_start();
            self.out.push_str("else");
            self.block(orelse);
        }
    }

    fn forstmt(
        &mut self,
        _node: &StmtLoc,
        _span: Span,
        target: &ExprLoc,
        iter: &ExprLoc,
        body: &[StmtLoc],
        orelse: &[StmtLoc],
        _depth: usize,
    ) {
        self.line_start();
        self.out.push_str("for ");
        self.print_target(target);
        self.out.push_str(" in ");
        self.print_bare(iter);
        self.block(body);
        if !orelse.is_empty() {
            self.line_start();
            self.out.push_str("else");
            self.block(orelse);
        }
    }

    fn with(&mut self, _node: &StmtLoc, _span: Span, items: &[WithItem], body: &[StmtLoc], _depth: usize) {
        self.line_start();
        self.out.push_str("with ");
        for (i, item) in items.iter().enumerate() {
            if i > 0 {
                self.out.push_str(", ");
            }
            self.atom(&item.context_expr);
            if let Some(var) = &item.optional_vars {
                let name = self.text(var.name);
                let _ = write!(self.out, " as {name}");
            }
        }
        self.block(body);
    }

    fn raise(&mut self, _node: &StmtLoc, _span: Span, exc: Option<&ExprLoc>, cause: Option<&ExprLoc>, _depth: usize) {
        self.line_start();
        self.out.push_str("raise");
        if let Some(exc) = exc {
            self.out.push(' ');
            self.atom(exc);
        }
        if let Some(cause) = cause {
            self.out.push_str(" from ");
            self.atom(cause);
        }
        self.out.push('\n');
    }

    fn trystmt(
        &mut self,
        _node: &StmtLoc,
        _span: Span,
        body: &[StmtLoc],
        handlers: &[ExceptHandler],
        orelse: &[StmtLoc],
        finalbody: &[StmtLoc],
        _depth: usize,
    ) {
        self.line_start();
        self.out.push_str("try");
        self.block(body);
        for handler in handlers {
            self.line_start();
            self.out.push_str("except");
            if let Some(exc_type) = &handler.exc_type {
                self.out.push(' ');
                self.atom(exc_type);
            }
            if let Some(name) = &handler.name {
                let name = self.text(name.name);
                let _ = write!(self.out, " as {name}");
            }
            self.block(&handler.body);
        }
        if !orelse.is_empty() {
            self.line_start();
            self.out.push_str("else");
            self.block(orelse);
        }
        if !finalbody.is_empty() {
            self.line_start();
            self.out.push_str("finally");
            self.block(finalbody);
        }
    }

    fn assertstmt(&mut self, _node: &StmtLoc, _span: Span, test: &ExprLoc, msg: Option<&ExprLoc>, _depth: usize) {
        self.line_start();
        self.out.push_str("assert ");
        self.atom(test);
        if let Some(msg) = msg {
            self.out.push_str(", ");
            self.atom(msg);
        }
        self.out.push('\n');
    }

    fn import(&mut self, _node: &StmtLoc, _span: Span, names: &[ImportAlias], _depth: usize) {
        self.line_start();
        self.out.push_str("import ");
        for (i, alias) in names.iter().enumerate() {
            if i > 0 {
                self.out.push_str(", ");
            }
            self.import_alias(alias);
        }
        self.out.push('\n');
    }

    fn importfrom(&mut self, _node: &StmtLoc, _span: Span, module: &[StringId], names: &[ImportAlias], _depth: usize) {
        self.line_start();
        let path: Vec<&str> = module.iter().map(|id| self.interner.get(*id)).collect();
        let _ = write!(self.out, "from {} import ", path.join("."));
        for (i, alias) in names.iter().enumerate() {
            if i > 0 {
                self.out.push_str(", ");
            }
            self.import_alias(alias);
        }
        self.out.push('\n');
    }

    fn global(&mut self, _node: &StmtLoc, _span: Span, names: &[StringId], _depth: usize) {
        self.line_start();
        self.out.push_str("global ");
        let names: Vec<&str> = names.iter().map(|id| self.interner.get(*id)).collect();
        self.out.push_str(&names.join(", "));
        self.out.push('\n');
    }

    fn nonlocal(&mut self, _node: &StmtLoc, _span: Span, names: &[StringId], _depth: usize) {
        self.line_start();
        self.out.push_str("nonlocal ");
        let names: Vec<&str> = names.iter().map(|id| self.interner.get(*id)).collect();
        self.out.push_str(&names.join(", "));
        self.out.push('\n');
    }

    fn match_stmt(&mut self, _node: &StmtLoc, _span: Span, subject: &ExprLoc, cases: &[MatchCase], _depth: usize) {
        self.line_start();
        self.out.push_str("match ");
        self.print_bare(subject);
        self.out.push_str(":\n");
        self.indent += 1;
        for case in cases {
            self.line_start();
            self.out.push_str("case ");
            self.exec_pattern(&case.pattern, 0);
            if let Some(guard) = &case.guard {
                self.out.push_str(" if ");
                self.atom(guard);
            }
            self.block(&case.body);
        }
        self.indent -= 1;
    }

    fn inline(&mut self, _node: &StmtLoc, _span: Span, body: &[StmtLoc], _depth: usize) {
        // Rendered one per line; the `;` form is not reconstructed.
        self.body_flat(body);
    }

    // -- Patterns --

    fn matchvalue(&mut self, _node: &PatternLoc, _span: Span, value: &ExprLoc, _depth: usize) {
        self.atom(value);
    }

    fn matchsingleton(&mut self, _node: &PatternLoc, _span: Span, value: ConstValue, _depth: usize) {
        match value {
            ConstValue::None => self.out.push_str("None"),
            ConstValue::Bool(true) => self.out.push_str("True"),
            ConstValue::Bool(false) => self.out.push_str("False"),
            _ => {}
        }
    }

    fn matchsequence(&mut self, _node: &PatternLoc, _span: Span, patterns: &[PatternLoc], _depth: usize) {
        self.out.push('[');
        for (i, pattern) in patterns.iter().enumerate() {
            if i > 0 {
                self.out.push_str(", ");
            }
            self.exec_pattern(pattern, 0);
        }
        self.out.push(']');
    }

    fn matchmapping(
        &mut self,
        _node: &PatternLoc,
        _span: Span,
        keys: &[ExprLoc],
        patterns: &[PatternLoc],
        rest: Option<&NameRef>,
        _depth: usize,
    ) {
        self.out.push('{');
        let mut first = true;
        for (key, pattern) in keys.iter().zip(patterns) {
            if !first {
                self.out.push_str(", ");
            }
            first = false;
            self.atom(key);
            self.out.push_str(": ");
            self.exec_pattern(pattern, 0);
        }
        if let Some(rest) = rest {
            if !first {
                self.out.push_str(", ");
            }
            let name = self.text(rest.name);
            let _ = write!(self.out, "**{name}");
        }
        self.out.push('}');
    }

    fn matchclass(
        &mut self,
        _node: &PatternLoc,
        _span: Span,
        cls: &ExprLoc,
        patterns: &[PatternLoc],
        kwd_attrs: &[StringId],
        kwd_patterns: &[PatternLoc],
        _depth: usize,
    ) {
        self.atom(cls);
        self.out.push('(');
        let mut first = true;
        for pattern in patterns {
            if !first {
                self.out.push_str(", ");
            }
            first = false;
            self.exec_pattern(pattern, 0);
        }
        for (attr, pattern) in kwd_attrs.iter().zip(kwd_patterns) {
            if !first {
                self.out.push_str(", ");
            }
            first = false;
            let attr = self.text(*attr);
            self.out.push_str(attr);
            self.out.push('=');
            self.exec_pattern(pattern, 0);
        }
        self.out.push(')');
    }

    fn matchstar(&mut self, _node: &PatternLoc, _span: Span, name: Option<&NameRef>, _depth: usize) {
        self.out.push('*');
        match name {
            Some(name) => {
                let name = self.text(name.name);
                self.out.push_str(name);
            }
            None => self.out.push('_'),
        }
    }

    fn matchas(
        &mut self,
        _node: &PatternLoc,
        _span: Span,
        pattern: Option<&PatternLoc>,
        name: Option<&NameRef>,
        _depth: usize,
    ) {
        match (pattern, name) {
            (Some(pattern), Some(name)) => {
                self.exec_pattern(pattern, 0);
                let name = self.text(name.name);
                let _ = write!(self.out, " as {name}");
            }
            (None, Some(name)) => {
                let name = self.text(name.name);
                self.out.push_str(name);
            }
            _ => self.out.push('_'),
        }
    }

    fn matchor(&mut self, _node: &PatternLoc, _span: Span, patterns: &[PatternLoc], _depth: usize) {
        for (i, pattern) in patterns.iter().enumerate() {
            if i > 0 {
                self.out.push_str(" | ");
            }
            self.exec_pattern(pattern, 0);
        }
    }
}

impl Printer<'_> {
    /// Assignment targets: tuples print without parentheses.
    fn print_target(&mut self, target: &ExprLoc) {
        match &target.expr {
            Expr::TupleExpr(items) if !items.is_empty() => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        self.out.push_str(", ");
                    }
                    self.atom(item);
                }
            }
            _ => self.atom(target),
        }
    }

    /// Expressions in statement position: tuples print bare.
    fn print_bare(&mut self, expr: &ExprLoc) {
        match &expr.expr {
            Expr::TupleExpr(items) if !items.is_empty() => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        self.out.push_str(", ");
                    }
                    self.atom(item);
                }
            }
            _ => self.atom(expr),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::parse_module;

    fn round_trip(source: &str) -> String {
        let mut interner = Interner::new();
        let (module, diagnostics) = parse_module(source, &mut interner);
        assert!(diagnostics.is_empty(), "unexpected diagnostics: {diagnostics:?}");
        print_module(&module, &interner)
    }

    #[test]
    fn simple_statements_round_trip() {
        let source = "x = 1\ny = x + 2\nprint(y)\n";
        assert_eq!(round_trip(source), source);
    }

    #[test]
    fn precedence_inserts_only_needed_parens() {
        assert_eq!(round_trip("a = 3 + 2 * 4\n"), "a = 3 + 2 * 4\n");
        assert_eq!(round_trip("a = (3 + 2) * 4\n"), "a = (3 + 2) * 4\n");
        assert_eq!(round_trip("a = -b ** 2\n"), "a = -b ** 2\n");
        assert_eq!(round_trip("a = not x and y\n"), "a = not x and y\n");
    }

    #[test]
    fn right_associative_power_round_trips() {
        assert_eq!(round_trip("a = 2 ** 3 ** 2\n"), "a = 2 ** 3 ** 2\n");
        assert_eq!(round_trip("a = (2 ** 3) ** 2\n"), "a = (2 ** 3) ** 2\n");
    }

    #[test]
    fn function_and_class_round_trip() {
        let source = "def f(a: i32) -> i32:\n    return a\nclass P:\n    x: i32\n    y: i32\n";
        assert_eq!(round_trip(source), source);
    }

    #[test]
    fn compound_statements_round_trip() {
        let source = "if a:\n    x = 1\nelif b:\n    x = 2\nelse:\n    x = 3\nwhile x > 0:\n    x -= 1\n";
        assert_eq!(round_trip(source), source);
    }

    #[test]
    fn try_and_with_round_trip() {
        let source = "try:\n    risky()\nexcept ValueError as e:\n    handle(e)\nfinally:\n    cleanup()\n";
        assert_eq!(round_trip(source), source);
    }

    #[test]
    fn match_round_trips() {
        let source = "match x:\n    case 1 | 2:\n        pass\n    case [a, *rest]:\n        pass\n    case _:\n        pass\n";
        assert_eq!(round_trip(source), source);
    }

    #[test]
    fn comprehensions_round_trip() {
        let source = "xs = [x * x for x in items if x > 0]\nd = {k: v for k, v in pairs}\n";
        assert_eq!(round_trip(source), source);
    }
}
