//! Visitor scaffold over the AST.
//!
//! Implementors supply a return type per node category and one method per
//! node kind; the scaffold provides `exec_*` entry points that enforce the
//! recursion limit, optionally record a trace, and dispatch on the kind
//! tag. The evaluator and the printer are the two implementors.

use crate::ast::{
    CallKeyword, Comprehension, ConstValue, ExceptHandler, ExprLoc, ImportAlias, MatchCase, NameRef, OpImpl, Pattern,
    PatternLoc, Stmt, StmtLoc, WithItem,
};
use crate::ast::{ClassId, Expr, FuncId};
use crate::intern::StringId;
use crate::ops::{BinOpKind, BoolOpKind, CmpOpKind, UnaryOpKind};
use crate::token::Span;
use crate::types::Builtin;

/// Depth-checked dispatch over expressions, statements, and patterns.
#[allow(clippy::too_many_arguments)]
pub trait TreeVisitor {
    type ExprRet;
    type StmtRet;
    type PatRet;

    /// Maximum recursion depth before dispatch bails out.
    const MAX_DEPTH: usize = 256;
    /// Whether `record_trace` is invoked on every dispatch.
    const COLLECT_TRACE: bool = false;

    fn record_trace(&mut self, _span: Span) {}

    fn depth_exceeded_expr(&mut self, span: Span) -> Self::ExprRet;
    fn depth_exceeded_stmt(&mut self, span: Span) -> Self::StmtRet;
    fn depth_exceeded_pat(&mut self, span: Span) -> Self::PatRet;

    fn exec_expr(&mut self, node: &ExprLoc, depth: usize) -> Self::ExprRet {
        if depth >= Self::MAX_DEPTH {
            return self.depth_exceeded_expr(node.span);
        }
        if Self::COLLECT_TRACE {
            self.record_trace(node.span);
        }
        self.dispatch_expr(node, depth)
    }

    fn exec_stmt(&mut self, node: &StmtLoc, depth: usize) -> Self::StmtRet {
        if depth >= Self::MAX_DEPTH {
            return self.depth_exceeded_stmt(node.span);
        }
        if Self::COLLECT_TRACE {
            self.record_trace(node.span);
        }
        self.dispatch_stmt(node, depth)
    }

    fn exec_pattern(&mut self, node: &PatternLoc, depth: usize) -> Self::PatRet {
        if depth >= Self::MAX_DEPTH {
            return self.depth_exceeded_pat(node.span);
        }
        self.dispatch_pattern(node, depth)
    }

    fn dispatch_expr(&mut self, node: &ExprLoc, depth: usize) -> Self::ExprRet {
        let span = node.span;
        match &node.expr {
            Expr::Constant(value) => self.constant(node, span, value, depth),
            Expr::Name(name) => self.name(node, span, name, depth),
            Expr::BuiltinType(builtin) => self.builtintype(node, span, *builtin, depth),
            Expr::BinOp {
                left,
                op,
                right,
                resolved,
            } => self.binop(node, span, left, *op, right, resolved, depth),
            Expr::BoolOp { op, values, resolved } => self.boolop(node, span, *op, values, resolved, depth),
            Expr::UnaryOp { op, operand, resolved } => self.unaryop(node, span, *op, operand, resolved, depth),
            Expr::Compare {
                left,
                ops,
                comparators,
                resolved,
            } => self.compare(node, span, left, ops, comparators, resolved, depth),
            Expr::Call { func, args, keywords } => self.call(node, span, func, args, keywords, depth),
            Expr::Attribute { value, attr } => self.attribute(node, span, value, *attr, depth),
            Expr::Subscript { value, index } => self.subscript(node, span, value, index, depth),
            Expr::Slice { lower, upper, step } => self.slice(
                node,
                span,
                lower.as_deref(),
                upper.as_deref(),
                step.as_deref(),
                depth,
            ),
            Expr::Lambda(func) => self.lambda(node, span, *func, depth),
            Expr::IfExp { test, body, orelse } => self.ifexp(node, span, test, body, orelse, depth),
            Expr::ListExpr(items) => self.listexpr(node, span, items, depth),
            Expr::TupleExpr(items) => self.tupleexpr(node, span, items, depth),
            Expr::SetExpr(items) => self.setexpr(node, span, items, depth),
            Expr::DictExpr { keys, values } => self.dictexpr(node, span, keys, values, depth),
            Expr::ListComp { elt, generators } => self.listcomp(node, span, elt, generators, depth),
            Expr::SetComp { elt, generators } => self.setcomp(node, span, elt, generators, depth),
            Expr::DictComp { key, value, generators } => self.dictcomp(node, span, key, value, generators, depth),
            Expr::GeneratorExp { elt, generators } => self.generateexpr(node, span, elt, generators, depth),
            Expr::NamedExpr { target, value } => self.namedexpr(node, span, target, value, depth),
            Expr::Starred(value) => self.starred(node, span, value, depth),
            Expr::Await(value) => self.await_expr(node, span, value, depth),
            Expr::Yield(value) => self.yield_expr(node, span, value.as_deref(), depth),
            Expr::YieldFrom(value) => self.yieldfrom(node, span, value, depth),
            Expr::JoinedStr(parts) => self.joinedstr(node, span, parts, depth),
            Expr::FormattedValue { value, format_spec } => {
                self.formattedvalue(node, span, value, *format_spec, depth)
            }
            Expr::Arrow { params, ret } => self.arrow(node, span, params, ret, depth),
            Expr::ArrayType { item } => self.arraytype(node, span, item, depth),
            Expr::SetType { item } => self.settype(node, span, item, depth),
            Expr::TupleType { items } => self.tupletype(node, span, items, depth),
            Expr::DictType { key, value } => self.dicttype(node, span, key, value, depth),
            Expr::ClassType(class) => self.classtype(node, span, *class, depth),
        }
    }

    fn dispatch_stmt(&mut self, node: &StmtLoc, depth: usize) -> Self::StmtRet {
        let span = node.span;
        match &node.stmt {
            Stmt::Expr(value) => self.exprstmt(node, span, value, depth),
            Stmt::Assign { targets, value } => self.assign(node, span, targets, value, depth),
            Stmt::AugAssign {
                target,
                op,
                value,
                resolved,
            } => self.augassign(node, span, target, *op, value, resolved, depth),
            Stmt::AnnAssign {
                target,
                annotation,
                value,
            } => self.annassign(node, span, target, annotation, value.as_deref(), depth),
            Stmt::Return(value) => self.returnstmt(node, span, value.as_ref(), depth),
            Stmt::Delete(targets) => self.deletestmt(node, span, targets, depth),
            Stmt::Pass => self.pass(node, span, depth),
            Stmt::Break => self.breakstmt(node, span, depth),
            Stmt::Continue => self.continuestmt(node, span, depth),
            Stmt::FunctionDef(func) => self.functiondef(node, span, *func, depth),
            Stmt::ClassDef(class) => self.classdef(node, span, *class, depth),
            Stmt::If { tests, bodies, orelse } => self.ifstmt(node, span, tests, bodies, orelse, depth),
            Stmt::While { test, body, orelse } => self.whilestmt(node, span, test, body, orelse, depth),
            Stmt::For {
                target,
                iter,
                body,
                orelse,
            } => self.forstmt(node, span, target, iter, body, orelse, depth),
            Stmt::With { items, body } => self.with(node, span, items, body, depth),
            Stmt::Raise { exc, cause } => self.raise(node, span, exc.as_ref(), cause.as_ref(), depth),
            Stmt::Try {
                body,
                handlers,
                orelse,
                finalbody,
            } => self.trystmt(node, span, body, handlers, orelse, finalbody, depth),
            Stmt::Assert { test, msg } => self.assertstmt(node, span, test, msg.as_ref(), depth),
            Stmt::Import { names } => self.import(node, span, names, depth),
            Stmt::ImportFrom { module, names } => self.importfrom(node, span, module, names, depth),
            Stmt::Global(names) => self.global(node, span, names, depth),
            Stmt::Nonlocal(names) => self.nonlocal(node, span, names, depth),
            Stmt::Match { subject, cases } => self.match_stmt(node, span, subject, cases, depth),
            Stmt::Inline(body) => self.inline(node, span, body, depth),
        }
    }

    fn dispatch_pattern(&mut self, node: &PatternLoc, depth: usize) -> Self::PatRet {
        let span = node.span;
        match &node.pattern {
            Pattern::MatchValue(value) => self.matchvalue(node, span, value, depth),
            Pattern::MatchSingleton(value) => self.matchsingleton(node, span, *value, depth),
            Pattern::MatchSequence(patterns) => self.matchsequence(node, span, patterns, depth),
            Pattern::MatchMapping { keys, patterns, rest } => {
                self.matchmapping(node, span, keys, patterns, rest.as_ref(), depth)
            }
            Pattern::MatchClass {
                cls,
                patterns,
                kwd_attrs,
                kwd_patterns,
            } => self.matchclass(node, span, cls, patterns, kwd_attrs, kwd_patterns, depth),
            Pattern::MatchStar(name) => self.matchstar(node, span, name.as_ref(), depth),
            Pattern::MatchAs { pattern, name } => self.matchas(node, span, pattern.as_deref(), name.as_ref(), depth),
            Pattern::MatchOr(patterns) => self.matchor(node, span, patterns, depth),
        }
    }

    // -- Expressions --
    fn constant(&mut self, node: &ExprLoc, span: Span, value: &ConstValue, depth: usize) -> Self::ExprRet;
    fn name(&mut self, node: &ExprLoc, span: Span, name: &NameRef, depth: usize) -> Self::ExprRet;
    fn builtintype(&mut self, node: &ExprLoc, span: Span, builtin: Builtin, depth: usize) -> Self::ExprRet;
    fn binop(
        &mut self,
        node: &ExprLoc,
        span: Span,
        left: &ExprLoc,
        op: BinOpKind,
        right: &ExprLoc,
        resolved: &OpImpl,
        depth: usize,
    ) -> Self::ExprRet;
    fn boolop(
        &mut self,
        node: &ExprLoc,
        span: Span,
        op: BoolOpKind,
        values: &[ExprLoc],
        resolved: &OpImpl,
        depth: usize,
    ) -> Self::ExprRet;
    fn unaryop(
        &mut self,
        node: &ExprLoc,
        span: Span,
        op: UnaryOpKind,
        operand: &ExprLoc,
        resolved: &OpImpl,
        depth: usize,
    ) -> Self::ExprRet;
    fn compare(
        &mut self,
        node: &ExprLoc,
        span: Span,
        left: &ExprLoc,
        ops: &[CmpOpKind],
        comparators: &[ExprLoc],
        resolved: &[OpImpl],
        depth: usize,
    ) -> Self::ExprRet;
    fn call(
        &mut self,
        node: &ExprLoc,
        span: Span,
        func: &ExprLoc,
        args: &[ExprLoc],
        keywords: &[CallKeyword],
        depth: usize,
    ) -> Self::ExprRet;
    fn attribute(&mut self, node: &ExprLoc, span: Span, value: &ExprLoc, attr: StringId, depth: usize)
        -> Self::ExprRet;
    fn subscript(&mut self, node: &ExprLoc, span: Span, value: &ExprLoc, index: &ExprLoc, depth: usize)
        -> Self::ExprRet;
    fn slice(
        &mut self,
        node: &ExprLoc,
        span: Span,
        lower: Option<&ExprLoc>,
        upper: Option<&ExprLoc>,
        step: Option<&ExprLoc>,
        depth: usize,
    ) -> Self::ExprRet;
    fn lambda(&mut self, node: &ExprLoc, span: Span, func: FuncId, depth: usize) -> Self::ExprRet;
    fn ifexp(
        &mut self,
        node: &ExprLoc,
        span: Span,
        test: &ExprLoc,
        body: &ExprLoc,
        orelse: &ExprLoc,
        depth: usize,
    ) -> Self::ExprRet;
    fn listexpr(&mut self, node: &ExprLoc, span: Span, items: &[ExprLoc], depth: usize) -> Self::ExprRet;
    fn tupleexpr(&mut self, node: &ExprLoc, span: Span, items: &[ExprLoc], depth: usize) -> Self::ExprRet;
    fn setexpr(&mut self, node: &ExprLoc, span: Span, items: &[ExprLoc], depth: usize) -> Self::ExprRet;
    fn dictexpr(&mut self, node: &ExprLoc, span: Span, keys: &[ExprLoc], values: &[ExprLoc], depth: usize)
        -> Self::ExprRet;
    fn listcomp(
        &mut self,
        node: &ExprLoc,
        span: Span,
        elt: &ExprLoc,
        generators: &[Comprehension],
        depth: usize,
    ) -> Self::ExprRet;
    fn setcomp(
        &mut self,
        node: &ExprLoc,
        span: Span,
        elt: &ExprLoc,
        generators: &[Comprehension],
        depth: usize,
    ) -> Self::ExprRet;
    fn dictcomp(
        &mut self,
        node: &ExprLoc,
        span: Span,
        key: &ExprLoc,
        value: &ExprLoc,
        generators: &[Comprehension],
        depth: usize,
    ) -> Self::ExprRet;
    fn generateexpr(
        &mut self,
        node: &ExprLoc,
        span: Span,
        elt: &ExprLoc,
        generators: &[Comprehension],
        depth: usize,
    ) -> Self::ExprRet;
    fn namedexpr(&mut self, node: &ExprLoc, span: Span, target: &NameRef, value: &ExprLoc, depth: usize)
        -> Self::ExprRet;
    fn starred(&mut self, node: &ExprLoc, span: Span, value: &ExprLoc, depth: usize) -> Self::ExprRet;
    fn await_expr(&mut self, node: &ExprLoc, span: Span, value: &ExprLoc, depth: usize) -> Self::ExprRet;
    fn yield_expr(&mut self, node: &ExprLoc, span: Span, value: Option<&ExprLoc>, depth: usize) -> Self::ExprRet;
    fn yieldfrom(&mut self, node: &ExprLoc, span: Span, value: &ExprLoc, depth: usize) -> Self::ExprRet;
    fn joinedstr(&mut self, node: &ExprLoc, span: Span, parts: &[ExprLoc], depth: usize) -> Self::ExprRet;
    fn formattedvalue(
        &mut self,
        node: &ExprLoc,
        span: Span,
        value: &ExprLoc,
        format_spec: Option<StringId>,
        depth: usize,
    ) -> Self::ExprRet;
    fn arrow(&mut self, node: &ExprLoc, span: Span, params: &[ExprLoc], ret: &ExprLoc, depth: usize)
        -> Self::ExprRet;
    fn arraytype(&mut self, node: &ExprLoc, span: Span, item: &ExprLoc, depth: usize) -> Self::ExprRet;
    fn settype(&mut self, node: &ExprLoc, span: Span, item: &ExprLoc, depth: usize) -> Self::ExprRet;
    fn tupletype(&mut self, node: &ExprLoc, span: Span, items: &[ExprLoc], depth: usize) -> Self::ExprRet;
    fn dicttype(&mut self, node: &ExprLoc, span: Span, key: &ExprLoc, value: &ExprLoc, depth: usize)
        -> Self::ExprRet;
    fn classtype(&mut self, node: &ExprLoc, span: Span, class: ClassId, depth: usize) -> Self::ExprRet;

    // -- Statements --
    fn exprstmt(&mut self, node: &StmtLoc, span: Span, value: &ExprLoc, depth: usize) -> Self::StmtRet;
    fn assign(&mut self, node: &StmtLoc, span: Span, targets: &[ExprLoc], value: &ExprLoc, depth: usize)
        -> Self::StmtRet;
    fn augassign(
        &mut self,
        node: &StmtLoc,
        span: Span,
        target: &ExprLoc,
        op: BinOpKind,
        value: &ExprLoc,
        resolved: &OpImpl,
        depth: usize,
    ) -> Self::StmtRet;
    fn annassign(
        &mut self,
        node: &StmtLoc,
        span: Span,
        target: &ExprLoc,
        annotation: &ExprLoc,
        value: Option<&ExprLoc>,
        depth: usize,
    ) -> Self::StmtRet;
    fn returnstmt(&mut self, node: &StmtLoc, span: Span, value: Option<&ExprLoc>, depth: usize) -> Self::StmtRet;
    fn deletestmt(&mut self, node: &StmtLoc, span: Span, targets: &[ExprLoc], depth: usize) -> Self::StmtRet;
    fn pass(&mut self, node: &StmtLoc, span: Span, depth: usize) -> Self::StmtRet;
    fn breakstmt(&mut self, node: &StmtLoc, span: Span, depth: usize) -> Self::StmtRet;
    fn continuestmt(&mut self, node: &StmtLoc, span: Span, depth: usize) -> Self::StmtRet;
    fn functiondef(&mut self, node: &StmtLoc, span: Span, func: FuncId, depth: usize) -> Self::StmtRet;
    fn classdef(&mut self, node: &StmtLoc, span: Span, class: ClassId, depth: usize) -> Self::StmtRet;
    fn ifstmt(
        &mut self,
        node: &StmtLoc,
        span: Span,
        tests: &[ExprLoc],
        bodies: &[Vec<StmtLoc>],
        orelse: &[StmtLoc],
        depth: usize,
    ) -> Self::StmtRet;
    fn whilestmt(
        &mut self,
        node: &StmtLoc,
        span: Span,
        test: &ExprLoc,
        body: &[StmtLoc],
        orelse: &[StmtLoc],
        depth: usize,
    ) -> Self::StmtRet;
    fn forstmt(
        &mut self,
        node: &StmtLoc,
        span: Span,
        target: &ExprLoc,
        iter: &ExprLoc,
        body: &[StmtLoc],
        orelse: &[StmtLoc],
        depth: usize,
    ) -> Self::StmtRet;
    fn with(&mut self, node: &StmtLoc, span: Span, items: &[WithItem], body: &[StmtLoc], depth: usize)
        -> Self::StmtRet;
    fn raise(
        &mut self,
        node: &StmtLoc,
        span: Span,
        exc: Option<&ExprLoc>,
        cause: Option<&ExprLoc>,
        depth: usize,
    ) -> Self::StmtRet;
    fn trystmt(
        &mut self,
        node: &StmtLoc,
        span: Span,
        body: &[StmtLoc],
        handlers: &[ExceptHandler],
        orelse: &[StmtLoc],
        finalbody: &[StmtLoc],
        depth: usize,
    ) -> Self::StmtRet;
    fn assertstmt(&mut self, node: &StmtLoc, span: Span, test: &ExprLoc, msg: Option<&ExprLoc>, depth: usize)
        -> Self::StmtRet;
    fn import(&mut self, node: &StmtLoc, span: Span, names: &[ImportAlias], depth: usize) -> Self::StmtRet;
    fn importfrom(
        &mut self,
        node: &StmtLoc,
        span: Span,
        module: &[StringId],
        names: &[ImportAlias],
        depth: usize,
    ) -> Self::StmtRet;
    fn global(&mut self, node: &StmtLoc, span: Span, names: &[StringId], depth: usize) -> Self::StmtRet;
    fn nonlocal(&mut self, node: &StmtLoc, span: Span, names: &[StringId], depth: usize) -> Self::StmtRet;
    fn match_stmt(&mut self, node: &StmtLoc, span: Span, subject: &ExprLoc, cases: &[MatchCase], depth: usize)
        -> Self::StmtRet;
    fn inline(&mut self, node: &StmtLoc, span: Span, body: &[StmtLoc], depth: usize) -> Self::StmtRet;

    // -- Patterns --
    fn matchvalue(&mut self, node: &PatternLoc, span: Span, value: &ExprLoc, depth: usize) -> Self::PatRet;
    fn matchsingleton(&mut self, node: &PatternLoc, span: Span, value: ConstValue, depth: usize) -> Self::PatRet;
    fn matchsequence(&mut self, node: &PatternLoc, span: Span, patterns: &[PatternLoc], depth: usize)
        -> Self::PatRet;
    fn matchmapping(
        &mut self,
        node: &PatternLoc,
        span: Span,
        keys: &[ExprLoc],
        patterns: &[PatternLoc],
        rest: Option<&NameRef>,
        depth: usize,
    ) -> Self::PatRet;
    fn matchclass(
        &mut self,
        node: &PatternLoc,
        span: Span,
        cls: &ExprLoc,
        patterns: &[PatternLoc],
        kwd_attrs: &[StringId],
        kwd_patterns: &[PatternLoc],
        depth: usize,
    ) -> Self::PatRet;
    fn matchstar(&mut self, node: &PatternLoc, span: Span, name: Option<&NameRef>, depth: usize) -> Self::PatRet;
    fn matchas(
        &mut self,
        node: &PatternLoc,
        span: Span,
        pattern: Option<&PatternLoc>,
        name: Option<&NameRef>,
        depth: usize,
    ) -> Self::PatRet;
    fn matchor(&mut self, node: &PatternLoc, span: Span, patterns: &[PatternLoc], depth: usize) -> Self::PatRet;
}
