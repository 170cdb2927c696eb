//! Semantic analysis: name resolution, scope construction, type inference,
//! and operator resolution.
//!
//! Sema walks the AST with a [`Bindings`] vector in hand, annotating
//! expression nodes with types, resolving every name to a varid, and
//! resolving operators to either a native intrinsic or a user-defined
//! dunder method. Errors are collected and analysis keeps going, so one
//! file produces all of its diagnostics in a single run.
//!
//! The pass is two-phase at module level: a forward pass introduces
//! top-level functions and classes (and resolves their signatures) before
//! any body is typed, so mutual references check out.

use ahash::{AHashMap, AHashSet};

use crate::ast::{
    Capture, ClassId, ConstValue, Expr, ExprLoc, FuncId, Module, NameRef, NameScope, OpImpl, Pattern, PatternLoc,
    Stmt, StmtLoc,
};
use crate::bindings::{seed_builtins, Bindings};
use crate::diag::{DiagKind, Diagnostic};
use crate::exc::ExcKind;
use crate::intern::{Interner, StaticStr, StringId};
use crate::ops::{BinOpKind, CmpOpKind, UnaryOpKind};
use crate::token::Span;
use crate::types::{
    assignable, dunder_for_binop, dunder_for_cmp, dunder_for_unary, inplace_dunder_for_binop, native_binop,
    native_boolop, native_cmp, native_unary, reflected_dunder_for_binop, unify, Builtin, BuiltinFn, Ty, TyPrim,
};
use crate::value::Value;

const MAX_SEMA_DEPTH: usize = 256;

/// Runs semantic analysis over a parsed module.
///
/// Returns the collected diagnostics; the module is annotated in place and
/// is usable by downstream tools even when diagnostics are present.
pub fn analyze(module: &mut Module, interner: &mut Interner) -> Vec<Diagnostic> {
    let mut sema = Sema {
        module,
        interner,
        bindings: Bindings::new(),
        scopes: Vec::new(),
        return_tys: Vec::new(),
        diagnostics: Vec::new(),
    };
    sema.run();
    sema.diagnostics
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScopeKind {
    Module,
    Function,
    /// Visibility-only scope; slots are owned by the enclosing function or
    /// module scope.
    Comprehension,
}

/// Per-scope analysis state; the identifier → varid map lives here.
struct ScopeInfo {
    kind: ScopeKind,
    names: AHashMap<StringId, u32>,
    types: AHashMap<StringId, Ty>,
    /// Values known statically: functions, classes, builtins.
    values: AHashMap<StringId, Value>,
    /// Names with a declared (annotated) type; assignments must conform.
    declared: AHashSet<StringId>,
    next_slot: u32,
    globals: AHashSet<StringId>,
    /// `nonlocal` names resolved to a local cell slot.
    nonlocal_slots: AHashMap<StringId, u32>,
    /// Locals of this scope that nested functions rebind through `nonlocal`.
    cell_names: AHashSet<StringId>,
    cell_slots: Vec<u32>,
    captures: Vec<Capture>,
    /// Free names already given a snapshot slot in this scope.
    captured: AHashMap<StringId, u32>,
    is_generator: bool,
}

impl ScopeInfo {
    fn new(kind: ScopeKind) -> Self {
        Self {
            kind,
            names: AHashMap::new(),
            types: AHashMap::new(),
            values: AHashMap::new(),
            declared: AHashSet::new(),
            next_slot: 0,
            globals: AHashSet::new(),
            nonlocal_slots: AHashMap::new(),
            cell_names: AHashSet::new(),
            cell_slots: Vec::new(),
            captures: Vec::new(),
            captured: AHashMap::new(),
            is_generator: false,
        }
    }
}

struct Sema<'m, 'i> {
    module: &'m mut Module,
    interner: &'i mut Interner,
    bindings: Bindings,
    scopes: Vec<ScopeInfo>,
    /// Declared return types of the function scopes currently open.
    return_tys: Vec<Ty>,
    diagnostics: Vec<Diagnostic>,
}

impl Sema<'_, '_> {
    fn run(&mut self) {
        // Module scope owns the builtin prefix of the binding vector.
        let mut scope = ScopeInfo::new(ScopeKind::Module);
        seed_builtins(&mut self.bindings, self.interner);
        for index in 0..self.bindings.len() {
            let binding = self.bindings.get(index);
            scope.names.insert(binding.name, index as u32);
            scope.types.insert(binding.name, binding.ty.clone());
            scope.values.insert(binding.name, binding.value);
        }
        scope.next_slot = self.bindings.len() as u32;
        self.scopes.push(scope);
        let builtin_count = self.bindings.len() as u32;

        let mut body = std::mem::take(&mut self.module.body);

        // Forward pass: introduce top-level names, then resolve class
        // layouts and callable signatures so bodies can reference them in
        // any order.
        self.forward_introduce(&mut body);
        self.forward_signatures(&body);

        // Main pass.
        self.body(&mut body, 0);

        self.module.body = body;
        let scope = self.scopes.pop().expect("module scope is open");
        self.module.module_nlocals = scope.next_slot - builtin_count;
    }

    fn error(&mut self, kind: DiagKind, message: impl Into<String>, span: Span) {
        self.diagnostics.push(Diagnostic::new(kind, message, span));
    }

    // -- Forward pass --

    fn forward_introduce(&mut self, body: &mut [StmtLoc]) {
        for stmt in body.iter_mut() {
            match &mut stmt.stmt {
                Stmt::FunctionDef(fid) => {
                    let fid = *fid;
                    let name = self.module.func(fid).name;
                    let (scope, slot) = self.introduce(name, Ty::Unknown, Some(Value::Function(fid)), false);
                    let mut binding = NameRef::new(name);
                    binding.resolve(scope, slot);
                    self.module.functions[fid.index()].binding = Some(binding);
                    if name == StaticStr::Main.id() {
                        self.module.main = Some(fid);
                    }
                }
                Stmt::ClassDef(cid) => {
                    let cid = *cid;
                    let name = self.module.class(cid).name;
                    let (scope, slot) =
                        self.introduce(name, Ty::Type(Box::new(Ty::Class(cid))), Some(Value::Class(cid)), false);
                    let mut binding = NameRef::new(name);
                    binding.resolve(scope, slot);
                    self.module.classes[cid.index()].binding = Some(binding);
                }
                _ => {}
            }
        }
    }

    fn forward_signatures(&mut self, body: &[StmtLoc]) {
        // Class layouts first: function signatures may name classes.
        for stmt in body {
            if let Stmt::ClassDef(cid) = stmt.stmt {
                self.resolve_class_layout(cid);
            }
        }
        for stmt in body {
            match stmt.stmt {
                Stmt::FunctionDef(fid) => {
                    self.resolve_signature(fid, None);
                    let arrow = self.signature_arrow(fid);
                    let name = self.module.func(fid).name;
                    self.update_type(name, arrow);
                }
                Stmt::ClassDef(cid) => {
                    let method_ids: Vec<FuncId> = self.module.class(cid).methods.values().copied().collect();
                    for fid in method_ids {
                        self.resolve_signature(fid, Some(cid));
                    }
                }
                _ => {}
            }
        }
    }

    fn signature_arrow(&self, fid: FuncId) -> Ty {
        let func = self.module.func(fid);
        Ty::Arrow {
            params: func.param_tys.clone(),
            ret: Box::new(func.return_ty.clone()),
        }
    }

    /// Resolves parameter and return annotations into `param_tys` /
    /// `return_ty`, and pre-scans for `yield`.
    fn resolve_signature(&mut self, fid: FuncId, self_class: Option<ClassId>) {
        let mut args = std::mem::take(&mut self.module.functions[fid.index()].args);
        let mut returns = std::mem::take(&mut self.module.functions[fid.index()].returns);

        let mut param_tys = Vec::new();
        let param_count = args.args.len();
        for (i, param) in args
            .args
            .iter_mut()
            .chain(args.vararg.iter_mut())
            .chain(args.kwonly_args.iter_mut())
            .chain(args.kwarg.iter_mut())
            .enumerate()
        {
            let ty = match &mut param.annotation {
                Some(ann) => self.resolve_type_expr(ann, 0),
                None => {
                    if i == 0 && param_count > 0 && self_class.is_some() {
                        Ty::Class(self_class.expect("checked is_some"))
                    } else {
                        Ty::Unknown
                    }
                }
            };
            param_tys.push(ty);
        }
        let return_ty = match &mut returns {
            Some(ann) => self.resolve_type_expr(ann, 0),
            None => Ty::Unknown,
        };

        let func = &mut self.module.functions[fid.index()];
        func.args = args;
        func.returns = returns;
        func.param_tys = param_tys;
        func.return_ty = return_ty;
        func.is_generator = body_contains_yield(&func.body);
    }

    /// Resolves base classes and attribute annotations of a class.
    fn resolve_class_layout(&mut self, cid: ClassId) {
        let mut bases = std::mem::take(&mut self.module.classes[cid.index()].bases);
        for base in bases.iter_mut() {
            let ty = self.expr(base, 0);
            match ty {
                Ty::Type(inner) => match *inner {
                    Ty::Class(base_id) => {
                        self.module.classes[cid.index()].base_class = Some(base_id);
                        let inherited = self.module.class(base_id).exc_base;
                        if inherited.is_some() {
                            self.module.classes[cid.index()].exc_base = inherited;
                        }
                    }
                    Ty::Exc(kind) => {
                        self.module.classes[cid.index()].exc_base = Some(kind);
                    }
                    _ => self.error(DiagKind::TypeError, "invalid base class", base.span),
                },
                Ty::Unknown => {}
                _ => self.error(DiagKind::TypeError, "invalid base class", base.span),
            }
        }
        self.module.classes[cid.index()].bases = bases;

        let mut attrs = std::mem::take(&mut self.module.classes[cid.index()].attrs);
        for attr in attrs.values_mut() {
            let declared = match &mut attr.annotation {
                Some(ann) => self.resolve_type_expr(ann, 0),
                None => Ty::Unknown,
            };
            let default_ty = match &mut attr.default {
                Some(default) => self.expr(default, 0),
                None => Ty::Unknown,
            };
            if let Some(default) = &attr.default {
                if !declared.is_unknown() && !assignable(&default_ty, &declared, self.module) {
                    let expected = declared.render(self.module, self.interner);
                    let found = default_ty.render(self.module, self.interner);
                    self.error(
                        DiagKind::TypeError,
                        format!("expected {expected}, found {found}"),
                        default.span,
                    );
                }
            }
            attr.ty = if declared.is_unknown() { default_ty } else { declared };
        }
        self.module.classes[cid.index()].attrs = attrs;
    }

    // -- Scope plumbing --

    fn current(&mut self) -> &mut ScopeInfo {
        self.scopes.last_mut().expect("a scope is always open")
    }

    /// The scope that owns slots for the current scope (skips comprehension
    /// visibility scopes).
    fn owner_index(&self) -> usize {
        let mut i = self.scopes.len() - 1;
        while self.scopes[i].kind == ScopeKind::Comprehension {
            i -= 1;
        }
        i
    }

    /// Introduces or updates a binding in the current scope, honoring
    /// `global` declarations. Returns the resolved scope and varid.
    fn introduce(&mut self, name: StringId, ty: Ty, value: Option<Value>, declared: bool) -> (NameScope, u32) {
        let current = self.scopes.len() - 1;
        let target = if self.scopes[current].globals.contains(&name) {
            0
        } else if let Some(&slot) = self.scopes[current].nonlocal_slots.get(&name) {
            self.scopes[current].types.insert(name, ty);
            return (NameScope::Cell, slot);
        } else {
            self.owner_index()
        };

        // Comprehension scopes register visibility locally but own no slots.
        let visibility = if target == 0 { 0 } else { current };

        if let Some(&slot) = self.scopes[visibility].names.get(&name).or_else(|| {
            // A name introduced before this comprehension scope opened.
            self.scopes[target].names.get(&name)
        }) {
            let scope_info = &mut self.scopes[visibility];
            scope_info.types.insert(name, ty.clone());
            if let Some(v) = value {
                scope_info.values.insert(name, v);
            }
            if declared {
                scope_info.declared.insert(name);
            }
            if target == 0 {
                self.bindings.set_type(slot as usize, ty);
                return (NameScope::Global, slot);
            }
            let scope = if self.scopes[target].cell_names.contains(&name) {
                NameScope::Cell
            } else {
                NameScope::Local
            };
            return (scope, slot);
        }

        let slot = self.scopes[target].next_slot;
        self.scopes[target].next_slot += 1;
        if target == 0 {
            let index = self.bindings.add(name, value.unwrap_or(Value::Undefined), ty.clone());
            debug_assert_eq!(index as u32, slot, "module varids are dense");
        }
        let is_cell = self.scopes[target].cell_names.contains(&name);
        if is_cell {
            self.scopes[target].cell_slots.push(slot);
        }
        let scope_info = &mut self.scopes[visibility];
        scope_info.names.insert(name, slot);
        scope_info.types.insert(name, ty);
        if let Some(v) = value {
            scope_info.values.insert(name, v);
        }
        if declared {
            scope_info.declared.insert(name);
        }
        if target == 0 {
            (NameScope::Global, slot)
        } else if is_cell {
            (NameScope::Cell, slot)
        } else {
            (NameScope::Local, slot)
        }
    }

    fn update_type(&mut self, name: StringId, ty: Ty) {
        let current = self.current();
        current.types.insert(name, ty.clone());
        if current.kind == ScopeKind::Module {
            if let Some(&slot) = current.names.get(&name) {
                self.bindings.set_type(slot as usize, ty);
            }
        }
    }

    /// Resolves a name in load context: the current scope chain, with
    /// closure captures materialized on the way.
    fn resolve_load(&mut self, name: StringId) -> Option<(NameScope, u32, Ty, Option<Value>)> {
        let top = self.scopes.len() - 1;

        if self.scopes[top].globals.contains(&name) {
            let scope = &self.scopes[0];
            let slot = *scope.names.get(&name)?;
            let ty = scope.types.get(&name).cloned().unwrap_or_default();
            let value = scope.values.get(&name).copied();
            return Some((NameScope::Global, slot, ty, value));
        }
        if let Some(&slot) = self.scopes[top].nonlocal_slots.get(&name) {
            let ty = self.scopes[top].types.get(&name).cloned().unwrap_or_default();
            return Some((NameScope::Cell, slot, ty, None));
        }

        let mut found = None;
        for i in (0..=top).rev() {
            if self.scopes[i].names.contains_key(&name) {
                found = Some(i);
                break;
            }
        }
        let found = found?;
        let slot = self.scopes[found].names[&name];
        let ty = self.scopes[found].types.get(&name).cloned().unwrap_or_default();
        let value = self.scopes[found].values.get(&name).copied();

        if found == 0 {
            return Some((NameScope::Global, slot, ty, value));
        }

        // Same frame: the name lives in the current function (possibly seen
        // through comprehension scopes).
        let owner = self.owner_frame_of(found);
        let current_owner = self.owner_frame_of(top);
        if owner == current_owner {
            let scope = if self.scopes[owner].cell_names.contains(&name) {
                NameScope::Cell
            } else {
                NameScope::Local
            };
            return Some((scope, slot, ty, value));
        }

        // Free variable: thread a snapshot capture through every function
        // frame between the defining one and the current one.
        let is_cell = self.scopes[owner].cell_names.contains(&name);
        let mut source_slot = slot;
        let mut source_scope = if is_cell { NameScope::Cell } else { NameScope::Local };
        let mut frames: Vec<usize> = Vec::new();
        for i in (owner + 1)..=top {
            if self.scopes[i].kind == ScopeKind::Function {
                frames.push(i);
            }
        }
        let mut last_slot = source_slot;
        for frame in frames {
            if let Some(&existing) = self.scopes[frame].captured.get(&name) {
                last_slot = existing;
                source_slot = existing;
                continue;
            }
            let target_slot = self.scopes[frame].next_slot;
            self.scopes[frame].next_slot += 1;
            self.scopes[frame].captures.push(Capture {
                target_slot,
                source_slot,
                source_scope,
            });
            self.scopes[frame].captured.insert(name, target_slot);
            self.scopes[frame].types.insert(name, ty.clone());
            source_slot = target_slot;
            source_scope = if is_cell { NameScope::Cell } else { NameScope::Local };
            last_slot = target_slot;
        }
        let scope = if is_cell { NameScope::Cell } else { NameScope::Local };
        Some((scope, last_slot, ty, value))
    }

    /// Nearest non-comprehension scope at or below `i`.
    fn owner_frame_of(&self, i: usize) -> usize {
        let mut j = i;
        while self.scopes[j].kind == ScopeKind::Comprehension {
            j -= 1;
        }
        j
    }

    fn lookup_type(&self, name: StringId) -> Option<Ty> {
        for scope in self.scopes.iter().rev() {
            if let Some(ty) = scope.types.get(&name) {
                return Some(ty.clone());
            }
        }
        None
    }

    fn lookup_value(&self, name: StringId) -> Option<Value> {
        for scope in self.scopes.iter().rev() {
            if scope.names.contains_key(&name) {
                return scope.values.get(&name).copied();
            }
        }
        None
    }

    // -- Statements --

    fn body(&mut self, body: &mut [StmtLoc], depth: usize) {
        for stmt in body.iter_mut() {
            self.stmt(stmt, depth);
        }
    }

    fn stmt(&mut self, stmt: &mut StmtLoc, depth: usize) {
        if depth >= MAX_SEMA_DEPTH {
            self.error(DiagKind::SyntaxError, "statement nesting too deep", stmt.span);
            return;
        }
        let span = stmt.span;
        match &mut stmt.stmt {
            Stmt::Expr(value) => {
                self.expr(value, depth + 1);
            }
            Stmt::Assign { targets, value } => {
                let vty = self.expr(value, depth + 1);
                for target in targets.iter_mut() {
                    self.assign_target(target, &vty, depth + 1);
                }
            }
            Stmt::AugAssign {
                target,
                op,
                value,
                resolved,
            } => {
                let op = *op;
                let tty = self.expr(target, depth + 1);
                let vty = self.expr(value, depth + 1);
                let (op_impl, result) = self.resolve_binop(op, &tty, &vty, span, true);
                *resolved = op_impl;
                if let Expr::Name(name) = &mut target.expr {
                    let name = *name;
                    self.check_declared(&name, &result, span);
                    self.update_type(name.name, result);
                }
            }
            Stmt::AnnAssign {
                target,
                annotation,
                value,
            } => {
                let declared = self.resolve_type_expr(annotation, depth + 1);
                let vty = value.as_deref_mut().map(|v| self.expr(v, depth + 1));
                if let Some(vty) = &vty {
                    if !assignable(vty, &declared, self.module) {
                        let expected = declared.render(self.module, self.interner);
                        let found = vty.render(self.module, self.interner);
                        self.error(DiagKind::TypeError, format!("expected {expected}, found {found}"), span);
                    }
                }
                if let Expr::Name(name) = &mut target.expr {
                    let (scope, slot) = self.introduce(name.name, declared.clone(), None, true);
                    name.resolve(scope, slot);
                    target.resolved_type = Some(declared);
                } else {
                    self.assign_target(target, &declared, depth + 1);
                }
            }
            Stmt::Return(value) => {
                let vty = match value {
                    Some(v) => self.expr(v, depth + 1),
                    None => Ty::None,
                };
                if let Some(expected) = self.return_tys.last().cloned() {
                    if !expected.is_unknown() && !assignable(&vty, &expected, self.module) {
                        let expected = expected.render(self.module, self.interner);
                        let found = vty.render(self.module, self.interner);
                        self.error(
                            DiagKind::TypeError,
                            format!("return type mismatch: expected {expected}, found {found}"),
                            span,
                        );
                    }
                }
            }
            Stmt::Delete(targets) => {
                for target in targets.iter_mut() {
                    self.expr(target, depth + 1);
                }
            }
            Stmt::Pass | Stmt::Break | Stmt::Continue => {}
            Stmt::FunctionDef(fid) => {
                let fid = *fid;
                self.function_def(fid, span);
            }
            Stmt::ClassDef(cid) => {
                let cid = *cid;
                self.class_def(cid, span);
            }
            Stmt::If { tests, bodies, orelse } => {
                for test in tests.iter_mut() {
                    self.expr(test, depth + 1);
                }
                for body in bodies.iter_mut() {
                    self.body(body, depth + 1);
                }
                self.body(orelse, depth + 1);
            }
            Stmt::While { test, body, orelse } => {
                self.expr(test, depth + 1);
                self.body(body, depth + 1);
                self.body(orelse, depth + 1);
            }
            Stmt::For {
                target,
                iter,
                body,
                orelse,
            } => {
                let ity = self.expr(iter, depth + 1);
                let elem = element_type(&ity);
                self.assign_target(target, &elem, depth + 1);
                self.body(body, depth + 1);
                self.body(orelse, depth + 1);
            }
            Stmt::With { items, body } => {
                for item in items.iter_mut() {
                    let cty = self.expr(&mut item.context_expr, depth + 1);
                    if let Some(var) = &mut item.optional_vars {
                        let enter_ty = self.enter_result_type(&cty);
                        let (scope, slot) = self.introduce(var.name, enter_ty, None, false);
                        var.resolve(scope, slot);
                    }
                }
                self.body(body, depth + 1);
            }
            Stmt::Raise { exc, cause } => {
                if let Some(exc) = exc {
                    self.expr(exc, depth + 1);
                }
                if let Some(cause) = cause {
                    self.expr(cause, depth + 1);
                }
            }
            Stmt::Try {
                body,
                handlers,
                orelse,
                finalbody,
            } => {
                self.body(body, depth + 1);
                for handler in handlers.iter_mut() {
                    let hty = match &mut handler.exc_type {
                        Some(t) => self.expr(t, depth + 1),
                        None => Ty::Unknown,
                    };
                    if let Some(name) = &mut handler.name {
                        let bound = match hty {
                            Ty::Type(inner) => *inner,
                            _ => Ty::Unknown,
                        };
                        let (scope, slot) = self.introduce(name.name, bound, None, false);
                        name.resolve(scope, slot);
                    }
                    self.body(&mut handler.body, depth + 1);
                }
                self.body(orelse, depth + 1);
                self.body(finalbody, depth + 1);
            }
            Stmt::Assert { test, msg } => {
                self.expr(test, depth + 1);
                if let Some(msg) = msg {
                    self.expr(msg, depth + 1);
                }
            }
            Stmt::Import { names } => {
                for alias in names.iter_mut() {
                    let dotted = self.render_path(&alias.path);
                    self.error(
                        DiagKind::ModuleNotFoundError,
                        format!("no module named '{dotted}'"),
                        span,
                    );
                    let (scope, slot) = self.introduce(alias.binding.name, Ty::Unknown, None, false);
                    alias.binding.resolve(scope, slot);
                }
            }
            Stmt::ImportFrom { module, names } => {
                let dotted = self.render_path(module);
                self.error(
                    DiagKind::ModuleNotFoundError,
                    format!("no module named '{dotted}'"),
                    span,
                );
                for alias in names.iter_mut() {
                    let (scope, slot) = self.introduce(alias.binding.name, Ty::Unknown, None, false);
                    alias.binding.resolve(scope, slot);
                }
            }
            Stmt::Global(names) => {
                let names = names.clone();
                for name in names {
                    self.current().globals.insert(name);
                }
            }
            Stmt::Nonlocal(names) => {
                let names = names.clone();
                for name in names {
                    self.declare_nonlocal(name, span);
                }
            }
            Stmt::Match { subject, cases } => {
                let sty = self.expr(subject, depth + 1);
                for case in cases.iter_mut() {
                    self.pattern(&mut case.pattern, &sty, depth + 1);
                    if let Some(guard) = &mut case.guard {
                        self.expr(guard, depth + 1);
                    }
                    self.body(&mut case.body, depth + 1);
                }
            }
            Stmt::Inline(body) => self.body(body, depth + 1),
        }
    }

    fn render_path(&self, path: &[StringId]) -> String {
        path.iter().map(|id| self.interner.get(*id)).collect::<Vec<_>>().join(".")
    }

    fn check_declared(&mut self, name: &NameRef, vty: &Ty, span: Span) {
        let declared = self.scopes.iter().rev().any(|s| s.declared.contains(&name.name));
        if declared {
            if let Some(expected) = self.lookup_type(name.name) {
                if !expected.is_unknown() && !assignable(vty, &expected, self.module) {
                    let expected = expected.render(self.module, self.interner);
                    let found = vty.render(self.module, self.interner);
                    self.error(DiagKind::TypeError, format!("expected {expected}, found {found}"), span);
                }
            }
        }
    }

    fn declare_nonlocal(&mut self, name: StringId, span: Span) {
        let top = self.scopes.len() - 1;
        let mut found = None;
        for i in (1..top).rev() {
            if self.scopes[i].kind == ScopeKind::Function && self.scopes[i].names.contains_key(&name) {
                found = Some(i);
                break;
            }
        }
        let Some(defining) = found else {
            let text = self.interner.get(name).to_owned();
            self.error(
                DiagKind::SyntaxError,
                format!("no binding for nonlocal '{text}' found"),
                span,
            );
            return;
        };
        // The defining scope's pre-scan has already marked this local as a
        // cell; missing it here means the pre-scan and this walk disagree.
        debug_assert!(
            self.scopes[defining].cell_names.contains(&name),
            "nonlocal target was not marked as a cell"
        );

        let ty = self.scopes[defining].types.get(&name).cloned().unwrap_or_default();
        let mut source_slot = self.scopes[defining].names[&name];
        for i in (defining + 1)..=top {
            if self.scopes[i].kind != ScopeKind::Function {
                continue;
            }
            if let Some(&existing) = self.scopes[i].captured.get(&name) {
                source_slot = existing;
                continue;
            }
            let target_slot = self.scopes[i].next_slot;
            self.scopes[i].next_slot += 1;
            self.scopes[i].captures.push(Capture {
                target_slot,
                source_slot,
                source_scope: NameScope::Cell,
            });
            self.scopes[i].captured.insert(name, target_slot);
            self.scopes[i].types.insert(name, ty.clone());
            source_slot = target_slot;
        }
        let top_scope = self.current();
        top_scope.nonlocal_slots.insert(name, source_slot);
        top_scope.types.insert(name, ty);
    }

    // -- Definitions --

    fn function_def(&mut self, fid: FuncId, span: Span) {
        // Nested defs resolve their signature on the spot; top-level ones
        // were handled by the forward pass.
        if self.module.func(fid).binding.is_none() {
            self.resolve_signature(fid, None);
            let name = self.module.func(fid).name;
            let arrow = self.signature_arrow(fid);
            let (scope, slot) = self.introduce(name, arrow, Some(Value::Function(fid)), false);
            let mut binding = NameRef::new(name);
            binding.resolve(scope, slot);
            self.module.functions[fid.index()].binding = Some(binding);
        } else {
            let name = self.module.func(fid).name;
            let arrow = self.signature_arrow(fid);
            self.update_type(name, arrow);
        }

        let mut decorators = std::mem::take(&mut self.module.functions[fid.index()].decorators);
        for dec in decorators.iter_mut() {
            self.expr(dec, 0);
        }
        self.module.functions[fid.index()].decorators = decorators;

        self.analyze_callable_body(fid, None, span);
    }

    fn class_def(&mut self, cid: ClassId, span: Span) {
        if self.module.class(cid).binding.is_none() {
            let name = self.module.class(cid).name;
            let (scope, slot) =
                self.introduce(name, Ty::Type(Box::new(Ty::Class(cid))), Some(Value::Class(cid)), false);
            let mut binding = NameRef::new(name);
            binding.resolve(scope, slot);
            self.module.classes[cid.index()].binding = Some(binding);
            self.resolve_class_layout(cid);
            let method_ids: Vec<FuncId> = self.module.class(cid).methods.values().copied().collect();
            for fid in method_ids {
                self.resolve_signature(fid, Some(cid));
            }
        }

        let mut decorators = std::mem::take(&mut self.module.classes[cid.index()].decorators);
        for dec in decorators.iter_mut() {
            self.expr(dec, 0);
        }
        self.module.classes[cid.index()].decorators = decorators;

        let method_ids: Vec<FuncId> = self.module.class(cid).methods.values().copied().collect();
        for fid in method_ids {
            self.analyze_callable_body(fid, Some(cid), span);
        }
        let nested_ids: Vec<ClassId> = self.module.class(cid).nested.values().copied().collect();
        for nested in nested_ids {
            self.class_def(nested, span);
        }
    }

    /// Analyzes a function or method body in a fresh function scope.
    fn analyze_callable_body(&mut self, fid: FuncId, _self_class: Option<ClassId>, span: Span) {
        // Default expressions evaluate in the enclosing scope; resolve
        // their names before the function scope opens.
        let mut args = std::mem::take(&mut self.module.functions[fid.index()].args);
        for param in args.args.iter_mut().chain(args.kwonly_args.iter_mut()) {
            if let Some(default) = &mut param.default {
                self.expr(default, 0);
            }
        }
        self.module.functions[fid.index()].args = args;

        let mut cell_names = AHashSet::new();
        collect_nonlocal_names(self.module, &self.module.func(fid).body, &mut cell_names);

        let mut scope = ScopeInfo::new(ScopeKind::Function);
        scope.cell_names = cell_names;
        self.scopes.push(scope);
        self.return_tys.push(self.module.func(fid).return_ty.clone());

        // Parameters take the first slots, in binding order.
        let params: Vec<(StringId, Ty)> = {
            let func = self.module.func(fid);
            func.args
                .all()
                .map(|p| p.name)
                .zip(func.param_tys.iter().cloned())
                .collect()
        };
        for (name, ty) in params {
            self.introduce(name, ty, None, false);
        }

        let mut body = std::mem::take(&mut self.module.functions[fid.index()].body);
        self.body(&mut body, 0);
        self.module.functions[fid.index()].body = body;

        self.return_tys.pop();
        let scope = self.scopes.pop().expect("function scope is open");
        let func = &mut self.module.functions[fid.index()];
        func.nlocals = scope.next_slot;
        func.cell_slots = scope.cell_slots;
        func.captures = scope.captures;
        if scope.is_generator && !func.is_generator {
            func.is_generator = true;
        }
        let _ = span;
    }

    fn enter_result_type(&mut self, cty: &Ty) -> Ty {
        if let Ty::Class(cid) = cty {
            if let Some(fid) = self.module.find_method(*cid, StaticStr::DunderEnter.id()) {
                return self.module.func(fid).return_ty.clone();
            }
        }
        Ty::Unknown
    }

    // -- Expressions --

    fn expr(&mut self, node: &mut ExprLoc, depth: usize) -> Ty {
        if depth >= MAX_SEMA_DEPTH {
            self.error(DiagKind::SyntaxError, "expression nesting too deep", node.span);
            return Ty::Unknown;
        }
        if matches!(node.expr, Expr::Call { .. }) {
            return self.call(node, depth);
        }
        let span = node.span;
        let ty = match &mut node.expr {
            Expr::Constant(value) => value.ty(),
            Expr::BuiltinType(builtin) => match builtin {
                Builtin::Type(p) => Ty::Type(Box::new(p.as_ty())),
                Builtin::Fn(_) => Ty::Unknown,
                Builtin::Exc(kind) => Ty::Type(Box::new(Ty::Exc(*kind))),
            },
            Expr::Name(name) => {
                let name_id = name.name;
                match self.resolve_load(name_id) {
                    Some((scope, slot, ty, _)) => {
                        name.resolve(scope, slot);
                        ty
                    }
                    None => {
                        let text = self.interner.get(name_id).to_owned();
                        self.error(DiagKind::NameError, format!("{text} is not defined"), span);
                        Ty::Unknown
                    }
                }
            }
            Expr::BinOp {
                left,
                op,
                right,
                resolved,
            } => {
                let op = *op;
                let lt = self.expr(left, depth + 1);
                let rt = self.expr(right, depth + 1);
                let (op_impl, ty) = self.resolve_binop(op, &lt, &rt, span, false);
                *resolved = op_impl;
                ty
            }
            Expr::BoolOp { op, values, resolved } => {
                let op = *op;
                let tys: Vec<Ty> = values.iter_mut().map(|v| self.expr(v, depth + 1)).collect();
                let (intr, ty) = native_boolop(op, &tys);
                *resolved = OpImpl::Native(intr);
                ty
            }
            Expr::UnaryOp { op, operand, resolved } => {
                let op = *op;
                let ot = self.expr(operand, depth + 1);
                let (op_impl, ty) = self.resolve_unaryop(op, &ot, span);
                *resolved = op_impl;
                ty
            }
            Expr::Compare {
                left,
                ops,
                comparators,
                resolved,
            } => {
                let mut prev = self.expr(left, depth + 1);
                let ops = ops.clone();
                let mut impls = Vec::with_capacity(ops.len());
                for (op, comparator) in ops.iter().zip(comparators.iter_mut()) {
                    let rt = self.expr(comparator, depth + 1);
                    impls.push(self.resolve_cmpop(*op, &prev, &rt, span));
                    prev = rt;
                }
                *resolved = impls;
                Ty::Bool
            }
            Expr::Call { .. } => unreachable!("calls dispatch before the kind match"),
            Expr::Attribute { value, attr } => {
                let attr = *attr;
                let vty = self.expr(value, depth + 1);
                self.attribute_type(&vty, attr, span)
            }
            Expr::Subscript { value, index } => {
                let vty = self.expr(value, depth + 1);
                let is_slice = matches!(index.expr, Expr::Slice { .. });
                let ity = self.expr(index, depth + 1);
                self.subscript_type(&vty, &ity, is_slice, span)
            }
            Expr::Slice { lower, upper, step } => {
                for part in [lower, upper, step].into_iter().flatten() {
                    self.expr(part, depth + 1);
                }
                Ty::Unknown
            }
            Expr::Lambda(fid) => {
                let fid = *fid;
                self.resolve_signature(fid, None);
                self.analyze_callable_body(fid, None, span);
                self.signature_arrow(fid)
            }
            Expr::IfExp { test, body, orelse } => {
                self.expr(test, depth + 1);
                let bt = self.expr(body, depth + 1);
                let ot = self.expr(orelse, depth + 1);
                unify(&bt, &ot)
            }
            Expr::ListExpr(items) => {
                let mut elem = Ty::Unknown;
                for item in items.iter_mut() {
                    let t = self.expr(item, depth + 1);
                    elem = unify(&elem, &t);
                }
                Ty::List(Box::new(elem))
            }
            Expr::TupleExpr(items) => {
                let tys: Vec<Ty> = items.iter_mut().map(|i| self.expr(i, depth + 1)).collect();
                Ty::Tuple(tys)
            }
            Expr::SetExpr(items) => {
                let mut elem = Ty::Unknown;
                for item in items.iter_mut() {
                    let t = self.expr(item, depth + 1);
                    elem = unify(&elem, &t);
                }
                Ty::Set(Box::new(elem))
            }
            Expr::DictExpr { keys, values } => {
                let mut kt = Ty::Unknown;
                let mut vt = Ty::Unknown;
                for key in keys.iter_mut() {
                    let t = self.expr(key, depth + 1);
                    kt = unify(&kt, &t);
                }
                for value in values.iter_mut() {
                    let t = self.expr(value, depth + 1);
                    vt = unify(&vt, &t);
                }
                Ty::Dict(Box::new(kt), Box::new(vt))
            }
            Expr::ListComp { elt, generators } => {
                let elem = self.comprehension(generators, elt, None, depth);
                Ty::List(Box::new(elem))
            }
            Expr::SetComp { elt, generators } => {
                let elem = self.comprehension(generators, elt, None, depth);
                Ty::Set(Box::new(elem))
            }
            Expr::GeneratorExp { elt, generators } => {
                self.comprehension(generators, elt, None, depth);
                Ty::Unknown
            }
            Expr::DictComp { key, value, generators } => {
                let kt = self.comprehension(generators, key, Some(&mut **value), depth);
                let vt = value.resolved_type.clone().unwrap_or_default();
                Ty::Dict(Box::new(kt), Box::new(vt))
            }
            Expr::NamedExpr { target, value } => {
                let vty = self.expr(value, depth + 1);
                let (scope, slot) = self.introduce(target.name, vty.clone(), None, false);
                target.resolve(scope, slot);
                vty
            }
            Expr::Starred(value) => self.expr(value, depth + 1),
            Expr::Await(value) => {
                self.expr(value, depth + 1);
                Ty::Unknown
            }
            Expr::Yield(value) => {
                self.mark_generator();
                if let Some(value) = value {
                    self.expr(value, depth + 1);
                }
                Ty::Unknown
            }
            Expr::YieldFrom(value) => {
                self.mark_generator();
                self.expr(value, depth + 1);
                Ty::Unknown
            }
            Expr::JoinedStr(parts) => {
                for part in parts.iter_mut() {
                    self.expr(part, depth + 1);
                }
                Ty::Str
            }
            Expr::FormattedValue { value, .. } => {
                self.expr(value, depth + 1);
                Ty::Str
            }
            Expr::Arrow { params, ret } => {
                let params: Vec<Ty> = params.iter_mut().map(|p| self.resolve_type_expr(p, depth + 1)).collect();
                let ret = self.resolve_type_expr(ret, depth + 1);
                Ty::Type(Box::new(Ty::Arrow {
                    params,
                    ret: Box::new(ret),
                }))
            }
            Expr::ArrayType { item } => {
                let item = self.resolve_type_expr(item, depth + 1);
                Ty::Type(Box::new(Ty::List(Box::new(item))))
            }
            Expr::SetType { item } => {
                let item = self.resolve_type_expr(item, depth + 1);
                Ty::Type(Box::new(Ty::Set(Box::new(item))))
            }
            Expr::TupleType { items } => {
                let items: Vec<Ty> = items.iter_mut().map(|i| self.resolve_type_expr(i, depth + 1)).collect();
                Ty::Type(Box::new(Ty::Tuple(items)))
            }
            Expr::DictType { key, value } => {
                let key = self.resolve_type_expr(key, depth + 1);
                let value = self.resolve_type_expr(value, depth + 1);
                Ty::Type(Box::new(Ty::Dict(Box::new(key), Box::new(value))))
            }
            Expr::ClassType(cid) => Ty::Type(Box::new(Ty::Class(*cid))),
        };
        node.resolved_type = Some(ty.clone());
        ty
    }

    fn mark_generator(&mut self) {
        for scope in self.scopes.iter_mut().rev() {
            if scope.kind == ScopeKind::Function {
                scope.is_generator = true;
                return;
            }
        }
    }

    /// Comprehension scopes: the iterable types in the enclosing scope,
    /// targets are visible only inside, slots live in the enclosing frame.
    fn comprehension(
        &mut self,
        generators: &mut [crate::ast::Comprehension],
        elt: &mut ExprLoc,
        extra: Option<&mut ExprLoc>,
        depth: usize,
    ) -> Ty {
        let mut iter_tys = Vec::new();
        for generator in generators.iter_mut() {
            // The outermost iterable is evaluated in the enclosing scope.
            iter_tys.push(self.expr(&mut generator.iter, depth + 1));
        }
        self.scopes.push(ScopeInfo::new(ScopeKind::Comprehension));
        for (generator, ity) in generators.iter_mut().zip(iter_tys) {
            let elem = element_type(&ity);
            self.assign_target(&mut generator.target, &elem, depth + 1);
            for cond in generator.ifs.iter_mut() {
                self.expr(cond, depth + 1);
            }
        }
        let elem_ty = self.expr(elt, depth + 1);
        if let Some(extra) = extra {
            self.expr(extra, depth + 1);
        }
        self.scopes.pop();
        elem_ty
    }

    /// Resolves an assignment target, introducing bindings for names.
    fn assign_target(&mut self, target: &mut ExprLoc, vty: &Ty, depth: usize) {
        let span = target.span;
        match &mut target.expr {
            Expr::Name(name) => {
                let name_copy = *name;
                self.check_declared(&name_copy, vty, span);
                let (scope, slot) = self.introduce(name.name, vty.clone(), None, false);
                name.resolve(scope, slot);
                target.resolved_type = Some(vty.clone());
            }
            Expr::TupleExpr(items) | Expr::ListExpr(items) => {
                let elem_tys: Vec<Ty> = match vty {
                    Ty::Tuple(tys) if tys.len() == items.len() => tys.clone(),
                    Ty::List(item) => vec![(**item).clone(); items.len()],
                    _ => vec![Ty::Unknown; items.len()],
                };
                for (item, ty) in items.iter_mut().zip(elem_tys) {
                    self.assign_target(item, &ty, depth + 1);
                }
            }
            Expr::Starred(inner) => {
                let ty = Ty::List(Box::new(vty.clone()));
                self.assign_target(inner, &ty, depth + 1);
            }
            Expr::Attribute { value, attr } => {
                let attr = *attr;
                let oty = self.expr(value, depth + 1);
                if let Ty::Class(cid) = &oty {
                    match self.module.find_attr(*cid, attr) {
                        Some(decl) => {
                            let expected = decl.ty.clone();
                            if !expected.is_unknown() && !assignable(vty, &expected, self.module) {
                                let expected = expected.render(self.module, self.interner);
                                let found = vty.render(self.module, self.interner);
                                self.error(
                                    DiagKind::TypeError,
                                    format!("expected {expected}, found {found}"),
                                    span,
                                );
                            }
                        }
                        None => {
                            // Assignment in `__init__` style introduces the
                            // attribute when it was not declared.
                            let class = &mut self.module.classes[cid.index()];
                            class.attrs.entry(attr).or_insert(crate::ast::ClassAttr {
                                span,
                                annotation: None,
                                default: None,
                                ty: vty.clone(),
                            });
                        }
                    }
                }
            }
            Expr::Subscript { value, index } => {
                self.expr(value, depth + 1);
                self.expr(index, depth + 1);
            }
            _ => {
                self.error(DiagKind::TypeError, "invalid assignment target", span);
            }
        }
    }

    // -- Operator resolution --

    fn resolve_binop(&mut self, op: BinOpKind, lt: &Ty, rt: &Ty, span: Span, inplace: bool) -> (OpImpl, Ty) {
        if let Some((intr, ty)) = native_binop(op, lt, rt) {
            return (OpImpl::Native(intr), ty);
        }
        if let Ty::Class(cid) = lt {
            if inplace {
                if let Some(name) = inplace_dunder_for_binop(op) {
                    if let Some(fid) = self.module.find_method(*cid, name.id()) {
                        return (OpImpl::User(fid), self.module.func(fid).return_ty.clone());
                    }
                }
            }
            if let Some(fid) = self.module.find_method(*cid, dunder_for_binop(op).id()) {
                return (OpImpl::User(fid), self.module.func(fid).return_ty.clone());
            }
        }
        // Right-handed fallback when the left operand has no implementation.
        if let Ty::Class(cid) = rt {
            if let Some(fid) = self.module.find_method(*cid, reflected_dunder_for_binop(op).id()) {
                return (OpImpl::User(fid), self.module.func(fid).return_ty.clone());
            }
        }
        if lt.is_unknown() || rt.is_unknown() {
            return (OpImpl::Unresolved, Ty::Unknown);
        }
        let l = lt.render(self.module, self.interner);
        let r = rt.render(self.module, self.interner);
        self.error(
            DiagKind::UnsupportedOperand,
            format!("unsupported operand type(s) for {}: '{l}' and '{r}'", op.symbol()),
            span,
        );
        (OpImpl::Unresolved, Ty::Unknown)
    }

    fn resolve_unaryop(&mut self, op: UnaryOpKind, ot: &Ty, span: Span) -> (OpImpl, Ty) {
        if let Some((intr, ty)) = native_unary(op, ot) {
            return (OpImpl::Native(intr), ty);
        }
        if let Ty::Class(cid) = ot {
            if let Some(name) = dunder_for_unary(op) {
                if let Some(fid) = self.module.find_method(*cid, name.id()) {
                    return (OpImpl::User(fid), self.module.func(fid).return_ty.clone());
                }
            }
        }
        if ot.is_unknown() {
            return (OpImpl::Unresolved, Ty::Unknown);
        }
        let t = ot.render(self.module, self.interner);
        self.error(
            DiagKind::UnsupportedOperand,
            format!("bad operand type for unary {}: '{t}'", op.symbol().trim_end()),
            span,
        );
        (OpImpl::Unresolved, Ty::Unknown)
    }

    fn resolve_cmpop(&mut self, op: CmpOpKind, lt: &Ty, rt: &Ty, span: Span) -> OpImpl {
        if let Some(intr) = native_cmp(op, lt, rt) {
            return OpImpl::Native(intr);
        }
        if let Ty::Class(cid) = lt {
            if let Some(name) = dunder_for_cmp(op) {
                if let Some(fid) = self.module.find_method(*cid, name.id()) {
                    return OpImpl::User(fid);
                }
            }
        }
        if lt.is_unknown() || rt.is_unknown() {
            return OpImpl::Unresolved;
        }
        let l = lt.render(self.module, self.interner);
        let r = rt.render(self.module, self.interner);
        self.error(
            DiagKind::UnsupportedOperand,
            format!("'{}' not supported between '{l}' and '{r}'", op.symbol()),
            span,
        );
        OpImpl::Unresolved
    }

    // -- Calls and attributes --

    fn call(&mut self, node: &mut ExprLoc, depth: usize) -> Ty {
        let span = node.span;
        let Expr::Call { func, args, keywords } = &mut node.expr else {
            unreachable!("call() dispatches on Expr::Call");
        };

        // Method call: type the receiver and check against the method
        // signature without binding the callee expression itself.
        if let Expr::Attribute { value, attr } = &mut func.expr {
            let attr = *attr;
            let oty = self.expr(value, depth + 1);
            let arg_tys: Vec<Ty> = args.iter_mut().map(|a| self.expr(a, depth + 1)).collect();
            for kw in keywords.iter_mut() {
                self.expr(&mut kw.value, depth + 1);
            }
            let ty = self.method_call_type(&oty, attr, &arg_tys, span);
            func.resolved_type = Some(Ty::Unknown);
            node.resolved_type = Some(ty.clone());
            return ty;
        }

        let callee = if let Expr::Name(name) = &func.expr {
            self.lookup_value(name.name)
        } else {
            None
        };
        let fty = self.expr(func, depth + 1);
        let arg_tys: Vec<Ty> = args.iter_mut().map(|a| self.expr(a, depth + 1)).collect();
        let kw_tys: Vec<(StringId, Ty)> = keywords
            .iter_mut()
            .map(|kw| {
                let ty = self.expr(&mut kw.value, depth + 1);
                (kw.name, ty)
            })
            .collect();

        let ty = match callee {
            Some(Value::Function(fid)) => {
                self.check_call_signature(fid, &arg_tys, &kw_tys, span);
                if self.module.func(fid).is_generator {
                    Ty::Unknown
                } else {
                    self.module.func(fid).return_ty.clone()
                }
            }
            Some(Value::Class(cid)) => {
                self.check_constructor(cid, &arg_tys, span);
                Ty::Class(cid)
            }
            Some(Value::Builtin(builtin)) => self.builtin_call_type(builtin, &arg_tys, span),
            _ => match &fty {
                Ty::Arrow { params, ret } => {
                    if params.len() == arg_tys.len() {
                        for (param, arg) in params.iter().zip(&arg_tys) {
                            if !assignable(arg, param, self.module) {
                                let expected = param.render(self.module, self.interner);
                                let found = arg.render(self.module, self.interner);
                                self.error(
                                    DiagKind::TypeError,
                                    format!("expected {expected}, found {found}"),
                                    span,
                                );
                            }
                        }
                    }
                    (**ret).clone()
                }
                Ty::Type(inner) => (**inner).clone(),
                _ => Ty::Unknown,
            },
        };
        node.resolved_type = Some(ty.clone());
        ty
    }

    /// Checks actual argument types against a function's signature; errors
    /// carry both signatures.
    fn check_call_signature(&mut self, fid: FuncId, arg_tys: &[Ty], kw_tys: &[(StringId, Ty)], span: Span) {
        let func = self.module.func(fid);
        let has_vararg = func.args.vararg.is_some();
        let has_kwarg = func.args.kwarg.is_some();
        let positional: Vec<(StringId, Ty, bool)> = func
            .args
            .args
            .iter()
            .enumerate()
            .map(|(i, p)| (p.name, func.param_tys[i].clone(), p.default.is_some()))
            .collect();
        let name = self.interner.get(func.name).to_owned();

        if !has_vararg && arg_tys.len() > positional.len() {
            let signature = self.render_signature(fid);
            self.error(
                DiagKind::TypeError,
                format!(
                    "{name}() takes {} positional arguments but {} were given; signature is {signature}",
                    positional.len(),
                    arg_tys.len()
                ),
                span,
            );
            return;
        }

        let mut bound: AHashSet<StringId> = AHashSet::new();
        for (i, arg) in arg_tys.iter().enumerate() {
            if i >= positional.len() {
                break;
            }
            let (pname, pty, _) = &positional[i];
            bound.insert(*pname);
            if !assignable(arg, pty, self.module) {
                let signature = self.render_signature(fid);
                let found = arg.render(self.module, self.interner);
                let expected = pty.render(self.module, self.interner);
                self.error(
                    DiagKind::TypeError,
                    format!("{name}() argument {i} expects {expected}, found {found}; signature is {signature}"),
                    span,
                );
            }
        }
        for (kw_name, kw_ty) in kw_tys {
            let func = self.module.func(fid);
            // `param_tys` is laid out as [positional..., vararg?, kwonly...].
            let kwonly_base = func.args.args.len() + usize::from(func.args.vararg.is_some());
            let param = func
                .args
                .args
                .iter()
                .position(|p| p.name == *kw_name)
                .or_else(|| {
                    func.args
                        .kwonly_args
                        .iter()
                        .position(|p| p.name == *kw_name)
                        .map(|j| kwonly_base + j)
                });
            match param {
                Some(i) => {
                    bound.insert(*kw_name);
                    let pty = func.param_tys.get(i).cloned().unwrap_or_default();
                    if !assignable(kw_ty, &pty, self.module) {
                        let signature = self.render_signature(fid);
                        let expected = pty.render(self.module, self.interner);
                        let found = kw_ty.render(self.module, self.interner);
                        let kw = self.interner.get(*kw_name).to_owned();
                        self.error(
                            DiagKind::TypeError,
                            format!("{name}() argument '{kw}' expects {expected}, found {found}; signature is {signature}"),
                            span,
                        );
                    }
                }
                None if !has_kwarg => {
                    let kw = self.interner.get(*kw_name).to_owned();
                    self.error(
                        DiagKind::TypeError,
                        format!("{name}() got an unexpected keyword argument '{kw}'"),
                        span,
                    );
                }
                None => {}
            }
        }
        for (pname, _, has_default) in &positional {
            if !bound.contains(pname) && !has_default {
                let missing = self.interner.get(*pname).to_owned();
                self.error(
                    DiagKind::TypeError,
                    format!("{name}() missing required argument '{missing}'"),
                    span,
                );
            }
        }
    }

    fn render_signature(&self, fid: FuncId) -> String {
        let func = self.module.func(fid);
        let params: Vec<String> = func
            .param_tys
            .iter()
            .map(|t| t.render(self.module, self.interner))
            .collect();
        format!(
            "({}) -> {}",
            params.join(", "),
            func.return_ty.render(self.module, self.interner)
        )
    }

    /// Constructor check: `__init__` when present, otherwise the declared
    /// attributes in declaration order.
    fn check_constructor(&mut self, cid: ClassId, arg_tys: &[Ty], span: Span) {
        if let Some(init) = self.module.find_method(cid, StaticStr::DunderInit.id()) {
            // Drop the `self` parameter.
            let with_self: Vec<Ty> = std::iter::once(Ty::Class(cid)).chain(arg_tys.iter().cloned()).collect();
            self.check_call_signature(init, &with_self, &[], span);
            return;
        }
        if self.module.class(cid).exc_base.is_some() {
            return;
        }
        // The implicit constructor signature is the attribute list in
        // declaration order, base classes first.
        let mut chain = Vec::new();
        let mut current = Some(cid);
        while let Some(c) = current {
            chain.push(c);
            current = self.module.class(c).base_class;
        }
        let mut attrs: Vec<(StringId, Ty, bool)> = Vec::new();
        for c in chain.iter().rev() {
            for (n, a) in &self.module.class(*c).attrs {
                if !attrs.iter().any(|(existing, _, _)| existing == n) {
                    attrs.push((*n, a.ty.clone(), a.default.is_some()));
                }
            }
        }
        let class_name = self.interner.get(self.module.class(cid).name).to_owned();
        let required = attrs.iter().filter(|(_, _, d)| !d).count();
        if arg_tys.len() > attrs.len() || arg_tys.len() < required {
            self.error(
                DiagKind::TypeError,
                format!(
                    "{class_name}() takes {required} to {} positional arguments but {} were given",
                    attrs.len(),
                    arg_tys.len()
                ),
                span,
            );
            return;
        }
        for (arg, (attr_name, attr_ty, _)) in arg_tys.iter().zip(&attrs) {
            if !assignable(arg, attr_ty, self.module) {
                let expected = attr_ty.render(self.module, self.interner);
                let found = arg.render(self.module, self.interner);
                let attr = self.interner.get(*attr_name).to_owned();
                self.error(
                    DiagKind::TypeError,
                    format!("{class_name}() attribute '{attr}' expects {expected}, found {found}"),
                    span,
                );
            }
        }
    }

    fn builtin_call_type(&mut self, builtin: Builtin, arg_tys: &[Ty], span: Span) -> Ty {
        match builtin {
            Builtin::Type(p) => {
                if arg_tys.len() > 1 {
                    self.error(
                        DiagKind::TypeError,
                        format!("{p}() takes at most one argument"),
                        span,
                    );
                }
                p.as_ty()
            }
            Builtin::Fn(f) => match f {
                BuiltinFn::Abs | BuiltinFn::Min | BuiltinFn::Max => {
                    arg_tys.first().cloned().unwrap_or_default()
                }
                other => other.result_ty(),
            },
            Builtin::Exc(kind) => Ty::Exc(kind),
        }
    }

    fn method_call_type(&mut self, oty: &Ty, attr: StringId, arg_tys: &[Ty], span: Span) -> Ty {
        match oty {
            Ty::Class(cid) => {
                if let Some(fid) = self.module.find_method(*cid, attr) {
                    let with_self: Vec<Ty> = std::iter::once(oty.clone()).chain(arg_tys.iter().cloned()).collect();
                    self.check_call_signature(fid, &with_self, &[], span);
                    if self.module.func(fid).is_generator {
                        return Ty::Unknown;
                    }
                    return self.module.func(fid).return_ty.clone();
                }
                if let Some(decl) = self.module.find_attr(*cid, attr) {
                    // Calling a callable attribute.
                    if let Ty::Arrow { ret, .. } = &decl.ty {
                        return (**ret).clone();
                    }
                    return Ty::Unknown;
                }
                let class_name = self.interner.get(self.module.class(*cid).name).to_owned();
                let attr_name = self.interner.get(attr).to_owned();
                self.error(
                    DiagKind::AttributeError,
                    format!("'{class_name}' object has no attribute '{attr_name}'"),
                    span,
                );
                Ty::Unknown
            }
            // Builtin container methods are typed loosely.
            _ => Ty::Unknown,
        }
    }

    fn attribute_type(&mut self, vty: &Ty, attr: StringId, span: Span) -> Ty {
        match vty {
            Ty::Class(cid) => {
                if let Some(decl) = self.module.find_attr(*cid, attr) {
                    return decl.ty.clone();
                }
                if let Some(fid) = self.module.find_method(*cid, attr) {
                    let func = self.module.func(fid);
                    return Ty::Arrow {
                        params: func.param_tys.iter().skip(1).cloned().collect(),
                        ret: Box::new(func.return_ty.clone()),
                    };
                }
                let class_name = self.interner.get(self.module.class(*cid).name).to_owned();
                let attr_name = self.interner.get(attr).to_owned();
                self.error(
                    DiagKind::AttributeError,
                    format!("'{class_name}' object has no attribute '{attr_name}'"),
                    span,
                );
                Ty::Unknown
            }
            Ty::Type(inner) => match &**inner {
                Ty::Class(cid) => {
                    if let Some(decl) = self.module.find_attr(*cid, attr) {
                        decl.ty.clone()
                    } else if let Some(fid) = self.module.find_method(*cid, attr) {
                        self.signature_arrow(fid)
                    } else {
                        Ty::Unknown
                    }
                }
                _ => Ty::Unknown,
            },
            _ => Ty::Unknown,
        }
    }

    fn subscript_type(&mut self, vty: &Ty, ity: &Ty, is_slice: bool, span: Span) -> Ty {
        let _ = span;
        if is_slice {
            return vty.clone();
        }
        match vty {
            Ty::List(item) => (**item).clone(),
            Ty::Str => Ty::Str,
            Ty::Dict(_, value) => (**value).clone(),
            Ty::Tuple(items) => {
                let _ = ity;
                if items.is_empty() {
                    Ty::Unknown
                } else {
                    let first = items[0].clone();
                    if items.iter().all(|t| *t == first) {
                        first
                    } else {
                        Ty::Unknown
                    }
                }
            }
            _ => Ty::Unknown,
        }
    }

    // -- Annotations --

    /// Resolves a type expression, rewriting names to type nodes so the
    /// printer and evaluator see resolved annotations. Idempotent.
    fn resolve_type_expr(&mut self, node: &mut ExprLoc, depth: usize) -> Ty {
        if depth >= MAX_SEMA_DEPTH {
            self.error(DiagKind::SyntaxError, "type expression nesting too deep", node.span);
            return Ty::Unknown;
        }
        let span = node.span;
        let ty = match &mut node.expr {
            Expr::Constant(ConstValue::None) => Ty::None,
            Expr::BuiltinType(Builtin::Type(p)) => p.as_ty(),
            Expr::BuiltinType(Builtin::Exc(kind)) => Ty::Exc(*kind),
            Expr::ClassType(cid) => Ty::Class(*cid),
            Expr::Name(name) => {
                let text = self.interner.get(name.name).to_owned();
                if let Ok(prim) = text.parse::<TyPrim>() {
                    node.expr = Expr::BuiltinType(Builtin::Type(prim));
                    prim.as_ty()
                } else if let Ok(exc) = text.parse::<ExcKind>() {
                    node.expr = Expr::BuiltinType(Builtin::Exc(exc));
                    Ty::Exc(exc)
                } else {
                    match self.lookup_value(name.name) {
                        Some(Value::Class(cid)) => {
                            node.expr = Expr::ClassType(cid);
                            Ty::Class(cid)
                        }
                        _ => {
                            self.error(DiagKind::NameError, format!("unknown type '{text}'"), span);
                            Ty::Unknown
                        }
                    }
                }
            }
            Expr::Subscript { value, index } => {
                let base = match &value.expr {
                    Expr::Name(name) => self.interner.get(name.name).to_owned(),
                    _ => String::new(),
                };
                match base.as_str() {
                    "list" => {
                        let mut item = index.clone();
                        let ty = self.resolve_type_expr(&mut item, depth + 1);
                        node.expr = Expr::ArrayType { item };
                        Ty::List(Box::new(ty))
                    }
                    "set" => {
                        let mut item = index.clone();
                        let ty = self.resolve_type_expr(&mut item, depth + 1);
                        node.expr = Expr::SetType { item };
                        Ty::Set(Box::new(ty))
                    }
                    "dict" => {
                        if let Expr::TupleExpr(items) = &index.expr {
                            if items.len() == 2 {
                                let mut key = Box::new(items[0].clone());
                                let mut val = Box::new(items[1].clone());
                                let kt = self.resolve_type_expr(&mut key, depth + 1);
                                let vt = self.resolve_type_expr(&mut val, depth + 1);
                                node.expr = Expr::DictType { key, value: val };
                                return self.finish_type(node, Ty::Dict(Box::new(kt), Box::new(vt)));
                            }
                        }
                        self.error(DiagKind::TypeError, "dict[...] takes two type arguments", span);
                        Ty::Unknown
                    }
                    "tuple" => {
                        let items: Vec<ExprLoc> = match &index.expr {
                            Expr::TupleExpr(items) => items.clone(),
                            _ => vec![(**index).clone()],
                        };
                        let mut resolved_items = Vec::with_capacity(items.len());
                        let mut tys = Vec::with_capacity(items.len());
                        for mut item in items {
                            tys.push(self.resolve_type_expr(&mut item, depth + 1));
                            resolved_items.push(item);
                        }
                        node.expr = Expr::TupleType { items: resolved_items };
                        Ty::Tuple(tys)
                    }
                    _ => {
                        self.error(DiagKind::TypeError, "unsupported subscripted type", span);
                        Ty::Unknown
                    }
                }
            }
            Expr::Arrow { params, ret } => {
                let params: Vec<Ty> = params.iter_mut().map(|p| self.resolve_type_expr(p, depth + 1)).collect();
                let ret_ty = self.resolve_type_expr(ret, depth + 1);
                Ty::Arrow {
                    params,
                    ret: Box::new(ret_ty),
                }
            }
            Expr::ArrayType { item } => Ty::List(Box::new(self.resolve_type_expr(item, depth + 1))),
            Expr::SetType { item } => Ty::Set(Box::new(self.resolve_type_expr(item, depth + 1))),
            Expr::TupleType { items } => {
                Ty::Tuple(items.iter_mut().map(|i| self.resolve_type_expr(i, depth + 1)).collect())
            }
            Expr::DictType { key, value } => {
                let kt = self.resolve_type_expr(key, depth + 1);
                let vt = self.resolve_type_expr(value, depth + 1);
                Ty::Dict(Box::new(kt), Box::new(vt))
            }
            _ => {
                self.error(DiagKind::TypeError, "invalid type expression", span);
                Ty::Unknown
            }
        };
        self.finish_type(node, ty)
    }

    fn finish_type(&mut self, node: &mut ExprLoc, ty: Ty) -> Ty {
        node.resolved_type = Some(Ty::Type(Box::new(ty.clone())));
        ty
    }

    // -- Patterns --

    fn pattern(&mut self, node: &mut PatternLoc, subject_ty: &Ty, depth: usize) {
        if depth >= MAX_SEMA_DEPTH {
            self.error(DiagKind::SyntaxError, "pattern nesting too deep", node.span);
            return;
        }
        match &mut node.pattern {
            Pattern::MatchValue(value) => {
                self.expr(value, depth + 1);
            }
            Pattern::MatchSingleton(_) => {}
            Pattern::MatchSequence(patterns) => {
                let elem = element_type(subject_ty);
                for p in patterns.iter_mut() {
                    self.pattern(p, &elem, depth + 1);
                }
            }
            Pattern::MatchMapping { keys, patterns, rest } => {
                for key in keys.iter_mut() {
                    self.expr(key, depth + 1);
                }
                let vty = match subject_ty {
                    Ty::Dict(_, v) => (**v).clone(),
                    _ => Ty::Unknown,
                };
                for p in patterns.iter_mut() {
                    self.pattern(p, &vty, depth + 1);
                }
                if let Some(rest) = rest {
                    let (scope, slot) = self.introduce(rest.name, subject_ty.clone(), None, false);
                    rest.resolve(scope, slot);
                }
            }
            Pattern::MatchClass {
                cls,
                patterns,
                kwd_attrs,
                kwd_patterns,
            } => {
                let cty = self.expr(cls, depth + 1);
                let class_id = match &cty {
                    Ty::Type(inner) => match &**inner {
                        Ty::Class(cid) => Some(*cid),
                        _ => None,
                    },
                    _ => None,
                };
                if let Some(cid) = class_id {
                    let attr_tys: Vec<Ty> = self.module.class(cid).attrs.values().map(|a| a.ty.clone()).collect();
                    for (i, p) in patterns.iter_mut().enumerate() {
                        let ty = attr_tys.get(i).cloned().unwrap_or_default();
                        self.pattern(p, &ty, depth + 1);
                    }
                    for (attr, p) in kwd_attrs.iter().zip(kwd_patterns.iter_mut()) {
                        let ty = self
                            .module
                            .find_attr(cid, *attr)
                            .map(|a| a.ty.clone())
                            .unwrap_or_default();
                        self.pattern(p, &ty, depth + 1);
                    }
                } else {
                    for p in patterns.iter_mut().chain(kwd_patterns.iter_mut()) {
                        self.pattern(p, &Ty::Unknown, depth + 1);
                    }
                }
            }
            Pattern::MatchStar(name) => {
                if let Some(name) = name {
                    let ty = Ty::List(Box::new(element_type(subject_ty)));
                    let (scope, slot) = self.introduce(name.name, ty, None, false);
                    name.resolve(scope, slot);
                }
            }
            Pattern::MatchAs { pattern, name } => {
                if let Some(pattern) = pattern {
                    self.pattern(pattern, subject_ty, depth + 1);
                }
                if let Some(name) = name {
                    let (scope, slot) = self.introduce(name.name, subject_ty.clone(), None, false);
                    name.resolve(scope, slot);
                }
            }
            Pattern::MatchOr(patterns) => {
                for p in patterns.iter_mut() {
                    self.pattern(p, subject_ty, depth + 1);
                }
            }
        }
    }
}

/// Element type when iterating a value of the given type.
fn element_type(ty: &Ty) -> Ty {
    match ty {
        Ty::List(item) | Ty::Set(item) => (**item).clone(),
        Ty::Str => Ty::Str,
        Ty::Dict(key, _) => (**key).clone(),
        Ty::Tuple(items) => {
            if items.is_empty() {
                Ty::Unknown
            } else {
                let first = items[0].clone();
                if items.iter().all(|t| *t == first) {
                    first
                } else {
                    Ty::Unknown
                }
            }
        }
        _ => Ty::Unknown,
    }
}

/// Whether a body contains `yield` outside nested defs.
fn body_contains_yield(body: &[StmtLoc]) -> bool {
    body.iter().any(stmt_contains_yield)
}

fn stmt_contains_yield(stmt: &StmtLoc) -> bool {
    match &stmt.stmt {
        Stmt::Expr(e) | Stmt::Return(Some(e)) => expr_contains_yield(e),
        Stmt::Assign { value, .. } => expr_contains_yield(value),
        Stmt::AugAssign { value, .. } => expr_contains_yield(value),
        Stmt::AnnAssign { value, .. } => value.as_deref().is_some_and(expr_contains_yield),
        Stmt::If { tests, bodies, orelse } => {
            tests.iter().any(expr_contains_yield)
                || bodies.iter().any(|b| body_contains_yield(b))
                || body_contains_yield(orelse)
        }
        Stmt::While { test, body, orelse } => {
            expr_contains_yield(test) || body_contains_yield(body) || body_contains_yield(orelse)
        }
        Stmt::For { iter, body, orelse, .. } => {
            expr_contains_yield(iter) || body_contains_yield(body) || body_contains_yield(orelse)
        }
        Stmt::With { items, body } => {
            items.iter().any(|i| expr_contains_yield(&i.context_expr)) || body_contains_yield(body)
        }
        Stmt::Try {
            body,
            handlers,
            orelse,
            finalbody,
        } => {
            body_contains_yield(body)
                || handlers.iter().any(|h| body_contains_yield(&h.body))
                || body_contains_yield(orelse)
                || body_contains_yield(finalbody)
        }
        Stmt::Match { cases, .. } => cases.iter().any(|c| body_contains_yield(&c.body)),
        Stmt::Inline(body) => body_contains_yield(body),
        _ => false,
    }
}

fn expr_contains_yield(expr: &ExprLoc) -> bool {
    match &expr.expr {
        Expr::Yield(_) | Expr::YieldFrom(_) => true,
        Expr::BinOp { left, right, .. } => expr_contains_yield(left) || expr_contains_yield(right),
        Expr::BoolOp { values, .. } => values.iter().any(expr_contains_yield),
        Expr::UnaryOp { operand, .. } => expr_contains_yield(operand),
        Expr::Compare { left, comparators, .. } => {
            expr_contains_yield(left) || comparators.iter().any(expr_contains_yield)
        }
        Expr::Call { func, args, keywords } => {
            expr_contains_yield(func)
                || args.iter().any(expr_contains_yield)
                || keywords.iter().any(|k| expr_contains_yield(&k.value))
        }
        Expr::Attribute { value, .. } | Expr::Starred(value) | Expr::Await(value) => expr_contains_yield(value),
        Expr::Subscript { value, index } => expr_contains_yield(value) || expr_contains_yield(index),
        Expr::IfExp { test, body, orelse } => {
            expr_contains_yield(test) || expr_contains_yield(body) || expr_contains_yield(orelse)
        }
        Expr::ListExpr(items) | Expr::TupleExpr(items) | Expr::SetExpr(items) | Expr::JoinedStr(items) => {
            items.iter().any(expr_contains_yield)
        }
        Expr::DictExpr { keys, values } => {
            keys.iter().any(expr_contains_yield) || values.iter().any(expr_contains_yield)
        }
        Expr::NamedExpr { value, .. } | Expr::FormattedValue { value, .. } => expr_contains_yield(value),
        _ => false,
    }
}

/// Collects names that transitively nested functions declare `nonlocal`,
/// so the owning scope can store them in cells from the start.
fn collect_nonlocal_names(module: &Module, body: &[StmtLoc], out: &mut AHashSet<StringId>) {
    for stmt in body {
        match &stmt.stmt {
            Stmt::FunctionDef(fid) => {
                collect_nonlocal_decls(module, &module.func(*fid).body, out);
            }
            Stmt::ClassDef(cid) => {
                for fid in module.class(*cid).methods.values() {
                    collect_nonlocal_decls(module, &module.func(*fid).body, out);
                }
            }
            Stmt::If { bodies, orelse, .. } => {
                for b in bodies {
                    collect_nonlocal_names(module, b, out);
                }
                collect_nonlocal_names(module, orelse, out);
            }
            Stmt::While { body, orelse, .. } | Stmt::For { body, orelse, .. } => {
                collect_nonlocal_names(module, body, out);
                collect_nonlocal_names(module, orelse, out);
            }
            Stmt::With { body, .. } | Stmt::Inline(body) => collect_nonlocal_names(module, body, out),
            Stmt::Try {
                body,
                handlers,
                orelse,
                finalbody,
            } => {
                collect_nonlocal_names(module, body, out);
                for h in handlers {
                    collect_nonlocal_names(module, &h.body, out);
                }
                collect_nonlocal_names(module, orelse, out);
                collect_nonlocal_names(module, finalbody, out);
            }
            Stmt::Match { cases, .. } => {
                for c in cases {
                    collect_nonlocal_names(module, &c.body, out);
                }
            }
            _ => {}
        }
    }
}

/// Inside a nested def: record its `nonlocal` names and keep descending.
fn collect_nonlocal_decls(module: &Module, body: &[StmtLoc], out: &mut AHashSet<StringId>) {
    for stmt in body {
        match &stmt.stmt {
            Stmt::Nonlocal(names) => out.extend(names.iter().copied()),
            Stmt::FunctionDef(fid) => collect_nonlocal_decls(module, &module.func(*fid).body, out),
            Stmt::If { bodies, orelse, .. } => {
                for b in bodies {
                    collect_nonlocal_decls(module, b, out);
                }
                collect_nonlocal_decls(module, orelse, out);
            }
            Stmt::While { body, orelse, .. } | Stmt::For { body, orelse, .. } => {
                collect_nonlocal_decls(module, body, out);
                collect_nonlocal_decls(module, orelse, out);
            }
            Stmt::With { body, .. } | Stmt::Inline(body) => collect_nonlocal_decls(module, body, out),
            Stmt::Try {
                body,
                handlers,
                orelse,
                finalbody,
            } => {
                collect_nonlocal_decls(module, body, out);
                for h in handlers {
                    collect_nonlocal_decls(module, &h.body, out);
                }
                collect_nonlocal_decls(module, orelse, out);
                collect_nonlocal_decls(module, finalbody, out);
            }
            Stmt::Match { cases, .. } => {
                for c in cases {
                    collect_nonlocal_decls(module, &c.body, out);
                }
            }
            _ => {}
        }
    }
}
