//! The tree evaluator: a partial-evaluating, exception-aware interpreter.
//!
//! `exec_expr` returns a [`PartialResult`]: either a fully-reduced value or
//! a residual expression with as much as possible folded away. In a normal
//! run every name is bound and results are always values; the fold entry
//! point leaves unbound names symbolic, which is what compile-time constant
//! folding uses.
//!
//! Control flow runs through the frame-status register: `return` sets
//! `ReturnPending` and is absorbed by the enclosing call, `break`/`continue`
//! are absorbed by the enclosing loop, and `raise` pushes onto the exception
//! stack and sets `ExceptionPending` until a matching handler absorbs it.

use std::borrow::Cow;

use smallvec::SmallVec;

use crate::ast::{
    CallKeyword, ClassId, Comprehension, ConstValue, ExceptHandler, Expr, ExprLoc, FuncId, ImportAlias, MatchCase,
    Module, NameRef, NameScope, OpImpl, Pattern, PatternLoc, StmtLoc, WithItem,
};
use crate::bindings::{seed_builtin_values, Bindings};
use crate::exc::{ExcKind, ExcRaise, ExcValue, RunError, RunResult};
use crate::heap::{GenState, Heap, HeapData, HeapId};
use crate::intern::{Interner, StaticStr, StringId};
use crate::io::PrintWriter;
use crate::ops::{BinOpKind, BoolOpKind, CmpOpKind, UnaryOpKind};
use crate::token::Span;
use crate::tracer::EvalTracer;
use crate::types::{
    dunder_for_binop, dunder_for_unary, reflected_dunder_for_binop, Builtin, BuiltinFn, Intrinsic, TyPrim,
};
use crate::value::{format_float, py_cmp, py_eq, py_is, value_repr, value_str, Value};
use crate::visit::TreeVisitor;

/// Maximum call depth before a `RecursionError`.
pub const MAX_CALL_DEPTH: usize = 200;

/// The evaluator's return type: a value, or the remaining work.
#[derive(Debug, Clone)]
pub enum PartialResult {
    Value(Value),
    Residual(ExprLoc),
}

impl PartialResult {
    /// The `None` sentinel.
    pub fn none() -> Self {
        Self::Value(Value::None)
    }

    pub fn as_value(&self) -> Option<Value> {
        match self {
            Self::Value(v) => Some(*v),
            Self::Residual(_) => None,
        }
    }

    pub fn is_residual(&self) -> bool {
        matches!(self, Self::Residual(_))
    }

    /// Converts back into an expression for residual rebuilding: values
    /// become constants when they have a literal form, otherwise the
    /// original subtree is kept.
    fn into_expr(self, original: &ExprLoc) -> ExprLoc {
        match self {
            Self::Residual(e) => e,
            Self::Value(v) => match value_to_const(&v) {
                Some(c) => ExprLoc::constant(original.span, c),
                None => original.clone(),
            },
        }
    }
}

fn value_to_const(v: &Value) -> Option<ConstValue> {
    match v {
        Value::None => Some(ConstValue::None),
        Value::Bool(b) => Some(ConstValue::Bool(*b)),
        Value::Int(i) => Some(ConstValue::Int(*i)),
        Value::F32(f) => Some(ConstValue::Float(f64::from(*f))),
        Value::F64(f) => Some(ConstValue::Float(*f)),
        Value::InternStr(id) => Some(ConstValue::Str(*id)),
        _ => None,
    }
}

/// Frame status register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameStatus {
    #[default]
    Running,
    ReturnPending,
    BreakPending,
    ContinuePending,
    ExceptionPending,
}

/// Whether unbound names are errors or residuals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EvalMode {
    Run,
    Fold,
}

/// One entry of the fatal-error stack trace.
#[derive(Debug, Clone)]
pub struct TraceFrame {
    pub function: StringId,
    pub span: Span,
}

pub struct TreeEvaluator<'a, W: PrintWriter, T: EvalTracer> {
    module: &'a Module,
    interner: &'a Interner,
    pub bindings: Bindings,
    pub heap: Heap,
    frames: Vec<usize>,
    status: FrameStatus,
    return_value: Option<Value>,
    exceptions: SmallVec<[ExcRaise; 2]>,
    handling_exceptions: usize,
    pub traces: Vec<TraceFrame>,
    subjects: Vec<Value>,
    yield_buffers: Vec<Vec<Value>>,
    /// The most recently handled exception, for bare `raise`.
    current_exception: Option<ExcRaise>,
    mode: EvalMode,
    fatal: Option<String>,
    writer: &'a mut W,
    tracer: &'a mut T,
}

impl<'a, W: PrintWriter, T: EvalTracer> TreeEvaluator<'a, W, T> {
    pub fn new(module: &'a Module, interner: &'a Interner, writer: &'a mut W, tracer: &'a mut T) -> Self {
        let mut bindings = Bindings::new();
        seed_builtin_values(&mut bindings);
        for _ in 0..module.module_nlocals {
            bindings.add(StaticStr::Empty.id(), Value::Undefined, crate::types::Ty::Unknown);
        }
        Self {
            module,
            interner,
            bindings,
            heap: Heap::new(),
            frames: Vec::new(),
            status: FrameStatus::Running,
            return_value: None,
            exceptions: SmallVec::new(),
            handling_exceptions: 0,
            traces: vec![TraceFrame {
                function: StaticStr::Module.id(),
                span: Span::default(),
            }],
            subjects: Vec::new(),
            yield_buffers: Vec::new(),
            current_exception: None,
            mode: EvalMode::Run,
            fatal: None,
            writer,
            tracer,
        }
    }

    // -- Entry points --

    /// Executes the module body. Returns the unhandled exception, if any.
    pub fn run_module(&mut self) -> Result<(), RunError> {
        let module = self.module;
        self.exec_body(&module.body, 0);
        self.finish()
    }

    /// Calls `main()` after the module body has run.
    pub fn run_main(&mut self, fid: FuncId) -> Result<(), RunError> {
        let span = self.module.func(fid).span;
        let result = self.call_function(fid, &[], Vec::new(), Vec::new(), span);
        if let Err(e) = result {
            self.raise_error(e);
        }
        self.finish()
    }

    fn finish(&mut self) -> Result<(), RunError> {
        if let Some(message) = self.fatal.take() {
            return Err(RunError::Fatal(message));
        }
        if self.has_exceptions() {
            let raise = self.exceptions.pop().expect("exception stack is non-empty");
            return Err(RunError::Exc(Box::new(raise)));
        }
        Ok(())
    }

    /// Partial evaluation: reduce an expression as far as the bound names
    /// allow. Unbound names stay symbolic.
    pub fn fold(&mut self, expr: &ExprLoc) -> PartialResult {
        self.mode = EvalMode::Fold;
        let result = self.exec_expr(expr, 0);
        self.mode = EvalMode::Run;
        result
    }

    // -- Status plumbing --

    fn running(&self) -> bool {
        self.status == FrameStatus::Running && self.fatal.is_none()
    }

    /// Only true for exceptions this frame has not started handling.
    pub fn has_exceptions(&self) -> bool {
        self.exceptions.len() > self.handling_exceptions
    }

    fn raise_exc(&mut self, exc: ExcValue, span: Span) {
        self.tracer.on_raise(&exc.kind.to_string(), span);
        self.exceptions.push(ExcRaise { exc, span, cause: None });
        self.status = FrameStatus::ExceptionPending;
    }

    fn raise_error(&mut self, err: RunError) {
        match err {
            RunError::Exc(raise) => {
                self.tracer.on_raise(&raise.exc.kind.to_string(), raise.span);
                self.exceptions.push(*raise);
                self.status = FrameStatus::ExceptionPending;
            }
            RunError::Fatal(message) => {
                self.fatal = Some(message);
                self.status = FrameStatus::ExceptionPending;
            }
        }
    }

    /// Unwraps a native result, converting errors into in-flight exceptions.
    fn check<V>(&mut self, result: RunResult<V>) -> Option<V> {
        match result {
            Ok(v) => Some(v),
            Err(e) => {
                self.raise_error(e);
                None
            }
        }
    }

    fn frame_base(&self) -> usize {
        self.frames.last().copied().unwrap_or(0)
    }

    /// Evaluates to a value; `None` means an exception or residual stopped
    /// the statement.
    fn exec_value(&mut self, expr: &ExprLoc, depth: usize) -> Option<Value> {
        match self.exec_expr(expr, depth) {
            PartialResult::Value(v) => {
                if self.running() {
                    Some(v)
                } else {
                    None
                }
            }
            PartialResult::Residual(_) => {
                if self.mode == EvalMode::Run && self.fatal.is_none() {
                    self.fatal = Some("residual expression escaped into a normal run".to_owned());
                    self.status = FrameStatus::ExceptionPending;
                }
                None
            }
        }
    }

    fn exec_body(&mut self, body: &[StmtLoc], depth: usize) {
        for stmt in body {
            self.tracer.on_statement(stmt.span);
            if let Some(trace) = self.traces.last_mut() {
                trace.span = stmt.span;
            }
            self.exec_stmt(stmt, depth);
            if !self.running() {
                break;
            }
        }
    }

    /// Loop bodies additionally absorb break/continue.
    fn exec_loop_body(&mut self, body: &[StmtLoc], depth: usize) -> LoopSignal {
        self.exec_body(body, depth);
        match self.status {
            FrameStatus::BreakPending => {
                self.status = FrameStatus::Running;
                LoopSignal::Break
            }
            FrameStatus::ContinuePending => {
                self.status = FrameStatus::Running;
                LoopSignal::Continue
            }
            FrameStatus::Running => LoopSignal::Normal,
            _ => LoopSignal::Propagate,
        }
    }

    // -- Names --

    fn load_name(&mut self, name: &NameRef, span: Span) -> PartialResult {
        if !name.is_resolved() {
            self.fatal = Some(format!(
                "name '{}' reached the evaluator unresolved",
                self.interner.get(name.name)
            ));
            self.status = FrameStatus::ExceptionPending;
            return PartialResult::none();
        }
        let index = match name.scope {
            NameScope::Global => name.varid() as usize,
            NameScope::Local | NameScope::Cell => self.frame_base() + name.varid() as usize,
        };
        let mut value = self.bindings.get(index).value;
        if name.scope == NameScope::Cell {
            if let Value::Ref(id) = value {
                if let HeapData::Cell(inner) = self.heap.get(id) {
                    value = *inner;
                }
            }
        }
        if let Value::Undefined = value {
            if self.mode == EvalMode::Fold {
                return PartialResult::Residual(ExprLoc::new(span, Expr::Name(*name)));
            }
            let text = self.interner.get(name.name).to_owned();
            let kind = if name.scope == NameScope::Global {
                ExcKind::NameError
            } else {
                ExcKind::UnboundLocalError
            };
            self.raise_exc(ExcValue::new(kind, Some(format!("{text} is not defined"))), span);
            return PartialResult::none();
        }
        PartialResult::Value(value)
    }

    fn store_name(&mut self, name: &NameRef, value: Value) {
        let index = match name.scope {
            NameScope::Global => name.varid() as usize,
            NameScope::Local | NameScope::Cell => self.frame_base() + name.varid() as usize,
        };
        if name.scope == NameScope::Cell {
            if let Value::Ref(id) = self.bindings.get(index).value {
                if matches!(self.heap.get(id), HeapData::Cell(_)) {
                    *self.heap.get_mut(id) = HeapData::Cell(value);
                    return;
                }
            }
        }
        self.bindings.set_value(index, value);
    }

    fn store_target(&mut self, target: &ExprLoc, value: Value, depth: usize) {
        let span = target.span;
        match &target.expr {
            Expr::Name(name) => self.store_name(name, value),
            Expr::TupleExpr(items) | Expr::ListExpr(items) => self.unpack_into(items, value, span, depth),
            Expr::Starred(inner) => self.store_target(inner, value, depth),
            Expr::Attribute { value: obj, attr } => {
                let Some(obj) = self.exec_value(obj, depth + 1) else { return };
                let result = self.set_attr(obj, *attr, value, span);
                let _ = self.check(result);
            }
            Expr::Subscript { value: obj, index } => {
                let Some(obj) = self.exec_value(obj, depth + 1) else { return };
                let Some(index) = self.exec_value(index, depth + 1) else { return };
                let result = self.set_item(obj, index, value, span);
                let _ = self.check(result);
            }
            _ => {
                self.fatal = Some("invalid assignment target reached the evaluator".to_owned());
                self.status = FrameStatus::ExceptionPending;
            }
        }
    }

    fn unpack_into(&mut self, targets: &[ExprLoc], value: Value, span: Span, depth: usize) {
        let values = match self.materialize(value, span) {
            Ok(v) => v,
            Err(e) => {
                self.raise_error(e);
                return;
            }
        };
        let star = targets.iter().position(|t| matches!(t.expr, Expr::Starred(_)));
        match star {
            None => {
                if values.len() != targets.len() {
                    self.raise_exc(
                        ExcValue::new(
                            ExcKind::ValueError,
                            Some(format!(
                                "cannot unpack {} values into {} targets",
                                values.len(),
                                targets.len()
                            )),
                        ),
                        span,
                    );
                    return;
                }
                for (target, v) in targets.iter().zip(values) {
                    self.store_target(target, v, depth);
                    if !self.running() {
                        return;
                    }
                }
            }
            Some(star_idx) => {
                let before = star_idx;
                let after = targets.len() - star_idx - 1;
                if values.len() < before + after {
                    self.raise_exc(
                        ExcValue::new(ExcKind::ValueError, Some("not enough values to unpack".to_owned())),
                        span,
                    );
                    return;
                }
                for (target, v) in targets[..before].iter().zip(&values[..before]) {
                    self.store_target(target, *v, depth);
                }
                let rest: Vec<Value> = values[before..values.len() - after].to_vec();
                let rest = Value::Ref(self.heap.allocate(HeapData::List(rest)));
                self.store_target(&targets[star_idx], rest, depth);
                for (target, v) in targets[star_idx + 1..].iter().zip(&values[values.len() - after..]) {
                    self.store_target(target, *v, depth);
                }
            }
        }
    }

    // -- Values: attributes, items, iteration --

    fn get_attr(&mut self, obj: Value, attr: StringId, span: Span) -> RunResult<Value> {
        let module = self.module;
        match obj {
            Value::Ref(id) => match self.heap.get(id) {
                HeapData::Instance { class, attrs } => {
                    if let Some((_, v)) = attrs.iter().find(|(name, _)| *name == attr) {
                        if !matches!(v, Value::Undefined) {
                            return Ok(*v);
                        }
                    }
                    let class = *class;
                    if let Some(fid) = module.find_method(class, attr) {
                        let method = self.heap.allocate(HeapData::BoundMethod { recv: obj, func: fid });
                        return Ok(Value::Ref(method));
                    }
                    Err(self.attr_error(obj, attr, span))
                }
                HeapData::Exception(exc) => {
                    let message = exc.message.clone();
                    if self.interner.get(attr) == "message" {
                        return Ok(match message {
                            Some(m) => Value::Ref(self.heap.alloc_str(m)),
                            None => Value::None,
                        });
                    }
                    Err(self.attr_error(obj, attr, span))
                }
                _ => Err(self.attr_error(obj, attr, span)),
            },
            Value::Class(cid) => {
                if let Some(fid) = module.find_method(cid, attr) {
                    return Ok(Value::Function(fid));
                }
                if let Some(&nested) = module.class(cid).nested.get(&attr) {
                    return Ok(Value::Class(nested));
                }
                Err(self.attr_error(obj, attr, span))
            }
            _ => Err(self.attr_error(obj, attr, span)),
        }
    }

    fn attr_error(&self, obj: Value, attr: StringId, span: Span) -> RunError {
        let type_name = match obj {
            Value::Ref(id) => match self.heap.get(id) {
                HeapData::Instance { class, .. } => self.interner.get(self.module.class(*class).name).to_owned(),
                data => data.type_label().to_owned(),
            },
            other => other.type_tag(&self.heap).to_string(),
        };
        let attr = self.interner.get(attr);
        RunError::attribute_error(format!("'{type_name}' object has no attribute '{attr}'"), span)
    }

    fn set_attr(&mut self, obj: Value, attr: StringId, value: Value, span: Span) -> RunResult<()> {
        match obj {
            Value::Ref(id) => {
                if let HeapData::Instance { attrs, .. } = self.heap.get_mut(id) {
                    if let Some(slot) = attrs.iter_mut().find(|(name, _)| *name == attr) {
                        slot.1 = value;
                    } else {
                        attrs.push((attr, value));
                    }
                    return Ok(());
                }
                Err(self.attr_error(obj, attr, span))
            }
            _ => Err(self.attr_error(obj, attr, span)),
        }
    }

    fn get_item(&mut self, obj: Value, index: Value, span: Span) -> RunResult<Value> {
        match obj {
            Value::Ref(id) => match self.heap.get(id) {
                HeapData::List(items) | HeapData::Tuple(items) => {
                    let i = normalize_index(&index, items.len(), span)?;
                    Ok(items[i])
                }
                HeapData::Dict(pairs) => {
                    for (k, v) in pairs {
                        if py_eq(k, &index, &self.heap, self.interner) {
                            return Ok(*v);
                        }
                    }
                    let repr = value_repr(&index, &self.heap, self.interner, self.module);
                    Err(RunError::key_error(repr, span))
                }
                HeapData::Str(s) => {
                    let chars: Vec<char> = s.chars().collect();
                    let i = normalize_index(&index, chars.len(), span)?;
                    let ch = chars[i].to_string();
                    Ok(Value::Ref(self.heap.alloc_str(ch)))
                }
                HeapData::Range { start, stop, step } => {
                    let len = range_len(*start, *stop, *step);
                    let start = *start;
                    let step = *step;
                    let i = normalize_index(&index, len, span)?;
                    Ok(Value::Int(start + step * i as i64))
                }
                _ => Err(RunError::type_error("object is not subscriptable", span)),
            },
            Value::InternStr(sid) => {
                let chars: Vec<char> = self.interner.get(sid).chars().collect();
                let i = normalize_index(&index, chars.len(), span)?;
                let ch = chars[i].to_string();
                Ok(Value::Ref(self.heap.alloc_str(ch)))
            }
            _ => Err(RunError::type_error("object is not subscriptable", span)),
        }
    }

    fn set_item(&mut self, obj: Value, index: Value, value: Value, span: Span) -> RunResult<()> {
        let Value::Ref(id) = obj else {
            return Err(RunError::type_error("object does not support item assignment", span));
        };
        // Key equality needs shared heap access before the mutable update.
        let dict_slot = if let HeapData::Dict(pairs) = self.heap.get(id) {
            let mut found = None;
            for (i, (k, _)) in pairs.iter().enumerate() {
                if py_eq(k, &index, &self.heap, self.interner) {
                    found = Some(i);
                    break;
                }
            }
            Some(found)
        } else {
            None
        };
        match self.heap.get_mut(id) {
            HeapData::List(items) => {
                let i = normalize_index(&index, items.len(), span)?;
                items[i] = value;
                Ok(())
            }
            HeapData::Dict(pairs) => {
                match dict_slot.expect("dict slot probed above") {
                    Some(i) => pairs[i].1 = value,
                    None => pairs.push((index, value)),
                }
                Ok(())
            }
            _ => Err(RunError::type_error("object does not support item assignment", span)),
        }
    }

    fn del_item(&mut self, obj: Value, index: Value, span: Span) -> RunResult<()> {
        let Value::Ref(id) = obj else {
            return Err(RunError::type_error("object does not support item deletion", span));
        };
        let dict_slot = if let HeapData::Dict(pairs) = self.heap.get(id) {
            let mut found = None;
            for (i, (k, _)) in pairs.iter().enumerate() {
                if py_eq(k, &index, &self.heap, self.interner) {
                    found = Some(i);
                    break;
                }
            }
            Some(found)
        } else {
            None
        };
        match self.heap.get_mut(id) {
            HeapData::List(items) => {
                let i = normalize_index(&index, items.len(), span)?;
                items.remove(i);
                Ok(())
            }
            HeapData::Dict(pairs) => match dict_slot.expect("dict slot probed above") {
                Some(i) => {
                    pairs.remove(i);
                    Ok(())
                }
                None => {
                    let repr = value_repr(&index, &self.heap, self.interner, self.module);
                    Err(RunError::key_error(repr, span))
                }
            },
            _ => Err(RunError::type_error("object does not support item deletion", span)),
        }
    }

    /// Materializes any iterable into a vector of values.
    fn materialize(&mut self, value: Value, span: Span) -> RunResult<Vec<Value>> {
        match value {
            Value::Ref(id) => match self.heap.get(id) {
                HeapData::List(items) | HeapData::Tuple(items) | HeapData::Set(items) => Ok(items.clone()),
                HeapData::Dict(pairs) => Ok(pairs.iter().map(|(k, _)| *k).collect()),
                HeapData::Str(s) => {
                    let chars: Vec<String> = s.chars().map(|c| c.to_string()).collect();
                    Ok(chars
                        .into_iter()
                        .map(|c| Value::Ref(self.heap.alloc_str(c)))
                        .collect())
                }
                HeapData::Range { start, stop, step } => {
                    let (start, stop, step) = (*start, *stop, *step);
                    Ok(range_values(start, stop, step))
                }
                HeapData::Generator(_) => {
                    self.pump_generator(id, span)?;
                    match self.heap.get_mut(id) {
                        HeapData::Generator(GenState::Ready { items, cursor }) => {
                            let rest = items[*cursor..].to_vec();
                            *cursor = items.len();
                            Ok(rest)
                        }
                        _ => Ok(Vec::new()),
                    }
                }
                HeapData::Instance { .. } => self.drain_object_iter(value, span),
                _ => Err(RunError::type_error("object is not iterable", span)),
            },
            Value::InternStr(sid) => {
                let chars: Vec<String> = self.interner.get(sid).chars().map(|c| c.to_string()).collect();
                Ok(chars
                    .into_iter()
                    .map(|c| Value::Ref(self.heap.alloc_str(c)))
                    .collect())
            }
            _ => Err(RunError::type_error("object is not iterable", span)),
        }
    }

    /// Calls `__next__` until `StopIteration`.
    fn drain_object_iter(&mut self, value: Value, span: Span) -> RunResult<Vec<Value>> {
        let mut out = Vec::new();
        loop {
            match self.call_dunder(value, StaticStr::DunderNext.id(), Vec::new(), span)? {
                Some(v) => {
                    if self.absorb_stop_iteration() {
                        break;
                    }
                    if !self.running() {
                        break;
                    }
                    out.push(v);
                }
                None => return Err(RunError::type_error("object is not iterable", span)),
            }
            if out.len() > 10_000_000 {
                return Err(RunError::raise(ExcKind::RuntimeError, "iterator overran", span));
            }
        }
        Ok(out)
    }

    /// Absorbs a pending `StopIteration`, returning whether one was taken.
    fn absorb_stop_iteration(&mut self) -> bool {
        if self.has_exceptions() {
            let top_is_stop = self
                .exceptions
                .last()
                .is_some_and(|raise| raise.exc.kind == ExcKind::StopIteration);
            if top_is_stop {
                self.exceptions.pop();
                self.status = FrameStatus::Running;
                return true;
            }
        }
        false
    }

    /// Runs a pending generator body, buffering its yields.
    fn pump_generator(&mut self, id: HeapId, span: Span) -> RunResult<()> {
        let state = match self.heap.get_mut(id) {
            HeapData::Generator(state) => state,
            _ => return Ok(()),
        };
        let GenState::Pending { func, captured, args } = state else {
            return Ok(());
        };
        let (func, captured, args) = (*func, std::mem::take(captured), std::mem::take(args));
        *state = GenState::Ready {
            items: Vec::new(),
            cursor: 0,
        };
        self.yield_buffers.push(Vec::new());
        let result = self.enter_frame(func, &captured, args, span);
        let items = self.yield_buffers.pop().expect("yield buffer pushed above");
        result?;
        if let HeapData::Generator(GenState::Ready { items: slot, .. }) = self.heap.get_mut(id) {
            *slot = items;
        }
        Ok(())
    }

    // -- Calls --

    fn call_value(
        &mut self,
        callee: Value,
        args: Vec<Value>,
        kwargs: Vec<(StringId, Value)>,
        span: Span,
    ) -> RunResult<Value> {
        match callee {
            Value::Function(fid) => self.call_function(fid, &[], args, kwargs, span),
            Value::Class(cid) => self.instantiate(cid, args, kwargs, span),
            Value::Builtin(Builtin::Fn(f)) => self.call_builtin(f, args, kwargs, span),
            Value::Builtin(Builtin::Type(p)) => self.convert(p, args, span),
            Value::Builtin(Builtin::Exc(kind)) => {
                let message = match args.first() {
                    Some(v) => Some(value_str(v, &self.heap, self.interner, self.module)),
                    None => None,
                };
                let id = self.heap.allocate(HeapData::Exception(ExcValue::new(kind, message)));
                Ok(Value::Ref(id))
            }
            Value::Ref(id) => match self.heap.get(id) {
                HeapData::Closure { func, captured } => {
                    let (func, captured) = (*func, captured.clone());
                    self.call_function(func, &captured, args, kwargs, span)
                }
                HeapData::BoundMethod { recv, func } => {
                    let (recv, func) = (*recv, *func);
                    let mut with_self = Vec::with_capacity(args.len() + 1);
                    with_self.push(recv);
                    with_self.extend(args);
                    self.call_function(func, &[], with_self, kwargs, span)
                }
                HeapData::Instance { class, .. } => {
                    let class = *class;
                    if let Some(fid) = self.module.find_method(class, StaticStr::DunderCall.id()) {
                        let mut with_self = Vec::with_capacity(args.len() + 1);
                        with_self.push(callee);
                        with_self.extend(args);
                        return self.call_function(fid, &[], with_self, kwargs, span);
                    }
                    Err(RunError::type_error("object is not callable", span))
                }
                _ => Err(RunError::type_error("object is not callable", span)),
            },
            _ => Err(RunError::type_error("object is not callable", span)),
        }
    }

    /// Binds arguments positionally, then by keyword, applying defaults for
    /// missing parameters; returns values in slot order.
    fn bind_params(
        &mut self,
        fid: FuncId,
        args: Vec<Value>,
        kwargs: Vec<(StringId, Value)>,
        span: Span,
    ) -> RunResult<Vec<Value>> {
        let module = self.module;
        let func = module.func(fid);
        let positional = &func.args.args;
        let name = self.interner.get(func.name).to_owned();

        let mut bound: Vec<Option<Value>> = vec![None; positional.len()];
        let mut extra: Vec<Value> = Vec::new();
        for (i, arg) in args.into_iter().enumerate() {
            if i < bound.len() {
                bound[i] = Some(arg);
            } else if func.args.vararg.is_some() {
                extra.push(arg);
            } else {
                return Err(RunError::type_error(
                    format!("{name}() takes {} positional arguments", bound.len()),
                    span,
                ));
            }
        }

        let mut kw_bound: Vec<Option<Value>> = vec![None; func.args.kwonly_args.len()];
        let mut kw_extra: Vec<(Value, Value)> = Vec::new();
        for (kw_name, kw_value) in kwargs {
            if let Some(i) = positional.iter().position(|p| p.name == kw_name) {
                if bound[i].is_some() {
                    let kw = self.interner.get(kw_name);
                    return Err(RunError::type_error(
                        format!("{name}() got multiple values for argument '{kw}'"),
                        span,
                    ));
                }
                bound[i] = Some(kw_value);
            } else if let Some(i) = func.args.kwonly_args.iter().position(|p| p.name == kw_name) {
                kw_bound[i] = Some(kw_value);
            } else if func.args.kwarg.is_some() {
                kw_extra.push((Value::InternStr(kw_name), kw_value));
            } else {
                let kw = self.interner.get(kw_name);
                return Err(RunError::type_error(
                    format!("{name}() got an unexpected keyword argument '{kw}'"),
                    span,
                ));
            }
        }

        // Defaults evaluate at call time, in the calling frame.
        let mut values = Vec::with_capacity(func.args.param_count());
        for (i, param) in positional.iter().enumerate() {
            match bound[i].take() {
                Some(v) => values.push(v),
                None => match &param.default {
                    Some(default) => match self.exec_value(default, 0) {
                        Some(v) => values.push(v),
                        None => return Ok(values),
                    },
                    None => {
                        let missing = self.interner.get(param.name);
                        return Err(RunError::type_error(
                            format!("{name}() missing required argument '{missing}'"),
                            span,
                        ));
                    }
                },
            }
        }
        if func.args.vararg.is_some() {
            let rest = Value::Ref(self.heap.allocate(HeapData::Tuple(extra)));
            values.push(rest);
        }
        for (i, param) in func.args.kwonly_args.iter().enumerate() {
            match kw_bound[i].take() {
                Some(v) => values.push(v),
                None => match &param.default {
                    Some(default) => match self.exec_value(default, 0) {
                        Some(v) => values.push(v),
                        None => return Ok(values),
                    },
                    None => {
                        let missing = self.interner.get(param.name);
                        return Err(RunError::type_error(
                            format!("{name}() missing required keyword argument '{missing}'"),
                            span,
                        ));
                    }
                },
            }
        }
        if func.args.kwarg.is_some() {
            let rest = Value::Ref(self.heap.allocate(HeapData::Dict(kw_extra)));
            values.push(rest);
        }
        Ok(values)
    }

    fn call_function(
        &mut self,
        fid: FuncId,
        captured: &[Value],
        args: Vec<Value>,
        kwargs: Vec<(StringId, Value)>,
        span: Span,
    ) -> RunResult<Value> {
        let module = self.module;
        let func = module.func(fid);
        if func.is_generator {
            let params = self.bind_params(fid, args, kwargs, span)?;
            let id = self.heap.allocate(HeapData::Generator(GenState::Pending {
                func: fid,
                captured: captured.to_vec(),
                args: params,
            }));
            return Ok(Value::Ref(id));
        }
        if func.is_async {
            let params = self.bind_params(fid, args, kwargs, span)?;
            let id = self.heap.allocate(HeapData::Coroutine {
                func: fid,
                captured: captured.to_vec(),
                args: params,
                done: false,
            });
            return Ok(Value::Ref(id));
        }
        let params = self.bind_params(fid, args, kwargs, span)?;
        if !self.running() {
            return Ok(Value::None);
        }
        self.enter_frame(fid, captured, params, span)
    }

    /// Pushes a frame, binds slots, runs the body, and restores the
    /// caller's watermark.
    fn enter_frame(&mut self, fid: FuncId, captured: &[Value], params: Vec<Value>, span: Span) -> RunResult<Value> {
        if self.frames.len() >= MAX_CALL_DEPTH {
            return Err(RunError::raise(
                ExcKind::RecursionError,
                "maximum recursion depth exceeded",
                span,
            ));
        }
        let module = self.module;
        let func = module.func(fid);
        let base = self.bindings.len();
        for _ in 0..func.nlocals {
            self.bindings
                .add(StaticStr::Empty.id(), Value::Undefined, crate::types::Ty::Unknown);
        }
        for (i, value) in params.into_iter().enumerate() {
            self.bindings.set_value(base + i, value);
        }
        for (capture, value) in func.captures.iter().zip(captured) {
            self.bindings.set_value(base + capture.target_slot as usize, *value);
        }
        for &slot in &func.cell_slots {
            let current = self.bindings.get(base + slot as usize).value;
            // A captured cell stays shared; a fresh local gets its own cell.
            let already_cell =
                matches!(current, Value::Ref(id) if matches!(self.heap.get(id), HeapData::Cell(_)));
            if !already_cell {
                let cell = self.heap.allocate(HeapData::Cell(current));
                self.bindings.set_value(base + slot as usize, Value::Ref(cell));
            }
        }

        self.frames.push(base);
        let name = self.interner.get(func.name).to_owned();
        self.tracer.on_call(&name, span);
        self.traces.push(TraceFrame {
            function: func.name,
            span,
        });

        self.exec_body(&func.body, 0);

        let result = match self.status {
            FrameStatus::ReturnPending => {
                self.status = FrameStatus::Running;
                self.return_value.take().unwrap_or(Value::None)
            }
            FrameStatus::BreakPending | FrameStatus::ContinuePending => {
                // Loops never leak these across a call boundary.
                self.status = FrameStatus::Running;
                Value::None
            }
            _ => Value::None,
        };

        self.traces.pop();
        self.tracer.on_return(&name);
        self.frames.pop();
        self.bindings.truncate_to(base);
        Ok(result)
    }

    /// Calls a dunder method on an instance, when the class defines it.
    fn call_dunder(
        &mut self,
        recv: Value,
        name: StringId,
        args: Vec<Value>,
        span: Span,
    ) -> RunResult<Option<Value>> {
        let class = match recv {
            Value::Ref(id) => match self.heap.get(id) {
                HeapData::Instance { class, .. } => Some(*class),
                HeapData::Generator(_) => {
                    if name == StaticStr::DunderNext.id() {
                        let Value::Ref(gen_id) = recv else { unreachable!() };
                        return Ok(Some(self.generator_next(gen_id, span)?));
                    }
                    None
                }
                _ => None,
            },
            _ => None,
        };
        let Some(class) = class else { return Ok(None) };
        let Some(fid) = self.module.find_method(class, name) else {
            return Ok(None);
        };
        let mut with_self = Vec::with_capacity(args.len() + 1);
        with_self.push(recv);
        with_self.extend(args);
        self.call_function(fid, &[], with_self, Vec::new(), span).map(Some)
    }

    fn generator_next(&mut self, id: HeapId, span: Span) -> RunResult<Value> {
        self.pump_generator(id, span)?;
        if !self.running() {
            return Ok(Value::None);
        }
        match self.heap.get_mut(id) {
            HeapData::Generator(GenState::Ready { items, cursor }) => {
                if *cursor < items.len() {
                    let v = items[*cursor];
                    *cursor += 1;
                    Ok(v)
                } else {
                    Err(RunError::stop_iteration(span))
                }
            }
            _ => Err(RunError::stop_iteration(span)),
        }
    }

    fn instantiate(
        &mut self,
        cid: ClassId,
        args: Vec<Value>,
        kwargs: Vec<(StringId, Value)>,
        span: Span,
    ) -> RunResult<Value> {
        let module = self.module;
        let class = module.class(cid);

        // Exception classes without __init__ take an optional message.
        if class.exc_base.is_some() && module.find_method(cid, StaticStr::DunderInit.id()).is_none() {
            let kind = class.exc_base.expect("checked is_some");
            let message = args
                .first()
                .map(|v| value_str(v, &self.heap, self.interner, self.module));
            let id = self
                .heap
                .allocate(HeapData::Exception(ExcValue::with_class(kind, cid, message)));
            return Ok(Value::Ref(id));
        }

        // Attribute array in declaration order, bases first; defaults are
        // evaluated at call time.
        let mut attr_names: Vec<StringId> = Vec::new();
        let mut chain: Vec<ClassId> = Vec::new();
        let mut current = Some(cid);
        while let Some(c) = current {
            chain.push(c);
            current = module.class(c).base_class;
        }
        for c in chain.iter().rev() {
            for name in module.class(*c).attrs.keys() {
                if !attr_names.contains(name) {
                    attr_names.push(*name);
                }
            }
        }
        let mut attrs: Vec<(StringId, Value)> = Vec::with_capacity(attr_names.len());
        for name in &attr_names {
            let default = chain
                .iter()
                .find_map(|c| module.class(*c).attrs.get(name).and_then(|a| a.default.as_ref()));
            let value = match default {
                Some(expr) => match self.exec_value(expr, 0) {
                    Some(v) => v,
                    None => return Ok(Value::None),
                },
                None => Value::Undefined,
            };
            attrs.push((*name, value));
        }
        let instance = Value::Ref(self.heap.allocate(HeapData::Instance { class: cid, attrs }));

        if let Some(init) = module.find_method(cid, StaticStr::DunderInit.id()) {
            let mut with_self = Vec::with_capacity(args.len() + 1);
            with_self.push(instance);
            with_self.extend(args);
            self.call_function(init, &[], with_self, kwargs, span)?;
            return Ok(instance);
        }

        // No __init__: the declared attribute list is the constructor
        // signature, in declaration order.
        if args.len() > attr_names.len() {
            let name = self.interner.get(class.name);
            return Err(RunError::type_error(
                format!("{name}() takes at most {} arguments", attr_names.len()),
                span,
            ));
        }
        let Value::Ref(id) = instance else { unreachable!() };
        for (i, arg) in args.into_iter().enumerate() {
            if let HeapData::Instance { attrs, .. } = self.heap.get_mut(id) {
                attrs[i].1 = arg;
            }
        }
        for (kw_name, kw_value) in kwargs {
            self.set_attr(instance, kw_name, kw_value, span)?;
        }
        Ok(instance)
    }

    // -- Builtins --

    fn call_builtin(
        &mut self,
        f: BuiltinFn,
        args: Vec<Value>,
        kwargs: Vec<(StringId, Value)>,
        span: Span,
    ) -> RunResult<Value> {
        match f {
            BuiltinFn::Print => {
                let mut sep = Cow::Borrowed(" ");
                let mut end = Cow::Borrowed("\n");
                for (name, value) in &kwargs {
                    match self.interner.get(*name) {
                        "sep" => {
                            sep = Cow::Owned(value_str(value, &self.heap, self.interner, self.module));
                        }
                        "end" => {
                            end = Cow::Owned(value_str(value, &self.heap, self.interner, self.module));
                        }
                        other => {
                            return Err(RunError::type_error(
                                format!("print() got an unexpected keyword argument '{other}'"),
                                span,
                            ));
                        }
                    }
                }
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        for c in sep.chars() {
                            self.writer.stdout_push(c);
                        }
                    }
                    let text = value_str(arg, &self.heap, self.interner, self.module);
                    self.writer.stdout_write(Cow::Owned(text));
                }
                for c in end.chars() {
                    self.writer.stdout_push(c);
                }
                Ok(Value::None)
            }
            BuiltinFn::Len => {
                let [arg] = args.as_slice() else {
                    return Err(RunError::type_error("len() takes exactly one argument", span));
                };
                match self.py_len(arg) {
                    Some(n) => Ok(Value::Int(n as i64)),
                    None => Err(RunError::type_error("object has no len()", span)),
                }
            }
            BuiltinFn::Range => {
                let ints: Vec<i64> = args
                    .iter()
                    .map(|v| {
                        v.as_integer()
                            .ok_or_else(|| RunError::type_error("range() expects integers", span))
                    })
                    .collect::<RunResult<_>>()?;
                let (start, stop, step) = match ints.as_slice() {
                    [stop] => (0, *stop, 1),
                    [start, stop] => (*start, *stop, 1),
                    [start, stop, step] => {
                        if *step == 0 {
                            return Err(RunError::value_error("range() step must not be zero", span));
                        }
                        (*start, *stop, *step)
                    }
                    _ => return Err(RunError::type_error("range() takes 1 to 3 arguments", span)),
                };
                Ok(Value::Ref(self.heap.allocate(HeapData::Range { start, stop, step })))
            }
            BuiltinFn::Int => {
                let [arg] = args.as_slice() else {
                    return Err(RunError::type_error("int() takes exactly one argument", span));
                };
                self.convert(TyPrim::I64, vec![*arg], span)
            }
            BuiltinFn::Float => {
                let [arg] = args.as_slice() else {
                    return Err(RunError::type_error("float() takes exactly one argument", span));
                };
                self.convert(TyPrim::F64, vec![*arg], span)
            }
            BuiltinFn::Abs => {
                let [arg] = args.as_slice() else {
                    return Err(RunError::type_error("abs() takes exactly one argument", span));
                };
                match arg {
                    Value::Int(v) => Ok(Value::Int(v.wrapping_abs())),
                    Value::F32(v) => Ok(Value::F32(v.abs())),
                    Value::F64(v) => Ok(Value::F64(v.abs())),
                    Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
                    _ => Err(RunError::type_error("bad operand type for abs()", span)),
                }
            }
            BuiltinFn::Min | BuiltinFn::Max => {
                let items = if args.len() == 1 {
                    self.materialize(args[0], span)?
                } else {
                    args
                };
                if items.is_empty() {
                    return Err(RunError::value_error(format!("{f}() of an empty sequence"), span));
                }
                let mut best = items[0];
                for item in &items[1..] {
                    let ord = py_cmp(item, &best, &self.heap, self.interner)
                        .ok_or_else(|| RunError::type_error("values are not orderable", span))?;
                    let take = match f {
                        BuiltinFn::Min => ord == std::cmp::Ordering::Less,
                        _ => ord == std::cmp::Ordering::Greater,
                    };
                    if take {
                        best = *item;
                    }
                }
                Ok(best)
            }
            BuiltinFn::Isinstance => {
                let [value, class] = args.as_slice() else {
                    return Err(RunError::type_error("isinstance() takes exactly two arguments", span));
                };
                Ok(Value::Bool(self.isinstance(value, class)))
            }
            BuiltinFn::Repr => {
                let [arg] = args.as_slice() else {
                    return Err(RunError::type_error("repr() takes exactly one argument", span));
                };
                let text = value_repr(arg, &self.heap, self.interner, self.module);
                Ok(Value::Ref(self.heap.alloc_str(text)))
            }
        }
    }

    fn py_len(&self, value: &Value) -> Option<usize> {
        match value {
            Value::InternStr(id) => Some(self.interner.get(*id).chars().count()),
            Value::Ref(id) => match self.heap.get(*id) {
                HeapData::Str(s) => Some(s.chars().count()),
                HeapData::List(items) | HeapData::Tuple(items) | HeapData::Set(items) => Some(items.len()),
                HeapData::Dict(pairs) => Some(pairs.len()),
                HeapData::Range { start, stop, step } => Some(range_len(*start, *stop, *step)),
                _ => None,
            },
            _ => None,
        }
    }

    fn isinstance(&self, value: &Value, class: &Value) -> bool {
        match class {
            Value::Builtin(Builtin::Type(p)) => {
                let tag = value.type_tag(&self.heap);
                matches!(
                    (p, tag),
                    (TyPrim::Bool, crate::value::RtType::Bool)
                        | (TyPrim::I32 | TyPrim::I64, crate::value::RtType::Int)
                        | (TyPrim::F32, crate::value::RtType::F32)
                        | (TyPrim::F64, crate::value::RtType::F64)
                        | (TyPrim::Str, crate::value::RtType::Str)
                        | (TyPrim::NoneType, crate::value::RtType::NoneType)
                )
            }
            Value::Builtin(Builtin::Exc(kind)) => match value {
                Value::Ref(id) => match self.heap.get(*id) {
                    HeapData::Exception(exc) => exc.kind.is_subclass_of(*kind),
                    _ => false,
                },
                _ => false,
            },
            Value::Class(cid) => match value {
                Value::Ref(id) => match self.heap.get(*id) {
                    HeapData::Instance { class, .. } => self.module.is_subclass(*class, *cid),
                    HeapData::Exception(exc) => exc.class.is_some_and(|c| self.module.is_subclass(c, *cid)),
                    _ => false,
                },
                _ => false,
            },
            Value::Ref(id) => match self.heap.get(*id) {
                HeapData::Tuple(options) => {
                    let options = options.clone();
                    options.iter().any(|c| self.isinstance(value, c))
                }
                _ => false,
            },
            _ => false,
        }
    }

    fn convert(&mut self, target: TyPrim, args: Vec<Value>, span: Span) -> RunResult<Value> {
        let arg = match args.as_slice() {
            [] => {
                return Ok(match target {
                    TyPrim::I32 | TyPrim::I64 => Value::Int(0),
                    TyPrim::F32 => Value::F32(0.0),
                    TyPrim::F64 => Value::F64(0.0),
                    TyPrim::Bool => Value::Bool(false),
                    TyPrim::Str => Value::InternStr(StaticStr::Empty.id()),
                    TyPrim::NoneType => Value::None,
                });
            }
            [arg] => *arg,
            _ => return Err(RunError::type_error(format!("{target}() takes at most one argument"), span)),
        };
        match target {
            TyPrim::I32 | TyPrim::I64 => match &arg {
                Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
                Value::Int(v) => Ok(Value::Int(*v)),
                Value::F32(v) => Ok(Value::Int(*v as i64)),
                Value::F64(v) => Ok(Value::Int(*v as i64)),
                _ => match arg.str_contents(&self.heap, self.interner) {
                    Some(s) => s
                        .trim()
                        .parse::<i64>()
                        .map(Value::Int)
                        .map_err(|_| RunError::value_error(format!("invalid integer literal: '{s}'"), span)),
                    None => Err(RunError::type_error("cannot convert to int", span)),
                },
            },
            TyPrim::F32 | TyPrim::F64 => match arg.as_number() {
                Some(v) => Ok(if target == TyPrim::F32 {
                    Value::F32(v as f32)
                } else {
                    Value::F64(v)
                }),
                None => match arg.str_contents(&self.heap, self.interner) {
                    Some(s) => s
                        .trim()
                        .parse::<f64>()
                        .map(Value::F64)
                        .map_err(|_| RunError::value_error(format!("invalid float literal: '{s}'"), span)),
                    None => Err(RunError::type_error("cannot convert to float", span)),
                },
            },
            TyPrim::Bool => Ok(Value::Bool(arg.truthy(&self.heap, self.interner))),
            TyPrim::Str => {
                if let Some(result) = self.call_dunder(arg, StaticStr::DunderStr.id(), Vec::new(), span)? {
                    return Ok(result);
                }
                let text = value_str(&arg, &self.heap, self.interner, self.module);
                Ok(Value::Ref(self.heap.alloc_str(text)))
            }
            TyPrim::NoneType => Err(RunError::type_error("cannot instantiate None", span)),
        }
    }

    // -- Operators --

    fn apply_binop(&mut self, op: BinOpKind, resolved: &OpImpl, l: Value, r: Value, span: Span) -> RunResult<Value> {
        match resolved {
            OpImpl::Native(intr) => self.apply_intrinsic_bin(*intr, l, r, span),
            OpImpl::User(fid) => self.call_function(*fid, &[], vec![l, r], Vec::new(), span),
            OpImpl::Unresolved => self.dynamic_binop(op, l, r, span),
        }
    }

    /// Runtime dispatch when sema could not type the operands.
    fn dynamic_binop(&mut self, op: BinOpKind, l: Value, r: Value, span: Span) -> RunResult<Value> {
        if l.as_integer().is_some() && r.as_integer().is_some() {
            return self.apply_intrinsic_bin(Intrinsic::IntBin(op), l, r, span);
        }
        if l.as_number().is_some() && r.as_number().is_some() {
            return self.apply_intrinsic_bin(Intrinsic::FloatBin(op), l, r, span);
        }
        let l_is_str = l.str_contents(&self.heap, self.interner).is_some();
        let r_is_str = r.str_contents(&self.heap, self.interner).is_some();
        if l_is_str && r_is_str && op == BinOpKind::Add {
            return self.apply_intrinsic_bin(Intrinsic::StrConcat, l, r, span);
        }
        if op == BinOpKind::Mult && ((l_is_str && r.as_integer().is_some()) || (r_is_str && l.as_integer().is_some()))
        {
            return self.apply_intrinsic_bin(Intrinsic::StrRepeat, l, r, span);
        }
        if op == BinOpKind::Add {
            if let (Value::Ref(a), Value::Ref(b)) = (&l, &r) {
                if matches!(self.heap.get(*a), HeapData::List(_)) && matches!(self.heap.get(*b), HeapData::List(_)) {
                    return self.apply_intrinsic_bin(Intrinsic::ListConcat, l, r, span);
                }
            }
        }
        if let Some(result) = self.call_dunder(l, dunder_for_binop(op).id(), vec![r], span)? {
            return Ok(result);
        }
        if let Some(result) = self.call_dunder(r, reflected_dunder_for_binop(op).id(), vec![l], span)? {
            return Ok(result);
        }
        let lt = l.type_tag(&self.heap);
        let rt = r.type_tag(&self.heap);
        Err(RunError::type_error(
            format!("unsupported operand type(s) for {}: '{lt}' and '{rt}'", op.symbol()),
            span,
        ))
    }

    fn apply_intrinsic_bin(&mut self, intr: Intrinsic, l: Value, r: Value, span: Span) -> RunResult<Value> {
        match intr {
            Intrinsic::IntBin(op) => {
                let (Some(a), Some(b)) = (l.as_integer(), r.as_integer()) else {
                    return self.dynamic_binop(op, l, r, span);
                };
                int_binop(op, a, b, span)
            }
            Intrinsic::FloatBin(op) => {
                let (Some(a), Some(b)) = (l.as_number(), r.as_number()) else {
                    return self.dynamic_binop(op, l, r, span);
                };
                let result = float_binop(op, a, b, span)?;
                if matches!((l, r), (Value::F32(_), Value::F32(_))) {
                    if let Value::F64(v) = result {
                        return Ok(Value::F32(v as f32));
                    }
                }
                Ok(result)
            }
            Intrinsic::StrConcat => {
                let a = l.str_contents(&self.heap, self.interner).unwrap_or_default().to_owned();
                let b = r.str_contents(&self.heap, self.interner).unwrap_or_default();
                let joined = format!("{a}{b}");
                Ok(Value::Ref(self.heap.alloc_str(joined)))
            }
            Intrinsic::StrRepeat => {
                let (s, n) = if l.str_contents(&self.heap, self.interner).is_some() {
                    (l, r)
                } else {
                    (r, l)
                };
                let text = s.str_contents(&self.heap, self.interner).unwrap_or_default().to_owned();
                let count = n.as_integer().unwrap_or(0).max(0) as usize;
                Ok(Value::Ref(self.heap.alloc_str(text.repeat(count))))
            }
            Intrinsic::ListConcat => {
                let (Value::Ref(a), Value::Ref(b)) = (l, r) else {
                    return Err(RunError::type_error("can only concatenate lists", span));
                };
                let (HeapData::List(xs), HeapData::List(ys)) = (self.heap.get(a), self.heap.get(b)) else {
                    return Err(RunError::type_error("can only concatenate lists", span));
                };
                let mut out = xs.clone();
                out.extend(ys.iter().copied());
                Ok(Value::Ref(self.heap.allocate(HeapData::List(out))))
            }
            Intrinsic::ListRepeat => {
                let (list, n) = match (&l, &r) {
                    (Value::Ref(_), _) => (l, r),
                    _ => (r, l),
                };
                let Value::Ref(id) = list else {
                    return Err(RunError::type_error("can only repeat lists", span));
                };
                let HeapData::List(items) = self.heap.get(id) else {
                    return Err(RunError::type_error("can only repeat lists", span));
                };
                let count = n.as_integer().unwrap_or(0).max(0) as usize;
                let mut out = Vec::with_capacity(items.len() * count);
                for _ in 0..count {
                    out.extend(items.iter().copied());
                }
                Ok(Value::Ref(self.heap.allocate(HeapData::List(out))))
            }
            Intrinsic::IntCmp(op) | Intrinsic::FloatCmp(op) | Intrinsic::StrCmp(op) => {
                let ord = py_cmp(&l, &r, &self.heap, self.interner)
                    .ok_or_else(|| RunError::type_error("values are not orderable", span))?;
                Ok(Value::Bool(cmp_matches(op, ord)))
            }
            Intrinsic::EqAny(op) => {
                let result = match op {
                    CmpOpKind::Eq => py_eq(&l, &r, &self.heap, self.interner),
                    CmpOpKind::NotEq => !py_eq(&l, &r, &self.heap, self.interner),
                    CmpOpKind::Is => py_is(&l, &r),
                    CmpOpKind::IsNot => !py_is(&l, &r),
                    _ => unreachable!("EqAny only carries equality operators"),
                };
                Ok(Value::Bool(result))
            }
            Intrinsic::Contains(op) => {
                let found = self.contains(&r, &l, span)?;
                Ok(Value::Bool(if op == CmpOpKind::NotIn { !found } else { found }))
            }
            Intrinsic::BoolJoin(_) => unreachable!("boolop short-circuits before intrinsic application"),
            Intrinsic::IntUnary(op) => {
                let Some(a) = l.as_integer() else {
                    return Err(RunError::type_error("bad operand for unary operator", span));
                };
                Ok(match op {
                    UnaryOpKind::USub => Value::Int(a.wrapping_neg()),
                    UnaryOpKind::UAdd => Value::Int(a),
                    UnaryOpKind::Invert => Value::Int(!a),
                    UnaryOpKind::Not => Value::Bool(a == 0),
                })
            }
            Intrinsic::FloatUnary(op) => {
                let Some(a) = l.as_number() else {
                    return Err(RunError::type_error("bad operand for unary operator", span));
                };
                let result = match op {
                    UnaryOpKind::USub => -a,
                    UnaryOpKind::UAdd => a,
                    _ => return Err(RunError::type_error("bad operand for unary operator", span)),
                };
                Ok(match l {
                    Value::F32(_) => Value::F32(result as f32),
                    _ => Value::F64(result),
                })
            }
            Intrinsic::NotTruth => Ok(Value::Bool(!l.truthy(&self.heap, self.interner))),
        }
    }

    fn contains(&mut self, container: &Value, needle: &Value, span: Span) -> RunResult<bool> {
        match container {
            Value::Ref(id) => match self.heap.get(*id) {
                HeapData::List(items) | HeapData::Tuple(items) | HeapData::Set(items) => {
                    Ok(items.iter().any(|v| py_eq(v, needle, &self.heap, self.interner)))
                }
                HeapData::Dict(pairs) => Ok(pairs.iter().any(|(k, _)| py_eq(k, needle, &self.heap, self.interner))),
                HeapData::Str(s) => match needle.str_contents(&self.heap, self.interner) {
                    Some(sub) => Ok(s.contains(sub)),
                    None => Err(RunError::type_error("'in <str>' requires a string operand", span)),
                },
                HeapData::Range { start, stop, step } => match needle.as_integer() {
                    Some(n) => {
                        let (start, stop, step) = (*start, *stop, *step);
                        let in_bounds = if step > 0 { n >= start && n < stop } else { n <= start && n > stop };
                        Ok(in_bounds && (n - start) % step == 0)
                    }
                    None => Ok(false),
                },
                HeapData::Instance { .. } => {
                    let container = *container;
                    match self.call_dunder(container, StaticStr::DunderContains.id(), vec![*needle], span)? {
                        Some(v) => Ok(v.truthy(&self.heap, self.interner)),
                        None => Err(RunError::type_error("object is not a container", span)),
                    }
                }
                _ => Err(RunError::type_error("object is not a container", span)),
            },
            Value::InternStr(sid) => match needle.str_contents(&self.heap, self.interner) {
                Some(sub) => Ok(self.interner.get(*sid).contains(sub)),
                None => Err(RunError::type_error("'in <str>' requires a string operand", span)),
            },
            _ => Err(RunError::type_error("object is not a container", span)),
        }
    }

    fn apply_cmp(&mut self, op: CmpOpKind, resolved: &OpImpl, l: Value, r: Value, span: Span) -> RunResult<Value> {
        match resolved {
            OpImpl::Native(intr) => self.apply_intrinsic_bin(*intr, l, r, span),
            OpImpl::User(fid) => self.call_function(*fid, &[], vec![l, r], Vec::new(), span),
            OpImpl::Unresolved => {
                // Runtime fallback mirrors sema's table order.
                match op {
                    CmpOpKind::Eq | CmpOpKind::NotEq | CmpOpKind::Is | CmpOpKind::IsNot => {
                        self.apply_intrinsic_bin(Intrinsic::EqAny(op), l, r, span)
                    }
                    CmpOpKind::In | CmpOpKind::NotIn => self.apply_intrinsic_bin(Intrinsic::Contains(op), l, r, span),
                    _ => {
                        let ord = py_cmp(&l, &r, &self.heap, self.interner)
                            .ok_or_else(|| RunError::type_error("values are not orderable", span))?;
                        Ok(Value::Bool(cmp_matches(op, ord)))
                    }
                }
            }
        }
    }

    fn apply_unary(&mut self, op: UnaryOpKind, resolved: &OpImpl, v: Value, span: Span) -> RunResult<Value> {
        match resolved {
            OpImpl::Native(intr) => self.apply_intrinsic_bin(*intr, v, Value::None, span),
            OpImpl::User(fid) => self.call_function(*fid, &[], vec![v], Vec::new(), span),
            OpImpl::Unresolved => {
                if op == UnaryOpKind::Not {
                    return Ok(Value::Bool(!v.truthy(&self.heap, self.interner)));
                }
                if v.as_integer().is_some() {
                    return self.apply_intrinsic_bin(Intrinsic::IntUnary(op), v, Value::None, span);
                }
                if v.as_number().is_some() {
                    return self.apply_intrinsic_bin(Intrinsic::FloatUnary(op), v, Value::None, span);
                }
                if let Some(name) = dunder_for_unary(op) {
                    if let Some(result) = self.call_dunder(v, name.id(), Vec::new(), span)? {
                        return Ok(result);
                    }
                }
                Err(RunError::type_error("bad operand for unary operator", span))
            }
        }
    }

    // -- Native container methods --

    /// Methods on builtin containers, dispatched by name. `Ok(None)` means
    /// the receiver has no such method.
    fn call_native_method(
        &mut self,
        recv: Value,
        name: &str,
        args: Vec<Value>,
        span: Span,
    ) -> RunResult<Option<Value>> {
        if let Value::InternStr(sid) = recv {
            let s = self.interner.get(sid).to_owned();
            return self.str_method(&s, name, args, span);
        }
        let Value::Ref(id) = recv else { return Ok(None) };
        match self.heap.get(id).clone() {
            HeapData::List(_) => self.list_method(id, name, args, span),
            HeapData::Dict(_) => self.dict_method(id, name, args, span),
            HeapData::Str(s) => self.str_method(&s, name, args, span),
            HeapData::Set(_) => self.set_method(id, name, args, span),
            _ => Ok(None),
        }
    }

    fn list_method(&mut self, id: HeapId, name: &str, args: Vec<Value>, span: Span) -> RunResult<Option<Value>> {
        let arity = args.len();
        let arg0 = args.first().copied();
        match name {
            "append" => {
                let Some(v) = arg0 else {
                    return Err(RunError::type_error("append() takes exactly one argument", span));
                };
                if let HeapData::List(items) = self.heap.get_mut(id) {
                    items.push(v);
                }
                Ok(Some(Value::None))
            }
            "extend" => {
                let Some(v) = arg0 else {
                    return Err(RunError::type_error("extend() takes exactly one argument", span));
                };
                let values = self.materialize(v, span)?;
                if let HeapData::List(items) = self.heap.get_mut(id) {
                    items.extend(values);
                }
                Ok(Some(Value::None))
            }
            "insert" => {
                let (Some(pos), Some(v)) = (arg0.and_then(|v| v.as_integer()), args.get(1).copied()) else {
                    return Err(RunError::type_error("insert() takes an index and a value", span));
                };
                if let HeapData::List(items) = self.heap.get_mut(id) {
                    let i = (pos.max(0) as usize).min(items.len());
                    items.insert(i, v);
                }
                Ok(Some(Value::None))
            }
            "pop" => {
                let index = match arg0 {
                    Some(v) => v
                        .as_integer()
                        .ok_or_else(|| RunError::type_error("pop() index must be an integer", span))?,
                    None => -1,
                };
                let HeapData::List(items) = self.heap.get_mut(id) else { unreachable!() };
                if items.is_empty() {
                    return Err(RunError::index_error("pop from empty list", span));
                }
                let len = items.len();
                let i = if index < 0 { index + len as i64 } else { index };
                if i < 0 || i >= len as i64 {
                    return Err(RunError::index_error("pop index out of range", span));
                }
                Ok(Some(items.remove(i as usize)))
            }
            "remove" => {
                let Some(v) = arg0 else {
                    return Err(RunError::type_error("remove() takes exactly one argument", span));
                };
                let items = match self.heap.get(id) {
                    HeapData::List(items) => items.clone(),
                    _ => unreachable!(),
                };
                let pos = items.iter().position(|x| py_eq(x, &v, &self.heap, self.interner));
                match pos {
                    Some(i) => {
                        if let HeapData::List(items) = self.heap.get_mut(id) {
                            items.remove(i);
                        }
                        Ok(Some(Value::None))
                    }
                    None => Err(RunError::value_error("list.remove(x): x not in list", span)),
                }
            }
            "clear" => {
                if let HeapData::List(items) = self.heap.get_mut(id) {
                    items.clear();
                }
                Ok(Some(Value::None))
            }
            "index" => {
                let Some(v) = arg0 else {
                    return Err(RunError::type_error("index() takes exactly one argument", span));
                };
                let items = match self.heap.get(id) {
                    HeapData::List(items) => items.clone(),
                    _ => unreachable!(),
                };
                match items.iter().position(|x| py_eq(x, &v, &self.heap, self.interner)) {
                    Some(i) => Ok(Some(Value::Int(i as i64))),
                    None => Err(RunError::value_error("value is not in list", span)),
                }
            }
            "count" => {
                let Some(v) = arg0 else {
                    return Err(RunError::type_error("count() takes exactly one argument", span));
                };
                let items = match self.heap.get(id) {
                    HeapData::List(items) => items.clone(),
                    _ => unreachable!(),
                };
                let n = items.iter().filter(|x| py_eq(x, &v, &self.heap, self.interner)).count();
                Ok(Some(Value::Int(n as i64)))
            }
            "reverse" => {
                if arity != 0 {
                    return Err(RunError::type_error("reverse() takes no arguments", span));
                }
                if let HeapData::List(items) = self.heap.get_mut(id) {
                    items.reverse();
                }
                Ok(Some(Value::None))
            }
            "sort" => {
                let mut items = match self.heap.get(id) {
                    HeapData::List(items) => items.clone(),
                    _ => unreachable!(),
                };
                let mut sortable = true;
                items.sort_by(|a, b| match py_cmp(a, b, &self.heap, self.interner) {
                    Some(ord) => ord,
                    None => {
                        sortable = false;
                        std::cmp::Ordering::Equal
                    }
                });
                if !sortable {
                    return Err(RunError::type_error("list elements are not orderable", span));
                }
                if let HeapData::List(slot) = self.heap.get_mut(id) {
                    *slot = items;
                }
                Ok(Some(Value::None))
            }
            _ => Ok(None),
        }
    }

    fn dict_method(&mut self, id: HeapId, name: &str, args: Vec<Value>, span: Span) -> RunResult<Option<Value>> {
        let pairs = match self.heap.get(id) {
            HeapData::Dict(pairs) => pairs.clone(),
            _ => unreachable!(),
        };
        match name {
            "get" => {
                let key = args
                    .first()
                    .copied()
                    .ok_or_else(|| RunError::type_error("get() takes at least one argument", span))?;
                let default = args.get(1).copied().unwrap_or(Value::None);
                for (k, v) in &pairs {
                    if py_eq(k, &key, &self.heap, self.interner) {
                        return Ok(Some(*v));
                    }
                }
                Ok(Some(default))
            }
            "keys" => {
                let keys: Vec<Value> = pairs.iter().map(|(k, _)| *k).collect();
                Ok(Some(Value::Ref(self.heap.allocate(HeapData::List(keys)))))
            }
            "values" => {
                let values: Vec<Value> = pairs.iter().map(|(_, v)| *v).collect();
                Ok(Some(Value::Ref(self.heap.allocate(HeapData::List(values)))))
            }
            "items" => {
                let items: Vec<Value> = pairs
                    .iter()
                    .map(|(k, v)| Value::Ref(self.heap.allocate(HeapData::Tuple(vec![*k, *v]))))
                    .collect();
                Ok(Some(Value::Ref(self.heap.allocate(HeapData::List(items)))))
            }
            "pop" => {
                let key = args
                    .first()
                    .copied()
                    .ok_or_else(|| RunError::type_error("pop() takes at least one argument", span))?;
                let pos = pairs.iter().position(|(k, _)| py_eq(k, &key, &self.heap, self.interner));
                match pos {
                    Some(i) => {
                        let value = pairs[i].1;
                        if let HeapData::Dict(slot) = self.heap.get_mut(id) {
                            slot.remove(i);
                        }
                        Ok(Some(value))
                    }
                    None => match args.get(1) {
                        Some(default) => Ok(Some(*default)),
                        None => {
                            let repr = value_repr(&key, &self.heap, self.interner, self.module);
                            Err(RunError::key_error(repr, span))
                        }
                    },
                }
            }
            "setdefault" => {
                let key = args
                    .first()
                    .copied()
                    .ok_or_else(|| RunError::type_error("setdefault() takes at least one argument", span))?;
                let default = args.get(1).copied().unwrap_or(Value::None);
                for (k, v) in &pairs {
                    if py_eq(k, &key, &self.heap, self.interner) {
                        return Ok(Some(*v));
                    }
                }
                if let HeapData::Dict(slot) = self.heap.get_mut(id) {
                    slot.push((key, default));
                }
                Ok(Some(default))
            }
            "update" => {
                let other = args
                    .first()
                    .copied()
                    .ok_or_else(|| RunError::type_error("update() takes exactly one argument", span))?;
                let Value::Ref(other_id) = other else {
                    return Err(RunError::type_error("update() expects a dict", span));
                };
                let HeapData::Dict(other_pairs) = self.heap.get(other_id) else {
                    return Err(RunError::type_error("update() expects a dict", span));
                };
                let other_pairs = other_pairs.clone();
                for (k, v) in other_pairs {
                    self.set_item(Value::Ref(id), k, v, span)?;
                }
                Ok(Some(Value::None))
            }
            "clear" => {
                if let HeapData::Dict(slot) = self.heap.get_mut(id) {
                    slot.clear();
                }
                Ok(Some(Value::None))
            }
            _ => Ok(None),
        }
    }

    fn str_method(&mut self, s: &str, name: &str, args: Vec<Value>, span: Span) -> RunResult<Option<Value>> {
        let arg_str = |evaluator: &Self, i: usize| -> Option<String> {
            args.get(i)
                .and_then(|v| v.str_contents(&evaluator.heap, evaluator.interner))
                .map(str::to_owned)
        };
        let result: Option<Value> = match name {
            "upper" => Some(self.alloc_string(s.to_uppercase())),
            "lower" => Some(self.alloc_string(s.to_lowercase())),
            "strip" => Some(self.alloc_string(s.trim().to_owned())),
            "lstrip" => Some(self.alloc_string(s.trim_start().to_owned())),
            "rstrip" => Some(self.alloc_string(s.trim_end().to_owned())),
            "split" => {
                let parts: Vec<Value> = match arg_str(self, 0) {
                    Some(sep) => s
                        .split(sep.as_str())
                        .map(|p| {
                            let p = p.to_owned();
                            self.alloc_string(p)
                        })
                        .collect(),
                    None => s
                        .split_whitespace()
                        .map(|p| {
                            let p = p.to_owned();
                            self.alloc_string(p)
                        })
                        .collect(),
                };
                Some(Value::Ref(self.heap.allocate(HeapData::List(parts))))
            }
            "join" => {
                let items = match args.first() {
                    Some(v) => self.materialize(*v, span)?,
                    None => return Err(RunError::type_error("join() takes exactly one argument", span)),
                };
                let mut parts = Vec::with_capacity(items.len());
                for item in &items {
                    match item.str_contents(&self.heap, self.interner) {
                        Some(text) => parts.push(text.to_owned()),
                        None => return Err(RunError::type_error("join() expects strings", span)),
                    }
                }
                Some(self.alloc_string(parts.join(s)))
            }
            "replace" => {
                let (Some(from), Some(to)) = (arg_str(self, 0), arg_str(self, 1)) else {
                    return Err(RunError::type_error("replace() takes two string arguments", span));
                };
                Some(self.alloc_string(s.replace(&from, &to)))
            }
            "startswith" => match arg_str(self, 0) {
                Some(prefix) => Some(Value::Bool(s.starts_with(&prefix))),
                None => return Err(RunError::type_error("startswith() takes a string argument", span)),
            },
            "endswith" => match arg_str(self, 0) {
                Some(suffix) => Some(Value::Bool(s.ends_with(&suffix))),
                None => return Err(RunError::type_error("endswith() takes a string argument", span)),
            },
            "find" => match arg_str(self, 0) {
                Some(needle) => {
                    let index = s.find(&needle).map_or(-1, |byte| s[..byte].chars().count() as i64);
                    Some(Value::Int(index))
                }
                None => return Err(RunError::type_error("find() takes a string argument", span)),
            },
            "count" => match arg_str(self, 0) {
                Some(needle) => Some(Value::Int(s.matches(&needle).count() as i64)),
                None => return Err(RunError::type_error("count() takes a string argument", span)),
            },
            _ => None,
        };
        Ok(result)
    }

    fn set_method(&mut self, id: HeapId, name: &str, args: Vec<Value>, span: Span) -> RunResult<Option<Value>> {
        let arg0 = args.first().copied();
        match name {
            "add" => {
                let Some(v) = arg0 else {
                    return Err(RunError::type_error("add() takes exactly one argument", span));
                };
                let items = match self.heap.get(id) {
                    HeapData::Set(items) => items.clone(),
                    _ => unreachable!(),
                };
                if !items.iter().any(|x| py_eq(x, &v, &self.heap, self.interner)) {
                    if let HeapData::Set(slot) = self.heap.get_mut(id) {
                        slot.push(v);
                    }
                }
                Ok(Some(Value::None))
            }
            "remove" | "discard" => {
                let Some(v) = arg0 else {
                    return Err(RunError::type_error("remove() takes exactly one argument", span));
                };
                let items = match self.heap.get(id) {
                    HeapData::Set(items) => items.clone(),
                    _ => unreachable!(),
                };
                let pos = items.iter().position(|x| py_eq(x, &v, &self.heap, self.interner));
                match pos {
                    Some(i) => {
                        if let HeapData::Set(slot) = self.heap.get_mut(id) {
                            slot.remove(i);
                        }
                        Ok(Some(Value::None))
                    }
                    None if name == "discard" => Ok(Some(Value::None)),
                    None => {
                        let repr = value_repr(&v, &self.heap, self.interner, self.module);
                        Err(RunError::key_error(repr, span))
                    }
                }
            }
            "clear" => {
                if let HeapData::Set(slot) = self.heap.get_mut(id) {
                    slot.clear();
                }
                Ok(Some(Value::None))
            }
            _ => Ok(None),
        }
    }

    fn alloc_string(&mut self, s: String) -> Value {
        Value::Ref(self.heap.alloc_str(s))
    }

    // -- Exceptions --

    /// Converts a raised value into an exception record.
    fn to_exc_value(&mut self, value: Value, span: Span) -> RunResult<ExcValue> {
        match value {
            Value::Builtin(Builtin::Exc(kind)) => Ok(ExcValue::new(kind, None)),
            Value::Class(cid) => {
                let instance = self.instantiate(cid, Vec::new(), Vec::new(), span)?;
                self.to_exc_value(instance, span)
            }
            Value::Ref(id) => match self.heap.get(id) {
                HeapData::Exception(exc) => Ok(exc.clone()),
                HeapData::Instance { class, .. } => {
                    let class = *class;
                    match self.module.class(class).exc_base {
                        Some(kind) => Ok(ExcValue::with_class(kind, class, None)),
                        None => Err(RunError::type_error("exceptions must derive from BaseException", span)),
                    }
                }
                _ => Err(RunError::type_error("exceptions must derive from BaseException", span)),
            },
            _ => Err(RunError::type_error("exceptions must derive from BaseException", span)),
        }
    }

    /// Does a raised exception match a handler's type expression value?
    fn exc_matches(&mut self, raised: &ExcValue, handler: &Value) -> bool {
        match handler {
            Value::Builtin(Builtin::Exc(kind)) => raised.kind.is_subclass_of(*kind),
            Value::Class(cid) => raised.class.is_some_and(|c| self.module.is_subclass(c, *cid)),
            Value::Ref(id) => match self.heap.get(*id) {
                HeapData::Tuple(options) => {
                    let options = options.clone();
                    options.iter().any(|h| self.exc_matches(raised, h))
                }
                _ => false,
            },
            _ => false,
        }
    }

    fn exc_to_value(&mut self, exc: &ExcValue) -> Value {
        Value::Ref(self.heap.allocate(HeapData::Exception(exc.clone())))
    }
}

/// What a loop body signalled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopSignal {
    Normal,
    Break,
    Continue,
    /// Return or exception: leave the loop and let the caller see it.
    Propagate,
}

fn cmp_matches(op: CmpOpKind, ord: std::cmp::Ordering) -> bool {
    use std::cmp::Ordering::*;
    match op {
        CmpOpKind::Lt => ord == Less,
        CmpOpKind::LtE => ord != Greater,
        CmpOpKind::Gt => ord == Greater,
        CmpOpKind::GtE => ord != Less,
        CmpOpKind::Eq => ord == Equal,
        CmpOpKind::NotEq => ord != Equal,
        _ => false,
    }
}

fn normalize_index(index: &Value, len: usize, span: Span) -> RunResult<usize> {
    let Some(i) = index.as_integer() else {
        return Err(RunError::type_error("indices must be integers", span));
    };
    let i = if i < 0 { i + len as i64 } else { i };
    if i < 0 || i >= len as i64 {
        return Err(RunError::index_error("index out of range", span));
    }
    Ok(i as usize)
}

fn range_len(start: i64, stop: i64, step: i64) -> usize {
    if step > 0 {
        ((stop - start).max(0) as u64).div_ceil(step as u64) as usize
    } else {
        ((start - stop).max(0) as u64).div_ceil((-step) as u64) as usize
    }
}

fn range_values(start: i64, stop: i64, step: i64) -> Vec<Value> {
    let mut out = Vec::new();
    let mut v = start;
    if step > 0 {
        while v < stop {
            out.push(Value::Int(v));
            v += step;
        }
    } else if step < 0 {
        while v > stop {
            out.push(Value::Int(v));
            v += step;
        }
    }
    out
}

fn int_binop(op: BinOpKind, a: i64, b: i64, span: Span) -> RunResult<Value> {
    Ok(match op {
        BinOpKind::Add => Value::Int(a.wrapping_add(b)),
        BinOpKind::Sub => Value::Int(a.wrapping_sub(b)),
        BinOpKind::Mult => Value::Int(a.wrapping_mul(b)),
        BinOpKind::Div => {
            if b == 0 {
                return Err(RunError::zero_division(span));
            }
            Value::F64(a as f64 / b as f64)
        }
        BinOpKind::FloorDiv => {
            if b == 0 {
                return Err(RunError::zero_division(span));
            }
            Value::Int(a.div_euclid(b))
        }
        BinOpKind::Mod => {
            if b == 0 {
                return Err(RunError::zero_division(span));
            }
            Value::Int(a.rem_euclid(b))
        }
        BinOpKind::Pow => {
            if b < 0 {
                Value::F64((a as f64).powi(b as i32))
            } else {
                match a.checked_pow(b.min(u32::MAX as i64) as u32) {
                    Some(v) => Value::Int(v),
                    None => {
                        return Err(RunError::raise(ExcKind::OverflowError, "integer power overflow", span));
                    }
                }
            }
        }
        BinOpKind::LShift => Value::Int(a.wrapping_shl(b.clamp(0, 63) as u32)),
        BinOpKind::RShift => Value::Int(a.wrapping_shr(b.clamp(0, 63) as u32)),
        BinOpKind::BitOr => Value::Int(a | b),
        BinOpKind::BitXor => Value::Int(a ^ b),
        BinOpKind::BitAnd => Value::Int(a & b),
        BinOpKind::MatMult => {
            return Err(RunError::type_error("unsupported operand type(s) for @", span));
        }
    })
}

fn float_binop(op: BinOpKind, a: f64, b: f64, span: Span) -> RunResult<Value> {
    Ok(match op {
        BinOpKind::Add => Value::F64(a + b),
        BinOpKind::Sub => Value::F64(a - b),
        BinOpKind::Mult => Value::F64(a * b),
        BinOpKind::Div => {
            if b == 0.0 {
                return Err(RunError::zero_division(span));
            }
            Value::F64(a / b)
        }
        BinOpKind::FloorDiv => {
            if b == 0.0 {
                return Err(RunError::zero_division(span));
            }
            Value::F64((a / b).floor())
        }
        BinOpKind::Mod => {
            if b == 0.0 {
                return Err(RunError::zero_division(span));
            }
            Value::F64(a - b * (a / b).floor())
        }
        BinOpKind::Pow => Value::F64(a.powf(b)),
        _ => {
            return Err(RunError::type_error(
                format!("unsupported operand type(s) for {}", op.symbol()),
                span,
            ));
        }
    })
}

// ---------------------------------------------------------------------------
// Visitor implementation
// ---------------------------------------------------------------------------

impl<'a, W: PrintWriter, T: EvalTracer> TreeEvaluator<'a, W, T> {
    fn match_subject(&self) -> Value {
        *self.subjects.last().expect("pattern dispatch keeps a subject")
    }

    /// Runs comprehension generators depth-first, invoking `kind` at the
    /// innermost level.
    fn comp_rec(
        &mut self,
        generators: &[Comprehension],
        gi: usize,
        kind: &CompKind<'_>,
        acc: &mut Vec<Value>,
        pairs: &mut Vec<(Value, Value)>,
        depth: usize,
    ) {
        if gi == generators.len() {
            match kind {
                CompKind::Element(elt) => {
                    if let Some(v) = self.exec_value(elt, depth) {
                        acc.push(v);
                    }
                }
                CompKind::Pair(key, value) => {
                    let Some(k) = self.exec_value(key, depth) else { return };
                    let Some(v) = self.exec_value(value, depth) else { return };
                    pairs.push((k, v));
                }
            }
            return;
        }
        let generator = &generators[gi];
        let Some(iterable) = self.exec_value(&generator.iter, depth) else {
            return;
        };
        let values = match self.materialize(iterable, generator.iter.span) {
            Ok(v) => v,
            Err(e) => {
                self.raise_error(e);
                return;
            }
        };
        'next_value: for v in values {
            self.store_target(&generator.target, v, depth);
            if !self.running() {
                return;
            }
            for cond in &generator.ifs {
                let Some(c) = self.exec_value(cond, depth) else { return };
                if !c.truthy(&self.heap, self.interner) {
                    continue 'next_value;
                }
            }
            self.comp_rec(generators, gi + 1, kind, acc, pairs, depth);
            if !self.running() {
                return;
            }
        }
    }

    /// Evaluates call arguments, splicing `*` unpacking.
    fn eval_args(&mut self, args: &[ExprLoc], depth: usize) -> Option<Vec<Value>> {
        let mut out = Vec::with_capacity(args.len());
        for arg in args {
            if let Expr::Starred(inner) = &arg.expr {
                let v = self.exec_value(inner, depth)?;
                match self.materialize(v, arg.span) {
                    Ok(values) => out.extend(values),
                    Err(e) => {
                        self.raise_error(e);
                        return None;
                    }
                }
            } else {
                out.push(self.exec_value(arg, depth)?);
            }
        }
        Some(out)
    }

    fn eval_kwargs(&mut self, keywords: &[CallKeyword], depth: usize) -> Option<Vec<(StringId, Value)>> {
        let mut out = Vec::with_capacity(keywords.len());
        for kw in keywords {
            out.push((kw.name, self.exec_value(&kw.value, depth)?));
        }
        Some(out)
    }

    /// Creates the runtime value of a function definition: a plain function
    /// when nothing is captured, a closure otherwise.
    fn make_function_value(&mut self, fid: FuncId) -> Value {
        let module = self.module;
        let func = module.func(fid);
        if func.captures.is_empty() {
            return Value::Function(fid);
        }
        let base = self.frame_base();
        let captured: Vec<Value> = func
            .captures
            .iter()
            .map(|cap| self.bindings.get(base + cap.source_slot as usize).value)
            .collect();
        Value::Ref(self.heap.allocate(HeapData::Closure { func: fid, captured }))
    }

    fn apply_decorators(&mut self, decorators: &[ExprLoc], mut value: Value, depth: usize) -> Option<Value> {
        for dec in decorators.iter().rev() {
            let dec_value = self.exec_value(dec, depth)?;
            let result = self.call_value(dec_value, vec![value], Vec::new(), dec.span);
            value = self.check(result)?;
            if !self.running() {
                return None;
            }
        }
        Some(value)
    }

    fn get_slice(
        &mut self,
        obj: Value,
        lower: Option<i64>,
        upper: Option<i64>,
        step: i64,
        span: Span,
    ) -> RunResult<Value> {
        if step == 0 {
            return Err(RunError::value_error("slice step cannot be zero", span));
        }
        let slice_vec = |items: &[Value]| -> Vec<Value> { slice_indices(items.len(), lower, upper, step) .into_iter().map(|i| items[i]).collect() };
        match obj {
            Value::Ref(id) => match self.heap.get(id) {
                HeapData::List(items) => {
                    let out = slice_vec(items);
                    Ok(Value::Ref(self.heap.allocate(HeapData::List(out))))
                }
                HeapData::Tuple(items) => {
                    let out = slice_vec(items);
                    Ok(Value::Ref(self.heap.allocate(HeapData::Tuple(out))))
                }
                HeapData::Str(s) => {
                    let chars: Vec<char> = s.chars().collect();
                    let out: String = slice_indices(chars.len(), lower, upper, step)
                        .into_iter()
                        .map(|i| chars[i])
                        .collect();
                    Ok(Value::Ref(self.heap.alloc_str(out)))
                }
                _ => Err(RunError::type_error("object is not sliceable", span)),
            },
            Value::InternStr(sid) => {
                let chars: Vec<char> = self.interner.get(sid).chars().collect();
                let out: String = slice_indices(chars.len(), lower, upper, step)
                    .into_iter()
                    .map(|i| chars[i])
                    .collect();
                Ok(Value::Ref(self.heap.alloc_str(out)))
            }
            _ => Err(RunError::type_error("object is not sliceable", span)),
        }
    }

    fn format_value(&mut self, value: &Value, spec: Option<StringId>) -> String {
        let Some(spec) = spec else {
            return value_str(value, &self.heap, self.interner, self.module);
        };
        let spec = self.interner.get(spec);
        // Minimal format support: `.Nf` fixed-point floats.
        if let Some(rest) = spec.strip_suffix('f') {
            if let Some(precision) = rest.strip_prefix('.').and_then(|p| p.parse::<usize>().ok()) {
                if let Some(n) = value.as_number() {
                    return format!("{n:.precision$}");
                }
            }
        }
        match value.as_number() {
            Some(n) if spec == "f" => format_float(n),
            _ => value_str(value, &self.heap, self.interner, self.module),
        }
    }
}

/// What a comprehension accumulates.
enum CompKind<'n> {
    Element(&'n ExprLoc),
    Pair(&'n ExprLoc, &'n ExprLoc),
}

fn slice_indices(len: usize, lower: Option<i64>, upper: Option<i64>, step: i64) -> Vec<usize> {
    let len = len as i64;
    let clamp = |v: i64| -> i64 {
        let v = if v < 0 { v + len } else { v };
        v.clamp(0, len)
    };
    let mut out = Vec::new();
    if step > 0 {
        let start = clamp(lower.unwrap_or(0));
        let stop = clamp(upper.unwrap_or(len));
        let mut i = start;
        while i < stop {
            out.push(i as usize);
            i += step;
        }
    } else {
        let start = match lower {
            Some(v) => {
                let v = if v < 0 { v + len } else { v };
                v.min(len - 1)
            }
            None => len - 1,
        };
        let stop = match upper {
            Some(v) => {
                let v = if v < 0 { v + len } else { v };
                v.max(-1)
            }
            None => -1,
        };
        let mut i = start;
        while i > stop {
            if i >= 0 && i < len {
                out.push(i as usize);
            }
            i += step;
        }
    }
    out
}

impl<'a, W: PrintWriter, T: EvalTracer> TreeVisitor for TreeEvaluator<'a, W, T> {
    type ExprRet = PartialResult;
    type StmtRet = ();
    type PatRet = bool;

    const COLLECT_TRACE: bool = true;

    fn record_trace(&mut self, span: Span) {
        if let Some(trace) = self.traces.last_mut() {
            trace.span = span;
        }
    }

    fn depth_exceeded_expr(&mut self, span: Span) -> PartialResult {
        self.raise_exc(
            ExcValue::new(ExcKind::RecursionError, Some("expression nesting too deep".to_owned())),
            span,
        );
        PartialResult::none()
    }

    fn depth_exceeded_stmt(&mut self, span: Span) {
        self.raise_exc(
            ExcValue::new(ExcKind::RecursionError, Some("statement nesting too deep".to_owned())),
            span,
        );
    }

    fn depth_exceeded_pat(&mut self, span: Span) -> bool {
        self.raise_exc(
            ExcValue::new(ExcKind::RecursionError, Some("pattern nesting too deep".to_owned())),
            span,
        );
        false
    }

    // -- Expressions --

    fn constant(&mut self, _node: &ExprLoc, _span: Span, value: &ConstValue, _depth: usize) -> PartialResult {
        PartialResult::Value(match value {
            ConstValue::None => Value::None,
            ConstValue::Bool(b) => Value::Bool(*b),
            ConstValue::Int(i) => Value::Int(*i),
            ConstValue::Float(f) => Value::F64(*f),
            ConstValue::Str(id) => Value::InternStr(*id),
        })
    }

    fn name(&mut self, _node: &ExprLoc, span: Span, name: &NameRef, _depth: usize) -> PartialResult {
        self.load_name(name, span)
    }

    fn builtintype(&mut self, _node: &ExprLoc, _span: Span, builtin: Builtin, _depth: usize) -> PartialResult {
        PartialResult::Value(Value::Builtin(builtin))
    }

    fn binop(
        &mut self,
        node: &ExprLoc,
        span: Span,
        left: &ExprLoc,
        op: BinOpKind,
        right: &ExprLoc,
        resolved: &OpImpl,
        depth: usize,
    ) -> PartialResult {
        let l = self.exec_expr(left, depth + 1);
        if !self.running() {
            return PartialResult::none();
        }
        let r = self.exec_expr(right, depth + 1);
        if !self.running() {
            return PartialResult::none();
        }
        match (l.as_value(), r.as_value()) {
            (Some(lv), Some(rv)) => {
                let result = self.apply_binop(op, resolved, lv, rv, span);
                match self.check(result) {
                    Some(v) => PartialResult::Value(v),
                    None => PartialResult::none(),
                }
            }
            _ => PartialResult::Residual(ExprLoc::new(
                node.span,
                Expr::BinOp {
                    left: Box::new(l.into_expr(left)),
                    op,
                    right: Box::new(r.into_expr(right)),
                    resolved: *resolved,
                },
            )),
        }
    }

    fn boolop(
        &mut self,
        node: &ExprLoc,
        _span: Span,
        op: BoolOpKind,
        values: &[ExprLoc],
        resolved: &OpImpl,
        depth: usize,
    ) -> PartialResult {
        let mut reduced: Vec<ExprLoc> = Vec::new();
        for (i, value) in values.iter().enumerate() {
            let partial = self.exec_expr(value, depth + 1);
            if !self.running() {
                return PartialResult::none();
            }
            match partial.as_value() {
                Some(v) => {
                    let t = v.truthy(&self.heap, self.interner);
                    match op {
                        BoolOpKind::And if !t => return PartialResult::Value(Value::Bool(false)),
                        BoolOpKind::Or if t => return PartialResult::Value(Value::Bool(true)),
                        _ => {}
                    }
                    reduced.push(partial.into_expr(value));
                }
                None => {
                    // Residual operand: keep it and the unevaluated rest.
                    reduced.push(partial.into_expr(value));
                    reduced.extend(values[i + 1..].iter().cloned());
                    return PartialResult::Residual(ExprLoc::new(
                        node.span,
                        Expr::BoolOp {
                            op,
                            values: reduced,
                            resolved: *resolved,
                        },
                    ));
                }
            }
        }
        PartialResult::Value(Value::Bool(op == BoolOpKind::And))
    }

    fn unaryop(
        &mut self,
        node: &ExprLoc,
        span: Span,
        op: UnaryOpKind,
        operand: &ExprLoc,
        resolved: &OpImpl,
        depth: usize,
    ) -> PartialResult {
        let partial = self.exec_expr(operand, depth + 1);
        if !self.running() {
            return PartialResult::none();
        }
        match partial.as_value() {
            Some(v) => {
                let result = self.apply_unary(op, resolved, v, span);
                match self.check(result) {
                    Some(v) => PartialResult::Value(v),
                    None => PartialResult::none(),
                }
            }
            None => PartialResult::Residual(ExprLoc::new(
                node.span,
                Expr::UnaryOp {
                    op,
                    operand: Box::new(partial.into_expr(operand)),
                    resolved: *resolved,
                },
            )),
        }
    }

    fn compare(
        &mut self,
        node: &ExprLoc,
        span: Span,
        left: &ExprLoc,
        ops: &[CmpOpKind],
        comparators: &[ExprLoc],
        resolved: &[OpImpl],
        depth: usize,
    ) -> PartialResult {
        let l = self.exec_expr(left, depth + 1);
        if !self.running() {
            return PartialResult::none();
        }
        let Some(mut prev) = l.as_value() else {
            return PartialResult::Residual(node.clone());
        };
        for ((op, comparator), op_impl) in ops.iter().zip(comparators).zip(resolved) {
            let r = self.exec_expr(comparator, depth + 1);
            if !self.running() {
                return PartialResult::none();
            }
            let Some(rv) = r.as_value() else {
                return PartialResult::Residual(node.clone());
            };
            let result = self.apply_cmp(*op, op_impl, prev, rv, span);
            let Some(outcome) = self.check(result) else {
                return PartialResult::none();
            };
            // A false link decides the whole chain; the rest never runs.
            if !outcome.truthy(&self.heap, self.interner) {
                return PartialResult::Value(Value::Bool(false));
            }
            prev = rv;
        }
        PartialResult::Value(Value::Bool(true))
    }

    fn call(
        &mut self,
        node: &ExprLoc,
        span: Span,
        func: &ExprLoc,
        args: &[ExprLoc],
        keywords: &[CallKeyword],
        depth: usize,
    ) -> PartialResult {
        // Method calls dispatch on the receiver: user dunder/method first,
        // then the native container methods.
        if let Expr::Attribute { value, attr } = &func.expr {
            let Some(obj) = self.exec_value(value, depth + 1) else {
                return PartialResult::none();
            };
            let Some(arg_values) = self.eval_args(args, depth + 1) else {
                return PartialResult::none();
            };
            let Some(kwarg_values) = self.eval_kwargs(keywords, depth + 1) else {
                return PartialResult::none();
            };

            // Keyword arguments need the full binding path, not the plain
            // dunder dispatch.
            if !kwarg_values.is_empty() {
                if let Value::Ref(id) = obj {
                    if let HeapData::Instance { class, .. } = self.heap.get(id) {
                        let class = *class;
                        if let Some(fid) = self.module.find_method(class, *attr) {
                            let mut with_self = Vec::with_capacity(arg_values.len() + 1);
                            with_self.push(obj);
                            with_self.extend(arg_values);
                            let result = self.call_function(fid, &[], with_self, kwarg_values, span);
                            return match self.check(result) {
                                Some(v) => PartialResult::Value(v),
                                None => PartialResult::none(),
                            };
                        }
                    }
                }
            }

            let result = self.call_dunder(obj, *attr, arg_values.clone(), span);
            match self.check(result) {
                Some(Some(v)) => return PartialResult::Value(v),
                Some(None) => {}
                None => return PartialResult::none(),
            }
            if !self.running() {
                return PartialResult::none();
            }
            let attr_text = self.interner.get(*attr).to_owned();
            let result = self.call_native_method(obj, &attr_text, arg_values.clone(), span);
            match self.check(result) {
                Some(Some(v)) => return PartialResult::Value(v),
                Some(None) => {}
                None => return PartialResult::none(),
            }
            // Fall back to a callable attribute value.
            let attr_value = self.get_attr(obj, *attr, span);
            let Some(callee) = self.check(attr_value) else {
                return PartialResult::none();
            };
            let result = self.call_value(callee, arg_values, kwarg_values, span);
            return match self.check(result) {
                Some(v) => PartialResult::Value(v),
                None => PartialResult::none(),
            };
        }

        let callee = self.exec_expr(func, depth + 1);
        if !self.running() {
            return PartialResult::none();
        }
        let Some(callee) = callee.as_value() else {
            return PartialResult::Residual(node.clone());
        };

        // Arguments that stay partial make the whole call residual.
        let mut arg_values = Vec::with_capacity(args.len());
        for arg in args {
            if let Expr::Starred(inner) = &arg.expr {
                let Some(v) = self.exec_value(inner, depth + 1) else {
                    return PartialResult::none();
                };
                match self.materialize(v, arg.span) {
                    Ok(values) => arg_values.extend(values),
                    Err(e) => {
                        self.raise_error(e);
                        return PartialResult::none();
                    }
                }
                continue;
            }
            let partial = self.exec_expr(arg, depth + 1);
            if !self.running() {
                return PartialResult::none();
            }
            match partial.as_value() {
                Some(v) => arg_values.push(v),
                None => return PartialResult::Residual(node.clone()),
            }
        }
        let Some(kwarg_values) = self.eval_kwargs(keywords, depth + 1) else {
            return PartialResult::none();
        };

        let result = self.call_value(callee, arg_values, kwarg_values, span);
        match self.check(result) {
            Some(v) => {
                if self.running() {
                    PartialResult::Value(v)
                } else {
                    PartialResult::none()
                }
            }
            None => PartialResult::none(),
        }
    }

    fn attribute(&mut self, _node: &ExprLoc, span: Span, value: &ExprLoc, attr: StringId, depth: usize)
        -> PartialResult {
        let Some(obj) = self.exec_value(value, depth + 1) else {
            return PartialResult::none();
        };
        let result = self.get_attr(obj, attr, span);
        match self.check(result) {
            Some(v) => PartialResult::Value(v),
            None => PartialResult::none(),
        }
    }

    fn subscript(&mut self, _node: &ExprLoc, span: Span, value: &ExprLoc, index: &ExprLoc, depth: usize)
        -> PartialResult {
        let Some(obj) = self.exec_value(value, depth + 1) else {
            return PartialResult::none();
        };
        if let Expr::Slice { lower, upper, step } = &index.expr {
            let mut parts: [Option<i64>; 3] = [None, None, None];
            for (slot, part) in parts.iter_mut().zip([lower, upper, step]) {
                if let Some(part) = part {
                    let Some(v) = self.exec_value(part, depth + 1) else {
                        return PartialResult::none();
                    };
                    match v.as_integer() {
                        Some(i) => *slot = Some(i),
                        None => {
                            self.raise_exc(
                                ExcValue::new(ExcKind::TypeError, Some("slice indices must be integers".to_owned())),
                                span,
                            );
                            return PartialResult::none();
                        }
                    }
                }
            }
            let result = self.get_slice(obj, parts[0], parts[1], parts[2].unwrap_or(1), span);
            return match self.check(result) {
                Some(v) => PartialResult::Value(v),
                None => PartialResult::none(),
            };
        }
        let Some(index) = self.exec_value(index, depth + 1) else {
            return PartialResult::none();
        };
        let result = self.get_item(obj, index, span);
        match self.check(result) {
            Some(v) => PartialResult::Value(v),
            None => PartialResult::none(),
        }
    }

    fn slice(
        &mut self,
        node: &ExprLoc,
        _span: Span,
        _lower: Option<&ExprLoc>,
        _upper: Option<&ExprLoc>,
        _step: Option<&ExprLoc>,
        _depth: usize,
    ) -> PartialResult {
        // Subscript evaluation destructures slices before dispatch.
        PartialResult::Residual(node.clone())
    }

    fn lambda(&mut self, _node: &ExprLoc, _span: Span, func: FuncId, _depth: usize) -> PartialResult {
        PartialResult::Value(self.make_function_value(func))
    }

    fn ifexp(
        &mut self,
        _node: &ExprLoc,
        _span: Span,
        test: &ExprLoc,
        body: &ExprLoc,
        orelse: &ExprLoc,
        depth: usize,
    ) -> PartialResult {
        let Some(t) = self.exec_value(test, depth + 1) else {
            return PartialResult::none();
        };
        if t.truthy(&self.heap, self.interner) {
            self.exec_expr(body, depth + 1)
        } else {
            self.exec_expr(orelse, depth + 1)
        }
    }

    fn listexpr(&mut self, _node: &ExprLoc, _span: Span, items: &[ExprLoc], depth: usize) -> PartialResult {
        let Some(values) = self.eval_args(items, depth + 1) else {
            return PartialResult::none();
        };
        PartialResult::Value(Value::Ref(self.heap.allocate(HeapData::List(values))))
    }

    fn tupleexpr(&mut self, _node: &ExprLoc, _span: Span, items: &[ExprLoc], depth: usize) -> PartialResult {
        let Some(values) = self.eval_args(items, depth + 1) else {
            return PartialResult::none();
        };
        PartialResult::Value(Value::Ref(self.heap.allocate(HeapData::Tuple(values))))
    }

    fn setexpr(&mut self, _node: &ExprLoc, _span: Span, items: &[ExprLoc], depth: usize) -> PartialResult {
        let Some(values) = self.eval_args(items, depth + 1) else {
            return PartialResult::none();
        };
        let mut unique: Vec<Value> = Vec::with_capacity(values.len());
        for v in values {
            if !unique.iter().any(|u| py_eq(u, &v, &self.heap, self.interner)) {
                unique.push(v);
            }
        }
        PartialResult::Value(Value::Ref(self.heap.allocate(HeapData::Set(unique))))
    }

    fn dictexpr(&mut self, _node: &ExprLoc, _span: Span, keys: &[ExprLoc], values: &[ExprLoc], depth: usize)
        -> PartialResult {
        let mut pairs: Vec<(Value, Value)> = Vec::with_capacity(keys.len());
        for (key, value) in keys.iter().zip(values) {
            let Some(k) = self.exec_value(key, depth + 1) else {
                return PartialResult::none();
            };
            let Some(v) = self.exec_value(value, depth + 1) else {
                return PartialResult::none();
            };
            match pairs.iter_mut().find(|(pk, _)| py_eq(pk, &k, &self.heap, self.interner)) {
                Some(slot) => slot.1 = v,
                None => pairs.push((k, v)),
            }
        }
        PartialResult::Value(Value::Ref(self.heap.allocate(HeapData::Dict(pairs))))
    }

    fn listcomp(
        &mut self,
        _node: &ExprLoc,
        _span: Span,
        elt: &ExprLoc,
        generators: &[Comprehension],
        depth: usize,
    ) -> PartialResult {
        let mut acc = Vec::new();
        let mut pairs = Vec::new();
        self.comp_rec(generators, 0, &CompKind::Element(elt), &mut acc, &mut pairs, depth + 1);
        if !self.running() {
            return PartialResult::none();
        }
        PartialResult::Value(Value::Ref(self.heap.allocate(HeapData::List(acc))))
    }

    fn setcomp(
        &mut self,
        _node: &ExprLoc,
        _span: Span,
        elt: &ExprLoc,
        generators: &[Comprehension],
        depth: usize,
    ) -> PartialResult {
        let mut acc = Vec::new();
        let mut pairs = Vec::new();
        self.comp_rec(generators, 0, &CompKind::Element(elt), &mut acc, &mut pairs, depth + 1);
        if !self.running() {
            return PartialResult::none();
        }
        let mut unique: Vec<Value> = Vec::with_capacity(acc.len());
        for v in acc {
            if !unique.iter().any(|u| py_eq(u, &v, &self.heap, self.interner)) {
                unique.push(v);
            }
        }
        PartialResult::Value(Value::Ref(self.heap.allocate(HeapData::Set(unique))))
    }

    fn dictcomp(
        &mut self,
        _node: &ExprLoc,
        _span: Span,
        key: &ExprLoc,
        value: &ExprLoc,
        generators: &[Comprehension],
        depth: usize,
    ) -> PartialResult {
        let mut acc = Vec::new();
        let mut pairs = Vec::new();
        self.comp_rec(generators, 0, &CompKind::Pair(key, value), &mut acc, &mut pairs, depth + 1);
        if !self.running() {
            return PartialResult::none();
        }
        let mut out: Vec<(Value, Value)> = Vec::with_capacity(pairs.len());
        for (k, v) in pairs {
            match out.iter_mut().find(|(pk, _)| py_eq(pk, &k, &self.heap, self.interner)) {
                Some(slot) => slot.1 = v,
                None => out.push((k, v)),
            }
        }
        PartialResult::Value(Value::Ref(self.heap.allocate(HeapData::Dict(out))))
    }

    fn generateexpr(
        &mut self,
        _node: &ExprLoc,
        _span: Span,
        elt: &ExprLoc,
        generators: &[Comprehension],
        depth: usize,
    ) -> PartialResult {
        let mut acc = Vec::new();
        let mut pairs = Vec::new();
        self.comp_rec(generators, 0, &CompKind::Element(elt), &mut acc, &mut pairs, depth + 1);
        if !self.running() {
            return PartialResult::none();
        }
        let id = self
            .heap
            .allocate(HeapData::Generator(GenState::Ready { items: acc, cursor: 0 }));
        PartialResult::Value(Value::Ref(id))
    }

    fn namedexpr(&mut self, _node: &ExprLoc, _span: Span, target: &NameRef, value: &ExprLoc, depth: usize)
        -> PartialResult {
        let Some(v) = self.exec_value(value, depth + 1) else {
            return PartialResult::none();
        };
        self.store_name(target, v);
        PartialResult::Value(v)
    }

    fn starred(&mut self, _node: &ExprLoc, _span: Span, value: &ExprLoc, depth: usize) -> PartialResult {
        // Splicing contexts intercept Starred; standalone it evaluates to
        // its operand.
        self.exec_expr(value, depth + 1)
    }

    fn await_expr(&mut self, _node: &ExprLoc, span: Span, value: &ExprLoc, depth: usize) -> PartialResult {
        let Some(v) = self.exec_value(value, depth + 1) else {
            return PartialResult::none();
        };
        let Value::Ref(id) = v else {
            self.raise_exc(
                ExcValue::new(ExcKind::TypeError, Some("object is not awaitable".to_owned())),
                span,
            );
            return PartialResult::none();
        };
        match self.heap.get_mut(id) {
            HeapData::Coroutine {
                func,
                captured,
                args,
                done,
            } => {
                if *done {
                    self.raise_exc(
                        ExcValue::new(ExcKind::RuntimeError, Some("coroutine was already awaited".to_owned())),
                        span,
                    );
                    return PartialResult::none();
                }
                let (func, captured, args) = (*func, std::mem::take(captured), std::mem::take(args));
                *done = true;
                let result = self.enter_frame(func, &captured, args, span);
                match self.check(result) {
                    Some(v) => {
                        if self.running() {
                            PartialResult::Value(v)
                        } else {
                            PartialResult::none()
                        }
                    }
                    None => PartialResult::none(),
                }
            }
            _ => {
                self.raise_exc(
                    ExcValue::new(ExcKind::TypeError, Some("object is not awaitable".to_owned())),
                    span,
                );
                PartialResult::none()
            }
        }
    }

    fn yield_expr(&mut self, _node: &ExprLoc, span: Span, value: Option<&ExprLoc>, depth: usize) -> PartialResult {
        let v = match value {
            Some(value) => match self.exec_value(value, depth + 1) {
                Some(v) => v,
                None => return PartialResult::none(),
            },
            None => Value::None,
        };
        match self.yield_buffers.last_mut() {
            Some(buf) => {
                buf.push(v);
                PartialResult::none()
            }
            None => {
                self.raise_exc(
                    ExcValue::new(ExcKind::RuntimeError, Some("yield outside of a generator".to_owned())),
                    span,
                );
                PartialResult::none()
            }
        }
    }

    fn yieldfrom(&mut self, _node: &ExprLoc, span: Span, value: &ExprLoc, depth: usize) -> PartialResult {
        let Some(v) = self.exec_value(value, depth + 1) else {
            return PartialResult::none();
        };
        let values = match self.materialize(v, span) {
            Ok(values) => values,
            Err(e) => {
                self.raise_error(e);
                return PartialResult::none();
            }
        };
        match self.yield_buffers.last_mut() {
            Some(buf) => {
                buf.extend(values);
                PartialResult::none()
            }
            None => {
                self.raise_exc(
                    ExcValue::new(
                        ExcKind::RuntimeError,
                        Some("yield from outside of a generator".to_owned()),
                    ),
                    span,
                );
                PartialResult::none()
            }
        }
    }

    fn joinedstr(&mut self, _node: &ExprLoc, _span: Span, parts: &[ExprLoc], depth: usize) -> PartialResult {
        let mut out = String::new();
        for part in parts {
            let Some(v) = self.exec_value(part, depth + 1) else {
                return PartialResult::none();
            };
            match v.str_contents(&self.heap, self.interner) {
                Some(s) => out.push_str(s),
                None => out.push_str(&value_str(&v, &self.heap, self.interner, self.module)),
            }
        }
        PartialResult::Value(Value::Ref(self.heap.alloc_str(out)))
    }

    fn formattedvalue(
        &mut self,
        _node: &ExprLoc,
        _span: Span,
        value: &ExprLoc,
        format_spec: Option<StringId>,
        depth: usize,
    ) -> PartialResult {
        let Some(v) = self.exec_value(value, depth + 1) else {
            return PartialResult::none();
        };
        let text = self.format_value(&v, format_spec);
        PartialResult::Value(Value::Ref(self.heap.alloc_str(text)))
    }

    fn arrow(&mut self, _node: &ExprLoc, _span: Span, _params: &[ExprLoc], _ret: &ExprLoc, _depth: usize)
        -> PartialResult {
        PartialResult::Value(Value::None)
    }

    fn arraytype(&mut self, _node: &ExprLoc, _span: Span, _item: &ExprLoc, _depth: usize) -> PartialResult {
        PartialResult::Value(Value::None)
    }

    fn settype(&mut self, _node: &ExprLoc, _span: Span, _item: &ExprLoc, _depth: usize) -> PartialResult {
        PartialResult::Value(Value::None)
    }

    fn tupletype(&mut self, _node: &ExprLoc, _span: Span, _items: &[ExprLoc], _depth: usize) -> PartialResult {
        PartialResult::Value(Value::None)
    }

    fn dicttype(&mut self, _node: &ExprLoc, _span: Span, _key: &ExprLoc, _value: &ExprLoc, _depth: usize)
        -> PartialResult {
        PartialResult::Value(Value::None)
    }

    fn classtype(&mut self, _node: &ExprLoc, _span: Span, class: ClassId, _depth: usize) -> PartialResult {
        PartialResult::Value(Value::Class(class))
    }

    // -- Statements --

    fn exprstmt(&mut self, _node: &StmtLoc, _span: Span, value: &ExprLoc, depth: usize) {
        let _ = self.exec_expr(value, depth + 1);
    }

    fn assign(&mut self, _node: &StmtLoc, _span: Span, targets: &[ExprLoc], value: &ExprLoc, depth: usize) {
        let Some(v) = self.exec_value(value, depth + 1) else { return };
        for target in targets {
            self.store_target(target, v, depth + 1);
            if !self.running() {
                return;
            }
        }
    }

    fn augassign(
        &mut self,
        _node: &StmtLoc,
        span: Span,
        target: &ExprLoc,
        op: BinOpKind,
        value: &ExprLoc,
        resolved: &OpImpl,
        depth: usize,
    ) {
        let Some(current) = self.exec_value(target, depth + 1) else { return };
        let Some(rhs) = self.exec_value(value, depth + 1) else { return };
        let result = self.apply_binop(op, resolved, current, rhs, span);
        let Some(result) = self.check(result) else { return };
        if !self.running() {
            return;
        }
        self.store_target(target, result, depth + 1);
    }

    fn annassign(
        &mut self,
        _node: &StmtLoc,
        _span: Span,
        target: &ExprLoc,
        _annotation: &ExprLoc,
        value: Option<&ExprLoc>,
        depth: usize,
    ) {
        if let Some(value) = value {
            let Some(v) = self.exec_value(value, depth + 1) else { return };
            self.store_target(target, v, depth + 1);
        }
    }

    fn returnstmt(&mut self, _node: &StmtLoc, _span: Span, value: Option<&ExprLoc>, depth: usize) {
        let v = match value {
            Some(value) => match self.exec_value(value, depth + 1) {
                Some(v) => v,
                None => return,
            },
            None => Value::None,
        };
        self.return_value = Some(v);
        self.status = FrameStatus::ReturnPending;
    }

    fn deletestmt(&mut self, _node: &StmtLoc, span: Span, targets: &[ExprLoc], depth: usize) {
        for target in targets {
            match &target.expr {
                Expr::Name(name) => {
                    self.store_name(name, Value::Undefined);
                }
                Expr::Subscript { value, index } => {
                    let Some(obj) = self.exec_value(value, depth + 1) else { return };
                    let Some(index) = self.exec_value(index, depth + 1) else { return };
                    let result = self.del_item(obj, index, span);
                    if self.check(result).is_none() {
                        return;
                    }
                }
                Expr::Attribute { value, attr } => {
                    let Some(obj) = self.exec_value(value, depth + 1) else { return };
                    if let Value::Ref(id) = obj {
                        if let HeapData::Instance { attrs, .. } = self.heap.get_mut(id) {
                            attrs.retain(|(name, _)| name != attr);
                            continue;
                        }
                    }
                    let err = self.attr_error(obj, *attr, span);
                    self.raise_error(err);
                    return;
                }
                _ => {
                    self.raise_exc(
                        ExcValue::new(ExcKind::TypeError, Some("cannot delete this target".to_owned())),
                        span,
                    );
                    return;
                }
            }
        }
    }

    fn pass(&mut self, _node: &StmtLoc, _span: Span, _depth: usize) {}

    fn breakstmt(&mut self, _node: &StmtLoc, _span: Span, _depth: usize) {
        self.status = FrameStatus::BreakPending;
    }

    fn continuestmt(&mut self, _node: &StmtLoc, _span: Span, _depth: usize) {
        self.status = FrameStatus::ContinuePending;
    }

    fn functiondef(&mut self, _node: &StmtLoc, _span: Span, func: FuncId, depth: usize) {
        let value = self.make_function_value(func);
        let module = self.module;
        let def = module.func(func);
        let Some(binding) = def.binding else { return };
        let decorators = &def.decorators;
        let value = if decorators.is_empty() {
            value
        } else {
            match self.apply_decorators(decorators, value, depth + 1) {
                Some(v) => v,
                None => return,
            }
        };
        self.store_name(&binding, value);
    }

    fn classdef(&mut self, _node: &StmtLoc, _span: Span, class: ClassId, depth: usize) {
        let module = self.module;
        let def = module.class(class);
        let Some(binding) = def.binding else { return };
        let decorators = &def.decorators;
        let value = if decorators.is_empty() {
            Value::Class(class)
        } else {
            match self.apply_decorators(decorators, Value::Class(class), depth + 1) {
                Some(v) => v,
                None => return,
            }
        };
        self.store_name(&binding, value);
    }

    fn ifstmt(
        &mut self,
        _node: &StmtLoc,
        _span: Span,
        tests: &[ExprLoc],
        bodies: &[Vec<StmtLoc>],
        orelse: &[StmtLoc],
        depth: usize,
    ) {
        for (test, body) in tests.iter().zip(bodies) {
            let Some(t) = self.exec_value(test, depth + 1) else { return };
            if t.truthy(&self.heap, self.interner) {
                self.exec_body(body, depth + 1);
                return;
            }
        }
        self.exec_body(orelse, depth + 1);
    }

    fn whilestmt(
        &mut self,
        _node: &StmtLoc,
        _span: Span,
        test: &ExprLoc,
        body: &[StmtLoc],
        orelse: &[StmtLoc],
        depth: usize,
    ) {
        let mut broke = false;
        loop {
            let Some(t) = self.exec_value(test, depth + 1) else { return };
            if !t.truthy(&self.heap, self.interner) {
                break;
            }
            match self.exec_loop_body(body, depth + 1) {
                LoopSignal::Break => {
                    broke = true;
                    break;
                }
                LoopSignal::Continue | LoopSignal::Normal => {}
                LoopSignal::Propagate => return,
            }
        }
        if !broke {
            self.exec_body(orelse, depth + 1);
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
        depth: usize,
    ) {
        let Some(iterable) = self.exec_value(iter, depth + 1) else { return };
        let values = match self.materialize(iterable, iter.span) {
            Ok(values) => values,
            Err(e) => {
                self.raise_error(e);
                return;
            }
        };
        if !self.running() {
            return;
        }
        let mut broke = false;
        for v in values {
            self.store_target(target, v, depth + 1);
            if !self.running() {
                return;
            }
            match self.exec_loop_body(body, depth + 1) {
                LoopSignal::Break => {
                    broke = true;
                    break;
                }
                LoopSignal::Continue | LoopSignal::Normal => {}
                LoopSignal::Propagate => return,
            }
        }
        if !broke {
            self.exec_body(orelse, depth + 1);
        }
    }

    fn with(&mut self, _node: &StmtLoc, span: Span, items: &[WithItem], body: &[StmtLoc], depth: usize) {
        // Enter every context, binding `as` names.
        let mut entered: Vec<Value> = Vec::with_capacity(items.len());
        for item in items {
            let Some(ctx) = self.exec_value(&item.context_expr, depth + 1) else {
                return;
            };
            let enter = self.call_dunder(ctx, StaticStr::DunderEnter.id(), Vec::new(), span);
            let bound = match self.check(enter) {
                Some(Some(v)) => v,
                Some(None) => {
                    self.raise_exc(
                        ExcValue::new(ExcKind::TypeError, Some("object is not a context manager".to_owned())),
                        span,
                    );
                    return;
                }
                None => return,
            };
            if !self.running() {
                return;
            }
            entered.push(ctx);
            if let Some(var) = &item.optional_vars {
                self.store_name(var, bound);
            }
        }

        self.exec_body(body, depth + 1);

        // __exit__ always runs; cleanup sees the in-flight exception but a
        // new raise inside it propagates on its own.
        let pending = if self.has_exceptions() {
            self.exceptions.last().cloned()
        } else {
            None
        };
        let saved_status = self.status;
        let saved_handling = self.handling_exceptions;
        self.handling_exceptions = self.exceptions.len();
        self.status = FrameStatus::Running;

        let exit_args = match &pending {
            Some(raise) => {
                let kind = self.alloc_string(raise.exc.kind.to_string());
                let value = self.exc_to_value(&raise.exc);
                let line = Value::Int(i64::from(raise.span.line));
                vec![kind, value, line]
            }
            None => vec![Value::None, Value::None, Value::None],
        };

        let mut suppress = false;
        for ctx in entered.into_iter().rev() {
            let result = self.call_dunder(ctx, StaticStr::DunderExit.id(), exit_args.clone(), span);
            match self.check(result) {
                Some(Some(v)) => {
                    if v.truthy(&self.heap, self.interner) {
                        suppress = true;
                    }
                }
                Some(None) => {}
                None => break,
            }
            if !self.running() {
                break;
            }
        }

        let new_exception = self.exceptions.len() > self.handling_exceptions;
        self.handling_exceptions = saved_handling;
        if new_exception {
            // The cleanup raised: that exception wins.
            self.status = FrameStatus::ExceptionPending;
            return;
        }
        if pending.is_some() && suppress {
            self.exceptions.pop();
            self.status = FrameStatus::Running;
            return;
        }
        self.status = saved_status;
    }

    fn raise(
        &mut self,
        _node: &StmtLoc,
        span: Span,
        exc: Option<&ExprLoc>,
        cause: Option<&ExprLoc>,
        depth: usize,
    ) {
        match exc {
            Some(exc) => {
                let Some(v) = self.exec_value(exc, depth + 1) else { return };
                let exc_value = self.to_exc_value(v, span);
                let Some(exc_value) = self.check(exc_value) else { return };
                if !self.running() {
                    return;
                }
                let cause_value = match cause {
                    Some(cause) => {
                        let Some(cv) = self.exec_value(cause, depth + 1) else { return };
                        let cv = self.to_exc_value(cv, span);
                        match self.check(cv) {
                            Some(c) => Some(c),
                            None => return,
                        }
                    }
                    None => None,
                };
                self.tracer.on_raise(&exc_value.kind.to_string(), span);
                self.exceptions.push(ExcRaise {
                    exc: exc_value,
                    span,
                    cause: cause_value,
                });
                self.status = FrameStatus::ExceptionPending;
            }
            None => match self.current_exception.clone() {
                Some(raise) => {
                    self.tracer.on_raise(&raise.exc.kind.to_string(), span);
                    self.exceptions.push(raise);
                    self.status = FrameStatus::ExceptionPending;
                }
                None => {
                    self.raise_exc(
                        ExcValue::new(ExcKind::RuntimeError, Some("no active exception to reraise".to_owned())),
                        span,
                    );
                }
            },
        }
    }

    fn trystmt(
        &mut self,
        _node: &StmtLoc,
        span: Span,
        body: &[StmtLoc],
        handlers: &[ExceptHandler],
        orelse: &[StmtLoc],
        finalbody: &[StmtLoc],
        depth: usize,
    ) {
        self.exec_body(body, depth + 1);
        let raised = self.has_exceptions();

        if raised {
            // Handle the most recent exception; cleanup runs with the
            // handling watermark raised so its statements still execute.
            let saved_handling = self.handling_exceptions;
            self.handling_exceptions = self.exceptions.len();
            self.status = FrameStatus::Running;

            let raise = self.exceptions.last().cloned().expect("exception stack is non-empty");
            let mut matched = false;
            for handler in handlers {
                let matches = match &handler.exc_type {
                    None => true,
                    Some(type_expr) => {
                        let Some(handler_value) = self.exec_value(type_expr, depth + 1) else {
                            self.handling_exceptions = saved_handling;
                            self.status = FrameStatus::ExceptionPending;
                            return;
                        };
                        self.exc_matches(&raise.exc, &handler_value)
                    }
                };
                if !matches {
                    continue;
                }
                matched = true;
                self.exceptions.pop();
                self.handling_exceptions = saved_handling;
                self.current_exception = Some(raise.clone());
                if let Some(name) = &handler.name {
                    let exc_value = self.exc_to_value(&raise.exc);
                    self.store_name(name, exc_value);
                }
                self.exec_body(&handler.body, depth + 1);
                break;
            }
            if !matched {
                // Leave the exception in flight.
                self.handling_exceptions = saved_handling;
                self.status = FrameStatus::ExceptionPending;
            }
        } else if self.running() {
            self.exec_body(orelse, depth + 1);
        }

        // finally runs regardless, seeing any in-flight exception but free
        // to execute; its own raise/return replaces the pending state.
        if !finalbody.is_empty() {
            let saved_status = self.status;
            let saved_handling = self.handling_exceptions;
            self.handling_exceptions = self.exceptions.len();
            self.status = FrameStatus::Running;

            self.exec_body(finalbody, depth + 1);

            let new_exception = self.exceptions.len() > self.handling_exceptions;
            self.handling_exceptions = saved_handling;
            if !new_exception && self.status == FrameStatus::Running {
                self.status = saved_status;
            }
        }
        let _ = span;
    }

    fn assertstmt(&mut self, _node: &StmtLoc, span: Span, test: &ExprLoc, msg: Option<&ExprLoc>, depth: usize) {
        let Some(t) = self.exec_value(test, depth + 1) else { return };
        if t.truthy(&self.heap, self.interner) {
            return;
        }
        let message = match msg {
            Some(msg) => match self.exec_value(msg, depth + 1) {
                Some(v) => Some(value_str(&v, &self.heap, self.interner, self.module)),
                None => return,
            },
            None => None,
        };
        self.raise_exc(ExcValue::new(ExcKind::AssertionError, message), span);
    }

    fn import(&mut self, _node: &StmtLoc, span: Span, names: &[ImportAlias], _depth: usize) {
        let path = names
            .first()
            .map(|alias| {
                alias
                    .path
                    .iter()
                    .map(|id| self.interner.get(*id))
                    .collect::<Vec<_>>()
                    .join(".")
            })
            .unwrap_or_default();
        self.raise_exc(
            ExcValue::new(ExcKind::ModuleNotFoundError, Some(format!("no module named '{path}'"))),
            span,
        );
    }

    fn importfrom(&mut self, _node: &StmtLoc, span: Span, module: &[StringId], _names: &[ImportAlias], _depth: usize) {
        let path = module.iter().map(|id| self.interner.get(*id)).collect::<Vec<_>>().join(".");
        self.raise_exc(
            ExcValue::new(ExcKind::ModuleNotFoundError, Some(format!("no module named '{path}'"))),
            span,
        );
    }

    fn global(&mut self, _node: &StmtLoc, _span: Span, _names: &[StringId], _depth: usize) {}

    fn nonlocal(&mut self, _node: &StmtLoc, _span: Span, _names: &[StringId], _depth: usize) {}

    fn match_stmt(&mut self, _node: &StmtLoc, _span: Span, subject: &ExprLoc, cases: &[MatchCase], depth: usize) {
        let Some(subject) = self.exec_value(subject, depth + 1) else { return };
        for case in cases {
            self.subjects.push(subject);
            let matched = self.exec_pattern(&case.pattern, depth + 1);
            self.subjects.pop();
            if !self.running() {
                return;
            }
            if !matched {
                continue;
            }
            if let Some(guard) = &case.guard {
                let Some(g) = self.exec_value(guard, depth + 1) else { return };
                if !g.truthy(&self.heap, self.interner) {
                    continue;
                }
            }
            self.exec_body(&case.body, depth + 1);
            return;
        }
    }

    fn inline(&mut self, _node: &StmtLoc, _span: Span, body: &[StmtLoc], depth: usize) {
        self.exec_body(body, depth + 1);
    }

    // -- Patterns --

    fn matchvalue(&mut self, _node: &PatternLoc, _span: Span, value: &ExprLoc, depth: usize) -> bool {
        let subject = self.match_subject();
        let Some(v) = self.exec_value(value, depth + 1) else {
            return false;
        };
        py_eq(&subject, &v, &self.heap, self.interner)
    }

    fn matchsingleton(&mut self, _node: &PatternLoc, _span: Span, value: ConstValue, _depth: usize) -> bool {
        let subject = self.match_subject();
        let v = match value {
            ConstValue::None => Value::None,
            ConstValue::Bool(b) => Value::Bool(b),
            _ => return false,
        };
        py_is(&subject, &v)
    }

    fn matchsequence(&mut self, _node: &PatternLoc, span: Span, patterns: &[PatternLoc], depth: usize) -> bool {
        let subject = self.match_subject();
        let items = match subject {
            Value::Ref(id) => match self.heap.get(id) {
                HeapData::List(items) | HeapData::Tuple(items) => items.clone(),
                _ => return false,
            },
            _ => return false,
        };
        let star = patterns
            .iter()
            .position(|p| matches!(p.pattern, Pattern::MatchStar(_)));
        match star {
            None => {
                if items.len() != patterns.len() {
                    return false;
                }
                for (pattern, item) in patterns.iter().zip(items) {
                    self.subjects.push(item);
                    let matched = self.exec_pattern(pattern, depth + 1);
                    self.subjects.pop();
                    if !matched || !self.running() {
                        return false;
                    }
                }
                true
            }
            Some(star_idx) => {
                let before = star_idx;
                let after = patterns.len() - star_idx - 1;
                if items.len() < before + after {
                    return false;
                }
                for (pattern, item) in patterns[..before].iter().zip(&items[..before]) {
                    self.subjects.push(*item);
                    let matched = self.exec_pattern(pattern, depth + 1);
                    self.subjects.pop();
                    if !matched || !self.running() {
                        return false;
                    }
                }
                let rest: Vec<Value> = items[before..items.len() - after].to_vec();
                let rest = Value::Ref(self.heap.allocate(HeapData::List(rest)));
                self.subjects.push(rest);
                let matched = self.exec_pattern(&patterns[star_idx], depth + 1);
                self.subjects.pop();
                if !matched {
                    return false;
                }
                for (pattern, item) in patterns[star_idx + 1..].iter().zip(&items[items.len() - after..]) {
                    self.subjects.push(*item);
                    let matched = self.exec_pattern(pattern, depth + 1);
                    self.subjects.pop();
                    if !matched || !self.running() {
                        return false;
                    }
                }
                let _ = span;
                true
            }
        }
    }

    fn matchmapping(
        &mut self,
        _node: &PatternLoc,
        _span: Span,
        keys: &[ExprLoc],
        patterns: &[PatternLoc],
        rest: Option<&NameRef>,
        depth: usize,
    ) -> bool {
        let subject = self.match_subject();
        let pairs = match subject {
            Value::Ref(id) => match self.heap.get(id) {
                HeapData::Dict(pairs) => pairs.clone(),
                _ => return false,
            },
            _ => return false,
        };
        let mut used: Vec<usize> = Vec::new();
        for (key_expr, pattern) in keys.iter().zip(patterns) {
            let Some(key) = self.exec_value(key_expr, depth + 1) else {
                return false;
            };
            let found = pairs
                .iter()
                .enumerate()
                .find(|(_, (k, _))| py_eq(k, &key, &self.heap, self.interner));
            let Some((i, (_, v))) = found else { return false };
            used.push(i);
            self.subjects.push(*v);
            let matched = self.exec_pattern(pattern, depth + 1);
            self.subjects.pop();
            if !matched || !self.running() {
                return false;
            }
        }
        if let Some(rest) = rest {
            let remaining: Vec<(Value, Value)> = pairs
                .iter()
                .enumerate()
                .filter(|(i, _)| !used.contains(i))
                .map(|(_, pair)| *pair)
                .collect();
            let rest_value = Value::Ref(self.heap.allocate(HeapData::Dict(remaining)));
            self.store_name(rest, rest_value);
        }
        true
    }

    fn matchclass(
        &mut self,
        _node: &PatternLoc,
        span: Span,
        cls: &ExprLoc,
        patterns: &[PatternLoc],
        kwd_attrs: &[StringId],
        kwd_patterns: &[PatternLoc],
        depth: usize,
    ) -> bool {
        let subject = self.match_subject();
        let Some(class_value) = self.exec_value(cls, depth + 1) else {
            return false;
        };
        if !self.isinstance(&subject, &class_value) {
            return false;
        }
        // Positional sub-patterns match declared attributes in order.
        if !patterns.is_empty() {
            let Value::Class(cid) = class_value else { return false };
            let attr_names: Vec<StringId> = self.module.class(cid).attrs.keys().copied().collect();
            if patterns.len() > attr_names.len() {
                return false;
            }
            for (pattern, attr) in patterns.iter().zip(&attr_names) {
                let value = self.get_attr(subject, *attr, span);
                let Some(value) = self.check(value) else { return false };
                self.subjects.push(value);
                let matched = self.exec_pattern(pattern, depth + 1);
                self.subjects.pop();
                if !matched || !self.running() {
                    return false;
                }
            }
        }
        for (attr, pattern) in kwd_attrs.iter().zip(kwd_patterns) {
            let value = self.get_attr(subject, *attr, span);
            let Some(value) = self.check(value) else { return false };
            self.subjects.push(value);
            let matched = self.exec_pattern(pattern, depth + 1);
            self.subjects.pop();
            if !matched || !self.running() {
                return false;
            }
        }
        true
    }

    fn matchstar(&mut self, _node: &PatternLoc, _span: Span, name: Option<&NameRef>, _depth: usize) -> bool {
        // The sequence pattern pushes the collected rest as the subject.
        if let Some(name) = name {
            let rest = self.match_subject();
            self.store_name(name, rest);
        }
        true
    }

    fn matchas(
        &mut self,
        _node: &PatternLoc,
        _span: Span,
        pattern: Option<&PatternLoc>,
        name: Option<&NameRef>,
        depth: usize,
    ) -> bool {
        if let Some(pattern) = pattern {
            let subject = self.match_subject();
            self.subjects.push(subject);
            let matched = self.exec_pattern(pattern, depth + 1);
            self.subjects.pop();
            if !matched {
                return false;
            }
        }
        if let Some(name) = name {
            let subject = self.match_subject();
            self.store_name(name, subject);
        }
        true
    }

    fn matchor(&mut self, _node: &PatternLoc, _span: Span, patterns: &[PatternLoc], depth: usize) -> bool {
        for pattern in patterns {
            let subject = self.match_subject();
            self.subjects.push(subject);
            let matched = self.exec_pattern(pattern, depth + 1);
            self.subjects.pop();
            if matched {
                return true;
            }
            if !self.running() {
                return false;
            }
        }
        false
    }
}
