//! The typed AST.
//!
//! Nodes are grouped into expressions, statements, and match patterns, each
//! carrying a source span. Expression nodes have a `resolved_type` slot and
//! operator nodes a resolution slot, both filled by sema.
//!
//! The [`Module`] owns every node: statement trees hang off `body`, while
//! function and class definitions live in flat vectors addressed by
//! [`FuncId`]/[`ClassId`]. Runtime values reference definitions by id, never
//! by pointer, so a closure stays valid for the lifetime of its module.

use indexmap::IndexMap;

use crate::exc::ExcKind;
use crate::intern::StringId;
use crate::ops::{BinOpKind, BoolOpKind, CmpOpKind, UnaryOpKind};
use crate::token::Span;
use crate::types::{Builtin, Intrinsic, Ty};

/// Index of a function definition in [`Module::functions`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
pub struct FuncId(pub u32);

impl FuncId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Index of a class definition in [`Module::classes`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
pub struct ClassId(pub u32);

impl ClassId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Which storage a resolved name refers to.
///
/// Decided by sema: module-level names are `Global` (absolute binding
/// index), function locals are `Local` (frame-relative slot), and locals
/// shared with nested functions through `nonlocal` are `Cell`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum NameScope {
    #[default]
    Local,
    Global,
    Cell,
}

/// A resolved name reference: interned text plus the varid sema assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct NameRef {
    pub name: StringId,
    pub scope: NameScope,
    slot: Option<u32>,
}

impl NameRef {
    pub fn new(name: StringId) -> Self {
        Self {
            name,
            scope: NameScope::Local,
            slot: None,
        }
    }

    /// The binding index assigned by sema.
    ///
    /// # Panics
    /// Panics when sema has not resolved this name.
    pub fn varid(&self) -> u32 {
        self.slot.expect("name not resolved by sema")
    }

    pub fn is_resolved(&self) -> bool {
        self.slot.is_some()
    }

    pub fn resolve(&mut self, scope: NameScope, slot: u32) {
        self.scope = scope;
        self.slot = Some(slot);
    }
}

/// How an operator node is implemented, decided by sema.
#[derive(Debug, Clone, Copy, PartialEq, Default, serde::Serialize, serde::Deserialize)]
pub enum OpImpl {
    /// Operand types unknown at analysis time; the evaluator dispatches on
    /// runtime tags.
    #[default]
    Unresolved,
    /// A native intrinsic for primitive operand types.
    Native(Intrinsic),
    /// A user-defined dunder method.
    User(FuncId),
}

/// A compile-time constant.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum ConstValue {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(StringId),
}

impl ConstValue {
    pub fn ty(&self) -> Ty {
        match self {
            Self::None => Ty::None,
            Self::Bool(_) => Ty::Bool,
            Self::Int(_) => Ty::I64,
            Self::Float(_) => Ty::F64,
            Self::Str(_) => Ty::Str,
        }
    }
}

/// An expression with its source span and inferred type.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ExprLoc {
    pub span: Span,
    /// Filled by sema; `None` before analysis.
    pub resolved_type: Option<Ty>,
    pub expr: Expr,
}

impl ExprLoc {
    pub fn new(span: Span, expr: Expr) -> Self {
        Self {
            span,
            resolved_type: None,
            expr,
        }
    }

    pub fn constant(span: Span, value: ConstValue) -> Self {
        Self::new(span, Expr::Constant(value))
    }

    pub fn is_constant(&self) -> bool {
        matches!(self.expr, Expr::Constant(_))
    }
}

/// A keyword argument at a call site.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CallKeyword {
    pub name: StringId,
    pub value: ExprLoc,
}

/// One `for target in iter [if cond]*` clause of a comprehension.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Comprehension {
    pub target: ExprLoc,
    pub iter: ExprLoc,
    pub ifs: Vec<ExprLoc>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Expr {
    Constant(ConstValue),
    Name(NameRef),
    /// A name sema resolved to a builtin type, function, or exception.
    BuiltinType(Builtin),
    BinOp {
        left: Box<ExprLoc>,
        op: BinOpKind,
        right: Box<ExprLoc>,
        resolved: OpImpl,
    },
    BoolOp {
        op: BoolOpKind,
        values: Vec<ExprLoc>,
        resolved: OpImpl,
    },
    UnaryOp {
        op: UnaryOpKind,
        operand: Box<ExprLoc>,
        resolved: OpImpl,
    },
    /// A chained comparison: `left ops[0] comparators[0] ops[1] ...`.
    ///
    /// `resolved` is parallel to `ops`; evaluation short-circuits on the
    /// first false link.
    Compare {
        left: Box<ExprLoc>,
        ops: Vec<CmpOpKind>,
        comparators: Vec<ExprLoc>,
        resolved: Vec<OpImpl>,
    },
    Call {
        func: Box<ExprLoc>,
        args: Vec<ExprLoc>,
        keywords: Vec<CallKeyword>,
    },
    Attribute {
        value: Box<ExprLoc>,
        attr: StringId,
    },
    Subscript {
        value: Box<ExprLoc>,
        index: Box<ExprLoc>,
    },
    Slice {
        lower: Option<Box<ExprLoc>>,
        upper: Option<Box<ExprLoc>>,
        step: Option<Box<ExprLoc>>,
    },
    /// A lambda; its single-expression body is stored as a function whose
    /// body is one `return`.
    Lambda(FuncId),
    IfExp {
        test: Box<ExprLoc>,
        body: Box<ExprLoc>,
        orelse: Box<ExprLoc>,
    },
    ListExpr(Vec<ExprLoc>),
    TupleExpr(Vec<ExprLoc>),
    SetExpr(Vec<ExprLoc>),
    DictExpr {
        keys: Vec<ExprLoc>,
        values: Vec<ExprLoc>,
    },
    ListComp {
        elt: Box<ExprLoc>,
        generators: Vec<Comprehension>,
    },
    SetComp {
        elt: Box<ExprLoc>,
        generators: Vec<Comprehension>,
    },
    DictComp {
        key: Box<ExprLoc>,
        value: Box<ExprLoc>,
        generators: Vec<Comprehension>,
    },
    GeneratorExp {
        elt: Box<ExprLoc>,
        generators: Vec<Comprehension>,
    },
    /// Walrus: `(target := value)`.
    NamedExpr {
        target: NameRef,
        value: Box<ExprLoc>,
    },
    Starred(Box<ExprLoc>),
    Await(Box<ExprLoc>),
    Yield(Option<Box<ExprLoc>>),
    YieldFrom(Box<ExprLoc>),
    /// An f-string: parts are `Constant(Str)` and `FormattedValue`.
    JoinedStr(Vec<ExprLoc>),
    FormattedValue {
        value: Box<ExprLoc>,
        format_spec: Option<StringId>,
    },

    // Type expressions, produced when sema resolves annotations.
    Arrow {
        params: Vec<ExprLoc>,
        ret: Box<ExprLoc>,
    },
    ArrayType {
        item: Box<ExprLoc>,
    },
    SetType {
        item: Box<ExprLoc>,
    },
    TupleType {
        items: Vec<ExprLoc>,
    },
    DictType {
        key: Box<ExprLoc>,
        value: Box<ExprLoc>,
    },
    ClassType(ClassId),
}

/// A statement with its source span.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct StmtLoc {
    pub span: Span,
    pub stmt: Stmt,
}

impl StmtLoc {
    pub fn new(span: Span, stmt: Stmt) -> Self {
        Self { span, stmt }
    }
}

/// `with` item: `context_expr as optional_vars`.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct WithItem {
    pub context_expr: ExprLoc,
    pub optional_vars: Option<NameRef>,
}

/// One `except` clause.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ExceptHandler {
    pub span: Span,
    /// `None` for a bare `except:`, which matches everything.
    pub exc_type: Option<ExprLoc>,
    pub name: Option<NameRef>,
    pub body: Vec<StmtLoc>,
}

/// `import a.b as c` / `from m import a as c` entry.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ImportAlias {
    /// Dotted path segments (`a.b` is two segments).
    pub path: Vec<StringId>,
    pub asname: Option<StringId>,
    /// The name actually bound in the current scope: the alias when present,
    /// otherwise the first path segment for `import` and the last for
    /// `from ... import`.
    pub binding: NameRef,
}

/// One `case` arm of a `match` statement.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct MatchCase {
    pub pattern: PatternLoc,
    pub guard: Option<ExprLoc>,
    pub body: Vec<StmtLoc>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Stmt {
    Expr(ExprLoc),
    Assign {
        targets: Vec<ExprLoc>,
        value: ExprLoc,
    },
    AugAssign {
        target: Box<ExprLoc>,
        op: BinOpKind,
        value: Box<ExprLoc>,
        resolved: OpImpl,
    },
    AnnAssign {
        target: Box<ExprLoc>,
        annotation: Box<ExprLoc>,
        value: Option<Box<ExprLoc>>,
    },
    Return(Option<ExprLoc>),
    Delete(Vec<ExprLoc>),
    Pass,
    Break,
    Continue,
    FunctionDef(FuncId),
    ClassDef(ClassId),
    /// Canonical `if`/`elif` chain: `tests` and `bodies` are parallel, with
    /// the `else` tail in `orelse`.
    If {
        tests: Vec<ExprLoc>,
        bodies: Vec<Vec<StmtLoc>>,
        orelse: Vec<StmtLoc>,
    },
    While {
        test: ExprLoc,
        body: Vec<StmtLoc>,
        orelse: Vec<StmtLoc>,
    },
    For {
        target: ExprLoc,
        iter: ExprLoc,
        body: Vec<StmtLoc>,
        orelse: Vec<StmtLoc>,
    },
    With {
        items: Vec<WithItem>,
        body: Vec<StmtLoc>,
    },
    Raise {
        exc: Option<ExprLoc>,
        cause: Option<ExprLoc>,
    },
    Try {
        body: Vec<StmtLoc>,
        handlers: Vec<ExceptHandler>,
        orelse: Vec<StmtLoc>,
        finalbody: Vec<StmtLoc>,
    },
    Assert {
        test: ExprLoc,
        msg: Option<ExprLoc>,
    },
    Import {
        names: Vec<ImportAlias>,
    },
    ImportFrom {
        module: Vec<StringId>,
        names: Vec<ImportAlias>,
    },
    Global(Vec<StringId>),
    Nonlocal(Vec<StringId>),
    Match {
        subject: ExprLoc,
        cases: Vec<MatchCase>,
    },
    /// A run of statements executed in place, with no scope of its own.
    Inline(Vec<StmtLoc>),
}

/// A match pattern with its source span.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PatternLoc {
    pub span: Span,
    pub pattern: Pattern,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Pattern {
    /// Matches by equality against the evaluated expression.
    MatchValue(ExprLoc),
    /// Matches `None`/`True`/`False` by identity.
    MatchSingleton(ConstValue),
    MatchSequence(Vec<PatternLoc>),
    MatchMapping {
        keys: Vec<ExprLoc>,
        patterns: Vec<PatternLoc>,
        rest: Option<NameRef>,
    },
    MatchClass {
        cls: Box<ExprLoc>,
        patterns: Vec<PatternLoc>,
        kwd_attrs: Vec<StringId>,
        kwd_patterns: Vec<PatternLoc>,
    },
    /// `*rest` inside a sequence pattern; `None` for `*_`.
    MatchStar(Option<NameRef>),
    /// `pattern as name`, a bare capture, or the wildcard `_`.
    MatchAs {
        pattern: Option<Box<PatternLoc>>,
        name: Option<NameRef>,
    },
    MatchOr(Vec<PatternLoc>),
}

/// A single formal parameter.
#[derive(Debug, Clone, PartialEq, Default, serde::Serialize, serde::Deserialize)]
pub struct Param {
    pub name: StringId,
    pub span: Span,
    pub annotation: Option<ExprLoc>,
    pub default: Option<ExprLoc>,
}

/// A parameter list: positional(-or-keyword) then keyword-only.
#[derive(Debug, Clone, PartialEq, Default, serde::Serialize, serde::Deserialize)]
pub struct Arguments {
    /// Parameters before `*`; the first `posonly_count` of them precede `/`.
    pub args: Vec<Param>,
    pub posonly_count: usize,
    /// Parameters after `*`.
    pub kwonly_args: Vec<Param>,
    /// `*rest` name, if present.
    pub vararg: Option<Param>,
    /// `**rest` name, if present.
    pub kwarg: Option<Param>,
}

impl Arguments {
    /// All parameters in binding order.
    pub fn all(&self) -> impl Iterator<Item = &Param> {
        self.args
            .iter()
            .chain(self.vararg.iter())
            .chain(self.kwonly_args.iter())
            .chain(self.kwarg.iter())
    }

    pub fn param_count(&self) -> usize {
        self.args.len()
            + self.kwonly_args.len()
            + usize::from(self.vararg.is_some())
            + usize::from(self.kwarg.is_some())
    }
}

/// Where a captured value comes from in the defining frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Capture {
    /// Slot in the nested function's frame that receives the value.
    pub target_slot: u32,
    /// Slot in the defining frame the snapshot is read from.
    pub source_slot: u32,
    /// Scope of the source in the defining frame.
    pub source_scope: NameScope,
}

/// A function definition, shared by `def`, methods, and lambdas.
#[derive(Debug, Clone, PartialEq, Default, serde::Serialize, serde::Deserialize)]
pub struct FunctionDef {
    pub name: StringId,
    pub span: Span,
    pub args: Arguments,
    pub body: Vec<StmtLoc>,
    pub returns: Option<ExprLoc>,
    pub docstring: Option<StringId>,
    pub decorators: Vec<ExprLoc>,
    pub is_async: bool,

    // Filled by sema.
    /// Where the `def` statement stores the function value; `None` for
    /// lambdas and methods.
    pub binding: Option<NameRef>,
    /// Contains `yield` or `yield from`.
    pub is_generator: bool,
    /// Number of local slots, parameters included.
    pub nlocals: u32,
    /// Local slots that hold cells shared with nested functions.
    pub cell_slots: Vec<u32>,
    /// Values snapshotted from the defining frame at definition time.
    pub captures: Vec<Capture>,
    /// Resolved parameter types, parallel to the binding order of `args`.
    pub param_tys: Vec<Ty>,
    pub return_ty: Ty,
}

/// One declared class attribute: `name: annotation [= default]`.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ClassAttr {
    pub span: Span,
    pub annotation: Option<ExprLoc>,
    pub default: Option<ExprLoc>,
    /// Resolved attribute type, filled by sema.
    pub ty: Ty,
}

/// A class definition.
///
/// `attrs` keeps declaration order; the implicit constructor binds
/// positional arguments in exactly this order.
#[derive(Debug, Clone, PartialEq, Default, serde::Serialize, serde::Deserialize)]
pub struct ClassDef {
    pub name: StringId,
    pub span: Span,
    pub bases: Vec<ExprLoc>,
    pub docstring: Option<StringId>,
    pub decorators: Vec<ExprLoc>,
    pub attrs: IndexMap<StringId, ClassAttr>,
    pub methods: IndexMap<StringId, FuncId>,
    pub nested: IndexMap<StringId, ClassId>,

    // Filled by sema.
    /// Where the `class` statement stores the class value; `None` for
    /// nested classes.
    pub binding: Option<NameRef>,
    /// Single user-defined base, when one resolves.
    pub base_class: Option<ClassId>,
    /// Builtin exception this class ultimately derives from, when raised.
    pub exc_base: Option<ExcKind>,
}

/// A parsed translation unit and the arena of its definitions.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct Module {
    pub docstring: Option<StringId>,
    pub body: Vec<StmtLoc>,
    pub functions: Vec<FunctionDef>,
    pub classes: Vec<ClassDef>,
    /// Number of module-level binding slots, filled by sema. The evaluator
    /// pre-sizes the global frame so branch-dependent introductions keep
    /// their varids.
    pub module_nlocals: u32,
    /// Module-level `def main`, when present; the CLI entry point.
    pub main: Option<FuncId>,
}

impl Module {
    pub fn add_function(&mut self, def: FunctionDef) -> FuncId {
        let id = FuncId(u32::try_from(self.functions.len()).expect("function table overflow"));
        self.functions.push(def);
        id
    }

    pub fn add_class(&mut self, def: ClassDef) -> ClassId {
        let id = ClassId(u32::try_from(self.classes.len()).expect("class table overflow"));
        self.classes.push(def);
        id
    }

    pub fn func(&self, id: FuncId) -> &FunctionDef {
        &self.functions[id.index()]
    }

    pub fn class(&self, id: ClassId) -> &ClassDef {
        &self.classes[id.index()]
    }

    /// Looks up an attribute declaration, walking user-defined bases.
    pub fn find_attr(&self, class: ClassId, name: StringId) -> Option<&ClassAttr> {
        let mut current = Some(class);
        while let Some(id) = current {
            let def = self.class(id);
            if let Some(attr) = def.attrs.get(&name) {
                return Some(attr);
            }
            current = def.base_class;
        }
        None
    }

    /// Looks up a method, walking user-defined bases.
    pub fn find_method(&self, class: ClassId, name: StringId) -> Option<FuncId> {
        let mut current = Some(class);
        while let Some(id) = current {
            let def = self.class(id);
            if let Some(&func) = def.methods.get(&name) {
                return Some(func);
            }
            current = def.base_class;
        }
        None
    }

    /// Whether `class` is `target` or inherits from it.
    pub fn is_subclass(&self, class: ClassId, target: ClassId) -> bool {
        let mut current = Some(class);
        while let Some(id) = current {
            if id == target {
                return true;
            }
            current = self.class(id).base_class;
        }
        false
    }
}
