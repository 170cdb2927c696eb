//! Type expressions and the native operator dispatch table.
//!
//! Sema computes a [`Ty`] for every expression. Operators on primitive types
//! resolve through the flat table in [`native_binop`]/[`native_cmp`]/
//! [`native_unary`] to an [`Intrinsic`] — pure data, applied by the
//! evaluator — while everything else falls back to dunder lookup on the
//! operand's class.

use std::fmt;

use strum::{Display, EnumString, IntoStaticStr, VariantArray};

use crate::ast::{ClassId, Module};
use crate::exc::ExcKind;
use crate::intern::{Interner, StaticStr};
use crate::ops::{BinOpKind, BoolOpKind, CmpOpKind, UnaryOpKind};

/// A type expression.
#[derive(Debug, Clone, PartialEq, Default, serde::Serialize, serde::Deserialize)]
pub enum Ty {
    /// Not yet known; unifies with anything.
    #[default]
    Unknown,
    None,
    Bool,
    I32,
    I64,
    F32,
    F64,
    Str,
    List(Box<Ty>),
    Set(Box<Ty>),
    Tuple(Vec<Ty>),
    Dict(Box<Ty>, Box<Ty>),
    /// A callable signature.
    Arrow { params: Vec<Ty>, ret: Box<Ty> },
    Class(ClassId),
    Exc(ExcKind),
    /// The type of a type spelling (`i32` used as a value).
    Type(Box<Ty>),
}

impl Ty {
    pub fn is_int(&self) -> bool {
        matches!(self, Self::Bool | Self::I32 | Self::I64)
    }

    pub fn is_float(&self) -> bool {
        matches!(self, Self::F32 | Self::F64)
    }

    pub fn is_numeric(&self) -> bool {
        self.is_int() || self.is_float()
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown)
    }

    /// Renders the type for error messages.
    pub fn render(&self, module: &Module, interner: &Interner) -> String {
        match self {
            Self::Unknown => "?".to_owned(),
            Self::None => "None".to_owned(),
            Self::Bool => "bool".to_owned(),
            Self::I32 => "i32".to_owned(),
            Self::I64 => "i64".to_owned(),
            Self::F32 => "f32".to_owned(),
            Self::F64 => "f64".to_owned(),
            Self::Str => "str".to_owned(),
            Self::List(item) => format!("list[{}]", item.render(module, interner)),
            Self::Set(item) => format!("set[{}]", item.render(module, interner)),
            Self::Tuple(items) => {
                let inner: Vec<_> = items.iter().map(|t| t.render(module, interner)).collect();
                format!("tuple[{}]", inner.join(", "))
            }
            Self::Dict(k, v) => format!("dict[{}, {}]", k.render(module, interner), v.render(module, interner)),
            Self::Arrow { params, ret } => {
                let inner: Vec<_> = params.iter().map(|t| t.render(module, interner)).collect();
                format!("({}) -> {}", inner.join(", "), ret.render(module, interner))
            }
            Self::Class(id) => interner.get(module.class(*id).name).to_owned(),
            Self::Exc(kind) => kind.to_string(),
            Self::Type(inner) => format!("type[{}]", inner.render(module, interner)),
        }
    }
}

/// Whether a value of type `from` may bind to a target of type `to`.
///
/// Widths within one numeric family convert; int and float do not mix.
pub fn assignable(from: &Ty, to: &Ty, module: &Module) -> bool {
    match (from, to) {
        (Ty::Unknown, _) | (_, Ty::Unknown) => true,
        (a, b) if a == b => true,
        (a, b) if a.is_int() && b.is_int() => true,
        (a, b) if a.is_float() && b.is_float() => true,
        (Ty::List(a), Ty::List(b)) | (Ty::Set(a), Ty::Set(b)) => assignable(a, b, module),
        (Ty::Dict(ak, av), Ty::Dict(bk, bv)) => assignable(ak, bk, module) && assignable(av, bv, module),
        (Ty::Tuple(a), Ty::Tuple(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| assignable(x, y, module))
        }
        (Ty::Class(a), Ty::Class(b)) => module.is_subclass(*a, *b),
        (Ty::Exc(a), Ty::Exc(b)) => a.is_subclass_of(*b),
        _ => false,
    }
}

/// Least common type of two branches; `Unknown` when they do not meet.
pub fn unify(a: &Ty, b: &Ty) -> Ty {
    if a == b {
        return a.clone();
    }
    match (a, b) {
        (Ty::Unknown, other) | (other, Ty::Unknown) => other.clone(),
        (x, y) if x.is_int() && y.is_int() => Ty::I64,
        (x, y) if x.is_numeric() && y.is_numeric() => Ty::F64,
        _ => Ty::Unknown,
    }
}

/// Builtin type spellings usable in annotations and as cast callables.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr, VariantArray, serde::Serialize, serde::Deserialize,
)]
#[strum(serialize_all = "lowercase")]
pub enum TyPrim {
    I32,
    I64,
    F32,
    F64,
    Bool,
    Str,
    #[strum(serialize = "None")]
    NoneType,
}

impl TyPrim {
    pub fn as_ty(self) -> Ty {
        match self {
            Self::I32 => Ty::I32,
            Self::I64 => Ty::I64,
            Self::F32 => Ty::F32,
            Self::F64 => Ty::F64,
            Self::Bool => Ty::Bool,
            Self::Str => Ty::Str,
            Self::NoneType => Ty::None,
        }
    }
}

/// Builtin functions.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr, VariantArray, serde::Serialize, serde::Deserialize,
)]
#[strum(serialize_all = "lowercase")]
pub enum BuiltinFn {
    Print,
    Len,
    Range,
    /// `int(x)`; the width spellings `i32`/`i64` resolve as types instead.
    Int,
    Float,
    Abs,
    Min,
    Max,
    Isinstance,
    Repr,
}

impl BuiltinFn {
    /// Result type when it does not depend on the arguments.
    pub fn result_ty(self) -> Ty {
        match self {
            Self::Print => Ty::None,
            Self::Len => Ty::I64,
            Self::Range => Ty::List(Box::new(Ty::I64)),
            Self::Repr => Ty::Str,
            Self::Int => Ty::I64,
            Self::Float => Ty::F64,
            Self::Isinstance => Ty::Bool,
            Self::Abs | Self::Min | Self::Max => Ty::Unknown,
        }
    }
}

/// A name with builtin meaning: a primitive type, a native function, or an
/// exception type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Builtin {
    Type(TyPrim),
    Fn(BuiltinFn),
    Exc(ExcKind),
}

impl Builtin {
    /// Resolves a builtin by source spelling.
    pub fn lookup(name: &str) -> Option<Self> {
        if let Ok(prim) = name.parse::<TyPrim>() {
            return Some(Self::Type(prim));
        }
        if let Ok(f) = name.parse::<BuiltinFn>() {
            return Some(Self::Fn(f));
        }
        if let Ok(exc) = name.parse::<ExcKind>() {
            return Some(Self::Exc(exc));
        }
        None
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Type(p) => p.into(),
            Self::Fn(f) => f.into(),
            Self::Exc(e) => e.into(),
        }
    }
}

impl fmt::Display for Builtin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A native operator implementation, stored on resolved operator nodes.
///
/// Serialized as data; the evaluator maps each variant to its function.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Intrinsic {
    IntBin(BinOpKind),
    FloatBin(BinOpKind),
    StrConcat,
    StrRepeat,
    ListConcat,
    ListRepeat,
    IntCmp(CmpOpKind),
    FloatCmp(CmpOpKind),
    StrCmp(CmpOpKind),
    /// `==`, `!=`, `is`, `is not` over arbitrary values.
    EqAny(CmpOpKind),
    /// `in` / `not in` membership.
    Contains(CmpOpKind),
    BoolJoin(BoolOpKind),
    IntUnary(UnaryOpKind),
    FloatUnary(UnaryOpKind),
    /// `not` over any value's truthiness.
    NotTruth,
}

/// Result type of an integer pair under a binary operator.
fn int_pair_result(op: BinOpKind, l: &Ty, r: &Ty) -> Ty {
    match op {
        BinOpKind::Div => Ty::F64,
        _ => {
            if matches!(l, Ty::I64) || matches!(r, Ty::I64) {
                Ty::I64
            } else if matches!(l, Ty::Bool) && matches!(r, Ty::Bool) {
                Ty::I64
            } else {
                Ty::I32
            }
        }
    }
}

/// Looks up the native implementation of a binary operator.
pub fn native_binop(op: BinOpKind, l: &Ty, r: &Ty) -> Option<(Intrinsic, Ty)> {
    if l.is_int() && r.is_int() {
        return Some((Intrinsic::IntBin(op), int_pair_result(op, l, r)));
    }
    if l.is_numeric() && r.is_numeric() {
        // Bitwise and shift operators have no float form.
        if matches!(
            op,
            BinOpKind::BitAnd | BinOpKind::BitOr | BinOpKind::BitXor | BinOpKind::LShift | BinOpKind::RShift
        ) {
            return None;
        }
        let ty = if matches!(l, Ty::F32) && matches!(r, Ty::F32 | Ty::I32) {
            Ty::F32
        } else {
            Ty::F64
        };
        return Some((Intrinsic::FloatBin(op), ty));
    }
    match (op, l, r) {
        (BinOpKind::Add, Ty::Str, Ty::Str) => Some((Intrinsic::StrConcat, Ty::Str)),
        (BinOpKind::Mult, Ty::Str, r) if r.is_int() => Some((Intrinsic::StrRepeat, Ty::Str)),
        (BinOpKind::Mult, l, Ty::Str) if l.is_int() => Some((Intrinsic::StrRepeat, Ty::Str)),
        (BinOpKind::Add, Ty::List(a), Ty::List(b)) => {
            Some((Intrinsic::ListConcat, Ty::List(Box::new(unify(a, b)))))
        }
        (BinOpKind::Mult, Ty::List(a), r) if r.is_int() => {
            Some((Intrinsic::ListRepeat, Ty::List(a.clone())))
        }
        (BinOpKind::Mult, l, Ty::List(a)) if l.is_int() => {
            Some((Intrinsic::ListRepeat, Ty::List(a.clone())))
        }
        _ => None,
    }
}

/// Looks up the native implementation of a comparison operator.
pub fn native_cmp(op: CmpOpKind, l: &Ty, r: &Ty) -> Option<Intrinsic> {
    match op {
        CmpOpKind::Eq | CmpOpKind::NotEq | CmpOpKind::Is | CmpOpKind::IsNot => Some(Intrinsic::EqAny(op)),
        CmpOpKind::In | CmpOpKind::NotIn => match r {
            Ty::List(_) | Ty::Set(_) | Ty::Tuple(_) | Ty::Dict(_, _) | Ty::Str | Ty::Unknown => {
                Some(Intrinsic::Contains(op))
            }
            _ => None,
        },
        CmpOpKind::Lt | CmpOpKind::LtE | CmpOpKind::Gt | CmpOpKind::GtE => {
            if l.is_int() && r.is_int() {
                Some(Intrinsic::IntCmp(op))
            } else if l.is_numeric() && r.is_numeric() {
                Some(Intrinsic::FloatCmp(op))
            } else if matches!(l, Ty::Str) && matches!(r, Ty::Str) {
                Some(Intrinsic::StrCmp(op))
            } else {
                None
            }
        }
    }
}

/// Looks up the native implementation of a unary operator.
pub fn native_unary(op: UnaryOpKind, t: &Ty) -> Option<(Intrinsic, Ty)> {
    match op {
        UnaryOpKind::Not => Some((Intrinsic::NotTruth, Ty::Bool)),
        UnaryOpKind::USub | UnaryOpKind::UAdd => {
            if t.is_int() {
                Some((Intrinsic::IntUnary(op), if matches!(t, Ty::I32) { Ty::I32 } else { Ty::I64 }))
            } else if t.is_float() {
                Some((Intrinsic::FloatUnary(op), t.clone()))
            } else {
                None
            }
        }
        UnaryOpKind::Invert => {
            if t.is_int() {
                Some((Intrinsic::IntUnary(op), Ty::I64))
            } else {
                None
            }
        }
    }
}

/// The boolean operators are native for every operand type; the reduction
/// over truthiness always yields a bool.
pub fn native_boolop(op: BoolOpKind, _tys: &[Ty]) -> (Intrinsic, Ty) {
    (Intrinsic::BoolJoin(op), Ty::Bool)
}

/// Dunder method consulted when an operand type does not resolve natively.
pub fn dunder_for_binop(op: BinOpKind) -> StaticStr {
    match op {
        BinOpKind::Add => StaticStr::DunderAdd,
        BinOpKind::Sub => StaticStr::DunderSub,
        BinOpKind::Mult => StaticStr::DunderMul,
        BinOpKind::MatMult => StaticStr::DunderMatmul,
        BinOpKind::Div => StaticStr::DunderTruediv,
        BinOpKind::FloorDiv => StaticStr::DunderFloordiv,
        BinOpKind::Mod => StaticStr::DunderMod,
        BinOpKind::Pow => StaticStr::DunderPow,
        BinOpKind::LShift => StaticStr::DunderLshift,
        BinOpKind::RShift => StaticStr::DunderRshift,
        BinOpKind::BitOr => StaticStr::DunderOr,
        BinOpKind::BitXor => StaticStr::DunderXor,
        BinOpKind::BitAnd => StaticStr::DunderAnd,
    }
}

/// Right-handed fallback consulted on the right operand.
pub fn reflected_dunder_for_binop(op: BinOpKind) -> StaticStr {
    match op {
        BinOpKind::Add => StaticStr::DunderRadd,
        BinOpKind::Sub => StaticStr::DunderRsub,
        BinOpKind::Mult => StaticStr::DunderRmul,
        BinOpKind::MatMult => StaticStr::DunderRmatmul,
        BinOpKind::Div => StaticStr::DunderRtruediv,
        BinOpKind::FloorDiv => StaticStr::DunderRfloordiv,
        BinOpKind::Mod => StaticStr::DunderRmod,
        BinOpKind::Pow => StaticStr::DunderRpow,
        BinOpKind::LShift => StaticStr::DunderRlshift,
        BinOpKind::RShift => StaticStr::DunderRrshift,
        BinOpKind::BitOr => StaticStr::DunderRor,
        BinOpKind::BitXor => StaticStr::DunderRxor,
        BinOpKind::BitAnd => StaticStr::DunderRand,
    }
}

/// In-place dunder consulted first for augmented assignment.
pub fn inplace_dunder_for_binop(op: BinOpKind) -> Option<StaticStr> {
    match op {
        BinOpKind::Add => Some(StaticStr::DunderIadd),
        BinOpKind::Sub => Some(StaticStr::DunderIsub),
        BinOpKind::Mult => Some(StaticStr::DunderImul),
        BinOpKind::Div => Some(StaticStr::DunderItruediv),
        BinOpKind::FloorDiv => Some(StaticStr::DunderIfloordiv),
        BinOpKind::Mod => Some(StaticStr::DunderImod),
        BinOpKind::Pow => Some(StaticStr::DunderIpow),
        _ => None,
    }
}

pub fn dunder_for_unary(op: UnaryOpKind) -> Option<StaticStr> {
    match op {
        UnaryOpKind::USub => Some(StaticStr::DunderNeg),
        UnaryOpKind::UAdd => Some(StaticStr::DunderPos),
        UnaryOpKind::Invert => Some(StaticStr::DunderInvert),
        UnaryOpKind::Not => None,
    }
}

pub fn dunder_for_cmp(op: CmpOpKind) -> Option<StaticStr> {
    match op {
        CmpOpKind::Eq => Some(StaticStr::DunderEq),
        CmpOpKind::NotEq => Some(StaticStr::DunderNe),
        CmpOpKind::Lt => Some(StaticStr::DunderLt),
        CmpOpKind::LtE => Some(StaticStr::DunderLe),
        CmpOpKind::Gt => Some(StaticStr::DunderGt),
        CmpOpKind::GtE => Some(StaticStr::DunderGe),
        CmpOpKind::In | CmpOpKind::NotIn => Some(StaticStr::DunderContains),
        CmpOpKind::Is | CmpOpKind::IsNot => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_division_widens_to_float() {
        let (_, ty) = native_binop(BinOpKind::Div, &Ty::I64, &Ty::I64).unwrap();
        assert_eq!(ty, Ty::F64);
        let (_, ty) = native_binop(BinOpKind::Add, &Ty::I32, &Ty::I32).unwrap();
        assert_eq!(ty, Ty::I32);
    }

    #[test]
    fn float_has_no_bitwise_form() {
        assert!(native_binop(BinOpKind::BitAnd, &Ty::F64, &Ty::I64).is_none());
        assert!(native_binop(BinOpKind::Add, &Ty::F64, &Ty::I64).is_some());
    }

    #[test]
    fn int_is_not_assignable_to_float() {
        let module = Module::default();
        assert!(!assignable(&Ty::I32, &Ty::F32, &module));
        assert!(assignable(&Ty::I64, &Ty::I32, &module));
        assert!(assignable(&Ty::F32, &Ty::F64, &module));
    }

    #[test]
    fn builtin_lookup_covers_all_classes() {
        assert_eq!(Builtin::lookup("i32"), Some(Builtin::Type(TyPrim::I32)));
        assert_eq!(Builtin::lookup("print"), Some(Builtin::Fn(BuiltinFn::Print)));
        assert!(matches!(Builtin::lookup("ValueError"), Some(Builtin::Exc(_))));
        assert_eq!(Builtin::lookup("frobnicate"), None);
    }
}
