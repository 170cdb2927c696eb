//! Runtime values.
//!
//! Small payloads (numbers, bools, interned strings, ids) are stored inline
//! in the enum; everything bigger lives in the [`Heap`] behind a `Ref`.
//! Copying a `Value` is cheap and copies identity, not contents — use
//! [`deep_copy`] for a structural clone.

use std::cell::Cell;
use std::cmp::Ordering;
use std::sync::OnceLock;

use strum::{Display, IntoStaticStr};

use crate::ast::{ClassId, FuncId, Module};
use crate::heap::{Heap, HeapData, HeapId};
use crate::intern::{Interner, StringId};
use crate::types::Builtin;

/// A runtime value.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Value {
    /// The error sentinel: an unassigned binding slot.
    Undefined,
    None,
    Bool(bool),
    Int(i64),
    F32(f32),
    F64(f64),
    /// A string literal interned at parse time.
    InternStr(StringId),
    /// A builtin type, function, or exception type.
    Builtin(Builtin),
    /// A plain function with no captured environment.
    Function(FuncId),
    Class(ClassId),
    /// A compound object in the arena.
    Ref(HeapId),
}

/// Runtime type tags, used by the registry, `isinstance`, and cast errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr, serde::Serialize, serde::Deserialize)]
#[strum(serialize_all = "lowercase")]
pub enum RtType {
    Undefined,
    #[strum(serialize = "None")]
    NoneType,
    Bool,
    Int,
    F32,
    F64,
    Str,
    List,
    Tuple,
    Set,
    Dict,
    Range,
    Function,
    Method,
    Class,
    Object,
    Exception,
    Generator,
    Coroutine,
    Cell,
    Iterator,
    Builtin,
}

impl Value {
    pub fn type_tag(&self, heap: &Heap) -> RtType {
        match self {
            Self::Undefined => RtType::Undefined,
            Self::None => RtType::NoneType,
            Self::Bool(_) => RtType::Bool,
            Self::Int(_) => RtType::Int,
            Self::F32(_) => RtType::F32,
            Self::F64(_) => RtType::F64,
            Self::InternStr(_) => RtType::Str,
            Self::Builtin(_) => RtType::Builtin,
            Self::Function(_) => RtType::Function,
            Self::Class(_) => RtType::Class,
            Self::Ref(id) => match heap.get(*id) {
                HeapData::Str(_) => RtType::Str,
                HeapData::List(_) => RtType::List,
                HeapData::Tuple(_) => RtType::Tuple,
                HeapData::Set(_) => RtType::Set,
                HeapData::Dict(_) => RtType::Dict,
                HeapData::Range { .. } => RtType::Range,
                HeapData::Closure { .. } => RtType::Function,
                HeapData::BoundMethod { .. } => RtType::Method,
                HeapData::Instance { .. } => RtType::Object,
                HeapData::Cell(_) => RtType::Cell,
                HeapData::Exception(_) => RtType::Exception,
                HeapData::Generator(_) => RtType::Generator,
                HeapData::Coroutine { .. } => RtType::Coroutine,
                HeapData::Iter { .. } => RtType::Iterator,
            },
        }
    }

    pub fn truthy(&self, heap: &Heap, interner: &Interner) -> bool {
        match self {
            Self::Undefined | Self::None => false,
            Self::Bool(b) => *b,
            Self::Int(v) => *v != 0,
            Self::F32(v) => *v != 0.0,
            Self::F64(v) => *v != 0.0,
            Self::InternStr(id) => !interner.get(*id).is_empty(),
            Self::Builtin(_) | Self::Function(_) | Self::Class(_) => true,
            Self::Ref(id) => match heap.get(*id) {
                HeapData::Str(s) => !s.is_empty(),
                HeapData::List(items) | HeapData::Tuple(items) | HeapData::Set(items) => !items.is_empty(),
                HeapData::Dict(pairs) => !pairs.is_empty(),
                HeapData::Range { start, stop, step } => {
                    if *step >= 0 {
                        stop > start
                    } else {
                        stop < start
                    }
                }
                _ => true,
            },
        }
    }

    /// Numeric view, with bools as 0/1.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Bool(b) => Some(f64::from(u8::from(*b))),
            Self::Int(v) => Some(*v as f64),
            Self::F32(v) => Some(f64::from(*v)),
            Self::F64(v) => Some(*v),
            _ => None,
        }
    }

    /// Integer view, with bools as 0/1. Floats do not convert.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Bool(b) => Some(i64::from(*b)),
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// String contents, resolving both interned and heap strings.
    pub fn str_contents<'a>(&self, heap: &'a Heap, interner: &'a Interner) -> Option<&'a str> {
        match self {
            Self::InternStr(id) => Some(interner.get(*id)),
            Self::Ref(id) => match heap.get(*id) {
                HeapData::Str(s) => Some(s.as_str()),
                _ => None,
            },
            _ => None,
        }
    }
}

/// Language-level equality.
///
/// Numbers compare across widths, strings by contents, containers
/// element-wise, everything else by identity.
pub fn py_eq(a: &Value, b: &Value, heap: &Heap, interner: &Interner) -> bool {
    if let (Value::Ref(x), Value::Ref(y)) = (a, b) {
        if x == y {
            return true;
        }
    }
    if let (Some(x), Some(y)) = (a.as_number(), b.as_number()) {
        return x == y;
    }
    if let (Some(x), Some(y)) = (a.str_contents(heap, interner), b.str_contents(heap, interner)) {
        return x == y;
    }
    match (a, b) {
        (Value::None, Value::None) => true,
        (Value::Undefined, _) | (_, Value::Undefined) => false,
        (Value::Builtin(x), Value::Builtin(y)) => x == y,
        (Value::Function(x), Value::Function(y)) => x == y,
        (Value::Class(x), Value::Class(y)) => x == y,
        (Value::Ref(x), Value::Ref(y)) => match (heap.get(*x), heap.get(*y)) {
            (HeapData::List(xs), HeapData::List(ys)) | (HeapData::Tuple(xs), HeapData::Tuple(ys)) => {
                xs.len() == ys.len() && xs.iter().zip(ys).all(|(l, r)| py_eq(l, r, heap, interner))
            }
            (HeapData::Set(xs), HeapData::Set(ys)) => {
                xs.len() == ys.len() && xs.iter().all(|l| ys.iter().any(|r| py_eq(l, r, heap, interner)))
            }
            (HeapData::Dict(xs), HeapData::Dict(ys)) => {
                xs.len() == ys.len()
                    && xs.iter().all(|(k, v)| {
                        ys.iter()
                            .any(|(k2, v2)| py_eq(k, k2, heap, interner) && py_eq(v, v2, heap, interner))
                    })
            }
            _ => false,
        },
        _ => false,
    }
}

/// Language-level ordering for `<`/`<=`/`>`/`>=`.
pub fn py_cmp(a: &Value, b: &Value, heap: &Heap, interner: &Interner) -> Option<Ordering> {
    if let (Some(x), Some(y)) = (a.as_number(), b.as_number()) {
        return x.partial_cmp(&y);
    }
    if let (Some(x), Some(y)) = (a.str_contents(heap, interner), b.str_contents(heap, interner)) {
        return x.partial_cmp(y);
    }
    if let (Value::Ref(x), Value::Ref(y)) = (a, b) {
        if let (HeapData::List(xs), HeapData::List(ys)) | (HeapData::Tuple(xs), HeapData::Tuple(ys)) =
            (heap.get(*x), heap.get(*y))
        {
            for (l, r) in xs.iter().zip(ys.iter()) {
                match py_cmp(l, r, heap, interner)? {
                    Ordering::Equal => continue,
                    other => return Some(other),
                }
            }
            return Some(xs.len().cmp(&ys.len()));
        }
    }
    None
}

/// Identity: same inline value or same arena slot.
pub fn py_is(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Ref(x), Value::Ref(y)) => x == y,
        (Value::None, Value::None) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Int(x), Value::Int(y)) => x == y,
        (Value::InternStr(x), Value::InternStr(y)) => x == y,
        (Value::Function(x), Value::Function(y)) => x == y,
        (Value::Class(x), Value::Class(y)) => x == y,
        (Value::Builtin(x), Value::Builtin(y)) => x == y,
        _ => false,
    }
}

/// Structural clone into fresh arena slots.
pub fn deep_copy(value: &Value, heap: &mut Heap) -> Value {
    let Value::Ref(id) = value else {
        return *value;
    };
    let data = heap.get(*id).clone();
    let copied = match data {
        HeapData::Str(s) => HeapData::Str(s),
        HeapData::List(items) => HeapData::List(copy_all(&items, heap)),
        HeapData::Tuple(items) => HeapData::Tuple(copy_all(&items, heap)),
        HeapData::Set(items) => HeapData::Set(copy_all(&items, heap)),
        HeapData::Dict(pairs) => HeapData::Dict(
            pairs
                .iter()
                .map(|(k, v)| (deep_copy(k, heap), deep_copy(v, heap)))
                .collect(),
        ),
        HeapData::Instance { class, attrs } => HeapData::Instance {
            class,
            attrs: attrs
                .iter()
                .map(|(name, v)| (*name, deep_copy(v, heap)))
                .collect(),
        },
        other => other,
    };
    Value::Ref(heap.allocate(copied))
}

fn copy_all(items: &[Value], heap: &mut Heap) -> Vec<Value> {
    items.iter().map(|v| deep_copy(v, heap)).collect()
}

// ---------------------------------------------------------------------------
// Typed accessors
// ---------------------------------------------------------------------------

thread_local! {
    /// Last failed typed extraction: (requested, actual).
    static CAST_ERROR: Cell<Option<(RtType, RtType)>> = const { Cell::new(None) };
}

/// Whether a typed accessor has failed since the last [`take_cast_error`].
pub fn has_cast_error() -> bool {
    CAST_ERROR.with(|c| c.get().is_some())
}

/// Clears and returns the last failed extraction.
pub fn take_cast_error() -> Option<(RtType, RtType)> {
    CAST_ERROR.with(|c| c.take())
}

fn record_cast_error(requested: RtType, actual: RtType) {
    CAST_ERROR.with(|c| c.set(Some((requested, actual))));
}

/// Types extractable from a [`Value`].
///
/// Compatible numeric casts succeed; a genuine mismatch records the error
/// pair and the accessor returns the type's zero value.
pub trait ValueCast: Sized + Default {
    const REQUESTED: RtType;
    fn extract(value: &Value, heap: &Heap, interner: &Interner) -> Option<Self>;
}

impl ValueCast for i64 {
    const REQUESTED: RtType = RtType::Int;
    fn extract(value: &Value, _heap: &Heap, _interner: &Interner) -> Option<Self> {
        match value {
            Value::Bool(b) => Some(i64::from(*b)),
            Value::Int(v) => Some(*v),
            Value::F32(v) => Some(*v as i64),
            Value::F64(v) => Some(*v as i64),
            _ => None,
        }
    }
}

impl ValueCast for i32 {
    const REQUESTED: RtType = RtType::Int;
    fn extract(value: &Value, heap: &Heap, interner: &Interner) -> Option<Self> {
        i64::extract(value, heap, interner).map(|v| v as i32)
    }
}

impl ValueCast for f64 {
    const REQUESTED: RtType = RtType::F64;
    fn extract(value: &Value, _heap: &Heap, _interner: &Interner) -> Option<Self> {
        value.as_number()
    }
}

impl ValueCast for f32 {
    const REQUESTED: RtType = RtType::F32;
    fn extract(value: &Value, _heap: &Heap, _interner: &Interner) -> Option<Self> {
        value.as_number().map(|v| v as f32)
    }
}

impl ValueCast for bool {
    const REQUESTED: RtType = RtType::Bool;
    fn extract(value: &Value, _heap: &Heap, _interner: &Interner) -> Option<Self> {
        match value {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl ValueCast for String {
    const REQUESTED: RtType = RtType::Str;
    fn extract(value: &Value, heap: &Heap, interner: &Interner) -> Option<Self> {
        value.str_contents(heap, interner).map(str::to_owned)
    }
}

impl Value {
    /// Typed extraction returning a copy.
    ///
    /// Mismatches are non-throwing: the error slot is set and the zero
    /// value returned; callers check [`has_cast_error`].
    pub fn as_cast<T: ValueCast>(&self, heap: &Heap, interner: &Interner) -> T {
        match T::extract(self, heap, interner) {
            Some(v) => v,
            None => {
                record_cast_error(T::REQUESTED, self.type_tag(heap));
                T::default()
            }
        }
    }

    /// Whether a typed extraction would succeed.
    pub fn is_valid<T: ValueCast>(&self, heap: &Heap, interner: &Interner) -> bool {
        T::extract(self, heap, interner).is_some()
    }
}

// ---------------------------------------------------------------------------
// Printing and the type-name registry
// ---------------------------------------------------------------------------

static TYPE_REGISTRY: OnceLock<Vec<(RtType, &'static str)>> = OnceLock::new();

/// Initializes process-wide shared state: the type-name registry.
///
/// Safe to call from multiple threads; initialization runs once.
pub fn register_globals() {
    TYPE_REGISTRY.get_or_init(|| {
        vec![
            (RtType::NoneType, "None"),
            (RtType::Bool, "bool"),
            (RtType::Int, "int"),
            (RtType::F32, "f32"),
            (RtType::F64, "f64"),
            (RtType::Str, "str"),
            (RtType::List, "list"),
            (RtType::Tuple, "tuple"),
            (RtType::Set, "set"),
            (RtType::Dict, "dict"),
            (RtType::Range, "range"),
            (RtType::Function, "function"),
            (RtType::Method, "method"),
            (RtType::Exception, "exception"),
            (RtType::Generator, "generator"),
            (RtType::Coroutine, "coroutine"),
        ]
    });
}

/// Registered display name for a type tag, when one exists.
pub fn registered_type_name(tag: RtType) -> Option<&'static str> {
    TYPE_REGISTRY
        .get()
        .and_then(|reg| reg.iter().find(|(t, _)| *t == tag).map(|&(_, name)| name))
}

/// Formats a float the way the language prints it: always with a decimal
/// point or exponent.
pub fn format_float(v: f64) -> String {
    if v.is_finite() && v.fract() == 0.0 && v.abs() < 1e16 {
        format!("{v:.1}")
    } else {
        format!("{v}")
    }
}

/// `str()` of a value: strings render bare, everything else as `repr`.
pub fn value_str(value: &Value, heap: &Heap, interner: &Interner, module: &Module) -> String {
    if let Some(s) = value.str_contents(heap, interner) {
        return s.to_owned();
    }
    value_repr(value, heap, interner, module)
}

/// `repr()` of a value.
///
/// Printing dispatches on the registered type name; unregistered object
/// types print the class name and arena address.
pub fn value_repr(value: &Value, heap: &Heap, interner: &Interner, module: &Module) -> String {
    match value {
        Value::Undefined => "<undefined>".to_owned(),
        Value::None => "None".to_owned(),
        Value::Bool(true) => "True".to_owned(),
        Value::Bool(false) => "False".to_owned(),
        Value::Int(v) => v.to_string(),
        Value::F32(v) => format_float(f64::from(*v)),
        Value::F64(v) => format_float(*v),
        Value::InternStr(id) => format!("'{}'", interner.get(*id).replace('\\', "\\\\").replace('\'', "\\'")),
        Value::Builtin(b) => format!("<builtin {b}>"),
        Value::Function(id) => format!("<function {}>", interner.get(module.func(*id).name)),
        Value::Class(id) => format!("<class '{}'>", interner.get(module.class(*id).name)),
        Value::Ref(id) => match heap.get(*id) {
            HeapData::Str(s) => format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'")),
            HeapData::List(items) => {
                let inner: Vec<_> = items.iter().map(|v| value_repr(v, heap, interner, module)).collect();
                format!("[{}]", inner.join(", "))
            }
            HeapData::Tuple(items) => {
                let inner: Vec<_> = items.iter().map(|v| value_repr(v, heap, interner, module)).collect();
                if inner.len() == 1 {
                    format!("({},)", inner[0])
                } else {
                    format!("({})", inner.join(", "))
                }
            }
            HeapData::Set(items) => {
                if items.is_empty() {
                    "set()".to_owned()
                } else {
                    let inner: Vec<_> = items.iter().map(|v| value_repr(v, heap, interner, module)).collect();
                    format!("{{{}}}", inner.join(", "))
                }
            }
            HeapData::Dict(pairs) => {
                let inner: Vec<_> = pairs
                    .iter()
                    .map(|(k, v)| {
                        format!(
                            "{}: {}",
                            value_repr(k, heap, interner, module),
                            value_repr(v, heap, interner, module)
                        )
                    })
                    .collect();
                format!("{{{}}}", inner.join(", "))
            }
            HeapData::Range { start, stop, step } => {
                if *step == 1 {
                    format!("range({start}, {stop})")
                } else {
                    format!("range({start}, {stop}, {step})")
                }
            }
            HeapData::Closure { func, .. } => {
                format!("<function {}>", interner.get(module.func(*func).name))
            }
            HeapData::BoundMethod { func, .. } => {
                format!("<bound method {}>", interner.get(module.func(*func).name))
            }
            HeapData::Instance { class, .. } => {
                let name = interner.get(module.class(*class).name);
                format!("<{name} object at {:#x}>", id.address())
            }
            HeapData::Cell(inner) => format!("<cell: {}>", value_repr(inner, heap, interner, module)),
            HeapData::Exception(exc) => match (&exc.class, &exc.message) {
                (Some(class), Some(msg)) => {
                    format!("{}({msg:?})", interner.get(module.class(*class).name))
                }
                (Some(class), None) => format!("{}()", interner.get(module.class(*class).name)),
                (None, Some(msg)) => format!("{}({msg:?})", exc.kind),
                (None, None) => format!("{}()", exc.kind),
            },
            data => {
                let label = registered_type_name(value.type_tag(heap)).unwrap_or_else(|| data.type_label());
                format!("<{label} at {:#x}>", id.address())
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_compare_across_widths() {
        let heap = Heap::new();
        let interner = Interner::new();
        assert!(py_eq(&Value::Int(1), &Value::F64(1.0), &heap, &interner));
        assert!(py_eq(&Value::Bool(true), &Value::Int(1), &heap, &interner));
        assert!(!py_eq(&Value::Int(1), &Value::Int(2), &heap, &interner));
    }

    #[test]
    fn cast_mismatch_sets_the_error_slot() {
        let heap = Heap::new();
        let interner = Interner::new();
        take_cast_error();
        let v: i64 = Value::None.as_cast(&heap, &interner);
        assert_eq!(v, 0);
        assert!(has_cast_error());
        assert_eq!(take_cast_error(), Some((RtType::Int, RtType::NoneType)));
        assert!(!has_cast_error());
    }

    #[test]
    fn numeric_casts_between_compatible_types_succeed() {
        let heap = Heap::new();
        let interner = Interner::new();
        take_cast_error();
        let v: f64 = Value::Int(3).as_cast(&heap, &interner);
        assert_eq!(v, 3.0);
        assert!(!has_cast_error());
    }

    #[test]
    fn deep_copy_detaches_containers() {
        let mut heap = Heap::new();
        let interner = Interner::new();
        let list = Value::Ref(heap.allocate(HeapData::List(vec![Value::Int(1)])));
        let copy = deep_copy(&list, &mut heap);
        let Value::Ref(copy_id) = copy else { panic!() };
        if let HeapData::List(items) = heap.get_mut(copy_id) {
            items.push(Value::Int(2));
        }
        assert!(!py_eq(&list, &copy, &heap, &interner));
    }

    #[test]
    fn float_repr_keeps_the_decimal_point() {
        assert_eq!(format_float(1.0), "1.0");
        assert_eq!(format_float(2.5), "2.5");
    }
}
