//! The live symbol table: a flat vector with scope watermarks.
//!
//! Both sema and the evaluator drive one of these. Entering a scope records
//! the current length; leaving truncates back to it, dropping every entry
//! introduced inside. A varid is an index into this vector — absolute for
//! module-level names, frame-relative for function locals.

use strum::VariantArray;

use crate::exc::ExcKind;
use crate::intern::{Interner, StringId};
use crate::types::{Builtin, BuiltinFn, Ty, TyPrim};
use crate::value::Value;

/// One entry: name, current value, and inferred type.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Binding {
    pub name: StringId,
    pub value: Value,
    pub ty: Ty,
}

/// The flat binding vector.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct Bindings {
    entries: Vec<Binding>,
    scopes: Vec<usize>,
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a scope boundary and returns its watermark.
    pub fn enter_scope(&mut self) -> usize {
        let mark = self.entries.len();
        self.scopes.push(mark);
        mark
    }

    /// Truncates back to the most recent watermark.
    ///
    /// # Panics
    /// Panics when no scope is open.
    pub fn leave_scope(&mut self) {
        let mark = self.scopes.pop().expect("leave_scope without enter_scope");
        self.entries.truncate(mark);
    }

    /// The current length, used as a frame base by the evaluator.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Truncates to an explicit watermark, for frames that outlive a single
    /// lexical scope (function calls unwound by exceptions).
    pub fn truncate_to(&mut self, mark: usize) {
        self.entries.truncate(mark);
    }

    /// Appends a binding and returns its index.
    pub fn add(&mut self, name: StringId, value: Value, ty: Ty) -> usize {
        let index = self.entries.len();
        self.entries.push(Binding { name, value, ty });
        index
    }

    /// Searches backward through the live prefix for the nearest binding of
    /// `name`.
    pub fn lookup(&self, name: StringId) -> Option<usize> {
        self.entries.iter().rposition(|b| b.name == name)
    }

    pub fn get(&self, index: usize) -> &Binding {
        &self.entries[index]
    }

    pub fn get_mut(&mut self, index: usize) -> &mut Binding {
        &mut self.entries[index]
    }

    pub fn set_value(&mut self, index: usize, value: Value) {
        self.entries[index].value = value;
    }

    pub fn set_type(&mut self, index: usize, ty: Ty) {
        self.entries[index].ty = ty;
    }

    /// Number of open scopes.
    pub fn depth(&self) -> usize {
        self.scopes.len()
    }
}

/// Seeds builtin values without touching the interner.
///
/// The evaluator uses this: varids line up with [`seed_builtins`] because
/// both iterate the same variant arrays, and binding names are only needed
/// for sema-time lookup.
pub fn seed_builtin_values(bindings: &mut Bindings) {
    use crate::intern::StaticStr;
    for prim in TyPrim::VARIANTS {
        bindings.add(
            StaticStr::Empty.id(),
            Value::Builtin(Builtin::Type(*prim)),
            Ty::Type(Box::new(prim.as_ty())),
        );
    }
    for f in BuiltinFn::VARIANTS {
        bindings.add(StaticStr::Empty.id(), Value::Builtin(Builtin::Fn(*f)), Ty::Unknown);
    }
    for exc in ExcKind::VARIANTS {
        bindings.add(
            StaticStr::Empty.id(),
            Value::Builtin(Builtin::Exc(*exc)),
            Ty::Type(Box::new(Ty::Exc(*exc))),
        );
    }
}

/// Seeds the builtin names into a fresh binding vector.
///
/// Sema and the evaluator both call this before touching module code, so a
/// builtin's varid is identical in both passes.
pub fn seed_builtins(bindings: &mut Bindings, interner: &mut Interner) {
    for prim in TyPrim::VARIANTS {
        let name = interner.intern(prim.into());
        bindings.add(
            name,
            Value::Builtin(Builtin::Type(*prim)),
            Ty::Type(Box::new(prim.as_ty())),
        );
    }
    for f in BuiltinFn::VARIANTS {
        let name = interner.intern((*f).into());
        bindings.add(name, Value::Builtin(Builtin::Fn(*f)), Ty::Unknown);
    }
    for exc in ExcKind::VARIANTS {
        let name = interner.intern((*exc).into());
        bindings.add(name, Value::Builtin(Builtin::Exc(*exc)), Ty::Type(Box::new(Ty::Exc(*exc))));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intern::Interner;

    #[test]
    fn scope_exit_truncates_to_watermark() {
        let mut interner = Interner::new();
        let a = interner.intern("a");
        let b = interner.intern("b");

        let mut bindings = Bindings::new();
        bindings.add(a, Value::Int(1), Ty::I64);
        let before = bindings.len();

        bindings.enter_scope();
        bindings.add(b, Value::Int(2), Ty::I64);
        assert_eq!(bindings.lookup(b), Some(1));
        bindings.leave_scope();

        assert_eq!(bindings.len(), before);
        assert_eq!(bindings.lookup(b), None);
        assert_eq!(bindings.lookup(a), Some(0));
    }

    #[test]
    fn lookup_finds_the_nearest_shadowing_binding() {
        let mut interner = Interner::new();
        let x = interner.intern("x");

        let mut bindings = Bindings::new();
        bindings.add(x, Value::Int(1), Ty::I64);
        bindings.enter_scope();
        bindings.add(x, Value::Int(2), Ty::I64);
        assert_eq!(bindings.lookup(x), Some(1));
        bindings.leave_scope();
        assert_eq!(bindings.lookup(x), Some(0));
    }
}
