//! String interning for identifiers, literals, and operator spellings.
//!
//! The interner stores unique strings in a vector and hands out dense
//! [`StringId`] indices. Equality and hashing on a `StringId` are integer
//! operations; the text is only needed for diagnostics and printing.
//!
//! Ids are laid out as follows:
//! * `0..count(StaticStr)` — well-known names pre-interned at construction,
//!   so `StaticStr::Main.id()` is a constant with no lookup.
//! * everything above — strings interned while lexing and parsing.

use ahash::AHashMap;
use strum::{EnumCount, IntoStaticStr, VariantArray};

/// Index into the interner's storage.
///
/// `u32` keeps tokens and AST nodes small; four billion unique strings is
/// more than any source file will produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, serde::Serialize, serde::Deserialize)]
pub struct StringId(u32);

impl StringId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Names known at compile time that never need a hash lookup to intern.
///
/// The discriminant of each variant is its `StringId`, which is why the
/// interner seeds these in declaration order before anything else.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoStaticStr, EnumCount, VariantArray)]
#[strum(serialize_all = "snake_case")]
pub enum StaticStr {
    #[strum(serialize = "")]
    Empty,
    #[strum(serialize = "<module>")]
    Module,
    #[strum(serialize = "<lambda>")]
    Lambda,
    #[strum(serialize = "<genexpr>")]
    Genexpr,
    Main,
    #[strum(serialize = "self")]
    SelfArg,
    Return,

    // Protocol hooks.
    #[strum(serialize = "__init__")]
    DunderInit,
    #[strum(serialize = "__enter__")]
    DunderEnter,
    #[strum(serialize = "__exit__")]
    DunderExit,
    #[strum(serialize = "__iter__")]
    DunderIter,
    #[strum(serialize = "__next__")]
    DunderNext,
    #[strum(serialize = "__call__")]
    DunderCall,
    #[strum(serialize = "__str__")]
    DunderStr,
    #[strum(serialize = "__repr__")]
    DunderRepr,
    #[strum(serialize = "__len__")]
    DunderLen,
    #[strum(serialize = "__getitem__")]
    DunderGetitem,
    #[strum(serialize = "__setitem__")]
    DunderSetitem,
    #[strum(serialize = "__contains__")]
    DunderContains,

    // Binary operator dunders, with reflected and in-place forms.
    #[strum(serialize = "__add__")]
    DunderAdd,
    #[strum(serialize = "__sub__")]
    DunderSub,
    #[strum(serialize = "__mul__")]
    DunderMul,
    #[strum(serialize = "__matmul__")]
    DunderMatmul,
    #[strum(serialize = "__truediv__")]
    DunderTruediv,
    #[strum(serialize = "__floordiv__")]
    DunderFloordiv,
    #[strum(serialize = "__mod__")]
    DunderMod,
    #[strum(serialize = "__pow__")]
    DunderPow,
    #[strum(serialize = "__lshift__")]
    DunderLshift,
    #[strum(serialize = "__rshift__")]
    DunderRshift,
    #[strum(serialize = "__or__")]
    DunderOr,
    #[strum(serialize = "__xor__")]
    DunderXor,
    #[strum(serialize = "__and__")]
    DunderAnd,
    #[strum(serialize = "__radd__")]
    DunderRadd,
    #[strum(serialize = "__rsub__")]
    DunderRsub,
    #[strum(serialize = "__rmul__")]
    DunderRmul,
    #[strum(serialize = "__rmatmul__")]
    DunderRmatmul,
    #[strum(serialize = "__rtruediv__")]
    DunderRtruediv,
    #[strum(serialize = "__rfloordiv__")]
    DunderRfloordiv,
    #[strum(serialize = "__rmod__")]
    DunderRmod,
    #[strum(serialize = "__rpow__")]
    DunderRpow,
    #[strum(serialize = "__rlshift__")]
    DunderRlshift,
    #[strum(serialize = "__rrshift__")]
    DunderRrshift,
    #[strum(serialize = "__ror__")]
    DunderRor,
    #[strum(serialize = "__rxor__")]
    DunderRxor,
    #[strum(serialize = "__rand__")]
    DunderRand,
    #[strum(serialize = "__iadd__")]
    DunderIadd,
    #[strum(serialize = "__isub__")]
    DunderIsub,
    #[strum(serialize = "__imul__")]
    DunderImul,
    #[strum(serialize = "__itruediv__")]
    DunderItruediv,
    #[strum(serialize = "__ifloordiv__")]
    DunderIfloordiv,
    #[strum(serialize = "__imod__")]
    DunderImod,
    #[strum(serialize = "__ipow__")]
    DunderIpow,

    // Unary and comparison dunders.
    #[strum(serialize = "__neg__")]
    DunderNeg,
    #[strum(serialize = "__pos__")]
    DunderPos,
    #[strum(serialize = "__invert__")]
    DunderInvert,
    #[strum(serialize = "__eq__")]
    DunderEq,
    #[strum(serialize = "__ne__")]
    DunderNe,
    #[strum(serialize = "__lt__")]
    DunderLt,
    #[strum(serialize = "__le__")]
    DunderLe,
    #[strum(serialize = "__gt__")]
    DunderGt,
    #[strum(serialize = "__ge__")]
    DunderGe,
}

impl StaticStr {
    /// The fixed id this static string was interned under.
    #[inline]
    pub fn id(self) -> StringId {
        StringId(self as u32)
    }

    /// The interned text.
    #[inline]
    pub fn as_str(self) -> &'static str {
        self.into()
    }
}

/// Append-only string storage with a reverse index for deduplication.
///
/// One interner lives per [`crate::run::Runner`]; the static prefix makes ids
/// for well-known names stable across interners.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Interner {
    strings: Vec<String>,
    #[serde(skip)]
    index: AHashMap<String, StringId>,
}

impl Default for Interner {
    fn default() -> Self {
        Self::new()
    }
}

impl Interner {
    pub fn new() -> Self {
        let mut interner = Self {
            strings: Vec::with_capacity(StaticStr::COUNT + 64),
            index: AHashMap::with_capacity(StaticStr::COUNT + 64),
        };
        for s in StaticStr::VARIANTS {
            let id = interner.push(s.as_str());
            debug_assert_eq!(id, s.id(), "static string interned out of order");
        }
        interner
    }

    /// Interns a string, returning the existing id when already present.
    pub fn intern(&mut self, text: &str) -> StringId {
        if let Some(&id) = self.index.get(text) {
            return id;
        }
        self.push(text)
    }

    fn push(&mut self, text: &str) -> StringId {
        let id = StringId(u32::try_from(self.strings.len()).expect("interner overflow"));
        self.strings.push(text.to_owned());
        self.index.insert(text.to_owned(), id);
        id
    }

    /// Returns the text behind an id.
    ///
    /// # Panics
    /// Panics when the id did not come from this interner.
    pub fn get(&self, id: StringId) -> &str {
        &self.strings[id.index()]
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }

    /// Rebuilds the reverse index after deserialization.
    ///
    /// `index` is skipped by serde since it duplicates `strings`.
    pub fn rebuild_index(&mut self) {
        self.index = self
            .strings
            .iter()
            .enumerate()
            .map(|(i, s)| (s.clone(), StringId(i as u32)))
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_ids_are_stable() {
        let interner = Interner::new();
        assert_eq!(interner.get(StaticStr::Main.id()), "main");
        assert_eq!(interner.get(StaticStr::DunderInit.id()), "__init__");
        assert_eq!(interner.get(StaticStr::DunderRadd.id()), "__radd__");
    }

    #[test]
    fn intern_deduplicates() {
        let mut interner = Interner::new();
        let a = interner.intern("spam");
        let b = interner.intern("spam");
        let c = interner.intern("eggs");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(interner.get(c), "eggs");
    }

    #[test]
    fn known_names_hit_the_static_prefix() {
        let mut interner = Interner::new();
        assert_eq!(interner.intern("self"), StaticStr::SelfArg.id());
        assert_eq!(interner.intern("__add__"), StaticStr::DunderAdd.id());
    }
}
