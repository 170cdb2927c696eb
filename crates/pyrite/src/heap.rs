//! The runtime arena for compound values.
//!
//! Lists, dicts, instances, and everything else with identity live here;
//! a [`Value::Ref`](crate::value::Value::Ref) is a dense index into the
//! arena. Slots are never recycled during a run — the whole arena is
//! released when the run's evaluator is dropped, which is the scope-based
//! release the resource model asks for. Copying a `Ref` aliases the object,
//! which is exactly the language's reference semantics for mutable values.

use crate::ast::{ClassId, FuncId};
use crate::exc::ExcValue;
use crate::intern::StringId;
use crate::value::Value;

/// Index of an object in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct HeapId(u32);

impl HeapId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Stable address used when printing unregistered objects.
    pub fn address(self) -> usize {
        0x1000 + self.0 as usize * 0x10
    }
}

/// State of a generator object.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum GenState {
    /// Captured call, body not yet entered.
    Pending {
        func: FuncId,
        captured: Vec<Value>,
        args: Vec<Value>,
    },
    /// Body ran; values buffered at the first resumption, drained by
    /// subsequent ones.
    Ready { items: Vec<Value>, cursor: usize },
}

/// A compound runtime object.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum HeapData {
    Str(String),
    List(Vec<Value>),
    Tuple(Vec<Value>),
    Set(Vec<Value>),
    /// Insertion-ordered association list; key equality is the language's
    /// `==`.
    Dict(Vec<(Value, Value)>),
    Range {
        start: i64,
        stop: i64,
        step: i64,
    },
    /// A function plus its captured environment snapshot.
    Closure {
        func: FuncId,
        captured: Vec<Value>,
    },
    /// A method extracted from an instance, carrying its receiver.
    BoundMethod {
        recv: Value,
        func: FuncId,
    },
    /// A class instance: class id plus attribute array in declaration order.
    Instance {
        class: ClassId,
        attrs: Vec<(StringId, Value)>,
    },
    /// Shared mutable storage for `nonlocal` variables.
    Cell(Value),
    Exception(ExcValue),
    Generator(GenState),
    /// A called `async def`, run to completion when awaited.
    Coroutine {
        func: FuncId,
        captured: Vec<Value>,
        args: Vec<Value>,
        done: bool,
    },
    /// Iteration cursor over a sequence value.
    Iter {
        inner: Value,
        index: usize,
    },
}

impl HeapData {
    /// The variant name, used by value printing for unregistered types.
    pub fn type_label(&self) -> &'static str {
        match self {
            Self::Str(_) => "str",
            Self::List(_) => "list",
            Self::Tuple(_) => "tuple",
            Self::Set(_) => "set",
            Self::Dict(_) => "dict",
            Self::Range { .. } => "range",
            Self::Closure { .. } => "function",
            Self::BoundMethod { .. } => "method",
            Self::Instance { .. } => "object",
            Self::Cell(_) => "cell",
            Self::Exception(_) => "exception",
            Self::Generator(_) => "generator",
            Self::Coroutine { .. } => "coroutine",
            Self::Iter { .. } => "iterator",
        }
    }
}

/// The arena.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct Heap {
    slots: Vec<HeapData>,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&mut self, data: HeapData) -> HeapId {
        let id = HeapId(u32::try_from(self.slots.len()).expect("heap overflow"));
        self.slots.push(data);
        id
    }

    pub fn get(&self, id: HeapId) -> &HeapData {
        &self.slots[id.index()]
    }

    pub fn get_mut(&mut self, id: HeapId) -> &mut HeapData {
        &mut self.slots[id.index()]
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Allocates a string, the most common compound value.
    pub fn alloc_str(&mut self, s: impl Into<String>) -> HeapId {
        self.allocate(HeapData::Str(s.into()))
    }
}
