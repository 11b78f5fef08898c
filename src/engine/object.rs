//! Heap cell layout.
//!
//! Everything scripts can reference lives in a heap cell: strings, plain
//! objects, arrays, functions, promises, and wrapped native instances.
//! Cells refer to each other through untagged [`SlotId`]s; rooting and
//! liveness are the heap's concern.

use std::any::Any;
use std::rc::Rc;

use rustc_hash::FxHashMap;

use crate::class::ClassId;
use crate::context::Context;
use crate::engine::ast::FuncDef;
use crate::engine::interp::Env;
use crate::engine::modules::ModuleId;
use crate::error::ScriptResult;
use crate::value::Value;

/// Index of a heap slot.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub(crate) struct SlotId {
    pub index: u32,
}

/// An engine value: either an immediate, or a handle into the heap.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum RawValue {
    Undefined,
    /// Distinct from `Undefined`; produced by uninitialized bindings.
    Uninitialized,
    Null,
    Bool(bool),
    Int(i32),
    Float(f64),
    Handle(SlotId),
}

impl RawValue {
    #[inline]
    pub fn is_nullish(&self) -> bool {
        matches!(
            self,
            RawValue::Undefined | RawValue::Uninitialized | RawValue::Null
        )
    }
}

impl Default for RawValue {
    fn default() -> Self {
        RawValue::Undefined
    }
}

/// A property on an object: either plain data or a get/set pair.
pub(crate) enum PropSlot {
    Data(RawValue),
    Accessor {
        getter: RawValue,
        setter: Option<RawValue>,
    },
}

/// Signature of every native function the engine can call.
pub(crate) type NativeFunc = Rc<dyn Fn(&Context, &Value, &[Value]) -> ScriptResult<Value>>;

/// A heap cell.
pub(crate) enum HeapCell {
    Str(Rc<str>),
    Object(ObjectData),
}

/// Shared layout of every script object.
pub(crate) struct ObjectData {
    pub proto: Option<SlotId>,
    pub props: FxHashMap<String, PropSlot>,
    pub kind: ObjectKind,
}

impl ObjectData {
    pub fn plain() -> Self {
        Self {
            proto: None,
            props: FxHashMap::default(),
            kind: ObjectKind::Plain,
        }
    }

    pub fn with_proto(proto: Option<SlotId>) -> Self {
        Self {
            proto,
            props: FxHashMap::default(),
            kind: ObjectKind::Plain,
        }
    }

    pub fn array(elements: Vec<RawValue>) -> Self {
        Self {
            proto: None,
            props: FxHashMap::default(),
            kind: ObjectKind::Array(elements),
        }
    }

    pub fn function(name: impl Into<String>, kind: FuncKind) -> Self {
        Self {
            proto: None,
            props: FxHashMap::default(),
            kind: ObjectKind::Function(FuncData {
                name: name.into(),
                kind,
            }),
        }
    }

    pub fn native(proto: Option<SlotId>, cell: NativeCell) -> Self {
        Self {
            proto,
            props: FxHashMap::default(),
            kind: ObjectKind::Native(cell),
        }
    }

    pub fn promise(proto: Option<SlotId>) -> Self {
        Self {
            proto,
            props: FxHashMap::default(),
            kind: ObjectKind::Promise(PromiseData {
                state: PromiseState::Pending,
                result: RawValue::Undefined,
                reactions: Vec::new(),
            }),
        }
    }
}

pub(crate) enum ObjectKind {
    Plain,
    Array(Vec<RawValue>),
    Function(FuncData),
    Native(NativeCell),
    Promise(PromiseData),
}

pub(crate) struct FuncData {
    pub name: String,
    pub kind: FuncKind,
}

pub(crate) enum FuncKind {
    /// A closure over a parsed function definition.
    Script {
        def: Rc<FuncDef>,
        env: Rc<Env>,
        module: Option<ModuleId>,
    },
    /// Host-provided behavior. `call` handles plain invocation, `construct`
    /// handles `new`; an absent entry makes the corresponding form a type
    /// error.
    Native {
        call: Option<NativeFunc>,
        construct: Option<NativeFunc>,
    },
}

/// A wrapped native instance.
pub(crate) struct NativeCell {
    pub class_id: ClassId,
    /// Concretely an `Rc<RefCell<T>>` for the registered class `T`.
    pub instance: Rc<dyn Any>,
}

/// Settlement state of a promise.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PromiseState {
    Pending,
    Fulfilled,
    Rejected,
}

pub(crate) struct PromiseData {
    pub state: PromiseState,
    pub result: RawValue,
    pub reactions: Vec<Reaction>,
}

/// A `then` registration waiting for its promise to settle.
pub(crate) struct Reaction {
    pub on_fulfilled: RawValue,
    pub on_rejected: RawValue,
    /// The promise the reaction settles once its handler ran.
    pub derived: SlotId,
}
