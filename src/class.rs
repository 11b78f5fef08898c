//! Native class registration and instance wrapping.
//!
//! A native type becomes script-visible by implementing [`ScriptClass`]
//! and, usually, registering a constructor and members through
//! [`ClassBuilder`](crate::ClassBuilder). The runtime's registry assigns
//! one stable [`ClassId`] per Rust type; registering the same type twice
//! yields the same identifier. Instances live on the script heap as
//! `Rc<RefCell<T>>`, so unwrapping hands out shared handles and borrow
//! conflicts surface as errors rather than aborts.

use std::any::{Any, TypeId};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

use rustc_hash::FxHashMap;

use crate::context::Context;
use crate::convert::{FromScript, IntoScript};
use crate::engine::heap::Tracer;
use crate::engine::object::{NativeCell, ObjectData, ObjectKind, RawValue, SlotId};
use crate::error::{ConversionError, Exception, NativeError, ScriptResult};
use crate::value::{Value, WeakValue};

/// Runtime-wide identifier of a registered class.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ClassId(pub(crate) u32);

/// Who owns a wrapped instance.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ClassKind {
    /// The script heap owns the instance; it drops when its wrapper is
    /// swept. Constructible from script.
    Managed,
    /// The host owns the instance; sweeping drops only the engine's
    /// handle. Script-side construction is an error.
    Unmanaged,
}

/// A native type exposed to script.
///
/// `trace` must visit every [`Traced`](crate::Traced) cell the instance
/// owns, or collection may free values the instance still uses. Instances
/// that hold no script values can keep the default no-op.
pub trait ScriptClass: 'static {
    /// Script-visible class name.
    const NAME: &'static str;

    const KIND: ClassKind = ClassKind::Managed;

    /// Enumerate owned script values for the collector. Skipped while the
    /// instance is exclusively borrowed, so do not hold borrows across
    /// forced collections.
    fn trace(&self, _tracer: &mut Tracer<'_>) {}

    /// Expose the slot for the back-reference to the wrapping script
    /// object. When present, unwrapping a managed instance records its
    /// wrapper here.
    fn this_slot(&mut self) -> Option<&mut WeakValue> {
        None
    }
}

// ============================================================================
// Registry
// ============================================================================

struct ClassDef {
    name: &'static str,
    kind: ClassKind,
    /// The class prototype, once a builder installed one.
    proto: Cell<Option<SlotId>>,
    trace: fn(&Rc<dyn Any>, &mut Tracer<'_>),
}

/// Type-keyed class table owned by the runtime.
#[derive(Default)]
pub(crate) struct ClassRegistry {
    inner: RefCell<RegistryState>,
}

#[derive(Default)]
struct RegistryState {
    by_type: FxHashMap<TypeId, ClassId>,
    defs: Vec<ClassDef>,
}

fn trace_thunk<T: ScriptClass>(instance: &Rc<dyn Any>, tracer: &mut Tracer<'_>) {
    if let Some(cell) = instance.downcast_ref::<RefCell<T>>() {
        if let Ok(inner) = cell.try_borrow() {
            inner.trace(tracer);
        }
    }
}

impl ClassRegistry {
    /// The id for `T`, registering it on first sight. Stable per runtime.
    pub(crate) fn ensure<T: ScriptClass>(&self) -> ClassId {
        let type_id = TypeId::of::<T>();
        let mut state = self.inner.borrow_mut();
        if let Some(id) = state.by_type.get(&type_id) {
            return *id;
        }
        let id = ClassId(state.defs.len() as u32);
        state.defs.push(ClassDef {
            name: T::NAME,
            kind: T::KIND,
            proto: Cell::new(None),
            trace: trace_thunk::<T>,
        });
        state.by_type.insert(type_id, id);
        id
    }

    pub(crate) fn class_name(&self, id: ClassId) -> &'static str {
        self.inner
            .borrow()
            .defs
            .get(id.0 as usize)
            .map(|def| def.name)
            .unwrap_or("Object")
    }

    pub(crate) fn kind(&self, id: ClassId) -> ClassKind {
        self.inner
            .borrow()
            .defs
            .get(id.0 as usize)
            .map(|def| def.kind)
            .unwrap_or(ClassKind::Managed)
    }

    pub(crate) fn proto(&self, id: ClassId) -> Option<SlotId> {
        self.inner
            .borrow()
            .defs
            .get(id.0 as usize)
            .and_then(|def| def.proto.get())
    }

    pub(crate) fn set_proto(&self, id: ClassId, proto: SlotId) {
        if let Some(def) = self.inner.borrow().defs.get(id.0 as usize) {
            def.proto.set(Some(proto));
        }
    }

    /// Trace one wrapped instance through its class trace hook.
    pub(crate) fn trace_instance(&self, cell: &NativeCell, tracer: &mut Tracer<'_>) {
        let thunk = self
            .inner
            .borrow()
            .defs
            .get(cell.class_id.0 as usize)
            .map(|def| def.trace);
        if let Some(thunk) = thunk {
            thunk(&cell.instance, tracer);
        }
    }

    /// Feed registry-held values (class prototypes) to the collector.
    pub(crate) fn trace_into(&self, push: &mut dyn FnMut(RawValue)) {
        for def in &self.inner.borrow().defs {
            if let Some(proto) = def.proto.get() {
                push(RawValue::Handle(proto));
            }
        }
    }
}

// ============================================================================
// Wrapping and unwrapping
// ============================================================================

/// Attach an instance to a fresh script object of its registered class.
pub(crate) fn wrap_instance<T: ScriptClass>(ctx: &Context, instance: Rc<RefCell<T>>) -> Value {
    let class_id = ctx.inner.rt.classes.ensure::<T>();
    let proto = ctx.inner.rt.classes.proto(class_id);
    let cell = NativeCell {
        class_id,
        instance,
    };
    let id = ctx.inner.rt.heap.alloc_object(ObjectData::native(proto, cell));
    Value::from_raw(ctx, RawValue::Handle(id))
}

fn lookup_native<T: ScriptClass>(value: &Value) -> Option<Rc<RefCell<T>>> {
    let ctx = value.context();
    let expected = ctx.inner.rt.classes.ensure::<T>();
    let RawValue::Handle(id) = value.raw() else {
        return None;
    };
    let found = ctx.inner.rt.heap.with_object(id, |data| match &data.kind {
        ObjectKind::Native(cell) if cell.class_id == expected => Some(cell.instance.clone()),
        _ => None,
    })??;
    found.downcast::<RefCell<T>>().ok()
}

/// Record the wrapper on a managed instance, if it exposes the slot and
/// is not currently borrowed.
fn record_back_reference<T: ScriptClass>(value: &Value, rc: &Rc<RefCell<T>>) {
    if !matches!(T::KIND, ClassKind::Managed) {
        return;
    }
    if let Ok(mut inner) = rc.try_borrow_mut() {
        if let Some(slot) = inner.this_slot() {
            *slot = value.downgrade();
        }
    }
}

/// Unwrap a shared handle, failing with a type error when the value is
/// not an instance of `T`.
pub(crate) fn instance_of<T: ScriptClass>(value: &Value) -> ScriptResult<Rc<RefCell<T>>> {
    match lookup_native::<T>(value) {
        Some(rc) => {
            record_back_reference(value, &rc);
            Ok(rc)
        }
        None => Err(Exception::conversion(
            value.context(),
            ConversionError::TypeMismatch {
                expected: T::NAME,
                actual: value.type_name(),
            },
        )),
    }
}

/// Unwrap `this` for a method call. Same mechanics as [`instance_of`],
/// but the failure names the receiver.
pub(crate) fn this_instance<T: ScriptClass>(this: &Value) -> ScriptResult<Rc<RefCell<T>>> {
    match lookup_native::<T>(this) {
        Some(rc) => {
            record_back_reference(this, &rc);
            Ok(rc)
        }
        None => Err(Exception::native(
            this.context(),
            NativeError::ThisTypeMismatch {
                expected: T::NAME,
                actual: this.type_name(),
            },
        )),
    }
}

impl<T: ScriptClass> FromScript for Rc<RefCell<T>> {
    fn from_script(value: &Value) -> ScriptResult<Self> {
        instance_of::<T>(value)
    }
}

impl<T: ScriptClass> IntoScript for Rc<RefCell<T>> {
    fn into_script(self, ctx: &Context) -> Value {
        wrap_instance(ctx, self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Runtime;

    struct Point {
        x: i32,
    }

    impl ScriptClass for Point {
        const NAME: &'static str = "Point";
    }

    #[derive(Debug)]
    struct Anchor;

    impl ScriptClass for Anchor {
        const NAME: &'static str = "Anchor";
        const KIND: ClassKind = ClassKind::Unmanaged;
    }

    #[test]
    fn class_ids_are_stable_per_type() {
        let registry = ClassRegistry::default();
        let first = registry.ensure::<Point>();
        let second = registry.ensure::<Point>();
        let other = registry.ensure::<Anchor>();
        assert_eq!(first, second);
        assert_ne!(first, other);
        assert_eq!(registry.class_name(first), "Point");
        assert_eq!(registry.kind(other), ClassKind::Unmanaged);
    }

    #[test]
    fn wrap_then_unwrap_returns_the_same_instance() {
        let ctx = Context::new(&Runtime::new());
        let wrapped = Value::from_instance(&ctx, Point { x: 7 });
        assert_eq!(wrapped.type_name(), "Point");

        let handle = wrapped.instance::<Point>().unwrap();
        assert_eq!(handle.borrow().x, 7);
        handle.borrow_mut().x = 8;

        let again = wrapped.instance::<Point>().unwrap();
        assert_eq!(again.borrow().x, 8);
    }

    #[test]
    fn unwrap_checks_the_class_id() {
        let ctx = Context::new(&Runtime::new());
        let wrapped = Value::from_instance(&ctx, Point { x: 1 });
        let err = wrapped.instance::<Anchor>().unwrap_err();
        assert!(err.message().contains("expected Anchor, got Point"));

        let not_native = Value::of(&ctx, 3);
        assert!(not_native.instance::<Point>().is_err());
    }

    #[test]
    fn unmanaged_instances_survive_their_wrapper() {
        let ctx = Context::new(&Runtime::new());
        let host_owned = Rc::new(RefCell::new(Anchor));
        let wrapped = Value::of(&ctx, host_owned.clone());
        assert_eq!(wrapped.type_name(), "Anchor");
        drop(wrapped);
        ctx.runtime().collect();
        assert_eq!(Rc::strong_count(&host_owned), 1);
    }
}
