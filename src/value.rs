//! Rooted script values.
//!
//! [`Value`] is the host's handle to anything a script can see. Heap-backed
//! values count as collection roots for as long as the handle is alive;
//! cloning and dropping adjust the root count. [`WeakValue`] is the
//! non-rooting variant that observes collection instead of preventing it.
//!
//! # Example
//!
//! ```ignore
//! let runtime = Runtime::new();
//! let ctx = Context::new(&runtime);
//! let value = Value::of(&ctx, 42);
//! assert_eq!(value.to_native::<i64>()?, 42);
//! ```

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::class::{self, ScriptClass};
use crate::context::Context;
use crate::convert::{FromScript, IntoScript};
use crate::engine::interp;
use crate::engine::object::{FuncKind, HeapCell, ObjectData, ObjectKind, PromiseState, RawValue};
use crate::error::{Exception, NativeError, ScriptResult};
use crate::function::ScriptFn;

/// A property key: a name or an array index.
#[derive(Clone, Copy, Debug)]
pub enum PropKey<'a> {
    Name(&'a str),
    Index(u32),
}

impl<'a> From<&'a str> for PropKey<'a> {
    fn from(name: &'a str) -> Self {
        PropKey::Name(name)
    }
}

impl From<u32> for PropKey<'_> {
    fn from(index: u32) -> Self {
        PropKey::Index(index)
    }
}

impl From<usize> for PropKey<'_> {
    fn from(index: usize) -> Self {
        PropKey::Index(index.min(u32::MAX as usize) as u32)
    }
}

/// A rooted handle to a script value.
///
/// The handle keeps its target alive across garbage collection and stays
/// bound to the context that produced it. Equality of handles is identity
/// for objects and content for primitives, see [`Value::strict_equals`].
pub struct Value {
    pub(crate) ctx: Context,
    pub(crate) raw: RawValue,
}

impl Value {
    // ========================================================================
    // Construction
    // ========================================================================

    pub(crate) fn from_raw(ctx: &Context, raw: RawValue) -> Self {
        if let RawValue::Handle(id) = raw {
            ctx.inner.rt.heap.inc_root(id);
        }
        Self {
            ctx: ctx.clone(),
            raw,
        }
    }

    /// The `undefined` value.
    pub fn undefined(ctx: &Context) -> Self {
        Self::from_raw(ctx, RawValue::Undefined)
    }

    /// The `null` value.
    pub fn null(ctx: &Context) -> Self {
        Self::from_raw(ctx, RawValue::Null)
    }

    /// The uninitialized sentinel. Scripts never observe it directly; it
    /// converts like `undefined`.
    pub fn uninitialized(ctx: &Context) -> Self {
        Self::from_raw(ctx, RawValue::Uninitialized)
    }

    /// Convert a native value into a script value.
    pub fn of<T: IntoScript>(ctx: &Context, value: T) -> Self {
        value.into_script(ctx)
    }

    /// Create an empty plain object.
    pub fn object(ctx: &Context) -> Self {
        let id = ctx.inner.rt.heap.alloc_object(ObjectData::plain());
        Self::from_raw(ctx, RawValue::Handle(id))
    }

    /// Create an empty array.
    pub fn array(ctx: &Context) -> Self {
        let id = ctx.inner.rt.heap.alloc_object(ObjectData::array(Vec::new()));
        Self::from_raw(ctx, RawValue::Handle(id))
    }

    /// Wrap a native instance by value, transferring ownership to the
    /// script heap.
    pub fn from_instance<T: ScriptClass>(ctx: &Context, instance: T) -> Self {
        class::wrap_instance(ctx, Rc::new(RefCell::new(instance)))
    }

    /// Expose a typed native function.
    ///
    /// Arguments convert on entry; missing arguments convert from
    /// `undefined` and extras are ignored. The return value converts on
    /// exit. Values captured by the closure stay rooted for the function's
    /// lifetime; a captured `Value` also keeps its context alive, so prefer
    /// taking arguments or a [`Traced`](crate::Traced) cell for references
    /// back into the heap.
    pub fn function<F, A, R>(ctx: &Context, name: &str, f: F) -> Self
    where
        F: ScriptFn<A, R>,
    {
        alloc_native_function(ctx, name, Some(crate::function::typed_native(f)), None)
    }

    /// Expose a native function that works on raw values: it receives the
    /// call's `this` and arguments unconverted and may raise exceptions.
    pub fn raw_function<F>(ctx: &Context, name: &str, f: F) -> Self
    where
        F: Fn(&Context, &Value, &[Value]) -> ScriptResult<Value> + 'static,
    {
        alloc_native_function(ctx, name, Some(Rc::new(f)), None)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// The owning context.
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    #[inline]
    pub(crate) fn raw(&self) -> RawValue {
        self.raw
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self.raw, RawValue::Undefined)
    }

    pub fn is_uninitialized(&self) -> bool {
        matches!(self.raw, RawValue::Uninitialized)
    }

    pub fn is_null(&self) -> bool {
        matches!(self.raw, RawValue::Null)
    }

    /// `undefined`, uninitialized, or `null`.
    pub fn is_nullish(&self) -> bool {
        self.raw.is_nullish()
    }

    pub fn is_bool(&self) -> bool {
        matches!(self.raw, RawValue::Bool(_))
    }

    /// Number with the integer tag.
    pub fn is_int(&self) -> bool {
        matches!(self.raw, RawValue::Int(_))
    }

    /// Number with the float tag.
    pub fn is_float(&self) -> bool {
        matches!(self.raw, RawValue::Float(_))
    }

    pub fn is_number(&self) -> bool {
        matches!(self.raw, RawValue::Int(_) | RawValue::Float(_))
    }

    pub fn is_string(&self) -> bool {
        match self.raw {
            RawValue::Handle(id) => self
                .ctx
                .inner
                .rt
                .heap
                .with(id, |cell| matches!(cell, HeapCell::Str(_)))
                .unwrap_or(false),
            _ => false,
        }
    }

    /// Any heap object, including arrays, functions, promises, and native
    /// instances.
    pub fn is_object(&self) -> bool {
        match self.raw {
            RawValue::Handle(id) => self
                .ctx
                .inner
                .rt
                .heap
                .with(id, |cell| matches!(cell, HeapCell::Object(_)))
                .unwrap_or(false),
            _ => false,
        }
    }

    pub fn is_array(&self) -> bool {
        self.kind_matches(|kind| matches!(kind, ObjectKind::Array(_)))
    }

    pub fn is_function(&self) -> bool {
        self.kind_matches(|kind| matches!(kind, ObjectKind::Function(_)))
    }

    pub fn is_promise(&self) -> bool {
        self.kind_matches(|kind| matches!(kind, ObjectKind::Promise(_)))
    }

    fn kind_matches(&self, f: impl Fn(&ObjectKind) -> bool) -> bool {
        match self.raw {
            RawValue::Handle(id) => self
                .ctx
                .inner
                .rt
                .heap
                .with_object(id, |data| f(&data.kind))
                .unwrap_or(false),
            _ => false,
        }
    }

    /// Diagnostic type name: `"number"`, `"string"`, `"array"`, the class
    /// name for native instances, and so on.
    pub fn type_name(&self) -> &'static str {
        if let RawValue::Handle(id) = self.raw {
            let class_id = self
                .ctx
                .inner
                .rt
                .heap
                .with_object(id, |data| match &data.kind {
                    ObjectKind::Native(cell) => Some(cell.class_id),
                    _ => None,
                })
                .flatten();
            if let Some(class_id) = class_id {
                return self.ctx.inner.rt.classes.class_name(class_id);
            }
        }
        self.ctx.inner.rt.heap.kind_name(self.raw)
    }

    /// Settlement state, for promises.
    pub fn promise_state(&self) -> Option<PromiseState> {
        match self.raw {
            RawValue::Handle(id) => self
                .ctx
                .inner
                .rt
                .heap
                .with_object(id, |data| match &data.kind {
                    ObjectKind::Promise(promise) => Some(promise.state),
                    _ => None,
                })
                .flatten(),
            _ => None,
        }
    }

    /// Engine truthiness.
    pub fn truthy(&self) -> bool {
        interp::truthy(&self.ctx, self.raw)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self.raw {
            RawValue::Bool(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self.raw {
            RawValue::Int(v) => Some(v),
            _ => None,
        }
    }

    /// Either number tag widened to a float.
    pub fn as_number(&self) -> Option<f64> {
        match self.raw {
            RawValue::Int(v) => Some(v as f64),
            RawValue::Float(v) => Some(v),
            _ => None,
        }
    }

    /// Strict equality: identity for objects, content for primitives, with
    /// the two number tags comparing numerically.
    pub fn strict_equals(&self, other: &Value) -> bool {
        interp::strict_eq(&self.ctx, self.raw, other.raw)
    }

    // ========================================================================
    // Properties
    // ========================================================================

    /// Read a property, walking the prototype chain and invoking getters.
    pub fn get<'a>(&self, key: impl Into<PropKey<'a>>) -> ScriptResult<Value> {
        let raw = interp::get_prop(&self.ctx, self.raw, key.into())?;
        Ok(Value::from_raw(&self.ctx, raw))
    }

    /// Write a property, invoking a setter when one is defined.
    pub fn set<'a>(&self, key: impl Into<PropKey<'a>>, value: impl IntoScript) -> ScriptResult<()> {
        let value = value.into_script(&self.ctx);
        interp::set_prop(&self.ctx, self.raw, key.into(), value.raw())
    }

    /// Whether the property exists on the value or its prototype chain.
    pub fn has<'a>(&self, key: impl Into<PropKey<'a>>) -> ScriptResult<bool> {
        interp::has_prop(&self.ctx, self.raw, key.into())
    }

    /// The value's prototype object. `None` for primitives and for objects
    /// at the end of the chain.
    pub fn prototype(&self) -> Option<Value> {
        match self.raw {
            RawValue::Handle(id) => self
                .ctx
                .inner
                .rt
                .heap
                .with_object(id, |data| data.proto)
                .flatten()
                .map(|proto| Value::from_raw(&self.ctx, RawValue::Handle(proto))),
            _ => None,
        }
    }

    // ========================================================================
    // Calls
    // ========================================================================

    /// Call the value as a function with `undefined` as `this`.
    pub fn invoke(&self, args: &[Value]) -> ScriptResult<Value> {
        let this = Value::undefined(&self.ctx);
        self.invoke_with(&this, args)
    }

    /// Call the value as a function with an explicit `this`.
    pub fn invoke_with(&self, this: &Value, args: &[Value]) -> ScriptResult<Value> {
        let raw_args: Vec<RawValue> = args.iter().map(|v| v.raw()).collect();
        let result = interp::call_value(&self.ctx, self.raw, this.raw(), &raw_args)?;
        Ok(Value::from_raw(&self.ctx, result))
    }

    // ========================================================================
    // Conversions
    // ========================================================================

    /// Convert to a native type.
    pub fn to_native<T: FromScript>(&self) -> ScriptResult<T> {
        T::from_script(self)
    }

    /// Unwrap a shared handle to a registered class instance.
    pub fn instance<T: ScriptClass>(&self) -> ScriptResult<Rc<RefCell<T>>> {
        class::instance_of::<T>(self)
    }

    /// Unwrap a registered class instance by value, cloning it out of the
    /// cell.
    pub fn to_instance<T: ScriptClass + Clone>(&self) -> ScriptResult<T> {
        let rc = class::instance_of::<T>(self)?;
        let guard = rc.try_borrow().map_err(|_| {
            Exception::native(self.context(), NativeError::BorrowConflict { class: T::NAME })
        })?;
        Ok(guard.clone())
    }

    /// Create a non-rooting reference to this value.
    pub fn downgrade(&self) -> WeakValue {
        WeakValue::new(self)
    }
}

impl Clone for Value {
    fn clone(&self) -> Self {
        Value::from_raw(&self.ctx, self.raw)
    }
}

impl Drop for Value {
    fn drop(&mut self) {
        if let RawValue::Handle(id) = self.raw {
            self.ctx.inner.rt.heap.dec_root(id);
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&interp::to_display_string(&self.ctx, self.raw))
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Value({self})")
    }
}

/// Allocate a function object backed by native behavior.
pub(crate) fn alloc_native_function(
    ctx: &Context,
    name: &str,
    call: Option<crate::engine::object::NativeFunc>,
    construct: Option<crate::engine::object::NativeFunc>,
) -> Value {
    let id = ctx
        .inner
        .rt
        .heap
        .alloc_object(ObjectData::function(name, FuncKind::Native { call, construct }));
    Value::from_raw(ctx, RawValue::Handle(id))
}

// ============================================================================
// WeakValue
// ============================================================================

/// A non-rooting, non-traced reference to a script value.
///
/// Upgrading yields the value back while its target is still alive and
/// `None` once it was collected. Primitives upgrade unconditionally.
#[derive(Clone, Copy, Debug)]
pub struct WeakValue {
    raw: RawValue,
    r#gen: u32,
}

impl WeakValue {
    /// The empty reference; upgrades to `None`.
    pub fn empty() -> Self {
        Self {
            raw: RawValue::Undefined,
            r#gen: 0,
        }
    }

    pub(crate) fn new(value: &Value) -> Self {
        let raw = value.raw();
        let r#gen = match raw {
            RawValue::Handle(id) => value.context().inner.rt.heap.generation(id),
            _ => 0,
        };
        Self { raw, r#gen }
    }

    /// Recover a rooted value if the target is still alive.
    pub fn upgrade(&self, ctx: &Context) -> Option<Value> {
        match self.raw {
            RawValue::Undefined => None,
            RawValue::Handle(id) => {
                if ctx.inner.rt.heap.is_live(id, self.r#gen) {
                    Some(Value::from_raw(ctx, self.raw))
                } else {
                    None
                }
            }
            raw => Some(Value::from_raw(ctx, raw)),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.raw, RawValue::Undefined)
    }

    pub fn clear(&mut self) {
        *self = Self::empty();
    }
}

impl Default for WeakValue {
    fn default() -> Self {
        Self::empty()
    }
}
