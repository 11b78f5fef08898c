//! Fluent registration of one script-visible class per native type.
//!
//! The builder assembles a prototype (methods and accessors) and a
//! constructor function, then attaches the constructor to a plain object
//! or registers it as a module export:
//!
//! ```ignore
//! ClassBuilder::<Point>::new(&ctx)
//!     .ctor(|x: i32, y: f64| Point { x, y })?
//!     .property("x", |p: &Point| p.x, |p: &mut Point, v: i32| p.x = v)?
//!     .method("length", |p: &Point, scale: f64| p.length() * scale)?
//!     .build_object(&ctx.global())?;
//! ```

use std::cell::RefCell;
use std::marker::PhantomData;
use std::rc::Rc;

use crate::class::{self, ClassKind, ScriptClass};
use crate::context::Context;
use crate::convert::IntoScript;
use crate::engine::object::{NativeCell, NativeFunc, ObjectData, PropSlot, RawValue};
use crate::error::{Exception, ScriptResult};
use crate::function::{ScriptCtor, ScriptMethod, ScriptMethodMut};
use crate::module::Module;
use crate::value::{Value, alloc_native_function};

pub struct ClassBuilder<T: ScriptClass> {
    ctx: Context,
    proto: Value,
    construct: Option<NativeFunc>,
    _class: PhantomData<T>,
}

impl<T: ScriptClass> std::fmt::Debug for ClassBuilder<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassBuilder").finish_non_exhaustive()
    }
}

impl<T: ScriptClass> ClassBuilder<T> {
    pub fn new(ctx: &Context) -> Self {
        ctx.inner.rt.classes.ensure::<T>();
        ClassBuilder {
            ctx: ctx.clone(),
            proto: Value::object(ctx),
            construct: None,
            _class: PhantomData,
        }
    }

    /// Register the constructor. At most one; host-owned classes cannot
    /// be constructed from script at all.
    pub fn ctor<F, A>(mut self, f: F) -> ScriptResult<Self>
    where
        F: ScriptCtor<T, A>,
    {
        if matches!(T::KIND, ClassKind::Unmanaged) {
            return Err(Exception::type_error(
                &self.ctx,
                format!("class {} is host-owned and has no script constructor", T::NAME),
            ));
        }
        if self.construct.is_some() {
            return Err(Exception::type_error(
                &self.ctx,
                format!("class {} already has a constructor", T::NAME),
            ));
        }
        self.construct = Some(Rc::new(
            move |ctx: &Context, new_target: &Value, args: &[Value]| {
                // The native instance is built first; a failed argument
                // conversion allocates nothing.
                let instance = f.construct(ctx, args)?;
                let class_id = ctx.inner.rt.classes.ensure::<T>();
                // Use the calling constructor's prototype so subclasses
                // wire up correctly, falling back to the registered one.
                let proto_value = new_target.get("prototype")?;
                let proto = match proto_value.raw() {
                    RawValue::Handle(id)
                        if ctx.inner.rt.heap.with_object(id, |_| ()).is_some() =>
                    {
                        Some(id)
                    }
                    _ => ctx.inner.rt.classes.proto(class_id),
                };
                let cell = NativeCell {
                    class_id,
                    instance: Rc::new(RefCell::new(instance)),
                };
                let id = ctx.inner.rt.heap.alloc_object(ObjectData::native(proto, cell));
                Ok(Value::from_raw(ctx, RawValue::Handle(id)))
            },
        ));
        Ok(self)
    }

    /// A mutable field: getter plus setter. The setter re-reads the field
    /// through the getter and returns it, matching engine accessor
    /// conventions.
    pub fn property<G, S, V, W>(self, name: &str, get: G, set: S) -> ScriptResult<Self>
    where
        G: Fn(&T) -> V + 'static,
        S: Fn(&mut T, W) + 'static,
        V: IntoScript,
        W: crate::convert::FromScript,
    {
        let get = Rc::new(get);
        let getter = self.accessor_fn(name, {
            let get = get.clone();
            move |ctx: &Context, this: &Value, _args: &[Value]| {
                let rc = class::this_instance::<T>(this)?;
                let guard = borrow_shared(ctx, &rc)?;
                Ok(get(&guard).into_script(ctx))
            }
        });
        let setter = self.accessor_fn(name, {
            move |ctx: &Context, this: &Value, args: &[Value]| {
                let rc = class::this_instance::<T>(this)?;
                // Convert before borrowing: the incoming expression may
                // read other properties of the same instance.
                let incoming =
                    W::from_script(&crate::function::arg_or_undefined(ctx, args, 0))?;
                {
                    let mut guard = borrow_exclusive(ctx, &rc)?;
                    set(&mut guard, incoming);
                }
                let guard = borrow_shared(ctx, &rc)?;
                Ok(get(&guard).into_script(ctx))
            }
        });
        self.install_accessor(name, getter.raw(), Some(setter.raw()))?;
        Ok(self)
    }

    /// A read-only field: getter only. Assignment from script fails.
    pub fn property_get<G, V>(self, name: &str, get: G) -> ScriptResult<Self>
    where
        G: Fn(&T) -> V + 'static,
        V: IntoScript,
    {
        let getter = self.accessor_fn(name, move |ctx: &Context, this: &Value, _args: &[Value]| {
            let rc = class::this_instance::<T>(this)?;
            let guard = borrow_shared(ctx, &rc)?;
            Ok(get(&guard).into_script(ctx))
        });
        self.install_accessor(name, getter.raw(), None)?;
        Ok(self)
    }

    /// A method borrowing the instance shared.
    pub fn method<F, A, R>(self, name: &str, f: F) -> ScriptResult<Self>
    where
        F: ScriptMethod<T, A, R>,
        A: 'static,
        R: 'static,
    {
        let func = Value::raw_function(&self.ctx, name, move |ctx, this, args| {
            let rc = class::this_instance::<T>(this)?;
            f.invoke(ctx, &rc, args)
        });
        self.proto.set(name, func)?;
        Ok(self)
    }

    /// A method borrowing the instance exclusively.
    pub fn method_mut<F, A, R>(self, name: &str, f: F) -> ScriptResult<Self>
    where
        F: ScriptMethodMut<T, A, R>,
        A: 'static,
        R: 'static,
    {
        let func = Value::raw_function(&self.ctx, name, move |ctx, this, args| {
            let rc = class::this_instance::<T>(this)?;
            f.invoke(ctx, &rc, args)
        });
        self.proto.set(name, func)?;
        Ok(self)
    }

    /// A method receiving `this` and the arguments unconverted.
    pub fn method_raw<F>(self, name: &str, f: F) -> ScriptResult<Self>
    where
        F: Fn(&Context, &Value, &[Value]) -> ScriptResult<Value> + 'static,
    {
        let func = Value::raw_function(&self.ctx, name, f);
        self.proto.set(name, func)?;
        Ok(self)
    }

    /// Attach the constructor as a named property of `target`.
    pub fn build_object(self, target: &Value) -> ScriptResult<Value> {
        let ctor = self.finish()?;
        target.set(T::NAME, ctor.clone())?;
        Ok(ctor)
    }

    /// Register the constructor as a named export of `module`.
    pub fn build_module(self, module: &mut Module) -> ScriptResult<Value> {
        let ctor = self.finish()?;
        module.add_export(T::NAME, &ctor)?;
        Ok(ctor)
    }

    /// Assemble the constructor function and wire the prototype loop.
    fn finish(self) -> ScriptResult<Value> {
        let construct = match self.construct {
            Some(construct) => construct,
            None => {
                // Constructor-less classes still get a constructor value;
                // calling it fails and allocates nothing.
                let no_ctor: NativeFunc =
                    Rc::new(move |ctx: &Context, _new_target: &Value, _args: &[Value]| {
                        Err(Exception::type_error(
                            ctx,
                            format!("class {} has no constructor", T::NAME),
                        ))
                    });
                no_ctor
            }
        };
        let ctor = alloc_native_function(&self.ctx, T::NAME, None, Some(construct));
        ctor.set("prototype", self.proto.clone())?;
        self.proto.set("constructor", ctor.clone())?;

        let class_id = self.ctx.inner.rt.classes.ensure::<T>();
        if let RawValue::Handle(id) = self.proto.raw() {
            self.ctx.inner.rt.classes.set_proto(class_id, id);
        }
        Ok(ctor)
    }

    fn accessor_fn<F>(&self, name: &str, f: F) -> Value
    where
        F: Fn(&Context, &Value, &[Value]) -> ScriptResult<Value> + 'static,
    {
        Value::raw_function(&self.ctx, name, f)
    }

    fn install_accessor(
        &self,
        name: &str,
        getter: RawValue,
        setter: Option<RawValue>,
    ) -> ScriptResult<()> {
        let installed = match self.proto.raw() {
            RawValue::Handle(id) => self
                .ctx
                .inner
                .rt
                .heap
                .with_object_mut(id, |data| {
                    data.props
                        .insert(name.to_string(), PropSlot::Accessor { getter, setter });
                })
                .is_some(),
            _ => false,
        };
        if installed {
            Ok(())
        } else {
            Err(Exception::type_error(
                &self.ctx,
                format!("class {} prototype is not an object", T::NAME),
            ))
        }
    }
}

fn borrow_shared<'a, T: ScriptClass>(
    ctx: &Context,
    rc: &'a Rc<RefCell<T>>,
) -> ScriptResult<std::cell::Ref<'a, T>> {
    rc.try_borrow().map_err(|_| {
        Exception::native(
            ctx,
            crate::error::NativeError::BorrowConflict { class: T::NAME },
        )
    })
}

fn borrow_exclusive<'a, T: ScriptClass>(
    ctx: &Context,
    rc: &'a Rc<RefCell<T>>,
) -> ScriptResult<std::cell::RefMut<'a, T>> {
    rc.try_borrow_mut().map_err(|_| {
        Exception::native(
            ctx,
            crate::error::NativeError::BorrowConflict { class: T::NAME },
        )
    })
}
