//! Typed call trampolines.
//!
//! [`ScriptFn`], [`ScriptMethod`], [`ScriptMethodMut`], and [`ScriptCtor`]
//! adapt plain Rust callables to the engine's calling convention. Each
//! arity gets an implementation that converts the positional arguments
//! left to right through [`FromScript`], aborting on the first failure;
//! arguments beyond the declared count are ignored and missing ones
//! convert from `undefined`. Return values pass through [`ScriptReturn`],
//! so a callable may return either `R` or `ScriptResult<R>`.

use std::cell::RefCell;
use std::rc::Rc;

use crate::class::ScriptClass;
use crate::context::Context;
use crate::convert::{FromScript, IntoScript};
use crate::engine::object::NativeFunc;
use crate::error::{ConversionError, Exception, NativeError, ScriptResult};
use crate::value::Value;

// ============================================================================
// Return conversion
// ============================================================================

/// Types a native callable may return: any `IntoScript` type, or a
/// `ScriptResult` of one for fallible callables.
pub trait ScriptReturn {
    fn into_script_return(self, ctx: &Context) -> ScriptResult<Value>;
}

impl<T: IntoScript> ScriptReturn for T {
    fn into_script_return(self, ctx: &Context) -> ScriptResult<Value> {
        Ok(self.into_script(ctx))
    }
}

impl<T: IntoScript> ScriptReturn for ScriptResult<T> {
    fn into_script_return(self, ctx: &Context) -> ScriptResult<Value> {
        self.map(|value| value.into_script(ctx))
    }
}

/// Constructor results: the instance itself, or a `ScriptResult` of it.
pub trait CtorResult<T> {
    fn into_ctor_result(self) -> ScriptResult<T>;
}

impl<T> CtorResult<T> for T {
    fn into_ctor_result(self) -> ScriptResult<T> {
        Ok(self)
    }
}

impl<T> CtorResult<T> for ScriptResult<T> {
    fn into_ctor_result(self) -> ScriptResult<T> {
        self
    }
}

// ============================================================================
// Callable traits
// ============================================================================

/// A free function callable from script.
pub trait ScriptFn<A, R>: 'static {
    fn invoke(&self, ctx: &Context, args: &[Value]) -> ScriptResult<Value>;
}

/// A method taking `&self` on a registered class.
///
/// Arguments convert before the instance is borrowed, so an argument
/// expression that reads a property of the same instance stays legal.
pub trait ScriptMethod<T, A, R>: 'static {
    fn invoke(&self, ctx: &Context, cell: &RefCell<T>, args: &[Value]) -> ScriptResult<Value>;
}

/// A method taking `&mut self` on a registered class.
pub trait ScriptMethodMut<T, A, R>: 'static {
    fn invoke(&self, ctx: &Context, cell: &RefCell<T>, args: &[Value]) -> ScriptResult<Value>;
}

/// A constructor producing a new instance of a registered class.
pub trait ScriptCtor<T, A>: 'static {
    fn construct(&self, ctx: &Context, args: &[Value]) -> ScriptResult<T>;
}

pub(crate) fn arg_or_undefined(ctx: &Context, args: &[Value], index: usize) -> Value {
    args.get(index)
        .cloned()
        .unwrap_or_else(|| Value::undefined(ctx))
}

macro_rules! impl_callables {
    ($($arg:ident)*) => {
        #[allow(non_snake_case)]
        impl<Func, Ret, $($arg,)*> ScriptFn<($($arg,)*), Ret> for Func
        where
            Func: Fn($($arg),*) -> Ret + 'static,
            Ret: ScriptReturn,
            $($arg: FromScript,)*
        {
            fn invoke(&self, ctx: &Context, args: &[Value]) -> ScriptResult<Value> {
                let mut _index = 0usize;
                $(
                    let $arg = $arg::from_script(&arg_or_undefined(ctx, args, _index))?;
                    _index += 1;
                )*
                (self)($($arg),*).into_script_return(ctx)
            }
        }

        #[allow(non_snake_case)]
        impl<Func, This, Ret, $($arg,)*> ScriptMethod<This, ($($arg,)*), Ret> for Func
        where
            Func: Fn(&This, $($arg),*) -> Ret + 'static,
            This: ScriptClass,
            Ret: ScriptReturn,
            $($arg: FromScript,)*
        {
            fn invoke(
                &self,
                ctx: &Context,
                cell: &RefCell<This>,
                args: &[Value],
            ) -> ScriptResult<Value> {
                let mut _index = 0usize;
                $(
                    let $arg = $arg::from_script(&arg_or_undefined(ctx, args, _index))?;
                    _index += 1;
                )*
                let guard = cell.try_borrow().map_err(|_| {
                    Exception::native(ctx, NativeError::BorrowConflict { class: This::NAME })
                })?;
                (self)(&guard, $($arg),*).into_script_return(ctx)
            }
        }

        #[allow(non_snake_case)]
        impl<Func, This, Ret, $($arg,)*> ScriptMethodMut<This, ($($arg,)*), Ret> for Func
        where
            Func: Fn(&mut This, $($arg),*) -> Ret + 'static,
            This: ScriptClass,
            Ret: ScriptReturn,
            $($arg: FromScript,)*
        {
            fn invoke(
                &self,
                ctx: &Context,
                cell: &RefCell<This>,
                args: &[Value],
            ) -> ScriptResult<Value> {
                let mut _index = 0usize;
                $(
                    let $arg = $arg::from_script(&arg_or_undefined(ctx, args, _index))?;
                    _index += 1;
                )*
                let mut guard = cell.try_borrow_mut().map_err(|_| {
                    Exception::native(ctx, NativeError::BorrowConflict { class: This::NAME })
                })?;
                (self)(&mut guard, $($arg),*).into_script_return(ctx)
            }
        }

        #[allow(non_snake_case)]
        impl<Func, This, Out, $($arg,)*> ScriptCtor<This, ($($arg,)*)> for Func
        where
            Func: Fn($($arg),*) -> Out + 'static,
            Out: CtorResult<This>,
            This: 'static,
            $($arg: FromScript,)*
        {
            fn construct(&self, ctx: &Context, args: &[Value]) -> ScriptResult<This> {
                let mut _index = 0usize;
                $(
                    let $arg = $arg::from_script(&arg_or_undefined(ctx, args, _index))?;
                    _index += 1;
                )*
                (self)($($arg),*).into_ctor_result()
            }
        }
    };
}

impl_callables!();
impl_callables!(A0);
impl_callables!(A0 A1);
impl_callables!(A0 A1 A2);
impl_callables!(A0 A1 A2 A3);
impl_callables!(A0 A1 A2 A3 A4);
impl_callables!(A0 A1 A2 A3 A4 A5);
impl_callables!(A0 A1 A2 A3 A4 A5 A6);
impl_callables!(A0 A1 A2 A3 A4 A5 A6 A7);

/// Adapt a typed callable to the engine's native calling convention.
pub(crate) fn typed_native<F, A, R>(f: F) -> NativeFunc
where
    F: ScriptFn<A, R>,
{
    Rc::new(move |ctx: &Context, _this: &Value, args: &[Value]| f.invoke(ctx, args))
}

// ============================================================================
// Script functions held by native code
// ============================================================================

/// Positional arguments for [`ScriptFunction::call`]: a tuple of
/// `IntoScript` values.
pub trait IntoScriptArgs {
    fn into_script_args(self, ctx: &Context) -> Vec<Value>;
}

impl IntoScriptArgs for () {
    fn into_script_args(self, _ctx: &Context) -> Vec<Value> {
        Vec::new()
    }
}

impl IntoScriptArgs for Vec<Value> {
    fn into_script_args(self, _ctx: &Context) -> Vec<Value> {
        self
    }
}

macro_rules! impl_script_args {
    ($($arg:ident)+) => {
        #[allow(non_snake_case)]
        impl<$($arg: IntoScript),+> IntoScriptArgs for ($($arg,)+) {
            fn into_script_args(self, ctx: &Context) -> Vec<Value> {
                let ($($arg,)+) = self;
                vec![$($arg.into_script(ctx)),+]
            }
        }
    };
}

impl_script_args!(A0);
impl_script_args!(A0 A1);
impl_script_args!(A0 A1 A2);
impl_script_args!(A0 A1 A2 A3);
impl_script_args!(A0 A1 A2 A3 A4);
impl_script_args!(A0 A1 A2 A3 A4 A5);
impl_script_args!(A0 A1 A2 A3 A4 A5 A6);
impl_script_args!(A0 A1 A2 A3 A4 A5 A6 A7);

/// A script function held from native code, with typed calls through the
/// conversion registry in both directions.
#[derive(Clone, Debug)]
pub struct ScriptFunction {
    value: Value,
}

impl ScriptFunction {
    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn into_value(self) -> Value {
        self.value
    }

    /// Call with `undefined` as `this`.
    pub fn call<A: IntoScriptArgs, R: FromScript>(&self, args: A) -> ScriptResult<R> {
        let ctx = self.value.context();
        let arg_values = args.into_script_args(ctx);
        let result = self.value.invoke(&arg_values)?;
        R::from_script(&result)
    }

    /// Call with an explicit `this`.
    pub fn call_with<A: IntoScriptArgs, R: FromScript>(
        &self,
        this: &Value,
        args: A,
    ) -> ScriptResult<R> {
        let ctx = self.value.context();
        let arg_values = args.into_script_args(ctx);
        let result = self.value.invoke_with(this, &arg_values)?;
        R::from_script(&result)
    }
}

impl FromScript for ScriptFunction {
    fn from_script(value: &Value) -> ScriptResult<Self> {
        if !value.is_function() {
            return Err(Exception::conversion(
                value.context(),
                ConversionError::TypeMismatch {
                    expected: "function",
                    actual: value.type_name(),
                },
            ));
        }
        Ok(ScriptFunction {
            value: value.clone(),
        })
    }
}

impl IntoScript for ScriptFunction {
    fn into_script(self, _ctx: &Context) -> Value {
        self.value
    }
}
