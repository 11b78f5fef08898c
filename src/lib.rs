//! quickbind - an embedded ECMAScript engine with a typed binding layer.
//!
//! The crate runs a small script engine in-process and concentrates on the
//! seam between it and the host: native values, functions, classes, and
//! modules become visible to scripts through compile-time conversion
//! traits, so a binding is declared once with ordinary Rust types and the
//! argument unpacking, type checks, and error reporting are generated.
//!
//! # Features
//!
//! - **Typed conversions**: [`FromScript`]/[`IntoScript`] cover integers
//!   (narrowed by the engine's value tag), floats, bools, strings,
//!   `Option`, `Vec`, and fixed arrays; the first failing element aborts
//!   a sequence conversion.
//! - **Function binding**: closures of arity 0 through 8 become script
//!   functions; arguments convert positionally and the first failure wins.
//! - **Class binding**: [`ClassBuilder`] registers constructors, field
//!   accessors, and methods for host types, wired through `RefCell` borrow
//!   discipline instead of aliasing rules a script could violate.
//! - **Modules**: native export tables plus source-text modules resolved
//!   through a host [`ModuleLoader`], with `import.meta`.
//! - **Promises**: a synchronous job queue; hosts can drain it and
//!   [`await`](Context::await_value) settlement without an executor.
//!
//! # Quick start
//!
//! ```ignore
//! use quickbind::{Context, EvalFlags, Runtime, Value};
//!
//! let rt = Runtime::new();
//! let ctx = Context::new(&rt);
//!
//! ctx.global().set("answer", &Value::of(&ctx, 42))?;
//! let out = ctx.eval("demo", "answer - 21;", EvalFlags::empty())?;
//! assert_eq!(out.to_native::<i32>()?, 21);
//! ```
//!
//! Values are reference-counted handles into a per-runtime heap; dropping
//! a [`Value`] un-roots it and [`Runtime::collect`] sweeps whatever
//! scripts can no longer reach. Hosts that keep script values inside
//! native instances implement [`ScriptClass::trace`] so collection can
//! see through them.

mod class;
mod class_builder;
mod context;
mod convert;
mod engine;
mod error;
mod function;
mod module;
mod runtime;
mod value;

pub use class::{ClassKind, ScriptClass};
pub use class_builder::ClassBuilder;
pub use context::{Context, EvalFlags};
pub use convert::{FromScript, IntoScript};
pub use engine::heap::{Traced, Tracer};
pub use engine::object::PromiseState;
pub use error::{ConversionError, Exception, NativeError, ParseError, ScriptResult};
pub use function::{
    CtorResult, IntoScriptArgs, ScriptCtor, ScriptFn, ScriptFunction, ScriptMethod,
    ScriptMethodMut, ScriptReturn,
};
pub use module::{MemoryLoader, Module, ModuleLoader, default_normalize};
pub use runtime::{Runtime, RuntimeConfig};
pub use value::{PropKey, Value, WeakValue};

/// The commonly used subset, for glob import.
pub mod prelude {
    pub use crate::{
        ClassBuilder, ClassKind, Context, EvalFlags, Exception, FromScript, IntoScript,
        MemoryLoader, Module, ModuleLoader, PromiseState, Runtime, RuntimeConfig, ScriptClass,
        ScriptFunction, ScriptResult, Traced, Tracer, Value, WeakValue,
    };
}
