//! Execution context: a global object and module table on a shared runtime.
//!
//! A `Context` is where scripts run. The host installs values, functions,
//! and classes on the [global object](Context::global) or in
//! [modules](Context::new_module), then evaluates source with
//! [`eval`](Context::eval):
//!
//! ```ignore
//! use quickbind::{Context, EvalFlags, Runtime, Value};
//!
//! let rt = Runtime::new();
//! let ctx = Context::new(&rt);
//!
//! ctx.global().set("greet", &Value::function(&ctx, "greet", |name: String| {
//!     format!("hello {name}")
//! }))?;
//!
//! let out = ctx.eval("demo", r#"greet("world")"#, EvalFlags::empty())?;
//! assert_eq!(out.to_native::<String>()?, "hello world");
//! ```

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use bitflags::bitflags;

use crate::engine::interp;
use crate::engine::modules::{self, ModuleMap};
use crate::engine::object::{ObjectData, PromiseState, RawValue, SlotId};
use crate::engine::parser;
use crate::error::{Exception, ScriptResult};
use crate::module::Module;
use crate::runtime::{Runtime, RuntimeInner};
use crate::value::Value;

bitflags! {
    /// Switches for [`Context::eval`].
    #[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
    pub struct EvalFlags: u32 {
        /// Treat the source as a module: imports and exports are allowed,
        /// top-level bindings stay out of the global object, and the
        /// completion value is `undefined`.
        const MODULE = 1 << 0;
        /// Parse without executing.
        const COMPILE_ONLY = 1 << 1;
    }
}

/// Handle to an execution context.
///
/// Cloning is cheap; clones refer to the same context. The context (and
/// every [`Value`] on it) is single-threaded.
#[derive(Clone)]
pub struct Context {
    pub(crate) inner: Rc<ContextInner>,
}

pub(crate) struct ContextInner {
    pub(crate) rt: Rc<RuntimeInner>,
    pub(crate) global: SlotId,
    /// Installed by global bootstrap; `.then` lookup for script promises.
    pub(crate) promise_proto: Cell<Option<SlotId>>,
    pub(crate) modules: RefCell<ModuleMap>,
}

impl Context {
    /// Create a context on `rt` with a fresh global object.
    pub fn new(rt: &Runtime) -> Context {
        let global = rt.inner.heap.alloc_object(ObjectData::plain());
        let inner = Rc::new(ContextInner {
            rt: rt.inner.clone(),
            global,
            promise_proto: Cell::new(None),
            modules: RefCell::new(ModuleMap::default()),
        });
        rt.inner.register_context(&inner);
        let ctx = Context { inner };
        interp::bootstrap_global(&ctx);
        ctx
    }

    /// The global object.
    pub fn global(&self) -> Value {
        Value::from_raw(self, RawValue::Handle(self.inner.global))
    }

    /// The runtime this context lives on.
    pub fn runtime(&self) -> Runtime {
        Runtime {
            inner: self.inner.rt.clone(),
        }
    }

    // ========================================================================
    // Evaluation
    // ========================================================================

    /// Evaluate `source`, labelled `unit` in error messages.
    ///
    /// Script mode returns the value of the last expression statement, or
    /// `undefined`. With [`EvalFlags::MODULE`] the unit is registered as a
    /// module named `unit`, evaluated, and `undefined` is returned; a
    /// second unit may then import it by that name.
    ///
    /// # Errors
    ///
    /// Parse failures surface as `SyntaxError` exceptions prefixed with
    /// `unit`; anything the script throws comes back as the thrown value.
    pub fn eval(&self, unit: &str, source: &str, flags: EvalFlags) -> ScriptResult<Value> {
        if flags.contains(EvalFlags::MODULE) {
            if flags.contains(EvalFlags::COMPILE_ONLY) {
                modules::compile_source(self, unit, source)?;
            } else {
                modules::load_source(self, unit, source, false)?;
            }
            return Ok(Value::undefined(self));
        }
        let program =
            parser::parse_script(source).map_err(|e| Exception::parse(self, unit, &e))?;
        if flags.contains(EvalFlags::COMPILE_ONLY) {
            return Ok(Value::undefined(self));
        }
        let raw = interp::run_script(self, &program)?;
        Ok(Value::from_raw(self, raw))
    }

    /// Load a module from source text and return its handle. `main`
    /// selects what `import.meta.main` reports inside the module.
    ///
    /// The module and its transitive imports are linked and evaluated
    /// before this returns.
    pub fn load_module(&self, specifier: &str, source: &str, main: bool) -> ScriptResult<Module> {
        let id = modules::load_source(self, specifier, source, main)?;
        Ok(Module::from_id(self, id))
    }

    /// Declare an empty native module that scripts can import by name.
    pub fn new_module(&self, name: &str) -> ScriptResult<Module> {
        Module::declare(self, name)
    }

    // ========================================================================
    // Promises and jobs
    // ========================================================================

    /// Run one queued promise reaction. Returns `false` when the queue is
    /// empty.
    pub fn run_pending_job(&self) -> bool {
        match self.inner.rt.pop_job() {
            Some(job) => {
                interp::run_job(job);
                true
            }
            None => false,
        }
    }

    /// The settlement state of a promise, or `None` for non-promises.
    pub fn promise_state(&self, value: &Value) -> Option<PromiseState> {
        interp::promise_snapshot(self, value.raw()).map(|(state, _)| state)
    }

    /// Drain queued jobs until `value` settles, then return its
    /// fulfillment value, or the rejection value as an error. Values that
    /// are not promises pass through unchanged.
    ///
    /// # Errors
    ///
    /// Fails if the queue empties while the promise is still pending;
    /// settling it would then require work this context cannot see.
    pub fn await_value(&self, value: &Value) -> ScriptResult<Value> {
        loop {
            let Some((state, result)) = interp::promise_snapshot(self, value.raw()) else {
                return Ok(value.clone());
            };
            match state {
                PromiseState::Fulfilled => return Ok(Value::from_raw(self, result)),
                PromiseState::Rejected => {
                    return Err(Exception::from_value(Value::from_raw(self, result)));
                }
                PromiseState::Pending => {
                    if !self.run_pending_job() {
                        return Err(Exception::error(
                            self,
                            "promise cannot settle: job queue is empty",
                        ));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_ctx() -> Context {
        Context::new(&Runtime::new())
    }

    #[test]
    fn eval_returns_the_last_expression_value() {
        let ctx = test_ctx();
        let out = ctx
            .eval("t", "let a = 2; let b = 3; a * b + 1;", EvalFlags::empty())
            .unwrap();
        assert_eq!(out.to_native::<i32>().unwrap(), 7);
    }

    #[test]
    fn eval_without_an_expression_returns_undefined() {
        let ctx = test_ctx();
        let out = ctx.eval("t", "let a = 1;", EvalFlags::empty()).unwrap();
        assert!(out.is_undefined());
    }

    #[test]
    fn parse_errors_name_the_unit() {
        let ctx = test_ctx();
        let err = ctx.eval("boot", "let = ;", EvalFlags::empty()).unwrap_err();
        assert!(err.message().contains("boot:"), "got: {}", err.message());
    }

    #[test]
    fn compile_only_does_not_execute() {
        let ctx = test_ctx();
        ctx.eval("t", "globalThis.ran = true;", EvalFlags::COMPILE_ONLY)
            .unwrap();
        assert!(ctx.global().get("ran").unwrap().is_undefined());
    }

    #[test]
    fn native_functions_are_callable_from_scripts() {
        let ctx = test_ctx();
        let double = Value::function(&ctx, "double", |n: i32| n * 2);
        ctx.global().set("double", &double).unwrap();

        let out = ctx.eval("t", "double(21);", EvalFlags::empty()).unwrap();
        assert_eq!(out.to_native::<i32>().unwrap(), 42);
    }

    #[test]
    fn thrown_values_surface_as_exceptions() {
        let ctx = test_ctx();
        let err = ctx
            .eval("t", r#"throw new TypeError("bad input");"#, EvalFlags::empty())
            .unwrap_err();
        assert!(err.message().contains("bad input"));
    }

    #[test]
    fn module_mode_registers_the_unit_for_import() {
        let ctx = test_ctx();
        ctx.eval("lib", "export const seven = 7;", EvalFlags::MODULE)
            .unwrap();
        ctx.eval(
            "main",
            r#"import { seven } from "lib"; globalThis.got = seven;"#,
            EvalFlags::MODULE,
        )
        .unwrap();
        let got = ctx.global().get("got").unwrap();
        assert_eq!(got.to_native::<i32>().unwrap(), 7);
    }

    #[test]
    fn module_units_cannot_be_registered_twice() {
        let ctx = test_ctx();
        ctx.eval("lib", "export const a = 1;", EvalFlags::MODULE)
            .unwrap();
        let err = ctx
            .eval("lib", "export const a = 2;", EvalFlags::MODULE)
            .unwrap_err();
        assert!(err.message().contains("already defined"));
    }

    #[test]
    fn await_value_passes_non_promises_through() {
        let ctx = test_ctx();
        let plain = Value::of(&ctx, 5);
        let out = ctx.await_value(&plain).unwrap();
        assert_eq!(out.to_native::<i32>().unwrap(), 5);
    }

    #[test]
    fn await_value_settles_through_the_job_queue() {
        let ctx = test_ctx();
        let promise = ctx
            .eval(
                "t",
                "Promise.resolve(6).then(n => n * 7);",
                EvalFlags::empty(),
            )
            .unwrap();
        assert_eq!(ctx.promise_state(&promise), Some(PromiseState::Pending));
        let out = ctx.await_value(&promise).unwrap();
        assert_eq!(out.to_native::<i32>().unwrap(), 42);
    }

    #[test]
    fn await_value_reports_rejections() {
        let ctx = test_ctx();
        let promise = ctx
            .eval(
                "t",
                r#"Promise.reject(new Error("nope"));"#,
                EvalFlags::empty(),
            )
            .unwrap();
        let err = ctx.await_value(&promise).unwrap_err();
        assert!(err.message().contains("nope"));
    }
}
