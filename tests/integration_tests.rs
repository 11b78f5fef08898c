//! End-to-end tests driving whole programs through the public API:
//! evaluation, control flow, exceptions, promises, and the traced link
//! between native instances and script values.

use std::cell::RefCell;
use std::rc::Rc;

use quickbind::{
    Context, EvalFlags, PromiseState, Runtime, RuntimeConfig, ScriptClass, ScriptFunction,
    ScriptResult, Traced, Tracer, Value,
};

fn new_ctx() -> (Runtime, Context) {
    let rt = Runtime::new();
    let ctx = Context::new(&rt);
    (rt, ctx)
}

fn eval(ctx: &Context, source: &str) -> Value {
    ctx.eval("test", source, EvalFlags::empty()).unwrap()
}

// =============================================================================
// Programs
// =============================================================================

#[test]
fn test_loops_and_branches_compute() {
    let (_rt, ctx) = new_ctx();
    let out = eval(
        &ctx,
        r#"
        function fib(n) {
            let a = 0;
            let b = 1;
            while (n > 0) {
                const next = a + b;
                a = b;
                b = next;
                n = n - 1;
            }
            return a;
        }
        let sum = 0;
        for (let i = 1; i <= 10; i += 1) {
            if (i % 2 === 0) {
                sum += i;
            }
        }
        fib(10) * 100 + sum;
        "#,
    );
    assert_eq!(out.to_native::<i32>().unwrap(), 5530);
}

#[test]
fn test_closures_capture_enclosing_state() {
    let (_rt, ctx) = new_ctx();
    let out = eval(
        &ctx,
        r#"
        function makeCounter() {
            let n = 0;
            return function() {
                n = n + 1;
                return n;
            };
        }
        const tick = makeCounter();
        tick();
        tick();
        tick();
        "#,
    );
    assert_eq!(out.to_native::<i32>().unwrap(), 3);
}

// =============================================================================
// Exceptions
// =============================================================================

#[test]
fn test_thrown_errors_carry_name_and_message() {
    let (_rt, ctx) = new_ctx();
    let err = ctx
        .eval(
            "test",
            r#"throw new TypeError("bad thing");"#,
            EvalFlags::empty(),
        )
        .unwrap_err();
    assert_eq!(err.message(), "TypeError: bad thing");
}

#[test]
fn test_try_catch_recovers_and_rethrows() {
    let (_rt, ctx) = new_ctx();
    let out = eval(
        &ctx,
        r#"
        let seen = "";
        try {
            throw new Error("first");
        } catch (e) {
            seen = e.message;
        }
        seen;
        "#,
    );
    assert_eq!(out.to_native::<String>().unwrap(), "first");

    let err = ctx
        .eval(
            "test2",
            r#"
            try {
                throw new Error("inner");
            } catch (e) {
                throw new Error(e.message + ", wrapped");
            }
            "#,
            EvalFlags::empty(),
        )
        .unwrap_err();
    assert_eq!(err.message(), "Error: inner, wrapped");
}

#[test]
fn test_runaway_recursion_hits_the_depth_limit() {
    let (_rt, ctx) = new_ctx();
    let err = ctx
        .eval(
            "test",
            "function dive() { return dive(); } dive();",
            EvalFlags::empty(),
        )
        .unwrap_err();
    assert!(err.message().contains("RangeError"));
    assert!(err.message().contains("maximum call stack size exceeded"));
}

#[test]
fn test_depth_limit_is_configurable_and_recoverable() {
    let rt = Runtime::with_config(RuntimeConfig {
        max_stack_depth: 16,
        ..RuntimeConfig::default()
    });
    let ctx = Context::new(&rt);

    let err = ctx
        .eval(
            "deep",
            r#"
            function rec(n) {
                return rec(n + 1);
            }
            rec(0);
            "#,
            EvalFlags::empty(),
        )
        .unwrap_err();
    assert!(err.message().contains("maximum call stack size exceeded"));

    // The depth counter unwinds with the failed frames.
    let out = eval(&ctx, "function ok() { return 5; } ok();");
    assert_eq!(out.to_native::<i32>().unwrap(), 5);
}

// =============================================================================
// Promises
// =============================================================================

#[test]
fn test_promise_chains_settle_in_queue_order() {
    let (_rt, ctx) = new_ctx();
    let out = eval(
        &ctx,
        r#"
        globalThis.order = "";
        Promise.resolve(2)
            .then(n => { globalThis.order = globalThis.order + "a" + n; return n * 3; })
            .then(n => { globalThis.order = globalThis.order + "b" + n; return n; });
        "#,
    );
    assert_eq!(ctx.promise_state(&out), Some(PromiseState::Pending));

    while ctx.run_pending_job() {}

    assert_eq!(ctx.promise_state(&out), Some(PromiseState::Fulfilled));
    let order = ctx
        .global()
        .get("order")
        .unwrap()
        .to_native::<String>()
        .unwrap();
    assert_eq!(order, "a2b6");
    let settled = ctx.await_value(&out).unwrap();
    assert_eq!(settled.to_native::<i32>().unwrap(), 6);
}

#[test]
fn test_rejections_take_the_second_handler() {
    let (_rt, ctx) = new_ctx();
    let out = eval(
        &ctx,
        r#"
        Promise.reject(new Error("denied"))
            .then(v => "fulfilled:" + v, e => "rejected:" + e.message);
        "#,
    );
    let settled = ctx.await_value(&out).unwrap();
    assert_eq!(settled.to_native::<String>().unwrap(), "rejected:denied");
}

// =============================================================================
// Tracing
// =============================================================================

struct Holder {
    kept: Traced,
}

impl ScriptClass for Holder {
    const NAME: &'static str = "Holder";

    fn trace(&self, tracer: &mut Tracer<'_>) {
        tracer.visit(&self.kept);
    }
}

#[test]
fn test_traced_fields_keep_script_values_alive() {
    let (rt, ctx) = new_ctx();

    let holder = Rc::new(RefCell::new(Holder { kept: Traced::new() }));
    ctx.global()
        .set("holder", Value::of(&ctx, holder.clone()))
        .unwrap();

    let payload = eval(&ctx, "({ tag: 7 });");
    let weak = payload.downgrade();
    holder.borrow().kept.store(&payload);
    drop(payload);

    rt.collect();
    let kept = holder.borrow().kept.load(&ctx).expect("traced cell holds it");
    assert_eq!(kept.get("tag").unwrap().to_native::<i32>().unwrap(), 7);
    drop(kept);

    holder.borrow().kept.clear();
    rt.collect();
    assert!(weak.upgrade(&ctx).is_none());
    assert!(holder.borrow().kept.is_empty());
}

// =============================================================================
// Native functions
// =============================================================================

#[test]
fn test_script_functions_convert_and_call_back() {
    let (_rt, ctx) = new_ctx();
    let apply_twice = Value::function(
        &ctx,
        "applyTwice",
        |f: ScriptFunction, seed: i32| -> ScriptResult<i32> {
            let once: i32 = f.call((seed,))?;
            f.call((once,))
        },
    );
    ctx.global().set("applyTwice", &apply_twice).unwrap();

    let out = eval(&ctx, "applyTwice(n => n * 3, 2);");
    assert_eq!(out.to_native::<i32>().unwrap(), 18);
}

#[test]
fn test_missing_args_fill_and_extras_drop() {
    let (_rt, ctx) = new_ctx();
    let describe = Value::function(&ctx, "describe", |name: String, title: Option<String>| {
        match title {
            Some(title) => format!("{title} {name}"),
            None => name,
        }
    });
    ctx.global().set("describe", &describe).unwrap();

    let plain = eval(&ctx, r#"describe("ada");"#);
    assert_eq!(plain.to_native::<String>().unwrap(), "ada");

    let titled = eval(&ctx, r#"describe("ada", "dr", "ignored", 4);"#);
    assert_eq!(titled.to_native::<String>().unwrap(), "dr ada");
}

#[test]
fn test_raw_functions_see_this_and_args_unconverted() {
    let (_rt, ctx) = new_ctx();
    let probe = Value::raw_function(&ctx, "probe", |ctx, this, args| {
        let report = Value::object(ctx);
        report.set("tag", this.get("tag")?)?;
        report.set("argc", args.len() as i32)?;
        let first_is_receiver = args
            .first()
            .map(|arg| arg.strict_equals(this))
            .unwrap_or(false);
        report.set("firstIsReceiver", first_is_receiver)?;
        Ok(report)
    });
    ctx.global().set("probe", &probe).unwrap();

    let report = eval(
        &ctx,
        r#"
        const carrier = { tag: 41, probe: probe };
        carrier.probe(carrier, "extra");
        "#,
    );
    assert_eq!(report.get("tag").unwrap().to_native::<i32>().unwrap(), 41);
    assert_eq!(report.get("argc").unwrap().to_native::<i32>().unwrap(), 2);
    let first = report.get("firstIsReceiver").unwrap();
    assert!(first.to_native::<bool>().unwrap());
}
