//! Integration tests for the module system: native export tables,
//! loader-backed source modules, and the import machinery that ties the
//! two together.

use quickbind::{
    ClassBuilder, Context, EvalFlags, MemoryLoader, Runtime, ScriptClass, Value,
};

fn new_ctx() -> (Runtime, Context) {
    let rt = Runtime::new();
    let ctx = Context::new(&rt);
    (rt, ctx)
}

fn global_i32(ctx: &Context, name: &str) -> i32 {
    ctx.global().get(name).unwrap().to_native::<i32>().unwrap()
}

// =============================================================================
// Native modules
// =============================================================================

struct Point {
    x: i32,
    y: i32,
}

impl ScriptClass for Point {
    const NAME: &'static str = "Point";
}

#[test]
fn test_native_class_exports_work_like_globals() {
    let (_rt, ctx) = new_ctx();

    let mut module = ctx.new_module("shapes").unwrap();
    ClassBuilder::<Point>::new(&ctx)
        .ctor(|x: i32, y: i32| Point { x, y })
        .unwrap()
        .method("norm1", |p: &Point| p.x.abs() + p.y.abs())
        .unwrap()
        .build_module(&mut module)
        .unwrap();

    ctx.eval(
        "app",
        r#"
        import { Point } from "shapes";
        const p = new Point(3, -4);
        globalThis.norm = p.norm1();
        "#,
        EvalFlags::MODULE,
    )
    .unwrap();

    assert_eq!(global_i32(&ctx, "norm"), 7);
}

#[test]
fn test_import_renames_bind_the_local_name() {
    let (_rt, ctx) = new_ctx();

    let mut module = ctx.new_module("answers").unwrap();
    module.add_export("answer", &Value::of(&ctx, 42)).unwrap();

    ctx.eval(
        "app",
        r#"
        import { answer as a } from "answers";
        globalThis.copied = a;
        "#,
        EvalFlags::MODULE,
    )
    .unwrap();

    assert_eq!(global_i32(&ctx, "copied"), 42);
}

#[test]
fn test_native_modules_seal_once_imported() {
    let (_rt, ctx) = new_ctx();

    let mut module = ctx.new_module("tools").unwrap();
    module.add_export("one", &Value::of(&ctx, 1)).unwrap();
    ctx.eval("use", r#"import { one } from "tools";"#, EvalFlags::MODULE)
        .unwrap();

    let err = module.add_export("two", &Value::of(&ctx, 2)).unwrap_err();
    assert!(err.message().contains("already loaded"));
}

#[test]
fn test_missing_exports_are_a_syntax_error() {
    let (_rt, ctx) = new_ctx();

    let mut module = ctx.new_module("math").unwrap();
    module
        .add_export("pi", &Value::of(&ctx, std::f64::consts::PI))
        .unwrap();

    let err = ctx
        .eval("app", r#"import { tau } from "math";"#, EvalFlags::MODULE)
        .unwrap_err();
    assert!(err.message().contains("SyntaxError"));
    assert!(err.message().contains("does not export 'tau'"));
}

// =============================================================================
// Loader-backed source modules
// =============================================================================

#[test]
fn test_relative_imports_resolve_against_the_importing_module() {
    let (rt, ctx) = new_ctx();
    rt.set_module_loader(MemoryLoader::new().with_source(
        "app/util.js",
        "export function plus(a, b) { return a + b; }",
    ));

    ctx.load_module(
        "app/main.js",
        r#"
        import { plus } from "./util.js";
        globalThis.sum = plus(2, 3);
        "#,
        true,
    )
    .unwrap();

    assert_eq!(global_i32(&ctx, "sum"), 5);
}

#[test]
fn test_loaded_sources_can_import_native_modules() {
    let (rt, ctx) = new_ctx();

    let mut units = ctx.new_module("units").unwrap();
    units
        .add_export("KM_PER_MILE", &Value::of(&ctx, 1.609_34))
        .unwrap();

    rt.set_module_loader(MemoryLoader::new().with_source(
        "geo/convert.js",
        r#"
        import { KM_PER_MILE } from "units";
        export function toKm(miles) { return miles * KM_PER_MILE; }
        "#,
    ));

    ctx.load_module(
        "geo/main.js",
        r#"
        import { toKm } from "./convert.js";
        globalThis.km = toKm(10);
        "#,
        true,
    )
    .unwrap();

    let km = ctx.global().get("km").unwrap().to_native::<f64>().unwrap();
    assert!((km - 16.0934).abs() < 1e-9);
}

#[test]
fn test_module_bodies_run_once_across_importers() {
    let (rt, ctx) = new_ctx();
    rt.set_module_loader(MemoryLoader::new().with_source(
        "counter",
        "globalThis.loads = globalThis.loads + 1; export let ready = true;",
    ));
    ctx.global().set("loads", 0).unwrap();

    ctx.eval("first", r#"import "counter";"#, EvalFlags::MODULE)
        .unwrap();
    ctx.eval("second", r#"import { ready } from "counter";"#, EvalFlags::MODULE)
        .unwrap();

    assert_eq!(global_i32(&ctx, "loads"), 1);
}

#[test]
fn test_import_meta_reports_url_and_main() {
    let (rt, ctx) = new_ctx();
    rt.set_module_loader(MemoryLoader::new().with_source(
        "app/dep.js",
        "export let depIsMain = import.meta.main;",
    ));

    ctx.load_module(
        "app/main.js",
        r#"
        import { depIsMain } from "./dep.js";
        globalThis.url = import.meta.url;
        globalThis.entry = import.meta.main;
        globalThis.depEntry = depIsMain;
        "#,
        true,
    )
    .unwrap();

    let url = ctx.global().get("url").unwrap().to_native::<String>().unwrap();
    assert_eq!(url, "app/main.js");
    assert!(ctx.global().get("entry").unwrap().to_native::<bool>().unwrap());
    assert!(!ctx.global().get("depEntry").unwrap().to_native::<bool>().unwrap());
}

// =============================================================================
// Failure modes
// =============================================================================

#[test]
fn test_unknown_modules_are_reported() {
    let (_rt, ctx) = new_ctx();
    let err = ctx
        .eval("app", r#"import { x } from "ghost";"#, EvalFlags::MODULE)
        .unwrap_err();
    assert!(err.message().contains("module 'ghost' not found"));
}

#[test]
fn test_cyclic_imports_are_reported() {
    let (rt, ctx) = new_ctx();
    rt.set_module_loader(
        MemoryLoader::new()
            .with_source("a", r#"import { b } from "b"; export let a = 1;"#)
            .with_source("b", r#"import { a } from "a"; export let b = 2;"#),
    );

    let err = ctx
        .eval("app", r#"import { a } from "a";"#, EvalFlags::MODULE)
        .unwrap_err();
    assert!(err.message().contains("cyclic import of module 'a'"));
}

#[test]
fn test_failed_modules_stay_failed() {
    let (rt, ctx) = new_ctx();
    rt.set_module_loader(
        MemoryLoader::new().with_source("bad", r#"throw new Error("boom");"#),
    );

    let first = ctx
        .eval("one", r#"import "bad";"#, EvalFlags::MODULE)
        .unwrap_err();
    assert!(first.message().contains("boom"));

    let second = ctx
        .eval("two", r#"import "bad";"#, EvalFlags::MODULE)
        .unwrap_err();
    assert!(second.message().contains("previously failed to load"));
}
