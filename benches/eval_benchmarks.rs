//! Performance benchmarks for the embedded engine:
//! - Parsing: compile-only evaluation of scripts of varying shape
//! - Programs: interpreter throughput on loop- and call-heavy code
//! - Bindings: native call and property dispatch round trips
//! - Collection: sweep cost over populated heaps

use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use quickbind::{ClassBuilder, Context, EvalFlags, Runtime, ScriptClass, Value};
use std::hint::black_box;

const ARITHMETIC: &str = r#"
    let total = 0;
    for (let i = 0; i < 100; i += 1) {
        total += i * 3 % 7;
    }
    total;
"#;

const CALL_HEAVY: &str = r#"
    function fib(n) {
        if (n < 2) {
            return n;
        }
        return fib(n - 1) + fib(n - 2);
    }
    fib(15);
"#;

const OBJECT_CHURN: &str = r#"
    let last = 0;
    for (let i = 0; i < 50; i += 1) {
        const point = { x: i, y: i * 2 };
        last = point.x + point.y;
    }
    last;
"#;

fn new_ctx() -> (Runtime, Context) {
    let rt = Runtime::new();
    let ctx = Context::new(&rt);
    (rt, ctx)
}

/// Parse-only throughput, no evaluation.
fn parse_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("eval/parse");
    let (_rt, ctx) = new_ctx();

    for (name, source) in [
        ("arithmetic", ARITHMETIC),
        ("call_heavy", CALL_HEAVY),
        ("object_churn", OBJECT_CHURN),
    ] {
        group.throughput(Throughput::Bytes(source.len() as u64));
        group.bench_function(name, |b| {
            b.iter(|| {
                ctx.eval("bench", black_box(source), EvalFlags::COMPILE_ONLY)
                    .unwrap()
            });
        });
    }

    group.finish();
}

/// Interpreter throughput on complete programs.
fn program_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("eval/programs");

    let (_rt, ctx) = new_ctx();
    group.bench_function("arithmetic_loop", |b| {
        b.iter(|| {
            ctx.eval("bench", black_box(ARITHMETIC), EvalFlags::empty())
                .unwrap()
        });
    });

    group.bench_function("recursive_calls", |b| {
        b.iter(|| {
            ctx.eval("bench", black_box(CALL_HEAVY), EvalFlags::empty())
                .unwrap()
        });
    });

    group.bench_function("object_churn", |b| {
        b.iter(|| {
            ctx.eval("bench", black_box(OBJECT_CHURN), EvalFlags::empty())
                .unwrap()
        });
    });

    group.finish();
}

struct Vec2 {
    x: f64,
    y: f64,
}

impl ScriptClass for Vec2 {
    const NAME: &'static str = "Vec2";
}

/// Native boundary crossings: free functions, methods, and conversions.
fn binding_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("eval/bindings");

    let (_rt, ctx) = new_ctx();
    let add = Value::function(&ctx, "add", |a: i32, b: i32| a + b);
    ctx.global().set("add", &add).unwrap();
    ClassBuilder::<Vec2>::new(&ctx)
        .ctor(|x: f64, y: f64| Vec2 { x, y })
        .unwrap()
        .property_get("len2", |v: &Vec2| v.x * v.x + v.y * v.y)
        .unwrap()
        .method("scaled", |v: &Vec2, k: f64| v.x * k + v.y * k)
        .unwrap()
        .build_object(&ctx.global())
        .unwrap();

    group.bench_function("native_call", |b| {
        b.iter(|| {
            ctx.eval(
                "bench",
                black_box("let n = 0; for (let i = 0; i < 100; i += 1) { n = add(n, i); } n;"),
                EvalFlags::empty(),
            )
            .unwrap()
        });
    });

    group.bench_function("method_dispatch", |b| {
        b.iter(|| {
            ctx.eval(
                "bench",
                black_box("const v = new Vec2(3.0, 4.0); v.scaled(2.0) + v.len2;"),
                EvalFlags::empty(),
            )
            .unwrap()
        });
    });

    group.bench_function("array_unwrap", |b| {
        let array = ctx
            .eval(
                "setup",
                "let a = []; for (let i = 0; i < 100; i += 1) { a[i] = i; } a;",
                EvalFlags::empty(),
            )
            .unwrap();
        b.iter(|| black_box(&array).to_native::<Vec<i32>>().unwrap());
    });

    group.finish();
}

/// Mark and sweep cost on a heap with a mix of live and dead values.
fn collection_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("eval/collection");

    group.bench_function("sweep_after_churn", |b| {
        let (rt, ctx) = new_ctx();
        b.iter(|| {
            ctx.eval("bench", OBJECT_CHURN, EvalFlags::empty()).unwrap();
            black_box(rt.collect())
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    parse_benchmarks,
    program_benchmarks,
    binding_benchmarks,
    collection_benchmarks
);

criterion_main!(benches);
