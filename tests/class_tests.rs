use std::cell::{Cell, RefCell};
use std::rc::Rc;

use quickbind::{
    ClassBuilder, ClassKind, Context, EvalFlags, Runtime, ScriptClass, Value, WeakValue,
};

fn new_ctx() -> (Runtime, Context) {
    let rt = Runtime::new();
    let ctx = Context::new(&rt);
    (rt, ctx)
}

// ============================================================================
// Lifetime
// ============================================================================

struct Tracked {
    drops: Rc<Cell<u32>>,
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.drops.set(self.drops.get() + 1);
    }
}

impl ScriptClass for Tracked {
    const NAME: &'static str = "Tracked";
}

#[test]
fn test_managed_instances_drop_only_after_unreachable_and_collect() {
    let (rt, ctx) = new_ctx();
    let drops = Rc::new(Cell::new(0));

    let wrapped = Value::from_instance(&ctx, Tracked { drops: drops.clone() });
    rt.collect();
    assert_eq!(drops.get(), 0, "reachable instances must survive collection");

    drop(wrapped);
    assert_eq!(drops.get(), 0, "unreachable is not enough without a pass");

    rt.collect();
    assert_eq!(drops.get(), 1);
}

struct HostOwned {
    drops: Rc<Cell<u32>>,
}

impl Drop for HostOwned {
    fn drop(&mut self) {
        self.drops.set(self.drops.get() + 1);
    }
}

impl ScriptClass for HostOwned {
    const NAME: &'static str = "HostOwned";
    const KIND: ClassKind = ClassKind::Unmanaged;
}

#[test]
fn test_unmanaged_instances_are_never_deleted_by_the_engine() {
    let (rt, ctx) = new_ctx();
    let drops = Rc::new(Cell::new(0));
    let host = Rc::new(RefCell::new(HostOwned { drops: drops.clone() }));

    let wrapped = Value::of(&ctx, host.clone());
    drop(wrapped);
    rt.collect();
    rt.collect();

    assert_eq!(drops.get(), 0);
    assert_eq!(Rc::strong_count(&host), 1, "the engine released its handle");
}

// ============================================================================
// Field, method, and constructor binding
// ============================================================================

struct Widget {
    x: i32,
    y: f64,
    log: Rc<RefCell<Vec<String>>>,
}

impl ScriptClass for Widget {
    const NAME: &'static str = "Widget";
}

fn install_widget(ctx: &Context, log: &Rc<RefCell<Vec<String>>>) {
    let ctor_log = log.clone();
    ClassBuilder::<Widget>::new(ctx)
        .ctor(move |x: i32, y: f64| Widget {
            x,
            y,
            log: ctor_log.clone(),
        })
        .unwrap()
        .property("x", |w: &Widget| w.x, |w: &mut Widget, v: i32| w.x = v)
        .unwrap()
        .property_get("y", |w: &Widget| w.y)
        .unwrap()
        .method("wawa", |w: &Widget, message: String| {
            w.log.borrow_mut().push(message);
        })
        .unwrap()
        .build_object(&ctx.global())
        .unwrap();
}

#[test]
fn test_script_drives_a_bound_class_end_to_end() {
    let (_rt, ctx) = new_ctx();
    let log = Rc::new(RefCell::new(Vec::new()));
    install_widget(&ctx, &log);

    let out = ctx
        .eval(
            "test",
            r#"
            const w = new Widget(2, 2.5);
            if (w.x !== 2) throw new Error("x should start at 2");
            w.x = w.x + 1;
            if (w.x !== 3) throw new Error("x should now be 3");
            w.wawa("hi");
            w.y;
            "#,
            EvalFlags::empty(),
        )
        .unwrap();

    assert_eq!(out.to_native::<f64>().unwrap(), 2.5);
    assert_eq!(*log.borrow(), vec!["hi".to_string()]);
}

#[test]
fn test_read_only_fields_reject_script_writes() {
    let (_rt, ctx) = new_ctx();
    let log = Rc::new(RefCell::new(Vec::new()));
    install_widget(&ctx, &log);

    let err = ctx
        .eval(
            "test",
            "const w = new Widget(1, 1.5); w.y = 9.0;",
            EvalFlags::empty(),
        )
        .unwrap_err();
    assert!(err.message().contains("only has a getter"));
}

// ============================================================================
// Instance arguments
// ============================================================================

#[test]
fn test_instance_vectors_convert_or_fail_atomically() {
    let (_rt, ctx) = new_ctx();
    let log = Rc::new(RefCell::new(Vec::new()));
    install_widget(&ctx, &log);

    let calls = Rc::new(Cell::new(0u32));
    let seen = calls.clone();
    let total = Value::function(&ctx, "total", move |items: Vec<Rc<RefCell<Widget>>>| {
        seen.set(seen.get() + 1);
        items.iter().map(|w| w.borrow().x).sum::<i32>()
    });
    ctx.global().set("total", &total).unwrap();

    let out = ctx
        .eval(
            "test",
            "total([new Widget(1, 0.0), new Widget(2, 0.0)]);",
            EvalFlags::empty(),
        )
        .unwrap();
    assert_eq!(out.to_native::<i32>().unwrap(), 3);
    assert_eq!(calls.get(), 1);

    let err = ctx
        .eval(
            "test2",
            "total([new Widget(1, 0.0), 99]);",
            EvalFlags::empty(),
        )
        .unwrap_err();
    assert!(err.message().contains("expected Widget"));
    assert_eq!(calls.get(), 1, "the failing call must not run the body");
}

// ============================================================================
// Script identity
// ============================================================================

struct Node {
    this_ref: WeakValue,
}

impl ScriptClass for Node {
    const NAME: &'static str = "Node";

    fn this_slot(&mut self) -> Option<&mut WeakValue> {
        Some(&mut self.this_ref)
    }
}

#[test]
fn test_back_reference_recovers_the_same_script_identity() {
    let (_rt, ctx) = new_ctx();

    ClassBuilder::<Node>::new(&ctx)
        .ctor(|| Node {
            this_ref: WeakValue::empty(),
        })
        .unwrap()
        .build_object(&ctx.global())
        .unwrap();

    let stash: Rc<RefCell<Option<Rc<RefCell<Node>>>>> = Rc::new(RefCell::new(None));
    let adopt_stash = stash.clone();
    let adopt = Value::function(&ctx, "adopt", move |node: Rc<RefCell<Node>>| {
        *adopt_stash.borrow_mut() = Some(node);
    });
    ctx.global().set("adopt", &adopt).unwrap();

    let recover_stash = stash.clone();
    let recover = Value::raw_function(&ctx, "recover", move |ctx, _this, _args| {
        let held = recover_stash.borrow();
        let node = held.as_ref().expect("adopt runs first");
        let this_ref = node.borrow().this_ref;
        Ok(this_ref.upgrade(ctx).expect("wrapper is still alive"))
    });
    ctx.global().set("recover", &recover).unwrap();

    let same = ctx
        .eval(
            "test",
            "const n = new Node(); adopt(n); recover() === n;",
            EvalFlags::empty(),
        )
        .unwrap();
    assert!(same.to_native::<bool>().unwrap());
}

#[test]
fn test_instances_share_their_constructor_prototype() {
    let (_rt, ctx) = new_ctx();
    let log = Rc::new(RefCell::new(Vec::new()));
    install_widget(&ctx, &log);

    let a = ctx
        .eval("test", "new Widget(0, 0.0);", EvalFlags::empty())
        .unwrap();
    let b = ctx
        .eval("test2", "new Widget(1, 1.0);", EvalFlags::empty())
        .unwrap();

    let proto = a.prototype().expect("instances carry a prototype");
    assert!(proto.strict_equals(&b.prototype().unwrap()));

    let ctor_proto = ctx
        .global()
        .get("Widget")
        .unwrap()
        .get("prototype")
        .unwrap();
    assert!(proto.strict_equals(&ctor_proto));
    assert!(Value::of(&ctx, 5).prototype().is_none());
}
