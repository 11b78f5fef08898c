//! Tree-walking evaluator.
//!
//! Expressions evaluate to raw values; statements evaluate to a
//! [`Completion`] so `return`, `break`, and `continue` unwind through
//! enclosing constructs. Exceptions travel through `Result`, which makes
//! `?` the only abrupt-exit path and keeps every intermediate failure an
//! explicit value.
//!
//! Unrooted intermediates are safe here: collection is explicit and
//! refuses to run while any script or native frame is active.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use rustc_hash::FxHashMap;

use crate::context::Context;
use crate::engine::ast::*;
use crate::engine::modules::{self, ModuleId};
use crate::engine::object::{
    FuncData, FuncKind, NativeFunc, ObjectData, ObjectKind, PromiseState, PropSlot, RawValue,
    Reaction, SlotId,
};
use crate::error::{Exception, ScriptResult};
use crate::runtime::{Job, JobKind, RuntimeInner};
use crate::value::{PropKey, Value};

// ============================================================================
// Environments
// ============================================================================

struct Binding {
    value: RawValue,
    mutable: bool,
}

pub(crate) enum AssignOutcome {
    Assigned,
    NotFound,
    ImmutableBinding,
}

/// A lexical scope. Closures capture their defining environment; blocks
/// and calls push children.
pub(crate) struct Env {
    vars: RefCell<FxHashMap<String, Binding>>,
    parent: Option<Rc<Env>>,
    /// `Some` for call scopes, `None` for scopes that inherit `this`.
    this_val: Option<RawValue>,
    module: Option<ModuleId>,
}

impl Env {
    pub(crate) fn new_root(module: Option<ModuleId>) -> Rc<Env> {
        Rc::new(Env {
            vars: RefCell::new(FxHashMap::default()),
            parent: None,
            this_val: Some(RawValue::Undefined),
            module,
        })
    }

    fn child(parent: &Rc<Env>) -> Rc<Env> {
        Rc::new(Env {
            vars: RefCell::new(FxHashMap::default()),
            parent: Some(parent.clone()),
            this_val: None,
            module: parent.module,
        })
    }

    fn child_with_this(parent: &Rc<Env>, this: RawValue) -> Rc<Env> {
        Rc::new(Env {
            vars: RefCell::new(FxHashMap::default()),
            parent: Some(parent.clone()),
            this_val: Some(this),
            module: parent.module,
        })
    }

    pub(crate) fn define(&self, name: &str, value: RawValue, mutable: bool) {
        self.vars
            .borrow_mut()
            .insert(name.to_string(), Binding { value, mutable });
    }

    pub(crate) fn lookup(&self, name: &str) -> Option<RawValue> {
        if let Some(binding) = self.vars.borrow().get(name) {
            return Some(binding.value);
        }
        self.parent.as_ref().and_then(|p| p.lookup(name))
    }

    fn assign(&self, name: &str, value: RawValue) -> AssignOutcome {
        if let Some(binding) = self.vars.borrow_mut().get_mut(name) {
            if !binding.mutable {
                return AssignOutcome::ImmutableBinding;
            }
            binding.value = value;
            return AssignOutcome::Assigned;
        }
        match &self.parent {
            Some(parent) => parent.assign(name, value),
            None => AssignOutcome::NotFound,
        }
    }

    fn this(&self) -> RawValue {
        match self.this_val {
            Some(raw) => raw,
            None => self
                .parent
                .as_ref()
                .map(|p| p.this())
                .unwrap_or(RawValue::Undefined),
        }
    }

    #[inline]
    fn module(&self) -> Option<ModuleId> {
        self.module
    }

    /// Feed every value reachable from this scope chain to the collector.
    pub(crate) fn trace_into(&self, push: &mut dyn FnMut(RawValue)) {
        for binding in self.vars.borrow().values() {
            push(binding.value);
        }
        if let Some(this) = self.this_val {
            push(this);
        }
        if let Some(parent) = &self.parent {
            parent.trace_into(push);
        }
    }
}

/// How a statement finished.
pub(crate) enum Completion {
    Normal(RawValue),
    Return(RawValue),
    Break,
    Continue,
}

// ============================================================================
// Re-entrancy guard
// ============================================================================

/// Marks the runtime as executing for the duration of a frame. Collection
/// is refused while any guard is alive, and the frame count doubles as the
/// call depth limit.
struct ExecGuard<'a> {
    depth: &'a Cell<u32>,
}

impl<'a> ExecGuard<'a> {
    fn enter(ctx: &'a Context) -> ScriptResult<Self> {
        let rt: &RuntimeInner = &ctx.inner.rt;
        let depth = rt.exec_depth();
        if depth.get() >= rt.config().max_stack_depth {
            return Err(Exception::range_error(
                ctx,
                "maximum call stack size exceeded",
            ));
        }
        depth.set(depth.get() + 1);
        Ok(Self { depth })
    }
}

impl Drop for ExecGuard<'_> {
    fn drop(&mut self) {
        self.depth.set(self.depth.get() - 1);
    }
}

// ============================================================================
// Program entry points
// ============================================================================

/// Evaluate a script program. The result is the value of the last
/// expression statement, or `undefined`.
#[cfg_attr(feature = "profiling", profiling::function)]
pub(crate) fn run_script(ctx: &Context, program: &Program) -> ScriptResult<RawValue> {
    let _guard = ExecGuard::enter(ctx)?;
    let env = Env::new_root(None);
    let mut completion = RawValue::Undefined;

    hoist_functions(
        ctx,
        program.items.iter().filter_map(|item| match item {
            Item::Stmt(stmt) => Some(stmt),
            _ => None,
        }),
        &env,
    );

    for item in &program.items {
        let stmt = match item {
            Item::Stmt(stmt) => stmt,
            // The parser rejects module items in script mode.
            _ => continue,
        };
        let is_expr = matches!(stmt, Stmt::Expr(_));
        match eval_stmt(ctx, stmt, &env)? {
            Completion::Normal(value) => {
                if is_expr {
                    completion = value;
                }
            }
            Completion::Return(_) => {
                return Err(Exception::syntax_error(ctx, "return outside of function"));
            }
            Completion::Break | Completion::Continue => {
                return Err(Exception::syntax_error(
                    ctx,
                    "break or continue outside of loop",
                ));
            }
        }
    }
    Ok(completion)
}

/// Define hoisted function declarations ahead of sequential execution.
pub(crate) fn hoist_functions<'a>(
    ctx: &Context,
    stmts: impl Iterator<Item = &'a Stmt>,
    env: &Rc<Env>,
) {
    for stmt in stmts {
        if let Stmt::Function(def) = stmt {
            let closure = make_closure(ctx, def, env);
            if let Some(name) = &def.name {
                env.define(name, closure, false);
            }
        }
    }
}

/// Evaluate the body of a module item by item. Used by the module linker,
/// which prepares `env` with the imported bindings.
pub(crate) fn eval_module_items(ctx: &Context, program: &Program, env: &Rc<Env>) -> ScriptResult<()> {
    let _guard = ExecGuard::enter(ctx)?;

    hoist_functions(
        ctx,
        program.items.iter().filter_map(|item| match item {
            Item::Stmt(stmt) => Some(stmt),
            Item::Export(decl) => decl.stmt.as_ref(),
            Item::Import(_) => None,
        }),
        env,
    );

    for item in &program.items {
        let stmt = match item {
            Item::Stmt(stmt) => stmt,
            Item::Export(decl) => match &decl.stmt {
                Some(stmt) => stmt,
                None => continue,
            },
            Item::Import(_) => continue,
        };
        match eval_stmt(ctx, stmt, env)? {
            Completion::Normal(_) => {}
            Completion::Return(_) => {
                return Err(Exception::syntax_error(ctx, "return outside of function"));
            }
            Completion::Break | Completion::Continue => {
                return Err(Exception::syntax_error(
                    ctx,
                    "break or continue outside of loop",
                ));
            }
        }
    }
    Ok(())
}

// ============================================================================
// Statements
// ============================================================================

fn eval_stmts(ctx: &Context, stmts: &[Stmt], env: &Rc<Env>) -> ScriptResult<Completion> {
    hoist_functions(ctx, stmts.iter(), env);
    for stmt in stmts {
        match eval_stmt(ctx, stmt, env)? {
            Completion::Normal(_) => {}
            abrupt => return Ok(abrupt),
        }
    }
    Ok(Completion::Normal(RawValue::Undefined))
}

fn eval_stmt(ctx: &Context, stmt: &Stmt, env: &Rc<Env>) -> ScriptResult<Completion> {
    match stmt {
        Stmt::Empty => Ok(Completion::Normal(RawValue::Undefined)),
        Stmt::Expr(expr) => {
            let value = eval_expr(ctx, expr, env)?;
            Ok(Completion::Normal(value))
        }
        Stmt::Let {
            name,
            init,
            mutable,
            ..
        } => {
            let value = match init {
                Some(expr) => eval_expr(ctx, expr, env)?,
                None => RawValue::Undefined,
            };
            env.define(name, value, *mutable);
            Ok(Completion::Normal(RawValue::Undefined))
        }
        // Defined during hoisting.
        Stmt::Function(_) => Ok(Completion::Normal(RawValue::Undefined)),
        Stmt::Block(stmts) => {
            let scope = Env::child(env);
            eval_stmts(ctx, stmts, &scope)
        }
        Stmt::If {
            cond,
            then_branch,
            else_branch,
        } => {
            let cond = eval_expr(ctx, cond, env)?;
            if truthy(ctx, cond) {
                eval_stmt(ctx, then_branch, env)
            } else if let Some(else_branch) = else_branch {
                eval_stmt(ctx, else_branch, env)
            } else {
                Ok(Completion::Normal(RawValue::Undefined))
            }
        }
        Stmt::While { cond, body } => {
            loop {
                let test = eval_expr(ctx, cond, env)?;
                if !truthy(ctx, test) {
                    break;
                }
                match eval_stmt(ctx, body, env)? {
                    Completion::Normal(_) | Completion::Continue => {}
                    Completion::Break => break,
                    ret @ Completion::Return(_) => return Ok(ret),
                }
            }
            Ok(Completion::Normal(RawValue::Undefined))
        }
        Stmt::For {
            init,
            cond,
            update,
            body,
        } => {
            let scope = Env::child(env);
            if let Some(init) = init {
                eval_stmt(ctx, init, &scope)?;
            }
            loop {
                if let Some(cond) = cond {
                    let test = eval_expr(ctx, cond, &scope)?;
                    if !truthy(ctx, test) {
                        break;
                    }
                }
                match eval_stmt(ctx, body, &scope)? {
                    Completion::Normal(_) | Completion::Continue => {}
                    Completion::Break => break,
                    ret @ Completion::Return(_) => return Ok(ret),
                }
                if let Some(update) = update {
                    eval_expr(ctx, update, &scope)?;
                }
            }
            Ok(Completion::Normal(RawValue::Undefined))
        }
        Stmt::Return { value, .. } => {
            let value = match value {
                Some(expr) => eval_expr(ctx, expr, env)?,
                None => RawValue::Undefined,
            };
            Ok(Completion::Return(value))
        }
        Stmt::Break(_) => Ok(Completion::Break),
        Stmt::Continue(_) => Ok(Completion::Continue),
        Stmt::Throw(expr) => {
            let value = eval_expr(ctx, expr, env)?;
            Err(Exception::from_value(Value::from_raw(ctx, value)))
        }
        Stmt::Try {
            block,
            param,
            handler,
        } => {
            let scope = Env::child(env);
            match eval_stmts(ctx, block, &scope) {
                Ok(completion) => Ok(completion),
                Err(exception) => {
                    let scope = Env::child(env);
                    if let Some(param) = param {
                        scope.define(param, exception.value().raw(), true);
                    }
                    eval_stmts(ctx, handler, &scope)
                }
            }
        }
    }
}

// ============================================================================
// Expressions
// ============================================================================

fn eval_expr(ctx: &Context, expr: &Expr, env: &Rc<Env>) -> ScriptResult<RawValue> {
    match expr {
        Expr::Int(v) => Ok(RawValue::Int(*v)),
        Expr::Float(v) => Ok(RawValue::Float(*v)),
        Expr::Bool(v) => Ok(RawValue::Bool(*v)),
        Expr::Null => Ok(RawValue::Null),
        Expr::Str(s) => Ok(RawValue::Handle(ctx.inner.rt.heap.alloc_string(s))),
        Expr::Ident(name, _) => resolve_ident(ctx, name, env),
        Expr::Array(elements) => {
            let mut values = Vec::with_capacity(elements.len());
            for element in elements {
                values.push(eval_expr(ctx, element, env)?);
            }
            Ok(RawValue::Handle(
                ctx.inner.rt.heap.alloc_object(ObjectData::array(values)),
            ))
        }
        Expr::Object(props) => {
            let mut data = ObjectData::plain();
            for (key, value_expr) in props {
                let value = eval_expr(ctx, value_expr, env)?;
                data.props.insert(key.clone(), PropSlot::Data(value));
            }
            Ok(RawValue::Handle(ctx.inner.rt.heap.alloc_object(data)))
        }
        Expr::Function(def) => Ok(make_closure(ctx, def, env)),
        Expr::Member {
            object, property, ..
        } => {
            let target = eval_expr(ctx, object, env)?;
            get_prop(ctx, target, PropKey::Name(property))
        }
        Expr::Index { object, index, .. } => {
            let target = eval_expr(ctx, object, env)?;
            let index = eval_expr(ctx, index, env)?;
            let key = OwnedKey::from_raw(ctx, index);
            get_prop(ctx, target, key.as_key())
        }
        Expr::Call { callee, args, .. } => {
            let (func, this) = match callee.as_ref() {
                Expr::Member {
                    object, property, ..
                } => {
                    let target = eval_expr(ctx, object, env)?;
                    let func = get_prop(ctx, target, PropKey::Name(property))?;
                    (func, target)
                }
                Expr::Index { object, index, .. } => {
                    let target = eval_expr(ctx, object, env)?;
                    let index = eval_expr(ctx, index, env)?;
                    let key = OwnedKey::from_raw(ctx, index);
                    let func = get_prop(ctx, target, key.as_key())?;
                    (func, target)
                }
                _ => (eval_expr(ctx, callee, env)?, RawValue::Undefined),
            };
            let arg_values = eval_args(ctx, args, env)?;
            call_value(ctx, func, this, &arg_values)
        }
        Expr::New { callee, args, .. } => {
            let func = eval_expr(ctx, callee, env)?;
            let arg_values = eval_args(ctx, args, env)?;
            construct(ctx, func, &arg_values)
        }
        Expr::Assign {
            target, op, value, ..
        } => eval_assign(ctx, target, *op, value, env),
        Expr::Binary { op, lhs, rhs } => {
            let l = eval_expr(ctx, lhs, env)?;
            let r = eval_expr(ctx, rhs, env)?;
            binary_op(ctx, *op, l, r)
        }
        Expr::Logical { op, lhs, rhs } => {
            let l = eval_expr(ctx, lhs, env)?;
            let take_lhs = match op {
                LogicalOp::And => !truthy(ctx, l),
                LogicalOp::Or => truthy(ctx, l),
            };
            if take_lhs {
                Ok(l)
            } else {
                eval_expr(ctx, rhs, env)
            }
        }
        Expr::Unary { op, operand } => match op {
            UnaryOp::Neg => {
                let v = eval_expr(ctx, operand, env)?;
                Ok(match v {
                    RawValue::Int(i) => match i.checked_neg() {
                        Some(n) => RawValue::Int(n),
                        None => RawValue::Float(-(i as f64)),
                    },
                    other => RawValue::Float(-to_number(ctx, other)),
                })
            }
            UnaryOp::Not => {
                let v = eval_expr(ctx, operand, env)?;
                Ok(RawValue::Bool(!truthy(ctx, v)))
            }
            UnaryOp::Typeof => {
                // `typeof` on an unresolved name reports "undefined"
                // instead of raising.
                let v = match operand.as_ref() {
                    Expr::Ident(name, _) => match resolve_ident(ctx, name, env) {
                        Ok(v) => v,
                        Err(_) => RawValue::Undefined,
                    },
                    _ => eval_expr(ctx, operand, env)?,
                };
                Ok(RawValue::Handle(
                    ctx.inner.rt.heap.alloc_string(typeof_name(ctx, v)),
                ))
            }
        },
        Expr::Conditional {
            cond,
            then_branch,
            else_branch,
        } => {
            let test = eval_expr(ctx, cond, env)?;
            if truthy(ctx, test) {
                eval_expr(ctx, then_branch, env)
            } else {
                eval_expr(ctx, else_branch, env)
            }
        }
        Expr::ImportMeta(_) => match env.module() {
            Some(id) => modules::meta_object(ctx, id),
            None => Err(Exception::syntax_error(
                ctx,
                "import.meta outside of a module",
            )),
        },
    }
}

fn eval_args(ctx: &Context, args: &[Expr], env: &Rc<Env>) -> ScriptResult<Vec<RawValue>> {
    let mut values = Vec::with_capacity(args.len());
    for arg in args {
        values.push(eval_expr(ctx, arg, env)?);
    }
    Ok(values)
}

fn resolve_ident(ctx: &Context, name: &str, env: &Rc<Env>) -> ScriptResult<RawValue> {
    if let Some(value) = env.lookup(name) {
        return Ok(value);
    }
    let global = RawValue::Handle(ctx.inner.global);
    if has_prop(ctx, global, PropKey::Name(name))? {
        return get_prop(ctx, global, PropKey::Name(name));
    }
    Err(Exception::reference_error(
        ctx,
        format!("{name} is not defined"),
    ))
}

fn eval_assign(
    ctx: &Context,
    target: &Expr,
    op: AssignOp,
    value_expr: &Expr,
    env: &Rc<Env>,
) -> ScriptResult<RawValue> {
    match target {
        Expr::Ident(name, _) => {
            let value = match op {
                AssignOp::Assign => eval_expr(ctx, value_expr, env)?,
                _ => {
                    let current = resolve_ident(ctx, name, env)?;
                    let rhs = eval_expr(ctx, value_expr, env)?;
                    binary_op(ctx, compound_binary(op), current, rhs)?
                }
            };
            match env.assign(name, value) {
                AssignOutcome::Assigned => Ok(value),
                AssignOutcome::ImmutableBinding => Err(Exception::type_error(
                    ctx,
                    format!("assignment to constant variable {name}"),
                )),
                AssignOutcome::NotFound => {
                    let global = RawValue::Handle(ctx.inner.global);
                    if has_prop(ctx, global, PropKey::Name(name))? {
                        set_prop(ctx, global, PropKey::Name(name), value)?;
                        Ok(value)
                    } else {
                        Err(Exception::reference_error(
                            ctx,
                            format!("{name} is not defined"),
                        ))
                    }
                }
            }
        }
        Expr::Member {
            object, property, ..
        } => {
            let target = eval_expr(ctx, object, env)?;
            let value = match op {
                AssignOp::Assign => eval_expr(ctx, value_expr, env)?,
                _ => {
                    let current = get_prop(ctx, target, PropKey::Name(property))?;
                    let rhs = eval_expr(ctx, value_expr, env)?;
                    binary_op(ctx, compound_binary(op), current, rhs)?
                }
            };
            set_prop(ctx, target, PropKey::Name(property), value)?;
            Ok(value)
        }
        Expr::Index { object, index, .. } => {
            let target = eval_expr(ctx, object, env)?;
            let index = eval_expr(ctx, index, env)?;
            let key = OwnedKey::from_raw(ctx, index);
            let value = match op {
                AssignOp::Assign => eval_expr(ctx, value_expr, env)?,
                _ => {
                    let current = get_prop(ctx, target, key.as_key())?;
                    let rhs = eval_expr(ctx, value_expr, env)?;
                    binary_op(ctx, compound_binary(op), current, rhs)?
                }
            };
            set_prop(ctx, target, key.as_key(), value)?;
            Ok(value)
        }
        // The parser validates assignment targets.
        _ => Err(Exception::syntax_error(ctx, "invalid assignment target")),
    }
}

fn compound_binary(op: AssignOp) -> BinaryOp {
    match op {
        AssignOp::Add => BinaryOp::Add,
        AssignOp::Sub => BinaryOp::Sub,
        AssignOp::Mul => BinaryOp::Mul,
        AssignOp::Div | AssignOp::Assign => BinaryOp::Div,
    }
}

/// Create a closure over `env`. Non-arrow functions get a fresh
/// `prototype` object with a `constructor` back-reference.
fn make_closure(ctx: &Context, def: &Rc<FuncDef>, env: &Rc<Env>) -> RawValue {
    let heap = &ctx.inner.rt.heap;
    let name = def.name.clone().unwrap_or_default();
    let func = heap.alloc_object(ObjectData::function(
        name,
        FuncKind::Script {
            def: def.clone(),
            env: env.clone(),
            module: env.module(),
        },
    ));
    if !def.is_arrow {
        let mut proto = ObjectData::plain();
        proto.props.insert(
            "constructor".to_string(),
            PropSlot::Data(RawValue::Handle(func)),
        );
        let proto = heap.alloc_object(proto);
        heap.with_object_mut(func, |data| {
            data.props
                .insert("prototype".to_string(), PropSlot::Data(RawValue::Handle(proto)));
        });
    }
    RawValue::Handle(func)
}

// ============================================================================
// Property access
// ============================================================================

/// An index expression result, normalized to a property key.
pub(crate) enum OwnedKey {
    Index(u32),
    Name(String),
}

impl OwnedKey {
    pub(crate) fn from_raw(ctx: &Context, raw: RawValue) -> Self {
        match raw {
            RawValue::Int(i) if i >= 0 => OwnedKey::Index(i as u32),
            RawValue::Float(f) if f >= 0.0 && f.fract() == 0.0 && f <= u32::MAX as f64 => {
                OwnedKey::Index(f as u32)
            }
            other => OwnedKey::Name(to_display_string(ctx, other)),
        }
    }

    pub(crate) fn as_key(&self) -> PropKey<'_> {
        match self {
            OwnedKey::Index(i) => PropKey::Index(*i),
            OwnedKey::Name(name) => PropKey::Name(name),
        }
    }
}

enum PropHit {
    Value(RawValue),
    Getter(RawValue),
    Missing,
}

fn lookup_prop_chain(ctx: &Context, start: SlotId, name: &str) -> PropHit {
    let heap = &ctx.inner.rt.heap;
    let mut current = Some(start);
    while let Some(id) = current {
        let step = heap.with_object(id, |data| match data.props.get(name) {
            Some(PropSlot::Data(raw)) => (Some(PropHit::Value(*raw)), None),
            Some(PropSlot::Accessor { getter, .. }) => (Some(PropHit::Getter(*getter)), None),
            None => (None, data.proto),
        });
        match step {
            Some((Some(hit), _)) => return hit,
            Some((None, next)) => current = next,
            None => return PropHit::Missing,
        }
    }
    PropHit::Missing
}

pub(crate) fn get_prop(ctx: &Context, target: RawValue, key: PropKey<'_>) -> ScriptResult<RawValue> {
    let heap = &ctx.inner.rt.heap;
    match target {
        RawValue::Undefined | RawValue::Uninitialized | RawValue::Null => {
            Err(Exception::type_error(
                ctx,
                format!(
                    "cannot read properties of {} (reading '{}')",
                    heap.kind_name(target),
                    key_name(&key),
                ),
            ))
        }
        RawValue::Bool(_) | RawValue::Int(_) | RawValue::Float(_) => Ok(RawValue::Undefined),
        RawValue::Handle(id) => {
            if let Some(s) = heap.string(id) {
                return Ok(string_prop(ctx, &s, &key));
            }
            // Array fast paths before the named walk.
            if let PropKey::Index(index) = key {
                let element = heap.with_object(id, |data| match &data.kind {
                    ObjectKind::Array(elements) => Some(
                        elements
                            .get(index as usize)
                            .copied()
                            .unwrap_or(RawValue::Undefined),
                    ),
                    _ => None,
                });
                if let Some(Some(element)) = element {
                    return Ok(element);
                }
            }
            let name = key_name(&key);
            if name == "length" {
                let len = heap.with_object(id, |data| match &data.kind {
                    ObjectKind::Array(elements) => Some(elements.len() as i32),
                    _ => None,
                });
                if let Some(Some(len)) = len {
                    return Ok(RawValue::Int(len));
                }
            }
            match lookup_prop_chain(ctx, id, &name) {
                PropHit::Value(raw) => Ok(raw),
                PropHit::Getter(getter) => {
                    if matches!(getter, RawValue::Undefined) {
                        Ok(RawValue::Undefined)
                    } else {
                        call_value(ctx, getter, target, &[])
                    }
                }
                PropHit::Missing => Ok(RawValue::Undefined),
            }
        }
    }
}

fn string_prop(ctx: &Context, s: &str, key: &PropKey<'_>) -> RawValue {
    match key {
        PropKey::Name("length") => RawValue::Int(s.chars().count() as i32),
        PropKey::Index(i) => match s.chars().nth(*i as usize) {
            Some(ch) => RawValue::Handle(ctx.inner.rt.heap.alloc_string(&ch.to_string())),
            None => RawValue::Undefined,
        },
        _ => RawValue::Undefined,
    }
}

fn key_name(key: &PropKey<'_>) -> String {
    match key {
        PropKey::Name(name) => (*name).to_string(),
        PropKey::Index(i) => i.to_string(),
    }
}

enum SetterHit {
    Setter(RawValue),
    GetterOnly,
    Missing,
}

fn lookup_setter_chain(ctx: &Context, start: SlotId, name: &str) -> SetterHit {
    let heap = &ctx.inner.rt.heap;
    let mut current = Some(start);
    while let Some(id) = current {
        let step = heap.with_object(id, |data| match data.props.get(name) {
            Some(PropSlot::Accessor { setter, .. }) => match setter {
                Some(setter) => (Some(SetterHit::Setter(*setter)), None),
                None => (Some(SetterHit::GetterOnly), None),
            },
            Some(PropSlot::Data(_)) => (Some(SetterHit::Missing), None),
            None => (None, data.proto),
        });
        match step {
            Some((Some(hit), _)) => return hit,
            Some((None, next)) => current = next,
            None => return SetterHit::Missing,
        }
    }
    SetterHit::Missing
}

pub(crate) fn set_prop(
    ctx: &Context,
    target: RawValue,
    key: PropKey<'_>,
    value: RawValue,
) -> ScriptResult<()> {
    let heap = &ctx.inner.rt.heap;
    let id = match target {
        RawValue::Handle(id) => id,
        other => {
            return Err(Exception::type_error(
                ctx,
                format!("cannot set properties of {}", heap.kind_name(other)),
            ));
        }
    };
    if heap.string(id).is_some() {
        return Err(Exception::type_error(ctx, "strings are immutable"));
    }

    if let PropKey::Index(index) = key {
        let handled = heap.with_object_mut(id, |data| match &mut data.kind {
            ObjectKind::Array(elements) => {
                let index = index as usize;
                if index < elements.len() {
                    elements[index] = value;
                } else {
                    elements.resize(index, RawValue::Undefined);
                    elements.push(value);
                }
                true
            }
            _ => false,
        });
        match handled {
            Some(true) => return Ok(()),
            Some(false) => {}
            None => return Err(stale_value_error(ctx)),
        }
    }

    let name = key_name(&key);
    let is_array = heap
        .with_object(id, |data| matches!(data.kind, ObjectKind::Array(_)))
        .unwrap_or(false);
    if is_array && name == "length" {
        return Err(Exception::type_error(
            ctx,
            "cannot assign to read only property 'length'",
        ));
    }

    match lookup_setter_chain(ctx, id, &name) {
        SetterHit::Setter(setter) => {
            call_value(ctx, setter, target, &[value])?;
            Ok(())
        }
        SetterHit::GetterOnly => Err(Exception::type_error(
            ctx,
            format!("cannot set property {name}, it only has a getter"),
        )),
        SetterHit::Missing => {
            let ok = heap.with_object_mut(id, |data| {
                data.props.insert(name, PropSlot::Data(value));
            });
            match ok {
                Some(()) => Ok(()),
                None => Err(stale_value_error(ctx)),
            }
        }
    }
}

pub(crate) fn has_prop(ctx: &Context, target: RawValue, key: PropKey<'_>) -> ScriptResult<bool> {
    let heap = &ctx.inner.rt.heap;
    match target {
        RawValue::Handle(id) => {
            if let Some(s) = heap.string(id) {
                return Ok(match key {
                    PropKey::Name(name) => name == "length",
                    PropKey::Index(i) => (i as usize) < s.chars().count(),
                });
            }
            if let PropKey::Index(index) = key {
                let in_array = heap.with_object(id, |data| match &data.kind {
                    ObjectKind::Array(elements) => Some((index as usize) < elements.len()),
                    _ => None,
                });
                if let Some(Some(found)) = in_array {
                    return Ok(found);
                }
            }
            let name = key_name(&key);
            if name == "length" {
                let is_array = heap
                    .with_object(id, |data| matches!(data.kind, ObjectKind::Array(_)))
                    .unwrap_or(false);
                if is_array {
                    return Ok(true);
                }
            }
            Ok(!matches!(
                lookup_prop_chain(ctx, id, &name),
                PropHit::Missing
            ))
        }
        _ => Ok(false),
    }
}

fn stale_value_error(ctx: &Context) -> Exception {
    Exception::native(ctx, crate::error::NativeError::StaleHandle)
}

// ============================================================================
// Calls
// ============================================================================

enum CallTarget {
    Script {
        def: Rc<FuncDef>,
        env: Rc<Env>,
        name: String,
    },
    Native {
        call: Option<NativeFunc>,
        construct: Option<NativeFunc>,
        name: String,
    },
    NotCallable,
}

fn call_target(ctx: &Context, func: RawValue) -> CallTarget {
    let heap = &ctx.inner.rt.heap;
    match func {
        RawValue::Handle(id) => heap
            .with_object(id, |data| match &data.kind {
                ObjectKind::Function(FuncData { name, kind }) => match kind {
                    FuncKind::Script { def, env, .. } => CallTarget::Script {
                        def: def.clone(),
                        env: env.clone(),
                        name: name.clone(),
                    },
                    FuncKind::Native { call, construct } => CallTarget::Native {
                        call: call.clone(),
                        construct: construct.clone(),
                        name: name.clone(),
                    },
                },
                _ => CallTarget::NotCallable,
            })
            .unwrap_or(CallTarget::NotCallable),
        _ => CallTarget::NotCallable,
    }
}

/// Invoke a value as a function.
#[cfg_attr(feature = "profiling", profiling::function)]
pub(crate) fn call_value(
    ctx: &Context,
    func: RawValue,
    this: RawValue,
    args: &[RawValue],
) -> ScriptResult<RawValue> {
    match call_target(ctx, func) {
        CallTarget::Script { def, env, name } => {
            let _guard = ExecGuard::enter(ctx)?;
            let scope = if def.is_arrow {
                Env::child(&env)
            } else {
                Env::child_with_this(&env, this)
            };
            // Named function expressions can refer to themselves.
            if !name.is_empty() {
                scope.define(&name, func, false);
            }
            for (i, param) in def.params.iter().enumerate() {
                let value = args.get(i).copied().unwrap_or(RawValue::Undefined);
                scope.define(param, value, true);
            }
            match &def.body {
                FuncBody::Expr(expr) => eval_expr(ctx, expr, &scope),
                FuncBody::Block(stmts) => match eval_stmts(ctx, stmts, &scope)? {
                    Completion::Return(value) => Ok(value),
                    Completion::Normal(_) => Ok(RawValue::Undefined),
                    Completion::Break | Completion::Continue => Err(Exception::syntax_error(
                        ctx,
                        "break or continue outside of loop",
                    )),
                },
            }
        }
        CallTarget::Native { call, name, .. } => match call {
            Some(call) => {
                let _guard = ExecGuard::enter(ctx)?;
                let this = Value::from_raw(ctx, this);
                let arg_values: Vec<Value> =
                    args.iter().map(|raw| Value::from_raw(ctx, *raw)).collect();
                let result = call(ctx, &this, &arg_values)?;
                Ok(result.raw())
            }
            None => Err(Exception::type_error(
                ctx,
                format!("constructor {name} requires 'new'"),
            )),
        },
        CallTarget::NotCallable => Err(Exception::type_error(
            ctx,
            format!(
                "value of type {} is not a function",
                ctx.inner.rt.heap.kind_name(func)
            ),
        )),
    }
}

/// Evaluate `new callee(...args)`.
pub(crate) fn construct(ctx: &Context, callee: RawValue, args: &[RawValue]) -> ScriptResult<RawValue> {
    match call_target(ctx, callee) {
        CallTarget::Script { .. } => {
            let proto = get_prop(ctx, callee, PropKey::Name("prototype"))?;
            let proto_id = match proto {
                RawValue::Handle(id) if ctx.inner.rt.heap.with_object(id, |_| ()).is_some() => {
                    Some(id)
                }
                _ => None,
            };
            let instance = RawValue::Handle(
                ctx.inner
                    .rt
                    .heap
                    .alloc_object(ObjectData::with_proto(proto_id)),
            );
            let result = call_value(ctx, callee, instance, args)?;
            let returned_object = matches!(result, RawValue::Handle(id)
                if ctx.inner.rt.heap.with_object(id, |_| ()).is_some());
            Ok(if returned_object { result } else { instance })
        }
        CallTarget::Native { construct, name, .. } => match construct {
            Some(construct) => {
                let _guard = ExecGuard::enter(ctx)?;
                // Constructor trampolines receive the callee so they can
                // honor an overridden `prototype`.
                let new_target = Value::from_raw(ctx, callee);
                let arg_values: Vec<Value> =
                    args.iter().map(|raw| Value::from_raw(ctx, *raw)).collect();
                let result = construct(ctx, &new_target, &arg_values)?;
                Ok(result.raw())
            }
            None => Err(Exception::type_error(
                ctx,
                format!("{name} is not a constructor"),
            )),
        },
        CallTarget::NotCallable => Err(Exception::type_error(
            ctx,
            format!(
                "value of type {} is not a constructor",
                ctx.inner.rt.heap.kind_name(callee)
            ),
        )),
    }
}

// ============================================================================
// Coercions and operators
// ============================================================================

pub(crate) fn truthy(ctx: &Context, raw: RawValue) -> bool {
    match raw {
        RawValue::Undefined | RawValue::Uninitialized | RawValue::Null => false,
        RawValue::Bool(b) => b,
        RawValue::Int(i) => i != 0,
        RawValue::Float(f) => f != 0.0 && !f.is_nan(),
        RawValue::Handle(id) => match ctx.inner.rt.heap.string(id) {
            Some(s) => !s.is_empty(),
            None => true,
        },
    }
}

pub(crate) fn to_number(ctx: &Context, raw: RawValue) -> f64 {
    match raw {
        RawValue::Undefined | RawValue::Uninitialized => f64::NAN,
        RawValue::Null => 0.0,
        RawValue::Bool(b) => {
            if b {
                1.0
            } else {
                0.0
            }
        }
        RawValue::Int(i) => i as f64,
        RawValue::Float(f) => f,
        RawValue::Handle(id) => match ctx.inner.rt.heap.string(id) {
            Some(s) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    0.0
                } else {
                    trimmed.parse::<f64>().unwrap_or(f64::NAN)
                }
            }
            None => f64::NAN,
        },
    }
}

fn as_string_content(ctx: &Context, raw: RawValue) -> Option<Rc<str>> {
    match raw {
        RawValue::Handle(id) => ctx.inner.rt.heap.string(id),
        _ => None,
    }
}

fn is_object_handle(ctx: &Context, raw: RawValue) -> bool {
    match raw {
        RawValue::Handle(id) => ctx.inner.rt.heap.with_object(id, |_| ()).is_some(),
        _ => false,
    }
}

fn binary_op(ctx: &Context, op: BinaryOp, l: RawValue, r: RawValue) -> ScriptResult<RawValue> {
    match op {
        BinaryOp::Add => {
            let l_str = as_string_content(ctx, l);
            let r_str = as_string_content(ctx, r);
            if l_str.is_some()
                || r_str.is_some()
                || is_object_handle(ctx, l)
                || is_object_handle(ctx, r)
            {
                let text = format!(
                    "{}{}",
                    to_display_string(ctx, l),
                    to_display_string(ctx, r)
                );
                return Ok(RawValue::Handle(ctx.inner.rt.heap.alloc_string(&text)));
            }
            if let (RawValue::Int(a), RawValue::Int(b)) = (l, r) {
                return Ok(match a.checked_add(b) {
                    Some(v) => RawValue::Int(v),
                    None => RawValue::Float(a as f64 + b as f64),
                });
            }
            Ok(RawValue::Float(to_number(ctx, l) + to_number(ctx, r)))
        }
        BinaryOp::Sub => {
            if let (RawValue::Int(a), RawValue::Int(b)) = (l, r) {
                return Ok(match a.checked_sub(b) {
                    Some(v) => RawValue::Int(v),
                    None => RawValue::Float(a as f64 - b as f64),
                });
            }
            Ok(RawValue::Float(to_number(ctx, l) - to_number(ctx, r)))
        }
        BinaryOp::Mul => {
            if let (RawValue::Int(a), RawValue::Int(b)) = (l, r) {
                return Ok(match a.checked_mul(b) {
                    Some(v) => RawValue::Int(v),
                    None => RawValue::Float(a as f64 * b as f64),
                });
            }
            Ok(RawValue::Float(to_number(ctx, l) * to_number(ctx, r)))
        }
        BinaryOp::Div => Ok(RawValue::Float(to_number(ctx, l) / to_number(ctx, r))),
        BinaryOp::Rem => {
            if let (RawValue::Int(a), RawValue::Int(b)) = (l, r) {
                if let Some(v) = a.checked_rem(b) {
                    return Ok(RawValue::Int(v));
                }
            }
            Ok(RawValue::Float(to_number(ctx, l) % to_number(ctx, r)))
        }
        BinaryOp::EqEq => Ok(RawValue::Bool(loose_eq(ctx, l, r))),
        BinaryOp::NotEq => Ok(RawValue::Bool(!loose_eq(ctx, l, r))),
        BinaryOp::StrictEq => Ok(RawValue::Bool(strict_eq(ctx, l, r))),
        BinaryOp::StrictNotEq => Ok(RawValue::Bool(!strict_eq(ctx, l, r))),
        BinaryOp::Lt | BinaryOp::Gt | BinaryOp::Le | BinaryOp::Ge => {
            let l_str = as_string_content(ctx, l);
            let r_str = as_string_content(ctx, r);
            let result = if let (Some(a), Some(b)) = (l_str, r_str) {
                match op {
                    BinaryOp::Lt => a < b,
                    BinaryOp::Gt => a > b,
                    BinaryOp::Le => a <= b,
                    _ => a >= b,
                }
            } else {
                let a = to_number(ctx, l);
                let b = to_number(ctx, r);
                match op {
                    BinaryOp::Lt => a < b,
                    BinaryOp::Gt => a > b,
                    BinaryOp::Le => a <= b,
                    _ => a >= b,
                }
            };
            Ok(RawValue::Bool(result))
        }
    }
}

/// Strict equality. The two number tags compare numerically; strings by
/// content; other heap values by identity. The uninitialized sentinel
/// equals `undefined`.
pub(crate) fn strict_eq(ctx: &Context, l: RawValue, r: RawValue) -> bool {
    match (l, r) {
        (
            RawValue::Undefined | RawValue::Uninitialized,
            RawValue::Undefined | RawValue::Uninitialized,
        ) => true,
        (RawValue::Null, RawValue::Null) => true,
        (RawValue::Bool(a), RawValue::Bool(b)) => a == b,
        (RawValue::Int(a), RawValue::Int(b)) => a == b,
        (RawValue::Int(a), RawValue::Float(b)) => (a as f64) == b,
        (RawValue::Float(a), RawValue::Int(b)) => a == (b as f64),
        (RawValue::Float(a), RawValue::Float(b)) => a == b,
        (RawValue::Handle(a), RawValue::Handle(b)) => {
            if a == b {
                // NaN lives in the float tag, so a handle always equals
                // itself.
                return true;
            }
            let heap = &ctx.inner.rt.heap;
            match (heap.string(a), heap.string(b)) {
                (Some(sa), Some(sb)) => sa == sb,
                _ => false,
            }
        }
        _ => false,
    }
}

fn loose_eq(ctx: &Context, l: RawValue, r: RawValue) -> bool {
    if strict_eq(ctx, l, r) {
        return true;
    }
    if l.is_nullish() && r.is_nullish() {
        return true;
    }
    if l.is_nullish() || r.is_nullish() {
        return false;
    }
    let l_is_obj = is_object_handle(ctx, l);
    let r_is_obj = is_object_handle(ctx, r);
    if l_is_obj && r_is_obj {
        return false;
    }
    if l_is_obj || r_is_obj {
        // Object against primitive compares through the string form.
        return to_display_string(ctx, l) == to_display_string(ctx, r);
    }
    // Remaining mixed primitives compare numerically.
    let a = to_number(ctx, l);
    let b = to_number(ctx, r);
    a == b
}

pub(crate) fn typeof_name(ctx: &Context, raw: RawValue) -> &'static str {
    match raw {
        RawValue::Undefined | RawValue::Uninitialized => "undefined",
        RawValue::Null => "object",
        RawValue::Bool(_) => "boolean",
        RawValue::Int(_) | RawValue::Float(_) => "number",
        RawValue::Handle(id) => {
            let heap = &ctx.inner.rt.heap;
            if heap.string(id).is_some() {
                "string"
            } else if heap
                .with_object(id, |data| matches!(data.kind, ObjectKind::Function(_)))
                .unwrap_or(false)
            {
                "function"
            } else {
                "object"
            }
        }
    }
}

// ============================================================================
// String formatting
// ============================================================================

pub(crate) fn format_number(f: f64) -> String {
    if f.is_nan() {
        return "NaN".to_string();
    }
    if f.is_infinite() {
        return if f > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
    }
    if f == f.trunc() && f.abs() < 9.007_199_254_740_992e15 {
        return format!("{}", f as i64);
    }
    format!("{f}")
}

pub(crate) fn to_display_string(ctx: &Context, raw: RawValue) -> String {
    display_value(ctx, raw, 0)
}

fn display_value(ctx: &Context, raw: RawValue, depth: u32) -> String {
    match raw {
        RawValue::Undefined | RawValue::Uninitialized => "undefined".to_string(),
        RawValue::Null => "null".to_string(),
        RawValue::Bool(b) => b.to_string(),
        RawValue::Int(i) => i.to_string(),
        RawValue::Float(f) => format_number(f),
        RawValue::Handle(id) => {
            let heap = &ctx.inner.rt.heap;
            if let Some(s) = heap.string(id) {
                return s.to_string();
            }
            // Self-referential arrays bottom out instead of recursing.
            if depth > 8 {
                return String::new();
            }
            enum Shape {
                Array(Vec<RawValue>),
                Function { name: String, native: bool },
                Promise,
                Native(crate::class::ClassId),
                ErrorLike(RawValue, RawValue),
                Plain,
            }
            let shape = heap.with_object(id, |data| match &data.kind {
                ObjectKind::Array(elements) => Shape::Array(elements.clone()),
                ObjectKind::Function(func) => Shape::Function {
                    name: func.name.clone(),
                    native: matches!(func.kind, FuncKind::Native { .. }),
                },
                ObjectKind::Promise(_) => Shape::Promise,
                ObjectKind::Native(cell) => Shape::Native(cell.class_id),
                ObjectKind::Plain => {
                    let name = data.props.get("name");
                    let message = data.props.get("message");
                    if let (Some(PropSlot::Data(n)), Some(PropSlot::Data(m))) = (name, message) {
                        Shape::ErrorLike(*n, *m)
                    } else {
                        Shape::Plain
                    }
                }
            });
            let shape = match shape {
                Some(shape) => shape,
                None => return String::new(),
            };
            match shape {
                Shape::Array(elements) => {
                    let parts: Vec<String> = elements
                        .iter()
                        .map(|e| {
                            if e.is_nullish() {
                                String::new()
                            } else {
                                display_value(ctx, *e, depth + 1)
                            }
                        })
                        .collect();
                    parts.join(",")
                }
                Shape::Function { name, native } => {
                    let body = if native { "[native code]" } else { "..." };
                    format!("function {name}() {{ {body} }}")
                }
                Shape::Promise => "[object Promise]".to_string(),
                Shape::Native(class_id) => {
                    format!("[object {}]", ctx.inner.rt.classes.class_name(class_id))
                }
                Shape::ErrorLike(name, message) => {
                    let name = display_value(ctx, name, depth + 1);
                    let message = display_value(ctx, message, depth + 1);
                    if message.is_empty() {
                        name
                    } else {
                        format!("{name}: {message}")
                    }
                }
                Shape::Plain => "[object Object]".to_string(),
            }
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Build a `{ name, message }` error object.
pub(crate) fn make_error(ctx: &Context, name: &str, message: &str) -> Value {
    let heap = &ctx.inner.rt.heap;
    let mut data = ObjectData::plain();
    data.props.insert(
        "name".to_string(),
        PropSlot::Data(RawValue::Handle(heap.alloc_string(name))),
    );
    data.props.insert(
        "message".to_string(),
        PropSlot::Data(RawValue::Handle(heap.alloc_string(message))),
    );
    let id = heap.alloc_object(data);
    Value::from_raw(ctx, RawValue::Handle(id))
}

/// Format a thrown value for host-side diagnostics.
pub(crate) fn exception_text(value: &Value) -> String {
    to_display_string(value.context(), value.raw())
}

// ============================================================================
// Promises and jobs
// ============================================================================

/// Install the default globals: `globalThis`, `undefined`, `NaN`,
/// `Infinity`, the error constructors, and the `Promise` constructor.
pub(crate) fn bootstrap_global(ctx: &Context) {
    let heap = &ctx.inner.rt.heap;
    let global = ctx.inner.global;

    let set_global = |name: &str, raw: RawValue| {
        heap.with_object_mut(global, |data| {
            data.props.insert(name.to_string(), PropSlot::Data(raw));
        });
    };

    set_global("globalThis", RawValue::Handle(global));
    set_global("undefined", RawValue::Undefined);
    set_global("NaN", RawValue::Float(f64::NAN));
    set_global("Infinity", RawValue::Float(f64::INFINITY));

    // Error constructors, callable with or without `new`. Instances are
    // plain `{ name, message }` objects.
    for name in [
        "Error",
        "TypeError",
        "RangeError",
        "SyntaxError",
        "ReferenceError",
    ] {
        let build: NativeFunc = Rc::new(move |ctx: &Context, _this: &Value, args: &[Value]| {
            let message = args.first().map(|v| v.to_string()).unwrap_or_default();
            Ok(make_error(ctx, name, &message))
        });
        let error_ctor = heap.alloc_object(ObjectData::function(
            name,
            FuncKind::Native {
                call: Some(build.clone()),
                construct: Some(build),
            },
        ));
        set_global(name, RawValue::Handle(error_ctor));
    }

    // Promise constructor with its prototype and statics.
    let ctor = heap.alloc_object(ObjectData::function(
        "Promise",
        FuncKind::Native {
            call: None,
            construct: Some(Rc::new(promise_construct)),
        },
    ));
    let proto = heap.alloc_object(ObjectData::plain());
    ctx.inner.promise_proto.set(Some(proto));

    let then_fn = heap.alloc_object(ObjectData::function(
        "then",
        FuncKind::Native {
            call: Some(Rc::new(promise_then)),
            construct: None,
        },
    ));
    let resolve_fn = heap.alloc_object(ObjectData::function(
        "resolve",
        FuncKind::Native {
            call: Some(Rc::new(promise_resolve_static)),
            construct: None,
        },
    ));
    let reject_fn = heap.alloc_object(ObjectData::function(
        "reject",
        FuncKind::Native {
            call: Some(Rc::new(promise_reject_static)),
            construct: None,
        },
    ));

    heap.with_object_mut(proto, |data| {
        data.props.insert(
            "then".to_string(),
            PropSlot::Data(RawValue::Handle(then_fn)),
        );
        data.props.insert(
            "constructor".to_string(),
            PropSlot::Data(RawValue::Handle(ctor)),
        );
    });
    heap.with_object_mut(ctor, |data| {
        data.props.insert(
            "prototype".to_string(),
            PropSlot::Data(RawValue::Handle(proto)),
        );
        data.props.insert(
            "resolve".to_string(),
            PropSlot::Data(RawValue::Handle(resolve_fn)),
        );
        data.props.insert(
            "reject".to_string(),
            PropSlot::Data(RawValue::Handle(reject_fn)),
        );
    });
    set_global("Promise", RawValue::Handle(ctor));
}

fn new_promise(ctx: &Context) -> SlotId {
    let proto = ctx.inner.promise_proto.get();
    ctx.inner.rt.heap.alloc_object(ObjectData::promise(proto))
}

fn as_promise(ctx: &Context, raw: RawValue) -> Option<SlotId> {
    match raw {
        RawValue::Handle(id) => {
            let is_promise = ctx
                .inner
                .rt
                .heap
                .with_object(id, |data| matches!(data.kind, ObjectKind::Promise(_)))
                .unwrap_or(false);
            is_promise.then_some(id)
        }
        _ => None,
    }
}

/// Settle a promise. Settling twice is a no-op, and reactions queued on
/// the promise move to the job queue.
pub(crate) fn settle_promise(ctx: &Context, id: SlotId, state: PromiseState, result: RawValue) {
    debug_assert!(!matches!(state, PromiseState::Pending));
    let reactions = ctx.inner.rt.heap.with_object_mut(id, |data| {
        if let ObjectKind::Promise(promise) = &mut data.kind {
            if !matches!(promise.state, PromiseState::Pending) {
                return Vec::new();
            }
            promise.state = state;
            promise.result = result;
            std::mem::take(&mut promise.reactions)
        } else {
            Vec::new()
        }
    });
    let Some(reactions) = reactions else { return };
    let rejected = matches!(state, PromiseState::Rejected);
    for reaction in reactions {
        let handler = if rejected {
            reaction.on_rejected
        } else {
            reaction.on_fulfilled
        };
        enqueue_reaction(ctx, handler, result, reaction.derived, rejected);
    }
}

/// Resolve a promise with a value, adopting the state of inner promises.
fn resolve_promise(ctx: &Context, id: SlotId, value: RawValue) {
    if let Some(inner) = as_promise(ctx, value) {
        if inner == id {
            settle_promise(
                ctx,
                id,
                PromiseState::Rejected,
                make_error(ctx, "TypeError", "promise resolved with itself").raw(),
            );
            return;
        }
        adopt_promise(ctx, inner, id);
        return;
    }
    settle_promise(ctx, id, PromiseState::Fulfilled, value);
}

/// Make `outer` settle however `inner` settles.
fn adopt_promise(ctx: &Context, inner: SlotId, outer: SlotId) {
    let pending = ctx.inner.rt.heap.with_object_mut(inner, |data| {
        if let ObjectKind::Promise(promise) = &mut data.kind {
            match promise.state {
                PromiseState::Pending => {
                    promise.reactions.push(Reaction {
                        on_fulfilled: RawValue::Undefined,
                        on_rejected: RawValue::Undefined,
                        derived: outer,
                    });
                    None
                }
                state => Some((state, promise.result)),
            }
        } else {
            None
        }
    });
    if let Some(Some((state, result))) = pending {
        enqueue_reaction(
            ctx,
            RawValue::Undefined,
            result,
            outer,
            matches!(state, PromiseState::Rejected),
        );
    }
}

fn enqueue_reaction(
    ctx: &Context,
    handler: RawValue,
    argument: RawValue,
    derived: SlotId,
    rejected: bool,
) {
    ctx.inner.rt.push_job(Job {
        ctx: Rc::downgrade(&ctx.inner),
        kind: JobKind::Reaction {
            handler,
            argument,
            derived,
            rejected,
        },
    });
}

/// Run one queued job. Handler outcomes settle the derived promise, so
/// this never raises.
pub(crate) fn run_job(job: Job) {
    let Some(inner) = job.ctx.upgrade() else {
        return;
    };
    let ctx = Context { inner };
    match job.kind {
        JobKind::Reaction {
            handler,
            argument,
            derived,
            rejected,
        } => {
            let is_callable = !matches!(call_target(&ctx, handler), CallTarget::NotCallable);
            if !is_callable {
                // Pass-through: the derived promise repeats the outcome.
                let state = if rejected {
                    PromiseState::Rejected
                } else {
                    PromiseState::Fulfilled
                };
                settle_promise(&ctx, derived, state, argument);
                return;
            }
            match call_value(&ctx, handler, RawValue::Undefined, &[argument]) {
                Ok(result) => resolve_promise(&ctx, derived, result),
                Err(exception) => {
                    let raw = exception.value().raw();
                    settle_promise(&ctx, derived, PromiseState::Rejected, raw);
                }
            }
        }
    }
}

fn promise_construct(ctx: &Context, _new_target: &Value, args: &[Value]) -> ScriptResult<Value> {
    let executor = args
        .first()
        .filter(|v| v.is_function())
        .ok_or_else(|| Exception::type_error(ctx, "Promise executor is not a function"))?;

    let id = new_promise(ctx);
    let promise = Value::from_raw(ctx, RawValue::Handle(id));
    let r#gen = ctx.inner.rt.heap.generation(id);

    let resolve = {
        let target = (id, r#gen);
        Value::raw_function(ctx, "resolve", move |ctx, _this, args| {
            let value = args.first().map(|v| v.raw()).unwrap_or(RawValue::Undefined);
            if ctx.inner.rt.heap.is_live(target.0, target.1) {
                resolve_promise(ctx, target.0, value);
            }
            Ok(Value::undefined(ctx))
        })
    };
    let reject = {
        let target = (id, r#gen);
        Value::raw_function(ctx, "reject", move |ctx, _this, args| {
            let value = args.first().map(|v| v.raw()).unwrap_or(RawValue::Undefined);
            if ctx.inner.rt.heap.is_live(target.0, target.1) {
                settle_promise(ctx, target.0, PromiseState::Rejected, value);
            }
            Ok(Value::undefined(ctx))
        })
    };

    if let Err(exception) = executor.invoke(&[resolve, reject]) {
        settle_promise(ctx, id, PromiseState::Rejected, exception.value().raw());
    }
    Ok(promise)
}

fn promise_then(ctx: &Context, this: &Value, args: &[Value]) -> ScriptResult<Value> {
    let Some(id) = as_promise(ctx, this.raw()) else {
        return Err(Exception::type_error(
            ctx,
            "Promise.prototype.then called on a non-promise",
        ));
    };
    let on_fulfilled = args.first().map(|v| v.raw()).unwrap_or(RawValue::Undefined);
    let on_rejected = args.get(1).map(|v| v.raw()).unwrap_or(RawValue::Undefined);

    let derived = new_promise(ctx);
    let derived_value = Value::from_raw(ctx, RawValue::Handle(derived));

    let settled = ctx.inner.rt.heap.with_object_mut(id, |data| {
        if let ObjectKind::Promise(promise) = &mut data.kind {
            match promise.state {
                PromiseState::Pending => {
                    promise.reactions.push(Reaction {
                        on_fulfilled,
                        on_rejected,
                        derived,
                    });
                    None
                }
                state => Some((state, promise.result)),
            }
        } else {
            None
        }
    });
    if let Some(Some((state, result))) = settled {
        let rejected = matches!(state, PromiseState::Rejected);
        let handler = if rejected { on_rejected } else { on_fulfilled };
        enqueue_reaction(ctx, handler, result, derived, rejected);
    }
    Ok(derived_value)
}

fn promise_resolve_static(ctx: &Context, _this: &Value, args: &[Value]) -> ScriptResult<Value> {
    let value = args.first().map(|v| v.raw()).unwrap_or(RawValue::Undefined);
    if as_promise(ctx, value).is_some() {
        return Ok(Value::from_raw(ctx, value));
    }
    let id = new_promise(ctx);
    settle_promise(ctx, id, PromiseState::Fulfilled, value);
    Ok(Value::from_raw(ctx, RawValue::Handle(id)))
}

fn promise_reject_static(ctx: &Context, _this: &Value, args: &[Value]) -> ScriptResult<Value> {
    let value = args.first().map(|v| v.raw()).unwrap_or(RawValue::Undefined);
    let id = new_promise(ctx);
    settle_promise(ctx, id, PromiseState::Rejected, value);
    Ok(Value::from_raw(ctx, RawValue::Handle(id)))
}

/// Read a promise's state and result without rooting anything.
pub(crate) fn promise_snapshot(ctx: &Context, raw: RawValue) -> Option<(PromiseState, RawValue)> {
    let id = as_promise(ctx, raw)?;
    ctx.inner
        .rt
        .heap
        .with_object(id, |data| match &data.kind {
            ObjectKind::Promise(promise) => Some((promise.state, promise.result)),
            _ => None,
        })
        .flatten()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn number_formatting() {
        assert_eq!(format_number(2.5), "2.5");
        assert_eq!(format_number(2.0), "2");
        assert_eq!(format_number(-0.5), "-0.5");
        assert_eq!(format_number(f64::NAN), "NaN");
        assert_eq!(format_number(f64::INFINITY), "Infinity");
        assert_eq!(format_number(f64::NEG_INFINITY), "-Infinity");
    }

    #[test]
    fn env_define_lookup_and_shadowing() {
        let root = Env::new_root(None);
        root.define("x", RawValue::Int(1), true);

        let child = Env::child(&root);
        assert_eq!(child.lookup("x"), Some(RawValue::Int(1)));

        child.define("x", RawValue::Int(2), true);
        assert_eq!(child.lookup("x"), Some(RawValue::Int(2)));
        assert_eq!(root.lookup("x"), Some(RawValue::Int(1)));
    }

    #[test]
    fn env_assign_respects_mutability() {
        let root = Env::new_root(None);
        root.define("k", RawValue::Int(1), false);
        assert!(matches!(
            root.assign("k", RawValue::Int(2)),
            AssignOutcome::ImmutableBinding
        ));
        assert!(matches!(
            root.assign("missing", RawValue::Int(2)),
            AssignOutcome::NotFound
        ));
    }

    #[test]
    fn env_this_walks_to_nearest_call_scope() {
        let root = Env::new_root(None);
        let call = Env::child_with_this(&root, RawValue::Int(7));
        let block = Env::child(&call);
        assert_eq!(block.this(), RawValue::Int(7));
    }
}
