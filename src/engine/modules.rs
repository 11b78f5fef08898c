//! Module records: native export tables and source-text modules.
//!
//! Records live in the owning context and are keyed by canonical
//! specifier. Native modules carry exports installed from host code;
//! source modules carry a parsed program whose body runs once during
//! linking. Both end in the terminal `Loaded` state.

use std::rc::Rc;

use rustc_hash::FxHashMap;

use crate::context::Context;
use crate::engine::ast::{Item, Program};
use crate::engine::interp::{self, Env};
use crate::engine::object::{ObjectData, PropSlot, RawValue, SlotId};
use crate::engine::parser;
use crate::error::{Exception, ScriptResult};
use crate::module::default_normalize;
use crate::value::Value;

/// Identifies a module record within its owning context.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub(crate) struct ModuleId(pub u32);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum ModuleState {
    /// Declared, exports still installable, body not yet run.
    Declared,
    /// Link in progress. Reaching a linking module again is a cycle.
    Linking,
    /// Exports installed and body (if any) evaluated. Terminal.
    Loaded,
    /// A previous link attempt raised. Terminal.
    Failed,
}

enum RecordKind {
    /// Exports installed from native code, no source body.
    Native,
    /// Parsed source text awaiting evaluation.
    Source { program: Rc<Program> },
}

pub(crate) struct ModuleRecord {
    specifier: String,
    kind: RecordKind,
    state: ModuleState,
    exports: FxHashMap<String, RawValue>,
    main: bool,
    /// Lazily built `import.meta` object.
    meta: Option<SlotId>,
}

/// Per-context module table. Records are never removed, so a `ModuleId`
/// stays valid for the context's lifetime.
#[derive(Default)]
pub(crate) struct ModuleMap {
    records: Vec<ModuleRecord>,
    by_specifier: FxHashMap<String, ModuleId>,
}

impl ModuleMap {
    fn insert(&mut self, record: ModuleRecord) -> ModuleId {
        let id = ModuleId(self.records.len() as u32);
        self.by_specifier.insert(record.specifier.clone(), id);
        self.records.push(record);
        id
    }

    fn get(&self, id: ModuleId) -> &ModuleRecord {
        &self.records[id.0 as usize]
    }

    fn get_mut(&mut self, id: ModuleId) -> &mut ModuleRecord {
        &mut self.records[id.0 as usize]
    }

    pub(crate) fn lookup(&self, specifier: &str) -> Option<ModuleId> {
        self.by_specifier.get(specifier).copied()
    }

    /// Feed every value held by module records to the collector.
    pub(crate) fn trace_into(&self, push: &mut dyn FnMut(RawValue)) {
        for record in &self.records {
            for raw in record.exports.values() {
                push(*raw);
            }
            if let Some(meta) = record.meta {
                push(RawValue::Handle(meta));
            }
        }
    }
}

fn new_record(specifier: &str, kind: RecordKind, main: bool) -> ModuleRecord {
    ModuleRecord {
        specifier: specifier.to_string(),
        kind,
        state: ModuleState::Declared,
        exports: FxHashMap::default(),
        main,
        meta: None,
    }
}

// ============================================================================
// Native modules
// ============================================================================

pub(crate) fn declare_native(ctx: &Context, name: &str) -> ScriptResult<ModuleId> {
    if ctx.inner.modules.borrow().lookup(name).is_some() {
        return Err(Exception::error(
            ctx,
            format!("module '{name}' is already defined"),
        ));
    }
    Ok(ctx
        .inner
        .modules
        .borrow_mut()
        .insert(new_record(name, RecordKind::Native, false)))
}

/// Install one export on a declared native module. Loaded modules are
/// sealed.
pub(crate) fn add_native_export(
    ctx: &Context,
    id: ModuleId,
    name: &str,
    value: &Value,
) -> ScriptResult<()> {
    let (state, specifier) = {
        let modules = ctx.inner.modules.borrow();
        let record = modules.get(id);
        (record.state, record.specifier.clone())
    };
    if !matches!(state, ModuleState::Declared) {
        return Err(Exception::error(
            ctx,
            format!("module '{specifier}' is already loaded"),
        ));
    }
    ctx.inner
        .modules
        .borrow_mut()
        .get_mut(id)
        .exports
        .insert(name.to_string(), value.raw());
    Ok(())
}

pub(crate) fn module_name(ctx: &Context, id: ModuleId) -> String {
    ctx.inner.modules.borrow().get(id).specifier.clone()
}

pub(crate) fn export_raw(ctx: &Context, id: ModuleId, name: &str) -> Option<RawValue> {
    ctx.inner.modules.borrow().get(id).exports.get(name).copied()
}

// ============================================================================
// Source modules
// ============================================================================

/// Parse, register, link, and evaluate a module from source text.
pub(crate) fn load_source(
    ctx: &Context,
    specifier: &str,
    source: &str,
    main: bool,
) -> ScriptResult<ModuleId> {
    if ctx.inner.modules.borrow().lookup(specifier).is_some() {
        return Err(Exception::error(
            ctx,
            format!("module '{specifier}' is already defined"),
        ));
    }
    let program =
        parser::parse_module(source).map_err(|e| Exception::parse(ctx, specifier, &e))?;
    let id = ctx.inner.modules.borrow_mut().insert(new_record(
        specifier,
        RecordKind::Source {
            program: Rc::new(program),
        },
        main,
    ));
    link(ctx, id)?;
    Ok(id)
}

/// Parse a module without registering or evaluating it.
pub(crate) fn compile_source(ctx: &Context, specifier: &str, source: &str) -> ScriptResult<()> {
    parser::parse_module(source)
        .map(|_| ())
        .map_err(|e| Exception::parse(ctx, specifier, &e))
}

/// Bring a record to the `Loaded` state: dependencies first, then export
/// installation (native) or body evaluation (source).
fn link(ctx: &Context, id: ModuleId) -> ScriptResult<()> {
    let (state, specifier, program) = {
        let modules = ctx.inner.modules.borrow();
        let record = modules.get(id);
        let program = match &record.kind {
            RecordKind::Source { program } => Some(program.clone()),
            RecordKind::Native => None,
        };
        (record.state, record.specifier.clone(), program)
    };
    match state {
        ModuleState::Loaded => return Ok(()),
        ModuleState::Linking => {
            return Err(Exception::error(
                ctx,
                format!("cyclic import of module '{specifier}'"),
            ));
        }
        ModuleState::Failed => {
            return Err(Exception::error(
                ctx,
                format!("module '{specifier}' previously failed to load"),
            ));
        }
        ModuleState::Declared => {}
    }
    ctx.inner.modules.borrow_mut().get_mut(id).state = ModuleState::Linking;

    let result = match program {
        None => link_native(ctx, id),
        Some(program) => link_source(ctx, id, &specifier, &program),
    };
    let final_state = if result.is_ok() {
        ModuleState::Loaded
    } else {
        ModuleState::Failed
    };
    ctx.inner.modules.borrow_mut().get_mut(id).state = final_state;
    result
}

/// Verify a native module's export table. A dead handle aborts the load.
fn link_native(ctx: &Context, id: ModuleId) -> ScriptResult<()> {
    let stale = {
        let modules = ctx.inner.modules.borrow();
        let record = modules.get(id);
        record
            .exports
            .iter()
            .find(|(_, raw)| match raw {
                RawValue::Handle(slot) => ctx.inner.rt.heap.with(*slot, |_| ()).is_none(),
                _ => false,
            })
            .map(|(name, _)| (record.specifier.clone(), name.clone()))
    };
    if let Some((specifier, name)) = stale {
        return Err(Exception::error(
            ctx,
            format!("module '{specifier}': export '{name}' is no longer live"),
        ));
    }
    Ok(())
}

fn link_source(
    ctx: &Context,
    id: ModuleId,
    specifier: &str,
    program: &Program,
) -> ScriptResult<()> {
    // Resolve and link every dependency before the body runs.
    let mut imported: Vec<(String, String, ModuleId)> = Vec::new();
    for item in &program.items {
        let decl = match item {
            Item::Import(decl) => decl,
            _ => continue,
        };
        let canonical = normalize(ctx, specifier, &decl.specifier);
        let existing = ctx.inner.modules.borrow().lookup(&canonical);
        let dep = match existing {
            Some(dep) => dep,
            None => fetch(ctx, &canonical)?,
        };
        link(ctx, dep)?;
        for (export, local) in &decl.bindings {
            if export_raw(ctx, dep, export).is_none() {
                return Err(Exception::syntax_error(
                    ctx,
                    format!("module '{canonical}' does not export '{export}'"),
                ));
            }
            imported.push((local.clone(), export.clone(), dep));
        }
    }

    // Imported bindings are read-only in the module scope.
    let env = Env::new_root(Some(id));
    for (local, export, dep) in &imported {
        let raw = export_raw(ctx, *dep, export).unwrap_or(RawValue::Undefined);
        env.define(local, raw, false);
    }
    interp::eval_module_items(ctx, program, &env)?;

    // Snapshot the exported bindings into the record.
    let mut exports = FxHashMap::default();
    for item in &program.items {
        let decl = match item {
            Item::Export(decl) => decl,
            _ => continue,
        };
        for name in &decl.names {
            match env.lookup(name) {
                Some(raw) => {
                    exports.insert(name.clone(), raw);
                }
                None => {
                    return Err(Exception::syntax_error(
                        ctx,
                        format!("exported binding '{name}' is not defined"),
                    ));
                }
            }
        }
    }
    ctx.inner.modules.borrow_mut().get_mut(id).exports = exports;
    Ok(())
}

fn normalize(ctx: &Context, requesting: &str, requested: &str) -> String {
    match ctx.inner.rt.module_loader() {
        Some(loader) => loader.normalize(ctx, requesting, requested),
        None => default_normalize(requesting, requested),
    }
}

/// Ask the host loader for source text and register the new record.
fn fetch(ctx: &Context, canonical: &str) -> ScriptResult<ModuleId> {
    let source = ctx
        .inner
        .rt
        .module_loader()
        .and_then(|loader| loader.load(ctx, canonical));
    let Some(source) = source else {
        return Err(Exception::error(
            ctx,
            format!("module '{canonical}' not found"),
        ));
    };
    let program =
        parser::parse_module(&source).map_err(|e| Exception::parse(ctx, canonical, &e))?;
    Ok(ctx.inner.modules.borrow_mut().insert(new_record(
        canonical,
        RecordKind::Source {
            program: Rc::new(program),
        },
        false,
    )))
}

// ============================================================================
// import.meta
// ============================================================================

/// The per-record `import.meta` object, created on first access.
pub(crate) fn meta_object(ctx: &Context, id: ModuleId) -> ScriptResult<RawValue> {
    let existing = ctx.inner.modules.borrow().get(id).meta;
    if let Some(slot) = existing {
        return Ok(RawValue::Handle(slot));
    }
    let (specifier, main) = {
        let modules = ctx.inner.modules.borrow();
        let record = modules.get(id);
        (record.specifier.clone(), record.main)
    };
    let heap = &ctx.inner.rt.heap;
    let mut data = ObjectData::plain();
    data.props.insert(
        "url".to_string(),
        PropSlot::Data(RawValue::Handle(heap.alloc_string(&specifier))),
    );
    data.props
        .insert("main".to_string(), PropSlot::Data(RawValue::Bool(main)));
    let slot = heap.alloc_object(data);
    ctx.inner.modules.borrow_mut().get_mut(id).meta = Some(slot);
    Ok(RawValue::Handle(slot))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str) -> ModuleRecord {
        new_record(name, RecordKind::Native, false)
    }

    #[test]
    fn map_assigns_sequential_ids() {
        let mut map = ModuleMap::default();
        let a = map.insert(record("a"));
        let b = map.insert(record("b"));
        assert_eq!(a, ModuleId(0));
        assert_eq!(b, ModuleId(1));
        assert_eq!(map.lookup("a"), Some(a));
        assert_eq!(map.lookup("b"), Some(b));
        assert_eq!(map.lookup("c"), None);
    }

    #[test]
    fn trace_covers_exports_and_meta() {
        let mut map = ModuleMap::default();
        let id = map.insert(record("m"));
        map.get_mut(id)
            .exports
            .insert("x".to_string(), RawValue::Handle(SlotId { index: 3 }));
        map.get_mut(id).meta = Some(SlotId { index: 9 });

        let mut seen = Vec::new();
        map.trace_into(&mut |raw| seen.push(raw));
        assert!(seen.contains(&RawValue::Handle(SlotId { index: 3 })));
        assert!(seen.contains(&RawValue::Handle(SlotId { index: 9 })));
    }
}
