//! Named modules and host-side module loading.
//!
//! Native modules are declared on a context, populated with exports, and
//! loaded lazily the first time a script imports them:
//!
//! ```ignore
//! use quickbind::{EvalFlags, Value};
//!
//! let mut module = ctx.new_module("game")?;
//! module.add_export("version", &Value::of(&ctx, 3))?;
//!
//! ctx.eval(
//!     "boot",
//!     r#"import { version } from "game";"#,
//!     EvalFlags::MODULE,
//! )?;
//! ```
//!
//! Source-text modules come from a [`ModuleLoader`] registered on the
//! runtime: each import specifier is canonicalized by the loader's
//! `normalize`, looked up in the context's module table, and fetched via
//! `load` when it is not yet known.

use rustc_hash::FxHashMap;

use crate::context::Context;
use crate::engine::modules::{self, ModuleId};
use crate::error::ScriptResult;
use crate::value::Value;

// ============================================================================
// Native module handles
// ============================================================================

/// Handle to a named module declared on a context.
///
/// Exports may be added until the first import loads the module; from then
/// on the export table is sealed.
pub struct Module {
    ctx: Context,
    id: ModuleId,
}

impl std::fmt::Debug for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Module")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl Module {
    pub(crate) fn declare(ctx: &Context, name: &str) -> ScriptResult<Module> {
        let id = modules::declare_native(ctx, name)?;
        Ok(Module {
            ctx: ctx.clone(),
            id,
        })
    }

    pub(crate) fn from_id(ctx: &Context, id: ModuleId) -> Module {
        Module {
            ctx: ctx.clone(),
            id,
        }
    }

    pub(crate) fn id(&self) -> ModuleId {
        self.id
    }

    /// The specifier scripts use to import this module.
    pub fn name(&self) -> String {
        modules::module_name(&self.ctx, self.id)
    }

    /// Register `value` under `name` in the export table, replacing any
    /// previous export of the same name.
    ///
    /// # Errors
    ///
    /// Fails once the module has been loaded.
    pub fn add_export(&mut self, name: &str, value: &Value) -> ScriptResult<()> {
        modules::add_native_export(&self.ctx, self.id, name, value)
    }

    /// Look up an export by name.
    pub fn export(&self, name: &str) -> Option<Value> {
        modules::export_raw(&self.ctx, self.id, name).map(|raw| Value::from_raw(&self.ctx, raw))
    }
}

// ============================================================================
// Host loaders
// ============================================================================

/// Resolves import specifiers and supplies module source text.
///
/// The engine consults the loader in two steps: `normalize` turns the
/// specifier as written into a canonical name, then `load` produces source
/// for canonical names the context has not seen before. Returning `None`
/// from `load` fails the import with a "module not found" error.
pub trait ModuleLoader {
    /// Canonicalize `requested` as imported from `requesting`.
    ///
    /// The default resolves `./` and `../` specifiers against the
    /// requesting module's directory and passes bare specifiers through.
    fn normalize(&self, _ctx: &Context, requesting: &str, requested: &str) -> String {
        default_normalize(requesting, requested)
    }

    /// Produce source text for a canonical specifier, or `None` if the
    /// loader does not know it.
    fn load(&self, ctx: &Context, specifier: &str) -> Option<String>;
}

/// Resolve `requested` against the directory of `requesting`.
///
/// Bare specifiers (no leading `./` or `../`) pass through unchanged.
/// Relative specifiers drop the requesting module's file name, then fold
/// `.` and `..` segments; `..` at the root is ignored rather than escaping,
/// so the result is defined for any pair of inputs.
pub fn default_normalize(requesting: &str, requested: &str) -> String {
    if !requested.starts_with("./") && !requested.starts_with("../") {
        return requested.to_string();
    }
    let mut parts: Vec<&str> = requesting.split('/').collect();
    parts.pop();
    for segment in requested.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            segment => parts.push(segment),
        }
    }
    parts.join("/")
}

/// Loader backed by an in-memory specifier to source map, for embedders
/// whose module graph is known up front.
#[derive(Default)]
pub struct MemoryLoader {
    sources: FxHashMap<String, String>,
}

impl MemoryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `source` under `specifier`, replacing any previous text.
    pub fn add_source(&mut self, specifier: impl Into<String>, source: impl Into<String>) {
        self.sources.insert(specifier.into(), source.into());
    }

    /// Chainable form of [`add_source`](Self::add_source).
    pub fn with_source(
        mut self,
        specifier: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        self.add_source(specifier, source);
        self
    }
}

impl ModuleLoader for MemoryLoader {
    fn load(&self, _ctx: &Context, specifier: &str) -> Option<String> {
        self.sources.get(specifier).cloned()
    }
}
