//! Runtime: the heap, class table, and job queue shared by every context.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

use crate::class::ClassRegistry;
use crate::context::ContextInner;
use crate::engine::heap::Heap;
use crate::engine::object::{RawValue, SlotId};
use crate::module::ModuleLoader;

// ============================================================================
// Configuration
// ============================================================================

/// Tunables fixed when the runtime is constructed.
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    /// Pad conversions into `[T; N]` when the script array is shorter,
    /// feeding `undefined` through the element conversion. When off, a
    /// short array is a length mismatch error.
    pub pad_short_arrays: bool,
    /// Nested call frames allowed before a `RangeError` is raised.
    pub max_stack_depth: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            pad_short_arrays: true,
            max_stack_depth: 256,
        }
    }
}

// ============================================================================
// Job queue
// ============================================================================

/// Deferred work drained between script frames. Each job carries the
/// context it was enqueued on; jobs whose context has been dropped are
/// discarded when they come up.
pub(crate) struct Job {
    pub(crate) ctx: Weak<ContextInner>,
    pub(crate) kind: JobKind,
}

pub(crate) enum JobKind {
    Reaction {
        handler: RawValue,
        argument: RawValue,
        derived: SlotId,
        rejected: bool,
    },
}

// ============================================================================
// Runtime
// ============================================================================

/// Owns the value heap and everything shared between contexts: the class
/// registry, the pending-job queue, and the module loader.
///
/// Cloning is cheap; clones refer to the same runtime.
#[derive(Clone)]
pub struct Runtime {
    pub(crate) inner: Rc<RuntimeInner>,
}

pub(crate) struct RuntimeInner {
    pub(crate) heap: Heap,
    pub(crate) classes: ClassRegistry,
    config: RuntimeConfig,
    /// Script and native frames currently on the stack, across contexts.
    exec_depth: Cell<u32>,
    jobs: RefCell<VecDeque<Job>>,
    loader: RefCell<Option<Rc<dyn ModuleLoader>>>,
    contexts: RefCell<Vec<Weak<ContextInner>>>,
}

impl RuntimeInner {
    pub(crate) fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub(crate) fn exec_depth(&self) -> &Cell<u32> {
        &self.exec_depth
    }

    pub(crate) fn push_job(&self, job: Job) {
        self.jobs.borrow_mut().push_back(job);
    }

    pub(crate) fn pop_job(&self) -> Option<Job> {
        self.jobs.borrow_mut().pop_front()
    }

    pub(crate) fn has_jobs(&self) -> bool {
        !self.jobs.borrow().is_empty()
    }

    pub(crate) fn module_loader(&self) -> Option<Rc<dyn ModuleLoader>> {
        self.loader.borrow().clone()
    }

    pub(crate) fn register_context(&self, ctx: &Rc<ContextInner>) {
        self.contexts.borrow_mut().push(Rc::downgrade(ctx));
    }
}

impl Runtime {
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        Runtime {
            inner: Rc::new(RuntimeInner {
                heap: Heap::new(),
                classes: ClassRegistry::default(),
                config,
                exec_depth: Cell::new(0),
                jobs: RefCell::new(VecDeque::new()),
                loader: RefCell::new(None),
                contexts: RefCell::new(Vec::new()),
            }),
        }
    }

    /// Install the loader consulted when a script imports a specifier the
    /// context has not seen. Replaces any previous loader.
    pub fn set_module_loader(&self, loader: impl ModuleLoader + 'static) {
        *self.inner.loader.borrow_mut() = Some(Rc::new(loader));
    }

    /// Number of heap cells currently allocated.
    pub fn live_slots(&self) -> usize {
        self.inner.heap.live_slots()
    }

    /// Mark from every live context's globals, module tables, class
    /// prototypes, and queued jobs, then sweep the rest. Returns the
    /// number of cells freed.
    ///
    /// A no-op while any script or native frame is on the stack.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn collect(&self) -> usize {
        let inner = &*self.inner;
        if inner.exec_depth.get() > 0 {
            return 0;
        }

        let mut roots: Vec<RawValue> = Vec::new();
        {
            let mut push = |raw: RawValue| roots.push(raw);
            let mut contexts = inner.contexts.borrow_mut();
            contexts.retain(|weak| weak.strong_count() > 0);
            for ctx in contexts.iter().filter_map(Weak::upgrade) {
                push(RawValue::Handle(ctx.global));
                if let Some(proto) = ctx.promise_proto.get() {
                    push(RawValue::Handle(proto));
                }
                ctx.modules.borrow().trace_into(&mut push);
            }
            inner.classes.trace_into(&mut push);
            for job in inner.jobs.borrow().iter() {
                let JobKind::Reaction {
                    handler,
                    argument,
                    derived,
                    ..
                } = &job.kind;
                push(*handler);
                push(*argument);
                push(RawValue::Handle(*derived));
            }
        }

        inner
            .heap
            .collect(roots, &|cell, tracer| inner.classes.trace_instance(cell, tracer))
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::value::Value;

    #[test]
    fn config_defaults() {
        let config = RuntimeConfig::default();
        assert!(config.pad_short_arrays);
        assert_eq!(config.max_stack_depth, 256);
    }

    #[test]
    fn collection_sweeps_unrooted_allocations() {
        let rt = Runtime::new();
        let ctx = Context::new(&rt);
        drop(Value::object(&ctx));
        assert!(rt.collect() >= 1);
    }

    #[test]
    fn collection_keeps_rooted_values_and_the_global() {
        let rt = Runtime::new();
        let ctx = Context::new(&rt);
        let keep = Value::object(&ctx);
        rt.collect();
        keep.set("alive", &Value::of(&ctx, true)).unwrap();
        ctx.global().set("marker", &keep).unwrap();
    }

    #[test]
    fn collection_refuses_while_a_frame_is_live() {
        let rt = Runtime::new();
        let ctx = Context::new(&rt);
        drop(Value::object(&ctx));
        rt.inner.exec_depth().set(1);
        assert_eq!(rt.collect(), 0);
        rt.inner.exec_depth().set(0);
        assert!(rt.collect() >= 1);
    }

    #[test]
    fn dead_contexts_fall_out_of_the_root_set() {
        let rt = Runtime::new();
        let before = rt.live_slots();
        drop(Context::new(&rt));
        rt.collect();
        assert_eq!(rt.live_slots(), before);
    }
}
