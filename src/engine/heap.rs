//! Slot-based heap with explicit rooting and mark/sweep collection.
//!
//! Slots are reused through a free list; each reuse bumps the slot's
//! generation so weak references can detect that their target is gone.
//! Host [`Value`](crate::Value)s hold root counts, which make their slots
//! mark sources. Collection never runs while script or native code is on
//! the stack, so unrooted intermediates inside the evaluator stay valid.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::context::Context;
use crate::engine::object::{
    FuncKind, HeapCell, NativeCell, ObjectData, ObjectKind, PropSlot, RawValue, SlotId,
};
use crate::value::Value;

pub(crate) struct Slot {
    cell: Option<HeapCell>,
    r#gen: u32,
}

pub(crate) struct Heap {
    slots: RefCell<Vec<Slot>>,
    free: RefCell<Vec<u32>>,
    /// Root counts per slot, kept outside `slots` so cloning and dropping
    /// host values never contends with an in-progress heap borrow.
    roots: RefCell<Vec<u32>>,
}

impl Heap {
    pub fn new() -> Self {
        Self {
            slots: RefCell::new(Vec::new()),
            free: RefCell::new(Vec::new()),
            roots: RefCell::new(Vec::new()),
        }
    }

    // ========================================================================
    // Allocation
    // ========================================================================

    /// Allocate a cell. The returned slot is unrooted.
    pub fn alloc(&self, cell: HeapCell) -> SlotId {
        let mut slots = self.slots.borrow_mut();
        if let Some(index) = self.free.borrow_mut().pop() {
            let slot = &mut slots[index as usize];
            slot.cell = Some(cell);
            SlotId { index }
        } else {
            let index = slots.len() as u32;
            slots.push(Slot {
                cell: Some(cell),
                r#gen: 0,
            });
            self.roots.borrow_mut().push(0);
            SlotId { index }
        }
    }

    pub fn alloc_string(&self, s: &str) -> SlotId {
        self.alloc(HeapCell::Str(Rc::from(s)))
    }

    pub fn alloc_object(&self, data: ObjectData) -> SlotId {
        self.alloc(HeapCell::Object(data))
    }

    // ========================================================================
    // Rooting
    // ========================================================================

    pub fn inc_root(&self, id: SlotId) {
        self.roots.borrow_mut()[id.index as usize] += 1;
    }

    pub fn dec_root(&self, id: SlotId) {
        let mut roots = self.roots.borrow_mut();
        let count = &mut roots[id.index as usize];
        debug_assert!(*count > 0, "unbalanced root count");
        *count = count.saturating_sub(1);
    }

    // ========================================================================
    // Access
    // ========================================================================

    pub fn generation(&self, id: SlotId) -> u32 {
        self.slots.borrow()[id.index as usize].r#gen
    }

    /// Whether the slot is occupied and still on the given generation.
    pub fn is_live(&self, id: SlotId, r#gen: u32) -> bool {
        let slots = self.slots.borrow();
        match slots.get(id.index as usize) {
            Some(slot) => slot.cell.is_some() && slot.r#gen == r#gen,
            None => false,
        }
    }

    pub fn with<R>(&self, id: SlotId, f: impl FnOnce(&HeapCell) -> R) -> Option<R> {
        let slots = self.slots.borrow();
        slots
            .get(id.index as usize)
            .and_then(|slot| slot.cell.as_ref())
            .map(f)
    }

    pub fn with_mut<R>(&self, id: SlotId, f: impl FnOnce(&mut HeapCell) -> R) -> Option<R> {
        let mut slots = self.slots.borrow_mut();
        slots
            .get_mut(id.index as usize)
            .and_then(|slot| slot.cell.as_mut())
            .map(f)
    }

    pub fn with_object<R>(&self, id: SlotId, f: impl FnOnce(&ObjectData) -> R) -> Option<R> {
        self.with(id, |cell| match cell {
            HeapCell::Object(data) => Some(f(data)),
            HeapCell::Str(_) => None,
        })
        .flatten()
    }

    pub fn with_object_mut<R>(
        &self,
        id: SlotId,
        f: impl FnOnce(&mut ObjectData) -> R,
    ) -> Option<R> {
        self.with_mut(id, |cell| match cell {
            HeapCell::Object(data) => Some(f(data)),
            HeapCell::Str(_) => None,
        })
        .flatten()
    }

    pub fn string(&self, id: SlotId) -> Option<Rc<str>> {
        self.with(id, |cell| match cell {
            HeapCell::Str(s) => Some(s.clone()),
            HeapCell::Object(_) => None,
        })
        .flatten()
    }

    /// Coarse value kind for diagnostics.
    pub fn kind_name(&self, raw: RawValue) -> &'static str {
        match raw {
            RawValue::Undefined => "undefined",
            RawValue::Uninitialized => "uninitialized",
            RawValue::Null => "null",
            RawValue::Bool(_) => "boolean",
            RawValue::Int(_) | RawValue::Float(_) => "number",
            RawValue::Handle(id) => self
                .with(id, |cell| match cell {
                    HeapCell::Str(_) => "string",
                    HeapCell::Object(data) => match data.kind {
                        ObjectKind::Plain => "object",
                        ObjectKind::Array(_) => "array",
                        ObjectKind::Function(_) => "function",
                        ObjectKind::Native(_) => "object",
                        ObjectKind::Promise(_) => "promise",
                    },
                })
                .unwrap_or("object"),
        }
    }

    /// Number of occupied slots, used to observe collection.
    pub fn live_slots(&self) -> usize {
        self.slots
            .borrow()
            .iter()
            .filter(|slot| slot.cell.is_some())
            .count()
    }

    // ========================================================================
    // Collection
    // ========================================================================

    /// Mark from the root table and `extra_roots`, then sweep everything
    /// unreachable. `trace_native` resolves the trace hook for wrapped
    /// instances. Returns the number of cells freed.
    pub fn collect(
        &self,
        extra_roots: impl IntoIterator<Item = RawValue>,
        trace_native: &dyn Fn(&NativeCell, &mut Tracer<'_>),
    ) -> usize {
        let mut marked;
        {
            let slots = self.slots.borrow();
            let len = slots.len();
            marked = vec![false; len];
            let mut pending: Vec<u32> = Vec::new();

            for (index, count) in self.roots.borrow().iter().enumerate() {
                if *count > 0 {
                    pending.push(index as u32);
                }
            }
            for raw in extra_roots {
                if let RawValue::Handle(id) = raw {
                    pending.push(id.index);
                }
            }

            while let Some(index) = pending.pop() {
                let slot = match slots.get(index as usize) {
                    Some(slot) => slot,
                    None => continue,
                };
                if marked[index as usize] || slot.cell.is_none() {
                    continue;
                }
                marked[index as usize] = true;
                if let Some(HeapCell::Object(data)) = &slot.cell {
                    trace_object(data, &slots, &mut pending, trace_native);
                }
            }
        }

        // Cells are dropped after the heap borrow is released, so instance
        // destructors observe a quiescent heap.
        let mut freed = Vec::new();
        {
            let mut slots = self.slots.borrow_mut();
            let mut free = self.free.borrow_mut();
            for (index, slot) in slots.iter_mut().enumerate() {
                if !marked[index] && slot.cell.is_some() {
                    freed.push(slot.cell.take());
                    slot.r#gen += 1;
                    free.push(index as u32);
                }
            }
        }
        let count = freed.len();
        drop(freed);
        count
    }
}

fn push_raw(pending: &mut Vec<u32>, raw: RawValue) {
    if let RawValue::Handle(id) = raw {
        pending.push(id.index);
    }
}

fn trace_object(
    data: &ObjectData,
    slots: &[Slot],
    pending: &mut Vec<u32>,
    trace_native: &dyn Fn(&NativeCell, &mut Tracer<'_>),
) {
    if let Some(proto) = data.proto {
        pending.push(proto.index);
    }
    for prop in data.props.values() {
        match prop {
            PropSlot::Data(raw) => push_raw(pending, *raw),
            PropSlot::Accessor { getter, setter } => {
                push_raw(pending, *getter);
                if let Some(setter) = setter {
                    push_raw(pending, *setter);
                }
            }
        }
    }
    match &data.kind {
        ObjectKind::Plain => {}
        ObjectKind::Array(elements) => {
            for raw in elements {
                push_raw(pending, *raw);
            }
        }
        ObjectKind::Function(func) => {
            if let FuncKind::Script { env, .. } = &func.kind {
                env.trace_into(&mut |raw| push_raw(pending, raw));
            }
        }
        ObjectKind::Native(cell) => {
            let mut tracer = Tracer { slots, pending };
            trace_native(cell, &mut tracer);
        }
        ObjectKind::Promise(promise) => {
            push_raw(pending, promise.result);
            for reaction in &promise.reactions {
                push_raw(pending, reaction.on_fulfilled);
                push_raw(pending, reaction.on_rejected);
                pending.push(reaction.derived.index);
            }
        }
    }
}

// ============================================================================
// Tracing
// ============================================================================

/// Visitor handed to [`ScriptClass::trace`](crate::ScriptClass::trace)
/// during collection.
pub struct Tracer<'a> {
    slots: &'a [Slot],
    pending: &'a mut Vec<u32>,
}

impl Tracer<'_> {
    /// Keep the cell's target alive. Targets that were already collected
    /// are cleared instead.
    pub fn visit(&mut self, traced: &Traced) {
        let (raw, r#gen) = traced.cell.get();
        if let RawValue::Handle(id) = raw {
            let live = self
                .slots
                .get(id.index as usize)
                .is_some_and(|slot| slot.cell.is_some() && slot.r#gen == r#gen);
            if live {
                self.pending.push(id.index);
            } else {
                traced.clear();
            }
        }
    }
}

/// A traced cell inside a native instance.
///
/// Holds a script value without rooting it. The target stays alive only
/// when the owning class visits the cell from its trace hook; an untraced
/// or cleared cell reads back as empty.
#[derive(Clone)]
pub struct Traced {
    cell: Cell<(RawValue, u32)>,
}

impl Default for Traced {
    fn default() -> Self {
        Self::new()
    }
}

impl Traced {
    pub fn new() -> Self {
        Self {
            cell: Cell::new((RawValue::Undefined, 0)),
        }
    }

    /// Store a value in the cell.
    pub fn store(&self, value: &Value) {
        let raw = value.raw();
        let r#gen = match raw {
            RawValue::Handle(id) => value.context().inner.rt.heap.generation(id),
            _ => 0,
        };
        self.cell.set((raw, r#gen));
    }

    /// Reset the cell to empty.
    pub fn clear(&self) {
        self.cell.set((RawValue::Undefined, 0));
    }

    /// Read the cell back as a rooted value. Returns `None` when the cell
    /// is empty or its target was collected.
    pub fn load(&self, ctx: &Context) -> Option<Value> {
        let (raw, r#gen) = self.cell.get();
        match raw {
            RawValue::Undefined => None,
            RawValue::Handle(id) => {
                if ctx.inner.rt.heap.is_live(id, r#gen) {
                    Some(Value::from_raw(ctx, raw))
                } else {
                    None
                }
            }
            _ => Some(Value::from_raw(ctx, raw)),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.cell.get().0, RawValue::Undefined)
    }
}
