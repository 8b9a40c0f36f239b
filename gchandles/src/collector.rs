//! Narrow interfaces to the collaborators of the handle table.
//!
//! The table never marks, moves or inspects objects itself. The collector
//! answers generation and liveness queries through [`GcHeap`], the
//! surrounding runtime answers per-kind questions through
//! [`ExecutionEngine`], and the marking / relocating work is done by a
//! [`PromoteFn`] the collector passes into each pass.

use bitflags::bitflags;

use crate::{Generation, ObjectRef};

/// Queries the collector answers about its heap.
pub trait GcHeap: Sync {
    /// Current generation of a non-null object.
    fn generation_of(&self, obj: ObjectRef) -> Generation;

    /// Whether a non-null object is known to survive the current
    /// collection. Objects outside the condemned generations count as
    /// promoted.
    fn is_promoted(&self, obj: ObjectRef) -> bool;

    /// Running total of bytes promoted on `heap` during this collection.
    fn promoted_bytes(&self, heap: usize) -> usize {
        let _ = heap;
        0
    }
}

/// Questions only the runtime embedding the collector can answer.
pub trait ExecutionEngine: Sync {
    /// Whether a ref-counted handle's referent is currently held by an
    /// external reference count.
    fn ref_count_is_positive(&self, obj: ObjectRef) -> bool;

    /// Visits the extra objects an async-pinned referent keeps pinned.
    fn walk_async_pinned(&self, obj: ObjectRef, visit: &mut dyn FnMut(&mut ObjectRef)) {
        let _ = (obj, visit);
    }
}

/// Per-thread state of one scan, mirrored from the collector.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScanContext {
    /// Heap (server GC worker) this scan works for. Selects the table of
    /// every bucket that is visited.
    pub heap: usize,
    /// True while marking, false while relocating or enumerating.
    pub promotion: bool,
    /// True during a background (concurrent) phase.
    pub concurrent: bool,
}

impl ScanContext {
    pub fn for_heap(heap: usize) -> Self {
        Self {
            heap,
            promotion: true,
            concurrent: false,
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PromoteFlags: u32 {
        /// The object must not move during this collection.
        const PINNED = 1 << 0;
    }
}

/// Callback the collector supplies to mark, relocate or enumerate one
/// object slot. The same shape is reused by every pass; the wrapping
/// visitor decides what the call means.
pub type PromoteFn<'a> = dyn FnMut(&mut ObjectRef, &ScanContext, PromoteFlags) + 'a;
