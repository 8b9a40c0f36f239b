//! Dependent handles: promotion to a fixed point, then clearing.
//!
//! A dependent handle keeps its secondary (stored as extra info) alive for
//! as long as its primary is alive. Promoting a secondary can make another
//! handle's primary reachable, so the promotion scan repeats until a pass
//! either promotes nothing or finds no unpromoted primary left.

use crate::{
    GcHeap, Generation, HandleKind, HandleTableMap, KindSet, ObjectRef, PromoteFlags, PromoteFn,
    ScanContext, ScanFlags, ScanSlot,
};

const DEPENDENT: KindSet = KindSet::EMPTY.with(HandleKind::Dependent);

/// Scratch state of one heap's dependent handle scan for one GC cycle.
/// Owned by the collector thread working for that heap.
pub struct DhContext<'a> {
    pub condemned: Generation,
    pub sc: ScanContext,
    promote: &'a mut PromoteFn<'a>,
    /// Some visited handle had a live-looking but unpromoted primary.
    pub unpromoted_primaries: bool,
    /// The last pass promoted at least one secondary.
    pub promoted: bool,
    /// Passes run by the last call to `scan_dependent_handles_for_promotion`.
    pub iterations: usize,
}

impl<'a> DhContext<'a> {
    pub fn new(condemned: Generation, sc: ScanContext, promote: &'a mut PromoteFn<'a>) -> Self {
        Self {
            condemned,
            sc,
            promote,
            unpromoted_primaries: false,
            promoted: false,
            iterations: 0,
        }
    }
}

impl HandleTableMap {
    /// Promotes the secondaries of dependent handles whose primary is
    /// promoted, repeating until nothing changes. Returns whether anything
    /// was promoted across all passes; the collector then drains its mark
    /// stack and calls again until this returns false.
    pub fn scan_dependent_handles_for_promotion(
        &self,
        ctx: &mut DhContext<'_>,
        heap: &dyn GcHeap,
    ) -> bool {
        let mut promoted_any = false;
        ctx.iterations = 0;
        loop {
            ctx.unpromoted_primaries = false;
            ctx.promoted = false;
            ctx.iterations += 1;

            let sc = ctx.sc;
            let condemned = ctx.condemned;
            let DhContext {
                promote,
                unpromoted_primaries,
                promoted,
                ..
            } = ctx;
            let mut visitor = |slot: &ScanSlot<'_>| {
                if heap.is_promoted(slot.object()) {
                    slot.with_extra_object(|secondary| {
                        if !secondary.is_null() && !heap.is_promoted(*secondary) {
                            (*promote)(secondary, &sc, PromoteFlags::empty());
                            *promoted = true;
                        }
                    });
                } else {
                    *unpromoted_primaries = true;
                }
            };
            self.scan_heap(&sc, DEPENDENT, condemned, ScanFlags::EXTRA_INFO, Some(&mut visitor));

            promoted_any |= ctx.promoted;
            if !(ctx.unpromoted_primaries && ctx.promoted) {
                break;
            }
        }
        log::trace!(
            "heap {}: dependent handle promotion converged after {} passes",
            ctx.sc.heap,
            ctx.iterations
        );
        promoted_any
    }

    /// Single pass after marking: every pair whose primary died loses both
    /// its primary and its secondary.
    pub fn clear_dependent_handles(
        &self,
        condemned: Generation,
        sc: &ScanContext,
        heap: &dyn GcHeap,
    ) {
        let mut visitor = |slot: &ScanSlot<'_>| {
            if !heap.is_promoted(slot.object()) {
                slot.set_extra(ObjectRef::NULL.addr());
                slot.set_object(ObjectRef::NULL);
            }
        };
        self.scan_heap(sc, DEPENDENT, condemned, ScanFlags::EXTRA_INFO, Some(&mut visitor));
    }
}
