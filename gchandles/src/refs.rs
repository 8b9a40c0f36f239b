//! Per-kind collector passes over every bucket of a map.
//!
//! Each pass scans the table belonging to `sc.heap` in every registered
//! bucket, so server-style collectors run one call per heap in parallel.
//! Every kind group gets its own visitor; the promote callback is reused
//! unchanged for marking, relocation and enumeration.

use crate::{
    ExecutionEngine, GcHeap, Generation, HandleError, HandleKind, HandleTableMap, HandleVisitor,
    KindSet, ObjectRef, PromoteFlags, PromoteFn, ScanContext, ScanFlags, ScanSlot,
    VariableStrength, stats::ScanSummary,
};

const ALL_WITHOUT_DEPENDENT: KindSet = KindSet::EMPTY
    .with(HandleKind::WeakShort)
    .with(HandleKind::WeakLong)
    .with(HandleKind::Strong)
    .with(HandleKind::Pinned)
    .with(HandleKind::Variable)
    .with(HandleKind::RefCounted)
    .with(HandleKind::AsyncPinned)
    .with(HandleKind::SizedRef);

#[inline(always)]
fn only(kind: HandleKind) -> KindSet {
    KindSet::EMPTY.with(kind)
}

#[inline]
fn strength(slot: &ScanSlot<'_>) -> Option<VariableStrength> {
    VariableStrength::from_bits(slot.extra())
}

impl HandleTableMap {
    pub(crate) fn scan_heap(
        &self,
        sc: &ScanContext,
        kinds: KindSet,
        condemned: Generation,
        flags: ScanFlags,
        mut visitor: Option<&mut (dyn HandleVisitor + '_)>,
    ) -> ScanSummary {
        let flags = if sc.concurrent {
            flags | ScanFlags::ASYNC
        } else {
            flags
        };
        let max_generation = self.settings().max_generation;
        let mut summary = ScanSummary::default();
        self.for_each_bucket(|bucket| {
            if let Some(table) = bucket.table(sc.heap) {
                summary += table.scan_for_gc(
                    kinds,
                    condemned,
                    max_generation,
                    flags,
                    visitor.as_deref_mut(),
                );
            }
        });
        self.stats().record_scan(&summary);
        summary
    }

    // ── Marking ──────────────────────────────────────────────────────

    /// Promotes everything that must neither die nor move: pinned and
    /// async-pinned handles (with the runtime's extra objects) and variable
    /// handles tagged pinned.
    pub fn trace_pinning_roots(
        &self,
        condemned: Generation,
        sc: &ScanContext,
        engine: &dyn ExecutionEngine,
        promote: &mut PromoteFn<'_>,
    ) {
        debug_assert!(sc.promotion, "root tracing outside the promotion phase");
        log::trace!("heap {}: pinning roots, condemned {condemned}", sc.heap);

        let mut pinned = |slot: &ScanSlot<'_>| {
            slot.with_object(|obj| promote(obj, sc, PromoteFlags::PINNED));
        };
        self.scan_heap(sc, only(HandleKind::Pinned), condemned, ScanFlags::empty(), Some(&mut pinned));

        let mut async_pinned = |slot: &ScanSlot<'_>| {
            slot.with_object(|obj| {
                promote(obj, sc, PromoteFlags::PINNED);
                engine.walk_async_pinned(*obj, &mut |child: &mut ObjectRef| {
                    if !child.is_null() {
                        promote(child, sc, PromoteFlags::PINNED);
                    }
                });
            });
        };
        self.scan_heap(
            sc,
            only(HandleKind::AsyncPinned),
            condemned,
            ScanFlags::empty(),
            Some(&mut async_pinned),
        );

        let mut variable = |slot: &ScanSlot<'_>| {
            if strength(slot) == Some(VariableStrength::Pinned) {
                slot.with_object(|obj| promote(obj, sc, PromoteFlags::PINNED));
            }
        };
        self.scan_heap(
            sc,
            only(HandleKind::Variable),
            condemned,
            ScanFlags::EXTRA_INFO,
            Some(&mut variable),
        );
    }

    /// Promotes strong, sized-ref, strong-tagged variable and (outside
    /// concurrent phases) externally referenced ref-counted handles.
    pub fn trace_normal_roots(
        &self,
        condemned: Generation,
        sc: &ScanContext,
        heap: &dyn GcHeap,
        engine: &dyn ExecutionEngine,
        promote: &mut PromoteFn<'_>,
    ) {
        debug_assert!(sc.promotion, "root tracing outside the promotion phase");
        log::trace!("heap {}: normal roots, condemned {condemned}", sc.heap);

        let mut strong = |slot: &ScanSlot<'_>| {
            slot.with_object(|obj| promote(obj, sc, PromoteFlags::empty()));
        };
        self.scan_heap(sc, only(HandleKind::Strong), condemned, ScanFlags::empty(), Some(&mut strong));

        let mut sized = |slot: &ScanSlot<'_>| {
            let before = heap.promoted_bytes(sc.heap);
            slot.with_object(|obj| promote(obj, sc, PromoteFlags::empty()));
            let after = heap.promoted_bytes(sc.heap);
            slot.set_extra(after.saturating_sub(before));
        };
        self.scan_heap(
            sc,
            only(HandleKind::SizedRef),
            condemned,
            ScanFlags::EXTRA_INFO,
            Some(&mut sized),
        );

        let mut variable = |slot: &ScanSlot<'_>| {
            if strength(slot) == Some(VariableStrength::Strong) {
                slot.with_object(|obj| promote(obj, sc, PromoteFlags::empty()));
            }
        };
        self.scan_heap(
            sc,
            only(HandleKind::Variable),
            condemned,
            ScanFlags::EXTRA_INFO,
            Some(&mut variable),
        );

        // the external count can change under a concurrent mark
        if sc.concurrent {
            return;
        }
        let mut ref_counted = |slot: &ScanSlot<'_>| {
            if engine.ref_count_is_positive(slot.object()) {
                slot.with_object(|obj| promote(obj, sc, PromoteFlags::empty()));
            }
        };
        self.scan_heap(
            sc,
            only(HandleKind::RefCounted),
            condemned,
            ScanFlags::empty(),
            Some(&mut ref_counted),
        );
    }

    // ── Clearing ─────────────────────────────────────────────────────

    /// Clears short weak handles (and weak-short tagged variable handles,
    /// unreferenced ref-counted handles) whose referent was not promoted.
    pub fn clear_short_weak(&self, condemned: Generation, sc: &ScanContext, heap: &dyn GcHeap) {
        let mut weak = |slot: &ScanSlot<'_>| {
            if !heap.is_promoted(slot.object()) {
                slot.set_object(ObjectRef::NULL);
            }
        };
        let kinds = if sc.concurrent {
            only(HandleKind::WeakShort)
        } else {
            only(HandleKind::WeakShort).with(HandleKind::RefCounted)
        };
        self.scan_heap(sc, kinds, condemned, ScanFlags::empty(), Some(&mut weak));

        let mut variable = |slot: &ScanSlot<'_>| {
            if strength(slot) == Some(VariableStrength::WeakShort) && !heap.is_promoted(slot.object())
            {
                slot.set_object(ObjectRef::NULL);
            }
        };
        self.scan_heap(
            sc,
            only(HandleKind::Variable),
            condemned,
            ScanFlags::EXTRA_INFO,
            Some(&mut variable),
        );
    }

    /// Clears long weak handles (and weak-long tagged variable handles)
    /// whose referent was not promoted by the end of marking.
    pub fn clear_long_weak(&self, condemned: Generation, sc: &ScanContext, heap: &dyn GcHeap) {
        let mut weak = |slot: &ScanSlot<'_>| {
            if !heap.is_promoted(slot.object()) {
                slot.set_object(ObjectRef::NULL);
            }
        };
        self.scan_heap(sc, only(HandleKind::WeakLong), condemned, ScanFlags::empty(), Some(&mut weak));

        let mut variable = |slot: &ScanSlot<'_>| {
            if strength(slot) == Some(VariableStrength::WeakLong) && !heap.is_promoted(slot.object()) {
                slot.set_object(ObjectRef::NULL);
            }
        };
        self.scan_heap(
            sc,
            only(HandleKind::Variable),
            condemned,
            ScanFlags::EXTRA_INFO,
            Some(&mut variable),
        );
    }

    // ── Relocation and aging ─────────────────────────────────────────

    /// Hands every referent of every kind to `relocate`, dependent
    /// secondaries included.
    pub fn update_pointers(
        &self,
        condemned: Generation,
        sc: &ScanContext,
        relocate: &mut PromoteFn<'_>,
    ) {
        debug_assert!(!sc.promotion, "pointer update during the promotion phase");
        log::trace!("heap {}: updating handle pointers, condemned {condemned}", sc.heap);

        let mut update = |slot: &ScanSlot<'_>| {
            slot.with_object(|obj| relocate(obj, sc, PromoteFlags::empty()));
        };
        self.scan_heap(sc, ALL_WITHOUT_DEPENDENT, condemned, ScanFlags::empty(), Some(&mut update));

        let mut dependent = |slot: &ScanSlot<'_>| {
            slot.with_object(|obj| relocate(obj, sc, PromoteFlags::empty()));
            slot.with_extra_object(|secondary| {
                if !secondary.is_null() {
                    relocate(secondary, sc, PromoteFlags::empty());
                }
            });
        };
        self.scan_heap(
            sc,
            only(HandleKind::Dependent),
            condemned,
            ScanFlags::EXTRA_INFO,
            Some(&mut dependent),
        );
    }

    /// Ages every condemned clump by one generation after a collection.
    /// Mutators must still be stopped: a handle created meanwhile would be
    /// aged along with its clump.
    pub fn age_handles(&self, condemned: Generation, sc: &ScanContext) {
        self.scan_heap(sc, KindSet::ALL, condemned, ScanFlags::AGE, None);
    }

    /// Makes every condemned clump youngest again, e.g. after demotion.
    pub fn rejuvenate_handles(&self, condemned: Generation, sc: &ScanContext) {
        self.scan_heap(sc, KindSet::ALL, condemned, ScanFlags::REJUVENATE, None);
    }

    /// Recomputes condemned clump ages from the collector's generations.
    pub fn reset_age_map(&self, condemned: Generation, sc: &ScanContext, heap: &dyn GcHeap) {
        let max_generation = self.settings().max_generation;
        self.for_each_bucket(|bucket| {
            if let Some(table) = bucket.table(sc.heap) {
                table.reset_age_map(KindSet::ALL, condemned, max_generation, heap);
            }
        });
    }

    // ── Diagnostics ──────────────────────────────────────────────────

    /// Checks the age map of every table of `sc.heap` against the
    /// collector's generations.
    pub fn verify_handles(&self, sc: &ScanContext, heap: &dyn GcHeap) -> Result<(), HandleError> {
        let mut result = Ok(());
        self.for_each_bucket(|bucket| {
            if result.is_err() {
                return;
            }
            if let Some(table) = bucket.table(sc.heap) {
                result = table.verify(KindSet::ALL, heap);
            }
        });
        result
    }

    /// Visits every live handle of `kinds` on `sc.heap`, regardless of age.
    pub fn enumerate_handles(
        &self,
        kinds: KindSet,
        sc: &ScanContext,
        visitor: &mut dyn HandleVisitor,
    ) -> ScanSummary {
        let mut summary = ScanSummary::default();
        self.for_each_bucket(|bucket| {
            if let Some(table) = bucket.table(sc.heap) {
                summary += table.enumerate(kinds, &mut *visitor);
            }
        });
        summary
    }

    pub fn notify_gc_cycle_complete(&self, condemned: Generation) {
        self.stats().record_cycle(condemned);
        let snapshot = self.stats().snapshot();
        log::debug!(
            "gc cycle complete (condemned {condemned}): {} handles visited, {} blocks and {} clumps skipped so far",
            snapshot.handles_visited,
            snapshot.blocks_skipped,
            snapshot.clumps_skipped
        );
    }
}
