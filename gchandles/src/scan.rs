//! Scan dispatch engine.
//!
//! A scan is planned once per call from (condemned, max generation, flags,
//! visitor present) and then driven over every segment of a table under the
//! table lock. The plan fixes which blocks and clumps are visited and how a
//! visited cell is handed to the visitor.

use std::{
    cell::RefCell,
    ptr::NonNull,
    sync::atomic::{Ordering, fence},
};

use bitflags::bitflags;
use parking_lot::ReentrantMutexGuard;

use crate::{
    GcHeap, Generation, Handle, HandleError, HandleKind, HandleTable, KindSet, ObjectRef,
    age::{self, AgeMask, CLUMPS_PER_BLOCK, HANDLES_PER_BLOCK, HANDLES_PER_CLUMP},
    segment::{BLOCKS_PER_SEGMENT, Segment},
    stats::ScanSummary,
    table::TableState,
};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ScanFlags: u32 {
        /// Age every visited condemned clump by one generation afterwards.
        const AGE = 1 << 0;
        /// Reset every visited clump to age 0 afterwards.
        const REJUVENATE = 1 << 1;
        /// Let other threads take the table lock between segments.
        const ASYNC = 1 << 2;
        /// The visitor reads or writes extra info.
        const EXTRA_INFO = 1 << 3;
    }
}

/// Receives every live cell a scan selects.
pub trait HandleVisitor {
    fn visit(&mut self, slot: &ScanSlot<'_>);
}

impl<F> HandleVisitor for F
where
    F: FnMut(&ScanSlot<'_>),
{
    #[inline(always)]
    fn visit(&mut self, slot: &ScanSlot<'_>) {
        self(slot)
    }
}

/// One live cell as seen by a visitor.
///
/// The referent is read once when the slot is built; visitors act on that
/// snapshot and write back through [`ScanSlot::set_object`].
pub struct ScanSlot<'a> {
    segment: &'a Segment,
    index: usize,
    kind: HandleKind,
    object: ObjectRef,
    with_extra: bool,
}

impl ScanSlot<'_> {
    #[inline(always)]
    pub fn kind(&self) -> HandleKind {
        self.kind
    }

    #[inline(always)]
    pub fn handle(&self) -> Handle {
        self.segment.handle(self.index)
    }

    /// The referent at the time the slot was visited. Never null.
    #[inline(always)]
    pub fn object(&self) -> ObjectRef {
        self.object
    }

    #[inline(always)]
    pub fn set_object(&self, value: ObjectRef) {
        self.segment.cell(self.index).store(value.addr(), Ordering::Release);
    }

    /// Runs `f` on a copy of the referent and stores it back if changed.
    #[inline]
    pub fn with_object<R>(&self, f: impl FnOnce(&mut ObjectRef) -> R) -> R {
        let mut obj = self.object;
        let result = f(&mut obj);
        if obj != self.object {
            self.set_object(obj);
        }
        result
    }

    #[inline]
    pub fn extra(&self) -> usize {
        debug_assert!(self.with_extra, "extra info read without ScanFlags::EXTRA_INFO");
        self.segment.extra(self.index).load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_extra(&self, value: usize) {
        debug_assert!(self.with_extra, "extra info written without ScanFlags::EXTRA_INFO");
        self.segment.extra(self.index).store(value, Ordering::Release);
    }

    /// Like [`ScanSlot::with_object`] for an object stored as extra info.
    #[inline]
    pub fn with_extra_object<R>(&self, f: impl FnOnce(&mut ObjectRef) -> R) -> R {
        let before = ObjectRef::from_addr(self.extra());
        let mut obj = before;
        let result = f(&mut obj);
        if obj != before {
            self.set_extra(obj.addr());
        }
        result
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SegmentIterator {
    /// Every block, every clump.
    Full,
    /// Every block, clumps filtered by age.
    Standard,
    /// Blocks filtered by their packed ages first, then clumps.
    Quick,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockScan {
    WithExtra,
    WithoutExtra,
    /// No visitor: only the age map is touched.
    AgeOnly,
}

#[derive(Debug, Clone, Copy)]
struct ScanPlan {
    kinds: KindSet,
    mask: AgeMask,
    max_generation: Generation,
    flags: ScanFlags,
    iterator: SegmentIterator,
    block_scan: BlockScan,
}

impl ScanPlan {
    fn new(
        kinds: KindSet,
        condemned: Generation,
        max_generation: Generation,
        flags: ScanFlags,
        has_visitor: bool,
    ) -> Self {
        let mask = AgeMask::new(condemned, max_generation);
        let iterator = if mask.covers_everything() {
            SegmentIterator::Full
        } else if condemned == 0 {
            SegmentIterator::Quick
        } else {
            SegmentIterator::Standard
        };
        let block_scan = match (has_visitor, flags.contains(ScanFlags::EXTRA_INFO)) {
            (false, _) => BlockScan::AgeOnly,
            (true, true) => BlockScan::WithExtra,
            (true, false) => BlockScan::WithoutExtra,
        };
        Self {
            kinds,
            mask,
            max_generation,
            flags,
            iterator,
            block_scan,
        }
    }

    #[inline(always)]
    fn visits_clump(&self, age: Generation) -> bool {
        self.iterator == SegmentIterator::Full || self.mask.clump_is_condemned(age)
    }
}

impl HandleTable {
    /// Generational scan over the handles of `kinds`.
    ///
    /// Clumps whose age is older than `condemned` are skipped unless
    /// `condemned >= max_generation`. Without a visitor only the age map is
    /// updated. Returns what the scan visited and skipped.
    pub fn scan_for_gc(
        &self,
        kinds: KindSet,
        condemned: Generation,
        max_generation: Generation,
        flags: ScanFlags,
        mut visitor: Option<&mut (dyn HandleVisitor + '_)>,
    ) -> ScanSummary {
        let plan = ScanPlan::new(kinds, condemned, max_generation, flags, visitor.is_some());
        debug_assert!(
            !flags.contains(ScanFlags::EXTRA_INFO)
                || kinds.iter().all(|kind| self.has_extra_info(kind)),
            "extra info scan over kinds without extra info"
        );
        log::trace!(
            "table {}: scan {:?} condemned {} max {} via {:?}/{:?}",
            self.id(),
            kinds,
            condemned,
            max_generation,
            plan.iterator,
            plan.block_scan
        );

        let mut summary = ScanSummary::default();
        let mut guard = self.lock();
        let mut ordinal = 0;
        while let Some(segment) = next_segment(&guard, ordinal) {
            // SAFETY: segments live until the table is dropped, which cannot
            // happen while `self` is borrowed
            let segment = unsafe { segment.as_ref() };
            scan_segment(segment, &plan, visitor.as_deref_mut(), &mut summary);
            ordinal += 1;
            if flags.contains(ScanFlags::ASYNC) {
                ReentrantMutexGuard::bump(&mut guard);
            }
        }
        summary
    }

    /// Visits every live handle of `kinds`, ignoring ages.
    pub fn enumerate(&self, kinds: KindSet, visitor: &mut dyn HandleVisitor) -> ScanSummary {
        let extra = kinds.iter().all(|kind| self.has_extra_info(kind));
        let flags = if extra {
            ScanFlags::EXTRA_INFO
        } else {
            ScanFlags::empty()
        };
        self.scan_for_gc(kinds, 0, 0, flags, Some(visitor))
    }

    /// Recomputes the age of every condemned clump of `kinds` from the
    /// current generations of its referents. Empty clumps become oldest.
    ///
    /// Mutators may keep creating handles meanwhile: a clump that was made
    /// older is read again, and any referent stored since lowers it back.
    pub fn reset_age_map(
        &self,
        kinds: KindSet,
        condemned: Generation,
        max_generation: Generation,
        heap: &dyn GcHeap,
    ) {
        let mask = AgeMask::new(condemned, max_generation);
        self.for_each_block(kinds, |segment, block, kind| {
            let youngest_in = |first: usize| {
                (first..first + HANDLES_PER_CLUMP)
                    .map(|index| ObjectRef::from_addr(segment.cell(index).load(Ordering::Acquire)))
                    .filter(|obj| !obj.is_null())
                    .map(|obj| {
                        if kind.forces_young_age() {
                            0
                        } else {
                            heap.generation_of(obj)
                        }
                    })
                    .min()
                    .unwrap_or(max_generation)
                    .min(max_generation)
            };
            for clump in 0..CLUMPS_PER_BLOCK {
                let first = block * HANDLES_PER_BLOCK + clump * HANDLES_PER_CLUMP;
                let age = segment.clump_age(first);
                let observed = age.load(Ordering::Relaxed);
                if !mask.clump_is_condemned(observed) {
                    continue;
                }
                let youngest = youngest_in(first);
                if youngest <= observed {
                    age::lower_age(age, youngest);
                    continue;
                }
                if !age::raise_age(age, observed, youngest) {
                    continue;
                }
                // pairs with the fence in `Handle::write_barrier`: either a
                // racing store is seen here or its barrier sees the raise
                fence(Ordering::SeqCst);
                let recheck = youngest_in(first);
                if recheck < youngest {
                    age::lower_age(age, recheck);
                }
            }
        });
    }

    /// Checks that no clump of `kinds` records an age older than one of its
    /// referents. Dependent secondaries are checked as well.
    pub fn verify(&self, kinds: KindSet, heap: &dyn GcHeap) -> Result<(), HandleError> {
        let mut result = Ok(());
        self.for_each_block(kinds, |segment, block, kind| {
            if result.is_err() {
                return;
            }
            let first = block * HANDLES_PER_BLOCK;
            for index in first..first + HANDLES_PER_BLOCK {
                let age = segment.clump_age(index).load(Ordering::Relaxed);
                let obj = ObjectRef::from_addr(segment.cell(index).load(Ordering::Acquire));
                if obj.is_null() {
                    continue;
                }
                let secondary = if kind == HandleKind::Dependent {
                    ObjectRef::from_addr(segment.extra(index).load(Ordering::Acquire))
                } else {
                    ObjectRef::NULL
                };
                for object in [obj, secondary].into_iter().filter(|o| !o.is_null()) {
                    let generation = heap.generation_of(object);
                    if age > generation {
                        result = Err(HandleError::AgeViolation {
                            object,
                            age,
                            generation,
                        });
                        return;
                    }
                }
            }
        });
        result
    }

    /// Runs `f` on every block assigned to one of `kinds`, with the lock
    /// held for the whole walk.
    fn for_each_block(&self, kinds: KindSet, mut f: impl FnMut(&Segment, usize, HandleKind)) {
        let guard = self.lock();
        let mut ordinal = 0;
        while let Some(segment) = next_segment(&guard, ordinal) {
            // SAFETY: see `scan_for_gc`
            let segment = unsafe { segment.as_ref() };
            for block in 0..BLOCKS_PER_SEGMENT {
                if let Some(kind) = segment.block_kind(block).filter(|&k| kinds.contains(k)) {
                    f(segment, block, kind);
                }
            }
            ordinal += 1;
        }
    }
}

#[inline]
fn next_segment(
    guard: &ReentrantMutexGuard<'_, RefCell<TableState>>,
    ordinal: usize,
) -> Option<NonNull<Segment>> {
    guard.borrow().segment(ordinal)
}

fn scan_segment<V: HandleVisitor + ?Sized>(
    segment: &Segment,
    plan: &ScanPlan,
    mut visitor: Option<&mut V>,
    summary: &mut ScanSummary,
) {
    for block in 0..BLOCKS_PER_SEGMENT {
        let Some(kind) = segment.block_kind(block) else {
            continue;
        };
        if !plan.kinds.contains(kind) {
            continue;
        }
        if plan.iterator == SegmentIterator::Quick
            && !plan
                .mask
                .block_has_condemned_clump(age::pack_block_ages(segment.block_ages(block)))
        {
            summary.blocks_skipped += 1;
            continue;
        }
        scan_block(segment, block, kind, plan, visitor.as_deref_mut(), summary);
    }
}

fn scan_block<V: HandleVisitor + ?Sized>(
    segment: &Segment,
    block: usize,
    kind: HandleKind,
    plan: &ScanPlan,
    mut visitor: Option<&mut V>,
    summary: &mut ScanSummary,
) {
    for clump in 0..CLUMPS_PER_BLOCK {
        let first = block * HANDLES_PER_BLOCK + clump * HANDLES_PER_CLUMP;
        let age = segment.clump_age(first);
        if !plan.visits_clump(age.load(Ordering::Relaxed)) {
            summary.clumps_skipped += 1;
            continue;
        }

        if let Some(visitor) = visitor.as_deref_mut() {
            let with_extra = plan.block_scan == BlockScan::WithExtra;
            for index in first..first + HANDLES_PER_CLUMP {
                let object = ObjectRef::from_addr(segment.cell(index).load(Ordering::Acquire));
                if object.is_null() {
                    continue;
                }
                let slot = ScanSlot {
                    segment,
                    index,
                    kind,
                    object,
                    with_extra,
                };
                visitor.visit(&slot);
                summary.handles_visited += 1;
            }
        }

        if plan.flags.contains(ScanFlags::REJUVENATE) {
            age::force_young(age);
        } else if plan.flags.contains(ScanFlags::AGE) {
            age::age_clump(age, plan.mask, plan.max_generation);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ObjectRef, sim::SimulatedHeap};

    fn mk_table() -> HandleTable {
        HandleTable::new(&HandleKind::default_flags(), 0).unwrap()
    }

    fn set_age(handle: Handle, value: Generation) {
        let segment = handle.segment();
        segment
            .clump_age(segment.cell_index(handle))
            .store(value, Ordering::Relaxed);
    }

    fn age_of(handle: Handle) -> Generation {
        let segment = handle.segment();
        segment
            .clump_age(segment.cell_index(handle))
            .load(Ordering::Relaxed)
    }

    fn strong(table: &HandleTable, addr: usize) -> Handle {
        table
            .create_handle(HandleKind::Strong, ObjectRef::from_addr(addr), 0)
            .unwrap()
    }

    fn strong_to(table: &HandleTable, obj: ObjectRef) -> Handle {
        table.create_handle(HandleKind::Strong, obj, 0).unwrap()
    }

    fn count_visits(
        table: &HandleTable,
        kinds: KindSet,
        condemned: Generation,
        flags: ScanFlags,
    ) -> (usize, ScanSummary) {
        let mut seen = 0;
        let mut visitor = |_: &ScanSlot<'_>| seen += 1;
        let summary = table.scan_for_gc(kinds, condemned, 2, flags, Some(&mut visitor));
        (seen, summary)
    }

    #[test]
    fn test_plan_selects_iterator_and_block_scan() {
        let plan = ScanPlan::new(KindSet::ALL, 0, 2, ScanFlags::empty(), true);
        assert_eq!(plan.iterator, SegmentIterator::Quick);
        assert_eq!(plan.block_scan, BlockScan::WithoutExtra);

        let plan = ScanPlan::new(KindSet::ALL, 1, 2, ScanFlags::EXTRA_INFO, true);
        assert_eq!(plan.iterator, SegmentIterator::Standard);
        assert_eq!(plan.block_scan, BlockScan::WithExtra);

        let plan = ScanPlan::new(KindSet::ALL, 2, 2, ScanFlags::AGE, false);
        assert_eq!(plan.iterator, SegmentIterator::Full);
        assert_eq!(plan.block_scan, BlockScan::AgeOnly);
    }

    #[test]
    fn test_quick_scan_skips_old_blocks() {
        let table = mk_table();
        let handle = strong(&table, 0x100);
        let strong_set = KindSet::of(&[HandleKind::Strong]);

        let (seen, _) = count_visits(&table, strong_set, 0, ScanFlags::empty());
        assert_eq!(seen, 1);

        // whole block old: skipped before looking at clumps
        let segment = handle.segment();
        let block = segment.cell_index(handle) / HANDLES_PER_BLOCK;
        for age in segment.block_ages(block) {
            age.store(2, Ordering::Relaxed);
        }
        let (seen, summary) = count_visits(&table, strong_set, 0, ScanFlags::empty());
        assert_eq!(seen, 0);
        assert_eq!(summary.blocks_skipped, 1);

        // a full collection still sees it
        let (seen, _) = count_visits(&table, strong_set, 2, ScanFlags::empty());
        assert_eq!(seen, 1);
    }

    #[test]
    fn test_standard_scan_filters_clumps() {
        let table = mk_table();
        let handles: Vec<_> = (1..=HANDLES_PER_CLUMP * 2)
            .map(|i| strong(&table, i * 8))
            .collect();
        set_age(handles[HANDLES_PER_CLUMP], 1);
        set_age(handles[0], 2);
        let expected = handles.iter().filter(|&&h| age_of(h) <= 1).count();
        assert!(expected < handles.len());

        let strong_set = KindSet::of(&[HandleKind::Strong]);
        let (seen, summary) = count_visits(&table, strong_set, 1, ScanFlags::empty());
        assert_eq!(seen, expected);
        assert!(summary.clumps_skipped >= 1);
    }

    #[test]
    fn test_scan_only_visits_requested_kinds() {
        let table = mk_table();
        strong(&table, 0x100);
        table
            .create_handle(HandleKind::WeakShort, ObjectRef::from_addr(0x200), 0)
            .unwrap();
        table
            .create_handle(HandleKind::Pinned, ObjectRef::NULL, 0)
            .unwrap();

        let mut kinds = Vec::new();
        let mut visitor = |slot: &ScanSlot<'_>| kinds.push(slot.kind());
        table.scan_for_gc(
            KindSet::of(&[HandleKind::WeakShort, HandleKind::Pinned]),
            2,
            2,
            ScanFlags::empty(),
            Some(&mut visitor),
        );
        // the null pinned handle is not visited
        assert_eq!(kinds, vec![HandleKind::WeakShort]);
    }

    #[test]
    fn test_visitor_updates_referent() {
        let table = mk_table();
        let handle = strong(&table, 0x100);
        let mut visitor = |slot: &ScanSlot<'_>| {
            slot.with_object(|obj| *obj = ObjectRef::from_addr(obj.addr() + 0x1000))
        };
        table.scan_for_gc(KindSet::ALL, 2, 2, ScanFlags::empty(), Some(&mut visitor));
        assert_eq!(handle.object(), ObjectRef::from_addr(0x1100));
    }

    #[test]
    fn test_age_flag_ages_condemned_clumps() {
        let table = mk_table();
        let handle = strong(&table, 0x100);
        assert_eq!(age_of(handle), 0);

        let strong_set = KindSet::of(&[HandleKind::Strong]);
        table.scan_for_gc(strong_set, 0, 2, ScanFlags::AGE, None);
        assert_eq!(age_of(handle), 1);
        // gen 1 clump is not condemned by a gen 0 collection
        table.scan_for_gc(strong_set, 0, 2, ScanFlags::AGE, None);
        assert_eq!(age_of(handle), 1);
        table.scan_for_gc(strong_set, 1, 2, ScanFlags::AGE, None);
        assert_eq!(age_of(handle), 2);
        // capped at max generation
        table.scan_for_gc(strong_set, 2, 2, ScanFlags::AGE, None);
        assert_eq!(age_of(handle), 2);

        table.scan_for_gc(strong_set, 2, 2, ScanFlags::REJUVENATE, None);
        assert_eq!(age_of(handle), 0);
    }

    #[test]
    fn test_async_scan_allows_reentrant_create() {
        let table = mk_table();
        for i in 1..=200 {
            strong(&table, i * 8);
        }
        let mut created = Vec::new();
        let mut visitor = |slot: &ScanSlot<'_>| {
            if created.len() < 100 {
                created.push(
                    table
                        .create_handle(HandleKind::WeakLong, slot.object(), 0)
                        .unwrap(),
                );
            }
        };
        table.scan_for_gc(
            KindSet::of(&[HandleKind::Strong]),
            2,
            2,
            ScanFlags::ASYNC,
            Some(&mut visitor),
        );
        assert_eq!(created.len(), 100);
        assert_eq!(table.count_handles(), 300);
    }

    #[test]
    fn test_extra_info_visible_to_visitor() {
        let table = mk_table();
        table
            .create_handle(HandleKind::Dependent, ObjectRef::from_addr(0x100), 0x200)
            .unwrap();
        let mut secondaries = Vec::new();
        let mut visitor = |slot: &ScanSlot<'_>| secondaries.push(slot.extra());
        table.scan_for_gc(
            KindSet::of(&[HandleKind::Dependent]),
            2,
            2,
            ScanFlags::EXTRA_INFO,
            Some(&mut visitor),
        );
        assert_eq!(secondaries, vec![0x200]);
    }

    #[test]
    fn test_reset_age_map_uses_generations() {
        let heap = SimulatedHeap::new(1, 2);
        let table = mk_table();
        let old = heap.allocate_in(64, 2);
        let handle = table
            .create_handle(HandleKind::Strong, old, 0)
            .unwrap();
        assert_eq!(age_of(handle), 0);

        let strong_set = KindSet::of(&[HandleKind::Strong]);
        table.reset_age_map(strong_set, 2, 2, &heap);
        assert_eq!(age_of(handle), 2);

        let young = heap.allocate_in(64, 0);
        let other = table.create_handle(HandleKind::Strong, young, 0).unwrap();
        set_age(other, 2);
        table.reset_age_map(strong_set, 2, 2, &heap);
        assert_eq!(age_of(other), 0);

        // an emptied clump becomes oldest
        table.destroy_handle(HandleKind::Strong, other);
        table.reset_age_map(strong_set, 2, 2, &heap);
        assert_eq!(age_of(other), 2);
        assert_eq!(age_of(handle), 2);
    }

    /// Creates one young handle the first time the reset asks for a
    /// generation, while the clump is being recomputed.
    struct CreatingHeap<'a> {
        sim: &'a SimulatedHeap,
        table: &'a HandleTable,
        young: ObjectRef,
        created: parking_lot::Mutex<Option<Handle>>,
    }

    impl GcHeap for CreatingHeap<'_> {
        fn generation_of(&self, obj: ObjectRef) -> Generation {
            let mut created = self.created.lock();
            if created.is_none() {
                *created = Some(
                    self.table
                        .create_handle(HandleKind::Strong, self.young, 0)
                        .unwrap(),
                );
            }
            self.sim.generation_of(obj)
        }

        fn is_promoted(&self, obj: ObjectRef) -> bool {
            self.sim.is_promoted(obj)
        }
    }

    #[test]
    fn test_reset_age_map_keeps_concurrently_created_handles_young() {
        let sim = SimulatedHeap::new(1, 2);
        let table = mk_table();

        // two old handles sharing a clump
        let mut handles: Vec<Handle> = Vec::new();
        let (lo, hi) = loop {
            handles.push(strong_to(&table, sim.allocate_in(16, 2)));
            let last = handles[handles.len() - 1];
            let clump_of = |h: Handle| h.segment().cell_index(h) / HANDLES_PER_CLUMP;
            let mate = handles[..handles.len() - 1]
                .iter()
                .copied()
                .find(|&h| clump_of(h) == clump_of(last));
            if let Some(mate) = mate {
                break if mate.addr() < last.addr() {
                    (mate, last)
                } else {
                    (last, mate)
                };
            }
        };
        assert_eq!(age_of(hi), 0);

        // the freed lower cell is read as empty, then reused mid-reset
        table.destroy_handle(HandleKind::Strong, lo);
        let young = sim.allocate_in(16, 0);
        let heap = CreatingHeap {
            sim: &sim,
            table: &table,
            young,
            created: parking_lot::Mutex::new(None),
        };
        table.reset_age_map(KindSet::of(&[HandleKind::Strong]), 2, 2, &heap);

        let created = (*heap.created.lock()).unwrap();
        assert_eq!(created, lo);
        assert_eq!(created.object(), young);
        assert_eq!(age_of(hi), 0);
        assert_eq!(table.verify(KindSet::ALL, &sim), Ok(()));

        let mut seen = Vec::new();
        let mut visitor = |slot: &ScanSlot<'_>| seen.push(slot.handle());
        table.scan_for_gc(
            KindSet::of(&[HandleKind::Strong]),
            0,
            2,
            ScanFlags::empty(),
            Some(&mut visitor),
        );
        assert!(seen.contains(&created));
    }

    #[test]
    fn test_verify_reports_too_old_clumps() {
        let heap = SimulatedHeap::new(1, 2);
        let table = mk_table();
        let young = heap.allocate_in(64, 0);
        let handle = table.create_handle(HandleKind::Strong, young, 0).unwrap();
        assert_eq!(table.verify(KindSet::ALL, &heap), Ok(()));

        set_age(handle, 2);
        assert_eq!(
            table.verify(KindSet::ALL, &heap),
            Err(HandleError::AgeViolation {
                object: young,
                age: 2,
                generation: 0,
            })
        );
    }

    #[test]
    fn test_enumerate_ignores_ages() {
        let table = mk_table();
        let handle = strong(&table, 0x100);
        set_age(handle, 2);
        let mut seen = Vec::new();
        let mut visitor = |slot: &ScanSlot<'_>| seen.push(slot.handle());
        table.enumerate(KindSet::of(&[HandleKind::Strong]), &mut visitor);
        assert_eq!(seen, vec![handle]);
    }
}
