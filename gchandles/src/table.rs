//! The handle table: segments, per-kind caches and the table lock.

use std::{
    cell::RefCell,
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering, fence},
};

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};

use crate::{
    Handle, HandleError, HandleKind, KIND_COUNT, KindFlags, ObjectRef, VariableStrength,
    age::{self, HANDLES_PER_BLOCK},
    cache::{HANDLES_PER_CACHE_BANK, TypeCache},
    segment::{BLOCKS_PER_SEGMENT, HANDLES_PER_SEGMENT, Segment, SegmentBox},
};

const _: () = assert!(HANDLES_PER_BLOCK == u64::BITS as usize, "free masks are one u64 per block");

static NEXT_TABLE_ID: AtomicUsize = AtomicUsize::new(1);

/// One table of handles, owned by one collector heap.
///
/// Creating and destroying handles normally goes through the per-kind
/// caches without taking the lock. Segment growth, cache refills and
/// scans run under the table's re-entrant lock.
pub struct HandleTable {
    id: usize,
    index: usize,
    flags: [KindFlags; KIND_COUNT],
    caches: [TypeCache; KIND_COUNT],
    lock: ReentrantMutex<RefCell<TableState>>,
}

pub(crate) struct TableState {
    segments: Vec<SegmentEntry>,
    /// Cells taken out of segment free pools, whether cached or in use.
    outstanding: usize,
}

struct SegmentEntry {
    segment: SegmentBox,
    /// One bit per cell, set while the cell is free.
    free_masks: [u64; BLOCKS_PER_SEGMENT],
}

impl HandleTable {
    /// Creates a table with one segment. Kinds without an entry in `flags`
    /// carry no extra info.
    pub fn new(flags: &[KindFlags], index: usize) -> Result<Self, HandleError> {
        debug_assert!(flags.len() <= KIND_COUNT, "more flags than handle kinds");
        let id = NEXT_TABLE_ID.fetch_add(1, Ordering::Relaxed);

        let mut kind_flags = [KindFlags::empty(); KIND_COUNT];
        for (slot, &flag) in kind_flags.iter_mut().zip(flags) {
            *slot = flag;
        }

        let mut state = TableState {
            segments: Vec::new(),
            outstanding: 0,
        };
        state.grow(id)?;

        log::debug!("created handle table {id} for heap {index}");
        Ok(Self {
            id,
            index,
            flags: kind_flags,
            caches: std::array::from_fn(|_| TypeCache::new()),
            lock: ReentrantMutex::new(RefCell::new(state)),
        })
    }

    /// Process-unique identifier, also recorded in every segment.
    #[inline(always)]
    pub fn id(&self) -> usize {
        self.id
    }

    /// Heap slot of this table within its bucket.
    #[inline(always)]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline(always)]
    pub fn kind_flags(&self, kind: HandleKind) -> KindFlags {
        self.flags[kind.index()]
    }

    #[inline(always)]
    pub(crate) fn has_extra_info(&self, kind: HandleKind) -> bool {
        self.flags[kind.index()].contains(KindFlags::EXTRA_INFO)
    }

    #[inline(always)]
    pub(crate) fn lock(&self) -> ReentrantMutexGuard<'_, RefCell<TableState>> {
        self.lock.lock()
    }

    // ── Create / destroy ─────────────────────────────────────────────

    /// Allocates a handle of `kind` referring to `obj`.
    ///
    /// A non-zero `extra` is published before the referent, so a concurrent
    /// scan never sees the referent with stale extra info. A non-null `obj`
    /// makes the cell's clump youngest; later overwrites must go through
    /// [`Handle::write_barrier`].
    pub fn create_handle(
        &self,
        kind: HandleKind,
        obj: ObjectRef,
        extra: usize,
    ) -> Result<Handle, HandleError> {
        let handle = match self.caches[kind.index()].take() {
            Some(handle) => handle,
            None => self.allocate_slow(kind)?,
        };
        debug_assert_eq!(handle.kind(), Some(kind));

        let segment = handle.segment();
        let index = segment.cell_index(handle);
        debug_assert!(
            kind != HandleKind::Variable || VariableStrength::from_bits(extra).is_some(),
            "{extra:#x} is not a variable handle strength"
        );
        if extra != 0 {
            debug_assert!(self.has_extra_info(kind), "{kind:?} carries no extra info");
            segment.extra(index).store(extra, Ordering::Relaxed);
        }
        if !obj.is_null() {
            segment.cell(index).store(obj.addr(), Ordering::Release);
            // a concurrent age reset either sees the store or we see its raise
            fence(Ordering::SeqCst);
            age::force_young(segment.clump_age(index));
        }
        Ok(handle)
    }

    /// Returns a handle to its kind's cache. Its contents are undefined
    /// afterwards; the referent is cleared so scans skip the cell.
    pub fn destroy_handle(&self, kind: HandleKind, handle: Handle) {
        debug_assert!(self.contains(handle), "{handle:?} belongs to another table");
        debug_assert_eq!(handle.kind(), Some(kind));

        handle.set_object(ObjectRef::NULL);
        if self.has_extra_info(kind) {
            let segment = handle.segment();
            segment
                .extra(segment.cell_index(handle))
                .store(0, Ordering::Relaxed);
        }
        if !self.caches[kind.index()].put(handle) {
            self.free_slow(kind, handle);
        }
    }

    /// Allocates up to `count` handles of `kind` straight from the segments
    /// and appends them to `out`. Returns how many were allocated, fewer
    /// than `count` only when memory ran out.
    pub fn create_handles(&self, kind: HandleKind, count: usize, out: &mut Vec<Handle>) -> usize {
        if out.try_reserve(count).is_err() {
            log::warn!("handle table {}: bulk allocation of {count} handles failed", self.id);
            return 0;
        }
        let guard = self.lock();
        let mut state = guard.borrow_mut();
        let before = out.len();
        // partial success is reported through the count
        let _ = state.take_cells(self.id, kind, count, out);
        out.len() - before
    }

    /// Frees a batch of handles of `kind` straight to the segments.
    pub fn destroy_handles(&self, kind: HandleKind, handles: &[Handle]) {
        let guard = self.lock();
        let mut state = guard.borrow_mut();
        for &handle in handles {
            debug_assert_eq!(handle.kind(), Some(kind));
            handle.set_object(ObjectRef::NULL);
            state.release(handle);
        }
    }

    #[cold]
    #[inline(never)]
    fn allocate_slow(&self, kind: HandleKind) -> Result<Handle, HandleError> {
        let guard = self.lock();
        let mut state = guard.borrow_mut();
        let cache = &self.caches[kind.index()];

        let mut pool = Vec::new();
        if pool.try_reserve(2 * HANDLES_PER_CACHE_BANK + 2).is_err() {
            log::warn!("handle table {}: cache refill failed", self.id);
            return Err(HandleError::OutOfMemory);
        }
        cache.drain_into(&mut pool);
        if pool.is_empty() {
            state.take_cells(self.id, kind, HANDLES_PER_CACHE_BANK + 1, &mut pool)?;
        }
        let handle = pool.pop().ok_or(HandleError::OutOfMemory)?;

        cache.refill_from(&mut pool);
        for surplus in pool {
            state.release(surplus);
        }
        Ok(handle)
    }

    #[cold]
    #[inline(never)]
    fn free_slow(&self, kind: HandleKind, handle: Handle) {
        let guard = self.lock();
        let mut state = guard.borrow_mut();
        let cache = &self.caches[kind.index()];

        let mut pool = Vec::new();
        if pool.try_reserve(2 * HANDLES_PER_CACHE_BANK + 2).is_err() {
            // no room to rebalance the cache: hand the cell straight back
            state.release(handle);
            return;
        }
        cache.drain_into(&mut pool);
        pool.push(handle);

        cache.refill_from(&mut pool);
        for surplus in pool {
            state.release(surplus);
        }
    }

    // ── Extra info ───────────────────────────────────────────────────

    #[inline]
    fn extra_word(&self, handle: Handle) -> &AtomicUsize {
        debug_assert!(
            handle.kind().is_some_and(|kind| self.has_extra_info(kind)),
            "{handle:?} carries no extra info"
        );
        let segment = handle.segment();
        let extra: *const AtomicUsize = segment.extra(segment.cell_index(handle));
        // SAFETY: the segment outlives every live handle of this table
        unsafe { &*extra }
    }

    pub fn extra_info(&self, handle: Handle) -> usize {
        self.extra_word(handle).load(Ordering::Acquire)
    }

    pub fn set_extra_info(&self, handle: Handle, value: usize) {
        self.extra_word(handle).store(value, Ordering::Release);
    }

    /// Replaces the extra info with `new` if it is `current`. Returns the
    /// prior value on success, the actual value (unchanged) on failure.
    pub fn compare_exchange_extra_info(
        &self,
        handle: Handle,
        current: usize,
        new: usize,
    ) -> Result<usize, usize> {
        self.extra_word(handle)
            .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
    }

    /// Strength tag of a variable handle.
    pub fn variable_strength(&self, handle: Handle) -> Option<VariableStrength> {
        debug_assert_eq!(handle.kind(), Some(HandleKind::Variable));
        VariableStrength::from_bits(self.extra_info(handle))
    }

    /// Changes a variable handle's strength. Scans read the tag once per
    /// cell, so a change takes effect no later than the next scan.
    pub fn set_variable_strength(&self, handle: Handle, strength: VariableStrength) {
        debug_assert_eq!(handle.kind(), Some(HandleKind::Variable));
        self.set_extra_info(handle, strength.bits());
    }

    /// Changes a variable handle's strength only if it currently is
    /// `current`. Returns the strength observed before the attempt.
    pub fn compare_exchange_variable_strength(
        &self,
        handle: Handle,
        current: VariableStrength,
        new: VariableStrength,
    ) -> Result<VariableStrength, Option<VariableStrength>> {
        debug_assert_eq!(handle.kind(), Some(HandleKind::Variable));
        match self.compare_exchange_extra_info(handle, current.bits(), new.bits()) {
            Ok(_) => Ok(current),
            Err(actual) => Err(VariableStrength::from_bits(actual)),
        }
    }

    // ── Queries ──────────────────────────────────────────────────────

    /// Number of live handles. Cells parked in caches are not counted.
    pub fn count_handles(&self) -> usize {
        let guard = self.lock();
        let outstanding = guard.borrow().outstanding;
        let cached: usize = self.caches.iter().map(TypeCache::cached).sum();
        outstanding.saturating_sub(cached)
    }

    /// Whether `handle` lives in one of this table's segments.
    pub fn contains(&self, handle: Handle) -> bool {
        let owner = Segment::containing(handle);
        let guard = self.lock();
        let state = guard.borrow();
        state
            .segments
            .iter()
            .any(|entry| entry.segment.as_ptr() == owner)
    }

    pub fn segment_count(&self) -> usize {
        self.lock().borrow().segments.len()
    }
}

impl Drop for HandleTable {
    fn drop(&mut self) {
        let state = self.lock.get_mut().get_mut();
        log::debug!(
            "destroying handle table {} ({} segments, {} outstanding cells)",
            self.id,
            state.segments.len(),
            state.outstanding
        );
    }
}

impl TableState {
    /// Segment `ordinal`, or `None` past the end of the list.
    #[inline]
    pub(crate) fn segment(&self, ordinal: usize) -> Option<NonNull<Segment>> {
        self.segments
            .get(ordinal)
            .map(|entry| entry.segment.as_ptr())
    }

    fn grow(&mut self, table_id: usize) -> Result<&mut SegmentEntry, HandleError> {
        if self.segments.try_reserve(1).is_err() {
            log::warn!("handle table {table_id}: segment list allocation failed");
            return Err(HandleError::OutOfMemory);
        }
        let ordinal = self.segments.len();
        let Some(segment) = SegmentBox::allocate(table_id, ordinal) else {
            log::warn!("handle table {table_id}: segment allocation failed");
            return Err(HandleError::OutOfMemory);
        };
        log::debug!("handle table {table_id}: allocated segment {ordinal}");
        self.segments.push(SegmentEntry {
            segment,
            free_masks: [u64::MAX; BLOCKS_PER_SEGMENT],
        });
        Ok(&mut self.segments[ordinal])
    }

    /// Takes up to `count` free cells for `kind`, growing by new segments
    /// while needed. Fails only if nothing at all could be taken.
    fn take_cells(
        &mut self,
        table_id: usize,
        kind: HandleKind,
        count: usize,
        out: &mut Vec<Handle>,
    ) -> Result<(), HandleError> {
        let mut remaining = count;
        for entry in &mut self.segments {
            remaining -= entry.take_cells(kind, remaining, out);
            if remaining == 0 {
                break;
            }
        }
        while remaining > 0 {
            match self.grow(table_id) {
                Ok(entry) => remaining -= entry.take_cells(kind, remaining, out),
                Err(err) => {
                    self.outstanding += count - remaining;
                    return if remaining == count { Err(err) } else { Ok(()) };
                }
            }
        }
        self.outstanding += count;
        Ok(())
    }

    fn release(&mut self, handle: Handle) {
        let segment = handle.segment();
        let ordinal = segment.ordinal();
        let index = segment.cell_index(handle);
        self.segments[ordinal].release(index);
        self.outstanding -= 1;
    }
}

impl SegmentEntry {
    fn take_cells(&mut self, kind: HandleKind, count: usize, out: &mut Vec<Handle>) -> usize {
        let mut taken = 0;
        // blocks already serving this kind first, then empty blocks
        for claim_free in [false, true] {
            for block in 0..BLOCKS_PER_SEGMENT {
                if taken == count {
                    return taken;
                }
                let assigned = self.segment.block_kind(block);
                let usable = match assigned {
                    Some(owner) => !claim_free && owner == kind,
                    None => claim_free,
                };
                if !usable || self.free_masks[block] == 0 {
                    continue;
                }
                if assigned.is_none() {
                    self.segment.assign_block(block, Some(kind));
                }
                taken += self.take_from_block(block, count - taken, out);
            }
        }
        taken
    }

    fn take_from_block(&mut self, block: usize, count: usize, out: &mut Vec<Handle>) -> usize {
        let mut taken = 0;
        while taken < count && self.free_masks[block] != 0 {
            let bit = self.free_masks[block].trailing_zeros() as usize;
            self.free_masks[block] &= !(1 << bit);
            let index = block * HANDLES_PER_BLOCK + bit;
            self.segment.cell(index).store(0, Ordering::Relaxed);
            self.segment.extra(index).store(0, Ordering::Relaxed);
            out.push(self.segment.handle(index));
            taken += 1;
        }
        taken
    }

    fn release(&mut self, index: usize) {
        debug_assert!(index < HANDLES_PER_SEGMENT);
        let block = index / HANDLES_PER_BLOCK;
        let bit = 1u64 << (index % HANDLES_PER_BLOCK);
        debug_assert_eq!(self.free_masks[block] & bit, 0, "double free of handle cell");
        self.free_masks[block] |= bit;
        if self.free_masks[block] == u64::MAX {
            self.segment.assign_block(block, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{GcHeap, Generation};
    use std::{sync::Arc, thread};

    struct FixedGenerations;

    impl GcHeap for FixedGenerations {
        fn generation_of(&self, obj: ObjectRef) -> Generation {
            (obj.addr() % 3) as Generation
        }

        fn is_promoted(&self, _obj: ObjectRef) -> bool {
            true
        }
    }

    fn mk_table() -> HandleTable {
        HandleTable::new(&HandleKind::default_flags(), 0).unwrap()
    }

    #[test]
    fn test_new_table_has_one_segment_and_no_handles() {
        let table = mk_table();
        assert_eq!(table.segment_count(), 1);
        assert_eq!(table.count_handles(), 0);
        assert!(table.kind_flags(HandleKind::Dependent).contains(KindFlags::EXTRA_INFO));
        assert!(table.kind_flags(HandleKind::Strong).is_empty());
    }

    #[test]
    fn test_missing_flags_default_to_no_extra_info() {
        let table = HandleTable::new(&[KindFlags::EXTRA_INFO], 3).unwrap();
        assert_eq!(table.index(), 3);
        assert!(table.kind_flags(HandleKind::WeakShort).contains(KindFlags::EXTRA_INFO));
        assert!(table.kind_flags(HandleKind::Dependent).is_empty());
    }

    #[test]
    fn test_create_and_destroy_balance_count() {
        let table = mk_table();
        let handles: Vec<_> = (1..=100)
            .map(|i| {
                table
                    .create_handle(HandleKind::Strong, ObjectRef::from_addr(i * 8), 0)
                    .unwrap()
            })
            .collect();
        assert_eq!(table.count_handles(), 100);
        assert!(handles.iter().all(|&h| table.contains(h)));
        assert_eq!(handles[0].object(), ObjectRef::from_addr(8));
        assert_eq!(handles[0].kind(), Some(HandleKind::Strong));
        assert_eq!(handles[0].table_id(), table.id());

        for &handle in &handles {
            table.destroy_handle(HandleKind::Strong, handle);
        }
        assert_eq!(table.count_handles(), 0);
    }

    #[test]
    fn test_new_handle_starts_null() {
        let table = mk_table();
        let handle = table
            .create_handle(HandleKind::WeakShort, ObjectRef::NULL, 0)
            .unwrap();
        assert!(handle.object().is_null());
    }

    #[test]
    fn test_kinds_never_share_a_block() {
        let table = mk_table();
        let strong = table
            .create_handle(HandleKind::Strong, ObjectRef::from_addr(8), 0)
            .unwrap();
        let weak = table
            .create_handle(HandleKind::WeakLong, ObjectRef::from_addr(16), 0)
            .unwrap();
        let block = |h: Handle| h.segment().cell_index(h) / HANDLES_PER_BLOCK;
        assert_ne!(block(strong), block(weak));
        assert_eq!(weak.kind(), Some(HandleKind::WeakLong));
    }

    #[test]
    fn test_table_grows_new_segments() {
        let table = mk_table();
        let count = HANDLES_PER_SEGMENT + 10;
        let handles: Vec<_> = (0..count)
            .map(|_| {
                table
                    .create_handle(HandleKind::Pinned, ObjectRef::from_addr(64), 0)
                    .unwrap()
            })
            .collect();
        assert!(table.segment_count() >= 2);
        assert_eq!(table.count_handles(), count);
        for handle in handles {
            table.destroy_handle(HandleKind::Pinned, handle);
        }
        assert_eq!(table.count_handles(), 0);
    }

    #[test]
    fn test_bulk_create_and_destroy() {
        let table = mk_table();
        let mut handles = Vec::new();
        assert_eq!(table.create_handles(HandleKind::WeakShort, 500, &mut handles), 500);
        assert_eq!(handles.len(), 500);
        assert_eq!(table.count_handles(), 500);
        assert!(handles.iter().all(|h| h.object().is_null()));

        table.destroy_handles(HandleKind::WeakShort, &handles);
        assert_eq!(table.count_handles(), 0);
    }

    #[test]
    fn test_extra_info_roundtrip_for_extra_kinds() {
        let table = mk_table();
        for (kind, extra) in [
            (HandleKind::Variable, VariableStrength::WeakLong.bits()),
            (HandleKind::Dependent, 0),
            (HandleKind::SizedRef, 0),
        ] {
            let handle = table.create_handle(kind, ObjectRef::from_addr(8), extra).unwrap();
            table.set_extra_info(handle, 0xdead);
            assert_eq!(table.extra_info(handle), 0xdead);
        }
    }

    #[test]
    fn test_extra_info_visible_from_creation() {
        let table = mk_table();
        let handle = table
            .create_handle(HandleKind::Dependent, ObjectRef::from_addr(8), 0x40)
            .unwrap();
        assert_eq!(table.extra_info(handle), 0x40);
        table.destroy_handle(HandleKind::Dependent, handle);

        let reused = table
            .create_handle(HandleKind::Dependent, ObjectRef::from_addr(8), 0)
            .unwrap();
        assert_eq!(table.extra_info(reused), 0);
    }

    #[test]
    fn test_compare_exchange_extra_info() {
        let table = mk_table();
        let handle = table
            .create_handle(HandleKind::Dependent, ObjectRef::from_addr(8), 5)
            .unwrap();
        assert_eq!(table.compare_exchange_extra_info(handle, 5, 6), Ok(5));
        assert_eq!(table.extra_info(handle), 6);
        assert_eq!(table.compare_exchange_extra_info(handle, 5, 7), Err(6));
        assert_eq!(table.extra_info(handle), 6);
    }

    #[test]
    fn test_variable_strength_updates() {
        let table = mk_table();
        let handle = table
            .create_handle(
                HandleKind::Variable,
                ObjectRef::from_addr(8),
                VariableStrength::WeakShort.bits(),
            )
            .unwrap();
        assert_eq!(table.variable_strength(handle), Some(VariableStrength::WeakShort));
        table.set_variable_strength(handle, VariableStrength::Strong);
        assert_eq!(
            table.compare_exchange_variable_strength(
                handle,
                VariableStrength::WeakShort,
                VariableStrength::Pinned
            ),
            Err(Some(VariableStrength::Strong))
        );
        assert_eq!(
            table.compare_exchange_variable_strength(
                handle,
                VariableStrength::Strong,
                VariableStrength::Pinned
            ),
            Ok(VariableStrength::Strong)
        );
        assert_eq!(table.variable_strength(handle), Some(VariableStrength::Pinned));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "not a variable handle strength")]
    fn test_variable_handle_needs_a_strength() {
        let table = mk_table();
        let _ = table.create_handle(HandleKind::Variable, ObjectRef::from_addr(8), 0x3);
    }

    #[test]
    fn test_cache_refill_and_flush_keep_count_exact() {
        let table = mk_table();
        let obj = ObjectRef::from_addr(8);
        // several banks' worth each way, so both slow paths run repeatedly
        let burst = HANDLES_PER_CACHE_BANK * 5 + 7;
        for _ in 0..3 {
            let handles: Vec<_> = (0..burst)
                .map(|_| table.create_handle(HandleKind::Strong, obj, 0).unwrap())
                .collect();
            assert_eq!(table.count_handles(), burst);
            let mut unique = handles.clone();
            unique.sort_unstable_by_key(|h| h.addr());
            unique.dedup();
            assert_eq!(unique.len(), burst);
            for handle in handles {
                table.destroy_handle(HandleKind::Strong, handle);
            }
            assert_eq!(table.count_handles(), 0);
        }
    }

    #[test]
    fn test_write_barrier_lowers_clump_age() {
        let table = mk_table();
        let handle = table
            .create_handle(HandleKind::Strong, ObjectRef::NULL, 0)
            .unwrap();
        let segment = handle.segment();
        let age = segment.clump_age(segment.cell_index(handle));
        age.store(2, Ordering::Relaxed);

        // generation 2 keeps the age
        handle.assign(ObjectRef::from_addr(5), &FixedGenerations);
        assert_eq!(age.load(Ordering::Relaxed), 2);
        // generation 1 lowers it
        handle.assign(ObjectRef::from_addr(4), &FixedGenerations);
        assert_eq!(age.load(Ordering::Relaxed), 1);
        // null stores never touch it
        handle.write_barrier(ObjectRef::NULL, &FixedGenerations);
        assert_eq!(age.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_dependent_barrier_forces_youngest_age() {
        let table = mk_table();
        let handle = table
            .create_handle(HandleKind::Dependent, ObjectRef::NULL, 0)
            .unwrap();
        let segment = handle.segment();
        let age = segment.clump_age(segment.cell_index(handle));
        age.store(2, Ordering::Relaxed);

        handle.assign(ObjectRef::from_addr(5), &FixedGenerations);
        assert_eq!(age.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_foreign_handles_are_not_contained() {
        let a = mk_table();
        let b = mk_table();
        let handle = a
            .create_handle(HandleKind::Strong, ObjectRef::from_addr(8), 0)
            .unwrap();
        assert!(a.contains(handle));
        assert!(!b.contains(handle));
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_concurrent_create_and_count() {
        const PER_THREAD: usize = 10_000;
        let table = Arc::new(mk_table());

        let creators: Vec<_> = (0..2)
            .map(|_| {
                let table = table.clone();
                thread::spawn(move || {
                    for i in 0..PER_THREAD {
                        table
                            .create_handle(HandleKind::Strong, ObjectRef::from_addr(8 + i * 8), 0)
                            .unwrap();
                    }
                })
            })
            .collect();

        let observer = {
            let table = table.clone();
            thread::spawn(move || {
                let mut observed = Vec::new();
                for _ in 0..2_000 {
                    observed.push(table.count_handles());
                }
                observed
            })
        };

        for creator in creators {
            creator.join().unwrap();
        }
        let observed = observer.join().unwrap();
        assert!(observed.iter().all(|&count| count <= 2 * PER_THREAD));
        assert_eq!(table.count_handles(), 2 * PER_THREAD);
    }

    #[test]
    fn test_concurrent_create_destroy_keeps_count_exact() {
        let table = Arc::new(mk_table());
        let workers: Vec<_> = (0..4)
            .map(|t| {
                let table = table.clone();
                thread::spawn(move || {
                    let mut kept = Vec::new();
                    for i in 0..5_000usize {
                        let handle = table
                            .create_handle(HandleKind::WeakShort, ObjectRef::from_addr(8 * (i + 1)), 0)
                            .unwrap();
                        if (i + t) % 3 == 0 {
                            kept.push(handle);
                        } else {
                            table.destroy_handle(HandleKind::WeakShort, handle);
                        }
                    }
                    kept.len()
                })
            })
            .collect();
        let kept: usize = workers.into_iter().map(|w| w.join().unwrap()).sum();
        assert_eq!(table.count_handles(), kept);
    }
}
