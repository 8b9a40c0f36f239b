//! Per-kind handle caches.
//!
//! Each kind of a table owns a small reserve bank of pre-allocated cells to
//! hand out, a free bank to collect destroyed cells, and a one-slot quick
//! cache in front of both. The fast paths only use interlocked operations;
//! refills and flushes happen in the table with its lock held.
//!
//! Indices may run past zero under contention. A slot is the source of
//! truth: a handle is only taken by swapping it out of its slot and only
//! published by swapping it into an empty one, so a stale index can send a
//! thread to the slow path but can never duplicate or lose a handle.

use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};

use crate::Handle;

pub(crate) const HANDLES_PER_CACHE_BANK: usize = 63;

const EMPTY: usize = 0;

pub(crate) struct TypeCache {
    quick: AtomicUsize,
    /// Number of filled reserve slots, counts down as handles are taken.
    reserve_index: AtomicIsize,
    reserve: [AtomicUsize; HANDLES_PER_CACHE_BANK],
    /// Number of empty free slots, counts down as handles are returned.
    free_index: AtomicIsize,
    free: [AtomicUsize; HANDLES_PER_CACHE_BANK],
}

impl TypeCache {
    pub(crate) fn new() -> Self {
        Self {
            quick: AtomicUsize::new(EMPTY),
            reserve_index: AtomicIsize::new(0),
            reserve: [const { AtomicUsize::new(EMPTY) }; HANDLES_PER_CACHE_BANK],
            free_index: AtomicIsize::new(HANDLES_PER_CACHE_BANK as isize),
            free: [const { AtomicUsize::new(EMPTY) }; HANDLES_PER_CACHE_BANK],
        }
    }

    #[inline]
    pub(crate) fn take(&self) -> Option<Handle> {
        if self.quick.load(Ordering::Relaxed) != EMPTY {
            let quick = self.quick.swap(EMPTY, Ordering::Acquire);
            if quick != EMPTY {
                return Handle::from_addr(quick);
            }
        }

        let index = self.reserve_index.fetch_sub(1, Ordering::AcqRel) - 1;
        if index < 0 {
            return None;
        }
        let taken = self.reserve[index as usize].swap(EMPTY, Ordering::Acquire);
        Handle::from_addr(taken)
    }

    /// Returns false when both the quick slot and the free bank are full;
    /// the caller then flushes under the table lock.
    #[inline]
    pub(crate) fn put(&self, handle: Handle) -> bool {
        if self
            .quick
            .compare_exchange(EMPTY, handle.addr(), Ordering::Release, Ordering::Relaxed)
            .is_ok()
        {
            return true;
        }

        let index = self.free_index.fetch_sub(1, Ordering::AcqRel) - 1;
        if index < 0 {
            return false;
        }
        self.free[index as usize]
            .compare_exchange(EMPTY, handle.addr(), Ordering::Release, Ordering::Relaxed)
            .is_ok()
    }

    /// Moves every cached handle into `out`. Lock held.
    pub(crate) fn drain_into(&self, out: &mut Vec<Handle>) {
        let slots = std::iter::once(&self.quick)
            .chain(self.reserve.iter())
            .chain(self.free.iter());
        for slot in slots {
            if let Some(handle) = Handle::from_addr(slot.swap(EMPTY, Ordering::Acquire)) {
                out.push(handle);
            }
        }
    }

    /// Refills the reserve bank from the back of `pool` and resets both
    /// indices. Lock held, right after [`TypeCache::drain_into`].
    pub(crate) fn refill_from(&self, pool: &mut Vec<Handle>) {
        let count = pool.len().min(HANDLES_PER_CACHE_BANK);
        for slot in &self.reserve[..count] {
            let handle = pool.pop().map_or(EMPTY, Handle::addr);
            slot.store(handle, Ordering::Relaxed);
        }
        self.reserve_index.store(count as isize, Ordering::Release);
        self.free_index
            .store(HANDLES_PER_CACHE_BANK as isize, Ordering::Release);
    }

    /// Number of handles parked in this cache right now.
    pub(crate) fn cached(&self) -> usize {
        std::iter::once(&self.quick)
            .chain(self.reserve.iter())
            .chain(self.free.iter())
            .filter(|slot| slot.load(Ordering::Relaxed) != EMPTY)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::SegmentBox;

    #[test]
    fn test_empty_cache_misses() {
        let cache = TypeCache::new();
        assert!(cache.take().is_none());
        assert_eq!(cache.cached(), 0);
    }

    #[test]
    fn test_refill_then_take_everything() {
        let segment = SegmentBox::allocate(1, 0).unwrap();
        let cache = TypeCache::new();
        let mut pool: Vec<_> = (0..10).map(|i| segment.handle(i)).collect();
        cache.refill_from(&mut pool);
        assert!(pool.is_empty());
        assert_eq!(cache.cached(), 10);

        let mut taken: Vec<_> = std::iter::from_fn(|| cache.take()).collect();
        taken.sort_by_key(|h| h.addr());
        taken.dedup();
        assert_eq!(taken.len(), 10);
        assert_eq!(cache.cached(), 0);
    }

    #[test]
    fn test_put_overflows_after_quick_and_free_bank() {
        let segment = SegmentBox::allocate(1, 0).unwrap();
        let cache = TypeCache::new();
        for i in 0..=HANDLES_PER_CACHE_BANK {
            assert!(cache.put(segment.handle(i)));
        }
        assert!(!cache.put(segment.handle(HANDLES_PER_CACHE_BANK + 1)));
        assert_eq!(cache.cached(), HANDLES_PER_CACHE_BANK + 1);

        let mut drained = Vec::new();
        cache.drain_into(&mut drained);
        assert_eq!(drained.len(), HANDLES_PER_CACHE_BANK + 1);
        assert_eq!(cache.cached(), 0);
    }

    #[test]
    fn test_quick_slot_serves_last_freed_handle() {
        let segment = SegmentBox::allocate(1, 0).unwrap();
        let cache = TypeCache::new();
        let handle = segment.handle(42);
        assert!(cache.put(handle));
        assert_eq!(cache.take(), Some(handle));
    }
}
