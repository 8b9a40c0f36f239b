//! Buckets and the directory that registers them.
//!
//! A bucket is one logical handle set replicated per collector heap. The
//! map is an append-only linked list of fixed-size nodes of bucket
//! pointers. Readers walk it without locks; registration claims a null
//! slot by CAS and links a new node by CAS when every slot is taken.

use std::{
    alloc::{self, Layout},
    cell::Cell,
    ptr::{self, NonNull, addr_of_mut},
    sync::atomic::{AtomicPtr, AtomicUsize, Ordering},
};

use parking_lot::Mutex;

use crate::{
    Handle, HandleError, HandleStats, HandleTable, KindFlags,
    config::{MapCreateInfo, MapSettings},
};

const BUCKETS_PER_NODE: usize = 16;

/// One handle table per collector heap.
pub struct HandleTableBucket {
    tables: Box<[HandleTable]>,
    index: usize,
}

static NEXT_THREAD_SLOT: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static THREAD_SLOT: Cell<Option<usize>> = const { Cell::new(None) };
}

impl HandleTableBucket {
    /// Creates `heap_count` tables sharing `flags`. Tables created before a
    /// failure are dropped again.
    pub fn new(heap_count: usize, flags: &[KindFlags]) -> Result<Self, HandleError> {
        if heap_count == 0 {
            return Err(HandleError::InvalidSettings("a bucket needs at least one heap"));
        }
        let mut tables = Vec::new();
        tables
            .try_reserve_exact(heap_count)
            .map_err(|_| HandleError::OutOfMemory)?;
        for heap in 0..heap_count {
            tables.push(HandleTable::new(flags, heap)?);
        }
        Ok(Self {
            tables: tables.into_boxed_slice(),
            index: usize::MAX,
        })
    }

    /// Directory slot, assigned on registration.
    #[inline(always)]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline(always)]
    pub fn heap_count(&self) -> usize {
        self.tables.len()
    }

    #[inline]
    pub fn table(&self, heap: usize) -> Option<&HandleTable> {
        self.tables.get(heap)
    }

    /// The table the calling thread allocates from. Threads are spread
    /// over the heaps round-robin on first use.
    pub fn default_table(&self) -> &HandleTable {
        let slot = THREAD_SLOT.with(|slot| match slot.get() {
            Some(assigned) => assigned,
            None => {
                let fresh = NEXT_THREAD_SLOT.fetch_add(1, Ordering::Relaxed);
                slot.set(Some(fresh));
                fresh
            }
        });
        &self.tables[slot % self.tables.len()]
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.tables.iter().any(|table| table.contains(handle))
    }

    pub fn count_handles(&self) -> usize {
        self.tables.iter().map(HandleTable::count_handles).sum()
    }
}

struct MapNode {
    buckets: [AtomicPtr<HandleTableBucket>; BUCKETS_PER_NODE],
    next: AtomicPtr<MapNode>,
    base: usize,
}

const NODE_LAYOUT: Layout = Layout::new::<MapNode>();

fn allocate_node(base: usize) -> Option<NonNull<MapNode>> {
    // SAFETY: the layout has a non-zero size
    let raw = unsafe { alloc::alloc_zeroed(NODE_LAYOUT) }.cast::<MapNode>();
    let node = NonNull::new(raw)?;
    // SAFETY: zeroed memory is a valid node with null links; `base` is
    // written before the node is published
    unsafe { addr_of_mut!((*raw).base).write(base) };
    Some(node)
}

/// # Safety
/// `node` came from `allocate_node` and is no longer reachable.
unsafe fn free_node(node: NonNull<MapNode>) {
    // SAFETY: guaranteed by the caller
    unsafe { alloc::dealloc(node.as_ptr().cast(), NODE_LAYOUT) };
}

const BUCKET_LAYOUT: Layout = Layout::new::<HandleTableBucket>();

/// Moves `bucket` to the heap, handing it back when allocation fails.
fn allocate_bucket(
    bucket: HandleTableBucket,
) -> Result<NonNull<HandleTableBucket>, HandleTableBucket> {
    // SAFETY: the layout has a non-zero size
    let raw = unsafe { alloc::alloc(BUCKET_LAYOUT) }.cast::<HandleTableBucket>();
    let Some(slot) = NonNull::new(raw) else {
        return Err(bucket);
    };
    // SAFETY: freshly allocated for exactly this type; released later with
    // `Box::from_raw`, which uses the same global allocator and layout
    unsafe { slot.as_ptr().write(bucket) };
    Ok(slot)
}

/// The registry of every bucket of one runtime instance.
pub struct HandleTableMap {
    settings: MapSettings,
    head: NonNull<MapNode>,
    /// Buckets removed from the directory while readers may still hold
    /// references. Freed by `reclaim_retired` or on shutdown.
    retired: Mutex<Vec<NonNull<HandleTableBucket>>>,
    stats: HandleStats,
}

// SAFETY: nodes and buckets are only reached through atomics, and buckets
// are `Sync`
unsafe impl Send for HandleTableMap {}
// SAFETY: see above
unsafe impl Sync for HandleTableMap {}

impl HandleTableMap {
    pub fn initialize(info: MapCreateInfo) -> Result<Self, HandleError> {
        let settings = MapSettings::from_info(&info)?;
        let head = allocate_node(0).ok_or(HandleError::OutOfMemory)?;
        log::debug!(
            "handle table map initialized: {} heaps, max generation {}",
            settings.heap_count,
            settings.max_generation
        );
        Ok(Self {
            settings,
            head,
            retired: Mutex::new(Vec::new()),
            stats: HandleStats::new(),
        })
    }

    /// Destroys every bucket and table. Callers guarantee no scan or
    /// mutator is still using them.
    pub fn shutdown(self) {
        log::debug!("handle table map shutting down: {} buckets", self.bucket_count());
        drop(self);
    }

    #[inline(always)]
    pub fn settings(&self) -> &MapSettings {
        &self.settings
    }

    #[inline(always)]
    pub fn stats(&self) -> &HandleStats {
        &self.stats
    }

    /// Creates a bucket with one table per heap and registers it.
    pub fn create_bucket(&self, flags: &[KindFlags]) -> Result<&HandleTableBucket, HandleError> {
        let bucket = HandleTableBucket::new(self.settings.heap_count, flags)?;
        self.register_bucket(bucket)
    }

    /// Publishes `bucket` in the first free directory slot, growing the
    /// directory by one node if all are taken.
    pub fn register_bucket(
        &self,
        bucket: HandleTableBucket,
    ) -> Result<&HandleTableBucket, HandleError> {
        let raw = match allocate_bucket(bucket) {
            Ok(slot) => slot.as_ptr(),
            Err(bucket) => {
                log::warn!("handle table map: bucket allocation failed");
                drop(bucket);
                return Err(HandleError::OutOfMemory);
            }
        };
        let mut current = self.head;
        loop {
            // SAFETY: linked nodes live as long as the map
            let node = unsafe { current.as_ref() };
            for (i, slot) in node.buckets.iter().enumerate() {
                if !slot.load(Ordering::Acquire).is_null() {
                    continue;
                }
                // SAFETY: the bucket is not yet published
                unsafe { (*raw).index = node.base + i };
                if slot
                    .compare_exchange(ptr::null_mut(), raw, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    log::debug!("registered handle table bucket {}", node.base + i);
                    // SAFETY: published buckets live until removed and
                    // reclaimed, which needs `&mut self`
                    return Ok(unsafe { &*raw });
                }
            }

            if let Some(next) = NonNull::new(node.next.load(Ordering::Acquire)) {
                current = next;
                continue;
            }

            let Some(fresh) = allocate_node(node.base + BUCKETS_PER_NODE) else {
                log::warn!("handle table map: directory node allocation failed");
                // SAFETY: never published, still uniquely owned
                drop(unsafe { Box::from_raw(raw) });
                return Err(HandleError::OutOfMemory);
            };
            match node.next.compare_exchange(
                ptr::null_mut(),
                fresh.as_ptr(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => current = fresh,
                Err(winner) => {
                    // SAFETY: our node lost the race and was never linked
                    unsafe { free_node(fresh) };
                    // SAFETY: a failed CAS against null saw a linked node
                    current = unsafe { NonNull::new_unchecked(winner) };
                }
            }
        }
    }

    /// The registered bucket in directory slot `index`.
    pub fn bucket(&self, index: usize) -> Option<&HandleTableBucket> {
        let slot = self.slot(index)?;
        // SAFETY: see `register_bucket`
        unsafe { slot.load(Ordering::Acquire).as_ref() }
    }

    /// Unregisters the bucket in slot `index`. It stays allocated until
    /// [`HandleTableMap::reclaim_retired`] so concurrent readers stay safe.
    pub fn remove_bucket(&self, index: usize) -> bool {
        let Some(slot) = self.slot(index) else {
            return false;
        };
        let mut retired = self.retired.lock();
        if retired.try_reserve(1).is_err() {
            log::warn!("handle table map: cannot retire bucket {index}");
            return false;
        }
        let Some(bucket) = NonNull::new(slot.swap(ptr::null_mut(), Ordering::AcqRel)) else {
            return false;
        };
        log::debug!("removed handle table bucket {index}");
        retired.push(bucket);
        true
    }

    /// Frees every removed bucket. Returns how many were freed.
    pub fn reclaim_retired(&mut self) -> usize {
        let retired = std::mem::take(self.retired.get_mut());
        let count = retired.len();
        for bucket in retired {
            // SAFETY: unlinked, and `&mut self` rules out outstanding borrows
            drop(unsafe { Box::from_raw(bucket.as_ptr()) });
        }
        count
    }

    /// Visits every registered bucket. Buckets registered or removed
    /// concurrently may or may not be seen.
    pub fn for_each_bucket(&self, mut f: impl FnMut(&HandleTableBucket)) {
        self.for_each_node(|node| {
            for slot in &node.buckets {
                // SAFETY: see `register_bucket`
                if let Some(bucket) = unsafe { slot.load(Ordering::Acquire).as_ref() } {
                    f(bucket);
                }
            }
        });
    }

    pub fn bucket_count(&self) -> usize {
        let mut count = 0;
        self.for_each_bucket(|_| count += 1);
        count
    }

    /// Finds the bucket owning `handle`.
    pub fn find_bucket(&self, handle: Handle) -> Option<&HandleTableBucket> {
        let mut found = None;
        self.for_each_bucket(|bucket| {
            if found.is_none() && bucket.contains(handle) {
                found = Some(bucket.index());
            }
        });
        found.and_then(|index| self.bucket(index))
    }

    fn slot(&self, index: usize) -> Option<&AtomicPtr<HandleTableBucket>> {
        let mut result = None;
        self.for_each_node(|node| {
            if (node.base..node.base + BUCKETS_PER_NODE).contains(&index) {
                result = Some(&node.buckets[index - node.base] as *const AtomicPtr<_>);
            }
        });
        // SAFETY: nodes live as long as the map
        result.map(|slot| unsafe { &*slot })
    }

    fn for_each_node(&self, mut f: impl FnMut(&MapNode)) {
        let mut current = Some(self.head);
        while let Some(node) = current {
            // SAFETY: linked nodes live as long as the map
            let node = unsafe { node.as_ref() };
            f(node);
            current = NonNull::new(node.next.load(Ordering::Acquire));
        }
    }
}

impl Drop for HandleTableMap {
    fn drop(&mut self) {
        self.reclaim_retired();
        let mut current = Some(self.head);
        while let Some(node) = current {
            // SAFETY: `&mut self`: no other thread can reach the nodes
            let node_ref = unsafe { node.as_ref() };
            for slot in &node_ref.buckets {
                let bucket = slot.swap(ptr::null_mut(), Ordering::Relaxed);
                if !bucket.is_null() {
                    // SAFETY: registered buckets are owned by the map
                    drop(unsafe { Box::from_raw(bucket) });
                }
            }
            current = NonNull::new(node_ref.next.load(Ordering::Relaxed));
            // SAFETY: unreachable from now on
            unsafe { free_node(node) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{HandleKind, ObjectRef};
    use std::{sync::Arc, thread};

    fn mk_map(heaps: usize) -> HandleTableMap {
        HandleTableMap::initialize(MapCreateInfo {
            heap_count: Some(heaps),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_invalid_settings_fail_initialize() {
        let result = HandleTableMap::initialize(MapCreateInfo {
            heap_count: Some(0),
            ..Default::default()
        });
        assert!(matches!(result, Err(HandleError::InvalidSettings(_))));
    }

    #[test]
    fn test_bucket_without_heaps_is_rejected() {
        let result = HandleTableBucket::new(0, &HandleKind::default_flags());
        assert!(matches!(result, Err(HandleError::InvalidSettings(_))));
    }

    #[test]
    fn test_registered_bucket_survives_until_reclaimed() {
        let mut map = mk_map(2);
        let bucket = HandleTableBucket::new(2, &HandleKind::default_flags()).unwrap();
        let index = map.register_bucket(bucket).unwrap().index();
        let handle = map
            .bucket(index)
            .unwrap()
            .default_table()
            .create_handle(HandleKind::Strong, ObjectRef::from_addr(8), 0)
            .unwrap();
        assert_eq!(map.find_bucket(handle).map(HandleTableBucket::index), Some(index));

        assert!(map.remove_bucket(index));
        assert!(map.find_bucket(handle).is_none());
        assert_eq!(map.reclaim_retired(), 1);
        assert_eq!(map.reclaim_retired(), 0);
    }

    #[test]
    fn test_bucket_has_one_table_per_heap() {
        let map = mk_map(4);
        let bucket = map.create_bucket(&HandleKind::default_flags()).unwrap();
        assert_eq!(bucket.heap_count(), 4);
        for heap in 0..4 {
            assert_eq!(bucket.table(heap).unwrap().index(), heap);
        }
        assert!(bucket.table(4).is_none());
        assert!(std::ptr::eq(map.bucket(bucket.index()).unwrap(), bucket));
    }

    #[test]
    fn test_directory_grows_past_one_node() {
        let map = mk_map(1);
        let indices: Vec<_> = (0..BUCKETS_PER_NODE * 2 + 3)
            .map(|_| map.create_bucket(&[]).unwrap().index())
            .collect();
        let mut sorted = indices.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), indices.len());
        assert_eq!(map.bucket_count(), indices.len());
        assert!(map.bucket(BUCKETS_PER_NODE * 2 + 2).is_some());
    }

    #[test]
    fn test_removed_slot_is_reused() {
        let mut map = mk_map(1);
        let first = map.create_bucket(&[]).unwrap().index();
        let second = map.create_bucket(&[]).unwrap().index();
        assert!(map.remove_bucket(first));
        assert!(!map.remove_bucket(first));
        assert!(map.bucket(first).is_none());
        assert_eq!(map.bucket_count(), 1);

        let third = map.create_bucket(&[]).unwrap().index();
        assert_eq!(third, first);
        assert_ne!(third, second);
        assert_eq!(map.reclaim_retired(), 1);
    }

    #[test]
    fn test_find_bucket_by_handle() {
        let map = mk_map(2);
        let a = map.create_bucket(&[]).unwrap();
        let b = map.create_bucket(&[]).unwrap();
        let handle = b
            .table(1)
            .unwrap()
            .create_handle(HandleKind::Strong, ObjectRef::from_addr(8), 0)
            .unwrap();
        let found = map.find_bucket(handle).unwrap();
        assert_eq!(found.index(), b.index());
        assert!(!a.contains(handle));
        assert_eq!(b.count_handles(), 1);
    }

    #[test]
    fn test_default_table_is_stable_per_thread() {
        let map = mk_map(4);
        let bucket = map.create_bucket(&[]).unwrap();
        let first = bucket.default_table().index();
        assert_eq!(bucket.default_table().index(), first);
    }

    #[test]
    fn test_concurrent_registration() {
        let map = Arc::new(mk_map(1));
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let map = map.clone();
                thread::spawn(move || {
                    (0..20)
                        .map(|_| map.create_bucket(&[]).unwrap().index())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut indices: Vec<_> = workers
            .into_iter()
            .flat_map(|w| w.join().unwrap())
            .collect();
        indices.sort_unstable();
        indices.dedup();
        assert_eq!(indices.len(), 80);
        assert_eq!(map.bucket_count(), 80);
    }
}
