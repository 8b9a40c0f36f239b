//! A simulated generational collector.
//!
//! Objects are bookkeeping records keyed by synthetic addresses; nothing is
//! ever dereferenced. The heap answers the [`GcHeap`] and
//! [`ExecutionEngine`] queries and provides promote / relocate callbacks,
//! which is all the handle table needs to be driven through complete GC
//! cycles by tests, benchmarks and the stress driver.

mod safepoint;

pub use safepoint::SenseBarrier;

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::{
    ExecutionEngine, GcHeap, Generation, ObjectRef, PromoteFlags, ScanContext,
};

const OBJECT_ALIGN: usize = 16;
const FIRST_ADDRESS: usize = 0x1_0000;

#[derive(Debug, Clone)]
struct SimObject {
    size: usize,
    generation: Generation,
    marked: bool,
    pinned: bool,
    ref_count: usize,
    async_children: Vec<ObjectRef>,
}

struct SimState {
    objects: HashMap<usize, SimObject>,
    next_addr: usize,
    condemned: Option<Generation>,
    promoted_bytes: Vec<usize>,
    /// Old address to new address, for the last compacting collection.
    forwarding: HashMap<usize, usize>,
}

/// Outcome of [`SimulatedHeap::finish_collection`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectionResult {
    pub freed: usize,
    pub survived: usize,
    pub moved: usize,
}

pub struct SimulatedHeap {
    max_generation: Generation,
    state: Mutex<SimState>,
}

impl SimulatedHeap {
    pub fn new(heap_count: usize, max_generation: Generation) -> Self {
        Self {
            max_generation,
            state: Mutex::new(SimState {
                objects: HashMap::new(),
                next_addr: FIRST_ADDRESS,
                condemned: None,
                promoted_bytes: vec![0; heap_count.max(1)],
                forwarding: HashMap::new(),
            }),
        }
    }

    /// Allocates a fresh gen 0 object.
    pub fn allocate(&self, size: usize) -> ObjectRef {
        self.allocate_in(size, 0)
    }

    pub fn allocate_in(&self, size: usize, generation: Generation) -> ObjectRef {
        let mut state = self.state.lock();
        let addr = state.bump(size);
        state.objects.insert(
            addr,
            SimObject {
                size,
                generation: generation.min(self.max_generation),
                marked: false,
                pinned: false,
                ref_count: 0,
                async_children: Vec::new(),
            },
        );
        ObjectRef::from_addr(addr)
    }

    pub fn is_alive(&self, obj: ObjectRef) -> bool {
        self.state.lock().objects.contains_key(&obj.addr())
    }

    pub fn is_pinned(&self, obj: ObjectRef) -> bool {
        self.state
            .lock()
            .objects
            .get(&obj.addr())
            .is_some_and(|o| o.pinned)
    }

    pub fn object_count(&self) -> usize {
        self.state.lock().objects.len()
    }

    pub fn set_ref_count(&self, obj: ObjectRef, count: usize) {
        if let Some(object) = self.state.lock().objects.get_mut(&obj.addr()) {
            object.ref_count = count;
        }
    }

    pub fn add_async_child(&self, obj: ObjectRef, child: ObjectRef) {
        if let Some(object) = self.state.lock().objects.get_mut(&obj.addr()) {
            object.async_children.push(child);
        }
    }

    /// Starts collecting generations `0..=condemned`: clears marks, pins,
    /// promoted byte counters and the previous forwarding table.
    pub fn begin_collection(&self, condemned: Generation) {
        let mut state = self.state.lock();
        state.condemned = Some(condemned.min(self.max_generation));
        state.forwarding.clear();
        state.promoted_bytes.iter_mut().for_each(|bytes| *bytes = 0);
        for object in state.objects.values_mut() {
            object.marked = false;
            object.pinned = false;
        }
    }

    /// Marks `obj` on behalf of `heap`. Returns true if it was newly marked.
    pub fn mark(&self, obj: ObjectRef, heap: usize) -> bool {
        let mut state = self.state.lock();
        let Some(condemned) = state.condemned else {
            return false;
        };
        let Some(object) = state.objects.get_mut(&obj.addr()) else {
            return false;
        };
        if object.generation > condemned || object.marked {
            return false;
        }
        object.marked = true;
        let size = object.size;
        let slot = heap.min(state.promoted_bytes.len() - 1);
        state.promoted_bytes[slot] += size;
        true
    }

    fn pin(&self, obj: ObjectRef) {
        if let Some(object) = self.state.lock().objects.get_mut(&obj.addr()) {
            object.pinned = true;
        }
    }

    /// A promote callback that marks (and pins when asked) every object it
    /// is handed.
    pub fn promoter(&self) -> impl FnMut(&mut ObjectRef, &ScanContext, PromoteFlags) + '_ {
        move |obj: &mut ObjectRef, sc: &ScanContext, flags: PromoteFlags| {
            if obj.is_null() {
                return;
            }
            self.mark(*obj, sc.heap);
            if flags.contains(PromoteFlags::PINNED) {
                self.pin(*obj);
            }
        }
    }

    /// A relocation callback that rewrites slots through the forwarding
    /// table of the last compacting collection.
    pub fn relocator(&self) -> impl FnMut(&mut ObjectRef, &ScanContext, PromoteFlags) + '_ {
        move |obj: &mut ObjectRef, _sc: &ScanContext, _flags: PromoteFlags| {
            if let Some(&to) = self.state.lock().forwarding.get(&obj.addr()) {
                *obj = ObjectRef::from_addr(to);
            }
        }
    }

    /// Sweeps unmarked condemned objects and ages the survivors. With
    /// `compact`, every unpinned survivor moves to a new address.
    pub fn finish_collection(&self, compact: bool) -> CollectionResult {
        let mut state = self.state.lock();
        let Some(condemned) = state.condemned.take() else {
            return CollectionResult::default();
        };
        let max_generation = self.max_generation;
        let mut result = CollectionResult::default();

        let condemned_addrs: Vec<usize> = state
            .objects
            .iter()
            .filter(|(_, object)| object.generation <= condemned)
            .map(|(&addr, _)| addr)
            .collect();

        for addr in condemned_addrs {
            let Some(mut object) = state.objects.remove(&addr) else {
                continue;
            };
            if !object.marked {
                result.freed += 1;
                continue;
            }
            result.survived += 1;
            object.generation = (object.generation + 1).min(max_generation);
            let target = if compact && !object.pinned {
                let to = state.bump(object.size);
                state.forwarding.insert(addr, to);
                result.moved += 1;
                to
            } else {
                addr
            };
            state.objects.insert(target, object);
        }

        // children recorded by address follow their objects
        if !state.forwarding.is_empty() {
            let SimState {
                objects, forwarding, ..
            } = &mut *state;
            for object in objects.values_mut() {
                for child in &mut object.async_children {
                    if let Some(&to) = forwarding.get(&child.addr()) {
                        *child = ObjectRef::from_addr(to);
                    }
                }
            }
        }

        log::debug!(
            "simulated gc {condemned}: {} freed, {} survived, {} moved",
            result.freed,
            result.survived,
            result.moved
        );
        result
    }
}

impl SimState {
    fn bump(&mut self, size: usize) -> usize {
        let addr = self.next_addr;
        let rounded = size.max(1).next_multiple_of(OBJECT_ALIGN);
        self.next_addr += rounded;
        addr
    }
}

impl GcHeap for SimulatedHeap {
    fn generation_of(&self, obj: ObjectRef) -> Generation {
        self.state
            .lock()
            .objects
            .get(&obj.addr())
            .map_or(self.max_generation, |o| o.generation)
    }

    fn is_promoted(&self, obj: ObjectRef) -> bool {
        let state = self.state.lock();
        let Some(condemned) = state.condemned else {
            return true;
        };
        state
            .objects
            .get(&obj.addr())
            .is_none_or(|o| o.generation > condemned || o.marked)
    }

    fn promoted_bytes(&self, heap: usize) -> usize {
        let state = self.state.lock();
        state.promoted_bytes.get(heap).copied().unwrap_or(0)
    }
}

impl ExecutionEngine for SimulatedHeap {
    fn ref_count_is_positive(&self, obj: ObjectRef) -> bool {
        self.state
            .lock()
            .objects
            .get(&obj.addr())
            .is_some_and(|o| o.ref_count > 0)
    }

    fn walk_async_pinned(&self, obj: ObjectRef, visit: &mut dyn FnMut(&mut ObjectRef)) {
        let children = match self.state.lock().objects.get(&obj.addr()) {
            Some(object) => object.async_children.clone(),
            None => return,
        };
        // the lock is released: `visit` usually promotes through this heap
        for mut child in children {
            visit(&mut child);
        }
    }
}
