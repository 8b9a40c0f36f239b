use std::{
    fmt,
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering, fence},
};

use crate::{
    GcHeap, HandleKind, ObjectRef,
    age::{self, HANDLES_PER_BLOCK},
    segment::Segment,
};

/// An indirect, relocation-safe reference into the managed heap.
///
/// A handle is the address of one cell inside a table segment. It stays
/// valid from `create_handle` until `destroy_handle` and must not be used
/// after its table is dropped.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(NonNull<AtomicUsize>);

// SAFETY: the cell is atomic and its segment outlives every handle into it
unsafe impl Send for Handle {}
// SAFETY: see above
unsafe impl Sync for Handle {}

impl Handle {
    #[inline(always)]
    pub(crate) fn from_cell(cell: &AtomicUsize) -> Self {
        Self(NonNull::from(cell))
    }

    #[inline(always)]
    pub(crate) fn from_addr(addr: usize) -> Option<Self> {
        NonNull::new(addr as *mut AtomicUsize).map(Self)
    }

    #[inline(always)]
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    #[inline(always)]
    pub(crate) fn segment(&self) -> &Segment {
        // SAFETY: a live handle points into a segment owned by a live table
        unsafe { Segment::containing(*self).as_ref() }
    }

    #[inline(always)]
    fn cell(&self) -> &AtomicUsize {
        // SAFETY: a live handle points at a cell of a live segment
        unsafe { self.0.as_ref() }
    }

    /// The referent, or [`ObjectRef::NULL`].
    #[inline(always)]
    pub fn object(self) -> ObjectRef {
        ObjectRef::from_addr(self.cell().load(Ordering::Acquire))
    }

    /// Stores a referent without touching the age map. A non-null store
    /// must be followed by [`Handle::write_barrier`]; [`Handle::assign`]
    /// does both.
    #[inline(always)]
    pub fn set_object(self, value: ObjectRef) {
        self.cell().store(value.addr(), Ordering::Release);
    }

    /// Stores `value` and records its generation in the age map.
    #[inline]
    pub fn assign(self, value: ObjectRef, heap: &dyn GcHeap) {
        self.set_object(value);
        self.write_barrier(value, heap);
    }

    /// Records that this handle's clump may now reference `value`.
    ///
    /// For most kinds the clump age is lowered to the generation of
    /// `value`. Dependent and async-pinned handles reach objects other than
    /// their referent, so their clump is made youngest unconditionally.
    #[inline]
    pub fn write_barrier(self, value: ObjectRef, heap: &dyn GcHeap) {
        if value.is_null() {
            return;
        }
        let segment = self.segment();
        let index = segment.cell_index(self);
        let age = segment.clump_age(index);
        // the referent store must be visible before the age is read, see
        // `HandleTable::reset_age_map`
        fence(Ordering::SeqCst);
        match segment.block_kind(index / HANDLES_PER_BLOCK) {
            Some(kind) if kind.forces_young_age() => age::force_young(age),
            _ => age::lower_age(age, heap.generation_of(value)),
        }
    }

    /// The kind this handle was created with, `None` for a freed cell
    /// whose block has been released.
    #[inline]
    pub fn kind(self) -> Option<HandleKind> {
        let segment = self.segment();
        segment.block_kind(segment.cell_index(self) / HANDLES_PER_BLOCK)
    }

    /// Identifier of the owning table, see `HandleTable::id`.
    #[inline]
    pub fn table_id(self) -> usize {
        self.segment().table_id()
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({:#x})", self.addr())
    }
}
