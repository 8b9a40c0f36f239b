//! Fixed-size, self-aligned blocks of handle cells.
//!
//! A segment is one `SEGMENT_SIZE` allocation aligned to its own size, so
//! the segment owning any handle is found by masking the handle address.
//! It holds the cells, their extra info words, one kind byte per block and
//! one age byte per clump. Everything inside is atomic: mutators store
//! referents while a collector scans. Which cells are free is tracked by
//! the owning table under its lock, never inside the segment.

use std::{
    alloc::{self, Layout},
    mem,
    ops::Deref,
    ptr::{NonNull, addr_of_mut},
    sync::atomic::{AtomicU8, AtomicUsize, Ordering},
};

use crate::{
    Handle, HandleKind,
    age::{CLUMPS_PER_BLOCK, HANDLES_PER_BLOCK, HANDLES_PER_CLUMP},
    kind::{BLOCK_FREE, decode_block_kind, encode_block_kind},
};

/// log2 of the size of a segment
const SEGMENT_SHIFT: usize = 16; // 64 K
pub(crate) const SEGMENT_SIZE: usize = 1 << SEGMENT_SHIFT;
pub(crate) const BLOCKS_PER_SEGMENT: usize = 63;
pub(crate) const HANDLES_PER_SEGMENT: usize = BLOCKS_PER_SEGMENT * HANDLES_PER_BLOCK;
pub(crate) const CLUMPS_PER_SEGMENT: usize = BLOCKS_PER_SEGMENT * CLUMPS_PER_BLOCK;

#[repr(C, align(65536))]
pub(crate) struct Segment {
    table_id: usize,
    ordinal: usize,
    block_kinds: [AtomicU8; BLOCKS_PER_SEGMENT],
    ages: [AtomicU8; CLUMPS_PER_SEGMENT],
    extra: [AtomicUsize; HANDLES_PER_SEGMENT],
    cells: [AtomicUsize; HANDLES_PER_SEGMENT],
}

const SEGMENT_LAYOUT: Layout = Layout::new::<Segment>();

const _: () = assert!(mem::size_of::<Segment>() == SEGMENT_SIZE);
const _: () = assert!(mem::align_of::<Segment>() == SEGMENT_SIZE);
const _: () = assert!(BLOCKS_PER_SEGMENT <= u8::MAX as usize);

impl Segment {
    /// The segment containing `handle`.
    #[inline(always)]
    pub(crate) fn containing(handle: Handle) -> NonNull<Segment> {
        let base = handle.addr() & !(SEGMENT_SIZE - 1);
        // SAFETY: handles are never null and point inside a segment, whose
        // base is therefore non-null as well
        unsafe { NonNull::new_unchecked(base as *mut Segment) }
    }

    #[inline(always)]
    pub(crate) fn table_id(&self) -> usize {
        self.table_id
    }

    #[inline(always)]
    pub(crate) fn ordinal(&self) -> usize {
        self.ordinal
    }

    #[inline(always)]
    pub(crate) fn cell_index(&self, handle: Handle) -> usize {
        let base = self.cells.as_ptr() as usize;
        let offset = handle.addr() - base;
        debug_assert!(offset % mem::size_of::<AtomicUsize>() == 0);
        let index = offset / mem::size_of::<AtomicUsize>();
        debug_assert!(index < HANDLES_PER_SEGMENT, "handle outside of segment cells");
        index
    }

    #[inline(always)]
    pub(crate) fn handle(&self, index: usize) -> Handle {
        Handle::from_cell(&self.cells[index])
    }

    #[inline(always)]
    pub(crate) fn cell(&self, index: usize) -> &AtomicUsize {
        &self.cells[index]
    }

    #[inline(always)]
    pub(crate) fn extra(&self, index: usize) -> &AtomicUsize {
        &self.extra[index]
    }

    #[inline(always)]
    pub(crate) fn clump_age(&self, index: usize) -> &AtomicU8 {
        &self.ages[index / HANDLES_PER_CLUMP]
    }

    #[inline(always)]
    pub(crate) fn block_ages(&self, block: usize) -> &[AtomicU8] {
        let start = block * CLUMPS_PER_BLOCK;
        &self.ages[start..start + CLUMPS_PER_BLOCK]
    }

    #[inline(always)]
    pub(crate) fn block_kind(&self, block: usize) -> Option<HandleKind> {
        decode_block_kind(self.block_kinds[block].load(Ordering::Acquire))
    }

    /// Only called with the owning table's lock held.
    pub(crate) fn assign_block(&self, block: usize, kind: Option<HandleKind>) {
        let byte = kind.map_or(BLOCK_FREE, encode_block_kind);
        self.block_kinds[block].store(byte, Ordering::Release);
    }
}

/// Owning pointer to a heap-allocated [`Segment`].
pub(crate) struct SegmentBox(NonNull<Segment>);

// SAFETY: a segment only contains atomics and immutable header words
unsafe impl Send for SegmentBox {}
// SAFETY: see above
unsafe impl Sync for SegmentBox {}

impl SegmentBox {
    /// Returns `None` when the allocator is out of memory.
    pub(crate) fn allocate(table_id: usize, ordinal: usize) -> Option<Self> {
        // SAFETY: the layout has a non-zero size
        let raw = unsafe { alloc::alloc_zeroed(SEGMENT_LAYOUT) }.cast::<Segment>();
        let ptr = NonNull::new(raw)?;
        // SAFETY: zeroed memory is a valid segment (atomics and integers);
        // the header is written before the segment is shared
        unsafe {
            addr_of_mut!((*raw).table_id).write(table_id);
            addr_of_mut!((*raw).ordinal).write(ordinal);
        }
        Some(Self(ptr))
    }

    #[inline(always)]
    pub(crate) fn as_ptr(&self) -> NonNull<Segment> {
        self.0
    }
}

impl Deref for SegmentBox {
    type Target = Segment;

    #[inline(always)]
    fn deref(&self) -> &Segment {
        // SAFETY: owned and live until drop
        unsafe { self.0.as_ref() }
    }
}

impl Drop for SegmentBox {
    fn drop(&mut self) {
        // SAFETY: allocated in `allocate` with the same layout
        unsafe { alloc::dealloc(self.0.as_ptr().cast(), SEGMENT_LAYOUT) };
    }
}
