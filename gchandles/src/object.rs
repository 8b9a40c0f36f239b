/// Generation number as reported by the collector. Generation 0 is the
/// youngest.
pub type Generation = u8;

/// An opaque, pointer-sized reference into the managed heap.
///
/// The handle table never dereferences these words; it only stores them,
/// compares them against null and hands them back to the collector.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct ObjectRef(usize);

impl ObjectRef {
    pub const NULL: Self = Self(0);

    #[inline(always)]
    pub const fn from_addr(addr: usize) -> Self {
        Self(addr)
    }

    #[inline(always)]
    pub const fn addr(self) -> usize {
        self.0
    }

    #[inline(always)]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

