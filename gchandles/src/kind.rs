use bitflags::bitflags;

/// Number of distinct handle kinds a table can hold.
pub const KIND_COUNT: usize = 9;

/// The kind of a handle decides how the collector treats its referent.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
    /// Cleared when the referent is not promoted after the condemned
    /// generation's promotion phase.
    WeakShort = 0,
    /// Cleared when the referent is not promoted after the full promotion
    /// phase (survives finalization-style resurrection).
    WeakLong = 1,
    Strong = 2,
    Pinned = 3,
    /// Strength is read from a tag stored in the extra info word.
    Variable = 4,
    /// Strong only while the runtime reports an external reference count.
    RefCounted = 5,
    /// Keeps a secondary object (extra info) alive while the primary is.
    Dependent = 6,
    /// Pinned, and the runtime supplies an additional object graph.
    AsyncPinned = 7,
    /// Strong, records the bytes promoted through it.
    SizedRef = 8,
}

impl HandleKind {
    pub const ALL: [HandleKind; KIND_COUNT] = [
        HandleKind::WeakShort,
        HandleKind::WeakLong,
        HandleKind::Strong,
        HandleKind::Pinned,
        HandleKind::Variable,
        HandleKind::RefCounted,
        HandleKind::Dependent,
        HandleKind::AsyncPinned,
        HandleKind::SizedRef,
    ];

    #[inline(always)]
    pub const fn index(self) -> usize {
        self as usize
    }

    #[inline]
    pub const fn from_index(index: usize) -> Option<Self> {
        if index < KIND_COUNT {
            Some(Self::ALL[index])
        } else {
            None
        }
    }

    /// Kinds whose reachability cannot be summarised by the generation of
    /// the referent alone. Storing into them always resets the clump age.
    #[inline(always)]
    pub const fn forces_young_age(self) -> bool {
        matches!(self, HandleKind::Dependent | HandleKind::AsyncPinned)
    }

    /// Flags used by [`HandleKind::default_flags`].
    pub const fn standard_flags(self) -> KindFlags {
        match self {
            HandleKind::Variable | HandleKind::Dependent | HandleKind::SizedRef => {
                KindFlags::EXTRA_INFO
            }
            _ => KindFlags::empty(),
        }
    }

    /// The flag layout a runtime normally hands to `HandleTable::new`.
    pub fn default_flags() -> [KindFlags; KIND_COUNT] {
        Self::ALL.map(Self::standard_flags)
    }
}

bitflags! {
    /// Per-kind table configuration.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct KindFlags: u8 {
        /// Cells of this kind carry an extra info word.
        const EXTRA_INFO = 1 << 0;
    }
}

/// A small bit set of handle kinds, used to select what a scan visits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KindSet(u16);

impl KindSet {
    pub const EMPTY: Self = Self(0);
    pub const ALL: Self = Self((1 << KIND_COUNT) - 1);

    pub fn of(kinds: &[HandleKind]) -> Self {
        kinds.iter().fold(Self::EMPTY, |set, &kind| set.with(kind))
    }

    #[inline(always)]
    pub const fn with(self, kind: HandleKind) -> Self {
        Self(self.0 | (1 << kind as u16))
    }

    #[inline(always)]
    pub const fn contains(self, kind: HandleKind) -> bool {
        self.0 & (1 << kind as u16) != 0
    }

    #[inline(always)]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = HandleKind> {
        HandleKind::ALL
            .into_iter()
            .filter(move |&kind| self.contains(kind))
    }
}

/// Dynamic strength of a [`HandleKind::Variable`] handle, stored in its
/// extra info word.
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableStrength {
    WeakShort = 0x100,
    WeakLong = 0x200,
    Strong = 0x400,
    Pinned = 0x800,
}

impl VariableStrength {
    #[inline]
    pub const fn from_bits(bits: usize) -> Option<Self> {
        match bits {
            0x100 => Some(Self::WeakShort),
            0x200 => Some(Self::WeakLong),
            0x400 => Some(Self::Strong),
            0x800 => Some(Self::Pinned),
            _ => None,
        }
    }

    #[inline(always)]
    pub const fn bits(self) -> usize {
        self as usize
    }
}

// Block kind bytes: 0 marks a block that belongs to no kind.
pub(crate) const BLOCK_FREE: u8 = 0;

#[inline(always)]
pub(crate) const fn encode_block_kind(kind: HandleKind) -> u8 {
    kind as u8 + 1
}

#[inline(always)]
pub(crate) const fn decode_block_kind(byte: u8) -> Option<HandleKind> {
    if byte == BLOCK_FREE {
        None
    } else {
        HandleKind::from_index(byte as usize - 1)
    }
}
