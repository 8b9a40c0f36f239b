//! Clump geometry and the write-barrier age map.
//!
//! Every clump of adjacent cells shares one age byte recording the youngest
//! generation any of its referents might live in. The byte may be stale in
//! one direction only: it may claim a clump is younger than it really is
//! (costs a redundant visit), never older (would hide a live reference).
//!
//! Mutators update the byte without a lock. All merges below are written so
//! that losing a race leaves the byte younger.

use std::sync::atomic::{AtomicU8, Ordering};

use crate::{Generation, config::MAX_GENERATION};

pub const HANDLES_PER_CLUMP: usize = 16;
pub const CLUMPS_PER_BLOCK: usize = 4;
pub const HANDLES_PER_BLOCK: usize = HANDLES_PER_CLUMP * CLUMPS_PER_BLOCK;

const HIGH_BITS: u32 = 0x8080_8080;
const LOW_BITS: u32 = 0x0101_0101;

const _: () = assert!(CLUMPS_PER_BLOCK == 4, "block ages are packed into a u32");
const _: () = assert!(MAX_GENERATION < 0x7f);

/// Precomputed test for "does this clump need a visit when collecting
/// `condemned`".
#[derive(Debug, Clone, Copy)]
pub(crate) struct AgeMask {
    condemned: Generation,
    threshold: u32,
    everything: bool,
}

impl AgeMask {
    pub(crate) fn new(condemned: Generation, max_generation: Generation) -> Self {
        debug_assert!(max_generation <= MAX_GENERATION);
        let everything = condemned >= max_generation;
        Self {
            condemned,
            threshold: (condemned as u32 + 1).wrapping_mul(LOW_BITS),
            everything,
        }
    }

    #[inline(always)]
    pub(crate) fn covers_everything(self) -> bool {
        self.everything
    }

    #[inline(always)]
    pub(crate) fn clump_is_condemned(self, age: Generation) -> bool {
        self.everything || age <= self.condemned
    }

    /// Tests all four clump ages of a block at once.
    ///
    /// With every byte below 0x80, `(b | 0x80) - (condemned + 1)` keeps its
    /// high bit exactly when `b > condemned`, and no byte borrows from its
    /// neighbour.
    #[inline(always)]
    pub(crate) fn block_has_condemned_clump(self, packed_ages: u32) -> bool {
        if self.everything {
            return true;
        }
        let older = (packed_ages | HIGH_BITS).wrapping_sub(self.threshold);
        (!older & HIGH_BITS) != 0
    }
}

/// Lowers a clump age to `generation`, never raising it.
#[inline]
pub(crate) fn lower_age(age: &AtomicU8, generation: Generation) {
    let current = age.load(Ordering::Relaxed);
    if current <= generation {
        return;
    }
    if age
        .compare_exchange(current, generation, Ordering::Relaxed, Ordering::Relaxed)
        .is_err()
    {
        // another store raced us into this clump
        age.store(0, Ordering::Relaxed);
    }
}

/// Unconditionally makes a clump youngest. Skips the store when it already
/// is, so hot clumps are not dirtied repeatedly.
#[inline]
pub(crate) fn force_young(age: &AtomicU8) {
    if age.load(Ordering::Relaxed) != 0 {
        age.store(0, Ordering::Relaxed);
    }
}

/// Replaces an age observed as `observed` with the older `next`. If a
/// mutator lowered the byte meanwhile, its value wins.
#[inline]
pub(crate) fn raise_age(age: &AtomicU8, observed: Generation, next: Generation) -> bool {
    age.compare_exchange(observed, next, Ordering::Relaxed, Ordering::Relaxed)
        .is_ok()
}

/// Post-collection aging: survivors of a condemned clump moved up one
/// generation.
#[inline]
pub(crate) fn age_clump(age: &AtomicU8, mask: AgeMask, max_generation: Generation) {
    let current = age.load(Ordering::Relaxed);
    if !mask.clump_is_condemned(current) || current >= max_generation {
        return;
    }
    raise_age(age, current, current + 1);
}

#[inline(always)]
pub(crate) fn pack_block_ages(ages: &[AtomicU8]) -> u32 {
    debug_assert_eq!(ages.len(), CLUMPS_PER_BLOCK);
    u32::from_le_bytes([
        ages[0].load(Ordering::Relaxed),
        ages[1].load(Ordering::Relaxed),
        ages[2].load(Ordering::Relaxed),
        ages[3].load(Ordering::Relaxed),
    ])
}
