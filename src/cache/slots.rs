//! Slot Tables
//!
//! Free-slot bookkeeping for the three hierarchy levels.
//!
//! # Design
//!
//! - Categories and subcategories use a fixed-capacity bitset over
//!   ordinals `1..=254`. The cap is a hard scope limitation: a parent can
//!   never hold more than [`SLOT_CAPACITY`] live children.
//! - Products use a hash set plus a derived ascending view over a far
//!   larger range, tagged with a generation so a background resort can tell
//!   whether its snapshot is still current.
//! - A bit (or member) is set iff the ordinal is free for reuse.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::warn;

use crate::error::{Error, Result};

/// Largest ordinal a bounded scope can hold.
pub const SLOT_CAPACITY: u32 = 254;

/// Largest product ordinal the cache tracks. Occupied rows above it are
/// ignored when seeding, and reservations above it are rejected.
pub const PRODUCT_SLOT_CAPACITY: u32 = 1 << 20;

const WORDS: usize = (SLOT_CAPACITY as usize + 1).div_ceil(64);

/// Source of `SortedIndices` generations. Shared by every instance so a
/// replaced scope never reuses a generation an older snapshot carries.
static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

fn next_generation() -> u64 {
    NEXT_GENERATION.fetch_add(1, Ordering::Relaxed)
}

// =============================================================================
// Hole Derivation
// =============================================================================

/// Derive free ordinals in `1..=capacity` from the ascending list of
/// occupied ones.
///
/// Every ordinal below the largest occupied value that is not itself
/// occupied is free, and so is the one right after the largest occupied
/// value unless it exceeds `capacity`. Zero and out-of-order values are
/// skipped; values above `capacity` are ignored with a warning.
///
/// ```ignore
/// assert_eq!(derive_free(&[1, 2, 5, 6], SLOT_CAPACITY), vec![3, 4, 7]);
/// assert_eq!(derive_free(&[], SLOT_CAPACITY), vec![1]);
/// ```
pub fn derive_free(occupied: &[u32], capacity: u32) -> Vec<u32> {
    let mut free = Vec::new();
    let mut next = 1u32;

    for &ordinal in occupied {
        if ordinal < next {
            continue;
        }
        if ordinal > capacity {
            warn!(ordinal, capacity, "Ignoring occupied slot beyond capacity");
            continue;
        }
        free.extend(next..ordinal);
        match ordinal.checked_add(1) {
            Some(after) => next = after,
            None => return free,
        }
    }
    if next <= capacity {
        free.push(next);
    }

    free
}

// =============================================================================
// Bounded Slot Table
// =============================================================================

/// Fixed-capacity free-slot bitset over `1..=SLOT_CAPACITY`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotTable {
    bits: [u64; WORDS],
}

impl SlotTable {
    /// Create a table with no free slots.
    pub fn new() -> Self {
        Self::default()
    }

    /// Baseline for a brand-new parent: only slot 1 is free.
    pub fn baseline() -> Self {
        let mut table = Self::new();
        table.bits[0] = 1 << 1;
        table
    }

    /// Build a table from the occupied ordinals of a scope.
    ///
    /// A scope whose slot 254 is taken has no "next" slot.
    pub fn from_occupied(occupied: &[u32]) -> Self {
        let mut table = Self::new();
        for ordinal in derive_free(occupied, SLOT_CAPACITY) {
            let i = ordinal as usize;
            table.bits[i / 64] |= 1u64 << (i % 64);
        }
        if table.is_empty() {
            warn!(capacity = SLOT_CAPACITY, "Slot scope is full");
        }
        table
    }

    fn check(ordinal: u32) -> Result<(usize, u64)> {
        if ordinal == 0 || ordinal > SLOT_CAPACITY {
            return Err(Error::SlotOutOfRange {
                ordinal,
                capacity: SLOT_CAPACITY,
            });
        }
        let i = ordinal as usize;
        Ok((i / 64, 1u64 << (i % 64)))
    }

    /// Mark an ordinal as free.
    pub fn mark_free(&mut self, ordinal: u32) -> Result<()> {
        let (word, mask) = Self::check(ordinal)?;
        self.bits[word] |= mask;
        Ok(())
    }

    /// Mark an ordinal as occupied.
    pub fn mark_occupied(&mut self, ordinal: u32) -> Result<()> {
        let (word, mask) = Self::check(ordinal)?;
        self.bits[word] &= !mask;
        Ok(())
    }

    /// Whether an ordinal is free. Out-of-range ordinals never are.
    pub fn is_free(&self, ordinal: u32) -> bool {
        Self::check(ordinal)
            .map(|(word, mask)| self.bits[word] & mask != 0)
            .unwrap_or(false)
    }

    /// Free ordinals in ascending order.
    pub fn free_slots(&self) -> Vec<u32> {
        (1..=SLOT_CAPACITY).filter(|&o| self.is_free(o)).collect()
    }

    /// Largest free ordinal.
    pub fn max_free(&self) -> Option<u32> {
        (1..=SLOT_CAPACITY).rev().find(|&o| self.is_free(o))
    }

    /// Number of free ordinals.
    pub fn len(&self) -> usize {
        self.bits.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// True when no ordinal is free (never seeded, or fully used).
    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&w| w == 0)
    }
}

// =============================================================================
// Unbounded Sorted Indices
// =============================================================================

/// Free-slot set over `1..=PRODUCT_SLOT_CAPACITY` with a derived
/// ascending view.
#[derive(Debug, Clone)]
pub struct SortedIndices {
    available: HashSet<u32>,
    ordered: Vec<u32>,
    generation: u64,
}

impl Default for SortedIndices {
    fn default() -> Self {
        Self::from_free(Vec::new())
    }
}

impl SortedIndices {
    /// Baseline for a brand-new parent: only slot 1 is free.
    pub fn baseline() -> Self {
        Self::from_free(vec![1])
    }

    /// Build the set from the occupied ordinals of a scope.
    pub fn from_occupied(occupied: &[u32]) -> Self {
        Self::from_free(derive_free(occupied, PRODUCT_SLOT_CAPACITY))
    }

    /// Build from an already ascending list of free ordinals.
    fn from_free(ordered: Vec<u32>) -> Self {
        Self {
            available: ordered.iter().copied().collect(),
            ordered,
            generation: next_generation(),
        }
    }

    /// Mark an ordinal free. The ordered view is not touched.
    pub fn insert(&mut self, ordinal: u32) -> bool {
        self.generation = next_generation();
        self.available.insert(ordinal)
    }

    /// Mark an ordinal occupied. The ordered view is not touched.
    pub fn remove(&mut self, ordinal: u32) -> bool {
        self.generation = next_generation();
        self.available.remove(&ordinal)
    }

    pub fn contains(&self, ordinal: u32) -> bool {
        self.available.contains(&ordinal)
    }

    /// Members of the free set, unordered, with the generation they reflect.
    pub fn snapshot(&self) -> (Vec<u32>, u64) {
        (self.available.iter().copied().collect(), self.generation)
    }

    /// Install an ordered view computed from a snapshot. Ignored when the set
    /// changed after the snapshot was taken.
    pub fn install(&mut self, ordered: Vec<u32>, generation: u64) -> bool {
        if generation != self.generation {
            return false;
        }
        self.ordered = ordered;
        true
    }

    /// Recompute the ordered view in place.
    pub fn resort(&mut self) {
        let mut ordered: Vec<u32> = self.available.iter().copied().collect();
        ordered.sort_unstable();
        self.ordered = ordered;
    }

    /// Ascending view of free ordinals, as of the last resort.
    pub fn ordered(&self) -> &[u32] {
        &self.ordered
    }

    /// Number of free ordinals in the authoritative set.
    pub fn len(&self) -> usize {
        self.available.len()
    }

    pub fn is_empty(&self) -> bool {
        self.available.is_empty()
    }
}

// =============================================================================
// Tests
// =============================================================================
