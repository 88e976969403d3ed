//! Bounded bitsets over hardware slots and pipeline instances.
//!
//! `SlotMask` replaces raw integer bit twiddling for "which IPs are active" and
//! "which IPs still hold this frame". `OwnerMask` layers the draining rule on top:
//! once a frame starts losing owners it can never gain one back.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of hardware slots the registry can hold.
pub const MAX_SLOTS: usize = 64;

/// Number of concurrently open pipeline instances.
pub const MAX_INSTANCES: usize = 16;

/// Index of a hardware IP slot in the registry table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotId(pub u8);

impl SlotId {
    /// Table index of this slot.
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a logical stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub u8);

impl InstanceId {
    /// Table index of this instance.
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// SlotMask
// =============================================================================

/// Set of slot ids, O(1) membership.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SlotMask(u64);

impl SlotMask {
    /// The empty set.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Build from raw bits.
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// Raw bits.
    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Set with exactly one member.
    pub fn single(slot: SlotId) -> Self {
        let mut mask = Self::empty();
        mask.insert(slot);
        mask
    }

    /// Add a slot. Returns true if it was not present.
    pub fn insert(&mut self, slot: SlotId) -> bool {
        let bit = Self::bit(slot);
        let added = self.0 & bit == 0;
        self.0 |= bit;
        added
    }

    /// Remove a slot. Returns true if it was present.
    pub fn remove(&mut self, slot: SlotId) -> bool {
        let bit = Self::bit(slot);
        let present = self.0 & bit != 0;
        self.0 &= !bit;
        present
    }

    /// Membership test.
    pub fn contains(self, slot: SlotId) -> bool {
        self.0 & Self::bit(slot) != 0
    }

    /// True when no slot is present.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Number of members.
    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Set union.
    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Set intersection.
    pub fn intersection(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    /// Members in ascending id order.
    pub fn iter(self) -> impl Iterator<Item = SlotId> {
        (0..MAX_SLOTS as u8)
            .map(SlotId)
            .filter(move |slot| self.contains(*slot))
    }

    fn bit(slot: SlotId) -> u64 {
        debug_assert!(slot.index() < MAX_SLOTS);
        1u64 << (slot.index() % MAX_SLOTS)
    }
}

impl FromIterator<SlotId> for SlotMask {
    fn from_iter<I: IntoIterator<Item = SlotId>>(iter: I) -> Self {
        let mut mask = Self::empty();
        for slot in iter {
            mask.insert(slot);
        }
        mask
    }
}

impl fmt::Debug for SlotMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter().map(|s| s.0)).finish()
    }
}

impl fmt::Display for SlotMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

// =============================================================================
// InstanceMask
// =============================================================================

/// Set of instance ids bound to a slot.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct InstanceMask(u32);

impl InstanceMask {
    /// Build from raw bits.
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Raw bits.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Add an instance.
    pub fn insert(&mut self, instance: InstanceId) {
        self.0 |= 1 << (instance.index() % MAX_INSTANCES);
    }

    /// Remove an instance.
    pub fn remove(&mut self, instance: InstanceId) {
        self.0 &= !(1 << (instance.index() % MAX_INSTANCES));
    }

    /// Membership test.
    pub fn contains(self, instance: InstanceId) -> bool {
        self.0 & (1 << (instance.index() % MAX_INSTANCES)) != 0
    }

    /// True when nothing is bound.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Members in ascending id order.
    pub fn iter(self) -> impl Iterator<Item = InstanceId> {
        (0..MAX_INSTANCES as u8)
            .map(InstanceId)
            .filter(move |instance| self.contains(*instance))
    }
}

impl fmt::Debug for InstanceMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter().map(|i| i.0)).finish()
    }
}

// =============================================================================
// OwnerMask
// =============================================================================

/// Slots that still hold a frame.
///
/// Bits are added at dispatch and only removed afterwards: the first
/// `clear_owned` switches the mask into draining mode and later `mark_owned`
/// calls are refused.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct OwnerMask {
    owners: SlotMask,
    draining: bool,
}

impl OwnerMask {
    /// Record `slot` as an owner. Returns false (and changes nothing) once the
    /// mask has started draining.
    pub fn mark_owned(&mut self, slot: SlotId) -> bool {
        if self.draining {
            return false;
        }
        self.owners.insert(slot);
        true
    }

    /// Drop `slot` from the owners. Returns true if it was an owner.
    pub fn clear_owned(&mut self, slot: SlotId) -> bool {
        self.draining = true;
        self.owners.remove(slot)
    }

    /// Drop every owner at once (ndone and flush paths).
    pub fn clear_all(&mut self) -> SlotMask {
        self.draining = true;
        std::mem::take(&mut self.owners)
    }

    /// True when no slot holds the frame.
    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }

    /// True when `slot` still holds the frame.
    pub fn is_owned(&self, slot: SlotId) -> bool {
        self.owners.contains(slot)
    }

    /// True once a bit has been cleared.
    pub fn is_draining(&self) -> bool {
        self.draining
    }

    /// Current owners.
    pub fn owners(&self) -> SlotMask {
        self.owners
    }

    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }
}

impl fmt::Debug for OwnerMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnerMask")
            .field("owners", &self.owners)
            .field("draining", &self.draining)
            .finish()
    }
}
