//! Fixed-width server-set bitmask over slot indices.

use std::fmt;
use std::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Not, Sub};

use crate::utils::FedError;

use serde::{Deserialize, Serialize};

/// Slot index of a connected peer; doubles as its bit position.
pub type SlotId = u8;

/// Number of slots a `ServerSet` can address.
pub const MAX_SLOTS: u8 = 64;

/// Set of server slots, backed by a single machine word. Values are plain
/// `Copy` data: once read out of a shared table they are never aliased.
#[derive(
    Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub struct ServerSet(u64);

impl ServerSet {
    /// The empty set.
    pub const EMPTY: ServerSet = ServerSet(0);

    /// The set containing every addressable slot.
    pub const ALL: ServerSet = ServerSet(u64::MAX);

    /// Creates a set from its raw bit representation.
    #[inline]
    pub const fn from_bits(bits: u64) -> Self {
        ServerSet(bits)
    }

    /// Returns the raw bit representation.
    #[inline]
    pub const fn bits(&self) -> u64 {
        self.0
    }

    /// Creates a set holding exactly one slot.
    pub fn single(slot: SlotId) -> Result<Self, FedError> {
        if slot >= MAX_SLOTS {
            return Err(FedError::msg(format!(
                "slot {} out of range (max {})",
                slot, MAX_SLOTS
            )));
        }
        Ok(ServerSet(1u64 << slot))
    }

    /// Creates a set from a list of slots.
    pub fn from_slots(
        slots: impl IntoIterator<Item = SlotId>,
    ) -> Result<Self, FedError> {
        let mut set = ServerSet::EMPTY;
        for slot in slots {
            set |= ServerSet::single(slot)?;
        }
        Ok(set)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn contains(&self, slot: SlotId) -> bool {
        slot < MAX_SLOTS && (self.0 >> slot) & 1 == 1
    }

    /// True if the two sets share at least one slot.
    #[inline]
    pub fn intersects(&self, other: ServerSet) -> bool {
        self.0 & other.0 != 0
    }

    #[inline]
    pub fn insert(&mut self, slot: SlotId) -> Result<(), FedError> {
        *self |= ServerSet::single(slot)?;
        Ok(())
    }

    #[inline]
    pub fn remove(&mut self, slot: SlotId) {
        if slot < MAX_SLOTS {
            self.0 &= !(1u64 << slot);
        }
    }

    /// Number of slots in the set.
    #[inline]
    pub fn count(&self) -> u32 {
        self.0.count_ones()
    }

    /// Lowest slot in the set, if any.
    #[inline]
    pub fn first(&self) -> Option<SlotId> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros() as SlotId)
        }
    }

    /// Allows `for slot in set.iter()`, ascending.
    #[inline]
    pub fn iter(&self) -> ServerSetIter {
        ServerSetIter { rest: self.0 }
    }
}

/// Iterator over the slots of a `ServerSet`, lowest first.
#[derive(Debug, Clone)]
pub struct ServerSetIter {
    rest: u64,
}

impl Iterator for ServerSetIter {
    type Item = SlotId;

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest == 0 {
            return None;
        }
        let slot = self.rest.trailing_zeros() as SlotId;
        self.rest &= self.rest - 1; // clear lowest set bit
        Some(slot)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.rest.count_ones() as usize;
        (n, Some(n))
    }
}

impl BitOr for ServerSet {
    type Output = ServerSet;

    fn bitor(self, rhs: ServerSet) -> ServerSet {
        ServerSet(self.0 | rhs.0)
    }
}

impl BitOrAssign for ServerSet {
    fn bitor_assign(&mut self, rhs: ServerSet) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for ServerSet {
    type Output = ServerSet;

    fn bitand(self, rhs: ServerSet) -> ServerSet {
        ServerSet(self.0 & rhs.0)
    }
}

impl BitAndAssign for ServerSet {
    fn bitand_assign(&mut self, rhs: ServerSet) {
        self.0 &= rhs.0;
    }
}

impl Not for ServerSet {
    type Output = ServerSet;

    fn not(self) -> ServerSet {
        ServerSet(!self.0)
    }
}

/// Set difference: slots in `self` but not in `rhs`.
impl Sub for ServerSet {
    type Output = ServerSet;

    fn sub(self, rhs: ServerSet) -> ServerSet {
        ServerSet(self.0 & !rhs.0)
    }
}

// Implement `Debug` trait manually for better trace printing.
impl fmt::Debug for ServerSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{")?;
        let mut first = true;
        for slot in self.iter() {
            if !first {
                write!(f, ", {}", slot)?;
            } else {
                write!(f, "{}", slot)?;
                first = false;
            }
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_out_of_range() {
        assert!(ServerSet::single(63).is_ok());
        assert!(ServerSet::single(64).is_err());
        let mut set = ServerSet::EMPTY;
        assert!(set.insert(200).is_err());
        assert!(set.is_empty());
    }

    #[test]
    fn set_algebra() -> Result<(), FedError> {
        let a = ServerSet::from_slots([1, 3, 5])?;
        let b = ServerSet::from_slots([3, 4])?;
        assert_eq!(a | b, ServerSet::from_slots([1, 3, 4, 5])?);
        assert_eq!(a & b, ServerSet::single(3)?);
        assert_eq!(a - b, ServerSet::from_slots([1, 5])?);
        assert!(!(!a).contains(3));
        assert!((!a).contains(0));
        assert!(a.intersects(b));
        assert!(!a.intersects(ServerSet::single(0)?));
        Ok(())
    }

    #[test]
    fn iter_and_count() -> Result<(), FedError> {
        let set = ServerSet::from_slots([0, 7, 63])?;
        assert_eq!(set.count(), 3);
        assert_eq!(set.first(), Some(0));
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![0, 7, 63]);
        assert_eq!(ServerSet::EMPTY.first(), None);
        assert_eq!(format!("{:?}", set), "{0, 7, 63}");
        Ok(())
    }

    #[test]
    fn remove_slot() -> Result<(), FedError> {
        let mut set = ServerSet::from_slots([2, 5])?;
        set.remove(2);
        set.remove(70); // no-op
        assert_eq!(set, ServerSet::single(5)?);
        Ok(())
    }
}
