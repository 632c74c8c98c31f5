//! Slot occupancy bitmap helper.

use std::fmt;

use crate::utils::{FedError, SlotId};

use fixedbitset::FixedBitSet;

/// Compact occupancy map for slot allocation. Claiming always hands out the
/// lowest vacant slot so that slot numbers stay dense.
#[derive(Clone, PartialEq, Eq)]
pub struct SlotBitmap(FixedBitSet);

impl SlotBitmap {
    /// Creates a new occupancy map with `size` vacant slots.
    pub fn new(size: u8) -> Result<Self, FedError> {
        if size == 0 {
            return Err(FedError::msg(format!(
                "invalid slot bitmap size {}",
                size
            )));
        }
        Ok(SlotBitmap(FixedBitSet::with_capacity(size as usize)))
    }

    /// Returns the number of slots managed.
    #[inline]
    pub fn size(&self) -> u8 {
        self.0.len() as u8
    }

    /// Returns the number of claimed slots.
    #[inline]
    pub fn count(&self) -> u8 {
        self.0.count_ones(..) as u8
    }

    /// Returns whether the slot is currently claimed.
    #[inline]
    pub fn is_claimed(&self, slot: SlotId) -> bool {
        (slot as usize) < self.0.len() && self.0[slot as usize]
    }

    /// Claims the lowest vacant slot, or `None` if all are taken.
    pub fn claim_first(&mut self) -> Option<SlotId> {
        let slot = (0..self.0.len()).find(|&s| !self.0[s])?;
        self.0.insert(slot);
        Some(slot as SlotId)
    }

    /// Returns a claimed slot to the pool.
    pub fn release(&mut self, slot: SlotId) -> Result<(), FedError> {
        if slot as usize >= self.0.len() {
            return Err(FedError::msg(format!(
                "slot {} out of bound",
                slot
            )));
        }
        if !self.0[slot as usize] {
            return Err(FedError::msg(format!("slot {} not claimed", slot)));
        }
        self.0.set(slot as usize, false);
        Ok(())
    }

    /// Highest claimed slot, if any.
    pub fn high_water(&self) -> Option<SlotId> {
        self.0.ones().last().map(|s| s as SlotId)
    }
}

// Implement `Debug` trait manually for better trace printing.
impl fmt::Debug for SlotBitmap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let claimed: Vec<usize> = self.0.ones().collect();
        write!(f, "{{{}; {:?}}}", self.size(), claimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitmap_zero_size() {
        assert!(SlotBitmap::new(0).is_err());
    }

    #[test]
    fn claim_lowest_first() -> Result<(), FedError> {
        let mut map = SlotBitmap::new(3)?;
        assert_eq!(map.claim_first(), Some(0));
        assert_eq!(map.claim_first(), Some(1));
        assert_eq!(map.claim_first(), Some(2));
        assert_eq!(map.claim_first(), None);
        map.release(1)?;
        assert!(!map.is_claimed(1));
        assert_eq!(map.claim_first(), Some(1));
        assert_eq!(map.count(), 3);
        Ok(())
    }

    #[test]
    fn release_errors() -> Result<(), FedError> {
        let mut map = SlotBitmap::new(4)?;
        assert!(map.release(9).is_err());
        assert!(map.release(2).is_err());
        assert_eq!(map.high_water(), None);
        map.claim_first();
        map.claim_first();
        assert_eq!(map.high_water(), Some(1));
        Ok(())
    }
}
