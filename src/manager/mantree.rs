//! Bookkeeping of the managers this node is, or may become, attached to.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::protocol::Frame;
use crate::utils::{FedError, SlotBitmap, SlotId};

use tokio::sync::mpsc;

/// One alternate manager a node may connect to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerEntry {
    pub host: String,
    pub port: u16,
    /// Distance from the root; lower is preferred.
    pub level: u8,
    /// Which subscription learned of this entry.
    pub reference: u32,
}

/// Level-ordered, deduplicated list of alternate managers with a
/// round-robin cursor.
///
/// `next()` walks every entry once, then yields `None` once so the caller
/// falls back to its configured primary, then starts over.
#[derive(Debug, Default)]
pub struct AlternateManagerList {
    entries: Vec<ManagerEntry>,
    cursor: usize,
}

impl AlternateManagerList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an alternate unless `(host, port)` is already known. Returns
    /// whether it was added.
    pub fn add(
        &mut self,
        reference: u32,
        host: &str,
        port: u16,
        level: u8,
    ) -> bool {
        if self.entries.iter().any(|e| e.host == host && e.port == port) {
            return false;
        }
        let idx = self
            .entries
            .iter()
            .position(|e| e.level > level)
            .unwrap_or(self.entries.len());
        self.entries.insert(
            idx,
            ManagerEntry {
                host: host.into(),
                port,
                level,
                reference,
            },
        );
        if idx < self.cursor {
            self.cursor += 1;
        }
        true
    }

    /// Removes every entry added under `reference`. Returns how many.
    pub fn del(&mut self, reference: u32) -> usize {
        let mut removed = 0;
        let mut idx = 0;
        while idx < self.entries.len() {
            if self.entries[idx].reference == reference {
                self.entries.remove(idx);
                if idx < self.cursor {
                    self.cursor -= 1;
                }
                removed += 1;
            } else {
                idx += 1;
            }
        }
        removed
    }

    /// Returns the next candidate, or `None` at the wrap-around point.
    pub fn next(&mut self) -> Option<ManagerEntry> {
        match self.entries.get(self.cursor) {
            Some(entry) => {
                self.cursor += 1;
                Some(entry.clone())
            }
            None => {
                self.cursor = 0;
                None
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of the entries in preference order.
    pub fn entries(&self) -> Vec<ManagerEntry> {
        self.entries.clone()
    }
}

#[derive(Debug)]
struct AttachedManager {
    host: String,
    port: u16,
    tx_send: mpsc::UnboundedSender<Frame>,
}

/// Slots of concurrently attached upstream managers.
#[derive(Debug)]
pub struct ManagerSlotTable {
    bitmap: SlotBitmap,
    attached: HashMap<SlotId, AttachedManager>,
}

impl ManagerSlotTable {
    pub fn new(capacity: u8) -> Result<Self, FedError> {
        Ok(ManagerSlotTable {
            bitmap: SlotBitmap::new(capacity)?,
            attached: HashMap::new(),
        })
    }

    /// Registers an attached manager connection.
    pub fn attach(
        &mut self,
        host: &str,
        port: u16,
        tx_send: mpsc::UnboundedSender<Frame>,
    ) -> Result<SlotId, FedError> {
        let slot = self.bitmap.claim_first().ok_or_else(|| {
            FedError::msg(format!(
                "manager slot table full ({} slots)",
                self.bitmap.size()
            ))
        })?;
        self.attached.insert(
            slot,
            AttachedManager {
                host: host.into(),
                port,
                tx_send,
            },
        );
        Ok(slot)
    }

    /// Unregisters the manager attached at `slot`.
    pub fn detach(&mut self, slot: SlotId) -> Result<(), FedError> {
        if self.attached.remove(&slot).is_none() {
            return Err(FedError::msg(format!(
                "manager slot {} not attached",
                slot
            )));
        }
        self.bitmap.release(slot)
    }

    /// Endpoints of all attached managers.
    pub fn endpoints(&self) -> Vec<(String, u16)> {
        self.attached
            .values()
            .map(|m| (m.host.clone(), m.port))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.attached.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attached.is_empty()
    }
}

/// Everything this node knows about its upstream managers.
#[derive(Debug)]
pub struct ManagerTree {
    alternates: Mutex<AlternateManagerList>,
    slots: Mutex<ManagerSlotTable>,
    next_reference: AtomicU32,
}

impl ManagerTree {
    pub fn new(max_managers: u8) -> Result<Self, FedError> {
        Ok(ManagerTree {
            alternates: Mutex::new(AlternateManagerList::new()),
            slots: Mutex::new(ManagerSlotTable::new(max_managers)?),
            next_reference: AtomicU32::new(1),
        })
    }

    /// Locks the alternate manager list.
    pub fn alternates(&self) -> MutexGuard<'_, AlternateManagerList> {
        self.alternates.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Locks the attached manager table.
    pub fn slots(&self) -> MutexGuard<'_, ManagerSlotTable> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Allocates a fresh reference for tagging learned alternates.
    pub fn new_reference(&self) -> u32 {
        self.next_reference.fetch_add(1, Ordering::Relaxed)
    }

    /// Sends `frame` to every attached manager. Returns how many got it.
    pub fn inform(&self, frame: &Frame) -> usize {
        let slots = self.slots();
        slots
            .attached
            .values()
            .filter(|m| m.tx_send.send(frame.clone()).is_ok())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RrCode;

    fn hosts(list: &AlternateManagerList) -> Vec<(String, u8)> {
        list.entries()
            .into_iter()
            .map(|e| (format!("{}:{}", e.host, e.port), e.level))
            .collect()
    }

    #[test]
    fn add_dedup_and_order() {
        let mut list = AlternateManagerList::new();
        assert!(list.add(1, "c", 3121, 2));
        assert!(list.add(1, "a", 3121, 1));
        assert!(list.add(2, "b", 3121, 1));
        assert!(!list.add(3, "a", 3121, 0));
        assert!(list.add(3, "a", 3122, 0));
        assert_eq!(
            hosts(&list),
            vec![
                ("a:3122".to_string(), 0),
                ("a:3121".to_string(), 1),
                ("b:3121".to_string(), 1),
                ("c:3121".to_string(), 2),
            ]
        );
    }

    #[test]
    fn next_wraps_through_primary() {
        let mut list = AlternateManagerList::new();
        assert_eq!(list.next(), None);
        list.add(1, "a", 1, 1);
        list.add(1, "b", 2, 2);
        let order: Vec<Option<String>> =
            (0..6).map(|_| list.next().map(|e| e.host)).collect();
        assert_eq!(
            order,
            vec![
                Some("a".into()),
                Some("b".into()),
                None,
                Some("a".into()),
                Some("b".into()),
                None
            ]
        );
    }

    #[test]
    fn del_by_reference_keeps_cursor() {
        let mut list = AlternateManagerList::new();
        list.add(1, "a", 1, 1);
        list.add(2, "b", 1, 1);
        list.add(1, "c", 1, 1);
        assert_eq!(list.next().map(|e| e.host), Some("a".into()));
        assert_eq!(list.del(1), 2);
        assert_eq!(list.len(), 1);
        assert_eq!(list.next().map(|e| e.host), Some("b".into()));
        assert_eq!(list.next(), None);
        assert_eq!(list.del(9), 0);
    }

    #[test]
    fn manager_slots() -> Result<(), FedError> {
        let tree = ManagerTree::new(2)?;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let s0 = tree.slots().attach("m0", 3121, tx.clone())?;
        let s1 = tree.slots().attach("m1", 3121, tx.clone())?;
        assert!(tree.slots().attach("m2", 3121, tx).is_err());
        assert_ne!(s0, s1);
        assert_eq!(tree.slots().endpoints().len(), 2);

        assert_eq!(tree.inform(&Frame::bare(RrCode::Ping, 0, 0)), 2);
        assert!(rx.try_recv().is_ok());

        tree.slots().detach(s0)?;
        assert!(tree.slots().detach(s0).is_err());
        assert_eq!(tree.slots().len(), 1);
        assert_ne!(tree.new_reference(), tree.new_reference());
        Ok(())
    }
}
