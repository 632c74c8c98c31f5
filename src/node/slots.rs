//! Slot table of attached subordinate servers.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::cache::ConnId;
use crate::protocol::{modifier, Frame, LoginArgs};
use crate::utils::{FedError, ServerSet, SlotBitmap, SlotId};

use tokio::sync::mpsc;

/// Last known serving state of one subordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeStatus {
    pub suspended: bool,
    pub nostage: bool,
    pub load: u32,
    pub free_mb: u64,
    pub util: u32,
}

impl NodeStatus {
    /// Initial status announced in a login request.
    pub fn from_login(login: &LoginArgs) -> Self {
        NodeStatus {
            suspended: login.mode & modifier::LOGIN_SUSPEND != 0,
            nostage: login.mode & modifier::LOGIN_NOSTAGE != 0,
            load: login.load,
            free_mb: login.free_mb,
            util: 0,
        }
    }
}

/// Where clients reach one subordinate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddr {
    pub host: String,
    pub port: u16,
}

#[derive(Debug)]
struct ServerInfo {
    identity: String,
    addr: ServerAddr,
    status: NodeStatus,
    conn: Option<ConnId>,
    tx_send: Option<mpsc::UnboundedSender<Frame>>,
    offline_since: Option<Instant>,
}

#[derive(Debug)]
struct SlotTableInner {
    bitmap: SlotBitmap,
    servers: HashMap<SlotId, ServerInfo>,
}

/// Summary counts used to derive the aggregate node state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SlotCounts {
    /// Online subordinates that are not suspended.
    pub active: usize,
    /// Active subordinates that accept staging.
    pub staging: usize,
}

/// Fixed-capacity table assigning each subordinate a stable slot.
///
/// A slot whose connection dropped stays reserved (offline) until it is
/// reclaimed, so cache lines still naming it never alias a newcomer.
#[derive(Debug)]
pub struct ServerSlotTable {
    inner: Mutex<SlotTableInner>,
}

impl ServerSlotTable {
    /// Creates a table of `capacity` slots.
    pub fn new(capacity: u8) -> Result<Self, FedError> {
        Ok(ServerSlotTable {
            inner: Mutex::new(SlotTableInner {
                bitmap: SlotBitmap::new(capacity)?,
                servers: HashMap::new(),
            }),
        })
    }

    fn table(&self) -> MutexGuard<'_, SlotTableInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Assigns a slot to a logging-in subordinate. A subordinate logging
    /// in again under the same identity gets its previous slot back.
    pub fn admit(
        &self,
        login: &LoginArgs,
        host: &str,
        conn: ConnId,
        tx_send: mpsc::UnboundedSender<Frame>,
    ) -> Result<SlotId, FedError> {
        let mut table = self.table();
        let reused = table
            .servers
            .iter()
            .find(|(_, info)| info.identity == login.identity)
            .map(|(slot, _)| *slot);
        let slot = match reused {
            Some(slot) => slot,
            None => table.bitmap.claim_first().ok_or_else(|| {
                FedError::msg(format!(
                    "server slot table full ({} slots)",
                    table.bitmap.size()
                ))
            })?,
        };
        table.servers.insert(
            slot,
            ServerInfo {
                identity: login.identity.clone(),
                addr: ServerAddr {
                    host: host.to_string(),
                    port: login.port,
                },
                status: NodeStatus::from_login(login),
                conn: Some(conn),
                tx_send: Some(tx_send),
                offline_since: None,
            },
        );
        Ok(slot)
    }

    /// Marks `slot` offline if it is still bound to connection `conn`.
    /// Returns whether it was.
    pub fn disconnect(&self, slot: SlotId, conn: ConnId) -> bool {
        let mut table = self.table();
        match table.servers.get_mut(&slot) {
            Some(info) if info.conn == Some(conn) => {
                info.conn = None;
                info.tx_send = None;
                info.offline_since = Some(Instant::now());
                true
            }
            _ => false,
        }
    }

    /// Frees every slot offline for at least `drop_delay` as of `now`.
    pub fn reclaim(&self, now: Instant, drop_delay: Duration) -> Vec<SlotId> {
        let mut table = self.table();
        let due: Vec<SlotId> = table
            .servers
            .iter()
            .filter(|(_, info)| {
                info.offline_since.is_some_and(|t| {
                    now.saturating_duration_since(t) >= drop_delay
                })
            })
            .map(|(slot, _)| *slot)
            .collect();
        for slot in &due {
            table.servers.remove(slot);
            if let Err(e) = table.bitmap.release(*slot) {
                pf_error!("error releasing slot {}: {}", slot, e);
            }
        }
        due
    }

    /// Applies `f` to the status of `slot`; returns the new status.
    pub fn update_status(
        &self,
        slot: SlotId,
        f: impl FnOnce(&mut NodeStatus),
    ) -> Option<NodeStatus> {
        let mut table = self.table();
        let info = table.servers.get_mut(&slot)?;
        f(&mut info.status);
        Some(info.status)
    }

    /// Statuses of all online subordinates.
    pub fn statuses(&self) -> HashMap<SlotId, NodeStatus> {
        self.table()
            .servers
            .iter()
            .filter(|(_, info)| info.conn.is_some())
            .map(|(slot, info)| (*slot, info.status))
            .collect()
    }

    /// Set of online subordinates.
    pub fn online(&self) -> ServerSet {
        let table = self.table();
        let mut set = ServerSet::EMPTY;
        for (slot, info) in table.servers.iter() {
            if info.conn.is_some() {
                // slots come from the bitmap, always in range
                set |= ServerSet::single(*slot).unwrap_or(ServerSet::EMPTY);
            }
        }
        set
    }

    /// Client-facing address of `slot`.
    pub fn addr(&self, slot: SlotId) -> Option<ServerAddr> {
        self.table().servers.get(&slot).map(|info| info.addr.clone())
    }

    /// Send handles of online subordinates within `mask`.
    pub fn senders(
        &self,
        mask: ServerSet,
    ) -> Vec<(SlotId, mpsc::UnboundedSender<Frame>)> {
        let table = self.table();
        mask.iter()
            .filter_map(|slot| {
                let tx = table.servers.get(&slot)?.tx_send.clone()?;
                Some((slot, tx))
            })
            .collect()
    }

    /// Counts of active and staging subordinates.
    pub fn counts(&self) -> SlotCounts {
        let table = self.table();
        let mut counts = SlotCounts::default();
        for info in table.servers.values() {
            if info.conn.is_some() && !info.status.suspended {
                counts.active += 1;
                if !info.status.nostage {
                    counts.staging += 1;
                }
            }
        }
        counts
    }

    /// Total free space and worst utilization over online subordinates.
    pub fn space(&self) -> (u64, u32) {
        let table = self.table();
        table
            .servers
            .values()
            .filter(|info| info.conn.is_some())
            .fold((0, 0), |(free, util), info| {
                (free + info.status.free_mb, util.max(info.status.util))
            })
    }

    /// Number of reserved slots, online or offline.
    pub fn len(&self) -> usize {
        self.table().servers.len()
    }

    /// Is no slot reserved?
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Role;

    fn login(identity: &str, mode: u8) -> LoginArgs {
        LoginArgs {
            role: Role::Server,
            identity: identity.into(),
            site: "local".into(),
            port: 1094,
            mode,
            exports: vec![],
            load: 7,
            free_mb: 100,
            credentials: vec![],
        }
    }

    #[test]
    fn admit_and_reuse() -> Result<(), FedError> {
        let table = ServerSlotTable::new(2)?;
        let (tx, _rx) = mpsc::unbounded_channel();
        assert_eq!(table.admit(&login("a", 0), "h1", 1, tx.clone())?, 0);
        assert_eq!(table.admit(&login("b", 0), "h2", 2, tx.clone())?, 1);
        assert!(table.admit(&login("c", 0), "h3", 3, tx.clone()).is_err());

        // the same identity comes back on a new connection
        assert!(table.disconnect(0, 1));
        assert_eq!(table.online(), ServerSet::single(1)?);
        assert_eq!(table.admit(&login("a", 0), "h1", 4, tx.clone())?, 0);
        assert_eq!(table.online(), ServerSet::from_slots([0, 1])?);

        // stale connection cannot mark the slot offline
        assert!(!table.disconnect(0, 1));
        assert_eq!(table.addr(1).map(|a| a.host), Some("h2".to_string()));
        Ok(())
    }

    #[test]
    fn reclaim_after_delay() -> Result<(), FedError> {
        let table = ServerSlotTable::new(4)?;
        let (tx, _rx) = mpsc::unbounded_channel();
        table.admit(&login("a", 0), "h1", 1, tx.clone())?;
        table.admit(&login("b", 0), "h2", 2, tx)?;
        table.disconnect(1, 2);
        let now = Instant::now();
        assert!(table.reclaim(now, Duration::from_secs(10)).is_empty());
        assert_eq!(table.len(), 2);
        assert_eq!(
            table.reclaim(
                now + Duration::from_secs(10),
                Duration::from_secs(10)
            ),
            vec![1]
        );
        assert_eq!(table.len(), 1);
        Ok(())
    }

    #[test]
    fn status_and_counts() -> Result<(), FedError> {
        let table = ServerSlotTable::new(4)?;
        let (tx, _rx) = mpsc::unbounded_channel();
        table.admit(&login("a", modifier::LOGIN_SUSPEND), "h1", 1, tx.clone())?;
        table.admit(&login("b", modifier::LOGIN_NOSTAGE), "h2", 2, tx.clone())?;
        table.admit(&login("c", 0), "h3", 3, tx)?;
        assert_eq!(
            table.counts(),
            SlotCounts {
                active: 2,
                staging: 1
            }
        );
        let st = table.update_status(0, |st| st.suspended = false);
        assert_eq!(st.map(|st| st.load), Some(7));
        assert_eq!(table.counts().active, 3);
        assert_eq!(table.space(), (300, 0));
        assert_eq!(table.senders(ServerSet::from_slots([0, 2, 5])?).len(), 2);
        assert!(table.update_status(9, |_| {}).is_none());
        Ok(())
    }
}
