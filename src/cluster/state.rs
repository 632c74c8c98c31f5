//! Shared per-node state handed to every task of the node.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use crate::cache::{
    ConnId, PathCache, PathTable, PendingRequest, Snapshot, WaitVerb,
};
use crate::cluster::{CmsState, NodeConfig};
use crate::manager::ManagerTree;
use crate::node::{
    Authenticator, FileSystem, LeastLoadSelector, LocalFs, Selector,
    ServerSlotTable, TrustingAuthenticator,
};
use crate::protocol::{
    modifier, ErrorResp, ExportSpec, Frame, LocateResp, Located, PathArgs,
    RedirectResp, Role, RrCode, WaitResp,
};
use crate::utils::{FedError, ServerSet, SlotId};

use tokio::sync::mpsc;

/// All state shared among the tasks of one node. Nothing here is global;
/// every component receives it through an `Arc`.
pub struct ClusterState {
    pub config: NodeConfig,
    pub role: Role,
    /// Identity announced at login, e.g. "s:host:3121".
    pub identity: String,
    pub exports: Vec<ExportSpec>,

    pub cache: PathCache,
    pub servers: ServerSlotTable,
    pub managers: ManagerTree,
    pub cms: CmsState,

    pub fs: Option<Arc<dyn FileSystem>>,
    pub selector: Box<dyn Selector>,
    pub auth: Box<dyn Authenticator>,

    paths: Mutex<PathTable>,
    conns: Mutex<HashMap<ConnId, mpsc::UnboundedSender<Frame>>>,
    next_conn: AtomicU64,
}

impl ClusterState {
    /// Creates node state with the default collaborators: a `LocalFs` if
    /// `data_root` is set, least-load selection, and trusting logins.
    pub fn new(config: NodeConfig) -> Result<Self, FedError> {
        config.validate()?;
        let role = config.role()?;
        let fs: Option<Arc<dyn FileSystem>> = if config.data_root.is_empty()
        {
            None
        } else {
            Some(Arc::new(LocalFs::new(&config.data_root)))
        };
        Ok(ClusterState {
            role,
            identity: format!(
                "{}:{}:{}",
                role.tag(),
                config.host_name,
                config.listen_port
            ),
            exports: config.export_specs()?,
            cache: PathCache::new(config.query_delay()),
            servers: ServerSlotTable::new(config.max_servers)?,
            managers: ManagerTree::new(config.max_managers)?,
            cms: CmsState::new(role.is_manager()),
            fs,
            selector: Box::new(LeastLoadSelector),
            auth: Box::new(TrustingAuthenticator),
            paths: Mutex::new(PathTable::new()),
            conns: Mutex::new(HashMap::new()),
            next_conn: AtomicU64::new(1),
            config,
        })
    }

    /// Replaces the filesystem collaborator.
    pub fn with_fs(mut self, fs: Option<Arc<dyn FileSystem>>) -> Self {
        self.fs = fs;
        self
    }

    /// Replaces the selection collaborator.
    pub fn with_selector(mut self, selector: Box<dyn Selector>) -> Self {
        self.selector = selector;
        self
    }

    /// Replaces the login collaborator.
    pub fn with_authenticator(mut self, auth: Box<dyn Authenticator>) -> Self {
        self.auth = auth;
        self
    }

    /// Locks the path export table.
    pub fn paths(&self) -> MutexGuard<'_, PathTable> {
        self.paths.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn conns(
        &self,
    ) -> MutexGuard<'_, HashMap<ConnId, mpsc::UnboundedSender<Frame>>> {
        self.conns.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers a live connection's outbound channel.
    pub fn register_conn(
        &self,
        tx_send: mpsc::UnboundedSender<Frame>,
    ) -> ConnId {
        let conn = self.next_conn.fetch_add(1, Ordering::Relaxed);
        self.conns().insert(conn, tx_send);
        conn
    }

    /// Forgets a closed connection and cancels its queued waiters.
    pub fn unregister_conn(&self, conn: ConnId) {
        self.conns().remove(&conn);
        self.cache.cancel_conn(conn);
    }

    /// Queues `frame` for sending on connection `conn`.
    pub fn send_to(&self, conn: ConnId, frame: Frame) -> bool {
        match self.conns().get(&conn) {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        }
    }

    /// Relays `frame` to the online subordinates in `mask`, one hop further.
    /// Frames whose hop counter is exhausted are dropped.
    pub fn relay_down(&self, frame: &Frame, mask: ServerSet) -> usize {
        let Some(relayed) = frame.relayed() else {
            pf_warn!(
                "hop limit reached, not relaying rr_code {} down",
                frame.header.rr_code
            );
            return 0;
        };
        self.servers
            .senders(mask & self.servers.online())
            .into_iter()
            .filter(|(_, tx)| tx.send(relayed.clone()).is_ok())
            .count()
    }

    /// Relays `frame` to every attached manager, one hop further. Frames
    /// whose hop counter is exhausted are dropped.
    pub fn relay_up(&self, frame: &Frame) -> usize {
        let Some(relayed) = frame.relayed() else {
            pf_warn!(
                "hop limit reached, not relaying rr_code {} up",
                frame.header.rr_code
            );
            return 0;
        };
        self.managers.inform(&relayed)
    }

    /// Asks the subordinates in `mask` whether they have `path`. `hops` is
    /// the hop count of the request that triggered the query.
    pub fn query(
        &self,
        path: &str,
        hops: u8,
        mask: ServerSet,
    ) -> Result<usize, FedError> {
        let mut frame = Frame::new(
            RrCode::State,
            0,
            0,
            &PathArgs { path: path.into() },
        )?;
        frame.header.hops = hops;
        Ok(self.relay_down(&frame, mask))
    }

    /// Subordinates that export `path`, writable ones only if `write`.
    pub fn candidates(&self, path: &str, write: bool) -> ServerSet {
        let info = self.paths().find(path);
        let exporters = if write { info.rw } else { info.ro };
        exporters & self.servers.online()
    }

    /// Composes the answer to a locate, select or state request about
    /// `path` from a resolved cache snapshot. `None` means no answer is
    /// to be sent.
    pub fn answer(
        &self,
        verb: WaitVerb,
        stream_id: u16,
        path: &str,
        snapshot: &Snapshot,
        want_write: bool,
    ) -> Result<Option<Frame>, FedError> {
        let online = self.servers.online();
        let writable = self.paths().find(path).rw;
        let mut have = snapshot.have & online;
        let mut pending = snapshot.pending & online;
        if want_write {
            have &= writable;
            pending &= writable;
        }

        let frame = match verb {
            WaitVerb::Locate => {
                let servers: Vec<Located> = (have | pending)
                    .iter()
                    .filter_map(|slot| self.located(slot, have, writable))
                    .collect();
                if servers.is_empty() {
                    not_found(stream_id, path)?
                } else {
                    Frame::new(
                        RrCode::Data,
                        0,
                        stream_id,
                        &LocateResp { servers },
                    )?
                }
            }
            WaitVerb::Select => {
                let statuses = self.servers.statuses();
                match self.selector.select(have, &statuses) {
                    Some(slot) => match self.servers.addr(slot) {
                        Some(addr) => Frame::new(
                            RrCode::Redirect,
                            0,
                            stream_id,
                            &RedirectResp {
                                host: addr.host,
                                port: addr.port,
                            },
                        )?,
                        None => self.wait(stream_id)?,
                    },
                    None if !(have | pending).is_empty() => {
                        self.wait(stream_id)?
                    }
                    None => not_found(stream_id, path)?,
                }
            }
            WaitVerb::State => {
                if (snapshot.have | snapshot.pending).is_empty() {
                    return Ok(None);
                }
                let bits = if snapshot.have.is_empty() {
                    modifier::PENDING
                } else {
                    0
                };
                let args = PathArgs { path: path.into() };
                Frame::new(RrCode::Have, bits, 0, &args)?
            }
        };
        Ok(Some(frame))
    }

    fn located(
        &self,
        slot: SlotId,
        have: ServerSet,
        writable: ServerSet,
    ) -> Option<Located> {
        let addr = self.servers.addr(slot)?;
        Some(Located {
            host: addr.host,
            port: addr.port,
            pending: !have.contains(slot),
            writable: writable.contains(slot),
        })
    }

    /// A "wait and retry" answer with the configured poll interval.
    pub fn wait(&self, stream_id: u16) -> Result<Frame, FedError> {
        Frame::new(
            RrCode::Wait,
            0,
            stream_id,
            &WaitResp {
                secs: self.config.poll_wait_secs,
            },
        )
    }

    /// Sends each released waiter its answer about `path`.
    pub fn deliver(
        &self,
        path: &str,
        snapshot: &Snapshot,
        released: Vec<PendingRequest>,
    ) {
        for waiter in released {
            match self.answer(
                waiter.verb,
                waiter.stream_id,
                path,
                snapshot,
                waiter.wants_write,
            ) {
                Ok(Some(frame)) => {
                    if !self.send_to(waiter.conn, frame) {
                        pf_debug!(
                            "waiter conn {} gone before release",
                            waiter.conn
                        );
                    }
                }
                Ok(None) => {}
                Err(e) => pf_error!("error answering waiter: {}", e),
            }
        }
    }

    /// Periodic maintenance: expires queued waiters, evicts idle cache
    /// lines, and reclaims subordinate slots offline for too long.
    pub fn maintain(&self, now: Instant) {
        let report = self.cache.scrub(now, self.config.suspect_hold());
        for waiter in report.expired {
            if waiter.verb == WaitVerb::State {
                continue;
            }
            match self.wait(waiter.stream_id) {
                Ok(frame) => {
                    self.send_to(waiter.conn, frame);
                }
                Err(e) => pf_error!("error composing wait: {}", e),
            }
        }
        if report.evicted > 0 {
            pf_debug!("scrub evicted {} cache lines", report.evicted);
        }

        for slot in self.servers.reclaim(now, self.config.drop_delay()) {
            pf_info!("reclaiming offline server slot {}", slot);
            self.cache.reset(slot);
            if let Ok(mask) = ServerSet::single(slot) {
                self.paths().remove(mask);
            }
        }
    }

    /// Free space in MB and utilization percent this node advertises:
    /// its own storage if it has any, else the sum over subordinates.
    pub async fn space(self: &Arc<Self>) -> Result<(u64, u32), FedError> {
        match self.fs.clone() {
            Some(fs) => {
                let info = tokio::task::spawn_blocking(move || fs.statfs())
                    .await?
                    .map_err(|e| FedError::msg(format!("statfs: {}", e)))?;
                Ok((info.free_mb, info.util))
            }
            None => Ok(self.servers.space()),
        }
    }

    /// Re-evaluates the aggregate state and informs managers on change.
    pub fn recount(&self) {
        if let Some(bits) = self.cms.recount(self.servers.counts()) {
            self.inform_status(bits);
        }
    }

    /// Applies a local administrative suspend or nostage change and
    /// informs managers if the effective state moved.
    pub fn set_local(&self, suspend: Option<bool>, nostage: Option<bool>) {
        if let Some(bits) = self.cms.set_local(suspend, nostage) {
            pf_info!("local status changed to {:#04x}", bits);
            self.inform_status(bits);
        }
    }

    /// Sends a status frame carrying `bits` to every attached manager.
    pub fn inform_status(&self, bits: u8) {
        pf_debug!("informing managers of status {:#04x}", bits);
        self.managers.inform(&Frame::bare(RrCode::Status, bits, 0));
    }
}

/// An ENOENT error answer about `path`.
pub fn not_found(stream_id: u16, path: &str) -> Result<Frame, FedError> {
    Frame::new(
        RrCode::Error,
        0,
        stream_id,
        &ErrorResp {
            errno: libc::ENOENT,
            text: format!("no servers have {}", path),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::LoginArgs;
    use std::time::Duration;

    fn manager() -> Result<ClusterState, FedError> {
        ClusterState::new(NodeConfig::default())
    }

    fn login(identity: &str, port: u16) -> Result<LoginArgs, FedError> {
        Ok(LoginArgs {
            role: Role::Server,
            identity: identity.into(),
            site: String::new(),
            port,
            mode: 0,
            exports: vec!["/data:rw".parse()?],
            load: 0,
            free_mb: 0,
            credentials: vec![],
        })
    }

    // Admits a server exporting /data; returns its slot and outbound queue.
    fn admit(
        state: &ClusterState,
        identity: &str,
        port: u16,
    ) -> Result<(SlotId, mpsc::UnboundedReceiver<Frame>), FedError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let login = login(identity, port)?;
        let conn = state.register_conn(tx.clone());
        let slot = state.servers.admit(&login, "10.0.0.1", conn, tx)?;
        state
            .paths()
            .insert_all(&login.exports, ServerSet::single(slot)?);
        Ok((slot, rx))
    }

    fn snapshot(have: &[SlotId], pending: &[SlotId]) -> Snapshot {
        Snapshot {
            have: ServerSet::from_slots(have.iter().copied()).unwrap(),
            pending: ServerSet::from_slots(pending.iter().copied()).unwrap(),
            ..Default::default()
        }
    }

    #[test]
    fn answer_locate() -> Result<(), FedError> {
        let state = manager()?;
        let (s0, _rx0) = admit(&state, "a", 2000)?;
        let (s1, _rx1) = admit(&state, "b", 2001)?;

        let snap = snapshot(&[s0], &[s1]);
        let frame = state
            .answer(WaitVerb::Locate, 3, "/data/f", &snap, false)?
            .unwrap();
        assert_eq!(frame.code(), Some(RrCode::Data));
        assert_eq!(frame.header.stream_id, 3);
        let resp: LocateResp = frame.args()?;
        let ports: Vec<(u16, bool)> =
            resp.servers.iter().map(|l| (l.port, l.pending)).collect();
        assert_eq!(ports, vec![(2000, false), (2001, true)]);

        let frame = state
            .answer(WaitVerb::Locate, 4, "/data/f", &snapshot(&[], &[]), false)?
            .unwrap();
        assert_eq!(frame.code(), Some(RrCode::Error));
        Ok(())
    }

    #[test]
    fn answer_select() -> Result<(), FedError> {
        let state = manager()?;
        let (s0, _rx0) = admit(&state, "a", 2000)?;
        let (s1, _rx1) = admit(&state, "b", 2001)?;
        state.servers.update_status(s0, |st| st.load = 90);
        state.servers.update_status(s1, |st| st.load = 10);

        let both = snapshot(&[s0, s1], &[]);
        let frame = state
            .answer(WaitVerb::Select, 5, "/data/f", &both, false)?
            .unwrap();
        assert_eq!(frame.code(), Some(RrCode::Redirect));
        assert_eq!(frame.args::<RedirectResp>()?.port, 2001);

        // nobody selectable yet, but somebody is staging the file
        state.servers.update_status(s0, |st| st.suspended = true);
        state.servers.update_status(s1, |st| st.suspended = true);
        let frame = state
            .answer(WaitVerb::Select, 6, "/data/f", &both, false)?
            .unwrap();
        assert_eq!(frame.code(), Some(RrCode::Wait));
        Ok(())
    }

    #[test]
    fn answer_state() -> Result<(), FedError> {
        let state = manager()?;
        let (s0, _rx0) = admit(&state, "a", 2000)?;

        let snap = snapshot(&[], &[s0]);
        let frame = state
            .answer(WaitVerb::State, 0, "/data/f", &snap, false)?
            .unwrap();
        assert_eq!(frame.code(), Some(RrCode::Have));
        assert_eq!(frame.header.modifier, modifier::PENDING);
        assert_eq!(frame.args::<PathArgs>()?.path, "/data/f");
        assert!(state
            .answer(WaitVerb::State, 0, "/data/f", &snapshot(&[], &[]), false)?
            .is_none());
        Ok(())
    }

    #[test]
    fn relay_hop_limit() -> Result<(), FedError> {
        let state = manager()?;
        let (_, mut rx) = admit(&state, "a", 2000)?;

        let mut frame = Frame::bare(RrCode::Rm, 0, 9);
        frame.header.hops = 3;
        assert_eq!(state.relay_down(&frame, ServerSet::ALL), 1);
        let relayed = rx.try_recv().expect("relayed frame");
        assert_eq!(relayed.header.hops, 4);
        assert_eq!(relayed.header.stream_id, 0);

        frame.header.hops = u8::MAX;
        assert_eq!(state.relay_down(&frame, ServerSet::ALL), 0);
        assert!(rx.try_recv().is_err());
        Ok(())
    }

    #[test]
    fn maintain_expires_waiters() -> Result<(), FedError> {
        let state = manager()?;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = state.register_conn(tx);
        let waiter = PendingRequest {
            conn,
            stream_id: 12,
            wants_write: false,
            verb: WaitVerb::Locate,
        };
        state.cache.get_file("/data/g", false, Some(waiter));
        assert_eq!(state.cache.num_waiters(), 1);

        state.maintain(Instant::now() + Duration::from_secs(10));
        assert_eq!(state.cache.num_waiters(), 0);
        let wait = rx.try_recv().expect("wait frame");
        assert_eq!(wait.code(), Some(RrCode::Wait));
        assert_eq!(wait.header.stream_id, 12);
        Ok(())
    }

    #[test]
    fn maintain_reclaims_offline_slots() -> Result<(), FedError> {
        let state = manager()?;
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = state.register_conn(tx.clone());
        let login = login("a", 2000)?;
        let slot = state.servers.admit(&login, "10.0.0.1", conn, tx)?;
        let mask = ServerSet::single(slot)?;
        state.paths().insert_all(&login.exports, mask);
        state
            .cache
            .add_file("/data/h", mask, Default::default(), Duration::ZERO);

        // a stale connection id does not take the slot offline
        assert!(!state.servers.disconnect(slot, conn + 100));
        assert!(state.servers.disconnect(slot, conn));
        assert!(state.servers.online().is_empty());

        state.maintain(Instant::now());
        assert_eq!(state.servers.len(), 1);
        let later = Instant::now() + state.config.drop_delay() * 2;
        state.maintain(later);
        assert_eq!(state.servers.len(), 0);
        assert!(state.cache.peek("/data/h").is_none());
        assert!(state.paths().find("/data/h").ro.is_empty());
        Ok(())
    }
}
