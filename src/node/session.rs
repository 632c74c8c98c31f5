//! Per-connection session state machine and dispatch loop.
//!
//! A session reads framed requests from one peer in receipt order, routes
//! each through the static router table, and writes whatever the handlers
//! answer. Replies and frames pushed by other tasks share one outbound
//! channel, so they leave the socket in the order they were queued.

use std::sync::Arc;

use crate::cache::ConnId;
use crate::cluster::ClusterState;
use crate::node::router::{self, Handler};
use crate::node::NodeStatus;
use crate::protocol::{
    read_frame, ErrorResp, Frame, FrameError, Request, Role, RrCode,
    WaitResp,
};
use crate::utils::{safe_tcp_write, FedError, ServerSet, SlotId, Timer};

use bytes::BytesMut;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Login exchange in progress; owned by the acceptor or subscriber.
    Admitting,
    /// Dispatch loop running.
    Active,
    /// Loop exited; waiting for offloaded handlers to finish.
    Draining,
    Closed,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer asked for an orderly close.
    Requested,
    /// The upstream manager displaced us toward alternates.
    Redirected,
    /// The peer broke the protocol.
    Violation,
    /// Idle timeout or too many unanswered pings.
    NotResponding,
    /// The transport failed or was closed.
    PeerGone,
    /// This node is shutting down.
    Terminated,
}

/// What a handler wants done after handling a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    NoReply,
    Reply(Frame),
    /// Ask the requester to retry after this many seconds.
    Wait(u32),
    /// The request failed; tell the requester if it wants an answer.
    Fail(ErrorResp),
    Close(CloseReason),
}

impl Outcome {
    /// A bare acknowledgment, sent only if the requester wants one.
    pub fn ack(stream_id: u16) -> Outcome {
        if stream_id == 0 {
            Outcome::NoReply
        } else {
            Outcome::Reply(Frame::bare(RrCode::Data, 0, stream_id))
        }
    }
}

/// Where the peer of a session sits relative to this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// A subordinate server or supervisor.
    Subordinate,
    /// A manager this node subscribed to.
    Upstream,
    /// A redirector or peer asking for file locations.
    Client,
}

/// Who is on the other end of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerKind {
    Subordinate { slot: SlotId },
    /// `reference` tags alternates learned over this link; `level` is the
    /// manager's distance from the root.
    Upstream { reference: u32, level: u8 },
    Client,
}

/// Identity and placement of a session's peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub role: Role,
    pub identity: String,
    pub kind: PeerKind,
}

impl PeerInfo {
    pub fn origin(&self) -> Origin {
        match self.kind {
            PeerKind::Subordinate { .. } => Origin::Subordinate,
            PeerKind::Upstream { .. } => Origin::Upstream,
            PeerKind::Client => Origin::Client,
        }
    }
}

/// Registered outbound channel of a connection about to become a session.
#[derive(Debug)]
pub struct SessionChannel {
    pub conn: ConnId,
    pub tx_send: mpsc::UnboundedSender<Frame>,
    rx_send: mpsc::UnboundedReceiver<Frame>,
}

impl SessionChannel {
    /// Creates the channel and registers it with the node.
    pub fn open(state: &ClusterState) -> Self {
        let (tx_send, rx_send) = mpsc::unbounded_channel();
        let conn = state.register_conn(tx_send.clone());
        SessionChannel {
            conn,
            tx_send,
            rx_send,
        }
    }
}

/// Cloneable, thread-safe view of a session handed to handlers.
#[derive(Clone)]
pub struct SessionLink {
    pub state: Arc<ClusterState>,
    pub conn: ConnId,
    pub peer: PeerInfo,
    tx_send: mpsc::UnboundedSender<Frame>,
}

impl SessionLink {
    /// Queues `frame` to the peer.
    pub fn send(&self, frame: Frame) -> Result<(), FedError> {
        self.tx_send.send(frame)?;
        Ok(())
    }

    /// Slot of a subordinate peer.
    pub fn slot(&self) -> Result<SlotId, FedError> {
        match self.peer.kind {
            PeerKind::Subordinate { slot } => Ok(slot),
            _ => Err(FedError::msg(format!(
                "peer {} holds no server slot",
                self.peer.identity
            ))),
        }
    }

    /// Single-slot mask of a subordinate peer.
    pub fn mask(&self) -> Result<ServerSet, FedError> {
        ServerSet::single(self.slot()?)
    }
}

/// A finished offloaded handler invocation.
#[derive(Debug)]
pub struct Settled {
    frame: Frame,
    result: Result<Outcome, FedError>,
}

/// Mutable per-session context handed to inline handlers.
pub struct SessionCtx {
    pub link: SessionLink,
    /// Last known status of the peer as reported to us.
    pub status: NodeStatus,
    offloaded: JoinSet<Settled>,
}

impl SessionCtx {
    /// Runs `job` on the blocking pool. Its outcome is settled against
    /// `frame` when it finishes, even if the session is draining by then.
    pub fn offload<F>(&mut self, frame: Frame, job: F)
    where
        F: FnOnce(&SessionLink) -> Result<Outcome, FedError> + Send + 'static,
    {
        let link = self.link.clone();
        self.offloaded.spawn_blocking(move || {
            let result = job(&link);
            Settled { frame, result }
        });
    }

    /// Number of offloaded handlers still running.
    pub fn in_flight(&self) -> usize {
        self.offloaded.len()
    }

    /// Applies a handler outcome for request `frame`. Returns a close
    /// reason if the session must end.
    pub fn settle(
        &mut self,
        frame: &Frame,
        result: Result<Outcome, FedError>,
    ) -> Option<CloseReason> {
        let route = router::route(frame.header.rr_code)?;
        let stream_id = frame.header.stream_id;
        let mut succeeded = true;

        let reply = match result {
            Ok(Outcome::NoReply) => None,
            Ok(Outcome::Reply(reply)) => Some(Ok(reply)),
            Ok(Outcome::Wait(secs)) if stream_id != 0 => Some(Frame::new(
                RrCode::Wait,
                0,
                stream_id,
                &WaitResp { secs },
            )),
            Ok(Outcome::Wait(_)) => None,
            Ok(Outcome::Fail(err)) => {
                succeeded = false;
                pf_debug!(
                    "{} from {} failed: {}",
                    route.name,
                    self.link.peer.identity,
                    err.text
                );
                (stream_id != 0)
                    .then(|| Frame::new(RrCode::Error, 0, stream_id, &err))
            }
            Ok(Outcome::Close(reason)) => return Some(reason),
            Err(e) => {
                succeeded = false;
                if route.replies && stream_id != 0 {
                    let err = ErrorResp {
                        errno: libc::EIO,
                        text: e.to_string(),
                    };
                    Some(Frame::new(RrCode::Error, 0, stream_id, &err))
                } else {
                    pf_warn!(
                        "{} from {} failed: {}",
                        route.name,
                        self.link.peer.identity,
                        e
                    );
                    None
                }
            }
        };

        match reply {
            Some(Ok(reply)) => {
                if let Err(e) = self.link.send(reply) {
                    pf_error!("error queueing reply: {}", e);
                }
            }
            Some(Err(e)) => pf_error!("error composing reply: {}", e),
            None => {}
        }

        if route.forward && succeeded {
            let n = self.link.state.relay_down(frame, ServerSet::ALL);
            pf_trace!("relayed {} to {} subordinates", route.name, n);
        }
        None
    }
}

/// Keep-alive policy of a session.
enum Heartbeat {
    /// Ping the peer every tick; give up after too many missed.
    Ping {
        interval: Interval,
        missed: u8,
        max_missed: u8,
    },
    /// Give up if nothing arrives before the timer fires.
    Idle(Timer),
    Off,
}

impl Heartbeat {
    fn for_peer(kind: &PeerKind, state: &ClusterState) -> Self {
        let period = state.config.ping_interval();
        match kind {
            PeerKind::Subordinate { .. } => {
                let mut interval =
                    time::interval_at(Instant::now() + period, period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                Heartbeat::Ping {
                    interval,
                    missed: 0,
                    max_missed: state.config.max_missed_pings,
                }
            }
            PeerKind::Upstream { .. } => Heartbeat::Idle(Timer::new(
                period * (state.config.max_missed_pings as u32 + 1),
            )),
            PeerKind::Client => Heartbeat::Off,
        }
    }

    async fn tick(&mut self) {
        match self {
            Heartbeat::Ping { interval, .. } => {
                interval.tick().await;
            }
            Heartbeat::Idle(timer) => timer.timeout().await,
            Heartbeat::Off => std::future::pending::<()>().await,
        }
    }

    fn heard(&mut self) {
        match self {
            Heartbeat::Ping { missed, .. } => *missed = 0,
            Heartbeat::Idle(timer) => timer.rearm(),
            Heartbeat::Off => {}
        }
    }
}

/// One live connection with a peer node.
pub struct NodeSession {
    ctx: SessionCtx,
    state: SessionState,

    conn_read: OwnedReadHalf,
    conn_write: OwnedWriteHalf,
    read_buf: BytesMut,
    write_buf: BytesMut,
    write_buf_cursor: usize,

    rx_send: mpsc::UnboundedReceiver<Frame>,
    heartbeat: Heartbeat,
    rx_term: watch::Receiver<bool>,
}

impl NodeSession {
    /// Binds an admitted connection. `read_buf` carries any bytes read past
    /// the login exchange.
    pub fn new(
        state: Arc<ClusterState>,
        conn: TcpStream,
        read_buf: BytesMut,
        chan: SessionChannel,
        peer: PeerInfo,
        status: NodeStatus,
        rx_term: watch::Receiver<bool>,
    ) -> Self {
        let (conn_read, conn_write) = conn.into_split();
        let heartbeat = Heartbeat::for_peer(&peer.kind, &state);
        NodeSession {
            ctx: SessionCtx {
                link: SessionLink {
                    state,
                    conn: chan.conn,
                    peer,
                    tx_send: chan.tx_send,
                },
                status,
                offloaded: JoinSet::new(),
            },
            state: SessionState::Admitting,
            conn_read,
            conn_write,
            read_buf,
            write_buf: BytesMut::with_capacity(8 + 4096),
            write_buf_cursor: 0,
            rx_send: chan.rx_send,
            heartbeat,
            rx_term,
        }
    }

    fn enter(&mut self, next: SessionState) {
        pf_trace!(
            "session with {}: {:?} -> {:?}",
            self.ctx.link.peer.identity,
            self.state,
            next
        );
        self.state = next;
    }

    /// Runs the dispatch loop until the connection ends, then drains.
    pub async fn run(mut self) -> CloseReason {
        self.enter(SessionState::Active);
        let max_payload = self.ctx.link.state.config.max_payload;
        pf_debug!(
            "session with {} ({}) active",
            self.ctx.link.peer.identity,
            self.ctx.link.peer.role
        );

        let reason = loop {
            tokio::select! {
                // inbound request from the peer
                frame = read_frame(&mut self.read_buf, &mut self.conn_read, max_payload) => {
                    match frame {
                        Ok(frame) => {
                            self.heartbeat.heard();
                            if let Some(reason) = self.dispatch(frame) {
                                break reason;
                            }
                        }
                        Err(FrameError::Malformed(e)) => {
                            pf_warn!(
                                "closing {}: {}",
                                self.ctx.link.peer.identity,
                                e
                            );
                            break CloseReason::Violation;
                        }
                        Err(FrameError::Transport(e)) => {
                            pf_debug!(
                                "read from {} ended: {}",
                                self.ctx.link.peer.identity,
                                e
                            );
                            break CloseReason::PeerGone;
                        }
                    }
                },

                // outbound frame queued by a handler or another task
                Some(frame) = self.rx_send.recv() => {
                    if let Err(e) = self.write_frame(&frame).await {
                        pf_debug!(
                            "write to {} failed: {}",
                            self.ctx.link.peer.identity,
                            e
                        );
                        break CloseReason::PeerGone;
                    }
                },

                // offloaded handler finished
                Some(settled) = self.ctx.offloaded.join_next(), if self.ctx.in_flight() > 0 => {
                    match settled {
                        Ok(Settled { frame, result }) => {
                            if let Some(reason) = self.ctx.settle(&frame, result) {
                                break reason;
                            }
                        }
                        Err(e) => pf_error!("offloaded handler panicked: {}", e),
                    }
                },

                // keep-alive
                _ = self.heartbeat.tick() => {
                    if let Some(reason) = self.on_heartbeat() {
                        break reason;
                    }
                },

                // node termination
                _ = self.rx_term.changed() => {
                    break CloseReason::Terminated;
                },
            }
        };

        // wait for offloaded handlers so none outlives the session
        self.enter(SessionState::Draining);
        while let Some(settled) = self.ctx.offloaded.join_next().await {
            if let Ok(Settled { frame, result }) = settled {
                self.ctx.settle(&frame, result);
            }
        }
        if reason != CloseReason::PeerGone {
            while let Ok(frame) = self.rx_send.try_recv() {
                if self.write_frame(&frame).await.is_err() {
                    break;
                }
            }
        }

        self.ctx.link.state.unregister_conn(self.ctx.link.conn);
        self.enter(SessionState::Closed);
        pf_debug!(
            "session with {} closed: {:?}",
            self.ctx.link.peer.identity,
            reason
        );
        reason
    }

    // Routes one inbound frame. Returns a close reason if the session
    // must end.
    fn dispatch(&mut self, frame: Frame) -> Option<CloseReason> {
        let peer = &self.ctx.link.peer;
        let Some(route) = router::route(frame.header.rr_code) else {
            pf_warn!(
                "unknown rr_code {:#x} from {}",
                frame.header.rr_code,
                peer.identity
            );
            return Some(CloseReason::Violation);
        };
        if !route.from.contains(&peer.origin()) {
            pf_warn!(
                "{} not accepted from {} ({})",
                route.name,
                peer.identity,
                peer.role
            );
            return Some(CloseReason::Violation);
        }
        let req = match Request::parse(&frame) {
            Ok(req) => req,
            Err(e) => {
                pf_warn!(
                    "malformed {} from {}: {}",
                    route.name,
                    peer.identity,
                    e
                );
                return Some(CloseReason::Violation);
            }
        };
        pf_trace!(
            "recv {} sid {} hops {} from {}",
            route.name,
            frame.header.stream_id,
            frame.header.hops,
            peer.identity
        );

        let state = &self.ctx.link.state;
        if route.delayable && state.cms.is_suspended() {
            let secs = state.config.suspend_wait_secs;
            return self.ctx.settle(&frame, Ok(Outcome::Wait(secs)));
        }

        match route.handler {
            Handler::Inline(handle) => {
                let result = handle(&mut self.ctx, &frame, req);
                self.ctx.settle(&frame, result)
            }
            Handler::Blocking(handle) => {
                let job_frame = frame.clone();
                self.ctx
                    .offload(frame, move |link| handle(link, &job_frame, req));
                None
            }
        }
    }

    fn on_heartbeat(&mut self) -> Option<CloseReason> {
        match &mut self.heartbeat {
            Heartbeat::Ping {
                missed, max_missed, ..
            } => {
                if *missed >= *max_missed {
                    pf_warn!(
                        "{} missed {} pings",
                        self.ctx.link.peer.identity,
                        missed
                    );
                    return Some(CloseReason::NotResponding);
                }
                *missed += 1;
                if self.ctx.link.send(Frame::bare(RrCode::Ping, 0, 0)).is_err()
                {
                    return Some(CloseReason::Terminated);
                }
                None
            }
            Heartbeat::Idle(_) => {
                pf_warn!("{} idle for too long", self.ctx.link.peer.identity);
                Some(CloseReason::NotResponding)
            }
            Heartbeat::Off => None,
        }
    }

    // Stages and writes out one frame, waiting out WouldBlock.
    async fn write_frame(&mut self, frame: &Frame) -> Result<(), FedError> {
        frame.encode_to(&mut self.write_buf);
        while !safe_tcp_write(
            &mut self.write_buf,
            &mut self.write_buf_cursor,
            &self.conn_write,
        )? {
            self.conn_write.as_ref().writable().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::NodeConfig;
    use crate::protocol::HEADER_LEN;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    // Runs a client session fed with `wire`, then EOF, and reports how it
    // ended.
    async fn session_fed(wire: &[u8]) -> Result<CloseReason, FedError> {
        let state = Arc::new(ClusterState::new(NodeConfig::default())?);
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let mut far = TcpStream::connect(listener.local_addr()?).await?;
        let (near, _) = listener.accept().await?;

        let peer = PeerInfo {
            role: Role::Redirector,
            identity: "rdr".into(),
            kind: PeerKind::Client,
        };
        let chan = SessionChannel::open(&state);
        let (_tx_term, rx_term) = watch::channel(false);
        let session = NodeSession::new(
            state,
            near,
            BytesMut::new(),
            chan,
            peer,
            NodeStatus::default(),
            rx_term,
        );
        far.write_all(wire).await?;
        far.shutdown().await?;
        Ok(session.run().await)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn malformed_header_is_violation() -> Result<(), FedError> {
        let mut wire = [0u8; HEADER_LEN];
        wire[2] = RrCode::Ping as u8;
        wire[5] = 1; // reserved byte
        assert_eq!(session_fed(&wire).await?, CloseReason::Violation);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn oversized_payload_is_violation() -> Result<(), FedError> {
        let mut wire = [0u8; HEADER_LEN];
        wire[2] = RrCode::Ping as u8;
        wire[6..8].copy_from_slice(&u16::MAX.to_be_bytes());
        assert_eq!(session_fed(&wire).await?, CloseReason::Violation);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn eof_is_peer_gone() -> Result<(), FedError> {
        assert_eq!(session_fed(&[]).await?, CloseReason::PeerGone);
        Ok(())
    }
}
