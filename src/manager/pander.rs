//! Upward subscription: the loop keeping this node attached to a manager.
//!
//! Each configured manager endpoint gets one `ManagerSubscription` task. It
//! walks learned alternates before falling back to its primary, logs in,
//! and then serves the attached connection as an ordinary session until
//! the manager drops or displaces us.

use std::sync::Arc;
use std::time::Duration;

use crate::cluster::ClusterState;
use crate::node::{
    CloseReason, NodeSession, NodeStatus, PeerInfo, PeerKind, SessionChannel,
};
use crate::protocol::{
    modifier, read_frame, AvailArgs, ErrorResp, Frame, LoginArgs, LoginOk,
    LoginRedirect, RrCode,
};
use crate::utils::{tcp_connect_with_timeout, FedError};

use bytes::BytesMut;

use rand::Rng;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time;

/// Observable phase of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PanderState {
    Idle,
    Connecting,
    LoggingIn,
    Attached,
    Redirecting,
    Backoff,
    Done,
}

/// Manager endpoint being tried.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Candidate {
    host: String,
    port: u16,
    level: u8,
    primary: bool,
}

/// Phase plus whatever the next phase needs to carry on.
enum Step {
    Idle,
    Connecting(Candidate),
    LoggingIn(Candidate, TcpStream),
    Attached(Candidate, TcpStream, BytesMut, LoginOk),
    Redirecting,
    Backoff(Duration),
    Done,
}

impl Step {
    fn phase(&self) -> PanderState {
        match self {
            Step::Idle => PanderState::Idle,
            Step::Connecting(..) => PanderState::Connecting,
            Step::LoggingIn(..) => PanderState::LoggingIn,
            Step::Attached(..) => PanderState::Attached,
            Step::Redirecting => PanderState::Redirecting,
            Step::Backoff(_) => PanderState::Backoff,
            Step::Done => PanderState::Done,
        }
    }
}

/// One upward connection loop toward a configured primary manager.
pub struct ManagerSubscription {
    state: Arc<ClusterState>,
    primary: (String, u16),
    /// Tags the alternates this subscription learns.
    reference: u32,

    /// Consecutive failures against the primary.
    fails: u32,
    /// Set once the primary failed too often; announced at login.
    trying: bool,

    tx_phase: watch::Sender<PanderState>,
    rx_term: watch::Receiver<bool>,
}

impl ManagerSubscription {
    pub fn new(
        state: Arc<ClusterState>,
        primary: (String, u16),
        rx_term: watch::Receiver<bool>,
    ) -> Self {
        let reference = state.managers.new_reference();
        let (tx_phase, _) = watch::channel(PanderState::Idle);
        ManagerSubscription {
            state,
            primary,
            reference,
            fails: 0,
            trying: false,
            tx_phase,
            rx_term,
        }
    }

    /// Watches the phase the subscription is in.
    pub fn watch_phase(&self) -> watch::Receiver<PanderState> {
        self.tx_phase.subscribe()
    }

    /// Runs the subscription until the node terminates.
    pub async fn run(mut self) {
        let mut step = Step::Idle;
        loop {
            let phase = step.phase();
            self.tx_phase.send_replace(phase);
            pf_trace!(
                "subscription to {}:{} now {:?}",
                self.primary.0,
                self.primary.1,
                phase
            );
            step = match step {
                Step::Idle => self.pick_candidate().await,
                Step::Connecting(cand) => self.connect(cand).await,
                Step::LoggingIn(cand, stream) => self.login(cand, stream).await,
                Step::Attached(cand, stream, read_buf, ok) => {
                    self.attached(cand, stream, read_buf, ok).await
                }
                Step::Redirecting => {
                    if self.state.managers.alternates().is_empty() {
                        Step::Backoff(self.backoff_redirect())
                    } else {
                        Step::Idle
                    }
                }
                Step::Backoff(base) => self.backoff(base).await,
                Step::Done => break,
            };
        }

        let dropped = self.state.managers.alternates().del(self.reference);
        pf_debug!(
            "subscription to {}:{} exited, dropped {} alternates",
            self.primary.0,
            self.primary.1,
            dropped
        );
    }

    fn terminated(&self) -> bool {
        *self.rx_term.borrow()
    }

    fn backoff_redirect(&self) -> Duration {
        Duration::from_millis(self.state.config.backoff_redirect_ms)
    }

    fn backoff_failure(&self) -> Duration {
        Duration::from_millis(self.state.config.backoff_failure_ms)
    }

    // Idle: wait out the suspend gate, then choose whom to connect to.
    async fn pick_candidate(&mut self) -> Step {
        if self.terminated() {
            return Step::Done;
        }
        if self.state.config.wait_for_resume {
            let mut rx_suspended = self.state.cms.subscribe();
            if *rx_suspended.borrow_and_update() {
                pf_warn!("suspended, holding off manager login");
            }
            while *rx_suspended.borrow_and_update() {
                tokio::select! {
                    changed = rx_suspended.changed() => {
                        if changed.is_err() {
                            return Step::Done;
                        }
                    },
                    _ = self.rx_term.changed() => return Step::Done,
                }
            }
        }

        let next = self.state.managers.alternates().next();
        let cand = match next {
            Some(entry) => Candidate {
                host: entry.host,
                port: entry.port,
                level: entry.level,
                primary: false,
            },
            None => Candidate {
                host: self.primary.0.clone(),
                port: self.primary.1,
                level: 0,
                primary: true,
            },
        };
        if self.state.config.is_self(&cand.host, cand.port) {
            pf_warn!(
                "skipping manager {}:{} which is this node",
                cand.host,
                cand.port
            );
            return if cand.primary {
                Step::Backoff(self.backoff_failure())
            } else {
                Step::Idle
            };
        }
        Step::Connecting(cand)
    }

    async fn connect(&mut self, cand: Candidate) -> Step {
        match tcp_connect_with_timeout(
            &cand.host,
            cand.port,
            self.state.config.login_timeout(),
        )
        .await
        {
            Ok(stream) => Step::LoggingIn(cand, stream),
            Err(e) => {
                pf_debug!(
                    "connecting to {}:{} failed: {}",
                    cand.host,
                    cand.port,
                    e
                );
                self.failed(&cand)
            }
        }
    }

    async fn login(&mut self, cand: Candidate, mut stream: TcpStream) -> Step {
        match self.exchange_login(&cand, &mut stream).await {
            Ok(Login::Accepted(read_buf, ok)) => {
                self.fails = 0;
                self.trying = false;
                Step::Attached(cand, stream, read_buf, ok)
            }
            Ok(Login::Redirected(alternates)) => {
                let level = cand.level.saturating_add(1);
                let added = {
                    let mut list = self.state.managers.alternates();
                    alternates
                        .iter()
                        .filter(|(host, port)| {
                            list.add(self.reference, host, *port, level)
                        })
                        .count()
                };
                pf_info!(
                    "login at {}:{} redirected, {} new alternates",
                    cand.host,
                    cand.port,
                    added
                );
                Step::Redirecting
            }
            Err(e) => {
                pf_warn!(
                    "login at {}:{} failed: {}",
                    cand.host,
                    cand.port,
                    e
                );
                self.failed(&cand)
            }
        }
    }

    // Sends our login request and reads the manager's verdict.
    async fn exchange_login(
        &self,
        cand: &Candidate,
        stream: &mut TcpStream,
    ) -> Result<Login, FedError> {
        let state = &self.state;
        let free_mb = match state.space().await {
            Ok((free_mb, _)) => free_mb,
            Err(e) => {
                pf_warn!("logging in without free space figure: {}", e);
                0
            }
        };
        let mut mode = state.cms.login_mode();
        if self.trying {
            mode |= modifier::LOGIN_TRYING;
        }
        let args = LoginArgs {
            role: state.role,
            identity: state.identity.clone(),
            site: state.config.site.clone(),
            port: state.config.data_port,
            mode,
            exports: state.exports.clone(),
            load: 0,
            free_mb,
            credentials: Vec::new(),
        };
        let mut write_buf = BytesMut::new();
        Frame::new(RrCode::Login, 0, 1, &args)?.encode_to(&mut write_buf);
        stream.write_all(&write_buf).await?;

        let mut read_buf = BytesMut::new();
        let reply = time::timeout(
            state.config.login_timeout(),
            read_frame(&mut read_buf, stream, state.config.max_payload),
        )
        .await??;
        match reply.code() {
            Some(RrCode::LoginOk) => {
                let ok: LoginOk = reply.args()?;
                pf_info!(
                    "logged in at {} {}:{} level {}",
                    ok.role,
                    cand.host,
                    cand.port,
                    cand.level
                );
                Ok(Login::Accepted(read_buf, ok))
            }
            Some(RrCode::LoginRedirect) => {
                let redirect: LoginRedirect = reply.args()?;
                Ok(Login::Redirected(redirect.alternates))
            }
            Some(RrCode::Error) => {
                let err: ErrorResp = reply.args()?;
                Err(FedError::msg(format!(
                    "refused ({}): {}",
                    err.errno, err.text
                )))
            }
            _ => Err(FedError::msg(format!(
                "unexpected login reply code {:#x}",
                reply.header.rr_code
            ))),
        }
    }

    // Serves the attached connection until it ends.
    async fn attached(
        &mut self,
        cand: Candidate,
        stream: TcpStream,
        read_buf: BytesMut,
        ok: LoginOk,
    ) -> Step {
        let state = &self.state;
        let chan = SessionChannel::open(state);
        let attach =
            state
                .managers
                .slots()
                .attach(&cand.host, cand.port, chan.tx_send.clone());
        let slot = match attach {
            Ok(slot) => slot,
            Err(e) => {
                pf_warn!("cannot attach {}:{}: {}", cand.host, cand.port, e);
                state.unregister_conn(chan.conn);
                return Step::Backoff(self.backoff_failure());
            }
        };

        // SyncSpace: tell the new manager how much room we have
        match state.space().await {
            Ok((free_mb, util)) => {
                let sync = Frame::new(
                    RrCode::Avail,
                    0,
                    0,
                    &AvailArgs { free_mb, util },
                );
                if let Err(e) = sync.and_then(|f| Ok(chan.tx_send.send(f)?)) {
                    pf_error!("error syncing space: {}", e);
                }
            }
            Err(e) => pf_warn!("cannot compute space: {}", e),
        }

        let peer = PeerInfo {
            role: ok.role,
            identity: ok.identity,
            kind: PeerKind::Upstream {
                reference: self.reference,
                level: cand.level,
            },
        };
        let session = NodeSession::new(
            state.clone(),
            stream,
            read_buf,
            chan,
            peer,
            NodeStatus::default(),
            self.rx_term.clone(),
        );
        let reason = session.run().await;

        let detached = state.managers.slots().detach(slot);
        if let Err(e) = detached {
            pf_error!("error detaching manager: {}", e);
        }
        pf_info!(
            "detached from {}:{}: {:?}",
            cand.host,
            cand.port,
            reason
        );
        match reason {
            CloseReason::Redirected | CloseReason::Requested => {
                Step::Redirecting
            }
            CloseReason::Terminated => Step::Done,
            _ => Step::Backoff(self.backoff_failure()),
        }
    }

    // Counts a failed attempt and picks the backoff to apply.
    fn failed(&mut self, cand: &Candidate) -> Step {
        if !cand.primary {
            return Step::Backoff(self.backoff_redirect());
        }
        self.fails += 1;
        if self.fails >= self.state.config.max_primary_fails && !self.trying {
            self.trying = true;
            pf_warn!(
                "primary {}:{} failed {} times in a row",
                cand.host,
                cand.port,
                self.fails
            );
        }
        Step::Backoff(self.backoff_failure())
    }

    // Sleeps `base` plus up to half of it again, unless terminated.
    async fn backoff(&mut self, base: Duration) -> Step {
        let jitter_ms = base.as_millis() as u64 / 2;
        let extra = rand::thread_rng().gen_range(0..=jitter_ms);
        let dur = base + Duration::from_millis(extra);
        pf_debug!("backing off for {:?}", dur);
        tokio::select! {
            _ = time::sleep(dur) => Step::Idle,
            _ = self.rx_term.changed() => Step::Done,
        }
    }
}

/// Verdict of a login exchange.
enum Login {
    /// Accepted; carries bytes already read past the reply.
    Accepted(BytesMut, LoginOk),
    Redirected(Vec<(String, u16)>),
}
