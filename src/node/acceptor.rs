//! Admission of inbound connections: login, role check, slot assignment.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::cluster::ClusterState;
use crate::node::session::{
    CloseReason, NodeSession, PeerInfo, PeerKind, SessionChannel,
};
use crate::node::NodeStatus;
use crate::protocol::{
    read_frame, ErrorResp, Frame, LoginArgs, LoginOk, LoginRedirect,
    Request, Role, RrCode,
};
use crate::utils::{tcp_bind_with_retry, FedError, ServerSet};

use bytes::BytesMut;

use libc::{EACCES, EINVAL};

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time;

/// Listener accepting logins from subordinates and clients.
pub struct Acceptor {
    state: Arc<ClusterState>,
    listener: TcpListener,
}

impl Acceptor {
    /// Binds the login listener.
    pub async fn new_and_setup(
        state: Arc<ClusterState>,
    ) -> Result<Self, FedError> {
        let listener =
            tcp_bind_with_retry(state.config.listen_addr(), 10).await?;
        pf_info!("accepting logins on {}", listener.local_addr()?);
        Ok(Acceptor { state, listener })
    }

    /// Accepts connections until termination, serving each on its own task.
    pub async fn run(self, mut rx_term: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            let state = self.state.clone();
                            let rx_term = rx_term.clone();
                            tokio::spawn(async move {
                                if let Err(e) =
                                    serve_conn(state, stream, addr, rx_term).await
                                {
                                    pf_warn!("connection from {}: {}", addr, e);
                                }
                            });
                        }
                        Err(e) => pf_error!("error accepting: {}", e),
                    }
                },

                _ = rx_term.changed() => break,
            }
        }
        pf_debug!("acceptor exited");
    }
}

// Writes one frame during the login exchange, before any session exists.
async fn send_direct(
    stream: &mut TcpStream,
    frame: &Frame,
) -> Result<(), FedError> {
    let mut buf = BytesMut::new();
    frame.encode_to(&mut buf);
    stream.write_all(&buf).await?;
    Ok(())
}

async fn refuse(
    stream: &mut TcpStream,
    stream_id: u16,
    errno: i32,
    text: String,
) -> Result<(), FedError> {
    let frame = Frame::new(
        RrCode::Error,
        0,
        stream_id,
        &ErrorResp {
            errno,
            text: text.clone(),
        },
    )?;
    send_direct(stream, &frame).await?;
    Err(FedError::msg(text))
}

/// Admits one inbound connection and serves it until it closes.
async fn serve_conn(
    state: Arc<ClusterState>,
    mut stream: TcpStream,
    addr: SocketAddr,
    rx_term: watch::Receiver<bool>,
) -> Result<CloseReason, FedError> {
    stream.set_nodelay(true)?;
    let mut read_buf = BytesMut::new();
    let frame = time::timeout(
        state.config.login_timeout(),
        read_frame(&mut read_buf, &mut stream, state.config.max_payload),
    )
    .await??;
    let sid = frame.header.stream_id;
    let login: LoginArgs = match Request::parse(&frame) {
        Ok(Request::Login(login)) => login,
        _ => {
            pf_warn!("{} did not start with a login", addr);
            return refuse(&mut stream, sid, EINVAL, "login expected".into())
                .await
                .map(|_| CloseReason::Violation);
        }
    };

    let admitted = match state.auth.authenticate(&login).await {
        Ok(admitted) => admitted,
        Err(e) => {
            pf_warn!(
                "login of {} from {} rejected: {}",
                login.identity,
                addr,
                e
            );
            return refuse(&mut stream, sid, EACCES, e.to_string())
                .await
                .map(|_| CloseReason::Violation);
        }
    };
    if !state.role.accepts(admitted.role) {
        pf_warn!(
            "{} logging in as {} not accepted by a {}",
            admitted.identity,
            admitted.role,
            state.role
        );
        let text = format!("{} does not accept {}", state.role, admitted.role);
        return refuse(&mut stream, sid, EACCES, text)
            .await
            .map(|_| CloseReason::Violation);
    }

    let chan = SessionChannel::open(&state);
    let conn = chan.conn;
    let kind = match admitted.role {
        Role::Server | Role::Supervisor => {
            let host = addr.ip().to_string();
            match state.servers.admit(&login, &host, conn, chan.tx_send.clone())
            {
                Ok(slot) => PeerKind::Subordinate { slot },
                Err(e) => {
                    pf_warn!("cannot admit {}: {}", admitted.identity, e);
                    state.unregister_conn(conn);
                    return redirect_or_refuse(&state, &mut stream, sid, e)
                        .await;
                }
            }
        }
        _ => PeerKind::Client,
    };

    let slot = match kind {
        PeerKind::Subordinate { slot } => Some(slot),
        _ => None,
    };
    if let Some(slot) = slot {
        state.paths().insert_all(&login.exports, ServerSet::single(slot)?);
        state.recount();
    }
    let ok = Frame::new(
        RrCode::LoginOk,
        0,
        sid,
        &LoginOk {
            slot,
            identity: state.identity.clone(),
            role: state.role,
        },
    )?;
    if let Err(e) = send_direct(&mut stream, &ok).await {
        // roll the admission back as if the session ran and dropped
        if let Some(slot) = slot {
            state.servers.disconnect(slot, conn);
            state.recount();
        }
        state.unregister_conn(conn);
        return Err(e);
    }
    pf_info!(
        "{} {} logged in from {}{}",
        admitted.role,
        admitted.identity,
        addr,
        slot.map(|s| format!(" at slot {}", s)).unwrap_or_default()
    );

    let peer = PeerInfo {
        role: admitted.role,
        identity: admitted.identity,
        kind,
    };
    let session = NodeSession::new(
        state.clone(),
        stream,
        read_buf,
        chan,
        peer,
        NodeStatus::from_login(&login),
        rx_term,
    );
    let reason = session.run().await;

    if let Some(slot) = slot {
        if state.servers.disconnect(slot, conn) {
            state.cache.bounce(ServerSet::single(slot)?, None);
            state.recount();
            pf_info!("server slot {} offline: {:?}", slot, reason);
        }
    }
    Ok(reason)
}

// Answers a login the slot table has no room for.
async fn redirect_or_refuse(
    state: &ClusterState,
    stream: &mut TcpStream,
    sid: u16,
    cause: FedError,
) -> Result<CloseReason, FedError> {
    let alternates = state.config.alternate_endpoints()?;
    if alternates.is_empty() {
        return refuse(stream, sid, EACCES, cause.to_string())
            .await
            .map(|_| CloseReason::Redirected);
    }
    let frame = Frame::new(
        RrCode::LoginRedirect,
        0,
        sid,
        &LoginRedirect { alternates },
    )?;
    send_direct(stream, &frame).await?;
    Ok(CloseReason::Redirected)
}
