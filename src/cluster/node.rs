//! A running cluster node: acceptor, upward subscriptions, and the
//! maintenance task, all sharing one `ClusterState`.

use std::sync::Arc;

use crate::cluster::{AdminListener, ClusterState, NodeConfig};
use crate::manager::ManagerSubscription;
use crate::node::Acceptor;
use crate::utils::{FedError, ME};

use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{self, MissedTickBehavior};

/// Top-level handle of one node process.
pub struct ClusterNode {
    state: Arc<ClusterState>,
    acceptor: Option<Acceptor>,
}

impl ClusterNode {
    /// Builds a node with default collaborators from `config` and binds
    /// its login listener.
    pub async fn new_and_setup(config: NodeConfig) -> Result<Self, FedError> {
        Self::with_state(ClusterState::new(config)?).await
    }

    /// Like `new_and_setup()` but with caller-assembled state.
    pub async fn with_state(state: ClusterState) -> Result<Self, FedError> {
        // first node in the process names the log prefix
        let _ = ME.set(state.identity.clone());
        let state = Arc::new(state);

        let acceptor = if state.config.listen_port == 0 {
            None
        } else {
            Some(Acceptor::new_and_setup(state.clone()).await?)
        };
        pf_info!(
            "{} node set up, {} manager(s) configured",
            state.role,
            state.config.managers.len()
        );
        Ok(ClusterNode { state, acceptor })
    }

    pub fn state(&self) -> &Arc<ClusterState> {
        &self.state
    }

    /// Runs every task of the node until `rx_term` fires.
    pub async fn run(
        &mut self,
        rx_term: watch::Receiver<bool>,
    ) -> Result<(), FedError> {
        let mut tasks = JoinSet::new();
        if let Some(acceptor) = self.acceptor.take() {
            tasks.spawn(acceptor.run(rx_term.clone()));
        }
        let mut phases = vec![];
        for primary in self.state.config.manager_endpoints()? {
            let endpoint = format!("{}:{}", primary.0, primary.1);
            let subscription = ManagerSubscription::new(
                self.state.clone(),
                primary,
                rx_term.clone(),
            );
            phases.push((endpoint, subscription.watch_phase()));
            tasks.spawn(subscription.run());
        }
        if !self.state.config.admin_path.is_empty() {
            let admin =
                AdminListener::new_and_setup(self.state.clone(), phases)?;
            tasks.spawn(admin.run(rx_term.clone()));
        }
        tasks.spawn(Self::maintainer(self.state.clone(), rx_term));

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                pf_error!("node task failed: {}", e);
            }
        }
        pf_info!("node terminated");
        Ok(())
    }

    // Periodically scrubs the cache and reclaims offline slots.
    async fn maintainer(
        state: Arc<ClusterState>,
        mut rx_term: watch::Receiver<bool>,
    ) {
        let mut interval = time::interval(state.config.scrub_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    state.maintain(std::time::Instant::now());
                },
                _ = rx_term.changed() => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{
        modifier, read_frame, ErrorResp, Frame, LocateResp, LoginArgs,
        LoginOk, PathArgs, Role, RrCode, TryArgs, WaitResp,
    };
    use crate::utils::ServerSet;
    use bytes::BytesMut;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};

    fn manager_config(port: u16) -> NodeConfig {
        NodeConfig {
            listen_port: port,
            query_delay_ms: 200,
            ..Default::default()
        }
    }

    fn login_args(role: Role, identity: &str, exports: &[&str]) -> LoginArgs {
        LoginArgs {
            role,
            identity: identity.into(),
            site: "test".into(),
            port: 1094,
            mode: 0,
            exports: exports
                .iter()
                .map(|e| e.parse())
                .collect::<Result<_, _>>()
                .unwrap_or_default(),
            load: 0,
            free_mb: 1000,
            credentials: vec![],
        }
    }

    /// A hand-driven peer speaking raw frames.
    struct RawPeer {
        stream: TcpStream,
        read_buf: BytesMut,
    }

    impl RawPeer {
        async fn login(
            port: u16,
            args: &LoginArgs,
        ) -> Result<(Self, LoginOk), FedError> {
            let stream = TcpStream::connect(("127.0.0.1", port)).await?;
            let mut peer = RawPeer {
                stream,
                read_buf: BytesMut::new(),
            };
            peer.send(Frame::new(RrCode::Login, 0, 1, args)?).await?;
            let reply = peer.recv().await?;
            assert_eq!(reply.code(), Some(RrCode::LoginOk));
            let ok = reply.args()?;
            Ok((peer, ok))
        }

        async fn send(&mut self, frame: Frame) -> Result<(), FedError> {
            let mut buf = BytesMut::new();
            frame.encode_to(&mut buf);
            self.stream.write_all(&buf).await?;
            Ok(())
        }

        async fn recv(&mut self) -> Result<Frame, FedError> {
            Ok(time::timeout(
                Duration::from_secs(5),
                read_frame(&mut self.read_buf, &mut self.stream, 4096),
            )
            .await??)
        }

        // skips keep-alive and space traffic
        async fn recv_code(&mut self, code: RrCode) -> Result<Frame, FedError> {
            loop {
                let frame = self.recv().await?;
                if frame.code() == Some(code) {
                    return Ok(frame);
                }
            }
        }
    }

    fn path_frame(code: RrCode, modifier: u8, sid: u16, path: &str) -> Frame {
        Frame::new(code, modifier, sid, &PathArgs { path: path.into() })
            .unwrap()
    }

    async fn start(
        config: NodeConfig,
    ) -> Result<(Arc<ClusterState>, watch::Sender<bool>), FedError> {
        let mut node = ClusterNode::new_and_setup(config).await?;
        let state = node.state().clone();
        let (tx_term, rx_term) = watch::channel(false);
        tokio::spawn(async move { node.run(rx_term).await });
        Ok((state, tx_term))
    }

    async fn eventually<F>(mut check: F) -> bool
    where
        F: FnMut() -> bool,
    {
        for _ in 0..100 {
            if check() {
                return true;
            }
            time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn have_then_disconnect() -> Result<(), FedError> {
        let (state, tx_term) = start(manager_config(53101)).await?;
        let (mut server, ok) = RawPeer::login(
            53101,
            &login_args(Role::Server, "srv-a", &["/data:rw"]),
        )
        .await?;
        assert_eq!(ok.slot, Some(0));
        assert_eq!(ok.role, Role::Manager);
        assert!(!state.cms.is_suspended());

        server.send(path_frame(RrCode::Have, 0, 0, "/data/a")).await?;
        assert!(
            eventually(|| state
                .cache
                .peek("/data/a")
                .is_some_and(|s| s.have == ServerSet::single(0).unwrap()))
            .await
        );

        drop(server);
        assert!(
            eventually(|| state.cache.peek("/data/a").is_some_and(|s| s
                .have
                .is_empty()
                && s.suspect.contains(0)))
            .await
        );
        assert!(eventually(|| state.cms.is_suspended()).await);
        tx_term.send(true)?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn locate_waits_then_answers() -> Result<(), FedError> {
        let (_state, tx_term) = start(manager_config(53111)).await?;
        let (mut server, _) = RawPeer::login(
            53111,
            &login_args(Role::Server, "srv-b", &["/data"]),
        )
        .await?;
        let (mut client, ok) = RawPeer::login(
            53111,
            &login_args(Role::Redirector, "rdr", &[]),
        )
        .await?;
        assert_eq!(ok.slot, None);

        // unknown file: client is told to wait, server is queried
        client.send(path_frame(RrCode::Locate, 0, 7, "/data/b")).await?;
        let wait = client.recv_code(RrCode::Wait).await?;
        assert_eq!(wait.header.stream_id, 7);
        assert_eq!(wait.args::<WaitResp>()?.secs, 5);
        let query = server.recv_code(RrCode::State).await?;
        assert_eq!(query.args::<PathArgs>()?.path, "/data/b");
        assert_eq!(query.header.hops, 1);

        // asap locate of another file is answered once the server reports
        client
            .send(path_frame(RrCode::Locate, modifier::ASAP, 9, "/data/c"))
            .await?;
        let query = server.recv_code(RrCode::State).await?;
        assert_eq!(query.args::<PathArgs>()?.path, "/data/c");
        server.send(path_frame(RrCode::Have, 0, 0, "/data/c")).await?;
        let data = client.recv_code(RrCode::Data).await?;
        assert_eq!(data.header.stream_id, 9);
        let resp: LocateResp = data.args()?;
        assert_eq!(resp.servers.len(), 1);
        assert_eq!(resp.servers[0].host, "127.0.0.1");
        assert_eq!(resp.servers[0].port, 1094);
        assert!(!resp.servers[0].pending);

        // a file outside every export is not found at all
        client.send(path_frame(RrCode::Locate, 0, 11, "/other")).await?;
        let err = client.recv_code(RrCode::Error).await?;
        assert_eq!(err.header.stream_id, 11);
        tx_term.send(true)?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn locate_asks_bounced_holder_again() -> Result<(), FedError> {
        let (state, tx_term) = start(manager_config(53141)).await?;
        let args = login_args(Role::Server, "srv-r", &["/data"]);
        let (mut server, _) = RawPeer::login(53141, &args).await?;
        server.send(path_frame(RrCode::Have, 0, 0, "/data/a")).await?;
        assert!(eventually(|| state.cache.peek("/data/a").is_some()).await);
        drop(server);
        assert!(
            eventually(|| state
                .cache
                .peek("/data/a")
                .is_some_and(|s| s.suspect.contains(0)))
            .await
        );

        // the holder comes back under the same slot
        let (mut server, ok) = RawPeer::login(53141, &args).await?;
        assert_eq!(ok.slot, Some(0));
        let (mut client, _) = RawPeer::login(
            53141,
            &login_args(Role::Redirector, "rdr", &[]),
        )
        .await?;

        // not found is not concluded before it is asked
        client.send(path_frame(RrCode::Locate, 0, 5, "/data/a")).await?;
        let reply = loop {
            let frame = client.recv().await?;
            if matches!(frame.code(), Some(RrCode::Wait | RrCode::Error)) {
                break frame;
            }
        };
        assert_eq!(reply.code(), Some(RrCode::Wait));
        assert_eq!(reply.header.stream_id, 5);
        let query = server.recv_code(RrCode::State).await?;
        assert_eq!(query.args::<PathArgs>()?.path, "/data/a");

        server.send(path_frame(RrCode::Have, 0, 0, "/data/a")).await?;
        assert!(
            eventually(|| state
                .cache
                .peek("/data/a")
                .is_some_and(|s| s.have.contains(0)))
            .await
        );
        tx_term.send(true)?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn role_mismatch_refused() -> Result<(), FedError> {
        let (state, tx_term) = start(manager_config(53131)).await?;
        let stream = TcpStream::connect(("127.0.0.1", 53131)).await?;
        let mut peer = RawPeer {
            stream,
            read_buf: BytesMut::new(),
        };
        let args = login_args(Role::Manager, "other-mgr", &[]);
        peer.send(Frame::new(RrCode::Login, 0, 1, &args)?).await?;
        let reply = peer.recv().await?;
        assert_eq!(reply.code(), Some(RrCode::Error));
        assert_eq!(reply.args::<ErrorResp>()?.errno, libc::EACCES);
        assert!(state.servers.is_empty());
        tx_term.send(true)?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn login_without_statfs() -> Result<(), FedError> {
        let listener = TcpListener::bind("127.0.0.1:53151").await?;
        let config = NodeConfig {
            role: "server".into(),
            listen_port: 0,
            managers: vec!["127.0.0.1:53151".into()],
            data_root: "/nonexistent/fedloc-root".into(),
            ..Default::default()
        };
        let (_state, tx_term) = start(config).await?;

        let (stream, _) = listener.accept().await?;
        let mut mgr = RawPeer {
            stream,
            read_buf: BytesMut::new(),
        };
        let login = mgr.recv_code(RrCode::Login).await?;
        assert_eq!(login.args::<LoginArgs>()?.free_mb, 0);
        tx_term.send(true)?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn try_redirects_to_alternate() -> Result<(), FedError> {
        let listener_a = TcpListener::bind("127.0.0.1:53121").await?;
        let listener_b = TcpListener::bind("127.0.0.1:53122").await?;
        let config = NodeConfig {
            role: "server".into(),
            listen_port: 0,
            managers: vec!["127.0.0.1:53121".into()],
            backoff_redirect_ms: 50,
            backoff_failure_ms: 50,
            ..Default::default()
        };
        let (state, tx_term) = start(config).await?;

        // manager A accepts the login, then displaces the node toward B
        let (stream, _) = listener_a.accept().await?;
        let mut mgr_a = RawPeer {
            stream,
            read_buf: BytesMut::new(),
        };
        let login = mgr_a.recv_code(RrCode::Login).await?;
        let args: LoginArgs = login.args()?;
        assert_eq!(args.role, Role::Server);
        let ok = LoginOk {
            slot: Some(0),
            identity: "m:a".into(),
            role: Role::Manager,
        };
        mgr_a
            .send(Frame::new(RrCode::LoginOk, 0, login.header.stream_id, &ok)?)
            .await?;
        mgr_a.recv_code(RrCode::Avail).await?;
        let hint = TryArgs {
            alternates: vec![("127.0.0.1".into(), 53122)],
        };
        mgr_a.send(Frame::new(RrCode::Try, 0, 0, &hint)?).await?;

        // the node next logs in at B, which it learned one level down
        let (stream, _) = listener_b.accept().await?;
        let mut mgr_b = RawPeer {
            stream,
            read_buf: BytesMut::new(),
        };
        let login = mgr_b.recv_code(RrCode::Login).await?;
        assert_eq!(login.args::<LoginArgs>()?.identity, state.identity);
        let alternates = state.managers.alternates().entries();
        assert_eq!(alternates.len(), 1);
        assert_eq!(alternates[0].port, 53122);
        assert_eq!(alternates[0].level, 1);
        tx_term.send(true)?;
        Ok(())
    }
}
