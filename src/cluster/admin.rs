//! Local administrative socket.
//!
//! Operators talk to a running node through a Unix domain socket, one
//! command per line: `suspend`, `resume`, `nostage`, `stage`, `status`.
//! Every command gets exactly one reply line, `ok ...` or `err ...`.

use std::path::PathBuf;
use std::sync::Arc;

use crate::cluster::ClusterState;
use crate::manager::PanderState;
use crate::utils::FedError;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;

/// Phase watch of one upward subscription, keyed by its primary endpoint.
pub type PhaseWatch = (String, watch::Receiver<PanderState>);

/// Listener of the admin socket.
pub struct AdminListener {
    state: Arc<ClusterState>,
    path: PathBuf,
    listener: UnixListener,
    phases: Arc<Vec<PhaseWatch>>,
}

impl AdminListener {
    /// Binds the socket at `config.admin_path`, replacing a leftover one.
    pub fn new_and_setup(
        state: Arc<ClusterState>,
        phases: Vec<PhaseWatch>,
    ) -> Result<Self, FedError> {
        let path = PathBuf::from(&state.config.admin_path);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        let listener = UnixListener::bind(&path)?;
        pf_info!("admin socket at {}", path.display());
        Ok(AdminListener {
            state,
            path,
            listener,
            phases: Arc::new(phases),
        })
    }

    /// Serves admin connections until termination.
    pub async fn run(self, mut rx_term: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let state = self.state.clone();
                        let phases = self.phases.clone();
                        tokio::spawn(async move {
                            if let Err(e) =
                                serve_admin(state, phases, stream).await
                            {
                                pf_debug!("admin connection: {}", e);
                            }
                        });
                    }
                    Err(e) => pf_error!("error accepting admin: {}", e),
                },
                _ = rx_term.changed() => break,
            }
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            pf_debug!("removing admin socket: {}", e);
        }
    }
}

async fn serve_admin(
    state: Arc<ClusterState>,
    phases: Arc<Vec<PhaseWatch>>,
    stream: UnixStream,
) -> Result<(), FedError> {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    while let Some(line) = lines.next_line().await? {
        let reply = execute(&state, &phases, line.trim());
        write.write_all(format!("{}\n", reply).as_bytes()).await?;
    }
    Ok(())
}

/// Runs one admin command and returns its reply line.
pub fn execute(
    state: &ClusterState,
    phases: &[PhaseWatch],
    cmd: &str,
) -> String {
    let (suspend, nostage) = match cmd {
        "suspend" => (Some(true), None),
        "resume" => (Some(false), None),
        "nostage" => (None, Some(true)),
        "stage" => (None, Some(false)),
        "status" => return status_line(state, phases),
        _ => return format!("err unknown command '{}'", cmd),
    };
    pf_info!("admin requested {}", cmd);
    state.set_local(suspend, nostage);
    "ok".into()
}

fn status_line(state: &ClusterState, phases: &[PhaseWatch]) -> String {
    let managers: Vec<String> = state
        .managers
        .slots()
        .endpoints()
        .into_iter()
        .map(|(host, port)| format!("{}:{}", host, port))
        .collect();
    let subscriptions: Vec<String> = phases
        .iter()
        .map(|(primary, rx)| format!("{}={:?}", primary, *rx.borrow()))
        .collect();
    format!(
        "ok suspended={} nostage={} managers=[{}] subscriptions=[{}]",
        state.cms.is_suspended(),
        state.cms.is_nostage(),
        managers.join(","),
        subscriptions.join(",")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::NodeConfig;

    fn server_state(admin_path: String) -> Result<ClusterState, FedError> {
        ClusterState::new(NodeConfig {
            role: "server".into(),
            listen_port: 0,
            managers: vec!["127.0.0.1:3121".into()],
            admin_path,
            ..Default::default()
        })
    }

    #[test]
    fn local_suspend_and_stage() -> Result<(), FedError> {
        let state = server_state(String::new())?;
        let (_tx, rx) = watch::channel(PanderState::Backoff);
        let phases = vec![("127.0.0.1:3121".to_string(), rx)];

        assert!(!state.cms.is_suspended());
        assert_eq!(execute(&state, &phases, "suspend"), "ok");
        assert!(state.cms.is_suspended());
        assert_eq!(execute(&state, &phases, "nostage"), "ok");
        assert!(state.cms.is_nostage());
        assert_eq!(
            execute(&state, &phases, "status"),
            "ok suspended=true nostage=true managers=[] \
             subscriptions=[127.0.0.1:3121=Backoff]"
        );
        execute(&state, &phases, "resume");
        execute(&state, &phases, "stage");
        assert!(!state.cms.is_suspended());
        assert!(!state.cms.is_nostage());
        assert!(execute(&state, &phases, "reboot").starts_with("err"));
        Ok(())
    }

    #[tokio::test]
    async fn commands_over_socket() -> Result<(), FedError> {
        let path = std::env::temp_dir()
            .join(format!("fedloc-admin-{}.sock", std::process::id()));
        let state =
            Arc::new(server_state(path.to_string_lossy().into_owned())?);
        let admin = AdminListener::new_and_setup(state.clone(), vec![])?;
        let (tx_term, rx_term) = watch::channel(false);
        let handle = tokio::spawn(admin.run(rx_term));

        let stream = UnixStream::connect(&path).await?;
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();
        write.write_all(b"suspend\nbogus\n").await?;
        assert_eq!(lines.next_line().await?.as_deref(), Some("ok"));
        let err = lines.next_line().await?.unwrap_or_default();
        assert!(err.starts_with("err"));
        assert!(state.cms.is_suspended());

        tx_term.send(true)?;
        handle.await?;
        assert!(!path.exists());
        Ok(())
    }
}
