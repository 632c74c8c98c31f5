//! Fedloc cluster node executable.

use std::process::ExitCode;

use clap::Parser;
use fedloc::{
    logger_init, pf_error, ClusterNode, ClusterState, FedError, NodeConfig,
};
use log::{self, LevelFilter};
use tokio::runtime::Builder;
use tokio::sync::watch;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Node configuration as a TOML string, e.g.
    /// "role = 'server'\nmanagers = ['mgr:3121']".
    #[arg(short, long, default_value_t = String::new())]
    config: String,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 4)]
    threads: usize,

    /// Identity announced at login instead of the derived one.
    #[arg(short, long)]
    identity: Option<String>,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(config)` on success
    /// or `Err(FedError)` on any error.
    fn sanitize(&self) -> Result<NodeConfig, FedError> {
        if self.threads < 2 {
            return Err(FedError::msg(format!(
                "invalid number of threads {}",
                self.threads
            )));
        }
        if let Some(identity) = &self.identity {
            if identity.is_empty() || identity.contains(char::is_whitespace) {
                return Err(FedError::msg(format!(
                    "invalid identity '{}'",
                    identity
                )));
            }
        }
        let config_str = if self.config.trim().is_empty() {
            None
        } else {
            Some(self.config.as_str())
        };
        NodeConfig::from_toml(config_str)
    }
}

/// Actual main function of a fedloc node.
fn node_main() -> Result<(), FedError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    let config = args.sanitize()?;
    let mut state = ClusterState::new(config)?;
    if let Some(identity) = args.identity {
        state.identity = identity;
    }

    // set up termination signals handler
    let (tx_term, rx_term) = watch::channel(false);
    ctrlc::set_handler(move || {
        if let Err(e) = tx_term.send(true) {
            pf_error!("error sending to term channel: {}", e);
        }
    })?;

    let log_level = log::max_level();
    {
        // create tokio multi-threaded runtime
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .worker_threads(args.threads)
            .thread_name("tokio-worker-node")
            .build()?;

        // enter tokio runtime, set up the node, and run until terminated
        runtime.block_on(async move {
            let mut node = ClusterNode::with_state(state).await?;
            node.run(rx_term).await?;

            // suppress logging before dropping the runtime to avoid spurious
            // error messages
            log::set_max_level(LevelFilter::Off);

            Ok::<(), FedError>(()) // give type hint for this async closure
        })?;
    } // drop the runtime here

    log::set_max_level(log_level);
    Ok(())
}

/// Main function of a fedloc node.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = node_main() {
        pf_error!("node_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
