//! Node-wide state, configuration, and the top-level node runner.

mod admin;
mod cms;
mod config;
mod node;
mod state;

pub use admin::{AdminListener, PhaseWatch};
pub use cms::CmsState;
pub use config::{parse_endpoint, NodeConfig};
pub use node::ClusterNode;
pub use state::{not_found, ClusterState};
