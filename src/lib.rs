//! Fedloc: the cluster management layer of a federated file-location
//! service.
//!
//! Nodes form a tree. Data servers report which files they hold to their
//! managers, which cache those reports and answer clients asking where a
//! file lives, querying subordinates on a miss.

#[macro_use]
mod utils;

pub mod cache;
pub mod cluster;
pub mod manager;
pub mod node;
pub mod protocol;

pub use utils::{
    logger_init, FedError, ServerSet, SlotBitmap, SlotId, Timer, MAX_SLOTS,
    ME,
};

pub use cache::{PathCache, PendingRequest, ResponseQueue, Snapshot};
pub use cluster::{ClusterNode, ClusterState, NodeConfig};
pub use manager::{AlternateManagerList, ManagerSubscription, ManagerTree};
pub use node::{FileSystem, LocalFs, NodeSession};
pub use protocol::{Frame, Request, Role, RrCode};
