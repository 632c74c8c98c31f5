//! Upward side of a node: the managers it subscribes to.

mod mantree;
mod pander;

pub use mantree::{
    AlternateManagerList, ManagerEntry, ManagerSlotTable, ManagerTree,
};
pub use pander::{ManagerSubscription, PanderState};
