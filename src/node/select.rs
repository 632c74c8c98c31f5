//! Server selection collaborator.

use std::collections::HashMap;

use crate::node::NodeStatus;
use crate::utils::{ServerSet, SlotId};

/// Picks one server out of a candidate set.
pub trait Selector: Send + Sync {
    fn select(
        &self,
        candidates: ServerSet,
        statuses: &HashMap<SlotId, NodeStatus>,
    ) -> Option<SlotId>;
}

/// Picks the least-loaded non-suspended candidate, lowest slot on ties.
#[derive(Debug, Default)]
pub struct LeastLoadSelector;

impl Selector for LeastLoadSelector {
    fn select(
        &self,
        candidates: ServerSet,
        statuses: &HashMap<SlotId, NodeStatus>,
    ) -> Option<SlotId> {
        candidates
            .iter()
            .filter_map(|slot| statuses.get(&slot).map(|st| (slot, st)))
            .filter(|(_, st)| !st.suspended)
            .min_by_key(|(slot, st)| (st.load, *slot))
            .map(|(slot, _)| slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::FedError;

    fn status(load: u32, suspended: bool) -> NodeStatus {
        NodeStatus {
            load,
            suspended,
            ..Default::default()
        }
    }

    #[test]
    fn least_load_wins() -> Result<(), FedError> {
        let statuses = HashMap::from([
            (1, status(50, false)),
            (2, status(10, true)),
            (3, status(20, false)),
            (4, status(20, false)),
        ]);
        let sel = LeastLoadSelector;
        let all = ServerSet::from_slots([1, 2, 3, 4, 9])?;
        assert_eq!(sel.select(all, &statuses), Some(3));
        assert_eq!(sel.select(ServerSet::single(2)?, &statuses), None);
        assert_eq!(sel.select(ServerSet::EMPTY, &statuses), None);
        Ok(())
    }
}
