//! Aggregate serving state of this node as seen by its managers.

use std::sync::{Mutex, MutexGuard};

use crate::node::SlotCounts;
use crate::protocol::modifier;

use tokio::sync::watch;

#[derive(Debug)]
struct CmsInner {
    local_suspend: bool,
    local_nostage: bool,
    counts: SlotCounts,
    /// Effective (suspended, nostage) last reported upward.
    reported: (bool, bool),
}

/// Local administrative flags combined with subordinate counts.
///
/// A node aggregating subordinates is effectively suspended while none of
/// them is active, and effectively nostage while none of them stages.
#[derive(Debug)]
pub struct CmsState {
    aggregates: bool,
    inner: Mutex<CmsInner>,
    tx_suspended: watch::Sender<bool>,
}

impl CmsState {
    /// Creates the state; `aggregates` is true for nodes that have
    /// subordinates.
    pub fn new(aggregates: bool) -> Self {
        let inner = CmsInner {
            local_suspend: false,
            local_nostage: false,
            counts: SlotCounts::default(),
            reported: (aggregates, aggregates),
        };
        let (tx_suspended, _) = watch::channel(aggregates);
        CmsState {
            aggregates,
            inner: Mutex::new(inner),
            tx_suspended,
        }
    }

    fn state(&self) -> MutexGuard<'_, CmsInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn effective(&self, inner: &CmsInner) -> (bool, bool) {
        let suspended = inner.local_suspend
            || (self.aggregates && inner.counts.active == 0);
        let nostage = inner.local_nostage
            || (self.aggregates && inner.counts.staging == 0);
        (suspended, nostage)
    }

    // Publishes the effective state; returns the status modifier to
    // inform upward if it changed since the last report.
    fn settle(&self, inner: &mut CmsInner) -> Option<u8> {
        let now = self.effective(inner);
        let before = inner.reported;
        if now == before {
            return None;
        }
        inner.reported = now;
        self.tx_suspended.send_replace(now.0);
        let mut bits = 0;
        if now.0 != before.0 {
            bits |= if now.0 {
                modifier::SUSPEND
            } else {
                modifier::RESUME
            };
        }
        if now.1 != before.1 {
            bits |= if now.1 {
                modifier::NOSTAGE
            } else {
                modifier::STAGE
            };
        }
        Some(bits)
    }

    /// Records new subordinate counts.
    pub fn recount(&self, counts: SlotCounts) -> Option<u8> {
        let mut inner = self.state();
        inner.counts = counts;
        self.settle(&mut inner)
    }

    /// Changes local administrative flags; `None` leaves a flag as is.
    pub fn set_local(
        &self,
        suspend: Option<bool>,
        nostage: Option<bool>,
    ) -> Option<u8> {
        let mut inner = self.state();
        if let Some(s) = suspend {
            inner.local_suspend = s;
        }
        if let Some(n) = nostage {
            inner.local_nostage = n;
        }
        self.settle(&mut inner)
    }

    pub fn is_suspended(&self) -> bool {
        self.effective(&self.state()).0
    }

    pub fn is_nostage(&self) -> bool {
        self.effective(&self.state()).1
    }

    /// Full status modifier describing the current effective state.
    pub fn status_bits(&self) -> u8 {
        let (suspended, nostage) = self.effective(&self.state());
        let mut bits = if suspended {
            modifier::SUSPEND
        } else {
            modifier::RESUME
        };
        bits |= if nostage {
            modifier::NOSTAGE
        } else {
            modifier::STAGE
        };
        bits
    }

    /// Login mode bits describing the current effective state.
    pub fn login_mode(&self) -> u8 {
        let (suspended, nostage) = self.effective(&self.state());
        let mut mode = 0;
        if suspended {
            mode |= modifier::LOGIN_SUSPEND;
        }
        if nostage {
            mode |= modifier::LOGIN_NOSTAGE;
        }
        mode
    }

    /// Watches the effective suspended flag.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx_suspended.subscribe()
    }

    /// Current subordinate counts.
    pub fn counts(&self) -> SlotCounts {
        self.state().counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(active: usize, staging: usize) -> SlotCounts {
        SlotCounts { active, staging }
    }

    #[test]
    fn leaf_follows_local_flags() {
        let cms = CmsState::new(false);
        assert!(!cms.is_suspended());
        assert_eq!(cms.recount(counts(0, 0)), None);
        assert_eq!(cms.set_local(Some(true), None), Some(modifier::SUSPEND));
        assert_eq!(cms.set_local(Some(true), None), None);
        assert_eq!(cms.login_mode(), modifier::LOGIN_SUSPEND);
        assert_eq!(
            cms.set_local(Some(false), Some(true)),
            Some(modifier::RESUME | modifier::NOSTAGE)
        );
        assert_eq!(cms.status_bits(), modifier::RESUME | modifier::NOSTAGE);
    }

    #[test]
    fn aggregate_transitions() {
        let cms = CmsState::new(true);
        let rx = cms.subscribe();
        assert!(*rx.borrow());
        assert_eq!(
            cms.recount(counts(1, 0)),
            Some(modifier::RESUME)
        );
        assert!(!*rx.borrow());
        assert_eq!(cms.recount(counts(2, 0)), None);
        assert_eq!(cms.recount(counts(2, 1)), Some(modifier::STAGE));
        assert_eq!(
            cms.recount(counts(0, 0)),
            Some(modifier::SUSPEND | modifier::NOSTAGE)
        );
        assert!(*rx.borrow());
    }
}
