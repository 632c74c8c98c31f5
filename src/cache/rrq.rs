//! Queue of requesters waiting for a cache line to resolve.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

/// Process-unique identifier of one live connection.
pub type ConnId = u64;

/// Which verb a deferred requester is waiting to be answered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WaitVerb {
    Locate,
    Select,
    State,
}

/// Context of a requester whose answer was deferred.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    pub conn: ConnId,
    pub stream_id: u16,
    pub wants_write: bool,
    pub verb: WaitVerb,
}

/// Opaque handle naming one FIFO of waiters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueHandle(u64);

#[derive(Debug)]
struct Queued {
    req: PendingRequest,
    expiry: Instant,
}

/// Set of FIFO waiter queues indexed by handle. Every waiter leaves the
/// structure exactly once: by `take`, by `expire`, or by `cancel_conn`.
#[derive(Debug, Default)]
pub struct ResponseQueue {
    queues: HashMap<QueueHandle, VecDeque<Queued>>,
    next_handle: u64,
}

impl ResponseQueue {
    /// Creates an empty response queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `req` to the queue named by `handle`, or to a freshly created
    /// queue if `handle` is `None` or no longer live. Returns the handle the
    /// request now sits under.
    pub fn add(
        &mut self,
        handle: Option<QueueHandle>,
        req: PendingRequest,
        expiry: Instant,
    ) -> QueueHandle {
        let handle = match handle {
            Some(h) if self.queues.contains_key(&h) => h,
            _ => {
                let h = QueueHandle(self.next_handle);
                self.next_handle += 1;
                h
            }
        };
        self.queues
            .entry(handle)
            .or_default()
            .push_back(Queued { req, expiry });
        handle
    }

    /// Removes and returns every waiter under `handle` in arrival order.
    pub fn take(&mut self, handle: QueueHandle) -> Vec<PendingRequest> {
        self.queues
            .remove(&handle)
            .map(|q| q.into_iter().map(|w| w.req).collect())
            .unwrap_or_default()
    }

    /// Removes waiters whose expiry is at or before `now`. Returns them
    /// together with the handles whose queues became empty as a result.
    pub fn expire(
        &mut self,
        now: Instant,
    ) -> (Vec<PendingRequest>, Vec<QueueHandle>) {
        let mut expired = vec![];
        let emptied = self.retain_each(|w| {
            if w.expiry <= now {
                expired.push(w.req.clone());
                false
            } else {
                true
            }
        });
        (expired, emptied)
    }

    /// Drops every waiter belonging to connection `conn`. Returns the
    /// handles whose queues became empty as a result.
    pub fn cancel_conn(&mut self, conn: ConnId) -> Vec<QueueHandle> {
        self.retain_each(|w| w.req.conn != conn)
    }

    /// Does `handle` still name a non-empty queue?
    pub fn is_live(&self, handle: QueueHandle) -> bool {
        self.queues.contains_key(&handle)
    }

    /// Total number of queued waiters.
    pub fn len(&self) -> usize {
        self.queues.values().map(|q| q.len()).sum()
    }

    /// Is there no waiter at all?
    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    // Keeps only waiters satisfying `keep`, deleting emptied queues.
    fn retain_each(
        &mut self,
        mut keep: impl FnMut(&Queued) -> bool,
    ) -> Vec<QueueHandle> {
        let mut emptied = vec![];
        for (handle, queue) in self.queues.iter_mut() {
            queue.retain(&mut keep);
            if queue.is_empty() {
                emptied.push(*handle);
            }
        }
        for handle in &emptied {
            self.queues.remove(handle);
        }
        emptied
    }
}
