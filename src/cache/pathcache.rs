//! Best-effort cache of which subordinate servers hold which files.
//!
//! All operations serialize on one table-wide lock that is held only for
//! the in-memory mutation, never across I/O. Expiry of a line's query
//! deadline is lazy: it is noticed by the next lookup of that line.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::cache::{ConnId, PendingRequest, QueueHandle, ResponseQueue};
use crate::utils::{ServerSet, SlotId};

/// Options of an `add_file` report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AddOpts {
    /// The reporting servers can serve the file for writing.
    pub write: bool,
    /// The reporting servers are still staging the file.
    pub pending: bool,
}

/// Copy of a cache line's masks at some instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Snapshot {
    pub have: ServerSet,
    pub pending: ServerSet,
    pub suspect: ServerSet,
    pub deadline: Option<Instant>,
}

/// How conclusive a lookup is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineStatus {
    /// No line exists for the path.
    Absent,
    /// A query round is in flight and its deadline has not passed.
    Querying,
    /// A query round just timed out; the deadline has been cleared and the
    /// masks are as conclusive as they will get.
    Stale,
    /// No query in flight; the masks are the current knowledge.
    Resolved,
}

/// Result of `get_file`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lookup {
    pub status: LineStatus,
    pub snapshot: Snapshot,
    /// Suspect servers this lookup moved back into a query round. They
    /// must be asked again before absence can be concluded.
    pub requery: ServerSet,
}

impl Lookup {
    /// Is the answer final enough to reply with?
    pub fn is_conclusive(&self) -> bool {
        match self.status {
            LineStatus::Absent | LineStatus::Querying => false,
            LineStatus::Stale | LineStatus::Resolved => {
                !(self.snapshot.have.is_empty()
                    && !self.snapshot.pending.is_empty())
            }
        }
    }

    /// Does anybody hold or stage the file?
    pub fn found(&self) -> bool {
        self.status != LineStatus::Absent
            && !(self.snapshot.have | self.snapshot.pending).is_empty()
    }
}

/// Result of `add_file`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddOutcome {
    /// The line went from nobody-has-it to somebody-has-it (or changed its
    /// staging state while nobody had it online).
    pub first_report: bool,
    /// Waiters released by this report, in arrival order.
    pub released: Vec<PendingRequest>,
    pub snapshot: Snapshot,
}

/// Result of `del_file`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelOutcome {
    /// The last known holder was removed by this call.
    pub became_empty: bool,
    /// Waiters released because the line is now conclusively empty.
    pub released: Vec<PendingRequest>,
    pub snapshot: Snapshot,
}

/// Result of one maintenance pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScrubReport {
    pub evicted: usize,
    pub expired: Vec<PendingRequest>,
}

#[derive(Debug)]
struct CacheLine {
    have: ServerSet,
    pending: ServerSet,
    suspect: ServerSet,
    deadline: Option<Instant>,
    touched: Instant,
    ro_waiters: Option<QueueHandle>,
    rw_waiters: Option<QueueHandle>,
}

impl CacheLine {
    fn new(now: Instant) -> Self {
        CacheLine {
            have: ServerSet::EMPTY,
            pending: ServerSet::EMPTY,
            suspect: ServerSet::EMPTY,
            deadline: None,
            touched: now,
            ro_waiters: None,
            rw_waiters: None,
        }
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            have: self.have,
            pending: self.pending,
            suspect: self.suspect,
            deadline: self.deadline,
        }
    }

    fn masks_empty(&self) -> bool {
        (self.have | self.pending | self.suspect).is_empty()
    }

    fn has_waiters(&self) -> bool {
        self.ro_waiters.is_some() || self.rw_waiters.is_some()
    }

    fn clear(&mut self, mask: ServerSet) {
        self.have = self.have - mask;
        self.pending = self.pending - mask;
        self.suspect = self.suspect - mask;
    }

    fn release_ro(&mut self, rrq: &mut ResponseQueue) -> Vec<PendingRequest> {
        self.ro_waiters.take().map(|h| rrq.take(h)).unwrap_or_default()
    }

    fn release_all(&mut self, rrq: &mut ResponseQueue) -> Vec<PendingRequest> {
        let mut released =
            self.rw_waiters.take().map(|h| rrq.take(h)).unwrap_or_default();
        released.extend(self.release_ro(rrq));
        released
    }

    fn enqueue(
        &mut self,
        rrq: &mut ResponseQueue,
        waiter: PendingRequest,
        expiry: Instant,
    ) {
        let slot = if waiter.wants_write {
            &mut self.rw_waiters
        } else {
            &mut self.ro_waiters
        };
        *slot = Some(rrq.add(*slot, waiter, expiry));
    }

    // A deadline nobody looked at in time resolves the line all the same.
    fn lapse(&mut self, now: Instant) {
        if self.deadline.is_some_and(|d| d <= now) {
            self.deadline = None;
        }
    }

    // Drops references to queues that no longer exist.
    fn forget_handles(&mut self, emptied: &[QueueHandle]) {
        if self.ro_waiters.is_some_and(|h| emptied.contains(&h)) {
            self.ro_waiters = None;
        }
        if self.rw_waiters.is_some_and(|h| emptied.contains(&h)) {
            self.rw_waiters = None;
        }
    }
}

#[derive(Debug, Default)]
struct CacheTable {
    lines: HashMap<String, CacheLine>,
    rrq: ResponseQueue,
}

impl CacheTable {
    fn forget_handles(&mut self, emptied: &[QueueHandle]) {
        if emptied.is_empty() {
            return;
        }
        for line in self.lines.values_mut() {
            line.forget_handles(emptied);
        }
    }
}

/// Collapses repeated slashes and strips a trailing one.
pub fn normalize_path(path: &str) -> String {
    let mut norm = String::with_capacity(path.len());
    for seg in path.split('/').filter(|s| !s.is_empty()) {
        norm.push('/');
        norm.push_str(seg);
    }
    if norm.is_empty() {
        norm.push('/');
    }
    norm
}

// Is normalized `path` equal to or beneath normalized `prefix`?
fn under(path: &str, prefix: &str) -> bool {
    prefix == "/"
        || path
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}

/// The file-location cache.
#[derive(Debug)]
pub struct PathCache {
    table: Mutex<CacheTable>,
    query_delay: Duration,
}

impl PathCache {
    /// Creates an empty cache. `query_delay` is how long a fan-out query
    /// may take before its line is considered resolved, and also how long
    /// a deferred requester may stay queued.
    pub fn new(query_delay: Duration) -> Self {
        PathCache {
            table: Mutex::new(CacheTable::default()),
            query_delay,
        }
    }

    fn table(&self) -> MutexGuard<'_, CacheTable> {
        // the table holds no cross-line invariant a panicking holder could
        // break halfway, so keep serving after poisoning
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Records that the servers in `mask` hold `path`. A nonzero `delta`
    /// instead forgets everything known about the path and marks it as
    /// being re-queried until `now + delta`.
    pub fn add_file(
        &self,
        path: &str,
        mask: ServerSet,
        opts: AddOpts,
        delta: Duration,
    ) -> AddOutcome {
        let now = Instant::now();
        let mut table = self.table();
        let CacheTable { lines, rrq } = &mut *table;
        let line = lines
            .entry(normalize_path(path))
            .or_insert_with(|| CacheLine::new(now));
        line.touched = now;

        if !delta.is_zero() {
            line.clear(ServerSet::ALL);
            line.deadline = Some(now + delta);
            return AddOutcome {
                first_report: false,
                released: vec![],
                snapshot: line.snapshot(),
            };
        }

        let (old_have, old_pending) = (line.have, line.pending);
        if opts.pending {
            line.pending |= mask;
        } else {
            line.have |= mask;
            line.pending = line.pending - mask;
        }
        line.suspect = line.suspect - mask;
        let first_report = old_have.is_empty()
            && (line.have != old_have || line.pending != old_pending);

        let mut released = vec![];
        if !line.have.is_empty() {
            if opts.write {
                line.deadline = None;
                released = line.release_all(rrq);
            } else {
                released = line.release_ro(rrq);
                if line.rw_waiters.is_none() {
                    line.deadline = None;
                }
            }
        }

        AddOutcome {
            first_report,
            released,
            snapshot: line.snapshot(),
        }
    }

    /// Records that the servers in `mask` no longer hold `path`. A nonzero
    /// `delta` keeps the line and gives it a fresh query deadline.
    pub fn del_file(
        &self,
        path: &str,
        mask: ServerSet,
        delta: Duration,
    ) -> DelOutcome {
        let now = Instant::now();
        let key = normalize_path(path);
        let mut table = self.table();
        let CacheTable { lines, rrq } = &mut *table;

        if delta.is_zero() && !lines.contains_key(&key) {
            return DelOutcome {
                became_empty: false,
                released: vec![],
                snapshot: Snapshot::default(),
            };
        }
        let line = lines
            .entry(key.clone())
            .or_insert_with(|| CacheLine::new(now));
        line.touched = now;

        let had_holder = !line.have.is_empty();
        line.clear(mask);
        let became_empty = had_holder && line.have.is_empty();
        if !delta.is_zero() {
            line.deadline = Some(now + delta);
        }

        let mut released = vec![];
        if line.have.is_empty()
            && line.pending.is_empty()
            && line.deadline.is_none()
        {
            released = line.release_all(rrq);
        }

        let snapshot = line.snapshot();
        if delta.is_zero() && line.masks_empty() && !line.has_waiters() {
            lines.remove(&key);
        }
        DelOutcome {
            became_empty,
            released,
            snapshot,
        }
    }

    /// Looks up `path`. An inconclusive answer enqueues `waiter`, if given,
    /// to be released by whichever report resolves the line. Looking up an
    /// absent path with a waiter creates the line with a query deadline.
    pub fn get_file(
        &self,
        path: &str,
        want_write: bool,
        waiter: Option<PendingRequest>,
    ) -> Lookup {
        let now = Instant::now();
        let expiry = now + self.query_delay;
        let key = normalize_path(path);
        let mut table = self.table();
        let CacheTable { lines, rrq } = &mut *table;

        if !lines.contains_key(&key) {
            if let Some(mut waiter) = waiter {
                waiter.wants_write = want_write;
                let line =
                    lines.entry(key).or_insert_with(|| CacheLine::new(now));
                line.deadline = Some(expiry);
                line.enqueue(rrq, waiter, expiry);
            }
            return Lookup {
                status: LineStatus::Absent,
                snapshot: Snapshot::default(),
                requery: ServerSet::EMPTY,
            };
        }
        let line = lines.entry(key).or_insert_with(|| CacheLine::new(now));
        line.touched = now;

        let mut status = match line.deadline {
            Some(deadline) if deadline > now => LineStatus::Querying,
            Some(_) => {
                line.deadline = None;
                LineStatus::Stale
            }
            None => LineStatus::Resolved,
        };
        // bounced holders are unverified, not gone: ask them once more
        let mut requery = ServerSet::EMPTY;
        if status != LineStatus::Querying
            && line.have.is_empty()
            && !line.suspect.is_empty()
        {
            requery = line.suspect;
            line.suspect = ServerSet::EMPTY;
            line.deadline = Some(expiry);
            status = LineStatus::Querying;
        }
        let lookup = Lookup {
            status,
            snapshot: line.snapshot(),
            requery,
        };
        if !lookup.is_conclusive() {
            if let Some(mut waiter) = waiter {
                waiter.wants_write = want_write;
                line.enqueue(rrq, waiter, expiry);
            }
        }
        lookup
    }

    /// Starts a query round for `path`: the line is inconclusive until
    /// either a report arrives or the query delay passes.
    pub fn begin_query(&self, path: &str) {
        let now = Instant::now();
        let mut table = self.table();
        let line = table
            .lines
            .entry(normalize_path(path))
            .or_insert_with(|| CacheLine::new(now));
        line.touched = now;
        line.deadline = Some(now + self.query_delay);
    }

    /// Demotes the servers in `mask` from holding/staging to suspect on
    /// every line, or only on lines under `prefix` if given.
    pub fn bounce(&self, mask: ServerSet, prefix: Option<&str>) {
        let prefix = prefix.map(normalize_path);
        let mut table = self.table();
        for (path, line) in table.lines.iter_mut() {
            if prefix.as_deref().is_some_and(|p| !under(path, p)) {
                continue;
            }
            let present = (line.have | line.pending) & mask;
            line.have = line.have - mask;
            line.pending = line.pending - mask;
            line.suspect |= present;
        }
    }

    /// Erases every trace of `slot` and drops lines that end up empty.
    pub fn reset(&self, slot: SlotId) {
        let now = Instant::now();
        let mask = ServerSet::single(slot).unwrap_or(ServerSet::EMPTY);
        let mut table = self.table();
        table.lines.retain(|_, line| {
            line.clear(mask);
            line.lapse(now);
            !(line.masks_empty()
                && line.deadline.is_none()
                && !line.has_waiters())
        });
    }

    /// Drops the line of `path` outright. Returns its released waiters.
    pub fn del_cache(&self, path: &str) -> Vec<PendingRequest> {
        let mut table = self.table();
        let CacheTable { lines, rrq } = &mut *table;
        match lines.remove(&normalize_path(path)) {
            Some(mut line) => line.release_all(rrq),
            None => vec![],
        }
    }

    /// Returns every cached path under `prefix`.
    pub fn extract(&self, prefix: &str) -> BTreeSet<String> {
        let prefix = normalize_path(prefix);
        self.table()
            .lines
            .keys()
            .filter(|path| under(path, &prefix))
            .cloned()
            .collect()
    }

    /// Cancels every waiter queued by connection `conn`.
    pub fn cancel_conn(&self, conn: ConnId) {
        let mut table = self.table();
        let emptied = table.rrq.cancel_conn(conn);
        table.forget_handles(&emptied);
    }

    /// Maintenance pass: expires overdue waiters and evicts lines that
    /// have held no live server for at least `hold`.
    pub fn scrub(&self, now: Instant, hold: Duration) -> ScrubReport {
        let mut table = self.table();
        let (expired, emptied) = table.rrq.expire(now);
        table.forget_handles(&emptied);

        let before = table.lines.len();
        table.lines.retain(|_, line| {
            line.lapse(now);
            let idle = (line.have | line.pending).is_empty()
                && line.deadline.is_none()
                && !line.has_waiters()
                && now.saturating_duration_since(line.touched) >= hold;
            !idle
        });
        ScrubReport {
            evicted: before - table.lines.len(),
            expired,
        }
    }

    /// Returns the current masks of `path` without side effects.
    pub fn peek(&self, path: &str) -> Option<Snapshot> {
        self.table()
            .lines
            .get(&normalize_path(path))
            .map(|line| line.snapshot())
    }

    /// Number of cache lines.
    pub fn len(&self) -> usize {
        self.table().lines.len()
    }

    /// Is the cache empty?
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of queued waiters across all lines.
    pub fn num_waiters(&self) -> usize {
        self.table().rrq.len()
    }
}
