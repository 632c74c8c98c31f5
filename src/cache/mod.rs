//! File-location cache, deferred-response queue, and path export table.

mod pathcache;
mod pathtab;
mod rrq;

pub use pathcache::{
    normalize_path, AddOpts, AddOutcome, DelOutcome, LineStatus, Lookup,
    PathCache, ScrubReport, Snapshot,
};
pub use pathtab::{PathInfo, PathTable};
pub use rrq::{ConnId, PendingRequest, QueueHandle, ResponseQueue, WaitVerb};
