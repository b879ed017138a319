//! Fetch orchestrator: the job queue, dispatcher, hedged execution and
//! error remediation around the browser pool.

pub mod classify;
pub mod job;
pub mod persistence;
pub mod queue;

pub use classify::{ErrorClass, classify};
pub use job::{Job, JobId, JobKind, JobStatus, PARTIAL_FLAG, mark_partial, strip_partial};
pub use persistence::{
    FallbackStateStore, FileStateStore, PersistedState, SqliteStateStore, StateStore,
};
pub use queue::{FetchQueue, QueueStats, WorkerPool};

/// Arena-style reference to one tab: slot id into the browser pool plus
/// tab index within the instance. Cheap to copy, hashable, and free of
/// the browser↔orchestrator reference cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TabRef {
    pub slot: usize,
    pub tab: usize,
}

impl TabRef {
    #[must_use]
    pub fn new(slot: usize, tab: usize) -> Self {
        Self { slot, tab }
    }
}

impl std::fmt::Display for TabRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.slot, self.tab)
    }
}
