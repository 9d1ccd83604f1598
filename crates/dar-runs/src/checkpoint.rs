//! Checkpoint store
//!
//! Keeps the latest valid snapshot of each run so a failed attempt can be
//! rolled back. No history is retained.

use crate::types::{RunId, RunRecord};
use dashmap::DashMap;

/// Latest-valid snapshot storage
pub trait CheckpointStore: Send + Sync {
    /// Store a copy of `snapshot`, replacing any previous one
    fn save_valid(&self, run_id: &RunId, snapshot: &RunRecord);

    /// Copy of the latest snapshot
    fn load_latest_valid(&self, run_id: &RunId) -> Option<RunRecord>;

    /// Drop the snapshot of a finished run
    fn discard(&self, run_id: &RunId);
}

/// [`CheckpointStore`] backed by a concurrent map
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    latest: DashMap<RunId, RunRecord>,
}

impl InMemoryCheckpointStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of runs with a snapshot
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.latest.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }
}

impl CheckpointStore for InMemoryCheckpointStore {
    fn save_valid(&self, run_id: &RunId, snapshot: &RunRecord) {
        self.latest.insert(run_id.clone(), snapshot.clone());
    }

    fn load_latest_valid(&self, run_id: &RunId) -> Option<RunRecord> {
        self.latest.get(run_id).map(|r| r.value().clone())
    }

    fn discard(&self, run_id: &RunId) {
        self.latest.remove(run_id);
    }
}
