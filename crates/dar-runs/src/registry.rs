//! Run registry
//!
//! In-memory store of run records keyed by [`RunId`]. Records are cloned on
//! every read and write, so callers never alias stored state. Mutations of one
//! run are serialized by the map shard lock; distinct runs do not contend.

use crate::error::RegistryError;
use crate::types::{CreateRunRequest, JsonObject, RunError, RunId, RunRecord, RunStatus};
use chrono::Utc;
use dar_kernel::error::ErrorCode;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Registry of runs and their lifecycle
#[derive(Debug)]
pub struct RunRegistry {
    runs: DashMap<RunId, RunRecord>,
    next_id: AtomicU64,
}

impl Default for RunRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RunRegistry {
    /// Empty registry; ids start at `run_000001`
    #[must_use]
    pub fn new() -> Self {
        Self {
            runs: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a new run in `created`
    pub fn create(&self, request: CreateRunRequest) -> RunRecord {
        let run_id = RunId::from_sequence(self.next_id.fetch_add(1, Ordering::Relaxed));
        let now = Utc::now();
        let record = RunRecord {
            run_id: run_id.clone(),
            agent_id: request.agent_id,
            status: RunStatus::Created,
            input: request.input,
            output: None,
            error: None,
            created_at: now,
            updated_at: now,
        };

        tracing::debug!(run_id = %run_id, agent_id = %record.agent_id, "Run created");
        self.runs.insert(run_id, record.clone());
        record
    }

    /// Look up a run
    #[must_use]
    pub fn get(&self, run_id: &str) -> Option<RunRecord> {
        self.runs.get(run_id).map(|r| r.value().clone())
    }

    /// All runs, ordered by creation time then id
    #[must_use]
    pub fn list(&self) -> Vec<RunRecord> {
        let mut records: Vec<RunRecord> = self.runs.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.run_id.cmp(&b.run_id))
        });
        records
    }

    /// Number of runs
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.runs.len()
    }

    /// Check if no run was registered
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// `created -> running`
    ///
    /// # Errors
    /// [`RegistryError`] for unknown ids or illegal transitions.
    pub fn start(&self, run_id: &str) -> Result<RunRecord, RegistryError> {
        self.transition(run_id, RunStatus::Running, |_| {})
    }

    /// `running -> completed`, replacing the output
    ///
    /// # Errors
    /// [`RegistryError`] for unknown ids or illegal transitions.
    pub fn complete(
        &self,
        run_id: &str,
        output: Option<JsonObject>,
    ) -> Result<RunRecord, RegistryError> {
        self.transition(run_id, RunStatus::Completed, |record| record.output = output)
    }

    /// `running -> failed`
    ///
    /// # Errors
    /// [`RegistryError`] for unknown ids or illegal transitions.
    pub fn fail(&self, run_id: &str, error: RunError) -> Result<RunRecord, RegistryError> {
        self.transition(run_id, RunStatus::Failed, |record| record.error = Some(error))
    }

    /// `created|running -> cancelled`
    ///
    /// A reason sets the error to `RUN_CANCELLED`; without one the existing
    /// error is kept.
    ///
    /// # Errors
    /// [`RegistryError`] for unknown ids or terminal runs.
    pub fn cancel(&self, run_id: &str, reason: Option<&str>) -> Result<RunRecord, RegistryError> {
        self.transition(run_id, RunStatus::Cancelled, |record| {
            if let Some(reason) = reason {
                record.error = Some(RunError::new(ErrorCode::RunCancelled, reason));
            }
        })
    }

    /// Overwrite a run with a snapshot verbatim, unless it reached a terminal state
    ///
    /// Bypasses the transition table and keeps the snapshot's timestamps.
    /// The check and the write happen under one shard lock, so a concurrent
    /// cancel is never undone. Returns `None` for unknown or terminal runs.
    pub fn restore_if_active(&self, snapshot: &RunRecord) -> Option<RunRecord> {
        let mut entry = self.runs.get_mut(snapshot.run_id.as_str())?;
        if entry.status.is_terminal() {
            return None;
        }
        *entry.value_mut() = snapshot.clone();
        tracing::debug!(run_id = %snapshot.run_id, status = %snapshot.status, "Run restored");
        Some(snapshot.clone())
    }

    fn transition(
        &self,
        run_id: &str,
        to: RunStatus,
        apply: impl FnOnce(&mut RunRecord),
    ) -> Result<RunRecord, RegistryError> {
        let mut entry = self
            .runs
            .get_mut(run_id)
            .ok_or_else(|| RegistryError::NotFound(RunId::new(run_id)))?;
        let record = entry.value_mut();

        let from = record.status;
        if !from.can_transition_to(to) {
            return Err(RegistryError::InvalidTransition { from, to });
        }

        apply(record);
        record.status = to;
        record.updated_at = Utc::now();
        tracing::info!(run_id = %run_id, from = %from, to = %to, "Run transition");
        Ok(record.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn input() -> JsonObject {
        json!({ "goal": "demo" }).as_object().cloned().unwrap()
    }

    #[test]
    fn create_allocates_sequential_ids() {
        let registry = RunRegistry::new();
        let a = registry.create(CreateRunRequest::new("agent"));
        let b = registry.create(CreateRunRequest::new("agent").with_input(input()));

        assert_eq!(a.run_id.as_str(), "run_000001");
        assert_eq!(b.run_id.as_str(), "run_000002");
        assert_eq!(a.status, RunStatus::Created);
        assert_eq!(a.created_at, a.updated_at);
        assert_eq!(b.input, Some(input()));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn list_is_ordered() {
        let registry = RunRegistry::new();
        for _ in 0..5 {
            registry.create(CreateRunRequest::new("agent"));
        }
        let ids: Vec<String> = registry
            .list()
            .into_iter()
            .map(|r| r.run_id.to_string())
            .collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }

    #[test]
    fn happy_path_lifecycle() {
        let registry = RunRegistry::new();
        let id = registry.create(CreateRunRequest::new("agent")).run_id;

        let running = registry.start(id.as_str()).unwrap();
        assert_eq!(running.status, RunStatus::Running);

        let output = json!({ "answer": 42 }).as_object().cloned();
        let done = registry.complete(id.as_str(), output.clone()).unwrap();
        assert_eq!(done.status, RunStatus::Completed);
        assert_eq!(done.output, output);
        assert!(done.updated_at >= done.created_at);
    }

    #[test]
    fn illegal_transition_leaves_record_untouched() {
        let registry = RunRegistry::new();
        let id = registry.create(CreateRunRequest::new("agent")).run_id;
        let before = registry.get(id.as_str()).unwrap();

        let err = registry
            .fail(id.as_str(), RunError::new(ErrorCode::InternalError, "x"))
            .unwrap_err();
        assert_eq!(err.to_string(), "Invalid transition: created -> failed");
        assert_eq!(registry.get(id.as_str()).unwrap(), before);
    }

    #[test]
    fn cancel_sets_reason_and_is_terminal() {
        let registry = RunRegistry::new();
        let id = registry.create(CreateRunRequest::new("agent")).run_id;

        let cancelled = registry.cancel(id.as_str(), Some("user abort")).unwrap();
        assert_eq!(cancelled.status, RunStatus::Cancelled);
        assert_eq!(
            cancelled.error,
            Some(RunError::new(ErrorCode::RunCancelled, "user abort"))
        );

        let err = registry.cancel(id.as_str(), None).unwrap_err();
        assert_eq!(err.to_string(), "Invalid transition: cancelled -> cancelled");
        assert!(registry.start(id.as_str()).is_err());
    }

    #[test]
    fn unknown_run() {
        let registry = RunRegistry::new();
        assert!(registry.get("run_999999").is_none());
        assert_eq!(
            registry.start("run_999999").unwrap_err(),
            RegistryError::NotFound(RunId::new("run_999999"))
        );
    }

    #[test]
    fn restore_if_active_overwrites_verbatim() {
        let registry = RunRegistry::new();
        let id = registry.create(CreateRunRequest::new("agent")).run_id;
        let running = registry.start(id.as_str()).unwrap();

        let mut snapshot = running.clone();
        snapshot.updated_at = snapshot.created_at;
        snapshot.error = Some(RunError::new(ErrorCode::Timeout, "slow"));

        assert_eq!(registry.restore_if_active(&snapshot), Some(snapshot.clone()));
        assert_eq!(registry.get(id.as_str()).unwrap(), snapshot);
        assert!(registry.restore_if_active(&running).is_some());
        assert_eq!(registry.get(id.as_str()).unwrap(), running);
    }

    #[test]
    fn restore_if_active_skips_terminal_runs() {
        let registry = RunRegistry::new();
        let id = registry.create(CreateRunRequest::new("agent")).run_id;
        let snapshot = registry.start(id.as_str()).unwrap();

        assert_eq!(registry.restore_if_active(&snapshot), Some(snapshot.clone()));

        registry.cancel(id.as_str(), Some("stop")).unwrap();
        assert!(registry.restore_if_active(&snapshot).is_none());
        assert_eq!(registry.get(id.as_str()).unwrap().status, RunStatus::Cancelled);
    }

    #[test]
    fn returned_records_are_detached() {
        let registry = RunRegistry::new();
        let mut record = registry.create(CreateRunRequest::new("agent"));
        record.agent_id = "mutated".into();
        assert_eq!(registry.get(record.run_id.as_str()).unwrap().agent_id, "agent");
    }
}
