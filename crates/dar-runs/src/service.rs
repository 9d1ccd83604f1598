//! Run service
//!
//! Composition root for run orchestration. Owns the registry, the checkpoint
//! store, both executors, the tool registry and the per-run cancellation
//! tokens, and wires them into the execute flow:
//!
//! 1. `created -> running`, checkpoint the running record
//! 2. fixpoint loop; before each retry the checkpoint is restored
//! 3. `running -> completed` with the envelope and retry metrics, or
//!    `running -> failed` with the last error
//!
//! A run cancelled meanwhile stays cancelled.

use crate::checkpoint::{CheckpointStore, InMemoryCheckpointStore};
use crate::config::RuntimeConfig;
use crate::error::{RegistryError, RunServiceError};
use crate::fixpoint::{
    execute_with_fixpoint_async, execute_with_fixpoint_using, FixpointHooks, FixpointOutcome,
};
use crate::registry::RunRegistry;
use crate::types::{CreateRunRequest, ExecuteRequest, JsonObject, RunError, RunId, RunRecord, RunStatus};
use dar_kernel::error::{DeterministicError, ErrorCode};
use dar_kernel::executor::{Executor, SessionExecutor};
use dar_kernel::sandbox::SandboxFactory;
use dar_kernel::tools::{execute_tool, ToolExecution, ToolOptions, ToolRegistry, ToolRequest};
use dashmap::DashMap;
use serde_json::Value;
use std::ops::ControlFlow;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const UNHANDLED_MESSAGE: &str = "Unhandled execute exception";

/// Run lifecycle service
pub struct RunService {
    config: RuntimeConfig,
    registry: Arc<RunRegistry>,
    checkpoints: Arc<dyn CheckpointStore>,
    executor: Executor,
    session_executor: SessionExecutor,
    tools: ToolRegistry,
    cancellations: DashMap<RunId, CancellationToken>,
}

impl std::fmt::Debug for RunService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunService")
            .field("config", &self.config)
            .field("runs", &self.registry.len())
            .field("tools", &self.tools)
            .finish_non_exhaustive()
    }
}

impl Default for RunService {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}

impl RunService {
    /// Service with fresh in-memory state
    #[must_use]
    pub fn new(config: RuntimeConfig) -> Self {
        let session_executor =
            SessionExecutor::new().with_step_timeout(config.sandbox_step_timeout());
        Self {
            config,
            registry: Arc::new(RunRegistry::new()),
            checkpoints: Arc::new(InMemoryCheckpointStore::new()),
            executor: Executor::new(),
            session_executor,
            tools: ToolRegistry::builtin(),
            cancellations: DashMap::new(),
        }
    }

    /// With a shared registry
    #[must_use]
    pub fn with_registry(mut self, registry: Arc<RunRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// With a checkpoint store
    #[must_use]
    pub fn with_checkpoint_store(mut self, checkpoints: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = checkpoints;
        self
    }

    /// With the synchronous executor
    #[must_use]
    pub fn with_executor(mut self, executor: Executor) -> Self {
        self.executor = executor;
        self
    }

    /// With the session-backed executor
    #[must_use]
    pub fn with_session_executor(mut self, executor: SessionExecutor) -> Self {
        self.session_executor = executor;
        self
    }

    /// With a sandbox session provider for `local` async runs
    #[must_use]
    pub fn with_sandbox_factory(mut self, factory: Arc<dyn SandboxFactory>) -> Self {
        self.session_executor = self.session_executor.with_factory(factory);
        self
    }

    /// With a tool registry
    #[must_use]
    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    #[inline]
    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Shared registry handle
    #[inline]
    #[must_use]
    pub fn registry(&self) -> &Arc<RunRegistry> {
        &self.registry
    }

    /// Register a run
    pub fn create_run(&self, request: CreateRunRequest) -> RunRecord {
        self.registry.create(request)
    }

    #[must_use]
    pub fn get_run(&self, run_id: &str) -> Option<RunRecord> {
        self.registry.get(run_id)
    }

    #[must_use]
    pub fn list_runs(&self) -> Vec<RunRecord> {
        self.registry.list()
    }

    /// Cancel a run and stop any pending retry
    ///
    /// # Errors
    /// [`RunServiceError::Registry`] for unknown or terminal runs.
    pub fn cancel_run(
        &self,
        run_id: &str,
        reason: Option<&str>,
    ) -> Result<RunRecord, RunServiceError> {
        let record = self.registry.cancel(run_id, reason)?;
        if let Some(token) = self.cancellations.get(run_id) {
            token.cancel();
        }
        tracing::info!(run_id = %run_id, "Run cancelled");
        Ok(record)
    }

    /// Execute a run with the synchronous executor
    ///
    /// # Errors
    /// [`RunServiceError::Registry`] when the run cannot be started.
    /// Execution failures are recorded on the run, not returned.
    pub fn execute_run(
        &self,
        run_id: &str,
        request: &ExecuteRequest,
    ) -> Result<RunRecord, RunServiceError> {
        let mut hooks = self.begin(run_id)?;
        let params = self.config.fixpoint;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            execute_with_fixpoint_using(&self.executor, request, params, &mut hooks)
        }))
        .ok();
        self.finish(&hooks.run_id, outcome)
    }

    /// Execute a run with the session-backed executor
    ///
    /// # Errors
    /// As [`execute_run`](Self::execute_run).
    pub async fn execute_run_async(
        &self,
        run_id: &str,
        request: &ExecuteRequest,
    ) -> Result<RunRecord, RunServiceError> {
        let mut hooks = self.begin(run_id)?;
        let run_id = hooks.run_id.clone();
        let executor = self.session_executor.clone();
        let request = request.clone();
        let params = self.config.fixpoint;

        let task = tokio::spawn(async move {
            let cancel = hooks.cancel.clone();
            execute_with_fixpoint_async(&executor, &request, params, &mut hooks, &cancel).await
        });
        let outcome = match task.await {
            Ok(outcome) => Some(outcome),
            Err(err) => {
                tracing::error!(run_id = %run_id, error = %err, "Execution task failed");
                None
            }
        };
        self.finish(&run_id, outcome)
    }

    /// Invoke a registered tool with the configured timeout
    pub async fn execute_tool(&self, request: &ToolRequest, trace_id: Option<String>) -> ToolExecution {
        let options = ToolOptions {
            timeout: Some(self.config.tool_timeout()),
            request_id: None,
            trace_id,
        };
        execute_tool(&self.tools, request, &options).await
    }

    fn begin(&self, run_id: &str) -> Result<RestoreHook, RunServiceError> {
        let running = self.registry.start(run_id)?;
        self.checkpoints.save_valid(&running.run_id, &running);

        let cancel = CancellationToken::new();
        self.cancellations
            .insert(running.run_id.clone(), cancel.clone());

        Ok(RestoreHook {
            registry: Arc::clone(&self.registry),
            checkpoints: Arc::clone(&self.checkpoints),
            run_id: running.run_id,
            cancel,
        })
    }

    fn finish(
        &self,
        run_id: &RunId,
        outcome: Option<FixpointOutcome>,
    ) -> Result<RunRecord, RunServiceError> {
        self.checkpoints.discard(run_id);
        self.cancellations.remove(run_id);

        let transition = match outcome {
            Some(outcome) if outcome.is_completed() => {
                tracing::info!(
                    run_id = %run_id,
                    iterations = outcome.iterations_used,
                    "Run converged"
                );
                match run_output(&outcome) {
                    Ok(output) => self.registry.complete(run_id.as_str(), Some(output)),
                    Err(err) => {
                        tracing::error!(run_id = %run_id, error = %err, "Run output encoding failed");
                        self.registry.fail(run_id.as_str(), unhandled())
                    }
                }
            }
            Some(outcome) => {
                let error = RunError::new(
                    outcome.last_error_code.unwrap_or(ErrorCode::InternalError),
                    outcome
                        .last_error_message
                        .unwrap_or_else(|| "Execution failed".to_owned()),
                );
                tracing::warn!(
                    run_id = %run_id,
                    iterations = outcome.iterations_used,
                    error_code = %error.code,
                    "Run failed"
                );
                self.registry.fail(run_id.as_str(), error)
            }
            None => self.registry.fail(run_id.as_str(), unhandled()),
        };

        match transition {
            Ok(record) => Ok(record),
            Err(RegistryError::InvalidTransition {
                from: RunStatus::Cancelled,
                ..
            }) => self
                .registry
                .get(run_id.as_str())
                .ok_or_else(|| RunServiceError::from(RegistryError::NotFound(run_id.clone()))),
            Err(err) => Err(err.into()),
        }
    }
}

fn unhandled() -> RunError {
    RunError::new(ErrorCode::InternalError, UNHANDLED_MESSAGE)
}

fn run_output(outcome: &FixpointOutcome) -> Result<JsonObject, serde_json::Error> {
    let mut metrics = JsonObject::new();
    metrics.insert(
        "fixpointIterations".into(),
        Value::from(outcome.iterations_used),
    );
    metrics.insert(
        "backoffScheduleMs".into(),
        serde_json::to_value(&outcome.backoff_schedule_ms)?,
    );

    let mut output = JsonObject::new();
    output.insert("execution".into(), serde_json::to_value(&outcome.execution)?);
    output.insert("metrics".into(), Value::Object(metrics));
    Ok(output)
}

/// Rolls the run back to its checkpoint between attempts
///
/// The restore is the only write, so the record never carries an
/// intermediate attempt error.
struct RestoreHook {
    registry: Arc<RunRegistry>,
    checkpoints: Arc<dyn CheckpointStore>,
    run_id: RunId,
    cancel: CancellationToken,
}

impl FixpointHooks for RestoreHook {
    fn before_retry(&mut self, attempt: u32, error: &DeterministicError) -> ControlFlow<()> {
        if self.cancel.is_cancelled() {
            return ControlFlow::Break(());
        }

        let Some(snapshot) = self.checkpoints.load_latest_valid(&self.run_id) else {
            tracing::warn!(run_id = %self.run_id, attempt, "No checkpoint to restore");
            return ControlFlow::Continue(());
        };
        if self.registry.restore_if_active(&snapshot).is_none() {
            return ControlFlow::Break(());
        }

        tracing::debug!(
            run_id = %self.run_id,
            attempt,
            error_code = %error.code,
            "Checkpoint restored after failed attempt"
        );
        ControlFlow::Continue(())
    }
}
