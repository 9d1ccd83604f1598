//! Session-backed asynchronous executor
//!
//! Same pipeline as [`Executor`](super::Executor), but in `local` mode sandbox
//! steps are delegated to live sessions from a [`SandboxFactory`]. Each session
//! call is a suspension point bounded by the step timeout and raced against
//! the caller's cancellation token. Sessions are closed and the factory shut
//! down on every exit path.

use super::{
    finish, prepare, record_step, DeterministicResponse, ExecuteOptions, ExecutionFailure,
    StepEvent,
};
use crate::applier::{MockApplier, StepApplier};
use crate::error::{DeterministicError, StepError};
use crate::hash::nfc;
use crate::plan::{AgentExecutionResult, AgentState, ExecutionMode, Step, StepAction, StepKind};
use crate::sandbox::{
    click_log_line, extract_log_line, open_log_line, type_log_line, SandboxFactory,
    SandboxOptions, SandboxResult, SandboxSession,
};
use crate::trace::TraceChain;
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Default bound on a single sandbox call
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(5);

type Sessions = BTreeMap<String, Box<dyn SandboxSession>>;

/// Asynchronous executor with sandbox session support
#[derive(Clone)]
pub struct SessionExecutor {
    factory: Option<Arc<dyn SandboxFactory>>,
    applier: Arc<dyn StepApplier>,
    step_timeout: Duration,
}

impl Default for SessionExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SessionExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionExecutor")
            .field("has_factory", &self.factory.is_some())
            .field("step_timeout", &self.step_timeout)
            .finish_non_exhaustive()
    }
}

impl SessionExecutor {
    /// Executor without a session provider
    #[must_use]
    pub fn new() -> Self {
        Self {
            factory: None,
            applier: Arc::new(MockApplier),
            step_timeout: DEFAULT_STEP_TIMEOUT,
        }
    }

    /// Set the session provider used in `local` mode
    #[must_use]
    pub fn with_factory(mut self, factory: Arc<dyn SandboxFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Set the applier used for core kinds and for `mock` mode
    #[must_use]
    pub fn with_applier(mut self, applier: Arc<dyn StepApplier>) -> Self {
        self.applier = applier;
        self
    }

    /// Set the bound on each sandbox call
    #[must_use]
    pub fn with_step_timeout(mut self, step_timeout: Duration) -> Self {
        self.step_timeout = step_timeout;
        self
    }

    /// Execute a raw plan
    ///
    /// # Errors
    /// As [`Executor::execute`](super::Executor::execute), plus:
    /// - provider `TIMEOUT`/`NETWORK_ERROR`/`OVERLOADED` keep their code
    /// - other provider failures become `INTERNAL_ERROR`
    /// - an expired step timeout becomes `TIMEOUT`
    /// - cancellation becomes `RUN_CANCELLED`
    pub async fn execute(
        &self,
        raw: &Value,
        options: &ExecuteOptions,
        cancel: &CancellationToken,
    ) -> Result<AgentExecutionResult, DeterministicError> {
        self.run(raw, options, cancel).await.map_err(|f| f.error)
    }

    /// Execute and wrap the outcome in a response envelope
    pub async fn execute_deterministic_plan(
        &self,
        raw: &Value,
        options: &ExecuteOptions,
        cancel: &CancellationToken,
    ) -> DeterministicResponse<AgentExecutionResult> {
        match self.run(raw, options, cancel).await {
            Ok(result) => DeterministicResponse::Success {
                meta: options.meta().with_step_count(result.steps_executed),
                result,
            },
            Err(failure) => failure.into_response(options),
        }
    }

    async fn run(
        &self,
        raw: &Value,
        options: &ExecuteOptions,
        cancel: &CancellationToken,
    ) -> Result<AgentExecutionResult, ExecutionFailure> {
        let prepared = match prepare(raw, options) {
            Ok(prepared) => prepared,
            Err(failure) => {
                self.shutdown_factory().await;
                return Err(failure);
            }
        };

        let needs_sessions = options.mode == ExecutionMode::Local
            && prepared.plan.steps.iter().any(|s| s.kind().is_sandbox());
        if needs_sessions && self.factory.is_none() {
            return Err(ExecutionFailure::at_step(
                0,
                DeterministicError::invalid_request(
                    "local mode sandbox steps require a sandbox factory",
                ),
            ));
        }

        let mut sessions = Sessions::new();
        let outcome = self
            .run_steps(&prepared.plan.steps, &prepared.plan.plan_id, options, cancel, &mut sessions)
            .await;

        for (session_id, mut session) in sessions {
            tracing::debug!(session_id = %session_id, "Closing sandbox session");
            if tokio::time::timeout(self.step_timeout, session.close()).await.is_err() {
                tracing::warn!(
                    session_id = %session_id,
                    timeout_ms = super::duration_ms(self.step_timeout),
                    "Sandbox session close timed out"
                );
            }
        }
        self.shutdown_factory().await;

        let (chain, state) = outcome?;
        finish(prepared, chain, state)
    }

    /// Teardown is bounded by the step timeout like any other session call
    async fn shutdown_factory(&self) {
        if let Some(factory) = &self.factory {
            if tokio::time::timeout(self.step_timeout, factory.shutdown()).await.is_err() {
                tracing::warn!(
                    timeout_ms = super::duration_ms(self.step_timeout),
                    "Sandbox factory shutdown timed out"
                );
            }
        }
    }

    async fn run_steps(
        &self,
        steps: &[Step],
        plan_id: &str,
        options: &ExecuteOptions,
        cancel: &CancellationToken,
        sessions: &mut Sessions,
    ) -> Result<(TraceChain, AgentState), ExecutionFailure> {
        let mut state = AgentState::new();
        let mut chain = TraceChain::new();

        for (index, step) in steps.iter().enumerate() {
            let event = StepEvent {
                trace_id: options.trace_id.as_deref(),
                plan_id,
                index,
                step,
                started: Instant::now(),
            };
            if cancel.is_cancelled() {
                return Err(event.fail(StepError::Cancelled));
            }

            let applied = if options.mode == ExecutionMode::Local && step.kind().is_sandbox() {
                self.apply_sandbox(&state, step, sessions, options, cancel)
                    .await
            } else {
                self.applier.apply(&state, step)
            };
            let next = applied.map_err(|err| event.fail(err))?;

            record_step(&mut chain, index, step, &state, &next)?;
            event.end(Ok(()));
            state = next;
        }
        Ok((chain, state))
    }

    async fn apply_sandbox(
        &self,
        state: &AgentState,
        step: &Step,
        sessions: &mut Sessions,
        options: &ExecuteOptions,
        cancel: &CancellationToken,
    ) -> Result<AgentState, StepError> {
        let factory = self
            .factory
            .as_ref()
            .ok_or_else(|| StepError::Failed("no sandbox factory configured".into()))?;
        let session_id = step.action.session_id().unwrap_or_default();
        let session = sessions.entry(session_id.to_owned()).or_insert_with(|| {
            tracing::debug!(session_id, "Creating sandbox session");
            factory.create(&SandboxOptions {
                session_id: session_id.to_owned(),
                trace_id: options.trace_id.clone(),
            })
        });

        let kind = step.kind();
        let mut next = state.clone();
        match &step.action {
            StepAction::SandboxOpen { session_id, url } => {
                self.guard(kind, cancel, session.open(url)).await?;
                next.logs.push(open_log_line(session_id, url));
            }
            StepAction::SandboxClick {
                session_id,
                selector,
            } => {
                self.guard(kind, cancel, session.click(selector)).await?;
                next.logs.push(click_log_line(session_id, selector));
            }
            StepAction::SandboxType {
                session_id,
                selector,
                text,
            } => {
                self.guard(kind, cancel, session.type_text(selector, text))
                    .await?;
                next.logs
                    .push(type_log_line(session_id, selector, text.chars().count()));
            }
            StepAction::SandboxExtract {
                session_id,
                selector,
                output_key,
            } => {
                let text = self.guard(kind, cancel, session.extract(selector)).await?;
                next.values.insert(output_key.clone(), nfc(&text));
                next.logs
                    .push(extract_log_line(session_id, selector, output_key));
            }
            StepAction::Set { .. } | StepAction::Increment { .. } | StepAction::AppendLog { .. } => {
                return self.applier.apply(state, step);
            }
        }
        Ok(next)
    }

    /// Bound one session call by the step timeout and the cancellation token
    async fn guard<T, F>(
        &self,
        kind: StepKind,
        cancel: &CancellationToken,
        call: F,
    ) -> Result<T, StepError>
    where
        F: Future<Output = SandboxResult<T>>,
    {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(StepError::Cancelled),
            outcome = tokio::time::timeout(self.step_timeout, call) => match outcome {
                Err(_elapsed) => Err(StepError::Timeout {
                    kind,
                    timeout_ms: super::duration_ms(self.step_timeout),
                }),
                Ok(Err(err)) => Err(StepError::Sandbox {
                    kind,
                    code: err.code,
                    message: err.message,
                }),
                Ok(Ok(value)) => Ok(value),
            },
        }
    }
}
