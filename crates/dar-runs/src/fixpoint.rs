//! Fixpoint retry orchestration
//!
//! Re-runs a plan until it converges, fails for good, or the iteration
//! budget runs out. Classification per attempt:
//! - success: `completed`
//! - `EXECUTION_CONVERGENCE_FAILED`: `terminal`
//! - any other non-retryable code: `failed`
//! - retryable code: record backoff, run the retry hook, try again
//!
//! Backoff is computed and recorded but never slept.

use crate::types::ExecuteRequest;
use dar_kernel::error::{DeterministicError, ErrorCode};
use dar_kernel::executor::{Executor, SessionExecutor};
use dar_kernel::plan::AgentExecutionResult;
use dar_kernel::response::DeterministicResponse;
use serde::{Deserialize, Serialize};
use std::ops::ControlFlow;
use tokio_util::sync::CancellationToken;

/// Retry budget and backoff curve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FixpointParams {
    pub max_iterations: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for FixpointParams {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            base_backoff_ms: 25,
            max_backoff_ms: 1000,
        }
    }
}

impl FixpointParams {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With iteration budget
    #[inline]
    #[must_use]
    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// With backoff base and cap
    #[inline]
    #[must_use]
    pub fn with_backoff(mut self, base_ms: u64, max_ms: u64) -> Self {
        self.base_backoff_ms = base_ms;
        self.max_backoff_ms = max_ms;
        self
    }
}

/// Final classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FixpointStatus {
    Completed,
    Failed,
    Terminal,
}

/// Result of a fixpoint loop
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FixpointOutcome {
    pub status: FixpointStatus,
    pub iterations_used: u32,
    pub backoff_schedule_ms: Vec<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error_code: Option<ErrorCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error_message: Option<String>,
    /// Successful envelope; only set when `completed`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution: Option<DeterministicResponse<AgentExecutionResult>>,
}

impl FixpointOutcome {
    #[inline]
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.status == FixpointStatus::Completed
    }
}

/// `min(base * 2^attempt, cap)`, saturating
#[must_use]
pub fn backoff_ms(attempt: u32, base_ms: u64, cap_ms: u64) -> u64 {
    let factor = 1_u64.checked_shl(attempt).unwrap_or(u64::MAX);
    base_ms.saturating_mul(factor).min(cap_ms)
}

/// Caller hooks around retries
pub trait FixpointHooks {
    /// Runs after a retryable failure, before the next attempt
    ///
    /// `attempt` is the zero-based index of the attempt that failed.
    /// Returning `Break` stops the loop with `RUN_CANCELLED`.
    fn before_retry(&mut self, attempt: u32, error: &DeterministicError) -> ControlFlow<()> {
        let _ = (attempt, error);
        ControlFlow::Continue(())
    }
}

impl FixpointHooks for () {}

/// What to do after an attempt
#[derive(Debug)]
pub enum Attempt {
    /// Loop is over
    Done(FixpointOutcome),
    /// Retryable failure, another attempt may follow
    Retry(DeterministicError),
}

/// Attempt-by-attempt fixpoint state machine
///
/// Shared by the synchronous and asynchronous drivers.
#[derive(Debug, Clone)]
pub struct FixpointTracker {
    params: FixpointParams,
    iterations: u32,
    schedule: Vec<u64>,
}

impl FixpointTracker {
    #[must_use]
    pub fn new(params: FixpointParams) -> Self {
        Self {
            params,
            iterations: 0,
            schedule: Vec::new(),
        }
    }

    /// Check if another attempt is allowed
    #[inline]
    #[must_use]
    pub fn has_budget(&self) -> bool {
        self.iterations < self.params.max_iterations
    }

    /// Attempts observed so far
    #[inline]
    #[must_use]
    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    /// Classify one attempt
    pub fn observe(&mut self, response: DeterministicResponse<AgentExecutionResult>) -> Attempt {
        let attempt = self.iterations;
        self.iterations += 1;

        let error = match response {
            DeterministicResponse::Success { .. } => {
                return Attempt::Done(self.outcome(FixpointStatus::Completed, None, Some(response)));
            }
            DeterministicResponse::Failure { error, .. } => error,
        };

        if !error.code.is_retryable() {
            let status = if error.code == ErrorCode::ExecutionConvergenceFailed {
                FixpointStatus::Terminal
            } else {
                FixpointStatus::Failed
            };
            return Attempt::Done(self.outcome(status, Some(error), None));
        }

        let delay = backoff_ms(attempt, self.params.base_backoff_ms, self.params.max_backoff_ms);
        tracing::warn!(
            attempt,
            backoff_ms = delay,
            error_code = %error.code,
            "Retryable attempt failure"
        );
        self.schedule.push(delay);
        Attempt::Retry(error)
    }

    /// Outcome when a hook stopped the loop
    #[must_use]
    pub fn cancelled(self) -> FixpointOutcome {
        let error = DeterministicError::new(ErrorCode::RunCancelled, "Run cancelled before retry");
        self.outcome(FixpointStatus::Failed, Some(error), None)
    }

    /// Outcome when the budget ran out
    #[must_use]
    pub fn exhausted(self) -> FixpointOutcome {
        let error = DeterministicError::new(
            ErrorCode::FixpointMaxIter,
            "Fixpoint did not converge within max iterations",
        );
        self.outcome(FixpointStatus::Terminal, Some(error), None)
    }

    fn outcome(
        &self,
        status: FixpointStatus,
        error: Option<DeterministicError>,
        execution: Option<DeterministicResponse<AgentExecutionResult>>,
    ) -> FixpointOutcome {
        let (last_error_code, last_error_message) = match error {
            Some(e) => (Some(e.code), Some(e.message)),
            None => (None, None),
        };
        FixpointOutcome {
            status,
            iterations_used: self.iterations,
            backoff_schedule_ms: self.schedule.clone(),
            last_error_code,
            last_error_message,
            execution,
        }
    }
}

/// Fixpoint loop over the default mock executor without hooks
#[must_use]
pub fn execute_with_fixpoint(request: &ExecuteRequest, params: FixpointParams) -> FixpointOutcome {
    execute_with_fixpoint_using(&Executor::new(), request, params, &mut ())
}

/// Fixpoint loop over a synchronous executor
pub fn execute_with_fixpoint_using<H: FixpointHooks + ?Sized>(
    executor: &Executor,
    request: &ExecuteRequest,
    params: FixpointParams,
    hooks: &mut H,
) -> FixpointOutcome {
    let options = request.options();
    let mut tracker = FixpointTracker::new(params);

    while tracker.has_budget() {
        let response = executor.execute_deterministic_plan(&request.plan, &options);
        match tracker.observe(response) {
            Attempt::Done(outcome) => return outcome,
            Attempt::Retry(error) => {
                if hooks.before_retry(tracker.iterations() - 1, &error).is_break() {
                    return tracker.cancelled();
                }
            }
        }
    }
    tracker.exhausted()
}

/// Fixpoint loop over the session-backed executor
///
/// A cancelled token also stops the loop before the next attempt.
pub async fn execute_with_fixpoint_async<H: FixpointHooks + Send + ?Sized>(
    executor: &SessionExecutor,
    request: &ExecuteRequest,
    params: FixpointParams,
    hooks: &mut H,
    cancel: &CancellationToken,
) -> FixpointOutcome {
    let options = request.options();
    let mut tracker = FixpointTracker::new(params);

    while tracker.has_budget() {
        let response = executor
            .execute_deterministic_plan(&request.plan, &options, cancel)
            .await;
        match tracker.observe(response) {
            Attempt::Done(outcome) => return outcome,
            Attempt::Retry(error) => {
                if hooks.before_retry(tracker.iterations() - 1, &error).is_break()
                    || cancel.is_cancelled()
                {
                    return tracker.cancelled();
                }
            }
        }
    }
    tracker.exhausted()
}
