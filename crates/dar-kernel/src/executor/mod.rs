//! Deterministic plan execution
//!
//! The pipeline is fixed:
//! 1. reject a non-positive step budget
//! 2. policy validation, then canonicalization
//! 3. plan hash, then the up-front budget check
//! 4. apply each step in order while extending the trace chain
//! 5. execution hash over the final link and final state
//!
//! The executor never retries. A failed step aborts the whole execution and
//! no partial result leaves this module.

pub mod session;

use crate::applier::{MockApplier, StepApplier};
use crate::canonical::canonicalize;
use crate::error::{DeterministicError, ErrorCode, StepError};
use crate::hash::{plan_hash, state_hash_like, HashError};
use crate::plan::{AgentExecutionResult, AgentState, ExecutionMode, Plan, Step};
use crate::policy::validate_plan;
use crate::response::{DeterministicResponse, ResponseMeta};
use crate::trace::{execution_hash, ExecutionHashInput, TraceChain, TRACE_SCHEMA_VERSION};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub use session::SessionExecutor;

/// Step budget used when the caller does not supply one
pub const DEFAULT_MAX_STEPS: i64 = 100;

/// Per-execution options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecuteOptions {
    pub mode: ExecutionMode,
    /// Step budget; signed so that out-of-contract budgets are representable
    pub max_steps: i64,
    /// Correlation id; step events are only emitted when present
    pub trace_id: Option<String>,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Mock,
            max_steps: DEFAULT_MAX_STEPS,
            trace_id: None,
        }
    }
}

impl ExecuteOptions {
    /// Set execution mode
    #[must_use]
    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set step budget
    #[must_use]
    pub fn with_max_steps(mut self, max_steps: i64) -> Self {
        self.max_steps = max_steps;
        self
    }

    /// Set trace id
    #[must_use]
    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    fn meta(&self) -> ResponseMeta {
        ResponseMeta::new(self.mode, self.trace_id.clone())
    }
}

/// Failure plus the number of steps applied before it
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ExecutionFailure {
    pub(crate) error: DeterministicError,
    pub(crate) step_count: Option<usize>,
}

impl ExecutionFailure {
    fn before_execution(error: DeterministicError) -> Self {
        Self {
            error,
            step_count: None,
        }
    }

    pub(crate) fn at_step(index: usize, error: DeterministicError) -> Self {
        Self {
            error,
            step_count: Some(index),
        }
    }

    pub(crate) fn into_response<T>(self, options: &ExecuteOptions) -> DeterministicResponse<T> {
        let mut meta = options.meta();
        meta.step_count = self.step_count;
        DeterministicResponse::Failure {
            error: self.error,
            meta,
        }
    }
}

impl From<HashError> for ExecutionFailure {
    fn from(err: HashError) -> Self {
        Self::before_execution(DeterministicError::internal(err.to_string()))
    }
}

/// Validated, canonical plan ready to run
#[derive(Debug, Clone)]
pub(crate) struct PreparedPlan {
    pub(crate) plan: Plan,
    pub(crate) plan_hash: String,
}

/// Steps 1 to 3 of the pipeline
pub(crate) fn prepare(raw: &Value, options: &ExecuteOptions) -> Result<PreparedPlan, ExecutionFailure> {
    if options.max_steps <= 0 {
        return Err(ExecutionFailure::before_execution(
            DeterministicError::invalid_request("maxSteps must be a positive integer"),
        ));
    }

    if let Err(err) = validate_plan(raw) {
        let codes: Vec<&str> = err.codes().into_iter().map(|c| c.as_str()).collect();
        return Err(ExecutionFailure::before_execution(
            DeterministicError::invalid_request(format!(
                "Plan validation failed: {}",
                codes.join(", ")
            )),
        ));
    }

    let plan = canonicalize(raw).map_err(|err| {
        ExecutionFailure::before_execution(DeterministicError::invalid_request(format!(
            "Plan canonicalization failed: {err}"
        )))
    })?;
    let plan_hash = plan_hash(&plan)?;

    let over_budget = i64::try_from(plan.steps.len()).map_or(true, |n| n > options.max_steps);
    if over_budget {
        tracing::warn!(
            plan_id = %plan.plan_id,
            steps = plan.steps.len(),
            max_steps = options.max_steps,
            "Plan exceeds step budget"
        );
        return Err(ExecutionFailure::at_step(
            0,
            DeterministicError::new(
                ErrorCode::ExecutionConvergenceFailed,
                "Plan exceeds maxSteps bound",
            ),
        ));
    }

    tracing::debug!(
        plan_id = %plan.plan_id,
        plan_hash = %plan_hash,
        steps = plan.steps.len(),
        "Executing plan"
    );
    Ok(PreparedPlan { plan, plan_hash })
}

/// Step 5 of the pipeline
pub(crate) fn finish(
    prepared: PreparedPlan,
    chain: TraceChain,
    final_state: AgentState,
) -> Result<AgentExecutionResult, ExecutionFailure> {
    let PreparedPlan { plan, plan_hash } = prepared;
    let step_count = plan.steps.len();
    let final_trace_link_hash = chain.final_link().to_owned();
    let execution_hash = execution_hash(&ExecutionHashInput {
        plan_hash: &plan_hash,
        step_count,
        final_trace_link_hash: &final_trace_link_hash,
        final_state: &final_state,
    })?;
    let trace = chain.into_entries();

    tracing::info!(
        plan_id = %plan.plan_id,
        execution_hash = %execution_hash,
        steps = step_count,
        "Plan converged"
    );

    Ok(AgentExecutionResult {
        plan_id: plan.plan_id,
        plan_hash,
        execution_hash,
        final_trace_link_hash,
        trace_schema_version: TRACE_SCHEMA_VERSION,
        steps_requested: step_count,
        steps_executed: trace.len(),
        converged: true,
        final_state,
        trace,
    })
}

/// Hash and append one applied step
pub(crate) fn record_step(
    chain: &mut TraceChain,
    index: usize,
    step: &Step,
    before: &AgentState,
    after: &AgentState,
) -> Result<(), ExecutionFailure> {
    chain
        .record(
            step,
            before,
            after,
            state_hash_like(before),
            state_hash_like(after),
        )
        .map(|_| ())
        .map_err(|err| ExecutionFailure::at_step(index, DeterministicError::internal(err.to_string())))
}

/// Event context for one step
pub(crate) struct StepEvent<'a> {
    pub(crate) trace_id: Option<&'a str>,
    pub(crate) plan_id: &'a str,
    pub(crate) index: usize,
    pub(crate) step: &'a Step,
    pub(crate) started: Instant,
}

impl StepEvent<'_> {
    /// Emit `step.end`; skipped without a trace id
    pub(crate) fn end(&self, outcome: Result<(), &DeterministicError>) {
        let Some(trace_id) = self.trace_id else {
            return;
        };
        let duration_ms = duration_ms(self.started.elapsed());
        match outcome {
            Ok(()) => tracing::info!(
                target: "dar::step",
                event = "step.end",
                trace_id,
                plan_id = self.plan_id,
                step_index = self.index,
                step_id = %self.step.id,
                kind = %self.step.kind(),
                duration_ms,
                ok = true,
            ),
            Err(err) => tracing::warn!(
                target: "dar::step",
                event = "step.end",
                trace_id,
                plan_id = self.plan_id,
                step_index = self.index,
                step_id = %self.step.id,
                kind = %self.step.kind(),
                duration_ms,
                ok = false,
                error_code = %err.code,
                error_message = %err.message,
            ),
        }
    }

    /// Emit the failure event and build the matching failure
    pub(crate) fn fail(&self, err: StepError) -> ExecutionFailure {
        let error = DeterministicError::from(err);
        self.end(Err(&error));
        ExecutionFailure::at_step(self.index, error)
    }
}

/// Synchronous deterministic executor
///
/// Stateless apart from its applier; safe to share across threads and to
/// call concurrently for different plans.
#[derive(Clone)]
pub struct Executor {
    applier: Arc<dyn StepApplier>,
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor").finish_non_exhaustive()
    }
}

impl Executor {
    /// Executor backed by [`MockApplier`]
    #[must_use]
    pub fn new() -> Self {
        Self {
            applier: Arc::new(MockApplier),
        }
    }

    /// Executor backed by a custom applier
    pub fn with_applier(applier: Arc<dyn StepApplier>) -> Self {
        Self { applier }
    }

    /// Execute a raw JSON plan
    ///
    /// # Errors
    /// - `INVALID_REQUEST` for a bad budget, policy violation or
    ///   canonicalization failure
    /// - `EXECUTION_CONVERGENCE_FAILED` when the plan exceeds the budget
    /// - the step's classified code (normally retryable `INTERNAL_ERROR`)
    ///   when a step cannot be applied
    pub fn execute(
        &self,
        raw: &Value,
        options: &ExecuteOptions,
    ) -> Result<AgentExecutionResult, DeterministicError> {
        self.run(raw, options).map_err(|f| f.error)
    }

    /// Execute a typed plan
    ///
    /// # Errors
    /// As [`execute`](Self::execute).
    pub fn execute_plan(
        &self,
        plan: &Plan,
        options: &ExecuteOptions,
    ) -> Result<AgentExecutionResult, DeterministicError> {
        self.execute(&plan.to_value(), options)
    }

    /// Execute and wrap the outcome in a response envelope
    pub fn execute_deterministic_plan(
        &self,
        raw: &Value,
        options: &ExecuteOptions,
    ) -> DeterministicResponse<AgentExecutionResult> {
        match self.run(raw, options) {
            Ok(result) => DeterministicResponse::Success {
                meta: options.meta().with_step_count(result.steps_executed),
                result,
            },
            Err(failure) => failure.into_response(options),
        }
    }

    fn run(
        &self,
        raw: &Value,
        options: &ExecuteOptions,
    ) -> Result<AgentExecutionResult, ExecutionFailure> {
        let prepared = prepare(raw, options)?;
        let mut state = AgentState::new();
        let mut chain = TraceChain::new();

        for (index, step) in prepared.plan.steps.iter().enumerate() {
            let event = StepEvent {
                trace_id: options.trace_id.as_deref(),
                plan_id: &prepared.plan.plan_id,
                index,
                step,
                started: Instant::now(),
            };
            let next = self
                .applier
                .apply(&state, step)
                .map_err(|err| event.fail(err))?;
            record_step(&mut chain, index, step, &state, &next)?;
            event.end(Ok(()));
            state = next;
        }

        finish(prepared, chain, state)
    }
}

/// Execute a raw plan with the default executor and wrap the outcome
pub fn execute_deterministic_plan(
    raw: &Value,
    options: &ExecuteOptions,
) -> DeterministicResponse<AgentExecutionResult> {
    Executor::new().execute_deterministic_plan(raw, options)
}

/// Milliseconds of a duration, saturating
#[inline]
pub(crate) fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::MAX_SAFE_INTEGER;
    use crate::trace::{verify_trace_chain, GENESIS_TRACE_LINK};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn p1() -> Value {
        json!({
            "planId": "p1",
            "version": 1,
            "steps": [
                { "id": "a", "kind": "set", "key": "k", "value": "v" },
                { "id": "b", "kind": "increment", "key": "n", "value": 2 }
            ]
        })
    }

    fn opts(max_steps: i64) -> ExecuteOptions {
        ExecuteOptions::default().with_max_steps(max_steps)
    }

    struct FailingApplier;

    impl StepApplier for FailingApplier {
        fn apply(&self, _state: &AgentState, step: &Step) -> Result<AgentState, StepError> {
            Err(StepError::Failed(format!("cannot apply {}", step.id)))
        }
    }

    #[test]
    fn p1_scenario() {
        let executor = Executor::new();
        let first = executor.execute(&p1(), &opts(10)).unwrap();
        let second = executor.execute(&p1(), &opts(10)).unwrap();

        assert!(first.plan_hash.starts_with("ph"));
        assert!(first.execution_hash.starts_with("eh"));
        assert_eq!(first.plan_hash, second.plan_hash);
        assert_eq!(first.execution_hash, second.execution_hash);
        assert_eq!(first.final_trace_link_hash, second.final_trace_link_hash);
        assert_eq!(first.trace.len(), 2);
        assert!(first.converged);
        assert_eq!(first.steps_requested, 2);
        assert_eq!(first.steps_executed, 2);
        assert_eq!(
            first.final_state,
            AgentState {
                counters: BTreeMap::from([("n".to_owned(), 2)]),
                values: BTreeMap::from([("k".to_owned(), "v".to_owned())]),
                logs: Vec::new(),
            }
        );
        assert_eq!(first.trace[0].previous_trace_link_hash, GENESIS_TRACE_LINK);
        assert!(verify_trace_chain(&first.trace).is_ok());
    }

    #[test]
    fn rejects_non_positive_budget() {
        for max_steps in [0, -1] {
            let err = Executor::new().execute(&p1(), &opts(max_steps)).unwrap_err();
            assert_eq!(err.code, ErrorCode::InvalidRequest);
            assert_eq!(err.message, "maxSteps must be a positive integer");
            assert!(!err.retryable);
        }
    }

    #[test]
    fn budget_is_checked_up_front() {
        let response = Executor::new().execute_deterministic_plan(&p1(), &opts(1));
        let DeterministicResponse::Failure { error, meta } = response else {
            panic!("expected failure");
        };
        assert_eq!(error.code, ErrorCode::ExecutionConvergenceFailed);
        assert_eq!(error.message, "Plan exceeds maxSteps bound");
        assert!(!error.retryable);
        assert_eq!(meta.step_count, Some(0));
    }

    #[test]
    fn policy_failure_names_codes() {
        let raw = json!({ "planId": "", "version": 1, "steps": [] });
        let err = Executor::new().execute(&raw, &opts(10)).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidRequest);
        assert_eq!(
            err.message,
            "Plan validation failed: INVALID_PLAN_ID, EMPTY_PLAN"
        );
    }

    #[test]
    fn canonicalization_failure() {
        let raw = json!({
            "planId": "p",
            "version": 1,
            "steps": [{ "id": "a", "kind": "set", "key": "k", "value": "v", "extra": 1 }]
        });
        let err = Executor::new().execute(&raw, &opts(10)).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidRequest);
        assert_eq!(
            err.message,
            "Plan canonicalization failed: steps[0] contains unsupported fields: extra"
        );
    }

    #[test]
    fn unsafe_increment_is_rejected_before_execution() {
        let raw = json!({
            "planId": "p",
            "version": 1,
            "steps": [{ "id": "a", "kind": "increment", "key": "n", "value": MAX_SAFE_INTEGER + 1 }]
        });
        let err = Executor::new().execute(&raw, &opts(10)).unwrap_err();
        assert!(err.message.starts_with("Plan canonicalization failed"));
    }

    #[test]
    fn step_failure_is_retryable_internal_error() {
        let executor = Executor::with_applier(Arc::new(FailingApplier));
        let response = executor.execute_deterministic_plan(&p1(), &opts(10).with_trace_id("t-1"));
        let DeterministicResponse::Failure { error, meta } = response else {
            panic!("expected failure");
        };
        assert_eq!(error.code, ErrorCode::InternalError);
        assert!(error.retryable);
        assert_eq!(error.message, "cannot apply a");
        assert_eq!(meta.step_count, Some(0));
        assert_eq!(meta.trace_id.as_deref(), Some("t-1"));
    }

    #[test]
    fn success_envelope_meta() {
        let response = execute_deterministic_plan(&p1(), &opts(10).with_trace_id("t-2"));
        assert!(response.is_ok());
        assert_eq!(
            response.meta(),
            &ResponseMeta {
                mode: ExecutionMode::Mock,
                step_count: Some(2),
                trace_id: Some("t-2".into()),
            }
        );
    }

    #[test]
    fn typed_and_raw_plans_agree() {
        let plan = Plan::new("p1", vec![Step::set("a", "k", "v"), Step::increment("b", "n", 2)]);
        let typed = Executor::new().execute_plan(&plan, &opts(10)).unwrap();
        let raw = Executor::new().execute(&p1(), &opts(10)).unwrap();
        assert_eq!(typed, raw);
    }

    #[test]
    fn accumulated_unsafe_counter_is_dropped_from_hash_view() {
        let big = json!({
            "planId": "p",
            "version": 1,
            "steps": [
                { "id": "a", "kind": "increment", "key": "n", "value": MAX_SAFE_INTEGER },
                { "id": "b", "kind": "increment", "key": "n", "value": MAX_SAFE_INTEGER }
            ]
        });
        let result = Executor::new().execute(&big, &opts(10)).unwrap();
        assert_eq!(result.final_state.counters["n"], 2 * MAX_SAFE_INTEGER);

        let view = crate::hash::normalized_state_view(&result.final_state);
        assert_eq!(view["counters"], json!({}));

        let without_n = crate::trace::execution_hash(&crate::trace::ExecutionHashInput {
            plan_hash: &result.plan_hash,
            step_count: result.steps_executed,
            final_trace_link_hash: &result.final_trace_link_hash,
            final_state: &AgentState::new(),
        })
        .unwrap();
        assert_eq!(result.execution_hash, without_n);
    }

    #[test]
    fn duration_ms_saturates() {
        assert_eq!(duration_ms(Duration::from_millis(12)), 12);
        assert_eq!(duration_ms(Duration::MAX), u64::MAX);
    }
}
