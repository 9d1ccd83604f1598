//! Replay verification
//!
//! Re-executes a plan in `mock` mode and compares the fresh result with a
//! recorded one. Checks run in a fixed order and the first mismatch is the
//! reported reason.

use crate::error::{DeterministicError, ErrorCode};
use crate::executor::{ExecuteOptions, Executor};
use crate::plan::{AgentExecutionResult, ExecutionMode};
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use serde_json::Value;
use std::fmt::{self, Display, Formatter};

/// Extra step budget granted on top of the recorded request count
pub const REPLAY_BUDGET_HEADROOM: usize = 10;

/// Individual check outcomes of a successful replay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayChecks {
    pub trace_schema_version_match: bool,
    pub plan_hash_match: bool,
    pub execution_hash_match: bool,
    pub final_trace_link_hash_match: bool,
    pub trace_length_match: bool,
    pub final_state_match: bool,
}

impl ReplayChecks {
    const ALL_PASSED: Self = Self {
        trace_schema_version_match: true,
        plan_hash_match: true,
        execution_hash_match: true,
        final_trace_link_hash_match: true,
        trace_length_match: true,
        final_state_match: true,
    };
}

/// First divergence between replay and record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayMismatch {
    TraceSchemaVersion,
    PlanHash,
    ExecutionHash,
    FinalTraceLinkHash,
    TraceLength,
    FinalState,
    /// The re-execution itself failed
    ExecutionFailed { code: ErrorCode, message: String },
}

impl Display for ReplayMismatch {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::TraceSchemaVersion => f.write_str("traceSchemaVersion mismatch"),
            Self::PlanHash => f.write_str("planHash mismatch"),
            Self::ExecutionHash => f.write_str("executionHash mismatch"),
            Self::FinalTraceLinkHash => f.write_str("finalTraceLinkHash mismatch"),
            Self::TraceLength => f.write_str("trace length mismatch"),
            Self::FinalState => f.write_str("finalState mismatch"),
            Self::ExecutionFailed { code, message } => {
                write!(f, "Replay execution failed: {code} / {message}")
            }
        }
    }
}

impl From<DeterministicError> for ReplayMismatch {
    fn from(err: DeterministicError) -> Self {
        Self::ExecutionFailed {
            code: err.code,
            message: err.message,
        }
    }
}

/// Replay outcome
///
/// Serializes as `{ "ok": true, "checks": {...} }` or
/// `{ "ok": false, "reason": "..." }`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayVerification {
    Verified(ReplayChecks),
    Mismatch(ReplayMismatch),
}

impl ReplayVerification {
    /// Check if the replay matched
    #[inline]
    #[must_use]
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Verified(_))
    }

    /// Mismatch reason, if any
    #[must_use]
    pub fn reason(&self) -> Option<&ReplayMismatch> {
        match self {
            Self::Mismatch(reason) => Some(reason),
            Self::Verified(_) => None,
        }
    }
}

impl Serialize for ReplayVerification {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut out = serializer.serialize_struct("ReplayVerification", 2)?;
        match self {
            Self::Verified(checks) => {
                out.serialize_field("ok", &true)?;
                out.serialize_field("checks", checks)?;
            }
            Self::Mismatch(reason) => {
                out.serialize_field("ok", &false)?;
                out.serialize_field("reason", &reason.to_string())?;
            }
        }
        out.end()
    }
}

/// Replays recorded executions against an executor
#[derive(Debug, Clone, Default)]
pub struct ReplayVerifier {
    executor: Executor,
}

impl ReplayVerifier {
    /// Verifier over the default mock executor
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Verifier over a specific executor
    #[must_use]
    pub fn with_executor(executor: Executor) -> Self {
        Self { executor }
    }

    /// Re-execute `raw` and compare with `recorded`
    pub fn verify(&self, raw: &Value, recorded: &AgentExecutionResult) -> ReplayVerification {
        let max_steps = recorded
            .steps_requested
            .saturating_add(REPLAY_BUDGET_HEADROOM)
            .max(1);
        let options = ExecuteOptions::default()
            .with_mode(ExecutionMode::Mock)
            .with_max_steps(i64::try_from(max_steps).unwrap_or(i64::MAX));

        let fresh = match self.executor.execute(raw, &options) {
            Ok(fresh) => fresh,
            Err(err) => return ReplayVerification::Mismatch(err.into()),
        };

        match first_mismatch(&fresh, recorded) {
            Some(mismatch) => {
                tracing::warn!(plan_id = %recorded.plan_id, reason = %mismatch, "Replay mismatch");
                ReplayVerification::Mismatch(mismatch)
            }
            None => ReplayVerification::Verified(ReplayChecks::ALL_PASSED),
        }
    }
}

fn first_mismatch(
    fresh: &AgentExecutionResult,
    recorded: &AgentExecutionResult,
) -> Option<ReplayMismatch> {
    if fresh.trace_schema_version != recorded.trace_schema_version {
        Some(ReplayMismatch::TraceSchemaVersion)
    } else if fresh.plan_hash != recorded.plan_hash {
        Some(ReplayMismatch::PlanHash)
    } else if fresh.execution_hash != recorded.execution_hash {
        Some(ReplayMismatch::ExecutionHash)
    } else if fresh.final_trace_link_hash != recorded.final_trace_link_hash {
        Some(ReplayMismatch::FinalTraceLinkHash)
    } else if fresh.trace.len() != recorded.trace.len() {
        Some(ReplayMismatch::TraceLength)
    } else if fresh.final_state != recorded.final_state {
        Some(ReplayMismatch::FinalState)
    } else {
        None
    }
}

/// Replay with the default mock executor
pub fn verify_execution_replay(raw: &Value, recorded: &AgentExecutionResult) -> ReplayVerification {
    ReplayVerifier::new().verify(raw, recorded)
}
