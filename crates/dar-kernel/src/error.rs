//! Error types for the DAR kernel
//!
//! Three layers:
//! - [`ErrorCode`]: the machine-readable taxonomy shared by every boundary,
//!   including retryability and the transport status mapping
//! - [`DeterministicError`]: the structured failure carried by response envelopes
//! - Concern-specific errors ([`ValidationError`], [`StepError`]) that are
//!   classified into an [`ErrorCode`] before leaving the kernel

use crate::plan::StepKind;
use crate::sandbox::SandboxErrorCode;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// Error taxonomy shared by the executor, the run layer and tool invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Malformed or out-of-contract input
    InvalidRequest,
    /// Unparseable transport payload
    MalformedRequest,
    /// Step budget exhausted; the plan will never converge
    ExecutionConvergenceFailed,
    /// Unexpected failure while applying a step
    InternalError,
    /// Provider network failure
    NetworkError,
    /// Provider or step timeout
    Timeout,
    /// Provider overloaded
    Overloaded,
    /// Unknown run or resource
    NotFound,
    /// Unsupported transport method
    MethodNotAllowed,
    /// Illegal run lifecycle transition
    InvalidRunTransition,
    /// Run cancelled by the caller
    RunCancelled,
    /// Fixpoint loop exhausted its iteration budget
    FixpointMaxIter,
    /// Tool is not registered
    ToolNotFound,
    /// Tool exceeded its timeout
    ToolTimeout,
    /// Tool rejected its input
    ToolInvalidInput,
    /// Tool failed while executing
    ToolExecutionFailed,
}

impl ErrorCode {
    /// Wire representation (`INVALID_REQUEST`, ...)
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::MalformedRequest => "MALFORMED_REQUEST",
            Self::ExecutionConvergenceFailed => "EXECUTION_CONVERGENCE_FAILED",
            Self::InternalError => "INTERNAL_ERROR",
            Self::NetworkError => "NETWORK_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::Overloaded => "OVERLOADED",
            Self::NotFound => "NOT_FOUND",
            Self::MethodNotAllowed => "METHOD_NOT_ALLOWED",
            Self::InvalidRunTransition => "INVALID_RUN_TRANSITION",
            Self::RunCancelled => "RUN_CANCELLED",
            Self::FixpointMaxIter => "FIXPOINT_MAX_ITER",
            Self::ToolNotFound => "TOOL_NOT_FOUND",
            Self::ToolTimeout => "TOOL_TIMEOUT",
            Self::ToolInvalidInput => "TOOL_INVALID_INPUT",
            Self::ToolExecutionFailed => "TOOL_EXECUTION_FAILED",
        }
    }

    /// Check if a failure with this code may succeed when attempted again
    ///
    /// Only transient classes are retryable: network, timeout, overload,
    /// internal errors and tool timeouts. Convergence failure is terminal.
    #[inline]
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::NetworkError
                | Self::Timeout
                | Self::Overloaded
                | Self::InternalError
                | Self::ToolTimeout
        )
    }

    /// HTTP status a transport layer should answer with
    #[must_use]
    pub const fn http_status(self) -> u16 {
        match self {
            Self::InvalidRequest | Self::MalformedRequest | Self::ToolInvalidInput => 400,
            Self::NotFound | Self::ToolNotFound => 404,
            Self::MethodNotAllowed => 405,
            Self::InvalidRunTransition => 409,
            Self::ExecutionConvergenceFailed => 422,
            _ => 500,
        }
    }
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured failure returned by the executor and carried in envelopes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct DeterministicError {
    /// Taxonomy code
    pub code: ErrorCode,
    /// Human-readable detail
    pub message: String,
    /// Whether the caller may retry
    pub retryable: bool,
}

impl DeterministicError {
    /// Create an error whose retryability follows its code
    #[inline]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retryable: code.is_retryable(),
        }
    }

    /// `INVALID_REQUEST` shorthand
    #[inline]
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message)
    }

    /// `INTERNAL_ERROR` shorthand
    #[inline]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }
}

/// Machine-readable validation issue codes
///
/// The first group is produced by canonicalization, the second by policy
/// validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueCode {
    ExpectedObject,
    ExpectedArray,
    ExpectedString,
    EmptyString,
    TooLong,
    InvalidUrl,
    NotInteger,
    UnsafeInteger,
    UnknownKind,
    UnsupportedFields,
    FieldNotAllowed,
    UnsupportedVersion,

    InvalidPlanId,
    UnsupportedPlanVersion,
    EmptyPlan,
    UndefinedStep,
    InvalidStepId,
    InvalidStepKey,
    InvalidStepValue,
    InvalidSandboxSession,
    InvalidSandboxUrl,
    InvalidSandboxSelector,
    InvalidSandboxText,
    InvalidSandboxOutputKey,
    DuplicateStepId,
}

impl IssueCode {
    /// Wire representation
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ExpectedObject => "EXPECTED_OBJECT",
            Self::ExpectedArray => "EXPECTED_ARRAY",
            Self::ExpectedString => "EXPECTED_STRING",
            Self::EmptyString => "EMPTY_STRING",
            Self::TooLong => "TOO_LONG",
            Self::InvalidUrl => "INVALID_URL",
            Self::NotInteger => "NOT_INTEGER",
            Self::UnsafeInteger => "UNSAFE_INTEGER",
            Self::UnknownKind => "UNKNOWN_KIND",
            Self::UnsupportedFields => "UNSUPPORTED_FIELDS",
            Self::FieldNotAllowed => "FIELD_NOT_ALLOWED",
            Self::UnsupportedVersion => "UNSUPPORTED_VERSION",
            Self::InvalidPlanId => "INVALID_PLAN_ID",
            Self::UnsupportedPlanVersion => "UNSUPPORTED_PLAN_VERSION",
            Self::EmptyPlan => "EMPTY_PLAN",
            Self::UndefinedStep => "UNDEFINED_STEP",
            Self::InvalidStepId => "INVALID_STEP_ID",
            Self::InvalidStepKey => "INVALID_STEP_KEY",
            Self::InvalidStepValue => "INVALID_STEP_VALUE",
            Self::InvalidSandboxSession => "INVALID_SANDBOX_SESSION",
            Self::InvalidSandboxUrl => "INVALID_SANDBOX_URL",
            Self::InvalidSandboxSelector => "INVALID_SANDBOX_SELECTOR",
            Self::InvalidSandboxText => "INVALID_SANDBOX_TEXT",
            Self::InvalidSandboxOutputKey => "INVALID_SANDBOX_OUTPUT_KEY",
            Self::DuplicateStepId => "DUPLICATE_STEP_ID",
        }
    }
}

impl Display for IssueCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single validation finding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    /// Issue code
    pub code: IssueCode,
    /// Location inside the plan (`plan.planId`, `steps[2].url`, ...)
    pub path: String,
    /// Human-readable message
    pub message: String,
}

impl ValidationIssue {
    /// Create new issue
    #[inline]
    pub fn new(code: IssueCode, path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            path: path.into(),
            message: message.into(),
        }
    }
}

impl Display for ValidationIssue {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Structural or semantic plan validation failure
///
/// Never empty: constructed only from at least one issue.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub struct ValidationError {
    issues: Vec<ValidationIssue>,
}

impl ValidationError {
    /// Build from collected issues; `None` when there is nothing to report
    #[must_use]
    pub fn from_issues(issues: Vec<ValidationIssue>) -> Option<Self> {
        if issues.is_empty() {
            None
        } else {
            Some(Self { issues })
        }
    }

    /// Single-issue error
    #[must_use]
    pub fn single(issue: ValidationIssue) -> Self {
        Self {
            issues: vec![issue],
        }
    }

    /// All issues, in discovery order
    #[inline]
    #[must_use]
    pub fn issues(&self) -> &[ValidationIssue] {
        &self.issues
    }

    /// Issue codes, in discovery order
    #[must_use]
    pub fn codes(&self) -> Vec<IssueCode> {
        self.issues.iter().map(|i| i.code).collect()
    }

    /// Check if any issue carries `code`
    #[must_use]
    pub fn has(&self, code: IssueCode) -> bool {
        self.issues.iter().any(|i| i.code == code)
    }
}

impl Display for ValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let messages: Vec<&str> = self.issues.iter().map(|i| i.message.as_str()).collect();
        f.write_str(&messages.join("; "))
    }
}

/// Failure while applying a single step
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StepError {
    /// Counter arithmetic left the `i64` range
    #[error("counter overflow on key '{key}'")]
    CounterOverflow { key: String },

    /// Sandbox provider reported a failure
    #[error("{kind} failed: {code}: {message}")]
    Sandbox {
        kind: StepKind,
        code: SandboxErrorCode,
        message: String,
    },

    /// Sandbox call did not finish within the step timeout
    #[error("{kind} timed out after {timeout_ms}ms")]
    Timeout { kind: StepKind, timeout_ms: u64 },

    /// Cancellation was requested at a suspension point
    #[error("step cancelled")]
    Cancelled,

    /// Any other applier failure
    #[error("{0}")]
    Failed(String),
}

impl StepError {
    /// Classify into the shared taxonomy
    #[must_use]
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::CounterOverflow { .. } | Self::Failed(_) => ErrorCode::InternalError,
            Self::Sandbox { code, .. } => match code {
                SandboxErrorCode::Timeout => ErrorCode::Timeout,
                SandboxErrorCode::NetworkError => ErrorCode::NetworkError,
                SandboxErrorCode::Overloaded => ErrorCode::Overloaded,
                SandboxErrorCode::AuthFailed
                | SandboxErrorCode::ParseFailed
                | SandboxErrorCode::InvalidRequest => ErrorCode::InternalError,
            },
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::Cancelled => ErrorCode::RunCancelled,
        }
    }
}

impl From<StepError> for DeterministicError {
    fn from(err: StepError) -> Self {
        Self::new(err.error_code(), err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classes() {
        for code in [
            ErrorCode::NetworkError,
            ErrorCode::Timeout,
            ErrorCode::Overloaded,
            ErrorCode::InternalError,
            ErrorCode::ToolTimeout,
        ] {
            assert!(code.is_retryable(), "{code} should be retryable");
        }
        for code in [
            ErrorCode::InvalidRequest,
            ErrorCode::ExecutionConvergenceFailed,
            ErrorCode::NotFound,
            ErrorCode::InvalidRunTransition,
            ErrorCode::ToolNotFound,
            ErrorCode::ToolInvalidInput,
            ErrorCode::ToolExecutionFailed,
            ErrorCode::RunCancelled,
        ] {
            assert!(!code.is_retryable(), "{code} should not be retryable");
        }
    }

    #[test]
    fn http_status_mapping() {
        assert_eq!(ErrorCode::InvalidRequest.http_status(), 400);
        assert_eq!(ErrorCode::MalformedRequest.http_status(), 400);
        assert_eq!(ErrorCode::NotFound.http_status(), 404);
        assert_eq!(ErrorCode::MethodNotAllowed.http_status(), 405);
        assert_eq!(ErrorCode::InvalidRunTransition.http_status(), 409);
        assert_eq!(ErrorCode::ExecutionConvergenceFailed.http_status(), 422);
        assert_eq!(ErrorCode::InternalError.http_status(), 500);
        assert_eq!(ErrorCode::Timeout.http_status(), 500);
    }

    #[test]
    fn error_code_wire_format() {
        let json = serde_json::to_string(&ErrorCode::ExecutionConvergenceFailed).unwrap();
        assert_eq!(json, "\"EXECUTION_CONVERGENCE_FAILED\"");
        assert_eq!(ErrorCode::FixpointMaxIter.to_string(), "FIXPOINT_MAX_ITER");
    }

    #[test]
    fn step_error_classification() {
        let timeout = StepError::Sandbox {
            kind: StepKind::SandboxOpen,
            code: SandboxErrorCode::Timeout,
            message: "slow".into(),
        };
        assert_eq!(timeout.error_code(), ErrorCode::Timeout);

        let auth = StepError::Sandbox {
            kind: StepKind::SandboxClick,
            code: SandboxErrorCode::AuthFailed,
            message: "denied".into(),
        };
        assert_eq!(auth.error_code(), ErrorCode::InternalError);

        let err: DeterministicError = StepError::Cancelled.into();
        assert_eq!(err.code, ErrorCode::RunCancelled);
        assert!(!err.retryable);
    }

    #[test]
    fn validation_error_requires_issues() {
        assert!(ValidationError::from_issues(Vec::new()).is_none());

        let err = ValidationError::single(ValidationIssue::new(
            IssueCode::EmptyPlan,
            "plan.steps",
            "Plan must contain at least one step",
        ));
        assert!(err.has(IssueCode::EmptyPlan));
        assert_eq!(err.codes(), vec![IssueCode::EmptyPlan]);
        assert_eq!(err.to_string(), "Plan must contain at least one step");
    }
}
