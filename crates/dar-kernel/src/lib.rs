//! DAR Kernel (dar-kernel)
//!
//! Deterministic agent execution:
//! 1. **Admission**: policy validation and canonicalization of raw plans
//! 2. **Execution**: steps applied in order against an [`AgentState`]
//! 3. **Evidence**: a hash-chained trace plus plan and execution hashes
//!
//! Any recorded result can be re-checked with [`replay::verify_execution_replay`].
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use dar_kernel::prelude::*;
//!
//! let raw = serde_json::json!({
//!     "planId": "p1",
//!     "version": 1,
//!     "steps": [{ "id": "a", "kind": "append_log", "value": "hello" }]
//! });
//!
//! let result = Executor::new().execute(&raw, &ExecuteOptions::default())?;
//! assert!(verify_execution_replay(&raw, &result).is_ok());
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod applier;
pub mod canonical;
pub mod error;
pub mod executor;
pub mod hash;
pub mod plan;
pub mod policy;
pub mod replay;
pub mod response;
pub mod sandbox;
pub mod tools;
pub mod trace;

pub use error::{DeterministicError, ErrorCode, IssueCode, StepError, ValidationError, ValidationIssue};
pub use plan::{
    AgentExecutionResult, AgentState, ExecutionMode, Plan, Step, StepAction, StepKind, StepTrace,
};

/// Common imports
pub mod prelude {
    pub use crate::applier::{MockApplier, StepApplier};
    pub use crate::canonical::{canonicalize, to_canonical_json};
    pub use crate::error::{DeterministicError, ErrorCode, StepError, ValidationError};
    pub use crate::executor::{
        execute_deterministic_plan, ExecuteOptions, Executor, SessionExecutor,
    };
    pub use crate::hash::plan_hash;
    pub use crate::plan::{
        AgentExecutionResult, AgentState, ExecutionMode, Plan, Step, StepAction, StepKind,
    };
    pub use crate::policy::validate_plan;
    pub use crate::replay::{verify_execution_replay, ReplayVerification, ReplayVerifier};
    pub use crate::response::{DeterministicResponse, ResponseMeta};
    pub use crate::sandbox::{SandboxFactory, SandboxSession};
    pub use crate::tools::{execute_tool, ToolAdapter, ToolRegistry, ToolRequest};
    pub use crate::trace::verify_trace_chain;
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
