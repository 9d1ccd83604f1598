//! DAR Runs - run lifecycle and self-healing execution
//!
//! Layers on top of `dar-kernel`:
//! - Tracks runs through `created -> running -> completed|failed|cancelled`
//! - Checkpoints the last valid run record
//! - Retries retryable failures in a bounded fixpoint loop, restoring the
//!   checkpoint between attempts
//! - Loads runtime configuration from TOML
//!
//! # Example
//!
//! ```rust,ignore
//! use dar_runs::prelude::*;
//!
//! let service = RunService::new(RuntimeConfig::default());
//! let run = service.create_run(CreateRunRequest::new("agent-1"));
//!
//! let request = ExecuteRequest::new(plan_json).with_max_steps(10);
//! let record = service.execute_run(run.run_id.as_str(), &request)?;
//! assert_eq!(record.status, RunStatus::Completed);
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod fixpoint;
pub mod registry;
pub mod service;
pub mod types;

pub use checkpoint::{CheckpointStore, InMemoryCheckpointStore};
pub use config::RuntimeConfig;
pub use error::{ConfigError, RegistryError, RunServiceError};
pub use fixpoint::{
    backoff_ms, execute_with_fixpoint, execute_with_fixpoint_async, execute_with_fixpoint_using,
    FixpointHooks, FixpointOutcome, FixpointParams, FixpointStatus, FixpointTracker,
};
pub use registry::RunRegistry;
pub use service::RunService;
pub use types::{
    CreateRunRequest, ExecuteRequest, JsonObject, RunError, RunId, RunRecord, RunStatus,
};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with DAR runs
    pub use crate::{
        CheckpointStore, CreateRunRequest, ExecuteRequest, FixpointOutcome, FixpointParams,
        FixpointStatus, InMemoryCheckpointStore, RunRecord, RunRegistry, RunService, RunStatus,
        RuntimeConfig,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
