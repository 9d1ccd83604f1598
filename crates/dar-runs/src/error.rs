//! Error types for run orchestration
//!
//! - [`RegistryError`]: unknown run ids and illegal lifecycle transitions
//! - [`ConfigError`]: unreadable or out-of-range runtime configuration
//! - [`RunServiceError`]: what the run service reports to its caller

use crate::types::{RunId, RunStatus};
use dar_kernel::error::ErrorCode;

/// Run registry failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Run not found: {0}")]
    NotFound(RunId),

    #[error("Invalid transition: {from} -> {to}")]
    InvalidTransition { from: RunStatus, to: RunStatus },
}

impl RegistryError {
    /// Classified code
    #[inline]
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::InvalidTransition { .. } => ErrorCode::InvalidRunTransition,
        }
    }
}

/// Configuration failure
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config value `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Run service failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RunServiceError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl RunServiceError {
    /// Classified code
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Registry(err) => err.code(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_messages() {
        let err = RegistryError::InvalidTransition {
            from: RunStatus::Completed,
            to: RunStatus::Running,
        };
        assert_eq!(err.to_string(), "Invalid transition: completed -> running");
        assert_eq!(err.code(), ErrorCode::InvalidRunTransition);

        let err = RegistryError::NotFound(RunId::new("run_000042"));
        assert_eq!(err.to_string(), "Run not found: run_000042");
        assert_eq!(RunServiceError::from(err).code(), ErrorCode::NotFound);
    }
}
