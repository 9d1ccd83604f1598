//! Runtime configuration
//!
//! Loaded from TOML; every field is optional and falls back to its default.
//!
//! ```toml
//! default_max_steps = 100
//! sandbox_step_timeout_ms = 5000
//! tool_timeout_ms = 1000
//!
//! [fixpoint]
//! maxIterations = 20
//! baseBackoffMs = 25
//! maxBackoffMs = 1000
//! ```

use crate::error::ConfigError;
use crate::fixpoint::FixpointParams;
use dar_kernel::executor::DEFAULT_MAX_STEPS;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Runtime configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Step budget for requests that do not carry one
    pub default_max_steps: i64,
    /// Retry budget and backoff curve
    pub fixpoint: FixpointParams,
    /// Bound on each sandbox call in `local` mode
    pub sandbox_step_timeout_ms: u64,
    /// Default per-call tool timeout
    pub tool_timeout_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            default_max_steps: DEFAULT_MAX_STEPS,
            fixpoint: FixpointParams::default(),
            sandbox_step_timeout_ms: 5000,
            tool_timeout_ms: 1000,
        }
    }
}

impl RuntimeConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With default step budget
    #[inline]
    #[must_use]
    pub fn with_default_max_steps(mut self, max_steps: i64) -> Self {
        self.default_max_steps = max_steps;
        self
    }

    /// With fixpoint parameters
    #[inline]
    #[must_use]
    pub fn with_fixpoint(mut self, fixpoint: FixpointParams) -> Self {
        self.fixpoint = fixpoint;
        self
    }

    /// With sandbox step timeout
    #[inline]
    #[must_use]
    pub fn with_sandbox_step_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.sandbox_step_timeout_ms = timeout_ms;
        self
    }

    /// With tool timeout
    #[inline]
    #[must_use]
    pub fn with_tool_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.tool_timeout_ms = timeout_ms;
        self
    }

    /// Sandbox step timeout as a duration
    #[must_use]
    pub fn sandbox_step_timeout(&self) -> Duration {
        Duration::from_millis(self.sandbox_step_timeout_ms)
    }

    /// Tool timeout as a duration
    #[must_use]
    pub fn tool_timeout(&self) -> Duration {
        Duration::from_millis(self.tool_timeout_ms)
    }

    /// Parse and validate TOML
    ///
    /// # Errors
    /// [`ConfigError::Parse`] or [`ConfigError::Invalid`].
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    ///
    /// # Errors
    /// [`ConfigError::Io`] when the file cannot be read, otherwise as
    /// [`from_toml_str`](Self::from_toml_str).
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        tracing::debug!(path = %path.display(), "Loading runtime config");
        Self::from_toml_str(&source)
    }

    /// Check value ranges
    ///
    /// # Errors
    /// [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_max_steps <= 0 {
            return Err(invalid("default_max_steps", "must be positive"));
        }
        if self.fixpoint.max_iterations == 0 {
            return Err(invalid("fixpoint.maxIterations", "must be positive"));
        }
        if self.fixpoint.base_backoff_ms > self.fixpoint.max_backoff_ms {
            return Err(invalid(
                "fixpoint.baseBackoffMs",
                "must not exceed fixpoint.maxBackoffMs",
            ));
        }
        if self.sandbox_step_timeout_ms == 0 {
            return Err(invalid("sandbox_step_timeout_ms", "must be positive"));
        }
        if self.tool_timeout_ms == 0 {
            return Err(invalid("tool_timeout_ms", "must be positive"));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn empty_source_is_default() {
        assert_eq!(RuntimeConfig::from_toml_str("").unwrap(), RuntimeConfig::default());
    }

    #[test]
    fn partial_override() {
        let config = RuntimeConfig::from_toml_str(
            "tool_timeout_ms = 250\n[fixpoint]\nmaxIterations = 3\n",
        )
        .unwrap();
        assert_eq!(config.tool_timeout(), Duration::from_millis(250));
        assert_eq!(config.fixpoint.max_iterations, 3);
        assert_eq!(config.fixpoint.base_backoff_ms, 25);
        assert_eq!(config.default_max_steps, DEFAULT_MAX_STEPS);
    }

    #[test]
    fn rejects_out_of_range_values() {
        let err = RuntimeConfig::from_toml_str("[fixpoint]\nmaxIterations = 0\n").unwrap_err();
        assert!(err.to_string().contains("fixpoint.maxIterations"));

        let err = RuntimeConfig::from_toml_str("[fixpoint]\nbaseBackoffMs = 5000\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "fixpoint.baseBackoffMs", .. }));

        assert!(matches!(
            RuntimeConfig::from_toml_str("tool_timeout_ms = \"soon\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "default_max_steps = 12").unwrap();
        let config = RuntimeConfig::load(file.path()).unwrap();
        assert_eq!(config.default_max_steps, 12);

        assert!(matches!(
            RuntimeConfig::load("/definitely/not/here.toml"),
            Err(ConfigError::Io { .. })
        ));
    }
}
