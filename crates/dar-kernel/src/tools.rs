//! Tool invocation
//!
//! Tools are external collaborators behind [`ToolAdapter`]. The kernel only
//! owns lookup, the per-call timeout race and error classification:
//! - unknown tool: `TOOL_NOT_FOUND`
//! - expired timeout: `TOOL_TIMEOUT` (the only retryable tool failure)
//! - rejected input: `TOOL_INVALID_INPUT`
//! - any other tool failure: `TOOL_EXECUTION_FAILED`

use crate::error::{DeterministicError, ErrorCode};
use crate::executor::duration_ms;
use async_trait::async_trait;
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Timeout used when the caller does not supply one
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_millis(1000);

/// JSON object passed to and returned by tools
pub type ToolObject = Map<String, Value>;

/// Failure reported by a tool
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ToolError {
    #[error("{0}")]
    InvalidInput(String),

    #[error("{0}")]
    ExecutionFailed(String),
}

/// Context handed to each tool call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolContext {
    pub request_id: Option<String>,
    pub trace_id: Option<String>,
    pub timeout_ms: u64,
}

/// A named tool
#[async_trait]
pub trait ToolAdapter: Send + Sync {
    /// Registry name
    fn name(&self) -> &str;

    /// Check if the same input always yields the same output
    fn deterministic(&self) -> bool;

    /// Run the tool
    async fn execute(&self, input: &ToolObject, ctx: &ToolContext) -> Result<ToolObject, ToolError>;
}

/// Registration failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistrationError {
    #[error("Invalid tool registration")]
    InvalidName,

    #[error("Duplicate tool registration: {0}")]
    Duplicate(String),
}

/// Immutable name → tool map
#[derive(Clone, Default)]
pub struct ToolRegistry {
    by_name: BTreeMap<String, Arc<dyn ToolAdapter>>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.list())
            .finish()
    }
}

impl ToolRegistry {
    /// Build a registry
    ///
    /// # Errors
    /// Rejects blank names and duplicate names.
    pub fn new(tools: Vec<Arc<dyn ToolAdapter>>) -> Result<Self, RegistrationError> {
        let mut by_name = BTreeMap::new();
        for tool in tools {
            let name = tool.name().to_owned();
            if name.trim().is_empty() {
                return Err(RegistrationError::InvalidName);
            }
            if by_name.contains_key(&name) {
                return Err(RegistrationError::Duplicate(name));
            }
            by_name.insert(name, tool);
        }
        Ok(Self { by_name })
    }

    /// Registry with the built-in deterministic tools
    #[must_use]
    pub fn builtin() -> Self {
        let mut by_name: BTreeMap<String, Arc<dyn ToolAdapter>> = BTreeMap::new();
        by_name.insert("echo".into(), Arc::new(EchoTool));
        by_name.insert("sum".into(), Arc::new(SumTool));
        Self { by_name }
    }

    /// Look up a tool
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolAdapter>> {
        self.by_name.get(name).cloned()
    }

    /// Registered names, sorted
    #[must_use]
    pub fn list(&self) -> Vec<String> {
        self.by_name.keys().cloned().collect()
    }
}

/// Tool call request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolRequest {
    pub tool_name: String,
    pub input: ToolObject,
}

/// Call options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOptions {
    /// Zero or `None` falls back to [`DEFAULT_TOOL_TIMEOUT`]
    pub timeout: Option<Duration>,
    pub request_id: Option<String>,
    pub trace_id: Option<String>,
}

impl ToolOptions {
    /// Set the timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Outcome of one tool call
///
/// Serializes as `{ ok, toolName, deterministic, output | error, meta: { durationMs } }`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolExecution {
    pub tool_name: String,
    pub deterministic: bool,
    pub result: Result<ToolObject, DeterministicError>,
    pub duration_ms: u64,
}

impl ToolExecution {
    fn failure(tool_name: &str, code: ErrorCode, message: impl Into<String>, started: Instant) -> Self {
        Self {
            tool_name: tool_name.to_owned(),
            deterministic: true,
            result: Err(DeterministicError::new(code, message)),
            duration_ms: duration_ms(started.elapsed()),
        }
    }

    /// Check if the call succeeded
    #[inline]
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

impl Serialize for ToolExecution {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Meta {
            duration_ms: u64,
        }

        let mut out = serializer.serialize_struct("ToolExecution", 5)?;
        out.serialize_field("ok", &self.result.is_ok())?;
        out.serialize_field("toolName", &self.tool_name)?;
        out.serialize_field("deterministic", &self.deterministic)?;
        match &self.result {
            Ok(output) => out.serialize_field("output", output)?,
            Err(error) => out.serialize_field("error", error)?,
        }
        out.serialize_field(
            "meta",
            &Meta {
                duration_ms: self.duration_ms,
            },
        )?;
        out.end()
    }
}

/// Run a tool, racing it against its timeout
pub async fn execute_tool(
    registry: &ToolRegistry,
    request: &ToolRequest,
    options: &ToolOptions,
) -> ToolExecution {
    let started = Instant::now();
    let timeout = options
        .timeout
        .filter(|t| !t.is_zero())
        .unwrap_or(DEFAULT_TOOL_TIMEOUT);

    let Some(tool) = registry.get(&request.tool_name) else {
        return ToolExecution::failure(
            &request.tool_name,
            ErrorCode::ToolNotFound,
            format!("Tool is not registered: {}", request.tool_name),
            started,
        );
    };

    let ctx = ToolContext {
        request_id: options.request_id.clone(),
        trace_id: options.trace_id.clone(),
        timeout_ms: duration_ms(timeout),
    };

    match tokio::time::timeout(timeout, tool.execute(&request.input, &ctx)).await {
        Err(_elapsed) => {
            tracing::warn!(tool = %request.tool_name, timeout_ms = ctx.timeout_ms, "Tool timed out");
            ToolExecution::failure(
                &request.tool_name,
                ErrorCode::ToolTimeout,
                "Tool execution exceeded timeout",
                started,
            )
        }
        Ok(Err(ToolError::InvalidInput(message))) => ToolExecution::failure(
            &request.tool_name,
            ErrorCode::ToolInvalidInput,
            message,
            started,
        ),
        Ok(Err(ToolError::ExecutionFailed(message))) => ToolExecution::failure(
            &request.tool_name,
            ErrorCode::ToolExecutionFailed,
            format!("Tool threw error: {message}"),
            started,
        ),
        Ok(Ok(output)) => ToolExecution {
            tool_name: request.tool_name.clone(),
            deterministic: tool.deterministic(),
            result: Ok(output),
            duration_ms: duration_ms(started.elapsed()),
        },
    }
}

/// `echo`: `{ message }` → `{ echoed, length }`
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoTool;

#[async_trait]
impl ToolAdapter for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn deterministic(&self) -> bool {
        true
    }

    async fn execute(&self, input: &ToolObject, _ctx: &ToolContext) -> Result<ToolObject, ToolError> {
        let message = input
            .get("message")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidInput("message must be a string".into()))?;

        let mut output = ToolObject::new();
        output.insert("echoed".into(), Value::String(message.to_owned()));
        output.insert("length".into(), Value::from(message.chars().count()));
        Ok(output)
    }
}

/// `sum`: `{ values: [number] }` → `{ total, count }`
#[derive(Debug, Clone, Copy, Default)]
pub struct SumTool;

#[async_trait]
impl ToolAdapter for SumTool {
    fn name(&self) -> &str {
        "sum"
    }

    fn deterministic(&self) -> bool {
        true
    }

    async fn execute(&self, input: &ToolObject, _ctx: &ToolContext) -> Result<ToolObject, ToolError> {
        let values = input
            .get("values")
            .and_then(Value::as_array)
            .ok_or_else(|| ToolError::InvalidInput("values must be an array".into()))?;

        let mut total = 0.0_f64;
        for (i, value) in values.iter().enumerate() {
            let n = value
                .as_f64()
                .filter(|n| n.is_finite())
                .ok_or_else(|| ToolError::InvalidInput(format!("values[{i}] must be a finite number")))?;
            total += n;
        }

        let mut output = ToolObject::new();
        output.insert("total".into(), Value::from(total));
        output.insert("count".into(), Value::from(values.len()));
        Ok(output)
    }
}
