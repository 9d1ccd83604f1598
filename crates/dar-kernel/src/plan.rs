//! Plan, step, state and trace types
//!
//! Wire format is camelCase JSON. [`Step`] serializes flat as
//! `{ "id", "kind", ...kind fields }`, so a typed plan and a raw JSON plan
//! share one representation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};

/// The only supported plan version
pub const PLAN_VERSION: u32 = 1;

/// Ordered sequence of state-mutation steps
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    /// Caller-chosen plan identity
    pub plan_id: String,
    /// Plan format version (must be [`PLAN_VERSION`])
    pub version: u32,
    /// Steps in execution order
    pub steps: Vec<Step>,
}

impl Plan {
    /// Create a version-1 plan
    #[inline]
    pub fn new(plan_id: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            plan_id: plan_id.into(),
            version: PLAN_VERSION,
            steps,
        }
    }

    /// Raw JSON form, as a caller would submit it
    #[must_use]
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// One plan step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    /// Unique id within the plan
    pub id: String,
    /// Kind-specific payload
    #[serde(flatten)]
    pub action: StepAction,
}

impl Step {
    /// Create new step
    #[inline]
    pub fn new(id: impl Into<String>, action: StepAction) -> Self {
        Self {
            id: id.into(),
            action,
        }
    }

    /// `set` step
    pub fn set(id: impl Into<String>, key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(
            id,
            StepAction::Set {
                key: key.into(),
                value: value.into(),
            },
        )
    }

    /// `increment` step
    pub fn increment(id: impl Into<String>, key: impl Into<String>, value: i64) -> Self {
        Self::new(
            id,
            StepAction::Increment {
                key: key.into(),
                value,
            },
        )
    }

    /// `append_log` step
    pub fn append_log(id: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(
            id,
            StepAction::AppendLog {
                value: value.into(),
            },
        )
    }

    /// Step kind discriminant
    #[inline]
    #[must_use]
    pub fn kind(&self) -> StepKind {
        self.action.kind()
    }
}

/// Kind-specific step payload
///
/// Core kinds carry `key`/`value`; sandbox kinds carry `sessionId` plus their
/// own fields. The two groups never mix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum StepAction {
    /// `values[key] = value`
    #[serde(rename = "set")]
    Set { key: String, value: String },

    /// `counters[key] += value`
    #[serde(rename = "increment")]
    Increment { key: String, value: i64 },

    /// `logs.push(value)`
    #[serde(rename = "append_log")]
    AppendLog { value: String },

    /// Navigate a sandbox session
    #[serde(rename = "sandbox.open", rename_all = "camelCase")]
    SandboxOpen { session_id: String, url: String },

    /// Click an element
    #[serde(rename = "sandbox.click", rename_all = "camelCase")]
    SandboxClick { session_id: String, selector: String },

    /// Type text into an element
    #[serde(rename = "sandbox.type", rename_all = "camelCase")]
    SandboxType {
        session_id: String,
        selector: String,
        text: String,
    },

    /// Extract element text into `values[outputKey]`
    #[serde(rename = "sandbox.extract", rename_all = "camelCase")]
    SandboxExtract {
        session_id: String,
        selector: String,
        output_key: String,
    },
}

impl StepAction {
    /// Kind discriminant
    #[must_use]
    pub fn kind(&self) -> StepKind {
        match self {
            Self::Set { .. } => StepKind::Set,
            Self::Increment { .. } => StepKind::Increment,
            Self::AppendLog { .. } => StepKind::AppendLog,
            Self::SandboxOpen { .. } => StepKind::SandboxOpen,
            Self::SandboxClick { .. } => StepKind::SandboxClick,
            Self::SandboxType { .. } => StepKind::SandboxType,
            Self::SandboxExtract { .. } => StepKind::SandboxExtract,
        }
    }

    /// Core `key` field
    #[must_use]
    pub fn key(&self) -> Option<&str> {
        match self {
            Self::Set { key, .. } | Self::Increment { key, .. } => Some(key),
            _ => None,
        }
    }

    /// Sandbox `sessionId` field
    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::SandboxOpen { session_id, .. }
            | Self::SandboxClick { session_id, .. }
            | Self::SandboxType { session_id, .. }
            | Self::SandboxExtract { session_id, .. } => Some(session_id),
            _ => None,
        }
    }

    /// Sandbox `url` field
    #[must_use]
    pub fn url(&self) -> Option<&str> {
        match self {
            Self::SandboxOpen { url, .. } => Some(url),
            _ => None,
        }
    }

    /// Sandbox `selector` field
    #[must_use]
    pub fn selector(&self) -> Option<&str> {
        match self {
            Self::SandboxClick { selector, .. }
            | Self::SandboxType { selector, .. }
            | Self::SandboxExtract { selector, .. } => Some(selector),
            _ => None,
        }
    }

    /// Sandbox `text` field
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::SandboxType { text, .. } => Some(text),
            _ => None,
        }
    }

    /// Sandbox `outputKey` field
    #[must_use]
    pub fn output_key(&self) -> Option<&str> {
        match self {
            Self::SandboxExtract { output_key, .. } => Some(output_key),
            _ => None,
        }
    }
}

/// Fieldless step kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StepKind {
    #[serde(rename = "set")]
    Set,
    #[serde(rename = "increment")]
    Increment,
    #[serde(rename = "append_log")]
    AppendLog,
    #[serde(rename = "sandbox.open")]
    SandboxOpen,
    #[serde(rename = "sandbox.click")]
    SandboxClick,
    #[serde(rename = "sandbox.type")]
    SandboxType,
    #[serde(rename = "sandbox.extract")]
    SandboxExtract,
}

impl StepKind {
    /// Every kind, in declaration order
    pub const ALL: [StepKind; 7] = [
        Self::Set,
        Self::Increment,
        Self::AppendLog,
        Self::SandboxOpen,
        Self::SandboxClick,
        Self::SandboxType,
        Self::SandboxExtract,
    ];

    /// Wire name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Set => "set",
            Self::Increment => "increment",
            Self::AppendLog => "append_log",
            Self::SandboxOpen => "sandbox.open",
            Self::SandboxClick => "sandbox.click",
            Self::SandboxType => "sandbox.type",
            Self::SandboxExtract => "sandbox.extract",
        }
    }

    /// Parse a wire name
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == name)
    }

    /// Check if this kind is delegated to a sandbox session
    #[inline]
    #[must_use]
    pub const fn is_sandbox(self) -> bool {
        matches!(
            self,
            Self::SandboxOpen | Self::SandboxClick | Self::SandboxType | Self::SandboxExtract
        )
    }
}

impl Display for StepKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// In-memory agent state
///
/// Created empty for every execution and replaced wholesale by each applied
/// step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentState {
    /// Integer counters
    pub counters: BTreeMap<String, i64>,
    /// String values
    pub values: BTreeMap<String, String>,
    /// Append-only log lines
    pub logs: Vec<String>,
}

impl AgentState {
    /// Empty state
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

/// Execution mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Sandbox steps are delegated to a live session provider
    Local,
    /// Everything runs against the in-process mock
    #[default]
    Mock,
}

impl ExecutionMode {
    /// Wire name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Mock => "mock",
        }
    }
}

impl Display for ExecutionMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One link of the execution hash chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepTrace {
    pub trace_schema_version: u32,
    pub step_index: usize,
    pub step_id: String,
    pub kind: StepKind,
    pub before_hash_like: String,
    pub after_hash_like: String,
    pub previous_trace_link_hash: String,
    pub trace_link_hash: String,
    pub applied: bool,
}

/// Terminal artifact of a successful execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentExecutionResult {
    pub plan_id: String,
    pub plan_hash: String,
    pub execution_hash: String,
    pub final_trace_link_hash: String,
    pub trace_schema_version: u32,
    pub steps_requested: usize,
    pub steps_executed: usize,
    pub converged: bool,
    pub final_state: AgentState,
    pub trace: Vec<StepTrace>,
}
