//! Sandbox session provider boundary
//!
//! Sandbox step kinds (`sandbox.open`, `sandbox.click`, ...) are delegated to
//! an external session provider in `local` mode. The provider itself (a real
//! browser, a remote worker) lives outside this crate; only the trait seam and
//! a deterministic scripted implementation for tests and offline runs live
//! here.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Failure classes reported by a session provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SandboxErrorCode {
    Timeout,
    NetworkError,
    AuthFailed,
    Overloaded,
    ParseFailed,
    InvalidRequest,
}

impl SandboxErrorCode {
    /// Wire representation
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "TIMEOUT",
            Self::NetworkError => "NETWORK_ERROR",
            Self::AuthFailed => "AUTH_FAILED",
            Self::Overloaded => "OVERLOADED",
            Self::ParseFailed => "PARSE_FAILED",
            Self::InvalidRequest => "INVALID_REQUEST",
        }
    }
}

impl Display for SandboxErrorCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provider-reported failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct SandboxError {
    pub code: SandboxErrorCode,
    pub message: String,
    pub retryable: bool,
}

impl SandboxError {
    /// Create new sandbox error
    pub fn new(code: SandboxErrorCode, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            code,
            message: message.into(),
            retryable,
        }
    }

    /// Non-retryable `INVALID_REQUEST`
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(SandboxErrorCode::InvalidRequest, message, false)
    }
}

/// Result of a single session call
pub type SandboxResult<T> = Result<T, SandboxError>;

/// Options handed to the factory when a session is first needed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SandboxOptions {
    pub session_id: String,
    pub trace_id: Option<String>,
}

/// One live sandbox session
///
/// Every method is a suspension point; the caller bounds each with a timeout.
#[async_trait]
pub trait SandboxSession: Send {
    /// Navigate to `url`
    async fn open(&mut self, url: &str) -> SandboxResult<()>;

    /// Click the element matching `selector`
    async fn click(&mut self, selector: &str) -> SandboxResult<()>;

    /// Type `text` into `selector`, returning the typed length
    async fn type_text(&mut self, selector: &str, text: &str) -> SandboxResult<usize>;

    /// Extract the text content of `selector`
    async fn extract(&mut self, selector: &str) -> SandboxResult<String>;

    /// Release the session
    async fn close(&mut self);
}

/// Creates sessions keyed by session id
#[async_trait]
pub trait SandboxFactory: Send + Sync {
    /// Create a fresh session
    fn create(&self, options: &SandboxOptions) -> Box<dyn SandboxSession>;

    /// Release factory-wide resources after an execution
    async fn shutdown(&self) {}
}

/// Log line written by `sandbox.open`
#[must_use]
pub fn open_log_line(session_id: &str, url: &str) -> String {
    format!("sandbox.open:{session_id}:{url}")
}

/// Log line written by `sandbox.click`
#[must_use]
pub fn click_log_line(session_id: &str, selector: &str) -> String {
    format!("sandbox.click:{session_id}:{selector}")
}

/// Log line written by `sandbox.type`
#[must_use]
pub fn type_log_line(session_id: &str, selector: &str, text_len: usize) -> String {
    format!("sandbox.type:{session_id}:{selector}:len={text_len}")
}

/// Log line written by `sandbox.extract`
#[must_use]
pub fn extract_log_line(session_id: &str, selector: &str, output_key: &str) -> String {
    format!("sandbox.extract:{session_id}:{selector}:out={output_key}")
}

/// Expected operation in a scripted session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedOp {
    Open { url: String },
    Click { selector: String },
    Type { selector: String, text: String },
    Extract { selector: String },
}

impl ScriptedOp {
    fn name(&self) -> &'static str {
        match self {
            Self::Open { .. } => "open",
            Self::Click { .. } => "click",
            Self::Type { .. } => "type",
            Self::Extract { .. } => "extract",
        }
    }
}

/// Scripted reply to an operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedReply {
    /// Success; `extract` answers with the carried text
    Ok(Option<String>),
    /// Provider failure
    Err(SandboxError),
}

/// One expected call and its scripted outcome
#[derive(Debug, Clone)]
pub struct ScriptedCall {
    pub op: ScriptedOp,
    pub reply: ScriptedReply,
    pub delay: Option<Duration>,
}

impl ScriptedCall {
    /// Successful `open`
    pub fn open(url: impl Into<String>) -> Self {
        Self::ok(ScriptedOp::Open { url: url.into() }, None)
    }

    /// Successful `click`
    pub fn click(selector: impl Into<String>) -> Self {
        Self::ok(
            ScriptedOp::Click {
                selector: selector.into(),
            },
            None,
        )
    }

    /// Successful `type`
    pub fn type_text(selector: impl Into<String>, text: impl Into<String>) -> Self {
        Self::ok(
            ScriptedOp::Type {
                selector: selector.into(),
                text: text.into(),
            },
            None,
        )
    }

    /// Successful `extract` answering `text`
    pub fn extract(selector: impl Into<String>, text: impl Into<String>) -> Self {
        Self::ok(
            ScriptedOp::Extract {
                selector: selector.into(),
            },
            Some(text.into()),
        )
    }

    fn ok(op: ScriptedOp, text: Option<String>) -> Self {
        Self {
            op,
            reply: ScriptedReply::Ok(text),
            delay: None,
        }
    }

    /// Replace the reply with a provider failure
    #[must_use]
    pub fn failing(mut self, error: SandboxError) -> Self {
        self.reply = ScriptedReply::Err(error);
        self
    }

    /// Sleep before replying
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// Deterministic sandbox factory driven by per-session scripts
///
/// Each session replays its script in order. A call that does not match the
/// next scripted operation fails with `INVALID_REQUEST`.
#[derive(Debug, Default)]
pub struct ScriptedSandbox {
    scripts: Mutex<HashMap<String, Vec<ScriptedCall>>>,
    created: AtomicUsize,
    closed: Arc<AtomicUsize>,
    shutdowns: AtomicUsize,
}

impl ScriptedSandbox {
    /// Create an empty factory
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the script for `session_id`, replacing any previous one
    pub fn set_script(&self, session_id: impl Into<String>, calls: Vec<ScriptedCall>) {
        self.scripts.lock().insert(session_id.into(), calls);
    }

    /// Builder form of [`set_script`](Self::set_script)
    #[must_use]
    pub fn with_script(self, session_id: impl Into<String>, calls: Vec<ScriptedCall>) -> Self {
        self.set_script(session_id, calls);
        self
    }

    /// Number of sessions created so far
    #[must_use]
    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Number of sessions closed so far
    #[must_use]
    pub fn closed_count(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of factory shutdowns so far
    #[must_use]
    pub fn shutdown_count(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SandboxFactory for ScriptedSandbox {
    fn create(&self, options: &SandboxOptions) -> Box<dyn SandboxSession> {
        self.created.fetch_add(1, Ordering::SeqCst);
        let calls = self
            .scripts
            .lock()
            .get(&options.session_id)
            .cloned()
            .unwrap_or_default();
        Box::new(ScriptedSession {
            calls,
            cursor: 0,
            closed: false,
            close_counter: Arc::clone(&self.closed),
        })
    }

    async fn shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

struct ScriptedSession {
    calls: Vec<ScriptedCall>,
    cursor: usize,
    closed: bool,
    close_counter: Arc<AtomicUsize>,
}

impl ScriptedSession {
    async fn next(&mut self, actual: &ScriptedOp) -> SandboxResult<Option<String>> {
        if self.closed {
            return Err(SandboxError::invalid("session is closed"));
        }
        let Some(call) = self.calls.get(self.cursor).cloned() else {
            return Err(SandboxError::invalid(format!(
                "script exhausted: unexpected {}",
                actual.name()
            )));
        };
        self.cursor += 1;

        if let Some(delay) = call.delay {
            tokio::time::sleep(delay).await;
        }
        if call.op != *actual {
            return Err(SandboxError::invalid(format!(
                "script mismatch: expected {:?}, got {:?}",
                call.op, actual
            )));
        }
        match call.reply {
            ScriptedReply::Ok(text) => Ok(text),
            ScriptedReply::Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl SandboxSession for ScriptedSession {
    async fn open(&mut self, url: &str) -> SandboxResult<()> {
        self.next(&ScriptedOp::Open { url: url.into() }).await?;
        Ok(())
    }

    async fn click(&mut self, selector: &str) -> SandboxResult<()> {
        self.next(&ScriptedOp::Click {
            selector: selector.into(),
        })
        .await?;
        Ok(())
    }

    async fn type_text(&mut self, selector: &str, text: &str) -> SandboxResult<usize> {
        self.next(&ScriptedOp::Type {
            selector: selector.into(),
            text: text.into(),
        })
        .await?;
        Ok(text.chars().count())
    }

    async fn extract(&mut self, selector: &str) -> SandboxResult<String> {
        let text = self
            .next(&ScriptedOp::Extract {
                selector: selector.into(),
            })
            .await?;
        Ok(text.unwrap_or_default())
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.close_counter.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(session_id: &str) -> SandboxOptions {
        SandboxOptions {
            session_id: session_id.into(),
            trace_id: None,
        }
    }

    #[tokio::test]
    async fn scripted_session_replays_in_order() {
        let sandbox = ScriptedSandbox::new().with_script(
            "s1",
            vec![
                ScriptedCall::open("https://example.com"),
                ScriptedCall::type_text("#q", "rust"),
                ScriptedCall::extract("#title", "Example"),
            ],
        );
        let mut session = sandbox.create(&options("s1"));

        session.open("https://example.com").await.unwrap();
        assert_eq!(session.type_text("#q", "rust").await.unwrap(), 4);
        assert_eq!(session.extract("#title").await.unwrap(), "Example");
        session.close().await;

        assert_eq!(sandbox.created_count(), 1);
        assert_eq!(sandbox.closed_count(), 1);
    }

    #[tokio::test]
    async fn mismatch_is_invalid_request() {
        let sandbox =
            ScriptedSandbox::new().with_script("s1", vec![ScriptedCall::open("https://a.test")]);
        let mut session = sandbox.create(&options("s1"));

        let err = session.click("#btn").await.unwrap_err();
        assert_eq!(err.code, SandboxErrorCode::InvalidRequest);
        assert!(!err.retryable);
    }

    #[tokio::test]
    async fn scripted_failure_is_returned() {
        let sandbox = ScriptedSandbox::new().with_script(
            "s1",
            vec![ScriptedCall::open("https://a.test").failing(SandboxError::new(
                SandboxErrorCode::NetworkError,
                "connection reset",
                true,
            ))],
        );
        let mut session = sandbox.create(&options("s1"));

        let err = session.open("https://a.test").await.unwrap_err();
        assert_eq!(err.code, SandboxErrorCode::NetworkError);
        assert!(err.retryable);
    }

    #[tokio::test]
    async fn closed_session_rejects_calls() {
        let sandbox = ScriptedSandbox::new();
        let mut session = sandbox.create(&options("unknown"));
        session.close().await;
        session.close().await;

        assert!(session.open("https://a.test").await.is_err());
        assert_eq!(sandbox.closed_count(), 1);
    }

    #[test]
    fn log_lines() {
        assert_eq!(open_log_line("s", "https://a.test"), "sandbox.open:s:https://a.test");
        assert_eq!(click_log_line("s", "#b"), "sandbox.click:s:#b");
        assert_eq!(type_log_line("s", "#q", 4), "sandbox.type:s:#q:len=4");
        assert_eq!(extract_log_line("s", "#t", "title"), "sandbox.extract:s:#t:out=title");
    }
}
