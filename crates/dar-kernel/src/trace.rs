//! Hash-chained execution trace
//!
//! Every applied step appends one [`StepTrace`] whose `traceLinkHash` binds:
//! - the previous link (genesis for the first step)
//! - the step index and normalized step content
//! - the before/after state fingerprints and normalized states
//!
//! The final link and the final state are then folded into the execution hash.

use crate::hash::{
    canonical_json, nfc, normalized_state_view, prefixed_sha256, HashError, EXECUTION_HASH_PREFIX,
    TRACE_LINK_PREFIX,
};
use crate::plan::{AgentState, Step, StepAction, StepTrace};
use serde_json::{json, Map, Value};

/// Version of the trace-link and execution-hash payload layout
pub const TRACE_SCHEMA_VERSION: u32 = 1;

/// Chain anchor for the first step: `tl` + 64 zeros
pub const GENESIS_TRACE_LINK: &str = concat!(
    "tl",
    "0000000000000000",
    "0000000000000000",
    "0000000000000000",
    "0000000000000000"
);

/// Normalized step view used inside trace links
///
/// Always carries `id`, `kind`, `key` and `value` (null when absent). Sandbox
/// kinds add `sessionId`, `url`, `selector`, `text` and `outputKey`.
#[must_use]
pub fn step_view(step: &Step) -> Value {
    let action = &step.action;
    let text = |s: Option<&str>| s.map_or(Value::Null, |s| Value::String(nfc(s)));

    let value = match action {
        StepAction::Set { value, .. } | StepAction::AppendLog { value } => Value::String(nfc(value)),
        StepAction::Increment { value, .. } => Value::from(*value),
        _ => Value::Null,
    };

    let mut view = Map::new();
    view.insert("id".into(), Value::String(nfc(&step.id)));
    view.insert("kind".into(), Value::String(step.kind().as_str().into()));
    view.insert("key".into(), text(action.key()));
    view.insert("value".into(), value);

    if step.kind().is_sandbox() {
        view.insert("sessionId".into(), text(action.session_id()));
        view.insert("url".into(), text(action.url()));
        view.insert("selector".into(), text(action.selector()));
        view.insert("text".into(), text(action.text()));
        view.insert("outputKey".into(), text(action.output_key()));
    }
    Value::Object(view)
}

/// Inputs of one trace link
#[derive(Debug, Clone, Copy)]
pub struct TraceLinkInput<'a> {
    pub previous_link_hash: &'a str,
    pub step_index: usize,
    pub step: &'a Step,
    pub before_hash_like: &'a str,
    pub after_hash_like: &'a str,
    pub before_state: &'a AgentState,
    pub after_state: &'a AgentState,
}

/// `tl` + SHA-256 of the canonical link payload
///
/// # Errors
/// Returns [`HashError`] if the payload cannot be encoded.
pub fn trace_link_hash(input: &TraceLinkInput<'_>) -> Result<String, HashError> {
    let payload = json!({
        "traceSchemaVersion": TRACE_SCHEMA_VERSION,
        "previousLinkHash": input.previous_link_hash,
        "stepIndex": input.step_index,
        "step": step_view(input.step),
        "beforeHashLike": input.before_hash_like,
        "afterHashLike": input.after_hash_like,
        "beforeState": normalized_state_view(input.before_state),
        "afterState": normalized_state_view(input.after_state),
    });
    Ok(prefixed_sha256(TRACE_LINK_PREFIX, &canonical_json(&payload)?))
}

/// Inputs of the execution hash
#[derive(Debug, Clone, Copy)]
pub struct ExecutionHashInput<'a> {
    pub plan_hash: &'a str,
    pub step_count: usize,
    pub final_trace_link_hash: &'a str,
    pub final_state: &'a AgentState,
}

/// `eh` + SHA-256 of the canonical execution payload
///
/// # Errors
/// Returns [`HashError`] if the payload cannot be encoded.
pub fn execution_hash(input: &ExecutionHashInput<'_>) -> Result<String, HashError> {
    let payload = json!({
        "traceSchemaVersion": TRACE_SCHEMA_VERSION,
        "planHash": input.plan_hash,
        "stepCount": input.step_count,
        "finalTraceLinkHash": input.final_trace_link_hash,
        "finalState": normalized_state_view(input.final_state),
    });
    Ok(prefixed_sha256(EXECUTION_HASH_PREFIX, &canonical_json(&payload)?))
}

/// Append-only trace under construction
#[derive(Debug, Clone)]
pub struct TraceChain {
    previous: String,
    entries: Vec<StepTrace>,
}

impl Default for TraceChain {
    fn default() -> Self {
        Self::new()
    }
}

impl TraceChain {
    /// Empty chain anchored at genesis
    #[must_use]
    pub fn new() -> Self {
        Self {
            previous: GENESIS_TRACE_LINK.to_owned(),
            entries: Vec::new(),
        }
    }

    /// Append the link for step `entries.len()` and advance the chain
    ///
    /// # Errors
    /// Returns [`HashError`] if the link cannot be hashed; the chain is left
    /// unchanged.
    pub fn record(
        &mut self,
        step: &Step,
        before: &AgentState,
        after: &AgentState,
        before_hash_like: String,
        after_hash_like: String,
    ) -> Result<&StepTrace, HashError> {
        let step_index = self.entries.len();
        let link = trace_link_hash(&TraceLinkInput {
            previous_link_hash: &self.previous,
            step_index,
            step,
            before_hash_like: &before_hash_like,
            after_hash_like: &after_hash_like,
            before_state: before,
            after_state: after,
        })?;

        let previous = std::mem::replace(&mut self.previous, link.clone());
        self.entries.push(StepTrace {
            trace_schema_version: TRACE_SCHEMA_VERSION,
            step_index,
            step_id: step.id.clone(),
            kind: step.kind(),
            before_hash_like,
            after_hash_like,
            previous_trace_link_hash: previous,
            trace_link_hash: link,
            applied: true,
        });
        Ok(&self.entries[step_index])
    }

    /// Latest link hash (genesis while empty)
    #[inline]
    #[must_use]
    pub fn final_link(&self) -> &str {
        &self.previous
    }

    /// Number of recorded links
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if nothing was recorded yet
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Consume into the recorded entries
    #[must_use]
    pub fn into_entries(self) -> Vec<StepTrace> {
        self.entries
    }
}

/// Structural break found by [`verify_trace_chain`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChainBreak {
    #[error("trace entry {position} has stepIndex {found}")]
    IndexGap { position: usize, found: usize },

    #[error("trace entry {position} has unsupported schema version {found}")]
    SchemaVersion { position: usize, found: u32 },

    #[error("trace entry {position} does not link to its predecessor")]
    BrokenLink { position: usize },
}

/// Check index continuity, schema version and link continuity from genesis
///
/// Link hashes themselves can only be recomputed by re-execution; this check
/// covers what a recorded trace proves on its own.
///
/// # Errors
/// Returns the first [`ChainBreak`] found.
pub fn verify_trace_chain(trace: &[StepTrace]) -> Result<(), ChainBreak> {
    let mut previous = GENESIS_TRACE_LINK;
    for (position, entry) in trace.iter().enumerate() {
        if entry.step_index != position {
            return Err(ChainBreak::IndexGap {
                position,
                found: entry.step_index,
            });
        }
        if entry.trace_schema_version != TRACE_SCHEMA_VERSION {
            return Err(ChainBreak::SchemaVersion {
                position,
                found: entry.trace_schema_version,
            });
        }
        if entry.previous_trace_link_hash != previous {
            return Err(ChainBreak::BrokenLink { position });
        }
        previous = entry.trace_link_hash.as_str();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::state_hash_like;

    fn record(chain: &mut TraceChain, step: &Step, before: &AgentState, after: &AgentState) {
        chain
            .record(
                step,
                before,
                after,
                state_hash_like(before),
                state_hash_like(after),
            )
            .unwrap();
    }

    #[test]
    fn genesis_shape() {
        assert_eq!(GENESIS_TRACE_LINK.len(), 66);
        assert!(GENESIS_TRACE_LINK.starts_with("tl"));
        assert!(GENESIS_TRACE_LINK[2..].chars().all(|c| c == '0'));
    }

    #[test]
    fn core_step_view_has_nulls() {
        let view = step_view(&Step::append_log("a", "hello"));
        assert_eq!(
            view,
            json!({ "id": "a", "kind": "append_log", "key": null, "value": "hello" })
        );
    }

    #[test]
    fn sandbox_step_view_has_all_fields() {
        let step = Step::new(
            "o",
            StepAction::SandboxOpen {
                session_id: "s".into(),
                url: "https://a.test".into(),
            },
        );
        assert_eq!(
            step_view(&step),
            json!({
                "id": "o",
                "kind": "sandbox.open",
                "key": null,
                "value": null,
                "sessionId": "s",
                "url": "https://a.test",
                "selector": null,
                "text": null,
                "outputKey": null
            })
        );
    }

    #[test]
    fn chain_links_from_genesis() {
        let s0 = AgentState::new();
        let mut s1 = s0.clone();
        s1.values.insert("k".into(), "v".into());
        let mut s2 = s1.clone();
        s2.counters.insert("n".into(), 2);

        let mut chain = TraceChain::new();
        record(&mut chain, &Step::set("a", "k", "v"), &s0, &s1);
        record(&mut chain, &Step::increment("b", "n", 2), &s1, &s2);

        let final_link = chain.final_link().to_owned();
        let trace = chain.into_entries();
        assert_eq!(trace[0].previous_trace_link_hash, GENESIS_TRACE_LINK);
        assert_eq!(trace[1].previous_trace_link_hash, trace[0].trace_link_hash);
        assert_eq!(final_link, trace[1].trace_link_hash);
        assert!(verify_trace_chain(&trace).is_ok());
    }

    #[test]
    fn link_hash_depends_on_every_input() {
        let before = AgentState::new();
        let mut after = before.clone();
        after.logs.push("x".into());
        let step = Step::append_log("a", "x");
        let bh = state_hash_like(&before);
        let ah = state_hash_like(&after);

        let base = TraceLinkInput {
            previous_link_hash: GENESIS_TRACE_LINK,
            step_index: 0,
            step: &step,
            before_hash_like: &bh,
            after_hash_like: &ah,
            before_state: &before,
            after_state: &after,
        };
        let reference = trace_link_hash(&base).unwrap();

        let other_step = Step::append_log("a", "y");
        let variants = [
            TraceLinkInput { step_index: 1, ..base },
            TraceLinkInput { previous_link_hash: "tl1", ..base },
            TraceLinkInput { step: &other_step, ..base },
            TraceLinkInput { before_hash_like: "h00000000", ..base },
            TraceLinkInput { after_hash_like: "h00000000", ..base },
            TraceLinkInput { after_state: &before, ..base },
            TraceLinkInput { before_state: &after, ..base },
        ];
        for variant in &variants {
            assert_ne!(trace_link_hash(variant).unwrap(), reference);
        }
    }

    #[test]
    fn verify_detects_tampering() {
        let s0 = AgentState::new();
        let mut s1 = s0.clone();
        s1.logs.push("x".into());

        let mut chain = TraceChain::new();
        record(&mut chain, &Step::append_log("a", "x"), &s0, &s1);
        record(&mut chain, &Step::append_log("b", "x"), &s1, &s1);
        let trace = chain.into_entries();

        let mut broken = trace.clone();
        broken[1].previous_trace_link_hash = GENESIS_TRACE_LINK.into();
        assert_eq!(
            verify_trace_chain(&broken),
            Err(ChainBreak::BrokenLink { position: 1 })
        );

        let mut gap = trace;
        gap[1].step_index = 5;
        assert_eq!(
            verify_trace_chain(&gap),
            Err(ChainBreak::IndexGap { position: 1, found: 5 })
        );
    }

    #[test]
    fn execution_hash_is_prefixed_and_stable() {
        let state = AgentState::new();
        let input = ExecutionHashInput {
            plan_hash: "ph00",
            step_count: 0,
            final_trace_link_hash: GENESIS_TRACE_LINK,
            final_state: &state,
        };
        let hash = execution_hash(&input).unwrap();
        assert!(hash.starts_with("eh"));
        assert_eq!(hash, execution_hash(&input).unwrap());
        assert_ne!(
            hash,
            execution_hash(&ExecutionHashInput { step_count: 1, ..input }).unwrap()
        );
    }
}
