//! Step application
//!
//! An applier maps `(state, step)` to a new state and never mutates its input.
//! [`MockApplier`] is the default: pure, in-process, and deterministic for
//! every kind, including sandbox kinds which it simulates.

use crate::error::StepError;
use crate::plan::{AgentState, Step, StepAction};
use crate::sandbox::{click_log_line, extract_log_line, open_log_line, type_log_line};

/// Pluggable step application
pub trait StepApplier: Send + Sync {
    /// Produce the state after applying `step` to `state`
    ///
    /// # Errors
    /// Returns [`StepError`] when the step cannot be applied. The input state is
    /// untouched either way.
    fn apply(&self, state: &AgentState, step: &Step) -> Result<AgentState, StepError>;
}

/// Apply a core kind (`set`, `increment`, `append_log`) in place
///
/// Returns `Ok(false)` for sandbox kinds, which the caller must handle.
///
/// # Errors
/// Returns [`StepError::CounterOverflow`] if an increment leaves the `i64` range.
pub fn apply_core_step(state: &mut AgentState, action: &StepAction) -> Result<bool, StepError> {
    match action {
        StepAction::Set { key, value } => {
            state.values.insert(key.clone(), value.clone());
        }
        StepAction::Increment { key, value } => {
            let counter = state.counters.entry(key.clone()).or_insert(0);
            *counter = counter
                .checked_add(*value)
                .ok_or_else(|| StepError::CounterOverflow { key: key.clone() })?;
        }
        StepAction::AppendLog { value } => state.logs.push(value.clone()),
        _ => return Ok(false),
    }
    Ok(true)
}

/// Deterministic in-process applier
///
/// Sandbox kinds write the same log lines the session-backed path writes;
/// `sandbox.extract` stores `mock:<selector>` under its output key.
#[derive(Debug, Clone, Copy, Default)]
pub struct MockApplier;

impl MockApplier {
    /// Placeholder text produced by a simulated extract
    #[must_use]
    pub fn extract_placeholder(selector: &str) -> String {
        format!("mock:{selector}")
    }
}

impl StepApplier for MockApplier {
    fn apply(&self, state: &AgentState, step: &Step) -> Result<AgentState, StepError> {
        let mut next = state.clone();
        if apply_core_step(&mut next, &step.action)? {
            return Ok(next);
        }

        match &step.action {
            StepAction::SandboxOpen { session_id, url } => {
                next.logs.push(open_log_line(session_id, url));
            }
            StepAction::SandboxClick {
                session_id,
                selector,
            } => next.logs.push(click_log_line(session_id, selector)),
            StepAction::SandboxType {
                session_id,
                selector,
                text,
            } => next
                .logs
                .push(type_log_line(session_id, selector, text.chars().count())),
            StepAction::SandboxExtract {
                session_id,
                selector,
                output_key,
            } => {
                next.values
                    .insert(output_key.clone(), Self::extract_placeholder(selector));
                next.logs
                    .push(extract_log_line(session_id, selector, output_key));
            }
            StepAction::Set { .. } | StepAction::Increment { .. } | StepAction::AppendLog { .. } => {}
        }
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn core_kinds() {
        let applier = MockApplier;
        let s0 = AgentState::new();
        let s1 = applier.apply(&s0, &Step::set("a", "k", "v")).unwrap();
        let s2 = applier.apply(&s1, &Step::increment("b", "n", 2)).unwrap();
        let s3 = applier.apply(&s2, &Step::increment("c", "n", -5)).unwrap();
        let s4 = applier.apply(&s3, &Step::append_log("d", "done")).unwrap();

        assert_eq!(s0, AgentState::new());
        assert_eq!(s1.values["k"], "v");
        assert_eq!(s2.counters["n"], 2);
        assert_eq!(s3.counters["n"], -3);
        assert_eq!(s4.logs, vec!["done".to_owned()]);
    }

    #[test]
    fn increment_overflow_is_an_error() {
        let mut state = AgentState::new();
        state.counters.insert("n".into(), i64::MAX);
        let err = MockApplier
            .apply(&state, &Step::increment("a", "n", 1))
            .unwrap_err();
        assert_eq!(err, StepError::CounterOverflow { key: "n".into() });
        assert_eq!(state.counters["n"], i64::MAX);
    }

    #[test]
    fn sandbox_kinds_are_simulated() {
        let steps = [
            Step::new(
                "o",
                StepAction::SandboxOpen {
                    session_id: "s".into(),
                    url: "https://a.test".into(),
                },
            ),
            Step::new(
                "t",
                StepAction::SandboxType {
                    session_id: "s".into(),
                    selector: "#q".into(),
                    text: "héllo".into(),
                },
            ),
            Step::new(
                "x",
                StepAction::SandboxExtract {
                    session_id: "s".into(),
                    selector: "#title".into(),
                    output_key: "title".into(),
                },
            ),
        ];
        let state = steps.iter().fold(AgentState::new(), |state, step| {
            MockApplier.apply(&state, step).unwrap()
        });

        assert_eq!(
            state.logs,
            vec![
                "sandbox.open:s:https://a.test".to_owned(),
                "sandbox.type:s:#q:len=5".to_owned(),
                "sandbox.extract:s:#title:out=title".to_owned(),
            ]
        );
        assert_eq!(state.values["title"], "mock:#title");
    }
}
