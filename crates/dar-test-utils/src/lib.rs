//! Testing utilities for DAR workspace
//!
//! Shared test helpers, fixtures, and appliers.

#![allow(missing_docs)]

use dar_kernel::applier::{MockApplier, StepApplier};
use dar_kernel::error::StepError;
use dar_kernel::plan::{AgentState, Step};
use dar_kernel::sandbox::{ScriptedCall, ScriptedSandbox};
use parking_lot::Mutex;
use serde_json::{json, Value};

/// Session id used by the sandbox fixtures
pub const SESSION_ID: &str = "s1";

/// Raw plan with the given id and steps
pub fn plan_with_steps(plan_id: &str, steps: Vec<Value>) -> Value {
    json!({ "planId": plan_id, "version": 1, "steps": steps })
}

/// `set k=v`, then `increment n by 2`
pub fn p1_plan() -> Value {
    plan_with_steps(
        "p1",
        vec![
            json!({ "id": "a", "kind": "set", "key": "k", "value": "v" }),
            json!({ "id": "b", "kind": "increment", "key": "n", "value": 2 }),
        ],
    )
}

/// Final state of [`p1_plan`]
pub fn p1_final_state() -> AgentState {
    let mut state = AgentState::default();
    state.counters.insert("n".into(), 2);
    state.values.insert("k".into(), "v".into());
    state
}

/// `n` `append_log` steps
pub fn log_plan(n: usize) -> Value {
    let steps = (0..n)
        .map(|i| json!({ "id": format!("s{i}"), "kind": "append_log", "value": format!("line {i}") }))
        .collect();
    plan_with_steps("logs", steps)
}

/// open, click, type and extract against [`SESSION_ID`]
pub fn sandbox_plan() -> Value {
    plan_with_steps(
        "browse",
        vec![
            json!({ "id": "open", "kind": "sandbox.open", "sessionId": SESSION_ID, "url": "https://example.com" }),
            json!({ "id": "click", "kind": "sandbox.click", "sessionId": SESSION_ID, "selector": "#go" }),
            json!({ "id": "type", "kind": "sandbox.type", "sessionId": SESSION_ID, "selector": "#q", "text": "hello" }),
            json!({ "id": "read", "kind": "sandbox.extract", "sessionId": SESSION_ID, "selector": "#out", "outputKey": "result" }),
        ],
    )
}

/// Script answering every call of [`sandbox_plan`]
pub fn sandbox_script(extracted: &str) -> Vec<ScriptedCall> {
    vec![
        ScriptedCall::open("https://example.com"),
        ScriptedCall::click("#go"),
        ScriptedCall::type_text("#q", "hello"),
        ScriptedCall::extract("#out", extracted),
    ]
}

/// Scripted factory preloaded with [`sandbox_script`]
pub fn scripted_sandbox(extracted: &str) -> ScriptedSandbox {
    ScriptedSandbox::new().with_script(SESSION_ID, sandbox_script(extracted))
}

/// Applier that fails its first `failures` calls, then behaves like [`MockApplier`]
#[derive(Debug, Default)]
pub struct FlakyApplier {
    state: Mutex<FlakyState>,
}

#[derive(Debug, Default)]
struct FlakyState {
    remaining: usize,
    calls: usize,
}

impl FlakyApplier {
    pub fn new(failures: usize) -> Self {
        Self {
            state: Mutex::new(FlakyState {
                remaining: failures,
                calls: 0,
            }),
        }
    }

    /// Total `apply` calls so far
    pub fn calls(&self) -> usize {
        self.state.lock().calls
    }
}

impl StepApplier for FlakyApplier {
    fn apply(&self, state: &AgentState, step: &Step) -> Result<AgentState, StepError> {
        {
            let mut flaky = self.state.lock();
            flaky.calls += 1;
            if flaky.remaining > 0 {
                flaky.remaining -= 1;
                return Err(StepError::Failed(format!("injected failure at step {}", step.id)));
            }
        }
        MockApplier.apply(state, step)
    }
}
