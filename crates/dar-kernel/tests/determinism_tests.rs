//! Determinism properties of canonicalization, execution and replay

use dar_kernel::canonical::canonicalize;
use dar_kernel::error::ErrorCode;
use dar_kernel::executor::{ExecuteOptions, Executor};
use dar_kernel::hash::plan_hash;
use dar_kernel::replay::verify_execution_replay;
use dar_kernel::response::DeterministicResponse;
use dar_kernel::trace::{verify_trace_chain, ChainBreak, GENESIS_TRACE_LINK};
use dar_test_utils::{log_plan, p1_final_state, p1_plan, plan_with_steps};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use serde_json::{json, Value};

fn options(max_steps: i64) -> ExecuteOptions {
    ExecuteOptions::default().with_max_steps(max_steps)
}

/// Arbitrary valid core step
fn core_step(index: usize) -> impl Strategy<Value = Value> {
    let key = "[a-z]{1,6}";
    prop_oneof![
        (key, "[a-zA-Z0-9][a-zA-Z0-9 ]{0,10}[a-z]").prop_map(move |(k, v)| {
            json!({ "id": format!("s{index}"), "kind": "set", "key": k, "value": v })
        }),
        (key, -1_000_i64..1_000).prop_map(move |(k, v)| {
            json!({ "id": format!("s{index}"), "kind": "increment", "key": k, "value": v })
        }),
        "[a-z][a-z ]{0,14}[a-z]".prop_map(move |v| {
            json!({ "id": format!("s{index}"), "kind": "append_log", "value": v })
        }),
    ]
}

fn core_plan() -> impl Strategy<Value = Value> {
    (1_usize..12).prop_flat_map(|n| {
        (0..n)
            .map(core_step)
            .collect::<Vec<_>>()
            .prop_map(|steps| plan_with_steps("prop", steps))
    })
}

#[test]
fn p1_scenario() {
    let first = Executor::new().execute(&p1_plan(), &options(10)).unwrap();
    let second = Executor::new().execute(&p1_plan(), &options(10)).unwrap();

    assert!(first.plan_hash.starts_with("ph"));
    assert!(first.execution_hash.starts_with("eh"));
    assert_eq!(first.plan_hash, second.plan_hash);
    assert_eq!(first.execution_hash, second.execution_hash);
    assert_eq!(first.trace.len(), 2);
    assert_eq!(first.final_state, p1_final_state());
    assert_eq!(first.trace[0].previous_trace_link_hash, GENESIS_TRACE_LINK);
    assert!(first.converged);
}

#[test]
fn unicode_and_whitespace_variants_share_a_hash() {
    let composed = plan_with_steps(
        "caf\u{00e9}",
        vec![json!({ "id": "a", "kind": "set", "key": "nom", "value": "cr\u{00e8}me" })],
    );
    let decomposed = plan_with_steps(
        "  cafe\u{0301}\t",
        vec![json!({ "id": " a ", "kind": "set", "key": "nom", "value": "cre\u{0300}me  " })],
    );

    let a = canonicalize(&composed).unwrap();
    let b = canonicalize(&decomposed).unwrap();
    assert_eq!(a, b);
    assert_eq!(plan_hash(&a).unwrap(), plan_hash(&b).unwrap());
}

#[test]
fn budget_is_enforced_before_any_step() {
    let response = Executor::new().execute_deterministic_plan(&log_plan(5), &options(4));
    let DeterministicResponse::Failure { error, meta } = response else {
        panic!("expected failure");
    };
    assert_eq!(error.code, ErrorCode::ExecutionConvergenceFailed);
    assert!(!error.retryable);
    assert_eq!(meta.step_count, Some(0));
}

#[test]
fn tampered_trace_is_detected() {
    let result = Executor::new().execute(&log_plan(4), &options(10)).unwrap();
    assert_eq!(verify_trace_chain(&result.trace), Ok(()));

    let mut relinked = result.trace.clone();
    relinked[2].previous_trace_link_hash = relinked[0].trace_link_hash.clone();
    assert_eq!(
        verify_trace_chain(&relinked),
        Err(ChainBreak::BrokenLink { position: 2 })
    );

    let mut reordered = result.trace.clone();
    reordered.swap(1, 2);
    assert!(verify_trace_chain(&reordered).is_err());

    let mut forged = result.clone();
    forged.trace[3].after_hash_like = "h00000000".into();
    forged.trace[3].trace_link_hash.push('0');
    forged.final_trace_link_hash = forged.trace[3].trace_link_hash.clone();
    assert!(!verify_execution_replay(&log_plan(4), &forged).is_ok());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn execution_is_deterministic(plan in core_plan()) {
        let a = Executor::new().execute(&plan, &options(20));
        let b = Executor::new().execute(&plan, &options(20));
        prop_assert_eq!(&a, &b);

        if let Ok(result) = a {
            prop_assert_eq!(result.trace.len(), result.steps_executed);
            prop_assert!(verify_trace_chain(&result.trace).is_ok());
            prop_assert!(verify_execution_replay(&plan, &result).is_ok());
        }
    }

    #[test]
    fn padding_does_not_change_the_plan_hash(plan in core_plan(), pad in " {1,3}") {
        let mut padded = plan.clone();
        if let Some(id) = padded["planId"].as_str().map(str::to_owned) {
            padded["planId"] = json!(format!("{pad}{id}{pad}"));
        }
        if let Some(steps) = padded["steps"].as_array_mut() {
            for step in steps {
                if let Some(id) = step["id"].as_str().map(str::to_owned) {
                    step["id"] = json!(format!("{id}{pad}"));
                }
            }
        }

        let original = canonicalize(&plan).unwrap();
        let normalized = canonicalize(&padded).unwrap();
        prop_assert_eq!(&original, &normalized);
        prop_assert_eq!(plan_hash(&original).unwrap(), plan_hash(&normalized).unwrap());
    }

    #[test]
    fn every_link_depends_on_its_step(plan in core_plan()) {
        let result = Executor::new().execute(&plan, &options(20)).unwrap();
        let mut seen = std::collections::HashSet::new();
        for entry in &result.trace {
            prop_assert!(entry.trace_link_hash.starts_with("tl"));
            prop_assert!(seen.insert(entry.trace_link_hash.clone()));
        }
    }
}
