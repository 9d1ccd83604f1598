//! Semantic plan policy
//!
//! Runs on the raw plan before canonicalization and reports rule violations
//! with stable issue codes. It checks presence and basic shape only; string
//! normalization and length limits belong to the canonicalizer.

use crate::error::{IssueCode, ValidationError, ValidationIssue};
use crate::plan::{StepKind, PLAN_VERSION};
use serde_json::{Map, Value};
use std::collections::HashSet;

/// Validate a raw plan against the execution policy
///
/// # Errors
/// Returns every violated rule, in plan order.
pub fn validate_plan(raw: &Value) -> Result<(), ValidationError> {
    let empty = Map::new();
    let plan = raw.as_object().unwrap_or(&empty);
    let mut issues = Vec::new();

    if !is_non_empty_string(plan.get("planId")) {
        issues.push(ValidationIssue::new(
            IssueCode::InvalidPlanId,
            "plan.planId",
            "planId must be a non-empty string",
        ));
    }

    if plan.get("version").and_then(Value::as_f64) != Some(f64::from(PLAN_VERSION)) {
        issues.push(ValidationIssue::new(
            IssueCode::UnsupportedPlanVersion,
            "plan.version",
            "Only plan version 1 is supported",
        ));
    }

    let steps = plan.get("steps").and_then(Value::as_array);
    if steps.map_or(true, Vec::is_empty) {
        issues.push(ValidationIssue::new(
            IssueCode::EmptyPlan,
            "plan.steps",
            "Plan must contain at least one step",
        ));
    }

    let mut seen = HashSet::new();
    for (index, step) in steps.into_iter().flatten().enumerate() {
        if step.is_null() {
            issues.push(ValidationIssue::new(
                IssueCode::UndefinedStep,
                format!("steps[{index}]"),
                format!("Step at index {index} is undefined"),
            ));
            continue;
        }

        let step = step.as_object().unwrap_or(&empty);
        validate_step(step, index, &mut issues);

        if let Some(id) = step.get("id").and_then(Value::as_str) {
            if !id.trim().is_empty() && !seen.insert(id) {
                issues.push(ValidationIssue::new(
                    IssueCode::DuplicateStepId,
                    format!("steps[{index}].id"),
                    format!("Duplicate step id: {id}"),
                ));
            }
        }
    }

    ValidationError::from_issues(issues).map_or(Ok(()), Err)
}

fn validate_step(step: &Map<String, Value>, index: usize, issues: &mut Vec<ValidationIssue>) {
    let path = |field: &str| format!("steps[{index}].{field}");

    if !is_non_empty_string(step.get("id")) {
        issues.push(ValidationIssue::new(
            IssueCode::InvalidStepId,
            path("id"),
            format!("Step at index {index} requires a non-empty id"),
        ));
    }

    let Some(kind) = step.get("kind").and_then(Value::as_str).and_then(StepKind::parse) else {
        // Unknown kinds are reported by canonicalization
        return;
    };
    let id = step.get("id").and_then(Value::as_str).unwrap_or_default();
    let mut require = |ok: bool, code: IssueCode, field: &str, what: &str| {
        if !ok {
            issues.push(ValidationIssue::new(
                code,
                path(field),
                format!("Step '{id}' ({kind}) requires {what}"),
            ));
        }
    };
    let non_empty = |field: &str| is_non_empty_string(step.get(field));

    match kind {
        StepKind::Set => {
            require(non_empty("key"), IssueCode::InvalidStepKey, "key", "non-empty key");
            require(
                step.get("value").is_some_and(Value::is_string),
                IssueCode::InvalidStepValue,
                "value",
                "string value",
            );
        }
        StepKind::Increment => {
            require(non_empty("key"), IssueCode::InvalidStepKey, "key", "non-empty key");
            require(
                is_integer(step.get("value")),
                IssueCode::InvalidStepValue,
                "value",
                "integer value",
            );
        }
        StepKind::AppendLog => {
            require(
                step.get("value").is_some_and(Value::is_string),
                IssueCode::InvalidStepValue,
                "value",
                "string value",
            );
        }
        StepKind::SandboxOpen => {
            require(
                non_empty("sessionId"),
                IssueCode::InvalidSandboxSession,
                "sessionId",
                "non-empty sessionId",
            );
            require(
                is_http_url(step.get("url")),
                IssueCode::InvalidSandboxUrl,
                "url",
                "url starting with http:// or https://",
            );
        }
        StepKind::SandboxClick | StepKind::SandboxType | StepKind::SandboxExtract => {
            require(
                non_empty("sessionId"),
                IssueCode::InvalidSandboxSession,
                "sessionId",
                "non-empty sessionId",
            );
            require(
                non_empty("selector"),
                IssueCode::InvalidSandboxSelector,
                "selector",
                "non-empty selector",
            );
            if kind == StepKind::SandboxType {
                require(
                    non_empty("text"),
                    IssueCode::InvalidSandboxText,
                    "text",
                    "non-empty text",
                );
            }
            if kind == StepKind::SandboxExtract {
                require(
                    non_empty("outputKey"),
                    IssueCode::InvalidSandboxOutputKey,
                    "outputKey",
                    "non-empty outputKey",
                );
            }
        }
    }
}

fn is_non_empty_string(value: Option<&Value>) -> bool {
    value
        .and_then(Value::as_str)
        .is_some_and(|s| !s.trim().is_empty())
}

fn is_http_url(value: Option<&Value>) -> bool {
    is_non_empty_string(value)
        && value
            .and_then(Value::as_str)
            .is_some_and(|s| s.starts_with("http://") || s.starts_with("https://"))
}

fn is_integer(value: Option<&Value>) -> bool {
    value
        .and_then(Value::as_f64)
        .is_some_and(|n| n.is_finite() && n.fract() == 0.0)
}
