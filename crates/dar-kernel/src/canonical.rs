//! Plan canonicalization
//!
//! Turns a raw JSON plan into its unique normal form:
//! - every string is NFC-normalized and trimmed, then length-checked
//! - unrecognized keys are rejected by name
//! - fields that the step kind does not use are rejected
//! - integers must be integral and inside the safe range (±2^53−1)
//! - step ids must be unique
//!
//! Step order is caller-significant and preserved. All issues are collected
//! before failing, so one call reports every problem in the plan.

use crate::error::{IssueCode, ValidationError, ValidationIssue};
use crate::hash::{self, HashError, MAX_SAFE_INTEGER};
use crate::plan::{Plan, Step, StepAction, StepKind, PLAN_VERSION};
use serde_json::{Map, Value};
use std::collections::HashSet;
use unicode_normalization::UnicodeNormalization;

/// Max length of ids, keys, session ids and output keys
pub const MAX_ID_LEN: usize = 256;
/// Max length of free text and log values
pub const MAX_TEXT_LEN: usize = 4096;
/// Max length of sandbox URLs
pub const MAX_URL_LEN: usize = 2048;
/// Max length of sandbox selectors
pub const MAX_SELECTOR_LEN: usize = 512;

const PLAN_KEYS: &[&str] = &["planId", "version", "steps"];
const CORE_STEP_KEYS: &[&str] = &["id", "kind", "key", "value"];
const SANDBOX_STEP_KEYS: &[&str] = &[
    "id",
    "kind",
    "sessionId",
    "url",
    "selector",
    "text",
    "outputKey",
];

/// Canonicalize a raw plan
///
/// # Errors
/// Returns every structural issue found in the plan.
pub fn canonicalize(raw: &Value) -> Result<Plan, ValidationError> {
    let mut issues = Vec::new();

    let Some(obj) = raw.as_object() else {
        return Err(ValidationError::single(ValidationIssue::new(
            IssueCode::ExpectedObject,
            "plan",
            "plan must be an object",
        )));
    };

    check_keys(obj, PLAN_KEYS, "plan", &mut issues);

    let plan_id = normalize_string(obj.get("planId"), "plan.planId", MAX_ID_LEN, &mut issues);

    if obj.get("version").and_then(Value::as_f64) != Some(f64::from(PLAN_VERSION)) {
        issues.push(ValidationIssue::new(
            IssueCode::UnsupportedVersion,
            "plan.version",
            "plan.version must be 1",
        ));
    }

    let mut steps = Vec::new();
    match obj.get("steps").and_then(Value::as_array) {
        Some(raw_steps) => {
            for (index, raw_step) in raw_steps.iter().enumerate() {
                if let Some(step) = normalize_step(raw_step, index, &mut issues) {
                    steps.push(step);
                }
            }
        }
        None => issues.push(ValidationIssue::new(
            IssueCode::ExpectedArray,
            "plan.steps",
            "plan.steps must be an array",
        )),
    }

    let mut seen = HashSet::new();
    for step in &steps {
        if !seen.insert(step.id.as_str()) {
            issues.push(ValidationIssue::new(
                IssueCode::DuplicateStepId,
                "plan.steps",
                format!("Duplicate step id in canonical plan: {}", step.id),
            ));
        }
    }

    if let Some(err) = ValidationError::from_issues(issues) {
        return Err(err);
    }

    Ok(Plan {
        // Present whenever no issue was recorded
        plan_id: plan_id.unwrap_or_default(),
        version: PLAN_VERSION,
        steps,
    })
}

/// Re-canonicalize an already typed plan
///
/// # Errors
/// Returns the issues found, as for [`canonicalize`].
pub fn canonicalize_plan(plan: &Plan) -> Result<Plan, ValidationError> {
    canonicalize(&plan.to_value())
}

/// Compact, sorted-key JSON of a canonical plan; the plan hash input
///
/// # Errors
/// Returns [`HashError`] if the plan cannot be serialized.
pub fn to_canonical_json(plan: &Plan) -> Result<String, HashError> {
    hash::canonical_json(plan)
}

fn normalize_step(raw: &Value, index: usize, issues: &mut Vec<ValidationIssue>) -> Option<Step> {
    let ctx = format!("steps[{index}]");
    let Some(obj) = raw.as_object() else {
        issues.push(ValidationIssue::new(
            IssueCode::ExpectedObject,
            ctx.clone(),
            format!("{ctx} must be an object"),
        ));
        return None;
    };
    let before = issues.len();

    let kind = match obj.get("kind").and_then(Value::as_str).and_then(StepKind::parse) {
        Some(kind) => kind,
        None => {
            issues.push(ValidationIssue::new(
                IssueCode::UnknownKind,
                format!("{ctx}.kind"),
                format!(
                    "{ctx}.kind must be one of: {}",
                    StepKind::ALL.map(StepKind::as_str).join(", ")
                ),
            ));
            return None;
        }
    };
    let id = normalize_string(obj.get("id"), &format!("{ctx}.id"), MAX_ID_LEN, issues);

    let action = if kind.is_sandbox() {
        check_keys(obj, SANDBOX_STEP_KEYS, &ctx, issues);
        normalize_sandbox_action(kind, obj, &ctx, issues)
    } else {
        check_keys(obj, CORE_STEP_KEYS, &ctx, issues);
        normalize_core_action(kind, obj, &ctx, issues)
    };

    if issues.len() > before {
        return None;
    }
    Some(Step::new(id?, action?))
}

fn normalize_core_action(
    kind: StepKind,
    obj: &Map<String, Value>,
    ctx: &str,
    issues: &mut Vec<ValidationIssue>,
) -> Option<StepAction> {
    let key_ctx = format!("{ctx}.key");
    let value_ctx = format!("{ctx}.value");
    match kind {
        StepKind::Set => {
            let key = normalize_string(obj.get("key"), &key_ctx, MAX_ID_LEN, issues);
            let value = normalize_string(obj.get("value"), &value_ctx, MAX_TEXT_LEN, issues);
            Some(StepAction::Set {
                key: key?,
                value: value?,
            })
        }
        StepKind::Increment => {
            let key = normalize_string(obj.get("key"), &key_ctx, MAX_ID_LEN, issues);
            let value = normalize_safe_integer(obj.get("value"), &value_ctx, issues);
            Some(StepAction::Increment {
                key: key?,
                value: value?,
            })
        }
        StepKind::AppendLog => {
            reject_present(obj, "key", kind, ctx, issues);
            let value = normalize_string(obj.get("value"), &value_ctx, MAX_TEXT_LEN, issues);
            Some(StepAction::AppendLog { value: value? })
        }
        _ => None,
    }
}

fn normalize_sandbox_action(
    kind: StepKind,
    obj: &Map<String, Value>,
    ctx: &str,
    issues: &mut Vec<ValidationIssue>,
) -> Option<StepAction> {
    let field = |name: &str| format!("{ctx}.{name}");

    let used: &[&str] = match kind {
        StepKind::SandboxOpen => &["url"],
        StepKind::SandboxClick => &["selector"],
        StepKind::SandboxType => &["selector", "text"],
        StepKind::SandboxExtract => &["selector", "outputKey"],
        _ => return None,
    };
    for name in ["url", "selector", "text", "outputKey"] {
        if !used.contains(&name) {
            reject_present(obj, name, kind, ctx, issues);
        }
    }

    let session_id =
        normalize_string(obj.get("sessionId"), &field("sessionId"), MAX_ID_LEN, issues);
    let selector_ctx = field("selector");

    let action = match kind {
        StepKind::SandboxOpen => {
            let url = normalize_http_url(obj.get("url"), &field("url"), issues);
            StepAction::SandboxOpen {
                session_id: session_id?,
                url: url?,
            }
        }
        StepKind::SandboxClick => {
            let selector =
                normalize_string(obj.get("selector"), &selector_ctx, MAX_SELECTOR_LEN, issues);
            StepAction::SandboxClick {
                session_id: session_id?,
                selector: selector?,
            }
        }
        StepKind::SandboxType => {
            let selector =
                normalize_string(obj.get("selector"), &selector_ctx, MAX_SELECTOR_LEN, issues);
            let text = normalize_string(obj.get("text"), &field("text"), MAX_TEXT_LEN, issues);
            StepAction::SandboxType {
                session_id: session_id?,
                selector: selector?,
                text: text?,
            }
        }
        _ => {
            let selector =
                normalize_string(obj.get("selector"), &selector_ctx, MAX_SELECTOR_LEN, issues);
            let output_key =
                normalize_string(obj.get("outputKey"), &field("outputKey"), MAX_ID_LEN, issues);
            StepAction::SandboxExtract {
                session_id: session_id?,
                selector: selector?,
                output_key: output_key?,
            }
        }
    };
    Some(action)
}

fn check_keys(
    obj: &Map<String, Value>,
    allowed: &[&str],
    ctx: &str,
    issues: &mut Vec<ValidationIssue>,
) {
    // serde_json maps iterate in sorted key order
    let extras: Vec<&str> = obj
        .keys()
        .map(String::as_str)
        .filter(|k| !allowed.contains(k))
        .collect();
    if !extras.is_empty() {
        issues.push(ValidationIssue::new(
            IssueCode::UnsupportedFields,
            ctx,
            format!("{ctx} contains unsupported fields: {}", extras.join(", ")),
        ));
    }
}

fn reject_present(
    obj: &Map<String, Value>,
    name: &str,
    kind: StepKind,
    ctx: &str,
    issues: &mut Vec<ValidationIssue>,
) {
    if obj.contains_key(name) {
        issues.push(ValidationIssue::new(
            IssueCode::FieldNotAllowed,
            format!("{ctx}.{name}"),
            format!("{ctx}.{name} must not be present for {kind}"),
        ));
    }
}

/// NFC-normalize and trim
#[must_use]
pub fn normalize_text(s: &str) -> String {
    s.nfc().collect::<String>().trim().to_owned()
}

fn normalize_string(
    value: Option<&Value>,
    ctx: &str,
    max_len: usize,
    issues: &mut Vec<ValidationIssue>,
) -> Option<String> {
    let Some(s) = value.and_then(Value::as_str) else {
        issues.push(ValidationIssue::new(
            IssueCode::ExpectedString,
            ctx,
            format!("{ctx} must be a string"),
        ));
        return None;
    };
    let normalized = normalize_text(s);
    if normalized.is_empty() {
        issues.push(ValidationIssue::new(
            IssueCode::EmptyString,
            ctx,
            format!("{ctx} must be a non-empty string"),
        ));
        return None;
    }
    if normalized.chars().count() > max_len {
        issues.push(ValidationIssue::new(
            IssueCode::TooLong,
            ctx,
            format!("{ctx} exceeds max length {max_len}"),
        ));
        return None;
    }
    Some(normalized)
}

fn normalize_http_url(
    value: Option<&Value>,
    ctx: &str,
    issues: &mut Vec<ValidationIssue>,
) -> Option<String> {
    let url = normalize_string(value, ctx, MAX_URL_LEN, issues)?;
    if !url.starts_with("http://") && !url.starts_with("https://") {
        issues.push(ValidationIssue::new(
            IssueCode::InvalidUrl,
            ctx,
            format!("{ctx} must start with http:// or https://"),
        ));
        return None;
    }
    Some(url)
}

#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
fn normalize_safe_integer(
    value: Option<&Value>,
    ctx: &str,
    issues: &mut Vec<ValidationIssue>,
) -> Option<i64> {
    let not_integer = || {
        ValidationIssue::new(
            IssueCode::NotInteger,
            ctx,
            format!("{ctx} must be a finite integer"),
        )
    };
    let unsafe_integer = || {
        ValidationIssue::new(
            IssueCode::UnsafeInteger,
            ctx,
            format!("{ctx} must be a safe integer"),
        )
    };

    let Some(n) = value.and_then(Value::as_number) else {
        issues.push(not_integer());
        return None;
    };

    let parsed = if let Some(i) = n.as_i64() {
        Some(i)
    } else if n.as_u64().is_some() {
        // Only reachable above i64::MAX
        None
    } else {
        match n.as_f64() {
            Some(f) if f.is_finite() && f.fract() == 0.0 => {
                if f.abs() > MAX_SAFE_INTEGER as f64 {
                    None
                } else {
                    Some(f as i64)
                }
            }
            _ => {
                issues.push(not_integer());
                return None;
            }
        }
    };

    match parsed {
        Some(i) if i.unsigned_abs() <= MAX_SAFE_INTEGER.unsigned_abs() => Some(i),
        _ => {
            issues.push(unsafe_integer());
            None
        }
    }
}
