//! Deterministic hashing primitives
//!
//! All cryptographic digests are SHA-256 over a compact UTF-8 JSON encoding
//! with lexicographically sorted object keys, rendered as lowercase hex behind
//! a short type prefix (`ph`, `tl`, `eh`).
//!
//! The state fingerprint ([`state_hash_like`]) is FNV-1a and only marks
//! before/after states inside trace entries. It is never used in place of the
//! chain hashes.

use crate::plan::{AgentState, Plan};
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;

/// Largest integer exactly representable as an IEEE-754 double (2^53 − 1)
pub const MAX_SAFE_INTEGER: i64 = 9_007_199_254_740_991;

/// Plan hash prefix
pub const PLAN_HASH_PREFIX: &str = "ph";
/// Trace link hash prefix
pub const TRACE_LINK_PREFIX: &str = "tl";
/// Execution hash prefix
pub const EXECUTION_HASH_PREFIX: &str = "eh";

const FNV_OFFSET_BASIS: u32 = 2_166_136_261;
const FNV_PRIME: u32 = 16_777_619;

/// Failure to produce a canonical encoding
#[derive(Debug, thiserror::Error)]
pub enum HashError {
    #[error("canonical encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// NFC-normalize a string
#[inline]
#[must_use]
pub fn nfc(s: &str) -> String {
    s.nfc().collect()
}

/// Compact JSON with sorted object keys
///
/// # Errors
/// Returns [`HashError::Encoding`] if `value` cannot be represented as JSON.
pub fn canonical_json<T: Serialize + ?Sized>(value: &T) -> Result<String, HashError> {
    let value = sort_keys(serde_json::to_value(value)?);
    Ok(serde_json::to_string(&value)?)
}

/// Rebuild objects in key order, independent of serde_json's map backing
fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, sort_keys(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}

/// Lowercase hex SHA-256 of `input`
#[must_use]
pub fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

/// `prefix` followed by the hex SHA-256 of `input`
#[must_use]
pub fn prefixed_sha256(prefix: &str, input: &str) -> String {
    let mut out = String::with_capacity(prefix.len() + 64);
    out.push_str(prefix);
    out.push_str(&sha256_hex(input));
    out
}

/// Plan hash: `ph` + SHA-256 of the canonical plan JSON
///
/// # Errors
/// Returns [`HashError`] if the plan cannot be encoded.
pub fn plan_hash(plan: &Plan) -> Result<String, HashError> {
    Ok(prefixed_sha256(PLAN_HASH_PREFIX, &canonical_json(plan)?))
}

/// State view that enters the cryptographic hashes
///
/// Keys sorted, values and logs NFC-normalized. Counters outside the safe
/// integer range are dropped from the view rather than hashed.
#[must_use]
pub fn normalized_state_view(state: &AgentState) -> Value {
    let counters: Map<String, Value> = state
        .counters
        .iter()
        .filter(|(_, v)| v.unsigned_abs() <= MAX_SAFE_INTEGER.unsigned_abs())
        .map(|(k, v)| (k.clone(), Value::from(*v)))
        .collect();
    let values: Map<String, Value> = state
        .values
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(nfc(v))))
        .collect();
    let logs: Vec<Value> = state.logs.iter().map(|l| Value::String(nfc(l))).collect();

    let mut view = Map::new();
    view.insert("counters".into(), Value::Object(counters));
    view.insert("values".into(), Value::Object(values));
    view.insert("logs".into(), Value::Array(logs));
    Value::Object(view)
}

/// Cheap state fingerprint: `h` + 8 hex chars
///
/// 32-bit FNV-1a over the UTF-16 code units of the sorted, non-normalized
/// state JSON.
#[must_use]
pub fn state_hash_like(state: &AgentState) -> String {
    let json = canonical_json(state).unwrap_or_default();
    let hash = json.encode_utf16().fold(FNV_OFFSET_BASIS, |hash, unit| {
        (hash ^ u32::from(unit)).wrapping_mul(FNV_PRIME)
    });
    format!("h{hash:08x}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::Step;
    use serde_json::json;

    #[test]
    fn canonical_json_sorts_keys_at_every_depth() {
        #[derive(Serialize)]
        struct Unsorted {
            zeta: u8,
            alpha: Map<String, Value>,
        }

        let mut nested = Map::new();
        for key in ["z", "m", "a"] {
            nested.insert(key.into(), json!([{ "y": 1, "b": 2 }]));
        }
        let value = Unsorted { zeta: 1, alpha: nested };

        assert_eq!(
            canonical_json(&value).unwrap(),
            r#"{"alpha":{"a":[{"b":2,"y":1}],"m":[{"b":2,"y":1}],"z":[{"b":2,"y":1}]},"zeta":1}"#
        );
    }

    #[test]
    fn sha256_known_vector() {
        assert_eq!(
            sha256_hex("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        let prefixed = prefixed_sha256("ph", "abc");
        assert!(prefixed.starts_with("phba7816bf"));
        assert_eq!(prefixed.len(), 66);
    }

    #[test]
    fn canonical_json_sorts_keys() {
        let value = serde_json::json!({ "b": 1, "a": { "d": 2, "c": 3 } });
        assert_eq!(canonical_json(&value).unwrap(), r#"{"a":{"c":3,"d":2},"b":1}"#);
    }

    #[test]
    fn empty_state_fingerprint() {
        // FNV-1a of {"counters":{},"logs":[],"values":{}}
        let marker = state_hash_like(&AgentState::new());
        assert_eq!(marker.len(), 9);
        assert!(marker.starts_with('h'));
        assert_eq!(marker, state_hash_like(&AgentState::default()));
    }

    #[test]
    fn fingerprint_tracks_state_changes() {
        let mut state = AgentState::new();
        let before = state_hash_like(&state);
        state.counters.insert("n".into(), 1);
        assert_ne!(before, state_hash_like(&state));
    }

    #[test]
    fn state_view_normalizes_and_filters() {
        let mut state = AgentState::new();
        state.values.insert("k".into(), "Cafe\u{0301}".into());
        state.logs.push("e\u{0301}".into());
        state.counters.insert("ok".into(), MAX_SAFE_INTEGER);
        state.counters.insert("big".into(), MAX_SAFE_INTEGER + 1);
        state.counters.insert("low".into(), i64::MIN);

        let view = normalized_state_view(&state);
        assert_eq!(
            view,
            serde_json::json!({
                "counters": { "ok": MAX_SAFE_INTEGER },
                "values": { "k": "Caf\u{00e9}" },
                "logs": ["\u{00e9}"]
            })
        );
    }

    #[test]
    fn plan_hash_is_prefixed() {
        let plan = Plan::new("p1", vec![Step::set("a", "k", "v")]);
        let hash = plan_hash(&plan).unwrap();
        assert!(hash.starts_with("ph"));
        assert_eq!(hash.len(), 66);
        assert_eq!(hash, plan_hash(&plan.clone()).unwrap());
    }
}
