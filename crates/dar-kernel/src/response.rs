//! Success/failure envelope returned to callers
//!
//! Wire shape: `{ "ok": true, "result": ..., "meta": {...} }` or
//! `{ "ok": false, "error": {...}, "meta": {...} }`.

use crate::error::DeterministicError;
use crate::plan::ExecutionMode;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Envelope metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMeta {
    pub mode: ExecutionMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

impl ResponseMeta {
    /// Metadata without a step count
    pub fn new(mode: ExecutionMode, trace_id: Option<String>) -> Self {
        Self {
            mode,
            step_count: None,
            trace_id,
        }
    }

    /// Attach a step count
    #[must_use]
    pub fn with_step_count(mut self, step_count: usize) -> Self {
        self.step_count = Some(step_count);
        self
    }
}

/// Discriminated success/failure envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeterministicResponse<T> {
    Success { result: T, meta: ResponseMeta },
    Failure {
        error: DeterministicError,
        meta: ResponseMeta,
    },
}

impl<T> DeterministicResponse<T> {
    /// Check if this is a success
    #[inline]
    #[must_use]
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Envelope metadata
    #[must_use]
    pub fn meta(&self) -> &ResponseMeta {
        match self {
            Self::Success { meta, .. } | Self::Failure { meta, .. } => meta,
        }
    }

    /// Failure detail, if any
    #[must_use]
    pub fn error(&self) -> Option<&DeterministicError> {
        match self {
            Self::Failure { error, .. } => Some(error),
            Self::Success { .. } => None,
        }
    }

    /// Drop the metadata
    ///
    /// # Errors
    /// Returns the carried [`DeterministicError`] for failures.
    pub fn into_result(self) -> Result<T, DeterministicError> {
        match self {
            Self::Success { result, .. } => Ok(result),
            Self::Failure { error, .. } => Err(error),
        }
    }
}

#[derive(Serialize)]
struct EnvelopeOut<'a, T> {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<&'a T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a DeterministicError>,
    meta: &'a ResponseMeta,
}

#[derive(Deserialize)]
struct EnvelopeIn<T> {
    ok: bool,
    result: Option<T>,
    error: Option<DeterministicError>,
    meta: ResponseMeta,
}

impl<T: Serialize> Serialize for DeterministicResponse<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let out = match self {
            Self::Success { result, meta } => EnvelopeOut {
                ok: true,
                result: Some(result),
                error: None,
                meta,
            },
            Self::Failure { error, meta } => EnvelopeOut {
                ok: false,
                result: None,
                error: Some(error),
                meta,
            },
        };
        out.serialize(serializer)
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for DeterministicResponse<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let envelope = EnvelopeIn::<T>::deserialize(deserializer)?;
        match (envelope.ok, envelope.result, envelope.error) {
            (true, Some(result), None) => Ok(Self::Success {
                result,
                meta: envelope.meta,
            }),
            (false, None, Some(error)) => Ok(Self::Failure {
                error,
                meta: envelope.meta,
            }),
            _ => Err(serde::de::Error::custom(
                "envelope must carry `result` when ok and `error` otherwise",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use serde_json::json;

    #[test]
    fn success_shape() {
        let response = DeterministicResponse::Success {
            result: 7,
            meta: ResponseMeta::new(ExecutionMode::Mock, None).with_step_count(2),
        };
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({ "ok": true, "result": 7, "meta": { "mode": "mock", "stepCount": 2 } })
        );
    }

    #[test]
    fn failure_shape_and_back() {
        let response: DeterministicResponse<u32> = DeterministicResponse::Failure {
            error: DeterministicError::invalid_request("bad"),
            meta: ResponseMeta::new(ExecutionMode::Local, Some("t-1".into())),
        };
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(
            value,
            json!({
                "ok": false,
                "error": { "code": "INVALID_REQUEST", "message": "bad", "retryable": false },
                "meta": { "mode": "local", "traceId": "t-1" }
            })
        );

        let back: DeterministicResponse<u32> = serde_json::from_value(value).unwrap();
        assert_eq!(back, response);
        assert_eq!(back.error().map(|e| e.code), Some(ErrorCode::InvalidRequest));
    }

    #[test]
    fn inconsistent_envelope_is_rejected() {
        let raw = json!({ "ok": true, "meta": { "mode": "mock" } });
        assert!(serde_json::from_value::<DeterministicResponse<u32>>(raw).is_err());
    }
}
