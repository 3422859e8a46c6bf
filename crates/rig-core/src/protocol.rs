//! Wire protocol between the test process and the controller endpoint.
//!
//! Request and response bodies are serde_json encoded but travel as opaque
//! bytes (`application/octet-stream`), so no intermediate body-parsing layer
//! consumes or reshapes the stream. Malformed bytes are a `ProtocolError`:
//! always fatal, never retried.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::failure::RemoteFailure;
use crate::step::StepEnvelope;

/// URL segment all controller endpoints live under, appended to the
/// controller's path prefix.
pub const ENDPOINT_BASE: &str = "/Endpoint";

/// Readiness probe (GET). 200 empty on success, 500 with a diagnostic body if
/// startup failed.
pub const STATUS_PATH: &str = "/Endpoint/status";
/// Step execution (POST, opaque request/response bodies).
pub const STEP_PATH: &str = "/Endpoint/step";
/// Graceful shutdown request (GET).
pub const EXIT_PATH: &str = "/Endpoint/exit";
/// Abandon the in-flight step (GET).
pub const TIMEOUT_PATH: &str = "/Endpoint/timeout";

/// File inside the controller home where the bound port is published.
pub const PORT_FILE: &str = ".rig-port";

/// Child environment variable carrying the shared secret (never argv).
pub const ENV_TOKEN: &str = "RIG_TOKEN";
/// Child environment variable carrying the session id.
pub const ENV_SESSION_ID: &str = "RIG_SESSION_ID";

/// Malformed or undecodable RPC payload.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unknown step kind: {0}")]
    UnknownKind(String),
}

/// Controller-bound request: execute the given steps in order under one
/// invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRequest {
    /// Must equal the session token or the request is rejected.
    pub token: String,
    /// One or more steps, executed sequentially; the last step's result is
    /// the response result.
    pub steps: Vec<StepEnvelope>,
    /// The controller's externally reachable base URL, as seen by the caller.
    pub callback_url: String,
    /// URL path prefix the controller is mounted under.
    pub context_path: String,
}

/// How a remote step invocation went wrong.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepError {
    /// A genuine failure, reconstructed on the calling side.
    Failure(RemoteFailure),
    /// The step signalled that the test should be skipped, not failed.
    Assumption { message: String },
}

/// Test-process-bound response. Exactly one of `result`/`error` is
/// meaningfully populated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResponse {
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<StepError>,
}

impl StepResponse {
    pub fn ok(result: Value) -> Self {
        Self {
            result: Some(result),
            error: None,
        }
    }

    pub fn failed(failure: RemoteFailure) -> Self {
        Self {
            result: None,
            error: Some(StepError::Failure(failure)),
        }
    }

    pub fn skipped(message: impl Into<String>) -> Self {
        Self {
            result: None,
            error: Some(StepError::Assumption {
                message: message.into(),
            }),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

impl StepRequest {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_encodes_and_decodes() {
        let request = StepRequest {
            token: "secret".to_string(),
            steps: vec![
                StepEnvelope::bare("first"),
                StepEnvelope::new("second", serde_json::json!({"n": 7})).unwrap(),
            ],
            callback_url: "http://127.0.0.1:8080".to_string(),
            context_path: "/ctl".to_string(),
        };

        let decoded = StepRequest::decode(&request.encode().unwrap()).unwrap();
        assert_eq!(decoded.token, "secret");
        assert_eq!(decoded.steps.len(), 2);
        assert_eq!(decoded.steps[1].kind, "second");
    }

    #[test]
    fn garbage_bytes_are_a_protocol_error() {
        let err = StepRequest::decode(b"\x00\x01not json").unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn ok_response_populates_only_result() {
        let response = StepResponse::ok(serde_json::json!(42));
        assert_eq!(response.result, Some(serde_json::json!(42)));
        assert!(response.error.is_none());
    }

    #[test]
    fn skipped_response_is_distinct_from_failure() {
        let skipped = StepResponse::skipped("no postgres available");
        let failed = StepResponse::failed(RemoteFailure::new("error", "no postgres available"));

        let skipped = StepResponse::decode(&skipped.encode().unwrap()).unwrap();
        let failed = StepResponse::decode(&failed.encode().unwrap()).unwrap();

        assert!(matches!(
            skipped.error,
            Some(StepError::Assumption { ref message }) if message == "no postgres available"
        ));
        assert!(matches!(failed.error, Some(StepError::Failure(_))));
    }

    #[test]
    fn failure_response_round_trips_the_remote_failure() {
        let failure = RemoteFailure::new("app::BoomError", "boom")
            .with_cause(RemoteFailure::new("error", "root cause"));
        let response = StepResponse::failed(failure.clone());

        let decoded = StepResponse::decode(&response.encode().unwrap()).unwrap();
        match decoded.error {
            Some(StepError::Failure(got)) => assert_eq!(got, failure),
            other => panic!("expected failure, got {other:?}"),
        }
    }
}
