//! HTTP step channel from the test process to a ready controller.
//!
//! Bodies travel as opaque bytes; the token rides as a query parameter and
//! again inside the request body. Assumption responses and genuine failures
//! come back as distinct error variants, so callers can map one to "skip
//! this test" and the other to a real failure.

use rig_core::failure::RemoteFailure;
use rig_core::protocol::{
    ProtocolError, StepError, StepRequest, StepResponse, EXIT_PATH, STEP_PATH, TIMEOUT_PATH,
};
use rig_core::step::StepEnvelope;
use rig_core::token::Token;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::supervisor::TlsMaterial;

pub type Result<T> = std::result::Result<T, ChannelError>;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("failed to read tls trust root: {0}")]
    TlsMaterial(std::io::Error),
    /// 403 from the controller; the session tokens do not line up.
    #[error("controller rejected the request: {body}")]
    Unauthorized { body: String },
    /// Any other non-success status, with whatever error-body text the
    /// controller attached.
    #[error("controller answered {status}: {body}")]
    Status { status: u16, body: String },
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// The remote step asked for the surrounding test to be skipped.
    #[error("step skipped: {0}")]
    Skipped(String),
    /// The remote step genuinely failed; `failure` carries the reconstructed
    /// report from the controller process.
    #[error("{message}")]
    Remote {
        message: String,
        failure: Box<RemoteFailure>,
    },
}

impl ChannelError {
    /// The reconstructed remote failure, when this error carries one.
    pub fn remote_failure(&self) -> Option<&RemoteFailure> {
        match self {
            Self::Remote { failure, .. } => Some(failure),
            _ => None,
        }
    }
}

/// Build the HTTP client the channel and prober share. With TLS material the
/// trust root is installed so the controller's certificate verifies.
pub fn http_client(tls: Option<&TlsMaterial>) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder();
    if let Some(tls) = tls {
        let pem = std::fs::read(&tls.trust_path).map_err(ChannelError::TlsMaterial)?;
        let certificate = reqwest::Certificate::from_pem(&pem)?;
        builder = builder.add_root_certificate(certificate);
    }
    Ok(builder.build()?)
}

/// A handle on one ready controller's RPC surface. Cheap to clone.
#[derive(Debug, Clone)]
pub struct StepChannel {
    base_url: String,
    token: Token,
    session_name: Option<String>,
    context_path: String,
    http: reqwest::Client,
}

impl StepChannel {
    pub fn new(
        base_url: String,
        token: Token,
        session_name: Option<String>,
        context_path: String,
        http: reqwest::Client,
    ) -> Self {
        Self {
            base_url,
            token,
            session_name,
            context_path,
            http,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}{path}?token={}",
            self.base_url,
            urlencoding::encode(self.token.as_str())
        )
    }

    /// Execute steps sequentially under one controller invocation and return
    /// the last step's result.
    pub async fn run(&self, steps: Vec<StepEnvelope>) -> Result<Value> {
        let request = StepRequest {
            token: self.token.as_str().to_string(),
            steps,
            callback_url: self.base_url.clone(),
            context_path: self.context_path.clone(),
        };
        let body = request.encode()?;

        debug!(count = request.steps.len(), "posting step request");
        let response = self
            .http
            .post(self.url(STEP_PATH))
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(body)
            .send()
            .await?;

        let status = response.status().as_u16();
        let bytes = response.bytes().await?;
        if status == 403 {
            return Err(ChannelError::Unauthorized {
                body: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }
        if status != 200 {
            return Err(ChannelError::Status {
                status,
                body: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }

        match StepResponse::decode(&bytes)? {
            StepResponse {
                error: Some(StepError::Assumption { message }),
                ..
            } => Err(ChannelError::Skipped(message)),
            StepResponse {
                error: Some(StepError::Failure(failure)),
                ..
            } => Err(self.remote(failure)),
            StepResponse { result, .. } => Ok(result.unwrap_or(Value::Null)),
        }
    }

    /// Like [`run`](Self::run) but decodes the final result into `T`.
    pub async fn run_as<T: DeserializeOwned>(&self, steps: Vec<StepEnvelope>) -> Result<T> {
        let value = self.run(steps).await?;
        Ok(serde_json::from_value(value).map_err(ProtocolError::from)?)
    }

    /// Request graceful controller shutdown. 200 means the request was
    /// accepted; the process exits asynchronously afterward.
    pub async fn exit(&self) -> Result<()> {
        let response = self.http.get(self.url(EXIT_PATH)).send().await?;
        let status = response.status().as_u16();
        if status != 200 {
            let body = response.text().await.unwrap_or_default();
            return Err(ChannelError::Status { status, body });
        }
        Ok(())
    }

    /// Ask the controller to abandon the in-flight step, if any.
    pub async fn abandon(&self) -> Result<()> {
        self.http.get(self.url(TIMEOUT_PATH)).send().await?;
        Ok(())
    }

    fn remote(&self, failure: RemoteFailure) -> ChannelError {
        let message = match &self.session_name {
            Some(name) => format!("step failed in session {name}: {}", failure.summary()),
            None => format!("step failed: {}", failure.summary()),
        };
        ChannelError::Remote {
            message,
            failure: Box::new(failure),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_channel(name: Option<&str>) -> StepChannel {
        StepChannel::new(
            "http://127.0.0.1:8080".to_string(),
            Token::from_string("secret token"),
            name.map(String::from),
            String::new(),
            reqwest::Client::new(),
        )
    }

    #[test]
    fn url_encodes_the_token() {
        let channel = test_channel(None);
        assert_eq!(
            channel.url(STEP_PATH),
            "http://127.0.0.1:8080/Endpoint/step?token=secret%20token"
        );
    }

    #[test]
    fn remote_error_names_the_session() {
        let channel = test_channel(Some("primary"));
        let err = channel.remote(RemoteFailure::new("app::Boom", "went wrong"));
        let shown = err.to_string();
        assert!(shown.contains("primary"), "got: {shown}");
        assert!(shown.contains("went wrong"), "got: {shown}");
    }

    #[test]
    fn remote_error_without_a_session_name() {
        let channel = test_channel(None);
        let err = channel.remote(RemoteFailure::new("app::Boom", "went wrong"));
        assert!(err.to_string().starts_with("step failed:"));
        assert!(err.remote_failure().is_some());
    }
}
