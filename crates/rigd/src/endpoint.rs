//! HTTP endpoint the controller exposes to its supervising test process.
//!
//! Four routes under `/Endpoint`, every one gated by the shared-secret token
//! before any other logic runs. Step bodies travel as opaque bytes; only the
//! endpoint itself decodes them.

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, HeaderValue, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use rig_core::protocol::{
    ProtocolError, StepRequest, EXIT_PATH, STATUS_PATH, STEP_PATH, TIMEOUT_PATH,
};
use rig_core::step::{StepContext, StepRegistry};
use rig_core::token::Token;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::runner::{resolve_steps, StepRunner};

/// Shared state for the endpoint handlers.
pub struct AppState {
    pub token: Token,
    pub runner: Arc<StepRunner>,
    pub registry: Arc<StepRegistry>,
    /// Diagnostic recorded if the application failed during startup; makes
    /// `/Endpoint/status` answer 500 with this body verbatim.
    pub startup_error: Option<String>,
    /// Cancelled to begin graceful shutdown.
    pub shutdown: CancellationToken,
    pub home: PathBuf,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("startup_error", &self.startup_error)
            .field("home", &self.home)
            .finish_non_exhaustive()
    }
}

/// Create the endpoint router. The caller nests it under the controller's
/// path prefix if one is configured.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(STATUS_PATH, get(status))
        .route(STEP_PATH, post(step))
        .route(EXIT_PATH, get(exit))
        .route(TIMEOUT_PATH, get(timeout))
        .with_state(state)
}

#[derive(Debug, Deserialize, Default)]
pub struct TokenQuery {
    #[serde(default)]
    token: Option<String>,
}

/// Authenticate the query-string token. Runs first in every handler.
fn check_token(state: &AppState, query: &TokenQuery) -> Result<(), (StatusCode, String)> {
    match &query.token {
        Some(candidate) if state.token.matches(candidate) => Ok(()),
        _ => {
            warn!("rejected request with missing or invalid token");
            Err((StatusCode::FORBIDDEN, "invalid token".to_string()))
        }
    }
}

/// GET /Endpoint/status: readiness probe.
async fn status(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TokenQuery>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    check_token(&state, &query)?;

    match &state.startup_error {
        // The body is surfaced verbatim to the supervising process.
        Some(diagnostic) => Ok((StatusCode::INTERNAL_SERVER_ERROR, diagnostic.clone())),
        None => Ok((StatusCode::OK, String::new())),
    }
}

/// POST /Endpoint/step: execute one (possibly composite) step.
async fn step(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TokenQuery>,
    body: Bytes,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    check_token(&state, &query)?;

    // Content type is deliberately not inspected; the body is opaque bytes.
    let request = StepRequest::decode(&body).map_err(protocol_reject)?;

    // The body token is authenticated independently of the query token; a
    // request assembled against a different session must not execute.
    if !state.token.matches(&request.token) {
        warn!("rejected step request with mismatched body token");
        return Err((StatusCode::FORBIDDEN, "invalid token".to_string()));
    }

    let steps = resolve_steps(&state.registry, request.steps).map_err(protocol_reject)?;
    info!(count = steps.len(), "queueing step request");

    let context = StepContext {
        callback_url: request.callback_url,
        context_path: request.context_path,
        home: state.home.clone(),
        cancel: CancellationToken::new(),
    };

    let response = state.runner.submit(steps, context).await;
    let bytes = response.encode().map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode response: {e}"),
        )
    })?;

    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/octet-stream"),
        )],
        bytes,
    ))
}

/// GET /Endpoint/exit: graceful shutdown. Answers 200 immediately; the
/// process quiesces and exits asynchronously afterward. The in-flight step,
/// if any, is asked to abandon so a long cooperative step cannot hold the
/// exit open.
async fn exit(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TokenQuery>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    check_token(&state, &query)?;

    info!("exit requested; beginning graceful shutdown");
    state.runner.abandon();
    state.shutdown.cancel();
    Ok(StatusCode::OK)
}

/// GET /Endpoint/timeout: abandon the in-flight step, if any.
async fn timeout(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TokenQuery>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    check_token(&state, &query)?;

    state.runner.abandon();
    Ok(StatusCode::OK)
}

fn protocol_reject(err: ProtocolError) -> (StatusCode, String) {
    warn!(error = %err, "rejecting undecodable step request");
    (StatusCode::BAD_REQUEST, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use axum::response::Response;
    use http_body_util::BodyExt;
    use rig_core::protocol::{StepError, StepResponse};
    use rig_core::step::{StepEnvelope, StepFailure};
    use tower::ServiceExt;

    fn test_state() -> Arc<AppState> {
        let mut registry = StepRegistry::new();
        registry.register("echo", |_ctx, p| Ok(p));
        registry.register_typed("fail", |_ctx, message: String| -> Result<(), _> {
            Err(StepFailure::Error(rig_core::RemoteFailure::new(
                "rigd::endpoint::tests::TestError",
                message,
            )))
        });
        registry.register_typed("skip", |_ctx, message: String| -> Result<(), _> {
            Err(StepFailure::assumption(message))
        });

        Arc::new(AppState {
            token: Token::from_string("good-token"),
            runner: Arc::new(StepRunner::new()),
            registry: Arc::new(registry),
            startup_error: None,
            shutdown: CancellationToken::new(),
            home: std::env::temp_dir(),
        })
    }

    fn encode_request(token: &str, steps: Vec<StepEnvelope>) -> Vec<u8> {
        StepRequest {
            token: token.to_string(),
            steps,
            callback_url: "http://127.0.0.1:8080".to_string(),
            context_path: String::new(),
        }
        .encode()
        .unwrap()
    }

    async fn post_step(app: Router, token_query: &str, body: Vec<u8>) -> Response {
        app.oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/Endpoint/step?token={token_query}"))
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap()
    }

    async fn decode_response(response: Response) -> StepResponse {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        StepResponse::decode(&bytes).unwrap()
    }

    #[tokio::test]
    async fn status_ok_when_startup_succeeded() {
        let app = create_router(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/Endpoint/status?token=good-token")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn status_500_carries_startup_diagnostic_verbatim() {
        let state = test_state();
        let state = Arc::new(AppState {
            token: Token::from_string("good-token"),
            runner: Arc::clone(&state.runner),
            registry: Arc::clone(&state.registry),
            startup_error: Some("plugin graph failed: cyclic dependency".to_string()),
            shutdown: CancellationToken::new(),
            home: std::env::temp_dir(),
        });
        let app = create_router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/Endpoint/status?token=good-token")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"plugin graph failed: cyclic dependency");
    }

    #[tokio::test]
    async fn every_endpoint_rejects_a_bad_token() {
        let state = test_state();
        for (method, uri) in [
            ("GET", "/Endpoint/status?token=wrong"),
            ("POST", "/Endpoint/step?token=wrong"),
            ("GET", "/Endpoint/exit?token=wrong"),
            ("GET", "/Endpoint/timeout?token=wrong"),
        ] {
            let app = create_router(Arc::clone(&state));
            let response = app
                .oneshot(
                    Request::builder()
                        .method(method)
                        .uri(uri)
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::FORBIDDEN, "uri: {uri}");
        }
    }

    #[tokio::test]
    async fn missing_token_is_rejected_too() {
        let app = create_router(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/Endpoint/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn step_executes_and_returns_result_bytes() {
        let app = create_router(test_state());
        let body = encode_request(
            "good-token",
            vec![StepEnvelope::new("echo", serde_json::json!({"n": 1})).unwrap()],
        );

        let response = post_step(app, "good-token", body).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/octet-stream"
        );

        let decoded = decode_response(response).await;
        assert_eq!(decoded.result, Some(serde_json::json!({"n": 1})));
    }

    #[tokio::test]
    async fn step_rejects_mismatched_body_token() {
        let app = create_router(test_state());
        let body = encode_request("other-session-token", vec![StepEnvelope::bare("echo")]);

        let response = post_step(app, "good-token", body).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn malformed_body_is_a_protocol_error() {
        let app = create_router(test_state());
        let response = post_step(app, "good-token", b"\x00garbage".to_vec()).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_step_kind_is_a_protocol_error() {
        let app = create_router(test_state());
        let body = encode_request("good-token", vec![StepEnvelope::bare("not-registered")]);

        let response = post_step(app, "good-token", body).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert!(String::from_utf8_lossy(&bytes).contains("not-registered"));
    }

    #[tokio::test]
    async fn failing_step_reports_type_name_and_message() {
        let app = create_router(test_state());
        let body = encode_request(
            "good-token",
            vec![StepEnvelope::new("fail", "boom").unwrap()],
        );

        let response = post_step(app, "good-token", body).await;
        let decoded = decode_response(response).await;
        match decoded.error {
            Some(StepError::Failure(failure)) => {
                assert!(failure.type_name.contains("TestError"));
                assert_eq!(failure.message.as_deref(), Some("boom"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn skipping_step_is_distinct_from_failure() {
        let app = create_router(test_state());
        let body = encode_request(
            "good-token",
            vec![StepEnvelope::new("skip", "no docker").unwrap()],
        );

        let response = post_step(app, "good-token", body).await;
        let decoded = decode_response(response).await;
        assert!(matches!(
            decoded.error,
            Some(StepError::Assumption { ref message }) if message == "no docker"
        ));
    }

    #[tokio::test]
    async fn exit_cancels_the_shutdown_token() {
        let state = test_state();
        let shutdown = state.shutdown.clone();
        let app = create_router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/Endpoint/exit?token=good-token")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn exit_abandons_a_cooperative_step_in_flight() {
        use std::time::{Duration, Instant};

        let mut registry = StepRegistry::new();
        registry.register("wait", |ctx, _p| {
            for _ in 0..600 {
                if ctx.cancel.is_cancelled() {
                    return Err(StepFailure::Error(rig_core::RemoteFailure::new(
                        "rigd::endpoint::tests::Abandoned",
                        "wait abandoned for shutdown",
                    )));
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            Ok(serde_json::Value::Null)
        });

        let state = Arc::new(AppState {
            token: Token::from_string("good-token"),
            runner: Arc::new(StepRunner::new()),
            registry: Arc::new(registry),
            startup_error: None,
            shutdown: CancellationToken::new(),
            home: std::env::temp_dir(),
        });
        let shutdown = state.shutdown.clone();

        let step_app = create_router(Arc::clone(&state));
        let body = encode_request("good-token", vec![StepEnvelope::bare("wait")]);
        let step = tokio::spawn(async move { post_step(step_app, "good-token", body).await });

        // Let the worker pick the job up before requesting exit.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let response = create_router(Arc::clone(&state))
            .oneshot(
                Request::builder()
                    .uri("/Endpoint/exit?token=good-token")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(shutdown.is_cancelled());

        // The cooperative step unwinds promptly instead of running its full
        // six seconds.
        let started = Instant::now();
        let decoded = decode_response(step.await.unwrap()).await;
        assert!(
            started.elapsed() < Duration::from_secs(5),
            "step held the exit open for {:?}",
            started.elapsed()
        );
        match decoded.error {
            Some(StepError::Failure(failure)) => {
                assert!(failure.message.unwrap().contains("abandoned"));
            }
            other => panic!("expected abandonment failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn timeout_endpoint_answers_200_with_no_step_in_flight() {
        let app = create_router(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/Endpoint/timeout?token=good-token")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
