//! rigd - reference controller for the controller-rig harness.
//!
//! Library components for the controller process: the HTTP endpoint, the
//! single-flight step runner, and the built-in demo step handlers. A real
//! embedding application links this crate, registers its own step handlers,
//! and calls [`Controller::serve`] from its startup path.

pub mod endpoint;
pub mod runner;
pub mod steps;

use std::path::PathBuf;
use std::sync::Arc;

use rig_core::protocol::PORT_FILE;
use rig_core::step::StepRegistry;
use rig_core::token::Token;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use endpoint::AppState;
use runner::StepRunner;

/// Name of the file in the controller home that poisons startup when present.
/// Its contents become the `/Endpoint/status` diagnostic body.
pub const POISON_FILE: &str = "poison-startup";

/// Controller configuration, assembled from CLI flags and environment by the
/// binary (or by an embedding application directly).
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Controller home directory; the port file and any application state
    /// live here.
    pub home: PathBuf,
    /// Interface to bind. Tests bind loopback only.
    pub host: String,
    /// Port to bind; 0 asks the OS for an ephemeral port.
    pub port: u16,
    /// URL path prefix to mount the endpoint under ("" for root).
    pub prefix: String,
    /// Shared secret authenticating every endpoint request.
    pub token: Token,
    /// Session id assigned by the supervising process, for log correlation.
    pub session_id: Option<String>,
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("failed to bind {host}:{port}: {source}")]
    Bind {
        host: String,
        port: u16,
        source: std::io::Error,
    },
    #[error("failed to publish port file: {0}")]
    PortFile(std::io::Error),
    #[error("server error: {0}")]
    Serve(std::io::Error),
}

/// Controller state.
pub struct Controller {
    config: ControllerConfig,
    registry: Arc<StepRegistry>,
    startup_error: Option<String>,
    shutdown: CancellationToken,
}

impl Controller {
    /// Create a controller. Startup failure (the poison file) is recorded but
    /// does not abort: the endpoint still comes up so the supervising process
    /// can read the diagnostic from `/Endpoint/status`.
    pub fn new(config: ControllerConfig, registry: StepRegistry) -> Self {
        let poison = config.home.join(POISON_FILE);
        let startup_error = match std::fs::read_to_string(&poison) {
            Ok(diagnostic) => {
                warn!(path = %poison.display(), "startup poisoned");
                Some(diagnostic)
            }
            Err(_) => None,
        };

        Self {
            config,
            registry: Arc::new(registry),
            startup_error,
            shutdown: CancellationToken::new(),
        }
    }

    /// Token to cancel for graceful shutdown; `/Endpoint/exit` cancels the
    /// same one.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Bind, publish the bound port, and serve until shutdown is requested.
    pub async fn serve(&self) -> Result<(), ControllerError> {
        let runner = Arc::new(StepRunner::new());

        let listener = tokio::net::TcpListener::bind((self.config.host.as_str(), self.config.port))
            .await
            .map_err(|source| ControllerError::Bind {
                host: self.config.host.clone(),
                port: self.config.port,
                source,
            })?;
        let addr = listener.local_addr().map_err(ControllerError::Serve)?;

        // The port file is the only channel the supervising process has for
        // discovering an ephemeral port, so it must never be visible
        // half-written: write to a sibling then rename.
        publish_port(&self.config.home, addr.port()).map_err(ControllerError::PortFile)?;

        let state = Arc::new(AppState {
            token: self.config.token.clone(),
            runner: Arc::clone(&runner),
            registry: Arc::clone(&self.registry),
            startup_error: self.startup_error.clone(),
            shutdown: self.shutdown.clone(),
            home: self.config.home.clone(),
        });

        let router = endpoint::create_router(state);
        let router = if self.config.prefix.is_empty() {
            router
        } else {
            axum::Router::new().nest(&self.config.prefix, router)
        };

        info!(
            addr = %addr,
            prefix = %self.config.prefix,
            session_id = self.config.session_id.as_deref().unwrap_or("-"),
            startup_failed = self.startup_error.is_some(),
            "controller listening"
        );

        let shutdown = self.shutdown.clone();
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
            .map_err(ControllerError::Serve)?;

        // In-flight work has drained; stop the worker thread before the
        // process reports a clean exit.
        runner.shutdown();
        info!("controller stopped");
        Ok(())
    }
}

/// Atomically write the bound port into `<home>/.rig-port`.
fn publish_port(home: &std::path::Path, port: u16) -> std::io::Result<()> {
    let path = home.join(PORT_FILE);
    let tmp = home.join(format!("{PORT_FILE}.tmp"));
    std::fs::write(&tmp, port.to_string())?;
    std::fs::rename(&tmp, &path)?;
    info!(port, path = %path.display(), "published port");
    Ok(())
}
