//! Deterministic readiness polling for a launched controller.
//!
//! The prober never sleeps an arbitrary "long enough" amount: it polls the
//! port file and the status endpoint on a fixed interval until the controller
//! proves it is ready, proves it failed, or the attempt budget runs out.
//! Those three outcomes are distinct errors so callers never have to guess.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rig_core::protocol::{PORT_FILE, STATUS_PATH};
use rig_core::token::Token;
use thiserror::Error;
use tracing::{debug, warn};

use crate::supervisor::ControllerProcess;

/// Fixed poll interval.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default attempt budget (~3 minutes at the poll interval).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 1800;

/// When set in the harness process environment, the attempt budget is
/// ignored and the prober polls until the controller resolves one way or the
/// other. Meant for stepping through controller startup under a debugger.
pub const ENV_UNBOUNDED_STARTUP: &str = "RIG_UNBOUNDED_STARTUP";

pub type Result<T> = std::result::Result<T, ProbeError>;

#[derive(Debug, Error)]
pub enum ProbeError {
    /// The process died while we were still waiting for it.
    #[error("controller died during startup (exit code {code:?}); recent output:\n{tail}")]
    Died { code: Option<i32>, tail: String },
    /// The controller reported an explicit startup failure; `body` is the
    /// diagnostic exactly as the controller produced it.
    #[error("controller startup failed: {body}")]
    StartupFailed { body: String },
    /// The attempt budget ran out with no diagnosis either way.
    #[error("controller not ready after {attempts} attempts")]
    TimedOut { attempts: u32 },
}

/// Polls one launched controller to readiness.
#[derive(Debug, Clone)]
pub struct ReadinessProber {
    http: reqwest::Client,
    home: PathBuf,
    scheme: &'static str,
    host: String,
    prefix: String,
    token: Token,
    max_attempts: u32,
}

impl ReadinessProber {
    pub fn new(
        http: reqwest::Client,
        home: PathBuf,
        scheme: &'static str,
        host: String,
        prefix: String,
        token: Token,
        max_attempts: u32,
    ) -> Self {
        Self {
            http,
            home,
            scheme,
            host,
            prefix,
            token,
            max_attempts,
        }
    }

    /// Poll until the controller is ready, returning the bound port.
    ///
    /// On `StartupFailed` and `TimedOut` the process is killed before the
    /// error is returned; on `Died` it is already gone.
    pub async fn await_ready(&self, process: &mut ControllerProcess) -> Result<u16> {
        let bounded = std::env::var_os(ENV_UNBOUNDED_STARTUP).is_none();
        let mut attempts = 0u32;

        loop {
            if bounded && attempts >= self.max_attempts {
                warn!(attempts, "controller startup timed out");
                process.kill().await;
                return Err(ProbeError::TimedOut { attempts });
            }
            attempts += 1;

            if !process.is_alive() {
                return Err(ProbeError::Died {
                    code: process.exit_code(),
                    tail: process.output_tail(),
                });
            }

            if let Some(port) = read_port(&self.home) {
                let url = status_url(self.scheme, &self.host, port, &self.prefix, &self.token);
                match self.http.get(&url).send().await {
                    Ok(response) if response.status().as_u16() == 200 => {
                        debug!(port, attempts, "controller ready");
                        return Ok(port);
                    }
                    Ok(response) if response.status().as_u16() == 500 => {
                        let body = response.text().await.unwrap_or_default();
                        warn!(port, "controller reported startup failure");
                        process.kill().await;
                        return Err(ProbeError::StartupFailed { body });
                    }
                    // Connection refused, proxy interference, partial
                    // startup: all retryable.
                    Ok(_) | Err(_) => {}
                }
            }

            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

/// Read the published port from `<home>/.rig-port`, if present and parseable.
fn read_port(home: &Path) -> Option<u16> {
    std::fs::read_to_string(home.join(PORT_FILE))
        .ok()
        .and_then(|contents| contents.trim().parse::<u16>().ok())
}

fn status_url(scheme: &str, host: &str, port: u16, prefix: &str, token: &Token) -> String {
    format!(
        "{scheme}://{host}:{port}{prefix}{STATUS_PATH}?token={}",
        urlencoding::encode(token.as_str())
    )
}
