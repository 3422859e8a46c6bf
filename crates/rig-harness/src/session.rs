//! Controller session lifecycle.
//!
//! A `ControllerSession` owns everything one controller needs across its
//! whole life: the home directory, the shared-secret token, the pinned port,
//! the process handle, the step channel, and the timeout guard. Operations
//! are legal only in specific states; calling them elsewhere is an
//! `IllegalState` error rather than undefined behavior.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rig_core::protocol::PORT_FILE;
use rig_core::step::StepEnvelope;
use rig_core::token::Token;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::channel::{self, ChannelError, StepChannel};
use crate::guard::{TimeoutGuard, DEFAULT_GRACE};
use crate::prober::{ProbeError, ReadinessProber, DEFAULT_MAX_ATTEMPTS};
use crate::supervisor::{self, ControllerProcess, LaunchError, LaunchPlan, TlsMaterial};

/// How long a graceful stop waits for the process to exit cleanly.
const STOP_WAIT: Duration = Duration::from_secs(60);

/// Default per-session timeout budget.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

pub type Result<T> = std::result::Result<T, SessionError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unprovisioned,
    Provisioned,
    Launching,
    Ready,
    Stopping,
    Stopped,
    /// Terminal: the session cannot be restarted.
    Failed,
    /// Terminal: the timeout guard fired and killed the controller.
    TimedOut,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unprovisioned => "unprovisioned",
            Self::Provisioned => "provisioned",
            Self::Launching => "launching",
            Self::Ready => "ready",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
            Self::TimedOut => "timed out",
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("launch failed: {0}")]
    Launch(#[from] LaunchError),
    #[error("readiness probe failed: {0}")]
    Probe(#[from] ProbeError),
    #[error(transparent)]
    Step(#[from] ChannelError),
    #[error("shutdown failure: {0}")]
    Shutdown(String),
    #[error("cannot {operation} while {actual} (expected {expected})")]
    IllegalState {
        operation: &'static str,
        expected: &'static str,
        actual: &'static str,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Materializes the controller home before first launch. The default just
/// creates the directory; embedding applications provide their own to seed
/// plugins, fixtures, or configuration.
pub trait Provisioner: Send + Sync {
    fn provision(&self, home: &Path) -> std::io::Result<()>;
}

/// Default provisioner: an empty home directory.
#[derive(Debug, Default)]
pub struct DirProvisioner;

impl Provisioner for DirProvisioner {
    fn provision(&self, home: &Path) -> std::io::Result<()> {
        std::fs::create_dir_all(home)
    }
}

/// Knobs for one session. `new` fills in the defaults; tests override what
/// they care about.
pub struct SessionConfig {
    /// Controller executable to launch.
    pub program: PathBuf,
    pub host: String,
    /// URL path prefix the controller mounts its endpoint under.
    pub prefix: String,
    /// Human-readable name surfaced in logs and step error messages.
    pub name: Option<String>,
    /// Home directory override; by default a fresh directory under the
    /// system temp dir, owned (and eventually removed) by the session.
    pub home: Option<PathBuf>,
    /// Whole-session budget; `Duration::ZERO` disables the guard.
    pub timeout: Duration,
    /// Grace between abandon and forcible kill on timeout.
    pub grace: Duration,
    pub extra_args: Vec<String>,
    pub extra_env: Vec<(String, String)>,
    pub tls: Option<TlsMaterial>,
    pub max_ready_attempts: u32,
}

impl std::fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConfig")
            .field("program", &self.program)
            .field("host", &self.host)
            .field("prefix", &self.prefix)
            .field("name", &self.name)
            .field("home", &self.home)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl SessionConfig {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            host: "127.0.0.1".to_string(),
            prefix: String::new(),
            name: None,
            home: None,
            timeout: DEFAULT_TIMEOUT,
            grace: DEFAULT_GRACE,
            extra_args: Vec::new(),
            extra_env: Vec::new(),
            tls: None,
            max_ready_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// One controller across its whole lifecycle, restarts included.
pub struct ControllerSession {
    config: SessionConfig,
    state: SessionState,
    id: String,
    home: PathBuf,
    owns_home: bool,
    token: Token,
    /// `None` until first readiness, then pinned for every relaunch.
    port: Option<u16>,
    process: Option<Arc<Mutex<ControllerProcess>>>,
    channel: Option<StepChannel>,
    guard: Option<TimeoutGuard>,
    provisioner: Box<dyn Provisioner>,
}

impl std::fmt::Debug for ControllerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerSession")
            .field("id", &self.id)
            .field("state", &self.state.as_str())
            .field("home", &self.home)
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

impl ControllerSession {
    pub fn new(config: SessionConfig) -> Self {
        let id = Uuid::now_v7().to_string();
        let (home, owns_home) = match &config.home {
            Some(home) => (home.clone(), false),
            None => (std::env::temp_dir().join(format!("rig-{id}")), true),
        };

        Self {
            config,
            state: SessionState::Unprovisioned,
            id,
            home,
            owns_home,
            token: Token::generate(),
            port: None,
            process: None,
            channel: None,
            guard: None,
            provisioner: Box::new(DirProvisioner),
        }
    }

    /// Replace the provisioner before the home is materialized.
    pub fn with_provisioner(mut self, provisioner: impl Provisioner + 'static) -> Self {
        self.provisioner = Box::new(provisioner);
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    /// Pinned port; `None` before the first successful start.
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Controller base URL while a channel exists.
    pub fn url(&self) -> Option<&str> {
        self.channel.as_ref().map(StepChannel::base_url)
    }

    /// Materialize the home directory. Idempotent.
    pub fn provision(&mut self) -> Result<()> {
        match self.state {
            SessionState::Unprovisioned => {
                self.provisioner.provision(&self.home)?;
                info!(session = %self.display_name(), home = %self.home.display(), "provisioned");
                self.state = SessionState::Provisioned;
                Ok(())
            }
            // Already materialized; nothing to redo.
            _ => Ok(()),
        }
    }

    /// Launch the controller and block until it is ready.
    pub async fn start(&mut self) -> Result<()> {
        match self.state {
            SessionState::Unprovisioned => self.provision()?,
            SessionState::Provisioned | SessionState::Stopped => {}
            other => {
                return Err(SessionError::IllegalState {
                    operation: "start",
                    expected: "provisioned or stopped",
                    actual: other.as_str(),
                });
            }
        }
        self.state = SessionState::Launching;

        // A stale port file from a previous run would race the prober into
        // probing a port nothing listens on yet.
        let _ = std::fs::remove_file(self.home.join(PORT_FILE));

        let plan = LaunchPlan {
            program: self.config.program.clone(),
            home: self.home.clone(),
            host: self.config.host.clone(),
            port: self.port.unwrap_or(0),
            prefix: self.config.prefix.clone(),
            token: self.token.clone(),
            session_id: self.id.clone(),
            session_name: self.config.name.clone(),
            extra_args: self.config.extra_args.clone(),
            extra_env: self.config.extra_env.clone(),
            tls: self.config.tls.clone(),
            output_sink: None,
        };

        let mut process = match supervisor::launch(&plan).await {
            Ok(process) => process,
            Err(e) => {
                self.state = SessionState::Failed;
                return Err(e.into());
            }
        };

        let http = channel::http_client(self.config.tls.as_ref())?;
        let scheme = if self.config.tls.is_some() { "https" } else { "http" };
        let prober = ReadinessProber::new(
            http.clone(),
            self.home.clone(),
            scheme,
            self.config.host.clone(),
            self.config.prefix.clone(),
            self.token.clone(),
            self.config.max_ready_attempts,
        );

        let port = match prober.await_ready(&mut process).await {
            Ok(port) => port,
            Err(e) => {
                self.state = SessionState::Failed;
                return Err(e.into());
            }
        };

        // Relaunch must come back on the pinned port; a silently different
        // port would invalidate every URL handed out so far.
        if let Some(pinned) = self.port {
            if pinned != port {
                process.kill().await;
                self.state = SessionState::Failed;
                return Err(SessionError::Launch(LaunchError::PortMismatch {
                    pinned,
                    actual: port,
                }));
            }
        }
        self.port = Some(port);

        let base_url = format!("{scheme}://{}:{port}{}", self.config.host, self.config.prefix);
        let channel = StepChannel::new(
            base_url,
            self.token.clone(),
            self.config.name.clone(),
            self.config.prefix.clone(),
            http,
        );

        let process = Arc::new(Mutex::new(process));
        if self.config.timeout > Duration::ZERO {
            self.guard = Some(TimeoutGuard::arm(
                channel.clone(),
                Arc::clone(&process),
                self.config.timeout,
                self.config.grace,
            ));
        }

        self.process = Some(process);
        self.channel = Some(channel);
        self.state = SessionState::Ready;
        info!(session = %self.display_name(), port, "controller ready");
        Ok(())
    }

    /// Execute steps on the controller. Legal only while ready.
    pub async fn run(&self, steps: Vec<StepEnvelope>) -> Result<Value> {
        Ok(self.ready_channel("run")?.run(steps).await?)
    }

    /// Like [`run`](Self::run) but decodes the result into `T`.
    pub async fn run_as<T: DeserializeOwned>(&self, steps: Vec<StepEnvelope>) -> Result<T> {
        Ok(self.ready_channel("run")?.run_as(steps).await?)
    }

    /// Ask the controller to abandon its in-flight step, if any.
    pub async fn abandon(&self) -> Result<()> {
        Ok(self.ready_channel("abandon")?.abandon().await?)
    }

    /// Gracefully stop the controller: exit RPC, then wait for a clean exit.
    /// Anything other than exit code 0 within the window is a hard error and
    /// the process is killed.
    pub async fn stop(&mut self) -> Result<()> {
        if self.state != SessionState::Ready {
            return Err(SessionError::IllegalState {
                operation: "stop",
                expected: "ready",
                actual: self.state.as_str(),
            });
        }
        self.state = SessionState::Stopping;
        if let Some(guard) = self.guard.take() {
            guard.disarm();
            if guard.fired() {
                // The controller is dead or dying at the guard's hand; there
                // is nothing graceful left to do.
                self.stop_forcibly().await;
                self.state = SessionState::TimedOut;
                return Err(SessionError::Shutdown(
                    "session timed out before stop".to_string(),
                ));
            }
        }

        let channel = self.channel.take();
        let process = self.process.take();

        let exit_result = match &channel {
            Some(channel) => channel.exit().await,
            None => Ok(()),
        };

        let Some(process) = process else {
            self.state = SessionState::Stopped;
            return Ok(());
        };
        let mut process = match Arc::try_unwrap(process) {
            Ok(mutex) => mutex.into_inner(),
            Err(shared) => {
                // The guard still holds a clone; fall back to locking.
                let mut locked = shared.lock().await;
                if let Err(e) = exit_result {
                    locked.kill().await;
                    self.state = SessionState::Failed;
                    return Err(SessionError::Shutdown(format!("exit request failed: {e}")));
                }
                return self.finish_stop(&mut locked).await;
            }
        };

        if let Err(e) = exit_result {
            process.kill().await;
            self.state = SessionState::Failed;
            return Err(SessionError::Shutdown(format!("exit request failed: {e}")));
        }
        self.finish_stop(&mut process).await
    }

    async fn finish_stop(&mut self, process: &mut ControllerProcess) -> Result<()> {
        match process.wait_for_exit(STOP_WAIT).await {
            Some(0) => {
                self.state = SessionState::Stopped;
                info!(session = %self.display_name(), "controller stopped cleanly");
                Ok(())
            }
            Some(code) => {
                self.state = SessionState::Failed;
                Err(SessionError::Shutdown(format!(
                    "controller exited with code {code}"
                )))
            }
            None => {
                warn!(session = %self.display_name(), "controller ignored exit request");
                process.kill().await;
                self.state = SessionState::Failed;
                Err(SessionError::Shutdown(format!(
                    "controller still running {}s after exit request",
                    STOP_WAIT.as_secs()
                )))
            }
        }
    }

    /// Kill the controller without the graceful RPC. Idempotent; never an
    /// error, even when nothing is running.
    pub async fn stop_forcibly(&mut self) {
        if let Some(guard) = self.guard.take() {
            guard.disarm();
        }
        self.channel = None;
        if let Some(process) = self.process.take() {
            process.lock().await.kill().await;
        }
        if !matches!(self.state, SessionState::Failed | SessionState::TimedOut) {
            self.state = SessionState::Stopped;
        }
    }

    /// Force-stop and remove the session home if this session created it.
    pub async fn teardown(&mut self) {
        self.stop_forcibly().await;
        if self.owns_home {
            if let Err(e) = std::fs::remove_dir_all(&self.home) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(home = %self.home.display(), "failed to remove session home: {e}");
                }
            }
        }
    }

    fn ready_channel(&self, operation: &'static str) -> Result<&StepChannel> {
        if self.state != SessionState::Ready {
            return Err(SessionError::IllegalState {
                operation,
                expected: "ready",
                actual: self.state.as_str(),
            });
        }
        self.channel.as_ref().ok_or(SessionError::IllegalState {
            operation,
            expected: "ready",
            actual: "no channel",
        })
    }

    fn display_name(&self) -> &str {
        self.config.name.as_deref().unwrap_or(&self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_session(home: Option<PathBuf>) -> ControllerSession {
        let mut config = SessionConfig::new("/nonexistent/controller");
        config.home = home;
        ControllerSession::new(config)
    }

    #[tokio::test]
    async fn run_before_start_is_illegal() {
        let session = test_session(None);
        let err = session.run(vec![StepEnvelope::bare("echo")]).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::IllegalState { operation: "run", .. }
        ));
    }

    #[tokio::test]
    async fn stop_before_start_is_illegal() {
        let mut session = test_session(None);
        let err = session.stop().await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::IllegalState { operation: "stop", .. }
        ));
    }

    #[test]
    fn provision_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let mut session = test_session(Some(dir.path().join("home")));

        session.provision().unwrap();
        assert_eq!(session.state(), SessionState::Provisioned);
        assert!(session.home().is_dir());

        session.provision().unwrap();
        assert_eq!(session.state(), SessionState::Provisioned);
    }

    #[tokio::test]
    async fn start_with_missing_program_fails_the_session() {
        let dir = TempDir::new().unwrap();
        let mut session = test_session(Some(dir.path().join("home")));

        let err = session.start().await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Launch(LaunchError::MissingProgram(_))
        ));
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn forced_stop_is_idempotent_without_a_process() {
        let mut session = test_session(None);
        session.stop_forcibly().await;
        session.stop_forcibly().await;
        assert_eq!(session.state(), SessionState::Stopped);
    }

    #[tokio::test]
    async fn teardown_removes_an_owned_home() {
        let mut session = test_session(None);
        session.provision().unwrap();
        let home = session.home().to_path_buf();
        assert!(home.is_dir());

        session.teardown().await;
        assert!(!home.exists());
    }

    #[test]
    fn custom_home_is_not_owned() {
        let dir = TempDir::new().unwrap();
        let session = test_session(Some(dir.path().to_path_buf()));
        assert!(!session.owns_home);
    }

    #[test]
    fn distinct_sessions_get_distinct_ids_and_homes() {
        let a = test_session(None);
        let b = test_session(None);
        assert_ne!(a.id(), b.id());
        assert_ne!(a.home(), b.home());
    }
}
