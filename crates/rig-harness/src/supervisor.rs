//! Launching and supervising the controller subprocess.
//!
//! The supervisor owns argv/env assembly and the child handle. Argument
//! assembly is deterministic and testable on its own; the secret never
//! appears in argv, only in the child environment.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rig_core::protocol::{ENV_SESSION_ID, ENV_TOKEN};
use rig_core::token::Token;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{info, warn};

/// How many recent child output lines are retained for diagnostics.
const OUTPUT_RING: usize = 200;

/// Combined byte length of extra args above which they spill into an args
/// file instead of argv (command-line length limits).
const ARGS_INLINE_LIMIT: usize = 4096;

/// Name of the spilled args file inside the controller home.
pub const ARGS_FILE: &str = ".rig-args";

/// Delay after spawn before checking whether the child died on arrival.
const SPAWN_SETTLE: Duration = Duration::from_millis(100);

pub type Result<T> = std::result::Result<T, LaunchError>;

/// Receives each line of child output: `(session_name, line)`.
pub type OutputSink = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Paths to externally provided HTTPS material. The harness only consumes
/// `trust_path` (client trust root); cert and key are forwarded to the
/// controller program, which is responsible for terminating TLS.
#[derive(Debug, Clone)]
pub struct TlsMaterial {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub trust_path: PathBuf,
}

/// Everything needed to launch one controller process.
pub struct LaunchPlan {
    pub program: PathBuf,
    pub home: PathBuf,
    pub host: String,
    /// 0 on first launch; the previously observed port on relaunch.
    pub port: u16,
    pub prefix: String,
    pub token: Token,
    pub session_id: String,
    /// Session name used in log lines and diagnostics.
    pub session_name: Option<String>,
    pub extra_args: Vec<String>,
    pub extra_env: Vec<(String, String)>,
    pub tls: Option<TlsMaterial>,
    /// Override for where child output lines go; defaults to tracing.
    pub output_sink: Option<OutputSink>,
}

impl std::fmt::Debug for LaunchPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaunchPlan")
            .field("program", &self.program)
            .field("home", &self.home)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("prefix", &self.prefix)
            .field("session_id", &self.session_id)
            .field("session_name", &self.session_name)
            .field("extra_args", &self.extra_args)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("controller program not found: {0}")]
    MissingProgram(PathBuf),
    #[error("failed to prepare launch arguments: {0}")]
    Args(std::io::Error),
    #[error("failed to spawn controller: {0}")]
    Spawn(std::io::Error),
    #[error("controller died during launch (exit code {code:?}); recent output:\n{tail}")]
    DiedImmediately { code: Option<i32>, tail: String },
    #[error("controller came back on port {actual} instead of pinned port {pinned}")]
    PortMismatch { pinned: u16, actual: u16 },
}

/// Deterministic base argv for the plan, excluding any args-file spill.
pub fn assemble_args(plan: &LaunchPlan) -> Vec<String> {
    let mut args = vec![
        "--home".to_string(),
        plan.home.display().to_string(),
        "--host".to_string(),
        plan.host.clone(),
        "--port".to_string(),
        plan.port.to_string(),
        "--prefix".to_string(),
        plan.prefix.clone(),
    ];
    if let Some(tls) = &plan.tls {
        args.push("--tls-cert".to_string());
        args.push(tls.cert_path.display().to_string());
        args.push("--tls-key".to_string());
        args.push(tls.key_path.display().to_string());
    }
    args
}

/// Full argv: base args plus extra args, with long extra-args lists spilled
/// to `<home>/.rig-args` and replaced by `--args-file <path>`.
fn materialize_args(plan: &LaunchPlan) -> std::io::Result<Vec<String>> {
    let mut args = assemble_args(plan);

    let extra_len: usize = plan.extra_args.iter().map(|a| a.len() + 1).sum();
    if extra_len > ARGS_INLINE_LIMIT {
        let path = plan.home.join(ARGS_FILE);
        std::fs::write(&path, plan.extra_args.join("\n"))?;
        args.push("--args-file".to_string());
        args.push(path.display().to_string());
    } else {
        args.extend(plan.extra_args.iter().cloned());
    }
    Ok(args)
}

/// A supervised controller child process.
pub struct ControllerProcess {
    child: Child,
    name: String,
    output: Arc<Mutex<VecDeque<String>>>,
}

impl std::fmt::Debug for ControllerProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerProcess")
            .field("name", &self.name)
            .field("pid", &self.child.id())
            .finish_non_exhaustive()
    }
}

impl ControllerProcess {
    pub(crate) fn from_child(child: Child, name: String, sink: Option<OutputSink>) -> Self {
        let mut process = Self {
            child,
            name,
            output: Arc::new(Mutex::new(VecDeque::with_capacity(OUTPUT_RING))),
        };
        process.pump_output(sink);
        process
    }

    /// Spawn line pumps for the child's stdout and stderr.
    fn pump_output(&mut self, sink: Option<OutputSink>) {
        let sink = sink.unwrap_or_else(|| {
            Arc::new(|name: &str, line: &str| {
                info!(session = name, "{line}");
            })
        });

        if let Some(stdout) = self.child.stdout.take() {
            spawn_pump(stdout, self.name.clone(), Arc::clone(&self.output), Arc::clone(&sink));
        }
        if let Some(stderr) = self.child.stderr.take() {
            spawn_pump(stderr, self.name.clone(), Arc::clone(&self.output), sink);
        }
    }

    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Exit code if the process has already exited.
    pub fn exit_code(&mut self) -> Option<i32> {
        self.child.try_wait().ok().flatten().and_then(|s| s.code())
    }

    /// Forcibly terminate. Killing an already-dead process is a no-op.
    pub async fn kill(&mut self) {
        if self.is_alive() {
            warn!(session = %self.name, "killing controller process");
            if let Err(e) = self.child.kill().await {
                warn!(session = %self.name, "kill failed: {e}");
            }
        }
    }

    /// Wait up to `timeout` for the process to exit; `None` if it is still
    /// running afterward.
    pub async fn wait_for_exit(&mut self, timeout: Duration) -> Option<i32> {
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(Ok(status)) => status.code(),
            _ => None,
        }
    }

    /// The most recent child output lines, oldest first.
    pub fn recent_output(&self) -> Vec<String> {
        self.output
            .lock()
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Diagnostic tail of recent output for error messages.
    pub fn output_tail(&self) -> String {
        self.recent_output().join("\n")
    }
}

fn spawn_pump(
    stream: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    name: String,
    ring: Arc<Mutex<VecDeque<String>>>,
    sink: OutputSink,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Ok(mut ring) = ring.lock() {
                if ring.len() == OUTPUT_RING {
                    ring.pop_front();
                }
                ring.push_back(line.clone());
            }
            sink(&name, &line);
        }
    });
}

/// Launch a controller process per the plan.
///
/// Fails fast when the program is missing or the child dies within the
/// settle window, attaching recent output as diagnostic context.
pub async fn launch(plan: &LaunchPlan) -> Result<ControllerProcess> {
    if !plan.program.exists() {
        return Err(LaunchError::MissingProgram(plan.program.clone()));
    }

    let args = materialize_args(plan).map_err(LaunchError::Args)?;
    let name = plan
        .session_name
        .clone()
        .unwrap_or_else(|| plan.session_id.clone());

    info!(
        session = %name,
        program = %plan.program.display(),
        port = plan.port,
        "launching controller"
    );

    let mut command = Command::new(&plan.program);
    command
        .args(&args)
        .env(ENV_TOKEN, plan.token.as_str())
        .env(ENV_SESSION_ID, &plan.session_id)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in &plan.extra_env {
        command.env(key, value);
    }

    let child = command.spawn().map_err(LaunchError::Spawn)?;
    let mut process = ControllerProcess::from_child(child, name, plan.output_sink.clone());

    // Catch the common misconfigurations (bad flags, missing token handling)
    // before the prober spends its whole budget polling a corpse.
    tokio::time::sleep(SPAWN_SETTLE).await;
    if !process.is_alive() {
        let code = process.exit_code();
        return Err(LaunchError::DiedImmediately {
            code,
            tail: process.output_tail(),
        });
    }

    Ok(process)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_plan(home: PathBuf) -> LaunchPlan {
        LaunchPlan {
            program: PathBuf::from("/nonexistent/controller"),
            home,
            host: "127.0.0.1".to_string(),
            port: 0,
            prefix: String::new(),
            token: Token::from_string("secret"),
            session_id: "s-1".to_string(),
            session_name: None,
            extra_args: Vec::new(),
            extra_env: Vec::new(),
            tls: None,
            output_sink: None,
        }
    }

    #[test]
    fn args_are_deterministic_and_ordered() {
        let plan = test_plan(PathBuf::from("/tmp/home"));
        let args = assemble_args(&plan);
        assert_eq!(
            args,
            vec![
                "--home",
                "/tmp/home",
                "--host",
                "127.0.0.1",
                "--port",
                "0",
                "--prefix",
                "",
            ]
        );
    }

    #[test]
    fn token_never_appears_in_args() {
        let mut plan = test_plan(PathBuf::from("/tmp/home"));
        plan.extra_args = vec!["--verbose".to_string()];
        let args = materialize_args(&plan).unwrap();
        assert!(args.iter().all(|a| !a.contains("secret")));
    }

    #[test]
    fn short_extra_args_stay_inline() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut plan = test_plan(dir.path().to_path_buf());
        plan.extra_args = vec!["--flag".to_string(), "value".to_string()];

        let args = materialize_args(&plan).unwrap();
        assert!(args.contains(&"--flag".to_string()));
        assert!(!dir.path().join(ARGS_FILE).exists());
    }

    #[test]
    fn long_extra_args_spill_to_a_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut plan = test_plan(dir.path().to_path_buf());
        plan.extra_args = (0..200).map(|i| format!("--option-{i}=some-long-value")).collect();

        let args = materialize_args(&plan).unwrap();
        let position = args.iter().position(|a| a == "--args-file").unwrap();
        let path = PathBuf::from(&args[position + 1]);
        assert_eq!(path, dir.path().join(ARGS_FILE));

        let contents = std::fs::read_to_string(path).unwrap();
        assert_eq!(contents.lines().count(), 200);
        assert!(args.iter().all(|a| !a.starts_with("--option-")));
    }

    #[test]
    fn tls_material_adds_cert_and_key_flags() {
        let mut plan = test_plan(PathBuf::from("/tmp/home"));
        plan.tls = Some(TlsMaterial {
            cert_path: PathBuf::from("/certs/tls.crt"),
            key_path: PathBuf::from("/certs/tls.key"),
            trust_path: PathBuf::from("/certs/ca.pem"),
        });

        let args = assemble_args(&plan);
        assert!(args.contains(&"--tls-cert".to_string()));
        assert!(args.contains(&"--tls-key".to_string()));
        // The trust root is client-side only.
        assert!(args.iter().all(|a| !a.contains("ca.pem")));
    }

    #[tokio::test]
    async fn missing_program_fails_before_spawn() {
        let err = launch(&test_plan(PathBuf::from("/tmp"))).await.unwrap_err();
        assert!(matches!(err, LaunchError::MissingProgram(_)));
    }
}
