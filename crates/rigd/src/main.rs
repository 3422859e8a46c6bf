//! rigd - reference controller binary.
//!
//! Launched by the harness as a child process. The shared secret arrives via
//! the environment (never argv, which is world-readable on most platforms);
//! everything else is plain CLI flags.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::path::PathBuf;

use clap::Parser;
use rig_core::protocol::{ENV_SESSION_ID, ENV_TOKEN};
use rig_core::step::StepRegistry;
use rig_core::token::Token;
use rigd::steps::DemoState;
use rigd::{Controller, ControllerConfig};
use tracing::{error, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "rigd", about = "Reference controller process", version)]
struct Cli {
    /// Controller home directory
    #[arg(long)]
    home: PathBuf,

    /// Interface to bind
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to bind (0 for an ephemeral port)
    #[arg(long, default_value = "0")]
    port: u16,

    /// URL path prefix to mount the endpoint under
    #[arg(long, default_value = "")]
    prefix: String,
}

/// Expand `--args-file <path>` (one argument per line) in place, so the
/// supervisor can spill long argument lists past command-line length limits.
fn expand_args() -> Result<Vec<std::ffi::OsString>, std::io::Error> {
    let mut expanded = Vec::new();
    let mut args = std::env::args_os();
    while let Some(arg) = args.next() {
        if arg == "--args-file" {
            let Some(path) = args.next() else {
                return Err(std::io::Error::other("--args-file requires a path"));
            };
            let contents = std::fs::read_to_string(&path)?;
            expanded.extend(
                contents
                    .lines()
                    .filter(|line| !line.is_empty())
                    .map(std::ffi::OsString::from),
            );
        } else {
            expanded.push(arg);
        }
    }
    Ok(expanded)
}

fn main() {
    let args = match expand_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("rigd: failed to read args file: {e}");
            std::process::exit(1);
        }
    };
    let cli = Cli::parse_from(args);

    // Initialize tracing. Output goes to stderr so the supervising process
    // can capture it alongside its own logs.
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let Ok(token) = std::env::var(ENV_TOKEN) else {
        error!("{ENV_TOKEN} is not set; refusing to start without a token");
        std::process::exit(1);
    };
    let session_id = std::env::var(ENV_SESSION_ID).ok();

    let config = ControllerConfig {
        home: cli.home,
        host: cli.host,
        port: cli.port,
        prefix: cli.prefix,
        token: Token::from_string(token),
        session_id,
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("failed to create tokio runtime: {e}");
            std::process::exit(1);
        }
    };

    let exit_code = runtime.block_on(async {
        let demo = DemoState::load(&config.home);
        let mut registry = StepRegistry::new();
        rigd::steps::register_builtin(&mut registry, &demo);

        let controller = Controller::new(config, registry);
        match controller.serve().await {
            Ok(()) => {
                // Graceful exit only: a forced kill must not persist.
                if let Err(e) = demo.persist() {
                    warn!("failed to persist demo store: {e}");
                }
                0
            }
            Err(e) => {
                error!("controller error: {e}");
                1
            }
        }
    });

    std::process::exit(exit_code);
}
