//! Single-flight step execution inside the controller process.
//!
//! One dedicated OS worker thread runs steps, never the thread (or tokio
//! task) handling the inbound HTTP request. This is a strict sequencing
//! point: a second concurrent request queues behind the first, and code
//! inside a step that inspects "the current request" is not confused by the
//! step-delivery request itself.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{mpsc, Arc, Mutex};

use rig_core::failure::RemoteFailure;
use rig_core::protocol::{ProtocolError, StepResponse};
use rig_core::step::{StepContext, StepEnvelope, StepFailure, StepFn, StepRegistry};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Type name used for failures manufactured by the runner itself.
const RUNNER_TYPE_NAME: &str = "rigd::runner::Abandoned";

/// A step whose kind has already been resolved against the registry.
pub struct ResolvedStep {
    pub kind: String,
    pub handler: StepFn,
    pub payload: Value,
}

impl std::fmt::Debug for ResolvedStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedStep")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Resolve every envelope before anything executes; an unknown kind fails the
/// whole request as a protocol error, with no partial execution.
pub fn resolve_steps(
    registry: &StepRegistry,
    envelopes: Vec<StepEnvelope>,
) -> Result<Vec<ResolvedStep>, ProtocolError> {
    envelopes
        .into_iter()
        .map(|envelope| {
            let handler = registry
                .resolve(&envelope.kind)
                .ok_or_else(|| ProtocolError::UnknownKind(envelope.kind.clone()))?;
            Ok(ResolvedStep {
                kind: envelope.kind,
                handler,
                payload: envelope.payload,
            })
        })
        .collect()
}

struct Job {
    steps: Vec<ResolvedStep>,
    context: StepContext,
    reply: oneshot::Sender<StepResponse>,
}

/// Owner of the dedicated worker thread.
#[derive(Debug)]
pub struct StepRunner {
    tx: Mutex<Option<mpsc::Sender<Job>>>,
    worker: Mutex<Option<std::thread::JoinHandle<()>>>,
    current: Arc<Mutex<Option<CancellationToken>>>,
}

impl StepRunner {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel::<Job>();
        let current: Arc<Mutex<Option<CancellationToken>>> = Arc::new(Mutex::new(None));

        let published = Arc::clone(&current);
        let worker = std::thread::Builder::new()
            .name("rig-step-worker".to_string())
            .spawn(move || {
                while let Ok(job) = rx.recv() {
                    let Job {
                        steps,
                        context,
                        reply,
                    } = job;

                    if let Ok(mut slot) = published.lock() {
                        *slot = Some(context.cancel.clone());
                    }
                    let response = run_job(&context, steps);
                    if let Ok(mut slot) = published.lock() {
                        *slot = None;
                    }

                    // Exactly one response per job; a dropped receiver means
                    // the HTTP side gave up, which is its problem.
                    let _ = reply.send(response);
                }
            });

        match worker {
            Ok(handle) => Self {
                tx: Mutex::new(Some(tx)),
                worker: Mutex::new(Some(handle)),
                current,
            },
            Err(e) => {
                // Without a worker every submit reports the runner as shut
                // down rather than hanging.
                warn!("failed to spawn step worker thread: {e}");
                Self {
                    tx: Mutex::new(None),
                    worker: Mutex::new(None),
                    current,
                }
            }
        }
    }

    /// Queue a job and wait for its response. Jobs execute strictly one at a
    /// time in submission order.
    pub async fn submit(&self, steps: Vec<ResolvedStep>, context: StepContext) -> StepResponse {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job = Job {
            steps,
            context,
            reply: reply_tx,
        };

        let sent = match self.tx.lock() {
            Ok(guard) => match guard.as_ref() {
                Some(tx) => tx.send(job).is_ok(),
                None => false,
            },
            Err(_) => false,
        };
        if !sent {
            return StepResponse::failed(RemoteFailure::new(
                RUNNER_TYPE_NAME,
                "step worker is shut down",
            ));
        }

        match reply_rx.await {
            Ok(response) => response,
            Err(_) => StepResponse::failed(RemoteFailure::new(
                RUNNER_TYPE_NAME,
                "step worker dropped the reply",
            )),
        }
    }

    /// Ask the in-flight step, if any, to abandon. Cooperative: the step must
    /// observe its context's cancellation token.
    pub fn abandon(&self) {
        if let Ok(guard) = self.current.lock() {
            if let Some(token) = guard.as_ref() {
                info!("abandoning in-flight step");
                token.cancel();
            } else {
                debug!("abandon requested with no step in flight");
            }
        }
    }

    /// Stop accepting jobs and join the worker. Idempotent.
    pub fn shutdown(&self) {
        if let Ok(mut guard) = self.tx.lock() {
            guard.take();
        }
        if let Ok(mut guard) = self.worker.lock() {
            if let Some(handle) = guard.take() {
                if handle.join().is_err() {
                    warn!("step worker panicked during shutdown");
                }
            }
        }
    }
}

impl Default for StepRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for StepRunner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Run one job's steps sequentially; the first failure, assumption, or
/// abandonment short-circuits, and the last step's result wins otherwise.
fn run_job(context: &StepContext, steps: Vec<ResolvedStep>) -> StepResponse {
    let mut last = Value::Null;
    for step in steps {
        if context.cancel.is_cancelled() {
            return StepResponse::failed(RemoteFailure::new(
                RUNNER_TYPE_NAME,
                format!("step `{}` abandoned before execution", step.kind),
            ));
        }

        debug!(kind = %step.kind, "executing step");
        let handler = Arc::clone(&step.handler);
        let payload = step.payload;
        let outcome = catch_unwind(AssertUnwindSafe(|| handler(context, payload)));

        match outcome {
            Err(panic_payload) => {
                warn!(kind = %step.kind, "step panicked");
                return StepResponse::failed(RemoteFailure::from_panic(panic_payload.as_ref()));
            }
            Ok(Err(StepFailure::Assumption(message))) => {
                info!(kind = %step.kind, message = %message, "step raised an assumption failure");
                return StepResponse::skipped(message);
            }
            Ok(Err(StepFailure::Error(failure))) => {
                info!(kind = %step.kind, failure = %failure.summary(), "step failed");
                return StepResponse::failed(failure);
            }
            Ok(Ok(value)) => last = value,
        }
    }
    StepResponse::ok(last)
}
