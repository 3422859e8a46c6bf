//! Steps: the unit of remotely-executed test logic.
//!
//! A step is an explicit tagged command value, not a serialized closure: the
//! wire carries a `StepEnvelope { kind, payload }` and the controller resolves
//! `kind` against a `StepRegistry` populated at controller startup. The
//! registry is the seam through which an embedding application makes its own
//! step handlers (compiled into the controller process) reachable from test
//! code that only knows the kind name.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::failure::RemoteFailure;

/// What an executing step can see of its surroundings.
#[derive(Debug, Clone)]
pub struct StepContext {
    /// The controller's own externally reachable base URL.
    pub callback_url: String,
    /// URL path prefix the controller is mounted under.
    pub context_path: String,
    /// The controller's home directory.
    pub home: PathBuf,
    /// Cooperative cancellation signal; long-running steps should poll
    /// `cancel.is_cancelled()` at safe points.
    pub cancel: CancellationToken,
}

/// One serialized step on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepEnvelope {
    /// Registry key naming the handler on the controller side.
    pub kind: String,
    /// Handler-specific arguments, opaque to the transport.
    pub payload: Value,
}

impl StepEnvelope {
    pub fn new(kind: impl Into<String>, payload: impl Serialize) -> serde_json::Result<Self> {
        Ok(Self {
            kind: kind.into(),
            payload: serde_json::to_value(payload)?,
        })
    }

    /// A step that takes no arguments.
    pub fn bare(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            payload: Value::Null,
        }
    }
}

/// How a step handler fails.
#[derive(Debug)]
pub enum StepFailure {
    /// The step decided the surrounding test should be skipped, not failed.
    Assumption(String),
    /// A genuine failure, already flattened to its wire form.
    Error(RemoteFailure),
}

impl StepFailure {
    pub fn assumption(message: impl Into<String>) -> Self {
        Self::Assumption(message.into())
    }

    /// Capture a concrete error while its type name is still known.
    pub fn from_err<E: std::error::Error>(err: &E) -> Self {
        Self::Error(RemoteFailure::from_error(err))
    }
}

/// A registered step handler. Runs on the controller's dedicated worker
/// thread, synchronously.
pub type StepFn = Arc<dyn Fn(&StepContext, Value) -> Result<Value, StepFailure> + Send + Sync>;

/// Name → handler resolver, owned by the controller endpoint.
///
/// Resolution failures are protocol errors: a kind the registry has never
/// heard of cannot be retried into existence.
#[derive(Default)]
pub struct StepRegistry {
    handlers: HashMap<String, StepFn>,
}

impl std::fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a raw handler under `kind`. Later registrations replace
    /// earlier ones.
    pub fn register(
        &mut self,
        kind: impl Into<String>,
        handler: impl Fn(&StepContext, Value) -> Result<Value, StepFailure> + Send + Sync + 'static,
    ) {
        self.handlers.insert(kind.into(), Arc::new(handler));
    }

    /// Register a handler with typed input and output; payload decode errors
    /// surface as failures carrying the serde error.
    pub fn register_typed<I, O, F>(&mut self, kind: impl Into<String>, handler: F)
    where
        I: DeserializeOwned,
        O: Serialize,
        F: Fn(&StepContext, I) -> Result<O, StepFailure> + Send + Sync + 'static,
    {
        self.register(kind, move |ctx, payload| {
            let input: I =
                serde_json::from_value(payload).map_err(|e| StepFailure::from_err(&e))?;
            let output = handler(ctx, input)?;
            serde_json::to_value(output).map_err(|e| StepFailure::from_err(&e))
        });
    }

    pub fn resolve(&self, kind: &str) -> Option<StepFn> {
        self.handlers.get(kind).map(Arc::clone)
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }
}
