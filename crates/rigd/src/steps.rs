//! Built-in step handlers for the reference controller.
//!
//! These exercise every execution path a real embedding application's steps
//! would hit: shared controller-side state, typed failures, assumption
//! failures, cooperative and uncooperative hangs, panics, and context access.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rig_core::failure::RemoteFailure;
use rig_core::step::{StepFailure, StepRegistry};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

/// File inside the controller home where the demo store is persisted on
/// graceful exit.
const STORE_FILE: &str = "store.json";

/// Interval at which cancellable waits poll for abandonment.
const CANCEL_POLL: Duration = Duration::from_millis(10);

/// Failure type raised by the `fail` step; its type name crossing the wire
/// intact is what the exception round-trip tests assert on.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct DemoFailure(pub String);

#[derive(Debug, Serialize, Deserialize, Default)]
struct PersistedStore {
    #[serde(default)]
    saved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    values: HashMap<String, Value>,
}

/// Controller-side state shared by the `put`/`get`/`append` steps.
///
/// Lives for the lifetime of the controller process; persisted to the home
/// directory only on graceful exit, so a forced kill loses it. Restart tests
/// rely on that distinction.
#[derive(Debug)]
pub struct DemoState {
    path: PathBuf,
    values: Mutex<HashMap<String, Value>>,
}

impl DemoState {
    /// Load previously persisted values from the home directory, if any.
    pub fn load(home: &Path) -> Arc<Self> {
        let path = home.join(STORE_FILE);
        let values = std::fs::read(&path)
            .ok()
            .and_then(|bytes| serde_json::from_slice::<PersistedStore>(&bytes).ok())
            .map(|store| store.values)
            .unwrap_or_default();
        if !values.is_empty() {
            info!(count = values.len(), "restored persisted store");
        }
        Arc::new(Self {
            path,
            values: Mutex::new(values),
        })
    }

    /// Write the store to the home directory. Called on graceful exit only.
    pub fn persist(&self) -> std::io::Result<()> {
        let values = self
            .values
            .lock()
            .map_err(|_| std::io::Error::other("store mutex poisoned"))?
            .clone();
        let store = PersistedStore {
            saved_at: Some(Utc::now()),
            values,
        };
        let bytes = serde_json::to_vec_pretty(&store)?;
        std::fs::write(&self.path, bytes)?;
        debug!(path = %self.path.display(), "persisted store");
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct PutInput {
    key: String,
    value: Value,
}

#[derive(Debug, Deserialize)]
struct KeyInput {
    key: String,
}

#[derive(Debug, Deserialize)]
struct MillisInput {
    millis: u64,
}

/// Register the built-in handlers.
pub fn register_builtin(registry: &mut StepRegistry, state: &Arc<DemoState>) {
    registry.register("echo", |_ctx, payload| Ok(payload));

    let store = Arc::clone(state);
    registry.register_typed("put", move |_ctx, input: PutInput| {
        store
            .values
            .lock()
            .map_err(|_| poisoned())?
            .insert(input.key, input.value);
        Ok(())
    });

    let store = Arc::clone(state);
    registry.register_typed("get", move |_ctx, input: KeyInput| {
        let values = store.values.lock().map_err(|_| poisoned())?;
        Ok(values.get(&input.key).cloned().unwrap_or(Value::Null))
    });

    // Appends a marker to a shared list and returns the whole list; two
    // requests racing each other make execution order observable.
    let store = Arc::clone(state);
    registry.register_typed("append", move |_ctx, input: Value| {
        let mut values = store.values.lock().map_err(|_| poisoned())?;
        let list = values
            .entry("append-log".to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(items) = list {
            items.push(input);
        }
        Ok(list.clone())
    });

    registry.register_typed("fail", |_ctx, message: String| -> Result<(), _> {
        Err(StepFailure::from_err(&DemoFailure(message)))
    });

    registry.register_typed("skip", |_ctx, message: String| -> Result<(), _> {
        Err(StepFailure::assumption(message))
    });

    // Cancellable wait: unwinds promptly when the step is abandoned.
    registry.register_typed("sleep", |ctx, input: MillisInput| -> Result<(), _> {
        let deadline = std::time::Instant::now() + Duration::from_millis(input.millis);
        while std::time::Instant::now() < deadline {
            if ctx.cancel.is_cancelled() {
                return Err(StepFailure::Error(RemoteFailure::new(
                    "rigd::steps::Abandoned",
                    "sleep step abandoned before completion",
                )));
            }
            std::thread::sleep(CANCEL_POLL);
        }
        Ok(())
    });

    // Uncooperative wait: never checks for cancellation, so only the
    // forcible-kill escalation can end it early.
    registry.register_typed("hang", |_ctx, input: MillisInput| -> Result<(), _> {
        std::thread::sleep(Duration::from_millis(input.millis));
        Ok(())
    });

    registry.register_typed(
        "panic",
        |_ctx, message: String| -> Result<(), StepFailure> {
            panic!("{message}");
        },
    );

    registry.register("whoami", |ctx, _payload| {
        Ok(serde_json::json!({
            "callback_url": ctx.callback_url,
            "context_path": ctx.context_path,
            "home": ctx.home.display().to_string(),
        }))
    });
}

fn poisoned() -> StepFailure {
    StepFailure::Error(RemoteFailure::new(
        "rigd::steps::StorePoisoned",
        "demo store mutex poisoned",
    ))
}
