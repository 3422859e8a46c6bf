//! Cross-process failure reconstruction.
//!
//! When a step fails inside the controller, the concrete error type lives in
//! the controller's dependency graph and may not exist on the test-process
//! side at all. `RemoteFailure` carries the failure as plain data (type name
//! as text, message, frames, cause chain, suppressed failures) so it can be
//! decoded and rendered anywhere without reinstantiating the original type.

use serde::{Deserialize, Serialize};

/// Maximum number of backtrace frames carried per failure.
const MAX_FRAMES: usize = 40;

/// Type name recorded for cause-chain entries.
///
/// Rust erases concrete types behind `dyn Error`, so only the outermost
/// failure can carry its real type name; nested sources are identified by
/// their message alone.
const ERASED_TYPE_NAME: &str = "error";

/// A failure description that survives serialization between two processes
/// with different dependency graphs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFailure {
    /// Fully-qualified name of the originating error type, as text.
    pub type_name: String,
    /// The error's display message, if any.
    #[serde(default)]
    pub message: Option<String>,
    /// Backtrace frames captured at construction, verbatim.
    #[serde(default)]
    pub frames: Vec<String>,
    /// The failure's cause, recursively.
    #[serde(default)]
    pub cause: Option<Box<RemoteFailure>>,
    /// Failures suppressed while handling this one, in order.
    #[serde(default)]
    pub suppressed: Vec<RemoteFailure>,
}

impl RemoteFailure {
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            message: Some(message.into()),
            frames: Vec::new(),
            cause: None,
            suppressed: Vec::new(),
        }
    }

    /// Build a failure from a concrete error, walking its source chain into
    /// the cause chain. Must be called where the concrete type is still
    /// known; behind `dyn Error` the type name is already gone.
    pub fn from_error<E: std::error::Error>(err: &E) -> Self {
        Self {
            type_name: std::any::type_name::<E>().to_string(),
            message: Some(err.to_string()),
            frames: capture_frames(),
            cause: build_cause(err.source()),
            suppressed: Vec::new(),
        }
    }

    /// Build a failure from a caught panic payload.
    pub fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<String>()
            .cloned()
            .or_else(|| payload.downcast_ref::<&str>().map(|s| (*s).to_string()))
            .unwrap_or_else(|| "panic with non-string payload".to_string());
        Self {
            type_name: "panic".to_string(),
            message: Some(message),
            frames: capture_frames(),
            cause: None,
            suppressed: Vec::new(),
        }
    }

    pub fn with_cause(mut self, cause: RemoteFailure) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Record a failure that occurred while handling this one.
    pub fn push_suppressed(&mut self, suppressed: RemoteFailure) {
        self.suppressed.push(suppressed);
    }

    /// One-line `TypeName: message` form, for embedding in error messages.
    pub fn summary(&self) -> String {
        match &self.message {
            Some(msg) => format!("{}: {}", self.type_name, msg),
            None => self.type_name.clone(),
        }
    }

    fn render(&self, f: &mut std::fmt::Formatter<'_>, label: &str) -> std::fmt::Result {
        writeln!(f, "{}{}", label, self.summary())?;
        for frame in &self.frames {
            writeln!(f, "    at {frame}")?;
        }
        for suppressed in &self.suppressed {
            suppressed.render(f, "Suppressed: ")?;
        }
        if let Some(cause) = &self.cause {
            cause.render(f, "Caused by: ")?;
        }
        Ok(())
    }
}

impl std::fmt::Display for RemoteFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.render(f, "")
    }
}

fn build_cause(source: Option<&(dyn std::error::Error + 'static)>) -> Option<Box<RemoteFailure>> {
    source.map(|src| {
        Box::new(RemoteFailure {
            type_name: ERASED_TYPE_NAME.to_string(),
            message: Some(src.to_string()),
            frames: Vec::new(),
            cause: build_cause(src.source()),
            suppressed: Vec::new(),
        })
    })
}

fn capture_frames() -> Vec<String> {
    std::backtrace::Backtrace::force_capture()
        .to_string()
        .lines()
        .map(|line| line.trim().to_string())
        .filter(|line| !line.is_empty())
        .take(MAX_FRAMES)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use thiserror::Error;

    #[derive(Debug, Error)]
    #[error("disk on fire")]
    struct InnerError;

    #[derive(Debug, Error)]
    #[error("store unavailable")]
    struct OuterError(#[source] InnerError);

    #[test]
    fn from_error_captures_type_name_and_message() {
        let failure = RemoteFailure::from_error(&InnerError);
        assert!(failure.type_name.contains("InnerError"));
        assert_eq!(failure.message.as_deref(), Some("disk on fire"));
    }

    #[test]
    fn from_error_walks_source_chain() {
        let failure = RemoteFailure::from_error(&OuterError(InnerError));
        assert!(failure.type_name.contains("OuterError"));
        let cause = failure.cause.as_deref().expect("cause present");
        assert_eq!(cause.message.as_deref(), Some("disk on fire"));
        assert!(cause.cause.is_none());
    }

    #[test]
    fn from_panic_extracts_string_payloads() {
        let boxed: Box<dyn std::any::Any + Send> = Box::new("went sideways".to_string());
        let failure = RemoteFailure::from_panic(boxed.as_ref());
        assert_eq!(failure.type_name, "panic");
        assert_eq!(failure.message.as_deref(), Some("went sideways"));
    }

    #[test]
    fn display_includes_causes_and_suppressed() {
        let mut failure = RemoteFailure::new("app::StartupError", "listener wedged")
            .with_cause(RemoteFailure::new("error", "address in use"));
        failure.push_suppressed(RemoteFailure::new("error", "cleanup failed"));

        let rendered = failure.to_string();
        assert!(rendered.contains("app::StartupError: listener wedged"));
        assert!(rendered.contains("Caused by: error: address in use"));
        assert!(rendered.contains("Suppressed: error: cleanup failed"));
    }

    #[test]
    fn survives_serialization_without_the_original_type() {
        let failure = RemoteFailure::from_error(&OuterError(InnerError));
        let bytes = serde_json::to_vec(&failure).unwrap();
        let decoded: RemoteFailure = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded, failure);
        assert!(decoded.summary().contains("store unavailable"));
    }
}
