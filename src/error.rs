//! Error types for the tracing engine
//!
//! Engine-internal errors (`TraceError`) stay local: callers that record
//! steps or attachments log and swallow them so the observed test is never
//! aborted. Test-logic errors travel as `anyhow::Error` and are always
//! handed back to the host after being captured as data.

use std::io;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, TraceError>;

/// Errors raised by the recording and persistence machinery
#[derive(Error, Debug)]
pub enum TraceError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::DeError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Artifact '{path}' is not usable: {reason}")]
    Artifact { path: String, reason: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TraceError {
    /// Create an artifact error for a collaborator-produced file
    pub fn artifact(path: &std::path::Path, reason: &str) -> Self {
        Self::Artifact {
            path: path.display().to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Marker error for an expected, library-raised assertion failure.
///
/// Anywhere in an `anyhow` chain it turns a step or test status into
/// `failed`; every other error maps to `broken`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct AssertionFailed {
    pub message: String,
}

impl AssertionFailed {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Whether an error chain carries an `AssertionFailed`
pub fn is_assertion_failure(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.is::<AssertionFailed>())
}

/// Whether a panic message is the shape produced by `assert!` and friends
pub fn is_assertion_panic(message: &str) -> bool {
    message.starts_with("assertion")
}

/// Extract the message carried by a panic payload
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context as _;

    #[test]
    fn test_assertion_failure_detected_through_context() {
        let err: anyhow::Error = anyhow::Error::new(AssertionFailed::new("expected 1, got 2"))
            .context("while checking totals");
        assert!(is_assertion_failure(&err));
    }

    #[test]
    fn test_generic_error_is_not_assertion() {
        let err = anyhow::anyhow!("network unreachable");
        assert!(!is_assertion_failure(&err));

        let wrapped: anyhow::Result<()> = Err(io::Error::other("disk full")).context("saving");
        assert!(!is_assertion_failure(&wrapped.unwrap_err()));
    }

    #[test]
    fn test_assertion_panic_shapes() {
        assert!(is_assertion_panic("assertion failed: x > 1"));
        assert!(is_assertion_panic(
            "assertion `left == right` failed\n  left: 1\n right: 2"
        ));
        assert!(!is_assertion_panic("index out of bounds"));
    }

    #[test]
    fn test_panic_message_payloads() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("static str");
        assert_eq!(panic_message(payload.as_ref()), "static str");

        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");

        let payload: Box<dyn std::any::Any + Send> = Box::new(42u8);
        assert_eq!(
            panic_message(payload.as_ref()),
            "panic with non-string payload"
        );
    }

    #[test]
    fn test_artifact_error_display() {
        let err = TraceError::artifact(std::path::Path::new("/tmp/trace.zip"), "empty file");
        assert_eq!(
            err.to_string(),
            "Artifact '/tmp/trace.zip' is not usable: empty file"
        );
    }
}
