//! Teardown synchronization for collaborator artifacts
//!
//! Trace archives and network captures are written by collaborators while
//! their fixtures unwind, which happens after the host's end-of-test event.
//! The tracing fixture therefore only hands a test off once every inner
//! fixture has returned, and finishes any still-open artifact source here
//! under a bounded wait.
//!
//! ## Key Features
//!
//! - **finish_bounded**: run a possibly-hanging finalize on a detached
//!   thread, give up after a fixed ceiling, never cancel the worker
//! - **Mutex Poison Immunity**: run state stays reachable after a test
//!   panicked while holding a lock

use crate::attachment::{NETWORK_MIME, TRACE_MIME};
use crossbeam_channel::RecvTimeoutError;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// Wait ceiling for a collaborator's finalize call
pub const DEFAULT_FINALIZE_TIMEOUT: Duration = Duration::from_secs(5);

/// Kinds of artifacts collaborators produce once a traced scope ends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    /// Browser execution trace archive
    Trace,
    /// Network capture (HAR)
    Network,
    /// Screen recording
    Video,
}

impl ArtifactKind {
    pub fn mime(&self) -> &'static str {
        match self {
            ArtifactKind::Trace => TRACE_MIME,
            ArtifactKind::Network => NETWORK_MIME,
            ArtifactKind::Video => "video/webm",
        }
    }

    pub fn attachment_name(&self) -> &'static str {
        match self {
            ArtifactKind::Trace => "trace",
            ArtifactKind::Network => "network",
            ArtifactKind::Video => "video",
        }
    }
}

/// An artifact file announced by a collaborator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedArtifact {
    pub kind: ArtifactKind,
    pub path: PathBuf,
}

/// Run `f` on a detached worker and wait at most `timeout` for it.
///
/// Returns `None` on timeout (or if the worker panicked); the worker keeps
/// running and its late result is dropped.
pub fn finish_bounded<T, F>(label: &str, timeout: Duration, f: F) -> Option<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = crossbeam_channel::bounded(1);
    let spawned = thread::Builder::new()
        .name(format!("tach-finalize-{}", label))
        .spawn(move || {
            // Receiver may be gone after a timeout
            let _ = tx.send(f());
        });

    if let Err(e) = spawned {
        warn!(artifact = label, error = %e, "failed to spawn finalize worker");
        return None;
    }

    match rx.recv_timeout(timeout) {
        Ok(value) => {
            debug!(artifact = label, "finalize completed");
            Some(value)
        }
        Err(RecvTimeoutError::Timeout) => {
            warn!(
                artifact = label,
                timeout_ms = timeout.as_millis() as u64,
                "finalize timed out, continuing without artifact"
            );
            None
        }
        Err(RecvTimeoutError::Disconnected) => {
            warn!(artifact = label, "finalize worker panicked");
            None
        }
    }
}

/// Lock a mutex, ignoring poison.
///
/// A panicking test must not make the run's pending results unreachable.
pub fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// =============================================================================
// Unit Tests
// =============================================================================
