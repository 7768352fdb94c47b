//! Thread-local active scope
//!
//! The tracing fixture installs a fresh `Context` for the test running on
//! the current thread. The free functions here record into that Context
//! when one is active and fall through (running the body, writing to the
//! real console) when tracing is off, so test code can call them
//! unconditionally.

use crate::attachment::AttachmentStore;
use crate::capture::Stream;
use crate::context::{error_outcome, panic_outcome, Context, StepId};
use crate::model::{Attachment, AssertionEvent, AssertionKind, Status, StatusDetails};
use crate::teardown::{ArtifactKind, PublishedArtifact};
use std::cell::RefCell;
use std::io::{self, Write};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Collaborator that can capture the current page as PNG bytes
pub trait ScreenshotSource: Send + Sync {
    fn capture(&self) -> anyhow::Result<Vec<u8>>;
}

/// Collaborator whose artifact file is only complete once `finish` returns.
/// `finish` may block; it runs under a bounded wait.
pub trait ArtifactSource: Send + Sync {
    fn kind(&self) -> ArtifactKind;
    fn finish(&self) -> anyhow::Result<Option<PathBuf>>;
}

/// Everything bound to the test running on this thread
pub struct ActiveScope {
    pub context: Context,
    published: Vec<PublishedArtifact>,
    sources: Vec<Arc<dyn ArtifactSource>>,
    screenshots: Option<Arc<dyn ScreenshotSource>>,
}

impl ActiveScope {
    fn new(context: Context) -> Self {
        Self {
            context,
            published: Vec::new(),
            sources: Vec::new(),
            screenshots: None,
        }
    }

    pub fn published(&self) -> &[PublishedArtifact] {
        &self.published
    }

    /// Split into the Context, published artifacts and unfinished sources
    pub fn into_parts(
        self,
    ) -> (
        Context,
        Vec<PublishedArtifact>,
        Vec<Arc<dyn ArtifactSource>>,
    ) {
        (self.context, self.published, self.sources)
    }
}

thread_local! {
    static ACTIVE: RefCell<Option<ActiveScope>> = const { RefCell::new(None) };
}

/// Install `context` as this thread's active scope
pub fn install(context: Context) -> ScopeGuard {
    let previous = ACTIVE.with(|slot| slot.borrow_mut().replace(ActiveScope::new(context)));
    if previous.is_some() {
        debug!("nested scope installed; outer scope restored on finish");
    }
    ScopeGuard {
        previous: Some(previous),
    }
}

/// Restores the previous scope when finished or dropped
pub struct ScopeGuard {
    previous: Option<Option<ActiveScope>>,
}

impl ScopeGuard {
    /// Take the scope back out of the thread-local slot
    pub fn finish(mut self) -> Option<ActiveScope> {
        self.restore()
    }

    fn restore(&mut self) -> Option<ActiveScope> {
        let previous = self.previous.take()?;
        ACTIVE.with(|slot| std::mem::replace(&mut *slot.borrow_mut(), previous))
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        if self.previous.is_some() {
            let _ = self.restore();
        }
    }
}

/// Whether a traced test is running on this thread
pub fn is_active() -> bool {
    ACTIVE.with(|slot| slot.try_borrow().map(|s| s.is_some()).unwrap_or(false))
}

fn with_scope<R>(f: impl FnOnce(&mut ActiveScope) -> R) -> Option<R> {
    ACTIVE.with(|slot| match slot.try_borrow_mut() {
        Ok(mut guard) => guard.as_mut().map(f),
        Err(_) => {
            debug!("active scope already borrowed; recording skipped");
            None
        }
    })
}

/// Run `f` against the active Context, if any
pub fn with_context<R>(f: impl FnOnce(&mut Context) -> R) -> Option<R> {
    with_scope(|scope| f(&mut scope.context))
}

// =============================================================================
// Step recording
// =============================================================================

/// Run `body` as a lambda step of the active test.
///
/// Without an active scope the body simply runs.
pub fn step<T>(name: &str, body: impl FnOnce() -> anyhow::Result<T>) -> anyhow::Result<T> {
    let Some(id) = with_context(|ctx| ctx.open_step(name)) else {
        return body();
    };

    match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(Ok(value)) => {
            close(id, Status::Passed, None);
            Ok(value)
        }
        Ok(Err(err)) => {
            let (status, details) = error_outcome(&err);
            close(id, status, Some(details));
            Err(err)
        }
        Err(payload) => {
            let (status, details) = panic_outcome(payload.as_ref());
            close(id, status, Some(details));
            panic::resume_unwind(payload)
        }
    }
}

fn close(id: StepId, status: Status, details: Option<StatusDetails>) {
    with_context(|ctx| ctx.close_step(id, status, details));
}

pub fn marker(name: &str) {
    with_context(|ctx| ctx.marker(name));
}

pub fn parameter(name: &str, value: impl ToString) {
    with_context(|ctx| ctx.add_parameter(name, value));
}

pub fn label(name: &str, value: &str) {
    with_context(|ctx| ctx.label(name, value));
}

pub fn description(text: &str) {
    with_context(|ctx| ctx.description(text));
}

pub fn attach_bytes(name: &str, mime: &str, bytes: &[u8]) -> Option<Attachment> {
    with_context(|ctx| ctx.attach_bytes(name, mime, bytes)).flatten()
}

pub fn attach_text(name: &str, text: &str) -> Option<Attachment> {
    with_context(|ctx| ctx.attach_text(name, text)).flatten()
}

pub fn attach_json(name: &str, body: &str) -> Option<Attachment> {
    with_context(|ctx| ctx.attach_json(name, body)).flatten()
}

pub fn attach_file(name: &str, mime: &str, path: &Path) -> Option<Attachment> {
    with_context(|ctx| ctx.attach_file(name, mime, path)).flatten()
}

/// Record a host assertion as a step at the current location.
/// Errors are left to the test-level status details.
pub fn record_assertion(event: &AssertionEvent) {
    let details = match event.kind {
        AssertionKind::Pass => None,
        AssertionKind::Fail => Some(StatusDetails::message(event.failure_message())),
        AssertionKind::Error => return,
    };
    with_context(|ctx| ctx.record_step(&event.describe(), event.kind.status(), details));
}

// =============================================================================
// Collaborators
// =============================================================================

pub fn bind_screenshots(source: Arc<dyn ScreenshotSource>) {
    with_scope(|scope| scope.screenshots = Some(source));
}

/// Register a source whose `finish` runs when the test is handed off
pub fn bind_artifact_source(source: Arc<dyn ArtifactSource>) {
    with_scope(|scope| scope.sources.push(source));
}

/// Announce a fully written artifact file for the active test
pub fn publish_artifact(kind: ArtifactKind, path: impl Into<PathBuf>) {
    let path = path.into();
    if with_scope(|scope| scope.published.push(PublishedArtifact { kind, path })).is_none() {
        debug!(?kind, "artifact published with no active scope");
    }
}

/// Capture a screenshot from the bound source and attach it as PNG
pub fn screenshot(name: &str) -> Option<Attachment> {
    let source = with_scope(|scope| scope.screenshots.clone()).flatten()?;
    // Capture outside the borrow; the page may call back into recording
    match source.capture() {
        Ok(bytes) => attach_bytes(name, "image/png", &bytes),
        Err(e) => {
            warn!(error = %e, "screenshot capture failed");
            None
        }
    }
}

// =============================================================================
// Output
// =============================================================================

/// Writer that records into the active test, or writes to the console
pub struct ScopedWriter {
    stream: Stream,
}

pub fn stdout() -> ScopedWriter {
    ScopedWriter {
        stream: Stream::Stdout,
    }
}

pub fn stderr() -> ScopedWriter {
    ScopedWriter {
        stream: Stream::Stderr,
    }
}

impl Write for ScopedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let stream = self.stream;
        if with_context(|ctx| ctx.capture_mut().write(stream, buf)).is_none() {
            return match stream {
                Stream::Stdout => io::stdout().write(buf),
                Stream::Stderr => io::stderr().write(buf),
            };
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let stream = self.stream;
        match with_context(|ctx| ctx.capture_mut().flush(stream)) {
            Some(res) => res,
            None => match stream {
                Stream::Stdout => io::stdout().flush(),
                Stream::Stderr => io::stderr().flush(),
            },
        }
    }
}

/// A Context suitable for installing with `install`
pub fn new_context(results_dir: &Path, echo_output: bool) -> Context {
    Context::new(AttachmentStore::new(results_dir), echo_output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct FixedScreenshot;

    impl ScreenshotSource for FixedScreenshot {
        fn capture(&self) -> anyhow::Result<Vec<u8>> {
            Ok(b"\x89PNG".to_vec())
        }
    }

    #[test]
    fn test_step_without_scope_runs_body() {
        assert!(!is_active());
        let value = step("no scope", || Ok(5)).unwrap();
        assert_eq!(value, 5);
    }

    #[test]
    fn test_install_and_finish() {
        let temp = TempDir::new().unwrap();
        let guard = install(new_context(temp.path(), false));
        assert!(is_active());

        marker("Login");
        step("Submit", || {
            writeln!(stdout(), "validating input")?;
            parameter("user", "alice");
            Ok(())
        })
        .unwrap();

        let scope = guard.finish().unwrap();
        assert!(!is_active());
        let steps = scope.context.steps();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[1].steps[0].name, "▸ validating input");
        assert_eq!(steps[1].parameters[0].value, "alice");
    }

    #[test]
    fn test_guard_drop_restores_slot() {
        let temp = TempDir::new().unwrap();
        {
            let _guard = install(new_context(temp.path(), false));
            assert!(is_active());
        }
        assert!(!is_active());
    }

    #[test]
    fn test_nested_install_restores_outer() {
        let temp = TempDir::new().unwrap();
        let outer = install(new_context(temp.path(), false));
        marker("outer");
        let inner = install(new_context(temp.path(), false));
        marker("inner");

        let inner_scope = inner.finish().unwrap();
        assert_eq!(inner_scope.context.steps()[0].name, "inner");
        let outer_scope = outer.finish().unwrap();
        assert_eq!(outer_scope.context.steps()[0].name, "outer");
    }

    #[test]
    fn test_publish_and_screenshot() {
        let temp = TempDir::new().unwrap();
        let guard = install(new_context(temp.path(), false));
        bind_screenshots(Arc::new(FixedScreenshot));
        publish_artifact(ArtifactKind::Trace, temp.path().join("trace.zip"));

        let att = screenshot("page").unwrap();
        assert!(att.source.ends_with(".png"));

        let scope = guard.finish().unwrap();
        assert_eq!(scope.published().len(), 1);
        assert_eq!(scope.context.attachments().len(), 1);
    }

    #[test]
    fn test_record_assertion_skips_errors() {
        let temp = TempDir::new().unwrap();
        let guard = install(new_context(temp.path(), false));
        record_assertion(
            &AssertionEvent::new(AssertionKind::Pass, vec![]).with_message("cart has items"),
        );
        record_assertion(&AssertionEvent::new(AssertionKind::Fail, vec![]).with_values("1", "2"));
        record_assertion(&AssertionEvent::new(AssertionKind::Error, vec![]).with_message("boom"));

        let steps = guard.finish().unwrap().context.steps();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].status, Status::Passed);
        assert!(steps[0].status_details.is_none());
        assert_eq!(steps[1].status, Status::Failed);
        assert_eq!(
            steps[1].status_details.as_ref().unwrap().message.as_deref(),
            Some("expected: 1, actual: 2")
        );
    }
}
