//! Reporting session: the run-wide state between activation and finalize
//!
//! ## Architecture
//!
//! - Per-test `TestCaseState` keyed by fully-qualified name (`DashMap`, so
//!   hosts may run tests on several threads against one `Arc<ReportSession>`)
//! - Finished tests are assembled into `TestResult`s and buffered; nothing
//!   is written until `finalize`, because the parentSuite correction needs
//!   every result of the run
//! - `finalize` runs once and disables the session

use crate::attachment::AttachmentStore;
use crate::capture::Stream;
use crate::config::TraceConfig;
use crate::context::Context;
use crate::environment::EnvironmentFacts;
use crate::error::{Result, TraceError};
use crate::model::{now_ms, AssertionEvent, AssertionKind, Status, StatusDetails, TestInfo};
use crate::results::{self, HostFacts, ResultWriter, TestResult};
use crate::scope::ActiveScope;
use crate::teardown::{finish_bounded, lock_unpoisoned, PublishedArtifact};
use dashmap::DashMap;
use std::fs;
use std::path::Path;
use std::process::Command;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;
use tracing::{debug, info, warn};

// =============================================================================
// Per-test state
// =============================================================================

/// Bookkeeping for one test case between its begin and handoff
#[derive(Debug, Clone)]
pub struct TestCaseState {
    pub uuid: String,
    pub info: TestInfo,
    pub start: i64,
    pub stop: Option<i64>,
    pub thread: String,
    /// Assertion reports in arrival order
    pub assertions: Vec<AssertionEvent>,
    pub worst: Option<AssertionKind>,
    /// Details of the first fail or error only
    pub first_failure: Option<StatusDetails>,
    pub ended: bool,
    /// Set when the tracing fixture wraps this test
    pub traced: bool,
}

impl TestCaseState {
    pub fn new(info: TestInfo) -> Self {
        Self {
            uuid: uuid::Uuid::new_v4().to_string(),
            info,
            start: now_ms(),
            stop: None,
            thread: thread_label(),
            assertions: Vec::new(),
            worst: None,
            first_failure: None,
            ended: false,
            traced: false,
        }
    }

    /// Reset for a test that is (re)starting; keeps `traced`
    pub fn restart(&mut self) {
        self.start = now_ms();
        self.stop = None;
        self.thread = thread_label();
        self.assertions.clear();
        self.worst = None;
        self.first_failure = None;
        self.ended = false;
    }

    pub fn record(&mut self, event: AssertionEvent) {
        if event.kind != AssertionKind::Pass && self.first_failure.is_none() {
            self.first_failure = Some(StatusDetails {
                message: Some(event.failure_message()),
                trace: event.trace.clone(),
            });
        }
        self.worst = self.worst.max(Some(event.kind));
        self.assertions.push(event);
    }

    pub fn finish(&mut self) {
        self.ended = true;
        self.stop = Some(now_ms());
    }

    pub fn status(&self) -> Status {
        self.worst.map_or(Status::Passed, |kind| kind.status())
    }
}

fn thread_label() -> String {
    let current = thread::current();
    match current.name() {
        Some(name) => name.to_string(),
        None => format!("{:?}", current.id()),
    }
}

/// What the hook chain needs to know when a test ends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestEnd {
    pub status: Status,
    pub traced: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub passed: usize,
    pub failed: usize,
    pub broken: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.passed + self.failed + self.broken
    }

    pub fn add(&mut self, status: Status) {
        match status {
            Status::Passed => self.passed += 1,
            Status::Failed => self.failed += 1,
            Status::Broken => self.broken += 1,
        }
    }
}

/// Outcome of a finalize pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FinalizeReport {
    /// Results written by this pass
    pub written: usize,
    /// Previously written results whose parentSuite changed
    pub rewritten: usize,
    pub parent_suite: Option<String>,
    pub rendered: bool,
}

// =============================================================================
// ReportSession
// =============================================================================

pub struct ReportSession {
    config: TraceConfig,
    enabled: AtomicBool,
    finalized: AtomicBool,
    /// Outcome of the finalize pass, handed back to later callers
    report: Mutex<Option<FinalizeReport>>,
    states: DashMap<String, TestCaseState>,
    pending: Mutex<Vec<TestResult>>,
    passed: AtomicUsize,
    failed: AtomicUsize,
    broken: AtomicUsize,
    writer: ResultWriter,
    store: AttachmentStore,
    facts: HostFacts,
}

impl ReportSession {
    /// Prepare the results directory and start recording.
    ///
    /// A directory that cannot be prepared disables reporting; the run
    /// itself is never failed.
    pub fn start(config: TraceConfig) -> Self {
        let session = Self {
            enabled: AtomicBool::new(false),
            finalized: AtomicBool::new(false),
            report: Mutex::new(None),
            states: DashMap::new(),
            pending: Mutex::new(Vec::new()),
            passed: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            broken: AtomicUsize::new(0),
            writer: ResultWriter::new(&config.results_dir),
            store: AttachmentStore::new(&config.results_dir),
            facts: HostFacts::new(config.tags.clone()),
            config,
        };

        if !session.config.enabled {
            debug!("reporting disabled by configuration");
            return session;
        }

        match prepare_dir(&session.config.results_dir, session.config.clean) {
            Ok(()) => {
                session.enabled.store(true, Ordering::SeqCst);
                info!(dir = %session.config.results_dir.display(), "reporting enabled");
            }
            Err(e) => warn!(
                dir = %session.config.results_dir.display(),
                error = %e,
                "cannot prepare results directory, reporting disabled"
            ),
        }
        session
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn config(&self) -> &TraceConfig {
        &self.config
    }

    pub fn writer(&self) -> &ResultWriter {
        &self.writer
    }

    /// Fresh Context writing attachments into this session's directory
    pub fn new_context(&self) -> Context {
        Context::new(self.store.clone(), self.config.echo_output)
    }

    pub fn mark_traced(&self, info: &TestInfo) {
        self.states
            .entry(info.full_name())
            .or_insert_with(|| TestCaseState::new(info.clone()))
            .traced = true;
    }

    pub fn begin_test(&self, info: &TestInfo) {
        if !self.is_enabled() {
            return;
        }
        self.states
            .entry(info.full_name())
            .or_insert_with(|| TestCaseState::new(info.clone()))
            .restart();
        debug!(test = %info.full_name(), "test started");
    }

    pub fn record_assertion(&self, info: &TestInfo, event: &AssertionEvent) {
        match self.states.get_mut(&info.full_name()) {
            Some(mut state) => state.record(event.clone()),
            None => debug!(test = %info.full_name(), "assertion outside a tracked test"),
        }
    }

    /// Mark a test ended. `None` when the test is not tracked.
    pub fn end_test(&self, info: &TestInfo) -> Option<TestEnd> {
        let mut state = self.states.get_mut(&info.full_name())?;
        state.finish();
        Some(TestEnd {
            status: state.status(),
            traced: state.traced,
        })
    }

    /// Called by the tracing fixture once every inner fixture has unwound
    pub fn complete(&self, info: &TestInfo, scope: Option<ActiveScope>) {
        let full_name = info.full_name();
        let ended = self.states.get(&full_name).map(|s| s.ended);
        match ended {
            Some(true) => self.handoff(info, scope),
            Some(false) => {
                warn!(test = %full_name, "test never reported its end, dropping state");
                self.states.remove(&full_name);
            }
            None => debug!(test = %full_name, "no state to complete"),
        }
    }

    /// Assemble the finished test and buffer its result
    pub fn handoff(&self, info: &TestInfo, scope: Option<ActiveScope>) {
        let Some((_, state)) = self.states.remove(&info.full_name()) else {
            debug!(test = %info.full_name(), "nothing to hand off");
            return;
        };

        let context = scope.map(|scope| self.collect_scope(scope));
        let result = results::assemble(&state, context.as_ref(), &self.facts);
        self.count(result.status);
        debug!(
            test = %result.full_name,
            status = result.status.as_str(),
            steps = result.steps.len(),
            "result buffered"
        );
        lock_unpoisoned(&self.pending).push(result);
    }

    /// Finish artifact sources, attach published artifacts and the
    /// whole-test output
    fn collect_scope(&self, scope: ActiveScope) -> Context {
        let (mut ctx, mut published, sources) = scope.into_parts();

        for source in sources {
            let kind = source.kind();
            let finished = finish_bounded(
                kind.attachment_name(),
                self.config.finalize_timeout,
                move || source.finish(),
            );
            match finished {
                Some(Ok(Some(path))) => published.push(PublishedArtifact { kind, path }),
                Some(Ok(None)) => debug!(?kind, "source produced no artifact"),
                Some(Err(e)) => warn!(?kind, error = %e, "artifact source failed"),
                None => {}
            }
        }

        for artifact in &published {
            ctx.attach_file(
                artifact.kind.attachment_name(),
                artifact.kind.mime(),
                &artifact.path,
            );
        }

        for stream in [Stream::Stdout, Stream::Stderr] {
            let output = ctx.capture().test_output(stream);
            if !output.is_empty() {
                ctx.attach_text(stream.name(), &output);
            }
        }
        ctx
    }

    fn count(&self, status: Status) {
        let counter = match status {
            Status::Passed => &self.passed,
            Status::Failed => &self.failed,
            Status::Broken => &self.broken,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn counts(&self) -> StatusCounts {
        StatusCounts {
            passed: self.passed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            broken: self.broken.load(Ordering::Relaxed),
        }
    }

    pub fn pending_len(&self) -> usize {
        lock_unpoisoned(&self.pending).len()
    }

    /// Number of tests begun but not yet handed off
    pub fn in_flight(&self) -> usize {
        self.states.len()
    }

    /// Correct parentSuite across the run, write every buffered result and
    /// the run-level documents, optionally render. Runs once; later calls
    /// return the first pass's report.
    pub fn finalize(&self) -> Result<FinalizeReport> {
        if self.finalized.swap(true, Ordering::SeqCst) {
            debug!("session already finalized");
            return Ok(lock_unpoisoned(&self.report).clone().unwrap_or_default());
        }
        if !self.is_enabled() {
            return Ok(FinalizeReport::default());
        }

        if !self.states.is_empty() {
            warn!(count = self.states.len(), "tests still in flight at finalize");
        }

        let pending = std::mem::take(&mut *lock_unpoisoned(&self.pending));
        let environment = EnvironmentFacts::collect(&self.config);
        let outcome = finalize_results(&self.writer, pending, &environment);
        self.enabled.store(false, Ordering::SeqCst);

        let mut report = outcome?;
        if self.config.auto_report {
            match render_report(
                &self.config.report_command,
                &self.config.results_dir,
                &self.config.report_dir,
            ) {
                Ok(()) => report.rendered = true,
                Err(e) => warn!(error = %e, "report rendering failed"),
            }
        }

        let counts = self.counts();
        info!(
            passed = counts.passed,
            failed = counts.failed,
            broken = counts.broken,
            dir = %self.config.results_dir.display(),
            "results finalized"
        );
        *lock_unpoisoned(&self.report) = Some(report.clone());
        Ok(report)
    }
}

// =============================================================================
// Results directory maintenance
// =============================================================================

fn prepare_dir(dir: &Path, clean: bool) -> Result<()> {
    if clean && dir.exists() {
        clean_dir(dir)?;
    }
    fs::create_dir_all(dir)?;
    Ok(())
}

/// Remove everything inside `dir`, keeping the directory. Returns the
/// number of entries removed.
pub fn clean_dir(dir: &Path) -> Result<usize> {
    if !dir.exists() {
        return Ok(0);
    }
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
        removed += 1;
    }
    debug!(dir = %dir.display(), removed, "results directory cleaned");
    Ok(removed)
}

/// The finalize pass over a results directory.
///
/// `pending` are this run's unwritten results; results already on disk
/// take part in the parentSuite correction and are rewritten in place.
pub fn finalize_results(
    writer: &ResultWriter,
    mut pending: Vec<TestResult>,
    environment: &EnvironmentFacts,
) -> Result<FinalizeReport> {
    fs::create_dir_all(writer.dir())?;
    let mut existing = writer.existing();

    let packages: Vec<String> = pending
        .iter()
        .filter_map(|r| r.label("package").map(String::from))
        .chain(
            existing
                .iter()
                .filter_map(|s| s.label("package").map(String::from)),
        )
        .collect();
    let parent_suite = results::common_package_prefix(packages.iter().map(String::as_str));

    let mut rewritten = 0;
    match &parent_suite {
        Some(prefix) => {
            for result in &mut pending {
                result.set_label("parentSuite", prefix);
            }
            for stored in &mut existing {
                if stored.label("parentSuite") == Some(prefix.as_str()) {
                    continue;
                }
                stored.set_label("parentSuite", prefix);
                match stored.save() {
                    Ok(()) => rewritten += 1,
                    Err(e) => warn!(path = %stored.path.display(), error = %e, "failed to rewrite result"),
                }
            }
        }
        None => debug!(packages = packages.len(), "no common package, parentSuite left as is"),
    }

    let mut written = 0;
    for result in &pending {
        match writer.write(result) {
            Ok(_) => written += 1,
            Err(e) => warn!(test = %result.full_name, error = %e, "failed to write result"),
        }
    }

    environment.write(writer.dir())?;
    writer.write_categories()?;

    Ok(FinalizeReport {
        written,
        rewritten,
        parent_suite,
        rendered: false,
    })
}

/// `<command> generate <results> -o <report> --clean`
pub fn render_report(command: &str, results_dir: &Path, report_dir: &Path) -> Result<()> {
    info!(command, report = %report_dir.display(), "rendering report");
    let status = Command::new(command)
        .arg("generate")
        .arg(results_dir)
        .arg("-o")
        .arg(report_dir)
        .arg("--clean")
        .status()?;
    if !status.success() {
        return Err(TraceError::Internal(format!(
            "{} exited with {}",
            command, status
        )));
    }
    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(dir: &Path) -> TraceConfig {
        TraceConfig {
            enabled: true,
            results_dir: dir.to_path_buf(),
            commit_author: Some("tester".to_string()),
            echo_output: false,
            ..TraceConfig::default()
        }
    }

    #[test]
    fn test_state_keeps_first_failure_and_worst() {
        let mut state = TestCaseState::new(TestInfo::new("ns", "t"));
        state.record(AssertionEvent::new(AssertionKind::Pass, vec![]));
        state.record(AssertionEvent::new(AssertionKind::Fail, vec![]).with_message("first"));
        state.record(AssertionEvent::new(AssertionKind::Error, vec![]).with_message("second"));
        state.record(AssertionEvent::new(AssertionKind::Pass, vec![]));

        assert_eq!(state.status(), Status::Broken);
        assert_eq!(
            state.first_failure.as_ref().unwrap().message.as_deref(),
            Some("first")
        );
        assert_eq!(state.assertions.len(), 4);
    }

    #[test]
    fn test_disabled_config_records_nothing() {
        let temp = TempDir::new().unwrap();
        let session = ReportSession::start(TraceConfig {
            enabled: false,
            ..config(temp.path())
        });
        let info = TestInfo::new("ns", "t");
        session.begin_test(&info);
        assert!(!session.is_enabled());
        assert_eq!(session.in_flight(), 0);
        assert_eq!(session.finalize().unwrap(), FinalizeReport::default());
    }

    #[test]
    fn test_unpreparable_dir_disables() {
        let temp = TempDir::new().unwrap();
        let blocker = temp.path().join("file");
        fs::write(&blocker, "x").unwrap();

        let session = ReportSession::start(config(&blocker.join("results")));
        assert!(!session.is_enabled());
    }

    #[test]
    fn test_clean_start_empties_dir() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("old-result.json"), "{}").unwrap();

        let session = ReportSession::start(TraceConfig {
            clean: true,
            ..config(temp.path())
        });
        assert!(session.is_enabled());
        assert_eq!(fs::read_dir(temp.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_untraced_handoff_and_finalize_once() {
        let temp = TempDir::new().unwrap();
        let session = ReportSession::start(config(temp.path()));
        let info = TestInfo::new("shop::cart", "adds_item");

        session.begin_test(&info);
        session.record_assertion(&info, &AssertionEvent::new(AssertionKind::Pass, vec![]));
        let end = session.end_test(&info).unwrap();
        assert_eq!(end, TestEnd { status: Status::Passed, traced: false });
        session.handoff(&info, None);

        assert_eq!(session.pending_len(), 1);
        assert_eq!(session.counts().passed, 1);
        assert_eq!(session.in_flight(), 0);

        let report = session.finalize().unwrap();
        assert_eq!(report.written, 1);
        assert_eq!(report.parent_suite.as_deref(), Some("shop.cart"));
        assert!(!session.is_enabled());
        assert!(temp.path().join("environment.xml").exists());
        assert!(temp.path().join("categories.json").exists());

        let results = session.writer().existing().len();
        assert_eq!(session.finalize().unwrap(), report);
        assert_eq!(session.writer().existing().len(), results);
    }

    #[test]
    fn test_complete_without_end_drops_state() {
        let temp = TempDir::new().unwrap();
        let session = ReportSession::start(config(temp.path()));
        let info = TestInfo::new("ns", "skipped");
        session.mark_traced(&info);
        session.complete(&info, None);
        assert_eq!(session.in_flight(), 0);
        assert_eq!(session.pending_len(), 0);
    }

    #[test]
    fn test_clean_dir_counts_entries() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("a-result.json"), "{}").unwrap();
        fs::create_dir(temp.path().join("nested")).unwrap();
        assert_eq!(clean_dir(temp.path()).unwrap(), 2);
        assert!(temp.path().exists());
        assert_eq!(clean_dir(&temp.path().join("missing")).unwrap(), 0);
    }

    #[test]
    fn test_render_report_missing_command() {
        let temp = TempDir::new().unwrap();
        let err = render_report(
            "tach-trace-no-such-renderer",
            temp.path(),
            &temp.path().join("report"),
        );
        assert!(err.is_err());
    }
}
