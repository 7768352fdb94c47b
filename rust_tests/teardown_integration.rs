//! Teardown Synchronization Integration Tests
//!
//! Collaborator fixtures write trace / network files while they unwind,
//! after the host has already reported the test's end. These tests check
//! that results only reference artifacts that exist and are non-empty.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tach_trace::attachment::TRACE_MIME;
use tach_trace::config::TraceConfig;
use tach_trace::harness::{Namespace, Runner};
use tach_trace::hooks::{activate, HookChain};
use tach_trace::reporter::HumanReporter;
use tach_trace::results::{ResultWriter, TestResult};
use tach_trace::scope::{self, ArtifactSource};
use tach_trace::session::ReportSession;
use tach_trace::teardown::ArtifactKind;
use tempfile::TempDir;

fn config(dir: &Path) -> TraceConfig {
    TraceConfig {
        enabled: true,
        results_dir: dir.join("results"),
        commit_author: Some("ci".to_string()),
        echo_output: false,
        ..TraceConfig::default()
    }
}

fn run_one(config: TraceConfig, ns: Namespace) -> (Arc<ReportSession>, Vec<TestResult>) {
    let dir = config.results_dir.clone();
    let mut chain = HookChain::new(Box::new(HumanReporter));
    let session = activate(&mut chain, config);
    Runner::new(chain).run(&mut [ns]);
    session.finalize().unwrap();

    let results = ResultWriter::new(&dir)
        .existing()
        .into_iter()
        .map(|stored| serde_json::from_value(stored.doc).unwrap())
        .collect();
    (session, results)
}

/// Writes its archive only when asked to finish
struct SlowTrace {
    path: PathBuf,
    delay: Duration,
}

impl ArtifactSource for SlowTrace {
    fn kind(&self) -> ArtifactKind {
        ArtifactKind::Trace
    }

    fn finish(&self) -> anyhow::Result<Option<PathBuf>> {
        thread::sleep(self.delay);
        fs::write(&self.path, b"PK\x03\x04trace")?;
        Ok(Some(self.path.clone()))
    }
}

/// Test: an artifact published by an inner fixture during teardown is attached
#[test]
fn test_published_artifact_written_during_teardown() {
    let temp = TempDir::new().unwrap();
    let config = config(temp.path());
    let trace_path = temp.path().join("trace.zip");

    let session_slot: Arc<std::sync::Mutex<Option<Arc<ReportSession>>>> = Default::default();
    let buffered_before_publish = Arc::new(AtomicBool::new(true));

    let (path, slot, flag) = (
        trace_path.clone(),
        Arc::clone(&session_slot),
        Arc::clone(&buffered_before_publish),
    );
    let ns = Namespace::new("shop::checkout")
        .with_fixture(move |_, inner| {
            inner();
            // Still tearing down: nothing may be buffered yet
            if let Some(session) = slot.lock().unwrap().as_ref() {
                flag.store(session.pending_len() > 0, Ordering::SeqCst);
            }
            thread::sleep(Duration::from_millis(100));
            fs::write(&path, b"PK\x03\x04trace").unwrap();
            scope::publish_artifact(ArtifactKind::Trace, &path);
        })
        .with_test("pays_with_card", |t| {
            t.is(true, "order placed");
            Ok(())
        });

    let dir = config.results_dir.clone();
    let mut chain = HookChain::new(Box::new(HumanReporter));
    let session = activate(&mut chain, config);
    *session_slot.lock().unwrap() = Some(Arc::clone(&session));
    Runner::new(chain).run(&mut [ns]);
    session.finalize().unwrap();

    assert!(!buffered_before_publish.load(Ordering::SeqCst));

    let stored = ResultWriter::new(&dir).existing();
    let result: TestResult = serde_json::from_value(stored[0].doc.clone()).unwrap();
    let trace = result
        .attachments
        .iter()
        .find(|a| a.mime == TRACE_MIME)
        .expect("trace attached");
    assert!(trace.source.ends_with(".zip"));
    let copied = fs::read(dir.join(&trace.source)).unwrap();
    assert_eq!(copied, b"PK\x03\x04trace");
}

/// Test: a bound source is finished at handoff and its file attached
#[test]
fn test_artifact_source_finished_at_handoff() {
    let temp = TempDir::new().unwrap();
    let trace_path = temp.path().join("late-trace.zip");
    let path = trace_path.clone();

    let ns = Namespace::new("shop::checkout")
        .with_fixture(move |_, inner| {
            scope::bind_artifact_source(Arc::new(SlowTrace {
                path: path.clone(),
                delay: Duration::from_millis(150),
            }));
            inner();
        })
        .with_test("pays_with_card", |_| Ok(()));

    let (_, results) = run_one(config(temp.path()), ns);
    assert!(trace_path.exists());
    assert_eq!(results[0].attachments.len(), 1);
    assert_eq!(results[0].attachments[0].name, "trace");
}

/// Test: a hanging finalize is abandoned after the timeout
#[test]
fn test_hanging_source_times_out() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("never.zip");
    let config = TraceConfig {
        finalize_timeout: Duration::from_millis(100),
        ..config(temp.path())
    };

    let ns = Namespace::new("shop::checkout")
        .with_fixture(move |_, inner| {
            scope::bind_artifact_source(Arc::new(SlowTrace {
                path: path.clone(),
                delay: Duration::from_secs(3),
            }));
            inner();
        })
        .with_test("pays_with_card", |_| Ok(()));

    let start = Instant::now();
    let (session, results) = run_one(config, ns);
    assert!(start.elapsed() < Duration::from_secs(2));
    assert_eq!(session.counts().passed, 1);
    assert_eq!(results.len(), 1);
    assert!(results[0].attachments.is_empty());
}

/// Test: empty or missing artifacts are never referenced
#[test]
fn test_empty_and_missing_artifacts_skipped() {
    let temp = TempDir::new().unwrap();
    let empty = temp.path().join("empty.har");
    let missing = temp.path().join("missing.zip");
    fs::write(&empty, b"").unwrap();

    let ns = Namespace::new("shop::checkout")
        .with_fixture(move |_, inner| {
            inner();
            scope::publish_artifact(ArtifactKind::Network, &empty);
            scope::publish_artifact(ArtifactKind::Trace, &missing);
        })
        .with_test("pays_with_card", |_| Ok(()));

    let (_, results) = run_one(config(temp.path()), ns);
    assert_eq!(results.len(), 1);
    assert!(results[0].attachments.is_empty());
}
