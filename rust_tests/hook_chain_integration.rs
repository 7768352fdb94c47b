//! Hook Chain Integration Tests
//!
//! Drives the reference host through a `HookChain` with the tracing
//! observer installed and inspects what lands in the results directory.

use std::io::Write;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tach_trace::config::TraceConfig;
use tach_trace::harness::{Namespace, Runner};
use tach_trace::hooks::{activate, HookChain, TraceListener, TRACE_OBSERVER};
use tach_trace::model::{AssertionEvent, AssertionKind, Status, TestInfo};
use tach_trace::reporter::LifecycleListener;
use tach_trace::results::{ResultWriter, TestResult};
use tach_trace::scope::{self, ScreenshotSource};
use tempfile::TempDir;

#[derive(Default, Clone)]
struct Calls {
    begin_test: Arc<AtomicUsize>,
    assertions: Arc<AtomicUsize>,
}

/// Stands in for the host's stock reporter
struct Original(Calls);

impl LifecycleListener for Original {
    fn begin_test(&mut self, _test: &TestInfo) {
        self.0.begin_test.fetch_add(1, Ordering::SeqCst);
    }

    fn assertion(&mut self, _test: &TestInfo, _event: &AssertionEvent) {
        self.0.assertions.fetch_add(1, Ordering::SeqCst);
    }
}

struct FakePage;

impl ScreenshotSource for FakePage {
    fn capture(&self) -> anyhow::Result<Vec<u8>> {
        Ok(b"\x89PNG\r\n\x1a\n".to_vec())
    }
}

fn config(dir: &Path) -> TraceConfig {
    TraceConfig {
        enabled: true,
        results_dir: dir.to_path_buf(),
        commit_author: Some("ci".to_string()),
        echo_output: false,
        ..TraceConfig::default()
    }
}

fn read_results(dir: &Path) -> Vec<TestResult> {
    ResultWriter::new(dir)
        .existing()
        .into_iter()
        .map(|stored| serde_json::from_value(stored.doc).unwrap())
        .collect()
}

fn checkout_namespace() -> Namespace {
    Namespace::new("shop::checkout").with_test("submits_order", |_| {
        scope::marker("Login");
        scope::step("Submit form", || -> anyhow::Result<()> {
            writeln!(scope::stdout(), "validating input")?;
            anyhow::bail!("network unreachable")
        })?;
        Ok(())
    })
}

/// Test: a second install is a no-op and the original handler fires once
#[test]
fn test_install_twice_original_called_once() {
    let temp = TempDir::new().unwrap();
    let calls = Calls::default();
    let mut chain = HookChain::new(Box::new(Original(calls.clone())));

    let session = activate(&mut chain, config(temp.path()));
    assert!(chain.is_installed(TRACE_OBSERVER));
    assert!(!chain.install(Box::new(TraceListener::new(Arc::clone(&session)))));
    assert_eq!(chain.observer_count(), 1);

    let mut namespaces = vec![Namespace::new("shop::cart").with_test("adds_item", |t| {
        t.is(true, "cart has one item");
        Ok(())
    })];
    Runner::new(chain).run(&mut namespaces);

    assert_eq!(calls.begin_test.load(Ordering::SeqCst), 1);
    assert_eq!(calls.assertions.load(Ordering::SeqCst), 1);
    assert_eq!(session.pending_len(), 0);
    assert_eq!(read_results(temp.path()).len(), 1);
}

/// Test: the tracing fixture is injected for the namespace and removed after
#[test]
fn test_fixture_list_restored_across_cycles() {
    let temp = TempDir::new().unwrap();
    let mut chain = HookChain::new(Box::new(Original(Calls::default())));
    let _session = activate(&mut chain, config(temp.path()));

    let seen = Arc::new(AtomicUsize::new(0));
    let probe = Arc::clone(&seen);
    let mut namespaces = vec![Namespace::new("shop::cart")
        .with_fixture(move |_, inner| {
            if scope::is_active() {
                probe.fetch_add(1, Ordering::SeqCst);
            }
            inner();
        })
        .with_test("adds_item", |t| {
            t.is_eq(1, 1);
            Ok(())
        })];

    Runner::new(chain).run(&mut namespaces);
    assert_eq!(namespaces[0].each_fixtures.len(), 1);

    // The user fixture ran inside the tracing fixture
    assert_eq!(seen.load(Ordering::SeqCst), 1);
    assert_eq!(read_results(temp.path()).len(), 1);

    let other = TempDir::new().unwrap();
    let mut chain = HookChain::new(Box::new(Original(Calls::default())));
    let _session = activate(&mut chain, config(other.path()));
    for _ in 0..3 {
        chain.begin_namespace(&mut namespaces[0]);
        assert_eq!(namespaces[0].each_fixtures.len(), 2);
        chain.end_namespace(&mut namespaces[0]);
        assert_eq!(namespaces[0].each_fixtures.len(), 1);
    }

    chain.begin_namespace(&mut namespaces[0]);
    chain.begin_namespace(&mut namespaces[0]);
    assert_eq!(namespaces[0].each_fixtures.len(), 2);
    chain.end_namespace(&mut namespaces[0]);
    assert_eq!(namespaces[0].each_fixtures.len(), 1);
}

/// Test: results reach disk when the host reports the run summary
#[test]
fn test_run_summary_writes_results() {
    let temp = TempDir::new().unwrap();
    let mut chain = HookChain::new(Box::new(Original(Calls::default())));
    let session = activate(&mut chain, config(temp.path()));

    let mut namespaces = vec![Namespace::new("shop::cart").with_test("adds_item", |t| {
        t.is(true, "cart has one item");
        Ok(())
    })];
    Runner::new(chain).run(&mut namespaces);

    assert_eq!(session.pending_len(), 0);
    assert!(!session.is_enabled());
    assert_eq!(read_results(temp.path()).len(), 1);
    assert!(temp.path().join("environment.xml").exists());
    assert!(temp.path().join("categories.json").exists());

    // A later explicit finalize reports the pass that already ran
    let report = session.finalize().unwrap();
    assert_eq!(report.written, 1);
    assert_eq!(report.parent_suite.as_deref(), Some("shop.cart"));
    assert_eq!(read_results(temp.path()).len(), 1);
}

/// Test: a fixture that panics while tearing down still hands the test off
#[test]
fn test_panicking_teardown_still_hands_off() {
    let temp = TempDir::new().unwrap();
    let mut chain = HookChain::new(Box::new(Original(Calls::default())));
    let session = activate(&mut chain, config(temp.path()));

    let mut namespaces = vec![Namespace::new("shop::ui")
        .with_fixture(|_, inner| {
            inner();
            panic!("browser crashed on close");
        })
        .with_test("renders_banner", |t| {
            t.is(true, "banner visible");
            Ok(())
        })];
    let mut runner = Runner::new(chain);
    let caught = panic::catch_unwind(AssertUnwindSafe(|| runner.run(&mut namespaces)));

    assert!(caught.is_err());
    assert!(!scope::is_active());
    assert_eq!(session.in_flight(), 0);
    assert_eq!(session.pending_len(), 1);

    session.finalize().unwrap();
    let results = read_results(temp.path());
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].full_name, "shop::ui::renders_banner");
}

/// Test: the Login / Submit form scenario end to end
#[test]
fn test_scenario_result_document() {
    let temp = TempDir::new().unwrap();
    let mut chain = HookChain::new(Box::new(Original(Calls::default())));
    let session = activate(&mut chain, config(temp.path()));

    let summary = Runner::new(chain).run(&mut [checkout_namespace()]);
    assert_eq!(summary.error, 1);
    session.finalize().unwrap();

    let results = read_results(temp.path());
    assert_eq!(results.len(), 1);
    let result = &results[0];

    assert_eq!(result.status, Status::Broken);
    assert_eq!(result.full_name, "shop::checkout::submits_order");
    let details = result.status_details.as_ref().unwrap();
    assert_eq!(details.message.as_deref(), Some("network unreachable"));
    assert!(details.trace.as_deref().unwrap().contains("network unreachable"));

    let names: Vec<_> = result.steps.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["Login", "Submit form"]);
    assert_eq!(result.steps[0].status, Status::Passed);
    let submit = &result.steps[1];
    assert_eq!(submit.status, Status::Broken);
    assert_eq!(
        submit.status_details.as_ref().unwrap().message.as_deref(),
        Some("network unreachable")
    );
    assert_eq!(submit.steps[0].name, "▸ validating input");

    let stdout = result.attachments.iter().find(|a| a.name == "stdout").unwrap();
    let body = std::fs::read_to_string(temp.path().join(&stdout.source)).unwrap();
    assert_eq!(body, "validating input\n");
}

/// Test: checks inside `testing` blocks become steps and shape the name
#[test]
fn test_assertions_recorded_as_steps() {
    let temp = TempDir::new().unwrap();
    let mut chain = HookChain::new(Box::new(Original(Calls::default())));
    let session = activate(&mut chain, config(temp.path()));

    let mut namespaces = vec![Namespace::new("shop::cart").with_test("totals", |t| {
        t.testing("cart", |t| {
            scope::step("add items", || {
                t.is(true, "two items");
                Ok(())
            })?;
            t.testing("discount", |t| t.is_eq(90, 95));
            anyhow::Ok(())
        })
    })];
    Runner::new(chain).run(&mut namespaces);
    session.finalize().unwrap();

    let result = &read_results(temp.path())[0];
    assert_eq!(result.name, "cart > totals");
    assert_eq!(result.status, Status::Failed);
    assert!(result.labels.iter().any(|l| l.name == "subSuite" && l.value == "cart"));

    assert_eq!(result.steps[0].name, "add items");
    assert_eq!(result.steps[0].steps[0].name, "two items");
    assert_eq!(result.steps[1].name, "expected: 90, actual: 95");
    assert_eq!(result.steps[1].status, Status::Failed);
}

/// Test: a failing test captures a screenshot from the bound page
#[test]
fn test_failure_screenshot_attached() {
    let temp = TempDir::new().unwrap();
    let mut chain = HookChain::new(Box::new(Original(Calls::default())));
    let session = activate(&mut chain, config(temp.path()));

    let mut namespaces = vec![Namespace::new("shop::ui")
        .with_fixture(|_, inner| {
            scope::bind_screenshots(Arc::new(FakePage));
            inner();
        })
        .with_test("renders_banner", |t| {
            t.is(false, "banner visible");
            Ok(())
        })
        .with_test("renders_footer", |t| {
            t.is(true, "footer visible");
            Ok(())
        })];
    Runner::new(chain).run(&mut namespaces);
    session.finalize().unwrap();

    let results = read_results(temp.path());
    let failed = results.iter().find(|r| r.status == Status::Failed).unwrap();
    let passed = results.iter().find(|r| r.status == Status::Passed).unwrap();
    assert!(failed
        .attachments
        .iter()
        .any(|a| a.name == "failure screenshot" && a.mime == "image/png"));
    assert!(passed.attachments.is_empty());
}

/// Test: without the tracing fixture a test is handed off at its end
#[test]
fn test_untraced_test_uses_assertion_steps() {
    let temp = TempDir::new().unwrap();
    let mut chain = HookChain::new(Box::new(Original(Calls::default())));
    let session = activate(&mut chain, config(temp.path()));

    let info = TestInfo::new("shop::legacy", "imports_orders");
    chain.begin_test(&info);
    chain.assertion(
        &info,
        &AssertionEvent::new(AssertionKind::Pass, vec![]).with_message("rows imported"),
    );
    chain.assertion(
        &info,
        &AssertionEvent::new(AssertionKind::Fail, vec![]).with_values("3", "2"),
    );
    chain.end_test(&info);

    assert_eq!(session.pending_len(), 1);
    session.finalize().unwrap();

    let result = &read_results(temp.path())[0];
    assert_eq!(result.status, Status::Failed);
    assert_eq!(result.steps.len(), 2);
    assert_eq!(result.steps[0].name, "rows imported");
    assert_eq!(
        result.steps[1].status_details.as_ref().unwrap().message.as_deref(),
        Some("expected: 3, actual: 2")
    );
}

/// Test: a disabled session passes events through untouched
#[test]
fn test_disabled_session_is_transparent() {
    let temp = TempDir::new().unwrap();
    let calls = Calls::default();
    let mut chain = HookChain::new(Box::new(Original(calls.clone())));
    let session = activate(
        &mut chain,
        TraceConfig {
            enabled: false,
            ..config(temp.path())
        },
    );

    let mut namespaces = vec![checkout_namespace()];
    Runner::new(chain).run(&mut namespaces);

    assert_eq!(calls.begin_test.load(Ordering::SeqCst), 1);
    assert_eq!(session.pending_len(), 0);
    assert!(read_results(temp.path()).is_empty());
}
