//! Reporter Module: lifecycle callbacks plus Human (CLI) and Machine (JSON)
//! handlers
//!
//! ## Architecture
//!
//! - `LifecycleListener` trait defines the host's event callbacks
//! - `HumanReporter` outputs clojure.test-style text to stderr
//! - `JsonReporter` outputs NDJSON to stdout (for --format=json)
//!
//! ## Stdout Purity
//!
//! When JsonReporter is active, ONLY valid JSON goes to stdout.
//! All other output (logs, errors, debug) must go to stderr.

use crate::harness::Namespace;
use crate::model::{AssertionEvent, AssertionKind, RunSummary, TestInfo};
use crate::session::StatusCounts;
use serde::Serialize;
use std::path::Path;

/// Callbacks a test host fires over a run. Every method defaults to a no-op.
pub trait LifecycleListener {
    /// A namespace is about to run; its fixtures may be edited
    fn begin_namespace(&mut self, _ns: &mut Namespace) {}

    fn end_namespace(&mut self, _ns: &mut Namespace) {}

    fn begin_test(&mut self, _test: &TestInfo) {}

    fn end_test(&mut self, _test: &TestInfo) {}

    /// One pass / fail / error report
    fn assertion(&mut self, _test: &TestInfo, _event: &AssertionEvent) {}

    /// End of the whole run
    fn summary(&mut self, _summary: &RunSummary) {}

    /// Status counts over a results directory
    fn results(&mut self, _dir: &Path, _counts: &StatusCounts) {}
}

/// Machine-readable events for JSON output
#[derive(Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MachineEvent<'a> {
    NamespaceStart {
        name: &'a str,
    },
    TestStart {
        id: &'a str,
    },
    Assertion {
        id: &'a str,
        kind: AssertionKind,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<&'a str>,
    },
    TestFinished {
        id: &'a str,
    },
    RunFinished {
        tests: usize,
        assertions: usize,
        pass: usize,
        fail: usize,
        error: usize,
        duration_ms: u64,
    },
    Results {
        dir: &'a str,
        passed: usize,
        failed: usize,
        broken: usize,
    },
}

impl MachineEvent<'_> {
    fn emit(&self) {
        // ONLY JsonReporter touches stdout
        if let Ok(line) = serde_json::to_string(self) {
            println!("{}", line);
        }
    }
}

/// JSON Reporter - outputs NDJSON to stdout
pub struct JsonReporter;

impl LifecycleListener for JsonReporter {
    fn begin_namespace(&mut self, ns: &mut Namespace) {
        MachineEvent::NamespaceStart { name: &ns.name }.emit();
    }

    fn begin_test(&mut self, test: &TestInfo) {
        let id = test.full_name();
        MachineEvent::TestStart { id: &id }.emit();
    }

    fn end_test(&mut self, test: &TestInfo) {
        let id = test.full_name();
        MachineEvent::TestFinished { id: &id }.emit();
    }

    fn assertion(&mut self, test: &TestInfo, event: &AssertionEvent) {
        if event.kind == AssertionKind::Pass {
            return;
        }
        let id = test.full_name();
        let message = event.failure_message();
        MachineEvent::Assertion {
            id: &id,
            kind: event.kind,
            message: Some(&message),
        }
        .emit();
    }

    fn summary(&mut self, summary: &RunSummary) {
        MachineEvent::RunFinished {
            tests: summary.tests,
            assertions: summary.assertions,
            pass: summary.pass,
            fail: summary.fail,
            error: summary.error,
            duration_ms: summary.duration_ms,
        }
        .emit();
    }

    fn results(&mut self, dir: &Path, counts: &StatusCounts) {
        let dir = dir.display().to_string();
        MachineEvent::Results {
            dir: &dir,
            passed: counts.passed,
            failed: counts.failed,
            broken: counts.broken,
        }
        .emit();
    }
}

/// Human Reporter - outputs readable text to stderr
pub struct HumanReporter;

impl LifecycleListener for HumanReporter {
    fn begin_namespace(&mut self, ns: &mut Namespace) {
        eprintln!("\nTesting {}", ns.name);
    }

    fn assertion(&mut self, test: &TestInfo, event: &AssertionEvent) {
        let heading = match event.kind {
            AssertionKind::Pass => return,
            AssertionKind::Fail => "FAIL",
            AssertionKind::Error => "ERROR",
        };
        eprintln!("\n{} in ({}) ({})", heading, test.name, test.namespace);
        if !event.context.is_empty() {
            eprintln!("{}", event.context.join(" "));
        }
        if let Some(message) = &event.message {
            eprintln!("{}", message);
        }
        if let Some(expected) = &event.expected {
            eprintln!("expected: {}", expected);
        }
        if let Some(actual) = &event.actual {
            eprintln!("  actual: {}", actual);
        }
        if let Some(trace) = &event.trace {
            for line in trace.lines().take(10) {
                eprintln!("    {}", line);
            }
        }
    }

    fn summary(&mut self, summary: &RunSummary) {
        eprintln!(
            "\nRan {} tests containing {} assertions.",
            summary.tests, summary.assertions
        );
        eprintln!(
            "{} failures, {} errors. ({}ms)",
            summary.fail, summary.error, summary.duration_ms
        );
    }

    fn results(&mut self, dir: &Path, counts: &StatusCounts) {
        eprintln!(
            "[tach-trace] {} results in {}: {} passed, {} failed, {} broken",
            counts.total(),
            dir.display(),
            counts.passed,
            counts.failed,
            counts.broken
        );
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assertion_event_serialization() {
        let event = MachineEvent::Assertion {
            id: "shop::cart::adds_item",
            kind: AssertionKind::Fail,
            message: None,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"assertion\""));
        assert!(json.contains("\"kind\":\"fail\""));
        assert!(!json.contains("message"));
    }

    #[test]
    fn test_run_finished_event() {
        let event = MachineEvent::RunFinished {
            tests: 3,
            assertions: 7,
            pass: 6,
            fail: 1,
            error: 0,
            duration_ms: 12,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"run_finished\""));
        assert!(json.contains("\"assertions\":7"));
    }

    #[test]
    fn test_results_event() {
        let event = MachineEvent::Results {
            dir: "allure-results",
            passed: 2,
            failed: 1,
            broken: 0,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"results\""));
        assert!(json.contains("\"dir\":\"allure-results\""));
    }
}
