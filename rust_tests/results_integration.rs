//! Results Integration Tests
//!
//! Tests for the finalize pass over a results directory:
//! - parentSuite correction across this run and earlier runs
//! - run-level documents (environment.xml, categories.json)
//! - stable history ids

use std::fs;
use std::path::Path;
use std::sync::Arc;
use tach_trace::config::TraceConfig;
use tach_trace::environment::EnvironmentFacts;
use tach_trace::harness::{Namespace, Runner};
use tach_trace::hooks::{activate, HookChain};
use tach_trace::reporter::HumanReporter;
use tach_trace::results::{common_package_prefix, ResultWriter, TestResult};
use tach_trace::session::{finalize_results, FinalizeReport, ReportSession};
use tempfile::TempDir;

fn config(dir: &Path) -> TraceConfig {
    TraceConfig {
        enabled: true,
        results_dir: dir.to_path_buf(),
        commit_author: Some("ci".to_string()),
        product_version: Some("4.2.0".to_string()),
        echo_output: false,
        ..TraceConfig::default()
    }
}

fn passing(ns: &str, test: &str) -> Namespace {
    Namespace::new(ns).with_test(test, |t| {
        t.is(true, "ok");
        Ok(())
    })
}

fn run(dir: &Path, mut namespaces: Vec<Namespace>) -> (Arc<ReportSession>, FinalizeReport) {
    let mut chain = HookChain::new(Box::new(HumanReporter));
    let session = activate(&mut chain, config(dir));
    Runner::new(chain).run(&mut namespaces);
    let report = session.finalize().unwrap();
    (session, report)
}

fn read_results(dir: &Path) -> Vec<TestResult> {
    ResultWriter::new(dir)
        .existing()
        .into_iter()
        .map(|stored| serde_json::from_value(stored.doc).unwrap())
        .collect()
}

fn parent_suites(dir: &Path) -> Vec<String> {
    let mut values: Vec<String> = read_results(dir)
        .iter()
        .map(|r| r.label("parentSuite").unwrap().to_string())
        .collect();
    values.sort();
    values
}

/// Test: the documented prefix cases
#[test]
fn test_prefix_cases() {
    assert_eq!(
        common_package_prefix(["a.b.c", "a.b.d", "a.b"]).as_deref(),
        Some("a.b")
    );
    assert_eq!(common_package_prefix(["a.b.c"]).as_deref(), Some("a.b.c"));
    assert_eq!(common_package_prefix(["a.b", "x.y"]), None);
}

/// Test: every result of the run gets the shared parent suite
#[test]
fn test_parent_suite_corrected_across_run() {
    let temp = TempDir::new().unwrap();
    let (_, report) = run(
        temp.path(),
        vec![
            passing("a::b::c", "one"),
            passing("a::b::d", "two"),
            passing("a::b", "three"),
        ],
    );

    assert_eq!(report.written, 3);
    assert_eq!(report.parent_suite.as_deref(), Some("a.b"));
    assert_eq!(parent_suites(temp.path()), vec!["a.b", "a.b", "a.b"]);
}

/// Test: unrelated packages keep their placeholders
#[test]
fn test_no_shared_prefix_leaves_placeholders() {
    let temp = TempDir::new().unwrap();
    let (_, report) = run(temp.path(), vec![passing("a::b", "one"), passing("x::y", "two")]);

    assert!(report.parent_suite.is_none());
    assert_eq!(parent_suites(temp.path()), vec!["a.b", "x.y"]);
}

/// Test: a second invocation rewrites results left by the first
#[test]
fn test_incremental_runs_share_correction() {
    let temp = TempDir::new().unwrap();

    run(temp.path(), vec![passing("shop::cart", "adds_item")]);
    assert_eq!(parent_suites(temp.path()), vec!["shop.cart"]);

    let (_, report) = run(temp.path(), vec![passing("shop::checkout", "pays")]);
    assert_eq!(report.parent_suite.as_deref(), Some("shop"));
    assert_eq!(report.rewritten, 1);
    assert_eq!(parent_suites(temp.path()), vec!["shop", "shop"]);
}

/// Test: a run with no results still writes the run-level documents
#[test]
fn test_zero_results_finalize() {
    let temp = TempDir::new().unwrap();
    let (session, report) = run(temp.path(), vec![]);

    assert_eq!(report.written, 0);
    assert!(report.parent_suite.is_none());
    assert!(!session.is_enabled());

    let env = fs::read_to_string(temp.path().join("environment.xml")).unwrap();
    assert!(env.contains("<key>product.version</key><value>4.2.0</value>"));
    assert!(env.contains("<key>commit.author</key><value>ci</value>"));

    let categories: serde_json::Value =
        serde_json::from_slice(&fs::read(temp.path().join("categories.json")).unwrap()).unwrap();
    assert_eq!(categories.as_array().unwrap().len(), 2);
}

/// Test: the same logical test keeps its id across runs
#[test]
fn test_history_id_stable_across_runs() {
    let first = TempDir::new().unwrap();
    let second = TempDir::new().unwrap();
    run(first.path(), vec![passing("shop::cart", "adds_item")]);
    run(second.path(), vec![passing("shop::cart", "adds_item")]);

    let a = &read_results(first.path())[0];
    let b = &read_results(second.path())[0];
    assert_ne!(a.uuid, b.uuid);
    assert_eq!(a.history_id, b.history_id);
    assert_eq!(a.test_case_id, b.history_id);
}

/// Test: result files carry the Allure field names
#[test]
fn test_result_document_shape() {
    let temp = TempDir::new().unwrap();
    run(temp.path(), vec![passing("shop::cart", "adds_item")]);

    let stored = ResultWriter::new(temp.path()).existing();
    let doc = &stored[0].doc;
    assert!(stored[0]
        .path
        .to_string_lossy()
        .ends_with(&format!("{}-result.json", doc["uuid"].as_str().unwrap())));
    assert_eq!(doc["stage"], "finished");
    assert_eq!(doc["status"], "passed");
    assert_eq!(doc["fullName"], "shop::cart::adds_item");
    assert!(doc["historyId"].is_string());
    assert!(doc["start"].as_i64().unwrap() <= doc["stop"].as_i64().unwrap());
    assert_eq!(doc["steps"][0]["name"], "ok");
}

/// Test: finalize over an existing directory without a session
#[test]
fn test_finalize_results_on_disk_only() {
    let temp = TempDir::new().unwrap();
    run(temp.path(), vec![passing("billing::invoices", "totals")]);
    run(temp.path(), vec![passing("billing::refunds", "partial")]);

    let mut facts = EnvironmentFacts::default();
    facts.push("os.name", "linux");
    let report = finalize_results(&ResultWriter::new(temp.path()), Vec::new(), &facts).unwrap();

    assert_eq!(report.written, 0);
    assert_eq!(report.parent_suite.as_deref(), Some("billing"));
    assert_eq!(parent_suites(temp.path()), vec!["billing", "billing"]);
}
