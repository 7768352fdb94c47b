//! CLI Integration Tests
//!
//! Tests for:
//! - CLI flag and subcommand recognition (--format, --dir, finalize --render)
//! - The directory operations behind `finalize`, `summary` and `clean`

use clap::Parser;
use std::fs;
use std::path::{Path, PathBuf};
use tach_trace::config::{Cli, Commands, OutputFormat, TraceConfig};
use tach_trace::environment::EnvironmentFacts;
use tach_trace::harness::{Namespace, Runner};
use tach_trace::hooks::{activate, HookChain};
use tach_trace::model::Status;
use tach_trace::reporter::{HumanReporter, JsonReporter, LifecycleListener};
use tach_trace::results::ResultWriter;
use tach_trace::session::{clean_dir, finalize_results, StatusCounts};
use tempfile::TempDir;

fn populate(dir: &Path) {
    let mut chain = HookChain::new(Box::new(HumanReporter));
    let session = activate(
        &mut chain,
        TraceConfig {
            enabled: true,
            results_dir: dir.to_path_buf(),
            commit_author: Some("ci".to_string()),
            echo_output: false,
            ..TraceConfig::default()
        },
    );
    let mut namespaces = vec![Namespace::new("inventory::stock")
        .with_test("reserves", |t| {
            t.is(true, "reserved");
            Ok(())
        })
        .with_test("releases", |t| {
            t.is_eq(0, 1);
            Ok(())
        })
        .with_test("reconciles", |_| anyhow::bail!("ledger offline"))];
    Runner::new(chain).run(&mut namespaces);
    session.finalize().unwrap();
}

fn count(dir: &Path) -> StatusCounts {
    let mut counts = StatusCounts::default();
    for status in ResultWriter::new(dir).existing().iter().filter_map(|r| r.status()) {
        counts.add(status);
    }
    counts
}

/// Test output format enum variants
#[test]
fn test_output_format_variants() {
    assert_ne!(OutputFormat::Human, OutputFormat::Json);
    assert_eq!(OutputFormat::default(), OutputFormat::Human);
}

/// Test the finalize subcommand and its flags
#[test]
fn test_cli_finalize_flags() {
    let cli = Cli::try_parse_from([
        "tach-trace",
        "--format",
        "json",
        "--dir",
        "target/allure",
        "finalize",
        "--render",
    ])
    .unwrap();

    assert_eq!(cli.format, OutputFormat::Json);
    assert_eq!(cli.dir, PathBuf::from("target/allure"));
    assert!(matches!(cli.command, Commands::Finalize { render: true }));
}

/// Test the remaining subcommands parse
#[test]
fn test_cli_subcommands() {
    let cli = Cli::try_parse_from(["tach-trace", "--dir", "out", "summary"]).unwrap();
    assert!(matches!(cli.command, Commands::Summary));

    let cli = Cli::try_parse_from(["tach-trace", "--dir", "out", "clean"]).unwrap();
    assert!(matches!(cli.command, Commands::Clean));

    assert!(Cli::try_parse_from(["tach-trace"]).is_err());
    assert!(Cli::try_parse_from(["tach-trace", "--format", "xml", "summary"]).is_err());
}

/// Test status counting over a populated directory
#[test]
fn test_summary_counts() {
    let temp = TempDir::new().unwrap();
    populate(temp.path());

    let counts = count(temp.path());
    assert_eq!(counts.total(), 3);
    assert_eq!(counts.passed, 1);
    assert_eq!(counts.failed, 1);
    assert_eq!(counts.broken, 1);

    // Both reporters accept the summary without panicking
    HumanReporter.results(temp.path(), &counts);
    JsonReporter.results(temp.path(), &counts);
}

/// Test finalize over a directory is repeatable
#[test]
fn test_finalize_directory_idempotent() {
    let temp = TempDir::new().unwrap();
    populate(temp.path());
    let writer = ResultWriter::new(temp.path());
    let facts = EnvironmentFacts::default();

    let report = finalize_results(&writer, Vec::new(), &facts).unwrap();
    assert_eq!(report.parent_suite.as_deref(), Some("inventory.stock"));
    assert_eq!(report.rewritten, 0);

    let again = finalize_results(&writer, Vec::new(), &facts).unwrap();
    assert_eq!(again.rewritten, 0);
    assert_eq!(writer.existing().len(), 3);
}

/// Test files that are not result documents are ignored
#[test]
fn test_foreign_files_ignored() {
    let temp = TempDir::new().unwrap();
    populate(temp.path());
    fs::write(temp.path().join("broken-result.json"), b"{not json").unwrap();
    fs::write(temp.path().join("notes.txt"), b"hello").unwrap();

    let counts = count(temp.path());
    assert_eq!(counts.total(), 3);

    let statuses: Vec<Status> = ResultWriter::new(temp.path())
        .existing()
        .iter()
        .filter_map(|r| r.status())
        .collect();
    assert!(statuses.contains(&Status::Broken));
}

/// Test clean empties the directory but keeps it
#[test]
fn test_clean_directory() {
    let temp = TempDir::new().unwrap();
    populate(temp.path());
    fs::create_dir(temp.path().join("nested")).unwrap();

    let removed = clean_dir(temp.path()).unwrap();
    assert!(removed >= 6);
    assert!(temp.path().is_dir());
    assert_eq!(fs::read_dir(temp.path()).unwrap().count(), 0);

    assert_eq!(clean_dir(&temp.path().join("missing")).unwrap(), 0);
}
