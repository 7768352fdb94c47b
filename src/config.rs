//! Configuration Loader
//! - Reads `[package.metadata.tach-trace]` from the project's Cargo.toml
//! - Applies `TACH_TRACE_*` environment overrides on top
//! - Provides CLI argument parsing with clap for the `tach-trace` binary

use crate::teardown::DEFAULT_FINALIZE_TIMEOUT;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

// =============================================================================
// CLI Configuration
// =============================================================================

/// Output format for summaries
#[derive(ValueEnum, Clone, Debug, Default, PartialEq)]
pub enum OutputFormat {
    /// Human-readable CLI output (to stderr)
    #[default]
    Human,
    /// Machine-readable NDJSON (to stdout)
    Json,
}

/// tach-trace - maintain Allure results directories
#[derive(Parser)]
#[command(
    name = "tach-trace",
    version,
    about = "Finalize and inspect tach-trace results directories"
)]
pub struct Cli {
    /// Output format (also: TACH_FORMAT env var)
    #[arg(long, value_enum, default_value_t = OutputFormat::Human, env = "TACH_FORMAT")]
    pub format: OutputFormat,

    /// Results directory (also: TACH_TRACE_DIR env var)
    #[arg(long, env = "TACH_TRACE_DIR", default_value = DEFAULT_RESULTS_DIR)]
    pub dir: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

/// Subcommands
#[derive(Subcommand, Clone, Debug)]
pub enum Commands {
    /// Correct parentSuite labels and write the run-level documents
    Finalize {
        /// Render the HTML report afterwards
        #[arg(long)]
        render: bool,
    },
    /// Count results by status
    Summary,
    /// Remove everything in the results directory
    Clean,
}

// =============================================================================
// Trace Configuration
// =============================================================================

pub const DEFAULT_RESULTS_DIR: &str = "allure-results";
pub const DEFAULT_REPORT_DIR: &str = "allure-report";
pub const DEFAULT_REPORT_COMMAND: &str = "allure";

/// Reporting settings, read once when a session starts
#[derive(Debug, Clone, PartialEq)]
pub struct TraceConfig {
    pub enabled: bool,
    pub results_dir: PathBuf,
    pub auto_report: bool,
    pub report_dir: PathBuf,
    pub report_command: String,
    pub clean: bool,
    pub product_version: Option<String>,
    pub commit_author: Option<String>,
    pub tags: Vec<String>,
    pub finalize_timeout: Duration,
    pub echo_output: bool,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            results_dir: PathBuf::from(DEFAULT_RESULTS_DIR),
            auto_report: false,
            report_dir: PathBuf::from(DEFAULT_REPORT_DIR),
            report_command: DEFAULT_REPORT_COMMAND.to_string(),
            clean: false,
            product_version: None,
            commit_author: None,
            tags: Vec::new(),
            finalize_timeout: DEFAULT_FINALIZE_TIMEOUT,
            echo_output: true,
        }
    }
}

#[derive(Deserialize, Default)]
struct CargoManifest {
    package: Option<PackageSection>,
}

#[derive(Deserialize, Default)]
struct PackageSection {
    metadata: Option<MetadataSection>,
}

#[derive(Deserialize, Default)]
struct MetadataSection {
    #[serde(rename = "tach-trace")]
    tach_trace: Option<FileConfig>,
}

/// `[package.metadata.tach-trace]`
#[derive(Deserialize, Default, Debug)]
#[serde(rename_all = "kebab-case")]
struct FileConfig {
    enabled: Option<bool>,
    results_dir: Option<PathBuf>,
    auto_report: Option<bool>,
    report_dir: Option<PathBuf>,
    report_command: Option<String>,
    clean: Option<bool>,
    version: Option<String>,
    commit_author: Option<String>,
    tags: Option<Vec<String>>,
    finalize_timeout_secs: Option<u64>,
    echo: Option<bool>,
}

impl TraceConfig {
    /// Defaults, then Cargo.toml metadata under `root`, then the process
    /// environment.
    pub fn load(root: &Path) -> Self {
        let mut config = Self::default();
        if let Some(file) = read_manifest(root) {
            config.apply_file(file);
        }
        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    /// `load` rooted at the current directory
    pub fn from_env() -> Self {
        let root = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self::load(&root)
    }

    fn apply_file(&mut self, file: FileConfig) {
        if let Some(v) = file.enabled {
            self.enabled = v;
        }
        if let Some(v) = file.results_dir {
            self.results_dir = v;
        }
        if let Some(v) = file.auto_report {
            self.auto_report = v;
        }
        if let Some(v) = file.report_dir {
            self.report_dir = v;
        }
        if let Some(v) = file.report_command {
            self.report_command = v;
        }
        if let Some(v) = file.clean {
            self.clean = v;
        }
        if file.version.is_some() {
            self.product_version = file.version;
        }
        if file.commit_author.is_some() {
            self.commit_author = file.commit_author;
        }
        if let Some(v) = file.tags {
            self.tags = v;
        }
        match file.finalize_timeout_secs.map(positive_secs) {
            Some(Some(timeout)) => self.finalize_timeout = timeout,
            Some(None) => warn!(
                key = "finalize-timeout-secs",
                "timeout must be positive, keeping {}s",
                self.finalize_timeout.as_secs()
            ),
            None => {}
        }
        if let Some(v) = file.echo {
            self.echo_output = v;
        }
    }

    /// Apply `TACH_TRACE_*` overrides read through `lookup`
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let flag = |key: &str, current: bool| match lookup(key) {
            Some(raw) => parse_bool(key, &raw).unwrap_or(current),
            None => current,
        };

        self.enabled = flag("TACH_TRACE", self.enabled);
        self.auto_report = flag("TACH_TRACE_REPORT", self.auto_report);
        self.clean = flag("TACH_TRACE_CLEAN", self.clean);
        self.echo_output = flag("TACH_TRACE_ECHO", self.echo_output);

        if let Some(dir) = non_empty(lookup("TACH_TRACE_DIR")) {
            self.results_dir = PathBuf::from(dir);
        }
        if let Some(dir) = non_empty(lookup("TACH_TRACE_REPORT_DIR")) {
            self.report_dir = PathBuf::from(dir);
        }
        if let Some(cmd) = non_empty(lookup("TACH_TRACE_REPORT_CMD")) {
            self.report_command = cmd;
        }
        if let Some(version) = non_empty(lookup("TACH_TRACE_VERSION")) {
            self.product_version = Some(version);
        }
        if let Some(author) = non_empty(lookup("TACH_TRACE_COMMIT_AUTHOR")) {
            self.commit_author = Some(author);
        }
        if let Some(tags) = lookup("TACH_TRACE_TAGS") {
            self.tags = tags
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(raw) = lookup("TACH_TRACE_FINALIZE_TIMEOUT_SECS") {
            match raw.trim().parse::<u64>().ok().and_then(positive_secs) {
                Some(timeout) => self.finalize_timeout = timeout,
                None => warn!(
                    key = "TACH_TRACE_FINALIZE_TIMEOUT_SECS",
                    value = %raw,
                    "invalid timeout, keeping {}s",
                    self.finalize_timeout.as_secs()
                ),
            }
        }
    }
}

/// Seconds to a finalize timeout; zero is rejected
fn positive_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

fn read_manifest(root: &Path) -> Option<FileConfig> {
    let manifest_path = root.join("Cargo.toml");
    if !manifest_path.exists() {
        return None;
    }

    let contents = match fs::read_to_string(&manifest_path) {
        Ok(c) => c,
        Err(e) => {
            warn!(path = %manifest_path.display(), error = %e, "failed to read Cargo.toml");
            return None;
        }
    };

    let manifest: CargoManifest = match toml::from_str(&contents) {
        Ok(m) => m,
        Err(e) => {
            warn!(path = %manifest_path.display(), error = %e, "failed to parse Cargo.toml");
            return None;
        }
    };

    let file = manifest.package?.metadata?.tach_trace;
    if file.is_some() {
        debug!(path = %manifest_path.display(), "loaded [package.metadata.tach-trace]");
    }
    file
}

fn parse_bool(key: &str, raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => {
            warn!(key, value = raw, "invalid boolean, keeping default");
            None
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = TraceConfig::default();
        assert!(!config.enabled);
        assert_eq!(config.results_dir, PathBuf::from("allure-results"));
        assert_eq!(config.report_command, "allure");
        assert_eq!(config.finalize_timeout, Duration::from_secs(5));
        assert!(config.echo_output);
    }

    #[test]
    fn test_parse_manifest_metadata() {
        let toml_content = r#"
[package]
name = "shop-tests"

[package.metadata.tach-trace]
enabled = true
results-dir = "target/allure"
tags = ["smoke", "ui"]
finalize-timeout-secs = 10
"#;
        let manifest: CargoManifest = toml::from_str(toml_content).unwrap();
        let file = manifest.package.unwrap().metadata.unwrap().tach_trace.unwrap();

        let mut config = TraceConfig::default();
        config.apply_file(file);
        assert!(config.enabled);
        assert_eq!(config.results_dir, PathBuf::from("target/allure"));
        assert_eq!(config.tags, vec!["smoke", "ui"]);
        assert_eq!(config.finalize_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_parse_manifest_without_metadata() {
        let manifest: CargoManifest = toml::from_str("[package]\nname = \"x\"\n").unwrap();
        assert!(manifest.package.unwrap().metadata.is_none());
    }

    #[test]
    fn test_env_overrides_file() {
        let mut config = TraceConfig {
            results_dir: PathBuf::from("from-file"),
            ..TraceConfig::default()
        };
        config.apply_env(lookup(&[
            ("TACH_TRACE", "1"),
            ("TACH_TRACE_DIR", "from-env"),
            ("TACH_TRACE_TAGS", "smoke, ,nightly"),
            ("TACH_TRACE_VERSION", "2.4.0"),
            ("TACH_TRACE_ECHO", "off"),
        ]));

        assert!(config.enabled);
        assert_eq!(config.results_dir, PathBuf::from("from-env"));
        assert_eq!(config.tags, vec!["smoke", "nightly"]);
        assert_eq!(config.product_version.as_deref(), Some("2.4.0"));
        assert!(!config.echo_output);
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let mut config = TraceConfig::default();
        config.apply_env(lookup(&[
            ("TACH_TRACE", "maybe"),
            ("TACH_TRACE_FINALIZE_TIMEOUT_SECS", "soon"),
            ("TACH_TRACE_DIR", "  "),
        ]));

        assert!(!config.enabled);
        assert_eq!(config.finalize_timeout, Duration::from_secs(5));
        assert_eq!(config.results_dir, PathBuf::from("allure-results"));
    }

    #[test]
    fn test_zero_timeout_keeps_default() {
        let mut config = TraceConfig::default();
        config.apply_env(lookup(&[("TACH_TRACE_FINALIZE_TIMEOUT_SECS", "0")]));
        assert_eq!(config.finalize_timeout, Duration::from_secs(5));

        config.apply_env(lookup(&[("TACH_TRACE_FINALIZE_TIMEOUT_SECS", " 12 ")]));
        assert_eq!(config.finalize_timeout, Duration::from_secs(12));

        config.apply_file(FileConfig {
            finalize_timeout_secs: Some(0),
            ..FileConfig::default()
        });
        assert_eq!(config.finalize_timeout, Duration::from_secs(12));
    }

    #[test]
    fn test_load_reads_manifest() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join("Cargo.toml"),
            "[package]\nname = \"x\"\n\n[package.metadata.tach-trace]\nreport-command = \"allure-cli\"\n",
        )
        .unwrap();

        let config = TraceConfig::load(temp.path());
        assert_eq!(config.report_command, "allure-cli");
    }

    #[test]
    fn test_load_nonexistent_manifest() {
        let temp = TempDir::new().unwrap();
        let config = TraceConfig::load(temp.path());
        assert_eq!(config.report_dir, PathBuf::from("allure-report"));
    }

    #[test]
    fn test_load_malformed_manifest() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("Cargo.toml"), "[package\nname=").unwrap();
        let config = TraceConfig::load(temp.path());
        assert_eq!(config.report_command, "allure");
    }

    #[test]
    fn test_cli_parses_finalize() {
        let cli = Cli::try_parse_from(["tach-trace", "--dir", "out", "finalize", "--render"]).unwrap();
        assert_eq!(cli.dir, PathBuf::from("out"));
        assert!(matches!(cli.command, Commands::Finalize { render: true }));
    }
}
