//! Environment facts for `environment.xml`
//!
//! Collected once at finalize: runtime and OS facts, the crate version,
//! and the optional product version and commit author.

use crate::config::TraceConfig;
use crate::error::Result;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

pub const ENVIRONMENT_FILE: &str = "environment.xml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Fact {
    pub key: String,
    pub value: String,
}

/// `<environment><parameter><key/><value/></parameter>...</environment>`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename = "environment")]
pub struct EnvironmentFacts {
    #[serde(rename = "parameter")]
    pub facts: Vec<Fact>,
}

impl EnvironmentFacts {
    pub fn collect(config: &TraceConfig) -> Self {
        let mut facts = Self::default();
        facts.push("runtime", format!("rust ({})", env!("CARGO_PKG_NAME")));
        facts.push("tach-trace.version", env!("CARGO_PKG_VERSION"));
        facts.push("os.name", std::env::consts::OS);
        facts.push("os.arch", std::env::consts::ARCH);
        facts.push("os.family", std::env::consts::FAMILY);
        if let Some(version) = &config.product_version {
            facts.push("product.version", version);
        }
        if let Some(author) = find_commit_author(config) {
            facts.push("commit.author", author);
        }
        facts
    }

    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.facts.push(Fact {
            key: key.into(),
            value: value.into(),
        });
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.facts
            .iter()
            .find(|f| f.key == key)
            .map(|f| f.value.as_str())
    }

    pub fn to_xml(&self) -> Result<String> {
        Ok(quick_xml::se::to_string(self)?)
    }

    /// Write `environment.xml` into `dir`
    pub fn write(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(ENVIRONMENT_FILE);
        fs::write(&path, self.to_xml()?)?;
        Ok(path)
    }
}

/// Find the commit author to report.
///
/// Search order:
/// 1. Configured value (Cargo.toml metadata or TACH_TRACE_COMMIT_AUTHOR)
/// 2. Author of the last commit in the current git checkout
pub fn find_commit_author(config: &TraceConfig) -> Option<String> {
    if let Some(author) = &config.commit_author {
        return Some(author.clone());
    }

    let output = Command::new("git")
        .args(["log", "-1", "--format=%an"])
        .output()
        .ok()?;
    if !output.status.success() {
        debug!("git log unavailable, no commit author");
        return None;
    }
    let author = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!author.is_empty()).then_some(author)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_collect_includes_configured_values() {
        let config = TraceConfig {
            product_version: Some("3.1.0".to_string()),
            commit_author: Some("Dana".to_string()),
            ..TraceConfig::default()
        };
        let facts = EnvironmentFacts::collect(&config);

        assert_eq!(facts.get("product.version"), Some("3.1.0"));
        assert_eq!(facts.get("commit.author"), Some("Dana"));
        assert_eq!(facts.get("os.name"), Some(std::env::consts::OS));
        assert!(facts.get("runtime").unwrap().starts_with("rust"));
    }

    #[test]
    fn test_configured_author_takes_priority() {
        let config = TraceConfig {
            commit_author: Some("Configured".to_string()),
            ..TraceConfig::default()
        };
        assert_eq!(find_commit_author(&config).as_deref(), Some("Configured"));
    }

    #[test]
    fn test_xml_shape() {
        let mut facts = EnvironmentFacts::default();
        facts.push("os.name", "linux");
        facts.push("product.version", "1.0 <beta>");

        let xml = facts.to_xml().unwrap();
        assert!(xml.starts_with("<environment>"));
        assert!(xml.contains("<parameter><key>os.name</key><value>linux</value></parameter>"));
        assert!(xml.contains("1.0 &lt;beta"));
        assert!(xml.ends_with("</environment>"));
    }

    #[test]
    fn test_write_creates_file() {
        let temp = tempdir().unwrap();
        let mut facts = EnvironmentFacts::default();
        facts.push("os.arch", "x86_64");

        let path = facts.write(temp.path()).unwrap();
        assert_eq!(path.file_name().unwrap(), ENVIRONMENT_FILE);
        let content = fs::read_to_string(path).unwrap();
        assert!(content.contains("<key>os.arch</key>"));
    }
}
