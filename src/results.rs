//! Result assembly and the results directory
//!
//! Converts a finished test case into the Allure result document, computes
//! the run-wide parentSuite correction, and reads/writes the files the
//! report renderer consumes:
//!
//! - `<uuid>-result.json`, one per test case
//! - `categories.json`
//!
//! `environment.xml` lives in [`crate::environment`].

use crate::context::Context;
use crate::error::{Result, TraceError};
use crate::model::{
    AssertionEvent, AssertionKind, Attachment, Label, Link, Parameter, Status, StatusDetails,
    Step,
};
use crate::session::TestCaseState;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

pub const RESULT_SUFFIX: &str = "-result.json";
pub const CATEGORIES_FILE: &str = "categories.json";

/// Constant `tag` label carried by every result
pub const FRAMEWORK_TAG: &str = "tach";

/// The persisted per-test document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    pub uuid: String,
    pub history_id: String,
    pub test_case_id: String,
    pub full_name: String,
    pub name: String,
    pub status: Status,
    pub stage: String,
    pub start: i64,
    pub stop: i64,
    pub labels: Vec<Label>,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    #[serde(default)]
    pub links: Vec<Link>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_details: Option<StatusDetails>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<Step>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl TestResult {
    /// First value of label `name`
    pub fn label(&self, name: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|l| l.name == name)
            .map(|l| l.value.as_str())
    }

    /// Replace the first label called `name`, or add it
    pub fn set_label(&mut self, name: &str, value: &str) {
        match self.labels.iter_mut().find(|l| l.name == name) {
            Some(label) => label.value = value.to_string(),
            None => self.labels.push(Label::new(name, value)),
        }
    }
}

/// Run-constant values stamped onto every result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostFacts {
    pub host: String,
    pub tags: Vec<String>,
}

impl HostFacts {
    pub fn new(tags: Vec<String>) -> Self {
        Self {
            host: hostname(),
            tags,
        }
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

// =============================================================================
// Assembly
// =============================================================================

/// Stable id for a fully-qualified test name: hex of the first 16 bytes of
/// its SHA-256
pub fn history_id(full_name: &str) -> String {
    let digest = Sha256::digest(full_name.as_bytes());
    hex::encode(&digest[..16])
}

/// `shop::checkout` -> `shop.checkout`
pub fn package_of(namespace: &str) -> String {
    namespace.replace("::", ".")
}

/// Longest run of `testing` labels shared by every assertion, outermost first
pub fn shared_context_prefix(assertions: &[AssertionEvent]) -> Vec<String> {
    let Some((first, rest)) = assertions.split_first() else {
        return Vec::new();
    };
    let mut prefix: &[String] = &first.context;
    for event in rest {
        let shared = prefix
            .iter()
            .zip(&event.context)
            .take_while(|(a, b)| a == b)
            .count();
        prefix = &prefix[..shared];
    }
    prefix.to_vec()
}

/// Strip ANSI color codes and NUL bytes from failure text
pub fn strip_ansi_codes(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '\x1b' {
            if chars.peek() == Some(&'[') {
                chars.next();
                while let Some(&next) = chars.peek() {
                    chars.next();
                    if next.is_ascii_alphabetic() {
                        break;
                    }
                }
            }
        } else if c != '\0' {
            result.push(c);
        }
    }
    result
}

fn clean_details(details: &StatusDetails) -> StatusDetails {
    StatusDetails {
        message: details.message.as_deref().map(strip_ansi_codes),
        trace: details.trace.as_deref().map(strip_ansi_codes),
    }
}

/// One message-only step per logged assertion, used when no Context ran
fn assertion_steps(state: &TestCaseState) -> Vec<Step> {
    let at = state.stop.unwrap_or(state.start);
    state
        .assertions
        .iter()
        .filter(|event| event.kind != AssertionKind::Error)
        .map(|event| Step {
            name: event.describe(),
            status: event.kind.status(),
            start: at,
            stop: at,
            steps: Vec::new(),
            attachments: Vec::new(),
            parameters: Vec::new(),
            status_details: (event.kind != AssertionKind::Pass)
                .then(|| StatusDetails::message(event.failure_message())),
        })
        .collect()
}

/// Build the result document for a finished test case
pub fn assemble(state: &TestCaseState, context: Option<&Context>, facts: &HostFacts) -> TestResult {
    let info = &state.info;
    let full_name = info.full_name();
    let package = package_of(&info.namespace);
    let prefix = shared_context_prefix(&state.assertions);

    let mut labels = vec![
        Label::new("suite", &info.namespace),
        Label::new("parentSuite", &package),
    ];
    if let Some(first) = prefix.first() {
        labels.push(Label::new("subSuite", first));
    }
    labels.push(Label::new("host", &facts.host));
    labels.push(Label::new("thread", &state.thread));
    labels.push(Label::new("language", "rust"));
    labels.push(Label::new("framework", FRAMEWORK_TAG));
    labels.push(Label::new("tag", FRAMEWORK_TAG));
    for tag in &facts.tags {
        labels.push(Label::new("tag", tag));
    }
    labels.push(Label::new("package", &package));
    labels.push(Label::new("testClass", &info.namespace));
    labels.push(Label::new("testMethod", &info.name));

    let name = if prefix.is_empty() {
        info.name.clone()
    } else {
        format!("{} > {}", prefix.join(" "), info.name)
    };

    let id = history_id(&full_name);
    let mut result = TestResult {
        uuid: state.uuid.clone(),
        history_id: id.clone(),
        test_case_id: id,
        full_name,
        name,
        status: state.status(),
        stage: "finished".to_string(),
        start: state.start,
        stop: state.stop.unwrap_or(state.start),
        labels,
        parameters: Vec::new(),
        links: Vec::new(),
        status_details: state.first_failure.as_ref().map(clean_details),
        attachments: Vec::new(),
        steps: Vec::new(),
        description: None,
    };

    match context {
        Some(ctx) => {
            result.labels.extend(ctx.labels().iter().cloned());
            result.parameters = ctx.parameters().to_vec();
            result.links = ctx.links().to_vec();
            result.attachments = ctx.attachments().to_vec();
            result.steps = ctx.steps();
            result.description = ctx.description_text().map(String::from);
        }
        None => result.steps = assertion_steps(state),
    }
    result
}

/// Longest shared leading dot-segment sequence across distinct values.
///
/// No values, or no shared leading segment across two or more distinct
/// values, yields `None`.
pub fn common_package_prefix<'a>(values: impl IntoIterator<Item = &'a str>) -> Option<String> {
    let mut distinct: Vec<&str> = values.into_iter().collect();
    distinct.sort_unstable();
    distinct.dedup();

    let (first, rest) = distinct.split_first()?;
    if rest.is_empty() {
        return Some(first.to_string());
    }

    let mut prefix: Vec<&str> = first.split('.').collect();
    for value in rest {
        let shared = prefix
            .iter()
            .zip(value.split('.'))
            .take_while(|(a, b)| **a == *b)
            .count();
        prefix.truncate(shared);
    }

    if prefix.is_empty() {
        None
    } else {
        Some(prefix.join("."))
    }
}

// =============================================================================
// Results directory
// =============================================================================

/// A result file already on disk, kept as raw JSON so unknown fields from
/// other writers survive a rewrite
#[derive(Debug, Clone)]
pub struct StoredResult {
    pub path: PathBuf,
    pub doc: serde_json::Value,
}

impl StoredResult {
    pub fn label(&self, name: &str) -> Option<&str> {
        self.doc
            .get("labels")?
            .as_array()?
            .iter()
            .find(|l| l.get("name").and_then(|n| n.as_str()) == Some(name))?
            .get("value")?
            .as_str()
    }

    pub fn set_label(&mut self, name: &str, value: &str) {
        let Some(labels) = self
            .doc
            .get_mut("labels")
            .and_then(serde_json::Value::as_array_mut)
        else {
            return;
        };
        let existing = labels
            .iter_mut()
            .find(|l| l.get("name").and_then(|n| n.as_str()) == Some(name));
        match existing {
            Some(label) => label["value"] = serde_json::Value::from(value),
            None => labels.push(serde_json::json!({ "name": name, "value": value })),
        }
    }

    pub fn status(&self) -> Option<Status> {
        serde_json::from_value(self.doc.get("status")?.clone()).ok()
    }

    pub fn save(&self) -> Result<()> {
        fs::write(&self.path, serde_json::to_vec_pretty(&self.doc)?)?;
        Ok(())
    }
}

/// `categories.json` entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Category {
    pub name: String,
    pub matched_statuses: Vec<Status>,
    pub message_regex: String,
}

pub fn default_categories() -> Vec<Category> {
    vec![
        Category {
            name: "Product defects".to_string(),
            matched_statuses: vec![Status::Failed],
            message_regex: ".*".to_string(),
        },
        Category {
            name: "Test defects".to_string(),
            matched_statuses: vec![Status::Broken],
            message_regex: ".*".to_string(),
        },
    ]
}

/// Reads and writes result documents in one results directory
#[derive(Debug, Clone)]
pub struct ResultWriter {
    dir: PathBuf,
}

impl ResultWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn write(&self, result: &TestResult) -> Result<PathBuf> {
        let path = self.dir.join(format!("{}{}", result.uuid, RESULT_SUFFIX));
        fs::write(&path, serde_json::to_vec_pretty(result)?)?;
        debug!(path = %path.display(), status = result.status.as_str(), "result written");
        Ok(path)
    }

    /// Result files currently in the directory. Unreadable files are
    /// skipped with a warning.
    pub fn existing(&self) -> Vec<StoredResult> {
        if !self.dir.is_dir() {
            return Vec::new();
        }

        let mut stored = Vec::new();
        for entry in WalkDir::new(&self.dir)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let is_result = entry.file_type().is_file()
                && entry.file_name().to_string_lossy().ends_with(RESULT_SUFFIX);
            if !is_result {
                continue;
            }

            let path = entry.into_path();
            let parsed: Result<serde_json::Value> = fs::read(&path)
                .map_err(TraceError::from)
                .and_then(|bytes| Ok(serde_json::from_slice(&bytes)?));
            match parsed {
                Ok(doc) => stored.push(StoredResult { path, doc }),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable result"),
            }
        }
        stored
    }

    pub fn write_categories(&self) -> Result<PathBuf> {
        let path = self.dir.join(CATEGORIES_FILE);
        fs::write(&path, serde_json::to_vec_pretty(&default_categories())?)?;
        Ok(path)
    }
}
