//! Report data model shared by the span tree, hook chain and assembler
//!
//! Field names serialize in the Allure 2 result format (camelCase).

use serde::{Deserialize, Serialize};

/// Status of a step or a whole test
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Passed,
    Failed,
    Broken,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Passed => "passed",
            Status::Failed => "failed",
            Status::Broken => "broken",
        }
    }

    pub fn icon(&self) -> &'static str {
        match self {
            Status::Passed => "✓",
            Status::Failed => "✗",
            Status::Broken => "!",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
}

impl StatusDetails {
    /// Message-only details, the shape used by steps
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            trace: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
    pub value: String,
}

impl Label {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkType {
    Custom,
    Issue,
    Tms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub name: String,
    pub url: String,
    #[serde(rename = "type")]
    pub link_type: LinkType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub value: String,
}

impl Parameter {
    pub fn new(name: impl Into<String>, value: impl ToString) -> Self {
        Self {
            name: name.into(),
            value: value.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    /// File name inside the results directory
    pub source: String,
    #[serde(rename = "type")]
    pub mime: String,
}

/// A materialized step, as written into result documents
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub name: String,
    pub status: Status,
    pub start: i64,
    pub stop: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<Step>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<Parameter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_details: Option<StatusDetails>,
}

/// Identity of a test case as the host framework reports it
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TestInfo {
    pub namespace: String,
    pub name: String,
}

impl TestInfo {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Fully-qualified name: `namespace::name`
    pub fn full_name(&self) -> String {
        format!("{}::{}", self.namespace, self.name)
    }
}

/// Kind of an assertion report, ordered by severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssertionKind {
    Pass,
    Fail,
    Error,
}

impl AssertionKind {
    pub fn status(&self) -> Status {
        match self {
            AssertionKind::Pass => Status::Passed,
            AssertionKind::Fail => Status::Failed,
            AssertionKind::Error => Status::Broken,
        }
    }
}

/// One assertion report from the host framework
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssertionEvent {
    #[serde(rename = "type")]
    pub kind: AssertionKind,
    /// Enclosing `testing` labels, outermost first
    pub context: Vec<String>,
    pub message: Option<String>,
    pub expected: Option<String>,
    pub actual: Option<String>,
    /// Formatted error, present when an error object was available
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
}

impl AssertionEvent {
    pub fn new(kind: AssertionKind, context: Vec<String>) -> Self {
        Self {
            kind,
            context,
            message: None,
            expected: None,
            actual: None,
            trace: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_values(mut self, expected: impl Into<String>, actual: impl Into<String>) -> Self {
        self.expected = Some(expected.into());
        self.actual = Some(actual.into());
        self
    }

    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = Some(trace.into());
        self
    }

    /// Step name for this assertion
    pub fn describe(&self) -> String {
        match (&self.message, &self.expected, &self.actual) {
            (Some(msg), _, _) => msg.clone(),
            (None, Some(expected), Some(actual)) => {
                format!("expected: {}, actual: {}", expected, actual)
            }
            (None, Some(expected), None) => expected.clone(),
            _ => match self.kind {
                AssertionKind::Pass => "assertion passed".to_string(),
                AssertionKind::Fail => "assertion failed".to_string(),
                AssertionKind::Error => "uncaught error".to_string(),
            },
        }
    }

    /// Failure message: the explicit message, else the expected/actual pair
    pub fn failure_message(&self) -> String {
        match (&self.message, &self.expected, &self.actual) {
            (Some(msg), Some(expected), Some(actual)) if self.kind == AssertionKind::Fail => {
                format!("{}\nexpected: {}\n  actual: {}", msg, expected, actual)
            }
            _ => self.describe(),
        }
    }
}

/// Counts reported by the host at the end of a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub tests: usize,
    pub assertions: usize,
    pub pass: usize,
    pub fail: usize,
    pub error: usize,
    pub duration_ms: u64,
}

/// Milliseconds since the Unix epoch
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Status::Broken).unwrap(), "\"broken\"");
        assert_eq!(Status::Failed.as_str(), "failed");
    }

    #[test]
    fn test_status_severity_order() {
        assert!(Status::Passed < Status::Failed);
        assert!(Status::Failed < Status::Broken);
        assert!(AssertionKind::Pass < AssertionKind::Fail);
        assert!(AssertionKind::Fail < AssertionKind::Error);
    }

    #[test]
    fn test_step_skips_empty_collections() {
        let step = Step {
            name: "Login".to_string(),
            status: Status::Passed,
            start: 10,
            stop: 10,
            steps: vec![],
            attachments: vec![],
            parameters: vec![],
            status_details: None,
        };
        let json = serde_json::to_string(&step).unwrap();
        assert!(!json.contains("steps"));
        assert!(!json.contains("statusDetails"));
        assert!(json.contains("\"status\":\"passed\""));
    }

    #[test]
    fn test_link_type_field_name() {
        let link = Link {
            name: "JIRA-1".to_string(),
            url: "https://issues.example/JIRA-1".to_string(),
            link_type: LinkType::Issue,
        };
        let json = serde_json::to_string(&link).unwrap();
        assert!(json.contains("\"type\":\"issue\""));
    }

    #[test]
    fn test_full_name() {
        let info = TestInfo::new("shop::checkout", "pays_with_card");
        assert_eq!(info.full_name(), "shop::checkout::pays_with_card");
    }

    #[test]
    fn test_assertion_describe() {
        let ev = AssertionEvent::new(AssertionKind::Fail, vec![]).with_values("1", "2");
        assert_eq!(ev.describe(), "expected: 1, actual: 2");

        let ev = AssertionEvent::new(AssertionKind::Pass, vec![]).with_message("totals match");
        assert_eq!(ev.describe(), "totals match");

        let ev = AssertionEvent::new(AssertionKind::Error, vec![]);
        assert_eq!(ev.describe(), "uncaught error");
    }

    #[test]
    fn test_failure_message_includes_values() {
        let ev = AssertionEvent::new(AssertionKind::Fail, vec![])
            .with_message("cart total")
            .with_values("10", "12");
        assert_eq!(ev.failure_message(), "cart total\nexpected: 10\n  actual: 12");
    }
}
