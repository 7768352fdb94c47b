//! Per-test span tree
//!
//! Steps live in an append-only arena and are addressed by `StepId`
//! handles. Every node keeps an ordered child list and a parent
//! back-reference; nothing is ever removed or reordered, so a handle
//! handed out once resolves for the life of the Context.
//!
//! New steps, parameters and attachments always land at the innermost
//! open step (or at the top level when nothing is open).

use crate::attachment::{pretty_json, AttachmentStore};
use crate::capture::{CaptureWriter, OutputCapture, Stream};
use crate::error::{is_assertion_failure, is_assertion_panic, panic_message};
use crate::model::{
    now_ms, Attachment, Label, Link, LinkType, Parameter, Status, StatusDetails, Step,
};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use tracing::{debug, warn};

/// Opaque handle to a step in a Context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StepId(usize);

#[derive(Debug)]
struct StepNode {
    name: String,
    status: Status,
    start: i64,
    stop: i64,
    parent: Option<StepId>,
    children: Vec<StepId>,
    attachments: Vec<Attachment>,
    parameters: Vec<Parameter>,
    status_details: Option<StatusDetails>,
}

impl StepNode {
    fn leaf(name: String, parent: Option<StepId>, status: Status) -> Self {
        let now = now_ms();
        Self {
            name,
            status,
            start: now,
            stop: now,
            parent,
            children: Vec::new(),
            attachments: Vec::new(),
            parameters: Vec::new(),
            status_details: None,
        }
    }
}

/// Mutable record of one test case: step tree plus test-level metadata
#[derive(Debug)]
pub struct Context {
    nodes: Vec<StepNode>,
    roots: Vec<StepId>,
    /// Open lambda steps, innermost last
    open: Vec<StepId>,
    labels: Vec<Label>,
    links: Vec<Link>,
    parameters: Vec<Parameter>,
    attachments: Vec<Attachment>,
    description: Option<String>,
    capture: OutputCapture,
    store: AttachmentStore,
}

impl Context {
    pub fn new(store: AttachmentStore, echo_output: bool) -> Self {
        Self {
            nodes: Vec::new(),
            roots: Vec::new(),
            open: Vec::new(),
            labels: Vec::new(),
            links: Vec::new(),
            parameters: Vec::new(),
            attachments: Vec::new(),
            description: None,
            capture: OutputCapture::new(echo_output),
            store,
        }
    }

    // =========================================================================
    // Steps
    // =========================================================================

    fn node(&self, id: StepId) -> &StepNode {
        &self.nodes[id.0]
    }

    fn node_mut(&mut self, id: StepId) -> &mut StepNode {
        &mut self.nodes[id.0]
    }

    fn append(&mut self, node: StepNode) -> StepId {
        let id = StepId(self.nodes.len());
        match node.parent {
            Some(parent) => self.nodes[parent.0].children.push(id),
            None => self.roots.push(id),
        }
        self.nodes.push(node);
        id
    }

    /// Current open-step depth
    pub fn depth(&self) -> usize {
        self.open.len()
    }

    /// Append a zero-duration `passed` checkpoint at the current location
    pub fn marker(&mut self, name: &str) -> StepId {
        self.record_step(name, Status::Passed, None)
    }

    /// Append a zero-duration leaf with an explicit status
    pub fn record_step(
        &mut self,
        name: &str,
        status: Status,
        details: Option<StatusDetails>,
    ) -> StepId {
        let mut node = StepNode::leaf(name.to_string(), self.open.last().copied(), status);
        node.status_details = details;
        self.append(node)
    }

    /// Open a step at the current location and make it the innermost one
    pub fn open_step(&mut self, name: &str) -> StepId {
        let node = StepNode::leaf(name.to_string(), self.open.last().copied(), Status::Passed);
        let id = self.append(node);
        self.open.push(id);
        self.capture.begin_step();
        id
    }

    /// Finish an open step: set its outcome, pop it, and turn the output
    /// captured while it was innermost into marker children.
    ///
    /// Steps still open above `id` are closed along with it.
    pub fn close_step(&mut self, id: StepId, status: Status, details: Option<StatusDetails>) {
        let Some(pos) = self.open.iter().rposition(|&open| open == id) else {
            debug!(step = %self.node(id).name, "closing a step that is not open");
            let node = self.node_mut(id);
            node.status = status;
            node.status_details = details;
            node.stop = node.stop.max(now_ms());
            return;
        };

        while self.open.len() > pos + 1 {
            if let Some(orphan) = self.open.pop() {
                warn!(step = %self.node(orphan).name, "step left open by its body");
                self.finish_node(
                    orphan,
                    Status::Broken,
                    Some(StatusDetails::message("step was not closed")),
                );
            }
        }
        self.open.pop();
        self.finish_node(id, status, details);
    }

    fn finish_node(&mut self, id: StepId, status: Status, details: Option<StatusDetails>) {
        let lines = self.capture.end_step();
        let node = self.node_mut(id);
        node.status = status;
        node.status_details = details;
        node.stop = node.stop.max(now_ms());

        for name in lines.iter().filter_map(|line| line.marker_name()) {
            self.append(StepNode::leaf(name, Some(id), Status::Passed));
        }
    }

    /// Run `body` as a lambda step.
    ///
    /// `Ok` closes the step `passed`; an error carrying `AssertionFailed`
    /// closes it `failed`, any other error `broken`. Panics are classified
    /// by message and resumed after the step is closed. The body's error is
    /// returned untouched.
    pub fn step<T>(
        &mut self,
        name: &str,
        body: impl FnOnce(&mut Context) -> anyhow::Result<T>,
    ) -> anyhow::Result<T> {
        let id = self.open_step(name);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| body(&mut *self)));
        match outcome {
            Ok(Ok(value)) => {
                self.close_step(id, Status::Passed, None);
                Ok(value)
            }
            Ok(Err(err)) => {
                let (status, details) = error_outcome(&err);
                self.close_step(id, status, Some(details));
                Err(err)
            }
            Err(payload) => {
                let (status, details) = panic_outcome(payload.as_ref());
                self.close_step(id, status, Some(details));
                panic::resume_unwind(payload)
            }
        }
    }

    /// Materialize the arena into nested steps, top level first
    pub fn steps(&self) -> Vec<Step> {
        self.roots.iter().map(|&id| self.materialize(id)).collect()
    }

    fn materialize(&self, id: StepId) -> Step {
        let node = self.node(id);
        Step {
            name: node.name.clone(),
            status: node.status,
            start: node.start,
            stop: node.stop,
            steps: node.children.iter().map(|&c| self.materialize(c)).collect(),
            attachments: node.attachments.clone(),
            parameters: node.parameters.clone(),
            status_details: node.status_details.clone(),
        }
    }

    /// Parent of a step, `None` for top-level steps
    pub fn parent(&self, id: StepId) -> Option<StepId> {
        self.node(id).parent
    }

    // =========================================================================
    // Parameters & attachments
    // =========================================================================

    pub fn add_parameter(&mut self, name: &str, value: impl ToString) {
        let param = Parameter::new(name, value);
        match self.open.last().copied() {
            Some(id) => self.node_mut(id).parameters.push(param),
            None => self.parameters.push(param),
        }
    }

    pub fn add_attachment(&mut self, attachment: Attachment) {
        match self.open.last().copied() {
            Some(id) => self.node_mut(id).attachments.push(attachment),
            None => self.attachments.push(attachment),
        }
    }

    /// Write `bytes` as an attachment at the current location.
    /// Write failures are logged and never reach the test.
    pub fn attach_bytes(&mut self, name: &str, mime: &str, bytes: &[u8]) -> Option<Attachment> {
        match self.store.write_bytes(name, mime, bytes) {
            Ok(att) => {
                self.add_attachment(att.clone());
                Some(att)
            }
            Err(e) => {
                warn!(attachment = name, error = %e, "failed to write attachment");
                None
            }
        }
    }

    pub fn attach_text(&mut self, name: &str, text: &str) -> Option<Attachment> {
        self.attach_bytes(name, "text/plain", text.as_bytes())
    }

    /// Attach a JSON body, re-indented for display
    pub fn attach_json(&mut self, name: &str, body: &str) -> Option<Attachment> {
        self.attach_bytes(name, "application/json", pretty_json(body).as_bytes())
    }

    /// Copy an existing file into the results directory and attach it
    pub fn attach_file(&mut self, name: &str, mime: &str, path: &Path) -> Option<Attachment> {
        match self.store.copy_file(name, mime, path) {
            Ok(att) => {
                self.add_attachment(att.clone());
                Some(att)
            }
            Err(e) => {
                warn!(attachment = name, error = %e, "failed to attach file");
                None
            }
        }
    }

    // =========================================================================
    // Test-level metadata
    // =========================================================================

    pub fn label(&mut self, name: &str, value: &str) {
        self.labels.push(Label::new(name, value));
    }

    pub fn epic(&mut self, value: &str) {
        self.label("epic", value);
    }

    pub fn feature(&mut self, value: &str) {
        self.label("feature", value);
    }

    pub fn story(&mut self, value: &str) {
        self.label("story", value);
    }

    pub fn severity(&mut self, value: &str) {
        self.label("severity", value);
    }

    pub fn owner(&mut self, value: &str) {
        self.label("owner", value);
    }

    pub fn tag(&mut self, value: &str) {
        self.label("tag", value);
    }

    pub fn link(&mut self, name: &str, url: &str, link_type: LinkType) {
        self.links.push(Link {
            name: name.to_string(),
            url: url.to_string(),
            link_type,
        });
    }

    pub fn issue(&mut self, name: &str, url: &str) {
        self.link(name, url, LinkType::Issue);
    }

    pub fn tms(&mut self, name: &str, url: &str) {
        self.link(name, url, LinkType::Tms);
    }

    pub fn description(&mut self, text: &str) {
        self.description = Some(text.to_string());
    }

    pub fn labels(&self) -> &[Label] {
        &self.labels
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    pub fn attachments(&self) -> &[Attachment] {
        &self.attachments
    }

    pub fn description_text(&self) -> Option<&str> {
        self.description.as_deref()
    }

    // =========================================================================
    // Output
    // =========================================================================

    pub fn stdout(&mut self) -> CaptureWriter<'_> {
        self.capture.writer(Stream::Stdout)
    }

    pub fn stderr(&mut self) -> CaptureWriter<'_> {
        self.capture.writer(Stream::Stderr)
    }

    pub fn capture(&self) -> &OutputCapture {
        &self.capture
    }

    pub fn capture_mut(&mut self) -> &mut OutputCapture {
        &mut self.capture
    }

    pub fn store(&self) -> &AttachmentStore {
        &self.store
    }
}

/// Status and details for a step body that returned an error
pub fn error_outcome(err: &anyhow::Error) -> (Status, StatusDetails) {
    let status = if is_assertion_failure(err) {
        Status::Failed
    } else {
        Status::Broken
    };
    (status, StatusDetails::message(err.to_string()))
}

/// Status and details for a step body that panicked
pub fn panic_outcome(payload: &(dyn std::any::Any + Send)) -> (Status, StatusDetails) {
    let message = panic_message(payload);
    let status = if is_assertion_panic(&message) {
        Status::Failed
    } else {
        Status::Broken
    };
    (status, StatusDetails::message(message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AssertionFailed;
    use std::io::Write;
    use tempfile::TempDir;

    fn ctx(temp: &TempDir) -> Context {
        Context::new(AttachmentStore::new(temp.path()), false)
    }

    #[test]
    fn test_marker_does_not_push() {
        let temp = TempDir::new().unwrap();
        let mut ctx = ctx(&temp);
        ctx.marker("Login");
        assert_eq!(ctx.depth(), 0);

        let steps = ctx.steps();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].status, Status::Passed);
        assert_eq!(steps[0].start, steps[0].stop);
    }

    #[test]
    fn test_nested_steps_and_markers() {
        let temp = TempDir::new().unwrap();
        let mut ctx = ctx(&temp);
        ctx.step("outer", |ctx| {
            ctx.marker("checkpoint");
            ctx.step("inner", |ctx| {
                ctx.marker("deep");
                Ok(())
            })
        })
        .unwrap();

        let steps = ctx.steps();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].name, "outer");
        assert_eq!(steps[0].steps[0].name, "checkpoint");
        assert_eq!(steps[0].steps[1].name, "inner");
        assert_eq!(steps[0].steps[1].steps[0].name, "deep");
        assert_eq!(ctx.depth(), 0);
    }

    #[test]
    fn test_error_status_mapping() {
        let temp = TempDir::new().unwrap();
        let mut ctx = ctx(&temp);

        let res: anyhow::Result<()> =
            ctx.step("assertion", |_| Err(AssertionFailed::new("1 != 2").into()));
        assert!(res.is_err());
        let res: anyhow::Result<()> = ctx.step("generic", |_| anyhow::bail!("boom"));
        assert_eq!(res.unwrap_err().to_string(), "boom");

        let steps = ctx.steps();
        assert_eq!(steps[0].status, Status::Failed);
        assert_eq!(
            steps[0].status_details.as_ref().unwrap().message.as_deref(),
            Some("1 != 2")
        );
        assert_eq!(steps[1].status, Status::Broken);
        assert!(steps[1].stop >= steps[1].start);
        assert!(steps[1].status_details.as_ref().unwrap().trace.is_none());
    }

    #[test]
    fn test_panic_closes_step_and_resumes() {
        let temp = TempDir::new().unwrap();
        let mut ctx = ctx(&temp);

        let caught = panic::catch_unwind(AssertUnwindSafe(|| {
            let _ = ctx.step("panics", |_| -> anyhow::Result<()> {
                assert_eq!(1, 2, "numbers differ");
                Ok(())
            });
        }));
        assert!(caught.is_err());
        assert_eq!(ctx.depth(), 0);

        let steps = ctx.steps();
        assert_eq!(steps[0].status, Status::Failed);

        let caught = panic::catch_unwind(AssertUnwindSafe(|| {
            let _ = ctx.step("index", |_| -> anyhow::Result<()> {
                let v: Vec<u8> = Vec::new();
                let _value = v[3];
                Ok(())
            });
        }));
        assert!(caught.is_err());
        assert_eq!(ctx.steps()[1].status, Status::Broken);
    }

    #[test]
    fn test_parameter_routing() {
        let temp = TempDir::new().unwrap();
        let mut ctx = ctx(&temp);
        ctx.add_parameter("browser", "chromium");
        ctx.step("outer", |ctx| {
            ctx.step("inner", |ctx| {
                ctx.add_parameter("user", "alice");
                Ok(())
            })?;
            ctx.add_parameter("attempt", 2);
            Ok(())
        })
        .unwrap();

        assert_eq!(ctx.parameters(), &[Parameter::new("browser", "chromium")]);
        let steps = ctx.steps();
        assert_eq!(steps[0].parameters, vec![Parameter::new("attempt", "2")]);
        assert_eq!(
            steps[0].steps[0].parameters,
            vec![Parameter::new("user", "alice")]
        );
    }

    #[test]
    fn test_attachment_routing() {
        let temp = TempDir::new().unwrap();
        let mut ctx = ctx(&temp);
        ctx.attach_text("top", "a");
        ctx.step("outer", |ctx| {
            ctx.attach_json("body", r#"{"ok":true}"#);
            Ok(())
        })
        .unwrap();

        assert_eq!(ctx.attachments().len(), 1);
        assert_eq!(ctx.attachments()[0].name, "top");
        let steps = ctx.steps();
        assert_eq!(steps[0].attachments.len(), 1);
        assert_eq!(steps[0].attachments[0].mime, "application/json");
    }

    #[test]
    fn test_captured_output_becomes_markers() {
        let temp = TempDir::new().unwrap();
        let mut ctx = ctx(&temp);
        ctx.step("prints", |ctx| {
            write!(ctx.stdout(), "line1\n\nline2\n")?;
            writeln!(ctx.stderr(), "oops")?;
            Ok(())
        })
        .unwrap();

        let names: Vec<_> = ctx.steps()[0]
            .steps
            .iter()
            .map(|s| s.name.clone())
            .collect();
        assert_eq!(names, vec!["▸ line1", "▸ line2", "◂ oops"]);
    }

    #[test]
    fn test_close_out_of_order_pops_through() {
        let temp = TempDir::new().unwrap();
        let mut ctx = ctx(&temp);
        let outer = ctx.open_step("outer");
        let inner = ctx.open_step("inner");
        ctx.close_step(outer, Status::Passed, None);
        assert_eq!(ctx.depth(), 0);
        assert_eq!(ctx.parent(inner), Some(outer));

        let steps = ctx.steps();
        assert_eq!(steps[0].steps[0].status, Status::Broken);
        assert_eq!(ctx.capture().depth(), 0);
    }

    #[test]
    fn test_metadata_helpers() {
        let temp = TempDir::new().unwrap();
        let mut ctx = ctx(&temp);
        ctx.epic("Checkout");
        ctx.severity("critical");
        ctx.issue("SHOP-12", "https://issues.example/SHOP-12");
        ctx.description("Pays with a stored card");

        assert_eq!(ctx.labels()[0], Label::new("epic", "Checkout"));
        assert_eq!(ctx.labels()[1], Label::new("severity", "critical"));
        assert_eq!(ctx.links()[0].link_type, LinkType::Issue);
        assert_eq!(ctx.description_text(), Some("Pays with a stored card"));
    }
}
