//! Span Tree Integration Tests
//!
//! Tests for:
//! - Open-step stack balance across success, error and panic
//! - Status mapping and error passthrough
//! - Parameter / attachment routing to the innermost open step
//! - Captured output turning into marker sub-steps

use std::io::Write;
use std::panic::{self, AssertUnwindSafe};
use tach_trace::attachment::AttachmentStore;
use tach_trace::capture::Stream;
use tach_trace::model::{Parameter, Status};
use tach_trace::{scope, AssertionFailed, Context};
use tempfile::TempDir;

#[derive(Debug, thiserror::Error, PartialEq)]
#[error("gateway returned {0}")]
struct GatewayError(u16);

fn new_context(temp: &TempDir) -> Context {
    Context::new(AttachmentStore::new(temp.path()), false)
}

/// Test: depth returns to zero however the nested bodies end
#[test]
fn test_stack_balanced_after_mixed_outcomes() {
    let temp = TempDir::new().unwrap();
    let mut ctx = new_context(&temp);

    let _ = ctx.step("outer", |ctx| {
        ctx.step("ok", |_| Ok(()))?;
        let _ = ctx.step("fails", |_| -> anyhow::Result<()> {
            Err(AssertionFailed::new("1 != 2").into())
        });
        ctx.step("errors", |ctx| {
            ctx.step("deep", |_| -> anyhow::Result<()> { anyhow::bail!("boom") })
        })
    });
    assert_eq!(ctx.depth(), 0);

    let caught = panic::catch_unwind(AssertUnwindSafe(|| {
        let _ = ctx.step("panics", |ctx| {
            ctx.step("inner panic", |_| -> anyhow::Result<()> { panic!("disk full") })
        });
    }));
    assert!(caught.is_err());
    assert_eq!(ctx.depth(), 0);

    let steps = ctx.steps();
    assert_eq!(steps.len(), 2);
    let outer = &steps[0];
    assert_eq!(outer.status, Status::Broken);
    assert_eq!(outer.steps[0].status, Status::Passed);
    assert_eq!(outer.steps[1].status, Status::Failed);
    assert_eq!(outer.steps[2].steps[0].status, Status::Broken);
    assert_eq!(steps[1].status, Status::Broken);
    assert_eq!(
        steps[1].steps[0].status_details.as_ref().unwrap().message.as_deref(),
        Some("disk full")
    );
}

/// Test: the body's own error comes back unchanged
#[test]
fn test_error_passthrough() {
    let temp = TempDir::new().unwrap();
    let mut ctx = new_context(&temp);

    let err = ctx
        .step("pay", |_| -> anyhow::Result<()> { Err(GatewayError(502).into()) })
        .unwrap_err();
    assert_eq!(err.downcast_ref::<GatewayError>(), Some(&GatewayError(502)));

    let steps = ctx.steps();
    assert_eq!(steps[0].status, Status::Broken);
    assert_eq!(
        steps[0].status_details.as_ref().unwrap().message.as_deref(),
        Some("gateway returned 502")
    );
}

/// Test: assertion errors keep `failed` even when wrapped in context
#[test]
fn test_wrapped_assertion_is_failed() {
    let temp = TempDir::new().unwrap();
    let mut ctx = new_context(&temp);

    let _ = ctx.step("totals", |_| -> anyhow::Result<()> {
        let inner: anyhow::Error = AssertionFailed::new("10 != 12").into();
        Err(inner.context("cart totals"))
    });
    assert_eq!(ctx.steps()[0].status, Status::Failed);
}

/// Test: a value returned by the body is returned by step
#[test]
fn test_step_returns_value() {
    let temp = TempDir::new().unwrap();
    let mut ctx = new_context(&temp);
    let total = ctx.step("sum", |_| Ok(2 + 3)).unwrap();
    assert_eq!(total, 5);
    assert_eq!(ctx.steps()[0].status, Status::Passed);
}

/// Test: parameters land on the innermost open step or the test
#[test]
fn test_parameter_routing() {
    let temp = TempDir::new().unwrap();
    let mut ctx = new_context(&temp);

    ctx.add_parameter("env", "staging");
    ctx.step("A", |ctx| {
        ctx.step("B", |ctx| {
            ctx.add_parameter("p", 1);
            Ok(())
        })
    })
    .unwrap();

    let steps = ctx.steps();
    assert!(steps[0].parameters.is_empty());
    assert_eq!(steps[0].steps[0].parameters, vec![Parameter::new("p", 1)]);
    assert_eq!(ctx.parameters(), &[Parameter::new("env", "staging")]);
}

/// Test: output lines become markers on the innermost step only
#[test]
fn test_output_markers() {
    let temp = TempDir::new().unwrap();
    let mut ctx = new_context(&temp);

    ctx.step("S", |ctx| {
        write!(ctx.stdout(), "line1\n\nline2\n")?;
        ctx.step("child", |ctx| {
            write!(ctx.stderr(), "child only")?;
            Ok(())
        })
    })
    .unwrap();

    let s = &ctx.steps()[0];
    let names: Vec<_> = s.steps.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["child", "▸ line1", "▸ line2"]);
    assert_eq!(s.steps[0].steps[0].name, "◂ child only");
    assert!(s.steps[1..].iter().all(|m| m.status == Status::Passed));
}

/// Test: the Login / Submit form walkthrough through the thread-local API
#[test]
fn test_login_submit_form_scenario() {
    let temp = TempDir::new().unwrap();
    let guard = scope::install(new_context(&temp));

    scope::marker("Login");
    let res = scope::step("Submit form", || -> anyhow::Result<()> {
        writeln!(scope::stdout(), "validating input")?;
        anyhow::bail!("network unreachable")
    });
    assert_eq!(res.unwrap_err().to_string(), "network unreachable");

    let scope = guard.finish().unwrap();
    assert_eq!(scope.context.depth(), 0);

    let steps = scope.context.steps();
    assert_eq!(steps.len(), 2);
    assert_eq!(steps[0].name, "Login");
    assert_eq!(steps[0].status, Status::Passed);
    assert_eq!(steps[0].start, steps[0].stop);

    let submit = &steps[1];
    assert_eq!(submit.name, "Submit form");
    assert_eq!(submit.status, Status::Broken);
    assert_eq!(
        submit.status_details.as_ref().unwrap().message.as_deref(),
        Some("network unreachable")
    );
    assert_eq!(submit.steps.len(), 1);
    assert_eq!(submit.steps[0].name, "▸ validating input");
}

/// Test: only the scoped writers feed captured output
#[test]
fn test_println_is_not_captured() {
    let temp = TempDir::new().unwrap();
    let guard = scope::install(new_context(&temp));

    scope::step("print", || {
        println!("straight to the console");
        writeln!(scope::stdout(), "captured")?;
        Ok(())
    })
    .unwrap();

    let scope = guard.finish().unwrap();
    let steps = scope.context.steps();
    let names: Vec<_> = steps[0].steps.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["▸ captured"]);
    assert_eq!(scope.context.capture().test_output(Stream::Stdout), "captured\n");
}

/// Test: scope helpers write through to the console with no active test
#[test]
fn test_scope_writer_without_active_test() {
    assert!(!scope::is_active());
    writeln!(scope::stderr(), "no test running").unwrap();
    scope::marker("ignored");
    assert!(scope::attach_text("ignored", "x").is_none());
}
