//! tach-trace: test-execution tracing and Allure result assembly
//!
//! A host test runner fires lifecycle events through a [`hooks::HookChain`];
//! the installed [`hooks::TraceListener`] records a per-test step tree
//! ([`context::Context`]), captures console output into it, and hands each
//! finished test to a [`session::ReportSession`], which writes one
//! `<uuid>-result.json` per test when the host reports the run summary.
//!
//! Test code records through the thread-local helpers in [`scope`]:
//!
//! ```no_run
//! use std::io::Write;
//! use tach_trace::scope;
//!
//! scope::step("Submit form", || {
//!     writeln!(scope::stdout(), "validating input")?;
//!     scope::parameter("user", "alice");
//!     Ok(())
//! })?;
//! # Ok::<(), anyhow::Error>(())
//! ```
//!
//! ## Output capture
//!
//! Only output written through [`scope::stdout`] / [`scope::stderr`] (or
//! [`context::Context::stdout`] / [`context::Context::stderr`]) is captured.
//! The process-wide file descriptors are never redirected, so `println!`
//! and `eprintln!` inside a step go straight to the console and produce no
//! marker steps or `stdout` / `stderr` attachments. Tests running on other
//! threads keep their own captures.

pub mod attachment;
pub mod capture;
pub mod config;
pub mod context;
pub mod environment;
pub mod error;
pub mod harness;
pub mod hooks;
pub mod logging;
pub mod model;
pub mod reporter;
pub mod results;
pub mod scope;
pub mod session;
pub mod teardown;

pub use context::{Context, StepId};
pub use error::{AssertionFailed, Result, TraceError};
pub use hooks::{activate, HookChain, TraceListener};
pub use session::ReportSession;
