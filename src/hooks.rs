//! Hook chain in front of the host's lifecycle callbacks
//!
//! ## Architecture
//!
//! - `HookChain` owns the host's original handler, captured once, plus an
//!   ordered list of keyed `Observer`s
//! - Each event reaches the original handler first, then every enabled
//!   observer in registration order
//! - `TraceListener` is the observer that drives per-test state; the
//!   tracing fixture it injects defers result handoff until every inner
//!   fixture has unwound

use crate::config::TraceConfig;
use crate::harness::{Fixture, Namespace};
use crate::model::{AssertionEvent, RunSummary, Status, TestInfo};
use crate::reporter::LifecycleListener;
use crate::scope;
use crate::session::{ReportSession, StatusCounts};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Key under which the tracing observer is installed
pub const TRACE_OBSERVER: &str = "tach-trace";

/// A listener that can sit in a `HookChain`
pub trait Observer: LifecycleListener {
    /// Identity used to make `install` idempotent
    fn key(&self) -> &str;

    /// Checked before every dispatch
    fn enabled(&self) -> bool;
}

pub struct HookChain {
    original: Box<dyn LifecycleListener>,
    observers: Vec<Box<dyn Observer>>,
}

impl HookChain {
    pub fn new(original: Box<dyn LifecycleListener>) -> Self {
        Self {
            original,
            observers: Vec::new(),
        }
    }

    /// Register `observer` unless one with the same key is present.
    /// Returns whether it was added.
    pub fn install(&mut self, observer: Box<dyn Observer>) -> bool {
        if self.is_installed(observer.key()) {
            debug!(key = observer.key(), "observer already installed");
            return false;
        }
        debug!(key = observer.key(), "observer installed");
        self.observers.push(observer);
        true
    }

    pub fn is_installed(&self, key: &str) -> bool {
        self.observers.iter().any(|o| o.key() == key)
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    fn each_enabled(&mut self, mut f: impl FnMut(&mut dyn Observer)) {
        for observer in self.observers.iter_mut() {
            if observer.enabled() {
                f(observer.as_mut());
            }
        }
    }
}

impl LifecycleListener for HookChain {
    fn begin_namespace(&mut self, ns: &mut Namespace) {
        self.original.begin_namespace(ns);
        self.each_enabled(|o| o.begin_namespace(ns));
    }

    fn end_namespace(&mut self, ns: &mut Namespace) {
        self.original.end_namespace(ns);
        self.each_enabled(|o| o.end_namespace(ns));
    }

    fn begin_test(&mut self, test: &TestInfo) {
        self.original.begin_test(test);
        self.each_enabled(|o| o.begin_test(test));
    }

    fn end_test(&mut self, test: &TestInfo) {
        self.original.end_test(test);
        self.each_enabled(|o| o.end_test(test));
    }

    fn assertion(&mut self, test: &TestInfo, event: &AssertionEvent) {
        self.original.assertion(test, event);
        self.each_enabled(|o| o.assertion(test, event));
    }

    fn summary(&mut self, summary: &RunSummary) {
        self.original.summary(summary);
        self.each_enabled(|o| o.summary(summary));
    }

    fn results(&mut self, dir: &Path, counts: &StatusCounts) {
        self.original.results(dir, counts);
        self.each_enabled(|o| o.results(dir, counts));
    }
}

// =============================================================================
// TraceListener
// =============================================================================

/// Observer feeding a `ReportSession`
pub struct TraceListener {
    session: Arc<ReportSession>,
    /// Fixture lists as they were before injection, by namespace
    saved: HashMap<String, Vec<Fixture>>,
}

impl TraceListener {
    pub fn new(session: Arc<ReportSession>) -> Self {
        Self {
            session,
            saved: HashMap::new(),
        }
    }

    pub fn session(&self) -> &Arc<ReportSession> {
        &self.session
    }
}

impl LifecycleListener for TraceListener {
    fn begin_namespace(&mut self, ns: &mut Namespace) {
        if self.saved.contains_key(&ns.name) {
            debug!(ns = %ns.name, "tracing fixture already injected");
            return;
        }
        self.saved.insert(ns.name.clone(), ns.each_fixtures.clone());
        ns.each_fixtures
            .insert(0, tracing_fixture(Arc::clone(&self.session)));
    }

    fn end_namespace(&mut self, ns: &mut Namespace) {
        if let Some(original) = self.saved.remove(&ns.name) {
            ns.each_fixtures = original;
        }
    }

    fn begin_test(&mut self, test: &TestInfo) {
        self.session.begin_test(test);
    }

    fn assertion(&mut self, test: &TestInfo, event: &AssertionEvent) {
        self.session.record_assertion(test, event);
        scope::record_assertion(event);
    }

    fn end_test(&mut self, test: &TestInfo) {
        let Some(end) = self.session.end_test(test) else {
            return;
        };
        if end.status != Status::Passed {
            scope::screenshot("failure screenshot");
        }
        if !end.traced {
            self.session.handoff(test, None);
        }
    }

    fn summary(&mut self, summary: &RunSummary) {
        info!(
            tests = summary.tests,
            assertions = summary.assertions,
            fail = summary.fail,
            error = summary.error,
            "run finished"
        );
        if let Err(e) = self.session.finalize() {
            warn!(error = %e, "finalize at run end failed");
        }
    }
}

impl Observer for TraceListener {
    fn key(&self) -> &str {
        TRACE_OBSERVER
    }

    fn enabled(&self) -> bool {
        self.session.is_enabled()
    }
}

/// The outermost per-test fixture.
///
/// Installs a fresh Context for the test, runs the inner chain, then hands
/// the test off once every inner fixture has returned or unwound. A panic
/// from an inner fixture is resumed after the handoff.
pub fn tracing_fixture(session: Arc<ReportSession>) -> Fixture {
    Arc::new(move |info: &TestInfo, inner: &mut dyn FnMut()| {
        if !session.is_enabled() {
            inner();
            return;
        }
        session.mark_traced(info);
        let guard = scope::install(session.new_context());
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| inner()));
        let active = guard.finish();
        session.complete(info, active);
        if let Err(payload) = outcome {
            panic::resume_unwind(payload);
        }
    })
}

/// Start a session from `config` and, when enabled, install its observer
/// on `chain`
pub fn activate(chain: &mut HookChain, config: TraceConfig) -> Arc<ReportSession> {
    let session = Arc::new(ReportSession::start(config));
    if session.is_enabled() {
        chain.install(Box::new(TraceListener::new(Arc::clone(&session))));
    }
    session
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct Counting {
        key: &'static str,
        enabled: Arc<AtomicBool>,
        calls: Arc<AtomicUsize>,
    }

    impl LifecycleListener for Counting {
        fn begin_test(&mut self, _test: &TestInfo) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl Observer for Counting {
        fn key(&self) -> &str {
            self.key
        }
        fn enabled(&self) -> bool {
            self.enabled.load(Ordering::SeqCst)
        }
    }

    fn counting(key: &'static str, enabled: bool) -> (Counting, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let observer = Counting {
            key,
            enabled: Arc::new(AtomicBool::new(enabled)),
            calls: Arc::clone(&calls),
        };
        (observer, calls)
    }

    #[test]
    fn test_install_is_idempotent() {
        let (original, original_calls) = counting("original", true);
        let mut chain = HookChain::new(Box::new(original));

        let (first, first_calls) = counting("obs", true);
        let (second, second_calls) = counting("obs", true);
        assert!(chain.install(Box::new(first)));
        assert!(!chain.install(Box::new(second)));
        assert_eq!(chain.observer_count(), 1);

        chain.begin_test(&TestInfo::new("ns", "t"));
        assert_eq!(original_calls.load(Ordering::SeqCst), 1);
        assert_eq!(first_calls.load(Ordering::SeqCst), 1);
        assert_eq!(second_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_disabled_observer_skipped() {
        let (original, original_calls) = counting("original", true);
        let mut chain = HookChain::new(Box::new(original));
        let (observer, calls) = counting("off", false);
        chain.install(Box::new(observer));

        chain.begin_test(&TestInfo::new("ns", "t"));
        assert_eq!(original_calls.load(Ordering::SeqCst), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_activate_disabled_installs_nothing() {
        let mut chain = HookChain::new(Box::new(crate::reporter::HumanReporter));
        let session = activate(&mut chain, TraceConfig::default());
        assert!(!session.is_enabled());
        assert!(!chain.is_installed(TRACE_OBSERVER));
    }
}
