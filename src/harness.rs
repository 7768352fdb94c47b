//! Reference test host
//!
//! A small clojure.test-style runner: namespaces of tests, per-test
//! fixtures composed outermost-first, and an assertion API that reports
//! every check through a `LifecycleListener` (usually a `HookChain`).

use crate::error::{is_assertion_failure, is_assertion_panic, panic_message};
use crate::model::{AssertionEvent, AssertionKind, RunSummary, TestInfo};
use crate::reporter::LifecycleListener;
use std::fmt::Debug;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

/// Per-test fixture: receives the test identity and must call `inner`
/// exactly once to run the rest of the chain
pub type Fixture = Arc<dyn Fn(&TestInfo, &mut dyn FnMut()) + Send + Sync>;

pub type TestBody = Arc<dyn Fn(&mut Checks<'_>) -> anyhow::Result<()> + Send + Sync>;

#[derive(Clone)]
pub struct TestDef {
    pub name: String,
    pub body: TestBody,
}

impl TestDef {
    pub fn new(
        name: impl Into<String>,
        body: impl Fn(&mut Checks<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            body: Arc::new(body),
        }
    }
}

/// A group of tests sharing per-test fixtures
#[derive(Clone)]
pub struct Namespace {
    pub name: String,
    /// First entry is the outermost wrapper
    pub each_fixtures: Vec<Fixture>,
    pub tests: Vec<TestDef>,
}

impl Namespace {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            each_fixtures: Vec::new(),
            tests: Vec::new(),
        }
    }

    pub fn with_fixture(
        mut self,
        fixture: impl Fn(&TestInfo, &mut dyn FnMut()) + Send + Sync + 'static,
    ) -> Self {
        self.each_fixtures.push(Arc::new(fixture));
        self
    }

    pub fn with_test(
        mut self,
        name: impl Into<String>,
        body: impl Fn(&mut Checks<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.tests.push(TestDef::new(name, body));
        self
    }
}

// =============================================================================
// Assertions
// =============================================================================

/// Assertion API handed to a running test
pub struct Checks<'a> {
    listener: &'a mut dyn LifecycleListener,
    test: &'a TestInfo,
    summary: &'a mut RunSummary,
    contexts: Vec<String>,
}

impl Checks<'_> {
    /// Report `cond` as pass or fail
    pub fn is(&mut self, cond: bool, message: &str) -> bool {
        let kind = if cond {
            AssertionKind::Pass
        } else {
            AssertionKind::Fail
        };
        let event = AssertionEvent::new(kind, self.contexts.clone()).with_message(message);
        self.report(event);
        cond
    }

    /// Report whether `actual == expected`, carrying both values
    pub fn is_eq<T: PartialEq + Debug>(&mut self, expected: T, actual: T) -> bool {
        let equal = expected == actual;
        let kind = if equal {
            AssertionKind::Pass
        } else {
            AssertionKind::Fail
        };
        let event = AssertionEvent::new(kind, self.contexts.clone())
            .with_values(format!("{:?}", expected), format!("{:?}", actual));
        self.report(event);
        equal
    }

    /// Run `f` with `label` appended to the context of every check inside
    pub fn testing<R>(&mut self, label: &str, f: impl FnOnce(&mut Self) -> R) -> R {
        self.contexts.push(label.to_string());
        let result = f(self);
        self.contexts.pop();
        result
    }

    /// Current `testing` labels, outermost first
    pub fn contexts(&self) -> &[String] {
        &self.contexts
    }

    fn report(&mut self, event: AssertionEvent) {
        report(&mut *self.listener, self.test, &mut *self.summary, &event);
    }
}

fn report(
    listener: &mut dyn LifecycleListener,
    test: &TestInfo,
    summary: &mut RunSummary,
    event: &AssertionEvent,
) {
    summary.assertions += 1;
    match event.kind {
        AssertionKind::Pass => summary.pass += 1,
        AssertionKind::Fail => summary.fail += 1,
        AssertionKind::Error => summary.error += 1,
    }
    listener.assertion(test, event);
}

// =============================================================================
// Runner
// =============================================================================

pub struct Runner<L: LifecycleListener> {
    listener: L,
}

impl<L: LifecycleListener> Runner<L> {
    pub fn new(listener: L) -> Self {
        Self { listener }
    }

    pub fn listener(&self) -> &L {
        &self.listener
    }

    pub fn listener_mut(&mut self) -> &mut L {
        &mut self.listener
    }

    pub fn into_listener(self) -> L {
        self.listener
    }

    /// Run every namespace in order and report the summary
    pub fn run(&mut self, namespaces: &mut [Namespace]) -> RunSummary {
        let start = Instant::now();
        let mut summary = RunSummary::default();

        for ns in namespaces.iter_mut() {
            self.run_namespace(ns, &mut summary);
        }

        summary.duration_ms = start.elapsed().as_millis() as u64;
        self.listener.summary(&summary);
        summary
    }

    fn run_namespace(&mut self, ns: &mut Namespace, summary: &mut RunSummary) {
        self.listener.begin_namespace(ns);

        // Fixtures as they stand after begin_namespace listeners ran
        let fixtures = ns.each_fixtures.clone();
        let tests = ns.tests.clone();
        for test in &tests {
            let info = TestInfo::new(&ns.name, &test.name);
            let listener = &mut self.listener;
            let mut call = || run_test(&mut *listener, &info, test, &mut *summary);
            with_fixtures(&fixtures, &info, &mut call);
        }

        self.listener.end_namespace(ns);
    }
}

fn with_fixtures(fixtures: &[Fixture], info: &TestInfo, inner: &mut dyn FnMut()) {
    match fixtures.split_first() {
        None => inner(),
        Some((outer, rest)) => outer(info, &mut || with_fixtures(rest, info, &mut *inner)),
    }
}

fn run_test(
    listener: &mut dyn LifecycleListener,
    info: &TestInfo,
    test: &TestDef,
    summary: &mut RunSummary,
) {
    summary.tests += 1;
    listener.begin_test(info);

    let outcome = {
        let mut checks = Checks {
            listener: &mut *listener,
            test: info,
            summary: &mut *summary,
            contexts: Vec::new(),
        };
        panic::catch_unwind(AssertUnwindSafe(|| (test.body)(&mut checks)))
    };

    let failure = match outcome {
        Ok(Ok(())) => None,
        Ok(Err(err)) => {
            let kind = if is_assertion_failure(&err) {
                AssertionKind::Fail
            } else {
                AssertionKind::Error
            };
            Some(
                AssertionEvent::new(kind, Vec::new())
                    .with_message(err.to_string())
                    .with_trace(format!("{:?}", err)),
            )
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            let kind = if is_assertion_panic(&message) {
                AssertionKind::Fail
            } else {
                AssertionKind::Error
            };
            Some(AssertionEvent::new(kind, Vec::new()).with_message(message))
        }
    };
    if let Some(event) = failure {
        report(&mut *listener, info, &mut *summary, &event);
    }

    listener.end_test(info);
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AssertionFailed;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Vec<String>,
    }

    impl LifecycleListener for Recorder {
        fn begin_namespace(&mut self, ns: &mut Namespace) {
            self.events.push(format!("begin-ns {}", ns.name));
        }
        fn end_namespace(&mut self, ns: &mut Namespace) {
            self.events.push(format!("end-ns {}", ns.name));
        }
        fn begin_test(&mut self, test: &TestInfo) {
            self.events.push(format!("begin {}", test.name));
        }
        fn end_test(&mut self, test: &TestInfo) {
            self.events.push(format!("end {}", test.name));
        }
        fn assertion(&mut self, _test: &TestInfo, event: &AssertionEvent) {
            self.events
                .push(format!("{:?} [{}] {}", event.kind, event.context.join("/"), event.describe()));
        }
    }

    #[test]
    fn test_events_in_order_with_contexts() {
        let mut namespaces = vec![Namespace::new("shop::cart").with_test("adds_item", |t| {
            t.testing("cart", |t| {
                t.testing("adding", |t| t.is(true, "has item"));
                t.is_eq(1, 2);
            });
            Ok(())
        })];

        let mut runner = Runner::new(Recorder::default());
        let summary = runner.run(&mut namespaces);

        assert_eq!(
            runner.listener().events,
            vec![
                "begin-ns shop::cart",
                "begin adds_item",
                "Pass [cart/adding] has item",
                "Fail [cart] expected: 1, actual: 2",
                "end adds_item",
                "end-ns shop::cart",
            ]
        );
        assert_eq!(summary.tests, 1);
        assert_eq!(summary.assertions, 2);
        assert_eq!(summary.fail, 1);
    }

    #[test]
    fn test_body_errors_and_panics_reported() {
        let mut namespaces = vec![Namespace::new("ns")
            .with_test("errors", |_| anyhow::bail!("network unreachable"))
            .with_test("fails", |_| Err(AssertionFailed::new("totals differ").into()))
            .with_test("panics", |_| {
                assert_eq!(1 + 1, 3);
                Ok(())
            })];

        let mut runner = Runner::new(Recorder::default());
        let summary = runner.run(&mut namespaces);

        let events = &runner.listener().events;
        assert!(events.contains(&"Error [] network unreachable".to_string()));
        assert!(events.contains(&"Fail [] totals differ".to_string()));
        assert!(events.iter().any(|e| e.starts_with("Fail [] assertion")));
        assert_eq!(summary.error, 1);
        assert_eq!(summary.fail, 2);
    }

    #[test]
    fn test_fixtures_compose_outermost_first() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let (a, b, body) = (order.clone(), order.clone(), order.clone());

        let mut namespaces = vec![Namespace::new("ns")
            .with_fixture(move |_, inner| {
                a.lock().unwrap().push("outer-in");
                inner();
                a.lock().unwrap().push("outer-out");
            })
            .with_fixture(move |_, inner| {
                b.lock().unwrap().push("inner-in");
                inner();
                b.lock().unwrap().push("inner-out");
            })
            .with_test("t", move |_| {
                body.lock().unwrap().push("body");
                Ok(())
            })];

        Runner::new(Recorder::default()).run(&mut namespaces);
        assert_eq!(
            *order.lock().unwrap(),
            vec!["outer-in", "inner-in", "body", "inner-out", "outer-out"]
        );
    }
}
