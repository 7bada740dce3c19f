//! BDD execution engine
//!
//! The runner hands the assembled suite tree to a [`BddEngine`]. The
//! default [`SequentialEngine`] runs it mocha-style:
//!
//! ```text
//! before*  ->  for each child in declaration order:
//!                test:  before_each (outer..inner) -> body -> after_each (inner..outer)
//!                suite: recurse
//!          ->  after*
//! ```

use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use stagehand_common::config::{DEFAULT_TEST_TIMEOUT_MS, Settings};
use stagehand_common::error::panic_message;

use crate::error::E2eResult;
use crate::suite::{extend_path, full_title, Hook, HookKind, Node, Suite, Test, TestContext, TestFn};

#[async_trait]
pub trait BddEngine: Send + Sync {
    /// Execute every selected test of `root` and report the verdict
    async fn run(&self, root: Suite, options: &EngineOptions) -> EngineReport;
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Stop starting tests after the first failure
    pub bail: bool,
    /// Only tests whose full title matches run
    pub grep: Option<Regex>,
    /// Bound on every test body and hook
    pub test_timeout: Duration,
    /// Tests slower than this are flagged
    pub slow: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            bail: false,
            grep: None,
            test_timeout: Duration::from_millis(DEFAULT_TEST_TIMEOUT_MS),
            slow: Duration::from_secs(30),
        }
    }
}

impl EngineOptions {
    /// Options from config, with CLI overrides for `bail` and `grep`
    pub fn from_settings(settings: &Settings, bail: Option<bool>, grep: Option<&str>) -> E2eResult<Self> {
        let pattern = grep.or(settings.bdd.grep.as_deref());
        let grep = pattern.map(Regex::new).transpose()?;

        Ok(Self {
            bail: bail.unwrap_or(settings.bdd.bail),
            grep,
            test_timeout: Duration::from_millis(settings.timeouts.test),
            slow: Duration::from_millis(settings.bdd.slow_ms),
        })
    }

    fn selects(&self, full_title: &str) -> bool {
        self.grep
            .as_ref()
            .map_or(true, |grep| grep.is_match(full_title))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Passed,
    Failed,
    Pending,
    Skipped,
}

/// Result of one test or failed hook
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestOutcome {
    pub title: String,
    pub full_title: String,
    pub file: Option<String>,
    pub status: TestStatus,
    pub duration_ms: u64,
    pub slow: bool,
    pub error: Option<String>,
}

/// Aggregate verdict of an engine run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineReport {
    pub passed: usize,
    pub failed: usize,
    pub pending: usize,
    pub skipped: usize,
    pub duration_ms: u64,
    pub tests: Vec<TestOutcome>,
}

impl EngineReport {
    pub fn total(&self) -> usize {
        self.tests.len()
    }

    pub fn success(&self) -> bool {
        self.failed == 0
    }

    pub fn failures(&self) -> impl Iterator<Item = &TestOutcome> {
        self.tests
            .iter()
            .filter(|outcome| outcome.status == TestStatus::Failed)
    }

    /// Write the report as pretty JSON, creating parent directories
    pub fn write_json(&self, path: impl AsRef<Path>) -> E2eResult<PathBuf> {
        let path = path.as_ref();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }

        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;

        info!("Results written to: {}", path.display());
        Ok(path.to_path_buf())
    }

    fn record(&mut self, outcome: TestOutcome) {
        match outcome.status {
            TestStatus::Passed => self.passed += 1,
            TestStatus::Failed => self.failed += 1,
            TestStatus::Pending => self.pending += 1,
            TestStatus::Skipped => self.skipped += 1,
        }
        self.tests.push(outcome);
    }
}

/// Runs suites one test at a time in declaration order
#[derive(Debug, Clone, Copy, Default)]
pub struct SequentialEngine;

#[async_trait]
impl BddEngine for SequentialEngine {
    async fn run(&self, root: Suite, options: &EngineOptions) -> EngineReport {
        let start = Instant::now();
        info!("Running {} test(s)...", root.test_count());

        let mut execution = Execution {
            options: options.clone(),
            report: EngineReport::default(),
            bailed: false,
        };
        execution
            .run_suite(&root, Vec::new(), Vec::new(), Vec::new())
            .await;

        let mut report = execution.report;
        report.duration_ms = start.elapsed().as_millis() as u64;

        info!(
            "Test Results: {} passed, {} failed, {} pending, {} skipped ({} ms)",
            report.passed, report.failed, report.pending, report.skipped, report.duration_ms
        );
        report
    }
}

struct Execution {
    options: EngineOptions,
    report: EngineReport,
    bailed: bool,
}

impl Execution {
    fn run_suite<'a>(
        &'a mut self,
        suite: &'a Suite,
        parents: Vec<String>,
        before_each: Vec<&'a Hook>,
        after_each: Vec<&'a Hook>,
    ) -> BoxFuture<'a, ()> {
        async move {
            let path = extend_path(&parents, &suite.title);
            if !self.selects_any(suite, &path) {
                return;
            }
            if self.bailed {
                self.skip_all(suite, &path);
                return;
            }
            if !suite.is_root() {
                debug!("Suite: {}", path.join(" "));
            }

            let mut ready = true;
            for hook in &suite.hooks.before {
                if let Err(err) = self.invoke(&hook.body, hook_context(hook, &path)).await {
                    self.hook_failed(HookKind::Before, hook, &path, &err);
                    self.skip_all(suite, &path);
                    ready = false;
                    break;
                }
            }

            if ready {
                let mut inner_before = before_each;
                inner_before.extend(suite.hooks.before_each.iter());
                let mut inner_after: Vec<&Hook> = suite.hooks.after_each.iter().collect();
                inner_after.extend(after_each);

                for node in &suite.children {
                    match node {
                        Node::Test(test) => {
                            self.run_test(test, &path, &inner_before, &inner_after)
                                .await
                        }
                        Node::Suite(child) => {
                            self.run_suite(child, path.clone(), inner_before.clone(), inner_after.clone())
                                .await
                        }
                    }
                }
            }

            for hook in &suite.hooks.after {
                if let Err(err) = self.invoke(&hook.body, hook_context(hook, &path)).await {
                    self.hook_failed(HookKind::After, hook, &path, &err);
                    break;
                }
            }
        }
        .boxed()
    }

    async fn run_test(&mut self, test: &Test, path: &[String], before_each: &[&Hook], after_each: &[&Hook]) {
        let full = full_title(path, &test.title);
        if !self.options.selects(&full) {
            return;
        }
        if self.bailed {
            self.record(test, full, TestStatus::Skipped, Duration::ZERO, None);
            return;
        }
        let Some(body) = &test.body else {
            info!("- {}", full);
            self.record(test, full, TestStatus::Pending, Duration::ZERO, None);
            return;
        };

        let ctx = TestContext {
            title: test.title.clone(),
            full_title: full.clone(),
        };
        let start = Instant::now();
        let mut failure: Option<String> = None;

        for hook in before_each {
            if let Err(err) = self.invoke(&hook.body, ctx.clone()).await {
                failure = Some(format!("{}: {:#}", hook.title, err));
                break;
            }
        }
        if failure.is_none() {
            if let Err(err) = self.invoke(body, ctx.clone()).await {
                failure = Some(format!("{:#}", err));
            }
        }
        for hook in after_each {
            if let Err(err) = self.invoke(&hook.body, ctx.clone()).await {
                failure.get_or_insert_with(|| format!("{}: {:#}", hook.title, err));
            }
        }

        let elapsed = start.elapsed();
        let duration_ms = elapsed.as_millis() as u64;
        match failure {
            None => {
                info!("✓ {} ({} ms)", full, duration_ms);
                if elapsed >= self.options.slow {
                    warn!("{} is slow ({} ms)", full, duration_ms);
                }
                self.record(test, full, TestStatus::Passed, elapsed, None);
            }
            Some(reason) => {
                error!("✗ {} - {}", full, reason);
                self.record(test, full, TestStatus::Failed, elapsed, Some(reason));
                self.bail_if_requested();
            }
        }
    }

    /// Run one body under the test timeout; panics and timeouts are failures
    async fn invoke(&self, body: &TestFn, ctx: TestContext) -> anyhow::Result<()> {
        let body = body.clone();
        let limit = self.options.test_timeout;
        let guarded = AssertUnwindSafe(async move { body(ctx).await }).catch_unwind();

        match tokio::time::timeout(limit, guarded).await {
            Ok(Ok(result)) => result,
            Ok(Err(payload)) => Err(anyhow::anyhow!("panicked: {}", panic_message(payload.as_ref()))),
            Err(_) => Err(anyhow::anyhow!("timed out after {} ms", limit.as_millis())),
        }
    }

    fn hook_failed(&mut self, kind: HookKind, hook: &Hook, path: &[String], err: &anyhow::Error) {
        let full = full_title(path, &hook.title);
        let reason = format!("{:#}", err);
        error!("✗ {} - {}", full, reason);

        self.report.record(TestOutcome {
            title: format!("\"{}\" hook", kind),
            full_title: full,
            file: None,
            status: TestStatus::Failed,
            duration_ms: 0,
            slow: false,
            error: Some(reason),
        });
        self.bail_if_requested();
    }

    fn bail_if_requested(&mut self) {
        if self.options.bail && !self.bailed {
            warn!("Bailing after first failure");
            self.bailed = true;
        }
    }

    fn record(&mut self, test: &Test, full_title: String, status: TestStatus, elapsed: Duration, error: Option<String>) {
        self.report.record(TestOutcome {
            title: test.title.clone(),
            full_title,
            file: test.file.as_ref().map(|p| p.display().to_string()),
            status,
            duration_ms: elapsed.as_millis() as u64,
            slow: status == TestStatus::Passed && elapsed >= self.options.slow,
            error,
        });
    }

    /// Count every selected test under `suite` as skipped
    fn skip_all(&mut self, suite: &Suite, path: &[String]) {
        for node in &suite.children {
            match node {
                Node::Test(test) => {
                    let full = full_title(path, &test.title);
                    if self.options.selects(&full) {
                        self.record(test, full, TestStatus::Skipped, Duration::ZERO, None);
                    }
                }
                Node::Suite(child) => {
                    let child_path = extend_path(path, &child.title);
                    self.skip_all(child, &child_path);
                }
            }
        }
    }

    fn selects_any(&self, suite: &Suite, path: &[String]) -> bool {
        if self.options.grep.is_none() {
            return true;
        }
        suite.children.iter().any(|node| match node {
            Node::Test(test) => self.options.selects(&full_title(path, &test.title)),
            Node::Suite(child) => self.selects_any(child, &extend_path(path, &child.title)),
        })
    }
}

fn hook_context(hook: &Hook, path: &[String]) -> TestContext {
    TestContext {
        title: hook.title.clone(),
        full_title: full_title(path, &hook.title),
    }
}
