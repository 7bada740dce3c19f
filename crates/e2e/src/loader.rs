//! Test Loader
//!
//! Evaluates Test Providers registered in a [`TestCatalog`]. Each provider
//! receives a [`TestApi`] and must declare exactly one top-level suite;
//! `load_test_file` splices another file's suite in as a nested suite.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use stagehand_common::config::{normalize, resolve_relative};
use stagehand_common::error::panic_message;
use stagehand_common::{ConfigTree, LifecycleBus, PageObjects, ProviderApi, ProviderError};

use crate::error::LoadError;
use crate::suite::{test_fn, Hook, HookKind, Suite, Test, TestContext};

/// A Test Provider: declares suites through the api it is given
pub type TestProviderFn = Arc<dyn Fn(&TestApi) -> anyhow::Result<()> + Send + Sync>;

/// Test Providers addressable by path
#[derive(Clone, Default)]
pub struct TestCatalog {
    providers: HashMap<PathBuf, TestProviderFn>,
}

impl TestCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, path: impl AsRef<Path>, provider: F) -> &mut Self
    where
        F: Fn(&TestApi) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.providers
            .insert(normalize(path.as_ref()), Arc::new(provider));
        self
    }

    pub fn contains(&self, path: impl AsRef<Path>) -> bool {
        self.providers.contains_key(&normalize(path.as_ref()))
    }

    /// Registered paths, sorted
    pub fn paths(&self) -> Vec<&Path> {
        let mut paths: Vec<&Path> = self.providers.keys().map(PathBuf::as_path).collect();
        paths.sort();
        paths
    }

    fn get(&self, path: &Path) -> Option<TestProviderFn> {
        self.providers.get(path).cloned()
    }
}

impl std::fmt::Debug for TestCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.paths()).finish()
    }
}

/// Per-file evaluation state
#[derive(Default)]
struct Frame {
    path: PathBuf,
    stack: Vec<PathBuf>,
    declared: Vec<Suite>,
    error: Option<LoadError>,
}

#[derive(Clone)]
pub struct TestLoader {
    catalog: Arc<TestCatalog>,
    services: ProviderApi,
}

impl TestLoader {
    pub fn new(catalog: TestCatalog, services: ProviderApi) -> Self {
        Self {
            catalog: Arc::new(catalog),
            services,
        }
    }

    /// Evaluate one test file and return its single top-level suite
    pub fn load_test_file(&self, path: impl AsRef<Path>) -> Result<Suite, LoadError> {
        self.load(normalize(path.as_ref()), Vec::new())
    }

    /// Load every file, in order, under one untitled root suite
    pub fn load_all<P: AsRef<Path>>(&self, paths: &[P]) -> Result<Suite, LoadError> {
        let mut root = Suite::root();
        for path in paths {
            root.add_suite(self.load_test_file(path)?);
        }
        info!(
            "Loaded {} test file(s) with {} test(s)",
            paths.len(),
            root.test_count()
        );
        Ok(root)
    }

    fn load(&self, path: PathBuf, mut stack: Vec<PathBuf>) -> Result<Suite, LoadError> {
        if let Some(start) = stack.iter().position(|p| *p == path) {
            let mut chain = stack[start..].to_vec();
            chain.push(path);
            return Err(LoadError::Cycle { chain });
        }

        let provider = self
            .catalog
            .get(&path)
            .ok_or_else(|| LoadError::NotFound { path: path.clone() })?;

        debug!("Loading test file {}", path.display());
        stack.push(path.clone());

        let api = TestApi {
            services: self.services.clone(),
            loader: self.clone(),
            frame: Arc::new(Mutex::new(Frame {
                path: path.clone(),
                stack,
                ..Default::default()
            })),
        };

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| provider(&api)));
        let (mut declared, error) = {
            let mut frame = api.frame.lock();
            (std::mem::take(&mut frame.declared), frame.error.take())
        };

        if let Some(err) = error {
            return Err(err);
        }
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(source)) => return Err(LoadError::Provider { path, source }),
            Err(payload) => {
                return Err(LoadError::Provider {
                    path,
                    source: anyhow::anyhow!("panicked: {}", panic_message(payload.as_ref())),
                })
            }
        }

        match declared.len() {
            0 => Err(LoadError::NoTopLevelSuite { path }),
            1 => Ok(declared.remove(0)),
            count => Err(LoadError::MultipleTopLevelSuites { path, count }),
        }
    }
}

/// Capability object handed to Test Providers
#[derive(Clone)]
pub struct TestApi {
    services: ProviderApi,
    loader: TestLoader,
    frame: Arc<Mutex<Frame>>,
}

impl TestApi {
    /// Path of the test file being evaluated
    pub fn path(&self) -> PathBuf {
        self.frame.lock().path.clone()
    }

    pub fn services(&self) -> &ProviderApi {
        &self.services
    }

    pub fn lifecycle(&self) -> &LifecycleBus {
        self.services.lifecycle()
    }

    pub async fn get_service<T: std::any::Any + Send + Sync>(
        &self,
        name: &str,
    ) -> Result<Arc<T>, ProviderError> {
        self.services.get_service(name).await
    }

    pub async fn get_page_objects(&self, names: &[&str]) -> Result<PageObjects, ProviderError> {
        self.services.get_page_objects(names).await
    }

    pub async fn config(&self) -> Result<Arc<ConfigTree>, ProviderError> {
        self.services.get_config().await
    }

    /// Declare a top-level suite
    pub fn describe<F>(&self, title: impl Into<String>, body: F)
    where
        F: FnOnce(&mut SuiteBuilder<'_>),
    {
        let suite = self.build_suite(title.into(), body);
        self.frame.lock().declared.push(suite);
    }

    /// Use another file's suite as this file's top-level suite
    pub fn load_test_file(&self, path: impl AsRef<Path>) {
        if let Some(suite) = self.load_nested(path.as_ref()) {
            self.frame.lock().declared.push(suite);
        }
    }

    fn build_suite<F>(&self, title: String, body: F) -> Suite
    where
        F: FnOnce(&mut SuiteBuilder<'_>),
    {
        let mut suite = Suite::new(title);
        suite.file = Some(self.path());
        let mut builder = SuiteBuilder { suite, api: self };
        body(&mut builder);
        builder.suite
    }

    fn load_nested(&self, path: &Path) -> Option<Suite> {
        let (target, stack) = {
            let frame = self.frame.lock();
            (resolve_relative(&frame.path, path), frame.stack.clone())
        };

        match self.loader.load(target, stack) {
            Ok(suite) => Some(suite),
            Err(err) => {
                warn!("{}", err);
                let mut frame = self.frame.lock();
                if frame.error.is_none() {
                    frame.error = Some(err);
                }
                None
            }
        }
    }
}

/// Declares the contents of one suite
pub struct SuiteBuilder<'a> {
    suite: Suite,
    api: &'a TestApi,
}

impl SuiteBuilder<'_> {
    pub fn api(&self) -> &TestApi {
        self.api
    }

    pub fn title(&self) -> &str {
        &self.suite.title
    }

    pub fn describe<F>(&mut self, title: impl Into<String>, body: F) -> &mut Self
    where
        F: FnOnce(&mut SuiteBuilder<'_>),
    {
        let child = self.api.build_suite(title.into(), body);
        self.suite.add_suite(child);
        self
    }

    pub fn it<F, Fut>(&mut self, title: impl Into<String>, body: F) -> &mut Self
    where
        F: Fn(TestContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let file = self.suite.file.clone();
        self.suite.add_test(Test {
            title: title.into(),
            body: Some(test_fn(body)),
            file,
        });
        self
    }

    /// Declare a pending test
    pub fn it_skip(&mut self, title: impl Into<String>) -> &mut Self {
        let file = self.suite.file.clone();
        self.suite.add_test(Test {
            title: title.into(),
            body: None,
            file,
        });
        self
    }

    pub fn before<F, Fut>(&mut self, body: F) -> &mut Self
    where
        F: Fn(TestContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.hook(HookKind::Before, body)
    }

    pub fn after<F, Fut>(&mut self, body: F) -> &mut Self
    where
        F: Fn(TestContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.hook(HookKind::After, body)
    }

    pub fn before_each<F, Fut>(&mut self, body: F) -> &mut Self
    where
        F: Fn(TestContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.hook(HookKind::BeforeEach, body)
    }

    pub fn after_each<F, Fut>(&mut self, body: F) -> &mut Self
    where
        F: Fn(TestContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.hook(HookKind::AfterEach, body)
    }

    /// Splice another file's top-level suite in as a nested suite
    pub fn load_test_file(&mut self, path: impl AsRef<Path>) -> &mut Self {
        if let Some(suite) = self.api.load_nested(path.as_ref()) {
            self.suite.add_suite(suite);
        }
        self
    }

    fn hook<F, Fut>(&mut self, kind: HookKind, body: F) -> &mut Self
    where
        F: Fn(TestContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let title = format!("\"{}\" hook", kind);
        self.suite.hooks.push(kind, Hook::new(title, test_fn(body)));
        self
    }
}
