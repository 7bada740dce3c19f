//! Run orchestration
//!
//! ```text
//! Idle -> ConfigResolving -> [ServicesWarming] -> SuitesLoading -> Executing
//!                    \________________\_________________\______________> Cleanup -> Reporting -> Terminal
//! ```
//!
//! Any failure before `Executing` skips straight to `Cleanup`. Cleanup
//! always runs and the provider cache is released afterwards.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use stagehand_common::config::normalize;
use stagehand_common::{
    ConfigCatalog, ConfigResolver, ConfigTree, EnvOverrides, LifecycleBus, Phase, ProviderCatalog,
    ProviderKind, ProviderRegistry, RegistryBuilder, DEFAULT_CONFIG_PATH,
};

use crate::engine::{BddEngine, EngineOptions, EngineReport, SequentialEngine};
use crate::error::{E2eError, E2eResult};
use crate::loader::{TestCatalog, TestLoader};
use crate::suite::{test_fn, Hook, Suite};

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_ABORT: i32 = 2;

/// Everything the host binary makes loadable
#[derive(Clone, Default)]
pub struct Catalog {
    pub configs: ConfigCatalog,
    pub providers: ProviderCatalog,
    pub tests: TestCatalog,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Per-invocation options, usually from the CLI
#[derive(Debug, Clone)]
pub struct RunnerOptions {
    pub config_path: PathBuf,
    /// Overrides `bdd.bail`
    pub bail: Option<bool>,
    /// Overrides `bdd.grep`
    pub grep: Option<String>,
    pub env: EnvOverrides,
    /// Where to write the JSON run report
    pub report_path: Option<PathBuf>,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from(DEFAULT_CONFIG_PATH),
            bail: None,
            grep: None,
            env: EnvOverrides::default(),
            report_path: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    ConfigResolving,
    ServicesWarming,
    SuitesLoading,
    Executing,
    Cleanup,
    Reporting,
    Terminal,
}

/// How a run ended
#[derive(Debug)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub exit_code: i32,
    /// States visited, in order
    pub trace: Vec<RunState>,
    /// `None` when the run aborted before `Executing`
    pub report: Option<EngineReport>,
    /// Why the run aborted or execution broke down
    pub error: Option<E2eError>,
    pub cleanup_error: Option<E2eError>,
}

impl RunOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == EXIT_SUCCESS
    }

    pub fn aborted(&self) -> bool {
        self.exit_code == EXIT_ABORT
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            run_id: self.run_id,
            started_at: self.started_at,
            finished_at: self.finished_at,
            exit_code: self.exit_code,
            trace: self.trace.clone(),
            error: self.error.as_ref().map(|err| error_chain(err)),
            cleanup_error: self.cleanup_error.as_ref().map(|err| error_chain(err)),
            results: self.report.clone(),
        }
    }
}

/// Serializable form of a [`RunOutcome`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub exit_code: i32,
    pub trace: Vec<RunState>,
    pub error: Option<String>,
    pub cleanup_error: Option<String>,
    pub results: Option<EngineReport>,
}

impl RunSummary {
    pub fn write_json(&self, path: impl AsRef<Path>) -> E2eResult<PathBuf> {
        let path = path.as_ref();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        info!("Run report written to: {}", path.display());
        Ok(path.to_path_buf())
    }
}

/// Render an error with its causes, outermost first
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !message.ends_with(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = cause.source();
    }
    message
}

/// Top-level orchestrator for one run
pub struct Runner {
    options: RunnerOptions,
    catalog: Catalog,
    engine: Arc<dyn BddEngine>,
}

impl Runner {
    pub fn new(options: RunnerOptions, catalog: Catalog) -> Self {
        Self {
            options,
            catalog,
            engine: Arc::new(SequentialEngine),
        }
    }

    /// Execute suites with a different engine
    pub fn with_engine(mut self, engine: impl BddEngine + 'static) -> Self {
        self.engine = Arc::new(engine);
        self
    }

    pub fn options(&self) -> &RunnerOptions {
        &self.options
    }

    pub async fn run(&self) -> RunOutcome {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!("Starting run {} with {}", run_id, self.options.config_path.display());

        let lifecycle = LifecycleBus::new();
        let mut trace = vec![RunState::Idle];
        let mut registry = None;

        let (report, error) = match self.prepare(&lifecycle, &mut trace, &mut registry).await {
            Ok((root, options)) => {
                trace.push(RunState::Executing);
                let engine = self.engine.clone();
                let executed = lifecycle
                    .bracket("run suites", async move {
                        Ok::<_, E2eError>(engine.run(root, &options).await)
                    })
                    .await;
                match executed {
                    Ok(report) => (Some(report), None),
                    Err(err) => {
                        error!("Execution failed: {}", error_chain(&err));
                        (None, Some(err))
                    }
                }
            }
            Err(err) => {
                error!("Run aborted: {}", error_chain(&err));
                (None, Some(err))
            }
        };
        let aborted = !trace.contains(&RunState::Executing);

        trace.push(RunState::Cleanup);
        let cleanup_error = match lifecycle.trigger(Phase::Cleanup, None).await {
            Ok(()) => None,
            Err(err) => {
                let err = E2eError::from(err);
                error!("Cleanup failed: {}", error_chain(&err));
                Some(err)
            }
        };
        if let Some(registry) = registry {
            registry.clear();
        }

        trace.push(RunState::Reporting);
        let exit_code = if aborted {
            EXIT_ABORT
        } else if error.is_some()
            || cleanup_error.is_some()
            || report.as_ref().map_or(true, |r| !r.success())
        {
            EXIT_FAILURE
        } else {
            EXIT_SUCCESS
        };
        trace.push(RunState::Terminal);

        let outcome = RunOutcome {
            run_id,
            started_at,
            finished_at: Utc::now(),
            exit_code,
            trace,
            report,
            error,
            cleanup_error,
        };

        if let Some(path) = &self.options.report_path {
            if let Err(err) = outcome.summary().write_json(path) {
                warn!("Failed to write run report: {}", err);
            }
        }

        info!("Run {} finished with exit code {}", run_id, outcome.exit_code);
        outcome
    }

    /// Everything up to `Executing`; the registry is handed out as soon as it exists
    async fn prepare(
        &self,
        lifecycle: &LifecycleBus,
        trace: &mut Vec<RunState>,
        registry_slot: &mut Option<ProviderRegistry>,
    ) -> E2eResult<(Suite, EngineOptions)> {
        trace.push(RunState::ConfigResolving);
        let resolver =
            ConfigResolver::new(self.catalog.configs.clone()).with_env(self.options.env.clone());
        let config = lifecycle
            .bracket("load config", async {
                resolver
                    .resolve(&self.options.config_path)
                    .await
                    .map_err(E2eError::from)
            })
            .await?;
        let config = Arc::new(config);

        let registry = RegistryBuilder::from_config(config.clone(), &self.catalog.providers)?
            .build(lifecycle.clone());
        *registry_slot = Some(registry.clone());

        if config.settings().eager_services {
            trace.push(RunState::ServicesWarming);
            warm(&registry).await?;
        }

        trace.push(RunState::SuitesLoading);
        lifecycle.trigger(Phase::BeforeLoadTests, None).await?;

        let files = test_files(&config);
        let loader = TestLoader::new(self.catalog.tests.clone(), registry.api());
        let mut root = lifecycle
            .bracket("load tests", async { loader.load_all(&files).map_err(E2eError::from) })
            .await?;
        install_root_hooks(&mut root, lifecycle);

        let options = EngineOptions::from_settings(
            config.settings(),
            self.options.bail,
            self.options.grep.as_deref(),
        )?;
        Ok((root, options))
    }
}

/// Resolve every configured service and page object concurrently
async fn warm(registry: &ProviderRegistry) -> E2eResult<()> {
    let keys: Vec<(ProviderKind, String)> = [ProviderKind::Service, ProviderKind::PageObject]
        .into_iter()
        .flat_map(|kind| registry.names(kind).into_iter().map(move |name| (kind, name)))
        .collect();

    info!("Warming {} provider(s)", keys.len());
    try_join_all(keys.iter().map(|(kind, name)| registry.resolve(*kind, name))).await?;
    Ok(())
}

/// Test file paths; the resolver has already rebased each entry onto its own config's directory
fn test_files(config: &ConfigTree) -> Vec<PathBuf> {
    config
        .settings()
        .test_files
        .iter()
        .map(|file| normalize(Path::new(file)))
        .collect()
}

/// `beforeTests` fires from the root `before` hook, `beforeEachTest` from the root `before_each`
fn install_root_hooks(root: &mut Suite, lifecycle: &LifecycleBus) {
    let bus = lifecycle.clone();
    root.hooks.before.insert(
        0,
        Hook::new(
            Phase::BeforeTests.as_str(),
            test_fn(move |_| {
                let bus = bus.clone();
                async move {
                    bus.trigger(Phase::BeforeTests, None).await?;
                    Ok(())
                }
            }),
        ),
    );

    let bus = lifecycle.clone();
    root.hooks.before_each.insert(
        0,
        Hook::new(
            Phase::BeforeEachTest.as_str(),
            test_fn(move |ctx| {
                let bus = bus.clone();
                async move {
                    bus.trigger(Phase::BeforeEachTest, Some(ctx.full_title)).await?;
                    Ok(())
                }
            }),
        ),
    );
}
