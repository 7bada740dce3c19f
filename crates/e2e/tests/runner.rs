//! End-to-end behaviour of the run state machine

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};

use stagehand_common::{provider, ConfigError, Phase, PhaseEvent, ProviderApi, ProviderFn};
use stagehand_e2e::runner::{EXIT_ABORT, EXIT_FAILURE, EXIT_SUCCESS};
use stagehand_e2e::{
    builtin_providers, Catalog, E2eError, Retry, RunState, RunSummary, Runner, RunnerOptions,
};

type Journal = Arc<Mutex<Vec<String>>>;

const CONFIG: &str = "ftr/config";
const LOGIN: &str = "ftr/suites/login";

struct Tracker;

/// Registers a handler on every ordered phase that records what fired
fn tracker(journal: &Journal) -> ProviderFn {
    let journal = journal.clone();
    provider(move |api: ProviderApi| {
        let journal = journal.clone();
        async move {
            for phase in [
                Phase::BeforeLoadTests,
                Phase::BeforeTests,
                Phase::BeforeEachTest,
                Phase::Cleanup,
            ] {
                let journal = journal.clone();
                api.lifecycle().on(phase, move |event: PhaseEvent| {
                    let journal = journal.clone();
                    async move {
                        let entry = match event.subject {
                            Some(subject) => format!("{}:{}", event.phase, subject),
                            None => event.phase.to_string(),
                        };
                        journal.lock().push(entry);
                        Ok(())
                    }
                });
            }
            Ok(Tracker)
        }
    })
}

fn failing_handler(phase: Phase) -> ProviderFn {
    provider(move |api: ProviderApi| async move {
        api.lifecycle().on(phase, |_| async { Err(anyhow::anyhow!("es unreachable")) });
        Ok(Tracker)
    })
}

fn catalog_with(config: Value, journal: &Journal) -> Catalog {
    let mut catalog = Catalog::new();
    catalog.configs.register(CONFIG, move |_api| {
        let config = config.clone();
        async move { Ok(config) }
    });
    catalog.providers = builtin_providers();
    catalog.providers.register("TrackerProvider", tracker(journal));
    catalog
}

fn tracked_config() -> Value {
    json!({
        "eager_services": true,
        "services": {"tracker": "TrackerProvider"},
        "test_files": ["suites/login"],
    })
}

fn login_suite(catalog: &mut Catalog, fail_first: bool) {
    catalog.tests.register(LOGIN, move |api| {
        api.describe("login", |s| {
            s.it("accepts", move |_| async move {
                if fail_first {
                    anyhow::bail!("wrong password");
                }
                Ok(())
            });
            s.it("rejects", |_| async { Ok(()) });
        });
        Ok(())
    });
}

fn options() -> RunnerOptions {
    RunnerOptions {
        config_path: CONFIG.into(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_successful_run() {
    let journal = Journal::default();
    let mut catalog = catalog_with(tracked_config(), &journal);
    login_suite(&mut catalog, false);

    let outcome = Runner::new(options(), catalog).run().await;

    assert_eq!(outcome.exit_code, EXIT_SUCCESS);
    assert_eq!(
        outcome.trace,
        vec![
            RunState::Idle,
            RunState::ConfigResolving,
            RunState::ServicesWarming,
            RunState::SuitesLoading,
            RunState::Executing,
            RunState::Cleanup,
            RunState::Reporting,
            RunState::Terminal,
        ]
    );
    assert_eq!(
        *journal.lock(),
        vec![
            "beforeLoadTests",
            "beforeTests",
            "beforeEachTest:login accepts",
            "beforeEachTest:login rejects",
            "cleanup",
        ]
    );
    assert_eq!(outcome.report.unwrap().passed, 2);
}

#[tokio::test]
async fn test_failing_test_exits_with_failure() {
    let journal = Journal::default();
    let mut catalog = catalog_with(tracked_config(), &journal);
    login_suite(&mut catalog, true);

    let outcome = Runner::new(options(), catalog).run().await;

    assert_eq!(outcome.exit_code, EXIT_FAILURE);
    let report = outcome.report.unwrap();
    assert_eq!((report.passed, report.failed), (1, 1));
    assert_eq!(journal.lock().last().map(String::as_str), Some("cleanup"));
}

#[tokio::test]
async fn test_cleanup_runs_after_before_tests_failure() {
    let journal = Journal::default();
    let mut config = tracked_config();
    config["services"]["saboteur"] = json!("SaboteurProvider");
    let mut catalog = catalog_with(config, &journal);
    catalog
        .providers
        .register("SaboteurProvider", failing_handler(Phase::BeforeTests));
    login_suite(&mut catalog, false);

    let outcome = Runner::new(options(), catalog).run().await;

    assert_eq!(outcome.exit_code, EXIT_FAILURE);
    let report = outcome.report.unwrap();
    assert_eq!((report.failed, report.skipped), (1, 2));
    assert_eq!(journal.lock().last().map(String::as_str), Some("cleanup"));
}

#[tokio::test]
async fn test_inherited_test_files_resolve_from_their_own_config() {
    let journal = Journal::default();
    let mut catalog = catalog_with(json!({}), &journal);
    catalog.configs.register("ftr/base", |_api| async {
        Ok(json!({"test_files": ["suites/login"]}))
    });
    catalog.configs.register("ftr/ci/config", |_api| async {
        Ok(json!({"extends": "../base"}))
    });
    login_suite(&mut catalog, false);

    let options = RunnerOptions {
        config_path: "ftr/ci/config".into(),
        ..Default::default()
    };
    let outcome = Runner::new(options, catalog).run().await;

    assert_eq!(outcome.exit_code, EXIT_SUCCESS, "{:?}", outcome.error);
    assert_eq!(outcome.report.unwrap().passed, 2);
}

#[tokio::test]
async fn test_missing_config_aborts() {
    let catalog = Catalog::new();
    let outcome = Runner::new(options(), catalog).run().await;

    assert_eq!(outcome.exit_code, EXIT_ABORT);
    assert!(matches!(
        outcome.error,
        Some(E2eError::Config(ConfigError::NotFound { .. }))
    ));
    assert_eq!(
        outcome.trace,
        vec![
            RunState::Idle,
            RunState::ConfigResolving,
            RunState::Cleanup,
            RunState::Reporting,
            RunState::Terminal,
        ]
    );
    assert!(outcome.report.is_none());
}

#[tokio::test]
async fn test_load_error_aborts_but_cleans_up() {
    let journal = Journal::default();
    let mut catalog = catalog_with(tracked_config(), &journal);
    catalog.tests.register(LOGIN, |api| {
        api.describe("one", |_| {});
        api.describe("two", |_| {});
        Ok(())
    });

    let outcome = Runner::new(options(), catalog).run().await;

    assert_eq!(outcome.exit_code, EXIT_ABORT);
    assert!(matches!(outcome.error, Some(E2eError::Load(_))));
    assert!(!outcome.trace.contains(&RunState::Executing));
    assert_eq!(*journal.lock(), vec!["beforeLoadTests", "cleanup"]);
}

#[tokio::test]
async fn test_warm_up_failure_aborts() {
    let journal = Journal::default();
    let mut config = tracked_config();
    config["page_objects"] = json!({"header": "BrokenProvider"});
    let mut catalog = catalog_with(config, &journal);
    catalog.providers.register(
        "BrokenProvider",
        provider(|_api| async { Err::<Tracker, _>(anyhow::anyhow!("selector missing")) }),
    );
    login_suite(&mut catalog, false);

    let outcome = Runner::new(options(), catalog).run().await;

    assert_eq!(outcome.exit_code, EXIT_ABORT);
    assert!(matches!(outcome.error, Some(E2eError::Provider(_))));
    assert!(outcome.trace.contains(&RunState::ServicesWarming));
    assert!(!outcome.trace.contains(&RunState::SuitesLoading));
}

#[tokio::test]
async fn test_bail_override() {
    let journal = Journal::default();
    let mut catalog = catalog_with(tracked_config(), &journal);
    login_suite(&mut catalog, true);

    let options = RunnerOptions {
        bail: Some(true),
        ..options()
    };
    let outcome = Runner::new(options, catalog).run().await;

    let report = outcome.report.unwrap();
    assert_eq!((report.failed, report.skipped, report.passed), (1, 1, 0));
    assert_eq!(outcome.exit_code, EXIT_FAILURE);
}

#[tokio::test]
async fn test_grep_override() {
    let journal = Journal::default();
    let mut catalog = catalog_with(tracked_config(), &journal);
    login_suite(&mut catalog, true);

    let options = RunnerOptions {
        grep: Some("rejects$".into()),
        ..options()
    };
    let outcome = Runner::new(options, catalog).run().await;

    assert_eq!(outcome.exit_code, EXIT_SUCCESS);
    assert_eq!(outcome.report.unwrap().total(), 1);
}

#[tokio::test]
async fn test_tests_resolve_services_lazily() {
    let journal = Journal::default();
    let config = json!({
        "services": {"retry": "RetryProvider", "log": "LogProvider"},
        "timeouts": {"try": 1500},
        "test_files": ["suites/login"],
    });
    let mut catalog = catalog_with(config, &journal);
    catalog.tests.register(LOGIN, |api| {
        let services = api.services().clone();
        api.describe("retry", move |s| {
            s.it("uses configured timeout", move |_| {
                let services = services.clone();
                async move {
                    let retry = services.get_service::<Retry>("retry").await?;
                    anyhow::ensure!(retry.timeout() == Duration::from_millis(1500), "wrong timeout");
                    Ok(())
                }
            });
        });
        Ok(())
    });

    let outcome = Runner::new(options(), catalog).run().await;
    assert_eq!(outcome.exit_code, EXIT_SUCCESS);
    assert!(!outcome.trace.contains(&RunState::ServicesWarming));
}

#[tokio::test]
async fn test_cleanup_failure_fails_run() {
    let journal = Journal::default();
    let mut config = tracked_config();
    config["services"]["saboteur"] = json!("SaboteurProvider");
    let mut catalog = catalog_with(config, &journal);
    catalog
        .providers
        .register("SaboteurProvider", failing_handler(Phase::Cleanup));
    login_suite(&mut catalog, false);

    let outcome = Runner::new(options(), catalog).run().await;

    assert!(outcome.report.as_ref().unwrap().success());
    assert!(outcome.cleanup_error.is_some());
    assert_eq!(outcome.exit_code, EXIT_FAILURE);
    assert_eq!(journal.lock().last().map(String::as_str), Some("cleanup"));
}

#[tokio::test]
async fn test_run_report_written() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("reports/run.json");
    let journal = Journal::default();
    let mut catalog = catalog_with(tracked_config(), &journal);
    login_suite(&mut catalog, false);

    let options = RunnerOptions {
        report_path: Some(path.clone()),
        ..options()
    };
    let outcome = Runner::new(options, catalog).run().await;

    let summary: RunSummary =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(summary.run_id, outcome.run_id);
    assert_eq!(summary.exit_code, EXIT_SUCCESS);
    assert_eq!(summary.results.unwrap().passed, 2);
}
