//! Stagehand E2E Test Framework
//!
//! Loads test suites, wires them to the provider registry and drives them
//! through a BDD engine:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Runner                              │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ConfigResolver  -> ConfigTree                              │
//! │  RegistryBuilder -> ProviderRegistry (services, page objs)  │
//! │  TestLoader      -> Suite tree (one top-level per file)     │
//! │  BddEngine       -> EngineReport                            │
//! │  LifecycleBus    beforeLoadTests > beforeTests >            │
//! │                  beforeEachTest* > cleanup                  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod engine;
pub mod error;
pub mod loader;
pub mod runner;
pub mod services;
pub mod suite;

pub use engine::{BddEngine, EngineOptions, EngineReport, SequentialEngine, TestOutcome, TestStatus};
pub use error::{E2eError, E2eResult, LoadError};
pub use loader::{SuiteBuilder, TestApi, TestCatalog, TestLoader};
pub use runner::{Catalog, RunOutcome, RunState, RunSummary, Runner, RunnerOptions};
pub use services::{builtin_providers, Retry};
pub use suite::{Suite, TestContext};
