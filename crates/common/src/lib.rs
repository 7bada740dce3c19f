//! Stagehand Common Library
//!
//! Config resolution, the provider registry and the lifecycle bus shared by
//! the test runner and the CLI.

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod log;
pub mod registry;

// Re-export commonly used types
pub use config::{ConfigApi, ConfigCatalog, ConfigResolver, ConfigTree, EnvOverrides, Settings};
pub use error::{ConfigError, ConfigResult, LifecycleError, ProviderError, RegistryError};
pub use lifecycle::{LifecycleBus, Phase, PhaseEvent};
pub use log::Log;
pub use registry::{
    provider, Instance, PageObjects, ProviderApi, ProviderCatalog, ProviderFn, ProviderKey,
    ProviderKind, ProviderRegistry, RegistryBuilder,
};

/// Stagehand version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Config path used when none is given
pub const DEFAULT_CONFIG_PATH: &str = "stagehand.yml";

/// Environment variable naming the config path
pub const CONFIG_ENV_VAR: &str = "STAGEHAND_CONFIG";
