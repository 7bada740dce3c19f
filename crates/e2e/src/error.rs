//! Error types for test loading and run orchestration

use std::path::PathBuf;

use thiserror::Error;

use stagehand_common::{ConfigError, LifecycleError, ProviderError};

/// Test loader errors
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Test file not found: {}", .path.display())]
    NotFound { path: PathBuf },

    #[error("{} declares no top-level suite", .path.display())]
    NoTopLevelSuite { path: PathBuf },

    #[error("{} declares {count} top-level suites; exactly one is allowed", .path.display())]
    MultipleTopLevelSuites { path: PathBuf, count: usize },

    #[error("Test file cycle: {}", display_chain(.chain))]
    Cycle { chain: Vec<PathBuf> },

    #[error("Test provider {} failed", .path.display())]
    Provider {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },
}

fn display_chain(chain: &[PathBuf]) -> String {
    chain
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}

#[derive(Error, Debug)]
pub enum E2eError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error("Invalid grep pattern: {0}")]
    Regex(#[from] regex::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type E2eResult<T> = Result<T, E2eError>;
