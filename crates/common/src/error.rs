//! Error types for the config, registry and lifecycle layers

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::lifecycle::Phase;
use crate::registry::ProviderKind;

/// Result type alias for config resolution
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Config layer errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config not found: {}", .path.display())]
    NotFound { path: PathBuf },

    #[error("Config parse error in {}: {reason}", .path.display())]
    Parse { path: PathBuf, reason: String },

    #[error("Invalid config {}: {reason}", .path.display())]
    Schema { path: PathBuf, reason: String },

    #[error("Config cycle detected: {}", display_chain(.chain))]
    Cycle { chain: Vec<PathBuf> },

    #[error("Config module {} failed", .path.display())]
    Module {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("IO error reading {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn display_chain(chain: &[PathBuf]) -> String {
    chain
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Registry layer errors
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Unknown provider: {kind} '{name}'")]
    UnknownProvider { kind: ProviderKind, name: String },

    #[error("Circular dependency: {}", display_cycle(.cycle))]
    CircularDependency { cycle: Vec<String> },

    #[error("Failed to construct {kind} '{name}'")]
    Construction {
        kind: ProviderKind,
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("{kind} '{name}' is not a {expected}")]
    TypeMismatch {
        kind: ProviderKind,
        name: String,
        expected: &'static str,
    },
}

fn display_cycle(cycle: &[String]) -> String {
    let mut names: Vec<&str> = cycle.iter().map(String::as_str).collect();
    if let Some(first) = cycle.first() {
        names.push(first);
    }
    names.join(" -> ")
}

/// Memoized registry failure.
///
/// Every caller that requests a failed provider receives a clone of the
/// same error value; `ptr_eq` tells whether two failures are one.
#[derive(Error, Debug, Clone)]
#[error(transparent)]
pub struct ProviderError(Arc<RegistryError>);

impl ProviderError {
    pub fn new(err: RegistryError) -> Self {
        Self(Arc::new(err))
    }

    pub fn kind(&self) -> &RegistryError {
        &self.0
    }

    pub fn ptr_eq(&self, other: &ProviderError) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Names forming the dependency cycle at the root of this failure, if any
    pub fn cycle(&self) -> Option<&[String]> {
        find_cycle(&self.0)
    }

    /// Name of the provider whose construction failed, if this is a construction failure
    pub fn provider_name(&self) -> Option<&str> {
        match &*self.0 {
            RegistryError::Construction { name, .. } => Some(name),
            _ => None,
        }
    }
}

impl From<RegistryError> for ProviderError {
    fn from(err: RegistryError) -> Self {
        Self::new(err)
    }
}

fn find_cycle(err: &RegistryError) -> Option<&[String]> {
    match err {
        RegistryError::CircularDependency { cycle } => Some(cycle),
        RegistryError::Construction { source, .. } => source.chain().find_map(|cause| {
            if let Some(shared) = cause.downcast_ref::<ProviderError>() {
                find_cycle(&shared.0)
            } else if let Some(inner) = cause.downcast_ref::<RegistryError>() {
                find_cycle(inner)
            } else {
                None
            }
        }),
        _ => None,
    }
}

/// Lifecycle layer errors
#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("{phase} handler #{index} failed")]
    Phase {
        phase: Phase,
        index: usize,
        #[source]
        source: anyhow::Error,
    },

    #[error("{} cleanup handler(s) failed", .failures.len())]
    Cleanup { failures: Vec<anyhow::Error> },

    #[error("Phase {phase} triggered after {after}")]
    OutOfOrder { phase: Phase, after: Phase },

    #[error("Phase {phase} can only be triggered once")]
    AlreadyTriggered { phase: Phase },
}

/// Render a caught panic payload as text
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
