//! Scoped log facade handed to config modules and resolved as the `log` service

use std::sync::Arc;

use tracing::{debug, error, info, trace, warn};

/// A `tracing` front-end that tags every line with a scope name
#[derive(Debug, Clone)]
pub struct Log {
    scope: Arc<str>,
}

impl Log {
    pub fn new(scope: impl Into<String>) -> Self {
        Self {
            scope: Arc::from(scope.into()),
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Derive a log for a nested scope (`parent:child`)
    pub fn child(&self, name: &str) -> Self {
        Self::new(format!("{}:{}", self.scope, name))
    }

    pub fn info(&self, message: impl AsRef<str>) {
        info!(scope = %self.scope, "{}", message.as_ref());
    }

    pub fn success(&self, message: impl AsRef<str>) {
        info!(scope = %self.scope, "✓ {}", message.as_ref());
    }

    pub fn debug(&self, message: impl AsRef<str>) {
        debug!(scope = %self.scope, "{}", message.as_ref());
    }

    pub fn verbose(&self, message: impl AsRef<str>) {
        trace!(scope = %self.scope, "{}", message.as_ref());
    }

    pub fn warning(&self, message: impl AsRef<str>) {
        warn!(scope = %self.scope, "{}", message.as_ref());
    }

    pub fn error(&self, message: impl AsRef<str>) {
        error!(scope = %self.scope, "{}", message.as_ref());
    }
}
