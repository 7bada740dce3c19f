//! Built-in services
//!
//! | factory id      | instance  |
//! |-----------------|-----------|
//! | `LogProvider`   | [`Log`]   |
//! | `RetryProvider` | [`Retry`] |

mod log;
mod retry;

pub use self::log::log_provider;
pub use self::retry::{retry_provider, Retry, DEFAULT_RETRY_INTERVAL};
pub use stagehand_common::Log;

use stagehand_common::ProviderCatalog;

pub const LOG_PROVIDER: &str = "LogProvider";
pub const RETRY_PROVIDER: &str = "RetryProvider";

/// Catalog holding every built-in factory
pub fn builtin_providers() -> ProviderCatalog {
    let mut catalog = ProviderCatalog::new();
    catalog
        .register(LOG_PROVIDER, log_provider())
        .register(RETRY_PROVIDER, retry_provider());
    catalog
}
