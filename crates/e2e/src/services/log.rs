use stagehand_common::{provider, Log, ProviderFn};

/// Scope of the shared `log` service
pub const LOG_SCOPE: &str = "stagehand";

pub fn log_provider() -> ProviderFn {
    provider(|_api| async { Ok(Log::new(LOG_SCOPE)) })
}
