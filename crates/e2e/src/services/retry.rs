//! Retry helper for eventually-consistent UI and data checks

use std::future::Future;
use std::time::{Duration, Instant};

use anyhow::Context;

use stagehand_common::{provider, Log, ProviderApi, ProviderFn};

pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct Retry {
    timeout: Duration,
    interval: Duration,
    log: Log,
}

impl Retry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            interval: DEFAULT_RETRY_INTERVAL,
            log: Log::new("retry"),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Default bound used by `try_until` and `wait_for`
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Call `block` until it succeeds or `timeout` elapses.
    /// On timeout the last error is returned with the attempt count attached.
    pub async fn try_for_time<T, F, Fut>(&self, timeout: Duration, mut block: F) -> anyhow::Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let start = Instant::now();
        let mut attempt = 0;

        loop {
            attempt += 1;
            match block().await {
                Ok(value) => return Ok(value),
                Err(err) if start.elapsed() >= timeout => {
                    return Err(err.context(format!(
                        "retry timed out after {} ms ({} attempts)",
                        timeout.as_millis(),
                        attempt
                    )));
                }
                Err(err) => {
                    self.log.debug(format!("attempt {} failed: {:#}", attempt, err));
                    tokio::time::sleep(self.interval).await;
                }
            }
        }
    }

    pub async fn try_until<T, F, Fut>(&self, block: F) -> anyhow::Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.try_for_time(self.timeout, block).await
    }

    /// Poll `predicate` until it reports `true`
    pub async fn wait_for<F, Fut>(&self, description: &str, mut predicate: F) -> anyhow::Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<bool>>,
    {
        self.log.debug(format!(
            "Waiting up to {} ms for {}",
            self.timeout.as_millis(),
            description
        ));

        self.try_for_time(self.timeout, || {
            let check = predicate();
            async move {
                if check.await? {
                    Ok(())
                } else {
                    anyhow::bail!("{} not satisfied", description)
                }
            }
        })
        .await
        .with_context(|| format!("timed out waiting for {}", description))
    }
}

/// `RetryProvider`: bounded by `timeouts.try`
pub fn retry_provider() -> ProviderFn {
    provider(|api: ProviderApi| async move {
        let config = api.get_config().await?;
        Ok(Retry::new(Duration::from_millis(config.settings().timeouts.retry)))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn quick(timeout_ms: u64) -> Retry {
        Retry::new(Duration::from_millis(timeout_ms)).with_interval(Duration::from_millis(5))
    }

    #[tokio::test]
    async fn test_try_until_eventually_succeeds() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let value = quick(1_000)
            .try_until(move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    anyhow::bail!("not yet");
                }
                Ok(n)
            })
            .await
            .unwrap();
        assert_eq!(value, 3);
    }

    #[tokio::test]
    async fn test_try_for_time_reports_last_error() {
        let err = quick(1_000)
            .try_for_time(Duration::from_millis(30), || async {
                Err::<(), _>(anyhow::anyhow!("element not found"))
            })
            .await
            .unwrap_err();

        let message = format!("{:#}", err);
        assert!(message.contains("retry timed out"));
        assert!(message.contains("element not found"));
    }

    #[tokio::test]
    async fn test_wait_for_predicate() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        quick(1_000)
            .wait_for("index to refresh", move || async move {
                Ok(calls.fetch_add(1, Ordering::SeqCst) >= 2)
            })
            .await
            .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 3);

        let err = quick(20)
            .wait_for("never", || async { Ok(false) })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out waiting for never"));
    }
}
