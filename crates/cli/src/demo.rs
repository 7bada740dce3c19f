//! Demo catalog shipped with the `stagehand` binary
//!
//! Pairs with `demos/stagehand.yml`: the built-in services plus one smoke
//! suite that exercises them.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use stagehand_common::Log;
use stagehand_e2e::{builtin_providers, Catalog, Retry, TestApi};

pub const SMOKE_TEST_FILE: &str = "demos/suites/smoke";

pub fn catalog() -> Catalog {
    let mut catalog = Catalog::new();
    catalog.providers = builtin_providers();
    catalog.tests.register(SMOKE_TEST_FILE, smoke_suite);
    catalog
}

fn smoke_suite(api: &TestApi) -> anyhow::Result<()> {
    let services = api.services().clone();

    api.describe("smoke", |s| {
        let hook_services = services.clone();
        s.before(move |_| {
            let services = hook_services.clone();
            async move {
                let log = services.get_service::<Log>("log").await?;
                log.info("starting smoke checks");
                Ok(())
            }
        });

        let config_services = services.clone();
        s.it("resolves the app server url", move |_| {
            let services = config_services.clone();
            async move {
                let config = services.get_config().await?;
                let url = config.settings().servers.app.url();
                anyhow::ensure!(url.starts_with("http"), "unexpected app url {}", url);
                Ok(())
            }
        });

        let retry_services = services.clone();
        s.it("retries until the app settles", move |_| {
            let services = retry_services.clone();
            async move {
                let retry = services.get_service::<Retry>("retry").await?;
                let attempts = Arc::new(AtomicUsize::new(0));
                retry
                    .try_until(|| {
                        let attempts = attempts.clone();
                        async move {
                            if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                                anyhow::bail!("app still starting");
                            }
                            Ok(())
                        }
                    })
                    .await
            }
        });

        s.it_skip("archives data-service fixtures");
    });

    Ok(())
}
