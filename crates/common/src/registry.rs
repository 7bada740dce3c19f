//! Provider Registry
//!
//! Name-keyed lazy singletons. The first request for a name starts its
//! factory as a tokio task and parks a shared handle to it in the cache;
//! every later request, concurrent or not, awaits that same handle. The
//! settled value (or error) is memoized for the rest of the run.
//!
//! Each factory receives a [`ProviderApi`] that can request other names.
//! While a factory awaits a dependency the registry records a wait edge
//! `requester -> dependency`; a request that would close a loop in that
//! graph fails with `CircularDependency` rather than deadlocking.

use std::any::Any;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};

use futures::future::{try_join_all, BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::ConfigTree;
use crate::error::{panic_message, ConfigError, ConfigResult, ProviderError, RegistryError};
use crate::lifecycle::LifecycleBus;

/// A constructed provider value
pub type Instance = Arc<dyn Any + Send + Sync>;

/// An asynchronous provider factory
pub type ProviderFn =
    Arc<dyn Fn(ProviderApi) -> BoxFuture<'static, anyhow::Result<Instance>> + Send + Sync>;

/// Wrap a typed async factory as a [`ProviderFn`]
pub fn provider<F, Fut, T>(factory: F) -> ProviderFn
where
    F: Fn(ProviderApi) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    T: Send + Sync + 'static,
{
    Arc::new(move |api| {
        let construction = factory(api);
        async move {
            let value = construction.await?;
            Ok::<_, anyhow::Error>(Arc::new(value) as Instance)
        }
        .boxed()
    })
}

/// Namespace of a registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Service,
    PageObject,
    Config,
    Test,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProviderKind::Service => "service",
            ProviderKind::PageObject => "page object",
            ProviderKind::Config => "config",
            ProviderKind::Test => "test",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProviderKey {
    pub kind: ProviderKind,
    pub name: String,
}

impl ProviderKey {
    pub fn new(kind: ProviderKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }
}

impl fmt::Display for ProviderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} '{}'", self.kind, self.name)
    }
}

/// Provider factories addressable by id (`LogProvider`, `RetryProvider`, ...)
#[derive(Clone, Default)]
pub struct ProviderCatalog {
    factories: HashMap<String, ProviderFn>,
}

impl ProviderCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: impl Into<String>, factory: ProviderFn) -> &mut Self {
        self.factories.insert(id.into(), factory);
        self
    }

    pub fn get(&self, id: &str) -> Option<ProviderFn> {
        self.factories.get(id).cloned()
    }

    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// Add every factory of `other`, replacing ids that already exist
    pub fn extend(&mut self, other: ProviderCatalog) -> &mut Self {
        self.factories.extend(other.factories);
        self
    }
}

/// Collects registrations before the registry is sealed
#[derive(Default)]
pub struct RegistryBuilder {
    registrations: HashMap<ProviderKey, ProviderFn>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every configured service and page object, plus the config itself
    pub fn from_config(config: Arc<ConfigTree>, catalog: &ProviderCatalog) -> ConfigResult<Self> {
        let mut builder = Self::new();
        let settings = config.settings();

        let sections = [
            (ProviderKind::Service, "services", &settings.services),
            (ProviderKind::PageObject, "page_objects", &settings.page_objects),
        ];
        for (kind, section, entries) in sections {
            for (name, id) in entries {
                let factory = catalog.get(id).ok_or_else(|| ConfigError::Schema {
                    path: config.path().to_path_buf(),
                    reason: format!("{}.{} references unknown provider '{}'", section, name, id),
                })?;
                builder.register(name.clone(), kind, factory);
            }
        }

        let shared = config.clone();
        let config_factory: ProviderFn = Arc::new(move |_api| {
            let config = shared.clone();
            async move { Ok::<_, anyhow::Error>(config as Instance) }.boxed()
        });
        builder.register("config", ProviderKind::Config, config_factory.clone());
        if !settings.services.contains_key("config") {
            builder.register("config", ProviderKind::Service, config_factory);
        }

        Ok(builder)
    }

    /// Add a registration; a later registration of the same key replaces the earlier one
    pub fn register(&mut self, name: impl Into<String>, kind: ProviderKind, factory: ProviderFn) -> &mut Self {
        let key = ProviderKey::new(kind, name);
        if self.registrations.insert(key.clone(), factory).is_some() {
            debug!("Replacing registration for {}", key);
        }
        self
    }

    pub fn contains(&self, kind: ProviderKind, name: &str) -> bool {
        self.registrations.contains_key(&ProviderKey::new(kind, name))
    }

    /// Seal the registrations
    pub fn build(self, lifecycle: LifecycleBus) -> ProviderRegistry {
        ProviderRegistry {
            inner: Arc::new(RegistryInner {
                registrations: self.registrations,
                state: Mutex::new(CacheState::default()),
                lifecycle,
            }),
        }
    }
}

type Construction = Shared<BoxFuture<'static, Result<Instance, ProviderError>>>;

#[derive(Clone)]
enum Entry {
    Pending(Construction),
    Resolved(Instance),
    Failed(ProviderError),
}

/// Observable state of a cache entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    Pending,
    Resolved,
    Failed,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<ProviderKey, Entry>,
    /// requester -> dependency -> number of in-flight waits
    waits: HashMap<ProviderKey, HashMap<ProviderKey, usize>>,
    settled: Vec<ProviderKey>,
}

impl CacheState {
    fn add_wait(&mut self, from: &ProviderKey, to: &ProviderKey) {
        *self
            .waits
            .entry(from.clone())
            .or_default()
            .entry(to.clone())
            .or_insert(0) += 1;
    }

    fn remove_wait(&mut self, from: &ProviderKey, to: &ProviderKey) {
        let Some(targets) = self.waits.get_mut(from) else {
            return;
        };
        if let Some(count) = targets.get_mut(to) {
            *count -= 1;
            if *count == 0 {
                targets.remove(to);
            }
        }
        if targets.is_empty() {
            self.waits.remove(from);
        }
    }

    /// The cycle `requester` would close by waiting on `target`, in wait order
    fn find_cycle(&self, requester: &ProviderKey, target: &ProviderKey) -> Option<Vec<String>> {
        if requester == target {
            return Some(vec![target.name.clone()]);
        }

        let mut path = vec![target.clone()];
        let mut visited = HashSet::new();
        if !self.reaches(target, requester, &mut path, &mut visited) {
            return None;
        }

        let mut cycle = vec![requester.name.clone()];
        cycle.extend(path.into_iter().map(|key| key.name));
        Some(cycle)
    }

    fn reaches(
        &self,
        from: &ProviderKey,
        goal: &ProviderKey,
        path: &mut Vec<ProviderKey>,
        visited: &mut HashSet<ProviderKey>,
    ) -> bool {
        if !visited.insert(from.clone()) {
            return false;
        }
        let Some(targets) = self.waits.get(from) else {
            return false;
        };
        for next in targets.keys() {
            if next == goal {
                return true;
            }
            path.push(next.clone());
            if self.reaches(next, goal, path, visited) {
                return true;
            }
            path.pop();
        }
        false
    }
}

/// A recorded `from -> to` wait, removed when the waiting request completes or is dropped
struct WaitEdge<'a> {
    state: &'a Mutex<CacheState>,
    from: ProviderKey,
    to: ProviderKey,
}

impl Drop for WaitEdge<'_> {
    fn drop(&mut self) {
        self.state.lock().remove_wait(&self.from, &self.to);
    }
}

struct RegistryInner {
    registrations: HashMap<ProviderKey, ProviderFn>,
    state: Mutex<CacheState>,
    lifecycle: LifecycleBus,
}

impl RegistryInner {
    fn settle(&self, key: &ProviderKey, outcome: &Result<Instance, ProviderError>) {
        let mut state = self.state.lock();
        state.waits.remove(key);

        if !matches!(state.entries.get(key), Some(Entry::Pending(_))) {
            return;
        }

        let entry = match outcome {
            Ok(instance) => {
                debug!("Resolved {}", key);
                Entry::Resolved(instance.clone())
            }
            Err(err) => {
                warn!("{}: {:#}", key, anyhow::Error::new(err.clone()));
                Entry::Failed(err.clone())
            }
        };
        state.entries.insert(key.clone(), entry);
        state.settled.push(key.clone());
    }
}

/// Lazy singleton registry for one run
#[derive(Clone)]
pub struct ProviderRegistry {
    inner: Arc<RegistryInner>,
}

impl ProviderRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// Capability object for callers outside any provider (runner, tests)
    pub fn api(&self) -> ProviderApi {
        ProviderApi {
            registry: self.clone(),
            requester: None,
        }
    }

    pub fn lifecycle(&self) -> &LifecycleBus {
        &self.inner.lifecycle
    }

    pub async fn get_service<T: Any + Send + Sync>(&self, name: &str) -> Result<Arc<T>, ProviderError> {
        self.api().get_service(name).await
    }

    pub async fn get_page_objects(&self, names: &[&str]) -> Result<PageObjects, ProviderError> {
        self.api().get_page_objects(names).await
    }

    pub async fn get_config(&self) -> Result<Arc<ConfigTree>, ProviderError> {
        self.api().get_config().await
    }

    pub async fn resolve(&self, kind: ProviderKind, name: &str) -> Result<Instance, ProviderError> {
        self.resolve_from(ProviderKey::new(kind, name), None).await
    }

    pub fn is_registered(&self, kind: ProviderKind, name: &str) -> bool {
        self.inner
            .registrations
            .contains_key(&ProviderKey::new(kind, name))
    }

    /// Registered names of one kind, sorted
    pub fn names(&self, kind: ProviderKind) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .registrations
            .keys()
            .filter(|key| key.kind == kind)
            .map(|key| key.name.clone())
            .collect();
        names.sort_unstable();
        names
    }

    pub fn status(&self, kind: ProviderKind, name: &str) -> Option<EntryStatus> {
        let state = self.inner.state.lock();
        state
            .entries
            .get(&ProviderKey::new(kind, name))
            .map(|entry| match entry {
                Entry::Pending(_) => EntryStatus::Pending,
                Entry::Resolved(_) => EntryStatus::Resolved,
                Entry::Failed(_) => EntryStatus::Failed,
            })
    }

    /// Settled keys in the order they settled
    pub fn resolved(&self) -> Vec<ProviderKey> {
        self.inner.state.lock().settled.clone()
    }

    /// Drop every cached instance, newest first, and return the released keys
    pub fn clear(&self) -> Vec<ProviderKey> {
        let released: Vec<ProviderKey> = {
            let mut state = self.inner.state.lock();
            let settled = std::mem::take(&mut state.settled);
            state.entries.clear();
            state.waits.clear();
            settled.into_iter().rev().collect()
        };

        for key in &released {
            debug!("Released {}", key);
        }
        if !released.is_empty() {
            info!("Released {} provider instance(s)", released.len());
        }
        released
    }

    async fn resolve_from(
        &self,
        key: ProviderKey,
        requester: Option<&ProviderKey>,
    ) -> Result<Instance, ProviderError> {
        let construction = {
            let mut state = self.inner.state.lock();
            match state.entries.get(&key).cloned() {
                Some(Entry::Resolved(instance)) => return Ok(instance),
                Some(Entry::Failed(err)) => return Err(err),
                Some(Entry::Pending(construction)) => {
                    if let Some(requester) = requester {
                        if let Some(cycle) = state.find_cycle(requester, &key) {
                            warn!("Circular dependency: {} requested {}", requester, key);
                            return Err(ProviderError::new(RegistryError::CircularDependency { cycle }));
                        }
                        state.add_wait(requester, &key);
                    }
                    construction
                }
                None => {
                    let factory = self.inner.registrations.get(&key).cloned().ok_or_else(|| {
                        ProviderError::new(RegistryError::UnknownProvider {
                            kind: key.kind,
                            name: key.name.clone(),
                        })
                    })?;
                    let construction = self.construct(key.clone(), factory);
                    state.entries.insert(key.clone(), Entry::Pending(construction.clone()));
                    if let Some(requester) = requester {
                        state.add_wait(requester, &key);
                    }
                    construction
                }
            }
        };

        let _edge = requester.map(|requester| WaitEdge {
            state: &self.inner.state,
            from: requester.clone(),
            to: key.clone(),
        });
        construction.await
    }

    /// Start the factory on its own task so no caller can cancel it
    fn construct(&self, key: ProviderKey, factory: ProviderFn) -> Construction {
        debug!("Constructing {}", key);

        let api = ProviderApi {
            registry: self.clone(),
            requester: Some(key.clone()),
        };
        let registry: Weak<RegistryInner> = Arc::downgrade(&self.inner);
        let task_key = key.clone();
        let task_registry = registry.clone();

        let task = tokio::spawn(async move {
            let outcome = match AssertUnwindSafe(async move { factory(api).await })
                .catch_unwind()
                .await
            {
                Ok(result) => result,
                Err(payload) => Err(anyhow::anyhow!(
                    "provider panicked: {}",
                    panic_message(payload.as_ref())
                )),
            };
            let outcome = outcome.map_err(|source| construction_error(&task_key, source));
            if let Some(registry) = task_registry.upgrade() {
                registry.settle(&task_key, &outcome);
            }
            outcome
        });

        async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(join_error) => {
                    let outcome = Err(construction_error(
                        &key,
                        anyhow::anyhow!("provider task failed: {}", join_error),
                    ));
                    if let Some(registry) = registry.upgrade() {
                        registry.settle(&key, &outcome);
                    }
                    outcome
                }
            }
        }
        .boxed()
        .shared()
    }
}

fn construction_error(key: &ProviderKey, source: anyhow::Error) -> ProviderError {
    ProviderError::new(RegistryError::Construction {
        kind: key.kind,
        name: key.name.clone(),
        source,
    })
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<String> = self.inner.registrations.keys().map(|k| k.to_string()).collect();
        keys.sort();
        f.debug_struct("ProviderRegistry").field("registrations", &keys).finish()
    }
}

/// Capability object passed to every provider invocation.
///
/// A read-only view of the registry: it can request instances and reach
/// the lifecycle bus, nothing else.
#[derive(Clone)]
pub struct ProviderApi {
    registry: ProviderRegistry,
    requester: Option<ProviderKey>,
}

impl ProviderApi {
    /// The provider this api was handed to, if any
    pub fn requester(&self) -> Option<&ProviderKey> {
        self.requester.as_ref()
    }

    pub fn lifecycle(&self) -> &LifecycleBus {
        self.registry.lifecycle()
    }

    pub async fn resolve(&self, kind: ProviderKind, name: &str) -> Result<Instance, ProviderError> {
        self.registry
            .resolve_from(ProviderKey::new(kind, name), self.requester.as_ref())
            .await
    }

    pub async fn get_service<T: Any + Send + Sync>(&self, name: &str) -> Result<Arc<T>, ProviderError> {
        let instance = self.resolve(ProviderKind::Service, name).await?;
        downcast(ProviderKind::Service, name, instance)
    }

    /// Resolve several page objects concurrently.
    ///
    /// The first failure fails the call; the other constructions keep
    /// running and stay cached for later callers.
    pub async fn get_page_objects(&self, names: &[&str]) -> Result<PageObjects, ProviderError> {
        let lookups = names.iter().map(|name| async move {
            let instance = self.resolve(ProviderKind::PageObject, name).await?;
            Ok::<_, ProviderError>((name.to_string(), instance))
        });
        let objects = try_join_all(lookups).await?;
        Ok(PageObjects {
            objects: objects.into_iter().collect(),
        })
    }

    pub async fn get_config(&self) -> Result<Arc<ConfigTree>, ProviderError> {
        let instance = self.resolve(ProviderKind::Config, "config").await?;
        downcast(ProviderKind::Config, "config", instance)
    }
}

impl fmt::Debug for ProviderApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderApi")
            .field("requester", &self.requester)
            .finish()
    }
}

/// Page objects keyed by name
#[derive(Clone, Default)]
pub struct PageObjects {
    objects: BTreeMap<String, Instance>,
}

impl PageObjects {
    pub fn get<T: Any + Send + Sync>(&self, name: &str) -> Result<Arc<T>, ProviderError> {
        let instance = self.objects.get(name).cloned().ok_or_else(|| {
            ProviderError::new(RegistryError::UnknownProvider {
                kind: ProviderKind::PageObject,
                name: name.to_string(),
            })
        })?;
        downcast(ProviderKind::PageObject, name, instance)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.objects.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

fn downcast<T: Any + Send + Sync>(
    kind: ProviderKind,
    name: &str,
    instance: Instance,
) -> Result<Arc<T>, ProviderError> {
    instance.downcast::<T>().map_err(|_| {
        ProviderError::new(RegistryError::TypeMismatch {
            kind,
            name: name.to_string(),
            expected: std::any::type_name::<T>(),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnvOverrides;
    use serde_json::json;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Debug, PartialEq)]
    struct Browser {
        id: usize,
    }

    fn counted<T, F>(calls: &Arc<AtomicUsize>, make: F) -> ProviderFn
    where
        T: Send + Sync + 'static,
        F: Fn(usize) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        let calls = calls.clone();
        let make = Arc::new(make);
        provider(move |_api| {
            let calls = calls.clone();
            let make = make.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                tokio::time::sleep(Duration::from_millis(20)).await;
                make(n)
            }
        })
    }

    fn depends_on(calls: &Arc<AtomicUsize>, dependency: &'static str) -> ProviderFn {
        let calls = calls.clone();
        provider(move |api: ProviderApi| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::task::yield_now().await;
                let dep = api.get_service::<Browser>(dependency).await?;
                Ok(Browser { id: dep.id + 1 })
            }
        })
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_construction() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut builder = ProviderRegistry::builder();
        builder.register("browser", ProviderKind::Service, counted(&calls, |n| Ok(Browser { id: n })));
        let registry = builder.build(LifecycleBus::new());

        let (a, b) = tokio::join!(
            registry.get_service::<Browser>("browser"),
            registry.get_service::<Browser>("browser")
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&a, &b));

        let c = registry.get_service::<Browser>("browser").await.unwrap();
        assert!(Arc::ptr_eq(&a, &c));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_is_memoized() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut builder = ProviderRegistry::builder();
        builder.register(
            "es",
            ProviderKind::Service,
            counted::<Browser, _>(&calls, |_| Err(anyhow::anyhow!("connection refused"))),
        );
        let registry = builder.build(LifecycleBus::new());

        let (first, second) = tokio::join!(
            registry.get_service::<Browser>("es"),
            registry.get_service::<Browser>("es")
        );
        let (first, second) = (first.unwrap_err(), second.unwrap_err());
        let third = registry.get_service::<Browser>("es").await.unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(first.ptr_eq(&second));
        assert!(first.ptr_eq(&third));
        assert_eq!(first.provider_name(), Some("es"));
        assert_eq!(registry.status(ProviderKind::Service, "es"), Some(EntryStatus::Failed));
    }

    #[tokio::test]
    async fn test_unknown_provider() {
        let registry = ProviderRegistry::builder().build(LifecycleBus::new());
        let err = registry.get_service::<Browser>("missing").await.unwrap_err();
        assert!(matches!(err.kind(), RegistryError::UnknownProvider { .. }));
        assert_eq!(registry.status(ProviderKind::Service, "missing"), None);
    }

    #[tokio::test]
    async fn test_self_request_is_a_cycle() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut builder = ProviderRegistry::builder();
        builder.register("loop", ProviderKind::Service, depends_on(&calls, "loop"));
        let registry = builder.build(LifecycleBus::new());

        let err = registry.get_service::<Browser>("loop").await.unwrap_err();
        assert_eq!(err.cycle(), Some(&["loop".to_string()][..]));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_mutual_dependency_cycle() {
        let a_calls = Arc::new(AtomicUsize::new(0));
        let b_calls = Arc::new(AtomicUsize::new(0));
        let mut builder = ProviderRegistry::builder();
        builder.register("a", ProviderKind::Service, depends_on(&a_calls, "b"));
        builder.register("b", ProviderKind::Service, depends_on(&b_calls, "a"));
        let registry = builder.build(LifecycleBus::new());

        let err = registry.get_service::<Browser>("a").await.unwrap_err();
        let mut cycle = err.cycle().expect("cycle in error chain").to_vec();
        cycle.sort();
        assert_eq!(cycle, vec!["a", "b"]);

        let again = registry.get_service::<Browser>("a").await.unwrap_err();
        assert!(err.ptr_eq(&again));
        assert_eq!(a_calls.load(Ordering::SeqCst), 1);
        assert_eq!(b_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transitive_cycle_names_every_member() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut builder = ProviderRegistry::builder();
        builder.register("a", ProviderKind::Service, depends_on(&calls, "b"));
        builder.register("b", ProviderKind::Service, depends_on(&calls, "c"));
        builder.register("c", ProviderKind::Service, depends_on(&calls, "a"));
        let registry = builder.build(LifecycleBus::new());

        let err = registry.get_service::<Browser>("a").await.unwrap_err();
        let cycle = err.cycle().expect("cycle in error chain");
        assert_eq!(cycle, &["c", "a", "b"]);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cycle_across_concurrent_callers() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut builder = ProviderRegistry::builder();
        builder.register("a", ProviderKind::Service, depends_on(&calls, "b"));
        builder.register("b", ProviderKind::Service, depends_on(&calls, "a"));
        let registry = builder.build(LifecycleBus::new());

        let (a, b) = tokio::time::timeout(Duration::from_secs(5), async {
            tokio::join!(
                registry.get_service::<Browser>("a"),
                registry.get_service::<Browser>("b")
            )
        })
        .await
        .expect("cycle must not deadlock");

        assert!(a.unwrap_err().cycle().is_some());
        assert!(b.unwrap_err().cycle().is_some());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_dependency_failure_keeps_causal_chain() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut builder = ProviderRegistry::builder();
        builder.register("app", ProviderKind::Service, depends_on(&calls, "driver"));
        builder.register(
            "driver",
            ProviderKind::Service,
            counted::<Browser, _>(&calls, |_| Err(anyhow::anyhow!("chromedriver missing"))),
        );
        let registry = builder.build(LifecycleBus::new());

        let err = registry.get_service::<Browser>("app").await.unwrap_err();
        assert_eq!(err.provider_name(), Some("app"));

        let chain: Vec<String> = anyhow::Error::new(err).chain().map(|e| e.to_string()).collect();
        assert!(chain.iter().any(|m| m.contains("'driver'")));
        assert!(chain.iter().any(|m| m == "chromedriver missing"));

        let driver_err = registry.get_service::<Browser>("driver").await.unwrap_err();
        assert_eq!(driver_err.provider_name(), Some("driver"));
    }

    #[tokio::test]
    async fn test_page_objects_partial_failure() {
        let good_calls = Arc::new(AtomicUsize::new(0));
        let bad_calls = Arc::new(AtomicUsize::new(0));
        let mut builder = ProviderRegistry::builder();
        builder.register("header", ProviderKind::PageObject, counted(&good_calls, |n| Ok(Browser { id: n })));
        builder.register(
            "broken",
            ProviderKind::PageObject,
            provider(move |_api| {
                let calls = bad_calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<Browser, _>(anyhow::anyhow!("no such page"))
                }
            }),
        );
        let registry = builder.build(LifecycleBus::new());

        let err = registry.get_page_objects(&["header", "broken"]).await.err().expect("partial failure");
        assert_eq!(err.provider_name(), Some("broken"));

        tokio::time::sleep(Duration::from_millis(50)).await;
        let objects = registry.get_page_objects(&["header"]).await.unwrap();
        assert_eq!(objects.get::<Browser>("header").unwrap().id, 1);
        assert_eq!(good_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_services_and_page_objects_are_separate_namespaces() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut builder = ProviderRegistry::builder();
        builder.register("common", ProviderKind::Service, counted(&calls, |_| Ok(Browser { id: 1 })));
        builder.register("common", ProviderKind::PageObject, counted(&calls, |_| Ok(Browser { id: 2 })));
        let registry = builder.build(LifecycleBus::new());

        let service = registry.get_service::<Browser>("common").await.unwrap();
        let pages = registry.get_page_objects(&["common"]).await.unwrap();
        assert_eq!(service.id, 1);
        assert_eq!(pages.get::<Browser>("common").unwrap().id, 2);
        assert_eq!(pages.len(), 1);
    }

    #[tokio::test]
    async fn test_type_mismatch() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut builder = ProviderRegistry::builder();
        builder.register("browser", ProviderKind::Service, counted(&calls, |n| Ok(Browser { id: n })));
        let registry = builder.build(LifecycleBus::new());

        let err = registry.get_service::<String>("browser").await.unwrap_err();
        assert!(matches!(err.kind(), RegistryError::TypeMismatch { .. }));
    }

    #[tokio::test]
    async fn test_panicking_factory_is_construction_error() {
        let mut builder = ProviderRegistry::builder();
        builder.register(
            "flaky",
            ProviderKind::Service,
            provider(|_api| async move {
                if true {
                    panic!("factory exploded");
                }
                Ok(Browser { id: 0 })
            }),
        );
        let registry = builder.build(LifecycleBus::new());

        let err = registry.get_service::<Browser>("flaky").await.unwrap_err();
        let RegistryError::Construction { source, .. } = err.kind() else {
            panic!("expected construction error");
        };
        assert!(source.to_string().contains("factory exploded"));
    }

    #[tokio::test]
    async fn test_dropped_caller_does_not_cancel_construction() {
        let finished = Arc::new(AtomicBool::new(false));
        let calls = Arc::new(AtomicUsize::new(0));
        let flag = finished.clone();
        let counter = calls.clone();
        let mut builder = ProviderRegistry::builder();
        builder.register(
            "slow",
            ProviderKind::Service,
            provider(move |_api| {
                let flag = flag.clone();
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    flag.store(true, Ordering::SeqCst);
                    Ok(Browser { id: 7 })
                }
            }),
        );
        let registry = builder.build(LifecycleBus::new());

        let abandoned =
            tokio::time::timeout(Duration::from_millis(5), registry.get_service::<Browser>("slow")).await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(finished.load(Ordering::SeqCst));

        let browser = registry.get_service::<Browser>("slow").await.unwrap();
        assert_eq!(browser.id, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_abandoned_wait_is_not_a_cycle() {
        let mut builder = ProviderRegistry::builder();
        builder.register(
            "a",
            ProviderKind::Service,
            provider(|api: ProviderApi| async move {
                let gave_up =
                    tokio::time::timeout(Duration::from_millis(5), api.get_service::<Browser>("b")).await;
                assert!(gave_up.is_err());
                tokio::time::sleep(Duration::from_millis(60)).await;
                Ok(Browser { id: 1 })
            }),
        );
        builder.register(
            "b",
            ProviderKind::Service,
            provider(|api: ProviderApi| async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                let a = api.get_service::<Browser>("a").await?;
                Ok(Browser { id: a.id + 1 })
            }),
        );
        let registry = builder.build(LifecycleBus::new());

        let a = registry.get_service::<Browser>("a").await.unwrap();
        let b = registry.get_service::<Browser>("b").await.unwrap();
        assert_eq!(a.id, 1);
        assert_eq!(b.id, 2);
    }

    #[tokio::test]
    async fn test_from_config_registers_services_and_config() {
        let config = Arc::new(
            ConfigTree::build(
                PathBuf::from("ftr.yml"),
                json!({"services": {"browser": "BrowserProvider"}, "timeouts": {"try": 1500}}),
                &EnvOverrides::default(),
            )
            .unwrap(),
        );
        let calls = Arc::new(AtomicUsize::new(0));
        let mut catalog = ProviderCatalog::new();
        catalog.register("BrowserProvider", counted(&calls, |n| Ok(Browser { id: n })));

        let registry = RegistryBuilder::from_config(config.clone(), &catalog)
            .unwrap()
            .build(LifecycleBus::new());

        assert_eq!(registry.names(ProviderKind::Service), vec!["browser", "config"]);
        let resolved = registry.get_config().await.unwrap();
        assert!(Arc::ptr_eq(&resolved, &config));
        let via_service = registry.get_service::<ConfigTree>("config").await.unwrap();
        assert_eq!(via_service.settings().timeouts.retry, 1500);
    }

    #[tokio::test]
    async fn test_from_config_unknown_factory() {
        let config = Arc::new(
            ConfigTree::build(
                PathBuf::from("ftr.yml"),
                json!({"page_objects": {"home": "HomePageProvider"}}),
                &EnvOverrides::default(),
            )
            .unwrap(),
        );
        let err = RegistryBuilder::from_config(config, &ProviderCatalog::new())
            .err()
            .expect("unknown factory id");
        assert!(err.to_string().contains("HomePageProvider"));
    }

    #[tokio::test]
    async fn test_clear_releases_newest_first() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut builder = ProviderRegistry::builder();
        builder.register("base", ProviderKind::Service, counted(&calls, |n| Ok(Browser { id: n })));
        builder.register("top", ProviderKind::Service, depends_on(&calls, "base"));
        let registry = builder.build(LifecycleBus::new());

        registry.get_service::<Browser>("top").await.unwrap();
        let released: Vec<String> = registry.clear().into_iter().map(|k| k.name).collect();
        assert_eq!(released, vec!["top", "base"]);
        assert_eq!(registry.status(ProviderKind::Service, "top"), None);
    }

    #[tokio::test]
    async fn test_factories_reach_lifecycle() {
        let mut builder = ProviderRegistry::builder();
        builder.register(
            "browser",
            ProviderKind::Service,
            provider(|api: ProviderApi| async move {
                api.lifecycle().on(crate::lifecycle::Phase::Cleanup, |_| async { Ok(()) });
                Ok(Browser { id: 1 })
            }),
        );
        let lifecycle = LifecycleBus::new();
        let registry = builder.build(lifecycle.clone());

        registry.get_service::<Browser>("browser").await.unwrap();
        assert_eq!(lifecycle.handler_count(crate::lifecycle::Phase::Cleanup), 1);
    }
}
