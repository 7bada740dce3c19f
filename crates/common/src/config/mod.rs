//! Config Resolver
//!
//! Resolves a config path into an immutable [`ConfigTree`]. A path names
//! either an in-process config module registered in a [`ConfigCatalog`] or
//! a YAML/JSON/TOML file on disk. Bases are pulled in with a top-level
//! `extends:` key (files) or [`ConfigApi::read_config_file`] (modules) and
//! merged underneath the child document, recursively and cycle-checked.

mod env;
mod merge;
mod tree;

use std::collections::HashMap;
use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info};

pub use env::EnvOverrides;
pub use merge::{merge, EXTENDS_KEY, OVERRIDES_KEY};
pub use tree::{
    lookup, AppConfig, BddSettings, ConfigTree, ServerSettings, Servers, Settings, Timeouts,
    DEFAULT_FIND_TIMEOUT_MS, DEFAULT_TEST_TIMEOUT_MS, DEFAULT_TRY_TIMEOUT_MS,
};

use crate::error::{ConfigError, ConfigResult};
use crate::log::Log;

/// Settings key whose relative entries are rebased per document
const TEST_FILES_KEY: &str = "test_files";

/// An in-process config module
pub type ConfigModuleFn =
    Arc<dyn Fn(ConfigApi) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// Config modules addressable by path
#[derive(Clone, Default)]
pub struct ConfigCatalog {
    modules: HashMap<PathBuf, ConfigModuleFn>,
}

impl ConfigCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a config module under `path`
    pub fn register<F, Fut>(&mut self, path: impl AsRef<Path>, module: F) -> &mut Self
    where
        F: Fn(ConfigApi) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let module: ConfigModuleFn = Arc::new(move |api| module(api).boxed());
        self.modules.insert(normalize(path.as_ref()), module);
        self
    }

    pub fn contains(&self, path: impl AsRef<Path>) -> bool {
        self.modules.contains_key(&normalize(path.as_ref()))
    }

    fn get(&self, path: &Path) -> Option<ConfigModuleFn> {
        self.modules.get(path).cloned()
    }
}

impl std::fmt::Debug for ConfigCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.modules.keys()).finish()
    }
}

/// Capability object handed to config modules
#[derive(Clone)]
pub struct ConfigApi {
    resolver: ConfigResolver,
    path: PathBuf,
    stack: Vec<PathBuf>,
    bases: Arc<Mutex<Vec<Value>>>,
    log: Log,
}

impl ConfigApi {
    pub fn log(&self) -> &Log {
        &self.log
    }

    /// Path of the module being evaluated
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Resolve another config; its values become a base of this module's result.
    /// Relative paths are taken from this module's directory.
    pub async fn read_config_file(&self, path: impl AsRef<Path>) -> ConfigResult<ConfigTree> {
        let target = resolve_relative(&self.path, path.as_ref());
        let raw = self.resolver.load(target.clone(), self.stack.clone()).await?;
        let tree = ConfigTree::build(target, raw, &EnvOverrides::default())?;
        self.bases.lock().push(tree.raw().clone());
        Ok(tree)
    }
}

/// Resolves config paths against a catalog and the filesystem
#[derive(Clone, Debug)]
pub struct ConfigResolver {
    catalog: Arc<ConfigCatalog>,
    env: Arc<EnvOverrides>,
}

impl ConfigResolver {
    pub fn new(catalog: ConfigCatalog) -> Self {
        Self {
            catalog: Arc::new(catalog),
            env: Arc::new(EnvOverrides::default()),
        }
    }

    /// Apply connection overrides to the top-level result
    pub fn with_env(mut self, env: EnvOverrides) -> Self {
        self.env = Arc::new(env);
        self
    }

    /// Resolve `path` and everything it extends into a validated tree
    pub async fn resolve(&self, path: impl AsRef<Path>) -> ConfigResult<ConfigTree> {
        let path = normalize(path.as_ref());
        info!("Resolving config {}", path.display());

        let raw = self.load(path.clone(), Vec::new()).await?;
        ConfigTree::build(path, raw, &self.env)
    }

    fn load(&self, path: PathBuf, stack: Vec<PathBuf>) -> BoxFuture<'static, ConfigResult<Value>> {
        let this = self.clone();
        async move {
            if let Some(start) = stack.iter().position(|p| *p == path) {
                let mut chain = stack[start..].to_vec();
                chain.push(path);
                return Err(ConfigError::Cycle { chain });
            }

            let mut stack = stack;
            stack.push(path.clone());

            let (mut document, bases) = match this.catalog.get(&path) {
                Some(module) => this.run_module(&path, module, &stack).await?,
                None => (read_document(&path).await?, Vec::new()),
            };
            rebase_test_files(&path, &mut document);

            this.extend(&path, document, bases, &stack).await
        }
        .boxed()
    }

    async fn run_module(
        &self,
        path: &Path,
        module: ConfigModuleFn,
        stack: &[PathBuf],
    ) -> ConfigResult<(Value, Vec<Value>)> {
        debug!("Evaluating config module {}", path.display());

        let bases = Arc::new(Mutex::new(Vec::new()));
        let api = ConfigApi {
            resolver: self.clone(),
            path: path.to_path_buf(),
            stack: stack.to_vec(),
            bases: bases.clone(),
            log: Log::new(format!("config:{}", path.display())),
        };

        let document = module(api).await.map_err(|err| match err.downcast::<ConfigError>() {
            Ok(config_err) => config_err,
            Err(source) => ConfigError::Module {
                path: path.to_path_buf(),
                source,
            },
        })?;

        if !document.is_object() {
            return Err(ConfigError::Parse {
                path: path.to_path_buf(),
                reason: "config module must return a mapping".to_string(),
            });
        }

        let bases = std::mem::take(&mut *bases.lock());
        Ok((document, bases))
    }

    /// Merge the bases named by `extends` (after any read by a module) under `document`
    async fn extend(
        &self,
        path: &Path,
        mut document: Value,
        module_bases: Vec<Value>,
        stack: &[PathBuf],
    ) -> ConfigResult<Value> {
        let extends = take_extends(path, &mut document)?;

        let mut merged = merge::empty();
        for base in module_bases {
            merged = merge(merged, base);
        }
        for base_path in extends {
            debug!("{} extends {}", path.display(), base_path.display());
            let base = self.load(base_path, stack.to_vec()).await?;
            merged = merge(merged, base);
        }

        Ok(merge(merged, document))
    }
}

fn take_extends(path: &Path, document: &mut Value) -> ConfigResult<Vec<PathBuf>> {
    let parse_error = |reason: &str| ConfigError::Parse {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };

    let Some(directive) = document.as_object_mut().and_then(|m| m.remove(EXTENDS_KEY)) else {
        return Ok(Vec::new());
    };

    let targets = match directive {
        Value::String(target) => vec![target],
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::String(target) => Ok(target),
                _ => Err(parse_error("'extends' entries must be paths")),
            })
            .collect::<ConfigResult<Vec<_>>>()?,
        _ => return Err(parse_error("'extends' must be a path or a list of paths")),
    };

    Ok(targets
        .iter()
        .map(|target| resolve_relative(path, Path::new(target)))
        .collect())
}

/// Rebase relative `test_files` entries onto the directory of the document listing them
fn rebase_test_files(path: &Path, document: &mut Value) {
    let Some(Value::Array(files)) = document.get_mut(TEST_FILES_KEY) else {
        return;
    };
    for file in files.iter_mut() {
        if let Value::String(entry) = file {
            *entry = resolve_relative(path, Path::new(entry.as_str()))
                .to_string_lossy()
                .into_owned();
        }
    }
}

async fn read_document(path: &Path) -> ConfigResult<Value> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ConfigError::NotFound {
                path: path.to_path_buf(),
            })
        }
        Err(e) => {
            return Err(ConfigError::Io {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };

    let parse_error = |reason: String| ConfigError::Parse {
        path: path.to_path_buf(),
        reason,
    };

    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    let document: Value = match extension {
        "yml" | "yaml" => serde_yaml::from_str(&content).map_err(|e| parse_error(e.to_string()))?,
        "json" => serde_json::from_str(&content).map_err(|e| parse_error(e.to_string()))?,
        "toml" => toml::from_str(&content).map_err(|e| parse_error(e.to_string()))?,
        other => return Err(parse_error(format!("unsupported config format '{}'", other))),
    };

    if !document.is_object() {
        return Err(parse_error("top-level value must be a mapping".to_string()));
    }

    Ok(document)
}

/// Resolve `target` against the directory of `from`
pub fn resolve_relative(from: &Path, target: &Path) -> PathBuf {
    if target.is_absolute() {
        return normalize(target);
    }
    let dir = from.parent().unwrap_or_else(|| Path::new(""));
    normalize(&dir.join(target))
}

/// Fold `.` and `..` components without touching the filesystem
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if matches!(out.components().next_back(), Some(Component::Normal(_))) {
                    out.pop();
                } else {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
