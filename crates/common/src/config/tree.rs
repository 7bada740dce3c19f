//! The resolved, immutable configuration tree and its schema

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::env::EnvOverrides;
use super::merge::merge;
use crate::error::{ConfigError, ConfigResult};

/// Recognised configuration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// Test files to load, by catalog path
    #[serde(default)]
    pub test_files: Vec<String>,

    /// Service name -> provider factory id
    #[serde(default)]
    pub services: BTreeMap<String, String>,

    /// Page object name -> provider factory id
    #[serde(default)]
    pub page_objects: BTreeMap<String, String>,

    /// Application routes under test
    #[serde(default)]
    pub apps: BTreeMap<String, AppConfig>,

    /// Connection parameters for the application and data service
    #[serde(default)]
    pub servers: Servers,

    /// Named timeouts in milliseconds
    #[serde(default)]
    pub timeouts: Timeouts,

    /// Settings passed to the BDD engine
    #[serde(default)]
    pub bdd: BddSettings,

    /// Construct every configured service before loading tests
    #[serde(default)]
    pub eager_services: bool,

    /// Free-form values for user services
    #[serde(default)]
    pub custom: Map<String, Value>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            test_files: Vec::new(),
            services: BTreeMap::new(),
            page_objects: BTreeMap::new(),
            apps: BTreeMap::new(),
            servers: Servers::default(),
            timeouts: Timeouts::default(),
            bdd: BddSettings::default(),
            eager_services: false,
            custom: Map::new(),
        }
    }
}

impl Settings {
    fn validate(&self) -> Result<(), String> {
        for (name, millis) in self.timeouts.iter() {
            if millis == 0 {
                return Err(format!("timeouts.{} must be greater than zero", name));
            }
        }

        for (section, map) in [("services", &self.services), ("page_objects", &self.page_objects)] {
            if let Some((name, _)) = map.iter().find(|(_, id)| id.trim().is_empty()) {
                return Err(format!("{}.{} has an empty provider id", section, name));
            }
        }

        for (name, server) in [("app", &self.servers.app), ("data", &self.servers.data)] {
            if server.hostname.is_empty() {
                return Err(format!("servers.{}.hostname is empty", name));
            }
            if server.protocol != "http" && server.protocol != "https" {
                return Err(format!(
                    "servers.{}.protocol must be http or https, got '{}'",
                    name, server.protocol
                ));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    pub pathname: String,
    #[serde(default)]
    pub hash: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Servers {
    pub app: ServerSettings,
    pub data: ServerSettings,
}

impl Default for Servers {
    fn default() -> Self {
        Self {
            app: ServerSettings::localhost(5620),
            data: ServerSettings::localhost(9220),
        }
    }
}

/// Connection parameters for one server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerSettings {
    pub protocol: String,
    pub hostname: String,
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl ServerSettings {
    fn localhost(port: u16) -> Self {
        Self {
            protocol: "http".to_string(),
            hostname: "localhost".to_string(),
            port,
            username: None,
            password: None,
        }
    }

    /// `protocol://hostname:port`
    pub fn url(&self) -> String {
        format!("{}://{}:{}", self.protocol, self.hostname, self.port)
    }

    /// Like `url`, with credentials when both are set
    pub fn url_with_auth(&self) -> String {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => {
                format!("{}://{}:{}@{}:{}", self.protocol, user, pass, self.hostname, self.port)
            }
            _ => self.url(),
        }
    }
}

pub const DEFAULT_TEST_TIMEOUT_MS: u64 = 360_000;
pub const DEFAULT_TRY_TIMEOUT_MS: u64 = 120_000;
pub const DEFAULT_FIND_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timeouts {
    /// Per-test and per-hook limit
    pub test: u64,

    /// Default budget for retry helpers
    #[serde(rename = "try")]
    pub retry: u64,

    pub find: u64,

    #[serde(flatten)]
    pub other: BTreeMap<String, u64>,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            test: DEFAULT_TEST_TIMEOUT_MS,
            retry: DEFAULT_TRY_TIMEOUT_MS,
            find: DEFAULT_FIND_TIMEOUT_MS,
            other: BTreeMap::new(),
        }
    }
}

impl Timeouts {
    /// Look up a timeout by its config name
    pub fn get(&self, name: &str) -> Option<Duration> {
        let millis = match name {
            "test" => self.test,
            "try" => self.retry,
            "find" => self.find,
            other => *self.other.get(other)?,
        };
        Some(Duration::from_millis(millis))
    }

    fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        [("test", self.test), ("try", self.retry), ("find", self.find)]
            .into_iter()
            .chain(self.other.iter().map(|(k, v)| (k.as_str(), *v)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BddSettings {
    /// Stop after the first failure
    #[serde(default)]
    pub bail: bool,

    /// Only run tests whose full title matches
    #[serde(default)]
    pub grep: Option<String>,

    /// Tests slower than this are reported as slow
    #[serde(default = "default_slow_ms")]
    pub slow_ms: u64,
}

fn default_slow_ms() -> u64 {
    30_000
}

impl Default for BddSettings {
    fn default() -> Self {
        Self {
            bail: false,
            grep: None,
            slow_ms: default_slow_ms(),
        }
    }
}

/// Immutable configuration produced by `ConfigResolver::resolve`
#[derive(Debug, Clone)]
pub struct ConfigTree {
    path: PathBuf,
    raw: Value,
    values: Value,
    settings: Settings,
}

impl ConfigTree {
    /// Validate a merged document. Built-in defaults sit underneath `raw`.
    pub(crate) fn build(path: PathBuf, raw: Value, env: &EnvOverrides) -> ConfigResult<Self> {
        let schema_error = |reason: String| ConfigError::Schema {
            path: path.clone(),
            reason,
        };

        let defaults = serde_json::to_value(Settings::default()).unwrap_or_default();
        let mut values = merge(defaults, raw.clone());
        env.apply(&mut values).map_err(schema_error)?;

        let settings: Settings =
            serde_json::from_value(values.clone()).map_err(|e| schema_error(e.to_string()))?;
        settings.validate().map_err(schema_error)?;

        Ok(Self {
            path,
            raw,
            values,
            settings,
        })
    }

    /// Path of the config this tree was resolved from
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// All resolved values, defaults included
    pub fn values(&self) -> &Value {
        &self.values
    }

    /// The merged document as written, without defaults or env overrides
    pub fn raw(&self) -> &Value {
        &self.raw
    }

    /// Look up a value by dotted path (`timeouts.try`, `test_files.0`)
    pub fn get(&self, key: &str) -> Option<&Value> {
        lookup(&self.values, key)
    }

    pub fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Deserialize the value at a dotted path
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> ConfigResult<T> {
        let value = self.get(key).ok_or_else(|| ConfigError::Schema {
            path: self.path.clone(),
            reason: format!("missing key '{}'", key),
        })?;
        T::deserialize(value).map_err(|e| ConfigError::Schema {
            path: self.path.clone(),
            reason: format!("{}: {}", key, e),
        })
    }
}

/// Walk a dotted path through objects and arrays
pub fn lookup<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    if key.is_empty() {
        return Some(value);
    }
    key.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}
