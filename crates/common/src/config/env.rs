//! Environment overrides for the application and data-service connection

use std::collections::BTreeMap;

use serde_json::{Map, Value};

const TARGETS: [(&str, &str); 2] = [("TEST_APP_", "app"), ("TEST_DATA_", "data")];

const FIELDS: [(&str, &str); 5] = [
    ("PROTOCOL", "protocol"),
    ("HOSTNAME", "hostname"),
    ("PORT", "port"),
    ("USERNAME", "username"),
    ("PASSWORD", "password"),
];

/// Connection parameters taken from `TEST_APP_*` / `TEST_DATA_*` variables
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    vars: BTreeMap<String, String>,
}

impl EnvOverrides {
    /// Capture the recognised variables from the process environment
    pub fn from_env() -> Self {
        Self::from_pairs(std::env::vars())
    }

    /// Build from explicit pairs; unrecognised names and empty values are ignored
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .filter(|(k, v)| !v.is_empty() && recognised(k))
            .collect();
        Self { vars }
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Write the overrides into `servers.<target>.<field>` of a resolved document
    pub(crate) fn apply(&self, value: &mut Value) -> Result<(), String> {
        if self.vars.is_empty() {
            return Ok(());
        }

        let root = value
            .as_object_mut()
            .ok_or_else(|| "config root is not a mapping".to_string())?;

        for (prefix, target) in TARGETS {
            for (suffix, field) in FIELDS {
                let name = format!("{}{}", prefix, suffix);
                let Some(raw) = self.vars.get(&name) else {
                    continue;
                };

                let servers = object_entry(root, "servers")?;
                let server = object_entry(servers, target)?;
                let value = if field == "port" {
                    let port: u16 = raw
                        .parse()
                        .map_err(|_| format!("{} must be a port number, got '{}'", name, raw))?;
                    Value::from(port)
                } else {
                    Value::from(raw.clone())
                };

                tracing::debug!("{} overrides servers.{}.{}", name, target, field);
                server.insert(field.to_string(), value);
            }
        }

        Ok(())
    }
}

fn recognised(name: &str) -> bool {
    TARGETS.iter().any(|(prefix, _)| {
        name.strip_prefix(prefix)
            .map(|suffix| FIELDS.iter().any(|(f, _)| *f == suffix))
            .unwrap_or(false)
    })
}

fn object_entry<'a>(map: &'a mut Map<String, Value>, key: &str) -> Result<&'a mut Map<String, Value>, String> {
    map.entry(key.to_string())
        .or_insert_with(|| Value::Object(Map::new()))
        .as_object_mut()
        .ok_or_else(|| format!("'{}' must be a mapping", key))
}
