//! Remote configuration snapshot and its atomically swappable holder.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

use crate::config::loader::ConfigError;

/// Listen port used when the snapshot carries no `server_port`.
pub const DEFAULT_SERVER_PORT: u16 = 6767;

/// Who this process is, as far as the config server is concerned.
///
/// Fixed at process start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceIdentity {
    pub app_name: String,
    pub profile: String,
    pub branch: String,
}

impl ServiceIdentity {
    pub const DEFAULT_PROFILE: &'static str = "test";
    pub const DEFAULT_BRANCH: &'static str = "master";

    /// Build an identity, falling back to `test` / `master` for empty selectors.
    pub fn new(app_name: impl Into<String>, profile: &str, branch: &str) -> Self {
        let profile = if profile.trim().is_empty() {
            Self::DEFAULT_PROFILE
        } else {
            profile
        };
        let branch = if branch.trim().is_empty() {
            Self::DEFAULT_BRANCH
        } else {
            branch
        };
        Self {
            app_name: app_name.into(),
            profile: profile.to_string(),
            branch: branch.to_string(),
        }
    }
}

impl fmt::Display for ServiceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.app_name, self.profile, self.branch)
    }
}

/// A primitive configuration value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
}

impl ConfigValue {
    /// Interpret the value as an unsigned integer, parsing strings.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            ConfigValue::Integer(v) => u64::try_from(*v).ok(),
            ConfigValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigValue::Bool(v) => write!(f, "{}", v),
            ConfigValue::Integer(v) => write!(f, "{}", v),
            ConfigValue::Float(v) => write!(f, "{}", v),
            ConfigValue::String(v) => f.write_str(v),
        }
    }
}

/// One complete, immutable set of configuration values.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigSnapshot {
    identity: ServiceIdentity,
    /// Version reported by the config server (usually a commit id).
    version: Option<String>,
    /// Local sequence number, assigned by [`ConfigHolder`].
    generation: u64,
    values: BTreeMap<String, ConfigValue>,
}

impl ConfigSnapshot {
    pub fn new(
        identity: ServiceIdentity,
        version: Option<String>,
        values: BTreeMap<String, ConfigValue>,
    ) -> Self {
        Self {
            identity,
            version,
            generation: 0,
            values,
        }
    }

    pub fn identity(&self) -> &ServiceIdentity {
        &self.identity
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&ConfigValue> {
        self.values.get(key)
    }

    /// Value rendered as a string; empty strings count as absent.
    pub fn get_string(&self, key: &str) -> Option<String> {
        self.values
            .get(key)
            .map(|v| v.to_string())
            .filter(|s| !s.trim().is_empty())
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.values.get(key).and_then(ConfigValue::as_u64)
    }

    pub fn require_string(&self, key: &str) -> Result<String, ConfigError> {
        self.get_string(key)
            .ok_or_else(|| ConfigError::MissingKey(key.to_string()))
    }

    /// Broker URL; its absence is fatal.
    pub fn amqp_server_url(&self) -> Result<String, ConfigError> {
        self.require_string("amqp_server_url")
    }

    pub fn config_event_bus(&self) -> Option<String> {
        self.get_string("config_event_bus")
    }

    pub fn zipkin_server_url(&self) -> Option<String> {
        self.get_string("zipkin_server_url")
    }

    /// Listen port, [`DEFAULT_SERVER_PORT`] when unset.
    pub fn server_port(&self) -> Result<u16, ConfigError> {
        match self.values.get("server_port") {
            None => Ok(DEFAULT_SERVER_PORT),
            Some(value) => value
                .as_u64()
                .and_then(|p| u16::try_from(p).ok())
                .ok_or_else(|| ConfigError::InvalidValue {
                    key: "server_port".to_string(),
                    value: value.to_string(),
                }),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ConfigValue)> {
        self.values.iter()
    }
}

/// Shared handle to the active snapshot.
///
/// Readers call [`current`](Self::current) and keep the returned `Arc` for as
/// long as they need a consistent view. The refresh listener is the only
/// writer; it swaps in a whole new snapshot, never edits the live one.
#[derive(Clone)]
pub struct ConfigHolder {
    inner: Arc<ArcSwap<ConfigSnapshot>>,
}

impl ConfigHolder {
    pub fn new(mut snapshot: ConfigSnapshot) -> Self {
        snapshot.generation = 1;
        Self {
            inner: Arc::new(ArcSwap::from_pointee(snapshot)),
        }
    }

    pub fn current(&self) -> Arc<ConfigSnapshot> {
        self.inner.load_full()
    }

    /// Swap in a new snapshot and return its generation.
    pub fn replace(&self, mut snapshot: ConfigSnapshot) -> u64 {
        let generation = self.inner.load().generation + 1;
        snapshot.generation = generation;
        self.inner.store(Arc::new(snapshot));
        generation
    }
}

impl fmt::Debug for ConfigHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let current = self.inner.load();
        f.debug_struct("ConfigHolder")
            .field("identity", &current.identity)
            .field("generation", &current.generation)
            .field("keys", &current.values.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(pairs: &[(&str, ConfigValue)]) -> ConfigSnapshot {
        let values = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        ConfigSnapshot::new(ServiceIdentity::new("accountservice", "", ""), None, values)
    }

    #[test]
    fn test_identity_defaults() {
        let identity = ServiceIdentity::new("accountservice", " ", "");
        assert_eq!(identity.profile, "test");
        assert_eq!(identity.branch, "master");
        assert_eq!(identity.to_string(), "accountservice/test/master");
    }

    #[test]
    fn test_typed_accessors() {
        let snap = snapshot(&[
            ("server_port", ConfigValue::String("8080".into())),
            ("amqp_server_url", ConfigValue::String("amqp://broker".into())),
            ("retries", ConfigValue::Integer(3)),
        ]);
        assert_eq!(snap.server_port().unwrap(), 8080);
        assert_eq!(snap.amqp_server_url().unwrap(), "amqp://broker");
        assert_eq!(snap.get_u64("retries"), Some(3));
        assert!(snap.zipkin_server_url().is_none());
    }

    #[test]
    fn test_missing_and_invalid_values() {
        let snap = snapshot(&[("server_port", ConfigValue::String("http".into()))]);
        assert!(matches!(snap.amqp_server_url(), Err(ConfigError::MissingKey(k)) if k == "amqp_server_url"));
        assert!(matches!(snap.server_port(), Err(ConfigError::InvalidValue { .. })));

        let empty = snapshot(&[]);
        assert_eq!(empty.server_port().unwrap(), DEFAULT_SERVER_PORT);
    }

    #[test]
    fn test_holder_replace_bumps_generation() {
        let holder = ConfigHolder::new(snapshot(&[("a", ConfigValue::Integer(1))]));
        let before = holder.current();
        assert_eq!(before.generation(), 1);

        let generation = holder.replace(snapshot(&[("a", ConfigValue::Integer(2))]));
        assert_eq!(generation, 2);

        // Old readers keep their complete view.
        assert_eq!(before.get("a"), Some(&ConfigValue::Integer(1)));
        assert_eq!(holder.current().get("a"), Some(&ConfigValue::Integer(2)));
    }
}
