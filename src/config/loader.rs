//! Configuration loading.
//!
//! Two sources feed the service: the local bootstrap TOML file, read once, and
//! the remote config server, fetched at startup and again on every refresh
//! event.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::config::schema::BootstrapConfig;
use crate::config::snapshot::{ConfigSnapshot, ConfigValue, ServiceIdentity};
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation failed: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),

    /// The config server could not be reached or returned unusable data.
    #[error("configuration unavailable from {url}: {reason}")]
    Unavailable { url: String, reason: String },

    #[error("application name must not be empty")]
    EmptyAppName,

    #[error("required configuration key '{0}' is missing")]
    MissingKey(String),

    #[error("configuration key '{key}' has invalid value '{value}'")]
    InvalidValue { key: String, value: String },
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Load and validate the bootstrap configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<BootstrapConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    let config: BootstrapConfig = toml::from_str(&content)?;

    validate_config(&config).map_err(ConfigError::Validation)?;

    Ok(config)
}

/// Load the bootstrap file if one is given, defaults otherwise.
pub fn load_or_default(path: Option<&Path>) -> Result<BootstrapConfig, ConfigError> {
    match path {
        Some(p) => load_config(p),
        None => Ok(BootstrapConfig::default()),
    }
}

/// Response body of a Spring Cloud Config style server.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CloudConfig {
    #[serde(default)]
    version: Option<String>,
    property_sources: Vec<PropertySource>,
}

#[derive(Debug, Deserialize)]
struct PropertySource {
    #[serde(default)]
    name: String,
    source: serde_json::Map<String, Value>,
}

/// Fetches configuration snapshots for one service identity.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    client: reqwest::Client,
    server_url: String,
    identity: ServiceIdentity,
}

impl ConfigLoader {
    pub fn new(
        server_url: impl Into<String>,
        identity: ServiceIdentity,
        fetch_timeout: Duration,
    ) -> Result<Self, ConfigError> {
        if identity.app_name.trim().is_empty() {
            return Err(ConfigError::EmptyAppName);
        }
        let server_url = server_url.into();
        let client = reqwest::Client::builder()
            .timeout(fetch_timeout)
            .build()
            .map_err(|e| ConfigError::Unavailable {
                url: server_url.clone(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            client,
            server_url,
            identity,
        })
    }

    pub fn identity(&self) -> &ServiceIdentity {
        &self.identity
    }

    /// `{server}/{app}/{profile}/{branch}`
    pub fn url(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.server_url.trim_end_matches('/'),
            self.identity.app_name,
            self.identity.profile,
            self.identity.branch
        )
    }

    /// Fetch and parse one snapshot.
    pub async fn load(&self) -> Result<ConfigSnapshot, ConfigError> {
        let url = self.url();
        let unavailable = |reason: String| ConfigError::Unavailable {
            url: url.clone(),
            reason,
        };

        tracing::debug!(url = %url, "Fetching configuration");

        let response = self
            .client
            .get(&url)
            .header("accept", "application/json")
            .send()
            .await
            .map_err(|e| unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(unavailable(format!("server returned {}", status)));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| unavailable(e.to_string()))?;

        let snapshot = parse_snapshot(self.identity.clone(), &body).map_err(unavailable)?;

        tracing::info!(
            identity = %self.identity,
            version = snapshot.version().unwrap_or("unknown"),
            keys = snapshot.len(),
            "Configuration loaded"
        );
        Ok(snapshot)
    }
}

/// Fetch a snapshot for `app_name` at `profile` / `branch`.
pub async fn load_configuration_from_branch(
    server_url: &str,
    app_name: &str,
    profile: &str,
    branch: &str,
) -> Result<ConfigSnapshot, ConfigError> {
    let identity = ServiceIdentity::new(app_name, profile, branch);
    let loader = ConfigLoader::new(server_url, identity, Duration::from_secs(10))?;
    loader.load().await
}

/// Merge property sources; earlier sources win.
fn parse_snapshot(identity: ServiceIdentity, body: &[u8]) -> Result<ConfigSnapshot, String> {
    let cloud: CloudConfig =
        serde_json::from_slice(body).map_err(|e| format!("malformed response: {}", e))?;

    let mut values = BTreeMap::new();
    for source in &cloud.property_sources {
        for (key, raw) in &source.source {
            if values.contains_key(key) {
                continue;
            }
            let value = match raw {
                Value::Bool(b) => ConfigValue::Bool(*b),
                Value::String(s) => ConfigValue::String(s.clone()),
                Value::Number(n) => match n.as_i64() {
                    Some(i) => ConfigValue::Integer(i),
                    None => ConfigValue::Float(n.as_f64().unwrap_or_default()),
                },
                _ => {
                    return Err(format!(
                        "property '{}' in source '{}' is not a primitive value",
                        key, source.name
                    ))
                }
            };
            values.insert(key.clone(), value);
        }
    }

    Ok(ConfigSnapshot::new(identity, cloud.version, values))
}
