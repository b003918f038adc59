//! Endpoint configuration for tracker stores and event brokers.
//!
//! Endpoints are declared in an `endpoints.yml` file:
//!
//! ```yaml
//! tracker_store:
//!   type: sql
//!   dialect: postgresql
//!   url: localhost
//!   db: parley
//! event_broker:
//!   type: nats
//!   url: nats://localhost:4222
//! ```
//!
//! `type` and `url` are common to every endpoint. All other keys are kept
//! in [`EndpointConfig::params`] and deserialized by the backend that
//! consumes them.

use std::path::Path;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::StoreError;

/// Errors that can occur when loading endpoint configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    #[error("failed to read endpoints file: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Failed to parse YAML content.
    #[error("failed to parse endpoints YAML: {source}")]
    Yaml {
        /// The underlying YAML parse error.
        source: serde_yml::Error,
    },
}

impl From<serde_yml::Error> for ConfigError {
    fn from(source: serde_yml::Error) -> Self {
        Self::Yaml { source }
    }
}

/// All endpoints consumed by the tracker store.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct EndpointsConfig {
    /// Backend selection and connection parameters.
    #[serde(default)]
    pub tracker_store: Option<EndpointConfig>,

    /// Event broker that receives newly persisted events.
    #[serde(default)]
    pub event_broker: Option<EndpointConfig>,
}

impl EndpointsConfig {
    /// Load endpoints from a YAML file at the given path.
    ///
    /// Environment variables override YAML values:
    /// - `PARLEY_TRACKER_STORE_URL` overrides `tracker_store.url`
    /// - `NATS_URL` overrides `event_broker.url`
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read, or
    /// [`ConfigError::Yaml`] if the content is not valid YAML.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parse endpoints from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Yaml`] if the string is not valid YAML.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let mut config: Self = serde_yml::from_str(yaml)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides to endpoint URLs.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("PARLEY_TRACKER_STORE_URL") {
            self.tracker_store
                .get_or_insert_with(EndpointConfig::default)
                .url = Some(val);
        }
        if let (Ok(val), Some(broker)) = (std::env::var("NATS_URL"), self.event_broker.as_mut()) {
            broker.url = Some(val);
        }
    }
}

/// One endpoint: a kind tag, an optional URL and free-form parameters.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct EndpointConfig {
    /// Kind tag selecting the implementation (`memory`, `sql`, ...).
    #[serde(default, rename = "type")]
    pub kind: Option<String>,

    /// Host or full connection URL.
    #[serde(default)]
    pub url: Option<String>,

    /// Every other key of the endpoint.
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl EndpointConfig {
    /// An endpoint with only a kind tag.
    pub fn of_kind(kind: &str) -> Self {
        Self {
            kind: Some(kind.to_owned()),
            ..Self::default()
        }
    }

    /// Set the endpoint URL.
    #[must_use]
    pub fn with_url(mut self, url: &str) -> Self {
        self.url = Some(url.to_owned());
        self
    }

    /// Set one endpoint parameter.
    #[must_use]
    pub fn with_param(mut self, key: &str, value: Value) -> Self {
        self.params.insert(key.to_owned(), value);
        self
    }

    /// The kind tag, lowercased, if set.
    pub fn kind(&self) -> Option<String> {
        self.kind.as_deref().map(str::to_lowercase)
    }

    /// Deserialize the endpoint parameters into a backend's option struct.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Config`] if the parameters do not match `T`.
    pub fn options<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        serde_json::from_value(Value::Object(self.params.clone()))
            .map_err(|e| StoreError::config(format!("invalid endpoint parameters: {e}")))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use serde_json::json;

    #[test]
    fn parse_sql_endpoint() {
        let yaml = r"
tracker_store:
  type: SQL
  dialect: postgresql
  url: db.internal:6543
  db: parley
  query:
    sslmode: require
event_broker:
  type: memory
";
        let config: EndpointsConfig = serde_yml::from_str(yaml).unwrap();
        let store = config.tracker_store.unwrap();
        assert_eq!(store.kind().as_deref(), Some("sql"));
        assert_eq!(store.url.as_deref(), Some("db.internal:6543"));
        assert_eq!(store.params.get("dialect"), Some(&json!("postgresql")));
        assert_eq!(store.params.get("query"), Some(&json!({"sslmode": "require"})));
        assert_eq!(config.event_broker.unwrap().kind().as_deref(), Some("memory"));
    }

    #[test]
    fn empty_file_has_no_endpoints() {
        let config: EndpointsConfig = serde_yml::from_str("{}").unwrap();
        assert_eq!(config, EndpointsConfig::default());
    }

    #[test]
    fn options_reject_mismatched_parameters() {
        #[derive(Debug, Deserialize)]
        struct Options {
            #[allow(dead_code)]
            port: u16,
        }

        let endpoint = EndpointConfig::of_kind("sql").with_param("port", json!("not a port"));
        let result: Result<Options, _> = endpoint.options();
        assert!(matches!(result, Err(StoreError::Config { .. })));
    }
}
