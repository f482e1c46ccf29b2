//! Configuration types for rivven-bridge
//!
//! ```yaml
//! bridge_id: edge-bridge
//! broker:
//!   backend: memory
//! amqp:
//!   flow_credit: 1024
//! http:
//!   port: 8080
//!   format: json
//! ```

use crate::broker::OffsetReset;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::LazyLock;

/// Pre-compiled regex for environment variable expansion
/// Pattern: ${VAR} or ${VAR:-default}
static ENV_VAR_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*)(?::-([^}]*))?\}")
        .expect("env var regex pattern is invalid - this is a bug")
});

/// Root configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BridgeConfig {
    /// Bridge identifier, used as prefix of endpoint names
    #[serde(default)]
    pub bridge_id: Option<String>,

    /// Broker connection configuration
    #[serde(default)]
    pub broker: BrokerConfig,

    /// AMQP endpoint settings
    #[serde(default)]
    pub amqp: AmqpConfig,

    /// HTTP endpoint settings
    #[serde(default)]
    pub http: HttpConfig,
}

/// Which broker implementation to talk to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerBackend {
    /// In-process log, for development and tests
    #[default]
    Memory,
    /// Kafka wire protocol (requires the `kafka` feature)
    Kafka,
}

/// Broker connection configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub backend: BrokerBackend,

    /// Bootstrap servers (host:port)
    #[serde(default)]
    pub bootstrap_servers: Vec<String>,

    /// Connection timeout in milliseconds
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,

    /// Connection retries after the first failed attempt
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,

    /// Create unknown topics on first use (memory backend)
    #[serde(default = "default_true")]
    pub auto_create_topics: bool,

    /// Partition count of auto-created topics (memory backend)
    #[serde(default = "default_partitions")]
    pub default_partitions: u32,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            backend: BrokerBackend::default(),
            bootstrap_servers: Vec::new(),
            connection_timeout_ms: default_connection_timeout_ms(),
            connect_retries: default_connect_retries(),
            auto_create_topics: true,
            default_partitions: default_partitions(),
        }
    }
}

fn default_connection_timeout_ms() -> u64 {
    10_000
}

fn default_connect_retries() -> u32 {
    4
}

fn default_true() -> bool {
    true
}

fn default_partitions() -> u32 {
    1
}

/// AMQP message converter selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AmqpConverterKind {
    /// Body plus bridge annotations (topic, partition, offset, key)
    #[default]
    Default,
    /// Body only
    Raw,
}

/// AMQP endpoint settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AmqpConfig {
    /// Credit granted to each receiver link
    #[serde(default = "default_flow_credit")]
    pub flow_credit: u32,

    /// Credit handed back once this many broker sends completed
    #[serde(default = "default_credit_increment")]
    pub credit_increment: u32,

    #[serde(default)]
    pub message_converter: AmqpConverterKind,

    /// How long a sink poll waits for records
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,

    #[serde(default = "default_max_poll_records")]
    pub max_poll_records: usize,

    /// Consecutive failed polls before a sink link is detached
    #[serde(default = "default_max_consecutive_poll_errors")]
    pub max_consecutive_poll_errors: u32,

    /// Start position of sink consumers without a committed offset
    #[serde(default)]
    pub offset_reset: OffsetReset,
}

impl Default for AmqpConfig {
    fn default() -> Self {
        Self {
            flow_credit: default_flow_credit(),
            credit_increment: default_credit_increment(),
            message_converter: AmqpConverterKind::default(),
            poll_timeout_ms: default_poll_timeout_ms(),
            max_poll_records: default_max_poll_records(),
            max_consecutive_poll_errors: default_max_consecutive_poll_errors(),
            offset_reset: OffsetReset::default(),
        }
    }
}

fn default_flow_credit() -> u32 {
    1024
}

fn default_credit_increment() -> u32 {
    100
}

fn default_poll_timeout_ms() -> u64 {
    100
}

fn default_max_poll_records() -> usize {
    500
}

fn default_max_consecutive_poll_errors() -> u32 {
    50
}

/// Payload format of HTTP publish requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddedFormat {
    /// Keys and values are JSON documents
    #[default]
    Json,
    /// Keys and values are base64 encoded bytes
    Binary,
}

/// HTTP endpoint settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HttpConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub format: EmbeddedFormat,

    /// Upper bound of concurrent broker sends per request
    #[serde(default = "default_max_in_flight_sends")]
    pub max_in_flight_sends: usize,

    /// Largest accepted request body
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            format: EmbeddedFormat::default(),
            max_in_flight_sends: default_max_in_flight_sends(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_max_in_flight_sends() -> usize {
    256
}

fn default_max_body_bytes() -> usize {
    1024 * 1024
}

impl BridgeConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| anyhow::anyhow!("Failed to read config file: {}", e))?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML text, expanding environment variables
    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        let expanded = Self::expand_env_vars(content);

        let config: Self = serde_yaml::from_str(&expanded)
            .map_err(|e| anyhow::anyhow!("Failed to parse config: {}", e))?;

        config.validate()?;
        Ok(config)
    }

    /// Expand environment variables in the format ${VAR} or ${VAR:-default}
    fn expand_env_vars(content: &str) -> String {
        ENV_VAR_REGEX
            .replace_all(content, |caps: &regex::Captures| {
                let var_name = &caps[1];
                let default = caps.get(2).map(|m| m.as_str());

                std::env::var(var_name).unwrap_or_else(|_| default.unwrap_or("").to_string())
            })
            .to_string()
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if let Some(id) = &self.bridge_id {
            if id.trim().is_empty() {
                anyhow::bail!("bridge_id must not be empty when set");
            }
        }

        if self.broker.backend == BrokerBackend::Kafka && self.broker.bootstrap_servers.is_empty()
        {
            anyhow::bail!("kafka backend needs at least one bootstrap server");
        }
        if self.broker.default_partitions == 0 {
            anyhow::bail!("broker.default_partitions must be at least 1");
        }

        if self.amqp.flow_credit == 0 {
            anyhow::bail!("amqp.flow_credit must be at least 1");
        }
        if self.amqp.credit_increment == 0 || self.amqp.credit_increment > self.amqp.flow_credit {
            anyhow::bail!(
                "amqp.credit_increment must be between 1 and flow_credit ({})",
                self.amqp.flow_credit
            );
        }
        if self.amqp.max_poll_records == 0 {
            anyhow::bail!("amqp.max_poll_records must be at least 1");
        }
        if self.amqp.max_consecutive_poll_errors == 0 {
            anyhow::bail!("amqp.max_consecutive_poll_errors must be at least 1");
        }

        if self.http.max_in_flight_sends == 0 {
            anyhow::bail!("http.max_in_flight_sends must be at least 1");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_expansion() {
        std::env::set_var("RIVVEN_BRIDGE_TEST_PORT", "9090");
        let content = "port: ${RIVVEN_BRIDGE_TEST_PORT}";
        let expanded = BridgeConfig::expand_env_vars(content);
        assert_eq!(expanded, "port: 9090");
    }

    #[test]
    fn test_env_var_with_default() {
        std::env::remove_var("RIVVEN_BRIDGE_MISSING_VAR");
        let content = "value: ${RIVVEN_BRIDGE_MISSING_VAR:-default_value}";
        let expanded = BridgeConfig::expand_env_vars(content);
        assert_eq!(expanded, "value: default_value");
    }

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::from_yaml("{}").unwrap();
        assert_eq!(config.broker.backend, BrokerBackend::Memory);
        assert_eq!(config.amqp.flow_credit, 1024);
        assert_eq!(config.http.port, 8080);
        assert_eq!(config.http.format, EmbeddedFormat::Json);
        assert_eq!(config.http.max_in_flight_sends, 256);
    }

    #[test]
    fn test_parse_config() {
        let yaml = r#"
bridge_id: edge
broker:
  backend: kafka
  bootstrap_servers:
    - localhost:9092
amqp:
  flow_credit: 50
  credit_increment: 10
  message_converter: raw
  offset_reset: latest
http:
  port: 8081
  format: binary
"#;
        let config = BridgeConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.bridge_id.as_deref(), Some("edge"));
        assert_eq!(config.broker.bootstrap_servers, vec!["localhost:9092"]);
        assert_eq!(config.amqp.message_converter, AmqpConverterKind::Raw);
        assert_eq!(config.amqp.offset_reset, OffsetReset::Latest);
        assert_eq!(config.http.format, EmbeddedFormat::Binary);
    }

    #[test]
    fn test_validate_kafka_needs_servers() {
        let err = BridgeConfig::from_yaml("broker:\n  backend: kafka\n").unwrap_err();
        assert!(err.to_string().contains("bootstrap server"));
    }

    #[test]
    fn test_validate_credit_increment() {
        let yaml = "amqp:\n  flow_credit: 10\n  credit_increment: 20\n";
        assert!(BridgeConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_validate_poll_error_budget() {
        let err = BridgeConfig::from_yaml("amqp:\n  max_consecutive_poll_errors: 0\n").unwrap_err();
        assert!(err.to_string().contains("max_consecutive_poll_errors"));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.yaml");
        std::fs::write(&path, "http:\n  port: 9000\n").unwrap();
        let config = BridgeConfig::from_file(&path).unwrap();
        assert_eq!(config.http.port, 9000);
    }
}
