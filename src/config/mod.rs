//! Application configuration.
//!
//! A single `Config` loaded once at startup from YAML files and environment
//! variables. Components receive the sections they need; nothing re-reads it later.

use std::time::Duration;

use serde::Deserialize;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "courier.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "COURIER_CONFIG";
/// Prefix for configuration environment variables (`COURIER__SECTION__KEY`).
pub const CONFIG_ENV_PREFIX: &str = "COURIER";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "COURIER_LOG";

/// Errors that can occur while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid configuration '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// A subject token that must stand alone: normalized, no separators or wildcards.
fn check_token(field: &'static str, value: &str) -> Result<(), ConfigError> {
    if value.is_empty() {
        return Err(invalid(field, "must not be empty"));
    }
    if crate::subject::normalize(value) != value || value.contains(['.', '*', '>']) {
        return Err(invalid(
            field,
            format!("'{}' must be a single lowercase subject token", value),
        ));
    }
    Ok(())
}

/// Broker connection settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Server URLs. Default: `["nats://localhost:4222"]`.
    pub urls: Vec<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub token: Option<String>,
    pub require_tls: bool,
    pub client_name: Option<String>,
    /// Default: 5000.
    pub connect_timeout_ms: u64,
    /// How long `start()` waits for the connection to report ready. Default: 10000.
    pub readiness_timeout_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            urls: vec!["nats://localhost:4222".to_string()],
            user: None,
            password: None,
            token: None,
            require_tls: false,
            client_name: None,
            connect_timeout_ms: 5000,
            readiness_timeout_ms: 10_000,
        }
    }
}

/// Shared stream settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Default: `COURIER`.
    pub name: String,
    /// Zero means unlimited. Default: 7 days.
    pub max_age_secs: u64,
    /// Default: 1.
    pub replicas: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            name: "COURIER".to_string(),
            max_age_secs: 7 * 24 * 60 * 60,
            replicas: 1,
        }
    }
}

impl StreamConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }
}

/// Defaults applied to every registered subscriber.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Total delivery attempts before dead-lettering. Default: 5.
    pub max_deliver: u32,
    /// Default: 30000.
    pub ack_wait_ms: u64,
    /// Redelivery delays; the last entry repeats. Default: `[1000, 5000, 30000]`.
    pub backoff_ms: Vec<u64>,
    /// Workers per subscriber. Default: 1.
    pub concurrency: usize,
    /// Default: 10.
    pub batch_size: usize,
    /// Longest a single pull waits for messages. Default: 5000.
    pub pull_expires_ms: u64,
    /// Per-message handler budget. Must be below `ack_wait_ms`. Default: 25000.
    pub subscriber_timeout_ms: u64,
    /// How long `stop()` waits for in-flight handlers. Default: 10000.
    pub shutdown_grace_ms: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_deliver: 5,
            ack_wait_ms: 30_000,
            backoff_ms: vec![1000, 5000, 30_000],
            concurrency: 1,
            batch_size: 10,
            pull_expires_ms: 5000,
            subscriber_timeout_ms: 25_000,
            shutdown_grace_ms: 10_000,
        }
    }
}

impl ConsumerConfig {
    pub fn ack_wait(&self) -> Duration {
        Duration::from_millis(self.ack_wait_ms)
    }

    pub fn backoff(&self) -> Vec<Duration> {
        self.backoff_ms
            .iter()
            .map(|ms| Duration::from_millis(*ms))
            .collect()
    }

    pub fn pull_expires(&self) -> Duration {
        Duration::from_millis(self.pull_expires_ms)
    }

    pub fn subscriber_timeout(&self) -> Duration {
        Duration::from_millis(self.subscriber_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Outbox settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    /// Route publishes through the outbox. Default: true.
    pub enabled: bool,
    /// Age after which a `publishing` row is considered abandoned. Default: 5.
    pub stale_timeout_minutes: u64,
    /// Age after which `sent` rows are deleted. Default: 7.
    pub retention_days: u64,
    /// Rows per sweep. Default: 100.
    pub batch_size: usize,
    /// Send attempts before a failed row stays failed. Default: 10.
    pub max_attempts: u32,
    /// Default: 30.
    pub sweep_interval_secs: u64,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            stale_timeout_minutes: 5,
            retention_days: 7,
            batch_size: 100,
            max_attempts: 10,
            sweep_interval_secs: 30,
        }
    }
}

/// Inbox settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InboxConfig {
    /// Deduplicate deliveries through the inbox. Default: true.
    pub enabled: bool,
    /// Age after which a `processing` row may be re-claimed. Default: 5.
    pub stale_timeout_minutes: u64,
    /// Default: 7.
    pub retention_days: u64,
}

impl Default for InboxConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            stale_timeout_minutes: 5,
            retention_days: 7,
        }
    }
}

/// Dead letter store settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DlqConfig {
    /// Default: 1000.
    pub capacity: usize,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            capacity: crate::dlq::DEFAULT_CAPACITY,
        }
    }
}

/// Main application configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Environment token, first subject segment. Default: `development`.
    pub env: String,
    /// Application token, second subject segment of topics. Default: `app`.
    pub app_name: String,
    pub broker: BrokerConfig,
    pub stream: StreamConfig,
    pub consumer: ConsumerConfig,
    pub outbox: OutboxConfig,
    pub inbox: InboxConfig,
    pub dlq: DlqConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            env: "development".to_string(),
            app_name: "app".to_string(),
            broker: BrokerConfig::default(),
            stream: StreamConfig::default(),
            consumer: ConsumerConfig::default(),
            outbox: OutboxConfig::default(),
            inbox: InboxConfig::default(),
            dlq: DlqConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `courier.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `COURIER_CONFIG` environment variable (if set)
    /// 4. Environment variables such as `COURIER__CONSUMER__MAX_DELIVER`
    ///
    /// The result is validated before it is returned.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config: Config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("broker.urls")
                    .with_list_parse_key("consumer.backoff_ms")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Parse YAML text, applying defaults for missing keys.
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(text)
            .map_err(|e| invalid("yaml", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Create config for testing: fast timeouts, short backoff.
    pub fn for_test() -> Self {
        Self {
            env: "test".to_string(),
            app_name: "courier".to_string(),
            consumer: ConsumerConfig {
                max_deliver: 3,
                ack_wait_ms: 2000,
                backoff_ms: vec![10, 20],
                concurrency: 2,
                batch_size: 10,
                pull_expires_ms: 50,
                subscriber_timeout_ms: 1000,
                shutdown_grace_ms: 500,
            },
            ..Self::default()
        }
    }

    /// Reject values no component can work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_token("env", &self.env)?;
        check_token("app_name", &self.app_name)?;

        if self.broker.urls.is_empty() {
            return Err(invalid("broker.urls", "at least one server URL is required"));
        }
        if self.stream.name.is_empty()
            || self
                .stream
                .name
                .contains(|c: char| c == '.' || c == '*' || c == '>' || c.is_whitespace())
        {
            return Err(invalid(
                "stream.name",
                format!("'{}' is not a legal stream name", self.stream.name),
            ));
        }

        let consumer = &self.consumer;
        if consumer.max_deliver == 0 {
            return Err(invalid("consumer.max_deliver", "must be at least 1"));
        }
        if consumer.concurrency == 0 {
            return Err(invalid("consumer.concurrency", "must be at least 1"));
        }
        if consumer.batch_size == 0 {
            return Err(invalid("consumer.batch_size", "must be at least 1"));
        }
        if consumer.subscriber_timeout_ms >= consumer.ack_wait_ms {
            return Err(invalid(
                "consumer.subscriber_timeout_ms",
                "must be below consumer.ack_wait_ms, or the broker redelivers in-flight messages",
            ));
        }

        if self.outbox.batch_size == 0 {
            return Err(invalid("outbox.batch_size", "must be at least 1"));
        }
        if self.outbox.max_attempts == 0 {
            return Err(invalid("outbox.max_attempts", "must be at least 1"));
        }
        if self.outbox.sweep_interval_secs == 0 {
            return Err(invalid("outbox.sweep_interval_secs", "must be at least 1"));
        }
        if self.dlq.capacity == 0 {
            return Err(invalid("dlq.capacity", "must be at least 1"));
        }
        Ok(())
    }
}
