//! Worker configuration.
//!
//! Configuration is layered: serde defaults, then an optional TOML file,
//! then `QUEUE_WORKER__`-prefixed environment variables. It is loaded once at
//! boot and never mutated afterwards.

use config::{Config, Environment, File, FileFormat};
use lapin::uri::{AMQPAuthority, AMQPQueryString, AMQPScheme, AMQPUri, AMQPUserInfo};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::errors::ConfigError;
use crate::executor::ExecutorDescriptor;

/// Cache strategy that enables local cache eviction.
pub const CACHE_STRATEGY_DISK: &str = "disk";

/// File read when no explicit path is given.
pub const DEFAULT_CONFIG_FILE: &str = "config/default";

/// Environment variable naming the configuration file.
pub const CONFIG_PATH_ENV: &str = "QUEUE_WORKER_CONFIG";

/// Build annotation the API uses to request a specific executor.
pub const DEFAULT_ANNOTATION_KEY: &str = "screwdriver.cd/executor";

/// Backend URL of the built-in default executor.
pub const DEFAULT_EXECUTOR_URL: &str = "http://127.0.0.1:8080";

const ENV_PREFIX: &str = "QUEUE_WORKER";
const ENV_SEPARATOR: &str = "__";

/// Top-level worker configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Health endpoint listener.
    #[serde(default)]
    pub httpd: HttpdConfig,
    /// Broker connection and queues.
    #[serde(default)]
    pub rabbitmq: RabbitmqConfig,
    /// Shared ecosystem settings.
    #[serde(default)]
    pub ecosystem: EcosystemConfig,
    /// Executor backends.
    #[serde(default)]
    pub executor: ExecutorConfig,
    /// Log output.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl WorkerConfig {
    /// Loads configuration from the file named by `QUEUE_WORKER_CONFIG` (or
    /// the default file when present) and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        let explicit = std::env::var(CONFIG_PATH_ENV).ok();
        Self::load_from(explicit.as_deref().map(Path::new))
    }

    /// Loads configuration from an explicit file and the environment.
    ///
    /// When `path` is `None` the default file is optional.
    pub fn load_from(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = match path {
            Some(path) => File::from(path).required(true),
            None => File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };

        let config: Self = Config::builder()
            .add_source(file)
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator(ENV_SEPARATOR)
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Parses configuration from TOML text, ignoring the environment.
    pub fn from_toml(source: &str) -> Result<Self, ConfigError> {
        let config: Self = Config::builder()
            .add_source(File::from_str(source, FileFormat::Toml))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Checks values that would otherwise fail at runtime.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(self.rabbitmq.protocol.as_str(), "amqp" | "amqps") {
            return Err(ConfigError::Invalid(format!(
                "rabbitmq.protocol '{}' is neither amqp nor amqps",
                self.rabbitmq.protocol
            )));
        }
        if self.rabbitmq.queue.trim().is_empty() {
            return Err(ConfigError::Invalid("rabbitmq.queue is empty".to_string()));
        }
        if self.rabbitmq.prefetch_count == 0 {
            return Err(ConfigError::Invalid(
                "rabbitmq.prefetch_count must be at least 1".to_string(),
            ));
        }
        if self.rabbitmq.retry_queue_enabled && self.rabbitmq.retry_queue.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "rabbitmq.retry_queue is empty while the retry queue is enabled".to_string(),
            ));
        }

        let backends = &self.executor.backends;
        let total: u64 = backends.iter().map(|b| u64::from(b.weightage)).sum();
        if total == 0 && !backends.iter().any(|b| b.name == self.executor.plugin) {
            return Err(ConfigError::Invalid(format!(
                "executor.plugin '{}' names no configured backend and no backend has weight",
                self.executor.plugin
            )));
        }

        Ok(())
    }
}

/// Health endpoint listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpdConfig {
    /// Bind address.
    #[serde(default = "default_httpd_host")]
    pub host: String,
    /// Bind port.
    #[serde(default = "default_httpd_port")]
    pub port: u16,
}

fn default_httpd_host() -> String {
    "0.0.0.0".to_string()
}

fn default_httpd_port() -> u16 {
    80
}

impl Default for HttpdConfig {
    fn default() -> Self {
        Self {
            host: default_httpd_host(),
            port: default_httpd_port(),
        }
    }
}

impl HttpdConfig {
    /// The `host:port` listen address.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Broker connection options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectOptions {
    /// Heartbeat interval negotiated with the broker.
    #[serde(default = "default_heartbeat")]
    pub heartbeat_interval_secs: u16,
    /// Base delay between reconnection attempts.
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: f64,
    /// Upper bound on the backoff between reconnection attempts.
    #[serde(default = "default_reconnect_max_delay")]
    pub reconnect_max_delay_secs: f64,
    /// Consecutive failed reconnection attempts before giving up.
    #[serde(default = "default_reconnect_limit")]
    pub reconnect_limit: u32,
}

fn default_heartbeat() -> u16 {
    20
}

fn default_reconnect_delay() -> f64 {
    5.0
}

fn default_reconnect_max_delay() -> f64 {
    60.0
}

fn default_reconnect_limit() -> u32 {
    10
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat(),
            reconnect_delay_secs: default_reconnect_delay(),
            reconnect_max_delay_secs: default_reconnect_max_delay(),
            reconnect_limit: default_reconnect_limit(),
        }
    }
}

/// Broker and queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RabbitmqConfig {
    /// URI scheme, `amqp` or `amqps`.
    #[serde(default = "default_protocol")]
    pub protocol: String,
    /// Broker user.
    #[serde(default = "default_username")]
    pub username: String,
    /// Broker password.
    #[serde(default = "default_password")]
    pub password: String,
    /// Broker host.
    #[serde(default = "default_host")]
    pub host: String,
    /// Broker port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Virtual host, with or without a leading `/`. Empty selects the
    /// broker's default vhost.
    #[serde(default = "default_vhost")]
    pub vhost: String,
    /// Connection options.
    #[serde(default)]
    pub connect_options: ConnectOptions,
    /// Primary build queue.
    #[serde(default = "default_queue")]
    pub queue: String,
    /// Maximum unacknowledged deliveries held at once.
    #[serde(default = "default_prefetch")]
    pub prefetch_count: u16,
    /// Redeliveries tolerated before a build is marked failed.
    #[serde(default = "default_reprocess_limit")]
    pub message_reprocess_limit: u64,
    /// Secondary queue for deferred verification.
    #[serde(default = "default_retry_queue")]
    pub retry_queue: String,
    /// Whether soft start failures are deferred to the retry queue.
    #[serde(default)]
    pub retry_queue_enabled: bool,
    /// Redelivery limit for the retry queue; falls back to the primary limit.
    #[serde(default)]
    pub retry_message_reprocess_limit: Option<u64>,
    /// Exchange the retry queue is bound to.
    #[serde(default = "default_exchange")]
    pub exchange: String,
}

fn default_protocol() -> String {
    "amqp".to_string()
}

fn default_username() -> String {
    "guest".to_string()
}

fn default_password() -> String {
    "guest".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    5672
}

fn default_vhost() -> String {
    String::new()
}

fn default_queue() -> String {
    "default".to_string()
}

fn default_prefetch() -> u16 {
    20
}

fn default_reprocess_limit() -> u64 {
    3
}

fn default_retry_queue() -> String {
    "delayed".to_string()
}

fn default_exchange() -> String {
    "build".to_string()
}

impl Default for RabbitmqConfig {
    fn default() -> Self {
        Self {
            protocol: default_protocol(),
            username: default_username(),
            password: default_password(),
            host: default_host(),
            port: default_port(),
            vhost: default_vhost(),
            connect_options: ConnectOptions::default(),
            queue: default_queue(),
            prefetch_count: default_prefetch(),
            message_reprocess_limit: default_reprocess_limit(),
            retry_queue: default_retry_queue(),
            retry_queue_enabled: false,
            retry_message_reprocess_limit: None,
            exchange: default_exchange(),
        }
    }
}

impl RabbitmqConfig {
    /// The broker endpoint, with the heartbeat negotiated at connect time.
    ///
    /// Built field by field so credentials and vhost never need escaping.
    #[must_use]
    pub fn amqp_endpoint(&self) -> AMQPUri {
        let scheme = if self.protocol == "amqps" {
            AMQPScheme::AMQPS
        } else {
            AMQPScheme::AMQP
        };
        let vhost = match self.vhost.strip_prefix('/').unwrap_or(&self.vhost) {
            "" => "/",
            named => named,
        };

        AMQPUri {
            scheme,
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: self.username.clone(),
                    password: self.password.clone(),
                },
                host: self.host.clone(),
                port: self.port,
            },
            vhost: vhost.to_string(),
            query: AMQPQueryString {
                heartbeat: Some(self.connect_options.heartbeat_interval_secs),
                ..AMQPQueryString::default()
            },
        }
    }

    /// The redelivery limit applied to the retry queue.
    #[must_use]
    pub fn retry_reprocess_limit(&self) -> u64 {
        self.retry_message_reprocess_limit
            .unwrap_or(self.message_reprocess_limit)
    }
}

/// Ecosystem-wide settings shared with other services.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EcosystemConfig {
    /// Build cache settings.
    #[serde(default)]
    pub cache: CacheSettings,
}

/// Build cache location and strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Storage strategy; only `disk` supports eviction from this worker.
    #[serde(default = "default_cache_strategy")]
    pub strategy: String,
    /// Root directory of the disk cache.
    #[serde(default)]
    pub path: String,
}

fn default_cache_strategy() -> String {
    "s3".to_string()
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            strategy: default_cache_strategy(),
            path: String::new(),
        }
    }
}

impl CacheSettings {
    /// Whether the disk strategy is configured.
    #[must_use]
    pub fn is_disk(&self) -> bool {
        self.strategy == CACHE_STRATEGY_DISK
    }
}

/// Executor backends and selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Default backend when no weighted pick is made.
    #[serde(default = "default_plugin")]
    pub plugin: String,
    /// Build annotation that names a backend explicitly.
    #[serde(default = "default_annotation_key")]
    pub annotation_key: String,
    /// Upper bound on a single dispatch unit; unbounded when absent.
    #[serde(default)]
    pub dispatch_timeout_secs: Option<f64>,
    /// Configured backends, in selection order.
    #[serde(default)]
    pub backends: Vec<ExecutorDescriptor>,
}

fn default_plugin() -> String {
    "default".to_string()
}

fn default_annotation_key() -> String {
    DEFAULT_ANNOTATION_KEY.to_string()
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            plugin: default_plugin(),
            annotation_key: default_annotation_key(),
            dispatch_timeout_secs: None,
            backends: vec![ExecutorDescriptor::new(default_plugin(), 0).with_url(DEFAULT_EXECUTOR_URL)],
        }
    }
}

impl ExecutorConfig {
    /// The dispatch timeout as a duration.
    #[must_use]
    pub fn dispatch_timeout(&self) -> Option<Duration> {
        self.dispatch_timeout_secs
            .filter(|secs| *secs > 0.0)
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable lines.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format.
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}
