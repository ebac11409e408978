//! Configuration management for the tickets service.
//!
//! Loaded once at startup from environment variables with defaults.
//! [`Config::from_lookup`] takes any key lookup so tests do not touch the
//! process environment.

use crate::worker::WorkerConfig;
use courier_runtime::retry::RetryPolicy;
use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Invalid configuration value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A variable is set to a value that cannot be used.
    #[error("Invalid value '{value}' for {key}")]
    Invalid {
        /// Variable name
        key: String,
        /// Offending value
        value: String,
    },
}

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP server
    pub server: ServerConfig,
    /// Logging
    pub log: LogConfig,
    /// Whether to install the Prometheus recorder and serve `/metrics`
    pub metrics_enabled: bool,
    /// Base URL of the external services gateway
    pub gateway_addr: String,
    /// Broker selection
    pub broker: BrokerConfig,
    /// Local retry policy
    pub retry: RetryConfig,
    /// Delivery budget and dead-lettering
    pub router: RouterSettings,
}

/// HTTP server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to bind to
    pub port: u16,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable lines
    Pretty,
    /// One JSON object per line
    Json,
}

impl FromStr for LogFormat {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(()),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,
    /// Output format
    pub format: LogFormat,
}

/// Which broker implementation carries the messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerBackend {
    /// In-process stream with consumer groups and redelivery
    MemoryStream,
    /// In-process bounded queues
    MemoryQueue,
    /// Kafka-compatible cluster (needs the `redpanda` feature)
    Redpanda,
}

impl FromStr for BrokerBackend {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "memory-stream" => Ok(Self::MemoryStream),
            "memory-queue" => Ok(Self::MemoryQueue),
            "redpanda" => Ok(Self::Redpanda),
            _ => Err(()),
        }
    }
}

/// Broker configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Selected backend
    pub backend: BrokerBackend,
    /// Bootstrap servers for the Redpanda backend
    pub redpanda_brokers: String,
    /// Per-group buffer size of the memory queue backend
    pub queue_capacity: usize,
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Retries after the first failure
    pub max_retries: usize,
    /// Delay before the first retry
    pub initial_interval: Duration,
    /// Cap on the delay
    pub max_interval: Duration,
    /// Growth factor of the delay
    pub multiplier: f64,
}

/// Router delivery settings.
#[derive(Debug, Clone)]
pub struct RouterSettings {
    /// Deliveries of one message before it is dead-lettered
    pub max_deliveries: u32,
    /// Dead-letter topic; empty means dead letters are only logged
    pub dead_letter_topic: String,
}

impl Config {
    /// Load configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for a value that does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from `lookup`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for a value that does not parse.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(lookup);

        let retry = RetryConfig {
            max_retries: vars.parse("RETRY_MAX_RETRIES", 10)?,
            initial_interval: Duration::from_millis(vars.parse("RETRY_INITIAL_INTERVAL_MS", 100)?),
            max_interval: Duration::from_millis(vars.parse("RETRY_MAX_INTERVAL_MS", 1000)?),
            multiplier: vars.parse_checked("RETRY_MULTIPLIER", 2.0, |m: &f64| m.is_finite() && *m >= 1.0)?,
        };

        Ok(Self {
            server: ServerConfig {
                host: vars.string("HTTP_HOST", "0.0.0.0"),
                port: vars.parse("HTTP_PORT", 8080)?,
            },
            log: LogConfig {
                level: vars.string("LOG_LEVEL", "info"),
                format: vars.parse("LOG_FORMAT", LogFormat::Pretty)?,
            },
            metrics_enabled: vars.parse("METRICS_ENABLED", true)?,
            gateway_addr: vars.string("GATEWAY_ADDR", "http://localhost:8888"),
            broker: BrokerConfig {
                backend: vars.parse("BROKER_BACKEND", BrokerBackend::MemoryStream)?,
                redpanda_brokers: vars.string("REDPANDA_BROKERS", "localhost:9092"),
                queue_capacity: vars.parse_checked("QUEUE_CAPACITY", 1024, |c: &usize| *c > 0)?,
            },
            retry,
            router: RouterSettings {
                max_deliveries: vars.parse_checked("ROUTER_MAX_DELIVERIES", 3, |n: &u32| *n > 0)?,
                dead_letter_topic: vars.string("DEAD_LETTER_TOPIC", "dead-letter"),
            },
        })
    }

    /// The retry policy described by [`Config::retry`].
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::builder()
            .max_retries(self.retry.max_retries)
            .initial_delay(self.retry.initial_interval)
            .max_delay(self.retry.max_interval)
            .multiplier(self.retry.multiplier)
            .build()
    }

    /// Worker settings derived from this configuration.
    #[must_use]
    pub fn worker(&self) -> WorkerConfig {
        let topic = self.router.dead_letter_topic.trim();
        WorkerConfig {
            retry: self.retry_policy(),
            max_deliveries: self.router.max_deliveries,
            dead_letter_topic: (!topic.is_empty()).then(|| topic.to_string()),
        }
    }

    /// `host:port` the HTTP server binds to.
    #[must_use]
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

struct Vars<F>(F);

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, key: &str, default: &str) -> String {
        (self.0)(key).unwrap_or_else(|| default.to_string())
    }

    fn parse<T: FromStr>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        self.parse_checked(key, default, |_| true)
    }

    fn parse_checked<T, C>(&self, key: &str, default: T, valid: C) -> Result<T, ConfigError>
    where
        T: FromStr,
        C: Fn(&T) -> bool,
    {
        let Some(value) = (self.0)(key) else {
            return Ok(default);
        };
        match value.trim().parse::<T>() {
            Ok(parsed) if valid(&parsed) => Ok(parsed),
            _ => Err(invalid(key, value)),
        }
    }
}

fn invalid(key: &str, value: impl Display) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        value: value.to_string(),
    }
}
