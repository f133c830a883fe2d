// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Relay service configuration
//!
//! Loaded from TOML. Every field has a default, so an empty file (or no
//! file at all) yields a working local setup.
//!
//! ```toml
//! [broker]
//! url = "amqp://127.0.0.1:5672/%2f"
//! queue = "relay_queue"
//!
//! [publisher]
//! source_path = "data/source.db"
//! table = "tblData"
//! key_column = "timestamp"
//! interval_ms = 10000
//!
//! [consumer]
//! log_path = "data/relay_log.csv"
//! ack_mode = "after_append"
//! ```

use crate::broker::AckMode;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Broker connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Broker URL (`amqp://...`, or `memory://` for an in-process broker)
    pub url: String,

    /// Queue records are relayed through
    pub queue: String,

    /// Declare the queue durable
    pub durable: bool,

    /// Unacknowledged deliveries a consumer may hold
    pub prefetch: u16,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: "amqp://127.0.0.1:5672/%2f".to_string(),
            queue: "relay_queue".to_string(),
            durable: true,
            prefetch: 10,
        }
    }
}

impl BrokerConfig {
    pub fn is_memory(&self) -> bool {
        self.url.starts_with("memory://")
    }
}

/// Relay publisher settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    /// SQLite database holding the source table
    pub source_path: PathBuf,

    /// Source table name
    pub table: String,

    /// Numeric column the source is ordered by
    pub key_column: String,

    /// Poll period in milliseconds
    pub interval_ms: u64,

    /// Records relayed per tick at most
    pub batch_size: usize,

    /// Watermark checkpoint file (none = in-memory watermark only)
    pub checkpoint_path: Option<PathBuf>,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            source_path: PathBuf::from("data/source.db"),
            table: "tblData".to_string(),
            key_column: "timestamp".to_string(),
            interval_ms: 10_000,
            batch_size: 1,
            checkpoint_path: None,
        }
    }
}

impl PublisherConfig {
    pub fn builder() -> PublisherConfigBuilder {
        PublisherConfigBuilder::default()
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Builder for [`PublisherConfig`]
#[derive(Debug, Default)]
pub struct PublisherConfigBuilder {
    source_path: Option<PathBuf>,
    table: Option<String>,
    key_column: Option<String>,
    interval_ms: Option<u64>,
    batch_size: Option<usize>,
    checkpoint_path: Option<PathBuf>,
}

impl PublisherConfigBuilder {
    pub fn source_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.source_path = Some(path.into());
        self
    }

    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn key_column(mut self, column: impl Into<String>) -> Self {
        self.key_column = Some(column.into());
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval_ms = Some(interval.as_millis() as u64);
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size);
        self
    }

    /// Persist the watermark to `path`
    pub fn checkpoint_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.checkpoint_path = Some(path.into());
        self
    }

    pub fn build(self) -> PublisherConfig {
        let defaults = PublisherConfig::default();

        PublisherConfig {
            source_path: self.source_path.unwrap_or(defaults.source_path),
            table: self.table.unwrap_or(defaults.table),
            key_column: self.key_column.unwrap_or(defaults.key_column),
            interval_ms: self.interval_ms.unwrap_or(defaults.interval_ms),
            batch_size: self.batch_size.unwrap_or(defaults.batch_size),
            checkpoint_path: self.checkpoint_path.or(defaults.checkpoint_path),
        }
    }
}

/// On-disk format of the log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Csv,
    Sqlite,
}

impl LogFormat {
    /// `.db`, `.sqlite` and `.sqlite3` select SQLite; anything else is CSV.
    pub fn from_path(path: &Path) -> Self {
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref()
        {
            Some("db" | "sqlite" | "sqlite3") => Self::Sqlite,
            _ => Self::Csv,
        }
    }
}

/// Durable consumer settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Log file records are appended to
    pub log_path: PathBuf,

    /// Log format (default: guessed from the file extension)
    pub log_format: Option<LogFormat>,

    /// When deliveries are acknowledged
    pub ack_mode: AckMode,

    /// Extra append attempts after the first failure
    pub append_retries: u32,

    /// Delay before the first retry, doubled on each further attempt
    pub retry_backoff_ms: u64,

    /// Timestamp column used by the read-side views
    pub timestamp_column: String,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            log_path: PathBuf::from("data/relay_log.csv"),
            log_format: None,
            ack_mode: AckMode::AfterAppend,
            append_retries: 3,
            retry_backoff_ms: 500,
            timestamp_column: "timestamp".to_string(),
        }
    }
}

impl ConsumerConfig {
    pub fn builder() -> ConsumerConfigBuilder {
        ConsumerConfigBuilder::default()
    }

    pub fn resolved_format(&self) -> LogFormat {
        self.log_format
            .unwrap_or_else(|| LogFormat::from_path(&self.log_path))
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Builder for [`ConsumerConfig`]
#[derive(Debug, Default)]
pub struct ConsumerConfigBuilder {
    log_path: Option<PathBuf>,
    log_format: Option<LogFormat>,
    ack_mode: Option<AckMode>,
    append_retries: Option<u32>,
    retry_backoff_ms: Option<u64>,
    timestamp_column: Option<String>,
}

impl ConsumerConfigBuilder {
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    pub fn log_format(mut self, format: LogFormat) -> Self {
        self.log_format = Some(format);
        self
    }

    pub fn ack_mode(mut self, mode: AckMode) -> Self {
        self.ack_mode = Some(mode);
        self
    }

    pub fn append_retries(mut self, retries: u32) -> Self {
        self.append_retries = Some(retries);
        self
    }

    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff_ms = Some(backoff.as_millis() as u64);
        self
    }

    pub fn timestamp_column(mut self, column: impl Into<String>) -> Self {
        self.timestamp_column = Some(column.into());
        self
    }

    pub fn build(self) -> ConsumerConfig {
        let defaults = ConsumerConfig::default();

        ConsumerConfig {
            log_path: self.log_path.unwrap_or(defaults.log_path),
            log_format: self.log_format.or(defaults.log_format),
            ack_mode: self.ack_mode.unwrap_or(defaults.ack_mode),
            append_retries: self.append_retries.unwrap_or(defaults.append_retries),
            retry_backoff_ms: self.retry_backoff_ms.unwrap_or(defaults.retry_backoff_ms),
            timestamp_column: self.timestamp_column.unwrap_or(defaults.timestamp_column),
        }
    }
}

/// Full service configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub broker: BrokerConfig,
    pub publisher: PublisherConfig,
    pub consumer: ConsumerConfig,
}

impl Config {
    /// Load and validate configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.queue.trim().is_empty() {
            return Err(ConfigError::Invalid("Queue name is empty".into()));
        }
        if self.broker.url.trim().is_empty() {
            return Err(ConfigError::Invalid("Broker URL is empty".into()));
        }
        if self.publisher.table.trim().is_empty() {
            return Err(ConfigError::Invalid("Source table name is empty".into()));
        }
        if self.publisher.key_column.trim().is_empty() {
            return Err(ConfigError::Invalid("Ordering column name is empty".into()));
        }
        if self.publisher.interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "Poll interval must be greater than zero".into(),
            ));
        }
        if self.publisher.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "Batch size must be at least 1".into(),
            ));
        }
        if self.broker.prefetch == 0 {
            return Err(ConfigError::Invalid(
                "Prefetch must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = Config::default();

        assert_eq!(config.broker.queue, "relay_queue");
        assert_eq!(config.publisher.table, "tblData");
        assert_eq!(config.publisher.key_column, "timestamp");
        assert_eq!(config.publisher.interval(), Duration::from_secs(10));
        assert_eq!(config.publisher.batch_size, 1);
        assert!(config.publisher.checkpoint_path.is_none());
        assert_eq!(config.consumer.ack_mode, AckMode::AfterAppend);
        assert_eq!(config.consumer.resolved_format(), LogFormat::Csv);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml_str(
            r#"
            [broker]
            queue = "sensors"

            [publisher]
            interval_ms = 250
            checkpoint_path = "state/watermark.json"

            [consumer]
            log_path = "out/log.sqlite"
            ack_mode = "auto"
            "#,
        )
        .unwrap();

        assert_eq!(config.broker.queue, "sensors");
        assert_eq!(config.broker.url, BrokerConfig::default().url);
        assert_eq!(config.publisher.interval_ms, 250);
        assert_eq!(config.publisher.table, "tblData");
        assert_eq!(
            config.publisher.checkpoint_path,
            Some(PathBuf::from("state/watermark.json"))
        );
        assert_eq!(config.consumer.ack_mode, AckMode::Auto);
        assert_eq!(config.consumer.resolved_format(), LogFormat::Sqlite);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let err = Config::from_toml_str("[publisher]\nbatch_size = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = Config::from_toml_str("[broker]\nqueue = \"\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        assert!(matches!(
            Config::from_toml_str("[publisher\n"),
            Err(ConfigError::Toml(_))
        ));
    }

    #[test]
    fn test_builders() {
        let publisher = PublisherConfig::builder()
            .source_path("/tmp/src.db")
            .interval(Duration::from_millis(50))
            .batch_size(8)
            .build();
        assert_eq!(publisher.interval_ms, 50);
        assert_eq!(publisher.batch_size, 8);
        assert_eq!(publisher.table, "tblData");

        let consumer = ConsumerConfig::builder()
            .log_path("out.csv")
            .log_format(LogFormat::Sqlite)
            .append_retries(0)
            .build();
        assert_eq!(consumer.resolved_format(), LogFormat::Sqlite);
        assert_eq!(consumer.append_retries, 0);
    }

    #[test]
    fn test_log_format_from_extension() {
        assert_eq!(LogFormat::from_path(Path::new("a/b.CSV")), LogFormat::Csv);
        assert_eq!(LogFormat::from_path(Path::new("log.db")), LogFormat::Sqlite);
        assert_eq!(LogFormat::from_path(Path::new("log")), LogFormat::Csv);
    }
}
