// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Row Relay
//!
//! Relays newly appended rows from an ordered SQLite table through a broker
//! queue into a schema-flexible log.
//!
//! # Features
//!
//! - **Watermark Cursor** -- Strictly increasing `(key, rowid)` position, optionally checkpointed
//! - **Relay Publisher** -- One confirmed publish at a time, never skips or reorders rows
//! - **Durable Consumer** -- Ack after append, retry with backoff, requeue on failure
//! - **Schema-Union Log** -- CSV or SQLite log whose column set only grows
//! - **Brokers** -- RabbitMQ over AMQP (feature `amqp`) or in-process
//!
//! # Architecture
//!
//! ```text
//! RelayPipeline
//! +-- RelayPublisher   (SqliteSource -> Broker queue)
//! +-- DurableConsumer  (Broker queue -> LogStore)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use rowrelay::{Config, MemoryBroker, RelayPipeline, open_log};
//!
//! let config = Config::from_file("rowrelay.toml")?;
//! let broker = Arc::new(MemoryBroker::new());
//! let pipeline = RelayPipeline::connect(&config, broker, source, log).await?;
//! pipeline.run(CancellationToken::new()).await?;
//! ```

pub mod broker;
pub mod checkpoint;
pub mod config;
pub mod consumer;
pub mod csv_log;
pub mod cursor;
pub mod error;
pub mod publisher;
pub mod record;
pub mod series;
pub mod source;
pub mod sqlite_log;
pub mod table;

#[cfg(feature = "amqp")]
pub use broker::AmqpBroker;
pub use broker::{AckMode, Broker, BrokerError, Delivery, MemoryBroker, QueueConsumer};
pub use checkpoint::WatermarkCheckpoint;
pub use config::{BrokerConfig, Config, ConsumerConfig, LogFormat, PublisherConfig};
pub use consumer::{ConsumerStats, DurableConsumer, HandleOutcome};
pub use csv_log::CsvLog;
pub use cursor::{Position, WatermarkCursor};
pub use error::RelayError;
pub use publisher::{PublisherStats, RelayPublisher, TickOutcome};
pub use record::{OrderingKey, Record};
pub use series::{key_options, keyed_series, series, SeriesPoint};
pub use source::{MemorySource, RecordSource, SqliteSource};
pub use sqlite_log::SqliteLog;
pub use table::{LogError, LogStore, LogTable};

use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Open the log described by `config`, picking the backend from
/// [`ConsumerConfig::resolved_format`].
pub fn open_log(config: &ConsumerConfig) -> Result<Box<dyn LogStore>, LogError> {
    Ok(match config.resolved_format() {
        LogFormat::Csv => Box::new(CsvLog::new(&config.log_path)),
        LogFormat::Sqlite => Box::new(SqliteLog::open(&config.log_path)?),
    })
}

/// Publisher and consumer sharing one broker.
///
/// # Type Parameters
///
/// - `S` -- Record source (e.g., `SqliteSource`)
/// - `B` -- Broker implementation
/// - `L` -- Log backend
pub struct RelayPipeline<S: RecordSource, B: Broker, L: LogStore> {
    publisher: RelayPublisher<S, B>,
    consumer: DurableConsumer<L, B::Consumer>,
}

impl<S: RecordSource, B: Broker, L: LogStore> RelayPipeline<S, B, L> {
    pub fn new(publisher: RelayPublisher<S, B>, consumer: DurableConsumer<L, B::Consumer>) -> Self {
        Self {
            publisher,
            consumer,
        }
    }

    /// Build both halves from `config` and subscribe the consumer.
    pub async fn connect(
        config: &Config,
        broker: Arc<B>,
        source: S,
        log: Arc<Mutex<L>>,
    ) -> Result<Self, BrokerError> {
        let queue = config.broker.queue.clone();
        let consumer =
            DurableConsumer::subscribe(broker.as_ref(), config.consumer.clone(), &queue, log)
                .await?;
        let publisher = RelayPublisher::new(config.publisher.clone(), queue, source, broker);
        Ok(Self::new(publisher, consumer))
    }

    /// Run both loops until `shutdown` is cancelled.
    ///
    /// If the publisher stops on a watermark regression the consumer is
    /// asked to stop too, after finishing its current message.
    pub async fn run(
        self,
        shutdown: CancellationToken,
    ) -> Result<(PublisherStats, ConsumerStats), RelayError> {
        let Self {
            publisher,
            consumer,
        } = self;
        let token = shutdown.child_token();

        let publisher = {
            let token = token.clone();
            async move {
                let result = publisher.run(token.clone()).await;
                if result.is_err() {
                    token.cancel();
                }
                result
            }
        };
        let consumer = consumer.run(token);

        let (published, consumed) = tokio::join!(publisher, consumer);
        Ok((published?, consumed?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_log_by_extension() {
        let dir = TempDir::new().unwrap();

        let csv = ConsumerConfig::builder()
            .log_path(dir.path().join("relay_log.csv"))
            .build();
        assert_eq!(open_log(&csv).unwrap().location(), csv.log_path.display().to_string());

        let sqlite = ConsumerConfig::builder()
            .log_path(dir.path().join("relay_log.db"))
            .build();
        let mut log = open_log(&sqlite).unwrap();
        log.append(&Record::new().with_field("a", 1)).unwrap();
        assert_eq!(log.row_count().unwrap(), 1);
        assert!(dir.path().join("relay_log.db").exists());
    }
}
