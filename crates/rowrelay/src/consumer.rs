// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Durable consumer
//!
//! Receives relayed records from the queue and appends each one to the log,
//! one delivery at a time, in delivery order.
//!
//! # Operation
//!
//! 1. Decode the payload; a malformed message is rejected and dropped
//! 2. Append the record, retrying transient failures with backoff
//! 3. After-append mode: ack on success, requeue if the append never worked
//! 4. Auto mode: the broker already forgot the message; a failed append is
//!    reported as lost

use crate::broker::{AckMode, Broker, BrokerError, Delivery, QueueConsumer};
use crate::config::ConsumerConfig;
use crate::error::RelayError;
use crate::record::Record;
use crate::table::LogStore;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Consumer statistics
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConsumerStats {
    /// Deliveries received
    pub messages_received: u64,
    /// Deliveries flagged as redelivered by the broker
    pub redelivered: u64,
    /// Rows written to the log
    pub rows_appended: u64,
    /// Malformed messages dropped
    pub decode_errors: u64,
    /// Appends that failed after all retries
    pub append_failures: u64,
    /// Deliveries handed back to the broker for redelivery
    pub redelivery_requests: u64,
    /// Records that could not be appended and cannot be redelivered
    pub messages_lost: u64,
}

/// What happened to one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleOutcome {
    /// Appended; lists the columns the append introduced.
    Appended { new_columns: Vec<String> },
    /// Rejected without requeue.
    Dropped,
    /// Handed back to the broker.
    Requeued,
    /// Append failed after an automatic ack.
    Lost,
}

/// Durable consumer
///
/// The log sits behind a shared async mutex so readers (and other consumers
/// in the same process) can use it while the loop runs.
pub struct DurableConsumer<L: LogStore, Q: QueueConsumer> {
    config: ConsumerConfig,
    queue: String,
    log: Arc<Mutex<L>>,
    consumer: Q,
    stats: ConsumerStats,
}

impl<L: LogStore, Q: QueueConsumer> DurableConsumer<L, Q> {
    pub fn new(
        config: ConsumerConfig,
        queue: impl Into<String>,
        log: Arc<Mutex<L>>,
        consumer: Q,
    ) -> Self {
        Self {
            config,
            queue: queue.into(),
            log,
            consumer,
            stats: ConsumerStats::default(),
        }
    }

    /// Declare `queue` on `broker` and subscribe with the configured ack mode.
    pub async fn subscribe<B>(
        broker: &B,
        config: ConsumerConfig,
        queue: impl Into<String>,
        log: Arc<Mutex<L>>,
    ) -> Result<Self, BrokerError>
    where
        B: Broker<Consumer = Q>,
    {
        let queue = queue.into();
        broker.declare_queue(&queue).await?;
        let consumer = broker.consume(&queue, config.ack_mode).await?;
        Ok(Self::new(config, queue, log, consumer))
    }

    pub fn stats(&self) -> &ConsumerStats {
        &self.stats
    }

    pub fn log(&self) -> Arc<Mutex<L>> {
        Arc::clone(&self.log)
    }

    /// Process one delivery to completion.
    pub async fn handle(&mut self, delivery: Delivery) -> HandleOutcome {
        self.stats.messages_received += 1;
        let tag = delivery.tag;
        if delivery.redelivered {
            self.stats.redelivered += 1;
            tracing::debug!("Message {} on '{}' is a redelivery", tag, self.queue);
        }

        let record = match Record::from_message(&delivery.payload) {
            Ok(record) => record,
            Err(e) => {
                self.stats.decode_errors += 1;
                tracing::error!("Dropping message {} from '{}': {}", tag, self.queue, e);
                self.reject(tag, false).await;
                return HandleOutcome::Dropped;
            }
        };

        match append_with_retry(&self.log, &self.config, &record).await {
            Ok(new_columns) => {
                self.stats.rows_appended += 1;
                if !new_columns.is_empty() {
                    tracing::info!("Log gained column(s): {}", new_columns.join(", "));
                }
                if let Err(e) = self.consumer.ack(tag).await {
                    // Appended but unacknowledged: the broker will redeliver
                    tracing::warn!("Failed to ack message {} on '{}': {}", tag, self.queue, e);
                }
                HandleOutcome::Appended { new_columns }
            }
            Err(e) => {
                self.stats.append_failures += 1;
                let retryable = matches!(
                    &e,
                    RelayError::AppendFailure { source, .. } if source.is_retryable()
                );

                match self.config.ack_mode {
                    AckMode::AfterAppend if retryable => {
                        tracing::error!("{}; returning message {} to '{}'", e, tag, self.queue);
                        self.stats.redelivery_requests += 1;
                        self.reject(tag, true).await;
                        HandleOutcome::Requeued
                    }
                    AckMode::AfterAppend => {
                        tracing::error!("{}; dropping message {} from '{}'", e, tag, self.queue);
                        self.reject(tag, false).await;
                        HandleOutcome::Dropped
                    }
                    AckMode::Auto => {
                        tracing::error!(
                            "{}; message {} from '{}' was already acknowledged and is lost",
                            e,
                            tag,
                            self.queue
                        );
                        self.stats.messages_lost += 1;
                        HandleOutcome::Lost
                    }
                }
            }
        }
    }

    async fn reject(&mut self, tag: u64, requeue: bool) {
        if let Err(e) = self.consumer.reject(tag, requeue).await {
            tracing::warn!("Failed to reject message {} on '{}': {}", tag, self.queue, e);
        }
    }

    /// Consume until `shutdown` is cancelled or the subscription ends.
    ///
    /// A delivery being handled when shutdown is requested is finished
    /// (appended and settled) before the loop returns.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<ConsumerStats, RelayError> {
        let location = self.log.lock().await.location();
        tracing::info!(
            "Durable consumer starting: queue '{}' -> {} (ack {})",
            self.queue,
            location,
            self.config.ack_mode
        );

        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                next = self.consumer.next_delivery() => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    self.handle(delivery).await;
                }
                Some(Err(e)) => {
                    // Brokers resubscribe on the next poll
                    tracing::warn!("Delivery error on '{}': {}", self.queue, e);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.retry_backoff()) => {}
                    }
                }
                None => {
                    tracing::warn!("Subscription to '{}' ended", self.queue);
                    break;
                }
            }
        }

        tracing::info!(
            "Durable consumer stopped: {} received, {} appended, {} dropped, {} requeued, {} lost",
            self.stats.messages_received,
            self.stats.rows_appended,
            self.stats.decode_errors,
            self.stats.redelivery_requests,
            self.stats.messages_lost
        );
        Ok(self.stats)
    }
}

/// Append `record`, retrying retryable failures with doubling backoff.
async fn append_with_retry<L: LogStore>(
    log: &Mutex<L>,
    config: &ConsumerConfig,
    record: &Record,
) -> Result<Vec<String>, RelayError> {
    let mut backoff = config.retry_backoff();
    let mut attempt = 0;

    loop {
        let result = {
            let mut log = log.lock().await;
            log.append(record).map_err(|source| (log.location(), source))
        };

        match result {
            Ok(added) => return Ok(added),
            Err((location, source)) => {
                if attempt >= config.append_retries || !source.is_retryable() {
                    return Err(RelayError::AppendFailure { location, source });
                }
                attempt += 1;
                tracing::warn!(
                    "Append to {} failed ({}), retry {}/{} in {:?}",
                    location,
                    source,
                    attempt,
                    config.append_retries,
                    backoff
                );
                tokio::time::sleep(backoff).await;
                backoff = backoff.saturating_mul(2);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::table::{LogError, LogTable};
    use serde_json::json;
    use std::time::Duration;

    /// Log that fails its first `failures` appends with an I/O error.
    struct FlakyLog {
        inner: LogTable,
        failures: usize,
    }

    impl FlakyLog {
        fn new(failures: usize) -> Self {
            Self {
                inner: LogTable::new(),
                failures,
            }
        }
    }

    impl LogStore for FlakyLog {
        fn append(&mut self, record: &Record) -> Result<Vec<String>, LogError> {
            if self.failures > 0 {
                self.failures -= 1;
                return Err(LogError::Io {
                    path: "flaky".into(),
                    source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
                });
            }
            self.inner.append(record)
        }

        fn columns(&self) -> Result<Vec<String>, LogError> {
            LogStore::columns(&self.inner)
        }

        fn read_table(&self) -> Result<LogTable, LogError> {
            self.inner.read_table()
        }

        fn row_count(&self) -> Result<usize, LogError> {
            self.inner.row_count()
        }

        fn location(&self) -> String {
            "flaky".to_string()
        }
    }

    fn config(mode: AckMode, retries: u32) -> ConsumerConfig {
        ConsumerConfig::builder()
            .ack_mode(mode)
            .append_retries(retries)
            .retry_backoff(Duration::from_millis(1))
            .build()
    }

    async fn setup<L: LogStore>(
        log: L,
        mode: AckMode,
        retries: u32,
    ) -> (MemoryBroker, DurableConsumer<L, crate::broker::MemoryConsumer>) {
        let broker = MemoryBroker::new();
        let consumer = DurableConsumer::subscribe(
            &broker,
            config(mode, retries),
            "q",
            Arc::new(Mutex::new(log)),
        )
        .await
        .unwrap();
        (broker, consumer)
    }

    async fn next(consumer: &mut DurableConsumer<impl LogStore, crate::broker::MemoryConsumer>) -> Delivery {
        consumer.consumer.next_delivery().await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_append_then_ack() {
        let (broker, mut consumer) = setup(LogTable::new(), AckMode::AfterAppend, 0).await;
        broker.publish("q", br#"{"a":1}"#.to_vec()).await.unwrap();

        let delivery = next(&mut consumer).await;
        assert_eq!(
            consumer.handle(delivery).await,
            HandleOutcome::Appended {
                new_columns: vec!["a".to_string()]
            }
        );
        assert_eq!(broker.unacked_count("q"), 0);
        assert_eq!(consumer.log().lock().await.row_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_malformed_message_is_dropped() {
        let (broker, mut consumer) = setup(LogTable::new(), AckMode::AfterAppend, 3).await;
        broker.publish("q", b"{broken".to_vec()).await.unwrap();

        let delivery = next(&mut consumer).await;
        assert_eq!(consumer.handle(delivery).await, HandleOutcome::Dropped);
        assert_eq!(broker.queue_depth("q"), 0);
        assert_eq!(broker.unacked_count("q"), 0);
        assert_eq!(consumer.stats().decode_errors, 1);
    }

    #[tokio::test]
    async fn test_transient_append_failure_is_retried() {
        let (broker, mut consumer) = setup(FlakyLog::new(2), AckMode::AfterAppend, 3).await;
        broker.publish("q", br#"{"t":1}"#.to_vec()).await.unwrap();

        let delivery = next(&mut consumer).await;
        assert!(matches!(
            consumer.handle(delivery).await,
            HandleOutcome::Appended { .. }
        ));
        assert_eq!(consumer.stats().append_failures, 0);
    }

    #[tokio::test]
    async fn test_exhausted_retries_requeue_message() {
        let (broker, mut consumer) = setup(FlakyLog::new(2), AckMode::AfterAppend, 1).await;
        broker.publish("q", br#"{"t":1}"#.to_vec()).await.unwrap();

        let delivery = next(&mut consumer).await;
        assert_eq!(consumer.handle(delivery).await, HandleOutcome::Requeued);
        assert_eq!(broker.queue_depth("q"), 1);

        // The log has recovered by the time the message comes back
        let again = next(&mut consumer).await;
        assert!(again.redelivered);
        assert!(matches!(
            consumer.handle(again).await,
            HandleOutcome::Appended { .. }
        ));
        assert_eq!(consumer.stats().redelivered, 1);
        assert_eq!(consumer.log().lock().await.row_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_auto_ack_failure_is_lost() {
        let (broker, mut consumer) = setup(FlakyLog::new(5), AckMode::Auto, 0).await;
        broker.publish("q", br#"{"t":1}"#.to_vec()).await.unwrap();

        let delivery = next(&mut consumer).await;
        assert_eq!(consumer.handle(delivery).await, HandleOutcome::Lost);
        assert_eq!(broker.queue_depth("q"), 0);
        assert_eq!(consumer.stats().messages_lost, 1);
    }

    #[tokio::test]
    async fn test_empty_record_is_not_requeued() {
        let (broker, mut consumer) = setup(LogTable::new(), AckMode::AfterAppend, 3).await;
        broker.publish("q", b"{}".to_vec()).await.unwrap();

        let delivery = next(&mut consumer).await;
        assert_eq!(consumer.handle(delivery).await, HandleOutcome::Dropped);
        assert_eq!(broker.queue_depth("q"), 0);
    }

    #[tokio::test]
    async fn test_run_appends_until_cancelled() {
        let (broker, consumer) = setup(LogTable::new(), AckMode::AfterAppend, 0).await;
        let log = consumer.log();
        broker.publish("q", br#"{"timestamp":100,"x":1}"#.to_vec()).await.unwrap();
        broker.publish("q", br#"{"timestamp":200,"y":2}"#.to_vec()).await.unwrap();

        let token = CancellationToken::new();
        let handle = tokio::spawn(consumer.run(token.clone()));

        tokio::time::timeout(Duration::from_secs(2), async {
            while log.lock().await.row_count().unwrap() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        token.cancel();
        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.rows_appended, 2);

        let table = log.lock().await.read_table().unwrap();
        assert_eq!(table.columns(), ["timestamp", "x", "y"]);
        assert_eq!(table.cell(0, "y"), Some(&serde_json::Value::Null));
        assert_eq!(table.cell(1, "y"), Some(&json!(2)));
    }
}
