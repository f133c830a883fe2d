// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Relay publisher
//!
//! Moves rows from the source to the broker queue, one tick at a time.
//!
//! # Operation
//!
//! 1. Read the watermark
//! 2. Ask the source for the next row after it
//! 3. Nothing new: log "idle" and wait for the next tick
//! 4. Otherwise encode the row and publish it
//! 5. Confirmed: advance the watermark, log "sent"
//! 6. Not confirmed: keep the watermark, the same row goes out next tick
//!
//! With `batch_size > 1` steps 2-5 repeat within one tick until the source
//! is drained, the batch is full, or a publish fails.

use crate::broker::Broker;
use crate::checkpoint::WatermarkCheckpoint;
use crate::config::PublisherConfig;
use crate::cursor::{Position, WatermarkCursor};
use crate::error::RelayError;
use crate::source::RecordSource;
use std::sync::Arc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Publisher statistics
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PublisherStats {
    /// Ticks executed
    pub ticks: u64,
    /// Ticks that found nothing to send
    pub idle_ticks: u64,
    /// Records confirmed by the broker
    pub records_sent: u64,
    /// Publishes that were not confirmed
    pub publish_failures: u64,
    /// Failed source polls
    pub source_errors: u64,
}

/// Result of one tick.
#[derive(Debug)]
pub enum TickOutcome {
    /// No row after the watermark.
    Idle,
    /// `count` rows confirmed; the watermark is now `watermark`.
    Sent { count: usize, watermark: Position },
    /// The tick stopped early after `sent` rows; retried next tick.
    Deferred { sent: usize, reason: RelayError },
}

/// Relay publisher control loop
pub struct RelayPublisher<S: RecordSource, B: Broker> {
    config: PublisherConfig,
    queue: String,
    source: S,
    broker: Arc<B>,
    cursor: WatermarkCursor,
    checkpoint: Option<WatermarkCheckpoint>,
    stats: PublisherStats,
}

impl<S: RecordSource, B: Broker> RelayPublisher<S, B> {
    /// Create a publisher. The watermark checkpoint, if configured, is not
    /// read until [`RelayPublisher::restore`] or [`RelayPublisher::run`].
    pub fn new(
        config: PublisherConfig,
        queue: impl Into<String>,
        source: S,
        broker: Arc<B>,
    ) -> Self {
        let checkpoint = config
            .checkpoint_path
            .clone()
            .map(WatermarkCheckpoint::new);

        Self {
            config,
            queue: queue.into(),
            source,
            broker,
            cursor: WatermarkCursor::new(),
            checkpoint,
            stats: PublisherStats::default(),
        }
    }

    /// Use `checkpoint` instead of the configured one.
    pub fn with_checkpoint(mut self, checkpoint: WatermarkCheckpoint) -> Self {
        self.checkpoint = Some(checkpoint);
        self
    }

    /// Start after `position` instead of at the first row.
    pub fn starting_after(mut self, position: Position) -> Self {
        self.cursor = WatermarkCursor::starting_at(position);
        self
    }

    pub fn watermark(&self) -> Option<Position> {
        self.cursor.current()
    }

    pub fn stats(&self) -> &PublisherStats {
        &self.stats
    }

    /// Load the persisted watermark, if any.
    pub async fn restore(&mut self) -> Result<Option<Position>, RelayError> {
        let Some(checkpoint) = &self.checkpoint else {
            return Ok(None);
        };

        let restored = checkpoint.load().await?;
        if let Some(position) = restored {
            tracing::info!(
                "Resuming after watermark {} from {}",
                position,
                checkpoint.path().display()
            );
            self.cursor = WatermarkCursor::starting_at(position);
        }
        Ok(restored)
    }

    /// Run one tick.
    ///
    /// Only a watermark regression is returned as an error; every other
    /// failure ends the tick as [`TickOutcome::Deferred`].
    pub async fn tick(&mut self) -> Result<TickOutcome, RelayError> {
        self.stats.ticks += 1;
        let mut sent = 0;

        while sent < self.config.batch_size.max(1) {
            let row = match self.source.next_record(self.cursor.current()) {
                Ok(Some(row)) => row,
                Ok(None) => break,
                Err(source) => {
                    self.stats.source_errors += 1;
                    let reason = RelayError::SourceUnavailable {
                        table: self.source.name().to_string(),
                        source,
                    };
                    return Ok(self.defer(sent, reason));
                }
            };

            self.cursor.check(row.position)?;

            let payload = match row.record.to_message() {
                Ok(payload) => payload,
                Err(source) => {
                    let reason = RelayError::Encode {
                        key: row.position.key,
                        source,
                    };
                    return Ok(self.defer(sent, reason));
                }
            };

            if let Err(source) = self.broker.publish(&self.queue, payload).await {
                self.stats.publish_failures += 1;
                let reason = RelayError::PublishFailure {
                    queue: self.queue.clone(),
                    key: row.position.key,
                    source,
                };
                return Ok(self.defer(sent, reason));
            }

            self.cursor.advance(row.position)?;
            self.stats.records_sent += 1;
            sent += 1;
            tracing::info!(
                "sent: key={} row={} queue={}",
                row.position.key,
                row.position.row_id,
                self.queue
            );

            save_watermark(self.checkpoint.as_ref(), row.position).await;
        }

        match self.cursor.current() {
            Some(watermark) if sent > 0 => Ok(TickOutcome::Sent {
                count: sent,
                watermark,
            }),
            _ => {
                self.stats.idle_ticks += 1;
                tracing::info!(
                    "idle: no rows in {} after {}",
                    self.source.name(),
                    self.watermark_label()
                );
                Ok(TickOutcome::Idle)
            }
        }
    }

    fn watermark_label(&self) -> String {
        self.cursor
            .current()
            .map_or_else(|| "start".to_string(), |p| p.to_string())
    }

    fn defer(&self, sent: usize, reason: RelayError) -> TickOutcome {
        tracing::warn!(
            "Tick deferred at watermark {} after {} record(s): {}",
            self.watermark_label(),
            sent,
            reason
        );
        TickOutcome::Deferred { sent, reason }
    }

    /// Run until `shutdown` is cancelled or the watermark regresses.
    ///
    /// A tick in progress always completes, so no record is left half
    /// published when the loop exits.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<PublisherStats, RelayError> {
        tracing::info!(
            "Relay publisher starting: {} ({}) -> queue '{}', every {:?}",
            self.source.name(),
            self.config.key_column,
            self.queue,
            self.config.interval()
        );

        self.restore().await?;

        let mut ticker = interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut declared = false;
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if !declared {
                match self.broker.declare_queue(&self.queue).await {
                    Ok(()) => declared = true,
                    Err(e) => {
                        tracing::warn!("Cannot declare queue '{}': {}", self.queue, e);
                        continue;
                    }
                }
            }

            if let Err(e) = self.tick().await {
                tracing::error!("Relay publisher stopping: {}", e);
                return Err(e);
            }
        }

        tracing::info!(
            "Relay publisher stopped: {} sent, {} idle ticks, {} publish failures, {} source errors",
            self.stats.records_sent,
            self.stats.idle_ticks,
            self.stats.publish_failures,
            self.stats.source_errors
        );
        Ok(self.stats)
    }
}

async fn save_watermark(checkpoint: Option<&WatermarkCheckpoint>, position: Position) {
    if let Some(checkpoint) = checkpoint {
        if let Err(e) = checkpoint.save(&position).await {
            // The in-memory watermark is still correct; a restart may resend
            tracing::error!("Failed to persist watermark {}: {}", position, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{AckMode, MemoryBroker, QueueConsumer};
    use crate::record::{OrderingKey, Record};
    use crate::source::MemorySource;
    use std::time::Duration;
    use tempfile::TempDir;

    fn config(batch_size: usize) -> PublisherConfig {
        PublisherConfig::builder()
            .interval(Duration::from_millis(10))
            .batch_size(batch_size)
            .build()
    }

    type TestPublisher = RelayPublisher<MemorySource, MemoryBroker>;

    async fn setup(batch_size: usize) -> (MemorySource, Arc<MemoryBroker>, TestPublisher) {
        let source = MemorySource::new("tblData", "timestamp");
        let broker = Arc::new(MemoryBroker::new());
        broker.declare_queue("q").await.unwrap();
        let publisher = RelayPublisher::new(
            config(batch_size),
            "q",
            source.clone(),
            Arc::clone(&broker),
        );
        (source, broker, publisher)
    }

    #[tokio::test]
    async fn test_one_record_per_tick() {
        let (source, broker, mut publisher) = setup(1).await;
        source.push(1, Record::new().with_field("x", 1));
        source.push(2, Record::new().with_field("x", 2));

        assert!(matches!(
            publisher.tick().await.unwrap(),
            TickOutcome::Sent { count: 1, .. }
        ));
        assert_eq!(broker.queue_depth("q"), 1);
        assert!(matches!(
            publisher.tick().await.unwrap(),
            TickOutcome::Sent { count: 1, .. }
        ));
        assert!(matches!(publisher.tick().await.unwrap(), TickOutcome::Idle));

        assert_eq!(publisher.watermark().map(|p| p.key), Some(OrderingKey::Int(2)));
        assert_eq!(publisher.stats().records_sent, 2);
        assert_eq!(publisher.stats().idle_ticks, 1);
    }

    #[tokio::test]
    async fn test_failed_publish_keeps_watermark() {
        let (source, broker, mut publisher) = setup(1).await;
        source.push(5, Record::new().with_field("x", 1));

        broker.fail_next_publishes(1);
        let outcome = publisher.tick().await.unwrap();
        assert!(matches!(
            outcome,
            TickOutcome::Deferred {
                sent: 0,
                reason: RelayError::PublishFailure { .. }
            }
        ));
        assert!(publisher.watermark().is_none());
        assert_eq!(broker.queue_depth("q"), 0);

        publisher.tick().await.unwrap();
        assert_eq!(publisher.watermark(), Some(Position::new(5, 1)));
        assert_eq!(broker.queue_depth("q"), 1);
    }

    #[tokio::test]
    async fn test_source_outage_is_deferred() {
        let (source, _broker, mut publisher) = setup(1).await;
        source.push(1, Record::new());
        source.fail_next(1);

        assert!(matches!(
            publisher.tick().await.unwrap(),
            TickOutcome::Deferred {
                reason: RelayError::SourceUnavailable { .. },
                ..
            }
        ));
        assert_eq!(publisher.stats().source_errors, 1);
        assert!(matches!(
            publisher.tick().await.unwrap(),
            TickOutcome::Sent { .. }
        ));
    }

    #[tokio::test]
    async fn test_batch_stops_at_end_of_source() {
        let (source, broker, mut publisher) = setup(10).await;
        for key in [1, 3, 3, 7] {
            source.push(key, Record::new().with_field("k", key));
        }

        match publisher.tick().await.unwrap() {
            TickOutcome::Sent { count, watermark } => {
                assert_eq!(count, 4);
                assert_eq!(watermark.key, OrderingKey::Int(7));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(broker.queue_depth("q"), 4);
    }

    #[tokio::test]
    async fn test_resume_from_checkpoint() {
        let dir = TempDir::new().unwrap();
        let checkpoint = WatermarkCheckpoint::new(dir.path().join("watermark.json"));

        let (source, broker, publisher) = setup(1).await;
        source.push(1, Record::new().with_field("x", 1));
        source.push(2, Record::new().with_field("x", 2));

        let mut publisher = publisher.with_checkpoint(checkpoint.clone());
        publisher.tick().await.unwrap();
        assert_eq!(checkpoint.load().await.unwrap(), Some(Position::new(1, 1)));

        // A fresh publisher picks up where the first one stopped
        let mut resumed = RelayPublisher::new(config(1), "q", source.clone(), Arc::clone(&broker))
            .with_checkpoint(checkpoint);
        assert_eq!(resumed.restore().await.unwrap(), Some(Position::new(1, 1)));
        resumed.tick().await.unwrap();
        assert_eq!(resumed.watermark(), Some(Position::new(2, 2)));
        assert_eq!(broker.queue_depth("q"), 2);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let (source, broker, publisher) = setup(1).await;
        source.push(100, Record::new().with_field("x", 1));

        let token = CancellationToken::new();
        let handle = tokio::spawn(publisher.run(token.clone()));

        let mut consumer = broker.consume("q", AckMode::Auto).await.unwrap();
        let delivery = tokio::time::timeout(Duration::from_secs(2), consumer.next_delivery())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let record = Record::from_message(&delivery.payload).unwrap();
        assert_eq!(record.ordering_key("timestamp"), Some(OrderingKey::Int(100)));

        token.cancel();
        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.records_sent, 1);
    }
}
