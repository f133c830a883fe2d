// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! AMQP 0-9-1 broker (RabbitMQ)
//!
//! Publishes go through the default exchange with the queue name as routing
//! key, persistent delivery mode, and publisher confirms enabled on the
//! channel. Each consumer gets its own channel.
//!
//! The connection is rebuilt on demand: a call that finds the connection or
//! the publishing channel closed reopens it first, and a consumer whose
//! delivery stream ended subscribes again on its next poll. Delivery tags
//! from a lost channel are refused locally; the broker redelivers those
//! messages on its own.

use super::{AckMode, Broker, BrokerError, Delivery, QueueConsumer};
use crate::config::BrokerConfig;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

const PERSISTENT: u8 = 2;
const CONSUMER_TAG: &str = "rowrelay-consumer";

/// Open connection plus its confirm-mode publishing channel.
struct Link {
    connection: Connection,
    channel: Channel,
}

impl Link {
    async fn open(url: &str) -> Result<Self, BrokerError> {
        let connection = Connection::connect(url, ConnectionProperties::default()).await?;
        let channel = confirm_channel(&connection).await?;
        Ok(Self {
            connection,
            channel,
        })
    }
}

async fn confirm_channel(connection: &Connection) -> Result<Channel, BrokerError> {
    let channel = connection.create_channel().await?;
    channel
        .confirm_select(ConfirmSelectOptions::default())
        .await?;
    Ok(channel)
}

struct Shared {
    url: String,
    durable: bool,
    prefetch: u16,
    link: Mutex<Option<Link>>,
}

impl Shared {
    /// Lock the link, reopening whatever part of it has closed.
    async fn link(&self) -> Result<MutexGuard<'_, Option<Link>>, BrokerError> {
        let mut guard = self.link.lock().await;

        let connected = guard
            .as_ref()
            .is_some_and(|link| link.connection.status().connected());
        if !connected {
            if guard.take().is_some() {
                tracing::warn!("Connection to {} lost, reconnecting", self.url);
            }
            *guard = Some(Link::open(&self.url).await?);
            tracing::info!("Connected to broker at {}", self.url);
        } else if let Some(link) = guard.as_mut() {
            if !link.channel.status().connected() {
                tracing::warn!("Publishing channel to {} closed, reopening", self.url);
                link.channel = confirm_channel(&link.connection).await?;
            }
        }
        Ok(guard)
    }

    async fn publish_channel(&self) -> Result<Channel, BrokerError> {
        let guard = self.link().await?;
        guard
            .as_ref()
            .map(|link| link.channel.clone())
            .ok_or(BrokerError::Closed)
    }

    async fn declare_on(&self, channel: &Channel, queue: &str) -> Result<(), BrokerError> {
        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: self.durable,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    /// Fresh channel with the queue declared and a consumer registered.
    async fn subscribe(&self, queue: &str, mode: AckMode) -> Result<Subscription, BrokerError> {
        let channel = {
            let guard = self.link().await?;
            let link = guard.as_ref().ok_or(BrokerError::Closed)?;
            link.connection.create_channel().await?
        };
        self.declare_on(&channel, queue).await?;
        channel
            .basic_qos(self.prefetch, BasicQosOptions::default())
            .await?;

        let consumer = channel
            .basic_consume(
                queue,
                CONSUMER_TAG,
                BasicConsumeOptions {
                    no_ack: mode == AckMode::Auto,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await?;

        Ok(Subscription {
            channel,
            consumer,
            outstanding: HashSet::new(),
        })
    }
}

/// Connection to an AMQP broker.
pub struct AmqpBroker {
    shared: Arc<Shared>,
}

impl AmqpBroker {
    /// Broker at `config.url`. Nothing is opened until the first call.
    pub fn new(config: &BrokerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                url: config.url.clone(),
                durable: config.durable,
                prefetch: config.prefetch,
                link: Mutex::new(None),
            }),
        }
    }

    /// Connect and open a confirm-mode publishing channel.
    pub async fn connect(config: &BrokerConfig) -> Result<Self, BrokerError> {
        let broker = Self::new(config);
        broker.shared.link().await?;
        Ok(broker)
    }
}

impl Broker for AmqpBroker {
    type Consumer = AmqpConsumer;

    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError> {
        let channel = self.shared.publish_channel().await?;
        self.shared.declare_on(&channel, queue).await
    }

    async fn publish(&self, queue: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        let channel = self.shared.publish_channel().await?;
        let confirmation = channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default().with_delivery_mode(PERSISTENT),
            )
            .await?
            .await?;

        if confirmation.is_nack() {
            return Err(BrokerError::Nack(format!(
                "broker nacked publish to '{}'",
                queue
            )));
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, mode: AckMode) -> Result<AmqpConsumer, BrokerError> {
        let subscription = self.shared.subscribe(queue, mode).await?;
        Ok(AmqpConsumer {
            shared: Arc::clone(&self.shared),
            queue: queue.to_string(),
            mode,
            subscription: Some(subscription),
        })
    }
}

/// Consumer registration on one channel.
struct Subscription {
    channel: Channel,
    consumer: lapin::Consumer,
    /// Tags delivered on this channel and not yet settled.
    outstanding: HashSet<u64>,
}

/// Subscription on a dedicated AMQP channel, renewed after a disconnect.
pub struct AmqpConsumer {
    shared: Arc<Shared>,
    queue: String,
    mode: AckMode,
    subscription: Option<Subscription>,
}

impl AmqpConsumer {
    /// Channel for settling `tag`, if `tag` belongs to the live channel.
    fn settle_channel(&mut self, tag: u64) -> Result<Channel, BrokerError> {
        let subscription = self
            .subscription
            .as_mut()
            .ok_or_else(|| BrokerError::Connection("channel closed".to_string()))?;
        if !subscription.outstanding.remove(&tag) {
            return Err(BrokerError::UnknownDelivery(tag));
        }
        Ok(subscription.channel.clone())
    }

    fn settled(&mut self, result: Result<(), lapin::Error>) -> Result<(), BrokerError> {
        result.map_err(|e| {
            self.subscription = None;
            BrokerError::from(e)
        })
    }
}

impl QueueConsumer for AmqpConsumer {
    async fn next_delivery(&mut self) -> Option<Result<Delivery, BrokerError>> {
        if self.subscription.is_none() {
            match self.shared.subscribe(&self.queue, self.mode).await {
                Ok(subscription) => {
                    tracing::info!("Resubscribed to '{}'", self.queue);
                    self.subscription = Some(subscription);
                }
                Err(e) => return Some(Err(e)),
            }
        }
        let subscription = self.subscription.as_mut()?;

        match subscription.consumer.next().await {
            Some(Ok(delivery)) => {
                if self.mode == AckMode::AfterAppend {
                    subscription.outstanding.insert(delivery.delivery_tag);
                }
                Some(Ok(Delivery {
                    tag: delivery.delivery_tag,
                    payload: delivery.data,
                    redelivered: delivery.redelivered,
                }))
            }
            Some(Err(e)) => {
                self.subscription = None;
                Some(Err(BrokerError::from(e)))
            }
            None => {
                tracing::warn!("Subscription to '{}' closed by the broker", self.queue);
                self.subscription = None;
                Some(Err(BrokerError::Connection(format!(
                    "subscription to '{}' closed",
                    self.queue
                ))))
            }
        }
    }

    async fn ack(&mut self, tag: u64) -> Result<(), BrokerError> {
        if self.mode == AckMode::Auto {
            return Ok(());
        }
        let channel = self.settle_channel(tag)?;
        let result = channel.basic_ack(tag, BasicAckOptions::default()).await;
        self.settled(result)
    }

    async fn reject(&mut self, tag: u64, requeue: bool) -> Result<(), BrokerError> {
        if self.mode == AckMode::Auto {
            return Ok(());
        }
        let channel = self.settle_channel(tag)?;
        let result = channel
            .basic_nack(
                tag,
                BasicNackOptions {
                    requeue,
                    ..BasicNackOptions::default()
                },
            )
            .await;
        self.settled(result)
    }
}
