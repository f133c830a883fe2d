// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Message broker abstraction
//!
//! The relay needs three things from a broker: a named durable queue,
//! confirmed publishes, and deliveries that can be acknowledged or handed
//! back. [`MemoryBroker`] implements this in-process; [`AmqpBroker`] talks
//! to a RabbitMQ-compatible server.

#[cfg(feature = "amqp")]
mod amqp;
mod memory;

#[cfg(feature = "amqp")]
pub use amqp::{AmqpBroker, AmqpConsumer};
pub use memory::{MemoryBroker, MemoryConsumer};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("queue '{0}' is not declared")]
    UnknownQueue(String),

    #[error("delivery {0} is not outstanding")]
    UnknownDelivery(u64),

    #[error("broker refused the message: {0}")]
    Nack(String),

    #[error("connection: {0}")]
    Connection(String),

    #[error("broker is closed")]
    Closed,

    #[cfg(feature = "amqp")]
    #[error("amqp: {0}")]
    Amqp(#[from] lapin::Error),
}

/// One message handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub tag: u64,
    pub payload: Vec<u8>,
    /// The broker has handed this message out before.
    pub redelivered: bool,
}

/// When a delivery is acknowledged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckMode {
    /// The broker forgets the message as soon as it is delivered.
    Auto,
    /// The consumer acknowledges only after the log append succeeded.
    #[default]
    AfterAppend,
}

impl fmt::Display for AckMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::AfterAppend => write!(f, "after_append"),
        }
    }
}

impl FromStr for AckMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "auto" => Ok(Self::Auto),
            "after_append" | "manual" => Ok(Self::AfterAppend),
            other => Err(format!(
                "unknown ack mode '{}' (expected auto or after_append)",
                other
            )),
        }
    }
}

/// Publishing side of a broker, plus the factory for consumers.
pub trait Broker: Send + Sync {
    type Consumer: QueueConsumer;

    /// Declare `queue` if it does not exist yet.
    fn declare_queue(&self, queue: &str) -> impl Future<Output = Result<(), BrokerError>> + Send;

    /// Publish one message. Resolves once the broker has confirmed it.
    fn publish(
        &self,
        queue: &str,
        payload: Vec<u8>,
    ) -> impl Future<Output = Result<(), BrokerError>> + Send;

    /// Start consuming `queue`.
    fn consume(
        &self,
        queue: &str,
        mode: AckMode,
    ) -> impl Future<Output = Result<Self::Consumer, BrokerError>> + Send;
}

/// Receiving side of a queue subscription.
pub trait QueueConsumer: Send {
    /// Wait for the next delivery.
    ///
    /// An error is transient: the caller backs off and polls again, and the
    /// consumer re-establishes its subscription if the connection was lost.
    /// `None` means the subscription is over for good.
    fn next_delivery(
        &mut self,
    ) -> impl Future<Output = Option<Result<Delivery, BrokerError>>> + Send;

    /// Acknowledge a delivery. A no-op in [`AckMode::Auto`].
    fn ack(&mut self, tag: u64) -> impl Future<Output = Result<(), BrokerError>> + Send;

    /// Hand a delivery back, optionally for redelivery.
    fn reject(
        &mut self,
        tag: u64,
        requeue: bool,
    ) -> impl Future<Output = Result<(), BrokerError>> + Send;
}
