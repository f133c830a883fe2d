// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Relay error taxonomy
//!
//! Every failure the two control loops can observe maps onto one variant of
//! [`RelayError`]. Only [`RelayError::Regression`] stops a loop; everything
//! else is logged and retried (or dropped) by the loop that saw it.

use crate::broker::BrokerError;
use crate::checkpoint::CheckpointError;
use crate::cursor::Position;
use crate::record::OrderingKey;
use crate::source::SourceError;
use crate::table::LogError;
use thiserror::Error;

/// Errors raised by the relay publisher and the durable consumer.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The ordered source could not be queried. Retried on the next tick.
    #[error("source unavailable (table {table}): {source}")]
    SourceUnavailable {
        table: String,
        #[source]
        source: SourceError,
    },

    /// The watermark was asked to move backwards (or stand still).
    #[error("watermark regression: attempted {attempted} after {current}")]
    Regression {
        current: Position,
        attempted: Position,
    },

    /// The broker rejected or never confirmed a publish.
    #[error("publish to queue '{queue}' failed at key {key}: {source}")]
    PublishFailure {
        queue: String,
        key: OrderingKey,
        #[source]
        source: BrokerError,
    },

    /// A delivered message is not a valid record payload.
    #[error("malformed message: {0}")]
    Decode(String),

    /// A record could not be encoded for the wire.
    #[error("encode record at key {key}: {source}")]
    Encode {
        key: OrderingKey,
        #[source]
        source: serde_json::Error,
    },

    /// The log rejected an append.
    #[error("append to log {location} failed: {source}")]
    AppendFailure {
        location: String,
        #[source]
        source: LogError,
    },

    /// The persisted watermark could not be read or written.
    #[error("checkpoint: {0}")]
    Checkpoint(#[from] CheckpointError),
}

impl RelayError {
    /// Returns true for errors that must stop the publisher.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Regression { .. })
    }
}
