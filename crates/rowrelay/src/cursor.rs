// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Watermark cursor
//!
//! The watermark is the position of the last record the broker confirmed.
//! Positions order by ordering key first and source row id second, so rows
//! sharing a key are still visited exactly once.

use crate::error::RelayError;
use crate::record::OrderingKey;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Position of a row in the ordered source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Position {
    pub key: OrderingKey,
    pub row_id: i64,
}

impl Position {
    pub fn new(key: impl Into<OrderingKey>, row_id: i64) -> Self {
        Self {
            key: key.into(),
            row_id,
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (row {})", self.key, self.row_id)
    }
}

/// Strictly increasing high-water mark.
#[derive(Debug, Clone, Default)]
pub struct WatermarkCursor {
    current: Option<Position>,
}

impl WatermarkCursor {
    /// Cursor with no watermark; the next poll starts from the first row.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cursor resuming from a persisted watermark.
    pub fn starting_at(position: Position) -> Self {
        Self {
            current: Some(position),
        }
    }

    pub fn current(&self) -> Option<Position> {
        self.current
    }

    /// Verify that `next` may follow the current watermark.
    pub fn check(&self, next: Position) -> Result<(), RelayError> {
        match self.current {
            Some(current) if next <= current => Err(RelayError::Regression {
                current,
                attempted: next,
            }),
            _ => Ok(()),
        }
    }

    /// Move the watermark to `next`. The cursor is left unchanged on error.
    pub fn advance(&mut self, next: Position) -> Result<(), RelayError> {
        self.check(next)?;
        self.current = Some(next);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_advance_accepts_any_position() {
        let mut cursor = WatermarkCursor::new();
        assert!(cursor.current().is_none());

        cursor.advance(Position::new(-10, 4)).unwrap();
        assert_eq!(cursor.current(), Some(Position::new(-10, 4)));
    }

    #[test]
    fn test_equal_keys_advance_by_row_id() {
        let mut cursor = WatermarkCursor::new();
        cursor.advance(Position::new(3, 2)).unwrap();
        cursor.advance(Position::new(3, 3)).unwrap();
        assert_eq!(cursor.current(), Some(Position::new(3, 3)));
    }

    #[test]
    fn test_regression_is_rejected_and_cursor_unchanged() {
        let mut cursor = WatermarkCursor::starting_at(Position::new(5, 1));

        let err = cursor.advance(Position::new(3, 9)).unwrap_err();
        assert!(matches!(err, RelayError::Regression { .. }));
        assert_eq!(cursor.current(), Some(Position::new(5, 1)));

        // Re-sending the same position is a regression too
        assert!(cursor.advance(Position::new(5, 1)).is_err());
    }

    #[test]
    fn test_position_serde() {
        let pos = Position::new(1_700_000_000_i64, 12);
        let json = serde_json::to_string(&pos).unwrap();
        assert_eq!(json, r#"{"key":1700000000,"row_id":12}"#);

        let real: Position = serde_json::from_str(r#"{"key":2.5,"row_id":1}"#).unwrap();
        assert_eq!(real.key, OrderingKey::Real(2.5));
    }
}
