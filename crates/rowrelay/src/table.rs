// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Schema-union log
//!
//! The log is an append-only table whose column set only ever grows. Each
//! appended record becomes one row; columns it does not set are null, and
//! columns it introduces are added after every existing column, in the
//! record's own field order.

use crate::record::Record;
use serde_json::Value;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LogError {
    #[error("I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("csv: {0}")]
    Csv(#[from] csv::Error),

    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("log is corrupt: {0}")]
    Corrupt(String),

    #[error("record has no fields")]
    EmptyRow,
}

impl LogError {
    /// False for failures that will recur on every attempt with the same
    /// record and log contents.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Corrupt(_) | Self::EmptyRow)
    }
}

/// Persisted schema-union log.
pub trait LogStore: Send {
    /// Append one record as a new row. Returns the columns this append
    /// introduced, in the order they were added.
    fn append(&mut self, record: &Record) -> Result<Vec<String>, LogError>;

    /// Current column set in first-appearance order.
    fn columns(&self) -> Result<Vec<String>, LogError>;

    /// Materialize the whole log.
    fn read_table(&self) -> Result<LogTable, LogError>;

    fn row_count(&self) -> Result<usize, LogError>;

    /// Human readable location, for logs and errors.
    fn location(&self) -> String;
}

impl<L: LogStore + ?Sized> LogStore for Box<L> {
    fn append(&mut self, record: &Record) -> Result<Vec<String>, LogError> {
        (**self).append(record)
    }

    fn columns(&self) -> Result<Vec<String>, LogError> {
        (**self).columns()
    }

    fn read_table(&self) -> Result<LogTable, LogError> {
        (**self).read_table()
    }

    fn row_count(&self) -> Result<usize, LogError> {
        (**self).row_count()
    }

    fn location(&self) -> String {
        (**self).location()
    }
}

/// Fields of `record` that are not yet columns, in record order.
pub fn new_columns(existing: &[String], record: &Record) -> Vec<String> {
    record
        .field_names()
        .filter(|name| !existing.iter().any(|c| c == *name))
        .cloned()
        .collect()
}

/// In-memory log table. Every row has exactly one cell per column.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogTable {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl LogTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table from stored parts. Short rows are padded with nulls.
    pub fn from_parts(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Result<Self, LogError> {
        let width = columns.len();
        let mut padded = Vec::with_capacity(rows.len());
        for (idx, mut row) in rows.into_iter().enumerate() {
            if row.len() > width {
                return Err(LogError::Corrupt(format!(
                    "row {} has {} cells but the log has {} columns",
                    idx + 1,
                    row.len(),
                    width
                )));
            }
            row.resize(width, Value::Null);
            padded.push(row);
        }
        Ok(Self {
            columns,
            rows: padded,
        })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn cell(&self, row: usize, column: &str) -> Option<&Value> {
        let idx = self.column_index(column)?;
        self.rows.get(row).and_then(|r| r.get(idx))
    }

    /// Append `record`, widening every existing row with nulls first.
    pub fn push(&mut self, record: &Record) -> Vec<String> {
        let added = new_columns(&self.columns, record);
        if !added.is_empty() {
            self.columns.extend(added.iter().cloned());
            let width = self.columns.len();
            for row in &mut self.rows {
                row.resize(width, Value::Null);
            }
        }

        let row = self
            .columns
            .iter()
            .map(|c| record.get(c).cloned().unwrap_or(Value::Null))
            .collect();
        self.rows.push(row);
        added
    }
}

impl LogStore for LogTable {
    fn append(&mut self, record: &Record) -> Result<Vec<String>, LogError> {
        if record.is_empty() {
            return Err(LogError::EmptyRow);
        }
        Ok(self.push(record))
    }

    fn columns(&self) -> Result<Vec<String>, LogError> {
        Ok(self.columns.clone())
    }

    fn read_table(&self) -> Result<LogTable, LogError> {
        Ok(self.clone())
    }

    fn row_count(&self) -> Result<usize, LogError> {
        Ok(self.rows.len())
    }

    fn location(&self) -> String {
        "memory".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_schema_union_pads_old_and_new_rows() {
        let mut table = LogTable::new();
        assert_eq!(table.push(&Record::new().with_field("a", 1)), vec!["a"]);
        assert_eq!(table.push(&Record::new().with_field("b", 2)), vec!["b"]);

        assert_eq!(table.columns(), ["a", "b"]);
        assert_eq!(table.rows()[0], vec![json!(1), Value::Null]);
        assert_eq!(table.rows()[1], vec![Value::Null, json!(2)]);
    }

    #[test]
    fn test_column_order_is_first_appearance() {
        let mut table = LogTable::new();
        table.push(&Record::new().with_field("ts", 1).with_field("x", 1));
        let added = table.push(
            &Record::new()
                .with_field("z", 0)
                .with_field("ts", 2)
                .with_field("y", 5),
        );

        assert_eq!(added, vec!["z", "y"]);
        assert_eq!(table.columns(), ["ts", "x", "z", "y"]);
        assert_eq!(table.cell(1, "x"), Some(&Value::Null));
        assert_eq!(table.cell(1, "y"), Some(&json!(5)));
        assert_eq!(table.cell(0, "ts"), Some(&json!(1)));
    }

    #[test]
    fn test_duplicate_records_are_kept() {
        let mut table = LogTable::new();
        let record = Record::new().with_field("t", 100).with_field("v", 1);
        table.append(&record).unwrap();
        table.append(&record).unwrap();
        assert_eq!(table.row_count().unwrap(), 2);
    }

    #[test]
    fn test_empty_record_is_rejected() {
        let mut table = LogTable::new();
        let err = table.append(&Record::new()).unwrap_err();
        assert!(matches!(err, LogError::EmptyRow));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_from_parts_pads_and_validates() {
        let table = LogTable::from_parts(
            vec!["a".into(), "b".into()],
            vec![vec![json!(1)], vec![json!(2), json!(3)]],
        )
        .unwrap();
        assert_eq!(table.rows()[0], vec![json!(1), Value::Null]);

        let err = LogTable::from_parts(vec!["a".into()], vec![vec![json!(1), json!(2)]]);
        assert!(matches!(err, Err(LogError::Corrupt(_))));
    }
}
