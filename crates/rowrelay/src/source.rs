// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Ordered record sources
//!
//! A source answers one question: which row comes right after a given
//! position? The publisher asks it once per tick (or a few times when
//! batching) and never holds rows of its own.

use crate::cursor::Position;
use crate::record::{json_from_sql, OrderingKey, Record};
use rusqlite::types::{ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OpenFlags};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;

const BUSY_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("row {row_id} has no numeric value in ordering column '{column}'")]
    InvalidKey { column: String, row_id: i64 },

    #[error("{0}")]
    Unavailable(String),
}

/// A row read from the source along with its position.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRow {
    pub position: Position,
    pub record: Record,
}

/// Ordered, append-mostly table of records.
pub trait RecordSource: Send {
    /// Return the row with the smallest position strictly greater than
    /// `after` (or the very first row when `after` is `None`).
    fn next_record(&mut self, after: Option<Position>) -> Result<Option<SourceRow>, SourceError>;

    /// Table name, for logs and errors.
    fn name(&self) -> &str;
}

impl ToSql for OrderingKey {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match *self {
            OrderingKey::Int(i) => ToSqlOutput::from(i),
            OrderingKey::Real(f) => ToSqlOutput::from(f),
        })
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// SQLite table polled by rowid and ordering column.
///
/// The database is opened read-only on first use. Any SQLite error closes
/// the connection so the next poll reopens it, which lets the publisher
/// ride out a missing or locked file.
pub struct SqliteSource {
    path: Option<PathBuf>,
    table: String,
    key_column: String,
    conn: Option<Connection>,
}

impl SqliteSource {
    pub fn new(
        path: impl Into<PathBuf>,
        table: impl Into<String>,
        key_column: impl Into<String>,
    ) -> Self {
        Self {
            path: Some(path.into()),
            table: table.into(),
            key_column: key_column.into(),
            conn: None,
        }
    }

    /// Poll an already open connection. It is never reopened.
    pub fn from_connection(
        conn: Connection,
        table: impl Into<String>,
        key_column: impl Into<String>,
    ) -> Self {
        Self {
            path: None,
            table: table.into(),
            key_column: key_column.into(),
            conn: Some(conn),
        }
    }

    pub fn key_column(&self) -> &str {
        &self.key_column
    }

    fn ensure_open(&mut self) -> Result<(), SourceError> {
        if self.conn.is_some() {
            return Ok(());
        }
        let Some(path) = &self.path else {
            return Err(SourceError::Unavailable(
                "source connection was closed".to_string(),
            ));
        };

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        tracing::debug!("Opened source database {}", path.display());
        self.conn = Some(conn);
        Ok(())
    }

    fn query(
        conn: &Connection,
        table: &str,
        key_column: &str,
        after: Option<Position>,
    ) -> Result<Option<SourceRow>, SourceError> {
        let table_q = quote_ident(table);
        let key_q = quote_ident(key_column);

        // Two synthetic leading columns, then the table's own columns
        let sql = match after {
            None => format!(
                "SELECT rowid, {key_q}, * FROM {table_q}
                 WHERE {key_q} IS NOT NULL
                 ORDER BY {key_q}, rowid LIMIT 1"
            ),
            Some(_) => format!(
                "SELECT rowid, {key_q}, * FROM {table_q}
                 WHERE {key_q} > ?1 OR ({key_q} = ?1 AND rowid > ?2)
                 ORDER BY {key_q}, rowid LIMIT 1"
            ),
        };

        let mut stmt = conn.prepare_cached(&sql)?;
        let names: Vec<String> = stmt
            .column_names()
            .into_iter()
            .skip(2)
            .map(String::from)
            .collect();

        let mut rows = match after {
            None => stmt.query([])?,
            Some(pos) => stmt.query(params![pos.key, pos.row_id])?,
        };
        let Some(row) = rows.next()? else {
            return Ok(None);
        };

        let row_id: i64 = row.get(0)?;
        let key = match row.get_ref(1)? {
            ValueRef::Integer(i) => OrderingKey::Int(i),
            ValueRef::Real(f) if f.is_finite() => OrderingKey::Real(f),
            _ => {
                return Err(SourceError::InvalidKey {
                    column: key_column.to_string(),
                    row_id,
                })
            }
        };

        let mut record = Record::new();
        for (idx, name) in names.into_iter().enumerate() {
            record.insert(name, json_from_sql(row.get_ref(idx + 2)?));
        }

        Ok(Some(SourceRow {
            position: Position { key, row_id },
            record,
        }))
    }
}

impl RecordSource for SqliteSource {
    fn next_record(&mut self, after: Option<Position>) -> Result<Option<SourceRow>, SourceError> {
        self.ensure_open()?;

        let result = match &self.conn {
            Some(conn) => Self::query(conn, &self.table, &self.key_column, after),
            None => Err(SourceError::Unavailable(
                "source connection was closed".to_string(),
            )),
        };

        if matches!(result, Err(SourceError::Sqlite(_))) && self.path.is_some() {
            self.conn = None;
        }
        result
    }

    fn name(&self) -> &str {
        &self.table
    }
}

#[derive(Default)]
struct MemoryState {
    rows: Vec<(OrderingKey, Record)>,
    fail_next: usize,
}

/// In-process source for tests and demos.
///
/// Row ids are assigned in push order starting at 1. Clones share rows.
#[derive(Clone)]
pub struct MemorySource {
    name: String,
    key_column: String,
    state: Arc<Mutex<MemoryState>>,
}

impl MemorySource {
    pub fn new(name: impl Into<String>, key_column: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key_column: key_column.into(),
            state: Arc::new(Mutex::new(MemoryState::default())),
        }
    }

    /// Append a row. The key is written as the first field unless the
    /// record already carries the key column. Returns the new row id.
    pub fn push(&self, key: impl Into<OrderingKey>, record: Record) -> i64 {
        let key = key.into();
        let record = if record.contains(&self.key_column) {
            record
        } else {
            let mut keyed = Record::new().with_field(self.key_column.clone(), key.to_json());
            for (name, value) in record.fields() {
                keyed.insert(name.clone(), value.clone());
            }
            keyed
        };

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.rows.push((key, record));
        state.rows.len() as i64
    }

    /// Make the next `n` polls fail as if the source were unreachable.
    pub fn fail_next(&self, n: usize) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .fail_next = n;
    }

    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .rows
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RecordSource for MemorySource {
    fn next_record(&mut self, after: Option<Position>) -> Result<Option<SourceRow>, SourceError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(SourceError::Unavailable(format!(
                "source '{}' is unavailable",
                self.name
            )));
        }

        let next = state
            .rows
            .iter()
            .enumerate()
            .map(|(idx, (key, record))| (Position::new(*key, idx as i64 + 1), record))
            .filter(|(pos, _)| after.map_or(true, |a| *pos > a))
            .min_by_key(|(pos, _)| *pos);

        Ok(next.map(|(position, record)| SourceRow {
            position,
            record: record.clone(),
        }))
    }

    fn name(&self) -> &str {
        &self.name
    }
}
