// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! SQLite log backend
//!
//! Appends never rewrite history: the column set lives in a small registry
//! table and each logical column maps to a positional physical column of
//! the data table. A new field costs one `ALTER TABLE ADD COLUMN`, and old
//! rows read back as null for it.
//!
//! # Schema
//!
//! ```sql
//! CREATE TABLE log_columns (
//!     position INTEGER PRIMARY KEY,
//!     name TEXT NOT NULL UNIQUE
//! );
//! CREATE TABLE log_rows (
//!     seq INTEGER PRIMARY KEY AUTOINCREMENT
//!     -- c0, c1, ... added as columns appear
//! );
//! ```

use crate::record::{json_from_sql, sql_from_json, Record};
use crate::table::{new_columns, LogError, LogStore, LogTable};
use rusqlite::{params, params_from_iter, Connection, TransactionBehavior};
use std::path::Path;
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

fn physical(position: usize) -> String {
    format!("c{}", position)
}

/// Schema-union log stored in a SQLite database.
///
/// Appends run in an immediate transaction, so several consumers may share
/// one database file.
pub struct SqliteLog {
    conn: Connection,
    location: String,
}

impl SqliteLog {
    /// Open (or create) the log database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LogError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| LogError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let log = Self {
            conn,
            location: path.display().to_string(),
        };
        log.init_schema()?;
        Ok(log)
    }

    /// In-memory log (for testing)
    pub fn open_in_memory() -> Result<Self, LogError> {
        let log = Self {
            conn: Connection::open_in_memory()?,
            location: ":memory:".to_string(),
        };
        log.init_schema()?;
        Ok(log)
    }

    fn init_schema(&self) -> Result<(), LogError> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS log_columns (
                position INTEGER PRIMARY KEY,
                name TEXT NOT NULL UNIQUE
            );
            CREATE TABLE IF NOT EXISTS log_rows (
                seq INTEGER PRIMARY KEY AUTOINCREMENT
            );",
        )?;
        Ok(())
    }

    fn load_columns(conn: &Connection) -> Result<Vec<String>, LogError> {
        let mut stmt = conn.prepare_cached("SELECT position, name FROM log_columns ORDER BY position")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut columns = Vec::with_capacity(rows.len());
        for (expected, (position, name)) in rows.into_iter().enumerate() {
            if position != expected as i64 {
                return Err(LogError::Corrupt(format!(
                    "column registry has a gap at position {}",
                    expected
                )));
            }
            columns.push(name);
        }
        Ok(columns)
    }
}

impl LogStore for SqliteLog {
    fn append(&mut self, record: &Record) -> Result<Vec<String>, LogError> {
        if record.is_empty() {
            return Err(LogError::EmptyRow);
        }

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut columns = Self::load_columns(&tx)?;
        let added = new_columns(&columns, record);
        for name in &added {
            let position = columns.len();
            tx.execute(
                "INSERT INTO log_columns (position, name) VALUES (?1, ?2)",
                params![position as i64, name],
            )?;
            tx.execute(
                &format!("ALTER TABLE log_rows ADD COLUMN {}", physical(position)),
                [],
            )?;
            columns.push(name.clone());
        }

        let mut targets = Vec::with_capacity(record.len());
        let mut values = Vec::with_capacity(record.len());
        for (name, value) in record.fields() {
            if let Some(position) = columns.iter().position(|c| c == name) {
                targets.push(physical(position));
                values.push(sql_from_json(value));
            }
        }
        let placeholders = (1..=values.len())
            .map(|i| format!("?{}", i))
            .collect::<Vec<_>>()
            .join(", ");
        tx.execute(
            &format!(
                "INSERT INTO log_rows ({}) VALUES ({})",
                targets.join(", "),
                placeholders
            ),
            params_from_iter(values.iter()),
        )?;

        tx.commit()?;
        Ok(added)
    }

    fn columns(&self) -> Result<Vec<String>, LogError> {
        Self::load_columns(&self.conn)
    }

    fn read_table(&self) -> Result<LogTable, LogError> {
        let columns = Self::load_columns(&self.conn)?;
        if columns.is_empty() {
            return Ok(LogTable::new());
        }

        let select = (0..columns.len())
            .map(physical)
            .collect::<Vec<_>>()
            .join(", ");
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {} FROM log_rows ORDER BY seq", select))?;
        let width = columns.len();
        let rows = stmt
            .query_map([], |row| {
                (0..width)
                    .map(|i| row.get_ref(i).map(json_from_sql))
                    .collect::<Result<Vec<_>, _>>()
            })?
            .collect::<Result<Vec<_>, _>>()?;

        LogTable::from_parts(columns, rows)
    }

    fn row_count(&self) -> Result<usize, LogError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM log_rows", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn location(&self) -> String {
        self.location.clone()
    }
}
