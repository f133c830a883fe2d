// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! CSV log backend
//!
//! The header row is the column set. An append that brings no new columns
//! is a single line appended to the file; an append that widens the column
//! set rewrites the file through a temporary sibling so a crash leaves
//! either the old or the new table, never a mix.
//!
//! Reading types whole columns: a column whose non-empty cells are all
//! numbers reads back as numbers, any other column keeps its cells as text.
//! Empty cells read back as null, so an empty string and null cannot be
//! told apart once written.

use crate::record::Record;
use crate::table::{new_columns, LogError, LogStore, LogTable};
use csv::{ReaderBuilder, StringRecord, WriterBuilder};
use serde_json::{Number, Value};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Schema-union log stored as a CSV file.
#[derive(Debug, Clone)]
pub struct CsvLog {
    path: PathBuf,
}

impl CsvLog {
    /// Log at `path`. The file is created on first append.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: std::io::Error) -> LogError {
        LogError::Io {
            path: self.path.clone(),
            source,
        }
    }

    fn open_existing(&self) -> Result<Option<File>, LogError> {
        match File::open(&self.path) {
            Ok(file) => Ok(Some(file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(self.io_err(e)),
        }
    }

    fn reader(file: File) -> csv::Reader<File> {
        ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(file)
    }

    /// Header and raw rows, or `None` if the log has not been written yet.
    fn load_raw(&self) -> Result<Option<(Vec<String>, Vec<StringRecord>)>, LogError> {
        let Some(file) = self.open_existing()? else {
            return Ok(None);
        };
        let mut reader = Self::reader(file);
        let header: Vec<String> = reader.headers()?.iter().map(String::from).collect();
        if header.is_empty() {
            return Ok(None);
        }
        let rows = reader.records().collect::<Result<Vec<_>, _>>()?;
        Ok(Some((header, rows)))
    }

    fn read_header(&self) -> Result<Vec<String>, LogError> {
        let Some(file) = self.open_existing()? else {
            return Ok(Vec::new());
        };
        let mut reader = Self::reader(file);
        Ok(reader.headers()?.iter().map(String::from).collect())
    }

    fn row_cells(columns: &[String], record: &Record) -> Vec<String> {
        columns
            .iter()
            .map(|c| record.get(c).map(format_cell).unwrap_or_default())
            .collect()
    }

    fn ensure_parent(&self) -> Result<(), LogError> {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => {
                fs::create_dir_all(parent).map_err(|e| self.io_err(e))
            }
            _ => Ok(()),
        }
    }

    /// Plain line append under an unchanged header.
    fn append_line(&self, cells: &[String]) -> Result<(), LogError> {
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| self.io_err(e))?;

        // A torn final line from an earlier crash must not swallow this row
        let len = file.metadata().map_err(|e| self.io_err(e))?.len();
        if len > 0 {
            let mut last = [0u8; 1];
            file.seek(SeekFrom::End(-1)).map_err(|e| self.io_err(e))?;
            file.read_exact(&mut last).map_err(|e| self.io_err(e))?;
            if last[0] != b'\n' {
                file.write_all(b"\n").map_err(|e| self.io_err(e))?;
            }
        }

        let mut writer = WriterBuilder::new().has_headers(false).from_writer(&mut file);
        writer.write_record(cells)?;
        writer.flush().map_err(|e| self.io_err(e))?;
        Ok(())
    }

    /// Write the whole table under a new header through a temp file.
    fn rewrite(
        &self,
        columns: &[String],
        old_rows: &[StringRecord],
        cells: &[String],
    ) -> Result<(), LogError> {
        self.ensure_parent()?;

        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp = PathBuf::from(tmp_name);

        let mut file = File::create(&tmp).map_err(|e| self.io_err(e))?;
        {
            let mut writer = WriterBuilder::new().has_headers(false).from_writer(&mut file);
            writer.write_record(columns)?;
            for row in old_rows {
                let padding = columns.len().saturating_sub(row.len());
                writer.write_record(row.iter().chain(std::iter::repeat("").take(padding)))?;
            }
            writer.write_record(cells)?;
            writer.flush().map_err(|e| self.io_err(e))?;
        }
        file.sync_all().map_err(|e| self.io_err(e))?;
        drop(file);

        fs::rename(&tmp, &self.path).map_err(|e| self.io_err(e))
    }
}

impl LogStore for CsvLog {
    fn append(&mut self, record: &Record) -> Result<Vec<String>, LogError> {
        if record.is_empty() {
            return Err(LogError::EmptyRow);
        }

        let existing = self.load_raw()?;
        let current = existing
            .as_ref()
            .map(|(header, _)| header.as_slice())
            .unwrap_or_default();
        let added = new_columns(current, record);

        if existing.is_some() && added.is_empty() {
            self.append_line(&Self::row_cells(current, record))?;
            return Ok(added);
        }

        let mut columns = current.to_vec();
        columns.extend(added.iter().cloned());
        let cells = Self::row_cells(&columns, record);
        let old_rows = existing.as_ref().map(|(_, rows)| rows.as_slice()).unwrap_or_default();
        self.rewrite(&columns, old_rows, &cells)?;

        tracing::debug!(
            "Log {} widened to {} columns (+{})",
            self.path.display(),
            columns.len(),
            added.join(", ")
        );
        Ok(added)
    }

    fn columns(&self) -> Result<Vec<String>, LogError> {
        self.read_header()
    }

    fn read_table(&self) -> Result<LogTable, LogError> {
        let Some((columns, raw)) = self.load_raw()? else {
            return Ok(LogTable::new());
        };
        let width = raw.iter().map(StringRecord::len).max().unwrap_or(0);
        let numeric: Vec<bool> = (0..width)
            .map(|idx| {
                raw.iter()
                    .filter_map(|r| r.get(idx))
                    .all(|cell| cell.is_empty() || parse_number(cell).is_some())
            })
            .collect();

        let rows = raw
            .iter()
            .map(|r| {
                r.iter()
                    .zip(&numeric)
                    .map(|(cell, &numeric)| parse_cell(cell, numeric))
                    .collect()
            })
            .collect();
        LogTable::from_parts(columns, rows)
    }

    fn row_count(&self) -> Result<usize, LogError> {
        let Some(file) = self.open_existing()? else {
            return Ok(0);
        };
        let mut reader = Self::reader(file);
        let mut count = 0;
        let mut record = StringRecord::new();
        while reader.read_record(&mut record)? {
            count += 1;
        }
        Ok(count)
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

/// Render a record scalar as a CSV cell.
pub fn format_cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Type a CSV cell of a column already known to be numeric or not.
/// Empty is null; a text column keeps the cell as written.
pub fn parse_cell(cell: &str, numeric: bool) -> Value {
    if cell.is_empty() {
        return Value::Null;
    }
    if numeric {
        if let Some(number) = parse_number(cell) {
            return number;
        }
    }
    Value::String(cell.to_string())
}

/// Integer first, then finite float.
pub fn parse_number(cell: &str) -> Option<Value> {
    if let Ok(i) = cell.parse::<i64>() {
        return Some(Value::from(i));
    }
    cell.parse::<f64>()
        .ok()
        .filter(|f| f.is_finite())
        .and_then(Number::from_f64)
        .map(Value::Number)
}
