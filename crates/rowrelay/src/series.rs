// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Time-series views over the log
//!
//! Downstream charts read the log as `(timestamp, value)` points. Row order
//! is log order, so redelivered duplicates show up as repeated points.

use crate::table::LogTable;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;

/// One point of a series.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesPoint {
    pub timestamp: Value,
    pub value: Value,
}

fn cell_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn cell_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
        _ => None,
    }
}

/// Points for every row where `field` is set.
pub fn series(table: &LogTable, timestamp_column: &str, field: &str) -> Vec<SeriesPoint> {
    let Some(field_idx) = table.column_index(field) else {
        return Vec::new();
    };
    let ts_idx = table.column_index(timestamp_column);

    table
        .rows()
        .iter()
        .filter(|row| !row[field_idx].is_null())
        .map(|row| SeriesPoint {
            timestamp: ts_idx.map_or(Value::Null, |i| row[i].clone()),
            value: row[field_idx].clone(),
        })
        .collect()
}

/// Distinct values of `key_column`, sorted, without blanks and `nan`.
pub fn key_options(table: &LogTable, key_column: &str) -> Vec<String> {
    let Some(idx) = table.column_index(key_column) else {
        return Vec::new();
    };

    table
        .rows()
        .iter()
        .filter_map(|row| cell_text(&row[idx]))
        .filter(|k| !k.trim().is_empty() && !k.eq_ignore_ascii_case("nan"))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Points for the rows whose `key_column` equals `key`. Values that are not
/// numeric come back as `None`.
pub fn keyed_series(
    table: &LogTable,
    timestamp_column: &str,
    key_column: &str,
    value_column: &str,
    key: &str,
) -> Vec<(Value, Option<f64>)> {
    let Some(key_idx) = table.column_index(key_column) else {
        return Vec::new();
    };
    let ts_idx = table.column_index(timestamp_column);
    let value_idx = table.column_index(value_column);

    table
        .rows()
        .iter()
        .filter(|row| cell_text(&row[key_idx]).as_deref() == Some(key))
        .map(|row| {
            let ts = ts_idx.map_or(Value::Null, |i| row[i].clone());
            let value = value_idx.and_then(|i| cell_number(&row[i]));
            (ts, value)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Record;
    use serde_json::json;

    fn sample_table() -> LogTable {
        let mut table = LogTable::new();
        for (ts, key, value) in [
            (100, "temp", json!(21.5)),
            (110, "hum", json!(40)),
            (120, "temp", json!("n/a")),
            (130, "nan", json!(1)),
            (140, "", json!(2)),
        ] {
            table.push(
                &Record::new()
                    .with_field("timestamp", ts)
                    .with_field("key", key)
                    .with_field("value", value),
            );
        }
        table.push(&Record::new().with_field("timestamp", 150).with_field("x", 1));
        table
    }

    #[test]
    fn test_series_skips_rows_without_field() {
        let table = sample_table();
        let points = series(&table, "timestamp", "x");
        assert_eq!(
            points,
            vec![SeriesPoint {
                timestamp: json!(150),
                value: json!(1)
            }]
        );
        assert!(series(&table, "timestamp", "missing").is_empty());
    }

    #[test]
    fn test_key_options_sorted_and_filtered() {
        let table = sample_table();
        assert_eq!(key_options(&table, "key"), vec!["hum", "temp"]);
    }

    #[test]
    fn test_keyed_series_coerces_values() {
        let table = sample_table();
        let points = keyed_series(&table, "timestamp", "key", "value", "temp");
        assert_eq!(points, vec![(json!(100), Some(21.5)), (json!(120), None)]);
    }
}
