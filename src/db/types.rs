//! SQL Server value and row mappings.
//!
//! Rows leave the driver as JSON objects keyed by column name. Shaping
//! follows the pool's protocol options:
//!
//! - `camelCaseColumns` lowercases the first letter of every column name
//! - `parseJSON` turns `FOR JSON` output back into JSON values
//! - `useUTC` decides how timestamps without an offset are read
//!
//! Columns sharing a name are collected into an array under that name.

use crate::config::PoolConfig;
use crate::error::{DriverError, codes};
use crate::models::{Recordset, Row};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{
    DateTime, Local, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat, TimeZone, Utc,
};
use serde_json::Value as JsonValue;
use std::collections::HashSet;
use tiberius::{ColumnData, FromSql};

/// Column name SQL Server gives `FOR JSON` output.
pub const JSON_COLUMN_NAME: &str = "JSON_F52E2B61-18A1-11d1-B105-00805F49916B";

/// Row shaping options taken from the pool configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowShaping {
    pub use_utc: bool,
    pub parse_json: bool,
    pub camel_case_columns: bool,
}

impl Default for RowShaping {
    fn default() -> Self {
        Self {
            use_utc: true,
            parse_json: false,
            camel_case_columns: false,
        }
    }
}

impl From<&PoolConfig> for RowShaping {
    fn from(config: &PoolConfig) -> Self {
        Self {
            use_utc: config.use_utc,
            parse_json: config.parse_json,
            camel_case_columns: config.camel_case_columns,
        }
    }
}

// =============================================================================
// Rows and Recordsets
// =============================================================================

impl RowShaping {
    /// Column name as it appears in the output row.
    pub fn column_name(&self, name: &str) -> String {
        if !self.camel_case_columns {
            return name.to_string();
        }
        let mut chars = name.chars();
        match chars.next() {
            Some(first) => first.to_lowercase().chain(chars).collect(),
            None => String::new(),
        }
    }

    /// Build one output row from `(column, value)` pairs in column order.
    pub fn build_row<I>(&self, columns: I) -> Row
    where
        I: IntoIterator<Item = (String, JsonValue)>,
    {
        let mut row = Row::new();
        let mut grouped: HashSet<String> = HashSet::new();
        for (name, value) in columns {
            let name = self.column_name(&name);
            match row.get_mut(&name) {
                Some(JsonValue::Array(values)) if grouped.contains(&name) => values.push(value),
                Some(existing) => {
                    let first = existing.take();
                    *existing = JsonValue::Array(vec![first, value]);
                    grouped.insert(name);
                }
                None => {
                    row.insert(name, value);
                }
            }
        }
        row
    }

    /// Finish a recordset once all of its rows are in.
    ///
    /// `FOR JSON` output arrives split over many single-column rows; those are
    /// joined back into one document here.
    pub fn finish_recordset(
        &self,
        columns: &[String],
        rows: Recordset,
    ) -> Result<Recordset, DriverError> {
        if columns.len() != 1 || columns[0] != JSON_COLUMN_NAME {
            return Ok(rows);
        }

        let key = self.column_name(JSON_COLUMN_NAME);
        let document: String = rows
            .iter()
            .filter_map(|row| row.get(&key).and_then(JsonValue::as_str))
            .collect();

        if !self.parse_json {
            if document.is_empty() {
                return Ok(Vec::new());
            }
            let mut row = Row::new();
            row.insert(key, JsonValue::String(document));
            return Ok(vec![row]);
        }

        if document.is_empty() {
            return Ok(Vec::new());
        }

        match serde_json::from_str::<JsonValue>(&document) {
            Ok(JsonValue::Array(items)) => Ok(items
                .into_iter()
                .map(|item| match item {
                    JsonValue::Object(map) => map,
                    other => {
                        let mut row = Row::new();
                        row.insert(key.clone(), other);
                        row
                    }
                })
                .collect()),
            Ok(JsonValue::Object(map)) => Ok(vec![map]),
            Ok(other) => {
                let mut row = Row::new();
                row.insert(key, other);
                Ok(vec![row])
            }
            Err(e) => Err(DriverError::request(
                codes::EJSON,
                format!("Failed to parse incoming JSON. {}", e),
            )),
        }
    }
}

// =============================================================================
// Values
// =============================================================================

impl RowShaping {
    /// Convert one driver value to JSON.
    pub fn column_value(&self, data: ColumnData<'static>) -> JsonValue {
        match data {
            ColumnData::U8(v) => v.map(JsonValue::from).unwrap_or(JsonValue::Null),
            ColumnData::I16(v) => v.map(JsonValue::from).unwrap_or(JsonValue::Null),
            ColumnData::I32(v) => v.map(JsonValue::from).unwrap_or(JsonValue::Null),
            ColumnData::I64(v) => v.map(JsonValue::from).unwrap_or(JsonValue::Null),
            ColumnData::F32(v) => v.map(|f| float_value(f as f64)).unwrap_or(JsonValue::Null),
            ColumnData::F64(v) => v.map(float_value).unwrap_or(JsonValue::Null),
            ColumnData::Bit(v) => v.map(JsonValue::Bool).unwrap_or(JsonValue::Null),
            ColumnData::String(v) => v
                .map(|s| JsonValue::String(s.into_owned()))
                .unwrap_or(JsonValue::Null),
            ColumnData::Guid(v) => v
                .map(|g| JsonValue::String(g.to_string().to_uppercase()))
                .unwrap_or(JsonValue::Null),
            ColumnData::Binary(v) => v
                .map(|b| JsonValue::String(STANDARD.encode(b.as_ref())))
                .unwrap_or(JsonValue::Null),
            ColumnData::Numeric(v) => v
                .map(|n| float_value(n.value() as f64 / 10f64.powi(n.scale() as i32)))
                .unwrap_or(JsonValue::Null),
            ColumnData::Xml(v) => v
                .map(|x| JsonValue::String(x.into_owned().into_string()))
                .unwrap_or(JsonValue::Null),
            ColumnData::DateTime(_) | ColumnData::SmallDateTime(_) | ColumnData::DateTime2(_) => {
                match NaiveDateTime::from_sql(&data) {
                    Ok(Some(naive)) => JsonValue::String(self.format_naive(naive)),
                    _ => JsonValue::Null,
                }
            }
            ColumnData::Date(_) => match NaiveDate::from_sql(&data) {
                Ok(Some(date)) => JsonValue::String(self.format_naive(date.and_time(NaiveTime::MIN))),
                _ => JsonValue::Null,
            },
            ColumnData::Time(_) => match NaiveTime::from_sql(&data) {
                Ok(Some(time)) => {
                    let epoch = DateTime::<Utc>::UNIX_EPOCH.date_naive();
                    JsonValue::String(format_utc(epoch.and_time(time).and_utc()))
                }
                _ => JsonValue::Null,
            },
            ColumnData::DateTimeOffset(_) => match DateTime::<Utc>::from_sql(&data) {
                Ok(Some(dt)) => JsonValue::String(format_utc(dt)),
                _ => JsonValue::Null,
            },
        }
    }

    /// Render a timestamp that carries no offset.
    ///
    /// With `useUTC` it is read as UTC, otherwise as local time.
    pub fn format_naive(&self, naive: NaiveDateTime) -> String {
        if self.use_utc {
            return format_utc(naive.and_utc());
        }
        match Local.from_local_datetime(&naive).earliest() {
            Some(local) => format_utc(local.with_timezone(&Utc)),
            None => format_utc(naive.and_utc()),
        }
    }
}

fn format_utc(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn float_value(f: f64) -> JsonValue {
    serde_json::Number::from_f64(f)
        .map(JsonValue::Number)
        .unwrap_or(JsonValue::Null)
}
