//! JSON row protocol
//!
//! Rows arrive as flat JSON objects. Numbers, booleans, strings and nulls map
//! onto core values; strings in the time column are parsed as RFC 3339
//! timestamps.

use chrono::{DateTime, Utc};
use hyperchunk_core::{Row, Value};
use serde_json::Value as Json;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    #[error("row must be a JSON object")]
    NotAnObject,

    #[error("unsupported value for column \"{0}\"")]
    UnsupportedValue(String),

    #[error("invalid timestamp \"{value}\" for column \"{column}\"")]
    InvalidTimestamp { column: String, value: String },
}

/// Convert one JSON object into a row
pub fn row_from_json(json: &Json, time_column: &str) -> Result<Row, ProtocolError> {
    let object = json.as_object().ok_or(ProtocolError::NotAnObject)?;
    let mut row = Row::new();
    for (column, value) in object {
        let value = if column == time_column {
            time_from_json(column, value)?
        } else {
            value_from_json(column, value)?
        };
        row.insert(column.clone(), value);
    }
    Ok(row)
}

/// Accept a single row object or an array of them
pub fn rows_from_json(json: &Json, time_column: &str) -> Result<Vec<Row>, ProtocolError> {
    match json {
        Json::Array(items) => items.iter().map(|item| row_from_json(item, time_column)).collect(),
        other => Ok(vec![row_from_json(other, time_column)?]),
    }
}

/// Time value: integer microseconds or an RFC 3339 string
pub fn time_from_json(column: &str, json: &Json) -> Result<Value, ProtocolError> {
    match json {
        Json::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|t| Value::from(t.with_timezone(&Utc)))
            .map_err(|_| ProtocolError::InvalidTimestamp {
                column: column.to_string(),
                value: s.clone(),
            }),
        Json::Number(n) => n
            .as_i64()
            .map(Value::Timestamp)
            .ok_or_else(|| ProtocolError::UnsupportedValue(column.to_string())),
        other => value_from_json(column, other),
    }
}

fn value_from_json(column: &str, json: &Json) -> Result<Value, ProtocolError> {
    Ok(match json {
        Json::Null => Value::Null,
        Json::Bool(b) => Value::Boolean(*b),
        Json::Number(n) => match n.as_i64() {
            Some(i) => Value::Integer(i),
            None => n
                .as_f64()
                .map(Value::Float)
                .ok_or_else(|| ProtocolError::UnsupportedValue(column.to_string()))?,
        },
        Json::String(s) => Value::Text(s.clone()),
        Json::Array(_) | Json::Object(_) => {
            return Err(ProtocolError::UnsupportedValue(column.to_string()))
        }
    })
}
