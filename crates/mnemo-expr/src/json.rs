//! JSON interchange for values and rows.
//!
//! Values map to their natural JSON form: calendar types render as ISO-8601
//! strings, decimals and oversized integers as strings (JSON numbers cannot
//! hold them), bytes and opaque payloads as integer arrays. The reverse
//! mapping is best-effort and intended for diagnostics and fixtures, not as
//! a storage format; the tag codec is the canonical encoding.

use serde_json::{json, Map as JsonMap, Number, Value as Json};

use crate::codec::Row;
use crate::error::Error;
use crate::value::Value;

/// Render a value as JSON.
pub fn to_json(value: &Value) -> Json {
    match value {
        Value::Null => Json::Null,
        Value::Bool(b) => json!(b),
        Value::Int(i) => json!(i),
        Value::BigInt(b) => match b.to_i128() {
            Some(i) => json!(i.to_string()),
            None => json!(format!(
                "{}0x{}",
                if b.is_negative() { "-" } else { "" },
                b.magnitude()
                    .iter()
                    .map(|byte| format!("{byte:02x}"))
                    .collect::<String>()
            )),
        },
        Value::Float(f) => Number::from_f64(*f).map(Json::Number).unwrap_or(Json::Null),
        Value::Decimal(d) => json!(d.to_string()),
        Value::Str(s) => json!(s),
        Value::Bytes(b) | Value::Opaque(b) => json!(b),
        Value::Date(_) => match value.as_date() {
            Some(d) => json!(d.to_string()),
            None => Json::Null,
        },
        Value::Time(_) => match value.as_time() {
            Some(t) => json!(t.to_string()),
            None => Json::Null,
        },
        Value::DateTime(_) => match value.as_datetime() {
            Some(dt) => json!(dt.and_utc().to_rfc3339()),
            None => Json::Null,
        },
        Value::Duration(micros) => json!(micros),
        Value::List(items) | Value::Set(items) => {
            Json::Array(items.iter().map(to_json).collect())
        }
        Value::Map(entries) => {
            let mut map = JsonMap::new();
            for (key, value) in entries {
                map.insert(key.clone(), to_json(value));
            }
            Json::Object(map)
        }
    }
}

/// Render a row as a JSON object.
pub fn row_to_json(row: &Row) -> Json {
    let mut map = JsonMap::new();
    for (name, value) in row {
        map.insert(name.clone(), to_json(value));
    }
    Json::Object(map)
}

/// Best-effort conversion from JSON.
///
/// Arrays become lists and objects become maps; strings stay strings (no
/// calendar parsing is attempted).
pub fn from_json(json: &Json) -> Result<Value, Error> {
    Ok(match json {
        Json::Null => Value::Null,
        Json::Bool(b) => Value::Bool(*b),
        Json::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else if let Some(f) = n.as_f64() {
                Value::Float(f)
            } else {
                return Err(Error::Json(format!("unrepresentable number: {n}")));
            }
        }
        Json::String(s) => Value::Str(s.clone()),
        Json::Array(items) => Value::List(
            items
                .iter()
                .map(from_json)
                .collect::<Result<Vec<_>, Error>>()?,
        ),
        Json::Object(map) => Value::Map(
            map.iter()
                .map(|(k, v)| Ok((k.clone(), from_json(v)?)))
                .collect::<Result<Vec<_>, Error>>()?,
        ),
    })
}
