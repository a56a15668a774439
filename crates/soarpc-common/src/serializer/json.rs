//! The textual JSON encoding.
//!
//! JSON has no extension mechanism, so extension types are carried as
//! single-key tagged objects: `{"$datetime$": "..."}`, `{"$date$": "..."}`,
//! `{"$time$": "..."}`, `{"$decimal$": "..."}`,
//! `{"$currency$": {"code": ..., "minor": ...}}`, and
//! `{"$bytes$": "<base64>"}`. A genuine map whose single key matches the
//! `$...$` shape is escaped by doubling the leading dollar sign on encode
//! and stripping it on decode.

use super::Serializer;
use crate::errors::SerializationError;
use crate::types::{CurrencyAmount, Value};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, NaiveDate, NaiveTime, SecondsFormat, Utc};
use std::collections::BTreeMap;

const TAG_DATETIME: &str = "$datetime$";
const TAG_DATE: &str = "$date$";
const TAG_TIME: &str = "$time$";
const TAG_DECIMAL: &str = "$decimal$";
const TAG_CURRENCY: &str = "$currency$";
const TAG_BYTES: &str = "$bytes$";

pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn mime_type(&self) -> &'static str {
        super::JSON_MIME_TYPE
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>, SerializationError> {
        if !matches!(value, Value::Map(_)) {
            return Err(SerializationError::Serialize("input must be a map".to_owned()));
        }
        let json = to_json(value)?;
        serde_json::to_vec(&json).map_err(|e| SerializationError::Serialize(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, SerializationError> {
        let json: serde_json::Value = serde_json::from_slice(bytes)
            .map_err(|e| SerializationError::Deserialize(e.to_string()))?;
        let value = from_json(&json)?;
        if !matches!(value, Value::Map(_)) {
            return Err(SerializationError::Deserialize("message is not a map".to_owned()));
        }
        Ok(value)
    }
}

fn tagged(tag: &str, inner: serde_json::Value) -> serde_json::Value {
    let mut map = serde_json::Map::with_capacity(1);
    map.insert(tag.to_owned(), inner);
    serde_json::Value::Object(map)
}

/// Whether a key could be mistaken for a tag (or an escaped tag).
fn looks_reserved(key: &str) -> bool {
    key.len() >= 2 && key.starts_with('$') && key.ends_with('$')
}

fn to_json(value: &Value) -> Result<serde_json::Value, SerializationError> {
    Ok(match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Int(i) => serde_json::Value::Number((*i).into()),
        Value::Float(f) => serde_json::Number::from_f64(*f)
            .map(serde_json::Value::Number)
            .ok_or_else(|| {
                SerializationError::Serialize(format!("{} is not representable in JSON", f))
            })?,
        Value::Str(s) => serde_json::Value::String(s.clone()),
        Value::Bytes(b) => tagged(TAG_BYTES, serde_json::Value::String(BASE64.encode(b))),
        Value::List(list) => serde_json::Value::Array(
            list.iter().map(to_json).collect::<Result<Vec<_>, _>>()?,
        ),
        Value::Map(map) => {
            let mut object = serde_json::Map::with_capacity(map.len());
            let escape = map.len() == 1
                && map.keys().next().map(|k| looks_reserved(k)).unwrap_or(false);
            for (key, entry) in map {
                let key = if escape { format!("${}", key) } else { key.clone() };
                object.insert(key, to_json(entry)?);
            }
            serde_json::Value::Object(object)
        }
        Value::DateTime(dt) => tagged(
            TAG_DATETIME,
            serde_json::Value::String(dt.to_rfc3339_opts(SecondsFormat::Micros, true)),
        ),
        Value::Date(date) => tagged(
            TAG_DATE,
            serde_json::Value::String(date.format("%Y-%m-%d").to_string()),
        ),
        Value::Time(time) => tagged(
            TAG_TIME,
            serde_json::Value::String(time.format("%H:%M:%S%.6f").to_string()),
        ),
        Value::Decimal(decimal) => {
            tagged(TAG_DECIMAL, serde_json::Value::String(decimal.clone()))
        }
        Value::Currency(amount) => {
            let mut inner = serde_json::Map::with_capacity(2);
            inner.insert("code".to_owned(), serde_json::Value::String(amount.code.clone()));
            inner.insert("minor".to_owned(), serde_json::Value::Number(amount.minor.into()));
            tagged(TAG_CURRENCY, serde_json::Value::Object(inner))
        }
    })
}

fn from_json(json: &serde_json::Value) -> Result<Value, SerializationError> {
    Ok(match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else if let Some(f) = n.as_f64() {
                Value::Float(f)
            } else {
                return Err(SerializationError::Deserialize(format!(
                    "number {} out of range",
                    n
                )));
            }
        }
        serde_json::Value::String(s) => Value::Str(s.clone()),
        serde_json::Value::Array(list) => {
            Value::List(list.iter().map(from_json).collect::<Result<Vec<_>, _>>()?)
        }
        serde_json::Value::Object(object) => {
            if object.len() == 1 {
                let (key, inner) = object.iter().next().expect("len checked");
                if let Some(value) = decode_tag(key, inner)? {
                    return Ok(value);
                }
                if let Some(stripped) = key.strip_prefix('$') {
                    if looks_reserved(stripped) {
                        // An escaped literal key; un-escape and keep as a map.
                        let mut map = BTreeMap::new();
                        map.insert(stripped.to_owned(), from_json(inner)?);
                        return Ok(Value::Map(map));
                    }
                }
            }
            let mut map = BTreeMap::new();
            for (key, entry) in object {
                map.insert(key.clone(), from_json(entry)?);
            }
            Value::Map(map)
        }
    })
}

fn decode_tag(
    key: &str,
    inner: &serde_json::Value,
) -> Result<Option<Value>, SerializationError> {
    let text = || {
        inner.as_str().ok_or_else(|| {
            SerializationError::Deserialize(format!("{} payload is not a string", key))
        })
    };
    match key {
        TAG_DATETIME => {
            let dt = DateTime::parse_from_rfc3339(text()?)
                .map_err(|e| SerializationError::Deserialize(format!("bad datetime: {}", e)))?
                .with_timezone(&Utc);
            Ok(Some(Value::DateTime(dt)))
        }
        TAG_DATE => {
            let date = NaiveDate::parse_from_str(text()?, "%Y-%m-%d")
                .map_err(|e| SerializationError::Deserialize(format!("bad date: {}", e)))?;
            Ok(Some(Value::Date(date)))
        }
        TAG_TIME => {
            let time = NaiveTime::parse_from_str(text()?, "%H:%M:%S%.f")
                .map_err(|e| SerializationError::Deserialize(format!("bad time: {}", e)))?;
            Ok(Some(Value::Time(time)))
        }
        TAG_DECIMAL => Ok(Some(Value::Decimal(text()?.to_owned()))),
        TAG_BYTES => {
            let bytes = BASE64
                .decode(text()?)
                .map_err(|e| SerializationError::Deserialize(format!("bad base64: {}", e)))?;
            Ok(Some(Value::Bytes(bytes)))
        }
        TAG_CURRENCY => {
            let object = inner.as_object().ok_or_else(|| {
                SerializationError::Deserialize("currency payload is not an object".to_owned())
            })?;
            let code = object.get("code").and_then(|c| c.as_str()).ok_or_else(|| {
                SerializationError::Deserialize("currency payload has no code".to_owned())
            })?;
            let minor = object.get("minor").and_then(|m| m.as_i64()).ok_or_else(|| {
                SerializationError::Deserialize("currency payload has no minor units".to_owned())
            })?;
            Ok(Some(Value::Currency(CurrencyAmount::new(code, minor))))
        }
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{vlist, vmap};
    use chrono::TimeZone;

    fn round_trip(value: Value) -> Value {
        let serializer = JsonSerializer;
        let encoded = serializer.encode(&value).unwrap();
        serializer.decode(&encoded).unwrap()
    }

    #[test]
    fn test_primitives_round_trip() {
        let value = vmap! {
            "null" => Value::Null,
            "bool" => false,
            "int" => 123i64,
            "float" => -2.25,
            "string" => " spaced  out ",
            "list" => vlist![1, 2, "three"],
            "nested" => vmap! { "deep" => vlist![Value::Null] },
        };
        assert_eq!(round_trip(value.clone()), value);
    }

    #[test]
    fn test_extension_types_round_trip() {
        let dt = chrono::Utc.with_ymd_and_hms(2024, 2, 29, 23, 59, 59).unwrap()
            + chrono::Duration::microseconds(999_999);
        let value = vmap! {
            "when" => Value::DateTime(dt),
            "date" => Value::Date(NaiveDate::from_ymd_opt(1999, 12, 31).unwrap()),
            "time" => Value::Time(NaiveTime::from_hms_micro_opt(0, 0, 1, 5).unwrap()),
            "decimal" => Value::Decimal("-0.000000000001".to_owned()),
            "price" => Value::Currency(CurrencyAmount::new("GBP", -250)),
            "blob" => Value::Bytes(vec![0xde, 0xad, 0xbe, 0xef]),
        };
        assert_eq!(round_trip(value.clone()), value);
    }

    #[test]
    fn test_literal_reserved_key_is_escaped() {
        let value = vmap! { "outer" => vmap! { "$datetime$" => "not a datetime" } };
        assert_eq!(round_trip(value.clone()), value);
    }

    #[test]
    fn test_nan_is_rejected() {
        let serializer = JsonSerializer;
        assert!(serializer.encode(&vmap! { "bad" => f64::NAN }).is_err());
    }

    #[test]
    fn test_corrupt_input_fails() {
        let serializer = JsonSerializer;
        assert!(serializer.decode(b"{not json").is_err());
        assert!(serializer.decode(b"[1, 2]").is_err());
    }
}
