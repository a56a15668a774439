//! The binary msgpack encoding.
//!
//! Extension types are carried as msgpack ext values with fixed codes and
//! big-endian packed payloads:
//!
//! | Code | Type | Payload |
//! |---|---|---|
//! | 1 | naive datetime | `i64` microseconds since the Unix epoch |
//! | 10 | UTC datetime | `i64` microseconds since the Unix epoch |
//! | 3 | date | `u16` year, `u8` month, `u8` day |
//! | 4 | time | `u8` hour, `u8` minute, `u8` second, `u32` microseconds |
//! | 5 | decimal | `u16` length, then that many ASCII digits/sign/point |
//! | 2 | currency amount | 3 ASCII currency-code bytes, `i64` minor units |
//!
//! Codes 1 and 10 both decode to a UTC datetime; naive datetimes on the
//! wire are treated as UTC.

use super::Serializer;
use crate::errors::SerializationError;
use crate::types::{CurrencyAmount, Value};
use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, Timelike};

const EXT_DATETIME: i8 = 1;
const EXT_CURRENCY: i8 = 2;
const EXT_DATE: i8 = 3;
const EXT_TIME: i8 = 4;
const EXT_DECIMAL: i8 = 5;
const EXT_DATETIME_UTC: i8 = 10;

/// Maximum encodable decimal string length (the length prefix is a `u16`).
const MAX_DECIMAL_BYTES: usize = u16::MAX as usize;

pub struct MsgpackSerializer;

impl Serializer for MsgpackSerializer {
    fn mime_type(&self) -> &'static str {
        super::MSGPACK_MIME_TYPE
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>, SerializationError> {
        if !matches!(value, Value::Map(_)) {
            return Err(SerializationError::Serialize("input must be a map".to_owned()));
        }
        let packed = to_packed(value)?;
        let mut buffer = Vec::new();
        rmpv::encode::write_value(&mut buffer, &packed)
            .map_err(|e| SerializationError::Serialize(e.to_string()))?;
        Ok(buffer)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, SerializationError> {
        let mut reader = bytes;
        let packed = rmpv::decode::read_value(&mut reader)
            .map_err(|e| SerializationError::Deserialize(e.to_string()))?;
        if !reader.is_empty() {
            return Err(SerializationError::Deserialize(format!(
                "{} trailing bytes after message",
                reader.len()
            )));
        }
        let value = from_packed(&packed)?;
        if !matches!(value, Value::Map(_)) {
            return Err(SerializationError::Deserialize("message is not a map".to_owned()));
        }
        Ok(value)
    }
}

fn to_packed(value: &Value) -> Result<rmpv::Value, SerializationError> {
    Ok(match value {
        Value::Null => rmpv::Value::Nil,
        Value::Bool(b) => rmpv::Value::Boolean(*b),
        Value::Int(i) => rmpv::Value::from(*i),
        Value::Float(f) => rmpv::Value::F64(*f),
        Value::Str(s) => rmpv::Value::from(s.as_str()),
        Value::Bytes(b) => rmpv::Value::Binary(b.clone()),
        Value::List(list) => rmpv::Value::Array(
            list.iter().map(to_packed).collect::<Result<Vec<_>, _>>()?,
        ),
        Value::Map(map) => rmpv::Value::Map(
            map.iter()
                .map(|(key, entry)| Ok((rmpv::Value::from(key.as_str()), to_packed(entry)?)))
                .collect::<Result<Vec<_>, SerializationError>>()?,
        ),
        Value::DateTime(dt) => {
            rmpv::Value::Ext(EXT_DATETIME_UTC, dt.timestamp_micros().to_be_bytes().to_vec())
        }
        Value::Date(date) => {
            let year = u16::try_from(date.year()).map_err(|_| {
                SerializationError::Serialize(format!("date year {} out of range", date.year()))
            })?;
            let mut payload = Vec::with_capacity(4);
            payload.extend_from_slice(&year.to_be_bytes());
            payload.push(date.month() as u8);
            payload.push(date.day() as u8);
            rmpv::Value::Ext(EXT_DATE, payload)
        }
        Value::Time(time) => {
            let mut payload = Vec::with_capacity(7);
            payload.push(time.hour() as u8);
            payload.push(time.minute() as u8);
            payload.push(time.second() as u8);
            payload.extend_from_slice(&((time.nanosecond() / 1000) as u32).to_be_bytes());
            rmpv::Value::Ext(EXT_TIME, payload)
        }
        Value::Decimal(decimal) => {
            if decimal.len() > MAX_DECIMAL_BYTES {
                return Err(SerializationError::Serialize(
                    "decimal string exceeds 65535 bytes".to_owned(),
                ));
            }
            let mut payload = Vec::with_capacity(2 + decimal.len());
            payload.extend_from_slice(&(decimal.len() as u16).to_be_bytes());
            payload.extend_from_slice(decimal.as_bytes());
            rmpv::Value::Ext(EXT_DECIMAL, payload)
        }
        Value::Currency(amount) => {
            if amount.code.len() != 3 || !amount.code.is_ascii() {
                return Err(SerializationError::Serialize(format!(
                    "currency code {:?} is not three ASCII characters",
                    amount.code
                )));
            }
            let mut payload = Vec::with_capacity(11);
            payload.extend_from_slice(amount.code.as_bytes());
            payload.extend_from_slice(&amount.minor.to_be_bytes());
            rmpv::Value::Ext(EXT_CURRENCY, payload)
        }
    })
}

fn from_packed(value: &rmpv::Value) -> Result<Value, SerializationError> {
    Ok(match value {
        rmpv::Value::Nil => Value::Null,
        rmpv::Value::Boolean(b) => Value::Bool(*b),
        rmpv::Value::Integer(i) => Value::Int(i.as_i64().ok_or_else(|| {
            SerializationError::Deserialize(format!("integer {} out of signed 64-bit range", i))
        })?),
        rmpv::Value::F32(f) => Value::Float(*f as f64),
        rmpv::Value::F64(f) => Value::Float(*f),
        rmpv::Value::String(s) => Value::Str(
            s.as_str()
                .ok_or_else(|| {
                    SerializationError::Deserialize("string is not valid UTF-8".to_owned())
                })?
                .to_owned(),
        ),
        rmpv::Value::Binary(b) => Value::Bytes(b.clone()),
        rmpv::Value::Array(list) => {
            Value::List(list.iter().map(from_packed).collect::<Result<Vec<_>, _>>()?)
        }
        rmpv::Value::Map(entries) => {
            let mut map = std::collections::BTreeMap::new();
            for (key, entry) in entries {
                let key = key
                    .as_str()
                    .ok_or_else(|| {
                        SerializationError::Deserialize("map key is not a string".to_owned())
                    })?
                    .to_owned();
                map.insert(key, from_packed(entry)?);
            }
            Value::Map(map)
        }
        rmpv::Value::Ext(code, payload) => decode_ext(*code, payload)?,
    })
}

fn decode_ext(code: i8, payload: &[u8]) -> Result<Value, SerializationError> {
    match code {
        EXT_DATETIME | EXT_DATETIME_UTC => {
            let micros = i64::from_be_bytes(fixed(payload)?);
            let dt = DateTime::from_timestamp_micros(micros).ok_or_else(|| {
                SerializationError::Deserialize(format!("datetime {} out of range", micros))
            })?;
            Ok(Value::DateTime(dt))
        }
        EXT_DATE => {
            let bytes: [u8; 4] = fixed(payload)?;
            let year = u16::from_be_bytes([bytes[0], bytes[1]]);
            let date = NaiveDate::from_ymd_opt(year as i32, bytes[2] as u32, bytes[3] as u32)
                .ok_or_else(|| SerializationError::Deserialize("invalid date".to_owned()))?;
            Ok(Value::Date(date))
        }
        EXT_TIME => {
            let bytes: [u8; 7] = fixed(payload)?;
            let micros = u32::from_be_bytes([bytes[3], bytes[4], bytes[5], bytes[6]]);
            let time = NaiveTime::from_hms_micro_opt(
                bytes[0] as u32,
                bytes[1] as u32,
                bytes[2] as u32,
                micros,
            )
            .ok_or_else(|| SerializationError::Deserialize("invalid time".to_owned()))?;
            Ok(Value::Time(time))
        }
        EXT_DECIMAL => {
            if payload.len() < 2 {
                return Err(SerializationError::Deserialize("truncated decimal".to_owned()));
            }
            let length = u16::from_be_bytes([payload[0], payload[1]]) as usize;
            if payload.len() != 2 + length {
                return Err(SerializationError::Deserialize("truncated decimal".to_owned()));
            }
            let digits = std::str::from_utf8(&payload[2..])
                .map_err(|_| SerializationError::Deserialize("non-ASCII decimal".to_owned()))?;
            Ok(Value::Decimal(digits.to_owned()))
        }
        EXT_CURRENCY => {
            let bytes: [u8; 11] = fixed(payload)?;
            let code = std::str::from_utf8(&bytes[..3])
                .map_err(|_| SerializationError::Deserialize("invalid currency code".to_owned()))?;
            let minor = i64::from_be_bytes([
                bytes[3], bytes[4], bytes[5], bytes[6], bytes[7], bytes[8], bytes[9], bytes[10],
            ]);
            Ok(Value::Currency(CurrencyAmount::new(code, minor)))
        }
        other => Err(SerializationError::Deserialize(format!(
            "unknown extension type {}",
            other
        ))),
    }
}

fn fixed<const N: usize>(payload: &[u8]) -> Result<[u8; N], SerializationError> {
    payload.try_into().map_err(|_| {
        SerializationError::Deserialize(format!(
            "extension payload of {} bytes, expected {}",
            payload.len(),
            N
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{vlist, vmap};
    use chrono::TimeZone;

    fn round_trip(value: Value) -> Value {
        let serializer = MsgpackSerializer;
        let encoded = serializer.encode(&value).unwrap();
        serializer.decode(&encoded).unwrap()
    }

    #[test]
    fn test_primitives_round_trip() {
        let value = vmap! {
            "null" => Value::Null,
            "bool" => true,
            "int" => -42i64,
            "big" => i64::MAX,
            "float" => 1.5,
            "string" => "hello  world ",
            "bytes" => Value::Bytes(vec![0, 1, 254, 255]),
            "list" => vlist![1, "two", Value::Null],
            "nested" => vmap! { "inner" => vmap! { "deep" => 3 } },
        };
        assert_eq!(round_trip(value.clone()), value);
    }

    #[test]
    fn test_whitespace_in_strings_is_preserved() {
        let value = vmap! { "s" => "  padded\t\n  " };
        assert_eq!(round_trip(value.clone()), value);
    }

    #[test]
    fn test_datetime_round_trips_at_microsecond_precision() {
        let dt = chrono::Utc.with_ymd_and_hms(2019, 6, 12, 12, 31, 6).unwrap()
            + chrono::Duration::microseconds(472_093);
        let value = vmap! { "when" => Value::DateTime(dt) };
        assert_eq!(round_trip(value.clone()), value);
    }

    #[test]
    fn test_date_time_decimal_currency_round_trip() {
        let value = vmap! {
            "date" => Value::Date(NaiveDate::from_ymd_opt(2017, 4, 29).unwrap()),
            "time" => Value::Time(NaiveTime::from_hms_micro_opt(12, 31, 6, 88_123).unwrap()),
            "decimal" => Value::Decimal("3.14159265358979323846".to_owned()),
            "price" => Value::Currency(CurrencyAmount::new("USD", 1599)),
        };
        assert_eq!(round_trip(value.clone()), value);
    }

    #[test]
    fn test_top_level_must_be_a_map() {
        let serializer = MsgpackSerializer;
        assert!(serializer.encode(&Value::Int(1)).is_err());
    }

    #[test]
    fn test_corrupt_bytes_fail_to_decode() {
        let serializer = MsgpackSerializer;
        assert!(serializer.decode(&[0xc1]).is_err());
    }

    #[test]
    fn test_trailing_garbage_fails_to_decode() {
        let serializer = MsgpackSerializer;
        let mut encoded = serializer.encode(&vmap! { "a" => 1 }).unwrap();
        encoded.push(0x00);
        assert!(serializer.decode(&encoded).is_err());
    }

    #[test]
    fn test_naive_datetime_ext_code_decodes_as_utc() {
        // A foreign producer may encode with ext code 1 (naive); it must
        // decode to the same instant in UTC.
        let micros: i64 = 1_560_342_666_000_001;
        let payload = micros.to_be_bytes().to_vec();
        let packed = rmpv::Value::Map(vec![(
            rmpv::Value::from("when"),
            rmpv::Value::Ext(EXT_DATETIME, payload),
        )]);
        let mut buffer = Vec::new();
        rmpv::encode::write_value(&mut buffer, &packed).unwrap();

        let decoded = MsgpackSerializer.decode(&buffer).unwrap();
        match decoded.get("when") {
            Some(Value::DateTime(dt)) => assert_eq!(dt.timestamp_micros(), micros),
            other => panic!("expected a datetime, got {:?}", other),
        }
    }

    #[test]
    fn test_currency_code_must_be_three_ascii_characters() {
        let serializer = MsgpackSerializer;
        let bad = vmap! { "price" => Value::Currency(CurrencyAmount { code: "EURO".to_owned(), minor: 1 }) };
        assert!(serializer.encode(&bad).is_err());
    }
}
