//! Typed scalar values carried by postings and their conversions.

use std::fmt;

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Date, OffsetDateTime, PrimitiveDateTime};

use super::{Result, Uid, UmbraError};

/// Declared type of a predicate.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    /// Untyped; values are kept as their textual form.
    Default,
    /// Signed 64-bit integer.
    Int,
    /// 64-bit float.
    Float,
    /// Boolean.
    Bool,
    /// UTF-8 string.
    String,
    /// Timestamp with offset.
    DateTime,
    /// Edge to another entity.
    Uid,
}

impl ValueType {
    /// Parses the schema spelling of a type.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "default" => Some(ValueType::Default),
            "int" => Some(ValueType::Int),
            "float" => Some(ValueType::Float),
            "bool" => Some(ValueType::Bool),
            "string" => Some(ValueType::String),
            "dateTime" | "datetime" => Some(ValueType::DateTime),
            "uid" => Some(ValueType::Uid),
            _ => None,
        }
    }

    /// Schema spelling of the type.
    pub fn name(self) -> &'static str {
        match self {
            ValueType::Default => "default",
            ValueType::Int => "int",
            ValueType::Float => "float",
            ValueType::Bool => "bool",
            ValueType::String => "string",
            ValueType::DateTime => "dateTime",
            ValueType::Uid => "uid",
        }
    }

    fn tag(self) -> u8 {
        match self {
            ValueType::Default => 0,
            ValueType::Int => 1,
            ValueType::Float => 2,
            ValueType::Bool => 3,
            ValueType::String => 4,
            ValueType::DateTime => 5,
            ValueType::Uid => 6,
        }
    }

    fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(ValueType::Default),
            1 => Ok(ValueType::Int),
            2 => Ok(ValueType::Float),
            3 => Ok(ValueType::Bool),
            4 => Ok(ValueType::String),
            5 => Ok(ValueType::DateTime),
            6 => Ok(ValueType::Uid),
            _ => Err(UmbraError::Corruption("unknown value type tag")),
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A typed scalar (or uid) value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// Untyped textual value.
    Default(String),
    /// String value.
    String(String),
    /// Integer value.
    Int(i64),
    /// Float value (never NaN).
    Float(f64),
    /// Boolean value.
    Bool(bool),
    /// Date-time value.
    DateTime(OffsetDateTime),
    /// Entity reference.
    Uid(Uid),
}

impl Value {
    /// Type of this value.
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Default(_) => ValueType::Default,
            Value::String(_) => ValueType::String,
            Value::Int(_) => ValueType::Int,
            Value::Float(_) => ValueType::Float,
            Value::Bool(_) => ValueType::Bool,
            Value::DateTime(_) => ValueType::DateTime,
            Value::Uid(_) => ValueType::Uid,
        }
    }

    /// Converts the value to `target`, parsing textual input where needed.
    pub fn convert_to(&self, target: ValueType) -> Result<Value> {
        if self.value_type() == target {
            return Ok(self.clone());
        }
        let fail = || {
            UmbraError::SchemaViolation(format!(
                "cannot convert {} value [{}] to {}",
                self.value_type(),
                self,
                target
            ))
        };
        match (self, target) {
            (Value::Uid(_), _) | (_, ValueType::Uid) => Err(fail()),
            (_, ValueType::Default) => Ok(Value::Default(self.to_string())),
            (Value::Default(s) | Value::String(s), _) => parse_text(s, target).ok_or_else(fail),
            (_, ValueType::String) => Ok(Value::String(self.to_string())),
            (Value::Int(v), ValueType::Float) => Ok(Value::Float(*v as f64)),
            (Value::Float(v), ValueType::Int) => Ok(Value::Int(v.trunc() as i64)),
            (Value::Int(v), ValueType::Bool) => Ok(Value::Bool(*v != 0)),
            (Value::Bool(v), ValueType::Int) => Ok(Value::Int(i64::from(*v))),
            (Value::DateTime(dt), ValueType::Int) => Ok(Value::Int(dt.unix_timestamp())),
            (Value::Int(v), ValueType::DateTime) => OffsetDateTime::from_unix_timestamp(*v)
                .map(Value::DateTime)
                .map_err(|_| fail()),
            _ => Err(fail()),
        }
    }

    /// Appends the tagged binary encoding of the value.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(self.value_type().tag());
        self.encode_payload(out);
    }

    /// Binary payload without the type tag, used for fingerprints and exact tokens.
    pub fn payload_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_payload(&mut out);
        out
    }

    fn encode_payload(&self, out: &mut Vec<u8>) {
        match self {
            Value::Default(s) | Value::String(s) => out.extend_from_slice(s.as_bytes()),
            Value::Int(v) => out.extend_from_slice(&v.to_be_bytes()),
            Value::Float(v) => out.extend_from_slice(&v.to_bits().to_be_bytes()),
            Value::Bool(v) => out.push(u8::from(*v)),
            Value::DateTime(dt) => out.extend_from_slice(&dt.unix_timestamp_nanos().to_be_bytes()),
            Value::Uid(uid) => out.extend_from_slice(&uid.0.to_be_bytes()),
        }
    }

    /// Decodes a value from its type tag and payload.
    pub fn decode(tag: u8, payload: &[u8]) -> Result<Value> {
        let ty = ValueType::from_tag(tag)?;
        let text = || {
            std::str::from_utf8(payload)
                .map(str::to_owned)
                .map_err(|_| UmbraError::Corruption("string value is not valid UTF-8"))
        };
        match ty {
            ValueType::Default => Ok(Value::Default(text()?)),
            ValueType::String => Ok(Value::String(text()?)),
            ValueType::Int => Ok(Value::Int(i64::from_be_bytes(fixed::<8>(payload)?))),
            ValueType::Float => Ok(Value::Float(f64::from_bits(u64::from_be_bytes(
                fixed::<8>(payload)?,
            )))),
            ValueType::Bool => match payload {
                [0] => Ok(Value::Bool(false)),
                [1] => Ok(Value::Bool(true)),
                _ => Err(UmbraError::Corruption("bool value payload malformed")),
            },
            ValueType::DateTime => {
                let nanos = i128::from_be_bytes(fixed::<16>(payload)?);
                OffsetDateTime::from_unix_timestamp_nanos(nanos)
                    .map(Value::DateTime)
                    .map_err(|_| UmbraError::Corruption("datetime value out of range"))
            }
            ValueType::Uid => Ok(Value::Uid(Uid(u64::from_be_bytes(fixed::<8>(payload)?)))),
        }
    }

    /// Returns the textual form when the value is a string-like value.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Default(s) | Value::String(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Default(s) | Value::String(s) => f.write_str(s),
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::DateTime(dt) => write!(f, "{dt}"),
            Value::Uid(uid) => write!(f, "{uid}"),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Default(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Default(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<Uid> for Value {
    fn from(value: Uid) -> Self {
        Value::Uid(value)
    }
}

fn fixed<const N: usize>(payload: &[u8]) -> Result<[u8; N]> {
    payload
        .try_into()
        .map_err(|_| UmbraError::Corruption("fixed-width value payload has wrong length"))
}

fn parse_text(text: &str, target: ValueType) -> Option<Value> {
    let trimmed = text.trim();
    match target {
        ValueType::String => Some(Value::String(text.to_owned())),
        ValueType::Int => trimmed.parse::<i64>().ok().map(Value::Int),
        ValueType::Float => trimmed
            .parse::<f64>()
            .ok()
            .filter(|v| !v.is_nan())
            .map(Value::Float),
        ValueType::Bool => parse_bool(trimmed).map(Value::Bool),
        ValueType::DateTime => parse_datetime(trimmed).map(Value::DateTime),
        ValueType::Default => Some(Value::Default(text.to_owned())),
        ValueType::Uid => None,
    }
}

fn parse_bool(text: &str) -> Option<bool> {
    match text {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

/// Parses RFC 3339, naive `YYYY-MM-DDTHH:MM:SS[.f]` (UTC) or `YYYY-MM-DD` input.
pub fn parse_datetime(text: &str) -> Option<OffsetDateTime> {
    if let Ok(dt) = OffsetDateTime::parse(text, &Rfc3339) {
        return Some(dt);
    }
    let naive =
        format_description!("[year]-[month]-[day]T[hour]:[minute]:[second][optional [.[subsecond]]]");
    if let Ok(dt) = PrimitiveDateTime::parse(text, naive) {
        return Some(dt.assume_utc());
    }
    let date_only = format_description!("[year]-[month]-[day]");
    Date::parse(text, date_only)
        .ok()
        .map(|date| date.midnight().assume_utc())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_input_converts_to_declared_type() {
        assert_eq!(
            Value::from("10").convert_to(ValueType::Int).unwrap(),
            Value::Int(10)
        );
        assert_eq!(
            Value::from("-10").convert_to(ValueType::Int).unwrap(),
            Value::Int(-10)
        );
        assert_eq!(
            Value::from("10.43").convert_to(ValueType::Float).unwrap(),
            Value::Float(10.43)
        );
        assert_eq!(
            Value::from("true").convert_to(ValueType::Bool).unwrap(),
            Value::Bool(true)
        );
        assert!(Value::from("ten").convert_to(ValueType::Int).is_err());
        assert!(Value::from("NaN").convert_to(ValueType::Float).is_err());
    }

    #[test]
    fn datetime_accepts_naive_and_offset_forms() {
        let naive = Value::from("0010-01-01T01:01:01.000000001")
            .convert_to(ValueType::DateTime)
            .unwrap();
        match naive {
            Value::DateTime(dt) => {
                assert_eq!(dt.year(), 10);
                assert_eq!(dt.hour(), 1);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(parse_datetime("2006-01-02T15:04:05Z").is_some());
        assert!(parse_datetime("2006-01-02").is_some());
        assert!(parse_datetime("yesterday").is_none());
    }

    #[test]
    fn uid_never_converts_to_scalar() {
        assert!(Value::Uid(Uid(1)).convert_to(ValueType::Int).is_err());
        assert!(Value::from("1").convert_to(ValueType::Uid).is_err());
    }

    #[test]
    fn encode_decode_preserves_values() {
        let values = [
            Value::Int(-42),
            Value::Float(2.5),
            Value::Bool(true),
            Value::String("héllo".into()),
            Value::Uid(Uid(9)),
        ];
        for value in values {
            let mut buf = Vec::new();
            value.encode_into(&mut buf);
            let decoded = Value::decode(buf[0], &buf[1..]).unwrap();
            assert_eq!(decoded, value);
        }
    }
}
