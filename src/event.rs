//! The event model shared by the decoders and sinks.
//!
//! A [`LogEvent`] is a flat map of named [`Value`]s. Decoded flow fields are
//! nested under the configured container key as a `Value::Object`.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};

pub type ObjectMap = BTreeMap<String, Value>;

/// A dynamically typed event value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Bytes(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Timestamp(DateTime<Utc>),
    Object(ObjectMap),
    Array(Vec<Value>),
    Null,
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Bytes(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Timestamp(ts) => Some(*ts),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ObjectMap> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Bytes(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Bytes(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Integer(n)
    }
}

impl From<u8> for Value {
    fn from(n: u8) -> Self {
        Value::Integer(n.into())
    }
}

impl From<u16> for Value {
    fn from(n: u16) -> Self {
        Value::Integer(n.into())
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Integer(n.into())
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Value::Integer(n as i64)
    }
}

impl From<usize> for Value {
    fn from(n: usize) -> Self {
        Value::Integer(n as i64)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(ts: DateTime<Utc>) -> Self {
        Value::Timestamp(ts)
    }
}

impl From<ObjectMap> for Value {
    fn from(map: ObjectMap) -> Self {
        Value::Object(map)
    }
}

impl From<Vec<Value>> for Value {
    fn from(values: Vec<Value>) -> Self {
        Value::Array(values)
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Bytes(s) => serializer.serialize_str(s),
            Value::Integer(n) => serializer.serialize_i64(*n),
            Value::Float(f) => serializer.serialize_f64(*f),
            Value::Boolean(b) => serializer.serialize_bool(*b),
            Value::Timestamp(ts) => {
                serializer.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Micros, true))
            }
            Value::Object(map) => {
                let mut ser = serializer.serialize_map(Some(map.len()))?;
                for (key, value) in map {
                    ser.serialize_entry(key, value)?;
                }
                ser.end()
            }
            Value::Array(values) => {
                let mut ser = serializer.serialize_seq(Some(values.len()))?;
                for value in values {
                    ser.serialize_element(value)?;
                }
                ser.end()
            }
            Value::Null => serializer.serialize_unit(),
        }
    }
}

/// A structured log event.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LogEvent {
    fields: ObjectMap,
}

impl LogEvent {
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn as_map(&self) -> &ObjectMap {
        &self.fields
    }
}

impl Serialize for LogEvent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut ser = serializer.serialize_map(Some(self.fields.len()))?;
        for (key, value) in &self.fields {
            ser.serialize_entry(key, value)?;
        }
        ser.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn typed_accessors() {
        let mut event = LogEvent::default();
        event.insert("proto", 6u8);
        event.insert("src", "192.168.1.1");

        assert_eq!(event.get("proto").unwrap().as_integer(), Some(6));
        assert_eq!(event.get("src").unwrap().as_str(), Some("192.168.1.1"));
        assert!(event.get("missing").is_none());
    }

    #[test]
    fn timestamps_render_with_microseconds() {
        let ts = Utc.with_ymd_and_hms(2020, 9, 13, 12, 26, 40).unwrap();
        let mut event = LogEvent::default();
        event.insert("timestamp", ts);

        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(json, r#"{"timestamp":"2020-09-13T12:26:40.000000Z"}"#);
    }

    #[test]
    fn nested_objects_serialize() {
        let mut inner = ObjectMap::new();
        inner.insert("in_bytes".into(), Value::Integer(100));
        let mut event = LogEvent::default();
        event.insert("netflow", inner);

        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(json, r#"{"netflow":{"in_bytes":100}}"#);
    }
}
