use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::model::{GeoPoint, Timestamp};
use crate::value::{ArrayValue, BytesValue, MapValue};

/// A single document field value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Value {
    kind: ValueKind,
}

/// Write-time placeholders that are turned into field transforms before a
/// mutation is queued. They never appear in stored documents.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum SentinelValue {
    ServerTimestamp,
    ArrayUnion(Vec<Value>),
    ArrayRemove(Vec<Value>),
    NumericIncrement(Box<Value>),
    Delete,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ValueKind {
    Null,
    Boolean(bool),
    Integer(i64),
    Double(#[serde(with = "crate::util::double_serde")] f64),
    Timestamp(Timestamp),
    String(String),
    Bytes(BytesValue),
    Reference(String),
    GeoPoint(GeoPoint),
    Array(ArrayValue),
    Map(MapValue),
    Sentinel(SentinelValue),
}

impl Value {
    pub fn null() -> Self {
        Self {
            kind: ValueKind::Null,
        }
    }

    pub fn from_bool(value: bool) -> Self {
        Self {
            kind: ValueKind::Boolean(value),
        }
    }

    pub fn from_integer(value: i64) -> Self {
        Self {
            kind: ValueKind::Integer(value),
        }
    }

    pub fn from_double(value: f64) -> Self {
        Self {
            kind: ValueKind::Double(value),
        }
    }

    pub fn from_timestamp(value: Timestamp) -> Self {
        Self {
            kind: ValueKind::Timestamp(value),
        }
    }

    pub fn from_string(value: impl Into<String>) -> Self {
        Self {
            kind: ValueKind::String(value.into()),
        }
    }

    pub fn from_bytes(value: BytesValue) -> Self {
        Self {
            kind: ValueKind::Bytes(value),
        }
    }

    pub fn from_reference(path: impl Into<String>) -> Self {
        Self {
            kind: ValueKind::Reference(path.into()),
        }
    }

    pub fn from_geo_point(value: GeoPoint) -> Self {
        Self {
            kind: ValueKind::GeoPoint(value),
        }
    }

    pub fn from_array(values: Vec<Value>) -> Self {
        Self {
            kind: ValueKind::Array(ArrayValue::new(values)),
        }
    }

    pub fn from_map(map: BTreeMap<String, Value>) -> Self {
        Self {
            kind: ValueKind::Map(MapValue::new(map)),
        }
    }

    pub fn from_map_value(map: MapValue) -> Self {
        Self {
            kind: ValueKind::Map(map),
        }
    }

    /// Replaced with the commit time of the write on the server.
    pub fn server_timestamp() -> Self {
        Self {
            kind: ValueKind::Sentinel(SentinelValue::ServerTimestamp),
        }
    }

    /// Adds each element not already present to the array field.
    pub fn array_union(elements: Vec<Value>) -> Self {
        Self {
            kind: ValueKind::Sentinel(SentinelValue::ArrayUnion(elements)),
        }
    }

    /// Removes every instance of each element from the array field.
    pub fn array_remove(elements: Vec<Value>) -> Self {
        Self {
            kind: ValueKind::Sentinel(SentinelValue::ArrayRemove(elements)),
        }
    }

    /// Adds `operand` to the numeric field, treating a missing or non-numeric field as zero.
    pub fn increment(operand: Value) -> Self {
        Self {
            kind: ValueKind::Sentinel(SentinelValue::NumericIncrement(Box::new(operand))),
        }
    }

    /// Removes the field in an update or merge.
    pub fn delete_field() -> Self {
        Self {
            kind: ValueKind::Sentinel(SentinelValue::Delete),
        }
    }

    pub fn kind(&self) -> &ValueKind {
        &self.kind
    }

    pub fn into_kind(self) -> ValueKind {
        self.kind
    }

    pub fn from_kind(kind: ValueKind) -> Self {
        Self { kind }
    }

    pub fn is_null(&self) -> bool {
        matches!(self.kind, ValueKind::Null)
    }

    pub fn is_number(&self) -> bool {
        matches!(self.kind, ValueKind::Integer(_) | ValueKind::Double(_))
    }

    pub fn is_nan(&self) -> bool {
        matches!(self.kind, ValueKind::Double(value) if value.is_nan())
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self.kind {
            ValueKind::Integer(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self.kind {
            ValueKind::Double(value) => Some(value),
            ValueKind::Integer(value) => Some(value as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match &self.kind {
            ValueKind::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&MapValue> {
        match &self.kind {
            ValueKind::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&ArrayValue> {
        match &self.kind {
            ValueKind::Array(array) => Some(array),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::from_integer(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::from_double(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::from_bool(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::from_string(value)
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::from_string(value)
    }
}
