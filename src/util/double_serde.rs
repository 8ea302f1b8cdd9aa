//! Serde adapter for doubles. JSON has no literal for NaN or the infinities,
//! so those are written as the strings `"NaN"`, `"Infinity"` and
//! `"-Infinity"`; finite values stay plain numbers.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serializer};
use serde_json::Value as JsonValue;

pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    match non_finite_name(*value) {
        Some(name) => serializer.serialize_str(name),
        None => serializer.serialize_f64(*value),
    }
}

pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(f64),
        Text(String),
    }

    match Repr::deserialize(deserializer)? {
        Repr::Number(value) => Ok(value),
        Repr::Text(text) => parse_name(&text)
            .ok_or_else(|| D::Error::custom(format!("invalid double `{text}`"))),
    }
}

/// JSON form used on the wire for `doubleValue`.
pub(crate) fn to_json(value: f64) -> JsonValue {
    match non_finite_name(value) {
        Some(name) => JsonValue::String(name.to_string()),
        None => serde_json::json!(value),
    }
}

pub(crate) fn parse_name(text: &str) -> Option<f64> {
    match text {
        "NaN" => Some(f64::NAN),
        "Infinity" => Some(f64::INFINITY),
        "-Infinity" => Some(f64::NEG_INFINITY),
        _ => None,
    }
}

fn non_finite_name(value: f64) -> Option<&'static str> {
    if value.is_nan() {
        Some("NaN")
    } else if value == f64::INFINITY {
        Some("Infinity")
    } else if value == f64::NEG_INFINITY {
        Some("-Infinity")
    } else {
        None
    }
}
