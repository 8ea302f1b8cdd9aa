use std::cmp::Ordering;
use std::fmt::Write as _;

use crate::value::{SentinelValue, Value, ValueKind};

/// Position of each value type in the cross-type sort order.
pub fn type_order(value: &Value) -> u8 {
    match value.kind() {
        ValueKind::Null => 0,
        ValueKind::Boolean(_) => 1,
        ValueKind::Integer(_) | ValueKind::Double(_) => 2,
        ValueKind::Timestamp(_) => 3,
        ValueKind::String(_) => 4,
        ValueKind::Bytes(_) => 5,
        ValueKind::Reference(_) => 6,
        ValueKind::GeoPoint(_) => 7,
        ValueKind::Array(_) => 8,
        ValueKind::Map(_) => 9,
        ValueKind::Sentinel(_) => 10,
    }
}

/// Total order over values. NaN sorts before every other number.
pub fn compare_values(left: &Value, right: &Value) -> Ordering {
    let by_type = type_order(left).cmp(&type_order(right));
    if by_type != Ordering::Equal {
        return by_type;
    }
    match (left.kind(), right.kind()) {
        (ValueKind::Null, ValueKind::Null) => Ordering::Equal,
        (ValueKind::Boolean(a), ValueKind::Boolean(b)) => a.cmp(b),
        (ValueKind::Integer(a), ValueKind::Integer(b)) => a.cmp(b),
        (ValueKind::Double(a), ValueKind::Double(b)) => compare_doubles(*a, *b),
        (ValueKind::Integer(a), ValueKind::Double(b)) => compare_mixed(*a, *b),
        (ValueKind::Double(a), ValueKind::Integer(b)) => compare_mixed(*b, *a).reverse(),
        (ValueKind::Timestamp(a), ValueKind::Timestamp(b)) => a.cmp(b),
        (ValueKind::String(a), ValueKind::String(b)) => a.cmp(b),
        (ValueKind::Bytes(a), ValueKind::Bytes(b)) => a.cmp(b),
        (ValueKind::Reference(a), ValueKind::Reference(b)) => compare_references(a, b),
        (ValueKind::GeoPoint(a), ValueKind::GeoPoint(b)) => a.compare(b),
        (ValueKind::Array(a), ValueKind::Array(b)) => {
            for (left, right) in a.values().iter().zip(b.values()) {
                let ordering = compare_values(left, right);
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            a.values().len().cmp(&b.values().len())
        }
        (ValueKind::Map(a), ValueKind::Map(b)) => {
            for ((left_key, left), (right_key, right)) in a.fields().iter().zip(b.fields()) {
                let ordering = left_key
                    .cmp(right_key)
                    .then_with(|| compare_values(left, right));
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            a.fields().len().cmp(&b.fields().len())
        }
        _ => Ordering::Equal,
    }
}

/// Equality used by filters: integers and doubles compare numerically, NaN equals NaN.
pub fn values_equal(left: &Value, right: &Value) -> bool {
    if type_order(left) != type_order(right) {
        return false;
    }
    match (left.kind(), right.kind()) {
        (ValueKind::Double(a), ValueKind::Double(b)) if a.is_nan() && b.is_nan() => true,
        (ValueKind::Array(a), ValueKind::Array(b)) => {
            a.values().len() == b.values().len()
                && a.values()
                    .iter()
                    .zip(b.values())
                    .all(|(left, right)| values_equal(left, right))
        }
        (ValueKind::Map(a), ValueKind::Map(b)) => {
            a.fields().len() == b.fields().len()
                && a.fields().iter().zip(b.fields()).all(
                    |((left_key, left), (right_key, right))| {
                        left_key == right_key && values_equal(left, right)
                    },
                )
        }
        _ => compare_values(left, right) == Ordering::Equal,
    }
}

/// Stable textual identity of a value, equal for values that compare equal.
pub fn canonical_id(value: &Value) -> String {
    let mut out = String::new();
    write_canonical_id(value, &mut out);
    out
}

fn write_canonical_id(value: &Value, out: &mut String) {
    match value.kind() {
        ValueKind::Null => out.push_str("null"),
        ValueKind::Boolean(flag) => {
            let _ = write!(out, "{flag}");
        }
        ValueKind::Integer(integer) => {
            let _ = write!(out, "{integer}");
        }
        ValueKind::Double(double) => {
            if double.fract() == 0.0 && double.abs() < 9.007_199_254_740_992e15 {
                let _ = write!(out, "{}", *double as i64);
            } else {
                let _ = write!(out, "{double:e}");
            }
        }
        ValueKind::Timestamp(timestamp) => {
            let _ = write!(out, "time({},{})", timestamp.seconds, timestamp.nanos);
        }
        ValueKind::String(text) => {
            let _ = write!(out, "{text:?}");
        }
        ValueKind::Bytes(bytes) => {
            let _ = write!(out, "bytes({})", bytes.to_base64());
        }
        ValueKind::Reference(reference) => {
            let _ = write!(out, "ref({reference})");
        }
        ValueKind::GeoPoint(point) => {
            let _ = write!(out, "geo({},{})", point.latitude(), point.longitude());
        }
        ValueKind::Array(array) => {
            out.push('[');
            for (index, element) in array.values().iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical_id(element, out);
            }
            out.push(']');
        }
        ValueKind::Map(map) => {
            out.push('{');
            for (index, (key, element)) in map.fields().iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                let _ = write!(out, "{key}:");
                write_canonical_id(element, out);
            }
            out.push('}');
        }
        ValueKind::Sentinel(sentinel) => {
            let name = match sentinel {
                SentinelValue::ServerTimestamp => "serverTimestamp",
                SentinelValue::ArrayUnion(_) => "arrayUnion",
                SentinelValue::ArrayRemove(_) => "arrayRemove",
                SentinelValue::NumericIncrement(_) => "increment",
                SentinelValue::Delete => "delete",
            };
            let _ = write!(out, "sentinel({name})");
        }
    }
}

fn compare_doubles(left: f64, right: f64) -> Ordering {
    match (left.is_nan(), right.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        _ => left.partial_cmp(&right).unwrap_or(Ordering::Equal),
    }
}

fn compare_mixed(integer: i64, double: f64) -> Ordering {
    if double.is_nan() {
        return Ordering::Greater;
    }
    compare_doubles(integer as f64, double)
}

fn compare_references(left: &str, right: &str) -> Ordering {
    let left_segments = left.split('/');
    let right_segments = right.split('/');
    left_segments.cmp(right_segments)
}
