//! Small pure helpers over `serde_json::Value`.
//!
//! The upstream protocols are navigated generically rather than via named
//! types — frames and snapshots vary across service snapshots, so probing
//! is deliberately shape-tolerant.

use serde_json::Value;

/// `v[key]` as a non-empty &str.
pub fn str_field<'a>(v: &'a Value, key: &str) -> Option<&'a str> {
    v.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

/// `v[key]` as an i64 (accepts integer-valued floats).
pub fn int_field(v: &Value, key: &str) -> Option<i64> {
    match v.get(key) {
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        _ => None,
    }
}

pub fn bool_field(v: &Value, key: &str) -> Option<bool> {
    v.get(key).and_then(Value::as_bool)
}

pub fn array_field<'a>(v: &'a Value, key: &str) -> Option<&'a Vec<Value>> {
    v.get(key).and_then(Value::as_array)
}

pub fn is_object(v: &Value) -> bool {
    v.is_object()
}

/// First non-empty string among `keys`, in order.
pub fn first_str<'a>(v: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| str_field(v, k))
}

/// Walk a dotted path of object keys.
pub fn path<'a>(v: &'a Value, segments: &[&str]) -> Option<&'a Value> {
    segments.iter().try_fold(v, |node, seg| node.get(seg))
}
