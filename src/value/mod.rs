//! JSON value model.
//!
//! Values carry an explicit MISSING kind distinct from NULL: MISSING is
//! the absence of a field, NULL is an explicit null. Both participate in
//! three-valued logic and in the total collation order.

mod annotated;
mod collate;
mod number;

pub use annotated::AnnotatedValue;
pub use number::Number;

use std::collections::BTreeMap;
use std::fmt;

/// Type tag of a [`Value`], in collation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ValueKind {
    Missing,
    Null,
    Boolean,
    Number,
    String,
    Array,
    Object,
    Binary,
}

impl ValueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueKind::Missing => "missing",
            ValueKind::Null => "null",
            ValueKind::Boolean => "boolean",
            ValueKind::Number => "number",
            ValueKind::String => "string",
            ValueKind::Array => "array",
            ValueKind::Object => "object",
            ValueKind::Binary => "binary",
        }
    }
}

/// A JSON-typed value.
///
/// Objects use a BTreeMap so field iteration and rendering are
/// deterministic.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Missing,
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
    Binary(Vec<u8>),
}

pub const TRUE_VALUE: Value = Value::Bool(true);
pub const FALSE_VALUE: Value = Value::Bool(false);

impl Default for Value {
    fn default() -> Self {
        Value::Missing
    }
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Missing => ValueKind::Missing,
            Value::Null => ValueKind::Null,
            Value::Bool(_) => ValueKind::Boolean,
            Value::Number(_) => ValueKind::Number,
            Value::String(_) => ValueKind::String,
            Value::Array(_) => ValueKind::Array,
            Value::Object(_) => ValueKind::Object,
            Value::Binary(_) => ValueKind::Binary,
        }
    }

    pub fn int(n: i64) -> Value {
        Value::Number(Number::Int(n))
    }

    pub fn float(n: f64) -> Value {
        Value::Number(Number::Float(n))
    }

    pub fn string(s: impl Into<String>) -> Value {
        Value::String(s.into())
    }

    pub fn empty_object() -> Value {
        Value::Object(BTreeMap::new())
    }

    pub fn empty_array() -> Value {
        Value::Array(Vec::new())
    }

    /// Kleene truth. MISSING and NULL are false; empty strings, arrays
    /// and objects are false; zero is false.
    pub fn truth(&self) -> bool {
        match self {
            Value::Missing | Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => !n.is_zero(),
            Value::String(s) => !s.is_empty(),
            Value::Array(a) => !a.is_empty(),
            Value::Object(o) => !o.is_empty(),
            Value::Binary(b) => !b.is_empty(),
        }
    }

    /// Three-valued equality: MISSING if either side is MISSING, NULL if
    /// either side is NULL, otherwise a BOOLEAN by deep structural
    /// equality.
    pub fn equals(&self, other: &Value) -> Value {
        if self.kind() == ValueKind::Missing || other.kind() == ValueKind::Missing {
            return Value::Missing;
        }
        if self.kind() == ValueKind::Null || other.kind() == ValueKind::Null {
            return Value::Null;
        }
        Value::Bool(self.same(other))
    }

    /// Deep structural equality for non-absent values. Numbers compare
    /// across integer and float representations.
    fn same(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a.same(b),
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => {
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.same(y))
            }
            (Value::Object(a), Value::Object(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .zip(b.iter())
                        .all(|((ka, va), (kb, vb))| ka == kb && va.same(vb))
            }
            (Value::Binary(a), Value::Binary(b)) => a == b,
            _ => false,
        }
    }

    /// Field access. Returns MISSING (not NULL) for absent fields and for
    /// non-object receivers.
    pub fn field(&self, name: &str) -> (Value, bool) {
        match self {
            Value::Object(o) => match o.get(name) {
                Some(v) => (v.clone(), true),
                None => (Value::Missing, false),
            },
            _ => (Value::Missing, false),
        }
    }

    pub fn field_ref(&self, name: &str) -> Option<&Value> {
        match self {
            Value::Object(o) => o.get(name),
            _ => None,
        }
    }

    /// Array element access. Negative indexes count from the end.
    pub fn index(&self, i: i64) -> (Value, bool) {
        match self {
            Value::Array(a) => {
                let len = a.len() as i64;
                let i = if i < 0 { len + i } else { i };
                if i >= 0 && i < len {
                    (a[i as usize].clone(), true)
                } else {
                    (Value::Missing, false)
                }
            }
            _ => (Value::Missing, false),
        }
    }

    /// Sets a field on an object receiver. Setting MISSING removes the
    /// field. Non-object receivers ignore the call.
    pub fn set_field(&mut self, name: &str, value: Value) {
        if let Value::Object(o) = self {
            if value.kind() == ValueKind::Missing {
                o.remove(name);
            } else {
                o.insert(name.to_string(), value);
            }
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<Number> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.as_number().and_then(|n| n.as_i64())
    }

    pub fn as_f64(&self) -> Option<f64> {
        self.as_number().map(|n| as_f64(n))
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    /// Total collation order over all value kinds.
    pub fn collate(&self, other: &Value) -> std::cmp::Ordering {
        collate::collate(self, other)
    }

    /// Canonical JSON rendering. MISSING renders as the bare token
    /// "missing" for keying purposes; it has no JSON image and is removed
    /// from objects on conversion.
    pub fn canonical_string(&self) -> String {
        match self {
            Value::Missing => "missing".to_string(),
            _ => serde_json::Value::from(self.clone()).to_string(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical_string())
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Value {
        Value::int(n)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Value {
        Value::float(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Value {
        Value::string(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Value {
        Value::Bool(b)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Number(Number::Int(i))
                } else {
                    Value::Number(Number::Float(n.as_f64().unwrap_or(0.0)))
                }
            }
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(a) => Value::Array(a.into_iter().map(Value::from).collect()),
            serde_json::Value::Object(o) => {
                Value::Object(o.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<Value> for serde_json::Value {
    fn from(v: Value) -> Self {
        match v {
            // MISSING has no JSON image; callers strip missing fields
            // before conversion, stray ones become null.
            Value::Missing | Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(b),
            Value::Number(Number::Int(i)) => serde_json::Value::from(i),
            Value::Number(Number::Float(f)) => {
                serde_json::Number::from_f64(f).map_or(serde_json::Value::Null, serde_json::Value::Number)
            }
            Value::String(s) => serde_json::Value::String(s),
            Value::Array(a) => {
                serde_json::Value::Array(a.into_iter().map(serde_json::Value::from).collect())
            }
            Value::Object(o) => serde_json::Value::Object(
                o.into_iter()
                    .filter(|(_, v)| v.kind() != ValueKind::Missing)
                    .map(|(k, v)| (k, serde_json::Value::from(v)))
                    .collect(),
            ),
            Value::Binary(b) => serde_json::Value::String(base64_encode(&b)),
        }
    }
}

fn as_f64(n: Number) -> f64 {
    match n {
        Number::Int(i) => i as f64,
        Number::Float(f) => f,
    }
}

// Minimal standard base64 for the rare binary-in-JSON case.
fn base64_encode(bytes: &[u8]) -> String {
    const TABLE: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
    let mut out = String::with_capacity((bytes.len() + 2) / 3 * 4);
    for chunk in bytes.chunks(3) {
        let b = [chunk[0], *chunk.get(1).unwrap_or(&0), *chunk.get(2).unwrap_or(&0)];
        let n = ((b[0] as u32) << 16) | ((b[1] as u32) << 8) | b[2] as u32;
        out.push(TABLE[(n >> 18) as usize & 63] as char);
        out.push(TABLE[(n >> 12) as usize & 63] as char);
        out.push(if chunk.len() > 1 { TABLE[(n >> 6) as usize & 63] as char } else { '=' });
        out.push(if chunk.len() > 2 { TABLE[n as usize & 63] as char } else { '=' });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_missing_and_null_are_distinct() {
        assert_ne!(Value::Missing, Value::Null);
        assert!(!Value::Missing.truth());
        assert!(!Value::Null.truth());
    }

    #[test]
    fn test_equals_propagates_absence() {
        let one = Value::int(1);
        assert_eq!(one.equals(&Value::Missing), Value::Missing);
        assert_eq!(Value::Missing.equals(&Value::Missing), Value::Missing);
        assert_eq!(one.equals(&Value::Null), Value::Null);
        // MISSING dominates NULL
        assert_eq!(Value::Missing.equals(&Value::Null), Value::Missing);
        assert_eq!(one.equals(&Value::int(1)), Value::Bool(true));
        assert_eq!(one.equals(&Value::int(2)), Value::Bool(false));
    }

    #[test]
    fn test_numeric_equality_across_representations() {
        assert_eq!(Value::int(2).equals(&Value::float(2.0)), Value::Bool(true));
        assert_eq!(Value::int(2).equals(&Value::float(2.5)), Value::Bool(false));
    }

    #[test]
    fn test_field_access_returns_missing() {
        let doc = Value::from(json!({"a": 1}));
        let (v, present) = doc.field("a");
        assert!(present);
        assert_eq!(v, Value::int(1));
        let (v, present) = doc.field("b");
        assert!(!present);
        assert_eq!(v, Value::Missing);
        // non-object receiver
        let (v, _) = Value::int(3).field("a");
        assert_eq!(v, Value::Missing);
    }

    #[test]
    fn test_negative_array_index() {
        let arr = Value::from(json!([10, 20, 30]));
        assert_eq!(arr.index(-1).0, Value::int(30));
        assert_eq!(arr.index(3).0, Value::Missing);
    }

    #[test]
    fn test_set_field_missing_removes() {
        let mut doc = Value::from(json!({"a": 1, "b": 2}));
        doc.set_field("a", Value::Missing);
        assert_eq!(doc.field("a").0, Value::Missing);
        assert_eq!(doc.field("b").0, Value::int(2));
    }

    #[test]
    fn test_truth_of_collections() {
        assert!(!Value::empty_array().truth());
        assert!(Value::from(json!([0])).truth());
        assert!(!Value::string("").truth());
        assert!(Value::string("x").truth());
        assert!(!Value::int(0).truth());
    }

    #[test]
    fn test_json_round_trip_drops_missing_fields() {
        let mut doc = Value::from(json!({"a": 1}));
        if let Value::Object(o) = &mut doc {
            o.insert("gone".into(), Value::Missing);
        }
        let j: serde_json::Value = doc.into();
        assert_eq!(j, json!({"a": 1}));
    }
}
