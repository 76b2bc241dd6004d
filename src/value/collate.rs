//! Total collation order over values.
//!
//! MISSING < NULL < FALSE < TRUE < numbers < strings < arrays < objects
//! < binary. Within a kind the order is the natural one; arrays compare
//! element-wise then by length, objects by sorted field name then value.

use std::cmp::Ordering;

use super::Value;

pub fn collate(a: &Value, b: &Value) -> Ordering {
    let (ka, kb) = (a.kind(), b.kind());
    if ka != kb {
        return ka.cmp(&kb);
    }

    match (a, b) {
        (Value::Missing, Value::Missing) | (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => x.compare(y),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (xe, ye) in x.iter().zip(y.iter()) {
                let c = collate(xe, ye);
                if c != Ordering::Equal {
                    return c;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => {
            // BTreeMap iterates in key order already.
            for ((kx, vx), (ky, vy)) in x.iter().zip(y.iter()) {
                let c = kx.cmp(ky);
                if c != Ordering::Equal {
                    return c;
                }
                let c = collate(vx, vy);
                if c != Ordering::Equal {
                    return c;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Binary(x), Value::Binary(y)) => x.cmp(y),
        _ => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn v(j: serde_json::Value) -> Value {
        Value::from(j)
    }

    #[test]
    fn test_kind_order() {
        let ladder = vec![
            Value::Missing,
            Value::Null,
            Value::Bool(false),
            Value::Bool(true),
            v(json!(-1)),
            v(json!(0)),
            v(json!("")),
            v(json!("a")),
            v(json!([])),
            v(json!([1])),
            v(json!({})),
            v(json!({"a": 1})),
            Value::Binary(vec![0]),
        ];
        for pair in ladder.windows(2) {
            assert_eq!(
                collate(&pair[0], &pair[1]),
                Ordering::Less,
                "{:?} < {:?}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_array_elementwise_then_length() {
        assert_eq!(collate(&v(json!([1, 2])), &v(json!([1, 3]))), Ordering::Less);
        assert_eq!(collate(&v(json!([1])), &v(json!([1, 0]))), Ordering::Less);
    }

    #[test]
    fn test_object_by_key_then_value() {
        assert_eq!(
            collate(&v(json!({"a": 1})), &v(json!({"a": 2}))),
            Ordering::Less
        );
        assert_eq!(
            collate(&v(json!({"a": 1})), &v(json!({"b": 1}))),
            Ordering::Less
        );
    }

    #[test]
    fn test_collation_is_total_and_reflexive() {
        let x = v(json!({"a": [1, "x", null]}));
        assert_eq!(collate(&x, &x), Ordering::Equal);
    }
}
