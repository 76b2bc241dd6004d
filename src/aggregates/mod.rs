//! Aggregate computation protocol.
//!
//! The group operators drive every aggregate through the same four
//! steps: `default` seeds an accumulator, `initial` folds one input item
//! into a partial, `intermediate` merges two partials, `final_value`
//! produces the result. Streaming composition (parallel initial stages,
//! merged intermediates, one final stage) falls out of this shape.
//!
//! Partial representations: COUNT and SUM carry plain numbers, MIN and
//! MAX carry the best value seen (MISSING until one arrives), AVG carries
//! `{"sum": n, "count": c}`, and DISTINCT variants carry the array of
//! distinct values seen.

use crate::errors::Result;
use crate::expression::{AggKind, Aggregate, EvalContext};
use crate::value::{AnnotatedValue, Value, ValueKind};

/// The accumulator for an empty group.
pub fn default_value(agg: &Aggregate) -> Value {
    if agg.distinct {
        return Value::empty_array();
    }
    match agg.kind {
        AggKind::CountStar | AggKind::Count => Value::int(0),
        AggKind::Sum => Value::Null,
        AggKind::Avg => avg_partial(Value::Null, 0),
        AggKind::Min | AggKind::Max => Value::Missing,
    }
}

/// Folds one item into `acc`.
pub fn initial(
    agg: &Aggregate,
    acc: Value,
    item: &AnnotatedValue,
    ctx: &dyn EvalContext,
) -> Result<Value> {
    let operand = match (&agg.operand, agg.kind) {
        (None, AggKind::CountStar) => Value::Bool(true),
        (None, _) => Value::Missing,
        (Some(op), _) => op.evaluate(item, ctx)?,
    };

    if agg.distinct {
        return Ok(distinct_add(acc, operand));
    }

    let part = match agg.kind {
        AggKind::CountStar => Value::int(1),
        AggKind::Count => match operand.kind() {
            ValueKind::Missing | ValueKind::Null => Value::int(0),
            _ => Value::int(1),
        },
        AggKind::Sum => match operand {
            Value::Number(n) => Value::Number(n),
            _ => Value::Null,
        },
        AggKind::Avg => match operand {
            Value::Number(n) => avg_partial(Value::Number(n), 1),
            _ => avg_partial(Value::Null, 0),
        },
        AggKind::Min | AggKind::Max => match operand.kind() {
            ValueKind::Missing | ValueKind::Null => Value::Missing,
            _ => operand,
        },
    };
    intermediate(agg, acc, part)
}

/// Merges two partials.
pub fn intermediate(agg: &Aggregate, a: Value, b: Value) -> Result<Value> {
    if agg.distinct {
        return Ok(distinct_merge(a, b));
    }
    let merged = match agg.kind {
        AggKind::CountStar | AggKind::Count => numeric_add(a, b),
        AggKind::Sum => numeric_add(a, b),
        AggKind::Avg => {
            let (sa, ca) = split_avg(&a);
            let (sb, cb) = split_avg(&b);
            avg_partial(numeric_add(sa, sb), ca + cb)
        }
        AggKind::Min => best(a, b, std::cmp::Ordering::Less),
        AggKind::Max => best(a, b, std::cmp::Ordering::Greater),
    };
    Ok(merged)
}

/// Finalizes a partial into the aggregate's result.
pub fn final_value(agg: &Aggregate, part: Value) -> Result<Value> {
    if agg.distinct {
        let list = match part.as_array() {
            Some(a) => a.to_vec(),
            None => Vec::new(),
        };
        let out = match agg.kind {
            AggKind::CountStar | AggKind::Count => Value::int(list.len() as i64),
            AggKind::Sum => list
                .into_iter()
                .fold(Value::Null, numeric_add_value),
            AggKind::Avg => {
                let mut sum = Value::Null;
                let mut count = 0i64;
                for v in list {
                    if matches!(v, Value::Number(_)) {
                        sum = numeric_add_value(sum, v);
                        count += 1;
                    }
                }
                finalize_avg(sum, count)
            }
            AggKind::Min => list
                .into_iter()
                .fold(Value::Missing, |a, b| best(a, b, std::cmp::Ordering::Less)),
            AggKind::Max => list
                .into_iter()
                .fold(Value::Missing, |a, b| best(a, b, std::cmp::Ordering::Greater)),
        };
        return Ok(absent_to_null(out));
    }

    let out = match agg.kind {
        AggKind::CountStar | AggKind::Count | AggKind::Sum => part,
        AggKind::Avg => {
            let (sum, count) = split_avg(&part);
            finalize_avg(sum, count)
        }
        AggKind::Min | AggKind::Max => part,
    };
    Ok(absent_to_null(out))
}

fn absent_to_null(v: Value) -> Value {
    if v.kind() == ValueKind::Missing {
        Value::Null
    } else {
        v
    }
}

fn avg_partial(sum: Value, count: i64) -> Value {
    let mut obj = Value::empty_object();
    obj.set_field("sum", if sum.kind() == ValueKind::Missing { Value::Null } else { sum });
    obj.set_field("count", Value::int(count));
    obj
}

fn split_avg(part: &Value) -> (Value, i64) {
    let sum = part.field_ref("sum").cloned().unwrap_or(Value::Null);
    let count = part
        .field_ref("count")
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    (sum, count)
}

fn finalize_avg(sum: Value, count: i64) -> Value {
    if count == 0 {
        return Value::Null;
    }
    match sum.as_number() {
        Some(n) => Value::float(n.as_f64() / count as f64),
        None => Value::Null,
    }
}

/// NULL-as-identity numeric addition for partials.
fn numeric_add(a: Value, b: Value) -> Value {
    match (a.as_number(), b.as_number()) {
        (Some(x), Some(y)) => Value::Number(x.add(&y)),
        (Some(x), None) => Value::Number(x),
        (None, Some(y)) => Value::Number(y),
        (None, None) => Value::Null,
    }
}

fn numeric_add_value(acc: Value, v: Value) -> Value {
    match v {
        Value::Number(_) => numeric_add(acc, v),
        _ => acc,
    }
}

/// MISSING-as-identity min/max.
fn best(a: Value, b: Value, want: std::cmp::Ordering) -> Value {
    match (a.kind(), b.kind()) {
        (ValueKind::Missing, _) => b,
        (_, ValueKind::Missing) => a,
        _ => {
            if b.collate(&a) == want {
                b
            } else {
                a
            }
        }
    }
}

fn distinct_add(acc: Value, v: Value) -> Value {
    match v.kind() {
        ValueKind::Missing | ValueKind::Null => return acc,
        _ => {}
    }
    let mut list = match acc {
        Value::Array(a) => a,
        _ => Vec::new(),
    };
    if !list
        .iter()
        .any(|e| e.collate(&v) == std::cmp::Ordering::Equal)
    {
        list.push(v);
    }
    Value::Array(list)
}

fn distinct_merge(a: Value, b: Value) -> Value {
    let mut acc = match a {
        Value::Array(_) => a,
        _ => Value::empty_array(),
    };
    if let Value::Array(items) = b {
        for v in items {
            acc = distinct_add(acc, v);
        }
    }
    acc
}

/// Convenience for tests and the count-scan fast path.
pub fn count_star_of(n: u64) -> (String, Value) {
    (Aggregate::count_star().text(), Value::int(n as i64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::{Expr, FoldContext};
    use serde_json::json;

    fn item(j: serde_json::Value) -> AnnotatedValue {
        AnnotatedValue::new(Value::from(j))
    }

    fn run(agg: &Aggregate, docs: &[serde_json::Value]) -> Value {
        let mut acc = default_value(agg);
        for d in docs {
            acc = initial(agg, acc, &item(d.clone()), &FoldContext).unwrap();
        }
        final_value(agg, acc).unwrap()
    }

    #[test]
    fn test_count_star_counts_everything() {
        let agg = Aggregate::count_star();
        let out = run(&agg, &[json!({"x": 1}), json!({}), json!({"x": null})]);
        assert_eq!(out, Value::int(3));
    }

    #[test]
    fn test_count_expr_skips_absent() {
        let agg = Aggregate::new(AggKind::Count, Expr::ident("x"));
        let out = run(&agg, &[json!({"x": 1}), json!({}), json!({"x": null})]);
        assert_eq!(out, Value::int(1));
    }

    #[test]
    fn test_avg_is_sum_over_count() {
        let agg = Aggregate::new(AggKind::Avg, Expr::ident("x"));
        let out = run(&agg, &[json!({"x": 1}), json!({"x": 2}), json!({"x": 6})]);
        assert_eq!(out, Value::float(3.0));
    }

    #[test]
    fn test_avg_of_empty_group_is_null() {
        let agg = Aggregate::new(AggKind::Avg, Expr::ident("x"));
        assert_eq!(run(&agg, &[]), Value::Null);
    }

    #[test]
    fn test_min_max_ignore_absent() {
        let min = Aggregate::new(AggKind::Min, Expr::ident("x"));
        let max = Aggregate::new(AggKind::Max, Expr::ident("x"));
        let docs = [json!({"x": 5}), json!({}), json!({"x": 2}), json!({"x": null})];
        assert_eq!(run(&min, &docs), Value::int(2));
        assert_eq!(run(&max, &docs), Value::int(5));
    }

    #[test]
    fn test_intermediate_merge_matches_single_pass() {
        let agg = Aggregate::new(AggKind::Sum, Expr::ident("x"));
        let docs: Vec<serde_json::Value> =
            (1..=6).map(|i| json!({ "x": i })).collect();

        let single = run(&agg, &docs);

        let mut left = default_value(&agg);
        for d in &docs[..3] {
            left = initial(&agg, left, &item(d.clone()), &FoldContext).unwrap();
        }
        let mut right = default_value(&agg);
        for d in &docs[3..] {
            right = initial(&agg, right, &item(d.clone()), &FoldContext).unwrap();
        }
        let merged = intermediate(&agg, left, right).unwrap();
        assert_eq!(final_value(&agg, merged).unwrap(), single);
    }

    #[test]
    fn test_distinct_count() {
        let mut agg = Aggregate::new(AggKind::Count, Expr::ident("x"));
        agg.distinct = true;
        let out = run(
            &agg,
            &[json!({"x": 1}), json!({"x": 1}), json!({"x": 2}), json!({})],
        );
        assert_eq!(out, Value::int(2));
    }

    #[test]
    fn test_number_identity_under_merge() {
        let agg = Aggregate::new(AggKind::Sum, Expr::ident("x"));
        let merged = intermediate(&agg, Value::Null, Value::int(4)).unwrap();
        assert_eq!(merged, Value::int(4));
    }
}
