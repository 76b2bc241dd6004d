//! Expression-level invariants: determinism, constant coherence,
//! equivalence soundness, three-valued truth tables, filter covers.

use siftdb::expression::{Expr, FoldContext};
use siftdb::value::{AnnotatedValue, Value};

fn items() -> Vec<AnnotatedValue> {
    [
        serde_json::json!({}),
        serde_json::json!({"x": 1}),
        serde_json::json!({"x": null}),
        serde_json::json!({"x": "s", "y": [1, 2]}),
        serde_json::json!({"x": {"nested": true}, "y": 0}),
    ]
    .into_iter()
    .map(|j| AnnotatedValue::new(Value::from(j)))
    .collect()
}

fn sample_exprs() -> Vec<Expr> {
    vec![
        Expr::constant(1),
        Expr::ident("x"),
        Expr::path("k", "x"),
        Expr::eq(Expr::ident("x"), Expr::constant(1)),
        Expr::Add(vec![Expr::ident("x"), Expr::constant(2)]),
        Expr::And(vec![
            Expr::eq(Expr::ident("x"), Expr::constant(1)),
            Expr::Not(Box::new(Expr::ident("y"))),
        ]),
        Expr::Or(vec![
            Expr::IsNull(Box::new(Expr::ident("x"))),
            Expr::lt(Expr::ident("y"), Expr::constant(10)),
        ]),
        Expr::Concat(vec![Expr::ident("x"), Expr::constant("!")]),
        Expr::IsMissing(Box::new(Expr::ident("zz"))),
    ]
}

#[test]
fn test_evaluation_is_deterministic() {
    for expr in sample_exprs() {
        for item in items() {
            let a = expr.evaluate(&item, &FoldContext).unwrap();
            let b = expr.evaluate(&item, &FoldContext).unwrap();
            assert_eq!(a, b, "{} must be deterministic", expr);
        }
    }
}

#[test]
fn test_constant_value_agrees_with_evaluation() {
    let constants = vec![
        Expr::constant(5),
        Expr::Add(vec![Expr::constant(2), Expr::constant(3)]),
        Expr::And(vec![Expr::constant(true), Expr::constant(true)]),
        Expr::Concat(vec![Expr::constant("a"), Expr::constant("b")]),
        Expr::Not(Box::new(Expr::constant(false))),
    ];
    let empty = AnnotatedValue::missing();
    for expr in constants {
        let folded = expr.constant_value().expect("must fold");
        let evaluated = expr.evaluate(&empty, &FoldContext).unwrap();
        assert_eq!(folded, evaluated, "{}", expr);
    }
}

#[test]
fn test_equivalence_implies_equal_evaluation() {
    let pairs = vec![
        (
            Expr::And(vec![Expr::ident("x"), Expr::ident("y")]),
            Expr::And(vec![Expr::ident("y"), Expr::ident("x")]),
        ),
        (
            Expr::Add(vec![Expr::constant(2), Expr::constant(3)]),
            Expr::constant(5),
        ),
        (
            Expr::eq(Expr::ident("x"), Expr::constant(1)),
            Expr::eq(Expr::ident("x"), Expr::constant(1)),
        ),
    ];
    for (a, b) in pairs {
        assert!(a.equivalent_to(&b), "{} ~ {}", a, b);
        for item in items() {
            let va = a.evaluate(&item, &FoldContext).unwrap();
            let vb = b.evaluate(&item, &FoldContext).unwrap();
            assert_eq!(va, vb, "{} vs {}", a, b);
        }
    }
}

#[test]
fn test_or_truth_table_priority() {
    // TRUE > NULL > MISSING > FALSE, over all 2- and 3-operand shapes
    let operands = [
        Value::Bool(true),
        Value::Bool(false),
        Value::Null,
        Value::Missing,
    ];
    let empty = AnnotatedValue::missing();
    for a in &operands {
        for b in &operands {
            for c in &operands {
                let expr = Expr::Or(vec![
                    Expr::Constant(a.clone()),
                    Expr::Constant(b.clone()),
                    Expr::Constant(c.clone()),
                ]);
                let got = expr.evaluate(&empty, &FoldContext).unwrap();
                let all = [a, b, c];
                let expected = if all.iter().any(|v| v.truth()) {
                    Value::Bool(true)
                } else if all.iter().any(|v| matches!(v, Value::Null)) {
                    Value::Null
                } else if all.iter().any(|v| matches!(v, Value::Missing)) {
                    Value::Missing
                } else {
                    Value::Bool(false)
                };
                assert_eq!(got, expected, "or({:?},{:?},{:?})", a, b, c);
            }
        }
    }
}

#[test]
fn test_and_truth_table_dual() {
    let operands = [
        Value::Bool(true),
        Value::Bool(false),
        Value::Null,
        Value::Missing,
    ];
    let empty = AnnotatedValue::missing();
    for a in &operands {
        for b in &operands {
            let expr = Expr::And(vec![Expr::Constant(a.clone()), Expr::Constant(b.clone())]);
            let got = expr.evaluate(&empty, &FoldContext).unwrap();
            let all = [a, b];
            let expected = if all
                .iter()
                .any(|v| !matches!(v, Value::Null | Value::Missing) && !v.truth())
            {
                Value::Bool(false)
            } else if all.iter().any(|v| matches!(v, Value::Null)) {
                Value::Null
            } else if all.iter().any(|v| matches!(v, Value::Missing)) {
                Value::Missing
            } else {
                Value::Bool(true)
            };
            assert_eq!(got, expected, "and({:?},{:?})", a, b);
        }
    }
}

#[test]
fn test_filter_covers_or_intersection() {
    use std::collections::HashMap;

    let x = || Expr::path("k", "x");

    // disagreeing disjuncts pin nothing
    let differs = Expr::Or(vec![
        Expr::eq(x(), Expr::constant(1)),
        Expr::eq(x(), Expr::constant(2)),
    ]);
    let mut covers = HashMap::new();
    differs.filter_covers(&mut covers);
    assert!(covers.get(&x().to_string()).is_none());

    // agreeing disjuncts keep the binding
    let agrees = Expr::Or(vec![
        Expr::eq(x(), Expr::constant(1)),
        Expr::eq(x(), Expr::constant(1)),
    ]);
    let mut covers = HashMap::new();
    agrees.filter_covers(&mut covers);
    assert_eq!(covers.get(&x().to_string()), Some(&Value::int(1)));
}

#[test]
fn test_depends_on_rejects_constants_and_conditionals() {
    let path = Expr::path("k", "x");
    let pred = Expr::eq(path.clone(), Expr::constant(1));
    assert!(pred.depends_on(&path));
    assert!(!pred.depends_on(&Expr::constant(1)));

    let case = Expr::SearchedCase {
        whens: vec![(path.clone(), Expr::constant(1))],
        otherwise: None,
    };
    // conditional receivers never report dependencies
    assert!(!case.depends_on(&path));
}

#[test]
fn test_missing_and_null_stay_distinct_through_equality() {
    let empty = AnnotatedValue::missing();
    let eq_mm = Expr::eq(
        Expr::Constant(Value::Missing),
        Expr::Constant(Value::Missing),
    );
    assert_eq!(eq_mm.evaluate(&empty, &FoldContext).unwrap(), Value::Missing);

    let eq_nn = Expr::eq(Expr::Constant(Value::Null), Expr::Constant(Value::Null));
    assert_eq!(eq_nn.evaluate(&empty, &FoldContext).unwrap(), Value::Null);

    let eq_mn = Expr::eq(Expr::Constant(Value::Missing), Expr::Constant(Value::Null));
    assert_eq!(eq_mn.evaluate(&empty, &FoldContext).unwrap(), Value::Missing);
}
