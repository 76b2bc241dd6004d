//! Expression evaluation under three-valued logic.
//!
//! MISSING propagates through arithmetic, comparison, field and element
//! access; NULL propagates when no operand is MISSING. OR resolves
//! TRUE > NULL > MISSING > FALSE, AND resolves the dual.

use std::sync::Arc;

use crate::algebra::Select;
use crate::errors::{Error, Result};
use crate::value::{AnnotatedValue, Number, Value, ValueKind};

use super::{Binding, Expr, Func};

/// Ambient state an expression may reach for during evaluation.
///
/// The statement clock is fixed per request, so `now_utc()` is stable
/// across operators of one query.
pub trait EvalContext {
    fn now_utc(&self) -> Result<Value>;
    fn random(&self) -> Result<Value>;
    fn named_arg(&self, name: &str) -> Result<Value>;
    fn positional_arg(&self, pos: usize) -> Result<Value>;
    fn evaluate_subquery(&self, select: &Arc<Select>, item: &AnnotatedValue) -> Result<Value>;
}

/// Context used during constant folding. Anything request-dependent
/// errors out, which the folder turns into "not a constant".
pub struct FoldContext;

impl EvalContext for FoldContext {
    fn now_utc(&self) -> Result<Value> {
        Err(Error::evaluation_message("clock is not available at plan time"))
    }

    fn random(&self) -> Result<Value> {
        Err(Error::evaluation_message("random is not available at plan time"))
    }

    fn named_arg(&self, name: &str) -> Result<Value> {
        Err(Error::evaluation_message(format!(
            "named parameter ${} is not available at plan time",
            name
        )))
    }

    fn positional_arg(&self, pos: usize) -> Result<Value> {
        Err(Error::evaluation_message(format!(
            "positional parameter ${} is not available at plan time",
            pos
        )))
    }

    fn evaluate_subquery(&self, _select: &Arc<Select>, _item: &AnnotatedValue) -> Result<Value> {
        Err(Error::evaluation_message("subquery is not available at plan time"))
    }
}

impl Expr {
    pub fn evaluate(&self, item: &AnnotatedValue, ctx: &dyn EvalContext) -> Result<Value> {
        match self {
            Expr::Constant(v) => Ok(v.clone()),
            Expr::Identifier(name) => Ok(item.field(name).0),
            Expr::SelfRef => Ok(item.value().clone()),

            Expr::Field { base, name } => {
                let b = base.evaluate(item, ctx)?;
                let n = name.evaluate(item, ctx)?;
                match (b.kind(), n.kind()) {
                    (ValueKind::Missing, _) | (_, ValueKind::Missing) => Ok(Value::Missing),
                    (ValueKind::Null, _) | (_, ValueKind::Null) => Ok(Value::Null),
                    _ => match n.as_str() {
                        Some(s) => Ok(b.field(s).0),
                        None => Ok(Value::Null),
                    },
                }
            }
            Expr::Element { base, index } => {
                let b = base.evaluate(item, ctx)?;
                let i = index.evaluate(item, ctx)?;
                match (b.kind(), i.kind()) {
                    (ValueKind::Missing, _) | (_, ValueKind::Missing) => Ok(Value::Missing),
                    (ValueKind::Null, _) | (_, ValueKind::Null) => Ok(Value::Null),
                    _ => match i.as_i64() {
                        Some(n) => Ok(b.index(n).0),
                        None => Ok(Value::Null),
                    },
                }
            }
            Expr::Slice { base, start, end } => {
                let b = base.evaluate(item, ctx)?;
                if b.kind() == ValueKind::Missing {
                    return Ok(Value::Missing);
                }
                let arr = match b.as_array() {
                    Some(a) => a,
                    None => return Ok(Value::Null),
                };
                let len = arr.len() as i64;
                let lo = match start {
                    Some(s) => match eval_index(s, item, ctx)? {
                        IndexResult::Missing => return Ok(Value::Missing),
                        IndexResult::Invalid => return Ok(Value::Null),
                        IndexResult::At(n) => n,
                    },
                    None => 0,
                };
                let hi = match end {
                    Some(e) => match eval_index(e, item, ctx)? {
                        IndexResult::Missing => return Ok(Value::Missing),
                        IndexResult::Invalid => return Ok(Value::Null),
                        IndexResult::At(n) => n,
                    },
                    None => len,
                };
                let norm = |i: i64| -> i64 {
                    let i = if i < 0 { len + i } else { i };
                    i.clamp(0, len)
                };
                let (lo, hi) = (norm(lo), norm(hi));
                if lo >= hi {
                    return Ok(Value::empty_array());
                }
                Ok(Value::Array(arr[lo as usize..hi as usize].to_vec()))
            }

            Expr::Neg(x) => {
                let v = x.evaluate(item, ctx)?;
                match v {
                    Value::Missing => Ok(Value::Missing),
                    Value::Null => Ok(Value::Null),
                    Value::Number(n) => Ok(Value::Number(n.neg())),
                    _ => Ok(Value::Null),
                }
            }
            Expr::Add(ops) => fold_numeric(ops, item, ctx, |acc, n| acc.add(&n)),
            Expr::Mult(ops) => fold_numeric(ops, item, ctx, |acc, n| acc.mult(&n)),
            Expr::Sub { left, right } => binary_numeric(left, right, item, ctx, |a, b| Some(a.sub(&b))),
            Expr::Div { left, right } => binary_numeric(left, right, item, ctx, |a, b| a.div(&b)),
            Expr::Mod { left, right } => {
                binary_numeric(left, right, item, ctx, |a, b| a.modulo(&b))
            }

            Expr::Eq { left, right } => {
                let l = left.evaluate(item, ctx)?;
                let r = right.evaluate(item, ctx)?;
                Ok(l.equals(&r))
            }
            Expr::Le { left, right } => comparison(left, right, item, ctx, |o| o.is_le()),
            Expr::Lt { left, right } => comparison(left, right, item, ctx, |o| o.is_lt()),
            Expr::Like { left, right } => {
                let l = left.evaluate(item, ctx)?;
                let r = right.evaluate(item, ctx)?;
                match (l.kind(), r.kind()) {
                    (ValueKind::Missing, _) | (_, ValueKind::Missing) => Ok(Value::Missing),
                    (ValueKind::Null, _) | (_, ValueKind::Null) => Ok(Value::Null),
                    _ => match (l.as_str(), r.as_str()) {
                        (Some(s), Some(p)) => Ok(Value::Bool(like_match(s, p))),
                        _ => Ok(Value::Null),
                    },
                }
            }
            Expr::Between { item: x, low, high } => {
                let v = x.evaluate(item, ctx)?;
                let lo = low.evaluate(item, ctx)?;
                let hi = high.evaluate(item, ctx)?;
                let kinds = [v.kind(), lo.kind(), hi.kind()];
                if kinds.contains(&ValueKind::Missing) {
                    return Ok(Value::Missing);
                }
                if kinds.contains(&ValueKind::Null) {
                    return Ok(Value::Null);
                }
                Ok(Value::Bool(
                    lo.collate(&v).is_le() && v.collate(&hi).is_le(),
                ))
            }
            Expr::In { item: x, list } => {
                let v = x.evaluate(item, ctx)?;
                let l = list.evaluate(item, ctx)?;
                membership(&v, &l, false)
            }
            Expr::Within { item: x, list } => {
                let v = x.evaluate(item, ctx)?;
                let l = list.evaluate(item, ctx)?;
                membership(&v, &l, true)
            }

            Expr::IsMissing(x) => {
                Ok(Value::Bool(x.evaluate(item, ctx)?.kind() == ValueKind::Missing))
            }
            Expr::IsNotMissing(x) => {
                Ok(Value::Bool(x.evaluate(item, ctx)?.kind() != ValueKind::Missing))
            }
            Expr::IsNull(x) => {
                let v = x.evaluate(item, ctx)?;
                match v.kind() {
                    ValueKind::Missing => Ok(Value::Missing),
                    k => Ok(Value::Bool(k == ValueKind::Null)),
                }
            }
            Expr::IsNotNull(x) => {
                let v = x.evaluate(item, ctx)?;
                match v.kind() {
                    ValueKind::Missing => Ok(Value::Missing),
                    k => Ok(Value::Bool(k != ValueKind::Null)),
                }
            }
            Expr::IsValued(x) => {
                let k = x.evaluate(item, ctx)?.kind();
                Ok(Value::Bool(k != ValueKind::Missing && k != ValueKind::Null))
            }
            Expr::IsNotValued(x) => {
                let k = x.evaluate(item, ctx)?.kind();
                Ok(Value::Bool(k == ValueKind::Missing || k == ValueKind::Null))
            }

            Expr::And(ops) => {
                // FALSE > NULL > MISSING > TRUE resolution order.
                let mut missing = false;
                let mut null = false;
                for op in ops {
                    let v = op.evaluate(item, ctx)?;
                    match v.kind() {
                        ValueKind::Missing => missing = true,
                        ValueKind::Null => null = true,
                        _ => {
                            if !v.truth() {
                                return Ok(Value::Bool(false));
                            }
                        }
                    }
                }
                if null {
                    Ok(Value::Null)
                } else if missing {
                    Ok(Value::Missing)
                } else {
                    Ok(Value::Bool(true))
                }
            }
            Expr::Or(ops) => {
                // TRUE > NULL > MISSING > FALSE resolution order.
                let mut missing = false;
                let mut null = false;
                for op in ops {
                    let v = op.evaluate(item, ctx)?;
                    match v.kind() {
                        ValueKind::Missing => missing = true,
                        ValueKind::Null => null = true,
                        _ => {
                            if v.truth() {
                                return Ok(Value::Bool(true));
                            }
                        }
                    }
                }
                if null {
                    Ok(Value::Null)
                } else if missing {
                    Ok(Value::Missing)
                } else {
                    Ok(Value::Bool(false))
                }
            }
            Expr::Not(x) => {
                let v = x.evaluate(item, ctx)?;
                match v.kind() {
                    ValueKind::Missing => Ok(Value::Missing),
                    ValueKind::Null => Ok(Value::Null),
                    _ => Ok(Value::Bool(!v.truth())),
                }
            }
            Expr::Exists(x) => {
                let v = x.evaluate(item, ctx)?;
                match v {
                    Value::Missing => Ok(Value::Missing),
                    Value::Null => Ok(Value::Null),
                    Value::Array(a) => Ok(Value::Bool(!a.is_empty())),
                    _ => Ok(Value::Null),
                }
            }

            Expr::Any { bindings, satisfies } => {
                let mut any = false;
                for_each_binding(bindings, item, ctx, &mut |scoped| {
                    if satisfies.evaluate(scoped, ctx)?.truth() {
                        any = true;
                        return Ok(false);
                    }
                    Ok(true)
                })?;
                Ok(Value::Bool(any))
            }
            Expr::Every { bindings, satisfies } => {
                let mut every = true;
                for_each_binding(bindings, item, ctx, &mut |scoped| {
                    if !satisfies.evaluate(scoped, ctx)?.truth() {
                        every = false;
                        return Ok(false);
                    }
                    Ok(true)
                })?;
                Ok(Value::Bool(every))
            }
            Expr::AnyEvery { bindings, satisfies } => {
                let mut any = false;
                let mut every = true;
                for_each_binding(bindings, item, ctx, &mut |scoped| {
                    if satisfies.evaluate(scoped, ctx)?.truth() {
                        any = true;
                        Ok(true)
                    } else {
                        every = false;
                        Ok(false)
                    }
                })?;
                Ok(Value::Bool(any && every))
            }
            Expr::ArrayComp { mapping, bindings, when } => {
                let mut out = Vec::new();
                for_each_binding(bindings, item, ctx, &mut |scoped| {
                    if let Some(w) = when {
                        if !w.evaluate(scoped, ctx)?.truth() {
                            return Ok(true);
                        }
                    }
                    let v = mapping.evaluate(scoped, ctx)?;
                    if v.kind() != ValueKind::Missing {
                        out.push(v);
                    }
                    Ok(true)
                })?;
                Ok(Value::Array(out))
            }
            Expr::First { mapping, bindings, when } => {
                let mut first = Value::Missing;
                for_each_binding(bindings, item, ctx, &mut |scoped| {
                    if let Some(w) = when {
                        if !w.evaluate(scoped, ctx)?.truth() {
                            return Ok(true);
                        }
                    }
                    first = mapping.evaluate(scoped, ctx)?;
                    Ok(false)
                })?;
                Ok(first)
            }
            Expr::ObjectComp {
                name,
                mapping,
                bindings,
                when,
            } => {
                let mut out = Value::empty_object();
                for_each_binding(bindings, item, ctx, &mut |scoped| {
                    if let Some(w) = when {
                        if !w.evaluate(scoped, ctx)?.truth() {
                            return Ok(true);
                        }
                    }
                    let n = name.evaluate(scoped, ctx)?;
                    if let Some(key) = n.as_str() {
                        let key = key.to_string();
                        let v = mapping.evaluate(scoped, ctx)?;
                        out.set_field(&key, v);
                    }
                    Ok(true)
                })?;
                Ok(out)
            }

            Expr::ArrayConstruct(ops) => {
                let mut out = Vec::with_capacity(ops.len());
                for op in ops {
                    let v = op.evaluate(item, ctx)?;
                    if v.kind() != ValueKind::Missing {
                        out.push(v);
                    }
                }
                Ok(Value::Array(out))
            }
            Expr::ObjectConstruct(pairs) => {
                let mut out = Value::empty_object();
                for (k, e) in pairs {
                    let v = e.evaluate(item, ctx)?;
                    out.set_field(k, v);
                }
                Ok(out)
            }

            Expr::SimpleCase {
                search,
                whens,
                otherwise,
            } => {
                let s = search.evaluate(item, ctx)?;
                for (w, t) in whens {
                    let wv = w.evaluate(item, ctx)?;
                    if s.equals(&wv).truth() {
                        return t.evaluate(item, ctx);
                    }
                }
                match otherwise {
                    Some(e) => e.evaluate(item, ctx),
                    None => Ok(Value::Null),
                }
            }
            Expr::SearchedCase { whens, otherwise } => {
                for (w, t) in whens {
                    if w.evaluate(item, ctx)?.truth() {
                        return t.evaluate(item, ctx);
                    }
                }
                match otherwise {
                    Some(e) => e.evaluate(item, ctx),
                    None => Ok(Value::Null),
                }
            }

            Expr::Concat(ops) => {
                let mut out = String::new();
                let mut null = false;
                for op in ops {
                    let v = op.evaluate(item, ctx)?;
                    match v {
                        Value::Missing => return Ok(Value::Missing),
                        Value::Null => null = true,
                        Value::String(s) => out.push_str(&s),
                        _ => null = true,
                    }
                }
                if null {
                    Ok(Value::Null)
                } else {
                    Ok(Value::String(out))
                }
            }

            Expr::NamedParameter(name) => ctx.named_arg(name),
            Expr::PositionalParameter(pos) => ctx.positional_arg(*pos),
            Expr::Subquery(select) => ctx.evaluate_subquery(select, item),

            Expr::Cover { covered, text } => match item.cover(text) {
                Some(v) => Ok(v.clone()),
                None => covered.evaluate(item, ctx),
            },

            Expr::Function { func, operands } => eval_function(*func, operands, item, ctx),

            Expr::Aggregate(_) => {
                let text = self.to_string();
                match item.attachment("aggregates").and_then(|a| a.field_ref(&text)) {
                    Some(v) => Ok(v.clone()),
                    None => Err(Error::evaluation_message(format!(
                        "aggregate {} has not been computed",
                        text
                    ))),
                }
            }
        }
    }
}

enum IndexResult {
    Missing,
    Invalid,
    At(i64),
}

fn eval_index(
    e: &Expr,
    item: &AnnotatedValue,
    ctx: &dyn EvalContext,
) -> Result<IndexResult> {
    let v = e.evaluate(item, ctx)?;
    match v.kind() {
        ValueKind::Missing => Ok(IndexResult::Missing),
        _ => match v.as_i64() {
            Some(n) => Ok(IndexResult::At(n)),
            None => Ok(IndexResult::Invalid),
        },
    }
}

fn fold_numeric(
    ops: &[Expr],
    item: &AnnotatedValue,
    ctx: &dyn EvalContext,
    f: impl Fn(Number, Number) -> Number,
) -> Result<Value> {
    let mut acc: Option<Number> = None;
    let mut null = false;
    for op in ops {
        let v = op.evaluate(item, ctx)?;
        match v {
            Value::Missing => return Ok(Value::Missing),
            Value::Null => null = true,
            Value::Number(n) => {
                acc = Some(match acc {
                    None => n,
                    Some(a) => f(a, n),
                });
            }
            _ => null = true,
        }
    }
    if null {
        return Ok(Value::Null);
    }
    match acc {
        Some(n) => Ok(Value::Number(n)),
        None => Ok(Value::Null),
    }
}

fn binary_numeric(
    left: &Expr,
    right: &Expr,
    item: &AnnotatedValue,
    ctx: &dyn EvalContext,
    f: impl Fn(Number, Number) -> Option<Number>,
) -> Result<Value> {
    let l = left.evaluate(item, ctx)?;
    let r = right.evaluate(item, ctx)?;
    match (l.kind(), r.kind()) {
        (ValueKind::Missing, _) | (_, ValueKind::Missing) => Ok(Value::Missing),
        (ValueKind::Null, _) | (_, ValueKind::Null) => Ok(Value::Null),
        _ => match (l.as_number(), r.as_number()) {
            (Some(a), Some(b)) => match f(a, b) {
                Some(n) => Ok(Value::Number(n)),
                None => Ok(Value::Null),
            },
            _ => Ok(Value::Null),
        },
    }
}

fn comparison(
    left: &Expr,
    right: &Expr,
    item: &AnnotatedValue,
    ctx: &dyn EvalContext,
    f: impl Fn(std::cmp::Ordering) -> bool,
) -> Result<Value> {
    let l = left.evaluate(item, ctx)?;
    let r = right.evaluate(item, ctx)?;
    match (l.kind(), r.kind()) {
        (ValueKind::Missing, _) | (_, ValueKind::Missing) => Ok(Value::Missing),
        (ValueKind::Null, _) | (_, ValueKind::Null) => Ok(Value::Null),
        _ => Ok(Value::Bool(f(l.collate(&r)))),
    }
}

/// IN / WITHIN membership with OR-style resolution over the candidates.
fn membership(item: &Value, list: &Value, descend: bool) -> Result<Value> {
    if item.kind() == ValueKind::Missing || list.kind() == ValueKind::Missing {
        return Ok(Value::Missing);
    }
    if list.kind() == ValueKind::Null {
        return Ok(Value::Null);
    }
    let arr = match list.as_array() {
        Some(a) => a.to_vec(),
        None => return Ok(Value::Null),
    };
    let candidates = if descend { descendants(&arr) } else { arr };

    let mut missing = false;
    let mut null = false;
    for cand in &candidates {
        match item.equals(cand) {
            Value::Bool(true) => return Ok(Value::Bool(true)),
            Value::Null => null = true,
            Value::Missing => missing = true,
            _ => {}
        }
    }
    if null {
        Ok(Value::Null)
    } else if missing {
        Ok(Value::Missing)
    } else {
        Ok(Value::Bool(false))
    }
}

fn descendants(values: &[Value]) -> Vec<Value> {
    let mut out = Vec::new();
    fn walk(v: &Value, out: &mut Vec<Value>) {
        out.push(v.clone());
        match v {
            Value::Array(a) => {
                for e in a {
                    walk(e, out);
                }
            }
            Value::Object(o) => {
                for e in o.values() {
                    walk(e, out);
                }
            }
            _ => {}
        }
    }
    for v in values {
        walk(v, &mut out);
    }
    out
}

/// Runs `f` once per combination of binding values, nesting bindings left
/// to right. `f` returns false to stop early.
fn for_each_binding(
    bindings: &[Binding],
    item: &AnnotatedValue,
    ctx: &dyn EvalContext,
    f: &mut impl FnMut(&AnnotatedValue) -> Result<bool>,
) -> Result<bool> {
    fn recurse(
        bindings: &[Binding],
        item: &AnnotatedValue,
        ctx: &dyn EvalContext,
        f: &mut impl FnMut(&AnnotatedValue) -> Result<bool>,
    ) -> Result<bool> {
        let Some((first, rest)) = bindings.split_first() else {
            return f(item);
        };
        let source = first.source.evaluate(item, ctx)?;
        let candidates = match source.as_array() {
            Some(a) => {
                if first.descend {
                    descendants(a)
                } else {
                    a.to_vec()
                }
            }
            None => return Ok(true),
        };
        for cand in candidates {
            let mut scoped = AnnotatedValue::scope(Arc::new(item.clone()));
            scoped.set_field(&first.variable, cand);
            if !recurse(rest, &scoped, ctx, f)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
    recurse(bindings, item, ctx, f)
}

/// Glob-style LIKE: `%` matches any run, `_` matches one character.
fn like_match(s: &str, pattern: &str) -> bool {
    fn inner(s: &[char], p: &[char]) -> bool {
        match p.split_first() {
            None => s.is_empty(),
            Some((&'%', rest)) => (0..=s.len()).any(|i| inner(&s[i..], rest)),
            Some((&'_', rest)) => !s.is_empty() && inner(&s[1..], rest),
            Some((c, rest)) => s.first() == Some(c) && inner(&s[1..], rest),
        }
    }
    let s: Vec<char> = s.chars().collect();
    let p: Vec<char> = pattern.chars().collect();
    inner(&s, &p)
}

fn eval_function(
    func: Func,
    operands: &[Expr],
    item: &AnnotatedValue,
    ctx: &dyn EvalContext,
) -> Result<Value> {
    match func {
        Func::NowUtc => ctx.now_utc(),
        Func::Random => ctx.random(),
        Func::Meta => {
            // meta() and meta(alias) both read the item's meta attachment.
            match item.attachment("meta") {
                Some(v) => Ok(v.clone()),
                None => Ok(Value::Missing),
            }
        }
        Func::Lower | Func::Upper => {
            let v = operand(operands, 0, item, ctx)?;
            match v {
                Value::Missing => Ok(Value::Missing),
                Value::Null => Ok(Value::Null),
                Value::String(s) => Ok(Value::String(if func == Func::Lower {
                    s.to_lowercase()
                } else {
                    s.to_uppercase()
                })),
                _ => Ok(Value::Null),
            }
        }
        Func::Length => {
            let v = operand(operands, 0, item, ctx)?;
            match v {
                Value::Missing => Ok(Value::Missing),
                Value::Null => Ok(Value::Null),
                Value::String(s) => Ok(Value::int(s.chars().count() as i64)),
                _ => Ok(Value::Null),
            }
        }
        Func::Abs => {
            let v = operand(operands, 0, item, ctx)?;
            match v {
                Value::Missing => Ok(Value::Missing),
                Value::Null => Ok(Value::Null),
                Value::Number(Number::Int(i)) => Ok(Value::int(i.abs())),
                Value::Number(Number::Float(f)) => Ok(Value::float(f.abs())),
                _ => Ok(Value::Null),
            }
        }
    }
}

fn operand(
    operands: &[Expr],
    i: usize,
    item: &AnnotatedValue,
    ctx: &dyn EvalContext,
) -> Result<Value> {
    match operands.get(i) {
        Some(e) => e.evaluate(item, ctx),
        None => Ok(Value::Missing),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::AnnotatedValue;
    use serde_json::json;

    fn item(j: serde_json::Value) -> AnnotatedValue {
        AnnotatedValue::new(Value::from(j))
    }

    fn eval(e: &Expr, item: &AnnotatedValue) -> Value {
        e.evaluate(item, &FoldContext).unwrap()
    }

    #[test]
    fn test_missing_propagates_through_arithmetic() {
        let it = item(json!({"x": 1}));
        let e = Expr::Add(vec![Expr::ident("absent"), Expr::constant(1)]);
        assert_eq!(eval(&e, &it), Value::Missing);
    }

    #[test]
    fn test_null_propagates_when_no_missing() {
        let it = item(json!({"x": null}));
        let e = Expr::Add(vec![Expr::ident("x"), Expr::constant(1)]);
        assert_eq!(eval(&e, &it), Value::Null);
    }

    #[test]
    fn test_or_priority_true_null_missing_false() {
        let it = item(json!({}));
        let t = Expr::constant(true);
        let f = Expr::constant(false);
        let n = Expr::Constant(Value::Null);
        let m = Expr::Constant(Value::Missing);

        assert_eq!(eval(&Expr::Or(vec![f.clone(), t.clone()]), &it), Value::Bool(true));
        assert_eq!(eval(&Expr::Or(vec![n.clone(), t.clone()]), &it), Value::Bool(true));
        assert_eq!(eval(&Expr::Or(vec![f.clone(), n.clone()]), &it), Value::Null);
        assert_eq!(
            eval(&Expr::Or(vec![m.clone(), n.clone()]), &it),
            Value::Null
        );
        assert_eq!(eval(&Expr::Or(vec![f.clone(), m.clone()]), &it), Value::Missing);
        assert_eq!(eval(&Expr::Or(vec![f.clone(), f.clone()]), &it), Value::Bool(false));
    }

    #[test]
    fn test_and_priority_false_null_missing_true() {
        let it = item(json!({}));
        let t = Expr::constant(true);
        let f = Expr::constant(false);
        let n = Expr::Constant(Value::Null);
        let m = Expr::Constant(Value::Missing);

        assert_eq!(eval(&Expr::And(vec![t.clone(), f.clone()]), &it), Value::Bool(false));
        assert_eq!(eval(&Expr::And(vec![n.clone(), f.clone()]), &it), Value::Bool(false));
        assert_eq!(eval(&Expr::And(vec![t.clone(), n.clone()]), &it), Value::Null);
        assert_eq!(
            eval(&Expr::And(vec![m.clone(), n.clone()]), &it),
            Value::Null
        );
        assert_eq!(eval(&Expr::And(vec![t.clone(), m.clone()]), &it), Value::Missing);
        assert_eq!(eval(&Expr::And(vec![t.clone(), t.clone()]), &it), Value::Bool(true));
    }

    #[test]
    fn test_equality_three_valued() {
        let it = item(json!({"x": 1, "n": null}));
        assert_eq!(
            eval(&Expr::eq(Expr::ident("x"), Expr::constant(1)), &it),
            Value::Bool(true)
        );
        assert_eq!(
            eval(&Expr::eq(Expr::ident("absent"), Expr::constant(1)), &it),
            Value::Missing
        );
        assert_eq!(
            eval(&Expr::eq(Expr::ident("n"), Expr::constant(1)), &it),
            Value::Null
        );
    }

    #[test]
    fn test_field_chain_on_missing_base() {
        let it = item(json!({"a": {"b": 2}}));
        let ok = Expr::field(Expr::field(Expr::ident("a"), "b"), "c");
        // a.b = 2, (2).c on a non-object yields missing
        assert_eq!(eval(&ok, &it), Value::Missing);
        let deep = Expr::field(Expr::ident("zz"), "b");
        assert_eq!(eval(&deep, &it), Value::Missing);
    }

    #[test]
    fn test_like_matching() {
        let it = item(json!({"s": "hello"}));
        let like = |p: &str| {
            Expr::Like {
                left: Box::new(Expr::ident("s")),
                right: Box::new(Expr::constant(p)),
            }
        };
        assert_eq!(eval(&like("hello"), &it), Value::Bool(true));
        assert_eq!(eval(&like("h%"), &it), Value::Bool(true));
        assert_eq!(eval(&like("h_llo"), &it), Value::Bool(true));
        assert_eq!(eval(&like("x%"), &it), Value::Bool(false));
    }

    #[test]
    fn test_in_with_null_candidate() {
        let it = item(json!({}));
        let e = Expr::In {
            item: Box::new(Expr::constant(3)),
            list: Box::new(Expr::Constant(Value::from(json!([1, 2, null])))),
        };
        assert_eq!(eval(&e, &it), Value::Null);
        let hit = Expr::In {
            item: Box::new(Expr::constant(2)),
            list: Box::new(Expr::Constant(Value::from(json!([1, 2, null])))),
        };
        assert_eq!(eval(&hit, &it), Value::Bool(true));
    }

    #[test]
    fn test_any_every_quantifiers() {
        let it = item(json!({"xs": [1, 2, 3]}));
        let bind = || vec![Binding::new("v", Expr::ident("xs"))];
        let gt2 = Expr::gt(Expr::ident("v"), Expr::constant(2));
        let any = Expr::Any {
            bindings: bind(),
            satisfies: Box::new(gt2.clone()),
        };
        let every = Expr::Every {
            bindings: bind(),
            satisfies: Box::new(gt2),
        };
        assert_eq!(eval(&any, &it), Value::Bool(true));
        assert_eq!(eval(&every, &it), Value::Bool(false));
    }

    #[test]
    fn test_case_is_conditional() {
        let it = item(json!({"x": 5}));
        let e = Expr::SearchedCase {
            whens: vec![(
                Expr::gt(Expr::ident("x"), Expr::constant(3)),
                Expr::constant("big"),
            )],
            otherwise: Some(Box::new(Expr::constant("small"))),
        };
        assert_eq!(eval(&e, &it), Value::string("big"));
    }

    #[test]
    fn test_cover_reads_cover_map() {
        let mut av = AnnotatedValue::new(Value::empty_object());
        let covered = Expr::path("k", "x");
        av.set_cover(&covered.to_string(), Value::int(42));
        let e = Expr::cover(covered);
        assert_eq!(eval(&e, &av), Value::int(42));
    }

    #[test]
    fn test_is_family_truth_table() {
        let it = item(json!({"n": null, "x": 1}));
        let missing = Expr::ident("gone");
        let null = Expr::ident("n");
        let valued = Expr::ident("x");

        assert_eq!(eval(&Expr::IsMissing(Box::new(missing.clone())), &it), Value::Bool(true));
        assert_eq!(eval(&Expr::IsNull(Box::new(missing.clone())), &it), Value::Missing);
        assert_eq!(eval(&Expr::IsNull(Box::new(null.clone())), &it), Value::Bool(true));
        assert_eq!(eval(&Expr::IsValued(Box::new(null)), &it), Value::Bool(false));
        assert_eq!(eval(&Expr::IsValued(Box::new(valued)), &it), Value::Bool(true));
    }
}
