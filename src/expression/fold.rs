//! Constant folding and the static analyses it rests on.

use crate::value::{AnnotatedValue, Value, ValueKind};

use super::{Expr, FoldContext, Func};

impl Expr {
    /// True for nodes whose result can change between evaluations of the
    /// same input (clocks, randomness), checked over the whole subtree.
    pub fn is_volatile(&self) -> bool {
        if let Expr::Function { func, .. } = self {
            if func.volatile() {
                return true;
            }
        }
        self.children().iter().any(|c| c.is_volatile())
    }

    /// Conditional nodes evaluate only some of their children, so
    /// missing/null propagation cannot be composed through them.
    pub fn is_conditional(&self) -> bool {
        matches!(self, Expr::SimpleCase { .. } | Expr::SearchedCase { .. })
    }

    /// True when the node itself needs per-item or per-request state and
    /// can therefore never fold, regardless of its children.
    fn is_data_dependent(&self) -> bool {
        matches!(
            self,
            Expr::Identifier(_)
                | Expr::SelfRef
                | Expr::NamedParameter(_)
                | Expr::PositionalParameter(_)
                | Expr::Subquery(_)
                | Expr::Cover { .. }
                | Expr::Aggregate(_)
        ) || matches!(
            self,
            Expr::Function {
                func: Func::Meta,
                ..
            }
        )
    }

    /// MISSING operands force a MISSING result.
    pub fn propagates_missing(&self) -> bool {
        if self.is_conditional() {
            return false;
        }
        match self {
            Expr::And(_)
            | Expr::Or(_)
            | Expr::IsMissing(_)
            | Expr::IsNotMissing(_)
            | Expr::IsValued(_)
            | Expr::IsNotValued(_)
            | Expr::Any { .. }
            | Expr::Every { .. }
            | Expr::AnyEvery { .. }
            | Expr::ArrayComp { .. }
            | Expr::First { .. }
            | Expr::ObjectComp { .. }
            | Expr::ArrayConstruct(_)
            | Expr::ObjectConstruct(_) => false,
            _ => self.children().iter().all(|c| c.propagates_missing()),
        }
    }

    /// NULL operands force a NULL result when nothing is MISSING.
    pub fn propagates_null(&self) -> bool {
        if self.is_conditional() {
            return false;
        }
        match self {
            Expr::And(_)
            | Expr::Or(_)
            | Expr::IsMissing(_)
            | Expr::IsNotMissing(_)
            | Expr::IsNull(_)
            | Expr::IsNotNull(_)
            | Expr::IsValued(_)
            | Expr::IsNotValued(_)
            | Expr::Any { .. }
            | Expr::Every { .. }
            | Expr::AnyEvery { .. }
            | Expr::ArrayComp { .. }
            | Expr::First { .. }
            | Expr::ObjectComp { .. }
            | Expr::ArrayConstruct(_)
            | Expr::ObjectConstruct(_) => false,
            _ => self.children().iter().all(|c| c.propagates_null()),
        }
    }

    /// The static value of the subtree, or None when it depends on data,
    /// request state, or a volatile source. Evaluation failures fold to
    /// None rather than surfacing an error.
    pub fn constant_value(&self) -> Option<Value> {
        if let Expr::Constant(v) = self {
            return Some(v.clone());
        }
        if self.is_data_dependent() || self.is_volatile() {
            return None;
        }

        let prop_missing = self.propagates_missing();
        let prop_null = self.propagates_null();

        // `pending` remembers a forced NULL (which wins) or a non-constant
        // child (which blocks folding).
        let mut pending: Option<Option<Value>> = None;
        for child in self.children() {
            match child.constant_value() {
                None => {
                    if pending.is_none() {
                        pending = Some(None);
                    }
                }
                Some(v) => match v.kind() {
                    ValueKind::Missing if prop_missing => return Some(Value::Missing),
                    ValueKind::Null if prop_null => pending = Some(Some(Value::Null)),
                    _ => {}
                },
            }
        }
        match pending {
            Some(Some(v)) => return Some(v),
            Some(None) => return None,
            None => {}
        }

        let item = AnnotatedValue::missing();
        self.evaluate(&item, &FoldContext).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_arithmetic_folds() {
        let e = Expr::Add(vec![Expr::constant(2), Expr::constant(3)]);
        assert_eq!(e.constant_value(), Some(Value::int(5)));
    }

    #[test]
    fn test_identifier_blocks_folding() {
        let e = Expr::Add(vec![Expr::constant(2), Expr::ident("x")]);
        assert_eq!(e.constant_value(), None);
    }

    #[test]
    fn test_missing_constant_short_circuits() {
        let e = Expr::Add(vec![Expr::ident("x"), Expr::Constant(Value::Missing)]);
        // MISSING propagates even though another child is non-constant
        assert_eq!(e.constant_value(), Some(Value::Missing));
    }

    #[test]
    fn test_null_wins_over_non_constant() {
        let e = Expr::Add(vec![Expr::ident("x"), Expr::Constant(Value::Null)]);
        assert_eq!(e.constant_value(), Some(Value::Null));
    }

    #[test]
    fn test_volatile_never_folds() {
        let e = Expr::Function {
            func: Func::Random,
            operands: vec![],
        };
        assert_eq!(e.constant_value(), None);
        let wrapped = Expr::Add(vec![e, Expr::constant(1)]);
        assert_eq!(wrapped.constant_value(), None);
    }

    #[test]
    fn test_or_does_not_propagate_missing() {
        let e = Expr::Or(vec![
            Expr::Constant(Value::Missing),
            Expr::constant(true),
        ]);
        assert!(!e.propagates_missing());
        assert_eq!(e.constant_value(), Some(Value::Bool(true)));
    }

    #[test]
    fn test_division_failure_folds_to_null_not_error() {
        let e = Expr::Div {
            left: Box::new(Expr::constant(1)),
            right: Box::new(Expr::constant(0)),
        };
        // division by zero evaluates to NULL, so the fold succeeds
        assert_eq!(e.constant_value(), Some(Value::Null));
    }

    #[test]
    fn test_folding_failure_is_none_not_error() {
        let e = Expr::NamedParameter("p".into());
        assert_eq!(e.constant_value(), None);
    }

    #[test]
    fn test_case_is_conditional_and_blocks_propagation() {
        let e = Expr::SearchedCase {
            whens: vec![(Expr::ident("x"), Expr::constant(1))],
            otherwise: None,
        };
        assert!(e.is_conditional());
        assert!(!e.propagates_missing());
        assert!(!e.propagates_null());
    }
}
