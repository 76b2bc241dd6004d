//! Stable text rendering.
//!
//! The rendered form doubles as the cover-map key, so it must be
//! deterministic: same expression tree, same text.

use std::fmt;

use super::{Aggregate, Binding, Expr};

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Constant(v) => write!(f, "{}", v.canonical_string()),
            Expr::Identifier(name) => write!(f, "`{}`", name),
            Expr::SelfRef => write!(f, "self"),
            Expr::Field { base, name } => {
                if let Expr::Constant(v) = name.as_ref() {
                    if let Some(s) = v.as_str() {
                        return write!(f, "({}.`{}`)", base, s);
                    }
                }
                write!(f, "({}.[{}])", base, name)
            }
            Expr::Element { base, index } => write!(f, "({}[{}])", base, index),
            Expr::Slice { base, start, end } => {
                write!(f, "({}[", base)?;
                if let Some(s) = start {
                    write!(f, "{}", s)?;
                }
                write!(f, ":")?;
                if let Some(e) = end {
                    write!(f, "{}", e)?;
                }
                write!(f, "])")
            }
            Expr::Neg(x) => write!(f, "(-{})", x),
            Expr::Add(ops) => joined(f, ops, " + "),
            Expr::Sub { left, right } => write!(f, "({} - {})", left, right),
            Expr::Mult(ops) => joined(f, ops, " * "),
            Expr::Div { left, right } => write!(f, "({} / {})", left, right),
            Expr::Mod { left, right } => write!(f, "({} % {})", left, right),
            Expr::Eq { left, right } => write!(f, "({} = {})", left, right),
            Expr::Le { left, right } => write!(f, "({} <= {})", left, right),
            Expr::Lt { left, right } => write!(f, "({} < {})", left, right),
            Expr::Like { left, right } => write!(f, "({} like {})", left, right),
            Expr::Between { item, low, high } => {
                write!(f, "({} between {} and {})", item, low, high)
            }
            Expr::In { item, list } => write!(f, "({} in {})", item, list),
            Expr::Within { item, list } => write!(f, "({} within {})", item, list),
            Expr::IsMissing(x) => write!(f, "({} is missing)", x),
            Expr::IsNotMissing(x) => write!(f, "({} is not missing)", x),
            Expr::IsNull(x) => write!(f, "({} is null)", x),
            Expr::IsNotNull(x) => write!(f, "({} is not null)", x),
            Expr::IsValued(x) => write!(f, "({} is valued)", x),
            Expr::IsNotValued(x) => write!(f, "({} is not valued)", x),
            Expr::And(ops) => joined(f, ops, " and "),
            Expr::Or(ops) => joined(f, ops, " or "),
            Expr::Not(x) => write!(f, "(not {})", x),
            Expr::Exists(x) => write!(f, "(exists {})", x),
            Expr::Any { bindings, satisfies } => {
                quantifier(f, "any", bindings, None, Some(satisfies))
            }
            Expr::Every { bindings, satisfies } => {
                quantifier(f, "every", bindings, None, Some(satisfies))
            }
            Expr::AnyEvery { bindings, satisfies } => {
                quantifier(f, "any and every", bindings, None, Some(satisfies))
            }
            Expr::ArrayComp { mapping, bindings, when } => {
                write!(f, "(array {} for ", mapping)?;
                write_bindings(f, bindings)?;
                if let Some(w) = when {
                    write!(f, " when {}", w)?;
                }
                write!(f, " end)")
            }
            Expr::First { mapping, bindings, when } => {
                write!(f, "(first {} for ", mapping)?;
                write_bindings(f, bindings)?;
                if let Some(w) = when {
                    write!(f, " when {}", w)?;
                }
                write!(f, " end)")
            }
            Expr::ObjectComp {
                name,
                mapping,
                bindings,
                when,
            } => {
                write!(f, "(object {}:{} for ", name, mapping)?;
                write_bindings(f, bindings)?;
                if let Some(w) = when {
                    write!(f, " when {}", w)?;
                }
                write!(f, " end)")
            }
            Expr::ArrayConstruct(ops) => {
                write!(f, "[")?;
                for (i, op) in ops.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", op)?;
                }
                write!(f, "]")
            }
            Expr::ObjectConstruct(pairs) => {
                write!(f, "{{")?;
                for (i, (k, v)) in pairs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "\"{}\": {}", k, v)?;
                }
                write!(f, "}}")
            }
            Expr::SimpleCase {
                search,
                whens,
                otherwise,
            } => {
                write!(f, "(case {}", search)?;
                for (w, t) in whens {
                    write!(f, " when {} then {}", w, t)?;
                }
                if let Some(e) = otherwise {
                    write!(f, " else {}", e)?;
                }
                write!(f, " end)")
            }
            Expr::SearchedCase { whens, otherwise } => {
                write!(f, "(case")?;
                for (w, t) in whens {
                    write!(f, " when {} then {}", w, t)?;
                }
                if let Some(e) = otherwise {
                    write!(f, " else {}", e)?;
                }
                write!(f, " end)")
            }
            Expr::Concat(ops) => joined(f, ops, " || "),
            Expr::NamedParameter(name) => write!(f, "${}", name),
            Expr::PositionalParameter(pos) => write!(f, "${}", pos),
            Expr::Subquery(_) => write!(f, "(subquery)"),
            Expr::Cover { text, .. } => write!(f, "cover ({})", text),
            Expr::Function { func, operands } => {
                write!(f, "{}(", func.name())?;
                for (i, op) in operands.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", op)?;
                }
                write!(f, ")")
            }
            Expr::Aggregate(agg) => write!(f, "{}", agg.text()),
        }
    }
}

impl Aggregate {
    /// Rendered form, also the key under the group operator's
    /// `aggregates` attachment.
    pub fn text(&self) -> String {
        match &self.operand {
            None => format!("{}(*)", self.kind.name()),
            Some(op) => {
                if self.distinct {
                    format!("{}(distinct {})", self.kind.name(), op)
                } else {
                    format!("{}({})", self.kind.name(), op)
                }
            }
        }
    }
}

fn joined(f: &mut fmt::Formatter<'_>, ops: &[Expr], sep: &str) -> fmt::Result {
    write!(f, "(")?;
    for (i, op) in ops.iter().enumerate() {
        if i > 0 {
            f.write_str(sep)?;
        }
        write!(f, "{}", op)?;
    }
    write!(f, ")")
}

fn write_bindings(f: &mut fmt::Formatter<'_>, bindings: &[Binding]) -> fmt::Result {
    for (i, b) in bindings.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(
            f,
            "`{}` {} {}",
            b.variable,
            if b.descend { "within" } else { "in" },
            b.source
        )?;
    }
    Ok(())
}

fn quantifier(
    f: &mut fmt::Formatter<'_>,
    keyword: &str,
    bindings: &[Binding],
    when: Option<&Expr>,
    satisfies: Option<&Expr>,
) -> fmt::Result {
    write!(f, "({} ", keyword)?;
    write_bindings(f, bindings)?;
    if let Some(w) = when {
        write!(f, " when {}", w)?;
    }
    if let Some(s) = satisfies {
        write!(f, " satisfies {}", s)?;
    }
    write!(f, " end)")
}

#[cfg(test)]
mod tests {
    use super::super::{AggKind, Aggregate, Expr};

    #[test]
    fn test_text_is_deterministic() {
        let e = Expr::eq(Expr::path("k", "x"), Expr::constant(1));
        assert_eq!(e.to_string(), e.clone().to_string());
        assert_eq!(e.to_string(), "((`k`.`x`) = 1)");
    }

    #[test]
    fn test_aggregate_text() {
        assert_eq!(Aggregate::count_star().text(), "count(*)");
        let sum = Aggregate::new(AggKind::Sum, Expr::path("k", "x"));
        assert_eq!(sum.text(), "sum((`k`.`x`))");
    }

    #[test]
    fn test_logic_rendering() {
        let e = Expr::And(vec![
            Expr::eq(Expr::path("k", "x"), Expr::constant(1)),
            Expr::Not(Box::new(Expr::path("k", "y"))),
        ]);
        assert_eq!(
            e.to_string(),
            "(((`k`.`x`) = 1) and (not (`k`.`y`)))"
        );
    }
}
