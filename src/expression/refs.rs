//! Free keyspace-reference collection.
//!
//! Used by the classifier to attribute a predicate to the FROM-clause
//! aliases it mentions. Binding variables shadow aliases of the same name
//! inside collection predicates and comprehensions.

use std::collections::HashSet;

use super::Expr;

impl Expr {
    /// The subset of `names` referenced by free identifiers in this
    /// subtree.
    pub fn keyspace_references(&self, names: &HashSet<String>) -> HashSet<String> {
        let mut out = HashSet::new();
        let mut shadowed = Vec::new();
        self.collect_refs(names, &mut shadowed, &mut out);
        out
    }

    fn collect_refs(
        &self,
        names: &HashSet<String>,
        shadowed: &mut Vec<String>,
        out: &mut HashSet<String>,
    ) {
        match self {
            Expr::Identifier(name) => {
                if names.contains(name) && !shadowed.iter().any(|s| s == name) {
                    out.insert(name.clone());
                }
            }
            Expr::Any { bindings, satisfies }
            | Expr::Every { bindings, satisfies }
            | Expr::AnyEvery { bindings, satisfies } => {
                for b in bindings {
                    b.source.collect_refs(names, shadowed, out);
                }
                let depth = shadowed.len();
                shadowed.extend(bindings.iter().map(|b| b.variable.clone()));
                satisfies.collect_refs(names, shadowed, out);
                shadowed.truncate(depth);
            }
            Expr::ArrayComp { mapping, bindings, when }
            | Expr::First { mapping, bindings, when } => {
                for b in bindings {
                    b.source.collect_refs(names, shadowed, out);
                }
                let depth = shadowed.len();
                shadowed.extend(bindings.iter().map(|b| b.variable.clone()));
                if let Some(w) = when {
                    w.collect_refs(names, shadowed, out);
                }
                mapping.collect_refs(names, shadowed, out);
                shadowed.truncate(depth);
            }
            Expr::ObjectComp {
                name,
                mapping,
                bindings,
                when,
            } => {
                for b in bindings {
                    b.source.collect_refs(names, shadowed, out);
                }
                let depth = shadowed.len();
                shadowed.extend(bindings.iter().map(|b| b.variable.clone()));
                if let Some(w) = when {
                    w.collect_refs(names, shadowed, out);
                }
                name.collect_refs(names, shadowed, out);
                mapping.collect_refs(names, shadowed, out);
                shadowed.truncate(depth);
            }
            // Subquery internals are opaque here; correlated references
            // are accounted for when the subquery itself is planned.
            Expr::Subquery(_) => {}
            _ => {
                for child in self.children() {
                    child.collect_refs(names, shadowed, out);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::Binding;
    use super::*;

    fn names(list: &[&str]) -> HashSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_single_keyspace_reference() {
        let pred = Expr::eq(Expr::path("k", "x"), Expr::constant(1));
        let refs = pred.keyspace_references(&names(&["k", "r"]));
        assert_eq!(refs, names(&["k"]));
    }

    #[test]
    fn test_join_predicate_references_both() {
        let pred = Expr::eq(Expr::path("l", "id"), Expr::path("r", "lid"));
        let refs = pred.keyspace_references(&names(&["l", "r"]));
        assert_eq!(refs, names(&["l", "r"]));
    }

    #[test]
    fn test_binding_variable_shadows_alias() {
        // ANY k IN r.xs SATISFIES k = 1 END: `k` is the binding variable,
        // not the keyspace
        let pred = Expr::Any {
            bindings: vec![Binding::new("k", Expr::path("r", "xs"))],
            satisfies: Box::new(Expr::eq(Expr::ident("k"), Expr::constant(1))),
        };
        let refs = pred.keyspace_references(&names(&["k", "r"]));
        assert_eq!(refs, names(&["r"]));
    }

    #[test]
    fn test_constant_references_nothing() {
        let refs = Expr::constant(1).keyspace_references(&names(&["k"]));
        assert!(refs.is_empty());
    }
}
