//! Statement AST.
//!
//! The parser is an external collaborator; these nodes are the contract
//! it produces and the planner consumes.

use serde_json::json;

use crate::auth::{Action, Privileges};
use crate::expression::Expr;

/// A complete statement.
#[derive(Debug, Clone)]
pub enum Statement {
    Select(std::sync::Arc<Select>),
    Insert(Insert),
    Upsert(Upsert),
    Update(Update),
    Delete(Delete),
    Merge(Merge),
    CreateIndex(CreateIndex),
    DropIndex(DropIndex),
    AlterIndex(AlterIndex),
    Explain(Box<Statement>),
    Prepare { name: String, statement: Box<Statement> },
    Execute { name: String },
}

impl Statement {
    /// Privileges a credential set must hold to run this statement.
    pub fn privileges(&self) -> Privileges {
        let mut privs = Privileges::new();
        match self {
            Statement::Select(s) => s.add_privileges(&mut privs),
            Statement::Insert(i) => privs.add(i.term.full_name(), Action::Write),
            Statement::Upsert(u) => privs.add(u.term.full_name(), Action::Write),
            Statement::Update(u) => privs.add(u.term.full_name(), Action::Write),
            Statement::Delete(d) => privs.add(d.term.full_name(), Action::Write),
            Statement::Merge(m) => {
                privs.add(m.target.full_name(), Action::Write);
                if let MergeSource::Keyspace(t) = &m.source {
                    privs.add(t.full_name(), Action::Read);
                }
            }
            Statement::CreateIndex(c) => privs.add(c.term.full_name(), Action::Admin),
            Statement::DropIndex(d) => privs.add(d.term.full_name(), Action::Admin),
            Statement::AlterIndex(a) => privs.add(a.term.full_name(), Action::Admin),
            Statement::Explain(inner) => return inner.privileges(),
            Statement::Prepare { statement, .. } => return statement.privileges(),
            Statement::Execute { .. } => {}
        }
        privs
    }

    /// Response signature: the shape of each result row.
    pub fn signature(&self) -> serde_json::Value {
        match self {
            Statement::Select(s) => s.signature(),
            Statement::Explain(_) => json!("json"),
            Statement::Prepare { .. } => json!("json"),
            _ => json!(null),
        }
    }

    pub fn is_readonly(&self) -> bool {
        matches!(
            self,
            Statement::Select(_) | Statement::Explain(_) | Statement::Prepare { .. } | Statement::Execute { .. }
        )
    }
}

/// SELECT with its trailing ORDER/OFFSET/LIMIT.
#[derive(Debug, Clone)]
pub struct Select {
    pub subresult: Subresult,
    pub order: Option<Vec<OrderTerm>>,
    pub offset: Option<Expr>,
    pub limit: Option<Expr>,
}

impl Select {
    pub fn new(subresult: Subresult) -> Self {
        Self {
            subresult,
            order: None,
            offset: None,
            limit: None,
        }
    }

    pub fn signature(&self) -> serde_json::Value {
        self.subresult.signature()
    }

    fn add_privileges(&self, privs: &mut Privileges) {
        self.subresult.add_privileges(privs);
    }
}

/// The set part of a SELECT: a single subselect or a union tree.
#[derive(Debug, Clone)]
pub enum Subresult {
    Subselect(Subselect),
    /// UNION: distinct results of both arms.
    Union {
        first: Box<Subresult>,
        second: Box<Subresult>,
    },
    /// UNION ALL: concatenated results.
    UnionAll {
        first: Box<Subresult>,
        second: Box<Subresult>,
    },
}

impl Subresult {
    pub fn signature(&self) -> serde_json::Value {
        match self {
            Subresult::Subselect(s) => s.projection.signature(),
            Subresult::Union { first, .. } | Subresult::UnionAll { first, .. } => first.signature(),
        }
    }

    fn add_privileges(&self, privs: &mut Privileges) {
        match self {
            Subresult::Subselect(s) => {
                if let Some(from) = &s.from {
                    from.add_privileges(privs);
                }
            }
            Subresult::Union { first, second } | Subresult::UnionAll { first, second } => {
                first.add_privileges(privs);
                second.add_privileges(privs);
            }
        }
    }
}

/// One SELECT block: FROM, LET, WHERE, GROUP, projection.
#[derive(Debug, Clone)]
pub struct Subselect {
    pub from: Option<FromTerm>,
    pub let_bindings: Vec<LetBinding>,
    pub where_clause: Option<Expr>,
    pub group: Option<Group>,
    pub projection: Projection,
}

/// A FROM-clause term tree. Lookup joins pair documents through a KEYS
/// expression evaluated on the left; ANSI joins carry an ON clause.
#[derive(Debug, Clone)]
pub enum FromTerm {
    Keyspace(KeyspaceTerm),
    Join {
        left: Box<FromTerm>,
        right: KeyspaceTerm,
        outer: bool,
    },
    Nest {
        left: Box<FromTerm>,
        right: KeyspaceTerm,
        outer: bool,
    },
    Unnest {
        left: Box<FromTerm>,
        expr: Expr,
        alias: String,
        outer: bool,
    },
    AnsiJoin {
        left: Box<FromTerm>,
        right: KeyspaceTerm,
        onclause: Expr,
        outer: bool,
    },
    AnsiNest {
        left: Box<FromTerm>,
        right: KeyspaceTerm,
        onclause: Expr,
        outer: bool,
    },
}

impl FromTerm {
    /// Aliases introduced by this term tree, left to right.
    pub fn aliases(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_aliases(&mut out);
        out
    }

    fn collect_aliases(&self, out: &mut Vec<String>) {
        match self {
            FromTerm::Keyspace(t) => out.push(t.alias().to_string()),
            FromTerm::Join { left, right, .. }
            | FromTerm::Nest { left, right, .. }
            | FromTerm::AnsiJoin { left, right, .. }
            | FromTerm::AnsiNest { left, right, .. } => {
                left.collect_aliases(out);
                out.push(right.alias().to_string());
            }
            FromTerm::Unnest { left, alias, .. } => {
                left.collect_aliases(out);
                out.push(alias.clone());
            }
        }
    }

    fn add_privileges(&self, privs: &mut Privileges) {
        match self {
            FromTerm::Keyspace(t) => privs.add(t.full_name(), Action::Read),
            FromTerm::Join { left, right, .. }
            | FromTerm::Nest { left, right, .. }
            | FromTerm::AnsiJoin { left, right, .. }
            | FromTerm::AnsiNest { left, right, .. } => {
                left.add_privileges(privs);
                privs.add(right.full_name(), Action::Read);
            }
            FromTerm::Unnest { left, .. } => left.add_privileges(privs),
        }
    }
}

/// A keyspace reference with its alias and optional KEYS clause.
#[derive(Debug, Clone)]
pub struct KeyspaceTerm {
    pub namespace: String,
    pub keyspace: String,
    pub as_alias: Option<String>,
    pub keys: Option<Expr>,
}

impl KeyspaceTerm {
    pub fn new(namespace: impl Into<String>, keyspace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            keyspace: keyspace.into(),
            as_alias: None,
            keys: None,
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.as_alias = Some(alias.into());
        self
    }

    pub fn with_keys(mut self, keys: Expr) -> Self {
        self.keys = Some(keys);
        self
    }

    pub fn alias(&self) -> &str {
        self.as_alias.as_deref().unwrap_or(&self.keyspace)
    }

    pub fn full_name(&self) -> String {
        format!("{}:{}", self.namespace, self.keyspace)
    }
}

/// LET / LETTING binding.
#[derive(Debug, Clone)]
pub struct LetBinding {
    pub variable: String,
    pub expr: Expr,
}

/// GROUP BY with LETTING and HAVING.
#[derive(Debug, Clone)]
pub struct Group {
    pub by: Vec<Expr>,
    pub letting: Vec<LetBinding>,
    pub having: Option<Expr>,
}

impl Group {
    pub fn empty() -> Self {
        Self {
            by: Vec::new(),
            letting: Vec::new(),
            having: None,
        }
    }
}

/// Result projection.
#[derive(Debug, Clone)]
pub struct Projection {
    pub distinct: bool,
    pub terms: Vec<ProjectionTerm>,
}

impl Projection {
    pub fn new(terms: Vec<ProjectionTerm>) -> Self {
        Self {
            distinct: false,
            terms,
        }
    }

    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    pub fn signature(&self) -> serde_json::Value {
        let mut sig = serde_json::Map::new();
        for (i, term) in self.terms.iter().enumerate() {
            if term.star {
                sig.insert("*".to_string(), json!("*"));
            } else {
                sig.insert(term.result_alias(i), json!("json"));
            }
        }
        serde_json::Value::Object(sig)
    }
}

/// One projection term: an expression with an optional alias, or `*`.
#[derive(Debug, Clone)]
pub struct ProjectionTerm {
    pub expr: Option<Expr>,
    pub alias: Option<String>,
    pub star: bool,
}

impl ProjectionTerm {
    pub fn new(expr: Expr) -> Self {
        Self {
            expr: Some(expr),
            alias: None,
            star: false,
        }
    }

    pub fn aliased(expr: Expr, alias: impl Into<String>) -> Self {
        Self {
            expr: Some(expr),
            alias: Some(alias.into()),
            star: false,
        }
    }

    pub fn star() -> Self {
        Self {
            expr: None,
            alias: None,
            star: true,
        }
    }

    /// The field name this term produces: the explicit alias, the last
    /// path component, or a positional `$n` name.
    pub fn result_alias(&self, position: usize) -> String {
        if let Some(alias) = &self.alias {
            return alias.clone();
        }
        if let Some(Expr::Field { name, .. }) = &self.expr {
            if let Expr::Constant(v) = name.as_ref() {
                if let Some(s) = v.as_str() {
                    return s.to_string();
                }
            }
        }
        if let Some(Expr::Identifier(name)) = &self.expr {
            return name.clone();
        }
        format!("${}", position + 1)
    }
}

/// ORDER BY term.
#[derive(Debug, Clone)]
pub struct OrderTerm {
    pub expr: Expr,
    pub descending: bool,
}

impl OrderTerm {
    pub fn asc(expr: Expr) -> Self {
        Self {
            expr,
            descending: false,
        }
    }

    pub fn desc(expr: Expr) -> Self {
        Self {
            expr,
            descending: true,
        }
    }
}

// DML

/// INSERT with explicit key/value pairs.
#[derive(Debug, Clone)]
pub struct Insert {
    pub term: KeyspaceTerm,
    pub values: Vec<InsertValues>,
}

#[derive(Debug, Clone)]
pub struct InsertValues {
    pub key: Expr,
    pub value: Expr,
}

/// UPSERT with explicit key/value pairs.
#[derive(Debug, Clone)]
pub struct Upsert {
    pub term: KeyspaceTerm,
    pub values: Vec<InsertValues>,
}

/// UPDATE ... SET/UNSET ... WHERE ... LIMIT.
#[derive(Debug, Clone)]
pub struct Update {
    pub term: KeyspaceTerm,
    pub keys: Option<Expr>,
    pub where_clause: Option<Expr>,
    pub set: Vec<SetTerm>,
    pub unset: Vec<UnsetTerm>,
    pub limit: Option<Expr>,
}

/// A SET path = value assignment. The path is a dotted field chain
/// relative to the document root.
#[derive(Debug, Clone)]
pub struct SetTerm {
    pub path: Vec<String>,
    pub value: Expr,
}

#[derive(Debug, Clone)]
pub struct UnsetTerm {
    pub path: Vec<String>,
}

/// DELETE ... WHERE ... LIMIT.
#[derive(Debug, Clone)]
pub struct Delete {
    pub term: KeyspaceTerm,
    pub keys: Option<Expr>,
    pub where_clause: Option<Expr>,
    pub limit: Option<Expr>,
}

/// MERGE INTO target USING source ON KEY key WHEN MATCHED/NOT MATCHED.
#[derive(Debug, Clone)]
pub struct Merge {
    pub target: KeyspaceTerm,
    pub source: MergeSource,
    pub source_alias: String,
    /// Evaluated per source item to produce the target key.
    pub key: Expr,
    pub update: Option<MergeUpdate>,
    pub delete: Option<MergeDelete>,
    pub insert: Option<Expr>,
    pub limit: Option<Expr>,
}

#[derive(Debug, Clone)]
pub enum MergeSource {
    Keyspace(KeyspaceTerm),
    Values(Expr),
}

#[derive(Debug, Clone)]
pub struct MergeUpdate {
    pub set: Vec<SetTerm>,
    pub unset: Vec<UnsetTerm>,
    pub where_clause: Option<Expr>,
}

#[derive(Debug, Clone)]
pub struct MergeDelete {
    pub where_clause: Option<Expr>,
}

// DDL

#[derive(Debug, Clone)]
pub struct CreateIndex {
    pub name: String,
    pub term: KeyspaceTerm,
    pub keys: Vec<Expr>,
    pub where_clause: Option<Expr>,
    pub primary: bool,
}

#[derive(Debug, Clone)]
pub struct DropIndex {
    pub term: KeyspaceTerm,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct AlterIndex {
    pub term: KeyspaceTerm,
    pub name: String,
    pub rename_to: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simple_select() -> Statement {
        let projection = Projection::new(vec![ProjectionTerm::new(Expr::path("k", "a"))]);
        let sub = Subselect {
            from: Some(FromTerm::Keyspace(KeyspaceTerm::new("default", "k"))),
            let_bindings: vec![],
            where_clause: None,
            group: None,
            projection,
        };
        Statement::Select(std::sync::Arc::new(Select::new(Subresult::Subselect(sub))))
    }

    #[test]
    fn test_signature_uses_path_tail() {
        let sig = simple_select().signature();
        assert_eq!(sig, serde_json::json!({"a": "json"}));
    }

    #[test]
    fn test_signature_positional_alias() {
        let projection = Projection::new(vec![ProjectionTerm::new(Expr::Aggregate(
            crate::expression::Aggregate::count_star(),
        ))]);
        assert_eq!(projection.signature(), serde_json::json!({"$1": "json"}));
    }

    #[test]
    fn test_select_privileges_are_read() {
        let privs = simple_select().privileges();
        assert!(privs.implies("default:k", Action::Read));
        assert!(!privs.implies("default:k", Action::Write));
    }

    #[test]
    fn test_keyspace_alias_defaults_to_name() {
        let t = KeyspaceTerm::new("default", "orders");
        assert_eq!(t.alias(), "orders");
        let t = t.with_alias("o");
        assert_eq!(t.alias(), "o");
    }
}
