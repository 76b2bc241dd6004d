//! Plan builder: algebra AST to physical plan.
//!
//! Recursive descent in FROM-first order. The WHERE predicate is
//! classified into base keyspaces before scans are chosen, so index
//! selection sees each keyspace's attributed filters. A SELECT with
//! ORDER BY projects early (scope preserved) and strips scopes after the
//! sort.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::algebra::{
    FromTerm, Group, KeyspaceTerm, MergeSource, Projection, Select, Statement, Subresult,
    Subselect,
};
use crate::datastore::Datastore;
use crate::errors::{Error, Result};
use crate::expression::{Aggregate, Expr};
use crate::plan::{KeyspaceRef, PlanNode};
use crate::value::Value;

use super::classifier::classify_expr;
use super::keyspace::BaseKeyspace;
use super::sarg::choose_scan;

/// Builds the physical plan for a statement under default settings.
pub fn build(statement: &Statement, datastore: &Arc<dyn Datastore>) -> Result<Arc<PlanNode>> {
    build_with(statement, datastore, &crate::server::settings::Settings::default())
}

/// Builds the physical plan for a statement. Row-producing statements end
/// in `Stream`; mutations end in `Discard` so only their counts surface.
/// Feature controls in `settings` can disable covering and union scans.
pub fn build_with(
    statement: &Statement,
    datastore: &Arc<dyn Datastore>,
    settings: &crate::server::settings::Settings,
) -> Result<Arc<PlanNode>> {
    let mut builder = Builder::new(datastore);
    builder.no_covering = settings.feature_disabled(crate::server::settings::feat::NO_COVERING);
    builder.no_union_scan =
        settings.feature_disabled(crate::server::settings::feat::NO_UNION_SCAN);
    let plan = builder.visit_statement(statement)?;
    // a prepared plan's terminal follows the statement being prepared
    let mut effective = statement;
    while let Statement::Prepare { statement, .. } = effective {
        effective = statement;
    }
    let terminal = if effective.is_readonly() {
        PlanNode::Stream
    } else {
        PlanNode::Discard
    };
    Ok(Arc::new(PlanNode::Sequence {
        children: vec![Arc::new(plan), Arc::new(terminal)],
    }))
}

struct Builder<'a> {
    datastore: &'a Arc<dyn Datastore>,
    project_initial: bool,
    order_exprs: Vec<Expr>,
    no_covering: bool,
    no_union_scan: bool,
}

struct CoveringInfo {
    covers: Vec<Expr>,
    filter_covers: Vec<(Expr, Value)>,
}

impl<'a> Builder<'a> {
    fn new(datastore: &'a Arc<dyn Datastore>) -> Self {
        Self {
            datastore,
            project_initial: false,
            order_exprs: Vec::new(),
            no_covering: false,
            no_union_scan: false,
        }
    }

    fn visit_statement(&mut self, statement: &Statement) -> Result<PlanNode> {
        match statement {
            Statement::Select(select) => self.visit_select(select),
            Statement::Insert(node) => Ok(PlanNode::SendInsert {
                term: keyspace_ref(&node.term),
                values: node.values.clone(),
                upsert: false,
            }),
            Statement::Upsert(node) => Ok(PlanNode::SendInsert {
                term: keyspace_ref(&node.term),
                values: node.values.clone(),
                upsert: true,
            }),
            Statement::Update(node) => self.visit_update(node),
            Statement::Delete(node) => self.visit_delete(node),
            Statement::Merge(node) => self.visit_merge(node),
            Statement::CreateIndex(node) => Ok(PlanNode::CreateIndex { node: node.clone() }),
            Statement::DropIndex(node) => Ok(PlanNode::DropIndex { node: node.clone() }),
            Statement::AlterIndex(node) => Ok(PlanNode::AlterIndex { node: node.clone() }),
            Statement::Explain(inner) => {
                let child = self.visit_statement(inner)?;
                Ok(PlanNode::Explain {
                    child: Arc::new(child),
                })
            }
            Statement::Prepare { statement, .. } => self.visit_statement(statement),
            Statement::Execute { name } => Err(Error::plan(format!(
                "EXECUTE {} must be resolved against the prepared cache before planning",
                name
            ))),
        }
    }

    fn visit_select(&mut self, select: &Select) -> Result<PlanNode> {
        let saved_project_initial = self.project_initial;
        let saved_order = std::mem::take(&mut self.order_exprs);

        if let Some(order) = &select.order {
            self.project_initial = true;
            self.order_exprs = order.iter().map(|t| t.expr.clone()).collect();
        }

        let sub = self.visit_subresult(&select.subresult)?;

        let result = if select.order.is_none() && select.offset.is_none() && select.limit.is_none()
        {
            sub
        } else {
            let mut children = vec![Arc::new(sub)];
            if let Some(order) = &select.order {
                children.push(Arc::new(PlanNode::Order {
                    terms: order.clone(),
                }));
            }
            if let Some(offset) = &select.offset {
                children.push(Arc::new(PlanNode::Offset {
                    expr: offset.clone(),
                }));
            }
            if let Some(limit) = &select.limit {
                children.push(Arc::new(PlanNode::Limit {
                    expr: limit.clone(),
                }));
            }
            if self.project_initial {
                children.push(Arc::new(PlanNode::Parallel {
                    child: Arc::new(PlanNode::FinalProject),
                }));
            }
            PlanNode::Sequence { children }
        };

        self.project_initial = saved_project_initial;
        self.order_exprs = saved_order;
        Ok(result)
    }

    fn visit_subresult(&mut self, subresult: &Subresult) -> Result<PlanNode> {
        match subresult {
            Subresult::Subselect(node) => self.visit_subselect(node),
            Subresult::Union { first, second } => {
                self.project_initial = false;
                let first = self.visit_subresult(first)?;
                let second = self.visit_subresult(second)?;
                Ok(PlanNode::Sequence {
                    children: vec![
                        Arc::new(PlanNode::UnionAll {
                            children: vec![Arc::new(first), Arc::new(second)],
                        }),
                        Arc::new(PlanNode::Distinct),
                    ],
                })
            }
            Subresult::UnionAll { first, second } => {
                self.project_initial = false;
                let first = self.visit_subresult(first)?;
                let second = self.visit_subresult(second)?;
                Ok(PlanNode::UnionAll {
                    children: vec![Arc::new(first), Arc::new(second)],
                })
            }
        }
    }

    fn visit_subselect(&mut self, node: &Subselect) -> Result<PlanNode> {
        // Aggregates referenced anywhere in the block.
        let mut aggregates: Vec<Aggregate> = Vec::new();
        for term in &node.projection.terms {
            if let Some(expr) = &term.expr {
                expr.collect_aggregates(&mut aggregates);
            }
        }
        if let Some(group) = &node.group {
            for binding in &group.letting {
                binding.expr.collect_aggregates(&mut aggregates);
            }
            if let Some(having) = &group.having {
                having.collect_aggregates(&mut aggregates);
            }
        }

        if let Some(count_scan) = self.count_scan_fast_path(node, &aggregates)? {
            return Ok(count_scan);
        }

        // Base keyspaces and WHERE classification precede scan choice.
        let mut base = base_keyspaces(node.from.as_ref());
        if let Some(where_clause) = &node.where_clause {
            if !base.is_empty() {
                classify_expr(where_clause, &mut base, false)?;
            }
        }

        let mut children: Vec<Arc<PlanNode>> = Vec::with_capacity(8);
        let mut sub_children: Vec<Arc<PlanNode>> = Vec::with_capacity(16);
        let mut covering: Option<CoveringInfo> = None;

        match &node.from {
            Some(from) => {
                let required = self.required_exprs(node);
                self.visit_from(
                    from,
                    &mut base,
                    &mut children,
                    &mut sub_children,
                    &required,
                    &mut covering,
                )?;
            }
            None => children.push(Arc::new(PlanNode::DummyScan)),
        }

        // Under a covering scan, rewrite the block's expressions to read
        // from the cover map.
        let rewrite = |expr: &Expr| -> Expr {
            match &covering {
                Some(info) => apply_covers(expr.clone(), &info.covers, &info.filter_covers),
                None => expr.clone(),
            }
        };

        if !node.let_bindings.is_empty() {
            sub_children.push(Arc::new(PlanNode::Let {
                bindings: node.let_bindings.clone(),
            }));
        }

        if let Some(where_clause) = &node.where_clause {
            sub_children.push(Arc::new(PlanNode::Filter {
                condition: rewrite(where_clause),
            }));
        }

        let mut projection = node.projection.clone();
        if covering.is_some() {
            for term in &mut projection.terms {
                if let Some(expr) = &term.expr {
                    term.expr = Some(rewrite(expr));
                }
            }
        }

        let group = match &node.group {
            Some(g) => Some(g.clone()),
            None if !aggregates.is_empty() => Some(Group::empty()),
            None => None,
        };

        if let Some(group) = group {
            let by: Vec<Expr> = group.by.iter().map(|e| rewrite(e)).collect();
            let aggs: Vec<Aggregate> = aggregates
                .iter()
                .map(|a| {
                    let mut a = a.clone();
                    if let Some(op) = &a.operand {
                        a.operand = Some(Box::new(rewrite(op)));
                    }
                    a
                })
                .collect();

            sub_children.push(Arc::new(PlanNode::InitialGroup {
                keys: by.clone(),
                aggregates: aggs.clone(),
            }));
            sub_children.push(Arc::new(PlanNode::IntermediateGroup {
                keys: by.clone(),
                aggregates: aggs.clone(),
            }));
            children.push(Arc::new(PlanNode::Parallel {
                child: Arc::new(PlanNode::Sequence {
                    children: std::mem::take(&mut sub_children),
                }),
            }));
            children.push(Arc::new(PlanNode::IntermediateGroup {
                keys: by.clone(),
                aggregates: aggs.clone(),
            }));
            children.push(Arc::new(PlanNode::FinalGroup {
                keys: by,
                aggregates: aggs,
            }));

            if !group.letting.is_empty() {
                sub_children.push(Arc::new(PlanNode::Let {
                    bindings: group.letting.clone(),
                }));
            }
            if let Some(having) = &group.having {
                sub_children.push(Arc::new(PlanNode::Filter {
                    condition: rewrite(having),
                }));
            }
        }

        let distinct = projection.distinct;
        sub_children.push(Arc::new(PlanNode::InitialProject {
            projection: Arc::new(projection),
        }));
        if distinct && !self.project_initial {
            sub_children.push(Arc::new(PlanNode::FinalProject));
        }

        children.push(Arc::new(PlanNode::Parallel {
            child: Arc::new(PlanNode::Sequence {
                children: std::mem::take(&mut sub_children),
            }),
        }));

        if distinct {
            children.push(Arc::new(PlanNode::Distinct));
        }

        Ok(PlanNode::Sequence { children })
    }

    /// `SELECT COUNT(*) FROM k` with no predicate collapses to a
    /// CountScan.
    fn count_scan_fast_path(
        &mut self,
        node: &Subselect,
        aggregates: &[Aggregate],
    ) -> Result<Option<PlanNode>> {
        let Some(FromTerm::Keyspace(term)) = &node.from else {
            return Ok(None);
        };
        let plain = term.keys.is_none()
            && node.where_clause.is_none()
            && node.group.is_none()
            && node.let_bindings.is_empty()
            && !node.projection.distinct
            && node.projection.terms.len() == 1
            && aggregates.len() == 1
            && aggregates[0].operand.is_none()
            && !aggregates[0].distinct;
        if !plain {
            return Ok(None);
        }
        self.resolve_keyspace(term)?;
        Ok(Some(PlanNode::Sequence {
            children: vec![
                Arc::new(PlanNode::CountScan {
                    term: keyspace_ref(term),
                }),
                Arc::new(PlanNode::InitialProject {
                    projection: Arc::new(node.projection.clone()),
                }),
            ],
        }))
    }

    /// Every expression the subselect needs answered, for the covering
    /// decision.
    fn required_exprs(&self, node: &Subselect) -> Vec<Expr> {
        let mut out = Vec::new();
        for term in &node.projection.terms {
            if let Some(expr) = &term.expr {
                out.push(expr.clone());
            }
        }
        if let Some(where_clause) = &node.where_clause {
            out.push(where_clause.clone());
        }
        for binding in &node.let_bindings {
            out.push(binding.expr.clone());
        }
        if let Some(group) = &node.group {
            out.extend(group.by.iter().cloned());
            for binding in &group.letting {
                out.push(binding.expr.clone());
            }
            if let Some(having) = &group.having {
                out.push(having.clone());
            }
        }
        out.extend(self.order_exprs.iter().cloned());
        out
    }

    fn visit_from(
        &mut self,
        from: &FromTerm,
        base: &mut BTreeMap<String, BaseKeyspace>,
        children: &mut Vec<Arc<PlanNode>>,
        sub_children: &mut Vec<Arc<PlanNode>>,
        required: &[Expr],
        covering: &mut Option<CoveringInfo>,
    ) -> Result<()> {
        match from {
            FromTerm::Keyspace(term) => {
                // Covering applies to a lone keyspace term only.
                let allow_covering = matches!(from, FromTerm::Keyspace(_)) && base.len() == 1;
                self.visit_keyspace_term(
                    term,
                    base,
                    children,
                    sub_children,
                    required,
                    covering,
                    allow_covering,
                    false,
                )
            }
            FromTerm::Join { left, right, outer } => {
                self.visit_from(left, base, children, sub_children, required, covering)?;
                self.resolve_keyspace(right)?;
                let keys = right.keys.clone().ok_or_else(|| {
                    Error::plan(format!("lookup join {} requires ON KEYS", right.alias()))
                })?;
                sub_children.push(Arc::new(PlanNode::Join {
                    term: keyspace_ref(right),
                    keys,
                    outer: *outer,
                }));
                Ok(())
            }
            FromTerm::Nest { left, right, outer } => {
                self.visit_from(left, base, children, sub_children, required, covering)?;
                self.resolve_keyspace(right)?;
                let keys = right.keys.clone().ok_or_else(|| {
                    Error::plan(format!("lookup nest {} requires ON KEYS", right.alias()))
                })?;
                sub_children.push(Arc::new(PlanNode::Nest {
                    term: keyspace_ref(right),
                    keys,
                    outer: *outer,
                }));
                Ok(())
            }
            FromTerm::Unnest {
                left,
                expr,
                alias,
                outer,
            } => {
                self.visit_from(left, base, children, sub_children, required, covering)?;
                sub_children.push(Arc::new(PlanNode::Unnest {
                    expr: expr.clone(),
                    alias: alias.clone(),
                    outer: *outer,
                }));
                Ok(())
            }
            FromTerm::AnsiJoin {
                left,
                right,
                onclause,
                outer,
            }
            | FromTerm::AnsiNest {
                left,
                right,
                onclause,
                outer,
            } => {
                self.visit_from(left, base, children, sub_children, required, covering)?;

                // The left side is planned; ON-clause classification must
                // not attribute to it again.
                for alias in left.aliases() {
                    if let Some(k) = base.get_mut(&alias) {
                        k.set_plan_done();
                    }
                }
                classify_expr(onclause, base, true)?;

                let mut right_children: Vec<Arc<PlanNode>> = Vec::new();
                let mut right_sub: Vec<Arc<PlanNode>> = Vec::new();
                self.visit_keyspace_term(
                    right,
                    base,
                    &mut right_children,
                    &mut right_sub,
                    &[],
                    &mut None,
                    false,
                    true,
                )?;
                right_children.extend(right_sub);
                let child = Arc::new(PlanNode::Sequence {
                    children: right_children,
                });

                let node = match from {
                    FromTerm::AnsiJoin { .. } => PlanNode::NLJoin {
                        child,
                        onclause: onclause.clone(),
                        alias: right.alias().to_string(),
                        outer: *outer,
                    },
                    _ => PlanNode::NLNest {
                        child,
                        onclause: onclause.clone(),
                        alias: right.alias().to_string(),
                        outer: *outer,
                    },
                };
                sub_children.push(Arc::new(node));
                Ok(())
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn visit_keyspace_term(
        &mut self,
        term: &KeyspaceTerm,
        base: &mut BTreeMap<String, BaseKeyspace>,
        children: &mut Vec<Arc<PlanNode>>,
        sub_children: &mut Vec<Arc<PlanNode>>,
        required: &[Expr],
        covering: &mut Option<CoveringInfo>,
        allow_covering: bool,
        under_nl: bool,
    ) -> Result<()> {
        let keyspace = self.resolve_keyspace(term)?;
        let term_ref = keyspace_ref(term);

        if let Some(keys) = &term.keys {
            children.push(Arc::new(PlanNode::KeyScan { keys: keys.clone() }));
            sub_children.push(Arc::new(PlanNode::Fetch { term: term_ref }));
            return Ok(());
        }

        let indexer = keyspace.indexer()?;
        let default_base = BaseKeyspace::new(term.alias(), term.full_name());
        let bk = base.get(term.alias()).unwrap_or(&default_base);
        let allow_covering = allow_covering && !self.no_covering;
        let required_refs: Vec<&Expr> = if allow_covering {
            required.iter().collect()
        } else {
            Vec::new()
        };
        let (scan, covers, filter_covers) = choose_scan(
            &term_ref,
            bk,
            &indexer,
            &required_refs,
            under_nl,
            self.no_union_scan,
        )?;

        let is_covering = allow_covering && !covers.is_empty();
        children.push(Arc::new(scan));

        if is_covering {
            *covering = Some(CoveringInfo {
                covers,
                filter_covers,
            });
        } else {
            sub_children.push(Arc::new(PlanNode::Fetch { term: term_ref }));
        }
        Ok(())
    }

    fn visit_update(&mut self, node: &crate::algebra::Update) -> Result<PlanNode> {
        let term_ref = keyspace_ref(&node.term);
        let mut children = self.mutation_source(
            &node.term,
            node.keys.as_ref(),
            node.where_clause.as_ref(),
        )?;
        children.push(Arc::new(PlanNode::Clone));
        if !node.set.is_empty() {
            children.push(Arc::new(PlanNode::Set {
                alias: node.term.alias().to_string(),
                terms: node.set.clone(),
            }));
        }
        if !node.unset.is_empty() {
            children.push(Arc::new(PlanNode::Unset {
                alias: node.term.alias().to_string(),
                terms: node.unset.clone(),
            }));
        }
        children.push(Arc::new(PlanNode::SendUpdate {
            term: term_ref,
            limit: node.limit.clone(),
        }));
        Ok(PlanNode::Sequence { children })
    }

    fn visit_delete(&mut self, node: &crate::algebra::Delete) -> Result<PlanNode> {
        let term_ref = keyspace_ref(&node.term);
        let mut children = self.mutation_source(
            &node.term,
            node.keys.as_ref(),
            node.where_clause.as_ref(),
        )?;
        children.push(Arc::new(PlanNode::SendDelete {
            term: term_ref,
            limit: node.limit.clone(),
        }));
        Ok(PlanNode::Sequence { children })
    }

    /// Scan + Fetch + Filter feeding a mutation tail.
    fn mutation_source(
        &mut self,
        term: &KeyspaceTerm,
        keys: Option<&Expr>,
        where_clause: Option<&Expr>,
    ) -> Result<Vec<Arc<PlanNode>>> {
        let keyspace = self.resolve_keyspace(term)?;
        let term_ref = keyspace_ref(term);

        let mut children: Vec<Arc<PlanNode>> = Vec::new();
        match keys {
            Some(keys) => children.push(Arc::new(PlanNode::KeyScan { keys: keys.clone() })),
            None => {
                let mut base = BTreeMap::new();
                base.insert(
                    term.alias().to_string(),
                    BaseKeyspace::new(term.alias(), term.full_name()),
                );
                if let Some(where_clause) = where_clause {
                    classify_expr(where_clause, &mut base, false)?;
                }
                let indexer = keyspace.indexer()?;
                let (scan, _, _) =
                    choose_scan(&term_ref, &base[term.alias()], &indexer, &[], false, self.no_union_scan)?;
                children.push(Arc::new(scan));
            }
        }
        children.push(Arc::new(PlanNode::Fetch {
            term: term_ref,
        }));
        if let Some(where_clause) = where_clause {
            children.push(Arc::new(PlanNode::Filter {
                condition: where_clause.clone(),
            }));
        }
        Ok(children)
    }

    fn visit_merge(&mut self, node: &crate::algebra::Merge) -> Result<PlanNode> {
        self.resolve_keyspace(&node.target)?;
        let mut children: Vec<Arc<PlanNode>> = Vec::new();
        match &node.source {
            MergeSource::Keyspace(term) => {
                self.resolve_keyspace(term)?;
                children.push(Arc::new(PlanNode::PrimaryScan {
                    term: keyspace_ref(term),
                }));
                children.push(Arc::new(PlanNode::Fetch {
                    term: keyspace_ref(term),
                }));
            }
            MergeSource::Values(values) => {
                children.push(Arc::new(PlanNode::ValueScan {
                    values: values.clone(),
                }));
            }
        }
        children.push(Arc::new(PlanNode::Merge {
            target: keyspace_ref(&node.target),
            key: node.key.clone(),
            update: node.update.clone(),
            delete: node.delete.clone(),
            insert: node.insert.clone(),
        }));
        Ok(PlanNode::Sequence { children })
    }

    fn resolve_keyspace(
        &self,
        term: &KeyspaceTerm,
    ) -> Result<Arc<dyn crate::datastore::Keyspace>> {
        let namespace = self.datastore.namespace(&term.namespace)?;
        namespace.keyspace(&term.keyspace)
    }
}

fn keyspace_ref(term: &KeyspaceTerm) -> KeyspaceRef {
    KeyspaceRef::new(&term.namespace, &term.keyspace, term.alias())
}

fn base_keyspaces(from: Option<&FromTerm>) -> BTreeMap<String, BaseKeyspace> {
    let mut base = BTreeMap::new();
    let Some(from) = from else {
        return base;
    };
    collect_terms(from, &mut base);
    base
}

fn collect_terms(from: &FromTerm, base: &mut BTreeMap<String, BaseKeyspace>) {
    match from {
        FromTerm::Keyspace(t) => {
            base.insert(
                t.alias().to_string(),
                BaseKeyspace::new(t.alias(), t.full_name()),
            );
        }
        FromTerm::Join { left, right, .. }
        | FromTerm::Nest { left, right, .. }
        | FromTerm::AnsiJoin { left, right, .. }
        | FromTerm::AnsiNest { left, right, .. } => {
            collect_terms(left, base);
            base.insert(
                right.alias().to_string(),
                BaseKeyspace::new(right.alias(), right.full_name()),
            );
        }
        FromTerm::Unnest { left, alias, .. } => {
            collect_terms(left, base);
            base.insert(
                alias.clone(),
                BaseKeyspace::new(alias.clone(), format!("#unnest:{}", alias)),
            );
        }
    }
}

/// Replaces subtrees answered by the covering scan with cover
/// references.
fn apply_covers(expr: Expr, covers: &[Expr], filter_covers: &[(Expr, Value)]) -> Expr {
    if matches!(expr, Expr::Cover { .. }) {
        return expr;
    }
    for c in covers {
        if expr.equivalent_to(c) {
            let text = c.to_string();
            return Expr::Cover {
                covered: Box::new(expr),
                text,
            };
        }
    }
    for (e, _) in filter_covers {
        if expr.equivalent_to(e) {
            let text = e.to_string();
            return Expr::Cover {
                covered: Box::new(expr),
                text,
            };
        }
    }
    expr.map_children(&mut |child| Ok(apply_covers(child, covers, filter_covers)))
        .expect("cover rewrite is infallible")
}
