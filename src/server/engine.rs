//! Request lifecycle.
//!
//! Admit, authorize, plan (or resolve a prepared plan), execute, and
//! account: the engine owns the pipeline from statement to response
//! envelope. A timeout watcher cancels the root pipeline; cancellation
//! surfaces as status `stopped`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;

use crate::algebra::Statement;
use crate::audit::{Auditable, Auditor};
use crate::auth::Authorizer;
use crate::datastore::Datastore;
use crate::errors::Error;
use crate::execution::{spawn_plan, CollectorSink, Context};
use crate::observability::{Logger, MetricsRegistry, Severity};
use crate::plan::PlanNode;
use crate::value::Value;

use super::prepared::{Prepared, PreparedCache};
use super::request::{Request, Response, Status};
use super::settings::Settings;

/// The query engine: a datastore, a settings snapshot and the shared
/// request services.
pub struct QueryEngine {
    datastore: Arc<dyn Datastore>,
    settings: Settings,
    authorizer: Arc<dyn Authorizer>,
    auditor: Auditor,
    metrics: Arc<MetricsRegistry>,
    prepareds: PreparedCache,
    admission: Arc<Semaphore>,
    node_name: String,
}

impl QueryEngine {
    pub fn new(datastore: Arc<dyn Datastore>, settings: Settings) -> Self {
        let servicers = settings.servicers;
        Self {
            datastore,
            settings,
            authorizer: Arc::new(crate::auth::AllowAll),
            auditor: Auditor::disabled(),
            metrics: Arc::new(MetricsRegistry::new()),
            prepareds: PreparedCache::new(),
            admission: Arc::new(Semaphore::new(servicers)),
            node_name: "local".to_string(),
        }
    }

    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    pub fn with_auditor(mut self, auditor: Auditor) -> Self {
        self.auditor = auditor;
        self
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub fn prepareds(&self) -> &PreparedCache {
        &self.prepareds
    }

    /// Runs one request to completion.
    pub async fn execute(&self, request: Request) -> Response {
        let started = Instant::now();
        let request_id = uuid::Uuid::new_v4().to_string();

        // Admission: reject rather than queue when saturated.
        let _permit = match self.admission.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                self.metrics.increment_rejected();
                return self.early_failure(
                    request_id,
                    started,
                    Error::too_many_requests("server is at capacity"),
                );
            }
        };
        self.metrics.increment_admitted();

        let Some(statement) = &request.statement else {
            return self.early_failure(
                request_id,
                started,
                Error::admin("request carries no statement"),
            );
        };

        // Prepared resolution happens before authorization so EXECUTE is
        // checked against the prepared statement's privileges.
        let (plan, signature, prepared) = match self.resolve(statement) {
            Ok(resolved) => resolved,
            Err(e) => return self.early_failure(request_id, started, e),
        };

        let privileges = match &prepared {
            Some(p) => p.privileges.clone(),
            None => statement.privileges(),
        };
        if let Err(e) = self.authorizer.authorize(&privileges, &request.credentials) {
            return self.early_failure(request_id, started, e);
        }

        let execution_started = Instant::now();
        let (sink, rows) = CollectorSink::new();
        let ctx = Context::new(
            request_id.clone(),
            self.datastore.clone(),
            self.settings.clone(),
            Box::new(sink),
        )
        .with_args(request.named_args.clone(), request.positional_args.clone());

        let response = match spawn_plan(&plan, &ctx, None) {
            Err(e) => {
                ctx.error(e);
                self.assemble(
                    request_id, &request, statement, signature, started,
                    execution_started, &ctx, Vec::new(), false,
                )
            }
            Ok(mut pipeline) => {
                // timeout watcher: a separate task that stops the root
                let timeout = request
                    .timeout
                    .unwrap_or(Duration::from_millis(self.settings.timeout_ms));
                let watcher = if timeout > Duration::ZERO {
                    let stopper = pipeline.stopper();
                    let watcher_ctx = ctx.clone();
                    Some(tokio::spawn(async move {
                        tokio::time::sleep(timeout).await;
                        watcher_ctx.mark_stopped();
                        watcher_ctx.error(Error::timeout(format!(
                            "request exceeded timeout {:?}",
                            timeout
                        )));
                        stopper.send_stop();
                    }))
                } else {
                    None
                };

                // drain the terminal channel; rows arrive via the sink
                if let Some(mut output) = pipeline.take_output() {
                    while output.recv().await.is_some() {}
                }
                pipeline.join().await;
                let timed_out = match watcher {
                    Some(w) => {
                        let fired = w.is_finished();
                        w.abort();
                        fired
                    }
                    None => false,
                };

                let results = std::mem::take(&mut *rows.lock().unwrap());
                self.assemble(
                    request_id, &request, statement, signature, started,
                    execution_started, &ctx, results, timed_out,
                )
            }
        };

        match response.status {
            Status::Success => self.metrics.increment_completed(),
            Status::Stopped => self.metrics.increment_stopped(),
            Status::Errors => self.metrics.increment_errored(),
        }
        self.metrics.add_results(response.result_count);
        self.metrics.add_mutations(response.mutation_count);
        response
    }

    /// Resolves a statement to a plan: EXECUTE reads the prepared cache,
    /// PREPARE populates it, everything else plans directly.
    fn resolve(
        &self,
        statement: &Statement,
    ) -> crate::errors::Result<(Arc<PlanNode>, serde_json::Value, Option<Arc<Prepared>>)> {
        match statement {
            Statement::Execute { name } => {
                let prepared = self.prepareds.get(name).map_err(|e| {
                    self.metrics.increment_prepared_misses();
                    e
                })?;
                self.metrics.increment_prepared_hits();
                Ok((
                    prepared.plan.clone(),
                    prepared.signature.clone(),
                    Some(prepared),
                ))
            }
            Statement::Prepare { name, statement: inner } => {
                let plan = crate::planner::build_with(statement, &self.datastore, &self.settings)?;
                let prepared = self.prepareds.put(Prepared {
                    name: name.clone(),
                    text: String::new(),
                    plan: plan.clone(),
                    signature: inner.signature(),
                    privileges: inner.privileges(),
                    readonly: inner.is_readonly(),
                });
                // PREPARE itself returns the prepared entry's description
                let description = serde_json::json!({
                    "name": prepared.name,
                    "signature": prepared.signature,
                });
                let row = crate::expression::Expr::Constant(Value::from(description.clone()));
                Ok((
                    Arc::new(PlanNode::Sequence {
                        children: vec![
                            Arc::new(PlanNode::ValueScan { values: row }),
                            Arc::new(PlanNode::Stream),
                        ],
                    }),
                    description,
                    None,
                ))
            }
            _ => {
                let plan = crate::planner::build_with(statement, &self.datastore, &self.settings)?;
                Ok((plan, statement.signature(), None))
            }
        }
    }

    fn early_failure(
        &self,
        request_id: String,
        started: Instant,
        error: Error,
    ) -> Response {
        Logger::log_stderr(
            Severity::Error,
            "request.rejected",
            &[
                ("request_id", &request_id),
                ("code", &error.code().to_string()),
                ("msg", error.message()),
            ],
        );
        Response {
            request_id,
            signature: serde_json::Value::Null,
            results: Vec::new(),
            errors: vec![error],
            warnings: Vec::new(),
            status: Status::Errors,
            elapsed_time: started.elapsed(),
            execution_time: Duration::ZERO,
            result_count: 0,
            result_size: 0,
            mutation_count: 0,
            sort_count: 0,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        &self,
        request_id: String,
        request: &Request,
        statement: &Statement,
        signature: serde_json::Value,
        started: Instant,
        execution_started: Instant,
        ctx: &Arc<Context>,
        results: Vec<serde_json::Value>,
        timed_out: bool,
    ) -> Response {
        let errors = ctx.take_errors();
        let warnings = ctx.take_warnings();

        let status = if timed_out || (ctx.is_stopped() && !ctx.had_fatal()) {
            Status::Stopped
        } else if errors.is_empty() {
            Status::Success
        } else {
            Status::Errors
        };

        let response = Response {
            request_id: request_id.clone(),
            signature,
            results,
            errors,
            warnings,
            status,
            elapsed_time: started.elapsed(),
            execution_time: execution_started.elapsed(),
            result_count: ctx.result_count(),
            result_size: ctx.result_size(),
            mutation_count: ctx.mutation_count(),
            sort_count: ctx.sort_count(),
        };

        Logger::log(
            Severity::Info,
            "request.completed",
            &[
                ("request_id", &request_id),
                ("status", response.status.as_str()),
                ("result_count", &response.result_count.to_string()),
            ],
        );

        self.auditor.submit(&RequestAudit {
            request,
            statement,
            response: &response,
            node_name: &self.node_name,
        });

        response
    }
}

fn statement_type(statement: &Statement) -> &'static str {
    match statement {
        Statement::Select(_) => "SELECT",
        Statement::Insert(_) => "INSERT",
        Statement::Upsert(_) => "UPSERT",
        Statement::Update(_) => "UPDATE",
        Statement::Delete(_) => "DELETE",
        Statement::Merge(_) => "MERGE",
        Statement::CreateIndex(_) => "CREATE_INDEX",
        Statement::DropIndex(_) => "DROP_INDEX",
        Statement::AlterIndex(_) => "ALTER_INDEX",
        Statement::Explain(_) => "EXPLAIN",
        Statement::Prepare { .. } => "PREPARE",
        Statement::Execute { .. } => "EXECUTE",
    }
}

/// Adapter exposing a finished request to the auditor.
struct RequestAudit<'a> {
    request: &'a Request,
    statement: &'a Statement,
    response: &'a Response,
    node_name: &'a str,
}

impl Auditable for RequestAudit<'_> {
    fn event_status(&self) -> String {
        self.response.status.as_str().to_string()
    }

    fn statement(&self) -> String {
        self.request.statement_text.clone()
    }

    fn event_type(&self) -> String {
        statement_type(self.statement).to_string()
    }

    fn event_users(&self) -> Vec<String> {
        self.request.credentials.users.clone()
    }

    fn user_agent(&self) -> String {
        self.request.user_agent.clone()
    }

    fn event_node_name(&self) -> String {
        self.node_name.to_string()
    }

    fn event_named_args(&self) -> Vec<(String, String)> {
        let mut args: Vec<(String, String)> = self
            .request
            .named_args
            .iter()
            .map(|(k, v)| (k.clone(), v.canonical_string()))
            .collect();
        args.sort();
        args
    }

    fn event_positional_args(&self) -> Vec<String> {
        self.request
            .positional_args
            .iter()
            .map(Value::canonical_string)
            .collect()
    }

    fn client_context_id(&self) -> String {
        self.request.client_context_id.clone()
    }

    fn is_ad_hoc(&self) -> bool {
        !matches!(self.statement, Statement::Execute { .. })
    }

    fn elapsed_time(&self) -> Duration {
        self.response.elapsed_time
    }

    fn execution_time(&self) -> Duration {
        self.response.execution_time
    }

    fn event_result_count(&self) -> u64 {
        self.response.result_count
    }

    fn event_result_size(&self) -> u64 {
        self.response.result_size
    }

    fn mutation_count(&self) -> u64 {
        self.response.mutation_count
    }

    fn sort_count(&self) -> u64 {
        self.response.sort_count
    }

    fn event_error_count(&self) -> usize {
        self.response.errors.len()
    }

    fn event_warning_count(&self) -> usize {
        self.response.warnings.len()
    }
}

/// Convenience: a request map keyed by name, for callers assembling
/// named arguments from JSON.
pub fn named_args_from_json(args: HashMap<String, serde_json::Value>) -> HashMap<String, Value> {
    args.into_iter().map(|(k, v)| (k, Value::from(v))).collect()
}
