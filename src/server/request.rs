//! Request and response shapes.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::json;

use crate::algebra::Statement;
use crate::auth::Credentials;
use crate::errors::Error;
use crate::value::Value;

/// A query request: a parsed statement (or a prepared-statement name)
/// plus its parameters and client metadata.
pub struct Request {
    pub statement: Option<Statement>,
    /// The original statement text, carried for auditing and prepared
    /// identity; the engine never re-parses it.
    pub statement_text: String,
    pub named_args: HashMap<String, Value>,
    pub positional_args: Vec<Value>,
    pub credentials: Credentials,
    pub client_context_id: String,
    pub user_agent: String,
    /// Overrides the engine-wide timeout when set.
    pub timeout: Option<Duration>,
}

impl Request {
    pub fn new(statement: Statement, text: impl Into<String>) -> Self {
        Self {
            statement: Some(statement),
            statement_text: text.into(),
            named_args: HashMap::new(),
            positional_args: Vec::new(),
            credentials: Credentials::default(),
            client_context_id: String::new(),
            user_agent: String::new(),
            timeout: None,
        }
    }

    pub fn with_named_arg(mut self, name: impl Into<String>, value: Value) -> Self {
        self.named_args.insert(name.into(), value);
        self
    }

    pub fn with_positional_args(mut self, args: Vec<Value>) -> Self {
        self.positional_args = args;
        self
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Final request status: success iff no errors and no fatal condition,
/// stopped after cancellation or timeout, errors otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    Errors,
    Stopped,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Success => "success",
            Status::Errors => "errors",
            Status::Stopped => "stopped",
        }
    }
}

/// The on-wire response envelope.
pub struct Response {
    pub request_id: String,
    pub signature: serde_json::Value,
    pub results: Vec<serde_json::Value>,
    pub errors: Vec<Error>,
    pub warnings: Vec<Error>,
    pub status: Status,
    pub elapsed_time: Duration,
    pub execution_time: Duration,
    pub result_count: u64,
    pub result_size: u64,
    pub mutation_count: u64,
    pub sort_count: u64,
}

impl Response {
    pub fn to_json(&self) -> serde_json::Value {
        let mut obj = json!({
            "requestID": self.request_id,
            "signature": self.signature,
            "results": self.results,
            "status": self.status.as_str(),
            "metrics": {
                "elapsedTime": format!("{:?}", self.elapsed_time),
                "executionTime": format!("{:?}", self.execution_time),
                "resultCount": self.result_count,
                "resultSize": self.result_size,
            },
        });
        if !self.errors.is_empty() {
            obj["errors"] = json!(self.errors.iter().map(|e| e.to_json()).collect::<Vec<_>>());
            obj["metrics"]["errorCount"] = json!(self.errors.len());
        }
        if !self.warnings.is_empty() {
            obj["warnings"] =
                json!(self.warnings.iter().map(|e| e.to_json()).collect::<Vec<_>>());
            obj["metrics"]["warningCount"] = json!(self.warnings.len());
        }
        if self.mutation_count > 0 {
            obj["metrics"]["mutationCount"] = json!(self.mutation_count);
        }
        if self.sort_count > 0 {
            obj["metrics"]["sortCount"] = json!(self.sort_count);
        }
        obj
    }
}
