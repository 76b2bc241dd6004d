//! Engine-wide error type.
//!
//! Every error carries a stable numeric code, an error kind, an optional
//! cause chain, and a retryable flag. Codes are grouped by subsystem:
//! 1xxx admin, 3xxx parse, 4xxx plan, 5xxx execution, 10xxx auth,
//! 12xxx datastore/index.

use std::fmt;

use serde::Serialize;

/// Classification of an engine error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Statement could not be parsed (parser is external; the kind is
    /// reserved for callers handing us malformed input).
    Parse,
    /// Statement could not be planned.
    Plan,
    /// Planner reached an inconsistent internal state.
    PlanInternal,
    /// Expression evaluation failed at runtime.
    Evaluation,
    /// Operator failed at runtime.
    Execution,
    /// Runtime reached an inconsistent internal state (includes recovered
    /// panics).
    ExecutionInternal,
    /// Datastore operation failed.
    Datastore,
    /// Index operation failed.
    Index,
    /// Request was not authorized.
    Auth,
    /// Request was rejected before planning.
    Admin,
    /// Request exceeded its timeout.
    Timeout,
}

impl ErrorKind {
    /// Base numeric code for the kind.
    pub fn base_code(&self) -> u32 {
        match self {
            ErrorKind::Admin => 1000,
            ErrorKind::Timeout => 1080,
            ErrorKind::Parse => 3000,
            ErrorKind::Plan => 4000,
            ErrorKind::PlanInternal => 4990,
            ErrorKind::Execution => 5000,
            ErrorKind::ExecutionInternal => 5001,
            ErrorKind::Evaluation => 5010,
            ErrorKind::Auth => 10000,
            ErrorKind::Datastore => 12000,
            ErrorKind::Index => 12500,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Parse => "parse",
            ErrorKind::Plan => "plan",
            ErrorKind::PlanInternal => "plan.internal",
            ErrorKind::Evaluation => "evaluation",
            ErrorKind::Execution => "execution",
            ErrorKind::ExecutionInternal => "execution.internal",
            ErrorKind::Datastore => "datastore",
            ErrorKind::Index => "index",
            ErrorKind::Auth => "auth",
            ErrorKind::Admin => "admin",
            ErrorKind::Timeout => "timeout",
        }
    }
}

/// An engine error.
#[derive(Debug, thiserror::Error)]
pub struct Error {
    kind: ErrorKind,
    code: u32,
    message: String,
    retryable: bool,
    fatal: bool,
    #[source]
    cause: Option<Box<Error>>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: kind.base_code(),
            message: message.into(),
            retryable: false,
            fatal: false,
            cause: None,
        }
    }

    /// Statement failed to plan.
    pub fn plan(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Plan, message)
    }

    /// Planner bug; message describes the inconsistent state.
    pub fn plan_internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PlanInternal, message)
    }

    /// Expression evaluation failure. `reason` names the evaluation site
    /// ("span", "filter", "projection", ...).
    pub fn evaluation(cause: Error, reason: &str) -> Self {
        Self::new(ErrorKind::Evaluation, format!("evaluating {}", reason)).with_cause(cause)
    }

    /// Standalone evaluation failure with no inner cause.
    pub fn evaluation_message(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Evaluation, message)
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Execution, message)
    }

    /// Runtime bug, including recovered panics.
    pub fn execution_internal(message: impl Into<String>) -> Self {
        let mut e = Self::new(ErrorKind::ExecutionInternal, message);
        e.fatal = true;
        e
    }

    pub fn datastore(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Datastore, message)
    }

    pub fn index(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Index, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        let mut e = Self::new(ErrorKind::Auth, message);
        e.fatal = true;
        e
    }

    pub fn admin(message: impl Into<String>) -> Self {
        let mut e = Self::new(ErrorKind::Admin, message);
        e.fatal = true;
        e
    }

    /// Admission rejection; safe for the client to retry later.
    pub fn too_many_requests(message: impl Into<String>) -> Self {
        let mut e = Self::new(ErrorKind::Admin, message);
        e.retryable = true;
        e
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn with_cause(mut self, cause: Error) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn with_code(mut self, code: u32) -> Self {
        self.code = code;
        self
    }

    pub fn retryable(mut self) -> Self {
        self.retryable = true;
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn code(&self) -> u32 {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    /// Fatal errors stop the pipeline; non-fatal errors drop the offending
    /// item and continue.
    pub fn is_fatal(&self) -> bool {
        self.fatal
    }

    pub fn cause(&self) -> Option<&Error> {
        self.cause.as_deref()
    }

    /// JSON shape used in the response `errors`/`warnings` arrays.
    pub fn to_json(&self) -> serde_json::Value {
        let mut obj = serde_json::json!({
            "code": self.code,
            "msg": self.message,
        });
        if self.retryable {
            obj["retry"] = serde_json::Value::Bool(true);
        }
        if let Some(cause) = &self.cause {
            obj["cause"] = cause.to_json();
        }
        obj
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.code, self.kind.as_str(), self.message)?;
        if let Some(cause) = &self.cause {
            write!(f, " (cause: {})", cause)?;
        }
        Ok(())
    }
}

/// Result alias used across the engine.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(Error::plan("x").code(), 4000);
        assert_eq!(Error::plan_internal("x").code(), 4990);
        assert_eq!(Error::execution("x").code(), 5000);
        assert_eq!(Error::execution_internal("x").code(), 5001);
        assert_eq!(Error::evaluation_message("x").code(), 5010);
        assert_eq!(Error::datastore("x").code(), 12000);
        assert_eq!(Error::timeout("x").code(), 1080);
    }

    #[test]
    fn test_cause_chain() {
        let inner = Error::datastore("connection reset");
        let outer = Error::evaluation(inner, "span");
        assert_eq!(outer.kind(), ErrorKind::Evaluation);
        assert_eq!(outer.cause().unwrap().kind(), ErrorKind::Datastore);
        let json = outer.to_json();
        assert_eq!(json["cause"]["code"], 12000);
    }

    #[test]
    fn test_admission_retryable() {
        let e = Error::too_many_requests("queue full");
        assert!(e.is_retryable());
        assert!(!Error::plan("x").is_retryable());
    }

    #[test]
    fn test_internal_errors_are_fatal() {
        assert!(Error::execution_internal("bug").is_fatal());
        assert!(!Error::execution("op failed").is_fatal());
    }
}
