//! Engine error types.

use thiserror::Error;

/// Fatal errors that abort the owning interpreter instance.
///
/// Recoverable conditions (guard evaluation failures, invoke start/cancel
/// failures) never surface here; they go through the
/// [`ErrorReporter`](crate::env::ErrorReporter) and are injected as internal
/// events so the statechart itself can react.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no initial target for '{id}'")]
    NoInitialTarget { id: String },

    #[error("illegal state machine configuration: {reason}")]
    IllegalConfiguration { reason: String },

    #[error("unresolvable target id '{id}'")]
    UnresolvedTarget { id: String },

    #[error("invalid model definition: {reason}")]
    InvalidModel { reason: String },

    #[error("invoker failure at '{id}': {reason}")]
    Invoker { id: String, reason: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Expression evaluation failures.
///
/// A malformed expression is signalled distinctly from an expression that
/// merely evaluates to false or null.
#[derive(Debug, Error)]
pub enum ExprError {
    #[error("malformed expression: {reason}")]
    Parse { reason: String },

    #[error("evaluation failed: {reason}")]
    Eval { reason: String },
}

/// Failures raised by an invoked child process.
#[derive(Debug, Error)]
#[error("{reason}")]
pub struct InvokerError {
    pub reason: String,
}

impl InvokerError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Classification of recoverable conditions passed to the ErrorReporter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReportKind {
    /// A composite state or the document itself lacks an initial target.
    NoInitial,
    /// An initial transition points at something unenterable.
    IllegalInitial,
    /// The resulting configuration violates the AND/OR invariants.
    IllegalConfig,
    /// A guard or action expression failed to evaluate.
    ExpressionError,
    /// An assignment named a variable not defined in any enclosing scope.
    UndefinedVariable,
    /// An invoked process could not be started.
    InvokeFailed,
    /// An invoked process could not be cancelled.
    CancelFailed,
}

impl ReportKind {
    /// Short stable code, suitable for log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportKind::NoInitial => "NO_INITIAL",
            ReportKind::IllegalInitial => "ILLEGAL_INITIAL",
            ReportKind::IllegalConfig => "ILLEGAL_CONFIG",
            ReportKind::ExpressionError => "EXPRESSION_ERROR",
            ReportKind::UndefinedVariable => "UNDEFINED_VARIABLE",
            ReportKind::InvokeFailed => "INVOKE_FAILED",
            ReportKind::CancelFailed => "CANCEL_FAILED",
        }
    }
}
