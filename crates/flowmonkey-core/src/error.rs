//! Engine error taxonomy
//!
//! Every engine-originated failure carries a stable code and a human
//! message. `EngineError` is the in-flight error type; `ErrorDetail` is the
//! shape persisted on failed executions and surfaced to callers.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Error shape persisted on executions and step history entries
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorDetail {
    /// Stable error code (e.g. `VALIDATION_ERROR`, `EXECUTION_TIMEOUT`)
    pub code: String,

    /// Human-readable message
    pub message: String,

    /// Additional details (for debugging)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ErrorDetail {
    /// Create a new error detail
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    /// Add error details
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl std::fmt::Display for ErrorDetail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Errors produced by the engine and its collaborators
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    // =========================================================================
    // Configuration
    // =========================================================================
    /// Flow not registered (or the pinned version is unknown)
    #[error("flow not found: {flow_id}@{version}")]
    FlowNotFound { flow_id: String, version: String },

    /// Execution references a step missing from the flow
    #[error("step not found in flow {flow_id}: {step_id}")]
    StepNotFound { flow_id: String, step_id: String },

    /// No handler registered for a step type
    #[error("no handler registered for step type: {0}")]
    HandlerNotFound(String),

    /// Flow rejected at registration
    #[error("flow validation failed: {}", .errors.join("; "))]
    PipeValidationFailed { errors: Vec<String> },

    // =========================================================================
    // Input
    // =========================================================================
    /// Required context key missing
    #[error("input key missing from context: {0}")]
    InputKeyMissing(String),

    /// Dot path did not resolve
    #[error("input path missing from context: {0}")]
    InputPathMissing(String),

    /// Template interpolation left an unresolved expression
    #[error("template expression unresolved: {0}")]
    InputTemplateUnresolved(String),

    /// Context holds more keys than the configured cap
    #[error("context key count {actual} exceeds limit {limit}")]
    ContextKeyLimit { actual: usize, limit: usize },

    /// Serialized context exceeds the configured cap
    #[error("context size {actual} bytes exceeds limit {limit}")]
    ContextSizeLimit { actual: usize, limit: usize },

    /// Context nesting deeper than the configured cap
    #[error("context nesting depth {actual} exceeds limit {limit}")]
    ContextDepthLimit { actual: usize, limit: usize },

    // =========================================================================
    // State
    // =========================================================================
    /// Execution not found in the store
    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),

    /// Operation not valid for the execution's current status
    #[error("invalid execution state: {execution_id} is {status}")]
    InvalidExecutionState {
        execution_id: Uuid,
        status: String,
    },

    /// Idempotency key already bound to a different flow
    #[error("idempotency key conflict for flow {flow_id}: {key}")]
    IdempotencyConflict { flow_id: String, key: String },

    /// Another tick holds the execution lock (soft; caller may retry)
    #[error("execution lock contended: {0}")]
    LockContention(Uuid),

    /// Execution advanced past the engine-wide step cap
    #[error("execution {0} exceeded the maximum step count {1}")]
    MaxStepsExceeded(Uuid, u32),

    // =========================================================================
    // Time
    // =========================================================================
    /// Whole-execution budget expired
    #[error("execution {0} timed out")]
    ExecutionTimeout(Uuid),

    /// Per-wait budget expired
    #[error("execution {0} wait timed out")]
    WaitTimeout(Uuid),

    /// Per-step budget expired
    #[error("step {step_id} in execution {execution_id} timed out")]
    StepTimeout { execution_id: Uuid, step_id: String },

    // =========================================================================
    // Token
    // =========================================================================
    /// Token unknown to the store
    #[error("resume token not found")]
    TokenNotFound,

    /// Token was already consumed
    #[error("resume token already used")]
    TokenAlreadyUsed,

    /// Token expired before use
    #[error("resume token expired")]
    TokenExpired,

    /// Token was revoked
    #[error("resume token revoked")]
    TokenRevoked,

    // =========================================================================
    // Job
    // =========================================================================
    /// Running job missed its heartbeat window
    #[error("job stalled: {0}")]
    JobStalled(String),

    /// Job burned through all attempts
    #[error("job exceeded max attempts: {0}")]
    JobExceededAttempts(String),

    /// Job references a handler type nobody registered
    #[error("no handler for job {job_id}: {handler}")]
    NoHandler { job_id: String, handler: String },

    // =========================================================================
    // Infrastructure
    // =========================================================================
    /// Store-level failure (backend specific)
    #[error("store error: {0}")]
    Store(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    /// The stable code for this error
    pub fn code(&self) -> &'static str {
        match self {
            Self::FlowNotFound { .. } => "FLOW_NOT_FOUND",
            Self::StepNotFound { .. } => "STEP_NOT_FOUND",
            Self::HandlerNotFound(_) => "HANDLER_NOT_FOUND",
            Self::PipeValidationFailed { .. } => "PIPE_VALIDATION_FAILED",
            Self::InputKeyMissing(_) => "INPUT_KEY_MISSING",
            Self::InputPathMissing(_) => "INPUT_PATH_MISSING",
            Self::InputTemplateUnresolved(_) => "INPUT_TEMPLATE_UNRESOLVED",
            Self::ContextKeyLimit { .. } => "CONTEXT_KEY_LIMIT",
            Self::ContextSizeLimit { .. } => "CONTEXT_SIZE_LIMIT",
            Self::ContextDepthLimit { .. } => "CONTEXT_DEPTH_LIMIT",
            Self::ExecutionNotFound(_) => "EXECUTION_NOT_FOUND",
            Self::InvalidExecutionState { .. } => "INVALID_EXECUTION_STATE",
            Self::IdempotencyConflict { .. } => "IDEMPOTENCY_CONFLICT",
            Self::LockContention(_) => "LOCK_CONTENTION",
            Self::MaxStepsExceeded(_, _) => "MAX_STEPS_EXCEEDED",
            Self::ExecutionTimeout(_) => "EXECUTION_TIMEOUT",
            Self::WaitTimeout(_) => "WAIT_TIMEOUT",
            Self::StepTimeout { .. } => "STEP_TIMEOUT",
            Self::TokenNotFound => "TOKEN_NOT_FOUND",
            Self::TokenAlreadyUsed => "TOKEN_ALREADY_USED",
            Self::TokenExpired => "TOKEN_EXPIRED",
            Self::TokenRevoked => "TOKEN_REVOKED",
            Self::JobStalled(_) => "JOB_STALLED",
            Self::JobExceededAttempts(_) => "JOB_EXCEEDED_ATTEMPTS",
            Self::NoHandler { .. } => "NO_HANDLER",
            Self::Store(_) => "STORE_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }

    /// Convert into the persisted error shape
    pub fn to_detail(&self) -> ErrorDetail {
        ErrorDetail::new(self.code(), self.to_string())
    }
}
