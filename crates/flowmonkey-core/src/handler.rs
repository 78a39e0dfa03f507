//! Step handler contract
//!
//! A handler is the code unit implementing a step type. It receives the
//! resolved input plus capability objects (context access, cancellation
//! signal, optional checkpointing) and returns exactly one of three
//! outcomes: success with output, failure with a coded error, or wait with
//! a wake time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::context::ContextMap;
use crate::error::{EngineError, ErrorDetail};
use crate::flow::Step;

/// A handler's request that the engine issue a resume token for this wait
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRequest {
    /// Token lifetime in milliseconds; `None` means no expiry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in_ms: Option<u64>,

    /// Opaque metadata stored with the token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// The result of a handler invocation
///
/// Enumerated as a tagged union: the engine routes on the outcome tag, the
/// payload carries the variant data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum StepOutcome {
    /// The step succeeded; `output` lands under the step's output key
    Success { output: Value },

    /// The step failed; routing follows the step's `onFailure` transition
    Failure { error: ErrorDetail },

    /// Suspend the execution until `wakeAt` or an external resume
    Wait {
        wake_at: DateTime<Utc>,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        wait_reason: Option<String>,

        /// Ask the engine to issue a one-shot resume token
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resume_token: Option<TokenRequest>,

        /// Data surfaced to whoever resumes the execution
        #[serde(default, skip_serializing_if = "Option::is_none")]
        wait_data: Option<Value>,
    },
}

impl StepOutcome {
    /// Success with the given output
    pub fn success(output: Value) -> Self {
        Self::Success { output }
    }

    /// Failure with a coded error
    pub fn failure(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failure {
            error: ErrorDetail::new(code, message),
        }
    }

    /// Wait until the given wake time
    pub fn wait(wake_at: DateTime<Utc>) -> Self {
        Self::Wait {
            wake_at,
            wait_reason: None,
            resume_token: None,
            wait_data: None,
        }
    }

    /// Set the wait reason (no-op for other variants)
    pub fn with_reason(self, reason: impl Into<String>) -> Self {
        match self {
            Self::Wait {
                wake_at,
                resume_token,
                wait_data,
                ..
            } => Self::Wait {
                wake_at,
                wait_reason: Some(reason.into()),
                resume_token,
                wait_data,
            },
            other => other,
        }
    }

    /// Request a resume token for this wait (no-op for other variants)
    pub fn with_token(self, request: TokenRequest) -> Self {
        match self {
            Self::Wait {
                wake_at,
                wait_reason,
                wait_data,
                ..
            } => Self::Wait {
                wake_at,
                wait_reason,
                resume_token: Some(request),
                wait_data,
            },
            other => other,
        }
    }
}

/// Registration metadata attached to a handler at register time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerDescriptor {
    /// Step type this handler implements
    pub step_type: String,

    /// Human description
    pub description: Option<String>,

    /// Whether the handler executes through the job subsystem
    /// (checkpointed, lease-based, run by a runner process)
    pub stateful: bool,
}

impl HandlerDescriptor {
    /// Descriptor for a plain in-tick handler
    pub fn new(step_type: impl Into<String>) -> Self {
        Self {
            step_type: step_type.into(),
            description: None,
            stateful: false,
        }
    }

    /// Set the description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Mark the handler as stateful (job-backed)
    pub fn stateful(mut self) -> Self {
        self.stateful = true;
        self
    }
}

/// Cooperative cancellation flag observed by handlers between suspension
/// points
#[derive(Debug, Clone, Default)]
pub struct CancellationSignal {
    cancelled: Arc<AtomicBool>,
}

impl CancellationSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether cancellation has been requested
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }
}

/// Context access handed to handlers (get/set/has/delete/getAll)
///
/// Reads dereference large-value references on demand; writes spill
/// oversized values to side storage.
#[async_trait]
pub trait ContextOps: Send + Sync {
    /// Read a key, dereferencing large-value references
    async fn get(&self, key: &str) -> Result<Option<Value>, EngineError>;

    /// Write a key, spilling oversized values
    async fn set(&self, key: &str, value: Value) -> Result<(), EngineError>;

    /// Whether a key is present
    fn has(&self, key: &str) -> bool;

    /// Remove a key; returns whether it was present
    fn delete(&self, key: &str) -> bool;

    /// A copy of the raw context (references not dereferenced)
    fn get_all(&self) -> ContextMap;
}

/// Checkpoint and progress access for stateful handlers
///
/// Writes are accepted only while the backing `(jobId, instanceId)` is the
/// live owner; reads are open.
#[async_trait]
pub trait CheckpointAccess: Send + Sync {
    /// Persist a checkpoint for the current attempt
    async fn save(&self, checkpoint: Value) -> Result<(), EngineError>;

    /// Load the latest visible checkpoint
    async fn load(&self) -> Result<Option<Value>, EngineError>;

    /// Report progress for observers
    async fn update_progress(&self, progress: Value) -> Result<(), EngineError>;
}

/// Read-only execution facts handed to handlers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionInfo {
    pub id: Uuid,
    pub flow_id: String,
    pub tenant_id: Option<String>,
    pub parent_execution_id: Option<Uuid>,
}

/// Everything a handler receives for one invocation
pub struct HandlerParams {
    /// Input resolved through the step's selector
    pub input: Value,

    /// The step being executed (id, config, transitions)
    pub step: Step,

    /// Context capability
    pub context: Arc<dyn ContextOps>,

    /// Execution facts
    pub execution: ExecutionInfo,

    /// Cooperative cancellation
    pub signal: CancellationSignal,

    /// Present for stateful (job-backed) invocations
    pub checkpoint: Option<Arc<dyn CheckpointAccess>>,
}

/// The polymorphic capability the engine invokes for each step
///
/// # Example
///
/// ```ignore
/// struct Greet;
///
/// #[async_trait]
/// impl StepHandler for Greet {
///     fn descriptor(&self) -> HandlerDescriptor {
///         HandlerDescriptor::new("greet")
///     }
///
///     async fn execute(&self, params: HandlerParams) -> StepOutcome {
///         let name = params.input["name"].as_str().unwrap_or("world");
///         StepOutcome::success(json!({ "greeting": format!("Hello, {name}!") }))
///     }
/// }
/// ```
#[async_trait]
pub trait StepHandler: Send + Sync {
    /// Registration metadata (type, statefulness)
    fn descriptor(&self) -> HandlerDescriptor;

    /// Execute one step invocation
    async fn execute(&self, params: HandlerParams) -> StepOutcome;
}
