//! Execution runtime record and lifecycle state machine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::context::ContextMap;
use crate::error::ErrorDetail;

/// Execution lifecycle status
///
/// Terminal statuses never transition again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    /// Created, not yet ticked
    Pending,

    /// Advancing through steps
    Running,

    /// Suspended until `wakeAt` or an external resume
    Waiting,

    /// Cancellation accepted, finalized on the next tick
    Cancelling,

    /// Reached a terminal `null` transition
    Completed,

    /// Terminated with an error
    Failed,

    /// Cancelled by a user, parent, or the system
    Cancelled,
}

impl ExecutionStatus {
    /// Whether this status never transitions again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Waiting => write!(f, "waiting"),
            Self::Cancelling => write!(f, "cancelling"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Who requested cancellation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CancelSource {
    User,
    Parent,
    Timeout,
    System,
}

/// Cancellation details recorded on the execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cancellation {
    pub source: CancelSource,
    pub reason: String,
    pub cancelled_at: DateTime<Utc>,
}

/// Independent timeout budgets, all enforced at tick boundaries
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutConfig {
    /// Whole-execution budget in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_timeout_ms: Option<u64>,

    /// Per-wait budget in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_timeout_ms: Option<u64>,

    /// Per-step budget in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_timeout_ms: Option<u64>,
}

/// Outcome kind recorded in step history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepOutcomeKind {
    Success,
    Failure,
    Wait,
}

/// One completed (or suspended) step, as recorded in history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepHistoryEntry {
    pub step_id: String,

    #[serde(rename = "type")]
    pub step_type: String,

    pub outcome: StepOutcomeKind,

    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
}

/// The mutable runtime record of a flow instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub id: Uuid,

    pub flow_id: String,
    pub flow_version: String,

    /// The step the next tick will run (or the last step, once terminal)
    pub current_step_id: String,

    pub status: ExecutionStatus,

    /// Mutable key-value state; round-trippable through JSON
    pub context: ContextMap,

    /// Number of steps applied so far; monotonically non-decreasing
    pub step_count: u32,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// When a waiting execution becomes wake-ready
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wake_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_started_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,

    /// Step history; present only when recording is enabled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history: Option<Vec<StepHistoryEntry>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_execution_id: Option<Uuid>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_expires_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancellation: Option<Cancellation>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_config: Option<TimeoutConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl Execution {
    /// Create a fresh pending execution
    pub fn new(
        flow_id: impl Into<String>,
        flow_version: impl Into<String>,
        initial_step_id: impl Into<String>,
        context: ContextMap,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            flow_id: flow_id.into(),
            flow_version: flow_version.into(),
            current_step_id: initial_step_id.into(),
            status: ExecutionStatus::Pending,
            context,
            step_count: 0,
            created_at: now,
            updated_at: now,
            wake_at: None,
            wait_reason: None,
            wait_started_at: None,
            error: None,
            history: None,
            tenant_id: None,
            parent_execution_id: None,
            idempotency_key: None,
            idempotency_expires_at: None,
            cancellation: None,
            timeout_config: None,
            metadata: None,
        }
    }

    /// Whether the execution can still advance
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether the idempotency key is still live as of `now`
    pub fn idempotency_live(&self, now: DateTime<Utc>) -> bool {
        self.idempotency_key.is_some()
            && self.idempotency_expires_at.is_none_or(|at| at > now)
    }

    /// Whether a waiting execution is wake-ready as of `now`
    pub fn wake_ready(&self, now: DateTime<Utc>) -> bool {
        self.status == ExecutionStatus::Waiting && self.wake_at.is_some_and(|at| at <= now)
    }

    /// Record a history entry if recording is enabled for this execution
    pub fn record_history(&mut self, entry: StepHistoryEntry) {
        if let Some(history) = self.history.as_mut() {
            history.push(entry);
        }
    }

    /// Clear wait bookkeeping when leaving the waiting state
    pub fn clear_wait(&mut self) {
        self.wake_at = None;
        self.wait_reason = None;
        self.wait_started_at = None;
    }
}
