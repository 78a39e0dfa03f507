//! Persistent job records with deterministic identity
//!
//! A job is a unit of stateful execution carried out by a runner distinct
//! from the caller. Its id is a digest of `(executionId, stepId, handler,
//! input)` so repeated enqueues coalesce onto one record.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::context::canonical_json;
use crate::error::ErrorDetail;

/// Default lease heartbeat interval in milliseconds
pub const DEFAULT_HEARTBEAT_MS: u64 = 10_000;

/// Default attempt budget
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Job lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// The identity of a job: the digest input
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobKey {
    pub execution_id: Uuid,
    pub step_id: String,
    pub handler: String,
    pub input: Value,
}

impl JobKey {
    /// Deterministic job id: first 128 bits of the SHA-256 of the canonical
    /// encoding, hex
    pub fn job_id(&self) -> String {
        let encoded = canonical_json(&serde_json::json!({
            "executionId": self.execution_id,
            "stepId": self.step_id,
            "handler": self.handler,
            "input": self.input,
        }));
        let digest = Sha256::digest(encoded.as_bytes());
        hex::encode(&digest[..16])
    }
}

/// A persistent, lease-guarded work record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Deterministic id (see [`JobKey::job_id`])
    pub id: String,

    pub execution_id: Uuid,
    pub step_id: String,

    /// Handler type the runner invokes
    pub handler: String,

    pub status: JobStatus,

    /// Resolved step input captured at enqueue time
    pub input: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,

    /// Claiming runner, while running
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runner_id: Option<String>,

    /// Unique id of the current attempt (checkpoint write scope)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_at: Option<DateTime<Utc>>,

    /// Expected heartbeat interval; a claim is stalled after three missed
    /// intervals
    pub heartbeat_ms: u64,

    pub attempts: u32,
    pub max_attempts: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<Value>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a pending job from its identity key
    pub fn new(key: &JobKey) -> Self {
        let now = Utc::now();
        Self {
            id: key.job_id(),
            execution_id: key.execution_id,
            step_id: key.step_id.clone(),
            handler: key.handler.clone(),
            status: JobStatus::Pending,
            input: key.input.clone(),
            result: None,
            error: None,
            runner_id: None,
            instance_id: None,
            heartbeat_at: None,
            heartbeat_ms: DEFAULT_HEARTBEAT_MS,
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            checkpoint: None,
            progress: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Set the attempt budget
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the heartbeat interval
    pub fn with_heartbeat_ms(mut self, heartbeat_ms: u64) -> Self {
        self.heartbeat_ms = heartbeat_ms;
        self
    }

    /// Whether a running claim has missed three heartbeat intervals as of
    /// `now`
    pub fn is_stalled(&self, now: DateTime<Utc>) -> bool {
        if self.status != JobStatus::Running {
            return false;
        }
        let Some(heartbeat_at) = self.heartbeat_at else {
            return false;
        };
        now - heartbeat_at > Duration::milliseconds(3 * self.heartbeat_ms as i64)
    }

    /// Whether another claim attempt is allowed
    pub fn attempts_remaining(&self) -> bool {
        self.attempts < self.max_attempts
    }
}
