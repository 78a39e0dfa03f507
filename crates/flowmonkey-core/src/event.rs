//! Lifecycle events emitted by the engine
//!
//! Events fan out through the in-process dispatcher; they are never on the
//! critical path. `event_type()` returns the dotted public name.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorDetail;
use crate::execution::CancelSource;

/// A lifecycle event with its payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    // =========================================================================
    // Execution Lifecycle Events
    // =========================================================================
    /// A new execution record was written
    ExecutionCreated {
        execution_id: Uuid,
        flow_id: String,
        flow_version: String,
        at: DateTime<Utc>,
    },

    /// First tick moved the execution out of pending
    ExecutionStarted {
        execution_id: Uuid,
        at: DateTime<Utc>,
    },

    /// The execution suspended on a wait outcome
    ExecutionWaiting {
        execution_id: Uuid,
        step_id: String,
        wake_at: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        wait_reason: Option<String>,
        at: DateTime<Utc>,
    },

    /// A waiting execution moved back to running
    ExecutionResumed {
        execution_id: Uuid,
        step_id: String,
        at: DateTime<Utc>,
    },

    /// The execution reached a terminal `null` transition
    ExecutionCompleted {
        execution_id: Uuid,
        at: DateTime<Utc>,
    },

    /// The execution terminated with an error
    ExecutionFailed {
        execution_id: Uuid,
        error: ErrorDetail,
        at: DateTime<Utc>,
    },

    /// The execution was cancelled
    ExecutionCancelled {
        execution_id: Uuid,
        source: CancelSource,
        reason: String,
        at: DateTime<Utc>,
    },

    // =========================================================================
    // Step Events
    // =========================================================================
    /// A step invocation began
    StepStarted {
        execution_id: Uuid,
        step_id: String,
        step_type: String,
        at: DateTime<Utc>,
    },

    /// A step invocation succeeded
    StepCompleted {
        execution_id: Uuid,
        step_id: String,
        step_type: String,
        duration_ms: u64,
        at: DateTime<Utc>,
    },

    /// A step invocation failed
    StepFailed {
        execution_id: Uuid,
        step_id: String,
        step_type: String,
        duration_ms: u64,
        error: ErrorDetail,
        at: DateTime<Utc>,
    },

    // =========================================================================
    // Pipe Events
    // =========================================================================
    /// A pipe row landed in its table
    PipeInserted {
        execution_id: Uuid,
        pipe_id: String,
        table_id: String,
        at: DateTime<Utc>,
    },

    /// A pipe insert failed and was WAL-logged
    PipeFailed {
        execution_id: Uuid,
        pipe_id: String,
        table_id: String,
        error: String,
        at: DateTime<Utc>,
    },
}

impl EngineEvent {
    /// The dotted public event name
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ExecutionCreated { .. } => "execution.created",
            Self::ExecutionStarted { .. } => "execution.started",
            Self::ExecutionWaiting { .. } => "execution.waiting",
            Self::ExecutionResumed { .. } => "execution.resumed",
            Self::ExecutionCompleted { .. } => "execution.completed",
            Self::ExecutionFailed { .. } => "execution.failed",
            Self::ExecutionCancelled { .. } => "execution.cancelled",
            Self::StepStarted { .. } => "step.started",
            Self::StepCompleted { .. } => "step.completed",
            Self::StepFailed { .. } => "step.failed",
            Self::PipeInserted { .. } => "pipe.inserted",
            Self::PipeFailed { .. } => "pipe.failed",
        }
    }

    /// The execution this event belongs to
    pub fn execution_id(&self) -> Uuid {
        match self {
            Self::ExecutionCreated { execution_id, .. }
            | Self::ExecutionStarted { execution_id, .. }
            | Self::ExecutionWaiting { execution_id, .. }
            | Self::ExecutionResumed { execution_id, .. }
            | Self::ExecutionCompleted { execution_id, .. }
            | Self::ExecutionFailed { execution_id, .. }
            | Self::ExecutionCancelled { execution_id, .. }
            | Self::StepStarted { execution_id, .. }
            | Self::StepCompleted { execution_id, .. }
            | Self::StepFailed { execution_id, .. }
            | Self::PipeInserted { execution_id, .. }
            | Self::PipeFailed { execution_id, .. } => *execution_id,
        }
    }

    /// Serialize for sinks that want raw JSON
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_names_are_dotted() {
        let event = EngineEvent::ExecutionCreated {
            execution_id: Uuid::now_v7(),
            flow_id: "hello".to_string(),
            flow_version: "1.0.0".to_string(),
            at: Utc::now(),
        };
        assert_eq!(event.event_type(), "execution.created");

        let event = EngineEvent::PipeFailed {
            execution_id: Uuid::now_v7(),
            pipe_id: "p".to_string(),
            table_id: "t".to_string(),
            error: "boom".to_string(),
            at: Utc::now(),
        };
        assert_eq!(event.event_type(), "pipe.failed");
    }

    #[test]
    fn test_event_serialization() {
        let execution_id = Uuid::now_v7();
        let event = EngineEvent::StepCompleted {
            execution_id,
            step_id: "greet".to_string(),
            step_type: "greet".to_string(),
            duration_ms: 12,
            at: Utc::now(),
        };

        let json = event.to_json();
        assert_eq!(json["type"], "step_completed");
        assert_eq!(json["duration_ms"], 12);

        let parsed: EngineEvent = serde_json::from_value(json).unwrap();
        assert_eq!(event, parsed);
    }

    #[test]
    fn test_execution_id_extraction() {
        let execution_id = Uuid::now_v7();
        let event = EngineEvent::ExecutionCompleted {
            execution_id,
            at: Utc::now(),
        };
        assert_eq!(event.execution_id(), execution_id);
    }
}
