//! Data-store pipe declarations
//!
//! A pipe is a fire-and-forget route from a step's output into a table row.
//! Pipes are declared on the flow and validated against the table registry
//! at registration time.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Which step outcomes fire the pipe
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipeOn {
    /// Fire on successful steps only
    #[default]
    Success,

    /// Fire on failed steps only
    Failure,

    /// Fire on both outcomes
    Always,
}

impl PipeOn {
    /// Whether the pipe fires for the given step outcome
    pub fn matches(&self, step_succeeded: bool) -> bool {
        match self {
            Self::Success => step_succeeded,
            Self::Failure => !step_succeeded,
            Self::Always => true,
        }
    }
}

/// A single field mapping from step output into a table column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipeMapping {
    /// Dot path into the step output
    pub source_path: String,

    /// Target column id
    pub column_id: String,
}

/// A declarative route from a step output to a table row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pipe {
    /// Pipe id, unique within the flow
    pub id: String,

    /// Step whose output feeds the pipe
    pub step_id: String,

    /// Outcome filter
    #[serde(default)]
    pub on: PipeOn,

    /// Target table
    pub table_id: String,

    /// Field mappings applied over the step output
    pub mappings: Vec<PipeMapping>,

    /// Fixed column values merged into every row
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub static_values: Option<Map<String, Value>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_pipe_on_matches() {
        assert!(PipeOn::Success.matches(true));
        assert!(!PipeOn::Success.matches(false));
        assert!(PipeOn::Failure.matches(false));
        assert!(!PipeOn::Failure.matches(true));
        assert!(PipeOn::Always.matches(true));
        assert!(PipeOn::Always.matches(false));
    }

    #[test]
    fn test_pipe_document_round_trip() {
        let pipe: Pipe = serde_json::from_value(json!({
            "id": "orders-out",
            "stepId": "process-order",
            "on": "success",
            "tableId": "orders-table",
            "mappings": [
                {"sourcePath": "orderId", "columnId": "order_id"},
                {"sourcePath": "total", "columnId": "total"}
            ],
            "staticValues": {"source": "pipeline"}
        }))
        .unwrap();

        assert_eq!(pipe.on, PipeOn::Success);
        assert_eq!(pipe.mappings.len(), 2);
        assert_eq!(
            pipe.static_values.as_ref().unwrap().get("source"),
            Some(&json!("pipeline"))
        );

        let json = serde_json::to_value(&pipe).unwrap();
        let parsed: Pipe = serde_json::from_value(json).unwrap();
        assert_eq!(pipe, parsed);
    }

    #[test]
    fn test_pipe_on_defaults_to_success() {
        let pipe: Pipe = serde_json::from_value(json!({
            "id": "p",
            "stepId": "s",
            "tableId": "t",
            "mappings": []
        }))
        .unwrap();
        assert_eq!(pipe.on, PipeOn::Success);
    }
}
