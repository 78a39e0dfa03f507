//! Write-ahead log entries for failed pipe inserts
//!
//! When a pipe's table insert fails, the row is appended here and replayed
//! by a background worker until acked. Entries are durable until acked.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::table::TableRow;

/// A pending (or acked) pipe insert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalEntry {
    /// Entry id
    pub id: Uuid,

    /// Target table
    pub table_id: String,

    /// Tenant scope, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,

    /// The row that failed to insert
    pub data: TableRow,

    /// Pipe that produced the row
    pub pipe_id: String,

    /// Originating execution
    pub execution_id: Uuid,

    /// Originating flow
    pub flow_id: String,

    /// Originating step
    pub step_id: String,

    /// Last insert error
    pub error: String,

    /// Insert attempts so far (the original insert counts as one)
    pub attempts: u32,

    pub created_at: DateTime<Utc>,

    /// Whether a replay has succeeded
    pub acked: bool,
}

impl WalEntry {
    /// Create a fresh unacked entry for a failed insert
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        table_id: impl Into<String>,
        tenant_id: Option<String>,
        data: TableRow,
        pipe_id: impl Into<String>,
        execution_id: Uuid,
        flow_id: impl Into<String>,
        step_id: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            table_id: table_id.into(),
            tenant_id,
            data,
            pipe_id: pipe_id.into(),
            execution_id,
            flow_id: flow_id.into(),
            step_id: step_id.into(),
            error: error.into(),
            attempts: 1,
            created_at: Utc::now(),
            acked: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_entry_starts_unacked_with_one_attempt() {
        let data = json!({"order_id": "o-1"}).as_object().unwrap().clone();
        let entry = WalEntry::new(
            "orders-table",
            None,
            data,
            "orders-out",
            Uuid::now_v7(),
            "order-pipeline",
            "process-order",
            "table unavailable",
        );

        assert!(!entry.acked);
        assert_eq!(entry.attempts, 1);
        assert_eq!(entry.error, "table unavailable");
    }

    #[test]
    fn test_entry_serialization_round_trip() {
        let data = json!({"total": 99.99}).as_object().unwrap().clone();
        let entry = WalEntry::new(
            "orders-table",
            Some("tenant-1".to_string()),
            data,
            "p-1",
            Uuid::now_v7(),
            "f",
            "s",
            "boom",
        );

        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["tableId"], "orders-table");
        assert_eq!(json["acked"], false);

        let parsed: WalEntry = serde_json::from_value(json).unwrap();
        assert_eq!(entry, parsed);
    }
}
