//! Data-store pipe router
//!
//! On a matching step outcome the router builds a table row from the step
//! output (dot-path mappings plus static values) and submits it for
//! insertion. An insert failure is appended to the write-ahead log for
//! replay. Pipe evaluation never fails the step.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, warn};

use flowmonkey_core::selector::lookup_path;
use flowmonkey_core::{EngineEvent, Execution, Flow, Pipe, Step, TableRow, WalEntry};
use flowmonkey_storage::{TableStore, WriteAheadLog};

use crate::dispatcher::EventDispatcher;

/// Routes step outputs into user tables, with WAL fallback
pub struct PipeRouter {
    tables: Arc<dyn TableStore>,
    wal: Arc<dyn WriteAheadLog>,
}

impl PipeRouter {
    /// Create a router over the given stores
    pub fn new(tables: Arc<dyn TableStore>, wal: Arc<dyn WriteAheadLog>) -> Self {
        Self { tables, wal }
    }

    /// Evaluate every pipe of the step whose outcome filter matches
    ///
    /// `step_succeeded` selects between the success and failure filters;
    /// `output` is the handler output (or the error object on failure).
    pub async fn route(
        &self,
        flow: &Flow,
        step: &Step,
        execution: &Execution,
        step_succeeded: bool,
        output: &Value,
        dispatcher: &EventDispatcher,
    ) {
        for pipe in flow.pipes_for(&step.id) {
            if !pipe.on.matches(step_succeeded) {
                continue;
            }
            self.route_one(flow, pipe, execution, output, dispatcher).await;
        }
    }

    async fn route_one(
        &self,
        flow: &Flow,
        pipe: &Pipe,
        execution: &Execution,
        output: &Value,
        dispatcher: &EventDispatcher,
    ) {
        let row = build_row(pipe, output);

        match self
            .tables
            .insert_row(&pipe.table_id, execution.tenant_id.as_deref(), row.clone())
            .await
        {
            Ok(_) => {
                debug!(pipe_id = %pipe.id, table_id = %pipe.table_id, "pipe row inserted");
                dispatcher.emit(EngineEvent::PipeInserted {
                    execution_id: execution.id,
                    pipe_id: pipe.id.clone(),
                    table_id: pipe.table_id.clone(),
                    at: Utc::now(),
                });
            }
            Err(err) => {
                warn!(pipe_id = %pipe.id, table_id = %pipe.table_id, "pipe insert failed: {err}");

                let entry = WalEntry::new(
                    pipe.table_id.clone(),
                    execution.tenant_id.clone(),
                    row,
                    pipe.id.clone(),
                    execution.id,
                    flow.id.clone(),
                    pipe.step_id.clone(),
                    err.to_string(),
                );

                if let Err(wal_err) = self.wal.append(entry).await {
                    // The row is lost only if the WAL itself is down
                    warn!(pipe_id = %pipe.id, "wal append failed: {wal_err}");
                }

                dispatcher.emit(EngineEvent::PipeFailed {
                    execution_id: execution.id,
                    pipe_id: pipe.id.clone(),
                    table_id: pipe.table_id.clone(),
                    error: err.to_string(),
                    at: Utc::now(),
                });
            }
        }
    }
}

/// Apply mappings and static values over the step output
fn build_row(pipe: &Pipe, output: &Value) -> TableRow {
    let mut row = TableRow::new();

    for mapping in &pipe.mappings {
        if let Some(value) = lookup_path(output, &mapping.source_path) {
            row.insert(mapping.column_id.clone(), value.clone());
        }
    }

    if let Some(static_values) = &pipe.static_values {
        for (column_id, value) in static_values {
            row.insert(column_id.clone(), value.clone());
        }
    }

    row
}
