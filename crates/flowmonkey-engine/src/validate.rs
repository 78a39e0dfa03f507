//! Flow validation at registration time
//!
//! A flow is rejected when its graph is not closed (missing initial step,
//! dangling transition targets), when a step references an unregistered
//! handler type, or when a pipe's table linkage is broken (missing table,
//! missing column, required column left uncovered). Every issue is reported;
//! one bad flow never registers partially.

use std::collections::HashSet;
use std::sync::Arc;

use flowmonkey_core::{EngineError, Flow, InputSelector};
use flowmonkey_storage::TableRegistry;

use crate::registry::HandlerRegistry;

/// Validate a flow against the handler registry and table definitions
///
/// Returns all issues at once; the flow registers only when the list is
/// empty.
pub async fn validate_flow(
    flow: &Flow,
    handlers: &HandlerRegistry,
    tables: &Arc<dyn TableRegistry>,
) -> Result<(), EngineError> {
    let mut errors = Vec::new();

    if !flow.steps.contains_key(&flow.initial_step_id) {
        errors.push(format!(
            "STEP_NOT_FOUND: initial step '{}' is not defined",
            flow.initial_step_id
        ));
    }

    for (key, step) in &flow.steps {
        if key != &step.id {
            errors.push(format!(
                "STEP_NOT_FOUND: step keyed '{key}' declares id '{}'",
                step.id
            ));
        }

        if !handlers.contains(&step.step_type) {
            errors.push(format!(
                "HANDLER_NOT_FOUND: step '{}' uses unregistered handler type '{}'",
                step.id, step.step_type
            ));
        }

        for target in step.transitions.targets() {
            if !flow.steps.contains_key(target) {
                errors.push(format!(
                    "STEP_NOT_FOUND: step '{}' routes to undefined step '{target}'",
                    step.id
                ));
            }
        }

        if let InputSelector::Template { template } = &step.input {
            if template.chars().any(char::is_control) {
                errors.push(format!(
                    "INPUT_TEMPLATE_UNRESOLVED: step '{}' template contains control characters",
                    step.id
                ));
            }
        }
    }

    for pipe in &flow.pipes {
        if !flow.steps.contains_key(&pipe.step_id) {
            errors.push(format!(
                "PIPE_VALIDATION_FAILED: pipe '{}' references undefined step '{}'",
                pipe.id, pipe.step_id
            ));
        }

        let Some(table) = tables.get_table(&pipe.table_id).await? else {
            errors.push(format!(
                "PIPE_VALIDATION_FAILED: pipe '{}' references unknown table '{}'",
                pipe.id, pipe.table_id
            ));
            continue;
        };

        let mut covered: HashSet<&str> = HashSet::new();

        for mapping in &pipe.mappings {
            if table.column(&mapping.column_id).is_none() {
                errors.push(format!(
                    "PIPE_VALIDATION_FAILED: pipe '{}' maps to unknown column '{}' of table '{}'",
                    pipe.id, mapping.column_id, pipe.table_id
                ));
            } else {
                covered.insert(mapping.column_id.as_str());
            }
        }

        if let Some(static_values) = &pipe.static_values {
            for column_id in static_values.keys() {
                if table.column(column_id).is_none() {
                    errors.push(format!(
                        "PIPE_VALIDATION_FAILED: pipe '{}' sets unknown column '{column_id}' of table '{}'",
                        pipe.id, pipe.table_id
                    ));
                } else {
                    covered.insert(column_id.as_str());
                }
            }
        }

        for required in table.required_columns() {
            if !covered.contains(required) {
                errors.push(format!(
                    "PIPE_VALIDATION_FAILED: pipe '{}' leaves required column '{required}' of table '{}' unmapped",
                    pipe.id, pipe.table_id
                ));
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(EngineError::PipeValidationFailed { errors })
    }
}
