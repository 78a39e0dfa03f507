//! User-defined table definitions and row filters

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A row as stored and queried
pub type TableRow = Map<String, Value>;

/// Column value type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Text,
    Number,
    Boolean,
    Json,
    Timestamp,
}

/// A column of a user-defined table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnDef {
    /// Column id (referenced by pipe mappings)
    pub id: String,

    /// Display name
    pub name: String,

    /// Value type
    #[serde(rename = "type")]
    pub column_type: ColumnType,

    /// Whether every row must carry this column
    #[serde(default)]
    pub required: bool,
}

/// A user-defined table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableDefinition {
    /// Table id
    pub id: String,

    /// Ordered column definitions
    pub columns: Vec<ColumnDef>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TableDefinition {
    /// Look up a column by id
    pub fn column(&self, column_id: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.id == column_id)
    }

    /// Column ids of required columns
    pub fn required_columns(&self) -> impl Iterator<Item = &str> {
        self.columns
            .iter()
            .filter(|c| c.required)
            .map(|c| c.id.as_str())
    }

    /// Validate that a row carries every required column
    pub fn validate_row(&self, row: &TableRow) -> Result<(), String> {
        for column in self.required_columns() {
            match row.get(column) {
                Some(value) if !value.is_null() => {}
                _ => return Err(format!("required column missing: {column}")),
            }
        }
        Ok(())
    }
}

/// Filter operator for row queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Like,
    In,
}

/// A single column predicate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowFilter {
    /// Column id the predicate applies to
    pub column: String,

    /// Comparison operator
    pub op: FilterOp,

    /// Comparison operand (`in` takes an array)
    pub value: Value,
}

impl RowFilter {
    /// Build an equality filter
    pub fn eq(column: impl Into<String>, value: Value) -> Self {
        Self {
            column: column.into(),
            op: FilterOp::Eq,
            value,
        }
    }

    /// Evaluate the predicate against a row
    pub fn matches(&self, row: &TableRow) -> bool {
        let Some(actual) = row.get(&self.column) else {
            return false;
        };

        match self.op {
            FilterOp::Eq => actual == &self.value,
            FilterOp::Neq => actual != &self.value,
            FilterOp::Gt => compare(actual, &self.value).is_some_and(|o| o.is_gt()),
            FilterOp::Gte => compare(actual, &self.value).is_some_and(|o| o.is_ge()),
            FilterOp::Lt => compare(actual, &self.value).is_some_and(|o| o.is_lt()),
            FilterOp::Lte => compare(actual, &self.value).is_some_and(|o| o.is_le()),
            FilterOp::Like => like_matches(actual, &self.value),
            FilterOp::In => self
                .value
                .as_array()
                .is_some_and(|candidates| candidates.contains(actual)),
        }
    }
}

/// Ordering between two values; numbers and strings are comparable
fn compare(left: &Value, right: &Value) -> Option<std::cmp::Ordering> {
    match (left, right) {
        (Value::Number(l), Value::Number(r)) => l.as_f64()?.partial_cmp(&r.as_f64()?),
        (Value::String(l), Value::String(r)) => Some(l.cmp(r)),
        _ => None,
    }
}

/// SQL-style `like` with `%` wildcards at either end
fn like_matches(actual: &Value, pattern: &Value) -> bool {
    let (Some(actual), Some(pattern)) = (actual.as_str(), pattern.as_str()) else {
        return false;
    };

    match (pattern.strip_prefix('%'), pattern.strip_suffix('%')) {
        (Some(rest), _) if rest.ends_with('%') => {
            actual.contains(rest.trim_end_matches('%'))
        }
        (Some(suffix), None) => actual.ends_with(suffix),
        (None, Some(prefix)) => actual.starts_with(prefix),
        (None, None) => actual == pattern,
        _ => actual.contains(pattern.trim_matches('%')),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn orders_table() -> TableDefinition {
        serde_json::from_value(json!({
            "id": "orders-table",
            "columns": [
                {"id": "order_id", "name": "Order", "type": "text", "required": true},
                {"id": "total", "name": "Total", "type": "number", "required": true},
                {"id": "note", "name": "Note", "type": "text"}
            ],
            "createdAt": "2026-01-01T00:00:00Z",
            "updatedAt": "2026-01-01T00:00:00Z"
        }))
        .unwrap()
    }

    fn row(value: Value) -> TableRow {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_validate_row_requires_required_columns() {
        let table = orders_table();

        let complete = row(json!({"order_id": "o-1", "total": 10}));
        assert!(table.validate_row(&complete).is_ok());

        let missing = row(json!({"order_id": "o-1"}));
        let err = table.validate_row(&missing).unwrap_err();
        assert!(err.contains("total"));

        let null_value = row(json!({"order_id": "o-1", "total": null}));
        assert!(table.validate_row(&null_value).is_err());
    }

    #[test]
    fn test_filter_eq_and_neq() {
        let r = row(json!({"status": "paid", "total": 10}));
        assert!(RowFilter::eq("status", json!("paid")).matches(&r));
        assert!(!RowFilter::eq("status", json!("open")).matches(&r));

        let neq = RowFilter {
            column: "status".to_string(),
            op: FilterOp::Neq,
            value: json!("open"),
        };
        assert!(neq.matches(&r));
    }

    #[test]
    fn test_filter_numeric_ordering() {
        let r = row(json!({"total": 42.5}));

        let gt = RowFilter {
            column: "total".to_string(),
            op: FilterOp::Gt,
            value: json!(40),
        };
        assert!(gt.matches(&r));

        let lte = RowFilter {
            column: "total".to_string(),
            op: FilterOp::Lte,
            value: json!(42.5),
        };
        assert!(lte.matches(&r));

        let lt = RowFilter {
            column: "total".to_string(),
            op: FilterOp::Lt,
            value: json!(42.5),
        };
        assert!(!lt.matches(&r));
    }

    #[test]
    fn test_filter_like() {
        let r = row(json!({"name": "FlowMonkey"}));

        let contains = RowFilter {
            column: "name".to_string(),
            op: FilterOp::Like,
            value: json!("%Monk%"),
        };
        assert!(contains.matches(&r));

        let prefix = RowFilter {
            column: "name".to_string(),
            op: FilterOp::Like,
            value: json!("Flow%"),
        };
        assert!(prefix.matches(&r));

        let suffix = RowFilter {
            column: "name".to_string(),
            op: FilterOp::Like,
            value: json!("%key"),
        };
        assert!(suffix.matches(&r));
    }

    #[test]
    fn test_filter_in() {
        let r = row(json!({"status": "paid"}));

        let filter = RowFilter {
            column: "status".to_string(),
            op: FilterOp::In,
            value: json!(["open", "paid"]),
        };
        assert!(filter.matches(&r));

        let filter = RowFilter {
            column: "status".to_string(),
            op: FilterOp::In,
            value: json!(["open"]),
        };
        assert!(!filter.matches(&r));
    }

    #[test]
    fn test_filter_missing_column_never_matches() {
        let r = row(json!({"total": 1}));
        assert!(!RowFilter::eq("absent", json!(null)).matches(&r));
    }
}
