//! Execution context: caps, canonical encoding, large-value references
//!
//! The runtime context is a structured-data mapping (`serde_json`), never
//! language-native objects. A canonical encoding (recursively key-sorted
//! JSON) backs deterministic hashing for idempotency keys and job ids.

use serde_json::{Map, Value};

use crate::error::EngineError;

/// The mutable key-value state carried by an execution
pub type ContextMap = Map<String, Value>;

/// Marker key identifying a large-value reference object
pub const REF_KEY: &str = "_ref";

/// Caps applied to every context write
///
/// Exceeding any cap is a hard failure distinct from handler failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextLimits {
    /// Maximum number of top-level keys
    pub max_keys: usize,

    /// Maximum serialized size in bytes
    pub max_size_bytes: usize,

    /// Maximum nesting depth
    pub max_depth: usize,
}

impl Default for ContextLimits {
    fn default() -> Self {
        Self {
            max_keys: 256,
            max_size_bytes: 512 * 1024,
            max_depth: 16,
        }
    }
}

impl ContextLimits {
    /// Validate a context against these caps
    pub fn validate(&self, context: &ContextMap) -> Result<(), EngineError> {
        if context.len() > self.max_keys {
            return Err(EngineError::ContextKeyLimit {
                actual: context.len(),
                limit: self.max_keys,
            });
        }

        let serialized = serde_json::to_string(context)?;
        if serialized.len() > self.max_size_bytes {
            return Err(EngineError::ContextSizeLimit {
                actual: serialized.len(),
                limit: self.max_size_bytes,
            });
        }

        for value in context.values() {
            let depth = value_depth(value);
            if depth > self.max_depth {
                return Err(EngineError::ContextDepthLimit {
                    actual: depth,
                    limit: self.max_depth,
                });
            }
        }

        Ok(())
    }
}

/// Nesting depth of a value (scalars are depth 0)
fn value_depth(value: &Value) -> usize {
    match value {
        Value::Object(map) => 1 + map.values().map(value_depth).max().unwrap_or(0),
        Value::Array(items) => 1 + items.iter().map(value_depth).max().unwrap_or(0),
        _ => 0,
    }
}

/// Canonical JSON encoding with recursively sorted object keys
///
/// Used wherever a deterministic byte representation is required
/// (idempotency hashing, deterministic job ids).
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // Keys and scalars reuse serde_json's escaping
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Reference left in the context when a value is spilled to side storage
///
/// The payload lives in `ContextStorage` keyed by `(executionId, key)`;
/// reads dereference on demand.
#[derive(Debug, Clone, PartialEq)]
pub struct LargeValueRef {
    /// Storage key of the spilled value
    pub storage_key: String,

    /// Short preview of the spilled value
    pub summary: String,

    /// Serialized size of the spilled value in bytes
    pub size: usize,

    /// When the value was spilled
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl LargeValueRef {
    /// Build the in-context reference object
    pub fn to_value(&self) -> Value {
        serde_json::json!({
            REF_KEY: self.storage_key,
            "summary": self.summary,
            "size": self.size,
            "createdAt": self.created_at.timestamp_millis(),
        })
    }

    /// Parse a context value as a reference, if it is one
    pub fn from_value(value: &Value) -> Option<Self> {
        let map = value.as_object()?;
        let storage_key = map.get(REF_KEY)?.as_str()?.to_string();
        Some(Self {
            storage_key,
            summary: map
                .get("summary")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            size: map.get("size").and_then(Value::as_u64).unwrap_or(0) as usize,
            created_at: map
                .get("createdAt")
                .and_then(Value::as_i64)
                .and_then(chrono::DateTime::from_timestamp_millis)
                .unwrap_or_else(chrono::Utc::now),
        })
    }
}

/// Check whether a context value is a large-value reference
pub fn is_ref(value: &Value) -> bool {
    value
        .as_object()
        .is_some_and(|map| map.get(REF_KEY).is_some_and(Value::is_string))
}

/// Short preview used as the `summary` of a spilled value
pub fn summarize(value: &Value) -> String {
    let rendered = value.to_string();
    if rendered.len() <= 120 {
        rendered
    } else {
        let cut = rendered
            .char_indices()
            .take_while(|(i, _)| *i < 117)
            .last()
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(0);
        format!("{}...", &rendered[..cut])
    }
}
