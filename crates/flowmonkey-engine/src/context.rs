//! Handler-facing context capability
//!
//! Wraps the execution's context map for one handler invocation. Reads
//! dereference large-value references on demand; writes over the spill
//! threshold land in side storage with a reference left in the map; every
//! write is validated against the context caps.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use uuid::Uuid;

use flowmonkey_core::context::{is_ref, summarize, LargeValueRef};
use flowmonkey_core::{ContextLimits, ContextMap, ContextOps, EngineError};
use flowmonkey_storage::ContextStorage;

/// Context capability handed to handlers
pub struct ContextHandle {
    execution_id: Uuid,
    shared: Arc<Mutex<ContextMap>>,
    storage: Arc<dyn ContextStorage>,
    limits: ContextLimits,
    spill_threshold: usize,
}

impl ContextHandle {
    /// Wrap a context map for one invocation
    pub fn new(
        execution_id: Uuid,
        context: ContextMap,
        storage: Arc<dyn ContextStorage>,
        limits: ContextLimits,
        spill_threshold: usize,
    ) -> Self {
        Self {
            execution_id,
            shared: Arc::new(Mutex::new(context)),
            storage,
            limits,
            spill_threshold,
        }
    }

    /// Take the (possibly mutated) context back out
    pub fn snapshot(&self) -> ContextMap {
        self.shared.lock().clone()
    }

    /// Spill a value if it exceeds the threshold, returning what should be
    /// stored in the context map
    pub async fn spill_if_large(
        storage: &Arc<dyn ContextStorage>,
        execution_id: Uuid,
        key: &str,
        value: Value,
        spill_threshold: usize,
    ) -> Result<Value, EngineError> {
        let serialized_len = value.to_string().len();
        if serialized_len <= spill_threshold {
            return Ok(value);
        }

        let summary = summarize(&value);
        let storage_key = storage.put(execution_id, key, value).await?;
        Ok(LargeValueRef {
            storage_key,
            summary,
            size: serialized_len,
            created_at: Utc::now(),
        }
        .to_value())
    }
}

#[async_trait]
impl ContextOps for ContextHandle {
    async fn get(&self, key: &str) -> Result<Option<Value>, EngineError> {
        let value = self.shared.lock().get(key).cloned();
        let Some(value) = value else {
            return Ok(None);
        };

        if is_ref(&value) {
            let reference = LargeValueRef::from_value(&value)
                .ok_or_else(|| EngineError::Store(format!("malformed value reference at {key}")))?;
            return Ok(self.storage.get(&reference.storage_key).await?);
        }

        Ok(Some(value))
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), EngineError> {
        let stored = Self::spill_if_large(
            &self.storage,
            self.execution_id,
            key,
            value,
            self.spill_threshold,
        )
        .await?;

        let mut context = self.shared.lock();
        let previous = context.insert(key.to_string(), stored);

        if let Err(err) = self.limits.validate(&context) {
            // Roll the write back so a cap violation leaves the context intact
            match previous {
                Some(previous) => context.insert(key.to_string(), previous),
                None => context.remove(key),
            };
            return Err(err);
        }

        Ok(())
    }

    fn has(&self, key: &str) -> bool {
        self.shared.lock().contains_key(key)
    }

    fn delete(&self, key: &str) -> bool {
        self.shared.lock().remove(key).is_some()
    }

    fn get_all(&self) -> ContextMap {
        self.shared.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowmonkey_storage::InMemoryContextStorage;
    use serde_json::json;

    fn handle_with(limits: ContextLimits, spill_threshold: usize) -> ContextHandle {
        ContextHandle::new(
            Uuid::now_v7(),
            ContextMap::new(),
            Arc::new(InMemoryContextStorage::new()),
            limits,
            spill_threshold,
        )
    }

    #[tokio::test]
    async fn test_set_get_round_trip() {
        let handle = handle_with(ContextLimits::default(), 1024);

        handle.set("name", json!("FlowMonkey")).await.unwrap();
        assert_eq!(handle.get("name").await.unwrap(), Some(json!("FlowMonkey")));
        assert!(handle.has("name"));
        assert!(handle.get("absent").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_large_values_spill_and_dereference() {
        let handle = handle_with(ContextLimits::default(), 16);
        let big = json!({"rows": ["a", "b", "c", "d", "e", "f"]});

        handle.set("payload", big.clone()).await.unwrap();

        // The raw map holds a reference, not the value
        let raw = handle.get_all();
        assert!(is_ref(&raw["payload"]));

        // Reads dereference on demand
        assert_eq!(handle.get("payload").await.unwrap(), Some(big));
    }

    #[tokio::test]
    async fn test_cap_violation_rolls_back() {
        let limits = ContextLimits {
            max_keys: 1,
            ..Default::default()
        };
        let handle = handle_with(limits, 1024);

        handle.set("first", json!(1)).await.unwrap();
        let err = handle.set("second", json!(2)).await.unwrap_err();
        assert_eq!(err.code(), "CONTEXT_KEY_LIMIT");

        // The failed write left no trace
        assert!(!handle.has("second"));
        assert_eq!(handle.get("first").await.unwrap(), Some(json!(1)));
    }

    #[tokio::test]
    async fn test_delete_and_snapshot() {
        let handle = handle_with(ContextLimits::default(), 1024);
        handle.set("a", json!(1)).await.unwrap();

        assert!(handle.delete("a"));
        assert!(!handle.delete("a"));
        assert!(handle.snapshot().is_empty());
    }
}
