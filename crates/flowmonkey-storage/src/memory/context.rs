//! In-memory side storage for spilled context values

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use uuid::Uuid;

use crate::stores::{ContextStorage, StoreError};

/// In-memory implementation of [`ContextStorage`]
///
/// Storage keys are `"<executionId>/<key>"`.
#[derive(Default)]
pub struct InMemoryContextStorage {
    values: RwLock<HashMap<String, Value>>,
}

impl InMemoryContextStorage {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of spilled values
    pub fn len(&self) -> usize {
        self.values.read().len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.values.read().is_empty()
    }
}

fn storage_key(execution_id: Uuid, key: &str) -> String {
    format!("{execution_id}/{key}")
}

#[async_trait]
impl ContextStorage for InMemoryContextStorage {
    async fn put(
        &self,
        execution_id: Uuid,
        key: &str,
        value: Value,
    ) -> Result<String, StoreError> {
        let storage_key = storage_key(execution_id, key);
        self.values.write().insert(storage_key.clone(), value);
        Ok(storage_key)
    }

    async fn get(&self, storage_key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.values.read().get(storage_key).cloned())
    }

    async fn delete_for_execution(&self, execution_id: Uuid) -> Result<u32, StoreError> {
        let prefix = format!("{execution_id}/");
        let mut values = self.values.write();
        let before = values.len();
        values.retain(|key, _| !key.starts_with(&prefix));
        Ok((before - values.len()) as u32)
    }
}
