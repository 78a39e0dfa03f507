//! In-memory ExecutionStore

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use flowmonkey_core::{Execution, ExecutionStatus};

use crate::stores::{ExecutionStore, StoreError};

/// In-memory implementation of [`ExecutionStore`]
///
/// Stores deep copies of every saved execution and provides the same
/// semantics a relational implementation would.
#[derive(Default)]
pub struct InMemoryExecutionStore {
    executions: RwLock<HashMap<Uuid, Execution>>,
}

impl InMemoryExecutionStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored executions
    pub fn len(&self) -> usize {
        self.executions.read().len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.executions.read().is_empty()
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.executions.write().clear();
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn load(&self, execution_id: Uuid) -> Result<Option<Execution>, StoreError> {
        Ok(self.executions.read().get(&execution_id).cloned())
    }

    async fn save(&self, execution: &Execution) -> Result<(), StoreError> {
        self.executions
            .write()
            .insert(execution.id, execution.clone());
        Ok(())
    }

    async fn delete(&self, execution_id: Uuid) -> Result<bool, StoreError> {
        Ok(self.executions.write().remove(&execution_id).is_some())
    }

    async fn list_by_status(
        &self,
        status: ExecutionStatus,
        limit: usize,
    ) -> Result<Vec<Execution>, StoreError> {
        let executions = self.executions.read();
        let mut matched: Vec<Execution> = executions
            .values()
            .filter(|e| e.status == status)
            .cloned()
            .collect();
        matched.sort_by_key(|e| e.created_at);
        matched.truncate(limit);
        Ok(matched)
    }

    async fn list_wake_ready(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Execution>, StoreError> {
        let executions = self.executions.read();
        let mut ready: Vec<Execution> = executions
            .values()
            .filter(|e| e.wake_ready(now))
            .cloned()
            .collect();
        ready.sort_by_key(|e| e.wake_at);
        ready.truncate(limit);
        Ok(ready)
    }

    async fn find_by_idempotency_key(
        &self,
        flow_id: &str,
        key: &str,
    ) -> Result<Option<Execution>, StoreError> {
        let executions = self.executions.read();
        Ok(executions
            .values()
            .find(|e| e.flow_id == flow_id && e.idempotency_key.as_deref() == Some(key))
            .cloned())
    }

    async fn find_children(&self, parent_id: Uuid) -> Result<Vec<Execution>, StoreError> {
        let executions = self.executions.read();
        let mut children: Vec<Execution> = executions
            .values()
            .filter(|e| e.parent_execution_id == Some(parent_id))
            .cloned()
            .collect();
        children.sort_by_key(|e| e.created_at);
        Ok(children)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowmonkey_core::ContextMap;

    fn execution() -> Execution {
        Execution::new("hello", "1.0.0", "greet", ContextMap::new())
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let store = InMemoryExecutionStore::new();
        let exec = execution();

        store.save(&exec).await.unwrap();
        let loaded = store.load(exec.id).await.unwrap().unwrap();
        assert_eq!(loaded, exec);

        assert!(store.load(Uuid::now_v7()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_deep_copies() {
        let store = InMemoryExecutionStore::new();
        let mut exec = execution();

        store.save(&exec).await.unwrap();
        exec.step_count = 99;

        let loaded = store.load(exec.id).await.unwrap().unwrap();
        assert_eq!(loaded.step_count, 0);
    }

    #[tokio::test]
    async fn test_list_by_status() {
        let store = InMemoryExecutionStore::new();

        let pending = execution();
        store.save(&pending).await.unwrap();

        let mut running = execution();
        running.status = ExecutionStatus::Running;
        store.save(&running).await.unwrap();

        let listed = store
            .list_by_status(ExecutionStatus::Running, 10)
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, running.id);
    }

    #[tokio::test]
    async fn test_list_wake_ready_orders_by_wake_time() {
        let store = InMemoryExecutionStore::new();
        let now = Utc::now();

        let mut later = execution();
        later.status = ExecutionStatus::Waiting;
        later.wake_at = Some(now - chrono::Duration::seconds(1));
        store.save(&later).await.unwrap();

        let mut earlier = execution();
        earlier.status = ExecutionStatus::Waiting;
        earlier.wake_at = Some(now - chrono::Duration::seconds(60));
        store.save(&earlier).await.unwrap();

        let mut not_ready = execution();
        not_ready.status = ExecutionStatus::Waiting;
        not_ready.wake_at = Some(now + chrono::Duration::hours(1));
        store.save(&not_ready).await.unwrap();

        let ready = store.list_wake_ready(now, 10).await.unwrap();
        assert_eq!(ready.len(), 2);
        assert_eq!(ready[0].id, earlier.id);
        assert_eq!(ready[1].id, later.id);
    }

    #[tokio::test]
    async fn test_find_by_idempotency_key() {
        let store = InMemoryExecutionStore::new();

        let mut exec = execution();
        exec.idempotency_key = Some("k1".to_string());
        store.save(&exec).await.unwrap();

        let found = store.find_by_idempotency_key("hello", "k1").await.unwrap();
        assert_eq!(found.map(|e| e.id), Some(exec.id));

        assert!(store
            .find_by_idempotency_key("hello", "k2")
            .await
            .unwrap()
            .is_none());
        assert!(store
            .find_by_idempotency_key("other-flow", "k1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_find_children() {
        let store = InMemoryExecutionStore::new();
        let parent = execution();
        store.save(&parent).await.unwrap();

        let mut child = execution();
        child.parent_execution_id = Some(parent.id);
        store.save(&child).await.unwrap();

        let children = store.find_children(parent.id).await.unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].id, child.id);
    }

    #[tokio::test]
    async fn test_delete() {
        let store = InMemoryExecutionStore::new();
        let exec = execution();
        store.save(&exec).await.unwrap();

        assert!(store.delete(exec.id).await.unwrap());
        assert!(!store.delete(exec.id).await.unwrap());
        assert!(store.is_empty());
    }
}
