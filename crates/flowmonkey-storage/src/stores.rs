//! Store contracts the engine depends on
//!
//! Each contract is a narrow `async_trait` interface. Implementations must
//! be thread-safe and support concurrent access; all engine invariants rely
//! on state-preconditioned updates (a claim checks the current status), an
//! advisory lock scoped per execution, and deterministic ids collapsing
//! concurrent creates.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use flowmonkey_core::{
    EngineError, ErrorDetail, Execution, ExecutionStatus, Job, ResumeToken, RowFilter,
    TableDefinition, TableRow, WalEntry,
};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Execution not found
    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),

    /// Job not found
    #[error("job not found: {0}")]
    JobNotFound(String),

    /// Table not found
    #[error("table not found: {0}")]
    TableNotFound(String),

    /// Table already registered
    #[error("table already exists: {0}")]
    DuplicateTable(String),

    /// Row rejected by table validation
    #[error("row rejected by table {table_id}: {message}")]
    RowRejected { table_id: String, message: String },

    /// WAL entry not found
    #[error("wal entry not found: {0}")]
    WalEntryNotFound(Uuid),

    /// Backend-specific failure
    #[error("backend error: {0}")]
    Backend(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        EngineError::Store(err.to_string())
    }
}

/// Persistence for execution records
#[async_trait]
pub trait ExecutionStore: Send + Sync + 'static {
    /// Load an execution by id
    async fn load(&self, execution_id: Uuid) -> Result<Option<Execution>, StoreError>;

    /// Write an execution (insert or replace, deep copy)
    async fn save(&self, execution: &Execution) -> Result<(), StoreError>;

    /// Delete an execution; returns whether it existed
    async fn delete(&self, execution_id: Uuid) -> Result<bool, StoreError>;

    /// Executions currently in the given status
    async fn list_by_status(
        &self,
        status: ExecutionStatus,
        limit: usize,
    ) -> Result<Vec<Execution>, StoreError>;

    /// Waiting executions whose wake time has elapsed
    async fn list_wake_ready(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Execution>, StoreError>;

    /// Look up a live execution by `(flowId, idempotencyKey)`
    async fn find_by_idempotency_key(
        &self,
        flow_id: &str,
        key: &str,
    ) -> Result<Option<Execution>, StoreError>;

    /// Direct children of an execution
    async fn find_children(&self, parent_id: Uuid) -> Result<Vec<Execution>, StoreError>;
}

/// An acquired advisory lock lease
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockLease {
    /// Locked key
    pub key: String,

    /// Unique owner of this acquisition
    pub owner: Uuid,

    /// When the lease lapses on its own
    pub expires_at: DateTime<Utc>,
}

/// Advisory locks scoped per execution
///
/// Leases are short-lived; an expired lease is free for the taking even if
/// never released (crash safety).
#[async_trait]
pub trait LockProvider: Send + Sync + 'static {
    /// Try to acquire the lock; `None` under contention
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockLease>, StoreError>;

    /// Release a held lease; a stale lease is ignored
    async fn release(&self, lease: &LockLease) -> Result<(), StoreError>;
}

/// Persistence for lease-guarded job records
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Insert-if-absent by deterministic id; concurrent callers converge on
    /// the same record. Returns `(job, created)`.
    async fn get_or_create(&self, job: Job) -> Result<(Job, bool), StoreError>;

    /// Load a job by id
    async fn get(&self, job_id: &str) -> Result<Option<Job>, StoreError>;

    /// Pending jobs, oldest first
    async fn list_pending(&self, limit: usize) -> Result<Vec<Job>, StoreError>;

    /// pending → running, only while attempts remain; records the runner
    /// and starts the heartbeat clock. False under contention.
    async fn claim(&self, job_id: &str, runner_id: &str) -> Result<bool, StoreError>;

    /// As [`claim`](JobStore::claim), additionally binding a unique
    /// instance id for this attempt
    async fn claim_with_instance(
        &self,
        job_id: &str,
        runner_id: &str,
        instance_id: &str,
    ) -> Result<bool, StoreError>;

    /// Extend the lease; only the claiming runner may extend
    async fn heartbeat(&self, job_id: &str, runner_id: &str) -> Result<bool, StoreError>;

    /// running → completed, guarded by runner identity
    async fn complete(
        &self,
        job_id: &str,
        runner_id: &str,
        result: Value,
    ) -> Result<bool, StoreError>;

    /// running → failed, guarded by runner identity
    async fn fail(
        &self,
        job_id: &str,
        runner_id: &str,
        error: ErrorDetail,
    ) -> Result<bool, StoreError>;

    /// Cancel a non-terminal job
    async fn cancel(&self, job_id: &str) -> Result<bool, StoreError>;

    /// Running jobs whose heartbeat lapsed three intervals ago
    async fn find_stalled(&self, now: DateTime<Utc>) -> Result<Vec<Job>, StoreError>;

    /// Return a stalled running job to pending if attempts remain
    async fn reset_stalled(&self, job_id: &str) -> Result<bool, StoreError>;

    /// Persist a checkpoint; accepted only from the live instance
    async fn save_checkpoint(
        &self,
        job_id: &str,
        instance_id: &str,
        checkpoint: Value,
    ) -> Result<bool, StoreError>;

    /// Read the latest checkpoint; reads are open
    async fn get_checkpoint(&self, job_id: &str) -> Result<Option<Value>, StoreError>;

    /// Report progress; accepted only from the live instance
    async fn update_progress(
        &self,
        job_id: &str,
        instance_id: &str,
        progress: Value,
    ) -> Result<bool, StoreError>;
}

/// Persistence for resume tokens, indexed by token digest
#[async_trait]
pub trait ResumeTokenStore: Send + Sync + 'static {
    /// Store a freshly issued token record
    async fn insert(&self, token: ResumeToken) -> Result<(), StoreError>;

    /// Load a token record by digest
    async fn get(&self, digest: &str) -> Result<Option<ResumeToken>, StoreError>;

    /// active → used; false if the token was not active
    async fn mark_used(&self, digest: &str, now: DateTime<Utc>) -> Result<bool, StoreError>;

    /// active → revoked; false if the token was not active
    async fn revoke(&self, digest: &str) -> Result<bool, StoreError>;

    /// All tokens issued for an execution
    async fn list_by_execution(&self, execution_id: Uuid)
        -> Result<Vec<ResumeToken>, StoreError>;

    /// Revoke every active token of an execution; returns the count
    async fn revoke_all(&self, execution_id: Uuid) -> Result<u32, StoreError>;

    /// Bulk-transition expired actives to expired; returns the count
    async fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<u32, StoreError>;
}

/// Registry of user-defined table definitions
#[async_trait]
pub trait TableRegistry: Send + Sync + 'static {
    /// Register a table; duplicate ids are rejected
    async fn create_table(&self, definition: TableDefinition) -> Result<(), StoreError>;

    /// Load a table definition
    async fn get_table(&self, table_id: &str) -> Result<Option<TableDefinition>, StoreError>;

    /// All registered tables
    async fn list_tables(&self) -> Result<Vec<TableDefinition>, StoreError>;

    /// Remove a table definition; returns whether it existed
    async fn delete_table(&self, table_id: &str) -> Result<bool, StoreError>;
}

/// Row storage for user-defined tables
#[async_trait]
pub trait TableStore: Send + Sync + 'static {
    /// Insert a row; validated against the table definition
    async fn insert_row(
        &self,
        table_id: &str,
        tenant_id: Option<&str>,
        row: TableRow,
    ) -> Result<Uuid, StoreError>;

    /// Load a row by id
    async fn get_row(&self, table_id: &str, row_id: Uuid) -> Result<Option<TableRow>, StoreError>;

    /// Rows matching every filter (`eq, neq, gt, gte, lt, lte, like, in`)
    async fn query_rows(
        &self,
        table_id: &str,
        filters: &[RowFilter],
        limit: usize,
    ) -> Result<Vec<TableRow>, StoreError>;

    /// Delete a row; returns whether it existed
    async fn delete_row(&self, table_id: &str, row_id: Uuid) -> Result<bool, StoreError>;
}

/// Write-ahead log for failed pipe inserts
#[async_trait]
pub trait WriteAheadLog: Send + Sync + 'static {
    /// Append an unacked entry
    async fn append(&self, entry: WalEntry) -> Result<(), StoreError>;

    /// Unacked entries, oldest first
    async fn read_pending(&self, limit: usize) -> Result<Vec<WalEntry>, StoreError>;

    /// Mark an entry delivered
    async fn ack(&self, entry_id: Uuid) -> Result<bool, StoreError>;

    /// Record a failed replay attempt
    async fn record_failure(&self, entry_id: Uuid, error: &str) -> Result<(), StoreError>;

    /// Drop acked entries; returns the count removed
    async fn compact(&self) -> Result<u32, StoreError>;
}

/// Side storage for context values over the spill threshold
#[async_trait]
pub trait ContextStorage: Send + Sync + 'static {
    /// Store a value under `(executionId, key)`; returns the storage key
    async fn put(
        &self,
        execution_id: Uuid,
        key: &str,
        value: Value,
    ) -> Result<String, StoreError>;

    /// Load a spilled value by storage key
    async fn get(&self, storage_key: &str) -> Result<Option<Value>, StoreError>;

    /// Drop all spilled values of an execution; returns the count
    async fn delete_for_execution(&self, execution_id: Uuid) -> Result<u32, StoreError>;
}
