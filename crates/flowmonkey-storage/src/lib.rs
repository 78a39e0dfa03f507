//! # Flowmonkey Storage
//!
//! Store contracts the engine depends on, plus the in-memory backends.
//!
//! Each contract is a narrow `async_trait` interface (`ExecutionStore`,
//! `JobStore`, `ResumeTokenStore`, `TableRegistry`, `TableStore`,
//! `WriteAheadLog`, `ContextStorage`, `LockProvider`). The engine is
//! indifferent to storage layout provided the contracts are honored; a
//! relational backend plugs in behind the same traits.

pub mod memory;
pub mod stores;

pub use memory::{
    InMemoryContextStorage, InMemoryExecutionStore, InMemoryJobStore, InMemoryLockProvider,
    InMemoryResumeTokenStore, InMemoryTableStore, InMemoryWal,
};
pub use stores::{
    ContextStorage, ExecutionStore, JobStore, LockLease, LockProvider, ResumeTokenStore,
    StoreError, TableRegistry, TableStore, WriteAheadLog,
};
