//! # Flowmonkey Core
//!
//! Domain types for the durable workflow execution engine: flow and step
//! definitions, the execution runtime record and its state machine, the
//! handler contract with its three-variant outcome, input selectors, jobs,
//! pipes, tables, WAL entries, resume tokens, and the lifecycle event set.
//!
//! This crate carries no I/O; the store contracts live in
//! `flowmonkey-storage` and the engine in `flowmonkey-engine`.

pub mod context;
pub mod error;
pub mod event;
pub mod execution;
pub mod flow;
pub mod handler;
pub mod job;
pub mod pipe;
pub mod selector;
pub mod table;
pub mod token;
pub mod wal;

/// Prelude for common imports
pub mod prelude {
    pub use crate::context::{canonical_json, ContextLimits, ContextMap};
    pub use crate::error::{EngineError, ErrorDetail};
    pub use crate::event::EngineEvent;
    pub use crate::execution::{
        CancelSource, Cancellation, Execution, ExecutionStatus, StepHistoryEntry, TimeoutConfig,
    };
    pub use crate::flow::{Flow, Step, TransitionTarget, Transitions};
    pub use crate::handler::{
        CancellationSignal, CheckpointAccess, ContextOps, ExecutionInfo, HandlerDescriptor,
        HandlerParams, StepHandler, StepOutcome, TokenRequest,
    };
    pub use crate::job::{Job, JobKey, JobStatus};
    pub use crate::pipe::{Pipe, PipeMapping, PipeOn};
    pub use crate::selector::{InputSelector, TemplatePolicy};
    pub use crate::table::{ColumnDef, ColumnType, FilterOp, RowFilter, TableDefinition, TableRow};
    pub use crate::token::{ResumeToken, TokenStatus, TokenValidation};
    pub use crate::wal::WalEntry;
}

// Re-export key types at crate root
pub use context::{canonical_json, ContextLimits, ContextMap};
pub use error::{EngineError, ErrorDetail};
pub use event::EngineEvent;
pub use execution::{
    CancelSource, Cancellation, Execution, ExecutionStatus, StepHistoryEntry, StepOutcomeKind,
    TimeoutConfig,
};
pub use flow::{Flow, Step, TransitionTarget, Transitions};
pub use handler::{
    CancellationSignal, CheckpointAccess, ContextOps, ExecutionInfo, HandlerDescriptor,
    HandlerParams, StepHandler, StepOutcome, TokenRequest,
};
pub use job::{Job, JobKey, JobStatus};
pub use pipe::{Pipe, PipeMapping, PipeOn};
pub use selector::{InputSelector, TemplatePolicy};
pub use table::{ColumnDef, ColumnType, FilterOp, RowFilter, TableDefinition, TableRow};
pub use token::{token_digest, ResumeToken, TokenInvalidReason, TokenStatus, TokenValidation};
pub use wal::WalEntry;
