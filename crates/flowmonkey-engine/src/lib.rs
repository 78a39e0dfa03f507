//! # Flowmonkey Engine
//!
//! The durable workflow execution engine: versioned flow and handler
//! registries, flow validation, the tick loop (create / tick / run /
//! resume / cancel), the data-store pipe router with WAL fallback, the
//! resume-token manager, and the lifecycle event dispatcher.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Engine                             │
//! │   (tick loop: load → guard → resolve → invoke → persist)    │
//! └─────────────────────────────────────────────────────────────┘
//!                │                 │                  │
//!                ▼                 ▼                  ▼
//!        ExecutionStore        JobStore        PipeRouter → WAL
//!        (+ LockProvider)   (runner claims)    (tables + replay)
//! ```

pub mod context;
pub mod dispatcher;
pub mod engine;
pub mod pipes;
pub mod registry;
pub mod tokens;
pub mod validate;

/// Prelude for common imports
pub mod prelude {
    pub use crate::context::ContextHandle;
    pub use crate::dispatcher::{CollectingSink, DeliveryMode, EventDispatcher, EventSink};
    pub use crate::engine::{
        CancelResult, CreateOptions, CreateResult, Engine, EngineConfig, EngineStores, RunOptions,
        TickResult,
    };
    pub use crate::pipes::PipeRouter;
    pub use crate::registry::{FlowRegistry, HandlerRegistry, RegistryError};
    pub use crate::tokens::ResumeTokenManager;
    pub use crate::validate::validate_flow;
}

// Re-export key types at crate root
pub use context::ContextHandle;
pub use dispatcher::{CollectingSink, DeliveryMode, EventDispatcher, EventSink};
pub use engine::{
    CancelResult, CreateOptions, CreateResult, Engine, EngineConfig, EngineStores, RunOptions,
    TickResult,
};
pub use pipes::PipeRouter;
pub use registry::{FlowRegistry, HandlerRegistry, RegistryError};
pub use tokens::ResumeTokenManager;
pub use validate::validate_flow;
