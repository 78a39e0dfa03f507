//! The execution engine
//!
//! Coordinates one tick of an execution: load → guard → resolve input →
//! invoke handler → apply outcome → persist → emit events → enqueue pipes.
//! One logical advance per execution at a time, enforced by the store's
//! lock provider; a tick's persistence and event emission are committed
//! before control returns to the caller.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use flowmonkey_core::{
    CancelSource, Cancellation, ContextLimits, ContextMap, ContextOps, EngineError, EngineEvent,
    ErrorDetail, Execution, ExecutionInfo, ExecutionStatus, Flow, Job, JobKey, JobStatus,
    HandlerParams, CancellationSignal, Step, StepHandler, StepHistoryEntry, StepOutcome,
    StepOutcomeKind, TemplatePolicy, TimeoutConfig, TokenInvalidReason, TransitionTarget,
};
use flowmonkey_storage::{
    ContextStorage, ExecutionStore, InMemoryContextStorage, InMemoryExecutionStore,
    InMemoryJobStore, InMemoryLockProvider, InMemoryResumeTokenStore, InMemoryTableStore,
    InMemoryWal, JobStore, LockProvider, ResumeTokenStore, TableRegistry, TableStore,
    WriteAheadLog,
};

use crate::context::ContextHandle;
use crate::dispatcher::{DeliveryMode, EventDispatcher, EventSink};
use crate::pipes::PipeRouter;
use crate::registry::{FlowRegistry, HandlerRegistry};
use crate::tokens::ResumeTokenManager;
use crate::validate::validate_flow;

/// Context key receiving resume data when the waiting step has no output key
const RESUME_DATA_KEY: &str = "resumeData";

/// Context key receiving a wait outcome's `waitData`
const WAIT_DATA_KEY: &str = "waitData";

/// Wait-reason prefix marking an execution parked on a job
const JOB_WAIT_PREFIX: &str = "job:";

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Record step history on new executions
    pub record_history: bool,

    /// Engine-wide cap on steps per execution
    pub max_steps: u32,

    /// Default advance cap for one `run` call
    pub run_step_limit: u32,

    /// TTL of the per-execution tick lock
    pub lock_ttl: Duration,

    /// Context caps applied on every write
    pub context_limits: ContextLimits,

    /// Values above this serialized size spill to context storage
    pub spill_threshold: usize,

    /// Policy for unresolved template expressions
    pub template_policy: TemplatePolicy,

    /// Default idempotency window (24 h)
    pub default_idempotency_window_ms: u64,

    /// Heartbeat interval stamped on engine-created jobs
    pub job_heartbeat_ms: u64,

    /// Attempt budget stamped on engine-created jobs
    pub job_max_attempts: u32,

    /// How long a job-parked execution sleeps between job checks
    pub job_poll_delay: Duration,

    /// Event delivery mode
    pub delivery_mode: DeliveryMode,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            record_history: true,
            max_steps: 10_000,
            run_step_limit: 100,
            lock_ttl: Duration::from_secs(30),
            context_limits: ContextLimits::default(),
            spill_threshold: 64 * 1024,
            template_policy: TemplatePolicy::Fail,
            default_idempotency_window_ms: 24 * 60 * 60 * 1000,
            job_heartbeat_ms: 10_000,
            job_max_attempts: 3,
            job_poll_delay: Duration::from_secs(1),
            delivery_mode: DeliveryMode::Queued,
        }
    }
}

impl EngineConfig {
    /// Toggle history recording
    pub fn with_record_history(mut self, record: bool) -> Self {
        self.record_history = record;
        self
    }

    /// Set the engine-wide step cap
    pub fn with_max_steps(mut self, max_steps: u32) -> Self {
        self.max_steps = max_steps;
        self
    }

    /// Set the context caps
    pub fn with_context_limits(mut self, limits: ContextLimits) -> Self {
        self.context_limits = limits;
        self
    }

    /// Set the spill threshold
    pub fn with_spill_threshold(mut self, bytes: usize) -> Self {
        self.spill_threshold = bytes;
        self
    }

    /// Set the template policy
    pub fn with_template_policy(mut self, policy: TemplatePolicy) -> Self {
        self.template_policy = policy;
        self
    }

    /// Set the event delivery mode
    pub fn with_delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.delivery_mode = mode;
        self
    }
}

/// The store contracts the engine advances against
#[derive(Clone)]
pub struct EngineStores {
    pub executions: Arc<dyn ExecutionStore>,
    pub jobs: Arc<dyn JobStore>,
    pub tokens: Arc<dyn ResumeTokenStore>,
    pub table_registry: Arc<dyn TableRegistry>,
    pub tables: Arc<dyn TableStore>,
    pub wal: Arc<dyn WriteAheadLog>,
    pub locks: Arc<dyn LockProvider>,
    pub context: Arc<dyn ContextStorage>,
}

impl EngineStores {
    /// A full in-memory store set
    pub fn in_memory() -> Self {
        let tables = Arc::new(InMemoryTableStore::new());
        Self {
            executions: Arc::new(InMemoryExecutionStore::new()),
            jobs: Arc::new(InMemoryJobStore::new()),
            tokens: Arc::new(InMemoryResumeTokenStore::new()),
            table_registry: tables.clone(),
            tables,
            wal: Arc::new(InMemoryWal::new()),
            locks: Arc::new(InMemoryLockProvider::new()),
            context: Arc::new(InMemoryContextStorage::new()),
        }
    }
}

/// Options for [`Engine::create`]
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Pin a specific flow version; default is the highest registered
    pub version: Option<String>,

    pub tenant_id: Option<String>,
    pub parent_execution_id: Option<Uuid>,

    /// Collapse duplicate creates onto one execution
    pub idempotency_key: Option<String>,

    /// Idempotency window; 0 disables key persistence
    pub idempotency_window_ms: Option<u64>,

    pub timeout_config: Option<TimeoutConfig>,
    pub metadata: Option<Value>,

    /// Override the engine-wide history flag for this execution
    pub record_history: Option<bool>,
}

/// Result of [`Engine::create`]
#[derive(Debug, Clone)]
pub struct CreateResult {
    pub execution: Execution,

    /// True only when a new record was written
    pub created: bool,

    /// True when an existing execution satisfied the idempotency key
    pub idempotency_hit: bool,
}

/// Result of one [`Engine::tick`] (and of [`Engine::run`])
#[derive(Debug, Clone)]
pub struct TickResult {
    /// True when the execution is terminal
    pub done: bool,

    pub status: ExecutionStatus,

    /// Set while the execution is waiting
    pub wake_at: Option<DateTime<Utc>>,

    /// Set when the execution failed
    pub error: Option<ErrorDetail>,

    /// Raw resume token, present on the tick that issued one
    pub resume_token: Option<String>,
}

impl TickResult {
    fn settled(execution: &Execution) -> Self {
        Self {
            done: execution.is_terminal(),
            status: execution.status,
            wake_at: execution.wake_at,
            error: execution.error.clone(),
            resume_token: None,
        }
    }
}

/// Options for [`Engine::run`]
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Ignore `wakeAt` delays and advance wake-driven steps immediately
    pub simulate_time: bool,

    /// Advance cap for this call; default is the engine's `run_step_limit`
    pub max_steps: Option<u32>,
}

/// Result of [`Engine::cancel`]
#[derive(Debug, Clone)]
pub struct CancelResult {
    /// False when the execution was already terminal
    pub cancelled: bool,

    pub previous_status: ExecutionStatus,

    /// Active resume tokens revoked by this cancellation
    pub tokens_invalidated: u32,
}

/// The durable workflow execution engine
///
/// # Example
///
/// ```ignore
/// let engine = Engine::new(EngineStores::in_memory());
/// engine.register_handler(Arc::new(Greet))?;
/// engine.register_flow(flow).await?;
///
/// let created = engine.create("hello", context, CreateOptions::default()).await?;
/// let result = engine.run(created.execution.id, RunOptions::default()).await?;
/// ```
pub struct Engine {
    stores: EngineStores,
    flows: FlowRegistry,
    handlers: HandlerRegistry,
    dispatcher: EventDispatcher,
    tokens: ResumeTokenManager,
    pipes: PipeRouter,
    config: EngineConfig,
}

impl Engine {
    /// Create an engine with default configuration
    pub fn new(stores: EngineStores) -> Self {
        Self::with_config(stores, EngineConfig::default())
    }

    /// Create an engine with custom configuration
    pub fn with_config(stores: EngineStores, config: EngineConfig) -> Self {
        let tokens = ResumeTokenManager::new(stores.tokens.clone());
        let pipes = PipeRouter::new(stores.tables.clone(), stores.wal.clone());
        Self {
            stores,
            flows: FlowRegistry::new(),
            handlers: HandlerRegistry::new(),
            dispatcher: EventDispatcher::new(config.delivery_mode),
            tokens,
            pipes,
            config,
        }
    }

    /// The flow registry
    pub fn flows(&self) -> &FlowRegistry {
        &self.flows
    }

    /// The handler registry
    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    /// The resume token manager
    pub fn tokens(&self) -> &ResumeTokenManager {
        &self.tokens
    }

    /// The store set
    pub fn stores(&self) -> &EngineStores {
        &self.stores
    }

    /// Subscribe a lifecycle event sink
    pub fn subscribe(&self, sink: Arc<dyn EventSink>) {
        self.dispatcher.subscribe(sink);
    }

    /// Register a handler
    pub fn register_handler(&self, handler: Arc<dyn StepHandler>) -> Result<(), EngineError> {
        self.handlers
            .register(handler)
            .map_err(|e| EngineError::Store(e.to_string()))
    }

    /// Validate and register a flow
    pub async fn register_flow(&self, flow: Flow) -> Result<(), EngineError> {
        validate_flow(&flow, &self.handlers, &self.stores.table_registry).await?;
        self.flows
            .register(flow)
            .map_err(|e| EngineError::Store(e.to_string()))
    }

    // =========================================================================
    // Public Operations
    // =========================================================================

    /// Create an execution of a flow
    #[instrument(skip(self, initial_context, options))]
    pub async fn create(
        &self,
        flow_id: &str,
        initial_context: ContextMap,
        options: CreateOptions,
    ) -> Result<CreateResult, EngineError> {
        let now = Utc::now();
        let flow = self
            .flows
            .get(flow_id, options.version.as_deref())
            .ok_or_else(|| EngineError::FlowNotFound {
                flow_id: flow_id.to_string(),
                version: options.version.clone().unwrap_or_else(|| "latest".to_string()),
            })?;

        if let Some(key) = &options.idempotency_key {
            if let Some(existing) = self
                .stores
                .executions
                .find_by_idempotency_key(flow_id, key)
                .await?
            {
                if existing.idempotency_live(now) {
                    debug!(%existing.id, "idempotency hit");
                    return Ok(CreateResult {
                        execution: existing,
                        created: false,
                        idempotency_hit: true,
                    });
                }
            }
        }

        self.config.context_limits.validate(&initial_context)?;

        let mut execution = Execution::new(
            flow.id.clone(),
            flow.version.clone(),
            flow.initial_step_id.clone(),
            initial_context,
        );
        execution.tenant_id = options.tenant_id;
        execution.parent_execution_id = options.parent_execution_id;
        execution.timeout_config = options.timeout_config;
        execution.metadata = options.metadata;

        if options.record_history.unwrap_or(self.config.record_history) {
            execution.history = Some(Vec::new());
        }

        if let Some(key) = options.idempotency_key {
            let window_ms = options
                .idempotency_window_ms
                .unwrap_or(self.config.default_idempotency_window_ms);
            if window_ms > 0 {
                execution.idempotency_key = Some(key);
                execution.idempotency_expires_at =
                    Some(now + chrono::Duration::milliseconds(window_ms as i64));
            }
        }

        self.stores.executions.save(&execution).await?;
        info!(execution_id = %execution.id, flow_id = %execution.flow_id, "execution created");

        self.dispatcher.emit(EngineEvent::ExecutionCreated {
            execution_id: execution.id,
            flow_id: execution.flow_id.clone(),
            flow_version: execution.flow_version.clone(),
            at: now,
        });
        self.dispatcher.drain();

        Ok(CreateResult {
            execution,
            created: true,
            idempotency_hit: false,
        })
    }

    /// Advance an execution exactly one step
    ///
    /// Idempotent against terminal states. Concurrency-safe: contenders on
    /// the execution lock get [`EngineError::LockContention`] without any
    /// mutation.
    #[instrument(skip(self))]
    pub async fn tick(&self, execution_id: Uuid) -> Result<TickResult, EngineError> {
        self.tick_inner(execution_id, false).await
    }

    /// Tick until terminal, waiting, or the advance cap
    #[instrument(skip(self, options))]
    pub async fn run(
        &self,
        execution_id: Uuid,
        options: RunOptions,
    ) -> Result<TickResult, EngineError> {
        let cap = options.max_steps.unwrap_or(self.config.run_step_limit);
        let mut last = self.tick_inner(execution_id, options.simulate_time).await?;

        for _ in 1..cap {
            if last.done {
                return Ok(last);
            }
            if last.status == ExecutionStatus::Waiting {
                let wake_ready = last.wake_at.is_some_and(|at| at <= Utc::now());
                if !options.simulate_time && !wake_ready {
                    return Ok(last);
                }
            }
            last = self.tick_inner(execution_id, options.simulate_time).await?;
        }

        Ok(last)
    }

    /// Read an execution
    pub async fn get(&self, execution_id: Uuid) -> Result<Option<Execution>, EngineError> {
        Ok(self.stores.executions.load(execution_id).await?)
    }

    /// Resume a waiting execution with external data
    ///
    /// When a token is presented it is validated against the current wait
    /// record and consumed atomically with the resume; a second concurrent
    /// use observes `TOKEN_ALREADY_USED`.
    #[instrument(skip(self, data, token))]
    pub async fn resume(
        &self,
        execution_id: Uuid,
        data: Value,
        token: Option<&str>,
    ) -> Result<Execution, EngineError> {
        let lease = self
            .stores
            .locks
            .acquire(&execution_id.to_string(), self.config.lock_ttl)
            .await?
            .ok_or(EngineError::LockContention(execution_id))?;

        let result = self.resume_locked(execution_id, data, token).await;

        self.stores.locks.release(&lease).await?;
        self.dispatcher.drain();
        result
    }

    /// Cancel an execution, cascading to its children
    #[instrument(skip(self, reason))]
    pub async fn cancel(
        &self,
        execution_id: Uuid,
        source: CancelSource,
        reason: &str,
    ) -> Result<CancelResult, EngineError> {
        let result = self.cancel_one(execution_id, source, reason).await?;

        if result.cancelled {
            // Cascade breadth-first; children record source=parent
            let mut frontier = vec![execution_id];
            while let Some(parent_id) = frontier.pop() {
                for child in self.stores.executions.find_children(parent_id).await? {
                    let child_result = self
                        .cancel_one(child.id, CancelSource::Parent, "parent execution cancelled")
                        .await?;
                    if child_result.cancelled {
                        frontier.push(child.id);
                    }
                }
            }
        }

        self.dispatcher.drain();
        Ok(result)
    }

    // =========================================================================
    // Tick Internals
    // =========================================================================

    async fn tick_inner(
        &self,
        execution_id: Uuid,
        force_wake: bool,
    ) -> Result<TickResult, EngineError> {
        // Terminal states short-circuit without taking the lock
        let execution = self
            .stores
            .executions
            .load(execution_id)
            .await?
            .ok_or(EngineError::ExecutionNotFound(execution_id))?;
        if execution.is_terminal() {
            return Ok(TickResult::settled(&execution));
        }

        let lease = self
            .stores
            .locks
            .acquire(&execution_id.to_string(), self.config.lock_ttl)
            .await?
            .ok_or(EngineError::LockContention(execution_id))?;

        let result = self.tick_locked(execution_id, force_wake).await;

        self.stores.locks.release(&lease).await?;
        self.dispatcher.drain();
        result
    }

    async fn tick_locked(
        &self,
        execution_id: Uuid,
        force_wake: bool,
    ) -> Result<TickResult, EngineError> {
        // Reload under the lock so no partial state is visible
        let mut execution = self
            .stores
            .executions
            .load(execution_id)
            .await?
            .ok_or(EngineError::ExecutionNotFound(execution_id))?;

        if execution.is_terminal() {
            return Ok(TickResult::settled(&execution));
        }

        let now = Utc::now();

        if execution.status == ExecutionStatus::Cancelling {
            return self.finalize_cancel(execution, now).await;
        }

        // Whole-execution budget
        if let Some(budget_ms) = execution
            .timeout_config
            .as_ref()
            .and_then(|t| t.execution_timeout_ms)
        {
            if now - execution.created_at > chrono::Duration::milliseconds(budget_ms as i64) {
                return self
                    .fail_execution(execution, EngineError::ExecutionTimeout(execution_id))
                    .await;
            }
        }

        if execution.status == ExecutionStatus::Waiting {
            // Per-wait budget
            if let Some(budget_ms) = execution
                .timeout_config
                .as_ref()
                .and_then(|t| t.wait_timeout_ms)
            {
                if let Some(wait_started_at) = execution.wait_started_at {
                    if now - wait_started_at > chrono::Duration::milliseconds(budget_ms as i64) {
                        return self
                            .fail_execution(execution, EngineError::WaitTimeout(execution_id))
                            .await;
                    }
                }
            }

            if !force_wake && !execution.wake_ready(now) {
                return Ok(TickResult::settled(&execution));
            }

            let parked_on_job = execution
                .wait_reason
                .as_deref()
                .is_some_and(|r| r.starts_with(JOB_WAIT_PREFIX));

            if parked_on_job {
                // Keep the wait reason and clock so a re-park is quiet and
                // the wait budget keeps running across job polls
                execution.status = ExecutionStatus::Running;
                execution.wake_at = None;
                // Fall through to the step dispatch, which re-checks the job
            } else {
                // Wake-time elapsed without an external resume: the waiting
                // step resumes with an empty payload
                let flow = match self.resolve_flow(&execution) {
                    Ok(flow) => flow,
                    Err(err) => return self.fail_execution(execution, err).await,
                };
                return self.apply_wake(execution, &flow, now).await;
            }
        }

        if execution.step_count >= self.config.max_steps {
            let max = self.config.max_steps;
            return self
                .fail_execution(execution, EngineError::MaxStepsExceeded(execution_id, max))
                .await;
        }

        let flow = match self.resolve_flow(&execution) {
            Ok(flow) => flow,
            Err(err) => return self.fail_execution(execution, err).await,
        };
        let Some(step) = flow.step(&execution.current_step_id).cloned() else {
            let err = EngineError::StepNotFound {
                flow_id: execution.flow_id.clone(),
                step_id: execution.current_step_id.clone(),
            };
            return self.fail_execution(execution, err).await;
        };

        let Some((descriptor, handler)) = self.handlers.get(&step.step_type) else {
            let err = EngineError::HandlerNotFound(step.step_type.clone());
            return self.fail_execution(execution, err).await;
        };

        let input = match step
            .input
            .resolve(&execution.context, self.config.template_policy)
        {
            Ok(input) => input,
            Err(err) => return self.fail_execution(execution, err).await,
        };

        if execution.status == ExecutionStatus::Pending {
            execution.status = ExecutionStatus::Running;
            self.dispatcher.emit(EngineEvent::ExecutionStarted {
                execution_id: execution.id,
                at: now,
            });
        }

        if descriptor.stateful {
            return self.tick_job_step(execution, &flow, &step, input, now).await;
        }

        self.invoke_handler(execution, &flow, &step, handler, input, now)
            .await
    }

    /// Invoke a plain (in-tick) handler and apply its outcome
    async fn invoke_handler(
        &self,
        mut execution: Execution,
        flow: &Flow,
        step: &Step,
        handler: Arc<dyn StepHandler>,
        input: Value,
        now: DateTime<Utc>,
    ) -> Result<TickResult, EngineError> {
        self.dispatcher.emit(EngineEvent::StepStarted {
            execution_id: execution.id,
            step_id: step.id.clone(),
            step_type: step.step_type.clone(),
            at: now,
        });

        let handle = Arc::new(ContextHandle::new(
            execution.id,
            execution.context.clone(),
            self.stores.context.clone(),
            self.config.context_limits.clone(),
            self.config.spill_threshold,
        ));

        let params = HandlerParams {
            input,
            step: step.clone(),
            context: handle.clone() as Arc<dyn ContextOps>,
            execution: ExecutionInfo {
                id: execution.id,
                flow_id: execution.flow_id.clone(),
                tenant_id: execution.tenant_id.clone(),
                parent_execution_id: execution.parent_execution_id,
            },
            signal: CancellationSignal::new(),
            checkpoint: None,
        };

        let step_budget = execution
            .timeout_config
            .as_ref()
            .and_then(|t| t.step_timeout_ms)
            .map(Duration::from_millis);

        let outcome = match step_budget {
            Some(budget) => match timeout(budget, handler.execute(params)).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    let err = EngineError::StepTimeout {
                        execution_id: execution.id,
                        step_id: step.id.clone(),
                    };
                    return self.fail_execution(execution, err).await;
                }
            },
            None => handler.execute(params).await,
        };

        // Take handler context mutations back into the record
        execution.context = handle.snapshot();

        let completed_at = Utc::now();
        let duration_ms = (completed_at - now).num_milliseconds().max(0) as u64;
        self.apply_outcome(execution, flow, step, outcome, now, duration_ms)
            .await
    }

    /// Dispatch a stateful step through the job subsystem
    ///
    /// The tick parks the execution on a deterministically-keyed job; a
    /// runner executes it; a later tick surfaces the job's terminal state
    /// as the step outcome.
    async fn tick_job_step(
        &self,
        mut execution: Execution,
        flow: &Flow,
        step: &Step,
        input: Value,
        now: DateTime<Utc>,
    ) -> Result<TickResult, EngineError> {
        let key = JobKey {
            execution_id: execution.id,
            step_id: step.id.clone(),
            handler: step.step_type.clone(),
            input,
        };
        let job = Job::new(&key)
            .with_heartbeat_ms(self.config.job_heartbeat_ms)
            .with_max_attempts(self.config.job_max_attempts);

        let (job, created) = self.stores.jobs.get_or_create(job).await?;
        if created {
            debug!(job_id = %job.id, step_id = %step.id, "enqueued job for stateful step");
            self.dispatcher.emit(EngineEvent::StepStarted {
                execution_id: execution.id,
                step_id: step.id.clone(),
                step_type: step.step_type.clone(),
                at: now,
            });
        }

        match job.status {
            JobStatus::Completed => {
                let output = job.result.clone().unwrap_or(Value::Null);
                let duration_ms =
                    (job.updated_at - job.created_at).num_milliseconds().max(0) as u64;
                execution.clear_wait();
                self.apply_outcome(
                    execution,
                    flow,
                    step,
                    StepOutcome::Success { output },
                    now,
                    duration_ms,
                )
                .await
            }
            JobStatus::Failed => {
                let error = job.error.clone().unwrap_or_else(|| {
                    ErrorDetail::new("JOB_EXCEEDED_ATTEMPTS", "job failed without error detail")
                });
                let duration_ms =
                    (job.updated_at - job.created_at).num_milliseconds().max(0) as u64;
                execution.clear_wait();
                self.apply_outcome(
                    execution,
                    flow,
                    step,
                    StepOutcome::Failure { error },
                    now,
                    duration_ms,
                )
                .await
            }
            JobStatus::Cancelled => {
                let error = ErrorDetail::new("JOB_CANCELLED", "job was cancelled");
                execution.clear_wait();
                self.apply_outcome(
                    execution,
                    flow,
                    step,
                    StepOutcome::Failure { error },
                    now,
                    0,
                )
                .await
            }
            JobStatus::Pending | JobStatus::Running => {
                let first_park = execution
                    .wait_reason
                    .as_deref()
                    .is_none_or(|r| !r.starts_with(JOB_WAIT_PREFIX));

                execution.status = ExecutionStatus::Waiting;
                execution.wake_at = Some(
                    now + chrono::Duration::from_std(self.config.job_poll_delay)
                        .unwrap_or_else(|_| chrono::Duration::zero()),
                );
                execution.wait_reason = Some(format!("{JOB_WAIT_PREFIX}{}", job.id));
                if execution.wait_started_at.is_none() {
                    execution.wait_started_at = Some(now);
                }
                execution.updated_at = now;
                self.stores.executions.save(&execution).await?;

                if first_park {
                    self.dispatcher.emit(EngineEvent::ExecutionWaiting {
                        execution_id: execution.id,
                        step_id: step.id.clone(),
                        wake_at: execution.wake_at.unwrap_or(now),
                        wait_reason: execution.wait_reason.clone(),
                        at: now,
                    });
                }

                Ok(TickResult::settled(&execution))
            }
        }
    }

    /// Apply a step outcome: context write, history, events, pipes, routing
    async fn apply_outcome(
        &self,
        mut execution: Execution,
        flow: &Flow,
        step: &Step,
        outcome: StepOutcome,
        started_at: DateTime<Utc>,
        duration_ms: u64,
    ) -> Result<TickResult, EngineError> {
        let now = Utc::now();

        match outcome {
            StepOutcome::Success { output } => {
                if let Some(output_key) = &step.output_key {
                    let stored = ContextHandle::spill_if_large(
                        &self.stores.context,
                        execution.id,
                        output_key,
                        output.clone(),
                        self.config.spill_threshold,
                    )
                    .await?;
                    execution.context.insert(output_key.clone(), stored);
                }

                if let Err(err) = self.config.context_limits.validate(&execution.context) {
                    return self.fail_execution(execution, err).await;
                }

                execution.step_count += 1;
                execution.record_history(StepHistoryEntry {
                    step_id: step.id.clone(),
                    step_type: step.step_type.clone(),
                    outcome: StepOutcomeKind::Success,
                    started_at,
                    completed_at: now,
                    duration_ms,
                    error: None,
                });

                self.dispatcher.emit(EngineEvent::StepCompleted {
                    execution_id: execution.id,
                    step_id: step.id.clone(),
                    step_type: step.step_type.clone(),
                    duration_ms,
                    at: now,
                });

                self.pipes
                    .route(flow, step, &execution, true, &output, &self.dispatcher)
                    .await;

                match step.transitions.success_target() {
                    TransitionTarget::Next(target) => {
                        execution.current_step_id = target;
                        execution.status = ExecutionStatus::Running;
                    }
                    TransitionTarget::End => {
                        execution.status = ExecutionStatus::Completed;
                        self.dispatcher.emit(EngineEvent::ExecutionCompleted {
                            execution_id: execution.id,
                            at: now,
                        });
                    }
                }

                execution.updated_at = now;
                self.stores.executions.save(&execution).await?;
                Ok(TickResult::settled(&execution))
            }

            StepOutcome::Failure { error } => {
                execution.step_count += 1;
                execution.record_history(StepHistoryEntry {
                    step_id: step.id.clone(),
                    step_type: step.step_type.clone(),
                    outcome: StepOutcomeKind::Failure,
                    started_at,
                    completed_at: now,
                    duration_ms,
                    error: Some(error.clone()),
                });

                self.dispatcher.emit(EngineEvent::StepFailed {
                    execution_id: execution.id,
                    step_id: step.id.clone(),
                    step_type: step.step_type.clone(),
                    duration_ms,
                    error: error.clone(),
                    at: now,
                });

                let error_value =
                    serde_json::to_value(&error).unwrap_or(Value::Null);
                self.pipes
                    .route(flow, step, &execution, false, &error_value, &self.dispatcher)
                    .await;

                match step.transitions.failure_target() {
                    Some(TransitionTarget::Next(target)) => {
                        // Recoverable: continue at the fallback step
                        execution.current_step_id = target;
                        execution.status = ExecutionStatus::Running;
                    }
                    Some(TransitionTarget::End) | None => {
                        execution.status = ExecutionStatus::Failed;
                        execution.error = Some(error.clone());
                        self.dispatcher.emit(EngineEvent::ExecutionFailed {
                            execution_id: execution.id,
                            error,
                            at: now,
                        });
                    }
                }

                execution.updated_at = now;
                self.stores.executions.save(&execution).await?;
                Ok(TickResult::settled(&execution))
            }

            StepOutcome::Wait {
                wake_at,
                wait_reason,
                resume_token,
                wait_data,
            } => {
                if let Some(wait_data) = wait_data {
                    execution
                        .context
                        .insert(WAIT_DATA_KEY.to_string(), wait_data);
                    if let Err(err) = self.config.context_limits.validate(&execution.context) {
                        return self.fail_execution(execution, err).await;
                    }
                }

                let raw_token = match resume_token {
                    Some(request) => Some(
                        self.tokens
                            .generate(
                                execution.id,
                                &step.id,
                                request.expires_in_ms,
                                request.metadata,
                            )
                            .await?,
                    ),
                    None => None,
                };

                execution.status = ExecutionStatus::Waiting;
                execution.wake_at = Some(wake_at);
                execution.wait_reason = wait_reason.clone();
                execution.wait_started_at = Some(now);
                execution.record_history(StepHistoryEntry {
                    step_id: step.id.clone(),
                    step_type: step.step_type.clone(),
                    outcome: StepOutcomeKind::Wait,
                    started_at,
                    completed_at: now,
                    duration_ms,
                    error: None,
                });

                self.dispatcher.emit(EngineEvent::ExecutionWaiting {
                    execution_id: execution.id,
                    step_id: step.id.clone(),
                    wake_at,
                    wait_reason,
                    at: now,
                });

                execution.updated_at = now;
                self.stores.executions.save(&execution).await?;

                let mut result = TickResult::settled(&execution);
                result.resume_token = raw_token;
                Ok(result)
            }
        }
    }

    /// Wake-time elapsed without an external resume: route the waiting step
    /// as a resume with an empty payload
    async fn apply_wake(
        &self,
        mut execution: Execution,
        flow: &Flow,
        now: DateTime<Utc>,
    ) -> Result<TickResult, EngineError> {
        let Some(step) = flow.step(&execution.current_step_id).cloned() else {
            let err = EngineError::StepNotFound {
                flow_id: execution.flow_id.clone(),
                step_id: execution.current_step_id.clone(),
            };
            return self.fail_execution(execution, err).await;
        };

        execution.status = ExecutionStatus::Running;
        execution.clear_wait();
        execution.step_count += 1;

        self.dispatcher.emit(EngineEvent::ExecutionResumed {
            execution_id: execution.id,
            step_id: step.id.clone(),
            at: now,
        });

        let target = step
            .transitions
            .resume_target()
            .unwrap_or_else(|| step.transitions.success_target());
        match target {
            TransitionTarget::Next(target) => {
                execution.current_step_id = target;
            }
            TransitionTarget::End => {
                execution.status = ExecutionStatus::Completed;
                self.dispatcher.emit(EngineEvent::ExecutionCompleted {
                    execution_id: execution.id,
                    at: now,
                });
            }
        }

        execution.updated_at = now;
        self.stores.executions.save(&execution).await?;
        Ok(TickResult::settled(&execution))
    }

    async fn resume_locked(
        &self,
        execution_id: Uuid,
        data: Value,
        token: Option<&str>,
    ) -> Result<Execution, EngineError> {
        let mut execution = self
            .stores
            .executions
            .load(execution_id)
            .await?
            .ok_or(EngineError::ExecutionNotFound(execution_id))?;

        if execution.status != ExecutionStatus::Waiting {
            return Err(EngineError::InvalidExecutionState {
                execution_id,
                status: execution.status.to_string(),
            });
        }

        let now = Utc::now();

        if let Some(raw) = token {
            let validation = self.tokens.validate(raw).await?;
            if let Some(reason) = validation.reason {
                return Err(token_error(reason));
            }

            let record = self
                .tokens
                .get(raw)
                .await?
                .ok_or(EngineError::TokenNotFound)?;
            if record.execution_id != execution_id
                || record.step_id != execution.current_step_id
            {
                // Bound to a different wait record
                return Err(EngineError::TokenNotFound);
            }

            // Atomic with the state change below: exactly one resume wins
            if !self.tokens.mark_used(raw, now).await? {
                return Err(EngineError::TokenAlreadyUsed);
            }
        }

        let flow = self.resolve_flow(&execution)?;
        let Some(step) = flow.step(&execution.current_step_id).cloned() else {
            return Err(EngineError::StepNotFound {
                flow_id: execution.flow_id.clone(),
                step_id: execution.current_step_id.clone(),
            });
        };

        // Merge resume data under the step's output key (or the
        // conventional key), validating caps before committing
        let target_key = step
            .output_key
            .clone()
            .unwrap_or_else(|| RESUME_DATA_KEY.to_string());
        let stored = ContextHandle::spill_if_large(
            &self.stores.context,
            execution.id,
            &target_key,
            data,
            self.config.spill_threshold,
        )
        .await?;

        let mut candidate = execution.context.clone();
        candidate.insert(target_key.clone(), stored.clone());
        self.config.context_limits.validate(&candidate)?;
        execution.context = candidate;

        execution.status = ExecutionStatus::Running;
        execution.clear_wait();
        execution.step_count += 1;

        self.dispatcher.emit(EngineEvent::ExecutionResumed {
            execution_id: execution.id,
            step_id: step.id.clone(),
            at: now,
        });

        let target = step
            .transitions
            .resume_target()
            .unwrap_or_else(|| step.transitions.success_target());
        match target {
            TransitionTarget::Next(target) => {
                execution.current_step_id = target;
            }
            TransitionTarget::End => {
                execution.status = ExecutionStatus::Completed;
                self.dispatcher.emit(EngineEvent::ExecutionCompleted {
                    execution_id: execution.id,
                    at: now,
                });
            }
        }

        execution.updated_at = now;
        self.stores.executions.save(&execution).await?;
        info!(%execution_id, "execution resumed");
        Ok(execution)
    }

    /// Cancel one execution, without cascading
    async fn cancel_one(
        &self,
        execution_id: Uuid,
        source: CancelSource,
        reason: &str,
    ) -> Result<CancelResult, EngineError> {
        let execution = self
            .stores
            .executions
            .load(execution_id)
            .await?
            .ok_or(EngineError::ExecutionNotFound(execution_id))?;

        if execution.is_terminal() {
            return Ok(CancelResult {
                cancelled: false,
                previous_status: execution.status,
                tokens_invalidated: 0,
            });
        }

        // Cancellation is always accepted for non-terminal executions:
        // wait briefly for an in-flight tick, then proceed regardless
        let mut lease = None;
        for _ in 0..50 {
            if let Some(acquired) = self
                .stores
                .locks
                .acquire(&execution_id.to_string(), self.config.lock_ttl)
                .await?
            {
                lease = Some(acquired);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        if lease.is_none() {
            warn!(%execution_id, "cancelling without the tick lock");
        }

        let result = self.cancel_locked(execution_id, source, reason).await;

        if let Some(lease) = lease {
            self.stores.locks.release(&lease).await?;
        }
        result
    }

    async fn cancel_locked(
        &self,
        execution_id: Uuid,
        source: CancelSource,
        reason: &str,
    ) -> Result<CancelResult, EngineError> {
        let mut execution = self
            .stores
            .executions
            .load(execution_id)
            .await?
            .ok_or(EngineError::ExecutionNotFound(execution_id))?;

        if execution.is_terminal() {
            return Ok(CancelResult {
                cancelled: false,
                previous_status: execution.status,
                tokens_invalidated: 0,
            });
        }

        let now = Utc::now();
        let previous_status = execution.status;

        let tokens_invalidated = self.tokens.revoke_all(execution_id).await?;

        // An execution parked on a job takes the job down with it
        if let Some(job_id) = execution
            .wait_reason
            .as_deref()
            .and_then(|r| r.strip_prefix(JOB_WAIT_PREFIX))
        {
            self.stores.jobs.cancel(job_id).await?;
        }

        execution.status = ExecutionStatus::Cancelled;
        execution.cancellation = Some(Cancellation {
            source,
            reason: reason.to_string(),
            cancelled_at: now,
        });
        execution.clear_wait();
        execution.updated_at = now;
        self.stores.executions.save(&execution).await?;

        info!(%execution_id, ?source, "execution cancelled");
        self.dispatcher.emit(EngineEvent::ExecutionCancelled {
            execution_id,
            source,
            reason: reason.to_string(),
            at: now,
        });

        Ok(CancelResult {
            cancelled: true,
            previous_status,
            tokens_invalidated,
        })
    }

    /// A tick observing `cancelling` finalizes it
    async fn finalize_cancel(
        &self,
        mut execution: Execution,
        now: DateTime<Utc>,
    ) -> Result<TickResult, EngineError> {
        execution.status = ExecutionStatus::Cancelled;
        if execution.cancellation.is_none() {
            execution.cancellation = Some(Cancellation {
                source: CancelSource::System,
                reason: "cancellation finalized".to_string(),
                cancelled_at: now,
            });
        }
        execution.clear_wait();
        execution.updated_at = now;
        self.stores.executions.save(&execution).await?;

        let cancellation = execution.cancellation.clone().unwrap_or(Cancellation {
            source: CancelSource::System,
            reason: String::new(),
            cancelled_at: now,
        });
        self.dispatcher.emit(EngineEvent::ExecutionCancelled {
            execution_id: execution.id,
            source: cancellation.source,
            reason: cancellation.reason,
            at: now,
        });

        Ok(TickResult::settled(&execution))
    }

    /// Terminate an execution with an engine error
    async fn fail_execution(
        &self,
        mut execution: Execution,
        err: EngineError,
    ) -> Result<TickResult, EngineError> {
        let detail = err.to_detail();
        warn!(execution_id = %execution.id, code = %detail.code, "execution failed");

        execution.status = ExecutionStatus::Failed;
        execution.error = Some(detail.clone());
        execution.clear_wait();
        execution.updated_at = Utc::now();
        self.stores.executions.save(&execution).await?;

        self.dispatcher.emit(EngineEvent::ExecutionFailed {
            execution_id: execution.id,
            error: detail,
            at: execution.updated_at,
        });

        Ok(TickResult::settled(&execution))
    }

    fn resolve_flow(&self, execution: &Execution) -> Result<Flow, EngineError> {
        self.flows
            .get(&execution.flow_id, Some(&execution.flow_version))
            .ok_or_else(|| EngineError::FlowNotFound {
                flow_id: execution.flow_id.clone(),
                version: execution.flow_version.clone(),
            })
    }
}

fn token_error(reason: TokenInvalidReason) -> EngineError {
    match reason {
        TokenInvalidReason::NotFound => EngineError::TokenNotFound,
        TokenInvalidReason::Used => EngineError::TokenAlreadyUsed,
        TokenInvalidReason::Revoked => EngineError::TokenRevoked,
        TokenInvalidReason::Expired => EngineError::TokenExpired,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use flowmonkey_core::HandlerDescriptor;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl StepHandler for Echo {
        fn descriptor(&self) -> HandlerDescriptor {
            HandlerDescriptor::new("echo")
        }

        async fn execute(&self, params: HandlerParams) -> StepOutcome {
            StepOutcome::success(params.input)
        }
    }

    fn ctx(value: Value) -> ContextMap {
        value.as_object().cloned().unwrap_or_default()
    }

    async fn engine_with_echo_flow() -> Engine {
        let engine = Engine::new(EngineStores::in_memory());
        engine.register_handler(Arc::new(Echo)).unwrap();
        engine
            .register_flow(
                serde_json::from_value(json!({
                    "id": "echo-flow",
                    "version": "1.0.0",
                    "initialStepId": "echo",
                    "steps": {
                        "echo": {
                            "id": "echo",
                            "type": "echo",
                            "input": {"type": "full"},
                            "outputKey": "echoed",
                            "transitions": {"onSuccess": null}
                        }
                    }
                }))
                .unwrap(),
            )
            .await
            .unwrap();
        engine
    }

    #[tokio::test]
    async fn test_create_unknown_flow() {
        let engine = Engine::new(EngineStores::in_memory());
        let err = engine
            .create("nope", ContextMap::new(), CreateOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "FLOW_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_create_validates_context_caps() {
        let engine = engine_with_echo_flow().await;
        let mut huge = ContextMap::new();
        for i in 0..1000 {
            huge.insert(format!("k{i}"), json!(i));
        }

        let err = engine
            .create("echo-flow", huge, CreateOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CONTEXT_KEY_LIMIT");
    }

    #[tokio::test]
    async fn test_create_pins_version_or_latest() {
        let engine = engine_with_echo_flow().await;
        engine
            .register_flow(
                serde_json::from_value(json!({
                    "id": "echo-flow",
                    "version": "2.0.0",
                    "initialStepId": "echo",
                    "steps": {
                        "echo": {"id": "echo", "type": "echo"}
                    }
                }))
                .unwrap(),
            )
            .await
            .unwrap();

        let latest = engine
            .create("echo-flow", ContextMap::new(), CreateOptions::default())
            .await
            .unwrap();
        assert_eq!(latest.execution.flow_version, "2.0.0");

        let pinned = engine
            .create(
                "echo-flow",
                ContextMap::new(),
                CreateOptions {
                    version: Some("1.0.0".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(pinned.execution.flow_version, "1.0.0");
    }

    #[tokio::test]
    async fn test_idempotency_window_zero_skips_key_persistence() {
        let engine = engine_with_echo_flow().await;
        let options = CreateOptions {
            idempotency_key: Some("k1".to_string()),
            idempotency_window_ms: Some(0),
            ..Default::default()
        };

        let first = engine
            .create("echo-flow", ContextMap::new(), options.clone())
            .await
            .unwrap();
        assert!(first.execution.idempotency_key.is_none());

        // Without a persisted key the second create is a fresh execution
        let second = engine
            .create("echo-flow", ContextMap::new(), options)
            .await
            .unwrap();
        assert!(second.created);
        assert_ne!(first.execution.id, second.execution.id);
    }

    #[tokio::test]
    async fn test_tick_unknown_execution() {
        let engine = engine_with_echo_flow().await;
        let err = engine.tick(Uuid::now_v7()).await.unwrap_err();
        assert_eq!(err.code(), "EXECUTION_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_tick_runs_one_step_and_completes() {
        let engine = engine_with_echo_flow().await;
        let created = engine
            .create(
                "echo-flow",
                ctx(json!({"name": "FlowMonkey"})),
                CreateOptions::default(),
            )
            .await
            .unwrap();

        let result = engine.tick(created.execution.id).await.unwrap();
        assert!(result.done);
        assert_eq!(result.status, ExecutionStatus::Completed);

        let execution = engine.get(created.execution.id).await.unwrap().unwrap();
        assert_eq!(execution.step_count, 1);
        assert_eq!(
            execution.context["echoed"],
            json!({"name": "FlowMonkey"})
        );
    }

    #[tokio::test]
    async fn test_tick_holds_the_execution_lock() {
        let engine = engine_with_echo_flow().await;
        let created = engine
            .create("echo-flow", ContextMap::new(), CreateOptions::default())
            .await
            .unwrap();
        let id = created.execution.id;

        // A held lock makes the contender return without advancing
        let lease = engine
            .stores()
            .locks
            .acquire(&id.to_string(), Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();

        let err = engine.tick(id).await.unwrap_err();
        assert_eq!(err.code(), "LOCK_CONTENTION");

        let untouched = engine.get(id).await.unwrap().unwrap();
        assert_eq!(untouched.status, ExecutionStatus::Pending);
        assert_eq!(untouched.step_count, 0);

        engine.stores().locks.release(&lease).await.unwrap();
        assert!(engine.tick(id).await.unwrap().done);
    }

    #[tokio::test]
    async fn test_missing_configuration_fails_execution() {
        let engine = engine_with_echo_flow().await;
        let stores = engine.stores().clone();
        let created = engine
            .create("echo-flow", ContextMap::new(), CreateOptions::default())
            .await
            .unwrap();

        let bare = Engine::new(stores);
        bare.register_flow(
            serde_json::from_value(json!({
                "id": "echo-flow",
                "version": "1.0.0",
                "initialStepId": "echo",
                "steps": {
                    "echo": {"id": "echo", "type": "echo"}
                }
            }))
            .unwrap(),
        )
        .await
        .unwrap_err();

        // The bare engine has the execution but no handlers or flows;
        // ticking fails the execution with a configuration error
        let result = bare.tick(created.execution.id).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.error.unwrap().code, "FLOW_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_max_steps_exceeded() {
        let stores = EngineStores::in_memory();
        let config = EngineConfig::default().with_max_steps(2);
        let engine = Engine::with_config(stores, config);
        engine.register_handler(Arc::new(Echo)).unwrap();
        engine
            .register_flow(
                serde_json::from_value(json!({
                    "id": "loop",
                    "version": "1.0.0",
                    "initialStepId": "spin",
                    "steps": {
                        "spin": {
                            "id": "spin",
                            "type": "echo",
                            "transitions": {"onSuccess": "spin"}
                        }
                    }
                }))
                .unwrap(),
            )
            .await
            .unwrap();

        let created = engine
            .create("loop", ContextMap::new(), CreateOptions::default())
            .await
            .unwrap();

        let result = engine
            .run(created.execution.id, RunOptions::default())
            .await
            .unwrap();
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.error.unwrap().code, "MAX_STEPS_EXCEEDED");
    }
}
