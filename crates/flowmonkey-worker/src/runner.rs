//! Job runner
//!
//! A runner loops: list pending jobs → try to claim each → execute the
//! handler → heartbeat while it runs → complete or fail → poll again.
//! Polling backs off exponentially while the queue is empty (or every
//! listed job was stolen by another runner) and snaps back to the minimum
//! interval when work is found. Runner crashes are tolerated: the reaper
//! resets stalled claims.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use flowmonkey_core::{
    CancellationSignal, ContextOps, EngineError, ErrorDetail, ExecutionInfo, HandlerParams,
    InputSelector, Job, Step, StepOutcome, Transitions,
};
use flowmonkey_engine::{ContextHandle, HandlerRegistry};
use flowmonkey_storage::{ContextStorage, ExecutionStore, JobStore};

use crate::checkpoint::JobCheckpoint;

/// Runner configuration
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Unique runner id (generated if not provided)
    pub runner_id: String,

    /// Maximum jobs fetched per poll
    pub batch_size: usize,

    /// Minimum poll interval (when jobs are available)
    pub min_poll_interval: Duration,

    /// Maximum poll interval (when idle)
    pub max_poll_interval: Duration,

    /// Backoff multiplier applied while idle
    pub backoff_multiplier: f64,

    /// How often a running job heartbeats
    pub heartbeat_interval: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            runner_id: format!("runner-{}", Uuid::now_v7()),
            batch_size: 10,
            min_poll_interval: Duration::from_millis(100),
            max_poll_interval: Duration::from_secs(5),
            backoff_multiplier: 1.5,
            heartbeat_interval: Duration::from_secs(3),
        }
    }
}

impl RunnerConfig {
    /// Set the runner id
    pub fn with_runner_id(mut self, id: impl Into<String>) -> Self {
        self.runner_id = id.into();
        self
    }

    /// Set the poll batch size
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// Set the heartbeat interval
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }
}

/// Adaptive poll backoff: exponential while idle, reset on work
struct PollBackoff {
    current: Duration,
    min: Duration,
    max: Duration,
    multiplier: f64,
}

impl PollBackoff {
    fn new(config: &RunnerConfig) -> Self {
        Self {
            current: config.min_poll_interval,
            min: config.min_poll_interval,
            max: config.max_poll_interval,
            multiplier: config.backoff_multiplier.max(1.0),
        }
    }

    fn reset(&mut self) {
        self.current = self.min;
    }

    fn increase(&mut self) {
        let next = Duration::from_secs_f64(self.current.as_secs_f64() * self.multiplier);
        self.current = next.min(self.max);
    }
}

/// Stats from one poll cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollStats {
    /// Jobs listed by the poll
    pub listed: usize,

    /// Jobs this runner claimed and executed
    pub executed: usize,
}

/// A process that claims and executes jobs
pub struct JobRunner {
    jobs: Arc<dyn JobStore>,
    executions: Arc<dyn ExecutionStore>,
    context_storage: Arc<dyn ContextStorage>,
    handlers: Arc<HandlerRegistry>,
    config: RunnerConfig,
}

impl JobRunner {
    /// Create a runner over the given stores and handler registry
    pub fn new(
        jobs: Arc<dyn JobStore>,
        executions: Arc<dyn ExecutionStore>,
        context_storage: Arc<dyn ContextStorage>,
        handlers: Arc<HandlerRegistry>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            jobs,
            executions,
            context_storage,
            handlers,
            config,
        }
    }

    /// The runner id
    pub fn runner_id(&self) -> &str {
        &self.config.runner_id
    }

    /// One poll cycle: list, claim, execute
    #[instrument(skip(self), fields(runner_id = %self.config.runner_id))]
    pub async fn poll_once(&self) -> Result<PollStats, EngineError> {
        let pending = self.jobs.list_pending(self.config.batch_size).await?;
        let mut stats = PollStats {
            listed: pending.len(),
            executed: 0,
        };

        for job in pending {
            if self.execute_job(job).await? {
                stats.executed += 1;
            }
        }

        Ok(stats)
    }

    /// Poll until the shutdown signal flips, backing off while idle
    pub async fn run_until_shutdown(
        &self,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> Result<(), EngineError> {
        info!(runner_id = %self.config.runner_id, "runner started");
        let mut backoff = PollBackoff::new(&self.config);

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            match self.poll_once().await {
                Ok(stats) if stats.executed > 0 => backoff.reset(),
                Ok(_) => backoff.increase(),
                Err(err) => {
                    warn!(runner_id = %self.config.runner_id, "poll failed: {err}");
                    backoff.increase();
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(backoff.current) => {}
                _ = shutdown_rx.changed() => break,
            }
        }

        info!(runner_id = %self.config.runner_id, "runner stopped");
        Ok(())
    }

    /// Claim and execute one job; false when the claim was lost
    async fn execute_job(&self, job: Job) -> Result<bool, EngineError> {
        let runner_id = self.config.runner_id.clone();

        let Some((_, handler)) = self.handlers.get(&job.handler) else {
            // Unknown handler: claim so the terminal failure sticks
            if self.jobs.claim(&job.id, &runner_id).await? {
                let error = ErrorDetail::new(
                    "NO_HANDLER",
                    format!("no handler registered for type '{}'", job.handler),
                );
                self.jobs.fail(&job.id, &runner_id, error).await?;
            }
            return Ok(false);
        };

        let instance_id = format!("{}-{}", runner_id, Uuid::now_v7());
        if !self
            .jobs
            .claim_with_instance(&job.id, &runner_id, &instance_id)
            .await?
        {
            debug!(job_id = %job.id, "claim lost to another runner");
            return Ok(false);
        }

        debug!(job_id = %job.id, %instance_id, "claimed job");

        // Context snapshot: reads see the execution's state as of the
        // claim; stateful handlers report through results and checkpoints
        let execution = self.executions.load(job.execution_id).await?;
        let context_map = execution
            .as_ref()
            .map(|e| e.context.clone())
            .unwrap_or_default();

        let handle = Arc::new(ContextHandle::new(
            job.execution_id,
            context_map,
            self.context_storage.clone(),
            Default::default(),
            64 * 1024,
        ));

        let signal = CancellationSignal::new();
        let checkpoint = Arc::new(JobCheckpoint::new(
            self.jobs.clone(),
            job.id.clone(),
            instance_id.clone(),
        ));

        let params = HandlerParams {
            input: job.input.clone(),
            step: step_for_job(&job),
            context: handle as Arc<dyn ContextOps>,
            execution: ExecutionInfo {
                id: job.execution_id,
                flow_id: execution
                    .as_ref()
                    .map(|e| e.flow_id.clone())
                    .unwrap_or_default(),
                tenant_id: execution.as_ref().and_then(|e| e.tenant_id.clone()),
                parent_execution_id: execution.and_then(|e| e.parent_execution_id),
            },
            signal: signal.clone(),
            checkpoint: Some(checkpoint),
        };

        let heartbeat = self.spawn_heartbeat(job.id.clone(), signal.clone());
        let outcome = handler.execute(params).await;
        heartbeat.abort();

        match outcome {
            StepOutcome::Success { output } => {
                let accepted = self.jobs.complete(&job.id, &runner_id, output).await?;
                if !accepted {
                    warn!(job_id = %job.id, "completion rejected; lease was reclaimed");
                }
                Ok(accepted)
            }
            StepOutcome::Failure { error } => {
                self.jobs.fail(&job.id, &runner_id, error).await?;
                Ok(true)
            }
            StepOutcome::Wait { .. } => {
                // Stateful handlers checkpoint and return; they do not wait
                let error = ErrorDetail::new(
                    "INVALID_EXECUTION_STATE",
                    "stateful handlers must not return a wait outcome",
                );
                self.jobs.fail(&job.id, &runner_id, error).await?;
                Ok(true)
            }
        }
    }

    /// Heartbeat the lease until aborted; a rejected heartbeat means the
    /// lease was reclaimed, which cancels the handler cooperatively
    fn spawn_heartbeat(
        &self,
        job_id: String,
        signal: CancellationSignal,
    ) -> tokio::task::JoinHandle<()> {
        let jobs = self.jobs.clone();
        let runner_id = self.config.runner_id.clone();
        let interval = self.config.heartbeat_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately
            loop {
                ticker.tick().await;
                match jobs.heartbeat(&job_id, &runner_id).await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(%job_id, "heartbeat rejected; lease lost");
                        signal.cancel();
                        return;
                    }
                    Err(err) => {
                        warn!(%job_id, "heartbeat error: {err}");
                    }
                }
            }
        })
    }
}

/// The step shape a job invocation sees
///
/// Jobs carry their resolved input; the synthetic step binds the handler
/// type with an already-resolved static input.
fn step_for_job(job: &Job) -> Step {
    Step {
        id: job.step_id.clone(),
        step_type: job.handler.clone(),
        config: serde_json::Map::new(),
        input: InputSelector::Static {
            value: job.input.clone(),
        },
        output_key: None,
        transitions: Transitions::default(),
    }
}
