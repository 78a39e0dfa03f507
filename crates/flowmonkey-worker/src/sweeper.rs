//! Wake sweeper
//!
//! Ticks wake-ready executions on an interval: waiting executions whose
//! `wakeAt` elapsed without an external resume, including executions parked
//! on jobs whose results are ready to surface. Lock contention with another
//! runner's tick is expected and skipped.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, instrument, warn};

use flowmonkey_core::EngineError;
use flowmonkey_engine::Engine;

/// Sweeper configuration
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Scan interval
    pub interval: Duration,

    /// Executions ticked per scan
    pub batch_size: usize,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            batch_size: 50,
        }
    }
}

/// Drives wake-ready executions forward
pub struct WakeSweeper {
    engine: Arc<Engine>,
    config: SweeperConfig,
}

impl WakeSweeper {
    /// Create a sweeper over an engine
    pub fn new(engine: Arc<Engine>, config: SweeperConfig) -> Self {
        Self { engine, config }
    }

    /// One scan: tick every wake-ready execution once
    #[instrument(skip(self))]
    pub async fn sweep_once(&self) -> Result<usize, EngineError> {
        let ready = self
            .engine
            .stores()
            .executions
            .list_wake_ready(Utc::now(), self.config.batch_size)
            .await?;

        let mut ticked = 0;
        for execution in ready {
            match self.engine.tick(execution.id).await {
                Ok(_) => ticked += 1,
                Err(EngineError::LockContention(_)) => {
                    debug!(execution_id = %execution.id, "skipped: tick in flight elsewhere");
                }
                Err(err) => {
                    warn!(execution_id = %execution.id, "wake tick failed: {err}");
                }
            }
        }

        Ok(ticked)
    }

    /// Sweep on the configured interval until shutdown
    pub async fn run_until_shutdown(
        &self,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> Result<(), EngineError> {
        let mut ticker = tokio::time::interval(self.config.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.sweep_once().await {
                        warn!("wake sweep failed: {err}");
                    }
                }
                _ = shutdown_rx.changed() => break,
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use flowmonkey_core::{
        ContextMap, ExecutionStatus, HandlerDescriptor, HandlerParams, StepHandler, StepOutcome,
    };
    use flowmonkey_engine::{CreateOptions, EngineStores};
    use serde_json::json;

    struct ShortNap;

    #[async_trait]
    impl StepHandler for ShortNap {
        fn descriptor(&self) -> HandlerDescriptor {
            HandlerDescriptor::new("short-nap")
        }

        async fn execute(&self, _params: HandlerParams) -> StepOutcome {
            StepOutcome::wait(Utc::now() - ChronoDuration::seconds(1))
                .with_reason("already wake-ready")
        }
    }

    async fn engine_with_nap_flow() -> Arc<Engine> {
        let engine = Engine::new(EngineStores::in_memory());
        engine.register_handler(Arc::new(ShortNap)).unwrap();
        engine
            .register_flow(
                serde_json::from_value(json!({
                    "id": "nap",
                    "version": "1.0.0",
                    "initialStepId": "nap",
                    "steps": {
                        "nap": {
                            "id": "nap",
                            "type": "short-nap",
                            "transitions": {"onSuccess": null}
                        }
                    }
                }))
                .unwrap(),
            )
            .await
            .unwrap();
        Arc::new(engine)
    }

    #[tokio::test]
    async fn test_sweep_ticks_wake_ready_executions() {
        let engine = engine_with_nap_flow().await;
        let created = engine
            .create("nap", ContextMap::new(), CreateOptions::default())
            .await
            .unwrap();

        // First tick parks the execution with an already-elapsed wake time
        engine.tick(created.execution.id).await.unwrap();
        let parked = engine.get(created.execution.id).await.unwrap().unwrap();
        assert_eq!(parked.status, ExecutionStatus::Waiting);

        let sweeper = WakeSweeper::new(engine.clone(), SweeperConfig::default());
        let ticked = sweeper.sweep_once().await.unwrap();
        assert_eq!(ticked, 1);

        // The wake path routed the step's success transition to the end
        let woken = engine.get(created.execution.id).await.unwrap().unwrap();
        assert_eq!(woken.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_sweep_with_nothing_ready() {
        let engine = engine_with_nap_flow().await;
        let sweeper = WakeSweeper::new(engine, SweeperConfig::default());
        assert_eq!(sweeper.sweep_once().await.unwrap(), 0);
    }
}
