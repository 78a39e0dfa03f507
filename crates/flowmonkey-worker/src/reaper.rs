//! Stalled-job reaper
//!
//! Periodically scans running jobs whose heartbeat lapsed three intervals
//! ago, resets those with attempts remaining back to pending, and logs a
//! terminal give-up for the rest.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{info, instrument, warn};

use flowmonkey_core::EngineError;
use flowmonkey_storage::JobStore;

/// Reaper configuration
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// Scan interval
    pub interval: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
        }
    }
}

/// Stats from one reaper sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapStats {
    /// Stalled jobs returned to pending
    pub reset: usize,

    /// Stalled jobs out of attempts (left for operators)
    pub gave_up: usize,
}

/// Resets stalled job claims
pub struct JobReaper {
    jobs: Arc<dyn JobStore>,
    config: ReaperConfig,
}

impl JobReaper {
    /// Create a reaper over the given job store
    pub fn new(jobs: Arc<dyn JobStore>, config: ReaperConfig) -> Self {
        Self { jobs, config }
    }

    /// One sweep over currently stalled jobs
    #[instrument(skip(self))]
    pub async fn sweep_once(&self) -> Result<ReapStats, EngineError> {
        let stalled = self.jobs.find_stalled(Utc::now()).await?;
        let mut stats = ReapStats::default();

        for job in stalled {
            if self.jobs.reset_stalled(&job.id).await? {
                info!(job_id = %job.id, attempts = job.attempts, "reset stalled job");
                stats.reset += 1;
            } else {
                warn!(
                    job_id = %job.id,
                    attempts = job.attempts,
                    max_attempts = job.max_attempts,
                    "JOB_EXCEEDED_ATTEMPTS: giving up on stalled job"
                );
                stats.gave_up += 1;
            }
        }

        Ok(stats)
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
                        warn!("reaper sweep failed: {err}");
                    }
                }
                _ = shutdown_rx.changed() => break,
            }
        }

        Ok(())
    }
}
