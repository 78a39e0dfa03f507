//! WAL replay
//!
//! A background process that re-drives failed pipe inserts: reads unacked
//! entries, retries each whose backoff has elapsed, acks on success,
//! records the attempt on failure, and compacts acked entries. Backoff is
//! exponential with jitter, bounded by a maximum interval.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::sync::watch;
use tracing::{debug, instrument, warn};

use flowmonkey_core::{EngineError, WalEntry};
use flowmonkey_storage::{TableStore, WriteAheadLog};

/// Replay configuration
#[derive(Debug, Clone)]
pub struct ReplayConfig {
    /// Scan interval
    pub interval: Duration,

    /// Entries fetched per scan
    pub batch_size: usize,

    /// Delay before the first retry
    pub initial_backoff: Duration,

    /// Upper bound on the per-entry delay
    pub max_backoff: Duration,

    /// Backoff multiplier per recorded attempt
    pub backoff_multiplier: f64,

    /// Jitter factor (0.0-1.0) to avoid thundering herd
    pub jitter: f64,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            batch_size: 50,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl ReplayConfig {
    /// Delay an entry must wait after its n-th failed attempt
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let base = self.initial_backoff.as_secs_f64()
            * self.backoff_multiplier.powi(exponent as i32);
        let capped = base.min(self.max_backoff.as_secs_f64());

        let jittered = if self.jitter > 0.0 {
            let spread = capped * self.jitter;
            capped + rand::thread_rng().gen_range(-spread..=spread)
        } else {
            capped
        };

        Duration::from_secs_f64(jittered.max(0.0))
    }
}

/// Stats from one replay scan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    /// Entries whose insert succeeded and were acked
    pub acked: usize,

    /// Entries whose insert failed again
    pub failed: usize,

    /// Entries skipped because their backoff has not elapsed
    pub deferred: usize,

    /// Acked entries removed by compaction
    pub compacted: u32,
}

/// Replays unacked WAL entries into their tables
pub struct WalReplayer {
    wal: Arc<dyn WriteAheadLog>,
    tables: Arc<dyn TableStore>,
    config: ReplayConfig,
}

impl WalReplayer {
    /// Create a replayer over the given stores
    pub fn new(
        wal: Arc<dyn WriteAheadLog>,
        tables: Arc<dyn TableStore>,
        config: ReplayConfig,
    ) -> Self {
        Self {
            wal,
            tables,
            config,
        }
    }

    /// One scan over pending entries
    #[instrument(skip(self))]
    pub async fn replay_once(&self) -> Result<ReplayStats, EngineError> {
        let pending = self.wal.read_pending(self.config.batch_size).await?;
        let mut stats = ReplayStats::default();
        let now = Utc::now();

        for entry in pending {
            if !self.backoff_elapsed(&entry, now) {
                stats.deferred += 1;
                continue;
            }

            match self
                .tables
                .insert_row(&entry.table_id, entry.tenant_id.as_deref(), entry.data.clone())
                .await
            {
                Ok(_) => {
                    debug!(entry_id = %entry.id, table_id = %entry.table_id, "replayed wal entry");
                    self.wal.ack(entry.id).await?;
                    stats.acked += 1;
                }
                Err(err) => {
                    warn!(entry_id = %entry.id, attempts = entry.attempts, "replay failed: {err}");
                    self.wal.record_failure(entry.id, &err.to_string()).await?;
                    stats.failed += 1;
                }
            }
        }

        if stats.acked > 0 {
            stats.compacted = self.wal.compact().await?;
        }

        Ok(stats)
    }

    /// Replay on the configured interval until shutdown
    pub async fn run_until_shutdown(
        &self,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> Result<(), EngineError> {
        let mut ticker = tokio::time::interval(self.config.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.replay_once().await {
                        warn!("wal replay failed: {err}");
                    }
                }
                _ = shutdown_rx.changed() => break,
            }
        }

        Ok(())
    }

    /// Whether an entry's backoff window has elapsed
    ///
    /// Attempt timestamps are not stored, so the window is measured from
    /// the entry's creation; attempts stretch it multiplicatively.
    fn backoff_elapsed(&self, entry: &WalEntry, now: chrono::DateTime<chrono::Utc>) -> bool {
        let delay = self.config.delay_for_attempt(entry.attempts);
        let eligible_at = entry.created_at
            + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
        eligible_at <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use flowmonkey_core::{ColumnDef, ColumnType, TableDefinition};
    use flowmonkey_storage::{InMemoryTableStore, InMemoryWal, TableRegistry};
    use serde_json::json;
    use uuid::Uuid;

    async fn orders_store() -> Arc<InMemoryTableStore> {
        let store = Arc::new(InMemoryTableStore::new());
        store
            .create_table(TableDefinition {
                id: "orders-table".to_string(),
                columns: vec![ColumnDef {
                    id: "order_id".to_string(),
                    name: "Order".to_string(),
                    column_type: ColumnType::Text,
                    required: true,
                }],
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .await
            .unwrap();
        store
    }

    fn entry(data: serde_json::Value) -> WalEntry {
        WalEntry::new(
            "orders-table",
            None,
            data.as_object().unwrap().clone(),
            "orders-out",
            Uuid::now_v7(),
            "order-pipeline",
            "process-order",
            "table unavailable",
        )
    }

    fn no_backoff() -> ReplayConfig {
        ReplayConfig {
            initial_backoff: Duration::from_secs(0),
            jitter: 0.0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_replay_acks_successful_inserts_and_compacts() {
        let tables = orders_store().await;
        let wal = Arc::new(InMemoryWal::new());
        wal.append(entry(json!({"order_id": "o-1"}))).await.unwrap();

        let replayer = WalReplayer::new(wal.clone(), tables.clone(), no_backoff());
        let stats = replayer.replay_once().await.unwrap();

        assert_eq!(stats.acked, 1);
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.compacted, 1);
        assert_eq!(wal.unacked_count(), 0);
        assert_eq!(tables.row_count("orders-table"), 1);
    }

    #[tokio::test]
    async fn test_replay_records_repeated_failures() {
        let tables = orders_store().await;
        let wal = Arc::new(InMemoryWal::new());
        // Missing the required column: the insert keeps failing
        wal.append(entry(json!({"note": "incomplete"}))).await.unwrap();

        let replayer = WalReplayer::new(wal.clone(), tables, no_backoff());
        let stats = replayer.replay_once().await.unwrap();

        assert_eq!(stats.acked, 0);
        assert_eq!(stats.failed, 1);

        let pending = wal.read_pending(10).await.unwrap();
        assert_eq!(pending[0].attempts, 2);
    }

    #[tokio::test]
    async fn test_backoff_defers_recent_failures() {
        let tables = orders_store().await;
        let wal = Arc::new(InMemoryWal::new());
        let mut deferred = entry(json!({"order_id": "o-1"}));
        deferred.attempts = 5;
        wal.append(deferred).await.unwrap();

        let config = ReplayConfig {
            initial_backoff: Duration::from_secs(60),
            jitter: 0.0,
            ..Default::default()
        };
        let replayer = WalReplayer::new(wal.clone(), tables, config);
        let stats = replayer.replay_once().await.unwrap();

        assert_eq!(stats.deferred, 1);
        assert_eq!(wal.unacked_count(), 1);
    }

    #[test]
    fn test_delay_for_attempt_is_bounded() {
        let config = ReplayConfig {
            jitter: 0.0,
            ..Default::default()
        };

        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(4));
        // Capped at max_backoff no matter how many attempts
        assert_eq!(config.delay_for_attempt(30), Duration::from_secs(60));
    }

    #[test]
    fn test_delay_jitter_stays_near_the_base() {
        let config = ReplayConfig::default();
        for _ in 0..20 {
            let delay = config.delay_for_attempt(2).as_secs_f64();
            assert!((1.8..=2.2).contains(&delay));
        }
    }
}
