//! Job-backed checkpoint capability
//!
//! Binds `CheckpointAccess` to one `(jobId, instanceId)` claim. Writes are
//! accepted only while that instance is the live owner; a write rejected by
//! the store means the lease was lost (stalled and reclaimed), and the
//! handler should stop.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use flowmonkey_core::{CheckpointAccess, EngineError};
use flowmonkey_storage::JobStore;

/// Checkpoint and progress access for one job attempt
pub struct JobCheckpoint {
    jobs: Arc<dyn JobStore>,
    job_id: String,
    instance_id: String,
}

impl JobCheckpoint {
    /// Bind to a claimed `(jobId, instanceId)`
    pub fn new(jobs: Arc<dyn JobStore>, job_id: String, instance_id: String) -> Self {
        Self {
            jobs,
            job_id,
            instance_id,
        }
    }
}

#[async_trait]
impl CheckpointAccess for JobCheckpoint {
    async fn save(&self, checkpoint: Value) -> Result<(), EngineError> {
        let accepted = self
            .jobs
            .save_checkpoint(&self.job_id, &self.instance_id, checkpoint)
            .await?;
        if accepted {
            Ok(())
        } else {
            Err(EngineError::JobStalled(self.job_id.clone()))
        }
    }

    async fn load(&self) -> Result<Option<Value>, EngineError> {
        Ok(self.jobs.get_checkpoint(&self.job_id).await?)
    }

    async fn update_progress(&self, progress: Value) -> Result<(), EngineError> {
        let accepted = self
            .jobs
            .update_progress(&self.job_id, &self.instance_id, progress)
            .await?;
        if accepted {
            Ok(())
        } else {
            Err(EngineError::JobStalled(self.job_id.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowmonkey_core::{Job, JobKey};
    use flowmonkey_storage::InMemoryJobStore;
    use serde_json::json;
    use uuid::Uuid;

    async fn claimed_job(store: &Arc<InMemoryJobStore>, instance_id: &str) -> String {
        let job = Job::new(&JobKey {
            execution_id: Uuid::now_v7(),
            step_id: "batch".to_string(),
            handler: "batch-import".to_string(),
            input: json!({}),
        });
        let (job, _) = store.get_or_create(job).await.unwrap();
        store
            .claim_with_instance(&job.id, "runner-a", instance_id)
            .await
            .unwrap();
        job.id
    }

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let store = Arc::new(InMemoryJobStore::new());
        let job_id = claimed_job(&store, "inst-1").await;

        let checkpoint = JobCheckpoint::new(store.clone(), job_id, "inst-1".to_string());
        checkpoint.save(json!({"cursor": 42})).await.unwrap();

        assert_eq!(checkpoint.load().await.unwrap(), Some(json!({"cursor": 42})));
    }

    #[tokio::test]
    async fn test_writes_from_a_stale_instance_are_rejected() {
        let store = Arc::new(InMemoryJobStore::new());
        let job_id = claimed_job(&store, "inst-live").await;

        let live = JobCheckpoint::new(store.clone(), job_id.clone(), "inst-live".to_string());
        live.save(json!({"cursor": 7})).await.unwrap();

        let stale = JobCheckpoint::new(store.clone(), job_id.clone(), "inst-stale".to_string());
        let err = stale.save(json!({"cursor": 0})).await.unwrap_err();
        assert_eq!(err.code(), "JOB_STALLED");

        let err = stale.update_progress(json!({"done": 1})).await.unwrap_err();
        assert_eq!(err.code(), "JOB_STALLED");

        // Reads stay open to any caller: the stale instance still sees the
        // owner's checkpoint, and the rejected write left it untouched
        assert_eq!(stale.load().await.unwrap(), Some(json!({"cursor": 7})));
    }
}
