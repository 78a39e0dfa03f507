//! In-memory JobStore with lease semantics

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use tracing::debug;

use flowmonkey_core::{ErrorDetail, Job, JobStatus};

use crate::stores::{JobStore, StoreError};

/// In-memory implementation of [`JobStore`]
///
/// All transitions are state-preconditioned under one write lock, matching
/// the guarded row updates a relational implementation performs.
#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<String, Job>>,
}

impl InMemoryJobStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of jobs in the given status
    pub fn count_by_status(&self, status: JobStatus) -> usize {
        self.jobs
            .read()
            .values()
            .filter(|j| j.status == status)
            .count()
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.jobs.write().clear();
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn get_or_create(&self, job: Job) -> Result<(Job, bool), StoreError> {
        let mut jobs = self.jobs.write();
        if let Some(existing) = jobs.get(&job.id) {
            return Ok((existing.clone(), false));
        }
        jobs.insert(job.id.clone(), job.clone());
        Ok((job, true))
    }

    async fn get(&self, job_id: &str) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs.read().get(job_id).cloned())
    }

    async fn list_pending(&self, limit: usize) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.read();
        let mut pending: Vec<Job> = jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|j| j.created_at);
        pending.truncate(limit);
        Ok(pending)
    }

    async fn claim(&self, job_id: &str, runner_id: &str) -> Result<bool, StoreError> {
        self.claim_inner(job_id, runner_id, None)
    }

    async fn claim_with_instance(
        &self,
        job_id: &str,
        runner_id: &str,
        instance_id: &str,
    ) -> Result<bool, StoreError> {
        self.claim_inner(job_id, runner_id, Some(instance_id))
    }

    async fn heartbeat(&self, job_id: &str, runner_id: &str) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.write();
        let Some(job) = jobs.get_mut(job_id) else {
            return Ok(false);
        };

        if job.status != JobStatus::Running || job.runner_id.as_deref() != Some(runner_id) {
            return Ok(false);
        }

        job.heartbeat_at = Some(Utc::now());
        job.updated_at = Utc::now();
        Ok(true)
    }

    async fn complete(
        &self,
        job_id: &str,
        runner_id: &str,
        result: Value,
    ) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.write();
        let Some(job) = jobs.get_mut(job_id) else {
            return Ok(false);
        };

        if job.status != JobStatus::Running || job.runner_id.as_deref() != Some(runner_id) {
            return Ok(false);
        }

        job.status = JobStatus::Completed;
        job.result = Some(result);
        job.runner_id = None;
        job.updated_at = Utc::now();
        Ok(true)
    }

    async fn fail(
        &self,
        job_id: &str,
        runner_id: &str,
        error: ErrorDetail,
    ) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.write();
        let Some(job) = jobs.get_mut(job_id) else {
            return Ok(false);
        };

        if job.status != JobStatus::Running || job.runner_id.as_deref() != Some(runner_id) {
            return Ok(false);
        }

        job.status = JobStatus::Failed;
        job.error = Some(error);
        job.runner_id = None;
        job.updated_at = Utc::now();
        Ok(true)
    }

    async fn cancel(&self, job_id: &str) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.write();
        let Some(job) = jobs.get_mut(job_id) else {
            return Ok(false);
        };

        if job.status.is_terminal() {
            return Ok(false);
        }

        job.status = JobStatus::Cancelled;
        job.runner_id = None;
        job.updated_at = Utc::now();
        Ok(true)
    }

    async fn find_stalled(&self, now: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.read();
        Ok(jobs.values().filter(|j| j.is_stalled(now)).cloned().collect())
    }

    async fn reset_stalled(&self, job_id: &str) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.write();
        let Some(job) = jobs.get_mut(job_id) else {
            return Ok(false);
        };

        if job.status != JobStatus::Running || !job.attempts_remaining() {
            return Ok(false);
        }

        debug!(job_id, attempts = job.attempts, "resetting stalled job");
        job.status = JobStatus::Pending;
        job.runner_id = None;
        job.instance_id = None;
        job.heartbeat_at = None;
        job.updated_at = Utc::now();
        Ok(true)
    }

    async fn save_checkpoint(
        &self,
        job_id: &str,
        instance_id: &str,
        checkpoint: Value,
    ) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.write();
        let Some(job) = jobs.get_mut(job_id) else {
            return Ok(false);
        };

        if job.instance_id.as_deref() != Some(instance_id) {
            return Ok(false);
        }

        job.checkpoint = Some(checkpoint);
        job.updated_at = Utc::now();
        Ok(true)
    }

    async fn get_checkpoint(&self, job_id: &str) -> Result<Option<Value>, StoreError> {
        Ok(self
            .jobs
            .read()
            .get(job_id)
            .and_then(|j| j.checkpoint.clone()))
    }

    async fn update_progress(
        &self,
        job_id: &str,
        instance_id: &str,
        progress: Value,
    ) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.write();
        let Some(job) = jobs.get_mut(job_id) else {
            return Ok(false);
        };

        if job.instance_id.as_deref() != Some(instance_id) {
            return Ok(false);
        }

        job.progress = Some(progress);
        job.updated_at = Utc::now();
        Ok(true)
    }
}

impl InMemoryJobStore {
    /// Shared claim path; binding an instance resets checkpoint visibility
    fn claim_inner(
        &self,
        job_id: &str,
        runner_id: &str,
        instance_id: Option<&str>,
    ) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.write();
        let Some(job) = jobs.get_mut(job_id) else {
            return Ok(false);
        };

        if job.status != JobStatus::Pending || !job.attempts_remaining() {
            return Ok(false);
        }

        job.status = JobStatus::Running;
        job.runner_id = Some(runner_id.to_string());
        job.instance_id = instance_id.map(str::to_string);
        job.attempts += 1;
        job.heartbeat_at = Some(Utc::now());
        job.updated_at = Utc::now();
        Ok(true)
    }
}
