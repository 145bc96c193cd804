use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::jobs::model::{Job, JobFilter, JobPatch, NewJob};
use crate::jobs::store::{ChainOutcome, JobStore};

/// Process-local `JobStore`. Not durable; used by tests and local dry runs.
///
/// A single mutex serializes all writes, which gives the same per-row
/// atomicity `JobsRepo` gets from `SELECT ... FOR UPDATE`.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<String, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a record as-is, bypassing transition checks. Lets tests
    /// stage a crash at an arbitrary point of a job's lifecycle.
    pub async fn put_raw(&self, job: Job) {
        self.jobs.lock().await.insert(job.job_id.clone(), job);
    }

    pub async fn len(&self) -> usize {
        self.jobs.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.lock().await.is_empty()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, job: NewJob) -> Result<Job, StoreError> {
        let mut jobs = self.jobs.lock().await;
        if jobs.contains_key(&job.job_id) {
            return Err(StoreError::Duplicate(job.job_id));
        }
        let job = Job::from_new(job, Utc::now());
        jobs.insert(job.job_id.clone(), job.clone());
        Ok(job)
    }

    async fn get(&self, job_id: &str) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs.lock().await.get(job_id).cloned())
    }

    async fn get_by_external_ref(&self, external_ref: &str) -> Result<Option<Job>, StoreError> {
        Ok(self
            .jobs
            .lock()
            .await
            .values()
            .find(|j| j.external_ref.as_deref() == Some(external_ref))
            .cloned())
    }

    async fn update(&self, job_id: &str, patch: JobPatch) -> Result<Job, StoreError> {
        let mut jobs = self.jobs.lock().await;
        let current = jobs
            .get(job_id)
            .ok_or_else(|| StoreError::NotFound(job_id.to_string()))?;

        let next = current.apply(&patch, Utc::now())?;

        if let Some(ext) = &next.external_ref {
            let taken = jobs
                .values()
                .any(|j| j.job_id != job_id && j.external_ref.as_deref() == Some(ext));
            if taken {
                return Err(StoreError::Conflict {
                    job_id: job_id.to_string(),
                    reason: format!("external_ref {ext} belongs to another job"),
                });
            }
        }

        jobs.insert(job_id.to_string(), next.clone());
        Ok(next)
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.lock().await;
        let mut out: Vec<Job> = jobs.values().filter(|j| filter.matches(j)).cloned().collect();
        out.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.job_id.cmp(&a.job_id))
        });
        if let Some(limit) = filter.limit {
            out.truncate(limit.max(0) as usize);
        }
        Ok(out)
    }

    async fn delete(&self, job_id: &str) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().await;
        match jobs.get(job_id) {
            None => Ok(()),
            Some(j) if !j.status.is_terminal() => Err(StoreError::Conflict {
                job_id: job_id.to_string(),
                reason: format!("cannot delete job in non-terminal status {}", j.status),
            }),
            Some(_) => {
                jobs.remove(job_id);
                Ok(())
            }
        }
    }

    async fn chain(&self, source_job_id: &str, next: NewJob) -> Result<ChainOutcome, StoreError> {
        let mut jobs = self.jobs.lock().await;
        let source = jobs
            .get(source_job_id)
            .ok_or_else(|| StoreError::NotFound(source_job_id.to_string()))?;

        if source.is_chained {
            return Ok(ChainOutcome::AlreadyChained);
        }
        if jobs.contains_key(&next.job_id) {
            return Err(StoreError::Duplicate(next.job_id));
        }

        let now = Utc::now();
        let source = source.apply(&JobPatch::new().chained(), now)?;
        let created = Job::from_new(next, now);

        jobs.insert(source.job_id.clone(), source);
        jobs.insert(created.job_id.clone(), created.clone());
        Ok(ChainOutcome::Created(created))
    }
}
