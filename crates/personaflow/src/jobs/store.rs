use async_trait::async_trait;

use crate::error::StoreError;
use crate::jobs::model::{Job, JobFilter, JobPatch, NewJob};

#[derive(Debug, Clone, PartialEq)]
pub enum ChainOutcome {
    /// The follow-up job was inserted and the source marked chained, atomically.
    Created(Job),
    /// The source was chained before; nothing was written.
    AlreadyChained,
}

/// Durable record of every job. The only component with transactional
/// persistence; everything else treats it as ground truth.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Fails with `StoreError::Duplicate` if `job_id` exists.
    async fn create(&self, job: NewJob) -> Result<Job, StoreError>;

    async fn get(&self, job_id: &str) -> Result<Option<Job>, StoreError>;

    async fn get_by_external_ref(&self, external_ref: &str) -> Result<Option<Job>, StoreError>;

    /// Row-atomic read-modify-write through `Job::apply`.
    async fn update(&self, job_id: &str, patch: JobPatch) -> Result<Job, StoreError>;

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError>;

    /// Refuses to delete a job that has not reached a terminal status.
    async fn delete(&self, job_id: &str) -> Result<(), StoreError>;

    /// Insert `next` and set `is_chained` on `source_job_id` in one unit.
    async fn chain(&self, source_job_id: &str, next: NewJob) -> Result<ChainOutcome, StoreError>;
}
