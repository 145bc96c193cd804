pub mod chainer;
pub mod orchestrator;
pub mod payload;
pub mod reconciler;
pub mod registry;
pub mod results;
pub mod watcher;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::clients::{ArtifactStore, BatchProvider, ModelTrainer, SubjectDirectory};
use crate::error::{PipelineError, StoreError};
use crate::jobs::retry::{retry_transient, RetryConfig};
use crate::jobs::{Job, JobPatch, JobStatus, JobStore};

pub use chainer::Chainer;
pub use orchestrator::Orchestrator;
pub use reconciler::{ReconcileReport, Reconciler};
pub use results::ResultPipeline;

/// External collaborators, injected once per process.
#[derive(Clone)]
pub struct Deps {
    pub store: Arc<dyn JobStore>,
    pub provider: Arc<dyn BatchProvider>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub subjects: Arc<dyn SubjectDirectory>,
    pub trainer: Arc<dyn ModelTrainer>,
}

/// Run one external call under `limit`, giving up early on cancellation.
/// An elapsed limit counts as a transient failure.
pub(crate) async fn bounded<T, E, F>(
    cancel: &CancellationToken,
    limit: Duration,
    what: &str,
    fut: F,
) -> Result<T, PipelineError>
where
    F: Future<Output = Result<T, E>>,
    E: Into<PipelineError>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(PipelineError::Cancelled),
        res = tokio::time::timeout(limit, fut) => match res {
            Ok(r) => r.map_err(Into::into),
            Err(_) => Err(PipelineError::TransientProvider(format!(
                "{what} timed out after {}s",
                limit.as_secs()
            ))),
        },
    }
}

/// `bounded` inside `retry_transient`.
pub(crate) async fn retrying<T, E, F, Fut>(
    retry: &RetryConfig,
    limit: Duration,
    cancel: &CancellationToken,
    what: &str,
    mut op: F,
) -> Result<T, PipelineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Into<PipelineError>,
{
    retry_transient(retry, what, cancel, || bounded(cancel, limit, what, op())).await
}

/// Move a job to its stage's FAILED status. A job that is already terminal
/// is returned untouched.
pub async fn mark_failed(
    store: &dyn JobStore,
    job_id: &str,
    reason: &str,
) -> Result<Job, StoreError> {
    let job = store
        .get(job_id)
        .await?
        .ok_or_else(|| StoreError::NotFound(job_id.to_string()))?;
    if job.status.is_terminal() {
        return Ok(job);
    }

    let patch = JobPatch::new()
        .status(JobStatus::failed(job.stage))
        .error(reason);

    match store.update(job_id, patch).await {
        Ok(failed) => {
            tracing::warn!(job_id, stage = %failed.stage, reason, "job failed");
            Ok(failed)
        }
        // lost a race against a terminal write
        Err(StoreError::InvalidTransition { .. }) => store
            .get(job_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(job_id.to_string())),
        Err(e) => Err(e),
    }
}
