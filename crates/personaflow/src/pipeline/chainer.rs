use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::error::{PipelineError, StoreError};
use crate::jobs::{artifact, ArtifactRefs, ChainOutcome, Job, JobPatch, NewJob, Stage};
use crate::pipeline::payload::parse_processed;
use crate::pipeline::{bounded, Deps};

/// Id of the fine-tuning job chained from `source_job_id`.
pub fn fine_tuning_job_id(source_job_id: &str) -> String {
    format!("ft-{source_job_id}")
}

/// Creates the stage-2 job once a stage-1 job has its artifact uploaded.
pub struct Chainer {
    deps: Deps,
    cfg: PipelineConfig,
}

impl Chainer {
    pub fn new(deps: Deps, cfg: PipelineConfig) -> Self {
        Self { deps, cfg }
    }

    /// Returns the created job, or `None` when there is nothing to do.
    ///
    /// A failed attempt keeps the source COMPLETE, bumps `chain_attempts`
    /// and records the reason; once `max_chain_attempts` is reached the
    /// source is left alone.
    pub async fn maybe_chain(
        &self,
        job_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<Job>, PipelineError> {
        let job = self
            .deps
            .store
            .get(job_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(job_id.to_string()))?;

        if job.stage != Stage::DataGeneration
            || !job.status.is_complete()
            || !job.is_uploaded
            || job.is_chained
            || job.chain_attempts >= self.cfg.max_chain_attempts
        {
            return Ok(None);
        }

        match self.try_chain(&job, cancel).await {
            Ok(created) => Ok(created),
            Err(PipelineError::Cancelled) => Err(PipelineError::Cancelled),
            Err(e) => {
                let detail = match e {
                    PipelineError::Chaining(msg) => msg,
                    other => other.to_string(),
                };
                self.record_failure(&job, &detail).await?;
                Err(PipelineError::Chaining(detail))
            }
        }
    }

    async fn try_chain(
        &self,
        job: &Job,
        cancel: &CancellationToken,
    ) -> Result<Option<Job>, PipelineError> {
        let limit = self.cfg.call_timeout;

        let source_uri = job
            .artifact(artifact::PROCESSED_RESULT)
            .ok_or_else(|| PipelineError::Chaining("no processed_result artifact".to_string()))?
            .to_string();

        let subject = bounded(
            cancel,
            limit,
            "get subject",
            self.deps.subjects.get_subject(&job.subject_id),
        )
        .await?;
        if subject.is_none() {
            return Err(PipelineError::Chaining(format!(
                "subject {} not found",
                job.subject_id
            )));
        }

        let raw = bounded(
            cancel,
            limit,
            "download processed result",
            self.deps.artifacts.download(&source_uri),
        )
        .await?;
        if parse_processed(&raw)?.is_empty() {
            return Err(PipelineError::Chaining(
                "processed artifact holds no pairs".to_string(),
            ));
        }

        let mut artifact_refs = ArtifactRefs::new();
        artifact_refs.insert(artifact::SOURCE_DATA.to_string(), source_uri);

        let next = NewJob {
            job_id: fine_tuning_job_id(&job.job_id),
            subject_id: job.subject_id.clone(),
            stage: Stage::FineTuning,
            expected_units: job.produced_units,
            source_job_id: Some(job.job_id.clone()),
            artifact_refs,
        };

        match self.deps.store.chain(&job.job_id, next).await? {
            ChainOutcome::Created(created) => {
                if job.error_message.is_some() {
                    self.deps
                        .store
                        .update(&job.job_id, JobPatch::new().clear_error())
                        .await?;
                }
                info!(
                    job_id = %job.job_id,
                    chained_job_id = %created.job_id,
                    units = created.expected_units,
                    "fine-tuning job chained"
                );
                Ok(Some(created))
            }
            ChainOutcome::AlreadyChained => Ok(None),
        }
    }

    async fn record_failure(&self, job: &Job, detail: &str) -> Result<(), StoreError> {
        let job = self
            .deps
            .store
            .update(
                &job.job_id,
                JobPatch::new()
                    .error(format!("chaining failed: {detail}"))
                    .chain_attempt_failed(),
            )
            .await?;

        let attempts = job.chain_attempts;
        warn!(job_id = %job.job_id, attempts, reason = detail, "chaining attempt failed");
        if attempts >= self.cfg.max_chain_attempts {
            self.deps
                .store
                .update(
                    &job.job_id,
                    JobPatch::new().error(format!(
                        "chaining abandoned after {attempts} attempts: {detail}"
                    )),
                )
                .await?;
        }
        Ok(())
    }
}
