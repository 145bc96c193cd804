use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::clients::artifacts::job_artifact_key;
use crate::config::PipelineConfig;
use crate::error::{PipelineError, StoreError};
use crate::jobs::{artifact, DataGenerationStatus, Job, JobPatch, JobStatus, Stage};
use crate::pipeline::payload::{self, ProcessedResult, QaPair};
use crate::pipeline::{mark_failed, retrying, Deps};

const RAW_RESULT_FILE: &str = "raw_result.jsonl";
const PROCESSED_RESULT_FILE: &str = "processed_result.json";

/// Turns a finished batch into the persisted Q/A artifact.
///
/// Every step records its outcome before the next one starts, so a rerun
/// after a crash picks up where the last one stopped: a cached raw blob is
/// not fetched again and an uploaded processed artifact is not uploaded
/// again.
pub struct ResultPipeline {
    deps: Deps,
    cfg: PipelineConfig,
}

impl ResultPipeline {
    pub fn new(deps: Deps, cfg: PipelineConfig) -> Self {
        Self { deps, cfg }
    }

    /// Safe to call any number of times. Failures end in FAILED with
    /// `is_processed` still false; only cancellation and an unwritable
    /// failure are returned as errors.
    pub async fn process(
        &self,
        job_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Job, PipelineError> {
        let job = self.load(job_id).await?;
        if job.is_processed || job.status.is_terminal() {
            debug!(job_id, status = %job.status, "result already handled");
            return Ok(job);
        }
        if !matches!(
            job.status,
            JobStatus::DataGeneration(
                DataGenerationStatus::ExternalComplete | DataGenerationStatus::ResultProcessing
            )
        ) {
            return Err(PipelineError::InvalidRequest(format!(
                "job {job_id} has no result yet ({})",
                job.status
            )));
        }

        match self.run(job, cancel).await {
            Ok(done) => Ok(done),
            Err(PipelineError::Cancelled) => Err(PipelineError::Cancelled),
            Err(e) => {
                error!(job_id, error = %e, "result processing failed");
                Ok(mark_failed(self.deps.store.as_ref(), job_id, &e.to_string()).await?)
            }
        }
    }

    /// Finish the upload bookkeeping of a COMPLETE job whose processed
    /// artifact was never marked uploaded. Never changes its status.
    pub async fn repair_upload(
        &self,
        job_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Job, PipelineError> {
        let job = self.load(job_id).await?;
        if job.is_uploaded || !job.status.is_complete() {
            return Ok(job);
        }

        if job.artifact(artifact::PROCESSED_RESULT).is_some() {
            let job = self
                .deps
                .store
                .update(job_id, JobPatch::new().uploaded())
                .await?;
            info!(job_id, "upload flag repaired");
            return Ok(job);
        }

        let (job, raw) = self.raw_blob(job, cancel).await?;
        let pairs = payload::parse_batch_output(&raw);
        let job = self.upload_processed(job, &pairs, cancel).await?;
        info!(job_id, pairs = pairs.len(), "processed artifact re-uploaded");
        Ok(job)
    }

    async fn load(&self, job_id: &str) -> Result<Job, PipelineError> {
        let job = self
            .deps
            .store
            .get(job_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(job_id.to_string()))?;
        if job.stage != Stage::DataGeneration {
            return Err(PipelineError::InvalidRequest(format!(
                "job {job_id} is a {} job",
                job.stage
            )));
        }
        Ok(job)
    }

    async fn run(&self, mut job: Job, cancel: &CancellationToken) -> Result<Job, PipelineError> {
        let store = &self.deps.store;

        if job.status == JobStatus::DataGeneration(DataGenerationStatus::ExternalComplete) {
            job = store
                .update(
                    &job.job_id,
                    JobPatch::new().status(JobStatus::DataGeneration(
                        DataGenerationStatus::ResultProcessing,
                    )),
                )
                .await?;
        }

        if job.is_uploaded {
            if let Some(uri) = job.artifact(artifact::PROCESSED_RESULT).map(str::to_string) {
                let raw = retrying(
                    &self.cfg.retry,
                    self.cfg.call_timeout,
                    cancel,
                    "download processed result",
                    || self.deps.artifacts.download(&uri),
                )
                .await?;
                let count = payload::parse_processed(&raw)?.len();
                debug!(job_id = %job.job_id, count, "finalizing from uploaded artifact");
                return self.finalize(&job, count).await;
            }
        }

        let (job, raw) = self.raw_blob(job, cancel).await?;

        let pairs = payload::parse_batch_output(&raw);
        if pairs.is_empty() {
            return Err(PipelineError::Parse("empty or unparsable result".to_string()));
        }

        let job = self.upload_processed(job, &pairs, cancel).await?;
        self.finalize(&job, pairs.len()).await
    }

    /// Cached raw blob if one was stored, else fetch it and store it first.
    async fn raw_blob(
        &self,
        job: Job,
        cancel: &CancellationToken,
    ) -> Result<(Job, Bytes), PipelineError> {
        let (retry, limit) = (&self.cfg.retry, self.cfg.call_timeout);

        if let Some(uri) = job.artifact(artifact::RAW_RESULT).map(str::to_string) {
            let raw = retrying(retry, limit, cancel, "download raw result", || {
                self.deps.artifacts.download(&uri)
            })
            .await?;
            return Ok((job, raw));
        }

        let external_ref = job.external_ref.clone().ok_or_else(|| {
            PipelineError::InvalidRequest(format!("job {} has no external_ref", job.job_id))
        })?;

        let raw = retrying(retry, limit, cancel, "fetch batch result", || {
            self.deps.provider.fetch_result(&external_ref)
        })
        .await?;

        let key = job_artifact_key(&job.job_id, RAW_RESULT_FILE);
        let uri = retrying(retry, limit, cancel, "upload raw result", || {
            self.deps.artifacts.upload(raw.clone(), &key)
        })
        .await?;

        let job = self
            .deps
            .store
            .update(&job.job_id, JobPatch::new().artifact(artifact::RAW_RESULT, uri))
            .await?;
        debug!(job_id = %job.job_id, bytes = raw.len(), "raw result cached");
        Ok((job, raw))
    }

    async fn upload_processed(
        &self,
        job: Job,
        pairs: &[QaPair],
        cancel: &CancellationToken,
    ) -> Result<Job, PipelineError> {
        let body = serde_json::to_vec(&ProcessedResult {
            job_id: job.job_id.clone(),
            subject_id: job.subject_id.clone(),
            qa_pairs: pairs.to_vec(),
        })
        .map_err(|e| PipelineError::Parse(e.to_string()))?;
        let body = Bytes::from(body);

        let key = job_artifact_key(&job.job_id, PROCESSED_RESULT_FILE);
        let uri = retrying(
            &self.cfg.retry,
            self.cfg.call_timeout,
            cancel,
            "upload processed result",
            || self.deps.artifacts.upload(body.clone(), &key),
        )
        .await?;

        let job = self
            .deps
            .store
            .update(
                &job.job_id,
                JobPatch::new()
                    .artifact(artifact::PROCESSED_RESULT, uri)
                    .uploaded(),
            )
            .await?;
        Ok(job)
    }

    async fn finalize(&self, job: &Job, count: usize) -> Result<Job, PipelineError> {
        let job = self
            .deps
            .store
            .update(
                &job.job_id,
                JobPatch::new()
                    .processed()
                    .produced_units(count as i32)
                    .status(JobStatus::complete(Stage::DataGeneration))
                    .completed_at(chrono::Utc::now()),
            )
            .await?;
        info!(
            job_id = %job.job_id,
            produced_units = job.produced_units,
            expected_units = job.expected_units,
            "data generation complete"
        );
        Ok(job)
    }
}
