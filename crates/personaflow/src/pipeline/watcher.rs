use bytes::Bytes;
use chrono::Utc;
use futures::FutureExt;
use rand::{rngs::StdRng, SeedableRng};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clients::artifacts::job_artifact_key;
use crate::clients::{ProviderStatus, SubjectRecord, TrainingRequest, TrainingStatus};
use crate::config::NotifyMode;
use crate::error::{PipelineError, StoreError};
use crate::jobs::retry::jittered;
use crate::jobs::{
    artifact, DataGenerationStatus, FineTuningStatus, Job, JobPatch, JobStatus, Transition,
};
use crate::pipeline::orchestrator::Orchestrator;
use crate::pipeline::payload;
use crate::pipeline::registry::Registration;
use crate::pipeline::{bounded, mark_failed, retrying};

const TRAINING_DATA_FILE: &str = "training_data.jsonl";

enum Wake {
    Cancelled,
    Event(Option<ProviderStatus>),
    Deadline,
}

/// Drives one job to a terminal status. Owns the job's writes while it
/// runs; other components only read it.
pub(crate) struct StageWatcher {
    orch: Orchestrator,
    job_id: String,
    generation: u64,
    cancel: CancellationToken,
    events: mpsc::UnboundedReceiver<ProviderStatus>,
    /// Attached by the reconciler rather than at creation.
    resumed: bool,
}

impl StageWatcher {
    pub(crate) fn new(orch: Orchestrator, job_id: String, reg: Registration, resumed: bool) -> Self {
        Self {
            orch,
            job_id,
            generation: reg.generation,
            cancel: reg.cancel,
            events: reg.events,
            resumed,
        }
    }

    pub(crate) async fn run(mut self) {
        let outcome = AssertUnwindSafe(self.drive()).catch_unwind().await;

        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(PipelineError::Cancelled)) => {
                info!("watcher cancelled");
                None
            }
            Ok(Err(e)) => {
                error!(error = %e, "watcher failed");
                Some(e.to_string())
            }
            Err(panic) => {
                let msg = panic_message(panic.as_ref());
                error!(panic = %msg, "watcher panicked");
                Some(format!("watcher panicked: {msg}"))
            }
        };

        if let Some(reason) = failure {
            if let Err(e) = mark_failed(self.orch.deps().store.as_ref(), &self.job_id, &reason).await {
                error!(error = %e, "could not record watcher failure; left for reconciliation");
            }
        }

        self.orch.registry().release(&self.job_id, self.generation);
    }

    async fn drive(&mut self) -> Result<(), PipelineError> {
        let mut job = self
            .orch
            .deps()
            .store
            .get(&self.job_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(self.job_id.clone()))?;

        loop {
            if self.cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }

            let before = job.status;
            job = match job.status {
                JobStatus::DataGeneration(st) => match st {
                    DataGenerationStatus::Pending => {
                        let r = self.submit(&job).await;
                        self.settle(&job, r).await?
                    }
                    DataGenerationStatus::Submitted | DataGenerationStatus::ExternalProcessing => {
                        let r = match self.orch.config().notify_mode {
                            NotifyMode::Poll => self.poll_provider(job.clone()).await,
                            NotifyMode::Push => self.await_push(job.clone()).await,
                        };
                        self.settle(&job, r).await?
                    }
                    DataGenerationStatus::ExternalComplete
                    | DataGenerationStatus::ResultProcessing => {
                        self.orch.results().process(&job.job_id, &self.cancel).await?
                    }
                    DataGenerationStatus::Complete => {
                        if let Err(e) = self.orch.maybe_chain(&job.job_id).await {
                            warn!(error = %e, "chaining deferred to reconciliation");
                        }
                        return Ok(());
                    }
                    DataGenerationStatus::Failed => return Ok(()),
                },
                JobStatus::FineTuning(st) => match st {
                    FineTuningStatus::Pending => {
                        self.orch
                            .deps()
                            .store
                            .update(
                                &job.job_id,
                                JobPatch::new()
                                    .status(JobStatus::FineTuning(FineTuningStatus::PreparingData)),
                            )
                            .await?
                    }
                    FineTuningStatus::PreparingData => {
                        let r = self.prepare_training(&job).await;
                        self.settle(&job, r).await?
                    }
                    FineTuningStatus::Training => {
                        let r = self.poll_trainer(&job).await;
                        self.settle(&job, r).await?
                    }
                    FineTuningStatus::Publishing => {
                        let r = self.publish_model(&job).await;
                        self.settle(&job, r).await?
                    }
                    FineTuningStatus::Complete | FineTuningStatus::Failed => return Ok(()),
                },
            };

            if job.status == before {
                return Err(PipelineError::InvalidRequest(format!(
                    "no progress from {before}"
                )));
            }
            debug!(from = %before, to = %job.status, "job advanced");
        }
    }

    /// Turn a step failure into a durable FAILED write.
    async fn settle(&self, job: &Job, res: Result<Job, PipelineError>) -> Result<Job, PipelineError> {
        match res {
            Ok(next) => Ok(next),
            Err(PipelineError::Cancelled) => Err(PipelineError::Cancelled),
            Err(e) => Ok(mark_failed(self.orch.deps().store.as_ref(), &job.job_id, &e.to_string()).await?),
        }
    }

    async fn call<T, E>(
        &self,
        what: &str,
        fut: impl std::future::Future<Output = Result<T, E>>,
    ) -> Result<T, PipelineError>
    where
        E: Into<PipelineError>,
    {
        bounded(&self.cancel, self.orch.config().call_timeout, what, fut).await
    }

    async fn sleep(&self, d: Duration) -> Result<(), PipelineError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(PipelineError::Cancelled),
            _ = tokio::time::sleep(d) => Ok(()),
        }
    }

    /// Wall-clock budget left for `job`, mapped onto the tokio clock.
    fn deadline(&self, job: &Job) -> Instant {
        let elapsed = (Utc::now() - job.created_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        Instant::now() + self.orch.config().max_wait.saturating_sub(elapsed)
    }

    fn timeout_error(&self, what: &str) -> PipelineError {
        let hours = self.orch.config().max_wait.as_secs() / 3600;
        PipelineError::Timeout(format!("no terminal {what} status within {hours}h"))
    }

    async fn subject(&self, job: &Job) -> Result<SubjectRecord, PipelineError> {
        self.call(
            "get subject",
            self.orch.deps().subjects.get_subject(&job.subject_id),
        )
        .await?
        .ok_or_else(|| PipelineError::InvalidRequest(format!("subject {} not found", job.subject_id)))
    }

    // ----------------------------
    // Stage 1
    // ----------------------------

    async fn submit(&self, job: &Job) -> Result<Job, PipelineError> {
        let subject = match self.subject(job).await {
            Ok(s) => s,
            Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
            Err(e) => return Err(PipelineError::Submission(e.to_string())),
        };

        let cfg = self.orch.config();
        let submission = payload::build_submission(job, &subject, &cfg.batch_model);

        let external_ref = match self
            .call("submit batch", self.orch.deps().provider.submit(&submission))
            .await
        {
            Ok(r) => r,
            Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
            Err(e) => return Err(PipelineError::Submission(e.to_string())),
        };

        let job = self
            .orch
            .deps()
            .store
            .update(
                &job.job_id,
                JobPatch::new()
                    .external_ref(external_ref.as_str())
                    .status(JobStatus::DataGeneration(DataGenerationStatus::Submitted)),
            )
            .await?;
        info!(external_ref = %external_ref, units = job.expected_units, "batch submitted");
        Ok(job)
    }

    fn external_ref(job: &Job) -> Result<String, PipelineError> {
        job.external_ref
            .clone()
            .ok_or_else(|| PipelineError::InvalidRequest("no external_ref recorded".to_string()))
    }

    async fn check_provider(&self, external_ref: &str) -> Result<ProviderStatus, PipelineError> {
        self.call(
            "get batch status",
            self.orch.deps().provider.get_status(external_ref),
        )
        .await
    }

    /// One direct status check. Check failures are logged and leave `job`
    /// as it was; terminal provider failures come back as errors.
    async fn look(&self, job: Job, external_ref: &str, on_err: &str) -> Result<Job, PipelineError> {
        match self.check_provider(external_ref).await {
            Ok(st) => self.observe_provider(job, st).await,
            Err(PipelineError::Cancelled) => Err(PipelineError::Cancelled),
            Err(e) => {
                warn!(error = %e, "{on_err}");
                Ok(job)
            }
        }
    }

    async fn poll_provider(&mut self, mut job: Job) -> Result<Job, PipelineError> {
        let external_ref = Self::external_ref(&job)?;
        let deadline = self.deadline(&job);
        let cfg = self.orch.config().clone();
        let mut rng = StdRng::from_entropy();

        if self.resumed {
            job = self.look(job, &external_ref, "re-verification failed; polling").await?;
            if !awaiting_provider(&job) {
                return Ok(job);
            }
        }

        loop {
            let now = Instant::now();
            if now >= deadline {
                job = self.look(job, &external_ref, "final status check failed").await?;
                if !awaiting_provider(&job) {
                    return Ok(job);
                }
                return Err(self.timeout_error("provider"));
            }
            let wait = jittered(cfg.poll_interval, cfg.poll_jitter_pct, &mut rng).min(deadline - now);
            self.sleep(wait).await?;

            job = self
                .look(job, &external_ref, "status check failed; retrying next interval")
                .await?;
            if !awaiting_provider(&job) {
                return Ok(job);
            }
        }
    }

    async fn await_push(&mut self, mut job: Job) -> Result<Job, PipelineError> {
        let external_ref = Self::external_ref(&job)?;
        let deadline = self.deadline(&job);

        if self.resumed {
            // events sent while we were down are gone
            job = self.look(job, &external_ref, "re-verification failed; waiting for events").await?;
            if !awaiting_provider(&job) {
                return Ok(job);
            }
        }

        loop {
            let wake = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Wake::Cancelled,
                ev = self.events.recv() => Wake::Event(ev),
                _ = tokio::time::sleep_until(deadline) => Wake::Deadline,
            };

            match wake {
                Wake::Cancelled | Wake::Event(None) => return Err(PipelineError::Cancelled),
                Wake::Event(Some(st)) => {
                    debug!(status = st.as_str(), "provider event received");
                    job = self.observe_provider(job, st).await?;
                    if !awaiting_provider(&job) {
                        return Ok(job);
                    }
                }
                Wake::Deadline => {
                    // one direct look before giving up
                    job = self.look(job, &external_ref, "final status check failed").await?;
                    if !awaiting_provider(&job) {
                        return Ok(job);
                    }
                    return Err(self.timeout_error("provider"));
                }
            }
        }
    }

    /// Persist what the provider told us. Repeats and stale reports are
    /// ignored; terminal failures come back as errors.
    async fn observe_provider(&self, job: Job, st: ProviderStatus) -> Result<Job, PipelineError> {
        let target = match st {
            ProviderStatus::Processing => DataGenerationStatus::ExternalProcessing,
            ProviderStatus::Complete => DataGenerationStatus::ExternalComplete,
            ProviderStatus::Failed => {
                return Err(PipelineError::Provider("batch failed".to_string()))
            }
            ProviderStatus::Cancelled => {
                return Err(PipelineError::Provider("batch cancelled".to_string()))
            }
            ProviderStatus::Expired => {
                return Err(PipelineError::Provider("batch expired".to_string()))
            }
        };
        let target = JobStatus::DataGeneration(target);

        if job.status.transition(target) != Transition::Advance {
            debug!(status = %job.status, reported = st.as_str(), "provider status ignored");
            return Ok(job);
        }

        let job = self
            .orch
            .deps()
            .store
            .update(&job.job_id, JobPatch::new().status(target))
            .await?;
        info!(status = %job.status, "provider status recorded");
        Ok(job)
    }

    // ----------------------------
    // Stage 2
    // ----------------------------

    async fn prepare_training(&self, job: &Job) -> Result<Job, PipelineError> {
        let deps = self.orch.deps();
        let cfg = self.orch.config();
        let subject = self.subject(job).await?;

        let mut job = job.clone();
        let dataset_uri = match job.artifact(artifact::TRAINING_DATA) {
            Some(uri) => uri.to_string(),
            None => {
                let source = job
                    .artifact(artifact::SOURCE_DATA)
                    .ok_or_else(|| PipelineError::Artifact("no source_data artifact".to_string()))?
                    .to_string();

                let raw = retrying(&cfg.retry, cfg.call_timeout, &self.cancel, "download source data", || {
                    deps.artifacts.download(&source)
                })
                .await?;

                let pairs = payload::parse_processed(&raw)?;
                let records = payload::training_records(&subject, &pairs);
                if records.is_empty() {
                    return Err(PipelineError::Parse("no usable training records".to_string()));
                }

                let body = Bytes::from(payload::to_jsonl(&records)?);
                let key = job_artifact_key(&job.job_id, TRAINING_DATA_FILE);
                let uri = retrying(&cfg.retry, cfg.call_timeout, &self.cancel, "upload training data", || {
                    deps.artifacts.upload(body.clone(), &key)
                })
                .await?;

                job = deps
                    .store
                    .update(
                        &job.job_id,
                        JobPatch::new()
                            .artifact(artifact::TRAINING_DATA, uri.as_str())
                            .produced_units(records.len() as i32),
                    )
                    .await?;
                info!(records = records.len(), "training data prepared");
                uri
            }
        };

        let req = TrainingRequest {
            job_id: job.job_id.clone(),
            subject_id: job.subject_id.clone(),
            dataset_uri,
            base_model: cfg.base_model.clone(),
            repo_id: payload::repo_id(&cfg.hf_namespace, &job.subject_id),
            epochs: cfg.training_epochs,
        };

        let run_id = retrying(&cfg.retry, cfg.call_timeout, &self.cancel, "start training", || {
            deps.trainer.start(&req)
        })
        .await?;

        let job = deps
            .store
            .update(
                &job.job_id,
                JobPatch::new()
                    .external_ref(run_id.as_str())
                    .status(JobStatus::FineTuning(FineTuningStatus::Training)),
            )
            .await?;
        info!(run_id = %run_id, repo_id = %req.repo_id, "training started");
        Ok(job)
    }

    async fn poll_trainer(&self, job: &Job) -> Result<Job, PipelineError> {
        let run_id = Self::external_ref(job)?;
        let deadline = self.deadline(job);
        let cfg = self.orch.config().clone();
        let mut rng = StdRng::from_entropy();

        // the trainer is always asked at least once, even past the deadline
        loop {
            let now = Instant::now();
            if now < deadline {
                let wait = jittered(cfg.poll_interval, cfg.poll_jitter_pct, &mut rng).min(deadline - now);
                self.sleep(wait).await?;
            }

            match self
                .call("get training status", self.orch.deps().trainer.get_status(&run_id))
                .await
            {
                Ok(TrainingStatus::Running) => debug!("training still running"),
                Ok(TrainingStatus::Succeeded { checkpoint_uri }) => {
                    let job = self
                        .orch
                        .deps()
                        .store
                        .update(
                            &job.job_id,
                            JobPatch::new()
                                .artifact(artifact::CHECKPOINT, checkpoint_uri)
                                .status(JobStatus::FineTuning(FineTuningStatus::Publishing)),
                        )
                        .await?;
                    info!("training finished");
                    return Ok(job);
                }
                Ok(TrainingStatus::Failed { reason }) => {
                    return Err(PipelineError::Provider(format!("training failed: {reason}")))
                }
                Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
                Err(e) => warn!(error = %e, "training status check failed; retrying next interval"),
            }

            if Instant::now() >= deadline {
                return Err(self.timeout_error("training"));
            }
        }
    }

    async fn publish_model(&self, job: &Job) -> Result<Job, PipelineError> {
        let deps = self.orch.deps();
        let cfg = self.orch.config();
        let run_id = Self::external_ref(job)?;
        let repo_id = payload::repo_id(&cfg.hf_namespace, &job.subject_id);

        let model_url = retrying(&cfg.retry, cfg.call_timeout, &self.cancel, "publish model", || {
            deps.trainer.publish(&run_id, &repo_id)
        })
        .await?;

        let job = deps
            .store
            .update(
                &job.job_id,
                JobPatch::new()
                    .artifact(artifact::MODEL, model_url.as_str())
                    .processed()
                    .uploaded()
                    .status(JobStatus::complete(job.stage)),
            )
            .await?;
        info!(model_url = %model_url, "fine-tuning complete");
        Ok(job)
    }
}

fn awaiting_provider(job: &Job) -> bool {
    matches!(
        job.status,
        JobStatus::DataGeneration(
            DataGenerationStatus::Submitted | DataGenerationStatus::ExternalProcessing
        )
    )
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
