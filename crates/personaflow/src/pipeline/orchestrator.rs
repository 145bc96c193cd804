use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::clients::ProviderStatus;
use crate::config::{NotifyMode, PipelineConfig};
use crate::error::PipelineError;
use crate::jobs::{Job, JobStore, NewJob, Stage};
use crate::pipeline::chainer::Chainer;
use crate::pipeline::reconciler::{ReconcileReport, Reconciler};
use crate::pipeline::registry::WatcherRegistry;
use crate::pipeline::results::ResultPipeline;
use crate::pipeline::watcher::StageWatcher;
use crate::pipeline::Deps;

struct Inner {
    deps: Deps,
    cfg: PipelineConfig,
    results: ResultPipeline,
    chainer: Chainer,
    registry: WatcherRegistry,
    /// Cancelled in this process; pushed events leave these idle until the
    /// next reconciliation.
    cancelled: Mutex<HashSet<String>>,
    shutdown: CancellationToken,
}

/// Per-process owner of the pipeline: injected collaborators, the watcher
/// registry and the shutdown signal. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(deps: Deps, cfg: PipelineConfig) -> Self {
        let results = ResultPipeline::new(deps.clone(), cfg.clone());
        let chainer = Chainer::new(deps.clone(), cfg.clone());
        Self {
            inner: Arc::new(Inner {
                deps,
                cfg,
                results,
                chainer,
                registry: WatcherRegistry::new(),
                cancelled: Mutex::new(HashSet::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.inner.deps.store
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.cfg
    }

    pub(crate) fn deps(&self) -> &Deps {
        &self.inner.deps
    }

    pub(crate) fn results(&self) -> &ResultPipeline {
        &self.inner.results
    }

    pub(crate) fn registry(&self) -> &WatcherRegistry {
        &self.inner.registry
    }

    fn cancelled(&self) -> MutexGuard<'_, HashSet<String>> {
        self.inner.cancelled.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Persist a new data-generation job and start watching it.
    pub async fn create_job(&self, new: NewJob) -> Result<Job, PipelineError> {
        if new.stage != Stage::DataGeneration {
            return Err(PipelineError::InvalidRequest(
                "fine-tuning jobs are only created by chaining".to_string(),
            ));
        }
        if new.expected_units <= 0 {
            return Err(PipelineError::InvalidRequest(
                "expected_units must be > 0".to_string(),
            ));
        }
        if new.job_id.trim().is_empty() || new.subject_id.trim().is_empty() {
            return Err(PipelineError::InvalidRequest(
                "job_id and subject_id are required".to_string(),
            ));
        }

        let job = self.inner.deps.store.create(new).await?;
        info!(job_id = %job.job_id, subject_id = %job.subject_id, units = job.expected_units, "job created");
        self.attach(&job, false);
        Ok(job)
    }

    /// Start a watcher for `job` unless one is running or the job is
    /// terminal. Returns whether a watcher was started.
    pub fn attach(&self, job: &Job, resumed: bool) -> bool {
        if job.status.is_terminal() || self.inner.shutdown.is_cancelled() {
            return false;
        }

        let Some(reg) = self
            .inner
            .registry
            .try_register(&job.job_id, self.inner.shutdown.child_token())
        else {
            debug!(job_id = %job.job_id, "already watched");
            return false;
        };

        let generation = reg.generation;
        let span = info_span!("watcher", job_id = %job.job_id, stage = %job.stage);
        let watcher = StageWatcher::new(self.clone(), job.job_id.clone(), reg, resumed);
        let task = tokio::spawn(watcher.run().instrument(span));
        self.inner.registry.set_task(&job.job_id, generation, task);
        true
    }

    /// Pushed provider notification. Idempotent; events for terminal jobs
    /// are dropped.
    pub async fn on_external_event(
        &self,
        external_ref: &str,
        status: ProviderStatus,
    ) -> Result<(), PipelineError> {
        let job = self
            .inner
            .deps
            .store
            .get_by_external_ref(external_ref)
            .await?
            .ok_or_else(|| PipelineError::UnknownExternalRef(external_ref.to_string()))?;

        if job.stage != Stage::DataGeneration {
            warn!(job_id = %job.job_id, external_ref, "event for a non-batch job ignored");
            return Ok(());
        }
        if job.status.is_terminal() {
            debug!(job_id = %job.job_id, status = %job.status, "event for terminal job ignored");
            return Ok(());
        }
        if self.inner.cfg.notify_mode == NotifyMode::Poll {
            debug!(job_id = %job.job_id, "push event ignored in poll mode");
            return Ok(());
        }

        if !self.inner.registry.notify(&job.job_id, status) {
            if self.cancelled().contains(&job.job_id) {
                debug!(job_id = %job.job_id, "event for a cancelled job left for reconciliation");
                return Ok(());
            }
            self.attach(&job, false);
            if !self.inner.registry.notify(&job.job_id, status) {
                warn!(job_id = %job.job_id, "no watcher took the event; reconciliation will re-verify");
            }
        }
        Ok(())
    }

    /// Stop the job's watcher. Nothing is written; the job is picked up
    /// again by the next reconciliation.
    pub fn cancel(&self, job_id: &str) -> bool {
        let found = self.inner.registry.cancel(job_id);
        if found {
            self.cancelled().insert(job_id.to_string());
            info!(job_id, "watcher cancel requested");
        }
        found
    }

    pub fn is_watched(&self, job_id: &str) -> bool {
        self.inner.registry.contains(job_id)
    }

    pub fn active_watchers(&self) -> usize {
        self.inner.registry.len()
    }

    /// Run the result pipeline for a stage-1 job outside a watcher.
    pub async fn process_result(&self, job_id: &str) -> Result<Job, PipelineError> {
        self.inner.results.process(job_id, &self.inner.shutdown).await
    }

    /// Chain the stage-2 job for a completed stage-1 job and watch it.
    pub async fn maybe_chain(&self, job_id: &str) -> Result<Option<Job>, PipelineError> {
        let created = self
            .inner
            .chainer
            .maybe_chain(job_id, &self.inner.shutdown)
            .await?;
        if let Some(job) = &created {
            self.attach(job, false);
        }
        Ok(created)
    }

    pub(crate) async fn repair_upload(&self, job_id: &str) -> Result<Job, PipelineError> {
        self.inner
            .results
            .repair_upload(job_id, &self.inner.shutdown)
            .await
    }

    pub async fn reconcile(&self) -> ReconcileReport {
        self.cancelled().clear();
        Reconciler::new(self.clone()).run().await
    }

    /// Cancel every watcher and wait for them to exit.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let tasks = self.inner.registry.drain();
        let n = tasks.len();
        for res in futures::future::join_all(tasks).await {
            if let Err(e) = res {
                warn!(error = %e, "watcher task did not exit cleanly");
            }
        }
        info!(watchers = n, "orchestrator stopped");
    }
}
