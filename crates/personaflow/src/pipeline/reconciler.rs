use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::jobs::{cutoff_days, DataGenerationStatus, JobFilter, JobStatus, Stage};
use crate::pipeline::orchestrator::Orchestrator;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub reattached: usize,
    pub chained: usize,
    pub repaired: usize,
    pub purged: usize,
    /// Items that failed and were skipped.
    pub failures: usize,
}

/// Rebuilds in-memory state from the job store after a restart. Every pass
/// is idempotent and a failing item never stops its pass.
pub struct Reconciler {
    orch: Orchestrator,
}

impl Reconciler {
    pub fn new(orch: Orchestrator) -> Self {
        Self { orch }
    }

    pub async fn run(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        self.reattach(&mut report).await;
        self.rechain(&mut report).await;
        self.repair_uploads(&mut report).await;
        self.purge_failed(&mut report).await;

        info!(
            reattached = report.reattached,
            chained = report.chained,
            repaired = report.repaired,
            purged = report.purged,
            failures = report.failures,
            "reconciliation finished"
        );
        report
    }

    async fn reattach(&self, report: &mut ReconcileReport) {
        let jobs = match self.orch.store().list(&JobFilter::non_terminal()).await {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(error = %e, "listing non-terminal jobs failed");
                report.failures += 1;
                return;
            }
        };

        for job in jobs {
            if self.orch.attach(&job, true) {
                debug!(job_id = %job.job_id, status = %job.status, "watcher re-attached");
                report.reattached += 1;
            }
        }
    }

    async fn rechain(&self, report: &mut ReconcileReport) {
        let filter = JobFilter {
            is_chained: Some(false),
            is_uploaded: Some(true),
            ..JobFilter::with_status(JobStatus::DataGeneration(DataGenerationStatus::Complete))
        };
        let jobs = match self.orch.store().list(&filter).await {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(error = %e, "listing unchained jobs failed");
                report.failures += 1;
                return;
            }
        };

        let cap = self.orch.config().max_chain_attempts;
        for job in jobs {
            if job.chain_attempts >= cap {
                debug!(job_id = %job.job_id, attempts = job.chain_attempts, "chaining abandoned; skipped");
                continue;
            }
            match self.orch.maybe_chain(&job.job_id).await {
                Ok(Some(_)) => report.chained += 1,
                Ok(None) => {}
                Err(e) => {
                    warn!(job_id = %job.job_id, error = %e, "re-chaining failed");
                    report.failures += 1;
                }
            }
        }
    }

    async fn repair_uploads(&self, report: &mut ReconcileReport) {
        let filter = JobFilter {
            is_uploaded: Some(false),
            ..JobFilter::with_status(JobStatus::complete(Stage::DataGeneration))
        };
        let jobs = match self.orch.store().list(&filter).await {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(error = %e, "listing unuploaded jobs failed");
                report.failures += 1;
                return;
            }
        };

        for job in jobs {
            match self.orch.repair_upload(&job.job_id).await {
                Ok(repaired) if repaired.is_uploaded => {
                    report.repaired += 1;
                    match self.orch.maybe_chain(&repaired.job_id).await {
                        Ok(Some(_)) => report.chained += 1,
                        Ok(None) => {}
                        Err(e) => {
                            warn!(job_id = %job.job_id, error = %e, "chaining after repair failed");
                            report.failures += 1;
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(job_id = %job.job_id, error = %e, "upload repair failed");
                    report.failures += 1;
                }
            }
        }
    }

    async fn purge_failed(&self, report: &mut ReconcileReport) {
        let days = self.orch.config().failed_retention_days;
        let filter = JobFilter {
            statuses: vec![
                JobStatus::failed(Stage::DataGeneration),
                JobStatus::failed(Stage::FineTuning),
            ],
            updated_before: Some(cutoff_days(days)),
            ..Default::default()
        };
        let jobs = match self.orch.store().list(&filter).await {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(error = %e, "listing failed jobs failed");
                report.failures += 1;
                return;
            }
        };

        for job in jobs {
            match self.orch.store().delete(&job.job_id).await {
                Ok(()) => report.purged += 1,
                Err(e) => {
                    warn!(job_id = %job.job_id, error = %e, "purge failed");
                    report.failures += 1;
                }
            }
        }
    }
}
