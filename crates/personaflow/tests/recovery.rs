mod common;

use bytes::Bytes;
use chrono::{Duration as ChronoDuration, Utc};
use common::{
    batch_output, external_ref_for, pipeline_config, wait_for, wait_idle, wait_terminal,
    FakeArtifacts, FakeProvider, Harness,
};
use personaflow::clients::ProviderStatus;
use personaflow::jobs::{
    artifact, DataGenerationStatus, Job, JobFilter, JobStatus, JobStore, NewJob, Stage,
};
use personaflow::pipeline::chainer::fine_tuning_job_id;
use personaflow::{NotifyMode, PipelineError, ReconcileReport};
use std::time::Duration;

const PROCESSED_KEY: &str = "jobs/J1/processed_result.json";
const RAW_KEY: &str = "jobs/J1/raw_result.jsonl";

fn processed_json(job_id: &str, n: usize) -> Bytes {
    let pairs: Vec<_> = (1..=n)
        .map(|i| serde_json::json!({ "question": format!("질문 {i}"), "answer": format!("답변 {i}") }))
        .collect();
    Bytes::from(
        serde_json::json!({ "job_id": job_id, "subject_id": "s1", "qa_pairs": pairs }).to_string(),
    )
}

fn dg_status(st: DataGenerationStatus) -> JobStatus {
    JobStatus::DataGeneration(st)
}

/// A stage-1 job that finished and uploaded its artifact but was never
/// chained.
async fn stage_unchained(h: &Harness, with_blob: bool) -> Job {
    let uri = if with_blob {
        h.artifacts.put(PROCESSED_KEY, processed_json("J1", 30))
    } else {
        FakeArtifacts::uri(PROCESSED_KEY)
    };
    h.stage(NewJob::data_generation("J1", "s1", 30), |j| {
        j.status = JobStatus::complete(Stage::DataGeneration);
        j.external_ref = Some(external_ref_for("J1"));
        j.produced_units = 30;
        j.is_processed = true;
        j.is_uploaded = true;
        j.artifact_refs
            .insert(artifact::PROCESSED_RESULT.to_string(), uri);
        j.completed_at = Some(Utc::now());
    })
    .await
}

async fn fine_tuning_jobs(h: &Harness) -> Vec<Job> {
    h.store
        .list(&JobFilter {
            stage: Some(Stage::FineTuning),
            ..Default::default()
        })
        .await
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn crash_after_external_complete_completes_once_without_reupload() {
    let cfg = pipeline_config(NotifyMode::Poll);
    let h = Harness::new(cfg.clone(), FakeProvider::completing());

    // previous process cached the raw blob, then died mid-processing
    let raw_uri = h.artifacts.put(RAW_KEY, batch_output("J1", 40));
    h.stage(NewJob::data_generation("J1", "s1", 40), |j| {
        j.status = dg_status(DataGenerationStatus::ResultProcessing);
        j.external_ref = Some(external_ref_for("J1"));
        j.artifact_refs
            .insert(artifact::RAW_RESULT.to_string(), raw_uri);
    })
    .await;

    let orch = h.restart(cfg);
    let report = orch.reconcile().await;
    assert_eq!(report.reattached, 1);

    let j1 = wait_for(&*h.store, "J1", |j| j.is_chained).await;
    wait_idle(&orch).await;

    assert_eq!(j1.status, JobStatus::complete(Stage::DataGeneration));
    assert_eq!(j1.produced_units, 40);
    assert!(j1.is_processed && j1.is_uploaded);
    assert_eq!(h.provider.fetches(), 0);
    assert_eq!(h.artifacts.uploads_of(RAW_KEY), 0);
    assert_eq!(h.artifacts.uploads_of(PROCESSED_KEY), 1);

    // a second pass finds nothing left to do
    let again = orch.reconcile().await;
    assert_eq!(again, ReconcileReport::default());
    assert_eq!(h.artifacts.uploads_of(PROCESSED_KEY), 1);
    assert_eq!(fine_tuning_jobs(&h).await.len(), 1);

    orch.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn crash_after_upload_finalizes_from_the_uploaded_artifact() {
    let h = Harness::new(pipeline_config(NotifyMode::Poll), FakeProvider::completing());

    let uri = h.artifacts.put(PROCESSED_KEY, processed_json("J1", 12));
    h.stage(NewJob::data_generation("J1", "s1", 12), |j| {
        j.status = dg_status(DataGenerationStatus::ResultProcessing);
        j.external_ref = Some(external_ref_for("J1"));
        j.is_uploaded = true;
        j.artifact_refs
            .insert(artifact::PROCESSED_RESULT.to_string(), uri);
    })
    .await;

    h.orch.reconcile().await;
    let j1 = wait_for(&*h.store, "J1", |j| j.is_chained).await;
    wait_idle(&h.orch).await;

    assert_eq!(j1.status, JobStatus::complete(Stage::DataGeneration));
    assert!(j1.is_processed);
    assert_eq!(j1.produced_units, 12);
    assert_eq!(h.provider.fetches(), 0);
    assert_eq!(h.artifacts.uploads_of(PROCESSED_KEY), 0);
}

#[tokio::test(start_paused = true)]
async fn restart_during_external_processing_repolls_and_completes() {
    let h = Harness::new(pipeline_config(NotifyMode::Poll), FakeProvider::completing());
    let ext = external_ref_for("J1");
    h.provider.seed_batch(&ext, "J1", 100);

    h.stage(NewJob::data_generation("J1", "s1", 100), |j| {
        j.status = dg_status(DataGenerationStatus::ExternalProcessing);
        j.external_ref = Some(ext.clone());
    })
    .await;

    let report = h.orch.reconcile().await;
    assert_eq!(report.reattached, 1);

    let j1 = wait_for(&*h.store, "J1", |j| j.is_chained).await;
    wait_idle(&h.orch).await;

    assert_eq!(j1.status, JobStatus::complete(Stage::DataGeneration));
    assert_eq!(j1.produced_units, 100);
    assert_eq!(h.provider.submissions(), 0);
    assert!(h.provider.status_calls() >= 2);

    let ft = h.job(&fine_tuning_job_id("J1")).await;
    assert_eq!(ft.status, JobStatus::complete(Stage::FineTuning));
}

#[tokio::test(start_paused = true)]
async fn push_mode_restart_reverifies_before_waiting() {
    let h = Harness::new(
        pipeline_config(NotifyMode::Push),
        FakeProvider::new(vec![ProviderStatus::Complete]),
    );
    let ext = external_ref_for("J1");
    h.provider.seed_batch(&ext, "J1", 20);

    h.stage(NewJob::data_generation("J1", "s1", 20), |j| {
        j.status = dg_status(DataGenerationStatus::Submitted);
        j.external_ref = Some(ext.clone());
    })
    .await;

    h.orch.reconcile().await;
    let j1 = wait_for(&*h.store, "J1", |j| j.is_chained).await;
    wait_idle(&h.orch).await;

    // no event was ever pushed; the resumed watcher asked once
    assert_eq!(h.provider.status_calls(), 1);
    assert_eq!(j1.status, JobStatus::complete(Stage::DataGeneration));
    assert_eq!(j1.produced_units, 20);
}

/// A batch the provider finished while no process was running, recorded
/// as still processing and older than the wait ceiling.
async fn stage_overdue(h: &Harness) {
    let ext = external_ref_for("J1");
    h.provider.seed_batch(&ext, "J1", 25);
    h.stage(NewJob::data_generation("J1", "s1", 25), |j| {
        j.status = dg_status(DataGenerationStatus::ExternalProcessing);
        j.external_ref = Some(ext.clone());
        j.created_at = Utc::now() - ChronoDuration::hours(3);
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn overdue_restart_checks_the_provider_before_timing_out() {
    for mode in [NotifyMode::Poll, NotifyMode::Push] {
        let mut cfg = pipeline_config(mode);
        cfg.max_wait = Duration::from_secs(2 * 60 * 60);
        let h = Harness::new(cfg, FakeProvider::new(vec![ProviderStatus::Complete]));
        stage_overdue(&h).await;

        assert_eq!(h.orch.reconcile().await.reattached, 1);
        let j1 = wait_for(&*h.store, "J1", |j| j.is_chained).await;
        wait_idle(&h.orch).await;

        assert_eq!(j1.status, JobStatus::complete(Stage::DataGeneration), "{mode:?}");
        assert_eq!(j1.produced_units, 25, "{mode:?}");
        assert!(j1.error_message.is_none(), "{mode:?}");
        assert_eq!(h.provider.status_calls(), 1, "{mode:?}");
    }
}

#[tokio::test(start_paused = true)]
async fn overdue_restart_still_times_out_when_the_batch_is_running() {
    for mode in [NotifyMode::Poll, NotifyMode::Push] {
        let mut cfg = pipeline_config(mode);
        cfg.max_wait = Duration::from_secs(2 * 60 * 60);
        let h = Harness::new(cfg, FakeProvider::new(vec![ProviderStatus::Processing]));
        stage_overdue(&h).await;

        h.orch.reconcile().await;
        let j1 = wait_terminal(&*h.store, "J1").await;
        wait_idle(&h.orch).await;

        assert_eq!(j1.status, JobStatus::failed(Stage::DataGeneration), "{mode:?}");
        assert!(j1.error_message.unwrap().starts_with("timeout:"), "{mode:?}");
        assert!(h.provider.status_calls() >= 1, "{mode:?}");
        assert_eq!(h.provider.fetches(), 0, "{mode:?}");
    }
}

#[tokio::test(start_paused = true)]
async fn transient_upload_failure_is_retried_in_place() {
    let h = Harness::new(pipeline_config(NotifyMode::Poll), FakeProvider::completing());
    let raw_uri = h.artifacts.put(RAW_KEY, batch_output("J1", 8));
    h.stage(NewJob::data_generation("J1", "s1", 8), |j| {
        j.status = dg_status(DataGenerationStatus::ExternalComplete);
        j.external_ref = Some(external_ref_for("J1"));
        j.artifact_refs
            .insert(artifact::RAW_RESULT.to_string(), raw_uri);
    })
    .await;
    h.artifacts.fail_uploads(1);

    let job = h.orch.process_result("J1").await.unwrap();

    assert_eq!(job.status, JobStatus::complete(Stage::DataGeneration));
    assert!(job.is_processed && job.is_uploaded);
    assert_eq!(job.produced_units, 8);
    assert!(job.error_message.is_none());
    assert_eq!(h.artifacts.uploads_of(PROCESSED_KEY), 1);
    assert_eq!(h.provider.fetches(), 0);
}

#[tokio::test(start_paused = true)]
async fn process_result_is_idempotent() {
    let h = Harness::new(pipeline_config(NotifyMode::Poll), FakeProvider::completing());
    let ext = external_ref_for("J1");
    h.provider.seed_batch(&ext, "J1", 15);

    h.stage(NewJob::data_generation("J1", "s1", 15), |j| {
        j.status = dg_status(DataGenerationStatus::ExternalComplete);
        j.external_ref = Some(ext.clone());
    })
    .await;

    let first = h.orch.process_result("J1").await.unwrap();
    assert!(first.is_processed);
    let first_completed = first.completed_at;

    for _ in 0..3 {
        let again = h.orch.process_result("J1").await.unwrap();
        assert_eq!(again, first);
    }

    assert_eq!(first.status, JobStatus::complete(Stage::DataGeneration));
    assert_eq!(first.produced_units, 15);
    assert!(first_completed.is_some());
    assert_eq!(h.provider.fetches(), 1);
    assert_eq!(h.artifacts.uploads_of(PROCESSED_KEY), 1);
    assert_eq!(h.artifacts.uploads_of(RAW_KEY), 1);
}

#[tokio::test(start_paused = true)]
async fn process_result_requires_a_finished_batch() {
    let h = Harness::new(pipeline_config(NotifyMode::Poll), FakeProvider::completing());
    h.stage(NewJob::data_generation("J1", "s1", 5), |_| {}).await;

    let err = h.orch.process_result("J1").await.unwrap_err();
    assert!(matches!(err, PipelineError::InvalidRequest(_)));
    assert_eq!(h.job("J1").await.status, JobStatus::pending(Stage::DataGeneration));
}

#[tokio::test(start_paused = true)]
async fn empty_result_fails_the_job() {
    let h = Harness::new(pipeline_config(NotifyMode::Poll), FakeProvider::completing());
    let ext = external_ref_for("J1");
    h.provider.seed_batch(&ext, "J1", 0);

    h.stage(NewJob::data_generation("J1", "s1", 5), |j| {
        j.status = dg_status(DataGenerationStatus::ExternalComplete);
        j.external_ref = Some(ext.clone());
    })
    .await;

    let job = h.orch.process_result("J1").await.unwrap();
    assert_eq!(job.status, JobStatus::failed(Stage::DataGeneration));
    assert!(!job.is_processed);
    assert!(job.error_message.unwrap().starts_with("parse error"));
}

#[tokio::test(start_paused = true)]
async fn repeated_reconciliation_chains_once() {
    let h = Harness::new(pipeline_config(NotifyMode::Poll), FakeProvider::completing());
    stage_unchained(&h, true).await;

    let first = h.orch.reconcile().await;
    assert_eq!(first.chained, 1);
    for _ in 0..3 {
        let report = h.orch.reconcile().await;
        assert_eq!(report.chained, 0);
        assert_eq!(report.failures, 0);
    }

    let ft = fine_tuning_jobs(&h).await;
    assert_eq!(ft.len(), 1);
    assert_eq!(ft[0].job_id, "ft-J1");
    assert_eq!(ft[0].expected_units, 30);
    assert!(h.job("J1").await.is_chained);

    let ft = wait_for(&*h.store, "ft-J1", |j| j.status.is_terminal()).await;
    assert_eq!(ft.status, JobStatus::complete(Stage::FineTuning));
    h.orch.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn chaining_gives_up_after_the_attempt_cap() {
    let mut cfg = pipeline_config(NotifyMode::Poll);
    cfg.max_chain_attempts = 3;
    let h = Harness::new(cfg, FakeProvider::completing());
    // artifact ref points at a blob that is gone
    stage_unchained(&h, false).await;

    let report = h.orch.reconcile().await;
    assert_eq!(report.failures, 1);
    let j1 = h.job("J1").await;
    assert_eq!(j1.chain_attempts, 1);
    assert!(j1.error_message.unwrap().starts_with("chaining failed:"));
    assert_eq!(j1.status, JobStatus::complete(Stage::DataGeneration));

    for _ in 0..4 {
        h.orch.reconcile().await;
    }

    let j1 = h.job("J1").await;
    assert_eq!(j1.chain_attempts, 3);
    assert!(!j1.is_chained);
    assert!(j1
        .error_message
        .unwrap()
        .starts_with("chaining abandoned after 3 attempts"));
    assert!(fine_tuning_jobs(&h).await.is_empty());
    assert_eq!(h.orch.reconcile().await, ReconcileReport::default());
}

#[tokio::test(start_paused = true)]
async fn concurrent_chaining_failures_are_all_counted() {
    let h = Harness::new(pipeline_config(NotifyMode::Poll), FakeProvider::completing());
    stage_unchained(&h, false).await;

    let (a, b) = tokio::join!(h.orch.maybe_chain("J1"), h.orch.maybe_chain("J1"));
    assert!(matches!(a, Err(PipelineError::Chaining(_))));
    assert!(matches!(b, Err(PipelineError::Chaining(_))));

    let j1 = h.job("J1").await;
    assert_eq!(j1.chain_attempts, 2);
    assert!(!j1.is_chained);
}

#[tokio::test(start_paused = true)]
async fn chaining_recovers_once_the_artifact_is_back() {
    let h = Harness::new(pipeline_config(NotifyMode::Poll), FakeProvider::completing());
    stage_unchained(&h, false).await;

    assert_eq!(h.orch.reconcile().await.failures, 1);
    h.artifacts.put(PROCESSED_KEY, processed_json("J1", 30));
    assert_eq!(h.orch.reconcile().await.chained, 1);

    let j1 = h.job("J1").await;
    assert!(j1.is_chained);
    assert!(j1.error_message.is_none());
    assert_eq!(j1.chain_attempts, 1);
    h.orch.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn missing_upload_flag_is_repaired_without_uploading() {
    let h = Harness::new(pipeline_config(NotifyMode::Poll), FakeProvider::completing());
    let uri = h.artifacts.put(PROCESSED_KEY, processed_json("J1", 30));
    h.stage(NewJob::data_generation("J1", "s1", 30), |j| {
        j.status = JobStatus::complete(Stage::DataGeneration);
        j.external_ref = Some(external_ref_for("J1"));
        j.produced_units = 30;
        j.is_processed = true;
        j.artifact_refs
            .insert(artifact::PROCESSED_RESULT.to_string(), uri);
    })
    .await;

    let report = h.orch.reconcile().await;
    assert_eq!(report.repaired, 1);
    assert_eq!(report.chained, 1);

    let j1 = h.job("J1").await;
    assert!(j1.is_uploaded && j1.is_chained);
    assert_eq!(h.artifacts.uploads_of(PROCESSED_KEY), 0);
    h.orch.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn lost_processed_artifact_is_rebuilt_from_the_cached_raw_blob() {
    let h = Harness::new(pipeline_config(NotifyMode::Poll), FakeProvider::completing());
    let raw_uri = h.artifacts.put(RAW_KEY, batch_output("J1", 9));
    h.stage(NewJob::data_generation("J1", "s1", 9), |j| {
        j.status = JobStatus::complete(Stage::DataGeneration);
        j.external_ref = Some(external_ref_for("J1"));
        j.produced_units = 9;
        j.is_processed = true;
        j.artifact_refs
            .insert(artifact::RAW_RESULT.to_string(), raw_uri);
    })
    .await;

    let report = h.orch.reconcile().await;
    assert_eq!(report.repaired, 1);

    let j1 = h.job("J1").await;
    assert!(j1.is_uploaded);
    assert_eq!(
        j1.artifact(artifact::PROCESSED_RESULT),
        Some(FakeArtifacts::uri(PROCESSED_KEY).as_str())
    );
    assert_eq!(h.artifacts.uploads_of(PROCESSED_KEY), 1);
    assert_eq!(h.provider.fetches(), 0);
    h.orch.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn old_failed_jobs_are_purged() {
    let h = Harness::new(pipeline_config(NotifyMode::Poll), FakeProvider::completing());
    let now = Utc::now();

    h.stage(NewJob::data_generation("old-failed", "s1", 5), |j| {
        j.status = JobStatus::failed(Stage::DataGeneration);
        j.updated_at = now - ChronoDuration::days(8);
    })
    .await;
    h.stage(NewJob::data_generation("recent-failed", "s1", 5), |j| {
        j.status = JobStatus::failed(Stage::DataGeneration);
        j.updated_at = now - ChronoDuration::days(1);
    })
    .await;
    let mut old_ft = NewJob::data_generation("old-done", "s1", 5);
    old_ft.stage = Stage::FineTuning;
    h.stage(old_ft, |j| {
        j.status = JobStatus::complete(Stage::FineTuning);
        j.updated_at = now - ChronoDuration::days(30);
    })
    .await;

    let report = h.orch.reconcile().await;
    assert_eq!(report.purged, 1);

    assert!(h.store.get("old-failed").await.unwrap().is_none());
    assert!(h.store.get("recent-failed").await.unwrap().is_some());
    assert!(h.store.get("old-done").await.unwrap().is_some());
}

#[tokio::test(start_paused = true)]
async fn delete_refuses_live_jobs() {
    let h = Harness::new(pipeline_config(NotifyMode::Poll), FakeProvider::completing());
    h.stage(NewJob::data_generation("J1", "s1", 5), |_| {}).await;

    assert!(h.store.delete("J1").await.is_err());
    assert_eq!(h.store.len().await, 1);
}
