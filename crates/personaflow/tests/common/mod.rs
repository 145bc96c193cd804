#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use personaflow::clients::trainer::model_url;
use personaflow::clients::{
    ArtifactStore, BatchProvider, BatchSubmission, ModelTrainer, ProviderStatus, SubjectDirectory,
    SubjectRecord, TrainingRequest, TrainingStatus,
};
use personaflow::error::{ArtifactError, ProviderError, TrainerError};
use personaflow::jobs::{Job, JobStore, MemoryJobStore, NewJob};
use personaflow::{Deps, NotifyMode, Orchestrator, PipelineConfig, StoreError};

/// Connects to `TEST_DATABASE_URL` and empties the tables. `None` when the
/// variable is unset so the Postgres tests skip on machines without one.
pub async fn setup_db() -> Option<PgPool> {
    let _ = dotenvy::dotenv();

    let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
        eprintln!("TEST_DATABASE_URL not set; skipping");
        return None;
    };

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .expect("failed to connect to TEST_DATABASE_URL");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("migrations failed");

    sqlx::query("TRUNCATE TABLE jobs, subjects")
        .execute(&pool)
        .await
        .expect("truncate failed");

    Some(pool)
}

pub fn subject(id: &str) -> SubjectRecord {
    SubjectRecord {
        subject_id: id.to_string(),
        name: "하나".to_string(),
        description: "여행 크리에이터".to_string(),
        personality: "밝고 호기심 많음".to_string(),
        mbti: Some("ENFP".to_string()),
        speech_style: Some("반말, 이모지 자주 사용".to_string()),
    }
}

pub fn external_ref_for(job_id: &str) -> String {
    format!("batch-{job_id}")
}

/// One JSONL output line per unit, all in the Q/A shape.
pub fn batch_output(job_id: &str, units: usize) -> Bytes {
    let mut out = String::new();
    for i in 1..=units {
        let line = serde_json::json!({
            "custom_id": format!("{job_id}-{i}"),
            "response": {
                "status_code": 200,
                "body": {
                    "choices": [{
                        "message": { "content": format!("Q: 질문 {i}\nA: 답변 {i}") }
                    }]
                }
            }
        });
        out.push_str(&line.to_string());
        out.push('\n');
    }
    Bytes::from(out)
}

// ----------------------------
// Fake batch provider
// ----------------------------

#[derive(Default)]
struct ProviderState {
    submissions: Vec<BatchSubmission>,
    fetches: usize,
    status_calls: usize,
    // next N status checks answer Unavailable, then the next M never answer
    status_failures: usize,
    status_hangs: usize,
    statuses: HashMap<String, VecDeque<ProviderStatus>>,
    results: HashMap<String, Bytes>,
}

/// Scripted provider. Each batch walks through `script`; the last entry
/// repeats forever.
pub struct FakeProvider {
    script: Vec<ProviderStatus>,
    reject: bool,
    state: Mutex<ProviderState>,
}

impl FakeProvider {
    pub fn new(script: Vec<ProviderStatus>) -> Self {
        Self {
            script,
            reject: false,
            state: Mutex::new(ProviderState::default()),
        }
    }

    pub fn completing() -> Self {
        Self::new(vec![ProviderStatus::Processing, ProviderStatus::Complete])
    }

    pub fn rejecting() -> Self {
        Self {
            reject: true,
            ..Self::new(vec![])
        }
    }

    /// Make a batch known without a submission, as if this process had
    /// submitted it before a restart.
    pub fn seed_batch(&self, external_ref: &str, job_id: &str, units: usize) {
        let mut st = self.state.lock().unwrap();
        st.statuses
            .insert(external_ref.to_string(), self.script.iter().copied().collect());
        st.results
            .insert(external_ref.to_string(), batch_output(job_id, units));
    }

    pub fn submissions(&self) -> usize {
        self.state.lock().unwrap().submissions.len()
    }

    /// The next `n` status checks fail as if the network dropped.
    pub fn fail_status_checks(&self, n: usize) {
        self.state.lock().unwrap().status_failures = n;
    }

    /// The next `n` status checks never return.
    pub fn hang_status_checks(&self, n: usize) {
        self.state.lock().unwrap().status_hangs = n;
    }

    pub fn last_submission(&self) -> Option<BatchSubmission> {
        self.state.lock().unwrap().submissions.last().cloned()
    }

    pub fn fetches(&self) -> usize {
        self.state.lock().unwrap().fetches
    }

    pub fn status_calls(&self) -> usize {
        self.state.lock().unwrap().status_calls
    }
}

#[async_trait]
impl BatchProvider for FakeProvider {
    async fn submit(&self, submission: &BatchSubmission) -> Result<String, ProviderError> {
        if self.reject {
            return Err(ProviderError::Rejected("invalid input file".to_string()));
        }
        let external_ref = external_ref_for(&submission.job_id);
        let mut st = self.state.lock().unwrap();
        st.submissions.push(submission.clone());
        st.statuses
            .insert(external_ref.clone(), self.script.iter().copied().collect());
        st.results.insert(
            external_ref.clone(),
            batch_output(&submission.job_id, submission.requests.len()),
        );
        Ok(external_ref)
    }

    async fn get_status(&self, external_ref: &str) -> Result<ProviderStatus, ProviderError> {
        let hang = {
            let mut st = self.state.lock().unwrap();
            st.status_calls += 1;
            if st.status_failures > 0 {
                st.status_failures -= 1;
                return Err(ProviderError::Unavailable("connection reset".to_string()));
            }
            let hang = st.status_hangs > 0;
            if hang {
                st.status_hangs -= 1;
            }
            hang
        };
        if hang {
            std::future::pending::<()>().await;
        }

        let mut st = self.state.lock().unwrap();
        let queue = st
            .statuses
            .get_mut(external_ref)
            .ok_or_else(|| ProviderError::Rejected(format!("unknown batch {external_ref}")))?;
        let status = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().copied()
        };
        status.ok_or_else(|| ProviderError::Unavailable("no status scripted".to_string()))
    }

    async fn fetch_result(&self, external_ref: &str) -> Result<Bytes, ProviderError> {
        let mut st = self.state.lock().unwrap();
        st.fetches += 1;
        st.results
            .get(external_ref)
            .cloned()
            .ok_or_else(|| ProviderError::Rejected(format!("no output for {external_ref}")))
    }
}

// ----------------------------
// Fake artifact store
// ----------------------------

#[derive(Default)]
pub struct FakeArtifacts {
    blobs: Mutex<HashMap<String, Bytes>>,
    uploads: Mutex<HashMap<String, usize>>,
    upload_failures: Mutex<usize>,
}

impl FakeArtifacts {
    pub fn uri(key: &str) -> String {
        format!("mem://{key}")
    }

    pub fn put(&self, key: &str, bytes: Bytes) -> String {
        self.blobs.lock().unwrap().insert(key.to_string(), bytes);
        Self::uri(key)
    }

    pub fn uploads_of(&self, key: &str) -> usize {
        self.uploads.lock().unwrap().get(key).copied().unwrap_or(0)
    }

    /// The next `n` uploads fail with a transient error.
    pub fn fail_uploads(&self, n: usize) {
        *self.upload_failures.lock().unwrap() = n;
    }

    pub fn total_uploads(&self) -> usize {
        self.uploads.lock().unwrap().values().sum()
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.blobs.lock().unwrap().get(key).cloned()
    }
}

#[async_trait]
impl ArtifactStore for FakeArtifacts {
    async fn upload(&self, bytes: Bytes, key: &str) -> Result<String, ArtifactError> {
        {
            let mut failures = self.upload_failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(ArtifactError::Unavailable("503 from storage".to_string()));
            }
        }
        *self.uploads.lock().unwrap().entry(key.to_string()).or_default() += 1;
        Ok(self.put(key, bytes))
    }

    async fn download(&self, uri: &str) -> Result<Bytes, ArtifactError> {
        let key = uri
            .strip_prefix("mem://")
            .ok_or_else(|| ArtifactError::InvalidUri(uri.to_string()))?;
        self.get(key)
            .ok_or_else(|| ArtifactError::NotFound(uri.to_string()))
    }
}

// ----------------------------
// Fake subjects
// ----------------------------

#[derive(Default)]
pub struct FakeSubjects {
    subjects: Mutex<HashMap<String, SubjectRecord>>,
}

impl FakeSubjects {
    pub fn with(subjects: &[SubjectRecord]) -> Self {
        let map = subjects
            .iter()
            .map(|s| (s.subject_id.clone(), s.clone()))
            .collect();
        Self {
            subjects: Mutex::new(map),
        }
    }
}

#[async_trait]
impl SubjectDirectory for FakeSubjects {
    async fn get_subject(&self, subject_id: &str) -> Result<Option<SubjectRecord>, StoreError> {
        Ok(self.subjects.lock().unwrap().get(subject_id).cloned())
    }
}

// ----------------------------
// Fake trainer
// ----------------------------

#[derive(Default)]
pub struct FakeTrainer {
    fail_with: Option<String>,
    started: Mutex<Vec<TrainingRequest>>,
    published: Mutex<Vec<(String, String)>>,
}

impl FakeTrainer {
    pub fn failing(reason: &str) -> Self {
        Self {
            fail_with: Some(reason.to_string()),
            ..Default::default()
        }
    }

    pub fn started(&self) -> Vec<TrainingRequest> {
        self.started.lock().unwrap().clone()
    }

    pub fn published(&self) -> Vec<(String, String)> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelTrainer for FakeTrainer {
    async fn start(&self, req: &TrainingRequest) -> Result<String, TrainerError> {
        self.started.lock().unwrap().push(req.clone());
        Ok(format!("run-{}", req.job_id))
    }

    async fn get_status(&self, run_id: &str) -> Result<TrainingStatus, TrainerError> {
        Ok(match &self.fail_with {
            Some(reason) => TrainingStatus::Failed {
                reason: reason.clone(),
            },
            None => TrainingStatus::Succeeded {
                checkpoint_uri: format!("mem://checkpoints/{run_id}"),
            },
        })
    }

    async fn publish(&self, run_id: &str, repo_id: &str) -> Result<String, TrainerError> {
        self.published
            .lock()
            .unwrap()
            .push((run_id.to_string(), repo_id.to_string()));
        Ok(model_url(repo_id))
    }
}

// ----------------------------
// Harness
// ----------------------------

pub fn pipeline_config(mode: NotifyMode) -> PipelineConfig {
    let mut cfg = PipelineConfig {
        notify_mode: mode,
        poll_jitter_pct: 0.0,
        ..Default::default()
    };
    cfg.retry.jitter_pct = 0.0;
    cfg
}

pub struct Harness {
    pub store: Arc<MemoryJobStore>,
    pub provider: Arc<FakeProvider>,
    pub artifacts: Arc<FakeArtifacts>,
    pub trainer: Arc<FakeTrainer>,
    pub orch: Orchestrator,
}

impl Harness {
    pub fn new(cfg: PipelineConfig, provider: FakeProvider) -> Self {
        Self::build(cfg, provider, FakeTrainer::default(), &[subject("s1")])
    }

    pub fn build(
        cfg: PipelineConfig,
        provider: FakeProvider,
        trainer: FakeTrainer,
        subjects: &[SubjectRecord],
    ) -> Self {
        let store = Arc::new(MemoryJobStore::new());
        let provider = Arc::new(provider);
        let artifacts = Arc::new(FakeArtifacts::default());
        let trainer = Arc::new(trainer);

        let deps = Deps {
            store: store.clone(),
            provider: provider.clone(),
            artifacts: artifacts.clone(),
            subjects: Arc::new(FakeSubjects::with(subjects)),
            trainer: trainer.clone(),
        };
        let orch = Orchestrator::new(deps, cfg);

        Self {
            store,
            provider,
            artifacts,
            trainer,
            orch,
        }
    }

    /// Same store and fakes, fresh orchestrator: a process restart.
    pub fn restart(&self, cfg: PipelineConfig) -> Orchestrator {
        Orchestrator::new(
            Deps {
                store: self.store.clone(),
                provider: self.provider.clone(),
                artifacts: self.artifacts.clone(),
                subjects: Arc::new(FakeSubjects::with(&[subject("s1")])),
                trainer: self.trainer.clone(),
            },
            cfg,
        )
    }

    pub async fn job(&self, job_id: &str) -> Job {
        self.store
            .get(job_id)
            .await
            .unwrap()
            .unwrap_or_else(|| panic!("job {job_id} missing"))
    }

    /// Write a record directly, as a previous process would have left it.
    pub async fn stage(&self, new: NewJob, edit: impl FnOnce(&mut Job)) -> Job {
        let mut job = Job::from_new(new, Utc::now());
        edit(&mut job);
        self.store.put_raw(job.clone()).await;
        job
    }
}

/// Poll the store until `pred` holds. Runs on paused time, so the bound is
/// virtual and generous.
pub async fn wait_for(store: &dyn JobStore, job_id: &str, pred: impl Fn(&Job) -> bool) -> Job {
    let fut = async {
        loop {
            if let Some(job) = store.get(job_id).await.unwrap() {
                if pred(&job) {
                    return job;
                }
            }
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(72 * 60 * 60), fut)
        .await
        .unwrap_or_else(|_| panic!("job {job_id} never reached the expected state"))
}

pub async fn wait_terminal(store: &dyn JobStore, job_id: &str) -> Job {
    wait_for(store, job_id, |j| j.status.is_terminal()).await
}

/// Wait until no watcher is registered.
pub async fn wait_idle(orch: &Orchestrator) {
    let fut = async {
        while orch.active_watchers() > 0 {
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(72 * 60 * 60), fut)
        .await
        .expect("watchers never finished");
}
