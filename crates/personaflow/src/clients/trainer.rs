use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::error::TrainerError;

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingRequest {
    pub job_id: String,
    pub subject_id: String,
    pub dataset_uri: String,
    pub base_model: String,
    pub repo_id: String,
    pub epochs: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TrainingStatus {
    Running,
    Succeeded { checkpoint_uri: String },
    Failed { reason: String },
}

/// Fine-tuning backend driven by stage 2.
#[async_trait]
pub trait ModelTrainer: Send + Sync {
    /// Returns the run id. Starting the same job twice while its run is
    /// alive returns the existing id.
    async fn start(&self, req: &TrainingRequest) -> Result<String, TrainerError>;

    async fn get_status(&self, run_id: &str) -> Result<TrainingStatus, TrainerError>;

    /// Returns the public model URL.
    async fn publish(&self, run_id: &str, repo_id: &str) -> Result<String, TrainerError>;
}

pub fn model_url(repo_id: &str) -> String {
    format!("https://huggingface.co/{repo_id}")
}

#[derive(Debug, Clone)]
enum RunState {
    Running,
    Exited { success: bool, detail: String },
}

/// Runs the configured training command as a child process per job.
///
/// Run state lives in this process only. After a restart every earlier run
/// id reports `Failed`, and the fine-tuning job fails with it.
pub struct ProcessTrainer {
    program: String,
    args: Vec<String>,
    publish_cmd: Option<Vec<String>>,
    work_dir: PathBuf,
    runs: Arc<Mutex<HashMap<String, RunState>>>,
}

impl ProcessTrainer {
    pub fn new(command: Vec<String>, work_dir: impl Into<PathBuf>) -> Result<Self, TrainerError> {
        let mut parts = command.into_iter();
        let program = parts
            .next()
            .ok_or_else(|| TrainerError::Rejected("empty trainer command".into()))?;

        Ok(Self {
            program,
            args: parts.collect(),
            publish_cmd: None,
            work_dir: work_dir.into(),
            runs: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn with_publish_cmd(mut self, cmd: Option<Vec<String>>) -> Self {
        self.publish_cmd = cmd.filter(|c| !c.is_empty());
        self
    }

    fn run_id_for(job_id: &str) -> String {
        format!("run-{job_id}")
    }

    fn output_dir(&self, run_id: &str) -> PathBuf {
        self.work_dir.join(run_id)
    }

    fn state(&self, run_id: &str) -> Option<RunState> {
        self.runs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(run_id)
            .cloned()
    }
}

fn set_run_state(runs: &Mutex<HashMap<String, RunState>>, run_id: &str, state: RunState) {
    runs.lock()
        .unwrap_or_else(|p| p.into_inner())
        .insert(run_id.to_string(), state);
}

#[async_trait]
impl ModelTrainer for ProcessTrainer {
    async fn start(&self, req: &TrainingRequest) -> Result<String, TrainerError> {
        let run_id = Self::run_id_for(&req.job_id);
        if matches!(self.state(&run_id), Some(RunState::Running)) {
            return Ok(run_id);
        }

        let output_dir = self.output_dir(&run_id);
        tokio::fs::create_dir_all(&output_dir)
            .await
            .map_err(|e| TrainerError::Unavailable(format!("{}: {e}", output_dir.display())))?;

        let dataset_path = req
            .dataset_uri
            .strip_prefix("file://")
            .unwrap_or(&req.dataset_uri);

        let mut child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .env("PERSONAFLOW_RUN_ID", &run_id)
            .env("PERSONAFLOW_SUBJECT_ID", &req.subject_id)
            .env("PERSONAFLOW_DATASET_URI", &req.dataset_uri)
            .env("PERSONAFLOW_DATASET_PATH", dataset_path)
            .env("PERSONAFLOW_BASE_MODEL", &req.base_model)
            .env("PERSONAFLOW_REPO_ID", &req.repo_id)
            .env("PERSONAFLOW_EPOCHS", req.epochs.to_string())
            .env("PERSONAFLOW_OUTPUT_DIR", &output_dir)
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| TrainerError::Rejected(format!("spawn {}: {e}", self.program)))?;

        set_run_state(&self.runs, &run_id, RunState::Running);
        info!(job_id = %req.job_id, run_id = %run_id, repo_id = %req.repo_id, "training run started");

        let runs = self.runs.clone();
        let id = run_id.clone();
        tokio::spawn(async move {
            let state = match child.wait().await {
                Ok(status) => RunState::Exited {
                    success: status.success(),
                    detail: status.to_string(),
                },
                Err(e) => RunState::Exited {
                    success: false,
                    detail: format!("wait failed: {e}"),
                },
            };
            set_run_state(&runs, &id, state);
        });

        Ok(run_id)
    }

    async fn get_status(&self, run_id: &str) -> Result<TrainingStatus, TrainerError> {
        Ok(match self.state(run_id) {
            Some(RunState::Running) => TrainingStatus::Running,
            Some(RunState::Exited { success: true, .. }) => TrainingStatus::Succeeded {
                checkpoint_uri: format!("file://{}", self.output_dir(run_id).display()),
            },
            Some(RunState::Exited { success: false, detail }) => TrainingStatus::Failed {
                reason: format!("trainer exited with {detail}"),
            },
            None => TrainingStatus::Failed {
                reason: format!("run {run_id} is unknown to this trainer"),
            },
        })
    }

    async fn publish(&self, run_id: &str, repo_id: &str) -> Result<String, TrainerError> {
        // without a publish command the training script pushes the model itself
        let Some(cmd) = &self.publish_cmd else {
            return Ok(model_url(repo_id));
        };

        let status = tokio::process::Command::new(&cmd[0])
            .args(&cmd[1..])
            .env("PERSONAFLOW_RUN_ID", run_id)
            .env("PERSONAFLOW_REPO_ID", repo_id)
            .env("PERSONAFLOW_CHECKPOINT_DIR", self.output_dir(run_id))
            .stdin(Stdio::null())
            .status()
            .await
            .map_err(|e| TrainerError::Unavailable(format!("spawn {}: {e}", cmd[0])))?;

        if !status.success() {
            warn!(run_id, repo_id, %status, "publish command failed");
            return Err(TrainerError::Rejected(format!("publish exited with {status}")));
        }
        Ok(model_url(repo_id))
    }
}
