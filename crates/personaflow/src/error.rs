use thiserror::Error;

use crate::jobs::JobStatus;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job {0} already exists")]
    Duplicate(String),

    #[error("job {0} not found")]
    NotFound(String),

    #[error("job {job_id}: invalid transition {from} -> {to}")]
    InvalidTransition {
        job_id: String,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("job {job_id}: {reason}")]
    Conflict { job_id: String, reason: String },

    #[error("job {job_id}: corrupt row: {reason}")]
    Corrupt { job_id: String, reason: String },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Database(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            ),
            _ => false,
        }
    }
}

/// Errors from the batch-inference provider.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// Network failure, rate limit, 5xx. Worth trying again.
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("provider rejected request: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, Error)]
pub enum ArtifactError {
    #[error("artifact store unavailable: {0}")]
    Unavailable(String),

    #[error("artifact not found: {0}")]
    NotFound(String),

    #[error("invalid artifact uri: {0}")]
    InvalidUri(String),
}

#[derive(Debug, Clone, Error)]
pub enum TrainerError {
    #[error("trainer unavailable: {0}")]
    Unavailable(String),

    #[error("trainer rejected request: {0}")]
    Rejected(String),
}

/// Failure taxonomy of the orchestration engine.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("submission failed: {0}")]
    Submission(String),

    #[error("transient provider error: {0}")]
    TransientProvider(String),

    #[error("transient store error: {0}")]
    TransientStore(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("artifact error: {0}")]
    Artifact(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("chaining failed: {0}")]
    Chaining(String),

    #[error("no job with external_ref {0}")]
    UnknownExternalRef(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("watcher cancelled")]
    Cancelled,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl PipelineError {
    pub fn is_transient(&self) -> bool {
        match self {
            PipelineError::TransientProvider(_) | PipelineError::TransientStore(_) => true,
            PipelineError::Store(e) => e.is_transient(),
            _ => false,
        }
    }
}

impl From<ProviderError> for PipelineError {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::Unavailable(msg) => PipelineError::TransientProvider(msg),
            ProviderError::Rejected(msg) => PipelineError::Provider(msg),
        }
    }
}

impl From<ArtifactError> for PipelineError {
    fn from(e: ArtifactError) -> Self {
        match e {
            ArtifactError::Unavailable(msg) => PipelineError::TransientStore(msg),
            other => PipelineError::Artifact(other.to_string()),
        }
    }
}

impl From<TrainerError> for PipelineError {
    fn from(e: TrainerError) -> Self {
        match e {
            TrainerError::Unavailable(msg) => PipelineError::TransientProvider(msg),
            TrainerError::Rejected(msg) => PipelineError::Provider(msg),
        }
    }
}
