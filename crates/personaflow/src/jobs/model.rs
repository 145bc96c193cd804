use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::error::StoreError;
use crate::jobs::state::{JobStatus, Stage, Transition};

/// Well-known keys of `Job::artifact_refs`.
pub mod artifact {
    pub const RAW_RESULT: &str = "raw_result";
    pub const PROCESSED_RESULT: &str = "processed_result";
    /// Stage-1 processed artifact a fine-tuning job trains on.
    pub const SOURCE_DATA: &str = "source_data";
    pub const TRAINING_DATA: &str = "training_data";
    pub const CHECKPOINT: &str = "checkpoint";
    pub const MODEL: &str = "model";
}

pub type ArtifactRefs = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Job {
    pub job_id: String,
    pub subject_id: String,
    pub stage: Stage,
    pub status: JobStatus,
    pub external_ref: Option<String>,

    pub expected_units: i32,
    pub produced_units: i32,
    pub artifact_refs: ArtifactRefs,
    pub error_message: Option<String>,

    pub is_processed: bool,
    pub is_uploaded: bool,
    pub is_chained: bool,

    pub source_job_id: Option<String>,
    pub chain_attempts: i32,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_id: String,
    pub subject_id: String,
    pub stage: Stage,
    pub expected_units: i32,
    pub source_job_id: Option<String>,
    pub artifact_refs: ArtifactRefs,
}

impl NewJob {
    pub fn data_generation(
        job_id: impl Into<String>,
        subject_id: impl Into<String>,
        expected_units: i32,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            subject_id: subject_id.into(),
            stage: Stage::DataGeneration,
            expected_units,
            source_job_id: None,
            artifact_refs: ArtifactRefs::new(),
        }
    }
}

impl Job {
    pub fn from_new(new: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            job_id: new.job_id,
            subject_id: new.subject_id,
            stage: new.stage,
            status: JobStatus::pending(new.stage),
            external_ref: None,
            expected_units: new.expected_units,
            produced_units: 0,
            artifact_refs: new.artifact_refs,
            error_message: None,
            is_processed: false,
            is_uploaded: false,
            is_chained: false,
            source_job_id: new.source_job_id,
            chain_attempts: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn artifact(&self, name: &str) -> Option<&str> {
        self.artifact_refs.get(name).map(String::as_str)
    }

    /// Apply a partial update, enforcing the record invariants.
    ///
    /// Both store implementations route every write through here so the
    /// rules live in one place.
    pub fn apply(&self, patch: &JobPatch, now: DateTime<Utc>) -> Result<Job, StoreError> {
        let mut next = self.clone();

        if let Some(status) = patch.status {
            if status.stage() != self.stage {
                return Err(StoreError::InvalidTransition {
                    job_id: self.job_id.clone(),
                    from: self.status,
                    to: status,
                });
            }
            match self.status.transition(status) {
                Transition::Advance | Transition::Unchanged => next.status = status,
                Transition::Invalid => {
                    return Err(StoreError::InvalidTransition {
                        job_id: self.job_id.clone(),
                        from: self.status,
                        to: status,
                    })
                }
            }
        }

        if let Some(ext) = &patch.external_ref {
            match &self.external_ref {
                Some(existing) if existing != ext => {
                    return Err(StoreError::Conflict {
                        job_id: self.job_id.clone(),
                        reason: format!(
                            "external_ref already set to {existing}, refusing {ext}"
                        ),
                    });
                }
                _ => next.external_ref = Some(ext.clone()),
            }
        }

        if let Some(n) = patch.expected_units {
            next.expected_units = n;
        }
        if let Some(n) = patch.produced_units {
            next.produced_units = n;
        }

        for (name, uri) in &patch.artifact_refs {
            next.artifact_refs.insert(name.clone(), uri.clone());
        }

        if let Some(msg) = &patch.error_message {
            next.error_message = msg.clone();
        }

        next.is_processed = set_flag(&self.job_id, "is_processed", self.is_processed, patch.is_processed)?;
        next.is_uploaded = set_flag(&self.job_id, "is_uploaded", self.is_uploaded, patch.is_uploaded)?;
        next.is_chained = set_flag(&self.job_id, "is_chained", self.is_chained, patch.is_chained)?;

        if patch.add_chain_attempt {
            next.chain_attempts = self.chain_attempts.saturating_add(1);
        }

        if let Some(at) = patch.completed_at {
            next.completed_at = Some(at);
        } else if next.status.is_complete() && next.completed_at.is_none() {
            next.completed_at = Some(now);
        }

        next.updated_at = now;
        Ok(next)
    }
}

fn set_flag(
    job_id: &str,
    name: &str,
    current: bool,
    requested: Option<bool>,
) -> Result<bool, StoreError> {
    match (current, requested) {
        (true, Some(false)) => Err(StoreError::Conflict {
            job_id: job_id.to_string(),
            reason: format!("{name} cannot be reset once set"),
        }),
        (_, Some(v)) => Ok(v),
        (cur, None) => Ok(cur),
    }
}

/// Partial update of a job. Unset fields are left alone.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub external_ref: Option<String>,
    pub expected_units: Option<i32>,
    pub produced_units: Option<i32>,
    pub artifact_refs: ArtifactRefs,
    /// `Some(None)` clears the message.
    pub error_message: Option<Option<String>>,
    pub is_processed: Option<bool>,
    pub is_uploaded: Option<bool>,
    pub is_chained: Option<bool>,
    /// Counted against the stored value, so concurrent failures all land.
    pub add_chain_attempt: bool,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn external_ref(mut self, ext: impl Into<String>) -> Self {
        self.external_ref = Some(ext.into());
        self
    }

    pub fn expected_units(mut self, n: i32) -> Self {
        self.expected_units = Some(n);
        self
    }

    pub fn produced_units(mut self, n: i32) -> Self {
        self.produced_units = Some(n);
        self
    }

    pub fn artifact(mut self, name: &str, uri: impl Into<String>) -> Self {
        self.artifact_refs.insert(name.to_string(), uri.into());
        self
    }

    pub fn error(mut self, msg: impl Into<String>) -> Self {
        self.error_message = Some(Some(msg.into()));
        self
    }

    pub fn clear_error(mut self) -> Self {
        self.error_message = Some(None);
        self
    }

    pub fn processed(mut self) -> Self {
        self.is_processed = Some(true);
        self
    }

    pub fn uploaded(mut self) -> Self {
        self.is_uploaded = Some(true);
        self
    }

    pub fn chained(mut self) -> Self {
        self.is_chained = Some(true);
        self
    }

    pub fn chain_attempt_failed(mut self) -> Self {
        self.add_chain_attempt = true;
        self
    }

    pub fn completed_at(mut self, at: DateTime<Utc>) -> Self {
        self.completed_at = Some(at);
        self
    }
}

/// Selection criteria for `JobStore::list`. All set criteria must match.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub stage: Option<Stage>,
    /// Empty means any status.
    pub statuses: Vec<JobStatus>,
    pub subject_id: Option<String>,
    pub is_chained: Option<bool>,
    pub is_uploaded: Option<bool>,
    pub updated_before: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

impl JobFilter {
    pub fn non_terminal() -> Self {
        Self {
            statuses: JobStatus::non_terminal(),
            ..Default::default()
        }
    }

    pub fn with_status(status: JobStatus) -> Self {
        Self {
            stage: Some(status.stage()),
            statuses: vec![status],
            ..Default::default()
        }
    }

    pub fn matches(&self, job: &Job) -> bool {
        if self.stage.is_some_and(|s| s != job.stage) {
            return false;
        }
        if !self.statuses.is_empty() && !self.statuses.contains(&job.status) {
            return false;
        }
        if self
            .subject_id
            .as_deref()
            .is_some_and(|s| s != job.subject_id)
        {
            return false;
        }
        if self.is_chained.is_some_and(|v| v != job.is_chained) {
            return false;
        }
        if self.is_uploaded.is_some_and(|v| v != job.is_uploaded) {
            return false;
        }
        if self.updated_before.is_some_and(|t| job.updated_at >= t) {
            return false;
        }
        true
    }
}
