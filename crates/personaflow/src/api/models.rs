use serde::{Deserialize, Serialize};

use crate::clients::ProviderStatus;
use crate::jobs::Job;

#[derive(Debug, Clone, Deserialize)]
pub struct BatchEvent {
    pub external_ref: String,
    pub status: ProviderStatus,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateJobRequest {
    /// Generated when absent.
    pub job_id: Option<String>,
    pub subject_id: String,
    pub expected_units: Option<i32>,
}

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub stage: Option<String>,
    pub status: Option<String>,
    pub subject_id: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ListJobsResponse {
    pub items: Vec<Job>,
}

#[derive(Debug, Serialize)]
pub struct JobView {
    #[serde(flatten)]
    pub job: Job,
    pub watched: bool,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub job_id: String,
    pub cancelled: bool,
}
