use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;

/// Provider-side state of a submitted batch, as reported by the status
/// endpoint or a pushed notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderStatus {
    Processing,
    Complete,
    Failed,
    Cancelled,
    Expired,
}

impl ProviderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderStatus::Processing => "processing",
            ProviderStatus::Complete => "complete",
            ProviderStatus::Failed => "failed",
            ProviderStatus::Cancelled => "cancelled",
            ProviderStatus::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProviderStatus::Processing)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatBody {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// One line of a batch input file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub custom_id: String,
    pub method: String,
    pub url: String,
    pub body: ChatBody,
}

#[derive(Debug, Clone)]
pub struct BatchSubmission {
    /// Carried to the provider as metadata so resubmissions can be matched.
    pub job_id: String,
    pub subject_id: String,
    pub requests: Vec<BatchRequest>,
}

impl BatchSubmission {
    pub fn to_jsonl(&self) -> Result<String, serde_json::Error> {
        let mut out = String::new();
        for req in &self.requests {
            out.push_str(&serde_json::to_string(req)?);
            out.push('\n');
        }
        Ok(out)
    }
}

/// External batch-inference service.
#[async_trait]
pub trait BatchProvider: Send + Sync {
    /// Returns the provider's reference for the new batch.
    async fn submit(&self, submission: &BatchSubmission) -> Result<String, ProviderError>;

    async fn get_status(&self, external_ref: &str) -> Result<ProviderStatus, ProviderError>;

    /// Raw output blob of a completed batch.
    async fn fetch_result(&self, external_ref: &str) -> Result<Bytes, ProviderError>;
}
