use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{multipart, Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};

use crate::clients::provider::{BatchProvider, BatchSubmission, ProviderStatus};
use crate::error::ProviderError;

/// Chat-completions endpoint every batch line targets.
pub const CHAT_COMPLETIONS_ENDPOINT: &str = "/v1/chat/completions";

#[derive(Debug, Deserialize)]
struct FileObject {
    id: String,
}

#[derive(Debug, Deserialize)]
struct BatchObject {
    id: String,
    status: String,
    #[serde(default)]
    output_file_id: Option<String>,
}

/// `BatchProvider` over the OpenAI Files and Batches REST API.
#[derive(Clone)]
pub struct OpenAiBatchClient {
    http_client: Client,
    api_key: String,
    base_url: String,
}

impl OpenAiBatchClient {
    pub fn new(api_key: impl Into<String>, call_timeout: Duration) -> Result<Self, ProviderError> {
        let http_client = Client::builder()
            .timeout(call_timeout)
            .build()
            .map_err(|e| ProviderError::Rejected(format!("http client: {e}")))?;

        Ok(Self {
            http_client,
            api_key: api_key.into(),
            base_url: "https://api.openai.com/v1".to_string(),
        })
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    async fn upload_input(&self, submission: &BatchSubmission) -> Result<String, ProviderError> {
        let jsonl = submission
            .to_jsonl()
            .map_err(|e| ProviderError::Rejected(format!("encode batch input: {e}")))?;

        let part = multipart::Part::bytes(jsonl.into_bytes())
            .file_name(format!("batch_{}.jsonl", submission.job_id))
            .mime_str("application/jsonl")
            .map_err(|e| ProviderError::Rejected(e.to_string()))?;
        let form = multipart::Form::new().text("purpose", "batch").part("file", part);

        let resp = self
            .http_client
            .post(format!("{}/files", self.base_url))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(network_err)?;

        let file: FileObject = json_body(resp, "upload batch input").await?;
        Ok(file.id)
    }

    async fn get_batch(&self, batch_id: &str) -> Result<BatchObject, ProviderError> {
        let resp = self
            .http_client
            .get(format!("{}/batches/{}", self.base_url, batch_id))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(network_err)?;

        json_body(resp, "get batch").await
    }
}

#[async_trait]
impl BatchProvider for OpenAiBatchClient {
    async fn submit(&self, submission: &BatchSubmission) -> Result<String, ProviderError> {
        let input_file_id = self.upload_input(submission).await?;

        let resp = self
            .http_client
            .post(format!("{}/batches", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&json!({
                "input_file_id": input_file_id,
                "endpoint": CHAT_COMPLETIONS_ENDPOINT,
                "completion_window": "24h",
                "metadata": {
                    "job_id": submission.job_id,
                    "subject_id": submission.subject_id,
                },
            }))
            .send()
            .await
            .map_err(network_err)?;

        let batch: BatchObject = json_body(resp, "create batch").await?;
        debug!(
            job_id = %submission.job_id,
            external_ref = %batch.id,
            input_file_id = %input_file_id,
            lines = submission.requests.len(),
            "batch created"
        );
        Ok(batch.id)
    }

    async fn get_status(&self, external_ref: &str) -> Result<ProviderStatus, ProviderError> {
        let batch = self.get_batch(external_ref).await?;
        map_batch_status(&batch.status).ok_or_else(|| {
            ProviderError::Unavailable(format!("unrecognized batch status {}", batch.status))
        })
    }

    async fn fetch_result(&self, external_ref: &str) -> Result<Bytes, ProviderError> {
        let batch = self.get_batch(external_ref).await?;
        let output_file_id = batch.output_file_id.ok_or_else(|| {
            ProviderError::Rejected(format!("batch {} has no output file", batch.id))
        })?;

        let resp = self
            .http_client
            .get(format!("{}/files/{}/content", self.base_url, output_file_id))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(network_err)?;

        let resp = check_status(resp, "download batch output").await?;
        resp.bytes().await.map_err(network_err)
    }
}

fn map_batch_status(status: &str) -> Option<ProviderStatus> {
    match status {
        "validating" | "in_progress" | "finalizing" | "cancelling" => {
            Some(ProviderStatus::Processing)
        }
        "completed" => Some(ProviderStatus::Complete),
        "failed" => Some(ProviderStatus::Failed),
        "expired" => Some(ProviderStatus::Expired),
        "cancelled" => Some(ProviderStatus::Cancelled),
        _ => None,
    }
}

fn network_err(e: reqwest::Error) -> ProviderError {
    warn!(error = %e, "OpenAI request failed");
    ProviderError::Unavailable(e.to_string())
}

async fn check_status(resp: Response, what: &str) -> Result<Response, ProviderError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let error_text = resp.text().await.unwrap_or_default();
    warn!(status = %status, error = %error_text, "OpenAI API error during {what}");

    let msg = format!("{what}: {status}: {error_text}");
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        Err(ProviderError::Unavailable(msg))
    } else {
        Err(ProviderError::Rejected(msg))
    }
}

async fn json_body<T: serde::de::DeserializeOwned>(
    resp: Response,
    what: &str,
) -> Result<T, ProviderError> {
    let resp = check_status(resp, what).await?;
    resp.json()
        .await
        .map_err(|e| ProviderError::Unavailable(format!("{what}: malformed response: {e}")))
}
