use std::path::PathBuf;
use std::time::Duration;

use crate::jobs::retry::RetryConfig;

/// How a stage-1 watcher learns about provider progress.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NotifyMode {
    /// The provider calls us back; watchers wait on their event channel.
    Push,
    /// Watchers ask the provider on a fixed interval.
    Poll,
}

impl NotifyMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "push" | "webhook" => Some(NotifyMode::Push),
            "poll" | "polling" => Some(NotifyMode::Poll),
            _ => None,
        }
    }
}

// Everything the orchestrator needs at runtime. Kept separate from `Config`
// so tests can build one without touching the environment.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub notify_mode: NotifyMode,
    pub poll_interval: Duration,
    pub poll_jitter_pct: f64,
    /// Ceiling on a job's total wait, measured from `created_at`.
    pub max_wait: Duration,
    pub call_timeout: Duration,
    pub retry: RetryConfig,
    pub max_chain_attempts: i32,
    pub failed_retention_days: i64,

    pub batch_model: String,
    pub base_model: String,
    pub hf_namespace: String,
    pub training_epochs: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            notify_mode: NotifyMode::Poll,
            poll_interval: Duration::from_secs(5 * 60),
            poll_jitter_pct: 0.1,
            max_wait: Duration::from_secs(26 * 60 * 60),
            call_timeout: Duration::from_secs(60),
            retry: RetryConfig::default(),
            max_chain_attempts: 5,
            failed_retention_days: 7,
            batch_model: "gpt-4o-mini".to_string(),
            base_model: "LGAI-EXAONE/EXAONE-3.5-2.4B-Instruct".to_string(),
            hf_namespace: "skn-team".to_string(),
            training_epochs: 5,
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let d = Self::default();

        let notify_mode = env_or_fallback("PERSONAFLOW_NOTIFY_MODE", "NOTIFY_MODE")
            .and_then(|s| NotifyMode::parse(&s))
            .unwrap_or(d.notify_mode);

        let poll_interval = env_parse::<u64>("PERSONAFLOW_POLL_INTERVAL_SECS", "POLL_INTERVAL_SECS")
            .map(|s| Duration::from_secs(s.max(1)))
            .unwrap_or(d.poll_interval);

        let poll_jitter_pct = env_parse::<f64>("PERSONAFLOW_POLL_JITTER_PCT", "POLL_JITTER_PCT")
            .map(|p| p.clamp(0.0, 0.5))
            .unwrap_or(d.poll_jitter_pct);

        let max_wait = env_parse::<u64>("PERSONAFLOW_MAX_WAIT_HOURS", "MAX_WAIT_HOURS")
            .map(|h| Duration::from_secs(h.max(1) * 60 * 60))
            .unwrap_or(d.max_wait);

        let call_timeout = env_parse::<u64>("PERSONAFLOW_CALL_TIMEOUT_SECS", "CALL_TIMEOUT_SECS")
            .map(|s| Duration::from_secs(s.clamp(1, 600)))
            .unwrap_or(d.call_timeout);

        let mut retry = d.retry.clone();
        if let Some(n) = env_parse::<u32>("PERSONAFLOW_MAX_TRANSIENT_RETRIES", "MAX_TRANSIENT_RETRIES") {
            retry.max_attempts = n.max(1);
        }

        let max_chain_attempts =
            env_parse::<i32>("PERSONAFLOW_MAX_CHAIN_ATTEMPTS", "MAX_CHAIN_ATTEMPTS")
                .map(|n| n.max(1))
                .unwrap_or(d.max_chain_attempts);

        let failed_retention_days =
            env_parse::<i64>("PERSONAFLOW_FAILED_RETENTION_DAYS", "FAILED_RETENTION_DAYS")
                .map(|n| n.max(0))
                .unwrap_or(d.failed_retention_days);

        let batch_model = env_or_fallback("PERSONAFLOW_BATCH_MODEL", "BATCH_MODEL")
            .unwrap_or(d.batch_model);
        let base_model =
            env_or_fallback("PERSONAFLOW_BASE_MODEL", "BASE_MODEL").unwrap_or(d.base_model);
        let hf_namespace = env_or_fallback("PERSONAFLOW_HF_NAMESPACE", "HF_NAMESPACE")
            .unwrap_or(d.hf_namespace);
        let training_epochs = env_parse::<u32>("PERSONAFLOW_TRAINING_EPOCHS", "TRAINING_EPOCHS")
            .map(|n| n.max(1))
            .unwrap_or(d.training_epochs);

        Self {
            notify_mode,
            poll_interval,
            poll_jitter_pct,
            max_wait,
            call_timeout,
            retry,
            max_chain_attempts,
            failed_retention_days,
            batch_model,
            base_model,
            hf_namespace,
            training_epochs,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub admin_addr: Option<String>,
    pub migrate_on_startup: bool,

    pub artifact_dir: PathBuf,

    pub openai_api_key: Option<String>,
    pub openai_base_url: String,

    /// Program plus arguments, split on whitespace.
    pub trainer_cmd: Vec<String>,
    pub publish_cmd: Option<Vec<String>>,

    pub pipeline: PipelineConfig,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL is missing"))?;

        // unset means the default address; "off" turns the http surface off
        let admin_addr = match env_or_fallback("PERSONAFLOW_ADMIN_ADDR", "ADMIN_ADDR") {
            Some(s) => normalize_optional_addr(&s),
            None => Some("0.0.0.0:8080".to_string()),
        };

        let migrate_on_startup = env_bool("PERSONAFLOW_MIGRATE_ON_STARTUP").unwrap_or(false);

        let artifact_dir = env_or_fallback("PERSONAFLOW_ARTIFACT_DIR", "ARTIFACT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./artifacts"));

        let openai_api_key = env_or_fallback("OPENAI_API_KEY", "PERSONAFLOW_OPENAI_API_KEY");
        let openai_base_url = env_or_fallback("OPENAI_BASE_URL", "PERSONAFLOW_OPENAI_BASE_URL")
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string());

        let trainer_cmd = env_or_fallback("PERSONAFLOW_TRAINER_CMD", "TRAINER_CMD")
            .map(|s| split_command(&s))
            .unwrap_or_else(|| split_command("python3 fine_custom.py"));
        if trainer_cmd.is_empty() {
            anyhow::bail!("PERSONAFLOW_TRAINER_CMD is empty");
        }

        let publish_cmd = env_or_fallback("PERSONAFLOW_PUBLISH_CMD", "PUBLISH_CMD")
            .map(|s| split_command(&s))
            .filter(|c| !c.is_empty());

        Ok(Self {
            database_url,
            admin_addr,
            migrate_on_startup,
            artifact_dir,
            openai_api_key,
            openai_base_url,
            trainer_cmd,
            publish_cmd,
            pipeline: PipelineConfig::from_env(),
        })
    }
}

fn env_or_fallback(primary: &str, fallback: &str) -> Option<String> {
    std::env::var(primary)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .or_else(|| std::env::var(fallback).ok().filter(|s| !s.trim().is_empty()))
}

fn env_parse<T: std::str::FromStr>(primary: &str, fallback: &str) -> Option<T> {
    env_or_fallback(primary, fallback).and_then(|s| s.trim().parse().ok())
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

fn normalize_optional_addr(value: &str) -> Option<String> {
    let v = value.trim();
    if v.is_empty() {
        return None;
    }
    if matches!(v.to_lowercase().as_str(), "0" | "off" | "false" | "none") {
        return None;
    }
    Some(v.to_string())
}

fn split_command(s: &str) -> Vec<String> {
    s.split_whitespace().map(str::to_string).collect()
}
