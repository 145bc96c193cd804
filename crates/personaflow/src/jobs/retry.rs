use rand::{rngs::StdRng, Rng, SeedableRng};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::PipelineError;

/// Backoff for transient failures retried in place (artifact uploads,
/// result downloads).
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub base_seconds: i64,
    pub max_seconds: i64,
    pub jitter_pct: f64,
    /// Attempts in total, including the first one.
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_seconds: 2,
            max_seconds: 5 * 60,
            jitter_pct: 0.20,
            max_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    NonRetryable,
}

pub fn classify_error(err: &PipelineError) -> ErrorClass {
    if err.is_transient() {
        ErrorClass::Retryable
    } else {
        ErrorClass::NonRetryable
    }
}

pub fn next_delay_seconds(attempt_no: i32, cfg: &RetryConfig, rng: &mut impl Rng) -> i64 {
    let attempt_no = attempt_no.max(1) as u32;

    // exponent = attempt_no - 1
    let exp = attempt_no.saturating_sub(1);

    // 2^exp, saturating; the cap below takes care of huge values.
    let pow2 = 1_i64.checked_shl(exp).unwrap_or(i64::MAX);

    let delay = cfg.base_seconds.saturating_mul(pow2).min(cfg.max_seconds);

    // jitter in range [-jitter_pct, +jitter_pct]
    let jitter_range = (delay as f64) * cfg.jitter_pct;
    let jitter = if jitter_range > 0.0 {
        rng.gen_range(-jitter_range..=jitter_range)
    } else {
        0.0
    };

    let jittered = (delay as f64 + jitter).round() as i64;
    jittered.clamp(0, cfg.max_seconds)
}

/// Spread `interval` by up to `jitter_pct` in either direction.
pub fn jittered(interval: Duration, jitter_pct: f64, rng: &mut impl Rng) -> Duration {
    if jitter_pct <= 0.0 {
        return interval;
    }
    let factor = 1.0 + rng.gen_range(-jitter_pct..=jitter_pct);
    interval.mul_f64(factor.max(0.0))
}

/// Run `op` until it succeeds, fails non-transiently, or `cfg.max_attempts`
/// is used up. Backoff sleeps stop early on cancellation.
pub async fn retry_transient<T, F, Fut>(
    cfg: &RetryConfig,
    what: &str,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, PipelineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, PipelineError>>,
{
    let mut rng = StdRng::from_entropy();
    let mut attempt_no: i32 = 1;

    loop {
        let err = match op().await {
            Ok(v) => return Ok(v),
            Err(e) => e,
        };

        let exhausted = attempt_no as u32 >= cfg.max_attempts.max(1);
        if classify_error(&err) == ErrorClass::NonRetryable || exhausted {
            return Err(err);
        }

        let delay = Duration::from_secs(next_delay_seconds(attempt_no, cfg, &mut rng) as u64);
        tracing::warn!(
            what,
            attempt_no,
            delay_secs = delay.as_secs(),
            error = %err,
            "transient failure, retrying"
        );

        tokio::select! {
            _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
        attempt_no += 1;
    }
}
