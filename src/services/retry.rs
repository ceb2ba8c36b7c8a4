//! Per-call timeout and bounded retry for upstream backends.

use super::BackendError;
use crate::config::BackendConfig;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub timeout: Duration,
    pub delay: Duration,
}

impl From<&BackendConfig> for RetryPolicy {
    fn from(config: &BackendConfig) -> Self {
        Self {
            attempts: config.attempts,
            timeout: config.timeout(),
            delay: config.retry_delay(),
        }
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// attempt budget is spent. Each attempt is bounded by `policy.timeout`.
pub async fn with_retry<T, F, Fut>(
    service: &'static str,
    policy: &RetryPolicy,
    mut op: F,
) -> Result<T, BackendError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BackendError>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        let result = match tokio::time::timeout(policy.timeout, op()).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout { service, after: policy.timeout }),
        };

        match result {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < attempts => {
                warn!(service, attempt, error = %err, "backend call failed, retrying");
                tokio::time::sleep(policy.delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
