use super::OzonError;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Fixed-delay retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub const FETCH: RetryPolicy = RetryPolicy {
        attempts: 3,
        delay: Duration::from_secs(1),
    };

    pub const SUBMIT: RetryPolicy = RetryPolicy {
        attempts: 5,
        delay: Duration::from_secs(5),
    };
}

/// Retries transient failures only.
pub async fn with_retry<T, F, Fut>(policy: RetryPolicy, label: &str, op: F) -> Result<T, OzonError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, OzonError>>,
{
    with_retry_if(policy, label, OzonError::is_retryable, op).await
}

pub async fn with_retry_if<T, F, Fut, P>(
    policy: RetryPolicy,
    label: &str,
    retryable: P,
    mut op: F,
) -> Result<T, OzonError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, OzonError>>,
    P: Fn(&OzonError) -> bool,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < attempts && retryable(&err) => {
                warn!(
                    target = "reviews.fetch",
                    call = label,
                    attempt,
                    error = %err,
                    "retrying"
                );
                attempt += 1;
                tokio::time::sleep(policy.delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}
