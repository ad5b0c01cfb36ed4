// crates/relay/src/retry.rs
//! Bounded retry with linear backoff for outbound calls.

use std::future::Future;
use std::time::Duration;

use charart_core::RelayConfig;
use metrics::counter;
use tracing::warn;

use crate::error::RelayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl From<&RelayConfig> for RetryPolicy {
    fn from(config: &RelayConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            delay: config.retry_delay,
        }
    }
}

/// Wait before attempt `attempt` (0-based): `attempt × base`.
pub fn backoff_delay(attempt: u32, base: Duration) -> Duration {
    base.saturating_mul(attempt)
}

/// Run `f` up to `policy.max_attempts` times. The first success wins;
/// exhausting the attempts yields [`RelayError::RetriesExhausted`].
pub async fn with_retry<T, F, Fut>(call: &'static str, policy: RetryPolicy, mut f: F) -> Result<T, RelayError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RelayError>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut last = String::new();
    for attempt in 0..attempts {
        if attempt > 0 {
            counter!("charart_relay_retries_total", "call" => call).increment(1);
            tokio::time::sleep(backoff_delay(attempt, policy.delay)).await;
        }
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                warn!(call, attempt = attempt + 1, of = attempts, error = %e, "relay call failed");
                last = e.to_string();
            }
        }
    }
    Err(RelayError::RetriesExhausted {
        call,
        attempts,
        last,
    })
}
