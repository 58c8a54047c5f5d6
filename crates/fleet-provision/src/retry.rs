//! Bounded retry with exponential backoff for provider calls.
//!
//! Every provider call a reconciliation pass issues goes through
//! [`with_retry`]: the call runs under a bounded timeout, transient
//! failures are retried up to the attempt limit, permanent failures are
//! returned immediately.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::{ProvisionError, ProvisionResult};

/// Retry parameters for provider calls within one reconciliation pass.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts per call (first try included).
    pub attempts: u32,
    /// Delay before the first retry; doubles per retry.
    pub base_delay: Duration,
    /// Bounded timeout applied to each individual attempt.
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(500),
            call_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// A policy with no waiting, for tests.
    pub fn immediate(attempts: u32) -> Self {
        Self {
            attempts,
            base_delay: Duration::ZERO,
            call_timeout: Duration::from_secs(5),
        }
    }
}

/// Run `op` under the policy's timeout, retrying transient errors with
/// exponential backoff until the attempt budget is spent.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    op_name: &str,
    mut op: F,
) -> ProvisionResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ProvisionResult<T>>,
{
    let mut delay = policy.base_delay;
    let mut attempt = 1u32;

    loop {
        let result = match tokio::time::timeout(policy.call_timeout, op()).await {
            Ok(result) => result,
            Err(_) => Err(ProvisionError::Timeout),
        };

        match result {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < policy.attempts => {
                warn!(op = op_name, attempt, error = %e, "transient provider error, retrying");
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
