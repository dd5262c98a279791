//! In-operation retry of transient remote failures
//!
//! A remote call that fails with a connection problem is retried a few times
//! with exponential backoff before the failure is reported. Anything else
//! (a missing object, a permission problem, an expired session) is returned
//! immediately.

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};

use docsync_core::config::TransferConfig;
use docsync_core::ports::RemoteError;

use crate::failure::{is_transient_message, remote_error};

/// Attempts and backoff for one remote call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub attempts: u32,
    /// Delay before the second attempt; doubled for each later one
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, base_delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            base_delay,
        }
    }

    /// Single attempt, no backoff
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO)
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt))
    }
}

impl From<&TransferConfig> for RetryPolicy {
    fn from(config: &TransferConfig) -> Self {
        Self::new(config.retry_attempts, config.retry_base_delay())
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&TransferConfig::default())
    }
}

/// True for failures worth retrying inside one operation
pub fn is_transient_error(err: &anyhow::Error) -> bool {
    match remote_error(err) {
        Some(RemoteError::Connection(_)) => true,
        Some(_) => false,
        None => is_transient_message(&format!("{err:#}")),
    }
}

/// Executes an async operation with exponential backoff retry
///
/// The closure is called once per attempt, so anything consumed by a call
/// (such as a content stream) must be recreated inside it.
pub async fn with_retry<F, Fut, T>(policy: RetryPolicy, operation_name: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(value) => {
                if attempt > 0 {
                    info!(
                        operation = operation_name,
                        attempt, "Operation succeeded after retry"
                    );
                }
                return Ok(value);
            }
            Err(err) => {
                if attempt + 1 < policy.attempts && is_transient_error(&err) {
                    let delay = policy.delay_for(attempt);
                    warn!(
                        operation = operation_name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                } else {
                    return Err(err);
                }
            }
        }
    }
}
