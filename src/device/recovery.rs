//! Reconnect/recovery controller
//!
//! Re-establishes a lost channel with capped exponential backoff and a
//! bounded number of retries. It only restores the link: resync
//! correctness lives in the session's full-fetch reconciliation.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::RetryConfig;
use crate::error::{Result, TwinError};

/// Backoff schedule for reconnect attempts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: u32,
    /// Retries after the first, immediate attempt
    pub max_retries: u32,
}

impl RetryPolicy {
    /// `min(initial * multiplier^attempt, max_delay)`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1).saturating_pow(attempt);
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            multiplier: config.multiplier,
            max_retries: config.max_retries,
        }
    }
}

/// Sleep for `delay` unless cancelled first
pub async fn backoff_wait(delay: Duration, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TwinError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

/// Bound a network-facing call by `timeout` and abort it on cancellation
pub async fn bounded<T, F>(timeout: Duration, cancel: &CancellationToken, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TwinError::Cancelled),
        result = tokio::time::timeout(timeout, call) => match result {
            Ok(inner) => inner,
            Err(_) => Err(TwinError::Timeout(timeout.as_millis() as u64)),
        },
    }
}

/// Drives reconnect attempts for one session
pub struct RecoveryController {
    device_id: String,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl RecoveryController {
    pub fn new(device_id: &str, policy: RetryPolicy, cancel: CancellationToken) -> Self {
        Self {
            device_id: device_id.to_string(),
            policy,
            cancel,
        }
    }

    /// Run `attempt` until it succeeds, fails with a non-retryable error,
    /// the retry budget runs out (`ConnectionLost`), or the session closes
    /// (`Cancelled`). The first attempt runs immediately.
    pub async fn run<T, F, Fut>(&self, mut attempt: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut last_error = None;

        for n in 0..=self.policy.max_retries {
            if n > 0 {
                let delay = self.policy.delay_for(n - 1);
                tracing::debug!(
                    device_id = %self.device_id,
                    attempt = n,
                    delay_ms = delay.as_millis() as u64,
                    "Backing off before reconnect"
                );
                backoff_wait(delay, &self.cancel).await?;
            }

            match attempt(n).await {
                Ok(value) => {
                    if n > 0 {
                        tracing::info!(device_id = %self.device_id, attempt = n, "Reconnected");
                    }
                    return Ok(value);
                }
                Err(e) if e.is_retryable() => {
                    tracing::warn!(
                        device_id = %self.device_id,
                        attempt = n,
                        error = %e,
                        "Reconnect attempt failed"
                    );
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        let reason = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no attempts made".to_string());
        tracing::error!(
            device_id = %self.device_id,
            retries = self.policy.max_retries,
            reason = %reason,
            "Giving up on reconnect"
        );
        Err(TwinError::ConnectionLost(format!(
            "gave up after {} retries: {}",
            self.policy.max_retries, reason
        )))
    }
}
