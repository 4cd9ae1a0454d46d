//! Bounded retries for backend and storage calls.
//!
//! Each attempt is limited by the call timeout; transient failures (including
//! an elapsed timeout) are retried with exponential backoff up to the
//! configured bound. Cancellation is observed between attempts and during the
//! backoff sleep. A call already in flight always completes, so whatever it
//! allocated is known to the caller and can be rolled back.

use devenv_config::LifecycleSettings;
use devenv_core::{DevEnvError, Result};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    pub jitter: bool,
    pub call_timeout: Duration,
}

impl From<&LifecycleSettings> for RetryPolicy {
    fn from(settings: &LifecycleSettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            initial_backoff: settings.initial_backoff(),
            max_backoff: settings.max_backoff(),
            multiplier: settings.backoff_multiplier,
            jitter: settings.jitter,
            call_timeout: settings.call_timeout(),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&LifecycleSettings::default())
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based), before jitter.
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(63) as i32;
        let scaled = self.initial_backoff.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        let capped = scaled.min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    fn delay(&self, retry: u32) -> Duration {
        let base = self.backoff(retry);
        if !self.jitter || base.is_zero() {
            return base;
        }
        // Full range between half and all of the computed backoff.
        let factor = rand::rng().random_range(0.5..=1.0);
        base.mul_f64(factor)
    }

    /// Run `call` until it succeeds, fails permanently, or retries run out.
    pub async fn run<T, F, Fut>(&self, operation: &str, cancel: &CancellationToken, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut retry = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(DevEnvError::Cancelled);
            }

            let err = match tokio::time::timeout(self.call_timeout, call()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(err)) => err,
                Err(_) => DevEnvError::transient(format!(
                    "{operation} timed out after {:?}",
                    self.call_timeout
                )),
            };

            if !err.is_retryable() || retry >= self.max_retries {
                return Err(err);
            }

            retry += 1;
            let delay = self.delay(retry);
            warn!(
                operation,
                attempt = retry,
                max_retries = self.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "transient failure, retrying"
            );

            tokio::select! {
                _ = cancel.cancelled() => return Err(DevEnvError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
