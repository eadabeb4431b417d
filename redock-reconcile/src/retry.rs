//! Bounded retry with backoff for transient failures.

use std::thread;
use std::time::Duration;

use redock_core::{Backoff, RetryConfig};

/// How many times a transient failure is retried and how long to wait
/// between attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Backoff,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: Backoff, base_delay: Duration) -> Self {
        Self {
            max_retries,
            backoff,
            base_delay,
        }
    }

    /// Single attempt, no waiting.
    pub fn none() -> Self {
        Self::new(0, Backoff::Fixed, Duration::ZERO)
    }

    /// Delay before retry number `retry` (0 is the first retry).
    pub fn delay(&self, retry: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.base_delay,
            Backoff::Linear => self.base_delay.saturating_mul(retry.saturating_add(1)),
            Backoff::Exponential => self
                .base_delay
                .saturating_mul(2u32.saturating_pow(retry)),
        }
    }

    /// Run `op` until it succeeds, fails with a non-transient error, or the
    /// retry budget is spent. Returns the last error with the number of
    /// attempts made.
    pub fn run<T, E, F, P>(&self, mut op: F, is_transient: P) -> Result<T, (E, u32)>
    where
        F: FnMut(u32) -> Result<T, E>,
        P: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let retry = attempt - 1;
                    if !is_transient(&err) || retry >= self.max_retries {
                        return Err((err, attempt));
                    }
                    let delay = self.delay(retry);
                    tracing::warn!(
                        attempt,
                        max_attempts = self.max_retries + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure, retrying"
                    );
                    thread::sleep(delay);
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self::new(
            config.max_retries,
            config.backoff,
            Duration::from_millis(config.base_delay_ms),
        )
    }
}
