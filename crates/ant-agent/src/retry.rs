//! Exponential backoff with jitter
//!
//! Shared by the supervisor (reconnects) and the CLI (bootstrap retries).
//! Delays grow by `multiplier` up to `max_delay`; every sleep is jittered
//! to 0.5x-1.5x so a fleet of ants doesn't reconnect in lockstep.

use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

/// Backoff parameters
#[derive(Clone, Debug, PartialEq)]
pub struct BackoffConfig {
    /// First delay
    pub initial_delay: Duration,
    /// Upper bound before jitter
    pub max_delay: Duration,
    /// Growth factor per failure
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

/// Backoff state across consecutive failures
#[derive(Clone, Debug)]
pub struct Backoff {
    config: BackoffConfig,
    delay: Duration,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        let delay = config.initial_delay;
        Self { config, delay }
    }

    /// Jittered delay for this failure; grows the base for the next one
    pub fn next_delay(&mut self) -> Duration {
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let jittered = Duration::from_secs_f64(self.delay.as_secs_f64() * jitter);

        self.delay = Duration::from_secs_f64(
            (self.delay.as_secs_f64() * self.config.multiplier)
                .min(self.config.max_delay.as_secs_f64()),
        );
        jittered
    }

    /// Back to the initial delay after a success
    pub fn reset(&mut self) {
        self.delay = self.config.initial_delay;
    }

    /// Base delay the next failure will use, before jitter
    pub fn current(&self) -> Duration {
        self.delay
    }
}

/// Run `operation` until it succeeds, `should_retry` rejects the error,
/// or `max_attempts` is reached (0 = no limit).
pub async fn retry_with_backoff<F, Fut, T, E, R>(
    config: &BackoffConfig,
    max_attempts: u32,
    operation_name: &str,
    mut operation: F,
    should_retry: R,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    R: Fn(&E) -> bool,
{
    let mut backoff = Backoff::new(config.clone());
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !should_retry(&e) => {
                error!(operation = %operation_name, attempt, error = %e, "Operation failed permanently");
                return Err(e);
            }
            Err(e) if max_attempts > 0 && attempt >= max_attempts => {
                error!(
                    operation = %operation_name,
                    attempt,
                    error = %e,
                    "Operation failed after max retries"
                );
                return Err(e);
            }
            Err(e) => {
                let delay = backoff.next_delay();
                warn!(
                    operation = %operation_name,
                    attempt,
                    error = %e,
                    delay_ms = delay.as_millis(),
                    "Operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
