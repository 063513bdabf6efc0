//! Backoff schedule for decision redelivery, quorum waits and TCP sends

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::time::Duration;

/// Exponential backoff with symmetric jitter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts before [`retry`] gives up; redelivery loops ignore it
    pub max_attempts: u32,
    #[serde(with = "serde_millis")]
    pub initial_delay: Duration,
    #[serde(with = "serde_millis")]
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Fraction of the delay added or removed at random
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryConfig {
    /// Short schedule for sends on an established link
    pub fn quick() -> Self {
        Self {
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(1),
            ..Self::default()
        }
    }

    /// Long schedule for peers that may take a while to come back
    pub fn slow() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter_factor: 0.2,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".into());
        }
        if self.backoff_multiplier < 1.0 {
            return Err("backoff_multiplier must be >= 1.0".into());
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err("jitter_factor must be within [0, 1]".into());
        }
        if self.initial_delay > self.max_delay {
            return Err("initial_delay must not exceed max_delay".into());
        }
        Ok(())
    }

    /// Delay before retry number `attempt` (1-based), capped at `max_delay`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base = (self.initial_delay.as_nanos() as f64 * self.backoff_multiplier.powi(exponent))
            .min(self.max_delay.as_nanos() as f64);
        let spread = base * self.jitter_factor;
        let jittered = base + (rand::random::<f64>() * 2.0 - 1.0) * spread;
        Duration::from_nanos(jittered.max(0.0) as u64)
    }
}

/// Run `operation` until it succeeds, fails permanently, or runs out of attempts
pub async fn retry<F, Fut, T>(config: &RetryConfig, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < config.max_attempts && is_transient(&e) => {
                let delay = config.delay_for(attempt);
                tracing::debug!("Attempt {} failed ({}); retrying in {:?}", attempt, e, delay);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Failures a later attempt may not hit
pub fn is_transient(error: &Error) -> bool {
    match error {
        Error::Retryable(_) | Error::Unreachable(_) | Error::Timeout(_) => true,
        Error::Io(io) => matches!(
            io.kind(),
            ErrorKind::TimedOut
                | ErrorKind::Interrupted
                | ErrorKind::ConnectionRefused
                | ErrorKind::ConnectionReset
                | ErrorKind::ConnectionAborted
                | ErrorKind::NotConnected
                | ErrorKind::BrokenPipe
        ),
        _ => false,
    }
}
