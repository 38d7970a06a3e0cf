//! Retry delay policy
//!
//! Two schedule families: streaming-class failures use a fixed short
//! schedule, everything else retryable uses capped exponential backoff.

use std::time::Duration;

use crate::classify::ErrorKind;
use crate::config::RetrySettings;
use crate::error::{PipelineError, Result};

/// Fixed schedule for streaming-class failures; the last entry repeats.
pub const STREAMING_SCHEDULE: [Duration; 3] = [
    Duration::from_secs(2),
    Duration::from_secs(5),
    Duration::from_secs(10),
];

/// Retry configuration, immutable for the life of a session
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Resolved URLs older than this are refreshed before the next attempt
    pub url_freshness: Duration,
}

impl RetryConfig {
    pub fn from_settings(settings: &RetrySettings) -> Result<Self> {
        if settings.multiplier <= 1.0 {
            return Err(PipelineError::Config(
                "invalid config: retry.multiplier must be > 1.0".to_string(),
            ));
        }
        Ok(Self {
            max_attempts: settings.max_retries,
            base_delay: Duration::from_millis(settings.base_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            multiplier: settings.multiplier,
            url_freshness: Duration::from_secs(settings.url_freshness_seconds),
        })
    }

    /// Delay before the given attempt (1-based), by schedule family.
    pub fn delay_for(&self, kind: ErrorKind, attempt: u32) -> Duration {
        if kind.uses_streaming_schedule() {
            streaming_delay(attempt)
        } else {
            self.exponential_delay(attempt)
        }
    }

    /// `min(base * multiplier^(n-1), max)` for attempt `n >= 1`.
    pub fn exponential_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }
}

/// Streaming schedule: 2s, 5s, 10s, then 10s forever.
pub fn streaming_delay(attempt: u32) -> Duration {
    let index = (attempt.max(1) as usize - 1).min(STREAMING_SCHEDULE.len() - 1);
    STREAMING_SCHEDULE[index]
}

/// Outcome of a retry decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait `delay`, optionally refresh the stream URL, then try again
    Retry {
        kind: ErrorKind,
        delay: Duration,
        refresh_url: bool,
    },
    /// Give up
    Abort { kind: ErrorKind, exhausted: bool },
}
