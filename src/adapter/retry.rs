//! Retry policy for adapter requests.
//!
//! Transient failures (connection drops, rate limits, upstream 5xx) are
//! retried with exponential backoff and jitter; everything else is fatal on
//! first occurrence.

use std::time::Duration;

use rand::RngExt as _;
use serde::{Deserialize, Serialize};

/// Per-request retry configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 100,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Backoff delay before retry number `attempt` (0-based):
    /// `min(max, initial * multiplier^attempt)` with ±25 % jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        #[allow(clippy::cast_precision_loss)]
        let base =
            (self.initial_delay_ms as f64) * self.backoff_multiplier.powi(attempt.cast_signed());
        #[allow(clippy::cast_precision_loss)]
        let capped = base.min(self.max_delay_ms as f64);
        let jitter = rand::rng().random_range(0.75..=1.25);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let millis = (capped * jitter).round().max(0.0) as u64;
        Duration::from_millis(millis)
    }
}

/// Whether an error message indicates a transient failure worth retrying.
///
/// Matches connection errors, rate limits, reset connections, and HTTP 5xx
/// status indicators.
pub fn is_retryable(message: &str) -> bool {
    let lower = message.to_lowercase();
    if lower.contains("connection error")
        || lower.contains("rate_limit")
        || lower.contains("econnreset")
    {
        return true;
    }
    has_5xx_status(&lower)
}

/// Look for a standalone three-digit 5xx token (e.g. "status 503", "HTTP 529").
fn has_5xx_status(lower: &str) -> bool {
    lower
        .split(|c: char| !c.is_ascii_digit())
        .any(|token| token.len() == 3 && token.starts_with('5'))
}

/// Message carried by the non-fatal `RETRY` notification.
pub fn retry_message(delay: Duration) -> String {
    format!("Retrying in {} seconds", delay.as_secs())
}
