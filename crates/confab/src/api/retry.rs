//! Automatic retry with exponential backoff for transient network failures.
//!
//! Retries network-class errors (408, 429, 5xx, connection resets, timeouts)
//! with exponential backoff. Never retries 400 (bad request) or 401 (auth)
//! errors. Context-limit errors get their own classifier because the
//! summarizer handles them by shrinking input rather than waiting.

use std::time::Duration;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retries (0 = no retries, just fail immediately).
    pub max_retries: u32,
    /// Initial delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Backoff multiplier.
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a config with the given number of retries. Uses sensible defaults.
    pub fn with_retries(retries: u32) -> Self {
        Self {
            max_retries: retries,
            ..Default::default()
        }
    }

    /// Calculate the delay for a given attempt number (0-indexed):
    /// `initial_delay * multiplier^attempt`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        Duration::from_secs_f64(base.min(self.max_delay.as_secs_f64()))
    }
}

/// Whether an error string indicates a transient (retryable) failure:
/// retryable HTTP statuses or network-level symptoms in the message.
pub fn is_transient_error(error: &str) -> bool {
    let transient_statuses = ["408", "429", "500", "502", "503", "504"];
    if transient_statuses
        .iter()
        .any(|s| error.contains(&format!("HTTP {s}")))
    {
        return true;
    }

    let lower = error.to_lowercase();
    [
        "request failed:",
        "fetch failed",
        "terminated",
        "socket",
        "connection reset",
        "connection refused",
        "timed out",
        "timeout",
        "broken pipe",
        "network",
    ]
    .iter()
    .any(|p| lower.contains(p))
}

/// Whether an error indicates the request exceeded the model's context
/// window. Providers report this as HTTP 400 with a message mentioning
/// tokens or context length.
pub fn is_context_limit_error(error: &str) -> bool {
    if !error.contains("HTTP 400") {
        return false;
    }
    let lower = error.to_lowercase();
    ["token", "context length", "context_length", "context window"]
        .iter()
        .any(|p| lower.contains(p))
}

/// Whether an error is a permanent (non-retryable) failure.
pub fn is_permanent_error(error: &str) -> bool {
    [
        "HTTP 400",
        "HTTP 401",
        "HTTP 403",
        "HTTP 404",
        "HTTP 422",
        "invalid",
        "bad request",
        "unauthorized",
    ]
    .iter()
    .any(|p| error.contains(p))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_retries_three_times() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    fn backoff_schedule_doubles_from_500ms() {
        let config = RetryConfig::default();
        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(500));
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(2000));
    }

    #[test]
    fn delay_capped_at_max() {
        let config = RetryConfig {
            max_delay: Duration::from_secs(2),
            ..RetryConfig::with_retries(10)
        };
        let d10 = config.delay_for_attempt(10);
        assert!(d10 <= Duration::from_secs(2));
    }

    #[test]
    fn transient_errors_detected() {
        assert!(is_transient_error("API HTTP 429: rate limited"));
        assert!(is_transient_error("API HTTP 502: bad gateway"));
        assert!(is_transient_error("API HTTP 408: request timeout"));
        assert!(is_transient_error("request failed: connection reset"));
        assert!(is_transient_error("request failed: timed out"));
        assert!(is_transient_error("fetch failed"));
        assert!(is_transient_error("stream terminated unexpectedly"));
        assert!(is_transient_error("socket hang up"));
    }

    #[test]
    fn context_limit_errors_detected() {
        assert!(is_context_limit_error(
            "API HTTP 400: maximum context length exceeded"
        ));
        assert!(is_context_limit_error(
            "API HTTP 400: too many tokens in prompt"
        ));
        assert!(!is_context_limit_error("API HTTP 400: bad request"));
        assert!(!is_context_limit_error("API HTTP 429: token bucket empty"));
    }

    #[test]
    fn permanent_errors_detected() {
        assert!(is_permanent_error("API HTTP 400: bad request"));
        assert!(is_permanent_error("API HTTP 401: unauthorized"));
    }

    #[test]
    fn non_transient_not_retried() {
        assert!(!is_transient_error("API HTTP 400: bad request"));
        assert!(!is_transient_error("some random error"));
    }
}
