//! Configuration for the sync queue and remote endpoints.

use rand::Rng;
use std::time::Duration;

/// Configuration for the sync queue.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Maximum number of operations in flight across all entities.
    pub max_concurrency: usize,
    /// Retry configuration.
    pub retry: RetryConfig,
    /// Buffer size of the state transition broadcast channel.
    pub event_capacity: usize,
}

impl SyncConfig {
    /// Creates a new sync configuration.
    pub fn new() -> Self {
        Self {
            max_concurrency: 4,
            retry: RetryConfig::default(),
            event_capacity: 1024,
        }
    }

    /// Sets the concurrency limit (at least 1).
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the transition channel capacity (at least 1).
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a new retry configuration (at least one attempt).
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    ///
    /// Values below 1 are raised to 1; a non-finite value falls back to 2.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = if multiplier.is_finite() {
            multiplier.max(1.0)
        } else {
            2.0
        };
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, enabled: bool) -> Self {
        self.add_jitter = enabled;
        self
    }

    /// Calculates the delay before retry number `retry` (1-indexed).
    ///
    /// Retry 0 is the first attempt and has no delay.
    pub fn delay_for_attempt(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(retry - 1).unwrap_or(i32::MAX);
        let base_delay = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        let delay_secs = if self.add_jitter && delay_secs > 0.0 {
            // Up to 25% extra
            delay_secs + delay_secs * 0.25 * rand::thread_rng().gen::<f64>()
        } else {
            delay_secs
        };
        // Negative or overflowing delays fall back to the maximum
        Duration::try_from_secs_f64(delay_secs).unwrap_or(self.max_delay)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(5)
    }
}

/// Connection settings for a remote endpoint.
///
/// Credentials are passed explicitly to the endpoint that uses them; there
/// is no process-wide configuration.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Base URL, e.g. `https://api.example.com/1`.
    pub server_url: String,
    /// Application identifier sent with every request.
    pub application_id: String,
    /// Client key sent with every request.
    pub client_key: String,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl EndpointConfig {
    /// Creates an endpoint configuration.
    pub fn new(
        server_url: impl Into<String>,
        application_id: impl Into<String>,
        client_key: impl Into<String>,
    ) -> Self {
        let server_url: String = server_url.into();
        Self {
            server_url: server_url.trim_end_matches('/').to_string(),
            application_id: application_id.into(),
            client_key: client_key.into(),
            timeout: Duration::from_secs(30),
        }
    }

    /// Sets the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Joins a path onto the server URL.
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.server_url, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_config_builder() {
        let config = SyncConfig::new()
            .with_max_concurrency(0)
            .with_event_capacity(16)
            .with_retry(RetryConfig::no_retry());

        assert_eq!(config.max_concurrency, 1);
        assert_eq!(config.event_capacity, 16);
        assert_eq!(config.retry.max_attempts, 1);
    }

    #[test]
    fn retry_config_needs_one_attempt() {
        assert_eq!(RetryConfig::new(0).max_attempts, 1);
    }

    #[test]
    fn retry_delay_doubles() {
        let config = RetryConfig::new(5)
            .with_initial_delay(Duration::from_millis(100))
            .with_backoff_multiplier(2.0)
            .with_jitter(false);

        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(400));
    }

    #[test]
    fn retry_delay_with_jitter_stays_in_bounds() {
        let config = RetryConfig::new(5).with_initial_delay(Duration::from_millis(100));
        let delay = config.delay_for_attempt(1);
        assert!(delay >= Duration::from_millis(100));
        assert!(delay <= Duration::from_millis(125));
    }

    #[test]
    fn retry_delay_respects_max() {
        let config = RetryConfig::new(10)
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5))
            .with_backoff_multiplier(10.0)
            .with_jitter(false);

        assert_eq!(config.delay_for_attempt(5), Duration::from_secs(5));
        assert_eq!(config.delay_for_attempt(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn backoff_multiplier_is_clamped() {
        assert_eq!(RetryConfig::new(5).with_backoff_multiplier(-2.0).backoff_multiplier, 1.0);
        assert_eq!(RetryConfig::new(5).with_backoff_multiplier(0.5).backoff_multiplier, 1.0);
        assert_eq!(RetryConfig::new(5).with_backoff_multiplier(f64::NAN).backoff_multiplier, 2.0);

        let config = RetryConfig::new(5)
            .with_initial_delay(Duration::from_millis(100))
            .with_backoff_multiplier(-2.0)
            .with_jitter(false);
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(100));
    }

    #[test]
    fn unrepresentable_delay_falls_back_to_max() {
        let config = RetryConfig::new(5)
            .with_initial_delay(Duration::MAX)
            .with_max_delay(Duration::MAX);
        assert_eq!(config.delay_for_attempt(3), Duration::MAX);

        let mut negative = RetryConfig::new(5).with_jitter(false);
        negative.backoff_multiplier = -2.0;
        assert_eq!(negative.delay_for_attempt(2), negative.max_delay);
    }

    #[test]
    fn endpoint_urls() {
        let config = EndpointConfig::new("https://api.example.com/1/", "app", "key");
        assert_eq!(config.url("/classes/Food"), "https://api.example.com/1/classes/Food");
    }
}
