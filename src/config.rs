use crate::core::{BatchError, ConsistencyLevel, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Batch size used until the first sizing signal arrives.
pub const DEFAULT_BATCH_SIZE: usize = 50;

/// How batch sizes are chosen for a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BatchMode {
    /// Sizes follow server congestion telemetry, falling back to local
    /// throughput measurements when the server has none.
    Dynamic,
    /// Constant batch size and concurrency; adaptive sizing is off.
    FixedSize {
        batch_size: usize,
        concurrent_requests: usize,
    },
    /// Constant batch size with at most `requests_per_minute` objects sent per minute.
    RateLimit { requests_per_minute: usize },
}

impl Default for BatchMode {
    fn default() -> Self {
        Self::Dynamic
    }
}

/// Which failed items are pushed back into the queue, and how often.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total deliveries allowed per operation, first attempt included.
    pub max_attempts: u32,
    /// Initial pause between forced flush passes that found requeued work.
    pub initial_backoff_ms: u64,
    /// Upper bound for that pause.
    pub max_backoff_ms: u64,
    /// Retry per-item errors reported by the server when no pattern list is set.
    pub retry_application_errors: bool,
    /// Retry only failures whose message contains one of these substrings.
    pub retryable_error_patterns: Option<Vec<String>>,
    /// Never retry failures whose message contains one of these substrings.
    pub non_retryable_error_patterns: Option<Vec<String>>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 2_000,
            retry_application_errors: false,
            retryable_error_patterns: None,
            non_retryable_error_patterns: None,
        }
    }
}

impl RetryPolicy {
    /// Exponential pause before forced flush pass `pass` (1-based).
    pub fn backoff_ms(&self, pass: u32) -> u64 {
        let base = self.initial_backoff_ms.max(1);
        let max = self.max_backoff_ms.max(base);
        let factor = 2u64.saturating_pow(pass.saturating_sub(1));
        base.saturating_mul(factor).min(max)
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.max_attempts == 0 {
            return Err("retry.max_attempts must be at least 1".to_string());
        }
        if self.retryable_error_patterns.is_some() && self.non_retryable_error_patterns.is_some()
        {
            return Err(
                "retryable_error_patterns and non_retryable_error_patterns are mutually exclusive"
                    .to_string(),
            );
        }
        Ok(())
    }
}

/// Polling cadence of the congestion monitor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MonitorPolicy {
    /// Interval after a successful poll.
    pub poll_interval_ms: u64,
    /// Interval after a transient transport failure.
    pub fast_retry_interval_ms: u64,
    /// Interval after any other poll failure.
    pub slow_backoff_interval_ms: u64,
}

impl Default for MonitorPolicy {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2_000,
            fast_retry_interval_ms: 100,
            slow_backoff_interval_ms: 10_000,
        }
    }
}

impl MonitorPolicy {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn fast_retry_interval(&self) -> Duration {
        Duration::from_millis(self.fast_retry_interval_ms.max(1))
    }

    pub fn slow_backoff_interval(&self) -> Duration {
        Duration::from_millis(self.slow_backoff_interval_ms.max(1))
    }
}

/// Batch session configuration
///
/// # Examples
///
/// ```ignore
/// let config = BatchConfig::dynamic()
///     .concurrent_requests(4)
///     .consistency_level(ConsistencyLevel::Quorum)
///     .non_retryable_errors(["invalid UUID"]);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BatchConfig {
    pub mode: BatchMode,

    /// Worker pool size in dynamic mode.
    pub concurrent_requests: usize,

    /// Passed through to the gateway.
    pub consistency_level: Option<ConsistencyLevel>,

    /// Starting size for both categories in dynamic mode.
    pub initial_batch_size: usize,

    /// How long one batch should roughly take on the server.
    pub target_batch_window_ms: u64,

    /// Producer sleep while the server asks to stop sending.
    pub overload_sleep_ms: u64,

    pub retry: RetryPolicy,

    pub monitor: MonitorPolicy,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            mode: BatchMode::Dynamic,
            concurrent_requests: 1,
            consistency_level: None,
            initial_batch_size: DEFAULT_BATCH_SIZE,
            target_batch_window_ms: 2_000,
            overload_sleep_ms: 1_000,
            retry: RetryPolicy::default(),
            monitor: MonitorPolicy::default(),
        }
    }
}

impl BatchConfig {
    /// Adaptive sizing (the default).
    pub fn dynamic() -> Self {
        Self::default()
    }

    /// Constant batch size and concurrency.
    pub fn fixed_size(batch_size: usize, concurrent_requests: usize) -> Self {
        Self {
            mode: BatchMode::FixedSize {
                batch_size,
                concurrent_requests,
            },
            ..Self::default()
        }
    }

    /// Send at most `requests_per_minute` objects per minute.
    pub fn rate_limit(requests_per_minute: usize) -> Self {
        Self {
            mode: BatchMode::RateLimit {
                requests_per_minute,
            },
            ..Self::default()
        }
    }

    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|err| BatchError::Config(format!("parse batch config: {}", err)))?;
        config.validate().map_err(BatchError::Config)?;
        Ok(config)
    }

    /// Replace the mode, keeping every other setting.
    pub fn mode(mut self, mode: BatchMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set worker pool size (dynamic mode)
    pub fn concurrent_requests(mut self, concurrent_requests: usize) -> Self {
        self.concurrent_requests = concurrent_requests;
        self
    }

    pub fn consistency_level(mut self, level: ConsistencyLevel) -> Self {
        self.consistency_level = Some(level);
        self
    }

    pub fn initial_batch_size(mut self, size: usize) -> Self {
        self.initial_batch_size = size;
        self
    }

    pub fn target_batch_window(mut self, window: Duration) -> Self {
        self.target_batch_window_ms = window.as_millis() as u64;
        self
    }

    pub fn overload_sleep(mut self, sleep: Duration) -> Self {
        self.overload_sleep_ms = sleep.as_millis() as u64;
        self
    }

    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn monitor_policy(mut self, monitor: MonitorPolicy) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.retry.max_attempts = max_attempts;
        self
    }

    /// Retry per-item server errors too, not only transport failures.
    pub fn retry_application_errors(mut self, enabled: bool) -> Self {
        self.retry.retry_application_errors = enabled;
        self
    }

    /// Retry only failures containing one of `patterns`.
    pub fn retryable_errors<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.retry.retryable_error_patterns = Some(patterns.into_iter().map(Into::into).collect());
        self
    }

    /// Never retry failures containing one of `patterns`.
    pub fn non_retryable_errors<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.retry.non_retryable_error_patterns =
            Some(patterns.into_iter().map(Into::into).collect());
        self
    }

    /// Worker pool size actually used by the dispatcher.
    pub fn effective_concurrency(&self) -> usize {
        match &self.mode {
            BatchMode::Dynamic => self.concurrent_requests,
            BatchMode::FixedSize {
                concurrent_requests,
                ..
            } => *concurrent_requests,
            BatchMode::RateLimit { .. } => 1,
        }
    }

    /// Constant batch size, or `None` when sizing is adaptive.
    pub fn fixed_batch_size(&self) -> Option<usize> {
        match &self.mode {
            BatchMode::Dynamic => None,
            BatchMode::FixedSize { batch_size, .. } => Some(*batch_size),
            BatchMode::RateLimit {
                requests_per_minute,
            } => Some((requests_per_minute / 10).max(1)),
        }
    }

    pub fn target_batch_window_duration(&self) -> Duration {
        Duration::from_millis(self.target_batch_window_ms)
    }

    pub fn overload_sleep_duration(&self) -> Duration {
        Duration::from_millis(self.overload_sleep_ms.max(1))
    }

    /// Validate configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        match &self.mode {
            BatchMode::Dynamic => {
                if self.concurrent_requests == 0 {
                    return Err("concurrent_requests must be at least 1".to_string());
                }
                if self.initial_batch_size == 0 {
                    return Err("initial_batch_size must be at least 1".to_string());
                }
            }
            BatchMode::FixedSize {
                batch_size,
                concurrent_requests,
            } => {
                if *batch_size == 0 {
                    return Err("fixed batch_size must be at least 1".to_string());
                }
                if *concurrent_requests == 0 {
                    return Err("fixed concurrent_requests must be at least 1".to_string());
                }
            }
            BatchMode::RateLimit {
                requests_per_minute,
            } => {
                if *requests_per_minute == 0 {
                    return Err("requests_per_minute must be at least 1".to_string());
                }
            }
        }

        if self.target_batch_window_ms == 0 {
            return Err("target_batch_window_ms must be positive".to_string());
        }

        self.retry.validate()
    }
}
