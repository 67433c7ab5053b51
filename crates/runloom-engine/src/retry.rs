//! Retry policy: pure backoff and retryability decisions
//!
//! The engine never retries inline; a failed step is re-enqueued as a
//! delayed `retry_step` item and this policy decides whether and when.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Exponential backoff with a cap.
///
/// # Example
///
/// ```
/// use runloom_engine::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::default()
///     .with_max_attempts(5)
///     .with_initial_interval(Duration::from_secs(1));
///
/// // First retry after 1 second, then 2, 4, 8...
/// assert_eq!(policy.calculate_delay(1), Duration::from_secs(1));
/// assert_eq!(policy.calculate_delay(2), Duration::from_secs(2));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the initial one)
    pub max_attempts: u32,

    /// Delay before the first retry
    #[serde(with = "duration_millis")]
    pub initial_interval: Duration,

    /// Cap on the delay between retries
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Backoff multiplier (2.0 doubles the delay each retry)
    pub backoff_coefficient: f64,

    /// Jitter factor (0.0-1.0) to add randomness
    #[serde(default)]
    pub jitter: f64,

    /// Error substrings that ARE retryable. Empty means everything not
    /// explicitly non-retryable is retried.
    #[serde(default)]
    pub retryable_errors: Vec<String>,

    /// Error substrings that are never retried
    #[serde(default)]
    pub non_retryable_errors: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(300),
            backoff_coefficient: 2.0,
            jitter: 0.0,
            retryable_errors: vec![],
            non_retryable_errors: vec![],
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_interval: Duration::ZERO,
            max_interval: Duration::ZERO,
            backoff_coefficient: 1.0,
            ..Self::default()
        }
    }

    /// Fixed-interval retries (no backoff)
    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_interval: interval,
            max_interval: interval,
            backoff_coefficient: 1.0,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn with_retryable_error(mut self, pattern: impl Into<String>) -> Self {
        self.retryable_errors.push(pattern.into());
        self
    }

    pub fn with_non_retryable_error(mut self, pattern: impl Into<String>) -> Self {
        self.non_retryable_errors.push(pattern.into());
        self
    }

    /// Whether a failure on attempt `attempt_count` (1-based count of
    /// failures so far) should be retried.
    ///
    /// The attempt budget is checked first, then the non-retryable list,
    /// then the retryable list (an empty retryable list accepts anything
    /// not rejected above).
    pub fn is_retryable(&self, error: &str, attempt_count: u32) -> bool {
        if attempt_count >= self.max_attempts {
            return false;
        }
        if self
            .non_retryable_errors
            .iter()
            .any(|p| error.contains(p.as_str()))
        {
            return false;
        }
        if self.retryable_errors.is_empty() {
            return true;
        }
        self.retryable_errors
            .iter()
            .any(|p| error.contains(p.as_str()))
    }

    /// Delay before the retry that follows failure number `attempt_count`:
    /// `min(max_interval, initial_interval * coefficient^(attempt_count-1))`.
    pub fn calculate_delay(&self, attempt_count: u32) -> Duration {
        let exponent = attempt_count.saturating_sub(1);
        let base = self.initial_interval.as_secs_f64()
            * self.backoff_coefficient.powi(exponent as i32);
        let capped = base.min(self.max_interval.as_secs_f64());

        let jittered = if self.jitter > 0.0 {
            let mut rng = rand::thread_rng();
            let range = capped * self.jitter;
            let offset = rng.gen_range(-range..range);
            (capped + offset).max(0.0)
        } else {
            capped
        };

        Duration::from_secs_f64(jittered)
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
