//! Redelivery policy for failed handler invocations

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How often and how late a failed delivery is republished
///
/// Retries are counted from zero: the delay before republishing a delivery
/// that already carries `retry_count` retries is
/// `base_delay * backoff_coefficient^retry_count`, capped at `max_delay`.
///
/// # Example
///
/// ```
/// use menusync_queue::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential();
///
/// assert_eq!(policy.delay_for_retry(0), Duration::from_secs(1));
/// assert_eq!(policy.delay_for_retry(1), Duration::from_secs(2));
/// assert_eq!(policy.delay_for_retry(2), Duration::from_secs(4));
/// assert!(!policy.has_retries_remaining(3));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Redeliveries before a message is dead-lettered
    pub max_retries: u32,

    /// Delay before the first redelivery
    #[serde(with = "duration_millis")]
    pub base_delay: Duration,

    /// Upper bound for any single delay
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,

    /// Backoff multiplier (2.0 for exponential)
    pub backoff_coefficient: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    /// 3 retries, 1s base delay doubling each time
    pub fn exponential() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            backoff_coefficient: 2.0,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the delay unit; with the default coefficient delays are 1, 2, 4 units
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Delay before republishing a delivery that has been retried `retry_count` times
    pub fn delay_for_retry(&self, retry_count: u32) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(retry_count).unwrap_or(i32::MAX);
        let delay = self.base_delay.as_secs_f64() * self.backoff_coefficient.powi(exponent);
        let capped = delay.min(self.max_delay.as_secs_f64());

        if capped.is_finite() {
            Duration::from_secs_f64(capped.max(0.0))
        } else {
            self.max_delay
        }
    }

    /// Whether a delivery with `retry_count` retries may be republished
    pub fn has_retries_remaining(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_defaults() {
        let policy = RetryPolicy::exponential();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.base_delay, Duration::from_secs(1));
        assert_eq!(policy.backoff_coefficient, 2.0);
    }

    #[test]
    fn test_delay_doubles_per_retry() {
        let policy = RetryPolicy::exponential();

        assert_eq!(policy.delay_for_retry(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_retry(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_retry(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for_retry(3), Duration::from_secs(8));
    }

    #[test]
    fn test_custom_unit() {
        let policy = RetryPolicy::exponential().with_base_delay(Duration::from_millis(10));

        assert_eq!(policy.delay_for_retry(0), Duration::from_millis(10));
        assert_eq!(policy.delay_for_retry(2), Duration::from_millis(40));
    }

    #[test]
    fn test_max_delay_cap() {
        let policy = RetryPolicy {
            max_delay: Duration::from_secs(5),
            ..RetryPolicy::exponential()
        };

        assert_eq!(policy.delay_for_retry(10), Duration::from_secs(5));
        assert_eq!(policy.delay_for_retry(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn test_has_retries_remaining() {
        let policy = RetryPolicy::exponential();

        assert!(policy.has_retries_remaining(0));
        assert!(policy.has_retries_remaining(2));
        assert!(!policy.has_retries_remaining(3));
    }

    #[test]
    fn test_serialization() {
        let policy = RetryPolicy::exponential().with_max_retries(5);

        let json = serde_json::to_string(&policy).unwrap();
        let parsed: RetryPolicy = serde_json::from_str(&json).unwrap();

        assert_eq!(policy, parsed);
        assert!(json.contains("\"base_delay\":1000"));
    }
}
