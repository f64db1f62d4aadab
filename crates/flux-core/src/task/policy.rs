//! Task execution policies: retry, cache, timeout and the options bundle

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{FallbackFn, RollbackFn};

/// Retry configuration for a task.
///
/// Attempt `n > 1` waits `min(delay * multiplier^(n-1), max_delay)` before
/// running; attempt 1 runs immediately.
///
/// # Example
///
/// ```
/// use flux_core::task::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::new(3)
///     .with_delay(Duration::from_secs(1))
///     .with_backoff_multiplier(2.0)
///     .with_max_delay(Duration::from_secs(30));
///
/// assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(1));
/// assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(2));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts including the first. Always >= 1.
    pub max_attempts: u32,

    /// Base delay before the first retry.
    #[serde(with = "duration_millis")]
    pub delay: Duration,

    /// Multiplier applied per retry. Always >= 1.
    pub backoff_multiplier: f64,

    /// Cap on the computed delay.
    #[serde(default, with = "option_duration_millis")]
    pub max_delay: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            max_delay: None,
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self::new(1)
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier.max(1.0);
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    /// Delay before retry attempt `n` (1-based overall attempt number).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let retry_num = attempt - 1;
        let base =
            self.delay.as_secs_f64() * self.backoff_multiplier.powi(retry_num as i32 - 1);
        let capped = match self.max_delay {
            Some(max) => base.min(max.as_secs_f64()),
            None => base,
        };
        Duration::from_secs_f64(capped)
    }

    pub fn has_attempts_remaining(&self, current_attempt: u32) -> bool {
        current_attempt < self.max_attempts
    }
}

/// Cache configuration for a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachePolicy {
    #[serde(with = "duration_millis")]
    pub ttl: Duration,
}

impl CachePolicy {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self { ttl }
    }
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),
        }
    }
}

/// Deployment-level defaults applied when task options leave a field unset.
#[derive(Debug, Clone)]
pub struct RuntimeDefaults {
    pub default_timeout: Option<Duration>,
    pub default_retries: u32,
    pub default_backoff: f64,
    pub default_retry_delay: Duration,
}

impl Default for RuntimeDefaults {
    fn default() -> Self {
        Self {
            default_timeout: None,
            default_retries: 1,
            default_backoff: 2.0,
            default_retry_delay: Duration::from_secs(1),
        }
    }
}

impl RuntimeDefaults {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.default_retries)
            .with_delay(self.default_retry_delay)
            .with_backoff_multiplier(self.default_backoff)
    }
}

/// The full envelope configuration for one task invocation.
///
/// Handlers (fallback, rollback) are plain async closures; everything else
/// is data. Unset retry/timeout fall back to [`RuntimeDefaults`].
#[derive(Clone, Default)]
pub struct TaskOptions {
    pub retry: Option<RetryPolicy>,
    /// Wall-clock budget per attempt, not for the whole chain.
    pub timeout: Option<Duration>,
    pub cache: Option<CachePolicy>,
    /// Secret names resolved before the first attempt.
    pub secret_requests: Vec<String>,
    pub fallback: Option<FallbackFn>,
    pub rollback: Option<RollbackFn>,
    /// Serialized outputs larger than this are offloaded to the output
    /// store and replaced by a reference in the event log.
    pub output_threshold: Option<usize>,
    /// Force offload regardless of size.
    pub output_external: bool,
}

impl TaskOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cache(mut self, cache: CachePolicy) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_secrets<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.secret_requests = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_fallback(mut self, fallback: FallbackFn) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn with_rollback(mut self, rollback: RollbackFn) -> Self {
        self.rollback = Some(rollback);
        self
    }

    pub fn with_output_threshold(mut self, bytes: usize) -> Self {
        self.output_threshold = Some(bytes);
        self
    }

    pub fn external_output(mut self) -> Self {
        self.output_external = true;
        self
    }

    pub(crate) fn effective_retry(&self, defaults: &RuntimeDefaults) -> RetryPolicy {
        self.retry.clone().unwrap_or_else(|| defaults.retry_policy())
    }

    pub(crate) fn effective_timeout(&self, defaults: &RuntimeDefaults) -> Option<Duration> {
        self.timeout.or(defaults.default_timeout)
    }
}

impl std::fmt::Debug for TaskOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskOptions")
            .field("retry", &self.retry)
            .field("timeout", &self.timeout)
            .field("cache", &self.cache)
            .field("secret_requests", &self.secret_requests)
            .field("fallback", &self.fallback.is_some())
            .field("rollback", &self.rollback.is_some())
            .field("output_threshold", &self.output_threshold)
            .field("output_external", &self.output_external)
            .finish()
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

/// Serde support for Option<Duration> as milliseconds
mod option_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => d.as_millis().serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis: Option<u64> = Option::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_progression() {
        let policy = RetryPolicy::new(5)
            .with_delay(Duration::from_secs(1))
            .with_backoff_multiplier(2.0);

        assert_eq!(policy.delay_for_attempt(1), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(4));
    }

    #[test]
    fn test_max_delay_cap() {
        let policy = RetryPolicy::new(10)
            .with_delay(Duration::from_secs(1))
            .with_backoff_multiplier(3.0)
            .with_max_delay(Duration::from_secs(5));

        assert_eq!(policy.delay_for_attempt(8), Duration::from_secs(5));
    }

    #[test]
    fn test_min_one_attempt() {
        let policy = RetryPolicy::new(0);
        assert_eq!(policy.max_attempts, 1);
        assert!(!policy.has_attempts_remaining(1));
    }

    #[test]
    fn test_policy_serialization() {
        let policy = RetryPolicy::new(3)
            .with_delay(Duration::from_millis(250))
            .with_max_delay(Duration::from_secs(10));

        let json = serde_json::to_string(&policy).unwrap();
        let parsed: RetryPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(policy, parsed);
    }

    #[test]
    fn test_defaults_fill_unset_fields() {
        let defaults = RuntimeDefaults {
            default_timeout: Some(Duration::from_secs(30)),
            default_retries: 4,
            ..Default::default()
        };

        let options = TaskOptions::new();
        assert_eq!(options.effective_retry(&defaults).max_attempts, 4);
        assert_eq!(
            options.effective_timeout(&defaults),
            Some(Duration::from_secs(30))
        );

        let explicit = TaskOptions::new()
            .with_retry(RetryPolicy::new(2))
            .with_timeout(Duration::from_secs(5));
        assert_eq!(explicit.effective_retry(&defaults).max_attempts, 2);
        assert_eq!(
            explicit.effective_timeout(&defaults),
            Some(Duration::from_secs(5))
        );
    }
}
