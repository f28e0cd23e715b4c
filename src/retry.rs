//! Retry policies governing link replacement and session acceptance.
//!
//! A [`RetryPolicy`] maps an error and an attempt count to a back-off delay,
//! or `None` when the caller should stop retrying. Only transient errors are
//! retried by the bundled policies.

use std::{sync::Arc, time::Duration};

use serde::Deserialize;

use crate::error::ReceiveError;

/// Decides whether and when a failed operation should be retried.
#[cfg_attr(test, mockall::automock)]
pub trait RetryPolicy: Send + Sync + 'static {
    /// Return the delay before attempt `attempt` (1-based), or `None` to stop.
    fn calculate_retry_delay(&self, error: &ReceiveError, attempt: u32) -> Option<Duration>;
}

/// Shape of the delay curve applied between attempts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryMode {
    /// Every retry waits for `delay`.
    Fixed,
    /// The delay doubles after every attempt, capped at `max_delay`.
    #[default]
    Exponential,
}

/// Configuration shared by the bundled retry policies.
///
/// # Default Values
/// - `mode`: exponential
/// - `max_retries`: 3
/// - `delay`: 800 milliseconds
/// - `max_delay`: 60 seconds
///
/// # Invariants
/// - `delay` must not exceed `max_delay`
/// - `delay` must be at least 1 millisecond
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryOptions {
    /// Delay curve between attempts.
    pub mode: RetryMode,
    /// Number of retries permitted before giving up.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            mode: RetryMode::Exponential,
            max_retries: 3,
            delay: Duration::from_millis(800),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryOptions {
    /// Clamp delays to sane bounds and ensure `delay <= max_delay`.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::time::Duration;
    ///
    /// use linkpump::retry::RetryOptions;
    ///
    /// let opts = RetryOptions {
    ///     delay: Duration::from_millis(5),
    ///     max_delay: Duration::ZERO,
    ///     ..RetryOptions::default()
    /// };
    ///
    /// let normalized = opts.normalized();
    /// assert_eq!(normalized.delay, Duration::from_millis(1));
    /// assert_eq!(normalized.max_delay, Duration::from_millis(5));
    /// ```
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.delay = self.delay.max(Duration::from_millis(1));
        self.max_delay = self.max_delay.max(Duration::from_millis(1));
        if self.delay > self.max_delay {
            std::mem::swap(&mut self.delay, &mut self.max_delay);
        }
        self
    }

    /// Build the policy selected by [`RetryOptions::mode`].
    #[must_use]
    pub fn into_policy(self) -> Arc<dyn RetryPolicy> {
        match self.mode {
            RetryMode::Fixed => Arc::new(FixedRetryPolicy::new(self)),
            RetryMode::Exponential => Arc::new(ExponentialRetryPolicy::new(self)),
        }
    }

    fn permits(&self, error: &ReceiveError, attempt: u32) -> bool {
        error.is_transient() && attempt > 0 && attempt <= self.max_retries
    }
}

/// Retries transient errors with a delay that doubles on every attempt.
#[derive(Clone, Copy, Debug)]
pub struct ExponentialRetryPolicy {
    options: RetryOptions,
}

impl ExponentialRetryPolicy {
    /// Create a policy from normalized `options`.
    #[must_use]
    pub fn new(options: RetryOptions) -> Self {
        Self {
            options: options.normalized(),
        }
    }
}

impl Default for ExponentialRetryPolicy {
    fn default() -> Self { Self::new(RetryOptions::default()) }
}

impl RetryPolicy for ExponentialRetryPolicy {
    fn calculate_retry_delay(&self, error: &ReceiveError, attempt: u32) -> Option<Duration> {
        if !self.options.permits(error, attempt) {
            return None;
        }
        let factor = 1_u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        let delay = self
            .options
            .delay
            .checked_mul(factor)
            .unwrap_or(self.options.max_delay);
        Some(delay.min(self.options.max_delay))
    }
}

/// Retries transient errors after a constant delay.
#[derive(Clone, Copy, Debug)]
pub struct FixedRetryPolicy {
    options: RetryOptions,
}

impl FixedRetryPolicy {
    /// Create a policy from normalized `options`.
    #[must_use]
    pub fn new(options: RetryOptions) -> Self {
        Self {
            options: options.normalized(),
        }
    }
}

impl RetryPolicy for FixedRetryPolicy {
    fn calculate_retry_delay(&self, error: &ReceiveError, attempt: u32) -> Option<Duration> {
        self.options
            .permits(error, attempt)
            .then_some(self.options.delay)
    }
}

#[cfg(test)]
mod tests {
    use rstest::{fixture, rstest};

    use super::*;
    use crate::error::ErrorCondition;

    #[fixture]
    fn busy() -> ReceiveError { ReceiveError::link(ErrorCondition::ServerBusy, "busy") }

    #[fixture]
    fn options() -> RetryOptions {
        RetryOptions {
            mode: RetryMode::Exponential,
            max_retries: 4,
            delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
        }
    }

    #[rstest]
    #[case(1, Some(100))]
    #[case(2, Some(200))]
    #[case(3, Some(400))]
    #[case(4, Some(500))]
    #[case(5, None)]
    fn exponential_delays_double_and_cap(
        busy: ReceiveError,
        options: RetryOptions,
        #[case] attempt: u32,
        #[case] expected_ms: Option<u64>,
    ) {
        let policy = ExponentialRetryPolicy::new(options);
        assert_eq!(
            policy.calculate_retry_delay(&busy, attempt),
            expected_ms.map(Duration::from_millis)
        );
    }

    #[rstest]
    fn fixed_policy_uses_constant_delay(busy: ReceiveError, options: RetryOptions) {
        let policy = FixedRetryPolicy::new(options);
        assert_eq!(
            policy.calculate_retry_delay(&busy, 3),
            Some(Duration::from_millis(100))
        );
    }

    #[rstest]
    fn non_transient_errors_are_not_retried(options: RetryOptions) {
        let policy = ExponentialRetryPolicy::new(options);
        let err = ReceiveError::link(ErrorCondition::ArgumentError, "bad");
        assert_eq!(policy.calculate_retry_delay(&err, 1), None);
    }

    #[rstest]
    fn huge_attempts_do_not_overflow(busy: ReceiveError) {
        let policy = ExponentialRetryPolicy::new(RetryOptions {
            max_retries: u32::MAX,
            ..RetryOptions::default()
        });
        assert_eq!(
            policy.calculate_retry_delay(&busy, 200),
            Some(Duration::from_secs(60))
        );
    }

    #[test]
    fn options_deserialize_with_defaults() {
        let opts: RetryOptions =
            serde::Deserialize::deserialize(serde::de::value::MapDeserializer::<
                _,
                serde::de::value::Error,
            >::new(
                [("max_retries", 7_u32)].into_iter()
            ))
            .expect("deserialize retry options");
        assert_eq!(opts.max_retries, 7);
        assert_eq!(opts.delay, RetryOptions::default().delay);
    }
}
