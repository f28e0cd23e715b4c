//! Tuning knobs for the message and session pumps.

use std::time::Duration;

use serde::Deserialize;

/// Default upper bound on automatic lock renewal.
pub const DEFAULT_MAX_AUTO_RENEW: Duration = Duration::from_secs(5 * 60);
/// Default time a receive call waits for a message.
pub const DEFAULT_MESSAGE_WAIT: Duration = Duration::from_secs(60);

/// Configuration for a pump over a plain receiver.
///
/// # Default Values
/// - `max_concurrent_calls`: 1
/// - `auto_complete`: true
/// - `max_auto_renew_duration`: 5 minutes
/// - `message_wait_duration`: 1 minute
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MessageHandlerOptions {
    /// Number of receive loops dispatching callbacks concurrently.
    pub max_concurrent_calls: usize,
    /// Complete messages after a successful callback and abandon them after
    /// a failed one.
    pub auto_complete: bool,
    /// How long a message lock is renewed while its callback runs. Zero
    /// disables renewal.
    pub max_auto_renew_duration: Duration,
    /// How long each receive call waits for a message.
    pub message_wait_duration: Duration,
}

impl Default for MessageHandlerOptions {
    fn default() -> Self {
        Self {
            max_concurrent_calls: 1,
            auto_complete: true,
            max_auto_renew_duration: DEFAULT_MAX_AUTO_RENEW,
            message_wait_duration: DEFAULT_MESSAGE_WAIT,
        }
    }
}

impl MessageHandlerOptions {
    /// Ensure at least one receive loop and a non-zero receive wait.
    ///
    /// ```
    /// use linkpump::pump::MessageHandlerOptions;
    ///
    /// let opts = MessageHandlerOptions {
    ///     max_concurrent_calls: 0,
    ///     ..MessageHandlerOptions::default()
    /// };
    /// assert_eq!(opts.normalized().max_concurrent_calls, 1);
    /// ```
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.max_concurrent_calls = self.max_concurrent_calls.max(1);
        self.message_wait_duration = self.message_wait_duration.max(Duration::from_millis(1));
        self
    }
}

/// Configuration for a pump over accepted sessions.
///
/// # Default Values
/// - `max_concurrent_sessions`: 1
/// - `max_concurrent_calls_per_session`: 1
/// - `auto_complete`: true
/// - `max_auto_renew_duration`: 5 minutes
/// - `message_wait_duration`: 1 minute
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SessionHandlerOptions {
    /// Number of sessions held open at once.
    pub max_concurrent_sessions: usize,
    /// Number of receive loops per session.
    pub max_concurrent_calls_per_session: usize,
    /// Complete messages after a successful callback and abandon them after
    /// a failed one.
    pub auto_complete: bool,
    /// How long a session lock is renewed while a callback runs. Zero
    /// disables renewal.
    pub max_auto_renew_duration: Duration,
    /// How long each receive call waits before the session is considered
    /// idle.
    pub message_wait_duration: Duration,
}

impl Default for SessionHandlerOptions {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: 1,
            max_concurrent_calls_per_session: 1,
            auto_complete: true,
            max_auto_renew_duration: DEFAULT_MAX_AUTO_RENEW,
            message_wait_duration: DEFAULT_MESSAGE_WAIT,
        }
    }
}

impl SessionHandlerOptions {
    /// Ensure at least one session, one loop per session and a non-zero
    /// receive wait.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.max_concurrent_sessions = self.max_concurrent_sessions.max(1);
        self.max_concurrent_calls_per_session = self.max_concurrent_calls_per_session.max(1);
        self.message_wait_duration = self.message_wait_duration.max(Duration::from_millis(1));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_options_normalize_concurrency() {
        let opts = SessionHandlerOptions {
            max_concurrent_sessions: 0,
            max_concurrent_calls_per_session: 0,
            message_wait_duration: Duration::ZERO,
            ..SessionHandlerOptions::default()
        }
        .normalized();
        assert_eq!(opts.max_concurrent_sessions, 1);
        assert_eq!(opts.max_concurrent_calls_per_session, 1);
        assert_eq!(opts.message_wait_duration, Duration::from_millis(1));
    }
}
