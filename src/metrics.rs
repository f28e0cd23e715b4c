//! Metric helpers for `linkpump`.
//!
//! This module defines metric names and simple helper functions wrapping the
//! [`metrics`](https://docs.rs/metrics) crate. With the `metrics` feature
//! disabled every helper compiles to a no-op.

#[cfg(feature = "metrics")]
use metrics::{counter, gauge};

/// Name of the counter tracking messages handed to a downstream subscriber.
pub const MESSAGES_RECEIVED: &str = "linkpump_messages_received_total";
/// Name of the counter tracking links attached by the link processor.
pub const LINKS_ATTACHED: &str = "linkpump_links_attached_total";
/// Name of the counter tracking lock renewal attempts.
pub const LOCK_RENEWALS: &str = "linkpump_lock_renewals_total";
/// Name of the counter tracking errors reported to pump handlers.
pub const PUMP_ERRORS: &str = "linkpump_pump_errors_total";
/// Name of the gauge tracking sessions currently held by session pumps.
pub const SESSIONS_OPEN: &str = "linkpump_sessions_open";

/// Kind of lease being renewed.
#[derive(Clone, Copy, Debug)]
pub enum LeaseKind {
    /// A single message lock.
    Message,
    /// A session lock.
    Session,
}

impl LeaseKind {
    #[cfg_attr(not(feature = "metrics"), allow(dead_code))]
    fn as_str(self) -> &'static str {
        match self {
            LeaseKind::Message => "message",
            LeaseKind::Session => "session",
        }
    }
}

/// Record a message forwarded downstream.
pub fn inc_messages() {
    #[cfg(feature = "metrics")]
    counter!(MESSAGES_RECEIVED).increment(1);
}

/// Record a link attached by the processor.
pub fn inc_links() {
    #[cfg(feature = "metrics")]
    counter!(LINKS_ATTACHED).increment(1);
}

/// Record a lock renewal attempt and whether it succeeded.
pub fn inc_renewals(kind: LeaseKind, succeeded: bool) {
    #[cfg(feature = "metrics")]
    counter!(
        LOCK_RENEWALS,
        "kind" => kind.as_str(),
        "outcome" => if succeeded { "ok" } else { "error" }
    )
    .increment(1);
    #[cfg(not(feature = "metrics"))]
    let _ = (kind, succeeded);
}

/// Record an error reported to a pump handler in the given phase.
pub fn inc_pump_errors(phase: &'static str) {
    #[cfg(feature = "metrics")]
    counter!(PUMP_ERRORS, "phase" => phase).increment(1);
    #[cfg(not(feature = "metrics"))]
    let _ = phase;
}

/// Increment the open sessions gauge.
pub fn inc_sessions() {
    #[cfg(feature = "metrics")]
    gauge!(SESSIONS_OPEN).increment(1.0);
}

/// Decrement the open sessions gauge.
pub fn dec_sessions() {
    #[cfg(feature = "metrics")]
    gauge!(SESSIONS_OPEN).decrement(1.0);
}
