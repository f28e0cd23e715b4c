//! Timers that keep message and session locks alive during processing.
//!
//! A [`RenewLockLoop`] runs as one Tokio task per lease. Each iteration
//! sleeps until shortly before the lease expires, renews it and reschedules.
//! Renewal failures are reported to the owner; lost locks and cancellations
//! end the loop while anything else is retried on the next iteration.
//!
//! Server expiries are wall-clock instants. Each one is converted to a Tokio
//! deadline when the loop learns it, and all scheduling runs against that
//! deadline.

mod message;
mod session;

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
pub use message::MessageRenewLoop;
pub use session::SessionRenewLoop;
use static_assertions::const_assert;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{ReceiveError, Result},
    handler::ExceptionPhase,
    metrics::{self, LeaseKind},
};

/// Remaining validity assumed when a lease has already expired.
pub const MINIMUM_LOCK_VALIDITY: Duration = Duration::from_secs(4);
/// Upper bound on how early before expiry a renewal is attempted.
pub const MAXIMUM_RENEW_BUFFER: Duration = Duration::from_secs(10);
/// Shortest wait before retrying a failed renewal.
pub const MINIMUM_RETRY_DELAY: Duration = Duration::from_secs(1);

const_assert!(MINIMUM_LOCK_VALIDITY.as_secs() > 0);
const_assert!(MAXIMUM_RENEW_BUFFER.as_secs() >= MINIMUM_LOCK_VALIDITY.as_secs());
const_assert!(MINIMUM_RETRY_DELAY.as_secs() <= MINIMUM_LOCK_VALIDITY.as_secs() / 2);

/// Callback receiving renewal failures along with the phase they occurred in.
pub type RenewErrorNotifier = Arc<dyn Fn(ReceiveError, ExceptionPhase) + Send + Sync>;

/// Delay before the next renewal of a lease expiring at `locked_until`.
///
/// The renewal fires `min(remaining / 2, MAXIMUM_RENEW_BUFFER)` before
/// expiry. An already expired lease is treated as having
/// [`MINIMUM_LOCK_VALIDITY`] left.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use chrono::{TimeDelta, Utc};
/// use linkpump::renew::next_renew_interval;
///
/// let now = Utc::now();
/// assert_eq!(
///     next_renew_interval(now + TimeDelta::seconds(30), now),
///     Duration::from_secs(20)
/// );
/// ```
#[must_use]
pub fn next_renew_interval(locked_until: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    renew_interval((locked_until - now).to_std().unwrap_or(Duration::ZERO))
}

fn renew_interval(remaining: Duration) -> Duration {
    let remaining = if remaining.is_zero() {
        MINIMUM_LOCK_VALIDITY
    } else {
        remaining
    };
    let buffer = (remaining / 2).min(MAXIMUM_RENEW_BUFFER);
    remaining - buffer
}

/// Tokio instant at which a lease expiring at `locked_until` runs out.
fn lease_deadline(locked_until: DateTime<Utc>) -> Instant {
    let remaining = (locked_until - Utc::now())
        .to_std()
        .unwrap_or(Duration::ZERO);
    let now = Instant::now();
    now.checked_add(remaining)
        .unwrap_or_else(|| now + Duration::from_secs(86_400 * 365 * 30))
}

/// A lease the loop keeps alive.
#[async_trait]
pub(crate) trait RenewTarget: Send + Sync + 'static {
    /// Human readable identifier for logs.
    fn identifier(&self) -> &str;

    fn kind(&self) -> LeaseKind;

    fn phase(&self) -> ExceptionPhase;

    /// Whether a lease expiring at `locked_until` still needs renewing.
    fn should_continue(&self, locked_until: DateTime<Utc>) -> bool;

    async fn renew(&self) -> Result<DateTime<Utc>>;
}

/// Shared cancellation state of a renew loop.
#[derive(Debug, Default)]
struct LoopState {
    cancelled: AtomicBool,
    token: CancellationToken,
}

impl LoopState {
    fn is_cancelled(&self) -> bool { self.cancelled.load(Ordering::Acquire) }
}

/// Background task renewing one lease until cancelled.
#[derive(Debug)]
pub struct RenewLockLoop {
    state: Arc<LoopState>,
}

impl RenewLockLoop {
    /// Spawn the loop for `target`, whose lease currently expires at
    /// `locked_until`.
    pub(crate) fn start<T: RenewTarget>(
        target: T,
        locked_until: DateTime<Utc>,
        notifier: RenewErrorNotifier,
    ) -> Self {
        let state = Arc::new(LoopState::default());
        tokio::spawn(run(target, locked_until, notifier, Arc::clone(&state)));
        Self { state }
    }

    /// Stop the loop. Idempotent; a renewal already in flight completes but
    /// is neither reported nor rescheduled.
    pub fn cancel(&self) {
        if !self.state.cancelled.swap(true, Ordering::AcqRel) {
            self.state.token.cancel();
        }
    }

    /// Returns `true` once [`cancel`](Self::cancel) has been called or the
    /// loop stopped on its own.
    #[must_use]
    pub fn is_cancelled(&self) -> bool { self.state.is_cancelled() }
}

impl Drop for RenewLockLoop {
    fn drop(&mut self) { self.cancel(); }
}

async fn run<T: RenewTarget>(
    target: T,
    mut locked_until: DateTime<Utc>,
    notifier: RenewErrorNotifier,
    state: Arc<LoopState>,
) {
    let mut deadline = lease_deadline(locked_until);
    let mut retrying = false;
    while !state.is_cancelled() && target.should_continue(locked_until) {
        let mut delay = renew_interval(deadline.saturating_duration_since(Instant::now()));
        if retrying {
            delay = delay.max(MINIMUM_RETRY_DELAY);
        }
        tracing::trace!(
            lease = target.identifier(),
            ?delay,
            "scheduling lock renewal"
        );
        tokio::select! {
            biased;

            () = state.token.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
        }
        if state.is_cancelled() {
            break;
        }
        match target.renew().await {
            Ok(renewed) => {
                metrics::inc_renewals(target.kind(), true);
                tracing::debug!(
                    lease = target.identifier(),
                    locked_until = %renewed,
                    "renewed lock"
                );
                locked_until = renewed;
                deadline = lease_deadline(renewed);
                retrying = false;
            }
            Err(error) => {
                metrics::inc_renewals(target.kind(), false);
                retrying = true;
                if state.is_cancelled() {
                    break;
                }
                let stop = error.is_lock_lost() || error.is_cancelled();
                tracing::warn!(
                    lease = target.identifier(),
                    %error,
                    stop,
                    "lock renewal failed"
                );
                notifier(error, target.phase());
                if stop {
                    break;
                }
            }
        }
    }
    state.cancelled.store(true, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use chrono::TimeDelta;
    use rstest::rstest;
    use tracing_test::traced_test;

    use super::*;
    use crate::error::ErrorCondition;

    /// Lease whose renewals always fail with the configured error.
    struct Failing {
        error: ReceiveError,
        attempts: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl RenewTarget for Failing {
        fn identifier(&self) -> &str { "lease-1" }

        fn kind(&self) -> LeaseKind { LeaseKind::Message }

        fn phase(&self) -> ExceptionPhase { ExceptionPhase::RenewMessageLock }

        fn should_continue(&self, _locked_until: DateTime<Utc>) -> bool { true }

        async fn renew(&self) -> Result<DateTime<Utc>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(self.error.clone())
        }
    }

    fn start_failing(
        error: ReceiveError,
        lease: TimeDelta,
    ) -> (RenewLockLoop, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let attempts = Arc::new(AtomicUsize::new(0));
        let notified = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&notified);
        let renew = RenewLockLoop::start(
            Failing {
                error,
                attempts: Arc::clone(&attempts),
            },
            Utc::now() + lease,
            Arc::new(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        (renew, attempts, notified)
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn failed_renewal_is_logged_and_retried() {
        let (renew, attempts, notified) = start_failing(
            ReceiveError::link(ErrorCondition::ServerBusy, "busy"),
            TimeDelta::seconds(30),
        );
        tokio::time::sleep(Duration::from_millis(20_100)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(notified.load(Ordering::SeqCst), 1);
        assert!(!renew.is_cancelled());
        assert!(logs_contain("lock renewal failed"));
        assert!(logs_contain("lease-1"));
    }

    /// Runs on the real clock so wall-clock expiries and timers move
    /// together.
    #[tokio::test]
    async fn short_lease_failures_are_spaced_out() {
        let (renew, attempts, notified) = start_failing(
            ReceiveError::link(ErrorCondition::ServerBusy, "busy"),
            TimeDelta::seconds(1),
        );
        tokio::time::sleep(Duration::from_millis(1_200)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(notified.load(Ordering::SeqCst), 1);
        renew.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn failure_after_cancel_is_not_reported() {
        let (renew, attempts, notified) =
            start_failing(ReceiveError::LockLost, TimeDelta::seconds(30));
        renew.cancel();
        tokio::time::sleep(Duration::from_secs(45)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
        assert_eq!(notified.load(Ordering::SeqCst), 0);
    }

    #[rstest]
    #[case::long_lease(30, 20)]
    #[case::short_lease(8, 4)]
    #[case::buffer_capped(120, 110)]
    #[case::already_expired(-5, 2)]
    fn renewal_fires_before_expiry(#[case] remaining_secs: i64, #[case] expected_secs: u64) {
        let now = Utc::now();
        let locked_until = now + TimeDelta::seconds(remaining_secs);
        assert_eq!(
            next_renew_interval(locked_until, now),
            Duration::from_secs(expected_secs)
        );
    }
}
