//! Tests for message and session lock renewal loops.
//!
//! Time is paused so renewals can be observed at their scheduled instants.

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use chrono::{TimeDelta, Utc};
use linkpump::{
    error::{ErrorCondition, ReceiveError},
    handler::ExceptionPhase,
    message::ReceiveMode,
    renew::{MessageRenewLoop, RenewErrorNotifier, SessionRenewLoop},
};
use linkpump_testing::{ScriptedReceiver, ScriptedSession, message};
use rstest::{fixture, rstest};
use tokio::time::{Instant, sleep, sleep_until};

type Reported = Arc<Mutex<Vec<(String, ExceptionPhase)>>>;

#[fixture]
fn notifier() -> (RenewErrorNotifier, Reported) {
    let reported: Reported = Arc::default();
    let sink = Arc::clone(&reported);
    let notifier: RenewErrorNotifier = Arc::new(move |error, phase| {
        sink.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((error.to_string(), phase));
    });
    (notifier, reported)
}

fn phases(reported: &Reported) -> Vec<ExceptionPhase> {
    reported
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .iter()
        .map(|(_, phase)| *phase)
        .collect()
}

/// A thirty second lock is renewed ten seconds before it expires and the
/// loop stops renewing once cancelled.
#[rstest]
#[tokio::test(start_paused = true)]
async fn message_lock_renews_until_cancelled(notifier: (RenewErrorNotifier, Reported)) {
    let (notifier, reported) = notifier;
    let receiver = ScriptedReceiver::new(ReceiveMode::PeekLock);
    let delivered = message(1);
    let renew = MessageRenewLoop::start(
        receiver.clone(),
        &delivered,
        Utc::now() + TimeDelta::minutes(5),
        notifier,
    );

    sleep(Duration::from_secs(15)).await;
    assert!(receiver.renewed().is_empty());
    sleep(Duration::from_secs(10)).await;
    assert_eq!(receiver.renewed(), vec![delivered.lock_token]);

    renew.cancel();
    renew.cancel();
    sleep(Duration::from_secs(120)).await;
    assert_eq!(receiver.renewed().len(), 1);
    assert!(renew.is_cancelled());
    assert!(phases(&reported).is_empty());
}

/// A lock already extending past the renewal deadline is left to lapse.
#[rstest]
#[tokio::test(start_paused = true)]
async fn message_lock_beyond_deadline_is_not_renewed(notifier: (RenewErrorNotifier, Reported)) {
    let (notifier, _reported) = notifier;
    let receiver = ScriptedReceiver::new(ReceiveMode::PeekLock);
    let renew = MessageRenewLoop::start(
        receiver.clone(),
        &message(1),
        Utc::now() + TimeDelta::seconds(20),
        notifier,
    );

    sleep(Duration::from_secs(60)).await;
    assert!(receiver.renewed().is_empty());
    assert!(renew.is_cancelled());
}

/// Lost locks and cancellations end the loop after a single report.
#[rstest]
#[case::lock_lost(ReceiveError::LockLost)]
#[case::cancelled(ReceiveError::Cancelled)]
#[tokio::test(start_paused = true)]
async fn terminal_renewal_failure_stops_loop(
    #[case] failure: ReceiveError,
    notifier: (RenewErrorNotifier, Reported),
) {
    let (notifier, reported) = notifier;
    let receiver = ScriptedReceiver::new(ReceiveMode::PeekLock);
    receiver.fail_renewals_with(failure);
    let renew = MessageRenewLoop::start(
        receiver.clone(),
        &message(1),
        Utc::now() + TimeDelta::minutes(5),
        notifier,
    );

    sleep(Duration::from_secs(120)).await;
    assert_eq!(receiver.renewed().len(), 1);
    assert_eq!(phases(&reported), vec![ExceptionPhase::RenewMessageLock]);
    assert!(renew.is_cancelled());
}

/// Other failures are reported and retried against the original expiry.
/// The gap halves as the lease runs out but never drops below the retry
/// floor, and settles on a fixed cadence once the lease has lapsed.
#[rstest]
#[tokio::test(start_paused = true)]
async fn transient_renewal_failure_keeps_retrying(notifier: (RenewErrorNotifier, Reported)) {
    let (notifier, reported) = notifier;
    let receiver = ScriptedReceiver::new(ReceiveMode::PeekLock);
    receiver.fail_renewals_with(ReceiveError::link(ErrorCondition::ServerBusy, "busy"));
    let start = Instant::now();
    let renew = MessageRenewLoop::start(
        receiver.clone(),
        &message(1),
        Utc::now() + TimeDelta::minutes(5),
        notifier,
    );

    // Attempts land at 20, 25, 27.5, 28.75, 29.75 and 30.75 seconds, then
    // every two seconds.
    for (at_ms, expected) in [
        (19_900, 0),
        (20_100, 1),
        (25_100, 2),
        (27_600, 3),
        (28_850, 4),
        (29_850, 5),
        (30_850, 6),
        (40_850, 11),
    ] {
        sleep_until(start + Duration::from_millis(at_ms)).await;
        assert_eq!(receiver.renewed().len(), expected, "attempts by {at_ms} ms");
    }
    assert_eq!(phases(&reported).len(), 11);
    assert!(
        phases(&reported)
            .iter()
            .all(|phase| *phase == ExceptionPhase::RenewMessageLock)
    );
    assert!(!renew.is_cancelled());
    renew.cancel();
}

/// Session locks are renewed from each renewal's new expiry until the loop
/// is cancelled.
#[rstest]
#[tokio::test(start_paused = true)]
async fn session_lock_renews_until_cancelled(notifier: (RenewErrorNotifier, Reported)) {
    let (notifier, reported) = notifier;
    let session = ScriptedSession::new("session-1");
    let renew = SessionRenewLoop::start(session.clone(), notifier);

    sleep(Duration::from_secs(45)).await;
    assert_eq!(session.renewals(), 2);

    renew.cancel();
    renew.cancel();
    sleep(Duration::from_secs(120)).await;
    assert_eq!(session.renewals(), 2);
    assert!(phases(&reported).is_empty());
}

/// A lost session lock is reported once and ends the loop.
#[rstest]
#[tokio::test(start_paused = true)]
async fn lost_session_lock_stops_loop(notifier: (RenewErrorNotifier, Reported)) {
    let (notifier, reported) = notifier;
    let session = ScriptedSession::new("session-1");
    session.fail_renewals_with(ReceiveError::SessionLockLost("session-1".into()));
    let renew = SessionRenewLoop::start(session.clone(), notifier);

    sleep(Duration::from_secs(120)).await;
    assert_eq!(session.renewals(), 1);
    assert_eq!(phases(&reported), vec![ExceptionPhase::RenewSessionLock]);
    assert!(renew.is_cancelled());
}

/// Dropping the handle stops the loop.
#[rstest]
#[tokio::test(start_paused = true)]
async fn dropping_loop_stops_renewal(notifier: (RenewErrorNotifier, Reported)) {
    let (notifier, _reported) = notifier;
    let session = ScriptedSession::new("session-1");
    drop(SessionRenewLoop::start(session.clone(), notifier));

    sleep(Duration::from_secs(120)).await;
    assert_eq!(session.renewals(), 0);
}
