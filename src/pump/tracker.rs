//! Coordination of the receive loops sharing one session.
//!
//! A loop that finds no message (or hits an error) does not give up on its
//! own. It waits until either a sibling receives a message, in which case all
//! waiting loops retry, or every sibling is waiting too, in which case the
//! session is exhausted and the last loop to arrive closes it.

use std::sync::{Mutex, PoisonError};

use futures::{FutureExt, future::Shared};
use tokio::sync::oneshot;

/// Signal shared by the loops waiting in one round.
pub(crate) type RetrySignal = Shared<oneshot::Receiver<bool>>;

/// What a loop should do after an empty or failed receive.
pub(crate) enum RetryDecision {
    /// Every other loop is waiting: close the session.
    Close,
    /// Await the signal; `true` means retry, `false` means stop.
    Wait(RetrySignal),
}

struct Round {
    waiting: usize,
    sender: Option<oneshot::Sender<bool>>,
    signal: RetrySignal,
}

impl Round {
    fn new() -> Self {
        let (sender, receiver) = oneshot::channel();
        Self {
            waiting: 0,
            sender: Some(sender),
            signal: receiver.shared(),
        }
    }

    fn resolve(&mut self, retry: bool) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(retry);
        }
    }
}

/// Tracks how many of a session's receive loops are idle.
pub(crate) struct SessionTracker {
    receivers: usize,
    round: Mutex<Round>,
}

impl SessionTracker {
    pub(crate) fn new(receivers: usize) -> Self {
        Self {
            receivers: receivers.max(1),
            round: Mutex::new(Round::new()),
        }
    }

    /// Register an idle loop and decide whether it retries or closes.
    pub(crate) fn should_retry(&self) -> RetryDecision {
        let mut round = self.round.lock().unwrap_or_else(PoisonError::into_inner);
        if round.waiting + 1 >= self.receivers {
            round.resolve(false);
            RetryDecision::Close
        } else {
            round.waiting += 1;
            RetryDecision::Wait(round.signal.clone())
        }
    }

    /// Wake every waiting loop because the session still has messages.
    pub(crate) fn notify_message_received(&self) {
        let mut round = self.round.lock().unwrap_or_else(PoisonError::into_inner);
        if round.waiting > 0 {
            round.resolve(true);
            *round = Round::new();
        }
    }
}

/// Resolve a signal, treating a dropped round as "stop".
pub(crate) async fn await_signal(signal: RetrySignal) -> bool { signal.await.unwrap_or(false) }

#[cfg(test)]
mod tests {
    use super::*;

    fn expect_wait(decision: RetryDecision) -> RetrySignal {
        match decision {
            RetryDecision::Wait(signal) => signal,
            RetryDecision::Close => panic!("expected the loop to wait"),
        }
    }

    #[test]
    fn single_receiver_closes_immediately() {
        let tracker = SessionTracker::new(1);
        assert!(matches!(tracker.should_retry(), RetryDecision::Close));
    }

    #[tokio::test]
    async fn last_idle_loop_closes_and_releases_waiters() {
        let tracker = SessionTracker::new(3);
        let first = expect_wait(tracker.should_retry());
        let second = expect_wait(tracker.should_retry());
        assert!(matches!(tracker.should_retry(), RetryDecision::Close));
        assert!(!await_signal(first).await);
        assert!(!await_signal(second).await);
    }

    #[tokio::test]
    async fn message_wakes_waiters_and_starts_new_round() {
        let tracker = SessionTracker::new(2);
        let waiting = expect_wait(tracker.should_retry());
        tracker.notify_message_received();
        assert!(await_signal(waiting).await);
        // The woken loop rejoins a fresh round rather than closing.
        let again = expect_wait(tracker.should_retry());
        tracker.notify_message_received();
        assert!(await_signal(again).await);
    }

    #[test]
    fn message_without_waiters_keeps_round() {
        let tracker = SessionTracker::new(2);
        tracker.notify_message_received();
        assert!(matches!(tracker.should_retry(), RetryDecision::Wait(_)));
    }
}
