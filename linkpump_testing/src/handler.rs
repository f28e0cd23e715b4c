//! A handler that records every callback for later assertions.

use std::{
    collections::HashSet,
    sync::{
        Arc,
        Mutex,
        PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use linkpump::{
    error::ReceiveError,
    handler::{ExceptionPhase, HandlerError, MessageHandler, SessionHandler},
    message::ReceivedMessage,
    session::MessageSession,
};
use tokio::sync::Notify;

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Records messages, errors and closed sessions seen by a pump.
///
/// Individual sequence numbers can be configured to fail or panic, and a
/// per-message delay makes concurrency observable.
#[derive(Default)]
pub struct RecordingHandler {
    messages: Mutex<Vec<(Option<String>, i64)>>,
    errors: Mutex<Vec<(String, ExceptionPhase)>>,
    closed_sessions: Mutex<Vec<String>>,
    fail_on: Mutex<HashSet<i64>>,
    panic_on: Mutex<HashSet<i64>>,
    fail_close: Mutex<bool>,
    delay: Mutex<Option<Duration>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    changed: Notify,
}

impl RecordingHandler {
    /// Create a handler that accepts every message.
    #[must_use]
    pub fn new() -> Arc<Self> { Arc::new(Self::default()) }

    /// Return an error from `on_message` for `sequence_number`.
    pub fn fail_on(&self, sequence_number: i64) { lock(&self.fail_on).insert(sequence_number); }

    /// Panic inside `on_message` for `sequence_number`.
    pub fn panic_on(&self, sequence_number: i64) { lock(&self.panic_on).insert(sequence_number); }

    /// Return an error from every `on_close_session`.
    pub fn fail_close_session(&self) { *lock(&self.fail_close) = true; }

    /// Sleep for `delay` inside each `on_message`.
    pub fn set_delay(&self, delay: Duration) { *lock(&self.delay) = Some(delay); }

    /// Sequence numbers handled so far, in callback order.
    #[must_use]
    pub fn messages(&self) -> Vec<i64> { lock(&self.messages).iter().map(|(_, seq)| *seq).collect() }

    /// `(session id, sequence number)` pairs handled by a session pump.
    #[must_use]
    pub fn session_messages(&self) -> Vec<(String, i64)> {
        lock(&self.messages)
            .iter()
            .filter_map(|(session, seq)| session.clone().map(|id| (id, *seq)))
            .collect()
    }

    /// Rendered errors and the phase each was reported in.
    #[must_use]
    pub fn errors(&self) -> Vec<(String, ExceptionPhase)> { lock(&self.errors).clone() }

    /// Phases of the reported errors, in order.
    #[must_use]
    pub fn error_phases(&self) -> Vec<ExceptionPhase> {
        lock(&self.errors).iter().map(|(_, phase)| *phase).collect()
    }

    /// Sessions passed to `on_close_session`, in order.
    #[must_use]
    pub fn closed_sessions(&self) -> Vec<String> { lock(&self.closed_sessions).clone() }

    /// Highest number of `on_message` calls that overlapped.
    #[must_use]
    pub fn max_in_flight(&self) -> usize { self.max_in_flight.load(Ordering::SeqCst) }

    /// Wait until at least `count` messages have been handled.
    pub async fn wait_for_messages(&self, count: usize) {
        self.wait_until(|| lock(&self.messages).len() >= count).await;
    }

    /// Wait until at least `count` errors have been reported.
    pub async fn wait_for_errors(&self, count: usize) {
        self.wait_until(|| lock(&self.errors).len() >= count).await;
    }

    /// Wait until at least `count` sessions have been closed.
    pub async fn wait_for_closed_sessions(&self, count: usize) {
        self.wait_until(|| lock(&self.closed_sessions).len() >= count).await;
    }

    async fn wait_until(&self, done: impl Fn() -> bool) {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if done() {
                return;
            }
            notified.await;
        }
    }

    async fn handle(&self, session_id: Option<String>, message: &ReceivedMessage) -> Result<(), HandlerError> {
        let seq = message.sequence_number;
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let delay = *lock(&self.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        lock(&self.messages).push((session_id, seq));
        self.changed.notify_waiters();

        assert!(!lock(&self.panic_on).contains(&seq), "handler panic on message {seq}");
        if lock(&self.fail_on).contains(&seq) {
            return Err(format!("handler rejected message {seq}").into());
        }
        Ok(())
    }

    fn record_error(&self, error: &ReceiveError, phase: ExceptionPhase) {
        lock(&self.errors).push((error.to_string(), phase));
        self.changed.notify_waiters();
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn on_message(&self, message: &ReceivedMessage) -> Result<(), HandlerError> {
        self.handle(None, message).await
    }

    fn notify_error(&self, error: &ReceiveError, phase: ExceptionPhase) { self.record_error(error, phase); }
}

#[async_trait]
impl SessionHandler for RecordingHandler {
    async fn on_message(
        &self,
        session: &Arc<dyn MessageSession>,
        message: &ReceivedMessage,
    ) -> Result<(), HandlerError> {
        self.handle(Some(session.session_id().to_owned()), message).await
    }

    async fn on_close_session(&self, session: &Arc<dyn MessageSession>) -> Result<(), HandlerError> {
        lock(&self.closed_sessions).push(session.session_id().to_owned());
        self.changed.notify_waiters();
        if *lock(&self.fail_close) {
            return Err(format!("close callback failed for {}", session.session_id()).into());
        }
        Ok(())
    }

    fn notify_error(&self, error: &ReceiveError, phase: ExceptionPhase) { self.record_error(error, phase); }
}
