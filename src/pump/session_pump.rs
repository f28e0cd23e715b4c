//! Session slots and their per-session receive loops.
//!
//! Each slot accepts one session at a time and services it with
//! `max_concurrent_calls_per_session` receive loops. When the loops agree the
//! session is exhausted it is closed and the slot accepts a replacement:
//! accepting, active, draining, closing, closed, accepting.

use std::{
    pin::pin,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use futures::future::join_all;
use tokio::runtime::Handle;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use super::{
    ErrorSink,
    PUMP_RETRY_DELAY,
    SessionHandlerOptions,
    invoke_callback,
    tracker::{RetryDecision, SessionTracker, await_signal},
};
use crate::{
    error::{ReceiveError, Result},
    handler::{ExceptionPhase, SessionHandler},
    message::{ReceiveMode, ReceivedMessage},
    metrics,
    renew::SessionRenewLoop,
    retry::RetryPolicy,
    session::{MessageSession, SessionAcceptor},
};

/// An accepted session and the state shared by its receive loops.
struct OpenSession {
    session: Arc<dyn MessageSession>,
    renew: Option<SessionRenewLoop>,
    tracker: SessionTracker,
    closed: AtomicBool,
}

impl OpenSession {
    fn id(&self) -> &str { self.session.session_id() }
}

pub(crate) struct SessionPump {
    acceptor: Arc<dyn SessionAcceptor>,
    handler: Arc<dyn SessionHandler>,
    options: SessionHandlerOptions,
    retry_policy: Arc<dyn RetryPolicy>,
    sink: ErrorSink,
    shutdown: CancellationToken,
    executor: Handle,
    sessions: DashMap<String, Arc<OpenSession>>,
    tasks: TaskTracker,
}

impl SessionPump {
    #[expect(
        clippy::too_many_arguments,
        reason = "constructor wires every collaborator once"
    )]
    pub(crate) fn new(
        acceptor: Arc<dyn SessionAcceptor>,
        handler: Arc<dyn SessionHandler>,
        options: SessionHandlerOptions,
        retry_policy: Arc<dyn RetryPolicy>,
        sink: ErrorSink,
        shutdown: CancellationToken,
        executor: Handle,
    ) -> Self {
        Self {
            acceptor,
            handler,
            options,
            retry_policy,
            sink,
            shutdown,
            executor,
            sessions: DashMap::new(),
            tasks: TaskTracker::new(),
        }
    }

    /// Spawn one acceptance slot per permitted concurrent session.
    pub(crate) fn start(self: &Arc<Self>, tasks: &TaskTracker) {
        for slot in 0..self.options.max_concurrent_sessions {
            tasks.spawn_on(Arc::clone(self).run_slot(slot), &self.executor);
        }
    }

    /// Apply `prefetch` to every open session.
    pub(crate) fn set_prefetch_count(&self, prefetch: u32) {
        for entry in &self.sessions {
            entry.value().session.set_prefetch_count(prefetch);
        }
    }

    /// Close every session still open. Called once the slots have stopped.
    pub(crate) async fn close_all(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        let open: Vec<Arc<OpenSession>> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for session in open {
            self.close_session(&session).await;
        }
    }

    async fn run_slot(self: Arc<Self>, slot: usize) {
        let mut attempt = 0_u32;
        loop {
            let accepted = tokio::select! {
                biased;

                () = self.shutdown.cancelled() => break,
                accepted = self.acceptor.accept_next_session() => accepted,
            };
            match accepted {
                Ok(session) => {
                    attempt = 0;
                    self.pump_session(session).await;
                }
                Err(error) if error.is_timeout() => {
                    tracing::trace!(
                        entity_path = self.sink.entity_path(),
                        slot,
                        "no session available"
                    );
                }
                Err(error) if error.is_cancelled() => break,
                Err(error) => {
                    attempt = attempt.saturating_add(1);
                    self.sink.report(&error, ExceptionPhase::AcceptSession);
                    let delay = self.accept_retry_delay(&error, attempt);
                    tokio::select! {
                        biased;

                        () = self.shutdown.cancelled() => break,
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
        tracing::debug!(
            entity_path = self.sink.entity_path(),
            slot,
            "session slot stopped"
        );
    }

    fn accept_retry_delay(&self, error: &ReceiveError, attempt: u32) -> Duration {
        self.retry_policy
            .calculate_retry_delay(error, attempt)
            .unwrap_or(PUMP_RETRY_DELAY)
    }

    /// Service `session` until its receive loops stop.
    async fn pump_session(self: &Arc<Self>, session: Arc<dyn MessageSession>) {
        let renew = (!self.options.max_auto_renew_duration.is_zero())
            .then(|| SessionRenewLoop::start(Arc::clone(&session), self.sink.renew_notifier()));
        let open = Arc::new(OpenSession {
            session,
            renew,
            tracker: SessionTracker::new(self.options.max_concurrent_calls_per_session),
            closed: AtomicBool::new(false),
        });
        self.sessions
            .insert(open.id().to_owned(), Arc::clone(&open));
        metrics::inc_sessions();
        tracing::info!(
            entity_path = self.sink.entity_path(),
            session_id = open.id(),
            "accepted session"
        );
        let loops: Vec<_> = (0..self.options.max_concurrent_calls_per_session)
            .map(|_| {
                self.tasks.spawn_on(
                    Arc::clone(self).receive_loop(Arc::clone(&open)),
                    &self.executor,
                )
            })
            .collect();
        for joined in join_all(loops).await {
            if let Err(error) = joined {
                tracing::error!(
                    entity_path = self.sink.entity_path(),
                    session_id = open.id(),
                    %error,
                    "session receive loop failed"
                );
            }
        }
    }

    async fn receive_loop(self: Arc<Self>, open: Arc<OpenSession>) {
        loop {
            let received = tokio::select! {
                biased;

                () = self.shutdown.cancelled() => return,
                received = open.session.receive(self.options.message_wait_duration) => received,
            };
            match received {
                Ok(Some(message)) => {
                    open.tracker.notify_message_received();
                    self.dispatch(&open, message).await;
                    continue;
                }
                Ok(None) => {}
                Err(error) => self.sink.report(&error, ExceptionPhase::Receive),
            }
            match open.tracker.should_retry() {
                RetryDecision::Close => {
                    self.close_session(&open).await;
                    return;
                }
                RetryDecision::Wait(signal) => {
                    let retry = tokio::select! {
                        biased;

                        () = self.shutdown.cancelled() => return,
                        retry = await_signal(signal) => retry,
                    };
                    if !retry {
                        return;
                    }
                }
            }
        }
    }

    async fn dispatch(&self, open: &OpenSession, message: ReceivedMessage) {
        tracing::trace!(
            entity_path = self.sink.entity_path(),
            session_id = open.id(),
            message = %message.identifier(),
            "dispatching session message"
        );
        let outcome = self
            .with_renew_deadline(open, invoke_callback(self.handler.on_message(&open.session, &message)))
            .await;
        if let Err(error) = &outcome {
            self.sink.report(error, ExceptionPhase::UserCallback);
        }
        if !(self.options.auto_complete && self.acceptor.receive_mode() == ReceiveMode::PeekLock) {
            return;
        }
        if outcome.is_ok() {
            if let Err(error) = open.session.complete(message.lock_token).await {
                self.sink.report(&error, ExceptionPhase::Complete);
            }
        } else if let Err(error) = open.session.abandon(message.lock_token).await {
            self.sink.report(&error, ExceptionPhase::Abandon);
        }
    }

    /// Run `callback`, cancelling the session renew loop if it outlives
    /// `max_auto_renew_duration`.
    async fn with_renew_deadline<F>(&self, open: &OpenSession, callback: F) -> Result<()>
    where
        F: Future<Output = Result<()>>,
    {
        let Some(renew) = &open.renew else {
            return callback.await;
        };
        let mut callback = pin!(callback);
        let mut deadline = pin!(tokio::time::sleep(self.options.max_auto_renew_duration));
        let mut expired = false;
        loop {
            tokio::select! {
                biased;

                outcome = &mut callback => return outcome,
                () = &mut deadline, if !expired => {
                    expired = true;
                    tracing::debug!(
                        entity_path = self.sink.entity_path(),
                        session_id = open.id(),
                        "callback exceeded auto-renew duration; stopping session renewal"
                    );
                    renew.cancel();
                }
            }
        }
    }

    /// Release a session. Only the first caller does any work.
    async fn close_session(&self, open: &OpenSession) {
        if open.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(renew) = &open.renew {
            renew.cancel();
        }
        if let Err(error) = invoke_callback(self.handler.on_close_session(&open.session)).await {
            self.sink.report(&error, ExceptionPhase::UserCallback);
        }
        if let Err(error) = open.session.close().await {
            self.sink.report(&error, ExceptionPhase::SessionClose);
        }
        self.sessions.remove(open.id());
        metrics::dec_sessions();
        tracing::info!(
            entity_path = self.sink.entity_path(),
            session_id = open.id(),
            "closed session"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use mockall::predicate::eq;

    use super::*;
    use crate::{
        error::ErrorCondition,
        handler::HandlerError,
        retry::MockRetryPolicy,
    };

    struct NoSessions;

    #[async_trait]
    impl SessionAcceptor for NoSessions {
        async fn accept_next_session(&self) -> Result<Arc<dyn MessageSession>> {
            Err(ReceiveError::Timeout)
        }

        fn set_prefetch_count(&self, _prefetch: u32) {}
    }

    struct Silent;

    #[async_trait]
    impl SessionHandler for Silent {
        async fn on_message(
            &self,
            _session: &Arc<dyn MessageSession>,
            _message: &ReceivedMessage,
        ) -> std::result::Result<(), HandlerError> {
            Ok(())
        }

        fn notify_error(&self, _error: &ReceiveError, _phase: ExceptionPhase) {}
    }

    fn pump(policy: MockRetryPolicy, reported: Arc<Mutex<Vec<ExceptionPhase>>>) -> SessionPump {
        let shutdown = CancellationToken::new();
        let sink = ErrorSink {
            entity_path: Arc::from("sessions"),
            notify: Arc::new(move |_: &ReceiveError, phase| {
                reported.lock().expect("lock").push(phase);
            }),
            shutdown: shutdown.clone(),
        };
        SessionPump::new(
            Arc::new(NoSessions),
            Arc::new(Silent),
            SessionHandlerOptions::default(),
            Arc::new(policy),
            sink,
            shutdown,
            Handle::current(),
        )
    }

    #[tokio::test]
    async fn accept_retry_uses_policy_delay() {
        let mut policy = MockRetryPolicy::new();
        policy
            .expect_calculate_retry_delay()
            .with(mockall::predicate::always(), eq(2))
            .return_const(Some::<Duration>(Duration::from_millis(250)));
        let pump = pump(policy, Arc::default());
        let error = ReceiveError::link(ErrorCondition::ServerBusy, "busy");
        assert_eq!(pump.accept_retry_delay(&error, 2), Duration::from_millis(250));
    }

    #[tokio::test]
    async fn accept_retry_falls_back_when_policy_gives_up() {
        let mut policy = MockRetryPolicy::new();
        policy
            .expect_calculate_retry_delay()
            .return_const(None::<Duration>);
        let pump = pump(policy, Arc::default());
        let error = ReceiveError::link(ErrorCondition::Unauthorized, "denied");
        assert_eq!(pump.accept_retry_delay(&error, 9), PUMP_RETRY_DELAY);
    }

    #[tokio::test]
    async fn illegal_state_is_suppressed_while_closing() {
        let reported = Arc::new(Mutex::new(Vec::new()));
        let pump = pump(MockRetryPolicy::new(), Arc::clone(&reported));
        pump.sink.report(&ReceiveError::Closed, ExceptionPhase::Receive);
        pump.shutdown.cancel();
        pump.sink.report(&ReceiveError::Closed, ExceptionPhase::Receive);
        pump.sink
            .report(&ReceiveError::Timeout, ExceptionPhase::SessionClose);
        assert_eq!(
            *reported.lock().expect("lock"),
            vec![ExceptionPhase::Receive, ExceptionPhase::SessionClose]
        );
    }
}
