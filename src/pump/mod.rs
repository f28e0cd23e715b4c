//! Callback-driven pumps over receivers and sessions.
//!
//! A [`ReceivePump`] fronts either a [`MessageReceiver`] or a
//! [`SessionAcceptor`]. Registering a handler starts the matching pump: a
//! fixed number of receive loops for plain receivers, or a fixed number of
//! session slots, each servicing one accepted session at a time with several
//! receive loops. Loops run on the supplied Tokio runtime handle and are
//! tracked so [`ReceivePump::close`] can wait for them.

mod message_pump;
mod options;
mod session_pump;
mod tracker;

use std::{
    future::Future,
    panic::AssertUnwindSafe,
    sync::{
        Arc,
        Mutex,
        PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use futures::FutureExt;
use message_pump::MessagePump;
pub use options::{
    DEFAULT_MAX_AUTO_RENEW,
    DEFAULT_MESSAGE_WAIT,
    MessageHandlerOptions,
    SessionHandlerOptions,
};
use session_pump::SessionPump;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    error::{ReceiveError, Result},
    handler::{ExceptionPhase, HandlerError, MessageHandler, SessionHandler, callback_error, panic_error},
    metrics,
    panic::format_panic,
    receiver::MessageReceiver,
    renew::RenewErrorNotifier,
    retry::{ExponentialRetryPolicy, RetryPolicy},
    session::SessionAcceptor,
};

/// Delay used when the retry policy declines to retry a failed accept or
/// receive. Pumps never give up on their source.
pub const PUMP_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Errors raised when registering handlers.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PumpError {
    /// A handler has already been registered on this pump.
    #[error("a handler is already registered")]
    AlreadyRegistered,
    /// The handler kind does not match the pump's source.
    #[error("{0}")]
    UnsupportedHandler(&'static str),
    /// The pump has been closed.
    #[error("pump has been closed")]
    Closed,
}

enum PumpSource {
    Receiver(Arc<dyn MessageReceiver>),
    Sessions(Arc<dyn SessionAcceptor>),
}

#[derive(Clone)]
enum Registered {
    Nothing,
    Messages(Arc<MessagePump>),
    Sessions(Arc<SessionPump>),
}

/// Dispatches messages from a receiver or from accepted sessions to
/// application callbacks.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
///
/// use async_trait::async_trait;
/// use linkpump::{
///     ReceiveError,
///     handler::{ExceptionPhase, HandlerError, MessageHandler},
///     message::ReceivedMessage,
///     pump::{MessageHandlerOptions, ReceivePump},
///     receiver::MessageReceiver,
/// };
///
/// struct Printer;
///
/// #[async_trait]
/// impl MessageHandler for Printer {
///     async fn on_message(&self, message: &ReceivedMessage) -> Result<(), HandlerError> {
///         println!("{}", message.sequence_number);
///         Ok(())
///     }
///
///     fn notify_error(&self, error: &ReceiveError, phase: ExceptionPhase) {
///         eprintln!("{phase}: {error}");
///     }
/// }
///
/// # async fn demo(receiver: Arc<dyn MessageReceiver>) -> linkpump::Result<()> {
/// let pump = ReceivePump::for_receiver("orders", receiver);
/// pump.register_message_handler(
///     Arc::new(Printer),
///     MessageHandlerOptions::default(),
///     &tokio::runtime::Handle::current(),
/// )
/// .expect("first registration");
/// pump.close().await
/// # }
/// ```
pub struct ReceivePump {
    entity_path: Arc<str>,
    source: PumpSource,
    retry_policy: Arc<dyn RetryPolicy>,
    registered: Mutex<Registered>,
    tasks: TaskTracker,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl ReceivePump {
    /// Pump messages from a plain receiver.
    #[must_use]
    pub fn for_receiver(entity_path: impl Into<String>, receiver: Arc<dyn MessageReceiver>) -> Self {
        Self::new(entity_path.into(), PumpSource::Receiver(receiver))
    }

    /// Pump messages from sessions accepted through `acceptor`.
    #[must_use]
    pub fn for_sessions(entity_path: impl Into<String>, acceptor: Arc<dyn SessionAcceptor>) -> Self {
        Self::new(entity_path.into(), PumpSource::Sessions(acceptor))
    }

    fn new(entity_path: String, source: PumpSource) -> Self {
        Self {
            entity_path: entity_path.into(),
            source,
            retry_policy: Arc::new(ExponentialRetryPolicy::default()),
            registered: Mutex::new(Registered::Nothing),
            tasks: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Replace the policy consulted between failed session accepts.
    #[must_use]
    pub fn with_retry_policy(mut self, retry_policy: Arc<dyn RetryPolicy>) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Path of the entity being pumped.
    #[must_use]
    pub fn entity_path(&self) -> &str { &self.entity_path }

    /// Start pumping messages from the receiver into `handler`.
    ///
    /// # Errors
    ///
    /// Fails if a handler is already registered, if the pump was created
    /// over sessions, or if the pump is closed.
    pub fn register_message_handler(
        &self,
        handler: Arc<dyn MessageHandler>,
        options: MessageHandlerOptions,
        executor: &Handle,
    ) -> std::result::Result<(), PumpError> {
        let PumpSource::Receiver(receiver) = &self.source else {
            return Err(PumpError::UnsupportedHandler(
                "message handlers require a receiver; register a session handler instead",
            ));
        };
        let mut registered = self.lock_for_registration()?;
        let sink = self.sink(Arc::new({
            let handler = Arc::clone(&handler);
            move |error: &ReceiveError, phase| handler.notify_error(error, phase)
        }));
        let pump = Arc::new(MessagePump::new(
            Arc::clone(receiver),
            handler,
            options.normalized(),
            sink,
            self.shutdown.clone(),
        ));
        pump.start(&self.tasks, executor);
        tracing::info!(
            entity_path = %self.entity_path,
            concurrency = options.normalized().max_concurrent_calls,
            "registered message handler"
        );
        *registered = Registered::Messages(pump);
        Ok(())
    }

    /// Start accepting sessions and pumping their messages into `handler`.
    ///
    /// # Errors
    ///
    /// Fails if a handler is already registered, if the pump was created
    /// over a plain receiver, or if the pump is closed.
    pub fn register_session_handler(
        &self,
        handler: Arc<dyn SessionHandler>,
        options: SessionHandlerOptions,
        executor: &Handle,
    ) -> std::result::Result<(), PumpError> {
        let PumpSource::Sessions(acceptor) = &self.source else {
            return Err(PumpError::UnsupportedHandler(
                "session handlers require a session acceptor; register a message handler instead",
            ));
        };
        let mut registered = self.lock_for_registration()?;
        let sink = self.sink(Arc::new({
            let handler = Arc::clone(&handler);
            move |error: &ReceiveError, phase| handler.notify_error(error, phase)
        }));
        let pump = Arc::new(SessionPump::new(
            Arc::clone(acceptor),
            handler,
            options.normalized(),
            Arc::clone(&self.retry_policy),
            sink,
            self.shutdown.clone(),
            executor.clone(),
        ));
        pump.start(&self.tasks);
        tracing::info!(
            entity_path = %self.entity_path,
            sessions = options.normalized().max_concurrent_sessions,
            calls_per_session = options.normalized().max_concurrent_calls_per_session,
            "registered session handler"
        );
        *registered = Registered::Sessions(pump);
        Ok(())
    }

    /// Change how many messages are fetched ahead of the handler.
    pub fn set_prefetch_count(&self, prefetch: u32) {
        match &self.source {
            PumpSource::Receiver(receiver) => receiver.set_prefetch_count(prefetch),
            PumpSource::Sessions(acceptor) => {
                acceptor.set_prefetch_count(prefetch);
                if let Registered::Sessions(pump) = self.registered() {
                    pump.set_prefetch_count(prefetch);
                }
            }
        }
    }

    /// Returns `true` once [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool { self.closed.load(Ordering::Acquire) }

    /// Stop all loops, wait for in-flight callbacks, then close the receiver
    /// or every open session. Idempotent.
    ///
    /// # Errors
    ///
    /// Propagates a failure to close the underlying receiver.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        tracing::info!(entity_path = %self.entity_path, "closing receive pump");
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        match (&self.source, self.registered()) {
            (PumpSource::Receiver(receiver), _) => receiver.close().await,
            (PumpSource::Sessions(_), Registered::Sessions(pump)) => {
                pump.close_all().await;
                Ok(())
            }
            (PumpSource::Sessions(_), _) => Ok(()),
        }
    }

    fn registered(&self) -> Registered {
        self.registered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn lock_for_registration(
        &self,
    ) -> std::result::Result<std::sync::MutexGuard<'_, Registered>, PumpError> {
        if self.is_closed() {
            return Err(PumpError::Closed);
        }
        let registered = self
            .registered
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if matches!(*registered, Registered::Nothing) {
            Ok(registered)
        } else {
            Err(PumpError::AlreadyRegistered)
        }
    }

    fn sink(&self, notify: Arc<dyn Fn(&ReceiveError, ExceptionPhase) + Send + Sync>) -> ErrorSink {
        ErrorSink {
            entity_path: Arc::clone(&self.entity_path),
            notify,
            shutdown: self.shutdown.clone(),
        }
    }
}

impl std::fmt::Debug for ReceivePump {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceivePump")
            .field("entity_path", &self.entity_path)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Routes pump errors to the application's `notify_error`.
#[derive(Clone)]
pub(crate) struct ErrorSink {
    entity_path: Arc<str>,
    notify: Arc<dyn Fn(&ReceiveError, ExceptionPhase) + Send + Sync>,
    shutdown: CancellationToken,
}

impl ErrorSink {
    /// Report `error`. Illegal-state errors raised while the pump is closing
    /// are expected and dropped.
    pub(crate) fn report(&self, error: &ReceiveError, phase: ExceptionPhase) {
        if self.shutdown.is_cancelled() && error.is_illegal_state() {
            tracing::trace!(
                entity_path = %self.entity_path,
                %phase,
                %error,
                "suppressing error raised during close"
            );
            return;
        }
        metrics::inc_pump_errors(phase.as_str());
        tracing::warn!(entity_path = %self.entity_path, %phase, %error, "pump error");
        let notify = AssertUnwindSafe(|| (self.notify)(error, phase));
        if let Err(payload) = std::panic::catch_unwind(notify) {
            tracing::error!(
                entity_path = %self.entity_path,
                panic = %format_panic(payload),
                "error handler panicked"
            );
        }
    }

    /// Notifier handed to renew loops.
    pub(crate) fn renew_notifier(&self) -> RenewErrorNotifier {
        let sink = self.clone();
        Arc::new(move |error, phase| sink.report(&error, phase))
    }

    pub(crate) fn entity_path(&self) -> &str { &self.entity_path }
}

/// Await an application callback, turning errors and panics into
/// [`ReceiveError::Callback`].
pub(crate) async fn invoke_callback<F>(callback: F) -> Result<()>
where
    F: Future<Output = std::result::Result<(), HandlerError>>,
{
    match AssertUnwindSafe(callback).catch_unwind().await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(error)) => Err(callback_error(error)),
        Err(payload) => Err(panic_error(payload)),
    }
}
