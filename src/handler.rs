//! Application callbacks driven by the pumps.

use std::{error::Error as StdError, fmt, sync::Arc};

use async_trait::async_trait;

use crate::{
    error::ReceiveError,
    message::ReceivedMessage,
    panic::format_panic,
    session::MessageSession,
};

/// Error type returned by application callbacks.
pub type HandlerError = Box<dyn StdError + Send + Sync>;

/// Stage of the pump in which a reported error occurred.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ExceptionPhase {
    /// Receiving a message from the receiver or session.
    Receive,
    /// Inside an application callback.
    UserCallback,
    /// Completing a message after a successful callback.
    Complete,
    /// Abandoning a message after a failed callback.
    Abandon,
    /// Renewing the lock on a message.
    RenewMessageLock,
    /// Renewing the lock on a session.
    RenewSessionLock,
    /// Accepting the next available session.
    AcceptSession,
    /// Closing a session.
    SessionClose,
}

impl ExceptionPhase {
    /// Returns the phase name as a static string for logging and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Receive => "receive",
            Self::UserCallback => "user_callback",
            Self::Complete => "complete",
            Self::Abandon => "abandon",
            Self::RenewMessageLock => "renew_message_lock",
            Self::RenewSessionLock => "renew_session_lock",
            Self::AcceptSession => "accept_session",
            Self::SessionClose => "session_close",
        }
    }
}

impl fmt::Display for ExceptionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Callbacks for a pump over a plain receiver.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Process one message. An `Err` abandons the message when the pump
    /// auto-completes.
    async fn on_message(&self, message: &ReceivedMessage) -> Result<(), HandlerError>;

    /// Observe an error raised by the pump outside of `on_message`'s return
    /// value.
    fn notify_error(&self, error: &ReceiveError, phase: ExceptionPhase);
}

/// Callbacks for a pump over accepted sessions.
#[async_trait]
pub trait SessionHandler: Send + Sync + 'static {
    /// Process one message received on `session`.
    async fn on_message(
        &self,
        session: &Arc<dyn MessageSession>,
        message: &ReceivedMessage,
    ) -> Result<(), HandlerError>;

    /// Called once before the pump closes an exhausted session.
    async fn on_close_session(&self, session: &Arc<dyn MessageSession>) -> Result<(), HandlerError> {
        let _ = session;
        Ok(())
    }

    /// Observe an error raised by the pump.
    fn notify_error(&self, error: &ReceiveError, phase: ExceptionPhase);
}

/// Error reported when a callback panics.
#[derive(Debug, thiserror::Error)]
#[error("callback panicked: {0}")]
pub(crate) struct CallbackPanic(pub(crate) String);

/// Convert a callback's `Err` into a pump error.
pub(crate) fn callback_error(error: HandlerError) -> ReceiveError {
    ReceiveError::Callback(Arc::from(error))
}

/// Convert a caught panic payload into a pump error.
pub(crate) fn panic_error(payload: Box<dyn std::any::Any + Send>) -> ReceiveError {
    ReceiveError::callback(CallbackPanic(format_panic(payload).to_string()))
}
