//! Canonical error and result types for the crate.
//!
//! `ReceiveError` is the single error surface shared by links, the link
//! processor, lock renewal and the pumps. Classification helpers let retry
//! policies and renew loops decide whether a failure is transient, a lost
//! lease, or a cancellation.

use std::{error::Error as StdError, fmt, sync::Arc};

use thiserror::Error;

/// Protocol-level error conditions reported by the service on a link or a
/// request/response operation.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCondition {
    /// The request carried an invalid argument.
    ArgumentError,
    /// The caller is not authorised for the entity.
    Unauthorized,
    /// The service is throttling the caller.
    ServerBusy,
    /// The service timed out the operation.
    Timeout,
    /// The lock on a message was lost or has expired.
    MessageLockLost,
    /// The lock on a session was lost or has expired.
    SessionLockLost,
    /// The entity does not exist.
    EntityNotFound,
    /// An unexpected failure inside the service.
    InternalError,
    /// The service forcibly detached the link.
    LinkDetachForced,
    /// The service forcibly closed the connection.
    ConnectionForced,
}

impl ErrorCondition {
    /// Returns the condition name as a static string for logging and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ArgumentError => "argument-error",
            Self::Unauthorized => "unauthorized",
            Self::ServerBusy => "server-busy",
            Self::Timeout => "timeout",
            Self::MessageLockLost => "message-lock-lost",
            Self::SessionLockLost => "session-lock-lost",
            Self::EntityNotFound => "entity-not-found",
            Self::InternalError => "internal-error",
            Self::LinkDetachForced => "link-detach-forced",
            Self::ConnectionForced => "connection-forced",
        }
    }

    /// Whether the service marks this condition as worth retrying.
    #[must_use]
    pub const fn is_transient_by_default(self) -> bool {
        matches!(
            self,
            Self::ServerBusy
                | Self::Timeout
                | Self::InternalError
                | Self::LinkDetachForced
                | Self::ConnectionForced
        )
    }
}

impl fmt::Display for ErrorCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Errors surfaced by the receive pipeline.
///
/// The type is cheaply cloneable so a terminal error can be both delivered
/// downstream and kept for later inspection via
/// [`LinkProcessor::error`](crate::processor::LinkProcessor::error).
#[non_exhaustive]
#[derive(Clone, Debug, Error)]
pub enum ReceiveError {
    /// An error condition raised by the service or the transport.
    #[error("{condition}: {description}")]
    Link {
        /// Protocol condition reported with the error.
        condition: ErrorCondition,
        /// Human readable description supplied by the service.
        description: String,
        /// Whether the failure may succeed when retried.
        transient: bool,
    },
    /// The lock on a message has been lost.
    #[error("the lock on the message has been lost")]
    LockLost,
    /// The lock on a session has been lost.
    #[error("the lock on session '{0}' has been lost")]
    SessionLockLost(String),
    /// The operation did not complete in time.
    #[error("operation timed out")]
    Timeout,
    /// The operation was cancelled by the service or the caller.
    #[error("operation was cancelled")]
    Cancelled,
    /// The object was used in a state that does not allow the operation.
    #[error("illegal state: {0}")]
    IllegalState(String),
    /// A second subscriber tried to attach to a single-subscriber stream.
    #[error("processor already has a subscriber")]
    AlreadySubscribed,
    /// No link is currently attached to carry the operation.
    #[error("no active link is available")]
    LinkUnavailable,
    /// The receiver or processor has been closed.
    #[error("receiver has been closed")]
    Closed,
    /// An application callback failed or panicked.
    #[error("callback failed: {0}")]
    Callback(#[source] Arc<dyn StdError + Send + Sync>),
}

impl ReceiveError {
    /// Build a link error whose transience follows the condition's default.
    #[must_use]
    pub fn link(condition: ErrorCondition, description: impl Into<String>) -> Self {
        Self::Link {
            condition,
            description: description.into(),
            transient: condition.is_transient_by_default(),
        }
    }

    /// Build a link error with explicit transience.
    #[must_use]
    pub fn link_with_transience(
        condition: ErrorCondition,
        description: impl Into<String>,
        transient: bool,
    ) -> Self {
        Self::Link {
            condition,
            description: description.into(),
            transient,
        }
    }

    /// Wrap an application error raised by a callback.
    #[must_use]
    pub fn callback<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Callback(Arc::new(error))
    }

    /// The protocol condition carried by this error, if any.
    #[must_use]
    pub fn condition(&self) -> Option<ErrorCondition> {
        match self {
            Self::Link { condition, .. } => Some(*condition),
            Self::LockLost => Some(ErrorCondition::MessageLockLost),
            Self::SessionLockLost(_) => Some(ErrorCondition::SessionLockLost),
            Self::Timeout => Some(ErrorCondition::Timeout),
            _ => None,
        }
    }

    /// Returns `true` when the failure may succeed on retry.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Link { transient, .. } => *transient,
            Self::Timeout => true,
            _ => false,
        }
    }

    /// Returns `true` when the message or session lease is gone for good.
    #[must_use]
    pub fn is_lock_lost(&self) -> bool {
        matches!(
            self.condition(),
            Some(ErrorCondition::MessageLockLost | ErrorCondition::SessionLockLost)
        )
    }

    /// Returns `true` for cancellations.
    #[must_use]
    pub fn is_cancelled(&self) -> bool { matches!(self, Self::Cancelled) }

    /// Returns `true` for timeouts raised either locally or by the service.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self.condition(), Some(ErrorCondition::Timeout))
    }

    /// Returns `true` for illegal-state errors, including a closed receiver.
    #[must_use]
    pub fn is_illegal_state(&self) -> bool {
        matches!(self, Self::IllegalState(_) | Self::Closed)
    }
}

/// Canonical result alias used by `linkpump` public APIs.
pub type Result<T> = std::result::Result<T, ReceiveError>;
