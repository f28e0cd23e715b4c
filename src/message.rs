//! Messages delivered by the receive pipeline and their dispositions.

use std::{collections::HashMap, fmt};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

/// Token identifying the lock held on a delivered message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockToken(Uuid);

impl LockToken {
    /// Wrap an existing token value.
    #[must_use]
    pub fn new(id: Uuid) -> Self { Self(id) }

    /// Generate a fresh random token.
    #[must_use]
    pub fn random() -> Self { Self(Uuid::new_v4()) }

    /// Return the inner UUID.
    #[must_use]
    pub fn as_uuid(&self) -> Uuid { self.0 }
}

impl From<Uuid> for LockToken {
    fn from(value: Uuid) -> Self { Self(value) }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { self.0.fmt(f) }
}

/// How messages are settled once received.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiveMode {
    /// Messages are locked and must be settled explicitly.
    #[default]
    PeekLock,
    /// Messages are removed from the entity on delivery.
    ReceiveAndDelete,
}

/// Settlement applied to a locked message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The message was processed and is removed from the entity.
    Completed,
    /// The lock is released so the message can be redelivered.
    Abandoned,
    /// The message is set aside and can be fetched by sequence number.
    Deferred,
    /// The message is moved to the dead-letter sub-queue.
    DeadLettered {
        /// Reason recorded with the dead-lettered message.
        reason: Option<String>,
        /// Longer description recorded with the dead-lettered message.
        description: Option<String>,
    },
}

impl Outcome {
    /// Returns the outcome name as a static string for logging.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Abandoned => "abandoned",
            Self::Deferred => "deferred",
            Self::DeadLettered { .. } => "dead-lettered",
        }
    }
}

/// A message delivered to the application.
///
/// Created when the transport decodes a frame; its lifecycle ends when it is
/// settled or when the lock renewal covering it is cancelled.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceivedMessage {
    /// Service-assigned sequence number, unique within the entity.
    pub sequence_number: i64,
    /// Token used to settle the message or renew its lock.
    pub lock_token: LockToken,
    /// Instant after which the lock is released by the service.
    pub locked_until: DateTime<Utc>,
    /// Number of times the message has been delivered.
    pub delivery_count: u32,
    /// Application-assigned message identifier.
    pub message_id: Option<String>,
    /// Session the message belongs to, for session-enabled entities.
    pub session_id: Option<String>,
    /// Application properties carried with the message.
    pub properties: HashMap<String, String>,
    /// Opaque payload.
    pub body: Bytes,
}

impl ReceivedMessage {
    /// Create a message with the given identity and lock expiry and an
    /// empty body.
    #[must_use]
    pub fn new(sequence_number: i64, lock_token: LockToken, locked_until: DateTime<Utc>) -> Self {
        Self {
            sequence_number,
            lock_token,
            locked_until,
            delivery_count: 0,
            message_id: None,
            session_id: None,
            properties: HashMap::new(),
            body: Bytes::new(),
        }
    }

    /// Attach a payload.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Attach a session identifier.
    #[must_use]
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Identifier used in logs: the message id when present, else the
    /// sequence number.
    #[must_use]
    pub fn identifier(&self) -> String {
        self.message_id
            .clone()
            .unwrap_or_else(|| format!("seq:{}", self.sequence_number))
    }
}
