//! Contracts for accepted sessions and the primitive that accepts them.
//!
//! A session groups messages sharing a session id. While the client holds the
//! session lock no other receiver sees those messages, so the lock is renewed
//! for as long as the session is being pumped.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    error::Result,
    message::{LockToken, ReceiveMode, ReceivedMessage},
};

/// A session accepted for exclusive receive.
#[async_trait]
pub trait MessageSession: Send + Sync + 'static {
    /// Identifier of the accepted session.
    fn session_id(&self) -> &str;

    /// Expiry of the session lock as last reported by the service.
    fn locked_until(&self) -> DateTime<Utc>;

    /// Receive the next message, waiting at most `wait`. `Ok(None)` means no
    /// message arrived in time.
    async fn receive(&self, wait: Duration) -> Result<Option<ReceivedMessage>>;

    /// Settle a message as completed.
    async fn complete(&self, lock_token: LockToken) -> Result<()>;

    /// Release a message back to the session for redelivery.
    async fn abandon(&self, lock_token: LockToken) -> Result<()>;

    /// Extend the session lock, returning the new expiry.
    async fn renew_session_lock(&self) -> Result<DateTime<Utc>>;

    /// Adjust the number of messages fetched ahead of demand.
    fn set_prefetch_count(&self, prefetch: u32);

    /// Release the session.
    async fn close(&self) -> Result<()>;
}

/// Accepts the next session with available messages.
#[async_trait]
pub trait SessionAcceptor: Send + Sync + 'static {
    /// Wait for a session to become available.
    ///
    /// Returns [`ReceiveError::Timeout`](crate::ReceiveError::Timeout) when no
    /// session became available within the service's wait period.
    async fn accept_next_session(&self) -> Result<Arc<dyn MessageSession>>;

    /// Prefetch applied to sessions accepted from now on.
    fn set_prefetch_count(&self, prefetch: u32);

    /// Settlement mode of accepted sessions.
    fn receive_mode(&self) -> ReceiveMode { ReceiveMode::PeekLock }
}
