use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{RenewErrorNotifier, RenewLockLoop, RenewTarget};
use crate::{
    error::Result,
    handler::ExceptionPhase,
    message::{LockToken, ReceivedMessage},
    metrics::LeaseKind,
    receiver::MessageReceiver,
};

struct MessageLock {
    receiver: Arc<dyn MessageReceiver>,
    lock_token: LockToken,
    identifier: String,
    stop_renewal_at: DateTime<Utc>,
}

#[async_trait]
impl RenewTarget for MessageLock {
    fn identifier(&self) -> &str { &self.identifier }

    fn kind(&self) -> LeaseKind { LeaseKind::Message }

    fn phase(&self) -> ExceptionPhase { ExceptionPhase::RenewMessageLock }

    fn should_continue(&self, locked_until: DateTime<Utc>) -> bool {
        locked_until < self.stop_renewal_at
    }

    async fn renew(&self) -> Result<DateTime<Utc>> {
        self.receiver.renew_message_lock(self.lock_token).await
    }
}

/// Keeps a message lock alive until `stop_renewal_at` or cancellation.
#[derive(Debug)]
pub struct MessageRenewLoop(RenewLockLoop);

impl MessageRenewLoop {
    /// Start renewing the lock on `message` through `receiver`.
    ///
    /// No renewal is scheduled once the lock extends to or past
    /// `stop_renewal_at`. Must be called from within a Tokio runtime.
    pub fn start(
        receiver: Arc<dyn MessageReceiver>,
        message: &ReceivedMessage,
        stop_renewal_at: DateTime<Utc>,
        notifier: RenewErrorNotifier,
    ) -> Self {
        let target = MessageLock {
            receiver,
            lock_token: message.lock_token,
            identifier: message.identifier(),
            stop_renewal_at,
        };
        Self(RenewLockLoop::start(target, message.locked_until, notifier))
    }

    /// Stop renewing. Idempotent.
    pub fn cancel(&self) { self.0.cancel(); }

    /// Returns `true` once the loop has been cancelled or has stopped.
    #[must_use]
    pub fn is_cancelled(&self) -> bool { self.0.is_cancelled() }
}
