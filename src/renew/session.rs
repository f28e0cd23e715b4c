use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{RenewErrorNotifier, RenewLockLoop, RenewTarget};
use crate::{
    error::Result,
    handler::ExceptionPhase,
    metrics::LeaseKind,
    session::MessageSession,
};

struct SessionLock {
    session: Arc<dyn MessageSession>,
    identifier: String,
}

#[async_trait]
impl RenewTarget for SessionLock {
    fn identifier(&self) -> &str { &self.identifier }

    fn kind(&self) -> LeaseKind { LeaseKind::Session }

    fn phase(&self) -> ExceptionPhase { ExceptionPhase::RenewSessionLock }

    fn should_continue(&self, _locked_until: DateTime<Utc>) -> bool { true }

    async fn renew(&self) -> Result<DateTime<Utc>> { self.session.renew_session_lock().await }
}

/// Keeps a session lock alive until cancelled or the lock is lost.
#[derive(Debug)]
pub struct SessionRenewLoop(RenewLockLoop);

impl SessionRenewLoop {
    /// Start renewing the lock on `session`. Must be called from within a
    /// Tokio runtime.
    pub fn start(session: Arc<dyn MessageSession>, notifier: RenewErrorNotifier) -> Self {
        let locked_until = session.locked_until();
        let target = SessionLock {
            identifier: format!("session:{}", session.session_id()),
            session,
        };
        Self(RenewLockLoop::start(target, locked_until, notifier))
    }

    /// Stop renewing. Idempotent.
    pub fn cancel(&self) { self.0.cancel(); }

    /// Returns `true` once the loop has been cancelled or has stopped.
    #[must_use]
    pub fn is_cancelled(&self) -> bool { self.0.is_cancelled() }
}
