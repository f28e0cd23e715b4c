//! Scriptable sessions and a session acceptor.

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        Mutex,
        PoisonError,
        atomic::{AtomicU32, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use linkpump::{
    error::{ReceiveError, Result},
    message::{LockToken, ReceivedMessage},
    session::{MessageSession, SessionAcceptor},
};

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A session that hands out queued messages, then waits out each receive.
pub struct ScriptedSession {
    id: String,
    lock_duration: TimeDelta,
    locked_until: Mutex<DateTime<Utc>>,
    script: Mutex<VecDeque<Result<Option<ReceivedMessage>>>>,
    completed: Mutex<Vec<LockToken>>,
    abandoned: Mutex<Vec<LockToken>>,
    renewals: AtomicUsize,
    renew_error: Mutex<Option<ReceiveError>>,
    close_error: Mutex<Option<ReceiveError>>,
    closes: AtomicUsize,
    prefetch: AtomicU32,
}

impl ScriptedSession {
    /// Create session `id` whose lock lasts thirty seconds per renewal.
    #[must_use]
    pub fn new(id: &str) -> Arc<Self> { Self::with_lock_duration(id, TimeDelta::seconds(30)) }

    /// Create session `id` whose lock lasts `lock_duration` per renewal.
    #[must_use]
    pub fn with_lock_duration(id: &str, lock_duration: TimeDelta) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_owned(),
            lock_duration,
            locked_until: Mutex::new(Utc::now() + lock_duration),
            script: Mutex::new(VecDeque::new()),
            completed: Mutex::new(Vec::new()),
            abandoned: Mutex::new(Vec::new()),
            renewals: AtomicUsize::new(0),
            renew_error: Mutex::new(None),
            close_error: Mutex::new(None),
            closes: AtomicUsize::new(0),
            prefetch: AtomicU32::new(0),
        })
    }

    /// Queue a message for a future receive.
    pub fn push_message(&self, message: ReceivedMessage) { lock(&self.script).push_back(Ok(Some(message))); }

    /// Queue a receive failure.
    pub fn push_error(&self, error: ReceiveError) { lock(&self.script).push_back(Err(error)); }

    /// Make every later renewal fail with `error`.
    pub fn fail_renewals_with(&self, error: ReceiveError) { *lock(&self.renew_error) = Some(error); }

    /// Make `close` fail with `error`.
    pub fn fail_close_with(&self, error: ReceiveError) { *lock(&self.close_error) = Some(error); }

    /// Tokens of completed messages.
    #[must_use]
    pub fn completed(&self) -> Vec<LockToken> { lock(&self.completed).clone() }

    /// Tokens of abandoned messages.
    #[must_use]
    pub fn abandoned(&self) -> Vec<LockToken> { lock(&self.abandoned).clone() }

    /// Number of renewal attempts.
    #[must_use]
    pub fn renewals(&self) -> usize { self.renewals.load(Ordering::SeqCst) }

    /// Number of times `close` was called.
    #[must_use]
    pub fn close_count(&self) -> usize { self.closes.load(Ordering::SeqCst) }

    /// Last prefetch applied.
    #[must_use]
    pub fn prefetch(&self) -> u32 { self.prefetch.load(Ordering::SeqCst) }
}

#[async_trait]
impl MessageSession for ScriptedSession {
    fn session_id(&self) -> &str { &self.id }

    fn locked_until(&self) -> DateTime<Utc> { *lock(&self.locked_until) }

    async fn receive(&self, wait: Duration) -> Result<Option<ReceivedMessage>> {
        let next = lock(&self.script).pop_front();
        match next {
            Some(item) => item,
            None => {
                tokio::time::sleep(wait).await;
                Ok(None)
            }
        }
    }

    async fn complete(&self, lock_token: LockToken) -> Result<()> {
        lock(&self.completed).push(lock_token);
        Ok(())
    }

    async fn abandon(&self, lock_token: LockToken) -> Result<()> {
        lock(&self.abandoned).push(lock_token);
        Ok(())
    }

    async fn renew_session_lock(&self) -> Result<DateTime<Utc>> {
        self.renewals.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = lock(&self.renew_error).clone() {
            return Err(error);
        }
        let renewed = Utc::now() + self.lock_duration;
        *lock(&self.locked_until) = renewed;
        Ok(renewed)
    }

    fn set_prefetch_count(&self, prefetch: u32) { self.prefetch.store(prefetch, Ordering::SeqCst); }

    async fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        match lock(&self.close_error).take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// Hands out queued sessions; an empty queue times out after `accept_wait`.
pub struct ScriptedAcceptor {
    queue: Mutex<VecDeque<Result<Arc<dyn MessageSession>>>>,
    accept_wait: Duration,
    accepts: AtomicUsize,
    prefetch: AtomicU32,
}

impl ScriptedAcceptor {
    /// Create an acceptor whose empty-queue accepts time out after one
    /// second.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
            accept_wait: Duration::from_secs(1),
            accepts: AtomicUsize::new(0),
            prefetch: AtomicU32::new(0),
        })
    }

    /// Queue a session for a future accept.
    pub fn push_session(&self, session: Arc<ScriptedSession>) {
        let session: Arc<dyn MessageSession> = session;
        lock(&self.queue).push_back(Ok(session));
    }

    /// Queue an accept failure.
    pub fn push_error(&self, error: ReceiveError) { lock(&self.queue).push_back(Err(error)); }

    /// Number of accept attempts.
    #[must_use]
    pub fn accepts(&self) -> usize { self.accepts.load(Ordering::SeqCst) }

    /// Last prefetch applied.
    #[must_use]
    pub fn prefetch(&self) -> u32 { self.prefetch.load(Ordering::SeqCst) }
}

#[async_trait]
impl SessionAcceptor for ScriptedAcceptor {
    async fn accept_next_session(&self) -> Result<Arc<dyn MessageSession>> {
        self.accepts.fetch_add(1, Ordering::SeqCst);
        let next = lock(&self.queue).pop_front();
        match next {
            Some(item) => item,
            None => {
                tokio::time::sleep(self.accept_wait).await;
                Err(ReceiveError::Timeout)
            }
        }
    }

    fn set_prefetch_count(&self, prefetch: u32) { self.prefetch.store(prefetch, Ordering::SeqCst); }
}
