//! A scriptable [`MessageReceiver`].

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        Mutex,
        PoisonError,
        atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use linkpump::{
    error::{ReceiveError, Result},
    message::{LockToken, ReceiveMode, ReceivedMessage},
    receiver::MessageReceiver,
};

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Hands out queued messages and records how the pump settled them.
pub struct ScriptedReceiver {
    receive_mode: ReceiveMode,
    script: Mutex<VecDeque<Result<Option<ReceivedMessage>>>>,
    completed: Mutex<Vec<LockToken>>,
    abandoned: Mutex<Vec<LockToken>>,
    renewed: Mutex<Vec<LockToken>>,
    renew_error: Mutex<Option<ReceiveError>>,
    complete_error: Mutex<Option<ReceiveError>>,
    lock_duration: TimeDelta,
    closed: AtomicBool,
    closes: AtomicUsize,
    prefetch: AtomicU32,
}

impl ScriptedReceiver {
    /// Create a receiver in `receive_mode` whose renewals extend locks by
    /// thirty seconds.
    #[must_use]
    pub fn new(receive_mode: ReceiveMode) -> Arc<Self> {
        Self::with_lock_duration(receive_mode, TimeDelta::seconds(30))
    }

    /// Create a receiver whose renewals extend locks by `lock_duration`.
    #[must_use]
    pub fn with_lock_duration(receive_mode: ReceiveMode, lock_duration: TimeDelta) -> Arc<Self> {
        Arc::new(Self {
            receive_mode,
            script: Mutex::new(VecDeque::new()),
            completed: Mutex::new(Vec::new()),
            abandoned: Mutex::new(Vec::new()),
            renewed: Mutex::new(Vec::new()),
            renew_error: Mutex::new(None),
            complete_error: Mutex::new(None),
            lock_duration,
            closed: AtomicBool::new(false),
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

    /// Make the next `complete` fail with `error`.
    pub fn fail_next_complete(&self, error: ReceiveError) { *lock(&self.complete_error) = Some(error); }

    /// Tokens of completed messages.
    #[must_use]
    pub fn completed(&self) -> Vec<LockToken> { lock(&self.completed).clone() }

    /// Tokens of abandoned messages.
    #[must_use]
    pub fn abandoned(&self) -> Vec<LockToken> { lock(&self.abandoned).clone() }

    /// Tokens passed to every renewal attempt, in order.
    #[must_use]
    pub fn renewed(&self) -> Vec<LockToken> { lock(&self.renewed).clone() }

    /// Number of times `close` was called.
    #[must_use]
    pub fn close_count(&self) -> usize { self.closes.load(Ordering::SeqCst) }

    /// Last prefetch applied.
    #[must_use]
    pub fn prefetch(&self) -> u32 { self.prefetch.load(Ordering::SeqCst) }
}

#[async_trait]
impl MessageReceiver for ScriptedReceiver {
    async fn receive(&self, wait: Duration) -> Result<Option<ReceivedMessage>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ReceiveError::Closed);
        }
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
        if let Some(error) = lock(&self.complete_error).take() {
            return Err(error);
        }
        lock(&self.completed).push(lock_token);
        Ok(())
    }

    async fn abandon(&self, lock_token: LockToken) -> Result<()> {
        lock(&self.abandoned).push(lock_token);
        Ok(())
    }

    async fn renew_message_lock(&self, lock_token: LockToken) -> Result<DateTime<Utc>> {
        lock(&self.renewed).push(lock_token);
        if let Some(error) = lock(&self.renew_error).clone() {
            return Err(error);
        }
        Ok(Utc::now() + self.lock_duration)
    }

    fn receive_mode(&self) -> ReceiveMode { self.receive_mode }

    fn set_prefetch_count(&self, prefetch: u32) { self.prefetch.store(prefetch, Ordering::SeqCst); }

    async fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
