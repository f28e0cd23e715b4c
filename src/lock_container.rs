//! Self-pruning map of lock expirations.
//!
//! Locks obtained over request/response (renewed or deferred messages) are
//! recorded here so dispositions can be routed the same way. A background
//! task sweeps the map on a fixed interval, removing expired entries and
//! handing each one to the expiry callback exactly once.

use std::{hash::Hash, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Errors raised when constructing a [`LockContainer`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LockContainerError {
    /// The sweep interval must be non-zero.
    #[error("sweep interval must be greater than zero")]
    InvalidInterval,
}

type Entries<K, V> = DashMap<K, (DateTime<Utc>, V)>;

/// Concurrent map from key to `(expiration, value)`.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use chrono::{TimeDelta, Utc};
/// use linkpump::lock_container::LockContainer;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let container = LockContainer::new(Duration::from_secs(4), |_key: String, _value: u64| {})
///     .expect("interval is non-zero");
/// let expiry = Utc::now() + TimeDelta::seconds(30);
/// assert_eq!(container.add_or_update("lock".into(), expiry, 1), expiry);
/// assert!(container.contains_unexpired(&"lock".to_string()));
/// container.close();
/// # }
/// ```
pub struct LockContainer<K, V>
where
    K: Eq + Hash,
{
    entries: Arc<Entries<K, V>>,
    shutdown: CancellationToken,
}

impl<K, V> LockContainer<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create a container swept every `interval`, calling `on_expired` for
    /// each entry that expires naturally.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`LockContainerError::InvalidInterval`] if `interval` is zero.
    pub fn new<F>(interval: Duration, on_expired: F) -> Result<Self, LockContainerError>
    where
        F: Fn(K, V) + Send + Sync + 'static,
    {
        if interval.is_zero() {
            return Err(LockContainerError::InvalidInterval);
        }
        let entries = Arc::new(DashMap::new());
        let shutdown = CancellationToken::new();
        tokio::spawn(sweep_loop(
            Arc::clone(&entries),
            interval,
            on_expired,
            shutdown.clone(),
        ));
        Ok(Self { entries, shutdown })
    }

    /// Insert or replace the entry for `key`, returning the stored
    /// expiration.
    pub fn add_or_update(&self, key: K, expiration: DateTime<Utc>, value: V) -> DateTime<Utc> {
        self.entries.insert(key, (expiration, value));
        expiration
    }

    /// Returns `true` if `key` is present and has not yet expired.
    #[must_use]
    pub fn contains_unexpired(&self, key: &K) -> bool {
        self.entries
            .get(key)
            .is_some_and(|entry| entry.0 > Utc::now())
    }

    /// The expiration and value stored for `key`.
    #[must_use]
    pub fn get(&self, key: &K) -> Option<(DateTime<Utc>, V)> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    /// Remove `key` without invoking the expiry callback.
    pub fn remove(&self, key: &K) -> Option<V> { self.entries.remove(key).map(|(_, (_, v))| v) }

    /// Number of entries, expired or not.
    #[must_use]
    pub fn len(&self) -> usize { self.entries.len() }

    /// Returns `true` if the container holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    /// Stop the sweep and drop all entries. Idempotent.
    pub fn close(&self) {
        if !self.shutdown.is_cancelled() {
            self.shutdown.cancel();
            self.entries.clear();
        }
    }
}

impl<K, V> Drop for LockContainer<K, V>
where
    K: Eq + Hash,
{
    fn drop(&mut self) { self.shutdown.cancel(); }
}

impl<K, V> std::fmt::Debug for LockContainer<K, V>
where
    K: Eq + Hash,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockContainer")
            .field("len", &self.entries.len())
            .field("closed", &self.shutdown.is_cancelled())
            .finish()
    }
}

async fn sweep_loop<K, V, F>(
    entries: Arc<Entries<K, V>>,
    interval: Duration,
    on_expired: F,
    shutdown: CancellationToken,
) where
    K: Eq + Hash + Clone,
    F: Fn(K, V),
{
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;

            () = shutdown.cancelled() => break,
            _ = ticker.tick() => sweep(&entries, &on_expired),
        }
    }
}

/// Remove every entry expired as of now and report it.
fn sweep<K, V, F>(entries: &Entries<K, V>, on_expired: &F)
where
    K: Eq + Hash + Clone,
    F: Fn(K, V),
{
    let now = Utc::now();
    let expired: Vec<K> = entries
        .iter()
        .filter(|entry| entry.value().0 <= now)
        .map(|entry| entry.key().clone())
        .collect();
    if expired.is_empty() {
        return;
    }
    tracing::debug!(expired = expired.len(), "sweeping expired locks");
    for key in expired {
        // An entry refreshed since the scan keeps its place.
        if let Some((key, (_, value))) = entries.remove_if(&key, |_, (expiration, _)| *expiration <= now) {
            on_expired(key, value);
        }
    }
}
