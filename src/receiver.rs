//! Pull-style receivers consumed by the message pump.
//!
//! [`ProcessorReceiver`] adapts a [`LinkProcessor`] subscription into a
//! [`MessageReceiver`]. Locks obtained over the management node are tracked
//! in a [`LockContainer`] so their dispositions take the same route.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::sync::Mutex;

use crate::{
    error::{ReceiveError, Result},
    lock_container::LockContainer,
    message::{LockToken, Outcome, ReceiveMode, ReceivedMessage},
    processor::{LinkProcessor, ProcessorSubscription},
};

/// How often expired management locks are pruned.
pub const MANAGEMENT_LOCK_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// A receiver the message pump pulls from.
#[async_trait]
pub trait MessageReceiver: Send + Sync + 'static {
    /// Receive the next message, waiting at most `wait`. `Ok(None)` means no
    /// message arrived in time.
    async fn receive(&self, wait: Duration) -> Result<Option<ReceivedMessage>>;

    /// Settle a message as completed.
    async fn complete(&self, lock_token: LockToken) -> Result<()>;

    /// Release a message for redelivery.
    async fn abandon(&self, lock_token: LockToken) -> Result<()>;

    /// Extend the lock on a message, returning the new expiry.
    async fn renew_message_lock(&self, lock_token: LockToken) -> Result<DateTime<Utc>>;

    /// Settlement mode the receiver was opened with.
    fn receive_mode(&self) -> ReceiveMode;

    /// Adjust the number of messages requested ahead of `receive` calls.
    fn set_prefetch_count(&self, prefetch: u32);

    /// Stop receiving. Subsequent calls fail with [`ReceiveError::Closed`].
    async fn close(&self) -> Result<()>;
}

/// Request/response operations on an entity's management endpoint.
#[async_trait]
pub trait ManagementNode: Send + Sync + 'static {
    /// Extend the lock on a message, returning the new expiry.
    async fn renew_message_lock(&self, lock_token: LockToken) -> Result<DateTime<Utc>>;

    /// Settle a message whose lock is held through this node.
    async fn update_disposition(&self, lock_token: LockToken, outcome: Outcome) -> Result<()>;

    /// Fetch previously deferred messages by sequence number.
    async fn receive_deferred_messages(
        &self,
        receive_mode: ReceiveMode,
        sequence_numbers: &[i64],
    ) -> Result<Vec<ReceivedMessage>>;
}

struct Pending {
    subscription: ProcessorSubscription,
    /// Demand signalled to the processor and not yet satisfied.
    outstanding: u64,
}

/// [`MessageReceiver`] backed by a [`LinkProcessor`].
pub struct ProcessorReceiver {
    processor: LinkProcessor,
    management: Arc<dyn ManagementNode>,
    receive_mode: ReceiveMode,
    prefetch: AtomicU32,
    pending: Mutex<Pending>,
    management_locks: LockContainer<LockToken, ()>,
    closed: AtomicBool,
}

impl ProcessorReceiver {
    /// Subscribe to `processor` and route management operations to
    /// `management`.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Fails if the processor already has a subscriber or was cancelled.
    pub fn new(
        processor: LinkProcessor,
        management: Arc<dyn ManagementNode>,
        receive_mode: ReceiveMode,
    ) -> Result<Self> {
        let subscription = processor.subscribe()?;
        let entity_path = processor.entity_path().to_owned();
        let management_locks =
            LockContainer::new(MANAGEMENT_LOCK_SWEEP_INTERVAL, move |token: LockToken, ()| {
                tracing::debug!(%entity_path, %token, "management lock expired");
            })
            .map_err(|e| ReceiveError::IllegalState(e.to_string()))?;
        Ok(Self {
            prefetch: AtomicU32::new(processor.prefetch()),
            processor,
            management,
            receive_mode,
            pending: Mutex::new(Pending {
                subscription,
                outstanding: 0,
            }),
            management_locks,
            closed: AtomicBool::new(false),
        })
    }

    /// The processor feeding this receiver.
    #[must_use]
    pub fn processor(&self) -> &LinkProcessor { &self.processor }

    /// Set a message aside so it can later be fetched by sequence number.
    ///
    /// # Errors
    ///
    /// Propagates the settlement failure.
    pub async fn defer(&self, lock_token: LockToken) -> Result<()> {
        self.settle(lock_token, Outcome::Deferred).await
    }

    /// Move a message to the dead-letter sub-queue.
    ///
    /// # Errors
    ///
    /// Propagates the settlement failure.
    pub async fn dead_letter(
        &self,
        lock_token: LockToken,
        reason: Option<String>,
        description: Option<String>,
    ) -> Result<()> {
        self.settle(lock_token, Outcome::DeadLettered {
            reason,
            description,
        })
        .await
    }

    /// Fetch deferred messages through the management node, recording their
    /// locks so later dispositions use the same route.
    ///
    /// # Errors
    ///
    /// Fails with [`ReceiveError::Closed`] after [`close`](MessageReceiver::close)
    /// or with the management node's error.
    pub async fn receive_deferred_messages(
        &self,
        sequence_numbers: &[i64],
    ) -> Result<Vec<ReceivedMessage>> {
        self.ensure_open()?;
        let messages = self
            .management
            .receive_deferred_messages(self.receive_mode, sequence_numbers)
            .await?;
        if self.receive_mode == ReceiveMode::PeekLock {
            for message in &messages {
                self.management_locks
                    .add_or_update(message.lock_token, message.locked_until, ());
            }
        }
        Ok(messages)
    }

    /// Returns `true` if dispositions for `lock_token` go through the
    /// management node.
    #[must_use]
    pub fn is_management_lock(&self, lock_token: LockToken) -> bool {
        self.management_locks.contains_unexpired(&lock_token)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(ReceiveError::Closed)
        } else {
            Ok(())
        }
    }

    async fn settle(&self, lock_token: LockToken, outcome: Outcome) -> Result<()> {
        self.ensure_open()?;
        if self.receive_mode == ReceiveMode::ReceiveAndDelete {
            return Err(ReceiveError::IllegalState(
                "messages received in receive-and-delete mode cannot be settled".into(),
            ));
        }
        tracing::trace!(
            entity_path = self.processor.entity_path(),
            %lock_token,
            outcome = outcome.as_str(),
            "settling message"
        );
        if self.management_locks.contains_unexpired(&lock_token) {
            self.management
                .update_disposition(lock_token, outcome)
                .await?;
            self.management_locks.remove(&lock_token);
            Ok(())
        } else {
            self.processor.update_disposition(lock_token, outcome).await
        }
    }
}

#[async_trait]
impl MessageReceiver for ProcessorReceiver {
    async fn receive(&self, wait: Duration) -> Result<Option<ReceivedMessage>> {
        self.ensure_open()?;
        let receive = async {
            let mut pending = self.pending.lock().await;
            let target = u64::from(self.prefetch.load(Ordering::Relaxed).max(1));
            if pending.outstanding < target {
                pending.subscription.request(target - pending.outstanding);
                pending.outstanding = target;
            }
            match pending.subscription.next().await {
                Some(Ok(message)) => {
                    pending.outstanding = pending.outstanding.saturating_sub(1);
                    Ok(Some(message))
                }
                Some(Err(error)) => Err(error),
                None => Err(ReceiveError::Closed),
            }
        };
        // The wait covers queueing behind concurrent receives too.
        tokio::time::timeout(wait, receive)
            .await
            .unwrap_or(Ok(None))
    }

    async fn complete(&self, lock_token: LockToken) -> Result<()> {
        self.settle(lock_token, Outcome::Completed).await
    }

    async fn abandon(&self, lock_token: LockToken) -> Result<()> {
        self.settle(lock_token, Outcome::Abandoned).await
    }

    async fn renew_message_lock(&self, lock_token: LockToken) -> Result<DateTime<Utc>> {
        self.ensure_open()?;
        let locked_until = self.management.renew_message_lock(lock_token).await?;
        Ok(self
            .management_locks
            .add_or_update(lock_token, locked_until, ()))
    }

    fn receive_mode(&self) -> ReceiveMode { self.receive_mode }

    fn set_prefetch_count(&self, prefetch: u32) { self.prefetch.store(prefetch, Ordering::Relaxed); }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        tracing::debug!(
            entity_path = self.processor.entity_path(),
            "closing receiver"
        );
        self.processor.cancel();
        self.management_locks.close();
        Ok(())
    }
}

impl std::fmt::Debug for ProcessorReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorReceiver")
            .field("processor", &self.processor)
            .field("receive_mode", &self.receive_mode)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
