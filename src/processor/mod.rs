//! Link processor presenting one continuous message stream over a changing
//! sequence of links.
//!
//! The processor pulls links from an upstream [`LinkStream`] one at a time.
//! A single actor task owns the active link, the outstanding demand and the
//! retry counter; it polls the shutdown token, subscriber commands, the link
//! source, the retry timer and the active link's streams using a `biased`
//! `tokio::select!` loop. Graceful link closes are followed by a fresh link;
//! link errors are classified by the [`RetryPolicy`] and either retried after
//! a delay or delivered downstream as the single terminal error.

mod actor;
pub(crate) mod demand;
mod event;
mod subscription;

use std::sync::{
    Arc,
    Mutex,
    OnceLock,
    PoisonError,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use serde::Deserialize;
pub use subscription::ProcessorSubscription;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use self::actor::ProcessorActor;
pub use self::demand::UNBOUNDED;
use crate::{
    error::{ReceiveError, Result},
    link::{LinkStream, ReceiveLink},
    message::{LockToken, Outcome},
    retry::RetryPolicy,
};

/// Configuration for a [`LinkProcessor`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ProcessorOptions {
    /// Credits kept on the link while downstream demand is unbounded.
    pub prefetch: u32,
}

impl Default for ProcessorOptions {
    fn default() -> Self { Self { prefetch: 1 } }
}

/// State shared between the processor handle, its actor and the credit
/// listener installed on each link.
pub(crate) struct Shared {
    pub(crate) entity_path: String,
    pub(crate) prefetch: u32,
    /// Mirror of the actor's outstanding demand. Written only by the actor.
    pub(crate) requested: AtomicU64,
    pub(crate) active_link: Mutex<Option<Arc<dyn ReceiveLink>>>,
    pub(crate) terminated: AtomicBool,
    pub(crate) error: OnceLock<ReceiveError>,
    pub(crate) shutdown: CancellationToken,
}

impl Shared {
    pub(crate) fn set_active_link(&self, link: Option<Arc<dyn ReceiveLink>>) {
        *self
            .active_link
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = link;
    }

    pub(crate) fn active_link(&self) -> Option<Arc<dyn ReceiveLink>> {
        self.active_link
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

struct Startup {
    source: LinkStream,
    retry_policy: Arc<dyn RetryPolicy>,
}

/// Demand-driven message stream backed by a sequence of links.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
///
/// use futures::StreamExt;
/// use linkpump::{
///     link::LinkStream,
///     processor::{LinkProcessor, ProcessorOptions},
///     retry::ExponentialRetryPolicy,
/// };
///
/// # async fn demo(links: LinkStream) -> linkpump::Result<()> {
/// let processor = LinkProcessor::new(
///     "orders",
///     links,
///     Arc::new(ExponentialRetryPolicy::default()),
///     ProcessorOptions { prefetch: 10 },
/// );
/// let mut subscription = processor.subscribe()?;
/// subscription.request(1);
/// if let Some(message) = subscription.next().await {
///     let message = message?;
///     processor
///         .update_disposition(message.lock_token, linkpump::message::Outcome::Completed)
///         .await?;
/// }
/// # Ok(())
/// # }
/// ```
pub struct LinkProcessor {
    shared: Arc<Shared>,
    startup: Mutex<Option<Startup>>,
}

impl LinkProcessor {
    /// Create a processor pulling links from `source`.
    ///
    /// Nothing is pulled until the subscriber first requests messages.
    #[must_use]
    pub fn new(
        entity_path: impl Into<String>,
        source: LinkStream,
        retry_policy: Arc<dyn RetryPolicy>,
        options: ProcessorOptions,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                entity_path: entity_path.into(),
                prefetch: options.prefetch,
                requested: AtomicU64::new(0),
                active_link: Mutex::new(None),
                terminated: AtomicBool::new(false),
                error: OnceLock::new(),
                shutdown: CancellationToken::new(),
            }),
            startup: Mutex::new(Some(Startup {
                source,
                retry_policy,
            })),
        }
    }

    /// Attach the single downstream subscriber and start the actor.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`ReceiveError::AlreadySubscribed`] if a subscriber already
    /// exists and [`ReceiveError::Closed`] if the processor was cancelled
    /// before anyone subscribed.
    pub fn subscribe(&self) -> Result<ProcessorSubscription> {
        let startup = self
            .startup
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(Startup {
            source,
            retry_policy,
        }) = startup
        else {
            tracing::warn!(
                entity_path = %self.shared.entity_path,
                "rejecting second subscriber"
            );
            return Err(ReceiveError::AlreadySubscribed);
        };
        if self.shared.shutdown.is_cancelled() {
            return Err(ReceiveError::Closed);
        }
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let actor = ProcessorActor::new(
            Arc::clone(&self.shared),
            source,
            retry_policy,
            command_rx,
            signal_tx,
        );
        tokio::spawn(actor.run());
        Ok(ProcessorSubscription::new(
            command_tx,
            signal_rx,
            self.shared.shutdown.clone(),
        ))
    }

    /// Settle a message through the active link. Credit is unaffected.
    ///
    /// # Errors
    ///
    /// Returns [`ReceiveError::LinkUnavailable`] when no link is attached,
    /// or the link's own error if the settlement fails.
    pub async fn update_disposition(&self, lock_token: LockToken, outcome: Outcome) -> Result<()> {
        let link = self
            .shared
            .active_link()
            .ok_or(ReceiveError::LinkUnavailable)?;
        link.update_disposition(lock_token, outcome).await
    }

    /// Cancel the processor: the active link is closed and no further links
    /// are requested. Idempotent.
    pub fn cancel(&self) { self.shared.shutdown.cancel(); }

    /// Returns `true` once the processor has stopped for any reason.
    #[must_use]
    pub fn is_terminated(&self) -> bool { self.shared.terminated.load(Ordering::Acquire) }

    /// Returns `true` if the processor stopped with an error.
    #[must_use]
    pub fn has_error(&self) -> bool { self.shared.error.get().is_some() }

    /// The terminal error, once one has been delivered.
    #[must_use]
    pub fn error(&self) -> Option<ReceiveError> { self.shared.error.get().cloned() }

    /// Credits held by the active link, or zero when none is attached.
    #[must_use]
    pub fn credits(&self) -> u32 { self.shared.active_link().map_or(0, |link| link.credits()) }

    /// Credits kept on the link while demand is unbounded.
    #[must_use]
    pub fn prefetch(&self) -> u32 { self.shared.prefetch }

    /// Path of the entity this processor receives from.
    #[must_use]
    pub fn entity_path(&self) -> &str { &self.shared.entity_path }
}

impl std::fmt::Debug for LinkProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkProcessor")
            .field("entity_path", &self.shared.entity_path)
            .field("prefetch", &self.shared.prefetch)
            .field("terminated", &self.is_terminated())
            .finish_non_exhaustive()
    }
}
