//! Scriptable receive links and a link source to feed them from.

use std::sync::{
    Arc,
    Mutex,
    PoisonError,
    atomic::{AtomicU32, AtomicUsize, Ordering},
};

use async_trait::async_trait;
use futures::{StreamExt, stream};
use linkpump::{
    error::{ReceiveError, Result},
    link::{
        CreditSupplier,
        EndpointState,
        EndpointStateStream,
        LinkStream,
        MessageStream,
        ReceiveLink,
    },
    message::{LockToken, Outcome, ReceivedMessage},
};
use tokio::sync::mpsc;

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn channel_stream<T: Send + 'static>(
    rx: Option<mpsc::UnboundedReceiver<T>>,
) -> futures::stream::BoxStream<'static, T> {
    match rx {
        Some(rx) => stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed(),
        None => stream::empty().boxed(),
    }
}

/// A link whose traffic is pushed from the test.
pub struct ScriptedLink {
    name: String,
    credits: AtomicU32,
    credit_calls: Mutex<Vec<u32>>,
    closes: AtomicUsize,
    dispositions: Mutex<Vec<(LockToken, Outcome)>>,
    listener: Mutex<Option<CreditSupplier>>,
    states_tx: mpsc::UnboundedSender<Result<EndpointState>>,
    states_rx: Mutex<Option<mpsc::UnboundedReceiver<Result<EndpointState>>>>,
    messages_tx: mpsc::UnboundedSender<ReceivedMessage>,
    messages_rx: Mutex<Option<mpsc::UnboundedReceiver<ReceivedMessage>>>,
    add_credit_error: Mutex<Option<ReceiveError>>,
}

impl ScriptedLink {
    /// Create a link named `name` holding no credit.
    #[must_use]
    pub fn new(name: &str) -> Arc<Self> {
        let (states_tx, states_rx) = mpsc::unbounded_channel();
        let (messages_tx, messages_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            name: name.to_owned(),
            credits: AtomicU32::new(0),
            credit_calls: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
            dispositions: Mutex::new(Vec::new()),
            listener: Mutex::new(None),
            states_tx,
            states_rx: Mutex::new(Some(states_rx)),
            messages_tx,
            messages_rx: Mutex::new(Some(messages_rx)),
            add_credit_error: Mutex::new(None),
        })
    }

    /// Create a link that already holds `credits`.
    #[must_use]
    pub fn with_credits(name: &str, credits: u32) -> Arc<Self> {
        let link = Self::new(name);
        link.credits.store(credits, Ordering::SeqCst);
        link
    }

    /// Deliver `message`, consuming one credit.
    pub fn emit(&self, message: ReceivedMessage) {
        let _ = self
            .credits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| {
                Some(c.saturating_sub(1))
            });
        let _ = self.messages_tx.send(message);
    }

    /// Report an endpoint state change.
    pub fn set_state(&self, state: EndpointState) { let _ = self.states_tx.send(Ok(state)); }

    /// Detach gracefully.
    pub fn close_gracefully(&self) { self.set_state(EndpointState::Closed); }

    /// Detach with `error`.
    pub fn fail(&self, error: ReceiveError) { let _ = self.states_tx.send(Err(error)); }

    /// Make the next `add_credits` call fail with `error`.
    pub fn fail_next_add_credits(&self, error: ReceiveError) {
        *lock(&self.add_credit_error) = Some(error);
    }

    /// Arguments of every `add_credits` call, in order.
    #[must_use]
    pub fn credit_calls(&self) -> Vec<u32> { lock(&self.credit_calls).clone() }

    /// Number of times `close` was called.
    #[must_use]
    pub fn close_count(&self) -> usize { self.closes.load(Ordering::SeqCst) }

    /// Dispositions applied through this link.
    #[must_use]
    pub fn dispositions(&self) -> Vec<(LockToken, Outcome)> { lock(&self.dispositions).clone() }

    /// Ask the installed empty-credit listener how many credits to add.
    #[must_use]
    pub fn query_credit_listener(&self) -> Option<u32> {
        lock(&self.listener).as_ref().map(|listener| listener())
    }
}

#[async_trait]
impl ReceiveLink for ScriptedLink {
    fn link_name(&self) -> &str { &self.name }

    fn entity_path(&self) -> &str { "scripted" }

    fn endpoint_states(&self) -> EndpointStateStream { channel_stream(lock(&self.states_rx).take()) }

    fn receive(&self) -> MessageStream { channel_stream(lock(&self.messages_rx).take()) }

    async fn add_credits(&self, credits: u32) -> Result<()> {
        if let Some(error) = lock(&self.add_credit_error).take() {
            return Err(error);
        }
        lock(&self.credit_calls).push(credits);
        self.credits.fetch_add(credits, Ordering::SeqCst);
        Ok(())
    }

    fn credits(&self) -> u32 { self.credits.load(Ordering::SeqCst) }

    fn set_empty_credit_listener(&self, listener: CreditSupplier) {
        *lock(&self.listener) = Some(listener);
    }

    async fn update_disposition(&self, lock_token: LockToken, outcome: Outcome) -> Result<()> {
        lock(&self.dispositions).push((lock_token, outcome));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

type LinkItem = std::result::Result<Arc<dyn ReceiveLink>, ReceiveError>;

/// Producer side of a [`LinkStream`] built with [`link_source`].
#[derive(Clone)]
pub struct LinkFeeder {
    tx: Arc<Mutex<Option<mpsc::UnboundedSender<LinkItem>>>>,
    pulls: Arc<AtomicUsize>,
}

impl LinkFeeder {
    /// Queue a link for the next pull.
    pub fn push(&self, link: Arc<ScriptedLink>) {
        let link: Arc<dyn ReceiveLink> = link;
        self.send(Ok(link));
    }

    /// Queue a link construction failure.
    pub fn push_error(&self, error: ReceiveError) { self.send(Err(error)); }

    /// Complete the source once queued items are drained.
    pub fn finish(&self) { lock(&self.tx).take(); }

    /// Number of links the consumer has asked for.
    #[must_use]
    pub fn pulls(&self) -> usize { self.pulls.load(Ordering::SeqCst) }

    fn send(&self, item: LinkItem) {
        if let Some(tx) = lock(&self.tx).as_ref() {
            let _ = tx.send(item);
        }
    }
}

/// A link source fed from the test through the returned [`LinkFeeder`].
#[must_use]
pub fn link_source() -> (LinkStream, LinkFeeder) {
    let (tx, rx) = mpsc::unbounded_channel::<LinkItem>();
    let pulls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&pulls);
    let links = stream::unfold(rx, move |mut rx| {
        counter.fetch_add(1, Ordering::SeqCst);
        async move { rx.recv().await.map(|item| (item, rx)) }
    })
    .boxed();
    (
        links,
        LinkFeeder {
            tx: Arc::new(Mutex::new(Some(tx))),
            pulls,
        },
    )
}
