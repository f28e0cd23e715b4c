//! Actor owning the active link and outstanding demand of a
//! [`LinkProcessor`](super::LinkProcessor).

use std::{
    future,
    mem,
    ops::ControlFlow,
    pin::Pin,
    sync::{Arc, atomic::Ordering},
};

use futures::{Stream, StreamExt};
use tokio::{
    sync::mpsc,
    time::{Sleep, sleep},
};

use super::{
    Shared,
    demand::{DemandLedger, credits_to_add, effective_demand},
    event::{Command, Event, Signal},
};
use crate::{
    error::ReceiveError,
    link::{EndpointState, EndpointStateStream, LinkStream, MessageStream, ReceiveLink},
    message::ReceivedMessage,
    metrics,
    retry::RetryPolicy,
};

/// The link currently feeding the processor.
struct ActiveLink {
    link: Arc<dyn ReceiveLink>,
    states: EndpointStateStream,
    /// `None` once the link's message stream has ended.
    messages: Option<MessageStream>,
}

/// Where the actor is in its link lifecycle.
enum LinkSlot {
    /// No demand has been signalled yet.
    Idle,
    /// Waiting for upstream to yield the next link.
    Requesting,
    /// Waiting out a retry delay before requesting a replacement.
    Backoff(Pin<Box<Sleep>>),
    Active(ActiveLink),
}

pub(super) struct ProcessorActor {
    shared: Arc<Shared>,
    /// `None` once upstream has completed.
    source: Option<LinkStream>,
    retry_policy: Arc<dyn RetryPolicy>,
    commands: mpsc::UnboundedReceiver<Command>,
    downstream: mpsc::UnboundedSender<Signal>,
    slot: LinkSlot,
    ledger: DemandLedger<ReceivedMessage>,
    retry_attempt: u32,
}

impl ProcessorActor {
    pub(super) fn new(
        shared: Arc<Shared>,
        source: LinkStream,
        retry_policy: Arc<dyn RetryPolicy>,
        commands: mpsc::UnboundedReceiver<Command>,
        downstream: mpsc::UnboundedSender<Signal>,
    ) -> Self {
        Self {
            shared,
            source: Some(source),
            retry_policy,
            commands,
            downstream,
            slot: LinkSlot::Idle,
            ledger: DemandLedger::default(),
            retry_attempt: 0,
        }
    }

    /// Drive the processor until it completes, fails or is cancelled.
    pub(super) async fn run(mut self) {
        loop {
            let event = self.next_event().await;
            if self.dispatch(event).await.is_break() {
                break;
            }
        }
        self.finish();
    }

    /// Await the next event in priority order.
    ///
    /// Shutdown wins over subscriber commands, which win over link traffic.
    /// Messages are polled before endpoint states so a link's final
    /// deliveries are forwarded before its close is observed.
    #[expect(
        clippy::integer_division_remainder_used,
        reason = "tokio::select! expands to modulus operations internally"
    )]
    async fn next_event(&mut self) -> Event {
        let (source, backoff, messages, states) = match &mut self.slot {
            LinkSlot::Idle => (None, None, None, None),
            LinkSlot::Requesting => (self.source.as_mut(), None, None, None),
            LinkSlot::Backoff(delay) => (None, Some(delay), None, None),
            LinkSlot::Active(active) => (
                None,
                None,
                active.messages.as_mut(),
                Some(&mut active.states),
            ),
        };

        tokio::select! {
            biased;

            () = self.shared.shutdown.cancelled() => Event::Shutdown,
            cmd = self.commands.recv() => Event::Command(cmd),
            link = poll_stream(source) => Event::Link(link),
            () = wait_backoff(backoff) => Event::RetryElapsed,
            msg = poll_stream(messages) => Event::Message(msg),
            state = poll_stream(states) => Event::Endpoint(state),
        }
    }

    async fn dispatch(&mut self, event: Event) -> ControlFlow<()> {
        match event {
            Event::Shutdown | Event::Command(None) => {
                self.close_active().await;
                ControlFlow::Break(())
            }
            Event::Command(Some(Command::Request(n))) => self.on_request(n).await,
            Event::Link(Some(Ok(link))) => self.attach(link).await,
            Event::Link(Some(Err(error))) => self.on_failure(error),
            Event::Link(None) => {
                tracing::debug!(
                    entity_path = %self.shared.entity_path,
                    "link source completed"
                );
                self.source = None;
                ControlFlow::Break(())
            }
            Event::RetryElapsed => {
                self.slot = LinkSlot::Requesting;
                ControlFlow::Continue(())
            }
            Event::Message(Some(message)) => {
                self.retry_attempt = 0;
                self.ledger.offer(message);
                self.drain()
            }
            Event::Message(None) => {
                if let LinkSlot::Active(active) = &mut self.slot {
                    active.messages = None;
                }
                ControlFlow::Continue(())
            }
            Event::Endpoint(Some(Ok(EndpointState::Closed)) | None) => self.on_link_closed(),
            Event::Endpoint(Some(Ok(state))) => {
                tracing::trace!(
                    entity_path = %self.shared.entity_path,
                    ?state,
                    "link state changed"
                );
                ControlFlow::Continue(())
            }
            Event::Endpoint(Some(Err(error))) => self.on_failure(error),
        }
    }

    async fn on_request(&mut self, n: u64) -> ControlFlow<()> {
        self.ledger.request(n);
        self.drain()?;
        match self.slot {
            LinkSlot::Idle => {
                self.slot = LinkSlot::Requesting;
                ControlFlow::Continue(())
            }
            LinkSlot::Active(_) => self.top_up().await,
            LinkSlot::Requesting | LinkSlot::Backoff(_) => ControlFlow::Continue(()),
        }
    }

    async fn attach(&mut self, link: Arc<dyn ReceiveLink>) -> ControlFlow<()> {
        let weak = Arc::downgrade(&self.shared);
        link.set_empty_credit_listener(Arc::new(move || {
            weak.upgrade().map_or(0, |shared| {
                if shared.terminated.load(Ordering::Acquire) {
                    0
                } else {
                    effective_demand(shared.requested.load(Ordering::Acquire), shared.prefetch)
                }
            })
        }));
        let states = link.endpoint_states();
        let messages = link.receive();
        self.shared.set_active_link(Some(Arc::clone(&link)));
        metrics::inc_links();
        tracing::info!(
            entity_path = %self.shared.entity_path,
            link_name = link.link_name(),
            session_id = ?link.session_id(),
            "attached receive link"
        );
        self.slot = LinkSlot::Active(ActiveLink {
            link,
            states,
            messages: Some(messages),
        });
        self.top_up().await
    }

    /// Add enough credit for the active link to cover current demand.
    async fn top_up(&mut self) -> ControlFlow<()> {
        let LinkSlot::Active(active) = &self.slot else {
            return ControlFlow::Continue(());
        };
        let credits = credits_to_add(
            self.ledger.requested(),
            self.shared.prefetch,
            active.link.credits(),
        );
        if credits == 0 {
            return ControlFlow::Continue(());
        }
        let link = Arc::clone(&active.link);
        tracing::debug!(
            entity_path = %self.shared.entity_path,
            link_name = link.link_name(),
            credits,
            "adding credits"
        );
        match link.add_credits(credits).await {
            Ok(()) => ControlFlow::Continue(()),
            Err(error) => self.on_failure(error),
        }
    }

    /// Forward held messages while demand allows.
    fn drain(&mut self) -> ControlFlow<()> {
        while let Some(message) = self.ledger.next_deliverable() {
            if self.downstream.send(Signal::Message(message)).is_err() {
                return ControlFlow::Break(());
            }
            metrics::inc_messages();
        }
        self.shared
            .requested
            .store(self.ledger.requested(), Ordering::Release);
        ControlFlow::Continue(())
    }

    fn on_link_closed(&mut self) -> ControlFlow<()> {
        if let Some(link) = self.detach() {
            tracing::info!(
                entity_path = %self.shared.entity_path,
                link_name = link.link_name(),
                "receive link closed"
            );
        }
        if self.source.is_none() {
            return ControlFlow::Break(());
        }
        self.slot = LinkSlot::Requesting;
        ControlFlow::Continue(())
    }

    /// Classify a link failure as retryable or terminal.
    fn on_failure(&mut self, error: ReceiveError) -> ControlFlow<()> {
        let attempt = self.retry_attempt.saturating_add(1);
        if let Some(link) = self.detach() {
            spawn_close(link);
        }
        let delay = self.retry_policy.calculate_retry_delay(&error, attempt);
        match delay {
            Some(delay) if self.source.is_some() => {
                self.retry_attempt = attempt;
                tracing::warn!(
                    entity_path = %self.shared.entity_path,
                    %error,
                    attempt,
                    ?delay,
                    "link failed, retrying"
                );
                self.slot = LinkSlot::Backoff(Box::pin(sleep(delay)));
                ControlFlow::Continue(())
            }
            _ => {
                tracing::error!(
                    entity_path = %self.shared.entity_path,
                    %error,
                    attempt,
                    "link failed, not retrying"
                );
                self.terminate(error);
                ControlFlow::Break(())
            }
        }
    }

    fn terminate(&mut self, error: ReceiveError) {
        let _ = self.shared.error.set(error.clone());
        self.shared.terminated.store(true, Ordering::Release);
        let _ = self.downstream.send(Signal::Error(error));
    }

    /// Remove the active link, returning it if one was attached.
    fn detach(&mut self) -> Option<Arc<dyn ReceiveLink>> {
        match mem::replace(&mut self.slot, LinkSlot::Idle) {
            LinkSlot::Active(active) => {
                self.shared.set_active_link(None);
                Some(active.link)
            }
            other => {
                self.slot = other;
                None
            }
        }
    }

    async fn close_active(&mut self) {
        let Some(link) = self.detach() else {
            return;
        };
        tracing::debug!(
            entity_path = %self.shared.entity_path,
            link_name = link.link_name(),
            "closing receive link"
        );
        if let Err(error) = link.close().await {
            tracing::warn!(
                entity_path = %self.shared.entity_path,
                link_name = link.link_name(),
                %error,
                "failed to close receive link"
            );
        }
    }

    fn finish(&mut self) {
        self.shared.set_active_link(None);
        self.ledger.clear();
        self.shared.terminated.store(true, Ordering::Release);
        tracing::debug!(
            entity_path = %self.shared.entity_path,
            errored = self.shared.error.get().is_some(),
            "link processor terminated"
        );
    }
}

/// Poll `stream` if present, otherwise never resolve.
async fn poll_stream<S>(stream: Option<&mut S>) -> Option<S::Item>
where
    S: Stream + Unpin + ?Sized,
{
    match stream {
        Some(stream) => stream.next().await,
        None => future::pending().await,
    }
}

async fn wait_backoff(delay: Option<&mut Pin<Box<Sleep>>>) {
    match delay {
        Some(delay) => delay.as_mut().await,
        None => future::pending().await,
    }
}

fn spawn_close(link: Arc<dyn ReceiveLink>) {
    tokio::spawn(async move {
        if let Err(error) = link.close().await {
            tracing::warn!(
                link_name = link.link_name(),
                %error,
                "failed to close failed receive link"
            );
        }
    });
}
