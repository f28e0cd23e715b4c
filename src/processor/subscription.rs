//! Downstream handle for a [`LinkProcessor`](super::LinkProcessor).

use std::{
    pin::Pin,
    task::{Context, Poll},
};

use futures::Stream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{
    demand::UNBOUNDED,
    event::{Command, Signal},
};
use crate::{error::ReceiveError, message::ReceivedMessage};

/// The single subscription to a [`LinkProcessor`](super::LinkProcessor).
///
/// Messages are only delivered against demand signalled with
/// [`request`](Self::request). The stream yields at most one error, after
/// which it ends. Dropping the subscription cancels the processor.
///
/// # Examples
///
/// ```no_run
/// use futures::StreamExt;
/// use linkpump::processor::LinkProcessor;
///
/// # async fn demo(processor: LinkProcessor) -> linkpump::Result<()> {
/// let mut subscription = processor.subscribe()?;
/// subscription.request(10);
/// while let Some(message) = subscription.next().await {
///     let message = message?;
///     println!("received {}", message.sequence_number);
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct ProcessorSubscription {
    commands: mpsc::UnboundedSender<Command>,
    signals: mpsc::UnboundedReceiver<Signal>,
    shutdown: CancellationToken,
    done: bool,
}

impl ProcessorSubscription {
    pub(super) fn new(
        commands: mpsc::UnboundedSender<Command>,
        signals: mpsc::UnboundedReceiver<Signal>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            commands,
            signals,
            shutdown,
            done: false,
        }
    }

    /// Signal willingness to receive `n` more messages.
    ///
    /// Requests of zero are ignored, as are requests after termination.
    pub fn request(&self, n: u64) {
        if n == 0 {
            tracing::debug!("ignoring request for zero messages");
            return;
        }
        // A closed channel means the processor has terminated.
        let _ = self.commands.send(Command::Request(n));
    }

    /// Remove the demand limit; the link is kept topped up to the prefetch.
    pub fn request_unbounded(&self) { self.request(UNBOUNDED); }

    /// Stop receiving. The active link is closed and no further links are
    /// requested. Calling this more than once has no further effect.
    pub fn cancel(&self) { self.shutdown.cancel(); }
}

impl Drop for ProcessorSubscription {
    fn drop(&mut self) { self.shutdown.cancel(); }
}

impl Stream for ProcessorSubscription {
    type Item = Result<ReceivedMessage, ReceiveError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        match this.signals.poll_recv(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Signal::Message(message))) => Poll::Ready(Some(Ok(message))),
            Poll::Ready(Some(Signal::Error(error))) => {
                this.done = true;
                Poll::Ready(Some(Err(error)))
            }
            Poll::Ready(None) => {
                this.done = true;
                Poll::Ready(None)
            }
        }
    }
}
