//! Internal event and command types for the processor select loop.

use std::sync::Arc;

use crate::{
    error::{ReceiveError, Result},
    link::{EndpointState, ReceiveLink},
    message::ReceivedMessage,
};

/// Commands sent by the subscriber to the actor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum Command {
    Request(u64),
}

/// Signals sent by the actor to the subscriber.
#[derive(Debug)]
pub(super) enum Signal {
    Message(ReceivedMessage),
    Error(ReceiveError),
}

/// Events returned by [`ProcessorActor::next_event`][super::actor::ProcessorActor].
pub(super) enum Event {
    Shutdown,
    /// `None` when the subscriber has gone away.
    Command(Option<Command>),
    /// `None` when upstream will produce no further links.
    Link(Option<std::result::Result<Arc<dyn ReceiveLink>, ReceiveError>>),
    RetryElapsed,
    /// `None` when the endpoint state stream completed.
    Endpoint(Option<Result<EndpointState>>),
    /// `None` when the link's message stream completed.
    Message(Option<ReceivedMessage>),
}
