//! Contracts for the transport links consumed by the link processor.
//!
//! Link creation, authentication and frame decoding live in the transport;
//! this crate only sees the [`ReceiveLink`] surface plus a pulled
//! [`LinkStream`] that yields one fresh link per pull.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;

use crate::{
    error::{ReceiveError, Result},
    message::{LockToken, Outcome, ReceivedMessage},
};

/// Lifecycle states reported by a link endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndpointState {
    /// The link is being attached.
    Uninitialized,
    /// The link is attached and may deliver messages.
    Active,
    /// The link was detached without an error condition.
    Closed,
}

/// Endpoint state notifications. An `Err` item reports a link failure; the
/// end of the stream is a graceful close.
pub type EndpointStateStream = BoxStream<'static, Result<EndpointState>>;

/// Messages decoded by a link, in delivery order.
pub type MessageStream = BoxStream<'static, ReceivedMessage>;

/// Callback a link invokes when its credit reaches zero, returning how many
/// credits it should add.
pub type CreditSupplier = Arc<dyn Fn() -> u32 + Send + Sync>;

/// Upstream supplier of links. Each pulled item is one link (or the failure
/// to create one); `None` means no further links will be produced.
pub type LinkStream = BoxStream<'static, std::result::Result<Arc<dyn ReceiveLink>, ReceiveError>>;

/// A receive link attached to one queue, subscription or session.
#[async_trait]
pub trait ReceiveLink: Send + Sync + 'static {
    /// Name assigned to the link by the transport.
    fn link_name(&self) -> &str;

    /// Path of the entity the link receives from.
    fn entity_path(&self) -> &str;

    /// Subscribe to endpoint state changes.
    fn endpoint_states(&self) -> EndpointStateStream;

    /// Subscribe to messages delivered by the link.
    fn receive(&self) -> MessageStream;

    /// Grant the service permission to deliver `credits` more messages.
    async fn add_credits(&self, credits: u32) -> Result<()>;

    /// Credits currently granted and not yet consumed.
    fn credits(&self) -> u32;

    /// Install the supplier consulted once the link runs out of credit.
    fn set_empty_credit_listener(&self, listener: CreditSupplier);

    /// Settle a message received on this link.
    async fn update_disposition(&self, lock_token: LockToken, outcome: Outcome) -> Result<()>;

    /// Detach the link.
    async fn close(&self) -> Result<()>;

    /// Session the link is bound to, for session links.
    fn session_id(&self) -> Option<&str> { None }

    /// Expiry of the session lock, for session links.
    fn session_locked_until(&self) -> Option<DateTime<Utc>> { None }
}
