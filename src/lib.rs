#![doc(html_root_url = "https://docs.rs/linkpump/latest")]
//! Public API for the `linkpump` library.
//!
//! This crate provides the client-side receive pipeline of a message-queue
//! protocol client: a link processor turning a sequence of failure-prone
//! links into one backpressure-correct message stream, lock renewal loops,
//! callback pumps over receivers and sessions, and a self-pruning lock
//! container.

pub mod error;
/// Result type alias used throughout the receive pipeline.
pub use error::Result;
pub mod handler;
pub mod link;
pub mod lock_container;
pub mod message;
pub mod metrics;
pub mod panic;
pub mod prelude;
pub mod processor;
pub mod pump;
pub mod receiver;
pub mod renew;
pub mod retry;
pub mod session;

pub use error::{ErrorCondition, ReceiveError};
pub use handler::{ExceptionPhase, HandlerError, MessageHandler, SessionHandler};
pub use link::{EndpointState, LinkStream, ReceiveLink};
pub use lock_container::{LockContainer, LockContainerError};
pub use message::{LockToken, Outcome, ReceiveMode, ReceivedMessage};
pub use metrics::{LINKS_ATTACHED, LOCK_RENEWALS, MESSAGES_RECEIVED, PUMP_ERRORS, SESSIONS_OPEN};
pub use processor::{LinkProcessor, ProcessorOptions, ProcessorSubscription};
pub use pump::{MessageHandlerOptions, PumpError, ReceivePump, SessionHandlerOptions};
pub use receiver::{ManagementNode, MessageReceiver, ProcessorReceiver};
pub use renew::{MessageRenewLoop, RenewLockLoop, SessionRenewLoop};
pub use retry::{ExponentialRetryPolicy, FixedRetryPolicy, RetryOptions, RetryPolicy};
pub use session::{MessageSession, SessionAcceptor};
