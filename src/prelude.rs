//! Optional convenience imports for common `linkpump` workflows.
//!
//! Only the types most applications touch are re-exported here. Prefer
//! importing specialised APIs directly from their owning modules.
//!
//! # Examples
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use linkpump::prelude::*;
//!
//! fn pump(receiver: Arc<dyn MessageReceiver>) -> ReceivePump {
//!     ReceivePump::for_receiver("orders", receiver)
//! }
//! ```

pub use crate::{
    error::{ReceiveError, Result},
    handler::{ExceptionPhase, HandlerError, MessageHandler, SessionHandler},
    message::{Outcome, ReceiveMode, ReceivedMessage},
    processor::{LinkProcessor, ProcessorOptions},
    pump::{MessageHandlerOptions, ReceivePump, SessionHandlerOptions},
    receiver::{MessageReceiver, ProcessorReceiver},
    session::{MessageSession, SessionAcceptor},
};
