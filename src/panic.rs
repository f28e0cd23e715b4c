//! Rendering of panic payloads caught around application callbacks.

use std::{any::Any, fmt};

/// Displayable view of a payload caught with `catch_unwind`.
///
/// String payloads render verbatim; anything else renders through `Debug`.
///
/// ```
/// use linkpump::panic::format_panic;
///
/// assert_eq!(format_panic(Box::new("handler failed")).to_string(), "handler failed");
/// assert!(format_panic(Box::new(7_i32)).to_string().contains("Any"));
/// ```
#[derive(Debug)]
#[must_use]
pub struct PanicMessage(Box<dyn Any + Send>);

impl PanicMessage {
    fn as_str(&self) -> Option<&str> {
        self.0
            .downcast_ref::<String>()
            .map(String::as_str)
            .or_else(|| self.0.downcast_ref::<&'static str>().copied())
    }
}

impl fmt::Display for PanicMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_str() {
            Some(text) => f.write_str(text),
            None => write!(f, "{:?}", self.0),
        }
    }
}

/// Wrap a caught panic payload for logging.
pub fn format_panic(payload: Box<dyn Any + Send>) -> PanicMessage { PanicMessage(payload) }
