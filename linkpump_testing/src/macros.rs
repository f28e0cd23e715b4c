//! Assertion macros shared by integration tests.

/// Await the next item of a stream with a timeout, panicking with the call
/// site on timeout or stream end.
#[macro_export]
macro_rules! next_expect {
    ($stream:expr) => {{
        ::tokio::time::timeout(
            ::std::time::Duration::from_secs(5),
            ::futures::StreamExt::next(&mut $stream),
        )
        .await
        .expect(concat!("timed out waiting at ", file!(), ":", line!()))
        .expect(concat!("stream ended at ", file!(), ":", line!()))
    }};
}

/// Await a future with a timeout, panicking with the call site on timeout.
#[macro_export]
macro_rules! within {
    ($fut:expr) => {{
        ::tokio::time::timeout(::std::time::Duration::from_secs(5), $fut)
            .await
            .expect(concat!("timed out at ", file!(), ":", line!()))
    }};
}

pub use crate::{next_expect, within};
