//! Shared utilities for integration tests.

// Items in this shared module may not be used by all test binaries that import it.
#![allow(
    dead_code,
    reason = "shared test utilities are not used by all test binaries"
)]

use std::{sync::Arc, time::Duration};

use linkpump::{
    processor::{LinkProcessor, ProcessorOptions},
    retry::{FixedRetryPolicy, RetryMode, RetryOptions, RetryPolicy},
};
use linkpump_testing::{LinkFeeder, link_source};
use rstest::fixture;

pub type TestResult<T = ()> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Retry options allowing three fixed 100 ms retries.
#[fixture]
pub fn fast_retry() -> RetryOptions {
    RetryOptions {
        mode: RetryMode::Fixed,
        max_retries: 3,
        delay: Duration::from_millis(100),
        max_delay: Duration::from_millis(100),
    }
}

/// A fixed retry policy built from [`fast_retry`].
pub fn fast_retry_policy() -> Arc<dyn RetryPolicy> { Arc::new(FixedRetryPolicy::new(fast_retry())) }

/// A processor over a scripted link source with the given prefetch.
pub fn processor(prefetch: u32) -> (LinkProcessor, LinkFeeder) {
    let (links, feeder) = link_source();
    let processor = LinkProcessor::new(
        "queue/orders",
        links,
        fast_retry_policy(),
        ProcessorOptions { prefetch },
    );
    (processor, feeder)
}

/// Poll `condition` until it holds, panicking after five seconds.
pub async fn eventually(condition: impl Fn() -> bool) {
    let poll = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    linkpump_testing::within!(poll);
}

/// Let spawned tasks run until they block.
pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}
