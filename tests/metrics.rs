#![cfg(feature = "metrics")]
//! Tests for `linkpump` metrics.
//!
//! Counters are captured with `metrics_util::debugging::DebuggingRecorder`
//! installed as a thread-local recorder. Pipeline tests drive a
//! current-thread runtime inside the recorder scope so spawned tasks record
//! into it too.

mod common;

use std::future::Future;

use common::{TestResult, processor};
use linkpump::metrics::{
    self as lp_metrics,
    LINKS_ATTACHED,
    LOCK_RENEWALS,
    LeaseKind,
    MESSAGES_RECEIVED,
    PUMP_ERRORS,
    SESSIONS_OPEN,
};
use linkpump_testing::{ScriptedLink, counter_value, debugging_recorder_setup, message, next_expect};
use metrics_util::debugging::{DebugValue, DebuggingRecorder};
use rstest::rstest;

fn run_local<F: Future>(recorder: &DebuggingRecorder, fut: F) -> F::Output {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("build runtime");
    metrics::with_local_recorder(recorder, || runtime.block_on(fut))
}

#[rstest]
#[case::message_ok(LeaseKind::Message, true, "message", "ok")]
#[case::session_error(LeaseKind::Session, false, "session", "error")]
fn renewal_counter_is_labelled(
    #[case] kind: LeaseKind,
    #[case] succeeded: bool,
    #[case] kind_label: &str,
    #[case] outcome_label: &str,
) {
    let (snapshotter, recorder) = debugging_recorder_setup();
    metrics::with_local_recorder(&recorder, || lp_metrics::inc_renewals(kind, succeeded));

    let count = counter_value(&snapshotter, LOCK_RENEWALS, &[
        ("kind", kind_label),
        ("outcome", outcome_label),
    ]);
    assert_eq!(count, 1, "renewal counter not recorded");
}

#[test]
fn pump_error_counter_carries_phase() {
    let (snapshotter, recorder) = debugging_recorder_setup();
    metrics::with_local_recorder(&recorder, || {
        lp_metrics::inc_pump_errors("accept_session");
        lp_metrics::inc_pump_errors("accept_session");
    });

    assert_eq!(
        counter_value(&snapshotter, PUMP_ERRORS, &[("phase", "accept_session")]),
        2
    );
}

#[test]
fn session_gauge_tracks_open_sessions() {
    let (snapshotter, recorder) = debugging_recorder_setup();
    metrics::with_local_recorder(&recorder, || {
        lp_metrics::inc_sessions();
        lp_metrics::inc_sessions();
        lp_metrics::dec_sessions();
    });

    let open = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .find_map(|(key, _, _, value)| match value {
            DebugValue::Gauge(v) if key.key().name() == SESSIONS_OPEN => Some(v.into_inner()),
            _ => None,
        });
    assert!(open.is_some_and(|v| (v - 1.0).abs() < f64::EPSILON));
}

#[test]
fn processor_counts_links_and_messages() -> TestResult {
    let (snapshotter, recorder) = debugging_recorder_setup();
    run_local(&recorder, async {
        let (processor, feeder) = processor(2);
        let link = ScriptedLink::new("link-1");
        feeder.push(link.clone());
        let mut subscription = processor.subscribe()?;
        subscription.request(2);
        link.emit(message(1));
        link.emit(message(2));
        next_expect!(subscription)?;
        next_expect!(subscription)?;
        TestResult::Ok(())
    })?;

    assert_eq!(counter_value(&snapshotter, LINKS_ATTACHED, &[]), 1);
    assert_eq!(counter_value(&snapshotter, MESSAGES_RECEIVED, &[]), 2);
    Ok(())
}
