//! Tests for the receiver backed by a link processor.
//!
//! They cover demand-driven receives, settlement routing between the link
//! and the management node, and closing.

mod common;

use std::{sync::Arc, time::Duration};

use common::{TestResult, eventually, processor};
use linkpump::{
    error::{ErrorCondition, ReceiveError},
    message::{Outcome, ReceiveMode},
    receiver::{MessageReceiver, ProcessorReceiver},
};
use linkpump_testing::{ScriptedLink, StubManagementNode, message};
use rstest::rstest;
use tokio::time::Instant;

const WAIT: Duration = Duration::from_secs(1);

struct Fixture {
    receiver: ProcessorReceiver,
    link: Arc<ScriptedLink>,
    management: Arc<StubManagementNode>,
}

fn fixture(mode: ReceiveMode) -> TestResult<Fixture> {
    let (processor, feeder) = processor(1);
    let link = ScriptedLink::new("link-1");
    feeder.push(link.clone());
    let management = Arc::new(StubManagementNode::default());
    let receiver = ProcessorReceiver::new(processor, management.clone(), mode)?;
    Ok(Fixture {
        receiver,
        link,
        management,
    })
}

/// Receives draw messages from the processor and keep the prefetch as
/// demand.
#[tokio::test]
async fn receive_returns_link_messages() -> TestResult {
    let Fixture { receiver, link, .. } = fixture(ReceiveMode::PeekLock)?;
    link.emit(message(1));

    let received = receiver.receive(WAIT).await?.expect("message delivered");

    assert_eq!(received.sequence_number, 1);
    assert_eq!(link.credit_calls(), vec![1]);
    Ok(())
}

/// A receive with nothing to deliver yields `None` after the wait.
#[tokio::test]
async fn receive_times_out_empty() -> TestResult {
    let Fixture { receiver, .. } = fixture(ReceiveMode::PeekLock)?;
    assert!(receiver.receive(Duration::from_millis(50)).await?.is_none());
    Ok(())
}

/// Concurrent receives each finish within their own wait instead of
/// queueing behind one another.
#[tokio::test(start_paused = true)]
async fn concurrent_receives_share_the_wait() -> TestResult {
    let Fixture { receiver, .. } = fixture(ReceiveMode::PeekLock)?;
    let wait = Duration::from_millis(50);
    let started = Instant::now();

    let (first, second, third) = tokio::join!(
        receiver.receive(wait),
        receiver.receive(wait),
        receiver.receive(wait)
    );

    assert!(first?.is_none());
    assert!(second?.is_none());
    assert!(third?.is_none());
    assert!(started.elapsed() < wait * 2, "took {:?}", started.elapsed());
    Ok(())
}

/// A larger prefetch is requested from the processor on the next receive.
#[tokio::test]
async fn prefetch_raises_demand() -> TestResult {
    let Fixture { receiver, link, .. } = fixture(ReceiveMode::PeekLock)?;
    receiver.set_prefetch_count(5);

    assert!(receiver.receive(Duration::from_millis(50)).await?.is_none());

    assert_eq!(link.credit_calls(), vec![5]);
    Ok(())
}

/// Dispositions for link-delivered messages go through the link.
#[rstest]
#[case::complete(Outcome::Completed)]
#[case::abandon(Outcome::Abandoned)]
#[case::defer(Outcome::Deferred)]
#[case::dead_letter(Outcome::DeadLettered {
    reason: Some("poison".into()),
    description: Some("cannot parse".into()),
})]
#[tokio::test]
async fn settlement_uses_link(#[case] outcome: Outcome) -> TestResult {
    let Fixture {
        receiver,
        link,
        management,
    } = fixture(ReceiveMode::PeekLock)?;
    link.emit(message(1));
    let received = receiver.receive(WAIT).await?.expect("message delivered");
    let token = received.lock_token;

    match &outcome {
        Outcome::Completed => receiver.complete(token).await?,
        Outcome::Abandoned => receiver.abandon(token).await?,
        Outcome::Deferred => receiver.defer(token).await?,
        Outcome::DeadLettered {
            reason,
            description,
        } => {
            receiver
                .dead_letter(token, reason.clone(), description.clone())
                .await?;
        }
    }

    assert_eq!(link.dispositions(), vec![(token, outcome)]);
    assert!(management.dispositions().is_empty());
    Ok(())
}

/// Receive-and-delete messages cannot be settled.
#[tokio::test]
async fn receive_and_delete_rejects_settlement() -> TestResult {
    let Fixture { receiver, link, .. } = fixture(ReceiveMode::ReceiveAndDelete)?;
    link.emit(message(1));
    let received = receiver.receive(WAIT).await?.expect("message delivered");

    let result = receiver.complete(received.lock_token).await;

    assert!(matches!(result, Err(ReceiveError::IllegalState(_))));
    assert!(link.dispositions().is_empty());
    Ok(())
}

/// Deferred messages are settled through the management node that issued
/// their locks.
#[tokio::test]
async fn deferred_messages_settle_through_management() -> TestResult {
    let Fixture {
        receiver,
        link,
        management,
    } = fixture(ReceiveMode::PeekLock)?;
    let deferred = message(42);
    let token = deferred.lock_token;
    management.defer(deferred);

    let fetched = receiver.receive_deferred_messages(&[42]).await?;
    assert_eq!(fetched.len(), 1);
    assert!(receiver.is_management_lock(token));

    receiver.complete(token).await?;

    assert_eq!(management.dispositions(), vec![(token, Outcome::Completed)]);
    assert!(link.dispositions().is_empty());
    assert!(!receiver.is_management_lock(token));
    Ok(())
}

/// Missing deferred messages surface the management node's error.
#[tokio::test]
async fn missing_deferred_message_fails() -> TestResult {
    let Fixture { receiver, .. } = fixture(ReceiveMode::PeekLock)?;

    let error = receiver
        .receive_deferred_messages(&[7])
        .await
        .expect_err("nothing was deferred");

    assert_eq!(error.condition(), Some(ErrorCondition::EntityNotFound));
    Ok(())
}

/// Renewed locks are tracked so later settlement uses the management node.
#[tokio::test]
async fn renewed_lock_is_tracked() -> TestResult {
    let Fixture {
        receiver,
        link,
        management,
    } = fixture(ReceiveMode::PeekLock)?;
    link.emit(message(1));
    let received = receiver.receive(WAIT).await?.expect("message delivered");
    let token = received.lock_token;

    let locked_until = receiver.renew_message_lock(token).await?;

    assert!(locked_until > received.locked_until);
    assert_eq!(management.renewed(), vec![token]);
    assert!(receiver.is_management_lock(token));
    receiver.abandon(token).await?;
    assert_eq!(management.dispositions(), vec![(token, Outcome::Abandoned)]);
    Ok(())
}

/// A terminal processor error is returned from `receive`.
#[tokio::test]
async fn processor_error_surfaces_on_receive() -> TestResult {
    let Fixture { receiver, link, .. } = fixture(ReceiveMode::PeekLock)?;
    assert!(receiver.receive(Duration::from_millis(20)).await?.is_none());
    link.fail(ReceiveError::link(ErrorCondition::Unauthorized, "token expired"));

    let error = receiver.receive(WAIT).await.expect_err("processor failed");

    assert_eq!(error.condition(), Some(ErrorCondition::Unauthorized));
    assert!(receiver.processor().has_error());
    Ok(())
}

/// Closing cancels the processor once and rejects further operations.
#[tokio::test]
async fn close_is_idempotent() -> TestResult {
    let Fixture { receiver, link, .. } = fixture(ReceiveMode::PeekLock)?;
    assert!(receiver.receive(Duration::from_millis(20)).await?.is_none());

    receiver.close().await?;
    receiver.close().await?;
    eventually(|| link.close_count() == 1).await;

    assert!(matches!(
        receiver.receive(WAIT).await,
        Err(ReceiveError::Closed)
    ));
    assert!(matches!(
        receiver.complete(message(1).lock_token).await,
        Err(ReceiveError::Closed)
    ));
    eventually(|| receiver.processor().is_terminated()).await;
    Ok(())
}

/// A processor can only back one receiver.
#[tokio::test]
async fn subscribed_processor_is_rejected() -> TestResult {
    let (processor, _feeder) = processor(1);
    let _subscription = processor.subscribe()?;

    let result = ProcessorReceiver::new(
        processor,
        Arc::new(StubManagementNode::default()),
        ReceiveMode::PeekLock,
    );

    assert!(matches!(result, Err(ReceiveError::AlreadySubscribed)));
    Ok(())
}
