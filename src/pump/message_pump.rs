//! Receive loops over a plain [`MessageReceiver`].

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::runtime::Handle;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use super::{ErrorSink, MessageHandlerOptions, PUMP_RETRY_DELAY, invoke_callback};
use crate::{
    error::ReceiveError,
    handler::{ExceptionPhase, MessageHandler},
    message::{ReceiveMode, ReceivedMessage},
    receiver::MessageReceiver,
    renew::MessageRenewLoop,
};

pub(crate) struct MessagePump {
    receiver: Arc<dyn MessageReceiver>,
    handler: Arc<dyn MessageHandler>,
    options: MessageHandlerOptions,
    sink: ErrorSink,
    shutdown: CancellationToken,
}

impl MessagePump {
    pub(crate) fn new(
        receiver: Arc<dyn MessageReceiver>,
        handler: Arc<dyn MessageHandler>,
        options: MessageHandlerOptions,
        sink: ErrorSink,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            receiver,
            handler,
            options,
            sink,
            shutdown,
        }
    }

    pub(crate) fn start(self: &Arc<Self>, tasks: &TaskTracker, executor: &Handle) {
        for id in 0..self.options.max_concurrent_calls {
            tasks.spawn_on(Arc::clone(self).receive_loop(id), executor);
        }
    }

    async fn receive_loop(self: Arc<Self>, id: usize) {
        tracing::debug!(entity_path = self.sink.entity_path(), loop_id = id, "receive loop started");
        loop {
            let received = tokio::select! {
                biased;

                () = self.shutdown.cancelled() => break,
                received = self.receiver.receive(self.options.message_wait_duration) => received,
            };
            match received {
                Ok(Some(message)) => self.dispatch(message).await,
                Ok(None) => {}
                Err(ReceiveError::Closed) => {
                    tracing::debug!(
                        entity_path = self.sink.entity_path(),
                        loop_id = id,
                        "receiver closed"
                    );
                    break;
                }
                Err(error) if error.is_illegal_state() => {
                    self.sink.report(&error, ExceptionPhase::Receive);
                    break;
                }
                Err(error) => {
                    self.sink.report(&error, ExceptionPhase::Receive);
                    tokio::select! {
                        biased;

                        () = self.shutdown.cancelled() => break,
                        () = tokio::time::sleep(PUMP_RETRY_DELAY) => {}
                    }
                }
            }
        }
        tracing::debug!(entity_path = self.sink.entity_path(), loop_id = id, "receive loop stopped");
    }

    async fn dispatch(&self, message: ReceivedMessage) {
        let peek_lock = self.receiver.receive_mode() == ReceiveMode::PeekLock;
        let renew = (peek_lock && !self.options.max_auto_renew_duration.is_zero()).then(|| {
            MessageRenewLoop::start(
                Arc::clone(&self.receiver),
                &message,
                renew_deadline(self.options.max_auto_renew_duration),
                self.sink.renew_notifier(),
            )
        });
        tracing::trace!(
            entity_path = self.sink.entity_path(),
            message = %message.identifier(),
            "dispatching message"
        );
        let outcome = invoke_callback(self.handler.on_message(&message)).await;
        if let Some(renew) = &renew {
            renew.cancel();
        }
        if let Err(error) = &outcome {
            self.sink.report(error, ExceptionPhase::UserCallback);
        }
        if !(peek_lock && self.options.auto_complete) {
            return;
        }
        let lock_token = message.lock_token;
        if outcome.is_ok() {
            if let Err(error) = self.receiver.complete(lock_token).await {
                self.sink.report(&error, ExceptionPhase::Complete);
            }
        } else if let Err(error) = self.receiver.abandon(lock_token).await {
            self.sink.report(&error, ExceptionPhase::Abandon);
        }
    }
}

/// Wall-clock instant after which renewal stops.
fn renew_deadline(max_auto_renew: std::time::Duration) -> DateTime<Utc> {
    TimeDelta::from_std(max_auto_renew)
        .ok()
        .and_then(|delta| Utc::now().checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
