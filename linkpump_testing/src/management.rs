//! An in-memory [`ManagementNode`].

use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use linkpump::{
    error::{ErrorCondition, ReceiveError, Result},
    message::{LockToken, Outcome, ReceiveMode, ReceivedMessage},
    receiver::ManagementNode,
};

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Records management operations and serves deferred messages.
#[derive(Default)]
pub struct StubManagementNode {
    deferred: Mutex<HashMap<i64, ReceivedMessage>>,
    renewed: Mutex<Vec<LockToken>>,
    dispositions: Mutex<Vec<(LockToken, Outcome)>>,
}

impl StubManagementNode {
    /// Make `message` fetchable by its sequence number.
    pub fn defer(&self, message: ReceivedMessage) {
        lock(&self.deferred).insert(message.sequence_number, message);
    }

    /// Tokens renewed through the node.
    #[must_use]
    pub fn renewed(&self) -> Vec<LockToken> { lock(&self.renewed).clone() }

    /// Dispositions applied through the node.
    #[must_use]
    pub fn dispositions(&self) -> Vec<(LockToken, Outcome)> { lock(&self.dispositions).clone() }
}

#[async_trait]
impl ManagementNode for StubManagementNode {
    async fn renew_message_lock(&self, lock_token: LockToken) -> Result<DateTime<Utc>> {
        lock(&self.renewed).push(lock_token);
        Ok(Utc::now() + TimeDelta::seconds(60))
    }

    async fn update_disposition(&self, lock_token: LockToken, outcome: Outcome) -> Result<()> {
        lock(&self.dispositions).push((lock_token, outcome));
        Ok(())
    }

    async fn receive_deferred_messages(
        &self,
        _receive_mode: ReceiveMode,
        sequence_numbers: &[i64],
    ) -> Result<Vec<ReceivedMessage>> {
        let mut deferred = lock(&self.deferred);
        sequence_numbers
            .iter()
            .map(|seq| {
                deferred.remove(seq).ok_or_else(|| {
                    ReceiveError::link(
                        ErrorCondition::EntityNotFound,
                        format!("no deferred message with sequence number {seq}"),
                    )
                })
            })
            .collect()
    }
}
