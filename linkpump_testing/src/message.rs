//! Message builders.

use chrono::{TimeDelta, Utc};
use linkpump::message::{LockToken, ReceivedMessage};

/// A message with a fresh lock token locked for thirty seconds.
#[must_use]
pub fn message(sequence_number: i64) -> ReceivedMessage {
    ReceivedMessage::new(
        sequence_number,
        LockToken::random(),
        Utc::now() + TimeDelta::seconds(30),
    )
    .with_body(format!("body-{sequence_number}"))
}

/// A message belonging to `session_id`.
#[must_use]
pub fn session_message(session_id: &str, sequence_number: i64) -> ReceivedMessage {
    message(sequence_number).with_session_id(session_id)
}
