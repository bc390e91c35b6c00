use serde::{Deserialize, Serialize};

use crate::models::Poll;

/// Arguments of a job that finalizes a poll: stop it and post the results.
///
/// Shared between the side that enqueues at poll creation and the worker that
/// runs the job. Chat, message and topic are carried so the worker can talk to
/// the gateway; vote state is always read fresh from the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinishPollArgs {
    pub poll_id: String,
    pub chat_id: i64,
    pub message_id: i64,
    pub topic: String,
}

impl FinishPollArgs {
    pub const KIND: &'static str = "finish_poll";
}

impl From<&Poll> for FinishPollArgs {
    fn from(poll: &Poll) -> Self {
        Self {
            poll_id: poll.poll_id.clone(),
            chat_id: poll.chat_id,
            message_id: poll.message_id,
            topic: poll.topic.clone(),
        }
    }
}
