use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::{Identity, Poll, PollStatus};

// -- Polls --

#[derive(Debug, Serialize)]
pub struct PollResponse {
    pub poll_id: String,
    pub chat_id: i64,
    pub message_id: i64,
    pub topic: String,
    pub creator: Identity,
    pub status: PollStatus,
    pub started_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub results_message_id: Option<i64>,
    pub results_text: Option<String>,
}

impl PollResponse {
    pub fn new(poll: Poll, results_text: Option<String>) -> Self {
        Self {
            poll_id: poll.poll_id,
            chat_id: poll.chat_id,
            message_id: poll.message_id,
            topic: poll.topic,
            creator: poll.creator,
            status: poll.status,
            started_at: poll.started_at,
            ends_at: poll.ends_at,
            processed_at: poll.processed_at,
            results_message_id: poll.results_message_id,
            results_text,
        }
    }
}

// -- Health --

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}
