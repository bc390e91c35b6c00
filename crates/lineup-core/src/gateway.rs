use std::future::Future;

use thiserror::Error;

use lineup_types::models::POLL_OPTIONS;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("platform rejected request ({code}): {description}")]
    Api { code: i64, description: String },
    #[error("platform response carried no poll")]
    MissingPoll,
    #[error("could not decode platform response: {0}")]
    Decode(String),
}

/// A poll to be posted to a chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPoll {
    pub chat_id: i64,
    pub question: String,
    pub options: Vec<String>,
    pub anonymous: bool,
    pub multiple_answers: bool,
}

impl NewPoll {
    /// The two-option, named, single-answer attendance poll.
    pub fn attendance(chat_id: i64, topic: &str) -> Self {
        Self {
            chat_id,
            question: topic.to_string(),
            options: POLL_OPTIONS.iter().map(|o| o.to_string()).collect(),
            anonymous: false,
            multiple_answers: false,
        }
    }
}

/// Identifiers the platform assigned to a posted poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedPoll {
    pub poll_id: String,
    pub message_id: i64,
}

/// The chat platform as the poll lifecycle sees it.
///
/// Calls are independent request/response exchanges; implementations need no
/// internal coordination and are shared behind an `Arc`.
pub trait MessagingGateway: Send + Sync + 'static {
    fn create_poll(
        &self,
        poll: NewPoll,
    ) -> impl Future<Output = Result<CreatedPoll, GatewayError>> + Send;

    /// Close the interactive poll widget so no further votes are accepted.
    fn stop_poll(
        &self,
        chat_id: i64,
        message_id: i64,
    ) -> impl Future<Output = Result<(), GatewayError>> + Send;

    /// Post a text message, optionally as a reply. Returns the new message id.
    fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        reply_to: Option<i64>,
    ) -> impl Future<Output = Result<i64, GatewayError>> + Send;
}
