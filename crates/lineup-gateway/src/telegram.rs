//! Bot API wire types. Only the fields the bot reads or sends are modelled;
//! everything else in a payload is ignored.

use serde::{Deserialize, Serialize};

use lineup_types::models::Identity;

/// Envelope of every Bot API response.
#[derive(Debug, Deserialize)]
pub struct ApiResponse<T> {
    pub ok: bool,
    pub result: Option<T>,
    pub error_code: Option<i64>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<Message>,
    #[serde(default)]
    pub poll_answer: Option<PollAnswer>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub message_id: i64,
    #[serde(default)]
    pub from: Option<User>,
    pub chat: Chat,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub entities: Vec<MessageEntity>,
    #[serde(default)]
    pub poll: Option<Poll>,
}

impl Message {
    /// Text covered by `entity`. Entity offsets count UTF-16 code units.
    pub fn entity_text(&self, entity: &MessageEntity) -> Option<&str> {
        let text = self.text.as_deref()?;
        let start = utf16_to_byte(text, entity.offset)?;
        let end = utf16_to_byte(text, entity.offset + entity.length)?;
        text.get(start..end)
    }

    /// Text following `entity`.
    pub fn text_after(&self, entity: &MessageEntity) -> Option<&str> {
        let text = self.text.as_deref()?;
        let end = utf16_to_byte(text, entity.offset + entity.length)?;
        text.get(end..)
    }
}

fn utf16_to_byte(text: &str, offset: usize) -> Option<usize> {
    let mut units = 0;
    for (idx, ch) in text.char_indices() {
        if units == offset {
            return Some(idx);
        }
        if units > offset {
            return None;
        }
        units += ch.len_utf16();
    }
    (units == offset).then_some(text.len())
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub id: i64,
    pub first_name: String,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

impl User {
    /// First and last name joined with a space.
    pub fn display_name(&self) -> String {
        match self.last_name.as_deref() {
            Some(last) if !last.is_empty() => format!("{} {}", self.first_name, last),
            _ => self.first_name.clone(),
        }
    }

    pub fn identity(&self) -> Identity {
        Identity::new(self.id, self.username.clone(), Some(self.display_name()))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: String,
}

impl Chat {
    pub fn is_group(&self) -> bool {
        self.kind == "group" || self.kind == "supergroup"
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageEntity {
    #[serde(rename = "type")]
    pub kind: String,
    pub offset: usize,
    pub length: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Poll {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PollAnswer {
    pub poll_id: String,
    /// Absent when the vote was cast on behalf of a chat.
    #[serde(default)]
    pub user: Option<User>,
    #[serde(default)]
    pub option_ids: Vec<i64>,
}

#[derive(Debug, Serialize)]
pub struct SendPoll<'a> {
    pub chat_id: i64,
    pub question: &'a str,
    pub options: Vec<InputPollOption<'a>>,
    pub is_anonymous: bool,
    pub allows_multiple_answers: bool,
}

#[derive(Debug, Serialize)]
pub struct InputPollOption<'a> {
    pub text: &'a str,
}

#[derive(Debug, Serialize)]
pub struct StopPoll {
    pub chat_id: i64,
    pub message_id: i64,
}

#[derive(Debug, Serialize)]
pub struct SendMessage<'a> {
    pub chat_id: i64,
    pub text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_parameters: Option<ReplyParameters>,
}

#[derive(Debug, Serialize)]
pub struct ReplyParameters {
    pub message_id: i64,
    pub allow_sending_without_reply: bool,
}

#[derive(Debug, Serialize)]
pub struct GetUpdates<'a> {
    pub offset: i64,
    pub timeout: u64,
    pub allowed_updates: &'a [&'a str],
}

#[derive(Debug, Serialize)]
pub struct SetWebhook<'a> {
    pub url: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_token: Option<&'a str>,
    pub allowed_updates: &'a [&'a str],
}

#[derive(Debug, Serialize)]
pub struct DeleteWebhook {
    pub drop_pending_updates: bool,
}

/// Update kinds the bot subscribes to.
pub const ALLOWED_UPDATES: &[&str] = &["message", "poll_answer"];
