use tracing::{debug, error, warn};

use lineup_core::command::USAGE;
use lineup_core::gateway::MessagingGateway;
use lineup_core::results::Shuffler;
use lineup_core::service::{CreatePollError, PollService};

use crate::telegram::{Message, PollAnswer, Update};

const POLL_COMMAND: &str = "poll";

/// Routes incoming updates to the poll service. Shared by the long-polling
/// loop and the webhook endpoint.
pub struct UpdateHandler<G, S> {
    service: PollService<G, S>,
    bot_username: String,
}

impl<G, S> Clone for UpdateHandler<G, S> {
    fn clone(&self) -> Self {
        Self {
            service: self.service.clone(),
            bot_username: self.bot_username.clone(),
        }
    }
}

impl<G: MessagingGateway, S: Shuffler> UpdateHandler<G, S> {
    pub fn new(service: PollService<G, S>, bot_username: impl Into<String>) -> Self {
        Self {
            service,
            bot_username: bot_username.into(),
        }
    }

    pub fn service(&self) -> &PollService<G, S> {
        &self.service
    }

    pub async fn handle(&self, update: Update) {
        if let Some(message) = update.message {
            self.handle_message(message).await;
        }
        if let Some(answer) = update.poll_answer {
            self.handle_poll_answer(answer).await;
        }
    }

    async fn handle_message(&self, msg: Message) {
        if !msg.chat.is_group() {
            return;
        }
        let Some(request) = extract_request(&msg, &self.bot_username) else {
            return;
        };
        let Some(from) = msg.from.as_ref() else {
            debug!(chat_id = msg.chat.id, "Ignoring poll request without a sender");
            return;
        };

        match self
            .service
            .create_poll(msg.chat.id, request, from.identity())
            .await
        {
            Ok(_) => {}
            Err(CreatePollError::BadFormat(e)) => {
                debug!(chat_id = msg.chat.id, "Rejected poll request: {}", e);
                if let Err(e) = self
                    .service
                    .gateway()
                    .send_message(msg.chat.id, USAGE, Some(msg.message_id))
                    .await
                {
                    warn!(chat_id = msg.chat.id, "Failed to send usage hint: {}", e);
                }
            }
            Err(CreatePollError::Gateway(e)) => {
                warn!(chat_id = msg.chat.id, "Send poll failed: {}", e);
            }
            Err(CreatePollError::Storage(e)) => {
                error!(chat_id = msg.chat.id, "Failed to register poll: {}", e);
            }
        }
    }

    async fn handle_poll_answer(&self, answer: PollAnswer) {
        let Some(user) = answer.user else {
            return;
        };
        let voter = user.identity();
        let voter_id = voter.id;
        match self
            .service
            .record_vote(&answer.poll_id, voter, answer.option_ids)
            .await
        {
            Ok(()) => debug!(poll_id = %answer.poll_id, voter_id, "Vote recorded"),
            Err(e) => error!(poll_id = %answer.poll_id, voter_id, "Failed to record vote: {}", e),
        }
    }
}

/// Pull the poll request text out of a message addressed to the bot.
///
/// A message is addressed to the bot when it starts with `/poll` (optionally
/// `/poll@bot_username`) or mentions `@bot_username`; the request is whatever
/// follows the command or mention. Returns `None` for anything else.
pub fn extract_request<'m>(msg: &'m Message, bot_username: &str) -> Option<&'m str> {
    let text = msg.text.as_deref()?;
    if text.is_empty() {
        return None;
    }

    if let Some(command) = msg
        .entities
        .iter()
        .find(|e| e.kind == "bot_command" && e.offset == 0)
    {
        let raw = msg.entity_text(command)?.trim_start_matches('/');
        let (name, target) = match raw.split_once('@') {
            Some((name, target)) => (name, Some(target)),
            None => (raw, None),
        };
        if name != POLL_COMMAND {
            return None;
        }
        if let Some(target) = target {
            if !target.eq_ignore_ascii_case(bot_username) {
                return None;
            }
        }
        return msg.text_after(command);
    }

    msg.entities
        .iter()
        .filter(|e| e.kind == "mention")
        .find(|e| {
            msg.entity_text(e)
                .and_then(|m| m.strip_prefix('@'))
                .is_some_and(|m| m.eq_ignore_ascii_case(bot_username))
        })
        .and_then(|e| msg.text_after(e))
}
