//! Telegram side of the bot: Bot API client, update routing and long polling.

pub mod client;
pub mod dispatcher;
pub mod polling;
pub mod telegram;
