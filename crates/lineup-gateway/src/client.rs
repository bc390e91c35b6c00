use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use lineup_core::gateway::{CreatedPoll, GatewayError, MessagingGateway, NewPoll};

use crate::telegram::{
    ALLOWED_UPDATES, ApiResponse, DeleteWebhook, GetUpdates, InputPollOption, Message, Poll,
    ReplyParameters, SendMessage, SendPoll, SetWebhook, StopPoll, Update, User,
};

pub const DEFAULT_API_URL: &str = "https://api.telegram.org";

/// Timeout for ordinary Bot API calls.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Extra time allowed on top of the long-poll wait before giving up.
const LONG_POLL_GRACE: Duration = Duration::from_secs(10);

/// Bot API client. One instance is shared by the whole process; the inner
/// `reqwest::Client` pools connections.
pub struct TelegramClient {
    http: reqwest::Client,
    /// `{api_url}/bot{token}`. Never logged.
    base: String,
    verbose: bool,
}

impl TelegramClient {
    pub fn new(api_url: &str, token: &str) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
            .build()
            .map_err(|e| GatewayError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            base: format!("{}/bot{}", api_url.trim_end_matches('/'), token),
            verbose: false,
        })
    }

    /// Log every request and response body at debug level.
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    async fn call<P, R>(&self, method: &str, params: &P, timeout: Option<Duration>) -> Result<R, GatewayError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        if self.verbose {
            debug!(
                method,
                body = %serde_json::to_string(params).unwrap_or_default(),
                "Bot API request"
            );
        }

        let mut request = self.http.post(format!("{}/{}", self.base, method)).json(params);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        // Strip the URL from transport errors; it carries the bot token.
        let response = request
            .send()
            .await
            .map_err(|e| GatewayError::Transport(e.without_url().to_string()))?;
        let body = response
            .text()
            .await
            .map_err(|e| GatewayError::Transport(e.without_url().to_string()))?;

        if self.verbose {
            debug!(method, %body, "Bot API response");
        }

        let envelope: ApiResponse<R> =
            serde_json::from_str(&body).map_err(|e| GatewayError::Decode(e.to_string()))?;
        into_result(envelope)
    }

    pub async fn get_me(&self) -> Result<User, GatewayError> {
        self.call("getMe", &serde_json::json!({}), None).await
    }

    /// Long-poll for updates after `offset`, waiting up to `wait` for one.
    pub async fn get_updates(&self, offset: i64, wait: Duration) -> Result<Vec<Update>, GatewayError> {
        let params = GetUpdates {
            offset,
            timeout: wait.as_secs(),
            allowed_updates: ALLOWED_UPDATES,
        };
        self.call("getUpdates", &params, Some(wait + LONG_POLL_GRACE)).await
    }

    pub async fn set_webhook(&self, url: &str, secret_token: Option<&str>) -> Result<(), GatewayError> {
        let params = SetWebhook {
            url,
            secret_token,
            allowed_updates: ALLOWED_UPDATES,
        };
        let _: bool = self.call("setWebhook", &params, None).await?;
        Ok(())
    }

    pub async fn delete_webhook(&self) -> Result<(), GatewayError> {
        let params = DeleteWebhook {
            drop_pending_updates: false,
        };
        let _: bool = self.call("deleteWebhook", &params, None).await?;
        Ok(())
    }
}

fn into_result<T>(envelope: ApiResponse<T>) -> Result<T, GatewayError> {
    match envelope {
        ApiResponse {
            ok: true,
            result: Some(result),
            ..
        } => Ok(result),
        ApiResponse { ok: true, result: None, .. } => {
            Err(GatewayError::Decode("response has no result".into()))
        }
        ApiResponse {
            error_code,
            description,
            ..
        } => Err(GatewayError::Api {
            code: error_code.unwrap_or_default(),
            description: description.unwrap_or_else(|| "unknown error".into()),
        }),
    }
}

impl MessagingGateway for TelegramClient {
    async fn create_poll(&self, poll: NewPoll) -> Result<CreatedPoll, GatewayError> {
        let params = SendPoll {
            chat_id: poll.chat_id,
            question: &poll.question,
            options: poll
                .options
                .iter()
                .map(|text| InputPollOption { text: text.as_str() })
                .collect(),
            is_anonymous: poll.anonymous,
            allows_multiple_answers: poll.multiple_answers,
        };
        let sent: Message = self.call("sendPoll", &params, None).await?;
        let created = sent.poll.ok_or(GatewayError::MissingPoll)?;
        Ok(CreatedPoll {
            poll_id: created.id,
            message_id: sent.message_id,
        })
    }

    async fn stop_poll(&self, chat_id: i64, message_id: i64) -> Result<(), GatewayError> {
        let _: Poll = self
            .call("stopPoll", &StopPoll { chat_id, message_id }, None)
            .await?;
        Ok(())
    }

    async fn send_message(&self, chat_id: i64, text: &str, reply_to: Option<i64>) -> Result<i64, GatewayError> {
        let params = SendMessage {
            chat_id,
            text,
            reply_parameters: reply_to.map(|message_id| ReplyParameters {
                message_id,
                allow_sending_without_reply: true,
            }),
        };
        let sent: Message = self.call("sendMessage", &params, None).await?;
        Ok(sent.message_id)
    }
}
