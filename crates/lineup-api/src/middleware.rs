use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use subtle::ConstantTimeEq;
use tracing::warn;

use lineup_core::gateway::MessagingGateway;
use lineup_core::results::Shuffler;

use crate::state::AppState;

/// Header Telegram sets to the `secret_token` given to `setWebhook`.
pub const SECRET_TOKEN_HEADER: &str = "x-telegram-bot-api-secret-token";

/// Reject webhook calls that do not carry the configured secret token.
/// Passes everything through when no secret is configured.
pub async fn require_webhook_secret<G: MessagingGateway, S: Shuffler>(
    State(state): State<AppState<G, S>>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    if let Some(expected) = state.webhook_secret.as_deref() {
        let provided = req
            .headers()
            .get(SECRET_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or(StatusCode::UNAUTHORIZED)?;

        if !bool::from(provided.as_bytes().ct_eq(expected.as_bytes())) {
            warn!("Webhook call with wrong secret token");
            return Err(StatusCode::UNAUTHORIZED);
        }
    }
    Ok(next.run(req).await)
}
