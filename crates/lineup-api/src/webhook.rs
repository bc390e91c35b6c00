use axum::{Json, extract::State, http::StatusCode};
use tracing::debug;

use lineup_core::gateway::MessagingGateway;
use lineup_core::results::Shuffler;
use lineup_gateway::telegram::Update;

use crate::state::AppState;

/// Receive one pushed update. Always answers 200 once the update parsed, so
/// Telegram does not redeliver updates the bot chose to ignore.
pub async fn receive_update<G: MessagingGateway, S: Shuffler>(
    State(state): State<AppState<G, S>>,
    Json(update): Json<Update>,
) -> StatusCode {
    debug!(update_id = update.update_id, "Webhook update");
    state.updates.handle(update).await;
    StatusCode::OK
}
