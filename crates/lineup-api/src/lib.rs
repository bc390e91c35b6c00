//! HTTP surface: Telegram webhook, health check and poll status.

pub mod middleware;
pub mod polls;
pub mod state;
pub mod webhook;

use axum::{
    Router, middleware as axum_middleware,
    routing::{get, post},
};

use lineup_core::gateway::MessagingGateway;
use lineup_core::results::Shuffler;

use crate::middleware::require_webhook_secret;
use crate::state::AppState;

/// Path Telegram delivers updates to in webhook mode.
pub const WEBHOOK_PATH: &str = "/telegram/webhook";

/// All routes. `with_webhook` is false in long-polling mode, where nothing
/// should accept pushed updates.
pub fn router<G: MessagingGateway, S: Shuffler>(state: AppState<G, S>, with_webhook: bool) -> Router {
    let mut app = Router::new()
        .route("/healthz", get(polls::healthz::<G, S>))
        .route("/polls/{poll_id}", get(polls::get_poll::<G, S>));

    if with_webhook {
        app = app.route(
            WEBHOOK_PATH,
            post(webhook::receive_update::<G, S>).layer(axum_middleware::from_fn_with_state(
                state.clone(),
                require_webhook_secret::<G, S>,
            )),
        );
    }

    app.with_state(state)
}
