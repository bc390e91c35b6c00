use std::sync::Arc;

use lineup_db::Database;
use lineup_gateway::dispatcher::UpdateHandler;

pub type AppState<G, S> = Arc<AppStateInner<G, S>>;

pub struct AppStateInner<G, S> {
    pub db: Arc<Database>,
    pub updates: UpdateHandler<G, S>,
    /// Expected value of the secret-token header on webhook calls.
    pub webhook_secret: Option<String>,
}
