use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use lineup_core::results::Shuffler;

use crate::client::TelegramClient;
use crate::dispatcher::UpdateHandler;

/// Delay before asking again after a failed `getUpdates`.
const ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Fetch updates with `getUpdates` until `shutdown` fires.
///
/// Updates are handled one at a time in arrival order, which keeps "last vote
/// wins" in the ledger matching the order votes were cast.
pub async fn run_long_polling<S: Shuffler>(
    client: Arc<TelegramClient>,
    handler: UpdateHandler<TelegramClient, S>,
    wait: Duration,
    shutdown: CancellationToken,
) {
    info!("Long polling started (wait {:?})", wait);
    let mut offset = 0;

    loop {
        let batch = tokio::select! {
            _ = shutdown.cancelled() => break,
            batch = client.get_updates(offset, wait) => batch,
        };

        match batch {
            Ok(updates) => {
                for update in updates {
                    offset = offset.max(update.update_id + 1);
                    handler.handle(update).await;
                }
            }
            Err(e) => {
                warn!("getUpdates failed: {}", e);
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(ERROR_BACKOFF) => {}
                }
            }
        }
    }
    info!("Long polling stopped");
}
