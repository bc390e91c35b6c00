mod config;
mod shutdown;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::task::JoinSet;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use lineup_api::WEBHOOK_PATH;
use lineup_api::state::AppStateInner;
use lineup_core::results::RandomShuffler;
use lineup_core::service::{PollService, Scheduling};
use lineup_core::trigger::{JobTrigger, JobWorkerConfig, SweepTrigger, Trigger, TriggerKind};
use lineup_db::Database;
use lineup_gateway::client::TelegramClient;
use lineup_gateway::dispatcher::UpdateHandler;
use lineup_gateway::polling::run_long_polling;

use crate::config::{Config, UpdateMode};
use crate::shutdown::Shutdown;

/// How long a single `getUpdates` call waits for new updates.
const LONG_POLL_WAIT: std::time::Duration = std::time::Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lineup=debug,tower_http=debug".into()),
        )
        .init();

    let config = Config::from_env()?;

    // Init database
    let db = Arc::new(
        Database::open_with_lifetime(&config.db_path, config.db_conn_lifetime)
            .with_context(|| format!("opening database {}", config.db_path.display()))?,
    );

    // Bot API client
    let client = Arc::new(
        TelegramClient::new(&config.api_url, &config.bot_token)?.with_verbose(config.log_verbose),
    );
    let me = client.get_me().await.context("getMe failed, check TELEGRAM_BOT_TOKEN")?;
    let bot_username = me.username.context("bot account has no username")?;
    info!("Authorized on account @{}", bot_username);

    let scheduling = match config.trigger {
        TriggerKind::Sweep => Scheduling::Sweep,
        TriggerKind::Job => Scheduling::Job {
            max_attempts: config.job_max_attempts,
        },
    };
    let service = PollService::new(db.clone(), client.clone(), Arc::new(RandomShuffler), scheduling);

    let trigger = match config.trigger {
        TriggerKind::Sweep => Trigger::Sweep(SweepTrigger::new(service.clone(), config.sweep_interval)),
        TriggerKind::Job => Trigger::Job(JobTrigger::new(
            service.clone(),
            JobWorkerConfig {
                poll_interval: config.job_poll_interval,
                max_workers: config.job_max_workers,
                retry_delay: chrono::TimeDelta::from_std(config.job_retry_delay)?,
                stale_after: chrono::TimeDelta::from_std(config.job_stale_after)?,
            },
        )),
    };
    info!("Finalization trigger: {}", trigger.kind());

    let updates = UpdateHandler::new(service, bot_username);
    let shutdown = Shutdown::listen();
    let mut tasks: JoinSet<&'static str> = JoinSet::new();

    let token = shutdown.soft.clone();
    tasks.spawn(async move {
        trigger.run(token).await;
        "trigger"
    });

    match config.update_mode {
        UpdateMode::LongPolling => {
            // getUpdates is refused while a webhook is registered.
            client.delete_webhook().await.context("deleteWebhook failed")?;
            let client = client.clone();
            let handler = updates.clone();
            let token = shutdown.soft.clone();
            tasks.spawn(async move {
                run_long_polling(client, handler, LONG_POLL_WAIT, token).await;
                "long-polling"
            });
        }
        UpdateMode::Webhook => {
            let base = config.webhook_url.as_deref().unwrap_or_default();
            let url = format!("{}{}", base.trim_end_matches('/'), WEBHOOK_PATH);
            client
                .set_webhook(&url, config.webhook_secret.as_deref())
                .await
                .context("setWebhook failed")?;
            info!("Webhook registered at {}", url);
        }
    }

    // HTTP surface
    let state = Arc::new(AppStateInner {
        db,
        updates,
        webhook_secret: config.webhook_secret.clone(),
    });
    let app = lineup_api::router(state, config.update_mode == UpdateMode::Webhook)
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Lineup server listening on {}", addr);

    let token = shutdown.soft.clone();
    tasks.spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(token.cancelled_owned())
            .await
        {
            error!("HTTP server error: {}", e);
        }
        "http"
    });

    tokio::select! {
        _ = shutdown.soft.cancelled() => {}
        Some(joined) = tasks.join_next() => {
            warn!("Task exited early ({:?}), shutting down", joined.map_err(|e| e.to_string()));
            shutdown.soft.cancel();
        }
    }

    let outcome = shutdown::drain(tasks, &shutdown.hard, config.soft_stop, config.hard_stop).await;
    info!("Shutdown complete ({:?})", outcome);
    Ok(())
}
