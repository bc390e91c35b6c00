use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Tokens fired by process signals. The first signal cancels `soft`, a
/// second one cancels `hard`.
#[derive(Clone)]
pub struct Shutdown {
    pub soft: CancellationToken,
    pub hard: CancellationToken,
}

impl Shutdown {
    /// Start listening for SIGINT/SIGTERM in the background.
    pub fn listen() -> Self {
        let shutdown = Self {
            soft: CancellationToken::new(),
            hard: CancellationToken::new(),
        };
        let tokens = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            tokens.soft.cancel();
            shutdown_signal().await;
            warn!("Second signal received, stopping immediately");
            tokens.hard.cancel();
        });
        shutdown
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                ctrl_c.await.ok();
                info!("Received Ctrl+C, shutting down...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Every task finished inside the soft-stop window.
    Graceful,
    /// Remaining tasks were aborted and have exited.
    Aborted,
    /// Aborted tasks were still running when the hard-stop window ran out.
    TimedOut,
}

/// Wait for `tasks` to wind down after the soft token was cancelled.
///
/// Tasks get `soft_stop` to finish on their own, cut short if `hard` fires.
/// Whatever is left is aborted and given `hard_stop` to unwind.
pub async fn drain(
    mut tasks: JoinSet<&'static str>,
    hard: &CancellationToken,
    soft_stop: Duration,
    hard_stop: Duration,
) -> StopOutcome {
    info!("Waiting up to {:?} for {} tasks to finish", soft_stop, tasks.len());

    let finished = tokio::select! {
        r = tokio::time::timeout(soft_stop, join_all(&mut tasks)) => r.is_ok(),
        _ = hard.cancelled() => false,
    };
    if finished {
        info!("All tasks stopped");
        return StopOutcome::Graceful;
    }

    warn!("Soft stop over, aborting {} remaining tasks", tasks.len());
    tasks.abort_all();
    match tokio::time::timeout(hard_stop, join_all(&mut tasks)).await {
        Ok(()) => StopOutcome::Aborted,
        Err(_) => {
            error!("{} tasks still running after hard stop", tasks.len());
            StopOutcome::TimedOut
        }
    }
}

async fn join_all(tasks: &mut JoinSet<&'static str>) {
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(name) => debug!("Task '{}' stopped", name),
            Err(e) if e.is_cancelled() => debug!("Task aborted"),
            Err(e) => error!("Task panicked: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_drain_graceful() {
        let token = CancellationToken::new();
        let mut tasks = JoinSet::new();
        let t = token.clone();
        tasks.spawn(async move {
            t.cancelled().await;
            "worker"
        });
        token.cancel();

        let outcome = drain(tasks, &CancellationToken::new(), Duration::from_secs(5), Duration::from_secs(5)).await;
        assert_eq!(outcome, StopOutcome::Graceful);
    }

    #[tokio::test]
    async fn test_drain_aborts_stuck_task() {
        let mut tasks = JoinSet::new();
        tasks.spawn(async {
            std::future::pending::<()>().await;
            "stuck"
        });

        let outcome = drain(tasks, &CancellationToken::new(), Duration::from_millis(20), Duration::from_secs(5)).await;
        assert_eq!(outcome, StopOutcome::Aborted);
    }

    #[tokio::test]
    async fn test_hard_signal_skips_soft_window() {
        let mut tasks = JoinSet::new();
        tasks.spawn(async {
            std::future::pending::<()>().await;
            "stuck"
        });
        let hard = CancellationToken::new();
        hard.cancel();

        let started = std::time::Instant::now();
        let outcome = drain(tasks, &hard, Duration::from_secs(60), Duration::from_secs(5)).await;
        assert_eq!(outcome, StopOutcome::Aborted);
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
