use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, bail};

use lineup_core::trigger::TriggerKind;
use lineup_gateway::client::DEFAULT_API_URL;

/// How updates reach the bot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    LongPolling,
    Webhook,
}

impl FromStr for UpdateMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "long-polling" | "polling" => Ok(Self::LongPolling),
            "webhook" => Ok(Self::Webhook),
            other => Err(format!(
                "unknown update mode '{}', expected 'long-polling' or 'webhook'",
                other
            )),
        }
    }
}

/// Process configuration, read from `LINEUP_*` environment variables.
///
/// Holds the bot token, so it has no `Debug` impl.
pub struct Config {
    pub bot_token: String,
    pub api_url: String,
    pub db_path: PathBuf,
    pub host: String,
    pub port: u16,
    pub update_mode: UpdateMode,
    /// Public base URL Telegram should push updates to.
    pub webhook_url: Option<String>,
    pub webhook_secret: Option<String>,
    pub trigger: TriggerKind,
    pub sweep_interval: Duration,
    pub job_poll_interval: Duration,
    pub job_max_attempts: u32,
    pub job_max_workers: usize,
    pub job_retry_delay: Duration,
    /// Running job attempts older than this are returned to the queue.
    pub job_stale_after: Duration,
    pub soft_stop: Duration,
    pub hard_stop: Duration,
    pub db_conn_lifetime: Duration,
    pub log_verbose: bool,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        // Empty values count as unset.
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let bot_token = get("TELEGRAM_BOT_TOKEN").context("TELEGRAM_BOT_TOKEN is required")?;

        let update_mode: UpdateMode = parse_or(&get, "LINEUP_UPDATE_MODE", UpdateMode::LongPolling)?;
        let webhook_url = get("LINEUP_WEBHOOK_URL");
        if update_mode == UpdateMode::Webhook && webhook_url.is_none() {
            bail!("LINEUP_WEBHOOK_URL is required when LINEUP_UPDATE_MODE=webhook");
        }

        let job_max_attempts: u32 = parse_or(&get, "LINEUP_JOB_MAX_ATTEMPTS", 3)?;
        if job_max_attempts == 0 {
            bail!("LINEUP_JOB_MAX_ATTEMPTS must be at least 1");
        }
        let job_max_workers: usize = parse_or(&get, "LINEUP_JOB_MAX_WORKERS", 16)?;
        if job_max_workers == 0 {
            bail!("LINEUP_JOB_MAX_WORKERS must be at least 1");
        }

        Ok(Self {
            bot_token,
            api_url: get("LINEUP_TELEGRAM_API_URL").unwrap_or_else(|| DEFAULT_API_URL.into()),
            db_path: PathBuf::from(get("LINEUP_DB_PATH").unwrap_or_else(|| "lineup.db".into())),
            host: get("LINEUP_HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse_or(&get, "LINEUP_PORT", 8080)?,
            update_mode,
            webhook_url,
            webhook_secret: get("LINEUP_WEBHOOK_SECRET"),
            trigger: parse_or(&get, "LINEUP_TRIGGER", TriggerKind::Sweep)?,
            sweep_interval: seconds(&get, "LINEUP_SWEEP_INTERVAL_SECS", 10)?,
            job_poll_interval: seconds(&get, "LINEUP_JOB_POLL_INTERVAL_SECS", 1)?,
            job_max_attempts,
            job_max_workers,
            job_retry_delay: seconds(&get, "LINEUP_JOB_RETRY_DELAY_SECS", 30)?,
            job_stale_after: seconds(&get, "LINEUP_JOB_STALE_AFTER_SECS", 300)?,
            soft_stop: seconds(&get, "LINEUP_SOFT_STOP_SECS", 10)?,
            hard_stop: seconds(&get, "LINEUP_HARD_STOP_SECS", 10)?,
            db_conn_lifetime: seconds(&get, "LINEUP_DB_CONN_LIFETIME_SECS", 1800)?,
            log_verbose: parse_flag(get("LINEUP_LOG_VERBOSE").as_deref()),
        })
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {}='{}': {}", key, raw, e)),
        None => Ok(default),
    }
}

/// A whole number of seconds, at least one.
fn seconds<G>(get: &G, key: &str, default: u64) -> anyhow::Result<Duration>
where
    G: Fn(&str) -> Option<String>,
{
    let secs: u64 = parse_or(get, key, default)?;
    if secs == 0 {
        bail!("{} must be at least 1", key);
    }
    Ok(Duration::from_secs(secs))
}

fn parse_flag(raw: Option<&str>) -> bool {
    matches!(
        raw.map(|v| v.to_ascii_lowercase()).as_deref(),
        Some("1" | "true" | "yes" | "on")
    )
}
