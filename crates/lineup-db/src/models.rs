//! Database row types. These map directly to SQLite rows and stay distinct
//! from the lineup-types models so the storage layout can change on its own.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Row;

use lineup_types::models::{Identity, Poll, PollResult, PollStatus, Vote};

use crate::{DbError, Result};

/// Timestamps are stored as fixed-width RFC 3339 UTC text so that string
/// comparison in SQL orders them chronologically.
pub fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub fn parse_ts(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|source| DbError::Timestamp {
            value: value.to_string(),
            source,
        })
}

fn parse_opt_ts(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value.as_deref().map(parse_ts).transpose()
}

pub const POLL_COLUMNS: &str = "poll_id, chat_id, message_id, topic, creator_id, creator_username, \
     creator_name, started_at, duration_seconds, ends_at, status, results_message_id, processed_at";

pub struct PollRow {
    pub poll_id: String,
    pub chat_id: i64,
    pub message_id: i64,
    pub topic: String,
    pub creator_id: i64,
    pub creator_username: Option<String>,
    pub creator_name: Option<String>,
    pub started_at: String,
    pub duration_seconds: i64,
    pub ends_at: String,
    pub status: String,
    pub results_message_id: Option<i64>,
    pub processed_at: Option<String>,
}

impl PollRow {
    /// Read a row selected with [`POLL_COLUMNS`].
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            poll_id: row.get(0)?,
            chat_id: row.get(1)?,
            message_id: row.get(2)?,
            topic: row.get(3)?,
            creator_id: row.get(4)?,
            creator_username: row.get(5)?,
            creator_name: row.get(6)?,
            started_at: row.get(7)?,
            duration_seconds: row.get(8)?,
            ends_at: row.get(9)?,
            status: row.get(10)?,
            results_message_id: row.get(11)?,
            processed_at: row.get(12)?,
        })
    }
}

impl TryFrom<PollRow> for Poll {
    type Error = DbError;

    fn try_from(row: PollRow) -> Result<Self> {
        let status: PollStatus = row
            .status
            .parse()
            .map_err(|e| DbError::Corrupt(format!("poll {}: {}", row.poll_id, e)))?;
        Ok(Poll {
            creator: Identity::new(row.creator_id, row.creator_username, row.creator_name),
            started_at: parse_ts(&row.started_at)?,
            ends_at: parse_ts(&row.ends_at)?,
            processed_at: parse_opt_ts(row.processed_at)?,
            status,
            poll_id: row.poll_id,
            chat_id: row.chat_id,
            message_id: row.message_id,
            topic: row.topic,
            duration_seconds: row.duration_seconds,
            results_message_id: row.results_message_id,
        })
    }
}

pub struct VoteRow {
    pub poll_id: String,
    pub user_id: i64,
    pub username: Option<String>,
    pub name: Option<String>,
    pub option_ids: String,
    pub updated_at: String,
}

impl TryFrom<VoteRow> for Vote {
    type Error = DbError;

    fn try_from(row: VoteRow) -> Result<Self> {
        Ok(Vote {
            voter: Identity::new(row.user_id, row.username, row.name),
            option_ids: serde_json::from_str(&row.option_ids)?,
            updated_at: parse_ts(&row.updated_at)?,
            poll_id: row.poll_id,
        })
    }
}

pub struct ResultRow {
    pub poll_id: String,
    pub results_text: String,
    pub created_at: String,
}

impl TryFrom<ResultRow> for PollResult {
    type Error = DbError;

    fn try_from(row: ResultRow) -> Result<Self> {
        Ok(PollResult {
            created_at: parse_ts(&row.created_at)?,
            poll_id: row.poll_id,
            results_text: row.results_text,
        })
    }
}
