use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use lineup_types::models::{ATTENDING_OPTION, Attendee, Identity, Poll, PollResult, Vote};

use crate::jobs::{NewJob, insert_job};
use crate::models::{POLL_COLUMNS, PollRow, ResultRow, VoteRow, fmt_ts};
use crate::{Database, Result};

impl Database {
    // -- Poll registry --

    /// Insert a new active poll. A poll id that is already registered is left
    /// untouched; returns whether a row was inserted.
    pub fn register_poll(&self, poll: &Poll) -> Result<bool> {
        self.with_conn_mut(|conn| insert_poll(conn, poll))
    }

    /// Register a poll and enqueue its finalization job in one transaction.
    /// The job is only enqueued when the poll row is new.
    pub fn register_poll_scheduled(&self, poll: &Poll, job: &NewJob) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let inserted = insert_poll(&tx, poll)?;
            if inserted {
                insert_job(&tx, job)?;
            }
            tx.commit()?;
            Ok(inserted)
        })
    }

    pub fn get_poll(&self, poll_id: &str) -> Result<Option<Poll>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {} FROM polls WHERE poll_id = ?1", POLL_COLUMNS);
            let row = conn
                .query_row(&sql, [poll_id], PollRow::from_row)
                .optional()?;
            row.map(Poll::try_from).transpose()
        })
    }

    /// Active polls whose end time is at or before `now`. No ordering.
    pub fn find_due(&self, now: DateTime<Utc>) -> Result<Vec<Poll>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM polls WHERE status = 'active' AND ends_at <= ?1",
                POLL_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([fmt_ts(now)], PollRow::from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows.into_iter().map(Poll::try_from).collect()
        })
    }

    /// Close a poll: flip it to `processed` and record its results, atomically.
    ///
    /// Returns `false` when the poll was not active (already processed or
    /// unknown); in that case nothing about the poll row changes and an
    /// existing result record is kept.
    pub fn mark_processed(
        &self,
        poll_id: &str,
        results_text: &str,
        results_message_id: i64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let now = fmt_ts(now);
            let updated = tx.execute(
                "UPDATE polls SET status = 'processed', processed_at = ?2, results_message_id = ?3
                 WHERE poll_id = ?1 AND status = 'active'",
                params![poll_id, now, results_message_id],
            )?;
            if updated == 1 {
                tx.execute(
                    "INSERT INTO poll_results (poll_id, results_text, created_at) VALUES (?1, ?2, ?3)
                     ON CONFLICT (poll_id) DO NOTHING",
                    params![poll_id, results_text, now],
                )?;
            }
            tx.commit()?;
            Ok(updated == 1)
        })
    }

    pub fn get_result(&self, poll_id: &str) -> Result<Option<PollResult>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT poll_id, results_text, created_at FROM poll_results WHERE poll_id = ?1",
                    [poll_id],
                    |row| {
                        Ok(ResultRow {
                            poll_id: row.get(0)?,
                            results_text: row.get(1)?,
                            created_at: row.get(2)?,
                        })
                    },
                )
                .optional()?;
            row.map(PollResult::try_from).transpose()
        })
    }

    // -- Vote ledger --

    /// Insert or replace the voter's current choice. The latest call wins.
    pub fn upsert_vote(
        &self,
        poll_id: &str,
        voter: &Identity,
        option_ids: &[i64],
        now: DateTime<Utc>,
    ) -> Result<()> {
        let option_ids = serde_json::to_string(option_ids)?;
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO poll_votes (poll_id, user_id, username, name, option_ids, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT (poll_id, user_id) DO UPDATE SET
                    username = excluded.username,
                    name = excluded.name,
                    option_ids = excluded.option_ids,
                    updated_at = excluded.updated_at",
                params![
                    poll_id,
                    voter.id,
                    voter.username,
                    voter.name,
                    option_ids,
                    fmt_ts(now)
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_vote(&self, poll_id: &str, user_id: i64) -> Result<Option<Vote>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT poll_id, user_id, username, name, option_ids, updated_at
                     FROM poll_votes WHERE poll_id = ?1 AND user_id = ?2",
                    params![poll_id, user_id],
                    |row| {
                        Ok(VoteRow {
                            poll_id: row.get(0)?,
                            user_id: row.get(1)?,
                            username: row.get(2)?,
                            name: row.get(3)?,
                            option_ids: row.get(4)?,
                            updated_at: row.get(5)?,
                        })
                    },
                )
                .optional()?;
            row.map(Vote::try_from).transpose()
        })
    }

    /// Voters whose current option set includes the "coming" option.
    pub fn get_attendees(&self, poll_id: &str) -> Result<Vec<Attendee>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT v.user_id, v.username, v.name FROM poll_votes v
                 WHERE v.poll_id = ?1
                   AND EXISTS (SELECT 1 FROM json_each(v.option_ids) WHERE json_each.value = ?2)",
            )?;
            let rows = stmt
                .query_map(params![poll_id, ATTENDING_OPTION], |row| {
                    Ok(Identity::new(row.get(0)?, row.get(1)?, row.get(2)?))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

fn insert_poll(conn: &Connection, poll: &Poll) -> Result<bool> {
    let inserted = conn.execute(
        "INSERT INTO polls (poll_id, chat_id, message_id, topic, creator_id, creator_username,
                            creator_name, started_at, duration_seconds, ends_at, status)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 'active')
         ON CONFLICT (poll_id) DO NOTHING",
        params![
            poll.poll_id,
            poll.chat_id,
            poll.message_id,
            poll.topic,
            poll.creator.id,
            poll.creator.username,
            poll.creator.name,
            fmt_ts(poll.started_at),
            poll.duration_seconds,
            fmt_ts(poll.ends_at),
        ],
    )?;
    Ok(inserted == 1)
}
