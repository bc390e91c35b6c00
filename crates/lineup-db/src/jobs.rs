//! Durable job queue backing the scheduled finalization strategy.
//!
//! Jobs move `available -> running -> completed`. A failed attempt goes back
//! to `available` until `max_attempts` is reached, after which the job is
//! `discarded` and needs an operator. Claims are a single `UPDATE ... RETURNING`
//! statement, so two workers never run the same attempt.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeDelta, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Serialize;
use serde::de::DeserializeOwned;

use lineup_types::jobs::FinishPollArgs;

use crate::models::{fmt_ts, parse_ts};
use crate::{Database, DbError, Result};

const JOB_COLUMNS: &str =
    "id, kind, args, state, attempt, max_attempts, scheduled_at, last_error, created_at, finalized_at, claimed_at";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Available,
    Running,
    Completed,
    Discarded,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Discarded => "discarded",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "available" => Ok(Self::Available),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "discarded" => Ok(Self::Discarded),
            other => Err(DbError::Corrupt(format!("unknown job state '{}'", other))),
        }
    }
}

/// A job to be inserted.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub kind: String,
    pub args: String,
    pub scheduled_at: DateTime<Utc>,
    pub max_attempts: u32,
}

impl NewJob {
    pub fn new<A: Serialize>(
        kind: &str,
        args: &A,
        scheduled_at: DateTime<Utc>,
        max_attempts: u32,
    ) -> Result<Self> {
        Ok(Self {
            kind: kind.to_string(),
            args: serde_json::to_string(args)?,
            scheduled_at,
            max_attempts: max_attempts.max(1),
        })
    }

    pub fn finish_poll(
        args: &FinishPollArgs,
        run_at: DateTime<Utc>,
        max_attempts: u32,
    ) -> Result<Self> {
        Self::new(FinishPollArgs::KIND, args, run_at, max_attempts)
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: i64,
    pub kind: String,
    pub args: String,
    pub state: JobState,
    pub attempt: u32,
    pub max_attempts: u32,
    pub scheduled_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finalized_at: Option<DateTime<Utc>>,
    /// When the current or last attempt was claimed.
    pub claimed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn decode_args<A: DeserializeOwned>(&self) -> Result<A> {
        Ok(serde_json::from_str(&self.args)?)
    }
}

struct JobRow {
    id: i64,
    kind: String,
    args: String,
    state: String,
    attempt: u32,
    max_attempts: u32,
    scheduled_at: String,
    last_error: Option<String>,
    created_at: String,
    finalized_at: Option<String>,
    claimed_at: Option<String>,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            kind: row.get(1)?,
            args: row.get(2)?,
            state: row.get(3)?,
            attempt: row.get(4)?,
            max_attempts: row.get(5)?,
            scheduled_at: row.get(6)?,
            last_error: row.get(7)?,
            created_at: row.get(8)?,
            finalized_at: row.get(9)?,
            claimed_at: row.get(10)?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = DbError;

    fn try_from(row: JobRow) -> Result<Self> {
        Ok(Job {
            state: row.state.parse()?,
            scheduled_at: parse_ts(&row.scheduled_at)?,
            created_at: parse_ts(&row.created_at)?,
            finalized_at: row.finalized_at.as_deref().map(parse_ts).transpose()?,
            claimed_at: row.claimed_at.as_deref().map(parse_ts).transpose()?,
            id: row.id,
            kind: row.kind,
            args: row.args,
            attempt: row.attempt,
            max_attempts: row.max_attempts,
            last_error: row.last_error,
        })
    }
}

/// Outcome counts of [`Database::rescue_stuck_jobs`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RescueReport {
    pub requeued: usize,
    pub discarded: usize,
}

pub(crate) fn insert_job(conn: &Connection, job: &NewJob) -> Result<i64> {
    conn.execute(
        "INSERT INTO jobs (kind, args, max_attempts, scheduled_at, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            job.kind,
            job.args,
            job.max_attempts,
            fmt_ts(job.scheduled_at),
            fmt_ts(Utc::now())
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

impl Database {
    pub fn enqueue_job(&self, job: &NewJob) -> Result<i64> {
        self.with_conn_mut(|conn| insert_job(conn, job))
    }

    pub fn get_job(&self, id: i64) -> Result<Option<Job>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS);
            let row = conn.query_row(&sql, [id], JobRow::from_row).optional()?;
            row.map(Job::try_from).transpose()
        })
    }

    /// Claim up to `limit` available jobs of `kind` scheduled at or before
    /// `now`, moving them to `running` and bumping their attempt counter.
    pub fn claim_due_jobs(&self, kind: &str, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>> {
        self.with_conn_mut(|conn| {
            let sql = format!(
                "UPDATE jobs SET state = 'running', attempt = attempt + 1, claimed_at = ?2
                 WHERE id IN (
                    SELECT id FROM jobs
                    WHERE state = 'available' AND kind = ?1 AND scheduled_at <= ?2
                    ORDER BY scheduled_at, id
                    LIMIT ?3
                 )
                 RETURNING {}",
                JOB_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![kind, fmt_ts(now), limit as i64], JobRow::from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            let mut jobs = rows
                .into_iter()
                .map(Job::try_from)
                .collect::<Result<Vec<_>>>()?;
            jobs.sort_by_key(|j| (j.scheduled_at, j.id));
            Ok(jobs)
        })
    }

    pub fn complete_job(&self, id: i64, now: DateTime<Utc>) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "UPDATE jobs SET state = 'completed', finalized_at = ?2, last_error = NULL
                 WHERE id = ?1 AND state = 'running'",
                params![id, fmt_ts(now)],
            )?;
            Ok(())
        })
    }

    /// Record a failed attempt. The job becomes available again after
    /// `retry_delay`, or is discarded when no attempts remain. Returns the new
    /// state, or `None` if the job was not running.
    pub fn fail_job(
        &self,
        id: i64,
        error: &str,
        now: DateTime<Utc>,
        retry_delay: TimeDelta,
    ) -> Result<Option<JobState>> {
        self.with_conn_mut(|conn| {
            let state: Option<String> = conn
                .query_row(
                    "UPDATE jobs SET
                        state = CASE WHEN attempt >= max_attempts THEN 'discarded' ELSE 'available' END,
                        finalized_at = CASE WHEN attempt >= max_attempts THEN ?3 ELSE NULL END,
                        scheduled_at = CASE WHEN attempt >= max_attempts THEN scheduled_at ELSE ?4 END,
                        last_error = ?2
                     WHERE id = ?1 AND state = 'running'
                     RETURNING state",
                    params![id, error, fmt_ts(now), fmt_ts(now + retry_delay)],
                    |row| row.get(0),
                )
                .optional()?;
            state.map(|s| s.parse()).transpose()
        })
    }

    /// Return jobs still `running` that were claimed at or before
    /// `claimed_before` to the queue, or discard them when their attempts are
    /// used up. Covers workers that died mid-attempt and attempts whose
    /// outcome could not be recorded.
    pub fn rescue_stuck_jobs(
        &self,
        now: DateTime<Utc>,
        claimed_before: DateTime<Utc>,
    ) -> Result<RescueReport> {
        self.with_conn_mut(|conn| {
            let mut stmt = conn.prepare(
                "UPDATE jobs SET
                    state = CASE WHEN attempt >= max_attempts THEN 'discarded' ELSE 'available' END,
                    finalized_at = CASE WHEN attempt >= max_attempts THEN ?1 ELSE NULL END,
                    last_error = 'interrupted before completion'
                 WHERE state = 'running' AND (claimed_at IS NULL OR claimed_at <= ?2)
                 RETURNING state",
            )?;
            let states = stmt
                .query_map(params![fmt_ts(now), fmt_ts(claimed_before)], |row| {
                    row.get::<_, String>(0)
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let mut report = RescueReport::default();
            for state in states {
                match state.parse()? {
                    JobState::Discarded => report.discarded += 1,
                    _ => report.requeued += 1,
                }
            }
            Ok(report)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::temp_db;

    fn args(poll_id: &str) -> FinishPollArgs {
        FinishPollArgs {
            poll_id: poll_id.into(),
            chat_id: -5,
            message_id: 9,
            topic: "Practice".into(),
        }
    }

    #[test]
    fn test_claim_only_due_jobs() {
        let db = temp_db();
        let now = Utc::now();
        let due = db
            .enqueue_job(&NewJob::finish_poll(&args("due"), now, 3).unwrap())
            .unwrap();
        db.enqueue_job(&NewJob::finish_poll(&args("later"), now + TimeDelta::minutes(5), 3).unwrap())
            .unwrap();

        let claimed = db.claim_due_jobs(FinishPollArgs::KIND, now, 10).unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, due);
        assert_eq!(claimed[0].state, JobState::Running);
        assert_eq!(claimed[0].attempt, 1);
        assert_eq!(claimed[0].decode_args::<FinishPollArgs>().unwrap(), args("due"));

        // Already running: a second claim gets nothing.
        assert!(db.claim_due_jobs(FinishPollArgs::KIND, now, 10).unwrap().is_empty());
        assert!(db.claim_due_jobs("other_kind", now + TimeDelta::hours(1), 10).unwrap().is_empty());
    }

    #[test]
    fn test_claim_respects_limit() {
        let db = temp_db();
        let now = Utc::now();
        for i in 0..5 {
            db.enqueue_job(&NewJob::finish_poll(&args(&format!("p{i}")), now, 1).unwrap())
                .unwrap();
        }
        assert_eq!(db.claim_due_jobs(FinishPollArgs::KIND, now, 2).unwrap().len(), 2);
        assert_eq!(db.claim_due_jobs(FinishPollArgs::KIND, now, 10).unwrap().len(), 3);
    }

    #[test]
    fn test_complete_job() {
        let db = temp_db();
        let now = Utc::now();
        let id = db.enqueue_job(&NewJob::finish_poll(&args("p"), now, 1).unwrap()).unwrap();
        db.claim_due_jobs(FinishPollArgs::KIND, now, 1).unwrap();
        db.complete_job(id, now).unwrap();

        let job = db.get_job(id).unwrap().unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.finalized_at, Some(now));
    }

    #[test]
    fn test_failed_job_retries_then_discards() {
        let db = temp_db();
        let now = Utc::now();
        let delay = TimeDelta::seconds(30);
        let id = db.enqueue_job(&NewJob::finish_poll(&args("p"), now, 2).unwrap()).unwrap();

        db.claim_due_jobs(FinishPollArgs::KIND, now, 1).unwrap();
        assert_eq!(
            db.fail_job(id, "gateway down", now, delay).unwrap(),
            Some(JobState::Available)
        );
        // Not due again until the retry delay has passed.
        assert!(db.claim_due_jobs(FinishPollArgs::KIND, now, 1).unwrap().is_empty());

        let retry_at = now + delay;
        let claimed = db.claim_due_jobs(FinishPollArgs::KIND, retry_at, 1).unwrap();
        assert_eq!(claimed[0].attempt, 2);
        assert_eq!(claimed[0].last_error.as_deref(), Some("gateway down"));
        assert_eq!(
            db.fail_job(id, "still down", retry_at, delay).unwrap(),
            Some(JobState::Discarded)
        );

        let job = db.get_job(id).unwrap().unwrap();
        assert_eq!(job.state, JobState::Discarded);
        assert_eq!(job.attempt, job.max_attempts);
        assert!(
            db.claim_due_jobs(FinishPollArgs::KIND, retry_at + TimeDelta::hours(1), 1)
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn test_fail_job_ignores_jobs_not_running() {
        let db = temp_db();
        let id = db
            .enqueue_job(&NewJob::finish_poll(&args("p"), Utc::now(), 1).unwrap())
            .unwrap();
        assert_eq!(db.fail_job(id, "x", Utc::now(), TimeDelta::zero()).unwrap(), None);
    }

    #[test]
    fn test_rescue_stuck_jobs() {
        let db = temp_db();
        let now = Utc::now();
        let retryable = db.enqueue_job(&NewJob::finish_poll(&args("a"), now, 3).unwrap()).unwrap();
        let exhausted = db.enqueue_job(&NewJob::finish_poll(&args("b"), now, 1).unwrap()).unwrap();
        db.claim_due_jobs(FinishPollArgs::KIND, now, 10).unwrap();

        let report = db.rescue_stuck_jobs(now, now).unwrap();
        assert_eq!(report, RescueReport { requeued: 1, discarded: 1 });
        assert_eq!(db.get_job(retryable).unwrap().unwrap().state, JobState::Available);
        assert_eq!(db.get_job(exhausted).unwrap().unwrap().state, JobState::Discarded);
    }

    #[test]
    fn test_rescue_skips_recent_claims() {
        let db = temp_db();
        let now = Utc::now();
        let old = db.enqueue_job(&NewJob::finish_poll(&args("old"), now, 3).unwrap()).unwrap();
        let fresh = db.enqueue_job(&NewJob::finish_poll(&args("fresh"), now, 3).unwrap()).unwrap();
        db.claim_due_jobs(FinishPollArgs::KIND, now, 1).unwrap();
        let later = now + TimeDelta::minutes(10);
        db.claim_due_jobs(FinishPollArgs::KIND, later, 1).unwrap();
        assert_eq!(db.get_job(old).unwrap().unwrap().claimed_at, Some(now));

        // Only the attempt claimed before the cutoff goes back to the queue.
        let report = db
            .rescue_stuck_jobs(later, later - TimeDelta::minutes(5))
            .unwrap();
        assert_eq!(report, RescueReport { requeued: 1, discarded: 0 });
        assert_eq!(db.get_job(old).unwrap().unwrap().state, JobState::Available);
        assert_eq!(db.get_job(fresh).unwrap().unwrap().state, JobState::Running);
    }
}
