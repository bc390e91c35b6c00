use rusqlite::Connection;
use tracing::info;

use crate::Result;

pub const LATEST_VERSION: i64 = 3;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |r| r.get(0),
    )?;

    if version < 1 {
        info!("Running migration v1 (polls, votes, results)");
        conn.execute_batch(
            "
            BEGIN;

            CREATE TABLE polls (
                id                  INTEGER PRIMARY KEY AUTOINCREMENT,
                poll_id             TEXT NOT NULL UNIQUE,
                chat_id             INTEGER NOT NULL,
                message_id          INTEGER NOT NULL,
                topic               TEXT NOT NULL,
                creator_id          INTEGER NOT NULL,
                creator_username    TEXT,
                creator_name        TEXT,
                started_at          TEXT NOT NULL,
                duration_seconds    INTEGER NOT NULL,
                ends_at             TEXT NOT NULL,
                status              TEXT NOT NULL DEFAULT 'active'
                                    CHECK (status IN ('active', 'processed')),
                results_message_id  INTEGER,
                processed_at        TEXT
            );

            CREATE INDEX idx_polls_due ON polls(status, ends_at);

            CREATE TABLE poll_votes (
                poll_id     TEXT NOT NULL,
                user_id     INTEGER NOT NULL,
                username    TEXT,
                name        TEXT,
                option_ids  TEXT NOT NULL,
                updated_at  TEXT NOT NULL,
                PRIMARY KEY (poll_id, user_id)
            );

            CREATE TABLE poll_results (
                poll_id       TEXT PRIMARY KEY,
                results_text  TEXT NOT NULL,
                created_at    TEXT NOT NULL
            );

            INSERT INTO schema_version (version) VALUES (1);

            COMMIT;
            ",
        )?;
    }

    if version < 2 {
        info!("Running migration v2 (job queue)");
        conn.execute_batch(
            "
            BEGIN;

            CREATE TABLE jobs (
                id            INTEGER PRIMARY KEY AUTOINCREMENT,
                kind          TEXT NOT NULL,
                args          TEXT NOT NULL,
                state         TEXT NOT NULL DEFAULT 'available'
                              CHECK (state IN ('available', 'running', 'completed', 'discarded')),
                attempt       INTEGER NOT NULL DEFAULT 0,
                max_attempts  INTEGER NOT NULL,
                scheduled_at  TEXT NOT NULL,
                last_error    TEXT,
                created_at    TEXT NOT NULL,
                finalized_at  TEXT
            );

            CREATE INDEX idx_jobs_fetch ON jobs(state, scheduled_at);

            INSERT INTO schema_version (version) VALUES (2);

            COMMIT;
            ",
        )?;
    }

    if version < 3 {
        info!("Running migration v3 (job claim time)");
        conn.execute_batch(
            "
            BEGIN;

            ALTER TABLE jobs ADD COLUMN claimed_at TEXT;

            INSERT INTO schema_version (version) VALUES (3);

            COMMIT;
            ",
        )?;
    }

    info!("Database migrations complete");
    Ok(())
}
