pub mod jobs;
pub mod migrations;
pub mod models;
pub mod queries;

use rusqlite::{Connection, OpenFlags};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info};

/// Readers on top of the single writer: five connections in total.
const READER_POOL_SIZE: usize = 4;

/// Connections older than this are closed and reopened on next checkout.
pub const DEFAULT_CONN_LIFETIME: Duration = Duration::from_secs(30 * 60);

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json column error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("bad timestamp '{value}': {source}")]
    Timestamp {
        value: String,
        source: chrono::ParseError,
    },
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("{0} connection lock poisoned")]
    LockPoisoned(&'static str),
    #[error("blocking database task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, DbError>;

struct PooledConn {
    conn: Connection,
    opened_at: Instant,
}

impl PooledConn {
    fn new(conn: Connection) -> Self {
        Self {
            conn,
            opened_at: Instant::now(),
        }
    }
}

/// Poll database with a reader/writer split.
///
/// Every mutation goes through the single writer connection, so each query
/// method is one statement or one transaction. Reads round-robin over a small
/// pool of read-only connections. All connections are recycled once they
/// outlive `max_lifetime`.
pub struct Database {
    path: PathBuf,
    max_lifetime: Duration,
    writer: Mutex<PooledConn>,
    readers: Vec<Mutex<PooledConn>>,
    reader_idx: AtomicUsize,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_lifetime(path, DEFAULT_CONN_LIFETIME)
    }

    pub fn open_with_lifetime(path: &Path, max_lifetime: Duration) -> Result<Self> {
        let writer = open_writer(path)?;

        migrations::run(&writer)?;

        let mut readers = Vec::with_capacity(READER_POOL_SIZE);
        for _ in 0..READER_POOL_SIZE {
            readers.push(Mutex::new(PooledConn::new(open_reader(path)?)));
        }

        info!(
            "Database opened at {} (1 writer + {} readers)",
            path.display(),
            READER_POOL_SIZE
        );
        Ok(Self {
            path: path.to_path_buf(),
            max_lifetime,
            writer: Mutex::new(PooledConn::new(writer)),
            readers,
            reader_idx: AtomicUsize::new(0),
        })
    }

    pub fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let idx = self.reader_idx.fetch_add(1, Ordering::Relaxed) % self.readers.len();
        let guard = self.checkout(&self.readers[idx], "reader", open_reader)?;
        f(&guard.conn)
    }

    pub fn with_conn_mut<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T>,
    {
        let mut guard = self.checkout(&self.writer, "writer", open_writer)?;
        f(&mut guard.conn)
    }

    /// Run a blocking database closure on the blocking thread pool.
    pub async fn call<F, T>(self: &Arc<Self>, f: F) -> Result<T>
    where
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = Arc::clone(self);
        tokio::task::spawn_blocking(move || f(&db)).await?
    }

    fn checkout<'a>(
        &self,
        slot: &'a Mutex<PooledConn>,
        label: &'static str,
        reopen: fn(&Path) -> Result<Connection>,
    ) -> Result<MutexGuard<'a, PooledConn>> {
        let mut guard = slot.lock().map_err(|_| DbError::LockPoisoned(label))?;
        if guard.opened_at.elapsed() >= self.max_lifetime {
            debug!("Recycling {} connection after {:?}", label, guard.opened_at.elapsed());
            *guard = PooledConn::new(reopen(&self.path)?);
        }
        Ok(guard)
    }
}

fn open_writer(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;

    // WAL mode so readers never block the writer
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(conn)
}

fn open_reader(path: &Path) -> Result<Connection> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(conn)
}
