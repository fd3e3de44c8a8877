//! Shared SQLite handle and schema bootstrap.
//!
//! One connection behind a mutex; all statements are short-lived. The
//! ledger's optimistic concurrency lives in the SQL (`WHERE version = ?`),
//! not in lock scope, so the mutex is a serialization detail, not a
//! correctness mechanism.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::Connection;

use crate::error::Result;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS accounts (
    user_id TEXT PRIMARY KEY,
    balance INTEGER NOT NULL,
    version INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS audit_log (
    id       INTEGER PRIMARY KEY AUTOINCREMENT,
    at       TEXT NOT NULL,
    user_id  TEXT NOT NULL,
    job_id   TEXT,
    kind     TEXT NOT NULL,
    amount   INTEGER,
    detail   TEXT
);
CREATE INDEX IF NOT EXISTS idx_audit_job ON audit_log(job_id);
CREATE INDEX IF NOT EXISTS idx_audit_user ON audit_log(user_id);

CREATE TABLE IF NOT EXISTS jobs (
    id         TEXT PRIMARY KEY,
    user_id    TEXT NOT NULL,
    status     TEXT NOT NULL,
    version    INTEGER NOT NULL,
    updated_at TEXT NOT NULL,
    record     TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_jobs_user ON jobs(user_id);
CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
"#;

pub struct Db {
    conn: Mutex<Connection>,
}

pub type SharedDb = Arc<Db>;

impl Db {
    pub fn open(path: &Path) -> Result<SharedDb> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| crate::error::ForgeError::Internal(format!("create data dir: {e}")))?;
        }
        let conn = Connection::open(path)?;
        Self::bootstrap(conn)
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<SharedDb> {
        Self::bootstrap(Connection::open_in_memory()?)
    }

    fn bootstrap(conn: Connection) -> Result<SharedDb> {
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Arc::new(Self {
            conn: Mutex::new(conn),
        }))
    }

    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("db mutex poisoned")
    }
}
