use chrono::{DateTime, Utc};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::error::{EngineError, Result};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS documents (
        id                         TEXT PRIMARY KEY,
        generation_code            TEXT NOT NULL UNIQUE,
        control_number             TEXT NOT NULL,
        document_type              TEXT NOT NULL,
        environment                TEXT NOT NULL,
        status                     TEXT NOT NULL,
        original_content           TEXT NOT NULL,
        signed_envelope            TEXT,
        receipt_stamp              TEXT,
        observations               TEXT,
        attempt_count              INTEGER NOT NULL DEFAULT 0,
        processed_at               INTEGER,
        needs_reconciliation       INTEGER NOT NULL DEFAULT 0,
        last_failure               TEXT,
        annulment_generation_code  TEXT,
        annulment_receipt_stamp    TEXT,
        lease_holder               TEXT,
        lease_expires_at           INTEGER,
        created_at                 INTEGER NOT NULL,
        updated_at                 INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_documents_status ON documents (status);

    CREATE TABLE IF NOT EXISTS document_events (
        id           INTEGER PRIMARY KEY AUTOINCREMENT,
        document_id  TEXT NOT NULL REFERENCES documents (id) ON DELETE CASCADE,
        action       TEXT NOT NULL,
        outcome      TEXT NOT NULL,
        message      TEXT NOT NULL,
        data         TEXT,
        created_at   INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_document_events_document ON document_events (document_id, id);

    CREATE TABLE IF NOT EXISTS control_sequences (
        document_type  TEXT NOT NULL,
        establishment  TEXT NOT NULL,
        last_value     INTEGER NOT NULL,
        PRIMARY KEY (document_type, establishment)
    );

    CREATE TABLE IF NOT EXISTS transmission_jobs (
        id             TEXT PRIMARY KEY,
        document_id    TEXT NOT NULL,
        tenant_id      TEXT NOT NULL,
        identity       TEXT NOT NULL,
        environment    TEXT NOT NULL,
        attempts       INTEGER NOT NULL DEFAULT 0,
        max_attempts   INTEGER NOT NULL,
        base_delay_ms  INTEGER NOT NULL,
        max_delay_ms   INTEGER NOT NULL,
        state          TEXT NOT NULL,
        run_at         INTEGER NOT NULL,
        last_error     TEXT,
        locked_by      TEXT,
        locked_at      INTEGER,
        created_at     INTEGER NOT NULL,
        updated_at     INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_jobs_due ON transmission_jobs (state, run_at);
    CREATE INDEX IF NOT EXISTS idx_jobs_document ON transmission_jobs (document_id);
    CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_open_document ON transmission_jobs (document_id)
        WHERE state IN ('WAITING', 'ACTIVE');
"#;

/// Shared SQLite handle used by the document store and the job queue.
///
/// Several processes may open the same file; claims run inside IMMEDIATE
/// transactions so the compare-and-swap holds across them.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| EngineError::Storage("connection mutex poisoned".to_string()))
    }

    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.lock()?;
        f(&conn)
    }

    /// Run `f` inside an IMMEDIATE transaction, committing on success.
    pub fn with_tx<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }
}

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| EngineError::Storage(format!("timestamp out of range: {}", ms)))
}

pub(crate) fn parse_column<T>(value: &str) -> Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    value.parse::<T>().map_err(EngineError::Storage)
}
