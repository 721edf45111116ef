use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info};
use uuid::Uuid;

use super::sqlite::{from_millis, parse_column, to_millis, Database};
use crate::app::ports::JobQueue;
use crate::domain::{Environment, JobState, RetryPolicy, TransmissionJob};
use crate::error::{EngineError, Result};

const JOB_COLUMNS: &str = "id, document_id, tenant_id, identity, environment, attempts, max_attempts, \
    base_delay_ms, max_delay_ms, state, run_at, last_error, locked_by, created_at, updated_at";

struct JobRow {
    id: String,
    document_id: String,
    tenant_id: String,
    identity: String,
    environment: String,
    attempts: i64,
    max_attempts: i64,
    base_delay_ms: i64,
    max_delay_ms: i64,
    state: String,
    run_at: i64,
    last_error: Option<String>,
    locked_by: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl JobRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            document_id: row.get(1)?,
            tenant_id: row.get(2)?,
            identity: row.get(3)?,
            environment: row.get(4)?,
            attempts: row.get(5)?,
            max_attempts: row.get(6)?,
            base_delay_ms: row.get(7)?,
            max_delay_ms: row.get(8)?,
            state: row.get(9)?,
            run_at: row.get(10)?,
            last_error: row.get(11)?,
            locked_by: row.get(12)?,
            created_at: row.get(13)?,
            updated_at: row.get(14)?,
        })
    }

    fn into_job(self) -> Result<TransmissionJob> {
        let parse_uuid = |s: &str| Uuid::parse_str(s).map_err(|e| EngineError::Storage(e.to_string()));
        Ok(TransmissionJob {
            id: parse_uuid(&self.id)?,
            document_id: parse_uuid(&self.document_id)?,
            tenant_id: self.tenant_id,
            identity: self.identity,
            environment: parse_column::<Environment>(&self.environment)?,
            attempts: self.attempts.max(0) as u32,
            policy: RetryPolicy {
                max_attempts: self.max_attempts.max(1) as u32,
                base_delay_ms: self.base_delay_ms.max(0) as u64,
                max_delay_ms: self.max_delay_ms.max(0) as u64,
            },
            state: parse_column::<JobState>(&self.state)?,
            run_at: from_millis(self.run_at)?,
            last_error: self.last_error,
            locked_by: self.locked_by,
            created_at: from_millis(self.created_at)?,
            updated_at: from_millis(self.updated_at)?,
        })
    }
}

fn load_job(conn: &Connection, job_id: Uuid) -> Result<Option<TransmissionJob>> {
    let sql = format!("SELECT {} FROM transmission_jobs WHERE id = ?1", JOB_COLUMNS);
    let row = conn
        .query_row(&sql, params![job_id.to_string()], JobRow::read)
        .optional()?;
    row.map(JobRow::into_job).transpose()
}

fn open_job_for(conn: &Connection, document_id: Uuid) -> Result<Option<TransmissionJob>> {
    let sql = format!(
        "SELECT {} FROM transmission_jobs
         WHERE document_id = ?1 AND state IN ('WAITING', 'ACTIVE')
         ORDER BY created_at LIMIT 1",
        JOB_COLUMNS
    );
    let row = conn
        .query_row(&sql, params![document_id.to_string()], JobRow::read)
        .optional()?;
    row.map(JobRow::into_job).transpose()
}

/// SQLite-backed `JobQueue`.
#[derive(Clone)]
pub struct SqliteJobQueue {
    db: Database,
}

impl SqliteJobQueue {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    fn finish(&self, job_id: Uuid, state: JobState, attempts: u32, error: Option<&str>, now: DateTime<Utc>) -> Result<()> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE transmission_jobs
                 SET state = ?1, attempts = ?2, last_error = COALESCE(?3, last_error),
                     locked_by = NULL, locked_at = NULL, updated_at = ?4
                 WHERE id = ?5",
                params![state.as_str(), attempts, error, to_millis(now), job_id.to_string()],
            )?;
            if changed == 0 {
                return Err(EngineError::not_found("job", job_id));
            }
            Ok(())
        })
    }
}

#[async_trait]
impl JobQueue for SqliteJobQueue {
    async fn enqueue(&self, job: &TransmissionJob) -> Result<TransmissionJob> {
        let open = self.db.with_tx(|tx| {
            if let Some(existing) = open_job_for(tx, job.document_id)? {
                return Ok(existing);
            }
            tx.execute(
                "INSERT INTO transmission_jobs (id, document_id, tenant_id, identity, environment, attempts,
                    max_attempts, base_delay_ms, max_delay_ms, state, run_at, last_error, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    job.id.to_string(),
                    job.document_id.to_string(),
                    job.tenant_id,
                    job.identity,
                    job.environment.as_str(),
                    job.attempts,
                    job.policy.max_attempts,
                    job.policy.base_delay_ms as i64,
                    job.policy.max_delay_ms as i64,
                    job.state.as_str(),
                    to_millis(job.run_at),
                    job.last_error,
                    to_millis(job.created_at),
                    to_millis(job.updated_at),
                ],
            )?;
            Ok(job.clone())
        })?;
        if open.id == job.id {
            debug!("Enqueued job {} for document {}", job.id, job.document_id);
        }
        Ok(open)
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<TransmissionJob>> {
        self.db.with_conn(|conn| load_job(conn, job_id))
    }

    async fn claim_next_due(&self, worker: &str, now: DateTime<Utc>) -> Result<Option<TransmissionJob>> {
        let now_ms = to_millis(now);
        self.db.with_tx(|tx| {
            let next: Option<String> = tx
                .query_row(
                    "SELECT id FROM transmission_jobs
                     WHERE state = 'WAITING' AND run_at <= ?1
                     ORDER BY run_at, created_at LIMIT 1",
                    params![now_ms],
                    |r| r.get(0),
                )
                .optional()?;
            let Some(id) = next else {
                return Ok(None);
            };
            tx.execute(
                "UPDATE transmission_jobs SET state = 'ACTIVE', locked_by = ?1, locked_at = ?2, updated_at = ?2
                 WHERE id = ?3 AND state = 'WAITING'",
                params![worker, now_ms, id],
            )?;
            let job_id = Uuid::parse_str(&id).map_err(|e| EngineError::Storage(e.to_string()))?;
            load_job(tx, job_id)
        })
    }

    async fn complete(&self, job_id: Uuid, attempts: u32, now: DateTime<Utc>) -> Result<()> {
        self.finish(job_id, JobState::Completed, attempts, None, now)
    }

    async fn reschedule(
        &self,
        job_id: Uuid,
        attempts: u32,
        run_at: DateTime<Utc>,
        last_error: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE transmission_jobs
                 SET state = 'WAITING', attempts = ?1, run_at = ?2, last_error = ?3,
                     locked_by = NULL, locked_at = NULL, updated_at = ?4
                 WHERE id = ?5",
                params![attempts, to_millis(run_at), last_error, to_millis(now), job_id.to_string()],
            )?;
            if changed == 0 {
                return Err(EngineError::not_found("job", job_id));
            }
            Ok(())
        })
    }

    async fn fail(&self, job_id: Uuid, attempts: u32, reason: &str, now: DateTime<Utc>) -> Result<()> {
        self.finish(job_id, JobState::Failed, attempts, Some(reason), now)
    }

    async fn requeue_stale(&self, locked_before: DateTime<Utc>, now: DateTime<Utc>) -> Result<usize> {
        let requeued = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE transmission_jobs
                 SET state = 'WAITING', locked_by = NULL, locked_at = NULL, run_at = ?1, updated_at = ?1
                 WHERE state = 'ACTIVE' AND locked_at < ?2",
                params![to_millis(now), to_millis(locked_before)],
            )?)
        })?;
        if requeued > 0 {
            info!("Requeued {} stale active job(s)", requeued);
        }
        Ok(requeued)
    }
}
