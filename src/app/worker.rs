use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::ports::{AuthorityCredentials, CredentialProvider, JobQueue};
use super::transmission::{Transmission, TransmissionEngine, TransmissionResult};
use crate::config::QueueConfig;
use crate::domain::{JobState, TransmissionJob};
use crate::error::{EngineError, Result};
use crate::metrics;

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Jobs processed concurrently.
    pub workers: usize,
    pub poll_interval: Duration,
    /// ACTIVE jobs locked for longer than this are assumed orphaned.
    pub stale_after: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            poll_interval: Duration::from_millis(500),
            stale_after: Duration::from_secs(300),
        }
    }
}

impl WorkerSettings {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            workers: config.workers.max(1),
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(10)),
            stale_after: Duration::from_secs(config.stale_job_secs.max(1)),
        }
    }
}

/// Drains the transmission queue. Every job runs the same path as a
/// synchronous transmission; the worker only decides what happens to the
/// job afterwards.
pub struct TransmissionWorker {
    engine: Arc<TransmissionEngine>,
    queue: Arc<dyn JobQueue>,
    credentials: Arc<dyn CredentialProvider>,
    settings: WorkerSettings,
    worker_id: String,
}

impl TransmissionWorker {
    pub fn new(
        engine: Arc<TransmissionEngine>,
        queue: Arc<dyn JobQueue>,
        credentials: Arc<dyn CredentialProvider>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            engine,
            queue,
            credentials,
            settings,
            worker_id: format!("worker-{}", Uuid::new_v4().simple()),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Process every job due at `now`, one after another. Returns how many ran.
    pub async fn run_due(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut processed = 0;
        while let Some(job) = self.queue.claim_next_due(&self.worker_id, now).await? {
            self.process_job(job, now).await?;
            processed += 1;
        }
        Ok(processed)
    }

    /// Run one claimed job and settle it. Returns the job's resulting state.
    pub async fn process_job(&self, job: TransmissionJob, now: DateTime<Utc>) -> Result<JobState> {
        let span = info_span!(
            "job",
            job_id = %job.id,
            document_id = %job.document_id,
            attempt = job.attempts + 1
        );
        self.settle(job, now).instrument(span).await
    }

    async fn settle(&self, job: TransmissionJob, now: DateTime<Utc>) -> Result<JobState> {
        let Some(secret) = self
            .credentials
            .secret_for(&job.tenant_id, &job.identity)
            .await
        else {
            let reason = EngineError::MissingCredentials(job.identity.clone()).to_string();
            return self.fail(&job, job.attempts, &reason, now).await;
        };
        let credentials = AuthorityCredentials::new(job.identity.clone(), secret, job.environment);
        let attempts = job.attempts + 1;

        match self.engine.transmit(job.document_id, &credentials).await {
            Ok(Transmission::Attempted(result)) if result.success => {
                self.queue.complete(job.id, attempts, now).await?;
                metrics::queue::job_completed();
                info!("Job completed; receipt stamp {:?}", result.receipt_stamp);
                Ok(JobState::Completed)
            }
            Ok(Transmission::Attempted(result)) => {
                let (message, retryable) = failure_of(&result);
                if retryable {
                    self.retry_or_fail(&job, attempts, &message, now).await
                } else {
                    self.fail(&job, attempts, &message, now).await
                }
            }
            Ok(Transmission::Observed(result)) => self.settle_observed(&job, result, now).await,
            Err(EngineError::AlreadyProcessed(code)) => {
                debug!("Document {} already processed; closing job", code);
                self.queue.complete(job.id, job.attempts, now).await?;
                metrics::queue::job_completed();
                Ok(JobState::Completed)
            }
            Err(e @ EngineError::TransmissionInFlight(_)) => {
                self.defer(&job, &e.to_string(), now).await
            }
            Err(e @ EngineError::Storage(_)) => {
                warn!("Storage failure while processing job: {}", e);
                self.retry_or_fail(&job, attempts, &e.to_string(), now).await
            }
            Err(e) => self.fail(&job, attempts, &e.to_string(), now).await,
        }
    }

    /// Another caller's attempt decided the outcome; none of this job's
    /// attempts were spent on it.
    async fn settle_observed(
        &self,
        job: &TransmissionJob,
        result: TransmissionResult,
        now: DateTime<Utc>,
    ) -> Result<JobState> {
        if result.success {
            self.queue.complete(job.id, job.attempts, now).await?;
            metrics::queue::job_completed();
            info!("Document settled by another attempt; closing job");
            return Ok(JobState::Completed);
        }
        let (message, retryable) = failure_of(&result);
        if retryable {
            self.defer(job, &message, now).await
        } else {
            self.fail(job, job.attempts, &message, now).await
        }
    }

    /// Reschedule without spending an attempt.
    async fn defer(&self, job: &TransmissionJob, message: &str, now: DateTime<Utc>) -> Result<JobState> {
        let wait = self
            .settings
            .poll_interval
            .max(job.policy.delay_after_attempt(1));
        let run_at = now + chrono_delay(wait);
        self.queue
            .reschedule(job.id, job.attempts, run_at, message, now)
            .await?;
        debug!("Job deferred until {}: {}", run_at, message);
        Ok(JobState::Waiting)
    }

    async fn retry_or_fail(
        &self,
        job: &TransmissionJob,
        attempts: u32,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<JobState> {
        if job.policy.is_exhausted(attempts) {
            return self.fail(job, attempts, message, now).await;
        }
        let delay = job.policy.delay_after_attempt(attempts);
        let run_at = now + chrono_delay(delay);
        self.queue
            .reschedule(job.id, attempts, run_at, message, now)
            .await?;
        metrics::queue::job_retried();
        info!(
            "Attempt {}/{} failed; retrying in {:?}: {}",
            attempts, job.policy.max_attempts, delay, message
        );
        Ok(JobState::Waiting)
    }

    async fn fail(
        &self,
        job: &TransmissionJob,
        attempts: u32,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<JobState> {
        self.queue.fail(job.id, attempts, reason, now).await?;
        metrics::queue::job_failed();
        warn!("Job failed after {} attempt(s): {}", attempts, reason);
        Ok(JobState::Failed)
    }

    async fn requeue_stale(&self) {
        let now = Utc::now();
        match self
            .queue
            .requeue_stale(now - chrono_delay(self.settings.stale_after), now)
            .await
        {
            Ok(0) => {}
            Ok(n) => info!("Returned {} orphaned job(s) to the queue", n),
            Err(e) => error!("Failed to requeue stale jobs: {}", e),
        }
    }

    /// Poll for due jobs until `shutdown` flips to true or its sender is
    /// dropped, then wait for jobs already running.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            worker_id = %self.worker_id,
            "Transmission worker started with {} slot(s)",
            self.settings.workers
        );
        let slots = Arc::new(Semaphore::new(self.settings.workers));
        let mut last_sweep: Option<tokio::time::Instant> = None;

        loop {
            if *shutdown.borrow() {
                break;
            }
            if last_sweep.map_or(true, |at| at.elapsed() >= self.settings.stale_after) {
                self.requeue_stale().await;
                last_sweep = Some(tokio::time::Instant::now());
            }

            let mut dispatched = 0;
            while let Ok(permit) = slots.clone().try_acquire_owned() {
                match self.queue.claim_next_due(&self.worker_id, Utc::now()).await {
                    Ok(Some(job)) => {
                        let this = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = this.process_job(job, Utc::now()).await {
                                error!("Job processing failed: {}", e);
                            }
                            drop(permit);
                        });
                        dispatched += 1;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        error!("Failed to claim next job: {}", e);
                        break;
                    }
                }
            }

            if dispatched == 0 {
                tokio::select! {
                    _ = tokio::time::sleep(self.settings.poll_interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        let _ = slots.acquire_many(self.settings.workers as u32).await;
        info!(worker_id = %self.worker_id, "Transmission worker stopped");
    }
}

fn failure_of(result: &TransmissionResult) -> (String, bool) {
    match &result.error {
        Some(failure) => (failure.message.clone(), failure.retryable),
        None => (format!("document left in status {}", result.status), false),
    }
}

fn chrono_delay(delay: Duration) -> chrono::Duration {
    chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(60))
}
