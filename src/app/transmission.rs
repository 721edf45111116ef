//! Transmission state machine.
//!
//! Both the synchronous path and the queue worker go through
//! [`TransmissionEngine::transmit_sync`]. A document is owned by at most one
//! attempt at a time: the attempt claims it with a compare-and-swap into
//! TRANSMITTING plus a lease, and every write that ends the attempt is fenced
//! on that lease.

use chrono::{DateTime, FixedOffset, NaiveDateTime, Utc};
use rand::Rng;
use serde::Serialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::annulment::build_annulment;
use super::ports::{
    AuthToken, AuthorityApi, AuthorityCredentials, AuthorityState, AuthorityStatus, CancelRequest,
    ClaimOutcome, DocumentStore, JobQueue, PurgeOutcome, Signer, SubmitRequest,
};
use crate::config::Config;
use crate::domain::{
    format_control_number, new_generation_code, Document, DocumentStatus, Event, EventAction,
    FailureKind, JobStatusView, NewDocument, NewEvent, RetryPolicy, TransmissionJob,
};
use crate::error::{EngineError, Result};
use crate::metrics;

/// Headroom between the longest possible attempt and the lease it runs under.
const LEASE_MARGIN: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// How long a claim stays exclusive before another attempt may take over.
    /// Never shorter than `attempt_budget` plus a margin.
    pub lease_ttl: Duration,
    /// How long a losing caller waits for the attempt in flight.
    pub in_flight_wait: Duration,
    pub in_flight_poll: Duration,
    pub authority_timeout: Duration,
    pub signing_timeout: Duration,
    pub retry: RetryPolicy,
    pub establishment: String,
    pub annulment_version: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(120),
            in_flight_wait: Duration::from_secs(60),
            in_flight_poll: Duration::from_millis(250),
            authority_timeout: Duration::from_secs(30),
            signing_timeout: Duration::from_secs(15),
            retry: RetryPolicy::default(),
            establishment: "M001P001".to_string(),
            annulment_version: 2,
        }
    }
}

impl EngineSettings {
    /// Fails when the configured lease could lapse while an attempt is still running.
    pub fn from_config(config: &Config) -> Result<Self> {
        let settings = Self {
            lease_ttl: Duration::from_secs(config.engine.lease_ttl_secs.max(1)),
            in_flight_wait: Duration::from_secs(config.engine.in_flight_wait_secs),
            in_flight_poll: Duration::from_millis(config.engine.in_flight_poll_ms.max(10)),
            authority_timeout: config.authority.request_timeout(),
            signing_timeout: Duration::from_secs(config.engine.signing_timeout_secs.max(1)),
            retry: config.queue.retry,
            establishment: config.engine.establishment.clone(),
            annulment_version: config.authority.annulment_version,
        };
        if settings.lease_ttl <= settings.attempt_budget() {
            return Err(EngineError::Config(format!(
                "engine.lease_ttl_secs ({}s) must exceed the longest attempt ({}s: token, status query \
                 and submission at the authority timeout plus signing)",
                settings.lease_ttl.as_secs(),
                settings.attempt_budget().as_secs()
            )));
        }
        Ok(settings)
    }

    /// Worst-case duration of one attempt.
    pub fn attempt_budget(&self) -> Duration {
        self.authority_timeout * 3 + self.signing_timeout
    }

    fn effective_lease(&self) -> Duration {
        self.lease_ttl.max(self.attempt_budget() + LEASE_MARGIN)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TransmissionFailure {
    pub code: FailureKind,
    pub message: String,
    pub retryable: bool,
}

/// Outcome handed back to callers so that business rejection and transport
/// failure can be told apart without inspecting errors.
#[derive(Debug, Clone, Serialize)]
pub struct TransmissionResult {
    pub success: bool,
    pub document_id: Uuid,
    pub generation_code: String,
    pub status: DocumentStatus,
    pub receipt_stamp: Option<String>,
    pub observations: Option<String>,
    pub error: Option<TransmissionFailure>,
}

impl TransmissionResult {
    /// Describe a document as stored, e.g. after waiting for another attempt.
    pub fn from_document(doc: &Document) -> Self {
        let error = match doc.status {
            DocumentStatus::Rejected | DocumentStatus::PendingRetry => {
                let code = doc.last_failure.unwrap_or(match doc.status {
                    DocumentStatus::Rejected => FailureKind::AuthorityRejected,
                    _ => FailureKind::AuthorityUnavailable,
                });
                Some(TransmissionFailure {
                    code,
                    message: doc.observations.clone().unwrap_or_default(),
                    retryable: doc.status == DocumentStatus::PendingRetry,
                })
            }
            _ => None,
        };
        Self {
            success: matches!(doc.status, DocumentStatus::Processed | DocumentStatus::Annulled),
            document_id: doc.id,
            generation_code: doc.generation_code.clone(),
            status: doc.status,
            receipt_stamp: doc.receipt_stamp.clone(),
            observations: doc.observations.clone(),
            error,
        }
    }

    fn failed(doc: &Document, err: &EngineError) -> Self {
        let observations = match err {
            EngineError::AuthorityRejected { observations } => Some(observations.join("; ")),
            _ => doc.observations.clone(),
        };
        Self {
            success: false,
            document_id: doc.id,
            generation_code: doc.generation_code.clone(),
            status: doc.status,
            receipt_stamp: doc.receipt_stamp.clone(),
            observations,
            error: Some(TransmissionFailure {
                code: FailureKind::from(err),
                message: err.to_string(),
                retryable: err.is_retryable(),
            }),
        }
    }
}

/// How a `transmit` call came to its result.
#[derive(Debug, Clone)]
pub enum Transmission {
    /// This call claimed the document and ran the attempt.
    Attempted(TransmissionResult),
    /// Another attempt held the document; the result is the outcome it left behind.
    Observed(TransmissionResult),
}

impl Transmission {
    pub fn result(&self) -> &TransmissionResult {
        match self {
            Self::Attempted(result) | Self::Observed(result) => result,
        }
    }

    pub fn into_result(self) -> TransmissionResult {
        match self {
            Self::Attempted(result) | Self::Observed(result) => result,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AsyncSubmission {
    /// A job was enqueued, or an open one for the same document already existed.
    Queued { job_id: Uuid, existing: bool },
    /// No queue backend: the transmission ran synchronously.
    Inline { result: TransmissionResult },
}

fn envelope_digest(envelope: &str) -> String {
    hex::encode(Sha256::digest(envelope.as_bytes()))
}

fn next_send_id() -> u64 {
    rand::thread_rng().gen_range(1..=i32::MAX as u64)
}

fn join_observations(observations: &[String]) -> Option<String> {
    if observations.is_empty() {
        None
    } else {
        Some(observations.join("; "))
    }
}

/// `fhProcesamiento` is local time (UTC-6) as `dd/mm/yyyy HH:MM:SS`; RFC 3339 is accepted too.
fn parse_authority_time(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    let local = NaiveDateTime::parse_from_str(raw.trim(), "%d/%m/%Y %H:%M:%S").ok()?;
    let offset = FixedOffset::west_opt(6 * 3600)?;
    local
        .and_local_timezone(offset)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
}

async fn bounded<T>(
    limit: Duration,
    what: &str,
    fut: impl Future<Output = Result<T>>,
    on_timeout: impl FnOnce(String) -> EngineError,
) -> Result<T> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(on_timeout(format!("{} timed out after {:?}", what, limit))),
    }
}

fn check_environment(doc: &Document, credentials: &AuthorityCredentials) -> Result<()> {
    if doc.environment == credentials.environment {
        Ok(())
    } else {
        Err(EngineError::EnvironmentMismatch {
            document: doc.environment,
            credentials: credentials.environment,
        })
    }
}

/// Stamp the business identity into the canonical payload's `identificacion`.
fn stamp_identification(content: &mut serde_json::Value, doc: &Document) -> Result<()> {
    let obj = content
        .as_object_mut()
        .ok_or_else(|| EngineError::InvalidDocument("content must be a JSON object".to_string()))?;
    let ident = obj
        .entry("identificacion")
        .or_insert_with(|| json!({}))
        .as_object_mut()
        .ok_or_else(|| EngineError::InvalidDocument("identificacion must be an object".to_string()))?;
    ident.insert("version".into(), json!(doc.document_type.version()));
    ident.insert("ambiente".into(), json!(doc.environment.code()));
    ident.insert("tipoDte".into(), json!(doc.document_type.code()));
    ident.insert("numeroControl".into(), json!(doc.control_number));
    ident.insert("codigoGeneracion".into(), json!(doc.generation_code));
    Ok(())
}

pub struct TransmissionEngine {
    store: Arc<dyn DocumentStore>,
    signer: Arc<dyn Signer>,
    authority: Arc<dyn AuthorityApi>,
    queue: Option<Arc<dyn JobQueue>>,
    settings: EngineSettings,
    instance_id: String,
}

impl TransmissionEngine {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        signer: Arc<dyn Signer>,
        authority: Arc<dyn AuthorityApi>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            store,
            signer,
            authority,
            queue: None,
            settings,
            instance_id: format!("engine-{}", Uuid::new_v4().simple()),
        }
    }

    pub fn with_queue(mut self, queue: Arc<dyn JobQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    fn new_holder(&self) -> String {
        format!("{}/{}", self.instance_id, Uuid::new_v4().simple())
    }

    // Documents

    /// Create a draft document. Producers such as the recurring scheduler call
    /// this and then hand the id to `transmit_sync` / `transmit_async`.
    pub async fn create_document(&self, new: NewDocument) -> Result<Document> {
        let control_number = match new.control_number.filter(|c| !c.trim().is_empty()) {
            Some(given) => given,
            None => {
                let establishment = new
                    .establishment
                    .unwrap_or_else(|| self.settings.establishment.clone());
                let sequence = self
                    .store
                    .next_control_sequence(new.document_type, &establishment)
                    .await?;
                format_control_number(new.document_type, &establishment, sequence)
            }
        };

        let now = Utc::now();
        let mut doc = Document {
            id: Uuid::new_v4(),
            generation_code: new_generation_code(),
            control_number,
            document_type: new.document_type,
            environment: new.environment,
            status: DocumentStatus::Created,
            original_content: serde_json::Value::Null,
            signed_envelope: None,
            receipt_stamp: None,
            observations: None,
            attempt_count: 0,
            processed_at: None,
            needs_reconciliation: false,
            last_failure: None,
            annulment_generation_code: None,
            annulment_receipt_stamp: None,
            created_at: now,
            updated_at: now,
        };
        let mut content = new.content;
        stamp_identification(&mut content, &doc)?;
        doc.original_content = content;

        self.store.insert_document(&doc).await?;
        info!(
            document_id = %doc.id,
            generation_code = %doc.generation_code,
            "Created document {}",
            doc.control_number
        );
        Ok(doc)
    }

    pub async fn get_document(&self, id: Uuid) -> Result<Document> {
        self.store
            .get_document(id)
            .await?
            .ok_or_else(|| EngineError::not_found("document", id))
    }

    pub async fn events(&self, id: Uuid) -> Result<Vec<Event>> {
        self.get_document(id).await?;
        self.store.list_events(id).await
    }

    /// Delete a document and its events. Refused while an attempt or an
    /// annulment holds the document.
    pub async fn purge_document(&self, id: Uuid) -> Result<()> {
        match self.store.purge_document(id, Utc::now()).await? {
            PurgeOutcome::Purged => {
                info!(document_id = %id, "Purged document and its events");
                Ok(())
            }
            PurgeOutcome::Leased => {
                let doc = self.get_document(id).await?;
                Err(EngineError::TransmissionInFlight(doc.generation_code))
            }
            PurgeOutcome::NotFound => Err(EngineError::not_found("document", id)),
        }
    }

    // Transmission

    /// Transmit a document and wait for the authority's answer.
    ///
    /// Local precondition failures are returned as errors. Signing, token and
    /// authority failures come back as an unsuccessful `TransmissionResult`.
    pub async fn transmit_sync(
        &self,
        id: Uuid,
        credentials: &AuthorityCredentials,
    ) -> Result<TransmissionResult> {
        self.transmit(id, credentials).await.map(Transmission::into_result)
    }

    /// Like `transmit_sync`, but tells an attempt run by this call apart from
    /// the outcome of another caller's attempt it waited for.
    pub async fn transmit(
        &self,
        id: Uuid,
        credentials: &AuthorityCredentials,
    ) -> Result<Transmission> {
        let doc = self.get_document(id).await?;
        check_environment(&doc, credentials)?;
        match doc.status {
            DocumentStatus::Processed | DocumentStatus::Annulled => {
                return Err(EngineError::AlreadyProcessed(doc.generation_code))
            }
            DocumentStatus::Rejected => {
                return Err(EngineError::InvalidStateTransition {
                    from: doc.status,
                    operation: "transmit",
                })
            }
            _ => {}
        }

        let holder = self.new_holder();
        match self
            .store
            .try_claim(id, &holder, self.settings.effective_lease(), Utc::now())
            .await?
        {
            ClaimOutcome::Claimed { previous, document } => {
                let span = info_span!(
                    "transmission",
                    document_id = %document.id,
                    generation_code = %document.generation_code,
                    attempt = document.attempt_count + 1
                );
                self.run_attempt(document, previous, &holder, credentials)
                    .instrument(span)
                    .await
                    .map(Transmission::Attempted)
            }
            ClaimOutcome::Busy => self.await_in_flight(id).await.map(Transmission::Observed),
            ClaimOutcome::Ineligible(DocumentStatus::Processed)
            | ClaimOutcome::Ineligible(DocumentStatus::Annulled) => {
                Err(EngineError::AlreadyProcessed(doc.generation_code))
            }
            ClaimOutcome::Ineligible(status) => Err(EngineError::InvalidStateTransition {
                from: status,
                operation: "transmit",
            }),
            ClaimOutcome::NotFound => Err(EngineError::not_found("document", id)),
        }
    }

    async fn run_attempt(
        &self,
        mut doc: Document,
        previous: DocumentStatus,
        holder: &str,
        credentials: &AuthorityCredentials,
    ) -> Result<TransmissionResult> {
        info!("Transmission attempt started (was {})", previous);

        let token = match self.acquire_token(credentials).await {
            Ok(token) => token,
            Err(e) => return self.fail_attempt(doc, holder, e, false).await,
        };

        // The previous attempt may have reached the authority; ask before resubmitting.
        let outcome_unknown = doc.needs_reconciliation || previous == DocumentStatus::Transmitting;
        if outcome_unknown {
            match self.reconcile(&doc, &token).await {
                Ok(Some(status)) => {
                    info!("Authority already holds the document as processed");
                    metrics::transmission::attempt_finished("reconciled");
                    let stamp = status.receipt_stamp.clone().unwrap_or_default();
                    return self
                        .record_processed(
                            doc,
                            holder,
                            stamp,
                            status.processed_at.as_deref(),
                            &status.observations,
                            true,
                        )
                        .await;
                }
                Ok(None) => debug!("Authority has no accepted copy; submitting"),
                Err(e) => return self.fail_attempt(doc, holder, e, true).await,
            }
        }

        if doc.signed_envelope.is_none() {
            match self.sign(&doc.original_content).await {
                Ok(envelope) => {
                    let event = NewEvent::success(doc.id, EventAction::Sign, "document signed")
                        .with_data(json!({ "envelopeSha256": envelope_digest(&envelope) }));
                    self.store
                        .store_signed_envelope(doc.id, holder, &envelope, &event)
                        .await?;
                    metrics::transmission::signing_performed();
                    doc.signed_envelope = Some(envelope);
                }
                Err(e) => return self.fail_attempt(doc, holder, e, false).await,
            }
        } else {
            debug!("Reusing stored signed envelope");
        }

        let envelope = doc
            .signed_envelope
            .clone()
            .ok_or_else(|| EngineError::Storage("signed envelope missing after signing".to_string()))?;
        let request = SubmitRequest {
            ambiente: doc.environment.code().to_string(),
            id_envio: next_send_id(),
            version: doc.document_type.version(),
            tipo_dte: doc.document_type.code().to_string(),
            documento: envelope,
            codigo_generacion: doc.generation_code.clone(),
        };
        self.store
            .append_event(
                &NewEvent::success(doc.id, EventAction::Transmit, "submitted to authority").with_data(json!({
                    "ambiente": request.ambiente,
                    "idEnvio": request.id_envio,
                    "version": request.version,
                    "tipoDte": request.tipo_dte,
                    "attempt": doc.attempt_count + 1,
                    "envelopeSha256": envelope_digest(&request.documento),
                })),
            )
            .await?;

        let submitted = bounded(
            self.settings.authority_timeout,
            "reception request",
            self.authority.submit(&token, &request),
            EngineError::AuthorityUnavailable,
        )
        .await;

        match submitted {
            Ok(receipt) => {
                metrics::transmission::attempt_finished("processed");
                self.record_processed(
                    doc,
                    holder,
                    receipt.receipt_stamp,
                    receipt.processed_at.as_deref(),
                    &receipt.observations,
                    false,
                )
                .await
            }
            Err(EngineError::AuthorityRejected { observations }) => {
                self.record_rejection(doc, holder, observations).await
            }
            Err(e) => {
                // A transport failure after dispatch leaves the outcome unknown.
                let unknown = matches!(e, EngineError::AuthorityUnavailable(_));
                self.fail_attempt(doc, holder, e, unknown).await
            }
        }
    }

    /// `Some(status)` when the authority already accepted this generation
    /// code, `None` when it is safe to submit.
    async fn reconcile(&self, doc: &Document, token: &AuthToken) -> Result<Option<AuthorityStatus>> {
        let status = bounded(
            self.settings.authority_timeout,
            "status query",
            self.authority.query(token, &doc.generation_code),
            EngineError::AuthorityUnavailable,
        )
        .await?;
        match status.state {
            AuthorityState::Processed if status.receipt_stamp.is_some() => Ok(Some(status)),
            AuthorityState::NotFound | AuthorityState::Rejected => Ok(None),
            _ => Err(EngineError::AuthorityUnavailable(format!(
                "authority reports '{}' for {}; not resubmitting yet",
                status.raw_state, doc.generation_code
            ))),
        }
    }

    async fn acquire_token(&self, credentials: &AuthorityCredentials) -> Result<AuthToken> {
        bounded(
            self.settings.authority_timeout,
            "token request",
            self.authority.get_token(credentials),
            EngineError::TokenUnavailable,
        )
        .await
    }

    async fn sign(&self, content: &serde_json::Value) -> Result<String> {
        if !self.signer.is_certificate_loaded().await {
            return Err(EngineError::SigningUnavailable(
                "no signing certificate loaded".to_string(),
            ));
        }
        bounded(
            self.settings.signing_timeout,
            "signing",
            self.signer.sign(content),
            EngineError::SigningUnavailable,
        )
        .await
    }

    async fn record_processed(
        &self,
        mut doc: Document,
        holder: &str,
        receipt_stamp: String,
        processed_at: Option<&str>,
        observations: &[String],
        reconciled: bool,
    ) -> Result<TransmissionResult> {
        let now = Utc::now();
        doc.status = DocumentStatus::Processed;
        doc.receipt_stamp = Some(receipt_stamp.clone());
        doc.observations = join_observations(observations);
        doc.processed_at = Some(processed_at.and_then(parse_authority_time).unwrap_or(now));
        doc.needs_reconciliation = false;
        doc.last_failure = None;
        doc.updated_at = now;

        let message = if reconciled {
            "already processed by authority (reconciled)"
        } else {
            "accepted by authority"
        };
        let event = NewEvent::success(doc.id, EventAction::Response, message).with_data(json!({
            "selloRecibido": receipt_stamp,
            "fhProcesamiento": processed_at,
            "observaciones": observations,
            "reconciled": reconciled,
        }));
        self.store.save_fenced(&doc, holder, &[event]).await?;
        info!("Document processed with receipt stamp {}", receipt_stamp);
        Ok(TransmissionResult::from_document(&doc))
    }

    async fn record_rejection(
        &self,
        mut doc: Document,
        holder: &str,
        observations: Vec<String>,
    ) -> Result<TransmissionResult> {
        doc.status = DocumentStatus::Rejected;
        doc.attempt_count += 1;
        doc.observations = join_observations(&observations);
        let err = EngineError::AuthorityRejected { observations };
        doc.needs_reconciliation = false;
        doc.last_failure = Some(FailureKind::AuthorityRejected);
        doc.updated_at = Utc::now();

        let event = NewEvent::failure(doc.id, EventAction::Error, err.to_string()).with_data(json!({
            "code": err.code(),
            "retryable": false,
            "observaciones": doc.observations,
        }));
        self.store.save_fenced(&doc, holder, &[event]).await?;
        warn!("Document rejected by authority: {}", err);
        metrics::transmission::attempt_finished("rejected");
        Ok(TransmissionResult::failed(&doc, &err))
    }

    /// End an attempt as retryable: PENDING_RETRY with the error in `observations`.
    async fn fail_attempt(
        &self,
        mut doc: Document,
        holder: &str,
        err: EngineError,
        outcome_unknown: bool,
    ) -> Result<TransmissionResult> {
        doc.status = DocumentStatus::PendingRetry;
        doc.attempt_count += 1;
        doc.observations = Some(err.to_string());
        doc.needs_reconciliation = doc.needs_reconciliation || outcome_unknown;
        doc.last_failure = Some(FailureKind::from(&err));
        doc.updated_at = Utc::now();

        let event = NewEvent::failure(doc.id, EventAction::Error, err.to_string()).with_data(json!({
            "code": err.code(),
            "retryable": err.is_retryable(),
            "outcomeUnknown": doc.needs_reconciliation,
        }));
        self.store.save_fenced(&doc, holder, &[event]).await?;
        warn!("Transmission attempt failed: {}", err);
        metrics::transmission::attempt_finished("retryable");
        Ok(TransmissionResult::failed(&doc, &err))
    }

    /// Wait for the attempt holding the lease and report its outcome.
    async fn await_in_flight(&self, id: Uuid) -> Result<TransmissionResult> {
        metrics::transmission::in_flight_wait();
        debug!(document_id = %id, "Transmission in flight elsewhere; waiting for its outcome");
        let deadline = Instant::now() + self.settings.in_flight_wait;
        loop {
            tokio::time::sleep(self.settings.in_flight_poll).await;
            let doc = self.get_document(id).await?;
            if doc.status != DocumentStatus::Transmitting {
                return Ok(TransmissionResult::from_document(&doc));
            }
            if Instant::now() >= deadline {
                return Err(EngineError::TransmissionInFlight(doc.generation_code));
            }
        }
    }

    /// Queue the document for background transmission. Without a queue
    /// backend this falls back to the synchronous path.
    pub async fn transmit_async(
        &self,
        id: Uuid,
        tenant_id: &str,
        credentials: &AuthorityCredentials,
    ) -> Result<AsyncSubmission> {
        let doc = self.get_document(id).await?;
        check_environment(&doc, credentials)?;
        match doc.status {
            DocumentStatus::Processed | DocumentStatus::Annulled => {
                return Err(EngineError::AlreadyProcessed(doc.generation_code))
            }
            DocumentStatus::Rejected => {
                return Err(EngineError::InvalidStateTransition {
                    from: doc.status,
                    operation: "enqueue",
                })
            }
            _ => {}
        }

        let Some(queue) = &self.queue else {
            warn!(document_id = %id, "No queue backend configured; transmitting synchronously");
            let result = self.transmit_sync(id, credentials).await?;
            return Ok(AsyncSubmission::Inline { result });
        };

        let job = TransmissionJob::new(
            id,
            tenant_id,
            credentials.identity.clone(),
            credentials.environment,
            self.settings.retry,
            Utc::now(),
        );
        let open = queue.enqueue(&job).await?;
        if open.id != job.id {
            debug!(document_id = %id, job_id = %open.id, "Open job already queued");
            return Ok(AsyncSubmission::Queued {
                job_id: open.id,
                existing: true,
            });
        }
        metrics::queue::job_enqueued();
        info!(document_id = %id, job_id = %job.id, "Queued transmission");
        Ok(AsyncSubmission::Queued {
            job_id: job.id,
            existing: false,
        })
    }

    pub async fn job_status(&self, job_id: Uuid) -> Result<JobStatusView> {
        let queue = self
            .queue
            .as_ref()
            .ok_or_else(|| EngineError::not_found("job", job_id))?;
        queue
            .get_job(job_id)
            .await?
            .map(|job| job.status_view())
            .ok_or_else(|| EngineError::not_found("job", job_id))
    }

    /// Read-only status lookup against the authority. Never touches local state.
    pub async fn query_status(
        &self,
        generation_code: &str,
        credentials: &AuthorityCredentials,
    ) -> Result<AuthorityStatus> {
        let token = self.acquire_token(credentials).await?;
        bounded(
            self.settings.authority_timeout,
            "status query",
            self.authority.query(&token, generation_code),
            EngineError::AuthorityUnavailable,
        )
        .await
    }

    // Annulment

    /// Cancel a processed document by transmitting a signed annulment.
    /// Not retried automatically; on failure the document stays PROCESSED.
    pub async fn annul(
        &self,
        id: Uuid,
        reason: &str,
        credentials: &AuthorityCredentials,
    ) -> Result<TransmissionResult> {
        let doc = self.get_document(id).await?;
        if doc.status != DocumentStatus::Processed {
            return Err(EngineError::InvalidStateTransition {
                from: doc.status,
                operation: "annul",
            });
        }
        check_environment(&doc, credentials)?;

        let holder = self.new_holder();
        let leased = self
            .store
            .try_lease(
                id,
                &holder,
                DocumentStatus::Processed,
                self.settings.effective_lease(),
                Utc::now(),
            )
            .await?;
        if !leased {
            let current = self.get_document(id).await?;
            return Err(match current.status {
                DocumentStatus::Processed => EngineError::TransmissionInFlight(current.generation_code),
                from => EngineError::InvalidStateTransition {
                    from,
                    operation: "annul",
                },
            });
        }

        let span = info_span!(
            "annulment",
            document_id = %doc.id,
            generation_code = %doc.generation_code
        );
        self.annul_leased(doc, &holder, reason, credentials)
            .instrument(span)
            .await
    }

    async fn annul_leased(
        &self,
        mut doc: Document,
        holder: &str,
        reason: &str,
        credentials: &AuthorityCredentials,
    ) -> Result<TransmissionResult> {
        let annulment_code = new_generation_code();
        let outcome = async {
            let token = self.acquire_token(credentials).await?;
            let annulment = build_annulment(
                &doc,
                &annulment_code,
                reason,
                self.settings.annulment_version,
                Utc::now(),
            );
            let envelope = self.sign(&annulment).await?;
            let request = CancelRequest {
                ambiente: doc.environment.code().to_string(),
                id_envio: next_send_id(),
                version: self.settings.annulment_version,
                documento: envelope,
            };
            bounded(
                self.settings.authority_timeout,
                "annulment request",
                self.authority.cancel(&token, &request),
                EngineError::AuthorityUnavailable,
            )
            .await
        }
        .await;

        match outcome {
            Ok(receipt) => {
                doc.status = DocumentStatus::Annulled;
                doc.annulment_generation_code = Some(annulment_code.clone());
                doc.annulment_receipt_stamp = Some(receipt.receipt_stamp.clone());
                doc.updated_at = Utc::now();
                let event = NewEvent::success(doc.id, EventAction::Anular, "annulled by authority")
                    .with_data(json!({
                        "codigoGeneracion": annulment_code,
                        "selloRecibido": receipt.receipt_stamp,
                        "motivo": reason,
                    }));
                self.store.save_fenced(&doc, holder, &[event]).await?;
                metrics::transmission::annulment_finished(true);
                info!("Document annulled");
                Ok(TransmissionResult::from_document(&doc))
            }
            Err(e) if e.is_retryable() || matches!(e, EngineError::AuthorityRejected { .. }) => {
                let event = NewEvent::failure(doc.id, EventAction::Error, format!("annulment failed: {}", e))
                    .with_data(json!({
                        "operation": EventAction::Anular.as_str(),
                        "code": e.code(),
                        "codigoGeneracion": annulment_code,
                    }));
                self.store.append_event(&event).await?;
                self.store.release_lease(doc.id, holder).await?;
                metrics::transmission::annulment_finished(false);
                warn!("Annulment failed: {}", e);
                Ok(TransmissionResult::failed(&doc, &e))
            }
            Err(e) => {
                self.store.release_lease(doc.id, holder).await?;
                Err(e)
            }
        }
    }

    /// Operator path: move a REJECTED document back to PENDING_RETRY.
    pub async fn reopen_rejected(&self, id: Uuid, note: &str) -> Result<Document> {
        let doc = self.get_document(id).await?;
        if doc.status != DocumentStatus::Rejected {
            return Err(EngineError::InvalidStateTransition {
                from: doc.status,
                operation: "reopen",
            });
        }
        let now = Utc::now();
        let mut reopened = doc.clone();
        reopened.status = DocumentStatus::PendingRetry;
        reopened.updated_at = now;
        let event = NewEvent::success(id, EventAction::Reopen, note.to_string());

        if !self
            .store
            .save_if_status(&reopened, DocumentStatus::Rejected, &[event], now)
            .await?
        {
            let current = self.get_document(id).await?;
            return Err(EngineError::InvalidStateTransition {
                from: current.status,
                operation: "reopen",
            });
        }
        info!(document_id = %id, "Rejected document re-opened for transmission");
        Ok(reopened)
    }
}
