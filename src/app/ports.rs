use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::domain::{
    Document, DocumentStatus, DocumentType, Environment, Event, NewEvent, TransmissionJob,
};
use crate::error::Result;

// Storage-side ports

/// Result of trying to take exclusive ownership of a document for a transmission attempt.
#[derive(Debug, Clone)]
pub enum ClaimOutcome {
    /// The caller now holds the lease; `previous` is the status before the claim.
    Claimed {
        previous: DocumentStatus,
        document: Document,
    },
    /// Another attempt holds a live lease.
    Busy,
    /// The document's status does not allow a transmission.
    Ineligible(DocumentStatus),
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeOutcome {
    Purged,
    /// An attempt or annulment still holds the lease.
    Leased,
    NotFound,
}

/// Durable record of documents and their event logs.
///
/// Status changes and the events recording their cause are written in the
/// same transaction. Writes that end an attempt are fenced on the lease holder.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn insert_document(&self, document: &Document) -> Result<()>;
    async fn get_document(&self, id: Uuid) -> Result<Option<Document>>;

    /// Next value of the control-number sequence for a type and establishment.
    async fn next_control_sequence(&self, document_type: DocumentType, establishment: &str)
        -> Result<u64>;

    /// Compare-and-swap into TRANSMITTING from a transmittable status or from
    /// TRANSMITTING whose lease expired before `now`.
    async fn try_claim(
        &self,
        id: Uuid,
        holder: &str,
        lease_ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome>;

    /// Take the lease without changing status; only succeeds when the document
    /// is in `expected` and no live lease exists.
    async fn try_lease(
        &self,
        id: Uuid,
        holder: &str,
        expected: DocumentStatus,
        lease_ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    async fn release_lease(&self, id: Uuid, holder: &str) -> Result<()>;

    /// Set the signed envelope once. Fails if one is already stored or the
    /// lease is no longer held.
    async fn store_signed_envelope(
        &self,
        id: Uuid,
        holder: &str,
        envelope: &str,
        event: &NewEvent,
    ) -> Result<()>;

    /// Persist the mutable fields of `document`, release the lease and append
    /// `events`, all under the lease held by `holder`. Fails with
    /// `InvalidStateTransition` when the stored status cannot move to
    /// `document.status`.
    async fn save_fenced(&self, document: &Document, holder: &str, events: &[NewEvent])
        -> Result<()>;

    /// Persist `document` only if its stored status is still `expected` and no
    /// live lease exists. Returns false when the compare fails. `expected` must
    /// be able to move to `document.status`.
    async fn save_if_status(
        &self,
        document: &Document,
        expected: DocumentStatus,
        events: &[NewEvent],
        now: DateTime<Utc>,
    ) -> Result<bool>;

    async fn append_event(&self, event: &NewEvent) -> Result<()>;
    async fn list_events(&self, document_id: Uuid) -> Result<Vec<Event>>;

    /// Delete a document together with its events, unless a live lease is
    /// held on it at `now`.
    async fn purge_document(&self, id: Uuid, now: DateTime<Utc>) -> Result<PurgeOutcome>;
}

/// Durable queue of transmission jobs. Only the worker mutates job state.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Insert `job` unless its document already has a WAITING or ACTIVE job.
    /// Returns the open job for the document, which is `job` when inserted.
    async fn enqueue(&self, job: &TransmissionJob) -> Result<TransmissionJob>;
    async fn get_job(&self, job_id: Uuid) -> Result<Option<TransmissionJob>>;

    /// Atomically move the oldest due WAITING job to ACTIVE.
    async fn claim_next_due(&self, worker: &str, now: DateTime<Utc>)
        -> Result<Option<TransmissionJob>>;

    async fn complete(&self, job_id: Uuid, attempts: u32, now: DateTime<Utc>) -> Result<()>;
    async fn reschedule(
        &self,
        job_id: Uuid,
        attempts: u32,
        run_at: DateTime<Utc>,
        last_error: &str,
        now: DateTime<Utc>,
    ) -> Result<()>;
    async fn fail(&self, job_id: Uuid, attempts: u32, reason: &str, now: DateTime<Utc>)
        -> Result<()>;

    /// Return ACTIVE jobs locked before `locked_before` to WAITING.
    async fn requeue_stale(&self, locked_before: DateTime<Utc>, now: DateTime<Utc>)
        -> Result<usize>;
}

// Signing port

#[async_trait]
pub trait Signer: Send + Sync {
    async fn is_certificate_loaded(&self) -> bool;

    /// Produce the signed envelope for a canonical document. Fails with
    /// `SigningUnavailable` or `SigningFailed`.
    async fn sign(&self, document: &serde_json::Value) -> Result<String>;
}

// Authority ports

#[derive(Clone)]
pub struct AuthorityCredentials {
    pub identity: String,
    pub secret: String,
    pub environment: Environment,
}

impl AuthorityCredentials {
    pub fn new(identity: impl Into<String>, secret: impl Into<String>, environment: Environment) -> Self {
        Self {
            identity: identity.into(),
            secret: secret.into(),
            environment,
        }
    }
}

/// Bearer token; calls made with it go to the host of the environment it was issued for.
#[derive(Clone)]
pub struct AuthToken {
    pub value: String,
    pub environment: Environment,
}

impl AuthToken {
    pub fn new(value: impl Into<String>, environment: Environment) -> Self {
        Self {
            value: value.into(),
            environment,
        }
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthToken")
            .field("value", &"<redacted>")
            .field("environment", &self.environment)
            .finish()
    }
}

impl fmt::Debug for AuthorityCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthorityCredentials")
            .field("identity", &self.identity)
            .field("secret", &"<redacted>")
            .field("environment", &self.environment)
            .finish()
    }
}

/// Body of a reception request. `codigo_generacion` is the idempotency key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    pub ambiente: String,
    pub id_envio: u64,
    pub version: u32,
    pub tipo_dte: String,
    pub documento: String,
    pub codigo_generacion: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitReceipt {
    pub receipt_stamp: String,
    pub processed_at: Option<String>,
    pub observations: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelRequest {
    pub ambiente: String,
    pub id_envio: u64,
    pub version: u32,
    pub documento: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelReceipt {
    pub receipt_stamp: String,
    pub processed_at: Option<String>,
    pub observations: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthorityState {
    Processed,
    Rejected,
    Annulled,
    /// Received but not yet decided.
    Pending,
    NotFound,
    Unknown,
}

impl AuthorityState {
    pub fn from_estado(estado: &str) -> Self {
        match estado.trim().to_ascii_uppercase().as_str() {
            "PROCESADO" => Self::Processed,
            "RECHAZADO" => Self::Rejected,
            "ANULADO" | "INVALIDADO" => Self::Annulled,
            "RECIBIDO" | "EN PROCESO" | "PENDIENTE" => Self::Pending,
            _ => Self::Unknown,
        }
    }
}

/// What the authority currently holds for a generation code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorityStatus {
    pub generation_code: String,
    pub state: AuthorityState,
    pub raw_state: String,
    pub receipt_stamp: Option<String>,
    pub processed_at: Option<String>,
    pub observations: Vec<String>,
}

#[async_trait]
pub trait AuthorityApi: Send + Sync {
    async fn get_token(&self, credentials: &AuthorityCredentials) -> Result<AuthToken>;
    async fn submit(&self, token: &AuthToken, request: &SubmitRequest) -> Result<SubmitReceipt>;
    async fn query(&self, token: &AuthToken, generation_code: &str) -> Result<AuthorityStatus>;
    async fn cancel(&self, token: &AuthToken, request: &CancelRequest) -> Result<CancelReceipt>;
}

// Credential lookup for queued jobs

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn secret_for(&self, tenant_id: &str, identity: &str) -> Option<String>;
}
