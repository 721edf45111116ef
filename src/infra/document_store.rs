use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use super::sqlite::{from_millis, parse_column, to_millis, Database};
use crate::app::ports::{ClaimOutcome, DocumentStore, PurgeOutcome};
use crate::domain::{
    Document, DocumentStatus, DocumentType, Environment, Event, EventAction, EventOutcome,
    FailureKind, NewEvent,
};
use crate::error::{EngineError, Result};

const DOCUMENT_COLUMNS: &str = "id, generation_code, control_number, document_type, environment, \
    status, original_content, signed_envelope, receipt_stamp, observations, attempt_count, \
    processed_at, needs_reconciliation, last_failure, annulment_generation_code, \
    annulment_receipt_stamp, created_at, updated_at";

/// Raw column values, converted to a `Document` outside the rusqlite row callback.
struct DocumentRow {
    id: String,
    generation_code: String,
    control_number: String,
    document_type: String,
    environment: String,
    status: String,
    original_content: String,
    signed_envelope: Option<String>,
    receipt_stamp: Option<String>,
    observations: Option<String>,
    attempt_count: i64,
    processed_at: Option<i64>,
    needs_reconciliation: bool,
    last_failure: Option<String>,
    annulment_generation_code: Option<String>,
    annulment_receipt_stamp: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl DocumentRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            generation_code: row.get(1)?,
            control_number: row.get(2)?,
            document_type: row.get(3)?,
            environment: row.get(4)?,
            status: row.get(5)?,
            original_content: row.get(6)?,
            signed_envelope: row.get(7)?,
            receipt_stamp: row.get(8)?,
            observations: row.get(9)?,
            attempt_count: row.get(10)?,
            processed_at: row.get(11)?,
            needs_reconciliation: row.get(12)?,
            last_failure: row.get(13)?,
            annulment_generation_code: row.get(14)?,
            annulment_receipt_stamp: row.get(15)?,
            created_at: row.get(16)?,
            updated_at: row.get(17)?,
        })
    }

    fn into_document(self) -> Result<Document> {
        Ok(Document {
            id: Uuid::parse_str(&self.id).map_err(|e| EngineError::Storage(e.to_string()))?,
            generation_code: self.generation_code,
            control_number: self.control_number,
            document_type: DocumentType::try_from(self.document_type).map_err(EngineError::Storage)?,
            environment: parse_column::<Environment>(&self.environment)?,
            status: parse_column::<DocumentStatus>(&self.status)?,
            original_content: serde_json::from_str(&self.original_content)?,
            signed_envelope: self.signed_envelope,
            receipt_stamp: self.receipt_stamp,
            observations: self.observations,
            attempt_count: self.attempt_count.max(0) as u32,
            processed_at: self.processed_at.map(from_millis).transpose()?,
            needs_reconciliation: self.needs_reconciliation,
            last_failure: self
                .last_failure
                .as_deref()
                .map(parse_column::<FailureKind>)
                .transpose()?,
            annulment_generation_code: self.annulment_generation_code,
            annulment_receipt_stamp: self.annulment_receipt_stamp,
            created_at: from_millis(self.created_at)?,
            updated_at: from_millis(self.updated_at)?,
        })
    }
}

fn load_document(conn: &Connection, id: Uuid) -> Result<Option<Document>> {
    let sql = format!("SELECT {} FROM documents WHERE id = ?1", DOCUMENT_COLUMNS);
    let row = conn
        .query_row(&sql, params![id.to_string()], DocumentRow::read)
        .optional()?;
    row.map(DocumentRow::into_document).transpose()
}

fn insert_event(conn: &Connection, event: &NewEvent) -> Result<()> {
    let data = event.data.as_ref().map(serde_json::to_string).transpose()?;
    conn.execute(
        "INSERT INTO document_events (document_id, action, outcome, message, data, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            event.document_id.to_string(),
            event.action.as_str(),
            event.outcome.as_str(),
            event.message,
            data,
            to_millis(event.created_at),
        ],
    )?;
    Ok(())
}

fn check_transition(from: DocumentStatus, to: DocumentStatus) -> Result<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(EngineError::InvalidStateTransition {
            from,
            operation: to.operation(),
        })
    }
}

const UPDATE_MUTABLE: &str = "UPDATE documents SET status = ?1, receipt_stamp = ?2, observations = ?3, \
    attempt_count = ?4, processed_at = ?5, needs_reconciliation = ?6, last_failure = ?7, \
    annulment_generation_code = ?8, annulment_receipt_stamp = ?9, updated_at = ?10, \
    lease_holder = NULL, lease_expires_at = NULL";

/// SQLite-backed `DocumentStore`.
#[derive(Clone)]
pub struct SqliteDocumentStore {
    db: Database,
}

impl SqliteDocumentStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    async fn insert_document(&self, document: &Document) -> Result<()> {
        let content = serde_json::to_string(&document.original_content)?;
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO documents (id, generation_code, control_number, document_type, environment,
                    status, original_content, signed_envelope, receipt_stamp, observations, attempt_count,
                    needs_reconciliation, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    document.id.to_string(),
                    document.generation_code,
                    document.control_number,
                    document.document_type.code(),
                    document.environment.as_str(),
                    document.status.as_str(),
                    content,
                    document.signed_envelope,
                    document.receipt_stamp,
                    document.observations,
                    document.attempt_count,
                    document.needs_reconciliation,
                    to_millis(document.created_at),
                    to_millis(document.updated_at),
                ],
            )?;
            Ok(())
        })?;
        debug!("Inserted document {} ({})", document.id, document.generation_code);
        Ok(())
    }

    async fn get_document(&self, id: Uuid) -> Result<Option<Document>> {
        self.db.with_conn(|conn| load_document(conn, id))
    }

    async fn next_control_sequence(
        &self,
        document_type: DocumentType,
        establishment: &str,
    ) -> Result<u64> {
        self.db.with_tx(|tx| {
            tx.execute(
                "INSERT INTO control_sequences (document_type, establishment, last_value) VALUES (?1, ?2, 1)
                 ON CONFLICT(document_type, establishment) DO UPDATE SET last_value = last_value + 1",
                params![document_type.code(), establishment],
            )?;
            let value: i64 = tx.query_row(
                "SELECT last_value FROM control_sequences WHERE document_type = ?1 AND establishment = ?2",
                params![document_type.code(), establishment],
                |r| r.get(0),
            )?;
            Ok(value as u64)
        })
    }

    async fn try_claim(
        &self,
        id: Uuid,
        holder: &str,
        lease_ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome> {
        let now_ms = to_millis(now);
        let expires_ms = now_ms + lease_ttl.as_millis() as i64;
        self.db.with_tx(|tx| {
            let current: Option<(String, Option<String>, Option<i64>)> = tx
                .query_row(
                    "SELECT status, lease_holder, lease_expires_at FROM documents WHERE id = ?1",
                    params![id.to_string()],
                    |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
                )
                .optional()?;
            let Some((status, lease_holder, lease_expires_at)) = current else {
                return Ok(ClaimOutcome::NotFound);
            };
            let status = parse_column::<DocumentStatus>(&status)?;
            let lease_live = lease_holder.is_some() && lease_expires_at.map_or(false, |e| e > now_ms);

            if !status.can_transition_to(DocumentStatus::Transmitting) {
                return Ok(ClaimOutcome::Ineligible(status));
            }
            if lease_live {
                return Ok(ClaimOutcome::Busy);
            }

            tx.execute(
                "UPDATE documents SET status = ?1, lease_holder = ?2, lease_expires_at = ?3, updated_at = ?4
                 WHERE id = ?5",
                params![
                    DocumentStatus::Transmitting.as_str(),
                    holder,
                    expires_ms,
                    now_ms,
                    id.to_string()
                ],
            )?;
            let document = load_document(tx, id)?.ok_or_else(|| EngineError::not_found("document", id))?;
            Ok(ClaimOutcome::Claimed {
                previous: status,
                document,
            })
        })
    }

    async fn try_lease(
        &self,
        id: Uuid,
        holder: &str,
        expected: DocumentStatus,
        lease_ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let now_ms = to_millis(now);
        let expires_ms = now_ms + lease_ttl.as_millis() as i64;
        self.db.with_tx(|tx| {
            let changed = tx.execute(
                "UPDATE documents SET lease_holder = ?1, lease_expires_at = ?2
                 WHERE id = ?3 AND status = ?4
                   AND (lease_holder IS NULL OR lease_expires_at IS NULL OR lease_expires_at <= ?5)",
                params![holder, expires_ms, id.to_string(), expected.as_str(), now_ms],
            )?;
            Ok(changed == 1)
        })
    }

    async fn release_lease(&self, id: Uuid, holder: &str) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE documents SET lease_holder = NULL, lease_expires_at = NULL
                 WHERE id = ?1 AND lease_holder = ?2",
                params![id.to_string(), holder],
            )?;
            Ok(())
        })
    }

    async fn store_signed_envelope(
        &self,
        id: Uuid,
        holder: &str,
        envelope: &str,
        event: &NewEvent,
    ) -> Result<()> {
        self.db.with_tx(|tx| {
            let changed = tx.execute(
                "UPDATE documents SET signed_envelope = ?1, updated_at = ?2
                 WHERE id = ?3 AND lease_holder = ?4 AND signed_envelope IS NULL",
                params![envelope, to_millis(Utc::now()), id.to_string(), holder],
            )?;
            if changed != 1 {
                return Err(EngineError::Storage(format!(
                    "document {} already signed or lease no longer held",
                    id
                )));
            }
            insert_event(tx, event)
        })
    }

    async fn save_fenced(&self, document: &Document, holder: &str, events: &[NewEvent]) -> Result<()> {
        let sql = format!("{} WHERE id = ?11 AND lease_holder = ?12", UPDATE_MUTABLE);
        self.db.with_tx(|tx| {
            let stored: Option<(String, Option<String>)> = tx
                .query_row(
                    "SELECT status, lease_holder FROM documents WHERE id = ?1",
                    params![document.id.to_string()],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()?;
            if let Some((status, Some(current_holder))) = &stored {
                if current_holder == holder {
                    check_transition(parse_column::<DocumentStatus>(status)?, document.status)?;
                }
            }
            let changed = tx.execute(
                &sql,
                params![
                    document.status.as_str(),
                    document.receipt_stamp,
                    document.observations,
                    document.attempt_count,
                    document.processed_at.map(to_millis),
                    document.needs_reconciliation,
                    document.last_failure.map(|k| k.as_str()),
                    document.annulment_generation_code,
                    document.annulment_receipt_stamp,
                    to_millis(document.updated_at),
                    document.id.to_string(),
                    holder,
                ],
            )?;
            if changed != 1 {
                return Err(EngineError::Storage(format!(
                    "lease on document {} no longer held by {}",
                    document.id, holder
                )));
            }
            for event in events {
                insert_event(tx, event)?;
            }
            Ok(())
        })
    }

    async fn save_if_status(
        &self,
        document: &Document,
        expected: DocumentStatus,
        events: &[NewEvent],
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let sql = format!(
            "{} WHERE id = ?11 AND status = ?12
               AND (lease_holder IS NULL OR lease_expires_at IS NULL OR lease_expires_at <= ?13)",
            UPDATE_MUTABLE
        );
        check_transition(expected, document.status)?;
        self.db.with_tx(|tx| {
            let changed = tx.execute(
                &sql,
                params![
                    document.status.as_str(),
                    document.receipt_stamp,
                    document.observations,
                    document.attempt_count,
                    document.processed_at.map(to_millis),
                    document.needs_reconciliation,
                    document.last_failure.map(|k| k.as_str()),
                    document.annulment_generation_code,
                    document.annulment_receipt_stamp,
                    to_millis(document.updated_at),
                    document.id.to_string(),
                    expected.as_str(),
                    to_millis(now),
                ],
            )?;
            if changed != 1 {
                return Ok(false);
            }
            for event in events {
                insert_event(tx, event)?;
            }
            Ok(true)
        })
    }

    async fn append_event(&self, event: &NewEvent) -> Result<()> {
        self.db.with_conn(|conn| insert_event(conn, event))
    }

    async fn list_events(&self, document_id: Uuid) -> Result<Vec<Event>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, action, outcome, message, data, created_at
                 FROM document_events WHERE document_id = ?1 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![document_id.to_string()], |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, Option<String>>(4)?,
                    r.get::<_, i64>(5)?,
                ))
            })?;

            let mut events = Vec::new();
            for row in rows {
                let (id, action, outcome, message, data, created_at) = row?;
                events.push(Event {
                    id,
                    document_id,
                    action: parse_column::<EventAction>(&action)?,
                    outcome: parse_column::<EventOutcome>(&outcome)?,
                    message,
                    data: data.as_deref().map(serde_json::from_str).transpose()?,
                    created_at: from_millis(created_at)?,
                });
            }
            Ok(events)
        })
    }

    async fn purge_document(&self, id: Uuid, now: DateTime<Utc>) -> Result<PurgeOutcome> {
        self.db.with_tx(|tx| {
            let lease: Option<(Option<String>, Option<i64>)> = tx
                .query_row(
                    "SELECT lease_holder, lease_expires_at FROM documents WHERE id = ?1",
                    params![id.to_string()],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()?;
            let Some((holder, expires_at)) = lease else {
                return Ok(PurgeOutcome::NotFound);
            };
            if holder.is_some() && expires_at.map_or(false, |e| e > to_millis(now)) {
                return Ok(PurgeOutcome::Leased);
            }
            tx.execute(
                "DELETE FROM document_events WHERE document_id = ?1",
                params![id.to_string()],
            )?;
            tx.execute("DELETE FROM documents WHERE id = ?1", params![id.to_string()])?;
            Ok(PurgeOutcome::Purged)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::new_generation_code;
    use serde_json::json;

    fn sample_document() -> Document {
        let now = Utc::now();
        Document {
            id: Uuid::new_v4(),
            generation_code: new_generation_code(),
            control_number: "DTE-01-M001P001-000000000000001".to_string(),
            document_type: DocumentType::Invoice,
            environment: Environment::Test,
            status: DocumentStatus::Created,
            original_content: json!({"identificacion": {"tipoDte": "01"}}),
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
        }
    }

    fn store() -> SqliteDocumentStore {
        SqliteDocumentStore::new(Database::open_in_memory().unwrap())
    }

    #[tokio::test]
    async fn insert_and_load() {
        let store = store();
        let doc = sample_document();
        store.insert_document(&doc).await.unwrap();

        let loaded = store.get_document(doc.id).await.unwrap().unwrap();
        assert_eq!(loaded.generation_code, doc.generation_code);
        assert_eq!(loaded.original_content, doc.original_content);
        assert_eq!(loaded.status, DocumentStatus::Created);
    }

    #[tokio::test]
    async fn generation_code_is_unique() {
        let store = store();
        let doc = sample_document();
        store.insert_document(&doc).await.unwrap();

        let mut dup = sample_document();
        dup.generation_code = doc.generation_code.clone();
        assert!(store.insert_document(&dup).await.is_err());
    }

    #[tokio::test]
    async fn only_one_claim_wins_while_lease_is_live() {
        let store = store();
        let doc = sample_document();
        store.insert_document(&doc).await.unwrap();
        let now = Utc::now();
        let ttl = Duration::from_secs(30);

        let first = store.try_claim(doc.id, "a", ttl, now).await.unwrap();
        assert!(matches!(
            first,
            ClaimOutcome::Claimed { previous: DocumentStatus::Created, .. }
        ));

        let second = store.try_claim(doc.id, "b", ttl, now).await.unwrap();
        assert!(matches!(second, ClaimOutcome::Busy));

        // after expiry the claim can be taken over
        let later = now + chrono::Duration::seconds(31);
        let third = store.try_claim(doc.id, "b", ttl, later).await.unwrap();
        assert!(matches!(
            third,
            ClaimOutcome::Claimed { previous: DocumentStatus::Transmitting, .. }
        ));
    }

    #[tokio::test]
    async fn processed_documents_are_ineligible() {
        let store = store();
        let mut doc = sample_document();
        doc.status = DocumentStatus::Processed;
        store.insert_document(&doc).await.unwrap();

        let outcome = store
            .try_claim(doc.id, "a", Duration::from_secs(5), Utc::now())
            .await
            .unwrap();
        assert!(matches!(outcome, ClaimOutcome::Ineligible(DocumentStatus::Processed)));
    }

    #[tokio::test]
    async fn signed_envelope_is_written_once() {
        let store = store();
        let doc = sample_document();
        store.insert_document(&doc).await.unwrap();
        store
            .try_claim(doc.id, "a", Duration::from_secs(30), Utc::now())
            .await
            .unwrap();

        let event = NewEvent::success(doc.id, EventAction::Sign, "signed");
        store.store_signed_envelope(doc.id, "a", "jws-1", &event).await.unwrap();
        assert!(store.store_signed_envelope(doc.id, "a", "jws-2", &event).await.is_err());

        let stored = store.get_document(doc.id).await.unwrap().unwrap();
        assert_eq!(stored.signed_envelope.as_deref(), Some("jws-1"));
        assert_eq!(store.list_events(doc.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn save_fenced_requires_the_lease() {
        let store = store();
        let doc = sample_document();
        store.insert_document(&doc).await.unwrap();
        let claimed = match store
            .try_claim(doc.id, "a", Duration::from_secs(30), Utc::now())
            .await
            .unwrap()
        {
            ClaimOutcome::Claimed { document, .. } => document,
            other => panic!("unexpected {:?}", other),
        };

        let mut done = claimed.clone();
        done.status = DocumentStatus::Processed;
        done.receipt_stamp = Some("S1".to_string());
        let events = [NewEvent::success(doc.id, EventAction::Response, "processed")];
        assert!(store.save_fenced(&done, "intruder", &events).await.is_err());
        store.save_fenced(&done, "a", &events).await.unwrap();

        let stored = store.get_document(doc.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DocumentStatus::Processed);
        assert_eq!(stored.receipt_stamp.as_deref(), Some("S1"));
        // lease released: a second fenced save by the old holder fails
        assert!(store.save_fenced(&done, "a", &events).await.is_err());
    }

    #[tokio::test]
    async fn control_sequences_are_per_type_and_establishment() {
        let store = store();
        assert_eq!(store.next_control_sequence(DocumentType::Invoice, "M001P001").await.unwrap(), 1);
        assert_eq!(store.next_control_sequence(DocumentType::Invoice, "M001P001").await.unwrap(), 2);
        assert_eq!(
            store
                .next_control_sequence(DocumentType::TaxCreditInvoice, "M001P001")
                .await
                .unwrap(),
            1
        );
        assert_eq!(store.next_control_sequence(DocumentType::Invoice, "M002P001").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn purge_removes_events() {
        let store = store();
        let doc = sample_document();
        store.insert_document(&doc).await.unwrap();
        store
            .append_event(&NewEvent::failure(doc.id, EventAction::Error, "boom"))
            .await
            .unwrap();

        assert_eq!(store.purge_document(doc.id, Utc::now()).await.unwrap(), PurgeOutcome::Purged);
        assert!(store.get_document(doc.id).await.unwrap().is_none());
        assert!(store.list_events(doc.id).await.unwrap().is_empty());
        assert_eq!(store.purge_document(doc.id, Utc::now()).await.unwrap(), PurgeOutcome::NotFound);
    }

    #[tokio::test]
    async fn purge_waits_for_the_lease_to_lapse() {
        let store = store();
        let doc = sample_document();
        store.insert_document(&doc).await.unwrap();
        let now = Utc::now();
        store.try_claim(doc.id, "a", Duration::from_secs(30), now).await.unwrap();

        assert_eq!(store.purge_document(doc.id, now).await.unwrap(), PurgeOutcome::Leased);
        assert!(store.get_document(doc.id).await.unwrap().is_some());

        let later = now + chrono::Duration::seconds(31);
        assert_eq!(store.purge_document(doc.id, later).await.unwrap(), PurgeOutcome::Purged);
    }

    #[tokio::test]
    async fn saves_follow_the_transition_table() {
        let store = store();
        let doc = sample_document();
        store.insert_document(&doc).await.unwrap();
        store
            .try_claim(doc.id, "a", Duration::from_secs(30), Utc::now())
            .await
            .unwrap();

        let mut backwards = doc.clone();
        backwards.status = DocumentStatus::Created;
        let err = store.save_fenced(&backwards, "a", &[]).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidStateTransition {
                from: DocumentStatus::Transmitting,
                ..
            }
        ));

        let mut annulled = doc.clone();
        annulled.status = DocumentStatus::Annulled;
        let err = store
            .save_if_status(&annulled, DocumentStatus::Created, &[], Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidStateTransition { .. }));
        assert_eq!(
            store.get_document(doc.id).await.unwrap().unwrap().status,
            DocumentStatus::Transmitting
        );
    }
}
