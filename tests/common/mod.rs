#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dte_transmitter::app::ports::{
    AuthToken, AuthorityApi, AuthorityCredentials, AuthorityState, AuthorityStatus, CancelReceipt,
    CancelRequest, Signer, SubmitReceipt, SubmitRequest,
};
use dte_transmitter::app::{EngineSettings, TransmissionEngine};
use dte_transmitter::domain::{Document, DocumentType, Environment, NewDocument, RetryPolicy};
use dte_transmitter::error::{EngineError, Result};
use dte_transmitter::infra::{Database, SqliteDocumentStore, SqliteJobQueue};

pub struct FakeSigner {
    pub loaded: AtomicBool,
    pub calls: AtomicUsize,
}

impl FakeSigner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            loaded: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Signer for FakeSigner {
    async fn is_certificate_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    async fn sign(&self, document: &serde_json::Value) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let code = document
            .pointer("/identificacion/codigoGeneracion")
            .and_then(|c| c.as_str())
            .unwrap_or("unknown");
        Ok(format!("signed.{}", code))
    }
}

/// Scripted reception / annulment outcome.
#[derive(Debug, Clone)]
pub enum Decision {
    Accept(String),
    Reject(Vec<String>),
    Unavailable(String),
}

impl Decision {
    fn into_result(self) -> Result<(String, Vec<String>)> {
        match self {
            Decision::Accept(stamp) => Ok((stamp, Vec::new())),
            Decision::Reject(observations) => Err(EngineError::AuthorityRejected { observations }),
            Decision::Unavailable(msg) => Err(EngineError::AuthorityUnavailable(msg)),
        }
    }
}

pub struct FakeAuthority {
    pub token_calls: AtomicUsize,
    pub submit_calls: AtomicUsize,
    pub query_calls: AtomicUsize,
    pub cancel_calls: AtomicUsize,
    pub token_fails: AtomicBool,
    /// Consumed front to back; `default_submit` applies once empty.
    pub submit_script: Mutex<VecDeque<Decision>>,
    pub default_submit: Mutex<Decision>,
    pub cancel_decision: Mutex<Decision>,
    pub query_state: Mutex<Option<(AuthorityState, Option<String>)>>,
    pub submit_delay: Mutex<Duration>,
    pub submitted: Mutex<Vec<SubmitRequest>>,
    /// Calls in arrival order: "token", "submit", "query", "cancel".
    pub log: Mutex<Vec<&'static str>>,
}

impl FakeAuthority {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            token_calls: AtomicUsize::new(0),
            submit_calls: AtomicUsize::new(0),
            query_calls: AtomicUsize::new(0),
            cancel_calls: AtomicUsize::new(0),
            token_fails: AtomicBool::new(false),
            submit_script: Mutex::new(VecDeque::new()),
            default_submit: Mutex::new(Decision::Accept("S1".to_string())),
            cancel_decision: Mutex::new(Decision::Accept("A-S1".to_string())),
            query_state: Mutex::new(None),
            submit_delay: Mutex::new(Duration::ZERO),
            submitted: Mutex::new(Vec::new()),
            log: Mutex::new(Vec::new()),
        })
    }

    pub fn script(&self, decisions: impl IntoIterator<Item = Decision>) {
        self.submit_script.lock().unwrap().extend(decisions);
    }

    pub fn always(&self, decision: Decision) {
        *self.default_submit.lock().unwrap() = decision;
    }

    pub fn answer_query(&self, state: AuthorityState, stamp: Option<&str>) {
        *self.query_state.lock().unwrap() = Some((state, stamp.map(str::to_string)));
    }

    pub fn delay_submit(&self, delay: Duration) {
        *self.submit_delay.lock().unwrap() = delay;
    }

    pub fn submits(&self) -> usize {
        self.submit_calls.load(Ordering::SeqCst)
    }

    pub fn queries(&self) -> usize {
        self.query_calls.load(Ordering::SeqCst)
    }

    pub fn cancels(&self) -> usize {
        self.cancel_calls.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.log.lock().unwrap().clone()
    }

    fn record(&self, call: &'static str) {
        self.log.lock().unwrap().push(call);
    }
}

#[async_trait]
impl AuthorityApi for FakeAuthority {
    async fn get_token(&self, credentials: &AuthorityCredentials) -> Result<AuthToken> {
        self.token_calls.fetch_add(1, Ordering::SeqCst);
        self.record("token");
        if self.token_fails.load(Ordering::SeqCst) {
            return Err(EngineError::TokenUnavailable("HTTP 503".to_string()));
        }
        Ok(AuthToken::new(
            format!("token-{}", credentials.identity),
            credentials.environment,
        ))
    }

    async fn submit(&self, _token: &AuthToken, request: &SubmitRequest) -> Result<SubmitReceipt> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        self.record("submit");
        self.submitted.lock().unwrap().push(request.clone());
        let delay = *self.submit_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let decision = {
            let scripted = self.submit_script.lock().unwrap().pop_front();
            scripted.unwrap_or_else(|| self.default_submit.lock().unwrap().clone())
        };
        let (stamp, observations) = decision.into_result()?;
        Ok(SubmitReceipt {
            receipt_stamp: stamp,
            processed_at: Some("18/10/2026 10:15:30".to_string()),
            observations,
        })
    }

    async fn query(&self, _token: &AuthToken, generation_code: &str) -> Result<AuthorityStatus> {
        self.query_calls.fetch_add(1, Ordering::SeqCst);
        self.record("query");
        let (state, stamp) = self
            .query_state
            .lock()
            .unwrap()
            .clone()
            .unwrap_or((AuthorityState::NotFound, None));
        Ok(AuthorityStatus {
            generation_code: generation_code.to_string(),
            state,
            raw_state: format!("{:?}", state),
            receipt_stamp: stamp,
            processed_at: None,
            observations: Vec::new(),
        })
    }

    async fn cancel(&self, _token: &AuthToken, _request: &CancelRequest) -> Result<CancelReceipt> {
        self.cancel_calls.fetch_add(1, Ordering::SeqCst);
        self.record("cancel");
        let decision = self.cancel_decision.lock().unwrap().clone();
        let (stamp, observations) = decision.into_result()?;
        Ok(CancelReceipt {
            receipt_stamp: stamp,
            processed_at: None,
            observations,
        })
    }
}

pub struct Harness {
    pub engine: Arc<TransmissionEngine>,
    pub store: Arc<SqliteDocumentStore>,
    pub queue: Arc<SqliteJobQueue>,
    pub signer: Arc<FakeSigner>,
    pub authority: Arc<FakeAuthority>,
}

pub fn test_settings() -> EngineSettings {
    EngineSettings {
        in_flight_wait: Duration::from_secs(5),
        in_flight_poll: Duration::from_millis(10),
        authority_timeout: Duration::from_secs(5),
        signing_timeout: Duration::from_secs(5),
        retry: RetryPolicy::default(),
        ..EngineSettings::default()
    }
}

fn build(with_queue: bool, settings: EngineSettings) -> Harness {
    let db = Database::open_in_memory().unwrap();
    let store = Arc::new(SqliteDocumentStore::new(db.clone()));
    let queue = Arc::new(SqliteJobQueue::new(db));
    let signer = FakeSigner::new();
    let authority = FakeAuthority::new();
    let mut engine = TransmissionEngine::new(
        store.clone(),
        signer.clone(),
        authority.clone(),
        settings,
    );
    if with_queue {
        engine = engine.with_queue(queue.clone());
    }
    Harness {
        engine: Arc::new(engine),
        store,
        queue,
        signer,
        authority,
    }
}

pub fn harness() -> Harness {
    build(true, test_settings())
}

pub fn harness_with(settings: EngineSettings) -> Harness {
    build(true, settings)
}

pub fn harness_without_queue() -> Harness {
    build(false, test_settings())
}

pub const ISSUER_NIT: &str = "06140101001010";

pub fn credentials() -> AuthorityCredentials {
    AuthorityCredentials::new(ISSUER_NIT, "s3cret", Environment::Test)
}

pub fn invoice_content() -> serde_json::Value {
    json!({
        "identificacion": {"fecEmi": "2026-10-18", "horEmi": "10:00:00"},
        "emisor": {"nit": ISSUER_NIT, "nombre": "ACME S.A. de C.V."},
        "receptor": {"tipoDocumento": "13", "numDocumento": "01234567-8", "nombre": "Cliente"},
        "cuerpoDocumento": [{"numItem": 1, "descripcion": "Servicio", "precioUni": 10.0}],
        "resumen": {"totalPagar": 11.3, "totalIva": 1.3}
    })
}

pub async fn new_invoice(h: &Harness) -> Document {
    h.engine
        .create_document(NewDocument {
            document_type: DocumentType::Invoice,
            environment: Environment::Test,
            content: invoice_content(),
            control_number: None,
            establishment: None,
        })
        .await
        .unwrap()
}
