use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Instant;
use tracing::{debug, warn};

use crate::app::ports::{
    AuthToken, AuthorityApi, AuthorityCredentials, AuthorityState, AuthorityStatus, CancelReceipt,
    CancelRequest, SubmitReceipt, SubmitRequest,
};
use crate::config::AuthorityConfig;
use crate::error::{EngineError, Result};

const MAX_BODY_IN_ERRORS: usize = 300;

#[derive(Debug, Deserialize)]
struct AuthResponse {
    status: String,
    #[serde(default)]
    body: serde_json::Value,
}

/// Reception, annulment and query responses share this shape.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthorityResponse {
    estado: Option<String>,
    sello_recibido: Option<String>,
    fh_procesamiento: Option<String>,
    #[serde(default)]
    observaciones: Option<Vec<String>>,
    descripcion_msg: Option<String>,
}

impl AuthorityResponse {
    fn state(&self) -> AuthorityState {
        self.estado
            .as_deref()
            .map(AuthorityState::from_estado)
            .unwrap_or(AuthorityState::Unknown)
    }

    fn observations(&self) -> Vec<String> {
        self.observaciones.clone().unwrap_or_default()
    }

    /// Observations plus the headline message, for rejections.
    fn rejection_observations(&self) -> Vec<String> {
        let mut out = self.observations();
        if let Some(msg) = self.descripcion_msg.as_ref().filter(|m| !m.trim().is_empty()) {
            if !out.iter().any(|o| o == msg) {
                out.push(msg.clone());
            }
        }
        if out.is_empty() {
            out.push("rejected without observations".to_string());
        }
        out
    }
}

fn truncate(body: &str) -> String {
    if body.len() <= MAX_BODY_IN_ERRORS {
        return body.to_string();
    }
    let mut end = MAX_BODY_IN_ERRORS;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}

fn bearer(token: &str) -> String {
    if token.starts_with("Bearer ") {
        token.to_string()
    } else {
        format!("Bearer {}", token)
    }
}

fn is_transient(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
}

/// Interpret a reception or annulment response. Only an explicit business
/// decision becomes `AuthorityRejected`; anything else is retryable.
fn classify_decision(status: StatusCode, body: &str) -> Result<AuthorityResponse> {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(EngineError::TokenUnavailable(format!(
            "authority refused the token (HTTP {})",
            status.as_u16()
        )));
    }
    if is_transient(status) {
        return Err(EngineError::AuthorityUnavailable(format!(
            "HTTP {}: {}",
            status.as_u16(),
            truncate(body)
        )));
    }

    let parsed: Option<AuthorityResponse> = serde_json::from_str(body).ok();
    match parsed {
        Some(resp) => match resp.state() {
            AuthorityState::Processed if resp.sello_recibido.is_some() => Ok(resp),
            AuthorityState::Rejected => Err(EngineError::AuthorityRejected {
                observations: resp.rejection_observations(),
            }),
            _ if status.is_client_error() => Err(EngineError::AuthorityRejected {
                observations: resp.rejection_observations(),
            }),
            other => Err(EngineError::AuthorityUnavailable(format!(
                "unexpected authority state {:?} ({})",
                other,
                resp.estado.as_deref().unwrap_or("none")
            ))),
        },
        None if status.is_client_error() => Err(EngineError::AuthorityRejected {
            observations: vec![format!("HTTP {}: {}", status.as_u16(), truncate(body))],
        }),
        None => Err(EngineError::AuthorityUnavailable(format!(
            "unreadable authority response (HTTP {}): {}",
            status.as_u16(),
            truncate(body)
        ))),
    }
}

/// HTTP client for the tax authority's auth, reception, query and annulment endpoints.
pub struct MhClient {
    http: reqwest::Client,
    config: AuthorityConfig,
}

impl MhClient {
    pub fn new(config: AuthorityConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .user_agent(concat!("dte_transmitter/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| EngineError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { http, config })
    }

    async fn post_decision<T: serde::Serialize>(
        &self,
        operation: &'static str,
        path: &str,
        token: &AuthToken,
        body: &T,
    ) -> Result<AuthorityResponse> {
        let url = self.config.url(token.environment, path);
        let started = Instant::now();
        let resp = self
            .http
            .post(&url)
            .header(AUTHORIZATION, bearer(&token.value))
            .json(body)
            .send()
            .await
            .map_err(|e| EngineError::AuthorityUnavailable(format!("{} request failed: {}", operation, e)))?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| EngineError::AuthorityUnavailable(format!("{} response unreadable: {}", operation, e)))?;
        crate::metrics::transmission::authority_call(operation, started.elapsed().as_secs_f64());
        debug!("{} answered HTTP {}", operation, status.as_u16());
        classify_decision(status, &text)
    }
}

#[async_trait]
impl AuthorityApi for MhClient {
    async fn get_token(&self, credentials: &AuthorityCredentials) -> Result<AuthToken> {
        let url = self.config.url(credentials.environment, &self.config.auth_path);
        let started = Instant::now();
        let resp = self
            .http
            .post(&url)
            .form(&[
                ("user", credentials.identity.as_str()),
                ("pwd", credentials.secret.as_str()),
            ])
            .send()
            .await
            .map_err(|e| EngineError::TokenUnavailable(format!("auth request failed: {}", e)))?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| EngineError::TokenUnavailable(format!("auth response unreadable: {}", e)))?;
        crate::metrics::transmission::authority_call("auth", started.elapsed().as_secs_f64());

        if !status.is_success() {
            warn!("Token request for {} failed with HTTP {}", credentials.identity, status.as_u16());
            return Err(EngineError::TokenUnavailable(format!(
                "HTTP {}: {}",
                status.as_u16(),
                truncate(&text)
            )));
        }
        let parsed: AuthResponse = serde_json::from_str(&text)
            .map_err(|e| EngineError::TokenUnavailable(format!("unexpected auth response: {}", e)))?;
        if !parsed.status.eq_ignore_ascii_case("OK") {
            return Err(EngineError::TokenUnavailable(format!(
                "auth status {}: {}",
                parsed.status,
                truncate(&parsed.body.to_string())
            )));
        }
        parsed
            .body
            .get("token")
            .and_then(|t| t.as_str())
            .filter(|t| !t.is_empty())
            .map(|t| AuthToken::new(t, credentials.environment))
            .ok_or_else(|| EngineError::TokenUnavailable("auth response carried no token".to_string()))
    }

    async fn submit(&self, token: &AuthToken, request: &SubmitRequest) -> Result<SubmitReceipt> {
        let resp = self
            .post_decision("reception", &self.config.reception_path, token, request)
            .await?;
        let observations = resp.observations();
        Ok(SubmitReceipt {
            receipt_stamp: resp.sello_recibido.unwrap_or_default(),
            processed_at: resp.fh_procesamiento,
            observations,
        })
    }

    async fn query(&self, token: &AuthToken, generation_code: &str) -> Result<AuthorityStatus> {
        let url = format!(
            "{}/{}",
            self.config
                .url(token.environment, &self.config.query_path)
                .trim_end_matches('/'),
            generation_code
        );
        let started = Instant::now();
        let resp = self
            .http
            .get(&url)
            .header(AUTHORIZATION, bearer(&token.value))
            .send()
            .await
            .map_err(|e| EngineError::AuthorityUnavailable(format!("query request failed: {}", e)))?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| EngineError::AuthorityUnavailable(format!("query response unreadable: {}", e)))?;
        crate::metrics::transmission::authority_call("query", started.elapsed().as_secs_f64());

        if status == StatusCode::NOT_FOUND {
            return Ok(AuthorityStatus {
                generation_code: generation_code.to_string(),
                state: AuthorityState::NotFound,
                raw_state: "NOT_FOUND".to_string(),
                receipt_stamp: None,
                processed_at: None,
                observations: Vec::new(),
            });
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(EngineError::TokenUnavailable(format!(
                "authority refused the token (HTTP {})",
                status.as_u16()
            )));
        }
        if !status.is_success() {
            return Err(EngineError::AuthorityUnavailable(format!(
                "query HTTP {}: {}",
                status.as_u16(),
                truncate(&text)
            )));
        }
        let parsed: AuthorityResponse = serde_json::from_str(&text)
            .map_err(|e| EngineError::AuthorityUnavailable(format!("unreadable query response: {}", e)))?;
        Ok(AuthorityStatus {
            generation_code: generation_code.to_string(),
            state: parsed.state(),
            raw_state: parsed.estado.clone().unwrap_or_default(),
            observations: parsed.observations(),
            receipt_stamp: parsed.sello_recibido,
            processed_at: parsed.fh_procesamiento,
        })
    }

    async fn cancel(&self, token: &AuthToken, request: &CancelRequest) -> Result<CancelReceipt> {
        let resp = self
            .post_decision("annulment", &self.config.cancel_path, token, request)
            .await?;
        let observations = resp.observations();
        Ok(CancelReceipt {
            receipt_stamp: resp.sello_recibido.unwrap_or_default(),
            processed_at: resp.fh_procesamiento,
            observations,
        })
    }
}
