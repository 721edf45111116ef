use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::app::ports::Signer;
use crate::config::SignerConfig;
use crate::error::{EngineError, Result};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SignRequest<'a> {
    nit: &'a str,
    activo: bool,
    password_pri: &'a str,
    dte_json: &'a serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct SignResponse {
    status: String,
    #[serde(default)]
    body: serde_json::Value,
}

/// Client for the local signing service that holds the issuer certificate.
pub struct SigningServiceClient {
    http: reqwest::Client,
    config: SignerConfig,
}

impl SigningServiceClient {
    pub fn new(config: SignerConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.request_timeout_secs.max(1)))
            .build()
            .map_err(|e| EngineError::Config(format!("failed to build signer client: {}", e)))?;
        Ok(Self { http, config })
    }

    fn credentials(&self) -> Option<(&str, &str)> {
        let nit = self.config.nit.as_deref().filter(|n| !n.is_empty())?;
        let password = self
            .config
            .private_key_password
            .as_deref()
            .filter(|p| !p.is_empty())?;
        Some((nit, password))
    }
}

fn error_message(body: &serde_json::Value) -> String {
    match body {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Object(map) => map
            .get("mensaje")
            .map(|m| match m {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .unwrap_or_else(|| body.to_string()),
        other => other.to_string(),
    }
}

#[async_trait]
impl Signer for SigningServiceClient {
    async fn is_certificate_loaded(&self) -> bool {
        self.credentials().is_some()
    }

    async fn sign(&self, document: &serde_json::Value) -> Result<String> {
        let (nit, password) = self.credentials().ok_or_else(|| {
            EngineError::SigningUnavailable("no signing certificate credentials configured".to_string())
        })?;
        let request = SignRequest {
            nit,
            activo: true,
            password_pri: password,
            dte_json: document,
        };

        let resp = self
            .http
            .post(&self.config.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| EngineError::SigningUnavailable(format!("signing service unreachable: {}", e)))?;
        let status = resp.status();
        if status.is_server_error() {
            return Err(EngineError::SigningUnavailable(format!(
                "signing service answered HTTP {}",
                status.as_u16()
            )));
        }
        let parsed: SignResponse = resp
            .json()
            .await
            .map_err(|e| EngineError::SigningFailed(format!("unreadable signing response: {}", e)))?;

        if !parsed.status.eq_ignore_ascii_case("OK") {
            return Err(EngineError::SigningFailed(error_message(&parsed.body)));
        }
        let envelope = parsed
            .body
            .as_str()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| EngineError::SigningFailed("signing service returned no envelope".to_string()))?;
        debug!("Signed document ({} bytes)", envelope.len());
        Ok(envelope.to_string())
    }
}
