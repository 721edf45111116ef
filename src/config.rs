use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::domain::{Environment, RetryPolicy};
use crate::error::{EngineError, Result};

pub const DEFAULT_CONFIG_PATH: &str = "config.toml";
pub const CONFIG_PATH_ENV: &str = "DTE_CONFIG";
pub const SIGNER_PASSWORD_ENV: &str = "DTE_SIGNER_PASSWORD";
pub const SECRET_ENV_PREFIX: &str = "DTE_SECRET_";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub authority: AuthorityConfig,
    pub signer: SignerConfig,
    pub queue: QueueConfig,
    pub engine: EngineConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
    /// Authority secrets by identity, used by the worker for queued jobs.
    pub credentials: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "data/dte.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthorityConfig {
    /// Host serving `ambiente` 00 documents.
    pub test_base_url: String,
    /// Host serving `ambiente` 01 documents.
    pub production_base_url: String,
    pub auth_path: String,
    pub reception_path: String,
    pub query_path: String,
    pub cancel_path: String,
    pub request_timeout_secs: u64,
    /// Schema version declared for annulment documents.
    pub annulment_version: u32,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            test_base_url: "https://apitest.dtes.mh.gob.sv".to_string(),
            production_base_url: "https://api.dtes.mh.gob.sv".to_string(),
            auth_path: "/seguridad/auth".to_string(),
            reception_path: "/fesv/recepciondte".to_string(),
            query_path: "/fesv/recepcion/consultadte".to_string(),
            cancel_path: "/fesv/anulardte".to_string(),
            request_timeout_secs: 30,
            annulment_version: 2,
        }
    }
}

impl AuthorityConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn base_url(&self, environment: Environment) -> &str {
        match environment {
            Environment::Test => &self.test_base_url,
            Environment::Production => &self.production_base_url,
        }
    }

    pub fn url(&self, environment: Environment, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url(environment).trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SignerConfig {
    pub url: String,
    pub nit: Option<String>,
    pub private_key_password: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for SignerConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8113/firmardocumento/".to_string(),
            nit: None,
            private_key_password: None,
            request_timeout_secs: 15,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub enabled: bool,
    #[serde(flatten)]
    pub retry: RetryPolicy,
    pub poll_interval_ms: u64,
    pub workers: usize,
    pub stale_job_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retry: RetryPolicy::default(),
            poll_interval_ms: 500,
            workers: 4,
            stale_job_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub lease_ttl_secs: u64,
    pub in_flight_wait_secs: u64,
    pub in_flight_poll_ms: u64,
    pub signing_timeout_secs: u64,
    /// Establishment code used for generated control numbers.
    pub establishment: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lease_ttl_secs: 120,
            in_flight_wait_secs: 60,
            in_flight_poll_ms: 250,
            signing_timeout_secs: 15,
            establishment: "M001P001".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub directory: String,
    pub json_file: bool,
    pub default_filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: "logs".to_string(),
            json_file: true,
            default_filter: "dte_transmitter=info,info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Prometheus listener address; metrics are not exported when unset.
    pub bind: Option<String>,
}

impl Config {
    /// Load from `path`, or from `DTE_CONFIG` / `config.toml`. A missing default
    /// file yields the defaults; a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let explicit = path
            .map(|p| p.to_path_buf())
            .or_else(|| std::env::var(CONFIG_PATH_ENV).ok().map(Into::into));

        let mut config = match explicit {
            Some(p) => Self::from_file(&p)?,
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_PATH))?
            }
            None => Config::default(),
        };
        config.apply_env_overrides(std::env::vars());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            EngineError::Config(format!("Failed to read config file '{}': {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| EngineError::Config(e.to_string()))
    }

    /// `DTE_SIGNER_PASSWORD` and `DTE_SECRET_<IDENTITY>` take precedence over the file.
    pub fn apply_env_overrides(&mut self, vars: impl IntoIterator<Item = (String, String)>) {
        for (key, value) in vars {
            if key == SIGNER_PASSWORD_ENV {
                self.signer.private_key_password = Some(value);
            } else if let Some(identity) = key.strip_prefix(SECRET_ENV_PREFIX) {
                if !identity.is_empty() {
                    self.credentials.insert(identity.to_string(), value);
                }
            }
        }
    }
}
