use crate::domain::{DocumentStatus, Environment};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("document {0} has already been processed by the authority")]
    AlreadyProcessed(String),

    #[error("signing unavailable: {0}")]
    SigningUnavailable(String),

    #[error("signing failed: {0}")]
    SigningFailed(String),

    #[error("token acquisition failed: {0}")]
    TokenUnavailable(String),

    #[error("rejected by authority: {}", .observations.join("; "))]
    AuthorityRejected { observations: Vec<String> },

    #[error("authority unavailable: {0}")]
    AuthorityUnavailable(String),

    #[error("cannot {operation} a document in status {from}")]
    InvalidStateTransition {
        from: DocumentStatus,
        operation: &'static str,
    },

    #[error("no authority credentials for identity {0}")]
    MissingCredentials(String),

    #[error("document belongs to the {document} environment but credentials are for {credentials}")]
    EnvironmentMismatch {
        document: Environment,
        credentials: Environment,
    },

    #[error("invalid document: {0}")]
    InvalidDocument(String),

    #[error("another transmission of document {0} is still in flight")]
    TransmissionInFlight(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Whether a later attempt can succeed without anyone changing the document.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::AuthorityUnavailable(_)
                | Self::TokenUnavailable(_)
                | Self::SigningUnavailable(_)
                | Self::SigningFailed(_)
                | Self::TransmissionInFlight(_)
        )
    }

    /// Stable machine-readable code used in results and HTTP responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "NOT_FOUND",
            Self::AlreadyProcessed(_) => "ALREADY_PROCESSED",
            Self::SigningUnavailable(_) => "SIGNING_UNAVAILABLE",
            Self::SigningFailed(_) => "SIGNING_FAILED",
            Self::TokenUnavailable(_) => "TOKEN_UNAVAILABLE",
            Self::AuthorityRejected { .. } => "AUTHORITY_REJECTED",
            Self::AuthorityUnavailable(_) => "AUTHORITY_UNAVAILABLE",
            Self::InvalidStateTransition { .. } => "INVALID_STATE_TRANSITION",
            Self::MissingCredentials(_) => "MISSING_CREDENTIALS",
            Self::EnvironmentMismatch { .. } => "ENVIRONMENT_MISMATCH",
            Self::InvalidDocument(_) => "INVALID_DOCUMENT",
            Self::TransmissionInFlight(_) => "TRANSMISSION_IN_FLIGHT",
            Self::Storage(_) => "STORAGE",
            Self::Config(_) => "CONFIG",
            Self::Json(_) => "JSON",
            Self::Io(_) => "IO",
        }
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
