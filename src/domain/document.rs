use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Lifecycle position of a document. Signing is tracked through
/// `Document::signed_envelope`, not through a status of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentStatus {
    Created,
    Transmitting,
    PendingRetry,
    Processed,
    Rejected,
    Annulled,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Transmitting => "TRANSMITTING",
            Self::PendingRetry => "PENDING_RETRY",
            Self::Processed => "PROCESSED",
            Self::Rejected => "REJECTED",
            Self::Annulled => "ANNULLED",
        }
    }

    /// Verb for the operation that moves a document into this status.
    pub fn operation(&self) -> &'static str {
        match self {
            Self::Created => "create",
            Self::Transmitting => "transmit",
            Self::PendingRetry => "retry",
            Self::Processed => "process",
            Self::Rejected => "reject",
            Self::Annulled => "annul",
        }
    }

    /// Forward-only transition table. `Transmitting -> Transmitting` is the
    /// reclaim of an attempt whose lease expired.
    pub fn can_transition_to(&self, next: DocumentStatus) -> bool {
        use DocumentStatus::*;
        matches!(
            (self, next),
            (Created, Transmitting)
                | (PendingRetry, Transmitting)
                | (Transmitting, Transmitting)
                | (Transmitting, Processed)
                | (Transmitting, Rejected)
                | (Transmitting, PendingRetry)
                | (Rejected, PendingRetry)
                | (Processed, Annulled)
        )
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATED" => Ok(Self::Created),
            "TRANSMITTING" => Ok(Self::Transmitting),
            "PENDING_RETRY" => Ok(Self::PendingRetry),
            "PROCESSED" => Ok(Self::Processed),
            "REJECTED" => Ok(Self::Rejected),
            "ANNULLED" => Ok(Self::Annulled),
            other => Err(format!("unknown document status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Environment {
    Test,
    Production,
}

impl Environment {
    /// `ambiente` code used on the wire.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Test => "00",
            Self::Production => "01",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Test => "TEST",
            Self::Production => "PRODUCTION",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "TEST" | "00" => Ok(Self::Test),
            "PRODUCTION" | "01" => Ok(Self::Production),
            other => Err(format!("unknown environment '{}'", other)),
        }
    }
}

/// Tax document types accepted by the reception service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DocumentType {
    Invoice,
    TaxCreditInvoice,
    ShippingNote,
    CreditNote,
    DebitNote,
    WithholdingReceipt,
    Settlement,
    SettlementAccountingDocument,
    ExportInvoice,
    ExcludedSubjectInvoice,
    DonationReceipt,
}

impl DocumentType {
    pub const ALL: [DocumentType; 11] = [
        Self::Invoice,
        Self::TaxCreditInvoice,
        Self::ShippingNote,
        Self::CreditNote,
        Self::DebitNote,
        Self::WithholdingReceipt,
        Self::Settlement,
        Self::SettlementAccountingDocument,
        Self::ExportInvoice,
        Self::ExcludedSubjectInvoice,
        Self::DonationReceipt,
    ];

    /// `tipoDte` code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Invoice => "01",
            Self::TaxCreditInvoice => "03",
            Self::ShippingNote => "04",
            Self::CreditNote => "05",
            Self::DebitNote => "06",
            Self::WithholdingReceipt => "07",
            Self::Settlement => "08",
            Self::SettlementAccountingDocument => "09",
            Self::ExportInvoice => "11",
            Self::ExcludedSubjectInvoice => "14",
            Self::DonationReceipt => "15",
        }
    }

    /// Schema version declared alongside the document on submission.
    pub fn version(&self) -> u32 {
        match self {
            Self::TaxCreditInvoice | Self::ShippingNote | Self::CreditNote | Self::DebitNote => 3,
            _ => 1,
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.code() == code)
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl TryFrom<String> for DocumentType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_code(&value).ok_or_else(|| format!("unknown document type '{}'", value))
    }
}

impl From<DocumentType> for String {
    fn from(value: DocumentType) -> Self {
        value.code().to_string()
    }
}

/// Kind of the last failed attempt, kept so that a caller reading the
/// document back can tell transport failures from business rejections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    SigningUnavailable,
    SigningFailed,
    TokenUnavailable,
    AuthorityRejected,
    AuthorityUnavailable,
    TransmissionInFlight,
    Internal,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SigningUnavailable => "SIGNING_UNAVAILABLE",
            Self::SigningFailed => "SIGNING_FAILED",
            Self::TokenUnavailable => "TOKEN_UNAVAILABLE",
            Self::AuthorityRejected => "AUTHORITY_REJECTED",
            Self::AuthorityUnavailable => "AUTHORITY_UNAVAILABLE",
            Self::TransmissionInFlight => "TRANSMISSION_IN_FLIGHT",
            Self::Internal => "INTERNAL",
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::AuthorityRejected | Self::Internal)
    }
}

impl FromStr for FailureKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SIGNING_UNAVAILABLE" => Ok(Self::SigningUnavailable),
            "SIGNING_FAILED" => Ok(Self::SigningFailed),
            "TOKEN_UNAVAILABLE" => Ok(Self::TokenUnavailable),
            "AUTHORITY_REJECTED" => Ok(Self::AuthorityRejected),
            "AUTHORITY_UNAVAILABLE" => Ok(Self::AuthorityUnavailable),
            "TRANSMISSION_IN_FLIGHT" => Ok(Self::TransmissionInFlight),
            "INTERNAL" => Ok(Self::Internal),
            other => Err(format!("unknown failure kind '{}'", other)),
        }
    }
}

impl From<&crate::error::EngineError> for FailureKind {
    fn from(e: &crate::error::EngineError) -> Self {
        use crate::error::EngineError;
        match e {
            EngineError::SigningUnavailable(_) => Self::SigningUnavailable,
            EngineError::SigningFailed(_) => Self::SigningFailed,
            EngineError::TokenUnavailable(_) => Self::TokenUnavailable,
            EngineError::AuthorityRejected { .. } => Self::AuthorityRejected,
            EngineError::AuthorityUnavailable(_) => Self::AuthorityUnavailable,
            EngineError::TransmissionInFlight(_) => Self::TransmissionInFlight,
            _ => Self::Internal,
        }
    }
}

/// The DTE record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub generation_code: String,
    pub control_number: String,
    pub document_type: DocumentType,
    pub environment: Environment,
    pub status: DocumentStatus,
    pub original_content: serde_json::Value,
    pub signed_envelope: Option<String>,
    pub receipt_stamp: Option<String>,
    pub observations: Option<String>,
    pub attempt_count: u32,
    pub processed_at: Option<DateTime<Utc>>,
    /// Set when an attempt failed after the request may have reached the
    /// authority; the next attempt queries before submitting again.
    pub needs_reconciliation: bool,
    pub last_failure: Option<FailureKind>,
    pub annulment_generation_code: Option<String>,
    pub annulment_receipt_stamp: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    pub fn is_signed(&self) -> bool {
        self.signed_envelope.is_some()
    }
}

/// Input for creating a document; identities are assigned by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewDocument {
    pub document_type: DocumentType,
    pub environment: Environment,
    pub content: serde_json::Value,
    #[serde(default)]
    pub control_number: Option<String>,
    /// Eight-character establishment/point-of-sale code used in generated
    /// control numbers. Falls back to the engine default.
    #[serde(default)]
    pub establishment: Option<String>,
}

/// Authority-format generation code: an upper-case UUID v4.
pub fn new_generation_code() -> String {
    Uuid::new_v4().to_string().to_uppercase()
}

/// `DTE-{tipo}-{establishment}-{sequence}` with the sequence padded to 15 digits.
pub fn format_control_number(document_type: DocumentType, establishment: &str, sequence: u64) -> String {
    let establishment: String = format!("{:0>8}", establishment.to_uppercase())
        .chars()
        .take(8)
        .collect();
    format!("DTE-{}-{}-{:015}", document_type.code(), establishment, sequence)
}
