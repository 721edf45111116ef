use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventAction {
    Sign,
    Transmit,
    Response,
    Anular,
    Error,
    /// Operator re-opened a rejected document.
    Reopen,
}

impl EventAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sign => "SIGN",
            Self::Transmit => "TRANSMIT",
            Self::Response => "RESPONSE",
            Self::Anular => "ANULAR",
            Self::Error => "ERROR",
            Self::Reopen => "REOPEN",
        }
    }
}

impl fmt::Display for EventAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SIGN" => Ok(Self::Sign),
            "TRANSMIT" => Ok(Self::Transmit),
            "RESPONSE" => Ok(Self::Response),
            "ANULAR" => Ok(Self::Anular),
            "ERROR" => Ok(Self::Error),
            "REOPEN" => Ok(Self::Reopen),
            other => Err(format!("unknown event action '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventOutcome {
    Success,
    Failure,
}

impl EventOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
        }
    }
}

impl FromStr for EventOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SUCCESS" => Ok(Self::Success),
            "FAILURE" => Ok(Self::Failure),
            other => Err(format!("unknown event outcome '{}'", other)),
        }
    }
}

/// A persisted audit entry. `id` is assigned by the store and orders the log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub document_id: Uuid,
    pub action: EventAction,
    pub outcome: EventOutcome,
    pub message: String,
    pub data: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// An event not yet written.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub document_id: Uuid,
    pub action: EventAction,
    pub outcome: EventOutcome,
    pub message: String,
    pub data: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl NewEvent {
    pub fn success(document_id: Uuid, action: EventAction, message: impl Into<String>) -> Self {
        Self {
            document_id,
            action,
            outcome: EventOutcome::Success,
            message: message.into(),
            data: None,
            created_at: Utc::now(),
        }
    }

    pub fn failure(document_id: Uuid, action: EventAction, message: impl Into<String>) -> Self {
        Self {
            outcome: EventOutcome::Failure,
            ..Self::success(document_id, action, message)
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}
