use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use super::document::Environment;

/// Attempt cap and exponential backoff applied by the retry queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total number of attempts, the first one included.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry; doubled for every further retry.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_base_delay_ms() -> u64 {
    1_000
}

const fn default_max_delay_ms() -> u64 {
    60_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the given failed attempt (1-based): base, 2*base, 4*base, ... capped.
    pub fn delay_after_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let delay = self.base_delay_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }

    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "WAITING",
            Self::Active => "ACTIVE",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "WAITING" => Ok(Self::Waiting),
            "ACTIVE" => Ok(Self::Active),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            other => Err(format!("unknown job state '{}'", other)),
        }
    }
}

/// Queue entry for an asynchronous transmission. Carries what is needed to
/// re-attempt except the secret, which the worker resolves by identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransmissionJob {
    pub id: Uuid,
    pub document_id: Uuid,
    pub tenant_id: String,
    pub identity: String,
    pub environment: Environment,
    pub attempts: u32,
    pub policy: RetryPolicy,
    pub state: JobState,
    pub run_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub locked_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TransmissionJob {
    pub fn new(
        document_id: Uuid,
        tenant_id: impl Into<String>,
        identity: impl Into<String>,
        environment: Environment,
        policy: RetryPolicy,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            document_id,
            tenant_id: tenant_id.into(),
            identity: identity.into(),
            environment,
            attempts: 0,
            policy,
            state: JobState::Waiting,
            run_at: now,
            last_error: None,
            locked_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, JobState::Waiting | JobState::Active)
    }

    pub fn status_view(&self) -> JobStatusView {
        JobStatusView {
            job_id: self.id,
            document_id: self.document_id,
            state: self.state,
            attempts: self.attempts,
            max_attempts: self.policy.max_attempts,
            failure_reason: match self.state {
                JobState::Failed => self.last_error.clone(),
                _ => None,
            },
            last_error: self.last_error.clone(),
            next_run_at: match self.state {
                JobState::Waiting => Some(self.run_at),
                _ => None,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusView {
    pub job_id: Uuid,
    pub document_id: Uuid,
    pub state: JobState,
    pub attempts: u32,
    pub max_attempts: u32,
    pub failure_reason: Option<String>,
    pub last_error: Option<String>,
    pub next_run_at: Option<DateTime<Utc>>,
}
