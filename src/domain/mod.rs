// Domain data shapes shared across layers

pub mod document;
pub mod event;
pub mod job;

pub use document::{
    format_control_number, new_generation_code, Document, DocumentStatus, DocumentType,
    Environment, FailureKind, NewDocument,
};
pub use event::{Event, EventAction, EventOutcome, NewEvent};
pub use job::{JobState, JobStatusView, RetryPolicy, TransmissionJob};
