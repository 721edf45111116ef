pub mod annulment;
pub mod ports;
pub mod transmission;
pub mod worker;

pub use transmission::{
    AsyncSubmission, EngineSettings, Transmission, TransmissionEngine, TransmissionResult,
};
pub use worker::{TransmissionWorker, WorkerSettings};
