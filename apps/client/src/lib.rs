//! Client for the cover letter generation service.
//!
//! Submits a resume and a job description, renders the letter as it streams
//! in, and keeps a bounded history of past letters locally or on the service.

pub mod config;
pub mod errors;
pub mod history;
pub mod models;
pub mod orchestrator;
pub mod stream;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use errors::ClientError;
pub use history::{HistoryStore, LocalHistoryStore, RemoteHistoryStore, HISTORY_LIMIT};
pub use orchestrator::{GenerationOrchestrator, GenerationState, Outcome, Phase};
pub use transport::{GenerationBackend, GenerationClient, StreamObserver};
