pub mod history;
pub mod request;

pub use history::{HistoryEntry, HistoryMetadata, NewHistoryEntry, RemoteHistoryRecord};
pub use request::{
    source_label_for, GenerationRequest, GenerationResult, JobSource, Language, ResumeFile,
};
