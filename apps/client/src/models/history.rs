use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::request::{
    label_for_url, source_label_for, GenerationRequest, Language, FREE_TEXT_SOURCE_LABEL,
};

/// Optional context recorded alongside a generated letter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryMetadata {
    pub resume_filename: Option<String>,
    pub job_url: Option<String>,
    pub language: Option<Language>,
}

/// One past generation. Immutable once created; stores only add or remove whole entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: String,
    pub content: String,
    pub source_label: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HistoryMetadata,
}

impl HistoryEntry {
    /// First `max_chars` characters of the letter, for list views.
    pub fn preview(&self, max_chars: usize) -> String {
        let mut chars = self.content.chars();
        let head: String = chars.by_ref().take(max_chars).collect();
        if chars.next().is_some() {
            format!("{head}...")
        } else {
            head
        }
    }
}

/// Input to `HistoryStore::add`. Locally-backed stores assign id and timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewHistoryEntry {
    pub content: String,
    pub source_label: String,
    pub metadata: HistoryMetadata,
}

impl NewHistoryEntry {
    /// Entry for a letter generated from `request`.
    pub fn for_request(request: &GenerationRequest, content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            source_label: source_label_for(request.job_source()),
            metadata: HistoryMetadata {
                resume_filename: Some(request.resume().filename.clone()),
                job_url: request.job_source().url().map(str::to_string),
                language: Some(request.language()),
            },
        }
    }
}

/// History record as served by `GET /api/history`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteHistoryRecord {
    pub id: String,
    pub resume_filename: String,
    pub job_url: Option<String>,
    pub cover_letter: String,
    pub language: String,
    pub created_at: String,
}

impl RemoteHistoryRecord {
    /// Converts the wire record. The server emits naive ISO-8601 timestamps
    /// in UTC, so both offset and naive forms are accepted.
    pub fn into_entry(self) -> HistoryEntry {
        let created_at = parse_timestamp(&self.created_at).unwrap_or_else(|| {
            tracing::warn!(
                "History record {} has unparseable created_at '{}'",
                self.id,
                self.created_at
            );
            DateTime::<Utc>::UNIX_EPOCH
        });
        let source_label = match self.job_url.as_deref() {
            Some(url) if !url.trim().is_empty() => label_for_url(url),
            _ => FREE_TEXT_SOURCE_LABEL.to_string(),
        };

        HistoryEntry {
            id: self.id,
            content: self.cover_letter,
            source_label,
            created_at,
            metadata: HistoryMetadata {
                resume_filename: Some(self.resume_filename).filter(|f| !f.is_empty()),
                job_url: self.job_url,
                language: self.language.parse().ok(),
            },
        }
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}
