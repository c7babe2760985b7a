//! Locally-backed history: one JSON document on disk, capped at `HISTORY_LIMIT`.
//!
//! Every mutation is read-modify-write on the whole collection. The new
//! snapshot is published first and then written through a temp file plus
//! atomic rename; a failed write is logged and dropped.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{HistorySnapshot, HistoryStore, HistorySubject, HISTORY_LIMIT};
use crate::errors::ClientError;
use crate::models::{HistoryEntry, NewHistoryEntry};

struct Inner {
    path: Option<PathBuf>,
    limit: usize,
    subject: HistorySubject,
    // Serializes read-modify-write cycles and the file writes that follow them.
    write_lock: Mutex<()>,
}

/// Cloneable handle; clones share one collection and one set of observers.
#[derive(Clone)]
pub struct LocalHistoryStore {
    inner: Arc<Inner>,
}

impl LocalHistoryStore {
    /// Opens the store persisted at `path`. A missing file is an empty
    /// history; an unreadable or corrupt one is logged and treated as empty.
    pub async fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = load_entries(&path).await;
        info!(
            "Local history opened at {} ({} entries)",
            path.display(),
            entries.len()
        );
        Self::build(Some(path), entries, HISTORY_LIMIT)
    }

    /// A store that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self::build(None, Vec::new(), HISTORY_LIMIT)
    }

    fn build(path: Option<PathBuf>, mut entries: Vec<HistoryEntry>, limit: usize) -> Self {
        entries.truncate(limit);
        Self {
            inner: Arc::new(Inner {
                path,
                limit,
                subject: HistorySubject::new(entries),
                write_lock: Mutex::new(()),
            }),
        }
    }

    /// Applies `change` to a copy of the collection, enforces the bound,
    /// publishes and persists. `change` returns whether anything changed.
    async fn mutate<F>(&self, change: F)
    where
        F: FnOnce(&mut Vec<HistoryEntry>) -> bool,
    {
        let _guard = self.inner.write_lock.lock().await;

        let mut entries = self.inner.subject.current().to_vec();
        if !change(&mut entries) {
            return;
        }
        if entries.len() > self.inner.limit {
            debug!(
                "Evicting {} oldest history entries",
                entries.len() - self.inner.limit
            );
            entries.truncate(self.inner.limit);
        }

        self.inner.subject.publish(entries.clone());
        self.persist(entries).await;
    }

    async fn persist(&self, entries: Vec<HistoryEntry>) {
        let Some(path) = self.inner.path.clone() else {
            return;
        };

        let bytes = match serde_json::to_vec_pretty(&entries) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Could not serialize history, dropping write: {e}");
                return;
            }
        };

        let target = path.clone();
        match tokio::task::spawn_blocking(move || write_atomically(&target, &bytes)).await {
            Ok(Ok(())) => debug!("History written to {}", path.display()),
            Ok(Err(e)) => warn!("History write to {} failed, dropping it: {e}", path.display()),
            Err(e) => warn!("History write task failed, dropping it: {e}"),
        }
    }
}

#[async_trait]
impl HistoryStore for LocalHistoryStore {
    fn snapshot(&self) -> HistorySnapshot {
        self.inner.subject.current()
    }

    fn subscribe(&self) -> watch::Receiver<HistorySnapshot> {
        self.inner.subject.subscribe()
    }

    async fn refresh(&self) -> Result<(), ClientError> {
        let Some(path) = self.inner.path.as_deref() else {
            return Ok(());
        };
        let _guard = self.inner.write_lock.lock().await;
        let mut entries = load_entries(path).await;
        entries.truncate(self.inner.limit);
        self.inner.subject.publish(entries);
        Ok(())
    }

    async fn add(&self, entry: NewHistoryEntry) -> Result<HistoryEntry, ClientError> {
        let created = HistoryEntry {
            id: Uuid::new_v4().to_string(),
            content: entry.content,
            source_label: entry.source_label,
            created_at: Utc::now(),
            metadata: entry.metadata,
        };

        let inserted = created.clone();
        self.mutate(move |entries| {
            entries.insert(0, inserted);
            true
        })
        .await;

        debug!("Added history entry {} ({})", created.id, created.source_label);
        Ok(created)
    }

    async fn remove(&self, id: &str) -> Result<(), ClientError> {
        self.mutate(|entries| {
            let before = entries.len();
            entries.retain(|e| e.id != id);
            entries.len() != before
        })
        .await;
        Ok(())
    }

    async fn clear(&self) -> Result<(), ClientError> {
        self.mutate(|entries| {
            let changed = !entries.is_empty();
            entries.clear();
            changed
        })
        .await;
        Ok(())
    }
}

async fn load_entries(path: &Path) -> Vec<HistoryEntry> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
        Err(e) => {
            warn!("Could not read history at {}: {e}", path.display());
            return Vec::new();
        }
    };

    match serde_json::from_slice::<Vec<HistoryEntry>>(&bytes) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(
                "History at {} is corrupt, starting empty: {e}",
                path.display()
            );
            Vec::new()
        }
    }
}

fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), ClientError> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| ClientError::Storage(e.error.to_string()))?;
    Ok(())
}
