//! Remotely-backed history: the service's per-account generation records.
//!
//! The server is the source of truth. Ids, timestamps and any bound are
//! assigned server-side; this store only mirrors what `GET /api/history`
//! returns and republishes after known mutations.

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::debug;

use super::{HistorySnapshot, HistoryStore, HistorySubject};
use crate::errors::ClientError;
use crate::models::{HistoryEntry, NewHistoryEntry};
use crate::transport::GenerationClient;

/// Cloneable handle; clones share one mirrored collection.
#[derive(Clone)]
pub struct RemoteHistoryStore {
    client: GenerationClient,
    subject: HistorySubject,
}

impl RemoteHistoryStore {
    /// Creates an empty mirror. Call `refresh` to populate it.
    pub fn new(client: GenerationClient) -> Self {
        Self {
            client,
            subject: HistorySubject::default(),
        }
    }
}

#[async_trait]
impl HistoryStore for RemoteHistoryStore {
    fn snapshot(&self) -> HistorySnapshot {
        self.subject.current()
    }

    fn subscribe(&self) -> watch::Receiver<HistorySnapshot> {
        self.subject.subscribe()
    }

    async fn refresh(&self) -> Result<(), ClientError> {
        let records = self.client.list_history().await?;
        debug!("Fetched {} history records", records.len());
        self.subject
            .publish(records.into_iter().map(|r| r.into_entry()).collect());
        Ok(())
    }

    /// The service records a generation itself; adding means refreshing and
    /// returning the newest server record.
    async fn add(&self, entry: NewHistoryEntry) -> Result<HistoryEntry, ClientError> {
        self.refresh().await?;
        self.snapshot().first().cloned().ok_or_else(|| {
            ClientError::NotFound(format!(
                "server has no record of the generation for {}",
                entry.source_label
            ))
        })
    }

    async fn remove(&self, id: &str) -> Result<(), ClientError> {
        self.client.delete_history(id).await?;

        let current = self.subject.current();
        if current.iter().any(|e| e.id == id) {
            self.subject
                .publish(current.iter().filter(|e| e.id != id).cloned().collect());
        }
        Ok(())
    }

    async fn clear(&self) -> Result<(), ClientError> {
        Err(ClientError::Unsupported("clear"))
    }
}
