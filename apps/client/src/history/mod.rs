//! Bounded, observable list of past generations.
//!
//! `HistoryStore` is implemented by two backings:
//! - `LocalHistoryStore`: a JSON document on local disk, capped at [`HISTORY_LIMIT`].
//! - `RemoteHistoryStore`: the service's per-account history endpoints.
//!
//! The orchestrator and the CLI hold an `Arc<dyn HistoryStore>` and never
//! depend on a concrete backing.

pub mod local;
pub mod remote;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::errors::ClientError;
use crate::models::{HistoryEntry, NewHistoryEntry};

pub use local::LocalHistoryStore;
pub use remote::RemoteHistoryStore;

/// Maximum number of entries a locally-backed store keeps.
pub const HISTORY_LIMIT: usize = 30;

/// Immutable snapshot of the collection, newest first.
pub type HistorySnapshot = Arc<[HistoryEntry]>;

#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Current entries, newest first.
    fn snapshot(&self) -> HistorySnapshot;

    /// Receiver that observes every snapshot published after any mutation,
    /// whichever handle performed it.
    fn subscribe(&self) -> watch::Receiver<HistorySnapshot>;

    /// Reloads the collection from its backing and republishes it.
    async fn refresh(&self) -> Result<(), ClientError>;

    async fn add(&self, entry: NewHistoryEntry) -> Result<HistoryEntry, ClientError>;

    /// Removes the entry with `id`. Absent ids are a no-op.
    async fn remove(&self, id: &str) -> Result<(), ClientError>;

    async fn clear(&self) -> Result<(), ClientError>;

    /// Looks up one entry in the current snapshot.
    fn get(&self, id: &str) -> Option<HistoryEntry> {
        self.snapshot().iter().find(|e| e.id == id).cloned()
    }
}

/// Single source of truth for one backing: the current snapshot plus every
/// registered observer. Mutations replace the snapshot wholesale, so
/// observers never share mutable state.
#[derive(Debug, Clone)]
pub struct HistorySubject {
    sender: Arc<watch::Sender<HistorySnapshot>>,
}

impl Default for HistorySubject {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl HistorySubject {
    pub fn new(entries: Vec<HistoryEntry>) -> Self {
        let (sender, _) = watch::channel(HistorySnapshot::from(entries));
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn current(&self) -> HistorySnapshot {
        self.sender.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<HistorySnapshot> {
        self.sender.subscribe()
    }

    /// Publishes a new snapshot to every observer.
    pub fn publish(&self, entries: Vec<HistoryEntry>) {
        self.sender.send_replace(HistorySnapshot::from(entries));
    }

    pub fn observer_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
