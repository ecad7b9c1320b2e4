//! Local safety net: a bounded, most-recent-first ring of document snapshots.
//!
//! Snapshots go to local key/value storage under `{key}_backup` as a JSON array
//! of `{timestamp, data}` records. This works with no network at all and is the
//! last resort when both the relay and the document store are unreachable.
//! Restoring is always an explicit user action.

use crate::document::{Document, DocumentId, DocumentKind};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

/// Snapshots kept per document unless configured otherwise.
pub const DEFAULT_CAPACITY: usize = 5;

/// Characters of document text shown in a backup listing.
const PREVIEW_CHARS: usize = 50;

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage quota exceeded: need {needed} bytes, {available} available")]
    QuotaExceeded { needed: usize, available: usize },

    #[error("Storage error: {0}")]
    Storage(String),
}

pub type Result<T> = std::result::Result<T, BackupError>;

/// Local string key/value storage.
///
/// Implementations must be cheap to call from the session task; they hold
/// a handful of small JSON blobs.
pub trait BackupStorage: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

/// In-memory storage for tests and for sessions that don't want anything on disk.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    entries: Mutex<HashMap<String, String>>,
    quota: Option<usize>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Limit the total stored bytes (keys plus values).
    pub fn with_quota(quota: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            quota: Some(quota),
        }
    }

    pub fn keys(&self) -> Vec<String> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let mut keys: Vec<_> = entries.keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl BackupStorage for InMemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(quota) = self.quota {
            let used: usize = entries
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(k, v)| k.len() + v.len())
                .sum();
            let needed = key.len() + value.len();
            let available = quota.saturating_sub(used);
            if needed > available {
                return Err(BackupError::QuotaExceeded { needed, available });
            }
        }
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(key);
        Ok(())
    }
}

impl<S: BackupStorage + ?Sized> BackupStorage for std::sync::Arc<S> {
    fn get(&self, key: &str) -> Result<Option<String>> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        (**self).set(key, value)
    }

    fn remove(&self, key: &str) -> Result<()> {
        (**self).remove(key)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRecord<D> {
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub data: D,
}

/// One line of a backup listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupSummary {
    pub timestamp: u64,
    pub preview: String,
}

/// Storage key prefix for a document, e.g. `note_12` or `canvas_b1`.
pub fn document_key(kind: DocumentKind, id: &DocumentId) -> String {
    match kind {
        DocumentKind::Note => format!("note_{}", id),
        DocumentKind::Board => format!("canvas_{}", id),
    }
}

pub struct LocalSafetyNet<S, D> {
    storage: S,
    storage_key: String,
    capacity: usize,
    _document: PhantomData<fn() -> D>,
}

impl<S: BackupStorage, D: Document> LocalSafetyNet<S, D> {
    /// Keep up to `capacity` snapshots under `{key}_backup`.
    pub fn new(storage: S, key: &str, capacity: usize) -> Self {
        Self {
            storage,
            storage_key: format!("{}_backup", key),
            capacity: capacity.max(1),
            _document: PhantomData,
        }
    }

    pub fn for_document(storage: S, id: &DocumentId, capacity: usize) -> Self {
        Self::new(storage, &document_key(D::KIND, id), capacity)
    }

    pub fn storage_key(&self) -> &str {
        &self.storage_key
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Store a snapshot at the front of the ring, evicting the oldest beyond
    /// capacity.
    pub fn snapshot(&self, document: &D, timestamp: u64) -> Result<()> {
        let mut records = match self.records() {
            Ok(records) => records,
            Err(BackupError::Serialization(e)) => {
                // An unreadable list would otherwise block every future snapshot.
                warn!("Discarding unreadable backups in {}: {}", self.storage_key, e);
                Vec::new()
            }
            Err(e) => return Err(e),
        };

        records.insert(
            0,
            BackupRecord {
                timestamp,
                data: document.clone(),
            },
        );
        records.truncate(self.capacity);

        let json = serde_json::to_string(&records)?;
        self.storage.set(&self.storage_key, &json)?;
        debug!(
            "Stored backup {} ({} kept)",
            self.storage_key,
            records.len()
        );
        Ok(())
    }

    /// All snapshots, most recent first.
    pub fn records(&self) -> Result<Vec<BackupRecord<D>>> {
        match self.storage.get(&self.storage_key)? {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(Vec::new()),
        }
    }

    pub fn list_backups(&self) -> Result<Vec<BackupSummary>> {
        Ok(self
            .records()?
            .iter()
            .map(|record| BackupSummary {
                timestamp: record.timestamp,
                preview: truncate_preview(&record.data.preview()),
            })
            .collect())
    }

    /// Snapshot at `index` (0 is the newest), or `None` if out of range.
    pub fn restore(&self, index: usize) -> Result<Option<D>> {
        let mut records = self.records()?;
        if index >= records.len() {
            return Ok(None);
        }
        Ok(Some(records.swap_remove(index).data))
    }

    pub fn clear(&self) -> Result<()> {
        self.storage.remove(&self.storage_key)
    }
}

fn truncate_preview(preview: &str) -> String {
    if preview.chars().count() <= PREVIEW_CHARS + 3 {
        return preview.to_string();
    }
    let mut short: String = preview.chars().take(PREVIEW_CHARS).collect();
    short.push_str("...");
    short
}
