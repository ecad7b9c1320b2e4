//! Durable document store: where full documents are loaded from on open and
//! saved to by the save pipeline.

use crate::document::{Document, DocumentId};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Document not found: {0}")]
    NotFound(String),

    #[error("Request failed: {0}")]
    Request(String),

    #[error("Store returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid document body: {0}")]
    Decode(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Request/response persistence of whole documents. Saves are last-write-wins.
#[async_trait]
pub trait DocumentStore<D: Document>: Send + Sync {
    async fn load(&self, id: &DocumentId) -> Result<D>;
    async fn save(&self, id: &DocumentId, document: &D) -> Result<()>;
}

/// In-memory store used by tests and offline tooling.
///
/// Saves can be made to fail on demand to exercise retry paths.
#[derive(Debug)]
pub struct InMemoryStore<D> {
    documents: Mutex<HashMap<DocumentId, D>>,
    saves: AtomicUsize,
    fail_saves: AtomicBool,
}

impl<D: Document> InMemoryStore<D> {
    pub fn new() -> Self {
        Self {
            documents: Mutex::new(HashMap::new()),
            saves: AtomicUsize::new(0),
            fail_saves: AtomicBool::new(false),
        }
    }

    pub fn with_document(id: impl Into<DocumentId>, document: D) -> Self {
        let store = Self::new();
        store.insert(id.into(), document);
        store
    }

    pub fn insert(&self, id: DocumentId, document: D) {
        self.documents
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, document);
    }

    pub fn get(&self, id: &DocumentId) -> Option<D> {
        self.documents
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    /// Number of save calls that reached the store, failed ones included.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }
}

impl<D: Document> Default for InMemoryStore<D> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<D: Document> DocumentStore<D> for InMemoryStore<D> {
    async fn load(&self, id: &DocumentId) -> Result<D> {
        self.get(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn save(&self, id: &DocumentId, document: &D) -> Result<()> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StoreError::Status {
                status: 503,
                body: "store unavailable".into(),
            });
        }
        self.insert(id.clone(), document.clone());
        Ok(())
    }
}
