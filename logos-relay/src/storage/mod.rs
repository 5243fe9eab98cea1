//! Two-tier storage for document state.
//!
//! Architecture:
//! ```text
//! ┌──────────────────────┐   set_with_expiry / get   ┌──────────────┐
//! │ PersistenceCoordinator│ ────────────────────────► │ CacheTier    │
//! │                      │                           │ (best effort)│
//! └──────────┬───────────┘                           └──────────────┘
//!            │ store_update / get_document_state
//!            ▼
//! ┌──────────────────────────────────────────────┐
//! │ DurableStore (authoritative)                 │
//! │   RocksStore: RocksDB column families        │
//! │   MemoryStore: in-process, no durability     │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Both tiers see document state as opaque bytes. The cache is never
//! authoritative: a miss, an error or a corrupt entry falls back to the
//! durable store.

pub mod cache;
pub mod memory;
pub mod rocks;

use std::time::Duration;

use async_trait::async_trait;

use crate::document::DocumentId;
use crate::replica::EngineError;

pub use cache::{CacheError, MemoryCache};
pub use memory::MemoryStore;
pub use rocks::{DocumentMetadata, RocksStore, StoreConfig};

/// Durable store errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// RocksDB internal error
    #[error("Database error: {0}")]
    Database(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Compression error: {0}")]
    Compression(String),
    /// Stored updates could not be folded into one state
    #[error("Corrupt state for document {doc}: {source}")]
    Corrupt { doc: DocumentId, source: EngineError },
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Authoritative persistent backend.
///
/// Once `store_update` returns `Ok`, the update is durable.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Record an encoded update for `doc`.
    async fn store_update(&self, doc: &DocumentId, update: &[u8]) -> Result<(), StoreError>;

    /// All stored updates for `doc` merged into one blob; empty when unknown.
    async fn get_document_state(&self, doc: &DocumentId) -> Result<Vec<u8>, StoreError>;
}

/// Fast, best-effort tier with per-entry expiry.
#[async_trait]
pub trait CacheTier: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    async fn set_with_expiry(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError>;
}

/// Folds a document's update log into one blob.
pub type MergeFn = fn(&[Vec<u8>]) -> Result<Vec<u8>, EngineError>;
