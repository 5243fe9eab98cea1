//! In-process durable store with no durability.
//!
//! Used when no store path is configured and by tests. Keeps every update
//! record per document and folds them on read.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{DurableStore, MergeFn, StoreError};
use crate::document::DocumentId;
use crate::replica::{merge_updates, YrsReplica};

pub struct MemoryStore {
    documents: Mutex<HashMap<DocumentId, Vec<Vec<u8>>>>,
    merge: MergeFn,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_merge(merge_updates::<YrsReplica>)
    }

    pub fn with_merge(merge: MergeFn) -> Self {
        Self {
            documents: Mutex::new(HashMap::new()),
            merge,
        }
    }

    /// Number of `store_update` calls recorded for `doc`.
    pub async fn write_count(&self, doc: &DocumentId) -> usize {
        self.documents.lock().await.get(doc).map_or(0, Vec::len)
    }

    /// Number of documents with at least one stored update.
    pub async fn document_count(&self) -> usize {
        self.documents.lock().await.len()
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn store_update(&self, doc: &DocumentId, update: &[u8]) -> Result<(), StoreError> {
        self.documents
            .lock()
            .await
            .entry(doc.clone())
            .or_default()
            .push(update.to_vec());
        Ok(())
    }

    async fn get_document_state(&self, doc: &DocumentId) -> Result<Vec<u8>, StoreError> {
        let documents = self.documents.lock().await;
        match documents.get(doc) {
            None => Ok(Vec::new()),
            Some(updates) if updates.len() == 1 => Ok(updates[0].clone()),
            Some(updates) => (self.merge)(updates).map_err(|source| StoreError::Corrupt {
                doc: doc.clone(),
                source,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::test_support::{append_text, text_of};
    use crate::replica::ReplicaEngine;
    use yrs::Doc;

    #[tokio::test]
    async fn test_empty_for_unknown() {
        let store = MemoryStore::new();
        let id = DocumentId::new("nothing").unwrap();
        assert!(store.get_document_state(&id).await.unwrap().is_empty());
        assert_eq!(store.write_count(&id).await, 0);
    }

    #[tokio::test]
    async fn test_merges_on_read() {
        let store = MemoryStore::new();
        let id = DocumentId::new("doc").unwrap();
        let source = Doc::new();
        store.store_update(&id, &append_text(&source, "one ")).await.unwrap();
        store.store_update(&id, &append_text(&source, "two")).await.unwrap();
        assert_eq!(store.write_count(&id).await, 2);

        let mut replica = YrsReplica::new();
        replica
            .apply_update(&store.get_document_state(&id).await.unwrap(), None)
            .unwrap();
        assert_eq!(text_of(&replica), "one two");
        assert_eq!(store.document_count().await, 1);
    }
}
