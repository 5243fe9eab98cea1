//! Document registry: one shared replica handle per document.
//!
//! Handles are reference counted by session. When the last session
//! releases a document, eviction is scheduled after a cooldown; a session
//! arriving in the meantime cancels it, so quick reconnects never reload
//! from storage.
//!
//! The map is sharded and only guards bookkeeping. Replica mutation,
//! awareness and write-back each lock per document.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, OnceCell};
use tokio::task::JoinHandle;

use crate::awareness::AwarenessTracker;
use crate::broadcast::BroadcastGroup;
use crate::document::DocumentId;
use crate::persistence::{LoadSource, PersistenceCoordinator, PersistenceError, WriteBack};
use crate::protocol::Frame;
use crate::replica::{ReplicaEngine, YrsReplica};

/// Everything the relay keeps in memory for one document.
pub struct ReplicaHandle<E = YrsReplica> {
    id: DocumentId,
    replica: Mutex<E>,
    awareness: Mutex<AwarenessTracker>,
    broadcast: BroadcastGroup,
    write_back: WriteBack,
    loaded: OnceCell<LoadSource>,
}

impl<E: ReplicaEngine> ReplicaHandle<E> {
    /// Fresh handle with an empty replica.
    ///
    /// Every update applied to the replica is relayed as a sync update frame
    /// to the document's sessions, tagged with its origin.
    pub fn new(id: DocumentId, broadcast_capacity: usize) -> Self {
        let broadcast = BroadcastGroup::new(broadcast_capacity);
        let publisher = broadcast.publisher();

        let mut replica = E::new();
        replica.on_update(Box::new(move |update, origin| {
            publisher.send(origin, Frame::update(update.to_vec()).encode());
        }));

        Self {
            id,
            replica: Mutex::new(replica),
            awareness: Mutex::new(AwarenessTracker::new()),
            broadcast,
            write_back: WriteBack::new(),
            loaded: OnceCell::new(),
        }
    }

    pub fn id(&self) -> &DocumentId {
        &self.id
    }

    pub fn replica(&self) -> &Mutex<E> {
        &self.replica
    }

    pub fn awareness(&self) -> &Mutex<AwarenessTracker> {
        &self.awareness
    }

    pub fn broadcast(&self) -> &BroadcastGroup {
        &self.broadcast
    }

    pub fn write_back(&self) -> &WriteBack {
        &self.write_back
    }

    /// Load initial state once. Concurrent callers wait for the first;
    /// a failed load is retried by the next caller.
    pub async fn ensure_loaded(
        &self,
        coordinator: &PersistenceCoordinator,
    ) -> Result<LoadSource, PersistenceError> {
        self.loaded
            .get_or_try_init(|| coordinator.load(self))
            .await
            .copied()
    }

    pub fn load_source(&self) -> Option<LoadSource> {
        self.loaded.get().copied()
    }
}

struct Entry<E> {
    handle: Arc<ReplicaHandle<E>>,
    sessions: usize,
    eviction: Option<JoinHandle<()>>,
    /// Bumped on every acquire/release so a stale eviction task can tell
    /// that the document was referenced again after it was scheduled.
    generation: u64,
}

impl<E> Entry<E> {
    fn is_unreferenced_since(&self, generation: u64) -> bool {
        self.sessions == 0 && self.generation == generation
    }
}

/// Sharded map; each entry is locked only through its own shard.
type DocumentMap<E> = Arc<DashMap<DocumentId, Entry<E>>>;

/// Registry of resident documents. Cheap to clone; clones share state.
///
/// Shard guards are never held across an await point.
pub struct DocumentRegistry<E = YrsReplica> {
    documents: DocumentMap<E>,
    cooldown: Duration,
    broadcast_capacity: usize,
}

impl<E> Clone for DocumentRegistry<E> {
    fn clone(&self) -> Self {
        Self {
            documents: self.documents.clone(),
            cooldown: self.cooldown,
            broadcast_capacity: self.broadcast_capacity,
        }
    }
}

impl<E: ReplicaEngine> DocumentRegistry<E> {
    pub fn new(cooldown: Duration, broadcast_capacity: usize) -> Self {
        Self {
            documents: Arc::new(DashMap::new()),
            cooldown,
            broadcast_capacity,
        }
    }

    /// Handle for `id`, created on first reference. Counts one session.
    pub fn acquire(&self, id: &DocumentId) -> Arc<ReplicaHandle<E>> {
        let mut entry = self.documents.entry(id.clone()).or_insert_with(|| {
            log::info!("Creating replica for document {id}");
            Entry {
                handle: Arc::new(ReplicaHandle::new(id.clone(), self.broadcast_capacity)),
                sessions: 0,
                eviction: None,
                generation: 0,
            }
        });

        entry.sessions += 1;
        entry.generation += 1;
        if let Some(task) = entry.eviction.take() {
            task.abort();
            log::debug!("Cancelled eviction of document {id}");
        }
        entry.handle.clone()
    }

    /// Drop one session's reference. At zero, eviction is scheduled.
    pub fn release(&self, id: &DocumentId) {
        let Some(mut entry) = self.documents.get_mut(id) else {
            log::warn!("Release of unknown document {id}");
            return;
        };

        entry.sessions = entry.sessions.saturating_sub(1);
        entry.generation += 1;
        if entry.sessions > 0 {
            return;
        }

        log::debug!(
            "Document {id} has no sessions, evicting in {:?}",
            self.cooldown
        );
        entry.eviction = Some(tokio::spawn(evict_after(
            self.documents.clone(),
            id.clone(),
            entry.generation,
            self.cooldown,
        )));
    }

    pub fn get(&self, id: &DocumentId) -> Option<Arc<ReplicaHandle<E>>> {
        self.documents.get(id).map(|e| e.handle.clone())
    }

    pub fn contains(&self, id: &DocumentId) -> bool {
        self.documents.contains_key(id)
    }

    pub fn session_count(&self, id: &DocumentId) -> usize {
        self.documents.get(id).map_or(0, |e| e.sessions)
    }

    /// Resident documents.
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Snapshot of every resident handle.
    pub fn handles(&self) -> Vec<Arc<ReplicaHandle<E>>> {
        self.documents.iter().map(|e| e.handle.clone()).collect()
    }
}

/// Remove `id` once it has stayed unreferenced for `cooldown`.
///
/// A pending write-back postpones eviction by another cooldown. The
/// write-back is inspected without any shard held; removal re-checks the
/// generation under the shard lock.
async fn evict_after<E: ReplicaEngine>(
    documents: DocumentMap<E>,
    id: DocumentId,
    generation: u64,
    cooldown: Duration,
) {
    loop {
        tokio::time::sleep(cooldown).await;

        let handle = match documents.get(&id) {
            Some(entry) if entry.is_unreferenced_since(generation) => entry.handle.clone(),
            _ => return,
        };
        if !handle.write_back().is_idle().await {
            log::debug!("Postponing eviction of document {id}: write-back pending");
            continue;
        }

        if documents
            .remove_if(&id, |_, entry| entry.is_unreferenced_since(generation))
            .is_some()
        {
            log::info!("Evicted document {id}");
        }
        return;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::WriteBackPolicy;
    use crate::replica::test_support::append_text;
    use tokio::time::Instant;
    use yrs::Doc;

    const COOLDOWN: Duration = Duration::from_secs(30);

    fn registry() -> DocumentRegistry<YrsReplica> {
        DocumentRegistry::new(COOLDOWN, 16)
    }

    fn doc(name: &str) -> DocumentId {
        DocumentId::new(name).unwrap()
    }

    #[tokio::test]
    async fn test_acquire_shares_handle() {
        let reg = registry();
        let a = reg.acquire(&doc("doc1"));
        let b = reg.acquire(&doc("doc1"));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(reg.session_count(&doc("doc1")), 2);
        assert_eq!(reg.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_acquire() {
        let reg = registry();
        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let reg = reg.clone();
                tokio::spawn(async move { reg.acquire(&doc("shared")) })
            })
            .collect();

        let mut handles = Vec::new();
        for task in tasks {
            handles.push(task.await.unwrap());
        }
        assert!(handles.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(reg.session_count(&doc("shared")), 16);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evicted_after_cooldown() {
        let reg = registry();
        let id = doc("doc1");
        reg.acquire(&id);
        reg.release(&id);

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(reg.contains(&id));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!reg.contains(&id));
        assert!(reg.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reacquire_cancels_eviction() {
        let reg = registry();
        let id = doc("doc1");
        let first = reg.acquire(&id);
        reg.release(&id);

        tokio::time::sleep(Duration::from_secs(10)).await;
        let second = reg.acquire(&id);
        assert!(Arc::ptr_eq(&first, &second), "no reload on quick reconnect");

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(reg.contains(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resident_while_any_session_remains() {
        let reg = registry();
        let id = doc("doc1");
        reg.acquire(&id); // A
        reg.acquire(&id); // B

        reg.release(&id); // B leaves
        tokio::time::sleep(Duration::from_secs(45)).await;
        assert!(reg.contains(&id));

        reg.release(&id); // A leaves
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(!reg.contains(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_acquire_release_restarts_cooldown() {
        let reg = registry();
        let id = doc("doc1");
        reg.acquire(&id);
        reg.release(&id);
        tokio::time::sleep(Duration::from_secs(20)).await;
        reg.acquire(&id);
        reg.release(&id);

        // 31s after the first release, but only 11s after the second
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(reg.contains(&id));
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(!reg.contains(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_write_back_postpones_eviction() {
        let reg = registry();
        let id = doc("doc1");
        let handle = reg.acquire(&id);
        let policy = WriteBackPolicy::default();
        handle.write_back().trigger(&policy, Instant::now()).await;
        reg.release(&id);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(reg.contains(&id), "unpersisted state stays resident");

        {
            let _gate = handle.write_back().lock_gate().await;
            handle.write_back().begin_flush(None, Instant::now()).await;
            handle.write_back().finish_flush(&policy).await;
        }
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!reg.contains(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_documents_usable_while_one_is_flushing() {
        let reg = registry();
        let busy = reg.acquire(&doc("busy"));
        let policy = WriteBackPolicy::default();
        busy.write_back().trigger(&policy, Instant::now()).await;
        reg.release(&doc("busy"));

        // Eviction of "busy" keeps re-checking while its flush is held open
        let _gate = busy.write_back().lock_gate().await;
        busy.write_back().begin_flush(None, Instant::now()).await;
        tokio::time::sleep(Duration::from_secs(95)).await;

        let other = reg.acquire(&doc("other"));
        reg.release(&doc("other"));
        assert_eq!(other.id(), &doc("other"));
        assert!(reg.contains(&doc("busy")));
        assert_eq!(reg.len(), 2);
    }

    #[tokio::test]
    async fn test_applied_updates_are_relayed_with_origin() {
        let reg = registry();
        let handle = reg.acquire(&doc("doc1"));
        let mut rx = handle.broadcast().subscribe();

        let conn = uuid::Uuid::new_v4();
        let update = append_text(&Doc::new(), "hi");
        handle.replica().lock().await.apply_update(&update, Some(conn)).unwrap();

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.origin, Some(conn));
        assert_eq!(Frame::decode(&frame.bytes).unwrap(), Frame::update(update));
    }

    #[tokio::test]
    async fn test_release_unknown_is_harmless() {
        let reg = registry();
        reg.release(&doc("never"));
        assert!(reg.is_empty());
    }
}
