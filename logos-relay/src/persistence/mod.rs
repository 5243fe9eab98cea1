//! Persistence coordinator: debounced write-back and read-through load.
//!
//! ## Write path
//!
//! ```text
//! mutation ──► schedule() ──► WriteBack (Idle → Pending) ──► timer task
//!                                                               │ deadline
//!                                                               ▼
//!                       flush(): encode_state ──► DurableStore.store_update
//!                                                   │ ok
//!                                                   ▼
//!                                              CacheTier.set_with_expiry (best effort)
//! ```
//!
//! ## Load path
//!
//! cache hit → apply; miss or error → durable store → apply if non-empty →
//! repopulate cache.
//!
//! The durable store is authoritative. Cache failures are logged and
//! swallowed; store failures are logged and surfaced to the caller, while
//! the in-memory replica stays authoritative until the next write-back.

pub mod debounce;

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::time::Instant;

use crate::registry::ReplicaHandle;
use crate::replica::{EngineError, ReplicaEngine};
use crate::storage::{CacheTier, DurableStore, StoreError};

pub use debounce::{FlushStart, Trigger, WriteBack, WriteBackPhase, WriteBackPolicy};

/// Persistence errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PersistenceError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("Stored state could not be applied: {0}")]
    Engine(#[from] EngineError),
    #[error("Write-back panicked: {0}")]
    Panicked(String),
}

/// Where a document's initial state came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSource {
    Cache,
    Store,
    /// Neither tier knew the document
    Empty,
}

/// Point-in-time persistence counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistenceStats {
    pub flushes: u64,
    pub flush_failures: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_errors: u64,
    pub store_loads: u64,
}

#[derive(Debug, Default)]
struct Counters {
    flushes: AtomicU64,
    flush_failures: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    cache_errors: AtomicU64,
    store_loads: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

pub struct PersistenceCoordinator {
    store: Arc<dyn DurableStore>,
    cache: Option<Arc<dyn CacheTier>>,
    policy: WriteBackPolicy,
    cache_ttl: Duration,
    counters: Counters,
}

impl PersistenceCoordinator {
    pub fn new(
        store: Arc<dyn DurableStore>,
        cache: Option<Arc<dyn CacheTier>>,
        policy: WriteBackPolicy,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            store,
            cache,
            policy,
            cache_ttl,
            counters: Counters::default(),
        }
    }

    pub fn policy(&self) -> &WriteBackPolicy {
        &self.policy
    }

    pub fn has_cache(&self) -> bool {
        self.cache.is_some()
    }

    /// Note a mutation of `handle`; a flush follows once the burst settles.
    pub async fn schedule<E: ReplicaEngine>(self: &Arc<Self>, handle: &Arc<ReplicaHandle<E>>) {
        match handle.write_back().trigger(&self.policy, Instant::now()).await {
            Trigger::Armed { epoch } => self.arm(handle.clone(), epoch),
            Trigger::Extended | Trigger::Retrigger => {}
        }
    }

    /// Flush pending state of `handle` now.
    ///
    /// Waits for an in-flight flush first. Returns `Ok(false)` when nothing
    /// was pending.
    pub async fn flush<E: ReplicaEngine>(
        self: &Arc<Self>,
        handle: &Arc<ReplicaHandle<E>>,
    ) -> Result<bool, PersistenceError> {
        let _gate = handle.write_back().lock_gate().await;
        match handle.write_back().begin_flush(None, Instant::now()).await {
            FlushStart::Started => self.run_flush(handle).await.map(|()| true),
            FlushStart::NotDue(_) | FlushStart::Nothing => Ok(false),
        }
    }

    /// Load initial state into a freshly created replica.
    pub async fn load<E: ReplicaEngine>(
        &self,
        handle: &ReplicaHandle<E>,
    ) -> Result<LoadSource, PersistenceError> {
        let doc = handle.id();

        if let Some(cache) = &self.cache {
            match cache.get(&doc.cache_key()).await {
                Ok(Some(blob)) => match handle.replica().lock().await.apply_update(&blob, None) {
                    Ok(()) => {
                        bump(&self.counters.cache_hits);
                        log::info!("Loaded document {doc} from cache ({} bytes)", blob.len());
                        return Ok(LoadSource::Cache);
                    }
                    Err(e) => {
                        bump(&self.counters.cache_errors);
                        log::warn!("Ignoring unreadable cache entry for {doc}: {e}");
                    }
                },
                Ok(None) => bump(&self.counters.cache_misses),
                Err(e) => {
                    bump(&self.counters.cache_errors);
                    log::warn!("Cache read failed for {doc}: {e}");
                }
            }
        }

        let state = self.store.get_document_state(doc).await?;
        bump(&self.counters.store_loads);
        if state.is_empty() {
            log::info!("Document {doc} is new");
            return Ok(LoadSource::Empty);
        }

        handle.replica().lock().await.apply_update(&state, None)?;
        log::info!("Loaded document {doc} from store ({} bytes)", state.len());
        self.write_cache(handle, &state).await;
        Ok(LoadSource::Store)
    }

    pub fn stats(&self) -> PersistenceStats {
        let c = &self.counters;
        PersistenceStats {
            flushes: c.flushes.load(Ordering::Relaxed),
            flush_failures: c.flush_failures.load(Ordering::Relaxed),
            cache_hits: c.cache_hits.load(Ordering::Relaxed),
            cache_misses: c.cache_misses.load(Ordering::Relaxed),
            cache_errors: c.cache_errors.load(Ordering::Relaxed),
            store_loads: c.store_loads.load(Ordering::Relaxed),
        }
    }

    /// Timer task for one burst. Ends once the epoch is flushed or superseded.
    fn arm<E: ReplicaEngine>(self: &Arc<Self>, handle: Arc<ReplicaHandle<E>>, epoch: u64) {
        let coordinator = self.clone();
        tokio::spawn(async move {
            loop {
                let Some(deadline) = handle.write_back().deadline(epoch).await else {
                    return;
                };
                tokio::time::sleep_until(deadline).await;

                let _gate = handle.write_back().lock_gate().await;
                match handle.write_back().begin_flush(Some(epoch), Instant::now()).await {
                    FlushStart::Started => {
                        // Failures are logged inside; the next mutation re-arms.
                        let _ = coordinator.run_flush(&handle).await;
                        return;
                    }
                    FlushStart::NotDue(_) => continue,
                    FlushStart::Nothing => return,
                }
            }
        });
    }

    /// Body of a flush. Caller holds the gate and has entered `Flushing`.
    ///
    /// `Flushing` is always left, even when writing panics; otherwise the
    /// document would never be written back again.
    async fn run_flush<E: ReplicaEngine>(
        self: &Arc<Self>,
        handle: &Arc<ReplicaHandle<E>>,
    ) -> Result<(), PersistenceError> {
        let result = AssertUnwindSafe(self.write_state(handle))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                bump(&self.counters.flush_failures);
                let reason = panic_message(&*panic);
                log::error!("Write-back of document {} panicked: {reason}", handle.id());
                Err(PersistenceError::Panicked(reason))
            });

        if let Some(epoch) = handle.write_back().finish_flush(&self.policy).await {
            self.arm(handle.clone(), epoch);
        }
        result
    }

    async fn write_state<E: ReplicaEngine>(&self, handle: &ReplicaHandle<E>) -> Result<(), PersistenceError> {
        let doc = handle.id();
        let state = handle.replica().lock().await.encode_state();

        match self.store.store_update(doc, &state).await {
            Ok(()) => {
                bump(&self.counters.flushes);
                log::info!("Persisted document {doc} ({} bytes)", state.len());
                self.write_cache(handle, &state).await;
                Ok(())
            }
            Err(e) => {
                bump(&self.counters.flush_failures);
                log::error!("Failed to persist document {doc}: {e}");
                Err(e.into())
            }
        }
    }

    async fn write_cache<E: ReplicaEngine>(&self, handle: &ReplicaHandle<E>, state: &[u8]) {
        let Some(cache) = &self.cache else {
            return;
        };
        let doc = handle.id();
        if let Err(e) = cache.set_with_expiry(&doc.cache_key(), state, self.cache_ttl).await {
            bump(&self.counters.cache_errors);
            log::warn!("Cache write failed for {doc}: {e}");
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
