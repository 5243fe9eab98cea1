//! Best-effort cache tier: bounded LRU with per-entry expiry.
//!
//! Entries are evicted either when they expire or when the least recently
//! used one must make room. Expiry uses tokio's clock so paused-time tests
//! can advance it.

use std::num::NonZeroUsize;
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::CacheTier;

/// Cache errors. Callers log these and carry on without the cache.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    #[error("Invalid cache capacity: {0}")]
    InvalidCapacity(usize),
    #[error("Cache unavailable: {0}")]
    Unavailable(String),
    #[error("Cache TTL out of range: {0:?}")]
    TtlOutOfRange(Duration),
}

struct CacheEntry {
    value: Vec<u8>,
    expires_at: Instant,
}

pub struct MemoryCache {
    entries: Mutex<LruCache<String, CacheEntry>>,
}

impl MemoryCache {
    /// Cache holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Result<Self, CacheError> {
        let capacity = NonZeroUsize::new(capacity).ok_or(CacheError::InvalidCapacity(capacity))?;
        Ok(Self {
            entries: Mutex::new(LruCache::new(capacity)),
        })
    }

    /// Live (unexpired) entries.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .await
            .iter()
            .filter(|(_, entry)| entry.expires_at > now)
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl CacheTier for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        let lookup = entries
            .get(key)
            .map(|entry| (entry.expires_at > now).then(|| entry.value.clone()));
        match lookup {
            None => Ok(None),
            Some(Some(value)) => Ok(Some(value)),
            Some(None) => {
                entries.pop(key);
                Ok(None)
            }
        }
    }

    async fn set_with_expiry(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError> {
        let expires_at = Instant::now()
            .checked_add(ttl)
            .ok_or(CacheError::TtlOutOfRange(ttl))?;
        let entry = CacheEntry {
            value: value.to_vec(),
            expires_at,
        };
        self.entries.lock().await.put(key.to_string(), entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_capacity_rejected() {
        assert_eq!(MemoryCache::new(0).err(), Some(CacheError::InvalidCapacity(0)));
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let cache = MemoryCache::new(4).unwrap();
        assert_eq!(cache.get("doc:a").await.unwrap(), None);

        cache.set_with_expiry("doc:a", b"state", Duration::from_secs(60)).await.unwrap();
        assert_eq!(cache.get("doc:a").await.unwrap(), Some(b"state".to_vec()));
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire() {
        let cache = MemoryCache::new(4).unwrap();
        cache.set_with_expiry("doc:a", b"state", Duration::from_secs(3600)).await.unwrap();

        tokio::time::sleep(Duration::from_secs(3599)).await;
        assert!(cache.get("doc:a").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(cache.get("doc:a").await.unwrap(), None);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_unrepresentable_ttl_is_an_error() {
        let cache = MemoryCache::new(4).unwrap();
        let ttl = Duration::from_secs(u64::MAX);
        assert_eq!(
            cache.set_with_expiry("doc:a", b"state", ttl).await,
            Err(CacheError::TtlOutOfRange(ttl))
        );
        assert_eq!(cache.get("doc:a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_overwrite_refreshes_value() {
        let cache = MemoryCache::new(4).unwrap();
        cache.set_with_expiry("doc:a", b"old", Duration::from_secs(60)).await.unwrap();
        cache.set_with_expiry("doc:a", b"new", Duration::from_secs(60)).await.unwrap();
        assert_eq!(cache.get("doc:a").await.unwrap(), Some(b"new".to_vec()));
    }

    #[tokio::test]
    async fn test_least_recently_used_evicted() {
        let cache = MemoryCache::new(2).unwrap();
        let ttl = Duration::from_secs(60);
        cache.set_with_expiry("a", b"1", ttl).await.unwrap();
        cache.set_with_expiry("b", b"2", ttl).await.unwrap();
        cache.get("a").await.unwrap();
        cache.set_with_expiry("c", b"3", ttl).await.unwrap();

        assert!(cache.get("a").await.unwrap().is_some());
        assert_eq!(cache.get("b").await.unwrap(), None);
        assert!(cache.get("c").await.unwrap().is_some());
    }
}
