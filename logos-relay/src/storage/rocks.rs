//! RocksDB-backed durable store.
//!
//! Column families:
//! - `documents`: compacted snapshot per document (LZ4 compressed)
//! - `updates`: append-only update log (LZ4 compressed, keyed by doc:version)
//! - `metadata`: per-document metadata (bincode: version, sizes, timestamps)
//!
//! Every write-back appends one update record. Once a document's log holds
//! `flush_size` records, snapshot and log are folded into a new snapshot in a
//! single atomic batch. Readers always merge snapshot + log, so a crash
//! between append and compaction loses nothing.
//!
//! All RocksDB calls are blocking and run on the tokio blocking pool.

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use super::{DurableStore, MergeFn, StoreError};
use crate::document::DocumentId;
use crate::replica::{merge_updates, YrsReplica};

/// Column family names.
const CF_DOCUMENTS: &str = "documents";
const CF_UPDATES: &str = "updates";
const CF_METADATA: &str = "metadata";

/// All column family names for initialization.
const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_UPDATES, CF_METADATA];

/// Per-document write locks, striped by hash.
const LOCK_STRIPES: usize = 64;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: true)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
    /// Update-log length that triggers compaction into the snapshot
    pub flush_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("relay_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
            flush_size: 100,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, no fsync).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
            flush_size: 100,
        }
    }
}

/// Metadata stored alongside each document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DocumentMetadata {
    /// Version of the newest update record (monotonically increasing)
    pub version: u64,
    /// Update records currently in the log
    pub update_count: u64,
    /// Uncompressed snapshot size in bytes
    pub snapshot_size: u64,
    /// Compressed snapshot size in bytes
    pub compressed_size: u64,
    /// Seconds since epoch
    pub created_at: u64,
    pub last_modified: u64,
    /// Refreshed on every read; external expiry policies key on it
    pub last_accessed: u64,
}

impl DocumentMetadata {
    fn new() -> Self {
        let now = unix_now();
        Self {
            version: 0,
            update_count: 0,
            snapshot_size: 0,
            compressed_size: 0,
            created_at: now,
            last_modified: now,
            last_accessed: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(meta)
    }
}

/// RocksDB-backed durable store. Cheap to clone.
#[derive(Clone)]
pub struct RocksStore {
    inner: Arc<RocksInner>,
}

struct RocksInner {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    merge: MergeFn,
    /// Serializes metadata read-modify-write and log folding per document
    doc_locks: Vec<Mutex<()>>,
}

impl RocksStore {
    /// Open the store for yrs-encoded documents.
    ///
    /// Creates the database and column families if they don't exist.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        Self::open_with_merge(config, merge_updates::<YrsReplica>)
    }

    /// Open with a custom update-folding function (for other replica engines).
    pub fn open_with_merge(config: StoreConfig, merge: MergeFn) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.set_max_total_wal_size(128 * 1024 * 1024); // 128MB WAL limit
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        Ok(Self {
            inner: Arc::new(RocksInner {
                db,
                config,
                merge,
                doc_locks: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
            }),
        })
    }

    /// Metadata for a document, if it has ever been stored.
    pub fn metadata(&self, doc: &DocumentId) -> Result<Option<DocumentMetadata>, StoreError> {
        self.inner.load_metadata(doc)
    }

    /// All document identifiers known to the store.
    pub fn list_documents(&self) -> Result<Vec<DocumentId>, StoreError> {
        self.inner.list_documents()
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&RocksInner) -> Result<T, StoreError> + Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || f(&inner))
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?
    }
}

#[async_trait]
impl DurableStore for RocksStore {
    async fn store_update(&self, doc: &DocumentId, update: &[u8]) -> Result<(), StoreError> {
        let doc = doc.clone();
        let update = update.to_vec();
        self.blocking(move |inner| inner.append_update(&doc, &update)).await
    }

    async fn get_document_state(&self, doc: &DocumentId) -> Result<Vec<u8>, StoreError> {
        let doc = doc.clone();
        self.blocking(move |inner| inner.document_state(&doc)).await
    }
}

impl RocksInner {
    // ─── Update log ───────────────────────────────────────────────────

    fn lock_document(&self, doc: &DocumentId) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        doc.hash(&mut hasher);
        let stripe = (hasher.finish() as usize) % self.doc_locks.len();
        // The lock guards no data, so a poisoned one is still usable
        self.doc_locks[stripe].lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn append_update(&self, doc: &DocumentId, update: &[u8]) -> Result<(), StoreError> {
        let _guard = self.lock_document(doc);
        let cf_updates = self.cf(CF_UPDATES)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let mut meta = self.load_metadata(doc)?.unwrap_or_else(DocumentMetadata::new);
        meta.version += 1;
        meta.update_count += 1;
        meta.last_modified = unix_now();
        meta.last_accessed = meta.last_modified;

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_updates, update_key(doc, meta.version), lz4_flex::compress_prepend_size(update));
        batch.put_cf(cf_meta, doc_key(doc), meta.encode()?);
        self.write(batch)?;

        if meta.update_count >= self.config.flush_size as u64 {
            // The update is already durable; a failed compaction only delays folding
            if let Err(e) = self.compact(doc) {
                log::warn!("Compaction failed for document {doc}: {e}");
            }
        }
        Ok(())
    }

    /// Snapshot plus log, read under the document lock so a concurrent
    /// compaction or append cannot interleave with the metadata refresh.
    fn document_state(&self, doc: &DocumentId) -> Result<Vec<u8>, StoreError> {
        let _guard = self.lock_document(doc);
        let Some(mut meta) = self.load_metadata(doc)? else {
            return Ok(Vec::new());
        };

        let snapshot = self.load_snapshot(doc)?;
        let updates = self.load_updates(doc)?;

        let state = match (snapshot, updates.is_empty()) {
            (None, true) => Vec::new(),
            (Some(snapshot), true) => snapshot,
            (snapshot, false) => {
                let mut parts: Vec<Vec<u8>> = snapshot.into_iter().collect();
                parts.extend(updates.into_iter().map(|(_, update)| update));
                (self.merge)(&parts).map_err(|source| StoreError::Corrupt {
                    doc: doc.clone(),
                    source,
                })?
            }
        };

        meta.last_accessed = unix_now();
        self.db.put_cf(self.cf(CF_METADATA)?, doc_key(doc), meta.encode()?)?;

        Ok(state)
    }

    /// Fold the log into the snapshot. Caller holds the document lock.
    fn compact(&self, doc: &DocumentId) -> Result<(), StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_updates = self.cf(CF_UPDATES)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let updates = self.load_updates(doc)?;
        if updates.is_empty() {
            return Ok(());
        }

        let mut parts: Vec<Vec<u8>> = self.load_snapshot(doc)?.into_iter().collect();
        let versions: Vec<u64> = updates.iter().map(|(version, _)| *version).collect();
        parts.extend(updates.into_iter().map(|(_, update)| update));

        let merged = (self.merge)(&parts).map_err(|source| StoreError::Corrupt {
            doc: doc.clone(),
            source,
        })?;
        let compressed = lz4_flex::compress_prepend_size(&merged);

        let mut meta = self.load_metadata(doc)?.unwrap_or_else(DocumentMetadata::new);
        meta.update_count = 0;
        meta.snapshot_size = merged.len() as u64;
        meta.compressed_size = compressed.len() as u64;

        // Atomic batch: new snapshot, folded records removed, metadata
        let mut batch = WriteBatch::default();
        batch.put_cf(cf_docs, doc_key(doc), &compressed);
        for version in &versions {
            batch.delete_cf(cf_updates, update_key(doc, *version));
        }
        batch.put_cf(cf_meta, doc_key(doc), meta.encode()?);
        self.write(batch)?;

        log::debug!(
            "Compacted {} updates for document {doc} into {} byte snapshot",
            versions.len(),
            merged.len()
        );
        Ok(())
    }

    fn load_snapshot(&self, doc: &DocumentId) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        match self.db.get_cf(cf, doc_key(doc))? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map(Some)
                .map_err(|e| StoreError::Compression(e.to_string())),
            None => Ok(None),
        }
    }

    /// Update records for `doc` in version order, decompressed.
    fn load_updates(&self, doc: &DocumentId) -> Result<Vec<(u64, Vec<u8>)>, StoreError> {
        let cf = self.cf(CF_UPDATES)?;
        let prefix = doc_key(doc);

        let mut updates = Vec::new();
        let iter = self.db.iterator_cf(
            cf,
            IteratorMode::From(&prefix, rocksdb::Direction::Forward),
        );

        for item in iter {
            let (key, value) = item?;

            // Stop once past this document's key prefix
            if key.len() != prefix.len() + 8 || !key.starts_with(&prefix) {
                break;
            }

            let mut ver_buf = [0u8; 8];
            ver_buf.copy_from_slice(&key[prefix.len()..]);
            let version = u64::from_be_bytes(ver_buf);

            let update = lz4_flex::decompress_size_prepended(&value)
                .map_err(|e| StoreError::Compression(e.to_string()))?;
            updates.push((version, update));
        }

        Ok(updates)
    }

    // ─── Metadata ─────────────────────────────────────────────────────

    fn load_metadata(&self, doc: &DocumentId) -> Result<Option<DocumentMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        self.db
            .get_cf(cf, doc_key(doc))?
            .map(|bytes| DocumentMetadata::decode(&bytes))
            .transpose()
    }

    fn list_documents(&self) -> Result<Vec<DocumentId>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut docs = Vec::new();

        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            let name = decode_doc_key(&key)
                .ok_or_else(|| StoreError::Deserialization("Invalid document key".into()))?;
            let doc = DocumentId::new(name)
                .map_err(|e| StoreError::Deserialization(e.to_string()))?;
            docs.push(doc);
        }

        Ok(docs)
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }
}

/// Build column-family-specific options.
fn cf_options(name: &str, config: &StoreConfig) -> Options {
    let mut opts = Options::default();

    let mut block_opts = BlockBasedOptions::default();
    let cache = Cache::new_lru_cache(config.block_cache_size);
    block_opts.set_block_cache(&cache);
    block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
    block_opts.set_block_size(16 * 1024);
    opts.set_block_based_table_factory(&block_opts);

    opts.set_write_buffer_size(config.write_buffer_size);

    match name {
        CF_DOCUMENTS | CF_METADATA => {
            // Point lookups by document key
            opts.set_max_write_buffer_number(2);
            opts.optimize_for_point_lookup(config.block_cache_size as u64);
        }
        CF_UPDATES => {
            // Many small appends, range-scanned per document; values are LZ4 already
            opts.set_max_write_buffer_number(4);
            opts.set_compression_type(DBCompressionType::None);
        }
        _ => {}
    }

    opts
}

/// Length-prefixed document key: `len:u32 BE ‖ name`.
///
/// The prefix keeps one document's update range from overlapping another
/// document whose name extends it.
fn doc_key(doc: &DocumentId) -> Vec<u8> {
    let name = doc.as_str().as_bytes();
    let mut key = Vec::with_capacity(4 + name.len());
    key.extend_from_slice(&(name.len() as u32).to_be_bytes());
    key.extend_from_slice(name);
    key
}

fn decode_doc_key(key: &[u8]) -> Option<&str> {
    let (len, name) = key.split_first_chunk::<4>()?;
    if u32::from_be_bytes(*len) as usize != name.len() {
        return None;
    }
    std::str::from_utf8(name).ok()
}

/// Update-log key: `doc_key ‖ version:u64 BE`.
fn update_key(doc: &DocumentId, version: u64) -> Vec<u8> {
    let mut key = doc_key(doc);
    key.extend_from_slice(&version.to_be_bytes());
    key
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
