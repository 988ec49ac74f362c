//! RocksDB-backed persistence for collection snapshots.
//!
//! Column families:
//! - `collections` — Whole-collection snapshots (JSON record array, LZ4 compressed)
//! - `metadata`    — Per-collection metadata (bincode: counts, sizes, timestamps)
//!
//! Snapshots are replaced whole on every save; the store never merges.
//! That matches the cache granularity upstream — the most recent
//! successful write wins.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::SystemTime;

use shoal_core::Record;

/// Column family names.
const CF_COLLECTIONS: &str = "collections";
const CF_METADATA: &str = "metadata";

/// All column family names for initialization.
const COLUMN_FAMILIES: &[&str] = &[CF_COLLECTIONS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("shoal_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, temp directory).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Collection metadata stored alongside snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionMetadata {
    /// Collection name
    pub collection: String,
    /// Records in the latest snapshot
    pub record_count: u64,
    /// Uncompressed snapshot size in bytes
    pub snapshot_size: u64,
    /// Compressed snapshot size in bytes
    pub compressed_size: u64,
    /// Creation timestamp (seconds since epoch)
    pub created_at: u64,
    /// Last modified timestamp (seconds since epoch)
    pub updated_at: u64,
}

impl CollectionMetadata {
    fn new(collection: &str) -> Self {
        let now = unix_secs();
        Self {
            collection: collection.to_string(),
            record_count: 0,
            snapshot_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, PersistError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| PersistError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, PersistError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| PersistError::Deserialization(e.to_string()))?;
        Ok(meta)
    }
}

/// Persistence errors.
#[derive(Debug, Clone)]
pub enum PersistError {
    /// RocksDB internal error
    Database(String),
    /// Collection not found
    NotFound(String),
    /// Serialization failed
    Serialization(String),
    /// Deserialization failed
    Deserialization(String),
    /// Compression error
    Compression(String),
}

impl std::fmt::Display for PersistError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Database(e) => write!(f, "Database error: {e}"),
            Self::NotFound(name) => write!(f, "Collection not found: {name}"),
            Self::Serialization(e) => write!(f, "Serialization error: {e}"),
            Self::Deserialization(e) => write!(f, "Deserialization error: {e}"),
            Self::Compression(e) => write!(f, "Compression error: {e}"),
        }
    }
}

impl std::error::Error for PersistError {}

impl From<rocksdb::Error> for PersistError {
    fn from(e: rocksdb::Error) -> Self {
        PersistError::Database(e.to_string())
    }
}

fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(2)
}

/// RocksDB-backed snapshot store.
///
/// Provides durable storage for collection snapshots with:
/// - LZ4-compressed values
/// - Bloom filters for fast key lookup
/// - Atomic write batches for snapshot + metadata consistency
pub struct SnapshotStore {
    /// RocksDB instance (single-threaded mode — concurrency via tokio)
    db: DBWithThreadMode<SingleThreaded>,
    /// Store configuration
    config: StoreConfig,
}

impl SnapshotStore {
    /// Open the snapshot store at the configured path.
    ///
    /// Creates the database and column families if they don't exist.
    pub fn open(config: StoreConfig) -> Result<Self, PersistError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| {
                let cf_opts = Self::cf_options(&config);
                ColumnFamilyDescriptor::new(*name, cf_opts)
            })
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        Ok(Self { db, config })
    }

    /// Build column-family options.
    fn cf_options(config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        // Block-based table with bloom filter and cache
        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        // Values are LZ4-compressed before they reach RocksDB
        opts.set_compression_type(DBCompressionType::None);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_max_write_buffer_number(2);
        opts.optimize_for_point_lookup(config.block_cache_size as u64);

        opts
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, PersistError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| PersistError::Database(format!("missing column family: {name}")))
    }

    /// Save a whole-collection snapshot (LZ4 compressed), replacing any
    /// previous snapshot for the same collection.
    pub fn save_snapshot(
        &self,
        collection: &str,
        records: &[Record],
    ) -> Result<CollectionMetadata, PersistError> {
        let cf_collections = self.cf(CF_COLLECTIONS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let json = serde_json::to_vec(records)
            .map_err(|e| PersistError::Serialization(e.to_string()))?;
        let compressed = lz4_flex::compress_prepend_size(&json);

        // Load or create metadata, preserving created_at
        let mut meta = self
            .metadata(collection)
            .unwrap_or_else(|_| CollectionMetadata::new(collection));
        meta.record_count = records.len() as u64;
        meta.snapshot_size = json.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = unix_secs();

        // Atomic batch write: snapshot + metadata
        let key = collection.as_bytes();
        let mut batch = WriteBatch::default();
        batch.put_cf(cf_collections, key, &compressed);
        batch.put_cf(cf_meta, key, meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        Ok(meta)
    }

    /// Load a collection snapshot (LZ4 decompressed).
    pub fn load_snapshot(&self, collection: &str) -> Result<Vec<Record>, PersistError> {
        let cf = self.cf(CF_COLLECTIONS)?;

        match self.db.get_cf(cf, collection.as_bytes())? {
            Some(compressed) => {
                let json = lz4_flex::decompress_size_prepended(&compressed)
                    .map_err(|e| PersistError::Compression(e.to_string()))?;
                serde_json::from_slice(&json)
                    .map_err(|e| PersistError::Deserialization(e.to_string()))
            }
            None => Err(PersistError::NotFound(collection.to_string())),
        }
    }

    /// Check if a collection has a persisted snapshot.
    pub fn collection_exists(&self, collection: &str) -> Result<bool, PersistError> {
        let cf = self.cf(CF_METADATA)?;
        Ok(self.db.get_cf(cf, collection.as_bytes())?.is_some())
    }

    /// Load metadata for a collection.
    pub fn metadata(&self, collection: &str) -> Result<CollectionMetadata, PersistError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, collection.as_bytes())? {
            Some(bytes) => CollectionMetadata::decode(&bytes),
            None => Err(PersistError::NotFound(collection.to_string())),
        }
    }

    /// List all persisted collection names.
    pub fn list_collections(&self) -> Result<Vec<String>, PersistError> {
        let cf = self.cf(CF_METADATA)?;
        let mut names = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item.map_err(|e| PersistError::Database(e.to_string()))?;
            match std::str::from_utf8(&key) {
                Ok(name) => names.push(name.to_string()),
                Err(_) => log::warn!("Skipping non-UTF8 collection key in metadata"),
            }
        }
        Ok(names)
    }

    /// Delete a collection's snapshot and metadata.
    pub fn delete_collection(&self, collection: &str) -> Result<(), PersistError> {
        let cf_collections = self.cf(CF_COLLECTIONS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let key = collection.as_bytes();
        let mut batch = WriteBatch::default();
        batch.delete_cf(cf_collections, key);
        batch.delete_cf(cf_meta, key);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    /// Get the store configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }
}
