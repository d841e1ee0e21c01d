//! RocksDB-backed local store.
//!
//! Column families:
//! - `documents`: full yrs document states (LZ4 compressed)
//! - `deltas`   : incremental yrs updates (LZ4 compressed, keyed by doc key + version)
//! - `metadata` : per-document metadata (bincode)

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

const CF_DOCUMENTS: &str = "documents";
const CF_DELTAS: &str = "deltas";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_DELTAS, CF_METADATA];

/// Separates the document key from the version in delta keys.
const DELTA_SEPARATOR: u8 = 0;

/// Storage key of a pipeline document.
pub fn document_key(pipeline_id: &str) -> String {
    format!("pipeline-{pipeline_id}")
}

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: false)
    pub sync_writes: bool,
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("flowgraph_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches, caller-supplied directory.
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

/// Metadata stored alongside each document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub key: String,
    /// Version of the newest delta (monotonically increasing)
    pub version: u64,
    /// Deltas written since the last compaction
    pub delta_count: u64,
    /// Uncompressed snapshot size in bytes
    pub snapshot_size: u64,
    /// Compressed snapshot size in bytes
    pub compressed_size: u64,
    /// Seconds since epoch
    pub created_at: u64,
    pub updated_at: u64,
}

impl DocumentMetadata {
    fn new(key: &str) -> Self {
        let now = now_secs();
        Self {
            key: key.to_string(),
            version: 0,
            delta_count: 0,
            snapshot_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
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

/// Storage errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Document not found: {0}")]
    NotFound(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Compression error: {0}")]
    Compression(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// RocksDB-backed store for pipeline document states and deltas.
pub struct LocalStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes metadata read-modify-write cycles.
    write_lock: Mutex<()>,
}

impl LocalStore {
    /// Open the store, creating the database and column families if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;
        log::info!("Opened local store at {}", config.path.display());

        Ok(Self {
            db,
            config,
            write_lock: Mutex::new(()),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);

        // Values are already LZ4 framed.
        opts.set_compression_type(DBCompressionType::None);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_DOCUMENTS | CF_METADATA => {
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_DELTAS => {
                // Many small sequential writes per document.
                opts.set_max_write_buffer_number(4);
            }
            _ => {}
        }

        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Document states ──────────────────────────────────────────────

    /// Save a full document state (LZ4 compressed).
    pub fn save_snapshot(&self, key: &str, state: &[u8]) -> Result<DocumentMetadata, StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let compressed = lz4_flex::compress_prepend_size(state);
        let mut meta = self.metadata_or_new(key)?;
        meta.snapshot_size = state.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = now_secs();

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_docs, key.as_bytes(), &compressed);
        batch.put_cf(&cf_meta, key.as_bytes(), meta.encode()?);
        self.write(batch)?;

        Ok(meta)
    }

    /// Load a full document state.
    pub fn load_snapshot(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        match self.db.get_cf(&cf, key.as_bytes())? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map_err(|e| StoreError::Compression(e.to_string())),
            None => Err(StoreError::NotFound(key.to_string())),
        }
    }

    pub fn document_exists(&self, key: &str) -> Result<bool, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        Ok(self.db.get_cf(&cf, key.as_bytes())?.is_some())
    }

    /// Everything needed to rebuild a document: the saved state (if any)
    /// followed by every delta written after it, in version order.
    pub fn load_state(&self, key: &str) -> Result<Vec<Vec<u8>>, StoreError> {
        let mut updates = match self.load_snapshot(key) {
            Ok(state) => vec![state],
            Err(StoreError::NotFound(_)) => Vec::new(),
            Err(e) => return Err(e),
        };
        updates.extend(self.load_all_deltas(key)?.into_iter().map(|(_, delta)| delta));
        Ok(updates)
    }

    // ─── Deltas ───────────────────────────────────────────────────────

    /// Append a delta under the next version. Returns the version assigned.
    pub fn append_delta(&self, key: &str, delta: &[u8]) -> Result<u64, StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let cf_deltas = self.cf(CF_DELTAS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let mut meta = self.metadata_or_new(key)?;
        meta.version += 1;
        meta.delta_count += 1;
        meta.updated_at = now_secs();

        let mut batch = WriteBatch::default();
        batch.put_cf(
            &cf_deltas,
            delta_key(key, meta.version),
            lz4_flex::compress_prepend_size(delta),
        );
        batch.put_cf(&cf_meta, key.as_bytes(), meta.encode()?);
        self.write(batch)?;

        Ok(meta.version)
    }

    /// Deltas with `version >= since`, in version order.
    pub fn load_deltas_since(&self, key: &str, since: u64) -> Result<Vec<(u64, Vec<u8>)>, StoreError> {
        let mut deltas = Vec::new();
        self.scan_deltas(key, since, |version, value| {
            let delta = lz4_flex::decompress_size_prepended(value)
                .map_err(|e| StoreError::Compression(e.to_string()))?;
            deltas.push((version, delta));
            Ok(())
        })?;
        Ok(deltas)
    }

    pub fn load_all_deltas(&self, key: &str) -> Result<Vec<(u64, Vec<u8>)>, StoreError> {
        self.load_deltas_since(key, 0)
    }

    /// Deltas written since the last compaction.
    pub fn delta_count(&self, key: &str) -> Result<u64, StoreError> {
        Ok(self.load_metadata(key)?.delta_count)
    }

    /// Delete deltas with `version <= up_to`. Returns how many were removed.
    pub fn compact_deltas(&self, key: &str, up_to: u64) -> Result<u64, StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let cf_deltas = self.cf(CF_DELTAS)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let mut batch = WriteBatch::default();
        let mut removed = 0u64;
        let mut kept = 0u64;
        self.scan_deltas(key, 0, |version, _| {
            if version <= up_to {
                batch.delete_cf(&cf_deltas, delta_key(key, version));
                removed += 1;
            } else {
                kept += 1;
            }
            Ok(())
        })?;
        if removed > 0 {
            let mut meta = self.metadata_or_new(key)?;
            meta.delta_count = kept;
            meta.updated_at = now_secs();
            batch.put_cf(&cf_meta, key.as_bytes(), meta.encode()?);
            self.write(batch)?;
        }
        Ok(removed)
    }

    /// Last delta version assigned to `key`, 0 if nothing was ever written.
    pub fn current_version(&self, key: &str) -> Result<u64, StoreError> {
        Ok(self.metadata_or_new(key)?.version)
    }

    /// Replace the saved state with `state` and drop the deltas it covers,
    /// atomically.
    ///
    /// `state` must include every delta up to `through`; read that version
    /// with [`current_version`](Self::current_version) before encoding the
    /// state. Later deltas are kept and replayed on top of it.
    pub fn compact(
        &self,
        key: &str,
        state: &[u8],
        through: u64,
    ) -> Result<DocumentMetadata, StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_deltas = self.cf(CF_DELTAS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let compressed = lz4_flex::compress_prepend_size(state);
        let mut batch = WriteBatch::default();
        let mut removed = 0u64;
        let mut kept = 0u64;
        self.scan_deltas(key, 0, |version, _| {
            if version <= through {
                batch.delete_cf(&cf_deltas, delta_key(key, version));
                removed += 1;
            } else {
                kept += 1;
            }
            Ok(())
        })?;

        let mut meta = self.metadata_or_new(key)?;
        meta.delta_count = kept;
        meta.snapshot_size = state.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = now_secs();
        batch.put_cf(&cf_docs, key.as_bytes(), &compressed);
        batch.put_cf(&cf_meta, key.as_bytes(), meta.encode()?);
        self.write(batch)?;

        log::debug!(
            "Compacted {key} through v{through}: {removed} deltas folded into {} byte state, {kept} kept",
            state.len()
        );
        Ok(meta)
    }

    // ─── Metadata ─────────────────────────────────────────────────────

    pub fn load_metadata(&self, key: &str) -> Result<DocumentMetadata, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, key.as_bytes())? {
            Some(bytes) => DocumentMetadata::decode(&bytes),
            None => Err(StoreError::NotFound(key.to_string())),
        }
    }

    /// Keys of every stored document.
    pub fn list_documents(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut keys = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            let key = String::from_utf8(key.to_vec())
                .map_err(|e| StoreError::Deserialization(format!("document key: {e}")))?;
            keys.push(key);
        }
        Ok(keys)
    }

    /// Delete a document's state, deltas and metadata.
    pub fn delete_document(&self, key: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_deltas = self.cf(CF_DELTAS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_docs, key.as_bytes());
        batch.delete_cf(&cf_meta, key.as_bytes());
        self.scan_deltas(key, 0, |version, _| {
            batch.delete_cf(&cf_deltas, delta_key(key, version));
            Ok(())
        })?;
        self.write(batch)?;
        log::info!("Deleted local document {key}");
        Ok(())
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn metadata_or_new(&self, key: &str) -> Result<DocumentMetadata, StoreError> {
        match self.load_metadata(key) {
            Ok(meta) => Ok(meta),
            Err(StoreError::NotFound(_)) => Ok(DocumentMetadata::new(key)),
            Err(e) => Err(e),
        }
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    /// Visit this document's deltas with `version >= since` in order.
    fn scan_deltas<F>(&self, key: &str, since: u64, mut visit: F) -> Result<(), StoreError>
    where
        F: FnMut(u64, &[u8]) -> Result<(), StoreError>,
    {
        let cf = self.cf(CF_DELTAS)?;
        let start = delta_key(key, since);
        let prefix_len = key.len() + 1;

        for item in self.db.iterator_cf(&cf, IteratorMode::From(&start, Direction::Forward)) {
            let (k, value) = item?;
            if k.len() != prefix_len + 8
                || !k.starts_with(key.as_bytes())
                || k[key.len()] != DELTA_SEPARATOR
            {
                break;
            }
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&k[prefix_len..]);
            visit(u64::from_be_bytes(buf), &value)?;
        }
        Ok(())
    }
}

/// `<key bytes><0x00><version: 8 bytes big-endian>`
fn delta_key(key: &str, version: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.len() + 9);
    out.extend_from_slice(key.as_bytes());
    out.push(DELTA_SEPARATOR);
    out.extend_from_slice(&version.to_be_bytes());
    out
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
