//! RocksDB-backed durable store, owned by the hub.
//!
//! Column families:
//! - `document`  — the current text under a single key (LZ4 compressed)
//! - `snapshots` — saved copies keyed by `<millis:8 BE><seq:8 BE>` (LZ4 compressed)
//! - `counters`  — the participant counter (i64 big-endian)

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteOptions,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::SystemTime;

use super::{DocumentStore, Snapshot};
use crate::error::{Result, SyncError};

const CF_DOCUMENT: &str = "document";
const CF_SNAPSHOTS: &str = "snapshots";
const CF_COUNTERS: &str = "counters";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENT, CF_SNAPSHOTS, CF_COUNTERS];

const DOCUMENT_KEY: &[u8] = b"current";
const PARTICIPANTS_KEY: &[u8] = b"participants";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 32MB)
    pub block_cache_size: usize,
    /// fsync on every write (default: true — the document is a single hot key)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("quill_data"),
            block_cache_size: 32 * 1024 * 1024,
            sync_writes: true,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches, no fsync.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 1024 * 1024,
        }
    }
}

/// RocksDB document store.
pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes read-modify-write on the counter
    counter_lock: Mutex<()>,
    /// Orders snapshots saved within the same millisecond
    snapshot_seq: AtomicU64,
}

impl RocksStore {
    /// Open the store, creating the database and column families if missing.
    pub fn open(config: StoreConfig) -> Result<Self> {
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

        log::info!("Opened document store at {}", config.path.display());

        Ok(Self {
            db,
            config,
            counter_lock: Mutex::new(()),
            snapshot_seq: AtomicU64::new(0),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_DOCUMENT | CF_COUNTERS => {
                // Single hot keys, point lookups only; values already LZ4'd
                opts.set_compression_type(DBCompressionType::None);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_SNAPSHOTS => {
                // Append-only, scanned in key (time) order
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(2);
            }
            _ => {}
        }

        opts
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| SyncError::Storage(format!("missing column family {name}")))
    }

    fn write_opts(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        write_opts
    }

    // ─── Document ─────────────────────────────────────────────────────

    /// Load the current text, `""` if never written.
    pub fn load_document(&self) -> Result<String> {
        let cf = self.cf(CF_DOCUMENT)?;
        match self.db.get_cf(cf, DOCUMENT_KEY)? {
            Some(compressed) => decompress_text(&compressed),
            None => Ok(String::new()),
        }
    }

    /// Overwrite the current text.
    pub fn store_document(&self, text: &str) -> Result<()> {
        let cf = self.cf(CF_DOCUMENT)?;
        let compressed = lz4_flex::compress_prepend_size(text.as_bytes());
        self.db
            .put_cf_opt(cf, DOCUMENT_KEY, compressed, &self.write_opts())?;
        Ok(())
    }

    // ─── Snapshots ────────────────────────────────────────────────────

    /// Append a saved copy to the audit slot.
    pub fn append_snapshot(&self, text: &str, timestamp: &str) -> Result<()> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        let snapshot = Snapshot {
            timestamp: timestamp.to_string(),
            text: text.to_string(),
        };
        let encoded = bincode::serde::encode_to_vec(&snapshot, bincode::config::standard())
            .map_err(|e| SyncError::Storage(e.to_string()))?;
        let compressed = lz4_flex::compress_prepend_size(&encoded);

        let seq = self.snapshot_seq.fetch_add(1, Ordering::Relaxed);
        self.db
            .put_cf_opt(cf, snapshot_key(now_millis(), seq), compressed, &self.write_opts())?;
        Ok(())
    }

    /// All saved copies, oldest first.
    pub fn list_snapshots(&self) -> Result<Vec<Snapshot>> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        let mut snapshots = Vec::new();

        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            let decoded = lz4_flex::decompress_size_prepended(&value)
                .map_err(|e| SyncError::Storage(e.to_string()))?;
            let (snapshot, _) =
                bincode::serde::decode_from_slice(&decoded, bincode::config::standard())
                    .map_err(|e| SyncError::Storage(e.to_string()))?;
            snapshots.push(snapshot);
        }

        Ok(snapshots)
    }

    // ─── Counters ─────────────────────────────────────────────────────

    fn read_counter(&self, cf: &rocksdb::ColumnFamily) -> Result<i64> {
        match self.db.get_cf(cf, PARTICIPANTS_KEY)? {
            Some(bytes) if bytes.len() == 8 => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&bytes);
                Ok(i64::from_be_bytes(buf))
            }
            Some(_) => Err(SyncError::Storage("corrupt participant counter".into())),
            None => Ok(0),
        }
    }

    /// Add `delta` to the participant counter.
    pub fn adjust_counter(&self, delta: i64) -> Result<i64> {
        let cf = self.cf(CF_COUNTERS)?;
        let _guard = self
            .counter_lock
            .lock()
            .map_err(|_| SyncError::Storage("counter lock poisoned".into()))?;

        let value = self.read_counter(cf)?.saturating_add(delta);
        self.db
            .put_cf_opt(cf, PARTICIPANTS_KEY, value.to_be_bytes(), &self.write_opts())?;
        Ok(value)
    }

    pub fn counter(&self) -> Result<i64> {
        self.read_counter(self.cf(CF_COUNTERS)?)
    }

    /// Zero the participant counter. Called when the hub starts, since no
    /// connection can survive a hub restart with its count intact.
    pub fn reset_participants(&self) -> Result<()> {
        let cf = self.cf(CF_COUNTERS)?;
        let _guard = self
            .counter_lock
            .lock()
            .map_err(|_| SyncError::Storage("counter lock poisoned".into()))?;
        self.db
            .put_cf_opt(cf, PARTICIPANTS_KEY, 0i64.to_be_bytes(), &self.write_opts())?;
        Ok(())
    }

}

#[async_trait]
impl DocumentStore for RocksStore {
    async fn get(&self) -> Result<String> {
        self.load_document()
    }

    async fn set(&self, text: &str) -> Result<()> {
        self.store_document(text)
    }

    async fn save_snapshot(&self, text: &str, timestamp: &str) -> Result<()> {
        self.append_snapshot(text, timestamp)
    }

    async fn adjust_participants(&self, delta: i64) -> Result<i64> {
        self.adjust_counter(delta)
    }

    async fn participants(&self) -> Result<i64> {
        self.counter()
    }
}

fn decompress_text(compressed: &[u8]) -> Result<String> {
    let bytes = lz4_flex::decompress_size_prepended(compressed)
        .map_err(|e| SyncError::Storage(e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| SyncError::Storage(e.to_string()))
}

/// Time-ordered key; the sequence suffix keeps same-millisecond saves
/// distinct and in save order.
fn snapshot_key(millis: u64, seq: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(16);
    key.extend_from_slice(&millis.to_be_bytes());
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
