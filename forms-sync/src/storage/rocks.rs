//! RocksDB-backed response store.
//!
//! Column families:
//! - `responses`  : per-document metadata (bincode: version, submission count, timestamps)
//! - `fields`     : current field values (JSON, keyed by doc_id:field_id)
//! - `submissions`: final submissions (LZ4-compressed JSON, keyed by doc_id:sequence)
//!
//! Conditional writes run in a pessimistic `TransactionDB` transaction that
//! locks the document's metadata key with `get_for_update`. Concurrent writers
//! against the same document serialize on that lock inside RocksDB, so the
//! version check and the write commit as one unit.
//!
//! Reference: Kleppmann, DDIA, Chapter 7 (Preventing Lost Updates, compare-and-set)

use async_trait::async_trait;
use chrono::Utc;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamily, ColumnFamilyDescriptor, DBCompressionType,
    Direction, IteratorMode, Options, SingleThreaded, TransactionDB, TransactionDBOptions,
    TransactionOptions, WriteOptions,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use super::{ApplyOutcome, FieldValues, FinalSubmission, ResponseState, ResponseStore, StoreError};

const CF_RESPONSES: &str = "responses";
const CF_FIELDS: &str = "fields";
const CF_SUBMISSIONS: &str = "submissions";

const COLUMN_FAMILIES: &[&str] = &[CF_RESPONSES, CF_FIELDS, CF_SUBMISSIONS];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every commit (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
    /// How long a writer waits for another writer's row lock before giving up
    pub lock_timeout_ms: i64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("forms_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
            lock_timeout_ms: 1_000,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
            lock_timeout_ms: 5_000,
        }
    }
}

/// Fixed-shape metadata row, one per document.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ResponseMeta {
    version: u64,
    submission_count: u64,
    /// Milliseconds since epoch
    created_at: i64,
    updated_at: i64,
}

impl ResponseMeta {
    fn new() -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            version: 0,
            submission_count: 0,
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

/// Durable response store.
pub struct RocksStore {
    db: TransactionDB<SingleThreaded>,
    config: StoreConfig,
}

impl RocksStore {
    /// Open the store, creating the database and column families if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let mut txn_db_opts = TransactionDBOptions::default();
        txn_db_opts.set_txn_lock_timeout(config.lock_timeout_ms);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = TransactionDB::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &txn_db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened response store at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_RESPONSES => {
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_FIELDS | CF_SUBMISSIONS => {
                // Prefix-scanned by doc_id
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
            }
            _ => {}
        }

        opts
    }

    /// Database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Whether a response record exists for the document.
    pub fn document_exists(&self, document_id: Uuid) -> Result<bool, StoreError> {
        let cf = self.cf(CF_RESPONSES)?;
        Ok(self.db.get_cf(cf, document_id.as_bytes())?.is_some())
    }

    /// All documents with a response record.
    pub fn list_documents(&self) -> Result<Vec<Uuid>, StoreError> {
        let cf = self.cf(CF_RESPONSES)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            let bytes: [u8; 16] = key
                .as_ref()
                .try_into()
                .map_err(|_| StoreError::Deserialization("Invalid document key".into()))?;
            ids.push(Uuid::from_bytes(bytes));
        }
        Ok(ids)
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    fn write_opts(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        write_opts
    }

    fn read_meta(&self, document_id: Uuid) -> Result<ResponseMeta, StoreError> {
        let cf = self.cf(CF_RESPONSES)?;
        match self.db.get_cf(cf, document_id.as_bytes())? {
            Some(bytes) => ResponseMeta::decode(&bytes),
            None => Err(StoreError::NotFound(document_id)),
        }
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    /// doc_id (16 bytes) + field id (utf-8)
    fn field_key(document_id: Uuid, field_id: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(16 + field_id.len());
        key.extend_from_slice(document_id.as_bytes());
        key.extend_from_slice(field_id.as_bytes());
        key
    }

    /// doc_id (16 bytes) + sequence (8 bytes big-endian)
    fn submission_key(document_id: Uuid, sequence: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(24);
        key.extend_from_slice(document_id.as_bytes());
        key.extend_from_slice(&sequence.to_be_bytes());
        key
    }
}

#[async_trait]
impl ResponseStore for RocksStore {
    async fn create_response(&self, document_id: Uuid) -> Result<ResponseState, StoreError> {
        let created = {
            let cf = self.cf(CF_RESPONSES)?;
            let txn = self.db.transaction_opt(&self.write_opts(), &TransactionOptions::default());
            if txn.get_for_update_cf(cf, document_id.as_bytes(), true)?.is_none() {
                txn.put_cf(cf, document_id.as_bytes(), ResponseMeta::new().encode()?)?;
                txn.commit()?;
                true
            } else {
                false
            }
        };

        if created {
            log::debug!("Created response record for {document_id}");
            return Ok(ResponseState::new(document_id));
        }
        self.load_state(document_id).await
    }

    async fn get_version(&self, document_id: Uuid) -> Result<u64, StoreError> {
        Ok(self.read_meta(document_id)?.version)
    }

    async fn load_state(&self, document_id: Uuid) -> Result<ResponseState, StoreError> {
        let cf_resp = self.cf(CF_RESPONSES)?;
        let cf_fields = self.cf(CF_FIELDS)?;

        // Metadata and fields read from one snapshot so the version matches the values.
        let snapshot = self.db.snapshot();
        let meta = match snapshot.get_cf(cf_resp, document_id.as_bytes())? {
            Some(bytes) => ResponseMeta::decode(&bytes)?,
            None => return Err(StoreError::NotFound(document_id)),
        };

        let mut values = FieldValues::new();
        let prefix = document_id.as_bytes();
        let iter = snapshot.iterator_cf(cf_fields, IteratorMode::From(prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if key.len() <= 16 || &key[..16] != prefix {
                break;
            }
            let field_id = String::from_utf8(key[16..].to_vec())
                .map_err(|e| StoreError::Deserialization(e.to_string()))?;
            let value: Value = serde_json::from_slice(&value)
                .map_err(|e| StoreError::Deserialization(e.to_string()))?;
            values.insert(field_id, value);
        }

        Ok(ResponseState {
            document_id,
            values,
            version: meta.version,
        })
    }

    async fn compare_and_apply(
        &self,
        document_id: Uuid,
        field_id: &str,
        value: Value,
        expected_version: u64,
    ) -> Result<ApplyOutcome, StoreError> {
        let cf_resp = self.cf(CF_RESPONSES)?;
        let cf_fields = self.cf(CF_FIELDS)?;

        let encoded_value =
            serde_json::to_vec(&value).map_err(|e| StoreError::Serialization(e.to_string()))?;

        let txn = self.db.transaction_opt(&self.write_opts(), &TransactionOptions::default());
        let mut meta = match txn.get_for_update_cf(cf_resp, document_id.as_bytes(), true)? {
            Some(bytes) => ResponseMeta::decode(&bytes)?,
            None => return Err(StoreError::NotFound(document_id)),
        };

        if meta.version != expected_version {
            // Dropping the transaction rolls it back and releases the lock.
            return Ok(ApplyOutcome {
                applied: false,
                version: meta.version,
            });
        }

        meta.version += 1;
        meta.updated_at = Utc::now().timestamp_millis();
        txn.put_cf(cf_fields, Self::field_key(document_id, field_id), encoded_value)?;
        txn.put_cf(cf_resp, document_id.as_bytes(), meta.encode()?)?;
        txn.commit()?;

        Ok(ApplyOutcome {
            applied: true,
            version: meta.version,
        })
    }

    async fn append_final_submission(
        &self,
        document_id: Uuid,
        submitter_id: &str,
        answers: FieldValues,
    ) -> Result<FinalSubmission, StoreError> {
        let cf_resp = self.cf(CF_RESPONSES)?;
        let cf_subs = self.cf(CF_SUBMISSIONS)?;

        let txn = self.db.transaction_opt(&self.write_opts(), &TransactionOptions::default());
        let mut meta = match txn.get_for_update_cf(cf_resp, document_id.as_bytes(), true)? {
            Some(bytes) => ResponseMeta::decode(&bytes)?,
            None => return Err(StoreError::NotFound(document_id)),
        };

        meta.submission_count += 1;
        let submission =
            FinalSubmission::new(document_id, submitter_id, meta.submission_count, answers);
        let json = serde_json::to_vec(&submission)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let compressed = lz4_flex::compress_prepend_size(&json);

        txn.put_cf(cf_subs, Self::submission_key(document_id, submission.sequence), compressed)?;
        txn.put_cf(cf_resp, document_id.as_bytes(), meta.encode()?)?;
        txn.commit()?;

        Ok(submission)
    }

    async fn list_submissions(
        &self,
        document_id: Uuid,
    ) -> Result<Vec<FinalSubmission>, StoreError> {
        // Distinguish "no submissions yet" from "no such document".
        self.read_meta(document_id)?;

        let cf = self.cf(CF_SUBMISSIONS)?;
        let start_key = Self::submission_key(document_id, 0);
        let mut submissions = Vec::new();

        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&start_key, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if key.len() < 24 || &key[..16] != document_id.as_bytes() {
                break;
            }
            let json = lz4_flex::decompress_size_prepended(&value)
                .map_err(|e| StoreError::Compression(e.to_string()))?;
            let submission: FinalSubmission = serde_json::from_slice(&json)
                .map_err(|e| StoreError::Deserialization(e.to_string()))?;
            submissions.push(submission);
        }

        Ok(submissions)
    }
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
