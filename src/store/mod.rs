//! Durable, partitioned local store backed by RocksDB
//!
//! Each partition is a column family: `data` for cached records,
//! `requests` for the replay queue, `conflicts` for unresolved divergences,
//! `settings` for key material and small config, `dead_letter` for requests
//! that exhausted their retries. An internal `_meta` family holds the request
//! id counter and the last-sync-timestamp index.
//!
//! Every public operation commits a single `WriteBatch`, so a write that
//! spans partitions (e.g. resolving a conflict) can never leave them
//! half-updated if the process dies mid-operation.

use rocksdb::{ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch, DB};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use crate::crypto::PayloadCipher;
use crate::error::{SyncError, SyncResult};
use crate::events::{EventBus, SyncEvent};
use crate::queue::{DeadRequest, QueuedRequest};
use crate::sync::conflict::Conflict;

pub const DATA_CF: &str = "data";
pub const REQUESTS_CF: &str = "requests";
pub const CONFLICTS_CF: &str = "conflicts";
pub const SETTINGS_CF: &str = "settings";
pub const DEAD_LETTER_CF: &str = "dead_letter";

/// Metadata column family name
const META_CF: &str = "_meta";
/// Counter key for monotonically increasing request ids
const REQUEST_SEQ_KEY: &[u8] = b"request_seq";

const ALL_CFS: [&str; 6] = [
    DATA_CF,
    REQUESTS_CF,
    CONFLICTS_CF,
    SETTINGS_CF,
    DEAD_LETTER_CF,
    META_CF,
];

/// One cached application entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedRecord {
    /// `module:key`, unique across the data partition
    pub composite_key: String,
    pub module: String,
    pub key: String,
    /// Serialized JSON when plaintext, `nonce || ciphertext` when encrypted
    pub payload: Vec<u8>,
    /// Milliseconds since epoch; never decreases for a given key
    pub last_sync_timestamp: u64,
    /// Incremented on every overwrite of the same key
    pub version: u64,
    pub encrypted: bool,
}

pub(crate) fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}

fn request_key(id: u64) -> Vec<u8> {
    // Zero-padded so lexicographic order matches enqueue order
    format!("{:020}", id).into_bytes()
}

fn ts_index_key(timestamp: u64, composite_key: &str) -> Vec<u8> {
    format!("ts:{:020}:{}", timestamp, composite_key).into_bytes()
}

fn cf<'a>(db: &'a DB, name: &str) -> SyncResult<&'a rocksdb::ColumnFamily> {
    db.cf_handle(name)
        .ok_or_else(|| SyncError::PartitionNotFound(name.to_string()))
}

/// Handle to the partitioned store.
///
/// Cloning shares the underlying database, so every component holds the same
/// ready state; opening is idempotent with respect to existing partitions.
#[derive(Clone)]
pub struct LocalStore {
    db: Arc<RwLock<DB>>,
    path: std::path::PathBuf,
    events: EventBus,
    /// Lazily initialized payload cipher (needs the settings partition)
    cipher: Arc<RwLock<Option<Arc<PayloadCipher>>>>,
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore").field("path", &self.path).finish()
    }
}

impl LocalStore {
    /// Open or create the store and all of its partitions.
    pub fn open<P: AsRef<Path>>(path: P, events: EventBus) -> SyncResult<Self> {
        let path = path.as_ref().to_path_buf();

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        opts.set_keep_log_file_num(5);

        let mut cf_names = match DB::list_cf(&opts, &path) {
            Ok(cfs) => cfs,
            Err(_) => vec!["default".to_string()],
        };
        for name in ALL_CFS {
            if !cf_names.iter().any(|n| n == name) {
                cf_names.push(name.to_string());
            }
        }

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = cf_names
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&opts, &path, cf_descriptors)
            .map_err(|e| SyncError::Storage(format!("failed to open local store: {}", e)))?;

        tracing::info!("Local store ready at {}", path.display());

        Ok(Self {
            db: Arc::new(RwLock::new(db)),
            path,
            events,
            cipher: Arc::new(RwLock::new(None)),
        })
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Get the payload cipher, initializing it (and the persisted key) on
    /// first use.
    fn cipher(&self) -> SyncResult<Arc<PayloadCipher>> {
        {
            let guard = self.cipher.read().unwrap();
            if let Some(cipher) = guard.as_ref() {
                return Ok(cipher.clone());
            }
        }

        // Initialize under the write lock so only one key is ever generated.
        let mut guard = self.cipher.write().unwrap();
        if let Some(cipher) = guard.as_ref() {
            return Ok(cipher.clone());
        }
        let cipher = Arc::new(PayloadCipher::from_store(self)?);
        *guard = Some(cipher.clone());
        Ok(cipher)
    }

    // ==================== Cached records ====================

    /// Composite key `{module}:{key}`. Keys may contain `:`; module names may
    /// not (the module is everything before the first separator), which
    /// [`Self::store_data`] enforces.
    pub fn composite_key(module: &str, key: &str) -> String {
        format!("{}:{}", module, key)
    }

    fn check_module_name(module: &str) -> SyncResult<()> {
        if module.contains(':') {
            return Err(SyncError::Internal(format!(
                "module name '{}' must not contain ':'",
                module
            )));
        }
        Ok(())
    }

    /// Write (or overwrite) a cached record.
    ///
    /// `last_sync_timestamp` never moves backwards for a key, and `version`
    /// counts overwrites starting at 1.
    pub fn store_data(
        &self,
        module: &str,
        key: &str,
        value: &Value,
        encrypt: bool,
    ) -> SyncResult<()> {
        Self::check_module_name(module)?;

        // Encrypt before taking the db lock: the cipher may need to persist
        // freshly generated key material through the settings partition.
        let payload = if encrypt {
            self.cipher()?.encrypt(value)?
        } else {
            serde_json::to_vec(value)?
        };

        {
            let db = self.db.write().unwrap();
            let mut batch = WriteBatch::default();
            Self::stage_record(&db, &mut batch, module, key, payload, encrypt)?;
            db.write(batch).map_err(|e| {
                SyncError::Storage(format!(
                    "failed to commit record '{}': {}",
                    Self::composite_key(module, key),
                    e
                ))
            })?;
        }

        self.events.publish(SyncEvent::DataStored {
            module: module.to_string(),
            key: key.to_string(),
            data: value.clone(),
        });
        Ok(())
    }

    /// Stage a record write plus its timestamp-index maintenance into `batch`.
    fn stage_record(
        db: &DB,
        batch: &mut WriteBatch,
        module: &str,
        key: &str,
        payload: Vec<u8>,
        encrypted: bool,
    ) -> SyncResult<CachedRecord> {
        let data_cf = cf(db, DATA_CF)?;
        let meta_cf = cf(db, META_CF)?;
        let composite = Self::composite_key(module, key);
        let now = now_ms();

        let previous: Option<CachedRecord> = db
            .get_cf(data_cf, composite.as_bytes())?
            .and_then(|bytes| serde_json::from_slice(&bytes).ok());

        let (last_sync_timestamp, version) = match &previous {
            Some(prev) => (now.max(prev.last_sync_timestamp), prev.version + 1),
            None => (now, 1),
        };

        let record = CachedRecord {
            composite_key: composite.clone(),
            module: module.to_string(),
            key: key.to_string(),
            payload,
            last_sync_timestamp,
            version,
            encrypted,
        };

        if let Some(prev) = &previous {
            batch.delete_cf(meta_cf, ts_index_key(prev.last_sync_timestamp, &composite));
        }
        batch.put_cf(meta_cf, ts_index_key(last_sync_timestamp, &composite), b"");
        batch.put_cf(data_cf, composite.as_bytes(), serde_json::to_vec(&record)?);

        Ok(record)
    }

    /// Read the decrypted payload for a key, or `None` if absent.
    ///
    /// An encrypted record that no longer decrypts is reported as absent; the
    /// failure is logged so operators can spot corruption.
    pub fn get_data(&self, module: &str, key: &str) -> SyncResult<Option<Value>> {
        match self.get_record(module, key)? {
            Some(record) => self.decode_record(&record),
            None => Ok(None),
        }
    }

    /// Raw record accessor, payload left as stored.
    pub fn get_record(&self, module: &str, key: &str) -> SyncResult<Option<CachedRecord>> {
        let composite = Self::composite_key(module, key);
        let db = self.db.read().unwrap();
        let data_cf = cf(&db, DATA_CF)?;
        match db.get_cf(data_cf, composite.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All records for a module as a key -> payload map.
    ///
    /// Records that fail to decrypt are skipped, matching [`Self::get_data`].
    pub fn get_module_data(&self, module: &str) -> SyncResult<HashMap<String, Value>> {
        let prefix = format!("{}:", module);
        let records: Vec<CachedRecord> = self.scan_prefix(DATA_CF, &prefix)?;

        let mut out = HashMap::with_capacity(records.len());
        for record in records {
            if let Some(value) = self.decode_record(&record)? {
                out.insert(record.key.clone(), value);
            }
        }
        Ok(out)
    }

    fn decode_record(&self, record: &CachedRecord) -> SyncResult<Option<Value>> {
        if record.encrypted {
            match self.cipher()?.decrypt(&record.payload) {
                Ok(value) => Ok(Some(value)),
                Err(e) => {
                    tracing::warn!(
                        "failed to decrypt cached record '{}', reporting absent: {}",
                        record.composite_key,
                        e
                    );
                    Ok(None)
                }
            }
        } else {
            Ok(Some(serde_json::from_slice(&record.payload)?))
        }
    }

    /// Composite keys of records synced at or after `since_ms`, via the
    /// timestamp index, oldest first.
    pub fn keys_synced_since(&self, since_ms: u64) -> SyncResult<Vec<String>> {
        let db = self.db.read().unwrap();
        let meta_cf = cf(&db, META_CF)?;
        let start = format!("ts:{:020}", since_ms);
        let iter = db.iterator_cf(
            meta_cf,
            IteratorMode::From(start.as_bytes(), Direction::Forward),
        );

        let mut out = Vec::new();
        for item in iter {
            let (key, _) = item.map_err(|e| SyncError::Storage(e.into()))?;
            if !key.starts_with(b"ts:") {
                break;
            }
            let key_str = String::from_utf8(key.to_vec())
                .map_err(|_| SyncError::Storage("non-utf8 index key".to_string()))?;
            // ts:{20 digit timestamp}:{composite}
            if let Some(composite) = key_str.get(24..) {
                out.push(composite.to_string());
            }
        }
        Ok(out)
    }

    /// Empty every partition and publish `DataCleared`.
    pub fn clear_all(&self) -> SyncResult<()> {
        {
            let db = self.db.write().unwrap();
            let mut batch = WriteBatch::default();
            for name in ALL_CFS {
                let handle = cf(&db, name)?;
                for item in db.iterator_cf(handle, IteratorMode::Start) {
                    let (key, _) = item.map_err(|e| SyncError::Storage(e.into()))?;
                    batch.delete_cf(handle, key);
                }
            }
            db.write(batch)
                .map_err(|e| SyncError::Storage(format!("failed to clear store: {}", e)))?;
        }

        // The settings partition held the encryption key; forget the cached
        // cipher so the next encrypted write generates a fresh one.
        *self.cipher.write().unwrap() = None;

        tracing::info!("Local store cleared");
        self.events.publish(SyncEvent::DataCleared);
        Ok(())
    }

    // ==================== Settings ====================

    pub fn get_setting(&self, key: &str) -> SyncResult<Option<Vec<u8>>> {
        let db = self.db.read().unwrap();
        let settings_cf = cf(&db, SETTINGS_CF)?;
        Ok(db.get_cf(settings_cf, key.as_bytes())?)
    }

    pub fn put_setting(&self, key: &str, value: &[u8]) -> SyncResult<()> {
        let db = self.db.write().unwrap();
        let settings_cf = cf(&db, SETTINGS_CF)?;
        db.put_cf(settings_cf, key.as_bytes(), value)
            .map_err(|e| SyncError::Storage(format!("failed to write setting '{}': {}", key, e)))
    }

    // ==================== Request queue persistence ====================

    /// Assign the next monotonic id and persist the request, atomically with
    /// the counter update.
    pub(crate) fn append_request(&self, mut request: QueuedRequest) -> SyncResult<QueuedRequest> {
        let db = self.db.write().unwrap();
        let meta_cf = cf(&db, META_CF)?;
        let requests_cf = cf(&db, REQUESTS_CF)?;

        let next_id = match db.get_cf(meta_cf, REQUEST_SEQ_KEY)? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| SyncError::Storage("corrupt request id counter".to_string()))?;
                u64::from_be_bytes(raw) + 1
            }
            None => 1,
        };
        request.id = next_id;

        let mut batch = WriteBatch::default();
        batch.put_cf(meta_cf, REQUEST_SEQ_KEY, next_id.to_be_bytes());
        batch.put_cf(
            requests_cf,
            request_key(next_id),
            serde_json::to_vec(&request)?,
        );
        db.write(batch)
            .map_err(|e| SyncError::Storage(format!("failed to enqueue request: {}", e)))?;

        Ok(request)
    }

    /// Pending requests in enqueue order.
    pub(crate) fn list_requests(&self) -> SyncResult<Vec<QueuedRequest>> {
        self.scan_all(REQUESTS_CF)
    }

    pub(crate) fn rewrite_request(&self, request: &QueuedRequest) -> SyncResult<()> {
        let db = self.db.write().unwrap();
        let requests_cf = cf(&db, REQUESTS_CF)?;
        db.put_cf(
            requests_cf,
            request_key(request.id),
            serde_json::to_vec(request)?,
        )
        .map_err(|e| SyncError::Storage(format!("failed to rewrite request {}: {}", request.id, e)))
    }

    pub(crate) fn delete_request(&self, id: u64) -> SyncResult<()> {
        let db = self.db.write().unwrap();
        let requests_cf = cf(&db, REQUESTS_CF)?;
        db.delete_cf(requests_cf, request_key(id))
            .map_err(|e| SyncError::Storage(format!("failed to delete request {}: {}", id, e)))
    }

    /// Move an exhausted request out of the queue and into the dead-letter
    /// partition in one transaction.
    pub(crate) fn dead_letter_request(&self, dead: &DeadRequest) -> SyncResult<()> {
        let db = self.db.write().unwrap();
        let requests_cf = cf(&db, REQUESTS_CF)?;
        let dead_cf = cf(&db, DEAD_LETTER_CF)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(requests_cf, request_key(dead.request.id));
        batch.put_cf(dead_cf, request_key(dead.request.id), serde_json::to_vec(dead)?);
        db.write(batch).map_err(|e| {
            SyncError::Storage(format!(
                "failed to dead-letter request {}: {}",
                dead.request.id, e
            ))
        })
    }

    pub(crate) fn list_dead_letters(&self) -> SyncResult<Vec<DeadRequest>> {
        self.scan_all(DEAD_LETTER_CF)
    }

    // ==================== Conflicts ====================

    /// Persist a conflict, overwriting any pending conflict for the same key.
    pub(crate) fn put_conflict(&self, conflict: &Conflict) -> SyncResult<()> {
        Self::check_module_name(&conflict.module)?;
        let db = self.db.write().unwrap();
        let conflicts_cf = cf(&db, CONFLICTS_CF)?;
        db.put_cf(
            conflicts_cf,
            conflict.key.as_bytes(),
            serde_json::to_vec(conflict)?,
        )
        .map_err(|e| {
            SyncError::Storage(format!("failed to persist conflict '{}': {}", conflict.key, e))
        })
    }

    pub fn get_conflict(&self, composite_key: &str) -> SyncResult<Option<Conflict>> {
        let db = self.db.read().unwrap();
        let conflicts_cf = cf(&db, CONFLICTS_CF)?;
        match db.get_cf(conflicts_cf, composite_key.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub(crate) fn list_conflicts(&self) -> SyncResult<Vec<Conflict>> {
        self.scan_all(CONFLICTS_CF)
    }

    /// Delete the conflict and write the resolved value into the data
    /// partition in a single transaction, so an interruption can never leave
    /// the conflict gone but the data unwritten (or vice versa).
    ///
    /// A record stored encrypted stays encrypted through resolution.
    pub(crate) fn resolve_conflict_record(
        &self,
        composite_key: &str,
        resolved: &Value,
    ) -> SyncResult<CachedRecord> {
        let (module, key) = composite_key
            .split_once(':')
            .ok_or_else(|| SyncError::Internal(format!("malformed composite key '{}'", composite_key)))?;

        // Same ordering as store_data: the cipher may need the settings
        // partition, so encrypt before taking the db lock.
        let encrypted = self
            .get_record(module, key)?
            .map(|prev| prev.encrypted)
            .unwrap_or(false);
        let payload = if encrypted {
            self.cipher()?.encrypt(resolved)?
        } else {
            serde_json::to_vec(resolved)?
        };

        let db = self.db.write().unwrap();
        let conflicts_cf = cf(&db, CONFLICTS_CF)?;

        if db.get_cf(conflicts_cf, composite_key.as_bytes())?.is_none() {
            return Err(SyncError::ConflictNotFound(composite_key.to_string()));
        }

        let mut batch = WriteBatch::default();
        batch.delete_cf(conflicts_cf, composite_key.as_bytes());
        let record = Self::stage_record(&db, &mut batch, module, key, payload, encrypted)?;
        db.write(batch).map_err(|e| {
            SyncError::Storage(format!("failed to resolve conflict '{}': {}", composite_key, e))
        })?;

        Ok(record)
    }

    // ==================== Scans ====================

    fn scan_all<T: DeserializeOwned>(&self, cf_name: &str) -> SyncResult<Vec<T>> {
        let db = self.db.read().unwrap();
        let handle = cf(&db, cf_name)?;
        let mut out = Vec::new();
        for item in db.iterator_cf(handle, IteratorMode::Start) {
            let (key, value) = item.map_err(|e| SyncError::Storage(e.into()))?;
            match serde_json::from_slice(&value) {
                Ok(parsed) => out.push(parsed),
                Err(e) => tracing::warn!(
                    "skipping corrupt entry in '{}' partition ({:?}): {}",
                    cf_name,
                    String::from_utf8_lossy(&key),
                    e
                ),
            }
        }
        Ok(out)
    }

    fn scan_prefix<T: DeserializeOwned>(&self, cf_name: &str, prefix: &str) -> SyncResult<Vec<T>> {
        let db = self.db.read().unwrap();
        let handle = cf(&db, cf_name)?;
        let iter = db.iterator_cf(
            handle,
            IteratorMode::From(prefix.as_bytes(), Direction::Forward),
        );

        let mut out = Vec::new();
        for item in iter {
            let (key, value) = item.map_err(|e| SyncError::Storage(e.into()))?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            match serde_json::from_slice(&value) {
                Ok(parsed) => out.push(parsed),
                Err(e) => tracing::warn!(
                    "skipping corrupt entry in '{}' partition ({:?}): {}",
                    cf_name,
                    String::from_utf8_lossy(&key),
                    e
                ),
            }
        }
        Ok(out)
    }
}
