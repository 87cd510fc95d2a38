//! Object storage for block data and metadata sidecars.
//!
//! A [`Storage`] couples a dumb byte backend with everything the data plane
//! needs per object: the active transform chain on writes, sidecar
//! verification on reads, per-direction token buckets, bounded retries and
//! an optional sharded read cache.  Two objects exist per block: the data
//! object and its sidecar, addressed by [`BlockUid`] key derivation.
//!
//! Only the `file` backend ships in-tree; `s3` and `b2` are recognized
//! module names served by out-of-tree adapters.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use benji_common::{BlockUid, Config, ConfigError, VersionUid};
use benji_transform::{TransformChain, TransformRegistry};

pub mod cache;
pub mod file;
pub mod ratelimit;
pub mod sidecar;

mod error;

pub use error::{IntegrityKind, StorageError};
pub use sidecar::{Sidecar, SidecarHmac};

use cache::{ReadCache, ReadCacheConfig};
use ratelimit::TokenBucket;

const READ_ATTEMPTS: u32 = 3;
const WRITE_ATTEMPTS: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_millis(100);

/// Raw byte backend: durable put/get/delete/list on opaque keys.
pub trait Backend: Send + Sync {
    fn put(&self, key: &str, data: &[u8]) -> Result<(), std::io::Error>;
    fn get(&self, key: &str) -> Result<Vec<u8>, std::io::Error>;
    fn size(&self, key: &str) -> Result<u64, std::io::Error>;
    fn delete(&self, key: &str) -> Result<(), std::io::Error>;
    /// Keys and sizes under a prefix, sorted.
    fn list(&self, prefix: &str) -> Result<Vec<(String, u64)>, std::io::Error>;
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct StorageInstanceConfig {
    path: std::path::PathBuf,
    #[serde(default = "default_simultaneous")]
    simultaneous_reads: usize,
    #[serde(default = "default_simultaneous")]
    simultaneous_writes: usize,
    #[serde(default = "default_removals")]
    simultaneous_removals: usize,
    /// Bytes per second, 0 = unlimited.
    #[serde(default)]
    bandwidth_read: u64,
    #[serde(default)]
    bandwidth_write: u64,
    /// Transform instance names applied in order on write.
    #[serde(default)]
    active_transforms: Vec<String>,
    /// Read-after-write verification.  Development only.
    #[serde(default)]
    consistency_check_writes: bool,
    #[serde(default)]
    hmac: Option<serde_yaml::Value>,
    #[serde(default)]
    read_cache: Option<ReadCacheConfig>,
}

fn default_simultaneous() -> usize {
    3
}

fn default_removals() -> usize {
    5
}

/// Outcome of storing one block.
#[derive(Debug, Clone, Copy)]
pub struct SaveReport {
    pub stored_size: u64,
}

pub struct Storage {
    name: String,
    backend: Box<dyn Backend>,
    transforms: Arc<TransformRegistry>,
    active_chain: TransformChain,
    hmac: Option<SidecarHmac>,
    read_limiter: Option<TokenBucket>,
    write_limiter: Option<TokenBucket>,
    read_cache: Option<ReadCache>,
    consistency_check_writes: bool,
    simultaneous_reads: usize,
    simultaneous_writes: usize,
    simultaneous_removals: usize,
}

impl Storage {
    pub fn new(
        name: &str,
        backend: Box<dyn Backend>,
        transforms: Arc<TransformRegistry>,
        active_transforms: &[String],
    ) -> Result<Self, StorageError> {
        let active_chain = transforms.chain(active_transforms)?;
        Ok(Self {
            name: name.to_string(),
            backend,
            transforms,
            active_chain,
            hmac: None,
            read_limiter: None,
            write_limiter: None,
            read_cache: None,
            consistency_check_writes: false,
            simultaneous_reads: default_simultaneous(),
            simultaneous_writes: default_simultaneous(),
            simultaneous_removals: default_removals(),
        })
    }

    fn from_instance_config(
        name: &str,
        config: StorageInstanceConfig,
        transforms: Arc<TransformRegistry>,
    ) -> Result<Self, StorageError> {
        let backend = file::FileBackend::open(&file::FileBackendConfig {
            path: config.path.clone(),
        })?;
        let mut storage = Self::new(name, Box::new(backend), transforms, &config.active_transforms)?;

        if let Some(hmac_config) = &config.hmac {
            storage.hmac = Some(SidecarHmac::from_config(hmac_config)?);
        }
        storage.read_limiter = TokenBucket::new(config.bandwidth_read);
        storage.write_limiter = TokenBucket::new(config.bandwidth_write);
        if let Some(cache_config) = &config.read_cache {
            storage.read_cache =
                Some(ReadCache::open(cache_config).map_err(|source| StorageError::Backend {
                    op: "open read cache",
                    key: cache_config.directory.display().to_string(),
                    attempts: 1,
                    source,
                })?);
        }
        storage.consistency_check_writes = config.consistency_check_writes;
        storage.simultaneous_reads = config.simultaneous_reads;
        storage.simultaneous_writes = config.simultaneous_writes;
        storage.simultaneous_removals = config.simultaneous_removals;
        Ok(storage)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn simultaneous_reads(&self) -> usize {
        self.simultaneous_reads
    }

    pub fn simultaneous_writes(&self) -> usize {
        self.simultaneous_writes
    }

    pub fn simultaneous_removals(&self) -> usize {
        self.simultaneous_removals
    }

    /// Store one block: apply the active transform chain, write the data
    /// object and its signed sidecar.
    #[instrument(skip(self, plaintext), fields(storage = %self.name, uid = %uid))]
    pub fn save_block(&self, uid: &BlockUid, plaintext: &[u8]) -> Result<SaveReport, StorageError> {
        self.save_object(&uid.object_key(), &uid.sidecar_key(), plaintext)
    }

    /// Read one block back to plaintext.  Verifies the sidecar HMAC and the
    /// stored size before running the recorded inverse chain.
    #[instrument(skip(self), fields(storage = %self.name, uid = %uid))]
    pub fn read_block(&self, uid: &BlockUid) -> Result<Vec<u8>, StorageError> {
        self.read_object(&uid.object_key(), &uid.sidecar_key())
    }

    /// Light existence/metadata check: both objects present, sidecar HMAC
    /// valid, stored size matches.  Never fetches block data.
    pub fn check_block(&self, uid: &BlockUid) -> Result<Sidecar, StorageError> {
        let data_key = uid.object_key();
        let sidecar = self.read_sidecar(uid)?;

        let stored = match self.backend.size(&data_key) {
            Ok(size) => size,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::integrity(&data_key, IntegrityKind::MissingObject))
            }
            Err(source) => {
                return Err(StorageError::Backend {
                    op: "stat",
                    key: data_key,
                    attempts: 1,
                    source,
                })
            }
        };
        if stored != sidecar.stored_size {
            return Err(StorageError::integrity(&data_key, IntegrityKind::SizeMismatch));
        }
        Ok(sidecar)
    }

    /// Fetch and verify the sidecar alone.
    pub fn read_sidecar(&self, uid: &BlockUid) -> Result<Sidecar, StorageError> {
        let key = uid.sidecar_key();
        let bytes = match self.get_with_retries(&key) {
            Err(StorageError::NotFound { .. }) => {
                return Err(StorageError::integrity(&key, IntegrityKind::MissingSidecar))
            }
            other => other?,
        };
        let sidecar = Sidecar::from_bytes(&key, &bytes)?;
        if let Some(hmac) = &self.hmac {
            hmac.verify(&key, &sidecar)?;
        }
        Ok(sidecar)
    }

    /// Delete a block's data object and sidecar.
    pub fn delete_block(&self, uid: &BlockUid) -> Result<(), StorageError> {
        let data_key = uid.object_key();
        let sidecar_key = uid.sidecar_key();
        if let Some(cache) = &self.read_cache {
            cache.invalidate(&data_key);
        }
        self.with_retries("delete", &data_key, WRITE_ATTEMPTS, || {
            self.backend.delete(&data_key)
        })?;
        self.with_retries("delete", &sidecar_key, WRITE_ATTEMPTS, || {
            self.backend.delete(&sidecar_key)
        })?;
        Ok(())
    }

    /// Every block uid present on the storage, derived from the data-object
    /// keys under the block prefix.
    pub fn list_block_uids(&self) -> Result<Vec<BlockUid>, StorageError> {
        let entries = self.list_with_retries("blocks/")?;
        Ok(entries
            .iter()
            .filter_map(|(key, _)| parse_block_key(key))
            .collect())
    }

    /// Object count and byte total, for `storage-stats`.
    pub fn stats(&self) -> Result<(u64, u64), StorageError> {
        let entries = self.list_with_retries("")?;
        let count = entries.len() as u64;
        let bytes = entries.iter().map(|(_, size)| size).sum();
        Ok((count, bytes))
    }

    // Version-metadata objects share the block machinery (same transforms,
    // same sidecar discipline) under their own prefix.

    pub fn save_version_metadata(
        &self,
        uid: &VersionUid,
        document: &[u8],
    ) -> Result<SaveReport, StorageError> {
        let key = version_key(uid);
        let sidecar_key = format!("{key}.meta");
        self.save_object(&key, &sidecar_key, document)
    }

    pub fn read_version_metadata(&self, uid: &VersionUid) -> Result<Vec<u8>, StorageError> {
        let key = version_key(uid);
        let sidecar_key = format!("{key}.meta");
        self.read_object(&key, &sidecar_key)
    }

    pub fn delete_version_metadata(&self, uid: &VersionUid) -> Result<(), StorageError> {
        let key = version_key(uid);
        self.with_retries("delete", &key, WRITE_ATTEMPTS, || self.backend.delete(&key))?;
        let sidecar_key = format!("{key}.meta");
        self.with_retries("delete", &sidecar_key, WRITE_ATTEMPTS, || {
            self.backend.delete(&sidecar_key)
        })
    }

    pub fn list_version_metadata(&self) -> Result<Vec<VersionUid>, StorageError> {
        let entries = self.list_with_retries("versions/")?;
        Ok(entries
            .iter()
            .filter_map(|(key, _)| {
                let name = key.strip_prefix("versions/")?.strip_suffix(".json")?;
                Some(VersionUid::new(name))
            })
            .collect())
    }

    fn save_object(
        &self,
        data_key: &str,
        sidecar_key: &str,
        plaintext: &[u8],
    ) -> Result<SaveReport, StorageError> {
        let (stored, records) = self.active_chain.forward(plaintext)?;

        let mut sidecar = Sidecar::new(
            data_key.to_string(),
            records,
            plaintext.len() as u64,
            stored.len() as u64,
            Utc::now(),
        );
        if let Some(hmac) = &self.hmac {
            hmac.sign(&mut sidecar);
        }

        if let Some(limiter) = &self.write_limiter {
            limiter.take(stored.len() as u64);
        }
        self.with_retries("put", data_key, WRITE_ATTEMPTS, || {
            self.backend.put(data_key, &stored)
        })?;
        self.with_retries("put", sidecar_key, WRITE_ATTEMPTS, || {
            self.backend.put(sidecar_key, &sidecar.to_bytes())
        })?;

        if self.consistency_check_writes {
            let reread = self.get_with_retries(data_key)?;
            if reread != stored {
                return Err(StorageError::ConsistencyCheck {
                    key: data_key.to_string(),
                });
            }
        }

        if let Some(cache) = &self.read_cache {
            cache.put(data_key, &stored);
        }

        debug!(stored_size = stored.len(), "object stored");
        Ok(SaveReport {
            stored_size: stored.len() as u64,
        })
    }

    fn read_object(&self, data_key: &str, sidecar_key: &str) -> Result<Vec<u8>, StorageError> {
        let sidecar_bytes = match self.get_with_retries(sidecar_key) {
            Err(StorageError::NotFound { .. }) => {
                return Err(StorageError::integrity(sidecar_key, IntegrityKind::MissingSidecar))
            }
            other => other?,
        };
        let sidecar = Sidecar::from_bytes(sidecar_key, &sidecar_bytes)?;
        if let Some(hmac) = &self.hmac {
            hmac.verify(sidecar_key, &sidecar)?;
        }

        let stored = match self.cached_get(data_key) {
            Err(StorageError::NotFound { .. }) => {
                return Err(StorageError::integrity(data_key, IntegrityKind::MissingObject))
            }
            other => other?,
        };
        if stored.len() as u64 != sidecar.stored_size {
            return Err(StorageError::integrity(data_key, IntegrityKind::SizeMismatch));
        }

        let plaintext = self
            .transforms
            .revert(&stored, &sidecar.transforms)
            .map_err(|err| {
                warn!(key = data_key, error = %err, "inverse transform failed");
                StorageError::integrity(data_key, IntegrityKind::TransformFailed)
            })?;
        if plaintext.len() as u64 != sidecar.size {
            return Err(StorageError::integrity(data_key, IntegrityKind::SizeMismatch));
        }
        Ok(plaintext)
    }

    fn cached_get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        if let Some(cache) = &self.read_cache {
            if let Some(hit) = cache.get(key) {
                return Ok(hit);
            }
        }
        let data = self.get_with_retries(key)?;
        if let Some(cache) = &self.read_cache {
            cache.put(key, &data);
        }
        Ok(data)
    }

    fn get_with_retries(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        if let Some(limiter) = &self.read_limiter {
            if let Ok(size) = self.backend.size(key) {
                limiter.take(size);
            }
        }
        self.with_retries("get", key, READ_ATTEMPTS, || self.backend.get(key))
    }

    fn list_with_retries(&self, prefix: &str) -> Result<Vec<(String, u64)>, StorageError> {
        self.with_retries("list", prefix, READ_ATTEMPTS, || self.backend.list(prefix))
    }

    fn with_retries<T>(
        &self,
        op: &'static str,
        key: &str,
        budget: u32,
        mut call: impl FnMut() -> Result<T, std::io::Error>,
    ) -> Result<T, StorageError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match call() {
                Ok(value) => return Ok(value),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    return Err(StorageError::NotFound {
                        key: key.to_string(),
                    })
                }
                Err(source) if attempt >= budget => {
                    return Err(StorageError::Backend {
                        op,
                        key: key.to_string(),
                        attempts: attempt,
                        source,
                    })
                }
                Err(err) => {
                    let backoff = BACKOFF_BASE * 2u32.pow(attempt - 1);
                    warn!(op, key, attempt, error = %err, "storage operation failed, retrying");
                    std::thread::sleep(backoff);
                }
            }
        }
    }
}

fn version_key(uid: &VersionUid) -> String {
    format!("versions/{uid}.json")
}

fn parse_block_key(key: &str) -> Option<BlockUid> {
    if key.ends_with(".meta") || key.ends_with(".tmp") {
        return None;
    }
    let name = key.strip_prefix("blocks/")?.split('/').nth(1)?;
    let (left, right) = name.split_once('-')?;
    Some(BlockUid::new(
        u64::from_str_radix(left, 16).ok()?,
        u64::from_str_radix(right, 16).ok()?,
    ))
}

/// All configured storages, resolved by name.
pub struct StorageRegistry {
    map: HashMap<String, Arc<Storage>>,
    default_storage: String,
}

impl StorageRegistry {
    pub fn from_config(
        config: &Config,
        transforms: Arc<TransformRegistry>,
    ) -> Result<Self, StorageError> {
        let mut map = HashMap::new();
        for entry in &config.storages {
            match entry.module.as_str() {
                "file" => {
                    let instance: StorageInstanceConfig =
                        serde_yaml::from_value(entry.configuration.clone())
                            .map_err(ConfigError::from)?;
                    let storage =
                        Storage::from_instance_config(&entry.name, instance, transforms.clone())?;
                    map.insert(entry.name.clone(), Arc::new(storage));
                }
                "s3" | "b2" => {
                    return Err(StorageError::ModuleUnavailable {
                        module: entry.module.clone(),
                    })
                }
                other => {
                    return Err(StorageError::Config(ConfigError::UnknownModule {
                        kind: "storage",
                        name: entry.name.clone(),
                        module: other.to_string(),
                    }))
                }
            }
        }
        Ok(Self {
            map,
            default_storage: config.default_storage.clone(),
        })
    }

    pub fn get(&self, name: &str) -> Result<Arc<Storage>, StorageError> {
        self.map
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::UnknownStorage {
                name: name.to_string(),
            })
    }

    pub fn default_storage(&self) -> Result<Arc<Storage>, StorageError> {
        self.get(&self.default_storage)
    }

    pub fn default_storage_name(&self) -> &str {
        &self.default_storage
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.map.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use benji_transform::compression::ZstdTransform;
    use benji_transform::envelope::AesGcmTransform;

    fn test_registry() -> Arc<TransformRegistry> {
        let compress = ZstdTransform::new(
            "compress",
            &serde_yaml::from_str("level: 3").unwrap(),
        )
        .unwrap();
        let encrypt = AesGcmTransform::new(
            "encrypt",
            &serde_yaml::from_str(
                "masterKey: \"5555555555555555555555555555555555555555555555555555555555555555\"",
            )
            .unwrap(),
        )
        .unwrap();
        Arc::new(TransformRegistry::from_transforms(vec![
            Arc::new(compress),
            Arc::new(encrypt),
        ]))
    }

    fn storage_with_chain(dir: &std::path::Path, chain: &[&str]) -> Storage {
        let backend = file::FileBackend::open(&file::FileBackendConfig {
            path: dir.to_path_buf(),
        })
        .unwrap();
        let names: Vec<String> = chain.iter().map(|s| s.to_string()).collect();
        Storage::new("test", Box::new(backend), test_registry(), &names).unwrap()
    }

    #[test]
    fn block_roundtrip_with_transforms() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage_with_chain(dir.path(), &["compress", "encrypt"]);

        let uid = BlockUid::new(1, 1);
        let plaintext = b"block payload ".repeat(1000);
        let report = storage.save_block(&uid, &plaintext).unwrap();
        assert!(report.stored_size > 0);

        assert_eq!(storage.read_block(&uid).unwrap(), plaintext);

        let sidecar = storage.check_block(&uid).unwrap();
        assert_eq!(sidecar.size, plaintext.len() as u64);
        assert_eq!(sidecar.transforms.len(), 2);
    }

    #[test]
    fn missing_object_is_an_integrity_error() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage_with_chain(dir.path(), &[]);
        let uid = BlockUid::new(9, 9);
        assert!(matches!(
            storage.read_block(&uid),
            Err(StorageError::Integrity {
                kind: IntegrityKind::MissingSidecar,
                ..
            })
        ));
    }

    #[test]
    fn truncated_object_fails_the_size_check() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage_with_chain(dir.path(), &[]);
        let uid = BlockUid::new(2, 7);
        storage.save_block(&uid, &[0xabu8; 4096]).unwrap();

        // Corrupt the stored object behind the adapter's back.
        let path = dir.path().join(uid.object_key());
        std::fs::write(&path, b"short").unwrap();

        assert!(matches!(
            storage.read_block(&uid),
            Err(StorageError::Integrity {
                kind: IntegrityKind::SizeMismatch,
                ..
            })
        ));
        assert!(matches!(
            storage.check_block(&uid),
            Err(StorageError::Integrity {
                kind: IntegrityKind::SizeMismatch,
                ..
            })
        ));
    }

    #[test]
    fn delete_removes_both_objects() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage_with_chain(dir.path(), &[]);
        let uid = BlockUid::new(3, 1);
        storage.save_block(&uid, b"data").unwrap();
        assert_eq!(storage.list_block_uids().unwrap(), vec![uid]);

        storage.delete_block(&uid).unwrap();
        assert!(storage.list_block_uids().unwrap().is_empty());
        let (count, _) = storage.stats().unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn version_metadata_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage_with_chain(dir.path(), &["compress"]);
        let uid = VersionUid::new("V0000000001");
        let document = br#"{"metadata_version":"2.0.0","versions":[]}"#;

        storage.save_version_metadata(&uid, document).unwrap();
        assert_eq!(storage.read_version_metadata(&uid).unwrap(), document);
        assert_eq!(storage.list_version_metadata().unwrap(), vec![uid.clone()]);

        storage.delete_version_metadata(&uid).unwrap();
        assert!(storage.list_version_metadata().unwrap().is_empty());
    }

    #[test]
    fn block_key_parsing_roundtrip() {
        let uid = BlockUid::new(0x10, 0x20);
        assert_eq!(parse_block_key(&uid.object_key()), Some(uid));
        assert_eq!(parse_block_key(&uid.sidecar_key()), None);
        assert_eq!(parse_block_key("versions/V1.json"), None);
    }

    /// Backend that fails a fixed number of operations before recovering.
    struct FlakyBackend {
        inner: file::FileBackend,
        failures_left: std::sync::atomic::AtomicU32,
    }

    impl FlakyBackend {
        fn trip(&self) -> Result<(), std::io::Error> {
            use std::sync::atomic::Ordering;
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "transient backend failure",
                ));
            }
            Ok(())
        }
    }

    impl Backend for FlakyBackend {
        fn put(&self, key: &str, data: &[u8]) -> Result<(), std::io::Error> {
            self.trip()?;
            self.inner.put(key, data)
        }

        fn get(&self, key: &str) -> Result<Vec<u8>, std::io::Error> {
            self.trip()?;
            self.inner.get(key)
        }

        fn size(&self, key: &str) -> Result<u64, std::io::Error> {
            self.inner.size(key)
        }

        fn delete(&self, key: &str) -> Result<(), std::io::Error> {
            self.inner.delete(key)
        }

        fn list(&self, prefix: &str) -> Result<Vec<(String, u64)>, std::io::Error> {
            self.inner.list(prefix)
        }
    }

    #[tracing_test::traced_test]
    #[test]
    fn transient_backend_failures_are_retried() {
        let dir = tempfile::tempdir().unwrap();
        let inner = file::FileBackend::open(&file::FileBackendConfig {
            path: dir.path().to_path_buf(),
        })
        .unwrap();
        let backend = FlakyBackend {
            inner,
            failures_left: std::sync::atomic::AtomicU32::new(2),
        };
        let storage = Storage::new("flaky", Box::new(backend), test_registry(), &[]).unwrap();

        let uid = BlockUid::new(5, 5);
        storage.save_block(&uid, b"payload").unwrap();
        assert_eq!(storage.read_block(&uid).unwrap(), b"payload");
        assert!(logs_contain("storage operation failed, retrying"));
    }

    #[test]
    fn exhausted_retry_budget_surfaces_the_backend_error() {
        let dir = tempfile::tempdir().unwrap();
        let inner = file::FileBackend::open(&file::FileBackendConfig {
            path: dir.path().to_path_buf(),
        })
        .unwrap();
        let backend = FlakyBackend {
            inner,
            failures_left: std::sync::atomic::AtomicU32::new(100),
        };
        let storage = Storage::new("flaky", Box::new(backend), test_registry(), &[]).unwrap();

        assert!(matches!(
            storage.save_block(&BlockUid::new(6, 6), b"payload"),
            Err(StorageError::Backend { attempts: 3, .. })
        ));
    }
}
