//! The block engine: backup/restore pipelines, scrub, GC, retention.
//!
//! [`Engine`] wires the configured modules together — metadata store,
//! storages with their transform chains, source adapters, locks — and
//! exposes one method per operation of the command surface.  Configuration
//! is loaded once and carried immutably; nothing here is a global.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::warn;

use benji_common::{Block, Config, HashFunction, Version, VersionUid};
use benji_filter::FilterExpr;
use benji_meta::locks::LockManager;
use benji_meta::MetaStore;
use benji_storage::{Storage, StorageError, StorageRegistry};
use benji_transform::TransformRegistry;

pub mod backup;
pub mod cleanup;
pub mod cow;
pub mod dedup;
pub mod enforce;
pub mod metadata;
pub mod restore;
pub mod scrub;

mod error;

pub use backup::BackupRequest;
pub use cleanup::{CleanupOptions, CleanupReport};
pub use enforce::EnforceReport;
pub use error::EngineError;
pub use restore::{RestoreReport, RestoreRequest};
pub use scrub::{ScrubMode, ScrubReport};

/// Block rows committed per metadata transaction.
pub(crate) const BLOCK_COMMIT_BATCH: usize = 4096;

pub struct Engine {
    config: Config,
    store: MetaStore,
    storages: StorageRegistry,
    locks: LockManager,
    hash: HashFunction,
}

impl Engine {
    /// Wire up a ready-to-use engine from configuration.  Fails fast on an
    /// uninitialized database or on immutable-setting drift (hash function,
    /// KDF parameters).
    pub fn open(config: Config) -> Result<Self, EngineError> {
        let store = MetaStore::open(&config.database_engine)?;
        store.check_ready()?;

        let transforms = Arc::new(TransformRegistry::from_config(&config)?);
        let storages = StorageRegistry::from_config(&config, Arc::clone(&transforms))?;

        let hash = config.hash();
        store.pin_setting("hash_function", &hash.spec())?;
        for entry in &config.transforms {
            if let Some(fingerprint) = transforms
                .get(&entry.name)
                .and_then(|transform| transform.kdf_fingerprint())
            {
                store.pin_setting(&format!("transform.{}.kdf", entry.name), &fingerprint)?;
            }
        }

        let locks = LockManager::new(store.clone(), &config.process_name);
        Ok(Self {
            config,
            store,
            storages,
            locks,
            hash,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn meta(&self) -> &MetaStore {
        &self.store
    }

    pub fn hash(&self) -> HashFunction {
        self.hash
    }

    pub(crate) fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn storage(&self, name: &str) -> Result<Arc<Storage>, EngineError> {
        Ok(self.storages.get(name)?)
    }

    pub fn storage_names(&self) -> Vec<String> {
        self.storages.names()
    }

    pub fn default_storage_name(&self) -> &str {
        self.storages.default_storage_name()
    }

    /// Versions matching an optional filter expression.
    pub fn ls(&self, filter: Option<&str>) -> Result<Vec<Version>, EngineError> {
        let versions = self.store.list_versions()?;
        match filter {
            None => Ok(versions),
            Some(text) => {
                let filter = FilterExpr::parse(text)?;
                let mut matching = Vec::new();
                for version in versions {
                    if filter.matches(&version)? {
                        matching.push(version);
                    }
                }
                Ok(matching)
            }
        }
    }

    pub fn version_info(&self, uid: &VersionUid) -> Result<(Version, u64), EngineError> {
        let version = self.store.version(uid)?;
        let blocks = self.store.block_count(uid)?;
        Ok((version, blocks))
    }

    pub fn protect(&self, uid: &VersionUid, protected: bool) -> Result<(), EngineError> {
        Ok(self.store.set_protected(uid, protected)?)
    }

    /// Apply label edits: `name=value` sets, a trailing `-` removes.
    pub fn label(&self, uid: &VersionUid, edits: &[String]) -> Result<(), EngineError> {
        for edit in edits {
            if let Some(name) = edit.strip_suffix('-') {
                self.store.remove_label(uid, name)?;
            } else {
                let (name, value) = edit.split_once('=').unwrap_or((edit.as_str(), ""));
                self.store.set_label(uid, name, value)?;
            }
        }
        Ok(())
    }

    /// Object count and byte total per storage.
    pub fn storage_stats(&self, name: &str) -> Result<(u64, u64), EngineError> {
        Ok(self.storages.get(name)?.stats()?)
    }

    /// Per-version byte attribution: bytes only this version references vs
    /// bytes shared with at least one other version, plus sparse bytes.
    pub fn storage_usage(
        &self,
        filter: Option<&str>,
    ) -> Result<Vec<(VersionUid, UsageReport)>, EngineError> {
        let versions = self.ls(filter)?;
        let mut reports = Vec::with_capacity(versions.len());
        for version in versions {
            let mut usage = UsageReport::default();
            let mut seen: HashSet<benji_common::BlockUid> = HashSet::new();
            for block in self.store.stream_blocks(&version.uid) {
                let block = block?;
                match block.uid {
                    None => usage.sparse += block.size as u64,
                    Some(uid) => {
                        if !seen.insert(uid) {
                            continue;
                        }
                        if self.store.block_version_count(&uid)? > 1 {
                            usage.shared += block.size as u64;
                        } else {
                            usage.exclusive += block.size as u64;
                        }
                    }
                }
            }
            reports.push((version.uid.clone(), usage));
        }
        Ok(reports)
    }

    /// Fetch and verify one block of a version (the NBD read path shares
    /// this with restore).  A checksum mismatch marks the block and every
    /// referencing version invalid and surfaces as a storage-integrity
    /// error.
    pub fn read_block_verified(
        &self,
        version: &Version,
        block: &Block,
    ) -> Result<Vec<u8>, EngineError> {
        let Some(uid) = block.uid else {
            return Ok(vec![0u8; block.size as usize]);
        };
        let storage = self.storages.get(&version.storage)?;
        let data = match storage.read_block(&uid) {
            Ok(data) => data,
            Err(err @ StorageError::Integrity { .. }) => {
                let affected = self.store.mark_block_invalid(&uid)?;
                warn!(block = %uid, versions = affected.len(), error = %err,
                      "block failed integrity, versions marked invalid");
                return Err(err.into());
            }
            Err(err) => return Err(err.into()),
        };

        let checksum = self.hash.hash(&data);
        match &block.checksum {
            Some(recorded) if *recorded == checksum => Ok(data),
            _ => {
                let affected = self.store.mark_block_invalid(&uid)?;
                warn!(block = %uid, versions = affected.len(),
                      "block checksum mismatch, versions marked invalid");
                Err(StorageError::integrity(
                    uid.object_key(),
                    benji_storage::IntegrityKind::ChecksumMismatch,
                )
                .into())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct UsageReport {
    pub exclusive: u64,
    pub shared: u64,
    pub sparse: u64,
}
