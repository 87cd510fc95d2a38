//! Version-metadata documents (schema `2.0.0`).
//!
//! The same document serves `metadata-export`/`metadata-import` on stdout
//! and files, and the per-backup metadata object every backup writes to its
//! storage.  Block order is by index ascending; the index itself is implicit
//! from position.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::info;

use benji_common::{
    format_timestamp, Block, BlockUid, Checksum, Version, VersionStatus, VersionUid,
    METADATA_VERSION,
};

use crate::{parse_timestamp, MetaError, MetaStore, VersionCounters};

#[derive(Debug, Serialize, Deserialize)]
pub struct VersionDocument {
    pub metadata_version: String,
    pub versions: Vec<VersionRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VersionRecord {
    pub uid: VersionUid,
    pub date: String,
    pub volume: String,
    pub snapshot: String,
    pub size: u64,
    pub block_size: u32,
    pub storage: String,
    pub status: VersionStatus,
    pub protected: bool,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub bytes_deduplicated: u64,
    pub bytes_sparse: u64,
    pub duration: u64,
    pub labels: BTreeMap<String, String>,
    pub blocks: Vec<BlockRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BlockRecord {
    pub uid: Option<BlockUidRecord>,
    pub size: u32,
    pub valid: bool,
    /// Hex digest; `null` together with `uid` for sparse blocks.
    pub checksum: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy)]
pub struct BlockUidRecord {
    pub left: u64,
    pub right: u64,
}

/// Serialize one version (blocks streamed from the store).
pub fn export_version(store: &MetaStore, uid: &VersionUid) -> Result<VersionRecord, MetaError> {
    let version = store.version(uid)?;
    let mut blocks = Vec::with_capacity(version.block_count() as usize);
    for block in store.stream_blocks(uid) {
        let block = block?;
        blocks.push(BlockRecord {
            uid: block.uid.map(|u| BlockUidRecord {
                left: u.left,
                right: u.right,
            }),
            size: block.size,
            valid: block.valid,
            checksum: block.checksum.as_ref().map(Checksum::to_hex),
        });
    }
    Ok(VersionRecord {
        uid: version.uid,
        date: format_timestamp(&version.date),
        volume: version.volume,
        snapshot: version.snapshot,
        size: version.size,
        block_size: version.block_size,
        storage: version.storage,
        status: version.status,
        protected: version.protected,
        bytes_read: version.bytes_read,
        bytes_written: version.bytes_written,
        bytes_deduplicated: version.bytes_deduplicated,
        bytes_sparse: version.bytes_sparse,
        duration: version.duration,
        labels: version.labels,
        blocks,
    })
}

pub fn export_versions(
    store: &MetaStore,
    uids: &[VersionUid],
) -> Result<VersionDocument, MetaError> {
    let versions = uids
        .iter()
        .map(|uid| export_version(store, uid))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(VersionDocument {
        metadata_version: METADATA_VERSION.to_string(),
        versions,
    })
}

/// Import every version of a document.  Fails without touching anything if
/// any contained uid already exists.
pub fn import_document(store: &MetaStore, document: &VersionDocument) -> Result<Vec<VersionUid>, MetaError> {
    if document.metadata_version != METADATA_VERSION {
        return Err(MetaError::malformed(format!(
            "unsupported metadata_version {:?} (expected {METADATA_VERSION:?})",
            document.metadata_version
        )));
    }

    for record in &document.versions {
        if store.version(&record.uid).is_ok() {
            return Err(MetaError::AlreadyExists {
                uid: record.uid.as_str().to_string(),
            });
        }
    }

    let mut imported = Vec::with_capacity(document.versions.len());
    for record in &document.versions {
        import_record(store, record)?;
        imported.push(record.uid.clone());
    }
    Ok(imported)
}

fn import_record(store: &MetaStore, record: &VersionRecord) -> Result<(), MetaError> {
    let date = parse_timestamp(&record.date)?;
    store.insert_version_row(&Version {
        uid: record.uid.clone(),
        date,
        volume: record.volume.clone(),
        snapshot: record.snapshot.clone(),
        size: record.size,
        block_size: record.block_size,
        storage: record.storage.clone(),
        status: record.status,
        protected: record.protected,
        labels: record.labels.clone(),
        bytes_read: record.bytes_read,
        bytes_written: record.bytes_written,
        bytes_deduplicated: record.bytes_deduplicated,
        bytes_sparse: record.bytes_sparse,
        duration: record.duration,
    })?;

    let mut batch = Vec::with_capacity(1024);
    for (idx, block) in record.blocks.iter().enumerate() {
        let uid = block.uid.map(|u| BlockUid::new(u.left, u.right));
        let checksum = match &block.checksum {
            Some(text) => Some(
                Checksum::from_hex(text)
                    .map_err(|_| MetaError::malformed(format!("bad checksum {text:?}")))?,
            ),
            None => None,
        };
        if uid.is_some() != checksum.is_some() {
            return Err(MetaError::malformed(
                "block with checksum but no uid (or vice versa)",
            ));
        }
        batch.push(Block {
            idx: idx as u64,
            uid,
            checksum,
            size: block.size,
            valid: block.valid,
        });
        if batch.len() == 1024 {
            store.insert_blocks(&record.uid, &batch)?;
            batch.clear();
        }
    }
    if !batch.is_empty() {
        store.insert_blocks(&record.uid, &batch)?;
    }

    info!(uid = %record.uid, blocks = record.blocks.len(), "version imported");
    Ok(())
}

impl MetaStore {
    /// Insert a fully specified version row (import path).  The generator
    /// sequence is advanced past numeric uids so future backups cannot
    /// collide.
    pub(crate) fn insert_version_row(&self, version: &Version) -> Result<(), MetaError> {
        let counters = VersionCounters {
            bytes_read: version.bytes_read,
            bytes_written: version.bytes_written,
            bytes_deduplicated: version.bytes_deduplicated,
            bytes_sparse: version.bytes_sparse,
            duration: version.duration,
        };
        self.insert_version_row_impl(version, counters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NewVersion;

    fn seeded_store() -> (MetaStore, VersionUid) {
        let store = MetaStore::open_memory().unwrap();
        let (version, seq) = store
            .create_version(NewVersion {
                uid: None,
                volume: "vm1".to_string(),
                snapshot: "snap1".to_string(),
                size: 8192,
                block_size: 4096,
                storage: "local".to_string(),
                labels: BTreeMap::from([("env".to_string(), "prod".to_string())]),
            })
            .unwrap();
        store
            .insert_blocks(
                &version.uid,
                &[
                    Block {
                        idx: 0,
                        uid: Some(BlockUid::new(seq, 1)),
                        checksum: Some(Checksum::from_bytes(vec![0xaa; 32])),
                        size: 4096,
                        valid: true,
                    },
                    Block::sparse(1, 4096),
                ],
            )
            .unwrap();
        store.finish_version(&version.uid, VersionCounters::default()).unwrap();
        (store, version.uid)
    }

    #[test]
    fn export_emits_schema_2_0_0_shape() {
        let (store, uid) = seeded_store();
        let document = export_versions(&store, &[uid]).unwrap();
        assert_eq!(document.metadata_version, "2.0.0");

        let json = serde_json::to_value(&document).unwrap();
        let version = &json["versions"][0];
        assert!(version["date"].as_str().unwrap().ends_with('Z'));
        assert_eq!(version["status"], "valid");
        assert_eq!(version["labels"]["env"], "prod");

        let blocks = version["blocks"].as_array().unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0]["uid"]["right"], 1);
        assert!(blocks[1]["uid"].is_null());
        assert!(blocks[1]["checksum"].is_null());
    }

    #[test]
    fn import_roundtrip_into_fresh_store() {
        let (store, uid) = seeded_store();
        let document = export_versions(&store, &[uid.clone()]).unwrap();
        let json = serde_json::to_string(&document).unwrap();

        let fresh = MetaStore::open_memory().unwrap();
        let parsed: VersionDocument = serde_json::from_str(&json).unwrap();
        let imported = import_document(&fresh, &parsed).unwrap();
        assert_eq!(imported, vec![uid.clone()]);

        let version = fresh.version(&uid).unwrap();
        assert_eq!(version.snapshot, "snap1");
        assert_eq!(version.status, VersionStatus::Valid);
        let blocks: Vec<Block> = fresh.stream_blocks(&uid).collect::<Result<_, _>>().unwrap();
        assert_eq!(blocks.len(), 2);
        assert!(blocks[1].is_sparse());

        // Re-import conflicts.
        assert!(matches!(
            import_document(&fresh, &parsed),
            Err(MetaError::AlreadyExists { .. })
        ));
    }

    #[test]
    fn import_rejects_wrong_schema_version() {
        let fresh = MetaStore::open_memory().unwrap();
        let document = VersionDocument {
            metadata_version: "1.0.0".to_string(),
            versions: Vec::new(),
        };
        assert!(import_document(&fresh, &document).is_err());
    }
}
