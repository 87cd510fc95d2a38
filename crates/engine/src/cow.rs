//! Copy-on-write fixation.
//!
//! When a read-write NBD export disconnects, its dirtied blocks are turned
//! into a new version: untouched indices inherit the original block rows
//! (no new objects), dirtied indices run the standard hash → dedup →
//! transform → store path.  The result is protected and carries a
//! synthetic snapshot name, so retention never silently drops it.

use chrono::Utc;
use std::collections::BTreeSet;
use std::time::Instant;

use tracing::{info, instrument};

use benji_common::{Block, BlockUid, Version, VersionUid};
use benji_meta::locks::LockScope;
use benji_meta::{NewVersion, VersionCounters};

use crate::{Engine, EngineError, BLOCK_COMMIT_BATCH};

impl Engine {
    /// Build the fixated version for a finished COW session.
    ///
    /// `read_dirty` hands back the full current content of a dirtied block
    /// index (the caller owns the on-disk COW store).
    #[instrument(skip(self, dirty_indices, read_dirty), fields(original = %original_uid))]
    pub fn fixate_cow_version(
        &self,
        original_uid: &VersionUid,
        dirty_indices: &BTreeSet<u64>,
        read_dirty: &dyn Fn(u64) -> std::io::Result<Vec<u8>>,
    ) -> Result<Version, EngineError> {
        let started = Instant::now();
        let original = self.meta().version(original_uid)?;
        let snapshot = format!(
            "nbd-cow-{}-{}",
            original_uid,
            Utc::now().format("%Y-%m-%dT%H:%M:%SZ")
        );

        let _storage_lock = self.locks().acquire_shared(
            LockScope::Storage(original.storage.clone()),
            "nbd-cow",
            false,
        )?;
        let (version, sequence) = self.meta().create_version(NewVersion {
            uid: None,
            volume: original.volume.clone(),
            snapshot,
            size: original.size,
            block_size: original.block_size,
            storage: original.storage.clone(),
            labels: original.labels.clone(),
        })?;
        let _version_lock = self.locks().acquire_exclusive(
            LockScope::Version(version.uid.clone()),
            "nbd-cow",
            false,
        )?;
        self.meta().set_protected(&version.uid, true)?;

        let storage = self.storage(&original.storage)?;
        let storage_id = self.meta().storage_id(&original.storage)?;

        let mut counters = VersionCounters::default();
        let mut right_counter = 1u64;
        let mut batch: Vec<Block> = Vec::with_capacity(BLOCK_COMMIT_BATCH);

        for original_block in self.meta().stream_blocks(original_uid) {
            let original_block = original_block?;
            let idx = original_block.idx;

            let block = if !dirty_indices.contains(&idx) {
                if original_block.is_sparse() {
                    counters.bytes_sparse += original_block.size as u64;
                } else {
                    counters.bytes_deduplicated += original_block.size as u64;
                }
                original_block
            } else {
                let bytes = read_dirty(idx).map_err(|err| EngineError::RestoreFailed {
                    reason: format!("COW store read for block {idx} failed: {err}"),
                })?;
                counters.bytes_read += bytes.len() as u64;

                if bytes.iter().all(|&byte| byte == 0) {
                    counters.bytes_sparse += bytes.len() as u64;
                    Block::sparse(idx, bytes.len() as u32)
                } else {
                    let checksum = self.hash().hash(&bytes);
                    match self
                        .meta()
                        .find_valid_block_by_checksum(&checksum, storage_id)?
                    {
                        Some(existing) => {
                            counters.bytes_deduplicated += bytes.len() as u64;
                            Block {
                                idx,
                                uid: Some(existing),
                                checksum: Some(checksum),
                                size: bytes.len() as u32,
                                valid: true,
                            }
                        }
                        None => {
                            let uid = BlockUid::new(sequence, right_counter);
                            right_counter += 1;
                            storage.save_block(&uid, &bytes)?;
                            counters.bytes_written += bytes.len() as u64;
                            Block {
                                idx,
                                uid: Some(uid),
                                checksum: Some(checksum),
                                size: bytes.len() as u32,
                                valid: true,
                            }
                        }
                    }
                }
            };

            batch.push(block);
            if batch.len() >= BLOCK_COMMIT_BATCH {
                self.meta().insert_blocks(&version.uid, &batch)?;
                batch.clear();
            }
        }
        if !batch.is_empty() {
            self.meta().insert_blocks(&version.uid, &batch)?;
        }

        let counters = VersionCounters {
            duration: started.elapsed().as_secs(),
            ..counters
        };
        self.meta().finish_version(&version.uid, counters)?;
        self.backup_version_metadata(&version.uid)?;

        let fixated = self.meta().version(&version.uid)?;
        info!(
            uid = %fixated.uid,
            dirty = dirty_indices.len(),
            "COW version fixated"
        );
        Ok(fixated)
    }
}
