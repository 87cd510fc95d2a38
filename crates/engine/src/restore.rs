//! The restore pipeline.
//!
//! Restore is best-effort: a block that fails integrity is reported, marked
//! invalid (cascading to every referencing version) and skipped, while the
//! rest of the image keeps streaming.  Hard destination errors abort.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver};
use std::sync::{Arc, Mutex};

use tracing::{error, info, instrument};

use benji_common::{Block, Version, VersionUid};
use benji_io::{IoAdapter, OpenMode};
use benji_storage::StorageError;

use crate::{Engine, EngineError};

pub struct RestoreRequest {
    pub version: VersionUid,
    pub destination: String,
    pub sparse: bool,
    pub force: bool,
    pub database_less: bool,
    /// Storage holding the version-metadata object for database-less
    /// restore; defaults to the configured default storage.
    pub metadata_storage: Option<String>,
}

#[derive(Debug, Default, Clone, Copy, serde::Serialize)]
pub struct RestoreReport {
    pub blocks_restored: u64,
    pub blocks_sparse: u64,
    /// Blocks that failed integrity and were skipped.
    pub blocks_failed: u64,
}

type ErrorSlot = Arc<Mutex<Option<EngineError>>>;

impl Engine {
    #[instrument(skip(self, request), fields(version = %request.version, destination = %request.destination))]
    pub fn restore(&self, request: RestoreRequest) -> Result<RestoreReport, EngineError> {
        // Database-less restore pulls the version's metadata object from
        // the storage into a private in-memory store, then runs the same
        // pipeline against it.
        let (store, version) = if request.database_less {
            let storage_name = request
                .metadata_storage
                .clone()
                .unwrap_or_else(|| self.default_storage_name().to_string());
            let store = self.import_version_metadata_into_memory(&storage_name, &request.version)?;
            let version = store.version(&request.version)?;
            (store, version)
        } else {
            (self.meta().clone(), self.meta().version(&request.version)?)
        };

        let io = benji_io::open(
            self.config(),
            &request.destination,
            OpenMode::Write {
                size: version.size,
                force: request.force,
            },
        )?;

        if request.sparse {
            // Unmap the whole extent up front so skipped sparse blocks
            // leave holes instead of stale data.
            io.discard(0, version.size)?;
        }

        info!(blocks = version.block_count(), "restore started");
        let report = self.run_restore_pipeline(&store, &version, io, request.sparse)?;
        info!(
            restored = report.blocks_restored,
            sparse = report.blocks_sparse,
            failed = report.blocks_failed,
            "restore finished"
        );
        Ok(report)
    }

    fn run_restore_pipeline(
        &self,
        store: &benji_meta::MetaStore,
        version: &Version,
        io: Arc<dyn IoAdapter>,
        sparse: bool,
    ) -> Result<RestoreReport, EngineError> {
        let storage = self.storage(&version.storage)?;
        let workers = storage
            .simultaneous_reads()
            .min(io.simultaneous_writes().max(1))
            .max(1);

        let (work_tx, work_rx) = sync_channel::<Block>(workers);
        let work_rx = Arc::new(Mutex::new(work_rx));
        let errors: ErrorSlot = Arc::new(Mutex::new(None));
        let restored = AtomicU64::new(0);
        let sparse_skipped = AtomicU64::new(0);
        let failed = AtomicU64::new(0);
        let block_size = version.block_size as u64;

        std::thread::scope(|scope| {
            for _ in 0..workers {
                let work_rx = Arc::clone(&work_rx);
                let io = Arc::clone(&io);
                let errors = Arc::clone(&errors);
                let restored = &restored;
                let sparse_skipped = &sparse_skipped;
                let failed = &failed;
                scope.spawn(move || {
                    restore_worker(
                        self,
                        store,
                        version,
                        work_rx,
                        io,
                        block_size,
                        sparse,
                        restored,
                        sparse_skipped,
                        failed,
                        &errors,
                    )
                });
            }

            for block in store.stream_blocks(&version.uid) {
                match block {
                    Ok(block) => {
                        if work_tx.send(block).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        let mut slot = errors.lock().expect("error slot mutex poisoned");
                        if slot.is_none() {
                            *slot = Some(err.into());
                        }
                        break;
                    }
                }
            }
            drop(work_tx);
        });

        let error = errors.lock().expect("error slot mutex poisoned").take();
        if let Some(error) = error {
            return Err(error);
        }
        io.flush()?;
        Ok(RestoreReport {
            blocks_restored: restored.load(Ordering::Relaxed),
            blocks_sparse: sparse_skipped.load(Ordering::Relaxed),
            blocks_failed: failed.load(Ordering::Relaxed),
        })
    }
}

#[allow(clippy::too_many_arguments)]
fn restore_worker(
    engine: &Engine,
    store: &benji_meta::MetaStore,
    version: &Version,
    work_rx: Arc<Mutex<Receiver<Block>>>,
    io: Arc<dyn IoAdapter>,
    block_size: u64,
    sparse: bool,
    restored: &AtomicU64,
    sparse_skipped: &AtomicU64,
    failed: &AtomicU64,
    errors: &ErrorSlot,
) {
    loop {
        let received = {
            let guard = work_rx.lock().expect("restore channel mutex poisoned");
            guard.recv()
        };
        let Ok(block) = received else {
            return;
        };
        // After a hard failure the queue is only drained, so the dispatcher
        // never blocks on a stalled stage.
        if errors.lock().expect("error slot mutex poisoned").is_some() {
            continue;
        }
        let offset = block.idx * block_size;

        let Some(block_uid) = block.uid else {
            if sparse {
                sparse_skipped.fetch_add(1, Ordering::Relaxed);
            } else {
                // Dense restore: materialize the zeros.
                if let Err(err) = io.write(offset, &vec![0u8; block.size as usize]) {
                    record(errors, err.into());
                    continue;
                }
                sparse_skipped.fetch_add(1, Ordering::Relaxed);
            }
            continue;
        };

        let storage = match engine.storage(&version.storage) {
            Ok(storage) => storage,
            Err(err) => {
                record(errors, err);
                continue;
            }
        };
        let data = match storage.read_block(&block_uid) {
            Ok(data) => Some(data),
            Err(StorageError::Integrity { kind, .. }) => {
                error!(block = %block_uid, idx = block.idx, %kind, "integrity failure during restore, continuing");
                None
            }
            Err(err) => {
                record(errors, err.into());
                continue;
            }
        };

        // Verify the plaintext fingerprint; a mismatch is handled like a
        // missing object: mark invalid, skip, continue.
        let data = data.filter(|data| {
            block
                .checksum
                .as_ref()
                .map(|recorded| *recorded == engine.hash().hash(data))
                .unwrap_or(false)
        });

        match data {
            Some(data) => {
                if let Err(err) = io.write(offset, &data) {
                    record(errors, err.into());
                    continue;
                }
                restored.fetch_add(1, Ordering::Relaxed);
            }
            None => {
                failed.fetch_add(1, Ordering::Relaxed);
                error!(block = %block_uid, idx = block.idx, "block unusable, marking invalid");
                if let Err(err) = store.mark_block_invalid(&block_uid) {
                    record(errors, err.into());
                    continue;
                }
            }
        }
    }
}

fn record(errors: &ErrorSlot, error: EngineError) {
    let mut slot = errors.lock().expect("error slot mutex poisoned");
    if slot.is_none() {
        *slot = Some(error);
    }
}
