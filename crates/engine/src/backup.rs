//! The backup pipeline.
//!
//! Reader threads stream blocks out of the source, hash workers fingerprint
//! and deduplicate them, storage workers upload what is genuinely new, and
//! a single committer batches block rows into bounded metadata
//! transactions.  Every hand-off is a bounded channel, so a slow storage
//! stalls the hash workers and ultimately the readers — back-pressure is
//! the queue capacity, nothing else.
//!
//! A failed backup leaves the version `incomplete` with every committed
//! block in place: those blocks are dedup-eligible, which is what makes a
//! retry cheap.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::{debug, info, instrument};

use benji_common::{block_count, Block, BlockUid, Checksum, Version, VersionStatus, VersionUid};
use benji_io::hints::Hint;
use benji_io::{IoAdapter, OpenMode};
use benji_meta::locks::LockScope;
use benji_meta::{NewVersion, VersionCounters};
use benji_storage::Storage;

use crate::dedup::SingleFlight;
use crate::{Engine, EngineError, BLOCK_COMMIT_BATCH};

pub struct BackupRequest {
    pub source: String,
    pub volume: String,
    pub snapshot: String,
    pub base_version: Option<VersionUid>,
    pub hints: Option<Vec<Hint>>,
    pub uid: Option<VersionUid>,
    pub labels: BTreeMap<String, String>,
}

/// Work assignment for one block index.
enum Plan {
    /// Read from the source and run the full hash/dedup/store path.
    Read { length: u32 },
    /// Covered only by unused hints: known-unallocated, stored sparse.
    SparseHint { length: u32 },
    /// Untouched since the base version: the row is copied as-is.
    Inherit(Block),
}

/// One finished block row plus its counter contribution.
struct RowEvent {
    block: Block,
    read: u64,
    written: u64,
    deduplicated: u64,
    sparse: u64,
}

/// Pending upload after the hash stage claimed the fingerprint.
struct WriteItem {
    idx: u64,
    uid: BlockUid,
    checksum: Checksum,
    bytes: Vec<u8>,
    guard: crate::dedup::FlightGuard,
}

type ErrorSlot = Arc<Mutex<Option<EngineError>>>;

fn record_error(slot: &ErrorSlot, error: EngineError) {
    let mut slot = slot.lock().expect("error slot mutex poisoned");
    if slot.is_none() {
        *slot = Some(error);
    }
}

impl Engine {
    /// Run one backup to the default storage.
    #[instrument(skip(self, request), fields(volume = %request.volume, source = %request.source))]
    pub fn backup(&self, request: BackupRequest) -> Result<Version, EngineError> {
        let started = Instant::now();
        let io = benji_io::open(self.config(), &request.source, OpenMode::Read)?;
        let source_size = io.size()?;
        let block_size = self.config().block_size;
        let count = block_count(source_size, block_size);

        let plans = self.plan_blocks(&request, source_size, block_size, count)?;

        let storage_name = self.default_storage_name().to_string();
        let _storage_lock = self.locks().acquire_shared(
            LockScope::Storage(storage_name.clone()),
            "backup",
            false,
        )?;

        let (version, sequence) = self.meta().create_version(NewVersion {
            uid: request.uid.clone(),
            volume: request.volume.clone(),
            snapshot: request.snapshot.clone(),
            size: source_size,
            block_size,
            storage: storage_name.clone(),
            labels: request.labels.clone(),
        })?;
        let _version_lock = self.locks().acquire_exclusive(
            LockScope::Version(version.uid.clone()),
            "backup",
            false,
        )?;

        info!(uid = %version.uid, blocks = count, "backup started");
        let storage = self.storage(&storage_name)?;
        let counters = self.run_pipeline(&version.uid, io, storage, sequence, plans)?;

        let counters = VersionCounters {
            duration: started.elapsed().as_secs(),
            ..counters
        };
        self.meta().finish_version(&version.uid, counters)?;
        self.backup_version_metadata(&version.uid)?;

        let finished = self.meta().version(&version.uid)?;
        info!(
            uid = %finished.uid,
            bytes_read = finished.bytes_read,
            bytes_written = finished.bytes_written,
            bytes_deduplicated = finished.bytes_deduplicated,
            bytes_sparse = finished.bytes_sparse,
            "backup complete"
        );
        Ok(finished)
    }

    /// Resolve every block index to a work assignment, folding in the base
    /// version and the hints.
    fn plan_blocks(
        &self,
        request: &BackupRequest,
        source_size: u64,
        block_size: u32,
        count: u64,
    ) -> Result<Vec<Plan>, EngineError> {
        let base_blocks: Vec<Option<Block>> = match &request.base_version {
            None => Vec::new(),
            Some(base_uid) => {
                let base = self.meta().version(base_uid)?;
                if base.status != VersionStatus::Valid {
                    return Err(EngineError::BaseInvalid {
                        uid: base_uid.clone(),
                        status: base.status.to_string(),
                    });
                }
                if base.block_size != block_size {
                    return Err(EngineError::BlockSizeMismatch {
                        base: base_uid.clone(),
                        base_block_size: base.block_size,
                        requested: block_size,
                    });
                }
                if source_size < base.size {
                    return Err(EngineError::SourceTooSmall {
                        base: base_uid.clone(),
                        source_size,
                        base_size: base.size,
                    });
                }
                let mut blocks = vec![None; count as usize];
                for block in self.meta().stream_blocks(base_uid) {
                    let block = block?;
                    let idx = block.idx as usize;
                    if idx < blocks.len() {
                        blocks[idx] = Some(block);
                    }
                }
                blocks
            }
        };

        let mut must_read = vec![false; count as usize];
        let mut covered = vec![false; count as usize];
        if let Some(hints) = &request.hints {
            for hint in hints {
                for idx in hint.block_range(block_size) {
                    if idx >= count {
                        continue;
                    }
                    covered[idx as usize] = true;
                    if hint.used {
                        must_read[idx as usize] = true;
                    }
                }
            }
        }
        let have_hints = request.hints.is_some();

        let mut plans = Vec::with_capacity(count as usize);
        for idx in 0..count {
            let offset = idx * block_size as u64;
            let length = (source_size - offset).min(block_size as u64) as u32;

            let plan = if !have_hints {
                // Without hints nothing proves a block unchanged, so the
                // entire source is read; the base then only contributes
                // through content dedup on matching checksums.
                Plan::Read { length }
            } else if must_read[idx as usize] {
                Plan::Read { length }
            } else if covered[idx as usize] {
                Plan::SparseHint { length }
            } else if let Some(Some(base_block)) = base_blocks.get(idx as usize) {
                // The differential fast path: the diff covered everything
                // that changed, so an uncovered index known from the base
                // is inherited without a read.  The last block of the base
                // may be short; re-read it if our length differs.
                if base_block.size == length {
                    Plan::Inherit(base_block.clone())
                } else {
                    Plan::Read { length }
                }
            } else {
                Plan::Read { length }
            };
            plans.push(plan);
        }
        Ok(plans)
    }

    fn run_pipeline(
        &self,
        uid: &VersionUid,
        io: Arc<dyn IoAdapter>,
        storage: Arc<Storage>,
        sequence: u64,
        plans: Vec<Plan>,
    ) -> Result<VersionCounters, EngineError> {
        let readers = io.simultaneous_reads().max(1);
        let hashers = readers.max(2);
        let writers = storage.simultaneous_writes().max(1);
        let block_size = self.config().block_size;

        // Queue depth equals the consuming worker count.
        let (read_tx, read_rx) = sync_channel::<(u64, u32)>(readers);
        let (data_tx, data_rx) = sync_channel::<(u64, Vec<u8>)>(hashers);
        let (write_tx, write_rx) = sync_channel::<WriteItem>(writers);
        let (row_tx, row_rx) = sync_channel::<RowEvent>(writers + hashers);

        let read_rx = Arc::new(Mutex::new(read_rx));
        let data_rx = Arc::new(Mutex::new(data_rx));
        let write_rx = Arc::new(Mutex::new(write_rx));

        let errors: ErrorSlot = Arc::new(Mutex::new(None));
        let errors_outer = Arc::clone(&errors);
        let singleflight = SingleFlight::new();
        let right_counter = Arc::new(AtomicU64::new(1));
        let storage_id = self.meta().storage_id(storage.name())?;
        let store = self.meta().clone();
        let uid_for_commit = uid.clone();

        let counters = std::thread::scope(move |scope| {
            for _ in 0..readers {
                let read_rx = Arc::clone(&read_rx);
                let data_tx = data_tx.clone();
                let io = Arc::clone(&io);
                let errors = Arc::clone(&errors);
                scope.spawn(move || {
                    reader_worker(read_rx, data_tx, io, block_size, &errors)
                });
            }
            for _ in 0..hashers {
                let data_rx = Arc::clone(&data_rx);
                let write_tx = write_tx.clone();
                let row_tx = row_tx.clone();
                let errors = Arc::clone(&errors);
                let singleflight = Arc::clone(&singleflight);
                let right_counter = Arc::clone(&right_counter);
                scope.spawn(move || {
                    self.hash_worker(
                        data_rx,
                        write_tx,
                        row_tx,
                        storage_id,
                        sequence,
                        right_counter,
                        singleflight,
                        &errors,
                    )
                });
            }
            for _ in 0..writers {
                let write_rx = Arc::clone(&write_rx);
                let row_tx = row_tx.clone();
                let storage = Arc::clone(&storage);
                let errors = Arc::clone(&errors);
                scope.spawn(move || writer_worker(write_rx, row_tx, storage, &errors));
            }

            let committer = {
                let errors = Arc::clone(&errors);
                scope.spawn(move || committer_worker(row_rx, store, uid_for_commit, &errors))
            };

            // Only worker-held clones may keep the receivers alive: a fully
            // failed stage must close its channel so upstream senders error
            // out instead of blocking forever.
            drop(read_rx);
            drop(data_rx);
            drop(write_rx);

            // Dispatch assignments.  Resolved plans (sparse, inherited)
            // bypass the IO and hash stages entirely.
            for (idx, plan) in plans.into_iter().enumerate() {
                let event = match plan {
                    Plan::Read { length } => {
                        if read_tx.send((idx as u64, length)).is_err() {
                            break;
                        }
                        continue;
                    }
                    Plan::SparseHint { length } => RowEvent {
                        block: Block::sparse(idx as u64, length),
                        read: 0,
                        written: 0,
                        deduplicated: 0,
                        sparse: length as u64,
                    },
                    Plan::Inherit(base_block) => RowEvent {
                        sparse: if base_block.is_sparse() {
                            base_block.size as u64
                        } else {
                            0
                        },
                        deduplicated: if base_block.is_sparse() {
                            0
                        } else {
                            base_block.size as u64
                        },
                        block: Block {
                            idx: idx as u64,
                            ..base_block
                        },
                        read: 0,
                        written: 0,
                    },
                };
                if row_tx.send(event).is_err() {
                    break;
                }
            }

            drop(read_tx);
            drop(data_tx);
            drop(write_tx);
            drop(row_tx);
            committer.join().expect("committer thread panicked")
        });

        let error = errors_outer
            .lock()
            .expect("error slot mutex poisoned")
            .take();
        if let Some(error) = error {
            // The version stays incomplete; already-stored blocks remain
            // dedup-eligible for the retry.
            return Err(error);
        }
        Ok(counters)
    }

    #[allow(clippy::too_many_arguments)]
    fn hash_worker(
        &self,
        data_rx: Arc<Mutex<Receiver<(u64, Vec<u8>)>>>,
        write_tx: SyncSender<WriteItem>,
        row_tx: SyncSender<RowEvent>,
        storage_id: i64,
        sequence: u64,
        right_counter: Arc<AtomicU64>,
        singleflight: Arc<SingleFlight>,
        errors: &ErrorSlot,
    ) {
        loop {
            let received = {
                let guard = data_rx.lock().expect("data channel mutex poisoned");
                guard.recv()
            };
            let Ok((idx, bytes)) = received else {
                return;
            };
            let length = bytes.len() as u64;

            if bytes.iter().all(|&byte| byte == 0) {
                let event = RowEvent {
                    block: Block::sparse(idx, length as u32),
                    read: length,
                    written: 0,
                    deduplicated: 0,
                    sparse: length,
                };
                if row_tx.send(event).is_err() {
                    return;
                }
                continue;
            }

            let checksum = self.hash().hash(&bytes);
            match self.lookup_dedup(&checksum, storage_id, &singleflight) {
                Err(error) => {
                    record_error(errors, error);
                    return;
                }
                Ok(Some(existing)) => {
                    let event = RowEvent {
                        block: Block {
                            idx,
                            uid: Some(existing),
                            checksum: Some(checksum),
                            size: length as u32,
                            valid: true,
                        },
                        read: length,
                        written: 0,
                        deduplicated: length,
                        sparse: 0,
                    };
                    if row_tx.send(event).is_err() {
                        return;
                    }
                }
                Ok(None) => {
                    // Claim the fingerprint, then look again: the previous
                    // holder may have finished while we waited.
                    let guard = singleflight.acquire(&checksum);
                    match self.lookup_dedup(&checksum, storage_id, &singleflight) {
                        Err(error) => {
                            record_error(errors, error);
                            return;
                        }
                        Ok(Some(existing)) => {
                            drop(guard);
                            let event = RowEvent {
                                block: Block {
                                    idx,
                                    uid: Some(existing),
                                    checksum: Some(checksum),
                                    size: length as u32,
                                    valid: true,
                                },
                                read: length,
                                written: 0,
                                deduplicated: length,
                                sparse: 0,
                            };
                            if row_tx.send(event).is_err() {
                                return;
                            }
                        }
                        Ok(None) => {
                            let uid = BlockUid::new(
                                sequence,
                                right_counter.fetch_add(1, Ordering::Relaxed),
                            );
                            let item = WriteItem {
                                idx,
                                uid,
                                checksum,
                                bytes,
                                guard,
                            };
                            if write_tx.send(item).is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        }
    }

    fn lookup_dedup(
        &self,
        checksum: &Checksum,
        storage_id: i64,
        singleflight: &SingleFlight,
    ) -> Result<Option<BlockUid>, EngineError> {
        if let Some(uncommitted) = singleflight.completed(checksum) {
            return Ok(Some(uncommitted));
        }
        Ok(self
            .meta()
            .find_valid_block_by_checksum(checksum, storage_id)?)
    }
}

fn reader_worker(
    read_rx: Arc<Mutex<Receiver<(u64, u32)>>>,
    data_tx: SyncSender<(u64, Vec<u8>)>,
    io: Arc<dyn IoAdapter>,
    block_size: u32,
    errors: &ErrorSlot,
) {
    loop {
        let received = {
            let guard = read_rx.lock().expect("read channel mutex poisoned");
            guard.recv()
        };
        let Ok((idx, length)) = received else {
            return;
        };
        match io.read(idx * block_size as u64, length as usize) {
            Ok(bytes) => {
                if data_tx.send((idx, bytes)).is_err() {
                    return;
                }
            }
            Err(error) => {
                record_error(errors, error.into());
                return;
            }
        }
    }
}

fn writer_worker(
    write_rx: Arc<Mutex<Receiver<WriteItem>>>,
    row_tx: SyncSender<RowEvent>,
    storage: Arc<Storage>,
    errors: &ErrorSlot,
) {
    loop {
        let received = {
            let guard = write_rx.lock().expect("write channel mutex poisoned");
            guard.recv()
        };
        let Ok(item) = received else {
            return;
        };
        let length = item.bytes.len() as u64;
        match storage.save_block(&item.uid, &item.bytes) {
            Ok(_report) => {
                item.guard.complete(item.uid);
                drop(item.guard);
                let event = RowEvent {
                    block: Block {
                        idx: item.idx,
                        uid: Some(item.uid),
                        checksum: Some(item.checksum),
                        size: length as u32,
                        valid: true,
                    },
                    read: length,
                    written: length,
                    deduplicated: 0,
                    sparse: 0,
                };
                if row_tx.send(event).is_err() {
                    return;
                }
            }
            Err(error) => {
                record_error(errors, error.into());
                return;
            }
        }
    }
}

fn committer_worker(
    row_rx: Receiver<RowEvent>,
    store: benji_meta::MetaStore,
    uid: VersionUid,
    errors: &ErrorSlot,
) -> VersionCounters {
    let mut counters = VersionCounters::default();
    let mut batch: Vec<Block> = Vec::with_capacity(BLOCK_COMMIT_BATCH);

    while let Ok(event) = row_rx.recv() {
        counters.bytes_read += event.read;
        counters.bytes_written += event.written;
        counters.bytes_deduplicated += event.deduplicated;
        counters.bytes_sparse += event.sparse;
        batch.push(event.block);
        if batch.len() >= BLOCK_COMMIT_BATCH {
            if let Err(error) = store.insert_blocks(&uid, &batch) {
                record_error(errors, error.into());
                return counters;
            }
            debug!(uid = %uid, rows = batch.len(), "block batch committed");
            batch.clear();
        }
    }

    if !batch.is_empty() {
        if let Err(error) = store.insert_blocks(&uid, &batch) {
            record_error(errors, error.into());
        }
    }
    counters
}
