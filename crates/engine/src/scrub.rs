//! Light and deep verification.
//!
//! Light scrub proves the two objects of each block exist and that the
//! sidecar is honest (HMAC, stored size).  Deep scrub additionally fetches
//! and re-hashes the plaintext, optionally comparing byte-for-byte against
//! a live source.  Any failure marks the block invalid, which cascades to
//! every referencing version.  Sampling only ever downgrades: a partial run
//! can take `valid` away, only a full deep scrub gives it back.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver};
use std::sync::{Arc, Mutex};

use rand::Rng;
use tracing::{error, info, instrument, warn};

use benji_common::{Block, Version, VersionStatus, VersionUid};
use benji_io::{IoAdapter, OpenMode};
use benji_storage::{Storage, StorageError};

use crate::{Engine, EngineError};

#[derive(Debug, Clone)]
pub enum ScrubMode {
    Light,
    Deep {
        /// Compare plaintext against this live source URI.
        source: Option<String>,
    },
}

impl ScrubMode {
    fn is_deep(&self) -> bool {
        matches!(self, ScrubMode::Deep { .. })
    }
}

#[derive(Debug, Default, Clone, Copy, serde::Serialize)]
pub struct ScrubReport {
    pub blocks_checked: u64,
    pub blocks_failed: u64,
    /// True when the run covered every block of the version.
    pub full_coverage: bool,
}

impl ScrubReport {
    pub fn passed(&self) -> bool {
        self.blocks_failed == 0
    }
}

#[derive(Debug, Default, serde::Serialize)]
pub struct BatchScrubReport {
    pub scrubbed: Vec<(VersionUid, ScrubReport)>,
}

type ErrorSlot = Arc<Mutex<Option<EngineError>>>;

impl Engine {
    /// Scrub one version.  `block_percentage` samples blocks uniformly;
    /// 100 checks everything.
    #[instrument(skip(self, mode), fields(version = %uid))]
    pub fn scrub(
        &self,
        uid: &VersionUid,
        mode: ScrubMode,
        block_percentage: u8,
    ) -> Result<ScrubReport, EngineError> {
        let percentage = block_percentage.clamp(1, 100);
        let version = self.meta().version(uid)?;
        let storage = self.storage(&version.storage)?;

        let source = match &mode {
            ScrubMode::Deep {
                source: Some(source_uri),
            } => Some(benji_io::open(self.config(), source_uri, OpenMode::Read)?),
            _ => None,
        };

        let checked = AtomicU64::new(0);
        let failed = AtomicU64::new(0);
        let sampled_all = AtomicU64::new(1);
        let errors: ErrorSlot = Arc::new(Mutex::new(None));

        let workers = if mode.is_deep() {
            storage.simultaneous_reads().max(1)
        } else {
            // Light scrub is metadata-only; a couple of workers suffice.
            2
        };
        let (work_tx, work_rx) = sync_channel::<Block>(workers);
        let work_rx = Arc::new(Mutex::new(work_rx));

        std::thread::scope(|scope| {
            for _ in 0..workers {
                let work_rx = Arc::clone(&work_rx);
                let errors = Arc::clone(&errors);
                let storage = Arc::clone(&storage);
                let source = source.clone();
                let mode = mode.clone();
                let version = &version;
                let checked = &checked;
                let failed = &failed;
                scope.spawn(move || {
                    self.scrub_worker(
                        work_rx, storage, source, mode, version, checked, failed, &errors,
                    )
                });
            }

            let mut rng = rand::thread_rng();
            for block in self.meta().stream_blocks(uid) {
                let block = match block {
                    Ok(block) => block,
                    Err(err) => {
                        record(&errors, err.into());
                        break;
                    }
                };
                if percentage < 100 && rng.gen_range(0..100) >= percentage {
                    sampled_all.store(0, Ordering::Relaxed);
                    continue;
                }
                if work_tx.send(block).is_err() {
                    break;
                }
            }
            drop(work_tx);
        });

        let error = errors.lock().expect("error slot mutex poisoned").take();
        if let Some(error) = error {
            return Err(error);
        }

        let report = ScrubReport {
            blocks_checked: checked.load(Ordering::Relaxed),
            blocks_failed: failed.load(Ordering::Relaxed),
            full_coverage: sampled_all.load(Ordering::Relaxed) == 1 && percentage == 100,
        };

        if report.passed() && report.full_coverage && mode.is_deep() {
            // The only path from `invalid` back to `valid`.
            self.meta().mark_version_fully_valid(uid)?;
            info!(version = %uid, "full deep-scrub passed, version valid");
        } else if !report.passed() {
            warn!(version = %uid, failed = report.blocks_failed, "scrub found invalid blocks");
        }
        Ok(report)
    }

    /// Scrub every version matching a filter, sampling versions uniformly.
    pub fn batch_scrub(
        &self,
        filter: Option<&str>,
        mode: ScrubMode,
        version_percentage: u8,
        block_percentage: u8,
    ) -> Result<BatchScrubReport, EngineError> {
        let percentage = version_percentage.clamp(1, 100);
        let mut rng = rand::thread_rng();
        let mut report = BatchScrubReport::default();
        for version in self.ls(filter)? {
            if percentage < 100 && rng.gen_range(0..100) >= percentage {
                continue;
            }
            let scrubbed = self.scrub(&version.uid, mode.clone(), block_percentage)?;
            report.scrubbed.push((version.uid, scrubbed));
        }
        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    fn scrub_worker(
        &self,
        work_rx: Arc<Mutex<Receiver<Block>>>,
        storage: Arc<Storage>,
        source: Option<Arc<dyn IoAdapter>>,
        mode: ScrubMode,
        version: &Version,
        checked: &AtomicU64,
        failed: &AtomicU64,
        errors: &ErrorSlot,
    ) {
        loop {
            let received = {
                let guard = work_rx.lock().expect("scrub channel mutex poisoned");
                guard.recv()
            };
            let Ok(block) = received else {
                return;
            };
            // After a hard failure the queue is only drained, so the
            // dispatcher never blocks on a stalled stage.
            if poisoned(errors) {
                continue;
            }
            checked.fetch_add(1, Ordering::Relaxed);

            // Sparse blocks have nothing stored to verify (a source compare
            // still applies).
            if block.uid.is_none() {
                if let Some(source) = &source {
                    match self.compare_source(source, version, &block, None) {
                        Ok(true) => {}
                        Ok(false) => {
                            failed.fetch_add(1, Ordering::Relaxed);
                            error!(idx = block.idx, "sparse block differs from live source");
                        }
                        Err(err) => {
                            record(errors, err);
                        }
                    }
                }
                continue;
            }

            match self.scrub_block(&storage, source.as_deref(), &mode, version, &block) {
                Ok(true) => {}
                Ok(false) => {
                    failed.fetch_add(1, Ordering::Relaxed);
                    let block_uid = block.uid.expect("checked non-sparse above");
                    error!(block = %block_uid, idx = block.idx, "scrub failure, marking invalid");
                    if let Err(err) = self.meta().mark_block_invalid(&block_uid) {
                        record(errors, err.into());
                    }
                }
                Err(err) => {
                    record(errors, err);
                }
            }
        }
    }

    /// One block's verdict: `Ok(false)` is an integrity failure, `Err` a
    /// hard engine error.
    fn scrub_block(
        &self,
        storage: &Storage,
        source: Option<&dyn IoAdapter>,
        mode: &ScrubMode,
        version: &Version,
        block: &Block,
    ) -> Result<bool, EngineError> {
        let block_uid = block.uid.expect("caller filters sparse blocks");

        match mode {
            ScrubMode::Light => match storage.check_block(&block_uid) {
                Ok(sidecar) => Ok(sidecar.size == block.size as u64),
                Err(StorageError::Integrity { .. }) => Ok(false),
                Err(err) => Err(err.into()),
            },
            ScrubMode::Deep { .. } => {
                let data = match storage.read_block(&block_uid) {
                    Ok(data) => data,
                    Err(StorageError::Integrity { .. }) => return Ok(false),
                    Err(err) => return Err(err.into()),
                };
                if data.len() != block.size as usize {
                    return Ok(false);
                }
                let checksum = self.hash().hash(&data);
                if Some(&checksum) != block.checksum.as_ref() {
                    return Ok(false);
                }
                if let Some(source) = source {
                    return self.compare_source_adapter(source, version, block, Some(&data));
                }
                Ok(true)
            }
        }
    }

    fn compare_source(
        &self,
        source: &Arc<dyn IoAdapter>,
        version: &Version,
        block: &Block,
        data: Option<&[u8]>,
    ) -> Result<bool, EngineError> {
        self.compare_source_adapter(source.as_ref(), version, block, data)
    }

    fn compare_source_adapter(
        &self,
        source: &dyn IoAdapter,
        version: &Version,
        block: &Block,
        data: Option<&[u8]>,
    ) -> Result<bool, EngineError> {
        let offset = block.idx * version.block_size as u64;
        let live = source.read(offset, block.size as usize)?;
        match data {
            Some(data) => Ok(live == data),
            // Sparse block: the live region must be all zero.
            None => Ok(live.iter().all(|&byte| byte == 0)),
        }
    }
}

fn record(errors: &ErrorSlot, error: EngineError) {
    let mut slot = errors.lock().expect("error slot mutex poisoned");
    if slot.is_none() {
        *slot = Some(error);
    }
}

fn poisoned(errors: &ErrorSlot) -> bool {
    errors.lock().expect("error slot mutex poisoned").is_some()
}
