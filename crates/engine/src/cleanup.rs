//! Version removal and two-phase block deletion.
//!
//! `rm` is logical: the version's rows disappear and every stored object it
//! referenced becomes a deletion candidate.  `cleanup` later walks the
//! candidates whose grace window expired, re-checks that no surviving block
//! references them, and only then deletes from storage.  The grace window
//! closes the race against a concurrent backup that deduplicated onto a
//! candidate between enqueue and sweep.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver};
use std::sync::{Arc, Mutex};

use chrono::{Duration, Utc};
use tracing::{info, instrument, warn};

use benji_common::{BlockUid, VersionUid};
use benji_meta::locks::LockScope;
use benji_storage::Storage;

use crate::{Engine, EngineError};

#[derive(Debug, Clone)]
pub struct CleanupOptions {
    /// Grace window in hours before a candidate may be swept.
    pub grace_hours: f64,
    /// Also sweep objects on the storages that no block row references at
    /// all (orphans from crashed backups).
    pub full: bool,
    pub override_lock: bool,
}

impl Default for CleanupOptions {
    fn default() -> Self {
        Self {
            grace_hours: 1.0,
            full: false,
            override_lock: false,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, serde::Serialize)]
pub struct CleanupReport {
    pub candidates_considered: u64,
    pub objects_deleted: u64,
    /// Candidates dropped because a new block row references them again.
    pub candidates_rescued: u64,
    pub orphans_deleted: u64,
}

impl Engine {
    /// Logically remove a version.  Refused for protected versions and for
    /// versions younger than `disallowRemoveWhenYounger` days unless
    /// forced.
    #[instrument(skip(self), fields(version = %uid))]
    pub fn remove(
        &self,
        uid: &VersionUid,
        force: bool,
        override_lock: bool,
    ) -> Result<usize, EngineError> {
        let version = self.meta().version(uid)?;
        if version.protected {
            return Err(EngineError::policy_violation(
                uid,
                "version is protected (unprotect it first)",
            ));
        }
        let minimum_age = Duration::days(self.config().disallow_remove_when_younger as i64);
        let age = Utc::now().signed_duration_since(version.date);
        if age < minimum_age && !force {
            return Err(EngineError::policy_violation(
                uid,
                format!(
                    "version is only {} hours old (minimum {} days, use --force)",
                    age.num_hours(),
                    minimum_age.num_days()
                ),
            ));
        }

        let _storage_lock = self.locks().acquire_exclusive(
            LockScope::Storage(version.storage.clone()),
            "rm",
            override_lock,
        )?;
        let enqueued = self.meta().remove_version(uid)?;
        Ok(enqueued)
    }

    /// Sweep expired deletion candidates (and optionally orphans).
    /// Idempotent and restartable: candidates survive a crash and are
    /// re-considered on the next run.
    #[instrument(skip(self, options))]
    pub fn cleanup(&self, options: CleanupOptions) -> Result<CleanupReport, EngineError> {
        let cutoff = Utc::now()
            - Duration::seconds((options.grace_hours * 3600.0).max(0.0).round() as i64);
        let due = self.meta().due_deletion_candidates(cutoff)?;

        let mut report = CleanupReport {
            candidates_considered: due.len() as u64,
            ..CleanupReport::default()
        };

        // Group by storage so each storage is locked once and swept with
        // its own removal worker pool.
        let mut per_storage: HashMap<String, Vec<BlockUid>> = HashMap::new();
        for (uid, storage_name) in due {
            per_storage.entry(storage_name).or_default().push(uid);
        }

        for (storage_name, candidates) in per_storage {
            let _lock = self.locks().acquire_exclusive(
                LockScope::Storage(storage_name.clone()),
                "cleanup",
                options.override_lock,
            )?;
            let storage = self.storage(&storage_name)?;

            let mut deletable = Vec::new();
            for uid in candidates {
                if self.meta().is_block_referenced(&uid)? {
                    // A backup re-used the block by checksum since `rm`.
                    self.meta().drop_deletion_candidate(&uid)?;
                    report.candidates_rescued += 1;
                } else {
                    deletable.push(uid);
                }
            }

            report.objects_deleted += self.delete_batch(&storage, &deletable, true)?;

            if options.full {
                report.orphans_deleted += self.sweep_orphans(&storage)?;
            }
        }

        info!(
            deleted = report.objects_deleted,
            rescued = report.candidates_rescued,
            orphans = report.orphans_deleted,
            "cleanup finished"
        );
        Ok(report)
    }

    /// Delete stored objects with the storage's removal worker budget.
    fn delete_batch(
        &self,
        storage: &Arc<Storage>,
        uids: &[BlockUid],
        drop_candidates: bool,
    ) -> Result<u64, EngineError> {
        if uids.is_empty() {
            return Ok(0);
        }
        let workers = storage.simultaneous_removals().max(1);
        let (work_tx, work_rx) = sync_channel::<BlockUid>(workers);
        let work_rx = Arc::new(Mutex::new(work_rx));
        let deleted = AtomicU64::new(0);
        let errors: Arc<Mutex<Option<EngineError>>> = Arc::new(Mutex::new(None));

        std::thread::scope(|scope| {
            for _ in 0..workers {
                let work_rx: Arc<Mutex<Receiver<BlockUid>>> = Arc::clone(&work_rx);
                let errors = Arc::clone(&errors);
                let storage = Arc::clone(storage);
                let deleted = &deleted;
                scope.spawn(move || loop {
                    let received = {
                        let guard = work_rx.lock().expect("cleanup channel mutex poisoned");
                        guard.recv()
                    };
                    let Ok(uid) = received else {
                        return;
                    };
                    if errors.lock().expect("error slot mutex poisoned").is_some() {
                        continue;
                    }
                    match storage.delete_block(&uid) {
                        Ok(()) => {
                            deleted.fetch_add(1, Ordering::Relaxed);
                            if drop_candidates {
                                if let Err(err) = self.meta().drop_deletion_candidate(&uid) {
                                    let mut slot =
                                        errors.lock().expect("error slot mutex poisoned");
                                    if slot.is_none() {
                                        *slot = Some(err.into());
                                    }
                                }
                            }
                        }
                        Err(err) => {
                            warn!(block = %uid, error = %err, "failed to delete object, candidate kept");
                        }
                    }
                });
            }

            for uid in uids {
                if work_tx.send(*uid).is_err() {
                    break;
                }
            }
            drop(work_tx);
        });

        let error = errors.lock().expect("error slot mutex poisoned").take();
        if let Some(error) = error {
            return Err(error);
        }
        Ok(deleted.load(Ordering::Relaxed))
    }

    /// Full mode: every object on the storage that no block row references
    /// is removed.  Runs under the storage's exclusive lock, so no backup
    /// can be allocating new objects concurrently.
    fn sweep_orphans(&self, storage: &Arc<Storage>) -> Result<u64, EngineError> {
        let mut orphans = Vec::new();
        for uid in storage.list_block_uids()? {
            if !self.meta().is_block_referenced(&uid)? {
                orphans.push(uid);
            }
        }
        if !orphans.is_empty() {
            info!(count = orphans.len(), storage = storage.name(), "sweeping orphan objects");
        }
        for uid in &orphans {
            // Orphans may still sit in the candidate table from an earlier
            // crashed cleanup.
            self.meta().drop_deletion_candidate(uid)?;
        }
        self.delete_batch(storage, &orphans, false)
    }
}
