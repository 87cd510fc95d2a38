//! Database-backed advisory locks.
//!
//! Locks are rows with uniqueness on `(scope, name)`; acquisition is a
//! short transaction that either succeeds or conflicts, never blocks.
//! Shared holders insert suffixed rows under the same base name, so an
//! exclusive acquire conflicts with any holder while shared acquires only
//! conflict with an exclusive one.  A stale lock left by a crashed process
//! is recovered with `--override-lock`, which clears the base name first.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use tracing::{info, warn};

use benji_common::{format_timestamp, VersionUid};

use crate::{MetaError, MetaStore};

static SHARED_SEQ: AtomicU64 = AtomicU64::new(0);

/// What a lock protects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockScope {
    Global,
    Storage(String),
    Version(VersionUid),
    /// Serializes retention enforcement against concurrent backups of the
    /// same volume name.
    Volume(String),
}

impl LockScope {
    fn row(&self) -> (&'static str, String) {
        match self {
            LockScope::Global => ("global", "global".to_string()),
            LockScope::Storage(name) => ("storage", name.clone()),
            LockScope::Version(uid) => ("version", uid.as_str().to_string()),
            LockScope::Volume(name) => ("volume", name.clone()),
        }
    }
}

impl fmt::Display for LockScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (scope, name) = self.row();
        write!(f, "{scope}:{name}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

pub struct LockManager {
    store: MetaStore,
    owner: String,
}

impl LockManager {
    pub fn new(store: MetaStore, process_name: &str) -> Self {
        let owner = format!("{process_name}[{}]", std::process::id());
        Self { store, owner }
    }

    pub fn acquire_exclusive(
        &self,
        scope: LockScope,
        reason: &str,
        override_lock: bool,
    ) -> Result<LockGuard, MetaError> {
        self.acquire(scope, LockMode::Exclusive, reason, override_lock)
    }

    pub fn acquire_shared(
        &self,
        scope: LockScope,
        reason: &str,
        override_lock: bool,
    ) -> Result<LockGuard, MetaError> {
        self.acquire(scope, LockMode::Shared, reason, override_lock)
    }

    /// Non-blocking acquire.  `override_lock` deletes whatever rows are
    /// there first — crash recovery, not a fairness mechanism.
    pub fn acquire(
        &self,
        scope: LockScope,
        mode: LockMode,
        reason: &str,
        override_lock: bool,
    ) -> Result<LockGuard, MetaError> {
        let (scope_text, base) = scope.row();
        let shared_prefix = format!("{base}//");

        let mut conn = self.store.lock_connection();
        let tx = conn.transaction()?;

        if override_lock {
            let removed = tx.execute(
                "DELETE FROM locks WHERE scope = ?1 AND (name = ?2 OR name LIKE ?3 || '%')",
                params![scope_text, base, shared_prefix],
            )?;
            if removed > 0 {
                warn!(scope = %scope, removed, "overrode existing lock");
            }
        }

        let conflicting: Option<(String, String)> = match mode {
            // Any holder blocks an exclusive acquire.
            LockMode::Exclusive => tx
                .query_row(
                    "SELECT owner, reason FROM locks
                     WHERE scope = ?1 AND (name = ?2 OR name LIKE ?3 || '%') LIMIT 1",
                    params![scope_text, base, shared_prefix],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?,
            // Shared acquires only conflict with an exclusive holder.
            LockMode::Shared => tx
                .query_row(
                    "SELECT owner, reason FROM locks WHERE scope = ?1 AND name = ?2",
                    params![scope_text, base],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?,
        };
        if let Some((owner, held_reason)) = conflicting {
            return Err(MetaError::LockConflict {
                scope: scope_text.to_string(),
                name: base,
                owner,
                reason: held_reason,
            });
        }

        let row_name = match mode {
            LockMode::Exclusive => base.clone(),
            LockMode::Shared => format!(
                "{shared_prefix}{}#{}",
                self.owner,
                SHARED_SEQ.fetch_add(1, Ordering::Relaxed)
            ),
        };
        tx.execute(
            "INSERT INTO locks (scope, name, owner, acquired_at, reason)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                scope_text,
                row_name,
                self.owner,
                format_timestamp(&Utc::now()),
                reason
            ],
        )?;
        tx.commit()?;
        drop(conn);

        info!(scope = %scope, ?mode, reason, "lock acquired");
        Ok(LockGuard {
            store: self.store.clone(),
            scope_text,
            row_name,
        })
    }
}

/// Held lock; the row is deleted on drop (best effort — a crashed process
/// leaves the row for `--override-lock`).
pub struct LockGuard {
    store: MetaStore,
    scope_text: &'static str,
    row_name: String,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let conn = self.store.lock_connection();
        if let Err(err) = conn.execute(
            "DELETE FROM locks WHERE scope = ?1 AND name = ?2",
            params![self.scope_text, self.row_name],
        ) {
            warn!(scope = self.scope_text, name = %self.row_name, error = %err, "failed to release lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (MetaStore, LockManager) {
        let store = MetaStore::open_memory().unwrap();
        let manager = LockManager::new(store.clone(), "benji-test");
        (store, manager)
    }

    fn storage_scope() -> LockScope {
        LockScope::Storage("local".to_string())
    }

    #[test]
    fn exclusive_conflicts_until_release() {
        let (_store, manager) = manager();
        let guard = manager
            .acquire_exclusive(storage_scope(), "rm", false)
            .unwrap();

        assert!(matches!(
            manager.acquire_exclusive(storage_scope(), "cleanup", false),
            Err(MetaError::LockConflict { .. })
        ));
        assert!(manager.acquire_shared(storage_scope(), "backup", false).is_err());

        drop(guard);
        manager.acquire_exclusive(storage_scope(), "cleanup", false).unwrap();
    }

    #[test]
    fn shared_holders_coexist_but_block_exclusive() {
        let (_store, manager) = manager();
        let _one = manager.acquire_shared(storage_scope(), "backup", false).unwrap();
        let _two = manager.acquire_shared(storage_scope(), "backup", false).unwrap();

        assert!(matches!(
            manager.acquire_exclusive(storage_scope(), "cleanup", false),
            Err(MetaError::LockConflict { .. })
        ));

        drop(_one);
        assert!(manager.acquire_exclusive(storage_scope(), "cleanup", false).is_err());
        drop(_two);
        manager.acquire_exclusive(storage_scope(), "cleanup", false).unwrap();
    }

    #[test]
    fn scopes_do_not_interfere() {
        let (_store, manager) = manager();
        let _a = manager.acquire_exclusive(storage_scope(), "rm", false).unwrap();
        let _b = manager
            .acquire_exclusive(LockScope::Storage("remote".to_string()), "rm", false)
            .unwrap();
        let _c = manager
            .acquire_exclusive(LockScope::Version(VersionUid::new("V1")), "backup", false)
            .unwrap();
        let _d = manager
            .acquire_exclusive(LockScope::Global, "maintenance", false)
            .unwrap();
    }

    #[test]
    fn override_recovers_a_stale_lock() {
        let (_store, manager) = manager();
        let guard = manager
            .acquire_exclusive(LockScope::Volume("vm1".to_string()), "enforce", false)
            .unwrap();
        // Simulate a crash: leak the guard so the row survives.
        std::mem::forget(guard);

        assert!(manager
            .acquire_exclusive(LockScope::Volume("vm1".to_string()), "enforce", false)
            .is_err());
        manager
            .acquire_exclusive(LockScope::Volume("vm1".to_string()), "enforce", true)
            .unwrap();
    }
}
