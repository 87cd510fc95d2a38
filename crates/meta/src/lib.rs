//! Relational metadata store.
//!
//! Versions, blocks, locks, settings and deletion candidates live in SQLite
//! (`databaseEngine: sqlite:<path>`); an in-memory instance backs the
//! database-less restore path.  Block enumeration is always through the
//! paging [`BlockIter`] — a version's block list is never materialized in
//! one piece.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info};

use benji_common::{
    format_timestamp, Block, BlockUid, Checksum, Version, VersionStatus, VersionUid,
};

pub mod export;
pub mod locks;

mod error;

pub use error::MetaError;

/// Schema generation of this binary.
pub const SCHEMA_VERSION: i64 = 1;

const BLOCK_BATCH: usize = 1000;

const SCHEMA: &str = r#"
CREATE TABLE schema_info (
    version INTEGER NOT NULL
);
CREATE TABLE settings (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
CREATE TABLE sequences (
    name TEXT PRIMARY KEY,
    value INTEGER NOT NULL
);
CREATE TABLE storages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT UNIQUE NOT NULL
);
CREATE TABLE versions (
    uid TEXT PRIMARY KEY,
    seq INTEGER UNIQUE NOT NULL,
    date TEXT NOT NULL,
    volume TEXT NOT NULL,
    snapshot TEXT NOT NULL DEFAULT '',
    size INTEGER NOT NULL,
    block_size INTEGER NOT NULL,
    storage_id INTEGER NOT NULL REFERENCES storages(id),
    status TEXT NOT NULL,
    protected INTEGER NOT NULL DEFAULT 0,
    bytes_read INTEGER NOT NULL DEFAULT 0,
    bytes_written INTEGER NOT NULL DEFAULT 0,
    bytes_deduplicated INTEGER NOT NULL DEFAULT 0,
    bytes_sparse INTEGER NOT NULL DEFAULT 0,
    duration INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX versions_volume ON versions(volume);
CREATE TABLE labels (
    version_uid TEXT NOT NULL REFERENCES versions(uid) ON DELETE CASCADE,
    name TEXT NOT NULL,
    value TEXT NOT NULL DEFAULT '',
    PRIMARY KEY (version_uid, name)
);
CREATE TABLE blocks (
    version_uid TEXT NOT NULL REFERENCES versions(uid) ON DELETE CASCADE,
    idx INTEGER NOT NULL,
    uid_left INTEGER,
    uid_right INTEGER,
    checksum BLOB,
    size INTEGER NOT NULL,
    valid INTEGER NOT NULL DEFAULT 1,
    PRIMARY KEY (version_uid, idx)
);
CREATE INDEX blocks_uid ON blocks(uid_left, uid_right);
CREATE INDEX blocks_checksum ON blocks(checksum);
CREATE TABLE locks (
    scope TEXT NOT NULL,
    name TEXT NOT NULL,
    owner TEXT NOT NULL,
    acquired_at TEXT NOT NULL,
    reason TEXT NOT NULL,
    PRIMARY KEY (scope, name)
);
CREATE TABLE deletion_candidates (
    uid_left INTEGER NOT NULL,
    uid_right INTEGER NOT NULL,
    storage_id INTEGER NOT NULL REFERENCES storages(id),
    proposed_at TEXT NOT NULL,
    PRIMARY KEY (uid_left, uid_right)
);
"#;

/// Parameters for a fresh version row; everything else is generator-assigned.
#[derive(Debug, Clone)]
pub struct NewVersion {
    /// Explicit uid (`--uid`); generated from the sequence when absent.
    pub uid: Option<VersionUid>,
    pub volume: String,
    pub snapshot: String,
    pub size: u64,
    pub block_size: u32,
    pub storage: String,
    pub labels: BTreeMap<String, String>,
}

/// Counters recorded when a backup completes.
#[derive(Debug, Clone, Copy, Default)]
pub struct VersionCounters {
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub bytes_deduplicated: u64,
    pub bytes_sparse: u64,
    pub duration: u64,
}

#[derive(Clone)]
pub struct MetaStore {
    conn: Arc<Mutex<Connection>>,
}

impl MetaStore {
    /// Open from a `databaseEngine` URL.
    pub fn open(url: &str) -> Result<Self, MetaError> {
        let path = url
            .strip_prefix("sqlite:")
            .ok_or_else(|| MetaError::InvalidDatabaseUrl {
                url: url.to_string(),
            })?;
        if path.is_empty() {
            return Err(MetaError::InvalidDatabaseUrl {
                url: url.to_string(),
            });
        }
        let conn = if path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(path)?
        };
        Self::from_connection(conn)
    }

    /// Private store for database-less restore.
    pub fn open_memory() -> Result<Self, MetaError> {
        let store = Self::from_connection(Connection::open_in_memory()?)?;
        store.init(false)?;
        Ok(store)
    }

    fn from_connection(conn: Connection) -> Result<Self, MetaError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("metadata store mutex poisoned")
    }

    pub(crate) fn lock_connection(&self) -> MutexGuard<'_, Connection> {
        self.lock()
    }

    /// Create the schema.  Refuses to touch an initialized database unless
    /// `force` (which drops everything).
    pub fn init(&self, force: bool) -> Result<(), MetaError> {
        let mut conn = self.lock();
        let initialized = schema_version(&conn)?.is_some();
        if initialized && !force {
            return Err(MetaError::AlreadyInitialized);
        }
        let tx = conn.transaction()?;
        if initialized {
            tx.execute_batch(
                "DROP TABLE IF EXISTS deletion_candidates;
                 DROP TABLE IF EXISTS locks;
                 DROP TABLE IF EXISTS blocks;
                 DROP TABLE IF EXISTS labels;
                 DROP TABLE IF EXISTS versions;
                 DROP TABLE IF EXISTS storages;
                 DROP TABLE IF EXISTS sequences;
                 DROP TABLE IF EXISTS settings;
                 DROP TABLE IF EXISTS schema_info;",
            )?;
        }
        tx.execute_batch(SCHEMA)?;
        tx.execute("INSERT INTO schema_info (version) VALUES (?1)", params![SCHEMA_VERSION])?;
        tx.commit()?;
        info!(schema_version = SCHEMA_VERSION, "database initialized");
        Ok(())
    }

    /// Walk the schema forward one generation at a time.
    pub fn migrate(&self) -> Result<(), MetaError> {
        let mut conn = self.lock();
        let mut current = schema_version(&conn)?.ok_or(MetaError::NotInitialized)?;
        if current > SCHEMA_VERSION {
            return Err(MetaError::SchemaTooNew {
                found: current,
                supported: SCHEMA_VERSION,
            });
        }
        while current < SCHEMA_VERSION {
            let tx = conn.transaction()?;
            apply_migration(&tx, current)?;
            tx.execute("UPDATE schema_info SET version = ?1", params![current + 1])?;
            tx.commit()?;
            info!(from = current, to = current + 1, "schema migrated");
            current += 1;
        }
        Ok(())
    }

    /// Verify the store is usable by this binary.
    pub fn check_ready(&self) -> Result<(), MetaError> {
        let conn = self.lock();
        match schema_version(&conn)? {
            None => Err(MetaError::NotInitialized),
            Some(found) if found > SCHEMA_VERSION => Err(MetaError::SchemaTooNew {
                found,
                supported: SCHEMA_VERSION,
            }),
            Some(found) if found < SCHEMA_VERSION => Err(MetaError::MigrationRequired {
                found,
                required: SCHEMA_VERSION,
            }),
            Some(_) => Ok(()),
        }
    }

    /// Record `value` for `key` on first use; fail loudly when a recorded
    /// value differs from the configured one (hash function, KDF
    /// parameters — changing them orphans existing data).
    pub fn pin_setting(&self, key: &str, configured: &str) -> Result<(), MetaError> {
        let conn = self.lock();
        let recorded: Option<String> = conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        match recorded {
            None => {
                conn.execute(
                    "INSERT INTO settings (key, value) VALUES (?1, ?2)",
                    params![key, configured],
                )?;
                Ok(())
            }
            Some(recorded) if recorded == configured => Ok(()),
            Some(recorded) => Err(MetaError::ImmutableSettingChanged {
                key: key.to_string(),
                recorded,
                configured: configured.to_string(),
            }),
        }
    }

    /// Storage id for a name, assigned on first use.
    pub fn storage_id(&self, name: &str) -> Result<i64, MetaError> {
        let conn = self.lock();
        storage_id_in(&conn, name)
    }

    pub fn storage_name(&self, id: i64) -> Result<String, MetaError> {
        let conn = self.lock();
        conn.query_row(
            "SELECT name FROM storages WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| MetaError::not_found("storage", id))
    }

    /// Insert a fresh `incomplete` version.  Returns the row and the numeric
    /// sequence used as the `left` half of freshly allocated block uids.
    pub fn create_version(&self, new: NewVersion) -> Result<(Version, u64), MetaError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let seq = next_sequence(&tx, "version")?;
        let uid = match &new.uid {
            Some(uid) => {
                // Keep the generator ahead of explicitly chosen uids so a
                // later generated uid cannot collide.
                if let Some(number) = numeric_uid(uid) {
                    bump_sequence(&tx, "version", number)?;
                }
                uid.clone()
            }
            None => VersionUid::from_sequence(seq),
        };

        let exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM versions WHERE uid = ?1)",
            params![uid.as_str()],
            |row| row.get(0),
        )?;
        if exists {
            return Err(MetaError::AlreadyExists {
                uid: uid.as_str().to_string(),
            });
        }

        let storage_id = storage_id_in(&tx, &new.storage)?;
        let date = Utc::now();
        tx.execute(
            "INSERT INTO versions (uid, seq, date, volume, snapshot, size, block_size,
                                   storage_id, status, protected)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0)",
            params![
                uid.as_str(),
                seq as i64,
                format_timestamp(&date),
                new.volume,
                new.snapshot,
                new.size as i64,
                new.block_size as i64,
                storage_id,
                VersionStatus::Incomplete.as_str(),
            ],
        )?;
        for (name, value) in &new.labels {
            tx.execute(
                "INSERT INTO labels (version_uid, name, value) VALUES (?1, ?2, ?3)",
                params![uid.as_str(), name, value],
            )?;
        }
        tx.commit()?;

        debug!(uid = %uid, volume = %new.volume, "version created");
        let version = Version {
            uid,
            date,
            volume: new.volume,
            snapshot: new.snapshot,
            size: new.size,
            block_size: new.block_size,
            storage: new.storage,
            status: VersionStatus::Incomplete,
            protected: false,
            labels: new.labels,
            bytes_read: 0,
            bytes_written: 0,
            bytes_deduplicated: 0,
            bytes_sparse: 0,
            duration: 0,
        };
        Ok((version, seq))
    }

    pub(crate) fn insert_version_row_impl(
        &self,
        version: &Version,
        counters: VersionCounters,
    ) -> Result<(), MetaError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM versions WHERE uid = ?1)",
            params![version.uid.as_str()],
            |row| row.get(0),
        )?;
        if exists {
            return Err(MetaError::AlreadyExists {
                uid: version.uid.as_str().to_string(),
            });
        }

        let seq = next_sequence(&tx, "version")?;
        if let Some(number) = numeric_uid(&version.uid) {
            bump_sequence(&tx, "version", number)?;
        }
        let storage_id = storage_id_in(&tx, &version.storage)?;
        tx.execute(
            "INSERT INTO versions (uid, seq, date, volume, snapshot, size, block_size,
                                   storage_id, status, protected, bytes_read, bytes_written,
                                   bytes_deduplicated, bytes_sparse, duration)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                version.uid.as_str(),
                seq as i64,
                format_timestamp(&version.date),
                version.volume,
                version.snapshot,
                version.size as i64,
                version.block_size as i64,
                storage_id,
                version.status.as_str(),
                version.protected as i64,
                counters.bytes_read as i64,
                counters.bytes_written as i64,
                counters.bytes_deduplicated as i64,
                counters.bytes_sparse as i64,
                counters.duration as i64,
            ],
        )?;
        for (name, value) in &version.labels {
            tx.execute(
                "INSERT INTO labels (version_uid, name, value) VALUES (?1, ?2, ?3)",
                params![version.uid.as_str(), name, value],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn version(&self, uid: &VersionUid) -> Result<Version, MetaError> {
        let conn = self.lock();
        let version = conn
            .query_row(
                &format!("{VERSION_SELECT} WHERE v.uid = ?1"),
                params![uid.as_str()],
                version_from_row,
            )
            .optional()?
            .ok_or_else(|| MetaError::not_found("version", uid))?;
        let mut version = version?;
        version.labels = self.labels_in(&conn, uid)?;
        Ok(version)
    }

    pub fn version_sequence(&self, uid: &VersionUid) -> Result<u64, MetaError> {
        let conn = self.lock();
        conn.query_row(
            "SELECT seq FROM versions WHERE uid = ?1",
            params![uid.as_str()],
            |row| row.get::<_, i64>(0),
        )
        .optional()?
        .map(|seq| seq as u64)
        .ok_or_else(|| MetaError::not_found("version", uid))
    }

    /// All versions ordered by date then uid.  Labels are loaded with one
    /// follow-up query per version; `ls` output is human-scale.
    pub fn list_versions(&self) -> Result<Vec<Version>, MetaError> {
        let conn = self.lock();
        let mut statement = conn.prepare(&format!("{VERSION_SELECT} ORDER BY v.date, v.uid"))?;
        let rows = statement.query_map([], version_from_row)?;
        let mut versions = Vec::new();
        for row in rows {
            versions.push(row??);
        }
        drop(statement);
        for version in &mut versions {
            version.labels = self.labels_in(&conn, &version.uid)?;
        }
        Ok(versions)
    }

    fn labels_in(
        &self,
        conn: &Connection,
        uid: &VersionUid,
    ) -> Result<BTreeMap<String, String>, MetaError> {
        let mut statement =
            conn.prepare("SELECT name, value FROM labels WHERE version_uid = ?1")?;
        let rows = statement.query_map(params![uid.as_str()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut labels = BTreeMap::new();
        for row in rows {
            let (name, value) = row?;
            labels.insert(name, value);
        }
        Ok(labels)
    }

    pub fn set_status(&self, uid: &VersionUid, status: VersionStatus) -> Result<(), MetaError> {
        let changed = self.lock().execute(
            "UPDATE versions SET status = ?1 WHERE uid = ?2",
            params![status.as_str(), uid.as_str()],
        )?;
        if changed == 0 {
            return Err(MetaError::not_found("version", uid));
        }
        Ok(())
    }

    pub fn set_protected(&self, uid: &VersionUid, protected: bool) -> Result<(), MetaError> {
        let changed = self.lock().execute(
            "UPDATE versions SET protected = ?1 WHERE uid = ?2",
            params![protected as i64, uid.as_str()],
        )?;
        if changed == 0 {
            return Err(MetaError::not_found("version", uid));
        }
        Ok(())
    }

    pub fn set_label(&self, uid: &VersionUid, name: &str, value: &str) -> Result<(), MetaError> {
        // Verify existence first: an UPSERT against a missing version only
        // fails on the foreign key, which makes for a poor error.
        self.version_sequence(uid)?;
        self.lock().execute(
            "INSERT INTO labels (version_uid, name, value) VALUES (?1, ?2, ?3)
             ON CONFLICT (version_uid, name) DO UPDATE SET value = excluded.value",
            params![uid.as_str(), name, value],
        )?;
        Ok(())
    }

    pub fn remove_label(&self, uid: &VersionUid, name: &str) -> Result<(), MetaError> {
        self.version_sequence(uid)?;
        self.lock().execute(
            "DELETE FROM labels WHERE version_uid = ?1 AND name = ?2",
            params![uid.as_str(), name],
        )?;
        Ok(())
    }

    /// Complete a backup: record counters and flip `incomplete → valid`.
    pub fn finish_version(
        &self,
        uid: &VersionUid,
        counters: VersionCounters,
    ) -> Result<(), MetaError> {
        let changed = self.lock().execute(
            "UPDATE versions SET status = ?1, bytes_read = ?2, bytes_written = ?3,
                                 bytes_deduplicated = ?4, bytes_sparse = ?5, duration = ?6
             WHERE uid = ?7",
            params![
                VersionStatus::Valid.as_str(),
                counters.bytes_read as i64,
                counters.bytes_written as i64,
                counters.bytes_deduplicated as i64,
                counters.bytes_sparse as i64,
                counters.duration as i64,
                uid.as_str(),
            ],
        )?;
        if changed == 0 {
            return Err(MetaError::not_found("version", uid));
        }
        Ok(())
    }

    /// Bulk-insert block rows inside one transaction.  Callers batch to
    /// bound transaction size; rows may arrive in any index order.
    pub fn insert_blocks(&self, uid: &VersionUid, blocks: &[Block]) -> Result<(), MetaError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        {
            let mut statement = tx.prepare_cached(
                "INSERT INTO blocks (version_uid, idx, uid_left, uid_right, checksum, size, valid)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for block in blocks {
                statement.execute(params![
                    uid.as_str(),
                    block.idx as i64,
                    block.uid.map(|u| u.left as i64),
                    block.uid.map(|u| u.right as i64),
                    block.checksum.as_ref().map(|c| c.as_bytes().to_vec()),
                    block.size as i64,
                    block.valid as i64,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn block(&self, uid: &VersionUid, idx: u64) -> Result<Block, MetaError> {
        let conn = self.lock();
        conn.query_row(
            "SELECT idx, uid_left, uid_right, checksum, size, valid
             FROM blocks WHERE version_uid = ?1 AND idx = ?2",
            params![uid.as_str(), idx as i64],
            block_from_row,
        )
        .optional()?
        .ok_or_else(|| MetaError::not_found("block", format!("{uid}/{idx}")))?
    }

    pub fn block_count(&self, uid: &VersionUid) -> Result<u64, MetaError> {
        let conn = self.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM blocks WHERE version_uid = ?1",
            params![uid.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Iterate a version's blocks in index order without materializing the
    /// full list.
    pub fn stream_blocks(&self, uid: &VersionUid) -> BlockIter {
        BlockIter {
            store: self.clone(),
            version_uid: uid.clone(),
            next_idx: 0,
            buffer: VecDeque::new(),
            done: false,
        }
    }

    /// Dedup lookup: a valid, non-sparse block row with this checksum whose
    /// version lives on the given storage.
    pub fn find_valid_block_by_checksum(
        &self,
        checksum: &Checksum,
        storage_id: i64,
    ) -> Result<Option<BlockUid>, MetaError> {
        let conn = self.lock();
        let found = conn
            .query_row(
                "SELECT b.uid_left, b.uid_right
                 FROM blocks b JOIN versions v ON v.uid = b.version_uid
                 WHERE b.checksum = ?1 AND v.storage_id = ?2
                   AND b.valid = 1 AND b.uid_left IS NOT NULL
                 LIMIT 1",
                params![checksum.as_bytes(), storage_id],
                |row| {
                    Ok(BlockUid::new(
                        row.get::<_, i64>(0)? as u64,
                        row.get::<_, i64>(1)? as u64,
                    ))
                },
            )
            .optional()?;
        Ok(found)
    }

    /// Invalidate every block row referencing a stored object and cascade
    /// `invalid` onto every version that contains one of them, atomically.
    pub fn mark_block_invalid(&self, block_uid: &BlockUid) -> Result<Vec<VersionUid>, MetaError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE blocks SET valid = 0 WHERE uid_left = ?1 AND uid_right = ?2",
            params![block_uid.left as i64, block_uid.right as i64],
        )?;
        let mut affected = Vec::new();
        {
            let mut statement = tx.prepare(
                "SELECT DISTINCT version_uid FROM blocks
                 WHERE uid_left = ?1 AND uid_right = ?2",
            )?;
            let rows = statement.query_map(
                params![block_uid.left as i64, block_uid.right as i64],
                |row| row.get::<_, String>(0),
            )?;
            for row in rows {
                affected.push(VersionUid::new(row?));
            }
        }
        for uid in &affected {
            tx.execute(
                "UPDATE versions SET status = ?1 WHERE uid = ?2",
                params![VersionStatus::Invalid.as_str(), uid.as_str()],
            )?;
        }
        tx.commit()?;
        Ok(affected)
    }

    /// A full deep-scrub pass succeeded: every block verified, so the
    /// version may return to `valid`.
    pub fn mark_version_fully_valid(&self, uid: &VersionUid) -> Result<(), MetaError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE blocks SET valid = 1 WHERE version_uid = ?1",
            params![uid.as_str()],
        )?;
        let changed = tx.execute(
            "UPDATE versions SET status = ?1 WHERE uid = ?2",
            params![VersionStatus::Valid.as_str(), uid.as_str()],
        )?;
        if changed == 0 {
            return Err(MetaError::not_found("version", uid));
        }
        tx.commit()?;
        Ok(())
    }

    /// Logically remove a version: delete its rows and enqueue every stored
    /// object it referenced as a deletion candidate.  Returns the number of
    /// candidates enqueued.
    pub fn remove_version(&self, uid: &VersionUid) -> Result<usize, MetaError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let storage_id: Option<i64> = tx
            .query_row(
                "SELECT storage_id FROM versions WHERE uid = ?1",
                params![uid.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        let storage_id = storage_id.ok_or_else(|| MetaError::not_found("version", uid))?;

        let now = format_timestamp(&Utc::now());
        let enqueued = tx.execute(
            "INSERT OR IGNORE INTO deletion_candidates (uid_left, uid_right, storage_id, proposed_at)
             SELECT DISTINCT uid_left, uid_right, ?1, ?2 FROM blocks
             WHERE version_uid = ?3 AND uid_left IS NOT NULL",
            params![storage_id, now, uid.as_str()],
        )?;
        tx.execute("DELETE FROM versions WHERE uid = ?1", params![uid.as_str()])?;
        tx.commit()?;

        info!(uid = %uid, enqueued, "version removed");
        Ok(enqueued)
    }

    /// Deletion candidates whose grace window expired, with their storage
    /// names.
    pub fn due_deletion_candidates(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<(BlockUid, String)>, MetaError> {
        let conn = self.lock();
        let mut statement = conn.prepare(
            "SELECT c.uid_left, c.uid_right, s.name
             FROM deletion_candidates c JOIN storages s ON s.id = c.storage_id
             WHERE c.proposed_at <= ?1
             ORDER BY c.proposed_at",
        )?;
        let rows = statement.query_map(params![format_timestamp(&cutoff)], |row| {
            Ok((
                BlockUid::new(row.get::<_, i64>(0)? as u64, row.get::<_, i64>(1)? as u64),
                row.get::<_, String>(2)?,
            ))
        })?;
        let mut candidates = Vec::new();
        for row in rows {
            candidates.push(row?);
        }
        Ok(candidates)
    }

    pub fn is_block_referenced(&self, block_uid: &BlockUid) -> Result<bool, MetaError> {
        let conn = self.lock();
        let referenced: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM blocks WHERE uid_left = ?1 AND uid_right = ?2)",
            params![block_uid.left as i64, block_uid.right as i64],
            |row| row.get(0),
        )?;
        Ok(referenced)
    }

    /// How many block rows reference a stored object (shared-usage
    /// attribution for `storage-usage`).
    pub fn block_reference_count(&self, block_uid: &BlockUid) -> Result<u64, MetaError> {
        let conn = self.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM blocks WHERE uid_left = ?1 AND uid_right = ?2",
            params![block_uid.left as i64, block_uid.right as i64],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// How many distinct versions reference a stored object.
    pub fn block_version_count(&self, block_uid: &BlockUid) -> Result<u64, MetaError> {
        let conn = self.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(DISTINCT version_uid) FROM blocks
             WHERE uid_left = ?1 AND uid_right = ?2",
            params![block_uid.left as i64, block_uid.right as i64],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    pub fn drop_deletion_candidate(&self, block_uid: &BlockUid) -> Result<(), MetaError> {
        self.lock().execute(
            "DELETE FROM deletion_candidates WHERE uid_left = ?1 AND uid_right = ?2",
            params![block_uid.left as i64, block_uid.right as i64],
        )?;
        Ok(())
    }
}

/// Paging iterator over a version's blocks in index order.
pub struct BlockIter {
    store: MetaStore,
    version_uid: VersionUid,
    next_idx: u64,
    buffer: VecDeque<Block>,
    done: bool,
}

impl BlockIter {
    fn refill(&mut self) -> Result<(), MetaError> {
        let conn = self.store.lock();
        let mut statement = conn.prepare_cached(
            "SELECT idx, uid_left, uid_right, checksum, size, valid
             FROM blocks WHERE version_uid = ?1 AND idx >= ?2
             ORDER BY idx LIMIT ?3",
        )?;
        let rows = statement.query_map(
            params![
                self.version_uid.as_str(),
                self.next_idx as i64,
                BLOCK_BATCH as i64
            ],
            block_from_row,
        )?;
        let mut fetched = 0;
        for row in rows {
            let block = row??;
            self.next_idx = block.idx + 1;
            self.buffer.push_back(block);
            fetched += 1;
        }
        if fetched < BLOCK_BATCH {
            self.done = true;
        }
        Ok(())
    }
}

impl Iterator for BlockIter {
    type Item = Result<Block, MetaError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.done {
            if let Err(err) = self.refill() {
                self.done = true;
                return Some(Err(err));
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}

const VERSION_SELECT: &str =
    "SELECT v.uid, v.date, v.volume, v.snapshot, v.size, v.block_size, s.name,
            v.status, v.protected, v.bytes_read, v.bytes_written,
            v.bytes_deduplicated, v.bytes_sparse, v.duration
     FROM versions v JOIN storages s ON s.id = v.storage_id";

fn version_from_row(row: &Row<'_>) -> rusqlite::Result<Result<Version, MetaError>> {
    let date_text: String = row.get(1)?;
    let status_text: String = row.get(7)?;
    Ok((|| {
        let date = parse_timestamp(&date_text)?;
        let status = VersionStatus::parse(&status_text)
            .ok_or_else(|| MetaError::malformed(format!("unknown status {status_text:?}")))?;
        Ok(Version {
            uid: VersionUid::new(row.get::<_, String>(0).map_err(MetaError::from)?),
            date,
            volume: row.get(2).map_err(MetaError::from)?,
            snapshot: row.get(3).map_err(MetaError::from)?,
            size: row.get::<_, i64>(4).map_err(MetaError::from)? as u64,
            block_size: row.get::<_, i64>(5).map_err(MetaError::from)? as u32,
            storage: row.get(6).map_err(MetaError::from)?,
            status,
            protected: row.get(8).map_err(MetaError::from)?,
            labels: BTreeMap::new(),
            bytes_read: row.get::<_, i64>(9).map_err(MetaError::from)? as u64,
            bytes_written: row.get::<_, i64>(10).map_err(MetaError::from)? as u64,
            bytes_deduplicated: row.get::<_, i64>(11).map_err(MetaError::from)? as u64,
            bytes_sparse: row.get::<_, i64>(12).map_err(MetaError::from)? as u64,
            duration: row.get::<_, i64>(13).map_err(MetaError::from)? as u64,
        })
    })())
}

fn block_from_row(row: &Row<'_>) -> rusqlite::Result<Result<Block, MetaError>> {
    let left: Option<i64> = row.get(1)?;
    let right: Option<i64> = row.get(2)?;
    let checksum: Option<Vec<u8>> = row.get(3)?;
    Ok((|| {
        let uid = match (left, right) {
            (Some(left), Some(right)) => Some(BlockUid::new(left as u64, right as u64)),
            (None, None) => None,
            _ => return Err(MetaError::malformed("half-null block uid")),
        };
        if uid.is_some() != checksum.is_some() {
            return Err(MetaError::malformed("sparse block with checksum or vice versa"));
        }
        Ok(Block {
            idx: row.get::<_, i64>(0).map_err(MetaError::from)? as u64,
            uid,
            checksum: checksum.map(Checksum::from_bytes),
            size: row.get::<_, i64>(4).map_err(MetaError::from)? as u32,
            valid: row.get(5).map_err(MetaError::from)?,
        })
    })())
}

pub(crate) fn parse_timestamp(text: &str) -> Result<DateTime<Utc>, MetaError> {
    DateTime::parse_from_rfc3339(text)
        .map(|date| date.with_timezone(&Utc))
        .map_err(|err| MetaError::malformed(format!("bad timestamp {text:?}: {err}")))
}

fn schema_version(conn: &Connection) -> Result<Option<i64>, MetaError> {
    let table_exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'schema_info')",
        [],
        |row| row.get(0),
    )?;
    if !table_exists {
        return Ok(None);
    }
    let version: i64 = conn.query_row("SELECT version FROM schema_info", [], |row| row.get(0))?;
    Ok(Some(version))
}

fn apply_migration(_tx: &rusqlite::Transaction<'_>, from: i64) -> Result<(), MetaError> {
    // Future generations rebuild tables and move rows here, one step per
    // schema version.
    Err(MetaError::malformed(format!(
        "no migration path from schema version {from}"
    )))
}

fn storage_id_in(conn: &Connection, name: &str) -> Result<i64, MetaError> {
    conn.execute(
        "INSERT OR IGNORE INTO storages (name) VALUES (?1)",
        params![name],
    )?;
    let id: i64 = conn.query_row(
        "SELECT id FROM storages WHERE name = ?1",
        params![name],
        |row| row.get(0),
    )?;
    Ok(id)
}

fn next_sequence(conn: &Connection, name: &str) -> Result<u64, MetaError> {
    conn.execute(
        "INSERT INTO sequences (name, value) VALUES (?1, 1)
         ON CONFLICT (name) DO UPDATE SET value = value + 1",
        params![name],
    )?;
    let value: i64 = conn.query_row(
        "SELECT value FROM sequences WHERE name = ?1",
        params![name],
        |row| row.get(0),
    )?;
    Ok(value as u64)
}

fn bump_sequence(conn: &Connection, name: &str, at_least: u64) -> Result<(), MetaError> {
    conn.execute(
        "INSERT INTO sequences (name, value) VALUES (?1, ?2)
         ON CONFLICT (name) DO UPDATE SET value = MAX(value, excluded.value)",
        params![name, at_least as i64],
    )?;
    Ok(())
}

fn numeric_uid(uid: &VersionUid) -> Option<u64> {
    uid.as_str().strip_prefix('V')?.parse().ok()
}
