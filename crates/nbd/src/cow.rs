//! On-disk copy-on-write store for one read-write export session.
//!
//! Dirtied block contents live as one file per index under a
//! session-unique directory.  At disconnect the server hands the dirty set
//! to the engine for fixation and discards the directory.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Mutex;

use benji_common::VersionUid;

pub struct CowStore {
    directory: PathBuf,
    dirty: Mutex<BTreeSet<u64>>,
}

impl CowStore {
    pub fn create(root: &std::path::Path, original: &VersionUid) -> std::io::Result<Self> {
        let directory = root.join(format!("cow-{}-{}", original, std::process::id()));
        std::fs::create_dir_all(&directory)?;
        Ok(Self {
            directory,
            dirty: Mutex::new(BTreeSet::new()),
        })
    }

    fn block_path(&self, idx: u64) -> PathBuf {
        self.directory.join(format!("{idx:016x}"))
    }

    pub fn write_block(&self, idx: u64, data: &[u8]) -> std::io::Result<()> {
        std::fs::write(self.block_path(idx), data)?;
        self.dirty.lock().expect("cow dirty set mutex poisoned").insert(idx);
        Ok(())
    }

    /// Current content of a dirtied block, `None` if the index is clean.
    pub fn read_block(&self, idx: u64) -> std::io::Result<Option<Vec<u8>>> {
        if !self
            .dirty
            .lock()
            .expect("cow dirty set mutex poisoned")
            .contains(&idx)
        {
            return Ok(None);
        }
        Ok(Some(std::fs::read(self.block_path(idx))?))
    }

    pub fn dirty_indices(&self) -> BTreeSet<u64> {
        self.dirty.lock().expect("cow dirty set mutex poisoned").clone()
    }

    pub fn is_dirty(&self) -> bool {
        !self.dirty.lock().expect("cow dirty set mutex poisoned").is_empty()
    }

    /// Flush session files to disk (NBD_CMD_FLUSH).
    pub fn sync(&self) -> std::io::Result<()> {
        for idx in self.dirty_indices() {
            let file = std::fs::File::open(self.block_path(idx))?;
            file.sync_all()?;
        }
        Ok(())
    }

    pub fn discard(self) {
        let _ = std::fs::remove_dir_all(&self.directory);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_dirty_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let store = CowStore::create(dir.path(), &VersionUid::new("V0000000001")).unwrap();

        assert!(!store.is_dirty());
        assert_eq!(store.read_block(3).unwrap(), None);

        store.write_block(3, b"dirty content").unwrap();
        assert!(store.is_dirty());
        assert_eq!(store.read_block(3).unwrap().unwrap(), b"dirty content");
        assert_eq!(store.dirty_indices(), std::collections::BTreeSet::from([3]));

        // Overwrite keeps a single dirty entry.
        store.write_block(3, b"newer").unwrap();
        assert_eq!(store.read_block(3).unwrap().unwrap(), b"newer");
        assert_eq!(store.dirty_indices().len(), 1);
    }

    #[test]
    fn discard_removes_the_session_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = CowStore::create(dir.path(), &VersionUid::new("V0000000002")).unwrap();
        store.write_block(0, b"x").unwrap();
        store.discard();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
