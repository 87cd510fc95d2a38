//! Object-store backend over a local directory tree.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::StorageError;
use crate::Backend;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileBackendConfig {
    pub path: PathBuf,
}

pub struct FileBackend {
    root: PathBuf,
}

impl FileBackend {
    pub fn open(config: &FileBackendConfig) -> Result<Self, StorageError> {
        std::fs::create_dir_all(&config.path).map_err(|source| StorageError::Backend {
            op: "create root",
            key: config.path.display().to_string(),
            attempts: 1,
            source,
        })?;
        Ok(Self {
            root: config.path.clone(),
        })
    }

    fn object_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

impl Backend for FileBackend {
    fn put(&self, key: &str, data: &[u8]) -> Result<(), std::io::Error> {
        let path = self.object_path(key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // Write-then-rename so readers never observe a torn object.
        let staging = PathBuf::from(format!("{}.tmp", path.display()));
        std::fs::write(&staging, data)?;
        std::fs::rename(&staging, &path)?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, std::io::Error> {
        std::fs::read(self.object_path(key))
    }

    fn size(&self, key: &str) -> Result<u64, std::io::Error> {
        Ok(std::fs::metadata(self.object_path(key))?.len())
    }

    fn delete(&self, key: &str) -> Result<(), std::io::Error> {
        match std::fs::remove_file(self.object_path(key)) {
            Ok(()) => Ok(()),
            // Deleting an already-gone object is success: cleanup retries.
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<(String, u64)>, std::io::Error> {
        let mut found = Vec::new();
        let base = self.root.clone();
        walk(&base, &base, &mut |relative, size| {
            if relative.starts_with(prefix) {
                found.push((relative.to_string(), size));
            }
        })?;
        found.sort();
        Ok(found)
    }
}

fn walk(
    root: &Path,
    dir: &Path,
    visit: &mut impl FnMut(&str, u64),
) -> Result<(), std::io::Error> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let meta = entry.metadata()?;
        if meta.is_dir() {
            walk(root, &path, visit)?;
        } else if meta.is_file() {
            let relative = path
                .strip_prefix(root)
                .expect("walk stays under root")
                .to_string_lossy()
                .replace('\\', "/");
            visit(&relative, meta.len());
        }
    }
    Ok(())
}
