//! Sharded on-disk read cache for stored objects.
//!
//! Objects are bucketed into shards by a hash of their key; each shard is a
//! directory with an LRU bounded by `maximumSize / shards` bytes.  The cache
//! holds the raw stored bytes (post-transform), so a hit skips the backend
//! round trip but still goes through HMAC and inverse-transform checks.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ReadCacheConfig {
    pub directory: PathBuf,
    pub maximum_size: u64,
    #[serde(default = "default_shards")]
    pub shards: u32,
}

fn default_shards() -> u32 {
    16
}

pub struct ReadCache {
    directory: PathBuf,
    shard_budget: u64,
    shards: Vec<Mutex<Shard>>,
}

#[derive(Default)]
struct Shard {
    entries: HashMap<String, u64>,
    lru: VecDeque<String>,
    total: u64,
}

impl ReadCache {
    pub fn open(config: &ReadCacheConfig) -> std::io::Result<Self> {
        let shard_count = config.shards.max(1) as usize;
        let mut shards = Vec::with_capacity(shard_count);
        for index in 0..shard_count {
            let dir = config.directory.join(format!("{index:02x}"));
            std::fs::create_dir_all(&dir)?;
            shards.push(Mutex::new(Shard::scan(&dir)?));
        }
        Ok(Self {
            directory: config.directory.clone(),
            shard_budget: config.maximum_size / shard_count as u64,
            shards,
        })
    }

    fn shard_index(&self, key: &str) -> usize {
        let digest = Sha256::digest(key.as_bytes());
        (digest[0] as usize) % self.shards.len()
    }

    fn entry_path(&self, index: usize, file: &str) -> PathBuf {
        self.directory.join(format!("{index:02x}")).join(file)
    }

    fn file_name(key: &str) -> String {
        hex::encode(Sha256::digest(key.as_bytes()))
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let index = self.shard_index(key);
        let file = Self::file_name(key);
        let mut shard = self.shards[index].lock().expect("cache shard mutex poisoned");
        if !shard.entries.contains_key(&file) {
            return None;
        }
        match std::fs::read(self.entry_path(index, &file)) {
            Ok(data) => {
                shard.touch(&file);
                Some(data)
            }
            Err(err) => {
                warn!(key, error = %err, "evicting unreadable cache entry");
                shard.forget(&file);
                None
            }
        }
    }

    pub fn put(&self, key: &str, data: &[u8]) {
        if data.len() as u64 > self.shard_budget {
            return;
        }
        let index = self.shard_index(key);
        let file = Self::file_name(key);
        let path = self.entry_path(index, &file);

        let mut shard = self.shards[index].lock().expect("cache shard mutex poisoned");
        while shard.total + data.len() as u64 > self.shard_budget {
            let Some(victim) = shard.lru.pop_front() else {
                break;
            };
            if let Some(size) = shard.entries.remove(&victim) {
                shard.total -= size;
                let _ = std::fs::remove_file(self.entry_path(index, &victim));
                debug!(victim, "evicted cache entry");
            }
        }

        if std::fs::write(&path, data).is_ok() {
            shard.insert(file, data.len() as u64);
        }
    }

    pub fn invalidate(&self, key: &str) {
        let index = self.shard_index(key);
        let file = Self::file_name(key);
        let mut shard = self.shards[index].lock().expect("cache shard mutex poisoned");
        shard.forget(&file);
        let _ = std::fs::remove_file(self.entry_path(index, &file));
    }
}

impl Shard {
    /// Rebuild the index from whatever survived the last process, oldest
    /// first so eviction order is sensible.
    fn scan(dir: &Path) -> std::io::Result<Self> {
        let mut found: Vec<(String, u64, std::time::SystemTime)> = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if !meta.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            let mtime = meta.modified().unwrap_or(std::time::SystemTime::UNIX_EPOCH);
            found.push((name, meta.len(), mtime));
        }
        found.sort_by_key(|(_, _, mtime)| *mtime);

        let mut shard = Shard::default();
        for (name, size, _) in found {
            shard.insert(name, size);
        }
        Ok(shard)
    }

    fn insert(&mut self, file: String, size: u64) {
        if let Some(old) = self.entries.insert(file.clone(), size) {
            self.total -= old;
            self.lru.retain(|name| name != &file);
        }
        self.total += size;
        self.lru.push_back(file);
    }

    fn touch(&mut self, file: &str) {
        if let Some(position) = self.lru.iter().position(|name| name == file) {
            let name = self.lru.remove(position).expect("position just found");
            self.lru.push_back(name);
        }
    }

    fn forget(&mut self, file: &str) {
        if let Some(size) = self.entries.remove(file) {
            self.total -= size;
        }
        self.lru.retain(|name| name != file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(dir: &Path, maximum_size: u64) -> ReadCache {
        ReadCache::open(&ReadCacheConfig {
            directory: dir.to_path_buf(),
            maximum_size,
            shards: 1,
        })
        .unwrap()
    }

    #[test]
    fn hit_after_put() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path(), 1024);
        assert!(cache.get("blocks/00/a").is_none());
        cache.put("blocks/00/a", b"payload");
        assert_eq!(cache.get("blocks/00/a").unwrap(), b"payload");
    }

    #[test]
    fn eviction_is_least_recently_used() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path(), 1000);
        cache.put("a", &[1u8; 400]);
        cache.put("b", &[2u8; 400]);
        // Touch `a` so `b` becomes the eviction victim.
        assert!(cache.get("a").is_some());
        cache.put("c", &[3u8; 400]);

        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = cache(dir.path(), 1024);
            cache.put("persistent", b"still here");
        }
        let cache = cache(dir.path(), 1024);
        assert_eq!(cache.get("persistent").unwrap(), b"still here");
    }

    #[test]
    fn oversized_entries_are_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path(), 100);
        cache.put("big", &[0u8; 200]);
        assert!(cache.get("big").is_none());
    }
}
