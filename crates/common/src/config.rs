//! Configuration document.
//!
//! A single YAML file drives every process.  Search order when no explicit
//! path is given: `/etc/benji.yaml`, `/etc/benji/benji.yaml`,
//! `~/.benji.yaml`, `~/benji.yaml`.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::hash::HashFunction;
use crate::DEFAULT_BLOCK_SIZE;

/// Supported configuration document version.
pub const CONFIGURATION_VERSION: &str = "1";

/// Startup-fatal configuration problems.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("No configuration file found (searched {searched:?})")]
    NotFound { searched: Vec<PathBuf> },

    #[error("Failed to read configuration file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed configuration: {source}")]
    Malformed {
        #[from]
        source: serde_yaml::Error,
    },

    #[error("Unsupported configurationVersion {found:?} (expected {CONFIGURATION_VERSION:?})")]
    UnsupportedVersion { found: String },

    #[error("Invalid hash function spec {spec:?}")]
    InvalidHashFunction { spec: String },

    #[error("Unknown module {module:?} for {kind} {name:?}")]
    UnknownModule {
        kind: &'static str,
        name: String,
        module: String,
    },

    #[error("{kind} {name:?} is declared more than once")]
    DuplicateName { kind: &'static str, name: String },

    #[error("defaultStorage {name:?} is not a declared storage")]
    UnknownDefaultStorage { name: String },

    #[error("Contradictory options: {reason}")]
    Contradiction { reason: String },
}

impl ConfigError {
    pub fn invalid_hash(spec: &str) -> Self {
        ConfigError::InvalidHashFunction {
            spec: spec.to_string(),
        }
    }

    pub fn contradiction(reason: impl Into<String>) -> Self {
        ConfigError::Contradiction {
            reason: reason.into(),
        }
    }
}

/// One `ios`/`storages`/`transforms` entry: a named instance of a module
/// with module-specific configuration resolved by the owning crate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleConfig {
    pub name: String,
    pub module: String,
    #[serde(default)]
    pub configuration: serde_yaml::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct NbdConfig {
    /// Address the NBD server binds to.  Anything other than loopback is
    /// allowed but warned about: the protocol has no auth and no transport
    /// encryption.
    #[serde(default = "default_nbd_bind")]
    pub bind_address: String,
    #[serde(default = "default_nbd_cache_dir")]
    pub cache_directory: PathBuf,
    /// Upper bound of the decoded-block cache in bytes.
    #[serde(default = "default_nbd_cache_size")]
    pub cache_maximum_size: u64,
    /// Stalled negotiations are abandoned after this many seconds.
    #[serde(default = "default_nbd_negotiation_timeout")]
    pub negotiation_timeout_seconds: u64,
}

fn default_nbd_bind() -> String {
    "127.0.0.1:10809".to_string()
}

fn default_nbd_cache_dir() -> PathBuf {
    PathBuf::from("/var/cache/benji/nbd")
}

fn default_nbd_cache_size() -> u64 {
    256 * 1024 * 1024
}

fn default_nbd_negotiation_timeout() -> u64 {
    30
}

impl Default for NbdConfig {
    fn default() -> Self {
        Self {
            bind_address: default_nbd_bind(),
            cache_directory: default_nbd_cache_dir(),
            cache_maximum_size: default_nbd_cache_size(),
            negotiation_timeout_seconds: default_nbd_negotiation_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Config {
    pub configuration_version: String,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    #[serde(default = "default_block_size")]
    pub block_size: u32,
    #[serde(default = "default_hash_function")]
    pub hash_function: String,
    #[serde(default = "default_process_name")]
    pub process_name: String,
    /// Days a version must age before `rm`/`enforce` may remove it.
    #[serde(default = "default_disallow_remove_when_younger")]
    pub disallow_remove_when_younger: u32,
    /// Database connection URL, e.g. `sqlite:/var/lib/benji/benji.sqlite`.
    pub database_engine: String,
    #[serde(default)]
    pub ios: Vec<ModuleConfig>,
    pub storages: Vec<ModuleConfig>,
    pub default_storage: String,
    #[serde(default)]
    pub transforms: Vec<ModuleConfig>,
    #[serde(default)]
    pub nbd: NbdConfig,
}

fn default_block_size() -> u32 {
    DEFAULT_BLOCK_SIZE
}

fn default_hash_function() -> String {
    "BLAKE2b,digest_bits=256".to_string()
}

fn default_process_name() -> String {
    "benji".to_string()
}

fn default_disallow_remove_when_younger() -> u32 {
    6
}

impl Config {
    /// Load from an explicit path or the standard search order.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => {
                let candidates = search_paths();
                match candidates.iter().find(|p| p.exists()) {
                    Some(found) => found.clone(),
                    None => {
                        return Err(ConfigError::NotFound {
                            searched: candidates,
                        })
                    }
                }
            }
        };

        let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.configuration_version != CONFIGURATION_VERSION {
            return Err(ConfigError::UnsupportedVersion {
                found: self.configuration_version.clone(),
            });
        }

        HashFunction::parse(&self.hash_function)?;

        if self.block_size == 0 {
            return Err(ConfigError::contradiction("blockSize must be > 0"));
        }
        if !self.block_size.is_power_of_two() {
            warn!(block_size = self.block_size, "blockSize is not a power of two");
        }

        for (kind, entries) in [
            ("io", &self.ios),
            ("storage", &self.storages),
            ("transform", &self.transforms),
        ] {
            let mut seen = BTreeSet::new();
            for entry in entries.iter() {
                if !seen.insert(entry.name.as_str()) {
                    return Err(ConfigError::DuplicateName {
                        kind,
                        name: entry.name.clone(),
                    });
                }
            }
        }

        if !self.storages.iter().any(|s| s.name == self.default_storage) {
            return Err(ConfigError::UnknownDefaultStorage {
                name: self.default_storage.clone(),
            });
        }

        Ok(())
    }

    /// Parsed fingerprint function.  `validate` guarantees this succeeds.
    pub fn hash(&self) -> HashFunction {
        HashFunction::parse(&self.hash_function).expect("validated on load")
    }

    pub fn storage(&self, name: &str) -> Option<&ModuleConfig> {
        self.storages.iter().find(|s| s.name == name)
    }

    pub fn transform(&self, name: &str) -> Option<&ModuleConfig> {
        self.transforms.iter().find(|t| t.name == name)
    }

    pub fn io(&self, name: &str) -> Option<&ModuleConfig> {
        self.ios.iter().find(|i| i.name == name)
    }
}

fn search_paths() -> Vec<PathBuf> {
    let mut paths = vec![
        PathBuf::from("/etc/benji.yaml"),
        PathBuf::from("/etc/benji/benji.yaml"),
    ];
    if let Some(home) = std::env::var_os("HOME") {
        let home = PathBuf::from(home);
        paths.push(home.join(".benji.yaml"));
        paths.push(home.join("benji.yaml"));
    }
    paths
}

/// `BENJI_EXPERIMENTAL=1` unlocks experimental surfaces (currently the
/// ECC transform).
pub fn experimental_enabled() -> bool {
    std::env::var("BENJI_EXPERIMENTAL").map(|v| v == "1").unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
configurationVersion: "1"
databaseEngine: "sqlite:/tmp/benji-test.sqlite"
defaultStorage: local
storages:
  - name: local
    module: file
    configuration:
      path: /tmp/benji-objects
"#;

    #[test]
    fn minimal_document_parses_with_defaults() {
        let config = Config::parse(MINIMAL).unwrap();
        assert_eq!(config.block_size, DEFAULT_BLOCK_SIZE);
        assert_eq!(config.hash_function, "BLAKE2b,digest_bits=256");
        assert_eq!(config.disallow_remove_when_younger, 6);
        assert_eq!(config.process_name, "benji");
        assert!(config.ios.is_empty());
        assert_eq!(config.nbd.bind_address, "127.0.0.1:10809");
    }

    #[test]
    fn rejects_wrong_configuration_version() {
        let text = MINIMAL.replace("\"1\"", "\"2\"");
        assert!(matches!(
            Config::parse(&text),
            Err(ConfigError::UnsupportedVersion { .. })
        ));
    }

    #[test]
    fn rejects_missing_default_storage() {
        let text = MINIMAL.replace("defaultStorage: local", "defaultStorage: remote");
        assert!(matches!(
            Config::parse(&text),
            Err(ConfigError::UnknownDefaultStorage { .. })
        ));
    }

    #[test]
    fn rejects_duplicate_storage_names() {
        let text = format!(
            "{MINIMAL}  - name: local\n    module: file\n    configuration:\n      path: /tmp/other\n"
        );
        assert!(matches!(
            Config::parse(&text),
            Err(ConfigError::DuplicateName { .. })
        ));
    }

    #[test]
    fn rejects_bad_hash_function() {
        let text = format!("{MINIMAL}hashFunction: \"MD5\"\n");
        assert!(matches!(
            Config::parse(&text),
            Err(ConfigError::InvalidHashFunction { .. })
        ));
    }
}
