use std::path::PathBuf;

use benji_common::ConfigError;
use thiserror::Error;

/// Source IO failures.
#[derive(Debug, Error)]
pub enum IoError {
    #[error("Invalid URI {uri:?}: {reason}")]
    InvalidUri { uri: String, reason: &'static str },

    #[error("io module {module:?} is not built into this binary")]
    ModuleUnavailable { module: String },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Refusing to overwrite non-empty {path} (use --force)")]
    WouldClobber { path: PathBuf },

    #[error("Read of {length} bytes at offset {offset} failed: {source}")]
    Read {
        offset: u64,
        length: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("Write of {length} bytes at offset {offset} failed: {source}")]
    Write {
        offset: u64,
        length: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("Flush failed: {source}")]
    Flush {
        #[source]
        source: std::io::Error,
    },

    #[error("Hints file {path} is malformed: {reason}")]
    MalformedHints { path: PathBuf, reason: String },

    #[error("Read beyond end of source (offset {offset}, length {length}, size {size})")]
    OutOfRange { offset: u64, length: u64, size: u64 },
}

impl IoError {
    pub fn invalid_uri(uri: &str, reason: &'static str) -> Self {
        IoError::InvalidUri {
            uri: uri.to_string(),
            reason,
        }
    }
}
