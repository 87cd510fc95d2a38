//! Source IO capability set.
//!
//! Sources and restore destinations are addressed by URI; the scheme selects
//! a configured io instance (`ios` entry whose `name` matches).  Only the
//! `file` module ships in-tree; `rbd`, `rbdaio` and `iscsi` are recognized
//! names whose adapters live out of tree.

use std::sync::Arc;

use benji_common::{Config, ConfigError, ModuleConfig};

pub mod file;
pub mod hints;

mod error;

pub use error::IoError;
pub use hints::{parse_hints, read_hints_file, Hint};

/// A thread-safe handle on one open source or destination image.
///
/// Adapters may run internal concurrency up to their configured
/// `simultaneousReads`/`simultaneousWrites`; the engine sizes its worker
/// pools from those budgets and otherwise treats the handle as opaque.
pub trait IoAdapter: Send + Sync {
    /// URI this handle was opened from, for logging.
    fn uri(&self) -> &str;

    fn size(&self) -> Result<u64, IoError>;

    fn block_size_hint(&self) -> Option<u32> {
        None
    }

    /// Read exactly `length` bytes at `offset`.
    fn read(&self, offset: u64, length: usize) -> Result<Vec<u8>, IoError>;

    fn write(&self, offset: u64, data: &[u8]) -> Result<(), IoError>;

    /// Deallocate a range on thin targets.  Reads of a discarded range
    /// return zeros.
    fn discard(&self, offset: u64, length: u64) -> Result<(), IoError>;

    fn flush(&self) -> Result<(), IoError>;

    fn simultaneous_reads(&self) -> usize;

    fn simultaneous_writes(&self) -> usize;
}

/// How a handle is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    /// Open for restore: the adapter grows the target to `size` bytes.
    /// Refuses existing non-empty targets unless `force`.
    Write { size: u64, force: bool },
}

/// A parsed source/destination URI: `scheme:rest[?k=v&...]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uri {
    pub scheme: String,
    pub rest: String,
    pub query: Vec<(String, String)>,
}

impl Uri {
    pub fn parse(text: &str) -> Result<Self, IoError> {
        let (scheme, remainder) = text
            .split_once(':')
            .ok_or_else(|| IoError::invalid_uri(text, "missing scheme"))?;
        if scheme.is_empty() {
            return Err(IoError::invalid_uri(text, "empty scheme"));
        }

        let (rest, query_text) = match remainder.split_once('?') {
            Some((rest, query)) => (rest, Some(query)),
            None => (remainder, None),
        };
        if rest.is_empty() {
            return Err(IoError::invalid_uri(text, "empty path"));
        }

        let mut query = Vec::new();
        if let Some(query_text) = query_text {
            for pair in query_text.split('&').filter(|p| !p.is_empty()) {
                let (key, value) = pair
                    .split_once('=')
                    .ok_or_else(|| IoError::invalid_uri(text, "query parameter without value"))?;
                query.push((key.to_string(), value.to_string()));
            }
        }

        Ok(Self {
            scheme: scheme.to_string(),
            rest: rest.to_string(),
            query,
        })
    }
}

/// Module names the factory knows about.  Everything except `file` is an
/// out-of-tree collaborator.
const KNOWN_MODULES: &[&str] = &["file", "rbd", "rbdaio", "iscsi"];

/// Open a source or destination through the configured io instances.
pub fn open(config: &Config, uri_text: &str, mode: OpenMode) -> Result<Arc<dyn IoAdapter>, IoError> {
    let uri = Uri::parse(uri_text)?;

    // An unconfigured `file:` scheme falls back to a default file instance;
    // everything else must be declared.
    let default_file = ModuleConfig {
        name: "file".to_string(),
        module: "file".to_string(),
        configuration: serde_yaml::Value::Null,
    };
    let entry = match config.io(&uri.scheme) {
        Some(entry) => entry,
        None if uri.scheme == "file" => &default_file,
        None => {
            return Err(IoError::Config(ConfigError::UnknownModule {
                kind: "io",
                name: uri.scheme.clone(),
                module: uri.scheme.clone(),
            }))
        }
    };

    match entry.module.as_str() {
        "file" => {
            let adapter = file::FileIo::open(&uri, mode, &entry.configuration)?;
            Ok(Arc::new(adapter))
        }
        other if KNOWN_MODULES.contains(&other) => Err(IoError::ModuleUnavailable {
            module: other.to_string(),
        }),
        other => Err(IoError::Config(ConfigError::UnknownModule {
            kind: "io",
            name: entry.name.clone(),
            module: other.to_string(),
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_file_uri() {
        let uri = Uri::parse("file:/var/lib/image.raw").unwrap();
        assert_eq!(uri.scheme, "file");
        assert_eq!(uri.rest, "/var/lib/image.raw");
        assert!(uri.query.is_empty());
    }

    #[test]
    fn parses_pool_image_snapshot_with_query() {
        let uri = Uri::parse("rbd:pool/image@snap?mon_host=10.0.0.1&key=abc").unwrap();
        assert_eq!(uri.scheme, "rbd");
        assert_eq!(uri.rest, "pool/image@snap");
        assert_eq!(
            uri.query,
            vec![
                ("mon_host".to_string(), "10.0.0.1".to_string()),
                ("key".to_string(), "abc".to_string())
            ]
        );
    }

    #[test]
    fn rejects_uris_without_scheme() {
        assert!(Uri::parse("/plain/path").is_err());
        assert!(Uri::parse(":path").is_err());
        assert!(Uri::parse("file:").is_err());
    }
}
