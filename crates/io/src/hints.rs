//! Sparse-region hints.
//!
//! A hints document tells the backup which source regions changed since the
//! base version (`exists: "true"`) and which are unallocated.  The format is
//! what `rbd diff --format=json` emits, so Ceph diffs can be fed in
//! unmodified.

use std::io::Read;
use std::path::Path;

use serde::Deserialize;

use crate::IoError;

/// One `(offset, length, used)` region.  The sequence is finite and consumed
/// once; the engine folds it into per-block read decisions immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hint {
    pub offset: u64,
    pub length: u64,
    pub used: bool,
}

impl Hint {
    /// Block indices this hint touches for a given block size.
    pub fn block_range(&self, block_size: u32) -> std::ops::Range<u64> {
        if self.length == 0 {
            return 0..0;
        }
        let first = self.offset / block_size as u64;
        let last = (self.offset + self.length - 1) / block_size as u64;
        first..last + 1
    }
}

#[derive(Deserialize)]
struct HintRecord {
    offset: u64,
    length: u64,
    exists: ExistsFlag,
}

/// `rbd diff` emits `"exists": "true"`; hand-written hints files sometimes
/// use a bare boolean.  Accept both.
#[derive(Deserialize)]
#[serde(untagged)]
enum ExistsFlag {
    Text(String),
    Flag(bool),
}

impl ExistsFlag {
    fn as_bool(&self) -> Result<bool, String> {
        match self {
            ExistsFlag::Flag(value) => Ok(*value),
            ExistsFlag::Text(text) => match text.as_str() {
                "true" => Ok(true),
                "false" => Ok(false),
                other => Err(format!("exists must be \"true\" or \"false\", got {other:?}")),
            },
        }
    }
}

/// Parse a hints document from a reader.
pub fn parse_hints(reader: impl Read, origin: &Path) -> Result<Vec<Hint>, IoError> {
    let records: Vec<HintRecord> =
        serde_json::from_reader(reader).map_err(|err| IoError::MalformedHints {
            path: origin.to_path_buf(),
            reason: err.to_string(),
        })?;

    records
        .into_iter()
        .map(|record| {
            let used = record.exists.as_bool().map_err(|reason| IoError::MalformedHints {
                path: origin.to_path_buf(),
                reason,
            })?;
            Ok(Hint {
                offset: record.offset,
                length: record.length,
                used,
            })
        })
        .collect()
}

pub fn read_hints_file(path: &Path) -> Result<Vec<Hint>, IoError> {
    let file = std::fs::File::open(path).map_err(|source| IoError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    parse_hints(file, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rbd_diff_format() {
        let text = r#"[
            {"offset": 0, "length": 4194304, "exists": "true"},
            {"offset": 4194304, "length": 4194304, "exists": "false"}
        ]"#;
        let hints = parse_hints(text.as_bytes(), Path::new("test.json")).unwrap();
        assert_eq!(hints.len(), 2);
        assert!(hints[0].used);
        assert!(!hints[1].used);
    }

    #[test]
    fn accepts_bare_booleans() {
        let text = r#"[{"offset": 0, "length": 10, "exists": true}]"#;
        let hints = parse_hints(text.as_bytes(), Path::new("test.json")).unwrap();
        assert!(hints[0].used);
    }

    #[test]
    fn rejects_garbage_exists_values() {
        let text = r#"[{"offset": 0, "length": 10, "exists": "maybe"}]"#;
        assert!(parse_hints(text.as_bytes(), Path::new("test.json")).is_err());
    }

    #[test]
    fn block_ranges_cover_partial_blocks() {
        let hint = Hint {
            offset: 100,
            length: 1,
            used: true,
        };
        assert_eq!(hint.block_range(4096), 0..1);

        let spanning = Hint {
            offset: 4095,
            length: 2,
            used: true,
        };
        assert_eq!(spanning.block_range(4096), 0..2);

        let empty = Hint {
            offset: 0,
            length: 0,
            used: true,
        };
        assert!(empty.block_range(4096).is_empty());
    }
}
