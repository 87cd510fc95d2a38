use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

pub mod config;
pub mod hash;

pub use config::{Config, ConfigError, ModuleConfig};
pub use hash::HashFunction;

/// Default block size used when the configuration does not override it (4 MiB).
pub const DEFAULT_BLOCK_SIZE: u32 = 4 * 1024 * 1024;

/// Version-metadata document schema emitted and accepted by the engine.
pub const METADATA_VERSION: &str = "2.0.0";

/// Identifier of a point-in-time backup.
///
/// Generator-assigned, of the form `V0000000001`.  Treated as opaque
/// everywhere except the generator itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionUid(String);

impl VersionUid {
    pub fn new(uid: impl Into<String>) -> Self {
        Self(uid.into())
    }

    /// Format the canonical uid for a metadata-store sequence number.
    pub fn from_sequence(sequence: u64) -> Self {
        Self(format!("V{sequence:010}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VersionUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for VersionUid {
    fn from(uid: &str) -> Self {
        Self(uid.to_string())
    }
}

/// Name of a stored object on a storage: a monotonic `(left, right)` pair.
///
/// `left` is the numeric sequence of the version that first wrote the object,
/// `right` a counter within that write.  The pair is only ever compared for
/// equality; the numeric structure exists so allocation is cheap and ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockUid {
    pub left: u64,
    pub right: u64,
}

impl BlockUid {
    pub fn new(left: u64, right: u64) -> Self {
        Self { left, right }
    }

    /// Object key of the data object on a storage.
    ///
    /// Keys are sharded into 256 directories by a byte of the pair so flat
    /// backends do not accumulate millions of siblings.
    pub fn object_key(&self) -> String {
        let shard = (self.left ^ self.right) & 0xff;
        format!("blocks/{:02x}/{:016x}-{:016x}", shard, self.left, self.right)
    }

    /// Object key of the metadata sidecar accompanying the data object.
    pub fn sidecar_key(&self) -> String {
        format!("{}.meta", self.object_key())
    }
}

impl fmt::Display for BlockUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.left, self.right)
    }
}

/// Cryptographic fingerprint of a block's plaintext.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Checksum(#[serde(with = "hex_bytes")] Vec<u8>);

impl Checksum {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn from_hex(text: &str) -> Result<Self, hex::FromHexError> {
        Ok(Self(hex::decode(text)?))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checksum({})", self.to_hex())
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        hex::decode(&text).map_err(serde::de::Error::custom)
    }
}

/// Lifecycle state of a version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionStatus {
    Incomplete,
    Valid,
    Invalid,
}

impl VersionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VersionStatus::Incomplete => "incomplete",
            VersionStatus::Valid => "valid",
            VersionStatus::Invalid => "invalid",
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "incomplete" => Some(VersionStatus::Incomplete),
            "valid" => Some(VersionStatus::Valid),
            "invalid" => Some(VersionStatus::Invalid),
            _ => None,
        }
    }
}

impl fmt::Display for VersionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A point-in-time backup of one source volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Version {
    pub uid: VersionUid,
    pub date: DateTime<Utc>,
    pub volume: String,
    pub snapshot: String,
    pub size: u64,
    pub block_size: u32,
    pub storage: String,
    pub status: VersionStatus,
    pub protected: bool,
    pub labels: BTreeMap<String, String>,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub bytes_deduplicated: u64,
    pub bytes_sparse: u64,
    /// Wall-clock seconds the producing backup took.
    pub duration: u64,
}

impl Version {
    /// Number of block rows a version of this size carries.
    pub fn block_count(&self) -> u64 {
        block_count(self.size, self.block_size)
    }
}

pub fn block_count(size: u64, block_size: u32) -> u64 {
    size.div_ceil(block_size as u64)
}

/// One cell of a version's content.
///
/// `uid` and `checksum` are both `None` iff the block is sparse (known
/// all-zero, not stored).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub idx: u64,
    pub uid: Option<BlockUid>,
    pub checksum: Option<Checksum>,
    pub size: u32,
    pub valid: bool,
}

impl Block {
    pub fn sparse(idx: u64, size: u32) -> Self {
        Self {
            idx,
            uid: None,
            checksum: None,
            size,
            valid: true,
        }
    }

    pub fn is_sparse(&self) -> bool {
        self.uid.is_none()
    }
}

/// Render a UTC timestamp the way every external document expects it:
/// microsecond precision, `Z` suffix.
pub fn format_timestamp(date: &DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn version_uid_formatting() {
        assert_eq!(VersionUid::from_sequence(1).as_str(), "V0000000001");
        assert_eq!(VersionUid::from_sequence(123456).as_str(), "V0000123456");
    }

    #[test]
    fn block_uid_keys_are_sharded() {
        let uid = BlockUid::new(1, 3);
        assert_eq!(
            uid.object_key(),
            "blocks/02/0000000000000001-0000000000000003"
        );
        assert_eq!(uid.sidecar_key(), format!("{}.meta", uid.object_key()));
    }

    #[test]
    fn checksum_hex_roundtrip() {
        let checksum = Checksum::from_bytes(vec![0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(checksum.to_hex(), "deadbeef");
        assert_eq!(Checksum::from_hex("deadbeef").unwrap(), checksum);
    }

    #[test]
    fn block_count_rounds_up() {
        assert_eq!(block_count(0, 4096), 0);
        assert_eq!(block_count(1, 4096), 1);
        assert_eq!(block_count(4096, 4096), 1);
        assert_eq!(block_count(4097, 4096), 2);
    }

    #[test]
    fn timestamps_use_z_suffix() {
        let date = Utc.with_ymd_and_hms(2019, 9, 27, 18, 5, 21).unwrap();
        assert_eq!(format_timestamp(&date), "2019-09-27T18:05:21.000000Z");
    }
}
