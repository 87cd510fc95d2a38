use benji_common::{ConfigError, VersionUid};
use benji_filter::FilterError;
use benji_io::IoError;
use benji_meta::MetaError;
use benji_storage::StorageError;
use benji_transform::TransformError;
use thiserror::Error;

/// Engine-level failures; wraps the per-subsystem taxonomies and adds the
/// cross-cutting preconditions of backup, removal and enforcement.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Io(#[from] IoError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Meta(#[from] MetaError),

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error(transparent)]
    Filter(#[from] FilterError),

    #[error(
        "Base version {base} has block size {base_block_size}, configuration wants {requested}"
    )]
    BlockSizeMismatch {
        base: VersionUid,
        base_block_size: u32,
        requested: u32,
    },

    #[error("Source shrank below base version {base}: {source_size} < {base_size} bytes")]
    SourceTooSmall {
        base: VersionUid,
        source_size: u64,
        base_size: u64,
    },

    #[error("Base version {uid} is not valid (status {status})")]
    BaseInvalid { uid: VersionUid, status: String },

    #[error("Refusing to remove version {uid}: {reason}")]
    PolicyViolation { uid: VersionUid, reason: String },

    #[error("Invalid retention policy {text:?}: {reason}")]
    InvalidPolicy { text: String, reason: String },

    #[error("Backup of {uid} aborted: {reason}")]
    BackupAborted { uid: VersionUid, reason: String },

    #[error("Restore destination error: {reason}")]
    RestoreFailed { reason: String },
}

impl EngineError {
    pub fn policy_violation(uid: &VersionUid, reason: impl Into<String>) -> Self {
        EngineError::PolicyViolation {
            uid: uid.clone(),
            reason: reason.into(),
        }
    }

    pub fn invalid_policy(text: &str, reason: impl Into<String>) -> Self {
        EngineError::InvalidPolicy {
            text: text.to_string(),
            reason: reason.into(),
        }
    }
}
