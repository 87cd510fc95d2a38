use benji_common::ConfigError;
use benji_transform::TransformError;
use thiserror::Error;

/// Why an object failed its integrity contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityKind {
    MissingObject,
    MissingSidecar,
    SidecarHmacMismatch,
    SizeMismatch,
    TransformFailed,
    ChecksumMismatch,
}

impl std::fmt::Display for IntegrityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            IntegrityKind::MissingObject => "data object missing",
            IntegrityKind::MissingSidecar => "metadata sidecar missing",
            IntegrityKind::SidecarHmacMismatch => "sidecar HMAC mismatch",
            IntegrityKind::SizeMismatch => "stored size mismatch",
            IntegrityKind::TransformFailed => "inverse transform failed",
            IntegrityKind::ChecksumMismatch => "block checksum mismatch",
        };
        f.write_str(text)
    }
}

/// Object-storage failures.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Object {key:?} not found")]
    NotFound { key: String },

    #[error("Storage integrity violation on {key:?}: {kind}")]
    Integrity { key: String, kind: IntegrityKind },

    #[error("Storage backend {op} on {key:?} failed after {attempts} attempts: {source}")]
    Backend {
        op: &'static str,
        key: String,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("Read-after-write verification failed for {key:?}")]
    ConsistencyCheck { key: String },

    #[error("Sidecar for {key:?} is malformed: {reason}")]
    MalformedSidecar { key: String, reason: String },

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("storage module {module:?} is not built into this binary")]
    ModuleUnavailable { module: String },

    #[error("Unknown storage {name:?}")]
    UnknownStorage { name: String },
}

impl StorageError {
    pub fn integrity(key: impl Into<String>, kind: IntegrityKind) -> Self {
        StorageError::Integrity {
            key: key.into(),
            kind,
        }
    }

    pub fn malformed_sidecar(key: impl Into<String>, reason: impl ToString) -> Self {
        StorageError::MalformedSidecar {
            key: key.into(),
            reason: reason.to_string(),
        }
    }

    /// Integrity and not-found conditions must not be retried; transient
    /// backend failures are.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Backend { .. })
    }
}
