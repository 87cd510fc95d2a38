use thiserror::Error;

/// Transform failures.  Decrypt/decompress failures on the inverse path are
/// integrity failures from the engine's point of view and are mapped
/// accordingly there.
#[derive(Debug, Error)]
pub enum TransformError {
    #[error("Unknown transform module {module:?}")]
    UnknownModule { module: String },

    #[error("Transform {name:?} is not configured")]
    UnknownTransform { name: String },

    #[error("Transform module {module} requires BENJI_EXPERIMENTAL=1")]
    Experimental { module: &'static str },

    #[error("Invalid transform configuration: {reason}")]
    InvalidConfiguration { reason: String },

    #[error("Key material misconfigured: {reason}")]
    KeyConfig { reason: String },

    #[error("Codec error in {algorithm}: {message}")]
    Codec {
        algorithm: &'static str,
        message: String,
    },

    #[error("Malformed per-object header: {reason}")]
    MalformedHeader { reason: String },

    #[error("Data key wrap failed: {reason}")]
    WrapFailed { reason: String },

    #[error("Data key unwrap failed (wrong key or corrupt header)")]
    UnwrapFailed,

    #[error("Decryption failed (wrong key or corrupt ciphertext)")]
    DecryptFailed,

    #[error("Decryption requires the private key, this instance only holds the public key")]
    MissingPrivateKey,
}

impl TransformError {
    pub fn invalid_configuration(reason: impl Into<String>) -> Self {
        TransformError::InvalidConfiguration {
            reason: reason.into(),
        }
    }

    pub fn key_config(reason: impl Into<String>) -> Self {
        TransformError::KeyConfig {
            reason: reason.into(),
        }
    }

    pub fn codec(algorithm: &'static str, message: impl ToString) -> Self {
        TransformError::Codec {
            algorithm,
            message: message.to_string(),
        }
    }

    pub fn malformed_header(reason: impl Into<String>) -> Self {
        TransformError::MalformedHeader {
            reason: reason.into(),
        }
    }
}
