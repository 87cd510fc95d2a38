//! Metadata sidecars.
//!
//! Every data object is accompanied by a small JSON sidecar describing how
//! the object was produced: the ordered transforms applied (with their
//! per-object headers), the pre- and post-transform sizes and, when
//! configured, an HMAC-SHA-256 over the canonical serialization of those
//! fields.  Reads verify the HMAC before honoring anything the sidecar says.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use benji_common::format_timestamp;
use benji_transform::key::{KeySource, MasterKey};
use benji_transform::{TransformError, TransformRecord};

use crate::error::{IntegrityKind, StorageError};

type HmacSha256 = Hmac<Sha256>;

pub const SIDECAR_VERSION: &str = "2.0.0";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Sidecar {
    pub metadata_version: String,
    /// Object key of the data object this sidecar describes.
    pub object: String,
    pub created: String,
    pub modified: String,
    /// Transforms in application order; reads invert back-to-front.
    pub transforms: Vec<TransformRecord>,
    /// Plaintext size before the transform chain ran.
    pub size: u64,
    /// Object size as stored after the chain.
    pub stored_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hmac: Option<String>,
}

impl Sidecar {
    pub fn new(
        object: String,
        transforms: Vec<TransformRecord>,
        size: u64,
        stored_size: u64,
        now: DateTime<Utc>,
    ) -> Self {
        let timestamp = format_timestamp(&now);
        Self {
            metadata_version: SIDECAR_VERSION.to_string(),
            object,
            created: timestamp.clone(),
            modified: timestamp,
            transforms,
            size,
            stored_size,
            hmac: None,
        }
    }

    /// Canonical bytes the HMAC covers: the document itself with the `hmac`
    /// field absent.  Struct field order makes this deterministic.
    fn canonical_bytes(&self) -> Vec<u8> {
        let mut unsigned = self.clone();
        unsigned.hmac = None;
        serde_json::to_vec(&unsigned).expect("sidecar always serializes")
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("sidecar always serializes")
    }

    pub fn from_bytes(key: &str, bytes: &[u8]) -> Result<Self, StorageError> {
        let sidecar: Sidecar = serde_json::from_slice(bytes)
            .map_err(|err| StorageError::malformed_sidecar(key, err))?;
        if sidecar.metadata_version != SIDECAR_VERSION {
            return Err(StorageError::malformed_sidecar(
                key,
                format!("unsupported sidecar version {}", sidecar.metadata_version),
            ));
        }
        Ok(sidecar)
    }
}

/// HMAC signer/verifier for sidecars.  Key material mirrors the encrypting
/// transforms: a password run through PBKDF2-SHA-512, or a raw key.
pub struct SidecarHmac {
    key: MasterKey,
}

impl SidecarHmac {
    pub fn from_config(configuration: &serde_yaml::Value) -> Result<Self, TransformError> {
        let source: KeySource = serde_yaml::from_value(configuration.clone())
            .map_err(|err| TransformError::invalid_configuration(err.to_string()))?;
        let (key, _fingerprint) = MasterKey::from_source(&source)?;
        Ok(Self { key })
    }

    pub fn sign(&self, sidecar: &mut Sidecar) {
        let mut mac = HmacSha256::new_from_slice(self.key.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(&sidecar.canonical_bytes());
        sidecar.hmac = Some(hex::encode(mac.finalize().into_bytes()));
    }

    pub fn verify(&self, key: &str, sidecar: &Sidecar) -> Result<(), StorageError> {
        let recorded = match &sidecar.hmac {
            Some(recorded) => recorded,
            None => return Err(StorageError::integrity(key, IntegrityKind::SidecarHmacMismatch)),
        };
        let recorded_bytes = hex::decode(recorded)
            .map_err(|_| StorageError::integrity(key, IntegrityKind::SidecarHmacMismatch))?;

        let mut mac = HmacSha256::new_from_slice(self.key.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(&sidecar.canonical_bytes());
        let expected = mac.finalize().into_bytes();

        if recorded_bytes.len() != expected.len()
            || !bool::from(recorded_bytes.as_slice().ct_eq(expected.as_slice()))
        {
            return Err(StorageError::integrity(key, IntegrityKind::SidecarHmacMismatch));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> SidecarHmac {
        let config: serde_yaml::Value = serde_yaml::from_str(
            "masterKey: \"4444444444444444444444444444444444444444444444444444444444444444\"",
        )
        .unwrap();
        SidecarHmac::from_config(&config).unwrap()
    }

    fn sidecar() -> Sidecar {
        Sidecar::new("blocks/00/x".to_string(), Vec::new(), 4096, 512, Utc::now())
    }

    #[test]
    fn sign_then_verify() {
        let signer = signer();
        let mut sidecar = sidecar();
        signer.sign(&mut sidecar);
        assert!(sidecar.hmac.is_some());
        signer.verify("blocks/00/x", &sidecar).unwrap();
    }

    #[test]
    fn any_field_change_breaks_the_hmac() {
        let signer = signer();
        let mut sidecar = sidecar();
        signer.sign(&mut sidecar);
        sidecar.stored_size += 1;
        assert!(matches!(
            signer.verify("blocks/00/x", &sidecar),
            Err(StorageError::Integrity {
                kind: IntegrityKind::SidecarHmacMismatch,
                ..
            })
        ));
    }

    #[test]
    fn missing_hmac_fails_verification() {
        let signer = signer();
        let sidecar = sidecar();
        assert!(signer.verify("blocks/00/x", &sidecar).is_err());
    }

    #[test]
    fn sidecar_roundtrips_through_json() {
        let mut sidecar = sidecar();
        signer().sign(&mut sidecar);
        let bytes = sidecar.to_bytes();
        let parsed = Sidecar::from_bytes("blocks/00/x", &bytes).unwrap();
        assert_eq!(parsed, sidecar);
    }

    #[test]
    fn wrong_version_is_rejected() {
        let mut sidecar = sidecar();
        sidecar.metadata_version = "1.0.0".to_string();
        let bytes = sidecar.to_bytes();
        assert!(Sidecar::from_bytes("k", &bytes).is_err());
    }
}
