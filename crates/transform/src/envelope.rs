//! AES-256-GCM envelope encryption.
//!
//! Every block gets a fresh 256-bit data key and a fresh 96-bit IV; the data
//! key is wrapped with the master key using RFC 3394 and stored in the
//! per-object header.  Reusing a data key across blocks would leak equality
//! of plaintexts, so none of this is cached.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use aes_kw::KekAes256;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::key::{KeySource, MasterKey, MASTER_KEY_SIZE};
use crate::{Transform, TransformError};

pub const IV_SIZE: usize = 12;
pub const DATA_KEY_SIZE: usize = MASTER_KEY_SIZE;
/// RFC 3394 output for a 32-byte key.
pub const WRAPPED_KEY_SIZE: usize = DATA_KEY_SIZE + 8;

#[derive(Debug, Serialize, Deserialize)]
struct AesGcmHeader {
    /// Hex, 96-bit GCM IV.
    iv: String,
    /// Hex, RFC 3394 wrapped data key.
    wrapped_key: String,
}

pub struct AesGcmTransform {
    name: String,
    master: MasterKey,
    kdf_fingerprint: String,
}

impl AesGcmTransform {
    pub fn new(name: &str, configuration: &serde_yaml::Value) -> Result<Self, TransformError> {
        let source: KeySource = serde_yaml::from_value(configuration.clone())
            .map_err(|err| TransformError::invalid_configuration(err.to_string()))?;
        let (master, kdf_fingerprint) = MasterKey::from_source(&source)?;
        Ok(Self {
            name: name.to_string(),
            master,
            kdf_fingerprint,
        })
    }

    fn parse_header(header: &serde_json::Value) -> Result<([u8; IV_SIZE], Vec<u8>), TransformError> {
        let header: AesGcmHeader = serde_json::from_value(header.clone())
            .map_err(|err| TransformError::malformed_header(err.to_string()))?;
        let iv_bytes = hex::decode(&header.iv)
            .map_err(|_| TransformError::malformed_header("iv is not valid hex"))?;
        let iv: [u8; IV_SIZE] = iv_bytes
            .try_into()
            .map_err(|_| TransformError::malformed_header("iv must be 12 bytes"))?;
        let wrapped = hex::decode(&header.wrapped_key)
            .map_err(|_| TransformError::malformed_header("wrapped_key is not valid hex"))?;
        if wrapped.len() != WRAPPED_KEY_SIZE {
            return Err(TransformError::malformed_header("wrapped_key must be 40 bytes"));
        }
        Ok((iv, wrapped))
    }
}

impl Transform for AesGcmTransform {
    fn name(&self) -> &str {
        &self.name
    }

    fn module(&self) -> &'static str {
        "aes_256_gcm"
    }

    fn forward(&self, data: &[u8]) -> Result<(Vec<u8>, serde_json::Value), TransformError> {
        let mut data_key = [0u8; DATA_KEY_SIZE];
        OsRng.fill_bytes(&mut data_key);
        let mut iv = [0u8; IV_SIZE];
        OsRng.fill_bytes(&mut iv);

        let cipher = Aes256Gcm::new_from_slice(&data_key)
            .map_err(|_| TransformError::key_config("data key has wrong length"))?;
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&iv), data)
            .map_err(|_| TransformError::codec("aes_256_gcm", "encryption failed"))?;

        let kek = KekAes256::from(*self.master.as_bytes());
        let wrapped = kek
            .wrap_vec(&data_key)
            .map_err(|err| TransformError::WrapFailed {
                reason: err.to_string(),
            })?;

        let header = serde_json::to_value(AesGcmHeader {
            iv: hex::encode(iv),
            wrapped_key: hex::encode(wrapped),
        })
        .map_err(|err| TransformError::malformed_header(err.to_string()))?;

        Ok((ciphertext, header))
    }

    fn inverse(
        &self,
        data: &[u8],
        header: &serde_json::Value,
    ) -> Result<Vec<u8>, TransformError> {
        let (iv, wrapped) = Self::parse_header(header)?;

        let kek = KekAes256::from(*self.master.as_bytes());
        let data_key = kek
            .unwrap_vec(&wrapped)
            .map_err(|_| TransformError::UnwrapFailed)?;

        let cipher = Aes256Gcm::new_from_slice(&data_key)
            .map_err(|_| TransformError::UnwrapFailed)?;
        cipher
            .decrypt(Nonce::from_slice(&iv), data)
            .map_err(|_| TransformError::DecryptFailed)
    }

    fn kdf_fingerprint(&self) -> Option<String> {
        Some(self.kdf_fingerprint.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transform() -> AesGcmTransform {
        let config: serde_yaml::Value = serde_yaml::from_str(
            "masterKey: \"2222222222222222222222222222222222222222222222222222222222222222\"",
        )
        .unwrap();
        AesGcmTransform::new("encrypt", &config).unwrap()
    }

    #[test]
    fn roundtrip() {
        let t = transform();
        let plaintext = b"envelope encrypted block".repeat(128);
        let (ciphertext, header) = t.forward(&plaintext).unwrap();
        assert_ne!(ciphertext, plaintext);
        assert_eq!(t.inverse(&ciphertext, &header).unwrap(), plaintext);
    }

    #[test]
    fn password_derived_key_roundtrip() {
        let config: serde_yaml::Value = serde_yaml::from_str(
            "password: \"hunter2\"\nkdfSalt: \"0123456789abcdef0123456789abcdef\"\nkdfIterations: 100",
        )
        .unwrap();
        let t = AesGcmTransform::new("encrypt", &config).unwrap();
        assert!(t.kdf_fingerprint().is_some());

        let (ciphertext, header) = t.forward(b"payload").unwrap();
        assert_eq!(t.inverse(&ciphertext, &header).unwrap(), b"payload");
    }

    #[test]
    fn wrong_key_fails_closed() {
        let t = transform();
        let (ciphertext, header) = t.forward(b"payload").unwrap();

        let other_config: serde_yaml::Value = serde_yaml::from_str(
            "masterKey: \"3333333333333333333333333333333333333333333333333333333333333333\"",
        )
        .unwrap();
        let other = AesGcmTransform::new("encrypt", &other_config).unwrap();
        assert!(matches!(
            other.inverse(&ciphertext, &header),
            Err(TransformError::UnwrapFailed)
        ));
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let t = transform();
        let (mut ciphertext, header) = t.forward(b"payload").unwrap();
        ciphertext[0] ^= 0x01;
        assert!(matches!(
            t.inverse(&ciphertext, &header),
            Err(TransformError::DecryptFailed)
        ));
    }

    #[test]
    fn tampered_header_is_rejected() {
        let t = transform();
        let (ciphertext, mut header) = t.forward(b"payload").unwrap();
        header["iv"] = serde_json::Value::String("00".repeat(12));
        assert!(t.inverse(&ciphertext, &header).is_err());
    }
}
