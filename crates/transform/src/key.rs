//! Master-key material for the encrypting transforms.
//!
//! A master key is either given directly (`masterKey`, hex) or derived from
//! `password` with PBKDF2-SHA-512 over `kdfSalt`/`kdfIterations`.  The
//! derivation parameters are part of the repository's identity: the engine
//! pins a fingerprint of them on first use and refuses to start when it
//! changes, because a different salt or iteration count silently derives a
//! different key and every existing ciphertext becomes unreadable.

use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use serde::Deserialize;
use sha2::{Digest, Sha256, Sha512};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::TransformError;

pub const MASTER_KEY_SIZE: usize = 32;

type HmacSha256 = Hmac<Sha256>;

/// Key-material section shared by `aes_256_gcm` and `aes_256_gcm_ecc`.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct KeySource {
    #[serde(default)]
    pub password: Option<String>,
    /// Hex-encoded salt for PBKDF2.
    #[serde(default)]
    pub kdf_salt: Option<String>,
    #[serde(default)]
    pub kdf_iterations: Option<u32>,
    /// Hex-encoded 256-bit master key, alternative to password derivation.
    #[serde(default)]
    pub master_key: Option<String>,
}

/// A 256-bit master key, zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey([u8; MASTER_KEY_SIZE]);

impl MasterKey {
    pub fn from_source(source: &KeySource) -> Result<(Self, String), TransformError> {
        match (&source.master_key, &source.password) {
            (Some(_), Some(_)) => Err(TransformError::key_config(
                "masterKey and password are mutually exclusive",
            )),
            (Some(hex_key), None) => {
                let bytes = hex::decode(hex_key)
                    .map_err(|_| TransformError::key_config("masterKey is not valid hex"))?;
                let key: [u8; MASTER_KEY_SIZE] = bytes.try_into().map_err(|_| {
                    TransformError::key_config("masterKey must be 32 bytes of hex")
                })?;
                // Raw keys have no derivation parameters to pin, but the key
                // itself must not change either; fingerprint a digest of it.
                let fingerprint = hex::encode(Sha256::digest(key));
                Ok((Self(key), fingerprint))
            }
            (None, Some(password)) => {
                let salt_hex = source.kdf_salt.as_ref().ok_or_else(|| {
                    TransformError::key_config("password requires kdfSalt")
                })?;
                let iterations = source.kdf_iterations.ok_or_else(|| {
                    TransformError::key_config("password requires kdfIterations")
                })?;
                if iterations == 0 {
                    return Err(TransformError::key_config("kdfIterations must be > 0"));
                }
                let salt = hex::decode(salt_hex)
                    .map_err(|_| TransformError::key_config("kdfSalt is not valid hex"))?;
                if salt.len() < 16 {
                    return Err(TransformError::key_config("kdfSalt must be >= 16 bytes"));
                }

                let mut derived = [0u8; 64];
                pbkdf2_hmac::<Sha512>(password.as_bytes(), &salt, iterations, &mut derived);
                let mut key = [0u8; MASTER_KEY_SIZE];
                key.copy_from_slice(&derived[..MASTER_KEY_SIZE]);
                derived.zeroize();

                let fingerprint = kdf_fingerprint(&salt, iterations);
                Ok((Self(key), fingerprint))
            }
            (None, None) => Err(TransformError::key_config(
                "either masterKey or password must be configured",
            )),
        }
    }

    pub fn as_bytes(&self) -> &[u8; MASTER_KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("MasterKey").field(&"[REDACTED]").finish()
    }
}

/// Digest over the derivation parameters, pinned by the engine on first use.
fn kdf_fingerprint(salt: &[u8], iterations: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"benji-kdf-v1");
    hasher.update(salt);
    hasher.update(iterations.to_be_bytes());
    hex::encode(hasher.finalize())
}

/// HKDF-SHA-256 (extract + expand) for deriving wrapping keys from ECDH
/// shared secrets.
pub fn hkdf_sha256(ikm: &[u8], salt: &[u8], info: &[u8], out: &mut [u8]) {
    let mut extractor = HmacSha256::new_from_slice(salt).expect("HMAC accepts any key length");
    extractor.update(ikm);
    let prk = extractor.finalize().into_bytes();

    let mut previous: Vec<u8> = Vec::new();
    let mut generated = 0usize;
    let mut counter = 1u8;
    while generated < out.len() {
        let mut mac = HmacSha256::new_from_slice(&prk).expect("HMAC accepts any key length");
        mac.update(&previous);
        mac.update(info);
        mac.update(&[counter]);
        let block = mac.finalize().into_bytes();
        let take = block.len().min(out.len() - generated);
        out[generated..generated + take].copy_from_slice(&block[..take]);
        previous = block.to_vec();
        generated += take;
        counter += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(yaml: &str) -> KeySource {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn raw_master_key_roundtrip() {
        let (key, fingerprint) = MasterKey::from_source(&source(
            "masterKey: \"1111111111111111111111111111111111111111111111111111111111111111\"",
        ))
        .unwrap();
        assert_eq!(key.as_bytes()[0], 0x11);
        assert_eq!(fingerprint.len(), 64);
    }

    #[test]
    fn password_derivation_is_stable() {
        let yaml = "password: \"secret\"\nkdfSalt: \"00112233445566778899aabbccddeeff\"\nkdfIterations: 1000";
        let (first, fp1) = MasterKey::from_source(&source(yaml)).unwrap();
        let (second, fp2) = MasterKey::from_source(&source(yaml)).unwrap();
        assert_eq!(first.as_bytes(), second.as_bytes());
        assert_eq!(fp1, fp2);
    }

    #[test]
    fn different_salt_different_key_and_fingerprint() {
        let one = source(
            "password: \"secret\"\nkdfSalt: \"00112233445566778899aabbccddeeff\"\nkdfIterations: 1000",
        );
        let two = source(
            "password: \"secret\"\nkdfSalt: \"ffeeddccbbaa99887766554433221100\"\nkdfIterations: 1000",
        );
        let (key_one, fp_one) = MasterKey::from_source(&one).unwrap();
        let (key_two, fp_two) = MasterKey::from_source(&two).unwrap();
        assert_ne!(key_one.as_bytes(), key_two.as_bytes());
        assert_ne!(fp_one, fp_two);
    }

    #[test]
    fn rejects_contradictory_and_missing_material() {
        assert!(MasterKey::from_source(&KeySource::default()).is_err());
        assert!(MasterKey::from_source(&source(
            "password: \"x\"\nmasterKey: \"1111111111111111111111111111111111111111111111111111111111111111\"\nkdfSalt: \"00112233445566778899aabbccddeeff\"\nkdfIterations: 1"
        ))
        .is_err());
        assert!(MasterKey::from_source(&source("password: \"x\"")).is_err());
    }

    #[test]
    fn hkdf_output_length_and_determinism() {
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        hkdf_sha256(b"ikm", b"salt", b"info", &mut a);
        hkdf_sha256(b"ikm", b"salt", b"info", &mut b);
        assert_eq!(a, b);

        let mut c = [0u8; 32];
        hkdf_sha256(b"ikm", b"salt", b"other", &mut c);
        assert_ne!(a, c);
    }
}
