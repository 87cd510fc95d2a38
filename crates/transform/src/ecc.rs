//! AES-256-GCM envelope encryption with ECIES key wrapping.
//!
//! The symmetric layer is identical to `aes_256_gcm`; the per-block data key
//! is instead wrapped against a NIST-curve public key: an ephemeral ECDH
//! agreement feeds HKDF-SHA-256, and the derived key drives the same
//! RFC 3394 wrap.  Backup instances configured with only the public key can
//! write but never read — decryption needs the private scalar.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use aes_kw::KekAes256;
use elliptic_curve::ecdh::EphemeralSecret;
use elliptic_curve::sec1::{FromEncodedPoint, ModulusSize, ToEncodedPoint};
use elliptic_curve::{AffinePoint, CurveArithmetic, FieldBytesSize, PublicKey, SecretKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::envelope::{DATA_KEY_SIZE, IV_SIZE, WRAPPED_KEY_SIZE};
use crate::key::hkdf_sha256;
use crate::{Transform, TransformError};

const ECIES_INFO: &[u8] = b"benji-ecies-aes-kw-v1";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct EccConfig {
    /// `p-256`, `p-384` or `p-521`.
    curve: String,
    /// Hex-encoded SEC1 point.
    public_key: String,
    /// Hex-encoded scalar; omit on write-only instances.
    #[serde(default)]
    private_key: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct EccHeader {
    iv: String,
    wrapped_key: String,
    /// Hex, compressed SEC1 point of the ephemeral key.
    ephemeral_key: String,
}

enum CurveKeys {
    P256 {
        public: PublicKey<p256::NistP256>,
        private: Option<SecretKey<p256::NistP256>>,
    },
    P384 {
        public: PublicKey<p384::NistP384>,
        private: Option<SecretKey<p384::NistP384>>,
    },
    P521 {
        public: PublicKey<p521::NistP521>,
        private: Option<SecretKey<p521::NistP521>>,
    },
}

impl CurveKeys {
    fn curve_name(&self) -> &'static str {
        match self {
            CurveKeys::P256 { .. } => "p-256",
            CurveKeys::P384 { .. } => "p-384",
            CurveKeys::P521 { .. } => "p-521",
        }
    }
}

pub struct EccTransform {
    name: String,
    keys: CurveKeys,
    key_fingerprint: String,
}

fn decode_keys<C>(
    public_hex: &str,
    private_hex: Option<&str>,
) -> Result<(PublicKey<C>, Option<SecretKey<C>>), TransformError>
where
    C: CurveArithmetic,
    FieldBytesSize<C>: ModulusSize,
    AffinePoint<C>: FromEncodedPoint<C> + ToEncodedPoint<C>,
{
    let public_bytes = hex::decode(public_hex)
        .map_err(|_| TransformError::key_config("publicKey is not valid hex"))?;
    let public = PublicKey::<C>::from_sec1_bytes(&public_bytes)
        .map_err(|_| TransformError::key_config("publicKey is not a valid SEC1 point"))?;

    let private = match private_hex {
        None => None,
        Some(text) => {
            let bytes = hex::decode(text)
                .map_err(|_| TransformError::key_config("privateKey is not valid hex"))?;
            let secret = SecretKey::<C>::from_slice(&bytes)
                .map_err(|_| TransformError::key_config("privateKey is not a valid scalar"))?;
            if secret.public_key() != public {
                return Err(TransformError::key_config(
                    "privateKey does not match publicKey",
                ));
            }
            Some(secret)
        }
    };

    Ok((public, private))
}

fn wrap_data_key<C>(
    recipient: &PublicKey<C>,
    data_key: &[u8; DATA_KEY_SIZE],
) -> Result<(Vec<u8>, Vec<u8>), TransformError>
where
    C: CurveArithmetic,
    FieldBytesSize<C>: ModulusSize,
    AffinePoint<C>: FromEncodedPoint<C> + ToEncodedPoint<C>,
{
    let ephemeral = EphemeralSecret::<C>::random(&mut OsRng);
    let shared = ephemeral.diffie_hellman(recipient);
    let ephemeral_point = ephemeral.public_key().to_encoded_point(true);

    let mut wrapping_key = [0u8; 32];
    hkdf_sha256(
        shared.raw_secret_bytes().as_slice(),
        ephemeral_point.as_bytes(),
        ECIES_INFO,
        &mut wrapping_key,
    );

    let kek = KekAes256::from(wrapping_key);
    let wrapped = kek
        .wrap_vec(data_key)
        .map_err(|err| TransformError::WrapFailed {
            reason: err.to_string(),
        })?;

    Ok((wrapped, ephemeral_point.as_bytes().to_vec()))
}

fn unwrap_data_key<C>(
    secret: &SecretKey<C>,
    ephemeral_bytes: &[u8],
    wrapped: &[u8],
) -> Result<Vec<u8>, TransformError>
where
    C: CurveArithmetic,
    FieldBytesSize<C>: ModulusSize,
    AffinePoint<C>: FromEncodedPoint<C> + ToEncodedPoint<C>,
{
    let ephemeral_public = PublicKey::<C>::from_sec1_bytes(ephemeral_bytes)
        .map_err(|_| TransformError::malformed_header("ephemeral_key is not a valid point"))?;
    let shared = elliptic_curve::ecdh::diffie_hellman(
        secret.to_nonzero_scalar(),
        ephemeral_public.as_affine(),
    );

    let mut wrapping_key = [0u8; 32];
    hkdf_sha256(
        shared.raw_secret_bytes().as_slice(),
        ephemeral_bytes,
        ECIES_INFO,
        &mut wrapping_key,
    );

    let kek = KekAes256::from(wrapping_key);
    kek.unwrap_vec(wrapped)
        .map_err(|_| TransformError::UnwrapFailed)
}

impl EccTransform {
    pub fn new(name: &str, configuration: &serde_yaml::Value) -> Result<Self, TransformError> {
        let config: EccConfig = serde_yaml::from_value(configuration.clone())
            .map_err(|err| TransformError::invalid_configuration(err.to_string()))?;

        let private = config.private_key.as_deref();
        let keys = match config.curve.to_ascii_lowercase().as_str() {
            "p-256" | "p256" => {
                let (public, private) = decode_keys::<p256::NistP256>(&config.public_key, private)?;
                CurveKeys::P256 { public, private }
            }
            "p-384" | "p384" => {
                let (public, private) = decode_keys::<p384::NistP384>(&config.public_key, private)?;
                CurveKeys::P384 { public, private }
            }
            "p-521" | "p521" => {
                let (public, private) = decode_keys::<p521::NistP521>(&config.public_key, private)?;
                CurveKeys::P521 { public, private }
            }
            other => {
                return Err(TransformError::key_config(format!(
                    "unsupported curve {other:?} (expected p-256, p-384 or p-521)"
                )))
            }
        };

        let mut hasher = Sha256::new();
        hasher.update(b"benji-ecc-key-v1");
        hasher.update(keys.curve_name().as_bytes());
        hasher.update(
            hex::decode(&config.public_key)
                .map_err(|_| TransformError::key_config("publicKey is not valid hex"))?,
        );
        let key_fingerprint = hex::encode(hasher.finalize());

        Ok(Self {
            name: name.to_string(),
            keys,
            key_fingerprint,
        })
    }

    fn parse_header(
        header: &serde_json::Value,
    ) -> Result<([u8; IV_SIZE], Vec<u8>, Vec<u8>), TransformError> {
        let header: EccHeader = serde_json::from_value(header.clone())
            .map_err(|err| TransformError::malformed_header(err.to_string()))?;
        let iv: [u8; IV_SIZE] = hex::decode(&header.iv)
            .map_err(|_| TransformError::malformed_header("iv is not valid hex"))?
            .try_into()
            .map_err(|_| TransformError::malformed_header("iv must be 12 bytes"))?;
        let wrapped = hex::decode(&header.wrapped_key)
            .map_err(|_| TransformError::malformed_header("wrapped_key is not valid hex"))?;
        if wrapped.len() != WRAPPED_KEY_SIZE {
            return Err(TransformError::malformed_header("wrapped_key must be 40 bytes"));
        }
        let ephemeral = hex::decode(&header.ephemeral_key)
            .map_err(|_| TransformError::malformed_header("ephemeral_key is not valid hex"))?;
        Ok((iv, wrapped, ephemeral))
    }
}

impl Transform for EccTransform {
    fn name(&self) -> &str {
        &self.name
    }

    fn module(&self) -> &'static str {
        "aes_256_gcm_ecc"
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
            .map_err(|_| TransformError::codec("aes_256_gcm_ecc", "encryption failed"))?;

        let (wrapped, ephemeral) = match &self.keys {
            CurveKeys::P256 { public, .. } => wrap_data_key(public, &data_key)?,
            CurveKeys::P384 { public, .. } => wrap_data_key(public, &data_key)?,
            CurveKeys::P521 { public, .. } => wrap_data_key(public, &data_key)?,
        };

        let header = serde_json::to_value(EccHeader {
            iv: hex::encode(iv),
            wrapped_key: hex::encode(wrapped),
            ephemeral_key: hex::encode(ephemeral),
        })
        .map_err(|err| TransformError::malformed_header(err.to_string()))?;

        Ok((ciphertext, header))
    }

    fn inverse(
        &self,
        data: &[u8],
        header: &serde_json::Value,
    ) -> Result<Vec<u8>, TransformError> {
        let (iv, wrapped, ephemeral) = Self::parse_header(header)?;

        let data_key = match &self.keys {
            CurveKeys::P256 { private, .. } => match private {
                Some(secret) => unwrap_data_key(secret, &ephemeral, &wrapped)?,
                None => return Err(TransformError::MissingPrivateKey),
            },
            CurveKeys::P384 { private, .. } => match private {
                Some(secret) => unwrap_data_key(secret, &ephemeral, &wrapped)?,
                None => return Err(TransformError::MissingPrivateKey),
            },
            CurveKeys::P521 { private, .. } => match private {
                Some(secret) => unwrap_data_key(secret, &ephemeral, &wrapped)?,
                None => return Err(TransformError::MissingPrivateKey),
            },
        };

        let cipher = Aes256Gcm::new_from_slice(&data_key)
            .map_err(|_| TransformError::UnwrapFailed)?;
        cipher
            .decrypt(Nonce::from_slice(&iv), data)
            .map_err(|_| TransformError::DecryptFailed)
    }

    fn kdf_fingerprint(&self) -> Option<String> {
        Some(self.key_fingerprint.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypair_config(private: bool) -> serde_yaml::Value {
        let secret = SecretKey::<p256::NistP256>::random(&mut OsRng);
        let public = secret.public_key().to_encoded_point(false);
        let mut text = format!(
            "curve: p-256\npublicKey: \"{}\"\n",
            hex::encode(public.as_bytes())
        );
        if private {
            text.push_str(&format!(
                "privateKey: \"{}\"\n",
                hex::encode(secret.to_bytes())
            ));
        }
        serde_yaml::from_str(&text).unwrap()
    }

    #[test]
    fn roundtrip_with_private_key() {
        let t = EccTransform::new("ecc", &keypair_config(true)).unwrap();
        let plaintext = b"ecc wrapped block".repeat(64);
        let (ciphertext, header) = t.forward(&plaintext).unwrap();
        assert_eq!(t.inverse(&ciphertext, &header).unwrap(), plaintext);
    }

    #[test]
    fn write_only_instance_encrypts_but_cannot_decrypt() {
        let t = EccTransform::new("ecc", &keypair_config(false)).unwrap();
        let (ciphertext, header) = t.forward(b"payload").unwrap();
        assert!(matches!(
            t.inverse(&ciphertext, &header),
            Err(TransformError::MissingPrivateKey)
        ));
    }

    #[test]
    fn mismatched_keypair_is_rejected() {
        let secret = SecretKey::<p256::NistP256>::random(&mut OsRng);
        let other = SecretKey::<p256::NistP256>::random(&mut OsRng);
        let public = secret.public_key().to_encoded_point(false);
        let text = format!(
            "curve: p-256\npublicKey: \"{}\"\nprivateKey: \"{}\"\n",
            hex::encode(public.as_bytes()),
            hex::encode(other.to_bytes())
        );
        let config: serde_yaml::Value = serde_yaml::from_str(&text).unwrap();
        assert!(matches!(
            EccTransform::new("ecc", &config),
            Err(TransformError::KeyConfig { .. })
        ));
    }

    #[test]
    fn unsupported_curve_is_rejected() {
        let config: serde_yaml::Value =
            serde_yaml::from_str("curve: p-192\npublicKey: \"00\"").unwrap();
        assert!(EccTransform::new("ecc", &config).is_err());
    }
}
