//! Block fingerprint functions.
//!
//! The hash function is fixed for the life of a repository; the engine
//! records the configured spec on first use and refuses to start if it
//! changes afterwards (equal plaintext must keep producing equal
//! fingerprints or deduplication silently stops working).

use blake2::digest::{Update, VariableOutput};
use blake2::Blake2bVar;
use sha2::{Digest, Sha256};

use crate::{Checksum, ConfigError};

/// A configured fingerprint function, parsed from specs like
/// `BLAKE2b,digest_bits=256` or `SHA256`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashFunction {
    Blake2b { digest_bits: u16 },
    Sha256,
}

impl HashFunction {
    pub fn parse(spec: &str) -> Result<Self, ConfigError> {
        let mut parts = spec.split(',');
        let name = parts.next().unwrap_or("").trim();
        match name.to_ascii_lowercase().as_str() {
            "blake2b" => {
                let mut digest_bits = 256u16;
                for part in parts {
                    let (key, value) = part
                        .split_once('=')
                        .ok_or_else(|| ConfigError::invalid_hash(spec))?;
                    match key.trim() {
                        "digest_bits" => {
                            digest_bits = value
                                .trim()
                                .parse()
                                .map_err(|_| ConfigError::invalid_hash(spec))?;
                        }
                        _ => return Err(ConfigError::invalid_hash(spec)),
                    }
                }
                if digest_bits == 0 || digest_bits > 512 || digest_bits % 8 != 0 {
                    return Err(ConfigError::invalid_hash(spec));
                }
                Ok(HashFunction::Blake2b { digest_bits })
            }
            "sha256" => {
                if parts.next().is_some() {
                    return Err(ConfigError::invalid_hash(spec));
                }
                Ok(HashFunction::Sha256)
            }
            _ => Err(ConfigError::invalid_hash(spec)),
        }
    }

    /// Canonical spec string, stable across parse/format round trips.
    pub fn spec(&self) -> String {
        match self {
            HashFunction::Blake2b { digest_bits } => {
                format!("BLAKE2b,digest_bits={digest_bits}")
            }
            HashFunction::Sha256 => "SHA256".to_string(),
        }
    }

    pub fn digest_size(&self) -> usize {
        match self {
            HashFunction::Blake2b { digest_bits } => (*digest_bits as usize) / 8,
            HashFunction::Sha256 => 32,
        }
    }

    pub fn hash(&self, data: &[u8]) -> Checksum {
        match self {
            HashFunction::Blake2b { digest_bits } => {
                let size = (*digest_bits as usize) / 8;
                let mut hasher =
                    Blake2bVar::new(size).expect("digest size validated at parse time");
                hasher.update(data);
                let mut out = vec![0u8; size];
                hasher
                    .finalize_variable(&mut out)
                    .expect("output length matches digest size");
                Checksum::from_bytes(out)
            }
            HashFunction::Sha256 => {
                Checksum::from_bytes(Sha256::digest(data).to_vec())
            }
        }
    }
}

impl Default for HashFunction {
    fn default() -> Self {
        HashFunction::Blake2b { digest_bits: 256 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_default_spec() {
        let hash = HashFunction::parse("BLAKE2b,digest_bits=256").unwrap();
        assert_eq!(hash, HashFunction::Blake2b { digest_bits: 256 });
        assert_eq!(hash.digest_size(), 32);
        assert_eq!(hash.spec(), "BLAKE2b,digest_bits=256");
    }

    #[test]
    fn rejects_unknown_functions_and_bad_bits() {
        assert!(HashFunction::parse("MD5").is_err());
        assert!(HashFunction::parse("BLAKE2b,digest_bits=7").is_err());
        assert!(HashFunction::parse("BLAKE2b,rounds=3").is_err());
        assert!(HashFunction::parse("SHA256,digest_bits=256").is_err());
    }

    #[test]
    fn digests_have_declared_length() {
        let data = b"fingerprint me";
        let blake = HashFunction::Blake2b { digest_bits: 256 };
        assert_eq!(blake.hash(data).as_bytes().len(), 32);
        assert_eq!(HashFunction::Sha256.hash(data).as_bytes().len(), 32);
    }

    #[test]
    fn equal_input_equal_digest() {
        let hash = HashFunction::default();
        assert_eq!(hash.hash(b"abc"), hash.hash(b"abc"));
        assert_ne!(hash.hash(b"abc"), hash.hash(b"abd"));
    }
}
