//! Reversible per-block transforms.
//!
//! A storage applies an ordered chain of transforms on write (`zstd`
//! compression, `aes_256_gcm` envelope encryption, `aes_256_gcm_ecc` for
//! write-only instances) and records the applied names in the object's
//! sidecar.  Reads invert the *recorded* chain, so the configured chain can
//! change at any time without breaking objects written earlier.
//!
//! `forward` is not deterministic (fresh IVs and data keys per block);
//! `inverse` is its left-inverse, which is the only contract callers rely
//! on.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use benji_common::{config::experimental_enabled, Config};

pub mod compression;
pub mod ecc;
pub mod envelope;
pub mod key;

mod error;

pub use error::TransformError;

/// One applied transform as recorded in a sidecar: the instance name plus
/// whatever per-object header the transform needs to invert itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransformRecord {
    pub name: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub header: serde_json::Value,
}

/// A reversible per-block byte codec.
pub trait Transform: Send + Sync {
    /// Configured instance name, recorded in sidecars.
    fn name(&self) -> &str;

    /// Module identifier (`zstd`, `aes_256_gcm`, `aes_256_gcm_ecc`).
    fn module(&self) -> &'static str;

    fn forward(&self, data: &[u8]) -> Result<(Vec<u8>, serde_json::Value), TransformError>;

    fn inverse(
        &self,
        data: &[u8],
        header: &serde_json::Value,
    ) -> Result<Vec<u8>, TransformError>;

    /// Digest over the key-derivation parameters, if the transform has any.
    /// The engine pins this on first use; changing salt or iterations later
    /// would make existing ciphertexts unrecoverable.
    fn kdf_fingerprint(&self) -> Option<String> {
        None
    }
}

/// All configured transform instances, resolved by name.
pub struct TransformRegistry {
    by_name: HashMap<String, Arc<dyn Transform>>,
}

impl TransformRegistry {
    pub fn from_config(config: &Config) -> Result<Self, TransformError> {
        let mut by_name = HashMap::new();
        for entry in &config.transforms {
            let transform: Arc<dyn Transform> = match entry.module.as_str() {
                "zstd" => Arc::new(compression::ZstdTransform::new(
                    &entry.name,
                    &entry.configuration,
                )?),
                "aes_256_gcm" => Arc::new(envelope::AesGcmTransform::new(
                    &entry.name,
                    &entry.configuration,
                )?),
                "aes_256_gcm_ecc" => {
                    if !experimental_enabled() {
                        return Err(TransformError::Experimental {
                            module: "aes_256_gcm_ecc",
                        });
                    }
                    Arc::new(ecc::EccTransform::new(&entry.name, &entry.configuration)?)
                }
                other => {
                    return Err(TransformError::UnknownModule {
                        module: other.to_string(),
                    })
                }
            };
            by_name.insert(entry.name.clone(), transform);
        }
        Ok(Self { by_name })
    }

    /// Assemble a registry from already-built transforms; used by tests and
    /// by the in-memory restore path where no configuration document exists.
    pub fn from_transforms(transforms: Vec<Arc<dyn Transform>>) -> Self {
        Self {
            by_name: transforms
                .into_iter()
                .map(|t| (t.name().to_string(), t))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Transform>> {
        self.by_name.get(name)
    }

    /// Resolve an ordered `activeTransforms` list into a forward chain.
    pub fn chain(&self, names: &[String]) -> Result<TransformChain, TransformError> {
        let transforms = names
            .iter()
            .map(|name| {
                self.by_name
                    .get(name)
                    .cloned()
                    .ok_or_else(|| TransformError::UnknownTransform { name: name.clone() })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(TransformChain { transforms })
    }

    /// Invert a recorded chain (applied in reverse order of recording).
    pub fn revert(
        &self,
        data: &[u8],
        records: &[TransformRecord],
    ) -> Result<Vec<u8>, TransformError> {
        let mut current = data.to_vec();
        for record in records.iter().rev() {
            let transform = self
                .by_name
                .get(&record.name)
                .ok_or_else(|| TransformError::UnknownTransform {
                    name: record.name.clone(),
                })?;
            current = transform.inverse(&current, &record.header)?;
        }
        Ok(current)
    }
}

/// The ordered forward chain a storage applies on write.
#[derive(Clone)]
pub struct TransformChain {
    transforms: Vec<Arc<dyn Transform>>,
}

impl TransformChain {
    pub fn empty() -> Self {
        Self {
            transforms: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.transforms.is_empty()
    }

    pub fn forward(&self, data: &[u8]) -> Result<(Vec<u8>, Vec<TransformRecord>), TransformError> {
        let mut current = data.to_vec();
        let mut records = Vec::with_capacity(self.transforms.len());
        for transform in &self.transforms {
            let (next, header) = transform.forward(&current)?;
            records.push(TransformRecord {
                name: transform.name().to_string(),
                header,
            });
            current = next;
        }
        Ok((current, records))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yaml(text: &str) -> serde_yaml::Value {
        serde_yaml::from_str(text).unwrap()
    }

    fn registry() -> TransformRegistry {
        let compress =
            compression::ZstdTransform::new("compress", &yaml("level: 3")).unwrap();
        let encrypt = envelope::AesGcmTransform::new(
            "encrypt",
            &yaml(
                "masterKey: \"0000000000000000000000000000000000000000000000000000000000000000\"",
            ),
        )
        .unwrap();
        TransformRegistry::from_transforms(vec![Arc::new(compress), Arc::new(encrypt)])
    }

    #[test]
    fn chain_roundtrip_through_compression_and_encryption() {
        let registry = registry();
        let chain = registry
            .chain(&["compress".to_string(), "encrypt".to_string()])
            .unwrap();

        let plaintext = b"a block of data that compresses ".repeat(1024);
        let (stored, records) = chain.forward(&plaintext).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].name, "compress");
        assert_eq!(records[1].name, "encrypt");
        assert_ne!(stored, plaintext);

        let recovered = registry.revert(&stored, &records).unwrap();
        assert_eq!(recovered, plaintext);
    }

    #[test]
    fn recorded_chain_wins_over_configured_chain() {
        let registry = registry();
        // Object written with compression only; the active chain now also
        // encrypts, which must not matter for reads.
        let chain = registry.chain(&["compress".to_string()]).unwrap();
        let plaintext = vec![7u8; 65536];
        let (stored, records) = chain.forward(&plaintext).unwrap();

        let recovered = registry.revert(&stored, &records).unwrap();
        assert_eq!(recovered, plaintext);
    }

    #[test]
    fn unknown_recorded_name_is_an_error() {
        let registry = registry();
        let records = vec![TransformRecord {
            name: "missing".to_string(),
            header: serde_json::Value::Null,
        }];
        assert!(matches!(
            registry.revert(b"x", &records),
            Err(TransformError::UnknownTransform { .. })
        ));
    }

    #[test]
    fn ciphertexts_differ_per_write() {
        let registry = registry();
        let chain = registry.chain(&["encrypt".to_string()]).unwrap();
        let data = vec![1u8; 4096];
        let (first, _) = chain.forward(&data).unwrap();
        let (second, _) = chain.forward(&data).unwrap();
        assert_ne!(first, second);
    }
}
