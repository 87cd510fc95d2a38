//! Zstandard compression transform.

use std::io::Write;
use std::path::PathBuf;

use serde::Deserialize;
use tracing::instrument;

use crate::{Transform, TransformError};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
struct ZstdConfig {
    level: i32,
    dictionary: Option<PathBuf>,
}

impl Default for ZstdConfig {
    fn default() -> Self {
        Self {
            level: 3,
            dictionary: None,
        }
    }
}

pub struct ZstdTransform {
    name: String,
    level: i32,
    dictionary: Option<Vec<u8>>,
}

impl ZstdTransform {
    pub fn new(name: &str, configuration: &serde_yaml::Value) -> Result<Self, TransformError> {
        let config: ZstdConfig = if configuration.is_null() {
            ZstdConfig::default()
        } else {
            serde_yaml::from_value(configuration.clone())
                .map_err(|err| TransformError::invalid_configuration(err.to_string()))?
        };

        if !(-5..=22).contains(&config.level) {
            return Err(TransformError::invalid_configuration(format!(
                "zstd level {} out of range -5..=22",
                config.level
            )));
        }

        let dictionary = match &config.dictionary {
            Some(path) => Some(std::fs::read(path).map_err(|err| {
                TransformError::invalid_configuration(format!(
                    "cannot read zstd dictionary {}: {err}",
                    path.display()
                ))
            })?),
            None => None,
        };

        Ok(Self {
            name: name.to_string(),
            level: config.level,
            dictionary,
        })
    }
}

impl Transform for ZstdTransform {
    fn name(&self) -> &str {
        &self.name
    }

    fn module(&self) -> &'static str {
        "zstd"
    }

    #[instrument(skip_all, fields(name = %self.name, input_len = data.len()))]
    fn forward(&self, data: &[u8]) -> Result<(Vec<u8>, serde_json::Value), TransformError> {
        let compressed = match &self.dictionary {
            None => zstd::stream::encode_all(data, self.level)
                .map_err(|err| TransformError::codec("zstd", err))?,
            Some(dictionary) => {
                let mut encoder =
                    zstd::stream::Encoder::with_dictionary(Vec::new(), self.level, dictionary)
                        .map_err(|err| TransformError::codec("zstd", err))?;
                encoder
                    .write_all(data)
                    .map_err(|err| TransformError::codec("zstd", err))?;
                encoder
                    .finish()
                    .map_err(|err| TransformError::codec("zstd", err))?
            }
        };
        Ok((compressed, serde_json::Value::Null))
    }

    #[instrument(skip_all, fields(name = %self.name, input_len = data.len()))]
    fn inverse(
        &self,
        data: &[u8],
        _header: &serde_json::Value,
    ) -> Result<Vec<u8>, TransformError> {
        match &self.dictionary {
            None => zstd::stream::decode_all(data)
                .map_err(|err| TransformError::codec("zstd", err)),
            Some(dictionary) => {
                let mut decoder = zstd::stream::Decoder::with_dictionary(data, dictionary)
                    .map_err(|err| TransformError::codec("zstd", err))?;
                let mut out = Vec::new();
                std::io::copy(&mut decoder, &mut out)
                    .map_err(|err| TransformError::codec("zstd", err))?;
                Ok(out)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transform() -> ZstdTransform {
        ZstdTransform::new("zstd", &serde_yaml::Value::Null).unwrap()
    }

    #[test]
    fn roundtrip() {
        let data = b"compressible payload ".repeat(2048);
        let (compressed, header) = transform().forward(&data).unwrap();
        assert!(compressed.len() < data.len());
        assert!(header.is_null());
        assert_eq!(transform().inverse(&compressed, &header).unwrap(), data);
    }

    #[test]
    fn rejects_out_of_range_level() {
        let config: serde_yaml::Value = serde_yaml::from_str("level: 99").unwrap();
        assert!(matches!(
            ZstdTransform::new("zstd", &config),
            Err(TransformError::InvalidConfiguration { .. })
        ));
    }

    #[test]
    fn garbage_input_fails_to_decompress() {
        assert!(matches!(
            transform().inverse(b"not zstd framed data", &serde_json::Value::Null),
            Err(TransformError::Codec { .. })
        ));
    }
}
