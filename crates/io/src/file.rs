//! Raw-image adapter for local files and block device nodes.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::PathBuf;

use serde::Deserialize;
use tracing::debug;

use crate::{IoAdapter, IoError, OpenMode, Uri};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
struct FileIoConfig {
    simultaneous_reads: usize,
    simultaneous_writes: usize,
}

impl Default for FileIoConfig {
    fn default() -> Self {
        Self {
            simultaneous_reads: 3,
            simultaneous_writes: 3,
        }
    }
}

pub struct FileIo {
    uri: String,
    path: PathBuf,
    file: File,
    simultaneous_reads: usize,
    simultaneous_writes: usize,
}

impl FileIo {
    pub fn open(
        uri: &Uri,
        mode: OpenMode,
        configuration: &serde_yaml::Value,
    ) -> Result<Self, IoError> {
        let config: FileIoConfig = if configuration.is_null() {
            FileIoConfig::default()
        } else {
            serde_yaml::from_value(configuration.clone()).map_err(benji_common::ConfigError::from)?
        };

        let path = PathBuf::from(&uri.rest);
        let file = match mode {
            OpenMode::Read => File::open(&path).map_err(|source| IoError::Open {
                path: path.clone(),
                source,
            })?,
            OpenMode::Write { size, force } => {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(&path)
                    .map_err(|source| IoError::Open {
                        path: path.clone(),
                        source,
                    })?;
                let existing = file
                    .metadata()
                    .map_err(|source| IoError::Open {
                        path: path.clone(),
                        source,
                    })?
                    .len();
                if existing > 0 && !force {
                    return Err(IoError::WouldClobber { path });
                }
                // Reset to a hole of the target size; sparse restores then
                // leave untouched regions unmapped.
                file.set_len(0).and_then(|_| file.set_len(size)).map_err(
                    |source| IoError::Open {
                        path: path.clone(),
                        source,
                    },
                )?;
                file
            }
        };

        debug!(uri = %uri.rest, ?mode, "opened file io");
        Ok(Self {
            uri: format!("{}:{}", uri.scheme, uri.rest),
            path,
            file,
            simultaneous_reads: config.simultaneous_reads,
            simultaneous_writes: config.simultaneous_writes,
        })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

impl IoAdapter for FileIo {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn size(&self) -> Result<u64, IoError> {
        self.file
            .metadata()
            .map(|m| m.len())
            .map_err(|source| IoError::Open {
                path: self.path.clone(),
                source,
            })
    }

    fn read(&self, offset: u64, length: usize) -> Result<Vec<u8>, IoError> {
        let mut buffer = vec![0u8; length];
        self.file
            .read_exact_at(&mut buffer, offset)
            .map_err(|source| IoError::Read {
                offset,
                length,
                source,
            })?;
        Ok(buffer)
    }

    fn write(&self, offset: u64, data: &[u8]) -> Result<(), IoError> {
        self.file
            .write_all_at(data, offset)
            .map_err(|source| IoError::Write {
                offset,
                length: data.len(),
                source,
            })
    }

    fn discard(&self, offset: u64, length: u64) -> Result<(), IoError> {
        // Regular files have no discard primitive we can rely on everywhere;
        // a full-extent discard is re-created as a hole, anything smaller is
        // zero-filled.
        let size = self.size()?;
        if offset == 0 && length >= size {
            self.file
                .set_len(0)
                .and_then(|_| self.file.set_len(size))
                .map_err(|source| IoError::Write {
                    offset,
                    length: length as usize,
                    source,
                })
        } else {
            const ZERO_CHUNK: usize = 1 << 20;
            let zeros = vec![0u8; ZERO_CHUNK.min(length as usize)];
            let mut written = 0u64;
            while written < length {
                let chunk = zeros.len().min((length - written) as usize);
                self.write(offset + written, &zeros[..chunk])?;
                written += chunk as u64;
            }
            Ok(())
        }
    }

    fn flush(&self) -> Result<(), IoError> {
        self.file
            .sync_all()
            .map_err(|source| IoError::Flush { source })
    }

    fn simultaneous_reads(&self) -> usize {
        self.simultaneous_reads
    }

    fn simultaneous_writes(&self) -> usize {
        self.simultaneous_writes
    }
}
