//! Append-only store of checksum-protected binary blocks.
//!
//! Layout is a plain concatenation of frames:
//!
//! ```text
//! len:i32_le | checksum:i32_le | payload[len]
//! ```
//!
//! The offset where `len` starts is the handle returned to callers and
//! remains valid for the life of the file. Writes are serialized behind a
//! writer lock and rolled back (truncate) on failure; reads open their own
//! handle under the read lock, so any number of readers can run against a
//! single writer.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tracing::{debug, warn};

use crate::error::{EngineError, Result};

/// Reject any frame claiming a payload above this; nothing the sharder
/// writes comes close, so a larger value means a corrupt header.
const MAX_BLOCK_LEN: i64 = 100 * 1024 * 1024;

/// Free space that must remain on the volume after a write.
const HEADROOM: u64 = 1024 * 1024;

/// Rolling checksum over the payload: `h = h*31 + b`, wrapping i32.
pub fn block_checksum(data: &[u8]) -> i32 {
    let mut h: i32 = 0;
    for &b in data {
        h = h.wrapping_mul(31).wrapping_add(b as i32);
    }
    h
}

struct Writer {
    file: File,
    len: u64,
}

pub struct BlockStore {
    path: PathBuf,
    writer: RwLock<Writer>,
}

impl BlockStore {
    /// Open (or create) the store file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        let len = file.metadata()?.len();
        debug!("block store `{}` opened at {} bytes", path.display(), len);
        Ok(Self {
            path,
            writer: RwLock::new(Writer { file, len }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a block and return its offset.
    ///
    /// The frame is flushed to disk before the offset is returned; a failed
    /// write truncates the file back to its pre-write length so a torn
    /// frame never becomes reachable.
    pub fn store(&self, data: &[u8]) -> Result<u64> {
        let mut writer = self.writer.write().expect("block store writer poisoned");

        let available = fs2::available_space(&self.path)?;
        let needed = data.len() as u64 + HEADROOM;
        if available < needed {
            return Err(EngineError::OutOfSpace {
                needed,
                available,
            });
        }

        let offset = writer.len;
        let result = (|| -> Result<()> {
            writer.file.seek(SeekFrom::Start(offset))?;
            writer.file.write_i32::<LittleEndian>(data.len() as i32)?;
            writer.file.write_i32::<LittleEndian>(block_checksum(data))?;
            writer.file.write_all(data)?;
            writer.file.sync_data()?;
            Ok(())
        })();

        match result {
            Ok(()) => {
                writer.len = offset + 8 + data.len() as u64;
                Ok(offset)
            }
            Err(e) => {
                // Rollback: a partial frame at the tail would shadow every
                // future append.
                if let Err(trunc) = writer.file.set_len(offset) {
                    warn!(
                        "rollback truncate of `{}` to {} failed: {}",
                        self.path.display(),
                        offset,
                        trunc
                    );
                }
                Err(e)
            }
        }
    }

    /// Read the block at `offset`, verifying length bounds and checksum.
    pub fn get(&self, offset: u64) -> Result<Vec<u8>> {
        let _guard = self.writer.read().expect("block store writer poisoned");
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(offset))?;

        let len = file.read_i32::<LittleEndian>()? as i64;
        if len < 0 || len > MAX_BLOCK_LEN {
            return Err(EngineError::corrupt(
                &self.path,
                format!("block at {} claims {} bytes", offset, len),
            ));
        }
        let stored_checksum = file.read_i32::<LittleEndian>()?;

        let mut data = vec![0u8; len as usize];
        file.read_exact(&mut data).map_err(|e| {
            EngineError::corrupt(&self.path, format!("short block at {}: {}", offset, e))
        })?;

        let computed = block_checksum(&data);
        if computed != stored_checksum {
            return Err(EngineError::corrupt(
                &self.path,
                format!(
                    "checksum mismatch at {}: stored {:#010x}, computed {:#010x}",
                    offset, stored_checksum, computed
                ),
            ));
        }
        Ok(data)
    }

    /// Drop every block.
    pub fn clear(&self) -> Result<()> {
        let mut writer = self.writer.write().expect("block store writer poisoned");
        writer.file.set_len(0)?;
        writer.len = 0;
        Ok(())
    }

    /// Current file length in bytes.
    pub fn len_bytes(&self) -> u64 {
        self.writer.read().expect("block store writer poisoned").len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_matches_reference() {
        // h = ((0*31 + 1)*31 + 2)*31 + 3 = 1*961 + 2*31 + 3
        assert_eq!(block_checksum(&[1, 2, 3]), 961 + 62 + 3);
        assert_eq!(block_checksum(&[]), 0);
        // Wrapping behavior on long runs of high bytes must not panic.
        let big = vec![0xFFu8; 4096];
        let _ = block_checksum(&big);
    }

    #[test]
    fn offsets_advance_by_frame_size() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlockStore::open(dir.path().join("blocks.bts")).unwrap();
        let a = store.store(b"alpha").unwrap();
        let b = store.store(b"beta").unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, 8 + 5);
        assert_eq!(store.len_bytes(), b + 8 + 4);
    }
}
