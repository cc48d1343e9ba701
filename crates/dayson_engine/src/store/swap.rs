//! Ephemeral write-through store for BPTT activations.
//!
//! Every intermediate tensor the backward pass needs is written here during
//! the forward pass, and its device memory is destroyed the moment the file
//! is durable. The directory is session-scoped and wiped at construction;
//! a training step must leave it empty again (enforced by the step cleanup
//! and pinned by tests).

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt};
use tracing::{debug, warn};

use crate::error::{EngineError, Result};
use crate::tensor::{HostTensor, Tensor};

pub struct SwapStore {
    dir: PathBuf,
}

impl SwapStore {
    /// Create `<root>/Swap/<session>/`, deleting any previous contents.
    pub fn open(root: impl AsRef<Path>, session: &str) -> Result<Self> {
        let dir = root.as_ref().join("Swap").join(session);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        std::fs::create_dir_all(&dir)?;
        debug!("swap store at `{}`", dir.display());
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Serialize `tensor`, force it to durable storage, then destroy the
    /// in-memory copy (device memory released synchronously). After this
    /// returns, the file is the only copy.
    pub fn swap_out(&self, mut tensor: Tensor, label: &str) -> Result<PathBuf> {
        let host = tensor.to_host()?;
        tensor.release();
        drop(tensor);

        let path = self
            .dir
            .join(format!("{}_{}.swap", label, uuid::Uuid::new_v4()));
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)?;
        let mut writer = BufWriter::new(file);
        host.write_into(&mut writer)?;
        let file = writer
            .into_inner()
            .map_err(|e| EngineError::IoFailure(e.into_error()))?;
        file.sync_all()?;
        Ok(path)
    }

    /// Materialize a fresh host tensor from a swap file. Destruction of the
    /// returned tensor is the caller's business; the file stays until
    /// [`delete`](Self::delete) or [`clear_all`](Self::clear_all).
    pub fn load(&self, path: &Path) -> Result<HostTensor> {
        let file = File::open(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => EngineError::NotFound(path.display().to_string()),
            _ => EngineError::IoFailure(e),
        })?;
        let mut reader = BufReader::new(file);
        HostTensor::read_from(&mut reader, path)
    }

    /// Read a single element without materializing the tensor. Used for the
    /// per-step loss probe against the just-swapped prediction row.
    pub fn read_element(&self, path: &Path, index: usize) -> Result<f32> {
        let mut file = File::open(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => EngineError::NotFound(path.display().to_string()),
            _ => EngineError::IoFailure(e),
        })?;
        let rank = file.read_i32::<LittleEndian>()?;
        if rank < 1 || rank as usize > crate::tensor::MAX_RANK {
            return Err(EngineError::corrupt(path, format!("invalid rank {}", rank)));
        }
        let mut length: i64 = 1;
        for _ in 0..rank {
            let d = file.read_i32::<LittleEndian>()?;
            length = length.saturating_mul(d as i64);
        }
        let recorded = file.read_i64::<LittleEndian>()?;
        if recorded != length || (index as i64) >= length {
            return Err(EngineError::corrupt(
                path,
                format!("element {} out of recorded length {}", index, recorded),
            ));
        }
        let header = (4 + rank * 4 + 8) as u64;
        file.seek(SeekFrom::Start(header + (index * 4) as u64))?;
        Ok(file.read_f32::<LittleEndian>()?)
    }

    pub fn delete(&self, path: &Path) -> Result<()> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EngineError::IoFailure(e)),
        }
    }

    /// Remove every swap file in the session directory. Failures are logged
    /// and swallowed: cleanup must always make progress.
    pub fn clear_all(&self) {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(e) => {
                warn!("swap clear_all: cannot list `{}`: {}", self.dir.display(), e);
                return;
            }
        };
        for entry in entries.flatten() {
            if let Err(e) = std::fs::remove_file(entry.path()) {
                warn!("swap clear_all: `{}`: {}", entry.path().display(), e);
            }
        }
    }

    /// Number of files currently in the session directory.
    pub fn file_count(&self) -> usize {
        std::fs::read_dir(&self.dir)
            .map(|d| d.flatten().count())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn swap_out_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let swap = SwapStore::open(dir.path(), "s1").unwrap();
        let t = HostTensor::from_vec(vec![1.5, -2.5, 3.0], &[1, 3]).unwrap();
        let path = swap.swap_out(Tensor::Host(t.clone()), "probe").unwrap();
        let back = swap.load(&path).unwrap();
        assert_eq!(back, t);
        assert_eq!(swap.read_element(&path, 1).unwrap(), -2.5);
        swap.delete(&path).unwrap();
        assert_eq!(swap.file_count(), 0);
    }

    #[test]
    fn construction_wipes_previous_session() {
        let dir = tempfile::tempdir().unwrap();
        let swap = SwapStore::open(dir.path(), "s1").unwrap();
        let t = HostTensor::zeros(&[2]).unwrap();
        swap.swap_out(Tensor::Host(t), "stale").unwrap();
        assert_eq!(swap.file_count(), 1);
        let swap2 = SwapStore::open(dir.path(), "s1").unwrap();
        assert_eq!(swap2.file_count(), 0);
    }
}
