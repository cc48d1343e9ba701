//! Persistent id-keyed tensor files.
//!
//! One file per tensor under `TensorCache/<session>/<id>.bin`, in the fixed
//! record format from [`crate::tensor`]. The in-memory shape index is
//! authoritative: a load first consults the index, then verifies the file
//! header against it. Weight and state tensors are created once and
//! overwritten in place for the life of a model; gradient accumulators come
//! and go within a single training step.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use byteorder::{LittleEndian, WriteBytesExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{EngineError, Result};
use crate::tensor::{element_count, read_header, HostTensor, Tensor};

/// Stable identity of a stored tensor: `<name>_<seq:08>_<uuid>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TensorId(String);

impl TensorId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TensorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for TensorId {
    fn from(s: String) -> Self {
        TensorId(s)
    }
}

fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .take(48)
        .collect();
    if cleaned.is_empty() {
        "tensor".to_string()
    } else {
        cleaned
    }
}

pub struct TensorStore {
    dir: PathBuf,
    session: String,
    index: RwLock<HashMap<TensorId, Vec<usize>>>,
    sequence: AtomicU64,
    /// Per-id mutexes serializing read-modify-write on the same file.
    update_locks: Mutex<HashMap<TensorId, Arc<Mutex<()>>>>,
}

impl TensorStore {
    /// Open the session directory `<root>/TensorCache/<session>/`.
    pub fn open(root: impl AsRef<Path>, session: &str) -> Result<Self> {
        let dir = root.as_ref().join("TensorCache").join(session);
        std::fs::create_dir_all(&dir)?;
        debug!("tensor store at `{}`", dir.display());
        Ok(Self {
            dir,
            session: session.to_string(),
            index: RwLock::new(HashMap::new()),
            sequence: AtomicU64::new(0),
            update_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn contains(&self, id: &TensorId) -> bool {
        self.index.read().expect("index poisoned").contains_key(id)
    }

    pub fn shape_of(&self, id: &TensorId) -> Result<Vec<usize>> {
        self.index
            .read()
            .expect("index poisoned")
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(id.to_string()))
    }

    /// Snapshot of every registered id.
    pub fn ids(&self) -> Vec<TensorId> {
        self.index
            .read()
            .expect("index poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Number of registered tensors (test support).
    pub fn len(&self) -> usize {
        self.index.read().expect("index poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn file_path(&self, id: &TensorId) -> PathBuf {
        self.dir.join(format!("{}.bin", id))
    }

    fn update_lock(&self, id: &TensorId) -> Arc<Mutex<()>> {
        let mut locks = self.update_locks.lock().expect("update locks poisoned");
        Arc::clone(locks.entry(id.clone()).or_default())
    }

    /// Persist a tensor under a fresh id. Device tensors are read back
    /// through the sync guard first; disk content is always host bytes.
    pub fn store(&self, tensor: &Tensor, name: &str) -> Result<TensorId> {
        let host = tensor.to_host()?;
        self.store_host(&host, name)
    }

    pub fn store_host(&self, tensor: &HostTensor, name: &str) -> Result<TensorId> {
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        let id = TensorId(format!(
            "{}_{:08}_{}",
            sanitize_name(name),
            seq,
            uuid::Uuid::new_v4()
        ));
        let path = self.file_path(&id);

        // create_new: an id collision would mean the counter or uuid broke;
        // refuse to clobber.
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)?;
        let mut writer = BufWriter::new(file);
        let write_result = tensor
            .write_into(&mut writer)
            .and_then(|()| writer.flush().map_err(EngineError::from));
        if let Err(e) = write_result {
            drop(writer);
            if let Err(rm) = std::fs::remove_file(&path) {
                warn!("orphan cleanup of `{}` failed: {}", path.display(), rm);
            }
            return Err(e);
        }

        self.index
            .write()
            .expect("index poisoned")
            .insert(id.clone(), tensor.shape().to_vec());
        Ok(id)
    }

    /// Load a tensor into host memory, verifying the file header against
    /// the index.
    pub fn load(&self, id: &TensorId) -> Result<HostTensor> {
        let expected = self.shape_of(id)?;
        let path = self.file_path(id);
        let file = std::fs::File::open(&path).map_err(|e| {
            // The index claims presence, so a missing file is corruption,
            // not a lookup miss.
            EngineError::corrupt(&path, format!("open failed: {}", e))
        })?;
        let mut reader = BufReader::new(file);
        let shape = read_header(&mut reader, &path)?;
        if shape != expected {
            return Err(EngineError::corrupt(
                &path,
                format!("header shape {:?} != index shape {:?}", shape, expected),
            ));
        }
        let len = element_count(&shape)?;
        let mut raw = vec![0u8; len * 4];
        reader.read_exact(&mut raw).map_err(|e| {
            EngineError::corrupt(&path, format!("payload short of {} elements: {}", len, e))
        })?;
        let mut data = Vec::with_capacity(len);
        for chunk in raw.chunks_exact(4) {
            data.push(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
        }
        HostTensor::from_vec(data, &shape)
    }

    /// Replace the contents (and, if changed, the shape) of an existing id.
    pub fn overwrite(&self, id: &TensorId, tensor: &Tensor) -> Result<()> {
        if !self.contains(id) {
            return Err(EngineError::NotFound(id.to_string()));
        }
        let host = tensor.to_host()?;
        let lock = self.update_lock(id);
        let _guard = lock.lock().expect("update lock poisoned");

        let path = self.file_path(id);
        let file = OpenOptions::new().write(true).create(true).open(&path)?;
        file.set_len(0)?;
        let mut writer = BufWriter::new(file);
        host.write_into(&mut writer)?;
        writer.flush()?;

        self.index
            .write()
            .expect("index poisoned")
            .insert(id.clone(), host.shape().to_vec());
        Ok(())
    }

    /// Replace one row of a rank-2 tensor in place on disk.
    pub fn set_row(&self, id: &TensorId, row: usize, source: &HostTensor) -> Result<()> {
        let shape = self.shape_of(id)?;
        let (rows, cols) = match shape.as_slice() {
            [r, c] => (*r, *c),
            other => {
                return Err(EngineError::InvalidArgument(format!(
                    "set_row on rank-{} tensor",
                    other.len()
                )))
            }
        };
        if row >= rows {
            return Err(EngineError::InvalidArgument(format!(
                "row {} out of {}",
                row, rows
            )));
        }
        if source.len() != cols {
            return Err(EngineError::InvalidArgument(format!(
                "row source holds {} values, tensor has {} columns",
                source.len(),
                cols
            )));
        }

        let lock = self.update_lock(id);
        let _guard = lock.lock().expect("update lock poisoned");

        let path = self.file_path(id);
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        // header: rank + dims + length
        let header_bytes = (4 + shape.len() * 4 + 8) as u64;
        file.seek(SeekFrom::Start(header_bytes + (row * cols * 4) as u64))?;
        let mut writer = BufWriter::new(&mut file);
        for &v in source.data() {
            writer.write_f32::<LittleEndian>(v)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Remove a tensor. Missing files are tolerated: delete is called from
    /// cleanup paths that must not fail twice.
    pub fn delete(&self, id: &TensorId) -> Result<()> {
        self.index.write().expect("index poisoned").remove(id);
        self.update_locks
            .lock()
            .expect("update locks poisoned")
            .remove(id);
        let path = self.file_path(id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!("delete of `{}` failed: {}", path.display(), e);
                Ok(())
            }
        }
    }

    /// File-copy an existing tensor under a new id.
    pub fn clone_tensor(&self, source: &TensorId, new_name: &str) -> Result<TensorId> {
        let shape = self.shape_of(source)?;
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        let id = TensorId(format!(
            "{}_{:08}_{}",
            sanitize_name(new_name),
            seq,
            uuid::Uuid::new_v4()
        ));
        std::fs::copy(self.file_path(source), self.file_path(&id))?;
        self.index
            .write()
            .expect("index poisoned")
            .insert(id.clone(), shape);
        Ok(id)
    }

    /// Re-register an id that exists on disk from an earlier session
    /// (model reload). Reads and validates the header.
    pub fn adopt(&self, id: TensorId) -> Result<()> {
        let path = self.file_path(&id);
        let file = std::fs::File::open(&path)
            .map_err(|_| EngineError::NotFound(id.to_string()))?;
        let mut reader = BufReader::new(file);
        let shape = read_header(&mut reader, &path)?;
        // Keep the sequence counter ahead of adopted ids so fresh ids never
        // collide with re-registered ones.
        if let Some(seq) = parse_sequence(id.as_str()) {
            let _ = self
                .sequence
                .fetch_max(seq + 1, Ordering::SeqCst);
        }
        self.index
            .write()
            .expect("index poisoned")
            .insert(id, shape);
        Ok(())
    }

}

fn parse_sequence(id: &str) -> Option<u64> {
    // <name>_<seq:08>_<uuid>; uuid is 36 chars, seq the 8 before it.
    let bytes = id.as_bytes();
    if bytes.len() < 36 + 1 + 8 {
        return None;
    }
    let seq_end = bytes.len() - 37;
    let seq_start = seq_end.checked_sub(8)?;
    id[seq_start..seq_end].parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_format_and_sequence_parse() {
        let dir = tempfile::tempdir().unwrap();
        let store = TensorStore::open(dir.path(), "s1").unwrap();
        let t = HostTensor::zeros(&[2, 2]).unwrap();
        let id = store.store_host(&t, "weights.gate/f").unwrap();
        assert!(id.as_str().starts_with("weights_gate_f_00000000_"));
        assert_eq!(parse_sequence(id.as_str()), Some(0));
    }

    #[test]
    fn load_of_unknown_id_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = TensorStore::open(dir.path(), "s1").unwrap();
        let err = store.load(&TensorId("ghost_00000000_x".into())).unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[test]
    fn set_row_validates_rank_and_columns() {
        let dir = tempfile::tempdir().unwrap();
        let store = TensorStore::open(dir.path(), "s1").unwrap();
        let id = store
            .store_host(&HostTensor::zeros(&[3, 4]).unwrap(), "m")
            .unwrap();
        let bad = HostTensor::zeros(&[1, 3]).unwrap();
        assert!(store.set_row(&id, 0, &bad).is_err());
        let vec_id = store
            .store_host(&HostTensor::zeros(&[4]).unwrap(), "v")
            .unwrap();
        let row = HostTensor::zeros(&[1, 4]).unwrap();
        assert!(store.set_row(&vec_id, 0, &row).is_err());
    }
}
