//! Tensor variants and their on-disk record format.
//!
//! A tensor is a shape, a total element count, and a dense row-major `f32`
//! buffer. The buffer lives either in host memory ([`HostTensor`]) or on the
//! compute device ([`DeviceTensor`]). Both serialize to the same fixed
//! little-endian record:
//!
//! ```text
//! rank:i32 | dim_0:i32 .. dim_{rank-1}:i32 | length:i64 | f32 * length
//! ```
//!
//! Readers must verify `length == product(dims)` and `rank in [1, 10]`;
//! anything else is corruption, not a recoverable condition.

use std::io::{Read, Write};
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{EngineError, Result};
use crate::gpu::GpuContext;

/// Maximum rank accepted by the record format.
pub const MAX_RANK: usize = 10;

/// Validate a shape and return its element count.
pub fn element_count(shape: &[usize]) -> Result<usize> {
    if shape.is_empty() || shape.len() > MAX_RANK {
        return Err(EngineError::InvalidArgument(format!(
            "rank {} outside [1, {}]",
            shape.len(),
            MAX_RANK
        )));
    }
    let mut count: i64 = 1;
    for &d in shape {
        if d == 0 {
            return Ok(0);
        }
        if d > i32::MAX as usize {
            return Err(EngineError::InvalidArgument(format!(
                "dimension {} exceeds i32 range",
                d
            )));
        }
        count = count.checked_mul(d as i64).ok_or_else(|| {
            EngineError::InvalidArgument("element count exceeds 63 bits".into())
        })?;
    }
    Ok(count as usize)
}

/// Write the fixed record header.
pub(crate) fn write_header<W: Write>(w: &mut W, shape: &[usize], length: usize) -> Result<()> {
    w.write_i32::<LittleEndian>(shape.len() as i32)?;
    for &d in shape {
        w.write_i32::<LittleEndian>(d as i32)?;
    }
    w.write_i64::<LittleEndian>(length as i64)?;
    Ok(())
}

/// Read and validate the fixed record header, returning the shape.
///
/// `origin` is only used for error reporting.
pub(crate) fn read_header<R: Read>(r: &mut R, origin: &std::path::Path) -> Result<Vec<usize>> {
    let rank = r.read_i32::<LittleEndian>()?;
    if rank < 1 || rank as usize > MAX_RANK {
        return Err(EngineError::corrupt(origin, format!("invalid rank {}", rank)));
    }
    let mut shape = Vec::with_capacity(rank as usize);
    let mut product: i64 = 1;
    for _ in 0..rank {
        let d = r.read_i32::<LittleEndian>()?;
        if d < 0 {
            return Err(EngineError::corrupt(origin, format!("negative dim {}", d)));
        }
        product = product.saturating_mul(d as i64);
        shape.push(d as usize);
    }
    let length = r.read_i64::<LittleEndian>()?;
    if length < 0 || length != product {
        return Err(EngineError::corrupt(
            origin,
            format!("length {} != dim product {}", length, product),
        ));
    }
    Ok(shape)
}

/// A tensor whose buffer lives in host memory.
#[derive(Debug, Clone, PartialEq)]
pub struct HostTensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl HostTensor {
    pub fn zeros(shape: &[usize]) -> Result<Self> {
        let len = element_count(shape)?;
        Ok(Self {
            shape: shape.to_vec(),
            data: vec![0.0; len],
        })
    }

    pub fn from_vec(data: Vec<f32>, shape: &[usize]) -> Result<Self> {
        let len = element_count(shape)?;
        if data.len() != len {
            return Err(EngineError::InvalidArgument(format!(
                "buffer holds {} elements, shape {:?} wants {}",
                data.len(),
                shape,
                len
            )));
        }
        Ok(Self {
            shape: shape.to_vec(),
            data,
        })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    /// Rows/cols view of a rank-2 tensor.
    pub fn dims2(&self) -> Result<(usize, usize)> {
        match self.shape.as_slice() {
            [r, c] => Ok((*r, *c)),
            other => Err(EngineError::InvalidArgument(format!(
                "expected rank 2, got shape {:?}",
                other
            ))),
        }
    }

    /// Serialize header and payload into `w`.
    pub fn write_into<W: Write>(&self, w: &mut W) -> Result<()> {
        write_header(w, &self.shape, self.data.len())?;
        for &v in &self.data {
            w.write_f32::<LittleEndian>(v)?;
        }
        Ok(())
    }

    /// Deserialize a record, validating the header.
    pub fn read_from<R: Read>(r: &mut R, origin: &std::path::Path) -> Result<Self> {
        let shape = read_header(r, origin)?;
        let len = shape.iter().product::<usize>();
        let mut raw = vec![0u8; len * 4];
        r.read_exact(&mut raw).map_err(|e| {
            EngineError::corrupt(origin, format!("payload short of {} elements: {}", len, e))
        })?;
        let mut data = Vec::with_capacity(len);
        for chunk in raw.chunks_exact(4) {
            data.push(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
        }
        Ok(Self { shape, data })
    }

    /// Serialized size in bytes (header + payload).
    pub fn byte_len(&self) -> usize {
        4 + self.shape.len() * 4 + 8 + self.data.len() * 4
    }
}

/// A tensor whose buffer is owned by the compute device.
///
/// The buffer handle is an `Option` so that [`release`](Self::release) can
/// destroy device memory synchronously while the value is still alive (the
/// swap-out path requires durability *then* destruction). Using a released
/// tensor is a bug in the caller and panics.
#[derive(Debug)]
pub struct DeviceTensor {
    ctx: Arc<GpuContext>,
    buffer: Option<wgpu::Buffer>,
    shape: Vec<usize>,
    len: usize,
}

impl DeviceTensor {
    pub(crate) fn new(ctx: Arc<GpuContext>, shape: &[usize], buffer: wgpu::Buffer) -> Result<Self> {
        let len = element_count(shape)?;
        Ok(Self {
            ctx,
            buffer: Some(buffer),
            shape: shape.to_vec(),
            len,
        })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_released(&self) -> bool {
        self.buffer.is_none()
    }

    pub fn dims2(&self) -> Result<(usize, usize)> {
        match self.shape.as_slice() {
            [r, c] => Ok((*r, *c)),
            other => Err(EngineError::InvalidArgument(format!(
                "expected rank 2, got shape {:?}",
                other
            ))),
        }
    }

    /// The underlying device buffer.
    ///
    /// Panics if the tensor has been released: that is a use-after-free of
    /// device memory and must never be reachable from correct code.
    pub fn buffer(&self) -> &wgpu::Buffer {
        match &self.buffer {
            Some(b) => b,
            None => panic!(
                "use of released device tensor (shape {:?}) — device buffer is gone",
                self.shape
            ),
        }
    }

    /// Read the buffer back into host memory. Issues a full device sync
    /// before mapping; see `SyncGuard::synchronize_before_read`.
    pub fn to_host(&self) -> Result<HostTensor> {
        let data = self.ctx.read_buffer_f32(self.buffer(), self.len)?;
        HostTensor::from_vec(data, &self.shape)
    }

    /// Destroy the device buffer now. Idempotent. The queue is drained
    /// first so in-flight kernels never observe a dead buffer.
    pub fn release(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.ctx
                .sync()
                .synchronize_before_dispose("tensor_release", (self.len * 4) as u64);
            buffer.destroy();
        }
    }
}

impl Drop for DeviceTensor {
    fn drop(&mut self) {
        // The destructor must leave no device memory behind.
        self.release();
    }
}

/// The tensor handed around by stores and engines.
#[derive(Debug)]
pub enum Tensor {
    Host(HostTensor),
    Device(DeviceTensor),
}

impl Tensor {
    pub fn shape(&self) -> &[usize] {
        match self {
            Tensor::Host(t) => t.shape(),
            Tensor::Device(t) => t.shape(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Tensor::Host(t) => t.len(),
            Tensor::Device(t) => t.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dims2(&self) -> Result<(usize, usize)> {
        match self {
            Tensor::Host(t) => t.dims2(),
            Tensor::Device(t) => t.dims2(),
        }
    }

    /// Materialize the contents in host memory (device tensors are read
    /// back through the sync guard; host tensors are cloned).
    pub fn to_host(&self) -> Result<HostTensor> {
        match self {
            Tensor::Host(t) => Ok(t.clone()),
            Tensor::Device(t) => t.to_host(),
        }
    }

    /// Drop the backing buffer now (device memory destroyed, host memory
    /// freed). The value remains only as a husk; further use panics for
    /// device tensors.
    pub fn release(&mut self) {
        match self {
            Tensor::Host(t) => {
                t.data = Vec::new();
                t.shape = Vec::new();
            }
            Tensor::Device(t) => t.release(),
        }
    }

    pub fn as_host(&self) -> Result<&HostTensor> {
        match self {
            Tensor::Host(t) => Ok(t),
            Tensor::Device(_) => Err(EngineError::InvalidArgument(
                "expected a host tensor, got a device tensor".into(),
            )),
        }
    }

    pub fn as_host_mut(&mut self) -> Result<&mut HostTensor> {
        match self {
            Tensor::Host(t) => Ok(t),
            Tensor::Device(_) => Err(EngineError::InvalidArgument(
                "expected a host tensor, got a device tensor".into(),
            )),
        }
    }

    pub fn as_device(&self) -> Result<&DeviceTensor> {
        match self {
            Tensor::Device(t) => Ok(t),
            Tensor::Host(_) => Err(EngineError::InvalidArgument(
                "expected a device tensor, got a host tensor".into(),
            )),
        }
    }

    pub fn as_device_mut(&mut self) -> Result<&mut DeviceTensor> {
        match self {
            Tensor::Device(t) => Ok(t),
            Tensor::Host(_) => Err(EngineError::InvalidArgument(
                "expected a device tensor, got a host tensor".into(),
            )),
        }
    }
}

impl From<HostTensor> for Tensor {
    fn from(t: HostTensor) -> Self {
        Tensor::Host(t)
    }
}

impl From<DeviceTensor> for Tensor {
    fn from(t: DeviceTensor) -> Self {
        Tensor::Device(t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let t = HostTensor::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]).unwrap();
        let mut buf = Vec::new();
        t.write_into(&mut buf).unwrap();
        // rank + 2 dims + length + 6 floats
        assert_eq!(buf.len(), 4 + 8 + 8 + 24);
        let back =
            HostTensor::read_from(&mut buf.as_slice(), std::path::Path::new("mem")).unwrap();
        assert_eq!(back, t);
    }

    #[test]
    fn empty_tensor_round_trip() {
        let t = HostTensor::zeros(&[0, 4]).unwrap();
        assert_eq!(t.len(), 0);
        let mut buf = Vec::new();
        t.write_into(&mut buf).unwrap();
        let back =
            HostTensor::read_from(&mut buf.as_slice(), std::path::Path::new("mem")).unwrap();
        assert_eq!(back.shape(), &[0, 4]);
        assert!(back.is_empty());
    }

    #[test]
    fn bad_rank_is_corruption() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&0i32.to_le_bytes());
        let err =
            HostTensor::read_from(&mut buf.as_slice(), std::path::Path::new("mem")).unwrap_err();
        assert!(matches!(err, EngineError::CorruptData { .. }));
    }

    #[test]
    fn length_mismatch_is_corruption() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&2i32.to_le_bytes());
        buf.extend_from_slice(&2i32.to_le_bytes());
        buf.extend_from_slice(&3i32.to_le_bytes());
        buf.extend_from_slice(&7i64.to_le_bytes()); // product is 6
        let err =
            HostTensor::read_from(&mut buf.as_slice(), std::path::Path::new("mem")).unwrap_err();
        assert!(matches!(err, EngineError::CorruptData { .. }));
    }

    #[test]
    fn element_count_rejects_wild_ranks() {
        assert!(element_count(&[]).is_err());
        assert!(element_count(&[1; 11]).is_err());
        assert_eq!(element_count(&[3, 0, 5]).unwrap(), 0);
    }
}
