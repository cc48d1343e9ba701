//! The math engine: one op catalog, two backends.
//!
//! [`MathEngine`] is the complete kernel/routine surface the LSTM pipeline
//! needs. [`HostEngine`](host::HostEngine) runs everything as plain loops on
//! host memory; [`DeviceEngine`](device::DeviceEngine) dispatches WGSL
//! kernels on the wgpu queue. Backends are selected once and handed around
//! as `Arc<dyn MathEngine>`; code that needs ordering barriers asks for the
//! capability via [`MathEngine::sync_guard`] instead of downcasting.
//!
//! Numeric discipline is part of every activation contract: inputs are
//! saturated to safe ranges, NaN/Inf collapse to the op's neutral value,
//! and outputs are clamped to their valid interval. No NaN or Inf may leave
//! any kernel.

pub mod device;
pub mod host;

pub use device::{DeviceEngine, KernelArg};
pub use host::HostEngine;

use crate::error::Result;
use crate::gpu::sync::SyncGuard;
use crate::tensor::{HostTensor, Tensor};

/// Input saturation bound for `tanh`.
pub(crate) const TANH_SAT: f32 = 20.0;
/// Input saturation bound for `sigmoid`.
pub(crate) const SIGMOID_SAT: f32 = 88.0;
/// Softmax output floor; also the degenerate-row threshold.
pub(crate) const SOFTMAX_FLOOR: f32 = 1e-10;
/// Per-parameter Adam step clamp.
pub(crate) const ADAM_STEP_CLAMP: f32 = 0.1;

pub trait MathEngine: Send + Sync {
    fn backend_name(&self) -> &'static str;

    /// Ordering-barrier capability. `Some` only for backends with an
    /// asynchronous command queue.
    fn sync_guard(&self) -> Option<&SyncGuard>;

    /// A zero-filled tensor on this backend.
    fn create(&self, shape: &[usize]) -> Result<Tensor>;

    /// A tensor initialized from host data. Rejects NaN/Inf: host-provided
    /// data is the one boundary where poison can enter unnoticed.
    fn create_from(&self, data: &[f32], shape: &[usize]) -> Result<Tensor>;

    /// Move a host tensor onto this backend.
    fn upload(&self, host: &HostTensor) -> Result<Tensor>;

    /// Materialize any tensor of this backend in host memory.
    fn download(&self, tensor: &Tensor) -> Result<HostTensor>;

    /// `C[M,P] = A[M,N] · B[N,P]`, row-major.
    fn matmul(&self, a: &Tensor, b: &Tensor, c: &mut Tensor) -> Result<()>;

    /// `C[M,P] = Aᵀ · B` for `A[K,M]`, `B[K,P]`.
    fn matmul_at(&self, a: &Tensor, b: &Tensor, c: &mut Tensor) -> Result<()>;

    /// `C[M,P] = A · Bᵀ` for `A[M,K]`, `B[P,K]`.
    fn matmul_bt(&self, a: &Tensor, b: &Tensor, c: &mut Tensor) -> Result<()>;

    /// Element-wise sum of equal-shaped tensors.
    fn add(&self, a: &Tensor, b: &Tensor, out: &mut Tensor) -> Result<()>;
    fn sub(&self, a: &Tensor, b: &Tensor, out: &mut Tensor) -> Result<()>;
    fn mul(&self, a: &Tensor, b: &Tensor, out: &mut Tensor) -> Result<()>;

    /// `M[r, c] += bias[c]` for every row, in place on `M`.
    fn add_broadcast(&self, m: &mut Tensor, bias: &Tensor) -> Result<()>;

    /// `dst += s · src`, in place.
    fn add_scaled(&self, dst: &mut Tensor, src: &Tensor, s: f32) -> Result<()>;
    /// `dst -= s · src`, in place.
    fn sub_scaled(&self, dst: &mut Tensor, src: &Tensor, s: f32) -> Result<()>;

    fn sigmoid(&self, x: &Tensor, out: &mut Tensor) -> Result<()>;
    fn tanh(&self, x: &Tensor, out: &mut Tensor) -> Result<()>;

    /// `y·(1−y)` from a sigmoid *output*, clamped to `[0, 0.25]`.
    fn sigmoid_deriv(&self, y: &Tensor, out: &mut Tensor) -> Result<()>;
    /// `1−y²` from a tanh *output*, clamped to `[0, 1]`.
    fn tanh_deriv(&self, y: &Tensor, out: &mut Tensor) -> Result<()>;

    /// Row-wise numerically-stable softmax; degenerate rows become uniform.
    fn softmax(&self, x: &Tensor, out: &mut Tensor) -> Result<()>;

    /// Per-row affine normalization, in place on `x`.
    fn layer_norm(&self, x: &mut Tensor, gamma: &Tensor, beta: &Tensor, eps: f32) -> Result<()>;

    /// Gather row `index` of `table[V,E]` into `out[1,E]`.
    fn lookup(&self, table: &Tensor, index: usize, out: &mut Tensor) -> Result<()>;

    /// Scatter-add `row[1,E]` into row `index` of `grad[V,E]`.
    fn accumulate_gradient(&self, grad: &mut Tensor, row: &Tensor, index: usize) -> Result<()>;

    /// `[S, classes]` one-hot rows from `indices`.
    fn one_hot(&self, indices: &[u32], classes: usize) -> Result<Tensor>;

    /// Copy `src` into row `row` of the rank-2 tensor `dst`.
    fn set_row(&self, dst: &mut Tensor, row: usize, src: &Tensor) -> Result<()>;

    /// Copy row `row` of the rank-2 tensor `src` into `out[1,C]`.
    fn slice_row(&self, src: &Tensor, row: usize, out: &mut Tensor) -> Result<()>;

    /// Clamp every element to `[lo, hi]`, in place.
    fn clip(&self, x: &mut Tensor, lo: f32, hi: f32) -> Result<()>;

    /// Multiply every element by `s`, in place.
    fn scale(&self, x: &mut Tensor, s: f32) -> Result<()>;

    /// NaN/Inf → 0, then clamp to `[-v, v]`, in place.
    fn sanitize_and_clip(&self, x: &mut Tensor, v: f32) -> Result<()>;

    /// `Σ x²` in f64 for numerical headroom.
    fn sum_of_squares(&self, x: &Tensor) -> Result<f64>;

    /// Fused Adam step: updates `p`, `m`, `v` in place. Also sanitizes `m`
    /// and `v`, and clamps the per-parameter update to ±0.1.
    #[allow(clippy::too_many_arguments)]
    fn adam_update(
        &self,
        p: &mut Tensor,
        g: &Tensor,
        m: &mut Tensor,
        v: &mut Tensor,
        lr: f32,
        beta1: f32,
        beta2: f32,
        eps: f32,
        t: i32,
    ) -> Result<()>;
}

/// Shared scalar kernels. The host backend runs these directly; the WGSL
/// kernels implement the same contracts and the tests pin both.
pub(crate) mod scalar {
    use super::*;

    pub fn sigmoid(x: f32) -> f32 {
        if !x.is_finite() {
            return 0.5;
        }
        let x = x.clamp(-SIGMOID_SAT, SIGMOID_SAT);
        let y = 1.0 / (1.0 + (-x).exp());
        y.clamp(0.0, 1.0)
    }

    pub fn tanh(x: f32) -> f32 {
        if !x.is_finite() {
            return 0.0;
        }
        let x = x.clamp(-TANH_SAT, TANH_SAT);
        x.tanh().clamp(-1.0, 1.0)
    }

    pub fn sigmoid_deriv(y: f32) -> f32 {
        let d = y * (1.0 - y);
        if !d.is_finite() {
            return 0.0;
        }
        d.clamp(0.0, 0.25)
    }

    pub fn tanh_deriv(y: f32) -> f32 {
        let d = 1.0 - y * y;
        if !d.is_finite() {
            return 0.0;
        }
        d.clamp(0.0, 1.0)
    }

    /// Collapse non-finite inputs onto the finite number line so the
    /// shifted-exponent softmax cannot overflow.
    pub fn softmax_presanitize(x: f32) -> f32 {
        if x.is_finite() {
            x
        } else if x == f32::INFINITY {
            1e30
        } else {
            -1e30
        }
    }

    pub fn sanitize(x: f32, v: f32) -> f32 {
        if !x.is_finite() {
            0.0
        } else {
            x.clamp(-v, v)
        }
    }
}
