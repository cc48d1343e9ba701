//! Host (CPU) implementation of the math engine.
//!
//! Straightforward loops over flat `f32` rows. Matrix products parallelize
//! over output rows with rayon; everything else is memory-bound and stays
//! single-threaded.

use rayon::prelude::*;

use crate::error::{EngineError, Result};
use crate::gpu::sync::SyncGuard;
use crate::tensor::{HostTensor, Tensor};

use super::{scalar, MathEngine, SOFTMAX_FLOOR};

#[derive(Debug, Default)]
pub struct HostEngine;

impl HostEngine {
    pub fn new() -> Self {
        Self
    }
}

fn host(t: &Tensor) -> Result<&HostTensor> {
    t.as_host()
}

fn host_mut(t: &mut Tensor) -> Result<&mut HostTensor> {
    t.as_host_mut()
}

fn check_equal_shapes(a: &HostTensor, b: &HostTensor) -> Result<()> {
    if a.shape() != b.shape() {
        return Err(EngineError::InvalidArgument(format!(
            "shape mismatch: {:?} vs {:?}",
            a.shape(),
            b.shape()
        )));
    }
    Ok(())
}

/// Row-vector length of a bias/γ/β operand: accepts `[c]` or `[1, c]`.
fn vector_len(t: &HostTensor) -> usize {
    t.len()
}

impl MathEngine for HostEngine {
    fn backend_name(&self) -> &'static str {
        "host"
    }

    fn sync_guard(&self) -> Option<&SyncGuard> {
        None
    }

    fn create(&self, shape: &[usize]) -> Result<Tensor> {
        Ok(Tensor::Host(HostTensor::zeros(shape)?))
    }

    fn create_from(&self, data: &[f32], shape: &[usize]) -> Result<Tensor> {
        if let Some(bad) = data.iter().find(|v| !v.is_finite()) {
            return Err(EngineError::InvalidArgument(format!(
                "create_from rejects non-finite value {}",
                bad
            )));
        }
        Ok(Tensor::Host(HostTensor::from_vec(data.to_vec(), shape)?))
    }

    fn upload(&self, host: &HostTensor) -> Result<Tensor> {
        Ok(Tensor::Host(host.clone()))
    }

    fn download(&self, tensor: &Tensor) -> Result<HostTensor> {
        tensor.to_host()
    }

    fn matmul(&self, a: &Tensor, b: &Tensor, c: &mut Tensor) -> Result<()> {
        let (a, b, c) = (host(a)?, host(b)?, host_mut(c)?);
        let (m, n) = a.dims2()?;
        let (n2, p) = b.dims2()?;
        let (mc, pc) = c.dims2()?;
        if n != n2 || m != mc || p != pc {
            return Err(EngineError::InvalidArgument(format!(
                "matmul shapes [{},{}]·[{},{}] -> [{},{}]",
                m, n, n2, p, mc, pc
            )));
        }
        let (av, bv) = (a.data(), b.data());
        c.data_mut()
            .par_chunks_mut(p.max(1))
            .enumerate()
            .for_each(|(i, row)| {
                for (j, out) in row.iter_mut().enumerate() {
                    let mut sum = 0.0f32;
                    for k in 0..n {
                        sum += av[i * n + k] * bv[k * p + j];
                    }
                    *out = sum;
                }
            });
        Ok(())
    }

    fn matmul_at(&self, a: &Tensor, b: &Tensor, c: &mut Tensor) -> Result<()> {
        let (a, b, c) = (host(a)?, host(b)?, host_mut(c)?);
        let (k, m) = a.dims2()?;
        let (k2, p) = b.dims2()?;
        let (mc, pc) = c.dims2()?;
        if k != k2 || m != mc || p != pc {
            return Err(EngineError::InvalidArgument(format!(
                "matmul_at shapes [{},{}]ᵀ·[{},{}] -> [{},{}]",
                k, m, k2, p, mc, pc
            )));
        }
        let (av, bv) = (a.data(), b.data());
        c.data_mut()
            .par_chunks_mut(p.max(1))
            .enumerate()
            .for_each(|(i, row)| {
                for (j, out) in row.iter_mut().enumerate() {
                    let mut sum = 0.0f32;
                    for l in 0..k {
                        sum += av[l * m + i] * bv[l * p + j];
                    }
                    *out = sum;
                }
            });
        Ok(())
    }

    fn matmul_bt(&self, a: &Tensor, b: &Tensor, c: &mut Tensor) -> Result<()> {
        let (a, b, c) = (host(a)?, host(b)?, host_mut(c)?);
        let (m, k) = a.dims2()?;
        let (p, k2) = b.dims2()?;
        let (mc, pc) = c.dims2()?;
        if k != k2 || m != mc || p != pc {
            return Err(EngineError::InvalidArgument(format!(
                "matmul_bt shapes [{},{}]·[{},{}]ᵀ -> [{},{}]",
                m, k, p, k2, mc, pc
            )));
        }
        let (av, bv) = (a.data(), b.data());
        c.data_mut()
            .par_chunks_mut(p.max(1))
            .enumerate()
            .for_each(|(i, row)| {
                for (j, out) in row.iter_mut().enumerate() {
                    let mut sum = 0.0f32;
                    for l in 0..k {
                        sum += av[i * k + l] * bv[j * k + l];
                    }
                    *out = sum;
                }
            });
        Ok(())
    }

    fn add(&self, a: &Tensor, b: &Tensor, out: &mut Tensor) -> Result<()> {
        let (a, b, out) = (host(a)?, host(b)?, host_mut(out)?);
        check_equal_shapes(a, b)?;
        check_equal_shapes(a, out)?;
        for ((o, &x), &y) in out.data_mut().iter_mut().zip(a.data()).zip(b.data()) {
            *o = x + y;
        }
        Ok(())
    }

    fn sub(&self, a: &Tensor, b: &Tensor, out: &mut Tensor) -> Result<()> {
        let (a, b, out) = (host(a)?, host(b)?, host_mut(out)?);
        check_equal_shapes(a, b)?;
        check_equal_shapes(a, out)?;
        for ((o, &x), &y) in out.data_mut().iter_mut().zip(a.data()).zip(b.data()) {
            *o = x - y;
        }
        Ok(())
    }

    fn mul(&self, a: &Tensor, b: &Tensor, out: &mut Tensor) -> Result<()> {
        let (a, b, out) = (host(a)?, host(b)?, host_mut(out)?);
        check_equal_shapes(a, b)?;
        check_equal_shapes(a, out)?;
        for ((o, &x), &y) in out.data_mut().iter_mut().zip(a.data()).zip(b.data()) {
            *o = x * y;
        }
        Ok(())
    }

    fn add_broadcast(&self, m: &mut Tensor, bias: &Tensor) -> Result<()> {
        let bias = host(bias)?;
        let m = host_mut(m)?;
        let (_rows, cols) = m.dims2()?;
        if vector_len(bias) != cols {
            return Err(EngineError::InvalidArgument(format!(
                "bias of {} values against {} columns",
                bias.len(),
                cols
            )));
        }
        let bv = bias.data().to_vec();
        for row in m.data_mut().chunks_exact_mut(cols.max(1)) {
            for (o, &b) in row.iter_mut().zip(&bv) {
                *o += b;
            }
        }
        Ok(())
    }

    fn add_scaled(&self, dst: &mut Tensor, src: &Tensor, s: f32) -> Result<()> {
        let src = host(src)?;
        let dst = host_mut(dst)?;
        check_equal_shapes(dst, src)?;
        for (o, &x) in dst.data_mut().iter_mut().zip(src.data()) {
            *o += s * x;
        }
        Ok(())
    }

    fn sub_scaled(&self, dst: &mut Tensor, src: &Tensor, s: f32) -> Result<()> {
        self.add_scaled(dst, src, -s)
    }

    fn sigmoid(&self, x: &Tensor, out: &mut Tensor) -> Result<()> {
        let x = host(x)?;
        let out = host_mut(out)?;
        check_equal_shapes(x, out)?;
        for (o, &v) in out.data_mut().iter_mut().zip(x.data()) {
            *o = scalar::sigmoid(v);
        }
        Ok(())
    }

    fn tanh(&self, x: &Tensor, out: &mut Tensor) -> Result<()> {
        let x = host(x)?;
        let out = host_mut(out)?;
        check_equal_shapes(x, out)?;
        for (o, &v) in out.data_mut().iter_mut().zip(x.data()) {
            *o = scalar::tanh(v);
        }
        Ok(())
    }

    fn sigmoid_deriv(&self, y: &Tensor, out: &mut Tensor) -> Result<()> {
        let y = host(y)?;
        let out = host_mut(out)?;
        check_equal_shapes(y, out)?;
        for (o, &v) in out.data_mut().iter_mut().zip(y.data()) {
            *o = scalar::sigmoid_deriv(v);
        }
        Ok(())
    }

    fn tanh_deriv(&self, y: &Tensor, out: &mut Tensor) -> Result<()> {
        let y = host(y)?;
        let out = host_mut(out)?;
        check_equal_shapes(y, out)?;
        for (o, &v) in out.data_mut().iter_mut().zip(y.data()) {
            *o = scalar::tanh_deriv(v);
        }
        Ok(())
    }

    fn softmax(&self, x: &Tensor, out: &mut Tensor) -> Result<()> {
        let x = host(x)?;
        let out = host_mut(out)?;
        check_equal_shapes(x, out)?;
        let (_rows, cols) = x.dims2()?;
        if cols == 0 {
            return Ok(());
        }
        for (row_in, row_out) in x
            .data()
            .chunks_exact(cols)
            .zip(out.data_mut().chunks_exact_mut(cols))
        {
            let mut max = f32::NEG_INFINITY;
            for &v in row_in {
                max = max.max(scalar::softmax_presanitize(v));
            }
            let mut sum = 0.0f64;
            for (o, &v) in row_out.iter_mut().zip(row_in) {
                let e = (scalar::softmax_presanitize(v) - max).exp();
                *o = e;
                sum += e as f64;
            }
            if sum < SOFTMAX_FLOOR as f64 {
                let uniform = 1.0 / cols as f32;
                row_out.fill(uniform);
            } else {
                for o in row_out.iter_mut() {
                    *o = (*o / sum as f32).clamp(SOFTMAX_FLOOR, 1.0);
                }
            }
        }
        Ok(())
    }

    fn layer_norm(&self, x: &mut Tensor, gamma: &Tensor, beta: &Tensor, eps: f32) -> Result<()> {
        let gamma = host(gamma)?;
        let beta = host(beta)?;
        let x = host_mut(x)?;
        let (_rows, cols) = x.dims2()?;
        if vector_len(gamma) != cols || vector_len(beta) != cols {
            return Err(EngineError::InvalidArgument(format!(
                "layer_norm γ/β of {}/{} values against {} columns",
                gamma.len(),
                beta.len(),
                cols
            )));
        }
        if cols == 0 {
            return Ok(());
        }
        let (gv, bv) = (gamma.data().to_vec(), beta.data().to_vec());
        for row in x.data_mut().chunks_exact_mut(cols) {
            let mean = row.iter().sum::<f32>() / cols as f32;
            let var = row.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / cols as f32;
            let inv = 1.0 / (var + eps).sqrt();
            for ((v, &g), &b) in row.iter_mut().zip(&gv).zip(&bv) {
                *v = (*v - mean) * inv * g + b;
            }
        }
        Ok(())
    }

    fn lookup(&self, table: &Tensor, index: usize, out: &mut Tensor) -> Result<()> {
        let table = host(table)?;
        let out = host_mut(out)?;
        let (rows, cols) = table.dims2()?;
        if index >= rows {
            return Err(EngineError::InvalidArgument(format!(
                "lookup row {} out of {}",
                index, rows
            )));
        }
        if out.len() != cols {
            return Err(EngineError::InvalidArgument(format!(
                "lookup output of {} values against {} columns",
                out.len(),
                cols
            )));
        }
        out.data_mut()
            .copy_from_slice(&table.data()[index * cols..(index + 1) * cols]);
        Ok(())
    }

    fn accumulate_gradient(&self, grad: &mut Tensor, row: &Tensor, index: usize) -> Result<()> {
        let row = host(row)?;
        let grad = host_mut(grad)?;
        let (rows, cols) = grad.dims2()?;
        if index >= rows {
            return Err(EngineError::InvalidArgument(format!(
                "scatter-add row {} out of {}",
                index, rows
            )));
        }
        if row.len() != cols {
            return Err(EngineError::InvalidArgument(format!(
                "scatter-add row of {} values against {} columns",
                row.len(),
                cols
            )));
        }
        for (o, &v) in grad.data_mut()[index * cols..(index + 1) * cols]
            .iter_mut()
            .zip(row.data())
        {
            *o += v;
        }
        Ok(())
    }

    fn one_hot(&self, indices: &[u32], classes: usize) -> Result<Tensor> {
        let mut t = HostTensor::zeros(&[indices.len(), classes])?;
        for (s, &idx) in indices.iter().enumerate() {
            if (idx as usize) >= classes {
                return Err(EngineError::InvalidArgument(format!(
                    "one_hot index {} out of {} classes",
                    idx, classes
                )));
            }
            t.data_mut()[s * classes + idx as usize] = 1.0;
        }
        Ok(Tensor::Host(t))
    }

    fn set_row(&self, dst: &mut Tensor, row: usize, src: &Tensor) -> Result<()> {
        let src = host(src)?;
        let dst = host_mut(dst)?;
        let (rows, cols) = dst.dims2()?;
        if row >= rows || src.len() != cols {
            return Err(EngineError::InvalidArgument(format!(
                "set_row {} (of {}) with {} values against {} columns",
                row,
                rows,
                src.len(),
                cols
            )));
        }
        dst.data_mut()[row * cols..(row + 1) * cols].copy_from_slice(src.data());
        Ok(())
    }

    fn slice_row(&self, src: &Tensor, row: usize, out: &mut Tensor) -> Result<()> {
        let src = host(src)?;
        let out = host_mut(out)?;
        let (rows, cols) = src.dims2()?;
        if row >= rows || out.len() != cols {
            return Err(EngineError::InvalidArgument(format!(
                "slice_row {} (of {}) into {} values against {} columns",
                row,
                rows,
                out.len(),
                cols
            )));
        }
        out.data_mut()
            .copy_from_slice(&src.data()[row * cols..(row + 1) * cols]);
        Ok(())
    }

    fn clip(&self, x: &mut Tensor, lo: f32, hi: f32) -> Result<()> {
        for v in host_mut(x)?.data_mut() {
            *v = v.clamp(lo, hi);
        }
        Ok(())
    }

    fn scale(&self, x: &mut Tensor, s: f32) -> Result<()> {
        for v in host_mut(x)?.data_mut() {
            *v *= s;
        }
        Ok(())
    }

    fn sanitize_and_clip(&self, x: &mut Tensor, bound: f32) -> Result<()> {
        for v in host_mut(x)?.data_mut() {
            *v = scalar::sanitize(*v, bound);
        }
        Ok(())
    }

    fn sum_of_squares(&self, x: &Tensor) -> Result<f64> {
        Ok(host(x)?
            .data()
            .iter()
            .map(|&v| v as f64 * v as f64)
            .sum())
    }

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
    ) -> Result<()> {
        let g = host(g)?;
        {
            let p = p.as_host()?;
            check_equal_shapes(p, g)?;
            check_equal_shapes(p, m.as_host()?)?;
            check_equal_shapes(p, v.as_host()?)?;
        }
        let bias1 = 1.0 - beta1.powi(t);
        let bias2 = 1.0 - beta2.powi(t);
        let (p, m, v) = (host_mut(p)?, host_mut(m)?, host_mut(v)?);
        for (((pv, &gv), mv), vv) in p
            .data_mut()
            .iter_mut()
            .zip(g.data())
            .zip(m.data_mut().iter_mut())
            .zip(v.data_mut().iter_mut())
        {
            let mut mn = beta1 * *mv + (1.0 - beta1) * gv;
            let mut vn = beta2 * *vv + (1.0 - beta2) * gv * gv;
            if !mn.is_finite() {
                mn = 0.0;
            }
            if !vn.is_finite() {
                vn = 0.0;
            }
            *mv = mn;
            *vv = vn;
            let m_hat = mn / bias1;
            let v_hat = vn / bias2;
            let step = (lr * m_hat / (v_hat.sqrt() + eps))
                .clamp(-super::ADAM_STEP_CLAMP, super::ADAM_STEP_CLAMP);
            *pv -= step;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eng() -> HostEngine {
        HostEngine::new()
    }

    #[test]
    fn matmul_variants_agree_on_transposes() {
        let e = eng();
        // A[2,3], B[3,2]
        let a = e
            .create_from(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3])
            .unwrap();
        let b = e
            .create_from(&[7.0, 8.0, 9.0, 10.0, 11.0, 12.0], &[3, 2])
            .unwrap();
        let mut c = e.create(&[2, 2]).unwrap();
        e.matmul(&a, &b, &mut c).unwrap();
        assert_eq!(c.to_host().unwrap().data(), &[58.0, 64.0, 139.0, 154.0]);

        // Aᵀ path: store A transposed, expect same product.
        let at = e
            .create_from(&[1.0, 4.0, 2.0, 5.0, 3.0, 6.0], &[3, 2])
            .unwrap();
        let mut c2 = e.create(&[2, 2]).unwrap();
        e.matmul_at(&at, &b, &mut c2).unwrap();
        assert_eq!(c2.to_host().unwrap().data(), &[58.0, 64.0, 139.0, 154.0]);

        // Bᵀ path.
        let bt = e
            .create_from(&[7.0, 9.0, 11.0, 8.0, 10.0, 12.0], &[2, 3])
            .unwrap();
        let mut c3 = e.create(&[2, 2]).unwrap();
        e.matmul_bt(&a, &bt, &mut c3).unwrap();
        assert_eq!(c3.to_host().unwrap().data(), &[58.0, 64.0, 139.0, 154.0]);
    }

    #[test]
    fn create_from_rejects_poison() {
        let e = eng();
        assert!(e.create_from(&[1.0, f32::NAN], &[2]).is_err());
        assert!(e.create_from(&[f32::INFINITY], &[1]).is_err());
    }

    #[test]
    fn layer_norm_normalizes_rows() {
        let e = eng();
        let gamma = e.create_from(&[1.0, 1.0, 1.0, 1.0], &[1, 4]).unwrap();
        let beta = e.create_from(&[0.0, 0.0, 0.0, 0.0], &[1, 4]).unwrap();
        let mut x = e
            .create_from(&[1.0, 2.0, 3.0, 4.0], &[1, 4])
            .unwrap();
        e.layer_norm(&mut x, &gamma, &beta, 1e-5).unwrap();
        let h = x.to_host().unwrap();
        let mean: f32 = h.data().iter().sum::<f32>() / 4.0;
        assert!(mean.abs() < 1e-5);
        let var: f32 = h.data().iter().map(|v| v * v).sum::<f32>() / 4.0;
        assert!((var - 1.0).abs() < 1e-3);
    }
}
