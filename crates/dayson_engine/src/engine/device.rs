//! Device (wgpu) implementation of the math engine.
//!
//! Every kernel is a WGSL entry point compiled into a compute pipeline when
//! the engine is constructed. A dispatch marshals its arguments through
//! [`KernelArg`]: buffers bind in order starting at binding 1, scalars pack
//! in order into the binding-0 uniform. The type of each argument is fixed
//! by the enum; there is no dynamic argument list to get wrong at runtime.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use wgpu::util::DeviceExt;

use crate::error::{EngineError, Result};
use crate::gpu::{shaders, sync::SyncGuard, GpuContext};
use crate::tensor::{DeviceTensor, HostTensor, Tensor};

use super::{MathEngine, ADAM_STEP_CLAMP};

/// Dispatches between full queue drains; bounds the unacked command queue.
const PERIODIC_SYNC_INTERVAL: u64 = 100;

/// Cap for grid-stride 1D dispatches.
const MAX_GROUPS_1D: u32 = 65_535;

/// One argument of a kernel dispatch.
pub enum KernelArg<'a> {
    /// A device tensor; its storage buffer binds at the next slot.
    Tensor(&'a DeviceTensor),
    /// A raw device buffer (index lists, partial-sum scratch).
    Buffer(&'a wgpu::Buffer),
    /// A 32-bit integer packed into the params uniform.
    Int(i32),
    /// A 32-bit float packed into the params uniform.
    Float(f32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Kernel {
    Matmul,
    MatmulAt,
    MatmulBt,
    AddElem,
    SubElem,
    MulElem,
    Axpy,
    SigmoidFwd,
    TanhFwd,
    SigmoidBwd,
    TanhBwd,
    ClipRange,
    ScaleBy,
    SanitizeClip,
    SoftmaxRows,
    LayerNormRows,
    AddBias,
    LookupRow,
    ScatterSetRow,
    ScatterAddRow,
    OneHot,
    SumOfSquares,
    AdamUpdate,
}

impl Kernel {
    const ALL: [Kernel; 23] = [
        Kernel::Matmul,
        Kernel::MatmulAt,
        Kernel::MatmulBt,
        Kernel::AddElem,
        Kernel::SubElem,
        Kernel::MulElem,
        Kernel::Axpy,
        Kernel::SigmoidFwd,
        Kernel::TanhFwd,
        Kernel::SigmoidBwd,
        Kernel::TanhBwd,
        Kernel::ClipRange,
        Kernel::ScaleBy,
        Kernel::SanitizeClip,
        Kernel::SoftmaxRows,
        Kernel::LayerNormRows,
        Kernel::AddBias,
        Kernel::LookupRow,
        Kernel::ScatterSetRow,
        Kernel::ScatterAddRow,
        Kernel::OneHot,
        Kernel::SumOfSquares,
        Kernel::AdamUpdate,
    ];

    fn entry(self) -> &'static str {
        match self {
            Kernel::Matmul => "matmul",
            Kernel::MatmulAt => "matmul_at",
            Kernel::MatmulBt => "matmul_bt",
            Kernel::AddElem => "add_elem",
            Kernel::SubElem => "sub_elem",
            Kernel::MulElem => "mul_elem",
            Kernel::Axpy => "axpy",
            Kernel::SigmoidFwd => "sigmoid_fwd",
            Kernel::TanhFwd => "tanh_fwd",
            Kernel::SigmoidBwd => "sigmoid_bwd",
            Kernel::TanhBwd => "tanh_bwd",
            Kernel::ClipRange => "clip_range",
            Kernel::ScaleBy => "scale_by",
            Kernel::SanitizeClip => "sanitize_clip",
            Kernel::SoftmaxRows => "softmax_rows",
            Kernel::LayerNormRows => "layer_norm_rows",
            Kernel::AddBias => "add_bias",
            Kernel::LookupRow => "lookup_row",
            Kernel::ScatterSetRow => "scatter_set_row",
            Kernel::ScatterAddRow => "scatter_add_row",
            Kernel::OneHot => "one_hot",
            Kernel::SumOfSquares => "sum_of_squares",
            Kernel::AdamUpdate => "adam_update",
        }
    }

    /// (module key, module source) this entry point lives in.
    fn module(self) -> (&'static str, &'static str) {
        match self {
            Kernel::Matmul | Kernel::MatmulAt | Kernel::MatmulBt => ("matmul", shaders::MATMUL),
            Kernel::AddElem | Kernel::SubElem | Kernel::MulElem => {
                ("elementwise", shaders::ELEMENTWISE)
            }
            Kernel::Axpy => ("axpy", shaders::AXPY),
            Kernel::SigmoidFwd | Kernel::TanhFwd | Kernel::SigmoidBwd | Kernel::TanhBwd => {
                ("activation", shaders::ACTIVATION)
            }
            Kernel::ClipRange | Kernel::ScaleBy | Kernel::SanitizeClip => {
                ("inplace", shaders::INPLACE)
            }
            Kernel::SoftmaxRows => ("softmax", shaders::SOFTMAX),
            Kernel::LayerNormRows => ("layer_norm", shaders::LAYER_NORM),
            Kernel::AddBias => ("broadcast", shaders::BROADCAST),
            Kernel::LookupRow | Kernel::ScatterSetRow | Kernel::ScatterAddRow => {
                ("embedding", shaders::EMBEDDING)
            }
            Kernel::OneHot => ("onehot", shaders::ONEHOT),
            Kernel::SumOfSquares => ("reduce", shaders::REDUCE),
            Kernel::AdamUpdate => ("adam", shaders::ADAM),
        }
    }
}

pub struct DeviceEngine {
    ctx: Arc<GpuContext>,
    pipelines: HashMap<Kernel, wgpu::ComputePipeline>,
    dispatch_count: AtomicU64,
}

impl DeviceEngine {
    /// Compile the whole kernel catalog. Fails if any module does not
    /// validate on this adapter.
    pub fn new(ctx: Arc<GpuContext>) -> Result<Self> {
        let mut modules: HashMap<&'static str, wgpu::ShaderModule> = HashMap::new();
        for kernel in Kernel::ALL {
            let (key, source) = kernel.module();
            modules.entry(key).or_insert_with(|| {
                ctx.device()
                    .create_shader_module(wgpu::ShaderModuleDescriptor {
                        label: Some(key),
                        source: wgpu::ShaderSource::Wgsl(source.into()),
                    })
            });
        }

        let mut pipelines = HashMap::new();
        for kernel in Kernel::ALL {
            let (key, _) = kernel.module();
            let module = &modules[key];
            let pipeline =
                ctx.device()
                    .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                        label: Some(kernel.entry()),
                        layout: None,
                        module,
                        entry_point: Some(kernel.entry()),
                        compilation_options: Default::default(),
                        cache: None,
                    });
            pipelines.insert(kernel, pipeline);
        }
        if ctx.take_fault() {
            return Err(EngineError::device("catalog", "kernel compilation failed"));
        }
        tracing::info!(
            "device engine ready: {} kernels on `{}`",
            pipelines.len(),
            ctx.adapter_name()
        );
        Ok(Self {
            ctx,
            pipelines,
            dispatch_count: AtomicU64::new(0),
        })
    }

    pub fn context(&self) -> &Arc<GpuContext> {
        &self.ctx
    }

    fn dispatch(&self, kernel: Kernel, args: &[KernelArg], groups: (u32, u32, u32)) -> Result<()> {
        let pipeline = self
            .pipelines
            .get(&kernel)
            .ok_or_else(|| EngineError::device(kernel.entry(), "kernel not in catalog"))?;

        let mut scalars: Vec<u32> = Vec::new();
        let mut buffers: Vec<&wgpu::Buffer> = Vec::new();
        for arg in args {
            match arg {
                KernelArg::Tensor(t) => buffers.push(t.buffer()),
                KernelArg::Buffer(b) => buffers.push(b),
                KernelArg::Int(v) => scalars.push(*v as u32),
                KernelArg::Float(v) => scalars.push(v.to_bits()),
            }
        }
        // Uniform buffers bind in 16-byte granules.
        while scalars.len() % 4 != 0 {
            scalars.push(0);
        }
        let params = self
            .ctx
            .device()
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("params"),
                contents: bytemuck::cast_slice(&scalars),
                usage: wgpu::BufferUsages::UNIFORM,
            });

        let layout = pipeline.get_bind_group_layout(0);
        let mut entries = Vec::with_capacity(buffers.len() + 1);
        entries.push(wgpu::BindGroupEntry {
            binding: 0,
            resource: params.as_entire_binding(),
        });
        for (i, buffer) in buffers.iter().enumerate() {
            entries.push(wgpu::BindGroupEntry {
                binding: (i + 1) as u32,
                resource: buffer.as_entire_binding(),
            });
        }
        let bind_group = self
            .ctx
            .device()
            .create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(kernel.entry()),
                layout: &layout,
                entries: &entries,
            });

        let mut encoder =
            self.ctx
                .device()
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some(kernel.entry()),
                });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(kernel.entry()),
                timestamp_writes: None,
            });
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(groups.0, groups.1, groups.2);
        }
        self.ctx.queue().submit(std::iter::once(encoder.finish()));

        if self.ctx.take_fault() {
            return Err(EngineError::device(
                kernel.entry(),
                format!("device fault after dispatch of {} arguments", args.len()),
            ));
        }

        let count = self.dispatch_count.fetch_add(1, Ordering::Relaxed) + 1;
        if count % PERIODIC_SYNC_INTERVAL == 0 {
            self.ctx.sync().synchronize_before_read("periodic")?;
        }
        Ok(())
    }

    fn groups_1d(len: usize) -> u32 {
        (((len + 255) / 256) as u32).clamp(1, MAX_GROUPS_1D)
    }

    fn groups_rows(rows: usize) -> u32 {
        (((rows + 63) / 64) as u32).max(1)
    }

    fn matmul_common(
        &self,
        kernel: Kernel,
        a: &Tensor,
        b: &Tensor,
        c: &mut Tensor,
        rows: usize,
        inner: usize,
        cols: usize,
    ) -> Result<()> {
        if rows == 0 || cols == 0 {
            return Ok(());
        }
        let (a, b, c) = (a.as_device()?, b.as_device()?, c.as_device()?);
        self.dispatch(
            kernel,
            &[
                KernelArg::Int(rows as i32),
                KernelArg::Int(inner as i32),
                KernelArg::Int(cols as i32),
                KernelArg::Tensor(a),
                KernelArg::Tensor(b),
                KernelArg::Tensor(c),
            ],
            (
                ((cols + 15) / 16) as u32,
                ((rows + 15) / 16) as u32,
                1,
            ),
        )
    }

    fn binary_elementwise(
        &self,
        kernel: Kernel,
        a: &Tensor,
        b: &Tensor,
        out: &mut Tensor,
    ) -> Result<()> {
        if a.shape() != b.shape() || a.shape() != out.shape() {
            return Err(EngineError::InvalidArgument(format!(
                "{}: shapes {:?} / {:?} / {:?}",
                kernel.entry(),
                a.shape(),
                b.shape(),
                out.shape()
            )));
        }
        let len = a.len();
        if len == 0 {
            return Ok(());
        }
        let (a, b, out) = (a.as_device()?, b.as_device()?, out.as_device()?);
        self.dispatch(
            kernel,
            &[
                KernelArg::Int(len as i32),
                KernelArg::Tensor(a),
                KernelArg::Tensor(b),
                KernelArg::Tensor(out),
            ],
            (Self::groups_1d(len), 1, 1),
        )
    }

    fn unary(&self, kernel: Kernel, x: &Tensor, out: &mut Tensor) -> Result<()> {
        if x.shape() != out.shape() {
            return Err(EngineError::InvalidArgument(format!(
                "{}: shapes {:?} / {:?}",
                kernel.entry(),
                x.shape(),
                out.shape()
            )));
        }
        let len = x.len();
        if len == 0 {
            return Ok(());
        }
        let (x, out) = (x.as_device()?, out.as_device()?);
        self.dispatch(
            kernel,
            &[
                KernelArg::Int(len as i32),
                KernelArg::Tensor(x),
                KernelArg::Tensor(out),
            ],
            (Self::groups_1d(len), 1, 1),
        )
    }

    fn inplace(&self, kernel: Kernel, x: &mut Tensor, a: f32, b: f32) -> Result<()> {
        let len = x.len();
        if len == 0 {
            return Ok(());
        }
        let x = x.as_device()?;
        self.dispatch(
            kernel,
            &[
                KernelArg::Int(len as i32),
                KernelArg::Float(a),
                KernelArg::Float(b),
                KernelArg::Tensor(x),
            ],
            (Self::groups_1d(len), 1, 1),
        )
    }
}

impl MathEngine for DeviceEngine {
    fn backend_name(&self) -> &'static str {
        "device"
    }

    fn sync_guard(&self) -> Option<&SyncGuard> {
        Some(self.ctx.sync())
    }

    fn create(&self, shape: &[usize]) -> Result<Tensor> {
        let len = crate::tensor::element_count(shape)?;
        // wgpu zero-initializes fresh buffers.
        let buffer = self.ctx.alloc_f32("tensor", len)?;
        Ok(Tensor::Device(DeviceTensor::new(
            Arc::clone(&self.ctx),
            shape,
            buffer,
        )?))
    }

    fn create_from(&self, data: &[f32], shape: &[usize]) -> Result<Tensor> {
        if let Some(bad) = data.iter().find(|v| !v.is_finite()) {
            return Err(EngineError::InvalidArgument(format!(
                "create_from rejects non-finite value {}",
                bad
            )));
        }
        let host = HostTensor::from_vec(data.to_vec(), shape)?;
        self.upload(&host)
    }

    fn upload(&self, host: &HostTensor) -> Result<Tensor> {
        let buffer = self.ctx.upload_f32("tensor", host.data())?;
        Ok(Tensor::Device(DeviceTensor::new(
            Arc::clone(&self.ctx),
            host.shape(),
            buffer,
        )?))
    }

    fn download(&self, tensor: &Tensor) -> Result<HostTensor> {
        tensor.to_host()
    }

    fn matmul(&self, a: &Tensor, b: &Tensor, c: &mut Tensor) -> Result<()> {
        let (m, n) = a.dims2()?;
        let (n2, p) = b.dims2()?;
        let (mc, pc) = c.dims2()?;
        if n != n2 || m != mc || p != pc {
            return Err(EngineError::InvalidArgument(format!(
                "matmul shapes [{},{}]·[{},{}] -> [{},{}]",
                m, n, n2, p, mc, pc
            )));
        }
        self.matmul_common(Kernel::Matmul, a, b, c, m, n, p)
    }

    fn matmul_at(&self, a: &Tensor, b: &Tensor, c: &mut Tensor) -> Result<()> {
        let (k, m) = a.dims2()?;
        let (k2, p) = b.dims2()?;
        let (mc, pc) = c.dims2()?;
        if k != k2 || m != mc || p != pc {
            return Err(EngineError::InvalidArgument(format!(
                "matmul_at shapes [{},{}]ᵀ·[{},{}] -> [{},{}]",
                k, m, k2, p, mc, pc
            )));
        }
        self.matmul_common(Kernel::MatmulAt, a, b, c, m, k, p)
    }

    fn matmul_bt(&self, a: &Tensor, b: &Tensor, c: &mut Tensor) -> Result<()> {
        let (m, k) = a.dims2()?;
        let (p, k2) = b.dims2()?;
        let (mc, pc) = c.dims2()?;
        if k != k2 || m != mc || p != pc {
            return Err(EngineError::InvalidArgument(format!(
                "matmul_bt shapes [{},{}]·[{},{}]ᵀ -> [{},{}]",
                m, k, p, k2, mc, pc
            )));
        }
        self.matmul_common(Kernel::MatmulBt, a, b, c, m, k, p)
    }

    fn add(&self, a: &Tensor, b: &Tensor, out: &mut Tensor) -> Result<()> {
        self.binary_elementwise(Kernel::AddElem, a, b, out)
    }

    fn sub(&self, a: &Tensor, b: &Tensor, out: &mut Tensor) -> Result<()> {
        self.binary_elementwise(Kernel::SubElem, a, b, out)
    }

    fn mul(&self, a: &Tensor, b: &Tensor, out: &mut Tensor) -> Result<()> {
        self.binary_elementwise(Kernel::MulElem, a, b, out)
    }

    fn add_broadcast(&self, m: &mut Tensor, bias: &Tensor) -> Result<()> {
        let (rows, cols) = m.dims2()?;
        if bias.len() != cols {
            return Err(EngineError::InvalidArgument(format!(
                "bias of {} values against {} columns",
                bias.len(),
                cols
            )));
        }
        if rows * cols == 0 {
            return Ok(());
        }
        let (m, bias) = (m.as_device()?, bias.as_device()?);
        self.dispatch(
            Kernel::AddBias,
            &[
                KernelArg::Int(rows as i32),
                KernelArg::Int(cols as i32),
                KernelArg::Tensor(m),
                KernelArg::Tensor(bias),
            ],
            (Self::groups_1d(rows * cols), 1, 1),
        )
    }

    fn add_scaled(&self, dst: &mut Tensor, src: &Tensor, s: f32) -> Result<()> {
        if dst.shape() != src.shape() {
            return Err(EngineError::InvalidArgument(format!(
                "axpy shapes {:?} / {:?}",
                dst.shape(),
                src.shape()
            )));
        }
        let len = dst.len();
        if len == 0 {
            return Ok(());
        }
        let (dst, src) = (dst.as_device()?, src.as_device()?);
        self.dispatch(
            Kernel::Axpy,
            &[
                KernelArg::Int(len as i32),
                KernelArg::Float(s),
                KernelArg::Tensor(dst),
                KernelArg::Tensor(src),
            ],
            (Self::groups_1d(len), 1, 1),
        )
    }

    fn sub_scaled(&self, dst: &mut Tensor, src: &Tensor, s: f32) -> Result<()> {
        self.add_scaled(dst, src, -s)
    }

    fn sigmoid(&self, x: &Tensor, out: &mut Tensor) -> Result<()> {
        self.unary(Kernel::SigmoidFwd, x, out)
    }

    fn tanh(&self, x: &Tensor, out: &mut Tensor) -> Result<()> {
        self.unary(Kernel::TanhFwd, x, out)
    }

    fn sigmoid_deriv(&self, y: &Tensor, out: &mut Tensor) -> Result<()> {
        self.unary(Kernel::SigmoidBwd, y, out)
    }

    fn tanh_deriv(&self, y: &Tensor, out: &mut Tensor) -> Result<()> {
        self.unary(Kernel::TanhBwd, y, out)
    }

    fn softmax(&self, x: &Tensor, out: &mut Tensor) -> Result<()> {
        if x.shape() != out.shape() {
            return Err(EngineError::InvalidArgument(format!(
                "softmax shapes {:?} / {:?}",
                x.shape(),
                out.shape()
            )));
        }
        let (rows, cols) = x.dims2()?;
        if rows == 0 || cols == 0 {
            return Ok(());
        }
        let (x, out) = (x.as_device()?, out.as_device()?);
        self.dispatch(
            Kernel::SoftmaxRows,
            &[
                KernelArg::Int(rows as i32),
                KernelArg::Int(cols as i32),
                KernelArg::Tensor(x),
                KernelArg::Tensor(out),
            ],
            (Self::groups_rows(rows), 1, 1),
        )
    }

    fn layer_norm(&self, x: &mut Tensor, gamma: &Tensor, beta: &Tensor, eps: f32) -> Result<()> {
        let (rows, cols) = x.dims2()?;
        if gamma.len() != cols || beta.len() != cols {
            return Err(EngineError::InvalidArgument(format!(
                "layer_norm γ/β of {}/{} values against {} columns",
                gamma.len(),
                beta.len(),
                cols
            )));
        }
        if rows == 0 || cols == 0 {
            return Ok(());
        }
        let (x, gamma, beta) = (x.as_device()?, gamma.as_device()?, beta.as_device()?);
        self.dispatch(
            Kernel::LayerNormRows,
            &[
                KernelArg::Int(rows as i32),
                KernelArg::Int(cols as i32),
                KernelArg::Float(eps),
                KernelArg::Tensor(x),
                KernelArg::Tensor(gamma),
                KernelArg::Tensor(beta),
            ],
            (Self::groups_rows(rows), 1, 1),
        )
    }

    fn lookup(&self, table: &Tensor, index: usize, out: &mut Tensor) -> Result<()> {
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
        if cols == 0 {
            return Ok(());
        }
        let (table, out) = (table.as_device()?, out.as_device()?);
        self.dispatch(
            Kernel::LookupRow,
            &[
                KernelArg::Int(cols as i32),
                KernelArg::Int(index as i32),
                KernelArg::Tensor(table),
                KernelArg::Tensor(out),
            ],
            (Self::groups_1d(cols), 1, 1),
        )
    }

    fn accumulate_gradient(&self, grad: &mut Tensor, row: &Tensor, index: usize) -> Result<()> {
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
        if cols == 0 {
            return Ok(());
        }
        let (grad, row) = (grad.as_device()?, row.as_device()?);
        self.dispatch(
            Kernel::ScatterAddRow,
            &[
                KernelArg::Int(cols as i32),
                KernelArg::Int(index as i32),
                KernelArg::Tensor(grad),
                KernelArg::Tensor(row),
            ],
            (Self::groups_1d(cols), 1, 1),
        )
    }

    fn one_hot(&self, indices: &[u32], classes: usize) -> Result<Tensor> {
        for &idx in indices {
            if idx as usize >= classes {
                return Err(EngineError::InvalidArgument(format!(
                    "one_hot index {} out of {} classes",
                    idx, classes
                )));
            }
        }
        let mut out = self.create(&[indices.len(), classes])?;
        if indices.is_empty() || classes == 0 {
            return Ok(out);
        }
        let index_buf = self.ctx.upload_u32("one_hot_indices", indices)?;
        {
            let out_dev = out.as_device_mut()?;
            self.dispatch(
                Kernel::OneHot,
                &[
                    KernelArg::Int(indices.len() as i32),
                    KernelArg::Int(classes as i32),
                    KernelArg::Tensor(out_dev),
                    KernelArg::Buffer(&index_buf),
                ],
                (Self::groups_rows(indices.len()), 1, 1),
            )?;
        }
        Ok(out)
    }

    fn set_row(&self, dst: &mut Tensor, row: usize, src: &Tensor) -> Result<()> {
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
        if cols == 0 {
            return Ok(());
        }
        let (dst, src) = (dst.as_device()?, src.as_device()?);
        self.dispatch(
            Kernel::ScatterSetRow,
            &[
                KernelArg::Int(cols as i32),
                KernelArg::Int(row as i32),
                KernelArg::Tensor(dst),
                KernelArg::Tensor(src),
            ],
            (Self::groups_1d(cols), 1, 1),
        )
    }

    fn slice_row(&self, src: &Tensor, row: usize, out: &mut Tensor) -> Result<()> {
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
        if cols == 0 {
            return Ok(());
        }
        let (src, out) = (src.as_device()?, out.as_device()?);
        self.dispatch(
            Kernel::LookupRow,
            &[
                KernelArg::Int(cols as i32),
                KernelArg::Int(row as i32),
                KernelArg::Tensor(src),
                KernelArg::Tensor(out),
            ],
            (Self::groups_1d(cols), 1, 1),
        )
    }

    fn clip(&self, x: &mut Tensor, lo: f32, hi: f32) -> Result<()> {
        self.inplace(Kernel::ClipRange, x, lo, hi)
    }

    fn scale(&self, x: &mut Tensor, s: f32) -> Result<()> {
        self.inplace(Kernel::ScaleBy, x, s, 0.0)
    }

    fn sanitize_and_clip(&self, x: &mut Tensor, bound: f32) -> Result<()> {
        self.inplace(Kernel::SanitizeClip, x, bound, 0.0)
    }

    fn sum_of_squares(&self, x: &Tensor) -> Result<f64> {
        let len = x.len();
        if len == 0 {
            return Ok(0.0);
        }
        let groups = (((len + 255) / 256) as u32).clamp(1, 1024);
        let partials = self.ctx.alloc_f32("sos_partials", groups as usize)?;
        {
            let x = x.as_device()?;
            self.dispatch(
                Kernel::SumOfSquares,
                &[
                    KernelArg::Int(len as i32),
                    KernelArg::Tensor(x),
                    KernelArg::Buffer(&partials),
                ],
                (groups, 1, 1),
            )?;
        }
        let sums = self.ctx.read_buffer_f32(&partials, groups as usize)?;
        Ok(sums.iter().map(|&v| v as f64).sum())
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
        let len = p.len();
        if g.len() != len || m.len() != len || v.len() != len {
            return Err(EngineError::InvalidArgument(format!(
                "adam_update lengths p={} g={} m={} v={}",
                len,
                g.len(),
                m.len(),
                v.len()
            )));
        }
        if len == 0 {
            return Ok(());
        }
        let bias1 = 1.0 - beta1.powi(t);
        let bias2 = 1.0 - beta2.powi(t);
        let (p, g, m, v) = (
            p.as_device()?,
            g.as_device()?,
            m.as_device()?,
            v.as_device()?,
        );
        self.dispatch(
            Kernel::AdamUpdate,
            &[
                KernelArg::Int(len as i32),
                KernelArg::Float(lr),
                KernelArg::Float(beta1),
                KernelArg::Float(beta2),
                KernelArg::Float(eps),
                KernelArg::Float(bias1),
                KernelArg::Float(bias2),
                KernelArg::Float(ADAM_STEP_CLAMP),
                KernelArg::Tensor(p),
                KernelArg::Tensor(g),
                KernelArg::Tensor(m),
                KernelArg::Tensor(v),
            ],
            (Self::groups_1d(len), 1, 1),
        )
    }
}
