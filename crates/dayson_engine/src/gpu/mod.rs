//! GPU compute infrastructure.
//!
//! Uses wgpu for cross-platform compute (Vulkan, Metal, DX12). One
//! [`GpuContext`] owns the device and the single command queue; every
//! ordering barrier goes through its [`SyncGuard`]. Kernel sources live in
//! [`shaders`] and are compiled once when the device engine is built.

pub(crate) mod shaders;
pub mod sync;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{info, warn};

use crate::error::{EngineError, Result};
use sync::SyncGuard;

/// The device/queue pair, shared between the context and its sync guard.
pub(crate) struct GpuHandle {
    pub(crate) device: wgpu::Device,
    pub(crate) queue: wgpu::Queue,
}

/// Shared device + queue handle. Exactly one command queue exists per
/// context; command completion order equals submission order on it.
pub struct GpuContext {
    handle: Arc<GpuHandle>,
    sync: SyncGuard,
    adapter_name: String,
    device_type: wgpu::DeviceType,
    /// Set by the uncaptured-error hook; checked after dispatches.
    fault: Arc<AtomicBool>,
}

impl GpuContext {
    /// Try to acquire a device and queue.
    /// Returns `None` if no adapter is available on this machine.
    pub fn try_new() -> Option<Arc<Self>> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))?;
        let info = adapter.get_info();
        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("dayson-gpu"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
                memory_hints: wgpu::MemoryHints::Performance,
            },
            None,
        ))
        .ok()?;

        if info.device_type == wgpu::DeviceType::Cpu {
            warn!(
                "adapter `{}` is a software rasterizer; compute will run on the host CPU",
                info.name
            );
        } else {
            info!("compute adapter: `{}` ({:?})", info.name, info.backend);
        }

        let fault = Arc::new(AtomicBool::new(false));
        {
            let fault = Arc::clone(&fault);
            device.on_uncaptured_error(Box::new(move |e| {
                tracing::error!("uncaptured device error: {}", e);
                fault.store(true, Ordering::SeqCst);
            }));
        }

        let handle = Arc::new(GpuHandle { device, queue });
        let sync = SyncGuard::new(Arc::clone(&handle));
        Some(Arc::new(Self {
            handle,
            sync,
            adapter_name: info.name,
            device_type: info.device_type,
            fault,
        }))
    }

    pub fn adapter_name(&self) -> &str {
        &self.adapter_name
    }

    pub fn is_software_adapter(&self) -> bool {
        self.device_type == wgpu::DeviceType::Cpu
    }

    pub fn sync(&self) -> &SyncGuard {
        &self.sync
    }

    pub(crate) fn device(&self) -> &wgpu::Device {
        &self.handle.device
    }

    pub(crate) fn queue(&self) -> &wgpu::Queue {
        &self.handle.queue
    }

    /// True if the device reported a fault since the last check; clears the
    /// flag so each fault is surfaced once.
    pub(crate) fn take_fault(&self) -> bool {
        self.fault.swap(false, Ordering::SeqCst)
    }

    /// Allocate a zero-initialized storage buffer of `len` f32 elements.
    pub(crate) fn alloc_f32(&self, label: &str, len: usize) -> Result<wgpu::Buffer> {
        let bytes = (len.max(1) * 4) as u64;
        let limit = self.device().limits().max_buffer_size;
        if bytes > limit {
            return Err(EngineError::OutOfMemory(format!(
                "buffer `{}` of {} bytes exceeds device limit {}",
                label, bytes, limit
            )));
        }
        Ok(self.device().create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: bytes,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        }))
    }

    /// Upload host data into a fresh storage buffer.
    pub(crate) fn upload_f32(&self, label: &str, data: &[f32]) -> Result<wgpu::Buffer> {
        let buffer = self.alloc_f32(label, data.len())?;
        if !data.is_empty() {
            self.queue().write_buffer(&buffer, 0, bytemuck::cast_slice(data));
        }
        Ok(buffer)
    }

    /// Upload a u32 index buffer (kernel side: `array<u32>`).
    pub(crate) fn upload_u32(&self, label: &str, data: &[u32]) -> Result<wgpu::Buffer> {
        let bytes = (data.len().max(1) * 4) as u64;
        let buffer = self.device().create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: bytes,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        if !data.is_empty() {
            self.queue().write_buffer(&buffer, 0, bytemuck::cast_slice(data));
        }
        Ok(buffer)
    }

    /// Copy `count` f32 elements out of `buffer` into host memory.
    ///
    /// This is the only device→host path in the crate. It drains the queue
    /// through the sync guard before mapping, so no shadow copy of the
    /// buffer ever exists while kernels may still write it.
    pub(crate) fn read_buffer_f32(&self, buffer: &wgpu::Buffer, count: usize) -> Result<Vec<f32>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let bytes = (count * 4) as u64;
        let staging = self.device().create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback-staging"),
            size: bytes,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device()
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("readback-encoder"),
            });
        encoder.copy_buffer_to_buffer(buffer, 0, &staging, 0, bytes);
        self.queue().submit(std::iter::once(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.sync.synchronize_before_read("readback")?;
        rx.recv()
            .map_err(|_| EngineError::device("readback", "map channel closed"))?
            .map_err(|e| EngineError::device("readback", e.to_string()))?;

        let data = slice.get_mapped_range();
        let out: Vec<f32> = bytemuck::cast_slice(&data).to_vec();
        drop(data);
        staging.unmap();
        Ok(out)
    }
}

impl std::fmt::Debug for GpuContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuContext")
            .field("adapter", &self.adapter_name)
            .field("device_type", &self.device_type)
            .finish()
    }
}
