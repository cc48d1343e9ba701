//! # dayson_engine
//!
//! The zero-RAM training core: a disk-backed tensor lifecycle, a wgpu
//! compute engine with strict synchronization discipline, and an LSTM
//! forward/backward/update pipeline that materializes every intermediate
//! activation to disk between timesteps. The working set on host and
//! device stays bounded regardless of sequence length or epoch count.
//!
//! Crate map:
//! - [`tensor`] — host/device tensor variants and the on-disk record format
//! - [`store`] — [`store::TensorStore`] (persistent, id-keyed),
//!   [`store::SwapStore`] (ephemeral activations),
//!   [`store::BlockStore`] (checksummed batch blocks)
//! - [`gpu`] — device context, sync guard, WGSL kernel catalog
//! - [`engine`] — the [`engine::MathEngine`] op catalog, host + device
//! - [`optim`] — Adam with disk-resident moments
//! - [`lstm`] — the training core itself

pub mod engine;
pub mod error;
pub mod gpu;
pub mod lstm;
pub mod optim;
pub mod store;
pub mod tensor;

pub use engine::{DeviceEngine, HostEngine, MathEngine};
pub use error::{EngineError, Result};
pub use gpu::GpuContext;
pub use lstm::{LstmConfig, LstmCore, LstmWeights, WeightCatalog};
pub use optim::{AdamConfig, AdamOptimizer};
pub use store::{BlockStore, SwapStore, TensorId, TensorStore};
pub use tensor::{DeviceTensor, HostTensor, Tensor};
