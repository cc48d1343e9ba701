//! Kernel sources. Each constant is one WGSL module, compiled once when the
//! device engine is constructed.

pub const MATMUL: &str = include_str!("shaders/matmul.wgsl");
pub const ELEMENTWISE: &str = include_str!("shaders/elementwise.wgsl");
pub const AXPY: &str = include_str!("shaders/axpy.wgsl");
pub const ACTIVATION: &str = include_str!("shaders/activation.wgsl");
pub const INPLACE: &str = include_str!("shaders/inplace.wgsl");
pub const SOFTMAX: &str = include_str!("shaders/softmax.wgsl");
pub const LAYER_NORM: &str = include_str!("shaders/layer_norm.wgsl");
pub const BROADCAST: &str = include_str!("shaders/broadcast.wgsl");
pub const EMBEDDING: &str = include_str!("shaders/embedding.wgsl");
pub const ONEHOT: &str = include_str!("shaders/onehot.wgsl");
pub const REDUCE: &str = include_str!("shaders/reduce.wgsl");
pub const ADAM: &str = include_str!("shaders/adam.wgsl");
