//! Adam with disk-resident moments.
//!
//! Per parameter the optimizer holds two TensorStore ids (`m`, `v`) and a
//! timestep counter. The moment files are created lazily on first update,
//! loaded into engine memory only for the duration of the fused kernel, and
//! written straight back. Nothing survives in RAM between updates.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::engine::MathEngine;
use crate::error::Result;
use crate::store::{TensorId, TensorStore};
use crate::tensor::{HostTensor, Tensor};

#[derive(Debug, Clone, Copy)]
pub struct AdamConfig {
    pub beta1: f32,
    pub beta2: f32,
    pub eps: f32,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
        }
    }
}

struct ParamState {
    m: TensorId,
    v: TensorId,
    t: i32,
}

pub struct AdamOptimizer {
    engine: Arc<dyn MathEngine>,
    store: Arc<TensorStore>,
    config: AdamConfig,
    state: HashMap<TensorId, ParamState>,
}

impl AdamOptimizer {
    pub fn new(engine: Arc<dyn MathEngine>, store: Arc<TensorStore>, config: AdamConfig) -> Self {
        Self {
            engine,
            store,
            config,
            state: HashMap::new(),
        }
    }

    /// Apply one fused Adam step to `param` (in engine memory, updated in
    /// place) against `grad`, then persist `m`, `v`, and the parameter.
    pub fn update(
        &mut self,
        param_id: &TensorId,
        param: &mut Tensor,
        grad: &Tensor,
        lr: f32,
    ) -> Result<()> {
        if !self.state.contains_key(param_id) {
            let zeros = HostTensor::zeros(param.shape())?;
            let m = self.store.store_host(&zeros, &format!("adam_m_{}", short(param_id)))?;
            let v = self.store.store_host(&zeros, &format!("adam_v_{}", short(param_id)))?;
            debug!("adam state created for `{}`", param_id);
            self.state
                .insert(param_id.clone(), ParamState { m, v, t: 0 });
        }
        let entry = self
            .state
            .get_mut(param_id)
            .expect("adam state inserted above");

        // Moments live in engine memory only inside this scope.
        let mut m = self.engine.upload(&self.store.load(&entry.m)?)?;
        let mut v = self.engine.upload(&self.store.load(&entry.v)?)?;

        entry.t += 1;
        self.engine.adam_update(
            param,
            grad,
            &mut m,
            &mut v,
            lr,
            self.config.beta1,
            self.config.beta2,
            self.config.eps,
            entry.t,
        )?;

        self.store.overwrite(&entry.m, &m)?;
        self.store.overwrite(&entry.v, &v)?;
        self.store.overwrite(param_id, param)?;
        Ok(())
    }

    pub fn timestep(&self, param_id: &TensorId) -> Option<i32> {
        self.state.get(param_id).map(|s| s.t)
    }

    /// Delete every moment file and forget all timesteps.
    pub fn reset(&mut self) {
        for (param, state) in self.state.drain() {
            for id in [&state.m, &state.v] {
                if let Err(e) = self.store.delete(id) {
                    warn!("adam reset: delete of `{}` (for `{}`) failed: {}", id, param, e);
                }
            }
        }
    }
}

/// First path-safe chunk of a parameter id, for moment file names.
fn short(id: &TensorId) -> &str {
    let s = id.as_str();
    s.split('_').next().unwrap_or(s)
}
