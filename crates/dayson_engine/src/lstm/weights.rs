//! Weight identity catalog and the per-epoch device bundle.
//!
//! A model in memory is nothing but tensor ids; the values live in the
//! tensor store. The catalog covers the 15 trainable tensors (embedding,
//! four gate triples, output projection + bias), the 8 layer-norm
//! parameters, and the two recurrent state tensors.

use std::collections::BTreeMap;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::engine::MathEngine;
use crate::error::{EngineError, Result};
use crate::store::{TensorId, TensorStore};
use crate::tensor::{HostTensor, Tensor};

/// Gate order used everywhere: forget, input, candidate, output.
pub const GATE_TAGS: [&str; 4] = ["f", "i", "c", "o"];

#[derive(Debug, Clone)]
pub struct LstmConfig {
    pub vocab_size: usize,
    pub embedding_size: usize,
    pub hidden_size: usize,
    pub output_size: usize,
    /// Per-element gradient clip applied before the norm clip.
    pub grad_element_clip: f32,
    /// Global gradient-norm ceiling.
    pub max_grad_norm: f32,
}

impl LstmConfig {
    pub fn new(vocab_size: usize, embedding_size: usize, hidden_size: usize) -> Self {
        Self {
            vocab_size,
            embedding_size,
            hidden_size,
            output_size: vocab_size,
            grad_element_clip: 0.005,
            max_grad_norm: 30.0,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.vocab_size == 0
            || self.embedding_size == 0
            || self.hidden_size == 0
            || self.output_size == 0
        {
            return Err(EngineError::InvalidArgument(
                "all model dimensions must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Seeded dense init, `[-s, s]` uniform with `s = sqrt(6 / (rows + cols))`.
pub fn init_matrix(rows: usize, cols: usize, seed: u64) -> Result<HostTensor> {
    let mut rng = StdRng::seed_from_u64(seed);
    let scale = (6.0 / (rows + cols) as f32).sqrt();
    let data: Vec<f32> = (0..rows * cols)
        .map(|_| rng.gen_range(-scale..=scale))
        .collect();
    HostTensor::from_vec(data, &[rows, cols])
}

#[derive(Debug, Clone)]
pub struct GateIds {
    pub w_x: TensorId,
    pub w_h: TensorId,
    pub bias: TensorId,
    pub gamma: TensorId,
    pub beta: TensorId,
}

#[derive(Debug, Clone)]
pub struct WeightCatalog {
    pub embedding: TensorId,
    pub gates: [GateIds; 4],
    pub w_hy: TensorId,
    pub b_y: TensorId,
    pub hidden_state: TensorId,
    pub cell_state: TensorId,
}

impl WeightCatalog {
    /// Create and persist a fresh set of weights.
    pub fn initialize(store: &TensorStore, config: &LstmConfig, seed: u64) -> Result<Self> {
        config.validate()?;
        let (v, e, h, o) = (
            config.vocab_size,
            config.embedding_size,
            config.hidden_size,
            config.output_size,
        );

        let embedding = store.store_host(&init_matrix(v, e, seed)?, "embedding")?;

        let mut gates = Vec::with_capacity(4);
        for (gi, tag) in GATE_TAGS.iter().enumerate() {
            let salt = seed.wrapping_add(1 + gi as u64 * 10);
            gates.push(GateIds {
                w_x: store.store_host(&init_matrix(e, h, salt)?, &format!("w_x{}", tag))?,
                w_h: store.store_host(&init_matrix(h, h, salt + 1)?, &format!("w_h{}", tag))?,
                bias: store.store_host(&HostTensor::zeros(&[1, h])?, &format!("b_{}", tag))?,
                gamma: store.store_host(
                    &HostTensor::from_vec(vec![1.0; h], &[1, h])?,
                    &format!("ln_gamma_{}", tag),
                )?,
                beta: store
                    .store_host(&HostTensor::zeros(&[1, h])?, &format!("ln_beta_{}", tag))?,
            });
        }
        let gates: [GateIds; 4] = gates.try_into().expect("four gates built above");

        let w_hy = store.store_host(&init_matrix(h, o, seed.wrapping_add(100))?, "w_hy")?;
        let b_y = store.store_host(&HostTensor::zeros(&[1, o])?, "b_y")?;
        let hidden_state = store.store_host(&HostTensor::zeros(&[1, h])?, "hidden_state")?;
        let cell_state = store.store_host(&HostTensor::zeros(&[1, h])?, "cell_state")?;

        Ok(Self {
            embedding,
            gates,
            w_hy,
            b_y,
            hidden_state,
            cell_state,
        })
    }

    /// Name → id map for the model-catalog file.
    pub fn to_map(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        map.insert("embedding".into(), self.embedding.to_string());
        for (gate, tag) in self.gates.iter().zip(GATE_TAGS) {
            map.insert(format!("w_x{}", tag), gate.w_x.to_string());
            map.insert(format!("w_h{}", tag), gate.w_h.to_string());
            map.insert(format!("b_{}", tag), gate.bias.to_string());
            map.insert(format!("ln_gamma_{}", tag), gate.gamma.to_string());
            map.insert(format!("ln_beta_{}", tag), gate.beta.to_string());
        }
        map.insert("w_hy".into(), self.w_hy.to_string());
        map.insert("b_y".into(), self.b_y.to_string());
        map.insert("hidden_state".into(), self.hidden_state.to_string());
        map.insert("cell_state".into(), self.cell_state.to_string());
        map
    }

    /// Rebuild the catalog from a name → id map (model reload).
    pub fn from_map(map: &BTreeMap<String, String>) -> Result<Self> {
        let get = |key: &str| -> Result<TensorId> {
            map.get(key)
                .cloned()
                .map(TensorId::from)
                .ok_or_else(|| EngineError::NotFound(format!("catalog entry `{}`", key)))
        };
        let mut gates = Vec::with_capacity(4);
        for tag in GATE_TAGS {
            gates.push(GateIds {
                w_x: get(&format!("w_x{}", tag))?,
                w_h: get(&format!("w_h{}", tag))?,
                bias: get(&format!("b_{}", tag))?,
                gamma: get(&format!("ln_gamma_{}", tag))?,
                beta: get(&format!("ln_beta_{}", tag))?,
            });
        }
        Ok(Self {
            embedding: get("embedding")?,
            gates: gates.try_into().expect("four gates built above"),
            w_hy: get("w_hy")?,
            b_y: get("b_y")?,
            hidden_state: get("hidden_state")?,
            cell_state: get("cell_state")?,
        })
    }

    /// Every id in the catalog (for adoption after reload).
    pub fn all_ids(&self) -> Vec<TensorId> {
        let mut ids = vec![self.embedding.clone()];
        for gate in &self.gates {
            ids.extend([
                gate.w_x.clone(),
                gate.w_h.clone(),
                gate.bias.clone(),
                gate.gamma.clone(),
                gate.beta.clone(),
            ]);
        }
        ids.extend([
            self.w_hy.clone(),
            self.b_y.clone(),
            self.hidden_state.clone(),
            self.cell_state.clone(),
        ]);
        ids
    }
}

/// Device-resident gate parameters for one gate.
pub struct GateParams {
    pub w_x: Tensor,
    pub w_h: Tensor,
    pub bias: Tensor,
    pub gamma: Tensor,
    pub beta: Tensor,
}

/// The per-epoch weight bundle. Everything here is engine memory, loaded
/// exactly once per epoch; dropping the bundle releases it all.
pub struct LstmWeights {
    pub catalog: WeightCatalog,
    pub embedding: Tensor,
    pub gates: [GateParams; 4],
    pub w_hy: Tensor,
    pub b_y: Tensor,
}

impl LstmWeights {
    pub fn load(
        engine: &Arc<dyn MathEngine>,
        store: &TensorStore,
        catalog: WeightCatalog,
    ) -> Result<Self> {
        let up = |id: &TensorId| -> Result<Tensor> { engine.upload(&store.load(id)?) };
        let mut gates = Vec::with_capacity(4);
        for ids in &catalog.gates {
            gates.push(GateParams {
                w_x: up(&ids.w_x)?,
                w_h: up(&ids.w_h)?,
                bias: up(&ids.bias)?,
                gamma: up(&ids.gamma)?,
                beta: up(&ids.beta)?,
            });
        }
        Ok(Self {
            embedding: up(&catalog.embedding)?,
            gates: gates.try_into().map_err(|_| {
                EngineError::InvalidArgument("gate bundle construction failed".into())
            })?,
            w_hy: up(&catalog.w_hy)?,
            b_y: up(&catalog.b_y)?,
            catalog,
        })
    }

    /// The 15 trainable parameters in canonical order:
    /// embedding, (w_x, w_h, b) per gate, output projection, output bias.
    /// Layer-norm parameters are not trained by the backward contract.
    pub fn trainable_mut(&mut self) -> Vec<(&'static str, &TensorId, &mut Tensor)> {
        const WX: [&str; 4] = ["w_xf", "w_xi", "w_xc", "w_xo"];
        const WH: [&str; 4] = ["w_hf", "w_hi", "w_hc", "w_ho"];
        const B: [&str; 4] = ["b_f", "b_i", "b_c", "b_o"];
        let LstmWeights {
            catalog,
            embedding,
            gates,
            w_hy,
            b_y,
        } = self;
        let mut out: Vec<(&'static str, &TensorId, &mut Tensor)> = Vec::with_capacity(15);
        out.push(("embedding", &catalog.embedding, embedding));
        for (gi, gate) in gates.iter_mut().enumerate() {
            let ids = &catalog.gates[gi];
            out.push((WX[gi], &ids.w_x, &mut gate.w_x));
            out.push((WH[gi], &ids.w_h, &mut gate.w_h));
            out.push((B[gi], &ids.bias, &mut gate.bias));
        }
        out.push(("w_hy", &catalog.w_hy, w_hy));
        out.push(("b_y", &catalog.b_y, b_y));
        out
    }
}
