//! The zero-RAM LSTM training core.
//!
//! One training step runs the fixed recurrence forward while streaming
//! every intermediate activation to the swap store (each swap-out destroys
//! the device copy), then walks the sequence backwards reloading exactly
//! the activations each timestep needs, accumulates gradients, clips them,
//! and applies Adam. The working set is bounded by the weight bundle plus a
//! handful of `[1, H]` rows no matter how long the sequence is.
//!
//! Step lifecycle: `Idle → Forward → Backward → Update → Cleanup → Idle`.
//! A fault in any phase still runs Cleanup (swap files and gradient files
//! deleted) before the error is re-raised.

pub mod weights;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::engine::MathEngine;
use crate::error::{EngineError, Result};
use crate::optim::{AdamConfig, AdamOptimizer};
use crate::store::{SwapStore, TensorId, TensorStore};
use crate::tensor::{HostTensor, Tensor};

pub use weights::{GateIds, GateParams, LstmConfig, LstmWeights, WeightCatalog};

/// Layer-norm epsilon on the gate pre-activations.
const LN_EPS: f32 = 1e-5;

/// Floor for the prediction probability inside the loss.
const LOSS_PROB_FLOOR: f32 = 1e-9;

/// Gate indices in canonical order.
const GATE_F: usize = 0;
const GATE_I: usize = 1;
const GATE_C: usize = 2;
const GATE_O: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepPhase {
    Idle,
    Forward,
    Backward,
    Update,
    Cleanup,
}

/// Swap paths produced by one forward pass; everything BPTT needs.
struct StepTrace {
    h_init: PathBuf,
    c_init: PathBuf,
    input: Vec<PathBuf>,
    gate_f: Vec<PathBuf>,
    gate_i: Vec<PathBuf>,
    gate_o: Vec<PathBuf>,
    candidate: Vec<PathBuf>,
    c_next: Vec<PathBuf>,
    tanh_c: Vec<PathBuf>,
    h_next: Vec<PathBuf>,
    pred: Vec<PathBuf>,
}

impl StepTrace {
    fn with_capacity(h_init: PathBuf, c_init: PathBuf, steps: usize) -> Self {
        Self {
            h_init,
            c_init,
            input: Vec::with_capacity(steps),
            gate_f: Vec::with_capacity(steps),
            gate_i: Vec::with_capacity(steps),
            gate_o: Vec::with_capacity(steps),
            candidate: Vec::with_capacity(steps),
            c_next: Vec::with_capacity(steps),
            tanh_c: Vec::with_capacity(steps),
            h_next: Vec::with_capacity(steps),
            pred: Vec::with_capacity(steps),
        }
    }

    fn h_prev(&self, t: usize) -> &Path {
        if t == 0 {
            &self.h_init
        } else {
            &self.h_next[t - 1]
        }
    }

    fn c_prev(&self, t: usize) -> &Path {
        if t == 0 {
            &self.c_init
        } else {
            &self.c_next[t - 1]
        }
    }
}

/// Device-side gradient accumulators, canonical parameter order.
struct GateGrads {
    w_x: Tensor,
    w_h: Tensor,
    bias: Tensor,
}

struct GradTensors {
    embedding: Tensor,
    gates: [GateGrads; 4],
    w_hy: Tensor,
    b_y: Tensor,
}

impl GradTensors {
    fn zeros(engine: &Arc<dyn MathEngine>, config: &LstmConfig) -> Result<Self> {
        let (v, e, h, o) = (
            config.vocab_size,
            config.embedding_size,
            config.hidden_size,
            config.output_size,
        );
        let mut gates = Vec::with_capacity(4);
        for _ in 0..4 {
            gates.push(GateGrads {
                w_x: engine.create(&[e, h])?,
                w_h: engine.create(&[h, h])?,
                bias: engine.create(&[1, h])?,
            });
        }
        Ok(Self {
            embedding: engine.create(&[v, e])?,
            gates: gates
                .try_into()
                .map_err(|_| EngineError::InvalidArgument("gate grads construction".into()))?,
            w_hy: engine.create(&[h, o])?,
            b_y: engine.create(&[1, o])?,
        })
    }

    /// Same order as `LstmWeights::trainable_mut`.
    fn ordered(&self) -> Vec<&Tensor> {
        let mut out = Vec::with_capacity(15);
        out.push(&self.embedding);
        for gate in &self.gates {
            out.push(&gate.w_x);
            out.push(&gate.w_h);
            out.push(&gate.bias);
        }
        out.push(&self.w_hy);
        out.push(&self.b_y);
        out
    }

    fn ordered_mut(&mut self) -> Vec<&mut Tensor> {
        let mut out = Vec::with_capacity(15);
        out.push(&mut self.embedding);
        for gate in &mut self.gates {
            out.push(&mut gate.w_x);
            out.push(&mut gate.w_h);
            out.push(&mut gate.bias);
        }
        out.push(&mut self.w_hy);
        out.push(&mut self.b_y);
        out
    }

    const NAMES: [&'static str; 15] = [
        "embedding", "w_xf", "w_hf", "b_f", "w_xi", "w_hi", "b_i", "w_xc", "w_hc", "b_c",
        "w_xo", "w_ho", "b_o", "w_hy", "b_y",
    ];

    fn shapes(config: &LstmConfig) -> [Vec<usize>; 15] {
        let (v, e, h, o) = (
            config.vocab_size,
            config.embedding_size,
            config.hidden_size,
            config.output_size,
        );
        [
            vec![v, e],
            vec![e, h], vec![h, h], vec![1, h],
            vec![e, h], vec![h, h], vec![1, h],
            vec![e, h], vec![h, h], vec![1, h],
            vec![e, h], vec![h, h], vec![1, h],
            vec![h, o],
            vec![1, o],
        ]
    }
}

pub struct LstmCore {
    engine: Arc<dyn MathEngine>,
    store: Arc<TensorStore>,
    swap: SwapStore,
    optimizer: AdamOptimizer,
    config: LstmConfig,
    phase: StepPhase,
    /// Gradient accumulator ids registered for the in-flight step.
    step_grad_ids: Vec<TensorId>,
}

impl LstmCore {
    pub fn new(
        engine: Arc<dyn MathEngine>,
        store: Arc<TensorStore>,
        swap: SwapStore,
        config: LstmConfig,
    ) -> Result<Self> {
        config.validate()?;
        let optimizer = AdamOptimizer::new(
            Arc::clone(&engine),
            Arc::clone(&store),
            AdamConfig::default(),
        );
        Ok(Self {
            engine,
            store,
            swap,
            optimizer,
            config,
            phase: StepPhase::Idle,
            step_grad_ids: Vec::new(),
        })
    }

    pub fn config(&self) -> &LstmConfig {
        &self.config
    }

    pub fn phase(&self) -> StepPhase {
        self.phase
    }

    pub fn swap_store(&self) -> &SwapStore {
        &self.swap
    }

    pub fn optimizer_mut(&mut self) -> &mut AdamOptimizer {
        &mut self.optimizer
    }

    /// Load the full weight bundle into engine memory.
    pub fn load_weights(&self, catalog: WeightCatalog) -> Result<LstmWeights> {
        LstmWeights::load(&self.engine, &self.store, catalog)
    }

    /// Zero the recurrent state on disk (between epochs).
    pub fn reset_state(&self, catalog: &WeightCatalog) -> Result<()> {
        let zeros = HostTensor::zeros(&[1, self.config.hidden_size])?;
        self.store
            .overwrite(&catalog.hidden_state, &Tensor::Host(zeros.clone()))?;
        self.store
            .overwrite(&catalog.cell_state, &Tensor::Host(zeros))?;
        Ok(())
    }

    fn validate_sequence(&self, input: &[u32], target: &[u32]) -> Result<()> {
        if input.is_empty() || input.len() != target.len() {
            return Err(EngineError::InvalidArgument(format!(
                "sequence lengths {} / {}",
                input.len(),
                target.len()
            )));
        }
        if let Some(&bad) = input.iter().find(|&&x| x as usize >= self.config.vocab_size) {
            return Err(EngineError::InvalidArgument(format!(
                "input index {} out of vocab {}",
                bad, self.config.vocab_size
            )));
        }
        if let Some(&bad) = target
            .iter()
            .find(|&&y| y as usize >= self.config.output_size)
        {
            return Err(EngineError::InvalidArgument(format!(
                "target index {} out of output size {}",
                bad, self.config.output_size
            )));
        }
        Ok(())
    }

    /// One full training step. Cleanup (swap files + gradient files) runs
    /// on every exit path.
    pub fn train_sequence(
        &mut self,
        weights: &mut LstmWeights,
        input: &[u32],
        target: &[u32],
        lr: f32,
    ) -> Result<f32> {
        self.validate_sequence(input, target)?;
        let result = self.run_step(weights, input, target, lr);
        self.cleanup_step();
        result
    }

    fn run_step(
        &mut self,
        weights: &mut LstmWeights,
        input: &[u32],
        target: &[u32],
        lr: f32,
    ) -> Result<f32> {
        self.phase = StepPhase::Forward;
        let (loss, trace) = self.forward(weights, input, target)?;
        self.phase = StepPhase::Backward;
        let grads = self.backward(weights, input, target, &trace)?;
        self.phase = StepPhase::Update;
        self.apply_update(weights, &grads, lr)?;
        Ok(loss)
    }

    /// Forward-only pass for validation. Swap files are created and deleted
    /// exactly as in training.
    pub fn evaluate_sequence(
        &mut self,
        weights: &LstmWeights,
        input: &[u32],
        target: &[u32],
    ) -> Result<f32> {
        self.validate_sequence(input, target)?;
        self.phase = StepPhase::Forward;
        let result = self.forward(weights, input, target).map(|(loss, _)| loss);
        self.cleanup_step();
        result
    }

    // ------------------------------------------------------------------
    // Forward
    // ------------------------------------------------------------------

    fn forward(
        &mut self,
        weights: &LstmWeights,
        input: &[u32],
        target: &[u32],
    ) -> Result<(f32, StepTrace)> {
        let e = Arc::clone(&self.engine);
        let steps = input.len();
        let h = self.config.hidden_size;
        let (emb, vocab) = (self.config.embedding_size, self.config.output_size);

        let h0 = e.upload(&self.store.load(&weights.catalog.hidden_state)?)?;
        let c0 = e.upload(&self.store.load(&weights.catalog.cell_state)?)?;
        let h_init = self.swap.swap_out(h0, "h_init")?;
        let c_init = self.swap.swap_out(c0, "c_init")?;
        let mut trace = StepTrace::with_capacity(h_init, c_init, steps);

        let mut loss = 0.0f64;
        for t in 0..steps {
            let h_prev = e.upload(&self.swap.load(trace.h_prev(t))?)?;
            let c_prev = e.upload(&self.swap.load(trace.c_prev(t))?)?;

            let mut x_t = e.create(&[1, emb])?;
            e.lookup(&weights.embedding, input[t] as usize, &mut x_t)?;

            // sigmoid(LN(x·W_x + h·W_h + b)) per gate; tanh for the
            // candidate.
            let mut gate_out: Vec<Tensor> = Vec::with_capacity(4);
            for (gi, gate) in weights.gates.iter().enumerate() {
                let mut z = e.create(&[1, h])?;
                e.matmul(&x_t, &gate.w_x, &mut z)?;
                let mut zh = e.create(&[1, h])?;
                e.matmul(&h_prev, &gate.w_h, &mut zh)?;
                e.add_scaled(&mut z, &zh, 1.0)?;
                drop(zh);
                e.add_broadcast(&mut z, &gate.bias)?;
                e.layer_norm(&mut z, &gate.gamma, &gate.beta, LN_EPS)?;
                let mut out = e.create(&[1, h])?;
                if gi == GATE_C {
                    e.tanh(&z, &mut out)?;
                } else {
                    e.sigmoid(&z, &mut out)?;
                }
                gate_out.push(out);
            }

            // c' = f ⊙ c + i ⊙ c̃
            let mut c_next = e.create(&[1, h])?;
            e.mul(&gate_out[GATE_F], &c_prev, &mut c_next)?;
            let mut ic = e.create(&[1, h])?;
            e.mul(&gate_out[GATE_I], &gate_out[GATE_C], &mut ic)?;
            e.add_scaled(&mut c_next, &ic, 1.0)?;
            drop(ic);

            let mut tanh_c = e.create(&[1, h])?;
            e.tanh(&c_next, &mut tanh_c)?;
            let mut h_next = e.create(&[1, h])?;
            e.mul(&gate_out[GATE_O], &tanh_c, &mut h_next)?;

            let mut logits = e.create(&[1, vocab])?;
            e.matmul(&h_next, &weights.w_hy, &mut logits)?;
            e.add_broadcast(&mut logits, &weights.b_y)?;
            let mut pred = e.create(&[1, vocab])?;
            e.softmax(&logits, &mut pred)?;
            drop(logits);

            drop(h_prev);
            drop(c_prev);

            // Stream the step's activations out; each swap-out destroys the
            // engine-side copy before the next one starts.
            let mut gates = gate_out.into_iter();
            let (fg, ig, cc, og) = (
                gates.next().expect("gate f"),
                gates.next().expect("gate i"),
                gates.next().expect("gate c"),
                gates.next().expect("gate o"),
            );
            trace.input.push(self.swap.swap_out(x_t, &format!("input_t{}", t))?);
            trace.gate_f.push(self.swap.swap_out(fg, &format!("fg_t{}", t))?);
            trace.gate_i.push(self.swap.swap_out(ig, &format!("ig_t{}", t))?);
            trace.gate_o.push(self.swap.swap_out(og, &format!("og_t{}", t))?);
            trace
                .candidate
                .push(self.swap.swap_out(cc, &format!("cc_t{}", t))?);
            trace
                .c_next
                .push(self.swap.swap_out(c_next, &format!("c_next_t{}", t))?);
            trace
                .tanh_c
                .push(self.swap.swap_out(tanh_c, &format!("tanh_c_t{}", t))?);
            trace
                .h_next
                .push(self.swap.swap_out(h_next, &format!("h_t{}", t))?);
            let pred_path = self.swap.swap_out(pred, &format!("pred_t{}", t))?;

            // Per-step loss probe straight off the swap file; the full
            // prediction row never comes back to the host.
            let p = self
                .swap
                .read_element(&pred_path, target[t] as usize)?
                .max(LOSS_PROB_FLOOR);
            loss -= f64::from(p).ln();
            trace.pred.push(pred_path);
        }

        // Final state survives the step in the tensor store, not in RAM.
        let h_final = self
            .swap
            .load(trace.h_next.last().expect("at least one step"))?;
        let c_final = self
            .swap
            .load(trace.c_next.last().expect("at least one step"))?;
        self.store
            .overwrite(&weights.catalog.hidden_state, &Tensor::Host(h_final))?;
        self.store
            .overwrite(&weights.catalog.cell_state, &Tensor::Host(c_final))?;

        Ok(((loss / steps as f64) as f32, trace))
    }

    // ------------------------------------------------------------------
    // Backward (BPTT)
    // ------------------------------------------------------------------

    fn backward(
        &mut self,
        weights: &LstmWeights,
        input: &[u32],
        target: &[u32],
        trace: &StepTrace,
    ) -> Result<GradTensors> {
        let e = Arc::clone(&self.engine);
        let steps = input.len();
        let h = self.config.hidden_size;
        let (emb, vocab) = (self.config.embedding_size, self.config.output_size);

        // Zero accumulator files first: the update phase reads gradients
        // from the store, and cleanup deletes these ids on any exit.
        self.step_grad_ids.clear();
        for (name, shape) in GradTensors::NAMES.iter().zip(GradTensors::shapes(&self.config)) {
            let id = self
                .store
                .store_host(&HostTensor::zeros(&shape)?, &format!("grad_{}", name))?;
            self.step_grad_ids.push(id);
        }

        let mut grads = GradTensors::zeros(&e, &self.config)?;

        let mut dh_next_path = self.swap.swap_out(e.create(&[1, h])?, "dh_init")?;
        let mut dc_next_path = self.swap.swap_out(e.create(&[1, h])?, "dc_init")?;

        for t in (0..steps).rev() {
            let pred = e.upload(&self.swap.load(&trace.pred[t])?)?;
            let h_next = e.upload(&self.swap.load(&trace.h_next[t])?)?;
            let tanh_c = e.upload(&self.swap.load(&trace.tanh_c[t])?)?;
            let og = e.upload(&self.swap.load(&trace.gate_o[t])?)?;
            let cc = e.upload(&self.swap.load(&trace.candidate[t])?)?;
            let ig = e.upload(&self.swap.load(&trace.gate_i[t])?)?;
            let fg = e.upload(&self.swap.load(&trace.gate_f[t])?)?;
            let c_prev = e.upload(&self.swap.load(trace.c_prev(t))?)?;
            let h_prev = e.upload(&self.swap.load(trace.h_prev(t))?)?;
            let x_row = e.upload(&self.swap.load(&trace.input[t])?)?;
            let dh_next = e.upload(&self.swap.load(&dh_next_path)?)?;
            let dc_next = e.upload(&self.swap.load(&dc_next_path)?)?;

            // d_pred = ŷ − one_hot(y)
            let onehot = e.one_hot(&[target[t]], vocab)?;
            let mut d_pred = e.create(&[1, vocab])?;
            e.sub(&pred, &onehot, &mut d_pred)?;
            drop(onehot);
            drop(pred);

            // Output projection gradients.
            let mut tmp_hv = e.create(&[h, vocab])?;
            e.matmul_at(&h_next, &d_pred, &mut tmp_hv)?;
            e.add_scaled(&mut grads.w_hy, &tmp_hv, 1.0)?;
            drop(tmp_hv);
            e.add_scaled(&mut grads.b_y, &d_pred, 1.0)?;

            // dh = d_pred · W_hyᵀ + dh_next
            let mut dh = e.create(&[1, h])?;
            e.matmul_bt(&d_pred, &weights.w_hy, &mut dh)?;
            e.add_scaled(&mut dh, &dh_next, 1.0)?;
            drop(d_pred);
            drop(dh_next);
            drop(h_next);

            // dc = dc_next + (dh ⊙ o) ⊙ (1 − tanh²c)
            let mut td = e.create(&[1, h])?;
            e.tanh_deriv(&tanh_c, &mut td)?;
            let mut dho = e.create(&[1, h])?;
            e.mul(&dh, &og, &mut dho)?;
            let mut dc = e.create(&[1, h])?;
            e.mul(&dho, &td, &mut dc)?;
            drop(dho);
            drop(td);
            e.add_scaled(&mut dc, &dc_next, 1.0)?;
            drop(dc_next);

            // Gate deltas, canonical order f, i, c, o.
            let mut sd = e.create(&[1, h])?;
            let mut tmp = e.create(&[1, h])?;

            e.sigmoid_deriv(&fg, &mut sd)?;
            e.mul(&dc, &c_prev, &mut tmp)?;
            let mut d_f = e.create(&[1, h])?;
            e.mul(&tmp, &sd, &mut d_f)?;

            e.sigmoid_deriv(&ig, &mut sd)?;
            e.mul(&dc, &cc, &mut tmp)?;
            let mut d_i = e.create(&[1, h])?;
            e.mul(&tmp, &sd, &mut d_i)?;

            e.tanh_deriv(&cc, &mut sd)?;
            e.mul(&dc, &ig, &mut tmp)?;
            let mut d_c = e.create(&[1, h])?;
            e.mul(&tmp, &sd, &mut d_c)?;

            e.sigmoid_deriv(&og, &mut sd)?;
            e.mul(&dh, &tanh_c, &mut tmp)?;
            let mut d_o = e.create(&[1, h])?;
            e.mul(&tmp, &sd, &mut d_o)?;

            drop(sd);
            drop(tmp);
            drop(dh);
            drop(tanh_c);
            drop(og);
            drop(cc);
            drop(ig);

            // dc_prev = dc ⊙ f
            let mut dc_prev = e.create(&[1, h])?;
            e.mul(&dc, &fg, &mut dc_prev)?;
            drop(dc);
            drop(fg);
            drop(c_prev);

            let deltas = [d_f, d_i, d_c, d_o];
            let mut dh_prev = e.create(&[1, h])?;
            let mut d_input = e.create(&[1, emb])?;
            for (gi, d_g) in deltas.iter().enumerate() {
                let gate = &weights.gates[gi];
                let grad = &mut grads.gates[gi];

                let mut tmp_hh = e.create(&[h, h])?;
                e.matmul_at(&h_prev, d_g, &mut tmp_hh)?;
                e.add_scaled(&mut grad.w_h, &tmp_hh, 1.0)?;
                drop(tmp_hh);

                let mut tmp_eh = e.create(&[emb, h])?;
                e.matmul_at(&x_row, d_g, &mut tmp_eh)?;
                e.add_scaled(&mut grad.w_x, &tmp_eh, 1.0)?;
                drop(tmp_eh);

                e.add_scaled(&mut grad.bias, d_g, 1.0)?;

                let mut back_h = e.create(&[1, h])?;
                e.matmul_bt(d_g, &gate.w_h, &mut back_h)?;
                e.add_scaled(&mut dh_prev, &back_h, 1.0)?;
                drop(back_h);

                let mut back_x = e.create(&[1, emb])?;
                e.matmul_bt(d_g, &gate.w_x, &mut back_x)?;
                e.add_scaled(&mut d_input, &back_x, 1.0)?;
                drop(back_x);
            }
            drop(deltas);
            drop(h_prev);
            drop(x_row);

            e.accumulate_gradient(&mut grads.embedding, &d_input, input[t] as usize)?;
            drop(d_input);

            // Rotate the running deltas through the swap store.
            let old_dh = std::mem::replace(
                &mut dh_next_path,
                self.swap.swap_out(dh_prev, &format!("dh_t{}", t))?,
            );
            let old_dc = std::mem::replace(
                &mut dc_next_path,
                self.swap.swap_out(dc_prev, &format!("dc_t{}", t))?,
            );
            self.swap.delete(&old_dh)?;
            self.swap.delete(&old_dc)?;
        }

        // Per-element clip, then global norm clip.
        for g in grads.ordered_mut() {
            e.sanitize_and_clip(g, self.config.grad_element_clip)?;
        }
        let mut total = 0.0f64;
        for g in grads.ordered() {
            total += e.sum_of_squares(g)?;
        }
        let norm = total.sqrt();
        if norm > self.config.max_grad_norm as f64 {
            let factor = self.config.max_grad_norm as f64 / (norm + 1e-8);
            debug!("gradient norm {:.3} clipped by {:.5}", norm, factor);
            for g in grads.ordered_mut() {
                e.scale(g, factor as f32)?;
            }
        }

        // Final accumulated values land in the zeroed disk files; the
        // update phase reads them from there.
        for (id, g) in self.step_grad_ids.iter().zip(grads.ordered()) {
            self.store.overwrite(id, g)?;
        }

        Ok(grads)
    }

    // ------------------------------------------------------------------
    // Update + cleanup
    // ------------------------------------------------------------------

    fn apply_update(
        &mut self,
        weights: &mut LstmWeights,
        grads: &GradTensors,
        lr: f32,
    ) -> Result<()> {
        let pairs = weights.trainable_mut();
        for ((name, id, param), grad) in pairs.into_iter().zip(grads.ordered()) {
            self.optimizer
                .update(id, param, grad, lr)
                .map_err(|err| {
                    warn!("adam update of `{}` failed: {}", name, err);
                    err
                })?;
        }
        Ok(())
    }

    /// Delete everything the step left behind. Never raises: partial
    /// release is preferable to a stuck error path.
    fn cleanup_step(&mut self) {
        self.phase = StepPhase::Cleanup;
        self.swap.clear_all();
        let ids = std::mem::take(&mut self.step_grad_ids);
        for id in ids {
            if let Err(e) = self.store.delete(&id) {
                warn!("cleanup: gradient `{}` not deleted: {}", id, e);
            }
        }
        self.phase = StepPhase::Idle;
    }

    // ------------------------------------------------------------------
    // Sanity check
    // ------------------------------------------------------------------

    /// One full forward+backward+update cycle on synthetic input, with
    /// hard verification. Training must not start if this fails.
    pub fn run_sanity_check(&mut self, weights: &mut LstmWeights, lr: f32) -> Result<()> {
        let v = self.config.vocab_size as u32;
        let input: Vec<u32> = vec![1 % v, 3 % v, 5 % v];
        let target: Vec<u32> = vec![3 % v, 5 % v, 7 % v];

        let result = self.sanity_cycle(weights, &input, &target, lr);
        self.cleanup_step();

        // The probe update must not leak into real training.
        self.optimizer.reset();
        self.reset_state(&weights.catalog)?;

        match result {
            Ok(()) => {
                info!("sanity check passed");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn sanity_cycle(
        &mut self,
        weights: &mut LstmWeights,
        input: &[u32],
        target: &[u32],
        lr: f32,
    ) -> Result<()> {
        self.validate_sequence(input, target)?;

        self.phase = StepPhase::Forward;
        let (loss, trace) = self.forward(weights, input, target)?;
        let baseline = (self.config.output_size as f64).ln();
        if !loss.is_finite() {
            return Err(EngineError::SanityFailed(format!("loss {} not finite", loss)));
        }
        if (f64::from(loss) - baseline).abs() >= baseline {
            return Err(EngineError::SanityFailed(format!(
                "loss {:.4} further than one magnitude from ln(V) = {:.4}",
                loss, baseline
            )));
        }

        self.phase = StepPhase::Backward;
        let grads = self.backward(weights, input, target, &trace)?;

        let mut mass = 0.0f64;
        for id in &self.step_grad_ids {
            let g = self.store.load(id)?;
            if g.data().iter().any(|x| !x.is_finite()) {
                return Err(EngineError::SanityFailed(format!(
                    "gradient file `{}` contains NaN/Inf",
                    id
                )));
            }
            mass += g.data().iter().map(|x| f64::from(x.abs())).sum::<f64>();
        }
        if mass <= 1e-9 {
            return Err(EngineError::SanityFailed(format!(
                "total gradient mass {:.3e} is vanishing",
                mass
            )));
        }

        self.phase = StepPhase::Update;
        self.apply_update(weights, &grads, lr)?;
        Ok(())
    }
}
