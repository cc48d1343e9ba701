//! Epoch and batch orchestration.
//!
//! One trainer task drives the whole pipeline. Per epoch: the weight bundle
//! is loaded into engine memory exactly once (dropping it releases every
//! device tensor), training batches run under a lifetime failure budget,
//! the device queue is drained every few batches while the memory monitor
//! decides whether to trim, validation runs forward-only, and the model is
//! saved as a catalog JSON, disposed, and reloaded from disk.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

use dayson_engine::lstm::{LstmConfig, LstmCore, LstmWeights, WeightCatalog};
use dayson_engine::{MathEngine, TensorStore};

use crate::dataset::DatasetShardService;
use crate::events::{EventSink, TrainEvent};
use crate::memory::MemoryMonitor;
use crate::model_file::{self, ModelCatalogFile};

#[derive(Debug, Clone)]
pub struct TrainerConfig {
    pub epochs: usize,
    pub learning_rate: f32,
    /// Batches between queue drains and memory probes.
    pub sync_interval: usize,
    /// Lifetime failed-batch budget; exceeding it aborts the epoch.
    pub max_failed_batches: usize,
    pub trim_threshold_mb: u64,
    pub trim_growth_mb: u64,
    pub root: PathBuf,
}

impl TrainerConfig {
    pub fn new(root: PathBuf, epochs: usize, learning_rate: f32) -> Self {
        Self {
            epochs,
            learning_rate,
            sync_interval: 10,
            max_failed_batches: 5,
            trim_threshold_mb: 2000,
            trim_growth_mb: 1024,
            root,
        }
    }
}

pub struct Trainer {
    engine: Arc<dyn MathEngine>,
    core: LstmCore,
    dataset: DatasetShardService,
    config: TrainerConfig,
    model_config: LstmConfig,
    catalog: WeightCatalog,
    session_id: String,
    events: Arc<dyn EventSink>,
    memory: MemoryMonitor,
    failed_batches: usize,
}

impl Trainer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine: Arc<dyn MathEngine>,
        core: LstmCore,
        dataset: DatasetShardService,
        config: TrainerConfig,
        model_config: LstmConfig,
        catalog: WeightCatalog,
        session_id: String,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let memory = MemoryMonitor::new(config.trim_threshold_mb, config.trim_growth_mb);
        Self {
            engine,
            core,
            dataset,
            config,
            model_config,
            catalog,
            session_id,
            events,
            memory,
            failed_batches: 0,
        }
    }

    pub fn catalog(&self) -> &WeightCatalog {
        &self.catalog
    }

    /// Run the sanity gate, then every configured epoch.
    pub fn run(&mut self) -> Result<()> {
        info!(
            "training on `{}`: {} epochs, lr {}, {} train / {} validation blocks",
            self.engine.backend_name(),
            self.config.epochs,
            self.config.learning_rate,
            self.dataset.train_offsets().len(),
            self.dataset.validation_offsets().len()
        );

        let mut weights = self.core.load_weights(self.catalog.clone())?;
        self.core
            .run_sanity_check(&mut weights, self.config.learning_rate)
            .context("pre-training sanity check")?;
        drop(weights);

        for epoch in 0..self.config.epochs {
            self.run_epoch(epoch)
                .with_context(|| format!("epoch {}", epoch))?;
        }
        Ok(())
    }

    fn run_epoch(&mut self, epoch: usize) -> Result<()> {
        self.events.emit(&TrainEvent::EpochStarted { epoch });

        // The bundle is the epoch scope: one load, one release.
        let mut weights = self.core.load_weights(self.catalog.clone())?;
        let offsets = self.dataset.train_offsets().to_vec();
        let mut losses: Vec<f32> = Vec::with_capacity(offsets.len());

        for (batch, offset) in offsets.iter().enumerate() {
            match self.train_batch(&mut weights, *offset) {
                Ok(loss) => {
                    losses.push(loss);
                    self.events
                        .emit(&TrainEvent::BatchCompleted { epoch, batch, loss });
                }
                Err(e) => {
                    self.failed_batches += 1;
                    self.events.emit(&TrainEvent::BatchFailed {
                        epoch,
                        batch,
                        error: format!("{:#}", e),
                    });
                    if self.failed_batches > self.config.max_failed_batches {
                        bail!(
                            "failed batch budget exhausted ({} failures): {:#}",
                            self.failed_batches,
                            e
                        );
                    }
                }
            }

            if (batch + 1) % self.config.sync_interval == 0 {
                self.periodic_maintenance();
            }
        }

        let mean_loss = if losses.is_empty() {
            f32::NAN
        } else {
            losses.iter().sum::<f32>() / losses.len() as f32
        };

        let val_loss = self.validate(&weights)?;
        self.events
            .emit(&TrainEvent::ValidationCompleted { epoch, loss: val_loss });

        // Close the epoch scope before touching the catalog on disk.
        drop(weights);

        let catalog_path = self.save_and_reload(epoch, mean_loss)?;
        self.core.reset_state(&self.catalog)?;

        self.events.emit(&TrainEvent::EpochCompleted {
            epoch,
            mean_loss,
            catalog_path,
        });
        Ok(())
    }

    fn train_batch(&mut self, weights: &mut LstmWeights, offset: u64) -> Result<f32> {
        let pairs = self.dataset.load_batch(offset)?;
        if pairs.is_empty() {
            bail!("empty batch block at offset {}", offset);
        }
        let mut total = 0.0f32;
        for pair in &pairs {
            total += self.core.train_sequence(
                weights,
                &pair.input,
                &pair.target,
                self.config.learning_rate,
            )?;
        }
        Ok(total / pairs.len() as f32)
    }

    /// Mean cross-entropy over the validation blocks, forward-only.
    fn validate(&mut self, weights: &LstmWeights) -> Result<f32> {
        let offsets = self.dataset.validation_offsets().to_vec();
        if offsets.is_empty() {
            return Ok(f32::NAN);
        }
        let mut total = 0.0f64;
        let mut count = 0usize;
        for offset in offsets {
            for pair in self.dataset.load_batch(offset)? {
                total +=
                    f64::from(self.core.evaluate_sequence(weights, &pair.input, &pair.target)?);
                count += 1;
            }
        }
        Ok((total / count as f64) as f32)
    }

    /// Drain the queue, probe resident memory, trim if the policy fires.
    fn periodic_maintenance(&mut self) {
        if let Some(guard) = self.engine.sync_guard() {
            if let Err(e) = guard.synchronize_before_read("trainer_interval") {
                warn!("interval sync failed: {}", e);
            }
        }
        if let Some(rss) = self.memory.poll_rss_mb() {
            if self.memory.should_trim(rss) {
                // Engine memory is already scope-bound; what we can force
                // here is a full queue drain and a swap residue sweep.
                if let Some(guard) = self.engine.sync_guard() {
                    guard.synchronize_before_dispose("memory_trim", 0);
                }
                self.core.swap_store().clear_all();
                self.memory.record_baseline(rss);
                self.events.emit(&TrainEvent::MemoryTrimmed { rss_mb: rss });
            }
        }
    }

    /// Persist the catalog, drop the in-memory model, rebuild it from the
    /// file. Disk is the only carrier of model identity between epochs.
    fn save_and_reload(&mut self, epoch: usize, mean_loss: f32) -> Result<PathBuf> {
        let path = model_file::catalog_path(&self.config.root, epoch);
        ModelCatalogFile::from_parts(&self.model_config, &self.session_id, &self.catalog)
            .save(&path)?;
        model_file::save_training_state(&self.config.root, epoch, mean_loss, &path)?;

        let reloaded = ModelCatalogFile::load(&path)?;
        self.catalog = reloaded.catalog()?;
        Ok(path)
    }
}

/// Adopt every id of a reloaded catalog into a fresh tensor store session
/// (model resume across processes).
pub fn adopt_catalog(store: &TensorStore, catalog: &WeightCatalog) -> Result<()> {
    for id in catalog.all_ids() {
        store.adopt(id).context("adopt catalog tensor")?;
    }
    Ok(())
}
