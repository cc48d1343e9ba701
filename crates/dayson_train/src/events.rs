//! Typed progress events.
//!
//! The trainer reports through an injected sink instead of writing to the
//! console directly; the default sink forwards to `tracing`, tests capture.

use std::path::PathBuf;
use std::sync::Mutex;

use tracing::{info, warn};

#[derive(Debug, Clone)]
pub enum TrainEvent {
    EpochStarted { epoch: usize },
    BatchCompleted { epoch: usize, batch: usize, loss: f32 },
    BatchFailed { epoch: usize, batch: usize, error: String },
    MemoryTrimmed { rss_mb: u64 },
    ValidationCompleted { epoch: usize, loss: f32 },
    EpochCompleted { epoch: usize, mean_loss: f32, catalog_path: PathBuf },
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: &TrainEvent);
}

/// Default sink: structured log lines.
#[derive(Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &TrainEvent) {
        match event {
            TrainEvent::EpochStarted { epoch } => info!("epoch {} started", epoch),
            TrainEvent::BatchCompleted { epoch, batch, loss } => {
                info!("epoch {} batch {}: loss {:.4}", epoch, batch, loss)
            }
            TrainEvent::BatchFailed { epoch, batch, error } => {
                warn!("epoch {} batch {} failed: {}", epoch, batch, error)
            }
            TrainEvent::MemoryTrimmed { rss_mb } => {
                warn!("memory trim at {} MiB resident", rss_mb)
            }
            TrainEvent::ValidationCompleted { epoch, loss } => {
                info!("epoch {} validation loss {:.4}", epoch, loss)
            }
            TrainEvent::EpochCompleted {
                epoch,
                mean_loss,
                catalog_path,
            } => info!(
                "epoch {} done: mean loss {:.4}, catalog {:?}",
                epoch, mean_loss, catalog_path
            ),
        }
    }
}

/// Test sink that records every event.
#[derive(Debug, Default)]
pub struct CapturingSink {
    events: Mutex<Vec<TrainEvent>>,
}

impl CapturingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<TrainEvent> {
        std::mem::take(&mut self.events.lock().expect("sink poisoned"))
    }
}

impl EventSink for CapturingSink {
    fn emit(&self, event: &TrainEvent) {
        self.events.lock().expect("sink poisoned").push(event.clone());
    }
}
