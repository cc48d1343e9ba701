//! Trainer application for the Dayson zero-RAM LSTM core: corpus sharding,
//! epoch orchestration, model-catalog persistence, and the CLI.

pub mod cli;
pub mod corpus;
pub mod dataset;
pub mod events;
pub mod memory;
pub mod model_file;
pub mod train;
pub mod trainer;

pub use dataset::{BatchPair, DatasetShardService};
pub use events::{CapturingSink, EventSink, TracingSink, TrainEvent};
pub use trainer::{Trainer, TrainerConfig};
