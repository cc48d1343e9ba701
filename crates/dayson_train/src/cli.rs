//! Command-line surface.

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(author, version, about = "Dayson zero-RAM LSTM trainer", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Shard the corpus and train a model
    Train(TrainArgs),

    /// Shard a corpus into batch blocks and stop
    Shard(ShardArgs),

    /// Run the one-shot sanity cycle on synthetic input and exit
    Sanity(SanityArgs),
}

/// Training configuration from command line arguments
#[derive(Args, Debug, Clone)]
pub struct TrainArgs {
    /// Pre-tokenized corpus (.u16 / .u32 little-endian index file)
    #[arg(long, required = true)]
    pub corpus: String,

    /// Data root directory
    #[arg(long, default_value = "Dayson")]
    pub root: String,

    #[arg(long, default_value_t = 64)]
    pub context: usize,

    #[arg(long, default_value_t = 16)]
    pub batch_size: usize,

    #[arg(long, default_value_t = 128)]
    pub hidden: usize,

    #[arg(long, default_value_t = 64)]
    pub embedding: usize,

    /// Vocabulary size; inferred from the corpus when omitted
    #[arg(long)]
    pub vocab: Option<usize>,

    #[arg(long, default_value_t = 0)]
    pub pad_token: u32,

    #[arg(long, default_value_t = 3)]
    pub epochs: usize,

    #[arg(long, default_value_t = 1e-3)]
    pub lr: f32,

    #[arg(long, default_value_t = 0.1)]
    pub val_split: f64,

    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    /// Force the host engine even when a compute adapter exists
    #[arg(long, action)]
    pub cpu: bool,

    /// Resume from a model-catalog JSON written by a previous run
    #[arg(long)]
    pub resume: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct ShardArgs {
    #[arg(long, required = true)]
    pub corpus: String,

    #[arg(long, default_value = "Dayson")]
    pub root: String,

    #[arg(long, default_value_t = 64)]
    pub context: usize,

    #[arg(long, default_value_t = 16)]
    pub batch_size: usize,

    #[arg(long)]
    pub vocab: Option<usize>,

    #[arg(long, default_value_t = 0)]
    pub pad_token: u32,

    #[arg(long, default_value_t = 0.1)]
    pub val_split: f64,
}

#[derive(Args, Debug, Clone)]
pub struct SanityArgs {
    #[arg(long, default_value = "Dayson")]
    pub root: String,

    #[arg(long, default_value_t = 64)]
    pub hidden: usize,

    #[arg(long, default_value_t = 32)]
    pub embedding: usize,

    #[arg(long, default_value_t = 64)]
    pub vocab: usize,

    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    #[arg(long, action)]
    pub cpu: bool,
}
