//! Wiring for the `train`, `shard`, and `sanity` commands.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

use dayson_engine::lstm::{LstmConfig, LstmCore, WeightCatalog};
use dayson_engine::{
    BlockStore, DeviceEngine, GpuContext, HostEngine, MathEngine, SwapStore, TensorStore,
};

use crate::cli::{SanityArgs, ShardArgs, TrainArgs};
use crate::corpus;
use crate::dataset::DatasetShardService;
use crate::events::TracingSink;
use crate::model_file::ModelCatalogFile;
use crate::trainer::{adopt_catalog, Trainer, TrainerConfig};

/// Pick the device engine when an adapter exists, the host engine
/// otherwise (or when forced).
pub fn select_engine(force_cpu: bool) -> Arc<dyn MathEngine> {
    if !force_cpu {
        match GpuContext::try_new() {
            Some(ctx) => match DeviceEngine::new(ctx) {
                Ok(engine) => return Arc::new(engine),
                Err(e) => warn!("device engine unavailable ({}); using host engine", e),
            },
            None => warn!("no compute adapter found; using host engine"),
        }
    }
    Arc::new(HostEngine::new())
}

fn fresh_session_id() -> String {
    format!("session_{}", chrono::Local::now().format("%Y%m%d_%H%M%S"))
}

fn infer_vocab(tokens: &[u32], requested: Option<usize>) -> Result<usize> {
    match requested {
        Some(v) => Ok(v),
        None => {
            let max = tokens.iter().copied().max().context("empty corpus")?;
            Ok(max as usize + 1)
        }
    }
}

pub fn run(args: TrainArgs) -> Result<()> {
    let root = PathBuf::from(&args.root);
    std::fs::create_dir_all(&root)?;

    let tokens = corpus::load_tokens(&args.corpus)?;
    let vocab = infer_vocab(&tokens, args.vocab)?;

    // A resumed model fixes the session (its tensor files live there), the
    // dimensions, and the catalog; a fresh run mints all three.
    let (session_id, model_config, resume_catalog) = match &args.resume {
        Some(path) => {
            let file = ModelCatalogFile::load(Path::new(path))?;
            if file.vocab_size != vocab {
                bail!(
                    "resumed model has vocab {}, corpus needs {}",
                    file.vocab_size,
                    vocab
                );
            }
            let catalog = file.catalog()?;
            (file.session_id.clone(), file.config(), Some(catalog))
        }
        None => (
            fresh_session_id(),
            LstmConfig::new(vocab, args.embedding, args.hidden),
            None,
        ),
    };

    let engine = select_engine(args.cpu);
    let store = Arc::new(TensorStore::open(&root, &session_id)?);
    let swap = SwapStore::open(&root, &session_id)?;

    let blocks = Arc::new(BlockStore::open(root.join("batches.bts"))?);
    blocks.clear().context("reset batch block store")?;
    let dataset = DatasetShardService::initialize(
        blocks,
        &tokens,
        args.context,
        vocab,
        args.pad_token,
        args.batch_size,
        args.val_split,
    )?;
    // The corpus was held in host memory once, to index it; release it.
    drop(tokens);

    let catalog = match resume_catalog {
        Some(catalog) => {
            adopt_catalog(&store, &catalog)?;
            info!("resumed model from {:?}", args.resume.as_deref().unwrap_or(""));
            catalog
        }
        None => WeightCatalog::initialize(&store, &model_config, args.seed)?,
    };

    let core = LstmCore::new(
        Arc::clone(&engine),
        Arc::clone(&store),
        swap,
        model_config.clone(),
    )?;

    let trainer_config = TrainerConfig::new(root, args.epochs, args.lr);
    let mut trainer = Trainer::new(
        engine,
        core,
        dataset,
        trainer_config,
        model_config,
        catalog,
        session_id,
        Arc::new(TracingSink),
    );
    trainer.run()
}

pub fn run_shard(args: ShardArgs) -> Result<()> {
    let root = PathBuf::from(&args.root);
    std::fs::create_dir_all(&root)?;

    let tokens = corpus::load_tokens(&args.corpus)?;
    let vocab = infer_vocab(&tokens, args.vocab)?;

    let blocks = Arc::new(BlockStore::open(root.join("batches.bts"))?);
    blocks.clear().context("reset batch block store")?;
    let dataset = DatasetShardService::initialize(
        blocks,
        &tokens,
        args.context,
        vocab,
        args.pad_token,
        args.batch_size,
        args.val_split,
    )?;
    info!(
        "shard complete: {} train / {} validation blocks in {:?}",
        dataset.train_offsets().len(),
        dataset.validation_offsets().len(),
        root.join("batches.bts")
    );
    Ok(())
}

pub fn run_sanity(args: SanityArgs) -> Result<()> {
    let root = PathBuf::from(&args.root);
    std::fs::create_dir_all(&root)?;

    let engine = select_engine(args.cpu);
    let session_id = fresh_session_id();
    let store = Arc::new(TensorStore::open(&root, &session_id)?);
    let swap = SwapStore::open(&root, &session_id)?;

    let model_config = LstmConfig::new(args.vocab, args.embedding, args.hidden);
    let catalog = WeightCatalog::initialize(&store, &model_config, args.seed)?;
    let mut core = LstmCore::new(Arc::clone(&engine), store, swap, model_config)?;

    let mut weights = core.load_weights(catalog)?;
    core.run_sanity_check(&mut weights, 1e-3)?;
    info!("sanity cycle passed on `{}`", engine.backend_name());
    Ok(())
}
