//! End-to-end training on the host engine: two epochs over a toy corpus,
//! with the capturing sink asserting the event stream and the filesystem
//! asserting the save/reload protocol.

use std::path::PathBuf;
use std::sync::Arc;

use dayson_engine::lstm::{LstmConfig, LstmCore, WeightCatalog};
use dayson_engine::{BlockStore, HostEngine, MathEngine, SwapStore, TensorStore};
use dayson_train::dataset::DatasetShardService;
use dayson_train::events::{CapturingSink, TrainEvent};
use dayson_train::model_file::ModelCatalogFile;
use dayson_train::trainer::{Trainer, TrainerConfig};

fn toy_corpus(len: usize, vocab: u32) -> Vec<u32> {
    // A periodic sequence so two epochs of learning have structure to find.
    (0..len as u32).map(|i| (i * 7 + 3) % vocab).collect()
}

#[test]
fn two_epochs_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_path_buf();

    let vocab = 24usize;
    let engine: Arc<dyn MathEngine> = Arc::new(HostEngine::new());
    let store = Arc::new(TensorStore::open(&root, "e2e").unwrap());
    let swap = SwapStore::open(&root, "e2e").unwrap();

    let blocks = Arc::new(BlockStore::open(root.join("batches.bts")).unwrap());
    let tokens = toy_corpus(121, vocab as u32);
    let dataset =
        DatasetShardService::initialize(blocks, &tokens, 6, vocab, 0, 2, 0.2).unwrap();

    let model_config = LstmConfig::new(vocab, 8, 12);
    let catalog = WeightCatalog::initialize(&store, &model_config, 314).unwrap();
    let core = LstmCore::new(
        Arc::clone(&engine),
        Arc::clone(&store),
        swap,
        model_config.clone(),
    )
    .unwrap();

    let sink = Arc::new(CapturingSink::new());
    let trainer_config = TrainerConfig::new(root.clone(), 2, 1e-3);
    let mut trainer = Trainer::new(
        engine,
        core,
        dataset,
        trainer_config,
        model_config,
        catalog,
        "e2e".to_string(),
        Arc::clone(&sink) as Arc<dyn dayson_train::events::EventSink>,
    );

    trainer.run().unwrap();

    let events = sink.take();
    let epochs_started = events
        .iter()
        .filter(|e| matches!(e, TrainEvent::EpochStarted { .. }))
        .count();
    let epochs_completed: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            TrainEvent::EpochCompleted {
                epoch, mean_loss, ..
            } => Some((*epoch, *mean_loss)),
            _ => None,
        })
        .collect();
    assert_eq!(epochs_started, 2);
    assert_eq!(epochs_completed.len(), 2);
    assert!(epochs_completed.iter().all(|(_, loss)| loss.is_finite()));

    assert!(!events
        .iter()
        .any(|e| matches!(e, TrainEvent::BatchFailed { .. })));
    assert!(events.iter().any(|e| matches!(
        e,
        TrainEvent::ValidationCompleted { loss, .. } if loss.is_finite()
    )));

    // The save/reload protocol leaves one catalog per epoch plus the
    // sidecar, and the reloaded catalog matches the trainer's.
    for epoch in 0..2 {
        let path: PathBuf = root.join(format!("model_catalog_{}.json", epoch));
        assert!(path.exists(), "missing {:?}", path);
        let file = ModelCatalogFile::load(&path).unwrap();
        assert_eq!(file.vocab_size, vocab);
        assert_eq!(file.session_id, "e2e");
        assert_eq!(file.tensor_ids.len(), 25);
    }
    assert!(root.join("training_state.json").exists());
    assert_eq!(
        trainer.catalog().to_map(),
        ModelCatalogFile::load(&root.join("model_catalog_1.json"))
            .unwrap()
            .catalog()
            .unwrap()
            .to_map()
    );
}

#[test]
fn failed_batch_budget_aborts_epoch() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_path_buf();

    let vocab = 16usize;
    let engine: Arc<dyn MathEngine> = Arc::new(HostEngine::new());
    let store = Arc::new(TensorStore::open(&root, "bad").unwrap());
    let swap = SwapStore::open(&root, "bad").unwrap();

    let blocks = Arc::new(BlockStore::open(root.join("batches.bts")).unwrap());
    let tokens = toy_corpus(121, vocab as u32);
    let dataset =
        DatasetShardService::initialize(Arc::clone(&blocks), &tokens, 4, vocab, 0, 2, 0.0)
            .unwrap();

    // Corrupt every stored block so each batch load fails its checksum.
    {
        use std::io::{Seek, SeekFrom, Write};
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .open(root.join("batches.bts"))
            .unwrap();
        for &offset in dataset.train_offsets() {
            file.seek(SeekFrom::Start(offset + 8 + 1)).unwrap();
            file.write_all(&[0xEE]).unwrap();
        }
    }

    let model_config = LstmConfig::new(vocab, 6, 8);
    let catalog = WeightCatalog::initialize(&store, &model_config, 1).unwrap();
    let core = LstmCore::new(
        Arc::clone(&engine),
        Arc::clone(&store),
        swap,
        model_config.clone(),
    )
    .unwrap();

    let sink = Arc::new(CapturingSink::new());
    let trainer_config = TrainerConfig::new(root, 1, 1e-3);
    let mut trainer = Trainer::new(
        engine,
        core,
        dataset,
        trainer_config,
        model_config,
        catalog,
        "bad".to_string(),
        Arc::clone(&sink) as Arc<dyn dayson_train::events::EventSink>,
    );

    let err = trainer.run().unwrap_err();
    assert!(format!("{:#}", err).contains("failed batch budget"));

    let failures = sink
        .take()
        .iter()
        .filter(|e| matches!(e, TrainEvent::BatchFailed { .. }))
        .count();
    assert_eq!(failures, 6); // budget of five, the sixth aborts
}
