//! Dataset sharding laws: block count, window adjacency, split arithmetic.

use std::sync::Arc;

use dayson_engine::BlockStore;
use dayson_train::dataset::DatasetShardService;

fn corpus(len: usize, vocab: u32) -> Vec<u32> {
    (0..len as u32).map(|i| i % vocab).collect()
}

// R3: every offset loads, the batch count is ceil(pairs / batch), and each
// pair satisfies target[i] == input[i+1] within its window.
#[test]
fn shard_and_reload_all_batches() {
    let dir = tempfile::tempdir().unwrap();
    let blocks = Arc::new(BlockStore::open(dir.path().join("batches.bts")).unwrap());

    let tokens = corpus(101, 50);
    let context = 8;
    let batch = 3;
    let service =
        DatasetShardService::initialize(Arc::clone(&blocks), &tokens, context, 50, 0, batch, 0.0)
            .unwrap();

    // Non-overlapping windows of stride `context` over 101 tokens: the
    // cursor yields a window whenever at least one next-token exists.
    let expected_pairs = (0..tokens.len() - 1).step_by(context).count();
    let expected_blocks = expected_pairs.div_ceil(batch);
    assert_eq!(service.train_offsets().len(), expected_blocks);
    assert!(service.validation_offsets().is_empty());

    let mut seen_pairs = 0;
    for &offset in service.train_offsets() {
        let pairs = service.load_batch(offset).unwrap();
        assert!(pairs.len() <= batch);
        for pair in &pairs {
            assert_eq!(pair.input.len(), context);
            assert_eq!(pair.target.len(), context);
            for i in 0..context - 1 {
                assert_eq!(pair.target[i], pair.input[i + 1]);
            }
            seen_pairs += 1;
        }
    }
    assert_eq!(seen_pairs, expected_pairs);
}

#[test]
fn validation_split_cuts_offsets() {
    let dir = tempfile::tempdir().unwrap();
    let blocks = Arc::new(BlockStore::open(dir.path().join("batches.bts")).unwrap());

    let tokens = corpus(401, 64);
    let service =
        DatasetShardService::initialize(blocks, &tokens, 4, 64, 0, 2, 0.25).unwrap();

    let train = service.train_offsets().len();
    let validation = service.validation_offsets().len();
    assert!(train > 0 && validation > 0);
    let total = train + validation;
    let expected_train = ((total as f64) * 0.75).round() as usize;
    assert_eq!(train, expected_train);
}

#[test]
fn tail_window_is_padded_with_pad_token() {
    let dir = tempfile::tempdir().unwrap();
    let blocks = Arc::new(BlockStore::open(dir.path().join("batches.bts")).unwrap());

    // 6 tokens with context 4: second window has only one real transition.
    let tokens = vec![1u32, 2, 3, 4, 5, 6];
    let pad = 9;
    let service = DatasetShardService::initialize(blocks, &tokens, 4, 10, pad, 8, 0.0).unwrap();

    let pairs = service.load_batch(service.train_offsets()[0]).unwrap();
    assert_eq!(pairs.len(), 2);
    assert_eq!(pairs[0].input, vec![1, 2, 3, 4]);
    assert_eq!(pairs[0].target, vec![2, 3, 4, 5]);
    assert_eq!(pairs[1].input, vec![5, 6, pad, pad]);
    assert_eq!(pairs[1].target, vec![6, pad, pad, pad]);
}
