//! One-pass sharding of a token corpus into minibatch blocks.
//!
//! Windows are non-overlapping: input `corpus[i .. i+context]`, target
//! shifted by one, cursor advancing by `context`. A short tail window is
//! padded with the pad token. Packs of `batch_size` pairs are serialized as
//! one checksummed block:
//!
//! ```text
//! count:i32 | { input_len:i32 | target_len:i32
//!             | input:i32*input_len | target:i32*target_len } * count
//! ```
//!
//! The returned offsets are split into a train list and a validation list
//! at `(1 − val_split) · total` blocks.

use std::io::Cursor;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tracing::info;

use dayson_engine::BlockStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchPair {
    pub input: Vec<u32>,
    pub target: Vec<u32>,
}

pub struct DatasetShardService {
    blocks: Arc<BlockStore>,
    train: Vec<u64>,
    validation: Vec<u64>,
    batch_size: usize,
    context: usize,
}

impl DatasetShardService {
    #[allow(clippy::too_many_arguments)]
    pub fn initialize(
        blocks: Arc<BlockStore>,
        corpus: &[u32],
        context: usize,
        vocab_size: usize,
        pad_token: u32,
        batch_size: usize,
        val_split: f64,
    ) -> Result<Self> {
        if context < 1 || batch_size < 1 {
            bail!("context and batch size must be positive");
        }
        if !(0.0..1.0).contains(&val_split) {
            bail!("val_split {} outside [0, 1)", val_split);
        }
        if pad_token as usize >= vocab_size {
            bail!("pad token {} outside vocab {}", pad_token, vocab_size);
        }
        if let Some(&bad) = corpus.iter().find(|&&t| t as usize >= vocab_size) {
            bail!("corpus token {} outside vocab {}", bad, vocab_size);
        }
        if corpus.len() < 2 {
            bail!("corpus of {} tokens cannot form a pair", corpus.len());
        }

        let mut offsets = Vec::new();
        let mut pack: Vec<BatchPair> = Vec::with_capacity(batch_size);
        let mut i = 0usize;
        while i + 1 < corpus.len() {
            let end = (i + context + 1).min(corpus.len());
            let mut window = corpus[i..end].to_vec();
            while window.len() < context + 1 {
                window.push(pad_token);
            }
            pack.push(BatchPair {
                input: window[..context].to_vec(),
                target: window[1..context + 1].to_vec(),
            });
            if pack.len() == batch_size {
                offsets.push(blocks.store(&encode_pack(&pack)).context("store batch block")?);
                pack.clear();
            }
            i += context;
        }
        if !pack.is_empty() {
            offsets.push(blocks.store(&encode_pack(&pack)).context("store batch block")?);
        }

        let cut = ((offsets.len() as f64) * (1.0 - val_split)).round() as usize;
        let cut = cut.clamp(usize::from(offsets.len() > 1), offsets.len());
        let validation = offsets.split_off(cut);
        info!(
            "sharded {} tokens into {} train / {} validation blocks (context {}, batch {})",
            corpus.len(),
            offsets.len(),
            validation.len(),
            context,
            batch_size
        );

        Ok(Self {
            blocks,
            train: offsets,
            validation,
            batch_size,
            context,
        })
    }

    pub fn train_offsets(&self) -> &[u64] {
        &self.train
    }

    pub fn validation_offsets(&self) -> &[u64] {
        &self.validation
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn context(&self) -> usize {
        self.context
    }

    pub fn load_batch(&self, offset: u64) -> Result<Vec<BatchPair>> {
        let bytes = self.blocks.get(offset).context("read batch block")?;
        decode_pack(&bytes)
    }
}

fn encode_pack(pack: &[BatchPair]) -> Vec<u8> {
    let mut out = Vec::new();
    out.write_i32::<LittleEndian>(pack.len() as i32)
        .expect("vec write");
    for pair in pack {
        out.write_i32::<LittleEndian>(pair.input.len() as i32)
            .expect("vec write");
        out.write_i32::<LittleEndian>(pair.target.len() as i32)
            .expect("vec write");
        for &v in &pair.input {
            out.write_i32::<LittleEndian>(v as i32).expect("vec write");
        }
        for &v in &pair.target {
            out.write_i32::<LittleEndian>(v as i32).expect("vec write");
        }
    }
    out
}

fn decode_pack(bytes: &[u8]) -> Result<Vec<BatchPair>> {
    let mut cursor = Cursor::new(bytes);
    let count = cursor.read_i32::<LittleEndian>().context("pack count")?;
    if count < 0 {
        bail!("negative pair count {}", count);
    }
    let mut pack = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let input_len = cursor.read_i32::<LittleEndian>().context("input len")?;
        let target_len = cursor.read_i32::<LittleEndian>().context("target len")?;
        if input_len < 0 || target_len < 0 {
            bail!("negative pair lengths {} / {}", input_len, target_len);
        }
        let mut input = Vec::with_capacity(input_len as usize);
        for _ in 0..input_len {
            input.push(cursor.read_i32::<LittleEndian>().context("input index")? as u32);
        }
        let mut target = Vec::with_capacity(target_len as usize);
        for _ in 0..target_len {
            target.push(cursor.read_i32::<LittleEndian>().context("target index")? as u32);
        }
        pack.push(BatchPair { input, target });
    }
    Ok(pack)
}
