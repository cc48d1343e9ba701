//! Token corpus input.
//!
//! Corpora are pre-tokenized little-endian index files (`.u16` or `.u32`,
//! element width chosen by extension). The file is memory-mapped exactly
//! once to materialize the index sequence for sharding, then the mapping is
//! dropped; nothing in the training loop touches the corpus again.

use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use memmap2::Mmap;
use tracing::info;

/// Decode the whole corpus into token indices.
pub fn load_tokens(path: impl AsRef<Path>) -> Result<Vec<u32>> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("open corpus {:?}", path))?;
    let mmap = unsafe { Mmap::map(&file) }.with_context(|| format!("mmap corpus {:?}", path))?;

    let is_u32 = path
        .extension()
        .is_some_and(|ext| ext == "u32" || path.to_string_lossy().ends_with(".u32.bin"));

    let tokens: Vec<u32> = if is_u32 {
        mmap.chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    } else {
        mmap.chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]) as u32)
            .collect()
    };

    info!(
        "corpus {:?}: {} tokens ({})",
        path,
        tokens.len(),
        if is_u32 { "u32" } else { "u16" }
    );
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn u16_and_u32_decoding() {
        let dir = tempfile::tempdir().unwrap();

        let p16 = dir.path().join("corpus.u16");
        let mut f = File::create(&p16).unwrap();
        for v in [1u16, 500, 65535] {
            f.write_all(&v.to_le_bytes()).unwrap();
        }
        drop(f);
        assert_eq!(load_tokens(&p16).unwrap(), vec![1, 500, 65535]);

        let p32 = dir.path().join("corpus.u32");
        let mut f = File::create(&p32).unwrap();
        for v in [70000u32, 2] {
            f.write_all(&v.to_le_bytes()).unwrap();
        }
        drop(f);
        assert_eq!(load_tokens(&p32).unwrap(), vec![70000, 2]);
    }
}
