//! Model-catalog JSON and the training-state sidecar.
//!
//! The catalog file carries dimensions, the session id, and the name → id
//! map; no tensor values. Loading it reconstructs the in-memory weight-id
//! catalog only — the weights themselves never leave the tensor store.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use dayson_engine::lstm::{LstmConfig, WeightCatalog};

#[derive(Debug, Serialize, Deserialize)]
pub struct ModelCatalogFile {
    pub vocab_size: usize,
    pub embedding_size: usize,
    pub hidden_size: usize,
    pub output_size: usize,
    pub session_id: String,
    pub tensor_ids: BTreeMap<String, String>,
}

impl ModelCatalogFile {
    pub fn from_parts(config: &LstmConfig, session_id: &str, catalog: &WeightCatalog) -> Self {
        Self {
            vocab_size: config.vocab_size,
            embedding_size: config.embedding_size,
            hidden_size: config.hidden_size,
            output_size: config.output_size,
            session_id: session_id.to_string(),
            tensor_ids: catalog.to_map(),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = File::create(path).with_context(|| format!("create {:?}", path))?;
        serde_json::to_writer_pretty(file, self).with_context(|| format!("write {:?}", path))?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("open {:?}", path))?;
        serde_json::from_reader(BufReader::new(file)).with_context(|| format!("parse {:?}", path))
    }

    pub fn catalog(&self) -> Result<WeightCatalog> {
        WeightCatalog::from_map(&self.tensor_ids).context("rebuild weight catalog")
    }

    pub fn config(&self) -> LstmConfig {
        let mut config = LstmConfig::new(self.vocab_size, self.embedding_size, self.hidden_size);
        config.output_size = self.output_size;
        config
    }
}

/// Path of the catalog file for one epoch.
pub fn catalog_path(root: &Path, epoch: usize) -> PathBuf {
    root.join(format!("model_catalog_{}.json", epoch))
}

/// Sidecar state for resume and inspection.
#[derive(Debug, Serialize, Deserialize)]
pub struct TrainingState {
    pub epoch: usize,
    pub loss: f32,
    pub date: String,
    pub catalog: String,
}

pub fn save_training_state(root: &Path, epoch: usize, loss: f32, catalog_file: &Path) -> Result<()> {
    let state = TrainingState {
        epoch,
        loss,
        date: chrono::Local::now().to_rfc3339(),
        catalog: catalog_file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
    };
    let path = root.join("training_state.json");
    let file = File::create(&path).with_context(|| format!("create {:?}", path))?;
    serde_json::to_writer_pretty(file, &state)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dayson_engine::TensorStore;

    #[test]
    fn catalog_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = TensorStore::open(dir.path(), "s").unwrap();
        let config = LstmConfig::new(17, 6, 8);
        let catalog = WeightCatalog::initialize(&store, &config, 3).unwrap();

        let file = ModelCatalogFile::from_parts(&config, "s", &catalog);
        let path = catalog_path(dir.path(), 0);
        file.save(&path).unwrap();

        let back = ModelCatalogFile::load(&path).unwrap();
        assert_eq!(back.vocab_size, 17);
        assert_eq!(back.session_id, "s");
        assert_eq!(back.catalog().unwrap().to_map(), catalog.to_map());
    }
}
