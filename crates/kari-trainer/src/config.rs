//! Run configuration of the `train` binary: hyperparameters plus the paths
//! of the pre-indexed datasets to bind.

use std::path::{Path, PathBuf};

use anyhow::Context;
use kari_core::{Dataset, Hyperparameters, ModelSpecification};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(flatten)]
    pub hyperparameters: Hyperparameters,
    /// JSON-serialised `Dataset` files, relative to the config file.
    pub datasets: Vec<PathBuf>,
    #[serde(default)]
    pub checkpoint_dir: Option<PathBuf>,
}

impl RunConfig {
    pub fn from_json_str(json: &str) -> anyhow::Result<Self> {
        let config: Self = serde_json::from_str(json).context("parsing run configuration")?;
        config.hyperparameters.validate()?;
        Ok(config)
    }

    /// Reads the configuration; dataset and checkpoint paths are resolved against its directory.
    pub fn from_path<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let mut config = Self::from_json_str(&content)
            .with_context(|| format!("invalid configuration {}", path.display()))?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        config.datasets.iter_mut().for_each(resolve);
        config.checkpoint_dir.iter_mut().for_each(resolve);
        Ok(config)
    }

    /// Loads every dataset and binds them to the hyperparameters.
    pub fn into_specification(self) -> anyhow::Result<ModelSpecification> {
        let datasets = self
            .datasets
            .iter()
            .map(|path| load_dataset(path))
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(ModelSpecification::new(self.hyperparameters, datasets)?)
    }
}

/// Reads one dataset; an unnamed dataset is named after its file stem.
pub fn load_dataset(path: &Path) -> anyhow::Result<Dataset> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let mut dataset: Dataset = serde_json::from_str(&content)
        .with_context(|| format!("parsing dataset {}", path.display()))?;
    if dataset.name.is_empty() {
        dataset.name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
    }
    dataset.validate()?;

    info!(
        dataset = %dataset.name,
        examples = dataset.len(),
        tags = dataset.tag_type_count,
        "loaded dataset"
    );
    Ok(dataset)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"{
        "activation_function": "tanh",
        "batch_size": 8,
        "dropout_rate": 0.2,
        "freeze_token_embeddings": false,
        "gradient_clipping_value": null,
        "k_folds": 3,
        "learning_rate": 0.01,
        "maximum_number_of_epochs": 2,
        "optimizer": "adam",
        "token_embedding_matrix": null,
        "token_embedding_dimension": 16,
        "max_seq_len": 4,
        "datasets": ["conll.json", "/abs/genia.json"]
    }"#;

    #[test]
    fn parses_flattened_hyperparameters() {
        let config = RunConfig::from_json_str(CONFIG).unwrap();
        assert_eq!(config.hyperparameters.k_folds, 3);
        assert_eq!(config.datasets.len(), 2);
        assert!(config.checkpoint_dir.is_none());
    }

    #[test]
    fn missing_key_is_reported() {
        let json = CONFIG.replace("\"k_folds\": 3,", "");
        let err = RunConfig::from_json_str(&json).unwrap_err();
        assert!(format!("{err:#}").contains("k_folds"));
    }

    #[test]
    fn resolves_relative_paths_against_config_dir() {
        let dir = std::env::temp_dir().join(format!("kari-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("run.json");

        let json = CONFIG.replace(
            "\"datasets\"",
            "\"checkpoint_dir\": \"runs/ckpt\", \"datasets\"",
        );
        std::fs::write(&path, json).unwrap();

        let config = RunConfig::from_path(&path).unwrap();
        assert_eq!(config.datasets[0], dir.join("conll.json"));
        assert_eq!(config.datasets[1], PathBuf::from("/abs/genia.json"));
        assert_eq!(config.checkpoint_dir, Some(dir.join("runs/ckpt")));
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
