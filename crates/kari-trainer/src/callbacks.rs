//! Per-epoch collaborators of the training loop: checkpointing and
//! validation metrics.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use candle_nn::VarMap;
use kari_core::dataset::invert_tag_map;
use kari_core::metrics::{self, TaggingReport};
use kari_core::{Dataset, SequenceView, StepOutput, TaskModel};
use tracing::{debug, info, warn};

/// Everything a callback may look at after one (fold, epoch, dataset) update.
pub struct EpochContext<'a> {
    pub fold: usize,
    pub epoch: usize,
    pub dataset_index: usize,
    pub dataset: &'a Dataset,
    /// Mean loss and accuracy over the epoch's training batches.
    pub train: StepOutput,
    /// Loss and accuracy on the fold's validation view.
    pub valid: StepOutput,
    pub model: &'a TaskModel,
    pub varmap: &'a VarMap,
}

impl EpochContext<'_> {
    /// Dataset name, falling back to its position when unnamed.
    pub fn dataset_name(&self) -> String {
        if self.dataset.name.is_empty() {
            format!("dataset_{}", self.dataset_index)
        } else {
            self.dataset.name.clone()
        }
    }
}

/// Hook invoked once per (fold, epoch, dataset).
pub trait Callback {
    fn on_epoch_end(&mut self, ctx: &EpochContext<'_>) -> anyhow::Result<()>;
}

/// Checkpoint collaborator that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCheckpoint;

impl Callback for NoCheckpoint {
    fn on_epoch_end(&mut self, _ctx: &EpochContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Saves every trainable parameter as safetensors after each epoch.
#[derive(Debug, Clone)]
pub struct Checkpointer {
    dir: PathBuf,
    saved: Vec<PathBuf>,
}

impl Checkpointer {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            saved: Vec::new(),
        }
    }

    /// Checkpoint file for one (fold, epoch, dataset).
    pub fn path_for(&self, fold: usize, epoch: usize, dataset: &str) -> PathBuf {
        let dataset: String = dataset
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        self.dir
            .join(format!("fold_{fold}_epoch_{epoch}_{dataset}.safetensors"))
    }

    /// Files written so far, in order.
    pub fn saved(&self) -> &[PathBuf] {
        &self.saved
    }
}

impl Callback for Checkpointer {
    fn on_epoch_end(&mut self, ctx: &EpochContext<'_>) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating checkpoint directory {}", self.dir.display()))?;
        let path = self.path_for(ctx.fold, ctx.epoch, &ctx.dataset_name());
        ctx.varmap
            .save(&path)
            .with_context(|| format!("saving checkpoint {}", path.display()))?;
        debug!(path = %path.display(), "saved checkpoint");
        self.saved.push(path);
        Ok(())
    }
}

/// Chunk-level precision/recall/F1 of the task model on a validation view.
pub struct Metrics<'a> {
    valid: SequenceView<'a>,
    idx_to_tag: Vec<String>,
    batch_size: usize,
    report: Option<TaggingReport>,
}

impl<'a> Metrics<'a> {
    pub fn new(valid: SequenceView<'a>, tag_type_to_idx: &HashMap<String, u32>) -> Self {
        let count = valid.dataset().tag_type_count.max(tag_type_to_idx.len());
        Self {
            valid,
            idx_to_tag: invert_tag_map(tag_type_to_idx, count),
            batch_size: 64,
            report: None,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Report of the last evaluation, if any.
    pub fn report(&self) -> Option<&TaggingReport> {
        self.report.as_ref()
    }

    pub fn into_report(self) -> Option<TaggingReport> {
        self.report
    }

    fn tag_names(&self, path: &[u32]) -> Vec<String> {
        path.iter()
            .map(|&t| {
                self.idx_to_tag
                    .get(t as usize)
                    .cloned()
                    .unwrap_or_else(|| format!("<{t}>"))
            })
            .collect()
    }
}

impl Callback for Metrics<'_> {
    fn on_epoch_end(&mut self, ctx: &EpochContext<'_>) -> anyhow::Result<()> {
        if self.valid.is_empty() {
            warn!(fold = ctx.fold, dataset = %ctx.dataset_name(), "empty validation view, skipping metrics");
            return Ok(());
        }

        let device = ctx.model.crf().transitions.device().clone();
        let order: Vec<usize> = (0..self.valid.len()).collect();
        let mut gold = Vec::with_capacity(self.valid.len());
        let mut predicted = Vec::with_capacity(self.valid.len());
        for batch in self.valid.batches(&order, self.batch_size, &device) {
            let batch = batch?;
            let paths = ctx.model.predict(&batch)?;
            for (row, path) in paths.iter().enumerate() {
                gold.push(self.tag_names(batch.gold_path(row)));
                predicted.push(self.tag_names(path));
            }
        }

        let report = metrics::evaluate(&gold, &predicted);
        info!(
            fold = ctx.fold,
            epoch = ctx.epoch,
            dataset = %ctx.dataset_name(),
            precision = report.micro.precision,
            recall = report.micro.recall,
            f1 = report.micro.f1,
            macro_f1 = report.macro_avg.f1,
            token_accuracy = report.token_accuracy,
            "validation metrics"
        );
        debug!("\n{report}");
        self.report = Some(report);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use kari_core::{Hyperparameters, ModelSpecification, MultiTaskLstmCrf};

    const TAGS: [&str; 4] = ["B-LOC", "O", "I-PER", "B-PER"];

    /// Three post-padded rows; padding carries tag 0 (`B-LOC`).
    fn tagged_dataset() -> Dataset {
        let words = (1..=9u32).map(|i| (format!("w{i}"), i)).collect();
        let tags = TAGS
            .iter()
            .enumerate()
            .map(|(i, t)| (t.to_string(), i as u32))
            .collect();
        let tokens = vec![vec![1, 2, 3, 0], vec![4, 5, 0, 0], vec![6, 7, 8, 9]];
        let labels = vec![vec![3, 2, 1, 0], vec![0, 1, 0, 0], vec![1, 3, 2, 0]];
        Dataset::new("tagged", words, tags, tokens, labels).unwrap()
    }

    fn model(ds: Dataset) -> MultiTaskLstmCrf {
        let params = Hyperparameters::from_json_str(
            r#"{
                "activation_function": "tanh",
                "batch_size": 2,
                "dropout_rate": 0.0,
                "freeze_token_embeddings": false,
                "gradient_clipping_value": null,
                "k_folds": 2,
                "learning_rate": 0.01,
                "maximum_number_of_epochs": 1,
                "optimizer": "sgd",
                "token_embedding_matrix": null,
                "token_embedding_dimension": 4,
                "max_seq_len": 4
            }"#,
        )
        .unwrap();
        let spec = ModelSpecification::new(params, vec![ds]).unwrap();
        let mut model = MultiTaskLstmCrf::new(spec);
        model.specify().unwrap();
        model
    }

    fn context<'a>(model: &'a MultiTaskLstmCrf) -> EpochContext<'a> {
        EpochContext {
            fold: 0,
            epoch: 0,
            dataset_index: 0,
            dataset: &model.spec().ds[0],
            train: StepOutput::default(),
            valid: StepOutput::default(),
            model: &model.models()[0],
            varmap: model.varmap(),
        }
    }

    #[test]
    fn metrics_report_scores_named_truncated_paths() {
        let model = model(tagged_dataset());
        let ds = &model.spec().ds[0];
        let indices = vec![0, 1, 2];
        let mut metrics =
            Metrics::new(ds.view(&indices), &ds.tag_type_to_idx).with_batch_size(2);
        metrics.on_epoch_end(&context(&model)).unwrap();
        let report = metrics.report().unwrap();

        // PER at row 0 [0, 2) and row 2 [1, 3); LOC at row 1 [0, 1) and row 2 [3, 4)
        assert_eq!(report.per_type["PER"].support, 2);
        assert_eq!(report.per_type["LOC"].support, 2);
        assert_eq!(report.micro.support, 4);

        let gold: Vec<Vec<&str>> = vec![
            vec!["B-PER", "I-PER", "O"],
            vec!["B-LOC", "O"],
            vec!["O", "B-PER", "I-PER", "B-LOC"],
        ];
        let view = ds.view(&indices);
        let mut predicted: Vec<Vec<&str>> = Vec::new();
        for rows in [&[0, 1][..], &[2][..]] {
            let batch = view.batch(rows, &Device::Cpu).unwrap();
            for path in model.models()[0].predict(&batch).unwrap() {
                predicted.push(path.iter().map(|&t| TAGS[t as usize]).collect());
            }
        }
        assert_eq!(
            predicted.iter().map(Vec::len).collect::<Vec<_>>(),
            vec![3, 2, 4]
        );

        assert_eq!(report, &metrics::evaluate(&gold, &predicted));
    }

    #[test]
    fn metrics_skip_empty_validation_view() {
        let model = model(tagged_dataset());
        let ds = &model.spec().ds[0];
        let mut metrics = Metrics::new(ds.view(&[]), &ds.tag_type_to_idx);
        metrics.on_epoch_end(&context(&model)).unwrap();
        assert!(metrics.report().is_none());
    }

    #[test]
    fn checkpoint_names_are_filesystem_safe() {
        let checkpointer = Checkpointer::new("/tmp/ckpt");
        assert_eq!(
            checkpointer.path_for(2, 7, "bc5cdr chem/v1"),
            PathBuf::from("/tmp/ckpt/fold_2_epoch_7_bc5cdr_chem_v1.safetensors")
        );
        assert!(checkpointer.saved().is_empty());
    }
}
