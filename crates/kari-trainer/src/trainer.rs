//! k-fold training loop for the multi-task model.

use anyhow::Context;
use candle_core::Device;
use kari_core::{
    FoldResetPolicy, FoldTable, KFold, ModelSpecification, ModelState, MultiTaskLstmCrf,
    SequenceView, StepOutput, TaggingReport, TaskModel, train_valid_indices,
};
use tracing::{debug, info};

use crate::callbacks::{Callback, EpochContext, Metrics};

/// Scores of one (fold, epoch, dataset) triple.
#[derive(Debug, Clone)]
pub struct EpochRecord {
    pub fold: usize,
    pub epoch: usize,
    pub dataset: String,
    pub train: StepOutput,
    pub valid: StepOutput,
    pub metrics: Option<TaggingReport>,
}

/// Drives folds, then epochs, then datasets over a `MultiTaskLstmCrf`.
pub struct Trainer {
    model: MultiTaskLstmCrf,
    history: Vec<EpochRecord>,
}

impl Trainer {
    pub fn new(spec: ModelSpecification) -> Self {
        Self::from_model(MultiTaskLstmCrf::new(spec))
    }

    /// Wraps a model in any state; `fit` specifies and compiles it as needed.
    pub fn from_model(model: MultiTaskLstmCrf) -> Self {
        Self {
            model,
            history: Vec::new(),
        }
    }

    pub fn model(&self) -> &MultiTaskLstmCrf {
        &self.model
    }

    pub fn into_model(self) -> MultiTaskLstmCrf {
        self.model
    }

    /// One record per (fold, epoch, dataset), in training order.
    pub fn history(&self) -> &[EpochRecord] {
        &self.history
    }

    /// Train/validation indices of every dataset for every fold.
    pub fn fold_table(&self) -> kari_core::Result<FoldTable> {
        let params = &self.model.spec().hyperparameters;
        let splitter = if params.shuffle_folds {
            KFold::shuffled(params.k_folds, params.random_seed)
        } else {
            KFold::new(params.k_folds)
        };
        train_valid_indices(&splitter, &self.model.spec().ds)
    }

    /// Runs the full cross-validation schedule.
    ///
    /// For every fold, epoch and dataset: one pass of mini-batch updates over
    /// the fold's training view, then `checkpointer` and a fresh `Metrics`
    /// on the validation view. Shared layers are updated by every dataset.
    pub fn fit(&mut self, checkpointer: &mut dyn Callback) -> anyhow::Result<()> {
        let table = self.fold_table().context("computing fold indices")?;
        let params = self.model.spec().hyperparameters.clone();
        let n_datasets = self.model.spec().ds.len();

        match self.model.state() {
            ModelState::Unspecified => {
                self.model.specify()?;
                self.model.compile()?;
            }
            ModelState::Specified => self.model.compile()?,
            ModelState::Compiled | ModelState::Fitting { .. } => {}
        }

        info!(
            folds = params.k_folds,
            epochs = params.maximum_number_of_epochs,
            datasets = n_datasets,
            policy = ?params.fold_reset_policy,
            "starting training"
        );

        let mut rng = oorandom::Rand32::new(params.random_seed);
        for fold in 0..params.k_folds {
            if fold > 0 && params.fold_reset_policy == FoldResetPolicy::Reinitialize {
                debug!(fold, "reinitializing task models");
                self.model.reset()?;
            }

            for epoch in 0..params.maximum_number_of_epochs {
                self.model.begin_epoch(fold, epoch)?;
                let device = self.model.device().clone();
                let varmap = self.model.varmap().clone();

                for (index, folds) in table.iter().enumerate() {
                    let split = &folds[fold];
                    let (ds, task) = self
                        .model
                        .task_mut(index)
                        .with_context(|| format!("no task model for dataset {index}"))?;

                    let train_view = ds.view(&split.train);
                    let valid_view = ds.view(&split.valid);
                    let train = fit_epoch(
                        task,
                        train_view,
                        params.batch_size,
                        params.shuffle_batches.then_some(&mut rng),
                        &device,
                    )
                    .with_context(|| {
                        format!("fold {fold}, epoch {epoch}, dataset {index} training failed")
                    })?;

                    let task: &TaskModel = task;
                    let valid = task.evaluate(&valid_view, params.batch_size, &device)?;

                    let ctx = EpochContext {
                        fold,
                        epoch,
                        dataset_index: index,
                        dataset: ds,
                        train,
                        valid,
                        model: task,
                        varmap: &varmap,
                    };
                    info!(
                        fold,
                        epoch,
                        dataset = %ctx.dataset_name(),
                        train_loss = train.loss,
                        train_accuracy = train.accuracy,
                        valid_loss = valid.loss,
                        valid_accuracy = valid.accuracy,
                        "epoch complete"
                    );

                    checkpointer.on_epoch_end(&ctx)?;
                    let mut metrics = Metrics::new(valid_view, &ds.tag_type_to_idx)
                        .with_batch_size(params.batch_size);
                    metrics.on_epoch_end(&ctx)?;

                    self.history.push(EpochRecord {
                        fold,
                        epoch,
                        dataset: ctx.dataset_name(),
                        train,
                        valid,
                        metrics: metrics.into_report(),
                    });
                }
            }
        }

        info!(records = self.history.len(), "training finished");
        Ok(())
    }
}

/// One pass of mini-batch updates over `view`; returns the example-weighted means.
pub fn fit_epoch(
    task: &mut TaskModel,
    view: SequenceView<'_>,
    batch_size: usize,
    shuffle: Option<&mut oorandom::Rand32>,
    device: &Device,
) -> kari_core::Result<StepOutput> {
    let mut order: Vec<usize> = (0..view.len()).collect();
    if let Some(rng) = shuffle {
        for i in (1..order.len()).rev() {
            let j = rng.rand_range(0..(i as u32 + 1)) as usize;
            order.swap(i, j);
        }
    }

    let mut loss = 0f32;
    let mut accuracy = 0f32;
    for batch in view.batches(&order, batch_size, device) {
        let batch = batch?;
        let step = task.train_step(&batch)?;
        loss += step.loss * batch.size() as f32;
        accuracy += step.accuracy * batch.size() as f32;
    }

    let n = view.len().max(1) as f32;
    Ok(StepOutput {
        loss: loss / n,
        accuracy: accuracy / n,
    })
}
