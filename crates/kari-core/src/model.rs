//! # Multi-task BiLSTM-CRF
//!
//! One shared embedding, BiLSTM and projection feeding one CRF per dataset.
//! All parameters live in a single `VarMap`: shared layers are registered
//! once under `shared.*` and every `TaskModel` holds the same
//! `Arc<SharedLayers>`, while each CRF lives under `task_{i}.*`.

use std::sync::Arc;

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use tracing::{debug, info};

use crate::config::ModelSpecification;
use crate::crf::CrfLayer;
use crate::dataset::{Batch, Dataset, SequenceView};
use crate::error::{KariError, Result};
use crate::layers::shared::{SharedLayers, embedding_tensor};
use crate::optim::TaskOptimizer;

/// Lifecycle of a multi-task model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelState {
    Unspecified,
    Specified,
    Compiled,
    Fitting { fold: usize, epoch: usize },
}

/// Loss and accuracy of one batch or one pass over a view.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StepOutput {
    pub loss: f32,
    pub accuracy: f32,
}

/// The model of one dataset: shared layers plus its own CRF and optimizer.
pub struct TaskModel {
    index: usize,
    name: String,
    max_seq_len: usize,
    shared: Arc<SharedLayers>,
    crf: CrfLayer,
    optimizer: Option<TaskOptimizer>,
}

impl TaskModel {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shared(&self) -> &Arc<SharedLayers> {
        &self.shared
    }

    pub fn crf(&self) -> &CrfLayer {
        &self.crf
    }

    pub fn is_compiled(&self) -> bool {
        self.optimizer.is_some()
    }

    pub fn optimizer(&self) -> Option<&TaskOptimizer> {
        self.optimizer.as_ref()
    }

    /// Per-example output shape: `(max_seq_len, tag_type_count)`.
    pub fn output_shape(&self) -> (usize, usize) {
        (self.max_seq_len, self.crf.num_tags())
    }

    /// CRF emission scores `[batch, seq_len, num_tags]`.
    pub fn forward(&self, tokens: &Tensor, mask: &Tensor, train: bool) -> Result<Tensor> {
        let features = self.shared.forward(tokens, mask, train)?;
        Ok(self.crf.emissions(&features)?)
    }

    /// CRF negative log-likelihood of `batch`.
    pub fn loss(&self, batch: &Batch, train: bool) -> Result<Tensor> {
        let emissions = self.forward(&batch.tokens, &batch.mask, train)?;
        Ok(self.crf.neg_log_likelihood(&emissions, batch)?)
    }

    /// One gradient update on `batch`.
    pub fn train_step(&mut self, batch: &Batch) -> Result<StepOutput> {
        let emissions = self.forward(&batch.tokens, &batch.mask, true)?;
        let loss = self.crf.neg_log_likelihood(&emissions, batch)?;
        let accuracy = self.crf.accuracy(&emissions, batch)?;

        let optimizer = self.optimizer.as_mut().ok_or(KariError::InvalidState {
            expected: ModelState::Compiled,
            actual: ModelState::Specified,
        })?;
        optimizer.backward_step(&loss)?;

        let loss = loss.to_scalar::<f32>()?;
        debug!(task = %self.name, loss, accuracy, "train step");
        Ok(StepOutput { loss, accuracy })
    }

    /// Viterbi tag paths for `batch`, without dropout.
    pub fn predict(&self, batch: &Batch) -> Result<Vec<Vec<u32>>> {
        let emissions = self.forward(&batch.tokens, &batch.mask, false)?;
        self.crf.decode(&emissions, &batch.lengths)
    }

    /// Mean loss and token accuracy over `view`, without dropout.
    pub fn evaluate(
        &self,
        view: &SequenceView<'_>,
        batch_size: usize,
        device: &Device,
    ) -> Result<StepOutput> {
        if view.is_empty() {
            return Ok(StepOutput::default());
        }

        let order: Vec<usize> = (0..view.len()).collect();
        let mut loss_sum = 0f32;
        let mut correct = 0f32;
        let mut tokens = 0f32;
        for batch in view.batches(&order, batch_size, device) {
            let batch = batch?;
            let emissions = self.forward(&batch.tokens, &batch.mask, false)?;
            let loss = self.crf.neg_log_likelihood(&emissions, &batch)?;
            loss_sum += loss.to_scalar::<f32>()? * batch.size() as f32;

            let batch_tokens: usize = batch.lengths.iter().sum();
            correct += self.crf.accuracy(&emissions, &batch)? * batch_tokens as f32;
            tokens += batch_tokens as f32;
        }

        Ok(StepOutput {
            loss: loss_sum / view.len() as f32,
            accuracy: if tokens > 0.0 { correct / tokens } else { 0.0 },
        })
    }
}

/// Multi-task BiLSTM-CRF over the datasets of a `ModelSpecification`.
pub struct MultiTaskLstmCrf {
    spec: ModelSpecification,
    device: Device,
    varmap: VarMap,
    models: Vec<TaskModel>,
    state: ModelState,
}

impl MultiTaskLstmCrf {
    /// Creates an unspecified model on the CPU.
    pub fn new(spec: ModelSpecification) -> Self {
        Self::with_device(spec, Device::Cpu)
    }

    pub fn with_device(spec: ModelSpecification, device: Device) -> Self {
        Self {
            spec,
            device,
            varmap: VarMap::new(),
            models: Vec::new(),
            state: ModelState::Unspecified,
        }
    }

    pub fn spec(&self) -> &ModelSpecification {
        &self.spec
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn state(&self) -> ModelState {
        self.state
    }

    pub fn models(&self) -> &[TaskModel] {
        &self.models
    }

    pub fn models_mut(&mut self) -> &mut [TaskModel] {
        &mut self.models
    }

    /// The dataset bound at `index` together with its task model.
    pub fn task_mut(&mut self, index: usize) -> Option<(&Dataset, &mut TaskModel)> {
        let ds = self.spec.ds.get(index)?;
        let model = self.models.get_mut(index)?;
        Some((ds, model))
    }

    /// Records the fold/epoch the training loop is in. Requires a compiled model.
    pub fn begin_epoch(&mut self, fold: usize, epoch: usize) -> Result<()> {
        match self.state {
            ModelState::Compiled | ModelState::Fitting { .. } => {
                self.state = ModelState::Fitting { fold, epoch };
                Ok(())
            }
            actual => Err(KariError::InvalidState {
                expected: ModelState::Compiled,
                actual,
            }),
        }
    }

    /// Builds the shared layers and one task model per dataset, in dataset order.
    pub fn specify(&mut self) -> Result<&[TaskModel]> {
        if self.state != ModelState::Unspecified {
            return Err(KariError::InvalidState {
                expected: ModelState::Unspecified,
                actual: self.state,
            });
        }

        let params = &self.spec.hyperparameters;
        let vb = VarBuilder::from_varmap(&self.varmap, DType::F32, &self.device);
        let shared = Arc::new(SharedLayers::new(
            params,
            self.spec.vocab_size(),
            vb.pp("shared"),
            &self.device,
        )?);

        if let (Some(matrix), true) = (
            &params.token_embedding_matrix,
            shared.is_embedding_trainable(),
        ) {
            let weights = embedding_tensor(matrix, &self.device)?;
            self.varmap.set_one("shared.embedding.weight", &weights)?;
        }

        let mut models = Vec::with_capacity(self.spec.ds.len());
        for (index, ds) in self.spec.ds.iter().enumerate() {
            let crf = CrfLayer::new(
                shared.output_size(),
                ds.tag_type_count,
                vb.pp(format!("task_{index}")).pp("crf"),
            )?;
            models.push(TaskModel {
                index,
                name: ds.name.clone(),
                max_seq_len: params.max_seq_len,
                shared: Arc::clone(&shared),
                crf,
                optimizer: None,
            });
        }

        info!(
            tasks = models.len(),
            vocab = self.spec.vocab_size(),
            embedding_dim = params.embedding_dimension(),
            "specified multi-task BiLSTM-CRF"
        );
        self.models = models;
        self.state = ModelState::Specified;
        Ok(&self.models)
    }

    /// Attaches an optimizer to every task model. Requires `specify` first.
    pub fn compile(&mut self) -> Result<()> {
        if self.state != ModelState::Specified {
            return Err(KariError::InvalidState {
                expected: ModelState::Specified,
                actual: self.state,
            });
        }

        let params = &self.spec.hyperparameters;
        for model in &mut self.models {
            let vars = task_vars(&self.varmap, model.index)?;
            model.optimizer = Some(TaskOptimizer::new(
                params.optimizer,
                vars,
                params.learning_rate,
                params.gradient_clipping_value,
            )?);
        }

        info!(
            optimizer = %params.optimizer,
            learning_rate = params.learning_rate,
            "compiled task models"
        );
        self.state = ModelState::Compiled;
        Ok(())
    }

    /// Drops every parameter and optimizer state, then specifies and compiles again.
    pub fn reset(&mut self) -> Result<()> {
        self.models.clear();
        self.varmap = VarMap::new();
        self.state = ModelState::Unspecified;
        self.specify()?;
        self.compile()
    }
}

/// Trainable variables of task `index`: the shared ones plus its own CRF, sorted by name.
fn task_vars(varmap: &VarMap, index: usize) -> Result<Vec<Var>> {
    let own = format!("task_{index}.");
    let data = varmap
        .data()
        .lock()
        .map_err(|_| candle_core::Error::Msg("parameter map lock poisoned".into()))?;
    let mut named: Vec<(&String, &Var)> = data
        .iter()
        .filter(|(name, _)| name.starts_with("shared.") || name.starts_with(&own))
        .collect();
    named.sort_by(|a, b| a.0.cmp(b.0));
    Ok(named.into_iter().map(|(_, var)| var.clone()).collect())
}
