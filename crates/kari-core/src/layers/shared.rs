//! Layers shared by every task model: token embedding, BiLSTM encoder and
//! time-distributed projection.

use candle_core::{DType, Device, Tensor};
use candle_nn::{Embedding, Init, Linear, Module, VarBuilder};

use crate::config::{Activation, Hyperparameters};
use crate::error::Result;
use crate::layers::lstm::BiLstm;

/// Hidden units per LSTM direction.
pub const LSTM_UNITS: usize = 100;

/// Width of the time-distributed projection.
pub const DENSE_UNITS: usize = 100;

/// Shared lower network. Built once and referenced by every task model.
pub struct SharedLayers {
    embedding: Embedding,
    bilstm: BiLstm,
    dense: Linear,
    activation: Activation,
    trainable_embedding: bool,
}

impl SharedLayers {
    /// Builds the shared layers under `vb`.
    ///
    /// A frozen pretrained matrix becomes a constant tensor outside the
    /// parameter map, so no optimizer ever sees it. A trainable one is
    /// registered as `embedding.weight` and must be loaded by the caller.
    pub fn new(
        params: &Hyperparameters,
        vocab_size: usize,
        vb: VarBuilder,
        device: &Device,
    ) -> Result<Self> {
        let dim = params.embedding_dimension();
        let frozen = params.freeze_token_embeddings && params.token_embedding_matrix.is_some();

        let weights = match (&params.token_embedding_matrix, frozen) {
            (Some(matrix), true) => embedding_tensor(matrix, device)?,
            (Some(_), false) => {
                vb.pp("embedding")
                    .get_with_hints((vocab_size, dim), "weight", Init::Const(0.0))?
            }
            (None, _) => vb.pp("embedding").get_with_hints(
                (vocab_size, dim),
                "weight",
                Init::Uniform {
                    lo: -0.05,
                    up: 0.05,
                },
            )?,
        };
        let embedding = Embedding::new(weights, dim);

        let bilstm = BiLstm::new(dim, LSTM_UNITS, params.dropout_rate as f32, vb.pp("bilstm"))?;
        let dense = candle_nn::linear(bilstm.output_size(), DENSE_UNITS, vb.pp("dense"))?;

        Ok(Self {
            embedding,
            bilstm,
            dense,
            activation: params.activation_function,
            trainable_embedding: !frozen,
        })
    }

    /// `tokens: [batch, seq_len]` (u32), `mask: [batch, seq_len]` → `[batch, seq_len, DENSE_UNITS]`.
    pub fn forward(&self, tokens: &Tensor, mask: &Tensor, train: bool) -> Result<Tensor> {
        let embedded = self.embedding.forward(tokens)?;
        let encoded = self.bilstm.forward(&embedded, mask, train)?;
        let projected = self.dense.forward(&encoded)?;
        Ok(self.activation.apply(&projected)?)
    }

    /// The embedding parameter tensor.
    pub fn embeddings(&self) -> &Tensor {
        self.embedding.embeddings()
    }

    pub fn is_embedding_trainable(&self) -> bool {
        self.trainable_embedding
    }

    pub fn output_size(&self) -> usize {
        DENSE_UNITS
    }
}

/// Converts pretrained rows into a `[rows, width]` tensor.
pub fn embedding_tensor(matrix: &[Vec<f32>], device: &Device) -> Result<Tensor> {
    let rows = matrix.len();
    let width = matrix.first().map(Vec::len).unwrap_or(0);
    let flat: Vec<f32> = matrix.iter().flatten().copied().collect();
    Ok(Tensor::from_vec(flat, (rows, width), device)?.to_dtype(DType::F32)?)
}
