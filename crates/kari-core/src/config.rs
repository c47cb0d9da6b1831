//! # Model specification
//!
//! Hyperparameters and bound datasets for a multi-task BiLSTM-CRF. Every key
//! of the hyperparameter mapping is required; `token_embedding_matrix` and
//! `gradient_clipping_value` must be present but may be `null`.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use candle_core::{Result as CandleResult, Tensor};
use serde::{Deserialize, Deserializer, Serialize};

use crate::dataset::Dataset;
use crate::error::{KariError, Result};

/// Activation applied by the shared time-distributed projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Activation {
    Tanh,
    Relu,
    Sigmoid,
    Elu,
    Linear,
}

impl Activation {
    /// Applies the activation element-wise.
    pub fn apply(&self, xs: &Tensor) -> CandleResult<Tensor> {
        match self {
            Activation::Tanh => xs.tanh(),
            Activation::Relu => xs.relu(),
            Activation::Sigmoid => candle_nn::ops::sigmoid(xs),
            Activation::Elu => xs.elu(1.0),
            Activation::Linear => Ok(xs.clone()),
        }
    }

    /// Canonical lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Activation::Tanh => "tanh",
            Activation::Relu => "relu",
            Activation::Sigmoid => "sigmoid",
            Activation::Elu => "elu",
            Activation::Linear => "linear",
        }
    }
}

impl FromStr for Activation {
    type Err = KariError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tanh" => Ok(Activation::Tanh),
            "relu" => Ok(Activation::Relu),
            "sigmoid" => Ok(Activation::Sigmoid),
            "elu" => Ok(Activation::Elu),
            "linear" => Ok(Activation::Linear),
            _ => Err(KariError::UnknownActivation(s.to_string())),
        }
    }
}

impl TryFrom<String> for Activation {
    type Error = KariError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Activation> for String {
    fn from(value: Activation) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optimizer family, named as in Keras.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum OptimizerKind {
    Sgd,
    Adam,
    Adamax,
    Adagrad,
    Adadelta,
    Rmsprop,
    Nadam,
}

impl OptimizerKind {
    /// Canonical lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            OptimizerKind::Sgd => "sgd",
            OptimizerKind::Adam => "adam",
            OptimizerKind::Adamax => "adamax",
            OptimizerKind::Adagrad => "adagrad",
            OptimizerKind::Adadelta => "adadelta",
            OptimizerKind::Rmsprop => "rmsprop",
            OptimizerKind::Nadam => "nadam",
        }
    }
}

impl FromStr for OptimizerKind {
    type Err = KariError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sgd" => Ok(OptimizerKind::Sgd),
            "adam" => Ok(OptimizerKind::Adam),
            "adamax" => Ok(OptimizerKind::Adamax),
            "adagrad" => Ok(OptimizerKind::Adagrad),
            "adadelta" => Ok(OptimizerKind::Adadelta),
            "rmsprop" => Ok(OptimizerKind::Rmsprop),
            "nadam" => Ok(OptimizerKind::Nadam),
            _ => Err(KariError::UnknownOptimizer(s.to_string())),
        }
    }
}

impl TryFrom<String> for OptimizerKind {
    type Error = KariError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<OptimizerKind> for String {
    fn from(value: OptimizerKind) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happens to the task models when the training loop moves to the next fold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FoldResetPolicy {
    /// Re-specify and re-compile: fresh parameters and optimizer state per fold.
    #[default]
    Reinitialize,
    /// Keep parameters and optimizer state from the previous fold.
    CarryOver,
}

/// Scalar hyperparameters of the model and of the training loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hyperparameters {
    pub activation_function: Activation,
    pub batch_size: usize,
    pub dropout_rate: f64,
    pub freeze_token_embeddings: bool,
    #[serde(deserialize_with = "required_nullable")]
    pub gradient_clipping_value: Option<f64>,
    pub k_folds: usize,
    pub learning_rate: f64,
    pub maximum_number_of_epochs: usize,
    pub optimizer: OptimizerKind,
    /// Pretrained embedding rows, one per vocabulary index (row 0 is padding).
    #[serde(deserialize_with = "required_nullable")]
    pub token_embedding_matrix: Option<Vec<Vec<f32>>>,
    pub token_embedding_dimension: usize,
    pub max_seq_len: usize,

    #[serde(default)]
    pub fold_reset_policy: FoldResetPolicy,
    #[serde(default)]
    pub shuffle_folds: bool,
    #[serde(default = "default_seed")]
    pub random_seed: u64,
    #[serde(default = "default_true")]
    pub shuffle_batches: bool,
}

fn default_seed() -> u64 {
    42
}

fn default_true() -> bool {
    true
}

/// A nullable key that still has to be present in the mapping.
fn required_nullable<'de, D, T>(deserializer: D) -> std::result::Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer)
}

impl Hyperparameters {
    /// Parses hyperparameters from a JSON mapping.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let params: Self =
            serde_json::from_str(json).map_err(|e| KariError::Config(e.to_string()))?;
        params.validate()?;
        Ok(params)
    }

    /// Checks value ranges that the type system cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(KariError::Config("batch_size must be positive".into()));
        }
        if self.max_seq_len == 0 {
            return Err(KariError::Config("max_seq_len must be positive".into()));
        }
        if !(0.0..1.0).contains(&self.dropout_rate) {
            return Err(KariError::Config(format!(
                "dropout_rate must be in [0, 1), got {}",
                self.dropout_rate
            )));
        }
        if self.learning_rate <= 0.0 {
            return Err(KariError::Config("learning_rate must be positive".into()));
        }
        match &self.token_embedding_matrix {
            Some(matrix) => {
                let width = matrix.first().map(Vec::len).unwrap_or(0);
                if width == 0 || matrix.iter().any(|row| row.len() != width) {
                    return Err(KariError::Config(
                        "token_embedding_matrix must be a non-empty rectangular matrix".into(),
                    ));
                }
            }
            None if self.token_embedding_dimension == 0 => {
                return Err(KariError::Config(
                    "token_embedding_dimension must be positive".into(),
                ));
            }
            None => {}
        }
        Ok(())
    }

    /// Width of the shared embedding: the pretrained matrix wins over the configured dimension.
    pub fn embedding_dimension(&self) -> usize {
        self.token_embedding_matrix
            .as_ref()
            .and_then(|m| m.first())
            .map(Vec::len)
            .unwrap_or(self.token_embedding_dimension)
    }
}

/// Hyperparameters plus the datasets bound to one multi-task model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSpecification {
    #[serde(flatten)]
    pub hyperparameters: Hyperparameters,
    pub ds: Vec<Dataset>,
}

impl ModelSpecification {
    /// Binds datasets to hyperparameters, validating both.
    pub fn new(hyperparameters: Hyperparameters, ds: Vec<Dataset>) -> Result<Self> {
        let spec = Self { hyperparameters, ds };
        spec.validate()?;
        Ok(spec)
    }

    /// Parses a full specification (hyperparameters and inline `ds`) from JSON.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let spec: Self =
            serde_json::from_str(json).map_err(|e| KariError::Config(e.to_string()))?;
        spec.validate()?;
        Ok(spec)
    }

    /// Reads a full specification from a JSON file.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    pub fn validate(&self) -> Result<()> {
        self.hyperparameters.validate()?;
        if self.ds.is_empty() {
            return Err(KariError::Config("at least one dataset must be bound".into()));
        }
        let vocab = self.vocab_size();
        for ds in &self.ds {
            ds.validate()?;
            let max_token = ds.train_word_idx_sequence.iter().flatten().max();
            if let Some(&w) = max_token.filter(|&&w| w as usize >= vocab) {
                return Err(KariError::InvalidDataset {
                    name: ds.name.clone(),
                    reason: format!(
                        "token index {w} is outside the shared vocabulary of {vocab} rows"
                    ),
                });
            }
            if ds.max_seq_len() != Some(self.hyperparameters.max_seq_len) {
                return Err(KariError::InvalidDataset {
                    name: ds.name.clone(),
                    reason: format!(
                        "sequences must have length max_seq_len = {}",
                        self.hyperparameters.max_seq_len
                    ),
                });
            }
        }
        if let Some(matrix) = &self.hyperparameters.token_embedding_matrix {
            if matrix.len() != vocab {
                return Err(KariError::Config(format!(
                    "token_embedding_matrix has {} rows, vocabulary needs {}",
                    matrix.len(),
                    vocab
                )));
            }
        }
        Ok(())
    }

    /// Embedding rows: the first dataset's word types plus the padding index.
    pub fn vocab_size(&self) -> usize {
        self.ds
            .first()
            .map(|ds| ds.word_type_to_idx.len() + 1)
            .unwrap_or(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::tests::toy_dataset;

    const PARAMS: &str = r#"{
        "activation_function": "relu",
        "batch_size": 32,
        "dropout_rate": 0.3,
        "freeze_token_embeddings": false,
        "gradient_clipping_value": null,
        "k_folds": 5,
        "learning_rate": 0.01,
        "maximum_number_of_epochs": 10,
        "optimizer": "Adam",
        "token_embedding_matrix": null,
        "token_embedding_dimension": 200,
        "max_seq_len": 50
    }"#;

    #[test]
    fn parses_keras_style_names() {
        let params = Hyperparameters::from_json_str(PARAMS).unwrap();
        assert_eq!(params.activation_function, Activation::Relu);
        assert_eq!(params.optimizer, OptimizerKind::Adam);
        assert_eq!(params.fold_reset_policy, FoldResetPolicy::Reinitialize);
        assert_eq!(params.random_seed, 42);
        assert!(params.shuffle_batches);
        assert!(!params.shuffle_folds);
        assert_eq!(params.embedding_dimension(), 200);
    }

    #[test]
    fn missing_key_is_an_error() {
        let mut value: serde_json::Value = serde_json::from_str(PARAMS).unwrap();
        value.as_object_mut().unwrap().remove("k_folds");
        let err = Hyperparameters::from_json_str(&value.to_string()).unwrap_err();
        assert!(err.to_string().contains("k_folds"), "{err}");
    }

    #[test]
    fn nullable_keys_are_still_required() {
        let mut value: serde_json::Value = serde_json::from_str(PARAMS).unwrap();
        value
            .as_object_mut()
            .unwrap()
            .remove("token_embedding_matrix");
        let err = Hyperparameters::from_json_str(&value.to_string()).unwrap_err();
        assert!(err.to_string().contains("token_embedding_matrix"), "{err}");
    }

    #[test]
    fn unknown_optimizer_is_rejected() {
        let json = PARAMS.replace("\"Adam\"", "\"lbfgs\"");
        let err = Hyperparameters::from_json_str(&json).unwrap_err();
        assert!(err.to_string().contains("lbfgs"));
    }

    #[test]
    fn unknown_activation_is_rejected() {
        let json = PARAMS.replace("\"relu\"", "\"swish\"");
        assert!(Hyperparameters::from_json_str(&json).is_err());
    }

    #[test]
    fn dropout_out_of_range_is_rejected() {
        let json = PARAMS.replace("0.3", "1.5");
        assert!(matches!(
            Hyperparameters::from_json_str(&json),
            Err(KariError::Config(_))
        ));
    }

    #[test]
    fn pretrained_matrix_defines_embedding_width() {
        let json = PARAMS.replace(
            "\"token_embedding_matrix\": null",
            "\"token_embedding_matrix\": [[0.0, 0.0, 0.0], [0.1, 0.2, 0.3]]",
        );
        let params = Hyperparameters::from_json_str(&json).unwrap();
        assert_eq!(params.embedding_dimension(), 3);
    }

    #[test]
    fn ragged_pretrained_matrix_is_rejected() {
        let json = PARAMS.replace(
            "\"token_embedding_matrix\": null",
            "\"token_embedding_matrix\": [[0.0, 0.0], [0.1]]",
        );
        assert!(Hyperparameters::from_json_str(&json).is_err());
    }

    #[test]
    fn fold_reset_policy_parses_snake_case() {
        let json = PARAMS.replace(
            "\"max_seq_len\": 50",
            "\"max_seq_len\": 50, \"fold_reset_policy\": \"carry_over\"",
        );
        let params = Hyperparameters::from_json_str(&json).unwrap();
        assert_eq!(params.fold_reset_policy, FoldResetPolicy::CarryOver);
    }

    #[test]
    fn activation_round_trips_through_string() {
        let s: String = Activation::Tanh.into();
        assert_eq!(s, "tanh");
        assert_eq!("TANH".parse::<Activation>().unwrap(), Activation::Tanh);
    }

    fn spec_params() -> Hyperparameters {
        let json = PARAMS.replace("\"max_seq_len\": 50", "\"max_seq_len\": 6");
        Hyperparameters::from_json_str(&json).unwrap()
    }

    /// Dataset over `words` word types whose tokens reach index `words`.
    fn wide_dataset(name: &str, words: u32) -> Dataset {
        let word_type_to_idx = (1..=words).map(|i| (format!("w{i}"), i)).collect();
        let tag_type_to_idx = [("O".to_string(), 0)].into_iter().collect();
        let tokens = vec![vec![1, words, 0, 0, 0, 0], vec![2, 3, 4, 0, 0, 0]];
        let tags = vec![vec![0; 6]; 2];
        Dataset::new(name, word_type_to_idx, tag_type_to_idx, tokens, tags).unwrap()
    }

    #[test]
    fn datasets_must_index_within_shared_vocabulary() {
        let small = toy_dataset("small", 4, 6, 3);
        let wide = wide_dataset("wide", 30);

        let err = ModelSpecification::new(spec_params(), vec![small.clone(), wide.clone()])
            .unwrap_err();
        match err {
            KariError::InvalidDataset { name, reason } => {
                assert_eq!(name, "wide");
                assert!(reason.contains("token index 30"), "{reason}");
            }
            other => panic!("unexpected error: {other}"),
        }

        // the first dataset defines the vocabulary, so the wide one may lead
        let spec = ModelSpecification::new(spec_params(), vec![wide, small]).unwrap();
        assert_eq!(spec.vocab_size(), 31);
    }
}
