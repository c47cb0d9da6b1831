//! # Kari Core
//!
//! Multi-task sequence tagging on candle. Several pre-indexed datasets share
//! one embedding, BiLSTM encoder and projection, and each dataset gets its
//! own linear-chain CRF output layer. Also provides the k-fold index
//! generator and chunk-level BIO metrics used by the trainer.
//!
//! ## Quick Start
//!
//! ```rust
//! use kari_core::KFold;
//!
//! let folds = KFold::new(5).split(60).unwrap();
//! assert_eq!(folds.len(), 5);
//! assert!(folds.iter().all(|fold| fold.valid.len() == 12));
//! assert_eq!(folds[0].train.len(), 48);
//! ```
pub mod config;
pub mod crf;
pub mod dataset;
pub mod error;
pub mod folds;
pub mod layers;
pub mod metrics;
pub mod model;
pub mod optim;
pub mod tags;

// Re-export primary API
pub use config::{Activation, FoldResetPolicy, Hyperparameters, ModelSpecification, OptimizerKind};
pub use crf::{CrfLayer, ViterbiDecoder};
pub use dataset::{Batch, Dataset, PAD_INDEX, SequenceView};
pub use error::{KariError, Result};
pub use folds::{Fold, FoldTable, KFold, train_valid_indices};
pub use metrics::{Chunk, Prf, TaggingReport};
pub use model::{ModelState, MultiTaskLstmCrf, StepOutput, TaskModel};
pub use optim::TaskOptimizer;
pub use tags::BioTag;
