//! # Kari
//!
//! Multi-task BiLSTM-CRF sequence tagging with k-fold cross validation.
//! Re-exports the model crate and the training loop.

pub use kari_core::*;
pub use kari_trainer as trainer;
pub use kari_trainer::{Callback, Checkpointer, EpochContext, NoCheckpoint, RunConfig, Trainer};
