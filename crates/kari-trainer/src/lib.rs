//! # Kari Trainer
//!
//! k-fold cross-validated training of multi-task BiLSTM-CRF models: the
//! fold × epoch × dataset loop, per-epoch checkpointing and validation
//! metrics, and the run configuration read by the `train` binary.

pub mod callbacks;
pub mod config;
pub mod trainer;

pub use callbacks::{Callback, Checkpointer, EpochContext, Metrics, NoCheckpoint};
pub use config::{RunConfig, load_dataset};
pub use trainer::{EpochRecord, Trainer, fit_epoch};
