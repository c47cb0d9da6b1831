//! Cross-validated training of a multi-task BiLSTM-CRF from a JSON run configuration.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use kari_trainer::{Callback, Checkpointer, NoCheckpoint, RunConfig, Trainer};
use tracing::info;

/// CLI arguments
#[derive(Parser)]
#[command(name = "train")]
#[command(about = "Train a multi-task BiLSTM-CRF with k-fold cross validation")]
#[command(version)]
struct Cli {
    /// Run configuration: hyperparameters plus dataset paths
    #[arg(short, long, env = "KARI_CONFIG")]
    config: PathBuf,

    /// Write a safetensors checkpoint after every epoch
    #[arg(short = 'o', long)]
    checkpoint_dir: Option<PathBuf>,

    /// Override maximum_number_of_epochs
    #[arg(short, long)]
    epochs: Option<usize>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let mut config = RunConfig::from_path(&cli.config)?;
    if let Some(epochs) = cli.epochs {
        config.hyperparameters.maximum_number_of_epochs = epochs;
    }
    let checkpoint_dir = cli.checkpoint_dir.or_else(|| config.checkpoint_dir.clone());

    let spec = config
        .into_specification()
        .context("building model specification")?;
    info!(datasets = spec.ds.len(), "model specification ready");

    let mut trainer = Trainer::new(spec);
    let mut checkpointer: Box<dyn Callback> = match checkpoint_dir {
        Some(dir) => {
            info!(dir = %dir.display(), "checkpointing enabled");
            Box::new(Checkpointer::new(dir))
        }
        None => Box::new(NoCheckpoint),
    };
    trainer.fit(checkpointer.as_mut())?;

    let last_epoch = trainer
        .model()
        .spec()
        .hyperparameters
        .maximum_number_of_epochs
        .saturating_sub(1);
    for record in trainer.history().iter().filter(|r| r.epoch == last_epoch) {
        if let Some(report) = &record.metrics {
            info!(
                fold = record.fold,
                epoch = record.epoch,
                dataset = %record.dataset,
                f1 = report.micro.f1,
                "final validation"
            );
        }
    }
    Ok(())
}
