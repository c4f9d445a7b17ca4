//! NPR Application
//!
//! Command-line driver for training the neural point-rendering network:
//! loads the configuration, applies command-line overrides, initializes
//! logging and runs (or continues) a training session on the CPU backend.

mod cli;

use burn::backend::{Autodiff, NdArray};
use burn::tensor::backend::Backend;
use clap::Parser;
use cli::Args;
use npr_train::{TrainError, TrainingConfig, TrainingSession};
use thiserror::Error;
use tracing::info;

type TrainBackend = Autodiff<NdArray<f32>>;

#[derive(Debug, Error)]
enum AppError {
    #[error(transparent)]
    Train(#[from] TrainError),

    #[error("failed to print configuration: {0}")]
    Json(#[from] serde_json::Error),
}

fn init_logging(level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with_target(false)
        .init();
}

fn run(args: Args) -> Result<(), AppError> {
    let mut config = match &args.config {
        Some(path) => TrainingConfig::load(path)?,
        None => TrainingConfig::default(),
    };
    args.apply(&mut config);

    if args.dump_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    init_logging(&config.log_level);
    info!(name = %config.training_name, sets = ?config.set_description, "NPR training");

    TrainBackend::seed(config.seed);
    let device = Default::default();
    let mut session = match config.checkpoint_load_dir.clone() {
        Some(dir) => TrainingSession::<TrainBackend>::from_checkpoint(&dir, config, device)?,
        None => TrainingSession::<TrainBackend>::new(config, device)?,
    };
    let summary = session.run()?;
    info!(
        epochs = summary.epochs_trained,
        best_loss = ?summary.best_loss,
        best_epoch = ?summary.best_epoch,
        "training finished"
    );
    Ok(())
}

fn main() {
    let args = Args::parse();

    if let Err(e) = run(args) {
        eprintln!("Training error: {}", e);
        std::process::exit(1);
    }
}
