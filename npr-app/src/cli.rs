use clap::Parser;
use npr_train::{LossKind, TrainingConfig};
use std::path::PathBuf;

/// NPR - train the neural point-rendering reconstruction network
#[derive(Parser, Debug)]
#[command(name = "npr")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Name of the training run
    pub name: Option<String>,

    /// JSON training configuration; missing fields use defaults
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Checkpoint directory to continue from
    #[arg(long)]
    pub checkpoint_load_dir: Option<PathBuf>,

    /// Reuse the checkpoint's dataset split and epoch count
    #[arg(long)]
    pub restore_dataloader: bool,

    /// Dataset directories below the data root
    #[arg(long, num_args = 1..)]
    pub set_description: Option<Vec<String>>,

    /// Frames loaded per dataset directory, 0 = all
    #[arg(long)]
    pub dataset_size: Option<usize>,

    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Held-out frame indices
    #[arg(long, num_args = 0..)]
    pub test_indices: Option<Vec<usize>>,

    /// Evaluation size as WIDTH HEIGHT; training crops use half of it
    #[arg(long, num_args = 2, value_names = ["WIDTH", "HEIGHT"])]
    pub input_size: Option<Vec<usize>>,

    /// Keep the configured training crop size when --input-size is given
    #[arg(long)]
    pub use_fixed_train_size: bool,

    #[arg(long)]
    pub epochs: Option<usize>,

    #[arg(long)]
    pub learning_rate: Option<f64>,

    /// MSE, L1 or SSIM
    #[arg(long, value_parser = parse_loss)]
    pub loss_function: Option<LossKind>,

    #[arg(long)]
    pub save_checkpoint_frequency: Option<usize>,

    #[arg(long)]
    pub save_checkpoint_best_epoch_frequency: Option<usize>,

    #[arg(long)]
    pub write_output_nth_epoch: Option<usize>,

    /// Write rendered/ground-truth pairs of the validation set
    #[arg(long)]
    pub output_results: Option<bool>,

    /// Log level used when RUST_LOG is unset
    #[arg(long)]
    pub log_level: Option<String>,

    /// Print the effective configuration as JSON and exit
    #[arg(long)]
    pub dump_config: bool,
}

fn parse_loss(value: &str) -> Result<LossKind, String> {
    value.parse().map_err(|e: npr_train::TrainError| e.to_string())
}

impl Args {
    /// Applies command-line overrides on top of a loaded configuration.
    pub fn apply(&self, config: &mut TrainingConfig) {
        if let Some(name) = &self.name {
            config.training_name = name.clone();
        }
        if let Some(dir) = &self.checkpoint_load_dir {
            config.checkpoint_load_dir = Some(dir.clone());
        }
        if self.restore_dataloader {
            config.restore_dataloader = true;
        }
        if let Some(sets) = &self.set_description {
            config.set_description = sets.clone();
        }
        if let Some(size) = self.dataset_size {
            config.max_images_per_drawelement = size;
        }
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(indices) = &self.test_indices {
            config.test_indices = indices.clone();
        }
        if let Some([width, height]) = self.input_size.as_deref().and_then(|s| <[usize; 2]>::try_from(s).ok()) {
            config.input_size = [width, height];
            if !self.use_fixed_train_size {
                config.train_input_size = [width / 2, height / 2];
            }
        }
        if let Some(epochs) = self.epochs {
            config.epochs = epochs;
        }
        if let Some(lr) = self.learning_rate {
            config.learning_rate = lr;
        }
        if let Some(loss) = self.loss_function {
            config.loss_function = loss;
        }
        if let Some(frequency) = self.save_checkpoint_frequency {
            config.save_checkpoint_frequency = frequency;
        }
        if let Some(frequency) = self.save_checkpoint_best_epoch_frequency {
            config.save_checkpoint_best_epoch_frequency = frequency;
        }
        if let Some(nth) = self.write_output_nth_epoch {
            config.write_output_nth_epoch = nth;
        }
        if let Some(output) = self.output_results {
            config.output_results = output;
        }
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
    }
}
