//! Training configuration
//!
//! Loaded from JSON (every field optional) and stored verbatim in checkpoint
//! metadata.

use crate::error::{Result, TrainError};
use crate::loss::LossKind;
use crate::model::ModelKind;
use crate::scheduler::PlateauConfig;
use npr_data::{DatasetLayout, FactoryConfig, SplitConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub training_name: String,
    pub data_root: PathBuf,
    pub cache_output: PathBuf,
    /// Base directory of all run outputs; `{training_name}/` when unset.
    pub output_dir: Option<PathBuf>,
    /// Dataset directories below `data_root`.
    pub set_description: Vec<String>,
    pub lod_description: String,
    pub batch_size: usize,
    /// Held-out frame indices forming the test set.
    pub test_indices: Vec<usize>,
    /// Frames per source directory, 0 = all.
    pub max_images_per_drawelement: usize,
    /// `[width, height]` of evaluation crops.
    pub input_size: [usize; 2],
    /// `[width, height]` of training crops.
    pub train_input_size: [usize; 2],
    pub epochs: usize,
    pub learning_rate: f64,
    pub scheduler: PlateauConfig,
    pub loss_function: LossKind,
    pub save_checkpoint: bool,
    pub save_checkpoint_frequency: usize,
    /// Minimum distance in epochs between a new best checkpoint and the previous checkpoint.
    pub save_checkpoint_best_epoch_frequency: usize,
    pub write_output_nth_epoch: usize,
    /// Write rendered/ground-truth pairs of the validation set.
    pub output_results: bool,
    pub checkpoint_load_dir: Option<PathBuf>,
    /// Reuse the checkpoint's dataset split and continue its epoch count.
    pub restore_dataloader: bool,
    pub seed: u64,
    pub log_level: String,
    pub network: ModelKind,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            training_name: "run".to_string(),
            data_root: PathBuf::from("./data/"),
            cache_output: PathBuf::from("./out_cache/"),
            output_dir: None,
            set_description: Vec::new(),
            lod_description: "lod0".to_string(),
            batch_size: 6,
            test_indices: Vec::new(),
            max_images_per_drawelement: 0,
            input_size: [512, 512],
            train_input_size: [256, 256],
            epochs: 1001,
            learning_rate: 5e-4,
            scheduler: PlateauConfig::default(),
            loss_function: LossKind::default(),
            save_checkpoint: true,
            save_checkpoint_frequency: 3,
            save_checkpoint_best_epoch_frequency: 50,
            write_output_nth_epoch: 100,
            output_results: false,
            checkpoint_load_dir: None,
            restore_dataloader: false,
            seed: 42,
            log_level: "info".to_string(),
            network: ModelKind::default(),
        }
    }
}

impl TrainingConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| TrainError::io(path, e))?;
        Ok(serde_json::from_str(&json)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).map_err(|e| TrainError::io(path, e))
    }

    pub fn validate(&self) -> Result<()> {
        if self.set_description.is_empty() {
            return Err(TrainError::Config("no dataset directories given (set_description)".into()));
        }
        if self.batch_size == 0 || self.epochs == 0 {
            return Err(TrainError::Config("batch size and epoch count must be positive".into()));
        }
        if self.save_checkpoint_frequency == 0 || self.write_output_nth_epoch == 0 {
            return Err(TrainError::Config("checkpoint and output frequencies must be positive".into()));
        }
        // the reconstruction halves the resolution four times
        for [w, h] in [self.input_size, self.train_input_size] {
            if w % 16 != 0 || h % 16 != 0 {
                return Err(TrainError::Config(format!("image size {w}x{h} is not divisible by 16")));
            }
        }
        Ok(())
    }

    pub fn output_dir(&self) -> PathBuf {
        self.output_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(&self.training_name))
    }

    pub fn train_output(&self) -> PathBuf {
        self.output_dir().join("out_train")
    }

    pub fn eval_output(&self) -> PathBuf {
        self.output_dir().join("out_eval")
    }

    pub fn results_output(&self) -> PathBuf {
        self.output_dir().join("out_results")
    }

    pub fn test_output(&self) -> PathBuf {
        self.output_dir().join("out_test")
    }

    pub fn checkpoints_output(&self) -> PathBuf {
        self.output_dir().join("out_checkpoints")
    }

    /// Debug images of warped auxiliary frames.
    pub fn warped_output(&self) -> PathBuf {
        self.output_dir().join("output_warped")
    }

    pub fn dataset_layout(&self) -> DatasetLayout {
        DatasetLayout::new(&self.data_root, self.set_description.clone(), &self.lod_description)
    }

    pub fn factory_config(&self) -> FactoryConfig {
        FactoryConfig {
            cache_dir: self.cache_output.clone(),
            batch_size: self.batch_size,
            max_images: self.max_images_per_drawelement,
            split: SplitConfig {
                seed: self.seed,
                test_indices: self.test_indices.clone(),
                ..SplitConfig::default()
            },
            shuffle_seed: self.seed,
            ..FactoryConfig::default()
        }
    }

    /// Renames a restored run after the run continuing it and takes over its
    /// outputs, length and checkpoint cadence.
    pub fn continue_as(&mut self, fresh: &TrainingConfig) {
        self.training_name = format!("{}++{}", self.training_name, fresh.training_name);
        self.output_dir = Some(fresh.output_dir());
        self.epochs = fresh.epochs;
        self.save_checkpoint = fresh.save_checkpoint;
        self.save_checkpoint_frequency = fresh.save_checkpoint_frequency;
        self.save_checkpoint_best_epoch_frequency = fresh.save_checkpoint_best_epoch_frequency;
        self.write_output_nth_epoch = fresh.write_output_nth_epoch;
        self.output_results = fresh.output_results;
        self.checkpoint_load_dir = fresh.checkpoint_load_dir.clone();
        self.restore_dataloader = fresh.restore_dataloader;
    }

    /// Takes over the dataset of `fresh` when a checkpoint is trained on new data.
    pub fn adopt_dataset_settings(&mut self, fresh: &TrainingConfig) {
        self.data_root = fresh.data_root.clone();
        self.set_description = fresh.set_description.clone();
        self.lod_description = fresh.lod_description.clone();
        self.cache_output = fresh.cache_output.clone();
        self.max_images_per_drawelement = fresh.max_images_per_drawelement;
        self.input_size = fresh.input_size;
        self.train_input_size = fresh.train_input_size;
        self.batch_size = fresh.batch_size;
        self.test_indices = fresh.test_indices.clone();
    }
}
