//! Checkpoint directories
//!
//! A checkpoint is a directory `{tag}__epoch-{n}` below the run's checkpoint
//! output holding:
//!
//! - `meta.json`: epoch, best validation loss and the full training configuration
//! - `datafactory.json`: feature registrations and the dataset split
//! - `model.bin`, `optimizer.bin`: network parameters and Adam moments
//! - `scheduler.json`: learning-rate schedule state
//! - `model_config.json`: the architecture alone, enough to rebuild the network

use crate::config::TrainingConfig;
use crate::error::{Result, TrainError};
use crate::model::{ModelKind, NprNetwork};
use crate::scheduler::ReduceOnPlateau;
use burn::module::Module;
use burn::optim::Optimizer;
use burn::record::{BinFileRecorder, FullPrecisionSettings, Recorder};
use burn::tensor::backend::{AutodiffBackend, Backend};
use npr_data::DataloaderFactory;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

const META: &str = "meta.json";
const FACTORY: &str = "datafactory.json";
const MODEL: &str = "model";
const OPTIMIZER: &str = "optimizer";
const SCHEDULER: &str = "scheduler.json";
const MODEL_CONFIG: &str = "model_config.json";

/// Tag of checkpoints written for a new best validation loss.
pub const BEST_TAG: &str = "BEST";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub epoch: usize,
    /// Lowest summed validation loss so far, absent before the first evaluation.
    pub best_loss: Option<f64>,
    pub best_epoch: Option<usize>,
    pub config: TrainingConfig,
}

fn recorder() -> BinFileRecorder<FullPrecisionSettings> {
    BinFileRecorder::<FullPrecisionSettings>::new()
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(path, json).map_err(|e| TrainError::io(path, e))
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let json = std::fs::read_to_string(path).map_err(|e| TrainError::io(path, e))?;
    Ok(serde_json::from_str(&json)?)
}

/// A checkpoint directory on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    dir: PathBuf,
}

impl Checkpoint {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        if !dir.join(META).is_file() {
            return Err(TrainError::io(
                dir.join(META),
                std::io::Error::new(std::io::ErrorKind::NotFound, "not a checkpoint directory"),
            ));
        }
        Ok(Self { dir })
    }

    /// `{root}/{tag}__epoch-{epoch}`; `tag` is empty for periodic checkpoints.
    pub fn path_for(root: &Path, tag: &str, epoch: usize) -> PathBuf {
        root.join(format!("{tag}__epoch-{epoch}"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[tracing::instrument(skip_all, fields(dir = %dir.display()))]
    pub fn save<B, O>(
        dir: &Path,
        meta: &CheckpointMeta,
        factory: &DataloaderFactory,
        model: &NprNetwork<B>,
        optimizer: &O,
        scheduler: &ReduceOnPlateau,
    ) -> Result<Self>
    where
        B: AutodiffBackend,
        O: Optimizer<NprNetwork<B>, B>,
    {
        std::fs::create_dir_all(dir).map_err(|e| TrainError::io(dir, e))?;

        write_json(&dir.join(META), meta)?;
        write_json(&dir.join(MODEL_CONFIG), &meta.config.network)?;
        factory.save(&dir.join(FACTORY))?;
        scheduler.save(&dir.join(SCHEDULER))?;

        let recorder = recorder();
        model.clone().save_file(dir.join(MODEL), &recorder)?;
        Recorder::<B>::record(&recorder, optimizer.to_record(), dir.join(OPTIMIZER))?;

        info!(epoch = meta.epoch, "saved checkpoint");
        Ok(Self { dir: dir.to_path_buf() })
    }

    pub fn meta(&self) -> Result<CheckpointMeta> {
        read_json(&self.dir.join(META))
    }

    pub fn model_kind(&self) -> Result<ModelKind> {
        read_json(&self.dir.join(MODEL_CONFIG))
    }

    pub fn factory(&self) -> Result<DataloaderFactory> {
        Ok(DataloaderFactory::load(&self.dir.join(FACTORY))?)
    }

    pub fn scheduler(&self) -> Result<ReduceOnPlateau> {
        ReduceOnPlateau::load(&self.dir.join(SCHEDULER))
    }

    /// Rebuilds the stored architecture and loads its parameters.
    pub fn model<B: Backend>(&self, device: &B::Device) -> Result<NprNetwork<B>> {
        let network = self.model_kind()?.init::<B>(device)?;
        Ok(network.load_file(self.dir.join(MODEL), &recorder(), device)?)
    }

    pub fn load_optimizer<B, O>(&self, optimizer: O, device: &B::Device) -> Result<O>
    where
        B: AutodiffBackend,
        O: Optimizer<NprNetwork<B>, B>,
    {
        let record = Recorder::<B>::load(&recorder(), self.dir.join(OPTIMIZER), device)?;
        Ok(optimizer.load_record(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Model, NetworkInput};
    use crate::network::{ConvBlockKind, InovisConfig};
    use burn::backend::{Autodiff, NdArray};
    use burn::module::AutodiffModule;
    use burn::optim::AdamConfig;
    use burn::tensor::Tensor;
    use npr_data::FactoryConfig;

    type TestBackend = Autodiff<NdArray<f32>>;

    fn tiny_kind() -> ModelKind {
        ModelKind::Inovis(InovisConfig {
            in_channels_current: vec![4, 4],
            feature_amount_current: 4,
            feature_amount_gt: 4,
            in_gt_frame_amount: 1,
            feature_scale: 8,
            fe_current_filter_base: 4,
            fe_gt_filter_base: 4,
            conv_block_reconstruction: ConvBlockKind::Basic,
            ..Default::default()
        })
    }

    #[test]
    fn test_checkpoint_path_naming() {
        let root = Path::new("run/out_checkpoints");
        assert_eq!(Checkpoint::path_for(root, "", 3), root.join("__epoch-3"));
        assert_eq!(Checkpoint::path_for(root, BEST_TAG, 12), root.join("BEST__epoch-12"));
    }

    #[test]
    fn test_open_requires_meta() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Checkpoint::open(dir.path()).is_err());
    }

    #[test]
    fn test_save_and_restore() {
        let device = Default::default();
        let root = tempfile::tempdir().unwrap();
        let kind = tiny_kind();
        let model = kind.init::<TestBackend>(&device).unwrap();
        let optimizer = AdamConfig::new().init::<TestBackend, NprNetwork<TestBackend>>();
        let meta = CheckpointMeta {
            epoch: 7,
            best_loss: Some(0.25),
            best_epoch: Some(5),
            config: TrainingConfig {
                network: kind.clone(),
                ..Default::default()
            },
        };
        let factory = DataloaderFactory::new(FactoryConfig::default());
        let mut scheduler = ReduceOnPlateau::new(Default::default(), 1e-3);
        scheduler.step(0.5);

        let dir = Checkpoint::path_for(root.path(), "", 7);
        Checkpoint::save(&dir, &meta, &factory, &model, &optimizer, &scheduler).unwrap();

        let checkpoint = Checkpoint::open(&dir).unwrap();
        assert_eq!(checkpoint.meta().unwrap(), meta);
        assert_eq!(checkpoint.model_kind().unwrap(), kind);
        assert_eq!(checkpoint.factory().unwrap(), factory);
        assert_eq!(checkpoint.scheduler().unwrap(), scheduler);
        checkpoint
            .load_optimizer::<TestBackend, _>(AdamConfig::new().init::<TestBackend, NprNetwork<TestBackend>>(), &device)
            .unwrap();

        let restored = checkpoint.model::<NdArray<f32>>(&device).unwrap();
        let input = || NetworkInput {
            current: vec![Tensor::ones([1, 4, 16, 16], &device), Tensor::ones([1, 4, 8, 8], &device)],
            previous: vec![Tensor::ones([1, 4, 16, 16], &device)],
            movecs: vec![Tensor::zeros([1, 2, 16, 16], &device)],
        };
        let expected = model.valid().forward(input()).unwrap();
        let got = restored.forward(input()).unwrap();
        expected.into_data().assert_approx_eq(&got.into_data(), 5);
    }
}
