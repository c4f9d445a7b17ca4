//! Training session
//!
//! Owns everything one training run needs: configuration, dataloaders, the
//! network, the learning-rate schedule and the best-loss bookkeeping. The
//! optimizer is created by [`TrainingSession::run`] and passed to the steps
//! that need it.

use crate::checkpoint::{BEST_TAG, Checkpoint, CheckpointMeta};
use crate::config::TrainingConfig;
use crate::debug;
use crate::error::{Result, TrainError};
use crate::export::{ExportSignature, export_network};
use crate::loss::{LossKind, LossTracker, compute_losses};
use crate::model::{Model, ModelKind, NetworkInput, NprNetwork};
use crate::scheduler::ReduceOnPlateau;
use burn::module::{AutodiffModule, Module};
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::tensor::backend::{AutodiffBackend, Backend};
use indicatif::{ProgressBar, ProgressStyle};
use npr_data::{Batch, DataLoader, DataloaderFactory, DatasetKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Training batches written as debug sheets on output epochs.
const MAX_TRAIN_SHEETS: usize = 10;
/// Validation batches written as debug sheets on output epochs.
const MAX_EVAL_SHEET_BATCHES: usize = 4;
const ADAM_EPSILON: f32 = 1e-8;

/// Losses of one finished epoch, appended to `losses.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochReport {
    pub epoch: usize,
    pub learning_rate: f64,
    pub train: BTreeMap<LossKind, f64>,
    pub val: BTreeMap<LossKind, f64>,
    /// Sum over validation batches of the optimized loss.
    pub val_summed: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSummary {
    pub epochs_trained: usize,
    pub best_loss: Option<f64>,
    pub best_epoch: Option<usize>,
    pub test: Option<BTreeMap<LossKind, f64>>,
}

pub struct TrainingSession<B: AutodiffBackend> {
    config: TrainingConfig,
    device: B::Device,
    model: NprNetwork<B>,
    factory: DataloaderFactory,
    loaders: BTreeMap<DatasetKind, DataLoader>,
    scheduler: ReduceOnPlateau,
    epoch: usize,
    best_loss: Option<f64>,
    best_epoch: Option<usize>,
    /// Checkpoint whose optimizer state is loaded when the run starts.
    resume: Option<Checkpoint>,
}

fn build_loaders(
    config: &TrainingConfig,
    factory: &mut DataloaderFactory,
) -> Result<BTreeMap<DatasetKind, DataLoader>> {
    let loaders = factory.produce(&[DatasetKind::Train, DatasetKind::Val, DatasetKind::Test])?;
    for kind in [DatasetKind::Train, DatasetKind::Val] {
        if loaders.get(&kind).is_none_or(|l| l.is_empty()) {
            return Err(TrainError::EmptyDataset(kind.to_string()));
        }
    }
    info!(
        sets = ?config.set_description,
        train = loaders[&DatasetKind::Train].dataset().len(),
        val = loaders[&DatasetKind::Val].dataset().len(),
        test = loaders.get(&DatasetKind::Test).map_or(0, |l| l.dataset().len()),
        "dataloaders ready"
    );
    Ok(loaders)
}

fn fresh_factory(config: &TrainingConfig) -> Result<DataloaderFactory> {
    let mut factory = DataloaderFactory::new(config.factory_config());
    config
        .network
        .point_rendering_features(config.input_size, config.train_input_size)
        .register(&mut factory, &config.dataset_layout())?;
    Ok(factory)
}

fn epoch_bar(batches: usize, label: String) -> ProgressBar {
    let bar = ProgressBar::new(batches as u64);
    bar.set_style(
        ProgressStyle::with_template("{msg} [{bar:40}] {pos}/{len} ({eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    bar.set_message(label);
    bar
}

fn format_losses(losses: &BTreeMap<LossKind, f64>) -> String {
    losses
        .iter()
        .map(|(kind, value)| format!("{kind}={value:.4}"))
        .collect::<Vec<_>>()
        .join(" ")
}

impl<B: AutodiffBackend> TrainingSession<B> {
    /// Starts a run from scratch: registers the features, splits the data
    /// and initializes the network.
    pub fn new(config: TrainingConfig, device: B::Device) -> Result<Self> {
        config.validate()?;
        let mut factory = fresh_factory(&config)?;
        let loaders = build_loaders(&config, &mut factory)?;
        let model = config.network.init::<B>(&device)?;
        info!(
            network = config.network.name(),
            parameters = model.num_params(),
            "network initialized"
        );
        let scheduler = ReduceOnPlateau::new(config.scheduler.clone(), config.learning_rate);
        Ok(Self {
            config,
            device,
            model,
            factory,
            loaders,
            scheduler,
            epoch: 0,
            best_loss: None,
            best_epoch: None,
            resume: None,
        })
    }

    /// Continues from a checkpoint. With `restore_dataloader` the stored split
    /// is reused and counting resumes after the stored epoch; otherwise the
    /// dataset settings of `fresh` are applied and the run starts at epoch 0.
    #[tracing::instrument(skip_all, fields(dir = %dir.display()))]
    pub fn from_checkpoint(dir: &Path, fresh: TrainingConfig, device: B::Device) -> Result<Self> {
        let checkpoint = Checkpoint::open(dir)?;
        let meta = checkpoint.meta()?;
        let mut config = meta.config;
        config.continue_as(&fresh);

        let (factory, loaders, epoch, best_loss, best_epoch) = if fresh.restore_dataloader {
            info!(epoch = meta.epoch, "restoring checkpointed dataloaders");
            let mut factory = checkpoint.factory()?;
            let loaders = build_loaders(&config, &mut factory)?;
            (factory, loaders, meta.epoch + 1, meta.best_loss, meta.best_epoch)
        } else {
            info!(sets = ?fresh.set_description, "creating new dataloaders");
            config.adopt_dataset_settings(&fresh);
            let mut factory = fresh_factory(&config)?;
            let loaders = build_loaders(&config, &mut factory)?;
            (factory, loaders, 0, None, None)
        };
        config.validate()?;
        if epoch >= config.epochs {
            warn!(epoch, epochs = config.epochs, "checkpoint is already past the configured epochs");
        }

        let model = checkpoint.model::<B>(&device)?;
        let scheduler = checkpoint.scheduler()?;
        tracing::debug!(config = ?config, "configuration after loading checkpoint");
        Ok(Self {
            config,
            device,
            model,
            factory,
            loaders,
            scheduler,
            epoch,
            best_loss,
            best_epoch,
            resume: Some(checkpoint),
        })
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn model(&self) -> &NprNetwork<B> {
        &self.model
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn best_loss(&self) -> Option<f64> {
        self.best_loss
    }

    pub fn learning_rate(&self) -> f64 {
        self.scheduler.lr()
    }

    fn loader(&self, kind: DatasetKind) -> Result<&DataLoader> {
        self.loaders
            .get(&kind)
            .ok_or_else(|| TrainError::EmptyDataset(kind.to_string()))
    }

    fn is_output_epoch(&self) -> bool {
        self.epoch % self.config.write_output_nth_epoch == 0
    }

    fn suffix(&self, batch_id: usize) -> String {
        format!("_{:03}_{batch_id}.png", self.epoch)
    }

    /// Creates the output directories and writes `network.txt`, the summary
    /// read by the real-time renderer.
    pub fn prepare_outputs(&self) -> Result<()> {
        let mut dirs = vec![
            self.config.output_dir(),
            self.config.train_output(),
            self.config.eval_output(),
            self.config.checkpoints_output(),
        ];
        if self.config.output_results {
            dirs.push(self.config.results_output());
        }
        if self.config.network.output_warped() {
            dirs.push(self.config.warped_output());
        }
        for dir in dirs {
            std::fs::create_dir_all(&dir).map_err(|e| TrainError::io(&dir, e))?;
        }

        let path = self.config.checkpoints_output().join("network.txt");
        std::fs::write(&path, self.run_info()).map_err(|e| TrainError::io(&path, e))
    }

    fn run_info(&self) -> String {
        let (depth, frames) = match &self.config.network {
            ModelKind::Inovis(network) => (network.feature_extraction_depth, network.in_gt_frame_amount),
        };
        let pre_init = self.config.set_description.iter().any(|set| set.contains("preInitMV"));
        format!(
            "name: {}\nfeature_extraction_depth: {depth}\nmovec_channels: 3\ngroundtruth_amount: {frames}\nprevInitMV: {}\n",
            self.config.training_name,
            u8::from(pre_init)
        )
    }

    fn forward<BB: Backend>(
        &self,
        model: &NprNetwork<BB>,
        input: NetworkInput<BB>,
        trace_dir: Option<(&Path, String)>,
    ) -> Result<burn::tensor::Tensor<BB, 4>> {
        match trace_dir {
            Some((dir, suffix)) => {
                let (rendered, trace) = model.forward_traced(input)?;
                if let Some(trace) = trace {
                    debug::write_trace(&trace, dir, &suffix)?;
                }
                Ok(rendered)
            }
            None => model.forward(input),
        }
    }

    /// One pass over the training set with the current learning rate.
    pub fn train_epoch<O: Optimizer<NprNetwork<B>, B>>(&mut self, optimizer: &mut O) -> Result<LossTracker> {
        let batches = self.loader(DatasetKind::Train)?.iter(self.epoch);
        let network = self.config.network.clone();
        let lr = self.scheduler.lr();
        let output_epoch = self.is_output_epoch();
        let warped_output = self.config.warped_output();
        let mut sheets = 0;
        let mut tracker = LossTracker::default();

        let bar = epoch_bar(batches.len(), format!("Train {}/{}", self.epoch + 1, self.config.epochs));
        for (batch_id, batch) in batches.enumerate() {
            let batch = batch?;
            let input = network.input_from_batch::<B>(&batch, &self.device)?;
            let target = network.target_from_batch::<B>(&batch, &self.device)?;
            let trace = (output_epoch && batch_id == 0 && network.output_warped())
                .then(|| (warped_output.as_path(), format!("_train{}", self.suffix(batch_id))));
            let rendered = self.forward(&self.model, input, trace)?;

            let losses = compute_losses(self.config.loss_function, rendered.clone(), target)?;
            tracker.add(&losses.values);
            let grads = GradientsParams::from_grads(losses.optimized.backward(), &self.model);
            self.model = optimizer.step(lr, self.model.clone(), grads);

            if output_epoch && sheets < MAX_TRAIN_SHEETS {
                sheets += debug::write_batch_sheets(
                    &batch,
                    rendered,
                    &self.config.train_output(),
                    &self.suffix(batch_id),
                    MAX_TRAIN_SHEETS - sheets,
                )?;
            }
            bar.set_message(format!(
                "Train {}/{} {}",
                self.epoch + 1,
                self.config.epochs,
                format_losses(&tracker.averages())
            ));
            bar.inc(1);
        }
        bar.finish_and_clear();
        Ok(tracker)
    }

    /// Evaluates one dataset without gradients. Debug sheets are written on
    /// output epochs; validation results also go to the results directory.
    pub fn evaluate(&self, kind: DatasetKind) -> Result<LossTracker> {
        let loader = self.loader(kind)?;
        let model = self.model.valid();
        let network = &self.config.network;
        let output_epoch = self.is_output_epoch();
        let sheet_dir = match kind {
            DatasetKind::Train | DatasetKind::Val => self.config.eval_output(),
            DatasetKind::Test | DatasetKind::Render => self.config.test_output(),
        };
        let write_results = kind == DatasetKind::Val
            && self.config.output_results
            && (output_epoch || self.epoch + 1 == self.config.epochs);
        let warped_output = self.config.warped_output();
        let mut tracker = LossTracker::default();

        let bar = epoch_bar(loader.len(), format!("{kind} {}/{}", self.epoch + 1, self.config.epochs));
        for (batch_id, batch) in loader.iter(self.epoch).enumerate() {
            let batch = batch?;
            let input = network.input_from_batch::<B::InnerBackend>(&batch, &self.device)?;
            let target = network.target_from_batch::<B::InnerBackend>(&batch, &self.device)?;
            let trace = (output_epoch && batch_id == 0 && network.output_warped())
                .then(|| (warped_output.as_path(), format!("_{kind}{}", self.suffix(batch_id))));
            let rendered = self.forward(&model, input, trace)?;

            let losses = compute_losses(self.config.loss_function, rendered.clone(), target.clone())?;
            tracker.add(&losses.values);

            if output_epoch && batch_id < MAX_EVAL_SHEET_BATCHES {
                debug::write_batch_sheets(&batch, rendered.clone(), &sheet_dir, &self.suffix(batch_id), usize::MAX)?;
            }
            if write_results {
                let path = self.config.results_output().join(format!("Result{batch_id}.png"));
                debug::write_result(rendered, target, &path)?;
            }
            bar.inc(1);
        }
        bar.finish_and_clear();
        Ok(tracker)
    }

    /// Writes a checkpoint of the current state into `dir`.
    pub fn save_checkpoint<O: Optimizer<NprNetwork<B>, B>>(&self, optimizer: &O, dir: &Path) -> Result<Checkpoint> {
        let meta = CheckpointMeta {
            epoch: self.epoch,
            best_loss: self.best_loss,
            best_epoch: self.best_epoch,
            config: self.config.clone(),
        };
        Checkpoint::save(dir, &meta, &self.factory, &self.model, optimizer, &self.scheduler)
    }

    /// Saves a tagged checkpoint of the current epoch together with an export
    /// of the network.
    fn checkpoint<O: Optimizer<NprNetwork<B>, B>>(&self, optimizer: &O, tag: &str) -> Result<PathBuf> {
        let dir = Checkpoint::path_for(&self.config.checkpoints_output(), tag, self.epoch);
        self.save_checkpoint(optimizer, &dir)?;
        self.export_network(&dir.join("network"))?;
        Ok(dir)
    }

    /// Exports the inference network, validated on the first validation batch.
    pub fn export_network(&self, stem: &Path) -> Result<ExportSignature> {
        let batch: Batch = self
            .loader(DatasetKind::Val)?
            .iter(0)
            .next()
            .ok_or_else(|| TrainError::EmptyDataset(DatasetKind::Val.to_string()))??;
        let model = self.model.valid();
        let example = self
            .config
            .network
            .input_from_batch::<B::InnerBackend>(&batch, &self.device)?;
        export_network(&model, example, stem)
    }

    fn append_report(&self, report: &EpochReport) -> Result<()> {
        let path = self.config.output_dir().join("losses.jsonl");
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| TrainError::io(&path, e))?;
        let line = serde_json::to_string(report)?;
        writeln!(file, "{line}").map_err(|e| TrainError::io(&path, e))
    }

    /// Runs the remaining epochs with a fresh Adam optimizer, or the
    /// checkpointed one when the session was restored.
    pub fn run(&mut self) -> Result<TrainingSummary> {
        let optimizer = AdamConfig::new().with_epsilon(ADAM_EPSILON).init::<B, NprNetwork<B>>();
        self.run_with(optimizer)
    }

    /// Epoch loop: train, validate, step the schedule, then checkpoint. A new
    /// best validation loss is checkpointed once at least
    /// `save_checkpoint_best_epoch_frequency` epochs passed since the last
    /// checkpoint; periodic checkpoints follow `save_checkpoint_frequency`.
    pub fn run_with<O: Optimizer<NprNetwork<B>, B>>(&mut self, mut optimizer: O) -> Result<TrainingSummary> {
        if let Some(checkpoint) = self.resume.take() {
            optimizer = checkpoint.load_optimizer::<B, O>(optimizer, &self.device)?;
            info!(dir = %checkpoint.dir().display(), "restored optimizer state");
        }
        self.prepare_outputs()?;
        info!(
            epochs = self.config.epochs,
            start = self.epoch,
            train_batches = self.loader(DatasetKind::Train)?.len(),
            val_batches = self.loader(DatasetKind::Val)?.len(),
            checkpoints = self.config.save_checkpoint,
            "starting training"
        );

        let start = self.epoch;
        let mut last_checkpoint = start;
        let mut epochs_trained = 0;
        for epoch in start..self.config.epochs {
            self.epoch = epoch;
            let learning_rate = self.scheduler.lr();
            let train = self.train_epoch(&mut optimizer)?;
            let val = self.evaluate(DatasetKind::Val)?;
            let summed = val.summed(self.config.loss_function);
            epochs_trained += 1;

            let report = EpochReport {
                epoch,
                learning_rate,
                train: train.averages(),
                val: val.averages(),
                val_summed: summed,
            };
            self.append_report(&report)?;
            info!(
                epoch,
                best = ?self.best_loss,
                current = summed,
                since_checkpoint = epoch - last_checkpoint,
                "train: {} | val: {}",
                format_losses(&report.train),
                format_losses(&report.val)
            );

            self.scheduler.step(summed);

            if self.best_loss.is_none_or(|best| summed < best) {
                info!(epoch, loss = summed, "new best validation loss");
                self.best_loss = Some(summed);
                self.best_epoch = Some(epoch);
                if self.config.save_checkpoint
                    && epoch - last_checkpoint >= self.config.save_checkpoint_best_epoch_frequency
                {
                    self.checkpoint(&optimizer, BEST_TAG)?;
                    last_checkpoint = epoch;
                }
            }
            if self.config.save_checkpoint
                && epoch % self.config.save_checkpoint_frequency == 0
                && epoch != 0
                && epoch != last_checkpoint
            {
                self.checkpoint(&optimizer, "")?;
                last_checkpoint = epoch;
            }
        }

        let test = match self.loaders.get(&DatasetKind::Test) {
            Some(loader) if !loader.is_empty() => {
                let losses = self.evaluate(DatasetKind::Test)?.averages();
                info!("test: {}", format_losses(&losses));
                Some(losses)
            }
            _ => None,
        };
        Ok(TrainingSummary {
            epochs_trained,
            best_loss: self.best_loss,
            best_epoch: self.best_epoch,
            test,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{ConvBlockKind, InovisConfig};
    use burn::backend::{Autodiff, NdArray};
    use npr_data::{DatasetLayout, ImageArray, write_blob};

    type TestBackend = Autodiff<NdArray<f32>>;

    const FRAMES: usize = 10;
    const SIZE: usize = 16;

    fn write_frames(dir: &Path, size: usize, channels: usize) {
        std::fs::create_dir_all(dir).unwrap();
        for i in 0..FRAMES {
            let data = (0..size * size * channels)
                .map(|p| ((p + i) % 7) as f32 / 7.0)
                .collect();
            let array = ImageArray::new(size, size, channels, data).unwrap();
            write_blob(&dir.join(format!("{i:04}.bin")), &array, 4).unwrap();
        }
    }

    fn write_dataset(root: &Path) {
        let layout = DatasetLayout::new(root, vec!["scene".into()], "lod0");
        write_frames(&layout.groundtruth()[0], SIZE, 4);
        for level in 0..2 {
            write_frames(&layout.input(level)[0], SIZE >> level, 4);
            write_frames(&layout.depth(level)[0], SIZE >> level, 1);
        }
        write_frames(&layout.nearest_groundtruth(1)[0], SIZE, 3);
        write_frames(&layout.nearest_depth(1)[0], SIZE, 1);
        write_frames(&layout.nearest_motion(1)[0], SIZE, 3);
    }

    fn config(work: &Path, name: &str) -> TrainingConfig {
        TrainingConfig {
            training_name: name.into(),
            data_root: work.join("data"),
            cache_output: work.join("cache"),
            output_dir: Some(work.join(name)),
            set_description: vec!["scene".into()],
            batch_size: 2,
            input_size: [SIZE, SIZE],
            train_input_size: [SIZE, SIZE],
            epochs: 2,
            save_checkpoint_frequency: 1,
            write_output_nth_epoch: 1,
            output_results: true,
            network: ModelKind::Inovis(InovisConfig {
                in_channels_current: vec![4, 4],
                feature_amount_current: 4,
                feature_amount_gt: 4,
                in_gt_frame_amount: 1,
                feature_scale: 8,
                fe_current_filter_base: 4,
                fe_gt_filter_base: 4,
                conv_block_reconstruction: ConvBlockKind::Basic,
                output_warped: true,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_run_info_format() {
        let work = tempfile::tempdir().unwrap();
        write_dataset(&work.path().join("data"));
        let session = TrainingSession::<TestBackend>::new(config(work.path(), "info"), Default::default()).unwrap();
        assert_eq!(
            session.run_info(),
            "name: info\nfeature_extraction_depth: 0\nmovec_channels: 3\ngroundtruth_amount: 1\nprevInitMV: 0\n"
        );
    }

    #[test]
    fn test_missing_data_fails_early() {
        let work = tempfile::tempdir().unwrap();
        let result = TrainingSession::<TestBackend>::new(config(work.path(), "empty"), Default::default());
        assert!(result.is_err());
    }

    #[test]
    fn test_run_writes_outputs_and_resumes() {
        let work = tempfile::tempdir().unwrap();
        write_dataset(&work.path().join("data"));
        let config = config(work.path(), "first");
        let out = work.path().join("first");

        let mut session = TrainingSession::<TestBackend>::new(config.clone(), Default::default()).unwrap();
        let summary = session.run().unwrap();
        assert_eq!(summary.epochs_trained, 2);
        assert!(summary.best_loss.is_some());
        assert!(summary.test.is_some());

        assert!(out.join("out_checkpoints/network.txt").is_file());
        assert!(out.join("out_results/Result0.png").is_file());
        assert!(out.join("output_warped/reweighted_train_000_0.png").is_file());
        assert!(std::fs::read_dir(out.join("out_train")).unwrap().count() > 0);
        assert_eq!(
            std::fs::read_to_string(out.join("losses.jsonl")).unwrap().lines().count(),
            2
        );

        // epoch 0 never checkpoints, epoch 1 is periodic
        let checkpoint = out.join("out_checkpoints/__epoch-1");
        assert!(checkpoint.join("meta.json").is_file());
        assert!(checkpoint.join("network.mpk").is_file());
        assert!(!out.join("out_checkpoints/__epoch-0").exists());

        let resumed = TrainingConfig {
            epochs: 3,
            restore_dataloader: true,
            ..self::config(work.path(), "second")
        };
        let mut session = TrainingSession::<TestBackend>::from_checkpoint(&checkpoint, resumed, Default::default()).unwrap();
        assert_eq!(session.epoch(), 2);
        assert_eq!(session.config().training_name, "first++second");
        assert!(session.best_loss().is_some());
        let summary = session.run().unwrap();
        assert_eq!(summary.epochs_trained, 1);
        assert!(work.path().join("second/losses.jsonl").is_file());
    }

    #[test]
    fn test_checkpoint_without_dataloader_restarts_counting() {
        let work = tempfile::tempdir().unwrap();
        write_dataset(&work.path().join("data"));
        let base = TrainingConfig {
            epochs: 1,
            ..config(work.path(), "base")
        };
        let mut session = TrainingSession::<TestBackend>::new(base, Default::default()).unwrap();
        session.run().unwrap();
        let dir = work.path().join("saved");
        session
            .save_checkpoint(&AdamConfig::new().init::<TestBackend, NprNetwork<TestBackend>>(), &dir)
            .unwrap();

        let fresh = TrainingConfig {
            learning_rate: 1.0,
            ..config(work.path(), "finetune")
        };
        let session = TrainingSession::<TestBackend>::from_checkpoint(&dir, fresh, Default::default()).unwrap();
        assert_eq!(session.epoch(), 0);
        assert_eq!(session.best_loss(), None);
        // the restored schedule keeps its learning rate
        assert_eq!(session.learning_rate(), 5e-4);
    }
}
