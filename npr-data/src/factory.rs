//! Dataloader factory
//!
//! Collects feature registrations, splits each feature once at registration
//! time and produces datasets and loaders on demand. The whole state (feature
//! descriptors and split lists) serializes to JSON so a checkpoint can restore
//! exactly the same partition.

use crate::batch::DataLoader;
use crate::cache::CacheBuilder;
use crate::dataset::{DatasetKind, GROUNDTRUTH_FEATURE, NprDataset};
use crate::error::{DataError, Result};
use crate::feature::{DatasetLayout, FeatureSpec, FeatureSplit};
use crate::split::{SplitConfig, SplitKind};
use crate::transform::{OnloadTransform, OnloadTransforms, TransformDescriptor};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FactoryConfig {
    pub cache_dir: PathBuf,
    pub batch_size: usize,
    /// Batch size of val, test and render loaders.
    pub eval_batch_size: usize,
    /// Per-directory frame limit, 0 = unlimited.
    pub max_images: usize,
    pub split: SplitConfig,
    /// Without splitting every dataset serves all frames.
    pub split_enabled: bool,
    /// Base seed of the train loader's shuffle order.
    pub shuffle_seed: u64,
    pub show_progress: bool,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("./out_cache/"),
            batch_size: 6,
            eval_batch_size: 1,
            max_images: 0,
            split: SplitConfig::default(),
            split_enabled: true,
            shuffle_seed: 42,
            show_progress: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataloaderFactory {
    config: FactoryConfig,
    features: Vec<FeatureSplit>,
    produced: bool,
}

impl DataloaderFactory {
    pub fn new(config: FactoryConfig) -> Self {
        Self {
            config,
            features: Vec::new(),
            produced: false,
        }
    }

    pub fn config(&self) -> &FactoryConfig {
        &self.config
    }

    /// Registers (or replaces) a feature and splits its frames.
    pub fn add_img_feature(&mut self, spec: FeatureSpec) -> Result<()> {
        if self.produced {
            warn!(
                "Feature '{}' added after datasets were produced; saved factory state may not match them",
                spec.name
            );
        }
        let split = spec.split(&self.config.split, self.config.max_images)?;
        match self.features.iter_mut().find(|f| f.spec.name == spec.name) {
            Some(existing) => {
                info!("Replacing feature '{}'", spec.name);
                *existing = split;
            }
            None => {
                info!("Adding feature '{}'", spec.name);
                self.features.push(split);
            }
        }
        Ok(())
    }

    pub fn has_feature(&self, name: &str) -> bool {
        self.feature(name).is_some()
    }

    pub fn feature(&self, name: &str) -> Option<&FeatureSplit> {
        self.features.iter().find(|f| f.spec.name == name)
    }

    pub fn feature_names(&self) -> impl Iterator<Item = &str> {
        self.features.iter().map(|f| f.spec.name.as_str())
    }

    pub fn init_transform(&self, name: &str) -> Result<&TransformDescriptor> {
        self.feature(name)
            .map(|f| &f.spec.init)
            .ok_or_else(|| DataError::UnknownFeature(name.to_string()))
    }

    pub fn onload_transform(&self, name: &str, split: SplitKind) -> Result<Option<OnloadTransform>> {
        self.feature(name)
            .map(|f| f.spec.onload.for_split(split))
            .ok_or_else(|| DataError::UnknownFeature(name.to_string()))
    }

    /// Replaces the onload transform of one split without touching the split lists.
    pub fn set_onload_transform(
        &mut self,
        name: &str,
        split: SplitKind,
        transform: OnloadTransform,
    ) -> Result<()> {
        let feature = self
            .features
            .iter_mut()
            .find(|f| f.spec.name == name)
            .ok_or_else(|| DataError::UnknownFeature(name.to_string()))?;
        let onload = &mut feature.spec.onload;
        match split {
            SplitKind::Train => onload.train = Some(transform),
            SplitKind::Val => onload.val = Some(transform),
            SplitKind::Test => onload.test = Some(transform),
        }
        Ok(())
    }

    /// Builds the dataset of one kind, reusing caches where possible.
    pub fn dataset(&self, kind: DatasetKind) -> Result<NprDataset> {
        if self.features.is_empty() {
            return Err(DataError::NoFeatures);
        }
        let transform_split = kind.transform_split();
        let frames = self
            .features
            .iter()
            .map(|feature| {
                let onload = feature.spec.onload.for_split(transform_split).ok_or_else(|| {
                    DataError::MissingTransform {
                        feature: feature.spec.name.clone(),
                        split: transform_split.as_str().to_string(),
                    }
                })?;
                Ok(if self.config.split_enabled {
                    feature.frames_for(kind.frame_split(), onload)
                } else {
                    feature.all_frames(onload)
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let builder = CacheBuilder::new(&self.config.cache_dir).with_progress(self.config.show_progress);
        NprDataset::build(kind, frames, &builder)
    }

    /// Creates one loader per requested kind. Only the train loader shuffles.
    pub fn produce(&mut self, kinds: &[DatasetKind]) -> Result<BTreeMap<DatasetKind, DataLoader>> {
        if self.features.is_empty() {
            return Err(DataError::NoFeatures);
        }
        self.produced = true;
        kinds
            .iter()
            .map(|&kind| {
                let dataset = self.dataset(kind)?;
                let loader = match kind {
                    DatasetKind::Train => DataLoader::new(dataset, self.config.batch_size, true),
                    _ => DataLoader::new(dataset, self.config.eval_batch_size, false),
                };
                Ok((kind, loader.with_seed(self.config.shuffle_seed)))
            })
            .collect()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).map_err(|e| DataError::io(path, e))?;
        info!("Saved dataloader factory to {}", path.display());
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| DataError::io(path, e))?;
        Ok(serde_json::from_str(&json)?)
    }
}

/// Feature set of the multi-scale point-rendering network.
///
/// Sizes are `[width, height]`; level `k` uses `size >> k`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointRenderingFeatures {
    pub eval_size: [usize; 2],
    pub train_size: [usize; 2],
    /// Resolution levels of the point-rendered input, full resolution included.
    pub levels: usize,
    /// Historical ground-truth frames warped into the current view.
    pub historical_frames: usize,
}

impl Default for PointRenderingFeatures {
    fn default() -> Self {
        Self {
            eval_size: [512, 512],
            train_size: [256, 256],
            levels: 4,
            historical_frames: 3,
        }
    }
}

impl PointRenderingFeatures {
    pub fn level_name(prefix: &str, level: usize) -> String {
        if level == 0 {
            format!("{prefix}_0")
        } else {
            format!("{prefix}_l{level}")
        }
    }

    fn crops(&self, level: usize) -> OnloadTransforms {
        let [tw, th] = self.train_size;
        let [ew, eh] = self.eval_size;
        OnloadTransforms::new(
            OnloadTransform::RandomCrop {
                width: tw >> level,
                height: th >> level,
                alignment: 1 << self.levels.saturating_sub(1).saturating_sub(level),
            },
            OnloadTransform::CenterCrop {
                width: ew >> level,
                height: eh >> level,
            },
        )
    }

    /// Registers ground truth, the point-rendered pyramid and the historical frames.
    pub fn register(&self, factory: &mut DataloaderFactory, layout: &DatasetLayout) -> Result<()> {
        let [ew, eh] = self.eval_size;
        factory.add_img_feature(FeatureSpec {
            name: GROUNDTRUTH_FEATURE.to_string(),
            directories: layout.groundtruth(),
            channels: 4,
            init: TransformDescriptor::groundtruth(ew, eh),
            onload: self.crops(0),
        })?;

        for level in 0..self.levels {
            let (w, h) = (ew >> level, eh >> level);
            factory.add_img_feature(FeatureSpec {
                name: Self::level_name("i", level),
                directories: layout.input(level),
                channels: 4,
                init: TransformDescriptor::rendered(w, h),
                onload: self.crops(level),
            })?;
            factory.add_img_feature(FeatureSpec {
                name: Self::level_name("d", level),
                directories: layout.depth(level),
                channels: 1,
                init: TransformDescriptor::data(w, h),
                onload: self.crops(level),
            })?;
        }

        for k in 1..=self.historical_frames {
            factory.add_img_feature(FeatureSpec {
                name: format!("i_{k}"),
                directories: layout.nearest_groundtruth(k),
                channels: 3,
                init: TransformDescriptor::Identity,
                onload: OnloadTransforms::pass_through(),
            })?;
            factory.add_img_feature(FeatureSpec {
                name: format!("d_{k}"),
                directories: layout.nearest_depth(k),
                channels: 1,
                init: TransformDescriptor::Identity,
                onload: OnloadTransforms::pass_through(),
            })?;
            factory.add_img_feature(FeatureSpec {
                name: format!("m_{k}"),
                directories: layout.nearest_motion(k),
                channels: 3,
                init: TransformDescriptor::data(ew, eh),
                onload: self.crops(0),
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::write_blob;
    use crate::types::ImageArray;

    fn write_frames(dir: &Path, count: usize, size: usize, channels: usize) {
        std::fs::create_dir_all(dir).unwrap();
        for i in 0..count {
            let data = vec![i as f32 / count as f32; size * size * channels];
            let array = ImageArray::new(size, size, channels, data).unwrap();
            write_blob(&dir.join(format!("{i:04}.bin")), &array, 4).unwrap();
        }
    }

    fn factory(cache: &Path) -> DataloaderFactory {
        DataloaderFactory::new(FactoryConfig {
            cache_dir: cache.to_path_buf(),
            batch_size: 2,
            show_progress: false,
            ..FactoryConfig::default()
        })
    }

    fn simple_spec(name: &str, dir: &Path) -> FeatureSpec {
        FeatureSpec {
            name: name.to_string(),
            directories: vec![dir.to_path_buf()],
            channels: 3,
            init: TransformDescriptor::Identity,
            onload: OnloadTransforms::new(
                OnloadTransform::RandomCrop {
                    width: 4,
                    height: 4,
                    alignment: 1,
                },
                OnloadTransform::CenterCrop { width: 6, height: 6 },
            ),
        }
    }

    #[test]
    fn test_produce_without_features_fails() {
        let cache = tempfile::tempdir().unwrap();
        assert!(matches!(
            factory(cache.path()).produce(&[DatasetKind::Train]),
            Err(DataError::NoFeatures)
        ));
    }

    #[test]
    fn test_produce_splits_and_batches() {
        let data = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        write_frames(&data.path().join("gt"), 10, 8, 3);
        write_frames(&data.path().join("in"), 10, 8, 3);

        let mut factory = factory(cache.path());
        factory.add_img_feature(simple_spec(GROUNDTRUTH_FEATURE, &data.path().join("gt"))).unwrap();
        factory.add_img_feature(simple_spec("i_0", &data.path().join("in"))).unwrap();
        let loaders = factory
            .produce(&[DatasetKind::Train, DatasetKind::Val, DatasetKind::Test, DatasetKind::Render])
            .unwrap();

        assert_eq!(loaders[&DatasetKind::Train].dataset().len(), 6);
        assert_eq!(loaders[&DatasetKind::Val].dataset().len(), 2);
        assert_eq!(loaders[&DatasetKind::Test].dataset().len(), 2);
        assert_eq!(
            loaders[&DatasetKind::Render].dataset().names(),
            loaders[&DatasetKind::Test].dataset().names()
        );

        let train = &loaders[&DatasetKind::Train];
        assert_eq!(train.len(), 3);
        let batch = train.iter(0).next().unwrap().unwrap();
        assert_eq!(batch.feature("i_0").unwrap().shape, [2, 3, 4, 4]);

        let val = loaders[&DatasetKind::Val].iter(0).next().unwrap().unwrap();
        assert_eq!(val.feature(GROUNDTRUTH_FEATURE).unwrap().shape, [1, 3, 6, 6]);
    }

    #[test]
    fn test_state_round_trips_through_json() {
        let data = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        write_frames(&data.path().join("gt"), 5, 8, 3);
        let mut factory = factory(cache.path());
        factory.add_img_feature(simple_spec(GROUNDTRUTH_FEATURE, &data.path().join("gt"))).unwrap();
        factory
            .set_onload_transform(GROUNDTRUTH_FEATURE, SplitKind::Test, OnloadTransform::PassThrough)
            .unwrap();

        let path = cache.path().join("factory.json");
        factory.save(&path).unwrap();
        let mut restored = DataloaderFactory::load(&path).unwrap();
        assert_eq!(restored, factory);
        assert_eq!(
            restored.onload_transform(GROUNDTRUTH_FEATURE, SplitKind::Test).unwrap(),
            Some(OnloadTransform::PassThrough)
        );
        assert!(restored.set_onload_transform("nope", SplitKind::Val, OnloadTransform::PassThrough).is_err());
    }

    #[test]
    fn test_point_rendering_features_register_full_pyramid() {
        let root = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        let layout = DatasetLayout::new(root.path(), vec!["scene".into()], "lod0");
        let features = PointRenderingFeatures {
            eval_size: [16, 16],
            train_size: [8, 8],
            levels: 2,
            historical_frames: 1,
        };
        write_frames(&layout.groundtruth()[0], 4, 16, 4);
        for level in 0..2 {
            write_frames(&layout.input(level)[0], 4, 16 >> level, 4);
            write_frames(&layout.depth(level)[0], 4, 16 >> level, 1);
        }
        write_frames(&layout.nearest_groundtruth(1)[0], 4, 20, 3);
        write_frames(&layout.nearest_depth(1)[0], 4, 20, 1);
        write_frames(&layout.nearest_motion(1)[0], 4, 16, 3);

        let mut factory = factory(cache.path());
        features.register(&mut factory, &layout).unwrap();
        assert_eq!(
            factory.feature_names().collect::<Vec<_>>(),
            vec!["groundtruth", "i_0", "d_0", "i_l1", "d_l1", "i_1", "d_1", "m_1"]
        );
        let train_crop = |name: &str| factory.onload_transform(name, SplitKind::Train).unwrap();
        assert_eq!(
            train_crop("i_0"),
            Some(OnloadTransform::RandomCrop {
                width: 8,
                height: 8,
                alignment: 2,
            })
        );
        assert_eq!(
            train_crop("d_l1"),
            Some(OnloadTransform::RandomCrop {
                width: 4,
                height: 4,
                alignment: 1,
            })
        );
        assert_eq!(train_crop("m_1"), train_crop("groundtruth"));

        let dataset = factory.dataset(DatasetKind::Train).unwrap();
        let sample = dataset.get(0).unwrap();
        assert_eq!(sample.features["groundtruth"].shape(), [3, 8, 8]);
        assert_eq!(sample.features["i_l1"].shape(), [3, 4, 4]);
        assert_eq!(sample.features["d_0"].shape(), [1, 8, 8]);
        assert_eq!(sample.features["i_1"].shape(), [3, 20, 20]);
        assert_eq!(sample.features["m_1"].shape(), [3, 8, 8]);
    }
}
