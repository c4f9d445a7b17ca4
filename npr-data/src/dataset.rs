//! Random-access dataset over cached feature groups
//!
//! Features are grouped by their spatial size after the init transform; each
//! group is backed by one cache file. A sample reads one row from every cache
//! and applies each feature's onload transform with an RNG reseeded from a
//! single per-sample seed, so random crops line up across features.

use crate::cache::{CacheBuilder, CacheFile, probe_shape};
use crate::error::{DataError, Result};
use crate::feature::{FeatureFrames, check_filename_correspondence};
use crate::split::SplitKind;
use crate::transform::OnloadTransform;
use crate::types::ChwArray;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

pub const GROUNDTRUTH_FEATURE: &str = "groundtruth";

/// Which frames a dataset serves and which onload transforms it applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetKind {
    Train,
    Val,
    Test,
    /// Test frames with the validation transforms.
    Render,
}

impl DatasetKind {
    /// Split whose frames are served.
    pub fn frame_split(&self) -> SplitKind {
        match self {
            DatasetKind::Train => SplitKind::Train,
            DatasetKind::Val => SplitKind::Val,
            DatasetKind::Test | DatasetKind::Render => SplitKind::Test,
        }
    }

    /// Split whose onload transform applies.
    pub fn transform_split(&self) -> SplitKind {
        match self {
            DatasetKind::Train => SplitKind::Train,
            DatasetKind::Val | DatasetKind::Render => SplitKind::Val,
            DatasetKind::Test => SplitKind::Test,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DatasetKind::Train => "train",
            DatasetKind::Val => "val",
            DatasetKind::Test => "test",
            DatasetKind::Render => "render",
        }
    }
}

impl std::fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One dataset item.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub index: usize,
    /// Key of the ground truth frame.
    pub name: String,
    pub features: BTreeMap<String, ChwArray>,
}

#[derive(Debug, Clone)]
struct FeatureSlot {
    name: String,
    cache: usize,
    lo: usize,
    hi: usize,
    onload: OnloadTransform,
}

#[derive(Debug, Clone)]
pub struct NprDataset {
    kind: DatasetKind,
    caches: Vec<CacheFile>,
    slots: Vec<FeatureSlot>,
    names: Vec<String>,
}

impl NprDataset {
    /// Checks correspondence, groups features by size and builds or reuses
    /// one cache per group.
    #[tracing::instrument(skip_all, fields(kind = %kind))]
    pub fn build(kind: DatasetKind, features: Vec<FeatureFrames>, builder: &CacheBuilder) -> Result<Self> {
        check_filename_correspondence(&features)?;
        let names: Vec<String> = features
            .iter()
            .find(|f| f.name == GROUNDTRUTH_FEATURE)
            .or_else(|| features.first())
            .map(|f| f.keys().map(str::to_string).collect())
            .unwrap_or_default();
        if names.is_empty() {
            info!("Dataset '{}' has no frames", kind);
            return Ok(Self {
                kind,
                caches: Vec::new(),
                slots: Vec::new(),
                names,
            });
        }

        let mut groups: Vec<([usize; 2], Vec<FeatureFrames>)> = Vec::new();
        for feature in features {
            let [h, w, _] = probe_shape(&feature)?;
            match groups.iter_mut().find(|(size, _)| *size == [h, w]) {
                Some((_, members)) => members.push(feature),
                None => groups.push(([h, w], vec![feature])),
            }
        }

        let mut caches = Vec::with_capacity(groups.len());
        let mut slots = Vec::new();
        for (cache, (_, members)) in groups.iter().enumerate() {
            let built = builder.build(members)?;
            for (feature, span) in members.iter().zip(&built.manifest.spans) {
                slots.push(FeatureSlot {
                    name: feature.name.clone(),
                    cache,
                    lo: span.lo,
                    hi: span.hi,
                    onload: feature.onload,
                });
            }
            caches.push(built.file);
        }

        info!(
            "Dataset '{}': {} frames, {} features in {} cache file(s)",
            kind,
            names.len(),
            slots.len(),
            caches.len()
        );
        Ok(Self {
            kind,
            caches,
            slots,
            names,
        })
    }

    pub fn kind(&self) -> DatasetKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn feature_names(&self) -> impl Iterator<Item = &str> {
        self.slots.iter().map(|s| s.name.as_str())
    }

    /// Loads sample `index` with a fresh random seed.
    pub fn get(&self, index: usize) -> Result<Sample> {
        let seed: u64 = rand::rng().random();
        self.get_seeded(index, seed)
    }

    /// Loads sample `index`; every feature's onload RNG starts from `seed`.
    pub fn get_seeded(&self, index: usize, seed: u64) -> Result<Sample> {
        if index >= self.len() {
            return Err(DataError::IndexOutOfRange {
                index,
                len: self.len(),
            });
        }
        let mut features = BTreeMap::new();
        for (cache_index, cache) in self.caches.iter().enumerate() {
            let row = cache.read_row(index)?;
            for slot in self.slots.iter().filter(|s| s.cache == cache_index) {
                let mut rng = ChaCha8Rng::seed_from_u64(seed);
                let part = row.channel_range(slot.lo, slot.hi)?;
                features.insert(slot.name.clone(), slot.onload.apply(&part, &mut rng)?);
            }
        }
        Ok(Sample {
            index,
            name: self.names[index].clone(),
            features,
        })
    }
}
