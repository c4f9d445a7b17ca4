//! Named input features and the frames backing them
//!
//! A feature is a channel group (`groundtruth`, `i_0`, `d_l2`, `m_1`, ...)
//! read from one directory per dataset set. Frames are identified by a key
//! that is shared across features, so lists of different features can be
//! checked for correspondence before any cache is built.

use crate::error::{DataError, Result};
use crate::split::{SplitConfig, SplitKind, SplitLists, split_filename_list};
use crate::transform::{OnloadTransform, OnloadTransforms, TransformDescriptor};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Sorted stems of one directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileList {
    pub directory: PathBuf,
    /// Extension of the first listed file, including the dot.
    pub extension: String,
    pub stems: Vec<String>,
    /// Number of files before `max_images` truncation.
    pub total: usize,
}

impl FileList {
    pub fn path(&self, stem: &str) -> PathBuf {
        self.directory.join(format!("{}{}", stem, self.extension))
    }
}

/// Lists `directory`, skipping hidden entries. The extension is taken from
/// the first file. `max_images > 0` keeps only the first
/// `max_images` sorted stems.
pub fn list_directory(directory: &Path, max_images: usize) -> Result<FileList> {
    let mut names: Vec<String> = std::fs::read_dir(directory)
        .map_err(|e| DataError::io(directory, e))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| !name.starts_with('.'))
        .collect();
    names.sort();
    if names.is_empty() {
        return Err(DataError::EmptyDirectory(directory.to_path_buf()));
    }

    let extension = Path::new(&names[0])
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    let mut stems: Vec<String> = names
        .iter()
        .map(|name| {
            Path::new(name)
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| name.clone())
        })
        .collect();
    stems.sort();
    let total = stems.len();
    if max_images > 0 && max_images < stems.len() {
        stems.truncate(max_images);
    }

    debug!(
        "Listed {} of {} files in {}",
        stems.len(),
        total,
        directory.display()
    );
    Ok(FileList {
        directory: directory.to_path_buf(),
        extension,
        stems,
        total,
    })
}

/// One frame of one feature.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameRef {
    /// Correspondence key: the stem, prefixed with the set name when a
    /// feature spans several sets.
    pub key: String,
    pub path: PathBuf,
}

/// Registration data of a feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSpec {
    pub name: String,
    /// One directory per dataset set.
    pub directories: Vec<PathBuf>,
    /// Channels requested from the decoder.
    pub channels: usize,
    pub init: TransformDescriptor,
    pub onload: OnloadTransforms,
}

impl FeatureSpec {
    /// Lists the frames of all directories, sorted by key.
    pub fn list_frames(&self, max_images: usize) -> Result<Vec<Vec<FrameRef>>> {
        let multi = self.directories.len() > 1;
        self.directories
            .iter()
            .map(|dir| {
                let list = list_directory(dir, max_images)?;
                let prefix = if multi { set_name(dir) } else { None };
                Ok(list
                    .stems
                    .iter()
                    .map(|stem| FrameRef {
                        key: match &prefix {
                            Some(set) => format!("{set}/{stem}"),
                            None => stem.clone(),
                        },
                        path: list.path(stem),
                    })
                    .collect())
            })
            .collect()
    }

    /// Splits the frames of every directory with one shared configuration.
    ///
    /// Explicit test indices address each directory's own sorted list.
    pub fn split(&self, config: &SplitConfig, max_images: usize) -> Result<FeatureSplit> {
        for split in [SplitKind::Train, SplitKind::Val] {
            if self.onload.for_split(split).is_none() {
                return Err(DataError::MissingTransform {
                    feature: self.name.clone(),
                    split: split.as_str().to_string(),
                });
            }
        }

        let per_directory = self.list_frames(max_images)?;
        let mut all: Vec<FrameRef> = Vec::new();
        let mut held_out_keys = HashSet::new();
        for frames in &per_directory {
            for &i in &config.test_indices {
                if let Some(frame) = frames.get(i) {
                    held_out_keys.insert(frame.key.clone());
                }
            }
            all.extend(frames.iter().cloned());
        }
        all.sort_by(|a, b| a.key.cmp(&b.key));

        let keys: Vec<String> = all.iter().map(|f| f.key.clone()).collect();
        let test_indices = keys
            .iter()
            .enumerate()
            .filter(|(_, key)| held_out_keys.contains(*key))
            .map(|(i, _)| i)
            .collect();
        let lists = split_filename_list(
            &keys,
            &SplitConfig {
                test_indices,
                ..config.clone()
            },
        );
        info!(
            "Split feature '{}': train={} val={} test={}",
            self.name,
            lists.train.len(),
            lists.val.len(),
            lists.test.len()
        );
        Ok(FeatureSplit {
            spec: self.clone(),
            frames: all,
            lists,
        })
    }
}

/// Name of the set a feature directory belongs to (its parent directory).
fn set_name(directory: &Path) -> Option<String> {
    directory
        .parent()
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().into_owned())
}

/// A feature with its frames partitioned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSplit {
    pub spec: FeatureSpec,
    pub frames: Vec<FrameRef>,
    pub lists: SplitLists,
}

impl FeatureSplit {
    /// Resolves the frames of one split, ready for dataset construction.
    pub fn frames_for(&self, split: SplitKind, onload: OnloadTransform) -> FeatureFrames {
        let keys: HashSet<&String> = self.lists.get(split).iter().collect();
        FeatureFrames {
            name: self.spec.name.clone(),
            channels: self.spec.channels,
            init: self.spec.init.clone(),
            onload,
            frames: self
                .frames
                .iter()
                .filter(|f| keys.contains(&f.key))
                .cloned()
                .collect(),
        }
    }

    /// Every frame regardless of split, for unsplit datasets.
    pub fn all_frames(&self, onload: OnloadTransform) -> FeatureFrames {
        FeatureFrames {
            name: self.spec.name.clone(),
            channels: self.spec.channels,
            init: self.spec.init.clone(),
            onload,
            frames: self.frames.clone(),
        }
    }
}

/// Frames of one feature in one split.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureFrames {
    pub name: String,
    pub channels: usize,
    pub init: TransformDescriptor,
    pub onload: OnloadTransform,
    pub frames: Vec<FrameRef>,
}

impl FeatureFrames {
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.frames.iter().map(|f| f.key.as_str())
    }
}

/// Checks that all features list the same frames in the same order.
pub fn check_filename_correspondence(features: &[FeatureFrames]) -> Result<()> {
    let Some(reference) = features.first() else {
        return Err(DataError::NoFeatures);
    };
    for feature in &features[1..] {
        if feature.frames.len() != reference.frames.len() {
            return Err(DataError::FilenameMismatch {
                reference: reference.name.clone(),
                feature: feature.name.clone(),
                reason: format!(
                    "{} frames vs {} frames",
                    reference.frames.len(),
                    feature.frames.len()
                ),
            });
        }
        if let Some((a, b)) = reference
            .keys()
            .zip(feature.keys())
            .find(|(a, b)| a != b)
        {
            return Err(DataError::FilenameMismatch {
                reference: reference.name.clone(),
                feature: feature.name.clone(),
                reason: format!("'{a}' vs '{b}'"),
            });
        }
    }
    Ok(())
}

/// Fixed directory naming of a rendered dataset:
///
/// ```text
/// {root}{set}/groundtruth/
/// {root}{set}/input_{level}_{lod}/          i_0, i_l1..i_l3
/// {root}{set}/depth_{level}_{lod}/          d_0, d_l1..d_l3
/// {root}{set}/nearest{k}_groundtruth_0/     i_k
/// {root}{set}/nearest{k}_depth_0_{lod}/     d_k
/// {root}{set}/nearest{k}_motion_0_{lod}/    m_k
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetLayout {
    pub root: PathBuf,
    pub sets: Vec<String>,
    pub lod: String,
}

impl DatasetLayout {
    pub fn new(root: impl Into<PathBuf>, sets: Vec<String>, lod: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            sets,
            lod: lod.into(),
        }
    }

    fn dirs(&self, leaf: &str) -> Vec<PathBuf> {
        self.sets
            .iter()
            .map(|set| self.root.join(set).join(leaf))
            .collect()
    }

    pub fn groundtruth(&self) -> Vec<PathBuf> {
        self.dirs("groundtruth")
    }

    /// Point-rendered color at pyramid `level` (0 = full resolution).
    pub fn input(&self, level: usize) -> Vec<PathBuf> {
        self.dirs(&format!("input_{}_{}", level, self.lod))
    }

    pub fn depth(&self, level: usize) -> Vec<PathBuf> {
        self.dirs(&format!("depth_{}_{}", level, self.lod))
    }

    /// Ground truth of the `k`-th nearest historical frame (k >= 1).
    pub fn nearest_groundtruth(&self, k: usize) -> Vec<PathBuf> {
        self.dirs(&format!("nearest{}_groundtruth_0", k))
    }

    pub fn nearest_depth(&self, k: usize) -> Vec<PathBuf> {
        self.dirs(&format!("nearest{}_depth_0_{}", k, self.lod))
    }

    pub fn nearest_motion(&self, k: usize) -> Vec<PathBuf> {
        self.dirs(&format!("nearest{}_motion_0_{}", k, self.lod))
    }
}
