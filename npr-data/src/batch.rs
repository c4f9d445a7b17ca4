//! Mini-batch assembly
//!
//! Samples of one batch are loaded in parallel with rayon and stacked into
//! planar `[B, C, H, W]` host buffers. Tensor conversion happens in the
//! training crate.

use crate::dataset::{NprDataset, Sample};
use crate::error::{DataError, Result};
use rand::SeedableRng;
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Stacked samples of one feature.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureBatch {
    /// `[batch, channels, height, width]`
    pub shape: [usize; 4],
    pub data: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub indices: Vec<usize>,
    pub names: Vec<String>,
    pub features: BTreeMap<String, FeatureBatch>,
}

impl Batch {
    /// Stacks samples. Every sample must carry the same features with the same shapes.
    pub fn collate(samples: Vec<Sample>) -> Result<Self> {
        let batch_size = samples.len();
        let mut indices = Vec::with_capacity(batch_size);
        let mut names = Vec::with_capacity(batch_size);
        let mut features: BTreeMap<String, FeatureBatch> = BTreeMap::new();

        for sample in samples {
            for (name, array) in sample.features {
                let [c, h, w] = array.shape();
                let entry = features.entry(name.clone()).or_insert_with(|| FeatureBatch {
                    shape: [0, c, h, w],
                    data: Vec::with_capacity(batch_size * c * h * w),
                });
                if entry.shape[1..] != [c, h, w] {
                    return Err(DataError::ArrayShape(format!(
                        "feature '{}' of sample {} is {}x{}x{}, batch holds {}x{}x{}",
                        name, sample.index, c, h, w, entry.shape[1], entry.shape[2], entry.shape[3]
                    )));
                }
                entry.shape[0] += 1;
                entry.data.extend_from_slice(array.data());
            }
            indices.push(sample.index);
            names.push(sample.name);
        }

        if let Some((name, _)) = features.iter().find(|(_, f)| f.shape[0] != batch_size) {
            return Err(DataError::ArrayShape(format!(
                "feature '{}' is missing from some samples",
                name
            )));
        }
        Ok(Self {
            indices,
            names,
            features,
        })
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn feature(&self, name: &str) -> Option<&FeatureBatch> {
        self.features.get(name)
    }
}

/// Batched, optionally shuffled access to a dataset.
#[derive(Debug, Clone)]
pub struct DataLoader {
    dataset: Arc<NprDataset>,
    batch_size: usize,
    shuffle: bool,
    seed: u64,
}

impl DataLoader {
    pub fn new(dataset: NprDataset, batch_size: usize, shuffle: bool) -> Self {
        Self {
            dataset: Arc::new(dataset),
            batch_size: batch_size.max(1),
            shuffle,
            seed: 0,
        }
    }

    /// Base seed of the per-epoch shuffle order.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn dataset(&self) -> &NprDataset {
        &self.dataset
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Number of batches per epoch; the last one may be short.
    pub fn len(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    pub fn is_empty(&self) -> bool {
        self.dataset.is_empty()
    }

    /// Iterates one epoch. Shuffled loaders draw a new order per epoch.
    pub fn iter(&self, epoch: usize) -> BatchIter {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if self.shuffle {
            let mut rng = ChaCha8Rng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
            order.shuffle(&mut rng);
        }
        BatchIter {
            dataset: Arc::clone(&self.dataset),
            order,
            cursor: 0,
            batch_size: self.batch_size,
        }
    }
}

pub struct BatchIter {
    dataset: Arc<NprDataset>,
    order: Vec<usize>,
    cursor: usize,
    batch_size: usize,
}

impl Iterator for BatchIter {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.order.len() {
            return None;
        }
        let end = (self.cursor + self.batch_size).min(self.order.len());
        let indices = &self.order[self.cursor..end];
        self.cursor = end;

        let samples: Result<Vec<Sample>> = indices
            .par_iter()
            .map(|&i| self.dataset.get(i))
            .collect();
        Some(samples.and_then(Batch::collate))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.order.len() - self.cursor).div_ceil(self.batch_size);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for BatchIter {}
