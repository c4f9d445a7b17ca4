//! Onload transforms, applied to every cache row on access.
//!
//! Random crops draw their position from the RNG handed in by the dataset.
//! The dataset reseeds that RNG with the same per-sample seed before each
//! feature, so every feature of one sample is cropped at the same relative
//! position.

use crate::error::Result;
use crate::split::SplitKind;
use crate::transform::resize::{Interpolation, center_crop, fit_shorter_side};
use crate::types::{ChwArray, ImageArray};
use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OnloadTransform {
    /// Deterministic centered crop (val/test).
    CenterCrop { width: usize, height: usize },
    /// Uniformly positioned crop (train). Offsets are multiples of
    /// `alignment` pixels, so pyramid levels cropped with alignments
    /// `2^(coarsest - level)` land on the same full-resolution position.
    RandomCrop {
        width: usize,
        height: usize,
        #[serde(default = "unit_alignment")]
        alignment: usize,
    },
    /// Layout conversion only.
    PassThrough,
}

impl OnloadTransform {
    /// Produces planar output. Sources smaller than the crop are scaled up first.
    pub fn apply<R: Rng + ?Sized>(&self, array: &ImageArray, rng: &mut R) -> Result<ChwArray> {
        let cropped = match *self {
            OnloadTransform::PassThrough => return Ok(array.to_chw()),
            OnloadTransform::CenterCrop { width, height } => {
                let source = ensure_covers(array, width, height)?;
                center_crop(&source, height, width)?
            }
            OnloadTransform::RandomCrop {
                width,
                height,
                alignment,
            } => {
                let source = ensure_covers(array, width, height)?;
                let step = alignment.max(1);
                let fy: f64 = rng.random();
                let fx: f64 = rng.random();
                let top = uniform_offset((source.height() - height) / step, fy) * step;
                let left = uniform_offset((source.width() - width) / step, fx) * step;
                source.crop(top, left, height, width)?
            }
        };
        Ok(cropped.to_chw())
    }

    pub fn is_random(&self) -> bool {
        matches!(self, OnloadTransform::RandomCrop { .. })
    }
}

fn unit_alignment() -> usize {
    1
}

fn ensure_covers(array: &ImageArray, width: usize, height: usize) -> Result<ImageArray> {
    if array.height() >= height && array.width() >= width {
        return Ok(array.clone());
    }
    let scale = (height as f64 / array.height() as f64).max(width as f64 / array.width() as f64);
    let shorter = array.height().min(array.width());
    let target = (shorter as f64 * scale).ceil() as usize;
    fit_shorter_side(array, target, Interpolation::Bilinear)
}

/// Maps a fraction in `[0, 1)` onto the offsets `0..=range`.
fn uniform_offset(range: usize, fraction: f64) -> usize {
    (((range + 1) as f64 * fraction) as usize).min(range)
}

/// The onload transforms of one feature, per split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnloadTransforms {
    pub train: Option<OnloadTransform>,
    pub val: Option<OnloadTransform>,
    /// Falls back to `val` when unset.
    pub test: Option<OnloadTransform>,
}

impl OnloadTransforms {
    pub fn new(train: OnloadTransform, val: OnloadTransform) -> Self {
        Self {
            train: Some(train),
            val: Some(val),
            test: None,
        }
    }

    pub fn pass_through() -> Self {
        Self::new(OnloadTransform::PassThrough, OnloadTransform::PassThrough)
    }

    pub fn for_split(&self, split: SplitKind) -> Option<OnloadTransform> {
        match split {
            SplitKind::Train => self.train,
            SplitKind::Val => self.val,
            SplitKind::Test => self.test.or(self.val),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn marker(height: usize, width: usize, y: usize, x: usize) -> ImageArray {
        let mut data = vec![0.0; height * width];
        data[y * width + x] = 1.0;
        ImageArray::new(height, width, 1, data).unwrap()
    }

    fn marker_position(chw: &ChwArray) -> Option<(usize, usize)> {
        let [_, h, w] = chw.shape();
        (0..h)
            .flat_map(|y| (0..w).map(move |x| (y, x)))
            .find(|&(y, x)| chw.get(0, y, x) == 1.0)
    }

    #[test]
    fn test_center_crop_output_is_planar() {
        let array = ImageArray::zeros(10, 12, 3);
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let out = OnloadTransform::CenterCrop { width: 8, height: 6 }
            .apply(&array, &mut rng)
            .unwrap();
        assert_eq!(out.shape(), [3, 6, 8]);
    }

    #[test]
    fn test_random_crop_with_same_seed_is_congruent() {
        let a = marker(64, 64, 40, 20);
        let b = marker(64, 64, 40, 20);
        let crop = OnloadTransform::RandomCrop {
            width: 48,
            height: 48,
            alignment: 1,
        };
        for seed in 0..16 {
            let pa = crop.apply(&a, &mut ChaCha8Rng::seed_from_u64(seed)).unwrap();
            let pb = crop.apply(&b, &mut ChaCha8Rng::seed_from_u64(seed)).unwrap();
            assert_eq!(marker_position(&pa), marker_position(&pb));
        }
    }

    #[test]
    fn test_small_sources_are_scaled_before_cropping() {
        let array = ImageArray::zeros(20, 40, 2);
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let out = OnloadTransform::RandomCrop {
            width: 32,
            height: 32,
            alignment: 1,
        }
        .apply(&array, &mut rng)
            .unwrap();
        assert_eq!(out.shape(), [2, 32, 32]);
    }

    fn crop_origin(chw: &ChwArray) -> (usize, usize) {
        let value = chw.get(0, 0, 0) as usize;
        (value / 1000, value % 1000)
    }

    #[test]
    fn test_aligned_pyramid_crops_share_one_position() {
        // each pixel stores its own coordinates
        let ramp = |size: usize| {
            let data = (0..size * size).map(|i| ((i / size) * 1000 + i % size) as f32).collect();
            ImageArray::new(size, size, 1, data).unwrap()
        };
        let levels = [(ramp(64), 32, 4), (ramp(32), 16, 2), (ramp(16), 8, 1)];
        for seed in 0..32 {
            let origins: Vec<(usize, usize)> = levels
                .iter()
                .enumerate()
                .map(|(k, (array, crop, alignment))| {
                    let transform = OnloadTransform::RandomCrop {
                        width: *crop,
                        height: *crop,
                        alignment: *alignment,
                    };
                    let (y, x) = crop_origin(&transform.apply(array, &mut ChaCha8Rng::seed_from_u64(seed)).unwrap());
                    (y << k, x << k)
                })
                .collect();
            assert!(origins.windows(2).all(|w| w[0] == w[1]), "seed {seed}: {origins:?}");
        }
    }

    #[test]
    fn test_missing_alignment_defaults_to_one() {
        let transform: OnloadTransform =
            serde_json::from_str(r#"{"kind": "random_crop", "width": 8, "height": 4}"#).unwrap();
        assert_eq!(
            transform,
            OnloadTransform::RandomCrop {
                width: 8,
                height: 4,
                alignment: 1,
            }
        );
    }

    #[test]
    fn test_uniform_offset_covers_range() {
        assert_eq!(uniform_offset(0, 0.99), 0);
        assert_eq!(uniform_offset(10, 0.0), 0);
        assert_eq!(uniform_offset(10, 0.999), 10);
    }

    #[test]
    fn test_test_split_falls_back_to_val() {
        let val = OnloadTransform::CenterCrop { width: 4, height: 4 };
        let set = OnloadTransforms::new(OnloadTransform::PassThrough, val);
        assert_eq!(set.for_split(SplitKind::Test), Some(val));
    }
}
