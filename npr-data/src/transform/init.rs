//! Init transforms, applied once per frame while the cache is built.
//!
//! A transform is described by data rather than code: its canonical JSON form
//! (tagged with [`TRANSFORM_DESCRIPTOR_VERSION`]) feeds the cache key, so
//! changing a parameter, or the meaning of a variant, forces a rebuild.

use crate::error::Result;
use crate::transform::resize::{Interpolation, center_crop, fit_shorter_side};
use crate::types::ImageArray;
use serde::{Deserialize, Serialize};

/// Bump whenever the behavior of an existing variant changes.
pub const TRANSFORM_DESCRIPTOR_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransformDescriptor {
    /// Stores frames as decoded.
    Identity,
    /// Center crop to `width x height`, optionally keeping only the leading channels.
    CenterCrop {
        width: usize,
        height: usize,
        channels: Option<usize>,
    },
    /// Scale the shorter side to the shorter target side, then center crop.
    /// With `only_upscale`, frames that are already large enough are only cropped.
    ResizeThenCrop {
        width: usize,
        height: usize,
        channels: Option<usize>,
        interpolation: Interpolation,
        only_upscale: bool,
    },
}

#[derive(Serialize)]
struct Versioned<'a> {
    version: u32,
    transform: &'a TransformDescriptor,
}

impl TransformDescriptor {
    /// Crop used for ground truth frames.
    pub fn groundtruth(width: usize, height: usize) -> Self {
        TransformDescriptor::CenterCrop {
            width,
            height,
            channels: Some(3),
        }
    }

    /// Upscale-if-needed then crop, used for point-rendered color and depth.
    pub fn rendered(width: usize, height: usize) -> Self {
        TransformDescriptor::ResizeThenCrop {
            width,
            height,
            channels: Some(3),
            interpolation: Interpolation::Bilinear,
            only_upscale: true,
        }
    }

    /// Nearest resize then crop, for data that must not be blended.
    pub fn data(width: usize, height: usize) -> Self {
        TransformDescriptor::ResizeThenCrop {
            width,
            height,
            channels: None,
            interpolation: Interpolation::Nearest,
            only_upscale: false,
        }
    }

    pub fn apply(&self, array: ImageArray) -> Result<ImageArray> {
        match self {
            TransformDescriptor::Identity => Ok(array),
            TransformDescriptor::CenterCrop {
                width,
                height,
                channels,
            } => {
                let cropped = center_crop(&array, *height, *width)?;
                Ok(keep_channels(cropped, *channels))
            }
            TransformDescriptor::ResizeThenCrop {
                width,
                height,
                channels,
                interpolation,
                only_upscale,
            } => {
                let target_shorter = (*width).min(*height);
                let shorter = array.height().min(array.width());
                let resized = if !only_upscale || shorter < target_shorter {
                    fit_shorter_side(&array, target_shorter, *interpolation)?
                } else {
                    array
                };
                let cropped = center_crop(&resized, *height, *width)?;
                Ok(keep_channels(cropped, *channels))
            }
        }
    }

    /// Stable textual form used for cache keys.
    pub fn canonical(&self) -> Result<String> {
        Ok(serde_json::to_string(&Versioned {
            version: TRANSFORM_DESCRIPTOR_VERSION,
            transform: self,
        })?)
    }
}

fn keep_channels(array: ImageArray, channels: Option<usize>) -> ImageArray {
    match channels {
        Some(count) => array.take_channels(count),
        None => array,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_groundtruth_crops_and_drops_alpha() {
        let array = ImageArray::zeros(600, 700, 4);
        let out = TransformDescriptor::groundtruth(512, 256).apply(array).unwrap();
        assert_eq!(out.shape(), [256, 512, 3]);
    }

    #[test]
    fn test_rendered_upscales_small_frames() {
        let small = ImageArray::zeros(200, 300, 4);
        let out = TransformDescriptor::rendered(256, 256).apply(small).unwrap();
        assert_eq!(out.shape(), [256, 256, 3]);

        let large = ImageArray::new(2, 4, 1, vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]).unwrap();
        let out = TransformDescriptor::rendered(2, 2).apply(large).unwrap();
        assert_eq!(out.data(), &[1.0, 2.0, 5.0, 6.0]);
    }

    #[test]
    fn test_data_transform_keeps_all_channels() {
        let array = ImageArray::zeros(64, 64, 5);
        let out = TransformDescriptor::data(32, 32).apply(array).unwrap();
        assert_eq!(out.shape(), [32, 32, 5]);
    }

    #[test]
    fn test_canonical_form_tracks_parameters() {
        let a = TransformDescriptor::rendered(256, 256).canonical().unwrap();
        let b = TransformDescriptor::rendered(256, 256).canonical().unwrap();
        let c = TransformDescriptor::rendered(128, 128).canonical().unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.contains("\"version\":1"));
        assert_ne!(
            TransformDescriptor::Identity.canonical().unwrap(),
            TransformDescriptor::data(256, 256).canonical().unwrap()
        );
    }
}
