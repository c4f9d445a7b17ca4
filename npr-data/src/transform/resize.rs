//! Resampling and cropping of `[H, W, C]` arrays.
//!
//! Values are never clamped, so signed data such as motion vectors survives
//! resampling.

use crate::error::Result;
use crate::types::ImageArray;
use serde::{Deserialize, Serialize};

/// Sampling used when an array changes size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interpolation {
    /// Nearest neighbor; keeps discrete data (depth, ids) intact
    Nearest,
    #[default]
    Bilinear,
}

/// Resamples to `height x width` using pixel-center alignment.
pub fn resize(
    array: &ImageArray,
    height: usize,
    width: usize,
    interpolation: Interpolation,
) -> Result<ImageArray> {
    if array.height() == height && array.width() == width {
        return Ok(array.clone());
    }
    let channels = array.channels();
    let scale_y = array.height() as f32 / height as f32;
    let scale_x = array.width() as f32 / width as f32;
    let max_y = array.height().saturating_sub(1);
    let max_x = array.width().saturating_sub(1);
    let mut data = Vec::with_capacity(height * width * channels);

    for y in 0..height {
        let sy = ((y as f32 + 0.5) * scale_y - 0.5).max(0.0);
        for x in 0..width {
            let sx = ((x as f32 + 0.5) * scale_x - 0.5).max(0.0);
            match interpolation {
                Interpolation::Nearest => {
                    let ny = ((y as f32 + 0.5) * scale_y) as usize;
                    let nx = ((x as f32 + 0.5) * scale_x) as usize;
                    for c in 0..channels {
                        data.push(array.get(ny.min(max_y), nx.min(max_x), c));
                    }
                }
                Interpolation::Bilinear => {
                    let y0 = (sy.floor() as usize).min(max_y);
                    let x0 = (sx.floor() as usize).min(max_x);
                    let y1 = (y0 + 1).min(max_y);
                    let x1 = (x0 + 1).min(max_x);
                    let wy = sy - y0 as f32;
                    let wx = sx - x0 as f32;
                    for c in 0..channels {
                        let top = array.get(y0, x0, c) * (1.0 - wx) + array.get(y0, x1, c) * wx;
                        let bottom = array.get(y1, x0, c) * (1.0 - wx) + array.get(y1, x1, c) * wx;
                        data.push(top * (1.0 - wy) + bottom * wy);
                    }
                }
            }
        }
    }
    ImageArray::new(height, width, channels, data)
}

/// Scales so the shorter side equals `target_shorter`, keeping the aspect ratio.
pub fn fit_shorter_side(
    array: &ImageArray,
    target_shorter: usize,
    interpolation: Interpolation,
) -> Result<ImageArray> {
    let (h, w) = (array.height(), array.width());
    let (new_h, new_w) = if h <= w {
        let scaled = (w as f64 * target_shorter as f64 / h as f64).round() as usize;
        (target_shorter, scaled.max(1))
    } else {
        let scaled = (h as f64 * target_shorter as f64 / w as f64).round() as usize;
        (scaled.max(1), target_shorter)
    };
    resize(array, new_h, new_w, interpolation)
}

/// Crops the centered `height x width` window. Dimensions already smaller
/// than the target are left untouched.
pub fn center_crop(array: &ImageArray, height: usize, width: usize) -> Result<ImageArray> {
    let crop_h = height.min(array.height());
    let crop_w = width.min(array.width());
    let top = (array.height() - crop_h) / 2;
    let left = (array.width() - crop_w) / 2;
    array.crop(top, left, crop_h, crop_w)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checker(height: usize, width: usize) -> ImageArray {
        let data = (0..height * width)
            .map(|p| ((p / width + p % width) % 2) as f32)
            .collect();
        ImageArray::new(height, width, 1, data).unwrap()
    }

    #[test]
    fn test_resize_identity_and_nearest_upscale() {
        let array = checker(2, 2);
        assert_eq!(resize(&array, 2, 2, Interpolation::Bilinear).unwrap(), array);

        let up = resize(&array, 4, 4, Interpolation::Nearest).unwrap();
        assert_eq!(up.get(0, 0, 0), array.get(0, 0, 0));
        assert_eq!(up.get(1, 1, 0), array.get(0, 0, 0));
        assert_eq!(up.get(0, 2, 0), array.get(0, 1, 0));
        assert_eq!(up.get(3, 3, 0), array.get(1, 1, 0));
    }

    #[test]
    fn test_bilinear_keeps_negative_values() {
        let array = ImageArray::new(1, 2, 1, vec![-4.0, -2.0]).unwrap();
        let up = resize(&array, 1, 4, Interpolation::Bilinear).unwrap();
        assert_eq!(up.get(0, 0, 0), -4.0);
        assert_eq!(up.get(0, 3, 0), -2.0);
        assert!(up.get(0, 1, 0) < -3.0 && up.get(0, 1, 0) > -4.0);
    }

    #[test]
    fn test_fit_shorter_side_keeps_aspect() {
        let array = ImageArray::zeros(100, 200, 3);
        let fitted = fit_shorter_side(&array, 50, Interpolation::Bilinear).unwrap();
        assert_eq!(fitted.shape(), [50, 100, 3]);

        let tall = ImageArray::zeros(30, 10, 1);
        let fitted = fit_shorter_side(&tall, 20, Interpolation::Nearest).unwrap();
        assert_eq!(fitted.shape(), [60, 20, 1]);
    }

    #[test]
    fn test_center_crop_is_centered() {
        let data = (0..16).map(|v| v as f32).collect();
        let array = ImageArray::new(4, 4, 1, data).unwrap();
        let crop = center_crop(&array, 2, 2).unwrap();
        assert_eq!(crop.data(), &[5.0, 6.0, 9.0, 10.0]);

        let untouched = center_crop(&array, 8, 2).unwrap();
        assert_eq!(untouched.shape(), [4, 2, 1]);
    }
}
