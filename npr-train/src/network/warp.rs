//! Backward warping of feature tensors
//!
//! Both modes sample the source with nearest-neighbor lookup and zero padding.
//! Sample positions are computed on the host from the motion field (which
//! carries no gradient) and applied with a differentiable `gather`, so
//! gradients still flow into the warped features.
//!
//! - [`WarpMode::TextureCoordinates`]: the field stores, per destination
//!   pixel, the normalized `[-1, 1]` source coordinate with y pointing up.
//!   The source may have a different resolution than the field.
//! - [`WarpMode::PixelDisplacement`]: the field stores pixel offsets on the
//!   destination grid (y pointing up). A zero field is the identity.

use crate::error::{Result, TrainError};
use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor, TensorData};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarpMode {
    #[default]
    TextureCoordinates,
    PixelDisplacement,
}

impl WarpMode {
    /// Warps `feature` `[B, C, Hs, Ws]` with `movec` `[B, >=2, Ho, Wo]` into `[B, C, Ho, Wo]`.
    pub fn warp<B: Backend>(&self, feature: Tensor<B, 4>, movec: Tensor<B, 4>) -> Result<Tensor<B, 4>> {
        match self {
            WarpMode::TextureCoordinates => warp_texture_coordinates(feature, movec),
            WarpMode::PixelDisplacement => warp_pixel_displacement(feature, movec),
        }
    }
}

/// Texture-coordinate warp, sampled at pixel centers (`align_corners = false`).
pub fn warp_texture_coordinates<B: Backend>(feature: Tensor<B, 4>, movec: Tensor<B, 4>) -> Result<Tensor<B, 4>> {
    let [batch, _, src_h, src_w] = feature.dims();
    let (field, [out_h, out_w]) = motion_field(&movec, batch)?;
    let n = out_h * out_w;

    let mut sources = Vec::with_capacity(batch * n);
    for b in 0..batch {
        let base = b * 2 * n;
        for i in 0..n {
            let gx = field[base + i];
            let gy = -field[base + n + i];
            let ix = ((gx + 1.0) * src_w as f32 - 1.0) * 0.5;
            let iy = ((gy + 1.0) * src_h as f32 - 1.0) * 0.5;
            sources.push(nearest(iy, ix, src_h, src_w));
        }
    }
    gather_nearest(feature, &sources, [out_h, out_w])
}

/// Pixel-displacement warp on the destination grid (`align_corners = true`).
///
/// The source must have the same resolution as the field.
pub fn warp_pixel_displacement<B: Backend>(feature: Tensor<B, 4>, movec: Tensor<B, 4>) -> Result<Tensor<B, 4>> {
    let [batch, _, height, width] = feature.dims();
    let (field, [out_h, out_w]) = motion_field(&movec, batch)?;
    if [out_h, out_w] != [height, width] {
        return Err(TrainError::shape(
            "pixel-displacement warp source",
            format!("{out_h}x{out_w}"),
            format!("{height}x{width}"),
        ));
    }
    let n = height * width;

    let mut sources = Vec::with_capacity(batch * n);
    for b in 0..batch {
        let base = b * 2 * n;
        for y in 0..height {
            for x in 0..width {
                let i = y * width + x;
                let sx = x as f32 - field[base + i];
                let sy = y as f32 + field[base + n + i];
                sources.push(nearest(sy, sx, height, width));
            }
        }
    }
    gather_nearest(feature, &sources, [height, width])
}

/// Host copy of the first two motion channels and the field's spatial size.
fn motion_field<B: Backend>(movec: &Tensor<B, 4>, batch: usize) -> Result<(Vec<f32>, [usize; 2])> {
    let [mb, mc, h, w] = movec.dims();
    if mb != batch {
        return Err(TrainError::shape("motion field batch", batch, mb));
    }
    if mc < 2 {
        return Err(TrainError::shape("motion field channels", ">= 2", mc));
    }
    let field = movec
        .clone()
        .narrow(1, 0, 2)
        .into_data()
        .to_vec::<f32>()
        .map_err(|e| TrainError::TensorData(format!("{e:?}")))?;
    Ok((field, [h, w]))
}

fn nearest(y: f32, x: f32, height: usize, width: usize) -> Option<usize> {
    let y = y.round_ties_even();
    let x = x.round_ties_even();
    if y < 0.0 || x < 0.0 || y >= height as f32 || x >= width as f32 {
        return None;
    }
    Some(y as usize * width + x as usize)
}

/// `sources[b * Ho * Wo + i]` is the flat source index for destination pixel `i`.
fn gather_nearest<B: Backend>(
    feature: Tensor<B, 4>,
    sources: &[Option<usize>],
    [out_h, out_w]: [usize; 2],
) -> Result<Tensor<B, 4>> {
    let [batch, channels, src_h, src_w] = feature.dims();
    let n = out_h * out_w;
    let device = feature.device();

    let mut indices = Vec::with_capacity(batch * channels * n);
    let mut mask = Vec::with_capacity(batch * n);
    for b in 0..batch {
        let row = &sources[b * n..(b + 1) * n];
        for _ in 0..channels {
            indices.extend(row.iter().map(|s| s.unwrap_or(0) as i64));
        }
        mask.extend(row.iter().map(|s| if s.is_some() { 1.0f32 } else { 0.0 }));
    }

    let indices = Tensor::<B, 3, Int>::from_data(TensorData::new(indices, [batch, channels, n]), &device);
    let mask = Tensor::<B, 4>::from_data(TensorData::new(mask, [batch, 1, out_h, out_w]), &device);
    let flat = feature.reshape([batch, channels, src_h * src_w]);
    Ok(flat.gather(2, indices).reshape([batch, channels, out_h, out_w]) * mask)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    fn ramp(batch: usize, channels: usize, h: usize, w: usize) -> Tensor<TestBackend, 4> {
        let data: Vec<f32> = (0..batch * channels * h * w).map(|v| v as f32).collect();
        Tensor::from_data(TensorData::new(data, [batch, channels, h, w]), &Default::default())
    }

    /// Texture coordinates of the pixel centers of an `h x w` grid, y up.
    fn identity_coordinates(batch: usize, h: usize, w: usize) -> Tensor<TestBackend, 4> {
        let mut data = Vec::with_capacity(batch * 2 * h * w);
        for _ in 0..batch {
            for y in 0..h {
                for x in 0..w {
                    data.push((2 * x + 1) as f32 / w as f32 - 1.0);
                }
            }
            for y in 0..h {
                for _ in 0..w {
                    data.push(-((2 * y + 1) as f32 / h as f32 - 1.0));
                }
            }
        }
        Tensor::from_data(TensorData::new(data, [batch, 2, h, w]), &Default::default())
    }

    fn values(t: Tensor<TestBackend, 4>) -> Vec<f32> {
        t.into_data().to_vec::<f32>().unwrap()
    }

    #[test]
    fn test_zero_displacement_is_identity() {
        let feature = ramp(2, 3, 4, 5);
        let movec = Tensor::<TestBackend, 4>::zeros([2, 2, 4, 5], &Default::default());
        let warped = warp_pixel_displacement(feature.clone(), movec).unwrap();
        assert_eq!(values(warped), values(feature));
    }

    #[test]
    fn test_displacement_shifts_and_pads_with_zeros() {
        let feature = ramp(1, 1, 2, 3);
        let device = Default::default();
        // every pixel samples one to the left
        let data = vec![1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0];
        let movec = Tensor::<TestBackend, 4>::from_data(TensorData::new(data, [1, 2, 2, 3]), &device);
        let warped = values(warp_pixel_displacement(feature, movec).unwrap());
        assert_eq!(warped, vec![0.0, 0.0, 1.0, 0.0, 3.0, 4.0]);
    }

    #[test]
    fn test_identity_texture_coordinates_reproduce_source() {
        let feature = ramp(1, 2, 4, 6);
        let warped = warp_texture_coordinates(feature.clone(), identity_coordinates(1, 4, 6)).unwrap();
        assert_eq!(values(warped), values(feature));
    }

    #[test]
    fn test_texture_coordinates_sample_larger_source() {
        // 8x8 source, 4x4 destination: pixel centers map to every second source pixel
        let feature = ramp(1, 1, 8, 8);
        let warped = values(warp_texture_coordinates(feature, identity_coordinates(1, 4, 4)).unwrap());
        assert_eq!(warped.len(), 16);
        // center of destination pixel 0 is at source 0.5 -> rounds to 0
        assert_eq!(warped[0], 0.0);
        // destination (1, 1) -> source (2.5, 2.5) -> (2, 2)
        assert_eq!(warped[5], (2 * 8 + 2) as f32);
    }

    #[test]
    fn test_out_of_range_coordinates_are_zero() {
        let feature = ramp(1, 1, 2, 2).add_scalar(1.0);
        let movec = Tensor::<TestBackend, 4>::ones([1, 2, 2, 2], &Default::default()).mul_scalar(3.0);
        let warped = values(warp_texture_coordinates(feature, movec).unwrap());
        assert!(warped.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_single_channel_field_is_rejected() {
        let feature = ramp(1, 1, 2, 2);
        let movec = Tensor::<TestBackend, 4>::zeros([1, 1, 2, 2], &Default::default());
        assert!(matches!(
            WarpMode::TextureCoordinates.warp(feature, movec),
            Err(TrainError::ShapeMismatch { .. })
        ));
    }
}
