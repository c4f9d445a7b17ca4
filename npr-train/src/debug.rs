//! Debug PNG output
//!
//! Tensors are written with values clamped to `[0, 1]`. One-channel planes
//! become gray, two-channel planes get a constant blue channel and the fourth
//! channel of RGBA-like planes is shown as a separate gray tile.

use crate::error::{Result, TrainError};
use crate::network::InovisTrace;
use burn::tensor::Tensor;
use burn::tensor::backend::Backend;
use image::{Rgb, RgbImage};
use npr_data::{Batch, FeatureBatch};
use std::path::Path;

/// One `[C, H, W]` sample copied to the host.
#[derive(Debug, Clone, PartialEq)]
pub struct HostImage {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
    pub data: Vec<f32>,
}

impl HostImage {
    /// Sample `index` of a `[B, C, H, W]` tensor.
    pub fn from_tensor<B: Backend>(tensor: Tensor<B, 4>, index: usize) -> Result<Self> {
        let [_, channels, height, width] = tensor.dims();
        let data = tensor
            .narrow(0, index, 1)
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| TrainError::TensorData(format!("{e:?}")))?;
        Ok(Self {
            channels,
            height,
            width,
            data,
        })
    }

    /// Sample `index` of a collated batch feature.
    pub fn from_feature(feature: &FeatureBatch, index: usize) -> Self {
        let [_, channels, height, width] = feature.shape;
        let len = channels * height * width;
        Self {
            channels,
            height,
            width,
            data: feature.data[index * len..(index + 1) * len].to_vec(),
        }
    }

    fn plane(&self, c: usize) -> &[f32] {
        let len = self.height * self.width;
        &self.data[c * len..(c + 1) * len]
    }

    fn tile(&self, planes: [Option<&[f32]>; 3], fill: f32) -> RgbImage {
        let to_u8 = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
        RgbImage::from_fn(self.width as u32, self.height as u32, |x, y| {
            let i = y as usize * self.width + x as usize;
            Rgb(planes.map(|p| to_u8(p.map_or(fill, |p| p[i]))))
        })
    }

    /// Color tiles of this sample, left to right.
    pub fn tiles(&self) -> Vec<RgbImage> {
        match self.channels {
            0 => Vec::new(),
            1 => {
                let p = Some(self.plane(0));
                vec![self.tile([p, p, p], 0.0)]
            }
            2 => vec![self.tile([Some(self.plane(0)), Some(self.plane(1)), None], 1.0)],
            3 => vec![self.rgb()],
            _ => {
                let alpha = Some(self.plane(3));
                vec![self.rgb(), self.tile([alpha, alpha, alpha], 0.0)]
            }
        }
    }

    fn rgb(&self) -> RgbImage {
        self.tile([Some(self.plane(0)), Some(self.plane(1)), Some(self.plane(2))], 0.0)
    }
}

/// Concatenates tiles horizontally, padding shorter tiles with black at the bottom.
pub fn side_by_side(tiles: &[RgbImage]) -> RgbImage {
    let width = tiles.iter().map(|t| t.width()).sum();
    let height = tiles.iter().map(|t| t.height()).max().unwrap_or(0);
    let mut sheet = RgbImage::new(width, height);
    let mut offset = 0;
    for tile in tiles {
        for (x, y, pixel) in tile.enumerate_pixels() {
            sheet.put_pixel(offset + x, y, *pixel);
        }
        offset += tile.width();
    }
    sheet
}

pub fn write_png(image: &RgbImage, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| TrainError::io(parent, e))?;
    }
    image.save(path)?;
    Ok(())
}

/// Writes one sheet per sample holding every batch feature followed by the
/// rendered image. Returns the number of sheets written, at most `limit`.
pub fn write_batch_sheets<B: Backend>(
    batch: &Batch,
    rendered: Tensor<B, 4>,
    dir: &Path,
    suffix: &str,
    limit: usize,
) -> Result<usize> {
    let count = batch.len().min(limit);
    for sample in 0..count {
        let mut tiles: Vec<RgbImage> = batch
            .features
            .values()
            .flat_map(|feature| HostImage::from_feature(feature, sample).tiles())
            .collect();
        tiles.extend(HostImage::from_tensor(rendered.clone(), sample)?.tiles());
        let name = format!("{}{suffix}", batch.names[sample].replace('/', "_"));
        write_png(&side_by_side(&tiles), &dir.join(name))?;
    }
    Ok(count)
}

/// Rendered and ground truth of the first sample next to each other.
pub fn write_result<B: Backend>(rendered: Tensor<B, 4>, groundtruth: Tensor<B, 4>, path: &Path) -> Result<()> {
    let mut tiles = HostImage::from_tensor(rendered, 0)?.tiles();
    tiles.truncate(1);
    tiles.extend(HostImage::from_tensor(groundtruth, 0)?.tiles().into_iter().take(1));
    write_png(&side_by_side(&tiles), path)
}

/// Warped auxiliary frames, their weights and the reweighted block of the first sample.
pub fn write_trace<B: Backend>(trace: &InovisTrace<B>, dir: &Path, suffix: &str) -> Result<()> {
    let first_tile = |tensor: Tensor<B, 4>| -> Result<Option<RgbImage>> {
        let [_, channels, _, _] = tensor.dims();
        let tensor = tensor.narrow(1, 0, channels.min(3));
        Ok(HostImage::from_tensor(tensor, 0)?.tiles().into_iter().next())
    };
    for (k, warped) in trace.warped.iter().enumerate() {
        if let Some(tile) = first_tile(warped.clone())? {
            write_png(&tile, &dir.join(format!("warped_{}{suffix}", k + 1)))?;
        }
    }
    if let Some(weights) = &trace.weights {
        let [_, frames, _, _] = weights.dims();
        for k in 0..frames {
            // weights lie in [0, 10]
            if let Some(tile) = first_tile(weights.clone().narrow(1, k, 1).div_scalar(10.0))? {
                write_png(&tile, &dir.join(format!("weight_{}{suffix}", k + 1)))?;
            }
        }
    }
    if let Some(tile) = first_tile(trace.reweighted.clone())? {
        write_png(&tile, &dir.join(format!("reweighted{suffix}")))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use std::collections::BTreeMap;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_channel_counts_map_to_tiles() {
        let image = |channels| HostImage {
            channels,
            height: 2,
            width: 3,
            data: vec![0.5; channels * 6],
        };
        assert_eq!(image(1).tiles().len(), 1);
        assert_eq!(image(2).tiles()[0].get_pixel(0, 0), &Rgb([128, 128, 255]));
        assert_eq!(image(3).tiles().len(), 1);
        assert_eq!(image(4).tiles().len(), 2);
    }

    #[test]
    fn test_values_are_clamped() {
        let image = HostImage {
            channels: 1,
            height: 1,
            width: 2,
            data: vec![-1.0, 3.0],
        };
        let tile = &image.tiles()[0];
        assert_eq!(tile.get_pixel(0, 0), &Rgb([0, 0, 0]));
        assert_eq!(tile.get_pixel(1, 0), &Rgb([255, 255, 255]));
    }

    #[test]
    fn test_side_by_side_pads_height() {
        let sheet = side_by_side(&[RgbImage::new(2, 4), RgbImage::new(3, 2)]);
        assert_eq!(sheet.dimensions(), (5, 4));
    }

    #[test]
    fn test_batch_sheets_respect_limit() {
        let dir = tempfile::tempdir().unwrap();
        let batch = Batch {
            indices: vec![0, 1, 2],
            names: vec!["s/a".into(), "s/b".into(), "s/c".into()],
            features: BTreeMap::from([(
                "groundtruth".to_string(),
                FeatureBatch {
                    shape: [3, 3, 4, 4],
                    data: vec![0.25; 3 * 3 * 16],
                },
            )]),
        };
        let rendered = Tensor::<TestBackend, 4>::ones([3, 3, 4, 4], &Default::default());
        let written = write_batch_sheets(&batch, rendered, dir.path(), "_000_0.png", 2).unwrap();
        assert_eq!(written, 2);
        let sheet = image::open(dir.path().join("s_a_000_0.png")).unwrap();
        assert_eq!((sheet.width(), sheet.height()), (8, 4));
        assert!(!dir.path().join("s_c_000_0.png").exists());
    }
}
