//! Raster image decoding with per-format value normalization

use crate::decode::blob::read_blob;
use crate::error::{DataError, Result};
use crate::types::ImageArray;
use image::{DynamicImage, ImageReader};
use std::path::Path;
use tracing::warn;

/// Reads one frame asset as an `[H, W, C]` float array.
///
/// - `.tif`/`.tiff`: normalized by bit depth, first three channels
/// - `.png`/`.jpg`/`.jpeg`: normalized by bit depth, first `channels` channels
/// - `.bin`: raw blob (see [`read_blob`]), first `channels` channels
///
/// Anything else is decoded by content sniffing without range normalization.
#[tracing::instrument(skip_all, fields(path = %path.display()))]
pub fn read_image(path: &Path, channels: usize) -> Result<ImageArray> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "tif" | "tiff" => Ok(to_array(open(path)?, true, path)?.take_channels(3)),
        "png" | "jpg" | "jpeg" => Ok(to_array(open(path)?, true, path)?.take_channels(channels)),
        "bin" => Ok(read_blob(path)?.take_channels(channels)),
        other => {
            warn!(
                "Unsupported extension '{}' for {}, decoding without range normalization",
                other,
                path.display()
            );
            let image = ImageReader::open(path)
                .map_err(|e| DataError::io(path, e))?
                .with_guessed_format()
                .map_err(|e| DataError::io(path, e))?
                .decode()
                .map_err(|source| DataError::Image {
                    path: path.to_path_buf(),
                    source,
                })?;
            to_array(image, false, path)
        }
    }
}

fn open(path: &Path) -> Result<DynamicImage> {
    image::open(path).map_err(|source| DataError::Image {
        path: path.to_path_buf(),
        source,
    })
}

fn to_array(image: DynamicImage, normalize: bool, path: &Path) -> Result<ImageArray> {
    let (width, height) = (image.width() as usize, image.height() as usize);
    let channels = image.color().channel_count() as usize;
    let scale8 = if normalize { 1.0 / u8::MAX as f32 } else { 1.0 };
    let scale16 = if normalize { 1.0 / u16::MAX as f32 } else { 1.0 };

    let data: Vec<f32> = match image {
        DynamicImage::ImageLuma8(buf) => buf.into_raw().into_iter().map(|v| v as f32 * scale8).collect(),
        DynamicImage::ImageLumaA8(buf) => buf.into_raw().into_iter().map(|v| v as f32 * scale8).collect(),
        DynamicImage::ImageRgb8(buf) => buf.into_raw().into_iter().map(|v| v as f32 * scale8).collect(),
        DynamicImage::ImageRgba8(buf) => buf.into_raw().into_iter().map(|v| v as f32 * scale8).collect(),
        DynamicImage::ImageLuma16(buf) => buf.into_raw().into_iter().map(|v| v as f32 * scale16).collect(),
        DynamicImage::ImageLumaA16(buf) => buf.into_raw().into_iter().map(|v| v as f32 * scale16).collect(),
        DynamicImage::ImageRgb16(buf) => buf.into_raw().into_iter().map(|v| v as f32 * scale16).collect(),
        DynamicImage::ImageRgba16(buf) => buf.into_raw().into_iter().map(|v| v as f32 * scale16).collect(),
        DynamicImage::ImageRgb32F(buf) => buf.into_raw(),
        DynamicImage::ImageRgba32F(buf) => buf.into_raw(),
        other => {
            warn!("Unusual pixel layout in {}, converting to RGBA", path.display());
            return ImageArray::new(height, width, 4, other.to_rgba32f().into_raw());
        }
    };
    ImageArray::new(height, width, channels, data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb, RgbImage, Rgba, RgbaImage};

    #[test]
    fn test_read_png_normalizes_and_limits_channels() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.png");
        let mut img = RgbaImage::new(3, 2);
        img.put_pixel(1, 0, Rgba([255, 51, 0, 128]));
        img.save(&path).unwrap();

        let array = read_image(&path, 3).unwrap();
        assert_eq!(array.shape(), [2, 3, 3]);
        assert!((array.get(0, 1, 0) - 1.0).abs() < 1e-6);
        assert!((array.get(0, 1, 1) - 0.2).abs() < 1e-6);

        let with_alpha = read_image(&path, 4).unwrap();
        assert_eq!(with_alpha.channels(), 4);
    }

    #[test]
    fn test_read_16bit_tiff_divides_by_u16_max() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.tif");
        let mut img: ImageBuffer<Rgb<u16>, Vec<u16>> = ImageBuffer::new(2, 2);
        img.put_pixel(0, 1, Rgb([65535, 32768, 0]));
        img.save(&path).unwrap();

        let array = read_image(&path, 4).unwrap();
        assert_eq!(array.shape(), [2, 2, 3]);
        assert!((array.get(1, 0, 0) - 1.0).abs() < 1e-6);
        assert!((array.get(1, 0, 1) - 32768.0 / 65535.0).abs() < 1e-6);
    }

    #[test]
    fn test_unknown_extension_falls_back_without_normalization() {
        let dir = tempfile::tempdir().unwrap();
        let png = dir.path().join("frame.png");
        let mut img = RgbImage::new(1, 1);
        img.put_pixel(0, 0, Rgb([200, 10, 0]));
        img.save(&png).unwrap();
        let odd = dir.path().join("frame.raw");
        std::fs::copy(&png, &odd).unwrap();

        let array = read_image(&odd, 3).unwrap();
        assert_eq!(array.get(0, 0, 0), 200.0);
        assert_eq!(array.get(0, 0, 1), 10.0);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_image(&dir.path().join("missing.png"), 3).is_err());
    }
}
