//! Host-side image arrays shared by the decoder, transforms and cache.

use crate::error::{DataError, Result};

/// Interleaved `[H, W, C]` float image.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageArray {
    height: usize,
    width: usize,
    channels: usize,
    data: Vec<f32>,
}

impl ImageArray {
    pub fn new(height: usize, width: usize, channels: usize, data: Vec<f32>) -> Result<Self> {
        if data.len() != height * width * channels {
            return Err(DataError::ArrayShape(format!(
                "{} values cannot form a {}x{}x{} array",
                data.len(),
                height,
                width,
                channels
            )));
        }
        Ok(Self {
            height,
            width,
            channels,
            data,
        })
    }

    pub fn zeros(height: usize, width: usize, channels: usize) -> Self {
        Self {
            height,
            width,
            channels,
            data: vec![0.0; height * width * channels],
        }
    }

    /// Builds an array from per-channel planes of `height * width` values each.
    pub fn from_planes(height: usize, width: usize, planes: &[Vec<f32>]) -> Result<Self> {
        let channels = planes.len();
        let mut data = vec![0.0; height * width * channels];
        for (c, plane) in planes.iter().enumerate() {
            if plane.len() != height * width {
                return Err(DataError::ArrayShape(format!(
                    "plane {} has {} values, expected {}",
                    c,
                    plane.len(),
                    height * width
                )));
            }
            for (p, value) in plane.iter().enumerate() {
                data[p * channels + c] = *value;
            }
        }
        Self::new(height, width, channels, data)
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn shape(&self) -> [usize; 3] {
        [self.height, self.width, self.channels]
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    pub fn get(&self, y: usize, x: usize, c: usize) -> f32 {
        self.data[(y * self.width + x) * self.channels + c]
    }

    /// Copies channel `c` out as a row-major plane.
    pub fn plane(&self, c: usize) -> Vec<f32> {
        self.data
            .iter()
            .skip(c)
            .step_by(self.channels)
            .copied()
            .collect()
    }

    /// Keeps the first `count` channels (or all of them, if there are fewer).
    pub fn take_channels(self, count: usize) -> Self {
        if count >= self.channels {
            return self;
        }
        let mut data = Vec::with_capacity(self.height * self.width * count);
        for pixel in self.data.chunks_exact(self.channels) {
            data.extend_from_slice(&pixel[..count]);
        }
        Self {
            height: self.height,
            width: self.width,
            channels: count,
            data,
        }
    }

    /// Copies the channel range `lo..hi` into a new array.
    pub fn channel_range(&self, lo: usize, hi: usize) -> Result<Self> {
        if lo >= hi || hi > self.channels {
            return Err(DataError::ArrayShape(format!(
                "channel range {}..{} outside of {} channels",
                lo, hi, self.channels
            )));
        }
        let mut data = Vec::with_capacity(self.height * self.width * (hi - lo));
        for pixel in self.data.chunks_exact(self.channels) {
            data.extend_from_slice(&pixel[lo..hi]);
        }
        Self::new(self.height, self.width, hi - lo, data)
    }

    /// Copies the `height x width` window whose top-left corner is `(top, left)`.
    pub fn crop(&self, top: usize, left: usize, height: usize, width: usize) -> Result<Self> {
        if top + height > self.height || left + width > self.width {
            return Err(DataError::ArrayShape(format!(
                "crop {}x{} at ({}, {}) does not fit a {}x{} array",
                height, width, top, left, self.height, self.width
            )));
        }
        let row_len = width * self.channels;
        let mut data = Vec::with_capacity(height * row_len);
        for y in top..top + height {
            let start = (y * self.width + left) * self.channels;
            data.extend_from_slice(&self.data[start..start + row_len]);
        }
        Self::new(height, width, self.channels, data)
    }

    /// Concatenates arrays of identical spatial size along the channel axis.
    pub fn concat_channels(arrays: &[ImageArray]) -> Result<Self> {
        let first = arrays
            .first()
            .ok_or_else(|| DataError::ArrayShape("nothing to concatenate".to_string()))?;
        let (height, width) = (first.height, first.width);
        if let Some(bad) = arrays
            .iter()
            .find(|a| a.height != height || a.width != width)
        {
            return Err(DataError::ArrayShape(format!(
                "cannot concatenate {}x{} with {}x{}",
                height, width, bad.height, bad.width
            )));
        }
        let channels: usize = arrays.iter().map(|a| a.channels).sum();
        let mut data = Vec::with_capacity(height * width * channels);
        for p in 0..height * width {
            for array in arrays {
                let start = p * array.channels;
                data.extend_from_slice(&array.data[start..start + array.channels]);
            }
        }
        Self::new(height, width, channels, data)
    }

    /// Converts to the planar layout used for network input.
    pub fn to_chw(&self) -> ChwArray {
        let mut data = Vec::with_capacity(self.data.len());
        for c in 0..self.channels {
            data.extend(self.data.iter().skip(c).step_by(self.channels));
        }
        ChwArray {
            channels: self.channels,
            height: self.height,
            width: self.width,
            data,
        }
    }
}

/// Planar `[C, H, W]` array, the layout handed to the network.
#[derive(Debug, Clone, PartialEq)]
pub struct ChwArray {
    channels: usize,
    height: usize,
    width: usize,
    data: Vec<f32>,
}

impl ChwArray {
    pub fn new(channels: usize, height: usize, width: usize, data: Vec<f32>) -> Result<Self> {
        if data.len() != channels * height * width {
            return Err(DataError::ArrayShape(format!(
                "{} values cannot form a {}x{}x{} planar array",
                data.len(),
                channels,
                height,
                width
            )));
        }
        Ok(Self {
            channels,
            height,
            width,
            data,
        })
    }

    pub fn shape(&self) -> [usize; 3] {
        [self.channels, self.height, self.width]
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    pub fn get(&self, c: usize, y: usize, x: usize) -> f32 {
        self.data[(c * self.height + y) * self.width + x]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(height: usize, width: usize, channels: usize) -> ImageArray {
        let data = (0..height * width * channels).map(|v| v as f32).collect();
        ImageArray::new(height, width, channels, data).unwrap()
    }

    #[test]
    fn test_new_rejects_wrong_length() {
        assert!(ImageArray::new(2, 2, 3, vec![0.0; 11]).is_err());
    }

    #[test]
    fn test_take_channels_keeps_leading_channels() {
        let array = ramp(1, 2, 4).take_channels(3);
        assert_eq!(array.shape(), [1, 2, 3]);
        assert_eq!(array.data(), &[0.0, 1.0, 2.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_crop_and_chw() {
        let array = ramp(4, 4, 2);
        let crop = array.crop(1, 2, 2, 2).unwrap();
        assert_eq!(crop.get(0, 0, 1), array.get(1, 2, 1));
        assert_eq!(crop.get(1, 1, 0), array.get(2, 3, 0));

        let chw = crop.to_chw();
        assert_eq!(chw.shape(), [2, 2, 2]);
        assert_eq!(chw.get(1, 1, 0), crop.get(1, 0, 1));
        assert!(array.crop(3, 3, 2, 2).is_err());
    }

    #[test]
    fn test_concat_and_channel_range() {
        let a = ramp(2, 2, 1);
        let b = ramp(2, 2, 2);
        let joined = ImageArray::concat_channels(&[a.clone(), b.clone()]).unwrap();
        assert_eq!(joined.channels(), 3);
        assert_eq!(joined.channel_range(0, 1).unwrap(), a);
        assert_eq!(joined.channel_range(1, 3).unwrap(), b);
    }

    #[test]
    fn test_planes_round_trip() {
        let array = ramp(3, 2, 3);
        let planes: Vec<_> = (0..3).map(|c| array.plane(c)).collect();
        assert_eq!(ImageArray::from_planes(3, 2, &planes).unwrap(), array);
    }
}
