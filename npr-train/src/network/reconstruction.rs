//! Multi-scale UNet reconstruction
//!
//! Four downsampling and four upsampling stages. Level `k` (`k = 1..4`) of
//! the downsampling path may receive a side input at `1 / 2^k` resolution
//! which is concatenated after the stage's convolution block, so the stage
//! itself only produces `down_filters[k] - input_channels[k]` channels.
//! Level 0 input feeds the start block.

use crate::error::{Result, TrainError};
use crate::network::blocks::{
    ConvBlock, ConvBlockKind, DownsampleBlock, InitType, PoolingMode, UpsampleBlock, UpsampleMode, mode_from_str,
};
use burn::module::{Ignored, Module};
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::tensor::Tensor;
use burn::tensor::activation::{sigmoid, tanh};
use burn::tensor::backend::Backend;
use serde::{Deserialize, Serialize};

/// Number of resolution levels, including the full-resolution start level.
pub const LEVELS: usize = 5;

/// Default level widths before dividing by the feature scale.
pub const BASE_FILTERS: [usize; LEVELS] = [64, 128, 256, 512, 1024];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinalActivation {
    #[default]
    Sigmoid,
    Tanh,
    None,
}

mode_from_str!(FinalActivation, "final activation", {
    "sigmoid" => Sigmoid,
    "tanh" => Tanh,
    "none" => None,
});

#[derive(Debug, Clone, PartialEq)]
pub struct ReconstructionConfig {
    pub input_channels: [usize; LEVELS],
    pub output_channels: usize,
    pub filters: [usize; LEVELS],
    /// Extra width added to the downsampling path per level.
    pub additional_channels: [usize; LEVELS],
    pub more_layers: usize,
    pub upsample: UpsampleMode,
    pub pooling: PoolingMode,
    pub block: ConvBlockKind,
    pub final_activation: FinalActivation,
    pub init: InitType,
}

impl ReconstructionConfig {
    /// Pads a per-level channel list with zeros (extra entries are dropped).
    pub fn pad_levels(channels: &[usize]) -> [usize; LEVELS] {
        let mut padded = [0; LEVELS];
        for (slot, c) in padded.iter_mut().zip(channels) {
            *slot = *c;
        }
        padded
    }

    /// Level widths and additional channels.
    ///
    /// Without explicit sizes the base widths are divided by `feature_scale`
    /// and the width of `aux_level` is doubled to make room for auxiliary
    /// features. Explicit sizes are used as given.
    pub fn filters_for(
        filter_sizes: &[usize],
        feature_scale: usize,
        aux_level: usize,
    ) -> Result<([usize; LEVELS], [usize; LEVELS])> {
        if !filter_sizes.is_empty() {
            if filter_sizes.len() != LEVELS {
                return Err(TrainError::Config(format!(
                    "expected {LEVELS} filter sizes, got {}",
                    filter_sizes.len()
                )));
            }
            return Ok((Self::pad_levels(filter_sizes), [0; LEVELS]));
        }
        if feature_scale == 0 {
            return Err(TrainError::Config("feature scale must be positive".into()));
        }
        let filters = BASE_FILTERS.map(|f| f / feature_scale);
        let mut additional = [0; LEVELS];
        if let Some(slot) = additional.get_mut(aux_level) {
            *slot = filters[aux_level];
        }
        Ok((filters, additional))
    }

    fn down_filters(&self) -> [usize; LEVELS] {
        let mut down = self.filters;
        for (d, a) in down.iter_mut().zip(self.additional_channels) {
            *d += a;
        }
        down
    }

    fn validate(&self) -> Result<()> {
        if self.input_channels[0] == 0 {
            return Err(TrainError::Config("reconstruction needs a full-resolution input".into()));
        }
        if self.filters.contains(&0) || self.output_channels == 0 {
            return Err(TrainError::Config(format!(
                "reconstruction widths must be positive, got {:?} -> {}",
                self.filters, self.output_channels
            )));
        }
        let down = self.down_filters();
        for level in 1..LEVELS {
            if down[level] <= self.input_channels[level] {
                return Err(TrainError::Config(format!(
                    "level {level} is {} wide but receives {} input channels",
                    down[level], self.input_channels[level]
                )));
            }
        }
        Ok(())
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<Reconstruction<B>> {
        self.validate()?;
        let down = self.down_filters();
        let up = self.filters;

        let start = ConvBlock::new(self.block, self.input_channels[0], down[0], true, self.init, device);
        let downs = (1..LEVELS)
            .map(|k| {
                DownsampleBlock::new(
                    down[k - 1],
                    down[k] - self.input_channels[k],
                    self.block,
                    self.pooling,
                    self.init,
                    device,
                )
            })
            .collect();

        let bottom = LEVELS - 1;
        let more_downs = (0..self.more_layers)
            .map(|i| {
                let in_channels = if i == 0 { down[bottom] } else { up[bottom] };
                DownsampleBlock::new(in_channels, up[bottom], self.block, self.pooling, self.init, device)
            })
            .collect();
        let more_ups = (0..self.more_layers)
            .map(|i| {
                let skip = if i == 0 { down[bottom] } else { up[bottom] };
                UpsampleBlock::new(skip, up[bottom], up[bottom], self.upsample, self.block, self.init, device)
            })
            .collect();

        let ups = (0..bottom)
            .map(|k| {
                let lower = if k + 1 == bottom && self.more_layers == 0 {
                    down[bottom]
                } else {
                    up[k + 1]
                };
                UpsampleBlock::new(down[k], lower, up[k], self.upsample, self.block, self.init, device)
            })
            .collect();

        let final_conv = Conv2dConfig::new([up[0], self.output_channels], [1, 1])
            .with_initializer(self.init.initializer())
            .init(device);

        Ok(Reconstruction {
            input_channels: Ignored(self.input_channels),
            start,
            downs,
            more_downs,
            more_ups,
            ups,
            final_conv,
            activation: Ignored(self.final_activation),
        })
    }
}

#[derive(Module, Debug)]
pub struct Reconstruction<B: Backend> {
    input_channels: Ignored<[usize; LEVELS]>,
    start: ConvBlock<B>,
    /// `downs[k - 1]` produces level `k`.
    downs: Vec<DownsampleBlock<B>>,
    more_downs: Vec<DownsampleBlock<B>>,
    more_ups: Vec<UpsampleBlock<B>>,
    /// `ups[k]` produces level `k` from level `k + 1`.
    ups: Vec<UpsampleBlock<B>>,
    final_conv: Conv2d<B>,
    activation: Ignored<FinalActivation>,
}

impl<B: Backend> Reconstruction<B> {
    /// Levels that take a side input.
    pub fn input_levels(&self) -> Vec<usize> {
        (0..LEVELS).filter(|&k| self.input_channels[k] > 0).collect()
    }

    /// `inputs` holds one tensor per level with declared input channels, in
    /// level order.
    pub fn forward(&self, inputs: Vec<Tensor<B, 4>>) -> Result<Tensor<B, 4>> {
        let levels = self.input_levels();
        if inputs.len() != levels.len() {
            return Err(TrainError::shape("reconstruction input scales", levels.len(), inputs.len()));
        }
        let mut side: [Option<Tensor<B, 4>>; LEVELS] = Default::default();
        for (level, input) in levels.into_iter().zip(inputs) {
            let channels = input.dims()[1];
            if channels != self.input_channels[level] {
                return Err(TrainError::shape(
                    format!("reconstruction level {level} input channels"),
                    self.input_channels[level],
                    channels,
                ));
            }
            side[level] = Some(input);
        }

        let first = side[0]
            .take()
            .ok_or_else(|| TrainError::Config("reconstruction needs a full-resolution input".into()))?;
        let mut skips = Vec::with_capacity(LEVELS);
        skips.push(self.start.forward(first));
        for (k, down) in self.downs.iter().enumerate() {
            let level = k + 1;
            let mut x = down.forward(skips[k].clone());
            if let Some(input) = side[level].take() {
                x = concat_checked(x, input, level)?;
            }
            skips.push(x);
        }

        let mut x = match skips.pop() {
            Some(bottom) => self.bottleneck(bottom)?,
            None => return Err(TrainError::Config("reconstruction has no levels".into())),
        };
        for (k, up) in self.ups.iter().enumerate().rev() {
            x = up.forward(x, skips[k].clone())?;
        }

        let out = self.final_conv.forward(x);
        Ok(match *self.activation {
            FinalActivation::Sigmoid => sigmoid(out),
            FinalActivation::Tanh => tanh(out),
            FinalActivation::None => out,
        })
    }

    fn bottleneck(&self, bottom: Tensor<B, 4>) -> Result<Tensor<B, 4>> {
        if self.more_downs.is_empty() {
            return Ok(bottom);
        }
        let mut stack = vec![bottom];
        for down in &self.more_downs {
            let next = down.forward(stack[stack.len() - 1].clone());
            stack.push(next);
        }
        let mut x = stack[stack.len() - 1].clone();
        for (i, up) in self.more_ups.iter().enumerate().rev() {
            x = up.forward(x, stack[i].clone())?;
        }
        Ok(x)
    }
}

fn concat_checked<B: Backend>(x: Tensor<B, 4>, input: Tensor<B, 4>, level: usize) -> Result<Tensor<B, 4>> {
    let [_, _, h, w] = x.dims();
    let [_, _, ih, iw] = input.dims();
    if [h, w] != [ih, iw] {
        return Err(TrainError::shape(
            format!("reconstruction level {level} input size"),
            format!("{h}x{w}"),
            format!("{ih}x{iw}"),
        ));
    }
    Ok(Tensor::cat(vec![x, input], 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    fn config(input_channels: [usize; LEVELS]) -> ReconstructionConfig {
        let (filters, additional_channels) = ReconstructionConfig::filters_for(&[], 16, 0).unwrap();
        ReconstructionConfig {
            input_channels,
            output_channels: 3,
            filters,
            additional_channels,
            more_layers: 0,
            upsample: UpsampleMode::Deconv,
            pooling: PoolingMode::Avg,
            block: ConvBlockKind::Basic,
            final_activation: FinalActivation::Sigmoid,
            init: InitType::default(),
        }
    }

    fn pyramid(size: usize, channels: &[usize]) -> Vec<Tensor<TestBackend, 4>> {
        channels
            .iter()
            .enumerate()
            .map(|(k, &c)| Tensor::ones([1, c, size >> k, size >> k], &Default::default()))
            .collect()
    }

    #[test]
    fn test_default_filters_double_aux_level() {
        let (filters, additional) = ReconstructionConfig::filters_for(&[], 4, 0).unwrap();
        assert_eq!(filters, [16, 32, 64, 128, 256]);
        assert_eq!(additional, [16, 0, 0, 0, 0]);

        let (filters, additional) = ReconstructionConfig::filters_for(&[8, 8, 8, 8, 8], 4, 0).unwrap();
        assert_eq!(filters, [8; LEVELS]);
        assert_eq!(additional, [0; LEVELS]);
        assert!(ReconstructionConfig::filters_for(&[8, 8], 4, 0).is_err());
    }

    #[test]
    fn test_multiscale_forward() {
        let device = Default::default();
        let net = config([10, 3, 3, 0, 0]).init::<TestBackend>(&device).unwrap();
        assert_eq!(net.input_levels(), vec![0, 1, 2]);
        let out = net.forward(pyramid(32, &[10, 3, 3])).unwrap();
        assert_eq!(out.dims(), [1, 3, 32, 32]);
        let values = out.into_data().to_vec::<f32>().unwrap();
        assert!(values.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_wrong_scale_count_fails() {
        let device = Default::default();
        let net = config([10, 3, 0, 0, 0]).init::<TestBackend>(&device).unwrap();
        assert!(matches!(
            net.forward(pyramid(32, &[10])),
            Err(TrainError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_indivisible_size_is_a_mismatch() {
        let device = Default::default();
        let net = config([4, 0, 0, 0, 0]).init::<TestBackend>(&device).unwrap();
        let input = Tensor::ones([1, 4, 36, 36], &device);
        assert!(matches!(net.forward(vec![input]), Err(TrainError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_side_input_wider_than_level_is_rejected() {
        let device = Default::default();
        // level 1 is 8 wide at feature scale 16
        assert!(config([4, 8, 0, 0, 0]).init::<TestBackend>(&device).is_err());
    }

    #[test]
    fn test_more_layers_extend_bottleneck() {
        let device = Default::default();
        let mut cfg = config([4, 0, 0, 0, 0]);
        cfg.more_layers = 1;
        cfg.final_activation = FinalActivation::Tanh;
        let net = cfg.init::<TestBackend>(&device).unwrap();
        let out = net.forward(pyramid(64, &[4])).unwrap();
        assert_eq!(out.dims(), [1, 3, 64, 64]);
    }
}
