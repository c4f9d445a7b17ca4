//! INOVIS point-rendering network
//!
//! Chains current-frame extraction, auxiliary-frame extraction, backward
//! warping, temporal reweighting and the multi-scale reconstruction UNet.

use crate::error::{Result, TrainError};
use crate::model::NetworkInput;
use crate::network::blocks::{ConvBlockKind, InitType, PoolingMode, UpsampleMode};
use crate::network::extraction::{AuxiliaryExtraction, CurrentExtraction, MAX_EXTRACTION_DEPTH};
use crate::network::reconstruction::{FinalActivation, LEVELS, Reconstruction, ReconstructionConfig};
use crate::network::reweighting::{Reweighting, ReweightingShape, WeightInput};
use crate::network::warp::warp_texture_coordinates;
use burn::module::{Ignored, Module};
use burn::tensor::Tensor;
use burn::tensor::backend::Backend;
use burn::tensor::module::interpolate;
use burn::tensor::ops::{InterpolateMode, InterpolateOptions};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InovisConfig {
    /// Channels of each current-frame pyramid level, full resolution first.
    pub in_channels_current: Vec<usize>,
    /// Channels of each auxiliary frame (RGBD).
    pub in_channels_gt: usize,
    pub in_gt_frame_amount: usize,
    /// Features appended by the current-frame extractor.
    pub feature_amount_current: usize,
    /// Features produced per auxiliary frame.
    pub feature_amount_gt: usize,
    /// Level at which auxiliary features are warped and fused. Only `0` is
    /// validated in practice.
    pub feature_extraction_depth: usize,
    pub out_channels: usize,
    /// Warp the auxiliary RGBD alongside its features and derive the weights
    /// from it; stripped again after reweighting.
    pub warp_rgbd: bool,
    pub extract_lowres_features: bool,
    pub reweight_with_low_res: bool,
    pub conv_block_extraction_pr: ConvBlockKind,
    pub conv_block_extraction_gt: ConvBlockKind,
    pub conv_block_reweighting: ConvBlockKind,
    pub conv_block_reconstruction: ConvBlockKind,
    pub upsample_mode: UpsampleMode,
    pub pooling_mode: PoolingMode,
    pub feature_scale: usize,
    /// Explicit reconstruction widths; empty selects the scaled defaults.
    pub filter_sizes: Vec<usize>,
    pub more_layers: usize,
    pub fe_current_filter_base: usize,
    pub fe_gt_filter_base: usize,
    pub disable_reweighting: bool,
    /// Multiply warped features by the third motion-vector channel.
    pub mask_warped: bool,
    /// Write warped and reweighted tensors as images during training.
    pub output_warped: bool,
    pub final_activation: FinalActivation,
    pub init_type: InitType,
}

impl Default for InovisConfig {
    fn default() -> Self {
        Self {
            in_channels_current: vec![4, 4, 4, 4],
            in_channels_gt: 4,
            in_gt_frame_amount: 3,
            feature_amount_current: 8,
            feature_amount_gt: 12,
            feature_extraction_depth: 0,
            out_channels: 3,
            warp_rgbd: true,
            extract_lowres_features: true,
            reweight_with_low_res: false,
            conv_block_extraction_pr: ConvBlockKind::Gated,
            conv_block_extraction_gt: ConvBlockKind::Gated,
            conv_block_reweighting: ConvBlockKind::Basic,
            conv_block_reconstruction: ConvBlockKind::Gated,
            upsample_mode: UpsampleMode::Deconv,
            pooling_mode: PoolingMode::Avg,
            feature_scale: 4,
            filter_sizes: Vec::new(),
            more_layers: 0,
            fe_current_filter_base: 32,
            fe_gt_filter_base: 16,
            disable_reweighting: false,
            mask_warped: false,
            output_warped: false,
            final_activation: FinalActivation::Sigmoid,
            init_type: InitType::default(),
        }
    }
}

impl InovisConfig {
    /// Current-frame channels padded to every reconstruction level.
    pub fn current_levels(&self) -> [usize; LEVELS] {
        ReconstructionConfig::pad_levels(&self.in_channels_current)
    }

    /// Number of current-frame pyramid levels the network expects.
    pub fn current_level_count(&self) -> usize {
        self.current_levels().iter().filter(|c| **c > 0).count()
    }

    /// Lowest-resolution level with current-frame input.
    pub fn lowest_level(&self) -> usize {
        self.current_levels().iter().rposition(|c| *c > 0).unwrap_or(0)
    }

    /// Motion-vector channels read per auxiliary frame.
    pub fn movec_channels(&self) -> usize {
        if self.mask_warped { 3 } else { 2 }
    }

    fn reweighting_shape(&self) -> ReweightingShape {
        let levels = self.current_levels();
        let mut current_channels = levels[self.feature_extraction_depth];
        if self.reweight_with_low_res {
            current_channels += levels[self.lowest_level()];
        }
        let input = if self.warp_rgbd {
            WeightInput::Leading(self.in_channels_gt)
        } else {
            WeightInput::Full(self.feature_amount_gt)
        };
        ReweightingShape {
            current_channels,
            input,
            frames: self.in_gt_frame_amount,
        }
    }

    fn reconstruction_config(&self) -> Result<ReconstructionConfig> {
        let levels = self.current_levels();
        let mut input_channels = levels;
        input_channels[0] = levels[0] + self.feature_amount_current;
        if self.extract_lowres_features {
            for level in 1..LEVELS {
                if levels[level] > 0 {
                    input_channels[level] = levels[level] + self.feature_amount_current;
                }
            }
        }
        input_channels[self.feature_extraction_depth] += self.feature_amount_gt * self.in_gt_frame_amount;

        let (filters, additional_channels) =
            ReconstructionConfig::filters_for(&self.filter_sizes, self.feature_scale, self.feature_extraction_depth)?;
        Ok(ReconstructionConfig {
            input_channels,
            output_channels: self.out_channels,
            filters,
            additional_channels,
            more_layers: self.more_layers,
            upsample: self.upsample_mode,
            pooling: self.pooling_mode,
            block: self.conv_block_reconstruction,
            final_activation: self.final_activation,
            init: self.init_type,
        })
    }

    fn validate(&self) -> Result<()> {
        let levels = self.current_levels();
        if self.in_channels_current.len() > LEVELS {
            return Err(TrainError::Config(format!(
                "at most {LEVELS} current-frame levels are supported, got {}",
                self.in_channels_current.len()
            )));
        }
        if levels[0] == 0 {
            return Err(TrainError::Config("current frame needs full-resolution input".into()));
        }
        if self.feature_extraction_depth > MAX_EXTRACTION_DEPTH || levels[self.feature_extraction_depth] == 0 {
            return Err(TrainError::Config(format!(
                "feature extraction depth {} has no current-frame level",
                self.feature_extraction_depth
            )));
        }
        if self.in_gt_frame_amount == 0 {
            return Err(TrainError::Config("at least one auxiliary frame is required".into()));
        }
        // one extractor serves every level
        if self.extract_lowres_features {
            if let Some(level) = (1..LEVELS).find(|&k| levels[k] > 0 && levels[k] != levels[0]) {
                return Err(TrainError::Config(format!(
                    "low-resolution extraction needs {} channels on every level, level {level} has {}",
                    levels[0], levels[level]
                )));
            }
        }
        Ok(())
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<Inovis<B>> {
        self.validate()?;
        if self.feature_extraction_depth > 0 {
            tracing::warn!(
                depth = self.feature_extraction_depth,
                "auxiliary features are fused below full resolution; only depth 0 is validated"
            );
        }
        if self.output_warped {
            tracing::warn!("output_warped is a debug feature and slows down training");
        }

        let levels = self.current_levels();
        let current_extraction = CurrentExtraction::new(
            levels[0],
            levels[0] + self.feature_amount_current,
            self.fe_current_filter_base,
            self.conv_block_extraction_pr,
            self.init_type,
            device,
        )?;
        let auxiliary_extraction = AuxiliaryExtraction::new(
            self.in_channels_gt,
            self.feature_amount_gt,
            self.feature_extraction_depth,
            self.fe_gt_filter_base,
            self.conv_block_extraction_gt,
            self.init_type,
            device,
        )?;
        let reweighting = Reweighting::new(
            self.reweighting_shape(),
            self.conv_block_reweighting,
            self.disable_reweighting,
            self.init_type,
            device,
        )?;
        let reconstruction_config = self.reconstruction_config()?;
        tracing::debug!(
            input_channels = ?reconstruction_config.input_channels,
            filters = ?reconstruction_config.filters,
            "reconstruction configured"
        );
        let reconstruction = reconstruction_config.init(device)?;

        Ok(Inovis {
            config: Ignored(self.clone()),
            current_extraction,
            auxiliary_extraction,
            reweighting,
            reconstruction,
        })
    }
}

/// Intermediate tensors of one forward pass, for debug output.
#[derive(Debug, Clone)]
pub struct InovisTrace<B: Backend> {
    /// Extracted auxiliary features before warping (RGBD first when warped along).
    pub auxiliary: Vec<Tensor<B, 4>>,
    pub warped: Vec<Tensor<B, 4>>,
    /// `[B, N, H, W]` weights in `[0, 10]`, absent when reweighting is disabled.
    pub weights: Option<Tensor<B, 4>>,
    /// Reweighted auxiliary features, RGBD included.
    pub reweighted: Tensor<B, 4>,
}

#[derive(Module, Debug)]
pub struct Inovis<B: Backend> {
    config: Ignored<InovisConfig>,
    current_extraction: CurrentExtraction<B>,
    auxiliary_extraction: AuxiliaryExtraction<B>,
    reweighting: Reweighting<B>,
    reconstruction: Reconstruction<B>,
}

impl<B: Backend> Inovis<B> {
    pub fn config(&self) -> &InovisConfig {
        &self.config
    }

    pub fn forward(&self, input: NetworkInput<B>) -> Result<Tensor<B, 4>> {
        self.forward_traced(input).map(|(out, _)| out)
    }

    #[tracing::instrument(level = "trace", skip_all)]
    pub fn forward_traced(&self, input: NetworkInput<B>) -> Result<(Tensor<B, 4>, InovisTrace<B>)> {
        let config = &*self.config;
        let NetworkInput {
            current,
            previous,
            movecs,
        } = input;
        self.check_input(&current, &previous, &movecs)?;
        let depth = config.feature_extraction_depth;
        let [_, _, level_h, level_w] = current[depth].dims();

        let features_current = self.current_extraction.forward(current[0].clone());

        let auxiliary: Vec<Tensor<B, 4>> = previous
            .into_iter()
            .map(|frame| {
                let extracted = self.auxiliary_extraction.forward(frame.clone());
                if !config.warp_rgbd {
                    return extracted;
                }
                let [_, _, h, w] = extracted.dims();
                let rgbd = if depth == 0 {
                    frame
                } else {
                    interpolate(frame, [h, w], InterpolateOptions::new(InterpolateMode::Bilinear))
                };
                Tensor::cat(vec![rgbd, extracted], 1)
            })
            .collect();

        let mut warped = Vec::with_capacity(auxiliary.len());
        for (features, movec) in auxiliary.iter().zip(&movecs) {
            let [_, _, mh, mw] = movec.dims();
            let movec = if [mh, mw] == [level_h, level_w] {
                movec.clone()
            } else {
                interpolate(
                    movec.clone(),
                    [level_h, level_w],
                    InterpolateOptions::new(InterpolateMode::Nearest),
                )
            };
            let mut moved = warp_texture_coordinates(features.clone(), movec.clone().narrow(1, 0, 2))?;
            if config.mask_warped {
                moved = moved * movec.narrow(1, 2, 1);
            }
            warped.push(moved);
        }

        let mut reweight_input = current[depth].clone();
        if config.reweight_with_low_res {
            let low = interpolate(
                current[config.lowest_level()].clone(),
                [level_h, level_w],
                InterpolateOptions::new(InterpolateMode::Bilinear),
            );
            reweight_input = Tensor::cat(vec![reweight_input, low], 1);
        }
        let (reweighted, weights) = self.reweighting.forward_with_weights(reweight_input, &warped)?;

        let fused = if config.warp_rgbd {
            let stride = config.in_channels_gt + config.feature_amount_gt;
            let features = (0..config.in_gt_frame_amount)
                .map(|i| {
                    reweighted
                        .clone()
                        .narrow(1, i * stride + config.in_channels_gt, config.feature_amount_gt)
                })
                .collect();
            Tensor::cat(features, 1)
        } else {
            reweighted.clone()
        };

        let mut levels = Vec::with_capacity(current.len());
        levels.push(features_current);
        for frame in current.into_iter().skip(1) {
            levels.push(if config.extract_lowres_features {
                self.current_extraction.forward(frame)
            } else {
                frame
            });
        }
        let fused_level = levels[depth].clone();
        levels[depth] = Tensor::cat(vec![fused_level, fused], 1);

        let output = self.reconstruction.forward(levels)?;
        Ok((
            output,
            InovisTrace {
                auxiliary,
                warped,
                weights,
                reweighted,
            },
        ))
    }

    fn check_input(&self, current: &[Tensor<B, 4>], previous: &[Tensor<B, 4>], movecs: &[Tensor<B, 4>]) -> Result<()> {
        let config = &*self.config;
        let expected_levels = config.current_level_count();
        if current.len() != expected_levels {
            return Err(TrainError::shape("current-frame levels", expected_levels, current.len()));
        }
        if previous.len() != config.in_gt_frame_amount {
            return Err(TrainError::shape("auxiliary frames", config.in_gt_frame_amount, previous.len()));
        }
        if movecs.len() != previous.len() {
            return Err(TrainError::shape("motion-vector fields", previous.len(), movecs.len()));
        }
        let levels = config.current_levels();
        for (k, frame) in current.iter().enumerate() {
            let channels = frame.dims()[1];
            if channels != levels[k] {
                return Err(TrainError::shape(format!("current-frame level {k} channels"), levels[k], channels));
            }
        }
        for (i, frame) in previous.iter().enumerate() {
            let channels = frame.dims()[1];
            if channels != config.in_channels_gt {
                return Err(TrainError::shape(
                    format!("auxiliary frame {i} channels"),
                    config.in_channels_gt,
                    channels,
                ));
            }
        }
        for (i, movec) in movecs.iter().enumerate() {
            let channels = movec.dims()[1];
            if channels < config.movec_channels() {
                return Err(TrainError::shape(
                    format!("motion-vector field {i} channels"),
                    format!(">= {}", config.movec_channels()),
                    channels,
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    fn small_config() -> InovisConfig {
        InovisConfig {
            in_channels_current: vec![4, 4],
            feature_amount_current: 4,
            feature_amount_gt: 4,
            in_gt_frame_amount: 2,
            feature_scale: 8,
            fe_current_filter_base: 4,
            fe_gt_filter_base: 4,
            conv_block_reconstruction: ConvBlockKind::Basic,
            ..Default::default()
        }
    }

    fn identity_movec(size: usize, channels: usize) -> Tensor<TestBackend, 4> {
        let mut data = Vec::with_capacity(channels * size * size);
        for _ in 0..size {
            for x in 0..size {
                data.push((2 * x + 1) as f32 / size as f32 - 1.0);
            }
        }
        for y in 0..size {
            for _ in 0..size {
                data.push(-((2 * y + 1) as f32 / size as f32 - 1.0));
            }
        }
        data.resize(channels * size * size, 1.0);
        Tensor::from_data(
            burn::tensor::TensorData::new(data, [1, channels, size, size]),
            &Default::default(),
        )
    }

    fn input(config: &InovisConfig, size: usize, aux_size: usize) -> NetworkInput<TestBackend> {
        let device = Default::default();
        NetworkInput {
            current: (0..config.current_level_count())
                .map(|k| Tensor::ones([1, 4, size >> k, size >> k], &device))
                .collect(),
            previous: (0..config.in_gt_frame_amount)
                .map(|_| Tensor::ones([1, config.in_channels_gt, aux_size, aux_size], &device))
                .collect(),
            movecs: (0..config.in_gt_frame_amount)
                .map(|_| identity_movec(size, config.movec_channels()))
                .collect(),
        }
    }

    #[test]
    fn test_default_reconstruction_channels() {
        let config = InovisConfig::default();
        let recon = config.reconstruction_config().unwrap();
        assert_eq!(recon.input_channels, [48, 12, 12, 12, 0]);
        assert_eq!(recon.filters, [16, 32, 64, 128, 256]);
        assert_eq!(recon.additional_channels, [16, 0, 0, 0, 0]);
        assert_eq!(config.reweighting_shape().current_channels, 4);
    }

    #[test]
    fn test_raw_lowres_levels_keep_input_channels() {
        let config = InovisConfig {
            extract_lowres_features: false,
            ..Default::default()
        };
        let recon = config.reconstruction_config().unwrap();
        assert_eq!(recon.input_channels, [48, 4, 4, 4, 0]);
    }

    #[test]
    fn test_forward_produces_image() {
        let device = Default::default();
        let config = small_config();
        let net = config.init::<TestBackend>(&device).unwrap();
        let (out, trace) = net.forward_traced(input(&config, 16, 32)).unwrap();
        assert_eq!(out.dims(), [1, 3, 16, 16]);
        assert_eq!(trace.warped.len(), 2);
        // RGBD plus features at the motion-vector resolution
        assert_eq!(trace.warped[0].dims(), [1, 8, 16, 16]);
        assert_eq!(trace.reweighted.dims(), [1, 16, 16, 16]);
    }

    #[test]
    fn test_forward_variants() {
        let device = Default::default();
        let variants = [
            InovisConfig {
                warp_rgbd: false,
                ..small_config()
            },
            InovisConfig {
                mask_warped: true,
                disable_reweighting: true,
                ..small_config()
            },
            InovisConfig {
                reweight_with_low_res: true,
                extract_lowres_features: false,
                upsample_mode: UpsampleMode::Bilinear,
                ..small_config()
            },
        ];
        for config in variants {
            let net = config.init::<TestBackend>(&device).unwrap();
            let out = net.forward(input(&config, 16, 16)).unwrap();
            assert_eq!(out.dims(), [1, 3, 16, 16]);
        }
    }

    #[test]
    fn test_wrong_frame_count_fails() {
        let device = Default::default();
        let config = small_config();
        let net = config.init::<TestBackend>(&device).unwrap();
        let mut bad = input(&config, 16, 16);
        bad.previous.pop();
        assert!(matches!(net.forward(bad), Err(TrainError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_channel_counts_are_checked_before_convolution() {
        let device = Default::default();
        let config = small_config();
        let net = config.init::<TestBackend>(&device).unwrap();

        let mut wide = input(&config, 16, 16);
        wide.current[0] = Tensor::ones([1, 5, 16, 16], &device);
        assert!(matches!(net.forward(wide), Err(TrainError::ShapeMismatch { .. })));

        let mut narrow = input(&config, 16, 16);
        narrow.current[1] = Tensor::ones([1, 3, 8, 8], &device);
        assert!(matches!(net.forward(narrow), Err(TrainError::ShapeMismatch { .. })));

        let mut rgb_only = input(&config, 16, 16);
        rgb_only.previous[0] = Tensor::ones([1, 3, 16, 16], &device);
        assert!(matches!(net.forward(rgb_only), Err(TrainError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_lowres_extraction_requires_equal_level_channels() {
        let device = Default::default();
        let mixed = InovisConfig {
            in_channels_current: vec![4, 3],
            ..small_config()
        };
        assert!(matches!(mixed.init::<TestBackend>(&device), Err(TrainError::Config(_))));

        let raw = InovisConfig {
            extract_lowres_features: false,
            ..mixed
        };
        let net = raw.init::<TestBackend>(&device).unwrap();
        let mut frames = input(&raw, 16, 16);
        frames.current[1] = Tensor::ones([1, 3, 8, 8], &device);
        assert_eq!(net.forward(frames).unwrap().dims(), [1, 3, 16, 16]);
    }

    #[test]
    fn test_missing_full_resolution_level_is_rejected() {
        let device = Default::default();
        let config = InovisConfig {
            in_channels_current: vec![0, 4],
            ..Default::default()
        };
        assert!(config.init::<TestBackend>(&device).is_err());
    }

    #[test]
    fn test_config_json_defaults() {
        let config: InovisConfig = serde_json::from_str(r#"{"feature_amount_gt": 6, "pooling_mode": "max"}"#).unwrap();
        assert_eq!(config.feature_amount_gt, 6);
        assert_eq!(config.pooling_mode, PoolingMode::Max);
        assert_eq!(config.in_channels_current, vec![4, 4, 4, 4]);
    }
}
