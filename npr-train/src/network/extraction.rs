//! Feature extraction for current and auxiliary frames

use crate::error::{Result, TrainError};
use crate::network::blocks::{ConvBlockKind, ConvUnit, InitType};
use burn::module::Module;
use burn::tensor::Tensor;
use burn::tensor::activation::relu;
use burn::tensor::backend::Backend;
use burn::tensor::module::avg_pool2d;

/// Deepest supported downscaling of [`AuxiliaryExtraction`].
pub const MAX_EXTRACTION_DEPTH: usize = 3;

/// Expands the current frame from `in_channels` to `out_channels` by
/// appending `out_channels - in_channels` extracted features to the input.
///
/// The same weights are applied to every level of the current-frame pyramid.
#[derive(Module, Debug)]
pub struct CurrentExtraction<B: Backend> {
    layers: Vec<ConvUnit<B>>,
}

impl<B: Backend> CurrentExtraction<B> {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        filter_base: usize,
        block: ConvBlockKind,
        init: InitType,
        device: &B::Device,
    ) -> Result<Self> {
        if in_channels >= out_channels {
            return Err(TrainError::Config(format!(
                "current-frame extraction must add channels, got {in_channels} -> {out_channels}"
            )));
        }
        let layers = vec![
            ConvUnit::new(block, in_channels, filter_base, init, device)?,
            ConvUnit::new(block, filter_base, filter_base, init, device)?,
            ConvUnit::new(block, filter_base, out_channels - in_channels, init, device)?,
        ];
        Ok(Self { layers })
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let extracted = self
            .layers
            .iter()
            .fold(input.clone(), |x, layer| relu(layer.forward(x)));
        Tensor::cat(vec![input, extracted], 1)
    }
}

/// One downscaling stage: average pool by two, then two layers doubling the width.
#[derive(Module, Debug)]
pub struct DownStage<B: Backend> {
    widen: ConvUnit<B>,
    refine: ConvUnit<B>,
}

/// Maps an auxiliary (ground truth) frame to `out_channels` features,
/// optionally at `1 / 2^depth` resolution.
#[derive(Module, Debug)]
pub struct AuxiliaryExtraction<B: Backend> {
    input: ConvUnit<B>,
    refine: ConvUnit<B>,
    stages: Vec<DownStage<B>>,
    output: ConvUnit<B>,
}

impl<B: Backend> AuxiliaryExtraction<B> {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        depth: usize,
        filter_base: usize,
        block: ConvBlockKind,
        init: InitType,
        device: &B::Device,
    ) -> Result<Self> {
        if depth > MAX_EXTRACTION_DEPTH {
            return Err(TrainError::Config(format!(
                "auxiliary extraction depth {depth} exceeds {MAX_EXTRACTION_DEPTH}"
            )));
        }
        let mut stages = Vec::with_capacity(depth);
        for level in 0..depth {
            let width = filter_base << level;
            stages.push(DownStage {
                widen: ConvUnit::new(block, width, width * 2, init, device)?,
                refine: ConvUnit::new(block, width * 2, width * 2, init, device)?,
            });
        }
        Ok(Self {
            input: ConvUnit::new(block, in_channels, filter_base, init, device)?,
            refine: ConvUnit::new(block, filter_base, filter_base, init, device)?,
            stages,
            output: ConvUnit::new(block, filter_base << depth, out_channels, init, device)?,
        })
    }

    pub fn depth(&self) -> usize {
        self.stages.len()
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = relu(self.input.forward(input));
        x = relu(self.refine.forward(x));
        for stage in &self.stages {
            x = avg_pool2d(x, [2, 2], [2, 2], [0, 0], true);
            x = relu(stage.widen.forward(x));
            x = relu(stage.refine.forward(x));
        }
        relu(self.output.forward(x))
    }
}
