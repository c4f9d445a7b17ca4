//! Temporal reweighting of warped auxiliary frames
//!
//! A small network looks at the current frame and the warped auxiliary
//! frames and predicts one weight map in `[0, 10]` per auxiliary frame. Each
//! frame's full feature stack is scaled by its map and the results are
//! concatenated along the channel axis.

use crate::error::{Result, TrainError};
use crate::network::blocks::{ConvBlockKind, ConvUnit, InitType};
use burn::module::{Ignored, Module};
use burn::tensor::Tensor;
use burn::tensor::activation::{relu, tanh};
use burn::tensor::backend::Backend;

/// Hidden width of the weight predictor.
const HIDDEN_CHANNELS: usize = 32;

/// Which channels of every auxiliary frame feed the weight predictor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightInput {
    /// The first `n` channels (the warped RGBD); the frame may carry more.
    Leading(usize),
    /// All channels; every frame must carry exactly `n`.
    Full(usize),
}

impl WeightInput {
    fn channels(&self) -> usize {
        match *self {
            WeightInput::Leading(n) | WeightInput::Full(n) => n,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReweightingShape {
    pub current_channels: usize,
    pub input: WeightInput,
    pub frames: usize,
}

#[derive(Module, Debug)]
pub struct Reweighting<B: Backend> {
    shape: Ignored<ReweightingShape>,
    /// Absent when reweighting is disabled.
    layers: Option<Vec<ConvUnit<B>>>,
}

impl<B: Backend> Reweighting<B> {
    pub fn new(
        shape: ReweightingShape,
        block: ConvBlockKind,
        disable: bool,
        init: InitType,
        device: &B::Device,
    ) -> Result<Self> {
        if shape.frames == 0 {
            return Err(TrainError::Config("reweighting needs at least one auxiliary frame".into()));
        }
        let layers = if disable {
            None
        } else {
            let in_channels = shape.current_channels + shape.input.channels() * shape.frames;
            Some(vec![
                ConvUnit::new(block, in_channels, HIDDEN_CHANNELS, init, device)?,
                ConvUnit::new(block, HIDDEN_CHANNELS, HIDDEN_CHANNELS, init, device)?,
                ConvUnit::new(block, HIDDEN_CHANNELS, shape.frames, init, device)?,
            ])
        };
        Ok(Self {
            shape: Ignored(shape),
            layers,
        })
    }

    pub fn is_disabled(&self) -> bool {
        self.layers.is_none()
    }

    pub fn forward(&self, current: Tensor<B, 4>, previous: &[Tensor<B, 4>]) -> Result<Tensor<B, 4>> {
        self.forward_with_weights(current, previous).map(|(out, _)| out)
    }

    /// Also returns the `[B, N, H, W]` weight maps (`None` when disabled).
    pub fn forward_with_weights(
        &self,
        current: Tensor<B, 4>,
        previous: &[Tensor<B, 4>],
    ) -> Result<(Tensor<B, 4>, Option<Tensor<B, 4>>)> {
        self.check_inputs(&current, previous)?;

        let Some(layers) = &self.layers else {
            return Ok((Tensor::cat(previous.to_vec(), 1), None));
        };

        let mut inputs = Vec::with_capacity(previous.len() + 1);
        inputs.push(current);
        for frame in previous {
            inputs.push(match self.shape.input {
                WeightInput::Leading(n) => frame.clone().narrow(1, 0, n),
                WeightInput::Full(_) => frame.clone(),
            });
        }

        let last = layers.len() - 1;
        let mut x = Tensor::cat(inputs, 1);
        for (i, layer) in layers.iter().enumerate() {
            x = layer.forward(x);
            x = if i == last { tanh(x) } else { relu(x) };
        }
        // [-1, 1] -> [0, 10]
        let weights = x.add_scalar(1.0).mul_scalar(5.0);

        let reweighted = previous
            .iter()
            .enumerate()
            .map(|(i, frame)| frame.clone() * weights.clone().narrow(1, i, 1))
            .collect();
        Ok((Tensor::cat(reweighted, 1), Some(weights)))
    }

    fn check_inputs(&self, current: &Tensor<B, 4>, previous: &[Tensor<B, 4>]) -> Result<()> {
        let shape = *self.shape;
        let current_channels = current.dims()[1];
        if current_channels != shape.current_channels {
            return Err(TrainError::shape(
                "reweighting current-frame channels",
                shape.current_channels,
                current_channels,
            ));
        }
        if previous.len() != shape.frames {
            return Err(TrainError::shape("reweighting auxiliary frames", shape.frames, previous.len()));
        }
        for (i, frame) in previous.iter().enumerate() {
            let channels = frame.dims()[1];
            let ok = match shape.input {
                WeightInput::Leading(n) => channels >= n,
                WeightInput::Full(n) => channels == n,
            };
            if !ok {
                let expected = match shape.input {
                    WeightInput::Leading(n) => format!(">= {n}"),
                    WeightInput::Full(n) => n.to_string(),
                };
                return Err(TrainError::shape(
                    format!("reweighting auxiliary frame {i} channels"),
                    expected,
                    channels,
                ));
            }
        }
        Ok(())
    }
}
