//! Supported model architectures and batch-to-tensor conversion

use crate::error::{Result, TrainError};
use crate::network::{Inovis, InovisConfig, InovisTrace};
use burn::module::Module;
use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use npr_data::{Batch, GROUNDTRUTH_FEATURE, PointRenderingFeatures};
use serde::{Deserialize, Serialize};

/// Network inputs of one batch.
#[derive(Debug, Clone)]
pub struct NetworkInput<B: Backend> {
    /// Current-frame pyramid, full resolution first.
    pub current: Vec<Tensor<B, 4>>,
    /// Auxiliary frames.
    pub previous: Vec<Tensor<B, 4>>,
    /// One motion-vector field per auxiliary frame.
    pub movecs: Vec<Tensor<B, 4>>,
}

/// Shapes of a [`NetworkInput`], recorded with exported networks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputShapes {
    pub current: Vec<[usize; 4]>,
    pub previous: Vec<[usize; 4]>,
    pub movecs: Vec<[usize; 4]>,
}

impl<B: Backend> NetworkInput<B> {
    pub fn shapes(&self) -> InputShapes {
        let dims = |tensors: &[Tensor<B, 4>]| -> Vec<[usize; 4]> { tensors.iter().map(|t| t.dims()).collect() };
        InputShapes {
            current: dims(&self.current),
            previous: dims(&self.previous),
            movecs: dims(&self.movecs),
        }
    }
}

/// Copies one feature of a batch into a `[B, C, H, W]` tensor.
pub fn feature_tensor<B: Backend>(batch: &Batch, name: &str, device: &B::Device) -> Result<Tensor<B, 4>> {
    let feature = batch
        .feature(name)
        .ok_or_else(|| TrainError::MissingFeature(name.to_string()))?;
    Ok(Tensor::from_data(
        TensorData::new(feature.data.clone(), feature.shape),
        device,
    ))
}

/// First `channels` channels of a batch feature.
fn leading_channels<B: Backend>(
    batch: &Batch,
    name: &str,
    channels: usize,
    device: &B::Device,
) -> Result<Tensor<B, 4>> {
    let tensor = feature_tensor::<B>(batch, name, device)?;
    let available = tensor.dims()[1];
    if available < channels {
        return Err(TrainError::shape(
            format!("feature '{name}' channels"),
            format!(">= {channels}"),
            available,
        ));
    }
    Ok(tensor.narrow(1, 0, channels))
}

/// Color plus the first depth channel.
fn rgbd<B: Backend>(batch: &Batch, color: &str, depth: &str, device: &B::Device) -> Result<Tensor<B, 4>> {
    Ok(Tensor::cat(
        vec![
            leading_channels(batch, color, 3, device)?,
            leading_channels(batch, depth, 1, device)?,
        ],
        1,
    ))
}

/// Architectures selectable from the training configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ModelKind {
    Inovis(InovisConfig),
}

impl Default for ModelKind {
    fn default() -> Self {
        ModelKind::Inovis(InovisConfig::default())
    }
}

impl ModelKind {
    pub fn name(&self) -> &'static str {
        match self {
            ModelKind::Inovis(_) => "inovis",
        }
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<NprNetwork<B>> {
        match self {
            ModelKind::Inovis(config) => Ok(NprNetwork::Inovis(config.init(device)?)),
        }
    }

    /// Whether intermediate tensors should be written with debug output.
    pub fn output_warped(&self) -> bool {
        match self {
            ModelKind::Inovis(config) => config.output_warped,
        }
    }

    /// Batch features the network reads, ground truth included.
    pub fn required_features(&self) -> Vec<String> {
        match self {
            ModelKind::Inovis(config) => {
                let mut names = vec![GROUNDTRUTH_FEATURE.to_string()];
                for level in 0..config.current_level_count() {
                    names.push(PointRenderingFeatures::level_name("i", level));
                    names.push(PointRenderingFeatures::level_name("d", level));
                }
                for k in 1..=config.in_gt_frame_amount {
                    names.extend([format!("i_{k}"), format!("d_{k}"), format!("m_{k}")]);
                }
                names
            }
        }
    }

    /// The data-side feature set matching this architecture.
    pub fn point_rendering_features(&self, eval_size: [usize; 2], train_size: [usize; 2]) -> PointRenderingFeatures {
        match self {
            ModelKind::Inovis(config) => PointRenderingFeatures {
                eval_size,
                train_size,
                levels: config.current_level_count(),
                historical_frames: config.in_gt_frame_amount,
            },
        }
    }

    /// Assembles network inputs from a collated batch.
    pub fn input_from_batch<B: Backend>(&self, batch: &Batch, device: &B::Device) -> Result<NetworkInput<B>> {
        match self {
            ModelKind::Inovis(config) => {
                let current = (0..config.current_level_count())
                    .map(|level| {
                        rgbd(
                            batch,
                            &PointRenderingFeatures::level_name("i", level),
                            &PointRenderingFeatures::level_name("d", level),
                            device,
                        )
                    })
                    .collect::<Result<Vec<_>>>()?;
                let previous = (1..=config.in_gt_frame_amount)
                    .map(|k| rgbd(batch, &format!("i_{k}"), &format!("d_{k}"), device))
                    .collect::<Result<Vec<_>>>()?;
                let movecs = (1..=config.in_gt_frame_amount)
                    .map(|k| leading_channels(batch, &format!("m_{k}"), config.movec_channels(), device))
                    .collect::<Result<Vec<_>>>()?;
                Ok(NetworkInput {
                    current,
                    previous,
                    movecs,
                })
            }
        }
    }

    /// Ground truth color of a batch.
    pub fn target_from_batch<B: Backend>(&self, batch: &Batch, device: &B::Device) -> Result<Tensor<B, 4>> {
        let out_channels = match self {
            ModelKind::Inovis(config) => config.out_channels,
        };
        leading_channels(batch, GROUNDTRUTH_FEATURE, out_channels, device)
    }
}

/// Common capability of every architecture.
pub trait Model<B: Backend> {
    fn forward(&self, input: NetworkInput<B>) -> Result<Tensor<B, 4>>;

    /// Forward pass that also returns intermediate tensors when the
    /// architecture has any worth inspecting.
    fn forward_traced(&self, input: NetworkInput<B>) -> Result<(Tensor<B, 4>, Option<InovisTrace<B>>)>;

    fn kind(&self) -> ModelKind;
}

#[derive(Module, Debug)]
pub enum NprNetwork<B: Backend> {
    Inovis(Inovis<B>),
}

impl<B: Backend> Model<B> for NprNetwork<B> {
    fn forward(&self, input: NetworkInput<B>) -> Result<Tensor<B, 4>> {
        match self {
            NprNetwork::Inovis(net) => net.forward(input),
        }
    }

    fn forward_traced(&self, input: NetworkInput<B>) -> Result<(Tensor<B, 4>, Option<InovisTrace<B>>)> {
        match self {
            NprNetwork::Inovis(net) => net.forward_traced(input).map(|(out, trace)| (out, Some(trace))),
        }
    }

    fn kind(&self) -> ModelKind {
        match self {
            NprNetwork::Inovis(net) => ModelKind::Inovis(net.config().clone()),
        }
    }
}
