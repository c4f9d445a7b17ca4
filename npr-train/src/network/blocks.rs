//! Convolution blocks, pooling and upsampling stages
//!
//! Every block maps `in_channels -> out_channels` at constant resolution with
//! 3x3 kernels and one pixel of zero padding.

use crate::error::{Result, TrainError};
use burn::module::{Ignored, Module, Param};
use burn::nn::conv::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, Initializer, PaddingConfig2d};
use burn::tensor::Tensor;
use burn::tensor::activation::{relu, sigmoid};
use burn::tensor::backend::Backend;
use burn::tensor::module::{avg_pool2d, interpolate, max_pool2d};
use burn::tensor::ops::{InterpolateMode, InterpolateOptions};
use serde::{Deserialize, Serialize};

macro_rules! mode_from_str {
    ($ty:ident, $kind:literal, { $($name:literal => $variant:ident),+ $(,)? }) => {
        impl std::str::FromStr for $ty {
            type Err = $crate::error::TrainError;

            fn from_str(s: &str) -> $crate::error::Result<Self> {
                match s {
                    $($name => Ok($ty::$variant),)+
                    other => Err($crate::error::TrainError::InvalidMode {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                let name = match self {
                    $($ty::$variant => $name,)+
                };
                f.write_str(name)
            }
        }
    };
}

pub(crate) use mode_from_str;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConvBlockKind {
    Basic,
    Gated,
    Partial,
}

mode_from_str!(ConvBlockKind, "convolution block", {
    "basic" => Basic,
    "gated" => Gated,
    "partial" => Partial,
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolingMode {
    Avg,
    Max,
}

mode_from_str!(PoolingMode, "pooling mode", {
    "avg" => Avg,
    "max" => Max,
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpsampleMode {
    Deconv,
    Bilinear,
    Nearest,
}

mode_from_str!(UpsampleMode, "upsample mode", {
    "deconv" => Deconv,
    "bilinear" => Bilinear,
    "nearest" => Nearest,
});

/// Weight initialization of convolution layers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InitType {
    Normal { gain: f64 },
    Xavier { gain: f64 },
    Kaiming,
}

impl Default for InitType {
    fn default() -> Self {
        InitType::Normal { gain: 0.02 }
    }
}

impl InitType {
    pub fn initializer(&self) -> Initializer {
        match *self {
            InitType::Normal { gain } => Initializer::Normal { mean: 0.0, std: gain },
            InitType::Xavier { gain } => Initializer::XavierNormal { gain },
            InitType::Kaiming => Initializer::KaimingNormal {
                gain: 2f64.sqrt(),
                fan_out_only: false,
            },
        }
    }
}

pub(crate) fn conv3x3<B: Backend>(
    in_channels: usize,
    out_channels: usize,
    init: InitType,
    device: &B::Device,
) -> Conv2d<B> {
    Conv2dConfig::new([in_channels, out_channels], [3, 3])
        .with_padding(PaddingConfig2d::Explicit(1, 1))
        .with_initializer(init.initializer())
        .init(device)
}

/// `ELU(x) = x` for `x > 0`, `exp(x) - 1` otherwise.
pub(crate) fn elu<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 4> {
    let negative = x.clone().clamp_max(0.0).exp().sub_scalar(1.0);
    relu(x) + negative
}

/// conv, optional batch-norm, ReLU
#[derive(Module, Debug)]
pub struct ConvNormRelu<B: Backend> {
    conv: Conv2d<B>,
    norm: Option<BatchNorm<B, 2>>,
}

impl<B: Backend> ConvNormRelu<B> {
    fn new(in_channels: usize, out_channels: usize, normalize: bool, init: InitType, device: &B::Device) -> Self {
        Self {
            conv: conv3x3(in_channels, out_channels, init, device),
            norm: normalize.then(|| BatchNormConfig::new(out_channels).init(device)),
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = match &self.norm {
            Some(norm) => norm.forward(x),
            None => x,
        };
        relu(x)
    }
}

/// Two conv-norm-ReLU layers.
#[derive(Module, Debug)]
pub struct BasicBlock<B: Backend> {
    first: ConvNormRelu<B>,
    second: ConvNormRelu<B>,
}

impl<B: Backend> BasicBlock<B> {
    pub fn new(in_channels: usize, out_channels: usize, normalize: bool, init: InitType, device: &B::Device) -> Self {
        Self {
            first: ConvNormRelu::new(in_channels, out_channels, normalize, init, device),
            second: ConvNormRelu::new(out_channels, out_channels, normalize, init, device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.second.forward(self.first.forward(x))
    }
}

/// `ELU(conv_f(x)) * sigmoid(conv_m(x))`, then optional batch-norm.
#[derive(Module, Debug)]
pub struct GatedBlock<B: Backend> {
    conv_f: Conv2d<B>,
    conv_m: Conv2d<B>,
    norm: Option<BatchNorm<B, 2>>,
}

impl<B: Backend> GatedBlock<B> {
    pub fn new(in_channels: usize, out_channels: usize, normalize: bool, init: InitType, device: &B::Device) -> Self {
        Self {
            conv_f: conv3x3(in_channels, out_channels, init, device),
            conv_m: conv3x3(in_channels, out_channels, init, device),
            norm: normalize.then(|| BatchNormConfig::new(out_channels).init(device)),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let features = elu(self.conv_f.forward(x.clone()));
        let gate = sigmoid(self.conv_m.forward(x));
        let out = features * gate;
        match &self.norm {
            Some(norm) => norm.forward(out),
            None => out,
        }
    }
}

/// 3x3 partial convolution: the response is renormalized by the fraction of
/// valid (in-mask, in-bounds) inputs under the kernel.
#[derive(Module, Debug)]
pub struct PartialConv2d<B: Backend> {
    conv: Conv2d<B>,
    bias: Param<Tensor<B, 1>>,
}

impl<B: Backend> PartialConv2d<B> {
    pub fn new(in_channels: usize, out_channels: usize, init: InitType, device: &B::Device) -> Self {
        let conv = Conv2dConfig::new([in_channels, out_channels], [3, 3])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .with_bias(false)
            .with_initializer(init.initializer())
            .init(device);
        Self {
            conv,
            bias: Param::from_tensor(Tensor::zeros([out_channels], device)),
        }
    }

    /// `mask` is `[B, 1, H, W]`; without one every pixel is valid and only
    /// the border is renormalized.
    pub fn forward(&self, x: Tensor<B, 4>, mask: Option<Tensor<B, 4>>) -> Tensor<B, 4> {
        let [batch, _, height, width] = x.dims();
        let mask = mask.unwrap_or_else(|| Tensor::ones([batch, 1, height, width], &x.device()));
        let raw = self.conv.forward(x * mask.clone());

        // mean over the 3x3 window with zero padding counted
        let coverage = avg_pool2d(mask, [3, 3], [1, 1], [1, 1], true);
        let valid = coverage.clone().greater_elem(0.0).float();
        let ratio = coverage.add_scalar(1e-8).recip() * valid.clone();

        let out_channels = self.bias.val().dims()[0];
        let bias = self.bias.val().reshape([1, out_channels, 1, 1]);
        (raw * ratio + bias) * valid
    }
}

/// Partial convolution, batch-norm, ReLU, then a plain conv-norm-ReLU.
#[derive(Module, Debug)]
pub struct PartialBlock<B: Backend> {
    partial: PartialConv2d<B>,
    norm: Option<BatchNorm<B, 2>>,
    second: ConvNormRelu<B>,
}

impl<B: Backend> PartialBlock<B> {
    pub fn new(in_channels: usize, out_channels: usize, normalize: bool, init: InitType, device: &B::Device) -> Self {
        Self {
            partial: PartialConv2d::new(in_channels, out_channels, init, device),
            norm: normalize.then(|| BatchNormConfig::new(out_channels).init(device)),
            second: ConvNormRelu::new(out_channels, out_channels, normalize, init, device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>, mask: Option<Tensor<B, 4>>) -> Tensor<B, 4> {
        let x = self.partial.forward(x, mask);
        let x = match &self.norm {
            Some(norm) => norm.forward(x),
            None => x,
        };
        self.second.forward(relu(x))
    }
}

/// A convolution block selected by [`ConvBlockKind`].
#[derive(Module, Debug)]
pub enum ConvBlock<B: Backend> {
    Basic(BasicBlock<B>),
    Gated(GatedBlock<B>),
    Partial(PartialBlock<B>),
}

impl<B: Backend> ConvBlock<B> {
    pub fn new(
        kind: ConvBlockKind,
        in_channels: usize,
        out_channels: usize,
        normalize: bool,
        init: InitType,
        device: &B::Device,
    ) -> Self {
        match kind {
            ConvBlockKind::Basic => ConvBlock::Basic(BasicBlock::new(in_channels, out_channels, normalize, init, device)),
            ConvBlockKind::Gated => ConvBlock::Gated(GatedBlock::new(in_channels, out_channels, normalize, init, device)),
            ConvBlockKind::Partial => {
                ConvBlock::Partial(PartialBlock::new(in_channels, out_channels, normalize, init, device))
            }
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        match self {
            ConvBlock::Basic(block) => block.forward(x),
            ConvBlock::Gated(block) => block.forward(x),
            ConvBlock::Partial(block) => block.forward(x, None),
        }
    }
}

/// A single layer used by the extraction and reweighting networks: either a
/// plain convolution or a gated block.
#[derive(Module, Debug)]
pub enum ConvUnit<B: Backend> {
    Plain(Conv2d<B>),
    Gated(GatedBlock<B>),
}

impl<B: Backend> ConvUnit<B> {
    /// `Basic` maps to a plain convolution; `Partial` is not offered here.
    pub fn new(kind: ConvBlockKind, in_channels: usize, out_channels: usize, init: InitType, device: &B::Device) -> Result<Self> {
        match kind {
            ConvBlockKind::Basic => Ok(ConvUnit::Plain(conv3x3(in_channels, out_channels, init, device))),
            ConvBlockKind::Gated => Ok(ConvUnit::Gated(GatedBlock::new(in_channels, out_channels, true, init, device))),
            ConvBlockKind::Partial => Err(TrainError::InvalidMode {
                kind: "extraction/reweighting block",
                value: kind.to_string(),
            }),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        match self {
            ConvUnit::Plain(conv) => conv.forward(x),
            ConvUnit::Gated(block) => block.forward(x),
        }
    }
}

fn pool2x2<B: Backend>(mode: PoolingMode, x: Tensor<B, 4>) -> Tensor<B, 4> {
    match mode {
        PoolingMode::Avg => avg_pool2d(x, [2, 2], [2, 2], [0, 0], true),
        PoolingMode::Max => max_pool2d(x, [2, 2], [2, 2], [0, 0], [1, 1]),
    }
}

/// Pool by two, then a convolution block.
#[derive(Module, Debug)]
pub struct DownsampleBlock<B: Backend> {
    pooling: Ignored<PoolingMode>,
    conv: ConvBlock<B>,
}

impl<B: Backend> DownsampleBlock<B> {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        block: ConvBlockKind,
        pooling: PoolingMode,
        init: InitType,
        device: &B::Device,
    ) -> Self {
        Self {
            pooling: Ignored(pooling),
            conv: ConvBlock::new(block, in_channels, out_channels, true, init, device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.conv.forward(pool2x2(*self.pooling, x))
    }
}

/// Doubles the resolution of the lower stage, concatenates the skip
/// connection and fuses both with an unnormalized convolution block.
#[derive(Module, Debug)]
pub struct UpsampleBlock<B: Backend> {
    mode: Ignored<UpsampleMode>,
    /// Transposed convolution in `deconv` mode.
    deconv: Option<ConvTranspose2d<B>>,
    /// Convolution after interpolation in `bilinear`/`nearest` mode.
    resize_conv: Option<Conv2d<B>>,
    conv: ConvBlock<B>,
}

impl<B: Backend> UpsampleBlock<B> {
    /// `skip_channels` come from the downsampling path, `lower_channels`
    /// from the stage below.
    pub fn new(
        skip_channels: usize,
        lower_channels: usize,
        out_channels: usize,
        mode: UpsampleMode,
        block: ConvBlockKind,
        init: InitType,
        device: &B::Device,
    ) -> Self {
        let (deconv, resize_conv) = match mode {
            UpsampleMode::Deconv => (
                Some(
                    ConvTranspose2dConfig::new([lower_channels, out_channels], [4, 4])
                        .with_stride([2, 2])
                        .with_padding([1, 1])
                        .with_initializer(init.initializer())
                        .init(device),
                ),
                None,
            ),
            UpsampleMode::Bilinear | UpsampleMode::Nearest => {
                (None, Some(conv3x3(lower_channels, out_channels, init, device)))
            }
        };
        Self {
            mode: Ignored(mode),
            deconv,
            resize_conv,
            conv: ConvBlock::new(block, out_channels + skip_channels, out_channels, false, init, device),
        }
    }

    fn upsample(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        if let Some(deconv) = &self.deconv {
            return deconv.forward(x);
        }
        let [_, _, h, w] = x.dims();
        let mode = match *self.mode {
            UpsampleMode::Nearest => InterpolateMode::Nearest,
            _ => InterpolateMode::Bilinear,
        };
        let resized = interpolate(x, [h * 2, w * 2], InterpolateOptions::new(mode));
        match &self.resize_conv {
            Some(conv) => conv.forward(resized),
            None => resized,
        }
    }

    /// Fails when the upsampled size differs from the skip connection.
    pub fn forward(&self, lower: Tensor<B, 4>, skip: Tensor<B, 4>) -> Result<Tensor<B, 4>> {
        let up = self.upsample(lower);
        let [_, _, uh, uw] = up.dims();
        let [_, _, sh, sw] = skip.dims();
        if [uh, uw] != [sh, sw] {
            return Err(TrainError::shape(
                "upsampled stage vs skip connection",
                format!("{sh}x{sw}"),
                format!("{uh}x{uw}"),
            ));
        }
        Ok(self.conv.forward(Tensor::cat(vec![up, skip], 1)))
    }
}
