//! Image reconstruction losses
//!
//! Every batch reports all losses; the configured one is optimized.

use crate::error::{Result, TrainError};
use burn::nn::loss::{MseLoss, Reduction};
use burn::tensor::backend::Backend;
use burn::tensor::module::conv2d;
use burn::tensor::ops::ConvOptions;
use burn::tensor::{Tensor, TensorData};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

const SSIM_WINDOW: usize = 11;
const SSIM_SIGMA: f32 = 1.5;
const SSIM_C1: f32 = 0.01 * 0.01;
const SSIM_C2: f32 = 0.03 * 0.03;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LossKind {
    Mse,
    L1,
    #[default]
    Ssim,
}

impl LossKind {
    pub const ALL: [LossKind; 3] = [LossKind::Mse, LossKind::L1, LossKind::Ssim];

    pub fn as_str(&self) -> &'static str {
        match self {
            LossKind::Mse => "MSE",
            LossKind::L1 => "L1",
            LossKind::Ssim => "SSIM",
        }
    }

    /// Scalar loss between a rendered batch and its ground truth, both `[B, C, H, W]`.
    pub fn compute<B: Backend>(&self, rendered: Tensor<B, 4>, groundtruth: Tensor<B, 4>) -> Tensor<B, 1> {
        match self {
            LossKind::Mse => MseLoss::new().forward(rendered, groundtruth, Reduction::Mean),
            LossKind::L1 => (rendered - groundtruth).abs().mean(),
            LossKind::Ssim => ssim(rendered, groundtruth).neg().add_scalar(1.0),
        }
    }
}

impl std::fmt::Display for LossKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LossKind {
    type Err = TrainError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "MSE" => Ok(LossKind::Mse),
            "L1" => Ok(LossKind::L1),
            "SSIM" => Ok(LossKind::Ssim),
            _ => Err(TrainError::InvalidMode {
                kind: "loss function",
                value: s.to_string(),
            }),
        }
    }
}

/// All losses of one batch; `optimized` is the configured one.
pub struct BatchLosses<B: Backend> {
    pub optimized: Tensor<B, 1>,
    pub values: BTreeMap<LossKind, f64>,
}

pub fn compute_losses<B: Backend>(
    optimized: LossKind,
    rendered: Tensor<B, 4>,
    groundtruth: Tensor<B, 4>,
) -> Result<BatchLosses<B>> {
    let (rd, gd) = (rendered.dims(), groundtruth.dims());
    if rd != gd {
        return Err(TrainError::shape("rendered vs ground truth", format!("{gd:?}"), format!("{rd:?}")));
    }

    let mut values = BTreeMap::new();
    let mut target = None;
    for kind in LossKind::ALL {
        let loss = kind.compute(rendered.clone(), groundtruth.clone());
        values.insert(kind, scalar(&loss)?);
        if kind == optimized {
            target = Some(loss);
        }
    }
    let optimized = target.ok_or_else(|| TrainError::Config(format!("loss {optimized} is not computed")))?;
    Ok(BatchLosses { optimized, values })
}

pub(crate) fn scalar<B: Backend>(tensor: &Tensor<B, 1>) -> Result<f64> {
    tensor
        .clone()
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| TrainError::TensorData(format!("{e:?}")))?
        .first()
        .map(|v| *v as f64)
        .ok_or_else(|| TrainError::TensorData("empty loss tensor".into()))
}

/// Per-epoch loss sums.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LossTracker {
    sums: BTreeMap<LossKind, f64>,
    batches: usize,
}

impl LossTracker {
    pub fn add(&mut self, values: &BTreeMap<LossKind, f64>) {
        for (kind, value) in values {
            *self.sums.entry(*kind).or_default() += value;
        }
        self.batches += 1;
    }

    pub fn batches(&self) -> usize {
        self.batches
    }

    /// Sum of one loss over all batches.
    pub fn summed(&self, kind: LossKind) -> f64 {
        self.sums.get(&kind).copied().unwrap_or(0.0)
    }

    /// Mean per batch of every loss.
    pub fn averages(&self) -> BTreeMap<LossKind, f64> {
        let n = self.batches.max(1) as f64;
        self.sums.iter().map(|(k, v)| (*k, v / n)).collect()
    }
}

fn gaussian_window<B: Backend>(channels: usize, device: &B::Device) -> Tensor<B, 4> {
    let center = (SSIM_WINDOW / 2) as f32;
    let profile: Vec<f32> = (0..SSIM_WINDOW)
        .map(|i| (-((i as f32 - center).powi(2)) / (2.0 * SSIM_SIGMA * SSIM_SIGMA)).exp())
        .collect();
    let total: f32 = profile.iter().sum();
    let profile: Vec<f32> = profile.iter().map(|v| v / total).collect();

    let mut window = Vec::with_capacity(channels * SSIM_WINDOW * SSIM_WINDOW);
    for _ in 0..channels {
        for y in &profile {
            window.extend(profile.iter().map(|x| x * y));
        }
    }
    Tensor::from_data(
        TensorData::new(window, [channels, 1, SSIM_WINDOW, SSIM_WINDOW]),
        device,
    )
}

/// Mean structural similarity with an 11x11 Gaussian window (sigma 1.5),
/// computed per channel with zero padding.
pub fn ssim<B: Backend>(a: Tensor<B, 4>, b: Tensor<B, 4>) -> Tensor<B, 1> {
    let channels = a.dims()[1];
    let window = gaussian_window::<B>(channels, &a.device());
    let pad = SSIM_WINDOW / 2;
    let blur = |x: Tensor<B, 4>| {
        conv2d(
            x,
            window.clone(),
            None,
            ConvOptions::new([1, 1], [pad, pad], [1, 1], channels),
        )
    };

    let mu_a = blur(a.clone());
    let mu_b = blur(b.clone());
    let mu_a_sq = mu_a.clone() * mu_a.clone();
    let mu_b_sq = mu_b.clone() * mu_b.clone();
    let mu_ab = mu_a * mu_b;

    let sigma_a_sq = blur(a.clone() * a.clone()) - mu_a_sq.clone();
    let sigma_b_sq = blur(b.clone() * b.clone()) - mu_b_sq.clone();
    let sigma_ab = blur(a * b) - mu_ab.clone();

    let numerator = mu_ab.mul_scalar(2.0).add_scalar(SSIM_C1) * sigma_ab.mul_scalar(2.0).add_scalar(SSIM_C2);
    let denominator = (mu_a_sq + mu_b_sq).add_scalar(SSIM_C1) * (sigma_a_sq + sigma_b_sq).add_scalar(SSIM_C2);
    (numerator / denominator).mean()
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray<f32>;

    fn image(seed_shift: f64) -> Tensor<TestBackend, 4> {
        Tensor::<TestBackend, 4>::random([1, 3, 16, 16], Distribution::Uniform(0.0, 1.0), &Default::default())
            .mul_scalar(0.5)
            .add_scalar(seed_shift)
    }

    #[test]
    fn test_identical_images_have_zero_loss() {
        let x = image(0.0);
        for kind in LossKind::ALL {
            let loss = scalar(&kind.compute(x.clone(), x.clone())).unwrap();
            assert!(loss.abs() < 1e-5, "{kind}: {loss}");
        }
    }

    #[test]
    fn test_known_pixel_losses() {
        let device = Default::default();
        let a = Tensor::<TestBackend, 4>::zeros([1, 1, 2, 2], &device);
        let b = Tensor::<TestBackend, 4>::ones([1, 1, 2, 2], &device).mul_scalar(0.5);
        assert!((scalar(&LossKind::Mse.compute(a.clone(), b.clone())).unwrap() - 0.25).abs() < 1e-6);
        assert!((scalar(&LossKind::L1.compute(a, b)).unwrap() - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_ssim_drops_for_different_images() {
        let a = image(0.0);
        let b = image(0.5);
        let loss = scalar(&LossKind::Ssim.compute(a, b)).unwrap();
        assert!(loss > 0.01 && loss <= 2.0);
    }

    #[test]
    fn test_compute_losses_reports_all() {
        let losses = compute_losses(LossKind::L1, image(0.0), image(0.1)).unwrap();
        assert_eq!(losses.values.len(), 3);
        let optimized = scalar(&losses.optimized).unwrap();
        assert!((optimized - losses.values[&LossKind::L1]).abs() < 1e-6);
        assert!(compute_losses(LossKind::L1, image(0.0), Tensor::zeros([1, 3, 8, 8], &Default::default())).is_err());
    }

    #[test]
    fn test_loss_names() {
        assert_eq!("ssim".parse::<LossKind>().unwrap(), LossKind::Ssim);
        assert_eq!("MSE".parse::<LossKind>().unwrap(), LossKind::Mse);
        assert!("VGG".parse::<LossKind>().is_err());
        assert_eq!(serde_json::to_string(&LossKind::L1).unwrap(), "\"L1\"");
    }

    #[test]
    fn test_tracker_sums_and_averages() {
        let mut tracker = LossTracker::default();
        tracker.add(&BTreeMap::from([(LossKind::Mse, 1.0)]));
        tracker.add(&BTreeMap::from([(LossKind::Mse, 3.0)]));
        assert_eq!(tracker.batches(), 2);
        assert_eq!(tracker.summed(LossKind::Mse), 4.0);
        assert_eq!(tracker.averages()[&LossKind::Mse], 2.0);
    }
}
