//! Inference export
//!
//! An export is a pair of files sharing one stem: `{stem}.mpk` holds the
//! parameters in half precision, `{stem}.json` the architecture and the input
//! and output shapes the network was validated with.

use crate::error::{Result, TrainError};
use crate::model::{InputShapes, Model, ModelKind, NetworkInput, NprNetwork};
use burn::module::Module;
use burn::record::{HalfPrecisionSettings, NamedMpkFileRecorder};
use burn::tensor::backend::Backend;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportSignature {
    pub model: ModelKind,
    pub inputs: InputShapes,
    pub output: [usize; 4],
}

fn signature_path(stem: &Path) -> PathBuf {
    stem.with_extension("json")
}

/// Runs `example` through the network and writes the export next to `stem`.
#[tracing::instrument(skip_all, fields(stem = %stem.display()))]
pub fn export_network<B: Backend>(
    model: &NprNetwork<B>,
    example: NetworkInput<B>,
    stem: &Path,
) -> Result<ExportSignature> {
    let inputs = example.shapes();
    let output = model.forward(example)?.dims();
    let signature = ExportSignature {
        model: model.kind(),
        inputs,
        output,
    };

    if let Some(parent) = stem.parent() {
        std::fs::create_dir_all(parent).map_err(|e| TrainError::io(parent, e))?;
    }
    let recorder = NamedMpkFileRecorder::<HalfPrecisionSettings>::new();
    model.clone().save_file(stem, &recorder)?;
    let json = serde_json::to_string_pretty(&signature)?;
    let path = signature_path(stem);
    std::fs::write(&path, json).map_err(|e| TrainError::io(&path, e))?;

    info!(output = ?signature.output, "exported network");
    Ok(signature)
}

/// Loads an export written by [`export_network`].
pub fn load_exported<B: Backend>(stem: &Path, device: &B::Device) -> Result<(NprNetwork<B>, ExportSignature)> {
    let path = signature_path(stem);
    let json = std::fs::read_to_string(&path).map_err(|e| TrainError::io(&path, e))?;
    let signature: ExportSignature = serde_json::from_str(&json)?;
    let recorder = NamedMpkFileRecorder::<HalfPrecisionSettings>::new();
    let model = signature
        .model
        .init::<B>(device)?
        .load_file(stem, &recorder, device)?;
    Ok((model, signature))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{ConvBlockKind, InovisConfig};
    use burn::backend::NdArray;
    use burn::tensor::Tensor;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_export_and_reload() {
        let device = Default::default();
        let dir = tempfile::tempdir().unwrap();
        let kind = ModelKind::Inovis(InovisConfig {
            in_channels_current: vec![4],
            feature_amount_current: 4,
            feature_amount_gt: 4,
            in_gt_frame_amount: 1,
            feature_scale: 8,
            fe_current_filter_base: 4,
            fe_gt_filter_base: 4,
            conv_block_reconstruction: ConvBlockKind::Basic,
            ..Default::default()
        });
        let model = kind.init::<TestBackend>(&device).unwrap();
        let example = NetworkInput {
            current: vec![Tensor::ones([1, 4, 16, 16], &device)],
            previous: vec![Tensor::ones([1, 4, 16, 16], &device)],
            movecs: vec![Tensor::zeros([1, 2, 16, 16], &device)],
        };

        let stem = dir.path().join("export").join("network");
        let signature = export_network(&model, example, &stem).unwrap();
        assert_eq!(signature.output, [1, 3, 16, 16]);
        assert_eq!(signature.inputs.current, vec![[1, 4, 16, 16]]);
        assert!(stem.with_extension("mpk").is_file());

        let (_, reloaded) = load_exported::<TestBackend>(&stem, &device).unwrap();
        assert_eq!(reloaded, signature);
    }

    #[test]
    fn test_invalid_example_is_rejected() {
        let device = Default::default();
        let dir = tempfile::tempdir().unwrap();
        let model = ModelKind::default().init::<TestBackend>(&device).unwrap();
        let example = NetworkInput {
            current: vec![Tensor::ones([1, 4, 16, 16], &device)],
            previous: Vec::new(),
            movecs: Vec::new(),
        };
        assert!(export_network(&model, example, &dir.path().join("network")).is_err());
        assert!(!dir.path().join("network.json").exists());
    }
}
