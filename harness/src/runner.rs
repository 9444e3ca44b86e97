//! End-to-end verification of a single configuration.
//!
//! One run generates inputs and parameters, executes the reference operator
//! on the `burn` ndarray backend, exports the equivalent ONNX model, replays
//! the same inputs through `candle_onnx`, and compares the two outputs
//! elementwise.

use std::collections::HashMap;

use burn::backend::ndarray::{NdArray, NdArrayDevice};
use candle::Device;
use rand::Rng;

use deform_conv2d_onnx_exporter::registry;
use deform_conv2d_onnx_exporter::ExportOptions;

use crate::artifact::Session;
use crate::compare::{allclose, describe};
use crate::config::DcnConfig;
use crate::error::{VerifyError, VerifyResult};
use crate::inputs::{InputBundle, TensorPayload};
use crate::model::ReferenceModel;

fn to_candle(payload: &TensorPayload) -> VerifyResult<candle::Tensor> {
    candle::Tensor::from_vec(payload.data.clone(), payload.dims.clone(), &Device::Cpu).map_err(
        |e| VerifyError::EngineFailure {
            stage: "candle input staging",
            message: format!("{e}"),
        },
    )
}

/// Verifies `config` with the process-registered lowering options.
pub fn run_case<R: Rng + ?Sized>(config: &DcnConfig, rng: &mut R) -> VerifyResult<()> {
    run_case_inner(config, rng, None)
}

/// Verifies `config` under explicit lowering options, bypassing the registry.
pub fn run_case_with<R: Rng + ?Sized>(
    config: &DcnConfig,
    options: ExportOptions,
    rng: &mut R,
) -> VerifyResult<()> {
    run_case_inner(config, rng, Some(options))
}

fn run_case_inner<R: Rng + ?Sized>(
    config: &DcnConfig,
    rng: &mut R,
    options: Option<ExportOptions>,
) -> VerifyResult<()> {
    tracing::info!(?config, "verifying configuration");
    let device = NdArrayDevice::default();

    let model = ReferenceModel::<NdArray>::new(config.clone(), rng, &device)?;
    let bundle = InputBundle::generate(config, rng);

    let reference =
        model.forward_payload(&bundle.input, &bundle.offset, bundle.mask.as_ref(), &device)?;
    tracing::debug!(elements = reference.len(), "reference output computed");

    let spec = model.to_export_spec()?;
    let bytes = match options {
        Some(options) => registry::export_with(&spec, options)?,
        None => registry::export_registered(&spec)?,
    };
    tracing::debug!(bytes = bytes.len(), "model exported");

    let session = Session::load(&bytes)?;
    let mut inputs = HashMap::from([
        ("input".to_string(), to_candle(&bundle.input)?),
        ("offset".to_string(), to_candle(&bundle.offset)?),
    ]);
    if let Some(mask) = &bundle.mask {
        inputs.insert("mask".to_string(), to_candle(mask)?);
    }
    let output = session.run(inputs)?;

    let expected_dims = [
        config.batch,
        config.output_ch,
        config.output_h,
        config.output_w,
    ];
    if output.dims() != expected_dims {
        return Err(VerifyError::Mismatch {
            config: Box::new(config.clone()),
            detail: format!(
                "output shape {:?} but {expected_dims:?} expected",
                output.dims()
            ),
        });
    }
    let candidate = output
        .flatten_all()
        .and_then(|t| t.to_vec1::<f32>())
        .map_err(|e| VerifyError::EngineFailure {
            stage: "candle readback",
            message: format!("{e}"),
        })?;

    let comparison = allclose(&reference, &candidate);
    if comparison.is_close() {
        tracing::info!("outputs match within tolerance");
        Ok(())
    } else {
        Err(VerifyError::Mismatch {
            config: Box::new(config.clone()),
            detail: describe(&comparison, reference.len()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DcnOverrides;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn tiny_overrides(use_mask: bool) -> DcnOverrides {
        DcnOverrides {
            batch: Some(2),
            input_ch: Some(6),
            input_h: Some(9),
            input_w: Some(8),
            output_ch: Some(4),
            kernel_h: Some(3),
            kernel_w: Some(2),
            stride_h: Some(2),
            stride_w: Some(1),
            padding_h: Some(1),
            padding_w: Some(0),
            dilation_h: Some(1),
            dilation_w: Some(2),
            groups: Some(2),
            offset_groups: Some(3),
            bias: Some(true),
            use_mask: Some(use_mask),
            ..Default::default()
        }
    }

    #[test]
    fn tiny_case_matches_with_mask() {
        let mut rng = StdRng::seed_from_u64(31);
        let config = DcnConfig::sample(&mut rng, &tiny_overrides(true)).unwrap();
        run_case_with(&config, ExportOptions::DEFAULT, &mut rng).unwrap();
    }

    #[test]
    fn tiny_case_matches_without_mask() {
        let mut rng = StdRng::seed_from_u64(37);
        let config = DcnConfig::sample(&mut rng, &tiny_overrides(false)).unwrap();
        run_case_with(&config, ExportOptions::DEFAULT, &mut rng).unwrap();
    }

    #[test]
    fn tiny_case_matches_under_flat_gather() {
        let mut rng = StdRng::seed_from_u64(41);
        let config = DcnConfig::sample(&mut rng, &tiny_overrides(true)).unwrap();
        run_case_with(&config, ExportOptions::new(true, false), &mut rng).unwrap();
    }

    #[test]
    fn tiny_case_matches_under_coordinate_clamp_patch() {
        let mut rng = StdRng::seed_from_u64(43);
        let config = DcnConfig::sample(&mut rng, &tiny_overrides(true)).unwrap();
        run_case_with(&config, ExportOptions::new(false, true), &mut rng).unwrap();
    }
}
