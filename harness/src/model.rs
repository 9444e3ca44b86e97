//! Reference execution of the deformable convolution on the `burn` ndarray
//! backend.

use burn::prelude::*;
use burn::tensor::module::deform_conv2d;
use burn::tensor::ops::DeformConvOptions;
use rand::Rng;

use deform_conv2d_onnx_exporter::DeformConv2dSpec;

use crate::config::DcnConfig;
use crate::error::{VerifyError, VerifyResult};
use crate::inputs::TensorPayload;

/// A deformable convolution with fixed, randomly initialized parameters.
///
/// The weight and optional bias live on the reference backend; the same
/// buffers are handed to the translation via [`ReferenceModel::to_export_spec`]
/// so both engines compute with identical parameters.
pub struct ReferenceModel<B: Backend> {
    config: DcnConfig,
    weight: Tensor<B, 4>,
    bias: Option<Tensor<B, 1>>,
}

impl<B: Backend> ReferenceModel<B> {
    /// Builds a model for `config`, drawing parameters from `rng`.
    ///
    /// Weights are uniform on `(-1/sqrt(fan_in), 1/sqrt(fan_in))`, the usual
    /// convolution initialization.
    pub fn new<R: Rng + ?Sized>(
        config: DcnConfig,
        rng: &mut R,
        device: &B::Device,
    ) -> VerifyResult<Self> {
        config.validate()?;

        let fan_in = config.input_ch / config.groups * config.kernel_h * config.kernel_w;
        let bound = 1.0 / (fan_in as f32).sqrt();
        let mut draw = |len: usize| -> Vec<f32> {
            (0..len).map(|_| rng.random_range(-bound..bound)).collect()
        };

        let weight_shape = [
            config.output_ch,
            config.input_ch / config.groups,
            config.kernel_h,
            config.kernel_w,
        ];
        let weight = Tensor::from_data(
            TensorData::new(draw(weight_shape.iter().product()), weight_shape),
            device,
        );
        let bias = config.bias.then(|| {
            Tensor::from_data(
                TensorData::new(draw(config.output_ch), [config.output_ch]),
                device,
            )
        });

        Ok(Self {
            config,
            weight,
            bias,
        })
    }

    pub fn config(&self) -> &DcnConfig {
        &self.config
    }

    /// Runs the reference operator.
    pub fn forward(
        &self,
        input: Tensor<B, 4>,
        offset: Tensor<B, 4>,
        mask: Option<Tensor<B, 4>>,
    ) -> Tensor<B, 4> {
        deform_conv2d(
            input,
            offset,
            self.weight.clone(),
            mask,
            self.bias.clone(),
            DeformConvOptions {
                stride: [self.config.stride_h, self.config.stride_w],
                padding: [self.config.padding_h, self.config.padding_w],
                dilation: [self.config.dilation_h, self.config.dilation_w],
                weight_groups: self.config.groups,
                offset_groups: self.config.offset_groups,
            },
        )
    }

    /// Runs the reference operator on host buffers and returns the flattened
    /// row-major output.
    pub fn forward_payload(
        &self,
        input: &TensorPayload,
        offset: &TensorPayload,
        mask: Option<&TensorPayload>,
        device: &B::Device,
    ) -> VerifyResult<Vec<f32>> {
        let to_tensor = |payload: &TensorPayload| -> Tensor<B, 4> {
            Tensor::from_data(
                TensorData::new(payload.data.clone(), payload.dims.clone()),
                device,
            )
        };
        let output = self.forward(
            to_tensor(input),
            to_tensor(offset),
            mask.map(to_tensor),
        );
        output
            .into_data()
            .to_vec::<f32>()
            .map_err(|e| VerifyError::EngineFailure {
                stage: "reference readback",
                message: format!("{e:?}"),
            })
    }

    /// Extracts the parameters into the exporter's host-side description.
    pub fn to_export_spec(&self) -> VerifyResult<DeformConv2dSpec> {
        let readback = |data: TensorData, name: &'static str| -> VerifyResult<Vec<f32>> {
            data.to_vec::<f32>().map_err(|e| VerifyError::EngineFailure {
                stage: name,
                message: format!("{e:?}"),
            })
        };
        let weight = readback(self.weight.to_data(), "weight readback")?;
        let bias = match &self.bias {
            Some(b) => Some(readback(b.to_data(), "bias readback")?),
            None => None,
        };

        let c = &self.config;
        Ok(DeformConv2dSpec {
            batch: c.batch,
            in_channels: c.input_ch,
            in_height: c.input_h,
            in_width: c.input_w,
            out_channels: c.output_ch,
            kernel: [c.kernel_h, c.kernel_w],
            stride: [c.stride_h, c.stride_w],
            padding: [c.padding_h, c.padding_w],
            dilation: [c.dilation_h, c.dilation_w],
            weight_groups: c.groups,
            offset_groups: c.offset_groups,
            use_mask: c.use_mask,
            weight,
            bias,
        })
    }
}
