use crate::error::{ExportError, ExportResult};

/// Description of one deformable convolution instance to translate.
///
/// The exporter works from concrete shapes: the graph it emits is traced for a
/// fixed batch and spatial size, like the sample-input export flow of the
/// framework exporters it mirrors.
#[derive(Debug, Clone, PartialEq)]
pub struct DeformConv2dSpec {
    pub batch: usize,
    pub in_channels: usize,
    pub in_height: usize,
    pub in_width: usize,
    pub out_channels: usize,
    /// Kernel size as `[height, width]`.
    pub kernel: [usize; 2],
    pub stride: [usize; 2],
    pub padding: [usize; 2],
    pub dilation: [usize; 2],
    pub weight_groups: usize,
    pub offset_groups: usize,
    /// Whether the translated graph takes a modulation mask input. When
    /// `false` the graph has exactly two inputs, `input` and `offset`.
    pub use_mask: bool,
    /// Convolution weight, `[out_channels, in_channels / weight_groups, kh, kw]`,
    /// row-major.
    pub weight: Vec<f32>,
    /// Optional bias, `[out_channels]`.
    pub bias: Option<Vec<f32>>,
}

/// Standard convolution output size for one spatial dimension.
pub fn conv_output_size(
    input: usize,
    padding: usize,
    dilation: usize,
    kernel: usize,
    stride: usize,
) -> usize {
    (input + 2 * padding - dilation * (kernel - 1) - 1) / stride + 1
}

impl DeformConv2dSpec {
    /// Output spatial size as `[height, width]`.
    pub fn out_dims(&self) -> [usize; 2] {
        [
            conv_output_size(
                self.in_height,
                self.padding[0],
                self.dilation[0],
                self.kernel[0],
                self.stride[0],
            ),
            conv_output_size(
                self.in_width,
                self.padding[1],
                self.dilation[1],
                self.kernel[1],
                self.stride[1],
            ),
        ]
    }

    pub fn validate(&self) -> ExportResult<()> {
        let invalid = |reason: String| ExportError::InvalidSpec { reason };
        if self.batch == 0 || self.in_channels == 0 || self.out_channels == 0 {
            return Err(invalid("batch and channel counts must be non-zero".into()));
        }
        if self.in_height == 0 || self.in_width == 0 {
            return Err(invalid(format!(
                "input size {}x{} must be non-zero",
                self.in_height, self.in_width
            )));
        }
        for (name, pair) in [
            ("kernel", self.kernel),
            ("stride", self.stride),
            ("dilation", self.dilation),
        ] {
            if pair[0] == 0 || pair[1] == 0 {
                return Err(invalid(format!("{name} must be non-zero, got {pair:?}")));
            }
        }
        if self.weight_groups == 0 || self.in_channels % self.weight_groups != 0 {
            return Err(invalid(format!(
                "weight_groups {} must divide in_channels {}",
                self.weight_groups, self.in_channels
            )));
        }
        if self.out_channels % self.weight_groups != 0 {
            return Err(invalid(format!(
                "weight_groups {} must divide out_channels {}",
                self.weight_groups, self.out_channels
            )));
        }
        if self.offset_groups == 0 || self.in_channels % self.offset_groups != 0 {
            return Err(invalid(format!(
                "offset_groups {} must divide in_channels {}",
                self.offset_groups, self.in_channels
            )));
        }
        let [kh, kw] = self.kernel;
        let reach_h = self.dilation[0] * (kh - 1) + 1;
        let reach_w = self.dilation[1] * (kw - 1) + 1;
        if self.in_height + 2 * self.padding[0] < reach_h
            || self.in_width + 2 * self.padding[1] < reach_w
        {
            return Err(invalid(format!(
                "effective kernel {reach_h}x{reach_w} exceeds padded input {}x{}",
                self.in_height + 2 * self.padding[0],
                self.in_width + 2 * self.padding[1]
            )));
        }

        let expected_weight = self.out_channels * (self.in_channels / self.weight_groups) * kh * kw;
        if self.weight.len() != expected_weight {
            return Err(ExportError::ParameterSizeMismatch {
                name: "weight",
                expected: expected_weight,
                actual: self.weight.len(),
            });
        }
        if let Some(bias) = &self.bias {
            if bias.len() != self.out_channels {
                return Err(ExportError::ParameterSizeMismatch {
                    name: "bias",
                    expected: self.out_channels,
                    actual: bias.len(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_spec() -> DeformConv2dSpec {
        DeformConv2dSpec {
            batch: 1,
            in_channels: 4,
            in_height: 8,
            in_width: 8,
            out_channels: 6,
            kernel: [3, 3],
            stride: [1, 1],
            padding: [1, 1],
            dilation: [1, 1],
            weight_groups: 2,
            offset_groups: 2,
            use_mask: true,
            weight: vec![0.0; 6 * 2 * 3 * 3],
            bias: Some(vec![0.0; 6]),
        }
    }

    #[test]
    fn valid_spec_passes() {
        assert!(small_spec().validate().is_ok());
    }

    #[test]
    fn output_dims_follow_conv_formula() {
        let spec = small_spec();
        assert_eq!(spec.out_dims(), [8, 8]);

        let mut strided = small_spec();
        strided.stride = [2, 2];
        strided.padding = [0, 0];
        // (8 + 0 - 1*(3-1) - 1) / 2 + 1 = 3
        assert_eq!(strided.out_dims(), [3, 3]);
    }

    #[test]
    fn group_divisibility_is_enforced() {
        let mut spec = small_spec();
        spec.weight_groups = 3;
        match spec.validate() {
            Err(ExportError::InvalidSpec { reason }) => {
                assert!(reason.contains("weight_groups"));
            }
            other => panic!("expected InvalidSpec, got {other:?}"),
        }
    }

    #[test]
    fn zero_spatial_input_is_rejected() {
        // Padding alone can cover the kernel reach, but an empty input has no
        // last row or column to clamp gather indices to.
        let mut spec = small_spec();
        spec.in_width = 0;
        match spec.validate() {
            Err(ExportError::InvalidSpec { reason }) => {
                assert!(reason.contains("non-zero"), "{reason}");
            }
            other => panic!("expected InvalidSpec, got {other:?}"),
        }
    }

    #[test]
    fn weight_length_is_enforced() {
        let mut spec = small_spec();
        spec.weight.pop();
        match spec.validate() {
            Err(ExportError::ParameterSizeMismatch { name, .. }) => assert_eq!(name, "weight"),
            other => panic!("expected ParameterSizeMismatch, got {other:?}"),
        }
    }
}
