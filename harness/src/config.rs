//! Deformable convolution configuration records and their sampler.

use deform_conv2d_onnx_exporter::conv_output_size;
use rand::Rng;

use crate::error::{VerifyError, VerifyResult};

/// One fully specified deformable convolution instance.
///
/// Construction goes through [`DcnConfig::sample`] (or a literal followed by
/// [`DcnConfig::validate`]), which enforces the dimension invariants: output
/// sizes must match the convolution output formula and the input channel
/// count must be a multiple of `lcm(groups, offset_groups)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DcnConfig {
    pub batch: usize,
    pub input_ch: usize,
    pub input_h: usize,
    pub input_w: usize,
    pub output_ch: usize,
    pub output_h: usize,
    pub output_w: usize,
    pub kernel_h: usize,
    pub kernel_w: usize,
    pub stride_h: usize,
    pub stride_w: usize,
    pub padding_h: usize,
    pub padding_w: usize,
    pub dilation_h: usize,
    pub dilation_w: usize,
    pub groups: usize,
    pub offset_groups: usize,
    pub bias: bool,
    pub use_mask: bool,
}

/// Partial configuration taking precedence over randomized defaults.
#[derive(Debug, Clone, Default)]
pub struct DcnOverrides {
    pub batch: Option<usize>,
    pub input_ch: Option<usize>,
    pub input_h: Option<usize>,
    pub input_w: Option<usize>,
    pub output_ch: Option<usize>,
    pub output_h: Option<usize>,
    pub output_w: Option<usize>,
    pub kernel_h: Option<usize>,
    pub kernel_w: Option<usize>,
    pub stride_h: Option<usize>,
    pub stride_w: Option<usize>,
    pub padding_h: Option<usize>,
    pub padding_w: Option<usize>,
    pub dilation_h: Option<usize>,
    pub dilation_w: Option<usize>,
    pub groups: Option<usize>,
    pub offset_groups: Option<usize>,
    pub bias: Option<bool>,
    pub use_mask: Option<bool>,
}

fn gcd(a: usize, b: usize) -> usize {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

fn lcm(a: usize, b: usize) -> usize {
    a / gcd(a, b) * b
}

/// [`conv_output_size`] that reports impossible geometry instead of
/// underflowing.
fn checked_output_size(
    input: usize,
    padding: usize,
    dilation: usize,
    kernel: usize,
    stride: usize,
) -> Option<usize> {
    let reach = dilation.checked_mul(kernel.checked_sub(1)?)?.checked_add(1)?;
    if input + 2 * padding < reach {
        return None;
    }
    Some(conv_output_size(input, padding, dilation, kernel, stride))
}

impl DcnConfig {
    /// Draws a configuration, honoring `overrides` where present.
    ///
    /// Dependent fields follow the source operator's conventions when not
    /// overridden: `input_ch` is a random multiple of
    /// `lcm(groups, offset_groups)`, `output_ch` a random multiple of
    /// `groups`, and the output sizes come from the convolution formula.
    pub fn sample<R: Rng + ?Sized>(rng: &mut R, overrides: &DcnOverrides) -> VerifyResult<Self> {
        let o = overrides;
        let batch = o.batch.unwrap_or_else(|| rng.random_range(1..6));
        let input_h = o.input_h.unwrap_or_else(|| rng.random_range(100..201));
        let input_w = o.input_w.unwrap_or_else(|| rng.random_range(100..201));
        let kernel_h = o.kernel_h.unwrap_or_else(|| rng.random_range(1..8));
        let kernel_w = o.kernel_w.unwrap_or_else(|| rng.random_range(1..8));
        let stride_h = o.stride_h.unwrap_or_else(|| rng.random_range(1..5));
        let stride_w = o.stride_w.unwrap_or_else(|| rng.random_range(1..5));
        let padding_h = o.padding_h.unwrap_or_else(|| rng.random_range(0..5));
        let padding_w = o.padding_w.unwrap_or_else(|| rng.random_range(0..5));
        let dilation_h = o.dilation_h.unwrap_or_else(|| rng.random_range(1..4));
        let dilation_w = o.dilation_w.unwrap_or_else(|| rng.random_range(1..4));
        let groups = o.groups.unwrap_or_else(|| rng.random_range(1..4));
        let offset_groups = o.offset_groups.unwrap_or_else(|| rng.random_range(1..4));
        let bias = o.bias.unwrap_or_else(|| rng.random_bool(0.5));
        let use_mask = o.use_mask.unwrap_or_else(|| rng.random_bool(0.5));

        let input_ch = o
            .input_ch
            .unwrap_or_else(|| lcm(groups, offset_groups) * rng.random_range(1..17));
        let output_ch = o
            .output_ch
            .unwrap_or_else(|| groups * rng.random_range(1..17));

        let impossible = |axis: &str| VerifyError::InvalidConfiguration {
            reason: format!("effective kernel exceeds padded input along {axis}"),
        };
        let output_h = match o.output_h {
            Some(v) => v,
            None => checked_output_size(input_h, padding_h, dilation_h, kernel_h, stride_h)
                .ok_or_else(|| impossible("height"))?,
        };
        let output_w = match o.output_w {
            Some(v) => v,
            None => checked_output_size(input_w, padding_w, dilation_w, kernel_w, stride_w)
                .ok_or_else(|| impossible("width"))?,
        };

        let config = Self {
            batch,
            input_ch,
            input_h,
            input_w,
            output_ch,
            output_h,
            output_w,
            kernel_h,
            kernel_w,
            stride_h,
            stride_w,
            padding_h,
            padding_w,
            dilation_h,
            dilation_w,
            groups,
            offset_groups,
            bias,
            use_mask,
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks the dimension-consistency invariants.
    pub fn validate(&self) -> VerifyResult<()> {
        let invalid = |reason: String| VerifyError::InvalidConfiguration { reason };
        for (name, value) in [
            ("batch", self.batch),
            ("input_ch", self.input_ch),
            ("input_h", self.input_h),
            ("input_w", self.input_w),
            ("output_ch", self.output_ch),
            ("kernel_h", self.kernel_h),
            ("kernel_w", self.kernel_w),
            ("stride_h", self.stride_h),
            ("stride_w", self.stride_w),
            ("dilation_h", self.dilation_h),
            ("dilation_w", self.dilation_w),
            ("groups", self.groups),
            ("offset_groups", self.offset_groups),
        ] {
            if value == 0 {
                return Err(invalid(format!("{name} must be non-zero")));
            }
        }

        let channel_unit = lcm(self.groups, self.offset_groups);
        if self.input_ch % channel_unit != 0 {
            return Err(invalid(format!(
                "input_ch {} must be a multiple of lcm(groups, offset_groups) = {channel_unit}",
                self.input_ch
            )));
        }
        if self.output_ch % self.groups != 0 {
            return Err(invalid(format!(
                "output_ch {} must be a multiple of groups {}",
                self.output_ch, self.groups
            )));
        }

        for (axis, input, padding, dilation, kernel, stride, output) in [
            (
                "height",
                self.input_h,
                self.padding_h,
                self.dilation_h,
                self.kernel_h,
                self.stride_h,
                self.output_h,
            ),
            (
                "width",
                self.input_w,
                self.padding_w,
                self.dilation_w,
                self.kernel_w,
                self.stride_w,
                self.output_w,
            ),
        ] {
            match checked_output_size(input, padding, dilation, kernel, stride) {
                None => {
                    return Err(invalid(format!(
                        "effective kernel exceeds padded input along {axis}"
                    )))
                }
                Some(expected) if expected != output => {
                    return Err(invalid(format!(
                        "output {axis} {output} does not match the convolution formula ({expected})"
                    )))
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Channel count of the `offset` input, `2 * offset_groups * kh * kw`.
    pub fn offset_channels(&self) -> usize {
        2 * self.offset_groups * self.kernel_h * self.kernel_w
    }

    /// Channel count of the `mask` input, `offset_groups * kh * kw`.
    pub fn mask_channels(&self) -> usize {
        self.offset_groups * self.kernel_h * self.kernel_w
    }
}
