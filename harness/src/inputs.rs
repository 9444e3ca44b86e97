//! Random input generation shared by both engines.

use rand::Rng;
use rand_distr::StandardNormal;

use crate::config::DcnConfig;

/// A dense row-major `f32` tensor detached from either engine.
#[derive(Debug, Clone)]
pub struct TensorPayload {
    pub data: Vec<f32>,
    pub dims: Vec<usize>,
}

impl TensorPayload {
    pub fn len(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The activation inputs for one verification case.
///
/// Both engines consume the exact same buffers, so any output divergence is
/// attributable to the translation rather than to the stimulus.
#[derive(Debug, Clone)]
pub struct InputBundle {
    pub input: TensorPayload,
    pub offset: TensorPayload,
    pub mask: Option<TensorPayload>,
}

impl InputBundle {
    /// Draws the input, offset and (when enabled) mask tensors.
    ///
    /// The input and mask are uniform on `[0, 1)`. Offsets are standard
    /// normal scaled by the kernel width, which keeps most sampling points
    /// within a few taps of their integer grid position while still
    /// exercising the out-of-bounds paths.
    pub fn generate<R: Rng + ?Sized>(config: &DcnConfig, rng: &mut R) -> Self {
        let uniform = |rng: &mut R, dims: Vec<usize>| {
            let len = dims.iter().product();
            let data = (0..len).map(|_| rng.random::<f32>()).collect();
            TensorPayload { data, dims }
        };

        let input = uniform(
            rng,
            vec![config.batch, config.input_ch, config.input_h, config.input_w],
        );

        let offset_dims = vec![
            config.batch,
            config.offset_channels(),
            config.output_h,
            config.output_w,
        ];
        let scale = config.kernel_w as f32;
        let offset_data = (0..offset_dims.iter().product())
            .map(|_| {
                let z: f32 = rng.sample(StandardNormal);
                z * scale
            })
            .collect();
        let offset = TensorPayload {
            data: offset_data,
            dims: offset_dims,
        };

        let mask = config.use_mask.then(|| {
            uniform(
                rng,
                vec![
                    config.batch,
                    config.mask_channels(),
                    config.output_h,
                    config.output_w,
                ],
            )
        });

        Self {
            input,
            offset,
            mask,
        }
    }
}
