//! End-to-end equivalence scenarios between the `burn` reference operator
//! and the exported ONNX model evaluated by `candle_onnx`.

use anyhow::Result;
use rand::rngs::StdRng;
use rand::SeedableRng;

use deform_conv2d_onnx_exporter::{registry, ExportOptions};
use deform_conv2d_verify::{run_case, run_case_with, DcnConfig, DcnOverrides};

fn base_overrides() -> DcnOverrides {
    DcnOverrides {
        batch: Some(2),
        input_ch: Some(12),
        input_h: Some(32),
        input_w: Some(28),
        output_ch: Some(6),
        kernel_h: Some(3),
        kernel_w: Some(3),
        stride_h: Some(1),
        stride_w: Some(1),
        padding_h: Some(1),
        padding_w: Some(1),
        dilation_h: Some(1),
        dilation_w: Some(1),
        groups: Some(2),
        offset_groups: Some(3),
        bias: Some(true),
        use_mask: Some(true),
        ..Default::default()
    }
}

#[test]
fn padding_combinations_match() -> Result<()> {
    let mut rng = StdRng::seed_from_u64(100);
    for (padding_h, padding_w) in [(0, 2), (1, 0), (0, 0)] {
        let overrides = DcnOverrides {
            padding_h: Some(padding_h),
            padding_w: Some(padding_w),
            ..base_overrides()
        };
        let config = DcnConfig::sample(&mut rng, &overrides)?;
        run_case_with(&config, ExportOptions::DEFAULT, &mut rng)?;
    }
    Ok(())
}

#[test]
fn full_parameter_case_matches() -> Result<()> {
    let mut rng = StdRng::seed_from_u64(200);
    let overrides = DcnOverrides {
        batch: Some(8),
        input_ch: Some(64),
        input_h: Some(300),
        input_w: Some(200),
        output_ch: Some(4),
        output_w: Some(66),
        kernel_h: Some(3),
        kernel_w: Some(4),
        stride_h: Some(2),
        stride_w: Some(3),
        padding_h: Some(0),
        padding_w: Some(2),
        dilation_h: Some(1),
        dilation_w: Some(2),
        groups: Some(2),
        offset_groups: Some(2),
        bias: Some(true),
        use_mask: Some(true),
        ..Default::default()
    };
    let config = DcnConfig::sample(&mut rng, &overrides)?;
    assert_eq!(config.output_h, 149);
    run_case_with(&config, ExportOptions::DEFAULT, &mut rng)?;
    Ok(())
}

#[test]
fn random_configurations_match() -> Result<()> {
    use rand::Rng;

    let mut rng = StdRng::seed_from_u64(300);
    for case in 0..10 {
        // Spatial sizes come from the bottom of the sampling range to bound
        // the evaluator's working set; every other parameter is drawn freely.
        let overrides = DcnOverrides {
            input_h: Some(rng.random_range(100..121)),
            input_w: Some(rng.random_range(100..121)),
            ..Default::default()
        };
        let config = DcnConfig::sample(&mut rng, &overrides)?;
        run_case_with(&config, ExportOptions::DEFAULT, &mut rng)
            .map_err(|e| anyhow::anyhow!("case {case}: {e}"))?;
    }
    Ok(())
}

#[test]
fn exporter_option_matrix_matches() -> Result<()> {
    let mut rng = StdRng::seed_from_u64(400);
    let config = DcnConfig::sample(&mut rng, &base_overrides())?;

    for flat_gather in [false, true] {
        for clamp_before_cast in [false, true] {
            let _guard =
                registry::register_scoped(ExportOptions::new(flat_gather, clamp_before_cast));
            run_case(&config, &mut rng).map_err(|e| {
                anyhow::anyhow!("flat_gather={flat_gather} clamp_before_cast={clamp_before_cast}: {e}")
            })?;
        }
    }
    assert_eq!(registry::registered(), ExportOptions::DEFAULT);
    Ok(())
}
