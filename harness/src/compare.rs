//! Elementwise tolerance comparison between the two engines.

/// Relative tolerance for the equivalence check.
pub const RTOL: f32 = 1e-3;
/// Absolute tolerance for the equivalence check.
pub const ATOL: f32 = 1e-5;

/// Outcome of comparing two flattened outputs.
#[derive(Debug, Clone)]
pub enum Comparison {
    Close,
    Mismatch {
        /// Elements outside tolerance.
        failures: usize,
        /// Flat index of the first failing element.
        first_index: usize,
        max_abs_diff: f32,
        max_rel_diff: f32,
    },
}

impl Comparison {
    pub fn is_close(&self) -> bool {
        matches!(self, Self::Close)
    }
}

/// Checks `|reference - candidate| <= ATOL + RTOL * |candidate|` elementwise.
///
/// Any non-finite element on either side counts as a failure; the comparison
/// never declares two NaNs equal.
pub fn allclose(reference: &[f32], candidate: &[f32]) -> Comparison {
    debug_assert_eq!(reference.len(), candidate.len());

    let mut failures = 0usize;
    let mut first_index = 0usize;
    let mut max_abs_diff = 0.0f32;
    let mut max_rel_diff = 0.0f32;

    for (idx, (&r, &c)) in reference.iter().zip(candidate.iter()).enumerate() {
        let abs_diff = (r - c).abs();
        let within = r.is_finite() && c.is_finite() && abs_diff <= ATOL + RTOL * c.abs();
        if !within {
            if failures == 0 {
                first_index = idx;
            }
            failures += 1;
        }
        if abs_diff.is_finite() {
            max_abs_diff = max_abs_diff.max(abs_diff);
            if c.abs() > 0.0 {
                max_rel_diff = max_rel_diff.max(abs_diff / c.abs());
            }
        } else {
            max_abs_diff = f32::INFINITY;
            max_rel_diff = f32::INFINITY;
        }
    }

    if failures == 0 {
        Comparison::Close
    } else {
        Comparison::Mismatch {
            failures,
            first_index,
            max_abs_diff,
            max_rel_diff,
        }
    }
}

/// One-line description of a mismatch for error reporting.
pub fn describe(comparison: &Comparison, total: usize) -> String {
    match comparison {
        Comparison::Close => "outputs within tolerance".to_string(),
        Comparison::Mismatch {
            failures,
            first_index,
            max_abs_diff,
            max_rel_diff,
        } => format!(
            "{failures}/{total} elements outside rtol={RTOL:e} atol={ATOL:e} \
             (first at flat index {first_index}, max abs diff {max_abs_diff:e}, \
             max rel diff {max_rel_diff:e})"
        ),
    }
}
