/// Feature flags selecting how the deformable convolution is lowered.
///
/// Both flags default to `false`, which is the registration state restored by
/// [`crate::registry::register_default`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExportOptions {
    /// Lower the bilinear sampling step with a single gather over the fully
    /// flattened input instead of the default row-wise gather. The flattened
    /// form expands sampling indices across channels and is kept for runtimes
    /// whose gather implementation only accepts one data axis.
    pub flat_gather: bool,

    /// Clamp sampling coordinates while they are still floating point and
    /// cast to integers afterwards. The default clamps after the cast; some
    /// backends lack integer `Clip`, so this patch moves the clamp in front
    /// of the `Cast`.
    pub clamp_before_cast: bool,
}

impl ExportOptions {
    pub const DEFAULT: Self = Self {
        flat_gather: false,
        clamp_before_cast: false,
    };

    pub const fn new(flat_gather: bool, clamp_before_cast: bool) -> Self {
        Self {
            flat_gather,
            clamp_before_cast,
        }
    }
}
