//! Process-wide registration of the lowering options.
//!
//! Registration replaces whatever was registered before and is idempotent.
//! [`register_scoped`] returns a guard that restores the previous
//! registration on drop, so callers sweeping option combinations cannot leak
//! a non-default registration past their scope.

use std::sync::Mutex;

use prost::Message;

use crate::error::ExportResult;
use crate::lowering::build_model;
use crate::options::ExportOptions;
use crate::spec::DeformConv2dSpec;

static ACTIVE: Mutex<ExportOptions> = Mutex::new(ExportOptions::DEFAULT);

fn active() -> std::sync::MutexGuard<'static, ExportOptions> {
    ACTIVE.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Registers `options` for subsequent [`export_registered`] calls.
pub fn register(options: ExportOptions) {
    tracing::debug!(?options, "registering deform_conv2d lowering");
    *active() = options;
}

/// Restores the default registration.
pub fn register_default() {
    register(ExportOptions::DEFAULT);
}

/// Currently registered options.
pub fn registered() -> ExportOptions {
    *active()
}

/// Registers `options` and returns a guard restoring the previous
/// registration when dropped.
#[must_use = "dropping the guard immediately restores the previous registration"]
pub fn register_scoped(options: ExportOptions) -> RegistrationGuard {
    let previous = registered();
    register(options);
    RegistrationGuard { previous }
}

pub struct RegistrationGuard {
    previous: ExportOptions,
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        register(self.previous);
    }
}

/// Serialized ONNX model for `spec` under explicit options.
pub fn export_with(spec: &DeformConv2dSpec, options: ExportOptions) -> ExportResult<Vec<u8>> {
    Ok(build_model(spec, options)?.encode_to_vec())
}

/// Serialized ONNX model for `spec` under the registered options.
pub fn export_registered(spec: &DeformConv2dSpec) -> ExportResult<Vec<u8>> {
    export_with(spec, registered())
}

#[cfg(test)]
mod tests {
    use super::*;

    // Single test: the registry is process state and the test harness runs
    // functions concurrently.
    #[test]
    fn registration_replaces_and_guard_restores() {
        assert_eq!(registered(), ExportOptions::DEFAULT);

        register(ExportOptions::new(true, false));
        assert_eq!(registered(), ExportOptions::new(true, false));
        register(ExportOptions::new(false, true));
        assert_eq!(registered(), ExportOptions::new(false, true));

        {
            let _guard = register_scoped(ExportOptions::new(true, true));
            assert_eq!(registered(), ExportOptions::new(true, true));
        }
        assert_eq!(registered(), ExportOptions::new(false, true));

        register_default();
        assert_eq!(registered(), ExportOptions::DEFAULT);
    }
}
