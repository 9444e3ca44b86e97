use deform_conv2d_onnx_exporter::ExportError;
use thiserror::Error;

use crate::config::DcnConfig;

/// The error type for verification runs.
#[derive(Error, Debug)]
pub enum VerifyError {
    /// Error for when a configuration violates the dimension-consistency
    /// invariants. Signals a test-authoring mistake, not an engine defect.
    #[error("Invalid configuration: {reason}")]
    InvalidConfiguration {
        /// The reason why the configuration is invalid.
        reason: String,
    },

    /// Error from the translation component.
    #[error(transparent)]
    Export(#[from] ExportError),

    /// Error for when the exported artifact fails structural validation.
    #[error("Artifact rejected: {message}")]
    ArtifactRejected {
        /// The validator's diagnostic message.
        message: String,
    },

    /// Error for when one of the engines fails outside of validation.
    #[error("Engine failure during {stage}: {message}")]
    EngineFailure {
        /// The pipeline stage that failed.
        stage: &'static str,
        /// The engine's diagnostic message.
        message: String,
    },

    /// Error for when the two engines disagree numerically. Carries the full
    /// configuration so the case can be reproduced.
    #[error("Numerical mismatch for {config:?}: {detail}")]
    Mismatch {
        /// The configuration under test.
        config: Box<DcnConfig>,
        /// Where and by how much the outputs diverged.
        detail: String,
    },
}

/// A specialized `Result` type for verification runs.
pub type VerifyResult<T> = Result<T, VerifyError>;
