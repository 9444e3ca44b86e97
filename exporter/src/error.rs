use thiserror::Error;

/// The error type for export operations.
#[derive(Error, Debug)]
pub enum ExportError {
    /// Error for when the operator description is internally inconsistent.
    #[error("Invalid operator description: {reason}")]
    InvalidSpec {
        /// The reason why the description is invalid.
        reason: String,
    },

    /// Error for when a parameter tensor does not match the declared shape.
    #[error("Parameter size mismatch for {name}: expected {expected} values, got {actual}")]
    ParameterSizeMismatch {
        /// The parameter name (`weight` or `bias`).
        name: &'static str,
        /// The number of values the declared shape requires.
        expected: usize,
        /// The number of values actually supplied.
        actual: usize,
    },
}

/// A specialized `Result` type for export operations.
pub type ExportResult<T> = Result<T, ExportError>;
