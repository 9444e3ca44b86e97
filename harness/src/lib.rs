//! Numerical equivalence harness for the deformable convolution exporter.
//!
//! The harness runs the same deformable convolution through two unrelated
//! engines and demands elementwise agreement:
//!
//! * the reference path executes `burn`'s `deform_conv2d` on the ndarray
//!   backend,
//! * the candidate path exports the operation to ONNX with
//!   `deform-conv2d-onnx-exporter` and evaluates the artifact with
//!   `candle_onnx`.
//!
//! Agreement is checked with a relative tolerance of `1e-3` and an absolute
//! tolerance of `1e-5`. A disagreement surfaces as
//! [`VerifyError::Mismatch`] carrying the full [`DcnConfig`] so the failing
//! case can be replayed.

pub mod artifact;
pub mod compare;
pub mod config;
pub mod error;
pub mod inputs;
pub mod model;
pub mod runner;

pub use artifact::{validate, Session};
pub use compare::{allclose, Comparison, ATOL, RTOL};
pub use config::{DcnConfig, DcnOverrides};
pub use error::{VerifyError, VerifyResult};
pub use inputs::{InputBundle, TensorPayload};
pub use model::ReferenceModel;
pub use runner::{run_case, run_case_with};
