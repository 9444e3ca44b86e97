//! Translates deformable 2D convolution into ONNX primitive operators.
//!
//! The exported graph targets the default-domain operator set version 12 and
//! uses only widely implemented primitives (`Reshape`, `Gather`, `Cast`,
//! `Clip`, comparison and arithmetic ops, `Transpose`, `MatMul`), so it can
//! run on inference engines that have no native deformable convolution.
//! Graph inputs are named `input`, `offset` and, when a modulation mask is
//! used, `mask`; the single output is named `output`.

pub mod error;
pub mod graph;
pub mod lowering;
pub mod options;
pub mod registry;
pub mod spec;

pub use error::{ExportError, ExportResult};
pub use lowering::build_model;
pub use options::ExportOptions;
pub use registry::{
    export_registered, export_with, register, register_default, register_scoped, registered,
    RegistrationGuard,
};
pub use spec::{conv_output_size, DeformConv2dSpec};
