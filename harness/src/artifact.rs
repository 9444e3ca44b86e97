//! Structural validation of exported model bytes and the independent
//! evaluation session built on `candle_onnx`.

use std::collections::{HashMap, HashSet};

use candle::Tensor;
use candle_onnx::onnx::tensor_proto::DataType;
use candle_onnx::onnx::{tensor_shape_proto::dimension, type_proto, ModelProto, TensorProto};
use prost::Message;

use deform_conv2d_onnx_exporter::graph::OPSET_VERSION;

use crate::error::{VerifyError, VerifyResult};

fn rejected(message: impl Into<String>) -> VerifyError {
    VerifyError::ArtifactRejected {
        message: message.into(),
    }
}

fn initializer_len(tensor: &TensorProto) -> usize {
    match DataType::try_from(tensor.data_type) {
        Ok(DataType::Float) => tensor.float_data.len(),
        Ok(DataType::Int64) => tensor.int64_data.len(),
        _ => 0,
    }
}

/// Decodes and validates exported bytes.
///
/// Rejection here means the artifact is malformed independently of any
/// numerical behavior: missing graph, wrong operator set, duplicate or
/// dangling tensor names, or initializers whose payload does not match their
/// declared shape.
pub fn validate(bytes: &[u8]) -> VerifyResult<ModelProto> {
    let model = ModelProto::decode(bytes).map_err(|e| rejected(format!("undecodable: {e}")))?;

    let default_opset = model
        .opset_import
        .iter()
        .find(|o| o.domain.is_empty())
        .ok_or_else(|| rejected("no default-domain operator set"))?;
    if default_opset.version != OPSET_VERSION {
        return Err(rejected(format!(
            "default-domain opset {} but {OPSET_VERSION} required",
            default_opset.version
        )));
    }

    let graph = model
        .graph
        .as_ref()
        .ok_or_else(|| rejected("no graph in model"))?;

    // Every tensor name appears once; nodes only read names produced earlier.
    let mut known: HashSet<&str> = HashSet::new();
    for init in &graph.initializer {
        if init.name.is_empty() {
            return Err(rejected("unnamed initializer"));
        }
        if !known.insert(&init.name) {
            return Err(rejected(format!("duplicate name {}", init.name)));
        }
        let declared: usize = init.dims.iter().map(|&d| d as usize).product();
        let stored = initializer_len(init);
        if stored != declared {
            return Err(rejected(format!(
                "initializer {} declares {declared} elements but stores {stored}",
                init.name
            )));
        }
    }
    for input in &graph.input {
        if !known.insert(&input.name) {
            return Err(rejected(format!("duplicate name {}", input.name)));
        }
        let tensor_type = input
            .r#type
            .as_ref()
            .and_then(|t| t.value.as_ref())
            .and_then(|v| match v {
                type_proto::Value::TensorType(tt) => Some(tt),
                _ => None,
            })
            .ok_or_else(|| rejected(format!("input {} has no tensor type", input.name)))?;
        let shape = tensor_type
            .shape
            .as_ref()
            .ok_or_else(|| rejected(format!("input {} has no shape", input.name)))?;
        for (idx, dim) in shape.dim.iter().enumerate() {
            match dim.value {
                Some(dimension::Value::DimValue(v)) if v > 0 => {}
                _ => {
                    return Err(rejected(format!(
                        "input {} dim {idx} is not a static positive size",
                        input.name
                    )))
                }
            }
        }
    }
    for node in &graph.node {
        for read in node.input.iter().filter(|n| !n.is_empty()) {
            if !known.contains(read.as_str()) {
                return Err(rejected(format!(
                    "node {} reads undefined tensor {read}",
                    node.name
                )));
            }
        }
        for written in &node.output {
            if written.is_empty() {
                return Err(rejected(format!("node {} has an unnamed output", node.name)));
            }
            if !known.insert(written) {
                return Err(rejected(format!("duplicate name {written}")));
            }
        }
    }
    for output in &graph.output {
        if !known.contains(output.name.as_str()) {
            return Err(rejected(format!("graph output {} is undefined", output.name)));
        }
    }

    Ok(model)
}

/// A loaded model ready to be evaluated on the CPU.
pub struct Session {
    model: ModelProto,
    output_name: String,
}

impl Session {
    /// Validates `bytes` and prepares them for evaluation.
    pub fn load(bytes: &[u8]) -> VerifyResult<Self> {
        let model = validate(bytes)?;
        let graph = model
            .graph
            .as_ref()
            .ok_or_else(|| rejected("no graph in model"))?;
        let output_name = match graph.output.as_slice() {
            [single] => single.name.clone(),
            outputs => {
                return Err(rejected(format!(
                    "expected a single graph output, found {}",
                    outputs.len()
                )))
            }
        };
        Ok(Self { model, output_name })
    }

    /// Evaluates the graph on `inputs` and returns the sole output tensor.
    pub fn run(&self, inputs: HashMap<String, Tensor>) -> VerifyResult<Tensor> {
        let mut outputs =
            candle_onnx::simple_eval(&self.model, inputs).map_err(|e| VerifyError::EngineFailure {
                stage: "onnx evaluation",
                message: format!("{e}"),
            })?;
        outputs
            .remove(&self.output_name)
            .ok_or_else(|| VerifyError::EngineFailure {
                stage: "onnx evaluation",
                message: format!("output {} missing from evaluation results", self.output_name),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle::Device;
    use candle_onnx::onnx::{
        AttributeProto, GraphProto, NodeProto, OperatorSetIdProto, TensorShapeProto,
        TypeProto, ValueInfoProto,
    };

    fn float_info(name: &str, dims: &[i64]) -> ValueInfoProto {
        ValueInfoProto {
            name: name.to_string(),
            r#type: Some(TypeProto {
                value: Some(type_proto::Value::TensorType(type_proto::Tensor {
                    elem_type: DataType::Float as i32,
                    shape: Some(TensorShapeProto {
                        dim: dims
                            .iter()
                            .map(|&d| candle_onnx::onnx::tensor_shape_proto::Dimension {
                                value: Some(dimension::Value::DimValue(d)),
                                ..Default::default()
                            })
                            .collect(),
                    }),
                })),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn double_model() -> ModelProto {
        ModelProto {
            ir_version: 7,
            opset_import: vec![OperatorSetIdProto {
                domain: String::new(),
                version: OPSET_VERSION,
            }],
            graph: Some(GraphProto {
                name: "double".to_string(),
                node: vec![NodeProto {
                    op_type: "Add".to_string(),
                    name: "y_node".to_string(),
                    input: vec!["x".to_string(), "x".to_string()],
                    output: vec!["y".to_string()],
                    attribute: Vec::<AttributeProto>::new(),
                    ..Default::default()
                }],
                input: vec![float_info("x", &[2])],
                output: vec![float_info("y", &[2])],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn validate_accepts_a_well_formed_model() {
        let bytes = double_model().encode_to_vec();
        assert!(validate(&bytes).is_ok());
    }

    #[test]
    fn validate_rejects_garbage_bytes() {
        match validate(&[0xff, 0x07, 0x99]) {
            Err(VerifyError::ArtifactRejected { message }) => {
                assert!(message.contains("undecodable"), "{message}");
            }
            other => panic!("expected ArtifactRejected, got {other:?}"),
        }
    }

    #[test]
    fn validate_rejects_wrong_opset() {
        let mut model = double_model();
        model.opset_import[0].version = OPSET_VERSION + 1;
        let err = validate(&model.encode_to_vec()).unwrap_err();
        assert!(matches!(err, VerifyError::ArtifactRejected { .. }), "{err:?}");
    }

    #[test]
    fn validate_rejects_dangling_node_input() {
        let mut model = double_model();
        model.graph.as_mut().unwrap().node[0].input[1] = "ghost".to_string();
        let err = validate(&model.encode_to_vec()).unwrap_err();
        assert!(format!("{err}").contains("undefined tensor ghost"), "{err}");
    }

    #[test]
    fn session_runs_a_trivial_graph() {
        let bytes = double_model().encode_to_vec();
        let session = Session::load(&bytes).unwrap();
        let x = Tensor::from_vec(vec![1.5f32, -2.0], (2,), &Device::Cpu).unwrap();
        let y = session
            .run(HashMap::from([("x".to_string(), x)]))
            .unwrap();
        assert_eq!(y.to_vec1::<f32>().unwrap(), vec![3.0, -4.0]);
    }
}
