//! Thin construction helpers over the ONNX protobuf types.

use candle_onnx::onnx::attribute_proto::AttributeType;
use candle_onnx::onnx::tensor_proto::DataType;
use candle_onnx::onnx::tensor_shape_proto::dimension;
use candle_onnx::onnx::tensor_shape_proto::Dimension;
use candle_onnx::onnx::{
    type_proto, AttributeProto, GraphProto, ModelProto, NodeProto, OperatorSetIdProto, TensorProto,
    TensorShapeProto, TypeProto, ValueInfoProto,
};

/// Default-domain operator set the exporter targets.
pub const OPSET_VERSION: i64 = 12;
/// ONNX IR version paired with [`OPSET_VERSION`].
pub const IR_VERSION: i64 = 7;

pub fn attr_int(name: &str, value: i64) -> AttributeProto {
    AttributeProto {
        name: name.to_string(),
        r#type: AttributeType::Int as i32,
        i: value,
        ..Default::default()
    }
}

pub fn attr_ints(name: &str, values: &[i64]) -> AttributeProto {
    AttributeProto {
        name: name.to_string(),
        r#type: AttributeType::Ints as i32,
        ints: values.to_vec(),
        ..Default::default()
    }
}

/// Value info carrying a fully static float/int64 tensor type.
pub fn tensor_value_info(name: &str, dims: &[usize], data_type: DataType) -> ValueInfoProto {
    let shape = TensorShapeProto {
        dim: dims
            .iter()
            .map(|&d| Dimension {
                value: Some(dimension::Value::DimValue(d as i64)),
                ..Default::default()
            })
            .collect(),
    };
    ValueInfoProto {
        name: name.to_string(),
        r#type: Some(TypeProto {
            value: Some(type_proto::Value::TensorType(type_proto::Tensor {
                elem_type: data_type as i32,
                shape: Some(shape),
            })),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Accumulates nodes and initializers, then assembles the model proto.
#[derive(Default)]
pub struct GraphBuilder {
    nodes: Vec<NodeProto>,
    initializers: Vec<TensorProto>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a float initializer and returns its name.
    pub fn init_f32(&mut self, name: &str, dims: &[usize], data: Vec<f32>) -> String {
        debug_assert_eq!(dims.iter().product::<usize>(), data.len());
        self.initializers.push(TensorProto {
            name: name.to_string(),
            dims: dims.iter().map(|&d| d as i64).collect(),
            data_type: DataType::Float as i32,
            float_data: data,
            ..Default::default()
        });
        name.to_string()
    }

    /// Adds an int64 initializer and returns its name.
    pub fn init_i64(&mut self, name: &str, dims: &[usize], data: Vec<i64>) -> String {
        debug_assert_eq!(dims.iter().product::<usize>(), data.len());
        self.initializers.push(TensorProto {
            name: name.to_string(),
            dims: dims.iter().map(|&d| d as i64).collect(),
            data_type: DataType::Int64 as i32,
            int64_data: data,
            ..Default::default()
        });
        name.to_string()
    }

    /// Adds a rank-0 int64 initializer. `Gather` with a rank-0 index drops
    /// the gathered axis, which the lowering relies on to split tensors.
    pub fn init_i64_scalar(&mut self, name: &str, value: i64) -> String {
        self.initializers.push(TensorProto {
            name: name.to_string(),
            dims: vec![],
            data_type: DataType::Int64 as i32,
            int64_data: vec![value],
            ..Default::default()
        });
        name.to_string()
    }

    /// Appends a single-output node and returns the output name.
    pub fn push(
        &mut self,
        op_type: &str,
        inputs: &[&str],
        output: &str,
        attributes: Vec<AttributeProto>,
    ) -> String {
        self.nodes.push(NodeProto {
            op_type: op_type.to_string(),
            name: format!("{output}_node"),
            input: inputs.iter().map(|s| s.to_string()).collect(),
            output: vec![output.to_string()],
            attribute: attributes,
            ..Default::default()
        });
        output.to_string()
    }

    /// `Reshape` through an int64 shape initializer.
    pub fn reshape(&mut self, input: &str, shape: &[i64], output: &str) -> String {
        let shape_name = self.init_i64(&format!("{output}_shape"), &[shape.len()], shape.to_vec());
        self.push("Reshape", &[input, &shape_name], output, vec![])
    }

    pub fn finish(
        self,
        name: &str,
        inputs: Vec<ValueInfoProto>,
        outputs: Vec<ValueInfoProto>,
    ) -> ModelProto {
        ModelProto {
            ir_version: IR_VERSION,
            producer_name: "deform-conv2d-onnx-exporter".to_string(),
            producer_version: env!("CARGO_PKG_VERSION").to_string(),
            opset_import: vec![OperatorSetIdProto {
                domain: String::new(),
                version: OPSET_VERSION,
            }],
            graph: Some(GraphProto {
                name: name.to_string(),
                node: self.nodes,
                initializer: self.initializers,
                input: inputs,
                output: outputs,
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}
