//! Translation of one deformable convolution into ONNX primitive operators.
//!
//! The emitted graph reproduces the torchvision-style sampling semantics of
//! `deform_conv2d`: per-position learned offsets perturb the kernel sampling
//! grid, values are bilinearly interpolated with a zero border, optionally
//! modulated by a mask, and reduced with a grouped matrix multiply.
//!
//! All shapes are static, so everything that does not depend on runtime data
//! (base sampling grid, flattening indices, reshape targets, the weight
//! matrix) is precomputed host-side and embedded as initializers. The runtime
//! graph only performs the offset-dependent arithmetic: floor emulation,
//! border tests, index clamping, gathers and the final contraction.

use candle_onnx::onnx::tensor_proto::DataType;
use candle_onnx::onnx::ModelProto;

use crate::graph::{attr_int, attr_ints, tensor_value_info, GraphBuilder};
use crate::options::ExportOptions;
use crate::spec::DeformConv2dSpec;

const INPUT: &str = "input";
const OFFSET: &str = "offset";
const MASK: &str = "mask";
const OUTPUT: &str = "output";

const F32: i64 = DataType::Float as i64;
const I64: i64 = DataType::Int64 as i64;

/// Builds the ONNX model for `spec` under the given lowering options.
pub fn build_model(spec: &DeformConv2dSpec, options: ExportOptions) -> crate::ExportResult<ModelProto> {
    spec.validate()?;
    let mut lw = Lowering {
        b: GraphBuilder::new(),
        spec,
        options,
    };
    let model = lw.build();
    tracing::debug!(
        nodes = model.graph.as_ref().map_or(0, |g| g.node.len()),
        flat_gather = options.flat_gather,
        clamp_before_cast = options.clamp_before_cast,
        "lowered deform_conv2d"
    );
    Ok(model)
}

struct Lowering<'a> {
    b: GraphBuilder,
    spec: &'a DeformConv2dSpec,
    options: ExportOptions,
}

impl Lowering<'_> {
    fn build(&mut self) -> ModelProto {
        let s = self.spec;
        let [b, c] = [s.batch, s.in_channels];
        let [h, w] = [s.in_height, s.in_width];
        let k = s.kernel[0] * s.kernel[1];
        let og = s.offset_groups;
        let [oh, ow] = s.out_dims();

        // Learned offsets, split into y and x planes: channel og*2K + 2k is
        // the y displacement for kernel position k, channel og*2K + 2k + 1
        // the x displacement.
        let off6 = self.b.reshape(
            OFFSET,
            &[b as i64, og as i64, k as i64, 2, oh as i64, ow as i64],
            "offset_planes",
        );
        let sel_y = self.b.init_i64_scalar("sel_y", 0);
        let sel_x = self.b.init_i64_scalar("sel_x", 1);
        let off_y = self
            .b
            .push("Gather", &[&off6, &sel_y], "offset_y", vec![attr_int("axis", 3)]);
        let off_x = self
            .b
            .push("Gather", &[&off6, &sel_x], "offset_x", vec![attr_int("axis", 3)]);

        // Unperturbed sampling grid, precomputed per (k, oy, ox).
        let (base_y, base_x) = self.base_grid();
        let pos_y = self.b.push("Add", &[&off_y, &base_y], "pos_y", vec![]);
        let pos_x = self.b.push("Add", &[&off_x, &base_x], "pos_x", vec![]);

        let neg_one = self.b.init_f32("neg_one", &[1], vec![-1.0]);
        let one = self.b.init_f32("one", &[1], vec![1.0]);
        let height_f = self.b.init_f32("height_f", &[1], vec![h as f32]);
        let width_f = self.b.init_f32("width_f", &[1], vec![w as f32]);

        // A sample contributes only when its position lies strictly inside
        // (-1, H) x (-1, W); everything else reads as zero padding.
        let inside = {
            let y_ok = self.span_test(&pos_y, &neg_one, &height_f, "pos_y");
            let x_ok = self.span_test(&pos_x, &neg_one, &width_f, "pos_x");
            let both = self.b.push("Mul", &[&y_ok, &x_ok], "inside_u8", vec![]);
            self.b
                .push("Cast", &[&both], "inside", vec![attr_int("to", F32)])
        };

        let floor_y = self.floor(&pos_y, "floor_y");
        let floor_x = self.floor(&pos_x, "floor_x");
        let frac_y = self.b.push("Sub", &[&pos_y, &floor_y], "frac_y", vec![]);
        let frac_x = self.b.push("Sub", &[&pos_x, &floor_x], "frac_x", vec![]);
        let rfrac_y = self.b.push("Sub", &[&one, &frac_y], "rfrac_y", vec![]);
        let rfrac_x = self.b.push("Sub", &[&one, &frac_x], "rfrac_x", vec![]);
        let ceil_y = self.b.push("Add", &[&floor_y, &one], "ceil_y", vec![]);
        let ceil_x = self.b.push("Add", &[&floor_x, &one], "ceil_x", vec![]);

        // Per-coordinate validity of the two candidate rows and columns.
        let vy0 = self.coord_valid(&floor_y, &neg_one, &height_f, "floor_y");
        let vy1 = self.coord_valid(&ceil_y, &neg_one, &height_f, "ceil_y");
        let vx0 = self.coord_valid(&floor_x, &neg_one, &width_f, "floor_x");
        let vx1 = self.coord_valid(&ceil_x, &neg_one, &width_f, "ceil_x");

        // Modulation folds into the interpolation coefficients.
        let keep = if s.use_mask {
            let mask5 = self.b.reshape(
                MASK,
                &[b as i64, og as i64, k as i64, oh as i64, ow as i64],
                "mask_planes",
            );
            self.b.push("Mul", &[&inside, &mask5], "keep", vec![])
        } else {
            inside.clone()
        };

        // Bilinear weight per corner, gated by corner validity and `keep`.
        let corner_coeff = |lw: &mut Self, wy: &str, wx: &str, vy: &str, vx: &str, tag: &str| {
            let bilin = lw.b.push("Mul", &[wy, wx], &format!("bilinear_{tag}"), vec![]);
            let valid = lw.b.push("Mul", &[vy, vx], &format!("valid_{tag}"), vec![]);
            let gated = lw
                .b
                .push("Mul", &[&bilin, &valid], &format!("gated_{tag}"), vec![]);
            lw.b
                .push("Mul", &[&gated, &keep], &format!("coeff_{tag}"), vec![])
        };
        let coeff00 = corner_coeff(self, &rfrac_y, &rfrac_x, &vy0, &vx0, "y0x0");
        let coeff01 = corner_coeff(self, &rfrac_y, &frac_x, &vy0, &vx1, "y0x1");
        let coeff10 = corner_coeff(self, &frac_y, &rfrac_x, &vy1, &vx0, "y1x0");
        let coeff11 = corner_coeff(self, &frac_y, &frac_x, &vy1, &vx1, "y1x1");

        let row_y0 = self.clamped_index(&floor_y, h, "row_y0");
        let row_y1 = self.clamped_index(&ceil_y, h, "row_y1");
        let col_x0 = self.clamped_index(&floor_x, w, "col_x0");
        let col_x1 = self.clamped_index(&ceil_x, w, "col_x1");

        let corners = [
            ("y0x0", &row_y0, &col_x0, &coeff00),
            ("y0x1", &row_y0, &col_x1, &coeff01),
            ("y1x0", &row_y1, &col_x0, &coeff10),
            ("y1x1", &row_y1, &col_x1, &coeff11),
        ];

        let columns = if self.options.flat_gather {
            self.flat_gather_columns(&corners)
        } else {
            self.row_gather_columns(&corners)
        };

        // Grouped contraction. The weight buffer is already laid out as
        // [G, OC/G, (C/G)*K] once the leading out-channel axis is split.
        let g = s.weight_groups;
        let cpg = c / g;
        let ocg = s.out_channels / g;
        let weight = self.b.init_f32(
            "weight",
            &[1, g, ocg, cpg * k],
            s.weight.clone(),
        );
        let product = self
            .b
            .push("MatMul", &[&weight, &columns], "group_product", vec![]);

        let out_dims = [s.batch as i64, s.out_channels as i64, oh as i64, ow as i64];
        match &s.bias {
            Some(bias) => {
                let pre = self.b.reshape(&product, &out_dims, "output_nobias");
                let bias = self
                    .b
                    .init_f32("bias", &[1, s.out_channels, 1, 1], bias.clone());
                self.b.push("Add", &[&pre, &bias], OUTPUT, vec![]);
            }
            None => {
                self.b.reshape(&product, &out_dims, OUTPUT);
            }
        }

        let mut inputs = vec![
            tensor_value_info(INPUT, &[b, c, h, w], DataType::Float),
            tensor_value_info(OFFSET, &[b, 2 * og * k, oh, ow], DataType::Float),
        ];
        if s.use_mask {
            inputs.push(tensor_value_info(MASK, &[b, og * k, oh, ow], DataType::Float));
        }
        let outputs = vec![tensor_value_info(
            OUTPUT,
            &[s.batch, s.out_channels, oh, ow],
            DataType::Float,
        )];
        std::mem::take(&mut self.b).finish("deform_conv2d", inputs, outputs)
    }

    /// Unperturbed sampling positions as two `[1, 1, K, OH, OW]` initializers.
    fn base_grid(&mut self) -> (String, String) {
        let s = self.spec;
        let [kh, kw] = s.kernel;
        let [oh, ow] = s.out_dims();
        let k = kh * kw;
        let mut base_y = Vec::with_capacity(k * oh * ow);
        let mut base_x = Vec::with_capacity(k * oh * ow);
        for ky in 0..kh {
            for kx in 0..kw {
                for oy in 0..oh {
                    for ox in 0..ow {
                        base_y.push(
                            (oy * s.stride[0] + ky * s.dilation[0]) as f32 - s.padding[0] as f32,
                        );
                        base_x.push(
                            (ox * s.stride[1] + kx * s.dilation[1]) as f32 - s.padding[1] as f32,
                        );
                    }
                }
            }
        }
        let dims = [1, 1, k, oh, ow];
        (
            self.b.init_f32("base_y", &dims, base_y),
            self.b.init_f32("base_x", &dims, base_x),
        )
    }

    /// `(low < v) * (v < high)` as a u8 tensor.
    fn span_test(&mut self, value: &str, low: &str, high: &str, tag: &str) -> String {
        let above = self
            .b
            .push("Greater", &[value, low], &format!("{tag}_above"), vec![]);
        let below = self
            .b
            .push("Less", &[value, high], &format!("{tag}_below"), vec![]);
        self.b
            .push("Mul", &[&above, &below], &format!("{tag}_span"), vec![])
    }

    /// Same as [`span_test`] but cast to f32 for coefficient arithmetic.
    fn coord_valid(&mut self, value: &str, low: &str, high: &str, tag: &str) -> String {
        let span = self.span_test(value, low, high, &format!("{tag}_valid"));
        self.b.push(
            "Cast",
            &[&span],
            &format!("{tag}_valid_f"),
            vec![attr_int("to", F32)],
        )
    }

    /// Emulates `Floor`, which opset 12 runtimes do not all provide for the
    /// dtypes involved here: truncate through an int64 round-trip, then
    /// subtract one where truncation rounded a negative value up.
    fn floor(&mut self, value: &str, name: &str) -> String {
        let as_int = self.b.push(
            "Cast",
            &[value],
            &format!("{name}_trunc_i"),
            vec![attr_int("to", I64)],
        );
        let trunc = self.b.push(
            "Cast",
            &[&as_int],
            &format!("{name}_trunc"),
            vec![attr_int("to", F32)],
        );
        let rounded_up = self.b.push(
            "Greater",
            &[&trunc, value],
            &format!("{name}_round_up"),
            vec![],
        );
        let correction = self.b.push(
            "Cast",
            &[&rounded_up],
            &format!("{name}_correction"),
            vec![attr_int("to", F32)],
        );
        self.b.push("Sub", &[&trunc, &correction], name, vec![])
    }

    /// Integer coordinate clamped into `[0, extent - 1]` so every gather index
    /// is in bounds; out-of-range corners are already zeroed by their
    /// validity coefficient. The clamp/cast order is the backend
    /// compatibility knob.
    fn clamped_index(&mut self, coord: &str, extent: usize, name: &str) -> String {
        if self.options.clamp_before_cast {
            let lo = self.b.init_f32(&format!("{name}_lo"), &[1], vec![0.0]);
            let hi = self
                .b
                .init_f32(&format!("{name}_hi"), &[1], vec![(extent - 1) as f32]);
            let clipped = self
                .b
                .push("Clip", &[coord, &lo, &hi], &format!("{name}_clip"), vec![]);
            self.b
                .push("Cast", &[&clipped], name, vec![attr_int("to", I64)])
        } else {
            let as_int = self.b.push(
                "Cast",
                &[coord],
                &format!("{name}_i"),
                vec![attr_int("to", I64)],
            );
            let lo = self.b.init_i64(&format!("{name}_lo"), &[1], vec![0]);
            let hi = self
                .b
                .init_i64(&format!("{name}_hi"), &[1], vec![extent as i64 - 1]);
            self.b.push("Clip", &[&as_int, &lo, &hi], name, vec![])
        }
    }

    /// Default sampling strategy: view the input as `[B*OG*H*W, C/OG]` rows
    /// and gather whole channel rows per sampling point, so indices never
    /// expand across channels.
    fn row_gather_columns(&mut self, corners: &[(&str, &String, &String, &String); 4]) -> String {
        let s = self.spec;
        let [b, c] = [s.batch, s.in_channels];
        let [h, w] = [s.in_height, s.in_width];
        let og = s.offset_groups;
        let cg = c / og;
        let k = s.kernel[0] * s.kernel[1];
        let [oh, ow] = s.out_dims();
        let ohw = oh * ow;
        let n = b * og * k * ohw;

        let grouped = self.b.reshape(
            INPUT,
            &[b as i64, og as i64, cg as i64, (h * w) as i64],
            "input_grouped",
        );
        let rows_last = self.b.push(
            "Transpose",
            &[&grouped],
            "input_rows_last",
            vec![attr_ints("perm", &[0, 1, 3, 2])],
        );
        let rows = self.b.reshape(
            &rows_last,
            &[(b * og * h * w) as i64, cg as i64],
            "input_rows",
        );

        let mut row_base = Vec::with_capacity(b * og);
        for bi in 0..b {
            for gi in 0..og {
                row_base.push(((bi * og + gi) * h * w) as i64);
            }
        }
        let row_base = self.b.init_i64("row_base", &[b, og, 1, 1, 1], row_base);
        let width_i = self.b.init_i64("width_i", &[1], vec![w as i64]);

        let mut partials = Vec::with_capacity(4);
        for (tag, row, col, coeff) in corners {
            let scaled = self.b.push(
                "Mul",
                &[row, &width_i],
                &format!("row_scaled_{tag}"),
                vec![],
            );
            let local = self
                .b
                .push("Add", &[&scaled, col], &format!("point_{tag}"), vec![]);
            let global = self
                .b
                .push("Add", &[&local, &row_base], &format!("row_index_{tag}"), vec![]);
            let flat = self
                .b
                .reshape(&global, &[n as i64], &format!("row_index_flat_{tag}"));
            let sampled = self.b.push(
                "Gather",
                &[&rows, &flat],
                &format!("sampled_{tag}"),
                vec![attr_int("axis", 0)],
            );
            let coeff_col = self
                .b
                .reshape(coeff, &[n as i64, 1], &format!("coeff_col_{tag}"));
            partials.push(self.b.push(
                "Mul",
                &[&sampled, &coeff_col],
                &format!("weighted_{tag}"),
                vec![],
            ));
        }
        let top = self
            .b
            .push("Add", &[&partials[0], &partials[1]], "interp_top", vec![]);
        let bottom = self
            .b
            .push("Add", &[&partials[2], &partials[3]], "interp_bottom", vec![]);
        let interp = self.b.push("Add", &[&top, &bottom], "interpolated", vec![]);

        // [N, C/OG] rows carry (b, og, k, ohw) order; move channels ahead of
        // the kernel axis before collapsing into im2col columns.
        let by_point = self.b.reshape(
            &interp,
            &[b as i64, og as i64, k as i64, ohw as i64, cg as i64],
            "interp_by_point",
        );
        let by_channel = self.b.push(
            "Transpose",
            &[&by_point],
            "interp_by_channel",
            vec![attr_ints("perm", &[0, 1, 4, 2, 3])],
        );
        let g = s.weight_groups;
        self.b.reshape(
            &by_channel,
            &[b as i64, g as i64, ((c / g) * k) as i64, ohw as i64],
            "columns",
        )
    }

    /// Alternate strategy: flatten the input completely and expand sampling
    /// indices over the channels of each offset group, gathering single
    /// elements.
    fn flat_gather_columns(&mut self, corners: &[(&str, &String, &String, &String); 4]) -> String {
        let s = self.spec;
        let [b, c] = [s.batch, s.in_channels];
        let [h, w] = [s.in_height, s.in_width];
        let og = s.offset_groups;
        let cg = c / og;
        let k = s.kernel[0] * s.kernel[1];
        let [oh, ow] = s.out_dims();
        let ohw = oh * ow;

        let flat = self
            .b
            .reshape(INPUT, &[(b * c * h * w) as i64], "input_flat");

        let mut chan_base = Vec::with_capacity(b * og * cg);
        for bi in 0..b {
            for gi in 0..og {
                for ci in 0..cg {
                    chan_base.push(((bi * c + gi * cg + ci) * h * w) as i64);
                }
            }
        }
        let chan_base = self.b.init_i64("chan_base", &[b, og, cg, 1], chan_base);
        let width_i = self.b.init_i64("width_i", &[1], vec![w as i64]);

        let mut partials = Vec::with_capacity(4);
        for (tag, row, col, coeff) in corners {
            let scaled = self.b.push(
                "Mul",
                &[row, &width_i],
                &format!("row_scaled_{tag}"),
                vec![],
            );
            let local = self
                .b
                .push("Add", &[&scaled, col], &format!("point_{tag}"), vec![]);
            let broadcastable = self.b.reshape(
                &local,
                &[b as i64, og as i64, 1, (k * ohw) as i64],
                &format!("point_rows_{tag}"),
            );
            let global = self.b.push(
                "Add",
                &[&broadcastable, &chan_base],
                &format!("elem_index_{tag}"),
                vec![],
            );
            let flat_index = self.b.reshape(
                &global,
                &[(b * og * cg * k * ohw) as i64],
                &format!("elem_index_flat_{tag}"),
            );
            let gathered = self.b.push(
                "Gather",
                &[&flat, &flat_index],
                &format!("gathered_{tag}"),
                vec![attr_int("axis", 0)],
            );
            let sampled = self.b.reshape(
                &gathered,
                &[b as i64, og as i64, cg as i64, k as i64, ohw as i64],
                &format!("sampled_{tag}"),
            );
            let coeff_r = self.b.reshape(
                coeff,
                &[b as i64, og as i64, 1, k as i64, ohw as i64],
                &format!("coeff_planes_{tag}"),
            );
            partials.push(self.b.push(
                "Mul",
                &[&sampled, &coeff_r],
                &format!("weighted_{tag}"),
                vec![],
            ));
        }
        let top = self
            .b
            .push("Add", &[&partials[0], &partials[1]], "interp_top", vec![]);
        let bottom = self
            .b
            .push("Add", &[&partials[2], &partials[3]], "interp_bottom", vec![]);
        let interp = self.b.push("Add", &[&top, &bottom], "interpolated", vec![]);

        // Channel-major already; collapse straight into im2col columns.
        let g = s.weight_groups;
        self.b.reshape(
            &interp,
            &[b as i64, g as i64, ((c / g) * k) as i64, ohw as i64],
            "columns",
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn tiny_spec(use_mask: bool) -> DeformConv2dSpec {
        let weight = (0..4 * 2 * 2 * 2).map(|v| v as f32 * 0.01).collect();
        DeformConv2dSpec {
            batch: 1,
            in_channels: 4,
            in_height: 6,
            in_width: 5,
            out_channels: 4,
            kernel: [2, 2],
            stride: [1, 1],
            padding: [0, 0],
            dilation: [1, 1],
            weight_groups: 2,
            offset_groups: 2,
            use_mask,
            weight,
            bias: Some(vec![0.1, 0.2, 0.3, 0.4]),
        }
    }

    #[test]
    fn graph_targets_opset_12_and_names_io() {
        let model = build_model(&tiny_spec(true), ExportOptions::DEFAULT).unwrap();
        assert_eq!(model.opset_import[0].version, crate::graph::OPSET_VERSION);
        let graph = model.graph.unwrap();
        let inputs: Vec<_> = graph.input.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(inputs, vec!["input", "offset", "mask"]);
        assert_eq!(graph.output[0].name, "output");
    }

    #[test]
    fn mask_input_is_omitted_entirely_when_unused() {
        let model = build_model(&tiny_spec(false), ExportOptions::DEFAULT).unwrap();
        let graph = model.graph.unwrap();
        let inputs: Vec<_> = graph.input.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(inputs, vec!["input", "offset"]);
        for node in &graph.node {
            assert!(!node.input.iter().any(|i| i == "mask"));
        }
    }

    /// Every node input must resolve to a graph input, an initializer or the
    /// output of an earlier node, and value names must be unique.
    fn assert_well_formed(options: ExportOptions, use_mask: bool) {
        let model = build_model(&tiny_spec(use_mask), options).unwrap();
        let graph = model.graph.unwrap();
        let mut known: HashSet<&str> = graph.input.iter().map(|i| i.name.as_str()).collect();
        for init in &graph.initializer {
            assert!(known.insert(&init.name), "duplicate name {}", init.name);
        }
        for node in &graph.node {
            for input in &node.input {
                assert!(
                    known.contains(input.as_str()),
                    "node {} reads undefined value {input}",
                    node.name
                );
            }
            for output in &node.output {
                assert!(known.insert(output), "duplicate name {output}");
            }
        }
        for output in &graph.output {
            assert!(known.contains(output.name.as_str()));
        }
    }

    #[test]
    fn all_option_combinations_emit_well_formed_graphs() {
        for flat_gather in [false, true] {
            for clamp_before_cast in [false, true] {
                for use_mask in [false, true] {
                    assert_well_formed(
                        ExportOptions::new(flat_gather, clamp_before_cast),
                        use_mask,
                    );
                }
            }
        }
    }

    #[test]
    fn gather_strategies_emit_distinct_graphs() {
        let row = build_model(&tiny_spec(true), ExportOptions::DEFAULT).unwrap();
        let flat = build_model(&tiny_spec(true), ExportOptions::new(true, false)).unwrap();
        let ops = |m: &ModelProto| {
            m.graph
                .as_ref()
                .unwrap()
                .node
                .iter()
                .map(|n| n.output[0].clone())
                .collect::<HashSet<_>>()
        };
        assert!(ops(&row).contains("input_rows"));
        assert!(ops(&flat).contains("input_flat"));
        // Row gather never expands indices across channels.
        assert!(!ops(&row).iter().any(|n| n.starts_with("elem_index")));
    }

    #[test]
    fn clamp_patch_moves_clip_in_front_of_cast() {
        let patched = build_model(&tiny_spec(true), ExportOptions::new(false, true)).unwrap();
        let graph = patched.graph.unwrap();
        let clip = graph
            .node
            .iter()
            .find(|n| n.output[0] == "row_y0_clip")
            .expect("patched lowering clips in float");
        assert_eq!(clip.op_type, "Clip");
        let cast = graph
            .node
            .iter()
            .find(|n| n.output[0] == "row_y0")
            .unwrap();
        assert_eq!(cast.op_type, "Cast");
        assert_eq!(cast.input[0], "row_y0_clip");
    }
}
