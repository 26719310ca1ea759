//! Graph quantization.
//!
//! [`Quantizer::quantize`] walks a calibrated float graph in topological
//! order and emits a realized graph: every tensor becomes an integer at a
//! power-of-two scale `2^k` with a known precision, arithmetic results are
//! requantized with round-half-up right shifts, and softmax becomes a table
//! lookup. Nodes selected by the restore policy keep their float operator;
//! values crossing between the two worlds pass through explicit
//! `dequantize` / `quantize` nodes.

pub mod fixed_point;
pub mod softmax;

pub use fixed_point::ScaleExp;

use crate::context::QuantContext;
use crate::errors::{QuantizeError, Result};
use crate::graph::{Edge, Graph, GraphBuilder, Node, Op, OpKind, Tensor};
use crate::transform::shape::infer_shapes;
use fixed_point::{ceil_log2, precision_of, scale_for, ACCUMULATOR_BITS};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::{debug, info};

// ===========================================================================
// Configuration and results
// ===========================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantConfig {
    /// Default precision in bits. Defaults to 8.
    #[serde(default = "default_precision")]
    pub precision: u32,

    /// Precision forced on every graph input.
    #[serde(default)]
    pub input_precision: Option<u32>,

    /// Precision forced on every graph output.
    #[serde(default)]
    pub output_precision: Option<u32>,

    /// Scale excess (in bits) tolerated before a right shift is emitted.
    #[serde(default)]
    pub shift_bits: u32,

    /// Softmax exponent cutoff: inputs further than this below the lane
    /// maximum contribute `exp(-softmax_lambd)`.
    #[serde(default = "default_softmax_lambd")]
    pub softmax_lambd: f64,
}

fn default_precision() -> u32 {
    8
}

fn default_softmax_lambd() -> f64 {
    10.0
}

impl Default for QuantConfig {
    fn default() -> Self {
        Self {
            precision: default_precision(),
            input_precision: None,
            output_precision: None,
            shift_bits: 0,
            softmax_lambd: default_softmax_lambd(),
        }
    }
}

impl QuantConfig {
    pub fn int8() -> Self {
        Self::default()
    }

    pub fn with_precision(mut self, precision: u32) -> Self {
        self.precision = precision;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let check = |what: &str, p: u32| {
            if (2..=ACCUMULATOR_BITS).contains(&p) {
                Ok(())
            } else {
                Err(QuantizeError::UnsupportedConfig {
                    reason: format!("{what} must be between 2 and {ACCUMULATOR_BITS} bits, got {p}"),
                })
            }
        };
        check("precision", self.precision)?;
        if let Some(p) = self.input_precision {
            check("input_precision", p)?;
        }
        if let Some(p) = self.output_precision {
            check("output_precision", p)?;
        }
        if self.shift_bits >= ACCUMULATOR_BITS {
            return Err(QuantizeError::UnsupportedConfig {
                reason: format!("shift_bits must be below {ACCUMULATOR_BITS}, got {}", self.shift_bits),
            });
        }
        if !(self.softmax_lambd.is_finite() && self.softmax_lambd > 0.0) {
            return Err(QuantizeError::UnsupportedConfig {
                reason: format!("softmax_lambd must be positive, got {}", self.softmax_lambd),
            });
        }
        Ok(())
    }
}

/// How a caller encodes real values for one graph input. Zero point is 0.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InputExt {
    pub scale: f64,
    pub precision: u32,
}

impl InputExt {
    pub fn scale_exp(&self) -> ScaleExp {
        ScaleExp(self.scale.log2().round() as i32)
    }

    pub fn encode(&self, value: &Tensor) -> Tensor {
        let (scale, precision) = (self.scale_exp(), self.precision);
        value.mapv(|v| fixed_point::encode(v, scale, precision) as f64)
    }
}

/// A realized graph plus everything needed to drive it.
#[derive(Debug, Clone)]
pub struct QuantOutput {
    pub graph: Graph,
    /// Original names of the graph outputs, aligned with `output_scales`.
    pub output_names: Vec<String>,
    /// Real output = integer output / scale.
    pub output_scales: Vec<f64>,
    pub input_ext: BTreeMap<String, InputExt>,
    /// Original node name to the realized node carrying its final value.
    pub name_map: BTreeMap<String, String>,
    /// Output scale of every original non-constant node (1 when restored).
    pub scales: BTreeMap<String, f64>,
    /// Precision of every original node that stayed quantized.
    pub precisions: BTreeMap<String, u32>,
}

impl QuantOutput {
    /// Output scales keyed by original output name.
    pub fn output_scale_table(&self) -> BTreeMap<String, f64> {
        self.output_names.iter().cloned().zip(self.output_scales.iter().copied()).collect()
    }

    /// Encode real input feeds into the integer domain.
    pub fn encode_inputs(&self, feeds: &BTreeMap<String, Tensor>) -> Result<BTreeMap<String, Tensor>> {
        feeds
            .iter()
            .map(|(name, value)| {
                let ext = self
                    .input_ext
                    .get(name)
                    .ok_or_else(|| QuantizeError::not_found("input", name.clone()))?;
                Ok((name.clone(), ext.encode(value)))
            })
            .collect()
    }

    /// Divide realized outputs by their scales.
    pub fn decode_outputs(&self, outputs: &[Tensor]) -> Vec<Tensor> {
        outputs
            .iter()
            .zip(&self.output_scales)
            .map(|(t, &s)| t.mapv(|v| v / s))
            .collect()
    }
}

// ===========================================================================
// Quantizer
// ===========================================================================

#[derive(Debug, Clone, Default)]
pub struct Quantizer {
    config: QuantConfig,
}

impl Quantizer {
    pub fn new(config: QuantConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &QuantConfig {
        &self.config
    }

    /// Rewrite a calibrated float graph into a realized integer graph.
    pub fn quantize(&self, graph: &Graph, ctx: &QuantContext) -> Result<QuantOutput> {
        self.config.validate()?;
        crate::transform::validate(graph)?;
        let restore = ctx.restore_policy().resolve(graph)?;
        if !restore.is_empty() {
            info!(nodes = restore.len(), "restoring nodes to float");
        }

        let mut rw = Rewriter::new(&self.config, graph, ctx, restore);
        for node in graph.nodes() {
            rw.visit(node)?;
        }
        let out = rw.finish()?;
        info!(
            nodes = out.graph.len(),
            outputs = out.output_scales.len(),
            precision = self.config.precision,
            "quantized graph"
        );
        Ok(out)
    }
}

// ===========================================================================
// Rewriter
// ===========================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
enum Repr {
    Fixed { scale: ScaleExp, precision: u32 },
    /// Restored to float; the value is in real units.
    Real,
}

#[derive(Debug, Clone)]
struct Operand {
    edge: Edge,
    scale: ScaleExp,
    precision: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ConstRequest {
    /// Own scale, chosen from the payload range.
    Auto,
    /// A fixed scale (biases at the accumulator scale).
    Exact(ScaleExp),
    /// Untouched float payload for restored consumers.
    Float,
}

struct Rewriter<'a> {
    cfg: &'a QuantConfig,
    graph: &'a Graph,
    ctx: &'a QuantContext,
    restore: BTreeSet<String>,
    reserved: HashSet<&'a str>,
    out: GraphBuilder,
    values: HashMap<String, (Edge, Repr)>,
    constants: HashMap<(String, ConstRequest), Operand>,
    dequantized: HashMap<String, Edge>,
    requantized: HashMap<String, Operand>,
    input_ext: BTreeMap<String, InputExt>,
    /// Original shapes, and whether the batch dim was bound.
    shapes: Option<(BTreeMap<String, Vec<usize>>, bool)>,
}

impl<'a> Rewriter<'a> {
    fn new(cfg: &'a QuantConfig, graph: &'a Graph, ctx: &'a QuantContext, restore: BTreeSet<String>) -> Self {
        Self {
            cfg,
            graph,
            ctx,
            restore,
            reserved: graph.nodes().map(|n| n.name.as_str()).collect(),
            out: GraphBuilder::new(),
            values: HashMap::new(),
            constants: HashMap::new(),
            dequantized: HashMap::new(),
            requantized: HashMap::new(),
            input_ext: BTreeMap::new(),
            shapes: None,
        }
    }

    fn visit(&mut self, node: &Node) -> Result<()> {
        if node.kind() == OpKind::Constant {
            // materialized on first use
            return Ok(());
        }
        if self.restore.contains(&node.name) {
            return self.visit_restored(node);
        }

        match &node.op {
            Op::Placeholder { .. } => {
                let precision = self
                    .cfg
                    .input_precision
                    .or_else(|| self.ctx.precision(&node.name))
                    .unwrap_or(self.cfg.precision);
                let scale = scale_for(self.bound(&node.name)?, precision);
                let edge = self.out.push(node.clone());
                self.input_ext.insert(node.name.clone(), InputExt { scale: scale.value(), precision });
                self.values.insert(node.name.clone(), (edge, Repr::Fixed { scale, precision }));
                Ok(())
            }

            Op::Relu
            | Op::Flatten
            | Op::Reshape { .. }
            | Op::Transpose { .. }
            | Op::Slice { .. }
            | Op::MaxPool2d(_) => {
                let x = self.operand(&node.inputs[0])?;
                let edge = self.emit(node, node.op.clone(), vec![x.edge]);
                self.pass_through(node, edge, x.scale, x.precision)
            }

            Op::Clip { a_min, a_max } => {
                let x = self.operand(&node.inputs[0])?;
                let hi = fixed_point::max_int(x.precision) as f64;
                let s = x.scale.value();
                let lo_q = (a_min * s).round().clamp(-hi, hi);
                let hi_q = (a_max * s).round().clamp(-hi, hi);
                let precision = x.precision.min(precision_of(lo_q.abs().max(hi_q.abs()) as i64));
                let edge = self.emit(node, Op::Clip { a_min: lo_q, a_max: hi_q }, vec![x.edge]);
                self.pass_through(node, edge, x.scale, precision)
            }

            // no arithmetic: stays at the aligned (max) input scale
            Op::Concat { .. } => {
                let (edges, scale, precision) = self.aligned(node)?;
                let edge = self.emit(node, node.op.clone(), edges);
                self.pass_through(node, edge, scale, precision)
            }

            Op::Add | Op::Sub => {
                let (edges, scale, precision) = self.aligned(node)?;
                let precision = precision + 1;
                self.check_bits(node, precision)?;
                let edge = self.emit(node, node.op.clone(), edges);
                self.requantize(node, edge, scale, precision)
            }

            Op::Mul => {
                let a = self.operand(&node.inputs[0])?;
                let b = self.operand(&node.inputs[1])?;
                let scale = ScaleExp(a.scale.0 + b.scale.0);
                let precision = a.precision + b.precision;
                self.check_bits(node, precision)?;
                let edge = self.emit(node, Op::Mul, vec![a.edge, b.edge]);
                self.requantize(node, edge, scale, precision)
            }

            Op::Conv2d(_) | Op::Dense => self.visit_linear(node),

            Op::Softmax { axis } => self.visit_softmax(node, *axis),

            Op::Constant
            | Op::RightShift { .. }
            | Op::LeftShift { .. }
            | Op::CvmClip { .. }
            | Op::Quantize { .. }
            | Op::Dequantize { .. }
            | Op::SoftmaxLut { .. } => Err(QuantizeError::UnsupportedOp {
                op: node.kind().to_string(),
                node: node.name.clone(),
            }),
        }
    }

    fn visit_linear(&mut self, node: &Node) -> Result<()> {
        let x = self.operand(&node.inputs[0])?;
        let weight = self.constant_input(node, 1)?;
        let w = self.constant(weight, ConstRequest::Auto)?;

        let wshape = weight.payload().map(|p| p.shape().to_vec()).unwrap_or_default();
        let reduction: usize = match node.op {
            Op::Conv2d(_) => wshape.iter().skip(1).product(),
            _ => wshape.get(1).copied().unwrap_or(1),
        };

        let scale = ScaleExp(x.scale.0 + w.scale.0);
        let mut precision = x.precision + w.precision + ceil_log2(reduction);
        let mut inputs = vec![x.edge, w.edge];
        if node.inputs.len() > 2 {
            let bias = self.constant_input(node, 2)?;
            let b = self.constant(bias, ConstRequest::Exact(scale))?;
            precision = precision.max(b.precision) + 1;
            inputs.push(b.edge);
        }
        self.check_bits(node, precision)?;

        let edge = self.emit(node, node.op.clone(), inputs);
        self.requantize(node, edge, scale, precision)
    }

    fn visit_softmax(&mut self, node: &Node, axis: usize) -> Result<()> {
        let x = self.operand(&node.inputs[0])?;
        let precision = self.target_precision(&node.name);
        let lane = self.lane_len(&node.inputs[0], axis)?;
        self.check_bits(node, softmax::accumulator_bits(lane, precision))?;
        let plan = softmax::plan(self.cfg.softmax_lambd, x.scale);

        let mut input = x.edge;
        if plan.pre_shift > 0 {
            let name = self.fresh(&format!("{}_prescale", node.name));
            let op = Op::RightShift { shift_bit: plan.pre_shift, precision: x.precision };
            input = self.out.op(&name, op, &[input]);
        }
        let table_name = self.fresh(&format!("{}_table", node.name));
        let table = self.out.constant(&table_name, softmax::exp_table(plan.alpha, plan.scale));

        let op = Op::SoftmaxLut { axis, alpha: plan.alpha, precision };
        let edge = self.emit(node, op, vec![input, table]);
        debug!(node = %node.name, alpha = plan.alpha, pre_shift = plan.pre_shift, "softmax table");
        let scale = ScaleExp(precision as i32 - 1);
        self.values.insert(node.name.clone(), (edge, Repr::Fixed { scale, precision }));
        Ok(())
    }

    fn visit_restored(&mut self, node: &Node) -> Result<()> {
        let inputs = node
            .inputs
            .iter()
            .map(|e| self.float_input(e))
            .collect::<Result<Vec<_>>>()?;
        let edge = self.emit(node, node.op.clone(), inputs);
        debug!(node = %node.name, "restored");
        self.values.insert(node.name.clone(), (edge, Repr::Real));
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Operands
    // -----------------------------------------------------------------------

    /// The quantized value flowing along `edge`.
    fn operand(&mut self, edge: &Edge) -> Result<Operand> {
        let graph = self.graph;
        let producer = graph.node(&edge.node)?;
        if producer.kind() == OpKind::Constant {
            return self.constant(producer, ConstRequest::Auto);
        }
        let (realized, repr) = self.value(&edge.node)?;
        match repr {
            Repr::Fixed { scale, precision } => Ok(Operand { edge: realized, scale, precision }),
            Repr::Real => {
                if let Some(op) = self.requantized.get(&edge.node) {
                    return Ok(op.clone());
                }
                let precision = self.target_precision(&edge.node);
                let scale = scale_for(self.bound(&edge.node)?, precision);
                let name = self.fresh(&format!("{}_quantize", edge.node));
                let op = Op::Quantize { scale_exp: scale.0, precision };
                let operand = Operand { edge: self.out.op(&name, op, &[realized]), scale, precision };
                self.requantized.insert(edge.node.clone(), operand.clone());
                Ok(operand)
            }
        }
    }

    /// The real-valued tensor flowing along `edge`, for restored consumers.
    fn float_input(&mut self, edge: &Edge) -> Result<Edge> {
        let graph = self.graph;
        let producer = graph.node(&edge.node)?;
        if producer.kind() == OpKind::Constant {
            return Ok(self.constant(producer, ConstRequest::Float)?.edge);
        }
        let (realized, repr) = self.value(&edge.node)?;
        match repr {
            Repr::Real => Ok(realized),
            Repr::Fixed { scale, .. } => {
                if let Some(e) = self.dequantized.get(&edge.node) {
                    return Ok(e.clone());
                }
                let name = self.fresh(&format!("{}_dequantize", edge.node));
                let e = self.out.op(&name, Op::Dequantize { scale_exp: scale.0 }, &[realized]);
                self.dequantized.insert(edge.node.clone(), e.clone());
                Ok(e)
            }
        }
    }

    fn constant_input(&self, node: &Node, index: usize) -> Result<&'a Node> {
        let graph: &'a Graph = self.graph;
        let producer = graph.node(&node.inputs[index].node)?;
        if producer.kind() != OpKind::Constant {
            return Err(QuantizeError::graph(format!(
                "input {index} of '{}' must be a constant, found {} '{}'",
                node.name,
                producer.kind(),
                producer.name
            )));
        }
        Ok(producer)
    }

    /// Materialize a constant for one kind of consumer. Memoized per request.
    fn constant(&mut self, node: &Node, request: ConstRequest) -> Result<Operand> {
        let key = (node.name.clone(), request);
        if let Some(op) = self.constants.get(&key) {
            return Ok(op.clone());
        }
        let payload = node
            .payload()
            .ok_or_else(|| QuantizeError::not_found("payload", node.name.clone()))?;

        let (value, scale, precision, suffix) = match request {
            ConstRequest::Auto => {
                let precision = self.ctx.precision(&node.name).unwrap_or(self.cfg.precision);
                let bound = self
                    .ctx
                    .threshold(&node.name)
                    .unwrap_or_else(|| payload.iter().fold(0.0, |m: f64, v| m.max(v.abs())));
                let scale = scale_for(bound, precision);
                let q = payload.mapv(|v| fixed_point::encode(v, scale, precision) as f64);
                let precision = precision_of(max_abs(&q));
                (q, scale, precision, "q".to_string())
            }
            ConstRequest::Exact(scale) => {
                let factor = scale.value();
                let q = payload.mapv(|v| (v * factor).round());
                let precision = precision_of(max_abs(&q));
                self.check_bits_named(&node.name, precision)?;
                (q, scale, precision, format!("s{}", scale.0))
            }
            ConstRequest::Float => (payload.clone(), ScaleExp::IDENTITY, 0, "float".to_string()),
        };

        let name = if self.out.contains(&node.name) {
            self.fresh(&format!("{}_{suffix}", node.name))
        } else {
            node.name.clone()
        };
        let edge = self.out.constant(&name, value);
        let operand = Operand { edge, scale, precision };
        self.constants.insert(key, operand.clone());
        Ok(operand)
    }

    /// Bring every input of `node` to the finest input scale.
    fn aligned(&mut self, node: &Node) -> Result<(Vec<Edge>, ScaleExp, u32)> {
        let operands = node
            .inputs
            .iter()
            .map(|e| self.operand(e))
            .collect::<Result<Vec<_>>>()?;
        let scale = operands.iter().map(|o| o.scale).max().unwrap_or(ScaleExp::IDENTITY);

        let mut edges = Vec::with_capacity(operands.len());
        let mut precision = 0;
        for o in operands {
            let shift = (scale.0 - o.scale.0) as u32;
            if shift == 0 {
                precision = precision.max(o.precision);
                edges.push(o.edge);
                continue;
            }
            let p = o.precision + shift;
            self.check_bits(node, p)?;
            let name = self.fresh(&format!("{}_lshift", o.edge.node));
            edges.push(self.out.op(&name, Op::LeftShift { shift_bit: shift, precision: p }, &[o.edge]));
            precision = precision.max(p);
        }
        Ok((edges, scale, precision))
    }

    // -----------------------------------------------------------------------
    // Results
    // -----------------------------------------------------------------------

    /// Bring an accumulator down to the node's calibrated target.
    fn requantize(&mut self, node: &Node, acc: Edge, scale: ScaleExp, precision: u32) -> Result<()> {
        let target = self.target_precision(&node.name);
        let want = scale_for(self.bound(&node.name)?, target);
        let excess = scale.0 - want.0;

        let (edge, scale, precision) = if excess > self.cfg.shift_bits as i32 {
            let name = self.fresh(&format!("{}_requant", node.name));
            let op = Op::RightShift { shift_bit: excess as u32, precision: target };
            (self.out.op(&name, op, &[acc]), want, target)
        } else {
            let limit = target + excess.max(0) as u32;
            if precision > limit {
                let name = self.fresh(&format!("{}_clip", node.name));
                (self.out.op(&name, Op::CvmClip { precision: limit }, &[acc]), scale, limit)
            } else {
                (acc, scale, precision)
            }
        };
        debug!(node = %node.name, %scale, precision, "requantized");
        self.values.insert(node.name.clone(), (edge, Repr::Fixed { scale, precision }));
        Ok(())
    }

    /// Record a scale-preserving result; outputs still honor `output_precision`.
    fn pass_through(&mut self, node: &Node, edge: Edge, scale: ScaleExp, precision: u32) -> Result<()> {
        let forced = self.graph.is_output(&node.name)
            && self.cfg.output_precision.is_some_and(|p| precision > p);
        if forced {
            return self.requantize(node, edge, scale, precision);
        }
        self.values.insert(node.name.clone(), (edge, Repr::Fixed { scale, precision }));
        Ok(())
    }

    fn finish(mut self) -> Result<QuantOutput> {
        let mut outputs = Vec::new();
        let mut output_names = Vec::new();
        let mut output_scales = Vec::new();
        let graph = self.graph;
        for e in graph.outputs() {
            let producer = graph.node(&e.node)?;
            let (edge, repr) = if producer.kind() == OpKind::Constant {
                let o = self.constant(producer, ConstRequest::Auto)?;
                (o.edge, Repr::Fixed { scale: o.scale, precision: o.precision })
            } else {
                self.value(&e.node)?
            };
            outputs.push(edge);
            output_names.push(e.node.clone());
            output_scales.push(match repr {
                Repr::Fixed { scale, .. } => scale.value(),
                Repr::Real => 1.0,
            });
        }

        let mut name_map = BTreeMap::new();
        let mut scales = BTreeMap::new();
        let mut precisions = BTreeMap::new();
        for (name, (edge, repr)) in &self.values {
            name_map.insert(name.clone(), edge.node.clone());
            match repr {
                Repr::Fixed { scale, precision } => {
                    scales.insert(name.clone(), scale.value());
                    precisions.insert(name.clone(), *precision);
                }
                Repr::Real => {
                    scales.insert(name.clone(), 1.0);
                }
            }
        }

        Ok(QuantOutput {
            graph: self.out.build(outputs)?,
            output_names,
            output_scales,
            input_ext: self.input_ext,
            name_map,
            scales,
            precisions,
        })
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    /// Length of the `axis` lanes of the original tensor on `edge`.
    fn lane_len(&mut self, edge: &Edge, axis: usize) -> Result<usize> {
        if self.shapes.is_none() {
            // an unbound batch dim is pinned to 1 and cannot size a lane
            let shapes = match infer_shapes(self.graph) {
                Ok(shapes) => (shapes, true),
                Err(_) => (infer_shapes(&crate::transform::rebatch(self.graph, 1)?)?, false),
            };
            self.shapes = Some(shapes);
        }
        let (shapes, batch_bound) = self.shapes.as_ref().ok_or_else(|| QuantizeError::shape("no shapes"))?;
        if axis == 0 && !batch_bound {
            return Err(QuantizeError::shape(format!(
                "softmax over the unbound batch axis of '{}'",
                edge.node
            )));
        }
        shapes
            .get(&edge.node)
            .and_then(|shape| shape.get(axis).copied())
            .ok_or_else(|| QuantizeError::shape(format!("'{}' has no axis {axis}", edge.node)))
    }

    fn value(&self, name: &str) -> Result<(Edge, Repr)> {
        self.values.get(name).cloned().ok_or_else(|| QuantizeError::not_found("node", name))
    }

    fn bound(&self, name: &str) -> Result<f64> {
        self.ctx
            .bound(name)
            .ok_or_else(|| QuantizeError::MissingCalibration { name: name.to_string() })
    }

    fn target_precision(&self, name: &str) -> u32 {
        match self.cfg.output_precision {
            Some(p) if self.graph.is_output(name) => p,
            _ => self.ctx.precision(name).unwrap_or(self.cfg.precision),
        }
    }

    fn check_bits(&self, node: &Node, bits: u32) -> Result<()> {
        self.check_bits_named(&node.name, bits)
    }

    fn check_bits_named(&self, name: &str, bits: u32) -> Result<()> {
        if bits > ACCUMULATOR_BITS {
            return Err(QuantizeError::OverflowPolicy {
                node: name.to_string(),
                required_bits: bits,
                limit: ACCUMULATOR_BITS,
            });
        }
        Ok(())
    }

    fn emit(&mut self, node: &Node, op: Op, inputs: Vec<Edge>) -> Edge {
        self.out.push(Node::new(node.name.clone(), op, inputs))
    }

    fn fresh(&self, base: &str) -> String {
        self.out.fresh_name(base, &self.reserved)
    }
}

fn max_abs(t: &Tensor) -> i64 {
    t.iter().fold(0.0, |m: f64, v| m.max(v.abs())) as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::{Calibrator, RangeMethod};
    use crate::context::RestorePolicy;
    use crate::graph::{Conv2dParams, GraphBuilder};
    use crate::runtime::{Device, Executor, Interpreter};
    use ndarray::{arr1, arr2, Array};

    fn calibrated(g: &Graph, batch: Tensor) -> QuantContext {
        let mut ctx = QuantContext::new();
        Calibrator::new(RangeMethod::MaxAbs)
            .calibrate(g, &mut ctx, &batch, &Interpreter)
            .unwrap();
        ctx
    }

    fn conv_1x1() -> Graph {
        let mut b = GraphBuilder::new();
        let x = b.placeholder("data", &[1, 1, 1, 1]);
        let w = b.constant("w", Array::from_elem(vec![1, 1, 1, 1], 2.0));
        let c = b.op("conv", Op::Conv2d(Conv2dParams::default()), &[x, w]);
        b.build(vec![c]).unwrap()
    }

    #[test]
    fn test_single_conv() {
        let g = conv_1x1();
        let batch = Array::from_elem(vec![1, 1, 1, 1], 4.0);
        let ctx = calibrated(&g, batch.clone());
        let out = Quantizer::default().quantize(&g, &ctx).unwrap();

        // 127 / 4 -> 2^4 for the input, 127 / 2 -> 2^5 for the weight
        assert_eq!(out.input_ext["data"], InputExt { scale: 16.0, precision: 8 });
        let w = out.graph.node("w").unwrap().payload().unwrap();
        assert_eq!(w.iter().copied().collect::<Vec<_>>(), [64.0]);
        // accumulator at 2^9, output bound 8 wants 2^3
        assert_eq!(
            out.graph.node("conv_requant").unwrap().op,
            Op::RightShift { shift_bit: 6, precision: 8 }
        );
        assert_eq!(out.output_scales, [8.0]);
        assert_eq!(out.name_map["conv"], "conv_requant");

        let feeds = out.encode_inputs(&BTreeMap::from([("data".to_string(), batch)])).unwrap();
        let y = Interpreter.run(&out.graph, &feeds, &Device::Cpu).unwrap();
        let real = out.decode_outputs(&y);
        assert_eq!(real[0].iter().copied().collect::<Vec<_>>(), [8.0]);
    }

    #[test]
    fn test_missing_calibration() {
        let g = conv_1x1();
        let err = Quantizer::default().quantize(&g, &QuantContext::new()).unwrap_err();
        assert!(matches!(err, QuantizeError::MissingCalibration { ref name } if name == "data"));
    }

    #[test]
    fn test_bias_at_accumulator_scale() {
        let mut b = GraphBuilder::new();
        let x = b.placeholder("x", &[1, 2]);
        let w = b.constant("w", arr2(&[[1.0, -1.0]]).into_dyn());
        let bias = b.constant("b", arr1(&[0.5]).into_dyn());
        let d = b.op("fc", Op::Dense, &[x, w, bias]);
        let g = b.build(vec![d]).unwrap();

        let ctx = calibrated(&g, arr2(&[[1.0, 0.5]]).into_dyn());
        let out = Quantizer::default().quantize(&g, &ctx).unwrap();
        // x: 127/1 -> 2^6, w: 127/1 -> 2^6, bias at 2^12
        let bias = out.graph.node("b").unwrap().payload().unwrap();
        assert_eq!(bias.iter().copied().collect::<Vec<_>>(), [2048.0]);
    }

    #[test]
    fn test_overflow_is_reported() {
        let mut b = GraphBuilder::new();
        let x = b.placeholder("x", &[1, 2]);
        let w = b.constant("w", arr2(&[[1.0, 1.0]]).into_dyn());
        let d = b.op("fc", Op::Dense, &[x, w]);
        let g = b.build(vec![d]).unwrap();
        let ctx = calibrated(&g, arr2(&[[1.0, 1.0]]).into_dyn());

        let q = Quantizer::new(QuantConfig::default().with_precision(16));
        // 16 + 16 + 1 = 33 bits
        let err = q.quantize(&g, &ctx).unwrap_err();
        assert!(matches!(
            err,
            QuantizeError::OverflowPolicy { ref node, required_bits: 33, limit: 32 } if node == "fc"
        ));
    }

    #[test]
    fn test_restored_node_keeps_float_op() {
        let mut b = GraphBuilder::new();
        let x = b.placeholder("x", &[1, 3]);
        let s = b.op("sm", Op::Softmax { axis: 1 }, &[x]);
        let r = b.op("r", Op::Relu, &[s]);
        let g = b.build(vec![r]).unwrap();

        let mut ctx = calibrated(&g, arr2(&[[1.0, 2.0, 3.0]]).into_dyn());
        ctx.set_restore_policy(RestorePolicy::parse(&["sm"]).unwrap());
        let out = Quantizer::default().quantize(&g, &ctx).unwrap();

        assert_eq!(out.graph.node("sm").unwrap().op, Op::Softmax { axis: 1 });
        assert_eq!(out.graph.node("sm").unwrap().inputs, [Edge::new("x_dequantize")]);
        assert_eq!(out.graph.node("r").unwrap().inputs, [Edge::new("sm_quantize")]);
        assert_eq!(out.scales["sm"], 1.0);
    }

    #[test]
    fn test_add_aligns_scales() {
        let mut b = GraphBuilder::new();
        let x = b.placeholder("x", &[1, 2]);
        let y = b.placeholder("y", &[1, 2]);
        let s = b.op("s", Op::Add, &[x, y]);
        let g = b.build(vec![s]).unwrap();

        let mut ctx = QuantContext::new();
        let feeds = BTreeMap::from([
            ("x".to_string(), arr2(&[[1.0, -1.0]]).into_dyn()),
            ("y".to_string(), arr2(&[[4.0, 0.5]]).into_dyn()),
        ]);
        Calibrator::new(RangeMethod::MaxAbs)
            .calibrate_feeds(&g, &mut ctx, &feeds, &Interpreter)
            .unwrap();
        let out = Quantizer::default().quantize(&g, &ctx).unwrap();

        // x at 2^6, y at 2^4: y is shifted up by two bits
        assert_eq!(
            out.graph.node("y_lshift").unwrap().op,
            Op::LeftShift { shift_bit: 2, precision: 10 }
        );
        let q = out.encode_inputs(&feeds).unwrap();
        let got = out.decode_outputs(&Interpreter.run(&out.graph, &q, &Device::Cpu).unwrap());
        let want = [5.0, -0.5];
        for (g, w) in got[0].iter().zip(want) {
            assert!((g - w).abs() <= 0.25, "{g} vs {w}");
        }
    }

    #[test]
    fn test_softmax_lut_close_to_float() {
        let mut b = GraphBuilder::new();
        let x = b.placeholder("x", &[1, 4]);
        let s = b.op("sm", Op::Softmax { axis: 1 }, &[x]);
        let g = b.build(vec![s]).unwrap();
        let batch = arr2(&[[0.5, 1.0, -2.0, 3.0]]).into_dyn();
        let ctx = calibrated(&g, batch.clone());
        let out = Quantizer::default().quantize(&g, &ctx).unwrap();
        assert_eq!(out.graph.node("sm").unwrap().kind(), OpKind::SoftmaxLut);
        assert_eq!(out.output_scales, [128.0]);

        let feeds = BTreeMap::from([("x".to_string(), batch.clone())]);
        let want = Interpreter.run(&g, &feeds, &Device::Cpu).unwrap();
        let q = out.encode_inputs(&feeds).unwrap();
        let got = out.decode_outputs(&Interpreter.run(&out.graph, &q, &Device::Cpu).unwrap());
        for (g, w) in got[0].iter().zip(want[0].iter()) {
            assert!((g - w).abs() < 0.05, "{g} vs {w}");
        }
    }

    #[test]
    fn test_softmax_overflow_is_reported() {
        let mut b = GraphBuilder::new();
        let x = b.placeholder("x", &[1, 4]);
        let s = b.op("sm", Op::Softmax { axis: 1 }, &[x]);
        let g = b.build(vec![s]).unwrap();
        let ctx = calibrated(&g, arr2(&[[0.5, 1.0, -2.0, 3.0]]).into_dyn());

        // 2^16 * 2^15 needs 32 magnitude bits plus sign
        let err = Quantizer::new(QuantConfig::default().with_precision(16)).quantize(&g, &ctx).unwrap_err();
        assert!(matches!(
            err,
            QuantizeError::OverflowPolicy { ref node, required_bits: 33, limit: 32 } if node == "sm"
        ));
    }

    #[test]
    fn test_concat_keeps_max_input_scale() {
        let mut b = GraphBuilder::new();
        let x = b.placeholder("x", &[1, 2]);
        let y = b.placeholder("y", &[1, 2]);
        let c = b.op("c", Op::Concat { axis: 1 }, &[x, y]);
        let g = b.build(vec![c]).unwrap();

        let mut ctx = QuantContext::new();
        let feeds = BTreeMap::from([
            ("x".to_string(), arr2(&[[1.0, -1.0]]).into_dyn()),
            ("y".to_string(), arr2(&[[4.0, 0.5]]).into_dyn()),
        ]);
        Calibrator::new(RangeMethod::MaxAbs)
            .calibrate_feeds(&g, &mut ctx, &feeds, &Interpreter)
            .unwrap();
        let out = Quantizer::default().quantize(&g, &ctx).unwrap();

        // x at 2^6, y at 2^4 shifted up two bits, no shift back down
        assert_eq!(
            out.graph.node("y_lshift").unwrap().op,
            Op::LeftShift { shift_bit: 2, precision: 10 }
        );
        assert!(out.graph.nodes().all(|n| n.kind() != OpKind::RightShift));
        assert_eq!(out.output_scales, [64.0]);
        assert_eq!(out.precisions["c"], 10);

        let q = out.encode_inputs(&feeds).unwrap();
        let got = out.decode_outputs(&Interpreter.run(&out.graph, &q, &Device::Cpu).unwrap());
        assert_eq!(got[0].iter().copied().collect::<Vec<_>>(), [1.0, -1.0, 4.0, 0.5]);
    }

    fn relu_graph() -> (Graph, QuantContext) {
        let mut b = GraphBuilder::new();
        let x = b.placeholder("x", &[1, 2]);
        let r = b.op("r", Op::Relu, &[x]);
        let g = b.build(vec![r]).unwrap();
        let ctx = calibrated(&g, arr2(&[[1.0, -1.0]]).into_dyn());
        (g, ctx)
    }

    #[test]
    fn test_input_precision_override() {
        let (g, ctx) = relu_graph();
        let cfg = QuantConfig { input_precision: Some(6), ..QuantConfig::default() };
        let out = Quantizer::new(cfg).quantize(&g, &ctx).unwrap();

        // 31 / 1 -> 2^4 at six bits
        assert_eq!(out.input_ext["x"], InputExt { scale: 16.0, precision: 6 });
        assert_eq!(out.output_scales, [16.0]);
        assert_eq!(out.precisions["r"], 6);
    }

    #[test]
    fn test_output_precision_narrows_pass_through() {
        let (g, ctx) = relu_graph();
        let cfg = QuantConfig { output_precision: Some(4), ..QuantConfig::default() };
        let out = Quantizer::new(cfg).quantize(&g, &ctx).unwrap();

        // relu stays at 2^6 / 8 bits, the output wants 7 / 1 -> 2^2 at 4 bits
        assert_eq!(out.input_ext["x"], InputExt { scale: 64.0, precision: 8 });
        assert_eq!(
            out.graph.node("r_requant").unwrap().op,
            Op::RightShift { shift_bit: 4, precision: 4 }
        );
        assert_eq!(out.output_scales, [4.0]);
        assert_eq!(out.precisions["r"], 4);
    }

    #[test]
    fn test_shift_bits_budget() {
        let g = conv_1x1();
        let ctx = calibrated(&g, Array::from_elem(vec![1, 1, 1, 1], 4.0));

        // excess 6 within a budget of 6: keep 2^9 and clip to 8 + 6 bits
        let cfg = QuantConfig { shift_bits: 6, ..QuantConfig::default() };
        let out = Quantizer::new(cfg).quantize(&g, &ctx).unwrap();
        assert_eq!(out.graph.node("conv_clip").unwrap().op, Op::CvmClip { precision: 14 });
        assert!(!out.graph.contains("conv_requant"));
        assert_eq!(out.output_scales, [512.0]);
        assert_eq!(out.precisions["conv"], 14);

        let feeds = BTreeMap::from([("data".to_string(), Array::from_elem(vec![1, 1, 1, 1], 4.0))]);
        let y = Interpreter.run(&out.graph, &out.encode_inputs(&feeds).unwrap(), &Device::Cpu).unwrap();
        assert_eq!(out.decode_outputs(&y)[0].iter().copied().collect::<Vec<_>>(), [8.0]);

        // one bit short of the excess: shift down to the target
        let cfg = QuantConfig { shift_bits: 5, ..QuantConfig::default() };
        let out = Quantizer::new(cfg).quantize(&g, &ctx).unwrap();
        assert_eq!(
            out.graph.node("conv_requant").unwrap().op,
            Op::RightShift { shift_bit: 6, precision: 8 }
        );
        assert_eq!(out.output_scales, [8.0]);
    }
}
