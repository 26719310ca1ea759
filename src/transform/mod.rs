//! Graph-to-graph passes run before calibration.
//!
//! Every pass is pure: it takes a graph by reference and returns a new one.

pub mod shape;
pub mod split;

pub use shape::infer_shapes;
pub use split::split;

use crate::errors::{QuantizeError, Result};
use crate::graph::{Edge, Graph, Op, OpKind, StructuralKey};
use std::collections::HashMap;
use tracing::{debug, info};

/// Reject graphs containing operators the quantizer cannot take as input.
pub fn validate(graph: &Graph) -> Result<()> {
    for node in graph.nodes() {
        if node.kind().is_realized() {
            return Err(QuantizeError::UnsupportedOp {
                op: node.kind().to_string(),
                node: node.name.clone(),
            });
        }
    }
    if graph.outputs().is_empty() {
        return Err(QuantizeError::graph("graph has no outputs"));
    }
    Ok(())
}

/// Replace the shape of the graph's single input.
pub fn set_input_shape(graph: &Graph, shape: &[i64]) -> Result<Graph> {
    let count = graph.inputs().count();
    if count != 1 {
        return Err(QuantizeError::graph(format!(
            "an input shape can only be bound on single-input graphs, this one has {count}"
        )));
    }
    graph.map_nodes(|node| match node.op {
        Op::Placeholder { .. } => Ok(node.with_op(Op::Placeholder { shape: shape.to_vec() })),
        _ => Ok(node.clone()),
    })
}

/// Bind every unbound leading (batch) dimension to `batch`.
///
/// An unbound dimension anywhere else cannot be fixed and is an error.
pub fn fix_batch(graph: &Graph, batch: usize) -> Result<Graph> {
    graph.map_nodes(|node| match &node.op {
        Op::Placeholder { shape } => {
            let shape = shape
                .iter()
                .enumerate()
                .map(|(axis, &d)| match (axis, d) {
                    (0, -1) => Ok(batch as i64),
                    (_, d) if d < 0 => Err(QuantizeError::shape(format!(
                        "input '{}' has unbound dimension at axis {axis}",
                        node.name
                    ))),
                    (_, d) => Ok(d),
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(node.with_op(Op::Placeholder { shape }))
        }
        _ => Ok(node.clone()),
    })
}

/// Rebind the batch dimension of every input, bound or not.
pub fn rebatch(graph: &Graph, batch: usize) -> Result<Graph> {
    graph.map_nodes(|node| match &node.op {
        Op::Placeholder { shape } if !shape.is_empty() => {
            let mut shape = shape.clone();
            shape[0] = batch as i64;
            Ok(node.with_op(Op::Placeholder { shape }))
        }
        _ => Ok(node.clone()),
    })
}

/// Merge structurally identical nodes.
///
/// Two nodes are identical when they have the same operator, attributes,
/// inputs (after earlier merges) and payload. Placeholders and graph outputs
/// are never merged away, so input and output names survive.
pub fn dedup(graph: &Graph) -> Result<Graph> {
    let mut seen: HashMap<StructuralKey, String> = HashMap::new();
    let mut rename: HashMap<String, String> = HashMap::new();
    let mut nodes = Vec::with_capacity(graph.len());

    for node in graph.nodes() {
        let mut node = node.clone();
        for edge in &mut node.inputs {
            if let Some(to) = rename.get(&edge.node) {
                edge.node = to.clone();
            }
        }
        if node.kind() == OpKind::Placeholder {
            nodes.push(node);
            continue;
        }
        let key = node.structural_key();
        let twin = seen.get(&key).filter(|_| !graph.is_output(&node.name)).cloned();
        if let Some(existing) = twin {
            debug!(node = %node.name, into = %existing, "dedup");
            rename.insert(node.name.clone(), existing);
        } else {
            seen.entry(key).or_insert_with(|| node.name.clone());
            nodes.push(node);
        }
    }

    let outputs = graph
        .outputs()
        .iter()
        .map(|e| Edge { node: rename.get(&e.node).cloned().unwrap_or_else(|| e.node.clone()), index: e.index })
        .collect();
    Graph::new(nodes, outputs)
}

/// Canonical preparation: validate, bind the input shape and a unit batch,
/// check shapes, then deduplicate.
pub fn prepare(graph: &Graph, input_shape: Option<&[i64]>) -> Result<Graph> {
    validate(graph)?;
    let bound = match input_shape {
        Some(shape) => set_input_shape(graph, shape)?,
        None => graph.clone(),
    };
    let bound = fix_batch(&bound, 1)?;
    infer_shapes(&bound)?;
    let prepared = dedup(&bound)?;
    info!(nodes = prepared.len(), removed = bound.len() - prepared.len(), "prepared graph");
    Ok(prepared)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphBuilder;
    use ndarray::arr1;

    #[test]
    fn test_validate_rejects_realized_ops() {
        let mut b = GraphBuilder::new();
        let x = b.placeholder("x", &[1, 2]);
        let r = b.op("shift", Op::RightShift { shift_bit: 2, precision: 8 }, &[x]);
        let g = b.build(vec![r]).unwrap();
        let err = validate(&g).unwrap_err();
        assert!(matches!(err, QuantizeError::UnsupportedOp { ref node, .. } if node == "shift"));
    }

    #[test]
    fn test_fix_batch() {
        let mut b = GraphBuilder::new();
        let x = b.placeholder("x", &[-1, 3]);
        let g = b.build(vec![x]).unwrap();
        let fixed = fix_batch(&g, 16).unwrap();
        assert_eq!(fixed.node("x").unwrap().op, Op::Placeholder { shape: vec![16, 3] });

        let mut b = GraphBuilder::new();
        let x = b.placeholder("x", &[1, -1]);
        let g = b.build(vec![x]).unwrap();
        assert!(matches!(fix_batch(&g, 16), Err(QuantizeError::Shape { .. })));
    }

    #[test]
    fn test_dedup_merges_twins() {
        let mut b = GraphBuilder::new();
        let x = b.placeholder("x", &[1, 3]);
        let k1 = b.constant("k1", arr1(&[1.0, 2.0, 3.0]).into_dyn());
        let k2 = b.constant("k2", arr1(&[1.0, 2.0, 3.0]).into_dyn());
        let m1 = b.op("m1", Op::Mul, &[x.clone(), k1]);
        let m2 = b.op("m2", Op::Mul, &[x, k2]);
        let s = b.op("s", Op::Add, &[m1, m2]);
        let g = b.build(vec![s]).unwrap();

        let d = dedup(&g).unwrap();
        assert_eq!(d.len(), 4);
        assert_eq!(d.node("s").unwrap().inputs, [Edge::new("m1"), Edge::new("m1")]);
    }

    #[test]
    fn test_prepare_binds_unit_batch() {
        let mut b = GraphBuilder::new();
        let x = b.placeholder("data", &[-1, 8]);
        let r = b.op("r", Op::Relu, &[x]);
        let g = b.build(vec![r]).unwrap();
        let p = prepare(&g, Some(&[-1, 4])).unwrap();
        assert_eq!(p.node("data").unwrap().op, Op::Placeholder { shape: vec![1, 4] });
    }
}
