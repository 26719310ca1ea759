//! Cutting a graph into a quantizable base and a float top.

use super::{fix_batch, shape::infer_shapes};
use crate::errors::{QuantizeError, Result};
use crate::graph::{Edge, Graph, Node, Op, OpKind};
use std::collections::{BTreeSet, HashSet};
use tracing::debug;

/// Split `graph` at the boundary nodes `keys`.
///
/// The base holds every ancestor of the boundary (boundaries included) and
/// outputs the boundaries in sorted name order. The top holds everything
/// between the boundaries and the original outputs; each boundary becomes
/// a placeholder of the same name, again in sorted order. Constants the top
/// needs are copied into it.
pub fn split<S: AsRef<str>>(graph: &Graph, keys: &[S]) -> Result<(Graph, Graph)> {
    let keys: BTreeSet<String> = keys.iter().map(|k| k.as_ref().to_string()).collect();
    if keys.is_empty() {
        return Err(QuantizeError::graph("split needs at least one boundary node"));
    }
    for key in &keys {
        let node = graph.get(key).ok_or_else(|| QuantizeError::not_found("boundary", key.clone()))?;
        if node.kind() == OpKind::Constant {
            return Err(QuantizeError::graph(format!("boundary '{key}' is a constant")));
        }
    }

    let base_set = graph.ancestors(&keys.iter().collect::<Vec<_>>())?;
    let base_nodes: Vec<Node> = graph.nodes().filter(|n| base_set.contains(&n.name)).cloned().collect();
    let base = Graph::new(base_nodes, keys.iter().map(Edge::new).collect())?;

    // Walk back from the outputs, stopping at boundaries.
    let mut top_set = HashSet::new();
    let mut stack: Vec<&str> = graph.outputs().iter().map(|e| e.node.as_str()).collect();
    while let Some(name) = stack.pop() {
        if keys.contains(name) || !top_set.insert(name.to_string()) {
            continue;
        }
        let node = graph.node(name)?;
        if base_set.contains(name) && node.kind() != OpKind::Constant {
            return Err(QuantizeError::graph(format!(
                "boundary does not separate the graph: '{name}' is needed above the cut"
            )));
        }
        stack.extend(node.inputs.iter().map(|e| e.node.as_str()));
    }

    let shapes = boundary_shapes(graph, &keys)?;
    let mut top_nodes: Vec<Node> = keys
        .iter()
        .zip(shapes)
        .map(|(key, shape)| Node::placeholder(key.clone(), shape))
        .collect();
    top_nodes.extend(graph.nodes().filter(|n| top_set.contains(&n.name)).cloned());
    let top = Graph::new(top_nodes, graph.outputs().to_vec())?;

    debug!(base = base.len(), top = top.len(), boundaries = keys.len(), "split graph");
    Ok((base, top))
}

/// Shapes of the boundary tensors. An unbound batch dimension stays `-1`.
fn boundary_shapes(graph: &Graph, keys: &BTreeSet<String>) -> Result<Vec<Vec<i64>>> {
    let unbound_batch = graph.inputs().any(|n| match &n.op {
        Op::Placeholder { shape } => shape.first() == Some(&-1),
        _ => false,
    });
    let shapes = if unbound_batch { infer_shapes(&fix_batch(graph, 1)?)? } else { infer_shapes(graph)? };

    keys.iter()
        .map(|key| {
            let mut shape: Vec<i64> = shapes
                .get(key)
                .ok_or_else(|| QuantizeError::not_found("node", key.clone()))?
                .iter()
                .map(|&d| d as i64)
                .collect();
            if unbound_batch {
                if let Some(first) = shape.first_mut() {
                    *first = -1;
                }
            }
            Ok(shape)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphBuilder;
    use ndarray::arr1;

    fn chain() -> Graph {
        let mut b = GraphBuilder::new();
        let a = b.placeholder("A", &[1, 4]);
        let r = b.op("B", Op::Relu, &[a]);
        let c = b.op("C", Op::Relu, &[r]);
        b.build(vec![c]).unwrap()
    }

    #[test]
    fn test_split_chain() {
        let (base, top) = split(&chain(), &["B"]).unwrap();
        let names: Vec<_> = base.nodes().map(|n| n.name.as_str()).collect();
        assert_eq!(names, ["A", "B"]);
        assert_eq!(base.outputs(), [Edge::new("B")]);

        let names: Vec<_> = top.nodes().map(|n| n.name.as_str()).collect();
        assert_eq!(names, ["B", "C"]);
        assert_eq!(top.node("B").unwrap().kind(), OpKind::Placeholder);
        assert_eq!(top.outputs(), [Edge::new("C")]);
    }

    #[test]
    fn test_split_unknown_key() {
        let err = split(&chain(), &["Z"]).unwrap_err();
        assert!(matches!(err, QuantizeError::NotFound { what: "boundary", .. }));
    }

    #[test]
    fn test_split_rejects_leaky_boundary() {
        // skip connection: x feeds both the boundary and the top
        let mut b = GraphBuilder::new();
        let x = b.placeholder("x", &[1, 3]);
        let r = b.op("r", Op::Relu, &[x.clone()]);
        let s = b.op("s", Op::Add, &[r, x]);
        let g = b.build(vec![s]).unwrap();
        assert!(matches!(split(&g, &["r"]), Err(QuantizeError::GraphTransform { .. })));
    }

    #[test]
    fn test_split_copies_shared_constants() {
        let mut b = GraphBuilder::new();
        let x = b.placeholder("x", &[-1, 3]);
        let k = b.constant("k", arr1(&[1.0, 2.0, 3.0]).into_dyn());
        let m = b.op("m", Op::Mul, &[x, k.clone()]);
        let n = b.op("n", Op::Mul, &[m, k]);
        let g = b.build(vec![n]).unwrap();

        let (base, top) = split(&g, &["m"]).unwrap();
        assert!(base.contains("k") && top.contains("k"));
        match &top.node("m").unwrap().op {
            Op::Placeholder { shape } => assert_eq!(shape, &[-1, 3]),
            other => panic!("unexpected op {other:?}"),
        }
    }
}
