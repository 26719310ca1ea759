//! Graph IR: nodes, edges, topological ordering and the serialized descriptor.
//!
//! A [`Graph`] owns its nodes exclusively and nodes refer to each other by
//! name only. Graphs are never mutated after construction; passes build new
//! graphs, either through [`Graph::map_nodes`] or a [`GraphBuilder`].
//! Constant payloads are reference counted, so cloning or rewriting a graph
//! does not copy weights.

pub mod ops;

pub use ops::{AttrValue, Conv2dParams, Op, OpKind, PoolParams};

use crate::errors::{QuantizeError, Result};
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// Dense tensor type used for payloads and runtime values.
pub type Tensor = ArrayD<f64>;

// ===========================================================================
// Edges and nodes
// ===========================================================================

/// Reference to one output of a producer node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Edge {
    pub node: String,
    pub index: usize,
}

impl Edge {
    pub fn new(node: impl Into<String>) -> Self {
        Self { node: node.into(), index: 0 }
    }

    /// Parse `"name"` or `"name:index"`.
    pub fn parse(s: &str) -> Result<Self> {
        match s.rsplit_once(':') {
            Some((node, idx)) => {
                let index = idx
                    .parse::<usize>()
                    .map_err(|_| QuantizeError::graph(format!("invalid edge reference '{s}'")))?;
                Ok(Self { node: node.to_string(), index })
            }
            None => Ok(Self::new(s)),
        }
    }
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.index == 0 {
            f.write_str(&self.node)
        } else {
            write!(f, "{}:{}", self.node, self.index)
        }
    }
}

/// One operator instance.
#[derive(Debug, Clone)]
pub struct Node {
    pub name: String,
    pub op: Op,
    pub inputs: Vec<Edge>,
    pub payload: Option<Arc<Tensor>>,
}

/// Hashable identity of a node's computation, used for deduplication.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StructuralKey {
    op: Op,
    inputs: Vec<Edge>,
    payload: Option<(Vec<usize>, Vec<u64>)>,
}

impl Node {
    pub fn new(name: impl Into<String>, op: Op, inputs: Vec<Edge>) -> Self {
        Self { name: name.into(), op, inputs, payload: None }
    }

    pub fn placeholder(name: impl Into<String>, shape: Vec<i64>) -> Self {
        Self::new(name, Op::Placeholder { shape }, Vec::new())
    }

    pub fn constant(name: impl Into<String>, value: Tensor) -> Self {
        Self { name: name.into(), op: Op::Constant, inputs: Vec::new(), payload: Some(Arc::new(value)) }
    }

    pub fn kind(&self) -> OpKind {
        self.op.kind()
    }

    pub fn payload(&self) -> Option<&Tensor> {
        self.payload.as_deref()
    }

    /// Clone of this node with a different operator.
    pub fn with_op(&self, op: Op) -> Node {
        Node { op, ..self.clone() }
    }

    pub fn structural_key(&self) -> StructuralKey {
        StructuralKey {
            op: self.op.clone(),
            inputs: self.inputs.clone(),
            payload: self.payload().map(|t| {
                (t.shape().to_vec(), t.iter().map(|v| v.to_bits()).collect())
            }),
        }
    }
}

// ===========================================================================
// Graph
// ===========================================================================

/// An ordered acyclic collection of nodes with designated outputs.
///
/// Invariant: every node's inputs appear strictly before it in `nodes`.
#[derive(Debug, Clone)]
pub struct Graph {
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
    outputs: Vec<Edge>,
}

impl Graph {
    /// Build a graph from nodes that are already in topological order.
    pub fn new(nodes: Vec<Node>, outputs: Vec<Edge>) -> Result<Self> {
        let mut index = HashMap::with_capacity(nodes.len());
        for (i, node) in nodes.iter().enumerate() {
            if index.insert(node.name.clone(), i).is_some() {
                return Err(QuantizeError::graph(format!("duplicate node name '{}'", node.name)));
            }
        }

        for (i, node) in nodes.iter().enumerate() {
            let kind = node.kind();
            let (lo, hi) = kind.arity();
            if node.inputs.len() < lo || node.inputs.len() > hi {
                return Err(QuantizeError::graph(format!(
                    "node '{}' ({kind}) has {} inputs",
                    node.name,
                    node.inputs.len()
                )));
            }
            if kind == OpKind::Constant && node.payload.is_none() {
                return Err(QuantizeError::graph(format!("constant '{}' has no payload", node.name)));
            }
            for edge in &node.inputs {
                match index.get(&edge.node) {
                    None => return Err(QuantizeError::not_found("node", edge.node.clone())),
                    Some(&j) if j >= i => {
                        return Err(QuantizeError::graph(format!(
                            "node '{}' consumes '{}' before it is defined",
                            node.name, edge.node
                        )))
                    }
                    Some(_) => {}
                }
                if edge.index != 0 {
                    return Err(QuantizeError::graph(format!(
                        "node '{}' references output {} of single-output node '{}'",
                        node.name, edge.index, edge.node
                    )));
                }
            }
        }

        for edge in &outputs {
            if !index.contains_key(&edge.node) {
                return Err(QuantizeError::not_found("output", edge.node.clone()));
            }
        }

        Ok(Self { nodes, index, outputs })
    }

    /// Build a graph from nodes in any order, sorting them topologically.
    ///
    /// Ties are broken by declaration order, so the result is deterministic.
    pub fn from_unordered(nodes: Vec<Node>, outputs: Vec<Edge>) -> Result<Self> {
        let position: HashMap<&str, usize> =
            nodes.iter().enumerate().map(|(i, n)| (n.name.as_str(), i)).collect();

        let mut pending = vec![0usize; nodes.len()];
        let mut consumers: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
        for (i, node) in nodes.iter().enumerate() {
            for edge in &node.inputs {
                let &j = position
                    .get(edge.node.as_str())
                    .ok_or_else(|| QuantizeError::not_found("node", edge.node.clone()))?;
                pending[i] += 1;
                consumers[j].push(i);
            }
        }

        let mut ready: BTreeSet<usize> = (0..nodes.len()).filter(|&i| pending[i] == 0).collect();
        let mut order = Vec::with_capacity(nodes.len());
        while let Some(i) = ready.pop_first() {
            order.push(i);
            for &c in &consumers[i] {
                pending[c] -= 1;
                if pending[c] == 0 {
                    ready.insert(c);
                }
            }
        }

        if order.len() != nodes.len() {
            let stuck: Vec<&str> = (0..nodes.len())
                .filter(|&i| pending[i] > 0)
                .map(|i| nodes[i].name.as_str())
                .collect();
            return Err(QuantizeError::graph(format!("graph contains a cycle through {stuck:?}")));
        }

        let mut slots: Vec<Option<Node>> = nodes.into_iter().map(Some).collect();
        let sorted = order.into_iter().filter_map(|i| slots[i].take()).collect();
        Self::new(sorted, outputs)
    }

    /// Nodes in topological order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Look up a node by name.
    pub fn node(&self, name: &str) -> Result<&Node> {
        self.get(name).ok_or_else(|| QuantizeError::not_found("node", name))
    }

    pub fn get(&self, name: &str) -> Option<&Node> {
        self.index.get(name).map(|&i| &self.nodes[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Topological position of a node.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Placeholder nodes, in topological order.
    pub fn inputs(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| n.kind() == OpKind::Placeholder)
    }

    pub fn outputs(&self) -> &[Edge] {
        &self.outputs
    }

    pub fn is_output(&self, name: &str) -> bool {
        self.outputs.iter().any(|e| e.node == name)
    }

    /// Consumer names per producer, each list in topological order.
    pub fn consumers(&self) -> HashMap<&str, Vec<&str>> {
        let mut map: HashMap<&str, Vec<&str>> = HashMap::new();
        for node in &self.nodes {
            for edge in &node.inputs {
                let list = map.entry(edge.node.as_str()).or_default();
                if list.last() != Some(&node.name.as_str()) {
                    list.push(node.name.as_str());
                }
            }
        }
        map
    }

    /// Every node that `roots` depend on, including the roots themselves.
    pub fn ancestors<S: AsRef<str>>(&self, roots: &[S]) -> Result<HashSet<String>> {
        let mut seen = HashSet::new();
        let mut stack = Vec::new();
        for root in roots {
            let node = self.node(root.as_ref())?;
            stack.push(node);
        }
        while let Some(node) = stack.pop() {
            if seen.insert(node.name.clone()) {
                for edge in &node.inputs {
                    stack.push(self.node(&edge.node)?);
                }
            }
        }
        Ok(seen)
    }

    /// New graph with every node passed through `f`; outputs are kept.
    pub fn map_nodes<F>(&self, mut f: F) -> Result<Graph>
    where
        F: FnMut(&Node) -> Result<Node>,
    {
        let nodes = self.nodes.iter().map(&mut f).collect::<Result<Vec<_>>>()?;
        Graph::new(nodes, self.outputs.clone())
    }

    /// Constant payloads by node name.
    pub fn payloads(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.nodes
            .iter()
            .filter_map(|n| n.payload().map(|p| (n.name.as_str(), p)))
    }

    /// Serializable descriptor (payloads are stored separately).
    pub fn to_def(&self) -> GraphDef {
        GraphDef {
            nodes: self
                .nodes
                .iter()
                .map(|n| NodeDef {
                    name: n.name.clone(),
                    op: n.kind().name().to_string(),
                    attrs: n.op.attrs().into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
                    inputs: n.inputs.iter().map(Edge::to_string).collect(),
                })
                .collect(),
            outputs: self.outputs.iter().map(Edge::to_string).collect(),
        }
    }

    /// Rebuild a graph from its descriptor plus payloads keyed by node name.
    pub fn from_def(def: &GraphDef, payloads: &HashMap<String, Tensor>) -> Result<Graph> {
        let mut nodes = Vec::with_capacity(def.nodes.len());
        for nd in &def.nodes {
            let kind = nd.op.parse::<OpKind>().map_err(|op| QuantizeError::UnsupportedOp {
                op,
                node: nd.name.clone(),
            })?;
            let op = Op::from_attrs(kind, &nd.attrs, &nd.name)?;
            let inputs = nd.inputs.iter().map(|s| Edge::parse(s)).collect::<Result<Vec<_>>>()?;
            let payload = if kind == OpKind::Constant {
                let value = payloads
                    .get(&nd.name)
                    .ok_or_else(|| QuantizeError::not_found("payload", nd.name.clone()))?;
                Some(Arc::new(value.clone()))
            } else {
                None
            };
            nodes.push(Node { name: nd.name.clone(), op, inputs, payload });
        }
        let outputs = def.outputs.iter().map(|s| Edge::parse(s)).collect::<Result<Vec<_>>>()?;
        Graph::from_unordered(nodes, outputs)
    }

    /// Node count per operator kind, for reporting.
    pub fn op_histogram(&self) -> BTreeMap<OpKind, usize> {
        let mut hist = BTreeMap::new();
        for node in &self.nodes {
            *hist.entry(node.kind()).or_insert(0) += 1;
        }
        hist
    }
}

impl PartialEq for Graph {
    /// Structural equality: same nodes in the same order, same outputs.
    fn eq(&self, other: &Self) -> bool {
        self.outputs == other.outputs
            && self.nodes.len() == other.nodes.len()
            && self
                .nodes
                .iter()
                .zip(&other.nodes)
                .all(|(a, b)| a.name == b.name && a.structural_key() == b.structural_key())
    }
}

// ===========================================================================
// Serialized descriptor
// ===========================================================================

/// Serialized form of one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDef {
    pub name: String,
    pub op: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attrs: BTreeMap<String, AttrValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<String>,
}

/// Serialized node list plus output references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphDef {
    pub nodes: Vec<NodeDef>,
    pub outputs: Vec<String>,
}

// ===========================================================================
// Builder
// ===========================================================================

/// Incremental graph construction in topological order.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    nodes: Vec<Node>,
    names: HashSet<String>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn placeholder(&mut self, name: &str, shape: &[i64]) -> Edge {
        self.push(Node::placeholder(name, shape.to_vec()))
    }

    pub fn constant(&mut self, name: &str, value: Tensor) -> Edge {
        self.push(Node::constant(name, value))
    }

    pub fn op(&mut self, name: &str, op: Op, inputs: &[Edge]) -> Edge {
        self.push(Node::new(name, op, inputs.to_vec()))
    }

    pub fn push(&mut self, node: Node) -> Edge {
        let edge = Edge::new(node.name.clone());
        self.names.insert(node.name.clone());
        self.nodes.push(node);
        edge
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    /// A name derived from `base` that is neither used in this builder nor
    /// in `reserved`.
    pub fn fresh_name(&self, base: &str, reserved: &HashSet<&str>) -> String {
        let taken = |n: &str| self.contains(n) || reserved.contains(n);
        if !taken(base) {
            return base.to_string();
        }
        (1..)
            .map(|i| format!("{base}_{i}"))
            .find(|n| !taken(n))
            .unwrap_or_else(|| base.to_string())
    }

    pub fn build(self, outputs: Vec<Edge>) -> Result<Graph> {
        Graph::new(self.nodes, outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr1;

    fn chain() -> Graph {
        let mut b = GraphBuilder::new();
        let a = b.placeholder("a", &[1, 4]);
        let r = b.op("b", Op::Relu, &[a]);
        let c = b.op("c", Op::Relu, &[r]);
        b.build(vec![c]).unwrap()
    }

    #[test]
    fn test_lookup_and_not_found() {
        let g = chain();
        assert_eq!(g.node("b").unwrap().kind(), OpKind::Relu);
        assert!(matches!(g.node("zz"), Err(QuantizeError::NotFound { .. })));
    }

    #[test]
    fn test_new_rejects_out_of_order_inputs() {
        let nodes = vec![
            Node::new("b", Op::Relu, vec![Edge::new("a")]),
            Node::placeholder("a", vec![1]),
        ];
        assert!(Graph::new(nodes.clone(), vec![Edge::new("b")]).is_err());
        let g = Graph::from_unordered(nodes, vec![Edge::new("b")]).unwrap();
        let order: Vec<&str> = g.nodes().map(|n| n.name.as_str()).collect();
        assert_eq!(order, ["a", "b"]);
    }

    #[test]
    fn test_from_unordered_detects_cycle() {
        let nodes = vec![
            Node::new("x", Op::Relu, vec![Edge::new("y")]),
            Node::new("y", Op::Relu, vec![Edge::new("x")]),
        ];
        let err = Graph::from_unordered(nodes, vec![Edge::new("x")]).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_def_round_trip() {
        let mut b = GraphBuilder::new();
        let x = b.placeholder("x", &[-1, 3]);
        let w = b.constant("w", arr1(&[1.0, -2.0, 0.5]).into_dyn());
        let y = b.op("y", Op::Mul, &[x, w]);
        let z = b.op("z", Op::Clip { a_min: -1.0, a_max: 1.0 }, &[y]);
        let g = b.build(vec![z]).unwrap();

        let def = g.to_def();
        let json = serde_json::to_string(&def).unwrap();
        let def2: GraphDef = serde_json::from_str(&json).unwrap();
        let payloads: HashMap<String, Tensor> =
            g.payloads().map(|(k, v)| (k.to_string(), v.clone())).collect();
        let g2 = Graph::from_def(&def2, &payloads).unwrap();
        assert_eq!(g, g2);
    }

    #[test]
    fn test_from_def_rejects_unknown_op() {
        let def = GraphDef {
            nodes: vec![NodeDef {
                name: "n0".into(),
                op: "lrn".into(),
                attrs: BTreeMap::new(),
                inputs: vec![],
            }],
            outputs: vec!["n0".into()],
        };
        let err = Graph::from_def(&def, &HashMap::new()).unwrap_err();
        assert!(matches!(err, QuantizeError::UnsupportedOp { ref op, ref node } if op == "lrn" && node == "n0"));
    }

    #[test]
    fn test_ancestors_include_roots() {
        let g = chain();
        let anc = g.ancestors(&["b"]).unwrap();
        assert!(anc.contains("a") && anc.contains("b") && !anc.contains("c"));
    }
}
