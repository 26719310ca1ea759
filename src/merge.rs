//! Recombining a quantized base with its float top.
//!
//! The top's placeholders are bound to base nodes (through the name map the
//! quantizer produced), top nodes are appended after the base, and operator
//! attributes that depend on base output scales are rewritten so that the
//! top consumes the base's integer outputs directly.

use crate::errors::{QuantizeError, Result};
use crate::graph::{AttrValue, Edge, Graph, GraphBuilder, Node, OpKind};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, info};

/// `kind -> attribute -> producer`: the attribute is multiplied by the output
/// scale of `producer` (a base output) and truncated toward zero.
pub type AttributeDeps = BTreeMap<OpKind, BTreeMap<String, String>>;

#[derive(Debug)]
pub struct Merger<'a> {
    base: &'a Graph,
    top: &'a Graph,
    name_map: &'a BTreeMap<String, String>,
}

impl<'a> Merger<'a> {
    /// `name_map` maps original base node names to the nodes that now carry
    /// their values; unmapped names bind to themselves.
    pub fn new(base: &'a Graph, top: &'a Graph, name_map: &'a BTreeMap<String, String>) -> Self {
        Self { base, top, name_map }
    }

    fn mapped<'n>(&'n self, name: &'n str) -> &'n str {
        self.name_map.get(name).map(String::as_str).unwrap_or(name)
    }

    /// Build the merged graph.
    ///
    /// `scales` holds the output scale of each base output, keyed by its
    /// original name.
    pub fn merge(&self, deps: &AttributeDeps, scales: &BTreeMap<String, f64>) -> Result<Graph> {
        let mut out = GraphBuilder::new();
        for node in self.base.nodes() {
            out.push(node.clone());
        }

        // top names still to come must not be taken by a renamed clash
        let reserved: HashSet<&str> = self.top.nodes().map(|n| n.name.as_str()).collect();
        let mut rename: HashMap<String, String> = HashMap::new();
        for node in self.top.inputs() {
            let bound = self.mapped(&node.name);
            if !self.base.contains(bound) {
                return Err(QuantizeError::not_found("node", bound));
            }
            rename.insert(node.name.clone(), bound.to_string());
        }

        for node in self.top.nodes().filter(|n| n.kind() != OpKind::Placeholder) {
            let mut node = node.clone();
            for edge in &mut node.inputs {
                if let Some(to) = rename.get(&edge.node) {
                    edge.node = to.clone();
                }
            }

            if let Some(attrs) = deps.get(&node.kind()) {
                node = self.rewrite_attrs(node, attrs, scales)?;
            }

            if let Some(existing) = self.base.get(&node.name) {
                // constants the split copied into both halves
                if existing.structural_key() == node.structural_key() {
                    continue;
                }
                let fresh = out.fresh_name(&format!("{}_top", node.name), &reserved);
                debug!(from = %node.name, to = %fresh, "renaming clashing top node");
                rename.insert(node.name.clone(), fresh.clone());
                node.name = fresh;
            }
            out.push(node);
        }

        let outputs = self
            .top
            .outputs()
            .iter()
            .map(|e| Edge { node: rename.get(&e.node).cloned().unwrap_or_else(|| e.node.clone()), index: e.index })
            .collect();
        let merged = out.build(outputs)?;
        info!(nodes = merged.len(), "merged graph");
        Ok(merged)
    }

    fn rewrite_attrs(
        &self,
        node: Node,
        attrs: &BTreeMap<String, String>,
        scales: &BTreeMap<String, f64>,
    ) -> Result<Node> {
        let mut op = node.op.clone();
        for (attr, producer) in attrs {
            if !self.base.contains(producer) && !self.base.contains(self.mapped(producer)) && !self.top.contains(producer) {
                return Err(QuantizeError::not_found("node", producer.clone()));
            }
            let scale = *scales
                .get(producer)
                .ok_or_else(|| QuantizeError::MissingScale { name: producer.clone() })?;
            let value = op
                .attrs()
                .get(attr.as_str())
                .and_then(AttrValue::as_f64)
                .ok_or_else(|| QuantizeError::not_found("attribute", format!("{}.{attr}", node.name)))?;
            let rewritten = (value * scale).trunc();
            debug!(node = %node.name, %attr, value, rewritten, "attribute rescaled");
            op = op.with_attr(attr, AttrValue::Float(rewritten), &node.name)?;
        }
        Ok(node.with_op(op))
    }

    /// Scales of the merged outputs.
    ///
    /// A top output listed in `oscale_maps` takes the scale of the base output
    /// it names; a top output that is itself a boundary takes that boundary's
    /// scale; everything else is float (scale 1).
    pub fn output_scales(
        &self,
        scales: &BTreeMap<String, f64>,
        oscale_maps: &BTreeMap<String, String>,
    ) -> Result<Vec<f64>> {
        self.top
            .outputs()
            .iter()
            .map(|e| {
                let source = match oscale_maps.get(&e.node) {
                    Some(base_output) => base_output.as_str(),
                    None if self.top.get(&e.node).is_some_and(|n| n.kind() == OpKind::Placeholder) => {
                        e.node.as_str()
                    }
                    None => return Ok(1.0),
                };
                scales
                    .get(source)
                    .copied()
                    .ok_or_else(|| QuantizeError::MissingScale { name: source.to_string() })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Op;
    use crate::transform::split;

    fn graph() -> Graph {
        let mut b = GraphBuilder::new();
        let x = b.placeholder("x", &[1, 4]);
        let r = b.op("r", Op::Relu, &[x]);
        let c = b.op("c", Op::Clip { a_min: 0.0, a_max: 6.0 }, &[r]);
        b.build(vec![c]).unwrap()
    }

    #[test]
    fn test_merge_inverts_split() {
        let g = graph();
        let (base, top) = split(&g, &["r"]).unwrap();
        let names = BTreeMap::new();
        let merged = Merger::new(&base, &top, &names).merge(&AttributeDeps::new(), &BTreeMap::new()).unwrap();
        assert_eq!(merged, g);
    }

    #[test]
    fn test_attribute_rescaled_and_bound_through_name_map() {
        let g = graph();
        let (_, top) = split(&g, &["r"]).unwrap();
        // pretend the quantizer moved r's value to r_requant
        let mut b = GraphBuilder::new();
        let x = b.placeholder("x", &[1, 4]);
        let r = b.op("r", Op::Relu, &[x]);
        let rq = b.op("r_requant", Op::CvmClip { precision: 8 }, &[r]);
        let qbase = b.build(vec![rq]).unwrap();
        let names = BTreeMap::from([("r".to_string(), "r_requant".to_string())]);

        let deps = AttributeDeps::from([(
            OpKind::Clip,
            BTreeMap::from([("a_max".to_string(), "r".to_string())]),
        )]);
        let scales = BTreeMap::from([("r".to_string(), 16.5)]);
        let merger = Merger::new(&qbase, &top, &names);
        let merged = merger.merge(&deps, &scales).unwrap();

        let clip = merged.node("c").unwrap();
        assert_eq!(clip.inputs, [Edge::new("r_requant")]);
        assert_eq!(clip.op, Op::Clip { a_min: 0.0, a_max: 99.0 });
        assert_eq!(merger.output_scales(&scales, &BTreeMap::new()).unwrap(), [1.0]);
    }

    #[test]
    fn test_clash_rename_skips_later_top_names() {
        let mut b = GraphBuilder::new();
        let x = b.placeholder("x", &[1, 4]);
        let r = b.op("r", Op::Relu, &[x]);
        b.op("s", Op::Clip { a_min: 0.0, a_max: 6.0 }, &[r.clone()]);
        let base = b.build(vec![r]).unwrap();

        // top "s" clashes with base "s"; "s_top" is a real top node
        let mut b = GraphBuilder::new();
        let r = b.placeholder("r", &[1, 4]);
        let s = b.op("s", Op::Relu, &[r]);
        let st = b.op("s_top", Op::Clip { a_min: 0.0, a_max: 1.0 }, &[s]);
        let top = b.build(vec![st]).unwrap();

        let names = BTreeMap::new();
        let merged = Merger::new(&base, &top, &names).merge(&AttributeDeps::new(), &BTreeMap::new()).unwrap();
        assert_eq!(merged.node("s_top_1").unwrap().op, Op::Relu);
        assert_eq!(merged.node("s_top_1").unwrap().inputs, [Edge::new("r")]);
        assert_eq!(merged.node("s_top").unwrap().inputs, [Edge::new("s_top_1")]);
        assert_eq!(merged.node("s").unwrap().kind(), OpKind::Clip);
        assert_eq!(merged.outputs(), [Edge::new("s_top")]);
    }

    #[test]
    fn test_missing_scale_and_unknown_producer() {
        let g = graph();
        let (base, top) = split(&g, &["r"]).unwrap();
        let names = BTreeMap::new();
        let merger = Merger::new(&base, &top, &names);

        let deps = AttributeDeps::from([(
            OpKind::Clip,
            BTreeMap::from([("a_max".to_string(), "r".to_string())]),
        )]);
        let err = merger.merge(&deps, &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, QuantizeError::MissingScale { ref name } if name == "r"));

        let deps = AttributeDeps::from([(
            OpKind::Clip,
            BTreeMap::from([("a_max".to_string(), "ghost".to_string())]),
        )]);
        let err = merger.merge(&deps, &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, QuantizeError::NotFound { .. }));
    }

    #[test]
    fn test_output_scale_maps() {
        let g = graph();
        let (base, top) = split(&g, &["r"]).unwrap();
        let names = BTreeMap::new();
        let merger = Merger::new(&base, &top, &names);
        let scales = BTreeMap::from([("r".to_string(), 32.0)]);
        let maps = BTreeMap::from([("c".to_string(), "r".to_string())]);
        assert_eq!(merger.output_scales(&scales, &maps).unwrap(), [32.0]);

        let maps = BTreeMap::from([("c".to_string(), "nope".to_string())]);
        assert!(matches!(merger.output_scales(&scales, &maps), Err(QuantizeError::MissingScale { .. })));
    }
}
