//! Per-graph quantization side table.
//!
//! A [`QuantContext`] is created when calibration starts, widened by every
//! calibration batch and read by the quantizer. User overrides (thresholds,
//! per-node precisions, the restore policy) live here as well so that one
//! serialized file carries everything the quantize stage needs.

use crate::calibration::stats::TensorStats;
use crate::errors::{QuantizeError, Result};
use crate::graph::{Graph, OpKind};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

/// Restore-list entry selecting every node of one operator kind.
pub const OP_PREFIX: &str = "_OP_";
/// Restore-list entry inverting the selection.
pub const ALL_EXCEPT: &str = "_ALL_EXCEPT_";

// ===========================================================================
// Restore policy
// ===========================================================================

/// Which nodes stay in floating point.
///
/// Entries are node names, `_OP_<kind>` for every node of a kind, or the
/// `_ALL_EXCEPT_` marker, which restores every eligible node *not* named by
/// the other entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestorePolicy {
    #[serde(default)]
    pub names: BTreeSet<String>,
    #[serde(default)]
    pub op_kinds: BTreeSet<OpKind>,
    #[serde(default)]
    pub all_except: bool,
}

impl RestorePolicy {
    pub fn parse<S: AsRef<str>>(entries: &[S]) -> Result<Self> {
        let mut policy = Self::default();
        for entry in entries {
            let entry = entry.as_ref().trim();
            if entry == ALL_EXCEPT {
                policy.all_except = true;
            } else if let Some(kind) = entry.strip_prefix(OP_PREFIX) {
                let kind = kind.parse::<OpKind>().map_err(|op| QuantizeError::Config {
                    reason: format!("restore entry '{entry}' names unknown operator '{op}'"),
                })?;
                policy.op_kinds.insert(kind);
            } else if !entry.is_empty() {
                policy.names.insert(entry.to_string());
            }
        }
        Ok(policy)
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty() && self.op_kinds.is_empty() && !self.all_except
    }

    pub fn insert_name(&mut self, name: impl Into<String>) {
        self.names.insert(name.into());
    }

    pub fn insert_kind(&mut self, kind: OpKind) {
        self.op_kinds.insert(kind);
    }

    /// Names of the nodes of `graph` this policy restores.
    ///
    /// Placeholders and constants are never restored; naming one is ignored
    /// with a warning. Naming a node absent from the graph is an error.
    pub fn resolve(&self, graph: &Graph) -> Result<BTreeSet<String>> {
        let mut listed = BTreeSet::new();
        for name in &self.names {
            let node = graph.node(name)?;
            if node.kind().is_restorable() {
                listed.insert(name.clone());
            } else {
                warn!(node = %name, op = %node.kind(), "node kind cannot be restored, ignoring");
            }
        }
        for node in graph.nodes() {
            if self.op_kinds.contains(&node.kind()) && node.kind().is_restorable() {
                listed.insert(node.name.clone());
            }
        }

        if !self.all_except {
            return Ok(listed);
        }
        Ok(graph
            .nodes()
            .filter(|n| n.kind().is_restorable() && !listed.contains(&n.name))
            .map(|n| n.name.clone())
            .collect())
    }
}

// ===========================================================================
// Context
// ===========================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuantContext {
    /// Calibrated symmetric bound per tensor (node name).
    #[serde(default)]
    bounds: BTreeMap<String, f64>,
    #[serde(default)]
    stats: BTreeMap<String, TensorStats>,
    /// User thresholds; these win over calibrated bounds.
    #[serde(default)]
    thresholds: BTreeMap<String, f64>,
    #[serde(default)]
    precisions: BTreeMap<String, u32>,
    #[serde(default)]
    restore: RestorePolicy,
    #[serde(default)]
    batches: usize,
}

impl QuantContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Widen the recorded bound of `name`; bounds never shrink.
    pub fn observe(&mut self, name: &str, bound: f64, stats: &TensorStats) {
        let bound = if bound.is_finite() { bound.abs() } else { 0.0 };
        let entry = self.bounds.entry(name.to_string()).or_insert(0.0);
        *entry = entry.max(bound);
        self.stats.entry(name.to_string()).or_default().merge(stats);
    }

    /// Effective bound: user threshold first, then the calibrated bound.
    pub fn bound(&self, name: &str) -> Option<f64> {
        self.thresholds.get(name).or_else(|| self.bounds.get(name)).copied()
    }

    pub fn calibrated_bound(&self, name: &str) -> Option<f64> {
        self.bounds.get(name).copied()
    }

    pub fn threshold(&self, name: &str) -> Option<f64> {
        self.thresholds.get(name).copied()
    }

    pub fn set_threshold(&mut self, name: impl Into<String>, threshold: f64) {
        self.thresholds.insert(name.into(), threshold.abs());
    }

    pub fn precision(&self, name: &str) -> Option<u32> {
        self.precisions.get(name).copied()
    }

    pub fn set_precision(&mut self, name: impl Into<String>, precision: u32) {
        self.precisions.insert(name.into(), precision);
    }

    pub fn stats(&self, name: &str) -> Option<&TensorStats> {
        self.stats.get(name)
    }

    /// Calibrated tensors with their bounds, sorted by name.
    pub fn bounds(&self) -> impl Iterator<Item = (&str, f64)> {
        self.bounds.iter().map(|(k, &v)| (k.as_str(), v))
    }

    pub fn restore_policy(&self) -> &RestorePolicy {
        &self.restore
    }

    pub fn set_restore_policy(&mut self, policy: RestorePolicy) {
        self.restore = policy;
    }

    pub fn restore(&mut self, name: impl Into<String>) {
        self.restore.insert_name(name);
    }

    pub fn batches(&self) -> usize {
        self.batches
    }

    pub(crate) fn finish_batch(&mut self) {
        self.batches += 1;
    }

    pub fn is_calibrated(&self) -> bool {
        self.batches > 0 || !self.bounds.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{GraphBuilder, Op};

    #[test]
    fn test_bounds_only_widen() {
        let mut ctx = QuantContext::new();
        let stats = TensorStats::from_data(&[1.0]);
        for bound in [3.0, 1.0, 5.0] {
            ctx.observe("x", bound, &stats);
        }
        assert_eq!(ctx.bound("x"), Some(5.0));
        assert_eq!(ctx.stats("x").unwrap().count, 3);
    }

    #[test]
    fn test_threshold_overrides_calibration() {
        let mut ctx = QuantContext::new();
        ctx.observe("x", 8.0, &TensorStats::default());
        ctx.set_threshold("x", 2.0);
        assert_eq!(ctx.bound("x"), Some(2.0));
        assert_eq!(ctx.calibrated_bound("x"), Some(8.0));
    }

    fn graph() -> Graph {
        let mut b = GraphBuilder::new();
        let x = b.placeholder("x", &[1, 4]);
        let r = b.op("r", Op::Relu, &[x]);
        let s = b.op("s", Op::Softmax { axis: 1 }, &[r]);
        let t = b.op("t", Op::Relu, &[s]);
        b.build(vec![t]).unwrap()
    }

    #[test]
    fn test_restore_policy_entries() {
        let g = graph();
        let policy = RestorePolicy::parse(&["_OP_softmax", "r"]).unwrap();
        let set = policy.resolve(&g).unwrap();
        assert_eq!(set.into_iter().collect::<Vec<_>>(), ["r", "s"]);

        let policy = RestorePolicy::parse(&["_ALL_EXCEPT_", "t"]).unwrap();
        let set = policy.resolve(&g).unwrap();
        assert_eq!(set.into_iter().collect::<Vec<_>>(), ["r", "s"]);
    }

    #[test]
    fn test_restore_policy_rejects_unknowns() {
        assert!(RestorePolicy::parse(&["_OP_lrn"]).is_err());
        let policy = RestorePolicy::parse(&["missing"]).unwrap();
        assert!(matches!(policy.resolve(&graph()), Err(QuantizeError::NotFound { .. })));
        // placeholders are silently kept quantized
        let policy = RestorePolicy::parse(&["x"]).unwrap();
        assert!(policy.resolve(&graph()).unwrap().is_empty());
    }
}
