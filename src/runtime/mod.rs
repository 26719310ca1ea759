//! Execution of graphs on concrete tensors.
//!
//! Calibration and evaluation only need "run this graph and give me every
//! intermediate value", so the engine sits behind the [`Executor`] trait.
//! [`Interpreter`] is the in-process reference engine; it understands both
//! source operators and the realized integer operators, which makes it the
//! ground truth for what a quantized artifact computes.

pub mod kernels;

use crate::errors::{QuantizeError, Result};
use crate::graph::{Graph, Op, OpKind, Tensor};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use tracing::trace;

/// Target device for execution.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Device {
    #[default]
    Cpu,
    /// Accelerator ids.
    Gpu(Vec<usize>),
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => f.write_str("cpu"),
            Device::Gpu(ids) => {
                let ids: Vec<String> = ids.iter().map(|i| i.to_string()).collect();
                write!(f, "gpu:{}", ids.join(","))
            }
        }
    }
}

impl FromStr for Device {
    type Err = String;

    /// `cpu`, `gpu` (device 0) or `gpu:0,1`.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().split_once(':') {
            None if s.trim().eq_ignore_ascii_case("cpu") => Ok(Device::Cpu),
            None if s.trim().eq_ignore_ascii_case("gpu") => Ok(Device::Gpu(vec![0])),
            Some((kind, ids)) if kind == "gpu" => ids
                .split(',')
                .map(|i| i.trim().parse::<usize>().map_err(|_| format!("invalid device id '{i}'")))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map(Device::Gpu),
            _ => Err(format!("unknown device '{s}', expected cpu or gpu[:ids]")),
        }
    }
}

/// A graph execution engine.
pub trait Executor {
    /// Every node's value, keyed by node name.
    fn run_all(
        &self,
        graph: &Graph,
        feeds: &BTreeMap<String, Tensor>,
        device: &Device,
    ) -> Result<HashMap<String, Tensor>>;

    /// Values of the graph outputs, in output order.
    fn run(&self, graph: &Graph, feeds: &BTreeMap<String, Tensor>, device: &Device) -> Result<Vec<Tensor>> {
        let values = self.run_all(graph, feeds, device)?;
        graph
            .outputs()
            .iter()
            .map(|e| {
                values
                    .get(&e.node)
                    .cloned()
                    .ok_or_else(|| QuantizeError::not_found("output", e.node.clone()))
            })
            .collect()
    }
}

/// Reference interpreter. CPU only.
#[derive(Debug, Clone, Copy, Default)]
pub struct Interpreter;

impl Interpreter {
    pub fn new() -> Self {
        Self
    }
}

impl Executor for Interpreter {
    fn run_all(
        &self,
        graph: &Graph,
        feeds: &BTreeMap<String, Tensor>,
        device: &Device,
    ) -> Result<HashMap<String, Tensor>> {
        if *device != Device::Cpu {
            return Err(QuantizeError::UnsupportedConfig {
                reason: format!("the reference interpreter cannot run on {device}"),
            });
        }

        let mut values: HashMap<String, Tensor> = HashMap::with_capacity(graph.len());
        for node in graph.nodes() {
            let value = match &node.op {
                Op::Placeholder { shape } => {
                    let feed = feeds
                        .get(&node.name)
                        .ok_or_else(|| QuantizeError::not_found("input", node.name.clone()))?;
                    check_feed(&node.name, shape, feed)?;
                    feed.clone()
                }
                Op::Constant => node
                    .payload()
                    .cloned()
                    .ok_or_else(|| QuantizeError::not_found("payload", node.name.clone()))?,
                _ => {
                    let inputs = node
                        .inputs
                        .iter()
                        .map(|e| values.get(&e.node).ok_or_else(|| QuantizeError::not_found("node", e.node.clone())))
                        .collect::<Result<Vec<&Tensor>>>()?;
                    kernels::eval(node, &inputs)?
                }
            };
            if node.kind() != OpKind::Constant {
                trace!(node = %node.name, shape = ?value.shape(), "evaluated");
            }
            values.insert(node.name.clone(), value);
        }
        Ok(values)
    }
}

/// A feed must match its placeholder; an unbound leading dim accepts any batch.
fn check_feed(name: &str, declared: &[i64], feed: &Tensor) -> Result<()> {
    let actual = feed.shape();
    let matches = declared.len() == actual.len()
        && declared
            .iter()
            .zip(actual)
            .enumerate()
            .all(|(axis, (&d, &a))| (axis == 0 && d == -1) || d == a as i64);
    if matches {
        Ok(())
    } else {
        Err(QuantizeError::ShapeMismatch {
            name: name.to_string(),
            expected: declared.iter().map(|&d| d.max(0) as usize).collect(),
            actual: actual.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphBuilder;
    use ndarray::arr2;

    fn relu_graph() -> Graph {
        let mut b = GraphBuilder::new();
        let x = b.placeholder("x", &[-1, 2]);
        let r = b.op("r", Op::Relu, &[x]);
        b.build(vec![r]).unwrap()
    }

    #[test]
    fn test_run_outputs() {
        let g = relu_graph();
        let feeds = BTreeMap::from([("x".to_string(), arr2(&[[-1.0, 2.0], [3.0, -4.0]]).into_dyn())]);
        let out = Interpreter.run(&g, &feeds, &Device::Cpu).unwrap();
        assert_eq!(out[0], arr2(&[[0.0, 2.0], [3.0, 0.0]]).into_dyn());
    }

    #[test]
    fn test_feed_shape_checked() {
        let g = relu_graph();
        let feeds = BTreeMap::from([("x".to_string(), arr2(&[[1.0, 2.0, 3.0]]).into_dyn())]);
        let err = Interpreter.run(&g, &feeds, &Device::Cpu).unwrap_err();
        assert!(matches!(err, QuantizeError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_gpu_rejected() {
        let g = relu_graph();
        let err = Interpreter.run_all(&g, &BTreeMap::new(), &Device::Gpu(vec![0])).unwrap_err();
        assert!(matches!(err, QuantizeError::UnsupportedConfig { .. }));
    }

    #[test]
    fn test_device_parse() {
        assert_eq!("cpu".parse::<Device>().unwrap(), Device::Cpu);
        assert_eq!("gpu:0,2".parse::<Device>().unwrap(), Device::Gpu(vec![0, 2]));
        assert_eq!("gpu".parse::<Device>().unwrap(), Device::Gpu(vec![0]));
        assert!("tpu".parse::<Device>().is_err());
    }
}
