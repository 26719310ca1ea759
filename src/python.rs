// src/python.rs
//! Python bindings for quantgraph using PyO3.
//!
//! Provides a simple API:
//!   - run_pipeline(): run the staged pipeline from a config file
//!   - graph_info(): summarize a saved graph descriptor

use pyo3::exceptions::PyRuntimeError;
use pyo3::prelude::*;
use std::collections::BTreeMap;

use crate::config::Config;
use crate::pipeline::{Pipeline, Stage};
use crate::runtime::Interpreter;
use crate::store::{read_graph_def, FileStore};

// ===========================================================================
// Python-exposed types
// ===========================================================================

/// Deployable result returned by run_pipeline()
#[pyclass]
#[derive(Clone)]
struct PipelineResult {
    #[pyo3(get)]
    num_nodes: usize,
    #[pyo3(get)]
    output_names: Vec<String>,
    #[pyo3(get)]
    output_scales: Vec<f64>,
    #[pyo3(get)]
    input_scales: BTreeMap<String, f64>,
}

/// Graph metadata returned by graph_info()
#[pyclass]
#[derive(Clone)]
struct GraphInfo {
    #[pyo3(get)]
    num_nodes: usize,
    #[pyo3(get)]
    inputs: Vec<String>,
    #[pyo3(get)]
    outputs: Vec<String>,
    #[pyo3(get)]
    ops: BTreeMap<String, usize>,
}

// ===========================================================================
// Core functions
// ===========================================================================

/// Run the quantization pipeline described by a YAML/TOML config.
///
/// Args:
///     config_path: Path to the pipeline config
///     start: First stage to run; earlier stages load their checkpoints
///
/// Example:
///     >>> import quantgraph
///     >>> res = quantgraph.run_pipeline("resnet.yaml")
///     >>> print(res.output_scales)
#[pyfunction]
#[pyo3(signature = (config_path, start="prepare"))]
fn run_pipeline(config_path: &str, start: &str) -> PyResult<PipelineResult> {
    let config = Config::from_file(config_path)
        .map_err(|e| PyRuntimeError::new_err(format!("Failed to load config: {e}")))?;
    let start = start.parse::<Stage>().map_err(PyRuntimeError::new_err)?;

    let store = FileStore::new(&config.model.dir, &config.model.name);
    let executor = Interpreter::new();
    let state = Pipeline::new(&config, &store, &executor)
        .run(start)
        .map_err(|e| PyRuntimeError::new_err(format!("Pipeline failed: {e}")))?;

    let (graph, artifact) = state
        .deployable()
        .ok_or_else(|| PyRuntimeError::new_err("Pipeline produced no quantized graph"))?;

    Ok(PipelineResult {
        num_nodes: graph.len(),
        output_names: artifact.output_names.clone(),
        output_scales: artifact.output_scales.clone(),
        input_scales: artifact.input_ext.iter().map(|(k, v)| (k.clone(), v.scale)).collect(),
    })
}

/// Summarize a graph descriptor (`<model>.<suffix>.json`).
///
/// Example:
///     >>> info = quantgraph.graph_info("out/resnet.all.quantize.json")
///     >>> print(info.ops["right_shift"])
#[pyfunction]
fn graph_info(path: &str) -> PyResult<GraphInfo> {
    let def = read_graph_def(path).map_err(|e| PyRuntimeError::new_err(format!("Failed to load graph: {e}")))?;

    let mut ops = BTreeMap::new();
    for node in &def.nodes {
        *ops.entry(node.op.clone()).or_insert(0) += 1;
    }

    Ok(GraphInfo {
        num_nodes: def.nodes.len(),
        inputs: def.nodes.iter().filter(|n| n.op == "placeholder").map(|n| n.name.clone()).collect(),
        outputs: def.outputs.clone(),
        ops,
    })
}

// ===========================================================================
// Python module definition
// ===========================================================================

/// Fixed-point quantization pipeline for operator graphs
#[pymodule]
fn quantgraph(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(run_pipeline, m)?)?;
    m.add_function(wrap_pyfunction!(graph_info, m)?)?;
    m.add_class::<PipelineResult>()?;
    m.add_class::<GraphInfo>()?;
    m.add("__version__", env!("CARGO_PKG_VERSION"))?;
    Ok(())
}
