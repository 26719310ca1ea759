//! Command implementations

use anyhow::{Context, Result};
use colored::Colorize;
use quantgraph::calibration::{CalibrationDataset, DataSource};
use quantgraph::pipeline::{self, BASE_QUANTIZED, MERGED, PREPARE};
use quantgraph::store::read_graph_def;
use quantgraph::transform::shape::bound_shape;
use quantgraph::{Config, FileStore, Graph, Interpreter, ModelStore, Op, Pipeline, QuantArtifact, Stage};
use std::collections::BTreeMap;

fn load_config(path: &str) -> Result<Config> {
    let config = Config::from_file(path).with_context(|| format!("loading config {path}"))?;
    config.validate().with_context(|| format!("validating config {path}"))?;
    Ok(config)
}

pub fn run(config_file: &str, start: Stage) -> Result<()> {
    let config = load_config(config_file)?;
    println!("📦 Model: {} ({})", config.model.name.bold(), config.model.dir.display());
    if start != Stage::Prepare {
        println!("  Resuming at stage {}", start.to_string().cyan());
    }
    println!();

    let store = FileStore::new(&config.model.dir, &config.model.name);
    let executor = Interpreter::new();
    let state = Pipeline::new(&config, &store, &executor)
        .run(start)
        .with_context(|| format!("pipeline for '{}' failed", config.model.name))?;

    for stage in Stage::ALL.into_iter().filter(|s| *s >= start) {
        println!("✓ {}", stage);
    }
    println!();

    if let Some(ctx) = &state.context {
        println!("📊 Calibration:");
        println!("  Batches:    {}", ctx.batches());
        println!("  Tensors:    {}", ctx.bounds().count());
        println!();
    }

    match state.deployable() {
        Some((graph, artifact)) => print_artifact(graph, artifact),
        None => println!("{}", "⚠️  No quantized graph produced".yellow()),
    }

    Ok(())
}

fn print_artifact(graph: &Graph, artifact: &QuantArtifact) {
    println!("📊 Results:");
    println!("  Nodes:      {}", graph.len());
    for (kind, count) in graph.op_histogram() {
        println!("    {:<14} {}", kind.to_string(), count);
    }
    println!();

    println!("  Inputs ({}):", artifact.input_ext.len());
    for (name, ext) in &artifact.input_ext {
        println!("    - {}  scale {}  int{}", name.cyan(), ext.scale, ext.precision);
    }
    println!();

    println!("  Outputs ({}):", artifact.output_scales.len());
    for (i, scale) in artifact.output_scales.iter().enumerate() {
        let name = artifact.output_names.get(i).map(String::as_str).unwrap_or("?");
        println!("    - {}  scale {}", name.cyan(), scale);
    }
}

pub fn info(input: &str) -> Result<()> {
    println!("📊 Graph Information: {}", input.bold());
    println!();

    let def = read_graph_def(input).with_context(|| format!("reading {input}"))?;

    let mut ops: BTreeMap<&str, usize> = BTreeMap::new();
    for node in &def.nodes {
        *ops.entry(node.op.as_str()).or_insert(0) += 1;
    }

    println!("  Nodes:      {}", def.nodes.len());
    for (op, count) in &ops {
        println!("    {:<14} {}", op, count);
    }
    println!();

    let inputs: Vec<_> = def.nodes.iter().filter(|n| n.op == "placeholder").collect();
    println!("  Inputs ({}):", inputs.len());
    for input in inputs {
        let shape = input.attrs.get("shape").and_then(|s| s.as_ints()).unwrap_or_default();
        println!("    - {} {:?}", input.name, shape);
    }
    println!();

    println!("  Outputs ({}):", def.outputs.len());
    for output in &def.outputs {
        println!("    - {}", output);
    }

    Ok(())
}

pub fn evaluate(config_file: &str, batch: usize) -> Result<()> {
    let config = load_config(config_file)?;
    let store = FileStore::new(&config.model.dir, &config.model.name);

    let float = store.load_graph(PREPARE).context("loading prepared graph")?;
    let suffix = if store.has_graph(MERGED) { MERGED } else { BASE_QUANTIZED };
    let realized = store.load_graph(suffix).with_context(|| format!("loading {suffix} graph"))?;
    let artifact = store.load_artifact(suffix).with_context(|| format!("loading {suffix} artifact"))?;
    println!("⚡ Evaluating {} against the float graph", suffix.bold());

    let input = float.inputs().next().context("graph has no inputs")?;
    let sample_shape = match &input.op {
        Op::Placeholder { shape } => bound_shape(&input.name, shape.get(1..).unwrap_or_default())?,
        _ => Vec::new(),
    };
    let mut source = match &config.calibrate.data {
        Some(path) => CalibrationDataset::from_numpy(path)?,
        None => CalibrationDataset::random(sample_shape, batch, (-1.0, 1.0)),
    };
    let data = source.next_batch(batch)?.context("evaluation data is empty")?;
    let feeds = BTreeMap::from([(input.name.clone(), data)]);

    let errors = pipeline::evaluate(&float, &realized, &artifact, &feeds, &Interpreter::new(), &config.calibrate.device()?)?;

    println!();
    println!("📊 Max abs error per output:");
    for (i, err) in errors.iter().enumerate() {
        let name = artifact.output_names.get(i).map(String::as_str).unwrap_or("?");
        println!("  {:<20} {:.6}", name, err);
    }

    Ok(())
}
