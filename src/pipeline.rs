//! Staged, resumable quantization pipeline.
//!
//! The stages run in a fixed order and each one persists its result through
//! a [`ModelStore`] before the next starts:
//!
//! | stage       | reads                        | writes                          |
//! |-------------|------------------------------|---------------------------------|
//! | `prepare`   | source model                 | `prepare`                       |
//! | `split`     | `prepare`                    | `base`, `top`                   |
//! | `calibrate` | `base`                       | `base` context                  |
//! | `quantize`  | `base`, `base` context       | `base.quantize` graph+artifact  |
//! | `merge`     | `base.quantize`, `top`       | `all.quantize` graph+artifact   |
//!
//! Starting at a later stage loads the checkpoints of the earlier ones into a
//! [`PipelineState`]; a missing checkpoint fails with
//! [`QuantizeError::MissingFile`].

use crate::calibration::{CalibrationDataset, Calibrator, DataSource};
use crate::config::Config;
use crate::context::QuantContext;
use crate::errors::{QuantizeError, Result};
use crate::graph::{Graph, Op, Tensor};
use crate::merge::Merger;
use crate::quantization::Quantizer;
use crate::runtime::{Device, Executor};
use crate::store::{ModelStore, QuantArtifact};
use crate::transform::{self, shape::bound_shape};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::{info, warn};

pub const PREPARE: &str = "prepare";
pub const BASE: &str = "base";
pub const TOP: &str = "top";
pub const BASE_QUANTIZED: &str = "base.quantize";
pub const MERGED: &str = "all.quantize";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Prepare,
    Split,
    Calibrate,
    Quantize,
    Merge,
}

impl Stage {
    pub const ALL: [Stage; 5] = [Stage::Prepare, Stage::Split, Stage::Calibrate, Stage::Quantize, Stage::Merge];

    pub fn name(self) -> &'static str {
        match self {
            Stage::Prepare => "prepare",
            Stage::Split => "split",
            Stage::Calibrate => "calibrate",
            Stage::Quantize => "quantize",
            Stage::Merge => "merge",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let lower = s.trim().to_lowercase();
        Stage::ALL.into_iter().find(|st| st.name() == lower).ok_or_else(|| {
            format!("Unknown stage: '{s}'. Valid stages: prepare, split, calibrate, quantize, merge")
        })
    }
}

/// Results of the stages run (or loaded) so far.
#[derive(Debug, Clone, Default)]
pub struct PipelineState {
    pub prepared: Option<Graph>,
    pub base: Option<Graph>,
    /// `None` when the graph is quantized whole.
    pub top: Option<Graph>,
    pub context: Option<QuantContext>,
    pub quantized: Option<Graph>,
    pub artifact: Option<QuantArtifact>,
    pub merged: Option<Graph>,
    pub merged_artifact: Option<QuantArtifact>,
}

impl PipelineState {
    /// The deployable graph and artifact: the merged pair when the merge
    /// stage ran, otherwise the quantized base.
    pub fn deployable(&self) -> Option<(&Graph, &QuantArtifact)> {
        match (&self.merged, &self.merged_artifact) {
            (Some(g), Some(a)) => Some((g, a)),
            _ => self.quantized.as_ref().zip(self.artifact.as_ref()),
        }
    }
}

fn missing(stage: Stage, what: &str) -> QuantizeError {
    QuantizeError::Other(format!("stage '{stage}' needs the {what} of an earlier stage"))
}

pub struct Pipeline<'a> {
    config: &'a Config,
    store: &'a dyn ModelStore,
    executor: &'a dyn Executor,
}

impl<'a> Pipeline<'a> {
    pub fn new(config: &'a Config, store: &'a dyn ModelStore, executor: &'a dyn Executor) -> Self {
        Self { config, store, executor }
    }

    fn is_split(&self) -> bool {
        !self.config.split.keys.is_empty()
    }

    /// Run every stage from `start` on.
    pub fn run(&self, start: Stage) -> Result<PipelineState> {
        self.config.validate()?;
        let mut state = self.resume(start)?;
        for stage in Stage::ALL.into_iter().filter(|s| *s >= start) {
            info!(%stage, model = %self.config.model.name, "running stage");
            self.run_stage(stage, &mut state)?;
        }
        Ok(state)
    }

    /// Load the checkpoints every stage before `start` produced.
    pub fn resume(&self, start: Stage) -> Result<PipelineState> {
        let mut state = PipelineState::default();
        if start > Stage::Prepare {
            state.prepared = Some(self.store.load_graph(PREPARE)?);
        }
        if start > Stage::Split {
            state.base = Some(self.store.load_graph(BASE)?);
            if self.is_split() {
                state.top = Some(self.store.load_graph(TOP)?);
            }
        }
        if start > Stage::Calibrate {
            state.context = Some(self.store.load_context(BASE)?);
        }
        if start > Stage::Quantize {
            state.quantized = Some(self.store.load_graph(BASE_QUANTIZED)?);
            state.artifact = Some(self.store.load_artifact(BASE_QUANTIZED)?);
        }
        Ok(state)
    }

    pub fn run_stage(&self, stage: Stage, state: &mut PipelineState) -> Result<()> {
        match stage {
            Stage::Prepare => self.prepare(state),
            Stage::Split => self.split(state),
            Stage::Calibrate => self.calibrate(state),
            Stage::Quantize => self.quantize(state),
            Stage::Merge => self.merge(state),
        }
    }

    fn prepare(&self, state: &mut PipelineState) -> Result<()> {
        let source = self.store.load_source()?;
        let prepared = transform::prepare(&source, self.config.model.input_shape.as_deref())?;
        self.store.save_graph(PREPARE, &prepared)?;
        state.prepared = Some(prepared);
        Ok(())
    }

    fn split(&self, state: &mut PipelineState) -> Result<()> {
        let prepared = state.prepared.as_ref().ok_or_else(|| missing(Stage::Split, "prepared graph"))?;
        if self.is_split() {
            let (base, top) = transform::split(prepared, &self.config.split.keys)?;
            self.store.save_graph(BASE, &base)?;
            self.store.save_graph(TOP, &top)?;
            state.base = Some(base);
            state.top = Some(top);
        } else {
            self.store.save_graph(BASE, prepared)?;
            state.base = Some(prepared.clone());
            state.top = None;
        }
        Ok(())
    }

    fn calibrate(&self, state: &mut PipelineState) -> Result<()> {
        let base = state.base.as_ref().ok_or_else(|| missing(Stage::Calibrate, "base graph"))?;
        let cfg = &self.config.calibrate;
        let graph = transform::rebatch(base, cfg.batch)?;

        let input = graph.inputs().next().ok_or_else(|| QuantizeError::graph("graph has no inputs"))?;
        let sample_shape = match &input.op {
            Op::Placeholder { shape } => bound_shape(&input.name, shape.get(1..).unwrap_or_default())?,
            _ => Vec::new(),
        };

        let mut source = match &cfg.data {
            Some(path) => {
                let dataset = CalibrationDataset::from_numpy(path)?;
                if dataset.sample_shape() != sample_shape.as_slice() {
                    return Err(QuantizeError::ShapeMismatch {
                        name: input.name.clone(),
                        expected: sample_shape,
                        actual: dataset.sample_shape().to_vec(),
                    });
                }
                dataset
            }
            None => {
                warn!("no calibration data configured, using uniform random samples");
                CalibrationDataset::random(sample_shape, cfg.batch * cfg.num_batches, (-1.0, 1.0))
            }
        };

        let calibrator = Calibrator::new(cfg.range_method()?).with_device(cfg.device()?);
        let mut ctx = QuantContext::new();
        let done =
            calibrator.calibrate_source(&graph, &mut ctx, &mut source, cfg.batch, cfg.num_batches, self.executor)?;
        if done < cfg.num_batches {
            warn!(requested = cfg.num_batches, done, "calibration data ran out early");
        }

        self.store.save_context(BASE, &ctx)?;
        state.context = Some(ctx);
        Ok(())
    }

    /// The calibrated context with the configured overrides applied.
    fn effective_context(&self, ctx: &QuantContext) -> Result<QuantContext> {
        let q = &self.config.quantize;
        let mut ctx = ctx.clone();
        for (name, &threshold) in &q.thresholds {
            ctx.set_threshold(name.clone(), threshold);
        }
        for (name, &precision) in &q.precisions {
            ctx.set_precision(name.clone(), precision);
        }
        ctx.set_restore_policy(q.restore_policy()?);
        Ok(ctx)
    }

    fn quantize(&self, state: &mut PipelineState) -> Result<()> {
        let base = state.base.as_ref().ok_or_else(|| missing(Stage::Quantize, "base graph"))?;
        let ctx = state.context.as_ref().ok_or_else(|| missing(Stage::Quantize, "calibration context"))?;
        let ctx = self.effective_context(ctx)?;

        let out = Quantizer::new(self.config.quantize.quant_config()).quantize(base, &ctx)?;
        let artifact = QuantArtifact::from_output(&out, self.input_shape(state));

        self.store.save_quantized(BASE_QUANTIZED, &out.graph, &artifact)?;
        state.quantized = Some(out.graph);
        state.artifact = Some(artifact);
        Ok(())
    }

    fn merge(&self, state: &mut PipelineState) -> Result<()> {
        let quantized = state.quantized.as_ref().ok_or_else(|| missing(Stage::Merge, "quantized graph"))?;
        let artifact = state.artifact.as_ref().ok_or_else(|| missing(Stage::Merge, "quantization artifact"))?;

        let Some(top) = state.top.as_ref() else {
            info!("graph was quantized whole, nothing to merge");
            return Ok(());
        };

        let deps = self.config.merge.attribute_deps()?;
        let scales = artifact.output_scale_table();
        let merger = Merger::new(quantized, top, &artifact.name_map);
        let merged = merger.merge(&deps, &scales)?;
        let output_scales = merger.output_scales(&scales, &self.config.merge.oscale_maps)?;

        let merged_artifact = QuantArtifact {
            output_scales,
            input_ext: artifact.input_ext.clone(),
            input_shape: artifact.input_shape.clone(),
            output_names: top.outputs().iter().map(|e| e.node.clone()).collect(),
            name_map: BTreeMap::new(),
        };

        self.store.save_quantized(MERGED, &merged, &merged_artifact)?;
        state.merged = Some(merged);
        state.merged_artifact = Some(merged_artifact);
        Ok(())
    }

    fn input_shape(&self, state: &PipelineState) -> Vec<i64> {
        if let Some(shape) = &self.config.model.input_shape {
            return shape.clone();
        }
        state
            .prepared
            .as_ref()
            .and_then(|g| g.inputs().next())
            .and_then(|n| match &n.op {
                Op::Placeholder { shape } => Some(shape.clone()),
                _ => None,
            })
            .unwrap_or_default()
    }
}

/// Run the float graph and the realized graph on the same real-valued feeds
/// and return the largest absolute error of every output, after dividing
/// realized outputs by their scales.
///
/// Both graphs are rebatched to the batch size of the feeds first.
pub fn evaluate(
    float: &Graph,
    realized: &Graph,
    artifact: &QuantArtifact,
    feeds: &BTreeMap<String, Tensor>,
    executor: &dyn Executor,
    device: &Device,
) -> Result<Vec<f64>> {
    let batch = feeds.values().next().and_then(|t| t.shape().first().copied()).unwrap_or(1);
    let float = transform::rebatch(float, batch)?;
    let realized = transform::rebatch(realized, batch)?;

    let expected = executor.run(&float, feeds, device)?;
    let encoded = feeds
        .iter()
        .map(|(name, value)| {
            let ext = artifact
                .input_ext
                .get(name)
                .ok_or_else(|| QuantizeError::not_found("input", name.clone()))?;
            Ok((name.clone(), ext.encode(value)))
        })
        .collect::<Result<BTreeMap<_, _>>>()?;
    let actual = executor.run(&realized, &encoded, device)?;

    if expected.len() != actual.len() || actual.len() != artifact.output_scales.len() {
        return Err(QuantizeError::graph(format!(
            "output count mismatch: float {}, realized {}, scales {}",
            expected.len(),
            actual.len(),
            artifact.output_scales.len()
        )));
    }

    expected
        .iter()
        .zip(&actual)
        .zip(&artifact.output_scales)
        .map(|((e, a), &scale)| {
            if e.shape() != a.shape() {
                return Err(QuantizeError::ShapeMismatch {
                    name: "output".into(),
                    expected: e.shape().to_vec(),
                    actual: a.shape().to_vec(),
                });
            }
            Ok(e.iter().zip(a.iter()).map(|(x, q)| (x - q / scale).abs()).fold(0.0, f64::max))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order_and_parse() {
        assert!(Stage::Prepare < Stage::Split && Stage::Quantize < Stage::Merge);
        assert_eq!("Calibrate".parse::<Stage>().unwrap(), Stage::Calibrate);
        assert_eq!(Stage::Merge.to_string(), "merge");
        assert!("deploy".parse::<Stage>().is_err());
    }

    #[test]
    fn test_deployable_prefers_merged() {
        let artifact = QuantArtifact {
            output_scales: vec![1.0],
            input_ext: BTreeMap::new(),
            input_shape: vec![1],
            output_names: vec![],
            name_map: BTreeMap::new(),
        };
        let mut b = crate::graph::GraphBuilder::new();
        let x = b.placeholder("x", &[1]);
        let g = b.build(vec![x]).unwrap();

        let mut state = PipelineState::default();
        assert!(state.deployable().is_none());
        state.quantized = Some(g.clone());
        state.artifact = Some(artifact.clone());
        assert!(state.deployable().is_some());

        let mut merged_artifact = artifact;
        merged_artifact.output_scales = vec![4.0];
        state.merged = Some(g);
        state.merged_artifact = Some(merged_artifact);
        assert_eq!(state.deployable().unwrap().1.output_scales, [4.0]);
    }
}
