//! Range calibration.
//!
//! The [`Calibrator`] runs batches through the float graph with an
//! [`Executor`], reduces every intermediate tensor to a symmetric bound with
//! a [`RangeMethod`] and widens the bounds recorded in a [`QuantContext`].
//! Batches come from a [`DataSource`]; [`CalibrationDataset`] is the in-memory
//! implementation, loadable from `.npy`.

pub mod methods;
pub mod stats;

pub use methods::RangeMethod;
pub use stats::TensorStats;

use crate::context::QuantContext;
use crate::errors::{QuantizeError, Result};
use crate::graph::{Graph, Op, OpKind, Tensor};
use crate::runtime::{Device, Executor};
use crate::transform::shape::bound_shape;
use ndarray::{Array, ArrayD, Axis, IxDyn};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

// ===========================================================================
// Data sources
// ===========================================================================

/// A provider of calibration batches.
pub trait DataSource {
    /// Shape of one sample, without the batch dimension.
    fn sample_shape(&self) -> &[usize];

    /// The next batch of up to `batch` samples, stacked on a leading axis,
    /// or `None` once the source is exhausted.
    fn next_batch(&mut self, batch: usize) -> Result<Option<Tensor>>;
}

#[derive(Debug, Clone)]
pub struct CalibrationDataset {
    pub samples: Vec<Vec<f64>>,

    pub shape: Vec<usize>,

    pub num_samples: usize,

    cursor: usize,
}

impl CalibrationDataset {
    /// Load an `.npy` array whose first axis enumerates samples.
    pub fn from_numpy(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(QuantizeError::MissingFile { path: path.to_path_buf() });
        }
        if path.extension().and_then(|s| s.to_str()) != Some("npy") {
            return Err(QuantizeError::Calibration {
                reason: format!("only .npy files are supported, got {}", path.display()),
            });
        }

        let array: ArrayD<f64> = match ndarray_npy::read_npy::<_, ArrayD<f64>>(path) {
            Ok(a) => a,
            // float32 dumps are the common case; widen them
            Err(_) => ndarray_npy::read_npy::<_, ArrayD<f32>>(path)
                .map(|a| a.mapv(f64::from))
                .map_err(|e| QuantizeError::ModelLoad { path: path.to_path_buf(), reason: e.to_string() })?,
        };

        let shape: Vec<usize> = array.shape().to_vec();
        if shape.is_empty() {
            return Err(QuantizeError::Calibration { reason: "calibration array is a scalar".into() });
        }

        let samples = array.outer_iter().map(|s| s.iter().copied().collect()).collect();
        Self::from_samples(samples, shape[1..].to_vec())
    }

    pub fn random(shape: Vec<usize>, num_samples: usize, range: (f64, f64)) -> Self {
        use rand::Rng;
        let mut rng = rand::thread_rng();

        let sample_size: usize = shape.iter().product();
        let samples = (0..num_samples)
            .map(|_| (0..sample_size).map(|_| rng.gen_range(range.0..range.1)).collect())
            .collect();

        Self { samples, shape, num_samples, cursor: 0 }
    }

    pub fn from_samples(samples: Vec<Vec<f64>>, shape: Vec<usize>) -> Result<Self> {
        let num_samples = samples.len();

        if num_samples == 0 {
            return Err(QuantizeError::Calibration { reason: "no samples provided".into() });
        }

        let expected_size: usize = shape.iter().product();
        for (i, sample) in samples.iter().enumerate() {
            if sample.len() != expected_size {
                return Err(QuantizeError::Calibration {
                    reason: format!(
                        "sample {i} has size {} but expected {expected_size} (shape: {shape:?})",
                        sample.len()
                    ),
                });
            }
        }

        Ok(Self { samples, shape, num_samples, cursor: 0 })
    }

    /// Samples `[start, start + size)` stacked into one tensor.
    pub fn get_batch(&self, start: usize, size: usize) -> Result<Tensor> {
        let end = (start + size).min(self.num_samples);
        let start = start.min(end);
        let mut dims = vec![end - start];
        dims.extend_from_slice(&self.shape);
        let data: Vec<f64> = self.samples[start..end].iter().flatten().copied().collect();
        Array::from_shape_vec(IxDyn(&dims), data)
            .map_err(|e| QuantizeError::Calibration { reason: e.to_string() })
    }

    pub fn rewind(&mut self) {
        self.cursor = 0;
    }

    pub fn len(&self) -> usize {
        self.num_samples
    }

    pub fn is_empty(&self) -> bool {
        self.num_samples == 0
    }
}

impl DataSource for CalibrationDataset {
    fn sample_shape(&self) -> &[usize] {
        &self.shape
    }

    fn next_batch(&mut self, batch: usize) -> Result<Option<Tensor>> {
        if self.cursor >= self.num_samples || batch == 0 {
            return Ok(None);
        }
        let tensor = self.get_batch(self.cursor, batch)?;
        self.cursor += tensor.len_of(Axis(0));
        Ok(Some(tensor))
    }
}

// ===========================================================================
// Calibrator
// ===========================================================================

#[derive(Debug, Clone, Default)]
pub struct Calibrator {
    method: RangeMethod,
    device: Device,
}

impl Calibrator {
    pub fn new(method: RangeMethod) -> Self {
        Self { method, device: Device::Cpu }
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn method(&self) -> RangeMethod {
        self.method
    }

    /// Calibrate a single-input graph on one batch.
    pub fn calibrate(
        &self,
        graph: &Graph,
        ctx: &mut QuantContext,
        batch: &Tensor,
        executor: &dyn Executor,
    ) -> Result<()> {
        let mut inputs = graph.inputs();
        let input = match (inputs.next(), inputs.next()) {
            (Some(input), None) => input,
            _ => {
                return Err(QuantizeError::Calibration {
                    reason: "single-batch calibration needs a graph with exactly one input".into(),
                })
            }
        };
        let feeds = BTreeMap::from([(input.name.clone(), batch.clone())]);
        self.calibrate_feeds(graph, ctx, &feeds, executor)
    }

    /// Calibrate on one batch per graph input.
    ///
    /// Every placeholder shape must be fully bound and match its feed. The
    /// context is only updated once the whole batch has run.
    pub fn calibrate_feeds(
        &self,
        graph: &Graph,
        ctx: &mut QuantContext,
        feeds: &BTreeMap<String, Tensor>,
        executor: &dyn Executor,
    ) -> Result<()> {
        for node in graph.inputs() {
            if let Op::Placeholder { shape } = &node.op {
                let expected = bound_shape(&node.name, shape)?;
                let feed = feeds
                    .get(&node.name)
                    .ok_or_else(|| QuantizeError::not_found("input", node.name.clone()))?;
                if feed.shape() != expected.as_slice() {
                    return Err(QuantizeError::ShapeMismatch {
                        name: node.name.clone(),
                        expected,
                        actual: feed.shape().to_vec(),
                    });
                }
            }
        }

        let values = executor.run_all(graph, feeds, &self.device)?;

        let mut observed = Vec::with_capacity(values.len());
        for node in graph.nodes().filter(|n| n.kind() != OpKind::Constant) {
            let value = values
                .get(&node.name)
                .ok_or_else(|| QuantizeError::not_found("node", node.name.clone()))?;
            let data: Vec<f64> = value.iter().copied().collect();
            let bound = self.method.bound(&data);
            if !bound.is_finite() {
                return Err(QuantizeError::Calibration {
                    reason: format!("tensor '{}' has a non-finite range", node.name),
                });
            }
            observed.push((node.name.as_str(), bound, TensorStats::from_data(&data)));
        }

        for (name, bound, stats) in &observed {
            debug!(tensor = %name, bound, "observed");
            ctx.observe(name, *bound, stats);
        }
        ctx.finish_batch();
        info!(tensors = observed.len(), batches = ctx.batches(), method = %self.method, "calibrated batch");
        Ok(())
    }

    /// Draw up to `num_batches` batches of `batch` samples from `source`.
    ///
    /// `graph` must already be bound to `batch`; a short final batch is
    /// skipped since it cannot match the bound shape.
    pub fn calibrate_source(
        &self,
        graph: &Graph,
        ctx: &mut QuantContext,
        source: &mut dyn DataSource,
        batch: usize,
        num_batches: usize,
        executor: &dyn Executor,
    ) -> Result<usize> {
        let mut done = 0;
        while done < num_batches {
            let Some(tensor) = source.next_batch(batch)? else { break };
            if tensor.len_of(Axis(0)) != batch {
                debug!(samples = tensor.len_of(Axis(0)), "skipping short batch");
                break;
            }
            self.calibrate(graph, ctx, &tensor, executor)?;
            done += 1;
        }
        if done == 0 {
            return Err(QuantizeError::Calibration {
                reason: format!("data source yielded no full batch of {batch}"),
            });
        }
        Ok(done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphBuilder;
    use crate::runtime::Interpreter;
    use ndarray::arr2;

    #[test]
    fn test_random_dataset() {
        let dataset = CalibrationDataset::random(vec![3, 8, 8], 10, (-1.0, 1.0));

        assert_eq!(dataset.len(), 10);
        assert_eq!(dataset.sample_shape(), &[3, 8, 8]);
        assert_eq!(dataset.samples[0].len(), 3 * 8 * 8);
    }

    #[test]
    fn test_from_samples_and_batches() {
        let samples = vec![vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0], vec![7.0, 8.0, 9.0]];
        let mut dataset = CalibrationDataset::from_samples(samples, vec![3]).unwrap();
        assert_eq!(dataset.len(), 3);

        let first = dataset.next_batch(2).unwrap().unwrap();
        assert_eq!(first.shape(), [2, 3]);
        let second = dataset.next_batch(2).unwrap().unwrap();
        assert_eq!(second.shape(), [1, 3]);
        assert!(dataset.next_batch(2).unwrap().is_none());

        assert!(CalibrationDataset::from_samples(vec![vec![1.0]], vec![2]).is_err());
    }

    fn graph(shape: &[i64]) -> Graph {
        let mut b = GraphBuilder::new();
        let x = b.placeholder("x", shape);
        let r = b.op("r", Op::Relu, &[x]);
        b.build(vec![r]).unwrap()
    }

    #[test]
    fn test_calibrate_records_bounds() {
        let g = graph(&[1, 3]);
        let mut ctx = QuantContext::new();
        let cal = Calibrator::new(RangeMethod::MaxAbs);
        cal.calibrate(&g, &mut ctx, &arr2(&[[-4.0, 1.0, 2.0]]).into_dyn(), &Interpreter).unwrap();
        assert_eq!(ctx.bound("x"), Some(4.0));
        assert_eq!(ctx.bound("r"), Some(2.0));
        assert_eq!(ctx.batches(), 1);
    }

    #[test]
    fn test_calibrate_rejects_unbound_and_mismatched_shapes() {
        let cal = Calibrator::new(RangeMethod::MaxAbs);
        let batch = arr2(&[[1.0, 2.0, 3.0]]).into_dyn();

        let mut ctx = QuantContext::new();
        let err = cal.calibrate(&graph(&[-1, 3]), &mut ctx, &batch, &Interpreter).unwrap_err();
        assert!(matches!(err, QuantizeError::Shape { .. }));

        let err = cal.calibrate(&graph(&[2, 3]), &mut ctx, &batch, &Interpreter).unwrap_err();
        assert!(matches!(err, QuantizeError::ShapeMismatch { .. }));
        assert!(!ctx.is_calibrated());
    }
}
