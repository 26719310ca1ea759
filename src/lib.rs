pub mod calibration;
pub mod config;
pub mod context;
pub mod errors;
pub mod graph;
pub mod merge;
pub mod pipeline;
pub mod quantization;
pub mod runtime;
pub mod store;
pub mod transform;

#[cfg(feature = "python")]
mod python;

pub use calibration::{CalibrationDataset, Calibrator, DataSource, RangeMethod, TensorStats};
pub use config::Config;
pub use context::{QuantContext, RestorePolicy};
pub use errors::{QuantizeError, Result};
pub use graph::{Edge, Graph, GraphBuilder, Node, Op, OpKind, Tensor};
pub use merge::{AttributeDeps, Merger};
pub use pipeline::{evaluate, Pipeline, PipelineState, Stage};
pub use quantization::{InputExt, QuantConfig, QuantOutput, Quantizer, ScaleExp};
pub use runtime::{Device, Executor, Interpreter};
pub use store::{FileStore, ModelStore, QuantArtifact};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
