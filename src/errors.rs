//! The error taxonomy shared by every pipeline stage.
//!
//! Library functions return [`Result<T>`](type@Result) over [`QuantizeError`].
//! Variants name the failed lookup, shape, operator or accumulator check
//! precisely enough for the CLI to report it without extra context; the
//! binary wraps them in `anyhow` only to attach the config or file path.
//!
//! Every variant is terminal for the stage that raised it: a stage either
//! produces a complete artifact or returns one of these and writes nothing.

use std::fmt;
use std::path::PathBuf;

/// Result type alias used throughout the quantgraph public API.
pub type Result<T> = std::result::Result<T, QuantizeError>;

/// Errors produced by the quantgraph library.
#[derive(Debug)]
pub enum QuantizeError {
    /// A referenced node, boundary key or tensor does not exist.
    NotFound {
        /// What kind of thing was looked up ("node", "boundary", ...).
        what: &'static str,
        /// The name that failed to resolve.
        name: String,
    },

    /// A shape could not be resolved (unbound non-batch dim, bad reshape, ...).
    Shape {
        /// What went wrong.
        reason: String,
    },

    /// A tensor's shape disagrees with the shape the graph expects.
    ShapeMismatch {
        /// Tensor or placeholder name.
        name: String,
        /// Shape declared by the graph.
        expected: Vec<usize>,
        /// Shape that was supplied or inferred.
        actual: Vec<usize>,
    },

    /// Operator kind outside the supported registry (or not valid at this stage).
    UnsupportedOp {
        /// Operator name.
        op: String,
        /// Node carrying the operator.
        node: String,
    },

    /// Quantizing a tensor that has no calibrated bound.
    MissingCalibration {
        /// Tensor name.
        name: String,
    },

    /// Merge-time attribute dependency on a producer with no output scale.
    MissingScale {
        /// Producer name.
        name: String,
    },

    /// The integer accumulator cannot hold a required accumulation.
    OverflowPolicy {
        /// Node whose accumulation overflows.
        node: String,
        /// Worst-case bits required.
        required_bits: u32,
        /// Bits available in the accumulator.
        limit: u32,
    },

    /// Structural graph error (duplicate name, cycle, invalid split, ...).
    GraphTransform {
        /// What went wrong.
        reason: String,
    },

    /// A stage prerequisite (checkpoint file) is absent.
    MissingFile {
        /// Path that was expected.
        path: PathBuf,
    },

    /// Failed to load a graph or side table from disk.
    ModelLoad {
        /// Path that was being loaded.
        path: PathBuf,
        /// What went wrong.
        reason: String,
    },

    /// Failed to save a graph or side table to disk.
    ModelSave {
        /// Path that was being written.
        path: PathBuf,
        /// What went wrong.
        reason: String,
    },

    /// Error during calibration (empty dataset, inference failure, etc.).
    Calibration {
        /// What went wrong.
        reason: String,
    },

    /// Configuration file parsing or validation error.
    Config {
        /// What went wrong.
        reason: String,
    },

    /// Unsupported quantization configuration (e.g. precision above 32 bits).
    UnsupportedConfig {
        /// What went wrong.
        reason: String,
    },

    /// Catch-all for rare edge cases that don't fit other variants.
    Other(String),
}

impl QuantizeError {
    pub(crate) fn not_found(what: &'static str, name: impl Into<String>) -> Self {
        QuantizeError::NotFound { what, name: name.into() }
    }

    pub(crate) fn graph(reason: impl Into<String>) -> Self {
        QuantizeError::GraphTransform { reason: reason.into() }
    }

    pub(crate) fn shape(reason: impl Into<String>) -> Self {
        QuantizeError::Shape { reason: reason.into() }
    }
}

impl fmt::Display for QuantizeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuantizeError::NotFound { what, name } => {
                write!(f, "{what} '{name}' not found")
            }
            QuantizeError::Shape { reason } => {
                write!(f, "shape error: {reason}")
            }
            QuantizeError::ShapeMismatch { name, expected, actual } => {
                write!(f, "shape mismatch for '{name}': expected {expected:?}, got {actual:?}")
            }
            QuantizeError::UnsupportedOp { op, node } => {
                write!(f, "unsupported operator '{op}' on node '{node}'")
            }
            QuantizeError::MissingCalibration { name } => {
                write!(f, "no calibration statistics for '{name}'; run calibration first")
            }
            QuantizeError::MissingScale { name } => {
                write!(f, "no output scale recorded for '{name}'")
            }
            QuantizeError::OverflowPolicy { node, required_bits, limit } => {
                write!(
                    f,
                    "node '{node}' needs a {required_bits}-bit accumulator but only {limit} bits are available"
                )
            }
            QuantizeError::GraphTransform { reason } => {
                write!(f, "graph transform error: {reason}")
            }
            QuantizeError::MissingFile { path } => {
                write!(f, "required file '{}' not found", path.display())
            }
            QuantizeError::ModelLoad { path, reason } => {
                write!(f, "failed to load '{}': {reason}", path.display())
            }
            QuantizeError::ModelSave { path, reason } => {
                write!(f, "failed to save '{}': {reason}", path.display())
            }
            QuantizeError::Calibration { reason } => {
                write!(f, "calibration error: {reason}")
            }
            QuantizeError::Config { reason } => {
                write!(f, "config error: {reason}")
            }
            QuantizeError::UnsupportedConfig { reason } => {
                write!(f, "unsupported config: {reason}")
            }
            QuantizeError::Other(msg) => {
                write!(f, "{msg}")
            }
        }
    }
}

impl std::error::Error for QuantizeError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_names_the_offender() {
        let err = QuantizeError::UnsupportedOp { op: "lrn".into(), node: "norm1".into() };
        let msg = err.to_string();
        assert!(msg.contains("lrn"));
        assert!(msg.contains("norm1"));

        let err = QuantizeError::not_found("boundary", "fc7");
        assert_eq!(err.to_string(), "boundary 'fc7' not found");
    }
}
