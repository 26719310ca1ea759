//! YAML and TOML configuration file support.
//!
//! A configuration file describes one pipeline run: where the model lives,
//! where to split it, how to calibrate, how to quantize and how to merge the
//! quantized base back with its float top.

use crate::calibration::RangeMethod;
use crate::context::RestorePolicy;
use crate::errors::{QuantizeError, Result};
use crate::graph::OpKind;
use crate::merge::AttributeDeps;
use crate::quantization::QuantConfig;
use crate::runtime::Device;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Top-level pipeline configuration.
///
/// Can be loaded from a YAML or TOML file with [`Config::from_file`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub model: ModelConfig,

    #[serde(default)]
    pub split: SplitConfig,

    #[serde(default)]
    pub calibrate: CalibrateConfig,

    #[serde(default)]
    pub quantize: QuantizeConfig,

    #[serde(default)]
    pub merge: MergeConfig,
}

/// Which model to load and where checkpoints go.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model name; files are `<dir>/<name>.json` and `<dir>/<name>.npz`.
    pub name: String,

    /// Directory holding the source model and every stage checkpoint.
    pub dir: PathBuf,

    /// Input shape to bind during preparation. `-1` leaves the batch open.
    #[serde(default)]
    pub input_shape: Option<Vec<i64>>,
}

/// Boundary nodes. An empty list quantizes the whole graph.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SplitConfig {
    #[serde(default)]
    pub keys: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrateConfig {
    /// Samples per calibration batch. Defaults to 16.
    #[serde(default = "default_batch")]
    pub batch: usize,

    /// Number of batches to observe. Defaults to 1.
    #[serde(default = "default_num_batches")]
    pub num_batches: usize,

    /// Range method (`max_abs`, `std_clip[:l]`, `percentile[:p]`).
    #[serde(default)]
    pub method: Option<String>,

    /// Shorthand for `std_clip:<lambd>`.
    #[serde(default)]
    pub lambd: Option<f64>,

    /// `.npy` calibration data; uniform random data in `[-1, 1)` when absent.
    #[serde(default)]
    pub data: Option<PathBuf>,

    /// `cpu`, `gpu` or `gpu:<ids>`.
    #[serde(default = "default_device")]
    pub device: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuantizeConfig {
    #[serde(default = "default_precision")]
    pub precision: u32,

    #[serde(default)]
    pub input_precision: Option<u32>,

    #[serde(default)]
    pub output_precision: Option<u32>,

    #[serde(default)]
    pub shift_bits: u32,

    #[serde(default = "default_softmax_lambd")]
    pub softmax_lambd: f64,

    /// Node names, `_OP_<kind>` entries and the `_ALL_EXCEPT_` marker.
    #[serde(default)]
    pub restore: Vec<String>,

    /// Bounds that replace calibrated ones.
    #[serde(default)]
    pub thresholds: BTreeMap<String, f64>,

    /// Per-node precision overrides.
    #[serde(default)]
    pub precisions: BTreeMap<String, u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MergeConfig {
    /// `op kind -> attribute -> base output` whose scale rescales the attribute.
    #[serde(default)]
    pub attribute_deps: BTreeMap<String, BTreeMap<String, String>>,

    /// `top output -> base output` whose scale the merged output carries.
    #[serde(default)]
    pub oscale_maps: BTreeMap<String, String>,
}

fn default_batch() -> usize {
    16
}

fn default_num_batches() -> usize {
    1
}

fn default_device() -> String {
    "cpu".to_string()
}

fn default_precision() -> u32 {
    8
}

fn default_softmax_lambd() -> f64 {
    10.0
}

impl Default for CalibrateConfig {
    fn default() -> Self {
        Self {
            batch: default_batch(),
            num_batches: default_num_batches(),
            method: None,
            lambd: None,
            data: None,
            device: default_device(),
        }
    }
}

impl Default for QuantizeConfig {
    fn default() -> Self {
        Self {
            precision: default_precision(),
            input_precision: None,
            output_precision: None,
            shift_bits: 0,
            softmax_lambd: default_softmax_lambd(),
            restore: Vec::new(),
            thresholds: BTreeMap::new(),
            precisions: BTreeMap::new(),
        }
    }
}

impl CalibrateConfig {
    /// The explicit method if given, else `std_clip` when `lambd` is set,
    /// else max-abs.
    pub fn range_method(&self) -> Result<RangeMethod> {
        match (&self.method, self.lambd) {
            (Some(m), _) => m.parse::<RangeMethod>().map_err(|reason| QuantizeError::Config { reason }),
            (None, Some(lambd)) => Ok(RangeMethod::StdClip(lambd)),
            (None, None) => Ok(RangeMethod::MaxAbs),
        }
    }

    pub fn device(&self) -> Result<Device> {
        self.device.parse::<Device>().map_err(|reason| QuantizeError::Config { reason })
    }
}

impl QuantizeConfig {
    pub fn quant_config(&self) -> QuantConfig {
        QuantConfig {
            precision: self.precision,
            input_precision: self.input_precision,
            output_precision: self.output_precision,
            shift_bits: self.shift_bits,
            softmax_lambd: self.softmax_lambd,
        }
    }

    pub fn restore_policy(&self) -> Result<RestorePolicy> {
        RestorePolicy::parse(&self.restore)
    }
}

impl MergeConfig {
    pub fn attribute_deps(&self) -> Result<AttributeDeps> {
        self.attribute_deps
            .iter()
            .map(|(kind, attrs)| {
                let kind = kind.parse::<OpKind>().map_err(|op| QuantizeError::Config {
                    reason: format!("attribute_deps names unknown operator '{op}'"),
                })?;
                Ok((kind, attrs.clone()))
            })
            .collect()
    }
}

impl Config {
    /// Load a config from a YAML or TOML file (auto-detected by extension).
    ///
    /// # Errors
    ///
    /// Returns [`QuantizeError::Config`] on I/O, parse, or unsupported format errors.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let extension = path
            .extension()
            .and_then(|s| s.to_str())
            .ok_or_else(|| QuantizeError::Config { reason: "Config file has no extension".into() })?;

        let content = std::fs::read_to_string(path).map_err(|e| QuantizeError::Config {
            reason: format!("Failed to read config file '{}': {e}", path.display()),
        })?;

        match extension {
            "yaml" | "yml" => Self::from_yaml(&content),
            "toml" => Self::from_toml(&content),
            _ => Err(QuantizeError::Config { reason: format!("Unsupported config format: {extension}") }),
        }
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| QuantizeError::Config { reason: format!("Failed to parse YAML config: {e}") })
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| QuantizeError::Config { reason: format!("Failed to parse TOML config: {e}") })
    }

    /// Validate every section.
    ///
    /// # Errors
    ///
    /// Returns [`QuantizeError::Config`] for malformed entries and
    /// [`QuantizeError::UnsupportedConfig`] for precisions the quantizer
    /// cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.model.name.is_empty() {
            return Err(QuantizeError::Config { reason: "model.name is empty".into() });
        }
        if let Some(shape) = &self.model.input_shape {
            if shape.is_empty() || shape.iter().enumerate().any(|(i, &d)| d == 0 || (d < 0 && (i > 0 || d != -1))) {
                return Err(QuantizeError::Config {
                    reason: format!("model.input_shape {shape:?} is invalid; only the batch dim may be -1"),
                });
            }
        }

        if self.calibrate.batch == 0 {
            return Err(QuantizeError::Config { reason: "calibrate.batch must be positive".into() });
        }
        if self.calibrate.num_batches == 0 {
            return Err(QuantizeError::Config { reason: "calibrate.num_batches must be positive".into() });
        }
        if let Some(lambd) = self.calibrate.lambd {
            if !(lambd.is_finite() && lambd > 0.0) {
                return Err(QuantizeError::Config { reason: format!("calibrate.lambd must be positive, got {lambd}") });
            }
        }
        self.calibrate.range_method()?;
        self.calibrate.device()?;

        self.quantize.quant_config().validate()?;
        self.quantize.restore_policy()?;
        for (name, &t) in &self.quantize.thresholds {
            if !(t.is_finite() && t > 0.0) {
                return Err(QuantizeError::Config { reason: format!("threshold for '{name}' must be positive, got {t}") });
            }
        }

        self.merge.attribute_deps()?;
        if self.split.keys.is_empty() && !(self.merge.attribute_deps.is_empty() && self.merge.oscale_maps.is_empty()) {
            return Err(QuantizeError::Config { reason: "merge settings given without split keys".into() });
        }

        Ok(())
    }
}
