//! On-disk checkpoints for pipeline stages.
//!
//! A stage artifact is identified by a suffix (`prepare`, `base`, `top`,
//! `base.quantize`, ...). [`FileStore`] lays artifacts out as
//!
//! ```text
//! <dir>/<model>.json               source graph descriptor
//! <dir>/<model>.npz                source payloads
//! <dir>/<model>.<suffix>.json      graph descriptor
//! <dir>/<model>.<suffix>.npz       constant payloads
//! <dir>/<model>.<suffix>.ctx.json  calibration context
//! <dir>/<model>.<suffix>.ext.json  quantization artifact
//! ```
//!
//! Every file is serialized completely in memory first and then moved into
//! place, so a failing stage never leaves a half-written checkpoint behind.

use crate::context::QuantContext;
use crate::errors::{QuantizeError, Result};
use crate::graph::{Graph, GraphDef, Tensor};
use crate::quantization::{InputExt, QuantOutput};
use ndarray_npy::{NpzReader, NpzWriter};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Everything a downstream runtime needs besides the graph itself.
///
/// Field names and order are part of the published artifact format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantArtifact {
    /// One entry per graph output: real value = integer value / scale.
    pub output_scales: Vec<f64>,
    pub input_ext: BTreeMap<String, InputExt>,
    /// Input shape of the prepared (unquantized) model.
    pub input_shape: Vec<i64>,
    #[serde(default)]
    pub output_names: Vec<String>,
    #[serde(default)]
    pub name_map: BTreeMap<String, String>,
}

impl QuantArtifact {
    pub fn from_output(out: &QuantOutput, input_shape: Vec<i64>) -> Self {
        Self {
            output_scales: out.output_scales.clone(),
            input_ext: out.input_ext.clone(),
            input_shape,
            output_names: out.output_names.clone(),
            name_map: out.name_map.clone(),
        }
    }

    /// Output scales keyed by original output name.
    pub fn output_scale_table(&self) -> BTreeMap<String, f64> {
        self.output_names.iter().cloned().zip(self.output_scales.iter().copied()).collect()
    }
}

/// Read a graph descriptor without its payloads.
pub fn read_graph_def(path: impl AsRef<Path>) -> Result<GraphDef> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(QuantizeError::MissingFile { path: path.to_path_buf() });
    }
    let content = fs::read_to_string(path)
        .map_err(|e| QuantizeError::ModelLoad { path: path.to_path_buf(), reason: e.to_string() })?;
    serde_json::from_str(&content)
        .map_err(|e| QuantizeError::ModelLoad { path: path.to_path_buf(), reason: e.to_string() })
}

/// Persistence of stage artifacts.
pub trait ModelStore {
    /// The unprepared model the pipeline starts from.
    fn load_source(&self) -> Result<Graph>;
    fn save_source(&self, graph: &Graph) -> Result<()>;

    fn save_graph(&self, suffix: &str, graph: &Graph) -> Result<()>;
    fn load_graph(&self, suffix: &str) -> Result<Graph>;

    fn save_context(&self, suffix: &str, ctx: &QuantContext) -> Result<()>;
    fn load_context(&self, suffix: &str) -> Result<QuantContext>;

    fn save_artifact(&self, suffix: &str, artifact: &QuantArtifact) -> Result<()>;
    fn load_artifact(&self, suffix: &str) -> Result<QuantArtifact>;

    /// Save a realized graph together with its artifact: both or neither.
    fn save_quantized(&self, suffix: &str, graph: &Graph, artifact: &QuantArtifact) -> Result<()>;

    /// Whether a graph checkpoint exists for `suffix`.
    fn has_graph(&self, suffix: &str) -> bool;
}

#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
    model: String,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>, model: impl Into<String>) -> Self {
        Self { dir: dir.into(), model: model.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, suffix: &str, ext: &str) -> PathBuf {
        self.dir.join(format!("{}.{suffix}.{ext}", self.model))
    }

    pub fn source_path(&self, ext: &str) -> PathBuf {
        self.dir.join(format!("{}.{ext}", self.model))
    }

    fn write_graph(&self, json: PathBuf, npz: PathBuf, graph: &Graph) -> Result<()> {
        self.commit(Self::graph_files(json, npz, graph)?)
    }

    fn graph_files(json: PathBuf, npz: PathBuf, graph: &Graph) -> Result<Vec<(PathBuf, Vec<u8>)>> {
        let json_bytes = Self::json_bytes(&json, &graph.to_def())?;
        let npz_bytes = Self::npz_bytes(&npz, graph)?;
        Ok(vec![(json, json_bytes), (npz, npz_bytes)])
    }

    fn read_graph(&self, json: &Path, npz: &Path) -> Result<Graph> {
        let def: GraphDef = self.read_json(json)?;
        let payloads = self.read_npz(npz)?;
        Graph::from_def(&def, &payloads)
    }

    fn read(&self, path: &Path) -> Result<Vec<u8>> {
        if !path.exists() {
            return Err(QuantizeError::MissingFile { path: path.to_path_buf() });
        }
        fs::read(path).map_err(|e| QuantizeError::ModelLoad { path: path.to_path_buf(), reason: e.to_string() })
    }

    fn read_json<T: DeserializeOwned>(&self, path: &Path) -> Result<T> {
        let bytes = self.read(path)?;
        serde_json::from_slice(&bytes)
            .map_err(|e| QuantizeError::ModelLoad { path: path.to_path_buf(), reason: e.to_string() })
    }

    fn json_bytes<T: Serialize>(path: &Path, value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(value)
            .map_err(|e| QuantizeError::ModelSave { path: path.to_path_buf(), reason: e.to_string() })
    }

    fn npz_bytes(path: &Path, graph: &Graph) -> Result<Vec<u8>> {
        let save_err = |reason: String| QuantizeError::ModelSave { path: path.to_path_buf(), reason };
        let mut npz = NpzWriter::new(Cursor::new(Vec::new()));
        for (name, value) in graph.payloads() {
            npz.add_array(name, value).map_err(|e| save_err(e.to_string()))?;
        }
        Ok(npz.finish().map_err(|e| save_err(e.to_string()))?.into_inner())
    }

    fn read_npz(&self, path: &Path) -> Result<HashMap<String, Tensor>> {
        let load_err = |reason: String| QuantizeError::ModelLoad { path: path.to_path_buf(), reason };
        let bytes = self.read(path)?;
        let mut npz = NpzReader::new(Cursor::new(bytes)).map_err(|e| load_err(e.to_string()))?;
        let names = npz.names().map_err(|e| load_err(e.to_string()))?;
        let mut payloads = HashMap::with_capacity(names.len());
        for entry in names {
            let value: Tensor = npz.by_name(&entry).map_err(|e| load_err(e.to_string()))?;
            let name = entry.strip_suffix(".npy").unwrap_or(&entry).to_string();
            payloads.insert(name, value);
        }
        Ok(payloads)
    }

    /// Write every file or none: all contents are already in memory, each
    /// one goes to a temporary sibling first and is renamed afterwards. On
    /// failure the temporaries and the files already moved are removed.
    fn commit(&self, files: Vec<(PathBuf, Vec<u8>)>) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .map_err(|e| QuantizeError::ModelSave { path: self.dir.clone(), reason: e.to_string() })?;
        let mut staged = Vec::with_capacity(files.len());
        for (path, bytes) in files {
            let mut tmp = path.clone().into_os_string();
            tmp.push(".tmp");
            let tmp = PathBuf::from(tmp);
            if let Err(e) = fs::write(&tmp, bytes) {
                Self::discard(staged.iter().map(|(t, _)| t).chain([&tmp]));
                return Err(QuantizeError::ModelSave { path: tmp, reason: e.to_string() });
            }
            staged.push((tmp, path));
        }
        for i in 0..staged.len() {
            let (tmp, path) = &staged[i];
            if let Err(e) = fs::rename(tmp, path) {
                warn!(path = %path.display(), "checkpoint commit failed, rolling back");
                Self::discard(staged[..i].iter().map(|(_, p)| p).chain(staged[i..].iter().map(|(t, _)| t)));
                return Err(QuantizeError::ModelSave { path: path.clone(), reason: e.to_string() });
            }
            debug!(path = %path.display(), "wrote");
        }
        Ok(())
    }

    fn discard<'p>(paths: impl Iterator<Item = &'p PathBuf>) {
        for path in paths {
            if let Err(e) = fs::remove_file(path) {
                debug!(path = %path.display(), error = %e, "cleanup skipped");
            }
        }
    }
}

impl ModelStore for FileStore {
    fn load_source(&self) -> Result<Graph> {
        self.read_graph(&self.source_path("json"), &self.source_path("npz"))
    }

    fn save_source(&self, graph: &Graph) -> Result<()> {
        self.write_graph(self.source_path("json"), self.source_path("npz"), graph)
    }

    fn save_graph(&self, suffix: &str, graph: &Graph) -> Result<()> {
        self.write_graph(self.path(suffix, "json"), self.path(suffix, "npz"), graph)
    }

    fn load_graph(&self, suffix: &str) -> Result<Graph> {
        self.read_graph(&self.path(suffix, "json"), &self.path(suffix, "npz"))
    }

    fn save_context(&self, suffix: &str, ctx: &QuantContext) -> Result<()> {
        let path = self.path(suffix, "ctx.json");
        let bytes = Self::json_bytes(&path, ctx)?;
        self.commit(vec![(path, bytes)])
    }

    fn load_context(&self, suffix: &str) -> Result<QuantContext> {
        self.read_json(&self.path(suffix, "ctx.json"))
    }

    fn save_artifact(&self, suffix: &str, artifact: &QuantArtifact) -> Result<()> {
        let path = self.path(suffix, "ext.json");
        let bytes = Self::json_bytes(&path, artifact)?;
        self.commit(vec![(path, bytes)])
    }

    fn load_artifact(&self, suffix: &str) -> Result<QuantArtifact> {
        self.read_json(&self.path(suffix, "ext.json"))
    }

    fn save_quantized(&self, suffix: &str, graph: &Graph, artifact: &QuantArtifact) -> Result<()> {
        let mut files = Self::graph_files(self.path(suffix, "json"), self.path(suffix, "npz"), graph)?;
        let ext = self.path(suffix, "ext.json");
        files.push((ext.clone(), Self::json_bytes(&ext, artifact)?));
        self.commit(files)
    }

    fn has_graph(&self, suffix: &str) -> bool {
        self.path(suffix, "json").exists() && self.path(suffix, "npz").exists()
    }
}
