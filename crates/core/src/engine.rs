//! Sub-network execution.
//!
//! A sub-network maps named input blobs to one named output blob. The
//! concrete implementation here, [`SegmentedNetwork`], chains ONNX graph
//! segments with the custom kernel layers that ONNX Runtime does not provide,
//! as described by a weight description file next to the models.

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use half::f16;
use ort::session::{Session, SessionInputValue};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::backend::{build_session, resolve_trt_cache_dir, BackendOptions};
use crate::error::{InterpolationError, Result};
use crate::gpu::{record_kernel, CommandStream, DeviceTensor};
use crate::kernels::{Kernel, KernelId, LayerRegistry};
use crate::tensor::{Shape, Tensor};

pub const DEPTH_NETWORK: &str = "depthnet";
pub const FLOW_NETWORK: &str = "flownet";
pub const CONTEXT_NETWORK: &str = "ctxnet";
pub const SYNTHESIS_NETWORK: &str = "interpolation";

/// A tensor on the host or resident on the compute device.
#[derive(Debug, Clone)]
pub enum Blob {
    Host(Tensor),
    Device(DeviceTensor),
}

impl Blob {
    pub fn shape(&self) -> Shape {
        match self {
            Self::Host(tensor) => tensor.shape(),
            Self::Device(tensor) => tensor.shape(),
        }
    }

    pub fn is_device(&self) -> bool {
        matches!(self, Self::Device(_))
    }
}

impl From<Tensor> for Blob {
    fn from(tensor: Tensor) -> Self {
        Self::Host(tensor)
    }
}

pub type BlobMap = HashMap<String, Blob>;

/// Where custom layers run for one extraction.
pub enum ExecutionTarget<'a> {
    Cpu,
    Gpu(&'a mut CommandStream),
}

fn warn_cpu_fallback(kernel: KernelId) {
    static WARNED: OnceLock<Mutex<HashSet<KernelId>>> = OnceLock::new();
    let mut warned = WARNED
        .get_or_init(|| Mutex::new(HashSet::new()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if warned.insert(kernel) {
        warn!(kernel = %kernel, "Kernel has no device program, running on CPU");
    }
}

impl ExecutionTarget<'_> {
    pub fn is_device(&self) -> bool {
        matches!(self, Self::Gpu(_))
    }

    /// Host view of `blob`, downloading it (and flushing the stream) if needed.
    pub fn host<'b>(&mut self, blob: &'b Blob) -> Result<Cow<'b, Tensor>> {
        match (blob, self) {
            (Blob::Host(tensor), _) => Ok(Cow::Borrowed(tensor)),
            (Blob::Device(tensor), Self::Gpu(stream)) => Ok(Cow::Owned(stream.download(tensor)?)),
            (Blob::Device(_), Self::Cpu) => Err(InterpolationError::DeviceUnavailable(
                "device blob handed to a CPU execution target".to_string(),
            )),
        }
    }

    /// Run `kernel` on the device when possible, otherwise on the CPU.
    pub fn dispatch(&mut self, kernel: &dyn Kernel, inputs: &[&Blob]) -> Result<Blob> {
        if let Self::Gpu(stream) = self {
            if kernel.gpu_program().is_some() {
                let uploaded = inputs
                    .iter()
                    .map(|blob| match blob {
                        Blob::Device(tensor) => Ok(tensor.clone()),
                        Blob::Host(tensor) => stream.upload(tensor),
                    })
                    .collect::<Result<Vec<_>>>()?;
                let refs: Vec<&DeviceTensor> = uploaded.iter().collect();
                return Ok(Blob::Device(record_kernel(stream, kernel, &refs)?));
            }
            warn_cpu_fallback(kernel.id());
        }

        let hosts = inputs
            .iter()
            .map(|blob| self.host(blob))
            .collect::<Result<Vec<_>>>()?;
        let refs: Vec<&Tensor> = hosts.iter().map(|t| t.as_ref()).collect();
        Ok(Blob::Host(kernel.forward_cpu(&refs)?))
    }
}

pub trait SubNetwork: Send + Sync {
    fn name(&self) -> &str;

    /// Feed `inputs` and return the blob named `output`.
    fn extract(&self, inputs: BlobMap, output: &str, target: &mut ExecutionTarget<'_>)
        -> Result<Blob>;
}

/// Serialized form of a weight description file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkDescriptor {
    #[serde(default)]
    pub name: Option<String>,
    pub inputs: Vec<String>,
    pub segments: Vec<SegmentDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SegmentDescriptor {
    Onnx {
        model: PathBuf,
        /// Model input name -> blob name.
        inputs: BTreeMap<String, String>,
        /// Model output name -> blob name.
        outputs: BTreeMap<String, String>,
        #[serde(default)]
        fp16: bool,
    },
    Layer {
        #[serde(rename = "type")]
        layer_type: String,
        inputs: Vec<String>,
        output: String,
    },
}

impl SegmentDescriptor {
    fn consumed(&self) -> Vec<&str> {
        match self {
            Self::Onnx { inputs, .. } => inputs.values().map(String::as_str).collect(),
            Self::Layer { inputs, .. } => inputs.iter().map(String::as_str).collect(),
        }
    }

    fn produced(&self) -> Vec<&str> {
        match self {
            Self::Onnx { outputs, .. } => outputs.values().map(String::as_str).collect(),
            Self::Layer { output, .. } => vec![output.as_str()],
        }
    }
}

impl NetworkDescriptor {
    /// Parse a `.toml` or `.json` description.
    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            InterpolationError::config(format!("failed to read {}: {e}", path.display()))
        })?;
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            serde_json::from_str(&raw).map_err(|e| {
                InterpolationError::config(format!("invalid network {}: {e}", path.display()))
            })
        } else {
            toml::from_str(&raw).map_err(|e| {
                InterpolationError::config(format!("invalid network {}: {e}", path.display()))
            })
        }
    }

    /// Index of the last segment consuming each blob.
    ///
    /// Fails when a segment reads a blob that is neither a network input nor
    /// produced by an earlier segment.
    pub fn last_uses(&self) -> Result<HashMap<String, usize>> {
        let mut defined: HashSet<&str> = self.inputs.iter().map(String::as_str).collect();
        let mut last_use = HashMap::new();
        for (index, segment) in self.segments.iter().enumerate() {
            for blob in segment.consumed() {
                if !defined.contains(blob) {
                    return Err(InterpolationError::config(format!(
                        "segment {index} reads undefined blob '{blob}'"
                    )));
                }
                last_use.insert(blob.to_string(), index);
            }
            defined.extend(segment.produced());
        }
        Ok(last_use)
    }
}

/// Locate `<name>.toml`, falling back to `<name>.json`.
pub fn descriptor_path(models_dir: &Path, name: &str) -> Result<PathBuf> {
    ["toml", "json"]
        .iter()
        .map(|ext| models_dir.join(format!("{name}.{ext}")))
        .find(|path| path.is_file())
        .ok_or_else(|| {
            InterpolationError::config(format!(
                "no weight description for '{name}' in {}",
                models_dir.display()
            ))
        })
}

/// Every name a description binds must exist on the model.
fn check_bindings<'a>(
    network: &str,
    model: &Path,
    kind: &str,
    declared: impl IntoIterator<Item = &'a String>,
    available: &[String],
) -> Result<()> {
    for name in declared {
        if !available.contains(name) {
            return Err(InterpolationError::config(format!(
                "network '{network}': {} has no {kind} named '{name}' (model {kind}s: {})",
                model.display(),
                available.join(", ")
            )));
        }
    }
    Ok(())
}

struct OnnxSegment {
    model: PathBuf,
    session: Mutex<Session>,
    inputs: Vec<(String, String)>,
    outputs: Vec<(String, String)>,
    fp16: bool,
}

fn to_session_value(tensor: &Tensor, fp16: bool) -> ort::Result<SessionInputValue<'static>> {
    let nchw = tensor.to_nchw();
    if fp16 {
        Ok(ort::value::Tensor::from_array(nchw.mapv(f16::from_f32))?.into())
    } else {
        Ok(ort::value::Tensor::from_array(nchw)?.into())
    }
}

impl OnnxSegment {
    fn run(&self, network: &str, blobs: &mut BlobMap, target: &mut ExecutionTarget<'_>) -> Result<()> {
        let fail = |e: &dyn std::fmt::Display| {
            InterpolationError::inference(network, format!("{}: {e}", self.model.display()))
        };

        let mut feeds: Vec<(String, SessionInputValue<'static>)> = Vec::with_capacity(self.inputs.len());
        for (model_input, blob_name) in &self.inputs {
            let blob = blobs.get(blob_name).ok_or_else(|| {
                InterpolationError::inference(network, format!("missing blob '{blob_name}'"))
            })?;
            let host = target.host(blob)?;
            let value = to_session_value(&host, self.fp16).map_err(|e| fail(&e))?;
            feeds.push((model_input.clone(), value));
        }

        let produced = {
            let mut session = self
                .session
                .lock()
                .map_err(|_| InterpolationError::inference(network, "session lock poisoned"))?;
            let outputs = session.run(feeds).map_err(|e| fail(&e))?;

            let mut produced = Vec::with_capacity(self.outputs.len());
            for (model_output, blob_name) in &self.outputs {
                let value = outputs.get(model_output.as_str()).ok_or_else(|| {
                    InterpolationError::inference(
                        network,
                        format!("{}: no output named '{model_output}'", self.model.display()),
                    )
                })?;
                let array = if self.fp16 {
                    value
                        .try_extract_array::<f16>()
                        .map_err(|e| fail(&e))?
                        .mapv(f16::to_f32)
                } else {
                    value
                        .try_extract_array::<f32>()
                        .map_err(|e| fail(&e))?
                        .to_owned()
                };
                produced.push((blob_name.clone(), Tensor::from_nchw(array)?));
            }
            produced
        };

        for (name, tensor) in produced {
            blobs.insert(name, Blob::Host(tensor));
        }
        Ok(())
    }
}

struct LayerSegment {
    kernel: Arc<dyn Kernel>,
    inputs: Vec<String>,
    output: String,
}

impl LayerSegment {
    fn run(&self, network: &str, blobs: &mut BlobMap, target: &mut ExecutionTarget<'_>) -> Result<()> {
        let inputs = self
            .inputs
            .iter()
            .map(|name| {
                blobs.get(name).ok_or_else(|| {
                    InterpolationError::inference(network, format!("missing blob '{name}'"))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let output = target.dispatch(self.kernel.as_ref(), &inputs)?;
        blobs.insert(self.output.clone(), output);
        Ok(())
    }
}

enum Segment {
    Onnx(OnnxSegment),
    Layer(LayerSegment),
}

/// Ordered chain of ONNX graphs and custom layers sharing one blob store.
pub struct SegmentedNetwork {
    name: String,
    inputs: Vec<String>,
    segments: Vec<Segment>,
    last_use: HashMap<String, usize>,
}

impl std::fmt::Debug for SegmentedNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentedNetwork")
            .field("name", &self.name)
            .field("inputs", &self.inputs)
            .field("segments", &self.segments.len())
            .finish()
    }
}

impl SegmentedNetwork {
    /// Load `<models_dir>/<name>.toml` (or `.json`).
    pub fn load_named(
        models_dir: &Path,
        name: &str,
        backend: &BackendOptions,
        registry: &LayerRegistry,
    ) -> Result<Self> {
        let path = descriptor_path(models_dir, name)?;
        let mut network = Self::load(&path, backend, registry)?;
        network.name = name.to_string();
        Ok(network)
    }

    pub fn load(path: &Path, backend: &BackendOptions, registry: &LayerRegistry) -> Result<Self> {
        let descriptor = NetworkDescriptor::from_path(path)?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        let name = descriptor.name.clone().unwrap_or_else(|| {
            path.file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_default()
        });
        Self::from_descriptor(name, descriptor, base, backend, registry)
    }

    /// Build from an already-parsed description; model paths resolve against `base`.
    pub fn from_descriptor(
        name: String,
        descriptor: NetworkDescriptor,
        base: &Path,
        backend: &BackendOptions,
        registry: &LayerRegistry,
    ) -> Result<Self> {
        let last_use = descriptor.last_uses()?;
        let mut segments = Vec::with_capacity(descriptor.segments.len());

        for segment in descriptor.segments {
            match segment {
                SegmentDescriptor::Onnx {
                    model,
                    inputs,
                    outputs,
                    fp16,
                } => {
                    let model = base.join(model);
                    let mut options = backend.clone();
                    options.trt_cache_dir = options
                        .trt_cache_dir
                        .as_deref()
                        .map(|dir| resolve_trt_cache_dir(dir, Some(&name)));
                    let session = build_session(&options.session_config(&model))
                        .map_err(|e| InterpolationError::inference(&name, format!("{e:#}")))?;
                    let model_inputs: Vec<String> =
                        session.inputs().iter().map(|i| i.name().to_string()).collect();
                    let model_outputs: Vec<String> =
                        session.outputs().iter().map(|o| o.name().to_string()).collect();
                    check_bindings(&name, &model, "input", inputs.keys(), &model_inputs)?;
                    check_bindings(&name, &model, "output", outputs.keys(), &model_outputs)?;
                    debug!(network = %name, model = %model.display(), fp16, "Loaded ONNX segment");
                    segments.push(Segment::Onnx(OnnxSegment {
                        model,
                        session: Mutex::new(session),
                        inputs: inputs.into_iter().collect(),
                        outputs: outputs.into_iter().collect(),
                        fp16,
                    }));
                }
                SegmentDescriptor::Layer {
                    layer_type,
                    inputs,
                    output,
                } => {
                    let kernel = registry.get(&layer_type).ok_or_else(|| {
                        InterpolationError::config(format!(
                            "network '{name}' uses unknown layer type '{layer_type}'"
                        ))
                    })?;
                    segments.push(Segment::Layer(LayerSegment {
                        kernel,
                        inputs,
                        output,
                    }));
                }
            }
        }

        Ok(Self {
            name,
            inputs: descriptor.inputs,
            segments,
            last_use,
        })
    }

    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Segment index after which `blob` is released, if it is ever consumed.
    pub fn last_use(&self, blob: &str) -> Option<usize> {
        self.last_use.get(blob).copied()
    }
}

impl SubNetwork for SegmentedNetwork {
    fn name(&self) -> &str {
        &self.name
    }

    fn extract(
        &self,
        mut blobs: BlobMap,
        output: &str,
        target: &mut ExecutionTarget<'_>,
    ) -> Result<Blob> {
        for input in &self.inputs {
            if !blobs.contains_key(input) {
                return Err(InterpolationError::inference(
                    &self.name,
                    format!("input '{input}' was not provided"),
                ));
            }
        }

        for (index, segment) in self.segments.iter().enumerate() {
            match segment {
                Segment::Onnx(onnx) => onnx.run(&self.name, &mut blobs, target)?,
                Segment::Layer(layer) => layer.run(&self.name, &mut blobs, target)?,
            }
            blobs.retain(|name, _| {
                name == output || self.last_use.get(name).is_some_and(|&last| last > index)
            });
        }

        blobs.remove(output).ok_or_else(|| {
            InterpolationError::config(format!(
                "network '{}' does not produce '{output}'",
                self.name
            ))
        })
    }
}
