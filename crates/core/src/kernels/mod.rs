//! Custom layers the inference engine does not provide natively.
//!
//! Each kernel has a parallel CPU forward pass. Kernels that can run on the
//! compute device also expose a WGSL program; the execution target picks the
//! variant at runtime.

pub mod correlation;
pub mod depth_flow_projection;
pub mod filter_interpolation;
pub mod optical_flow_warp;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{InterpolationError, Result};
use crate::tensor::{Shape, Tensor};

pub use correlation::Correlation;
pub use depth_flow_projection::DepthFlowProjection;
pub use filter_interpolation::FilterInterpolation;
pub use optical_flow_warp::OpticalFlowWarp;

/// Workgroup edge used by every WGSL program (8x8x1).
pub const WORKGROUP_SIZE: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelId {
    Correlation,
    OpticalFlowWarp,
    DepthFlowProjection,
    FilterInterpolation,
}

impl KernelId {
    pub const ALL: [KernelId; 4] = [
        KernelId::Correlation,
        KernelId::OpticalFlowWarp,
        KernelId::DepthFlowProjection,
        KernelId::FilterInterpolation,
    ];

    /// Layer type name used in network descriptions.
    pub fn layer_type(self) -> &'static str {
        match self {
            Self::Correlation => "Correlation",
            Self::OpticalFlowWarp => "OpticalFlowWarp",
            Self::DepthFlowProjection => "DepthFlowProjection",
            Self::FilterInterpolation => "FilterInterpolation",
        }
    }
}

impl fmt::Display for KernelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.layer_type())
    }
}

/// Device variant of a kernel: WGSL source plus its binding arity.
///
/// Bindings are laid out as `inputs` read-only storage buffers, one
/// read-write output buffer, then a uniform of four `u32`s:
/// `{width, height, input_channels, output_channels}`.
#[derive(Debug, Clone, Copy)]
pub struct GpuProgram {
    pub label: &'static str,
    pub source: &'static str,
    pub inputs: usize,
}

impl GpuProgram {
    pub fn params(&self, inputs: &[Shape], output: Shape) -> [u32; 4] {
        let input_channels = inputs.first().map(|s| s.channels).unwrap_or(0);
        [
            output.width as u32,
            output.height as u32,
            input_channels as u32,
            output.channels as u32,
        ]
    }

    pub fn workgroups(&self, output: Shape) -> [u32; 3] {
        [
            (output.width as u32).div_ceil(WORKGROUP_SIZE),
            (output.height as u32).div_ceil(WORKGROUP_SIZE),
            output.channels as u32,
        ]
    }
}

pub trait Kernel: Send + Sync {
    fn id(&self) -> KernelId;

    /// Validate input shapes and return the output shape.
    fn output_shape(&self, inputs: &[Shape]) -> Result<Shape>;

    fn forward_cpu(&self, inputs: &[&Tensor]) -> Result<Tensor>;

    fn gpu_program(&self) -> Option<GpuProgram> {
        None
    }
}

pub(crate) fn expect_inputs(id: KernelId, inputs: &[Shape], count: usize) -> Result<()> {
    if inputs.len() != count {
        return Err(InterpolationError::shape(
            format!("{id} inputs"),
            count,
            inputs.len(),
        ));
    }
    if let Some(empty) = inputs.iter().find(|s| s.is_empty()) {
        return Err(InterpolationError::shape(
            format!("{id} input"),
            "non-empty tensor",
            empty,
        ));
    }
    Ok(())
}

pub(crate) fn expect_channels(id: KernelId, what: &str, shape: Shape, channels: usize) -> Result<()> {
    if shape.channels != channels {
        return Err(InterpolationError::shape(
            format!("{id} {what}"),
            format!("{channels} channels"),
            format!("{} channels", shape.channels),
        ));
    }
    Ok(())
}

pub(crate) fn expect_same_extent(id: KernelId, what: &str, reference: Shape, other: Shape) -> Result<()> {
    if !reference.same_extent(&other) {
        return Err(InterpolationError::shape(
            format!("{id} {what}"),
            format!("{}x{}", reference.width, reference.height),
            format!("{}x{}", other.width, other.height),
        ));
    }
    Ok(())
}

pub(crate) fn shapes_of(inputs: &[&Tensor]) -> Vec<Shape> {
    inputs.iter().map(|t| t.shape()).collect()
}

/// Maps layer type names in network descriptions to kernel instances.
pub struct LayerRegistry {
    layers: HashMap<String, Arc<dyn Kernel>>,
}

impl LayerRegistry {
    pub fn new() -> Self {
        Self {
            layers: HashMap::new(),
        }
    }

    pub fn with_builtin_layers() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(Correlation));
        registry.register(Arc::new(OpticalFlowWarp));
        registry.register(Arc::new(DepthFlowProjection));
        registry.register(Arc::new(FilterInterpolation));
        registry
    }

    pub fn register(&mut self, kernel: Arc<dyn Kernel>) {
        self.layers
            .insert(kernel.id().layer_type().to_string(), kernel);
    }

    pub fn get(&self, layer_type: &str) -> Option<Arc<dyn Kernel>> {
        self.layers.get(layer_type).cloned()
    }

    pub fn list_layer_types(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.layers.keys().map(|v| v.as_str()).collect();
        names.sort_unstable();
        names
    }
}

impl Default for LayerRegistry {
    fn default() -> Self {
        Self::with_builtin_layers()
    }
}
