//! Core crate for depth-aware frame interpolation: tiling orchestration,
//! the custom resampling kernels, and the ONNX/wgpu plumbing under them.

pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod gpu;
pub mod interpolator;
pub mod kernels;
pub mod logging;
pub mod runtime;
pub mod tensor;
pub mod tiling;
pub mod types;

pub use error::{InterpolationError, Result};
pub use interpolator::{Interpolator, InterpolatorOptions};
pub use tensor::{Shape, Tensor};
pub use types::Frame;
