//! ONNX Runtime session construction: CPU, CUDA EP, and TensorRT EP.
//!
//! One session per ONNX segment; every session of a pipeline shares the
//! same [`BackendOptions`].

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use ort::{
    execution_providers::{
        CUDAExecutionProvider, ExecutionProviderDispatch, TensorRTExecutionProvider,
    },
    session::{builder::GraphOptimizationLevel, Session},
};
use tracing::{debug, info, warn};

/// Inference backend selection.
///
/// Default is `Cuda`. `Tensorrt` requires TensorRT runtime libraries (`libnvinfer.so.10` or `nvinfer.dll`)
/// to be installed; if unavailable, the session falls back to CUDA EP automatically.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum InferenceBackend {
    Cpu,
    #[default]
    Cuda,
    Tensorrt,
}

impl InferenceBackend {
    /// Parse from string (case-insensitive). Returns `Cuda` for unknown values.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Self::Cpu,
            "tensorrt" | "trt" => Self::Tensorrt,
            _ => Self::Cuda,
        }
    }
}

impl std::fmt::Display for InferenceBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda => write!(f, "cuda"),
            Self::Tensorrt => write!(f, "tensorrt"),
        }
    }
}

/// Backend settings shared by every session of one pipeline.
#[derive(Clone, Debug, Default)]
pub struct BackendOptions {
    pub backend: InferenceBackend,
    pub device_id: i32,
    pub trt_cache_dir: Option<PathBuf>,
}

impl BackendOptions {
    pub fn cpu() -> Self {
        Self {
            backend: InferenceBackend::Cpu,
            device_id: 0,
            trt_cache_dir: None,
        }
    }

    pub fn session_config<'a>(&'a self, model_path: &'a Path) -> SessionConfig<'a> {
        SessionConfig {
            model_path,
            backend: &self.backend,
            device_id: self.device_id,
            trt_cache_dir: self.trt_cache_dir.as_deref(),
        }
    }
}

pub struct SessionConfig<'a> {
    pub model_path: &'a Path,
    pub backend: &'a InferenceBackend,
    pub device_id: i32,
    pub trt_cache_dir: Option<&'a Path>,
}

fn execution_providers(config: &SessionConfig<'_>) -> Vec<ExecutionProviderDispatch> {
    let cuda = || CUDAExecutionProvider::default().with_device_id(config.device_id);
    match config.backend {
        InferenceBackend::Cpu => Vec::new(),
        InferenceBackend::Cuda => vec![cuda().build().error_on_failure()],
        // Without libnvinfer the TensorRT provider is skipped and CUDA takes the graph.
        InferenceBackend::Tensorrt => {
            let cache_dir = trt_cache_dir(config);
            vec![
                TensorRTExecutionProvider::default()
                    .with_engine_cache(true)
                    .with_engine_cache_path(cache_dir.to_string_lossy().into_owned())
                    .with_fp16(true)
                    .with_device_id(config.device_id)
                    .build(),
                cuda().build(),
            ]
        }
    }
}

fn trt_cache_dir<'a>(config: &SessionConfig<'a>) -> &'a Path {
    config.trt_cache_dir.unwrap_or_else(|| Path::new("trt_cache"))
}

/// Build an `ort::Session` for `config.model_path`.
///
/// `Cuda` fails when the CUDA provider cannot be registered. `Tensorrt`
/// caches built engines under the configured directory and falls back to
/// CUDA. `Cpu` registers nothing and runs on ORT's default provider.
pub fn build_session(config: &SessionConfig<'_>) -> Result<Session> {
    if *config.backend == InferenceBackend::Tensorrt {
        let cache_dir = trt_cache_dir(config);
        if let Err(e) = std::fs::create_dir_all(cache_dir) {
            warn!(dir = %cache_dir.display(), error = %e, "Failed to create TRT cache directory");
        }
        info!(
            model = %config.model_path.display(),
            cache_dir = %cache_dir.display(),
            "Building TensorRT session (an uncached engine can take minutes)"
        );
    }

    let started = Instant::now();
    let session = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_execution_providers(execution_providers(config))?
        .commit_from_file(config.model_path)
        .with_context(|| format!("Failed to load ONNX model: {}", config.model_path.display()))?;

    debug!(
        backend = %config.backend,
        device_id = config.device_id,
        model = %config.model_path.display(),
        load_ms = %format!("{:.1}", started.elapsed().as_secs_f64() * 1000.0),
        "ONNX session ready"
    );
    Ok(session)
}

/// Per-network engine cache subdirectory, so engines built for different
/// graphs never collide.
pub fn resolve_trt_cache_dir(base_dir: &Path, cache_key: Option<&str>) -> PathBuf {
    match cache_key {
        Some(key) => base_dir.join(key),
        None => base_dir.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_from_str_lossy() {
        assert_eq!(InferenceBackend::from_str_lossy("cpu"), InferenceBackend::Cpu);
        assert_eq!(InferenceBackend::from_str_lossy("CPU"), InferenceBackend::Cpu);
        assert_eq!(
            InferenceBackend::from_str_lossy("cuda"),
            InferenceBackend::Cuda
        );
        assert_eq!(
            InferenceBackend::from_str_lossy("TensorRT"),
            InferenceBackend::Tensorrt
        );
        assert_eq!(
            InferenceBackend::from_str_lossy("trt"),
            InferenceBackend::Tensorrt
        );
        assert_eq!(
            InferenceBackend::from_str_lossy("unknown"),
            InferenceBackend::Cuda
        );
        assert_eq!(InferenceBackend::from_str_lossy(""), InferenceBackend::Cuda);
    }

    #[test]
    fn test_backend_default() {
        assert_eq!(InferenceBackend::default(), InferenceBackend::Cuda);
    }

    #[test]
    fn test_backend_display_round_trips() {
        for backend in [
            InferenceBackend::Cpu,
            InferenceBackend::Cuda,
            InferenceBackend::Tensorrt,
        ] {
            assert_eq!(InferenceBackend::from_str_lossy(&backend.to_string()), backend);
        }
    }

    #[test]
    fn test_resolve_trt_cache_dir_with_key() {
        let base = PathBuf::from("trt_cache");
        let resolved = resolve_trt_cache_dir(&base, Some("flownet"));
        assert_eq!(resolved, PathBuf::from("trt_cache/flownet"));
    }

    #[test]
    fn test_resolve_trt_cache_dir_without_key() {
        let base = PathBuf::from("trt_cache");
        assert_eq!(resolve_trt_cache_dir(&base, None), base);
    }

    #[test]
    fn test_session_config_borrows_options() {
        let trt_cache_dir = std::env::temp_dir().join("trt_cache");
        let options = BackendOptions {
            backend: InferenceBackend::Tensorrt,
            device_id: 1,
            trt_cache_dir: Some(trt_cache_dir.clone()),
        };
        let config = options.session_config(Path::new("model.onnx"));
        assert_eq!(config.backend, &InferenceBackend::Tensorrt);
        assert_eq!(config.device_id, 1);
        assert_eq!(config.trt_cache_dir, Some(trt_cache_dir.as_path()));
    }

    #[test]
    fn test_provider_chain_per_backend() {
        let model = Path::new("model.onnx");
        let chain = |backend: InferenceBackend| {
            let options = BackendOptions { backend, ..BackendOptions::cpu() };
            execution_providers(&options.session_config(model)).len()
        };
        assert_eq!(chain(InferenceBackend::Cpu), 0);
        assert_eq!(chain(InferenceBackend::Cuda), 1);
        assert_eq!(chain(InferenceBackend::Tensorrt), 2);
    }

    #[test]
    fn test_trt_cache_dir_defaults_when_unset() {
        let options = BackendOptions {
            backend: InferenceBackend::Tensorrt,
            ..BackendOptions::cpu()
        };
        let config = options.session_config(Path::new("model.onnx"));
        assert_eq!(trt_cache_dir(&config), Path::new("trt_cache"));
    }
}
