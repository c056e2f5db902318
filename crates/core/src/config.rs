use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::backend::{BackendOptions, InferenceBackend};
use crate::interpolator::InterpolatorOptions;

const CONFIG_FILE_NAME: &str = "config.toml";
pub const ENV_DATA_DIR: &str = "MIDFRAME_DATA_DIR";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub interpolation: InterpolationConfig,
    pub performance: PerformanceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub models_dir: PathBuf,
    pub trt_cache_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InterpolationConfig {
    /// `0` processes the whole padded frame as one tile.
    pub tile_size: usize,
    pub prepadding: usize,
    /// `-1` runs everything on the CPU.
    pub gpu_id: i32,
    pub timestep: f32,
    /// `cpu`, `cuda` or `tensorrt`.
    pub backend: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PerformanceConfig {
    /// Worker threads for the CPU kernels; `0` keeps the rayon default.
    pub threads: usize,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("models"),
            trt_cache_dir: PathBuf::from("trt_cache"),
        }
    }
}

impl Default for InterpolationConfig {
    fn default() -> Self {
        let options = InterpolatorOptions::default();
        Self {
            tile_size: options.tile_size,
            prepadding: options.prepadding,
            gpu_id: options.gpu_id,
            timestep: 0.5,
            backend: InferenceBackend::default().to_string(),
        }
    }
}

impl InterpolationConfig {
    pub fn to_options(&self) -> InterpolatorOptions {
        InterpolatorOptions {
            tile_size: self.tile_size,
            prepadding: self.prepadding,
            gpu_id: self.gpu_id,
        }
    }

    pub fn backend(&self) -> InferenceBackend {
        InferenceBackend::from_str_lossy(&self.backend)
    }
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Session settings with the cache directory resolved against `data_dir`.
    pub fn backend_options(&self, data_dir: &Path) -> BackendOptions {
        BackendOptions {
            backend: self.interpolation.backend(),
            device_id: self.interpolation.gpu_id.max(0),
            trt_cache_dir: Some(resolve_relative_to(data_dir, &self.paths.trt_cache_dir)),
        }
    }
}

/// Resolve the data directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. MIDFRAME_DATA_DIR environment variable
/// 3. Default: ./data
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Create `data_dir` and write a default config.toml unless one exists.
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        AppConfig::default().save_to_path(&cfg_path)?;
    }

    Ok(())
}

/// Absolute paths pass through; relative ones are joined to `base`.
pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
