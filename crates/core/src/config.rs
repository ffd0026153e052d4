use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::device::ElementType;
use crate::engine::{ModelBindings, DEFAULT_INPUT0, DEFAULT_INPUT1, DEFAULT_OUTPUT};
use crate::layout::PixelLayout;
use crate::normalize::Normalization;
use crate::onnx::{EngineConfig, InferenceBackend};
use crate::pipeline::PipelineOptions;
use crate::tiling::{
    TilePolicy, TileSpec, TilingMode, DEFAULT_ALIGNMENT, DEFAULT_BYTES_PER_PIXEL,
};

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "TILERP_DATA_DIR";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct AppConfig {
    pub tiling: TilingConfig,
    pub model: ModelConfig,
    pub engine: EngineSection,
    pub device: DeviceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TilingConfig {
    pub mode: TilingMode,
    pub tile_size: u32,
    pub overlap: u32,
    pub alignment: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ModelConfig {
    pub path: PathBuf,
    pub input0: String,
    pub input1: String,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestep_input: Option<String>,
    pub normalization: Normalization,
    pub fp16_storage: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineSection {
    pub provider: InferenceBackend,
    pub trt_cache_dir: PathBuf,
    pub device_id: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DeviceConfig {
    /// Zero when the budget is unknown.
    pub heap_budget_mb: u64,
    pub bytes_per_pixel: u64,
}

impl Default for TilingConfig {
    fn default() -> Self {
        let spec = TileSpec::SMALL;
        Self {
            mode: TilingMode::Fixed,
            tile_size: spec.tile_size.unwrap_or(256),
            overlap: spec.overlap,
            alignment: DEFAULT_ALIGNMENT,
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("models/cain.onnx"),
            input0: DEFAULT_INPUT0.to_string(),
            input1: DEFAULT_INPUT1.to_string(),
            output: DEFAULT_OUTPUT.to_string(),
            timestep_input: None,
            normalization: Normalization::MeanCentered,
            fp16_storage: true,
        }
    }
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            provider: InferenceBackend::Cuda,
            trt_cache_dir: PathBuf::from("trt_cache"),
            device_id: 0,
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            heap_budget_mb: 0,
            bytes_per_pixel: DEFAULT_BYTES_PER_PIXEL,
        }
    }
}

impl TilingConfig {
    pub fn policy(&self) -> TilePolicy {
        TilePolicy {
            mode: self.mode,
            fixed: TileSpec::fixed(self.tile_size, self.overlap).with_alignment(self.alignment),
            bytes_per_pixel: DEFAULT_BYTES_PER_PIXEL,
        }
    }
}

impl ModelConfig {
    pub fn bindings(&self) -> ModelBindings {
        ModelBindings {
            input0: self.input0.clone(),
            input1: self.input1.clone(),
            output: self.output.clone(),
            timestep: self.timestep_input.clone(),
        }
    }
}

impl DeviceConfig {
    pub fn heap_budget_bytes(&self) -> Option<u64> {
        (self.heap_budget_mb > 0).then(|| self.heap_budget_mb * 1024 * 1024)
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

    /// Pipeline options described by this config. Tiling parameters are
    /// validated here so a bad file is reported before any model loads.
    pub fn pipeline_options(&self) -> Result<PipelineOptions> {
        let mut tiling = self.tiling.policy();
        tiling.bytes_per_pixel = self.device.bytes_per_pixel;

        let options = PipelineOptions {
            tiling,
            normalization: self.model.normalization,
            storage: if self.model.fp16_storage {
                ElementType::F16
            } else {
                ElementType::F32
            },
            layout: PixelLayout::native(),
        };
        options
            .validate()
            .context("invalid [tiling] section in config")?;
        Ok(options)
    }

    /// Engine settings with model and cache paths resolved against `data_dir`.
    pub fn engine_config(&self, data_dir: &Path) -> EngineConfig {
        let mut config = EngineConfig::new(resolve_relative_to(data_dir, &self.model.path));
        config.backend = self.engine.provider;
        config.trt_cache_dir = Some(resolve_relative_to(data_dir, &self.engine.trt_cache_dir));
        config.device_id = self.engine.device_id;
        config.bindings = self.model.bindings();
        config
    }
}

/// Resolve the data directory: CLI override, then `TILERP_DATA_DIR`, then `./data`.
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

/// Create the data directory and write a default `config.toml` if none exists.
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

pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_default_config_matches_cain_deployment() {
        let cfg = AppConfig::default();

        assert_eq!(cfg.tiling.mode, TilingMode::Fixed);
        assert_eq!(cfg.tiling.tile_size, 256);
        assert_eq!(cfg.tiling.overlap, 32);
        assert_eq!(cfg.tiling.alignment, 32);
        assert_eq!(cfg.model.input0, "x.1");
        assert_eq!(cfg.model.input1, "x.3");
        assert_eq!(cfg.model.output, "4070");
        assert_eq!(cfg.model.normalization, Normalization::MeanCentered);
        assert!(cfg.model.fp16_storage);
        assert_eq!(cfg.engine.provider, InferenceBackend::Cuda);
        assert_eq!(cfg.device.heap_budget_bytes(), None);
    }

    #[test]
    fn test_toml_roundtrip_preserves_values() {
        let mut original = AppConfig::default();
        original.tiling.mode = TilingMode::Auto;
        original.model.timestep_input = Some("timestep".to_string());
        original.model.normalization = Normalization::Raw;
        original.engine.provider = InferenceBackend::Tensorrt;
        original.device.heap_budget_mb = 4096;

        let encoded = toml::to_string_pretty(&original).expect("serialize config");
        let decoded: AppConfig = toml::from_str(&encoded).expect("deserialize config");
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_partial_file_fills_missing_fields_with_defaults() {
        let raw = "[tiling]\nmode = \"none\"\n\n[model]\nnormalization = \"raw\"\n";
        let cfg: AppConfig = toml::from_str(raw).expect("parse partial config");

        assert_eq!(cfg.tiling.mode, TilingMode::None);
        assert_eq!(cfg.tiling.tile_size, 256);
        assert_eq!(cfg.model.normalization, Normalization::Raw);
        assert_eq!(cfg.model.output, "4070");
        assert_eq!(cfg.engine, EngineSection::default());
    }

    #[test]
    fn test_timestep_input_is_omitted_when_unset() {
        let encoded = toml::to_string_pretty(&AppConfig::default()).expect("serialize config");
        assert!(!encoded.contains("timestep_input"));
    }

    #[test]
    fn test_pipeline_options_follow_config() {
        let mut cfg = AppConfig::default();
        cfg.tiling.tile_size = 512;
        cfg.tiling.overlap = 64;
        cfg.model.fp16_storage = false;
        cfg.device.bytes_per_pixel = 1024;

        let options = cfg.pipeline_options().expect("valid options");
        assert_eq!(options.tiling.fixed, TileSpec::LARGE);
        assert_eq!(options.tiling.bytes_per_pixel, 1024);
        assert_eq!(options.storage, ElementType::F32);
        assert_eq!(options.layout, PixelLayout::native());
    }

    #[test]
    fn test_unaligned_tiling_is_rejected() {
        let mut cfg = AppConfig::default();
        cfg.tiling.overlap = 20;
        assert!(cfg.pipeline_options().is_err());

        let mut cfg = AppConfig::default();
        cfg.tiling.tile_size = 100;
        assert!(cfg.pipeline_options().is_err());
    }

    #[test]
    fn test_engine_config_resolves_paths_against_data_dir() {
        let mut cfg = AppConfig::default();
        cfg.model.timestep_input = Some("t".to_string());
        cfg.engine.device_id = 1;

        let engine = cfg.engine_config(Path::new("/data"));
        assert_eq!(engine.model_path, PathBuf::from("/data/models/cain.onnx"));
        assert_eq!(engine.trt_cache_dir, Some(PathBuf::from("/data/trt_cache")));
        assert_eq!(engine.device_id, 1);
        assert_eq!(engine.bindings.timestep.as_deref(), Some("t"));
    }

    #[test]
    fn test_load_from_missing_or_empty_file_returns_defaults() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        assert_eq!(
            AppConfig::load_from_path(&path).expect("load missing config"),
            AppConfig::default()
        );

        fs::write(&path, "  \n").expect("write empty config");
        assert_eq!(
            AppConfig::load_from_path(&path).expect("load empty config"),
            AppConfig::default()
        );
    }

    #[test]
    fn test_load_reports_malformed_toml() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "[tiling\nmode = ").expect("write bad config");

        let err = AppConfig::load_from_path(&path).expect_err("malformed config");
        assert!(err.to_string().contains("failed to parse config TOML"));
    }

    #[test]
    fn test_data_dir_prefers_cli_then_env() {
        assert_eq!(data_dir(Some(Path::new("/custom"))), PathBuf::from("/custom"));

        env::set_var(ENV_DATA_DIR, "/env/path");
        let from_env = data_dir(None);
        env::remove_var(ENV_DATA_DIR);
        assert_eq!(from_env, PathBuf::from("/env/path"));

        assert_eq!(data_dir(None), PathBuf::from("data"));
    }

    #[test]
    fn test_initialize_writes_defaults_once() {
        let dir = tempdir().expect("tempdir");
        let data = dir.path().join("data");
        initialize_data_dir(&data).expect("initialize data dir");

        let cfg_path = config_path(&data);
        assert!(cfg_path.exists());
        assert_eq!(
            AppConfig::load_from_path(&cfg_path).expect("load written config"),
            AppConfig::default()
        );

        fs::write(&cfg_path, "[tiling]\nmode = \"auto\"\n").expect("write custom config");
        initialize_data_dir(&data).expect("initialize again");
        let content = fs::read_to_string(&cfg_path).expect("read config");
        assert_eq!(content, "[tiling]\nmode = \"auto\"\n");
    }

    #[test]
    fn test_resolve_relative_to_keeps_absolute_paths() {
        assert_eq!(
            resolve_relative_to(Path::new("/base"), Path::new("/abs/path")),
            PathBuf::from("/abs/path")
        );
        assert_eq!(
            resolve_relative_to(Path::new("/base"), Path::new("sub")),
            PathBuf::from("/base/sub")
        );
    }
}
