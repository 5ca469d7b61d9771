//! Configuration for the propagation tools.
//!
//! Sources, lowest to highest precedence:
//! 1. Built-in defaults
//! 2. The first config file found (see [`ConfigLoader::find_config_files`])
//! 3. `CONVPROP_*` environment variables

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use convprop_api::{ActivationFunction, LayerDimensions};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::backend::HostBackendOptions;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConvPropConfig {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    /// Layer to profile when no geometry is given on the command line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layer: Option<LayerConfig>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendPreference {
    /// wgpu when an adapter is available, otherwise host.
    #[default]
    Auto,
    Wgpu,
    Host,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PowerPreference {
    #[default]
    HighPerformance,
    LowPower,
    None,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default)]
    pub backend: BackendPreference,
    #[serde(default)]
    pub wgpu: WgpuConfig,
    #[serde(default)]
    pub host: HostBackendOptions,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WgpuConfig {
    #[serde(default)]
    pub power_preference: PowerPreference,
    #[serde(default)]
    pub force_fallback_adapter: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_workgroup_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_groups_per_dim: Option<u32>,
}

#[cfg(feature = "wgpu")]
impl WgpuConfig {
    pub fn to_options(&self) -> crate::backend::wgpu::WgpuBackendOptions {
        crate::backend::wgpu::WgpuBackendOptions {
            power_preference: match self.power_preference {
                PowerPreference::HighPerformance => wgpu::PowerPreference::HighPerformance,
                PowerPreference::LowPower => wgpu::PowerPreference::LowPower,
                PowerPreference::None => wgpu::PowerPreference::None,
            },
            force_fallback_adapter: self.force_fallback_adapter,
            max_workgroup_size: self.max_workgroup_size,
            max_groups_per_dim: self.max_groups_per_dim,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Log accumulated stage timings when a tool exits.
    #[serde(default = "default_true")]
    pub dump_on_exit: bool,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dump_on_exit: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerConfig {
    #[serde(flatten)]
    pub dimensions: LayerDimensions,
    #[serde(default = "default_activation")]
    pub activation: ActivationFunction,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_true() -> bool {
    true
}

fn default_activation() -> ActivationFunction {
    ActivationFunction::Tanh
}

fn default_batch_size() -> usize {
    128
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Defaults, then the first config file found, then environment overrides.
    pub fn load() -> Result<ConvPropConfig> {
        let mut config = Self::load_from_files()?;
        Self::apply_environment_variables(&mut config)?;
        Ok(config)
    }

    fn load_from_files() -> Result<ConvPropConfig> {
        for path in Self::find_config_files() {
            if path.is_dir() {
                info!(
                    "Ignoring config directory path (expected file): {}",
                    path.display()
                );
                continue;
            }
            if path.exists() {
                info!("Loading configuration from: {}", path.display());
                return Self::load_from_file(&path);
            }
        }
        debug!("No configuration file found, using defaults");
        Ok(ConvPropConfig::default())
    }

    pub fn find_config_files() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        if let Ok(config_path) = env::var("CONVPROP_CONFIG") {
            paths.push(PathBuf::from(config_path));
        }

        if let Ok(current_dir) = env::current_dir() {
            for name in [
                ".convprop.toml",
                ".convprop.yaml",
                ".convprop.yml",
                ".convprop.json",
                "convprop.config.toml",
                "convprop.config.yaml",
                "convprop.config.yml",
                "convprop.config.json",
            ] {
                paths.push(current_dir.join(name));
            }
        }

        if let Some(home_dir) = dirs::home_dir() {
            for name in ["config.toml", "config.yaml", "config.yml", "config.json"] {
                paths.push(home_dir.join(".config/convprop").join(name));
            }
        }

        paths
    }

    pub fn load_from_file(path: &Path) -> Result<ConvPropConfig> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config = match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse YAML config: {}", path.display()))?,
            Some("json") => serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse JSON config: {}", path.display()))?,
            Some("toml") => toml::from_str(&content)
                .with_context(|| format!("Failed to parse TOML config: {}", path.display()))?,
            _ => {
                if let Ok(config) = toml::from_str(&content) {
                    config
                } else if let Ok(config) = serde_yaml::from_str(&content) {
                    config
                } else {
                    serde_json::from_str(&content).with_context(|| {
                        format!(
                            "Could not parse config file {} (tried TOML, YAML, JSON)",
                            path.display()
                        )
                    })?
                }
            }
        };
        Ok(config)
    }

    pub fn apply_environment_variables(config: &mut ConvPropConfig) -> Result<()> {
        if let Ok(raw) = env::var("CONVPROP_BACKEND") {
            match parse_backend_preference(&raw) {
                Some(backend) => config.device.backend = backend,
                None => {
                    warn!("CONVPROP_BACKEND='{raw}' not recognized (expected auto|wgpu|host)")
                }
            }
        }
        if let Ok(raw) = env::var("CONVPROP_WGPU_POWER") {
            match parse_power_preference(&raw) {
                Some(power) => config.device.wgpu.power_preference = power,
                None => {
                    warn!("CONVPROP_WGPU_POWER='{raw}' not recognized (expected high|low|none)")
                }
            }
        }
        if let Ok(raw) = env::var("CONVPROP_WGPU_FORCE_FALLBACK") {
            if let Some(flag) = parse_bool(&raw) {
                config.device.wgpu.force_fallback_adapter = flag;
            }
        }
        if let Ok(raw) = env::var("CONVPROP_HOST_MAX_WG") {
            let max = raw
                .trim()
                .parse::<usize>()
                .ok()
                .filter(|v| *v > 0)
                .with_context(|| {
                    format!("CONVPROP_HOST_MAX_WG='{raw}' is not a positive integer")
                })?;
            config.device.host.max_workgroup_size = max;
        }
        if let Ok(raw) = env::var("CONVPROP_HOST_THREADS") {
            let threads = raw
                .trim()
                .parse::<usize>()
                .with_context(|| format!("CONVPROP_HOST_THREADS='{raw}' is not an integer"))?;
            config.device.host.num_threads = (threads > 0).then_some(threads);
        }
        if let Ok(raw) = env::var("CONVPROP_TIMING") {
            if let Some(flag) = parse_bool(&raw) {
                config.timing.enabled = flag;
            }
        }
        Ok(())
    }

    pub fn save_to_file(config: &ConvPropConfig, path: &Path) -> Result<()> {
        let content = match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => {
                serde_yaml::to_string(config).context("Failed to serialize config to YAML")?
            }
            Some("json") => serde_json::to_string_pretty(config)
                .context("Failed to serialize config to JSON")?,
            _ => toml::to_string_pretty(config).context("Failed to serialize config to TOML")?,
        };
        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        info!("Configuration saved to: {}", path.display());
        Ok(())
    }

    pub fn generate_sample_config() -> String {
        let config = ConvPropConfig {
            layer: Some(LayerConfig {
                dimensions: LayerDimensions::new(32, 32, 19, 5).pad_zeros(true).biased(true),
                activation: ActivationFunction::Relu,
                batch_size: default_batch_size(),
            }),
            ..ConvPropConfig::default()
        };
        toml::to_string_pretty(&config)
            .unwrap_or_else(|_| "# Failed to generate config".to_string())
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" | "enable" | "enabled" => Some(true),
        "0" | "false" | "no" | "off" | "disable" | "disabled" | "" => Some(false),
        _ => None,
    }
}

pub fn parse_backend_preference(value: &str) -> Option<BackendPreference> {
    match value.trim().to_ascii_lowercase().as_str() {
        "auto" => Some(BackendPreference::Auto),
        "wgpu" | "gpu" => Some(BackendPreference::Wgpu),
        "host" | "cpu" | "inprocess" => Some(BackendPreference::Host),
        _ => None,
    }
}

pub fn parse_power_preference(value: &str) -> Option<PowerPreference> {
    match value.trim().to_ascii_lowercase().as_str() {
        "high" | "high-performance" | "highperformance" => Some(PowerPreference::HighPerformance),
        "low" | "low-power" | "lowpower" => Some(PowerPreference::LowPower),
        "none" => Some(PowerPreference::None),
        _ => None,
    }
}
