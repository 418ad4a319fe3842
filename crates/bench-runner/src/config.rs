use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use thiserror::Error;

use crate::energy::RaplSampler;
use crate::idle::IdleSettings;
use crate::planners::Planner;

/// Optional harness settings, read from the input directory.
pub const CONFIG_FILE_NAME: &str = "bench.yaml";
pub const DEFAULT_TIMEOUT_SECS: u64 = 1800;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{name} must be within (0, 100], got {value}")]
    ThresholdOutOfRange { name: &'static str, value: f64 },
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    planner: Option<Planner>,
    tool_dir: Option<PathBuf>,
    timeout_secs: Option<u64>,
    idle: IdleFileConfig,
    energy: EnergyFileConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct IdleFileConfig {
    cpu_threshold: Option<f64>,
    memory_threshold: Option<f64>,
    poll_interval_secs: Option<f64>,
    sample_window_secs: Option<f64>,
    max_wait_secs: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct EnergyFileConfig {
    socket: Option<u32>,
    powercap_root: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HarnessConfig {
    pub planner: Planner,
    pub tool_dir: PathBuf,
    pub timeout: Duration,
    pub idle: IdleSettings,
    pub socket: u32,
    pub powercap_root: PathBuf,
}

impl HarnessConfig {
    pub fn defaults(tool_dir: PathBuf) -> Self {
        let planner = Planner::default();
        Self {
            planner,
            tool_dir,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            idle: planner.default_idle_settings(),
            socket: 0,
            powercap_root: PathBuf::from(RaplSampler::DEFAULT_POWERCAP_ROOT),
        }
    }

    /// Defaults overlaid with `bench.yaml` from `input_dir`, when present.
    pub fn load(input_dir: &Path, default_tool_dir: PathBuf) -> Result<Self> {
        let path = input_dir.join(CONFIG_FILE_NAME);
        if !path.exists() {
            return Ok(Self::defaults(default_tool_dir));
        }
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_yaml(&raw, input_dir, default_tool_dir)
            .with_context(|| format!("invalid harness config {}", path.display()))
    }

    pub fn from_yaml(raw: &str, input_dir: &Path, default_tool_dir: PathBuf) -> Result<Self> {
        let file: FileConfig = if raw.trim().is_empty() {
            FileConfig::default()
        } else {
            serde_yaml::from_str(raw)?
        };

        let planner = file.planner.unwrap_or_default();
        let mut idle = planner.default_idle_settings();
        if let Some(v) = file.idle.cpu_threshold {
            idle.cpu_threshold = v;
        }
        if let Some(v) = file.idle.memory_threshold {
            idle.memory_threshold = v;
        }
        if let Some(v) = file.idle.poll_interval_secs {
            idle.poll_interval = secs(v)?;
        }
        if let Some(v) = file.idle.sample_window_secs {
            idle.sample_window = secs(v)?;
        }
        if let Some(v) = file.idle.max_wait_secs {
            idle.max_wait = Some(secs(v)?);
        }

        let tool_dir = match file.tool_dir {
            Some(dir) if dir.is_relative() => input_dir.join(dir),
            Some(dir) => dir,
            None => default_tool_dir,
        };

        let config = Self {
            planner,
            tool_dir,
            timeout: Duration::from_secs(file.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS)),
            idle,
            socket: file.energy.socket.unwrap_or(0),
            powercap_root: file
                .energy
                .powercap_root
                .unwrap_or_else(|| PathBuf::from(RaplSampler::DEFAULT_POWERCAP_ROOT)),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("idle.cpu_threshold", self.idle.cpu_threshold),
            ("idle.memory_threshold", self.idle.memory_threshold),
        ] {
            if !(value > 0.0 && value <= 100.0) {
                return Err(ConfigError::ThresholdOutOfRange { name, value });
            }
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("timeout_secs"));
        }
        if self.idle.sample_window.is_zero() {
            return Err(ConfigError::ZeroDuration("idle.sample_window_secs"));
        }
        Ok(())
    }
}

fn secs(value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value)
        .with_context(|| format!("invalid duration: {} seconds", value))
}
