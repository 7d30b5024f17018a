use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::ops::RangeInclusive;
use std::path::Path;

/// Slider range the scale is meant to live in. 1.0 is the reference strength, >1 extrapolates.
pub const TCFG_SCALE_RANGE: RangeInclusive<f32> = 0.0..=2.0;

pub const DEFAULT_CFG_SCALE: f64 = 7.0;

/// What to do when the corrective step itself fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Hand the error to the sampler; the generation fails.
    Propagate,
    /// Log it and keep the uncorrected CFG output for that step.
    #[default]
    Uncorrected,
}

/// Per-request TCFG settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcfgConfig {
    pub enabled: bool,
    pub scale: f32,
    pub on_failure: FailurePolicy,
}

impl Default for TcfgConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            scale: 1.0,
            on_failure: FailurePolicy::default(),
        }
    }
}

impl TcfgConfig {
    /// Whether the hook should be installed at all. `scale == 0` is a no-op, so it is skipped.
    pub fn is_active(&self) -> bool {
        self.enabled && self.scale != 0.0
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.scale.is_finite() {
            bail!("tcfg scale must be finite, got {}", self.scale);
        }
        if !TCFG_SCALE_RANGE.contains(&self.scale) {
            bail!(
                "tcfg scale {} outside [{}, {}]",
                self.scale,
                TCFG_SCALE_RANGE.start(),
                TCFG_SCALE_RANGE.end()
            );
        }
        Ok(())
    }

    /// Key/value pairs recorded next to the other generation parameters.
    pub fn generation_params(&self) -> [(&'static str, Value); 2] {
        [
            ("tcfg_enabled", Value::from(self.enabled)),
            ("tcfg_scale", Value::from(self.scale)),
        ]
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceChoice {
    /// CUDA when requested through `TCFG_USE_GPU` and available, CPU otherwise.
    #[default]
    Auto,
    Cpu,
    Cuda,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub tcfg: TcfgConfig,
    pub cfg_scale: f64,
    pub device: DeviceChoice,
    pub cuda_ordinal: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            tcfg: TcfgConfig::default(),
            cfg_scale: DEFAULT_CFG_SCALE,
            device: DeviceChoice::default(),
            cuda_ordinal: 0,
        }
    }
}

impl Settings {
    /// Reads a TOML settings file. A missing file means defaults.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let content =
            fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_toml_str(&content).with_context(|| format!("loading {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let settings: Self = toml::from_str(content)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.cfg_scale.is_finite() {
            bail!("cfg_scale must be finite, got {}", self.cfg_scale);
        }
        self.tcfg.validate()
    }
}
