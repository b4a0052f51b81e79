use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::dispatcher::Surface;
use crate::energy::EnergyStore;
use crate::multiplier::TapMultiplier;

pub const DEFAULT_API_URL: &str = "http://127.0.0.1:5000";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_url: String,
    pub db_path: PathBuf,
    /// Chat-platform account, when the client runs inside one.
    pub platform_user: Option<PlatformUser>,
    pub tap: TapConfig,
    pub energy: EnergyConfig,
    pub sync: SyncConfig,
    pub tasks: TaskConfig,
    pub surface: Surface,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformUser {
    pub id: String,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TapConfig {
    pub base_points: f64,
    pub reference_interval_ms: f64,
    pub max_multiplier: f64,
    pub energy_cost: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnergyConfig {
    pub max: f64,
    pub regen_per_second: f64,
    pub tick_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub debounce_ms: u64,
    pub request_timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    pub claim_delay_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            db_path: default_db_path(),
            platform_user: None,
            tap: TapConfig::default(),
            energy: EnergyConfig::default(),
            sync: SyncConfig::default(),
            tasks: TaskConfig::default(),
            surface: Surface::default(),
        }
    }
}

impl Default for TapConfig {
    fn default() -> Self {
        let m = TapMultiplier::default();
        Self {
            base_points: m.base_points,
            reference_interval_ms: m.reference_interval_ms,
            max_multiplier: m.max_multiplier,
            energy_cost: 10.0,
        }
    }
}

impl Default for EnergyConfig {
    fn default() -> Self {
        Self {
            max: 1000.0,
            regen_per_second: 1.0,
            tick_ms: 1000,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 1000,
            request_timeout_ms: 10_000,
        }
    }
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            claim_delay_ms: 10_000,
        }
    }
}

impl TapConfig {
    pub fn multiplier(&self) -> TapMultiplier {
        TapMultiplier {
            reference_interval_ms: self.reference_interval_ms,
            max_multiplier: self.max_multiplier,
            base_points: self.base_points,
        }
    }
}

impl EnergyConfig {
    pub fn store(&self) -> EnergyStore {
        EnergyStore::new(self.max, self.regen_per_second)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }
}

impl SyncConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms.max(1))
    }
}

impl TaskConfig {
    pub fn claim_delay(&self) -> Duration {
        Duration::from_millis(self.claim_delay_ms)
    }
}

impl Config {
    pub fn from_yaml_str(raw: &str) -> anyhow::Result<Self> {
        let cfg: Config = serde_yaml::from_str(raw).context("parse config yaml")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config: {}", path.display()))?;
        Self::from_yaml_str(&raw).with_context(|| format!("load config: {}", path.display()))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.api_url.trim().is_empty(), "api_url must not be empty");
        anyhow::ensure!(self.tap.base_points >= 0.0, "tap.base_points must be >= 0");
        anyhow::ensure!(
            self.tap.reference_interval_ms > 0.0,
            "tap.reference_interval_ms must be > 0"
        );
        anyhow::ensure!(self.tap.max_multiplier >= 1.0, "tap.max_multiplier must be >= 1");
        anyhow::ensure!(self.tap.energy_cost >= 0.0, "tap.energy_cost must be >= 0");
        anyhow::ensure!(self.energy.max > 0.0, "energy.max must be > 0");
        anyhow::ensure!(
            self.energy.regen_per_second >= 0.0,
            "energy.regen_per_second must be >= 0"
        );
        anyhow::ensure!(
            self.surface.width > 0.0 && self.surface.height > 0.0,
            "surface must have a positive size"
        );
        Ok(())
    }
}

pub fn default_db_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".crowntap")
        .join("crowntap.db")
}
