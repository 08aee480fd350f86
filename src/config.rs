use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, Local, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::TwinError;
use crate::logging::LogConfig;
use crate::risk::RiskRule;

/// Main simulator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    /// Milliseconds between ticks
    pub tick_interval_ms: u64,

    /// Buffered events per subscriber before the slowest one starts lagging
    pub event_channel_capacity: usize,

    /// Fixed RNG seed for reproducible runs (None = entropy)
    pub seed: Option<u64>,

    /// Physiological model coefficients
    pub model: ModelConfig,

    /// Sleep/wake window gating
    pub sleep: SleepConfig,

    /// Risk rules evaluated every tick
    pub risk_rules: Vec<RiskRule>,

    /// Logging settings
    pub logging: LogConfig,
}

/// Coefficients of the physiological model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Chance per tick of switching to a different activity
    pub activity_change_probability: f64,

    /// Fraction of the distance to the target heart rate covered per tick
    pub heart_rate_approach: f64,

    /// Symmetric heart rate noise in bpm
    pub heart_rate_noise: f64,

    /// Target heart rate added at stress 100
    pub stress_heart_rate_gain: f64,

    /// Chance per tick of a transient heart rate spike
    pub spike_probability: f64,

    /// Spike size range in bpm
    pub spike_range: (f64, f64),

    /// Fraction of the stress pressure applied per tick
    pub stress_approach: f64,

    /// Symmetric stress noise
    pub stress_noise: f64,

    /// Extra stress relief while asleep
    pub sleeping_stress_relief: f64,

    /// Symmetric HRV noise
    pub hrv_noise: f64,

    /// Symmetric recovery score noise
    pub recovery_noise: f64,

    /// Chance per tick of a drink
    pub hydration_event_probability: f64,

    /// Hydration gained per drink
    pub hydration_gain: (f64, f64),

    /// Body mass used for calorie expenditure
    pub body_mass_kg: f64,
}

/// Inclusive range of local clock hours
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HourWindow {
    pub start: u32,
    pub end: u32,
}

impl HourWindow {
    pub const fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    /// Whether `hour` falls in the window; windows may wrap past midnight
    pub fn contains(&self, hour: u32) -> bool {
        if self.start <= self.end {
            hour >= self.start && hour <= self.end
        } else {
            hour >= self.start || hour <= self.end
        }
    }
}

/// Sleep/wake transition settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SleepConfig {
    /// Hours in which falling asleep is possible
    pub evening_window: HourWindow,

    /// Hours in which waking up is possible
    pub morning_window: HourWindow,

    /// Chance per tick of a transition inside the window
    pub transition_probability: f64,

    /// Clock offset from UTC in minutes (None = system local time)
    pub utc_offset_minutes: Option<i32>,
}

impl SleepConfig {
    /// Local clock hour used for window gating
    pub fn local_hour(&self, now: DateTime<Utc>) -> u32 {
        match self.utc_offset_minutes.and_then(|m| FixedOffset::east_opt(m * 60)) {
            Some(offset) => now.with_timezone(&offset).hour(),
            None => now.with_timezone(&Local).hour(),
        }
    }
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        SimulatorConfig {
            tick_interval_ms: 1000,
            event_channel_capacity: 256,
            seed: None,
            model: ModelConfig::default(),
            sleep: SleepConfig::default(),
            risk_rules: RiskRule::default_rules(),
            logging: LogConfig::default(),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        ModelConfig {
            activity_change_probability: 0.1,
            heart_rate_approach: 0.2,
            heart_rate_noise: 5.0,
            stress_heart_rate_gain: 20.0,
            spike_probability: 0.05,
            spike_range: (20.0, 40.0),
            stress_approach: 0.1,
            stress_noise: 5.0,
            sleeping_stress_relief: 10.0,
            hrv_noise: 5.0,
            recovery_noise: 5.0,
            hydration_event_probability: 0.1,
            hydration_gain: (5.0, 15.0),
            body_mass_kg: 70.0,
        }
    }
}

impl Default for SleepConfig {
    fn default() -> Self {
        SleepConfig {
            evening_window: HourWindow::new(21, 23),
            morning_window: HourWindow::new(6, 8),
            transition_probability: 0.3,
            utc_offset_minutes: None,
        }
    }
}

/// Configuration management implementation
impl SimulatorConfig {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: SimulatorConfig = toml::from_str(&content)
            .with_context(|| "Failed to parse TOML configuration")?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
        }

        fs::write(&path, self.to_toml()?)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        Ok(())
    }

    /// Render as pretty TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).with_context(|| "Failed to serialize configuration to TOML")
    }

    /// Get default configuration file path
    pub fn default_config_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".twinrs")
            .join("config.toml")
    }

    /// Load configuration with fallback to defaults
    pub fn load_or_default() -> Self {
        let config_path = Self::default_config_path();

        match Self::load_from_file(&config_path) {
            Ok(config) => config,
            Err(e) => {
                tracing::debug!(path = %config_path.display(), error = %e, "Using default configuration");
                Self::default()
            }
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.tick_interval_ms == 0 {
            return Err(TwinError::Configuration("tick_interval_ms must be positive".into()));
        }
        if self.event_channel_capacity == 0 {
            return Err(TwinError::Configuration(
                "event_channel_capacity must be positive".into(),
            ));
        }

        let m = &self.model;
        for (name, p) in [
            ("activity_change_probability", m.activity_change_probability),
            ("spike_probability", m.spike_probability),
            ("hydration_event_probability", m.hydration_event_probability),
            ("sleep.transition_probability", self.sleep.transition_probability),
            ("heart_rate_approach", m.heart_rate_approach),
            ("stress_approach", m.stress_approach),
        ] {
            if !(0.0..=1.0).contains(&p) {
                return Err(TwinError::Configuration(format!(
                    "{} must be within [0, 1], got {}",
                    name, p
                )));
            }
        }
        for (name, value) in [
            ("heart_rate_noise", m.heart_rate_noise),
            ("stress_noise", m.stress_noise),
            ("hrv_noise", m.hrv_noise),
            ("recovery_noise", m.recovery_noise),
            ("stress_heart_rate_gain", m.stress_heart_rate_gain),
            ("sleeping_stress_relief", m.sleeping_stress_relief),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(TwinError::Configuration(format!(
                    "{} must be a finite non-negative number, got {}",
                    name, value
                )));
            }
        }
        for (name, (lo, hi)) in [("spike_range", m.spike_range), ("hydration_gain", m.hydration_gain)] {
            if !(lo.is_finite() && hi.is_finite()) || lo > hi {
                return Err(TwinError::Configuration(format!(
                    "{} must be an ordered finite range, got [{}, {}]",
                    name, lo, hi
                )));
            }
        }
        if !m.body_mass_kg.is_finite() || m.body_mass_kg <= 0.0 {
            return Err(TwinError::Configuration("body_mass_kg must be positive".into()));
        }
        for window in [self.sleep.evening_window, self.sleep.morning_window] {
            if window.start > 23 || window.end > 23 {
                return Err(TwinError::Configuration(format!(
                    "sleep window hours must be 0-23, got {}-{}",
                    window.start, window.end
                )));
            }
        }
        Ok(())
    }
}
