//! Runtime configuration.
//!
//! Every section has defaults, so an empty JSON object is a valid file and
//! only overridden keys need to be present.

use crate::safety::MAX_TRACKED_VIOLATIONS;
use crate::thermal::{SensorLayout, ThresholdTable, MAX_SENSORS};
use crate::subsystems::battery::MAX_CELL_GROUPS;
use crate::subsystems::motor::MAX_STATOR_SENSORS;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub tick_period_ms: u64,
    pub driver_timeout_ms: u64,
    pub telemetry_interval_ms: u64,
}

impl SchedulerSettings {
    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(self.tick_period_ms)
    }

    pub fn driver_timeout(&self) -> Duration {
        Duration::from_millis(self.driver_timeout_ms)
    }

    pub fn telemetry_interval(&self) -> Duration {
        Duration::from_millis(self.telemetry_interval_ms)
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick_period_ms: 100,
            driver_timeout_ms: 50,
            telemetry_interval_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StalenessSettings {
    /// Age after which a subsystem without a good snapshot is faulted.
    pub snapshot_ms: u64,
    /// Age after which a temperature reading counts as `Fault`.
    pub temperature_ms: u64,
}

impl Default for StalenessSettings {
    fn default() -> Self {
        Self {
            snapshot_ms: 1_000,
            temperature_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VehicleSettings {
    pub battery_capacity_kwh: f64,
    pub default_efficiency_kwh_per_km: f64,
    pub rpm_to_kmh: f32,
    pub stationary_speed_kmh: f32,
    pub min_drive_soc_percent: f32,
    pub max_regen_current_a: f32,
    pub max_integration_step_ms: u64,
    /// State of charge the time-to-full estimate counts toward.
    pub charge_target_soc_percent: f32,
}

impl Default for VehicleSettings {
    fn default() -> Self {
        Self {
            battery_capacity_kwh: 75.0,
            default_efficiency_kwh_per_km: 0.2,
            rpm_to_kmh: 0.1,
            stationary_speed_kmh: 0.5,
            min_drive_soc_percent: 5.0,
            max_regen_current_a: 50.0,
            max_integration_step_ms: 1_000,
            charge_target_soc_percent: 100.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterlockSettings {
    pub violation_window_ms: u64,
    pub escalation_threshold: usize,
}

impl Default for InterlockSettings {
    fn default() -> Self {
        Self {
            violation_window_ms: 5_000,
            escalation_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub scheduler: SchedulerSettings,
    pub staleness: StalenessSettings,
    pub vehicle: VehicleSettings,
    pub interlock: InterlockSettings,
    pub sensors: SensorLayout,
    pub thresholds: ThresholdTable,
}

impl CoreConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.scheduler;
        if s.tick_period_ms == 0 {
            return Err(ConfigError::Invalid("scheduler.tick_period_ms must be > 0".into()));
        }
        if s.driver_timeout_ms == 0 || s.driver_timeout_ms >= s.tick_period_ms {
            return Err(ConfigError::Invalid(format!(
                "scheduler.driver_timeout_ms ({}) must be in 1..{}",
                s.driver_timeout_ms, s.tick_period_ms
            )));
        }
        if self.vehicle.battery_capacity_kwh <= 0.0 || self.vehicle.default_efficiency_kwh_per_km <= 0.0 {
            return Err(ConfigError::Invalid(
                "vehicle capacity and default efficiency must be positive".into(),
            ));
        }
        if !(0.0..=100.0).contains(&self.vehicle.charge_target_soc_percent) {
            return Err(ConfigError::Invalid(
                "vehicle.charge_target_soc_percent must be in 0..=100".into(),
            ));
        }
        let threshold = self.interlock.escalation_threshold;
        if threshold == 0 || threshold > MAX_TRACKED_VIOLATIONS {
            return Err(ConfigError::Invalid(format!(
                "interlock.escalation_threshold must be in 1..={MAX_TRACKED_VIOLATIONS}"
            )));
        }
        if usize::from(self.sensors.cell_groups) > MAX_CELL_GROUPS
            || usize::from(self.sensors.stator_sensors) > MAX_STATOR_SENSORS
            || self.sensors.expected_count() > MAX_SENSORS
        {
            return Err(ConfigError::Invalid(format!(
                "sensor layout exceeds capacity ({MAX_CELL_GROUPS} cell groups, {MAX_STATOR_SENSORS} stator sensors)"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_object_uses_defaults() {
        let config = CoreConfig::from_json("{}").unwrap();
        assert_eq!(config, CoreConfig::default());
        assert_eq!(config.scheduler.tick_period(), Duration::from_millis(100));
    }

    #[test]
    fn test_partial_override() {
        let config = CoreConfig::from_json(
            r#"{ "scheduler": { "tick_period_ms": 200 }, "sensors": { "cell_groups": 4 } }"#,
        )
        .unwrap();
        assert_eq!(config.scheduler.tick_period_ms, 200);
        assert_eq!(config.scheduler.driver_timeout_ms, 50);
        assert_eq!(config.sensors.cell_groups, 4);
        assert_eq!(config.sensors.stator_sensors, 3);
    }

    #[test]
    fn test_timeout_must_fit_in_period() {
        let result = CoreConfig::from_json(r#"{ "scheduler": { "tick_period_ms": 50, "driver_timeout_ms": 50 } }"#);
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_oversized_layout_rejected() {
        let result = CoreConfig::from_json(r#"{ "sensors": { "cell_groups": 40 } }"#);
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_charge_target_out_of_range_rejected() {
        let result = CoreConfig::from_json(r#"{ "vehicle": { "charge_target_soc_percent": 120 } }"#);
        assert!(matches!(result, Err(ConfigError::Invalid(_))));

        let config = CoreConfig::from_json(r#"{ "vehicle": { "charge_target_soc_percent": 80 } }"#).unwrap();
        assert_eq!(config.vehicle.charge_target_soc_percent, 80.0);
    }

    #[test]
    fn test_parse_error() {
        assert!(matches!(CoreConfig::from_json("{ not json"), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(CoreConfig::load("/nonexistent/evbus.json"), Err(ConfigError::Io { .. })));
    }
}
