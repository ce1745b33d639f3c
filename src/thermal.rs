//! Temperature fault aggregation.
//!
//! Every sensor is classified against a declarative threshold table keyed by
//! [`SensorKind`]. Readings that are missing or older than the staleness
//! window count as [`TemperatureStatus::Fault`]: a silent sensor is never
//! treated as a healthy one. Each subsystem then gets the worst status of the
//! sensors that belong to it.

use crate::protocol::ids;
use crate::subsystems::SubsystemId;
use core::fmt;
use heapless::{FnvIndexMap, Vec};
use serde::{Deserialize, Serialize};

/// Upper bound on sensors carried in one aggregation pass.
pub const MAX_SENSORS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SensorKind {
    BatteryCellGroup,
    CoolantInlet,
    CoolantOutlet,
    MotorStator,
    ChargingPort,
    ChargingConnector,
}

impl SensorKind {
    pub const ALL: [SensorKind; 6] = [
        SensorKind::BatteryCellGroup,
        SensorKind::CoolantInlet,
        SensorKind::CoolantOutlet,
        SensorKind::MotorStator,
        SensorKind::ChargingPort,
        SensorKind::ChargingConnector,
    ];

    pub const fn subsystem(self) -> SubsystemId {
        match self {
            SensorKind::BatteryCellGroup | SensorKind::CoolantInlet | SensorKind::CoolantOutlet => {
                SubsystemId::Battery
            }
            SensorKind::MotorStator => SubsystemId::Motor,
            SensorKind::ChargingPort | SensorKind::ChargingConnector => SubsystemId::Charging,
        }
    }

    /// Identifier of this kind's frame in the temperature block.
    pub const fn frame_id(self) -> u16 {
        match self {
            SensorKind::BatteryCellGroup => ids::TEMP_CELL_GROUP,
            SensorKind::CoolantInlet => ids::TEMP_COOLANT_INLET,
            SensorKind::CoolantOutlet => ids::TEMP_COOLANT_OUTLET,
            SensorKind::MotorStator => ids::TEMP_MOTOR_STATOR,
            SensorKind::ChargingPort => ids::TEMP_CHARGING_PORT,
            SensorKind::ChargingConnector => ids::TEMP_CHARGING_CONNECTOR,
        }
    }

    pub const fn from_frame_id(id: u16) -> Option<Self> {
        match id {
            ids::TEMP_CELL_GROUP => Some(SensorKind::BatteryCellGroup),
            ids::TEMP_COOLANT_INLET => Some(SensorKind::CoolantInlet),
            ids::TEMP_COOLANT_OUTLET => Some(SensorKind::CoolantOutlet),
            ids::TEMP_MOTOR_STATOR => Some(SensorKind::MotorStator),
            ids::TEMP_CHARGING_PORT => Some(SensorKind::ChargingPort),
            ids::TEMP_CHARGING_CONNECTOR => Some(SensorKind::ChargingConnector),
            _ => None,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            SensorKind::BatteryCellGroup => "cell_group",
            SensorKind::CoolantInlet => "coolant_inlet",
            SensorKind::CoolantOutlet => "coolant_outlet",
            SensorKind::MotorStator => "motor_stator",
            SensorKind::ChargingPort => "charging_port",
            SensorKind::ChargingConnector => "charging_connector",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SensorRole {
    pub kind: SensorKind,
    pub index: u8,
}

impl SensorRole {
    pub const fn new(kind: SensorKind, index: u8) -> Self {
        Self { kind, index }
    }

    pub const fn cell_group(index: u8) -> Self {
        Self::new(SensorKind::BatteryCellGroup, index)
    }

    pub const fn stator(phase: u8) -> Self {
        Self::new(SensorKind::MotorStator, phase)
    }
}

impl fmt::Display for SensorRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.kind.name(), self.index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RawReading {
    pub value_c: f32,
    pub timestamp_ms: u64,
}

pub type ReadingMap = FnvIndexMap<SensorRole, RawReading, MAX_SENSORS>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TemperatureStatus {
    Normal = 0,
    Warning = 1,
    Fault = 2,
}

impl TemperatureStatus {
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(TemperatureStatus::Normal),
            1 => Some(TemperatureStatus::Warning),
            2 => Some(TemperatureStatus::Fault),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub warning_low: f32,
    pub warning_high: f32,
    pub fault_low: f32,
    pub fault_high: f32,
}

impl Thresholds {
    pub const fn new(warning_low: f32, warning_high: f32, fault_low: f32, fault_high: f32) -> Self {
        Self { warning_low, warning_high, fault_low, fault_high }
    }

    pub fn classify(&self, value_c: f32) -> TemperatureStatus {
        if value_c.is_nan() || value_c < self.fault_low || value_c > self.fault_high {
            TemperatureStatus::Fault
        } else if value_c < self.warning_low || value_c > self.warning_high {
            TemperatureStatus::Warning
        } else {
            TemperatureStatus::Normal
        }
    }
}

/// Threshold pairs per sensor class. Coolant inlet/outlet share one entry,
/// as do charging port and connector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdTable {
    pub battery_cell_group: Thresholds,
    pub coolant: Thresholds,
    pub motor_stator: Thresholds,
    pub charging: Thresholds,
}

impl ThresholdTable {
    pub fn for_kind(&self, kind: SensorKind) -> &Thresholds {
        match kind {
            SensorKind::BatteryCellGroup => &self.battery_cell_group,
            SensorKind::CoolantInlet | SensorKind::CoolantOutlet => &self.coolant,
            SensorKind::MotorStator => &self.motor_stator,
            SensorKind::ChargingPort | SensorKind::ChargingConnector => &self.charging,
        }
    }
}

impl Default for ThresholdTable {
    fn default() -> Self {
        Self {
            battery_cell_group: Thresholds::new(5.0, 40.0, -10.0, 50.0),
            coolant: Thresholds::new(0.0, 60.0, -30.0, 90.0),
            motor_stator: Thresholds::new(0.0, 80.0, -30.0, 150.0),
            charging: Thresholds::new(0.0, 60.0, -30.0, 100.0),
        }
    }
}

/// The sensors the vehicle is expected to report. A role listed here that
/// has no reading is a fault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorLayout {
    pub cell_groups: u8,
    pub stator_sensors: u8,
    pub coolant: bool,
    pub charging: bool,
}

impl SensorLayout {
    pub fn expected_count(&self) -> usize {
        usize::from(self.cell_groups)
            + usize::from(self.stator_sensors)
            + if self.coolant { 2 } else { 0 }
            + if self.charging { 2 } else { 0 }
    }

    pub fn expects(&self, role: &SensorRole) -> bool {
        match role.kind {
            SensorKind::BatteryCellGroup => role.index < self.cell_groups,
            SensorKind::MotorStator => role.index < self.stator_sensors,
            SensorKind::CoolantInlet | SensorKind::CoolantOutlet => self.coolant && role.index == 0,
            SensorKind::ChargingPort | SensorKind::ChargingConnector => self.charging && role.index == 0,
        }
    }

    /// Expected roles, truncated at [`MAX_SENSORS`].
    pub fn expected_roles(&self) -> Vec<SensorRole, MAX_SENSORS> {
        let mut roles = Vec::new();
        let cell_groups = (0..self.cell_groups).map(SensorRole::cell_group);
        let stators = (0..self.stator_sensors).map(SensorRole::stator);
        let coolant = [SensorKind::CoolantInlet, SensorKind::CoolantOutlet]
            .into_iter()
            .filter(|_| self.coolant)
            .map(|kind| SensorRole::new(kind, 0));
        let charging = [SensorKind::ChargingPort, SensorKind::ChargingConnector]
            .into_iter()
            .filter(|_| self.charging)
            .map(|kind| SensorRole::new(kind, 0));

        for role in cell_groups.chain(coolant).chain(stators).chain(charging) {
            if roles.push(role).is_err() {
                break;
            }
        }
        roles
    }
}

impl Default for SensorLayout {
    fn default() -> Self {
        Self {
            cell_groups: 8, // 96 cells in groups of 12
            stator_sensors: 3,
            coolant: true,
            charging: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TemperatureReading {
    pub role: SensorRole,
    pub value_c: Option<f32>,
    pub timestamp_ms: Option<u64>,
    pub status: TemperatureStatus,
    /// Missing, or older than the staleness window.
    pub stale: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThermalReport {
    pub readings: Vec<TemperatureReading, MAX_SENSORS>,
    pub battery: TemperatureStatus,
    pub motor: TemperatureStatus,
    pub charging: TemperatureStatus,
    pub faulted_sensors: u8,
}

impl ThermalReport {
    pub fn status(&self, subsystem: SubsystemId) -> TemperatureStatus {
        match subsystem {
            SubsystemId::Battery => self.battery,
            SubsystemId::Motor => self.motor,
            SubsystemId::Charging => self.charging,
        }
    }

    pub fn fault(&self, subsystem: SubsystemId) -> bool {
        self.status(subsystem) == TemperatureStatus::Fault
    }

    pub fn reading(&self, role: SensorRole) -> Option<&TemperatureReading> {
        self.readings.iter().find(|r| r.role == role)
    }

    fn include(&mut self, reading: TemperatureReading) {
        let slot = match reading.role.kind.subsystem() {
            SubsystemId::Battery => &mut self.battery,
            SubsystemId::Motor => &mut self.motor,
            SubsystemId::Charging => &mut self.charging,
        };
        *slot = (*slot).max(reading.status);
        if reading.status == TemperatureStatus::Fault {
            self.faulted_sensors = self.faulted_sensors.saturating_add(1);
        }
        // Status above is already folded in, so overflow only loses detail.
        let _ = self.readings.push(reading);
    }
}

impl Default for ThermalReport {
    fn default() -> Self {
        Self {
            readings: Vec::new(),
            battery: TemperatureStatus::Normal,
            motor: TemperatureStatus::Normal,
            charging: TemperatureStatus::Normal,
            faulted_sensors: 0,
        }
    }
}

fn classify(
    role: SensorRole,
    raw: &RawReading,
    thresholds: &ThresholdTable,
    staleness_ms: u64,
    now_ms: u64,
) -> TemperatureReading {
    let stale = now_ms.saturating_sub(raw.timestamp_ms) > staleness_ms;
    let status = if stale {
        TemperatureStatus::Fault
    } else {
        thresholds.for_kind(role.kind).classify(raw.value_c)
    };
    TemperatureReading {
        role,
        value_c: Some(raw.value_c),
        timestamp_ms: Some(raw.timestamp_ms),
        status,
        stale,
    }
}

/// Classify every expected and every reported sensor.
///
/// Pure function of its inputs. Expected sensors come first in layout order,
/// followed by any extra reported roles in map order.
pub fn aggregate(
    readings: &ReadingMap,
    layout: &SensorLayout,
    thresholds: &ThresholdTable,
    staleness_ms: u64,
    now_ms: u64,
) -> ThermalReport {
    let mut report = ThermalReport::default();

    for role in layout.expected_roles() {
        let reading = match readings.get(&role) {
            Some(raw) => classify(role, raw, thresholds, staleness_ms, now_ms),
            None => TemperatureReading {
                role,
                value_c: None,
                timestamp_ms: None,
                status: TemperatureStatus::Fault,
                stale: true,
            },
        };
        report.include(reading);
    }

    for (role, raw) in readings {
        if !layout.expects(role) {
            report.include(classify(*role, raw, thresholds, staleness_ms, now_ms));
        }
    }

    report
}

/// [`aggregate`] with its configuration bundled.
#[derive(Debug, Clone)]
pub struct TemperatureAggregator {
    layout: SensorLayout,
    thresholds: ThresholdTable,
    staleness_ms: u64,
}

impl TemperatureAggregator {
    pub fn new(layout: SensorLayout, thresholds: ThresholdTable, staleness_ms: u64) -> Self {
        Self { layout, thresholds, staleness_ms }
    }

    pub fn evaluate(&self, readings: &ReadingMap, now_ms: u64) -> ThermalReport {
        aggregate(readings, &self.layout, &self.thresholds, self.staleness_ms, now_ms)
    }

    pub fn layout(&self) -> &SensorLayout {
        &self.layout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_boundaries_are_inclusive_of_normal() {
        let t = Thresholds::new(0.0, 60.0, -30.0, 90.0);
        assert_eq!(t.classify(60.0), TemperatureStatus::Normal);
        assert_eq!(t.classify(60.5), TemperatureStatus::Warning);
        assert_eq!(t.classify(90.0), TemperatureStatus::Warning);
        assert_eq!(t.classify(90.1), TemperatureStatus::Fault);
        assert_eq!(t.classify(-5.0), TemperatureStatus::Warning);
        assert_eq!(t.classify(-31.0), TemperatureStatus::Fault);
        assert_eq!(t.classify(f32::NAN), TemperatureStatus::Fault);
    }

    #[test]
    fn test_default_layout_roles() {
        let layout = SensorLayout::default();
        let roles = layout.expected_roles();
        assert_eq!(roles.len(), 15);
        assert_eq!(layout.expected_count(), 15);
        assert!(roles.contains(&SensorRole::cell_group(7)));
        assert!(!roles.contains(&SensorRole::cell_group(8)));
        assert!(roles.contains(&SensorRole::stator(2)));
    }

    #[test]
    fn test_status_ordering() {
        assert!(TemperatureStatus::Fault > TemperatureStatus::Warning);
        assert!(TemperatureStatus::Warning > TemperatureStatus::Normal);
    }
}
