//! Bus protocol codec.
//!
//! Owns the identifier table and every payload layout. Core frames are
//! little-endian; the VESC block follows the controller's big-endian
//! convention. Encoding never fails: out-of-range values saturate to the
//! field's documented bound, the field name is reported in [`Encoded`], and
//! frames with a flags byte also carry [`FLAG_SATURATED`] on the wire.

use crate::energy::EnergyLedger;
use crate::safety::FaultFlags;
use crate::subsystems::{BatterySnapshot, ChargingSnapshot, ConnectorType, MotorCommand, MotorSnapshot};
use crate::thermal::{SensorKind, SensorRole, TemperatureReading, TemperatureStatus, ThermalReport, MAX_SENSORS};
use crate::vehicle::{ControlRequest, DriveMode, VehicleCommand, VehicleState, VehicleStateMachine};
use arrayvec::ArrayVec;
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use core::fmt;
use heapless::Vec;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;
use thiserror::Error;
use tracing::{debug, warn};

pub const MAX_PAYLOAD: usize = 8;
pub const MAX_FRAMES_PER_TICK: usize = 8 + MAX_SENSORS;
const MAX_SATURATED_FIELDS: usize = 8;

/// Registered identifiers.
pub mod ids {
    // Subsystem status block
    pub const BATTERY_STATUS: u16 = 0x183;
    pub const MOTOR_STATUS: u16 = 0x203;
    pub const CHARGER_STATUS: u16 = 0x280;

    // Vehicle block
    pub const VEHICLE_STATUS: u16 = 0x303;
    pub const ENERGY_STATUS: u16 = 0x304;
    pub const VEHICLE_COMMAND: u16 = 0x310;

    // Temperature block: seven contiguous identifiers
    pub const TEMPERATURE_BLOCK_START: u16 = 0x400;
    pub const TEMPERATURE_BLOCK_LEN: u16 = 7;
    pub const TEMP_CELL_GROUP: u16 = 0x400;
    pub const TEMP_COOLANT_INLET: u16 = 0x401;
    pub const TEMP_COOLANT_OUTLET: u16 = 0x402;
    pub const TEMP_MOTOR_STATOR: u16 = 0x403;
    pub const TEMP_CHARGING_PORT: u16 = 0x404;
    pub const TEMP_CHARGING_CONNECTOR: u16 = 0x405;
    pub const TEMP_SUMMARY: u16 = 0x406;

    // VESC motor-controller block
    pub const VESC_SET_DUTY: u16 = 0x500;
    pub const VESC_SET_CURRENT: u16 = 0x501;
    pub const VESC_SET_CURRENT_BRAKE: u16 = 0x502;
    pub const VESC_SET_RPM: u16 = 0x503;
    pub const VESC_STATUS: u16 = 0x509;
}

const BATTERY_STATUS_LEN: usize = 8;
const MOTOR_STATUS_LEN: usize = 8;
const CHARGER_STATUS_LEN: usize = 6;
const VEHICLE_STATUS_LEN: usize = 8;
const ENERGY_STATUS_LEN: usize = 8;
const VEHICLE_COMMAND_LEN: usize = 4;
const TEMPERATURE_LEN: usize = 5;
const TEMP_SUMMARY_LEN: usize = 4;
const VESC_SETPOINT_LEN: usize = 4;
const VESC_STATUS_LEN: usize = 8;

const_assert!(BATTERY_STATUS_LEN <= MAX_PAYLOAD);
const_assert!(MOTOR_STATUS_LEN <= MAX_PAYLOAD);
const_assert!(CHARGER_STATUS_LEN <= MAX_PAYLOAD);
const_assert!(VEHICLE_STATUS_LEN <= MAX_PAYLOAD);
const_assert!(ENERGY_STATUS_LEN <= MAX_PAYLOAD);
const_assert!(VEHICLE_COMMAND_LEN <= MAX_PAYLOAD);
const_assert!(TEMPERATURE_LEN <= MAX_PAYLOAD);
const_assert!(TEMP_SUMMARY_LEN <= MAX_PAYLOAD);
const_assert!(VESC_SETPOINT_LEN <= MAX_PAYLOAD);
const_assert!(VESC_STATUS_LEN <= MAX_PAYLOAD);
const_assert!(ids::TEMP_SUMMARY == ids::TEMPERATURE_BLOCK_START + ids::TEMPERATURE_BLOCK_LEN - 1);

/// Set in any flags byte when at least one field was clamped.
pub const FLAG_SATURATED: u8 = 0x80;

const FLAG_FAULT: u8 = 0x01;
const FLAG_STALE: u8 = 0x02;

const CHARGER_CONNECTED: u8 = 0x01;
const CHARGER_ACTIVE: u8 = 0x02;
const CHARGER_COMPLETE: u8 = 0x04;
const CHARGER_FAULT: u8 = 0x08;
const CHARGER_STALE: u8 = 0x10;

const VEHICLE_MOTOR_ENABLE: u8 = 0x01;
const VEHICLE_CHARGING_ENABLE: u8 = 0x02;
const VEHICLE_BATTERY_FAULT: u8 = 0x04;
const VEHICLE_MOTOR_FAULT: u8 = 0x08;
const VEHICLE_CHARGING_FAULT: u8 = 0x10;
const VEHICLE_COMMAND_REJECTED: u8 = 0x20;

const TEMP_STALE: u8 = 0x01;
const TEMP_MISSING: u8 = 0x02;

/// Drive-mode byte meaning "keep the current mode".
const NO_DRIVE_MODE: u8 = 0xFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("unknown identifier 0x{0:03X}")]
    UnknownIdentifier(u16),
    #[error("malformed frame 0x{id:03X}: expected {expected} bytes, got {actual}")]
    MalformedFrame { id: u16, expected: usize, actual: usize },
    #[error("frame 0x{id:03X}: invalid {field} value {value}")]
    InvalidField { id: u16, field: &'static str, value: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameKind {
    BatteryStatus,
    MotorStatus,
    ChargerStatus,
    VehicleStatus,
    EnergyStatus,
    VehicleCommand,
    Temperature(SensorKind),
    TemperatureSummary,
    VescSetDuty,
    VescSetCurrent,
    VescSetCurrentBrake,
    VescSetRpm,
    VescStatus,
}

impl FrameKind {
    pub const ALL: [FrameKind; 18] = [
        FrameKind::BatteryStatus,
        FrameKind::MotorStatus,
        FrameKind::ChargerStatus,
        FrameKind::VehicleStatus,
        FrameKind::EnergyStatus,
        FrameKind::VehicleCommand,
        FrameKind::Temperature(SensorKind::BatteryCellGroup),
        FrameKind::Temperature(SensorKind::CoolantInlet),
        FrameKind::Temperature(SensorKind::CoolantOutlet),
        FrameKind::Temperature(SensorKind::MotorStator),
        FrameKind::Temperature(SensorKind::ChargingPort),
        FrameKind::Temperature(SensorKind::ChargingConnector),
        FrameKind::TemperatureSummary,
        FrameKind::VescSetDuty,
        FrameKind::VescSetCurrent,
        FrameKind::VescSetCurrentBrake,
        FrameKind::VescSetRpm,
        FrameKind::VescStatus,
    ];

    pub const fn id(self) -> u16 {
        match self {
            FrameKind::BatteryStatus => ids::BATTERY_STATUS,
            FrameKind::MotorStatus => ids::MOTOR_STATUS,
            FrameKind::ChargerStatus => ids::CHARGER_STATUS,
            FrameKind::VehicleStatus => ids::VEHICLE_STATUS,
            FrameKind::EnergyStatus => ids::ENERGY_STATUS,
            FrameKind::VehicleCommand => ids::VEHICLE_COMMAND,
            FrameKind::Temperature(kind) => kind.frame_id(),
            FrameKind::TemperatureSummary => ids::TEMP_SUMMARY,
            FrameKind::VescSetDuty => ids::VESC_SET_DUTY,
            FrameKind::VescSetCurrent => ids::VESC_SET_CURRENT,
            FrameKind::VescSetCurrentBrake => ids::VESC_SET_CURRENT_BRAKE,
            FrameKind::VescSetRpm => ids::VESC_SET_RPM,
            FrameKind::VescStatus => ids::VESC_STATUS,
        }
    }

    pub const fn payload_len(self) -> usize {
        match self {
            FrameKind::BatteryStatus => BATTERY_STATUS_LEN,
            FrameKind::MotorStatus => MOTOR_STATUS_LEN,
            FrameKind::ChargerStatus => CHARGER_STATUS_LEN,
            FrameKind::VehicleStatus => VEHICLE_STATUS_LEN,
            FrameKind::EnergyStatus => ENERGY_STATUS_LEN,
            FrameKind::VehicleCommand => VEHICLE_COMMAND_LEN,
            FrameKind::Temperature(_) => TEMPERATURE_LEN,
            FrameKind::TemperatureSummary => TEMP_SUMMARY_LEN,
            FrameKind::VescSetDuty
            | FrameKind::VescSetCurrent
            | FrameKind::VescSetCurrentBrake
            | FrameKind::VescSetRpm => VESC_SETPOINT_LEN,
            FrameKind::VescStatus => VESC_STATUS_LEN,
        }
    }

    pub fn from_id(id: u16) -> Option<Self> {
        match id {
            ids::BATTERY_STATUS => Some(FrameKind::BatteryStatus),
            ids::MOTOR_STATUS => Some(FrameKind::MotorStatus),
            ids::CHARGER_STATUS => Some(FrameKind::ChargerStatus),
            ids::VEHICLE_STATUS => Some(FrameKind::VehicleStatus),
            ids::ENERGY_STATUS => Some(FrameKind::EnergyStatus),
            ids::VEHICLE_COMMAND => Some(FrameKind::VehicleCommand),
            ids::TEMP_SUMMARY => Some(FrameKind::TemperatureSummary),
            ids::VESC_SET_DUTY => Some(FrameKind::VescSetDuty),
            ids::VESC_SET_CURRENT => Some(FrameKind::VescSetCurrent),
            ids::VESC_SET_CURRENT_BRAKE => Some(FrameKind::VescSetCurrentBrake),
            ids::VESC_SET_RPM => Some(FrameKind::VescSetRpm),
            ids::VESC_STATUS => Some(FrameKind::VescStatus),
            _ => SensorKind::from_frame_id(id).map(FrameKind::Temperature),
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            FrameKind::BatteryStatus => "battery_status",
            FrameKind::MotorStatus => "motor_status",
            FrameKind::ChargerStatus => "charger_status",
            FrameKind::VehicleStatus => "vehicle_status",
            FrameKind::EnergyStatus => "energy_status",
            FrameKind::VehicleCommand => "vehicle_command",
            FrameKind::Temperature(kind) => kind.name(),
            FrameKind::TemperatureSummary => "temperature_summary",
            FrameKind::VescSetDuty => "vesc_set_duty",
            FrameKind::VescSetCurrent => "vesc_set_current",
            FrameKind::VescSetCurrentBrake => "vesc_set_current_brake",
            FrameKind::VescSetRpm => "vesc_set_rpm",
            FrameKind::VescStatus => "vesc_status",
        }
    }
}

/// Identifier plus up to eight payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub id: u16,
    data: ArrayVec<u8, MAX_PAYLOAD>,
}

impl Frame {
    pub fn new(id: u16, payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut data = ArrayVec::new();
        data.try_extend_from_slice(payload).map_err(|_| ProtocolError::MalformedFrame {
            id,
            expected: MAX_PAYLOAD,
            actual: payload.len(),
        })?;
        Ok(Self { id, data })
    }

    fn from_buffer(kind: FrameKind, buf: [u8; MAX_PAYLOAD]) -> Self {
        let mut data = ArrayVec::from(buf);
        data.truncate(kind.payload_len());
        Self { id: kind.id(), data }
    }

    pub fn payload(&self) -> &[u8] {
        &self.data
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:03X} [{}]", self.id, self.data.len())?;
        for byte in &self.data {
            write!(f, " {byte:02X}")?;
        }
        Ok(())
    }
}

/// Result of encoding: the frame plus the names of any clamped fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Encoded {
    pub frame: Frame,
    pub saturated: Vec<&'static str, MAX_SATURATED_FIELDS>,
}

impl Encoded {
    pub fn is_saturated(&self) -> bool {
        !self.saturated.is_empty()
    }
}

/// Fixed-point quantizer that remembers which fields it clamped.
#[derive(Debug, Default)]
struct Packer {
    saturated: Vec<&'static str, MAX_SATURATED_FIELDS>,
}

impl Packer {
    fn quantize(&mut self, field: &'static str, value: f64, scale: f64, min: i64, max: i64) -> i64 {
        let raw = (value * scale).round();
        if raw.is_nan() {
            self.flag(field);
            0_i64.clamp(min, max)
        } else if raw < min as f64 {
            self.flag(field);
            min
        } else if raw > max as f64 {
            self.flag(field);
            max
        } else {
            raw as i64
        }
    }

    fn flag(&mut self, field: &'static str) {
        if !self.saturated.contains(&field) {
            let _ = self.saturated.push(field);
        }
    }

    fn u8(&mut self, field: &'static str, value: f32, scale: f64, max: u8) -> u8 {
        self.quantize(field, f64::from(value), scale, 0, i64::from(max)) as u8
    }

    fn i8(&mut self, field: &'static str, value: f32, scale: f64) -> i8 {
        self.quantize(field, f64::from(value), scale, i64::from(i8::MIN), i64::from(i8::MAX)) as i8
    }

    fn u16(&mut self, field: &'static str, value: f32, scale: f64) -> u16 {
        self.quantize(field, f64::from(value), scale, 0, i64::from(u16::MAX)) as u16
    }

    fn i16(&mut self, field: &'static str, value: f32, scale: f64, bound: i16) -> i16 {
        self.quantize(field, f64::from(value), scale, -i64::from(bound), i64::from(bound)) as i16
    }

    fn u32(&mut self, field: &'static str, value: f64, scale: f64) -> u32 {
        self.quantize(field, value, scale, 0, i64::from(u32::MAX)) as u32
    }

    fn i32(&mut self, field: &'static str, value: f64, scale: f64) -> i32 {
        self.quantize(field, value, scale, -i64::from(i32::MAX), i64::from(i32::MAX)) as i32
    }

    /// Writes `flags` (plus the saturation bit) at `flags_at`, if the layout has one.
    fn finish(self, kind: FrameKind, mut buf: [u8; MAX_PAYLOAD], flags_at: Option<(usize, u8)>) -> Encoded {
        if let Some((index, mut flags)) = flags_at {
            if !self.saturated.is_empty() {
                flags |= FLAG_SATURATED;
            }
            buf[index] = flags;
        }
        Encoded {
            frame: Frame::from_buffer(kind, buf),
            saturated: self.saturated,
        }
    }
}

const fn flag(set: bool, bit: u8) -> u8 {
    if set {
        bit
    } else {
        0
    }
}

const fn has(flags: u8, bit: u8) -> bool {
    flags & bit != 0
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatteryStatus {
    pub pack_voltage_v: f32,
    pub pack_current_a: f32,
    pub soc_percent: f32,
    pub soh_percent: f32,
    pub max_cell_temp_c: f32,
    pub fault: bool,
    pub stale: bool,
    pub saturated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MotorStatus {
    pub rpm: f32,
    pub current_a: f32,
    pub duty_cycle: f32,
    pub max_stator_temp_c: f32,
    pub fault: bool,
    pub stale: bool,
    pub saturated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChargerStatus {
    pub power_kw: f32,
    pub port_temp_c: f32,
    pub connector_temp_c: f32,
    pub connector: ConnectorType,
    pub connected: bool,
    pub active: bool,
    pub complete: bool,
    pub fault: bool,
    pub stale: bool,
    pub saturated: bool,
}

/// Contents of the vehicle status frame. `saturated` is only meaningful on
/// decoded frames; `counter` is stamped by [`ProtocolHandler`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VehicleStatus {
    pub state: VehicleState,
    pub drive_mode: DriveMode,
    pub speed_kmh: f32,
    pub range_km: f32,
    pub motor_enable: bool,
    pub charging_enable: bool,
    pub faults: FaultFlags,
    pub command_rejected: bool,
    pub counter: u8,
    pub saturated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EnergyStatus {
    pub distance_km: f64,
    pub energy_kwh: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TemperatureFrame {
    pub role: SensorRole,
    pub value_c: Option<f32>,
    pub status: TemperatureStatus,
    pub stale: bool,
    pub saturated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemperatureSummary {
    pub battery: TemperatureStatus,
    pub motor: TemperatureStatus,
    pub charging: TemperatureStatus,
    pub faulted_sensors: u8,
}

/// VESC periodic status (rpm, current, duty).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VescStatus {
    pub rpm: i32,
    pub current_a: f32,
    pub duty_cycle: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Message {
    BatteryStatus(BatteryStatus),
    MotorStatus(MotorStatus),
    ChargerStatus(ChargerStatus),
    VehicleStatus(VehicleStatus),
    EnergyStatus(EnergyStatus),
    VehicleCommand(VehicleCommand),
    Temperature(TemperatureFrame),
    TemperatureSummary(TemperatureSummary),
    VescSetDuty(f32),
    VescSetCurrent(f32),
    VescSetCurrentBrake(f32),
    VescSetRpm(i32),
    VescStatus(VescStatus),
}

pub fn encode_battery(snapshot: &BatterySnapshot, stale: bool) -> Encoded {
    let mut p = Packer::default();
    let mut buf = [0u8; MAX_PAYLOAD];
    LittleEndian::write_u16(&mut buf[0..2], p.u16("pack_voltage", snapshot.pack_voltage_v, 100.0));
    LittleEndian::write_i16(&mut buf[2..4], p.i16("pack_current", snapshot.pack_current_a, 10.0, i16::MAX));
    buf[4] = p.u8("soc", snapshot.soc_percent, 2.0, 200);
    buf[5] = p.u8("soh", snapshot.soh_percent, 2.0, 200);
    buf[6] = p.i8("max_cell_temp", snapshot.max_cell_temp_c().unwrap_or(0.0), 1.0) as u8;
    let flags = flag(snapshot.fault, FLAG_FAULT) | flag(stale, FLAG_STALE);
    p.finish(FrameKind::BatteryStatus, buf, Some((7, flags)))
}

pub fn encode_motor(snapshot: &MotorSnapshot, stale: bool) -> Encoded {
    let mut p = Packer::default();
    let mut buf = [0u8; MAX_PAYLOAD];
    LittleEndian::write_i16(&mut buf[0..2], p.i16("rpm", snapshot.rpm, 1.0, i16::MAX));
    LittleEndian::write_i16(&mut buf[2..4], p.i16("current", snapshot.current_a, 10.0, i16::MAX));
    LittleEndian::write_i16(&mut buf[4..6], p.i16("duty", snapshot.duty_cycle, 1000.0, 1000));
    buf[6] = p.i8("max_stator_temp", snapshot.max_stator_temp_c().unwrap_or(0.0), 1.0) as u8;
    let flags = flag(snapshot.fault, FLAG_FAULT) | flag(stale, FLAG_STALE);
    p.finish(FrameKind::MotorStatus, buf, Some((7, flags)))
}

pub fn encode_charger(snapshot: &ChargingSnapshot, stale: bool) -> Encoded {
    let mut p = Packer::default();
    let mut buf = [0u8; MAX_PAYLOAD];
    LittleEndian::write_u16(&mut buf[0..2], p.u16("power", snapshot.power_kw, 100.0));
    buf[2] = p.i8("port_temp", snapshot.port_temp_c, 1.0) as u8;
    buf[3] = p.i8("connector_temp", snapshot.connector_temp_c, 1.0) as u8;
    buf[4] = snapshot.connector as u8;
    let flags = flag(snapshot.connected, CHARGER_CONNECTED)
        | flag(snapshot.active, CHARGER_ACTIVE)
        | flag(snapshot.complete, CHARGER_COMPLETE)
        | flag(snapshot.fault, CHARGER_FAULT)
        | flag(stale, CHARGER_STALE);
    p.finish(FrameKind::ChargerStatus, buf, Some((5, flags)))
}

pub fn encode_vehicle_status(status: &VehicleStatus) -> Encoded {
    let mut p = Packer::default();
    let mut buf = [0u8; MAX_PAYLOAD];
    buf[0] = status.state as u8;
    buf[1] = status.drive_mode as u8;
    LittleEndian::write_u16(&mut buf[2..4], p.u16("speed", status.speed_kmh, 100.0));
    LittleEndian::write_u16(&mut buf[4..6], p.u16("range", status.range_km, 10.0));
    let flags = flag(status.motor_enable, VEHICLE_MOTOR_ENABLE)
        | flag(status.charging_enable, VEHICLE_CHARGING_ENABLE)
        | flag(status.faults.battery, VEHICLE_BATTERY_FAULT)
        | flag(status.faults.motor, VEHICLE_MOTOR_FAULT)
        | flag(status.faults.charging, VEHICLE_CHARGING_FAULT)
        | flag(status.command_rejected, VEHICLE_COMMAND_REJECTED);
    buf[7] = status.counter;
    p.finish(FrameKind::VehicleStatus, buf, Some((6, flags)))
}

pub fn encode_energy(ledger: &EnergyLedger) -> Encoded {
    let mut p = Packer::default();
    let mut buf = [0u8; MAX_PAYLOAD];
    LittleEndian::write_u32(&mut buf[0..4], p.u32("distance", ledger.distance_km(), 1000.0));
    LittleEndian::write_u32(&mut buf[4..8], p.u32("energy", ledger.energy_consumed_kwh(), 1000.0));
    p.finish(FrameKind::EnergyStatus, buf, None)
}

pub fn encode_command(command: &VehicleCommand) -> Encoded {
    let mut p = Packer::default();
    let mut buf = [0u8; MAX_PAYLOAD];
    buf[0] = p.u8("accel", command.accel_percent, 2.0, 200);
    buf[1] = p.u8("brake", command.brake_percent, 2.0, 200);
    buf[2] = command.drive_mode.map_or(NO_DRIVE_MODE, |mode| mode as u8);
    buf[3] = command.request as u8;
    p.finish(FrameKind::VehicleCommand, buf, None)
}

pub fn encode_temperature(reading: &TemperatureReading) -> Encoded {
    let mut p = Packer::default();
    let mut buf = [0u8; MAX_PAYLOAD];
    buf[0] = reading.role.index;
    let raw = reading.value_c.map_or(0, |v| p.i16("temperature", v, 10.0, i16::MAX));
    LittleEndian::write_i16(&mut buf[1..3], raw);
    buf[3] = reading.status as u8;
    let flags = flag(reading.stale, TEMP_STALE) | flag(reading.value_c.is_none(), TEMP_MISSING);
    p.finish(FrameKind::Temperature(reading.role.kind), buf, Some((4, flags)))
}

pub fn encode_thermal_summary(report: &ThermalReport) -> Encoded {
    let mut buf = [0u8; MAX_PAYLOAD];
    buf[0] = report.battery as u8;
    buf[1] = report.motor as u8;
    buf[2] = report.charging as u8;
    buf[3] = report.faulted_sensors;
    Packer::default().finish(FrameKind::TemperatureSummary, buf, None)
}

/// VESC setpoint for `command`. `Release` is sent as zero current.
pub fn encode_motor_command(command: MotorCommand) -> Encoded {
    let mut p = Packer::default();
    let mut buf = [0u8; MAX_PAYLOAD];
    let kind = match command {
        MotorCommand::Release => {
            BigEndian::write_i32(&mut buf[0..4], 0);
            FrameKind::VescSetCurrent
        }
        MotorCommand::Duty(duty) => {
            let raw = p.quantize("duty", f64::from(duty), 100_000.0, -100_000, 100_000);
            BigEndian::write_i32(&mut buf[0..4], raw as i32);
            FrameKind::VescSetDuty
        }
        MotorCommand::Current(amps) => {
            BigEndian::write_i32(&mut buf[0..4], p.i32("current", f64::from(amps), 1000.0));
            FrameKind::VescSetCurrent
        }
        MotorCommand::Brake(amps) => {
            let raw = p.quantize("brake_current", f64::from(amps), 1000.0, 0, i64::from(i32::MAX));
            BigEndian::write_i32(&mut buf[0..4], raw as i32);
            FrameKind::VescSetCurrentBrake
        }
    };
    p.finish(kind, buf, None)
}

pub fn encode_vesc_status(status: &VescStatus) -> Encoded {
    let mut p = Packer::default();
    let mut buf = [0u8; MAX_PAYLOAD];
    BigEndian::write_i32(&mut buf[0..4], status.rpm);
    BigEndian::write_i16(&mut buf[4..6], p.i16("current", status.current_a, 10.0, i16::MAX));
    BigEndian::write_i16(&mut buf[6..8], p.i16("duty", status.duty_cycle, 1000.0, 1000));
    p.finish(FrameKind::VescStatus, buf, None)
}

/// Decode any registered frame.
///
/// Unknown identifiers and length mismatches are reported, never panicked on;
/// callers drop the frame and carry on.
pub fn decode(frame: &Frame) -> Result<Message, ProtocolError> {
    let kind = FrameKind::from_id(frame.id).ok_or(ProtocolError::UnknownIdentifier(frame.id))?;
    let d = frame.payload();
    if d.len() != kind.payload_len() {
        return Err(ProtocolError::MalformedFrame {
            id: frame.id,
            expected: kind.payload_len(),
            actual: d.len(),
        });
    }

    let message = match kind {
        FrameKind::BatteryStatus => Message::BatteryStatus(BatteryStatus {
            pack_voltage_v: f32::from(LittleEndian::read_u16(&d[0..2])) / 100.0,
            pack_current_a: f32::from(LittleEndian::read_i16(&d[2..4])) / 10.0,
            soc_percent: f32::from(d[4]) / 2.0,
            soh_percent: f32::from(d[5]) / 2.0,
            max_cell_temp_c: f32::from(d[6] as i8),
            fault: has(d[7], FLAG_FAULT),
            stale: has(d[7], FLAG_STALE),
            saturated: has(d[7], FLAG_SATURATED),
        }),
        FrameKind::MotorStatus => Message::MotorStatus(MotorStatus {
            rpm: f32::from(LittleEndian::read_i16(&d[0..2])),
            current_a: f32::from(LittleEndian::read_i16(&d[2..4])) / 10.0,
            duty_cycle: f32::from(LittleEndian::read_i16(&d[4..6])) / 1000.0,
            max_stator_temp_c: f32::from(d[6] as i8),
            fault: has(d[7], FLAG_FAULT),
            stale: has(d[7], FLAG_STALE),
            saturated: has(d[7], FLAG_SATURATED),
        }),
        FrameKind::ChargerStatus => {
            let connector = ConnectorType::from_u8(d[4]).ok_or(ProtocolError::InvalidField {
                id: frame.id,
                field: "connector",
                value: d[4],
            })?;
            Message::ChargerStatus(ChargerStatus {
                power_kw: f32::from(LittleEndian::read_u16(&d[0..2])) / 100.0,
                port_temp_c: f32::from(d[2] as i8),
                connector_temp_c: f32::from(d[3] as i8),
                connector,
                connected: has(d[5], CHARGER_CONNECTED),
                active: has(d[5], CHARGER_ACTIVE),
                complete: has(d[5], CHARGER_COMPLETE),
                fault: has(d[5], CHARGER_FAULT),
                stale: has(d[5], CHARGER_STALE),
                saturated: has(d[5], FLAG_SATURATED),
            })
        }
        FrameKind::VehicleStatus => {
            let state = VehicleState::from_u8(d[0]).ok_or(ProtocolError::InvalidField {
                id: frame.id,
                field: "state",
                value: d[0],
            })?;
            let drive_mode = DriveMode::from_u8(d[1]).ok_or(ProtocolError::InvalidField {
                id: frame.id,
                field: "drive_mode",
                value: d[1],
            })?;
            let flags = d[6];
            Message::VehicleStatus(VehicleStatus {
                state,
                drive_mode,
                speed_kmh: f32::from(LittleEndian::read_u16(&d[2..4])) / 100.0,
                range_km: f32::from(LittleEndian::read_u16(&d[4..6])) / 10.0,
                motor_enable: has(flags, VEHICLE_MOTOR_ENABLE),
                charging_enable: has(flags, VEHICLE_CHARGING_ENABLE),
                faults: FaultFlags {
                    battery: has(flags, VEHICLE_BATTERY_FAULT),
                    motor: has(flags, VEHICLE_MOTOR_FAULT),
                    charging: has(flags, VEHICLE_CHARGING_FAULT),
                },
                command_rejected: has(flags, VEHICLE_COMMAND_REJECTED),
                counter: d[7],
                saturated: has(flags, FLAG_SATURATED),
            })
        }
        FrameKind::EnergyStatus => Message::EnergyStatus(EnergyStatus {
            distance_km: f64::from(LittleEndian::read_u32(&d[0..4])) / 1000.0,
            energy_kwh: f64::from(LittleEndian::read_u32(&d[4..8])) / 1000.0,
        }),
        FrameKind::VehicleCommand => {
            let drive_mode = match d[2] {
                NO_DRIVE_MODE => None,
                raw => Some(DriveMode::from_u8(raw).ok_or(ProtocolError::InvalidField {
                    id: frame.id,
                    field: "drive_mode",
                    value: raw,
                })?),
            };
            let request = ControlRequest::from_u8(d[3]).ok_or(ProtocolError::InvalidField {
                id: frame.id,
                field: "request",
                value: d[3],
            })?;
            Message::VehicleCommand(VehicleCommand {
                accel_percent: f32::from(d[0]) / 2.0,
                brake_percent: f32::from(d[1]) / 2.0,
                drive_mode,
                request,
            })
        }
        FrameKind::Temperature(kind) => {
            let status = TemperatureStatus::from_u8(d[3]).ok_or(ProtocolError::InvalidField {
                id: frame.id,
                field: "status",
                value: d[3],
            })?;
            let missing = has(d[4], TEMP_MISSING);
            Message::Temperature(TemperatureFrame {
                role: SensorRole::new(kind, d[0]),
                value_c: (!missing).then(|| f32::from(LittleEndian::read_i16(&d[1..3])) / 10.0),
                status,
                stale: has(d[4], TEMP_STALE),
                saturated: has(d[4], FLAG_SATURATED),
            })
        }
        FrameKind::TemperatureSummary => {
            let status = |index: usize, field: &'static str| {
                TemperatureStatus::from_u8(d[index]).ok_or(ProtocolError::InvalidField {
                    id: frame.id,
                    field,
                    value: d[index],
                })
            };
            Message::TemperatureSummary(TemperatureSummary {
                battery: status(0, "battery_status")?,
                motor: status(1, "motor_status")?,
                charging: status(2, "charging_status")?,
                faulted_sensors: d[3],
            })
        }
        FrameKind::VescSetDuty => Message::VescSetDuty(BigEndian::read_i32(&d[0..4]) as f32 / 100_000.0),
        FrameKind::VescSetCurrent => Message::VescSetCurrent(BigEndian::read_i32(&d[0..4]) as f32 / 1000.0),
        FrameKind::VescSetCurrentBrake => {
            Message::VescSetCurrentBrake(BigEndian::read_i32(&d[0..4]) as f32 / 1000.0)
        }
        FrameKind::VescSetRpm => Message::VescSetRpm(BigEndian::read_i32(&d[0..4])),
        FrameKind::VescStatus => Message::VescStatus(VescStatus {
            rpm: BigEndian::read_i32(&d[0..4]),
            current_a: f32::from(BigEndian::read_i16(&d[4..6])) / 10.0,
            duty_cycle: f32::from(BigEndian::read_i16(&d[6..8])) / 1000.0,
        }),
    };

    Ok(message)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolStats {
    pub frames_encoded: u32,
    pub frames_decoded: u32,
    pub frames_dropped: u32,
    pub unknown_identifier: u32,
    pub malformed: u32,
    pub invalid_field: u32,
    pub saturated_frames: u32,
}

/// Stateful front of the codec: counts what it encodes, decodes and drops,
/// and stamps the rolling counter on vehicle status frames.
#[derive(Debug, Default)]
pub struct ProtocolHandler {
    stats: ProtocolStats,
    counter: u8,
}

impl ProtocolHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode an inbound frame, dropping (and counting) anything undecodable.
    pub fn decode_inbound(&mut self, frame: &Frame) -> Option<Message> {
        match decode(frame) {
            Ok(message) => {
                self.stats.frames_decoded = self.stats.frames_decoded.saturating_add(1);
                Some(message)
            }
            Err(e) => {
                match e {
                    ProtocolError::UnknownIdentifier(_) => {
                        self.stats.unknown_identifier = self.stats.unknown_identifier.saturating_add(1);
                    }
                    ProtocolError::MalformedFrame { .. } => {
                        self.stats.malformed = self.stats.malformed.saturating_add(1);
                    }
                    ProtocolError::InvalidField { .. } => {
                        self.stats.invalid_field = self.stats.invalid_field.saturating_add(1);
                    }
                }
                warn!("Dropping inbound frame {}: {}", frame, e);
                None
            }
        }
    }

    /// Inbound control commands only; other valid frames are ignored.
    pub fn decode_command(&mut self, frame: &Frame) -> Option<VehicleCommand> {
        match self.decode_inbound(frame)? {
            Message::VehicleCommand(command) => Some(command),
            other => {
                debug!("Ignoring inbound {:?}", other);
                None
            }
        }
    }

    pub fn record_dropped(&mut self, count: u32) {
        self.stats.frames_dropped = self.stats.frames_dropped.saturating_add(count);
    }

    pub fn stats(&self) -> &ProtocolStats {
        &self.stats
    }

    fn accept<const N: usize>(&mut self, frames: &mut Vec<Frame, N>, encoded: Encoded) {
        self.stats.frames_encoded = self.stats.frames_encoded.saturating_add(1);
        if encoded.is_saturated() {
            self.stats.saturated_frames = self.stats.saturated_frames.saturating_add(1);
            warn!("Frame 0x{:03X} saturated fields {:?}", encoded.frame.id, encoded.saturated);
        }
        if frames.push(encoded.frame).is_err() {
            self.record_dropped(1);
        }
    }

    fn next_status(&mut self, vehicle: &VehicleStateMachine) -> VehicleStatus {
        let mut status = vehicle.vehicle_status();
        status.counter = self.counter;
        self.counter = self.counter.wrapping_add(1);
        status
    }

    /// Every frame transmitted after a coordination tick.
    pub fn encode_tick(
        &mut self,
        vehicle: &VehicleStateMachine,
        thermal: &ThermalReport,
    ) -> Vec<Frame, MAX_FRAMES_PER_TICK> {
        let mut frames = Vec::new();

        let status = self.next_status(vehicle);
        self.accept(&mut frames, encode_vehicle_status(&status));
        self.accept(&mut frames, encode_energy(vehicle.energy()));

        let battery = vehicle.battery();
        if let Some(snapshot) = battery.snapshot() {
            self.accept(&mut frames, encode_battery(snapshot, battery.stale));
        }
        let motor = vehicle.motor();
        if let Some(snapshot) = motor.snapshot() {
            self.accept(&mut frames, encode_motor(snapshot, motor.stale));
        }
        let charging = vehicle.charging();
        if let Some(snapshot) = charging.snapshot() {
            self.accept(&mut frames, encode_charger(snapshot, charging.stale));
        }

        self.accept(&mut frames, encode_motor_command(vehicle.outbound().motor()));

        for reading in &thermal.readings {
            self.accept(&mut frames, encode_temperature(reading));
        }
        self.accept(&mut frames, encode_thermal_summary(thermal));

        frames
    }

    /// Final frames after shutdown: status showing both enables off, and a
    /// motor release.
    pub fn encode_final(&mut self, vehicle: &VehicleStateMachine) -> Vec<Frame, 2> {
        let mut frames = Vec::new();
        let status = self.next_status(vehicle);
        self.accept(&mut frames, encode_vehicle_status(&status));
        self.accept(&mut frames, encode_motor_command(MotorCommand::Release));
        frames
    }
}
