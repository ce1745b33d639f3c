//! Simulated vehicle plant.
//!
//! One shared plant backs all four driver traits, so a command sent through
//! the motor driver shows up in the next battery and temperature reads. The
//! physics is first-order and only good enough to exercise the core.

use crate::bus::BusTransport;
use crate::safety::FaultFlags;
use crate::scheduler::Drivers;
use crate::subsystems::{
    BatteryDriver, BatterySnapshot, ChargingDriver, ChargingSnapshot, Clock, ConnectorType, DriverError,
    MotorCommand, MotorDriver, MotorSnapshot, SubsystemId, TemperatureSource,
};
use crate::subsystems::battery::MAX_CELL_GROUPS;
use crate::subsystems::motor::MAX_STATOR_SENSORS;
use crate::thermal::{RawReading, ReadingMap, SensorKind, SensorLayout, SensorRole, MAX_SENSORS};
use heapless::{FnvIndexMap, Vec};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

const AMBIENT_C: f32 = 25.0;
const MAX_RPM: f32 = 1_500.0;
const DUTY_TIME_CONSTANT_S: f32 = 1.5;
const COAST_DECAY_RPM_PER_S: f32 = 40.0;
const BRAKE_RPM_PER_S_PER_A: f32 = 40.0;
const FULL_DUTY_CURRENT_A: f32 = 150.0;
const PACK_CAPACITY_AH: f32 = 187.5;
const CHARGER_LIMIT_KW: f32 = 50.0;
const MOTOR_THERMAL_TIME_S: f32 = 60.0;
const PACK_THERMAL_TIME_S: f32 = 120.0;

/// A simulated device that can be taken offline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimDevice {
    Battery,
    Motor,
    Charging,
    Temperatures,
}

#[derive(Debug)]
struct Plant {
    layout: SensorLayout,
    last_step_ms: u64,

    soc_percent: f32,
    pack_voltage_v: f32,
    pack_current_a: f32,
    cell_temp_c: f32,

    rpm: f32,
    motor_current_a: f32,
    motor_command: MotorCommand,
    motor_temp_c: f32,

    connector: ConnectorType,
    connected: bool,
    charging_enabled: bool,
    charge_power_kw: f32,

    offline: [bool; 4],
    faults: FaultFlags,
    silenced: Vec<SensorRole, MAX_SENSORS>,
    forced: FnvIndexMap<SensorRole, f32, MAX_SENSORS>,
    readings: ReadingMap,
}

impl Plant {
    fn new(layout: SensorLayout, now_ms: u64) -> Self {
        Self {
            layout,
            last_step_ms: now_ms,
            soc_percent: 80.0,
            pack_voltage_v: 0.0,
            pack_current_a: 0.0,
            cell_temp_c: AMBIENT_C,
            rpm: 0.0,
            motor_current_a: 0.0,
            motor_command: MotorCommand::Release,
            motor_temp_c: AMBIENT_C,
            connector: ConnectorType::Ccs2,
            connected: false,
            charging_enabled: false,
            charge_power_kw: 0.0,
            offline: [false; 4],
            faults: FaultFlags::default(),
            silenced: Vec::new(),
            forced: FnvIndexMap::new(),
            readings: ReadingMap::new(),
        }
    }

    fn advance(&mut self, now_ms: u64) {
        let dt = now_ms.saturating_sub(self.last_step_ms) as f32 / 1000.0;
        self.last_step_ms = now_ms;

        match self.motor_command {
            MotorCommand::Duty(duty) => {
                let target = duty * MAX_RPM;
                self.rpm += (target - self.rpm) * (dt / DUTY_TIME_CONSTANT_S).min(1.0);
                self.motor_current_a = duty.abs() * FULL_DUTY_CURRENT_A;
            }
            MotorCommand::Current(current) => {
                self.rpm += current * BRAKE_RPM_PER_S_PER_A * dt / 4.0;
                self.motor_current_a = current;
            }
            MotorCommand::Brake(current) => {
                self.rpm = toward_zero(self.rpm, current.abs() * BRAKE_RPM_PER_S_PER_A * dt);
                self.motor_current_a = if self.rpm == 0.0 { 0.0 } else { -current.abs() };
            }
            MotorCommand::Release => {
                self.rpm = toward_zero(self.rpm, COAST_DECAY_RPM_PER_S * dt);
                self.motor_current_a = 0.0;
            }
        }
        self.rpm = self.rpm.clamp(-MAX_RPM, MAX_RPM);

        self.charge_power_kw = if self.connected && self.charging_enabled && !self.charge_complete() {
            self.connector.max_power_kw().min(CHARGER_LIMIT_KW)
        } else {
            0.0
        };

        self.pack_voltage_v = 350.0 + self.soc_percent * 0.7;
        let charge_current_a = self.charge_power_kw * 1000.0 / self.pack_voltage_v;
        self.pack_current_a = self.motor_current_a - charge_current_a;

        let drawn_ah = self.pack_current_a * dt / 3600.0;
        self.soc_percent = (self.soc_percent - drawn_ah / PACK_CAPACITY_AH * 100.0).clamp(0.0, 100.0);

        let motor_target = AMBIENT_C + self.motor_current_a.abs() * 0.3;
        self.motor_temp_c += (motor_target - self.motor_temp_c) * (dt / MOTOR_THERMAL_TIME_S).min(1.0);
        let cell_target = AMBIENT_C + self.pack_current_a.abs() * 0.05;
        self.cell_temp_c += (cell_target - self.cell_temp_c) * (dt / PACK_THERMAL_TIME_S).min(1.0);
    }

    fn charge_complete(&self) -> bool {
        self.soc_percent >= 100.0
    }

    fn is_offline(&self, device: SimDevice) -> bool {
        self.offline[device as usize]
    }

    fn sensor_value(&self, role: SensorRole) -> f32 {
        if let Some(&forced) = self.forced.get(&role) {
            return forced;
        }
        let spread = f32::from(role.index) * 0.3;
        match role.kind {
            SensorKind::BatteryCellGroup => self.cell_temp_c + spread,
            SensorKind::CoolantInlet => AMBIENT_C,
            SensorKind::CoolantOutlet => AMBIENT_C + 3.0 + self.pack_current_a.abs() * 0.02,
            SensorKind::MotorStator => self.motor_temp_c + spread,
            SensorKind::ChargingPort => AMBIENT_C + self.charge_power_kw * 0.2,
            SensorKind::ChargingConnector => AMBIENT_C + 2.0 + self.charge_power_kw * 0.2,
        }
    }

    /// Silenced sensors keep their last reading, timestamp included.
    fn refresh_readings(&mut self, now_ms: u64) {
        for role in self.layout.expected_roles() {
            if self.silenced.contains(&role) {
                continue;
            }
            let reading = RawReading {
                value_c: self.sensor_value(role),
                timestamp_ms: now_ms,
            };
            let _ = self.readings.insert(role, reading);
        }
    }

    fn temperatures(&self, kind: SensorKind, count: u8) -> impl Iterator<Item = f32> + '_ {
        (0..count).map(move |index| self.sensor_value(SensorRole::new(kind, index)))
    }
}

fn toward_zero(value: f32, step: f32) -> f32 {
    if value.abs() <= step {
        0.0
    } else {
        value - step * value.signum()
    }
}

/// Handle to the shared plant. Cheap to clone; every clone drives the same
/// vehicle.
#[derive(Debug, Clone)]
pub struct SimulatedVehicle {
    plant: Arc<Mutex<Plant>>,
    clock: Clock,
}

impl SimulatedVehicle {
    pub fn new(clock: Clock) -> Self {
        Self::with_layout(clock, SensorLayout::default())
    }

    pub fn with_layout(clock: Clock, layout: SensorLayout) -> Self {
        Self {
            plant: Arc::new(Mutex::new(Plant::new(layout, clock.now_ms()))),
            clock,
        }
    }

    /// Box one clone per driver role for the scheduler.
    pub fn drivers(&self, bus: Box<dyn BusTransport>) -> Drivers {
        Drivers {
            battery: Box::new(self.clone()),
            motor: Box::new(self.clone()),
            charging: Box::new(self.clone()),
            temperatures: Box::new(self.clone()),
            bus,
        }
    }

    fn with_plant<R>(&self, f: impl FnOnce(&mut Plant) -> R) -> Option<R> {
        self.plant.lock().ok().map(|mut plant| f(&mut plant))
    }

    /// Lock, step the physics to now, and bail out if `device` is offline.
    fn step(&self, device: SimDevice) -> Result<std::sync::MutexGuard<'_, Plant>, DriverError> {
        let mut plant = self.plant.lock().map_err(|_| DriverError::Poisoned)?;
        if plant.is_offline(device) {
            return Err(DriverError::Disconnected);
        }
        plant.advance(self.clock.now_ms());
        Ok(plant)
    }

    pub fn plug_in(&self, connector: ConnectorType) {
        info!("🔌 Charger plugged in ({:?})", connector);
        self.with_plant(|p| {
            p.connector = connector;
            p.connected = true;
        });
    }

    pub fn unplug(&self) {
        info!("🔌 Charger unplugged");
        self.with_plant(|p| p.connected = false);
    }

    pub fn set_soc(&self, soc_percent: f32) {
        self.with_plant(|p| p.soc_percent = soc_percent.clamp(0.0, 100.0));
    }

    pub fn set_offline(&self, device: SimDevice, offline: bool) {
        debug!("{:?} offline={}", device, offline);
        self.with_plant(|p| p.offline[device as usize] = offline);
    }

    /// Make the subsystem's own driver report a fault.
    pub fn inject_fault(&self, subsystem: SubsystemId, fault: bool) {
        self.with_plant(|p| match subsystem {
            SubsystemId::Battery => p.faults.battery = fault,
            SubsystemId::Motor => p.faults.motor = fault,
            SubsystemId::Charging => p.faults.charging = fault,
        });
    }

    /// Stop updating one sensor; its last reading ages from here on.
    pub fn silence_sensor(&self, role: SensorRole, silent: bool) {
        self.with_plant(|p| {
            if silent {
                if !p.silenced.contains(&role) {
                    let _ = p.silenced.push(role);
                }
            } else {
                p.silenced.retain(|r| *r != role);
            }
        });
    }

    /// Pin a sensor to a fixed value, or release it with `None`.
    pub fn force_temperature(&self, role: SensorRole, value_c: Option<f32>) {
        self.with_plant(|p| match value_c {
            Some(value) => {
                let _ = p.forced.insert(role, value);
            }
            None => {
                p.forced.remove(&role);
            }
        });
    }

    pub fn motor_command(&self) -> Option<MotorCommand> {
        self.with_plant(|p| p.motor_command)
    }

    pub fn charging_enabled(&self) -> bool {
        self.with_plant(|p| p.charging_enabled).unwrap_or(false)
    }

    pub fn soc_percent(&self) -> Option<f32> {
        self.with_plant(|p| p.soc_percent)
    }

    pub fn rpm(&self) -> Option<f32> {
        self.with_plant(|p| p.rpm)
    }
}

impl BatteryDriver for SimulatedVehicle {
    fn read_battery(&mut self) -> Result<BatterySnapshot, DriverError> {
        let plant = self.step(SimDevice::Battery)?;
        Ok(BatterySnapshot {
            soc_percent: plant.soc_percent,
            soh_percent: 97.0,
            pack_voltage_v: plant.pack_voltage_v,
            pack_current_a: plant.pack_current_a,
            cell_group_temps_c: plant
                .temperatures(SensorKind::BatteryCellGroup, plant.layout.cell_groups)
                .take(MAX_CELL_GROUPS)
                .collect(),
            fault: plant.faults.battery,
            captured_at_ms: plant.last_step_ms,
        })
    }
}

impl MotorDriver for SimulatedVehicle {
    fn read_motor(&mut self) -> Result<MotorSnapshot, DriverError> {
        let plant = self.step(SimDevice::Motor)?;
        let duty_cycle = match plant.motor_command {
            MotorCommand::Duty(duty) => duty,
            _ => plant.rpm / MAX_RPM,
        };
        Ok(MotorSnapshot {
            rpm: plant.rpm,
            current_a: plant.motor_current_a,
            duty_cycle,
            stator_temps_c: plant
                .temperatures(SensorKind::MotorStator, plant.layout.stator_sensors)
                .take(MAX_STATOR_SENSORS)
                .collect(),
            fault: plant.faults.motor,
            captured_at_ms: plant.last_step_ms,
        })
    }

    fn send_motor_command(&mut self, command: MotorCommand) -> Result<(), DriverError> {
        let mut plant = self.step(SimDevice::Motor)?;
        if plant.motor_command != command {
            debug!("Motor command {:?}", command);
        }
        plant.motor_command = command;
        Ok(())
    }
}

impl ChargingDriver for SimulatedVehicle {
    fn read_charging(&mut self) -> Result<ChargingSnapshot, DriverError> {
        let plant = self.step(SimDevice::Charging)?;
        Ok(ChargingSnapshot {
            connector: plant.connector,
            port_temp_c: plant.sensor_value(SensorRole::new(SensorKind::ChargingPort, 0)),
            connector_temp_c: plant.sensor_value(SensorRole::new(SensorKind::ChargingConnector, 0)),
            connected: plant.connected,
            active: plant.charge_power_kw > 0.0,
            complete: plant.connected && plant.charge_complete(),
            power_kw: plant.charge_power_kw,
            fault: plant.faults.charging,
            captured_at_ms: plant.last_step_ms,
        })
    }

    fn set_charging_enabled(&mut self, enabled: bool) -> Result<(), DriverError> {
        let mut plant = self.step(SimDevice::Charging)?;
        if plant.charging_enabled != enabled {
            debug!("Charging enabled={}", enabled);
        }
        plant.charging_enabled = enabled;
        Ok(())
    }
}

impl TemperatureSource for SimulatedVehicle {
    fn read_temperatures(&mut self) -> Result<ReadingMap, DriverError> {
        let mut plant = self.step(SimDevice::Temperatures)?;
        let now = plant.last_step_ms;
        plant.refresh_readings(now);
        Ok(plant.readings.clone())
    }
}
