//! Vehicle state machine.
//!
//! The single owner of [`VehicleState`] and the [`EnergyLedger`]. Each call to
//! [`VehicleStateMachine::tick`] ingests the latest snapshots wholesale,
//! evaluates at most one transition in fixed priority order (Emergency, then
//! Error, then explicit commands, then automatic conditions) and derives the
//! outbound command from the resulting state.

use crate::config::{CoreConfig, VehicleSettings};
use crate::energy::{charge_time_remaining_s, EnergyLedger};
use crate::fault::FaultLog;
use crate::protocol::VehicleStatus;
use crate::safety::{
    FaultFlags, FaultMonitor, InterlockMonitor, InterlockViolation, SafetyEventRecord, SafetyLevel,
};
use crate::subsystems::{BatterySnapshot, ChargingSnapshot, MotorCommand, MotorSnapshot, Polled};
use crate::thermal::ThermalReport;
use core::fmt;
use heapless::Vec;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub const MAX_COMMANDS_PER_TICK: usize = 8;

const DUTY_LIMIT: f32 = 0.95;
const DEMAND_EPSILON: f32 = 0.01;
const SPEED_FLOOR_KMH: f32 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum VehicleState {
    Parked = 0,
    Ready = 1,
    Driving = 2,
    Charging = 3,
    Error = 4,
    Emergency = 5,
}

impl VehicleState {
    pub const ALL: [VehicleState; 6] = [
        VehicleState::Parked,
        VehicleState::Ready,
        VehicleState::Driving,
        VehicleState::Charging,
        VehicleState::Error,
        VehicleState::Emergency,
    ];

    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(VehicleState::Parked),
            1 => Some(VehicleState::Ready),
            2 => Some(VehicleState::Driving),
            3 => Some(VehicleState::Charging),
            4 => Some(VehicleState::Error),
            5 => Some(VehicleState::Emergency),
            _ => None,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            VehicleState::Parked => "PARKED",
            VehicleState::Ready => "READY",
            VehicleState::Driving => "DRIVING",
            VehicleState::Charging => "CHARGING",
            VehicleState::Error => "ERROR",
            VehicleState::Emergency => "EMERGENCY",
        }
    }
}

impl fmt::Display for VehicleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DriveMode {
    Eco = 0,
    Normal = 1,
    Sport = 2,
    Reverse = 3,
}

impl DriveMode {
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(DriveMode::Eco),
            1 => Some(DriveMode::Normal),
            2 => Some(DriveMode::Sport),
            3 => Some(DriveMode::Reverse),
            _ => None,
        }
    }

    /// Scale applied to the accelerator before it becomes a duty cycle.
    pub const fn output_factor(self) -> f32 {
        match self {
            DriveMode::Eco => 0.7,
            DriveMode::Normal => 1.0,
            DriveMode::Sport => 1.2,
            DriveMode::Reverse => -0.3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ControlRequest {
    None = 0,
    PowerOn = 1,
    PowerOff = 2,
    FaultAck = 3,
    EmergencyStop = 4,
    EmergencyReset = 5,
    TripReset = 6,
}

impl ControlRequest {
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ControlRequest::None),
            1 => Some(ControlRequest::PowerOn),
            2 => Some(ControlRequest::PowerOff),
            3 => Some(ControlRequest::FaultAck),
            4 => Some(ControlRequest::EmergencyStop),
            5 => Some(ControlRequest::EmergencyReset),
            6 => Some(ControlRequest::TripReset),
            _ => None,
        }
    }
}

/// One decoded control frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VehicleCommand {
    pub accel_percent: f32,
    pub brake_percent: f32,
    /// `None` keeps the current mode.
    pub drive_mode: Option<DriveMode>,
    pub request: ControlRequest,
}

impl VehicleCommand {
    pub const fn request(request: ControlRequest) -> Self {
        Self {
            accel_percent: 0.0,
            brake_percent: 0.0,
            drive_mode: None,
            request,
        }
    }

    pub const fn accelerate(percent: f32) -> Self {
        Self {
            accel_percent: percent,
            ..Self::request(ControlRequest::None)
        }
    }

    pub const fn brake(percent: f32) -> Self {
        Self {
            brake_percent: percent,
            ..Self::request(ControlRequest::None)
        }
    }

    /// Pedals released.
    pub const fn coast() -> Self {
        Self::request(ControlRequest::None)
    }

    #[must_use]
    pub const fn with_mode(self, mode: DriveMode) -> Self {
        Self {
            drive_mode: Some(mode),
            ..self
        }
    }

    fn wants_motion(&self) -> bool {
        self.accel_percent > DEMAND_EPSILON || self.brake_percent > DEMAND_EPSILON
    }
}

/// Pedal levels latched from the most recent command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Demand {
    pub accel_percent: f32,
    pub brake_percent: f32,
}

impl Demand {
    pub fn is_zero(&self) -> bool {
        self.accel_percent <= DEMAND_EPSILON && self.brake_percent <= DEMAND_EPSILON
    }
}

/// What the motor and charging drivers are told to do.
///
/// Only constructible from a state, so `motor_enable` implies `Driving`,
/// `charging_enable` implies `Charging`, and the two are never both set.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct OutboundCommand {
    motor_enable: bool,
    charging_enable: bool,
    motor: MotorCommand,
}

impl OutboundCommand {
    /// Motor released and charging disabled.
    pub const fn safe() -> Self {
        Self {
            motor_enable: false,
            charging_enable: false,
            motor: MotorCommand::Release,
        }
    }

    pub fn for_state(state: VehicleState, demand: Demand, mode: DriveMode, max_regen_current_a: f32) -> Self {
        match state {
            VehicleState::Driving => {
                let motor = if demand.brake_percent > DEMAND_EPSILON {
                    MotorCommand::Brake(demand.brake_percent.min(100.0) / 100.0 * max_regen_current_a)
                } else if demand.accel_percent > DEMAND_EPSILON {
                    let duty = demand.accel_percent.min(100.0) / 100.0 * mode.output_factor();
                    MotorCommand::Duty(duty.clamp(-DUTY_LIMIT, DUTY_LIMIT))
                } else {
                    MotorCommand::Release
                };
                Self {
                    motor_enable: true,
                    charging_enable: false,
                    motor,
                }
            }
            VehicleState::Charging => Self {
                motor_enable: false,
                charging_enable: true,
                motor: MotorCommand::Release,
            },
            _ => Self::safe(),
        }
    }

    pub fn motor_enable(&self) -> bool {
        self.motor_enable
    }

    pub fn charging_enable(&self) -> bool {
        self.charging_enable
    }

    pub fn motor(&self) -> MotorCommand {
        self.motor
    }
}

/// Everything the state machine consumes in one tick.
#[derive(Debug, Clone)]
pub struct TickInput {
    pub now_ms: u64,
    pub battery: Polled<BatterySnapshot>,
    pub motor: Polled<MotorSnapshot>,
    pub charging: Polled<ChargingSnapshot>,
    pub thermal: ThermalReport,
    /// Commands received since the previous tick, oldest first.
    pub commands: Vec<VehicleCommand, MAX_COMMANDS_PER_TICK>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TickOutcome {
    pub state: VehicleState,
    pub transition: Option<(VehicleState, VehicleState)>,
    pub outbound: OutboundCommand,
    pub rejected: Vec<InterlockViolation, MAX_COMMANDS_PER_TICK>,
    pub faults: FaultFlags,
    pub escalated: bool,
}

#[derive(Debug, Clone, Copy)]
struct ChargerSignal {
    connected: bool,
    wants_charge: bool,
    rising: bool,
}

#[derive(Debug)]
pub struct VehicleStateMachine {
    state: VehicleState,
    drive_mode: DriveMode,
    demand: Demand,
    outbound: OutboundCommand,

    battery: Polled<BatterySnapshot>,
    motor: Polled<MotorSnapshot>,
    charging: Polled<ChargingSnapshot>,
    faults: FaultFlags,

    energy: EnergyLedger,
    monitor: FaultMonitor,
    interlocks: InterlockMonitor,
    settings: VehicleSettings,

    last_tick_ms: Option<u64>,
    charger_was_connected: bool,
    last_rejected: bool,
    transitions: u32,
    time_to_full_s: Option<f64>,
}

impl VehicleStateMachine {
    pub fn new(config: &CoreConfig) -> Self {
        Self {
            state: VehicleState::Parked,
            drive_mode: DriveMode::Normal,
            demand: Demand::default(),
            outbound: OutboundCommand::safe(),
            battery: Polled::empty(0),
            motor: Polled::empty(0),
            charging: Polled::empty(0),
            faults: FaultFlags::default(),
            energy: EnergyLedger::new(),
            monitor: FaultMonitor::new(config.staleness.snapshot_ms),
            interlocks: InterlockMonitor::new(
                config.interlock.violation_window_ms,
                config.interlock.escalation_threshold,
            ),
            settings: config.vehicle.clone(),
            last_tick_ms: None,
            charger_was_connected: false,
            last_rejected: false,
            transitions: 0,
            time_to_full_s: None,
        }
    }

    /// Run one coordination step.
    pub fn tick(&mut self, input: TickInput) -> TickOutcome {
        let now = input.now_ms;
        let dt_ms = self
            .last_tick_ms
            .map_or(0, |last| now.saturating_sub(last))
            .min(self.settings.max_integration_step_ms);
        self.last_tick_ms = Some(now);

        self.battery = input.battery;
        self.motor = input.motor;
        self.charging = input.charging;
        self.faults = self
            .monitor
            .assess(now, &self.battery, &self.motor, &self.charging, &input.thermal);

        let charger = self.charger_signal();
        self.latch_demand(&input.commands);

        let mut rejected = Vec::new();
        let (next, escalated) = self.evaluate(now, &input.commands, charger, &mut rejected);
        self.charger_was_connected = charger.connected;

        let from = self.state;
        let transition = (next != from).then(|| {
            self.enter(next, now);
            (from, next)
        });

        if input.commands.iter().any(|c| c.request == ControlRequest::TripReset) {
            info!("🧾 Trip reset");
            self.energy.reset();
        }
        if self.state == VehicleState::Driving {
            let power_kw = self.battery.snapshot().map_or(0.0, BatterySnapshot::power_kw);
            self.energy.integrate(dt_ms, self.speed_kmh(), power_kw);
        }
        if let Some(battery) = self.battery.snapshot() {
            self.energy.refresh_range(
                battery.soc_percent,
                self.settings.battery_capacity_kwh,
                self.settings.default_efficiency_kwh_per_km,
            );
        }
        self.time_to_full_s = match (self.state, self.battery.snapshot(), self.charging.snapshot()) {
            (VehicleState::Charging, Some(battery), Some(charger)) => charge_time_remaining_s(
                battery.soc_percent,
                self.settings.charge_target_soc_percent,
                self.settings.battery_capacity_kwh,
                charger.power_kw,
            ),
            _ => None,
        };

        self.outbound = OutboundCommand::for_state(
            self.state,
            self.demand,
            self.drive_mode,
            self.settings.max_regen_current_a,
        );

        // NASA Rule 5: Safety assertion for the drive/charge interlock
        debug_assert!(
            !(self.outbound.motor_enable && self.outbound.charging_enable),
            "Motor and charging both enabled in {}",
            self.state
        );

        self.last_rejected = !rejected.is_empty();

        TickOutcome {
            state: self.state,
            transition,
            outbound: self.outbound,
            rejected,
            faults: self.faults,
            escalated,
        }
    }

    fn charger_signal(&self) -> ChargerSignal {
        let snapshot = self.charging.snapshot();
        let connected = snapshot.is_some_and(|c| c.connected);
        ChargerSignal {
            connected,
            wants_charge: snapshot.is_some_and(ChargingSnapshot::wants_charge),
            rising: connected && !self.charger_was_connected,
        }
    }

    fn latch_demand(&mut self, commands: &[VehicleCommand]) {
        for command in commands {
            self.demand = Demand {
                accel_percent: command.accel_percent,
                brake_percent: command.brake_percent,
            };
            if let Some(mode) = command.drive_mode {
                if self.state == VehicleState::Driving && mode != self.drive_mode {
                    debug!("Ignoring drive mode change to {:?} while driving", mode);
                } else {
                    self.drive_mode = mode;
                }
            }
        }
    }

    /// Returns the target state and whether interlock violations escalated.
    fn evaluate(
        &mut self,
        now: u64,
        commands: &[VehicleCommand],
        charger: ChargerSignal,
        rejected: &mut Vec<InterlockViolation, MAX_COMMANDS_PER_TICK>,
    ) -> (VehicleState, bool) {
        let requested = |request: ControlRequest| commands.iter().any(|c| c.request == request);

        if requested(ControlRequest::EmergencyStop) {
            return (VehicleState::Emergency, false);
        }
        if self.state == VehicleState::Emergency {
            let next = if requested(ControlRequest::EmergencyReset) {
                VehicleState::Parked
            } else {
                VehicleState::Emergency
            };
            return (next, false);
        }
        if self.faults.any() {
            if requested(ControlRequest::FaultAck) {
                warn!("Fault acknowledge refused, faults still active: {:?}", self.faults);
            }
            return (VehicleState::Error, false);
        }

        let mut explicit = None;
        for command in commands {
            explicit = self.evaluate_command(command, charger, rejected);
            if explicit.is_some() {
                break;
            }
        }
        if self.state == VehicleState::Driving && charger.rising {
            let _ = rejected.push(InterlockViolation::ChargeWhileDriving);
        }

        let mut escalated = false;
        for violation in rejected.iter() {
            self.monitor.record_violation(now, *violation);
            escalated |= self.interlocks.record(now);
        }
        if escalated {
            warn!("🚨 Repeated interlock violations, escalating to ERROR");
            self.monitor.record_escalation(now);
            return (VehicleState::Error, true);
        }

        let next = explicit
            .or_else(|| self.automatic(charger))
            .unwrap_or(self.state);
        (next, false)
    }

    fn evaluate_command(
        &self,
        command: &VehicleCommand,
        charger: ChargerSignal,
        rejected: &mut Vec<InterlockViolation, MAX_COMMANDS_PER_TICK>,
    ) -> Option<VehicleState> {
        let mut reject = |violation: InterlockViolation| -> Option<VehicleState> {
            let _ = rejected.push(violation);
            None
        };

        match (self.state, command.request) {
            (VehicleState::Parked, ControlRequest::PowerOn) => Some(VehicleState::Ready),
            (VehicleState::Ready, ControlRequest::PowerOff) => Some(VehicleState::Parked),
            (VehicleState::Driving, ControlRequest::PowerOff) => reject(InterlockViolation::PowerOffWhileMoving),
            (VehicleState::Error, ControlRequest::FaultAck) => Some(VehicleState::Ready),
            (VehicleState::Ready, _) if command.wants_motion() => {
                if charger.connected {
                    reject(InterlockViolation::DriveWhileCharging)
                } else if self.state_of_charge() < self.settings.min_drive_soc_percent {
                    reject(InterlockViolation::DriveBelowMinimumCharge)
                } else {
                    Some(VehicleState::Driving)
                }
            }
            (VehicleState::Charging, _) if command.accel_percent > DEMAND_EPSILON => {
                reject(InterlockViolation::DriveWhileCharging)
            }
            _ => None,
        }
    }

    fn automatic(&self, charger: ChargerSignal) -> Option<VehicleState> {
        match self.state {
            VehicleState::Parked | VehicleState::Ready if charger.wants_charge => Some(VehicleState::Charging),
            VehicleState::Driving
                if self.demand.is_zero() && self.speed_kmh() < self.settings.stationary_speed_kmh =>
            {
                Some(VehicleState::Ready)
            }
            VehicleState::Charging if !charger.wants_charge => Some(VehicleState::Ready),
            _ => None,
        }
    }

    fn enter(&mut self, next: VehicleState, now: u64) {
        let from = self.state;
        self.state = next;
        self.transitions = self.transitions.saturating_add(1);
        info!("🚗 {} → {}", from, next);

        match next {
            VehicleState::Emergency => {
                warn!("🛑 Emergency stop");
                self.monitor.record_emergency(now);
                self.demand = Demand::default();
            }
            VehicleState::Error => {
                self.demand = Demand::default();
            }
            VehicleState::Ready if from == VehicleState::Error => {
                self.monitor.acknowledge();
                self.interlocks.clear();
            }
            VehicleState::Parked if from == VehicleState::Emergency => {
                self.monitor.clear_emergency();
            }
            _ => {}
        }
    }

    /// Release the motor and disable charging ahead of shutdown.
    pub fn shutdown(&mut self) {
        info!("🔌 Shutdown in {}, releasing motor and charger", self.state);
        self.outbound = OutboundCommand::safe();
    }

    /// Restore trip counters persisted from an earlier run.
    pub fn restore_energy(&mut self, ledger: EnergyLedger) {
        self.energy = ledger;
    }

    /// Vehicle speed from motor RPM, floored to zero when crawling.
    pub fn speed_kmh(&self) -> f32 {
        let speed = self
            .motor
            .snapshot()
            .map_or(0.0, |m| m.rpm.abs() * self.settings.rpm_to_kmh);
        if speed < SPEED_FLOOR_KMH {
            0.0
        } else {
            speed
        }
    }

    fn state_of_charge(&self) -> f32 {
        self.battery.snapshot().map_or(0.0, |b| b.soc_percent)
    }

    pub fn vehicle_status(&self) -> VehicleStatus {
        VehicleStatus {
            state: self.state,
            drive_mode: self.drive_mode,
            speed_kmh: self.speed_kmh(),
            range_km: self.energy.range_km() as f32,
            motor_enable: self.outbound.motor_enable,
            charging_enable: self.outbound.charging_enable,
            faults: self.faults,
            command_rejected: self.last_rejected,
            counter: 0,
            saturated: false,
        }
    }

    pub fn state(&self) -> VehicleState {
        self.state
    }

    pub fn drive_mode(&self) -> DriveMode {
        self.drive_mode
    }

    pub fn demand(&self) -> Demand {
        self.demand
    }

    pub fn outbound(&self) -> OutboundCommand {
        self.outbound
    }

    pub fn faults(&self) -> FaultFlags {
        self.faults
    }

    pub fn energy(&self) -> &EnergyLedger {
        &self.energy
    }

    pub fn battery(&self) -> &Polled<BatterySnapshot> {
        &self.battery
    }

    pub fn motor(&self) -> &Polled<MotorSnapshot> {
        &self.motor
    }

    pub fn charging(&self) -> &Polled<ChargingSnapshot> {
        &self.charging
    }

    pub fn safety_level(&self) -> SafetyLevel {
        self.monitor.level()
    }

    pub fn event_history(&self) -> &[SafetyEventRecord] {
        self.monitor.event_history()
    }

    pub fn fault_log(&self) -> &FaultLog {
        self.monitor.fault_log()
    }

    pub fn transitions(&self) -> u32 {
        self.transitions
    }

    /// Every interlock violation counts, including a charger connected
    /// while driving.
    pub fn rejected_total(&self) -> u32 {
        self.interlocks.total()
    }

    /// Seconds until the charge target at the present charging power; only
    /// while `Charging`.
    pub fn time_to_full_s(&self) -> Option<f64> {
        self.time_to_full_s
    }

    pub fn active_safety_events(&self) -> usize {
        self.monitor.active_events()
    }
}
