use super::{Clock, DriverError, Snapshot};
use crate::bus::BusTransport;
use crate::protocol::{self, ids, Message};
use heapless::Vec;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const MAX_STATOR_SENSORS: usize = 4;
const MAX_FRAMES_PER_READ: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotorSnapshot {
    pub rpm: f32,
    pub current_a: f32,
    pub duty_cycle: f32,
    pub stator_temps_c: Vec<f32, MAX_STATOR_SENSORS>,
    pub fault: bool,
    pub captured_at_ms: u64,
}

impl MotorSnapshot {
    pub fn max_stator_temp_c(&self) -> Option<f32> {
        self.stator_temps_c
            .iter()
            .copied()
            .fold(None, |max, t| Some(max.map_or(t, |m: f32| m.max(t))))
    }
}

impl Snapshot for MotorSnapshot {
    fn reports_fault(&self) -> bool {
        self.fault
    }

    fn captured_at_ms(&self) -> u64 {
        self.captured_at_ms
    }
}

/// Setpoint handed to the motor controller.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum MotorCommand {
    /// Zero torque; the controller freewheels.
    Release,
    Duty(f32),
    Current(f32),
    Brake(f32),
}

pub trait MotorDriver: Send {
    fn read_motor(&mut self) -> Result<MotorSnapshot, DriverError>;
    fn send_motor_command(&mut self, command: MotorCommand) -> Result<(), DriverError>;
}

/// Motor driver for VESC controllers reachable over a bus transport.
///
/// Reads the periodic status frame the controller broadcasts and writes
/// setpoints as VESC command frames. Stator temperatures come from the
/// temperature sources, not from this driver.
pub struct VescMotor<B> {
    bus: B,
    clock: Clock,
}

impl<B: BusTransport> VescMotor<B> {
    pub fn new(bus: B, clock: Clock) -> Self {
        Self { bus, clock }
    }
}

impl<B: BusTransport> MotorDriver for VescMotor<B> {
    fn read_motor(&mut self) -> Result<MotorSnapshot, DriverError> {
        let mut latest = None;
        for _ in 0..MAX_FRAMES_PER_READ {
            let Some(frame) = self.bus.receive()? else {
                break;
            };
            if frame.id != ids::VESC_STATUS {
                debug!("VESC driver ignoring frame 0x{:03X}", frame.id);
                continue;
            }
            match protocol::decode(&frame) {
                Ok(Message::VescStatus(status)) => latest = Some(status),
                Ok(_) => {}
                Err(e) => warn!("Dropping VESC status frame: {}", e),
            }
        }

        let status = latest.ok_or(DriverError::NoData)?;
        Ok(MotorSnapshot {
            rpm: status.rpm as f32,
            current_a: status.current_a,
            duty_cycle: status.duty_cycle,
            stator_temps_c: Vec::new(),
            fault: false,
            captured_at_ms: self.clock.now_ms(),
        })
    }

    fn send_motor_command(&mut self, command: MotorCommand) -> Result<(), DriverError> {
        let encoded = protocol::encode_motor_command(command);
        if !encoded.saturated.is_empty() {
            warn!("VESC setpoint {:?} saturated: {:?}", command, encoded.saturated);
        }
        self.bus.send(&encoded.frame)
    }
}
