use crate::energy::EnergyLedger;
use crate::protocol::ProtocolStats;
use crate::safety::{FaultFlags, SafetyLevel};
use crate::scheduler::call_blocking;
use crate::subsystems::{BatterySnapshot, ChargingSnapshot, DriverError, MotorSnapshot, Polled};
use crate::thermal::{TemperatureStatus, ThermalReport};
use crate::vehicle::{Demand, DriveMode, OutboundCommand, VehicleState, VehicleStateMachine};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ThermalSummary {
    pub battery: TemperatureStatus,
    pub motor: TemperatureStatus,
    pub charging: TemperatureStatus,
    pub faulted_sensors: u8,
}

impl From<&ThermalReport> for ThermalSummary {
    fn from(report: &ThermalReport) -> Self {
        Self {
            battery: report.battery,
            motor: report.motor,
            charging: report.charging,
            faulted_sensors: report.faulted_sensors,
        }
    }
}

/// Read-only view of the vehicle after one coordination tick.
#[derive(Debug, Clone, Serialize)]
pub struct VehicleReport {
    pub timestamp: u64,
    pub sequence: u32,
    pub state: VehicleState,
    pub drive_mode: DriveMode,
    pub speed_kmh: f32,
    pub demand: Demand,
    pub outbound: OutboundCommand,
    pub faults: FaultFlags,
    pub safety_level: SafetyLevel,
    pub active_safety_events: usize,
    pub battery: Polled<BatterySnapshot>,
    pub motor: Polled<MotorSnapshot>,
    pub charging: Polled<ChargingSnapshot>,
    pub temperatures: ThermalSummary,
    pub energy: EnergyLedger,
    pub time_to_full_s: Option<f64>,
    pub protocol: ProtocolStats,
    pub transitions: u32,
    pub rejected_commands: u32,
}

impl VehicleReport {
    pub fn capture(
        vehicle: &VehicleStateMachine,
        thermal: &ThermalReport,
        protocol: &ProtocolStats,
        timestamp: u64,
        sequence: u32,
    ) -> Self {
        Self {
            timestamp,
            sequence,
            state: vehicle.state(),
            drive_mode: vehicle.drive_mode(),
            speed_kmh: vehicle.speed_kmh(),
            demand: vehicle.demand(),
            outbound: vehicle.outbound(),
            faults: vehicle.faults(),
            safety_level: vehicle.safety_level(),
            active_safety_events: vehicle.active_safety_events(),
            battery: vehicle.battery().clone(),
            motor: vehicle.motor().clone(),
            charging: vehicle.charging().clone(),
            temperatures: thermal.into(),
            energy: vehicle.energy().clone(),
            time_to_full_s: vehicle.time_to_full_s(),
            protocol: protocol.clone(),
            transitions: vehicle.transitions(),
            rejected_commands: vehicle.rejected_total(),
        }
    }
}

/// Latest-value fan-out of [`VehicleReport`]s. Slow readers only ever see
/// the newest report.
#[derive(Debug)]
pub struct ReportPublisher {
    tx: watch::Sender<Option<VehicleReport>>,
    sequence: u32,
}

impl ReportPublisher {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx, sequence: 0 }
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<VehicleReport>> {
        self.tx.subscribe()
    }

    pub fn publish(
        &mut self,
        vehicle: &VehicleStateMachine,
        thermal: &ThermalReport,
        protocol: &ProtocolStats,
        timestamp: u64,
    ) {
        self.sequence = self.sequence.wrapping_add(1);
        let report = VehicleReport::capture(vehicle, thermal, protocol, timestamp, self.sequence);
        self.tx.send_replace(Some(report));
    }
}

impl Default for ReportPublisher {
    fn default() -> Self {
        Self::new()
    }
}

/// Destination for serialized reports, e.g. a cellular modem.
pub trait TelemetrySink: Send {
    fn publish(&mut self, payload: &str) -> Result<(), DriverError>;
}

/// Keeps every published payload in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    payloads: Arc<Mutex<Vec<String>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn payloads(&self) -> Vec<String> {
        self.payloads.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

impl TelemetrySink for MemorySink {
    fn publish(&mut self, payload: &str) -> Result<(), DriverError> {
        self.payloads
            .lock()
            .map_err(|_| DriverError::Poisoned)?
            .push(payload.to_owned());
        Ok(())
    }
}

/// Forward the latest report to `sink` every `interval`, serialized as JSON.
///
/// A report is sent at most once. Sink failures are logged and the next
/// interval tries again with whatever is newest then.
pub fn spawn_uplink(
    mut reports: watch::Receiver<Option<VehicleReport>>,
    sink: Box<dyn TelemetrySink>,
    interval: Duration,
    timeout: Duration,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let sink = Arc::new(Mutex::new(sink));

    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_sent = None;
        let (mut sent, mut failed) = (0_u32, 0_u32);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = stop.changed() => break,
            }

            let Some(report) = reports.borrow_and_update().clone() else {
                continue;
            };
            if last_sent == Some(report.sequence) {
                continue;
            }

            let payload = match serde_json::to_string(&report) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!("Failed to serialize report {}: {}", report.sequence, e);
                    continue;
                }
            };

            match call_blocking(&sink, timeout, move |sink| sink.publish(&payload)).await {
                Ok(()) => {
                    last_sent = Some(report.sequence);
                    sent = sent.saturating_add(1);
                    debug!("📡 Uplinked report {}", report.sequence);
                }
                Err(e) => {
                    failed = failed.saturating_add(1);
                    warn!("⚠️  Uplink failed: {}", e);
                }
            }
        }

        info!("📡 Uplink stopped ({} sent, {} failed)", sent, failed);
    })
}
