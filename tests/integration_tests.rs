use evbus::energy::EnergyLedger;
use evbus::protocol::{decode, encode_command, ids, Frame, Message};
use evbus::sim::SimDevice;
use evbus::subsystems::{
    ChargingDriver, ChargingSnapshot, Clock, ConnectorType, DriverError, MotorCommand, SubsystemId,
};
use evbus::telemetry::MemorySink;
use evbus::thermal::{SensorRole, TemperatureStatus};
use evbus::vehicle::{ControlRequest, VehicleCommand, VehicleState};
use evbus::{
    CoreConfig, Drivers, LoopbackBus, RunSummary, Scheduler, SchedulerError, SimulatedVehicle, VehicleReport,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;

const WAIT: Duration = Duration::from_secs(5);

fn fast_config() -> CoreConfig {
    let mut config = CoreConfig::default();
    config.scheduler.tick_period_ms = 40;
    config.scheduler.driver_timeout_ms = 30;
    config.scheduler.telemetry_interval_ms = 50;
    config
}

/// A running scheduler wired to a simulated vehicle over a loopback bus.
struct Harness {
    sim: SimulatedVehicle,
    bus: LoopbackBus,
    reports: watch::Receiver<Option<VehicleReport>>,
    shutdown: watch::Sender<bool>,
    run: JoinHandle<Result<RunSummary, SchedulerError>>,
}

impl Harness {
    fn start(config: CoreConfig) -> Self {
        Self::start_with(config, |scheduler| scheduler)
    }

    fn start_with(config: CoreConfig, customize: impl FnOnce(Scheduler) -> Scheduler) -> Self {
        Self::start_wired(config, |drivers| drivers, customize)
    }

    /// Like `start_with`, but `wire` may wrap the simulated drivers first.
    fn start_wired(
        config: CoreConfig,
        wire: impl FnOnce(Drivers) -> Drivers,
        customize: impl FnOnce(Scheduler) -> Scheduler,
    ) -> Self {
        let clock = Clock::new();
        let sim = SimulatedVehicle::new(clock);
        let bus = LoopbackBus::new();
        let drivers = wire(sim.drivers(Box::new(bus.clone())));
        let scheduler = Scheduler::new(config, drivers).unwrap().with_clock(clock);
        let scheduler = customize(scheduler);

        let reports = scheduler.reports();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let run = tokio::spawn(scheduler.run(shutdown_rx));

        Self { sim, bus, reports, shutdown, run }
    }

    fn send(&self, command: VehicleCommand) {
        self.bus.inject(encode_command(&command).frame);
    }

    fn request(&self, request: ControlRequest) {
        self.send(VehicleCommand::request(request));
    }

    async fn wait_for(&mut self, what: &str, check: impl Fn(&VehicleReport) -> bool) -> VehicleReport {
        let deadline = time::Instant::now() + WAIT;
        loop {
            let latest = self.reports.borrow_and_update().clone();
            if let Some(report) = latest {
                if check(&report) {
                    return report;
                }
            }
            match time::timeout_at(deadline, self.reports.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => panic!("report channel closed waiting for {}", what),
                Err(_) => panic!("timed out waiting for {}", what),
            }
        }
    }

    async fn wait_for_state(&mut self, state: VehicleState) -> VehicleReport {
        self.wait_for(state.name(), |r| r.state == state).await
    }

    /// Let `ticks` more reports go by and return the last one.
    async fn settle(&mut self, ticks: u32) -> VehicleReport {
        let start = self.wait_for("first report", |_| true).await.sequence;
        self.wait_for("settle", |r| r.sequence >= start + ticks).await
    }

    async fn stop(self) -> (RunSummary, SimulatedVehicle, LoopbackBus) {
        self.shutdown.send(true).unwrap();
        let summary = time::timeout(WAIT, self.run).await.unwrap().unwrap().unwrap();
        (summary, self.sim, self.bus)
    }
}

/// Charging driver whose contactor refuses to open while `stuck` is above
/// zero; each refusal counts it down.
struct StickyContactor {
    inner: Box<dyn ChargingDriver>,
    stuck: Arc<AtomicU32>,
}

impl ChargingDriver for StickyContactor {
    fn read_charging(&mut self) -> Result<ChargingSnapshot, DriverError> {
        self.inner.read_charging()
    }

    fn set_charging_enabled(&mut self, enabled: bool) -> Result<(), DriverError> {
        let refused = !enabled
            && self
                .stuck
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
        if refused {
            return Err(DriverError::Io("contactor did not open".into()));
        }
        self.inner.set_charging_enabled(enabled)
    }
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = time::Instant::now() + WAIT;
    while !check() {
        assert!(time::Instant::now() < deadline, "timed out waiting for {}", what);
        time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_drive_cycle() {
    let mut h = Harness::start(fast_config());
    h.wait_for_state(VehicleState::Parked).await;

    h.request(ControlRequest::PowerOn);
    h.wait_for_state(VehicleState::Ready).await;

    h.send(VehicleCommand::accelerate(40.0));
    let report = h.wait_for_state(VehicleState::Driving).await;
    assert!(report.outbound.motor_enable());
    assert!(!report.outbound.charging_enable());

    let sim = h.sim.clone();
    eventually("motor spinning", || sim.rpm().unwrap_or(0.0) > 50.0).await;
    assert_eq!(h.sim.motor_command(), Some(MotorCommand::Duty(0.4)));
    h.wait_for("speed reported", |r| r.speed_kmh > 1.0).await;

    h.send(VehicleCommand::brake(100.0));
    eventually("motor stopped", || sim.rpm() == Some(0.0)).await;

    h.send(VehicleCommand::coast());
    let report = h.wait_for_state(VehicleState::Ready).await;
    assert!(!report.outbound.motor_enable());
    assert!(report.energy.distance_km() > 0.0);

    let (summary, sim, _) = h.stop().await;
    assert_eq!(summary.final_state, VehicleState::Ready);
    assert!(summary.transitions >= 3);
    assert!(summary.ticks > 0);
    assert!(summary.energy.distance_km() > 0.0);
    assert_eq!(sim.motor_command(), Some(MotorCommand::Release));
}

#[tokio::test]
async fn test_charging_blocks_drive() {
    let mut h = Harness::start(fast_config());
    h.sim.plug_in(ConnectorType::Ccs2);

    let report = h.wait_for_state(VehicleState::Charging).await;
    assert!(!report.outbound.motor_enable());
    let sim = h.sim.clone();
    eventually("charger enabled", || sim.charging_enabled()).await;
    let report = h
        .wait_for("charge estimate", |r| r.time_to_full_s.is_some_and(|s| s > 0.0))
        .await;
    assert_eq!(report.state, VehicleState::Charging);

    h.send(VehicleCommand::accelerate(30.0));
    let report = h.wait_for("rejected drive", |r| r.rejected_commands >= 1).await;
    assert_eq!(report.state, VehicleState::Charging);
    assert!(!matches!(h.sim.motor_command(), Some(MotorCommand::Duty(_))));

    h.sim.unplug();
    h.wait_for_state(VehicleState::Ready).await;
    eventually("charger disabled", || !sim.charging_enabled()).await;

    let (summary, _, _) = h.stop().await;
    assert_eq!(summary.rejected_commands, 1);
}

#[tokio::test]
async fn test_emergency_stop_over_bus() {
    let mut h = Harness::start(fast_config());
    h.request(ControlRequest::PowerOn);
    h.wait_for_state(VehicleState::Ready).await;
    h.send(VehicleCommand::accelerate(50.0));
    h.wait_for_state(VehicleState::Driving).await;

    h.request(ControlRequest::EmergencyStop);
    let report = h.wait_for_state(VehicleState::Emergency).await;
    assert!(!report.outbound.motor_enable());
    let sim = h.sim.clone();
    eventually("motor released", || sim.motor_command() == Some(MotorCommand::Release)).await;

    h.request(ControlRequest::PowerOn);
    h.send(VehicleCommand::accelerate(50.0));
    let report = h.settle(5).await;
    assert_eq!(report.state, VehicleState::Emergency);

    h.request(ControlRequest::EmergencyReset);
    h.wait_for_state(VehicleState::Parked).await;
    h.stop().await;
}

#[tokio::test]
async fn test_driver_fault_requires_acknowledge() {
    let mut h = Harness::start(fast_config());
    h.request(ControlRequest::PowerOn);
    h.wait_for_state(VehicleState::Ready).await;

    h.sim.inject_fault(SubsystemId::Battery, true);
    let report = h.wait_for_state(VehicleState::Error).await;
    assert!(report.faults.battery);
    assert!(report.active_safety_events >= 1);

    h.request(ControlRequest::FaultAck);
    let report = h.settle(3).await;
    assert_eq!(report.state, VehicleState::Error);

    h.sim.inject_fault(SubsystemId::Battery, false);
    h.wait_for("fault cleared", |r| !r.faults.any()).await;
    let report = h.settle(3).await;
    assert_eq!(report.state, VehicleState::Error);

    h.request(ControlRequest::FaultAck);
    let report = h.wait_for_state(VehicleState::Ready).await;
    assert_eq!(report.active_safety_events, 0);
    h.stop().await;
}

#[tokio::test]
async fn test_offline_driver_goes_stale_then_faults() {
    let mut config = fast_config();
    config.staleness.snapshot_ms = 300;
    let mut h = Harness::start(config);
    h.request(ControlRequest::PowerOn);
    h.wait_for_state(VehicleState::Ready).await;

    h.sim.set_offline(SimDevice::Motor, true);
    let report = h.wait_for("stale motor", |r| r.motor.stale).await;
    assert!(report.motor.snapshot.is_some());

    let report = h.wait_for_state(VehicleState::Error).await;
    assert!(report.faults.motor);
    assert!(report.motor.consecutive_failures > 0);

    h.sim.set_offline(SimDevice::Motor, false);
    h.wait_for("motor back", |r| !r.motor.stale && !r.faults.any()).await;

    let (summary, _, _) = h.stop().await;
    assert!(summary.driver_failures > 0);
}

#[tokio::test]
async fn test_temperature_warning_and_fault() {
    let mut h = Harness::start(fast_config());
    h.request(ControlRequest::PowerOn);
    h.wait_for_state(VehicleState::Ready).await;

    h.sim.force_temperature(SensorRole::cell_group(1), Some(45.0));
    let report = h
        .wait_for("battery warning", |r| r.temperatures.battery == TemperatureStatus::Warning)
        .await;
    assert_eq!(report.state, VehicleState::Ready);

    h.sim.force_temperature(SensorRole::cell_group(1), Some(60.0));
    let report = h.wait_for_state(VehicleState::Error).await;
    assert!(report.faults.battery);
    assert_eq!(report.temperatures.faulted_sensors, 1);
    h.stop().await;
}

#[tokio::test]
async fn test_silent_sensor_faults_after_staleness() {
    let mut config = fast_config();
    config.staleness.temperature_ms = 300;
    let mut h = Harness::start(config);
    h.request(ControlRequest::PowerOn);
    h.wait_for_state(VehicleState::Ready).await;

    h.sim.silence_sensor(SensorRole::stator(0), true);
    let report = h.wait_for_state(VehicleState::Error).await;
    assert!(report.faults.motor);
    assert_eq!(report.temperatures.motor, TemperatureStatus::Fault);
    h.stop().await;
}

#[tokio::test]
async fn test_bad_frames_are_counted_and_skipped() {
    let mut h = Harness::start(fast_config());
    h.bus.inject(Frame::new(0x123, &[1, 2]).unwrap());
    h.bus.inject(Frame::new(ids::VEHICLE_COMMAND, &[0, 0]).unwrap());
    h.bus.inject(Frame::new(ids::VEHICLE_COMMAND, &[0, 0, 0xFF, 42]).unwrap());
    h.request(ControlRequest::PowerOn);

    let report = h.wait_for_state(VehicleState::Ready).await;
    assert_eq!(report.protocol.unknown_identifier, 1);
    assert_eq!(report.protocol.malformed, 1);
    assert_eq!(report.protocol.invalid_field, 1);
    h.stop().await;
}

#[tokio::test]
async fn test_shutdown_leaves_vehicle_safe() {
    let mut h = Harness::start(fast_config());
    h.request(ControlRequest::PowerOn);
    h.wait_for_state(VehicleState::Ready).await;
    h.send(VehicleCommand::accelerate(30.0));
    h.wait_for_state(VehicleState::Driving).await;
    let sim = h.sim.clone();
    eventually("motor driven", || matches!(sim.motor_command(), Some(MotorCommand::Duty(_)))).await;

    let (summary, sim, bus) = h.stop().await;
    assert_eq!(summary.final_state, VehicleState::Driving);
    assert_eq!(sim.motor_command(), Some(MotorCommand::Release));
    assert!(!sim.charging_enabled());

    let sent = bus.take_sent();
    let last = decode(sent.last().unwrap()).unwrap();
    assert_eq!(last, Message::VescSetCurrent(0.0));

    let final_status = sent
        .iter()
        .rev()
        .find_map(|frame| match decode(frame) {
            Ok(Message::VehicleStatus(status)) => Some(status),
            _ => None,
        })
        .unwrap();
    assert!(!final_status.motor_enable);
    assert!(!final_status.charging_enable);
}

#[tokio::test]
async fn test_status_frames_published_every_tick() {
    let mut h = Harness::start(fast_config());
    h.settle(5).await;

    let (summary, _, bus) = h.stop().await;
    let counters: Vec<u8> = bus
        .take_sent()
        .iter()
        .filter_map(|frame| match decode(frame) {
            Ok(Message::VehicleStatus(status)) => Some(status.counter),
            _ => None,
        })
        .collect();

    // One per tick plus the final frame
    assert_eq!(counters.len() as u64, summary.ticks + 1);
    assert!(counters.windows(2).all(|w| w[1] == w[0].wrapping_add(1)));
    assert!(summary.protocol.frames_encoded > 0);
}

#[tokio::test]
async fn test_uplink_receives_json_reports() {
    let sink = MemorySink::new();
    let uplink = sink.clone();
    let mut h = Harness::start_with(fast_config(), move |scheduler| scheduler.with_uplink(Box::new(uplink)));

    h.settle(8).await;
    h.stop().await;

    let payloads = sink.payloads();
    assert!(!payloads.is_empty());
    let report: serde_json::Value = serde_json::from_str(&payloads[0]).unwrap();
    assert_eq!(report["state"], "Parked");
    assert!(report["sequence"].as_u64().unwrap() >= 1);
}

#[tokio::test]
async fn test_restored_energy_carries_over() {
    let mut ledger = EnergyLedger::new();
    for _ in 0..60 {
        ledger.integrate(1_000, 90.0, 18.0);
    }
    let distance = ledger.distance_km();

    let mut h = Harness::start_with(fast_config(), move |scheduler| scheduler.with_energy(ledger));
    let report = h.wait_for("first report", |_| true).await;
    assert!((report.energy.distance_km() - distance).abs() < 1e-9);

    let (summary, _, _) = h.stop().await;
    assert!((summary.energy.distance_km() - distance).abs() < 1e-9);
}

#[tokio::test]
async fn test_failed_charger_disable_is_retried() {
    let stuck = Arc::new(AtomicU32::new(0));
    let contactor = Arc::clone(&stuck);
    let mut h = Harness::start_wired(
        fast_config(),
        move |drivers| Drivers {
            charging: Box::new(StickyContactor {
                inner: drivers.charging,
                stuck: contactor,
            }),
            ..drivers
        },
        |scheduler| scheduler,
    );

    h.sim.plug_in(ConnectorType::Type2);
    h.wait_for_state(VehicleState::Charging).await;
    let sim = h.sim.clone();
    eventually("charger enabled", || sim.charging_enabled()).await;

    stuck.store(1, Ordering::SeqCst);
    h.sim.inject_fault(SubsystemId::Charging, true);
    let report = h.wait_for_state(VehicleState::Error).await;
    assert!(!report.outbound.charging_enable());

    // The first disable is refused; the next attempt opens the contactor
    eventually("charger disabled", || !sim.charging_enabled()).await;
    assert_eq!(stuck.load(Ordering::SeqCst), 0);
    let report = h.settle(2).await;
    assert_eq!(report.state, VehicleState::Error);

    let (summary, _, _) = h.stop().await;
    assert!(summary.driver_failures >= 1);
}

#[tokio::test]
async fn test_stale_stator_while_driving_releases_motor() {
    let mut config = fast_config();
    config.staleness.temperature_ms = 300;
    let mut h = Harness::start(config);
    h.request(ControlRequest::PowerOn);
    h.wait_for_state(VehicleState::Ready).await;
    h.send(VehicleCommand::accelerate(30.0));
    h.wait_for_state(VehicleState::Driving).await;
    let sim = h.sim.clone();
    eventually("motor driven", || matches!(sim.motor_command(), Some(MotorCommand::Duty(_)))).await;

    h.sim.silence_sensor(SensorRole::stator(1), true);
    let report = h.wait_for_state(VehicleState::Error).await;
    assert!(report.faults.motor);
    assert!(!report.outbound.motor_enable());
    assert_eq!(report.outbound.motor(), MotorCommand::Release);
    eventually("motor released", || sim.motor_command() == Some(MotorCommand::Release)).await;
    h.stop().await;
}
