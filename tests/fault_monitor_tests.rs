use evbus::fault::FaultCause;
use evbus::safety::*;
use evbus::subsystems::*;
use evbus::thermal::{TemperatureStatus, ThermalReport};
use heapless::Vec;

const STALENESS_MS: u64 = 1_000;

fn battery(fault: bool, captured_at_ms: u64) -> BatterySnapshot {
    BatterySnapshot {
        soc_percent: 60.0,
        soh_percent: 100.0,
        pack_voltage_v: 390.0,
        pack_current_a: 10.0,
        cell_group_temps_c: Vec::new(),
        fault,
        captured_at_ms,
    }
}

fn motor(captured_at_ms: u64) -> MotorSnapshot {
    MotorSnapshot {
        rpm: 0.0,
        current_a: 0.0,
        duty_cycle: 0.0,
        stator_temps_c: Vec::new(),
        fault: false,
        captured_at_ms,
    }
}

fn charging(captured_at_ms: u64) -> ChargingSnapshot {
    ChargingSnapshot {
        connector: ConnectorType::Type2,
        port_temp_c: 20.0,
        connector_temp_c: 20.0,
        connected: false,
        active: false,
        complete: false,
        power_kw: 0.0,
        fault: false,
        captured_at_ms,
    }
}

struct Inputs {
    battery: Polled<BatterySnapshot>,
    motor: Polled<MotorSnapshot>,
    charging: Polled<ChargingSnapshot>,
    thermal: ThermalReport,
}

impl Inputs {
    fn healthy(now: u64) -> Self {
        Self {
            battery: Polled::fresh(battery(false, now), now),
            motor: Polled::fresh(motor(now), now),
            charging: Polled::fresh(charging(now), now),
            thermal: ThermalReport::default(),
        }
    }

    fn assess(&self, monitor: &mut FaultMonitor, now: u64) -> FaultFlags {
        monitor.assess(now, &self.battery, &self.motor, &self.charging, &self.thermal)
    }
}

fn unresolved(monitor: &FaultMonitor, event: SafetyEvent) -> usize {
    monitor
        .event_history()
        .iter()
        .filter(|record| record.event == event && !record.resolved)
        .count()
}

#[test]
fn test_healthy_inputs_raise_nothing() {
    let mut monitor = FaultMonitor::new(STALENESS_MS);
    let flags = Inputs::healthy(100).assess(&mut monitor, 100);

    assert!(!flags.any());
    assert_eq!(monitor.level(), SafetyLevel::Normal);
    assert_eq!(monitor.active_events(), 0);
    assert!(monitor.fault_log().history().is_empty());
}

#[test]
fn test_reported_fault_opens_and_closes_episode() {
    let mut monitor = FaultMonitor::new(STALENESS_MS);
    let mut inputs = Inputs::healthy(100);
    inputs.battery = Polled::fresh(battery(true, 100), 100);

    let flags = inputs.assess(&mut monitor, 100);
    assert!(flags.battery);
    assert!(!flags.motor && !flags.charging);
    assert_eq!(monitor.level(), SafetyLevel::Critical);
    assert_eq!(unresolved(&monitor, SafetyEvent::DriverFault), 1);

    // Still faulted: same episode, same event
    inputs.assess(&mut monitor, 200);
    assert_eq!(monitor.fault_log().total_opened(), 1);
    assert_eq!(unresolved(&monitor, SafetyEvent::DriverFault), 1);

    inputs.battery = Polled::fresh(battery(false, 700), 700);
    let flags = inputs.assess(&mut monitor, 700);
    assert!(!flags.any());
    assert_eq!(monitor.level(), SafetyLevel::Normal);

    let episode = &monitor.fault_log().history()[0];
    assert_eq!(episode.subsystem, SubsystemId::Battery);
    assert_eq!(episode.cause, FaultCause::Reported);
    assert!(episode.resolved);
    assert_eq!(episode.duration_ms, 600);
}

#[test]
fn test_stale_within_window_is_only_caution() {
    let mut monitor = FaultMonitor::new(STALENESS_MS);
    let mut inputs = Inputs::healthy(1_000);
    inputs.motor.record_failure();

    let flags = inputs.assess(&mut monitor, 1_500);
    assert!(!flags.motor);
    assert_eq!(monitor.level(), SafetyLevel::Caution);
    assert_eq!(unresolved(&monitor, SafetyEvent::SnapshotStale), 1);
}

#[test]
fn test_expired_snapshot_is_fault() {
    let mut monitor = FaultMonitor::new(STALENESS_MS);
    let mut inputs = Inputs::healthy(2_000);
    inputs.motor = Polled::fresh(motor(1_000), 1_000);
    inputs.motor.record_failure();

    let flags = inputs.assess(&mut monitor, 2_001);
    assert!(flags.motor);
    assert_eq!(monitor.fault_log().history()[0].cause, FaultCause::Stale);

    // A good poll clears it on the next assessment
    inputs.motor.update(motor(2_050), 2_050);
    let flags = inputs.assess(&mut monitor, 2_100);
    assert!(!flags.motor);
    assert_eq!(unresolved(&monitor, SafetyEvent::SnapshotStale), 0);
}

#[test]
fn test_cached_snapshot_faults_by_capture_time() {
    let mut monitor = FaultMonitor::new(STALENESS_MS);
    let mut inputs = Inputs::healthy(1_500);
    // Polled just now, but the driver handed back a reading taken at 100
    inputs.motor = Polled::fresh(motor(100), 1_500);

    let flags = inputs.assess(&mut monitor, 1_500);
    assert!(flags.motor);
    assert!(!flags.battery && !flags.charging);
    assert_eq!(monitor.fault_log().history()[0].cause, FaultCause::Stale);
    assert_eq!(unresolved(&monitor, SafetyEvent::SnapshotStale), 1);

    inputs.motor = Polled::fresh(motor(1_550), 1_600);
    assert!(!inputs.assess(&mut monitor, 1_600).motor);
}

#[test]
fn test_never_polled_subsystem_faults_after_window() {
    let mut monitor = FaultMonitor::new(STALENESS_MS);
    let mut inputs = Inputs::healthy(1_400);
    inputs.charging = Polled::empty(0);

    assert!(!inputs.assess(&mut monitor, 500).charging);

    let flags = inputs.assess(&mut monitor, 1_500);
    assert!(flags.charging);
    assert_eq!(unresolved(&monitor, SafetyEvent::SnapshotMissing), 1);
    assert_eq!(monitor.fault_log().history()[0].cause, FaultCause::NoSnapshot);
}

#[test]
fn test_temperature_status_feeds_flags() {
    let mut monitor = FaultMonitor::new(STALENESS_MS);
    let mut inputs = Inputs::healthy(100);

    inputs.thermal.charging = TemperatureStatus::Warning;
    let flags = inputs.assess(&mut monitor, 100);
    assert!(!flags.charging);
    assert_eq!(monitor.level(), SafetyLevel::Warning);

    inputs.thermal.charging = TemperatureStatus::Fault;
    let flags = inputs.assess(&mut monitor, 200);
    assert!(flags.charging);
    assert_eq!(monitor.fault_log().history()[0].cause, FaultCause::Temperature);

    inputs.thermal.charging = TemperatureStatus::Normal;
    assert!(!inputs.assess(&mut monitor, 300).any());
    assert_eq!(monitor.level(), SafetyLevel::Normal);
}

#[test]
fn test_violations_resolve_on_acknowledge() {
    let mut monitor = FaultMonitor::new(STALENESS_MS);
    monitor.record_violation(100, InterlockViolation::DriveWhileCharging);
    assert_eq!(monitor.level(), SafetyLevel::Caution);

    monitor.record_escalation(200);
    assert_eq!(monitor.level(), SafetyLevel::Critical);

    // Healthy assessments do not resolve operator-facing events
    Inputs::healthy(300).assess(&mut monitor, 300);
    assert_eq!(monitor.level(), SafetyLevel::Critical);

    monitor.acknowledge();
    assert_eq!(monitor.level(), SafetyLevel::Normal);
    assert_eq!(monitor.active_events(), 0);
}

#[test]
fn test_emergency_level_until_cleared() {
    let mut monitor = FaultMonitor::new(STALENESS_MS);
    monitor.record_emergency(100);
    assert_eq!(monitor.level(), SafetyLevel::Emergency);

    monitor.acknowledge();
    assert_eq!(monitor.level(), SafetyLevel::Emergency);

    monitor.clear_emergency();
    assert_eq!(monitor.level(), SafetyLevel::Normal);
    assert_eq!(unresolved(&monitor, SafetyEvent::EmergencyStop), 0);
}

#[test]
fn test_repeated_events_are_deduplicated() {
    let mut monitor = FaultMonitor::new(STALENESS_MS);
    for now in [100, 200, 300] {
        monitor.record_violation(now, InterlockViolation::PowerOffWhileMoving);
    }

    let records: std::vec::Vec<_> = monitor
        .event_history()
        .iter()
        .filter(|r| r.event == SafetyEvent::InterlockViolation)
        .collect();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].timestamp, 300);
}

#[test]
fn test_interlock_threshold_of_one_escalates_immediately() {
    let mut monitor = InterlockMonitor::new(1_000, 1);
    assert!(monitor.record(0));
    assert!(monitor.record(10));
    assert_eq!(monitor.total(), 2);
}

#[test]
fn test_interlock_window_restarts_after_escalation() {
    let mut monitor = InterlockMonitor::new(10_000, 2);
    assert!(!monitor.record(0));
    assert!(monitor.record(1));
    assert!(!monitor.record(2));
    assert_eq!(monitor.recent_count(), 1);

    monitor.clear();
    assert_eq!(monitor.recent_count(), 0);
    assert_eq!(monitor.total(), 3);
}
