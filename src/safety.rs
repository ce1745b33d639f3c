use crate::fault::{FaultCause, FaultLog};
use crate::subsystems::{BatterySnapshot, ChargingSnapshot, MotorSnapshot, Polled, Snapshot, SubsystemId};
use crate::thermal::{TemperatureStatus, ThermalReport};
use heapless::{Deque, Vec};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

const MAX_SAFETY_EVENTS: usize = 32;
const MAX_OBSERVED_CONDITIONS: usize = 16;

/// Upper bound on the interlock escalation threshold.
pub const MAX_TRACKED_VIOLATIONS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SafetyLevel {
    Normal,
    Caution,
    Warning,
    Critical,
    Emergency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SafetyEvent {
    DriverFault,
    SnapshotStale,
    SnapshotMissing,
    TemperatureWarning,
    TemperatureFault,
    InterlockViolation,
    InterlockEscalation,
    EmergencyStop,
}

impl SafetyEvent {
    /// Conditions are re-evaluated every tick and resolve on their own.
    /// The rest resolve only on acknowledge or reset.
    const fn is_condition(self) -> bool {
        matches!(
            self,
            SafetyEvent::DriverFault
                | SafetyEvent::SnapshotStale
                | SafetyEvent::SnapshotMissing
                | SafetyEvent::TemperatureWarning
                | SafetyEvent::TemperatureFault
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyEventRecord {
    pub event: SafetyEvent,
    pub timestamp: u64,
    pub level: SafetyLevel,
    pub subsystem: Option<SubsystemId>,
    pub resolved: bool,
}

/// A command refused because it conflicts with a safety rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum InterlockViolation {
    #[error("drive requested while charger is connected")]
    DriveWhileCharging,
    #[error("charger connected while driving")]
    ChargeWhileDriving,
    #[error("drive requested below minimum state of charge")]
    DriveBelowMinimumCharge,
    #[error("power off requested while driving")]
    PowerOffWhileMoving,
}

/// Per-subsystem aggregate fault flags consumed by the state machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultFlags {
    pub battery: bool,
    pub motor: bool,
    pub charging: bool,
}

impl FaultFlags {
    pub fn any(&self) -> bool {
        self.battery || self.motor || self.charging
    }

    pub fn get(&self, subsystem: SubsystemId) -> bool {
        match subsystem {
            SubsystemId::Battery => self.battery,
            SubsystemId::Motor => self.motor,
            SubsystemId::Charging => self.charging,
        }
    }

    fn set(&mut self, subsystem: SubsystemId, value: bool) {
        match subsystem {
            SubsystemId::Battery => self.battery = value,
            SubsystemId::Motor => self.motor = value,
            SubsystemId::Charging => self.charging = value,
        }
    }
}

type Observed = Vec<(SafetyEvent, SubsystemId), MAX_OBSERVED_CONDITIONS>;

/// Turns snapshots and the thermal report into fault flags, keeping an event
/// history and a log of fault episodes along the way.
#[derive(Debug)]
pub struct FaultMonitor {
    snapshot_staleness_ms: u64,
    flags: FaultFlags,
    level: SafetyLevel,
    event_history: Vec<SafetyEventRecord, MAX_SAFETY_EVENTS>,
    fault_log: FaultLog,
    open_episodes: [Option<u32>; 3],
}

impl FaultMonitor {
    pub fn new(snapshot_staleness_ms: u64) -> Self {
        Self {
            snapshot_staleness_ms,
            flags: FaultFlags::default(),
            level: SafetyLevel::Normal,
            event_history: Vec::new(),
            fault_log: FaultLog::new(),
            open_episodes: [None; 3],
        }
    }

    /// Recompute the fault flags from the latest inputs.
    ///
    /// A subsystem is faulted when its driver reports a fault, when no good
    /// snapshot has arrived within the staleness window (by poll time or by
    /// the snapshot's own capture time), or when any of its temperature
    /// sensors is in `Fault`.
    pub fn assess(
        &mut self,
        now_ms: u64,
        battery: &Polled<BatterySnapshot>,
        motor: &Polled<MotorSnapshot>,
        charging: &Polled<ChargingSnapshot>,
        thermal: &ThermalReport,
    ) -> FaultFlags {
        let mut observed = Observed::new();
        let causes = [
            self.check(SubsystemId::Battery, battery, thermal, now_ms, &mut observed),
            self.check(SubsystemId::Motor, motor, thermal, now_ms, &mut observed),
            self.check(SubsystemId::Charging, charging, thermal, now_ms, &mut observed),
        ];

        self.resolve_cleared(&observed);
        for (subsystem, cause) in SubsystemId::ALL.into_iter().zip(causes) {
            self.track_episode(subsystem, cause, now_ms);
            self.flags.set(subsystem, cause.is_some());
        }
        self.update_level();

        self.flags
    }

    fn check<T: Snapshot>(
        &mut self,
        subsystem: SubsystemId,
        polled: &Polled<T>,
        thermal: &ThermalReport,
        now_ms: u64,
        observed: &mut Observed,
    ) -> Option<FaultCause> {
        let mut cause = None;

        if polled.snapshot().is_some_and(|s| s.reports_fault()) {
            self.observe(SafetyEvent::DriverFault, SafetyLevel::Critical, subsystem, now_ms, observed);
            cause.get_or_insert(FaultCause::Reported);
        }

        // A driver handing back a cached snapshot polls fine but stops aging.
        let frozen = polled
            .snapshot()
            .is_some_and(|s| now_ms.saturating_sub(s.captured_at_ms()) > self.snapshot_staleness_ms);

        if frozen || polled.is_expired(now_ms, self.snapshot_staleness_ms) {
            if polled.snapshot().is_some() {
                self.observe(SafetyEvent::SnapshotStale, SafetyLevel::Critical, subsystem, now_ms, observed);
                cause.get_or_insert(FaultCause::Stale);
            } else {
                self.observe(SafetyEvent::SnapshotMissing, SafetyLevel::Critical, subsystem, now_ms, observed);
                cause.get_or_insert(FaultCause::NoSnapshot);
            }
        } else if polled.stale {
            // Within the window the last snapshot is still trusted.
            self.observe(SafetyEvent::SnapshotStale, SafetyLevel::Caution, subsystem, now_ms, observed);
        }

        match thermal.status(subsystem) {
            TemperatureStatus::Fault => {
                self.observe(SafetyEvent::TemperatureFault, SafetyLevel::Critical, subsystem, now_ms, observed);
                cause.get_or_insert(FaultCause::Temperature);
            }
            TemperatureStatus::Warning => {
                self.observe(SafetyEvent::TemperatureWarning, SafetyLevel::Warning, subsystem, now_ms, observed);
            }
            TemperatureStatus::Normal => {}
        }

        cause
    }

    fn observe(
        &mut self,
        event: SafetyEvent,
        level: SafetyLevel,
        subsystem: SubsystemId,
        now_ms: u64,
        observed: &mut Observed,
    ) {
        self.record_event(event, now_ms, level, Some(subsystem));
        let _ = observed.push((event, subsystem));
    }

    fn resolve_cleared(&mut self, observed: &Observed) {
        for record in &mut self.event_history {
            if record.resolved || !record.event.is_condition() {
                continue;
            }
            let still_present = record
                .subsystem
                .is_some_and(|subsystem| observed.contains(&(record.event, subsystem)));
            if !still_present {
                record.resolved = true;
            }
        }
    }

    fn track_episode(&mut self, subsystem: SubsystemId, cause: Option<FaultCause>, now_ms: u64) {
        let slot = &mut self.open_episodes[subsystem.index()];
        match (cause, *slot) {
            (Some(cause), None) => {
                warn!("⚠️  {} fault raised: {:?}", subsystem.name(), cause);
                *slot = Some(self.fault_log.open(subsystem, cause, now_ms));
            }
            (None, Some(fault_id)) => {
                info!("✅ {} fault cleared", subsystem.name());
                self.fault_log.resolve(fault_id, now_ms);
                *slot = None;
            }
            _ => {}
        }
    }

    pub fn record_violation(&mut self, now_ms: u64, violation: InterlockViolation) {
        warn!("🚫 Interlock violation: {}", violation);
        self.record_event(SafetyEvent::InterlockViolation, now_ms, SafetyLevel::Caution, None);
        self.update_level();
    }

    pub fn record_escalation(&mut self, now_ms: u64) {
        self.record_event(SafetyEvent::InterlockEscalation, now_ms, SafetyLevel::Critical, None);
        self.update_level();
    }

    pub fn record_emergency(&mut self, now_ms: u64) {
        self.record_event(SafetyEvent::EmergencyStop, now_ms, SafetyLevel::Emergency, None);
        self.update_level();
    }

    /// Operator acknowledged the error state.
    pub fn acknowledge(&mut self) {
        self.resolve_where(|event| {
            matches!(event, SafetyEvent::InterlockViolation | SafetyEvent::InterlockEscalation)
        });
    }

    pub fn clear_emergency(&mut self) {
        self.resolve_where(|event| event == SafetyEvent::EmergencyStop);
    }

    fn resolve_where(&mut self, matches: impl Fn(SafetyEvent) -> bool) {
        for record in &mut self.event_history {
            if !record.resolved && matches(record.event) {
                record.resolved = true;
            }
        }
        self.update_level();
    }

    fn update_level(&mut self) {
        self.level = self
            .event_history
            .iter()
            .filter(|record| !record.resolved)
            .map(|record| record.level)
            .max()
            .unwrap_or(SafetyLevel::Normal);
    }

    fn record_event(&mut self, event: SafetyEvent, timestamp: u64, level: SafetyLevel, subsystem: Option<SubsystemId>) {
        if let Some(existing) = self
            .event_history
            .iter_mut()
            .find(|e| e.event == event && e.subsystem == subsystem && !e.resolved)
        {
            existing.timestamp = timestamp;
            existing.level = level;
            return;
        }

        if self.event_history.is_full() {
            self.event_history.remove(0);
        }

        let _ = self.event_history.push(SafetyEventRecord {
            event,
            timestamp,
            level,
            subsystem,
            resolved: false,
        });
    }

    pub fn level(&self) -> SafetyLevel {
        self.level
    }

    pub fn active_events(&self) -> usize {
        self.event_history.iter().filter(|e| !e.resolved).count()
    }

    pub fn event_history(&self) -> &[SafetyEventRecord] {
        &self.event_history
    }

    pub fn fault_log(&self) -> &FaultLog {
        &self.fault_log
    }
}

/// Sliding window of rejected commands. Reaching the threshold inside the
/// window escalates, after which the window starts empty.
#[derive(Debug)]
pub struct InterlockMonitor {
    window_ms: u64,
    threshold: usize,
    recent: Deque<u64, MAX_TRACKED_VIOLATIONS>,
    total: u32,
}

impl InterlockMonitor {
    pub fn new(window_ms: u64, threshold: usize) -> Self {
        // NASA Rule 5: Safety assertion for escalation threshold
        debug_assert!(
            threshold > 0 && threshold <= MAX_TRACKED_VIOLATIONS,
            "Escalation threshold {} outside 1..={}",
            threshold,
            MAX_TRACKED_VIOLATIONS
        );

        Self {
            window_ms,
            threshold: threshold.clamp(1, MAX_TRACKED_VIOLATIONS),
            recent: Deque::new(),
            total: 0,
        }
    }

    /// Record one violation; true when it escalates.
    pub fn record(&mut self, now_ms: u64) -> bool {
        self.prune(now_ms);
        if self.recent.is_full() {
            self.recent.pop_front();
        }
        let _ = self.recent.push_back(now_ms);
        self.total = self.total.saturating_add(1);

        if self.recent.len() >= self.threshold {
            self.recent.clear();
            true
        } else {
            false
        }
    }

    fn prune(&mut self, now_ms: u64) {
        while let Some(&oldest) = self.recent.front() {
            if now_ms.saturating_sub(oldest) > self.window_ms {
                self.recent.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn recent_count(&self) -> usize {
        self.recent.len()
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn clear(&mut self) {
        self.recent.clear();
    }
}
